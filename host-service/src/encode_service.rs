// Copyright 2024 encode-offload Authors
// SPDX-License-Identifier: Apache-2.0

//! Host encode service
//!
//! Holds the host's own mappings of one task's pools and the two FIFOs
//! between the RPC handlers and the encoder. Inbound descriptors are queued
//! on `input`; the encoder pops them, fills output slots and queues those on
//! `output` for the guest to pull.
//!
//! An input slot counts as held from the moment it is queued until the
//! encoder releases it, and a second descriptor for a held slot is refused.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::{debug, info, trace, warn};

use media_shm::{
    BufferInfo, BufferState, FrameBufferData, FrameMemoryPool, MediaError, Pts, Result,
    RetryPolicy, ShareMemoryInfo,
};

/// Inbound side of the data plane
#[derive(Default)]
struct InputQueue {
    /// Frames waiting for the encoder
    pending: VecDeque<FrameBufferData>,
    /// Slots queued or being encoded
    held: HashSet<u32>,
}

/// Host side of one task's data plane
pub struct HostEncodeService {
    task_id: u32,
    in_pool: FrameMemoryPool,
    out_pool: FrameMemoryPool,
    input: Mutex<InputQueue>,
    /// Encoded frames waiting for the guest
    output: Mutex<VecDeque<FrameBufferData>>,
    /// Wait policy for a free output slot
    retry: RetryPolicy,
    terminate: Arc<AtomicBool>,
}

impl HostEncodeService {
    /// Map both pools of a task that the guest already allocated
    pub fn attach(task_id: u32, shm: &ShareMemoryInfo, retry: RetryPolicy) -> Result<Self> {
        shm.validate()?;
        let in_pool = attach_pool(shm, &shm.in_mem_dev_path, shm.in_slot_number)?;
        let out_pool = attach_pool(shm, &shm.out_mem_dev_path, shm.out_slot_number)?;
        info!(
            "Task {task_id}: attached {} and {}",
            shm.in_mem_dev_path, shm.out_mem_dev_path
        );
        Ok(Self::with_pools(task_id, in_pool, out_pool, retry))
    }

    /// Build a service over pools that are already mapped
    pub fn with_pools(
        task_id: u32,
        in_pool: FrameMemoryPool,
        out_pool: FrameMemoryPool,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            task_id,
            in_pool,
            out_pool,
            input: Mutex::new(InputQueue::default()),
            output: Mutex::new(VecDeque::new()),
            retry,
            terminate: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn task_id(&self) -> u32 {
        self.task_id
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Queue an inbound frame; its slot must be `FULL` and not already held
    pub fn send_input_data(&self, info: &BufferInfo) -> Result<()> {
        let mut input = lock(&self.input);
        let id = info.buffer.buf_id;
        if input.held.contains(&id) {
            return Err(MediaError::InvalidState(format!(
                "input buffer {id} is already held by task {}",
                self.task_id
            )));
        }
        let frame = self.in_pool.resolve(info)?;
        if frame.buffer().state != BufferState::Full {
            return Err(MediaError::InvalidState(format!(
                "input buffer {id} is {:?}, expected Full",
                frame.buffer().state
            )));
        }
        trace!("Task {}: queued input {id} pts {}", self.task_id, frame.pts);
        input.held.insert(id);
        input.pending.push_back(frame);
        Ok(())
    }

    /// Pop the oldest inbound frame; its slot stays held until released
    pub fn take_input_data(&self) -> Result<FrameBufferData> {
        lock(&self.input).pending.pop_front().ok_or(MediaError::NotEnoughData)
    }

    /// Payload of an inbound frame
    pub fn input_payload<'a>(&'a self, data: &'a FrameBufferData) -> Result<&'a [u8]> {
        self.in_pool.payload(data)
    }

    /// Give a consumed input slot back to the guest
    pub fn release_input_buffer(&self, data: FrameBufferData) -> Result<()> {
        let mut input = lock(&self.input);
        let id = data.buf_id();
        let released = self.in_pool.release_buffer(data);
        input.held.remove(&id);
        released
    }

    /// Input slots queued or being encoded
    pub fn held_input(&self) -> usize {
        lock(&self.input).held.len()
    }

    /// Claim an idle output slot, scanning the pool once
    pub fn get_avail_buffer(&self) -> Result<FrameBufferData> {
        self.out_pool.get_buffer()
    }

    /// Claim an output slot, waiting per the service's retry policy
    ///
    /// Ends with [`MediaError::Cancelled`] once the service is terminated.
    pub fn get_available_output_buffer_frame(&self) -> Result<FrameBufferData> {
        self.retry
            .run(Some(&self.terminate), || self.get_avail_buffer())
    }

    /// Writable payload of a claimed output slot
    pub fn output_payload_mut<'a>(&'a self, data: &'a mut FrameBufferData) -> Result<&'a mut [u8]> {
        self.out_pool.payload_mut(data)
    }

    /// Copy `bytes` into a claimed output slot
    pub fn write_output(&self, data: &mut FrameBufferData, bytes: &[u8]) -> Result<()> {
        self.out_pool.write_payload(data, bytes)
    }

    /// Publish a claimed output slot as `FULL`
    pub fn commit_output(&self, data: &mut FrameBufferData, occupied: u32) -> Result<()> {
        self.out_pool.commit_buffer(data, occupied)
    }

    /// Give up a claimed output slot
    pub fn release_output_buffer(&self, data: FrameBufferData) -> Result<()> {
        self.out_pool.release_buffer(data)
    }

    /// Queue a committed output frame for the guest
    pub fn push_output_data(&self, data: FrameBufferData) -> Result<()> {
        let state = self.out_pool.buffer_state(data.buf_id())?;
        if state != BufferState::Full {
            return Err(MediaError::InvalidState(format!(
                "output buffer {} is {state:?}, commit it first",
                data.buf_id()
            )));
        }
        trace!("Task {}: queued output {} pts {}", self.task_id, data.buf_id(), data.pts);
        lock(&self.output).push_back(data);
        Ok(())
    }

    /// Put back an output frame whose delivery to the guest failed
    ///
    /// The frame goes to the front of the queue so the next pull sees it.
    pub fn requeue_output_data(&self, info: &BufferInfo) -> Result<()> {
        let frame = self.out_pool.resolve(info)?;
        if frame.buffer().state != BufferState::Full {
            return Err(MediaError::InvalidState(format!(
                "output buffer {} is {:?}, cannot requeue",
                frame.buf_id(),
                frame.buffer().state
            )));
        }
        let mut output = lock(&self.output);
        if output.iter().any(|queued| queued.buf_id() == frame.buf_id()) {
            return Err(MediaError::InvalidState(format!(
                "output buffer {} is already queued",
                frame.buf_id()
            )));
        }
        debug!("Task {}: requeued output {} pts {}", self.task_id, frame.buf_id(), frame.pts);
        output.push_front(frame);
        Ok(())
    }

    /// Pop the oldest encoded frame without waiting
    ///
    /// `pts` is the guest's receive cursor and only shows up in logs.
    pub fn receive_output_data(&self, pts: Pts) -> Result<FrameBufferData> {
        let frame = lock(&self.output).pop_front().ok_or(MediaError::NotEnoughData)?;
        trace!(
            "Task {}: cursor {} takes output {} pts {}",
            self.task_id,
            pts.pts,
            frame.buf_id(),
            frame.pts
        );
        Ok(frame)
    }

    /// Inbound frames waiting for the encoder
    pub fn queued_input(&self) -> usize {
        lock(&self.input).pending.len()
    }

    /// Encoded frames waiting for the guest
    pub fn queued_output(&self) -> usize {
        lock(&self.output).len()
    }

    /// Drop both queues, returning every queued slot to `IDLE`
    ///
    /// Every slot is attempted; the first failure is returned afterwards.
    /// A frame the encoder is working on stays held until it releases it.
    pub fn reset(&self) -> Result<()> {
        let mut first_error = None;
        let mut dropped = (0, 0);
        {
            let mut input = lock(&self.input);
            let pending: Vec<_> = input.pending.drain(..).collect();
            dropped.0 = pending.len();
            for frame in pending {
                let id = frame.buf_id();
                input.held.remove(&id);
                if let Err(e) = self.in_pool.release_buffer(frame) {
                    warn!("Task {}: cannot release input {id}: {e}", self.task_id);
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }
        let outputs: Vec<_> = lock(&self.output).drain(..).collect();
        dropped.1 = outputs.len();
        for frame in outputs {
            let id = frame.buf_id();
            if let Err(e) = self.out_pool.release_buffer(frame) {
                warn!("Task {}: cannot release output {id}: {e}", self.task_id);
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }
        debug!(
            "Task {}: reset dropped {} input and {} output frames",
            self.task_id, dropped.0, dropped.1
        );
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Stop every wait on this service
    pub fn terminate(&self) {
        self.terminate.store(true, Ordering::Release);
    }

    pub fn is_terminated(&self) -> bool {
        self.terminate.load(Ordering::Acquire)
    }

    /// Flag raised by [`HostEncodeService::terminate`]
    pub fn terminate_flag(&self) -> &AtomicBool {
        &self.terminate
    }
}

fn attach_pool(shm: &ShareMemoryInfo, path: &str, slot_number: u32) -> Result<FrameMemoryPool> {
    let mut pool = FrameMemoryPool::new(path);
    pool.init_buffer_pool(shm.buffer_num, shm.buffer_size, slot_number)?;
    pool.attach_buffer_pool()?;
    Ok(pool)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    /// Guest-side pools plus a service attached to the same files
    struct Fixture {
        _dir: tempfile::TempDir,
        shm: ShareMemoryInfo,
        guest_in: FrameMemoryPool,
        guest_out: FrameMemoryPool,
    }

    fn fixture(buffer_num: u32) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let shm = ShareMemoryInfo {
            total_memory_size: 0,
            buffer_num,
            buffer_size: 256,
            in_mem_dev_path: dir.path().join("in").display().to_string(),
            out_mem_dev_path: dir.path().join("out").display().to_string(),
            in_slot_number: 0,
            out_slot_number: 0,
        };
        let allocate = |path: &str| {
            let mut pool = FrameMemoryPool::new(path);
            pool.init_buffer_pool(shm.buffer_num, shm.buffer_size, 0).unwrap();
            pool.allocate_buffer_pool().unwrap();
            pool
        };
        let guest_in = allocate(&shm.in_mem_dev_path);
        let guest_out = allocate(&shm.out_mem_dev_path);
        Fixture {
            _dir: dir,
            shm,
            guest_in,
            guest_out,
        }
    }

    fn full_input(pool: &FrameMemoryPool, pts: u64) -> BufferInfo {
        let mut data = pool.get_buffer().unwrap();
        data.pts = pts;
        pool.write_payload(&mut data, &pts.to_le_bytes()).unwrap();
        pool.commit_buffer(&mut data, 8).unwrap();
        data.to_info()
    }

    #[test]
    fn test_attach_requires_allocated_pools() {
        let dir = tempfile::tempdir().unwrap();
        let shm = ShareMemoryInfo {
            buffer_num: 2,
            buffer_size: 64,
            in_mem_dev_path: dir.path().join("missing-in").display().to_string(),
            out_mem_dev_path: dir.path().join("missing-out").display().to_string(),
            ..Default::default()
        };
        assert!(matches!(
            HostEncodeService::attach(1, &shm, RetryPolicy::unbounded()),
            Err(MediaError::ResourceUnavailable(_))
        ));
    }

    #[test]
    fn test_input_queue_is_fifo() {
        let f = fixture(4);
        let service = HostEncodeService::attach(1, &f.shm, RetryPolicy::unbounded()).unwrap();

        for pts in [1, 2, 3] {
            service.send_input_data(&full_input(&f.guest_in, pts)).unwrap();
        }
        assert_eq!(service.queued_input(), 3);

        let mut seen = Vec::new();
        while let Ok(frame) = service.take_input_data() {
            assert_eq!(service.input_payload(&frame).unwrap(), &frame.pts.to_le_bytes());
            seen.push(frame.pts);
            service.release_input_buffer(frame).unwrap();
        }
        assert_eq!(seen, vec![1, 2, 3]);
        assert_eq!(f.guest_in.idle_count(), 4);
    }

    #[test]
    fn test_input_must_be_full() {
        let f = fixture(2);
        let service = HostEncodeService::attach(1, &f.shm, RetryPolicy::unbounded()).unwrap();

        let claimed = f.guest_in.get_buffer().unwrap();
        assert!(matches!(
            service.send_input_data(&claimed.to_info()),
            Err(MediaError::InvalidState(_))
        ));
        assert_eq!(service.queued_input(), 0);
    }

    #[test]
    fn test_held_input_slot_is_not_queued_twice() {
        let f = fixture(2);
        let service = HostEncodeService::attach(1, &f.shm, RetryPolicy::unbounded()).unwrap();

        let first = full_input(&f.guest_in, 1);
        service.send_input_data(&first).unwrap();
        assert!(matches!(
            service.send_input_data(&first),
            Err(MediaError::InvalidState(_))
        ));
        assert_eq!(service.queued_input(), 1);

        // Still held while the encoder works on it.
        let taken = service.take_input_data().unwrap();
        assert!(service.send_input_data(&first).is_err());
        assert_eq!(service.held_input(), 1);
        service.release_input_buffer(taken).unwrap();
        assert_eq!(service.held_input(), 0);

        // The guest reuses the slot for the next frame.
        let second = full_input(&f.guest_in, 2);
        assert_eq!(second.buffer.buf_id, first.buffer.buf_id);
        service.send_input_data(&second).unwrap();
        let queued = service.take_input_data().unwrap();
        assert_eq!(queued.pts, 2);
        assert_eq!(service.input_payload(&queued).unwrap(), &2u64.to_le_bytes());
    }

    #[test]
    fn test_requeued_output_is_delivered_next() {
        let f = fixture(4);
        let service = HostEncodeService::attach(1, &f.shm, RetryPolicy::unbounded()).unwrap();

        for pts in [10, 11] {
            let mut out = service.get_avail_buffer().unwrap();
            out.pts = pts;
            service.commit_output(&mut out, 0).unwrap();
            service.push_output_data(out).unwrap();
        }
        let lost = service.receive_output_data(Pts { pts: 0 }).unwrap().to_info();
        service.requeue_output_data(&lost).unwrap();
        assert!(matches!(
            service.requeue_output_data(&lost),
            Err(MediaError::InvalidState(_))
        ));

        let first = service.receive_output_data(Pts { pts: 0 }).unwrap();
        assert_eq!((first.buf_id(), first.pts), (lost.buffer.buf_id, 10));
        assert_eq!(service.receive_output_data(Pts { pts: 1 }).unwrap().pts, 11);
    }

    #[test]
    fn test_output_not_ready_until_pushed() {
        let f = fixture(2);
        let service = HostEncodeService::attach(1, &f.shm, RetryPolicy::unbounded()).unwrap();

        service.send_input_data(&full_input(&f.guest_in, 0)).unwrap();
        assert!(matches!(
            service.receive_output_data(Pts { pts: 0 }),
            Err(MediaError::NotEnoughData)
        ));

        let mut out = service.get_avail_buffer().unwrap();
        service.write_output(&mut out, b"enc").unwrap();
        assert!(matches!(
            service.push_output_data(out.clone()),
            Err(MediaError::InvalidState(_))
        ));
        service.commit_output(&mut out, 3).unwrap();
        service.push_output_data(out).unwrap();

        let frame = service.receive_output_data(Pts { pts: 0 }).unwrap();
        assert_eq!(frame.occupied_size(), 3);
        assert_eq!(f.guest_out.buffer_state(frame.buf_id()).unwrap(), BufferState::Full);
    }

    #[test]
    fn test_output_wait_unblocks_when_slot_freed() {
        let f = fixture(2);
        let service = HostEncodeService::attach(
            1,
            &f.shm,
            RetryPolicy::unbounded().with_backoff(Duration::from_millis(1)),
        )
        .unwrap();

        let mut held = Vec::new();
        for _ in 0..2 {
            let mut out = service.get_avail_buffer().unwrap();
            service.commit_output(&mut out, 0).unwrap();
            held.push(out);
        }
        assert!(matches!(service.get_avail_buffer(), Err(MediaError::ResourceExhausted)));

        let guest_out = &f.guest_out;
        let freed = held.pop().unwrap().buf_id();
        let frame = thread::scope(|s| {
            s.spawn(|| {
                thread::sleep(Duration::from_millis(20));
                let consumed = guest_out.get_buffer_from_id(freed).unwrap();
                guest_out.release_buffer(consumed).unwrap();
            });
            service.get_available_output_buffer_frame().unwrap()
        });
        assert_eq!(frame.buf_id(), freed);
    }

    #[test]
    fn test_terminate_cancels_output_wait() {
        let f = fixture(1);
        let service = HostEncodeService::attach(1, &f.shm, RetryPolicy::unbounded()).unwrap();
        let _held = service.get_avail_buffer().unwrap();

        thread::scope(|s| {
            s.spawn(|| {
                thread::sleep(Duration::from_millis(20));
                service.terminate();
            });
            assert!(matches!(
                service.get_available_output_buffer_frame(),
                Err(MediaError::Cancelled)
            ));
        });
        assert!(service.is_terminated());
    }

    #[test]
    fn test_bounded_wait_times_out() {
        let f = fixture(1);
        let service = HostEncodeService::attach(
            1,
            &f.shm,
            RetryPolicy::unbounded()
                .with_max_attempts(3)
                .with_backoff(Duration::ZERO),
        )
        .unwrap();
        let _held = service.get_avail_buffer().unwrap();
        assert!(matches!(
            service.get_available_output_buffer_frame(),
            Err(MediaError::TimedOut)
        ));
    }

    #[test]
    fn test_reset_returns_queued_slots() {
        let f = fixture(4);
        let service = HostEncodeService::attach(1, &f.shm, RetryPolicy::unbounded()).unwrap();

        service.send_input_data(&full_input(&f.guest_in, 0)).unwrap();
        service.send_input_data(&full_input(&f.guest_in, 1)).unwrap();
        let mut out = service.get_avail_buffer().unwrap();
        service.commit_output(&mut out, 0).unwrap();
        service.push_output_data(out).unwrap();

        service.reset().unwrap();
        assert_eq!(service.queued_input(), 0);
        assert_eq!(service.queued_output(), 0);
        assert_eq!(service.held_input(), 0);
        assert_eq!(f.guest_in.idle_count(), 4);
        assert_eq!(f.guest_out.idle_count(), 4);
    }

    #[test]
    fn test_reset_releases_remaining_slots_after_failure() {
        let f = fixture(4);
        let service = HostEncodeService::attach(1, &f.shm, RetryPolicy::unbounded()).unwrap();

        let stolen = full_input(&f.guest_in, 0);
        service.send_input_data(&stolen).unwrap();
        service.send_input_data(&full_input(&f.guest_in, 1)).unwrap();
        let mut out = service.get_avail_buffer().unwrap();
        service.commit_output(&mut out, 0).unwrap();
        service.push_output_data(out).unwrap();

        // The first queued slot is freed behind the host's back.
        let slot = f.guest_in.get_buffer_from_id(stolen.buffer.buf_id).unwrap();
        f.guest_in.release_buffer(slot).unwrap();

        assert!(matches!(service.reset(), Err(MediaError::InvalidState(_))));
        assert_eq!(service.queued_input(), 0);
        assert_eq!(service.queued_output(), 0);
        assert_eq!(service.held_input(), 0);
        assert_eq!(f.guest_in.idle_count(), 4);
        assert_eq!(f.guest_out.idle_count(), 4);
    }
}
