// Copyright 2024 encode-offload Authors
// SPDX-License-Identifier: Apache-2.0

//! Memory-mapped frame pool
//!
//! A pool maps one sub-region of a shared-memory device file and splits it
//! into `buffer_num` slots of `buffer_size` bytes. Slots are handed out by
//! scanning their state words lowest id first; there is no free list, so a
//! pool can be inspected by a process other than the one that last changed
//! it.
//!
//! Memory layout of sub-pool `n`:
//! ```text
//! device offset n * buffer_num * buffer_size
//! +-------------+----------------------------+
//! | state (u32) | payload (buffer_size - 4)  |  slot 1
//! +-------------+----------------------------+
//! | state (u32) | payload (buffer_size - 4)  |  slot 2
//! +-------------+----------------------------+
//! | ...                                      |
//! ```

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use log::{debug, info};
use memmap2::{MmapMut, MmapOptions};

use crate::buffer::{BufferState, MemoryBuffer, StateWord, STATE_WORD_SIZE};
use crate::frame::FrameBufferData;
use crate::protocol::BufferInfo;
use crate::{MediaError, Result};

/// Source of write claims, unique across every pool of the process
static NEXT_CLAIM: AtomicU64 = AtomicU64::new(1);

/// Process-local bookkeeping of one slot
#[derive(Default)]
struct LocalSlot {
    /// Payload length last recorded by this process
    occupied: AtomicU32,
    /// Write claim of the descriptor allowed to fill the slot, 0 when none
    claim: AtomicU64,
}

/// Live mapping of a pool
struct PoolMapping {
    /// Memory mapped device, from offset 0 to the end of this pool
    mmap: MmapMut,
    /// First byte of this pool inside `mmap`
    base: *mut u8,
    /// Bytes covered by this pool
    len: usize,
    slots: Vec<LocalSlot>,
}

// SAFETY: `base` points into `mmap`, which lives as long as the struct.
// State words are only touched atomically and payload access is gated by
// the slot's write claim, so the mapping can be shared between threads.
unsafe impl Send for PoolMapping {}
// SAFETY: see above.
unsafe impl Sync for PoolMapping {}

/// Byte range `(start, end)` of sub-pool `slot_number` inside the device
fn pool_span(buffer_num: u32, buffer_size: u32, slot_number: u32) -> Result<(u64, u64)> {
    let pool_len = buffer_num as u64 * buffer_size as u64;
    (slot_number as u64)
        .checked_mul(pool_len)
        .and_then(|start| start.checked_add(pool_len).map(|end| (start, end)))
        .ok_or_else(|| {
            MediaError::InvalidConfig(format!(
                "sub-pool {slot_number} of {buffer_num} x {buffer_size} bytes overflows the device offset"
            ))
        })
}

/// Pool of fixed-size frame slots inside a shared-memory file
pub struct FrameMemoryPool {
    /// Backing device or file
    path: PathBuf,
    /// Slot count
    buffer_num: u32,
    /// Slot size, state word included
    buffer_size: u32,
    /// Sub-pool index inside the device
    slot_number: u32,
    /// Present between allocate/attach and destroy
    mapping: Option<PoolMapping>,
}

impl FrameMemoryPool {
    /// Create an unconfigured pool backed by `path`
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            buffer_num: 0,
            buffer_size: 0,
            slot_number: 0,
            mapping: None,
        }
    }

    /// Record the pool geometry
    pub fn init_buffer_pool(&mut self, buffer_num: u32, buffer_size: u32, slot_number: u32) -> Result<()> {
        if self.mapping.is_some() {
            return Err(MediaError::InvalidState(
                "pool geometry cannot change while mapped".to_string(),
            ));
        }
        if buffer_num == 0 || buffer_size == 0 {
            return Err(MediaError::InvalidConfig(format!(
                "buffer_num {buffer_num} and buffer_size {buffer_size} must be non-zero"
            )));
        }
        if buffer_size <= STATE_WORD_SIZE || buffer_size % STATE_WORD_SIZE != 0 {
            return Err(MediaError::InvalidConfig(format!(
                "buffer_size {buffer_size} must be a multiple of {STATE_WORD_SIZE} larger than the state word"
            )));
        }
        pool_span(buffer_num, buffer_size, slot_number)?;

        self.buffer_num = buffer_num;
        self.buffer_size = buffer_size;
        self.slot_number = slot_number;
        Ok(())
    }

    /// Create or open the backing file, map it and mark every slot `IDLE`
    pub fn allocate_buffer_pool(&mut self) -> Result<()> {
        self.map(true)?;
        for id in 1..=self.buffer_num {
            self.state_word(&MemoryBuffer::new(id, self.buffer_size))?.reset();
        }
        info!(
            "Allocated pool {} slot {}: {} x {} bytes",
            self.path.display(),
            self.slot_number,
            self.buffer_num,
            self.buffer_size
        );
        Ok(())
    }

    /// Map an already initialised region without touching its state words
    pub fn attach_buffer_pool(&mut self) -> Result<()> {
        self.map(false)?;
        info!(
            "Attached pool {} slot {}: {} x {} bytes",
            self.path.display(),
            self.slot_number,
            self.buffer_num,
            self.buffer_size
        );
        Ok(())
    }

    fn map(&mut self, create: bool) -> Result<()> {
        if self.buffer_num == 0 {
            return Err(MediaError::InvalidState("pool geometry not set".to_string()));
        }
        if self.mapping.is_some() {
            return Err(MediaError::InvalidState("pool already mapped".to_string()));
        }

        let (start, end) = pool_span(self.buffer_num, self.buffer_size, self.slot_number)?;
        let len = usize::try_from(end)
            .map_err(|_| MediaError::InvalidConfig(format!("pool end {end} exceeds address space")))?;

        let unavailable = |what: &str, e: std::io::Error| {
            MediaError::ResourceUnavailable(format!("{what} {}: {e}", self.path.display()))
        };

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(create)
            .truncate(false)
            .open(&self.path)
            .map_err(|e| unavailable("open", e))?;

        let file_len = file.metadata().map_err(|e| unavailable("stat", e))?.len();
        if file_len < end {
            if !create {
                return Err(MediaError::ResourceUnavailable(format!(
                    "{} holds {file_len} bytes, pool needs {end}",
                    self.path.display()
                )));
            }
            file.set_len(end).map_err(|e| unavailable("resize", e))?;
        }

        // SAFETY: the file stays mapped as long as `mmap` lives. Other processes
        // may write to it concurrently; all shared state is accessed atomically.
        let mut mmap = unsafe { MmapOptions::new().len(len).map_mut(&file) }
            .map_err(|e| unavailable("mmap", e))?;
        // SAFETY: `start < end == mmap.len()`, and `end` fits `usize`.
        let base = unsafe { mmap.as_mut_ptr().add(start as usize) };

        self.mapping = Some(PoolMapping {
            mmap,
            base,
            len: (end - start) as usize,
            slots: (0..self.buffer_num).map(|_| LocalSlot::default()).collect(),
        });
        Ok(())
    }

    /// Unmap the pool; calling it again is a no-op
    pub fn destroy_buffer_pool(&mut self) {
        if let Some(mapping) = self.mapping.take() {
            if let Err(e) = mapping.mmap.flush() {
                debug!("Flush of {} failed: {}", self.path.display(), e);
            }
            info!("Destroyed pool {} slot {}", self.path.display(), self.slot_number);
        }
    }

    /// Whether the pool is currently mapped
    pub fn is_allocated(&self) -> bool {
        self.mapping.is_some()
    }

    /// Backing file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Slot count
    pub fn buffer_num(&self) -> u32 {
        self.buffer_num
    }

    /// Slot size, state word included
    pub fn buffer_size(&self) -> u32 {
        self.buffer_size
    }

    /// Sub-pool index inside the device
    pub fn slot_number(&self) -> u32 {
        self.slot_number
    }

    fn mapping(&self) -> Result<&PoolMapping> {
        self.mapping
            .as_ref()
            .ok_or_else(|| MediaError::InvalidState(format!("pool {} not mapped", self.path.display())))
    }

    fn descriptor(&self, id: u32) -> Result<MemoryBuffer> {
        if id == 0 || id > self.buffer_num {
            return Err(MediaError::InvalidArgument(format!(
                "buffer id {id} outside 1..={}",
                self.buffer_num
            )));
        }
        Ok(MemoryBuffer::new(id, self.buffer_size))
    }

    fn state_word(&self, buffer: &MemoryBuffer) -> Result<StateWord<'_>> {
        let mapping = self.mapping()?;
        debug_assert!((buffer.state_offset as usize) + STATE_WORD_SIZE as usize <= mapping.len);
        // SAFETY: `buffer` comes from `descriptor`, so the state word lies inside
        // the pool. The pool starts at a multiple of `buffer_size` from the
        // page-aligned mapping and `buffer_size` is a multiple of 4, so the word
        // is 4-byte aligned. The borrow of `self` keeps the mapping alive.
        Ok(unsafe { StateWord::from_ptr(mapping.base.add(buffer.state_offset as usize)) })
    }

    fn local(&self, buffer: &MemoryBuffer) -> Result<&LocalSlot> {
        self.mapping()?
            .slots
            .get(buffer.index())
            .ok_or_else(|| MediaError::InvalidArgument(format!("buffer id {} out of range", buffer.buf_id)))
    }

    /// Whether `data` carries the live write claim of its slot in this pool
    fn holds_claim(&self, data: &FrameBufferData) -> Result<bool> {
        let buffer = self.descriptor(data.buf_id())?;
        Ok(data.is_claimed() && self.local(&buffer)?.claim.load(Ordering::Acquire) == data.claim())
    }

    fn require_claim(&self, data: &FrameBufferData, call: &str) -> Result<()> {
        if self.holds_claim(data)? {
            return Ok(());
        }
        Err(MediaError::InvalidState(format!(
            "buffer {}: {call} needs the descriptor returned by get_buffer",
            data.buf_id()
        )))
    }

    /// Current state of slot `id`
    pub fn buffer_state(&self, id: u32) -> Result<BufferState> {
        let buffer = self.descriptor(id)?;
        Ok(self.state_word(&buffer)?.load())
    }

    /// Number of slots currently `IDLE`
    pub fn idle_count(&self) -> usize {
        (1..=self.buffer_num)
            .filter(|&id| matches!(self.buffer_state(id), Ok(BufferState::Idle)))
            .count()
    }

    /// Claim the lowest `IDLE` slot
    ///
    /// The slot moves to `WRITING` and the returned descriptor carries its
    /// write claim; the caller commits it to `FULL` once the payload is
    /// written, or releases it. Returns [`MediaError::ResourceExhausted`]
    /// when no slot is idle.
    pub fn get_buffer(&self) -> Result<FrameBufferData> {
        self.mapping()?;
        for id in 1..=self.buffer_num {
            let mut buffer = self.descriptor(id)?;
            if self
                .state_word(&buffer)?
                .transition(BufferState::Idle, BufferState::Writing)
                .is_ok()
            {
                let claim = NEXT_CLAIM.fetch_add(1, Ordering::Relaxed);
                let local = self.local(&buffer)?;
                local.occupied.store(0, Ordering::Relaxed);
                local.claim.store(claim, Ordering::Release);
                buffer.state = BufferState::Writing;
                let mut data = FrameBufferData::new(buffer);
                data.set_claim(claim);
                return Ok(data);
            }
        }
        Err(MediaError::ResourceExhausted)
    }

    /// Return a slot to `IDLE` and clear its payload length
    ///
    /// A `FULL` slot may be released through any descriptor of it; a
    /// `WRITING` slot only through the one holding its write claim.
    pub fn release_buffer(&self, data: FrameBufferData) -> Result<()> {
        let buffer = self.descriptor(data.buf_id())?;
        let local = self.local(&buffer)?;
        let word = self.state_word(&buffer)?;
        let claimed = self.holds_claim(&data)?;
        let released = if claimed {
            word.transition(BufferState::Writing, BufferState::Idle)
        } else {
            word.release()
        };
        released.map_err(|state| {
            MediaError::InvalidState(format!("buffer {} is {state:?}, cannot release", buffer.buf_id))
        })?;
        if claimed {
            local.claim.store(0, Ordering::Release);
        }
        local.occupied.store(0, Ordering::Relaxed);
        Ok(())
    }

    /// Look up slot `id` without checking or changing its state
    ///
    /// The descriptor carries no write claim.
    pub fn get_buffer_from_id(&self, id: u32) -> Result<FrameBufferData> {
        let mut buffer = self.descriptor(id)?;
        buffer.state = self.state_word(&buffer)?.load();
        buffer.occupied_size = self.local(&buffer)?.occupied.load(Ordering::Relaxed);
        Ok(FrameBufferData::new(buffer))
    }

    /// Resolve an inbound descriptor against this pool's own mapping
    ///
    /// Only the id, state and lengths travel over RPC; offsets and addresses
    /// always come from the local pool.
    pub fn resolve(&self, info: &BufferInfo) -> Result<FrameBufferData> {
        let mut frame = self.get_buffer_from_id(info.buffer.buf_id)?;
        frame.apply_info(info)?;
        self.local(frame.buffer())?
            .occupied
            .store(frame.occupied_size(), Ordering::Relaxed);
        Ok(frame)
    }

    /// Record `occupied` payload bytes and publish the slot as `FULL`
    ///
    /// Consumes the write claim of `data`.
    pub fn commit_buffer(&self, data: &mut FrameBufferData, occupied: u32) -> Result<()> {
        let buffer = self.descriptor(data.buf_id())?;
        self.require_claim(data, "commit")?;
        data.set_occupied_size(occupied)?;
        self.state_word(&buffer)?
            .transition(BufferState::Writing, BufferState::Full)
            .map_err(|state| {
                MediaError::InvalidState(format!("buffer {} is {state:?}, cannot commit", buffer.buf_id))
            })?;
        let local = self.local(&buffer)?;
        local.occupied.store(occupied, Ordering::Relaxed);
        local.claim.store(0, Ordering::Release);
        data.set_claim(0);
        data.buffer_mut().state = BufferState::Full;
        Ok(())
    }

    /// Writable payload of a slot claimed through `get_buffer`
    ///
    /// Only the descriptor holding the slot's write claim gets one; clones
    /// and looked-up descriptors are refused with
    /// [`MediaError::InvalidState`].
    pub fn payload_mut<'a>(&'a self, data: &'a mut FrameBufferData) -> Result<&'a mut [u8]> {
        let buffer = self.descriptor(data.buf_id())?;
        self.require_claim(data, "payload_mut")?;
        let state = self.state_word(&buffer)?.load();
        if state != BufferState::Writing {
            return Err(MediaError::InvalidState(format!(
                "buffer {} is {state:?}, not claimed for writing",
                buffer.buf_id
            )));
        }
        let mapping = self.mapping()?;
        // SAFETY: the payload range lies inside the pool. Exactly one
        // descriptor carries the slot's write claim, and it stays mutably
        // borrowed for `'a`, so no second writable view can exist and the
        // claim cannot be committed or abandoned while this one lives.
        Ok(unsafe {
            std::slice::from_raw_parts_mut(
                mapping.base.add(buffer.mem_offset as usize),
                buffer.size as usize,
            )
        })
    }

    /// Occupied payload bytes of a `FULL` slot
    pub fn payload<'a>(&'a self, data: &'a FrameBufferData) -> Result<&'a [u8]> {
        let buffer = self.descriptor(data.buf_id())?;
        let state = self.state_word(&buffer)?.load();
        if state != BufferState::Full {
            return Err(MediaError::InvalidState(format!(
                "buffer {} is {state:?}, not ready for reading",
                buffer.buf_id
            )));
        }
        let len = data.occupied_size().min(buffer.size) as usize;
        let mapping = self.mapping()?;
        // SAFETY: the range lies inside the pool and the slot is `FULL`, so the
        // producer no longer writes to it until the consumer releases it.
        Ok(unsafe { std::slice::from_raw_parts(mapping.base.add(buffer.mem_offset as usize), len) })
    }

    /// Copy `bytes` into a claimed slot and record the length
    pub fn write_payload(&self, data: &mut FrameBufferData, bytes: &[u8]) -> Result<()> {
        let len = u32::try_from(bytes.len())
            .map_err(|_| MediaError::InvalidArgument("payload too large".to_string()))?;
        let payload = self.payload_mut(data)?;
        if bytes.len() > payload.len() {
            return Err(MediaError::InvalidArgument(format!(
                "payload of {} bytes exceeds slot capacity {}",
                bytes.len(),
                payload.len()
            )));
        }
        payload[..bytes.len()].copy_from_slice(bytes);
        data.set_occupied_size(len)
    }
}

impl Drop for FrameMemoryPool {
    fn drop(&mut self) {
        self.destroy_buffer_pool();
    }
}
