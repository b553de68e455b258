// Copyright 2024 encode-offload Authors
// SPDX-License-Identifier: Apache-2.0

//! Guest task lifecycle
//!
//! A [`TaskManager`] owns one task's input and output pools and its two
//! sessions. Setup is driven through `&mut self`; once configured, the
//! producer and consumer threads share the manager by reference and use the
//! `&self` data path.
//!
//! ```text
//! Uninitialized -> Initialized -> Configured -> Running -> Stopped
//!   initialize()   set_init_params()  send_frame()   stop_task()
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{debug, info, warn};

use media_shm::{
    BufferState, FrameBufferData, FrameMemoryPool, MediaError, MediaParams, Result, ShareMemoryInfo,
    StreamType, TaskInfo,
};

use crate::config::TaskConfig;
use crate::data::{DataReceiver, DataSender};
use crate::session::{SessionFactory, TaskDataSession, TaskManagerSession};

/// Lifecycle state of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Nothing set up
    Uninitialized,
    /// Host task started, sessions open, pools not yet sized
    Initialized,
    /// Pools allocated and parameters accepted by the host
    Configured,
    /// At least one frame handed to the host
    Running,
    /// Stopped on the control plane
    Stopped,
}

/// Guest side of one encode task
pub struct TaskManager {
    config: TaskConfig,
    factory: Box<dyn SessionFactory>,
    /// Setup state; `Running` is derived from `running`
    state: TaskState,
    /// Task identity as amended by the host
    task_info: TaskInfo,
    /// Present once the host accepted `StartService`
    control: Option<Box<dyn TaskManagerSession>>,
    data: Option<Arc<dyn TaskDataSession>>,
    sender: Option<DataSender>,
    receiver: Option<DataReceiver>,
    in_pool: Option<FrameMemoryPool>,
    out_pool: Option<FrameMemoryPool>,
    /// Geometry stamped on claimed input buffers
    frame_size: (u32, u32),
    stream_type: StreamType,
    running: AtomicBool,
}

impl TaskManager {
    pub fn new(config: TaskConfig, factory: Box<dyn SessionFactory>) -> Self {
        let task_info = config.task_info();
        let stream_type = config.input_stream_type();
        Self {
            config,
            factory,
            state: TaskState::Uninitialized,
            task_info,
            control: None,
            data: None,
            sender: None,
            receiver: None,
            in_pool: None,
            out_pool: None,
            frame_size: (0, 0),
            stream_type,
            running: AtomicBool::new(false),
        }
    }

    /// Current lifecycle state
    pub fn state(&self) -> TaskState {
        if self.state == TaskState::Configured && self.running.load(Ordering::Acquire) {
            TaskState::Running
        } else {
            self.state
        }
    }

    /// Task identity, including the id assigned by the host
    pub fn task_info(&self) -> &TaskInfo {
        &self.task_info
    }

    pub fn config(&self) -> &TaskConfig {
        &self.config
    }

    /// Frames handed to the host so far
    pub fn sent_frames(&self) -> u64 {
        self.sender.as_ref().map_or(0, DataSender::sent)
    }

    /// Output frames received so far
    pub fn received_frames(&self) -> u64 {
        self.receiver.as_ref().map_or(0, DataReceiver::received)
    }

    /// Start the task on the host and open the data session
    pub fn initialize(&mut self) -> Result<()> {
        self.expect_state("initialize", TaskState::Uninitialized)?;

        let control = self.factory.control_session()?;
        let requested = self.config.task_info();
        let started = control.start_task(&requested)?;
        if started.task_id != requested.task_id || started.device_id != requested.device_id {
            debug!(
                "Host amended task {}: id {} -> {}, device {} -> {}",
                self.config.name,
                requested.task_id,
                started.task_id,
                requested.device_id,
                started.device_id
            );
        }
        self.task_info = started;
        self.control = Some(control);

        let data = self.factory.data_session(&self.task_info)?;
        self.sender = Some(DataSender::new(data.clone()));
        self.receiver = Some(DataReceiver::new(data.clone()));
        self.data = Some(data);

        self.state = TaskState::Initialized;
        info!(
            "Task {} started as host task {} on device {}",
            self.config.name, self.task_info.task_id, self.task_info.device_id
        );
        Ok(())
    }

    /// Allocate both pools and send the parameters to the host
    pub fn set_init_params(&mut self, params: &MediaParams) -> Result<()> {
        self.expect_state("set_init_params", TaskState::Initialized)?;

        let shm = &params.share_memory_info;
        shm.validate()?;
        self.in_pool = Some(allocate_pool(shm, &shm.in_mem_dev_path, shm.in_slot_number)?);
        self.out_pool = Some(allocate_pool(shm, &shm.out_mem_dev_path, shm.out_slot_number)?);

        self.data_session()?.set_init_params(params)?;

        self.frame_size = (
            params.encode_params.frame_width,
            params.encode_params.frame_height,
        );
        self.state = TaskState::Configured;
        info!(
            "Task {} configured: {} x {} byte slots, {}x{}",
            self.config.name, shm.buffer_num, shm.buffer_size, self.frame_size.0, self.frame_size.1
        );
        Ok(())
    }

    /// Claim an idle input slot stamped with the task's geometry
    ///
    /// The pts is 0; producers set their own before sending.
    pub fn get_one_input_buffer(&self) -> Result<FrameBufferData> {
        self.expect_configured("get_one_input_buffer")?;
        let mut data = self.in_pool()?.get_buffer()?;
        data.width = self.frame_size.0;
        data.height = self.frame_size.1;
        data.stream_type = self.stream_type;
        data.pts = 0;
        Ok(data)
    }

    /// Writable payload of a claimed input slot
    pub fn input_payload_mut<'a>(&'a self, data: &'a mut FrameBufferData) -> Result<&'a mut [u8]> {
        self.in_pool()?.payload_mut(data)
    }

    /// Copy `bytes` into a claimed input slot
    pub fn write_input(&self, data: &mut FrameBufferData, bytes: &[u8]) -> Result<()> {
        self.in_pool()?.write_payload(data, bytes)
    }

    /// Give up a claimed input slot without sending it
    pub fn release_one_input_buffer(&self, data: FrameBufferData) -> Result<()> {
        self.in_pool()?.release_buffer(data)
    }

    /// Hand an input frame to the host
    ///
    /// A slot still in `WRITING` is committed first with the descriptor's
    /// occupied size. If the host refuses the frame the slot is reclaimed;
    /// on a transport failure it stays `FULL` since the host may own it.
    pub fn send_frame(&self, mut data: FrameBufferData) -> Result<()> {
        self.expect_configured("send_frame")?;
        let pool = self.in_pool()?;
        let sender = self
            .sender
            .as_ref()
            .ok_or_else(|| MediaError::InvalidState("no data session".to_string()))?;

        if pool.buffer_state(data.buf_id())? == BufferState::Writing {
            let occupied = data.occupied_size();
            pool.commit_buffer(&mut data, occupied)?;
        }

        match sender.send(&data) {
            Ok(()) => {
                self.running.store(true, Ordering::Release);
                Ok(())
            }
            Err(e @ MediaError::InvalidState(_)) => {
                warn!(
                    "Task {}: host refused buffer {}: {e}",
                    self.config.name,
                    data.buf_id()
                );
                let id = data.buf_id();
                if let Err(release) = pool.release_buffer(data) {
                    warn!("Task {}: cannot reclaim buffer {id}: {release}", self.config.name);
                }
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Pull the next encoded frame, resolved against the local output pool
    ///
    /// Returns [`MediaError::NotEnoughData`] when nothing is ready.
    pub fn receive_frame(&self) -> Result<FrameBufferData> {
        self.expect_configured("receive_frame")?;
        let receiver = self
            .receiver
            .as_ref()
            .ok_or_else(|| MediaError::InvalidState("no data session".to_string()))?;
        let info = receiver.receive()?;
        self.out_pool()?.resolve(&info)
    }

    /// Output slot `id` as currently held by the local pool
    pub fn get_buffer_from_id(&self, id: u32) -> Result<FrameBufferData> {
        self.out_pool()?.get_buffer_from_id(id)
    }

    /// Encoded bytes of a received frame
    pub fn output_payload<'a>(&'a self, data: &'a FrameBufferData) -> Result<&'a [u8]> {
        self.out_pool()?.payload(data)
    }

    /// Return a consumed output slot to the host
    pub fn release_one_output_buffer(&self, data: FrameBufferData) -> Result<()> {
        self.out_pool()?.release_buffer(data)
    }

    /// Stop the task on the host
    pub fn stop_task(&mut self) -> Result<()> {
        let control = self.started("stop_task")?;
        control.stop_task(&self.task_info)?;
        self.running.store(false, Ordering::Release);
        self.state = TaskState::Stopped;
        info!("Task {} stopped", self.config.name);
        Ok(())
    }

    /// Reset the task's host queues, keeping the pools
    pub fn reset_task(&mut self) -> Result<()> {
        let control = self.started("reset_task")?;
        control.reset_task(&self.task_info)?;
        self.running.store(false, Ordering::Release);
        info!("Task {} reset", self.config.name);
        Ok(())
    }

    /// Tear down sessions and pools
    ///
    /// Stops the host task first if it was started and not yet stopped.
    /// Safe after a partial setup and safe to call twice.
    pub fn destroy(&mut self) {
        if let Some(control) = self.control.take() {
            if self.state != TaskState::Stopped {
                if let Err(e) = control.stop_task(&self.task_info) {
                    warn!("Task {}: stop during teardown failed: {e}", self.config.name);
                }
            }
        }
        self.sender = None;
        self.receiver = None;
        self.data = None;
        if let Some(mut pool) = self.in_pool.take() {
            pool.destroy_buffer_pool();
        }
        if let Some(mut pool) = self.out_pool.take() {
            pool.destroy_buffer_pool();
        }
        if self.state != TaskState::Uninitialized {
            debug!("Task {} destroyed", self.config.name);
        }
        self.running.store(false, Ordering::Release);
        self.state = TaskState::Uninitialized;
    }

    fn expect_state(&self, call: &str, expected: TaskState) -> Result<()> {
        if self.state == expected {
            Ok(())
        } else {
            Err(MediaError::InvalidState(format!(
                "{call} in state {:?}",
                self.state()
            )))
        }
    }

    fn expect_configured(&self, call: &str) -> Result<()> {
        self.expect_state(call, TaskState::Configured)
    }

    fn started(&self, call: &str) -> Result<&dyn TaskManagerSession> {
        match (&self.control, self.state) {
            (Some(control), TaskState::Initialized | TaskState::Configured) => Ok(control.as_ref()),
            _ => Err(MediaError::InvalidState(format!(
                "{call} in state {:?}",
                self.state()
            ))),
        }
    }

    fn data_session(&self) -> Result<&dyn TaskDataSession> {
        self.data
            .as_deref()
            .ok_or_else(|| MediaError::InvalidState("no data session".to_string()))
    }

    fn in_pool(&self) -> Result<&FrameMemoryPool> {
        self.in_pool
            .as_ref()
            .ok_or_else(|| MediaError::InvalidState("input pool not allocated".to_string()))
    }

    fn out_pool(&self) -> Result<&FrameMemoryPool> {
        self.out_pool
            .as_ref()
            .ok_or_else(|| MediaError::InvalidState("output pool not allocated".to_string()))
    }
}

impl Drop for TaskManager {
    fn drop(&mut self) {
        self.destroy();
    }
}

fn allocate_pool(shm: &ShareMemoryInfo, path: &str, slot_number: u32) -> Result<FrameMemoryPool> {
    let mut pool = FrameMemoryPool::new(path);
    pool.init_buffer_pool(shm.buffer_num, shm.buffer_size, slot_number)?;
    pool.allocate_buffer_pool()?;
    Ok(pool)
}
