// Copyright 2024 encode-offload Authors
// SPDX-License-Identifier: Apache-2.0

//! Guest Agent main implementation
//!
//! Runs each configured task node in turn: sets the task up, pushes a run of
//! synthetic frames through the host encoder and drains the encoded output.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{debug, error, info, warn};

use media_shm::{FrameBufferData, MediaError, Result};

use crate::config::{AgentConfig, TaskConfig};
use crate::rpc::RpcSessionFactory;
use crate::session::SessionFactory;
use crate::task_manager::TaskManager;

/// Outcome of one task node
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskReport {
    /// Task name from the configuration
    pub name: String,
    /// Task id assigned by the host
    pub task_id: u32,
    /// Input frames handed to the host
    pub sent: u64,
    /// Output frames received back
    pub received: u64,
    /// Output frames whose payload equals the input of the same pts
    pub echoed: u64,
}

/// Guest Agent
pub struct GuestAgent {
    /// Configuration
    config: AgentConfig,
    /// Raised to end the run early
    terminate: Arc<AtomicBool>,
}

impl GuestAgent {
    pub fn new(config: AgentConfig) -> Self {
        Self {
            config,
            terminate: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Flag that ends every wait once raised, e.g. from a signal handler
    pub fn terminate_flag(&self) -> Arc<AtomicBool> {
        self.terminate.clone()
    }

    /// Ask the running task to wind down
    pub fn stop(&self) {
        self.terminate.store(true, Ordering::Release);
    }

    /// Run every task node, logging failures and moving on
    pub fn run(&self) -> Vec<Result<TaskReport>> {
        let mut reports = Vec::with_capacity(self.config.tasks.len());
        for task in &self.config.tasks {
            if self.terminate.load(Ordering::Acquire) {
                warn!("Skipping task {}: agent is stopping", task.name);
                reports.push(Err(MediaError::Cancelled));
                continue;
            }
            let factory =
                RpcSessionFactory::new(self.config.host_addr.clone(), self.config.rpc_timeout());
            let outcome = self.run_task(task, Box::new(factory));
            match &outcome {
                Ok(report) => info!(
                    "Task {} done: {} sent, {} received, {} echoed",
                    report.name, report.sent, report.received, report.echoed
                ),
                Err(e) => error!("Task {} failed: {e}", task.name),
            }
            reports.push(outcome);
        }
        reports
    }

    /// Run one task node over the sessions of `factory`
    pub fn run_task(&self, task: &TaskConfig, factory: Box<dyn SessionFactory>) -> Result<TaskReport> {
        task.validate()?;
        let mut manager = TaskManager::new(task.clone(), factory);
        manager.initialize()?;
        manager.set_init_params(&task.media_params())?;

        let mut report = TaskReport {
            name: task.name.clone(),
            task_id: manager.task_info().task_id,
            ..Default::default()
        };
        let policy = self.config.receive_policy;
        let frame_len = frame_bytes(task);

        for pts in 0..u64::from(task.frames) {
            let mut data = policy.run(Some(&self.terminate), || {
                drain_output(&manager, &mut report)?;
                manager.get_one_input_buffer()
            })?;
            data.pts = pts;
            data.is_eos = pts + 1 == u64::from(task.frames);

            let len = {
                let payload = manager.input_payload_mut(&mut data)?;
                let len = payload.len().min(frame_len);
                fill_pattern(&mut payload[..len], pts);
                len
            };
            data.set_occupied_size(len as u32)?;
            manager.send_frame(data)?;
            report.sent += 1;
        }

        while report.received < report.sent {
            let frame = policy.run(Some(&self.terminate), || manager.receive_frame())?;
            consume(&manager, frame, &mut report)?;
        }

        manager.stop_task()?;
        Ok(report)
    }
}

/// Bytes of one raw NV12 frame of the task's geometry
fn frame_bytes(task: &TaskConfig) -> usize {
    task.encode.frame_width as usize * task.encode.frame_height as usize * 3 / 2
}

fn fill_pattern(payload: &mut [u8], pts: u64) {
    for (i, byte) in payload.iter_mut().enumerate() {
        *byte = (i as u64).wrapping_add(pts) as u8;
    }
}

fn matches_pattern(payload: &[u8], pts: u64) -> bool {
    payload
        .iter()
        .enumerate()
        .all(|(i, byte)| *byte == (i as u64).wrapping_add(pts) as u8)
}

/// Take every output frame that is ready, freeing its slot
fn drain_output(manager: &TaskManager, report: &mut TaskReport) -> Result<()> {
    loop {
        match manager.receive_frame() {
            Ok(frame) => consume(manager, frame, report)?,
            Err(MediaError::NotEnoughData) => return Ok(()),
            Err(e) => return Err(e),
        }
    }
}

fn consume(manager: &TaskManager, frame: FrameBufferData, report: &mut TaskReport) -> Result<()> {
    let payload = manager.output_payload(&frame)?;
    if !payload.is_empty() && matches_pattern(payload, frame.pts) {
        report.echoed += 1;
    }
    debug!(
        "Output pts {} ({} bytes{})",
        frame.pts,
        payload.len(),
        if frame.is_eos { ", eos" } else { "" }
    );
    report.received += 1;
    manager.release_one_output_buffer(frame)
}
