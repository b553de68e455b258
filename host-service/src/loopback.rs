// Copyright 2024 encode-offload Authors
// SPDX-License-Identifier: Apache-2.0

//! Loopback encoder
//!
//! Stands in for a hardware encoder: copies each input payload into an
//! output slot and tags it as encoded. Exercises the full slot handoff
//! without any codec.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use log::{debug, warn};

use media_shm::{FrameBufferData, MediaError, Result, RetryPolicy, StreamType};

use crate::encode_service::HostEncodeService;

/// Worker thread draining one service's input queue
pub struct LoopbackEncoder {
    service: Arc<HostEncodeService>,
    handle: Option<JoinHandle<()>>,
}

impl LoopbackEncoder {
    /// Start the worker for `service`
    pub fn spawn(service: Arc<HostEncodeService>) -> Result<Self> {
        let worker = service.clone();
        let handle = thread::Builder::new()
            .name(format!("loopback-{}", service.task_id()))
            .spawn(move || run(&worker))?;
        Ok(Self {
            service,
            handle: Some(handle),
        })
    }

    /// Encode one input frame into a fresh output slot
    ///
    /// The input slot is released whether or not an output slot could be
    /// filled.
    pub fn encode_one(service: &HostEncodeService, input: FrameBufferData) -> Result<()> {
        let mut output = match service.get_available_output_buffer_frame() {
            Ok(output) => output,
            Err(e) => {
                service.release_input_buffer(input)?;
                return Err(e);
            }
        };

        if let Err(e) = fill_output(service, &input, &mut output) {
            service.release_output_buffer(output)?;
            service.release_input_buffer(input)?;
            return Err(e);
        }
        service.push_output_data(output)?;
        service.release_input_buffer(input)
    }

    /// Terminate the service and wait for the worker
    pub fn stop(&mut self) {
        self.service.terminate();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("Loopback worker for task {} panicked", self.service.task_id());
            }
        }
    }
}

impl Drop for LoopbackEncoder {
    fn drop(&mut self) {
        self.stop();
    }
}

fn fill_output(
    service: &HostEncodeService,
    input: &FrameBufferData,
    output: &mut FrameBufferData,
) -> Result<()> {
    let len = {
        let src = service.input_payload(input)?;
        let dst = service.output_payload_mut(output)?;
        let len = src.len().min(dst.len());
        dst[..len].copy_from_slice(&src[..len]);
        len
    };
    output.width = input.width;
    output.height = input.height;
    output.stream_type = StreamType::Encoded;
    output.pts = input.pts;
    output.is_eos = input.is_eos;
    service.commit_output(output, len as u32)
}

fn run(service: &HostEncodeService) {
    let poll = RetryPolicy::unbounded().with_backoff(service.retry_policy().backoff());
    debug!("Loopback encoder for task {} started", service.task_id());

    loop {
        let input = match poll.run(Some(service.terminate_flag()), || service.take_input_data()) {
            Ok(input) => input,
            Err(MediaError::Cancelled) => break,
            Err(e) => {
                warn!("Loopback encoder for task {}: {e}", service.task_id());
                break;
            }
        };
        let pts = input.pts;
        match LoopbackEncoder::encode_one(service, input) {
            Ok(()) => {}
            Err(MediaError::Cancelled) => break,
            Err(e) => warn!("Task {}: dropped frame pts {pts}: {e}", service.task_id()),
        }
    }

    debug!("Loopback encoder for task {} stopped", service.task_id());
}
