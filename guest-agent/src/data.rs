// Copyright 2024 encode-offload Authors
// SPDX-License-Identifier: Apache-2.0

//! Send and receive adapters over a data session

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::{debug, trace};

use media_shm::{BufferInfo, FrameBufferData, MediaError, Result};

use crate::session::TaskDataSession;

/// Sending side of a task's data plane
pub struct DataSender {
    session: Arc<dyn TaskDataSession>,
    sent: AtomicU64,
}

impl DataSender {
    pub fn new(session: Arc<dyn TaskDataSession>) -> Self {
        Self {
            session,
            sent: AtomicU64::new(0),
        }
    }

    /// Hand one committed input frame to the host
    pub fn send(&self, frame: &FrameBufferData) -> Result<()> {
        self.session.send_frame(frame)?;
        let sent = self.sent.fetch_add(1, Ordering::AcqRel) + 1;
        debug!(
            "Sent buffer {} pts {} ({} bytes), {} frames so far",
            frame.buf_id(),
            frame.pts,
            frame.occupied_size(),
            sent
        );
        Ok(())
    }

    /// Frames sent so far
    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Acquire)
    }
}

/// Receiving side of a task's data plane
pub struct DataReceiver {
    session: Arc<dyn TaskDataSession>,
    received: AtomicU64,
    empty_polls: AtomicU64,
}

impl DataReceiver {
    pub fn new(session: Arc<dyn TaskDataSession>) -> Self {
        Self {
            session,
            received: AtomicU64::new(0),
            empty_polls: AtomicU64::new(0),
        }
    }

    /// Poll for the next output descriptor
    ///
    /// [`MediaError::NotEnoughData`] is passed through untouched and counted,
    /// never logged as a failure.
    pub fn receive(&self) -> Result<BufferInfo> {
        match self.session.receive_frame() {
            Ok(info) => {
                self.received.fetch_add(1, Ordering::AcqRel);
                debug!("Received buffer {} pts {}", info.buffer.buf_id, info.pts);
                Ok(info)
            }
            Err(MediaError::NotEnoughData) => {
                self.empty_polls.fetch_add(1, Ordering::Relaxed);
                trace!("No output ready");
                Err(MediaError::NotEnoughData)
            }
            Err(e) => Err(e),
        }
    }

    /// Frames received so far
    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Acquire)
    }

    /// Polls that found nothing ready
    pub fn empty_polls(&self) -> u64 {
        self.empty_polls.load(Ordering::Relaxed)
    }
}
