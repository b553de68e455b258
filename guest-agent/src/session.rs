// Copyright 2024 encode-offload Authors
// SPDX-License-Identifier: Apache-2.0

//! Session interfaces
//!
//! The task manager talks to the host through two capability traits, one
//! per plane. Concrete transports are chosen at task setup through a
//! [`SessionFactory`], which keeps pool and task logic independent of the
//! RPC mechanism.

use std::sync::Arc;

use media_shm::{BufferInfo, FrameBufferData, MediaParams, Result, TaskInfo, TaskStatus};

/// Data plane: frame descriptors between guest and host.
///
/// # Errors
///
/// Implementations report transport failures as
/// [`MediaError::OperationFailed`](media_shm::MediaError::OperationFailed) or
/// [`MediaError::Io`](media_shm::MediaError::Io), and a refused request as
/// [`MediaError::InvalidState`](media_shm::MediaError::InvalidState).
pub trait TaskDataSession: Send + Sync {
    /// Send pool geometry and encoder settings to the host.
    fn set_init_params(&self, params: &MediaParams) -> Result<TaskStatus>;

    /// Hand a filled input slot to the host.
    fn send_frame(&self, data: &FrameBufferData) -> Result<TaskStatus>;

    /// Pull the next completed output descriptor.
    ///
    /// Returns [`MediaError::NotEnoughData`](media_shm::MediaError::NotEnoughData)
    /// when the host has nothing ready; callers poll.
    fn receive_frame(&self) -> Result<BufferInfo>;
}

/// Control plane: task lifecycle.
pub trait TaskManagerSession: Send + Sync {
    /// Request a task; the reply may carry a different task id or device.
    fn start_task(&self, info: &TaskInfo) -> Result<TaskInfo>;

    /// Stop a running task.
    fn stop_task(&self, info: &TaskInfo) -> Result<TaskStatus>;

    /// Reset a task's host-side queues.
    fn reset_task(&self, info: &TaskInfo) -> Result<TaskStatus>;
}

/// Creates the sessions of one task.
pub trait SessionFactory: Send + Sync {
    /// Open the control-plane session.
    fn control_session(&self) -> Result<Box<dyn TaskManagerSession>>;

    /// Open the data-plane session for a started task.
    fn data_session(&self, task: &TaskInfo) -> Result<Arc<dyn TaskDataSession>>;
}
