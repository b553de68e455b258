// Copyright 2024 encode-offload Authors
// SPDX-License-Identifier: Apache-2.0

//! Shared-memory frame pools for encode offload
//!
//! This crate holds everything the guest task layer and the host encode
//! service have in common: the slot state machine stored inside the shared
//! memory region, the pool that maps and partitions that region, the frame
//! descriptor that travels over RPC instead of the payload, and the wire
//! protocol both sides speak.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────┐   descriptors (RPC)   ┌──────────────────────┐
//! │  Guest TaskManager   │ ◀───────────────────▶ │ Host encode service  │
//! └──────────────────────┘                       └──────────────────────┘
//!            │                                              │
//!            ▼                                              ▼
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                       Shared Memory Region                          │
//! │  slot 1: [state u32][payload ...]                                   │
//! │  slot 2: [state u32][payload ...]                                   │
//! │  ...                                                                │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`buffer`]: slot descriptor and the state word machine
//! - [`pool`]: memory-mapped pool of slots
//! - [`frame`]: frame descriptor bound to one slot
//! - [`protocol`]: wire messages for the control and data planes
//! - [`codec`]: length-prefixed message framing
//! - [`retry`]: polling retry policy with cooperative cancellation

pub mod buffer;
pub mod codec;
pub mod frame;
pub mod pool;
pub mod protocol;
pub mod retry;

pub use buffer::{BufferState, MemoryBuffer, STATE_WORD_SIZE};
pub use frame::FrameBufferData;
pub use pool::FrameMemoryPool;
pub use protocol::*;
pub use retry::RetryPolicy;

/// Result type for shared-memory and session operations.
pub type Result<T> = std::result::Result<T, MediaError>;

/// Error kinds shared by the guest and host sides.
///
/// Transport failures ([`MediaError::OperationFailed`], [`MediaError::Io`])
/// and negative acknowledgements ([`MediaError::InvalidState`]) are kept
/// apart so callers can retry the former and not the latter.
#[derive(Debug, thiserror::Error)]
pub enum MediaError {
    /// Null, malformed or out-of-range input.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Pool geometry or task configuration cannot be used.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A mapping, file or session could not be created.
    #[error("Resource unavailable: {0}")]
    ResourceUnavailable(String),

    /// Every slot of a pool is currently owned by someone.
    #[error("No idle buffer available")]
    ResourceExhausted,

    /// The RPC transport failed or the remote end could not process a call.
    #[error("Operation failed: {0}")]
    OperationFailed(String),

    /// Nothing is ready yet. Not a fault; poll again.
    #[error("Not enough data")]
    NotEnoughData,

    /// The remote peer refused the request, or a local object is in the
    /// wrong lifecycle state for the call.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// A retry policy ran out of attempts or hit its deadline.
    #[error("Timed out")]
    TimedOut,

    /// The terminate flag was raised while waiting.
    #[error("Cancelled")]
    Cancelled,

    /// An I/O error from the mapping or the socket.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl MediaError {
    /// True for the "poll again later" outcomes.
    pub fn is_not_ready(&self) -> bool {
        matches!(self, MediaError::NotEnoughData | MediaError::ResourceExhausted)
    }

    /// True when the failure came from the transport rather than the peer's
    /// decision, so a retry of the same request is reasonable.
    pub fn is_transport(&self) -> bool {
        matches!(self, MediaError::OperationFailed(_) | MediaError::Io(_))
    }
}

impl From<serde_json::Error> for MediaError {
    fn from(e: serde_json::Error) -> Self {
        MediaError::OperationFailed(format!("malformed message: {e}"))
    }
}
