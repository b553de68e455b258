// Copyright 2024 encode-offload Authors
// SPDX-License-Identifier: Apache-2.0

//! Frame descriptor bound to one pool slot

use crate::buffer::MemoryBuffer;
use crate::protocol::{BufferInfo, StreamType};
use crate::{MediaError, Result};

/// Metadata of one frame plus the slot holding its payload
///
/// Holds no pointer into the mapping; the pool resolves the slot by id.
/// Dropping a descriptor does not free its slot: hand it back to the pool
/// with `release_buffer`.
///
/// The descriptor returned by `get_buffer` also carries the slot's write
/// claim. Clones and descriptors rebuilt from an id or a `BufferInfo` never
/// do, so they cannot write, commit or abandon the slot.
#[derive(Debug)]
pub struct FrameBufferData {
    /// Frame width in pixels
    pub width: u32,
    /// Frame height in pixels
    pub height: u32,
    /// Payload kind
    pub stream_type: StreamType,
    /// Presentation timestamp
    pub pts: u64,
    /// Last frame of the stream
    pub is_eos: bool,
    buffer: MemoryBuffer,
    /// Write claim from `get_buffer`, 0 when none
    claim: u64,
}

impl FrameBufferData {
    /// Wrap a slot with empty metadata
    pub fn new(buffer: MemoryBuffer) -> Self {
        FrameBufferData {
            width: 0,
            height: 0,
            stream_type: StreamType::Unknown,
            pts: 0,
            is_eos: false,
            buffer,
            claim: 0,
        }
    }

    /// Slot descriptor
    pub fn buffer(&self) -> &MemoryBuffer {
        &self.buffer
    }

    pub(crate) fn buffer_mut(&mut self) -> &mut MemoryBuffer {
        &mut self.buffer
    }

    pub(crate) fn claim(&self) -> u64 {
        self.claim
    }

    pub(crate) fn set_claim(&mut self, claim: u64) {
        self.claim = claim;
    }

    /// Whether this descriptor holds the write claim of its slot
    pub fn is_claimed(&self) -> bool {
        self.claim != 0
    }

    /// 1-based slot id
    pub fn buf_id(&self) -> u32 {
        self.buffer.buf_id
    }

    /// Payload bytes in use
    pub fn occupied_size(&self) -> u32 {
        self.buffer.occupied_size
    }

    /// Record how many payload bytes the producer wrote
    pub fn set_occupied_size(&mut self, occupied: u32) -> Result<()> {
        self.buffer.set_occupied_size(occupied)
    }

    /// Copy the frame metadata of `info` onto this descriptor
    pub fn apply_info(&mut self, info: &BufferInfo) -> Result<()> {
        if info.buffer.buf_id != self.buffer.buf_id {
            return Err(MediaError::InvalidArgument(format!(
                "descriptor for buffer {} applied to buffer {}",
                info.buffer.buf_id, self.buffer.buf_id
            )));
        }
        self.buffer.set_occupied_size(info.buffer.occupied_buf_size)?;
        self.width = info.width;
        self.height = info.height;
        self.stream_type = info.stream_type;
        self.pts = info.pts;
        self.is_eos = info.is_eos;
        Ok(())
    }

    /// Wire form of this descriptor
    pub fn to_info(&self) -> BufferInfo {
        BufferInfo {
            width: self.width,
            height: self.height,
            stream_type: self.stream_type,
            pts: self.pts,
            is_eos: self.is_eos,
            buffer: self.buffer.to_info(),
        }
    }
}

impl TryFrom<&BufferInfo> for FrameBufferData {
    type Error = MediaError;

    fn try_from(info: &BufferInfo) -> Result<Self> {
        let buffer = MemoryBuffer::try_from(&info.buffer)?;
        Ok(FrameBufferData {
            width: info.width,
            height: info.height,
            stream_type: info.stream_type,
            pts: info.pts,
            is_eos: info.is_eos,
            buffer,
            claim: 0,
        })
    }
}

impl Clone for FrameBufferData {
    /// Copies the metadata; the write claim stays with the original
    fn clone(&self) -> Self {
        FrameBufferData {
            width: self.width,
            height: self.height,
            stream_type: self.stream_type,
            pts: self.pts,
            is_eos: self.is_eos,
            buffer: self.buffer,
            claim: 0,
        }
    }
}

impl PartialEq for FrameBufferData {
    fn eq(&self, other: &Self) -> bool {
        self.width == other.width
            && self.height == other.height
            && self.stream_type == other.stream_type
            && self.pts == other.pts
            && self.is_eos == other.is_eos
            && self.buffer == other.buffer
    }
}

impl Eq for FrameBufferData {}
