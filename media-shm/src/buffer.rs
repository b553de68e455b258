// Copyright 2024 encode-offload Authors
// SPDX-License-Identifier: Apache-2.0

//! Slot descriptors and the state word machine
//!
//! Every slot of a pool starts with a 4-byte state word. Whoever holds the
//! mapping can read it without an RPC round trip, and the value alone
//! decides who may touch the payload next:
//!
//! ```text
//!   NONE ──init──▶ IDLE ──claim──▶ WRITING ──commit──▶ FULL
//!                   ▲                 │                  │
//!                   └────abandon──────┘                  │
//!                   └──────────────release───────────────┘
//! ```
//!
//! The word is only ever accessed through an [`AtomicU32`]: acquire on
//! load, release on store, so payload bytes written before a `FULL` store
//! are visible to whoever observes `FULL`.

use std::sync::atomic::{AtomicU32, Ordering};

use crate::protocol::MemoryBufferInfo;
use crate::{MediaError, Result};

/// Size of the state word at the start of every slot
pub const STATE_WORD_SIZE: u32 = 4;

/// Lifecycle state of one slot
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BufferState {
    /// Never initialised
    #[default]
    None = 0,
    /// Available to the producer
    Idle = 1,
    /// Ready for the consumer
    Full = 2,
    /// Claimed by a producer, payload being written
    Writing = 3,
}

impl BufferState {
    /// Whether `self -> next` is an edge of the state machine
    pub fn can_transition_to(self, next: BufferState) -> bool {
        matches!(
            (self, next),
            (BufferState::None, BufferState::Idle)
                | (BufferState::Idle, BufferState::Writing)
                | (BufferState::Writing, BufferState::Full)
                | (BufferState::Writing, BufferState::Idle)
                | (BufferState::Full, BufferState::Idle)
        )
    }
}

impl TryFrom<u32> for BufferState {
    type Error = &'static str;

    fn try_from(value: u32) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(BufferState::None),
            1 => Ok(BufferState::Idle),
            2 => Ok(BufferState::Full),
            3 => Ok(BufferState::Writing),
            _ => Err("Invalid buffer state value"),
        }
    }
}

impl TryFrom<i32> for BufferState {
    type Error = &'static str;

    fn try_from(value: i32) -> std::result::Result<Self, Self::Error> {
        u32::try_from(value)
            .map_err(|_| "Invalid buffer state value")
            .and_then(BufferState::try_from)
    }
}

impl From<BufferState> for i32 {
    fn from(value: BufferState) -> Self {
        value as i32
    }
}

/// Descriptor of one slot; offsets are relative to the start of the pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryBuffer {
    /// 1-based slot ordinal
    pub buf_id: u32,
    /// Offset of the state word
    pub state_offset: u64,
    /// Offset of the payload, always `state_offset + 4`
    pub mem_offset: u64,
    /// Payload capacity
    pub size: u32,
    /// Payload bytes actually written
    pub occupied_size: u32,
    /// Last observed state
    pub state: BufferState,
}

impl MemoryBuffer {
    /// Describe slot `buf_id` of a pool whose slots are `buffer_size` bytes
    pub fn new(buf_id: u32, buffer_size: u32) -> Self {
        debug_assert!(buf_id > 0);
        let state_offset = (buf_id as u64 - 1) * buffer_size as u64;
        MemoryBuffer {
            buf_id,
            state_offset,
            mem_offset: state_offset + STATE_WORD_SIZE as u64,
            size: buffer_size.saturating_sub(STATE_WORD_SIZE),
            occupied_size: 0,
            state: BufferState::None,
        }
    }

    /// Zero-based slot index
    pub fn index(&self) -> usize {
        self.buf_id as usize - 1
    }

    /// Record how many payload bytes are in use
    pub fn set_occupied_size(&mut self, occupied: u32) -> Result<()> {
        if occupied > self.size {
            return Err(MediaError::InvalidArgument(format!(
                "occupied size {occupied} exceeds capacity {} of buffer {}",
                self.size, self.buf_id
            )));
        }
        self.occupied_size = occupied;
        Ok(())
    }

    /// Wire form of this descriptor
    pub fn to_info(&self) -> MemoryBufferInfo {
        MemoryBufferInfo {
            buf_id: self.buf_id,
            state_offset: self.state_offset,
            mem_offset: self.mem_offset,
            buf_size: self.size,
            state: self.state.into(),
            occupied_buf_size: self.occupied_size,
        }
    }
}

impl TryFrom<&MemoryBufferInfo> for MemoryBuffer {
    type Error = MediaError;

    fn try_from(info: &MemoryBufferInfo) -> Result<Self> {
        if info.buf_id == 0 {
            return Err(MediaError::InvalidArgument("buffer id 0".to_string()));
        }
        if info.mem_offset != info.state_offset + STATE_WORD_SIZE as u64 {
            return Err(MediaError::InvalidArgument(format!(
                "buffer {} payload offset {} does not follow state word at {}",
                info.buf_id, info.mem_offset, info.state_offset
            )));
        }
        if info.occupied_buf_size > info.buf_size {
            return Err(MediaError::InvalidArgument(format!(
                "buffer {} occupied size {} exceeds capacity {}",
                info.buf_id, info.occupied_buf_size, info.buf_size
            )));
        }
        let state = BufferState::try_from(info.state)
            .map_err(|e| MediaError::InvalidArgument(e.to_string()))?;
        Ok(MemoryBuffer {
            buf_id: info.buf_id,
            state_offset: info.state_offset,
            mem_offset: info.mem_offset,
            size: info.buf_size,
            occupied_size: info.occupied_buf_size,
            state,
        })
    }
}

/// Atomic view of one slot's state word
///
/// This is the only path through which state words are read or changed.
#[derive(Clone, Copy)]
pub struct StateWord<'a> {
    word: &'a AtomicU32,
}

impl<'a> StateWord<'a> {
    /// Wrap the state word at `ptr`
    ///
    /// # Safety
    ///
    /// `ptr` must be 4-byte aligned and valid for reads and writes for `'a`,
    /// and must only be accessed atomically during that time.
    pub unsafe fn from_ptr(ptr: *mut u8) -> Self {
        // SAFETY: alignment and validity are guaranteed by the caller.
        let word = unsafe { AtomicU32::from_ptr(ptr.cast::<u32>()) };
        StateWord { word }
    }

    /// Wrap an existing atomic
    pub fn new(word: &'a AtomicU32) -> Self {
        StateWord { word }
    }

    /// Current state; values outside the enum read as `None`
    pub fn load(&self) -> BufferState {
        BufferState::try_from(self.word.load(Ordering::Acquire)).unwrap_or(BufferState::None)
    }

    /// Reset to `IDLE` regardless of the previous value (pool initialisation)
    pub fn reset(&self) {
        self.word.store(BufferState::Idle as u32, Ordering::Release);
    }

    /// Move `from -> to` if the word still holds `from`
    ///
    /// Returns the state actually found when the exchange fails or the edge
    /// is not part of the state machine.
    pub fn transition(&self, from: BufferState, to: BufferState) -> std::result::Result<(), BufferState> {
        if !from.can_transition_to(to) {
            return Err(self.load());
        }
        self.word
            .compare_exchange(from as u32, to as u32, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|actual| BufferState::try_from(actual).unwrap_or(BufferState::None))
    }

    /// Return a consumed `FULL` slot to `IDLE`
    ///
    /// A `WRITING` slot is left alone; only its claimant may abandon it.
    pub fn release(&self) -> std::result::Result<(), BufferState> {
        self.transition(BufferState::Full, BufferState::Idle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_buffer_offsets() {
        let buffer = MemoryBuffer::new(3, 1024);
        assert_eq!(buffer.state_offset, 2048);
        assert_eq!(buffer.mem_offset, buffer.state_offset + 4);
        assert_eq!(buffer.size, 1020);
        assert_eq!(buffer.index(), 2);
    }

    #[test]
    fn test_occupied_size_bounded() {
        let mut buffer = MemoryBuffer::new(1, 64);
        assert!(buffer.set_occupied_size(60).is_ok());
        assert!(matches!(
            buffer.set_occupied_size(61),
            Err(MediaError::InvalidArgument(_))
        ));
        assert_eq!(buffer.occupied_size, 60);
    }

    #[test]
    fn test_transition_edges() {
        assert!(BufferState::None.can_transition_to(BufferState::Idle));
        assert!(BufferState::Idle.can_transition_to(BufferState::Writing));
        assert!(BufferState::Writing.can_transition_to(BufferState::Full));
        assert!(BufferState::Full.can_transition_to(BufferState::Idle));
        assert!(!BufferState::Idle.can_transition_to(BufferState::Full));
        assert!(!BufferState::Full.can_transition_to(BufferState::Writing));
    }

    #[test]
    fn test_state_word_claim_and_release() {
        let atomic = AtomicU32::new(BufferState::None as u32);
        let word = StateWord::new(&atomic);
        assert_eq!(word.load(), BufferState::None);
        assert_eq!(word.release(), Err(BufferState::None));

        word.reset();
        assert_eq!(word.load(), BufferState::Idle);

        assert!(word.transition(BufferState::Idle, BufferState::Writing).is_ok());
        // A second claimant loses.
        assert_eq!(
            word.transition(BufferState::Idle, BufferState::Writing),
            Err(BufferState::Writing)
        );
        assert_eq!(word.release(), Err(BufferState::Writing));
        assert!(word.transition(BufferState::Writing, BufferState::Full).is_ok());
        assert_eq!(word.release(), Ok(()));
        assert_eq!(word.load(), BufferState::Idle);
        assert_eq!(word.release(), Err(BufferState::Idle));
    }

    #[test]
    fn test_garbage_reads_as_none() {
        let atomic = AtomicU32::new(0xdead_beef);
        assert_eq!(StateWord::new(&atomic).load(), BufferState::None);
    }

    #[test]
    fn test_info_conversion_rejects_bad_layout() {
        let mut info = MemoryBuffer::new(2, 256).to_info();
        assert!(MemoryBuffer::try_from(&info).is_ok());

        info.mem_offset += 1;
        assert!(MemoryBuffer::try_from(&info).is_err());

        let mut info = MemoryBuffer::new(2, 256).to_info();
        info.occupied_buf_size = info.buf_size + 1;
        assert!(MemoryBuffer::try_from(&info).is_err());

        info.occupied_buf_size = 0;
        info.state = 17;
        assert!(MemoryBuffer::try_from(&info).is_err());
    }
}
