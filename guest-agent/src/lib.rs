// Copyright 2024 encode-offload Authors
// SPDX-License-Identifier: Apache-2.0

//! Encode offload Guest Agent
//!
//! This crate provides the guest-side task layer that hands raw frames to a
//! host encoder through shared memory and gets encoded frames back.
//!
//! # Overview
//!
//! Payload bytes never cross the RPC channel. The guest writes a frame into
//! an input pool slot, sends the slot's descriptor, and later receives the
//! descriptor of an output slot the host has filled:
//!
//! - **Task lifecycle**: start, configure, reset and stop a host task
//! - **Pools**: allocate the input and output pools of a task
//! - **Sessions**: control and data planes behind traits, with an RPC backend
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   Frame producer / consumer                  │
//! └─────────────────────────────────────────────────────────────┘
//!                            │
//!                            ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      TaskManager                            │
//! │  - input / output FrameMemoryPool                           │
//! │  - DataSender / DataReceiver                                │
//! └─────────────────────────────────────────────────────────────┘
//!                 │                              │
//!                 ▼                              ▼
//! ┌──────────────────────────────┐  ┌──────────────────────────┐
//! │ TaskManagerSession (control) │  │ TaskDataSession (data)   │
//! └──────────────────────────────┘  └──────────────────────────┘
//!                 │                              │
//!                 └──────────────┬───────────────┘
//!                                ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  Host encode service (RPC)                   │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use encode_guest_agent::{RpcSessionFactory, TaskConfig, TaskManager};
//!
//! let config = TaskConfig::default();
//! let factory = RpcSessionFactory::new("127.0.0.1:50051", None);
//! let mut task = TaskManager::new(config.clone(), Box::new(factory));
//! task.initialize()?;
//! task.set_init_params(&config.media_params())?;
//!
//! let mut frame = task.get_one_input_buffer()?;
//! task.write_input(&mut frame, &raw_bytes)?;
//! task.send_frame(frame)?;
//!
//! let encoded = task.receive_frame()?;
//! consume(task.output_payload(&encoded)?);
//! task.release_one_output_buffer(encoded)?;
//! ```
//!
//! # Modules
//!
//! - [`agent`]: runs the configured task nodes
//! - [`config`]: agent and task configuration
//! - [`data`]: send and receive adapters
//! - [`rpc`]: TCP session backends
//! - [`session`]: session traits
//! - [`task_manager`]: task lifecycle and pools

pub mod agent;
pub mod config;
pub mod data;
pub mod rpc;
pub mod session;
pub mod task_manager;

pub use agent::{GuestAgent, TaskReport};
pub use config::{AgentConfig, InputTagging, TaskConfig};
pub use data::{DataReceiver, DataSender};
pub use rpc::{RpcChannel, RpcSessionFactory, RpcTaskDataSession, RpcTaskManagerSession};
pub use session::{SessionFactory, TaskDataSession, TaskManagerSession};
pub use task_manager::{TaskManager, TaskState};
