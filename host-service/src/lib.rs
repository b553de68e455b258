// Copyright 2024 encode-offload Authors
// SPDX-License-Identifier: Apache-2.0

//! Encode offload Host Service
//!
//! Serves the guest task layer: starts tasks, attaches the host's mappings
//! of each task's pools, and moves frame descriptors between the guest and
//! the encoder.
//!
//! # Architecture
//!
//! ```text
//! guest ──RPC──▶ RpcServer ──▶ HostTaskRegistry ──▶ HostEncodeService
//!                                                    │   input FIFO
//!                                                    ▼
//!                                              LoopbackEncoder
//!                                                    │   output FIFO
//! guest ◀──RPC── RpcServer ◀── HostTaskRegistry ◀────┘
//! ```
//!
//! # Modules
//!
//! - [`config`]: service configuration
//! - [`encode_service`]: per-task queues over the host mappings
//! - [`loopback`]: copy-through encoder
//! - [`registry`]: task table and RPC dispatch
//! - [`server`]: tokio TCP front end

pub mod config;
pub mod encode_service;
pub mod loopback;
pub mod registry;
pub mod server;

pub use config::HostConfig;
pub use encode_service::HostEncodeService;
pub use loopback::LoopbackEncoder;
pub use registry::HostTaskRegistry;
pub use server::RpcServer;
