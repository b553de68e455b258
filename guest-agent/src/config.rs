// Copyright 2024 encode-offload Authors
// SPDX-License-Identifier: Apache-2.0

//! Guest agent configuration
//!
//! Loaded from a JSON file; every field has a default so a file only needs
//! to name what it changes.

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use media_shm::{
    DeviceType, EncodeParams, MediaError, MediaParams, Result, RetryPolicy, ShareMemoryInfo,
    StreamType, TaskInfo, TaskStatus, TaskType, DEFAULT_RPC_PORT,
};

/// Default input pool device
pub const DEFAULT_IN_MEM_PATH: &str = "/dev/shm/encode-offload-in";

/// Default output pool device
pub const DEFAULT_OUT_MEM_PATH: &str = "/dev/shm/encode-offload-out";

/// Default slot size: one 1080p NV12 frame plus the state word, rounded up
pub const DEFAULT_BUFFER_SIZE: u32 = 3 * 1024 * 1024 + 4096;

/// Default slots per pool
pub const DEFAULT_BUFFER_NUM: u32 = 4;

/// Stream type stamped on input buffers claimed by tasks of one type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputTagging {
    pub task_type: TaskType,
    pub stream_type: StreamType,
}

/// Default tagging table: every encode task consumes raw frames
pub fn default_input_tagging() -> Vec<InputTagging> {
    vec![
        InputTagging {
            task_type: TaskType::FfmpegEncode,
            stream_type: StreamType::Raw,
        },
        InputTagging {
            task_type: TaskType::OneVplEncode,
            stream_type: StreamType::Raw,
        },
    ]
}

/// One task node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskConfig {
    /// Name used in logs
    pub name: String,
    pub task_type: TaskType,
    pub device_id: u32,
    pub device_type: DeviceType,
    /// Host IP for the data plane (empty = same as control plane)
    pub ip_addr: String,
    pub share_memory: ShareMemoryInfo,
    pub encode: EncodeParams,
    pub input_tagging: Vec<InputTagging>,
    /// Synthetic frames pushed by the agent binary
    pub frames: u32,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            name: "task0".to_string(),
            task_type: TaskType::OneVplEncode,
            device_id: 0,
            device_type: DeviceType::Unknown,
            ip_addr: String::new(),
            share_memory: ShareMemoryInfo {
                total_memory_size: 0,
                buffer_num: DEFAULT_BUFFER_NUM,
                buffer_size: DEFAULT_BUFFER_SIZE,
                in_mem_dev_path: DEFAULT_IN_MEM_PATH.to_string(),
                out_mem_dev_path: DEFAULT_OUT_MEM_PATH.to_string(),
                in_slot_number: 0,
                out_slot_number: 0,
            },
            encode: EncodeParams::default(),
            input_tagging: default_input_tagging(),
            frames: 30,
        }
    }
}

impl TaskConfig {
    /// Task identity sent with `StartService`
    pub fn task_info(&self) -> TaskInfo {
        TaskInfo {
            task_type: self.task_type,
            task_status: TaskStatus::Idle,
            task_id: 0,
            device_id: self.device_id,
            device_type: self.device_type,
            ip_addr: self.ip_addr.clone(),
        }
    }

    /// Parameters sent with `SetInitParams`
    pub fn media_params(&self) -> MediaParams {
        MediaParams {
            share_memory_info: self.share_memory.clone(),
            encode_params: self.encode.clone(),
        }
    }

    /// Stream type for input buffers of this task
    pub fn input_stream_type(&self) -> StreamType {
        self.input_tagging
            .iter()
            .find(|t| t.task_type == self.task_type)
            .map_or(StreamType::Unknown, |t| t.stream_type)
    }

    /// Check the task can be set up
    pub fn validate(&self) -> Result<()> {
        self.share_memory.validate()?;
        if self.encode.frame_width == 0 || self.encode.frame_height == 0 {
            return Err(MediaError::InvalidConfig(format!(
                "task {}: frame size {}x{} is empty",
                self.name, self.encode.frame_width, self.encode.frame_height
            )));
        }
        Ok(())
    }
}

/// Guest agent configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Host control-plane address, `host:port`
    pub host_addr: String,
    /// Socket timeout per RPC call (None = block)
    pub rpc_timeout_ms: Option<u64>,
    /// How long to keep polling for output before giving up on a task
    pub receive_policy: RetryPolicy,
    /// Task nodes, run one after another
    pub tasks: Vec<TaskConfig>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            host_addr: format!("127.0.0.1:{DEFAULT_RPC_PORT}"),
            rpc_timeout_ms: None,
            receive_policy: RetryPolicy::unbounded().with_deadline(Duration::from_secs(10)),
            tasks: vec![TaskConfig::default()],
        }
    }
}

impl AgentConfig {
    /// Load a JSON configuration file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|e| {
            MediaError::InvalidConfig(format!("read {}: {e}", path.display()))
        })?;
        Self::from_json(&text)
            .map_err(|e| MediaError::InvalidConfig(format!("{}: {e}", path.display())))
    }

    /// Parse a JSON configuration document
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| MediaError::InvalidConfig(e.to_string()))
    }

    /// Socket timeout per RPC call
    pub fn rpc_timeout(&self) -> Option<Duration> {
        self.rpc_timeout_ms.map(Duration::from_millis)
    }
}
