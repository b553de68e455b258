// Copyright 2024 encode-offload Authors
// SPDX-License-Identifier: Apache-2.0

//! Host service configuration

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use media_shm::{DeviceType, MediaError, Result, RetryPolicy, ShareMemoryInfo, DEFAULT_RPC_PORT};

/// Host encode service configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Address the RPC server listens on
    pub listen_addr: String,
    /// Device id stamped on every started task
    pub device_id: u32,
    /// Device type stamped on every started task
    pub device_type: DeviceType,
    /// Id handed to the first started task
    pub first_task_id: u32,
    /// Run the loopback encoder for each configured task
    pub loopback: bool,
    /// Wait policy for a free output slot
    pub retry: RetryPolicy,
    /// Host path of the input device when it differs from the guest's
    pub in_mem_dev_path: Option<String>,
    /// Host path of the output device when it differs from the guest's
    pub out_mem_dev_path: Option<String>,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            listen_addr: format!("0.0.0.0:{DEFAULT_RPC_PORT}"),
            device_id: 0,
            device_type: DeviceType::Cpu,
            first_task_id: 1,
            loopback: true,
            retry: RetryPolicy::unbounded(),
            in_mem_dev_path: None,
            out_mem_dev_path: None,
        }
    }
}

impl HostConfig {
    /// Load a JSON configuration file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .map_err(|e| MediaError::InvalidConfig(format!("read {}: {e}", path.display())))?;
        serde_json::from_str(&text)
            .map_err(|e| MediaError::InvalidConfig(format!("{}: {e}", path.display())))
    }

    /// Memory geometry as seen from the host, with path overrides applied
    pub fn host_memory(&self, guest: &ShareMemoryInfo) -> ShareMemoryInfo {
        let mut info = guest.clone();
        if let Some(path) = &self.in_mem_dev_path {
            info.in_mem_dev_path = path.clone();
        }
        if let Some(path) = &self.out_mem_dev_path {
            info.out_mem_dev_path = path.clone();
        }
        info
    }
}
