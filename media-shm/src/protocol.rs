// Copyright 2024 encode-offload Authors
// SPDX-License-Identifier: Apache-2.0

//! Wire protocol shared by the guest task layer and the host encode service
//!
//! Enumerations travel as `int32` values; unknown values are rejected on
//! decode. Field names are camelCase on the wire.

use serde::{Deserialize, Serialize};

use crate::{MediaError, Result};

/// Largest message either side will encode or accept (1 MiB)
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Default host port for the control and data planes
pub const DEFAULT_RPC_PORT: u16 = 50051;

/// Kind of encode job a task performs
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(try_from = "i32", into = "i32")]
pub enum TaskType {
    /// Not set
    #[default]
    Unknown = 0,
    /// Encode through an external ffmpeg process
    FfmpegEncode = 1,
    /// Encode through the oneVPL SDK
    OneVplEncode = 2,
}

impl TryFrom<i32> for TaskType {
    type Error = &'static str;

    fn try_from(value: i32) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(TaskType::Unknown),
            1 => Ok(TaskType::FfmpegEncode),
            2 => Ok(TaskType::OneVplEncode),
            _ => Err("Invalid task type value"),
        }
    }
}

impl From<TaskType> for i32 {
    fn from(value: TaskType) -> Self {
        value as i32
    }
}

/// Task status, also used as the acknowledgement of data-plane calls
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "i32", into = "i32")]
pub enum TaskStatus {
    /// Created, not running
    #[default]
    Idle = 0,
    /// Accepted and running
    Running = 1,
    /// Stopped on request
    Stopped = 2,
    /// Host failed to carry out the request
    Failed = 3,
    /// Task id unknown to the host
    NotFound = 4,
    /// Request refused in the task's current state
    Rejected = 5,
}

impl TaskStatus {
    /// Whether the peer accepted the request
    pub fn is_success(&self) -> bool {
        !matches!(
            self,
            TaskStatus::Failed | TaskStatus::NotFound | TaskStatus::Rejected
        )
    }

    /// Turn a negative acknowledgement into [`MediaError::InvalidState`]
    pub fn into_result(self, call: &str) -> Result<TaskStatus> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(MediaError::InvalidState(format!("{call} refused: {self:?}")))
        }
    }
}

impl TryFrom<i32> for TaskStatus {
    type Error = &'static str;

    fn try_from(value: i32) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(TaskStatus::Idle),
            1 => Ok(TaskStatus::Running),
            2 => Ok(TaskStatus::Stopped),
            3 => Ok(TaskStatus::Failed),
            4 => Ok(TaskStatus::NotFound),
            5 => Ok(TaskStatus::Rejected),
            _ => Err("Invalid task status value"),
        }
    }
}

impl From<TaskStatus> for i32 {
    fn from(value: TaskStatus) -> Self {
        value as i32
    }
}

/// Kind of media device a task runs on
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "i32", into = "i32")]
pub enum DeviceType {
    #[default]
    Unknown = 0,
    Cpu = 1,
    IntegratedGpu = 2,
    DiscreteGpu = 3,
}

impl TryFrom<i32> for DeviceType {
    type Error = &'static str;

    fn try_from(value: i32) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(DeviceType::Unknown),
            1 => Ok(DeviceType::Cpu),
            2 => Ok(DeviceType::IntegratedGpu),
            3 => Ok(DeviceType::DiscreteGpu),
            _ => Err("Invalid device type value"),
        }
    }
}

impl From<DeviceType> for i32 {
    fn from(value: DeviceType) -> Self {
        value as i32
    }
}

/// Content of a slot's payload
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "i32", into = "i32")]
pub enum StreamType {
    /// Uncompressed frame from the producer
    Raw = 0,
    /// Encoder output
    Encoded = 1,
    #[default]
    Unknown = 2,
}

impl TryFrom<i32> for StreamType {
    type Error = &'static str;

    fn try_from(value: i32) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(StreamType::Raw),
            1 => Ok(StreamType::Encoded),
            2 => Ok(StreamType::Unknown),
            _ => Err("Invalid stream type value"),
        }
    }
}

impl From<StreamType> for i32 {
    fn from(value: StreamType) -> Self {
        value as i32
    }
}

/// Task identity exchanged on the control plane
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskInfo {
    pub task_type: TaskType,
    pub task_status: TaskStatus,
    /// Assigned by the host in the `StartService` reply
    pub task_id: u32,
    pub device_id: u32,
    pub device_type: DeviceType,
    pub ip_addr: String,
}

/// Shared-memory geometry negotiated once per task
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShareMemoryInfo {
    /// Size of each memory device in bytes (0 = not checked)
    pub total_memory_size: u64,
    /// Slots per pool
    pub buffer_num: u32,
    /// Bytes per slot, state word included
    pub buffer_size: u32,
    /// Device file backing the input pool
    pub in_mem_dev_path: String,
    /// Device file backing the output pool
    pub out_mem_dev_path: String,
    /// Sub-pool index of this task inside the input device
    #[serde(default)]
    pub in_slot_number: u32,
    /// Sub-pool index of this task inside the output device
    #[serde(default)]
    pub out_slot_number: u32,
}

impl ShareMemoryInfo {
    /// Bytes covered by one pool (`buffer_num * buffer_size`)
    pub fn pool_bytes(&self) -> u64 {
        self.buffer_num as u64 * self.buffer_size as u64
    }

    /// Check geometry and that both sub-pools fit their devices
    pub fn validate(&self) -> Result<()> {
        if self.buffer_num == 0 || self.buffer_size == 0 {
            return Err(MediaError::InvalidConfig(format!(
                "buffer_num {} and buffer_size {} must be non-zero",
                self.buffer_num, self.buffer_size
            )));
        }
        if self.in_mem_dev_path.is_empty() || self.out_mem_dev_path.is_empty() {
            return Err(MediaError::InvalidConfig(
                "memory device paths must be set".to_string(),
            ));
        }
        let slot = self.in_slot_number.max(self.out_slot_number) as u64;
        let needed = (slot + 1).checked_mul(self.pool_bytes()).ok_or_else(|| {
            MediaError::InvalidConfig(format!(
                "sub-pool {slot} of {} x {} bytes overflows the device offset",
                self.buffer_num, self.buffer_size
            ))
        })?;
        if self.total_memory_size != 0 && needed > self.total_memory_size {
            return Err(MediaError::InvalidConfig(format!(
                "pool needs {needed} bytes but device has {}",
                self.total_memory_size
            )));
        }
        Ok(())
    }
}

/// Encoder settings forwarded untouched to the host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncodeParams {
    pub codec_id: i32,
    pub gop_size: u32,
    pub async_depth: u32,
    pub target_usage: u32,
    pub rc_mode: i32,
    pub qp: u32,
    /// Target bit rate in kbps
    pub bit_rate: u32,
    pub framerate_num: u32,
    pub framerate_den: u32,
    pub frame_width: u32,
    pub frame_height: u32,
    pub color_format: i32,
    pub codec_profile: i32,
    pub gop_ref_dist: u32,
    pub num_ref_frame: u32,
}

impl Default for EncodeParams {
    fn default() -> Self {
        Self {
            codec_id: 0,
            gop_size: 30,
            async_depth: 1,
            target_usage: 4,
            rc_mode: 0,
            qp: 26,
            bit_rate: 4000,
            framerate_num: 30,
            framerate_den: 1,
            frame_width: 1920,
            frame_height: 1080,
            color_format: 0,
            codec_profile: 0,
            gop_ref_dist: 1,
            num_ref_frame: 1,
        }
    }
}

/// Payload of the `SetInitParams` call
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaParams {
    pub share_memory_info: ShareMemoryInfo,
    pub encode_params: EncodeParams,
}

/// Slot descriptor as carried inside a [`BufferInfo`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryBufferInfo {
    pub buf_id: u32,
    pub state_offset: u64,
    pub mem_offset: u64,
    pub buf_size: u32,
    pub state: i32,
    pub occupied_buf_size: u32,
}

/// Frame descriptor exchanged on the data plane
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BufferInfo {
    pub width: u32,
    pub height: u32,
    #[serde(rename = "type")]
    pub stream_type: StreamType,
    pub pts: u64,
    pub is_eos: bool,
    pub buffer: MemoryBufferInfo,
}

/// Receive cursor for `ReceiveOutputData`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Pts {
    pub pts: u64,
}

/// RPC method and its parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", content = "params")]
pub enum RpcCall {
    StartService(TaskInfo),
    StopService(TaskInfo),
    ResetService(TaskInfo),
    SetInitParams(MediaParams),
    SendInputData(BufferInfo),
    ReceiveOutputData(Pts),
}

impl RpcCall {
    /// Method name, for logging
    pub fn method(&self) -> &'static str {
        match self {
            RpcCall::StartService(_) => "StartService",
            RpcCall::StopService(_) => "StopService",
            RpcCall::ResetService(_) => "ResetService",
            RpcCall::SetInitParams(_) => "SetInitParams",
            RpcCall::SendInputData(_) => "SendInputData",
            RpcCall::ReceiveOutputData(_) => "ReceiveOutputData",
        }
    }
}

/// Request envelope; `task_id` routes data-plane calls on the host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcRequest {
    pub task_id: u32,
    pub call: RpcCall,
}

/// Reply envelope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "body")]
pub enum RpcReply {
    TaskInfo(TaskInfo),
    TaskStatus(TaskStatus),
    BufferInfo(BufferInfo),
    /// No output is ready yet
    NotReady,
    /// The host could not process the call
    Failed(String),
}

impl RpcReply {
    /// Map transport-level statuses to errors, leaving payload replies as-is
    pub fn into_result(self) -> Result<RpcReply> {
        match self {
            RpcReply::NotReady => Err(MediaError::NotEnoughData),
            RpcReply::Failed(message) => Err(MediaError::OperationFailed(message)),
            reply => Ok(reply),
        }
    }

    /// Expect a [`TaskInfo`] reply
    pub fn into_task_info(self) -> Result<TaskInfo> {
        match self.into_result()? {
            RpcReply::TaskInfo(info) => Ok(info),
            other => Err(unexpected("TaskInfo", &other)),
        }
    }

    /// Expect a [`TaskStatus`] reply
    pub fn into_task_status(self) -> Result<TaskStatus> {
        match self.into_result()? {
            RpcReply::TaskStatus(status) => Ok(status),
            other => Err(unexpected("TaskStatus", &other)),
        }
    }

    /// Expect a [`BufferInfo`] reply
    pub fn into_buffer_info(self) -> Result<BufferInfo> {
        match self.into_result()? {
            RpcReply::BufferInfo(info) => Ok(info),
            other => Err(unexpected("BufferInfo", &other)),
        }
    }
}

fn unexpected(expected: &str, got: &RpcReply) -> MediaError {
    MediaError::OperationFailed(format!("expected {expected} reply, got {got:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enum_try_from() {
        assert_eq!(TaskType::try_from(2).unwrap(), TaskType::OneVplEncode);
        assert!(TaskType::try_from(9).is_err());
        assert_eq!(TaskStatus::try_from(4).unwrap(), TaskStatus::NotFound);
        assert!(TaskStatus::try_from(-1).is_err());
        assert_eq!(StreamType::try_from(1).unwrap(), StreamType::Encoded);
        assert!(DeviceType::try_from(7).is_err());
    }

    #[test]
    fn test_task_status_success() {
        assert!(TaskStatus::Running.is_success());
        assert!(TaskStatus::Stopped.is_success());
        assert!(!TaskStatus::Rejected.is_success());

        let err = TaskStatus::NotFound.into_result("StopService").unwrap_err();
        assert!(matches!(err, MediaError::InvalidState(_)));
    }

    #[test]
    fn test_enums_travel_as_integers() {
        let info = TaskInfo {
            task_type: TaskType::OneVplEncode,
            task_status: TaskStatus::Running,
            task_id: 7,
            device_id: 1,
            device_type: DeviceType::DiscreteGpu,
            ip_addr: "10.0.0.2".to_string(),
        };
        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["taskType"], 2);
        assert_eq!(json["deviceType"], 3);
        assert_eq!(json["taskId"], 7);

        let bad = serde_json::json!({
            "taskType": 42, "taskStatus": 0, "taskId": 0,
            "deviceId": 0, "deviceType": 0, "ipAddr": ""
        });
        assert!(serde_json::from_value::<TaskInfo>(bad).is_err());
    }

    #[test]
    fn test_buffer_info_field_names() {
        let info = BufferInfo {
            stream_type: StreamType::Raw,
            is_eos: true,
            ..Default::default()
        };
        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["type"], 0);
        assert_eq!(json["isEos"], true);
        assert!(json["buffer"].get("occupiedBufSize").is_some());
    }

    #[test]
    fn test_share_memory_info_validate() {
        let mut info = ShareMemoryInfo {
            total_memory_size: 8192,
            buffer_num: 4,
            buffer_size: 1024,
            in_mem_dev_path: "/dev/shm/in".to_string(),
            out_mem_dev_path: "/dev/shm/out".to_string(),
            in_slot_number: 1,
            out_slot_number: 0,
        };
        assert!(info.validate().is_ok());

        info.in_slot_number = 2;
        assert!(matches!(info.validate(), Err(MediaError::InvalidConfig(_))));

        info.in_slot_number = 0;
        info.buffer_num = 0;
        assert!(matches!(info.validate(), Err(MediaError::InvalidConfig(_))));
    }

    #[test]
    fn test_share_memory_info_overflow_is_invalid() {
        let mut info = ShareMemoryInfo {
            total_memory_size: 1,
            buffer_num: u32::MAX,
            buffer_size: u32::MAX - 3,
            in_mem_dev_path: "/dev/shm/in".to_string(),
            out_mem_dev_path: "/dev/shm/out".to_string(),
            in_slot_number: u32::MAX,
            out_slot_number: 0,
        };
        assert!(matches!(info.validate(), Err(MediaError::InvalidConfig(_))));

        info.total_memory_size = 0;
        assert!(matches!(info.validate(), Err(MediaError::InvalidConfig(_))));
    }

    #[test]
    fn test_reply_mapping() {
        assert!(matches!(
            RpcReply::NotReady.into_buffer_info(),
            Err(MediaError::NotEnoughData)
        ));
        assert!(matches!(
            RpcReply::Failed("boom".into()).into_task_status(),
            Err(MediaError::OperationFailed(_))
        ));
        assert!(matches!(
            RpcReply::TaskStatus(TaskStatus::Running).into_task_info(),
            Err(MediaError::OperationFailed(_))
        ));
    }
}
