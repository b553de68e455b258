// Copyright 2024 encode-offload Authors
// SPDX-License-Identifier: Apache-2.0

//! Host task registry
//!
//! Maps task ids to their encode services and answers every RPC method.
//! Refusals travel back as a [`TaskStatus`]; only faults the guest cannot
//! act on become [`RpcReply::Failed`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::{debug, info, warn};

use media_shm::{
    BufferInfo, MediaError, MediaParams, Pts, Result, RpcCall, RpcReply, RpcRequest, TaskInfo,
    TaskStatus,
};

use crate::config::HostConfig;
use crate::encode_service::HostEncodeService;
use crate::loopback::LoopbackEncoder;

/// One started task
struct HostTask {
    info: TaskInfo,
    service: Option<Arc<HostEncodeService>>,
    encoder: Option<LoopbackEncoder>,
}

impl HostTask {
    fn shutdown(&mut self) {
        if let Some(service) = &self.service {
            service.terminate();
        }
        if let Some(mut encoder) = self.encoder.take() {
            encoder.stop();
        }
    }
}

struct Tasks {
    next_id: u32,
    by_id: HashMap<u32, HostTask>,
}

/// Registry of the tasks started on this host
pub struct HostTaskRegistry {
    config: HostConfig,
    tasks: Mutex<Tasks>,
}

impl HostTaskRegistry {
    pub fn new(config: HostConfig) -> Self {
        let next_id = config.first_task_id;
        Self {
            config,
            tasks: Mutex::new(Tasks {
                next_id,
                by_id: HashMap::new(),
            }),
        }
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    /// Number of live tasks
    pub fn task_count(&self) -> usize {
        self.lock().by_id.len()
    }

    /// Stored identity of a live task
    pub fn task_info(&self, task_id: u32) -> Option<TaskInfo> {
        self.lock().by_id.get(&task_id).map(|task| task.info.clone())
    }

    /// Accept a task, assigning its id and this host's device
    pub fn start_service(&self, request: &TaskInfo) -> TaskInfo {
        let mut tasks = self.lock();
        let task_id = tasks.next_id;
        tasks.next_id = tasks.next_id.wrapping_add(1);

        let info = TaskInfo {
            task_status: TaskStatus::Running,
            task_id,
            device_id: self.config.device_id,
            device_type: self.config.device_type,
            ..request.clone()
        };
        tasks.by_id.insert(
            task_id,
            HostTask {
                info: info.clone(),
                service: None,
                encoder: None,
            },
        );
        info!(
            "Started task {task_id} ({:?}) on device {}",
            info.task_type, info.device_id
        );
        info
    }

    /// Stop and forget a task
    pub fn stop_service(&self, request: &TaskInfo) -> TaskStatus {
        let removed = self.lock().by_id.remove(&request.task_id);
        match removed {
            Some(mut task) => {
                task.shutdown();
                info!("Stopped task {}", request.task_id);
                TaskStatus::Stopped
            }
            None => TaskStatus::NotFound,
        }
    }

    /// Drop a task's queued frames
    pub fn reset_service(&self, request: &TaskInfo) -> TaskStatus {
        let service = {
            let tasks = self.lock();
            match tasks.by_id.get(&request.task_id) {
                Some(task) => task.service.clone(),
                None => return TaskStatus::NotFound,
            }
        };
        if let Some(service) = service {
            if let Err(e) = service.reset() {
                warn!("Reset of task {} failed: {e}", request.task_id);
                return TaskStatus::Failed;
            }
        }
        info!("Reset task {}", request.task_id);
        TaskStatus::Running
    }

    /// Attach a task's pools and start its encoder
    pub fn set_init_params(&self, task_id: u32, params: &MediaParams) -> TaskStatus {
        let mut tasks = self.lock();
        let task = match tasks.by_id.get_mut(&task_id) {
            Some(task) if task.service.is_none() => task,
            Some(_) => {
                warn!("Task {task_id} is already configured");
                return TaskStatus::Rejected;
            }
            None => {
                warn!("SetInitParams for unknown task {task_id}");
                return TaskStatus::Rejected;
            }
        };

        let shm = self.config.host_memory(&params.share_memory_info);
        let service = match HostEncodeService::attach(task_id, &shm, self.config.retry) {
            Ok(service) => Arc::new(service),
            Err(e) => {
                warn!("Task {task_id}: cannot attach pools: {e}");
                return TaskStatus::Failed;
            }
        };
        if self.config.loopback {
            match LoopbackEncoder::spawn(service.clone()) {
                Ok(encoder) => task.encoder = Some(encoder),
                Err(e) => {
                    warn!("Task {task_id}: cannot start encoder: {e}");
                    return TaskStatus::Failed;
                }
            }
        }
        task.service = Some(service);
        debug!(
            "Task {task_id} configured: {:?}",
            params.encode_params
        );
        TaskStatus::Running
    }

    /// Queue an input frame of a configured task
    pub fn send_input_data(&self, task_id: u32, info: &BufferInfo) -> TaskStatus {
        let service = match self.service(task_id) {
            Ok(service) => service,
            Err(status) => return status,
        };
        match service.send_input_data(info) {
            Ok(()) => TaskStatus::Running,
            Err(e) => {
                warn!("Task {task_id}: rejected input {}: {e}", info.buffer.buf_id);
                TaskStatus::Rejected
            }
        }
    }

    /// Pop the next encoded frame of a configured task
    pub fn receive_output_data(&self, task_id: u32, pts: Pts) -> Result<BufferInfo> {
        let service = self.service(task_id).map_err(|status| {
            MediaError::InvalidState(format!("task {task_id} cannot deliver output: {status:?}"))
        })?;
        Ok(service.receive_output_data(pts)?.to_info())
    }

    /// Put back an output frame that never reached the guest
    pub fn requeue_output_data(&self, task_id: u32, info: &BufferInfo) -> Result<()> {
        let service = self.service(task_id).map_err(|status| {
            MediaError::InvalidState(format!("task {task_id} cannot take back output: {status:?}"))
        })?;
        service.requeue_output_data(info)
    }

    /// Answer one RPC request
    pub fn handle(&self, request: RpcRequest) -> RpcReply {
        let task_id = request.task_id;
        match request.call {
            RpcCall::StartService(info) => RpcReply::TaskInfo(self.start_service(&info)),
            RpcCall::StopService(info) => RpcReply::TaskStatus(self.stop_service(&info)),
            RpcCall::ResetService(info) => RpcReply::TaskStatus(self.reset_service(&info)),
            RpcCall::SetInitParams(params) => {
                RpcReply::TaskStatus(self.set_init_params(task_id, &params))
            }
            RpcCall::SendInputData(info) => {
                RpcReply::TaskStatus(self.send_input_data(task_id, &info))
            }
            RpcCall::ReceiveOutputData(pts) => match self.receive_output_data(task_id, pts) {
                Ok(info) => RpcReply::BufferInfo(info),
                Err(MediaError::NotEnoughData) => RpcReply::NotReady,
                Err(e) => RpcReply::Failed(e.to_string()),
            },
        }
    }

    /// Stop every task
    pub fn shutdown(&self) {
        let tasks: Vec<_> = self.lock().by_id.drain().collect();
        for (task_id, mut task) in tasks {
            task.shutdown();
            debug!("Shut down task {task_id}");
        }
    }

    fn service(&self, task_id: u32) -> std::result::Result<Arc<HostEncodeService>, TaskStatus> {
        match self.lock().by_id.get(&task_id) {
            Some(HostTask {
                service: Some(service),
                ..
            }) => Ok(service.clone()),
            Some(_) => Err(TaskStatus::Rejected),
            None => Err(TaskStatus::NotFound),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Tasks> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for HostTaskRegistry {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use media_shm::{DeviceType, FrameMemoryPool, RetryPolicy, ShareMemoryInfo, TaskType};

    fn registry(loopback: bool) -> HostTaskRegistry {
        HostTaskRegistry::new(HostConfig {
            device_id: 2,
            device_type: DeviceType::IntegratedGpu,
            first_task_id: 7,
            loopback,
            ..Default::default()
        })
    }

    fn guest_pools(dir: &tempfile::TempDir) -> (MediaParams, FrameMemoryPool, FrameMemoryPool) {
        let shm = ShareMemoryInfo {
            total_memory_size: 0,
            buffer_num: 2,
            buffer_size: 128,
            in_mem_dev_path: dir.path().join("in").display().to_string(),
            out_mem_dev_path: dir.path().join("out").display().to_string(),
            in_slot_number: 0,
            out_slot_number: 0,
        };
        let allocate = |path: &str| {
            let mut pool = FrameMemoryPool::new(path);
            pool.init_buffer_pool(shm.buffer_num, shm.buffer_size, 0).unwrap();
            pool.allocate_buffer_pool().unwrap();
            pool
        };
        let pools = (allocate(&shm.in_mem_dev_path), allocate(&shm.out_mem_dev_path));
        let params = MediaParams {
            share_memory_info: shm,
            ..Default::default()
        };
        (params, pools.0, pools.1)
    }

    fn request(task_id: u32, call: RpcCall) -> RpcRequest {
        RpcRequest { task_id, call }
    }

    #[test]
    fn test_start_assigns_ids_and_device() {
        let registry = registry(false);
        let request = TaskInfo {
            task_type: TaskType::OneVplEncode,
            ..Default::default()
        };

        let first = registry.start_service(&request);
        let second = registry.start_service(&request);
        assert_eq!((first.task_id, second.task_id), (7, 8));
        assert_eq!(first.task_status, TaskStatus::Running);
        assert_eq!(first.device_id, 2);
        assert_eq!(first.device_type, DeviceType::IntegratedGpu);
        assert_eq!(first.task_type, TaskType::OneVplEncode);
        assert_eq!(registry.task_count(), 2);
        assert_eq!(registry.task_info(7), Some(first));
    }

    #[test]
    fn test_stop_and_reset_unknown_task() {
        let registry = registry(false);
        let unknown = TaskInfo {
            task_id: 99,
            ..Default::default()
        };
        assert_eq!(registry.stop_service(&unknown), TaskStatus::NotFound);
        assert_eq!(registry.reset_service(&unknown), TaskStatus::NotFound);

        let started = registry.start_service(&TaskInfo::default());
        assert_eq!(registry.reset_service(&started), TaskStatus::Running);
        assert_eq!(registry.stop_service(&started), TaskStatus::Stopped);
        assert_eq!(registry.stop_service(&started), TaskStatus::NotFound);
        assert_eq!(registry.task_count(), 0);
    }

    #[test]
    fn test_set_init_params_outcomes() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(false);
        let (params, _guest_in, _guest_out) = guest_pools(&dir);

        assert_eq!(registry.set_init_params(42, &params), TaskStatus::Rejected);

        let task = registry.start_service(&TaskInfo::default());
        let mut missing = params.clone();
        missing.share_memory_info.in_mem_dev_path = dir.path().join("nope").display().to_string();
        assert_eq!(registry.set_init_params(task.task_id, &missing), TaskStatus::Failed);

        let mut oversized = params.clone();
        oversized.share_memory_info.buffer_num = u32::MAX;
        oversized.share_memory_info.buffer_size = u32::MAX - 3;
        oversized.share_memory_info.in_slot_number = u32::MAX;
        assert_eq!(registry.set_init_params(task.task_id, &oversized), TaskStatus::Failed);

        assert_eq!(registry.set_init_params(task.task_id, &params), TaskStatus::Running);
        assert_eq!(registry.set_init_params(task.task_id, &params), TaskStatus::Rejected);
    }

    #[test]
    fn test_data_calls_need_configured_task() {
        let registry = registry(false);
        let task = registry.start_service(&TaskInfo::default());

        assert_eq!(
            registry.send_input_data(task.task_id, &BufferInfo::default()),
            TaskStatus::Rejected
        );
        assert_eq!(
            registry.send_input_data(1234, &BufferInfo::default()),
            TaskStatus::NotFound
        );
        let reply = registry.handle(request(task.task_id, RpcCall::ReceiveOutputData(Pts::default())));
        assert!(matches!(reply, RpcReply::Failed(_)));
    }

    #[test]
    fn test_handle_round_trip_with_loopback() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(true);
        let (params, guest_in, guest_out) = guest_pools(&dir);

        let started = match registry.handle(request(0, RpcCall::StartService(TaskInfo::default()))) {
            RpcReply::TaskInfo(info) => info,
            other => panic!("unexpected reply {other:?}"),
        };
        let id = started.task_id;
        assert_eq!(
            registry.handle(request(id, RpcCall::SetInitParams(params))),
            RpcReply::TaskStatus(TaskStatus::Running)
        );
        assert_eq!(
            registry.handle(request(id, RpcCall::ReceiveOutputData(Pts::default()))),
            RpcReply::NotReady
        );

        let mut input = guest_in.get_buffer().unwrap();
        input.pts = 5;
        guest_in.write_payload(&mut input, b"payload").unwrap();
        guest_in.commit_buffer(&mut input, 7).unwrap();
        assert_eq!(
            registry.handle(request(id, RpcCall::SendInputData(input.to_info()))),
            RpcReply::TaskStatus(TaskStatus::Running)
        );

        let policy = RetryPolicy::unbounded()
            .with_deadline(Duration::from_secs(5))
            .with_backoff(Duration::from_millis(1));
        let output = policy
            .run(None, || registry.receive_output_data(id, Pts::default()))
            .unwrap();
        let frame = guest_out.resolve(&output).unwrap();
        assert_eq!(frame.pts, 5);
        assert_eq!(guest_out.payload(&frame).unwrap(), b"payload");

        assert_eq!(
            registry.handle(request(id, RpcCall::StopService(started))),
            RpcReply::TaskStatus(TaskStatus::Stopped)
        );
    }
}
