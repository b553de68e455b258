// Copyright 2024 encode-offload Authors
// SPDX-License-Identifier: Apache-2.0

//! RPC session backends
//!
//! Both planes speak length-prefixed JSON over a blocking TCP stream. One
//! call is one request frame followed by one reply frame; calls on the same
//! channel are serialised by a mutex.

use std::net::TcpStream;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use log::{debug, info, trace};

use media_shm::codec::{read_message, write_message};
use media_shm::{
    BufferInfo, FrameBufferData, MediaError, MediaParams, Pts, Result, RpcCall, RpcReply,
    RpcRequest, TaskInfo, TaskStatus,
};

use crate::session::{SessionFactory, TaskDataSession, TaskManagerSession};

/// One synchronous request/response connection to the host
pub struct RpcChannel {
    /// Peer address, for logging
    addr: String,
    /// Connected stream
    stream: Mutex<TcpStream>,
}

impl RpcChannel {
    /// Connect to `addr`; `timeout` bounds each read and write when set
    pub fn connect(addr: &str, timeout: Option<Duration>) -> Result<Self> {
        let unavailable =
            |e: std::io::Error| MediaError::ResourceUnavailable(format!("connect {addr}: {e}"));

        let stream = TcpStream::connect(addr).map_err(unavailable)?;
        stream.set_nodelay(true).map_err(unavailable)?;
        stream.set_read_timeout(timeout).map_err(unavailable)?;
        stream.set_write_timeout(timeout).map_err(unavailable)?;

        debug!("RPC channel connected to {addr}");
        Ok(Self {
            addr: addr.to_string(),
            stream: Mutex::new(stream),
        })
    }

    /// Peer address
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Issue one call and wait for its reply
    pub fn call(&self, task_id: u32, call: RpcCall) -> Result<RpcReply> {
        let method = call.method();
        let request = RpcRequest { task_id, call };
        let mut stream = self.stream.lock().unwrap_or_else(PoisonError::into_inner);

        let transport = |e: MediaError| match e {
            MediaError::Io(io) => {
                MediaError::OperationFailed(format!("{method} to {}: {io}", self.addr))
            }
            other => other,
        };

        write_message(&mut *stream, &request).map_err(transport)?;
        let reply: RpcReply = read_message(&mut *stream).map_err(transport)?;
        trace!("{method} for task {task_id} -> {reply:?}");
        Ok(reply)
    }
}

/// Control-plane session over an [`RpcChannel`]
pub struct RpcTaskManagerSession {
    channel: RpcChannel,
}

impl RpcTaskManagerSession {
    pub fn new(channel: RpcChannel) -> Self {
        Self { channel }
    }
}

impl TaskManagerSession for RpcTaskManagerSession {
    fn start_task(&self, info: &TaskInfo) -> Result<TaskInfo> {
        let reply = self.channel.call(info.task_id, RpcCall::StartService(info.clone()))?;
        let started = reply.into_task_info()?;
        if !started.task_status.is_success() {
            return Err(MediaError::InvalidState(format!(
                "StartService refused: {:?}",
                started.task_status
            )));
        }
        Ok(started)
    }

    fn stop_task(&self, info: &TaskInfo) -> Result<TaskStatus> {
        self.channel
            .call(info.task_id, RpcCall::StopService(info.clone()))?
            .into_task_status()?
            .into_result("StopService")
    }

    fn reset_task(&self, info: &TaskInfo) -> Result<TaskStatus> {
        self.channel
            .call(info.task_id, RpcCall::ResetService(info.clone()))?
            .into_task_status()?
            .into_result("ResetService")
    }
}

/// Data-plane session over an [`RpcChannel`]
pub struct RpcTaskDataSession {
    channel: RpcChannel,
    task_id: u32,
    /// Receive cursor, advanced once per frame actually returned
    cursor: AtomicU64,
}

impl RpcTaskDataSession {
    pub fn new(channel: RpcChannel, task_id: u32) -> Self {
        Self {
            channel,
            task_id,
            cursor: AtomicU64::new(0),
        }
    }

    /// Number of frames received so far
    pub fn cursor(&self) -> u64 {
        self.cursor.load(Ordering::Acquire)
    }
}

impl TaskDataSession for RpcTaskDataSession {
    fn set_init_params(&self, params: &MediaParams) -> Result<TaskStatus> {
        self.channel
            .call(self.task_id, RpcCall::SetInitParams(params.clone()))?
            .into_task_status()?
            .into_result("SetInitParams")
    }

    fn send_frame(&self, data: &FrameBufferData) -> Result<TaskStatus> {
        self.channel
            .call(self.task_id, RpcCall::SendInputData(data.to_info()))?
            .into_task_status()?
            .into_result("SendInputData")
    }

    fn receive_frame(&self) -> Result<BufferInfo> {
        let pts = Pts { pts: self.cursor() };
        let info = self
            .channel
            .call(self.task_id, RpcCall::ReceiveOutputData(pts))?
            .into_buffer_info()?;
        self.cursor.fetch_add(1, Ordering::AcqRel);
        Ok(info)
    }
}

/// Opens RPC sessions against one host
pub struct RpcSessionFactory {
    /// Control-plane address, `host:port`
    addr: String,
    /// Per-call socket timeout
    timeout: Option<Duration>,
}

impl RpcSessionFactory {
    pub fn new(addr: impl Into<String>, timeout: Option<Duration>) -> Self {
        Self {
            addr: addr.into(),
            timeout,
        }
    }

    /// Data-plane address: the host IP from the task reply when it has one,
    /// on the control-plane port
    pub fn data_addr(&self, task: &TaskInfo) -> String {
        match self.addr.rsplit_once(':') {
            Some((_, port)) if !task.ip_addr.is_empty() => format!("{}:{port}", task.ip_addr),
            _ => self.addr.clone(),
        }
    }
}

impl SessionFactory for RpcSessionFactory {
    fn control_session(&self) -> Result<Box<dyn TaskManagerSession>> {
        let channel = RpcChannel::connect(&self.addr, self.timeout)?;
        Ok(Box::new(RpcTaskManagerSession::new(channel)))
    }

    fn data_session(&self, task: &TaskInfo) -> Result<Arc<dyn TaskDataSession>> {
        let addr = self.data_addr(task);
        let channel = RpcChannel::connect(&addr, self.timeout)?;
        info!("Data session for task {} connected to {addr}", task.task_id);
        Ok(Arc::new(RpcTaskDataSession::new(channel, task.task_id)))
    }
}
