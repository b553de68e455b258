// Copyright 2024 encode-offload Authors
// SPDX-License-Identifier: Apache-2.0

//! RPC server
//!
//! Accepts guest connections and answers length-prefixed JSON requests.
//! Each connection runs on its own task; request handlers touch shared
//! memory and may take locks, so they run on the blocking pool. An output
//! frame whose reply cannot be written goes back to its task's queue.

use std::future::Future;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::Arc;

use log::{debug, info, warn};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;

use media_shm::codec::{check_len, decode_body, encode_body};
use media_shm::{MediaError, Result, RpcReply, RpcRequest};

use crate::registry::HostTaskRegistry;

/// RPC front end of a [`HostTaskRegistry`]
pub struct RpcServer {
    listener: TcpListener,
    registry: Arc<HostTaskRegistry>,
}

impl RpcServer {
    /// Listen on `addr`
    pub async fn bind(addr: &str, registry: Arc<HostTaskRegistry>) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| MediaError::ResourceUnavailable(format!("bind {addr}: {e}")))?;
        Ok(Self { listener, registry })
    }

    /// Bound address, useful with port 0
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn registry(&self) -> &Arc<HostTaskRegistry> {
        &self.registry
    }

    /// Serve connections until `shutdown` resolves
    pub async fn serve<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        info!("RPC server listening on {}", self.local_addr()?);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("RPC server shutting down");
                    break;
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!("Connection from {peer}");
                        if let Err(e) = stream.set_nodelay(true) {
                            debug!("Connection from {peer}: nodelay: {e}");
                        }
                        let registry = self.registry.clone();
                        tokio::spawn(async move {
                            if let Err(e) = serve_connection(stream, registry).await {
                                warn!("Connection from {peer} ended: {e}");
                            }
                        });
                    }
                    Err(e) => warn!("Accept failed: {e}"),
                },
            }
        }
        Ok(())
    }
}

async fn serve_connection<S>(mut stream: S, registry: Arc<HostTaskRegistry>) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let body = match read_frame(&mut stream).await? {
            Some(body) => body,
            None => return Ok(()),
        };
        let (task_id, reply) = match decode_body::<RpcRequest>(&body) {
            Ok(request) => {
                let task_id = request.task_id;
                let registry = registry.clone();
                let reply = tokio::task::spawn_blocking(move || registry.handle(request))
                    .await
                    .unwrap_or_else(|e| RpcReply::Failed(format!("handler failed: {e}")));
                (task_id, reply)
            }
            Err(e) => (0, RpcReply::Failed(e.to_string())),
        };
        if let Err(e) = write_frame(&mut stream, &reply).await {
            if let RpcReply::BufferInfo(info) = &reply {
                match registry.requeue_output_data(task_id, info) {
                    Ok(()) => debug!("Task {task_id}: output {} requeued", info.buffer.buf_id),
                    Err(requeue) => warn!(
                        "Task {task_id}: output {} lost: {requeue}",
                        info.buffer.buf_id
                    ),
                }
            }
            return Err(e);
        }
    }
}

/// Read one frame body; `None` on a clean close between frames
async fn read_frame<S: AsyncRead + Unpin>(stream: &mut S) -> Result<Option<Vec<u8>>> {
    let len = match stream.read_u32().await {
        Ok(len) => len as usize,
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    check_len(len)?;
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).await?;
    Ok(Some(body))
}

async fn write_frame<S: AsyncWrite + Unpin>(stream: &mut S, reply: &RpcReply) -> Result<()> {
    let body = encode_body(reply)?;
    stream.write_u32(body.len() as u32).await?;
    stream.write_all(&body).await?;
    stream.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::time::Duration;

    use media_shm::codec::{read_message, write_message};
    use media_shm::{
        FrameMemoryPool, MediaParams, Pts, RetryPolicy, RpcCall, ShareMemoryInfo, TaskInfo,
        TaskStatus,
    };

    use crate::config::HostConfig;

    #[tokio::test(flavor = "multi_thread")]
    async fn test_undelivered_output_is_requeued() {
        let dir = tempfile::tempdir().unwrap();
        let shm = ShareMemoryInfo {
            buffer_num: 2,
            buffer_size: 64,
            in_mem_dev_path: dir.path().join("in").display().to_string(),
            out_mem_dev_path: dir.path().join("out").display().to_string(),
            ..Default::default()
        };
        let allocate = |path: &str| {
            let mut pool = FrameMemoryPool::new(path);
            pool.init_buffer_pool(shm.buffer_num, shm.buffer_size, 0).unwrap();
            pool.allocate_buffer_pool().unwrap();
            pool
        };
        let guest_in = allocate(&shm.in_mem_dev_path);
        let guest_out = allocate(&shm.out_mem_dev_path);

        let registry = Arc::new(HostTaskRegistry::new(HostConfig::default()));
        let task = registry.start_service(&TaskInfo::default());
        let params = MediaParams {
            share_memory_info: shm.clone(),
            ..Default::default()
        };
        assert_eq!(registry.set_init_params(task.task_id, &params), TaskStatus::Running);

        let mut input = guest_in.get_buffer().unwrap();
        input.pts = 4;
        guest_in.commit_buffer(&mut input, 0).unwrap();
        assert_eq!(
            registry.send_input_data(task.task_id, &input.to_info()),
            TaskStatus::Running
        );
        let wait = RetryPolicy::unbounded()
            .with_deadline(Duration::from_secs(5))
            .with_backoff(Duration::from_millis(1));
        let encoded = wait
            .run(None, || registry.receive_output_data(task.task_id, Pts::default()))
            .unwrap();
        registry.requeue_output_data(task.task_id, &encoded).unwrap();

        // The guest asks for the frame and hangs up before the reply.
        let (mut guest, host) = tokio::io::duplex(4096);
        let body = encode_body(&RpcRequest {
            task_id: task.task_id,
            call: RpcCall::ReceiveOutputData(Pts::default()),
        })
        .unwrap();
        guest.write_u32(body.len() as u32).await.unwrap();
        guest.write_all(&body).await.unwrap();
        drop(guest);
        assert!(serve_connection(host, registry.clone()).await.is_err());

        let again = registry
            .receive_output_data(task.task_id, Pts::default())
            .unwrap();
        assert_eq!((again.buffer.buf_id, again.pts), (encoded.buffer.buf_id, 4));

        registry.requeue_output_data(task.task_id, &again).unwrap();
        assert_eq!(registry.reset_service(&task), TaskStatus::Running);
        assert_eq!(guest_out.idle_count(), 2);
    }

    #[test]
    fn test_serves_blocking_client() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let registry = Arc::new(HostTaskRegistry::new(HostConfig {
            loopback: false,
            ..Default::default()
        }));
        let server = runtime
            .block_on(RpcServer::bind("127.0.0.1:0", registry))
            .unwrap();
        let addr = server.local_addr().unwrap();
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let serving = runtime.spawn(server.serve(async move {
            let _ = stop_rx.await;
        }));

        let mut client = std::net::TcpStream::connect(addr).unwrap();
        write_message(
            &mut client,
            &RpcRequest {
                task_id: 0,
                call: RpcCall::StartService(TaskInfo::default()),
            },
        )
        .unwrap();
        let started = match read_message::<_, RpcReply>(&mut client).unwrap() {
            RpcReply::TaskInfo(info) => info,
            other => panic!("unexpected reply {other:?}"),
        };
        assert_eq!(started.task_id, 1);
        assert_eq!(started.task_status, TaskStatus::Running);

        write_message(
            &mut client,
            &RpcRequest {
                task_id: started.task_id,
                call: RpcCall::ReceiveOutputData(Pts::default()),
            },
        )
        .unwrap();
        assert!(matches!(
            read_message::<_, RpcReply>(&mut client).unwrap(),
            RpcReply::Failed(_)
        ));

        // A malformed body gets a Failed reply and the connection stays open
        client.write_all(&4u32.to_be_bytes()).unwrap();
        client.write_all(b"nope").unwrap();
        assert!(matches!(
            read_message::<_, RpcReply>(&mut client).unwrap(),
            RpcReply::Failed(_)
        ));

        write_message(
            &mut client,
            &RpcRequest {
                task_id: started.task_id,
                call: RpcCall::StopService(started.clone()),
            },
        )
        .unwrap();
        assert_eq!(
            read_message::<_, RpcReply>(&mut client).unwrap(),
            RpcReply::TaskStatus(TaskStatus::Stopped)
        );

        stop_tx.send(()).unwrap();
        runtime.block_on(serving).unwrap().unwrap();
    }
}
