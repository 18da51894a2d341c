// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! One-request-at-a-time RPC over a browser agent's WebSocket
//!
//! A single worker task owns the socket for the lifetime of the connection.
//! Callers hand it requests through a bounded queue and block on a oneshot
//! for the reply, so two requests can never interleave on the wire no matter
//! how many threads the filesystem layer dispatches from.

use crate::error::{RpcError, RpcResult};
use domfs_proto::{RpcRequest, WireEncoding};
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};

/// Synchronous command transport used by the operation adapter.
///
/// Implementations must not be called from inside an async context; the
/// FUSE loop runs on a dedicated blocking thread.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
pub trait CommandChannel: Send + Sync {
    /// Send `request` and wait for the agent's reply.
    fn call(&self, request: RpcRequest) -> RpcResult<Value>;
}

struct PendingCall {
    request: RpcRequest,
    reply: oneshot::Sender<RpcResult<Value>>,
}

/// Handle to a connection's RPC worker
#[derive(Clone)]
pub struct RpcChannel {
    calls: mpsc::Sender<PendingCall>,
}

/// Resolves once the worker has stopped and the socket is gone.
pub struct ChannelClosed(oneshot::Receiver<()>);

impl ChannelClosed {
    pub async fn wait(self) {
        let _ = self.0.await;
    }
}

impl RpcChannel {
    /// Start the worker for an accepted connection.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn spawn<S>(
        socket: WebSocketStream<S>,
        encoding: WireEncoding,
        timeout: Option<Duration>,
        connection_id: u64,
    ) -> (Self, ChannelClosed)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (calls_tx, calls_rx) = mpsc::channel(1);
        let (closed_tx, closed_rx) = oneshot::channel();
        let worker = ChannelWorker {
            socket,
            encoding,
            timeout,
            connection_id,
        };
        tokio::spawn(async move {
            worker.run(calls_rx).await;
            let _ = closed_tx.send(());
        });
        (Self { calls: calls_tx }, ChannelClosed(closed_rx))
    }

    /// Async flavour of [`CommandChannel::call`].
    pub async fn call_async(&self, request: RpcRequest) -> RpcResult<Value> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.calls
            .send(PendingCall {
                request,
                reply: reply_tx,
            })
            .await
            .map_err(|_| RpcError::Closed)?;
        reply_rx.await.map_err(|_| RpcError::Closed)?
    }
}

impl CommandChannel for RpcChannel {
    fn call(&self, request: RpcRequest) -> RpcResult<Value> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.calls
            .blocking_send(PendingCall {
                request,
                reply: reply_tx,
            })
            .map_err(|_| RpcError::Closed)?;
        reply_rx.blocking_recv().map_err(|_| RpcError::Closed)?
    }
}

struct ChannelWorker<S> {
    socket: WebSocketStream<S>,
    encoding: WireEncoding,
    timeout: Option<Duration>,
    connection_id: u64,
}

impl<S> ChannelWorker<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn run(mut self, mut calls: mpsc::Receiver<PendingCall>) {
        loop {
            tokio::select! {
                call = calls.recv() => {
                    let Some(call) = call else {
                        debug!(
                            target: "domfs::rpc",
                            connection = self.connection_id,
                            "channel released; closing connection"
                        );
                        let _ = self.socket.close(None).await;
                        break;
                    };
                    let result = self.round_trip(&call.request).await;
                    let fatal = result.as_ref().err().is_some_and(RpcError::is_fatal);
                    if let Err(err) = &result {
                        warn!(
                            target: "domfs::rpc",
                            connection = self.connection_id,
                            cmd = %call.request.cmd,
                            %err,
                            "rpc failed"
                        );
                    }
                    let _ = call.reply.send(result);
                    if fatal {
                        let _ = self.socket.close(None).await;
                        break;
                    }
                }
                frame = self.socket.next() => match frame {
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) | None => {
                        info!(
                            target: "domfs::rpc",
                            connection = self.connection_id,
                            "agent disconnected"
                        );
                        break;
                    }
                    Some(Ok(_)) => {
                        warn!(
                            target: "domfs::rpc",
                            connection = self.connection_id,
                            "discarding unsolicited frame from agent"
                        );
                    }
                    Some(Err(err)) => {
                        info!(
                            target: "domfs::rpc",
                            connection = self.connection_id,
                            error = %RpcError::from(err),
                            "connection lost"
                        );
                        break;
                    }
                },
            }
        }
    }

    async fn round_trip(&mut self, request: &RpcRequest) -> RpcResult<Value> {
        let frame = self.encoding.encode_request(request)?;
        // `send` flushes, so the whole frame has left our buffers on return.
        self.socket.send(Message::Text(frame)).await?;

        let payload = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, self.next_payload())
                .await
                .map_err(|_| RpcError::Timeout(limit))??,
            None => self.next_payload().await?,
        };
        debug!(
            target: "domfs::rpc",
            connection = self.connection_id,
            cmd = %request.cmd,
            bytes = payload.len(),
            "reply received"
        );
        Ok(self.encoding.decode_response(&payload)?)
    }

    async fn next_payload(&mut self) -> RpcResult<Vec<u8>> {
        loop {
            match self.socket.next().await {
                Some(Ok(Message::Text(text))) => return Ok(text.into_bytes()),
                Some(Ok(Message::Binary(bytes))) => return Ok(bytes),
                Some(Ok(Message::Close(_))) | None => return Err(RpcError::Closed),
                Some(Ok(_)) => continue,
                Some(Err(err)) => return Err(err.into()),
            }
        }
    }
}
