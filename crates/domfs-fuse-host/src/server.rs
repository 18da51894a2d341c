// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Connection listener and per-connection mount lifecycle
//!
//! Every accepted agent gets its own task, mount directory, RPC channel and
//! FUSE session. A session ends when the filesystem is unmounted from outside,
//! the agent disconnects, or the server shuts down; the mount directory is
//! removed in all three cases.

use crate::adapter::DomFsFuse;
use crate::mountpoint::{MountDir, MountError, MountRegistry};
use domfs_core::{DomFsConfig, DomOps, RpcChannel};
use domfs_proto::WireEncoding;
use fuser::MountOption;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};

#[derive(thiserror::Error, Debug)]
pub enum ServerError {
    #[error("cannot listen on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },
}

/// Lifecycle of one agent connection
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Accepted,
    MountDirReady,
    FuseRunning,
    Unmounted,
    Closed,
}

impl SessionState {
    pub fn can_advance_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Accepted, MountDirReady)
                | (Accepted, Closed)
                | (MountDirReady, FuseRunning)
                | (MountDirReady, Closed)
                | (FuseRunning, Unmounted)
                | (Unmounted, Closed)
        )
    }
}

struct SessionTracker {
    connection: u64,
    state: SessionState,
}

impl SessionTracker {
    fn new(connection: u64) -> Self {
        Self {
            connection,
            state: SessionState::Accepted,
        }
    }

    fn advance(&mut self, next: SessionState) {
        debug_assert!(
            self.state.can_advance_to(next),
            "invalid session transition {:?} -> {next:?}",
            self.state
        );
        debug!(
            target: "domfs::server",
            connection = self.connection,
            from = ?self.state,
            to = ?next,
            "session state"
        );
        self.state = next;
    }
}

/// Why a running FUSE session stopped
#[derive(Debug)]
enum SessionEnd {
    Unmounted,
    AgentGone,
    Shutdown,
}

pub fn mount_options(config: &DomFsConfig) -> Vec<MountOption> {
    let mut options = vec![
        MountOption::FSName("domfs".to_string()),
        MountOption::Subtype("domfs".to_string()),
    ];
    if config.mount.allow_other {
        options.push(MountOption::AllowOther);
    }
    if config.mount.allow_root {
        options.push(MountOption::AllowRoot);
    }
    if config.mount.auto_unmount {
        options.push(MountOption::AutoUnmount);
    }
    options
}

pub struct MountServer {
    config: DomFsConfig,
    registry: MountRegistry,
    next_connection: AtomicU64,
}

impl MountServer {
    pub fn new(config: DomFsConfig) -> Self {
        Self {
            config,
            registry: MountRegistry::new(),
            next_connection: AtomicU64::new(1),
        }
    }

    #[cfg(test)]
    fn registry(&self) -> &MountRegistry {
        &self.registry
    }

    pub async fn bind(&self) -> Result<TcpListener, ServerError> {
        let addr = format!("{}:{}", self.config.listen.host, self.config.listen.port);
        TcpListener::bind(&addr).await.map_err(|source| ServerError::Bind { addr, source })
    }

    /// Accept agents until `shutdown` resolves, then unmount every live
    /// session and wait for them to finish.
    pub async fn serve<F>(self: Arc<Self>, listener: TcpListener, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        let (stop_tx, stop_rx) = watch::channel(false);
        let mut sessions = JoinSet::new();
        tokio::pin!(shutdown);

        if let Ok(addr) = listener.local_addr() {
            info!(target: "domfs::server", %addr, base = %self.config.mount.base.display(), "listening for agents");
        }

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let connection = self.next_connection.fetch_add(1, Ordering::Relaxed);
                        let server = Arc::clone(&self);
                        let stop = stop_rx.clone();
                        sessions.spawn(async move {
                            server.handle_connection(stream, peer, connection, stop).await;
                        });
                    }
                    Err(err) => warn!(target: "domfs::server", %err, "accept failed"),
                },
                Some(joined) = sessions.join_next(), if !sessions.is_empty() => {
                    if let Err(err) = joined {
                        error!(target: "domfs::server", %err, "session task failed");
                    }
                }
            }
        }

        info!(target: "domfs::server", live = sessions.len(), "shutting down");
        let _ = stop_tx.send(true);
        while let Some(joined) = sessions.join_next().await {
            if let Err(err) = joined {
                error!(target: "domfs::server", %err, "session task failed");
            }
        }
    }

    async fn handle_connection(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
        connection: u64,
        stop: watch::Receiver<bool>,
    ) {
        let mut tracker = SessionTracker::new(connection);

        let mut encoding = WireEncoding::Json;
        let negotiate = |request: &Request, mut response: Response| -> Result<Response, ErrorResponse> {
            let offered = request
                .headers()
                .get_all(SEC_WEBSOCKET_PROTOCOL)
                .iter()
                .filter_map(|value| value.to_str().ok());
            encoding = WireEncoding::negotiate(offered);
            if let Some(protocol) = encoding.subprotocol() {
                response
                    .headers_mut()
                    .insert(SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static(protocol));
            }
            Ok(response)
        };
        let mut socket = match tokio_tungstenite::accept_hdr_async(stream, negotiate).await {
            Ok(socket) => socket,
            Err(err) => {
                warn!(target: "domfs::server", connection, %peer, %err, "websocket handshake failed");
                tracker.advance(SessionState::Closed);
                return;
            }
        };
        info!(target: "domfs::server", connection, %peer, ?encoding, "agent connected");

        let path = MountRegistry::mount_path(&self.config.mount.base, connection);
        let mount_dir = match self.registry.claim(path) {
            Ok(dir) => dir,
            Err(err) => {
                match &err {
                    MountError::Busy(path) => warn!(
                        target: "domfs::mount",
                        connection,
                        %err,
                        owned_by_host = self.registry.is_active(path),
                        "mount busy"
                    ),
                    MountError::Io { .. } => error!(target: "domfs::mount", connection, %err, "mount directory unavailable"),
                }
                let _ = socket.close(None).await;
                tracker.advance(SessionState::Closed);
                return;
            }
        };
        tracker.advance(SessionState::MountDirReady);

        self.run_session(socket, encoding, mount_dir, &mut tracker, stop).await;
    }

    /// Mount `mount_dir` for an agent and serve it until the session ends.
    /// The directory is released on every path out, mounted or not.
    async fn run_session<S>(
        &self,
        socket: WebSocketStream<S>,
        encoding: WireEncoding,
        mount_dir: MountDir,
        tracker: &mut SessionTracker,
        mut stop: watch::Receiver<bool>,
    ) where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let connection = tracker.connection;
        let (channel, closed) =
            RpcChannel::spawn(socket, encoding, self.config.rpc.timeout(), connection);
        let filesystem = DomFsFuse::new(DomOps::new(channel), &self.config.cache);

        // Mounting may exec fusermount, so keep it off the runtime threads.
        let mount_path = mount_dir.path().to_path_buf();
        let options = mount_options(&self.config);
        let mounted = tokio::task::spawn_blocking(move || {
            fuser::Session::new(filesystem, &mount_path, &options)
        })
        .await
        .unwrap_or_else(|err| Err(io::Error::other(err)));
        let mut session = match mounted {
            Ok(session) => session,
            Err(err) => {
                error!(
                    target: "domfs::mount",
                    connection,
                    path = %mount_dir.path().display(),
                    %err,
                    "mount failed"
                );
                // The filesystem owned the only channel handle, so the worker
                // is already closing the agent's socket.
                closed.wait().await;
                drop(mount_dir);
                tracker.advance(SessionState::Closed);
                return;
            }
        };
        let mut unmounter = session.unmount_callable();
        tracker.advance(SessionState::FuseRunning);
        info!(target: "domfs::mount", connection, path = %mount_dir.path().display(), "mounted");

        let mut fuse_loop = tokio::task::spawn_blocking(move || session.run());
        let agent_gone = closed.wait();
        tokio::pin!(agent_gone);

        let end = tokio::select! {
            finished = &mut fuse_loop => {
                if let Ok(Err(err)) = finished {
                    warn!(target: "domfs::fuse", connection, %err, "FUSE loop exited with error");
                }
                None
            }
            _ = &mut agent_gone => Some(SessionEnd::AgentGone),
            _ = stop.changed() => Some(SessionEnd::Shutdown),
        };
        let end = match end {
            None => SessionEnd::Unmounted,
            Some(reason) => {
                let unmounted = tokio::task::spawn_blocking(move || unmounter.unmount()).await;
                match unmounted {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => warn!(target: "domfs::mount", connection, %err, "unmount failed"),
                    Err(err) => warn!(target: "domfs::mount", connection, %err, "unmount task failed"),
                }
                if let Err(err) = fuse_loop.await {
                    warn!(target: "domfs::mount", connection, %err, "FUSE loop task failed");
                }
                reason
            }
        };
        tracker.advance(SessionState::Unmounted);
        info!(target: "domfs::mount", connection, reason = ?end, "session ended");

        drop(mount_dir);
        tracker.advance(SessionState::Closed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use std::time::Duration;
    use tokio_tungstenite::tungstenite::client::IntoClientRequest;
    use tokio_tungstenite::tungstenite::protocol::Role;
    use tokio_tungstenite::tungstenite::Message;

    #[test]
    fn session_transitions() {
        use SessionState::*;
        assert!(Accepted.can_advance_to(MountDirReady));
        assert!(Accepted.can_advance_to(Closed));
        assert!(MountDirReady.can_advance_to(FuseRunning));
        assert!(FuseRunning.can_advance_to(Unmounted));
        assert!(Unmounted.can_advance_to(Closed));

        assert!(!Accepted.can_advance_to(FuseRunning));
        assert!(!FuseRunning.can_advance_to(Closed));
        assert!(!Closed.can_advance_to(Accepted));
        assert!(!Unmounted.can_advance_to(FuseRunning));
    }

    #[test]
    fn mount_options_follow_config() {
        let mut config = DomFsConfig::default();
        assert_eq!(
            mount_options(&config),
            vec![
                MountOption::FSName("domfs".to_string()),
                MountOption::Subtype("domfs".to_string()),
            ]
        );
        config.mount.allow_other = true;
        config.mount.auto_unmount = true;
        let options = mount_options(&config);
        assert!(options.contains(&MountOption::AllowOther));
        assert!(options.contains(&MountOption::AutoUnmount));
        assert!(!options.contains(&MountOption::AllowRoot));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn bind_failure_is_reported() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut config = DomFsConfig::default();
        config.listen.port = taken.local_addr().unwrap().port();
        let err = MountServer::new(config).bind().await.unwrap_err();
        assert!(matches!(err, ServerError::Bind { .. }));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn busy_mount_closes_connection_without_mounting() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = DomFsConfig::default();
        config.listen.port = 0;
        config.mount.base = tmp.path().join("mnt");

        let server = Arc::new(MountServer::new(config));
        let busy_path = MountRegistry::mount_path(&tmp.path().join("mnt"), 1);
        let existing = server.registry().claim(busy_path.clone()).unwrap();
        std::fs::write(busy_path.join("marker"), b"keep").unwrap();

        let listener = server.bind().await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
        let serving = tokio::spawn(Arc::clone(&server).serve(listener, async move {
            let _ = shutdown_rx.await;
        }));

        let mut request = format!("ws://{addr}/").into_client_request().unwrap();
        request
            .headers_mut()
            .insert(SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static("base64"));
        let (mut agent, response) = tokio_tungstenite::connect_async(request).await.unwrap();
        assert_eq!(
            response.headers().get(SEC_WEBSOCKET_PROTOCOL).unwrap(),
            "base64"
        );

        let closed = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match agent.next().await {
                    None | Some(Err(_)) | Some(Ok(Message::Close(_))) => break,
                    Some(Ok(other)) => panic!("unexpected frame {other:?}"),
                }
            }
        })
        .await;
        assert!(closed.is_ok(), "busy session should close the connection");

        assert!(busy_path.is_dir());
        assert_eq!(std::fs::read(busy_path.join("marker")).unwrap(), b"keep");
        assert!(server.registry().is_active(&busy_path));

        let _ = shutdown_tx.send(());
        tokio::time::timeout(Duration::from_secs(5), serving)
            .await
            .unwrap()
            .unwrap();

        std::fs::remove_file(busy_path.join("marker")).unwrap();
        drop(existing);
        assert!(!busy_path.exists());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn failed_mount_releases_directory_and_closes_agent() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = DomFsConfig::default();
        config.mount.base = tmp.path().join("mnt");
        config.mount.auto_unmount = false;
        let server = MountServer::new(config);

        // The directory vanishes between claim and mount, so mounting fails.
        let path = MountRegistry::mount_path(&tmp.path().join("mnt"), 5);
        let mount_dir = server.registry().claim(path.clone()).unwrap();
        std::fs::remove_dir(&path).unwrap();

        let (host_io, agent_io) = tokio::io::duplex(64 * 1024);
        let host = WebSocketStream::from_raw_socket(host_io, Role::Server, None).await;
        let mut agent = WebSocketStream::from_raw_socket(agent_io, Role::Client, None).await;

        let mut tracker = SessionTracker::new(5);
        tracker.advance(SessionState::MountDirReady);
        let (_stop_tx, stop_rx) = watch::channel(false);
        tokio::time::timeout(
            Duration::from_secs(5),
            server.run_session(host, WireEncoding::Json, mount_dir, &mut tracker, stop_rx),
        )
        .await
        .expect("session should end when mounting fails");

        assert_eq!(tracker.state, SessionState::Closed);
        assert!(!server.registry().is_active(&path));
        assert!(!path.exists());

        let closed = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match agent.next().await {
                    None | Some(Err(_)) | Some(Ok(Message::Close(_))) => break,
                    Some(Ok(other)) => panic!("unexpected frame {other:?}"),
                }
            }
        })
        .await;
        assert!(closed.is_ok(), "agent socket should be closed after a failed mount");
    }
}
