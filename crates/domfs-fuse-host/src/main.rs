// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! DomFS FUSE host: mounts browser DOM trees as filesystems
//!
//! Browser agents connect over WebSocket; each connection is mounted at
//! `<mount-base>.<connection id>` until the agent leaves or the host stops.

mod adapter;
mod mountpoint;
mod server;

use anyhow::{Context, Result};
use clap::Parser;
use domfs_core::DomFsConfig;
use domfs_logging::CliLoggingArgs;
use server::MountServer;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "domfs-fuse-host", version, about = "Mount browser DOM trees over FUSE")]
struct Args {
    /// Port browser agents connect to
    port: Option<u16>,

    /// Mount base; connection N is mounted at <MOUNT_BASE>.N
    mount_base: Option<PathBuf>,

    /// Address to listen on
    #[arg(long)]
    host: Option<String>,

    /// Configuration file (JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Per-call reply deadline in milliseconds; 0 waits forever
    #[arg(long, env = "DOMFS_RPC_TIMEOUT_MS")]
    rpc_timeout_ms: Option<u64>,

    /// Allow other users to access the filesystems
    #[arg(long)]
    allow_other: bool,

    /// Allow root to access the filesystems
    #[arg(long)]
    allow_root: bool,

    /// Auto unmount on process exit
    #[arg(long)]
    auto_unmount: bool,

    #[command(flatten)]
    logging: CliLoggingArgs,
}

impl Args {
    /// Command-line values win over the config file.
    fn apply_to(&self, config: &mut DomFsConfig) {
        if let Some(port) = self.port {
            config.listen.port = port;
        }
        if let Some(host) = &self.host {
            config.listen.host = host.clone();
        }
        if let Some(base) = &self.mount_base {
            config.mount.base = base.clone();
        }
        if let Some(timeout_ms) = self.rpc_timeout_ms {
            config.rpc.timeout_ms = timeout_ms;
        }
        config.mount.allow_other |= self.allow_other;
        config.mount.allow_root |= self.allow_root;
        config.mount.auto_unmount |= self.auto_unmount;
    }
}

/// Process exit status
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum HostExit {
    Shutdown = 0,
    Failure = 1,
    Bind = 2,
    MountBase = 3,
    Config = 4,
}

impl From<HostExit> for ExitCode {
    fn from(exit: HostExit) -> Self {
        ExitCode::from(exit as u8)
    }
}

fn load_config(config_path: Option<&Path>) -> Result<DomFsConfig> {
    match config_path {
        Some(path) => {
            let content = fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            let config: DomFsConfig = serde_json::from_str(&content)
                .with_context(|| format!("parsing {}", path.display()))?;
            Ok(config)
        }
        None => Ok(DomFsConfig::default()),
    }
}

/// Mount directories are created next to the base, so its parent must be a
/// directory.
fn check_mount_base(base: &Path) -> Result<()> {
    let parent = match base.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let meta = fs::metadata(parent)
        .with_context(|| format!("mount base parent {} is not accessible", parent.display()))?;
    anyhow::ensure!(
        meta.is_dir(),
        "mount base parent {} is not a directory",
        parent.display()
    );
    Ok(())
}

fn main() -> ExitCode {
    let args = Args::parse();

    if let Err(err) = args.logging.clone().init("domfs-fuse-host") {
        eprintln!("failed to initialise logging: {err:#}");
        return HostExit::Failure.into();
    }

    run(&args).into()
}

fn run(args: &Args) -> HostExit {
    info!("Starting DomFS FUSE Host");

    let mut config = match load_config(args.config.as_deref()) {
        Ok(config) => config,
        Err(err) => {
            error!("configuration failed: {err:#}");
            return HostExit::Config;
        }
    };
    args.apply_to(&mut config);
    info!(?config, "Configuration loaded");

    if let Err(err) = check_mount_base(&config.mount.base) {
        error!("mount base unusable: {err:#}");
        return HostExit::MountBase;
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(err) => {
            error!(%err, "failed to start runtime");
            return HostExit::Failure;
        }
    };
    runtime.block_on(serve(config))
}

async fn serve(config: DomFsConfig) -> HostExit {
    let server = Arc::new(MountServer::new(config));
    let listener = match server.bind().await {
        Ok(listener) => listener,
        Err(err) => {
            error!(%err, "bind failed");
            return HostExit::Bind;
        }
    };
    server.serve(listener, shutdown_signal()).await;
    info!("DomFS FUSE host stopped");
    HostExit::Shutdown
}

async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
        }
        Err(err) => {
            warn!(%err, "SIGTERM handler unavailable; stopping on Ctrl-C only");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}
