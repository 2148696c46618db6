//! OneMount daemon
//!
//! Loads the configuration, wires the synchronization core, mounts the FUSE
//! filesystem and runs until SIGINT/SIGTERM. Shutdown cancels the subsystems
//! in order, then unmounts; a stuck unmount is retried with exponential
//! backoff. Exit code 0 on a clean unmount, 1 otherwise.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use fuser::MountOption;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use onemount_core::config::Config;
use onemount_fs::realtime::RealtimeTransport;
use onemount_fs::OneMount;
use onemount_graph::GraphClient;

/// Unmount retry attempts before giving up.
const UNMOUNT_RETRIES: u32 = 5;

fn main() -> ExitCode {
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(Config::default_path);
    let config = Config::load_or_default(&config_path);

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.logging.level.clone())),
        )
        .init();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            error!(error = %e, "Failed to start async runtime");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(config)) {
        Ok(clean) if clean => ExitCode::SUCCESS,
        Ok(_) => ExitCode::FAILURE,
        Err(e) => {
            error!(error = %format!("{e:#}"), "Daemon failed");
            ExitCode::FAILURE
        }
    }
}

/// Runs the daemon; returns whether the unmount was clean.
async fn run(config: Config) -> anyhow::Result<bool> {
    let token = access_token(&config).context("loading access token")?;
    let client = Arc::new(GraphClient::new(token.clone()));

    let transport =
        RealtimeTransport::from_config(&config.delta.notification_url, &token);
    let mount_point = config.mount.mount_point.clone();
    std::fs::create_dir_all(&mount_point)
        .with_context(|| format!("creating mount point {}", mount_point.display()))?;

    let mut core = OneMount::init(config, client, transport)
        .await
        .context("initializing synchronization core")?;
    let filesystem = core.filesystem(tokio::runtime::Handle::current());
    let shutdown = core.spawn();

    let options = [
        MountOption::FSName("onemount".to_string()),
        MountOption::DefaultPermissions,
        MountOption::NoExec,
    ];
    let session = fuser::spawn_mount2(filesystem, &mount_point, &options)
        .with_context(|| format!("mounting at {}", mount_point.display()))?;
    info!(mount_point = %mount_point.display(), "Filesystem mounted");

    wait_for_signal().await;
    info!("Shutdown signal received");

    shutdown.stop().await;
    drop(session);

    Ok(verify_unmounted(&mount_point))
}

/// Blocks until SIGINT or SIGTERM.
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            warn!(error = %e, "Cannot listen for SIGTERM, falling back to SIGINT only");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

/// The bearer token the Graph client consumes. The refresh flow lives
/// outside this process; it drops the current token where we can read it.
fn access_token(config: &Config) -> anyhow::Result<String> {
    if let Ok(token) = std::env::var("ONEMOUNT_TOKEN") {
        if !token.is_empty() {
            return Ok(token);
        }
    }
    let token_path = config.cache.root.join("token");
    let token = std::fs::read_to_string(&token_path)
        .with_context(|| format!("reading token file {}", token_path.display()))?;
    let token = token.trim().to_string();
    anyhow::ensure!(!token.is_empty(), "token file is empty");
    Ok(token)
}

/// Confirms the kernel released the mount, nudging it with `fusermount -u`
/// under exponential backoff when it has not.
fn verify_unmounted(mount_point: &Path) -> bool {
    let mut delay = Duration::from_millis(250);
    for attempt in 0..=UNMOUNT_RETRIES {
        if !is_mounted(mount_point) {
            info!("Unmounted cleanly");
            return true;
        }
        if attempt == UNMOUNT_RETRIES {
            break;
        }
        warn!(attempt = attempt + 1, "Mount still present, retrying unmount");
        let _ = std::process::Command::new("fusermount3")
            .arg("-u")
            .arg(mount_point)
            .status()
            .or_else(|_| {
                std::process::Command::new("fusermount")
                    .arg("-u")
                    .arg(mount_point)
                    .status()
            });
        std::thread::sleep(delay);
        delay *= 2;
    }
    error!(mount_point = %mount_point.display(), "Unmount failed after retries");
    false
}

fn is_mounted(mount_point: &Path) -> bool {
    let Ok(mounts) = std::fs::read_to_string("/proc/mounts") else {
        return false;
    };
    let needle = mount_point.to_string_lossy();
    mounts
        .lines()
        .any(|line| line.split_whitespace().nth(1) == Some(needle.as_ref()))
}
