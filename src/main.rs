//! utf8proxyfs - mount a directory with per-process GB18030/UTF-8 transcoding
//!
//! Usage:
//!   utf8proxyfs [--config config.json] [--mount-point <dir>] [--physical-path <dir>]
//!
//! Runs in the foreground until SIGINT or SIGTERM, then unmounts.

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;
use utf8proxyfs::{
    config::{Config, DEFAULT_CONFIG_FILE},
    filter::Filter,
    fs::{ProxyFs, ProxyFuse},
};

#[derive(Parser)]
#[command(name = "utf8proxyfs")]
#[command(version)]
#[command(about = "Proxy filesystem transcoding legacy GB18030 text to UTF-8 for selected processes")]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Mount point (overrides the configuration file)
    #[arg(short, long)]
    mount_point: Option<PathBuf>,

    /// Physical directory to expose (overrides the configuration file)
    #[arg(short, long)]
    physical_path: Option<PathBuf>,

    /// Allow other users to access the mount
    #[arg(long)]
    allow_other: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn main() {
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set subscriber: {}", e);
    }

    if let Err(e) = run(cli) {
        error!("{:#}", e);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = Config::load_or_default(&cli.config);
    if let Some(mount_point) = cli.mount_point {
        config.mount_point = mount_point;
    }
    if let Some(physical_path) = cli.physical_path {
        config.physical_path = physical_path;
    }
    config.allow_other |= cli.allow_other;

    info!(
        "Transcoding {:?} for processes {:?}",
        config.allowed_extensions, config.allowed_processes
    );

    let filter = Filter::from_config(&config);
    let proxy = Arc::new(ProxyFs::new(&config, filter));
    let fs = ProxyFuse::new(proxy);

    let mut options = vec![fuser::MountOption::FSName("utf8proxyfs".to_string())];
    if config.allow_other {
        options.push(fuser::MountOption::AllowOther);
    }

    info!("Starting mount to {:?}...", config.mount_point);
    let session = fuser::spawn_mount2(fs, &config.mount_point, &options).with_context(|| {
        format!(
            "Mount failed at {:?}. Make sure FUSE is installed, /dev/fuse is accessible \
             and the mount point is an existing empty directory.",
            config.mount_point
        )
    })?;
    info!(
        "Mounted {:?} to {:?} successfully",
        config.physical_path, config.mount_point
    );

    wait_for_shutdown()?;

    info!("Signal received, unmounting...");
    session.join();
    info!("Exiting.");
    Ok(())
}

/// Block until SIGINT or SIGTERM
fn wait_for_shutdown() -> anyhow::Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to start signal runtime")?;

    runtime.block_on(async {
        let mut terminate =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .context("Failed to install SIGTERM handler")?;

        tokio::select! {
            result = tokio::signal::ctrl_c() => result.context("Failed to listen for SIGINT")?,
            _ = terminate.recv() => {}
        }
        Ok::<(), anyhow::Error>(())
    })
}
