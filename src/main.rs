mod backend;
mod config;
mod error;
mod evloop;
mod memory;
mod vhost;
mod virtio;

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::Level;

use backend::{BlockBackend, FileBackend};
use config::{Config, DiskConfig};
use evloop::EventLoop;
use vhost::device::{bind_listener, Device};
use virtio::blk::VirtioBlk;

#[derive(Parser)]
pub(crate) struct Opts {
    /// Path to the disk image backing the device
    pub disk: Option<PathBuf>,

    /// Path to the unix socket the vhost-user master connects to
    #[arg(short, long, default_value = "/tmp/vhost-blkd.sock")]
    pub socket: PathBuf,

    /// Expose the disk as a read-only device
    #[arg(short, long)]
    pub readonly: bool,

    /// Number of virtqueues to expose
    #[arg(long, default_value_t = 1)]
    pub queues: u16,

    /// Path to a configuration file used instead of the flags above
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Control the level of output to stdout (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

impl Opts {
    fn into_config(self) -> Result<Config> {
        if let Some(path) = &self.config {
            return Config::load(path).context("unable to load configuration");
        }

        let Some(disk) = self.disk else {
            bail!("either a disk image or --config is required");
        };

        Ok(Config {
            socket: self.socket,
            queues: self.queues,
            disk: DiskConfig {
                path: disk,
                readonly: self.readonly,
                writeback: false,
                block_size: 512,
            },
        })
    }
}

fn run(opts: Opts) -> Result<()> {
    let cfg = opts.into_config()?;
    tracing::debug!(?cfg, "configuration");

    if cfg.queues == 0 {
        bail!("at least one queue is required");
    }

    let backend = FileBackend::open(&cfg.disk.path, cfg.disk.readonly)
        .with_context(|| format!("unable to open disk image {}", cfg.disk.path.display()))?;
    tracing::info!(
        sectors = backend.total_sectors(),
        readonly = backend.is_readonly(),
        "disk image ready"
    );

    let vblk = VirtioBlk::new(
        backend.total_sectors(),
        cfg.disk.block_size,
        backend.is_readonly(),
        cfg.disk.writeback,
    )?;

    if cfg.socket.exists() {
        std::fs::remove_file(&cfg.socket)?;
    }
    let listener = bind_listener(&cfg.socket)
        .with_context(|| format!("unable to bind {}", cfg.socket.display()))?;
    tracing::info!(socket = ?cfg.socket, "bound vhost-user socket");

    let mut evloop = EventLoop::new()?;
    let mut device = Device::new(listener, vblk, Box::new(backend), usize::from(cfg.queues));
    device.run(&mut evloop)?;

    Ok(())
}

fn main() {
    let opts = Opts::parse();

    let level = match opts.verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };

    tracing_subscriber::FmtSubscriber::builder()
        .with_max_level(level)
        .init();

    if let Err(error) = run(opts) {
        tracing::error!(?error, "unable to run vhost-blkd");
        std::process::exit(1);
    }
}
