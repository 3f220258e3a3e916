//! Configuration file module

use std::{
    fs::File,
    io,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize, Serialize)]
pub struct Config {
    pub socket: PathBuf,
    pub disk: DiskConfig,

    /// Number of virtqueues exposed to the master
    #[serde(default = "default_queues")]
    pub queues: u16,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct DiskConfig {
    pub path: PathBuf,

    #[serde(default)]
    pub readonly: bool,

    /// Advertise a writeback cache and honor flush requests
    #[serde(default)]
    pub writeback: bool,

    /// Optimal block size advertised to the guest
    #[serde(default = "default_block_size")]
    pub block_size: u32,
}

fn default_queues() -> u16 {
    1
}

fn default_block_size() -> u32 {
    512
}

impl Config {
    /// Loads a configuration file from disk
    pub fn load<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let f = File::open(path)?;
        let cfg: Config =
            serde_yaml::from_reader(f).map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_minimal_file() {
        let cfg: Config = serde_yaml::from_str(
            "socket: /run/vhost.sock\n\
             disk:\n\
             \x20 path: /var/lib/disk.img\n",
        )
        .unwrap();

        assert_eq!(cfg.socket, PathBuf::from("/run/vhost.sock"));
        assert_eq!(cfg.disk.path, PathBuf::from("/var/lib/disk.img"));
        assert!(!cfg.disk.readonly);
        assert_eq!(cfg.disk.block_size, 512);
        assert_eq!(cfg.queues, 1);
    }

    #[test]
    fn parses_device_options() {
        let cfg: Config = serde_yaml::from_str(
            "socket: /run/vhost.sock\n\
             queues: 4\n\
             disk:\n\
             \x20 path: /var/lib/disk.img\n\
             \x20 readonly: true\n\
             \x20 writeback: true\n\
             \x20 block_size: 4096\n",
        )
        .unwrap();

        assert_eq!(cfg.queues, 4);
        assert!(cfg.disk.readonly);
        assert!(cfg.disk.writeback);
        assert_eq!(cfg.disk.block_size, 4096);
    }
}
