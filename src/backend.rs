//! Block storage backends

use std::{
    fs::{File, OpenOptions},
    io,
    os::unix::fs::FileExt,
    path::Path,
};

use crate::virtio::blk::SECTOR_SHIFT;

/// Storage consumed by the block device: positional reads and writes over a
/// flat array of 512-byte sectors.
pub trait BlockBackend {
    fn total_sectors(&self) -> u64;

    fn is_readonly(&self) -> bool;

    /// Fills `buf` from byte `offset`. Short reads are an error.
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()>;

    /// Writes all of `buf` at byte `offset`.
    fn write_at(&mut self, offset: u64, buf: &[u8]) -> io::Result<()>;

    fn flush(&mut self) -> io::Result<()>;
}

/// Disk-image file backend.
pub struct FileBackend {
    file: File,
    total_sectors: u64,
    readonly: bool,
}

impl FileBackend {
    /// Opens a disk image, falling back to read-only when the image is not
    /// writable. Images smaller than one sector are refused.
    pub fn open<P: AsRef<Path>>(path: P, force_readonly: bool) -> io::Result<Self> {
        let path = path.as_ref();

        let (file, readonly) = if force_readonly {
            (OpenOptions::new().read(true).open(path)?, true)
        } else {
            match OpenOptions::new().read(true).write(true).open(path) {
                Ok(file) => (file, false),
                Err(err) if err.kind() == io::ErrorKind::PermissionDenied => {
                    tracing::info!(?path, "disk image is not writable, using a read-only device");
                    (OpenOptions::new().read(true).open(path)?, true)
                }
                Err(err) => return Err(err),
            }
        };

        let total_sectors = file.metadata()?.len() >> SECTOR_SHIFT;
        if total_sectors == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "disk image holds no complete sectors",
            ));
        }

        Ok(Self {
            file,
            total_sectors,
            readonly,
        })
    }
}

impl BlockBackend for FileBackend {
    fn total_sectors(&self) -> u64 {
        self.total_sectors
    }

    fn is_readonly(&self) -> bool {
        self.readonly
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        self.file.read_exact_at(buf, offset)
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> io::Result<()> {
        if self.readonly {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "device is read-only",
            ));
        }
        self.file.write_all_at(buf, offset)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.sync_data()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn image(len: usize) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&vec![0u8; len]).unwrap();
        file
    }

    #[test]
    fn open_reports_sector_count() {
        let img = image(4096 + 100);
        let backend = FileBackend::open(img.path(), false).unwrap();
        // The 100-byte tail is not a complete sector
        assert_eq!(backend.total_sectors(), 8);
        assert!(!backend.is_readonly());
    }

    #[test]
    fn open_refuses_empty_image() {
        let img = image(100);
        assert!(FileBackend::open(img.path(), false).is_err());
    }

    #[test]
    fn read_write_roundtrip() {
        let img = image(8192);
        let mut backend = FileBackend::open(img.path(), false).unwrap();

        let data = vec![0xabu8; 1024];
        backend.write_at(512, &data).unwrap();
        backend.flush().unwrap();

        let mut readback = vec![0u8; 1024];
        backend.read_at(512, &mut readback).unwrap();
        assert_eq!(readback, data);
    }

    #[test]
    fn forced_readonly_rejects_writes() {
        let img = image(4096);
        let mut backend = FileBackend::open(img.path(), true).unwrap();
        assert!(backend.is_readonly());

        let err = backend.write_at(0, &[0u8; 512]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::PermissionDenied);

        let mut buf = [0u8; 512];
        backend.read_at(0, &mut buf).unwrap();
    }

    #[test]
    fn short_read_is_an_error() {
        let img = image(1024);
        let mut backend = FileBackend::open(img.path(), false).unwrap();
        let mut buf = vec![0u8; 2048];
        assert!(backend.read_at(0, &mut buf).is_err());
    }
}
