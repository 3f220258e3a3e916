//! Virtio block device model
//!
//! Decodes descriptor chains into typed block requests. A well-formed chain
//! is a 16-byte read-only header, one or more data buffers, and a final
//! 1-byte writable status. Chains that don't fit the shape are dropped
//! silently: without a writable status byte there is no way to report an
//! error per-chain, and committing the head keeps the ring moving.

use std::ptr;

use crate::error::DeviceError;

use super::virtqueue::{DescChain, Virtqueue};

pub const SECTOR_SHIFT: u32 = 9;
pub const SECTOR_SIZE: u32 = 1 << SECTOR_SHIFT;

/// Length of the id string returned by GET_ID requests
pub const DEVICE_ID_BYTES: usize = 20;

/// Size of the virtio config space window served to the master
pub const CONFIG_SPACE_SIZE: usize = 256;
const REQUEST_HEADER_SIZE: u32 = 16;

const VIRTIO_BLK_T_IN: u32 = 0;
const VIRTIO_BLK_T_OUT: u32 = 1;
const VIRTIO_BLK_T_FLUSH: u32 = 4;
const VIRTIO_BLK_T_GET_ID: u32 = 8;

/// Feature bits
pub const VIRTIO_BLK_F_RO: u64 = 1 << 5;
pub const VIRTIO_BLK_F_BLK_SIZE: u64 = 1 << 6;
pub const VIRTIO_BLK_F_FLUSH: u64 = 1 << 9;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IoKind {
    Read,
    Write,
    Flush,
    GetId,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum IoStatus {
    Ok = 0,
    IoError = 1,
}

/// One guest data buffer of a decoded request.
#[derive(Clone, Copy, Debug)]
pub struct IoVec {
    pub ptr: *mut u8,
    pub len: u32,
}

/// A decoded, validated block request.
///
/// Holds raw pointers into guest memory; it must be completed within the
/// same dispatch that dequeued it, before the memory table can change.
pub struct BlockRequest {
    pub kind: IoKind,
    pub sector: u64,
    pub total_sectors: u32,
    pub vecs: Vec<IoVec>,
    head: u16,
    status: *mut u8,
}

impl BlockRequest {
    /// Stores the completion status into the guest's status byte and
    /// publishes the chain head.
    pub fn complete(self, vq: &mut Virtqueue, status: IoStatus) {
        unsafe { ptr::write_volatile(self.status, status as u8) };
        vq.push_used(self.head, 0);
    }
}

/// Outcome of one dequeue attempt.
pub enum Dequeue {
    /// No chains available
    Empty,

    /// Queue is broken; stop processing until it is restarted
    Broken,

    /// A malformed chain was released without a status
    Dropped,

    Request(BlockRequest),
}

#[derive(Debug)]
pub struct VirtioBlk {
    /// Device capacity in 512-byte sectors
    total_sectors: u64,

    /// Optimal block size advertised through config space
    block_size: u32,

    supported_features: u64,
    features: u64,

    id: [u8; DEVICE_ID_BYTES],
}

impl VirtioBlk {
    pub fn new(
        total_sectors: u64,
        block_size: u32,
        readonly: bool,
        writeback: bool,
    ) -> Result<Self, DeviceError> {
        if block_size == 0 || block_size % SECTOR_SIZE != 0 {
            return Err(DeviceError::BadBlockSize(block_size));
        }

        if total_sectors == 0 {
            return Err(DeviceError::NoCapacity);
        }

        let mut supported_features = VIRTIO_BLK_F_BLK_SIZE;
        if readonly {
            supported_features |= VIRTIO_BLK_F_RO;
        }
        if writeback {
            supported_features |= VIRTIO_BLK_F_FLUSH;
        }

        let mut id = [0u8; DEVICE_ID_BYTES];
        let name = env!("CARGO_PKG_NAME").as_bytes();
        let len = name.len().min(DEVICE_ID_BYTES);
        id[..len].copy_from_slice(&name[..len]);

        Ok(Self {
            total_sectors,
            block_size,
            supported_features,
            features: 0,
            id,
        })
    }

    pub fn supported_features(&self) -> u64 {
        self.supported_features
    }

    pub fn set_features(&mut self, features: u64) -> Result<(), DeviceError> {
        if features & !self.supported_features != 0 {
            return Err(DeviceError::UnsupportedFeatures(features));
        }

        self.features = features;
        Ok(())
    }

    pub fn reset_features(&mut self) {
        if self.features != 0 {
            tracing::debug!("clearing negotiated device features 0x{:08x}", self.features);
        }
        self.features = 0;
    }

    pub fn device_id(&self) -> &[u8; DEVICE_ID_BYTES] {
        &self.id
    }

    /// Copies a window of the device config space into `buf`.
    pub fn read_config(&self, offset: u32, buf: &mut [u8]) -> Result<(), DeviceError> {
        let size = buf.len() as u32;
        if size == 0 || u64::from(offset) + u64::from(size) > CONFIG_SPACE_SIZE as u64 {
            return Err(DeviceError::BadConfigWindow(offset, size));
        }

        let mut cfg = [0u8; CONFIG_SPACE_SIZE];
        cfg[0..8].copy_from_slice(&self.total_sectors.to_le_bytes());
        cfg[20..24].copy_from_slice(&self.block_size.to_le_bytes());

        let offset = offset as usize;
        buf.copy_from_slice(&cfg[offset..offset + buf.len()]);
        Ok(())
    }

    /// Pulls the next chain off the queue and decodes it.
    pub fn dequeue(&self, vq: &mut Virtqueue) -> Dequeue {
        if vq.is_broken() {
            return Dequeue::Broken;
        }

        let Some(mut chain) = vq.dequeue() else {
            return Dequeue::Empty;
        };

        let head = chain.head();
        match self.parse_chain(&mut chain) {
            Some(request) => Dequeue::Request(request),
            None => {
                drop(chain);
                vq.push_used(head, 0);
                Dequeue::Dropped
            }
        }
    }

    fn parse_chain(&self, chain: &mut DescChain) -> Option<BlockRequest> {
        let hdr_buf = chain.next_buffer()?;
        if hdr_buf.len != REQUEST_HEADER_SIZE || !hdr_buf.ro {
            return None;
        }

        // Copy the header out before looking at it; the guest can rewrite
        // its memory under us at any point.
        let mut hdr = [0u8; REQUEST_HEADER_SIZE as usize];
        unsafe { ptr::copy_nonoverlapping(hdr_buf.ptr as *const u8, hdr.as_mut_ptr(), hdr.len()) };

        let ty = u32::from_le_bytes([hdr[0], hdr[1], hdr[2], hdr[3]]);
        let sector = u64::from_le_bytes([
            hdr[8], hdr[9], hdr[10], hdr[11], hdr[12], hdr[13], hdr[14], hdr[15],
        ]);

        match ty {
            VIRTIO_BLK_T_IN => self.parse_rw(chain, IoKind::Read, sector),
            VIRTIO_BLK_T_OUT => self.parse_rw(chain, IoKind::Write, sector),
            VIRTIO_BLK_T_FLUSH => self.parse_flush(chain),
            VIRTIO_BLK_T_GET_ID => self.parse_get_id(chain),
            _ => None,
        }
    }

    fn parse_rw(&self, chain: &mut DescChain, kind: IoKind, sector: u64) -> Option<BlockRequest> {
        if sector >= self.total_sectors {
            return None;
        }

        let mut vecs = Vec::new();
        let mut total_sectors: u32 = 0;
        let mut status = None;

        while let Some(buf) = chain.next_buffer() {
            if !chain.has_next() {
                // The last buffer carries the status byte
                if buf.len != 1 || buf.ro {
                    return None;
                }
                status = Some(buf.ptr);
                break;
            }

            if buf.len % SECTOR_SIZE != 0 {
                return None;
            }

            // Reads fill guest buffers; writes only consume them
            match kind {
                IoKind::Read if buf.ro => return None,
                IoKind::Write if !buf.ro => return None,
                _ => {}
            }

            total_sectors = total_sectors.checked_add(buf.len >> SECTOR_SHIFT)?;
            if sector.checked_add(u64::from(total_sectors))? > self.total_sectors {
                return None;
            }

            vecs.push(IoVec {
                ptr: buf.ptr,
                len: buf.len,
            });
        }

        if total_sectors == 0 {
            return None;
        }

        Some(BlockRequest {
            kind,
            sector,
            total_sectors,
            vecs,
            head: chain.head(),
            status: status?,
        })
    }

    fn parse_flush(&self, chain: &mut DescChain) -> Option<BlockRequest> {
        let status = chain.next_buffer()?;
        if chain.has_next() || status.len != 1 || status.ro {
            return None;
        }

        Some(BlockRequest {
            kind: IoKind::Flush,
            sector: 0,
            total_sectors: 0,
            vecs: Vec::new(),
            head: chain.head(),
            status: status.ptr,
        })
    }

    fn parse_get_id(&self, chain: &mut DescChain) -> Option<BlockRequest> {
        let mut vecs = Vec::new();
        let mut status = None;

        while let Some(buf) = chain.next_buffer() {
            if !chain.has_next() {
                if buf.len != 1 || buf.ro {
                    return None;
                }
                status = Some(buf.ptr);
                break;
            }

            // The id string is written into the buffer
            if buf.ro {
                return None;
            }

            vecs.push(IoVec {
                ptr: buf.ptr,
                len: buf.len,
            });
        }

        if vecs.is_empty() {
            return None;
        }

        Some(BlockRequest {
            kind: IoKind::GetId,
            sector: 0,
            total_sectors: 0,
            vecs,
            head: chain.head(),
            status: status?,
        })
    }
}
