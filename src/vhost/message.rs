//! Vhost-user wire format
//!
//! Every message starts with a 12-byte little-endian header followed by a
//! request-specific payload. File descriptors ride along in a single
//! SCM_RIGHTS control block.

use bitflags::bitflags;

use crate::{error::PayloadError, memory::RegionDescriptor};

/// Upper bound on fds attached to a single message
pub const VHOST_USER_MAX_FDS: usize = 8;

pub const HEADER_SIZE: usize = 12;

/// Generous bound on payload size; every known payload is far smaller.
pub const MAX_PAYLOAD_SIZE: u32 = 4096;

/// Virtio feature bit advertising protocol-feature support
pub const VHOST_USER_F_PROTOCOL_FEATURES: u64 = 1 << 30;

/// Header flag bits
pub const VHOST_USER_VERSION_MASK: u32 = 0x3;
pub const VHOST_USER_VERSION_1: u32 = 0x1;
pub const VHOST_USER_FLAG_REPLY: u32 = 1 << 2;
pub const VHOST_USER_FLAG_NEED_REPLY: u32 = 1 << 3;

/// Vring index / invalid-fd encoding used by the kick/call/err payloads
pub const VRING_IDX_MASK: u64 = 0xff;
pub const VRING_NOFD_MASK: u64 = 0x100;

/// Log-address flag in a vring address payload
pub const VRING_ADDR_F_LOG: u32 = 0x1;

bitflags! {
    /// Protocol features this backend understands
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct ProtocolFeatures: u64 {
        const MQ = 1 << 0;
        const REPLY_ACK = 1 << 3;
        const CONFIG = 1 << 9;
        const RESET_DEVICE = 1 << 13;
    }
}

/// Request codes of the vhost-user protocol.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Request {
    GetFeatures = 1,
    SetFeatures = 2,
    SetOwner = 3,
    ResetOwner = 4,
    SetMemTable = 5,
    SetLogBase = 6,
    SetLogFd = 7,
    SetVringNum = 8,
    SetVringAddr = 9,
    SetVringBase = 10,
    GetVringBase = 11,
    SetVringKick = 12,
    SetVringCall = 13,
    SetVringErr = 14,
    GetProtocolFeatures = 15,
    SetProtocolFeatures = 16,
    GetQueueNum = 17,
    SetVringEnable = 18,
    SendRarp = 19,
    NetSetMtu = 20,
    SetSlaveReqFd = 21,
    IotlbMsg = 22,
    SetVringEndian = 23,
    GetConfig = 24,
    SetConfig = 25,
    CreateCryptoSession = 26,
    CloseCryptoSession = 27,
    PostcopyAdvise = 28,
    PostcopyListen = 29,
    PostcopyEnd = 30,
    GetInflightFd = 31,
    SetInflightFd = 32,
    GpuSetSocket = 33,
    ResetDevice = 34,
    VringKick = 35,
    GetMaxMemSlots = 36,
    AddMemReg = 37,
    RemMemReg = 38,
    SetStatus = 39,
    GetStatus = 40,
}

impl Request {
    pub fn from_raw(raw: u32) -> Option<Self> {
        let req = match raw {
            1 => Self::GetFeatures,
            2 => Self::SetFeatures,
            3 => Self::SetOwner,
            4 => Self::ResetOwner,
            5 => Self::SetMemTable,
            6 => Self::SetLogBase,
            7 => Self::SetLogFd,
            8 => Self::SetVringNum,
            9 => Self::SetVringAddr,
            10 => Self::SetVringBase,
            11 => Self::GetVringBase,
            12 => Self::SetVringKick,
            13 => Self::SetVringCall,
            14 => Self::SetVringErr,
            15 => Self::GetProtocolFeatures,
            16 => Self::SetProtocolFeatures,
            17 => Self::GetQueueNum,
            18 => Self::SetVringEnable,
            19 => Self::SendRarp,
            20 => Self::NetSetMtu,
            21 => Self::SetSlaveReqFd,
            22 => Self::IotlbMsg,
            23 => Self::SetVringEndian,
            24 => Self::GetConfig,
            25 => Self::SetConfig,
            26 => Self::CreateCryptoSession,
            27 => Self::CloseCryptoSession,
            28 => Self::PostcopyAdvise,
            29 => Self::PostcopyListen,
            30 => Self::PostcopyEnd,
            31 => Self::GetInflightFd,
            32 => Self::SetInflightFd,
            33 => Self::GpuSetSocket,
            34 => Self::ResetDevice,
            35 => Self::VringKick,
            36 => Self::GetMaxMemSlots,
            37 => Self::AddMemReg,
            38 => Self::RemMemReg,
            39 => Self::SetStatus,
            40 => Self::GetStatus,
            _ => return None,
        };
        Some(req)
    }
}

/// Message header common to requests and replies.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Header {
    pub request: u32,
    pub flags: u32,
    pub size: u32,
}

impl Header {
    pub fn parse(buf: &[u8; HEADER_SIZE]) -> Self {
        Self {
            request: u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]),
            flags: u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
            size: u32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]),
        }
    }

    /// Builds the header of a reply to `request` carrying `size` bytes.
    pub fn reply(request: u32, size: u32) -> Self {
        Self {
            request,
            flags: VHOST_USER_VERSION_1 | VHOST_USER_FLAG_REPLY,
            size,
        }
    }

    pub fn to_bytes(self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..4].copy_from_slice(&self.request.to_le_bytes());
        buf[4..8].copy_from_slice(&self.flags.to_le_bytes());
        buf[8..12].copy_from_slice(&self.size.to_le_bytes());
        buf
    }

    /// Master demands an ack for this message (meaningful once REPLY_ACK has
    /// been negotiated).
    pub fn needs_reply_ack(&self) -> bool {
        self.flags & VHOST_USER_FLAG_NEED_REPLY != 0
    }
}

/// Helper trait to convert from a slice of bytes into a vhost-user payload
/// type.
pub trait TryFromPayload: Sized {
    /// Converts from a slice of bytes into a type, erroring if there is
    /// not enough data.
    fn try_from_payload(pkt: &[u8]) -> Result<Self, PayloadError>;
}

fn fetch<const N: usize>(pkt: &[u8], off: usize) -> Result<[u8; N], PayloadError> {
    pkt.get(off..off + N)
        .and_then(|s| s.try_into().ok())
        .ok_or(PayloadError::NotEnoughData(pkt.len(), off + N))
}

fn fetch_u32(pkt: &[u8], off: usize) -> Result<u32, PayloadError> {
    Ok(u32::from_le_bytes(fetch(pkt, off)?))
}

fn fetch_u64(pkt: &[u8], off: usize) -> Result<u64, PayloadError> {
    Ok(u64::from_le_bytes(fetch(pkt, off)?))
}

impl TryFromPayload for u64 {
    fn try_from_payload(pkt: &[u8]) -> Result<Self, PayloadError> {
        fetch_u64(pkt, 0)
    }
}

/// Vring state: `{ index, num }`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VringState {
    pub index: u32,
    pub num: u32,
}

impl VringState {
    pub fn to_bytes(self) -> [u8; 8] {
        let mut buf = [0u8; 8];
        buf[0..4].copy_from_slice(&self.index.to_le_bytes());
        buf[4..8].copy_from_slice(&self.num.to_le_bytes());
        buf
    }
}

impl TryFromPayload for VringState {
    fn try_from_payload(pkt: &[u8]) -> Result<Self, PayloadError> {
        Ok(Self {
            index: fetch_u32(pkt, 0)?,
            num: fetch_u32(pkt, 4)?,
        })
    }
}

/// Vring address payload. The ring addresses are in the master's address
/// space, not guest-physical.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VringAddr {
    pub index: u32,
    pub flags: u32,
    pub size: u64,
    pub descriptor: u64,
    pub used: u64,
    pub available: u64,
    pub log: u64,
}

impl TryFromPayload for VringAddr {
    fn try_from_payload(pkt: &[u8]) -> Result<Self, PayloadError> {
        Ok(Self {
            index: fetch_u32(pkt, 0)?,
            flags: fetch_u32(pkt, 4)?,
            size: fetch_u64(pkt, 8)?,
            descriptor: fetch_u64(pkt, 16)?,
            used: fetch_u64(pkt, 24)?,
            available: fetch_u64(pkt, 32)?,
            log: fetch_u64(pkt, 40)?,
        })
    }
}

/// Memory table: `{ num, pad, regions[] }`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MemTable {
    pub regions: Vec<RegionDescriptor>,
}

impl TryFromPayload for MemTable {
    fn try_from_payload(pkt: &[u8]) -> Result<Self, PayloadError> {
        let num = fetch_u32(pkt, 0)?;
        if num as usize > VHOST_USER_MAX_FDS {
            return Err(PayloadError::BadRegionCount(num));
        }

        let mut regions = Vec::with_capacity(num as usize);
        for i in 0..num as usize {
            let off = 8 + i * 32;
            regions.push(RegionDescriptor {
                guest_addr: fetch_u64(pkt, off)?,
                size: fetch_u64(pkt, off + 8)?,
                user_addr: fetch_u64(pkt, off + 16)?,
                mmap_offset: fetch_u64(pkt, off + 24)?,
            });
        }

        Ok(Self { regions })
    }
}

/// Device config space window: `{ offset, size, flags, payload[] }`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConfigSpace {
    pub offset: u32,
    pub size: u32,
    pub flags: u32,
    pub payload: Vec<u8>,
}

impl ConfigSpace {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(12 + self.payload.len());
        buf.extend_from_slice(&self.offset.to_le_bytes());
        buf.extend_from_slice(&self.size.to_le_bytes());
        buf.extend_from_slice(&self.flags.to_le_bytes());
        buf.extend_from_slice(&self.payload);
        buf
    }
}

impl TryFromPayload for ConfigSpace {
    fn try_from_payload(pkt: &[u8]) -> Result<Self, PayloadError> {
        let offset = fetch_u32(pkt, 0)?;
        let size = fetch_u32(pkt, 4)?;
        let flags = fetch_u32(pkt, 8)?;
        let payload = pkt.get(12..).unwrap_or_default().to_vec();
        Ok(Self {
            offset,
            size,
            flags,
            payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_roundtrip() {
        let hdr = Header {
            request: Request::GetFeatures as u32,
            flags: VHOST_USER_VERSION_1 | VHOST_USER_FLAG_NEED_REPLY,
            size: 8,
        };
        assert_eq!(Header::parse(&hdr.to_bytes()), hdr);
        assert!(hdr.needs_reply_ack());
    }

    #[test]
    fn reply_header_carries_version_and_reply_bits() {
        let hdr = Header::reply(Request::GetVringBase as u32, 8);
        assert_eq!(hdr.flags & VHOST_USER_VERSION_MASK, VHOST_USER_VERSION_1);
        assert_ne!(hdr.flags & VHOST_USER_FLAG_REPLY, 0);
        assert_eq!(hdr.size, 8);
    }

    #[test]
    fn request_codes_map_both_ways() {
        assert_eq!(Request::from_raw(5), Some(Request::SetMemTable));
        assert_eq!(Request::from_raw(18), Some(Request::SetVringEnable));
        assert_eq!(Request::from_raw(40), Some(Request::GetStatus));
        assert_eq!(Request::from_raw(0), None);
        assert_eq!(Request::from_raw(41), None);
    }

    #[test]
    fn u64_payload_parses_little_endian() {
        let pkt = 0x0102_0304_0506_0708u64.to_le_bytes();
        assert_eq!(u64::try_from_payload(&pkt).unwrap(), 0x0102_0304_0506_0708);
        assert_eq!(
            u64::try_from_payload(&pkt[..7]),
            Err(PayloadError::NotEnoughData(7, 8))
        );
    }

    #[test]
    fn vring_addr_payload_layout() {
        let mut pkt = Vec::new();
        pkt.extend_from_slice(&1u32.to_le_bytes());
        pkt.extend_from_slice(&0u32.to_le_bytes());
        pkt.extend_from_slice(&256u64.to_le_bytes());
        pkt.extend_from_slice(&0x7f00_0000_1000u64.to_le_bytes());
        pkt.extend_from_slice(&0x7f00_0000_2000u64.to_le_bytes());
        pkt.extend_from_slice(&0x7f00_0000_3000u64.to_le_bytes());
        pkt.extend_from_slice(&0u64.to_le_bytes());

        let addr = VringAddr::try_from_payload(&pkt).unwrap();
        assert_eq!(addr.index, 1);
        assert_eq!(addr.descriptor, 0x7f00_0000_1000);
        assert_eq!(addr.used, 0x7f00_0000_2000);
        assert_eq!(addr.available, 0x7f00_0000_3000);
    }

    #[test]
    fn mem_table_parses_declared_regions_only() {
        let mut pkt = Vec::new();
        pkt.extend_from_slice(&2u32.to_le_bytes());
        pkt.extend_from_slice(&0u32.to_le_bytes());
        for i in 0..2u64 {
            pkt.extend_from_slice(&(0x4000_0000 + i * 0x10_0000).to_le_bytes());
            pkt.extend_from_slice(&0x10_0000u64.to_le_bytes());
            pkt.extend_from_slice(&(0x7f00_0000_0000 + i * 0x10_0000).to_le_bytes());
            pkt.extend_from_slice(&0u64.to_le_bytes());
        }
        // Masters send the full fixed-size array; trailing entries are noise
        pkt.extend_from_slice(&[0xaa; 64]);

        let table = MemTable::try_from_payload(&pkt).unwrap();
        assert_eq!(table.regions.len(), 2);
        assert_eq!(table.regions[1].guest_addr, 0x4010_0000);
        assert_eq!(table.regions[1].user_addr, 0x7f00_0010_0000);
    }

    #[test]
    fn mem_table_rejects_too_many_regions() {
        let mut pkt = Vec::new();
        pkt.extend_from_slice(&9u32.to_le_bytes());
        pkt.extend_from_slice(&0u32.to_le_bytes());
        assert_eq!(
            MemTable::try_from_payload(&pkt),
            Err(PayloadError::BadRegionCount(9))
        );
    }

    #[test]
    fn config_space_roundtrip() {
        let cfg = ConfigSpace {
            offset: 0,
            size: 8,
            flags: 0,
            payload: vec![1, 2, 3, 4, 5, 6, 7, 8],
        };
        let parsed = ConfigSpace::try_from_payload(&cfg.to_bytes()).unwrap();
        assert_eq!(parsed, cfg);
    }
}
