//! Error Types

use nix::errno::Errno;

#[derive(thiserror::Error, Clone, Debug, PartialEq, Eq)]
pub enum PayloadError {
    #[error("not enough data for payload, got = {0}, expected = {1}")]
    NotEnoughData(usize, usize),

    #[error("memory table declares {0} regions, maximum is 8")]
    BadRegionCount(u32),
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum MemoryError {
    #[error("no memory has been mapped")]
    NoMappedMemory,

    #[error("memory map is full")]
    TooManyRegions,

    #[error("region overlaps an existing mapping: gpa 0x{0:08x}")]
    Overlap(u64),

    #[error("region is empty or wraps the address space: gpa 0x{0:08x}")]
    BadRegion(u64),

    #[error("region is not page-aligned: gpa 0x{0:08x}")]
    Misaligned(u64),

    #[error("guest range is not mapped: gpa 0x{0:08x}, len {1}")]
    NotMapped(u64, u32),

    #[error("guest range is not writable: gpa 0x{0:08x}, len {1}")]
    WriteProtected(u64, u32),

    #[error("no mapping found for master address 0x{0:08x}")]
    NoGuestMapping(u64),

    #[error("mmap: {0}")]
    Mmap(#[from] Errno),
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum QueueError {
    #[error("queue size {0} is not a power of two within limits")]
    InvalidSize(u16),

    #[error("{0} ring at gpa 0x{1:08x} is misaligned")]
    MisalignedRing(&'static str, u64),

    #[error("memory: {0}")]
    Memory(#[from] MemoryError),
}

/// Protocol-fatal conditions. Any of these drops the master connection
/// and resets the device.
#[derive(thiserror::Error, Debug)]
pub enum MessageError {
    #[error("error: {0}")]
    Errno(#[from] Errno),

    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),

    #[error("payload: {0}")]
    Payload(#[from] PayloadError),

    #[error("memory: {0}")]
    Memory(#[from] MemoryError),

    #[error("queue: {0}")]
    Queue(#[from] QueueError),

    #[error("device: {0}")]
    Device(#[from] DeviceError),

    #[error("short message header, got {0} bytes")]
    ShortHeader(usize),

    #[error("short message payload, got = {0}, expected = {1}")]
    ShortPayload(usize, usize),

    #[error("message payload of {0} bytes exceeds the limit")]
    PayloadTooLarge(u32),

    #[error("malformed ancillary data")]
    BadAncillary,

    #[error("master attempted to start a second session")]
    SessionAlreadyStarted,

    #[error("master negotiated unknown feature bits 0x{0:016x}")]
    UnknownFeatures(u64),

    #[error("master negotiated unknown protocol feature bits 0x{0:016x}")]
    UnknownProtocolFeatures(u64),

    #[error("vring index {0} is out of range")]
    InvalidQueueIndex(u32),

    #[error("vring size {0} is out of range")]
    InvalidQueueSize(u32),

    #[error("message is missing a file descriptor")]
    MissingFd,

    #[error("memory table has {regions} regions but {fds} fds")]
    RegionCountMismatch { regions: usize, fds: usize },

    #[error("vring address logging is not supported")]
    LogAddressUnsupported,

    #[error("vring enable requires negotiated protocol features")]
    EnableWithoutProtocolFeatures,

    #[error("kicked vring could not be started: {0}")]
    VringStartFailed(#[source] QueueError),
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum DeviceError {
    #[error("block size {0} is not a nonzero multiple of 512")]
    BadBlockSize(u32),

    #[error("device has no capacity")]
    NoCapacity,

    #[error("driver negotiated unsupported device features 0x{0:016x}")]
    UnsupportedFeatures(u64),

    #[error("config space window {0}+{1} is out of bounds")]
    BadConfigWindow(u32, u32),
}

/// Outcome of a single request handler.
///
/// `Failed` is handled-with-error: the connection stays up and the errno is
/// surfaced through a REPLY_ACK payload when the master asked for one.
/// `Fatal` resets the device.
#[derive(thiserror::Error, Debug)]
pub enum HandlerError {
    #[error("request failed: {0}")]
    Failed(Errno),

    #[error("fatal: {0}")]
    Fatal(#[from] MessageError),
}

impl From<PayloadError> for HandlerError {
    fn from(err: PayloadError) -> Self {
        HandlerError::Fatal(MessageError::Payload(err))
    }
}

impl From<MemoryError> for HandlerError {
    fn from(err: MemoryError) -> Self {
        HandlerError::Fatal(MessageError::Memory(err))
    }
}

impl From<QueueError> for HandlerError {
    fn from(err: QueueError) -> Self {
        HandlerError::Fatal(MessageError::Queue(err))
    }
}

impl From<DeviceError> for HandlerError {
    fn from(err: DeviceError) -> Self {
        HandlerError::Fatal(MessageError::Device(err))
    }
}
