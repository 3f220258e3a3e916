//! Vhost device: protocol state machine and transport
//!
//! One device serves one master at a time over a unix stream socket. The
//! event loop delivers readiness for the listen socket, the master
//! connection, and every installed kick fd; handlers run to completion.

use std::{
    collections::HashMap,
    io::{IoSlice, IoSliceMut},
    os::fd::{AsFd, AsRawFd, FromRawFd, OwnedFd, RawFd},
    os::unix::net::{UnixListener, UnixStream},
    ptr, slice,
    rc::Rc,
};

use nix::{
    errno::Errno,
    sys::{
        epoll::EpollFlags,
        socket::{self, ControlMessageOwned, MsgFlags},
    },
    unistd,
};

use crate::{
    backend::BlockBackend,
    error::{HandlerError, MemoryError, MessageError, QueueError},
    evloop::EventLoop,
    memory::GuestMemory,
    vhost::{
        message::{
            self, ConfigSpace, Header, MemTable, ProtocolFeatures, Request, TryFromPayload,
            VringAddr, VringState,
        },
        vring::Vring,
    },
    virtio::{
        blk::{BlockRequest, Dequeue, IoKind, IoStatus, VirtioBlk, SECTOR_SHIFT},
        virtqueue::VIRTQ_MAX_SIZE,
    },
};

/// Creates the listening socket: close-on-exec, backlog of one. A single
/// master is expected at a time.
pub fn bind_listener<P: AsRef<std::path::Path>>(path: P) -> std::io::Result<UnixListener> {
    use nix::sys::socket::{AddressFamily, Backlog, SockFlag, SockType, UnixAddr};

    let fd = socket::socket(
        AddressFamily::Unix,
        SockType::Stream,
        SockFlag::SOCK_CLOEXEC,
        None,
    )?;
    let addr = UnixAddr::new(path.as_ref())?;
    socket::bind(fd.as_raw_fd(), &addr)?;
    socket::listen(&fd, Backlog::new(1)?)?;

    Ok(UnixListener::from(fd))
}

/// What a poller token resolves to.
#[derive(Clone, Copy)]
enum FdKind {
    Listener,
    Connection,
    Kick(usize),
}

type HandlerResult = Result<Option<Vec<u8>>, HandlerError>;

/// These message types assume a slave reply regardless of REPLY_ACK.
fn assumes_reply(code: u32) -> bool {
    matches!(
        Request::from_raw(code),
        Some(
            Request::GetFeatures
                | Request::GetProtocolFeatures
                | Request::GetQueueNum
                | Request::GetVringBase
                | Request::GetConfig
                | Request::GetInflightFd
                | Request::SetLogBase
        )
    )
}

/// A vhost-user block device slave.
pub struct Device {
    listener: UnixListener,
    conn: Option<UnixStream>,

    /// Map of registered fds to what they mean to us
    fds: HashMap<RawFd, FdKind>,

    vrings: Vec<Vring>,
    mem: Option<Rc<GuestMemory>>,

    vblk: VirtioBlk,
    backend: Box<dyn BlockBackend>,

    has_protocol_features: bool,
    negotiated_protocol_features: u64,
    session_started: bool,
}

impl Device {
    pub fn new(
        listener: UnixListener,
        vblk: VirtioBlk,
        backend: Box<dyn BlockBackend>,
        num_queues: usize,
    ) -> Self {
        Self {
            listener,
            conn: None,
            fds: HashMap::new(),
            vrings: (0..num_queues).map(Vring::new).collect(),
            mem: None,
            vblk,
            backend,
            has_protocol_features: false,
            negotiated_protocol_features: 0,
            session_started: false,
        }
    }

    /// Serves masters until the event loop fails.
    pub fn run(&mut self, evloop: &mut EventLoop) -> Result<(), MessageError> {
        evloop.add_fd(&self.listener, EpollFlags::EPOLLIN | EpollFlags::EPOLLHUP)?;
        self.fds.insert(self.listener.as_raw_fd(), FdKind::Listener);

        tracing::info!("waiting for a vhost-user master");
        loop {
            let count = evloop.wait()?;
            for pos in 0..count {
                let (fd, events) = evloop.event(pos);
                if events.is_empty() {
                    // Deregistered earlier in this batch
                    continue;
                }
                self.dispatch(evloop, fd, events);
            }
        }
    }

    fn dispatch(&mut self, evloop: &mut EventLoop, fd: RawFd, events: EpollFlags) {
        match self.fds.get(&fd).copied() {
            Some(FdKind::Listener) => self.on_connect(evloop),
            Some(FdKind::Connection) => {
                if events.intersects(EpollFlags::EPOLLHUP | EpollFlags::EPOLLERR) {
                    tracing::info!("master disconnected");
                    self.reset(evloop);
                } else if let Err(error) = self.on_read_avail(evloop) {
                    tracing::warn!(%error, "dropping master connection");
                    self.reset(evloop);
                }
            }
            Some(FdKind::Kick(index)) => {
                if events.intersects(EpollFlags::EPOLLHUP | EpollFlags::EPOLLERR) {
                    tracing::debug!("[vring][{:02x}] kick fd hung up", index);
                    self.drop_kick(evloop, index);
                } else if let Err(error) = self.on_kick(index) {
                    tracing::warn!(%error, "[vring][{:02x}] kick failed, resetting", index);
                    self.reset(evloop);
                }
            }
            None => tracing::debug!(fd, "event for unknown fd"),
        }
    }

    fn on_connect(&mut self, evloop: &mut EventLoop) {
        let stream = match self.listener.accept() {
            Ok((stream, _)) => stream,
            Err(error) => {
                tracing::warn!(%error, "accept failed");
                return;
            }
        };

        // One master at a time; surplus connections are accepted and dropped
        if self.conn.is_some() {
            tracing::warn!("refusing a second master connection");
            return;
        }

        if let Err(error) = evloop.add_fd(&stream, EpollFlags::EPOLLIN | EpollFlags::EPOLLHUP) {
            tracing::warn!(%error, "unable to poll master connection");
            return;
        }

        tracing::info!("master connected");
        self.fds.insert(stream.as_raw_fd(), FdKind::Connection);
        self.conn = Some(stream);
    }

    fn conn_fd(&self) -> Result<RawFd, MessageError> {
        self.conn
            .as_ref()
            .map(|conn| conn.as_raw_fd())
            .ok_or(MessageError::Errno(Errno::ENOTCONN))
    }

    fn on_read_avail(&mut self, evloop: &mut EventLoop) -> Result<(), MessageError> {
        let (hdr, payload, fds) = self.recv_message()?;
        self.handle_message(evloop, hdr, &payload, fds)
    }

    /// Reads one framed message: exact header, ancillary fds, exact payload.
    fn recv_message(&mut self) -> Result<(Header, Vec<u8>, Vec<OwnedFd>), MessageError> {
        let fd = self.conn_fd()?;

        let mut hdr_buf = [0u8; message::HEADER_SIZE];
        let mut cmsg_buf = nix::cmsg_space!([RawFd; message::VHOST_USER_MAX_FDS]);

        let (received, fds) = {
            let mut iov = [IoSliceMut::new(&mut hdr_buf)];
            let msg = socket::recvmsg::<()>(
                fd,
                &mut iov,
                Some(&mut cmsg_buf),
                MsgFlags::MSG_WAITALL | MsgFlags::MSG_CMSG_CLOEXEC,
            )?;

            let mut fds: Vec<OwnedFd> = Vec::new();
            for cmsg in msg.cmsgs() {
                match cmsg {
                    ControlMessageOwned::ScmRights(raw)
                        if fds.is_empty() && raw.len() <= message::VHOST_USER_MAX_FDS =>
                    {
                        fds = raw
                            .into_iter()
                            .map(|fd| unsafe { OwnedFd::from_raw_fd(fd) })
                            .collect();
                    }
                    _ => return Err(MessageError::BadAncillary),
                }
            }

            (msg.bytes, fds)
        };

        if received != message::HEADER_SIZE {
            return Err(MessageError::ShortHeader(received));
        }

        let hdr = Header::parse(&hdr_buf);
        if hdr.size > message::MAX_PAYLOAD_SIZE {
            return Err(MessageError::PayloadTooLarge(hdr.size));
        }

        let mut payload = vec![0u8; hdr.size as usize];
        if !payload.is_empty() {
            let got = socket::recv(fd, &mut payload, MsgFlags::MSG_WAITALL)?;
            if got != payload.len() {
                return Err(MessageError::ShortPayload(got, payload.len()));
            }
        }

        Ok((hdr, payload, fds))
    }

    fn send_reply(&mut self, request: u32, payload: &[u8]) -> Result<(), MessageError> {
        let fd = self.conn_fd()?;
        let hdr = Header::reply(request, payload.len() as u32).to_bytes();

        let iov = [IoSlice::new(&hdr), IoSlice::new(payload)];
        let sent = socket::sendmsg::<()>(fd, &iov, &[], MsgFlags::empty(), None)?;
        if sent != hdr.len() + payload.len() {
            return Err(MessageError::Io(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "short reply",
            )));
        }

        Ok(())
    }

    /// Dispatches one request and applies the reply discipline.
    ///
    /// Handlers report three outcomes: a reply payload (or none) on success,
    /// a non-fatal errno surfaced through REPLY_ACK, or a fatal error that
    /// the caller turns into a device reset.
    fn handle_message(
        &mut self,
        evloop: &mut EventLoop,
        hdr: Header,
        payload: &[u8],
        mut fds: Vec<OwnedFd>,
    ) -> Result<(), MessageError> {
        let request = Request::from_raw(hdr.request);
        tracing::trace!(?request, code = hdr.request, size = hdr.size, "request");

        let result: HandlerResult = match request {
            Some(Request::GetFeatures) => self.get_features(),
            Some(Request::SetFeatures) => self.set_features(payload),
            Some(Request::SetOwner) => self.set_owner(),
            // Deprecated in the protocol; ignored
            Some(Request::ResetOwner) => Ok(None),
            Some(Request::SetMemTable) => self.set_mem_table(payload, &fds),
            Some(Request::GetProtocolFeatures) => self.get_protocol_features(),
            Some(Request::SetProtocolFeatures) => self.set_protocol_features(payload),
            Some(Request::GetQueueNum) => self.get_queue_num(),
            Some(Request::GetConfig) => self.get_config(payload),
            Some(Request::SetVringNum) => self.set_vring_num(payload),
            Some(Request::SetVringAddr) => self.set_vring_addr(payload),
            Some(Request::SetVringBase) => self.set_vring_base(payload),
            Some(Request::GetVringBase) => self.get_vring_base(payload),
            Some(Request::SetVringKick) => self.set_vring_kick(evloop, payload, &mut fds),
            Some(Request::SetVringCall) => self.set_vring_call(payload, &mut fds),
            Some(Request::SetVringErr) => self.set_vring_err(payload, &mut fds),
            Some(Request::SetVringEnable) => self.set_vring_enable(payload),
            Some(Request::ResetDevice) => self.reset_device(evloop),
            Some(other) => {
                tracing::warn!(request = ?other, "unsupported request");
                Err(HandlerError::Failed(Errno::ENOTSUP))
            }
            None => {
                tracing::warn!(code = hdr.request, "unknown request");
                Err(HandlerError::Failed(Errno::ENOTSUP))
            }
        };

        let (rc, reply) = match result {
            Ok(reply) => (0i64, reply),
            Err(HandlerError::Failed(errno)) => (errno as i64, None),
            Err(HandlerError::Fatal(err)) => return Err(err),
        };

        if assumes_reply(hdr.request) {
            self.send_reply(hdr.request, reply.as_deref().unwrap_or_default())?;
        } else if self.reply_ack_negotiated() && hdr.needs_reply_ack() {
            let ack = rc.wrapping_neg() as u64;
            self.send_reply(hdr.request, &ack.to_le_bytes())?;
        }

        Ok(())
    }

    fn reply_ack_negotiated(&self) -> bool {
        self.negotiated_protocol_features & ProtocolFeatures::REPLY_ACK.bits() != 0
    }

    /*
     * Request handlers
     */

    fn get_features(&self) -> HandlerResult {
        let features = self.vblk.supported_features() | message::VHOST_USER_F_PROTOCOL_FEATURES;
        tracing::trace!("[get-features] 0x{:08x}", features);
        Ok(Some(features.to_le_bytes().to_vec()))
    }

    fn set_features(&mut self, payload: &[u8]) -> HandlerResult {
        let features = u64::try_from_payload(payload)?;
        let supported = self.vblk.supported_features() | message::VHOST_USER_F_PROTOCOL_FEATURES;
        if features & !supported != 0 {
            // Master lies about features we can support
            return Err(MessageError::UnknownFeatures(features).into());
        }

        let had_protocol_features = self.has_protocol_features;
        self.has_protocol_features = features & message::VHOST_USER_F_PROTOCOL_FEATURES != 0;
        self.vblk
            .set_features(features & !message::VHOST_USER_F_PROTOCOL_FEATURES)?;

        if self.has_protocol_features && !had_protocol_features {
            // Rings are now gated by SET_VRING_ENABLE
            for vring in &mut self.vrings {
                vring.enabled = false;
            }
        }

        tracing::debug!("[set-features] 0x{:08x}", features);
        Ok(None)
    }

    fn get_protocol_features(&self) -> HandlerResult {
        let features = ProtocolFeatures::all().bits();
        tracing::trace!("[get-protocol-features] 0x{:08x}", features);
        Ok(Some(features.to_le_bytes().to_vec()))
    }

    fn set_protocol_features(&mut self, payload: &[u8]) -> HandlerResult {
        let features = u64::try_from_payload(payload)?;
        if features & !ProtocolFeatures::all().bits() != 0 {
            return Err(MessageError::UnknownProtocolFeatures(features).into());
        }

        self.negotiated_protocol_features = features;
        tracing::debug!("[set-protocol-features] 0x{:08x}", features);
        Ok(None)
    }

    fn set_owner(&mut self) -> HandlerResult {
        if self.session_started {
            return Err(MessageError::SessionAlreadyStarted.into());
        }

        tracing::debug!("[set-owner] starting session");
        self.session_started = true;
        Ok(None)
    }

    fn get_queue_num(&self) -> HandlerResult {
        Ok(Some((self.vrings.len() as u64).to_le_bytes().to_vec()))
    }

    fn set_mem_table(&mut self, payload: &[u8], fds: &[OwnedFd]) -> HandlerResult {
        let table = MemTable::try_from_payload(payload)?;
        if table.regions.len() != fds.len() {
            return Err(MessageError::RegionCountMismatch {
                regions: table.regions.len(),
                fds: fds.len(),
            }
            .into());
        }

        // Host pointers resolved through the previous table must not survive
        // it: disarm every queue before swapping the map.
        for vring in &mut self.vrings {
            vring.queue = None;
            vring.started = false;
        }
        self.mem = None;

        let mut mem = GuestMemory::new();
        for (region, fd) in table.regions.iter().zip(fds) {
            mem.map_region(region, fd.as_fd())?;
        }

        tracing::debug!("[set-mem-table] installed {} regions", table.regions.len());
        self.mem = Some(Rc::new(mem));
        Ok(None)
    }

    fn get_config(&self, payload: &[u8]) -> HandlerResult {
        let mut cfg = ConfigSpace::try_from_payload(payload)?;
        if cfg.size as usize > crate::virtio::blk::CONFIG_SPACE_SIZE {
            return Err(HandlerError::Failed(Errno::EINVAL));
        }

        let mut window = vec![0u8; cfg.size as usize];
        if let Err(error) = self.vblk.read_config(cfg.offset, &mut window) {
            // A zero-length reply tells the master the window was bad
            tracing::warn!(%error, "[get-config] rejected");
            return Err(HandlerError::Failed(Errno::EINVAL));
        }

        cfg.payload = window;
        Ok(Some(cfg.to_bytes()))
    }

    fn vring_mut(&mut self, index: u32) -> Result<&mut Vring, MessageError> {
        self.vrings
            .get_mut(index as usize)
            .ok_or(MessageError::InvalidQueueIndex(index))
    }

    fn set_vring_num(&mut self, payload: &[u8]) -> HandlerResult {
        let state = VringState::try_from_payload(payload)?;
        if state.num > u32::from(VIRTQ_MAX_SIZE) {
            return Err(MessageError::InvalidQueueSize(state.num).into());
        }

        tracing::trace!("[vring][{:02x}] queue size {}", state.index, state.num);
        self.vring_mut(state.index)?.size = state.num as u16;
        Ok(None)
    }

    fn set_vring_addr(&mut self, payload: &[u8]) -> HandlerResult {
        let addr = VringAddr::try_from_payload(payload)?;
        if addr.flags & message::VRING_ADDR_F_LOG != 0 {
            return Err(MessageError::LogAddressUnsupported.into());
        }

        let mem = self
            .mem
            .as_ref()
            .ok_or(MessageError::Memory(MemoryError::NoMappedMemory))?;
        let desc = mem.master_to_gpa(addr.descriptor)?;
        let used = mem.master_to_gpa(addr.used)?;
        let avail = mem.master_to_gpa(addr.available)?;

        tracing::debug!(
            "[vring][{:02x}] desc 0x{:08x} -> 0x{:08x}, avail 0x{:08x} -> 0x{:08x}, used 0x{:08x} -> 0x{:08x}",
            addr.index,
            addr.descriptor,
            desc,
            addr.available,
            avail,
            addr.used,
            used,
        );

        let vring = self.vring_mut(addr.index)?;
        vring.desc_addr = desc;
        vring.used_addr = used;
        vring.avail_addr = avail;
        Ok(None)
    }

    fn set_vring_base(&mut self, payload: &[u8]) -> HandlerResult {
        let state = VringState::try_from_payload(payload)?;
        tracing::trace!("[vring][{:02x}] avail base {}", state.index, state.num);
        self.vring_mut(state.index)?.avail_base = state.num as u16;
        Ok(None)
    }

    fn get_vring_base(&mut self, payload: &[u8]) -> HandlerResult {
        let state = VringState::try_from_payload(payload)?;
        let vring = self.vring_mut(state.index)?;
        let base = vring.stop();

        tracing::debug!("[vring][{:02x}] stopped, avail base {}", state.index, base);
        let reply = VringState {
            index: state.index,
            num: u32::from(base),
        };
        Ok(Some(reply.to_bytes().to_vec()))
    }

    /// Splits a kick/call/err payload into the vring index and the fd that
    /// rides along unless the invalid-fd bit is set.
    fn vring_fd_payload(
        payload: &[u8],
        fds: &mut Vec<OwnedFd>,
    ) -> Result<(u32, Option<OwnedFd>), HandlerError> {
        let value = u64::try_from_payload(payload)?;
        let index = (value & message::VRING_IDX_MASK) as u32;

        if value & message::VRING_NOFD_MASK != 0 {
            return Ok((index, None));
        }

        if fds.is_empty() {
            return Err(MessageError::MissingFd.into());
        }
        Ok((index, Some(fds.remove(0))))
    }

    fn set_vring_kick(
        &mut self,
        evloop: &mut EventLoop,
        payload: &[u8],
        fds: &mut Vec<OwnedFd>,
    ) -> HandlerResult {
        let (index, fd) = Self::vring_fd_payload(payload, fds)?;
        self.vring_mut(index)?;

        // Replace any previous kick fd
        self.drop_kick(evloop, index as usize);

        let Some(fd) = fd else {
            tracing::debug!("[vring][{:02x}] master will poll instead of kicking", index);
            return Ok(None);
        };

        evloop
            .add_fd(&fd, EpollFlags::EPOLLIN | EpollFlags::EPOLLHUP)
            .map_err(MessageError::from)?;
        self.fds.insert(fd.as_raw_fd(), FdKind::Kick(index as usize));

        tracing::debug!("[vring][{:02x}] kick fd installed", index);
        self.vring_mut(index)?.kick = Some(fd);
        Ok(None)
    }

    fn set_vring_call(&mut self, payload: &[u8], fds: &mut Vec<OwnedFd>) -> HandlerResult {
        let (index, fd) = Self::vring_fd_payload(payload, fds)?;
        tracing::trace!("[vring][{:02x}] call fd {:?}", index, fd);
        self.vring_mut(index)?.call = fd;
        Ok(None)
    }

    fn set_vring_err(&mut self, payload: &[u8], fds: &mut Vec<OwnedFd>) -> HandlerResult {
        let (index, fd) = Self::vring_fd_payload(payload, fds)?;
        tracing::trace!("[vring][{:02x}] err fd {:?}", index, fd);
        self.vring_mut(index)?.err = fd;
        Ok(None)
    }

    fn set_vring_enable(&mut self, payload: &[u8]) -> HandlerResult {
        if !self.has_protocol_features {
            return Err(MessageError::EnableWithoutProtocolFeatures.into());
        }

        let state = VringState::try_from_payload(payload)?;
        let enable = state.num != 0;
        let vring = self.vring_mut(state.index)?;
        vring.enabled = enable;
        let started = vring.started;
        tracing::debug!(
            "[vring][{:02x}] {}",
            state.index,
            if enable { "enabled" } else { "disabled" }
        );

        // Kicks consumed while the ring was disabled left work behind
        if enable && started {
            self.process_queue(state.index as usize);
        }
        Ok(None)
    }

    /// RESET_DEVICE: back to initial device state, keeping the connection
    /// and the negotiated protocol features for the renegotiation.
    fn reset_device(&mut self, evloop: &mut EventLoop) -> HandlerResult {
        if self.negotiated_protocol_features & ProtocolFeatures::RESET_DEVICE.bits() == 0 {
            return Err(HandlerError::Failed(Errno::EINVAL));
        }

        for index in 0..self.vrings.len() {
            self.drop_kick(evloop, index);
        }
        for vring in &mut self.vrings {
            vring.reset(true);
        }
        self.mem = None;
        self.vblk.reset_features();
        self.has_protocol_features = false;
        self.session_started = false;

        tracing::info!("device reset by master");
        Ok(None)
    }

    /*
     * Queue servicing
     */

    /// Deregisters, removes, and closes a vring's kick fd, if any.
    fn drop_kick(&mut self, evloop: &mut EventLoop, index: usize) {
        if let Some(fd) = self.vrings[index].take_kick() {
            let raw = fd.as_raw_fd();
            if let Err(error) = evloop.del_fd(raw) {
                tracing::debug!(%error, "kick fd was not registered");
            }
            self.fds.remove(&raw);
        }
    }

    fn on_kick(&mut self, index: usize) -> Result<(), MessageError> {
        // Drain the eventfd counter first or the fd stays level-ready
        if let Some(fd) = self.vrings[index].kick_fd() {
            let mut counter = [0u8; 8];
            if let Err(error) = unistd::read(fd, &mut counter) {
                tracing::warn!(%error, "[vring][{:02x}] unable to drain kick fd", index);
            }
        }

        if !self.vrings[index].started {
            let mem = self.mem.clone().ok_or(MessageError::VringStartFailed(
                QueueError::Memory(MemoryError::NoMappedMemory),
            ))?;
            self.vrings[index]
                .start(mem)
                .map_err(MessageError::VringStartFailed)?;
        }

        if self.vrings[index].enabled {
            self.process_queue(index);
        } else {
            tracing::debug!("[vring][{:02x}] kicked while disabled", index);
        }

        Ok(())
    }

    /// The block-device vring handler: drain available chains, run each
    /// request against the backend, complete in submission order.
    fn process_queue(&mut self, index: usize) {
        let Self {
            vrings,
            vblk,
            backend,
            ..
        } = self;
        let vring = &mut vrings[index];
        let Some(queue) = vring.queue.as_mut() else {
            return;
        };

        let mut completed = 0u32;
        loop {
            match vblk.dequeue(queue) {
                Dequeue::Empty => break,
                Dequeue::Broken => {
                    tracing::warn!("[vring][{:02x}] queue is broken", index);
                    break;
                }
                Dequeue::Dropped => {
                    tracing::warn!("[vring][{:02x}] dropped a malformed request chain", index);
                    completed += 1;
                }
                Dequeue::Request(request) => {
                    let status = service_request(backend.as_mut(), vblk, &request);
                    request.complete(queue, status);
                    completed += 1;
                }
            }
        }

        if completed > 0 {
            vring.notify();
        }
    }

    /// Drops the master and restores the device to its idle state. The
    /// listen socket stays registered so a new master can connect.
    pub fn reset(&mut self, evloop: &mut EventLoop) {
        if let Some(conn) = self.conn.take() {
            let raw = conn.as_raw_fd();
            if let Err(error) = evloop.del_fd(raw) {
                tracing::debug!(%error, "connection fd was not registered");
            }
            self.fds.remove(&raw);
        }

        for index in 0..self.vrings.len() {
            self.drop_kick(evloop, index);
        }
        for vring in &mut self.vrings {
            vring.reset(true);
        }

        self.mem = None;
        self.vblk.reset_features();
        self.has_protocol_features = false;
        self.negotiated_protocol_features = 0;
        self.session_started = false;

        tracing::info!("device reset");
    }
}

fn service_request(
    backend: &mut dyn BlockBackend,
    vblk: &VirtioBlk,
    request: &BlockRequest,
) -> IoStatus {
    match request.kind {
        IoKind::Read => transfer(backend, request, true),
        IoKind::Write => transfer(backend, request, false),
        IoKind::Flush => match backend.flush() {
            Ok(()) => IoStatus::Ok,
            Err(error) => {
                tracing::warn!(%error, "flush failed");
                IoStatus::IoError
            }
        },
        IoKind::GetId => {
            let id = vblk.device_id();
            let vec = request.vecs[0];
            let len = (vec.len as usize).min(id.len());
            unsafe { ptr::copy_nonoverlapping(id.as_ptr(), vec.ptr, len) };
            IoStatus::Ok
        }
    }
}

fn transfer(backend: &mut dyn BlockBackend, request: &BlockRequest, read: bool) -> IoStatus {
    let mut offset = request.sector << SECTOR_SHIFT;

    for vec in &request.vecs {
        let len = vec.len as usize;
        let result = if read {
            let buf = unsafe { slice::from_raw_parts_mut(vec.ptr, len) };
            backend.read_at(offset, buf)
        } else {
            let buf = unsafe { slice::from_raw_parts(vec.ptr as *const u8, len) };
            backend.write_at(offset, buf)
        };

        if let Err(error) = result {
            tracing::warn!(%error, sector = request.sector, "block backend i/o failed");
            return IoStatus::IoError;
        }

        offset += u64::from(vec.len);
    }

    IoStatus::Ok
}
