//! Level-triggered epoll event loop

use std::os::fd::{AsFd, AsRawFd, BorrowedFd, RawFd};

use nix::{
    errno::Errno,
    sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout},
};

const MAX_EVENTS: usize = 32;

/// A thin wrapper around a level-triggered epoll instance.
///
/// The loop keeps the batch of events returned by the last wait so that a
/// handler may deregister any fd - including one belonging to a later entry
/// in the same batch - without that entry being dispatched afterwards.
pub struct EventLoop {
    epoll: Epoll,
    inflight: Vec<EpollEvent>,
    count: usize,
}

impl EventLoop {
    pub fn new() -> Result<Self, Errno> {
        let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC)?;
        Ok(Self {
            epoll,
            inflight: vec![EpollEvent::empty(); MAX_EVENTS],
            count: 0,
        })
    }

    /// Registers `fd` for the given interests. The fd itself is the token
    /// handed back by [`EventLoop::event`].
    pub fn add_fd<F: AsFd>(&mut self, fd: &F, events: EpollFlags) -> Result<(), Errno> {
        let raw = fd.as_fd().as_raw_fd();
        self.epoll.add(fd, EpollEvent::new(events, raw as u64))
    }

    /// Removes `fd` from the loop and voids any still-pending event for it in
    /// the current dispatch batch.
    pub fn del_fd(&mut self, fd: RawFd) -> Result<(), Errno> {
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        self.epoll.delete(&borrowed)?;

        for ev in self.inflight[..self.count].iter_mut() {
            if ev.data() == fd as u64 {
                *ev = EpollEvent::new(EpollFlags::empty(), ev.data());
            }
        }

        Ok(())
    }

    /// Blocks until at least one registered fd is ready and returns the size
    /// of the new event batch.
    pub fn wait(&mut self) -> Result<usize, Errno> {
        loop {
            match self.epoll.wait(&mut self.inflight, EpollTimeout::NONE) {
                Ok(count) => {
                    self.count = count;
                    return Ok(count);
                }
                Err(Errno::EINTR) => continue,
                Err(err) => return Err(err),
            }
        }
    }

    /// Returns the fd and event mask at position `pos` of the current batch.
    /// The mask is empty if the fd was deregistered mid-batch.
    pub fn event(&self, pos: usize) -> (RawFd, EpollFlags) {
        let ev = &self.inflight[pos];
        (ev.data() as RawFd, ev.events())
    }
}
