//! Per-queue vhost context
//!
//! Tracks the master-supplied configuration (size, ring addresses, eventfds)
//! and the armed virtqueue once the first kick starts it. All fds are owned
//! here; the kick fd is additionally registered with the event loop by the
//! device, which deregisters it before this context drops it.

use std::{
    os::fd::{AsRawFd, OwnedFd, RawFd},
    rc::Rc,
};

use crate::{error::QueueError, memory::GuestMemory, virtio::virtqueue::Virtqueue};

pub struct Vring {
    index: usize,

    pub kick: Option<OwnedFd>,
    pub call: Option<OwnedFd>,
    pub err: Option<OwnedFd>,

    /// Queue size set by the master; validated when the queue starts
    pub size: u16,

    /// Next avail index to process when the queue (re)starts
    pub avail_base: u16,

    /// Ring addresses, already translated to guest-physical
    pub desc_addr: u64,
    pub used_addr: u64,
    pub avail_addr: u64,

    pub enabled: bool,
    pub started: bool,

    pub queue: Option<Virtqueue>,
}

impl Vring {
    pub fn new(index: usize) -> Self {
        Self {
            index,
            kick: None,
            call: None,
            err: None,
            size: 0,
            avail_base: 0,
            desc_addr: 0,
            used_addr: 0,
            avail_addr: 0,
            // Rings start out enabled until protocol features say otherwise
            enabled: true,
            started: false,
            queue: None,
        }
    }

    /// Arms the virtqueue from the stored configuration.
    pub fn start(&mut self, mem: Rc<GuestMemory>) -> Result<(), QueueError> {
        let queue = Virtqueue::start(
            mem,
            self.size,
            self.desc_addr,
            self.avail_addr,
            self.used_addr,
            self.avail_base,
        )?;

        self.queue = Some(queue);
        self.started = true;

        tracing::debug!(
            "[vring][{:02x}] started, size {}, base {}",
            self.index,
            self.size,
            self.avail_base
        );
        Ok(())
    }

    /// Stops the ring, syncing `avail_base` from the live queue so the
    /// master can resume or inspect progress. Returns the synced base.
    pub fn stop(&mut self) -> u16 {
        if let Some(queue) = &self.queue {
            self.avail_base = queue.last_seen_avail();
        }
        self.started = false;
        self.avail_base
    }

    pub fn kick_fd(&self) -> Option<RawFd> {
        self.kick.as_ref().map(|fd| fd.as_raw_fd())
    }

    /// Detaches the kick fd so the caller can deregister it before close.
    pub fn take_kick(&mut self) -> Option<OwnedFd> {
        self.kick.take()
    }

    /// Signals the guest that buffers were used. A missing call fd means the
    /// master opted for polling.
    pub fn notify(&self) {
        if let Some(fd) = &self.call {
            if let Err(error) = nix::unistd::write(fd, &1u64.to_ne_bytes()) {
                tracing::warn!(?error, "[vring][{:02x}] call signal failed", self.index);
            }
        }
    }

    /// Returns the ring to its unconfigured state. `enabled` follows the
    /// protocol-features rule: rings are born enabled on legacy masters and
    /// disabled once protocol features are in play.
    pub fn reset(&mut self, enabled: bool) {
        self.kick = None;
        self.call = None;
        self.err = None;
        self.size = 0;
        self.avail_base = 0;
        self.desc_addr = 0;
        self.used_addr = 0;
        self.avail_addr = 0;
        self.enabled = enabled;
        self.started = false;
        self.queue = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::virtio::testing::{VqHarness, DATA_GPA};
    use nix::unistd::{pipe, read};
    use std::os::fd::AsRawFd;

    #[test]
    fn start_uses_stored_configuration() {
        let h = VqHarness::new(16);
        let mut vring = Vring::new(0);
        vring.size = 16;
        vring.desc_addr = 0;
        vring.avail_addr = h.avail_gpa();
        vring.used_addr = h.used_gpa();

        vring.start(h.mem()).unwrap();
        assert!(vring.started);
        assert!(vring.queue.is_some());
    }

    #[test]
    fn start_fails_without_valid_size() {
        let h = VqHarness::new(16);
        let mut vring = Vring::new(0);
        vring.avail_addr = h.avail_gpa();
        vring.used_addr = h.used_gpa();

        assert!(matches!(
            vring.start(h.mem()),
            Err(QueueError::InvalidSize(0))
        ));
        assert!(!vring.started);
    }

    #[test]
    fn stop_syncs_avail_base_from_queue() {
        let h = VqHarness::new(16);
        let mut vring = Vring::new(0);
        vring.size = 16;
        vring.avail_addr = h.avail_gpa();
        vring.used_addr = h.used_gpa();
        vring.start(h.mem()).unwrap();

        h.fill_desc(0, DATA_GPA, 0x10, 0, 0);
        h.publish(0);

        let queue = vring.queue.as_mut().unwrap();
        let chain = queue.dequeue().unwrap();
        chain.release(0);

        assert_eq!(vring.stop(), 1);
        assert!(!vring.started);
        assert_eq!(vring.avail_base, 1);
    }

    #[test]
    fn notify_writes_the_call_fd() {
        let (rx, tx) = pipe().unwrap();
        let mut vring = Vring::new(0);
        vring.call = Some(tx);

        vring.notify();

        let mut buf = [0u8; 8];
        assert_eq!(read(rx.as_raw_fd(), &mut buf).unwrap(), 8);
        assert_eq!(u64::from_ne_bytes(buf), 1);
    }

    #[test]
    fn reset_clears_fds_and_state() {
        let (rx, tx) = pipe().unwrap();
        let mut vring = Vring::new(0);
        vring.kick = Some(rx);
        vring.call = Some(tx);
        vring.size = 256;
        vring.started = true;

        vring.reset(false);
        assert!(vring.kick.is_none());
        assert!(vring.call.is_none());
        assert_eq!(vring.size, 0);
        assert!(!vring.enabled);
        assert!(!vring.started);
    }
}
