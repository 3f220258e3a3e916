//! Virtqueue descriptor chain traversal
//!
//! Everything the guest writes into a queue is untrusted: descriptor
//! addresses and lengths are resolved through the guest memory map before
//! use, chain walks are bounded by the queue size, and any malformed chain
//! flips the queue into a sticky broken state that only a full restart
//! clears.

use std::{
    ptr,
    rc::Rc,
    sync::atomic::{fence, Ordering},
};

use bitflags::bitflags;

use crate::{error::QueueError, memory::GuestMemory};

/// "Queue size is always a power of 2" and caps out at 32768.
pub const VIRTQ_MAX_SIZE: u16 = 32768;

const DESC_SIZE: u32 = 16;

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct DescFlags: u16 {
        /// Buffer continues via the next field
        const NEXT = 1;
        /// Buffer is device write-only (otherwise device read-only)
        const WRITE = 2;
        /// Buffer contains a table of descriptors
        const INDIRECT = 4;
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug)]
struct Descriptor {
    addr: u64,
    len: u32,
    flags: u16,
    next: u16,
}

#[repr(C)]
#[derive(Clone, Copy, Debug)]
struct UsedElem {
    id: u32,
    len: u32,
}

/// Buffer described by one descriptor, resolved to host address space.
#[derive(Clone, Copy, Debug)]
pub struct Buffer {
    /// Mapped host address
    pub ptr: *mut u8,

    /// Size of the buffer in bytes
    pub len: u32,

    /// Device may only read from this buffer
    pub ro: bool,
}

pub struct Virtqueue {
    mem: Rc<GuestMemory>,

    /// These point directly into mapped guest memory
    desc: *const Descriptor,
    avail: *const u16,
    used: *mut u16,

    qsize: u16,

    /// Shadow copy of the avail->idx value we've consumed up to
    last_seen_avail: u16,

    /// Queue was broken by the guest and cannot be safely handled further
    broken: bool,
}

impl Virtqueue {
    /// Resolves and validates the three rings, arming the queue.
    ///
    /// Ring sizes are fixed by the queue size: 16 bytes per descriptor,
    /// 6 + 2 bytes per avail slot, 6 + 8 bytes per used slot. Failure leaves
    /// no side effects.
    pub fn start(
        mem: Rc<GuestMemory>,
        qsize: u16,
        desc_gpa: u64,
        avail_gpa: u64,
        used_gpa: u64,
        avail_base: u16,
    ) -> Result<Self, QueueError> {
        if qsize == 0 || qsize > VIRTQ_MAX_SIZE || !qsize.is_power_of_two() {
            return Err(QueueError::InvalidSize(qsize));
        }

        let q = u32::from(qsize);

        if desc_gpa % 16 != 0 {
            return Err(QueueError::MisalignedRing("descriptor", desc_gpa));
        }
        if avail_gpa % 2 != 0 {
            return Err(QueueError::MisalignedRing("avail", avail_gpa));
        }
        if used_gpa % 4 != 0 {
            return Err(QueueError::MisalignedRing("used", used_gpa));
        }

        let desc = mem.find_gpa_range(desc_gpa, DESC_SIZE * q, true)? as *const Descriptor;
        let avail = mem.find_gpa_range(avail_gpa, 6 + 2 * q, true)? as *const u16;
        let used = mem.find_gpa_range(used_gpa, 6 + 8 * q, false)? as *mut u16;

        Ok(Self {
            mem,
            desc,
            avail,
            used,
            qsize,
            last_seen_avail: avail_base,
            broken: false,
        })
    }

    pub fn qsize(&self) -> u16 {
        self.qsize
    }

    pub fn last_seen_avail(&self) -> u16 {
        self.last_seen_avail
    }

    pub fn is_broken(&self) -> bool {
        self.broken
    }

    fn ring_slot(&self, idx: u16) -> usize {
        // qsize is a power of two
        usize::from(idx & (self.qsize - 1))
    }

    fn read_avail_idx(&self) -> u16 {
        unsafe { ptr::read_volatile(self.avail.add(1)) }
    }

    fn read_avail_ring(&self, slot: usize) -> u16 {
        unsafe { ptr::read_volatile(self.avail.add(2 + slot)) }
    }

    fn read_used_idx(&self) -> u16 {
        unsafe { ptr::read_volatile(self.used.add(1) as *const u16) }
    }

    /// Dequeues the next available chain, if any.
    pub fn dequeue(&mut self) -> Option<DescChain<'_>> {
        if self.broken {
            return None;
        }

        if self.last_seen_avail == self.read_avail_idx() {
            return None;
        }

        let head = self.read_avail_ring(self.ring_slot(self.last_seen_avail));
        self.last_seen_avail = self.last_seen_avail.wrapping_add(1);

        let table = self.desc;
        let table_size = u32::from(self.qsize);
        Some(DescChain {
            head,
            cur: Some(head),
            table,
            table_size,
            is_indirect: false,
            nseen: 0,
            vq: self,
        })
    }

    /// Publishes a completed chain head to the used ring.
    ///
    /// The element store must be visible before the index store, hence the
    /// release fence between them.
    pub fn push_used(&mut self, head: u16, written: u32) {
        let idx = self.read_used_idx();
        let slot = self.ring_slot(idx);

        unsafe {
            let elem = (self.used as *mut u8).add(4 + 8 * slot) as *mut UsedElem;
            ptr::write_volatile(
                elem,
                UsedElem {
                    id: u32::from(head),
                    len: written,
                },
            );
        }

        fence(Ordering::Release);

        unsafe { ptr::write_volatile(self.used.add(1), idx.wrapping_add(1)) };
    }
}

/// Iterator over the buffers of a single descriptor chain.
pub struct DescChain<'q> {
    head: u16,
    cur: Option<u16>,

    /// Current descriptor table (switches once into an indirect table)
    table: *const Descriptor,
    table_size: u32,
    is_indirect: bool,

    /// Total descriptors seen, for loop detection
    nseen: u32,

    vq: &'q mut Virtqueue,
}

impl DescChain<'_> {
    pub fn head(&self) -> u16 {
        self.head
    }

    pub fn has_next(&self) -> bool {
        self.cur.is_some()
    }

    fn fail(&mut self) -> Option<Buffer> {
        self.vq.broken = true;
        self.cur = None;
        None
    }

    fn load(&self, id: u16) -> Descriptor {
        unsafe { ptr::read_volatile(self.table.add(usize::from(id))) }
    }

    /// Yields the next buffer of the chain, or `None` at the end of the
    /// chain or once the queue is broken.
    pub fn next_buffer(&mut self) -> Option<Buffer> {
        if self.vq.broken {
            return None;
        }

        let cur = self.cur?;
        if u32::from(cur) >= self.table_size {
            return self.fail();
        }

        let mut desc = self.load(cur);
        let mut flags = DescFlags::from_bits_retain(desc.flags);

        while flags.contains(DescFlags::INDIRECT) {
            // Only one table per chain, and never combined with NEXT
            if self.is_indirect || flags.contains(DescFlags::NEXT) {
                return self.fail();
            }

            // A table that holds no complete descriptor cannot terminate
            if desc.len == 0 || desc.len % DESC_SIZE != 0 {
                return self.fail();
            }

            // The WRITE flag on a table descriptor is ignored: the table is
            // read-only input to the device.
            let table = match self.vq.mem.find_gpa_range(desc.addr, desc.len, true) {
                Ok(ptr) => ptr as *const Descriptor,
                Err(_) => return self.fail(),
            };

            self.is_indirect = true;
            self.table = table;
            self.table_size = desc.len / DESC_SIZE;
            self.cur = Some(0);
            self.nseen += 1;

            desc = self.load(0);
            flags = DescFlags::from_bits_retain(desc.flags);
        }

        self.nseen += 1;
        if self.nseen > u32::from(self.vq.qsize) {
            // Chain longer than the queue: loop or overflow
            return self.fail();
        }

        if desc.len == 0 {
            return self.fail();
        }

        let writable = flags.contains(DescFlags::WRITE);
        let ptr = match self.vq.mem.find_gpa_range(desc.addr, desc.len, !writable) {
            Ok(ptr) => ptr,
            Err(_) => return self.fail(),
        };

        if flags.contains(DescFlags::NEXT) {
            if u32::from(desc.next) >= self.table_size {
                return self.fail();
            }
            self.cur = Some(desc.next);
        } else {
            self.cur = None;
        }

        Some(Buffer {
            ptr,
            len: desc.len,
            ro: !writable,
        })
    }

    /// Releases the chain by publishing its head to the used ring.
    pub fn release(self, written: u32) {
        let head = self.head;
        self.vq.push_used(head, written);
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::{VqHarness, DATA_GPA};
    use super::*;

    const F_NEXT: u16 = DescFlags::NEXT.bits();
    const F_WRITE: u16 = DescFlags::WRITE.bits();
    const F_INDIRECT: u16 = DescFlags::INDIRECT.bits();

    fn walk(vq: &mut Virtqueue) -> (usize, Vec<Buffer>) {
        let mut chain = match vq.dequeue() {
            Some(chain) => chain,
            None => return (0, Vec::new()),
        };
        let mut bufs = Vec::new();
        while let Some(buf) = chain.next_buffer() {
            bufs.push(buf);
        }
        let n = bufs.len();
        (n, bufs)
    }

    #[test]
    fn start_rejects_invalid_queue_sizes() {
        let h = VqHarness::new(16);
        for qsize in [0u16, 3, VIRTQ_MAX_SIZE - 1] {
            let err = Virtqueue::start(h.mem(), qsize, 0, h.avail_gpa(), h.used_gpa(), 0);
            assert!(matches!(err, Err(QueueError::InvalidSize(_))));
        }
    }

    #[test]
    fn start_rejects_misaligned_rings() {
        let h = VqHarness::new(16);
        assert!(matches!(
            Virtqueue::start(h.mem(), 16, 8, h.avail_gpa(), h.used_gpa(), 0),
            Err(QueueError::MisalignedRing("descriptor", _))
        ));
        assert!(matches!(
            Virtqueue::start(h.mem(), 16, 0, h.avail_gpa() + 1, h.used_gpa(), 0),
            Err(QueueError::MisalignedRing("avail", _))
        ));
        assert!(matches!(
            Virtqueue::start(h.mem(), 16, 0, h.avail_gpa(), h.used_gpa() + 2, 0),
            Err(QueueError::MisalignedRing("used", _))
        ));
    }

    #[test]
    fn start_rejects_unmapped_rings() {
        let h = VqHarness::new(16);
        let err = Virtqueue::start(h.mem(), 16, 0xdead_0000_0000, h.avail_gpa(), h.used_gpa(), 0);
        assert!(matches!(err, Err(QueueError::Memory(_))));
    }

    #[test]
    fn dequeue_from_empty_queue() {
        let h = VqHarness::new(16);
        let mut vq = h.start();
        assert!(vq.dequeue().is_none());
        assert!(!vq.is_broken());
    }

    #[test]
    fn direct_chain_of_queue_length() {
        let qsize: u16 = 1024;
        let h = VqHarness::new(qsize);
        let mut vq = h.start();

        // Link descriptors in reverse id order to make things interesting
        for i in 0..qsize {
            let id = qsize - i - 1;
            let flags = if id == 0 { 0 } else { F_NEXT };
            h.fill_desc(id, DATA_GPA + u64::from(i) * 0x1000, 0x10, flags, id.wrapping_sub(1));
        }
        h.publish(qsize - 1);

        let mut chain = vq.dequeue().unwrap();
        let mut n = 0u64;
        while let Some(buf) = chain.next_buffer() {
            assert_eq!(buf.ptr as u64, DATA_GPA + n * 0x1000);
            assert_eq!(buf.len, 0x10);
            assert!(buf.ro);
            n += 1;
        }
        assert!(!chain.has_next());
        drop(chain);

        assert_eq!(n, u64::from(qsize));
        assert!(!vq.is_broken());
    }

    #[test]
    fn writable_buffers_are_reported() {
        let h = VqHarness::new(16);
        let mut vq = h.start();

        h.fill_desc(0, DATA_GPA, 0x200, F_WRITE, 0);
        h.publish(0);

        let (n, bufs) = walk(&mut vq);
        assert_eq!(n, 1);
        assert!(!bufs[0].ro);
        assert!(!vq.is_broken());
    }

    #[test]
    fn indirect_table_chain() {
        let qsize: u16 = 1024;
        let h = VqHarness::new(qsize);
        let mut vq = h.start();

        let chain_len = qsize - 1;
        let itbl = h.scratch_gpa();
        for i in 0..chain_len {
            let flags = if i == chain_len - 1 { 0 } else { F_NEXT };
            h.write_desc_at(itbl + u64::from(i) * 16, DATA_GPA + u64::from(i) * 0x1000, 0x10, flags, i + 1);
        }

        h.fill_desc(42, itbl, u32::from(chain_len) * 16, F_INDIRECT, 0);
        h.publish(42);

        let (n, bufs) = walk(&mut vq);
        assert_eq!(n, usize::from(chain_len));
        assert_eq!(bufs[0].ptr as u64, DATA_GPA);
        assert!(!vq.is_broken());
    }

    #[test]
    fn indirect_chain_of_queue_size_overflows() {
        let qsize: u16 = 1024;
        let h = VqHarness::new(qsize);
        let mut vq = h.start();

        // qsize table entries plus the table descriptor itself exceed the
        // allowed chain length by one
        let itbl = h.scratch_gpa();
        for i in 0..qsize {
            let flags = if i == qsize - 1 { 0 } else { F_NEXT };
            h.write_desc_at(itbl + u64::from(i) * 16, DATA_GPA, 0x10, flags, i + 1);
        }
        h.fill_desc(0, itbl, u32::from(qsize) * 16, F_INDIRECT, 0);
        h.publish(0);

        let (n, _) = walk(&mut vq);
        assert_eq!(n, usize::from(qsize) - 1);
        assert!(vq.is_broken());
    }

    #[test]
    fn indirect_with_next_flag_is_rejected() {
        let h = VqHarness::new(16);
        let mut vq = h.start();

        let itbl = h.scratch_gpa();
        h.write_desc_at(itbl, DATA_GPA, 0x10, 0, 0);
        h.fill_desc(0, itbl, 16, F_INDIRECT | F_NEXT, 0);
        h.publish(0);

        let (n, _) = walk(&mut vq);
        assert_eq!(n, 0);
        assert!(vq.is_broken());
    }

    #[test]
    fn nested_indirect_table_is_rejected() {
        let h = VqHarness::new(16);
        let mut vq = h.start();

        let itbl = h.scratch_gpa();
        h.write_desc_at(itbl, DATA_GPA, 0x10, F_INDIRECT, 0);
        h.fill_desc(0, itbl, 16, F_INDIRECT, 0);
        h.publish(0);

        let (n, _) = walk(&mut vq);
        assert_eq!(n, 0);
        assert!(vq.is_broken());
    }

    #[test]
    fn bad_indirect_table_lengths_are_rejected() {
        for len in [0u32, 15, 17] {
            let h = VqHarness::new(16);
            let mut vq = h.start();

            h.fill_desc(0, h.scratch_gpa(), len, F_INDIRECT, 0);
            h.publish(0);

            let (n, _) = walk(&mut vq);
            assert_eq!(n, 0);
            assert!(vq.is_broken());
        }
    }

    #[test]
    fn write_flag_on_indirect_table_descriptor_is_ignored() {
        let h = VqHarness::new(16);
        let mut vq = h.start();

        let itbl = h.scratch_gpa();
        h.write_desc_at(itbl, DATA_GPA, 0x10, 0, 0);
        h.fill_desc(0, itbl, 16, F_INDIRECT | F_WRITE, 0);
        h.publish(0);

        let (n, _) = walk(&mut vq);
        assert_eq!(n, 1);
        assert!(!vq.is_broken());
    }

    #[test]
    fn invalid_next_id_is_rejected() {
        let qsize: u16 = 16;
        let h = VqHarness::new(qsize);
        let mut vq = h.start();

        h.fill_desc(0, DATA_GPA, 0x10, F_NEXT, qsize);
        h.publish(0);

        let (n, _) = walk(&mut vq);
        assert_eq!(n, 0);
        assert!(vq.is_broken());
    }

    #[test]
    fn out_of_range_head_is_rejected() {
        let qsize: u16 = 16;
        let h = VqHarness::new(qsize);
        let mut vq = h.start();
        h.publish(qsize);

        let (n, _) = walk(&mut vq);
        assert_eq!(n, 0);
        assert!(vq.is_broken());
    }

    #[test]
    fn zero_length_descriptor_is_rejected() {
        let h = VqHarness::new(16);
        let mut vq = h.start();

        h.fill_desc(0, DATA_GPA, 0, F_WRITE, 0);
        h.publish(0);

        let (n, _) = walk(&mut vq);
        assert_eq!(n, 0);
        assert!(vq.is_broken());
    }

    #[test]
    fn descriptor_loop_is_detected() {
        let h = VqHarness::new(16);
        let mut vq = h.start();

        h.fill_desc(0, DATA_GPA, 0x10, F_NEXT, 1);
        h.fill_desc(1, DATA_GPA + 0x1000, 0x20, F_NEXT, 0);
        h.publish(0);

        // Iteration must terminate on its own with the queue broken
        let (n, _) = walk(&mut vq);
        assert!(n <= usize::from(vq.qsize()));
        assert!(vq.is_broken());
    }

    #[test]
    fn indirect_descriptor_loop_is_detected() {
        let h = VqHarness::new(16);
        let mut vq = h.start();

        let itbl = h.scratch_gpa();
        h.write_desc_at(itbl, DATA_GPA, 0x10, F_NEXT, 1);
        h.write_desc_at(itbl + 16, DATA_GPA, 0x10, F_NEXT, 0);
        h.fill_desc(0, itbl, 32, F_INDIRECT, 0);
        h.publish(0);

        let (_, _) = walk(&mut vq);
        assert!(vq.is_broken());
    }

    #[test]
    fn unmapped_buffer_breaks_the_queue() {
        let h = VqHarness::new(16);
        let mut vq = h.start();

        h.fill_desc(0, 0xdead_0000_0000, 0x10, 0, 0);
        h.publish(0);

        let (n, _) = walk(&mut vq);
        assert_eq!(n, 0);
        assert!(vq.is_broken());
    }

    #[test]
    fn writable_buffer_in_readonly_region_breaks_the_queue() {
        let h = VqHarness::new(16);
        let mut vq = h.start_with_ro_data();

        // Read-only use of the region is still fine
        h.fill_desc(0, DATA_GPA, 0x10, 0, 0);
        h.publish(0);
        let (n, _) = walk(&mut vq);
        assert_eq!(n, 1);
        assert!(!vq.is_broken());

        // Asking the device to write there is not
        h.fill_desc(1, DATA_GPA, 0x10, F_WRITE, 0);
        h.publish(1);
        let (n, _) = walk(&mut vq);
        assert_eq!(n, 0);
        assert!(vq.is_broken());
    }

    #[test]
    fn broken_queue_yields_nothing() {
        let h = VqHarness::new(16);
        let mut vq = h.start();

        h.fill_desc(0, DATA_GPA, 0, 0, 0);
        h.publish(0);
        let (_, _) = walk(&mut vq);
        assert!(vq.is_broken());

        h.fill_desc(1, DATA_GPA, 0x10, 0, 0);
        h.publish(1);
        assert!(vq.dequeue().is_none());
    }

    #[test]
    fn release_advances_used_ring() {
        let h = VqHarness::new(16);
        let mut vq = h.start();

        h.fill_desc(3, DATA_GPA, 0x10, 0, 0);
        h.publish(3);

        let mut chain = vq.dequeue().unwrap();
        while chain.next_buffer().is_some() {}
        chain.release(0x42);

        assert_eq!(h.used_idx(), 1);
        assert_eq!(h.used_elem(0), (3, 0x42));
    }

    #[test]
    fn many_chains_in_submission_order() {
        let qsize: u16 = 16;
        let h = VqHarness::new(qsize);
        let mut vq = h.start();

        for i in 0..qsize {
            h.fill_desc(i, DATA_GPA + u64::from(i) * 0x1000, 0x10, 0, 0);
            h.publish(i);
        }

        for i in 0..qsize {
            let mut chain = vq.dequeue().unwrap();
            assert_eq!(chain.head(), i);
            let buf = chain.next_buffer().unwrap();
            assert_eq!(buf.ptr as u64, DATA_GPA + u64::from(i) * 0x1000);
            assert!(chain.next_buffer().is_none());
            chain.release(0);
        }

        assert!(vq.dequeue().is_none());
        assert_eq!(h.used_idx(), qsize);
        assert!(!vq.is_broken());
    }

    #[test]
    fn avail_base_offsets_first_dequeue() {
        let h = VqHarness::new(16);
        let mem = h.mem();

        // Pretend 3 chains were consumed in a previous run
        for i in 0..4u16 {
            h.fill_desc(i, DATA_GPA, 0x10, 0, 0);
            h.publish(i);
        }

        let mut vq = Virtqueue::start(mem, 16, 0, h.avail_gpa(), h.used_gpa(), 3).unwrap();
        let chain = vq.dequeue().unwrap();
        assert_eq!(chain.head(), 3);
        drop(chain);
        assert_eq!(vq.last_seen_avail(), 4);
        assert!(vq.dequeue().is_none());
    }
}
