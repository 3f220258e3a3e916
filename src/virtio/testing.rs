//! Shared fixtures for queue and block-device tests: an aligned arena that
//! plays the role of guest memory, identity-mapped so a guest-physical
//! address is just an offset into the arena.

use std::{cell::Cell, rc::Rc};

use crate::memory::{GuestMemory, MemoryMap};

use super::virtqueue::Virtqueue;

/// Guest-physical window handed out for bulk data buffers. Backed by fake
/// host pointers: the traversal engine translates these but never reads
/// through them.
pub const DATA_GPA: u64 = 0x1000_0000;
pub const DATA_LEN: u64 = 0x1000_0000;

fn align_4k(value: usize) -> usize {
    (value + 4095) & !4095
}

pub struct VqHarness {
    _buf: Vec<u8>,
    base: *mut u8,
    len: usize,
    qsize: u16,
    avail_off: usize,
    used_off: usize,
    scratch_off: usize,
    avail_idx: Cell<u16>,
}

impl VqHarness {
    pub fn new(qsize: u16) -> Self {
        let q = usize::from(qsize);
        let avail_off = 16 * q;
        let used_off = align_4k(avail_off + 6 + 2 * q);
        let scratch_off = align_4k(used_off + 6 + 8 * q);
        let len = scratch_off + 0x4_0000;

        let mut buf = vec![0u8; len + 4096];
        let align = buf.as_mut_ptr().align_offset(4096);
        let base = unsafe { buf.as_mut_ptr().add(align) };

        Self {
            _buf: buf,
            base,
            len,
            qsize,
            avail_off,
            used_off,
            scratch_off,
            avail_idx: Cell::new(0),
        }
    }

    pub fn avail_gpa(&self) -> u64 {
        self.avail_off as u64
    }

    pub fn used_gpa(&self) -> u64 {
        self.used_off as u64
    }

    /// Start of the arena area not used by the rings, for indirect tables,
    /// request headers, and status bytes.
    pub fn scratch_gpa(&self) -> u64 {
        self.scratch_off as u64
    }

    fn build_mem(&self, data_ro: bool) -> Rc<GuestMemory> {
        let mut map = MemoryMap::new();
        map.insert(0, self.len as u64, self.base, false).unwrap();
        map.insert(DATA_GPA, DATA_LEN, DATA_GPA as *mut u8, data_ro)
            .unwrap();
        Rc::new(GuestMemory::from_map(map))
    }

    pub fn mem(&self) -> Rc<GuestMemory> {
        self.build_mem(false)
    }

    pub fn start(&self) -> Virtqueue {
        Virtqueue::start(self.mem(), self.qsize, 0, self.avail_gpa(), self.used_gpa(), 0).unwrap()
    }

    pub fn start_with_ro_data(&self) -> Virtqueue {
        Virtqueue::start(
            self.build_mem(true),
            self.qsize,
            0,
            self.avail_gpa(),
            self.used_gpa(),
            0,
        )
        .unwrap()
    }

    /// Fills descriptor `id` of the queue's own table.
    pub fn fill_desc(&self, id: u16, addr: u64, len: u32, flags: u16, next: u16) {
        self.write_desc_at(u64::from(id) * 16, addr, len, flags, next);
    }

    /// Writes a raw descriptor at an arbitrary arena gpa (indirect tables).
    pub fn write_desc_at(&self, gpa: u64, addr: u64, len: u32, flags: u16, next: u16) {
        assert!((gpa as usize) + 16 <= self.len);
        unsafe {
            let p = self.base.add(gpa as usize);
            p.cast::<u64>().write_unaligned(addr);
            p.add(8).cast::<u32>().write_unaligned(len);
            p.add(12).cast::<u16>().write_unaligned(flags);
            p.add(14).cast::<u16>().write_unaligned(next);
        }
    }

    /// Publishes `head` on the avail ring and bumps the avail index.
    pub fn publish(&self, head: u16) {
        let idx = self.avail_idx.get();
        let slot = usize::from(idx & (self.qsize - 1));
        unsafe {
            let avail = self.base.add(self.avail_off);
            avail.add(4 + 2 * slot).cast::<u16>().write_unaligned(head);
            avail
                .add(2)
                .cast::<u16>()
                .write_unaligned(idx.wrapping_add(1));
        }
        self.avail_idx.set(idx.wrapping_add(1));
    }

    pub fn used_idx(&self) -> u16 {
        unsafe { self.base.add(self.used_off + 2).cast::<u16>().read_unaligned() }
    }

    /// Returns `(id, len)` of the used ring element in `slot`.
    pub fn used_elem(&self, slot: u16) -> (u32, u32) {
        unsafe {
            let elem = self.base.add(self.used_off + 4 + 8 * usize::from(slot));
            (
                elem.cast::<u32>().read_unaligned(),
                elem.add(4).cast::<u32>().read_unaligned(),
            )
        }
    }

    pub fn write_bytes(&self, gpa: u64, bytes: &[u8]) {
        assert!((gpa as usize) + bytes.len() <= self.len);
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.base.add(gpa as usize), bytes.len())
        }
    }

    pub fn read_byte(&self, gpa: u64) -> u8 {
        assert!((gpa as usize) < self.len);
        unsafe { *self.base.add(gpa as usize) }
    }
}
