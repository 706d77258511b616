//! Fixed-slot message rings for two-sided messaging.
//!
//! A ring owns a page-aligned allocation carved into equally sized slots
//! and registered as one memory region. Send-side rings hand out slots
//! round-robin; receive-side rings post every slot at once, forming the
//! unordered buffer set arriving messages consume. The slot index travels
//! as the operation context, so a completion names its slot directly.

use std::ptr;
use std::slice;

use libc;
use slog::Logger;

use connection::Connection;
use memory::{LocalMr, Usage};
use peer::Peer;
use {CompletionFlags, Error, Result};

/// A registered ring of fixed-size message slots.
#[derive(Debug)]
pub struct MessageRing {
    log: Logger,
    /// Base of the page-aligned backing allocation; zero once freed.
    base: usize,
    alloc_size: usize,
    mr: Option<LocalMr>,
    slot_size: usize,
    slots: usize,
    next: usize,
}

impl MessageRing {
    /// Allocate and register a ring of `slots` slots of `slot_size` bytes
    /// for the given usage (typically `SEND` or `RECV`).
    ///
    /// # Errors
    ///
    /// - `InvalidArg` - a zero slot size or slot count
    /// - `OutOfMemory` - the backing allocation failed
    /// - `Provider` - the registration failed
    pub fn new(
        log: Logger,
        peer: &Peer,
        slot_size: usize,
        slots: usize,
        usage: Usage,
    ) -> Result<MessageRing> {
        if slot_size == 0 || slots == 0 {
            return Err(Error::InvalidArg("a ring needs at least one non-empty slot"));
        }

        let alloc_size = slot_size * slots;
        let mut base: *mut libc::c_void = ptr::null_mut();
        let err = unsafe {
            libc::posix_memalign(&mut base, page_size(), alloc_size)
        };
        if err != 0 {
            return Err(Error::OutOfMemory);
        }
        unsafe {
            ptr::write_bytes(base as *mut u8, 0, alloc_size);
        }

        let mr = match LocalMr::reg(peer, base as *mut u8, alloc_size, usage) {
            Ok(mr) => mr,
            Err(e) => {
                unsafe {
                    libc::free(base);
                }
                return Err(e);
            }
        };

        Ok(MessageRing {
            log,
            base: base as usize,
            alloc_size,
            mr: Some(mr),
            slot_size,
            slots,
            next: 0,
        })
    }

    pub fn slot_size(&self) -> usize {
        self.slot_size
    }

    pub fn slots(&self) -> usize {
        self.slots
    }

    /// The registration backing the ring.
    pub fn mr(&self) -> &LocalMr {
        // present from construction until the sole consuming destructor
        self.mr.as_ref().unwrap()
    }

    /// Claim the next slot round-robin and zero it.
    pub fn next_slot(&mut self) -> usize {
        let index = self.next;
        self.next = (self.next + 1) % self.slots;
        unsafe {
            ptr::write_bytes(self.slot_base(index) as *mut u8, 0, self.slot_size);
        }
        index
    }

    /// Byte offset of a slot within the registration.
    pub fn offset_of(&self, index: usize) -> usize {
        index * self.slot_size
    }

    fn slot_base(&self, index: usize) -> usize {
        self.base + self.offset_of(index)
    }

    /// Borrow a slot's bytes.
    ///
    /// # Panics
    ///
    /// When `index` names no slot.
    pub fn slot(&self, index: usize) -> &[u8] {
        assert!(index < self.slots);
        unsafe { slice::from_raw_parts(self.slot_base(index) as *const u8, self.slot_size) }
    }

    /// Borrow a slot's bytes mutably, to fill a message in before `send`.
    ///
    /// # Panics
    ///
    /// When `index` names no slot.
    pub fn slot_mut(&mut self, index: usize) -> &mut [u8] {
        assert!(index < self.slots);
        unsafe { slice::from_raw_parts_mut(self.slot_base(index) as *mut u8, self.slot_size) }
    }

    /// Send `len` bytes of the slot as a message; the slot index rides
    /// along as the operation context.
    ///
    /// # Errors
    ///
    /// - `InvalidArg` - the index names no slot, the length exceeds the
    ///   slot, or the completion flags are empty
    /// - `Provider` - posting failed
    pub fn send(
        &self,
        conn: &Connection,
        index: usize,
        len: usize,
        flags: CompletionFlags,
    ) -> Result<()> {
        if index >= self.slots {
            return Err(Error::InvalidArg("the index names no slot"));
        }
        if len > self.slot_size {
            return Err(Error::InvalidArg("the message exceeds the slot"));
        }
        conn.send(Some(self.mr()), self.offset_of(index), len, flags, index as u64)
    }

    /// Post every slot as a receive buffer, with the slot index as the
    /// operation context.
    ///
    /// # Errors
    ///
    /// - `Provider` - posting failed; slots posted so far stay posted
    pub fn post_recv_all(&self, conn: &Connection) -> Result<()> {
        for index in 0..self.slots {
            conn.recv(
                Some(self.mr()),
                self.offset_of(index),
                self.slot_size,
                index as u64,
            )?;
        }
        debug!(self.log, "posted the receive ring"; "slots" => self.slots);
        Ok(())
    }

    /// Deregister and free the ring.
    ///
    /// # Errors
    ///
    /// - `Provider` - the deregistration failed; the backing allocation is
    ///   freed regardless
    pub fn delete(mut self) -> Result<()> {
        self.teardown()
    }

    fn teardown(&mut self) -> Result<()> {
        let mut first = Ok(());
        if let Some(mr) = self.mr.take() {
            if let Err(e) = mr.dereg() {
                first = Err(e);
            }
        }
        if self.base != 0 {
            unsafe {
                libc::free(self.base as *mut libc::c_void);
            }
            self.base = 0;
        }
        first
    }
}

impl Drop for MessageRing {
    fn drop(&mut self) {
        let _ = self.teardown();
    }
}

fn page_size() -> usize {
    let n = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if n < 0 {
        // the portable fallback; every supported platform reports one
        4096
    } else {
        n as usize
    }
}
