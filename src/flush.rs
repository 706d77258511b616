//! Emulation of a remote persistence primitive.

use std::io;
use std::ptr;

use libc;
use slog::Logger;

use memory::{self, LocalMr, RemoteMr, Usage};
use peer::Peer;
use verbs::Qp;
use {CompletionFlags, Error, FlushType, Result};

/// Size of the read-after-write scratch region.
const RAW_SIZE: usize = 8;

lazy_static! {
    /// The system page size, or the OS code the query failed with.
    static ref PAGE_SIZE: ::std::result::Result<usize, i32> = {
        let n = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if n < 0 {
            Err(io::Error::last_os_error().raw_os_error().unwrap_or(libc::EINVAL))
        } else {
            Ok(n as usize)
        }
    };
}

/// One way of flushing remote memory. Only the appliance persistency
/// method exists today; the seam keeps a device-native flush pluggable.
trait FlushStrategy: std::fmt::Debug + Send + Sync {
    fn execute(
        &self,
        qp: &dyn Qp,
        dst: &RemoteMr,
        dst_offset: usize,
        len: usize,
        ty: FlushType,
        flags: CompletionFlags,
        op_context: u64,
    ) -> Result<()>;

    fn teardown(&mut self) -> Result<()>;
}

/// The per-connection flushing object.
#[derive(Debug)]
pub(crate) struct Flush {
    strategy: Box<dyn FlushStrategy>,
}

impl Flush {
    pub(crate) fn new(peer: &Peer) -> Result<Flush> {
        let apm = ApmFlush::new(peer)?;
        Ok(Flush {
            strategy: Box::new(apm),
        })
    }

    pub(crate) fn execute(
        &self,
        qp: &dyn Qp,
        dst: &RemoteMr,
        dst_offset: usize,
        len: usize,
        ty: FlushType,
        flags: CompletionFlags,
        op_context: u64,
    ) -> Result<()> {
        self.strategy
            .execute(qp, dst, dst_offset, len, ty, flags, op_context)
    }

    pub(crate) fn delete(mut self) -> Result<()> {
        self.strategy.teardown()
    }
}

impl Drop for Flush {
    fn drop(&mut self) {
        let _ = self.strategy.teardown();
    }
}

/// Appliance persistency method: a read-after-write against a tiny
/// dedicated buffer. The NIC completes the read only after all preceding
/// writes have reached at least the persistence depth of the target.
#[derive(Debug)]
struct ApmFlush {
    log: Logger,
    /// Base of the anonymous shared mapping backing the scratch region;
    /// zero once unmapped.
    raw: usize,
    mmap_size: usize,
    raw_mr: Option<LocalMr>,
}

impl ApmFlush {
    fn new(peer: &Peer) -> Result<ApmFlush> {
        // a memory registration has to be page-aligned
        let mmap_size = match *PAGE_SIZE {
            Ok(size) => size,
            Err(code) => {
                let e = io::Error::from_raw_os_error(code);
                crit!(peer.log(), "querying the system page size failed"; "err" => %e);
                return Err(Error::Provider(e));
            }
        };

        let raw = unsafe {
            libc::mmap(
                ptr::null_mut(),
                mmap_size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if raw == libc::MAP_FAILED {
            return Err(Error::OutOfMemory);
        }

        let raw_mr = match LocalMr::reg(peer, raw as *mut u8, RAW_SIZE, Usage::READ_DST) {
            Ok(mr) => mr,
            Err(e) => {
                unsafe {
                    libc::munmap(raw, mmap_size);
                }
                return Err(e);
            }
        };

        Ok(ApmFlush {
            log: peer.log().clone(),
            raw: raw as usize,
            mmap_size,
            raw_mr: Some(raw_mr),
        })
    }
}

impl FlushStrategy for ApmFlush {
    fn execute(
        &self,
        qp: &dyn Qp,
        dst: &RemoteMr,
        dst_offset: usize,
        _len: usize,
        _ty: FlushType,
        flags: CompletionFlags,
        op_context: u64,
    ) -> Result<()> {
        memory::post_read(
            &self.log,
            qp,
            self.raw_mr.as_ref(),
            0,
            Some(dst),
            dst_offset,
            RAW_SIZE,
            flags,
            op_context,
        )
    }

    fn teardown(&mut self) -> Result<()> {
        let mut first = Ok(());
        if let Some(raw_mr) = self.raw_mr.take() {
            if let Err(e) = raw_mr.dereg() {
                first = Err(e);
            }
        }
        if self.raw != 0 {
            let ret = unsafe { libc::munmap(self.raw as *mut libc::c_void, self.mmap_size) };
            self.raw = 0;
            if ret != 0 && first.is_ok() {
                first = Err(Error::InvalidArg("unmapping the scratch region failed"));
            }
        }
        first
    }
}
