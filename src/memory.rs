//! Memory registration and the wire descriptors conveying access rights.

use std::ops;

use byteorder::{ByteOrder, LittleEndian};
use slog::Logger;

use peer::Peer;
use verbs::{self, Mr, Qp, RecvWr, SendFlags, SendOpcode, SendWr, Sge, Srq};
use {CompletionFlags, Error, Result};

/// Intended uses of a registered span, as an 8-bit mask.
///
/// The values are wire-stable: the same byte travels in the memory-region
/// descriptor.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Usage(pub u8);

impl Usage {
    /// Source of a read.
    pub const READ_SRC: Usage = Usage(1 << 0);
    /// Destination of a read.
    pub const READ_DST: Usage = Usage(1 << 1);
    /// Source of a write.
    pub const WRITE_SRC: Usage = Usage(1 << 2);
    /// Destination of a write.
    pub const WRITE_DST: Usage = Usage(1 << 3);
    /// Target of a visibility flush.
    pub const FLUSH_VISIBILITY: Usage = Usage(1 << 4);
    /// Target of a persistent flush.
    pub const FLUSH_PERSISTENT: Usage = Usage(1 << 5);
    /// Source of a message send.
    pub const SEND: Usage = Usage(1 << 6);
    /// Destination of a message receive.
    pub const RECV: Usage = Usage(1 << 7);

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn contains(self, other: Usage) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn intersects(self, other: Usage) -> bool {
        self.0 & other.0 != 0
    }
}

impl ops::BitOr for Usage {
    type Output = Usage;
    fn bitor(self, rhs: Usage) -> Usage {
        Usage(self.0 | rhs.0)
    }
}

impl ops::BitAnd for Usage {
    type Output = Usage;
    fn bitand(self, rhs: Usage) -> Usage {
        Usage(self.0 & rhs.0)
    }
}

/// Size of the wire descriptor of a local memory region:
/// address, length, remote key and the usage byte.
pub const DESCRIPTOR_SIZE: usize = 2 * 8 + 4 + 1;

/// A local registered span of virtual memory.
///
/// The registered span has to stay valid for the entire lifetime of the
/// registration; `dereg` is the sole destructor.
#[derive(Debug)]
pub struct LocalMr {
    mr: Option<Box<dyn verbs::Mr>>,
    usage: Usage,
}

impl LocalMr {
    /// Register `size` bytes at `ptr` for the given uses.
    ///
    /// # Errors
    ///
    /// - `InvalidArg` - the pointer is absent, the span is empty, or the
    ///   usage names no operation
    /// - `Provider` - the registration failed (even after the on-demand
    ///   paging retry, where applicable)
    pub fn reg(peer: &Peer, ptr: *mut u8, size: usize, usage: Usage) -> Result<LocalMr> {
        if ptr.is_null() {
            return Err(Error::InvalidArg("memory pointer is absent"));
        }
        if size == 0 {
            return Err(Error::InvalidArg("registered span is empty"));
        }
        if usage.is_empty() {
            return Err(Error::InvalidArg("usage does not name any operation"));
        }
        let mr = peer.setup_mr_reg(ptr as u64, size, usage)?;
        Ok(LocalMr {
            mr: Some(mr),
            usage,
        })
    }

    /// Deregister the span.
    ///
    /// # Errors
    ///
    /// - `Provider` - the deregistration failed; the handle is released
    ///   regardless
    pub fn dereg(mut self) -> Result<()> {
        self.teardown()
    }

    fn teardown(&mut self) -> Result<()> {
        if let Some(mr) = self.mr.take() {
            mr.dereg().map_err(Error::Provider)?;
        }
        Ok(())
    }

    /// Base address of the registered span.
    pub fn addr(&self) -> u64 {
        self.verbs_mr().addr()
    }

    /// Length of the registered span.
    pub fn size(&self) -> usize {
        self.verbs_mr().length()
    }

    pub fn usage(&self) -> Usage {
        self.usage
    }

    /// Serialize the region for transmission to the remote peer.
    pub fn get_descriptor(&self) -> [u8; DESCRIPTOR_SIZE] {
        let mr = self.verbs_mr();
        let mut desc = [0; DESCRIPTOR_SIZE];
        LittleEndian::write_u64(&mut desc[0..8], mr.addr());
        LittleEndian::write_u64(&mut desc[8..16], mr.length() as u64);
        LittleEndian::write_u32(&mut desc[16..20], mr.rkey());
        desc[20] = self.usage.0;
        desc
    }

    fn verbs_mr(&self) -> &dyn verbs::Mr {
        // present from construction until the sole consuming destructor
        self.mr.as_ref().unwrap().as_ref()
    }
}

impl Drop for LocalMr {
    fn drop(&mut self) {
        let _ = self.teardown();
    }
}

/// The peer-side view of a registered span, reconstructed from its
/// descriptor.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct RemoteMr {
    raddr: u64,
    size: u64,
    rkey: u32,
    usage: Usage,
}

impl RemoteMr {
    /// Decode a descriptor received from the remote peer.
    ///
    /// Anything shorter than the fixed layout, or a descriptor naming no
    /// usage at all, is rejected.
    ///
    /// # Errors
    ///
    /// - `InvalidArg` - the descriptor is shorter than the fixed layout,
    ///   or its usage byte is zero
    pub fn from_descriptor(desc: &[u8]) -> Result<RemoteMr> {
        if desc.len() < DESCRIPTOR_SIZE {
            return Err(Error::InvalidArg("descriptor is shorter than the fixed layout"));
        }
        let usage = Usage(desc[20]);
        if usage.is_empty() {
            return Err(Error::InvalidArg("descriptor does not name any usage"));
        }
        Ok(RemoteMr {
            raddr: LittleEndian::read_u64(&desc[0..8]),
            size: LittleEndian::read_u64(&desc[8..16]),
            rkey: LittleEndian::read_u32(&desc[16..20]),
            usage,
        })
    }

    /// Base virtual address on the remote node.
    pub fn addr(&self) -> u64 {
        self.raddr
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn rkey(&self) -> u32 {
        self.rkey
    }

    pub fn usage(&self) -> Usage {
        self.usage
    }

    /// The flush flavors this region advertises.
    pub fn flush_type(&self) -> Usage {
        self.usage & (Usage::FLUSH_VISIBILITY | Usage::FLUSH_PERSISTENT)
    }
}

/// Signaling bits for a request posted with `flags`.
fn signaling(flags: CompletionFlags) -> SendFlags {
    if flags.on_success() {
        SendFlags::SIGNALED
    } else {
        SendFlags::default()
    }
}

/// Post a read of `len` bytes of `src` into `dst`.
///
/// The all-absent combination is the 0-byte read; argument consistency is
/// the caller's concern.
pub(crate) fn post_read(
    log: &Logger,
    qp: &dyn Qp,
    dst: Option<&LocalMr>,
    dst_offset: usize,
    src: Option<&RemoteMr>,
    src_offset: usize,
    len: usize,
    flags: CompletionFlags,
    op_context: u64,
) -> Result<()> {
    let wr = match (src, dst) {
        (Some(src), Some(dst)) => SendWr {
            wr_id: op_context,
            opcode: SendOpcode::RdmaRead,
            sge: Some(Sge {
                addr: dst.addr() + dst_offset as u64,
                length: len as u32,
                lkey: dst.verbs_mr().lkey(),
            }),
            remote_addr: src.raddr + src_offset as u64,
            rkey: src.rkey,
            imm: None,
            flags: signaling(flags),
        },
        _ => SendWr {
            wr_id: op_context,
            opcode: SendOpcode::RdmaRead,
            sge: None,
            remote_addr: 0,
            rkey: 0,
            imm: None,
            flags: signaling(flags),
        },
    };
    qp.post_send(&wr).map_err(|e| {
        error!(log, "posting a read failed";
               "len" => len, "wr_id" => op_context, "err" => %e);
        Error::Provider(e)
    })
}

/// Post a write of `len` bytes of `src` into `dst`, optionally with
/// immediate data and optionally fenced.
pub(crate) fn post_write(
    log: &Logger,
    qp: &dyn Qp,
    dst: Option<&RemoteMr>,
    dst_offset: usize,
    src: Option<&LocalMr>,
    src_offset: usize,
    len: usize,
    flags: CompletionFlags,
    imm: Option<u32>,
    fence: bool,
    op_context: u64,
) -> Result<()> {
    let opcode = if imm.is_some() {
        SendOpcode::RdmaWriteWithImm
    } else {
        SendOpcode::RdmaWrite
    };
    let mut send_flags = signaling(flags);
    if fence {
        send_flags |= SendFlags::FENCE;
    }
    let wr = match (src, dst) {
        (Some(src), Some(dst)) => SendWr {
            wr_id: op_context,
            opcode,
            sge: Some(Sge {
                addr: src.addr() + src_offset as u64,
                length: len as u32,
                lkey: src.verbs_mr().lkey(),
            }),
            remote_addr: dst.raddr + dst_offset as u64,
            rkey: dst.rkey,
            imm,
            flags: send_flags,
        },
        _ => SendWr {
            wr_id: op_context,
            opcode,
            sge: None,
            remote_addr: 0,
            rkey: 0,
            imm,
            flags: send_flags,
        },
    };
    qp.post_send(&wr).map_err(|e| {
        error!(log, "posting a write failed";
               "len" => len, "wr_id" => op_context, "err" => %e);
        Error::Provider(e)
    })
}

/// Post the 8-byte atomic write of `src` into `dst`.
///
/// The payload goes inline, and the fence forces any in-flight flush read
/// to complete first so the atomic slot is written only after the
/// preceding write is durable-visible.
pub(crate) fn post_atomic_write(
    log: &Logger,
    qp: &dyn Qp,
    dst: &RemoteMr,
    dst_offset: usize,
    src: &[u8; 8],
    flags: CompletionFlags,
    op_context: u64,
) -> Result<()> {
    let mut send_flags = SendFlags::INLINE | SendFlags::FENCE;
    if flags.on_success() {
        send_flags |= SendFlags::SIGNALED;
    }
    let wr = SendWr {
        wr_id: op_context,
        opcode: SendOpcode::RdmaWrite,
        sge: Some(Sge {
            addr: src.as_ptr() as u64,
            length: src.len() as u32,
            lkey: 0,
        }),
        remote_addr: dst.raddr + dst_offset as u64,
        rkey: dst.rkey,
        imm: None,
        flags: send_flags,
    };
    qp.post_send(&wr).map_err(|e| {
        error!(log, "posting an atomic write failed";
               "wr_id" => op_context, "err" => %e);
        Error::Provider(e)
    })
}

/// Post a message send of `len` bytes of `src`.
pub(crate) fn post_send(
    log: &Logger,
    qp: &dyn Qp,
    src: Option<&LocalMr>,
    offset: usize,
    len: usize,
    flags: CompletionFlags,
    imm: Option<u32>,
    op_context: u64,
) -> Result<()> {
    let opcode = if imm.is_some() {
        SendOpcode::SendWithImm
    } else {
        SendOpcode::Send
    };
    let wr = SendWr {
        wr_id: op_context,
        opcode,
        sge: src.map(|src| Sge {
            addr: src.addr() + offset as u64,
            length: len as u32,
            lkey: src.verbs_mr().lkey(),
        }),
        remote_addr: 0,
        rkey: 0,
        imm,
        flags: signaling(flags),
    };
    qp.post_send(&wr).map_err(|e| {
        error!(log, "posting a send failed";
               "len" => len, "wr_id" => op_context, "err" => %e);
        Error::Provider(e)
    })
}

fn recv_wr(dst: Option<&LocalMr>, offset: usize, len: usize, op_context: u64) -> RecvWr {
    RecvWr {
        wr_id: op_context,
        sge: dst.map(|dst| Sge {
            addr: dst.addr() + offset as u64,
            length: len as u32,
            lkey: dst.verbs_mr().lkey(),
        }),
    }
}

/// Post a receive buffer on a queue pair.
pub(crate) fn post_recv(
    log: &Logger,
    qp: &dyn Qp,
    dst: Option<&LocalMr>,
    offset: usize,
    len: usize,
    op_context: u64,
) -> Result<()> {
    qp.post_recv(&recv_wr(dst, offset, len, op_context)).map_err(|e| {
        error!(log, "posting a receive failed";
               "len" => len, "wr_id" => op_context, "err" => %e);
        Error::Provider(e)
    })
}

/// Post a receive buffer on a shared receive queue.
pub(crate) fn post_srq_recv(
    log: &Logger,
    srq: &dyn verbs::Srq,
    dst: Option<&LocalMr>,
    offset: usize,
    len: usize,
    op_context: u64,
) -> Result<()> {
    srq.post_recv(&recv_wr(dst, offset, len, op_context)).map_err(|e| {
        error!(log, "posting a shared receive failed";
               "len" => len, "wr_id" => op_context, "err" => %e);
        Error::Provider(e)
    })
}
