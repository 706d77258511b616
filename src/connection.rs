//! Established connections: lifecycle events and the data plane.

use std::fmt;
use std::os::unix::io::RawFd;
use std::sync::Arc;

use bytes::Bytes;
use libc;
use slog::Logger;

use cq::CompletionQueue;
use flush::Flush;
use memory::{self, LocalMr, RemoteMr, Usage};
use peer::{Peer, PeerConfig};
use srq::SharedRq;
use verbs::{self, CmEvent, CmEventType, CmId, CompChannel, ConnParam, EventChannel, Qp};
use {CompletionFlags, Error, FlushType, Result, ATOMIC_WRITE_ALIGNMENT};

/// The connection state machine as the application observes it.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ConnectionEvent {
    /// No event has been delivered yet.
    Undefined,
    /// The connection is established.
    Established,
    /// The connection was closed in an orderly way.
    Closed,
    /// The connection was lost abruptly.
    Lost,
    /// The remote side rejected the request.
    Rejected,
    /// The remote side cannot be reached.
    Unreachable,
}

impl fmt::Display for ConnectionEvent {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match *self {
            ConnectionEvent::Undefined => "undefined connection event",
            ConnectionEvent::Established => "connection established",
            ConnectionEvent::Closed => "connection closed",
            ConnectionEvent::Lost => "connection lost",
            ConnectionEvent::Rejected => "connection rejected",
            ConnectionEvent::Unreachable => "connection unreachable",
        };
        f.write_str(s)
    }
}

/// An established bidirectional channel.
///
/// The connection owns its connection-manager identifier, a private event
/// channel (distinct from the endpoint's), the completion queues created
/// for the request it was promoted from, and the flush engine. These live
/// and die together.
///
/// Data-plane operations post through `&self` and are independent of each
/// other; control operations (`next_event`, `disconnect`, `delete`) take
/// the connection exclusively and are thereby serialized.
#[derive(Debug)]
pub struct Connection {
    log: Logger,
    id: Option<Box<dyn verbs::CmId>>,
    evch: Option<Box<dyn verbs::EventChannel>>,
    cq: Option<CompletionQueue>,
    rcq: Option<CompletionQueue>,
    /// The completion channel shared by the queues, when so configured.
    channel: Option<Arc<dyn CompChannel>>,
    flush: Option<Flush>,
    /// Private data of the connection; empty until the remote side supplies
    /// some.
    data: Bytes,
    /// Whether the remote peer accepts direct writes to persistent memory.
    direct_write_to_pmem: bool,
    srq: Option<Arc<SharedRq>>,
}

/// Release the not-yet-connected parts of a failed promotion, in reverse
/// construction order. Failures are logged and swallowed; the caller
/// reports the error that got us here.
pub(crate) fn dismantle_parts(
    log: &Logger,
    mut id: Box<dyn verbs::CmId>,
    cq: CompletionQueue,
    rcq: Option<CompletionQueue>,
    channel: Option<Arc<dyn CompChannel>>,
    disconnect: bool,
) {
    if disconnect {
        let _ = id.disconnect();
    }
    id.destroy_qp();
    if let Some(rcq) = rcq {
        if let Err(e) = rcq.delete() {
            warn!(log, "releasing the receive completion queue failed"; "err" => %e);
        }
    }
    if let Err(e) = cq.delete() {
        warn!(log, "releasing the completion queue failed"; "err" => %e);
    }
    if let Err(e) = id.destroy() {
        warn!(log, "destroying the cm id failed"; "err" => %e);
    }
    if let Some(channel) = channel {
        if let Err(e) = channel.destroy() {
            warn!(log, "destroying the completion channel failed"; "err" => %e);
        }
    }
}

impl Connection {
    /// Wrap the parts of a connection request into a connection: create the
    /// private event channel, migrate the identifier onto it and equip the
    /// result with a flush engine.
    ///
    /// On failure everything handed in is released; `disconnect` selects
    /// whether an already-accepted identifier is disconnected first.
    pub(crate) fn establish(
        log: Logger,
        peer: &Arc<Peer>,
        mut id: Box<dyn verbs::CmId>,
        cq: CompletionQueue,
        rcq: Option<CompletionQueue>,
        channel: Option<Arc<dyn CompChannel>>,
        srq: Option<Arc<SharedRq>>,
        data: Bytes,
        disconnect: bool,
    ) -> Result<Connection> {
        let evch = match peer.provider().create_event_channel() {
            Ok(evch) => evch,
            Err(e) => {
                error!(log, "creating the connection's event channel failed"; "err" => %e);
                dismantle_parts(&log, id, cq, rcq, channel, disconnect);
                return Err(Error::Provider(e));
            }
        };

        // may block while the identifier's previous channel still holds
        // unacknowledged events
        if let Err(e) = id.migrate(Some(evch.as_ref())) {
            error!(log, "migrating the cm id onto its event channel failed"; "err" => %e);
            let _ = evch.destroy();
            dismantle_parts(&log, id, cq, rcq, channel, disconnect);
            return Err(Error::Provider(e));
        }

        let flush = match Flush::new(peer) {
            Ok(flush) => flush,
            Err(e) => {
                let _ = id.migrate(None);
                let _ = evch.destroy();
                dismantle_parts(&log, id, cq, rcq, channel, disconnect);
                return Err(e);
            }
        };

        let conn = Connection {
            log,
            id: Some(id),
            evch: Some(evch),
            cq: Some(cq),
            rcq,
            channel,
            flush: Some(flush),
            data,
            direct_write_to_pmem: false,
            srq,
        };
        if let Some(ref srq) = conn.srq {
            srq.attach(conn.qp().qp_num());
        }
        Ok(conn)
    }

    /// Ask the remote side to establish the connection (active side only).
    pub(crate) fn initiate(&mut self, param: &ConnParam) -> Result<()> {
        // the identifier is present from construction to teardown
        let id = self.id.as_mut().unwrap();
        id.connect(param).map_err(|e| {
            error!(self.log, "initiating the connection failed"; "err" => %e);
            Error::Provider(e)
        })
    }

    fn qp(&self) -> &dyn Qp {
        // the queue pair is created before promotion and destroyed only at
        // teardown
        self.id.as_ref().unwrap().qp().unwrap()
    }

    /// Drain exactly one event from the connection's event channel.
    ///
    /// Returns `NoEvent` when the channel (in non-blocking mode) has
    /// nothing pending; otherwise blocks.
    ///
    /// # Errors
    ///
    /// - `NoEvent` - nothing is pending
    /// - `Provider` - draining or acknowledging the event failed
    /// - `Unknown` - the provider delivered an event outside the
    ///   documented map (logged as a warning)
    pub fn next_event(&mut self) -> Result<ConnectionEvent> {
        let event = {
            let evch = self.evch.as_ref().unwrap();
            match evch.get_cm_event() {
                Ok(event) => event,
                Err(e) => {
                    if e.raw_os_error() == Some(libc::ENODATA) {
                        return Err(Error::NoEvent);
                    }
                    error!(self.log, "draining a cm event failed"; "err" => %e);
                    return Err(Error::Provider(e));
                }
            }
        };

        if event.event() == CmEventType::Established && self.data.is_empty() {
            // capture the inbound private data before the ack releases the
            // event's storage
            self.data = Bytes::from(event.private_data().to_vec());
        }

        let ty = event.event();
        if let Err(e) = event.ack() {
            error!(self.log, "acknowledging a cm event failed"; "err" => %e);
            self.data = Bytes::new();
            return Err(Error::Provider(e));
        }

        let mapped = match ty {
            CmEventType::Established => ConnectionEvent::Established,
            CmEventType::ConnectError | CmEventType::DeviceRemoval => ConnectionEvent::Lost,
            CmEventType::Disconnected | CmEventType::TimewaitExit => ConnectionEvent::Closed,
            CmEventType::Rejected => ConnectionEvent::Rejected,
            CmEventType::Unreachable => ConnectionEvent::Unreachable,
            other => {
                warn!(self.log, "unexpected cm event"; "event" => %other);
                return Err(Error::Unknown);
            }
        };
        info!(self.log, "{}", mapped);
        Ok(mapped)
    }

    /// Request a disconnect.
    ///
    /// Either initiates a graceful close (expect a `Closed` event later) or
    /// finalizes one the remote side started. Repeating the call after
    /// `Closed` may succeed or report a provider code, but never corrupts
    /// the connection.
    ///
    /// # Errors
    ///
    /// - `Provider` - the disconnect failed
    pub fn disconnect(&mut self) -> Result<()> {
        let id = self.id.as_mut().unwrap();
        id.disconnect().map_err(|e| {
            error!(self.log, "disconnecting failed"; "err" => %e);
            Error::Provider(e)
        })?;
        info!(self.log, "requesting disconnection");
        Ok(())
    }

    /// Private data the remote side attached to the establishment; empty
    /// when there is none.
    pub fn private_data(&self) -> &[u8] {
        &self.data
    }

    /// Adopt the remote peer's capabilities for this connection.
    pub fn apply_remote_peer_cfg(&mut self, pcfg: &PeerConfig) {
        self.direct_write_to_pmem = pcfg.direct_write_to_pmem();
    }

    /// The connection's main completion queue.
    pub fn get_cq(&self) -> &CompletionQueue {
        self.cq.as_ref().unwrap()
    }

    /// The separate receive completion queue, when the configuration
    /// requested one.
    pub fn get_rcq(&self) -> Option<&CompletionQueue> {
        self.rcq.as_ref()
    }

    /// File descriptor of the connection's event channel.
    pub fn get_event_fd(&self) -> RawFd {
        self.evch.as_ref().unwrap().fd()
    }

    /// File descriptor of the shared completion channel; fails when the
    /// queues use channels of their own.
    pub fn get_compl_fd(&self) -> Result<RawFd> {
        match self.channel {
            Some(ref channel) => Ok(channel.fd()),
            None => Err(Error::NotSharedChannel),
        }
    }

    /// Number of the connection's queue pair.
    pub fn qp_num(&self) -> u32 {
        self.qp().qp_num()
    }

    fn check_rw_args(
        has_local: bool,
        has_remote: bool,
        local_offset: usize,
        remote_offset: usize,
        len: usize,
    ) -> Result<()> {
        if has_local && has_remote {
            return Ok(());
        }
        // the all-absent combination is the 0-byte operation; anything else
        // partially absent is inconsistent
        if has_local || has_remote || local_offset != 0 || remote_offset != 0 || len != 0 {
            return Err(Error::InvalidArg("regions and offsets are inconsistent"));
        }
        Ok(())
    }

    /// Read `len` bytes of `src` (at `src_offset`) into `dst` (at
    /// `dst_offset`).
    ///
    /// # Errors
    ///
    /// - `InvalidArg` - the completion flags are empty, or exactly one
    ///   region is absent, or the all-absent form carries a non-zero
    ///   offset or length
    /// - `Provider` - posting failed
    pub fn read(
        &self,
        dst: Option<&LocalMr>,
        dst_offset: usize,
        src: Option<&RemoteMr>,
        src_offset: usize,
        len: usize,
        flags: CompletionFlags,
        op_context: u64,
    ) -> Result<()> {
        if flags.is_empty() {
            return Err(Error::InvalidArg("completion flags are empty"));
        }
        Self::check_rw_args(dst.is_some(), src.is_some(), dst_offset, src_offset, len)?;
        memory::post_read(
            &self.log,
            self.qp(),
            dst,
            dst_offset,
            src,
            src_offset,
            len,
            flags,
            op_context,
        )
    }

    /// Write `len` bytes of `src` (at `src_offset`) into `dst` (at
    /// `dst_offset`).
    pub fn write(
        &self,
        dst: Option<&RemoteMr>,
        dst_offset: usize,
        src: Option<&LocalMr>,
        src_offset: usize,
        len: usize,
        flags: CompletionFlags,
        op_context: u64,
    ) -> Result<()> {
        if flags.is_empty() {
            return Err(Error::InvalidArg("completion flags are empty"));
        }
        Self::check_rw_args(src.is_some(), dst.is_some(), src_offset, dst_offset, len)?;
        memory::post_write(
            &self.log,
            self.qp(),
            dst,
            dst_offset,
            src,
            src_offset,
            len,
            flags,
            None,
            false,
            op_context,
        )
    }

    /// Like `write`, additionally delivering `imm` in the completion the
    /// remote side observes.
    pub fn write_with_imm(
        &self,
        dst: Option<&RemoteMr>,
        dst_offset: usize,
        src: Option<&LocalMr>,
        src_offset: usize,
        len: usize,
        flags: CompletionFlags,
        imm: u32,
        op_context: u64,
    ) -> Result<()> {
        if flags.is_empty() {
            return Err(Error::InvalidArg("completion flags are empty"));
        }
        Self::check_rw_args(src.is_some(), dst.is_some(), src_offset, dst_offset, len)?;
        memory::post_write(
            &self.log,
            self.qp(),
            dst,
            dst_offset,
            src,
            src_offset,
            len,
            flags,
            Some(imm),
            false,
            op_context,
        )
    }

    /// Atomically write 8 bytes into `dst` at an 8-byte-aligned offset.
    ///
    /// The request is fenced: an in-flight flush read completes before the
    /// atomic slot is written.
    ///
    /// # Errors
    ///
    /// - `InvalidArg` - the completion flags are empty, or the offset is
    ///   not 8-byte-aligned
    /// - `Provider` - posting failed
    pub fn atomic_write(
        &self,
        dst: &RemoteMr,
        dst_offset: usize,
        src: &[u8; 8],
        flags: CompletionFlags,
        op_context: u64,
    ) -> Result<()> {
        if flags.is_empty() {
            return Err(Error::InvalidArg("completion flags are empty"));
        }
        if dst_offset % ATOMIC_WRITE_ALIGNMENT != 0 {
            return Err(Error::InvalidArg("atomic write offset is unaligned"));
        }
        memory::post_atomic_write(&self.log, self.qp(), dst, dst_offset, src, flags, op_context)
    }

    /// Order `[dst_offset, dst_offset + len)` of `dst` down to visibility
    /// or persistence.
    ///
    /// # Errors
    ///
    /// - `InvalidArg` - the completion flags are empty
    /// - `NotSupported` - a persistent flush against a connection whose
    ///   remote peer has not opted into direct writes to persistence, or
    ///   either flavor against a region that does not advertise it; the
    ///   region is consulted only after the connection-level check passes
    /// - `Provider` - posting the flush failed
    pub fn flush(
        &self,
        dst: &RemoteMr,
        dst_offset: usize,
        len: usize,
        ty: FlushType,
        flags: CompletionFlags,
        op_context: u64,
    ) -> Result<()> {
        if flags.is_empty() {
            return Err(Error::InvalidArg("completion flags are empty"));
        }

        if ty == FlushType::Persistent && !self.direct_write_to_pmem {
            error!(
                self.log,
                "the remote peer is not configured for direct writes to persistent memory"
            );
            return Err(Error::NotSupported);
        }

        let flush_type = dst.flush_type();
        if ty == FlushType::Persistent && !flush_type.contains(Usage::FLUSH_PERSISTENT) {
            error!(self.log, "the remote region does not support flushing to persistence");
            return Err(Error::NotSupported);
        }
        if ty == FlushType::Visibility && !flush_type.contains(Usage::FLUSH_VISIBILITY) {
            error!(self.log, "the remote region does not support flushing to visibility");
            return Err(Error::NotSupported);
        }

        let flush = self.flush.as_ref().unwrap();
        flush.execute(self.qp(), dst, dst_offset, len, ty, flags, op_context)
    }

    /// Send `len` bytes of `src` as a message.
    pub fn send(
        &self,
        src: Option<&LocalMr>,
        offset: usize,
        len: usize,
        flags: CompletionFlags,
        op_context: u64,
    ) -> Result<()> {
        if flags.is_empty() {
            return Err(Error::InvalidArg("completion flags are empty"));
        }
        if src.is_none() && (offset != 0 || len != 0) {
            return Err(Error::InvalidArg("a 0-byte send takes no offset or length"));
        }
        memory::post_send(&self.log, self.qp(), src, offset, len, flags, None, op_context)
    }

    /// Like `send`, additionally delivering `imm` in the remote completion.
    pub fn send_with_imm(
        &self,
        src: Option<&LocalMr>,
        offset: usize,
        len: usize,
        flags: CompletionFlags,
        imm: u32,
        op_context: u64,
    ) -> Result<()> {
        if flags.is_empty() {
            return Err(Error::InvalidArg("completion flags are empty"));
        }
        if src.is_none() && (offset != 0 || len != 0) {
            return Err(Error::InvalidArg("a 0-byte send takes no offset or length"));
        }
        memory::post_send(&self.log, self.qp(), src, offset, len, flags, Some(imm), op_context)
    }

    /// Post a receive buffer. Posted buffers form an unordered set;
    /// arriving messages consume them in no specified order.
    pub fn recv(
        &self,
        dst: Option<&LocalMr>,
        offset: usize,
        len: usize,
        op_context: u64,
    ) -> Result<()> {
        if dst.is_none() && (offset != 0 || len != 0) {
            return Err(Error::InvalidArg("a 0-byte receive takes no offset or length"));
        }
        memory::post_recv(&self.log, self.qp(), dst, offset, len, op_context)
    }

    /// Tear the connection down: flush engine, queue pair, receive
    /// completion queue, main completion queue, identifier, event channel,
    /// private data, in that order. The first failure is reported; every
    /// resource is released regardless.
    pub fn delete(mut self) -> Result<()> {
        self.teardown()
    }

    fn teardown(&mut self) -> Result<()> {
        let log = self.log.clone();
        let mut first: Result<()> = Ok(());
        {
            let note = |what: &str, e: Error, first: &mut Result<()>| {
                if first.is_ok() {
                    *first = Err(e);
                } else {
                    warn!(log, "{} failed during teardown", what; "err" => %e);
                }
            };

            if let Some(srq) = self.srq.take() {
                if let Some(id) = self.id.as_ref() {
                    if let Some(qp) = id.qp() {
                        srq.detach(qp.qp_num());
                    }
                }
            }

            if let Some(flush) = self.flush.take() {
                if let Err(e) = flush.delete() {
                    note("releasing the flush engine", e, &mut first);
                }
            }

            if let Some(mut id) = self.id.take() {
                id.destroy_qp();
                if let Some(rcq) = self.rcq.take() {
                    if let Err(e) = rcq.delete() {
                        note("releasing the receive completion queue", e, &mut first);
                    }
                }
                if let Some(cq) = self.cq.take() {
                    if let Err(e) = cq.delete() {
                        note("releasing the completion queue", e, &mut first);
                    }
                }
                if let Err(e) = id.destroy() {
                    note("destroying the cm id", Error::Provider(e), &mut first);
                }
            }

            if let Some(evch) = self.evch.take() {
                if let Err(e) = evch.destroy() {
                    note("destroying the event channel", Error::Provider(e), &mut first);
                }
            }

            if let Some(channel) = self.channel.take() {
                if let Err(e) = channel.destroy() {
                    note("destroying the completion channel", Error::Provider(e), &mut first);
                }
            }
        }

        self.data = Bytes::new();
        first
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        let _ = self.teardown();
    }
}
