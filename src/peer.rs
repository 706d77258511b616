//! The process-level peer: one protection domain over one device context.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use libc;
use slog::Logger;

use config::{ConnectionConfig, SrqConfig};
use cq::CompletionQueue;
use memory::Usage;
use verbs::{self, Access, CmId, Context, Pd, Provider, QpAttr, SrqAttr, TransportType};
use {Error, Result};

/// Exclusive owner of a protection domain, parent of every registration
/// and queue pair derived from it.
///
/// A peer is shared as `Arc<Peer>` and outlives everything derived from
/// it; `Peer::delete` refuses to run while derivatives are alive.
#[derive(Debug)]
pub struct Peer {
    log: Logger,
    provider: Arc<dyn Provider>,
    ctx: Arc<dyn Context>,
    pd: Option<Box<dyn verbs::Pd>>,
    odp_supported: bool,
    atomic_write_supported: bool,
}

impl Peer {
    /// Allocate a protection domain over `ctx` and probe the device
    /// capabilities used later: on-demand paging and the native 8-byte
    /// atomic write.
    ///
    /// # Errors
    ///
    /// - `Provider` - a capability probe failed, or the allocation failed
    ///   with a code other than out-of-memory
    /// - `OutOfMemory` - the allocation failed with out-of-memory
    /// - `Unknown` - the allocation failed without reporting a cause
    pub fn new(
        log: Logger,
        provider: Arc<dyn Provider>,
        ctx: Arc<dyn Context>,
    ) -> Result<Arc<Peer>> {
        let atomic_write_supported = ctx.is_atomic_write_capable().map_err(Error::Provider)?;
        if !atomic_write_supported {
            info!(
                log,
                "native atomic write is not supported, an ordinary write will be used instead"
            );
        }
        let odp_supported = ctx.is_odp_capable().map_err(Error::Provider)?;

        let pd = ctx.alloc_pd().map_err(|e| {
            // the allocator reports out-of-memory and provider failures
            // through its code and "unknown" by carrying none
            match e.raw_os_error() {
                Some(code) if code == libc::ENOMEM => Error::OutOfMemory,
                Some(_) => {
                    error!(log, "allocating the protection domain failed"; "err" => %e);
                    Error::Provider(e)
                }
                None => Error::Unknown,
            }
        })?;

        Ok(Arc::new(Peer {
            log,
            provider,
            ctx,
            pd: Some(pd),
            odp_supported,
            atomic_write_supported,
        }))
    }

    /// Release the protection domain.
    ///
    /// # Errors
    ///
    /// - `InvalidArg` - a derived object is still alive; a peer has to
    ///   outlive its derivatives
    /// - `Provider` - deallocating the protection domain failed
    pub fn delete(this: Arc<Peer>) -> Result<()> {
        let mut peer = Arc::try_unwrap(this)
            .map_err(|_| Error::InvalidArg("peer still has live derivatives"))?;
        peer.teardown()
    }

    fn teardown(&mut self) -> Result<()> {
        if let Some(pd) = self.pd.take() {
            pd.dealloc().map_err(|e| {
                error!(self.log, "deallocating the protection domain failed"; "err" => %e);
                Error::Provider(e)
            })?;
        }
        Ok(())
    }

    pub(crate) fn log(&self) -> &Logger {
        &self.log
    }

    pub(crate) fn provider(&self) -> &Arc<dyn Provider> {
        &self.provider
    }

    pub(crate) fn context(&self) -> &Arc<dyn Context> {
        &self.ctx
    }

    fn pd(&self) -> &dyn verbs::Pd {
        // present from construction until the sole consuming destructor
        self.pd.as_ref().unwrap().as_ref()
    }

    /// Translate a usage mask into the access rights the registration
    /// needs.
    ///
    /// The flush flavors read from the flushed region, so they need the
    /// same access as a read source.
    fn usage_to_access(&self, usage: Usage) -> Access {
        let mut access = Access::default();

        if usage.intersects(Usage::READ_SRC | Usage::FLUSH_VISIBILITY | Usage::FLUSH_PERSISTENT) {
            access |= Access::REMOTE_READ;
        }

        if usage.intersects(Usage::READ_DST) {
            access |= Access::LOCAL_WRITE;
            // iWARP implements the READ operation as a WRITE in the
            // opposite direction
            if self.ctx.transport() == TransportType::Iwarp {
                access |= Access::REMOTE_WRITE;
            }
        }

        if usage.intersects(Usage::WRITE_SRC) {
            access |= Access::LOCAL_WRITE;
        }

        if usage.intersects(Usage::WRITE_DST) {
            // remote write access requires local write access
            access |= Access::REMOTE_WRITE | Access::LOCAL_WRITE;
        }

        if usage.intersects(Usage::RECV) {
            access |= Access::LOCAL_WRITE;
        }

        // nothing to set for Usage::SEND

        access
    }

    /// Register a span with the protection domain, retrying once with
    /// on-demand paging when the device supports it and plain registration
    /// is refused as unsupported.
    pub(crate) fn setup_mr_reg(
        &self,
        addr: u64,
        length: usize,
        usage: Usage,
    ) -> Result<Box<dyn verbs::Mr>> {
        let access = self.usage_to_access(usage);
        let err = match self.pd().reg_mr(addr, length, access) {
            Ok(mr) => return Ok(mr),
            Err(e) => e,
        };

        if err.raw_os_error() != Some(libc::EOPNOTSUPP) {
            error!(self.log, "memory registration failed";
                   "addr" => addr, "length" => length, "err" => %err);
            return Err(Error::Provider(err));
        }
        if !self.odp_supported {
            error!(self.log, "registration is unsupported and the device has no on-demand paging";
                   "addr" => addr, "length" => length, "err" => %err);
            return Err(Error::Provider(err));
        }

        self.pd()
            .reg_mr(addr, length, access | Access::ON_DEMAND)
            .map_err(|e| {
                error!(self.log, "memory registration with on-demand paging failed";
                       "addr" => addr, "length" => length, "err" => %e);
                Error::Provider(e)
            })
    }

    /// Create the queue pair of `id`.
    ///
    /// The send queue completes into `cq`; receives complete into `rcq`
    /// when one is given and fall back to `cq` otherwise.
    pub(crate) fn setup_qp(
        &self,
        id: &mut dyn CmId,
        cq: &CompletionQueue,
        rcq: Option<&CompletionQueue>,
        cfg: &ConnectionConfig,
    ) -> Result<()> {
        let srq = cfg.srq();
        let attr = QpAttr {
            sq_size: cfg.sq_size(),
            rq_size: cfg.rq_size(),
            max_sge: verbs::MAX_SGE,
            max_inline_data: verbs::MAX_INLINE_DATA,
            // every work request decides its own completion signaling
            sig_all: false,
            atomic_write_ops: self.atomic_write_supported,
        };
        let send_cq = cq.verbs_cq();
        let recv_cq = rcq.map(|rcq| rcq.verbs_cq()).unwrap_or(send_cq);
        id.create_qp(
            self.pd(),
            send_cq,
            recv_cq,
            srq.as_ref().map(|srq| srq.verbs_srq()),
            &attr,
        ).map_err(|e| {
            error!(self.log, "creating the queue pair failed";
                   "sq_size" => attr.sq_size, "rq_size" => attr.rq_size, "err" => %e);
            Error::Provider(e)
        })
    }

    /// Create a shared receive queue and, when the configuration asks for
    /// one, its receive completion queue.
    pub(crate) fn create_srq_pair(
        &self,
        cfg: &SrqConfig,
    ) -> Result<(Box<dyn verbs::Srq>, Option<CompletionQueue>)> {
        let attr = SrqAttr {
            max_wr: cfg.rq_size(),
            max_sge: verbs::MAX_SGE,
        };
        let srq = self.pd().create_srq(&attr).map_err(|e| {
            error!(self.log, "creating the shared receive queue failed";
                   "rq_size" => attr.max_wr, "err" => %e);
            Error::Provider(e)
        })?;

        let rcqe = cfg.rcqe();
        let rcq = if rcqe != 0 {
            Some(CompletionQueue::new(
                self.log.clone(),
                self.ctx.as_ref(),
                rcqe,
                None,
            )?)
        } else {
            None
        };
        Ok((srq, rcq))
    }
}

impl Drop for Peer {
    fn drop(&mut self) {
        let _ = self.teardown();
    }
}

/// Size of the wire descriptor of a peer configuration.
pub const PEER_CFG_DESCRIPTOR_SIZE: usize = 1;

/// Capabilities of a remote peer, exchanged out of band.
///
/// Presently a single flag: whether writes reach the remote persistence
/// domain directly.
#[derive(Debug)]
pub struct PeerConfig {
    direct_write_to_pmem: AtomicBool,
}

impl PeerConfig {
    pub fn new() -> PeerConfig {
        PeerConfig {
            direct_write_to_pmem: AtomicBool::new(false),
        }
    }

    /// Declare whether a direct write to persistent memory is supported.
    pub fn set_direct_write_to_pmem(&self, supported: bool) {
        self.direct_write_to_pmem.store(supported, Ordering::SeqCst);
    }

    pub fn direct_write_to_pmem(&self) -> bool {
        self.direct_write_to_pmem.load(Ordering::SeqCst)
    }

    /// Serialize the configuration for transmission to the remote peer.
    pub fn get_descriptor(&self) -> [u8; PEER_CFG_DESCRIPTOR_SIZE] {
        [self.direct_write_to_pmem() as u8]
    }

    /// Reconstruct a peer configuration received from the remote peer.
    ///
    /// # Errors
    ///
    /// - `InvalidArg` - the descriptor is shorter than the fixed layout
    pub fn from_descriptor(desc: &[u8]) -> Result<PeerConfig> {
        if desc.len() < PEER_CFG_DESCRIPTOR_SIZE {
            return Err(Error::InvalidArg("descriptor is shorter than the fixed layout"));
        }
        let cfg = PeerConfig::new();
        cfg.set_direct_write_to_pmem(desc[0] != 0);
        Ok(cfg)
    }
}

impl Default for PeerConfig {
    fn default() -> PeerConfig {
        PeerConfig::new()
    }
}
