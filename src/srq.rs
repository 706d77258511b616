//! The shared receive queue.

use std::sync::{Arc, Mutex};

use fnv::FnvHashSet;
use slog::Logger;

use config::SrqConfig;
use cq::CompletionQueue;
use memory::{self, LocalMr};
use peer::Peer;
use verbs::{self, Srq};
use {Error, Result};

/// A receive queue shared by several connections, with an optional receive
/// completion queue of its own.
///
/// The queue is shared as `Arc<SharedRq>`: the configuration that carries
/// it and every connection built with it hold a reference, so the queue
/// outlives its users by construction. Attaching and detaching connections
/// is not an operation callers may race with each other; serialize
/// externally.
#[derive(Debug)]
pub struct SharedRq {
    log: Logger,
    srq: Option<Box<dyn verbs::Srq>>,
    rcq: Option<CompletionQueue>,
    /// Queue-pair numbers of the connections currently attached.
    conns: Mutex<FnvHashSet<u32>>,
}

impl SharedRq {
    /// Create a shared receive queue and, when the configuration asks for
    /// one, its own receive completion queue.
    ///
    /// # Errors
    ///
    /// - `Provider` - creating the queue or its completion machinery
    ///   failed; everything created so far is released
    pub fn new(log: Logger, peer: &Arc<Peer>, cfg: Option<&SrqConfig>) -> Result<Arc<SharedRq>> {
        let default_cfg;
        let cfg = match cfg {
            Some(cfg) => cfg,
            None => {
                default_cfg = SrqConfig::new();
                &default_cfg
            }
        };
        let (srq, rcq) = peer.create_srq_pair(cfg)?;
        Ok(Arc::new(SharedRq {
            log,
            srq: Some(srq),
            rcq,
            conns: Mutex::new(FnvHashSet::default()),
        }))
    }

    /// Post a receive buffer to the shared queue.
    ///
    /// The buffers posted here form an unordered set; arriving messages
    /// consume them in no specified order.
    ///
    /// # Errors
    ///
    /// - `InvalidArg` - the 0-byte form carries an offset or length
    /// - `Provider` - posting failed
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
        memory::post_srq_recv(&self.log, self.verbs_srq(), dst, offset, len, op_context)
    }

    /// The queue's own receive completion queue, when it has one.
    pub fn get_rcq(&self) -> Option<&CompletionQueue> {
        self.rcq.as_ref()
    }

    pub(crate) fn verbs_srq(&self) -> &dyn verbs::Srq {
        // present from construction until the sole consuming destructor
        self.srq.as_ref().unwrap().as_ref()
    }

    pub(crate) fn attach(&self, qp_num: u32) {
        self.conns.lock().unwrap().insert(qp_num);
    }

    pub(crate) fn detach(&self, qp_num: u32) {
        self.conns.lock().unwrap().remove(&qp_num);
    }

    #[cfg(test)]
    pub(crate) fn attached(&self) -> usize {
        self.conns.lock().unwrap().len()
    }

    /// Destroy the queue and its completion queue.
    ///
    /// # Errors
    ///
    /// - `InvalidArg` - a configuration or a connection still references
    ///   the queue
    /// - `Provider` - a teardown step failed; the first failure is
    ///   reported, everything is released regardless
    pub fn delete(this: Arc<SharedRq>) -> Result<()> {
        let mut srq = Arc::try_unwrap(this)
            .map_err(|_| Error::InvalidArg("shared receive queue is still referenced"))?;
        srq.teardown()
    }

    fn teardown(&mut self) -> Result<()> {
        let mut first = Ok(());
        if let Some(rcq) = self.rcq.take() {
            if let Err(e) = rcq.delete() {
                first = Err(e);
            }
        }
        if let Some(srq) = self.srq.take() {
            if let Err(e) = srq.destroy() {
                if first.is_ok() {
                    first = Err(Error::Provider(e));
                } else {
                    warn!(self.log, "destroying the shared receive queue failed"; "err" => %e);
                }
            }
        }
        first
    }
}

impl Drop for SharedRq {
    fn drop(&mut self) {
        let _ = self.teardown();
    }
}
