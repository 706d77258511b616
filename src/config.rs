//! Connection and shared-receive-queue tunables.

use std::cmp;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use srq::SharedRq;
use DEFAULT_TIMEOUT_MS;

/// Default size shared by the completion, send and receive queues.
const DEFAULT_Q_SIZE: u32 = 10;

/// By default no separate receive completion queue is created.
const DEFAULT_RCQ_SIZE: u32 = 0;

/// Default size shared by a shared receive queue and its completion queue.
const DEFAULT_SRQ_SIZE: u32 = 100;

/// `ibv_create_cq`-compatible clipping of a queue size.
fn clip_to_int(size: u32) -> i32 {
    cmp::min(size, i32::max_value() as u32) as i32
}

/// Tunables of a single connection.
///
/// The scalar fields are published through sequentially consistent atomics,
/// so one thread may fill a configuration in and hand it to the thread that
/// runs the constructor; concurrent set/get on disjoint fields never tears
/// a value. The shared-receive-queue handle is attached through `&mut`
/// before the configuration is published.
#[derive(Debug)]
pub struct ConnectionConfig {
    timeout_ms: AtomicU32,
    cq_size: AtomicU32,
    rcq_size: AtomicU32,
    sq_size: AtomicU32,
    rq_size: AtomicU32,
    shared_comp_channel: AtomicBool,
    srq: Option<Arc<SharedRq>>,
}

impl ConnectionConfig {
    pub fn new() -> ConnectionConfig {
        ConnectionConfig {
            timeout_ms: AtomicU32::new(DEFAULT_TIMEOUT_MS),
            cq_size: AtomicU32::new(DEFAULT_Q_SIZE),
            rcq_size: AtomicU32::new(DEFAULT_RCQ_SIZE),
            sq_size: AtomicU32::new(DEFAULT_Q_SIZE),
            rq_size: AtomicU32::new(DEFAULT_Q_SIZE),
            shared_comp_channel: AtomicBool::new(false),
            srq: None,
        }
    }

    /// Establishment timeout applied to address and route resolution.
    pub fn set_timeout(&self, timeout_ms: u32) {
        self.timeout_ms.store(timeout_ms, Ordering::SeqCst);
    }

    pub fn timeout_ms(&self) -> u32 {
        self.timeout_ms.load(Ordering::SeqCst)
    }

    pub fn set_cq_size(&self, cq_size: u32) {
        self.cq_size.store(cq_size, Ordering::SeqCst);
    }

    pub fn cq_size(&self) -> u32 {
        self.cq_size.load(Ordering::SeqCst)
    }

    /// Size of the separate receive completion queue; zero leaves receives
    /// on the main queue.
    pub fn set_rcq_size(&self, rcq_size: u32) {
        self.rcq_size.store(rcq_size, Ordering::SeqCst);
    }

    pub fn rcq_size(&self) -> u32 {
        self.rcq_size.load(Ordering::SeqCst)
    }

    pub fn set_sq_size(&self, sq_size: u32) {
        self.sq_size.store(sq_size, Ordering::SeqCst);
    }

    pub fn sq_size(&self) -> u32 {
        self.sq_size.load(Ordering::SeqCst)
    }

    pub fn set_rq_size(&self, rq_size: u32) {
        self.rq_size.store(rq_size, Ordering::SeqCst);
    }

    pub fn rq_size(&self) -> u32 {
        self.rq_size.load(Ordering::SeqCst)
    }

    /// Whether the main and receive completion queues share one channel.
    pub fn set_shared_comp_channel(&self, shared: bool) {
        self.shared_comp_channel.store(shared, Ordering::SeqCst);
    }

    pub fn shared_comp_channel(&self) -> bool {
        self.shared_comp_channel.load(Ordering::SeqCst)
    }

    /// Attach a shared receive queue. Attached before the configuration is
    /// handed over; the queue has to outlive every connection built from
    /// this configuration.
    pub fn set_srq(&mut self, srq: &Arc<SharedRq>) {
        self.srq = Some(srq.clone());
    }

    pub fn srq(&self) -> Option<Arc<SharedRq>> {
        self.srq.clone()
    }

    pub(crate) fn cqe(&self) -> i32 {
        clip_to_int(self.cq_size())
    }

    pub(crate) fn rcqe(&self) -> i32 {
        clip_to_int(self.rcq_size())
    }
}

impl Default for ConnectionConfig {
    fn default() -> ConnectionConfig {
        ConnectionConfig::new()
    }
}

/// Tunables of a shared receive queue.
#[derive(Debug)]
pub struct SrqConfig {
    rq_size: AtomicU32,
    rcq_size: AtomicU32,
}

impl SrqConfig {
    pub fn new() -> SrqConfig {
        SrqConfig {
            rq_size: AtomicU32::new(DEFAULT_SRQ_SIZE),
            rcq_size: AtomicU32::new(DEFAULT_SRQ_SIZE),
        }
    }

    pub fn set_rq_size(&self, rq_size: u32) {
        self.rq_size.store(rq_size, Ordering::SeqCst);
    }

    pub fn rq_size(&self) -> u32 {
        self.rq_size.load(Ordering::SeqCst)
    }

    /// Size of the queue's own receive completion queue; zero means the
    /// queue comes without one and connections keep their own.
    pub fn set_rcq_size(&self, rcq_size: u32) {
        self.rcq_size.store(rcq_size, Ordering::SeqCst);
    }

    pub fn rcq_size(&self) -> u32 {
        self.rcq_size.load(Ordering::SeqCst)
    }

    pub(crate) fn rcqe(&self) -> i32 {
        clip_to_int(self.rcq_size())
    }
}

impl Default for SrqConfig {
    fn default() -> SrqConfig {
        SrqConfig::new()
    }
}
