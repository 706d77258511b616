//! Completion dispatching across a set of connections.
//!
//! A `Dispatcher` owns the connections attached to it and drives their
//! completion processing from a single loop: completions drained from each
//! connection's main queue are cached and handed to the connection's
//! handler, and deferred calls enqueued from any thread run between
//! batches. The loop spins until broken from a handler, a deferred call or
//! another thread.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use slog::Logger;

use connection::Connection;
use verbs::Wc;
use {Error, Result};

/// How many completions are drained from one queue per poll.
const DISPATCH_BATCH: usize = 8;

/// Per-connection completion callback.
pub trait CompletionHandler: Send {
    /// Called once for every completion the connection yields. An error
    /// stops the dispatch loop and is returned from `dispatch`.
    fn on_completion(&self, conn: &Connection, wc: &Wc) -> Result<()>;
}

/// A call deferred onto the dispatch loop, targeting one attached
/// connection.
pub type DeferredFunc = Box<dyn FnOnce(&Connection) -> Result<()> + Send>;

struct Attached {
    conn: Connection,
    handler: Box<dyn CompletionHandler>,
}

type FuncQueue = Arc<Mutex<VecDeque<(u32, DeferredFunc)>>>;

/// Cross-thread handle for breaking the loop and deferring calls onto it.
#[derive(Clone)]
pub struct DispatchControl {
    waiting: Arc<AtomicU64>,
    funcs: FuncQueue,
}

impl DispatchControl {
    /// Stop the dispatch loop after the batch in progress.
    pub fn break_dispatch(&self) {
        self.waiting.store(0, Ordering::SeqCst);
    }

    /// Run `func` on the dispatch loop against the connection with the
    /// given queue-pair number.
    pub fn enqueue(&self, qp_num: u32, func: DeferredFunc) {
        self.funcs.lock().unwrap().push_back((qp_num, func));
    }
}

/// Owner of attached connections and their completion processing.
pub struct Dispatcher {
    log: Logger,
    waiting: Arc<AtomicU64>,
    conns: Vec<Attached>,
    /// Completions drained but not yet handed to their handler.
    pending: VecDeque<(u32, Wc)>,
    funcs: FuncQueue,
}

impl Dispatcher {
    pub fn new(log: Logger) -> Dispatcher {
        Dispatcher {
            log,
            waiting: Arc::new(AtomicU64::new(0)),
            conns: Vec::new(),
            pending: VecDeque::new(),
            funcs: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    /// Hand a connection over to the dispatcher. Returns the queue-pair
    /// number identifying it for `detach` and `DispatchControl::enqueue`.
    pub fn attach(&mut self, conn: Connection, handler: Box<dyn CompletionHandler>) -> u32 {
        let qp_num = conn.qp_num();
        self.conns.push(Attached { conn, handler });
        qp_num
    }

    /// Take a connection back from the dispatcher.
    ///
    /// # Errors
    ///
    /// - `InvalidArg` - no attached connection carries `qp_num`
    pub fn detach(&mut self, qp_num: u32) -> Result<Connection> {
        match self.conns.iter().position(|a| a.conn.qp_num() == qp_num) {
            Some(pos) => Ok(self.conns.remove(pos).conn),
            None => Err(Error::InvalidArg("connection is not attached")),
        }
    }

    /// Borrow an attached connection.
    pub fn connection(&self, qp_num: u32) -> Option<&Connection> {
        self.conns
            .iter()
            .find(|a| a.conn.qp_num() == qp_num)
            .map(|a| &a.conn)
    }

    /// The handle other threads use to break the loop or defer calls.
    pub fn control(&self) -> DispatchControl {
        DispatchControl {
            waiting: self.waiting.clone(),
            funcs: self.funcs.clone(),
        }
    }

    /// Run the dispatch loop until broken.
    ///
    /// Each round drains every attached connection's main completion
    /// queue, hands the cached completions to their handlers, and runs the
    /// deferred calls enqueued so far. The loop does not sleep; park the
    /// connections' file descriptors externally when idling matters.
    ///
    /// # Errors
    ///
    /// The first error from a completion poll, a handler or a deferred
    /// call stops the loop and is returned.
    pub fn dispatch(&mut self) -> Result<()> {
        self.waiting.fetch_or(1, Ordering::SeqCst);

        while self.waiting.load(Ordering::Acquire) != 0 {
            self.process_cqs()?;

            // hand the cached completions to their handlers
            while let Some((qp_num, wc)) = self.pending.pop_front() {
                match self.conns.iter().find(|a| a.conn.qp_num() == qp_num) {
                    Some(attached) => attached.handler.on_completion(&attached.conn, &wc)?,
                    None => {
                        warn!(self.log, "dropping a completion of a detached connection";
                              "qp_num" => qp_num, "wr_id" => wc.wr_id);
                    }
                }
            }

            loop {
                let entry = self.funcs.lock().unwrap().pop_front();
                let (qp_num, func) = match entry {
                    Some(entry) => entry,
                    None => break,
                };
                match self.conns.iter().find(|a| a.conn.qp_num() == qp_num) {
                    Some(attached) => func(&attached.conn)?,
                    None => {
                        warn!(self.log, "dropping a deferred call to a detached connection";
                              "qp_num" => qp_num);
                    }
                }
            }
        }

        Ok(())
    }

    fn process_cqs(&mut self) -> Result<()> {
        for i in 0..self.conns.len() {
            let qp_num = self.conns[i].conn.qp_num();
            loop {
                let mut wc = [Wc::default(); DISPATCH_BATCH];
                let mut got = 0;
                match self.conns[i].conn.get_cq().get_wc(&mut wc, Some(&mut got)) {
                    Ok(()) => {
                        for entry in &wc[..got] {
                            self.pending.push_back((qp_num, *entry));
                        }
                    }
                    Err(Error::NoCompletion) => break,
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(())
    }
}
