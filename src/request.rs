//! Connection requests: outgoing attempts and accepted incoming offers.

use std::mem;
use std::sync::Arc;

use bytes::Bytes;
use slog::Logger;

use config::ConnectionConfig;
use connection::{self, Connection};
use cq::CompletionQueue;
use info::Info;
use memory::{self, LocalMr};
use peer::Peer;
use srq::SharedRq;
use verbs::{
    self, CmEvent, CmEventType, CmId, CompChannel, ConnParam, Context, MAX_INIT_DEPTH,
    MAX_RESP_RES,
};
use {Error, Result, Side, MAX_PRIVATE_DATA};

/// Which side the request came from; teardown differs.
#[derive(Debug)]
enum Kind {
    /// An outgoing attempt; its identifier is ours to destroy.
    Active,
    /// An accepted incoming offer; not promoting it means rejecting it.
    Passive {
        /// The connect-request event, acknowledged on every consumption
        /// path.
        event: Option<Box<dyn CmEvent>>,
    },
}

/// A transient, not-yet-established connection.
///
/// A request is either promoted into a `Connection` by `connect` or torn
/// down by `delete`; both consume it.
#[derive(Debug)]
pub struct ConnectionRequest {
    log: Logger,
    peer: Arc<Peer>,
    kind: Kind,
    id: Option<Box<dyn verbs::CmId>>,
    cq: Option<CompletionQueue>,
    rcq: Option<CompletionQueue>,
    /// Completion channel shared by the queues, when so configured.
    channel: Option<Arc<dyn CompChannel>>,
    /// Inbound private data (incoming requests only).
    data: Bytes,
    srq: Option<Arc<SharedRq>>,
}

impl ConnectionRequest {
    /// Create an outgoing connection request towards `addr:port`.
    ///
    /// Address and route resolution block up to the configured timeout
    /// each.
    ///
    /// # Errors
    ///
    /// - `InvalidArg` - the configuration combines a shared completion
    ///   channel with a shared receive queue owning its own completion
    ///   queue
    /// - `Provider` - translation, resolution, or creating the completion
    ///   machinery or the queue pair failed; everything created so far is
    ///   released
    pub fn new(
        log: Logger,
        peer: &Arc<Peer>,
        addr: &str,
        port: &str,
        cfg: Option<&ConnectionConfig>,
    ) -> Result<ConnectionRequest> {
        let default_cfg;
        let cfg = match cfg {
            Some(cfg) => cfg,
            None => {
                default_cfg = ConnectionConfig::new();
                &default_cfg
            }
        };
        let log = log.new(o!("remote" => format!("{}:{}", addr, port)));
        let timeout_ms = cfg.timeout_ms();

        let info = Info::new(&log, peer.provider().as_ref(), addr, Some(port), Side::Active)?;

        let mut id = peer.provider().create_id(None).map_err(|e| {
            error!(log, "creating the cm id failed"; "err" => %e);
            Error::Provider(e)
        })?;

        info.resolve_addr(&mut *id, timeout_ms).map_err(|e| {
            error!(log, "resolving the address failed"; "timeout_ms" => timeout_ms);
            e
        })?;
        id.resolve_route(timeout_ms).map_err(|e| {
            error!(log, "resolving the route failed";
                   "timeout_ms" => timeout_ms, "err" => %e);
            Error::Provider(e)
        })?;

        let req = Self::from_id(log, peer, id, cfg)?;
        info!(req.log, "requesting a connection");
        Ok(req)
    }

    /// Wrap the identifier of a connect-request event into a request.
    ///
    /// The event stays with the request and is acknowledged when the
    /// request is consumed.
    pub(crate) fn from_cm_event(
        log: Logger,
        peer: &Arc<Peer>,
        mut event: Box<dyn CmEvent>,
        cfg: &ConnectionConfig,
    ) -> Result<ConnectionRequest> {
        if event.event() != CmEventType::ConnectRequest {
            return Err(Error::InvalidArg("the event is not a connect request"));
        }
        // store a copy of the offered private data
        let data = Bytes::from(event.private_data().to_vec());
        let id = match event.take_id() {
            Some(id) => id,
            None => return Err(Error::Unknown),
        };

        let err_log = log.clone();
        match Self::from_id(log, peer, id, cfg) {
            Ok(mut req) => {
                req.kind = Kind::Passive { event: Some(event) };
                req.data = data;
                Ok(req)
            }
            Err(e) => {
                if let Err(ack_err) = event.ack() {
                    warn!(err_log, "acknowledging the connect-request event failed";
                          "err" => %ack_err);
                }
                Err(e)
            }
        }
    }

    /// Equip `id` with completion queues and a queue pair per `cfg`.
    fn from_id(
        log: Logger,
        peer: &Arc<Peer>,
        mut id: Box<dyn verbs::CmId>,
        cfg: &ConnectionConfig,
    ) -> Result<ConnectionRequest> {
        let cqe = cfg.cqe();
        let rcqe = cfg.rcqe();
        let shared = cfg.shared_comp_channel();
        let srq = cfg.srq();
        let srq_has_rcq = srq.as_ref().map_or(false, |srq| srq.get_rcq().is_some());

        if shared && srq_has_rcq {
            error!(
                log,
                "a shared completion channel cannot be used when the shared receive queue has its own completion queue"
            );
            return Err(Error::InvalidArg(
                "shared completion channel conflicts with the shared receive queue's own completion queue",
            ));
        }

        let ctx = match id.context() {
            Some(ctx) => ctx,
            None => return Err(Error::Unknown),
        };

        let channel: Option<Arc<dyn CompChannel>> = if shared {
            let channel = ctx.create_comp_channel().map_err(|e| {
                error!(log, "creating the shared completion channel failed"; "err" => %e);
                Error::Provider(e)
            })?;
            Some(Arc::from(channel))
        } else {
            None
        };

        // errors below this point unwind through the owned handles
        let cq = CompletionQueue::new(log.clone(), ctx.as_ref(), cqe, channel.as_ref())?;

        let rcq = if !srq_has_rcq && rcqe != 0 {
            Some(CompletionQueue::new(
                log.clone(),
                ctx.as_ref(),
                rcqe,
                channel.as_ref(),
            )?)
        } else {
            None
        };

        {
            let srq_rcq = srq.as_ref().and_then(|srq| srq.get_rcq());
            peer.setup_qp(&mut *id, &cq, srq_rcq.or_else(|| rcq.as_ref()), cfg)?;
        }

        Ok(ConnectionRequest {
            log,
            peer: peer.clone(),
            kind: Kind::Active,
            id: Some(id),
            cq: Some(cq),
            rcq,
            channel,
            data: Bytes::new(),
            srq,
        })
    }

    /// Private data the remote side attached to its offer; empty for
    /// outgoing requests.
    pub fn get_private_data(&self) -> &[u8] {
        &self.data
    }

    /// Post a receive buffer before the connection is established, so
    /// buffers are in place for messages racing the establishment event.
    ///
    /// # Errors
    ///
    /// - `Provider` - posting failed
    pub fn recv(&self, dst: &LocalMr, offset: usize, len: usize, op_context: u64) -> Result<()> {
        let id = self.id.as_ref().unwrap();
        let qp = match id.qp() {
            Some(qp) => qp,
            None => return Err(Error::Unknown),
        };
        memory::post_recv(&self.log, qp, Some(dst), offset, len, op_context)
    }

    /// Promote the request into a connection, consuming it regardless of
    /// the outcome.
    ///
    /// `pdata` is either absent or a non-empty payload of at most 255
    /// bytes, carried verbatim to the remote side.
    ///
    /// # Errors
    ///
    /// - `InvalidArg` - `pdata` is present but empty, or exceeds the
    ///   transport limit
    /// - `Provider` - accepting, initiating, or assembling the connection
    ///   failed; the request's resources are released either way
    pub fn connect(mut self, pdata: Option<&[u8]>) -> Result<Connection> {
        if let Some(pdata) = pdata {
            if pdata.is_empty() {
                let _ = self.delete();
                return Err(Error::InvalidArg("private data is present but empty"));
            }
            if pdata.len() > MAX_PRIVATE_DATA {
                let _ = self.delete();
                return Err(Error::InvalidArg("private data exceeds the transport limit"));
            }
        }

        let param = ConnParam {
            private_data: pdata.unwrap_or(&[]),
            responder_resources: MAX_RESP_RES,
            initiator_depth: MAX_INIT_DEPTH,
            flow_control: 1,
            retry_count: 7,     // max 3-bit value
            rnr_retry_count: 7, // max 3-bit value
        };

        // pull the parts out; the emptied shell's drop has nothing left to
        // do
        let log = self.log.clone();
        let peer = self.peer.clone();
        let mut id = self.id.take().unwrap();
        let cq = self.cq.take().unwrap();
        let rcq = self.rcq.take();
        let channel = self.channel.take();
        let srq = self.srq.take();
        let data = mem::replace(&mut self.data, Bytes::new());
        let kind = mem::replace(&mut self.kind, Kind::Active);
        mem::drop(self);

        match kind {
            Kind::Passive { event } => {
                if let Err(e) = id.accept(&param) {
                    error!(log, "accepting the connection failed"; "err" => %e);
                    connection::dismantle_parts(&log, id, cq, rcq, channel, false);
                    if let Some(event) = event {
                        if let Err(e) = event.ack() {
                            warn!(log, "acknowledging the connect-request event failed";
                                  "err" => %e);
                        }
                    }
                    return Err(Error::Provider(e));
                }

                // the event has to be acknowledged before the identifier
                // can migrate onto the connection's own channel
                if let Some(event) = event {
                    if let Err(e) = event.ack() {
                        error!(log, "acknowledging the connect-request event failed";
                               "err" => %e);
                        connection::dismantle_parts(&log, id, cq, rcq, channel, true);
                        return Err(Error::Provider(e));
                    }
                }

                // the inbound private data transfers into the connection
                Connection::establish(log, &peer, id, cq, rcq, channel, srq, data, true)
            }
            Kind::Active => {
                let mut conn = Connection::establish(
                    log.clone(),
                    &peer,
                    id,
                    cq,
                    rcq,
                    channel,
                    srq,
                    Bytes::new(),
                    false,
                )?;
                if let Err(e) = conn.initiate(&param) {
                    let _ = conn.delete();
                    return Err(e);
                }
                Ok(conn)
            }
        }
    }

    /// Tear the request down: queue pair, receive completion queue, main
    /// completion queue, then reject (incoming) or destroy (outgoing) the
    /// identifier, release the channel and the stored private data. The
    /// first failure is reported; every resource is released regardless.
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
                match mem::replace(&mut self.kind, Kind::Active) {
                    Kind::Passive { event } => {
                        // an incoming request that is not promoted is
                        // rejected
                        if let Err(e) = id.reject() {
                            note("rejecting the request", Error::Provider(e), &mut first);
                        }
                        mem::drop(id);
                        if let Some(event) = event {
                            if let Err(e) = event.ack() {
                                note(
                                    "acknowledging the connect-request event",
                                    Error::Provider(e),
                                    &mut first,
                                );
                            }
                        }
                    }
                    Kind::Active => {
                        if let Err(e) = id.destroy() {
                            note("destroying the cm id", Error::Provider(e), &mut first);
                        }
                    }
                }
            }

            if let Some(channel) = self.channel.take() {
                if let Err(e) = channel.destroy() {
                    note("destroying the completion channel", Error::Provider(e), &mut first);
                }
            }
        }

        self.data = Bytes::new();
        self.srq = None;
        first
    }
}

impl Drop for ConnectionRequest {
    fn drop(&mut self) {
        let _ = self.teardown();
    }
}
