//! Passive listeners.

use std::os::unix::io::RawFd;
use std::sync::Arc;

use libc;
use slog::Logger;

use config::ConnectionConfig;
use info::Info;
use peer::Peer;
use request::ConnectionRequest;
use verbs::{self, CmEvent, CmEventType, CmId, EventChannel};
use {Error, Result, Side};

/// A listener bound to a local address, yielding incoming connection
/// requests.
#[derive(Debug)]
pub struct Endpoint {
    log: Logger,
    peer: Arc<Peer>,
    id: Option<Box<dyn verbs::CmId>>,
    evch: Option<Box<dyn verbs::EventChannel>>,
}

impl Endpoint {
    /// Bind a listener to `addr:port`.
    ///
    /// # Errors
    ///
    /// - `Provider` - creating the channel or identifier, translating the
    ///   address, binding, or listening failed; everything created so far
    ///   is released
    pub fn listen(log: Logger, peer: &Arc<Peer>, addr: &str, port: &str) -> Result<Endpoint> {
        let log = log.new(o!("local" => format!("{}:{}", addr, port)));

        let evch = peer.provider().create_event_channel().map_err(|e| {
            error!(log, "creating the listener's event channel failed"; "err" => %e);
            Error::Provider(e)
        })?;

        let mut id = peer.provider().create_id(Some(evch.as_ref())).map_err(|e| {
            error!(log, "creating the listening cm id failed"; "err" => %e);
            Error::Provider(e)
        })?;

        let info = Info::new(&log, peer.provider().as_ref(), addr, Some(port), Side::Passive)?;
        info.bind_addr(&mut *id)?;

        id.listen().map_err(|e| {
            error!(log, "listening failed"; "err" => %e);
            Error::Provider(e)
        })?;

        info!(log, "waiting for incoming connections");
        Ok(Endpoint {
            log,
            peer: peer.clone(),
            id: Some(id),
            evch: Some(evch),
        })
    }

    /// File descriptor of the listener's event channel, for event-loop
    /// parking.
    pub fn get_fd(&self) -> RawFd {
        self.evch.as_ref().unwrap().fd()
    }

    /// Drain one event from the listener's channel and promote it into a
    /// connection request.
    ///
    /// Only connect requests are welcome here; anything else is
    /// acknowledged and reported as invalid. Returns `NoEvent` when the
    /// channel (in non-blocking mode) has nothing pending; otherwise
    /// blocks.
    ///
    /// # Errors
    ///
    /// - `NoEvent` - nothing is pending
    /// - `InvalidArg` - the drained event is not a connect request, or
    ///   the configuration is inconsistent
    /// - `Provider` - draining the event or equipping the request failed
    pub fn next_conn_req(&self, cfg: Option<&ConnectionConfig>) -> Result<ConnectionRequest> {
        let default_cfg;
        let cfg = match cfg {
            Some(cfg) => cfg,
            None => {
                default_cfg = ConnectionConfig::new();
                &default_cfg
            }
        };

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

        if event.event() != CmEventType::ConnectRequest {
            error!(self.log, "unexpected cm event"; "event" => %event.event());
            if let Err(e) = event.ack() {
                warn!(self.log, "acknowledging the unexpected event failed"; "err" => %e);
            }
            return Err(Error::InvalidArg("the event is not a connect request"));
        }

        ConnectionRequest::from_cm_event(self.log.clone(), &self.peer, event, cfg)
    }

    /// Stop listening: destroy the identifier, then the event channel.
    pub fn shutdown(mut self) -> Result<()> {
        self.teardown()
    }

    fn teardown(&mut self) -> Result<()> {
        let mut first: Result<()> = Ok(());
        if let Some(id) = self.id.take() {
            if let Err(e) = id.destroy() {
                error!(self.log, "destroying the listening cm id failed"; "err" => %e);
                first = Err(Error::Provider(e));
            }
        }
        if let Some(evch) = self.evch.take() {
            if let Err(e) = evch.destroy() {
                if first.is_ok() {
                    first = Err(Error::Provider(e));
                } else {
                    warn!(self.log, "destroying the event channel failed"; "err" => %e);
                }
            }
        }
        first
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        let _ = self.teardown();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use testing::{logger, Fake};

    #[test]
    fn listen_failure_releases_channel_and_id() {
        let fake = Fake::new();
        let peer = fake.peer();
        fake.fail_once("listen");
        assert_matches!(
            Endpoint::listen(logger(), &peer, "192.0.2.1", "7777"),
            Err(Error::Provider(_))
        );
        assert_eq!(fake.live_ids(), 0);
        assert_eq!(fake.live_evchs(), 0);
    }

    #[test]
    fn bind_failure_releases_channel_and_id() {
        let fake = Fake::new();
        let peer = fake.peer();
        fake.fail_once("bind_addr");
        assert_matches!(
            Endpoint::listen(logger(), &peer, "192.0.2.1", "7777"),
            Err(Error::Provider(_))
        );
        assert_eq!(fake.live_ids(), 0);
        assert_eq!(fake.live_evchs(), 0);
    }

    #[test]
    fn the_listener_exposes_its_channel_fd() {
        let fake = Fake::new();
        let peer = fake.peer();
        let ep = Endpoint::listen(logger(), &peer, "192.0.2.1", "7777").unwrap();
        assert!(ep.get_fd() > 0);
        ep.shutdown().unwrap();
    }
}
