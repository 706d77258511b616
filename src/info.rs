//! Address translation and device discovery.

use std::io;
use std::sync::Arc;

use slog::Logger;

use verbs::{AddrInfo, AddrInfoError, CmId, Context, Provider};
use {Error, Result, Side, DEFAULT_TIMEOUT_MS};

/// A cached, side-tagged address translation record.
///
/// An `Info` is short-lived: it is created for one bind or resolve and
/// discarded afterwards, and is never shared across connections.
#[derive(Debug)]
pub struct Info {
    side: Side,
    info: AddrInfo,
}

impl Info {
    /// Translate `addr` (and optionally `port`) for the given side.
    ///
    /// The translation requests reliable, connection-oriented queue pairs
    /// in the TCP port space.
    ///
    /// # Errors
    ///
    /// - `Provider` - the resolver failed; a system failure carries its OS
    ///   code, any other failure preserves the resolver's own code
    pub fn new(
        log: &Logger,
        provider: &dyn Provider,
        addr: &str,
        port: Option<&str>,
        side: Side,
    ) -> Result<Info> {
        let info = provider
            .getaddrinfo(addr, port, side == Side::Passive)
            .map_err(|e| match e {
                AddrInfoError::System(e) => {
                    error!(log, "address translation failed";
                           "addr" => addr, "side" => ?side, "err" => %e);
                    Error::Provider(e)
                }
                AddrInfoError::Resolver { code, message } => {
                    error!(log, "address translation failed";
                           "addr" => addr, "side" => ?side,
                           "code" => code, "err" => %message);
                    Error::Provider(io::Error::new(
                        io::ErrorKind::Other,
                        format!("resolver error {}: {}", code, message),
                    ))
                }
            })?;
        Ok(Info { side, info })
    }

    /// Resolve `id`'s local and remote addresses from the cached record.
    /// Requires an active-side record. Blocks up to `timeout_ms`.
    ///
    /// # Errors
    ///
    /// - `InvalidArg` - the record serves the other side, or carries no
    ///   destination
    /// - `Provider` - address resolution failed
    pub fn resolve_addr(&self, id: &mut dyn CmId, timeout_ms: u32) -> Result<()> {
        if self.side != Side::Active {
            return Err(Error::InvalidArg("resolve_addr requires an active-side record"));
        }
        let dst = match self.info.dst {
            Some(ref dst) => dst,
            None => return Err(Error::InvalidArg("translation carries no destination address")),
        };
        id.resolve_addr(self.info.src.as_ref(), dst, timeout_ms)?;
        Ok(())
    }

    /// Bind `id` to the cached local address. Requires a passive-side
    /// record.
    ///
    /// # Errors
    ///
    /// - `InvalidArg` - the record serves the other side, or carries no
    ///   source
    /// - `Provider` - binding failed
    pub fn bind_addr(&self, id: &mut dyn CmId) -> Result<()> {
        if self.side != Side::Passive {
            return Err(Error::InvalidArg("bind_addr requires a passive-side record"));
        }
        let src = match self.info.src {
            Some(ref src) => src,
            None => return Err(Error::InvalidArg("translation carries no source address")),
        };
        id.bind_addr(src)?;
        Ok(())
    }
}

/// Whether `get_context` looks the device up by a local or a remote
/// address.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ContextKind {
    /// The address names a local interface; bind to it.
    Local,
    /// The address names a remote node; resolve a route towards it.
    Remote,
}

/// Obtain the device context serving `addr`.
///
/// Composes a translation record with a transient connection-manager
/// identifier; the identifier is always destroyed before returning, and a
/// destruction failure never masks an earlier one.
///
/// # Errors
///
/// - `Provider` - translation, identifier creation, binding, resolution
///   or the final identifier destruction failed
/// - `Unknown` - the identifier reported no device context after binding
pub fn get_context(
    log: &Logger,
    provider: &Arc<dyn Provider>,
    addr: &str,
    kind: ContextKind,
) -> Result<Arc<dyn Context>> {
    let side = match kind {
        ContextKind::Local => Side::Passive,
        ContextKind::Remote => Side::Active,
    };
    let info = Info::new(log, provider.as_ref(), addr, None, side)?;

    let mut id = provider.create_id(None).map_err(|e| {
        error!(log, "creating a transient cm id failed"; "err" => %e);
        Error::Provider(e)
    })?;

    let res = match side {
        Side::Passive => info.bind_addr(&mut *id),
        Side::Active => info.resolve_addr(&mut *id, DEFAULT_TIMEOUT_MS),
    };
    let res = res.and_then(|_| id.context().ok_or(Error::Unknown));

    match id.destroy() {
        Ok(()) => res,
        Err(e) => match res {
            // a successful lookup is still spoiled by failing to release
            // the transient id
            Ok(_) => Err(Error::Provider(e)),
            Err(first) => {
                warn!(log, "destroying the transient cm id failed"; "err" => %e);
                Err(first)
            }
        },
    }
}
