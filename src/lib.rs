//! Connection-oriented remote persistent memory access over RDMA.
//!
//! This library wraps the RDMA connection-manager and verbs primitives in a
//! small set of owned objects: a `Peer` bound to one device context, an
//! `Endpoint` listening for incoming requests, a `ConnectionRequest`
//! representing a not-yet-established connection, and a `Connection`
//! exposing one-sided reads and writes, persistence flushes and two-sided
//! messaging. The library performs no waiting of its own beyond the calls
//! documented as blocking; callers park the exposed file descriptors in the
//! event loop of their choice.
//!
//! The underlying transport is consumed through the contract in the `verbs`
//! module and is otherwise out of scope.

extern crate byteorder;
extern crate bytes;
#[macro_use]
extern crate failure;
extern crate fnv;
#[macro_use]
extern crate lazy_static;
extern crate libc;
#[macro_use]
extern crate slog;

#[cfg(test)]
#[macro_use]
extern crate assert_matches;
#[cfg(test)]
#[macro_use]
extern crate hex_literal;
#[cfg(test)]
extern crate slog_term;

use std::io;
use std::ops;
use std::os::unix::io::RawFd;

mod config;
mod connection;
mod cq;
mod dispatcher;
mod endpoint;
mod flush;
mod info;
mod memory;
mod msg;
mod peer;
mod request;
mod srq;
pub mod verbs;

#[cfg(test)]
mod testing;

pub use config::{ConnectionConfig, SrqConfig};
pub use connection::{Connection, ConnectionEvent};
pub use cq::CompletionQueue;
pub use dispatcher::{CompletionHandler, DeferredFunc, DispatchControl, Dispatcher};
pub use endpoint::Endpoint;
pub use info::{get_context, ContextKind, Info};
pub use memory::{LocalMr, RemoteMr, Usage, DESCRIPTOR_SIZE};
pub use msg::MessageRing;
pub use peer::{Peer, PeerConfig, PEER_CFG_DESCRIPTOR_SIZE};
pub use request::ConnectionRequest;
pub use srq::SharedRq;

/// Required alignment of the target offset of an atomic write.
pub const ATOMIC_WRITE_ALIGNMENT: usize = 8;

/// Establishment timeout applied when the caller provides no configuration.
pub const DEFAULT_TIMEOUT_MS: u32 = 1000;

/// Upper bound on the length of connection private data the transport
/// carries verbatim.
pub const MAX_PRIVATE_DATA: usize = 255;

/// Which side of a connection an address translation record serves.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Side {
    /// The connecting side.
    Active,
    /// The listening side.
    Passive,
}

/// Flavors of the remote flush operation.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum FlushType {
    /// Flush deep enough to make preceding writes visible on the remote
    /// node.
    Visibility,
    /// Flush down to the remote persistence domain.
    Persistent,
}

/// Completion generation policy shared by all data-plane operations.
///
/// Operations posted with `ON_ERROR` alone consume no completion-queue slot
/// on success; a slot is used only when a failure generates the completion.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct CompletionFlags(pub u32);

impl CompletionFlags {
    /// Generate a completion only if the operation fails.
    pub const ON_ERROR: CompletionFlags = CompletionFlags(0x1);
    /// Generate a completion regardless of the operation's result.
    pub const ALWAYS: CompletionFlags = CompletionFlags(0x1 | 0x2);

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Whether a successful operation has to be signaled.
    pub(crate) fn on_success(self) -> bool {
        self.0 & (Self::ALWAYS.0 & !Self::ON_ERROR.0) != 0
    }
}

impl ops::BitOr for CompletionFlags {
    type Output = CompletionFlags;
    fn bitor(self, rhs: CompletionFlags) -> CompletionFlags {
        CompletionFlags(self.0 | rhs.0)
    }
}

/// Errors surfaced by the library.
///
/// Provider failures preserve the underlying error (and its OS code, when
/// one exists); everything else classifies the condition.
#[derive(Debug, Fail)]
pub enum Error {
    /// The caller supplied absent, out-of-range, or inconsistent arguments.
    #[fail(display = "invalid argument: {}", _0)]
    InvalidArg(&'static str),
    /// A resource allocation failed in the provider.
    #[fail(display = "out of memory")]
    OutOfMemory,
    /// The underlying transport or connection-manager call failed.
    #[fail(display = "provider error: {}", _0)]
    Provider(#[cause] io::Error),
    /// The device, the remote peer, or the memory region does not support
    /// the requested operation.
    #[fail(display = "operation not supported")]
    NotSupported,
    /// The completion queue is drained.
    #[fail(display = "no completion available")]
    NoCompletion,
    /// The connection-manager channel has no pending event.
    #[fail(display = "no event available")]
    NoEvent,
    /// Transient condition; the caller may retry.
    #[fail(display = "temporary failure, try again")]
    Again,
    /// A per-queue wait was attempted on a shared completion channel.
    #[fail(display = "completion channel is shared")]
    SharedChannel,
    /// The shared completion channel was requested but the connection uses
    /// per-queue channels.
    #[fail(display = "completion channel is not shared")]
    NotSharedChannel,
    /// The provider failed without reporting a cause.
    #[fail(display = "unknown error")]
    Unknown,
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Error {
        Error::Provider(e)
    }
}

pub type Result<T> = ::std::result::Result<T, Error>;

/// Switch a file descriptor exposed by the library into non-blocking
/// mode, so the calls draining it report "nothing pending" instead of
/// blocking.
///
/// # Errors
///
/// - `Provider` - the descriptor's flags cannot be read or written
pub fn set_fd_nonblock(fd: RawFd) -> Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(Error::Provider(io::Error::last_os_error()));
    }
    let ret = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
    if ret < 0 {
        return Err(Error::Provider(io::Error::last_os_error()));
    }
    Ok(())
}
