//! The transport contract.
//!
//! Everything the library needs from the RDMA connection manager and the
//! verbs layer is expressed as the traits below; the provider crate that
//! binds them to real hardware is an external collaborator. The contract
//! mirrors the shape of the underlying objects: a process-wide `Provider`
//! hands out connection-manager identifiers and event channels, a device
//! `Context` allocates protection domains and completion machinery, and the
//! remaining traits wrap the per-object verbs.
//!
//! All blocking entry points are named as such in their documentation;
//! nothing else may block. Implementations are expected to release the
//! underlying resource when the handle is dropped; the fallible
//! `destroy`-class methods exist so owners can surface teardown failures
//! instead of losing them in a drop.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::ops;
use std::os::unix::io::RawFd;
use std::sync::Arc;

/// The maximum number of scatter/gather elements in any work request.
pub const MAX_SGE: u32 = 1;

/// The maximum message size (in bytes) that can be posted inline.
pub const MAX_INLINE_DATA: u32 = 8;

/// Maximum responder resources requested at connection establishment.
pub const MAX_RESP_RES: u8 = 0xff;

/// Maximum initiator depth requested at connection establishment.
pub const MAX_INIT_DEPTH: u8 = 0xff;

/// Memory-registration access rights.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
pub struct Access(pub u32);

impl Access {
    pub const LOCAL_WRITE: Access = Access(0x1);
    pub const REMOTE_WRITE: Access = Access(0x2);
    pub const REMOTE_READ: Access = Access(0x4);
    /// Register without pinning; requires the on-demand-paging capability.
    pub const ON_DEMAND: Access = Access(0x40);

    pub fn contains(self, other: Access) -> bool {
        self.0 & other.0 == other.0
    }
}

impl ops::BitOr for Access {
    type Output = Access;
    fn bitor(self, rhs: Access) -> Access {
        Access(self.0 | rhs.0)
    }
}

impl ops::BitOrAssign for Access {
    fn bitor_assign(&mut self, rhs: Access) {
        self.0 |= rhs.0;
    }
}

/// Flags attached to a posted send-class work request.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
pub struct SendFlags(pub u32);

impl SendFlags {
    /// Order the request after all outstanding reads and atomics.
    pub const FENCE: SendFlags = SendFlags(0x1);
    /// Generate a completion for a successful request.
    pub const SIGNALED: SendFlags = SendFlags(0x2);
    /// The payload is copied at post time from the scatter entry.
    pub const INLINE: SendFlags = SendFlags(0x8);

    pub fn contains(self, other: SendFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl ops::BitOr for SendFlags {
    type Output = SendFlags;
    fn bitor(self, rhs: SendFlags) -> SendFlags {
        SendFlags(self.0 | rhs.0)
    }
}

impl ops::BitOrAssign for SendFlags {
    fn bitor_assign(&mut self, rhs: SendFlags) {
        self.0 |= rhs.0;
    }
}

/// A single scatter/gather element.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Sge {
    pub addr: u64,
    pub length: u32,
    pub lkey: u32,
}

/// Operation selector of a send-class work request.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SendOpcode {
    RdmaRead,
    RdmaWrite,
    RdmaWriteWithImm,
    Send,
    SendWithImm,
}

/// A send-class work request.
///
/// `remote_addr`/`rkey` are meaningful for the RDMA opcodes only; a request
/// without a scatter entry is the 0-byte form.
#[derive(Debug, Clone, PartialEq)]
pub struct SendWr {
    /// Caller context returned verbatim as `Wc::wr_id`.
    pub wr_id: u64,
    pub opcode: SendOpcode,
    pub sge: Option<Sge>,
    pub remote_addr: u64,
    pub rkey: u32,
    /// Immediate payload for the `*WithImm` opcodes.
    pub imm: Option<u32>,
    pub flags: SendFlags,
}

/// A receive work request.
#[derive(Debug, Clone, PartialEq)]
pub struct RecvWr {
    pub wr_id: u64,
    pub sge: Option<Sge>,
}

/// Completion status of a work request.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum WcStatus {
    Success,
    LocLenErr,
    LocProtErr,
    WrFlushErr,
    RemAccessErr,
    RemOpErr,
    Other(u32),
}

/// Operation class reported by a completion.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum WcOpcode {
    RdmaRead,
    RdmaWrite,
    Send,
    Recv,
    RecvRdmaWithImm,
}

/// A work completion.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct Wc {
    /// The `wr_id` of the completed work request.
    pub wr_id: u64,
    pub status: WcStatus,
    pub opcode: WcOpcode,
    pub byte_len: u32,
    pub imm: Option<u32>,
    pub qp_num: u32,
}

impl Default for Wc {
    fn default() -> Wc {
        Wc {
            wr_id: 0,
            status: WcStatus::Success,
            opcode: WcOpcode::Send,
            byte_len: 0,
            imm: None,
            qp_num: 0,
        }
    }
}

/// Connection-manager event classes.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum CmEventType {
    AddrResolved,
    AddrError,
    RouteResolved,
    RouteError,
    ConnectRequest,
    ConnectResponse,
    ConnectError,
    Unreachable,
    Rejected,
    Established,
    Disconnected,
    DeviceRemoval,
    TimewaitExit,
    AddrChange,
}

impl fmt::Display for CmEventType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Transport family of a device.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum TransportType {
    Infiniband,
    /// iWARP implements the READ operation as a WRITE in the opposite
    /// direction, which changes the access rights a read destination needs.
    Iwarp,
    Unspecified,
}

/// A cached address translation produced by `Provider::getaddrinfo`.
#[derive(Debug, Clone)]
pub struct AddrInfo {
    pub src: Option<SocketAddr>,
    pub dst: Option<SocketAddr>,
}

/// Failure modes of address translation.
#[derive(Debug)]
pub enum AddrInfoError {
    /// The resolver failed with a system error; the OS code is preserved.
    System(io::Error),
    /// The resolver failed with one of its own codes.
    Resolver { code: i32, message: String },
}

/// Parameters of an `accept` or `connect` call.
#[derive(Debug, Clone)]
pub struct ConnParam<'a> {
    /// Opaque payload carried verbatim to the remote side; at most 255
    /// bytes.
    pub private_data: &'a [u8],
    pub responder_resources: u8,
    pub initiator_depth: u8,
    pub flow_control: u8,
    pub retry_count: u8,
    pub rnr_retry_count: u8,
}

/// Queue-pair creation attributes. Completion queues, the protection
/// domain and an optional shared receive queue are passed alongside.
#[derive(Debug, Copy, Clone)]
pub struct QpAttr {
    pub sq_size: u32,
    pub rq_size: u32,
    pub max_sge: u32,
    pub max_inline_data: u32,
    /// When false, every work request decides its own completion
    /// signaling.
    pub sig_all: bool,
    /// Request the extended send-ops flag enabling the native 8-byte
    /// atomic write.
    pub atomic_write_ops: bool,
}

/// Shared-receive-queue creation attributes.
#[derive(Debug, Copy, Clone)]
pub struct SrqAttr {
    pub max_wr: u32,
    pub max_sge: u32,
}

/// Process-wide entry point of the transport.
pub trait Provider: fmt::Debug + Send + Sync {
    /// Translate an address. The hints are fixed by the library: reliable,
    /// connection-oriented queue pairs in the TCP port space; `passive`
    /// requests the listening-side translation.
    fn getaddrinfo(
        &self,
        node: &str,
        service: Option<&str>,
        passive: bool,
    ) -> Result<AddrInfo, AddrInfoError>;

    /// Create a connection-manager event channel.
    fn create_event_channel(&self) -> io::Result<Box<dyn EventChannel>>;

    /// Create a connection-manager identifier, optionally attached to an
    /// event channel from the start.
    fn create_id(&self, channel: Option<&dyn EventChannel>) -> io::Result<Box<dyn CmId>>;
}

/// A device context.
pub trait Context: fmt::Debug + Send + Sync {
    /// Allocate a protection domain. On failure the error's OS code
    /// distinguishes out-of-memory from other provider failures; an error
    /// without an OS code means the provider reported nothing.
    fn alloc_pd(&self) -> io::Result<Box<dyn Pd>>;

    /// Whether the device can register memory without pinning it.
    fn is_odp_capable(&self) -> io::Result<bool>;

    /// Whether the device supports the native 8-byte atomic write.
    fn is_atomic_write_capable(&self) -> io::Result<bool>;

    fn transport(&self) -> TransportType;

    fn create_comp_channel(&self) -> io::Result<Box<dyn CompChannel>>;

    /// Create a completion queue of at least `cqe` entries, optionally
    /// delivering its events to `channel`.
    fn create_cq(&self, cqe: i32, channel: Option<&dyn CompChannel>) -> io::Result<Box<dyn Cq>>;
}

/// A protection domain.
pub trait Pd: fmt::Debug + Send + Sync {
    /// Register `length` bytes at virtual address `addr`.
    fn reg_mr(&self, addr: u64, length: usize, access: Access) -> io::Result<Box<dyn Mr>>;

    fn create_srq(&self, attr: &SrqAttr) -> io::Result<Box<dyn Srq>>;

    fn dealloc(self: Box<Self>) -> io::Result<()>;
}

/// A registered memory region.
pub trait Mr: fmt::Debug + Send + Sync {
    fn addr(&self) -> u64;
    fn length(&self) -> usize;
    fn lkey(&self) -> u32;
    fn rkey(&self) -> u32;

    fn dereg(self: Box<Self>) -> io::Result<()>;
}

/// A completion event channel, possibly shared by several completion
/// queues.
pub trait CompChannel: fmt::Debug + Send + Sync {
    fn fd(&self) -> RawFd;

    /// Block until a completion event arrives. Blocking; honor `O_NONBLOCK`
    /// set by the caller on `fd`.
    fn get_cq_event(&self) -> io::Result<()>;

    /// Release the channel. Called at most once, by the owner; dropping the
    /// last handle afterwards must be tolerated.
    fn destroy(&self) -> io::Result<()>;
}

/// A completion queue.
pub trait Cq: fmt::Debug + Send + Sync {
    /// Arm the next completion event on the channel.
    fn req_notify(&self) -> io::Result<()>;

    /// Poll up to `wc.len()` completions; returns how many were filled in.
    fn poll(&self, wc: &mut [Wc]) -> io::Result<usize>;

    /// Acknowledge `nevents` channel events.
    fn ack_events(&self, nevents: u32);

    fn destroy(self: Box<Self>) -> io::Result<()>;
}

/// A queue pair. Posting is safe from multiple threads; the provider locks
/// internally.
pub trait Qp: fmt::Debug + Send + Sync {
    fn qp_num(&self) -> u32;

    fn post_send(&self, wr: &SendWr) -> io::Result<()>;

    fn post_recv(&self, wr: &RecvWr) -> io::Result<()>;
}

/// A shared receive queue.
pub trait Srq: fmt::Debug + Send + Sync {
    fn post_recv(&self, wr: &RecvWr) -> io::Result<()>;

    fn destroy(self: Box<Self>) -> io::Result<()>;
}

/// A connection-manager event channel.
pub trait EventChannel: fmt::Debug + Send {
    fn fd(&self) -> RawFd;

    /// Block until the next connection-manager event. Blocking; fails with
    /// `ENODATA` when the channel is in non-blocking mode and empty.
    fn get_cm_event(&self) -> io::Result<Box<dyn CmEvent>>;

    fn destroy(self: Box<Self>) -> io::Result<()>;
}

/// One drained connection-manager event. Must be acknowledged exactly once;
/// an unacknowledged event blocks identifier migration.
pub trait CmEvent: fmt::Debug + Send {
    fn event(&self) -> CmEventType;

    /// For `ConnectRequest` events: the freshly created identifier of the
    /// incoming connection. Yields the identifier at most once.
    fn take_id(&mut self) -> Option<Box<dyn CmId>>;

    /// Private data carried by the event, verbatim; empty when absent.
    fn private_data(&self) -> &[u8];

    fn ack(self: Box<Self>) -> io::Result<()>;
}

/// A connection-manager identifier.
pub trait CmId: fmt::Debug + Send {
    /// The device context the identifier is bound to; absent until the
    /// identifier has been bound or resolved.
    fn context(&self) -> Option<Arc<dyn Context>>;

    fn bind_addr(&mut self, addr: &SocketAddr) -> io::Result<()>;

    /// Resolve destination (and optionally source) addresses. Blocking up
    /// to `timeout_ms`.
    fn resolve_addr(
        &mut self,
        src: Option<&SocketAddr>,
        dst: &SocketAddr,
        timeout_ms: u32,
    ) -> io::Result<()>;

    /// Resolve the route to the resolved destination. Blocking up to
    /// `timeout_ms`.
    fn resolve_route(&mut self, timeout_ms: u32) -> io::Result<()>;

    fn listen(&mut self) -> io::Result<()>;

    fn accept(&mut self, param: &ConnParam) -> io::Result<()>;

    fn connect(&mut self, param: &ConnParam) -> io::Result<()>;

    fn reject(&mut self) -> io::Result<()>;

    fn disconnect(&mut self) -> io::Result<()>;

    /// Move the identifier onto another event channel (or back onto the
    /// provider's synchronous one when `None`). May block while the current
    /// channel holds unacknowledged events.
    fn migrate(&mut self, channel: Option<&dyn EventChannel>) -> io::Result<()>;

    /// Create the identifier's queue pair.
    fn create_qp(
        &mut self,
        pd: &dyn Pd,
        send_cq: &dyn Cq,
        recv_cq: &dyn Cq,
        srq: Option<&dyn Srq>,
        attr: &QpAttr,
    ) -> io::Result<()>;

    fn destroy_qp(&mut self);

    fn qp(&self) -> Option<&dyn Qp>;

    fn destroy(self: Box<Self>) -> io::Result<()>;
}
