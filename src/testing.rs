//! A scripted, in-memory implementation of the transport contract.
//!
//! The fake records every verb call and posted work request, scripts
//! connection-manager and completion events per channel, injects one-shot
//! failures by call name and counts live provider objects so teardown
//! tests can assert that nothing leaks.

use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::sync::{Arc, Mutex};

use libc;
use slog::{Drain, Logger};
use slog_term;

use peer::Peer;
use verbs::{
    Access, AddrInfo, AddrInfoError, CmEvent, CmEventType, CmId, CompChannel, ConnParam, Context,
    Cq, EventChannel, Mr, Pd, Provider, Qp, QpAttr, RecvWr, SendWr, Srq, SrqAttr, TransportType,
    Wc,
};

/// A plain synchronous terminal logger for tests.
pub fn logger() -> Logger {
    let decorator = slog_term::PlainSyncDecorator::new(::std::io::stdout());
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    Logger::root(drain, o!())
}

#[derive(Debug, Clone)]
struct Scripted {
    event: CmEventType,
    data: Vec<u8>,
    with_id: bool,
}

/// Connection parameters as the fake observed them in `accept`/`connect`.
#[derive(Debug, Clone)]
pub struct OwnedConnParam {
    pub private_data: Vec<u8>,
    pub responder_resources: u8,
    pub initiator_depth: u8,
    pub flow_control: u8,
    pub retry_count: u8,
    pub rnr_retry_count: u8,
}

#[derive(Debug)]
struct State {
    transport: TransportType,
    odp: bool,
    atomic_write: bool,
    /// Injected failures: call name plus how many matching calls to let
    /// pass first.
    fail: Vec<(&'static str, u32)>,
    calls: Vec<String>,
    sent: Vec<SendWr>,
    recvs: Vec<RecvWr>,
    srq_recvs: Vec<RecvWr>,
    last_access: Access,
    last_conn_param: Option<OwnedConnParam>,
    last_qp_attr: Option<QpAttr>,
    last_qp_used_srq: bool,
    last_srq_attr: Option<SrqAttr>,
    last_timeout_ms: Option<u32>,
    serial: u32,
    next_fd: RawFd,
    evch_events: Vec<VecDeque<Scripted>>,
    comp_pending: Vec<usize>,
    cq_wcs: Vec<VecDeque<Wc>>,
    live_pds: i64,
    live_mrs: i64,
    live_cqs: i64,
    live_comp_channels: i64,
    live_evchs: i64,
    live_ids: i64,
    live_qps: i64,
    live_srqs: i64,
}

fn take_fail(st: &mut State, name: &str) -> bool {
    if let Some(pos) = st.fail.iter().position(|&(n, _)| n == name) {
        if st.fail[pos].1 == 0 {
            st.fail.remove(pos);
            true
        } else {
            st.fail[pos].1 -= 1;
            false
        }
    } else {
        false
    }
}

fn fail_io(what: &str) -> io::Error {
    io::Error::new(io::ErrorKind::Other, format!("injected failure: {}", what))
}

/// Handle for scripting and inspecting the fake transport.
#[derive(Clone)]
pub struct Fake {
    state: Arc<Mutex<State>>,
    ctx: Arc<FakeContext>,
}

impl Fake {
    pub fn new() -> Fake {
        let state = Arc::new(Mutex::new(State {
            transport: TransportType::Infiniband,
            odp: false,
            atomic_write: false,
            fail: Vec::new(),
            calls: Vec::new(),
            sent: Vec::new(),
            recvs: Vec::new(),
            srq_recvs: Vec::new(),
            last_access: Access::default(),
            last_conn_param: None,
            last_qp_attr: None,
            last_qp_used_srq: false,
            last_srq_attr: None,
            last_timeout_ms: None,
            serial: 0,
            next_fd: 1000,
            evch_events: Vec::new(),
            comp_pending: Vec::new(),
            cq_wcs: Vec::new(),
            live_pds: 0,
            live_mrs: 0,
            live_cqs: 0,
            live_comp_channels: 0,
            live_evchs: 0,
            live_ids: 0,
            live_qps: 0,
            live_srqs: 0,
        }));
        let ctx = Arc::new(FakeContext {
            state: state.clone(),
        });
        Fake { state, ctx }
    }

    pub fn provider(&self) -> Arc<dyn Provider> {
        Arc::new(FakeProvider {
            state: self.state.clone(),
            ctx: self.ctx.clone(),
        })
    }

    pub fn context(&self) -> Arc<dyn Context> {
        self.ctx.clone()
    }

    pub fn peer(&self) -> Arc<Peer> {
        Peer::new(logger(), self.provider(), self.context()).unwrap()
    }

    /// A queue pair unattached to any identifier, for posting-helper tests.
    pub fn qp(&self) -> Box<dyn Qp> {
        let mut st = self.state.lock().unwrap();
        st.live_qps += 1;
        st.serial += 1;
        let qp_num = st.serial;
        drop(st);
        Box::new(FakeQp {
            state: self.state.clone(),
            qp_num,
        })
    }

    pub fn set_transport(&self, transport: TransportType) {
        self.state.lock().unwrap().transport = transport;
    }

    pub fn set_odp(&self, odp: bool) {
        self.state.lock().unwrap().odp = odp;
    }

    pub fn set_atomic_write(&self, supported: bool) {
        self.state.lock().unwrap().atomic_write = supported;
    }

    /// Make the next call named `op` fail.
    pub fn fail_once(&self, op: &'static str) {
        self.state.lock().unwrap().fail.push((op, 0));
    }

    /// Make the call named `op` fail after letting `skip` matching calls
    /// pass.
    pub fn fail_nth(&self, op: &'static str, skip: u32) {
        self.state.lock().unwrap().fail.push((op, skip));
    }

    /// Script a connection-manager event on the `channel`-th event channel
    /// (in creation order).
    pub fn push_cm_event(&self, channel: usize, event: CmEventType, data: &[u8], with_id: bool) {
        self.state.lock().unwrap().evch_events[channel].push_back(Scripted {
            event,
            data: data.to_vec(),
            with_id,
        });
    }

    /// Script a completion event on the `channel`-th completion channel.
    pub fn push_cq_event(&self, channel: usize) {
        self.state.lock().unwrap().comp_pending[channel] += 1;
    }

    /// Script a work completion on the `cq`-th completion queue.
    pub fn push_wc(&self, cq: usize, wc: Wc) {
        self.state.lock().unwrap().cq_wcs[cq].push_back(wc);
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn count(&self, call: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .calls
            .iter()
            .filter(|c| c.as_str() == call)
            .count()
    }

    pub fn sent(&self) -> Vec<SendWr> {
        self.state.lock().unwrap().sent.clone()
    }

    pub fn last_sent(&self) -> SendWr {
        self.state.lock().unwrap().sent.last().cloned().unwrap()
    }

    pub fn recvs(&self) -> Vec<RecvWr> {
        self.state.lock().unwrap().recvs.clone()
    }

    pub fn srq_recvs(&self) -> Vec<RecvWr> {
        self.state.lock().unwrap().srq_recvs.clone()
    }

    pub fn last_access(&self) -> Access {
        self.state.lock().unwrap().last_access
    }

    pub fn last_conn_param(&self) -> Option<OwnedConnParam> {
        self.state.lock().unwrap().last_conn_param.clone()
    }

    pub fn last_qp_attr(&self) -> Option<QpAttr> {
        self.state.lock().unwrap().last_qp_attr
    }

    pub fn last_qp_used_srq(&self) -> bool {
        self.state.lock().unwrap().last_qp_used_srq
    }

    pub fn last_timeout_ms(&self) -> Option<u32> {
        self.state.lock().unwrap().last_timeout_ms
    }

    pub fn live(&self) -> i64 {
        let st = self.state.lock().unwrap();
        st.live_pds
            + st.live_mrs
            + st.live_cqs
            + st.live_comp_channels
            + st.live_evchs
            + st.live_ids
            + st.live_qps
            + st.live_srqs
    }

    pub fn live_pds(&self) -> i64 {
        self.state.lock().unwrap().live_pds
    }

    pub fn live_mrs(&self) -> i64 {
        self.state.lock().unwrap().live_mrs
    }

    pub fn live_cqs(&self) -> i64 {
        self.state.lock().unwrap().live_cqs
    }

    pub fn live_channels(&self) -> i64 {
        self.state.lock().unwrap().live_comp_channels
    }

    pub fn live_evchs(&self) -> i64 {
        self.state.lock().unwrap().live_evchs
    }

    pub fn live_ids(&self) -> i64 {
        self.state.lock().unwrap().live_ids
    }

    pub fn live_qps(&self) -> i64 {
        self.state.lock().unwrap().live_qps
    }

    pub fn live_srqs(&self) -> i64 {
        self.state.lock().unwrap().live_srqs
    }
}

#[derive(Debug)]
struct FakeProvider {
    state: Arc<Mutex<State>>,
    ctx: Arc<FakeContext>,
}

impl Provider for FakeProvider {
    fn getaddrinfo(
        &self,
        node: &str,
        service: Option<&str>,
        passive: bool,
    ) -> Result<AddrInfo, AddrInfoError> {
        {
            let mut st = self.state.lock().unwrap();
            st.calls.push("getaddrinfo".into());
            if take_fail(&mut st, "getaddrinfo") {
                return Err(AddrInfoError::Resolver {
                    code: -2,
                    message: "name or service not known".into(),
                });
            }
            if take_fail(&mut st, "getaddrinfo_system") {
                return Err(AddrInfoError::System(io::Error::from_raw_os_error(
                    libc::ETIMEDOUT,
                )));
            }
        }
        let addr: SocketAddr = match format!("{}:{}", node, service.unwrap_or("0")).parse() {
            Ok(addr) => addr,
            Err(_) => {
                return Err(AddrInfoError::Resolver {
                    code: -2,
                    message: "name or service not known".into(),
                })
            }
        };
        Ok(if passive {
            AddrInfo {
                src: Some(addr),
                dst: None,
            }
        } else {
            AddrInfo {
                src: None,
                dst: Some(addr),
            }
        })
    }

    fn create_event_channel(&self) -> io::Result<Box<dyn EventChannel>> {
        let mut st = self.state.lock().unwrap();
        st.calls.push("create_event_channel".into());
        if take_fail(&mut st, "create_event_channel") {
            return Err(fail_io("create_event_channel"));
        }
        let idx = st.evch_events.len();
        st.evch_events.push(VecDeque::new());
        st.next_fd += 1;
        let fd = st.next_fd;
        st.live_evchs += 1;
        drop(st);
        Ok(Box::new(FakeEventChannel {
            state: self.state.clone(),
            ctx: self.ctx.clone(),
            idx,
            fd,
        }))
    }

    fn create_id(&self, _channel: Option<&dyn EventChannel>) -> io::Result<Box<dyn CmId>> {
        let mut st = self.state.lock().unwrap();
        st.calls.push("create_id".into());
        if take_fail(&mut st, "create_id") {
            return Err(fail_io("create_id"));
        }
        st.live_ids += 1;
        drop(st);
        Ok(Box::new(FakeCmId {
            state: self.state.clone(),
            ctx: self.ctx.clone(),
            has_ctx: false,
            qp: None,
        }))
    }
}

#[derive(Debug)]
struct FakeContext {
    state: Arc<Mutex<State>>,
}

impl Context for FakeContext {
    fn alloc_pd(&self) -> io::Result<Box<dyn Pd>> {
        let mut st = self.state.lock().unwrap();
        st.calls.push("alloc_pd".into());
        if take_fail(&mut st, "alloc_pd_nomem") {
            return Err(io::Error::from_raw_os_error(libc::ENOMEM));
        }
        if take_fail(&mut st, "alloc_pd") {
            return Err(io::Error::from_raw_os_error(libc::EPERM));
        }
        if take_fail(&mut st, "alloc_pd_unknown") {
            return Err(io::Error::new(io::ErrorKind::Other, "pd allocation failed"));
        }
        st.live_pds += 1;
        drop(st);
        Ok(Box::new(FakePd {
            state: self.state.clone(),
        }))
    }

    fn is_odp_capable(&self) -> io::Result<bool> {
        Ok(self.state.lock().unwrap().odp)
    }

    fn is_atomic_write_capable(&self) -> io::Result<bool> {
        Ok(self.state.lock().unwrap().atomic_write)
    }

    fn transport(&self) -> TransportType {
        self.state.lock().unwrap().transport
    }

    fn create_comp_channel(&self) -> io::Result<Box<dyn CompChannel>> {
        let mut st = self.state.lock().unwrap();
        st.calls.push("create_comp_channel".into());
        if take_fail(&mut st, "create_comp_channel") {
            return Err(fail_io("create_comp_channel"));
        }
        let idx = st.comp_pending.len();
        st.comp_pending.push(0);
        st.next_fd += 1;
        let fd = st.next_fd;
        st.live_comp_channels += 1;
        drop(st);
        Ok(Box::new(FakeCompChannel {
            state: self.state.clone(),
            idx,
            fd,
        }))
    }

    fn create_cq(&self, _cqe: i32, _channel: Option<&dyn CompChannel>) -> io::Result<Box<dyn Cq>> {
        let mut st = self.state.lock().unwrap();
        st.calls.push("create_cq".into());
        if take_fail(&mut st, "create_cq") {
            return Err(fail_io("create_cq"));
        }
        let idx = st.cq_wcs.len();
        st.cq_wcs.push(VecDeque::new());
        st.live_cqs += 1;
        drop(st);
        Ok(Box::new(FakeCq {
            state: self.state.clone(),
            idx,
        }))
    }
}

#[derive(Debug)]
struct FakePd {
    state: Arc<Mutex<State>>,
}

impl Pd for FakePd {
    fn reg_mr(&self, addr: u64, length: usize, access: Access) -> io::Result<Box<dyn Mr>> {
        let mut st = self.state.lock().unwrap();
        st.calls.push("reg_mr".into());
        st.last_access = access;
        if take_fail(&mut st, "reg_mr_unsupported") {
            return Err(io::Error::from_raw_os_error(libc::EOPNOTSUPP));
        }
        if take_fail(&mut st, "reg_mr") {
            return Err(io::Error::from_raw_os_error(libc::EPERM));
        }
        st.serial += 1;
        let key = st.serial;
        st.live_mrs += 1;
        drop(st);
        Ok(Box::new(FakeMr {
            state: self.state.clone(),
            addr,
            length,
            key,
        }))
    }

    fn create_srq(&self, attr: &SrqAttr) -> io::Result<Box<dyn Srq>> {
        let mut st = self.state.lock().unwrap();
        st.calls.push("create_srq".into());
        if take_fail(&mut st, "create_srq") {
            return Err(fail_io("create_srq"));
        }
        st.last_srq_attr = Some(*attr);
        st.live_srqs += 1;
        drop(st);
        Ok(Box::new(FakeSrq {
            state: self.state.clone(),
        }))
    }

    fn dealloc(self: Box<Self>) -> io::Result<()> {
        let mut st = self.state.lock().unwrap();
        st.calls.push("dealloc_pd".into());
        if take_fail(&mut st, "dealloc_pd") {
            return Err(io::Error::from_raw_os_error(libc::EPERM));
        }
        Ok(())
    }
}

impl Drop for FakePd {
    fn drop(&mut self) {
        self.state.lock().unwrap().live_pds -= 1;
    }
}

#[derive(Debug)]
struct FakeMr {
    state: Arc<Mutex<State>>,
    addr: u64,
    length: usize,
    key: u32,
}

impl Mr for FakeMr {
    fn addr(&self) -> u64 {
        self.addr
    }

    fn length(&self) -> usize {
        self.length
    }

    fn lkey(&self) -> u32 {
        self.key
    }

    fn rkey(&self) -> u32 {
        self.key.wrapping_add(0x1000)
    }

    fn dereg(self: Box<Self>) -> io::Result<()> {
        let mut st = self.state.lock().unwrap();
        st.calls.push("dereg_mr".into());
        if take_fail(&mut st, "dereg_mr") {
            return Err(io::Error::from_raw_os_error(libc::EPERM));
        }
        Ok(())
    }
}

impl Drop for FakeMr {
    fn drop(&mut self) {
        self.state.lock().unwrap().live_mrs -= 1;
    }
}

#[derive(Debug)]
struct FakeCompChannel {
    state: Arc<Mutex<State>>,
    idx: usize,
    fd: RawFd,
}

impl CompChannel for FakeCompChannel {
    fn fd(&self) -> RawFd {
        self.fd
    }

    fn get_cq_event(&self) -> io::Result<()> {
        let mut st = self.state.lock().unwrap();
        if st.comp_pending[self.idx] > 0 {
            st.comp_pending[self.idx] -= 1;
            Ok(())
        } else {
            Err(io::Error::from_raw_os_error(libc::EAGAIN))
        }
    }

    fn destroy(&self) -> io::Result<()> {
        let mut st = self.state.lock().unwrap();
        st.calls.push("destroy_comp_channel".into());
        if take_fail(&mut st, "destroy_comp_channel") {
            return Err(io::Error::from_raw_os_error(libc::EPERM));
        }
        Ok(())
    }
}

impl Drop for FakeCompChannel {
    fn drop(&mut self) {
        self.state.lock().unwrap().live_comp_channels -= 1;
    }
}

#[derive(Debug)]
struct FakeCq {
    state: Arc<Mutex<State>>,
    idx: usize,
}

impl Cq for FakeCq {
    fn req_notify(&self) -> io::Result<()> {
        let mut st = self.state.lock().unwrap();
        st.calls.push("req_notify".into());
        if take_fail(&mut st, "req_notify") {
            return Err(fail_io("req_notify"));
        }
        Ok(())
    }

    fn poll(&self, wc: &mut [Wc]) -> io::Result<usize> {
        let mut st = self.state.lock().unwrap();
        if take_fail(&mut st, "poll") {
            return Err(fail_io("poll"));
        }
        if take_fail(&mut st, "poll_overreturn") {
            return Ok(wc.len() + 1);
        }
        let mut got = 0;
        while got < wc.len() {
            match st.cq_wcs[self.idx].pop_front() {
                Some(entry) => {
                    wc[got] = entry;
                    got += 1;
                }
                None => break,
            }
        }
        Ok(got)
    }

    fn ack_events(&self, _nevents: u32) {
        self.state.lock().unwrap().calls.push("ack_cq_events".into());
    }

    fn destroy(self: Box<Self>) -> io::Result<()> {
        let mut st = self.state.lock().unwrap();
        st.calls.push("destroy_cq".into());
        if take_fail(&mut st, "destroy_cq") {
            return Err(io::Error::from_raw_os_error(libc::EPERM));
        }
        Ok(())
    }
}

impl Drop for FakeCq {
    fn drop(&mut self) {
        self.state.lock().unwrap().live_cqs -= 1;
    }
}

#[derive(Debug)]
struct FakeQp {
    state: Arc<Mutex<State>>,
    qp_num: u32,
}

impl Qp for FakeQp {
    fn qp_num(&self) -> u32 {
        self.qp_num
    }

    fn post_send(&self, wr: &SendWr) -> io::Result<()> {
        let mut st = self.state.lock().unwrap();
        if take_fail(&mut st, "post_send") {
            return Err(io::Error::from_raw_os_error(libc::EPERM));
        }
        st.sent.push(wr.clone());
        Ok(())
    }

    fn post_recv(&self, wr: &RecvWr) -> io::Result<()> {
        let mut st = self.state.lock().unwrap();
        if take_fail(&mut st, "post_recv") {
            return Err(io::Error::from_raw_os_error(libc::EPERM));
        }
        st.recvs.push(wr.clone());
        Ok(())
    }
}

impl Drop for FakeQp {
    fn drop(&mut self) {
        self.state.lock().unwrap().live_qps -= 1;
    }
}

#[derive(Debug)]
struct FakeSrq {
    state: Arc<Mutex<State>>,
}

impl Srq for FakeSrq {
    fn post_recv(&self, wr: &RecvWr) -> io::Result<()> {
        let mut st = self.state.lock().unwrap();
        if take_fail(&mut st, "post_srq_recv") {
            return Err(io::Error::from_raw_os_error(libc::EPERM));
        }
        st.srq_recvs.push(wr.clone());
        Ok(())
    }

    fn destroy(self: Box<Self>) -> io::Result<()> {
        let mut st = self.state.lock().unwrap();
        st.calls.push("destroy_srq".into());
        if take_fail(&mut st, "destroy_srq") {
            return Err(io::Error::from_raw_os_error(libc::EPERM));
        }
        Ok(())
    }
}

impl Drop for FakeSrq {
    fn drop(&mut self) {
        self.state.lock().unwrap().live_srqs -= 1;
    }
}

#[derive(Debug)]
struct FakeEventChannel {
    state: Arc<Mutex<State>>,
    ctx: Arc<FakeContext>,
    idx: usize,
    fd: RawFd,
}

impl EventChannel for FakeEventChannel {
    fn fd(&self) -> RawFd {
        self.fd
    }

    fn get_cm_event(&self) -> io::Result<Box<dyn CmEvent>> {
        let mut st = self.state.lock().unwrap();
        let scripted = match st.evch_events[self.idx].pop_front() {
            Some(scripted) => scripted,
            None => return Err(io::Error::from_raw_os_error(libc::ENODATA)),
        };
        let id = if scripted.with_id {
            st.live_ids += 1;
            Some(Box::new(FakeCmId {
                state: self.state.clone(),
                ctx: self.ctx.clone(),
                has_ctx: true,
                qp: None,
            }))
        } else {
            None
        };
        drop(st);
        Ok(Box::new(FakeCmEvent {
            state: self.state.clone(),
            event: scripted.event,
            data: scripted.data,
            id,
        }))
    }

    fn destroy(self: Box<Self>) -> io::Result<()> {
        let mut st = self.state.lock().unwrap();
        st.calls.push("destroy_event_channel".into());
        if take_fail(&mut st, "destroy_event_channel") {
            return Err(io::Error::from_raw_os_error(libc::EPERM));
        }
        Ok(())
    }
}

impl Drop for FakeEventChannel {
    fn drop(&mut self) {
        self.state.lock().unwrap().live_evchs -= 1;
    }
}

#[derive(Debug)]
struct FakeCmEvent {
    state: Arc<Mutex<State>>,
    event: CmEventType,
    data: Vec<u8>,
    id: Option<Box<FakeCmId>>,
}

impl CmEvent for FakeCmEvent {
    fn event(&self) -> CmEventType {
        self.event
    }

    fn take_id(&mut self) -> Option<Box<dyn CmId>> {
        match self.id.take() {
            Some(id) => Some(id),
            None => None,
        }
    }

    fn private_data(&self) -> &[u8] {
        &self.data
    }

    fn ack(self: Box<Self>) -> io::Result<()> {
        let mut st = self.state.lock().unwrap();
        st.calls.push("ack_event".into());
        if take_fail(&mut st, "ack_event") {
            return Err(io::Error::from_raw_os_error(libc::EPERM));
        }
        Ok(())
    }
}

#[derive(Debug)]
struct FakeCmId {
    state: Arc<Mutex<State>>,
    ctx: Arc<FakeContext>,
    has_ctx: bool,
    qp: Option<FakeQp>,
}

impl FakeCmId {
    fn simple_call(&self, name: &'static str) -> io::Result<()> {
        let mut st = self.state.lock().unwrap();
        st.calls.push(name.into());
        if take_fail(&mut st, name) {
            return Err(io::Error::from_raw_os_error(libc::EPERM));
        }
        Ok(())
    }

    fn record_param(&self, param: &ConnParam) {
        self.state.lock().unwrap().last_conn_param = Some(OwnedConnParam {
            private_data: param.private_data.to_vec(),
            responder_resources: param.responder_resources,
            initiator_depth: param.initiator_depth,
            flow_control: param.flow_control,
            retry_count: param.retry_count,
            rnr_retry_count: param.rnr_retry_count,
        });
    }
}

impl CmId for FakeCmId {
    fn context(&self) -> Option<Arc<dyn Context>> {
        if self.has_ctx {
            Some(self.ctx.clone())
        } else {
            None
        }
    }

    fn bind_addr(&mut self, _addr: &SocketAddr) -> io::Result<()> {
        self.simple_call("bind_addr")?;
        self.has_ctx = true;
        Ok(())
    }

    fn resolve_addr(
        &mut self,
        _src: Option<&SocketAddr>,
        _dst: &SocketAddr,
        timeout_ms: u32,
    ) -> io::Result<()> {
        self.state.lock().unwrap().last_timeout_ms = Some(timeout_ms);
        self.simple_call("resolve_addr")?;
        self.has_ctx = true;
        Ok(())
    }

    fn resolve_route(&mut self, timeout_ms: u32) -> io::Result<()> {
        self.state.lock().unwrap().last_timeout_ms = Some(timeout_ms);
        self.simple_call("resolve_route")
    }

    fn listen(&mut self) -> io::Result<()> {
        self.simple_call("listen")
    }

    fn accept(&mut self, param: &ConnParam) -> io::Result<()> {
        self.record_param(param);
        self.simple_call("accept")
    }

    fn connect(&mut self, param: &ConnParam) -> io::Result<()> {
        self.record_param(param);
        self.simple_call("connect")
    }

    fn reject(&mut self) -> io::Result<()> {
        self.simple_call("reject")
    }

    fn disconnect(&mut self) -> io::Result<()> {
        self.simple_call("disconnect")
    }

    fn migrate(&mut self, _channel: Option<&dyn EventChannel>) -> io::Result<()> {
        self.simple_call("migrate")
    }

    fn create_qp(
        &mut self,
        _pd: &dyn Pd,
        _send_cq: &dyn Cq,
        _recv_cq: &dyn Cq,
        srq: Option<&dyn Srq>,
        attr: &QpAttr,
    ) -> io::Result<()> {
        let mut st = self.state.lock().unwrap();
        st.calls.push("create_qp".into());
        if take_fail(&mut st, "create_qp") {
            return Err(fail_io("create_qp"));
        }
        st.last_qp_attr = Some(*attr);
        st.last_qp_used_srq = srq.is_some();
        st.serial += 1;
        let qp_num = st.serial;
        st.live_qps += 1;
        drop(st);
        self.qp = Some(FakeQp {
            state: self.state.clone(),
            qp_num,
        });
        Ok(())
    }

    fn destroy_qp(&mut self) {
        self.state.lock().unwrap().calls.push("destroy_qp".into());
        self.qp = None;
    }

    fn qp(&self) -> Option<&dyn Qp> {
        match self.qp {
            Some(ref qp) => Some(qp),
            None => None,
        }
    }

    fn destroy(self: Box<Self>) -> io::Result<()> {
        let mut st = self.state.lock().unwrap();
        st.calls.push("destroy_id".into());
        if take_fail(&mut st, "destroy_id") {
            return Err(io::Error::from_raw_os_error(libc::EPERM));
        }
        Ok(())
    }
}

impl Drop for FakeCmId {
    fn drop(&mut self) {
        self.state.lock().unwrap().live_ids -= 1;
    }
}
