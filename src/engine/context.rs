//! Progress contexts.
//!
//! A `Context` owns one transport port and the tables tracking its
//! requests. Nothing moves unless the owner polls it: `progress()` drains
//! transport events, advances the requests they concern, fires expired
//! timeouts, and otherwise waits for the next event.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::engine::corpc;
use crate::engine::opcode::OPC_URI_LOOKUP;
use crate::engine::request::{Rpc, RpcId, RpcState};
use crate::engine::{Endpoint, EngineShared, Group, Opcode, Rank, Tag};
use crate::transport::{
    CompletionToken, Port, ReplyTo, RpcHeader, TransportEvent, WireReply,
    WireRequest,
};
use crate::tree::TreeTopo;
use crate::utils::{CartwrightError, ErrorKind};

use bytes::Bytes;

use parking_lot::{Mutex, RwLock};

use tokio::sync::mpsc;
use tokio::time;

/// Callback run at the start of every `progress()` call.
pub type ProgressCb = Arc<dyn Fn() + Send + Sync>;

/// Callback run for every request whose timeout expires, before the
/// request is failed (or re-armed).
pub type TimeoutCb = Arc<dyn Fn(&Rpc) + Send + Sync>;

/// Snapshot of a context's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ContextStats {
    /// Submitted requests not completed yet.
    pub tracked: usize,

    /// Requests waiting for a flow control credit or a lookup slot.
    pub queued: usize,

    /// Requests handed to the transport and awaiting their outcome.
    pub on_wire: usize,

    /// URI lookups currently issued.
    pub lookups_inflight: usize,

    /// Request objects alive, tracked or not.
    pub live_rpcs: usize,
}

/// Flow control slot held by a tracked request.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Gate {
    Endpoint((String, Rank)),
    Lookup,
}

#[derive(Default)]
struct CtxState {
    /// Submitted requests not completed yet.
    tracked: HashMap<RpcId, Rpc>,

    /// Requests on the wire, by completion token.
    wire: HashMap<CompletionToken, Rpc>,

    /// Deadlines; entries whose request moved on are skipped lazily.
    timeouts: BinaryHeap<Reverse<(Instant, RpcId)>>,

    /// Flow control slot of each admitted request.
    gates: HashMap<RpcId, Gate>,

    /// Requests in flight per destination rank.
    ep_inflight: HashMap<(String, Rank), usize>,

    /// Requests waiting for a credit per destination rank.
    ep_waitq: HashMap<(String, Rank), VecDeque<Rpc>>,

    lookups_inflight: usize,
    lookup_waitq: VecDeque<Rpc>,

    /// Set once the owning `Context` is dropped.
    closed: bool,
}

/// State of a context shared with its requests.
pub(crate) struct ContextShared {
    pub(crate) tag: Tag,
    pub(crate) engine: Arc<EngineShared>,
    pub(crate) port: Box<dyn Port>,

    /// Default request timeout in milliseconds.
    default_timeout_ms: AtomicU64,

    live_rpcs: AtomicUsize,
    state: Mutex<CtxState>,
    progress_cbs: RwLock<Vec<ProgressCb>>,
    timeout_cbs: RwLock<Vec<TimeoutCb>>,
}

/// Cloneable handle to a context, usable from callbacks and handlers to
/// create and manage requests.
#[derive(Clone)]
pub struct ContextHandle(pub(crate) Arc<ContextShared>);

/// A progress context. Dropping it cancels every request still tracked.
pub struct Context {
    handle: ContextHandle,
    rx_events: mpsc::UnboundedReceiver<TransportEvent>,
}

impl ContextShared {
    pub(crate) fn new(
        tag: Tag,
        engine: Arc<EngineShared>,
        port: Box<dyn Port>,
        default_timeout: Duration,
    ) -> Self {
        ContextShared {
            tag,
            engine,
            port,
            default_timeout_ms: AtomicU64::new(
                default_timeout.as_millis() as u64
            ),
            live_rpcs: AtomicUsize::new(0),
            state: Mutex::new(CtxState::default()),
            progress_cbs: RwLock::new(Vec::new()),
            timeout_cbs: RwLock::new(Vec::new()),
        }
    }

    #[inline]
    pub(crate) fn rpc_created(&self) {
        self.live_rpcs.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn rpc_destroyed(&self) {
        self.live_rpcs.fetch_sub(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms.load(Ordering::Relaxed))
    }

    /// Starts tracking a submitted request and arms its deadline. Returns
    /// true if the request has to wait for a flow control slot.
    fn track(&self, rpc: &Rpc) -> Result<bool, CartwrightError> {
        let deadline = Instant::now() + rpc.effective_timeout();
        let endpoint = rpc.endpoint();
        let is_corpc = rpc.is_corpc();
        let credits = self.engine.config.ep_credits;
        let max_lookups = self.engine.config.max_inflight_lookups;

        let mut guard = self.state.lock();
        let st = &mut *guard;
        if st.closed {
            return Err(CartwrightError::new(
                ErrorKind::Canceled,
                format!("context {} is closed", self.tag),
            ));
        }
        st.tracked.insert(rpc.id(), rpc.clone());
        st.timeouts.push(Reverse((deadline, rpc.id())));

        let mut queued = false;
        if rpc.opcode() == OPC_URI_LOOKUP {
            if max_lookups > 0 && st.lookups_inflight >= max_lookups {
                st.lookup_waitq.push_back(rpc.clone());
                queued = true;
            } else {
                st.lookups_inflight += 1;
                st.gates.insert(rpc.id(), Gate::Lookup);
            }
        } else if credits > 0 && !is_corpc {
            if let Some(ep) = endpoint {
                let key = (ep.group, ep.rank);
                let inflight = st.ep_inflight.entry(key.clone()).or_insert(0);
                if *inflight >= credits {
                    let waitq = st.ep_waitq.entry(key).or_default();
                    if rpc.0.info.queue_front {
                        waitq.push_front(rpc.clone());
                    } else {
                        waitq.push_back(rpc.clone());
                    }
                    queued = true;
                } else {
                    *inflight += 1;
                    st.gates.insert(rpc.id(), Gate::Endpoint(key));
                }
            }
        }

        let mut slot = rpc.0.slot.lock();
        slot.deadline = Some(deadline);
        if queued {
            slot.set_state(RpcState::Queued);
        }
        Ok(queued)
    }

    /// Tracks and starts a prepared request.
    pub(crate) fn launch(&self, rpc: &Rpc) {
        match self.track(rpc) {
            Ok(false) => rpc.resume(),
            Ok(true) => rpc_log!(debug, rpc; "queued for flow control"),
            Err(e) => {
                let _ = rpc.complete(Err(e));
            }
        }
    }

    /// Stops tracking a completed request and releases its flow control
    /// slot. Returns the waiters admitted in its place; the caller resumes
    /// them.
    pub(crate) fn untrack(&self, rpc: &Rpc) -> Vec<Rpc> {
        let id = rpc.id();
        let mut guard = self.state.lock();
        let st = &mut *guard;
        st.tracked.remove(&id);
        st.wire.remove(&id);

        let mut admitted = Vec::new();
        match st.gates.remove(&id) {
            Some(Gate::Lookup) => {
                st.lookups_inflight -= 1;
                if !st.closed {
                    if let Some(next) = st.lookup_waitq.pop_front() {
                        st.lookups_inflight += 1;
                        st.gates.insert(next.id(), Gate::Lookup);
                        admitted.push(next);
                    }
                }
            }
            Some(Gate::Endpoint(key)) => {
                let next = if st.closed {
                    None
                } else {
                    st.ep_waitq.get_mut(&key).and_then(|q| q.pop_front())
                };
                match next {
                    Some(next) => {
                        st.gates.insert(next.id(), Gate::Endpoint(key));
                        admitted.push(next);
                    }
                    None => {
                        if let Some(inflight) = st.ep_inflight.get_mut(&key) {
                            *inflight -= 1;
                            if *inflight == 0 {
                                st.ep_inflight.remove(&key);
                                st.ep_waitq.remove(&key);
                            }
                        }
                    }
                }
            }
            None => {
                // finished while still waiting for a slot
                st.lookup_waitq.retain(|r| r.id() != id);
                for waitq in st.ep_waitq.values_mut() {
                    waitq.retain(|r| r.id() != id);
                }
            }
        }
        admitted
    }

    pub(crate) fn wire_insert(&self, rpc: &Rpc) {
        self.state.lock().wire.insert(rpc.id(), rpc.clone());
    }

    /// Removes a request from the on-wire table. Only the first of the
    /// racing outcomes of a send (reply, failure, cancel, timeout) gets it.
    pub(crate) fn wire_remove(&self, token: CompletionToken) -> Option<Rpc> {
        self.state.lock().wire.remove(&token)
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.state
            .lock()
            .timeouts
            .peek()
            .map(|Reverse((deadline, _))| *deadline)
    }

    /// Group an incoming request targets, if the request is for us.
    fn check_target(
        &self,
        hdr: &RpcHeader,
    ) -> Result<Arc<Group>, CartwrightError> {
        let group = self.engine.group(&hdr.group).map_err(|_| {
            CartwrightError::new(
                ErrorKind::BadTarget,
                format!("unknown group '{}'", hdr.group),
            )
        })?;
        if hdr.dst_tag != self.tag {
            return Err(CartwrightError::new(
                ErrorKind::BadTarget,
                format!(
                    "tag {} delivered to context {}",
                    hdr.dst_tag, self.tag
                ),
            ));
        }
        match group.self_rank() {
            Some(me) if me != hdr.dst_rank => Err(CartwrightError::new(
                ErrorKind::BadTarget,
                format!("rank {} delivered to rank {}", hdr.dst_rank, me),
            )),
            _ => Ok(group),
        }
    }

    fn reply_error(&self, reply_to: &ReplyTo, err: CartwrightError) {
        let rep = WireReply::error(self.engine.hlc.now(), err);
        if let Err(e) = self.port.reply(reply_to, rep) {
            pf_warn!("error replying to token {}: {}", reply_to.token, e);
        }
    }

    fn handle_request(self: &Arc<Self>, reply_to: ReplyTo, req: WireRequest) {
        let WireRequest { hdr, payload } = req;
        if let Err(e) = self.engine.hlc.merge_bounded(hdr.hlc) {
            pf_warn!("rejected request from rank {:?}: {}", hdr.src_rank, e);
            self.reply_error(&reply_to, e);
            return;
        }
        let info = match self.engine.opcodes.lookup(hdr.opc) {
            Ok(info) => info,
            Err(e) => {
                pf_warn!("request from rank {:?}: {}", hdr.src_rank, e);
                self.reply_error(&reply_to, e);
                return;
            }
        };
        let group = match self.check_target(&hdr) {
            Ok(group) => group,
            Err(e) => {
                pf_warn!("misrouted request opc {:#x}: {}", hdr.opc, e);
                if !info.no_reply {
                    self.reply_error(&reply_to, e);
                }
                return;
            }
        };
        let handler = match info.handler.clone() {
            Some(handler) => handler,
            None => {
                let e = CartwrightError::new(
                    ErrorKind::UnknownOpcode,
                    format!("no handler registered for opc {:#x}", hdr.opc),
                );
                if !info.no_reply {
                    self.reply_error(&reply_to, e);
                }
                return;
            }
        };

        let corpc_hdr = hdr.corpc.clone();
        let rpc = Rpc::new_incoming(self, info, hdr, payload, reply_to);
        rpc_log!(trace, rpc; "received from rank {:?}", rpc.src_rank());
        match corpc_hdr {
            Some(corpc_hdr) => corpc::handle_incoming(rpc, group, corpc_hdr),
            None => handler(rpc),
        }
    }

    fn handle_reply(&self, token: CompletionToken, rep: WireReply) {
        let rpc = match self.wire_remove(token) {
            Some(rpc) => rpc,
            None => {
                pf_trace!("stale reply for token {}", token);
                return;
            }
        };
        if let Err(e) = self.engine.hlc.merge_bounded(rep.hlc) {
            let _ = rpc.complete(Err(e));
            return;
        }
        let status = match rep.status {
            None => {
                rpc.0.slot.lock().output = rep.payload;
                Ok(())
            }
            Some(err) => Err(err),
        };
        let _ = rpc.complete(status);
    }

    fn handle_event(self: &Arc<Self>, event: TransportEvent) {
        match event {
            TransportEvent::Request { reply_to, req } => {
                self.handle_request(reply_to, req)
            }
            TransportEvent::Reply { token, rep } => {
                self.handle_reply(token, rep)
            }
            TransportEvent::Failed { token, err } => {
                if let Some(rpc) = self.wire_remove(token) {
                    rpc_log!(debug, rpc; "transport failure: {}", err);
                    let _ = rpc.complete(Err(err));
                }
            }
            TransportEvent::Canceled { token } => {
                if let Some(rpc) = self.wire_remove(token) {
                    let _ = rpc.complete(Err(CartwrightError::new(
                        ErrorKind::Canceled,
                        format!("rpc {} canceled", token),
                    )));
                }
            }
        }
    }

    /// Fires every expired deadline. Returns the number fired.
    fn check_timeouts(&self) -> usize {
        let now = Instant::now();
        let mut expired = Vec::new();
        {
            let mut st = self.state.lock();
            while let Some(&Reverse((deadline, id))) = st.timeouts.peek() {
                if deadline > now {
                    break;
                }
                st.timeouts.pop();
                if let Some(rpc) = st.tracked.get(&id) {
                    if rpc.0.slot.lock().deadline == Some(deadline) {
                        expired.push(rpc.clone());
                    }
                }
            }
        }

        let fired = expired.len();
        for rpc in expired {
            self.on_timeout(rpc);
        }
        fired
    }

    fn on_timeout(&self, rpc: Rpc) {
        let cbs = self.timeout_cbs.read().clone();
        for cb in cbs {
            cb(&rpc);
        }

        if rpc.0.info.reset_timer {
            let alive = rpc.endpoint().is_some_and(|ep| {
                self.engine
                    .group(&ep.group)
                    .is_ok_and(|group| group.contains(ep.rank))
            });
            if alive {
                let deadline = Instant::now() + rpc.effective_timeout();
                let mut st = self.state.lock();
                if st.tracked.contains_key(&rpc.id()) {
                    rpc.0.slot.lock().deadline = Some(deadline);
                    st.timeouts.push(Reverse((deadline, rpc.id())));
                    rpc_log!(debug, rpc; "timer reset");
                    return;
                }
            }
        }

        let (state, on_wire, lookup) = {
            let mut slot = rpc.0.slot.lock();
            let lookup = if slot.state == RpcState::ResolvingUri {
                slot.lookup.take()
            } else {
                None
            };
            (slot.state, slot.on_wire, lookup)
        };
        rpc_log!(warn, rpc; "timed out in state {:?}", state);

        let timed_out = || {
            CartwrightError::new(
                ErrorKind::Timeout,
                format!("rpc {} timed out", rpc.id()),
            )
        };
        match state {
            RpcState::ResolvingUri => {
                let _ = rpc.complete(Err(timed_out()));
                if let Some(lookup) = lookup {
                    let _ = lookup.abort();
                }
            }
            RpcState::ResolvingAddress => {
                let _ = rpc.complete(Err(CartwrightError::new(
                    ErrorKind::Unreachable,
                    format!("rpc {} address resolution timed out", rpc.id()),
                )));
            }
            RpcState::Sent if on_wire => {
                if self.wire_remove(rpc.id()).is_some() {
                    if let Err(e) = self.port.cancel(rpc.id()) {
                        rpc_log!(debug, rpc; "transport cancel failed: {}", e);
                    }
                    let _ = rpc.complete(Err(timed_out()));
                }
            }
            _ => {
                let _ = rpc.complete(Err(timed_out()));
            }
        }
    }

    /// Refuses new requests and cancels every tracked one.
    fn close(&self) {
        let pending: Vec<Rpc> = {
            let mut st = self.state.lock();
            st.closed = true;
            st.wire.clear();
            st.timeouts.clear();
            st.lookup_waitq.clear();
            st.ep_waitq.clear();
            st.tracked.drain().map(|(_, rpc)| rpc).collect()
        };
        if !pending.is_empty() {
            pf_info!(
                "context {} closing with {} requests pending",
                self.tag,
                pending.len()
            );
        }
        for rpc in pending {
            let _ = rpc.complete(Err(CartwrightError::new(
                ErrorKind::Canceled,
                format!("context {} closed", self.tag),
            )));
        }
    }
}

// ContextHandle public API implementation
impl ContextHandle {
    /// Tag of this context within the process.
    #[inline]
    pub fn tag(&self) -> Tag {
        self.0.tag
    }

    /// URI peers reach this context at.
    pub fn uri(&self) -> &str {
        self.0.port.uri()
    }

    /// Creates a request. The endpoint may be left for `set_endpoint()`.
    pub fn create_request(
        &self,
        endpoint: Option<Endpoint>,
        opc: Opcode,
    ) -> Result<Rpc, CartwrightError> {
        let info = self.0.engine.opcodes.lookup(opc)?;
        if let Some(ep) = &endpoint {
            if ep.tag >= self.0.engine.config.max_tags {
                return logged_err!(
                    InvalidArgument;
                    "tag {} exceeds limit {}",
                    ep.tag,
                    self.0.engine.config.max_tags
                );
            }
        }
        Ok(Rpc::new(&self.0, info, endpoint))
    }

    /// Creates a collective request rooted at self over the live members
    /// of `group` minus `excluded`. `topo` defaults to the configured tree.
    #[allow(clippy::too_many_arguments)]
    pub fn corpc_create(
        &self,
        group: &str,
        excluded: &[Rank],
        opc: Opcode,
        input: Bytes,
        topo: Option<TreeTopo>,
        root: Rank,
        root_excluded: bool,
    ) -> Result<Rpc, CartwrightError> {
        corpc::create(
            &self.0,
            group,
            excluded,
            opc,
            input,
            topo,
            root,
            root_excluded,
        )
    }

    /// Sets the default timeout of requests submitted from now on.
    pub fn set_timeout(
        &self,
        timeout: Duration,
    ) -> Result<(), CartwrightError> {
        if timeout.is_zero() {
            return logged_err!(InvalidArgument; "zero context timeout");
        }
        self.0
            .default_timeout_ms
            .store(timeout.as_millis().max(1) as u64, Ordering::Relaxed);
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        self.0.default_timeout()
    }

    /// Aborts every tracked request targeting `rank` of `group`. Returns
    /// how many were aborted.
    pub fn ep_abort(&self, group: &str, rank: Rank) -> usize {
        let targets: Vec<Rpc> = self
            .0
            .state
            .lock()
            .tracked
            .values()
            .cloned()
            .collect();
        let mut aborted = 0;
        for rpc in targets {
            let hit = rpc
                .endpoint()
                .is_some_and(|ep| ep.group == group && ep.rank == rank);
            if hit && rpc.abort().is_ok() {
                aborted += 1;
            }
        }
        pf_debug!(
            "aborted {} requests to group '{}' rank {}",
            aborted,
            group,
            rank
        );
        aborted
    }

    pub fn register_progress_cb(&self, cb: ProgressCb) {
        self.0.progress_cbs.write().push(cb);
    }

    pub fn register_timeout_cb(&self, cb: TimeoutCb) {
        self.0.timeout_cbs.write().push(cb);
    }

    pub fn stats(&self) -> ContextStats {
        let st = self.0.state.lock();
        ContextStats {
            tracked: st.tracked.len(),
            queued: st.lookup_waitq.len()
                + st.ep_waitq.values().map(VecDeque::len).sum::<usize>(),
            on_wire: st.wire.len(),
            lookups_inflight: st.lookups_inflight,
            live_rpcs: self.0.live_rpcs.load(Ordering::Relaxed),
        }
    }
}

// Context progress implementation
impl Context {
    pub(crate) fn new(
        shared: Arc<ContextShared>,
        rx_events: mpsc::UnboundedReceiver<TransportEvent>,
    ) -> Self {
        Context {
            handle: ContextHandle(shared),
            rx_events,
        }
    }

    /// Cloneable handle to this context.
    pub fn handle(&self) -> ContextHandle {
        self.handle.clone()
    }

    fn drain(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(event) = self.rx_events.try_recv() {
            self.handle.0.handle_event(event);
            handled += 1;
        }
        handled
    }

    /// Runs progress callbacks, handles every available transport event,
    /// waits up to `timeout` (or the next request deadline, if earlier)
    /// for one if there was none, then fires expired timeouts. Returns the
    /// number of events handled plus timeouts fired.
    pub async fn progress(
        &mut self,
        timeout: Duration,
    ) -> Result<usize, CartwrightError> {
        let cbs = self.handle.0.progress_cbs.read().clone();
        for cb in cbs {
            cb();
        }

        let mut handled = self.drain();
        if handled == 0 && !timeout.is_zero() {
            let wait = match self.handle.0.next_deadline() {
                Some(deadline) => timeout
                    .min(deadline.saturating_duration_since(Instant::now())),
                None => timeout,
            };
            let waited = time::timeout(wait, self.rx_events.recv()).await;
            match waited {
                Ok(Some(event)) => {
                    self.handle.0.handle_event(event);
                    handled += 1 + self.drain();
                }
                Ok(None) => {
                    return logged_err!(
                        Transport;
                        "event channel of context {} closed",
                        self.handle.0.tag
                    );
                }
                Err(_) => {}
            }
        }

        handled += self.handle.0.check_timeouts();
        Ok(handled)
    }

    /// Progresses until `cond()` holds. Fails with `Timeout` if it still
    /// does not after `timeout`.
    pub async fn progress_cond(
        &mut self,
        timeout: Duration,
        mut cond: impl FnMut() -> bool,
    ) -> Result<(), CartwrightError> {
        let deadline = Instant::now() + timeout;
        loop {
            if cond() {
                return Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(CartwrightError::new(
                    ErrorKind::Timeout,
                    format!("condition not met within {:?}", timeout),
                ));
            }
            self.progress(deadline - now).await?;
        }
    }

    /// Progresses until no request is tracked.
    pub async fn flush(
        &mut self,
        timeout: Duration,
    ) -> Result<(), CartwrightError> {
        let shared = self.handle.0.clone();
        self.progress_cond(timeout, move || {
            shared.state.lock().tracked.is_empty()
        })
        .await
    }
}

impl Deref for Context {
    type Target = ContextHandle;

    fn deref(&self) -> &ContextHandle {
        &self.handle
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        self.handle.0.close();
        self.handle.0.engine.context_gone(self.handle.0.tag);
        pf_debug!("context {} destroyed", self.handle.0.tag);
    }
}

#[cfg(test)]
mod context_tests {
    use super::*;
    use crate::engine::{Engine, ProtoFormat, RpcFormat};
    use crate::transport::LocalFabric;

    const TEST_BASE: u8 = 0x21;

    fn test_engine(
        fabric: &LocalFabric,
        config: &str,
    ) -> Result<Engine, CartwrightError> {
        let engine = Engine::new(Some(config), Arc::new(fabric.clone()))?;
        engine.register_proto(ProtoFormat {
            name: "ctx_test".into(),
            base: TEST_BASE,
            version: 0,
            rpcs: vec![
                RpcFormat::new("echo").handler(|rpc: Rpc| {
                    let input = rpc.input();
                    let _ = rpc.reply(input);
                }),
                RpcFormat::new("sink").handler(|_rpc: Rpc| {}),
                RpcFormat::new("sticky")
                    .handler(|_rpc: Rpc| {})
                    .reset_timer(),
                RpcFormat::new("urgent")
                    .handler(|rpc: Rpc| {
                        let input = rpc.input();
                        let _ = rpc.reply(input);
                    })
                    .queue_front(),
            ],
        })?;
        Ok(engine)
    }

    #[tokio::test(flavor = "current_thread")]
    async fn flow_control_credits() -> Result<(), CartwrightError> {
        let fabric = LocalFabric::new("credits");
        let server = test_engine(&fabric, "is_service = true")?;
        let mut sctx = server.context_create()?;
        server.group_create("g", 0, vec![0])?;
        let client = test_engine(&fabric, "ep_credits = 2")?;
        let mut cctx = client.context_create()?;
        client.group_attach("g", 0, sctx.uri(), vec![0])?;

        let opc = crate::engine::opcode(TEST_BASE, 0, 0);
        let done = Arc::new(AtomicUsize::new(0));
        let mut rpcs = Vec::new();
        let ep = Endpoint::new("g", 0, 0);
        for _ in 0..5 {
            let rpc = cctx.create_request(Some(ep.clone()), opc)?;
            let done_ref = done.clone();
            rpc.send(move |info| {
                assert!(info.status.is_ok());
                done_ref.fetch_add(1, Ordering::SeqCst);
            })?;
            rpcs.push(rpc);
        }
        let stats = cctx.stats();
        assert_eq!(stats.tracked, 5);
        assert_eq!(stats.queued, 3);
        assert!(rpcs[4].history().contains(&RpcState::Queued));

        for _ in 0..50 {
            sctx.progress(Duration::ZERO).await?;
            cctx.progress(Duration::from_millis(5)).await?;
            if done.load(Ordering::SeqCst) == 5 {
                break;
            }
        }
        assert_eq!(done.load(Ordering::SeqCst), 5);
        assert_eq!(cctx.stats().tracked, 0);
        assert_eq!(cctx.stats().queued, 0);
        Ok(())
    }

    #[tokio::test(flavor = "current_thread")]
    async fn queue_front_jumps_waiters() -> Result<(), CartwrightError> {
        let fabric = LocalFabric::new("front");
        let server = test_engine(&fabric, "is_service = true")?;
        let mut sctx = server.context_create()?;
        server.group_create("g", 0, vec![0])?;
        let client = test_engine(&fabric, "ep_credits = 1")?;
        let mut cctx = client.context_create()?;
        client.group_attach("g", 0, sctx.uri(), vec![0])?;

        let echo = crate::engine::opcode(TEST_BASE, 0, 0);
        let urgent = crate::engine::opcode(TEST_BASE, 0, 3);
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut rpcs = Vec::new();
        for (name, opc) in [("a", echo), ("b", echo), ("c", urgent)] {
            let rpc =
                cctx.create_request(Some(Endpoint::new("g", 0, 0)), opc)?;
            let order_ref = order.clone();
            rpc.send(move |info| {
                assert!(info.status.is_ok());
                order_ref.lock().push(name);
            })?;
            rpcs.push(rpc);
        }
        assert_eq!(rpcs[0].state(), RpcState::Sent);
        assert_eq!(rpcs[1].state(), RpcState::Queued);
        assert_eq!(rpcs[2].state(), RpcState::Queued);
        assert_eq!(cctx.stats().queued, 2);

        for _ in 0..10 {
            sctx.progress(Duration::ZERO).await?;
            cctx.progress(Duration::ZERO).await?;
        }
        assert_eq!(*order.lock(), vec!["a", "c", "b"]);
        assert_eq!(cctx.stats().tracked, 0);
        Ok(())
    }

    #[tokio::test(flavor = "current_thread")]
    async fn progress_callbacks_every_poll() -> Result<(), CartwrightError> {
        let fabric = LocalFabric::new("pcb");
        let client = test_engine(&fabric, "")?;
        let mut cctx = client.context_create()?;

        let polls = Arc::new(AtomicUsize::new(0));
        let polls_ref = polls.clone();
        cctx.register_progress_cb(Arc::new(move || {
            polls_ref.fetch_add(1, Ordering::SeqCst);
        }));
        for _ in 0..3 {
            assert_eq!(cctx.progress(Duration::ZERO).await?, 0);
        }
        assert_eq!(polls.load(Ordering::SeqCst), 3);

        // progress_cond polls at least once more before giving up
        let res = cctx
            .progress_cond(Duration::from_millis(20), || false)
            .await;
        assert_eq!(res.unwrap_err().kind(), ErrorKind::Timeout);
        assert!(polls.load(Ordering::SeqCst) > 3);
        Ok(())
    }

    #[tokio::test(flavor = "current_thread")]
    async fn ep_abort_cancels_rank() -> Result<(), CartwrightError> {
        let fabric = LocalFabric::new("epabort");
        let s0 = test_engine(&fabric, "is_service = true")?;
        let sctx0 = s0.context_create()?;
        s0.group_create("g", 0, vec![0, 1])?;
        let s1 = test_engine(&fabric, "is_service = true")?;
        let sctx1 = s1.context_create()?;
        s1.group_create("g", 1, vec![0, 1])?;
        let client = test_engine(&fabric, "")?;
        let mut cctx = client.context_create()?;
        let group = client.group_attach("g", 0, sctx0.uri(), vec![0, 1])?;
        group.insert_uri(1, 0, sctx1.uri())?;
        fabric.set_blackholed(sctx0.uri(), true);
        fabric.set_blackholed(sctx1.uri(), true);

        let opc = crate::engine::opcode(TEST_BASE, 0, 0);
        let canceled = Arc::new(AtomicUsize::new(0));
        let mut rpcs = Vec::new();
        for rank in [0, 0, 1] {
            let rpc =
                cctx.create_request(Some(Endpoint::new("g", rank, 0)), opc)?;
            let canceled_ref = canceled.clone();
            rpc.send(move |info| {
                if info.status.is_err_and(|e| e.is(ErrorKind::Canceled)) {
                    canceled_ref.fetch_add(1, Ordering::SeqCst);
                }
            })?;
            rpcs.push(rpc);
        }
        assert_eq!(cctx.stats().on_wire, 3);

        assert_eq!(cctx.ep_abort("g", 0), 2);
        assert_eq!(cctx.ep_abort("g", 5), 0);
        let canceled_ref = canceled.clone();
        cctx.progress_cond(Duration::from_secs(2), || {
            canceled_ref.load(Ordering::SeqCst) == 2
        })
        .await?;
        assert_eq!(rpcs[0].state(), RpcState::Canceled);
        assert_eq!(rpcs[1].state(), RpcState::Canceled);
        assert_eq!(rpcs[2].state(), RpcState::Sent);
        assert_eq!(cctx.stats().tracked, 1);
        Ok(())
    }

    #[tokio::test(flavor = "current_thread")]
    async fn reset_timer_rearms_while_member() -> Result<(), CartwrightError>
    {
        let fabric = LocalFabric::new("rearm");
        let server = test_engine(&fabric, "is_service = true")?;
        let sctx = server.context_create()?;
        server.group_create("g", 0, vec![0])?;
        let client = test_engine(&fabric, "")?;
        let mut cctx = client.context_create()?;
        let group = client.group_attach("g", 0, sctx.uri(), vec![0])?;
        fabric.set_blackholed(sctx.uri(), true);

        let fired = Arc::new(AtomicUsize::new(0));
        let fired_ref = fired.clone();
        cctx.register_timeout_cb(Arc::new(move |_: &Rpc| {
            fired_ref.fetch_add(1, Ordering::SeqCst);
        }));

        let opc = crate::engine::opcode(TEST_BASE, 0, 2);
        let rpc = cctx.create_request(Some(Endpoint::new("g", 0, 0)), opc)?;
        rpc.set_timeout(Duration::from_millis(10))?;
        let status = Arc::new(Mutex::new(None));
        let status_ref = status.clone();
        rpc.send(move |info| {
            *status_ref.lock() = Some(info.status);
        })?;

        // still a member: every expiry re-arms the timer
        let fired_ref = fired.clone();
        cctx.progress_cond(Duration::from_secs(2), || {
            fired_ref.load(Ordering::SeqCst) >= 3
        })
        .await?;
        assert_eq!(rpc.state(), RpcState::Sent);
        assert!(status.lock().is_none());

        // once the rank is gone the next expiry fails the request
        group.remove_rank(0)?;
        let status_ref = status.clone();
        cctx.progress_cond(Duration::from_secs(2), || {
            status_ref.lock().is_some()
        })
        .await?;
        let kind = status
            .lock()
            .take()
            .and_then(|s| s.err())
            .map(|e| e.kind());
        assert_eq!(kind, Some(ErrorKind::Timeout));
        assert_eq!(cctx.stats().tracked, 0);
        Ok(())
    }

    #[tokio::test(flavor = "current_thread")]
    async fn timeout_on_wire() -> Result<(), CartwrightError> {
        let fabric = LocalFabric::new("timeout");
        let server = test_engine(&fabric, "is_service = true")?;
        let sctx = server.context_create()?;
        server.group_create("g", 0, vec![0])?;
        let client = test_engine(&fabric, "")?;
        let mut cctx = client.context_create()?;
        client.group_attach("g", 0, sctx.uri(), vec![0])?;
        fabric.set_blackholed(sctx.uri(), true);

        let fired = Arc::new(AtomicUsize::new(0));
        let fired_ref = fired.clone();
        cctx.register_timeout_cb(Arc::new(move |_: &Rpc| {
            fired_ref.fetch_add(1, Ordering::SeqCst);
        }));

        let opc = crate::engine::opcode(TEST_BASE, 0, 0);
        let rpc = cctx.create_request(Some(Endpoint::new("g", 0, 0)), opc)?;
        rpc.set_timeout(Duration::from_millis(30))?;
        let status = Arc::new(Mutex::new(None));
        let status_ref = status.clone();
        rpc.send(move |info| {
            *status_ref.lock() = Some(info.status);
        })?;
        assert_eq!(rpc.state(), RpcState::Sent);
        assert_eq!(cctx.stats().on_wire, 1);

        let status_ref = status.clone();
        cctx.progress_cond(Duration::from_secs(2), || {
            status_ref.lock().is_some()
        })
        .await?;
        let kind = status
            .lock()
            .take()
            .and_then(|s| s.err())
            .map(|e| e.kind());
        assert_eq!(kind, Some(ErrorKind::Timeout));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(rpc.state(), RpcState::Completed);
        assert_eq!(
            rpc.abort().unwrap_err().kind(),
            ErrorKind::AlreadyFinished
        );

        // the transport's late cancel event is stale and ignored
        cctx.progress(Duration::from_millis(10)).await?;
        assert_eq!(cctx.stats().tracked, 0);
        assert_eq!(cctx.stats().on_wire, 0);
        Ok(())
    }

    #[tokio::test(flavor = "current_thread")]
    async fn handler_without_reply() -> Result<(), CartwrightError> {
        let fabric = LocalFabric::new("noreply");
        let server = test_engine(&fabric, "is_service = true")?;
        let mut sctx = server.context_create()?;
        server.group_create("g", 0, vec![0])?;
        let client = test_engine(&fabric, "")?;
        let mut cctx = client.context_create()?;
        client.group_attach("g", 0, sctx.uri(), vec![0])?;

        let opc = crate::engine::opcode(TEST_BASE, 0, 1);
        let rpc = cctx.create_request(Some(Endpoint::new("g", 0, 0)), opc)?;
        let status = Arc::new(Mutex::new(None));
        let status_ref = status.clone();
        rpc.send(move |info| {
            *status_ref.lock() = Some(info.status);
        })?;

        // the sink handler drops its request object without replying
        assert_eq!(sctx.progress(Duration::from_secs(1)).await?, 1);
        let status_ref = status.clone();
        cctx.progress_cond(Duration::from_secs(2), || {
            status_ref.lock().is_some()
        })
        .await?;
        let kind = status
            .lock()
            .take()
            .and_then(|s| s.err())
            .map(|e| e.kind());
        assert_eq!(kind, Some(ErrorKind::NoReply));
        assert_eq!(sctx.stats().live_rpcs, 0);
        Ok(())
    }

    #[tokio::test(flavor = "current_thread")]
    async fn drop_cancels_pending() -> Result<(), CartwrightError> {
        let fabric = LocalFabric::new("close");
        let client = test_engine(&fabric, "")?;
        let cctx = client.context_create()?;
        client.group_attach("g", 0, "local://close/99", vec![0])?;

        let opc = crate::engine::opcode(TEST_BASE, 0, 0);
        let rpc = cctx.create_request(Some(Endpoint::new("g", 0, 0)), opc)?;
        let status = Arc::new(Mutex::new(None));
        let status_ref = status.clone();
        rpc.send(move |info| {
            *status_ref.lock() = Some(info.status);
        })?;
        // resolution of the bogus uri fails right away
        assert!(rpc.state().is_terminal());
        let kind = status
            .lock()
            .take()
            .and_then(|s| s.err())
            .map(|e| e.kind());
        assert_eq!(kind, Some(ErrorKind::Unreachable));

        let rpc = cctx.create_request(Some(Endpoint::new("g", 0, 0)), opc)?;
        let handle = cctx.handle();
        drop(cctx);
        assert_eq!(
            rpc.send(|_| {}).map(|_| rpc.state()),
            Ok(RpcState::Canceled)
        );
        assert!(handle.create_request(None, opc).is_ok());
        Ok(())
    }
}
