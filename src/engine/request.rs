//! Request objects.
//!
//! An `Rpc` is a shared handle: cloning it takes a reference, dropping it
//! releases one, and the request is destroyed when the last reference goes
//! away. Every party that needs the request to stay alive across an
//! asynchronous step (the context's tracking tables, an in-flight chained
//! lookup, a collective child) simply holds a clone.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::engine::context::ContextShared;
use crate::engine::corpc::CorpcInfo;
use crate::engine::opcode::OpcodeInfo;
use crate::engine::{Endpoint, EngineShared, Opcode, Rank, Tag};
use crate::transport::{CorpcHeader, ReplyTo, RpcHeader, WireReply};
use crate::utils::{CartwrightError, ErrorKind};

use bytes::Bytes;

use parking_lot::Mutex;

/// Locally unique request identifier.
pub type RpcId = u64;

/// Lifecycle state of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RpcState {
    /// Created, not submitted yet.
    Initial,

    /// Submitted, waiting for a flow control credit.
    Queued,

    /// Waiting for a chained URI lookup.
    ResolvingUri,

    /// URI known, resolving the transport address.
    ResolvingAddress,

    /// Handed to the transport (or fanned out, for a collective call).
    Sent,

    /// Finished, successfully or with an error.
    Completed,

    /// Finished by cancellation.
    Canceled,
}

impl RpcState {
    #[inline]
    pub fn is_terminal(self) -> bool {
        matches!(self, RpcState::Completed | RpcState::Canceled)
    }
}

/// What a completion callback gets.
pub struct CbInfo {
    /// The completed request; its `output()` holds the reply payload.
    pub rpc: Rpc,

    /// Outcome of the request.
    pub status: Result<(), CartwrightError>,
}

/// Completion callback of a request.
pub type CompletionCb = Box<dyn FnOnce(CbInfo) + Send>;

/// What to do when a request completes.
pub(crate) enum Continuation {
    /// Hand the outcome to the submitter.
    User(CompletionCb),

    /// This request is a URI lookup on behalf of `parent`, asking `contact`
    /// for the URI of `target`.
    UriLookup {
        parent: Rpc,
        target: (Rank, Tag),
        contact: (Rank, Tag),
    },

    /// This request forwards a collective call to the `child_idx`-th child
    /// of `parent`.
    CorpcChild { parent: Rpc, child_idx: usize },
}

/// Mutable part of a request.
pub(crate) struct RpcSlot {
    pub(crate) state: RpcState,
    pub(crate) endpoint: Option<Endpoint>,
    pub(crate) input: Bytes,
    pub(crate) output: Bytes,
    pub(crate) continuation: Option<Continuation>,

    /// Per-request timeout overriding the context default.
    pub(crate) timeout: Option<Duration>,

    /// Armed deadline while tracked.
    pub(crate) deadline: Option<Instant>,

    /// True between a successful transport send and its completion event.
    pub(crate) on_wire: bool,

    /// URI lookup currently issued on behalf of this request.
    pub(crate) lookup: Option<Rpc>,

    /// Number of times the current lookup has been retried.
    pub(crate) lookup_retries: u32,

    /// Collective call state, for a collective root or an incoming
    /// collective request.
    pub(crate) corpc: Option<Box<CorpcInfo>>,

    /// Collective header to attach when sending (for collective children).
    pub(crate) corpc_hdr: Option<CorpcHeader>,

    /// Return route of an incoming request.
    pub(crate) reply_to: Option<ReplyTo>,

    /// Incoming request that still owes its sender a reply.
    pub(crate) reply_pending: bool,

    #[cfg(test)]
    pub(crate) history: Vec<RpcState>,
}

impl RpcSlot {
    fn new(endpoint: Option<Endpoint>) -> Self {
        RpcSlot {
            state: RpcState::Initial,
            endpoint,
            input: Bytes::new(),
            output: Bytes::new(),
            continuation: None,
            timeout: None,
            deadline: None,
            on_wire: false,
            lookup: None,
            lookup_retries: 0,
            corpc: None,
            corpc_hdr: None,
            reply_to: None,
            reply_pending: false,
            #[cfg(test)]
            history: vec![RpcState::Initial],
        }
    }

    /// Moves to a new state.
    #[inline]
    pub(crate) fn set_state(&mut self, state: RpcState) {
        debug_assert!(!self.state.is_terminal());
        self.state = state;
        #[cfg(test)]
        self.history.push(state);
    }
}

pub(crate) struct RpcInner {
    pub(crate) id: RpcId,
    pub(crate) info: Arc<OpcodeInfo>,
    pub(crate) ctx: Arc<ContextShared>,

    /// Received header, for requests that came in from a peer.
    pub(crate) hdr: Option<RpcHeader>,

    pub(crate) slot: Mutex<RpcSlot>,
}

/// Shared handle to a request.
#[derive(Clone)]
pub struct Rpc(pub(crate) Arc<RpcInner>);

impl Rpc {
    /// Creates an outgoing request.
    pub(crate) fn new(
        ctx: &Arc<ContextShared>,
        info: Arc<OpcodeInfo>,
        endpoint: Option<Endpoint>,
    ) -> Self {
        let id = ctx.engine.next_rpc_id();
        ctx.rpc_created();
        Rpc(Arc::new(RpcInner {
            id,
            info,
            ctx: ctx.clone(),
            hdr: None,
            slot: Mutex::new(RpcSlot::new(endpoint)),
        }))
    }

    /// Creates the server-side object of a received request.
    pub(crate) fn new_incoming(
        ctx: &Arc<ContextShared>,
        info: Arc<OpcodeInfo>,
        hdr: RpcHeader,
        input: Bytes,
        reply_to: ReplyTo,
    ) -> Self {
        let id = ctx.engine.next_rpc_id();
        ctx.rpc_created();
        let mut slot = RpcSlot::new(Some(Endpoint {
            group: hdr.group.clone(),
            rank: hdr.dst_rank,
            tag: hdr.dst_tag,
        }));
        slot.input = input;
        slot.reply_pending = !info.no_reply;
        slot.reply_to = Some(reply_to);
        Rpc(Arc::new(RpcInner {
            id,
            info,
            ctx: ctx.clone(),
            hdr: Some(hdr),
            slot: Mutex::new(slot),
        }))
    }

    #[inline]
    pub fn id(&self) -> RpcId {
        self.0.id
    }

    #[inline]
    pub fn opcode(&self) -> Opcode {
        self.0.info.opc
    }

    /// Name the opcode was registered with.
    pub fn opcode_name(&self) -> &str {
        &self.0.info.name
    }

    pub fn state(&self) -> RpcState {
        self.0.slot.lock().state
    }

    pub fn endpoint(&self) -> Option<Endpoint> {
        self.0.slot.lock().endpoint.clone()
    }

    /// Sets the target endpoint. An endpoint never changes once set.
    pub fn set_endpoint(
        &self,
        endpoint: Endpoint,
    ) -> Result<(), CartwrightError> {
        let mut slot = self.0.slot.lock();
        if slot.endpoint.is_some() {
            return Err(CartwrightError::new(
                ErrorKind::AlreadyBound,
                format!("rpc {} endpoint already set", self.0.id),
            ));
        }
        if self.0.ctx.engine.config.max_tags <= endpoint.tag {
            return Err(CartwrightError::new(
                ErrorKind::InvalidArgument,
                format!("tag {} exceeds limit", endpoint.tag),
            ));
        }
        slot.endpoint = Some(endpoint);
        Ok(())
    }

    pub fn input(&self) -> Bytes {
        self.0.slot.lock().input.clone()
    }

    /// Sets the request payload; only before submission.
    pub fn set_input(&self, input: Bytes) -> Result<(), CartwrightError> {
        let mut slot = self.0.slot.lock();
        if slot.state != RpcState::Initial || self.0.hdr.is_some() {
            return Err(CartwrightError::new(
                ErrorKind::InvalidArgument,
                format!("rpc {} input is frozen", self.0.id),
            ));
        }
        slot.input = input;
        Ok(())
    }

    /// Reply payload (or the aggregated result of a collective call).
    pub fn output(&self) -> Bytes {
        self.0.slot.lock().output.clone()
    }

    /// Overrides the context default timeout for this request.
    pub fn set_timeout(
        &self,
        timeout: Duration,
    ) -> Result<(), CartwrightError> {
        if timeout.is_zero() {
            return Err(CartwrightError::new(
                ErrorKind::InvalidArgument,
                "zero timeout",
            ));
        }
        let mut slot = self.0.slot.lock();
        if slot.state != RpcState::Initial {
            return Err(CartwrightError::new(
                ErrorKind::InvalidArgument,
                format!("rpc {} already submitted", self.0.id),
            ));
        }
        slot.timeout = Some(timeout);
        Ok(())
    }

    /// Takes another reference.
    #[inline]
    pub fn addref(&self) -> Rpc {
        self.clone()
    }

    /// Releases a reference; the request is destroyed with the last one.
    #[inline]
    pub fn decref(self) {
        drop(self)
    }

    /// Current number of references.
    #[inline]
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.0)
    }

    /// True for the server-side object of a received request.
    #[inline]
    pub fn is_incoming(&self) -> bool {
        self.0.hdr.is_some()
    }

    /// Sender rank of a received request.
    pub fn src_rank(&self) -> Option<Rank> {
        self.0.hdr.as_ref().and_then(|hdr| hdr.src_rank)
    }

    /// Sender context tag of a received request.
    pub fn src_tag(&self) -> Option<Tag> {
        self.0.hdr.as_ref().map(|hdr| hdr.src_tag)
    }

    /// Sender timestamp of a received request.
    pub fn src_hlc(&self) -> Option<u64> {
        self.0.hdr.as_ref().map(|hdr| hdr.hlc)
    }

    /// Tag of the context this request belongs to.
    #[inline]
    pub fn context_tag(&self) -> Tag {
        self.0.ctx.tag
    }

    #[inline]
    pub(crate) fn engine(&self) -> &Arc<EngineShared> {
        &self.0.ctx.engine
    }

    #[inline]
    pub(crate) fn ctx(&self) -> &Arc<ContextShared> {
        &self.0.ctx
    }

    #[inline]
    pub(crate) fn is_corpc(&self) -> bool {
        self.0.slot.lock().corpc.is_some()
    }

    /// Timeout this request runs with.
    pub(crate) fn effective_timeout(&self) -> Duration {
        self.0
            .slot
            .lock()
            .timeout
            .unwrap_or_else(|| self.0.ctx.default_timeout())
    }

    #[cfg(test)]
    pub(crate) fn history(&self) -> Vec<RpcState> {
        self.0.slot.lock().history.clone()
    }
}

impl fmt::Debug for Rpc {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let slot = self.0.slot.lock();
        write!(
            f,
            "Rpc{{{} {:?} {:?} {:?}}}",
            self.0.id, self.0.info, slot.state, slot.endpoint
        )
    }
}

impl Drop for RpcInner {
    fn drop(&mut self) {
        let slot = self.slot.get_mut();
        if slot.reply_pending {
            slot.reply_pending = false;
            if let Some(reply_to) = slot.reply_to.take() {
                pf_warn!(
                    "rpc {} opc {:#x} destroyed without reply",
                    self.id,
                    self.info.opc
                );
                let rep = WireReply::error(
                    self.ctx.engine.hlc.now(),
                    CartwrightError::new(
                        ErrorKind::NoReply,
                        format!(
                            "handler of opc {:#x} did not reply",
                            self.info.opc
                        ),
                    ),
                );
                if let Err(e) = self.ctx.port.reply(&reply_to, rep) {
                    pf_warn!(
                        "error sending NoReply for rpc {}: {}",
                        self.id,
                        e
                    );
                }
            }
        }
        pf_trace!("rpc {} destroyed", self.id);
        self.ctx.rpc_destroyed();
    }
}
