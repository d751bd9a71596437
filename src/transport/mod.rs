//! Transport abstraction consumed by the RPC engine.
//!
//! A `Transport` opens one `Port` per engine context. A port owns a URI,
//! resolves peer URIs into opaque addresses, sends requests tagged with
//! an engine-chosen completion token, answers received requests, and
//! reports everything that happens asynchronously as `TransportEvent`s
//! pushed into the context's event sink.

mod local;
mod tcp;

pub use local::LocalFabric;
pub use tcp::TcpTransport;

use crate::engine::{Opcode, Rank, Tag};
use crate::utils::CartwrightError;

use bytes::Bytes;

use serde::{Deserialize, Serialize};

use tokio::sync::mpsc;

/// Token identifying one outstanding send. The engine uses request IDs.
pub type CompletionToken = u64;

/// Transport-resolved peer address handle, meaningful only to the port
/// that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransportAddr(pub u64);

/// Return route of a received request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyTo {
    /// Transport-specific route (port ID, connection ID, ...).
    pub route: u64,

    /// Token the requester attached to the request.
    pub token: CompletionToken,
}

/// Collective-call header carried by requests forwarded along a tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorpcHeader {
    /// Group version the root saw when starting the call.
    pub grp_version: u32,

    /// Ranks excluded from the call.
    pub excluded: Vec<Rank>,

    /// Encoded tree topology.
    pub tree_topo: u32,

    /// Root rank of the call.
    pub root: Rank,

    /// Whether the root skips the local handler.
    pub root_excluded: bool,
}

/// Header of every request on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcHeader {
    /// Opcode of the request.
    pub opc: Opcode,

    /// Target group name.
    pub group: String,

    /// Sender rank, if the sender is a member of the group.
    pub src_rank: Option<Rank>,

    /// Sender context tag.
    pub src_tag: Tag,

    /// Destination rank.
    pub dst_rank: Rank,

    /// Destination context tag.
    pub dst_tag: Tag,

    /// Sender's HLC timestamp at send time.
    pub hlc: u64,

    /// Request ID on the sender.
    pub rpc_id: u64,

    /// Present for collective calls.
    pub corpc: Option<CorpcHeader>,
}

/// Request message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireRequest {
    pub hdr: RpcHeader,
    pub payload: Bytes,
}

/// Reply message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireReply {
    /// Responder's HLC timestamp at reply time.
    pub hlc: u64,

    /// Error status set by the responder, `None` on success.
    pub status: Option<CartwrightError>,

    pub payload: Bytes,
}

impl WireReply {
    /// Reply carrying only an error status.
    pub fn error(hlc: u64, err: CartwrightError) -> Self {
        WireReply {
            hlc,
            status: Some(err),
            payload: Bytes::new(),
        }
    }
}

/// Asynchronous event delivered to a context.
#[derive(Debug)]
pub enum TransportEvent {
    /// A peer sent us a request.
    Request { reply_to: ReplyTo, req: WireRequest },

    /// Reply to one of our sends.
    Reply {
        token: CompletionToken,
        rep: WireReply,
    },

    /// One of our sends failed in transport.
    Failed {
        token: CompletionToken,
        err: CartwrightError,
    },

    /// One of our sends was canceled on request.
    Canceled { token: CompletionToken },
}

/// Sending side of a context's event channel.
pub type EventSink = mpsc::UnboundedSender<TransportEvent>;

/// Factory of per-context ports.
pub trait Transport: Send + Sync {
    /// Opens a new port whose events go into `sink`.
    fn listen(&self, sink: EventSink)
        -> Result<Box<dyn Port>, CartwrightError>;
}

/// One context's network endpoint. All methods are non-blocking.
pub trait Port: Send + Sync {
    /// URI peers use to reach this port.
    fn uri(&self) -> &str;

    /// Resolves a peer URI into an address handle.
    fn resolve(&self, uri: &str) -> Result<TransportAddr, CartwrightError>;

    /// Sends a request. Its outcome arrives later as a `Reply`, `Failed`
    /// or `Canceled` event carrying `token`.
    fn send(
        &self,
        addr: TransportAddr,
        token: CompletionToken,
        req: WireRequest,
    ) -> Result<(), CartwrightError>;

    /// Answers a received request.
    fn reply(
        &self,
        reply_to: &ReplyTo,
        rep: WireReply,
    ) -> Result<(), CartwrightError>;

    /// Best-effort cancellation of an outstanding send.
    fn cancel(&self, token: CompletionToken) -> Result<(), CartwrightError>;
}
