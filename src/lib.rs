//! Cartwright: RPC engine for a distributed storage fabric.
//!
//! Requests are addressed to logical `(group, rank, tag)` endpoints and
//! carried by a pluggable `Transport`. The engine resolves endpoints to
//! transport addresses (chaining remote URI lookups when needed), tracks
//! every request through its lifecycle until it completes, times out or
//! is canceled, stamps all traffic with a hybrid logical clock, and fans
//! collective calls out along k-ary or k-nomial trees.

#[macro_use]
mod utils;

pub mod engine;
pub mod hlc;
pub mod transport;
pub mod tree;

pub use utils::{logger_init, set_me, Bitmap, CartwrightError, ErrorKind, ME};

pub use engine::{
    opcode, CbInfo, Context, ContextHandle, ContextStats, CorpcOps, Endpoint,
    Engine, EngineConfig, Group, GroupEvent, Opcode, ProtoFormat, Rank, Rpc,
    RpcFormat, RpcState, Tag,
};
pub use hlc::Hlc;
pub use transport::{LocalFabric, TcpTransport, Transport};
pub use tree::{TreeDescriptor, TreeKind, TreeTopo};
