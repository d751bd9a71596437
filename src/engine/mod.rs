//! RPC engine: protocol registry, groups, progress contexts and the
//! request lifecycle.

mod addr_cache;
mod context;
mod corpc;
mod dispatch;
mod group;
mod internal;
mod lookup;
mod opcode;
mod request;

pub use addr_cache::AddrCache;
pub use context::{
    Context, ContextHandle, ContextStats, ProgressCb, TimeoutCb,
};
pub use group::{Group, GroupEvent, GroupEventCb};
pub use opcode::{
    opc_base, opc_seq, opc_version, opcode, CorpcOps, Opcode, ProtoFormat,
    RpcFormat, RpcHandler, OPC_PING, OPC_URI_LOOKUP, PROTO_INTERNAL_BASE,
};
pub use request::{CbInfo, CompletionCb, Rpc, RpcId, RpcState};

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::hlc::Hlc;
use crate::transport::Transport;
use crate::tree::{TreeKind, TreeTopo};
use crate::utils::{set_me, CartwrightError};

use context::ContextShared;
use opcode::OpcodeMap;

use parking_lot::RwLock;

use serde::{Deserialize, Serialize};

use tokio::sync::mpsc;

/// Rank of a process within a group.
pub type Rank = u32;

/// Index of a context within a process.
pub type Tag = u32;

/// Logical RPC destination.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub group: String,
    pub rank: Rank,
    pub tag: Tag,
}

impl Endpoint {
    pub fn new(group: impl ToString, rank: Rank, tag: Tag) -> Self {
        Endpoint {
            group: group.to_string(),
            rank,
            tag,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}/{}:{}", self.group, self.rank, self.tag)
    }
}

/// Configuration parameters struct.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Whether this process serves groups (as opposed to only attaching
    /// to them as a client).
    pub is_service: bool,

    /// Default request timeout in seconds.
    pub timeout_sec: u64,

    /// Maximum in-flight requests per destination rank, 0 for unlimited.
    pub ep_credits: usize,

    /// Maximum URI lookups in flight per context, 0 for unlimited.
    pub max_inflight_lookups: usize,

    /// Retries of a failed URI lookup before giving up.
    pub uri_lookup_retries: u32,

    /// Default collective tree shape.
    pub tree_kind: TreeKind,

    /// Default collective branch ratio.
    pub branch_ratio: u32,

    pub min_branch_ratio: u32,
    pub max_branch_ratio: u32,

    /// Maximum number of ranks in a group.
    pub max_group_size: u32,

    /// Maximum number of contexts (tags) per process.
    pub max_tags: u32,

    /// Maximum tolerated clock offset between processes in nanoseconds.
    pub hlc_epsilon_ns: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            is_service: false,
            timeout_sec: 60,
            ep_credits: 0,
            max_inflight_lookups: 0,
            uri_lookup_retries: 0,
            tree_kind: TreeKind::Knomial,
            branch_ratio: 4,
            min_branch_ratio: 2,
            max_branch_ratio: 64,
            max_group_size: 65536,
            max_tags: 64,
            hlc_epsilon_ns: 1_000_000_000,
        }
    }
}

impl EngineConfig {
    /// Composes a config from defaults overwritten by a TOML string.
    pub fn parse(config_str: Option<&str>) -> Result<Self, CartwrightError> {
        parsed_config!(config_str => EngineConfig;
                       is_service, timeout_sec, ep_credits,
                       max_inflight_lookups, uri_lookup_retries,
                       tree_kind, branch_ratio, min_branch_ratio,
                       max_branch_ratio, max_group_size,
                       max_tags, hlc_epsilon_ns)
    }
}

/// Engine state shared by its contexts and requests.
pub(crate) struct EngineShared {
    pub(crate) config: EngineConfig,
    pub(crate) hlc: Arc<Hlc>,
    pub(crate) opcodes: OpcodeMap,
    groups: RwLock<HashMap<String, Arc<Group>>>,
    transport: Arc<dyn Transport>,

    /// Tag of the next context.
    next_tag: AtomicU32,

    /// URIs of the open contexts by tag.
    ctx_uris: RwLock<HashMap<Tag, String>>,

    next_rpc_id: AtomicU64,
}

impl EngineShared {
    #[inline]
    pub(crate) fn next_rpc_id(&self) -> RpcId {
        self.next_rpc_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn group(
        &self,
        name: &str,
    ) -> Result<Arc<Group>, CartwrightError> {
        match self.groups.read().get(name) {
            Some(group) => Ok(group.clone()),
            None => logged_err!(InvalidArgument; "unknown group '{}'", name),
        }
    }

    /// URI of the local context with given tag.
    pub(crate) fn context_uri(&self, tag: Tag) -> Option<String> {
        self.ctx_uris.read().get(&tag).cloned()
    }

    pub(crate) fn context_gone(&self, tag: Tag) {
        self.ctx_uris.write().remove(&tag);
    }

    /// Collective tree used when a call names none.
    pub(crate) fn default_topo(&self) -> Result<TreeTopo, CartwrightError> {
        TreeTopo::bounded(
            self.config.tree_kind,
            self.config.branch_ratio,
            self.config.min_branch_ratio,
            self.config.max_branch_ratio,
        )
    }
}

/// Handle to an RPC engine. Cheap to clone.
#[derive(Clone)]
pub struct Engine(Arc<EngineShared>);

// Engine public API implementation
impl Engine {
    /// Creates an engine over given transport, with configuration parsed
    /// from an optional TOML string.
    pub fn new(
        config_str: Option<&str>,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, CartwrightError> {
        let config = EngineConfig::parse(config_str)?;
        let hlc = Hlc::new(config.hlc_epsilon_ns);
        Self::build(config, transport, hlc)
    }

    /// Creates an engine with a caller-provided clock. The clock's own
    /// epsilon takes precedence over the configured one.
    pub fn with_hlc(
        config_str: Option<&str>,
        transport: Arc<dyn Transport>,
        hlc: Hlc,
    ) -> Result<Self, CartwrightError> {
        let config = EngineConfig::parse(config_str)?;
        Self::build(config, transport, hlc)
    }

    fn build(
        config: EngineConfig,
        transport: Arc<dyn Transport>,
        hlc: Hlc,
    ) -> Result<Self, CartwrightError> {
        if config.timeout_sec == 0 {
            return logged_err!(
                InvalidArgument;
                "invalid config.timeout_sec '{}'",
                config.timeout_sec
            );
        }
        if config.max_tags == 0 {
            return logged_err!(
                InvalidArgument;
                "invalid config.max_tags '{}'",
                config.max_tags
            );
        }
        if config.min_branch_ratio < 2
            || config.min_branch_ratio > config.max_branch_ratio
        {
            return logged_err!(
                InvalidArgument;
                "invalid config branch ratio bounds [{}, {}]",
                config.min_branch_ratio,
                config.max_branch_ratio
            );
        }

        let shared = Arc::new(EngineShared {
            config,
            hlc: Arc::new(hlc),
            opcodes: OpcodeMap::default(),
            groups: RwLock::new(HashMap::new()),
            transport,
            next_tag: AtomicU32::new(0),
            ctx_uris: RwLock::new(HashMap::new()),
            next_rpc_id: AtomicU64::new(1),
        });
        shared.default_topo()?;
        shared.opcodes.register(internal::internal_proto())?;

        pf_debug!("engine created with {:?}", shared.config);
        Ok(Engine(shared))
    }

    #[inline]
    pub fn config(&self) -> &EngineConfig {
        &self.0.config
    }

    /// The engine's clock, shared by all of its contexts.
    #[inline]
    pub fn hlc(&self) -> &Arc<Hlc> {
        &self.0.hlc
    }

    /// Registers a protocol and returns its opcodes in RPC order.
    pub fn register_proto(
        &self,
        proto: ProtoFormat,
    ) -> Result<Vec<Opcode>, CartwrightError> {
        if proto.base == PROTO_INTERNAL_BASE {
            return logged_err!(
                InvalidArgument;
                "protocol base {:#x} is reserved",
                proto.base
            );
        }
        self.0.opcodes.register(proto)
    }

    /// Highest registered version of protocol `base` within
    /// `[min_version, max_version]`.
    pub fn proto_query(
        &self,
        base: u8,
        min_version: u8,
        max_version: u8,
    ) -> Option<u8> {
        self.0.opcodes.query(base, min_version, max_version)
    }

    fn insert_group(
        &self,
        group: Group,
    ) -> Result<Arc<Group>, CartwrightError> {
        let mut groups = self.0.groups.write();
        if groups.contains_key(group.name()) {
            return logged_err!(
                InvalidArgument;
                "group '{}' already exists",
                group.name()
            );
        }
        let group = Arc::new(group);
        groups.insert(group.name().into(), group.clone());
        Ok(group)
    }

    /// Creates a group this process serves as `self_rank`.
    pub fn group_create(
        &self,
        name: &str,
        self_rank: Rank,
        members: Vec<Rank>,
    ) -> Result<Arc<Group>, CartwrightError> {
        if !self.0.config.is_service {
            return logged_err!(
                InvalidArgument;
                "client engine cannot serve group '{}'",
                name
            );
        }
        let group = self.insert_group(Group::new(
            name,
            Some(self_rank),
            members,
            self.0.config.max_group_size,
            self.0.config.max_tags,
        )?)?;
        set_me(format!("r{}", self_rank));
        pf_info!("serving group {:?}", group);
        Ok(group)
    }

    /// Attaches to a group as a client, through its primary service rank
    /// reachable at `psr_uri`.
    pub fn group_attach(
        &self,
        name: &str,
        psr_rank: Rank,
        psr_uri: &str,
        members: Vec<Rank>,
    ) -> Result<Arc<Group>, CartwrightError> {
        let group = Group::new(
            name,
            None,
            members,
            self.0.config.max_group_size,
            self.0.config.max_tags,
        )?;
        group.set_psr(psr_rank, psr_uri)?;
        let group = self.insert_group(group)?;
        set_me("cli");
        pf_info!("attached to group {:?} via '{}'", group, psr_uri);
        Ok(group)
    }

    pub fn group(&self, name: &str) -> Result<Arc<Group>, CartwrightError> {
        self.0.group(name)
    }

    /// Forgets a group. Requests already targeting it fail when they next
    /// need it.
    pub fn group_destroy(&self, name: &str) -> Result<(), CartwrightError> {
        match self.0.groups.write().remove(name) {
            Some(_) => Ok(()),
            None => logged_err!(InvalidArgument; "unknown group '{}'", name),
        }
    }

    /// Opens a new context with the next free tag.
    pub fn context_create(&self) -> Result<Context, CartwrightError> {
        let tag = self.0.next_tag.fetch_add(1, Ordering::SeqCst);
        if tag >= self.0.config.max_tags {
            self.0.next_tag.fetch_sub(1, Ordering::SeqCst);
            return logged_err!(
                InvalidArgument;
                "context tags exhausted ({})",
                self.0.config.max_tags
            );
        }

        let (tx_events, rx_events) = mpsc::unbounded_channel();
        let port = self.0.transport.listen(tx_events)?;
        let uri = port.uri().to_string();
        self.0.ctx_uris.write().insert(tag, uri.clone());
        let shared = Arc::new(ContextShared::new(
            tag,
            self.0.clone(),
            port,
            Duration::from_secs(self.0.config.timeout_sec),
        ));

        pf_info!("context {} listening at '{}'", tag, uri);
        Ok(Context::new(shared, rx_events))
    }

    /// URI of the local context with given tag.
    pub fn context_uri(&self, tag: Tag) -> Option<String> {
        self.0.context_uri(tag)
    }
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "Engine{{groups: {:?}, contexts: {}}}",
            self.0.groups.read().keys().collect::<Vec<_>>(),
            self.0.ctx_uris.read().len()
        )
    }
}
