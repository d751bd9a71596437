//! Opcodes and protocol registration.
//!
//! An opcode packs `(base << 24) | (version << 16) | sequence`: `base`
//! names a protocol, `version` its revision, and `sequence` the position
//! of the RPC within the protocol.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::engine::Rpc;
use crate::utils::{CartwrightError, ErrorKind};

use bytes::Bytes;

use parking_lot::RwLock;

/// Process-wide unique RPC opcode.
pub type Opcode = u32;

/// Builds an opcode from its parts.
#[inline]
pub const fn opcode(base: u8, version: u8, seq: u16) -> Opcode {
    ((base as u32) << 24) | ((version as u32) << 16) | seq as u32
}

/// Protocol base of an opcode.
#[inline]
pub const fn opc_base(opc: Opcode) -> u8 {
    (opc >> 24) as u8
}

/// Protocol version of an opcode.
#[inline]
pub const fn opc_version(opc: Opcode) -> u8 {
    (opc >> 16) as u8
}

/// Sequence number of an opcode within its protocol.
#[inline]
pub const fn opc_seq(opc: Opcode) -> u16 {
    opc as u16
}

/// Protocol base reserved for the engine's own RPCs.
pub const PROTO_INTERNAL_BASE: u8 = 0xFF;

/// Chained URI lookup.
pub const OPC_URI_LOOKUP: Opcode = opcode(PROTO_INTERNAL_BASE, 0, 0);

/// Liveness probe answered by every engine, for failure detectors.
pub const OPC_PING: Opcode = opcode(PROTO_INTERNAL_BASE, 0, 1);

/// Server-side handler of an opcode, run on the progress thread. The
/// handler owns a reference to the request and must eventually `reply()`
/// unless the opcode is one-way.
pub type RpcHandler = Arc<dyn Fn(Rpc) + Send + Sync>;

/// Aggregation of collective call replies.
pub trait CorpcOps: Send + Sync {
    /// Folds one reply payload (a child's or the local handler's) into the
    /// accumulated result. Called with the request's state locked; must
    /// not call back into the engine.
    fn aggregate(
        &self,
        acc: &mut Option<Bytes>,
        source: Bytes,
    ) -> Result<(), CartwrightError>;
}

/// Format of one RPC within a protocol.
#[derive(Clone, Default)]
pub struct RpcFormat {
    pub name: String,

    /// One-way: no reply is ever sent.
    pub no_reply: bool,

    /// Re-arm instead of failing on timeout while the target rank is still
    /// a group member.
    pub reset_timer: bool,

    /// Jump ahead of waiting requests under flow control.
    pub queue_front: bool,

    pub handler: Option<RpcHandler>,

    pub co_ops: Option<Arc<dyn CorpcOps>>,
}

impl RpcFormat {
    pub fn new(name: impl ToString) -> Self {
        RpcFormat {
            name: name.to_string(),
            ..Default::default()
        }
    }

    pub fn handler(
        mut self,
        handler: impl Fn(Rpc) + Send + Sync + 'static,
    ) -> Self {
        self.handler = Some(Arc::new(handler));
        self
    }

    pub fn co_ops(mut self, ops: impl CorpcOps + 'static) -> Self {
        self.co_ops = Some(Arc::new(ops));
        self
    }

    pub fn no_reply(mut self) -> Self {
        self.no_reply = true;
        self
    }

    pub fn reset_timer(mut self) -> Self {
        self.reset_timer = true;
        self
    }

    pub fn queue_front(mut self) -> Self {
        self.queue_front = true;
        self
    }
}

/// A protocol: an ordered list of RPC formats sharing base and version.
#[derive(Clone)]
pub struct ProtoFormat {
    pub name: String,
    pub base: u8,
    pub version: u8,
    pub rpcs: Vec<RpcFormat>,
}

/// Registered properties of an opcode.
pub(crate) struct OpcodeInfo {
    pub(crate) opc: Opcode,
    pub(crate) name: String,
    pub(crate) no_reply: bool,
    pub(crate) reset_timer: bool,
    pub(crate) queue_front: bool,
    pub(crate) handler: Option<RpcHandler>,
    pub(crate) co_ops: Option<Arc<dyn CorpcOps>>,
}

impl fmt::Debug for OpcodeInfo {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}({:#x})", self.name, self.opc)
    }
}

/// Opcode registry of an engine.
#[derive(Default)]
pub(crate) struct OpcodeMap {
    entries: RwLock<HashMap<Opcode, Arc<OpcodeInfo>>>,
}

impl OpcodeMap {
    /// Registers every RPC of a protocol. Fails without registering anything
    /// if the protocol (base and version) is already known.
    pub(crate) fn register(
        &self,
        proto: ProtoFormat,
    ) -> Result<Vec<Opcode>, CartwrightError> {
        if proto.rpcs.is_empty() || proto.rpcs.len() > u16::MAX as usize {
            return logged_err!(
                InvalidArgument;
                "protocol '{}' has {} rpcs",
                proto.name,
                proto.rpcs.len()
            );
        }

        let mut entries = self.entries.write();
        let first = opcode(proto.base, proto.version, 0);
        if entries.contains_key(&first) {
            return logged_err!(
                InvalidArgument;
                "protocol '{}' base {:#x} version {} already registered",
                proto.name,
                proto.base,
                proto.version
            );
        }

        let mut opcodes = Vec::with_capacity(proto.rpcs.len());
        for (seq, fmt) in proto.rpcs.into_iter().enumerate() {
            let opc = opcode(proto.base, proto.version, seq as u16);
            entries.insert(
                opc,
                Arc::new(OpcodeInfo {
                    opc,
                    name: fmt.name,
                    no_reply: fmt.no_reply,
                    reset_timer: fmt.reset_timer,
                    queue_front: fmt.queue_front,
                    handler: fmt.handler,
                    co_ops: fmt.co_ops,
                }),
            );
            opcodes.push(opc);
        }
        pf_debug!(
            "registered protocol '{}' opcodes {:#x?}",
            proto.name,
            opcodes
        );
        Ok(opcodes)
    }

    pub(crate) fn lookup(
        &self,
        opc: Opcode,
    ) -> Result<Arc<OpcodeInfo>, CartwrightError> {
        self.entries.read().get(&opc).cloned().ok_or_else(|| {
            CartwrightError::new(
                ErrorKind::UnknownOpcode,
                format!("opcode {:#x} not registered", opc),
            )
        })
    }

    /// Returns true if some version of protocol `base` between
    /// `min_version` and `max_version` is registered, and the highest such
    /// version.
    pub(crate) fn query(
        &self,
        base: u8,
        min_version: u8,
        max_version: u8,
    ) -> Option<u8> {
        let entries = self.entries.read();
        (min_version..=max_version)
            .rev()
            .find(|&v| entries.contains_key(&opcode(base, v, 0)))
    }
}

#[cfg(test)]
mod opcode_tests {
    use super::*;

    fn test_proto(version: u8) -> ProtoFormat {
        ProtoFormat {
            name: "test".into(),
            base: 0x10,
            version,
            rpcs: vec![
                RpcFormat::new("get"),
                RpcFormat::new("put").no_reply(),
                RpcFormat::new("poll").reset_timer(),
            ],
        }
    }

    #[test]
    fn opcode_layout() {
        let opc = opcode(0x12, 3, 0x0405);
        assert_eq!(opc, 0x1203_0405);
        assert_eq!(opc_base(opc), 0x12);
        assert_eq!(opc_version(opc), 3);
        assert_eq!(opc_seq(opc), 0x0405);
        assert_eq!(opc_base(OPC_URI_LOOKUP), PROTO_INTERNAL_BASE);
    }

    #[test]
    fn register_and_lookup() -> Result<(), CartwrightError> {
        let map = OpcodeMap::default();
        let opcs = map.register(test_proto(1))?;
        assert_eq!(opcs, vec![0x1001_0000, 0x1001_0001, 0x1001_0002]);
        assert!(map.lookup(opcs[1])?.no_reply);
        assert!(map.lookup(opcs[2])?.reset_timer);
        assert_eq!(
            map.lookup(0x1001_0003).unwrap_err().kind(),
            ErrorKind::UnknownOpcode
        );
        assert!(map.register(test_proto(1)).is_err());
        map.register(test_proto(4))?;
        assert_eq!(map.query(0x10, 0, 3), Some(1));
        assert_eq!(map.query(0x10, 0, 9), Some(4));
        assert_eq!(map.query(0x11, 0, 9), None);
        Ok(())
    }
}
