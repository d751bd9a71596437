//! Collective RPC.
//!
//! A collective request travels down a tree laid over the live members of
//! a group minus the excluded ranks. Every participant forwards it to its
//! children, runs the opcode's handler locally, folds the children's and
//! its own replies together through the opcode's `CorpcOps`, and answers
//! its parent once all of them are in. The root's completion callback
//! sees the aggregate of the whole tree.

use std::sync::Arc;

use crate::engine::context::ContextShared;
use crate::engine::opcode::OpcodeInfo;
use crate::engine::request::{Continuation, Rpc, RpcState};
use crate::engine::{Endpoint, Group, Opcode, Rank};
use crate::transport::CorpcHeader;
use crate::tree::{TreeDescriptor, TreeTopo};
use crate::utils::{Bitmap, CartwrightError, ErrorKind};

use bytes::Bytes;

/// Collective call state of a participant.
pub(crate) struct CorpcInfo {
    group: Arc<Group>,
    hdr: CorpcHeader,

    /// Child ranks in the tree, in forwarding order.
    children: Vec<Rank>,

    /// Which children have answered.
    acked: Bitmap,

    /// Local handler has not replied yet.
    local_pending: bool,

    /// Aggregated result so far.
    result: Option<Bytes>,

    /// First failure seen; fails the whole call.
    first_err: Option<CartwrightError>,

    started: bool,
    pub(crate) finished: bool,
}

impl CorpcInfo {
    fn new(group: Arc<Group>, hdr: CorpcHeader) -> Self {
        CorpcInfo {
            group,
            hdr,
            children: Vec::new(),
            acked: Bitmap::new(0, false),
            local_pending: false,
            result: None,
            first_err: None,
            started: false,
            finished: false,
        }
    }
}

/// Builds a collective request rooted at self.
#[allow(clippy::too_many_arguments)]
pub(crate) fn create(
    ctx: &Arc<ContextShared>,
    group: &str,
    excluded: &[Rank],
    opc: Opcode,
    input: Bytes,
    topo: Option<TreeTopo>,
    root: Rank,
    root_excluded: bool,
) -> Result<Rpc, CartwrightError> {
    let engine = &ctx.engine;
    let info = engine.opcodes.lookup(opc)?;
    if info.no_reply {
        return logged_err!(
            InvalidArgument;
            "opc {:#x} is one-way, cannot be collective",
            opc
        );
    }
    let group = engine.group(group)?;
    match group.self_rank() {
        Some(me) if me == root => {}
        me => {
            return logged_err!(
                InvalidArgument;
                "collective root {} must be self rank {:?}",
                root,
                me
            );
        }
    }
    let topo = match topo {
        Some(topo) => topo,
        None => engine.default_topo()?,
    };

    let mut excluded = excluded.to_vec();
    excluded.sort_unstable();
    excluded.dedup();
    let root_excluded = root_excluded || excluded.binary_search(&root).is_ok();
    let hdr = CorpcHeader {
        grp_version: group.version(),
        excluded,
        tree_topo: topo.encode(),
        root,
        root_excluded,
    };

    let rpc = Rpc::new(ctx, info, None);
    rpc.set_input(input)?;
    rpc.0.slot.lock().corpc = Some(Box::new(CorpcInfo::new(group, hdr)));
    Ok(rpc)
}

/// Starts a submitted collective request at the root.
pub(crate) fn dispatch(rpc: &Rpc) -> Result<(), CartwrightError> {
    rpc.advance(RpcState::Sent)?;
    fan_out(rpc)
}

/// Takes over a collective request received from the parent.
pub(crate) fn handle_incoming(rpc: Rpc, group: Arc<Group>, hdr: CorpcHeader) {
    rpc.0.slot.lock().corpc = Some(Box::new(CorpcInfo::new(group, hdr)));
    if let Err(e) = fan_out(&rpc) {
        rpc_log!(warn, rpc; "collective forwarding failed: {}", e);
        if let Some(info) = rpc.0.slot.lock().corpc.as_mut() {
            info.finished = true;
            info.local_pending = false;
        }
        if let Err(e) = rpc.reply_wire(Some(e), Bytes::new()) {
            rpc_log!(warn, rpc; "error replying to parent: {}", e);
        }
    }
}

/// Forwards to the children of self and runs the local handler.
fn fan_out(rpc: &Rpc) -> Result<(), CartwrightError> {
    let (group, hdr) = {
        let slot = rpc.0.slot.lock();
        let info = slot.corpc.as_ref().ok_or_else(|| {
            CartwrightError::new(ErrorKind::InvalidArgument, "not collective")
        })?;
        (info.group.clone(), info.hdr.clone())
    };
    let me = group.self_rank().ok_or_else(|| {
        CartwrightError::new(
            ErrorKind::BadTarget,
            format!("not a member of group '{}'", group.name()),
        )
    })?;
    if hdr.grp_version != group.version() {
        return Err(CartwrightError::new(
            ErrorKind::GroupVersion,
            format!(
                "collective on group '{}' version {}, local version {}",
                group.name(),
                hdr.grp_version,
                group.version()
            ),
        ));
    }

    // tree is laid over participant indices, in rank order
    let participants: Vec<Rank> = group
        .members()
        .into_iter()
        .filter(|r| *r == hdr.root || hdr.excluded.binary_search(r).is_err())
        .collect();
    let index_of = |rank: Rank| {
        participants.binary_search(&rank).map_err(|_| {
            CartwrightError::new(
                ErrorKind::BadTarget,
                format!("rank {} not a participant", rank),
            )
        })
    };
    let tree = TreeDescriptor::new(
        TreeTopo::decode(hdr.tree_topo)?,
        participants.len() as u32,
        index_of(hdr.root)? as u32,
        index_of(me)? as u32,
    )?;
    let children: Vec<Rank> = tree
        .children()
        .into_iter()
        .map(|idx| participants[idx as usize])
        .collect();
    let run_local = !(me == hdr.root && hdr.root_excluded);

    {
        let mut slot = rpc.0.slot.lock();
        if let Some(info) = slot.corpc.as_mut() {
            info.children = children.clone();
            info.acked = Bitmap::new(children.len(), false);
            info.local_pending = run_local;
            info.started = true;
        }
    }
    rpc_log!(
        debug, rpc;
        "collective over {} ranks, children {:?}",
        participants.len(),
        children
    );

    let ctx = rpc.ctx();
    let input = rpc.input();
    for (child_idx, &child) in children.iter().enumerate() {
        let child_rpc = Rpc::new(
            ctx,
            rpc.0.info.clone(),
            Some(Endpoint {
                group: group.name().into(),
                rank: child,
                tag: 0,
            }),
        );
        {
            let mut slot = child_rpc.0.slot.lock();
            slot.input = input.clone();
            slot.corpc_hdr = Some(hdr.clone());
        }
        child_rpc.prepare(Continuation::CorpcChild {
            parent: rpc.clone(),
            child_idx,
        })?;
        ctx.launch(&child_rpc);
    }

    if run_local && !is_finished(rpc) {
        match rpc.0.info.handler.clone() {
            Some(handler) => handler(rpc.clone()),
            None => on_local_reply(
                rpc,
                Err(CartwrightError::new(
                    ErrorKind::UnknownOpcode,
                    format!("no handler for opc {:#x}", rpc.opcode()),
                )),
            )?,
        }
    }
    check_done(rpc);
    Ok(())
}

fn is_finished(rpc: &Rpc) -> bool {
    rpc.0
        .slot
        .lock()
        .corpc
        .as_ref()
        .map_or(true, |info| info.finished)
}

fn aggregate(
    info: &OpcodeInfo,
    acc: &mut Option<Bytes>,
    source: Bytes,
) -> Result<(), CartwrightError> {
    match &info.co_ops {
        Some(ops) => ops.aggregate(acc, source),
        None => {
            // no aggregation: keep the first result
            if acc.is_none() {
                *acc = Some(source);
            }
            Ok(())
        }
    }
}

/// Continuation of a child request.
pub(crate) fn on_child_done(
    parent: &Rpc,
    child_idx: usize,
    child: &Rpc,
    status: Result<(), CartwrightError>,
) {
    let output = child.output();
    {
        let mut slot = parent.0.slot.lock();
        let info = match slot.corpc.as_mut() {
            Some(info) => info,
            None => return,
        };
        if info.finished {
            return;
        }
        match info.acked.set(child_idx, true) {
            Ok(false) => {}
            _ => {
                rpc_log!(
                    error, parent;
                    "unexpected answer from child {}",
                    child_idx
                );
                return;
            }
        }
        let folded = status
            .and_then(|()| aggregate(&parent.0.info, &mut info.result, output));
        if let Err(e) = folded {
            let rank = info.children.get(child_idx).copied();
            rpc_log!(debug, parent; "child rank {:?} failed: {}", rank, e);
            info.first_err.get_or_insert(e);
        }
    }
    check_done(parent);
}

/// Reply of the local handler.
pub(crate) fn on_local_reply(
    rpc: &Rpc,
    result: Result<Bytes, CartwrightError>,
) -> Result<(), CartwrightError> {
    {
        let mut slot = rpc.0.slot.lock();
        let info = slot.corpc.as_mut().ok_or_else(|| {
            CartwrightError::new(ErrorKind::InvalidArgument, "not collective")
        })?;
        if !info.local_pending {
            return Err(CartwrightError::new(
                ErrorKind::AlreadyFinished,
                format!("rpc {} local reply already given", rpc.id()),
            ));
        }
        info.local_pending = false;
        if !info.finished {
            let folded = result.and_then(|output| {
                aggregate(&rpc.0.info, &mut info.result, output)
            });
            if let Err(e) = folded {
                info.first_err.get_or_insert(e);
            }
        }
    }
    check_done(rpc);
    Ok(())
}

/// Finishes the call once every child and the local handler answered, or
/// at the first failure.
fn check_done(rpc: &Rpc) {
    let outcome = {
        let mut slot = rpc.0.slot.lock();
        let info = match slot.corpc.as_mut() {
            Some(info) => info,
            None => return,
        };
        if info.finished || !info.started {
            return;
        }
        if info.first_err.is_none()
            && (info.local_pending || !info.acked.all())
        {
            return;
        }
        info.finished = true;
        match info.first_err.take() {
            Some(e) => Err(e),
            None => Ok(info.result.take().unwrap_or_default()),
        }
    };

    if rpc.is_incoming() {
        let (status, output) = match outcome {
            Ok(output) => (None, output),
            Err(e) => (Some(e), Bytes::new()),
        };
        if let Err(e) = rpc.reply_wire(status, output) {
            rpc_log!(warn, rpc; "error replying to parent: {}", e);
        }
    } else {
        let status = outcome.map(|output| {
            rpc.0.slot.lock().output = output;
        });
        let _ = rpc.complete(status);
    }
}
