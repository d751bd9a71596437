//! Chained URI lookup.
//!
//! A request whose target `(rank, tag)` has no cached URI issues an
//! internal URI_LOOKUP request on its behalf, asking either the target
//! rank's tag 0 or the group's primary service rank. The answer may name
//! a different tag than asked for (the responder only knew the rank's
//! tag 0); the lookup is then repeated against that rank's tag 0, which
//! always knows its own process's contexts.

use std::sync::Arc;

use crate::engine::opcode::OPC_URI_LOOKUP;
use crate::engine::request::{Continuation, Rpc, RpcState};
use crate::engine::{Endpoint, Group, Rank, Tag};
use crate::utils::{CartwrightError, ErrorKind};

use bytes::Bytes;

use serde::{Deserialize, Serialize};

/// URI_LOOKUP request payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct UriLookupIn {
    pub(crate) group: String,
    pub(crate) rank: Rank,
    pub(crate) tag: Tag,
}

/// URI_LOOKUP reply payload. `tag` may differ from the tag asked for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct UriLookupOut {
    pub(crate) uri: String,
    pub(crate) tag: Tag,
}

/// Starts resolving the URI of `parent`'s target. The parent is in
/// `ResolvingUri` and resumes once the URI is cached.
pub(crate) fn start(
    parent: &Rpc,
    group: &Arc<Group>,
) -> Result<(), CartwrightError> {
    let ep = parent.endpoint().ok_or_else(|| {
        CartwrightError::new(ErrorKind::NoEndpoint, "endpoint not set")
    })?;
    let target = (ep.rank, ep.tag);

    if group.self_rank() == Some(ep.rank) {
        // own contexts are known without asking anyone
        let uri = parent.engine().context_uri(ep.tag).ok_or_else(|| {
            CartwrightError::new(
                ErrorKind::UnknownRank,
                format!("no local context with tag {}", ep.tag),
            )
        })?;
        group.insert_uri(ep.rank, ep.tag, &uri)?;
        return parent.send_internal();
    }

    let contact = if ep.tag != 0 && group.cache().get_uri(ep.rank, 0).is_some()
    {
        (ep.rank, 0)
    } else if group.is_service() {
        return Err(CartwrightError::new(
            ErrorKind::UnknownRank,
            format!(
                "rank {} tag 0 unknown in group '{}'",
                ep.rank,
                group.name()
            ),
        ));
    } else {
        match group.psr() {
            Some(psr) => (psr, 0),
            None => {
                return Err(CartwrightError::new(
                    ErrorKind::LookupFailed,
                    format!("group '{}' has no primary rank", group.name()),
                ));
            }
        }
    };
    // the contact itself must be reachable without another lookup
    if group.cache().get_uri(contact.0, contact.1).is_none() {
        return Err(CartwrightError::new(
            ErrorKind::LookupFailed,
            format!(
                "contact rank {} tag {} of group '{}' has no known uri",
                contact.0,
                contact.1,
                group.name()
            ),
        ));
    }
    issue(parent, group, target, contact)
}

/// Sends a URI_LOOKUP for `target` to `contact`.
fn issue(
    parent: &Rpc,
    group: &Group,
    target: (Rank, Tag),
    contact: (Rank, Tag),
) -> Result<(), CartwrightError> {
    let ctx = parent.ctx();
    let info = parent.engine().opcodes.lookup(OPC_URI_LOOKUP)?;
    let lookup = Rpc::new(
        ctx,
        info,
        Some(Endpoint {
            group: group.name().into(),
            rank: contact.0,
            tag: contact.1,
        }),
    );
    let input = rmp_serde::to_vec(&UriLookupIn {
        group: group.name().into(),
        rank: target.0,
        tag: target.1,
    })?;
    lookup.set_input(Bytes::from(input))?;

    {
        let mut slot = parent.0.slot.lock();
        if slot.state != RpcState::ResolvingUri {
            return Err(CartwrightError::new(
                ErrorKind::AlreadyFinished,
                format!("rpc {} no longer resolving", parent.id()),
            ));
        }
        slot.lookup = Some(lookup.clone());
    }
    lookup.prepare(Continuation::UriLookup {
        parent: parent.clone(),
        target,
        contact,
    })?;

    rpc_log!(
        debug, parent;
        "looking up rank {} tag {} via rank {} tag {} (rpc {})",
        target.0,
        target.1,
        contact.0,
        contact.1,
        lookup.id()
    );
    ctx.launch(&lookup);
    Ok(())
}

/// Continuation of a finished URI_LOOKUP.
pub(crate) fn on_lookup_done(
    lookup: &Rpc,
    parent: Rpc,
    target: (Rank, Tag),
    contact: (Rank, Tag),
    status: Result<(), CartwrightError>,
) {
    {
        let mut slot = parent.0.slot.lock();
        if slot
            .lookup
            .as_ref()
            .is_some_and(|pending| pending.id() == lookup.id())
        {
            slot.lookup = None;
        }
        if slot.state != RpcState::ResolvingUri {
            // aborted or timed out meanwhile
            return;
        }
    }

    let result = match status {
        Ok(()) => apply_answer(lookup, &parent, target, contact),
        Err(e) => retry_or_fail(&parent, target, contact, e),
    };
    if let Err(e) = result {
        if !e.is(ErrorKind::AlreadyFinished) {
            let _ = parent.complete(Err(e));
        }
    }
}

fn apply_answer(
    lookup: &Rpc,
    parent: &Rpc,
    target: (Rank, Tag),
    contact: (Rank, Tag),
) -> Result<(), CartwrightError> {
    let out: UriLookupOut =
        rmp_serde::from_slice(&lookup.output()).map_err(|e| {
            CartwrightError::new(
                ErrorKind::LookupFailed,
                format!("malformed lookup reply: {}", e),
            )
        })?;
    let group = lookup_group(parent)?;
    group.insert_uri(target.0, out.tag, &out.uri)?;

    if out.tag == target.1 {
        rpc_log!(
            debug, parent;
            "rank {} tag {} is at '{}'",
            target.0,
            target.1,
            out.uri
        );
        return parent.send_internal();
    }

    // only the rank's tag 0 was known; ask that context next
    if contact == (target.0, 0) {
        return Err(CartwrightError::new(
            ErrorKind::LookupFailed,
            format!(
                "rank {} answered tag {} for tag {}",
                target.0, out.tag, target.1
            ),
        ));
    }
    issue(parent, &group, target, (target.0, 0))
}

fn retry_or_fail(
    parent: &Rpc,
    target: (Rank, Tag),
    contact: (Rank, Tag),
    err: CartwrightError,
) -> Result<(), CartwrightError> {
    if err.is(ErrorKind::UnknownRank) || err.is(ErrorKind::Canceled) {
        return Err(err);
    }

    let retry = {
        let mut slot = parent.0.slot.lock();
        if slot.lookup_retries < parent.engine().config.uri_lookup_retries {
            slot.lookup_retries += 1;
            true
        } else {
            false
        }
    };
    if retry {
        rpc_log!(debug, parent; "retrying lookup after: {}", err);
        let group = lookup_group(parent)?;
        return issue(parent, &group, target, contact);
    }

    Err(CartwrightError::new(
        ErrorKind::LookupFailed,
        format!(
            "lookup of rank {} tag {} via rank {} tag {} failed: {}",
            target.0, target.1, contact.0, contact.1, err
        ),
    ))
}

fn lookup_group(parent: &Rpc) -> Result<Arc<Group>, CartwrightError> {
    let ep = parent.endpoint().ok_or_else(|| {
        CartwrightError::new(ErrorKind::NoEndpoint, "endpoint not set")
    })?;
    parent.engine().group(&ep.group)
}
