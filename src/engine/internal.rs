//! Built-in protocol every engine registers: URI lookup and ping.

use crate::engine::lookup::{UriLookupIn, UriLookupOut};
use crate::engine::opcode::{ProtoFormat, RpcFormat, PROTO_INTERNAL_BASE};
use crate::engine::Rpc;
use crate::utils::{CartwrightError, ErrorKind};

use bytes::Bytes;

/// The engine's own protocol. Sequence numbers match `OPC_URI_LOOKUP` and
/// `OPC_PING`.
pub(crate) fn internal_proto() -> ProtoFormat {
    ProtoFormat {
        name: "internal".into(),
        base: PROTO_INTERNAL_BASE,
        version: 0,
        rpcs: vec![
            RpcFormat::new("uri_lookup").handler(uri_lookup_handler),
            RpcFormat::new("ping").handler(ping_handler),
        ],
    }
}

/// Answers from what this process knows, in order: its own contexts, the
/// exact `(rank, tag)` cache entry, the rank's tag 0 (answered with tag 0
/// so that the asker retries there).
fn answer_lookup(rpc: &Rpc) -> Result<UriLookupOut, CartwrightError> {
    let input: UriLookupIn = rmp_serde::from_slice(&rpc.input())?;
    let engine = rpc.engine();
    let group = engine.group(&input.group)?;

    if group.self_rank() == Some(input.rank) {
        return engine
            .context_uri(input.tag)
            .map(|uri| UriLookupOut {
                uri,
                tag: input.tag,
            })
            .ok_or_else(|| {
                CartwrightError::new(
                    ErrorKind::UnknownRank,
                    format!("no context with tag {} here", input.tag),
                )
            });
    }
    if let Some(uri) = group.cache().get_uri(input.rank, input.tag) {
        return Ok(UriLookupOut {
            uri,
            tag: input.tag,
        });
    }
    if input.tag != 0 {
        if let Some(uri) = group.cache().get_uri(input.rank, 0) {
            return Ok(UriLookupOut { uri, tag: 0 });
        }
    }
    Err(CartwrightError::new(
        ErrorKind::UnknownRank,
        format!(
            "rank {} tag {} unknown in group '{}'",
            input.rank, input.tag, input.group
        ),
    ))
}

fn uri_lookup_handler(rpc: Rpc) {
    let result = answer_lookup(&rpc).and_then(|out| {
        rmp_serde::to_vec(&out).map_err(CartwrightError::from)
    });
    let sent = match result {
        Ok(buf) => rpc.reply(Bytes::from(buf)),
        Err(e) => {
            rpc_log!(debug, rpc; "lookup unanswerable: {}", e);
            rpc.reply_error(e)
        }
    };
    if let Err(e) = sent {
        rpc_log!(warn, rpc; "error replying to lookup: {}", e);
    }
}

fn ping_handler(rpc: Rpc) {
    if let Err(e) = rpc.reply(Bytes::new()) {
        rpc_log!(warn, rpc; "error replying to ping: {}", e);
    }
}
