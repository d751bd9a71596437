//! Request lifecycle state machine.
//!
//! `send_internal()` is the single dispatch point: it is entered on first
//! submission and re-entered whenever a resolution step finishes, and
//! decides what to do next from the request's current state and the
//! address cache.

use std::sync::Arc;

use crate::engine::corpc;
use crate::engine::lookup;
use crate::engine::opcode::OPC_URI_LOOKUP;
use crate::engine::request::{CbInfo, Continuation, Rpc, RpcState};
use crate::engine::Group;
use crate::transport::{RpcHeader, TransportAddr, WireReply, WireRequest};
use crate::utils::{CartwrightError, ErrorKind};

use bytes::Bytes;

/// What `abort()` has to do once the request's lock is released.
enum AbortAction {
    CancelOnWire,
    AbortLookup(Option<Rpc>),
    CompleteNow,
}

// Rpc client-side lifecycle
impl Rpc {
    /// Submits the request. `cb` is invoked exactly once with the outcome,
    /// possibly before this returns. Only binding errors (no endpoint,
    /// request already submitted or finished) are returned directly, in
    /// which case `cb` is dropped without being called.
    pub fn send(
        &self,
        cb: impl FnOnce(CbInfo) + Send + 'static,
    ) -> Result<(), CartwrightError> {
        self.prepare(Continuation::User(Box::new(cb)))?;
        self.ctx().launch(self);
        Ok(())
    }

    /// Validates a submission and stores its continuation.
    pub(crate) fn prepare(
        &self,
        cont: Continuation,
    ) -> Result<(), CartwrightError> {
        if self.is_incoming() {
            return logged_err!(
                InvalidArgument;
                "rpc {} is a received request, cannot send",
                self.id()
            );
        }
        let mut slot = self.0.slot.lock();
        if slot.state.is_terminal() {
            return Err(CartwrightError::new(
                ErrorKind::AlreadyFinished,
                format!("rpc {} already finished", self.id()),
            ));
        }
        if slot.state != RpcState::Initial || slot.continuation.is_some() {
            return logged_err!(
                InvalidArgument;
                "rpc {} already submitted",
                self.id()
            );
        }
        if slot.corpc.is_none() && slot.endpoint.is_none() {
            return Err(CartwrightError::new(
                ErrorKind::NoEndpoint,
                format!("rpc {} has no endpoint", self.id()),
            ));
        }
        slot.continuation = Some(cont);
        Ok(())
    }

    /// Runs the state machine from wherever it stands; failures complete
    /// the request.
    pub(crate) fn resume(&self) {
        let result = if self.is_corpc() {
            corpc::dispatch(self)
        } else {
            self.send_internal()
        };
        if let Err(e) = result {
            if e.is(ErrorKind::AlreadyFinished) {
                // finished concurrently (aborted or timed out)
                return;
            }
            rpc_log!(debug, self; "dispatch failed: {}", e);
            let _ = self.complete(Err(e));
        }
    }

    /// Dispatches by current state and cache warmth.
    pub(crate) fn send_internal(&self) -> Result<(), CartwrightError> {
        let (state, endpoint) = {
            let slot = self.0.slot.lock();
            (slot.state, slot.endpoint.clone())
        };
        let endpoint = endpoint.ok_or_else(|| {
            CartwrightError::new(ErrorKind::NoEndpoint, "endpoint not set")
        })?;
        let group = self.engine().group(&endpoint.group)?;
        let ctx_tag = self.context_tag();

        match state {
            RpcState::Initial | RpcState::Queued => {
                if let Some(addr) =
                    group
                        .cache()
                        .get_addr(ctx_tag, endpoint.rank, endpoint.tag)
                {
                    return self.wire_send(addr, &group);
                }
                if let Some(uri) =
                    group.cache().get_uri(endpoint.rank, endpoint.tag)
                {
                    self.advance(RpcState::ResolvingAddress)?;
                    return self.resolve_and_send(&group, &uri);
                }
                if self.opcode() == OPC_URI_LOOKUP {
                    // lookups never chain lookups of their own
                    return Err(CartwrightError::new(
                        ErrorKind::LookupFailed,
                        format!(
                            "no uri for lookup contact rank {} tag {}",
                            endpoint.rank, endpoint.tag
                        ),
                    ));
                }
                self.advance(RpcState::ResolvingUri)?;
                lookup::start(self, &group)
            }

            RpcState::ResolvingUri | RpcState::ResolvingAddress => {
                let uri = group
                    .cache()
                    .get_uri(endpoint.rank, endpoint.tag)
                    .ok_or_else(|| {
                        CartwrightError::new(
                            ErrorKind::LookupFailed,
                            format!(
                                "uri of rank {} tag {} missing after lookup",
                                endpoint.rank, endpoint.tag
                            ),
                        )
                    })?;
                if state == RpcState::ResolvingUri {
                    self.advance(RpcState::ResolvingAddress)?;
                }
                self.resolve_and_send(&group, &uri)
            }

            RpcState::Completed | RpcState::Canceled => {
                Err(CartwrightError::new(
                    ErrorKind::AlreadyFinished,
                    format!("rpc {} already finished", self.id()),
                ))
            }

            RpcState::Sent => logged_err!(
                InvalidArgument;
                "rpc {} dispatched twice",
                self.id()
            ),
        }
    }

    /// Moves forward to `to` unless finished meanwhile.
    pub(crate) fn advance(&self, to: RpcState) -> Result<(), CartwrightError> {
        let mut slot = self.0.slot.lock();
        if slot.state.is_terminal() {
            return Err(CartwrightError::new(
                ErrorKind::AlreadyFinished,
                format!("rpc {} already finished", self.id()),
            ));
        }
        if slot.state != to {
            slot.set_state(to);
        }
        Ok(())
    }

    fn resolve_and_send(
        &self,
        group: &Arc<Group>,
        uri: &str,
    ) -> Result<(), CartwrightError> {
        let endpoint = self.endpoint().ok_or_else(|| {
            CartwrightError::new(ErrorKind::NoEndpoint, "endpoint not set")
        })?;
        let addr = self.ctx().port.resolve(uri).map_err(|e| {
            CartwrightError::new(
                ErrorKind::Unreachable,
                format!("resolving '{}' failed: {}", uri, e),
            )
        })?;
        group.cache().insert_addr(
            self.context_tag(),
            endpoint.rank,
            endpoint.tag,
            addr,
        );
        self.wire_send(addr, group)
    }

    fn wire_send(
        &self,
        addr: TransportAddr,
        group: &Arc<Group>,
    ) -> Result<(), CartwrightError> {
        let ctx = self.ctx();
        let req = {
            let mut slot = self.0.slot.lock();
            if slot.state.is_terminal() {
                return Err(CartwrightError::new(
                    ErrorKind::AlreadyFinished,
                    format!("rpc {} already finished", self.id()),
                ));
            }
            let endpoint = slot.endpoint.clone().ok_or_else(|| {
                CartwrightError::new(ErrorKind::NoEndpoint, "endpoint not set")
            })?;
            slot.set_state(RpcState::Sent);
            slot.on_wire = true;
            WireRequest {
                hdr: RpcHeader {
                    opc: self.opcode(),
                    group: endpoint.group,
                    src_rank: group.self_rank(),
                    src_tag: ctx.tag,
                    dst_rank: endpoint.rank,
                    dst_tag: endpoint.tag,
                    hlc: self.engine().hlc.now(),
                    rpc_id: self.id(),
                    corpc: slot.corpc_hdr.clone(),
                },
                payload: slot.input.clone(),
            }
        };
        let (dst_rank, dst_tag) = (req.hdr.dst_rank, req.hdr.dst_tag);

        ctx.wire_insert(self);
        if let Err(e) = ctx.port.send(addr, self.id(), req) {
            ctx.wire_remove(self.id());
            self.0.slot.lock().on_wire = false;
            return Err(CartwrightError::new(
                ErrorKind::Transport,
                format!("send failed: {}", e),
            ));
        }
        rpc_log!(trace, self; "sent to rank {} tag {}", dst_rank, dst_tag);

        if self.0.info.no_reply && ctx.wire_remove(self.id()).is_some() {
            // one-way requests finish once handed off
            self.0.slot.lock().on_wire = false;
            let _ = self.complete(Ok(()));
        }
        Ok(())
    }

    /// Finishes the request with `status` and runs its continuation.
    /// Completing an already finished request is a bug: it is logged and
    /// rejected with `AlreadyFinished`, and the continuation is not run
    /// again.
    pub(crate) fn complete(
        &self,
        status: Result<(), CartwrightError>,
    ) -> Result<(), CartwrightError> {
        let cont = {
            let mut slot = self.0.slot.lock();
            if slot.state.is_terminal() {
                drop(slot);
                rpc_log!(
                    error, self;
                    "completed twice, dropping status {:?}",
                    status
                );
                return Err(CartwrightError::new(
                    ErrorKind::AlreadyFinished,
                    format!("rpc {} already finished", self.id()),
                ));
            }
            let canceled =
                matches!(&status, Err(e) if e.is(ErrorKind::Canceled));
            slot.set_state(if canceled {
                RpcState::Canceled
            } else {
                RpcState::Completed
            });
            slot.on_wire = false;
            slot.deadline = None;
            slot.continuation.take()
        };
        match &status {
            Ok(()) => rpc_log!(trace, self; "completed"),
            Err(e) => rpc_log!(debug, self; "completed with {}", e),
        }

        // release flow control slots first so that waiters get going
        for next in self.ctx().untrack(self) {
            next.resume();
        }

        match cont {
            Some(Continuation::User(cb)) => cb(CbInfo {
                rpc: self.clone(),
                status,
            }),
            Some(Continuation::UriLookup {
                parent,
                target,
                contact,
            }) => lookup::on_lookup_done(self, parent, target, contact, status),
            Some(Continuation::CorpcChild { parent, child_idx }) => {
                corpc::on_child_done(&parent, child_idx, self, status)
            }
            None => {}
        }
        Ok(())
    }

    /// Cancels the request. Returns `AlreadyFinished` if it already reached
    /// a terminal state.
    pub fn abort(&self) -> Result<(), CartwrightError> {
        if self.is_incoming() {
            return logged_err!(
                InvalidArgument;
                "rpc {} is a received request, cannot abort",
                self.id()
            );
        }
        let action = {
            let mut slot = self.0.slot.lock();
            match slot.state {
                RpcState::Completed | RpcState::Canceled => {
                    return Err(CartwrightError::new(
                        ErrorKind::AlreadyFinished,
                        format!("rpc {} already finished", self.id()),
                    ));
                }
                RpcState::Sent if slot.on_wire => AbortAction::CancelOnWire,
                RpcState::ResolvingUri => {
                    AbortAction::AbortLookup(slot.lookup.take())
                }
                _ => {
                    // late child answers of a collective call are ignored
                    if let Some(info) = slot.corpc.as_mut() {
                        info.finished = true;
                    }
                    AbortAction::CompleteNow
                }
            }
        };
        rpc_log!(debug, self; "aborting");

        let canceled = || {
            CartwrightError::new(
                ErrorKind::Canceled,
                format!("rpc {} aborted", self.id()),
            )
        };
        match action {
            AbortAction::CancelOnWire => {
                if let Err(e) = self.ctx().port.cancel(self.id()) {
                    rpc_log!(warn, self; "transport cancel failed: {}", e);
                    if self.ctx().wire_remove(self.id()).is_some() {
                        self.complete(Err(canceled()))?;
                    }
                }
                Ok(())
            }
            AbortAction::AbortLookup(lookup) => {
                self.complete(Err(canceled()))?;
                if let Some(lookup) = lookup {
                    let _ = lookup.abort();
                }
                Ok(())
            }
            AbortAction::CompleteNow => {
                self.ctx().wire_remove(self.id());
                self.complete(Err(canceled()))
            }
        }
    }
}

// Rpc server-side replies
impl Rpc {
    /// Sends the reply of a received request. For a collective call this
    /// hands the local result to aggregation instead.
    pub fn reply(&self, output: Bytes) -> Result<(), CartwrightError> {
        if self.is_corpc() {
            return corpc::on_local_reply(self, Ok(output));
        }
        self.reply_wire(None, output)
    }

    /// Answers a received request with an error status.
    pub fn reply_error(
        &self,
        err: CartwrightError,
    ) -> Result<(), CartwrightError> {
        if self.is_corpc() {
            return corpc::on_local_reply(self, Err(err));
        }
        self.reply_wire(Some(err), Bytes::new())
    }

    /// Puts the reply on the wire.
    pub(crate) fn reply_wire(
        &self,
        status: Option<CartwrightError>,
        output: Bytes,
    ) -> Result<(), CartwrightError> {
        if !self.is_incoming() {
            return logged_err!(
                InvalidArgument;
                "rpc {} was not received, cannot reply",
                self.id()
            );
        }
        let reply_to = {
            let mut slot = self.0.slot.lock();
            if !slot.reply_pending {
                return if self.0.info.no_reply {
                    logged_err!(
                        InvalidArgument;
                        "rpc {} is one-way, cannot reply",
                        self.id()
                    )
                } else {
                    Err(CartwrightError::new(
                        ErrorKind::AlreadyFinished,
                        format!("rpc {} already replied", self.id()),
                    ))
                };
            }
            slot.reply_pending = false;
            slot.output = output.clone();
            slot.reply_to.clone()
        };
        let reply_to = reply_to.ok_or_else(|| {
            CartwrightError::new(ErrorKind::InvalidArgument, "no reply route")
        })?;

        rpc_log!(trace, self; "replying, status {:?}", status);
        self.ctx().port.reply(
            &reply_to,
            WireReply {
                hlc: self.engine().hlc.now(),
                status,
                payload: output,
            },
        )
    }
}
