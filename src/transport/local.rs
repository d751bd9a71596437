//! In-process transport: ports exchange messages through channels, routed
//! by `local://` URIs. Supports fault injection for tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::transport::{
    CompletionToken, EventSink, Port, ReplyTo, Transport, TransportAddr,
    TransportEvent, WireReply, WireRequest,
};
use crate::utils::{CartwrightError, ErrorKind};

use parking_lot::RwLock;

/// Route table entry of an open port.
struct LocalRoute {
    uri: String,
    sink: EventSink,
}

/// Injected faults.
#[derive(Debug, Default)]
struct Faults {
    /// Probability that a request is silently lost.
    drop_rate: f64,

    /// URIs whose requests fail in transport.
    unreachable: HashSet<String>,

    /// URIs whose requests are silently lost.
    blackholed: HashSet<String>,
}

struct FabricInner {
    name: String,
    next_port: AtomicU64,
    routes: RwLock<HashMap<u64, LocalRoute>>,
    by_uri: RwLock<HashMap<String, u64>>,
    faults: RwLock<Faults>,
}

/// In-process fabric shared by any number of engines.
#[derive(Clone)]
pub struct LocalFabric {
    inner: Arc<FabricInner>,
}

impl LocalFabric {
    /// Creates a new empty fabric. Its ports get URIs
    /// `local://<name>/<n>`.
    pub fn new(name: impl ToString) -> Self {
        LocalFabric {
            inner: Arc::new(FabricInner {
                name: name.to_string(),
                next_port: AtomicU64::new(0),
                routes: RwLock::new(HashMap::new()),
                by_uri: RwLock::new(HashMap::new()),
                faults: RwLock::new(Faults::default()),
            }),
        }
    }

    /// Sets the probability of silently losing each request.
    pub fn set_drop_rate(&self, rate: f64) {
        self.inner.faults.write().drop_rate = rate.clamp(0.0, 1.0);
    }

    /// Makes requests to `uri` fail (or succeed again) in transport.
    pub fn set_unreachable(&self, uri: &str, flag: bool) {
        let mut faults = self.inner.faults.write();
        if flag {
            faults.unreachable.insert(uri.into());
        } else {
            faults.unreachable.remove(uri);
        }
    }

    /// Makes requests to `uri` vanish without any event (or not).
    pub fn set_blackholed(&self, uri: &str, flag: bool) {
        let mut faults = self.inner.faults.write();
        if flag {
            faults.blackholed.insert(uri.into());
        } else {
            faults.blackholed.remove(uri);
        }
    }

    /// Number of currently open ports.
    pub fn num_ports(&self) -> usize {
        self.inner.routes.read().len()
    }
}

impl Transport for LocalFabric {
    fn listen(
        &self,
        sink: EventSink,
    ) -> Result<Box<dyn Port>, CartwrightError> {
        let id = self.inner.next_port.fetch_add(1, Ordering::Relaxed);
        let uri = format!("local://{}/{}", self.inner.name, id);
        self.inner.routes.write().insert(
            id,
            LocalRoute {
                uri: uri.clone(),
                sink: sink.clone(),
            },
        );
        self.inner.by_uri.write().insert(uri.clone(), id);
        pf_debug!("local port {} opened", uri);
        Ok(Box::new(LocalPort {
            fabric: self.inner.clone(),
            id,
            uri,
            sink,
        }))
    }
}

/// Port on a `LocalFabric`.
struct LocalPort {
    fabric: Arc<FabricInner>,
    id: u64,
    uri: String,
    sink: EventSink,
}

impl LocalPort {
    fn notify_self(&self, event: TransportEvent) {
        // own receiver is gone only when the context is being torn down
        let _ = self.sink.send(event);
    }

    /// Pushes a request into the destination port's sink. Returns the
    /// transport error to report back, if any.
    fn deliver(
        &self,
        addr: TransportAddr,
        token: CompletionToken,
        req: WireRequest,
    ) -> Option<CartwrightError> {
        let routes = self.fabric.routes.read();
        let route = match routes.get(&addr.0) {
            Some(route) => route,
            None => {
                return Some(CartwrightError::new(
                    ErrorKind::Transport,
                    format!("local port {} closed", addr.0),
                ));
            }
        };

        let faults = self.fabric.faults.read();
        if faults.unreachable.contains(&route.uri) {
            return Some(CartwrightError::new(
                ErrorKind::Transport,
                format!("'{}' unreachable", route.uri),
            ));
        }
        if faults.blackholed.contains(&route.uri)
            || (faults.drop_rate > 0.0
                && rand::random::<f64>() < faults.drop_rate)
        {
            pf_trace!("dropped request {} to '{}'", token, route.uri);
            return None;
        }

        let event = TransportEvent::Request {
            reply_to: ReplyTo {
                route: self.id,
                token,
            },
            req,
        };
        if route.sink.send(event).is_err() {
            return Some(CartwrightError::new(
                ErrorKind::Transport,
                format!("'{}' stopped receiving", route.uri),
            ));
        }
        None
    }
}

impl Port for LocalPort {
    fn uri(&self) -> &str {
        &self.uri
    }

    fn resolve(&self, uri: &str) -> Result<TransportAddr, CartwrightError> {
        match self.fabric.by_uri.read().get(uri) {
            Some(&id) => Ok(TransportAddr(id)),
            None => Err(CartwrightError::new(
                ErrorKind::Unreachable,
                format!("no local port at '{}'", uri),
            )),
        }
    }

    fn send(
        &self,
        addr: TransportAddr,
        token: CompletionToken,
        req: WireRequest,
    ) -> Result<(), CartwrightError> {
        if let Some(err) = self.deliver(addr, token, req) {
            self.notify_self(TransportEvent::Failed { token, err });
        }
        Ok(())
    }

    fn reply(
        &self,
        reply_to: &ReplyTo,
        rep: WireReply,
    ) -> Result<(), CartwrightError> {
        let routes = self.fabric.routes.read();
        let route = routes.get(&reply_to.route).ok_or_else(|| {
            CartwrightError::new(
                ErrorKind::Transport,
                format!("reply route {} closed", reply_to.route),
            )
        })?;
        route
            .sink
            .send(TransportEvent::Reply {
                token: reply_to.token,
                rep,
            })
            .map_err(|_| {
                CartwrightError::new(
                    ErrorKind::Transport,
                    format!("'{}' stopped receiving", route.uri),
                )
            })
    }

    fn cancel(&self, token: CompletionToken) -> Result<(), CartwrightError> {
        self.notify_self(TransportEvent::Canceled { token });
        Ok(())
    }
}

impl Drop for LocalPort {
    fn drop(&mut self) {
        self.fabric.routes.write().remove(&self.id);
        self.fabric.by_uri.write().remove(&self.uri);
        pf_debug!("local port {} closed", self.uri);
    }
}

#[cfg(test)]
mod local_tests {
    use super::*;
    use crate::transport::RpcHeader;
    use bytes::Bytes;
    use tokio::sync::mpsc;

    fn test_request(payload: &'static [u8]) -> WireRequest {
        WireRequest {
            hdr: RpcHeader {
                opc: 0x0101_0000,
                group: "g".into(),
                src_rank: Some(0),
                src_tag: 0,
                dst_rank: 1,
                dst_tag: 0,
                hlc: 0,
                rpc_id: 1,
                corpc: None,
            },
            payload: Bytes::from_static(payload),
        }
    }

    #[test]
    fn request_reply_roundtrip() -> Result<(), CartwrightError> {
        let fabric = LocalFabric::new("rr");
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        let a = fabric.listen(tx_a)?;
        let b = fabric.listen(tx_b)?;
        assert_eq!(fabric.num_ports(), 2);

        let addr = a.resolve(b.uri())?;
        a.send(addr, 77, test_request(b"ping"))?;
        let reply_to = match rx_b.try_recv()? {
            TransportEvent::Request { reply_to, req } => {
                assert_eq!(req.payload, Bytes::from_static(b"ping"));
                reply_to
            }
            ev => panic!("unexpected event {:?}", ev),
        };
        assert_eq!(reply_to.token, 77);

        b.reply(
            &reply_to,
            WireReply {
                hlc: 1,
                status: None,
                payload: Bytes::from_static(b"pong"),
            },
        )?;
        match rx_a.try_recv()? {
            TransportEvent::Reply { token, rep } => {
                assert_eq!(token, 77);
                assert_eq!(rep.payload, Bytes::from_static(b"pong"));
            }
            ev => panic!("unexpected event {:?}", ev),
        }
        Ok(())
    }

    #[test]
    fn faults_and_cancel() -> Result<(), CartwrightError> {
        let fabric = LocalFabric::new("faults");
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        let a = fabric.listen(tx_a)?;
        let b = fabric.listen(tx_b)?;
        let addr = a.resolve(b.uri())?;

        fabric.set_unreachable(b.uri(), true);
        a.send(addr, 1, test_request(b"x"))?;
        assert!(matches!(
            rx_a.try_recv()?,
            TransportEvent::Failed { token: 1, .. }
        ));
        fabric.set_unreachable(b.uri(), false);

        fabric.set_blackholed(b.uri(), true);
        a.send(addr, 2, test_request(b"y"))?;
        assert!(rx_b.try_recv().is_err());
        a.cancel(2)?;
        assert!(matches!(
            rx_a.try_recv()?,
            TransportEvent::Canceled { token: 2 }
        ));

        assert!(a.resolve("local://faults/99").is_err());
        drop(b);
        assert_eq!(fabric.num_ports(), 1);
        a.send(addr, 3, test_request(b"z"))?;
        assert!(matches!(
            rx_a.try_recv()?,
            TransportEvent::Failed { token: 3, .. }
        ));
        Ok(())
    }
}
