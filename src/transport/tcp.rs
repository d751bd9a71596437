//! TCP transport. Each port listens on its own socket; outgoing requests
//! reuse one connection per peer address, and replies travel back over the
//! connection the request came in on. Frames are MessagePack-encoded and
//! length-prefixed.

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU16, AtomicU64, Ordering};
use std::sync::Arc;

use crate::transport::{
    CompletionToken, EventSink, Port, ReplyTo, Transport, TransportAddr,
    TransportEvent, WireReply, WireRequest,
};
use crate::utils::{CartwrightError, ErrorKind};

use parking_lot::{Mutex, RwLock};

use serde::{Deserialize, Serialize};

use rmp_serde::decode::from_slice as decode_from_slice;
use rmp_serde::encode::to_vec as encode_to_vec;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// URI scheme prefix of this transport.
const TCP_SCHEME: &str = "tcp://";

/// Default upper limit of an encoded frame's length.
pub const DEFAULT_MAX_FRAME_LEN: u64 = 64 * 1024 * 1024;

/// Unit of data on a connection.
#[derive(Debug, Serialize, Deserialize)]
enum TcpFrame {
    Request {
        token: CompletionToken,
        req: WireRequest,
    },
    Reply {
        token: CompletionToken,
        rep: WireReply,
    },
}

/// TCP transport factory. Ports bind `ip:port`, `ip:port+1`, ... in
/// opening order, or ephemeral ports if the base port is 0.
pub struct TcpTransport {
    /// IP address to bind on.
    bind_ip: IpAddr,

    /// Port of the first opened port.
    base_port: u16,

    /// Number of ports opened so far.
    opened: AtomicU16,

    /// Frames announcing a longer length are refused.
    max_frame_len: u64,
}

impl TcpTransport {
    /// Creates a TCP transport binding around given address.
    pub fn new(bind_addr: SocketAddr) -> Self {
        TcpTransport {
            bind_ip: bind_addr.ip(),
            base_port: bind_addr.port(),
            opened: AtomicU16::new(0),
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }

    /// Sets the maximum accepted frame length.
    pub fn with_max_frame_len(mut self, max_frame_len: u64) -> Self {
        self.max_frame_len = max_frame_len;
        self
    }
}

impl Transport for TcpTransport {
    fn listen(
        &self,
        sink: EventSink,
    ) -> Result<Box<dyn Port>, CartwrightError> {
        let runtime = Handle::try_current().map_err(|e| {
            CartwrightError::new(
                ErrorKind::Transport,
                format!("tcp transport needs a tokio runtime: {}", e),
            )
        })?;

        let offset = self.opened.fetch_add(1, Ordering::Relaxed);
        let port = if self.base_port == 0 {
            0
        } else {
            self.base_port.wrapping_add(offset)
        };
        let std_listener =
            std::net::TcpListener::bind(SocketAddr::new(self.bind_ip, port))?;
        std_listener.set_nonblocking(true)?;
        let _guard = runtime.enter();
        let listener = TcpListener::from_std(std_listener)?;
        let uri = format!("{}{}", TCP_SCHEME, listener.local_addr()?);

        let shared = Arc::new(TcpShared {
            uri: uri.clone(),
            sink,
            next_conn: AtomicU64::new(0),
            table: Mutex::new(ConnTable::default()),
            addrs: RwLock::new(Vec::new()),
            max_frame_len: self.max_frame_len,
        });
        let acceptor = runtime.spawn(TcpShared::acceptor_thread(
            shared.clone(),
            listener,
        ));

        pf_debug!("tcp port {} listening", uri);
        Ok(Box::new(TcpPort {
            uri,
            runtime,
            shared,
            acceptor,
        }))
    }
}

/// Handle to a live connection.
struct ConnHandle {
    /// Sender side of the connection's outgoing frame channel.
    tx_send: mpsc::UnboundedSender<TcpFrame>,

    /// Tokens of requests sent on this connection and not answered yet.
    pending: Arc<Mutex<HashSet<CompletionToken>>>,

    /// Messenger task of the connection.
    handle: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct ConnTable {
    /// Map from connection ID -> connection.
    conns: HashMap<u64, ConnHandle>,

    /// Map from peer address -> outgoing connection ID.
    peers: HashMap<SocketAddr, u64>,
}

/// State shared by a port and its spawned tasks.
struct TcpShared {
    uri: String,
    sink: EventSink,
    next_conn: AtomicU64,
    table: Mutex<ConnTable>,

    /// Resolved peer addresses, indexed by `TransportAddr`.
    addrs: RwLock<Vec<SocketAddr>>,

    max_frame_len: u64,
}

// TcpShared connection bookkeeping
impl TcpShared {
    /// Unregisters a connection, then reports every request still pending on
    /// it as failed.
    fn retire_conn(
        &self,
        conn_id: u64,
        peer: Option<SocketAddr>,
        pending: &Mutex<HashSet<CompletionToken>>,
        reason: &str,
    ) {
        {
            let mut table = self.table.lock();
            table.conns.remove(&conn_id);
            if let Some(peer) = peer {
                if table.peers.get(&peer) == Some(&conn_id) {
                    table.peers.remove(&peer);
                }
            }
        }

        let tokens: Vec<CompletionToken> = pending.lock().drain().collect();
        for token in tokens {
            let _ = self.sink.send(TransportEvent::Failed {
                token,
                err: CartwrightError::new(
                    ErrorKind::Transport,
                    format!("connection {} lost: {}", conn_id, reason),
                ),
            });
        }
    }
}

// TcpShared acceptor/messenger thread implementation
impl TcpShared {
    /// Writes a frame through given connection write half.
    async fn write_frame(
        frame: &TcpFrame,
        conn_write: &mut OwnedWriteHalf,
    ) -> Result<(), CartwrightError> {
        let frame_bytes = encode_to_vec(frame)?;
        conn_write.write_u64(frame_bytes.len() as u64).await?; // length first
        conn_write.write_all(&frame_bytes[..]).await?;
        Ok(())
    }

    /// Reads a frame from given connection read half. A length above
    /// `max_len` is an error and nothing is allocated for it.
    async fn read_frame(
        conn_read: &mut OwnedReadHalf,
        max_len: u64,
    ) -> Result<TcpFrame, CartwrightError> {
        let frame_len = conn_read.read_u64().await?; // length first
        if frame_len > max_len {
            return Err(CartwrightError::new(
                ErrorKind::Transport,
                format!("frame length {} exceeds limit {}", frame_len, max_len),
            ));
        }
        let mut frame_buf: Vec<u8> = vec![0; frame_len as usize];
        conn_read.read_exact(&mut frame_buf[..]).await?;
        let frame = decode_from_slice(&frame_buf)?;
        Ok(frame)
    }

    /// Acceptor thread function.
    async fn acceptor_thread(shared: Arc<TcpShared>, listener: TcpListener) {
        pf_debug!("acceptor thread for {} spawned", shared.uri);

        loop {
            let (stream, addr) = match listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    pf_error!("error accepting on {}: {}", shared.uri, e);
                    continue;
                }
            };
            let _ = stream.set_nodelay(true);

            let conn_id = shared.next_conn.fetch_add(1, Ordering::Relaxed);
            let (tx_send, rx_send) = mpsc::unbounded_channel();
            let pending = Arc::new(Mutex::new(HashSet::new()));

            // table stays locked across spawn: messenger may retire at once
            let mut table = shared.table.lock();
            let handle = tokio::spawn(Self::conn_messenger_thread(
                shared.clone(),
                conn_id,
                None,
                stream,
                rx_send,
                pending.clone(),
            ));
            table.conns.insert(
                conn_id,
                ConnHandle {
                    tx_send,
                    pending,
                    handle: Some(handle),
                },
            );
            pf_debug!("accepted connection {} from {}", conn_id, addr);
        }
    }

    /// Connector thread function: connects to a peer, then becomes the
    /// connection's messenger.
    async fn connector_thread(
        shared: Arc<TcpShared>,
        conn_id: u64,
        peer: SocketAddr,
        rx_send: mpsc::UnboundedReceiver<TcpFrame>,
        pending: Arc<Mutex<HashSet<CompletionToken>>>,
    ) {
        match TcpStream::connect(peer).await {
            Ok(stream) => {
                let _ = stream.set_nodelay(true);
                pf_debug!("connected to {} as connection {}", peer, conn_id);
                Self::conn_messenger_thread(
                    shared,
                    conn_id,
                    Some(peer),
                    stream,
                    rx_send,
                    pending,
                )
                .await;
            }
            Err(e) => {
                pf_warn!("error connecting to {}: {}", peer, e);
                shared.retire_conn(
                    conn_id,
                    Some(peer),
                    &pending,
                    &e.to_string(),
                );
            }
        }
    }

    /// Connection reader thread function.
    async fn conn_reader_thread(
        shared: Arc<TcpShared>,
        conn_id: u64,
        mut conn_read: OwnedReadHalf,
        pending: Arc<Mutex<HashSet<CompletionToken>>>,
    ) -> String {
        loop {
            let frame = match Self::read_frame(
                &mut conn_read,
                shared.max_frame_len,
            )
            .await
            {
                Ok(frame) => frame,
                Err(e) => {
                    if e.is(ErrorKind::Transport) {
                        pf_warn!("bad frame on connection {}: {}", conn_id, e);
                    }
                    return e.to_string();
                }
            };
            pf_trace!("recv on connection {}: {:?}", conn_id, frame);

            let event = match frame {
                TcpFrame::Request { token, req } => TransportEvent::Request {
                    reply_to: ReplyTo {
                        route: conn_id,
                        token,
                    },
                    req,
                },
                TcpFrame::Reply { token, rep } => {
                    if !pending.lock().remove(&token) {
                        pf_warn!(
                            "unexpected reply token {} on connection {}",
                            token,
                            conn_id
                        );
                        continue;
                    }
                    TransportEvent::Reply { token, rep }
                }
            };
            if shared.sink.send(event).is_err() {
                return "context closed".into();
            }
        }
    }

    /// Connection messenger thread function.
    async fn conn_messenger_thread(
        shared: Arc<TcpShared>,
        conn_id: u64,
        peer: Option<SocketAddr>,
        conn: TcpStream,
        mut rx_send: mpsc::UnboundedReceiver<TcpFrame>,
        pending: Arc<Mutex<HashSet<CompletionToken>>>,
    ) {
        pf_debug!("messenger thread for connection {} spawned", conn_id);

        let (conn_read, mut conn_write) = conn.into_split();
        let mut reader = tokio::spawn(Self::conn_reader_thread(
            shared.clone(),
            conn_id,
            conn_read,
            pending.clone(),
        ));

        let reason = loop {
            tokio::select! {
                // gets a frame to send out
                frame = rx_send.recv() => {
                    match frame {
                        Some(frame) => {
                            if let Err(e) =
                                Self::write_frame(&frame, &mut conn_write).await
                            {
                                pf_error!(
                                    "error sending on connection {}: {}",
                                    conn_id,
                                    e
                                );
                                break e.to_string();
                            }
                        }
                        None => break "port closed".to_string(),
                    }
                },

                // reader finished, connection is gone
                res = &mut reader => {
                    break res.unwrap_or_else(|e| e.to_string());
                },
            }
        };

        reader.abort();
        shared.retire_conn(conn_id, peer, &pending, &reason);
        pf_debug!(
            "messenger thread for connection {} exitted: {}",
            conn_id,
            reason
        );
    }
}

/// Port of a `TcpTransport`.
struct TcpPort {
    uri: String,
    runtime: Handle,
    shared: Arc<TcpShared>,
    acceptor: JoinHandle<()>,
}

impl TcpPort {
    /// Returns the sender side of the outgoing connection to `peer`,
    /// connecting lazily. Registers `token` as pending on it.
    fn outgoing(
        &self,
        peer: SocketAddr,
        token: CompletionToken,
    ) -> mpsc::UnboundedSender<TcpFrame> {
        let mut table = self.shared.table.lock();
        if let Some(conn) = table
            .peers
            .get(&peer)
            .and_then(|conn_id| table.conns.get(conn_id))
        {
            conn.pending.lock().insert(token);
            return conn.tx_send.clone();
        }

        let conn_id = self.shared.next_conn.fetch_add(1, Ordering::Relaxed);
        let (tx_send, rx_send) = mpsc::unbounded_channel();
        let pending = Arc::new(Mutex::new(HashSet::from([token])));
        let handle = self.runtime.spawn(TcpShared::connector_thread(
            self.shared.clone(),
            conn_id,
            peer,
            rx_send,
            pending.clone(),
        ));
        table.conns.insert(
            conn_id,
            ConnHandle {
                tx_send: tx_send.clone(),
                pending,
                handle: Some(handle),
            },
        );
        table.peers.insert(peer, conn_id);
        tx_send
    }
}

impl Port for TcpPort {
    fn uri(&self) -> &str {
        &self.uri
    }

    fn resolve(&self, uri: &str) -> Result<TransportAddr, CartwrightError> {
        let peer: SocketAddr = uri
            .strip_prefix(TCP_SCHEME)
            .ok_or_else(|| {
                CartwrightError::new(
                    ErrorKind::Unreachable,
                    format!("'{}' is not a tcp uri", uri),
                )
            })?
            .parse()
            .map_err(|e| {
                CartwrightError::new(
                    ErrorKind::Unreachable,
                    format!("bad tcp uri '{}': {}", uri, e),
                )
            })?;

        let mut addrs = self.shared.addrs.write();
        let idx = match addrs.iter().position(|&a| a == peer) {
            Some(idx) => idx,
            None => {
                addrs.push(peer);
                addrs.len() - 1
            }
        };
        Ok(TransportAddr(idx as u64))
    }

    fn send(
        &self,
        addr: TransportAddr,
        token: CompletionToken,
        req: WireRequest,
    ) -> Result<(), CartwrightError> {
        let peer = self
            .shared
            .addrs
            .read()
            .get(addr.0 as usize)
            .copied()
            .ok_or_else(|| {
                CartwrightError::new(
                    ErrorKind::InvalidArgument,
                    format!("unknown transport addr {}", addr.0),
                )
            })?;

        let tx_send = self.outgoing(peer, token);
        if tx_send.send(TcpFrame::Request { token, req }).is_err() {
            // messenger already gone, its retirement reports the token
            pf_debug!("connection to {} closing, request {} lost", peer, token);
        }
        Ok(())
    }

    fn reply(
        &self,
        reply_to: &ReplyTo,
        rep: WireReply,
    ) -> Result<(), CartwrightError> {
        let table = self.shared.table.lock();
        let conn = table.conns.get(&reply_to.route).ok_or_else(|| {
            CartwrightError::new(
                ErrorKind::Transport,
                format!("connection {} closed", reply_to.route),
            )
        })?;
        conn.tx_send
            .send(TcpFrame::Reply {
                token: reply_to.token,
                rep,
            })
            .map_err(|e| {
                CartwrightError::new(ErrorKind::Transport, e.to_string())
            })
    }

    fn cancel(&self, token: CompletionToken) -> Result<(), CartwrightError> {
        for conn in self.shared.table.lock().conns.values() {
            conn.pending.lock().remove(&token);
        }
        self.shared
            .sink
            .send(TransportEvent::Canceled { token })
            .map_err(|e| {
                CartwrightError::new(ErrorKind::Transport, e.to_string())
            })
    }
}

impl Drop for TcpPort {
    fn drop(&mut self) {
        self.acceptor.abort();
        let mut table = self.shared.table.lock();
        for (_, conn) in table.conns.drain() {
            if let Some(handle) = conn.handle {
                handle.abort();
            }
        }
        table.peers.clear();
        pf_debug!("tcp port {} closed", self.uri);
    }
}

#[cfg(test)]
mod tcp_tests {
    use super::*;
    use crate::transport::RpcHeader;
    use bytes::Bytes;
    use tokio::time::{timeout, Duration};

    fn test_request() -> WireRequest {
        WireRequest {
            hdr: RpcHeader {
                opc: 0x0101_0002,
                group: "g".into(),
                src_rank: None,
                src_tag: 0,
                dst_rank: 0,
                dst_tag: 0,
                hlc: 42,
                rpc_id: 9,
                corpc: None,
            },
            payload: Bytes::from_static(b"hello"),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn request_reply_over_tcp() -> Result<(), CartwrightError> {
        let transport = TcpTransport::new("127.0.0.1:0".parse()?);
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        let a = transport.listen(tx_a)?;
        let b = transport.listen(tx_b)?;
        assert!(b.uri().starts_with("tcp://127.0.0.1:"));

        let addr = a.resolve(b.uri())?;
        assert_eq!(a.resolve(b.uri())?, addr);
        a.send(addr, 5, test_request())?;

        let ev = timeout(Duration::from_secs(5), rx_b.recv()).await;
        let reply_to = match ev {
            Ok(Some(TransportEvent::Request { reply_to, req })) => {
                assert_eq!(req, test_request());
                reply_to
            }
            ev => panic!("unexpected event {:?}", ev),
        };
        b.reply(
            &reply_to,
            WireReply {
                hlc: 43,
                status: None,
                payload: Bytes::from_static(b"world"),
            },
        )?;

        match timeout(Duration::from_secs(5), rx_a.recv()).await {
            Ok(Some(TransportEvent::Reply { token, rep })) => {
                assert_eq!(token, 5);
                assert_eq!(rep.payload, Bytes::from_static(b"world"));
            }
            ev => panic!("unexpected event {:?}", ev),
        }
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn connect_failure_reported() -> Result<(), CartwrightError> {
        let transport = TcpTransport::new("127.0.0.1:0".parse()?);
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let a = transport.listen(tx_a)?;

        // grab a free port, then close it so nothing listens there
        let dead = std::net::TcpListener::bind("127.0.0.1:0")?;
        let dead_uri = format!("tcp://{}", dead.local_addr()?);
        drop(dead);

        let addr = a.resolve(&dead_uri)?;
        a.send(addr, 11, test_request())?;
        match timeout(Duration::from_secs(5), rx_a.recv()).await {
            Ok(Some(TransportEvent::Failed { token, err })) => {
                assert_eq!(token, 11);
                assert_eq!(err.kind(), ErrorKind::Transport);
            }
            ev => panic!("unexpected event {:?}", ev),
        }
        assert!(a.resolve("local://x/0").is_err());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn oversized_frame_drops_connection() -> Result<(), CartwrightError>
    {
        let transport =
            TcpTransport::new("127.0.0.1:0".parse()?).with_max_frame_len(1024);
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, _rx_b) = mpsc::unbounded_channel();
        let a = transport.listen(tx_a)?;
        let b = transport.listen(tx_b)?;

        // a peer announcing a huge frame gets disconnected
        let peer: SocketAddr = a.uri().trim_start_matches(TCP_SCHEME).parse()?;
        let mut rogue = TcpStream::connect(peer).await?;
        rogue.write_u64(u64::MAX).await?;
        let mut buf = [0u8; 8];
        match timeout(Duration::from_secs(5), rogue.read(&mut buf)).await {
            Ok(Ok(0)) | Ok(Err(_)) => {}
            res => panic!("connection not dropped: {:?}", res),
        }

        // regular traffic still flows
        let addr = b.resolve(a.uri())?;
        b.send(addr, 3, test_request())?;
        match timeout(Duration::from_secs(5), rx_a.recv()).await {
            Ok(Some(TransportEvent::Request { req, .. })) => {
                assert_eq!(req, test_request());
            }
            ev => panic!("unexpected event {:?}", ev),
        }
        Ok(())
    }
}
