//! Per-connection tunnel state machine.
//!
//! A session walks AwaitingHeader → Authorizing → Establishing → Relaying,
//! with a terminal Rejected state for malformed headers, failed
//! authorization, and unreachable targets. Rejection is silent by design:
//! nothing is written back, so a probing client cannot distinguish a bad
//! identity from a dead endpoint — it only ever observes a closed
//! connection.

use crate::cache::ConfigCache;
use crate::doh::DohRelay;
use futures_util::{SinkExt, StreamExt};
use relay_core::{
    frame_encode, geo, Command, ResponseFramer, TunnelError, TunnelHeader, TunnelResult,
    MIN_HEADER_LEN,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};

/// Read buffer for the remote→client direction.
const REMOTE_READ_BUF: usize = 16 * 1024;

/// Only DNS is relayed on the UDP path.
const DNS_PORT: u16 = 53;

/// Default egress port when a candidate carries none.
const DEFAULT_EGRESS_PORT: u16 = 443;

/// How the caller wants egress fallback handled (`mode` query parameter).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EgressMode {
    #[default]
    Auto,
    /// `mode=direct`: never fall back to an egress point.
    Direct,
}

/// Parameters extracted from the upgrade request.
#[derive(Debug, Default)]
pub struct SessionParams {
    pub egress_override: Option<String>,
    pub mode: EgressMode,
    pub early_data: Option<Vec<u8>>,
}

/// Per-session knobs resolved by the server before the session starts.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub pop: String,
    pub connect_timeout: Duration,
    pub doh_endpoint: String,
    pub doh_timeout: Duration,
}

/// One accepted tunnel connection.
pub struct TunnelSession {
    ws: WebSocketStream<TcpStream>,
    params: SessionParams,
    settings: SessionSettings,
    cache: Arc<ConfigCache>,
}

impl TunnelSession {
    pub fn new(
        ws: WebSocketStream<TcpStream>,
        params: SessionParams,
        settings: SessionSettings,
        cache: Arc<ConfigCache>,
    ) -> Self {
        Self {
            ws,
            params,
            settings,
            cache,
        }
    }

    /// Drive the session to completion. Every rejection path returns
    /// without writing anything to the client.
    pub async fn run(mut self) {
        // AwaitingHeader: early data counts as the first chunk.
        let mut buf = self.params.early_data.take().unwrap_or_default();
        let (header, payload_start) = loop {
            if buf.len() >= MIN_HEADER_LEN {
                match TunnelHeader::parse(&buf) {
                    Ok(parsed) => break parsed,
                    Err(e) => {
                        debug!(error = %e, "rejecting malformed header");
                        return;
                    }
                }
            }
            match self.ws.next().await {
                Some(Ok(Message::Binary(data))) => buf.extend_from_slice(&data),
                Some(Ok(Message::Ping(payload))) => {
                    let _ = self.ws.send(Message::Pong(payload)).await;
                }
                Some(Ok(Message::Close(_))) | None => return,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(error = %e, "client read failed awaiting header");
                    return;
                }
            }
        };

        // Authorizing: at most one forced refresh per session, then the
        // claim is settled for good.
        let mut snapshot = self.cache.get().await;
        if !snapshot.identities.contains_key(&header.identity) {
            self.cache.refresh(true).await;
            snapshot = self.cache.get().await;
        }
        let Some(user) = snapshot.identities.get(&header.identity) else {
            info!(identity = %header.identity, "dropping unauthorized session");
            return;
        };

        let payload = buf.split_off(payload_start);
        debug!(
            user = %user.name,
            expiry = ?user.expiry,
            command = ?header.command,
            target = %header.addr,
            port = header.port,
            "session authorized"
        );

        match header.command {
            Command::Udp => self.run_dns(header, payload).await,
            Command::Tcp => {
                self.run_tcp(header, payload, &snapshot.egress.proxy_ips)
                    .await
            }
        }
    }

    /// Establishing (TCP): direct connect, then the egress fallback unless
    /// the caller disabled it.
    async fn run_tcp(self, header: TunnelHeader, payload: Vec<u8>, egress_candidates: &[String]) {
        let Self {
            ws,
            params,
            settings,
            ..
        } = self;

        let target = header.authority();
        let remote = match connect(&target, settings.connect_timeout).await {
            Ok(stream) => stream,
            Err(e) => {
                debug!(target = %target, error = %e, "direct connect failed");
                if params.mode == EgressMode::Direct {
                    debug!("egress fallback disabled by request mode, dropping session");
                    return;
                }
                let egress = pick_egress(
                    params.egress_override.as_deref(),
                    egress_candidates,
                    &settings.pop,
                );
                let (host, port) = split_host_port(&egress, DEFAULT_EGRESS_PORT);
                let fallback = format!("{host}:{port}");
                match connect(&fallback, settings.connect_timeout).await {
                    Ok(stream) => {
                        debug!(egress = %fallback, "connected via fallback egress");
                        stream
                    }
                    Err(e) => {
                        debug!(egress = %fallback, error = %e, "fallback connect failed, dropping session");
                        return;
                    }
                }
            }
        };

        relay(ws, remote, &header, payload).await;
    }

    /// Establishing + Relaying (UDP/DNS): length-prefixed queries go out as
    /// individual DoH round trips, answers come back reframed.
    async fn run_dns(self, header: TunnelHeader, payload: Vec<u8>) {
        if header.port != DNS_PORT {
            debug!(port = header.port, "udp relay restricted to dns, dropping session");
            return;
        }
        let Self {
            mut ws, settings, ..
        } = self;

        let mut doh = DohRelay::new(&settings.doh_endpoint, settings.doh_timeout);
        let mut framer = ResponseFramer::new(header.version);

        let mut chunk = payload;
        loop {
            for query in doh.extract(&chunk) {
                match doh.query(&query).await {
                    Ok(answer) => {
                        let frame = match frame_encode(&answer) {
                            Ok(frame) => frame,
                            Err(e) => {
                                warn!(error = %e, "dropping unframeable doh response");
                                continue;
                            }
                        };
                        if ws.send(Message::Binary(framer.frame(&frame))).await.is_err() {
                            return;
                        }
                    }
                    // DNS clients retry; a failed round trip never ends
                    // the session.
                    Err(e) => warn!(error = %e, "doh query failed"),
                }
            }

            chunk = loop {
                match ws.next().await {
                    Some(Ok(Message::Binary(data))) => break data,
                    Some(Ok(Message::Ping(payload))) => {
                        let _ = ws.send(Message::Pong(payload)).await;
                    }
                    Some(Ok(Message::Close(_))) | None => return,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(error = %e, "client read failed in dns mode");
                        return;
                    }
                }
            };
        }
    }
}

/// Duplex relay: client frames → remote socket, remote bytes → client with
/// the 2-byte session header on the first chunk only. Either side closing
/// or erroring tears both down.
async fn relay(
    ws: WebSocketStream<TcpStream>,
    remote: TcpStream,
    header: &TunnelHeader,
    initial_payload: Vec<u8>,
) {
    let (mut read_half, mut write_half) = remote.into_split();

    if !initial_payload.is_empty() {
        if let Err(e) = write_half.write_all(&initial_payload).await {
            debug!(error = %e, "initial payload write failed");
            return;
        }
    }

    let (mut sink, mut stream) = ws.split();
    let mut framer = ResponseFramer::new(header.version);
    let mut buf = vec![0u8; REMOTE_READ_BUF];

    loop {
        tokio::select! {
            msg = stream.next() => match msg {
                Some(Ok(Message::Binary(data))) => {
                    if let Err(e) = write_half.write_all(&data).await {
                        debug!(error = %e, "remote write failed");
                        break;
                    }
                }
                Some(Ok(Message::Ping(payload))) => {
                    let _ = sink.send(Message::Pong(payload)).await;
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(error = %e, "client read failed");
                    break;
                }
            },
            result = read_half.read(&mut buf) => match result {
                Ok(0) => break,
                Ok(n) => {
                    if sink.send(Message::Binary(framer.frame(&buf[..n]))).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    debug!(error = %e, "remote read failed");
                    break;
                }
            },
        }
    }

    // Best-effort teardown of both sides; never blocks on a peer.
    let _ = write_half.shutdown().await;
    let _ = sink.close().await;
}

async fn connect(addr: &str, limit: Duration) -> TunnelResult<TcpStream> {
    let stream = timeout(limit, TcpStream::connect(addr))
        .await
        .map_err(|_| TunnelError::Connect(format!("connect to {addr} timed out")))?
        .map_err(|e| TunnelError::Connect(format!("connect to {addr} failed: {e}")))?;
    stream.set_nodelay(true).ok();
    Ok(stream)
}

/// Egress priority: explicit request override, then the keyword heuristic
/// over the configured candidates, then the region default.
fn pick_egress(override_ip: Option<&str>, candidates: &[String], pop: &str) -> String {
    if let Some(ip) = override_ip {
        return ip.to_string();
    }
    geo::select_egress(candidates, pop)
        .map(str::to_string)
        .unwrap_or_else(|| geo::default_egress_for(pop).to_string())
}

/// Split an egress candidate into host and port; bare hosts and
/// unparseable ports get the default.
fn split_host_port(addr: &str, default_port: u16) -> (&str, u16) {
    match addr.split_once(':') {
        Some((host, port)) => (host, port.parse().unwrap_or(default_port)),
        None => (addr, default_port),
    }
}
