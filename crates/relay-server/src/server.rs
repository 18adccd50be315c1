//! Accept loop and WebSocket upgrade handling.
//!
//! Each accepted TCP connection is upgraded with
//! `tokio_tungstenite::accept_hdr_async`; the handshake callback captures
//! the request's query parameters and early data, and echoes the client's
//! subprotocol offer (which doubles as the early-data carrier) so the
//! upgrade completes. Every connection then runs as its own
//! [`TunnelSession`] task.

use crate::cache::{CachePolicy, ConfigCache};
use crate::config::ServerConfig;
use crate::handshake;
use crate::session::{SessionParams, SessionSettings, TunnelSession};
use relay_core::TunnelResult;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tracing::{debug, info, warn};

/// The relay server instance.
pub struct RelayServer {
    config: ServerConfig,
    cache: Arc<ConfigCache>,
}

impl RelayServer {
    pub fn new(config: ServerConfig) -> Self {
        let cache = Arc::new(ConfigCache::new(
            config.upstream_url.clone(),
            config.upstream_token.clone(),
            CachePolicy {
                ttl: config.refresh_ttl,
                debounce: config.refresh_debounce,
            },
        ));
        Self { config, cache }
    }

    /// Bind the configured port and serve until the process exits.
    pub async fn run(self) -> TunnelResult<()> {
        let listener = TcpListener::bind(("0.0.0.0", self.config.port)).await?;
        info!(port = self.config.port, pop = %self.config.pop, "relay listening");
        self.serve(listener).await
    }

    /// Accept loop over an already bound listener (separate from [`run`]
    /// so callers can bind an ephemeral port first).
    ///
    /// [`run`]: RelayServer::run
    pub async fn serve(self, listener: TcpListener) -> TunnelResult<()> {
        // Warm the snapshot before the first session, then keep it fresh
        // in the background.
        self.cache.refresh(false).await;
        let refresh_cache = self.cache.clone();
        let period = self.config.refresh_ttl.max(Duration::from_secs(1));
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(period);
            tick.tick().await; // the immediate tick is covered by the warm-up
            loop {
                tick.tick().await;
                refresh_cache.refresh(false).await;
            }
        });

        let settings = SessionSettings {
            pop: self.config.pop.clone(),
            connect_timeout: self.config.connect_timeout,
            doh_endpoint: self.config.doh_url.clone(),
            doh_timeout: self.config.doh_timeout,
        };

        let active = Arc::new(AtomicUsize::new(0));
        let max_sessions = self.config.max_sessions;

        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "tcp accept failed");
                    continue;
                }
            };

            if active.load(Ordering::Relaxed) >= max_sessions {
                warn!(peer = %peer, max_sessions, "session limit reached, dropping connection");
                continue;
            }

            let guard = SessionGuard::acquire(&active);
            let cache = self.cache.clone();
            let settings = settings.clone();
            tokio::spawn(async move {
                let _guard = guard; // keep the slot held until the session ends
                handle_connection(stream, peer, cache, settings).await;
            });
        }
    }
}

/// RAII guard counting live sessions; decrements on drop so the slot is
/// released however the task ends.
struct SessionGuard {
    counter: Arc<AtomicUsize>,
}

impl SessionGuard {
    fn acquire(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::Relaxed);
        Self {
            counter: counter.clone(),
        }
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::Relaxed);
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    cache: Arc<ConfigCache>,
    settings: SessionSettings,
) {
    stream.set_nodelay(true).ok();

    let mut params = SessionParams::default();
    let callback = |req: &Request, mut resp: Response| -> Result<Response, ErrorResponse> {
        params = handshake::params_from_request(req);
        // The subprotocol offer may carry early data; echo it back so the
        // negotiation completes for clients that sent one.
        if let Some(proto) = req.headers().get(handshake::EARLY_DATA_HEADER) {
            resp.headers_mut()
                .insert(handshake::EARLY_DATA_HEADER, proto.clone());
        }
        Ok(resp)
    };

    let ws = match tokio_tungstenite::accept_hdr_async(stream, callback).await {
        Ok(ws) => ws,
        Err(e) => {
            debug!(peer = %peer, error = %e, "websocket handshake failed");
            return;
        }
    };
    debug!(peer = %peer, "tunnel connection accepted");

    // TTL-guarded; a no-op while the snapshot is fresh.
    cache.refresh(false).await;

    TunnelSession::new(ws, params, settings, cache).run().await;
    debug!(peer = %peer, "tunnel connection closed");
}
