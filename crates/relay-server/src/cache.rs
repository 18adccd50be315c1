//! Process-wide credential and egress configuration cache.
//!
//! Holds the last good snapshot of authorized identities and egress
//! settings fetched from the remote config source. Readers always observe
//! a fully formed snapshot: a refresh swaps the whole `Arc`, and a failed
//! fetch leaves the previous snapshot untouched.
//!
//! Refresh policy: normal refreshes are skipped within the TTL of the
//! last success; forced refreshes (authorization misses) are skipped
//! within a shorter debounce window of the last attempt, bounding the
//! fetch rate under a burst of unauthorized probing. Concurrent callers
//! collapse onto a single fetch via the refresh-state mutex.

use relay_core::{TunnelError, TunnelResult};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};
use uuid::Uuid;

/// Hardcoded egress fallback, used whenever the remote settings omit or
/// empty the candidate list. Guarantees the list is never empty.
const FALLBACK_PROXY_IPS: &[&str] = &["egress-sg.edgetun.net"];

const FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// Metadata attached to an authorized identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityInfo {
    pub name: String,
    /// Expiry in epoch milliseconds. `None` = unactivated / never expires.
    pub expiry: Option<u64>,
}

/// Egress configuration, replaced wholesale on each refresh.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EgressConfig {
    /// Ordered egress candidates (`host` or `host:port`), region hinted
    /// by substring.
    pub proxy_ips: Vec<String>,
    /// Best-reachability addresses; consumed only by the external
    /// subscription-link generator.
    pub best_addrs: Vec<String>,
    /// Website / subscription URL, likewise only for the link generator.
    pub website_url: String,
}

impl Default for EgressConfig {
    fn default() -> Self {
        Self {
            proxy_ips: FALLBACK_PROXY_IPS.iter().map(|s| s.to_string()).collect(),
            best_addrs: Vec::new(),
            website_url: String::new(),
        }
    }
}

/// One internally consistent view of the cached configuration.
#[derive(Debug, Clone, Default)]
pub struct CacheSnapshot {
    pub identities: HashMap<Uuid, IdentityInfo>,
    pub egress: EgressConfig,
    pub refreshed_at: Option<Instant>,
}

/// Refresh timing policy.
#[derive(Debug, Clone, Copy)]
pub struct CachePolicy {
    /// Normal refreshes are skipped within this window of the last success.
    pub ttl: Duration,
    /// Forced refreshes are skipped within this window of the last attempt,
    /// successful or not.
    pub debounce: Duration,
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(60),
            debounce: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Default)]
struct RefreshState {
    last_attempt: Option<Instant>,
    last_success: Option<Instant>,
}

/// Remote payload, fixed schema. Sections absent from the response leave
/// the corresponding cached values untouched.
#[derive(Debug, Deserialize)]
struct RemoteConfig {
    users: Option<HashMap<String, RemoteUser>>,
    settings: Option<RemoteSettings>,
}

/// Identity map values arrive as either a bare display name or an object.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RemoteUser {
    Detailed {
        name: String,
        #[serde(default)]
        expiry: Option<u64>,
    },
    Name(String),
}

#[derive(Debug, Deserialize, Default)]
struct RemoteSettings {
    #[serde(rename = "proxyIPs")]
    proxy_ips: Option<Vec<String>>,
    #[serde(rename = "proxyIP")]
    proxy_ip: Option<String>,
    #[serde(rename = "bestDomains")]
    best_domains: Option<Vec<String>>,
    #[serde(rename = "websiteUrl")]
    website_url: Option<String>,
    #[serde(rename = "subUrl")]
    sub_url: Option<String>,
}

/// The shared cache. One instance per process, `Arc`-shared by all
/// sessions.
pub struct ConfigCache {
    http: reqwest::Client,
    url: Option<String>,
    token: Option<String>,
    policy: CachePolicy,
    snapshot: RwLock<Arc<CacheSnapshot>>,
    refresh_state: Mutex<RefreshState>,
}

impl ConfigCache {
    pub fn new(url: Option<String>, token: Option<String>, policy: CachePolicy) -> Self {
        Self {
            http: reqwest::Client::new(),
            url,
            token,
            policy,
            snapshot: RwLock::new(Arc::new(CacheSnapshot::default())),
            refresh_state: Mutex::new(RefreshState::default()),
        }
    }

    /// Last good snapshot. Never blocks on the network.
    pub async fn get(&self) -> Arc<CacheSnapshot> {
        self.snapshot.read().await.clone()
    }

    /// Refresh the snapshot from the remote source, subject to the
    /// TTL/debounce guards. Fetch failures are logged and leave the
    /// snapshot untouched; this never returns an error to the caller.
    pub async fn refresh(&self, force: bool) {
        let Some(url) = self.url.as_deref() else {
            return;
        };

        // Single-flight: concurrent callers queue here, then short-circuit
        // on the guards once the first caller has recorded its attempt.
        let mut state = self.refresh_state.lock().await;
        let now = Instant::now();
        if force {
            if state
                .last_attempt
                .is_some_and(|t| now.duration_since(t) < self.policy.debounce)
            {
                return;
            }
        } else if state
            .last_success
            .is_some_and(|t| now.duration_since(t) < self.policy.ttl)
        {
            return;
        }
        state.last_attempt = Some(now);

        match self.fetch(url).await {
            Ok(remote) => {
                let current = self.snapshot.read().await.clone();
                let next = apply(&current, remote, now);
                let identities = next.identities.len();
                let candidates = next.egress.proxy_ips.len();
                *self.snapshot.write().await = Arc::new(next);
                state.last_success = Some(now);
                debug!(identities, candidates, "config refreshed");
            }
            Err(e) => warn!(error = %e, "config refresh failed, keeping cached snapshot"),
        }
    }

    async fn fetch(&self, url: &str) -> TunnelResult<RemoteConfig> {
        let mut request = self
            .http
            .get(url)
            .timeout(FETCH_TIMEOUT)
            .header(
                reqwest::header::USER_AGENT,
                concat!("edgetun/", env!("CARGO_PKG_VERSION")),
            );
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| TunnelError::ConfigSync(e.to_string()))?;
        if !response.status().is_success() {
            return Err(TunnelError::ConfigSync(format!(
                "http {}",
                response.status()
            )));
        }
        response
            .json::<RemoteConfig>()
            .await
            .map_err(|e| TunnelError::ConfigSync(e.to_string()))
    }
}

/// Build the next snapshot from the current one and a remote payload.
/// Top-level sections replace wholesale; within the settings section the
/// egress-candidate and best-address lists fall back individually.
fn apply(current: &CacheSnapshot, remote: RemoteConfig, now: Instant) -> CacheSnapshot {
    let mut next = current.clone();

    if let Some(users) = remote.users {
        let mut identities = HashMap::with_capacity(users.len());
        for (key, user) in users {
            match Uuid::parse_str(&key) {
                Ok(id) => {
                    let info = match user {
                        RemoteUser::Detailed { name, expiry } => IdentityInfo { name, expiry },
                        RemoteUser::Name(name) => IdentityInfo { name, expiry: None },
                    };
                    identities.insert(id, info);
                }
                Err(_) => warn!(key = %key, "skipping identity with malformed uuid"),
            }
        }
        next.identities = identities;
    }

    if let Some(settings) = remote.settings {
        next.egress.proxy_ips = match settings.proxy_ips {
            Some(list) if !list.is_empty() => list,
            _ => match settings.proxy_ip {
                Some(ip) if !ip.is_empty() => vec![ip],
                _ => FALLBACK_PROXY_IPS.iter().map(|s| s.to_string()).collect(),
            },
        };
        next.egress.best_addrs = settings
            .best_domains
            .filter(|list| !list.is_empty())
            .unwrap_or_default();
        if let Some(url) = settings.website_url.or(settings.sub_url) {
            next.egress.website_url = url;
        }
    }

    next.refreshed_at = Some(now);
    next
}
