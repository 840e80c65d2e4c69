//! Sticky sessions: a decorator that layers session→server affinity over
//! any wrapped strategy.
//!
//! Sessions are keyed by an opaque random id carried in a cookie (or by the
//! client IP in the IP-keyed variant). The decorator only *reads* the
//! cookie; setting it on the response is the proxy's job once the upstream
//! answered, which is why a fresh pick is reported through
//! [`StickyOutcome::assignment`].

use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
    time::{Duration, Instant},
};

use http::HeaderMap;
use uuid::Uuid;

use super::{LoadBalancer, SelectContext};
use crate::core::{error::ProxyResult, model::Server};

pub const DEFAULT_COOKIE_NAME: &str = "lb_session";
pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(30 * 60);

/// How the session key is derived from the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKeying {
    /// Read the configured cookie; new sessions get a random id.
    Cookie,
    /// Use the client IP; no cookie round-trip needed.
    ClientIp,
}

#[derive(Debug, Clone)]
struct SessionEntry {
    server_id: String,
    expires_at: Instant,
}

/// A fresh session the proxy should persist via `Set-Cookie`.
#[derive(Debug, Clone)]
pub struct StickyAssignment {
    pub session_id: String,
    pub cookie_name: String,
    pub ttl: Duration,
}

pub struct StickyOutcome {
    pub server: Arc<Server>,
    /// Present only when a new cookie-keyed session was created.
    pub assignment: Option<StickyAssignment>,
}

pub struct StickySessions {
    inner: Arc<dyn LoadBalancer>,
    cookie_name: String,
    ttl: Duration,
    keying: SessionKeying,
    sessions: RwLock<HashMap<String, SessionEntry>>,
}

impl StickySessions {
    pub fn new(inner: Arc<dyn LoadBalancer>, cookie_name: impl Into<String>, ttl: Duration) -> Self {
        Self {
            inner,
            cookie_name: cookie_name.into(),
            ttl,
            keying: SessionKeying::Cookie,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// IP-keyed variant: replaces the cookie with the client IP used by
    /// IP-hash.
    pub fn by_client_ip(inner: Arc<dyn LoadBalancer>, ttl: Duration) -> Self {
        Self {
            inner,
            cookie_name: String::new(),
            ttl,
            keying: SessionKeying::ClientIp,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub fn cookie_name(&self) -> &str {
        &self.cookie_name
    }

    pub fn session_count(&self) -> usize {
        self.sessions.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Affinity-aware selection. Returns the remembered server while the
    /// session is fresh and its target is still present and healthy;
    /// otherwise delegates to the wrapped strategy and records a new
    /// session.
    pub fn select_with_session(
        &self,
        ctx: &SelectContext<'_>,
        servers: &[Arc<Server>],
    ) -> ProxyResult<StickyOutcome> {
        let key = self.session_key(ctx);

        if let Some(key) = key.as_deref()
            && let Some(server) = self.lookup(key, servers)
        {
            return Ok(StickyOutcome {
                server,
                assignment: None,
            });
        }

        let server = self.inner.select(ctx, servers)?;
        let assignment = match self.keying {
            SessionKeying::Cookie => {
                let session_id = Uuid::new_v4().to_string();
                self.remember(&session_id, &server.id);
                Some(StickyAssignment {
                    session_id,
                    cookie_name: self.cookie_name.clone(),
                    ttl: self.ttl,
                })
            }
            SessionKeying::ClientIp => {
                if let Some(key) = key {
                    self.remember(&key, &server.id);
                }
                None
            }
        };

        Ok(StickyOutcome { server, assignment })
    }

    fn session_key(&self, ctx: &SelectContext<'_>) -> Option<String> {
        match self.keying {
            SessionKeying::Cookie => cookie_value(ctx.headers, &self.cookie_name),
            SessionKeying::ClientIp => ctx.client_ip.map(|ip| ip.to_string()),
        }
    }

    /// Resolve a session to its server if the entry is fresh and the server
    /// is still present and healthy. Freshness is extended on use.
    fn lookup(&self, key: &str, servers: &[Arc<Server>]) -> Option<Arc<Server>> {
        let server_id = {
            let sessions = self.sessions.read().unwrap_or_else(|e| e.into_inner());
            let entry = sessions.get(key)?;
            if entry.expires_at <= Instant::now() {
                None
            } else {
                Some(entry.server_id.clone())
            }
        }?;

        let server = servers
            .iter()
            .find(|s| s.id == server_id && s.is_healthy() && s.has_capacity())?;

        // Sliding expiry: touch the entry.
        self.remember(key, &server_id);
        Some(Arc::clone(server))
    }

    fn remember(&self, key: &str, server_id: &str) {
        self.sessions
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(
                key.to_string(),
                SessionEntry {
                    server_id: server_id.to_string(),
                    expires_at: Instant::now() + self.ttl,
                },
            );
    }

    /// Drop expired sessions; run periodically by the session sweeper task.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut sessions = self.sessions.write().unwrap_or_else(|e| e.into_inner());
        let before = sessions.len();
        sessions.retain(|_, entry| entry.expires_at > now);
        before - sessions.len()
    }
}

impl LoadBalancer for StickySessions {
    fn name(&self) -> &'static str {
        "sticky"
    }

    fn select(&self, ctx: &SelectContext<'_>, servers: &[Arc<Server>]) -> ProxyResult<Arc<Server>> {
        self.select_with_session(ctx, servers).map(|o| o.server)
    }

    /// Purge sessions pinned to a removed server and forward to the wrapped
    /// strategy.
    fn forget_server(&self, server_id: &str) {
        self.sessions
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|_, entry| entry.server_id != server_id);
        self.inner.forget_server(server_id);
    }
}

/// Extract a cookie value from the request headers.
fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    for header in headers.get_all(http::header::COOKIE) {
        let Ok(raw) = header.to_str() else { continue };
        for pair in raw.split(';') {
            if let Some((k, v)) = pair.split_once('=')
                && k.trim() == name
            {
                return Some(v.trim().to_string());
            }
        }
    }
    None
}
