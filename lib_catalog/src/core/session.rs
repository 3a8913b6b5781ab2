//! # Session Guard
//!
//! Owns the marketplace session credential (the cookie set obtained from the
//! landing page) and refreshes it on demand.
//!
//! ## Single-flight refresh
//! Refreshes are serialized behind an async mutex. A caller that queued
//! behind an in-flight refresh does not start a second handshake: it gets the
//! credential the in-flight refresh produced, or that refresh's failure.
//! Credentials are replaced as a whole, never mutated in place.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use reqwest::header::SET_COOKIE;
use reqwest::Method;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::retrieve::{EgressError, EgressProvider};

#[derive(Debug, Clone, Error)]
pub enum SessionError {
    #[error("session handshake returned http {status}")]
    Handshake { status: u16 },

    #[error("session handshake failed: {0}")]
    Transport(String),

    #[error("no egress available for session handshake: {0}")]
    Egress(String),

    #[error("concurrent session refresh failed: {0}")]
    Shared(String),
}

impl From<EgressError> for SessionError {
    fn from(err: EgressError) -> Self {
        SessionError::Egress(err.to_string())
    }
}

/// Opaque session credential. `generation` increases by one per refresh.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionCredential {
    pub cookie: String,
    pub issued_at: DateTime<Utc>,
    pub generation: u64,
}

/// Performs the network handshake that yields a fresh cookie header.
pub trait SessionSource: Send + Sync + 'static {
    fn handshake(&self) -> impl Future<Output = Result<String, SessionError>> + Send;
}

struct FlightLog {
    last_error: Option<SessionError>,
}

pub struct SessionGuard<S> {
    source: S,
    current: RwLock<Arc<SessionCredential>>,
    /// Handshakes attempted so far, bumped once a handshake settles.
    attempts: AtomicU64,
    flight: Mutex<FlightLog>,
}

impl<S: SessionSource> SessionGuard<S> {
    /// Performs the initial handshake. Failing here is fatal for the caller:
    /// there is no session to scan with.
    pub async fn establish(source: S) -> Result<Self, SessionError> {
        let cookie = source.handshake().await?;
        tracing::info!("session established");
        Ok(Self {
            source,
            current: RwLock::new(Arc::new(SessionCredential {
                cookie,
                issued_at: Utc::now(),
                generation: 0,
            })),
            attempts: AtomicU64::new(1),
            flight: Mutex::new(FlightLog { last_error: None }),
        })
    }

    /// Latest valid credential. Never waits on an in-flight refresh.
    pub fn current(&self) -> Arc<SessionCredential> {
        Arc::clone(&self.current.read().expect("session lock poisoned"))
    }

    /// Number of handshakes performed, the initial one included.
    pub fn handshakes(&self) -> u64 {
        self.attempts.load(Ordering::Acquire)
    }

    /// Refreshes the credential currently held.
    pub async fn refresh(&self) -> Result<Arc<SessionCredential>, SessionError> {
        let stale = self.current();
        self.refresh_from(&stale).await
    }

    /// Refreshes on behalf of a caller that found `stale` rejected.
    ///
    /// Returns without a handshake when the credential was already replaced,
    /// and shares the result of a refresh that was in flight while waiting.
    pub async fn refresh_from(&self, stale: &SessionCredential) -> Result<Arc<SessionCredential>, SessionError> {
        // Ticket before the generation check: a refresh that publishes after
        // this load also bumps `attempts`, which is caught under the lock.
        let ticket = self.attempts.load(Ordering::Acquire);
        let latest = self.current();
        if latest.generation > stale.generation {
            return Ok(latest);
        }

        let mut flight = self.flight.lock().await;

        if self.attempts.load(Ordering::Acquire) != ticket {
            // A handshake settled while we were queued: adopt its result.
            let latest = self.current();
            if latest.generation > stale.generation {
                return Ok(latest);
            }
            let reason = flight
                .last_error
                .as_ref()
                .map(ToString::to_string)
                .unwrap_or_else(|| "unknown".to_string());
            return Err(SessionError::Shared(reason));
        }

        tracing::warn!(generation = stale.generation, "refreshing marketplace session");
        let result = self.source.handshake().await;
        let outcome = match result {
            Ok(cookie) => {
                let fresh = Arc::new(SessionCredential {
                    cookie,
                    issued_at: Utc::now(),
                    generation: stale.generation + 1,
                });
                *self.current.write().expect("session lock poisoned") = Arc::clone(&fresh);
                flight.last_error = None;
                tracing::info!(generation = fresh.generation, "session refreshed");
                Ok(fresh)
            }
            Err(err) => {
                tracing::error!(error = %err, "session refresh failed");
                flight.last_error = Some(err.clone());
                Err(err)
            }
        };
        self.attempts.fetch_add(1, Ordering::AcqRel);
        outcome
    }
}

/// Handshake against the marketplace landing page: the `Set-Cookie` pairs it
/// returns become the session cookie header.
pub struct HttpSessionSource {
    egress: Arc<dyn EgressProvider>,
}

impl HttpSessionSource {
    pub fn new(egress: Arc<dyn EgressProvider>) -> Self {
        Self { egress }
    }
}

impl SessionSource for HttpSessionSource {
    async fn handshake(&self) -> Result<String, SessionError> {
        let handle = self.egress.acquire()?;
        let response = handle
            .client
            .request_text::<()>(Method::GET, "", None, None)
            .await
            .map_err(|e| SessionError::Transport(e.to_string()))?;

        if !response.success {
            return Err(SessionError::Handshake { status: response.status });
        }

        let cookie = cookie_header(
            response
                .headers
                .get_all(SET_COOKIE)
                .iter()
                .filter_map(|v| v.to_str().ok()),
        );
        if cookie.is_empty() {
            tracing::warn!(egress = %handle.label, "session handshake returned no cookies");
        }
        Ok(cookie)
    }
}

/// Reduces `Set-Cookie` values to a `Cookie` request header (`a=1; b=2`).
pub fn cookie_header<'a>(set_cookies: impl Iterator<Item = &'a str>) -> String {
    set_cookies
        .filter_map(|raw| raw.split(';').next())
        .map(str::trim)
        .filter(|pair| pair.contains('='))
        .collect::<Vec<_>>()
        .join("; ")
}
