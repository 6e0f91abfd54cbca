//! HTTP arbiter client.
//!
//! Talks to the remote leadership authority over a small REST surface:
//! `POST /session/claim`, `POST /session/release`, `GET /session/status`.
//! All failures map to `WardenError::Arbiter` — the coordinator treats
//! arbiter unavailability as non-critical and keeps its previous local
//! state.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

use super::Arbiter;
use crate::types::{ClaimResponse, LeaseRecord, SessionStatus, WardenError};

/// Timeout for the teardown-path release. Deliberately short: by the time
/// this fires the process is already on its way out.
const BEST_EFFORT_TIMEOUT: Duration = Duration::from_secs(2);

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct ClaimRequest<'a> {
    instance_id: &'a str,
    force: bool,
}

#[derive(Debug, Deserialize)]
struct WireLease {
    holder_id: String,
    claimed_at: DateTime<Utc>,
    last_renewed_at: DateTime<Utc>,
    #[serde(default)]
    forced: bool,
}

impl From<WireLease> for LeaseRecord {
    fn from(w: WireLease) -> Self {
        LeaseRecord {
            holder_id: w.holder_id,
            claimed_at: w.claimed_at,
            last_renewed_at: w.last_renewed_at,
            forced: w.forced,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ClaimReply {
    granted: bool,
    lease: WireLease,
}

#[derive(Debug, Serialize)]
struct ReleaseRequest<'a> {
    instance_id: &'a str,
}

#[derive(Debug, Deserialize)]
struct ReleaseReply {
    released: bool,
}

#[derive(Debug, Deserialize)]
struct StatusReply {
    is_active: bool,
    #[serde(default)]
    active_id: Option<String>,
    #[serde(default)]
    lease: Option<WireLease>,
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// REST client for the leadership arbiter.
pub struct HttpArbiter {
    client: Client,
    /// Separate client with a very short timeout for teardown release.
    teardown_client: Client,
    base_url: String,
    auth_token: Option<SecretString>,
}

impl HttpArbiter {
    pub fn new(
        base_url: String,
        auth_token: Option<SecretString>,
        request_timeout: Duration,
    ) -> Result<Self, WardenError> {
        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| WardenError::Init(format!("Failed to build arbiter client: {e}")))?;
        let teardown_client = Client::builder()
            .timeout(BEST_EFFORT_TIMEOUT)
            .build()
            .map_err(|e| WardenError::Init(format!("Failed to build teardown client: {e}")))?;

        Ok(Self {
            client,
            teardown_client,
            base_url: base_url.trim_end_matches('/').to_string(),
            auth_token,
        })
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.auth_token {
            Some(token) => req.bearer_auth(token.expose_secret()),
            None => req,
        }
    }

    fn arbiter_err(context: &str, e: impl std::fmt::Display) -> WardenError {
        WardenError::Arbiter(format!("{context}: {e}"))
    }
}

#[async_trait]
impl Arbiter for HttpArbiter {
    async fn claim_session(
        &self,
        instance_id: &str,
        force: bool,
    ) -> Result<ClaimResponse, WardenError> {
        let url = format!("{}/session/claim", self.base_url);
        let req = self
            .authorize(self.client.post(&url))
            .json(&ClaimRequest { instance_id, force });

        let resp = req
            .send()
            .await
            .map_err(|e| Self::arbiter_err("claim request failed", e))?;

        if !resp.status().is_success() {
            return Err(WardenError::Arbiter(format!(
                "claim returned HTTP {}",
                resp.status()
            )));
        }

        let reply: ClaimReply = resp
            .json()
            .await
            .map_err(|e| Self::arbiter_err("claim response parse failed", e))?;

        debug!(
            instance_id,
            force,
            granted = reply.granted,
            holder = %reply.lease.holder_id,
            "Arbiter claim response"
        );

        if reply.granted {
            Ok(ClaimResponse::Granted {
                lease: reply.lease.into(),
            })
        } else {
            Ok(ClaimResponse::Denied {
                lease: reply.lease.into(),
            })
        }
    }

    async fn release_session(&self, instance_id: &str) -> Result<bool, WardenError> {
        let url = format!("{}/session/release", self.base_url);
        let resp = self
            .authorize(self.client.post(&url))
            .json(&ReleaseRequest { instance_id })
            .send()
            .await
            .map_err(|e| Self::arbiter_err("release request failed", e))?;

        if !resp.status().is_success() {
            return Err(WardenError::Arbiter(format!(
                "release returned HTTP {}",
                resp.status()
            )));
        }

        let reply: ReleaseReply = resp
            .json()
            .await
            .map_err(|e| Self::arbiter_err("release response parse failed", e))?;
        Ok(reply.released)
    }

    async fn session_status(&self) -> Result<SessionStatus, WardenError> {
        let url = format!("{}/session/status", self.base_url);
        let resp = self
            .authorize(self.client.get(&url))
            .send()
            .await
            .map_err(|e| Self::arbiter_err("status request failed", e))?;

        if !resp.status().is_success() {
            return Err(WardenError::Arbiter(format!(
                "status returned HTTP {}",
                resp.status()
            )));
        }

        let reply: StatusReply = resp
            .json()
            .await
            .map_err(|e| Self::arbiter_err("status response parse failed", e))?;

        Ok(SessionStatus {
            is_active: reply.is_active,
            active_id: reply.active_id,
            lease: reply.lease.map(Into::into),
        })
    }

    /// Teardown release: dedicated short-timeout client so a hung arbiter
    /// cannot stall process exit. Errors are logged and swallowed.
    async fn release_best_effort(&self, instance_id: &str) {
        let url = format!("{}/session/release", self.base_url);
        let req = match &self.auth_token {
            Some(token) => self
                .teardown_client
                .post(&url)
                .bearer_auth(token.expose_secret()),
            None => self.teardown_client.post(&url),
        };

        match req.json(&ReleaseRequest { instance_id }).send().await {
            Ok(resp) => debug!(
                instance_id,
                status = %resp.status(),
                "Best-effort release delivered"
            ),
            Err(e) => warn!(instance_id, error = %e, "Best-effort release failed"),
        }
    }
}
