//! SFU HTTP API: peek and join.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gccore::GroupCallError;
use gccore::net::{HttpClient, HttpRequest, HttpResponse, IceServer, SfuTokenProvider};
use gccore::types::{CallId, ParticipantId};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Checks that `url` is an https URL whose host ends with one of
/// `allowed_suffixes` and returns it without a trailing slash.
pub fn validate_base_url(url: &str, allowed_suffixes: &[String]) -> Result<String, GroupCallError> {
    let invalid = || GroupCallError::InvalidSfuBaseUrl(url.to_string());

    let rest = url.strip_prefix("https://").ok_or_else(invalid)?;
    let authority = rest.split(['/', '?', '#']).next().unwrap_or_default();
    if authority.contains('@') {
        return Err(invalid());
    }
    let host = match authority.rsplit_once(':') {
        Some((host, port)) if !port.is_empty() && port.chars().all(|c| c.is_ascii_digit()) => host,
        Some(_) => return Err(invalid()),
        None => authority,
    };
    if host.is_empty() {
        return Err(invalid());
    }

    let host = host.to_ascii_lowercase();
    let allowed = allowed_suffixes.is_empty()
        || allowed_suffixes.iter().any(|suffix| {
            let suffix = suffix.trim_start_matches('.').to_ascii_lowercase();
            host == suffix || host.ends_with(&format!(".{suffix}"))
        });
    if !allowed {
        return Err(invalid());
    }

    Ok(url.trim_end_matches('/').to_string())
}

/// Token source handing out one fixed token.
#[derive(Debug, Clone)]
pub struct StaticTokenProvider(String);

impl StaticTokenProvider {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

#[async_trait]
impl SfuTokenProvider for StaticTokenProvider {
    async fn fetch_token(&self) -> Result<String> {
        Ok(self.0.clone())
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PeekRequest {
    call_id: String,
    protocol_version: u32,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PeekResponse {
    started_at: i64,
    max_participants: u32,
    #[serde(default)]
    encrypted_call_state: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct JoinRequest {
    call_id: String,
    protocol_version: u32,
    public_key: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct JoinResponse {
    participant_id: u32,
    #[serde(default)]
    ice_servers: Vec<IceServer>,
    #[serde(default)]
    existing_participants: Vec<u32>,
}

/// A running call as reported by the SFU.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeekInfo {
    pub started_at: DateTime<Utc>,
    pub max_participants: u32,
    pub encrypted_call_state: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeekOutcome {
    Running(PeekInfo),
    NotFound,
}

/// What the SFU told us when we joined.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinInfo {
    pub participant_id: ParticipantId,
    pub ice_servers: Vec<IceServer>,
    pub existing_participants: Vec<ParticipantId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinOutcome {
    Joined(JoinInfo),
    NotFound,
}

/// Client for one SFU, bounded by a per-request timeout.
#[derive(Clone)]
pub struct SfuClient {
    http: Arc<dyn HttpClient>,
    base_url: String,
    timeout: Duration,
}

impl SfuClient {
    pub fn new(http: Arc<dyn HttpClient>, base_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            http,
            base_url: base_url.into(),
            timeout,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn post<B: Serialize>(
        &self,
        path: &str,
        token: &str,
        body: &B,
    ) -> Result<HttpResponse, GroupCallError> {
        let url = format!("{}{}", self.base_url, path);
        let body = serde_json::to_vec(body)
            .map_err(|e| GroupCallError::SerializationFailure(e.to_string()))?;
        let request = HttpRequest::post(&url)
            .with_header("Authorization", format!("Bearer {token}"))
            .with_header("Content-Type", "application/json")
            .with_body(body);

        debug!(target: "GroupCall/Sfu", "POST {url}");
        match tokio::time::timeout(self.timeout, self.http.execute(request)).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(e)) => {
                warn!(target: "GroupCall/Sfu", "POST {url} failed: {e:?}");
                Err(GroupCallError::JoinError(format!("request to {path} failed: {e}")))
            }
            Err(_) => {
                warn!(target: "GroupCall/Sfu", "POST {url} timed out after {:?}", self.timeout);
                Err(GroupCallError::JoinError(format!("request to {path} timed out")))
            }
        }
    }

    pub async fn peek(
        &self,
        call_id: &CallId,
        protocol_version: u32,
        token: &str,
    ) -> Result<PeekOutcome, GroupCallError> {
        let request = PeekRequest {
            call_id: call_id.to_hex(),
            protocol_version,
        };
        let response = self.post("/v1/peek", token, &request).await?;
        match response.status_code {
            404 => return Ok(PeekOutcome::NotFound),
            401 => return Err(GroupCallError::InvalidToken),
            _ if response.is_success() => {}
            status => {
                return Err(GroupCallError::JoinError(format!(
                    "peek failed with status {status}"
                )));
            }
        }

        let body: PeekResponse = serde_json::from_slice(&response.body)
            .map_err(|e| GroupCallError::JoinError(format!("malformed peek response: {e}")))?;
        let started_at = DateTime::<Utc>::from_timestamp_millis(body.started_at).ok_or_else(|| {
            GroupCallError::JoinError(format!("peek start time out of range: {}", body.started_at))
        })?;
        let encrypted_call_state = body
            .encrypted_call_state
            .map(|state| {
                hex::decode(state).map_err(|e| {
                    GroupCallError::JoinError(format!("malformed call state encoding: {e}"))
                })
            })
            .transpose()?;

        Ok(PeekOutcome::Running(PeekInfo {
            started_at,
            max_participants: body.max_participants,
            encrypted_call_state,
        }))
    }

    pub async fn join(
        &self,
        call_id: &CallId,
        protocol_version: u32,
        public_key: &[u8],
        token: &str,
    ) -> Result<JoinOutcome, GroupCallError> {
        let request = JoinRequest {
            call_id: call_id.to_hex(),
            protocol_version,
            public_key: hex::encode(public_key),
        };
        let response = self.post("/v1/join", token, &request).await?;
        match response.status_code {
            404 => return Ok(JoinOutcome::NotFound),
            401 => return Err(GroupCallError::InvalidToken),
            503 => return Err(GroupCallError::JoinError("call is full".into())),
            _ if response.is_success() => {}
            status => {
                return Err(GroupCallError::JoinError(format!(
                    "join failed with status {status}"
                )));
            }
        }

        let body: JoinResponse = serde_json::from_slice(&response.body)
            .map_err(|e| GroupCallError::SfuProtocolViolation(format!("malformed join response: {e}")))?;
        let participant_id = ParticipantId(body.participant_id);
        if body.existing_participants.contains(&body.participant_id) {
            return Err(GroupCallError::SfuProtocolViolation(format!(
                "own id {participant_id} listed as existing participant"
            )));
        }

        Ok(JoinOutcome::Joined(JoinInfo {
            participant_id,
            ice_servers: body.ice_servers,
            existing_participants: body
                .existing_participants
                .into_iter()
                .map(ParticipantId)
                .collect(),
        }))
    }
}
