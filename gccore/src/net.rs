use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::types::{MediaKind, ParticipantId};

/// A simple structure to represent an HTTP request
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub url: String,
    pub method: String,
    pub headers: HashMap<String, String>,
    pub body: Option<Vec<u8>>,
}

impl HttpRequest {
    pub fn post(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: "POST".to_string(),
            headers: HashMap::new(),
            body: None,
        }
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn with_body(mut self, body: Vec<u8>) -> Self {
        self.body = Some(body);
        self
    }
}

/// A buffered HTTP response. SFU bodies are small JSON documents.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status_code: u16,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn empty(status_code: u16) -> Self {
        Self {
            status_code,
            body: Vec::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }
}

/// Trait for executing HTTP requests in a runtime-agnostic way
#[async_trait]
pub trait HttpClient: Send + Sync {
    /// Executes a given HTTP request and returns the response.
    /// Non-2xx statuses are responses, not errors.
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse>;
}

/// Source of the bearer token the SFU expects.
#[async_trait]
pub trait SfuTokenProvider: Send + Sync {
    async fn fetch_token(&self) -> Result<String>;
}

/// ICE server handed out by the SFU on join.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

/// Everything needed to open the peer connection towards the SFU.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionParams {
    pub sfu_base_url: String,
    pub local_participant: ParticipantId,
    pub ice_servers: Vec<IceServer>,
    pub audio_enabled: bool,
    pub video_enabled: bool,
}

/// An event produced by the peer connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerConnectionEvent {
    Connected,
    Disconnected,
    Failed(String),
    /// Signalling data from the SFU.
    Message(Bytes),
    /// An encrypted media frame of a remote participant.
    MediaFrame { sender: ParticipantId, frame: Bytes },
    /// Local capture device failure.
    CaptureError(String),
}

/// The peer connection to the SFU. Media transport is opaque to the call layer.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    /// Sends signalling data to the SFU.
    async fn send(&self, data: &[u8]) -> Result<()>;

    /// Sends an already encrypted media frame.
    async fn send_media_frame(&self, kind: MediaKind, frame: &[u8]) -> Result<()>;

    /// Turns local capture on or off.
    async fn set_capture(&self, kind: MediaKind, on: bool) -> Result<()>;

    async fn close(&self);
}

/// A factory responsible for creating new peer connections.
#[async_trait]
pub trait PeerConnectionFactory: Send + Sync {
    /// Creates a connection and returns it, along with a stream of events.
    async fn connect(
        &self,
        params: ConnectionParams,
    ) -> Result<(Arc<dyn PeerConnection>, mpsc::Receiver<PeerConnectionEvent>)>;
}
