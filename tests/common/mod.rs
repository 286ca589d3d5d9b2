#![allow(dead_code)]

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use bytes::Bytes;
use gccore::codec::{self, P2pMessage, RelayEnvelope, SfuMessage, SfuRequest};
use gccore::crypto::{CallCrypto, DefaultCallCrypto, KeyPair};
use gccore::frame::{MediaKeyHistory, MediaKeySet, encrypt_frame};
use gccore::handshake::{HandshakeRole, PendingParticipant};
use gccore::keys::GroupCallKeys;
use gccore::net::{
    ConnectionParams, HttpClient, HttpRequest, HttpResponse, PeerConnection, PeerConnectionEvent,
    PeerConnectionFactory,
};
use gccore::types::{
    CallIdentity, CallStartData, GroupCallKey, GroupIdentity, MediaKind, ParticipantId,
};
use groupcall::config::GroupCallConfig;
use groupcall::group_call::{GroupCallDeps, GroupCallEvent, StaticTokenProvider};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use zeroize::Zeroizing;

pub const GCK: [u8; 32] = [9; 32];
pub const SFU_URL: &str = "https://sfu.example.com";

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub async fn within<F: Future>(fut: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(5), fut)
        .await
        .expect("timed out")
}

pub fn group() -> GroupIdentity {
    GroupIdentity::new("ECHOECHO", [1, 2, 3, 4, 5, 6, 7, 8])
}

pub fn call_identity() -> CallIdentity {
    call_identity_at(SFU_URL, 1)
}

pub fn call_identity_at(url: &str, protocol_version: u32) -> CallIdentity {
    CallIdentity::new(group(), start_data(url, protocol_version))
}

pub fn start_data(url: &str, protocol_version: u32) -> CallStartData {
    CallStartData {
        protocol_version,
        gck: GroupCallKey::from_bytes(GCK),
        sfu_base_url: url.to_string(),
    }
}

pub fn test_config() -> GroupCallConfig {
    GroupCallConfig {
        http_timeout: Duration::from_secs(2),
        connect_timeout: Duration::from_secs(2),
        handshake_timeout: Duration::from_secs(2),
        rekey_apply_delay: Duration::from_millis(50),
        call_state_update_interval: Duration::from_secs(60),
        ..GroupCallConfig::default()
    }
}

pub fn response(status: u16, body: &str) -> HttpResponse {
    HttpResponse {
        status_code: status,
        body: body.as_bytes().to_vec(),
    }
}

pub fn peek_running(started_at_ms: i64) -> HttpResponse {
    response(
        200,
        &format!(r#"{{"startedAt":{started_at_ms},"maxParticipants":8}}"#),
    )
}

pub fn joined(participant: u32, existing: &[u32]) -> HttpResponse {
    let existing: Vec<String> = existing.iter().map(u32::to_string).collect();
    response(
        200,
        &format!(
            r#"{{"participantId":{participant},"existingParticipants":[{}]}}"#,
            existing.join(",")
        ),
    )
}

type Responder = Box<dyn FnMut(&HttpRequest) -> HttpResponse + Send>;

/// SFU HTTP endpoint answering from a closure and recording every request.
pub struct ScriptedSfu {
    responder: Mutex<Responder>,
    requests: Mutex<Vec<HttpRequest>>,
}

impl ScriptedSfu {
    pub fn new(responder: impl FnMut(&HttpRequest) -> HttpResponse + Send + 'static) -> Arc<Self> {
        Arc::new(Self {
            responder: Mutex::new(Box::new(responder)),
            requests: Mutex::new(Vec::new()),
        })
    }

    /// Answers peeks and joins from queues. The last entry of a queue is
    /// repeated once the queue runs dry.
    pub fn queued(peeks: Vec<HttpResponse>, joins: Vec<HttpResponse>) -> Arc<Self> {
        let mut peeks = VecDeque::from(peeks);
        let mut joins = VecDeque::from(joins);
        Self::new(move |request| {
            let queue = if request.url.ends_with("/v1/peek") {
                &mut peeks
            } else {
                &mut joins
            };
            if queue.len() > 1 {
                queue.pop_front().expect("non-empty queue")
            } else {
                queue.front().cloned().unwrap_or_else(|| HttpResponse::empty(500))
            }
        })
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn paths(&self) -> Vec<String> {
        self.requests()
            .into_iter()
            .map(|r| r.url.trim_start_matches(SFU_URL).to_string())
            .collect()
    }
}

#[async_trait]
impl HttpClient for ScriptedSfu {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse> {
        let response = {
            let mut responder = self.responder.lock().unwrap();
            (*responder)(&request)
        };
        self.requests.lock().unwrap().push(request);
        Ok(response)
    }
}

/// Everything the session did on its peer connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Request(SfuRequest),
    Media { kind: MediaKind, frame: Vec<u8> },
    Capture { kind: MediaKind, on: bool },
    Closed,
}

struct MockConnection {
    outbound: mpsc::UnboundedSender<Outbound>,
    fail_sends: Arc<AtomicBool>,
    fail_capture: Arc<AtomicBool>,
}

#[async_trait]
impl PeerConnection for MockConnection {
    async fn send(&self, data: &[u8]) -> Result<()> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(anyhow!("transport gone"));
        }
        let request = codec::decode_sfu_request(data)?;
        let _ = self.outbound.send(Outbound::Request(request));
        Ok(())
    }

    async fn send_media_frame(&self, kind: MediaKind, frame: &[u8]) -> Result<()> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(anyhow!("transport gone"));
        }
        let _ = self.outbound.send(Outbound::Media {
            kind,
            frame: frame.to_vec(),
        });
        Ok(())
    }

    async fn set_capture(&self, kind: MediaKind, on: bool) -> Result<()> {
        if self.fail_capture.load(Ordering::SeqCst) {
            return Err(anyhow!("no such device"));
        }
        let _ = self.outbound.send(Outbound::Capture { kind, on });
        Ok(())
    }

    async fn close(&self) {
        let _ = self.outbound.send(Outbound::Closed);
    }
}

/// The SFU side of one peer connection.
pub struct SfuEndpoint {
    pub params: ConnectionParams,
    events: mpsc::Sender<PeerConnectionEvent>,
    outbound: mpsc::UnboundedReceiver<Outbound>,
    pub fail_sends: Arc<AtomicBool>,
    seen: Vec<Outbound>,
}

impl SfuEndpoint {
    pub async fn push(&self, event: PeerConnectionEvent) {
        self.events.send(event).await.expect("session gone");
    }

    pub async fn push_message(&self, message: SfuMessage) {
        self.push(PeerConnectionEvent::Message(Bytes::from(
            codec::encode_sfu_message(&message),
        )))
        .await;
    }

    pub async fn next(&mut self) -> Outbound {
        let outbound = within(self.outbound.recv()).await.expect("connection dropped");
        self.seen.push(outbound.clone());
        outbound
    }

    /// Everything taken off the connection so far, in order.
    pub fn seen(&self) -> &[Outbound] {
        &self.seen
    }

    /// Next signalling request, skipping periodic call state updates.
    pub async fn next_request(&mut self) -> SfuRequest {
        loop {
            match self.next().await {
                Outbound::Request(SfuRequest::UpdateCallState(_)) => continue,
                Outbound::Request(request) => return request,
                other => panic!("expected a request, got {other:?}"),
            }
        }
    }

    pub async fn next_relay(&mut self) -> RelayEnvelope {
        match self.next_request().await {
            SfuRequest::Relay(envelope) => envelope,
            other => panic!("expected a relay, got {other:?}"),
        }
    }

    /// Drains everything sent until the connection was closed.
    pub async fn until_closed(&mut self) -> Vec<Outbound> {
        let mut seen = Vec::new();
        loop {
            match self.next().await {
                Outbound::Closed => return seen,
                other => seen.push(other),
            }
        }
    }
}

pub struct MockFactory {
    endpoints: mpsc::UnboundedSender<SfuEndpoint>,
    pub fail_capture: Arc<AtomicBool>,
}

impl MockFactory {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<SfuEndpoint>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                endpoints: tx,
                fail_capture: Arc::new(AtomicBool::new(false)),
            }),
            rx,
        )
    }
}

#[async_trait]
impl PeerConnectionFactory for MockFactory {
    async fn connect(
        &self,
        params: ConnectionParams,
    ) -> Result<(Arc<dyn PeerConnection>, mpsc::Receiver<PeerConnectionEvent>)> {
        let (event_tx, event_rx) = mpsc::channel(64);
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let fail_sends = Arc::new(AtomicBool::new(false));
        let connection = MockConnection {
            outbound: out_tx,
            fail_sends: fail_sends.clone(),
            fail_capture: self.fail_capture.clone(),
        };
        self.endpoints
            .send(SfuEndpoint {
                params,
                events: event_tx,
                outbound: out_rx,
                fail_sends,
                seen: Vec::new(),
            })
            .map_err(|_| anyhow!("test dropped the endpoint receiver"))?;
        Ok((Arc::new(connection), event_rx))
    }
}

pub struct Harness {
    pub http: Arc<ScriptedSfu>,
    pub factory: Arc<MockFactory>,
    pub endpoints: mpsc::UnboundedReceiver<SfuEndpoint>,
    pub deps: GroupCallDeps,
}

impl Harness {
    pub fn new(http: Arc<ScriptedSfu>, seed: u64) -> Self {
        let (factory, endpoints) = MockFactory::new();
        let deps = GroupCallDeps {
            http: http.clone(),
            tokens: Arc::new(StaticTokenProvider::new("sfu-token")),
            connections: factory.clone(),
            crypto: Arc::new(DefaultCallCrypto::from_seed(seed)),
        };
        Self {
            http,
            factory,
            endpoints,
            deps,
        }
    }

    pub async fn next_endpoint(&mut self) -> SfuEndpoint {
        within(self.endpoints.recv())
            .await
            .expect("factory dropped")
    }
}

pub async fn wait_for_event(
    events: &mut broadcast::Receiver<GroupCallEvent>,
    mut matches: impl FnMut(&GroupCallEvent) -> bool,
) -> GroupCallEvent {
    loop {
        match within(events.recv()).await {
            Ok(event) if matches(&event) => return event,
            Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => panic!("event stream closed"),
        }
    }
}

/// A remote participant driven by the test, built from the same primitives
/// the session uses.
pub struct RemotePeer {
    pub id: ParticipantId,
    pub identity: String,
    crypto: DefaultCallCrypto,
    key_pair: KeyPair,
    keys: GroupCallKeys,
    pub send_keys: MediaKeySet,
    handshake: Option<PendingParticipant>,
    pairwise: Option<Zeroizing<[u8; 32]>>,
    /// Media keys of the participant on the other end of the handshake.
    pub peer_keys: Option<MediaKeyHistory>,
}

impl RemotePeer {
    pub fn new(id: u32, identity: &str, seed: u64) -> Self {
        let crypto = DefaultCallCrypto::from_seed(seed);
        let key_pair = crypto.generate_key_pair();
        let keys = GroupCallKeys::derive(&GroupCallKey::from_bytes(GCK)).unwrap();
        let send_keys = MediaKeySet::derive_initial(&crypto.random_key()[..]).unwrap();
        Self {
            id: ParticipantId::new(id),
            identity: identity.to_string(),
            crypto,
            key_pair,
            keys,
            send_keys,
            handshake: None,
            pairwise: None,
            peer_keys: None,
        }
    }

    fn envelope(&self, to: ParticipantId, key: &[u8; 32], message: &P2pMessage) -> SfuMessage {
        SfuMessage::Relay(RelayEnvelope {
            sender: self.id,
            receiver: to,
            encrypted_data: codec::seal_p2p(&self.crypto, key, message).unwrap(),
        })
    }

    fn hello(&self, to: ParticipantId) -> SfuMessage {
        let hello = P2pMessage::Hello {
            identity: self.identity.clone(),
            public_key: self.key_pair.public_key(),
        };
        self.envelope(to, self.keys.gchk(), &hello)
    }

    /// Starts a handshake as the newcomer greeting `to`.
    pub fn greet(&mut self, to: ParticipantId) -> SfuMessage {
        self.handshake = Some(PendingParticipant::new(to, HandshakeRole::Initiator));
        self.hello(to)
    }

    /// Waits for `from` to greet us.
    pub fn await_greeting(&mut self, from: ParticipantId) {
        self.handshake = Some(PendingParticipant::new(from, HandshakeRole::Responder));
    }

    /// Seals `message` under the pairwise key.
    pub fn message(&self, to: ParticipantId, message: &P2pMessage) -> SfuMessage {
        let key = self.pairwise.as_ref().expect("handshake not done");
        self.envelope(to, key, message)
    }

    /// Opens a relay addressed to us and advances the handshake. Returns the
    /// message and whatever we answer with.
    pub fn receive(&mut self, envelope: &RelayEnvelope) -> (P2pMessage, Vec<SfuMessage>) {
        assert_eq!(envelope.receiver, self.id);
        let key = match &self.pairwise {
            Some(key) => **key,
            None => *self.keys.gchk(),
        };
        let message = codec::open_p2p(&self.crypto, &key, &envelope.encrypted_data).unwrap();
        let from = envelope.sender;

        let mut replies = Vec::new();
        match &message {
            P2pMessage::Hello {
                identity,
                public_key,
            } => {
                let handshake = self.handshake.as_mut().expect("no handshake in progress");
                handshake
                    .handle_hello(&self.crypto, &self.keys, &self.key_pair, identity.clone(), public_key)
                    .unwrap();
                let pairwise = Zeroizing::new(*handshake.pairwise_key().unwrap());
                if handshake.role() == HandshakeRole::Responder {
                    replies.push(self.hello(from));
                }
                replies.push(self.envelope(from, &pairwise, &P2pMessage::HelloAck(self.send_keys.clone())));
                self.pairwise = Some(pairwise);
            }
            P2pMessage::HelloAck(key_set) => {
                let handshake = self.handshake.take().expect("no handshake in progress");
                let result = handshake.handle_hello_ack(key_set.clone()).unwrap();
                self.peer_keys = Some(result.media_keys);
            }
            P2pMessage::Rekey(key_set) => {
                self.peer_keys
                    .as_mut()
                    .expect("handshake not done")
                    .set_pending(key_set.clone())
                    .unwrap();
            }
            P2pMessage::CaptureState { .. } | P2pMessage::AppData(_) => {}
        }
        (message, replies)
    }

    /// Follows a join or leave of somebody else.
    pub fn ratchet(&mut self) {
        self.send_keys = self.send_keys.ratchet().unwrap();
        if let Some(keys) = self.peer_keys.as_mut() {
            keys.ratchet().unwrap();
        }
    }

    pub fn media_frame(&mut self, plaintext: &[u8]) -> PeerConnectionEvent {
        PeerConnectionEvent::MediaFrame {
            sender: self.id,
            frame: Bytes::from(encrypt_frame(plaintext, &mut self.send_keys).unwrap()),
        }
    }

    pub fn decrypt(&mut self, frame: &[u8], from: ParticipantId) -> Vec<u8> {
        self.peer_keys
            .as_mut()
            .expect("handshake not done")
            .decrypt(frame, from)
            .unwrap()
    }

    pub fn peer_epoch(&self) -> u32 {
        self.peer_keys.as_ref().expect("handshake not done").epoch()
    }
}

/// Runs the handshake in which `peer` already sits in the call and the
/// session greets it on connect.
pub async fn greeted_by_session(endpoint: &mut SfuEndpoint, peer: &mut RemotePeer) {
    let hello = endpoint.next_relay().await;
    let local = hello.sender;
    peer.await_greeting(local);
    let (message, replies) = peer.receive(&hello);
    assert!(matches!(message, P2pMessage::Hello { .. }));
    for reply in replies {
        endpoint.push_message(reply).await;
    }
    let ack = endpoint.next_relay().await;
    let (message, _) = peer.receive(&ack);
    assert!(matches!(message, P2pMessage::HelloAck(_)));
}

/// Runs the handshake in which `peer` joins after the session.
pub async fn joins_session(endpoint: &mut SfuEndpoint, peer: &mut RemotePeer, local: ParticipantId) {
    endpoint
        .push_message(SfuMessage::ParticipantJoined(peer.id))
        .await;
    let hello = peer.greet(local);
    endpoint.push_message(hello).await;

    let reply_hello = endpoint.next_relay().await;
    let (message, replies) = peer.receive(&reply_hello);
    assert!(matches!(message, P2pMessage::Hello { .. }));
    let ack = endpoint.next_relay().await;
    let (message, _) = peer.receive(&ack);
    assert!(matches!(message, P2pMessage::HelloAck(_)));
    for reply in replies {
        endpoint.push_message(reply).await;
    }
}
