//! Session state machine: Lookup → Joining → Connecting → Connected → Ending → Ended.
//!
//! Every state is a variant of [`SessionState`]; [`GroupCallSession::advance`]
//! does the work of one state and returns the next one. Any step may fail with
//! a [`GroupCallError`]; the failure is turned into `Ending` in exactly one
//! place, at the bottom of `advance`. Steps that can wait on the network are
//! raced against the interrupt channel so a forced leave is never stuck
//! behind a slow SFU.

use chrono::Utc;
use gccore::GroupCallError;
use gccore::codec::{self, CallStateSnapshot, SfuRequest};
use gccore::crypto::{CallCrypto, KeyPair};
use gccore::frame::{MediaKeyHistory, MediaKeySet};
use gccore::handshake::{HandshakeRole, PendingParticipant};
use gccore::keys::GroupCallKeys;
use gccore::net::{
    ConnectionParams, HttpClient, PeerConnectionEvent, PeerConnectionFactory, SfuTokenProvider,
};
use gccore::registry::ParticipantRegistry;
use gccore::types::{CallIdentity, EndReason, MediaKind, ParticipantId};
use log::{debug, error, info, warn};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

use super::connected::Flow;
use super::context::{ConnectedContext, SessionCommand};
use super::events::{EventPublisher, GroupCallEvent, SessionPhase};
use super::sfu::{self, JoinInfo, JoinOutcome, PeekOutcome, SfuClient};

/// Collaborators a session talks to.
#[derive(Clone)]
pub struct GroupCallDeps {
    pub http: Arc<dyn HttpClient>,
    pub tokens: Arc<dyn SfuTokenProvider>,
    pub connections: Arc<dyn PeerConnectionFactory>,
    pub crypto: Arc<dyn CallCrypto>,
}

/// Out-of-band signal that overrides the command queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum Interrupt {
    #[default]
    Running,
    Leave,
    ForceLeave,
}

impl Interrupt {
    pub fn end_reason(self) -> Option<EndReason> {
        match self {
            Self::Running => None,
            Self::Leave => Some(EndReason::LocalLeave),
            Self::ForceLeave => Some(EndReason::ForcedLeave),
        }
    }
}

/// Resolves once the session has been interrupted.
pub(crate) async fn interrupted(cancel: &mut watch::Receiver<Interrupt>) -> EndReason {
    loop {
        if let Some(reason) = cancel.borrow_and_update().end_reason() {
            return reason;
        }
        if cancel.changed().await.is_err() {
            return EndReason::ForcedLeave;
        }
    }
}

pub enum SessionState {
    Lookup,
    Joining {
        token: String,
    },
    Connecting {
        join: JoinInfo,
        key_pair: KeyPair,
    },
    Connected(Box<ConnectedContext>),
    Ending {
        reason: EndReason,
        context: Option<Box<ConnectedContext>>,
    },
    Ended(EndReason),
}

impl SessionState {
    pub fn phase(&self) -> SessionPhase {
        match self {
            Self::Lookup => SessionPhase::Lookup,
            Self::Joining { .. } => SessionPhase::Joining,
            Self::Connecting { .. } => SessionPhase::Connecting,
            Self::Connected(_) => SessionPhase::Connected,
            Self::Ending { .. } => SessionPhase::Ending,
            Self::Ended(_) => SessionPhase::Ended,
        }
    }
}

/// Why a step did not produce its successor state.
pub(crate) struct StepFailure {
    reason: EndReason,
    context: Option<Box<ConnectedContext>>,
}

impl From<GroupCallError> for StepFailure {
    fn from(err: GroupCallError) -> Self {
        EndReason::Failed(err).into()
    }
}

impl From<EndReason> for StepFailure {
    fn from(reason: EndReason) -> Self {
        Self {
            reason,
            context: None,
        }
    }
}

/// One attempt at being in a call, owned by a single task.
pub struct GroupCallSession {
    pub(crate) identity: CallIdentity,
    pub(crate) local_identity: String,
    pub(crate) deps: GroupCallDeps,
    pub(crate) config: crate::config::GroupCallConfig,
    pub(crate) events: EventPublisher,
    pub(crate) commands: mpsc::Receiver<SessionCommand>,
    pub(crate) interrupt: watch::Receiver<Interrupt>,
    sfu: Option<SfuClient>,
    peeked_state: Option<CallStateSnapshot>,
}

impl GroupCallSession {
    pub fn new(
        identity: CallIdentity,
        local_identity: String,
        deps: GroupCallDeps,
        config: crate::config::GroupCallConfig,
        events: EventPublisher,
        commands: mpsc::Receiver<SessionCommand>,
        interrupt: watch::Receiver<Interrupt>,
    ) -> Self {
        Self {
            identity,
            local_identity,
            deps,
            config,
            events,
            commands,
            interrupt,
            sfu: None,
            peeked_state: None,
        }
    }

    pub(crate) fn log_id(&self) -> String {
        self.identity.call_id().log_id()
    }

    /// Drives a fresh attempt from `Lookup` to `Ended`.
    pub async fn run(&mut self) -> EndReason {
        self.sfu = None;
        self.peeked_state = None;
        let mut state = SessionState::Lookup;
        loop {
            let phase = state.phase();
            if let SessionState::Ended(reason) = state {
                info!(target: "GroupCall/Session", "[{}] Ended: {:?}", self.log_id(), reason);
                return reason;
            }
            info!(target: "GroupCall/Session", "[{}] -> {:?}", self.log_id(), phase);
            self.events.publish(GroupCallEvent::StateChanged(phase));
            state = self.advance(state).await;
        }
    }

    pub async fn advance(&mut self, state: SessionState) -> SessionState {
        let mut cancel = self.interrupt.clone();
        let step = match state {
            SessionState::Lookup => tokio::select! {
                biased;
                reason = interrupted(&mut cancel) => Err(reason.into()),
                next = self.lookup() => next,
            },
            SessionState::Joining { token } => tokio::select! {
                biased;
                reason = interrupted(&mut cancel) => Err(reason.into()),
                next = self.join(token) => next,
            },
            SessionState::Connecting { join, key_pair } => {
                self.connecting(join, key_pair, &mut cancel).await
            }
            SessionState::Connected(mut context) => {
                let reason = self.run_connected(&mut context, &mut cancel).await;
                Ok(SessionState::Ending {
                    reason,
                    context: Some(context),
                })
            }
            SessionState::Ending { reason, context } => {
                self.teardown(context).await;
                Ok(SessionState::Ended(reason))
            }
            SessionState::Ended(reason) => Ok(SessionState::Ended(reason)),
        };

        step.unwrap_or_else(|failure| {
            match &failure.reason {
                EndReason::Failed(e) => {
                    error!(target: "GroupCall/Session", "[{}] Session failed: {e}", self.log_id())
                }
                reason => {
                    info!(target: "GroupCall/Session", "[{}] Session interrupted: {reason:?}", self.log_id())
                }
            }
            SessionState::Ending {
                reason: failure.reason,
                context: failure.context,
            }
        })
    }

    async fn fetch_token(&self) -> Result<String, GroupCallError> {
        match tokio::time::timeout(self.config.http_timeout, self.deps.tokens.fetch_token()).await {
            Ok(Ok(token)) => Ok(token),
            Ok(Err(e)) => {
                warn!(target: "GroupCall/Sfu", "Could not fetch SFU token: {e:?}");
                Err(GroupCallError::InvalidToken)
            }
            Err(_) => {
                warn!(target: "GroupCall/Sfu", "Fetching the SFU token timed out");
                Err(GroupCallError::InvalidToken)
            }
        }
    }

    async fn lookup(&mut self) -> Result<SessionState, StepFailure> {
        let base_url = sfu::validate_base_url(
            &self.identity.sfu_base_url,
            &self.config.allowed_sfu_hostname_suffixes,
        )?;
        let sfu = SfuClient::new(self.deps.http.clone(), base_url, self.config.http_timeout);
        let token = self.fetch_token().await?;

        let call_id = self.identity.call_id();
        let info = match sfu
            .peek(&call_id, self.identity.protocol_version, &token)
            .await?
        {
            PeekOutcome::NotFound => {
                info!(target: "GroupCall/Session", "[{}] Call is not running anymore", self.log_id());
                return Ok(SessionState::Ending {
                    reason: EndReason::EndedInMeantime,
                    context: None,
                });
            }
            PeekOutcome::Running(info) => info,
        };
        self.sfu = Some(sfu);

        let keys = GroupCallKeys::derive(self.identity.call_key())?;
        let call_state = info.encrypted_call_state.as_deref().and_then(|sealed| {
            match codec::decrypt_call_state(self.deps.crypto.as_ref(), &keys, sealed) {
                Ok(state) => Some(state),
                Err(e) => {
                    warn!(target: "GroupCall/Session", "[{}] Ignoring undecryptable call state: {e}", self.log_id());
                    None
                }
            }
        });

        let max_participants = match info.max_participants {
            0 => self.config.max_participants,
            max => max,
        };
        if let Some(state) = &call_state {
            debug!(
                target: "GroupCall/Session",
                "[{}] Call started at {} has {} participant(s)",
                self.log_id(),
                info.started_at,
                state.participants.len()
            );
            if state.participants.len() >= max_participants as usize {
                return Err(GroupCallError::JoinError(format!(
                    "call is full ({max_participants} participants)"
                ))
                .into());
            }
        }
        self.peeked_state = call_state;

        Ok(SessionState::Joining { token })
    }

    async fn join(&mut self, token: String) -> Result<SessionState, StepFailure> {
        let sfu = self.sfu.clone().ok_or_else(|| {
            GroupCallError::LocalProtocolViolation("join without a preceding lookup".into())
        })?;
        let key_pair = self.deps.crypto.generate_key_pair();

        match sfu
            .join(
                &self.identity.call_id(),
                self.identity.protocol_version,
                &key_pair.public_key(),
                &token,
            )
            .await?
        {
            JoinOutcome::NotFound => {
                info!(target: "GroupCall/Session", "[{}] Call ended before we could join", self.log_id());
                Ok(SessionState::Ending {
                    reason: EndReason::EndedInMeantime,
                    context: None,
                })
            }
            JoinOutcome::Joined(join) => {
                info!(
                    target: "GroupCall/Session",
                    "[{}] Joined as {} with {} participant(s) present",
                    self.log_id(),
                    join.participant_id,
                    join.existing_participants.len()
                );
                Ok(SessionState::Connecting { join, key_pair })
            }
        }
    }

    async fn connecting(
        &mut self,
        join: JoinInfo,
        key_pair: KeyPair,
        cancel: &mut watch::Receiver<Interrupt>,
    ) -> Result<SessionState, StepFailure> {
        let existing = join.existing_participants.clone();
        let mut context = tokio::select! {
            biased;
            reason = interrupted(cancel) => return Err(reason.into()),
            context = self.open_connection(join, key_pair) => context?,
        };

        let outcome = tokio::select! {
            biased;
            reason = interrupted(cancel) => Err(reason),
            outcome = self.establish(&mut context, &existing) => outcome,
        };
        match outcome {
            Ok(()) => Ok(SessionState::Connected(context)),
            Err(reason) => Err(StepFailure {
                reason,
                context: Some(context),
            }),
        }
    }

    async fn open_connection(
        &self,
        join: JoinInfo,
        key_pair: KeyPair,
    ) -> Result<Box<ConnectedContext>, GroupCallError> {
        let crypto = self.deps.crypto.as_ref();
        let keys = GroupCallKeys::derive(self.identity.call_key())?;
        let local_keys = MediaKeyHistory::new(MediaKeySet::derive_initial(&crypto.random_key()[..])?);

        let params = ConnectionParams {
            sfu_base_url: self
                .sfu
                .as_ref()
                .map(|sfu| sfu.base_url().to_string())
                .unwrap_or_else(|| self.identity.sfu_base_url.clone()),
            local_participant: join.participant_id,
            ice_servers: join.ice_servers,
            audio_enabled: self.config.audio_on_join,
            video_enabled: self.config.video_on_join,
        };
        let (connection, events) = self
            .deps
            .connections
            .connect(params)
            .await
            .map_err(|e| GroupCallError::CreationError(format!("{e:#}")))?;

        let (call_created_by, call_created_at) = match &self.peeked_state {
            Some(state) => (state.created_by.clone(), state.created_at),
            None => (
                self.local_identity.clone(),
                Utc::now().timestamp_millis().max(0) as u64,
            ),
        };

        Ok(Box::new(ConnectedContext {
            local_id: join.participant_id,
            connection,
            events,
            key_pair,
            keys,
            local_keys,
            registry: ParticipantRegistry::new(),
            pending: BTreeMap::new(),
            rekey_deadline: None,
            audio_on: false,
            video_on: false,
            call_created_by,
            call_created_at,
            transport_open: false,
        }))
    }

    /// Waits for the transport, then greets everybody already in the call and
    /// completes those handshakes.
    async fn establish(
        &self,
        ctx: &mut ConnectedContext,
        existing: &[ParticipantId],
    ) -> Result<(), EndReason> {
        let crypto = self.deps.crypto.clone();

        let connect_deadline = Instant::now() + self.config.connect_timeout;
        while !ctx.transport_open {
            let event = match tokio::time::timeout_at(connect_deadline, ctx.events.recv()).await {
                Ok(event) => event,
                Err(_) => {
                    return Err(GroupCallError::CreationError(
                        "peer connection did not connect in time".into(),
                    )
                    .into());
                }
            };
            match event {
                Some(PeerConnectionEvent::Connected) => ctx.transport_open = true,
                Some(PeerConnectionEvent::Failed(reason)) => {
                    return Err(GroupCallError::CreationError(reason).into());
                }
                Some(PeerConnectionEvent::Disconnected) | None => {
                    return Err(EndReason::Disconnected);
                }
                Some(PeerConnectionEvent::CaptureError(reason)) => {
                    self.report_capture_error(reason);
                }
                Some(other) => {
                    debug!(target: "GroupCall/Session", "[{}] Ignoring {other:?} before connect", self.log_id());
                }
            }
        }
        info!(target: "GroupCall/Session", "[{}] Peer connection established", self.log_id());

        for (kind, on) in [
            (MediaKind::Audio, self.config.audio_on_join),
            (MediaKind::Video, self.config.video_on_join),
        ] {
            if !on {
                continue;
            }
            match ctx.connection.set_capture(kind, true).await {
                Ok(()) => match kind {
                    MediaKind::Audio => ctx.audio_on = true,
                    MediaKind::Video => ctx.video_on = true,
                },
                Err(e) => self.report_capture_error(format!("{e:#}")),
            }
        }

        let hello = self.local_hello(ctx);
        let gchk = zeroize::Zeroizing::new(*ctx.keys.gchk());
        for &id in existing {
            ctx.pending
                .insert(id, PendingParticipant::new(id, HandshakeRole::Initiator));
            ctx.send_to_participant(crypto.as_ref(), id, &gchk, &hello)
                .await
                .map_err(EndReason::Failed)?;
        }

        let handshake_deadline = Instant::now() + self.config.handshake_timeout;
        while ctx
            .pending
            .values()
            .any(|p| p.role() == HandshakeRole::Initiator)
        {
            if !ctx.transport_open {
                return Err(EndReason::Disconnected);
            }
            let event = tokio::time::timeout_at(handshake_deadline, ctx.events.recv())
                .await
                .map_err(|_| GroupCallError::JoinError("handshake timed out".into()))?;
            let Some(event) = event else {
                return Err(EndReason::Disconnected);
            };
            match self.handle_transport_event(ctx, event, false).await {
                Ok(Flow::Continue) => {}
                Ok(Flow::End(reason)) => return Err(reason),
                Err(e) if !e.is_fatal() => self.report_capture_error(e.to_string()),
                Err(e) => return Err(EndReason::Failed(e)),
            }
        }
        Ok(())
    }

    async fn teardown(&self, context: Option<Box<ConnectedContext>>) {
        let Some(mut ctx) = context else {
            return;
        };
        if ctx.transport_open {
            let leave = codec::encode_sfu_request(&SfuRequest::Leave, self.deps.crypto.padding());
            match tokio::time::timeout(self.config.http_timeout, ctx.connection.send(&leave)).await {
                Ok(Ok(())) => debug!(target: "GroupCall/Session", "[{}] Sent leave", self.log_id()),
                Ok(Err(e)) => {
                    warn!(target: "GroupCall/Session", "[{}] Could not send leave: {e:?}", self.log_id())
                }
                Err(_) => {
                    warn!(target: "GroupCall/Session", "[{}] Sending leave timed out", self.log_id())
                }
            }
        }
        ctx.connection.close().await;
        ctx.wipe();
    }

    pub(crate) fn report_capture_error(&self, reason: String) {
        warn!(target: "GroupCall/Session", "[{}] Capture error: {reason}", self.log_id());
        self.events.publish(GroupCallEvent::CaptureError(reason));
    }
}
