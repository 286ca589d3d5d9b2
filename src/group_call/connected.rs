//! The message loop of a connected session.

use bytes::Bytes;
use gccore::GroupCallError;
use gccore::codec::{self, P2pMessage, RelayEnvelope, SfuMessage, SfuRequest};
use gccore::frame::{MediaKeySet, encrypt_frame};
use gccore::handshake::{HandshakeRole, PendingParticipant};
use gccore::net::PeerConnectionEvent;
use gccore::types::{EndReason, MediaKind, ParticipantId};
use log::{debug, error, info, warn};
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use zeroize::Zeroizing;

use super::context::{ConnectedContext, SessionCommand};
use super::events::GroupCallEvent;
use super::state::{GroupCallSession, Interrupt, interrupted};

/// Whether the loop keeps going after an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Flow {
    Continue,
    End(EndReason),
}

enum LoopEvent {
    Interrupted(EndReason),
    Transport(Option<PeerConnectionEvent>),
    Command(Option<SessionCommand>),
    ApplyRekey,
    PublishCallState,
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Unbiased race between transport, user actions and timers.
async fn next_event(
    ctx: &mut ConnectedContext,
    commands: &mut mpsc::Receiver<SessionCommand>,
    call_state_timer: &mut Interval,
) -> LoopEvent {
    let rekey_deadline = ctx.rekey_deadline;
    let publishes_call_state = ctx.publishes_call_state();
    tokio::select! {
        event = ctx.events.recv() => LoopEvent::Transport(event),
        command = commands.recv() => LoopEvent::Command(command),
        _ = sleep_until_deadline(rekey_deadline) => LoopEvent::ApplyRekey,
        _ = call_state_timer.tick(), if publishes_call_state => LoopEvent::PublishCallState,
    }
}

impl GroupCallSession {
    pub(crate) async fn run_connected(
        &mut self,
        ctx: &mut ConnectedContext,
        cancel: &mut watch::Receiver<Interrupt>,
    ) -> EndReason {
        info!(
            target: "GroupCall/Connected",
            "[{}] In call as {} with {} other participant(s)",
            self.log_id(),
            ctx.local_id,
            ctx.registry.count()
        );
        self.events
            .publish(GroupCallEvent::ParticipantCountChanged(ctx.participant_count()));

        let mut call_state_timer = tokio::time::interval(self.config.call_state_update_interval);
        call_state_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            // Interrupts win ties with anything already queued.
            let event = tokio::select! {
                biased;
                reason = interrupted(cancel) => LoopEvent::Interrupted(reason),
                event = next_event(ctx, &mut self.commands, &mut call_state_timer) => event,
            };

            let result = match event {
                LoopEvent::Interrupted(reason) => return reason,
                LoopEvent::Transport(Some(event)) => self.handle_transport_event(ctx, event, true).await,
                LoopEvent::Transport(None) => {
                    info!(target: "GroupCall/Connected", "[{}] Peer connection event stream closed", self.log_id());
                    Ok(Flow::End(EndReason::Disconnected))
                }
                LoopEvent::Command(Some(command)) => self.handle_command(ctx, command).await,
                LoopEvent::Command(None) => {
                    info!(target: "GroupCall/Connected", "[{}] All call handles dropped", self.log_id());
                    Ok(Flow::End(EndReason::ForcedLeave))
                }
                LoopEvent::ApplyRekey => {
                    self.apply_local_rekey(ctx);
                    Ok(Flow::Continue)
                }
                LoopEvent::PublishCallState => self.publish_call_state(ctx).await,
            };

            match result {
                Ok(Flow::Continue) if !ctx.transport_open => {
                    warn!(target: "GroupCall/Connected", "[{}] Transport lost", self.log_id());
                    return EndReason::Disconnected;
                }
                Ok(Flow::Continue) => {}
                Ok(Flow::End(reason)) => return reason,
                Err(e) if !e.is_fatal() => self.report_capture_error(e.to_string()),
                Err(e) => {
                    error!(target: "GroupCall/Connected", "[{}] Fatal error: {e}", self.log_id());
                    return EndReason::Failed(e);
                }
            }
        }
    }

    pub(crate) fn local_hello(&self, ctx: &ConnectedContext) -> P2pMessage {
        P2pMessage::Hello {
            identity: self.local_identity.clone(),
            public_key: ctx.key_pair.public_key(),
        }
    }

    /// Handles one peer connection event. Before the session is connected,
    /// media frames are dropped.
    pub(crate) async fn handle_transport_event(
        &self,
        ctx: &mut ConnectedContext,
        event: PeerConnectionEvent,
        connected: bool,
    ) -> Result<Flow, GroupCallError> {
        match event {
            PeerConnectionEvent::Connected => {
                debug!(target: "GroupCall/Connected", "[{}] Duplicate connected event", self.log_id());
                Ok(Flow::Continue)
            }
            PeerConnectionEvent::Disconnected => {
                info!(target: "GroupCall/Connected", "[{}] Peer connection disconnected", self.log_id());
                ctx.transport_open = false;
                Ok(Flow::End(EndReason::Disconnected))
            }
            PeerConnectionEvent::Failed(reason) => {
                warn!(target: "GroupCall/Connected", "[{}] Peer connection failed: {reason}", self.log_id());
                ctx.transport_open = false;
                Ok(Flow::End(EndReason::Disconnected))
            }
            PeerConnectionEvent::CaptureError(reason) => Err(GroupCallError::CaptureError(reason)),
            PeerConnectionEvent::MediaFrame { sender, frame } => {
                if !connected || !ctx.registry.contains(sender) {
                    debug!(target: "GroupCall/Connected", "[{}] Dropping media frame from {sender}", self.log_id());
                    return Ok(Flow::Continue);
                }
                let plaintext = ctx.registry.decrypt(sender, &frame)?;
                self.events.publish(GroupCallEvent::MediaFrameReceived {
                    from: sender,
                    frame: Bytes::from(plaintext),
                });
                Ok(Flow::Continue)
            }
            PeerConnectionEvent::Message(bytes) => {
                let message = codec::decode_sfu_message(&bytes)?;
                self.handle_sfu_message(ctx, message).await
            }
        }
    }

    async fn handle_sfu_message(
        &self,
        ctx: &mut ConnectedContext,
        message: SfuMessage,
    ) -> Result<Flow, GroupCallError> {
        match message {
            SfuMessage::Relay(envelope) => self.handle_relay(ctx, envelope).await,
            SfuMessage::Hello(ids) => {
                let unknown: Vec<ParticipantId> = ids
                    .into_iter()
                    .filter(|id| {
                        *id != ctx.local_id
                            && !ctx.registry.contains(*id)
                            && !ctx.pending.contains_key(id)
                    })
                    .collect();
                if !unknown.is_empty() {
                    warn!(target: "GroupCall/Connected", "[{}] SFU lists unknown participants {unknown:?}", self.log_id());
                }
                Ok(Flow::Continue)
            }
            SfuMessage::ParticipantJoined(id) => self.handle_participant_joined(ctx, id),
            SfuMessage::ParticipantLeft(id) => self.handle_participant_left(ctx, id).await,
        }
    }

    fn handle_participant_joined(
        &self,
        ctx: &mut ConnectedContext,
        id: ParticipantId,
    ) -> Result<Flow, GroupCallError> {
        if id == ctx.local_id || ctx.registry.contains(id) || ctx.pending.contains_key(&id) {
            return Err(GroupCallError::SfuProtocolViolation(format!(
                "participant {id} announced twice"
            )));
        }
        info!(target: "GroupCall/Connected", "[{}] Participant {id} is joining", self.log_id());

        ctx.local_keys.ratchet()?;
        ctx.registry.ratchet_all()?;
        ctx.pending
            .insert(id, PendingParticipant::new(id, HandshakeRole::Responder));
        Ok(Flow::Continue)
    }

    async fn handle_participant_left(
        &self,
        ctx: &mut ConnectedContext,
        id: ParticipantId,
    ) -> Result<Flow, GroupCallError> {
        if id == ctx.local_id {
            info!(target: "GroupCall/Connected", "[{}] SFU removed us from the call", self.log_id());
            return Ok(Flow::End(EndReason::Disconnected));
        }

        let was_pending = ctx.pending.remove(&id).is_some();
        ctx.local_keys.ratchet()?;
        let was_registered = ctx.registry.remove(id)?;
        if !was_registered {
            ctx.registry.ratchet_all()?;
        }

        if was_registered {
            info!(target: "GroupCall/Connected", "[{}] Participant {id} left", self.log_id());
            self.events
                .publish(GroupCallEvent::ParticipantLeft { participant: id });
            self.events
                .publish(GroupCallEvent::ParticipantCountChanged(ctx.participant_count()));
        } else if was_pending {
            debug!(target: "GroupCall/Connected", "[{}] Participant {id} left during handshake", self.log_id());
        } else {
            warn!(target: "GroupCall/Connected", "[{}] Unknown participant {id} left", self.log_id());
            return Ok(Flow::Continue);
        }

        self.start_rekey(ctx).await?;
        Ok(Flow::Continue)
    }

    /// Announces a fresh random key so that whoever left cannot follow the
    /// ratchet. It is used locally once `rekey_apply_delay` has passed.
    async fn start_rekey(&self, ctx: &mut ConnectedContext) -> Result<(), GroupCallError> {
        let key_set = ctx
            .local_keys
            .newest()
            .rekeyed(*self.deps.crypto.random_key())?;
        let epoch = key_set.epoch();
        ctx.local_keys.set_pending(key_set.clone())?;
        ctx.broadcast(self.deps.crypto.as_ref(), &P2pMessage::Rekey(key_set))
            .await?;
        ctx.rekey_deadline = Some(Instant::now() + self.config.rekey_apply_delay);
        debug!(target: "GroupCall/Connected", "[{}] Announced rekey to epoch {epoch}", self.log_id());
        Ok(())
    }

    fn apply_local_rekey(&self, ctx: &mut ConnectedContext) {
        ctx.rekey_deadline = None;
        if ctx.local_keys.apply_pending() {
            debug!(
                target: "GroupCall/Connected",
                "[{}] Now sending with epoch {}",
                self.log_id(),
                ctx.local_keys.epoch()
            );
        }
    }

    async fn handle_relay(
        &self,
        ctx: &mut ConnectedContext,
        envelope: RelayEnvelope,
    ) -> Result<Flow, GroupCallError> {
        if envelope.receiver != ctx.local_id {
            return Err(GroupCallError::SfuProtocolViolation(format!(
                "relay for {} delivered to {}",
                envelope.receiver, ctx.local_id
            )));
        }
        let sender = envelope.sender;

        let key = if let Some(participant) = ctx.registry.get(sender) {
            Zeroizing::new(*participant.pairwise_key())
        } else if let Some(pending) = ctx.pending.get(&sender) {
            Zeroizing::new(*pending.pairwise_key().unwrap_or(ctx.keys.gchk()))
        } else {
            debug!(target: "GroupCall/Connected", "[{}] Dropping relay from unknown participant {sender}", self.log_id());
            return Ok(Flow::Continue);
        };
        let message = codec::open_p2p(self.deps.crypto.as_ref(), &key, &envelope.encrypted_data)?;
        debug!(target: "GroupCall/Connected", "[{}] {} from {sender}", self.log_id(), message.name());

        match message {
            P2pMessage::Hello {
                identity,
                public_key,
            } => self.handle_hello(ctx, sender, identity, public_key).await,
            P2pMessage::HelloAck(key_set) => self.handle_hello_ack(ctx, sender, key_set).await,
            P2pMessage::Rekey(key_set) => {
                ctx.registry.apply_rekey(sender, key_set)?;
                Ok(Flow::Continue)
            }
            P2pMessage::CaptureState { kind, on } => {
                if ctx.registry.set_capture_state(sender, kind, on)? {
                    self.events.publish(GroupCallEvent::RemoteCaptureStateChanged {
                        participant: sender,
                        kind,
                        on,
                    });
                }
                Ok(Flow::Continue)
            }
            P2pMessage::AppData(data) => {
                if !ctx.registry.contains(sender) {
                    return Err(GroupCallError::BadParticipantState(sender.get()));
                }
                self.events
                    .publish(GroupCallEvent::AppDataReceived { from: sender, data });
                Ok(Flow::Continue)
            }
        }
    }

    async fn handle_hello(
        &self,
        ctx: &mut ConnectedContext,
        sender: ParticipantId,
        identity: String,
        public_key: [u8; 32],
    ) -> Result<Flow, GroupCallError> {
        let crypto = self.deps.crypto.as_ref();
        let Some(pending) = ctx.pending.get_mut(&sender) else {
            return Err(GroupCallError::RemoteProtocolViolation(format!(
                "Hello from {sender} after the handshake"
            )));
        };
        pending.handle_hello(crypto, &ctx.keys, &ctx.key_pair, identity, &public_key)?;
        let role = pending.role();
        let pairwise = Zeroizing::new(*pending.pairwise_key().ok_or_else(|| {
            GroupCallError::LocalProtocolViolation(format!("no pairwise key for {sender}"))
        })?);
        let media_key = ctx.local_keys.current().clone();
        pending.record_hello_ack(&media_key);

        if role == HandshakeRole::Responder {
            let hello = self.local_hello(ctx);
            let gchk = Zeroizing::new(*ctx.keys.gchk());
            ctx.send_to_participant(crypto, sender, &gchk, &hello).await?;
        }
        ctx.send_to_participant(crypto, sender, &pairwise, &P2pMessage::HelloAck(media_key))
            .await?;
        Ok(Flow::Continue)
    }

    async fn handle_hello_ack(
        &self,
        ctx: &mut ConnectedContext,
        sender: ParticipantId,
        key_set: MediaKeySet,
    ) -> Result<Flow, GroupCallError> {
        let crypto = self.deps.crypto.as_ref();
        let Some(pending) = ctx.pending.remove(&sender) else {
            return Err(GroupCallError::RemoteProtocolViolation(format!(
                "HelloAck from {sender} after the handshake"
            )));
        };
        let acked_key_is_stale = pending.acked_key_is_stale(ctx.local_keys.current());
        let result = pending.handle_hello_ack(key_set)?;
        let participant = ctx.registry.add(sender, result)?;
        let identity = participant.identity().to_string();
        let pairwise = Zeroizing::new(*participant.pairwise_key());

        info!(target: "GroupCall/Connected", "[{}] Participant {sender} ({identity}) joined", self.log_id());
        self.events.publish(GroupCallEvent::ParticipantJoined {
            participant: sender,
            identity,
        });
        self.events
            .publish(GroupCallEvent::ParticipantCountChanged(ctx.participant_count()));

        for (kind, on) in [(MediaKind::Audio, ctx.audio_on), (MediaKind::Video, ctx.video_on)] {
            if on {
                ctx.send_to_participant(crypto, sender, &pairwise, &P2pMessage::CaptureState { kind, on })
                    .await?;
            }
        }
        // Membership changed after our HelloAck went out.
        if acked_key_is_stale {
            let current = ctx.local_keys.current().clone();
            debug!(
                target: "GroupCall/Connected",
                "[{}] Sending {sender} media key epoch {} after the handshake",
                self.log_id(),
                current.epoch()
            );
            ctx.send_to_participant(crypto, sender, &pairwise, &P2pMessage::Rekey(current))
                .await?;
        }
        if let Some(key_set) = ctx.local_keys.pending().cloned() {
            ctx.send_to_participant(crypto, sender, &pairwise, &P2pMessage::Rekey(key_set))
                .await?;
        }
        Ok(Flow::Continue)
    }

    async fn handle_command(
        &self,
        ctx: &mut ConnectedContext,
        command: SessionCommand,
    ) -> Result<Flow, GroupCallError> {
        let crypto = self.deps.crypto.as_ref();
        match command {
            SessionCommand::SetCapture { kind, on } => {
                ctx.connection
                    .set_capture(kind, on)
                    .await
                    .map_err(|e| GroupCallError::CaptureError(format!("{e:#}")))?;
                match kind {
                    MediaKind::Audio => ctx.audio_on = on,
                    MediaKind::Video => ctx.video_on = on,
                }
                ctx.broadcast(crypto, &P2pMessage::CaptureState { kind, on })
                    .await?;
            }
            SessionCommand::SetVideoSubscription {
                participant,
                subscribe,
            } => {
                if !ctx.registry.contains(participant) {
                    warn!(target: "GroupCall/Connected", "[{}] Cannot change video subscription of unknown {participant}", self.log_id());
                    return Ok(Flow::Continue);
                }
                ctx.registry.set_video_subscribed(participant, subscribe)?;
                ctx.send_to_sfu(crypto, &SfuRequest::RequestVideo { participant, subscribe })
                    .await;
            }
            SessionCommand::SendAppData { to, data } => {
                let Some(participant) = ctx.registry.get(to) else {
                    warn!(target: "GroupCall/Connected", "[{}] Dropping app data for unknown {to}", self.log_id());
                    return Ok(Flow::Continue);
                };
                let key = Zeroizing::new(*participant.pairwise_key());
                ctx.send_to_participant(crypto, to, &key, &P2pMessage::AppData(data))
                    .await?;
            }
            SessionCommand::SendMediaFrame { kind, frame } => {
                let encrypted = encrypt_frame(&frame, ctx.local_keys.current_mut())?;
                if let Err(e) = ctx.connection.send_media_frame(kind, &encrypted).await {
                    warn!(target: "GroupCall/Connected", "[{}] Sending media failed: {e:?}", self.log_id());
                    ctx.transport_open = false;
                }
            }
            SessionCommand::Leave => return Ok(Flow::End(EndReason::LocalLeave)),
        }
        Ok(Flow::Continue)
    }

    async fn publish_call_state(&self, ctx: &mut ConnectedContext) -> Result<Flow, GroupCallError> {
        if !ctx.publishes_call_state() {
            return Ok(Flow::Continue);
        }
        let crypto = self.deps.crypto.as_ref();
        let state = ctx.call_state(&self.local_identity);
        let sealed = codec::encrypt_call_state(crypto, &ctx.keys, &state)?;
        debug!(
            target: "GroupCall/Connected",
            "[{}] Publishing call state with {} participant(s)",
            self.log_id(),
            state.participants.len()
        );
        ctx.send_to_sfu(crypto, &SfuRequest::UpdateCallState(sealed))
            .await;
        Ok(Flow::Continue)
    }
}
