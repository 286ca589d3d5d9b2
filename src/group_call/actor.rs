//! Orchestrator: one task per call, driven through a [`GroupCallHandle`].

use gccore::types::{CallId, CallIdentity, EndReason, MediaKind, ParticipantId};
use log::info;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};

use super::context::SessionCommand;
use super::error::CallError;
use super::events::{EventPublisher, GroupCallEvent, SessionPhase, SessionSnapshot};
use super::state::{GroupCallDeps, GroupCallSession, Interrupt};
use crate::config::GroupCallConfig;

pub struct GroupCall;

impl GroupCall {
    /// Starts a session for `identity` on the current tokio runtime.
    pub fn spawn(
        identity: CallIdentity,
        local_identity: impl Into<String>,
        deps: GroupCallDeps,
        config: GroupCallConfig,
    ) -> GroupCallHandle {
        let (command_tx, command_rx) = mpsc::channel(config.command_capacity.max(1));
        let (interrupt_tx, interrupt_rx) = watch::channel(Interrupt::Running);
        let interrupt_tx = Arc::new(interrupt_tx);
        let events = EventPublisher::new(config.event_capacity);

        let handle = GroupCallHandle {
            call_id: identity.call_id(),
            commands: command_tx,
            interrupt: interrupt_tx.clone(),
            events: events.clone(),
            snapshot: events.watch(),
        };

        let session = GroupCallSession::new(
            identity,
            local_identity.into(),
            deps,
            config,
            events,
            command_rx,
            interrupt_rx,
        );
        tokio::spawn(run_session(session, interrupt_tx));
        handle
    }
}

async fn run_session(mut session: GroupCallSession, interrupt: Arc<watch::Sender<Interrupt>>) {
    let mut rejoins = 0;
    let reason = loop {
        let reason = session.run().await;
        let may_rejoin = reason == EndReason::Disconnected
            && session.config.rejoin_on_disconnect
            && rejoins < session.config.max_rejoin_attempts
            && interrupt.borrow().end_reason().is_none();
        if !may_rejoin {
            break reason;
        }
        rejoins += 1;
        info!(
            target: "GroupCall/Orchestrator",
            "[{}] Disconnected, rejoining (attempt {rejoins}/{})",
            session.log_id(),
            session.config.max_rejoin_attempts
        );
    };
    session.events.publish(GroupCallEvent::Ended(reason));
}

/// Cheap, cloneable control surface of a running call.
#[derive(Clone)]
pub struct GroupCallHandle {
    call_id: CallId,
    commands: mpsc::Sender<SessionCommand>,
    interrupt: Arc<watch::Sender<Interrupt>>,
    events: EventPublisher,
    snapshot: watch::Receiver<SessionSnapshot>,
}

impl GroupCallHandle {
    pub fn call_id(&self) -> CallId {
        self.call_id
    }

    async fn send(&self, command: SessionCommand) -> Result<(), CallError> {
        if self.is_ended() {
            return Err(CallError::SessionEnded);
        }
        self.commands
            .send(command)
            .await
            .map_err(|_| CallError::SessionEnded)
    }

    /// Leaves after every action queued so far. Before the session is
    /// connected there is nothing to flush and it leaves right away.
    pub async fn leave(&self) -> Result<(), CallError> {
        if self.state() == SessionPhase::Connected {
            self.send(SessionCommand::Leave).await
        } else {
            self.interrupt.send_if_modified(|current| {
                if *current == Interrupt::Running {
                    *current = Interrupt::Leave;
                    true
                } else {
                    false
                }
            });
            Ok(())
        }
    }

    /// Ends the session as soon as possible, skipping queued actions.
    pub fn force_leave(&self) {
        self.interrupt.send_replace(Interrupt::ForceLeave);
    }

    pub async fn mute_audio(&self) -> Result<(), CallError> {
        self.set_capture(MediaKind::Audio, false).await
    }

    pub async fn unmute_audio(&self) -> Result<(), CallError> {
        self.set_capture(MediaKind::Audio, true).await
    }

    pub async fn mute_video(&self) -> Result<(), CallError> {
        self.set_capture(MediaKind::Video, false).await
    }

    pub async fn unmute_video(&self) -> Result<(), CallError> {
        self.set_capture(MediaKind::Video, true).await
    }

    async fn set_capture(&self, kind: MediaKind, on: bool) -> Result<(), CallError> {
        self.send(SessionCommand::SetCapture { kind, on }).await
    }

    pub async fn subscribe_video(&self, participant: ParticipantId) -> Result<(), CallError> {
        self.send(SessionCommand::SetVideoSubscription {
            participant,
            subscribe: true,
        })
        .await
    }

    pub async fn unsubscribe_video(&self, participant: ParticipantId) -> Result<(), CallError> {
        self.send(SessionCommand::SetVideoSubscription {
            participant,
            subscribe: false,
        })
        .await
    }

    pub async fn send_app_data(&self, to: ParticipantId, data: Vec<u8>) -> Result<(), CallError> {
        self.send(SessionCommand::SendAppData { to, data }).await
    }

    pub async fn send_media_frame(&self, kind: MediaKind, frame: Vec<u8>) -> Result<(), CallError> {
        self.send(SessionCommand::SendMediaFrame { kind, frame })
            .await
    }

    /// Registers an observer. Dropping the receiver unsubscribes.
    pub fn subscribe(&self) -> broadcast::Receiver<GroupCallEvent> {
        self.events.subscribe()
    }

    pub fn state(&self) -> SessionPhase {
        self.snapshot.borrow().phase
    }

    pub fn participant_count(&self) -> usize {
        self.snapshot.borrow().participant_count
    }

    pub fn is_ended(&self) -> bool {
        self.snapshot.borrow().end_reason.is_some()
    }

    pub fn end_reason(&self) -> Option<EndReason> {
        self.snapshot.borrow().end_reason.clone()
    }

    /// Waits until the session has ended for good.
    pub async fn wait_ended(&self) -> EndReason {
        let mut snapshot = self.snapshot.clone();
        let reason = match snapshot.wait_for(|s| s.end_reason.is_some()).await {
            Ok(s) => s.end_reason.clone(),
            Err(_) => None,
        };
        reason.unwrap_or(EndReason::ForcedLeave)
    }
}
