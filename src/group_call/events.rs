use bytes::Bytes;
use gccore::types::{EndReason, MediaKind, ParticipantId};
use tokio::sync::{broadcast, watch};

/// Coarse session state as seen from outside the session task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Lookup,
    Joining,
    Connecting,
    Connected,
    Ending,
    Ended,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupCallEvent {
    StateChanged(SessionPhase),
    ParticipantJoined {
        participant: ParticipantId,
        identity: String,
    },
    ParticipantLeft {
        participant: ParticipantId,
    },
    /// Participants in the call, including us.
    ParticipantCountChanged(usize),
    RemoteCaptureStateChanged {
        participant: ParticipantId,
        kind: MediaKind,
        on: bool,
    },
    AppDataReceived {
        from: ParticipantId,
        data: Vec<u8>,
    },
    MediaFrameReceived {
        from: ParticipantId,
        frame: Bytes,
    },
    /// Local capture failed. The call keeps running.
    CaptureError(String),
    Ended(EndReason),
}

/// Latest values observers can poll without subscribing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub phase: SessionPhase,
    pub participant_count: usize,
    pub end_reason: Option<EndReason>,
}

impl Default for SessionSnapshot {
    fn default() -> Self {
        Self {
            phase: SessionPhase::Lookup,
            participant_count: 0,
            end_reason: None,
        }
    }
}

/// Fan-out of session events. Publishing never blocks: slow subscribers lag
/// and lose events, dropped subscribers are simply gone.
#[derive(Clone)]
pub struct EventPublisher {
    events: broadcast::Sender<GroupCallEvent>,
    snapshot: watch::Sender<SessionSnapshot>,
}

impl EventPublisher {
    pub fn new(capacity: usize) -> Self {
        Self {
            events: broadcast::channel(capacity.max(1)).0,
            snapshot: watch::Sender::new(SessionSnapshot::default()),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GroupCallEvent> {
        self.events.subscribe()
    }

    pub fn watch(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot.subscribe()
    }

    pub fn publish(&self, event: GroupCallEvent) {
        match &event {
            GroupCallEvent::StateChanged(phase) => {
                let phase = *phase;
                self.snapshot.send_modify(|s| s.phase = phase);
            }
            GroupCallEvent::ParticipantCountChanged(count) => {
                let count = *count;
                self.snapshot.send_modify(|s| s.participant_count = count);
            }
            GroupCallEvent::Ended(reason) => {
                let reason = reason.clone();
                self.snapshot.send_modify(|s| {
                    s.phase = SessionPhase::Ended;
                    s.participant_count = 0;
                    s.end_reason = Some(reason);
                });
            }
            _ => {}
        }
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}
