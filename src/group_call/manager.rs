//! Tracks calls announced for groups and owns the single active session.

use chrono::{DateTime, Utc};
use gccore::types::{CallId, CallIdentity, CallStartData, GroupIdentity};
use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;

use super::actor::{GroupCall, GroupCallHandle};
use super::error::CallError;
use super::sfu::{self, PeekOutcome, SfuClient};
use super::state::GroupCallDeps;
use crate::config::ManagerConfig;

/// A call somebody announced for a group.
#[derive(Debug, Clone)]
pub struct ProposedCall {
    pub identity: CallIdentity,
    pub received_at: DateTime<Utc>,
    /// Set once a peek confirmed the call is running.
    pub started_at: Option<DateTime<Utc>>,
    pub failed_peeks: u32,
}

enum PeekResult {
    Running(DateTime<Utc>),
    NotFound,
    Unusable,
    Failed,
}

pub struct GroupCallManager {
    local_identity: String,
    deps: GroupCallDeps,
    config: ManagerConfig,
    calls: RwLock<HashMap<GroupIdentity, Vec<ProposedCall>>>,
    active: Mutex<Option<GroupCallHandle>>,
}

impl GroupCallManager {
    pub fn new(
        local_identity: impl Into<String>,
        deps: GroupCallDeps,
        config: ManagerConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            local_identity: local_identity.into(),
            deps,
            config,
            calls: RwLock::new(HashMap::new()),
            active: Mutex::new(None),
        })
    }

    /// Records an announced call. Announcing the same call twice is a no-op.
    pub async fn register_call_start(
        &self,
        group: GroupIdentity,
        start: CallStartData,
        received_at: DateTime<Utc>,
    ) -> CallId {
        let identity = CallIdentity::new(group.clone(), start);
        let call_id = identity.call_id();

        let mut calls = self.calls.write().await;
        let proposed = calls.entry(group).or_default();
        if proposed.iter().any(|c| c.identity.call_id() == call_id) {
            debug!(target: "GroupCall/Manager", "Call {} already known", call_id.log_id());
        } else {
            info!(
                target: "GroupCall/Manager",
                "New call {} for group {}",
                call_id.log_id(),
                identity.group
            );
            proposed.push(ProposedCall {
                identity,
                received_at,
                started_at: None,
                failed_peeks: 0,
            });
        }
        call_id
    }

    pub async fn proposed_calls(&self, group: &GroupIdentity) -> Vec<ProposedCall> {
        self.calls
            .read()
            .await
            .get(group)
            .cloned()
            .unwrap_or_default()
    }

    /// The call to join for `group`: the one that started last.
    pub async fn chosen_call(&self, group: &GroupIdentity) -> Option<CallIdentity> {
        self.calls
            .read()
            .await
            .get(group)?
            .iter()
            .max_by_key(|c| (c.started_at, c.received_at))
            .map(|c| c.identity.clone())
    }

    async fn running_call_id(&self) -> Option<CallId> {
        self.active
            .lock()
            .await
            .as_ref()
            .filter(|handle| !handle.is_ended())
            .map(GroupCallHandle::call_id)
    }

    async fn peek(&self, identity: &CallIdentity) -> PeekResult {
        let log_id = identity.call_id().log_id();
        if identity.protocol_version > self.config.supported_protocol_version {
            info!(
                target: "GroupCall/Manager",
                "Call {log_id} uses unsupported protocol version {}",
                identity.protocol_version
            );
            return PeekResult::Unusable;
        }
        let base_url = match sfu::validate_base_url(
            &identity.sfu_base_url,
            &self.config.call.allowed_sfu_hostname_suffixes,
        ) {
            Ok(url) => url,
            Err(e) => {
                warn!(target: "GroupCall/Manager", "Call {log_id}: {e}");
                return PeekResult::Unusable;
            }
        };
        let token = match tokio::time::timeout(
            self.config.call.http_timeout,
            self.deps.tokens.fetch_token(),
        )
        .await
        {
            Ok(Ok(token)) => token,
            Ok(Err(e)) => {
                warn!(target: "GroupCall/Manager", "Call {log_id}: no SFU token: {e:?}");
                return PeekResult::Failed;
            }
            Err(_) => {
                warn!(target: "GroupCall/Manager", "Call {log_id}: fetching the SFU token timed out");
                return PeekResult::Failed;
            }
        };

        let sfu = SfuClient::new(self.deps.http.clone(), base_url, self.config.call.http_timeout);
        match sfu
            .peek(&identity.call_id(), identity.protocol_version, &token)
            .await
        {
            Ok(PeekOutcome::Running(info)) => PeekResult::Running(info.started_at),
            Ok(PeekOutcome::NotFound) => PeekResult::NotFound,
            Err(e) => {
                warn!(target: "GroupCall/Manager", "Peeking call {log_id} failed: {e}");
                PeekResult::Failed
            }
        }
    }

    /// Peeks every proposed call that has no running session and forgets
    /// the ones that are over. Returns the ids of the forgotten calls.
    pub async fn refresh(&self) -> Vec<CallId> {
        let running = self.running_call_id().await;
        let candidates: Vec<CallIdentity> = self
            .calls
            .read()
            .await
            .values()
            .flatten()
            .filter(|c| Some(c.identity.call_id()) != running)
            .map(|c| c.identity.clone())
            .collect();

        let mut results = Vec::with_capacity(candidates.len());
        for identity in candidates {
            let result = self.peek(&identity).await;
            results.push((identity.call_id(), result));
        }

        let now = Utc::now();
        let stale_age = chrono::Duration::from_std(self.config.stale_call_age)
            .unwrap_or(chrono::Duration::MAX);
        let mut removed = Vec::new();
        let mut calls = self.calls.write().await;
        for (call_id, result) in results {
            let Some(call) = calls
                .values_mut()
                .flatten()
                .find(|c| c.identity.call_id() == call_id)
            else {
                continue;
            };
            let keep = match result {
                PeekResult::Running(started_at) => {
                    call.started_at = Some(started_at);
                    call.failed_peeks = 0;
                    true
                }
                PeekResult::NotFound | PeekResult::Unusable => false,
                PeekResult::Failed => {
                    call.failed_peeks += 1;
                    call.failed_peeks < self.config.max_peek_failures
                        && now - call.received_at <= stale_age
                }
            };
            if !keep {
                info!(target: "GroupCall/Manager", "Forgetting call {}", call_id.log_id());
                removed.push(call_id);
            }
        }
        for proposed in calls.values_mut() {
            proposed.retain(|c| !removed.contains(&c.identity.call_id()));
        }
        calls.retain(|_, proposed| !proposed.is_empty());
        removed
    }

    /// Joins the chosen call of `group`.
    pub async fn join(&self, group: &GroupIdentity) -> Result<GroupCallHandle, CallError> {
        let mut active = self.active.lock().await;
        if active.as_ref().is_some_and(|handle| !handle.is_ended()) {
            return Err(CallError::AlreadyInCall);
        }
        let identity = self
            .chosen_call(group)
            .await
            .ok_or_else(|| CallError::NoCallForGroup(group.to_string()))?;

        info!(target: "GroupCall/Manager", "Joining call {}", identity.call_id().log_id());
        let handle = GroupCall::spawn(
            identity,
            self.local_identity.clone(),
            self.deps.clone(),
            self.config.call.clone(),
        );
        *active = Some(handle.clone());
        Ok(handle)
    }

    pub async fn active_call(&self) -> Option<GroupCallHandle> {
        self.active
            .lock()
            .await
            .as_ref()
            .filter(|handle| !handle.is_ended())
            .cloned()
    }

    /// Forces the active session, if any, to end.
    pub async fn leave_all(&self) {
        if let Some(handle) = self.active.lock().await.take() {
            info!(target: "GroupCall/Manager", "Leaving call {}", handle.call_id().log_id());
            handle.force_leave();
        }
    }

    /// Refreshes every `refresh_interval` until the manager is dropped.
    pub fn spawn_refresh_task(self: &Arc<Self>) -> JoinHandle<()> {
        let manager: Weak<Self> = Arc::downgrade(self);
        let interval = self.config.refresh_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let Some(manager) = manager.upgrade() else {
                    debug!(target: "GroupCall/Manager", "Manager dropped, stopping refresh");
                    return;
                };
                manager.refresh().await;
            }
        })
    }
}
