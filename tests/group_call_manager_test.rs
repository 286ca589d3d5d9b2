mod common;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, TimeZone, Utc};
use common::*;
use gccore::net::{HttpResponse, SfuTokenProvider};
use gccore::types::EndReason;
use groupcall::config::ManagerConfig;
use groupcall::group_call::{CallError, GroupCallManager};
use std::sync::Arc;
use std::time::Duration;

fn manager(http: Arc<ScriptedSfu>) -> (Arc<GroupCallManager>, Harness) {
    let harness = Harness::new(http, 5);
    let config = ManagerConfig {
        max_peek_failures: 2,
        call: test_config(),
        ..ManagerConfig::default()
    };
    let manager = GroupCallManager::new("alice", harness.deps.clone(), config);
    (manager, harness)
}

/// Peeks answer with the status registered for the SFU host.
fn by_host(routes: Vec<(&'static str, HttpResponse)>) -> Arc<ScriptedSfu> {
    ScriptedSfu::new(move |request| {
        routes
            .iter()
            .find(|(host, _)| request.url.starts_with(host))
            .map(|(_, response)| response.clone())
            .unwrap_or_else(|| HttpResponse::empty(500))
    })
}

#[tokio::test]
async fn announcing_the_same_call_twice_is_a_noop() {
    init_logger();

    let (manager, _harness) = manager(ScriptedSfu::queued(vec![], vec![]));
    let now = Utc::now();
    let first = manager
        .register_call_start(group(), start_data(SFU_URL, 1), now)
        .await;
    let second = manager
        .register_call_start(group(), start_data(SFU_URL, 1), now)
        .await;
    assert_eq!(first, second);
    assert_eq!(manager.proposed_calls(&group()).await.len(), 1);
    assert_eq!(first, call_identity().call_id());
}

#[tokio::test]
async fn refresh_forgets_calls_that_are_over() {
    init_logger();

    let (manager, harness) = manager(by_host(vec![
        ("https://running.example.com", peek_running(1_700_000_000_000)),
        ("https://gone.example.com", response(404, "")),
    ]));
    let now = Utc::now();
    let running = manager
        .register_call_start(group(), start_data("https://running.example.com", 1), now)
        .await;
    let gone = manager
        .register_call_start(group(), start_data("https://gone.example.com", 1), now)
        .await;
    let too_new = manager
        .register_call_start(group(), start_data("https://running.example.com", 99), now)
        .await;

    let removed = manager.refresh().await;
    assert_eq!(removed.len(), 2);
    assert!(removed.contains(&gone));
    assert!(removed.contains(&too_new));

    let left = manager.proposed_calls(&group()).await;
    assert_eq!(left.len(), 1);
    assert_eq!(left[0].identity.call_id(), running);
    assert_eq!(
        left[0].started_at,
        Some(Utc.timestamp_millis_opt(1_700_000_000_000).unwrap())
    );
    // The unsupported call was dropped without asking the SFU.
    assert_eq!(harness.http.requests().len(), 2);
}

#[tokio::test]
async fn failed_peeks_are_tolerated_up_to_a_limit() {
    init_logger();

    let (manager, _harness) = manager(by_host(vec![(
        "https://flaky.example.com",
        response(500, ""),
    )]));
    let call = manager
        .register_call_start(group(), start_data("https://flaky.example.com", 1), Utc::now())
        .await;

    assert!(manager.refresh().await.is_empty());
    let proposed = manager.proposed_calls(&group()).await;
    assert_eq!(proposed[0].failed_peeks, 1);

    assert_eq!(manager.refresh().await, vec![call]);
    assert!(manager.proposed_calls(&group()).await.is_empty());
}

#[tokio::test]
async fn stale_calls_go_on_the_first_failure() {
    init_logger();

    let (manager, _harness) = manager(by_host(vec![]));
    let long_ago = Utc::now() - ChronoDuration::hours(11);
    let call = manager
        .register_call_start(group(), start_data(SFU_URL, 1), long_ago)
        .await;
    assert_eq!(manager.refresh().await, vec![call]);
}

#[tokio::test]
async fn the_latest_started_call_is_chosen() {
    init_logger();

    let (manager, _harness) = manager(by_host(vec![
        ("https://old.example.com", peek_running(1_000)),
        ("https://new.example.com", peek_running(2_000)),
    ]));
    let now = Utc::now();
    manager
        .register_call_start(group(), start_data("https://new.example.com", 1), now)
        .await;
    manager
        .register_call_start(group(), start_data("https://old.example.com", 1), now)
        .await;
    manager.refresh().await;

    let chosen = manager.chosen_call(&group()).await.unwrap();
    assert_eq!(chosen.sfu_base_url, "https://new.example.com");
}

#[tokio::test]
async fn only_one_call_at_a_time() {
    init_logger();

    let (manager, mut harness) = manager(ScriptedSfu::queued(
        vec![peek_running(1)],
        vec![joined(1, &[])],
    ));
    assert!(matches!(
        manager.join(&group()).await,
        Err(CallError::NoCallForGroup(_))
    ));

    manager
        .register_call_start(group(), start_data(SFU_URL, 1), Utc::now())
        .await;
    let handle = manager.join(&group()).await.unwrap();
    let _endpoint = harness.next_endpoint().await;
    assert!(matches!(
        manager.join(&group()).await,
        Err(CallError::AlreadyInCall)
    ));
    assert!(manager.active_call().await.is_some());

    manager.leave_all().await;
    assert_eq!(within(handle.wait_ended()).await, EndReason::ForcedLeave);
    assert!(manager.active_call().await.is_none());
}

/// Token source that never answers.
struct StuckTokens;

#[async_trait]
impl SfuTokenProvider for StuckTokens {
    async fn fetch_token(&self) -> Result<String> {
        std::future::pending().await
    }
}

#[tokio::test]
async fn stuck_token_source_counts_as_a_failed_peek() {
    init_logger();

    let mut harness = Harness::new(by_host(vec![(SFU_URL, peek_running(1))]), 5);
    harness.deps.tokens = Arc::new(StuckTokens);
    let config = ManagerConfig {
        max_peek_failures: 2,
        call: groupcall::GroupCallConfig {
            http_timeout: Duration::from_millis(50),
            ..test_config()
        },
        ..ManagerConfig::default()
    };
    let manager = GroupCallManager::new("alice", harness.deps.clone(), config);
    manager
        .register_call_start(group(), start_data(SFU_URL, 1), Utc::now())
        .await;

    assert!(within(manager.refresh()).await.is_empty());
    assert_eq!(manager.proposed_calls(&group()).await[0].failed_peeks, 1);
    assert!(harness.http.requests().is_empty());
}
