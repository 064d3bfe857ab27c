use bulkcheck::{
    BulkCheckError, CancelPolicy, ConnectionInfo, ConnectivityMonitor, DispatchSettings,
    Dispatcher, DispatcherConfig, FailureReason, HttpResponse, IdentifierKind, MockHttpClient,
    SessionState, VoucherRule,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

const WEBHOOK: &str = "https://hook.example.com/webhook/check";

fn key() -> String {
    format!("POST {WEBHOOK}")
}

fn settings(batch_size: usize, max_retries: u32) -> DispatchSettings {
    DispatchSettings {
        batch_size,
        concurrency: 10,
        timeout_ms: 5_000,
        retry_delay_ms: 1,
        max_retries,
    }
}

fn config(batch_size: usize, max_retries: u32) -> DispatcherConfig {
    let mut config =
        DispatcherConfig::new(WEBHOOK).with_settings(settings(batch_size, max_retries));
    config.jitter_ms = 0;
    config
}

/// Answer every request with one `SimInfo` record per identifier sent.
fn echo_sim_info(http_client: &MockHttpClient) {
    http_client.set_responder(|request| {
        let records: Vec<serde_json::Value> = request
            .payload
            .numbers_or_serials
            .iter()
            .map(|n| serde_json::json!({ "nomor": n, "status": format!("ok:{n}") }))
            .collect();
        Ok(HttpResponse {
            status: 200,
            body: serde_json::json!({ "SimInfo": records }).to_string(),
        })
    });
}

async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let start = tokio::time::Instant::now();
    while start.elapsed() < timeout {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}

#[test_log::test(tokio::test)]
async fn test_phone_check_rejects_bad_prefix_without_sending_it() {
    let http_client = MockHttpClient::new();
    echo_sim_info(&http_client);
    let dispatcher = Dispatcher::new(
        http_client.clone(),
        ConnectivityMonitor::default(),
        config(5, 2),
    );

    let report = dispatcher
        .run_batch_check(["0895111", "badnum", "0896222"], ["tok-a"], IdentifierKind::Phone)
        .expect("Failed to start check")
        .wait()
        .await
        .expect("Session task failed");

    assert_eq!(report.state, SessionState::Completed);
    assert_eq!(report.slots.len(), 3);
    assert_eq!(report.slots[0].outcome().unwrap().status(), "ok:0895111");
    assert_eq!(
        report.slots[1].failure().map(FailureReason::to_error_message),
        Some("invalid prefix".to_string())
    );
    assert_eq!(report.slots[2].outcome().unwrap().status(), "ok:0896222");

    let calls = http_client.get_calls();
    assert_eq!(calls.len(), 1);
    assert!(!calls[0].identifiers.iter().any(|id| id == "badnum"));
    assert_eq!(calls[0].token, "tok-a");
}

#[test_log::test(tokio::test)]
async fn test_results_land_at_their_index_when_batches_finish_out_of_order() {
    let http_client = MockHttpClient::new();
    // First batch to reach the webhook is held until the second has finished
    let release_first = http_client.add_response_with_trigger(
        &key(),
        Ok(HttpResponse {
            status: 200,
            body: r#"[{"status":"first-a"},{"status":"first-b"}]"#.to_string(),
        }),
    );
    echo_sim_info(&http_client);

    let dispatcher = Dispatcher::new(
        http_client.clone(),
        ConnectivityMonitor::default(),
        config(2, 0),
    );

    // Duplicate and padded input collapses to four slots
    let handle = dispatcher
        .run_batch_check(
            ["0895000", "0895001", "0895000", " 0895002 ", "0895003"],
            ["tok-a", "tok-b"],
            IdentifierKind::Phone,
        )
        .expect("Failed to start check");

    assert!(
        wait_until(Duration::from_secs(5), || handle.progress().batches_done == 1).await,
        "Second batch should finish while the first is held"
    );
    let snapshot = handle.snapshot();
    assert!(snapshot[0].is_pending());
    assert!(snapshot[1].is_pending());
    assert!(snapshot[2].is_succeeded());

    release_first.send(()).unwrap();
    let report = handle.wait().await.unwrap();

    let identifiers: Vec<&str> = report.slots.iter().map(|s| s.identifier.as_str()).collect();
    assert_eq!(identifiers, vec!["0895000", "0895001", "0895002", "0895003"]);
    for (i, slot) in report.slots.iter().enumerate() {
        assert_eq!(slot.index, i);
    }

    let statuses: Vec<&str> = report
        .slots
        .iter()
        .map(|s| s.outcome().unwrap().status())
        .collect();
    assert_eq!(statuses, vec!["first-a", "first-b", "ok:0895002", "ok:0895003"]);
    assert_eq!(report.progress.succeeded, 4);
}

#[test_log::test(tokio::test)]
async fn test_tokens_rotate_round_robin_over_batches() {
    let http_client = MockHttpClient::new();
    echo_sim_info(&http_client);
    let dispatcher = Dispatcher::new(
        http_client.clone(),
        ConnectivityMonitor::default(),
        config(1, 0),
    );

    let numbers: Vec<String> = (0..7).map(|i| format!("089700{i}")).collect();
    let tokens = ["t0", "t1", "t2"];

    let report = dispatcher
        .run_batch_check(&numbers, tokens, IdentifierKind::Phone)
        .unwrap()
        .wait()
        .await
        .unwrap();
    assert_eq!(report.progress.succeeded, 7);
    assert_eq!(report.progress.batches_total, 7);

    let calls = http_client.get_calls();
    assert_eq!(calls.len(), 7);
    for call in calls {
        let batch_index = numbers
            .iter()
            .position(|n| *n == call.identifiers[0])
            .expect("Unknown identifier sent");
        assert_eq!(call.token, tokens[batch_index % 3], "batch {batch_index}");
    }
}

#[test_log::test(tokio::test)]
async fn test_persistent_503_exhausts_retries_then_fails_batch() {
    let http_client = MockHttpClient::new();
    http_client.set_fallback_response(HttpResponse {
        status: 503,
        body: "busy".to_string(),
    });
    let dispatcher = Dispatcher::new(
        http_client.clone(),
        ConnectivityMonitor::default(),
        config(5, 3),
    );

    let report = dispatcher
        .run_batch_check(["111", "222"], ["tok"], IdentifierKind::Voucher)
        .unwrap()
        .wait()
        .await
        .unwrap();

    // Initial attempt plus three retries
    assert_eq!(http_client.call_count(), 4);
    for slot in &report.slots {
        assert_eq!(slot.failure(), Some(&FailureReason::HttpStatus { status: 503 }));
    }
    assert_eq!(report.progress.failed, 2);
}

#[test_log::test(tokio::test)]
async fn test_cancel_stops_claiming_and_aborts_in_flight_batches() {
    let http_client = MockHttpClient::new();
    let ok = || {
        Ok(HttpResponse {
            status: 200,
            body: "[]".to_string(),
        })
    };
    // Held forever: only cancellation ends these calls
    let _held = [
        http_client.add_response_with_trigger(&key(), ok()),
        http_client.add_response_with_trigger(&key(), ok()),
    ];
    echo_sim_info(&http_client);

    let dispatcher = Dispatcher::new(
        http_client.clone(),
        ConnectivityMonitor::default(),
        config(1, 0),
    );
    let handle = dispatcher
        .run_batch_check(
            ["0898000", "0898001", "0898002", "0898003"],
            ["tok-a", "tok-b"],
            IdentifierKind::Phone,
        )
        .unwrap();

    assert!(
        wait_until(Duration::from_secs(5), || http_client.in_flight_count() == 2).await,
        "Both workers should be in flight"
    );
    assert_eq!(handle.progress().batches_claimed, 2);

    handle.cancel();
    let report = handle.wait().await.unwrap();

    assert_eq!(report.state, SessionState::Cancelled);
    assert_eq!(http_client.call_count(), 2);
    assert_eq!(http_client.in_flight_count(), 0);
    assert!(report.slots.iter().all(|s| !s.is_succeeded()));
    assert!(report.slots.iter().all(|s| s.is_cancelled()));
    assert_eq!(report.progress.cancelled, 4);
    assert!(!dispatcher.is_running(IdentifierKind::Phone));
}

#[test_log::test(tokio::test)]
async fn test_abandon_policy_leaves_unsent_slots_pending() {
    let http_client = MockHttpClient::new();
    let _held = http_client.add_response_with_trigger(
        &key(),
        Ok(HttpResponse {
            status: 200,
            body: "[]".to_string(),
        }),
    );

    let dispatcher = Dispatcher::new(
        http_client.clone(),
        ConnectivityMonitor::default(),
        config(1, 0).with_cancel_policy(CancelPolicy::Abandon),
    );
    let handle = dispatcher
        .run_batch_check(["1", "2", "3"], ["tok"], IdentifierKind::Voucher)
        .unwrap();

    assert!(wait_until(Duration::from_secs(5), || http_client.in_flight_count() == 1).await);
    handle.cancel();
    let report = handle.wait().await.unwrap();

    assert_eq!(report.state, SessionState::Cancelled);
    assert!(report.slots.iter().all(|s| s.is_pending()));
    assert_eq!(report.progress.pending, 3);
    assert_eq!(http_client.call_count(), 1);
}

#[test_log::test(tokio::test)]
async fn test_offline_start_and_empty_token_pool_are_rejected() {
    let http_client = MockHttpClient::new();
    let dispatcher = Dispatcher::new(
        http_client.clone(),
        ConnectivityMonitor::new(ConnectionInfo::offline()),
        DispatcherConfig::new(WEBHOOK),
    );

    assert!(matches!(
        dispatcher.run_batch_check(["0895111"], ["tok"], IdentifierKind::Phone),
        Err(BulkCheckError::Offline)
    ));
    assert!(matches!(
        dispatcher.run_batch_check(["0895111"], ["", "  "], IdentifierKind::Phone),
        Err(BulkCheckError::EmptyTokenPool)
    ));
    assert_eq!(http_client.call_count(), 0);
    assert!(!dispatcher.is_running(IdentifierKind::Phone));
}

#[test_log::test(tokio::test)]
async fn test_connection_drop_while_offline_does_not_spend_retries() {
    let http_client = MockHttpClient::new();
    let connectivity = ConnectivityMonitor::default();

    let calls = Arc::new(AtomicUsize::new(0));
    {
        let connectivity = connectivity.clone();
        let calls = calls.clone();
        http_client.set_responder(move |request| {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                connectivity.set_online(false);
                return Err(BulkCheckError::Connection("network unreachable".to_string()));
            }
            let serial = &request.payload.numbers_or_serials[0];
            Ok(HttpResponse {
                status: 200,
                body: serde_json::json!([{ "serialNumber": serial, "status": "Injected" }])
                    .to_string(),
            })
        });
    }

    // No retries at all: only the offline path can get this batch through
    let dispatcher = Dispatcher::new(http_client.clone(), connectivity.clone(), config(5, 0));
    let handle = dispatcher
        .run_batch_check(["350123"], ["tok"], IdentifierKind::Voucher)
        .unwrap();

    assert!(wait_until(Duration::from_secs(5), || !connectivity.is_online()).await);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(http_client.call_count(), 1);
    assert!(handle.snapshot()[0].is_pending());

    connectivity.set_online(true);
    let report = handle.wait().await.unwrap();

    assert_eq!(http_client.call_count(), 2);
    let outcome = report.slots[0].outcome().expect("Slot should have succeeded");
    assert_eq!(outcome.status(), "Injected");
    assert_eq!(outcome.identifier(), "350123");
}

#[test_log::test(tokio::test)]
async fn test_one_session_per_kind_but_kinds_run_together() {
    let http_client = MockHttpClient::new();
    let release_phone = http_client.add_response_with_trigger(
        &key(),
        Ok(HttpResponse {
            status: 200,
            body: r#"{"SimInfo":[{"nomor":"0899123","status":"Aktif"}]}"#.to_string(),
        }),
    );
    http_client.set_fallback_response(HttpResponse {
        status: 200,
        body: r#"{"serialNumber":"350999","status":"Injected"}"#.to_string(),
    });

    let dispatcher = Dispatcher::new(
        http_client.clone(),
        ConnectivityMonitor::default(),
        config(5, 0).with_voucher_rule(VoucherRule::legacy()),
    );

    let phone = dispatcher
        .run_batch_check(["0899123"], ["tok"], IdentifierKind::Phone)
        .unwrap();
    assert!(wait_until(Duration::from_secs(5), || http_client.in_flight_count() == 1).await);

    assert!(matches!(
        dispatcher.run_batch_check(["0899456"], ["tok"], IdentifierKind::Phone),
        Err(BulkCheckError::SessionActive(IdentifierKind::Phone))
    ));

    let voucher = dispatcher
        .run_batch_check(["350999", "999350"], ["tok"], IdentifierKind::Voucher)
        .unwrap()
        .wait()
        .await
        .unwrap();
    assert!(voucher.slots[0].is_succeeded());
    assert_eq!(
        voucher.slots[1].failure(),
        Some(&FailureReason::InvalidFormat {
            reason: "invalid serial".to_string()
        })
    );
    assert!(dispatcher.is_running(IdentifierKind::Phone));

    release_phone.send(()).unwrap();
    let phone = phone.wait().await.unwrap();
    assert_eq!(phone.slots[0].outcome().unwrap().status(), "Aktif");
    assert!(!dispatcher.is_running(IdentifierKind::Phone));
    assert!(!dispatcher.is_running(IdentifierKind::Voucher));
}

#[test_log::test(tokio::test)]
async fn test_progress_subscriber_sees_final_state() {
    let http_client = MockHttpClient::new();
    echo_sim_info(&http_client);
    let dispatcher = Dispatcher::new(
        http_client.clone(),
        ConnectivityMonitor::default(),
        config(2, 0),
    );

    let handle = dispatcher
        .run_batch_check(["0895001", "0895002", "0895003"], ["tok"], IdentifierKind::Phone)
        .unwrap();
    let mut progress = handle.subscribe();

    let finished = progress
        .wait_for(|p| p.is_finished())
        .await
        .expect("Progress channel closed early")
        .clone();

    assert_eq!(finished.state, SessionState::Completed);
    assert_eq!(finished.succeeded, 3);
    assert_eq!(finished.batches_done, 2);
    assert_eq!(finished.active_workers, 0);
    assert_eq!(finished.settled(), finished.total);
    handle.wait().await.unwrap();
}
