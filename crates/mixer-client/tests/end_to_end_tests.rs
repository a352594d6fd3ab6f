//! End-to-end tests: configuration, facade and an in-memory policy server.

mod common;

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use common::{eventually, new_client, quota_request, request, InMemoryPolicyServer};
use mixer_client::{
    CheckOptions, MixerClientOptions, MixerConfig, MixerError, QuotaOptions, ReportOptions,
    StatusCode,
};
use serial_test::serial;
use tempfile::NamedTempFile;

// ============================================================
// Section 1: Configuration to Client
// ============================================================

#[tokio::test]
#[serial]
async fn test_client_built_from_yaml_config() {
    // Arrange
    let mut file = NamedTempFile::new().unwrap();
    writeln!(
        file,
        r#"
check:
  amortization_limit: 3
report:
  max_batch_entries: 2
quota:
  prefetch_amount: 50
  low_water_mark: 5
"#
    )
    .unwrap();
    let config = MixerConfig::load(file.path()).unwrap();
    let server = Arc::new(InMemoryPolicyServer::new());
    server.set_quota_budget("requestcount", 1_000);
    let client = new_client(config.to_options(), &server);

    // Act
    client.quota_async(&quota_request("productpage", "requestcount", 1)).await.unwrap();
    client.report_async(request("a", "/1")).await.unwrap();
    client.report_async(request("b", "/2")).await.unwrap();
    eventually(|| server.report_calls() == 1).await;

    // Assert
    assert_eq!(client.options().check_options.amortization_limit, 3);
    assert_eq!(server.quota_calls(), 1);
    assert_eq!(server.report_batches()[0].len(), 2);
}

// ============================================================
// Section 2: Check
// ============================================================

#[tokio::test]
async fn test_check_allows_and_denies_per_server_policy() {
    // Arrange
    let server = Arc::new(InMemoryPolicyServer::new());
    server.deny_source("untrusted");
    let client = new_client(MixerClientOptions::default(), &server);

    // Act
    let allowed = client.check_async(&request("productpage", "/reviews")).await;
    let denied = client.check_async(&request("untrusted", "/reviews")).await;
    let denied_again = client.check_async(&request("untrusted", "/reviews")).await;

    // Assert
    assert_eq!(allowed, Ok(()));
    assert!(matches!(
        denied,
        Err(MixerError::Denied {
            code: StatusCode::PermissionDenied,
            ..
        })
    ));
    assert_eq!(denied, denied_again);
    assert_eq!(server.check_calls(), 2);
}

#[tokio::test]
async fn test_cached_decision_expires_after_ttl() {
    // Arrange
    let server = Arc::new(InMemoryPolicyServer::new());
    let client = new_client(
        MixerClientOptions {
            check_options: CheckOptions::default().with_ttl(Duration::from_millis(50)),
            ..Default::default()
        },
        &server,
    );
    let attributes = request("productpage", "/reviews");
    client.check_async(&attributes).await.unwrap();

    // Act
    tokio::time::sleep(Duration::from_millis(100)).await;
    client.check_async(&attributes).await.unwrap();

    // Assert
    assert_eq!(server.check_calls(), 2);
}

#[tokio::test]
async fn test_failed_revalidation_keeps_serving_cached_decision() {
    // Arrange
    let server = Arc::new(InMemoryPolicyServer::new());
    let client = new_client(
        MixerClientOptions {
            check_options: CheckOptions::default().with_amortization_limit(1),
            ..Default::default()
        },
        &server,
    );
    let attributes = request("productpage", "/reviews");
    client.check_async(&attributes).await.unwrap();
    server.set_unavailable(true);

    // Act: past the limit; the background refresh fails
    client.check_async(&attributes).await.unwrap();
    let stale = client.check_async(&attributes).await;
    eventually(|| server.check_calls() >= 2).await;
    eventually(|| client.in_flight_checks() == 0).await;
    let after_failure = client.check_async(&attributes).await;

    // Assert
    assert_eq!(stale, Ok(()));
    assert_eq!(after_failure, Ok(()));
}

// ============================================================
// Section 3: Report
// ============================================================

#[tokio::test]
async fn test_shutdown_delivers_buffered_reports_in_order() {
    // Arrange
    let server = Arc::new(InMemoryPolicyServer::new());
    let client = new_client(
        MixerClientOptions {
            report_options: ReportOptions::default().with_max_batch_age(Duration::from_secs(60)),
            ..Default::default()
        },
        &server,
    );
    for i in 0..5 {
        client.report_async(request("productpage", &format!("/{i}"))).await.unwrap();
    }

    // Act
    client.shutdown().await.unwrap();

    // Assert
    let batches = server.report_batches();
    assert_eq!(batches.len(), 1);
    let paths: Vec<&str> = batches[0]
        .iter()
        .filter_map(|entry| entry.get("request.path").and_then(|value| value.as_str()))
        .collect();
    assert_eq!(paths, vec!["/0", "/1", "/2", "/3", "/4"]);
}

#[tokio::test]
async fn test_delivery_callback_sees_server_outage() {
    let server = Arc::new(InMemoryPolicyServer::new());
    server.set_unavailable(true);
    let client = new_client(MixerClientOptions::default(), &server);

    let (tx, rx) = tokio::sync::oneshot::channel();

    client.report_with_delivery(request("productpage", "/"), move |status| {
        let _ = tx.send(status);
    });
    client.flush();
    let delivered = rx.await.unwrap();

    assert!(matches!(
        delivered,
        Err(MixerError::TransportFailure {
            code: StatusCode::Unavailable,
            ..
        })
    ));
}

// ============================================================
// Section 4: Quota
// ============================================================

#[tokio::test]
async fn test_local_allocation_never_exceeds_server_budget() {
    // Arrange
    let server = Arc::new(InMemoryPolicyServer::new());
    server.set_quota_budget("requestcount", 250);
    let client = new_client(
        MixerClientOptions {
            quota_options: QuotaOptions::default().with_prefetch_amount(100),
            ..Default::default()
        },
        &server,
    );
    let attributes = quota_request("productpage", "requestcount", 1);

    // Act
    let mut allowed = 0;
    let mut denied = 0;
    for _ in 0..300 {
        match client.quota_async(&attributes).await {
            Ok(()) => allowed += 1,
            Err(MixerError::QuotaDenied { .. }) => denied += 1,
            Err(other) => panic!("unexpected quota outcome: {other}"),
        }
    }

    // Assert: two full prefetches fit the budget, the third does not
    assert_eq!(allowed, 200);
    assert_eq!(denied, 100);
}

#[tokio::test]
async fn test_quota_outage_is_unknown_not_denied() {
    let server = Arc::new(InMemoryPolicyServer::new());
    server.set_quota_budget("requestcount", 100);
    server.set_unavailable(true);
    let client = new_client(MixerClientOptions::default(), &server);

    let result = client
        .quota_async(&quota_request("productpage", "requestcount", 1))
        .await;

    assert!(matches!(result, Err(MixerError::QuotaUnknown { .. })));
}

#[tokio::test]
async fn test_separate_quota_keys_allocate_independently() {
    let server = Arc::new(InMemoryPolicyServer::new());
    server.set_quota_budget("requestcount", 1_000);
    let client = new_client(MixerClientOptions::default(), &server);

    client.quota_async(&quota_request("a", "requestcount", 1)).await.unwrap();
    client.quota_async(&quota_request("b", "requestcount", 1)).await.unwrap();
    client.quota_async(&quota_request("a", "requestcount", 7)).await.unwrap();

    assert_eq!(server.quota_calls(), 2);
}
