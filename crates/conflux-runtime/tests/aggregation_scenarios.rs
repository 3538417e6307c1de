//! End-to-end aggregation scenarios through the coordinator.
//!
//! Covers completion by count, declared total and timeout, registry eviction,
//! capacity overflow, sink failures and correlated fan-out.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::anyhow;
use conflux_runtime::*;

// ==========================================================================
// Helpers
// ==========================================================================

type Results = Arc<Mutex<Vec<AggregationResult>>>;

fn recording_sink(name: &str) -> (Results, Arc<dyn CompletionSink>) {
    let results: Results = Arc::new(Mutex::new(Vec::new()));
    let results_clone = results.clone();
    let sink = FnSink::new(name, move |r| {
        results_clone.lock().unwrap().push(r);
        Ok(())
    });
    (results, Arc::new(sink))
}

fn failing_sink() -> Arc<dyn CompletionSink> {
    Arc::new(FnSink::new("broken", |_| Err(anyhow!("endpoint unavailable"))))
}

#[derive(Default)]
struct RecordingFaults {
    faults: Mutex<Vec<(String, &'static str)>>,
}

impl FaultSink for RecordingFaults {
    fn on_fault(&self, message: &SharedMessage, error: &AggregationError) {
        self.faults
            .lock()
            .unwrap()
            .push((message.message_id.clone(), error.kind()));
    }
}

impl RecordingFaults {
    fn snapshot(&self) -> Vec<(String, &'static str)> {
        self.faults.lock().unwrap().clone()
    }
}

fn msg(id: &str) -> SharedMessage {
    MessageContext::new("urn:getQuote")
        .with_message_id(id)
        .into_shared()
}

fn seq_msg(id: &str, seq: &str) -> SharedMessage {
    MessageContext::new("urn:getQuote")
        .with_message_id(id)
        .with_property("MESSAGE_SEQUENCE", seq)
        .into_shared()
}

fn ids(result: &AggregationResult) -> Vec<String> {
    result
        .messages
        .iter()
        .map(|m| m.message_id.clone())
        .collect()
}

// ==========================================================================
// Count-based completion
// ==========================================================================

#[tokio::test]
async fn min_three_completes_on_third_message_then_key_is_reusable() {
    let (results, sink) = recording_sink("quotes");
    let coordinator = AggregationCoordinator::builder(sink).build();
    let params = AggregationParams::new(Duration::ZERO, 3, 5);

    assert!(matches!(
        coordinator.admit("A", msg("1"), &params).await,
        AdmitOutcome::Pending
    ));
    assert!(matches!(
        coordinator.admit("A", msg("2"), &params).await,
        AdmitOutcome::Pending
    ));
    assert!(results.lock().unwrap().is_empty());

    assert!(matches!(
        coordinator.admit("A", msg("3"), &params).await,
        AdmitOutcome::Completed(CompletionTrigger::MinCount)
    ));

    {
        let results = results.lock().unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].key, "A");
        assert_eq!(ids(&results[0]), vec!["1", "2", "3"]);
    }

    assert!(coordinator.registry().get("A").is_none());

    assert!(matches!(
        coordinator.admit("A", msg("4"), &params).await,
        AdmitOutcome::Pending
    ));
    let snapshot = coordinator.snapshot("A").unwrap();
    assert_eq!(snapshot.messages, 1);
    assert_eq!(results.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn max_count_completes_group() {
    let (results, sink) = recording_sink("quotes");
    let coordinator = AggregationCoordinator::builder(sink).build();
    let params = AggregationParams::default().with_max(2);

    coordinator.admit("B", msg("1"), &params).await;
    let outcome = coordinator.admit("B", msg("2"), &params).await;
    assert!(matches!(
        outcome,
        AdmitOutcome::Completed(CompletionTrigger::MaxCount)
    ));
    assert_eq!(results.lock().unwrap()[0].len(), 2);
}

// ==========================================================================
// Declared total
// ==========================================================================

#[tokio::test]
async fn declared_total_needs_every_sibling() {
    let (results, sink) = recording_sink("quotes");
    let coordinator = AggregationCoordinator::builder(sink).build();
    let params = AggregationParams::default();

    coordinator.admit("C", seq_msg("1", "2/3"), &params).await;
    coordinator.admit("C", seq_msg("2", "2/3"), &params).await;
    assert!(results.lock().unwrap().is_empty());

    let outcome = coordinator.admit("C", seq_msg("3", "2/3"), &params).await;
    assert!(matches!(
        outcome,
        AdmitOutcome::Completed(CompletionTrigger::DeclaredTotal)
    ));
    assert_eq!(results.lock().unwrap()[0].len(), 3);
}

#[tokio::test]
async fn malformed_declared_total_is_ignored() {
    let (results, sink) = recording_sink("quotes");
    let coordinator = AggregationCoordinator::builder(sink).build();
    let params = AggregationParams::default().with_min(2);

    coordinator.admit("D", seq_msg("1", "three"), &params).await;
    assert!(results.lock().unwrap().is_empty());
    let outcome = coordinator.admit("D", seq_msg("2", "three"), &params).await;
    assert!(matches!(
        outcome,
        AdmitOutcome::Completed(CompletionTrigger::MinCount)
    ));
}

#[tokio::test]
async fn fan_out_siblings_aggregate_by_correlation() {
    let (tx, mut rx) = tokio::sync::mpsc::channel(4);
    let sink = ChannelSink::new("scatter", tx).with_aggregator_id("sg1");
    let coordinator = AggregationCoordinator::builder(Arc::new(sink)).build();
    let params = AggregationParams::default().with_timeout(Duration::from_secs(30));

    let parent = MessageContext::new("urn:getQuote").with_message_id("parent-9");
    let siblings = fan_out(&parent, 3, Some("sg1"));

    for sibling in siblings {
        coordinator
            .admit_correlated(sibling.into_shared(), &params)
            .await;
    }

    let result = rx.recv().await.unwrap();
    assert_eq!(result.key, "parent-9");
    assert_eq!(result.trigger, CompletionTrigger::DeclaredTotal);
    assert_eq!(result.len(), 3);

    let stray = MessageContext::new("urn:getQuote").into_shared();
    assert!(matches!(
        coordinator.admit_correlated(stray, &params).await,
        AdmitOutcome::Uncorrelated(_)
    ));
}

// ==========================================================================
// Timeout
// ==========================================================================

#[tokio::test]
async fn timeout_completes_below_minimum() {
    let (results, sink) = recording_sink("quotes");
    let coordinator = AggregationCoordinator::builder(sink).build();
    let params = AggregationParams::new(Duration::from_millis(40), 5, 0);

    coordinator.admit("E", msg("1"), &params).await;
    coordinator.admit("E", msg("2"), &params).await;
    assert!(results.lock().unwrap().is_empty());

    tokio::time::sleep(Duration::from_millis(150)).await;

    let results = results.lock().unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].trigger, CompletionTrigger::Timeout);
    assert_eq!(ids(&results[0]), vec!["1", "2"]);
    assert!(coordinator.registry().get("E").is_none());
}

#[tokio::test]
async fn timed_out_empty_group_yields_no_result() {
    let (results, sink) = recording_sink("quotes");
    let coordinator = AggregationCoordinator::builder(sink).build();

    coordinator.open_group(
        "F",
        &AggregationParams::default().with_timeout(Duration::from_millis(20)),
    );
    tokio::time::sleep(Duration::from_millis(100)).await;

    let results = results.lock().unwrap();
    assert_eq!(results.len(), 1);
    assert!(results[0].is_empty());
}

#[tokio::test]
async fn stale_deadline_does_not_complete_newer_group() {
    let (results, sink) = recording_sink("quotes");
    let coordinator = AggregationCoordinator::builder(sink).build();

    let quick = AggregationParams::new(Duration::from_millis(30), 1, 0);
    coordinator.admit("G", msg("1"), &quick).await;
    assert_eq!(results.lock().unwrap().len(), 1);

    let slow = AggregationParams::default().with_min(5);
    coordinator.admit("G", msg("2"), &slow).await;

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(results.lock().unwrap().len(), 1);
    assert_eq!(coordinator.snapshot("G").unwrap().messages, 1);
}

// ==========================================================================
// Forced completion
// ==========================================================================

#[tokio::test]
async fn force_complete_is_idempotent() {
    let (results, sink) = recording_sink("quotes");
    let coordinator = AggregationCoordinator::builder(sink).build();
    let params = AggregationParams::default().with_min(10);

    coordinator.admit("H", msg("1"), &params).await;
    assert!(coordinator.force_complete("H").await);
    assert!(!coordinator.force_complete("H").await);
    assert!(!coordinator.force_complete("H").await);

    let results = results.lock().unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].trigger, CompletionTrigger::Forced);
}

// ==========================================================================
// Faults
// ==========================================================================

#[tokio::test]
async fn overflow_is_routed_to_fault_sink() {
    let (results, sink) = recording_sink("quotes");
    let faults = Arc::new(RecordingFaults::default());
    let coordinator = AggregationCoordinator::builder(sink)
        .fault_sink(faults.clone())
        .build();
    let params = AggregationParams::default().with_max(2);

    let group = coordinator.open_group("I", &params);
    assert!(group.add_message(msg("1")));
    assert!(group.add_message(msg("2")));

    let outcome = coordinator.admit("I", msg("3"), &params).await;
    assert!(matches!(outcome, AdmitOutcome::Rejected));
    assert_eq!(group.len(), 2);
    assert_eq!(faults.snapshot(), vec![("3".to_string(), "group_full")]);
    assert!(results.lock().unwrap().is_empty());
}

#[tokio::test]
async fn sink_failure_reports_last_message() {
    let faults = Arc::new(RecordingFaults::default());
    let metrics = AggregationMetrics::new();
    let coordinator = AggregationCoordinator::builder(failing_sink())
        .fault_sink(faults.clone())
        .metrics(metrics.clone())
        .build();
    let params = AggregationParams::default().with_min(2);

    coordinator.admit("J", msg("1"), &params).await;
    let outcome = coordinator.admit("J", msg("2"), &params).await;

    assert!(matches!(
        outcome,
        AdmitOutcome::Completed(CompletionTrigger::MinCount)
    ));
    assert_eq!(faults.snapshot(), vec![("2".to_string(), "sink_failed")]);
    assert!(coordinator.registry().is_empty());
    assert_eq!(
        metrics
            .faults_total
            .with_label_values(&["sink_failed"])
            .get(),
        1.0
    );
}

#[tokio::test]
async fn sink_failure_on_empty_group_is_only_logged() {
    let faults = Arc::new(RecordingFaults::default());
    let metrics = AggregationMetrics::new();
    let coordinator = AggregationCoordinator::builder(failing_sink())
        .fault_sink(faults.clone())
        .metrics(metrics.clone())
        .build();

    coordinator.open_group(
        "K",
        &AggregationParams::default().with_timeout(Duration::from_millis(20)),
    );
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(faults.snapshot().is_empty());
    assert_eq!(
        metrics
            .faults_total
            .with_label_values(&["sink_failed"])
            .get(),
        1.0
    );
    assert_eq!(metrics.completed_count(CompletionTrigger::Timeout), 1);
}

#[tokio::test]
async fn dead_letter_queue_receives_overflow() {
    let dir = tempfile::tempdir().unwrap();
    let dlq = Arc::new(DeadLetterQueue::open(dir.path().join("dlq.jsonl")).unwrap());
    let (_results, sink) = recording_sink("quotes");
    let coordinator = AggregationCoordinator::builder(sink)
        .fault_sink(dlq.clone())
        .build();
    let params = AggregationParams::default().with_max(1);

    let group = coordinator.open_group("L", &params);
    group.add_message(msg("1"));
    coordinator.admit("L", msg("2"), &params).await;

    assert_eq!(dlq.count(), 1);
}

// ==========================================================================
// Configuration
// ==========================================================================

#[tokio::test]
async fn coordinator_from_config() {
    let dir = tempfile::tempdir().unwrap();
    let yaml = format!(
        r#"
name: configured
metrics_enabled: true
dead_letter_file: {}
aggregates:
  quotes:
    min_messages: 2
"#,
        dir.path().join("dlq.jsonl").display()
    );
    let config = Config::from_yaml(&yaml).unwrap();
    let (results, sink) = recording_sink("quotes");
    let coordinator = config.coordinator(sink).unwrap();
    let params = config.aggregate("quotes").unwrap().params();

    coordinator.admit("M", msg("1"), &params).await;
    coordinator.admit("M", msg("2"), &params).await;

    assert_eq!(coordinator.name(), "configured");
    assert_eq!(results.lock().unwrap().len(), 1);
    let metrics = coordinator.metrics().unwrap();
    assert_eq!(metrics.completed_count(CompletionTrigger::MinCount), 1);
    assert!(metrics.gather().contains("conflux_group_size"));
}

#[tokio::test]
async fn configured_aggregate_id_scopes_declared_total() {
    let yaml = r#"
aggregates:
  quotes:
    id: quotes
    timeout_ms: 0
"#;
    let config = Config::from_yaml(yaml).unwrap();
    let (results, sink) = recording_sink("quotes");
    let (coordinator, params) = config.aggregate_coordinator("quotes", sink).unwrap();
    assert_eq!(coordinator.aggregator_id(), Some("quotes"));

    let unscoped = seq_msg("u", "1/1");
    assert!(matches!(
        coordinator.admit("N", unscoped, &params).await,
        AdmitOutcome::Pending
    ));

    let scoped = |id: &str| {
        MessageContext::new("urn:getQuote")
            .with_message_id(id)
            .with_property("MESSAGE_SEQUENCE.quotes", "x/2")
            .into_shared()
    };
    coordinator.admit("S", scoped("1"), &params).await;
    assert!(matches!(
        coordinator.admit("S", scoped("2"), &params).await,
        AdmitOutcome::Completed(CompletionTrigger::DeclaredTotal)
    ));

    let results = results.lock().unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].key, "S");
    assert!(matches!(
        config.aggregate_coordinator("missing", failing_sink()),
        Err(ConfigError::UnknownAggregate(_))
    ));
}
