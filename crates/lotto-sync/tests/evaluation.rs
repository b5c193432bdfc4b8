use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::NaiveDate;
use lotto_adapters::{DrawSource, RawDrawPayload};
use lotto_core::{EvaluationResult, PlayedSelection, PrizeTier};
use lotto_storage::{FetchError, FetchOutcome, MemoryStore, RecordOutcome, ResultStore, StoreError};
use lotto_sync::{
    EvaluationError, EvaluationOutcome, EvaluationRequest, EvaluationRun, Notification, Notifier,
    NotifyError,
};

const RECIPIENT: &str = "player@example.com";

/// Serves the 06/01/2024 draw (04 13 22 44 50 53) as the latest result.
struct FixtureSource;

#[async_trait]
impl DrawSource for FixtureSource {
    fn source_id(&self) -> &'static str {
        "fixture"
    }

    async fn latest(&self) -> Result<RawDrawPayload, FetchError> {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/megasena/draw_2671.json");
        let text = std::fs::read_to_string(path).expect("read fixture");
        Ok(serde_json::from_str(&text).expect("parse fixture"))
    }

    async fn by_id(&self, _id: u32) -> Result<FetchOutcome<RawDrawPayload>, FetchError> {
        Ok(FetchOutcome::NotFound)
    }
}

#[derive(Default)]
struct RecordingNotifier {
    sent: Mutex<Vec<Notification>>,
    fail: bool,
}

impl RecordingNotifier {
    fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    fn sent(&self) -> Vec<Notification> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(&self, notification: &Notification) -> Result<(), NotifyError> {
        if self.fail {
            return Err(NotifyError::Unavailable("smtp relay down".to_string()));
        }
        self.sent.lock().unwrap().push(notification.clone());
        Ok(())
    }
}

/// Accepts `budget` new records, then fails every write.
struct FlakyResultStore {
    inner: MemoryStore,
    budget: AtomicUsize,
}

#[async_trait]
impl ResultStore for FlakyResultStore {
    async fn ensure_schema(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn record_if_new(&self, result: &EvaluationResult) -> Result<RecordOutcome, StoreError> {
        let left = self.budget.load(Ordering::SeqCst);
        if left == 0 {
            return Err(StoreError::Unavailable("connection reset".to_string()));
        }
        self.budget.store(left - 1, Ordering::SeqCst);
        self.inner.record_if_new(result).await
    }

    async fn is_recorded(
        &self,
        selection_key: &str,
        evaluation_date: NaiveDate,
    ) -> Result<bool, StoreError> {
        self.inner.is_recorded(selection_key, evaluation_date).await
    }

    async fn count(&self) -> Result<u64, StoreError> {
        ResultStore::count(&self.inner).await
    }
}

fn draw_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 1, 6).unwrap()
}

fn request(date: NaiveDate, selections: &[&str]) -> EvaluationRequest {
    EvaluationRequest::parse(date, selections).unwrap()
}

fn selection_lines(notification: &Notification) -> Vec<&str> {
    notification
        .body
        .lines()
        .filter(|l| l.starts_with("Selection: "))
        .collect()
}

#[tokio::test]
async fn four_hits_is_a_quadra_and_is_notified() {
    let store = Arc::new(MemoryStore::new());
    let notifier = Arc::new(RecordingNotifier::default());
    let run = EvaluationRun::new(Arc::new(FixtureSource), store.clone(), notifier.clone(), RECIPIENT);

    let outcome = run
        .run(&request(draw_date(), &["4,13,22,35,41,53"]))
        .await
        .unwrap();

    let recorded = outcome.recorded();
    assert_eq!(recorded.len(), 1);
    assert_eq!(recorded[0].hit_count, 4);
    assert_eq!(recorded[0].tier(), PrizeTier::Quadra);
    assert_eq!(store.results(), recorded.to_vec());

    let sent = notifier.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].recipient, RECIPIENT);
    assert_eq!(
        selection_lines(&sent[0]),
        vec!["Selection: 4,13,22,35,41,53 | Hits: 4 | Prize: Quadra"]
    );
}

#[tokio::test]
async fn date_mismatch_aborts_without_writes() {
    let store = Arc::new(MemoryStore::new());
    let notifier = Arc::new(RecordingNotifier::default());
    let run = EvaluationRun::new(Arc::new(FixtureSource), store.clone(), notifier.clone(), RECIPIENT);
    let configured = NaiveDate::from_ymd_opt(2024, 1, 13).unwrap();

    let err = run
        .run(&request(configured, &["4,13,22,35,41,53"]))
        .await
        .unwrap_err();

    match err {
        EvaluationError::ConfigurationMismatch {
            configured: c,
            authoritative,
        } => {
            assert_eq!(c, configured);
            assert_eq!(authoritative, draw_date());
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(store.results().is_empty());
    assert!(notifier.sent().is_empty());
}

#[tokio::test]
async fn only_new_results_are_recorded_and_notified_once() {
    let store = Arc::new(MemoryStore::new());
    let pre = PlayedSelection::parse("1,2,3,4,5,6", draw_date()).unwrap();
    store
        .record_if_new(&EvaluationResult {
            selection_key: pre.selection_key(),
            hit_count: 1,
            evaluation_date: draw_date(),
        })
        .await
        .unwrap();

    let notifier = Arc::new(RecordingNotifier::default());
    let run = EvaluationRun::new(Arc::new(FixtureSource), store.clone(), notifier.clone(), RECIPIENT);
    let req = request(
        draw_date(),
        &["4,13,22,35,41,53", "6,5,4,3,2,1", "53,50,44,22,13,4"],
    );

    let outcome = run.run(&req).await.unwrap();
    match &outcome {
        EvaluationOutcome::RecordedAndNotified {
            recorded,
            already_recorded,
        } => {
            assert_eq!(recorded.len(), 2);
            assert_eq!(*already_recorded, 1);
        }
        other => panic!("unexpected outcome: {other:?}"),
    }

    let sent = notifier.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(
        selection_lines(&sent[0]),
        vec![
            "Selection: 4,13,22,35,41,53 | Hits: 4 | Prize: Quadra",
            "Selection: 4,13,22,44,50,53 | Hits: 6 | Prize: Sena",
        ]
    );
    assert_eq!(store.results().len(), 3);

    // Nothing new the second time: no rows, no message.
    let again = run.run(&req).await.unwrap();
    match again {
        EvaluationOutcome::NoNewResults { evaluated } => assert_eq!(evaluated.len(), 3),
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert_eq!(notifier.sent().len(), 1);
    assert_eq!(store.results().len(), 3);
}

#[tokio::test]
async fn notification_failure_keeps_recorded_results() {
    let store = Arc::new(MemoryStore::new());
    let notifier = Arc::new(RecordingNotifier::failing());
    let run = EvaluationRun::new(Arc::new(FixtureSource), store.clone(), notifier, RECIPIENT);

    let err = run
        .run(&request(draw_date(), &["4,13,22,35,41,53", "10,20,30,40,50,60"]))
        .await
        .unwrap_err();

    match err {
        EvaluationError::Notify { recorded, source } => {
            assert_eq!(recorded.len(), 2);
            assert!(matches!(source, NotifyError::Unavailable(_)));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(store.results().len(), 2);
}

#[tokio::test]
async fn store_failure_notifies_partial_batch_then_errors() {
    let store = Arc::new(FlakyResultStore {
        inner: MemoryStore::new(),
        budget: AtomicUsize::new(1),
    });
    let notifier = Arc::new(RecordingNotifier::default());
    let run = EvaluationRun::new(Arc::new(FixtureSource), store.clone(), notifier.clone(), RECIPIENT);

    let err = run
        .run(&request(draw_date(), &["4,13,22,35,41,53", "10,20,30,40,50,60"]))
        .await
        .unwrap_err();

    match err {
        EvaluationError::Store { recorded, .. } => {
            assert_eq!(recorded.len(), 1);
            assert_eq!(recorded[0].selection_key, "4,13,22,35,41,53");
        }
        other => panic!("unexpected error: {other}"),
    }
    let sent = notifier.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(selection_lines(&sent[0]).len(), 1);
    assert_eq!(store.inner.results().len(), 1);
}
