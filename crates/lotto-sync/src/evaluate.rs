//! Scoring played selections against the authoritative draw, recording each
//! `(selection_key, evaluation_date)` at most once and notifying once per batch.

use std::fmt;
use std::sync::Arc;

use chrono::NaiveDate;
use lotto_adapters::{fetch_latest, DrawError, DrawSource};
use lotto_core::{evaluate, EvaluationResult, PlayedSelection, SelectionError};
use lotto_storage::{RecordOutcome, ResultStore, StoreError};
use thiserror::Error;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::notify::{render_results_notification, Notifier, NotifyError};

/// Selections to score, all bound to one configured evaluation date.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvaluationRequest {
    evaluation_date: NaiveDate,
    selections: Vec<PlayedSelection>,
}

impl EvaluationRequest {
    pub fn parse<S: AsRef<str>>(
        evaluation_date: NaiveDate,
        selections: &[S],
    ) -> Result<Self, SelectionError> {
        let selections = selections
            .iter()
            .map(|s| PlayedSelection::parse(s.as_ref(), evaluation_date))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            evaluation_date,
            selections,
        })
    }

    pub fn evaluation_date(&self) -> NaiveDate {
        self.evaluation_date
    }

    pub fn selections(&self) -> &[PlayedSelection] {
        &self.selections
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    FetchedAuthoritativeDraw,
    DateMismatch,
    Evaluated,
    Filtered,
    RecordedAndNotified,
    NoNewResults,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::FetchedAuthoritativeDraw => "fetched_authoritative_draw",
            Self::DateMismatch => "date_mismatch",
            Self::Evaluated => "evaluated",
            Self::Filtered => "filtered",
            Self::RecordedAndNotified => "recorded_and_notified",
            Self::NoNewResults => "no_new_results",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum EvaluationError {
    #[error("configured evaluation date {configured} does not match authoritative draw date {authoritative}")]
    ConfigurationMismatch {
        configured: NaiveDate,
        authoritative: NaiveDate,
    },
    #[error("fetching the authoritative draw failed: {0}")]
    Draw(#[from] DrawError),
    #[error("recording results failed: {source}")]
    Store {
        recorded: Vec<EvaluationResult>,
        #[source]
        source: StoreError,
    },
    #[error("results recorded but notification failed: {source}")]
    Notify {
        recorded: Vec<EvaluationResult>,
        #[source]
        source: NotifyError,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EvaluationOutcome {
    /// Every selection was already recorded for this date. Nothing was sent.
    NoNewResults { evaluated: Vec<EvaluationResult> },
    RecordedAndNotified {
        recorded: Vec<EvaluationResult>,
        already_recorded: usize,
    },
}

impl EvaluationOutcome {
    pub fn recorded(&self) -> &[EvaluationResult] {
        match self {
            Self::NoNewResults { .. } => &[],
            Self::RecordedAndNotified { recorded, .. } => recorded,
        }
    }
}

pub struct EvaluationRun {
    source: Arc<dyn DrawSource>,
    results: Arc<dyn ResultStore>,
    notifier: Arc<dyn Notifier>,
    recipient: String,
}

impl EvaluationRun {
    pub fn new(
        source: Arc<dyn DrawSource>,
        results: Arc<dyn ResultStore>,
        notifier: Arc<dyn Notifier>,
        recipient: impl Into<String>,
    ) -> Self {
        Self {
            source,
            results,
            notifier,
            recipient: recipient.into(),
        }
    }

    pub async fn run(
        &self,
        request: &EvaluationRequest,
    ) -> Result<EvaluationOutcome, EvaluationError> {
        let span = info_span!("evaluation_run", date = %request.evaluation_date);
        self.run_inner(request).instrument(span).await
    }

    async fn run_inner(
        &self,
        request: &EvaluationRequest,
    ) -> Result<EvaluationOutcome, EvaluationError> {
        transition(RunState::Idle);
        let draw = fetch_latest(self.source.as_ref()).await?;
        transition(RunState::FetchedAuthoritativeDraw);

        if draw.date != request.evaluation_date {
            transition(RunState::DateMismatch);
            warn!(
                configured = %request.evaluation_date,
                authoritative = %draw.date,
                "evaluation date does not match latest draw; aborting"
            );
            return Err(EvaluationError::ConfigurationMismatch {
                configured: request.evaluation_date,
                authoritative: draw.date,
            });
        }

        let evaluated = request
            .selections
            .iter()
            .map(|selection| evaluate(selection, &draw))
            .collect::<Vec<_>>();
        transition(RunState::Evaluated);
        for result in &evaluated {
            debug!(
                selection = %result.selection_key,
                hits = result.hit_count,
                tier = %result.tier(),
                "selection evaluated"
            );
        }

        let mut recorded = Vec::new();
        let mut already_recorded = 0usize;
        for result in &evaluated {
            match self.results.record_if_new(result).await {
                Ok(RecordOutcome::Recorded) => {
                    info!(selection = %result.selection_key, hits = result.hit_count, "result recorded");
                    recorded.push(result.clone());
                }
                Ok(RecordOutcome::AlreadyRecorded) => {
                    info!(selection = %result.selection_key, "result already recorded");
                    already_recorded += 1;
                }
                Err(source) => {
                    error!(selection = %result.selection_key, "recording result failed: {source}");
                    // Rows already written stay; their notification must not be lost.
                    if !recorded.is_empty() {
                        if let Err(err) = self.notify(request.evaluation_date, &recorded).await {
                            error!("notification for partially recorded batch failed: {err}");
                        }
                    }
                    return Err(EvaluationError::Store { recorded, source });
                }
            }
        }
        transition(RunState::Filtered);

        if recorded.is_empty() {
            transition(RunState::NoNewResults);
            info!("no new results to record");
            return Ok(EvaluationOutcome::NoNewResults { evaluated });
        }

        if let Err(source) = self.notify(request.evaluation_date, &recorded).await {
            return Err(EvaluationError::Notify { recorded, source });
        }
        transition(RunState::RecordedAndNotified);

        Ok(EvaluationOutcome::RecordedAndNotified {
            recorded,
            already_recorded,
        })
    }

    async fn notify(
        &self,
        evaluation_date: NaiveDate,
        recorded: &[EvaluationResult],
    ) -> Result<(), NotifyError> {
        let notification = render_results_notification(evaluation_date, recorded, &self.recipient);
        self.notifier.send(&notification).await?;
        info!(count = recorded.len(), recipient = %self.recipient, "results notification sent");
        Ok(())
    }
}

fn transition(state: RunState) {
    debug!(%state, "evaluation state");
}
