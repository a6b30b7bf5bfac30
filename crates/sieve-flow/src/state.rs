//! Per-request coordination state.
//!
//! A request's progress lives in one record of the `request_state` table:
//! expected and completed invocation counts per stage. Expected counts are
//! raised before the corresponding tasks are dispatched, and completed counts
//! are raised through [`AtomicCounter`] increments, so every reader sees
//! monotonically non-decreasing values.
//!
//! Stages also stamp wall-clock events into the `timing` table. Those records
//! are diagnostics only and never drive control flow.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use sieve_core::record::{from_record, single_field, to_record};
use sieve_core::{AtomicCounter, Condition, Increment, RecordStore, RequestId, WriteOutcome};

use crate::config::PipelineConfig;
use crate::error::{Error, Result};
use crate::request::Stage;

const EXPECTED_MAPPERS: &str = "ExpectedMapperExecutions";
const COMPLETED_MAPPERS: &str = "CompletedMapperExecutions";
const EXPECTED_WORK: &str = "ExpectedWorkExecutions";
const COMPLETED_WORK: &str = "CompletedWorkExecutions";
const COMPLETED_REDUCERS: &str = "CompletedReducerExecutions";

/// Stage counts for one request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RequestState {
    /// Format the request was submitted with.
    pub format: String,
    /// One mapper per input.
    pub expected_mapper_executions: u64,
    /// Mappers that finished.
    pub completed_mapper_executions: u64,
    /// Sum of chunk specs produced by finished and running mappers.
    pub expected_work_executions: u64,
    /// Work invocations that finished.
    pub completed_work_executions: u64,
    /// Always one.
    pub expected_reducer_executions: u64,
    /// Reducer runs, including duplicates.
    pub completed_reducer_executions: u64,
}

impl RequestState {
    /// Fresh state for a request with `inputs` inputs.
    #[must_use]
    pub fn new(format: impl Into<String>, inputs: u64) -> Self {
        Self {
            format: format.into(),
            expected_mapper_executions: inputs,
            completed_mapper_executions: 0,
            expected_work_executions: 0,
            completed_work_executions: 0,
            expected_reducer_executions: 1,
            completed_reducer_executions: 0,
        }
    }

    /// Every mapper has finished, so the expected work count is final.
    #[must_use]
    pub const fn mappers_complete(&self) -> bool {
        self.completed_mapper_executions == self.expected_mapper_executions
    }

    /// The reducer may be dispatched.
    #[must_use]
    pub const fn ready_for_reduce(&self) -> bool {
        self.mappers_complete()
            && self.completed_work_executions == self.expected_work_executions
    }

    /// At least one reducer run has finished.
    #[must_use]
    pub const fn is_complete(&self) -> bool {
        self.completed_reducer_executions >= self.expected_reducer_executions
    }

    /// Phase inferred from the counts.
    #[must_use]
    pub const fn phase(&self) -> Phase {
        if self.is_complete() {
            Phase::Complete
        } else if self.ready_for_reduce() {
            Phase::Reducing
        } else if self.mappers_complete() {
            Phase::Working
        } else if self.completed_mapper_executions == 0 && self.expected_work_executions == 0 {
            Phase::Submitted
        } else {
            Phase::Mapping
        }
    }
}

/// Lifecycle phase of a request. Never stored; always derived from counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    /// State created; no mapper has reported anything.
    Submitted,
    /// Mappers are still splitting inputs.
    Mapping,
    /// All mappers done; work outstanding.
    Working,
    /// All work done; reducer not yet finished.
    Reducing,
    /// Reducer finished.
    Complete,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Submitted => "submitted",
            Self::Mapping => "mapping",
            Self::Working => "working",
            Self::Reducing => "reducing",
            Self::Complete => "complete",
        };
        f.write_str(name)
    }
}

/// Wall-clock events recorded per request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimingEvent {
    /// Driver accepted the request.
    DriverStarted,
    /// Driver dispatched every mapper.
    DriverComplete,
    /// Last observed work completion.
    WorkComplete,
    /// Last reducer completion.
    ReduceComplete,
}

impl TimingEvent {
    /// Record field name.
    #[must_use]
    pub const fn field(self) -> &'static str {
        match self {
            Self::DriverStarted => "DriverStarted",
            Self::DriverComplete => "DriverComplete",
            Self::WorkComplete => "WorkComplete",
            Self::ReduceComplete => "ReduceComplete",
        }
    }
}

/// Timing record for a request; each field is last-writer-wins.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TimingRecord {
    /// Driver accepted the request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub driver_started: Option<DateTime<Utc>>,
    /// Driver dispatched every mapper.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub driver_complete: Option<DateTime<Utc>>,
    /// Last observed work completion.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub work_complete: Option<DateTime<Utc>>,
    /// Last reducer completion.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reduce_complete: Option<DateTime<Utc>>,
}

/// Reads and advances request state in the record store.
#[derive(Clone)]
pub struct CoordinationStateStore {
    records: Arc<dyn RecordStore>,
    counter: AtomicCounter<dyn RecordStore>,
    table: String,
    timing_table: String,
}

impl CoordinationStateStore {
    /// Creates a store over the configured tables.
    #[must_use]
    pub fn new(records: Arc<dyn RecordStore>, config: &PipelineConfig) -> Self {
        let counter = AtomicCounter::new(Arc::clone(&records), config.tables.request_state.clone())
            .with_retry_interval(config.counter_retry);
        Self {
            records,
            counter,
            table: config.tables.request_state.clone(),
            timing_table: config.tables.timing.clone(),
        }
    }

    /// Creates the state record for a new request.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` if state already exists for `request_id`, or a
    /// store error.
    pub async fn create(&self, request_id: RequestId, state: &RequestState) -> Result<()> {
        let outcome = self
            .records
            .put(
                &self.table,
                &request_id.to_string(),
                to_record(state)?,
                Condition::NotExists,
            )
            .await?;
        if outcome == WriteOutcome::ConditionFailed {
            return Err(sieve_core::Error::InvalidInput(format!(
                "request state already exists for {request_id}"
            ))
            .into());
        }
        tracing::debug!(
            request_id = %request_id,
            expected_mappers = state.expected_mapper_executions,
            "request state created"
        );
        Ok(())
    }

    /// Reads a request's state with strong consistency.
    ///
    /// # Errors
    ///
    /// Returns `RequestNotFound` if no state exists.
    pub async fn get(&self, request_id: RequestId) -> Result<RequestState> {
        let record = self
            .records
            .get(&self.table, &request_id.to_string())
            .await?
            .ok_or(Error::RequestNotFound { request_id })?;
        Ok(from_record(record)?)
    }

    /// Raises the expected work count by `chunks`.
    ///
    /// # Errors
    ///
    /// Returns an error if the state record is missing or the store fails.
    pub async fn add_expected_work(&self, request_id: RequestId, chunks: u64) -> Result<Increment> {
        self.increment(request_id, EXPECTED_WORK, chunks).await
    }

    /// Records one finished invocation of `stage`.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for [`Stage::Driver`], which has no
    /// completion count, or an error if the state record is missing.
    pub async fn complete(&self, request_id: RequestId, stage: Stage) -> Result<Increment> {
        let field = match stage {
            Stage::Mapper => COMPLETED_MAPPERS,
            Stage::Work => COMPLETED_WORK,
            Stage::Reducer => COMPLETED_REDUCERS,
            Stage::Driver => {
                return Err(Error::configuration("driver has no completion count"));
            }
        };
        self.increment(request_id, field, 1).await
    }

    /// Reads the expected mapper count without writing.
    ///
    /// # Errors
    ///
    /// Returns an error if the state record is missing or the store fails.
    pub async fn expected_mappers(&self, request_id: RequestId) -> Result<u64> {
        self.counter
            .current(&request_id.to_string(), EXPECTED_MAPPERS)
            .await
            .map_err(|e| not_found_as_request(e, request_id))
    }

    async fn increment(&self, request_id: RequestId, field: &str, delta: u64) -> Result<Increment> {
        self.counter
            .increment(&request_id.to_string(), field, delta)
            .await
            .map_err(|e| not_found_as_request(e, request_id))
    }

    /// Stamps `event` with the current time.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn record_timing(&self, request_id: RequestId, event: TimingEvent) -> Result<()> {
        let now = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        self.records
            .update(
                &self.timing_table,
                &request_id.to_string(),
                single_field(event.field(), now),
                Condition::None,
            )
            .await?;
        Ok(())
    }

    /// Reads the timing record, if any event was stamped.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails or the record is malformed.
    pub async fn timing(&self, request_id: RequestId) -> Result<Option<TimingRecord>> {
        match self
            .records
            .get(&self.timing_table, &request_id.to_string())
            .await?
        {
            Some(record) => Ok(Some(from_record(record)?)),
            None => Ok(None),
        }
    }
}

fn not_found_as_request(err: sieve_core::Error, request_id: RequestId) -> Error {
    match err {
        sieve_core::Error::ResourceNotFound { .. } => Error::RequestNotFound { request_id },
        other => other.into(),
    }
}
