//! Stage trigger payloads.
//!
//! Every stage is triggered by a small camelCase JSON document. The driver
//! payload comes from the caller; the others are produced by earlier stages
//! and dispatched as [`StageTask`]s tagged by `"stage"`.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use sieve_core::RequestId;

use crate::error::{Error, Result};
use crate::plugin::WorkChunkSpec;

/// Keys the driver payload must carry.
pub const REQUIRED_DRIVER_KEYS: [&str; 3] = ["format", "inputs", "filterExpression"];

/// A pipeline stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    /// Validates the request and fans out mappers.
    Driver,
    /// Splits one input into work chunks.
    Mapper,
    /// Filters one chunk and merges the survivors.
    Work,
    /// Finalizes the result.
    Reducer,
}

impl Stage {
    /// Stage name as used in payloads, logs and metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Driver => "driver",
            Self::Mapper => "mapper",
            Self::Work => "work",
            Self::Reducer => "reducer",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One input of a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputLocation {
    /// Format-specific location of the input (a blob prefix for the bundled formats).
    pub location: String,
}

impl InputLocation {
    /// Creates an input location.
    #[must_use]
    pub fn new(location: impl Into<String>) -> Self {
        Self {
            location: location.into(),
        }
    }
}

/// The driver payload submitted by a caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriverRequest {
    /// Registered format name.
    pub format: String,
    /// Inputs to filter and merge.
    pub inputs: Vec<InputLocation>,
    /// Row filter, interpreted by the format plugin.
    pub filter_expression: String,
}

impl DriverRequest {
    /// Creates a driver request.
    #[must_use]
    pub fn new(
        format: impl Into<String>,
        inputs: impl IntoIterator<Item = InputLocation>,
        filter_expression: impl Into<String>,
    ) -> Self {
        Self {
            format: format.into(),
            inputs: inputs.into_iter().collect(),
            filter_expression: filter_expression.into(),
        }
    }

    /// Parses and validates a raw JSON payload.
    ///
    /// Every missing required key is reported in one error.
    ///
    /// # Errors
    ///
    /// Returns `Error::Validation` if the payload is not an object, keys are
    /// missing, values have the wrong type, or [`Self::validate`] fails.
    pub fn from_json(payload: &Value) -> Result<Self> {
        let Some(object) = payload.as_object() else {
            return Err(Error::validation("request body must be a JSON object"));
        };

        let missing: Vec<String> = REQUIRED_DRIVER_KEYS
            .iter()
            .filter(|key| !object.contains_key(**key))
            .map(|key| (*key).to_string())
            .collect();
        if !missing.is_empty() {
            return Err(Error::missing_keys(missing));
        }

        let request: Self = serde_json::from_value(payload.clone())
            .map_err(|e| Error::validation(format!("malformed request body: {e}")))?;
        request.validate()?;
        Ok(request)
    }

    /// Checks the payload's values.
    ///
    /// # Errors
    ///
    /// Returns `Error::Validation` for an empty format name, no inputs, or an
    /// empty input location.
    pub fn validate(&self) -> Result<()> {
        if self.format.trim().is_empty() {
            return Err(Error::validation("format must not be empty"));
        }
        if self.inputs.is_empty() {
            return Err(Error::validation("inputs must not be empty"));
        }
        if let Some(pos) = self.inputs.iter().position(|i| i.location.trim().is_empty()) {
            return Err(Error::validation(format!("inputs[{pos}].location must not be empty")));
        }
        Ok(())
    }
}

/// Mapper trigger: one per input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MapperTask {
    /// Owning request.
    pub request_id: RequestId,
    /// Format name.
    pub format: String,
    /// Input to split.
    pub location: String,
    /// Row filter, forwarded to the work stage.
    pub filter_expression: String,
}

/// Work trigger: one per chunk spec.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkTask {
    /// Owning request.
    pub request_id: RequestId,
    /// Format name.
    pub format: String,
    /// Row filter.
    pub filter_expression: String,
    /// Format-defined partition descriptor.
    pub chunk_spec: WorkChunkSpec,
}

/// Reducer trigger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReducerTask {
    /// Owning request.
    pub request_id: RequestId,
    /// Format name.
    pub format: String,
}

/// A dispatched stage invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "stage", rename_all = "lowercase")]
pub enum StageTask {
    /// Run a mapper.
    Mapper(MapperTask),
    /// Run a work unit.
    Work(WorkTask),
    /// Run the reducer.
    Reducer(ReducerTask),
}

impl StageTask {
    /// The stage this task triggers.
    #[must_use]
    pub const fn stage(&self) -> Stage {
        match self {
            Self::Mapper(_) => Stage::Mapper,
            Self::Work(_) => Stage::Work,
            Self::Reducer(_) => Stage::Reducer,
        }
    }

    /// The request this task belongs to.
    #[must_use]
    pub const fn request_id(&self) -> RequestId {
        match self {
            Self::Mapper(t) => t.request_id,
            Self::Work(t) => t.request_id,
            Self::Reducer(t) => t.request_id,
        }
    }

    /// The format name.
    #[must_use]
    pub fn format(&self) -> &str {
        match self {
            Self::Mapper(t) => &t.format,
            Self::Work(t) => &t.format,
            Self::Reducer(t) => &t.format,
        }
    }
}

/// Synchronous driver response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitResponse {
    /// Id of the accepted request.
    pub request_id: RequestId,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_valid_driver_payload() {
        let payload = json!({
            "format": "chunked",
            "inputs": [{"location": "inputs/a"}, {"location": "inputs/b"}],
            "filterExpression": "n_genes > 500"
        });
        let request = DriverRequest::from_json(&payload).unwrap();
        assert_eq!(request.format, "chunked");
        assert_eq!(request.inputs.len(), 2);
        assert_eq!(request.filter_expression, "n_genes > 500");
    }

    #[test]
    fn reports_every_missing_key() {
        let err = DriverRequest::from_json(&json!({"format": "chunked"})).unwrap_err();
        let Error::Validation { missing_keys, .. } = err else {
            panic!("expected validation error");
        };
        assert_eq!(missing_keys, vec!["inputs", "filterExpression"]);
    }

    #[test]
    fn rejects_non_object_and_empty_inputs() {
        assert!(DriverRequest::from_json(&json!([1, 2])).is_err());
        let empty = json!({"format": "chunked", "inputs": [], "filterExpression": "TRUE"});
        assert!(matches!(
            DriverRequest::from_json(&empty),
            Err(Error::Validation { .. })
        ));
    }

    #[test]
    fn rejects_wrong_types() {
        let payload = json!({"format": "chunked", "inputs": "a", "filterExpression": "TRUE"});
        assert!(DriverRequest::from_json(&payload).unwrap_err().is_validation());
    }

    #[test]
    fn stage_task_is_tagged_by_stage() {
        let task = StageTask::Reducer(ReducerTask {
            request_id: RequestId::generate(),
            format: "row_groups".into(),
        });
        let value = serde_json::to_value(&task).unwrap();
        assert_eq!(value["stage"], "reducer");
        assert_eq!(value["format"], "row_groups");
        assert!(value.get("requestId").is_some());

        let parsed: StageTask = serde_json::from_value(value).unwrap();
        assert_eq!(parsed.stage(), Stage::Reducer);
    }

    #[test]
    fn work_task_carries_opaque_chunk_spec() {
        let task = StageTask::Work(WorkTask {
            request_id: RequestId::generate(),
            format: "chunked".into(),
            filter_expression: "TRUE".into(),
            chunk_spec: WorkChunkSpec::new(json!({"location": "a", "startRow": 0, "numRows": 3})),
        });
        let value = serde_json::to_value(&task).unwrap();
        assert_eq!(value["stage"], "work");
        assert_eq!(value["chunkSpec"]["numRows"], 3);
    }
}
