//! 数据处理管线：校验原始负载，再执行（可能异步的）转换。
//!
//! # Data Processing Pipeline
//!
//! `raw → validate → transform → outcome`. Neither stage raises into the
//! caller: a rejected payload yields a skipped [`ProcessingOutcome`] with a
//! reason, a failed transform yields an errored one. Absence of a validator
//! lets every payload through.
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`PayloadValidator`] | Tagged-result validation ([`SchemaValidator`], [`JsonSchemaValidator`]) |
//! | [`PayloadTransform`] | Async transform ([`IdentityTransform`], [`FnTransform`]) |
//! | [`DataProcessor`] | Runs both and keeps counters and running average time |

mod transform;
mod validate;

pub use transform::{FnTransform, IdentityTransform, PayloadTransform};
pub use validate::{FieldKind, JsonSchemaValidator, PayloadValidator, SchemaValidator, ValidationError};

use crate::{Error, ErrorContext};
use serde::Serialize;
use serde_json::Value;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct ProcessingOutcome {
    pub processed: bool,
    pub data: Option<Value>,
    /// Set when validation rejected the payload.
    pub reason: Option<String>,
    /// Set when the transform failed.
    pub error: Option<Error>,
    pub processing_time: Duration,
}

impl ProcessingOutcome {
    /// Turn the outcome into a `Result`, for callers that propagate.
    pub fn into_result(self, endpoint: &str) -> crate::Result<Value> {
        if let Some(e) = self.error {
            return Err(e);
        }
        match (self.processed, self.data, self.reason) {
            (true, Some(data), _) => Ok(data),
            (_, _, reason) => Err(Error::validation_with_context(
                reason.unwrap_or_else(|| "payload rejected".to_string()),
                ErrorContext::new()
                    .with_source("data_processor")
                    .with_endpoint(endpoint),
            )),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ProcessingStats {
    pub processed: u64,
    pub skipped: u64,
    pub errors: u64,
    pub average_processing_ms: f64,
}

impl ProcessingStats {
    pub fn total(&self) -> u64 {
        self.processed + self.skipped + self.errors
    }
}

pub struct DataProcessor {
    validator: Option<Arc<dyn PayloadValidator>>,
    transform: Arc<dyn PayloadTransform>,
    stats: Mutex<ProcessingStats>,
}

impl DataProcessor {
    pub fn new() -> Self {
        Self {
            validator: None,
            transform: Arc::new(IdentityTransform),
            stats: Mutex::new(ProcessingStats::default()),
        }
    }

    pub fn with_validator(mut self, validator: Arc<dyn PayloadValidator>) -> Self {
        self.validator = Some(validator);
        self
    }

    pub fn with_transform(mut self, transform: Arc<dyn PayloadTransform>) -> Self {
        self.transform = transform;
        self
    }

    pub async fn process(&self, raw: Value) -> ProcessingOutcome {
        let started = Instant::now();

        if let Some(validator) = &self.validator {
            if let Err(e) = validator.validate(&raw) {
                debug!(reason = %e, "payload rejected by validator");
                let outcome = ProcessingOutcome {
                    processed: false,
                    data: None,
                    reason: Some(e.to_string()),
                    error: None,
                    processing_time: started.elapsed(),
                };
                self.record(&outcome);
                return outcome;
            }
        }

        let outcome = match self.transform.transform(raw).await {
            Ok(data) => ProcessingOutcome {
                processed: true,
                data: Some(data),
                reason: None,
                error: None,
                processing_time: started.elapsed(),
            },
            Err(e) => {
                warn!(error = %e, "payload transform failed");
                ProcessingOutcome {
                    processed: false,
                    data: None,
                    reason: None,
                    error: Some(e),
                    processing_time: started.elapsed(),
                }
            }
        };
        self.record(&outcome);
        outcome
    }

    fn record(&self, outcome: &ProcessingOutcome) {
        let Ok(mut s) = self.stats.lock() else {
            return;
        };
        if outcome.processed {
            s.processed += 1;
        } else if outcome.error.is_some() {
            s.errors += 1;
        } else {
            s.skipped += 1;
        }
        let n = s.total() as f64;
        let ms = outcome.processing_time.as_secs_f64() * 1000.0;
        s.average_processing_ms += (ms - s.average_processing_ms) / n;
    }

    pub fn stats(&self) -> ProcessingStats {
        self.stats.lock().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn reset(&self) {
        if let Ok(mut s) = self.stats.lock() {
            *s = ProcessingStats::default();
        }
    }
}

impl Default for DataProcessor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_no_validator_passes_through() {
        let p = DataProcessor::new();
        let out = p.process(json!({"items": [1]})).await;
        assert!(out.processed);
        assert_eq!(out.data, Some(json!({"items": [1]})));
        assert_eq!(p.stats().processed, 1);
    }

    #[tokio::test]
    async fn test_rejected_payload_is_skipped_with_reason() {
        let p = DataProcessor::new().with_validator(Arc::new(
            SchemaValidator::new().require("items", FieldKind::Array),
        ));
        let out = p.process(json!({"nope": true})).await;
        assert!(!out.processed);
        assert!(out.error.is_none());
        assert_eq!(out.reason.as_deref(), Some("/items: required field missing"));

        let stats = p.stats();
        assert_eq!(stats.skipped, 1);
        assert_eq!(stats.processed, 0);

        let err = out.into_result("/api/sessions").unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
    }

    #[tokio::test]
    async fn test_async_transform_and_failure() {
        let p = DataProcessor::new().with_transform(Arc::new(FnTransform::new(|raw: Value| async move {
            match raw.get("items") {
                Some(items) => Ok(json!({ "count": items.as_array().map(|a| a.len()).unwrap_or(0) })),
                None => Err(Error::runtime_with_context(
                    "no items",
                    ErrorContext::new().with_source("test"),
                )),
            }
        })));

        let out = p.process(json!({"items": [1, 2, 3]})).await;
        assert_eq!(out.data, Some(json!({"count": 3})));

        let out = p.process(json!({})).await;
        assert!(!out.processed);
        assert!(out.error.is_some());

        let stats = p.stats();
        assert_eq!(stats.processed, 1);
        assert_eq!(stats.errors, 1);
        assert!(stats.average_processing_ms >= 0.0);

        p.reset();
        assert_eq!(p.stats().total(), 0);
    }
}
