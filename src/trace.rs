use log::{debug, info};
use serde::Serialize;
use serde_json::Value;
use std::sync::{Arc, Mutex};
use std::time::Instant;

/// Per-run record of pipeline stages and their attributes.
///
/// Each run builds its own trace and hands it to every stage, so stages can be
/// exercised in isolation without process-wide setup.
#[derive(Clone, Default)]
pub struct PipelineTrace {
    inner: Arc<Mutex<TraceData>>,
}

#[derive(Default)]
struct TraceData {
    stages: Vec<StageRecord>,
}

#[derive(Clone, Debug, Serialize)]
pub struct StageRecord {
    pub name: String,
    pub duration_ms: Option<f64>,
    pub attributes: Vec<(String, Value)>,
    pub error: Option<String>,
}

impl PipelineTrace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a named stage; the stage is closed and timed when the span drops.
    pub fn stage(&self, name: &str) -> StageSpan<'_> {
        let index = match self.inner.lock() {
            Ok(mut data) => {
                data.stages.push(StageRecord {
                    name: name.to_string(),
                    duration_ms: None,
                    attributes: Vec::new(),
                    error: None,
                });
                Some(data.stages.len() - 1)
            }
            Err(_) => None,
        };
        debug!("Entering stage {}", name);
        StageSpan {
            trace: self,
            index,
            started: Instant::now(),
        }
    }

    /// Stages recorded so far, in the order they were opened.
    pub fn stages(&self) -> Vec<StageRecord> {
        self.inner
            .lock()
            .map(|data| data.stages.clone())
            .unwrap_or_default()
    }

    /// Looks up the most recent value recorded for `key` on stage `stage`.
    pub fn attribute(&self, stage: &str, key: &str) -> Option<Value> {
        let data = self.inner.lock().ok()?;
        data.stages
            .iter()
            .rev()
            .filter(|record| record.name == stage)
            .flat_map(|record| record.attributes.iter().rev())
            .find(|(name, _)| name == key)
            .map(|(_, value)| value.clone())
    }

    pub fn log_summary(&self) {
        for stage in &self.stages() {
            let attributes = stage
                .attributes
                .iter()
                .map(|(key, value)| format!("{}={}", key, value))
                .collect::<Vec<_>>()
                .join(", ");
            let duration = stage
                .duration_ms
                .map(|ms| format!("{:.1}ms", ms))
                .unwrap_or_else(|| "open".to_string());
            match &stage.error {
                Some(error) => info!(
                    "stage {} failed after {} [{}]: {}",
                    stage.name, duration, attributes, error
                ),
                None => info!("stage {} took {} [{}]", stage.name, duration, attributes),
            }
        }
    }

    fn update<F>(&self, index: Option<usize>, update: F)
    where
        F: FnOnce(&mut StageRecord),
    {
        let Some(index) = index else {
            return;
        };
        if let Ok(mut data) = self.inner.lock() {
            if let Some(record) = data.stages.get_mut(index) {
                update(record);
            }
        }
    }
}

pub struct StageSpan<'a> {
    trace: &'a PipelineTrace,
    index: Option<usize>,
    started: Instant,
}

impl StageSpan<'_> {
    pub fn set_attribute<K: Into<String>, V: Into<Value>>(&self, key: K, value: V) {
        let key = key.into();
        let value = value.into();
        self.trace.update(self.index, move |record| {
            record.attributes.push((key, value));
        });
    }

    pub fn record_error<E: std::fmt::Display>(&self, error: &E) {
        let message = error.to_string();
        self.trace.update(self.index, move |record| {
            record.error = Some(message);
        });
    }
}

impl Drop for StageSpan<'_> {
    fn drop(&mut self) {
        let elapsed_ms = self.started.elapsed().as_secs_f64() * 1000.0;
        self.trace.update(self.index, move |record| {
            record.duration_ms = Some(elapsed_ms);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn stages_record_attributes_and_durations() {
        let trace = PipelineTrace::new();
        {
            let span = trace.stage("extract-features");
            span.set_attribute("num_features", 6);
        }
        {
            let span = trace.stage("evaluate");
            span.set_attribute("mae", 12.5);
        }

        let stages = trace.stages();
        assert_eq!(stages.len(), 2);
        assert!(stages.iter().all(|stage| stage.duration_ms.is_some()));
        assert_eq!(stages[1].name, "evaluate");
        assert_eq!(
            trace.attribute("extract-features", "num_features"),
            Some(json!(6))
        );
        assert_eq!(trace.attribute("evaluate", "mae"), Some(json!(12.5)));
        assert_eq!(trace.attribute("evaluate", "missing"), None);
    }

    #[test]
    fn errors_are_attached_to_the_open_stage() {
        let trace = PipelineTrace::new();
        {
            let span = trace.stage("tune-model");
            span.record_error(&"search failed");
        }
        assert_eq!(trace.stages()[0].error.as_deref(), Some("search failed"));
    }
}
