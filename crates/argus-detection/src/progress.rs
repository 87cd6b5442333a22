use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    TrainStarted { model: String, start_step: u64, total_steps: u64 },
    Loop { step: u64, total_steps: u64, total_loss: f64, learning_rate: f64 },
    CheckpointSaved { step: u64 },
    Evaluated { step: u64, metrics: Vec<(String, f64)> },
    /// No new checkpoint yet; `timeout_secs` is `None` when waiting forever.
    Waiting { timeout_secs: Option<u64> },
    Finished { step: u64 },
}

pub trait ProgressSink: Send + Sync {
    fn on_event(&self, event: ProgressEvent);
}

/// Forwards progress to `tracing` at info level.
#[derive(Debug, Default)]
pub struct TracingProgressSink;

impl ProgressSink for TracingProgressSink {
    fn on_event(&self, event: ProgressEvent) {
        match event {
            ProgressEvent::TrainStarted { model, start_step, total_steps } => {
                tracing::info!("training {model} from step {start_step} to {total_steps}");
            }
            ProgressEvent::Loop { step, total_steps, total_loss, learning_rate } => {
                tracing::info!("step {step}/{total_steps}: loss = {total_loss:.5}, lr = {learning_rate:.6}");
            }
            ProgressEvent::CheckpointSaved { step } => tracing::info!("saved checkpoint at step {step}"),
            ProgressEvent::Evaluated { step, metrics } => {
                let rendered: Vec<String> = metrics.iter().map(|(k, v)| format!("{k} = {v:.4}")).collect();
                tracing::info!("step {step}: {}", rendered.join(", "));
            }
            ProgressEvent::Waiting { timeout_secs: Some(secs) } => {
                tracing::info!("waiting up to {secs}s for a new checkpoint");
            }
            ProgressEvent::Waiting { timeout_secs: None } => tracing::info!("waiting for a new checkpoint"),
            ProgressEvent::Finished { step } => tracing::info!("finished at step {step}"),
        }
    }
}

/// Keeps every event, for tests and embedding callers.
#[derive(Debug, Default)]
pub struct RecordingProgressSink {
    events: std::sync::Mutex<Vec<ProgressEvent>>,
}

impl RecordingProgressSink {
    #[must_use]
    pub fn events(&self) -> Vec<ProgressEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }
}

impl ProgressSink for RecordingProgressSink {
    fn on_event(&self, event: ProgressEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}
