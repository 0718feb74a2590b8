//! Progress event types for model loading and generation.
//!
//! Decouples the engine's internal loop from whatever a caller wants to do
//! with progress updates (CLI spinner, GUI signal, log line).

/// Progress events emitted during model loading and generation.
#[derive(Debug, Clone)]
pub enum ProgressEvent {
    /// A model has started loading into the tensor runtime.
    ModelLoadStarted {
        /// Logical model name (e.g. `"speech_encoder"`).
        model_name: String,
    },

    /// A model finished loading.
    ModelLoadComplete {
        /// Logical model name.
        model_name: String,
        /// Time taken to load, in seconds.
        duration_secs: f64,
    },

    /// Voice conditionals were produced or retrieved for a generation call.
    ConditionalsReady {
        /// Cache key the conditionals are associated with, if any.
        key: Option<String>,
    },

    /// An autoregressive decode call has started.
    GenerationStarted {
        /// Upper bound on decode steps for this call.
        max_steps: usize,
    },

    /// One autoregressive decode step completed.
    GenerationStep {
        /// Index of the step that just completed (0-based).
        step: usize,
        /// Upper bound on decode steps for this call.
        max_steps: usize,
    },

    /// A generation call completed successfully.
    GenerationComplete {
        /// Number of audio samples produced.
        samples: usize,
        /// Wall-clock time for the whole call, in seconds.
        duration_secs: f64,
    },

    /// A model load or generation call failed.
    Error {
        /// Human-readable error description.
        message: String,
    },
}

/// Callback type for receiving progress events.
pub type ProgressCallback = Box<dyn Fn(ProgressEvent) + Send + Sync>;

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn callback_receives_events_in_order() {
        let events: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let events_clone = Arc::clone(&events);

        let callback: ProgressCallback = Box::new(move |event| {
            let label = match &event {
                ProgressEvent::ModelLoadStarted { .. } => "load_started",
                ProgressEvent::ModelLoadComplete { .. } => "load_complete",
                ProgressEvent::ConditionalsReady { .. } => "conditionals_ready",
                ProgressEvent::GenerationStarted { .. } => "gen_started",
                ProgressEvent::GenerationStep { .. } => "gen_step",
                ProgressEvent::GenerationComplete { .. } => "gen_complete",
                ProgressEvent::Error { .. } => "error",
            };
            let Ok(mut guard) = events_clone.lock() else {
                return;
            };
            guard.push(label.to_owned());
        });

        callback(ProgressEvent::ModelLoadStarted {
            model_name: "speech_encoder".into(),
        });
        callback(ProgressEvent::ModelLoadComplete {
            model_name: "speech_encoder".into(),
            duration_secs: 0.5,
        });
        callback(ProgressEvent::GenerationStarted { max_steps: 1024 });
        callback(ProgressEvent::GenerationStep {
            step: 0,
            max_steps: 1024,
        });
        callback(ProgressEvent::GenerationComplete {
            samples: 48_000,
            duration_secs: 1.2,
        });

        let guard = events.lock().unwrap_or_else(|e| e.into_inner());
        assert_eq!(
            guard.as_slice(),
            &[
                "load_started",
                "load_complete",
                "gen_started",
                "gen_step",
                "gen_complete",
            ]
        );
    }

    #[test]
    fn generation_step_reports_progress_fraction() {
        let events: Arc<Mutex<Vec<(usize, usize)>>> = Arc::new(Mutex::new(Vec::new()));
        let events_clone = Arc::clone(&events);

        let callback: ProgressCallback = Box::new(move |event| {
            if let ProgressEvent::GenerationStep { step, max_steps } = event {
                let Ok(mut guard) = events_clone.lock() else {
                    return;
                };
                guard.push((step, max_steps));
            }
        });

        for step in 0..3 {
            callback(ProgressEvent::GenerationStep {
                step,
                max_steps: 8,
            });
        }

        let guard = events.lock().unwrap_or_else(|e| e.into_inner());
        assert_eq!(guard.as_slice(), &[(0, 8), (1, 8), (2, 8)]);
    }
}
