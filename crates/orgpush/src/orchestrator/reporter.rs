//! Progress reporting for long-running workflows.

use std::sync::Mutex;

/// Receives human-readable progress lines from a workflow.
pub trait JobReporter: Send + Sync {
    fn report(&self, message: &str);
}

/// Writes progress lines to the log at info level.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogReporter;

impl JobReporter for LogReporter {
    fn report(&self, message: &str) {
        tracing::info!("{}", message);
    }
}

/// Keeps progress lines in memory, e.g. for an admin job view.
#[derive(Debug, Default)]
pub struct CollectingReporter {
    messages: Mutex<Vec<String>>,
}

impl CollectingReporter {
    pub fn messages(&self) -> Vec<String> {
        self.messages
            .lock()
            .map(|m| m.clone())
            .unwrap_or_default()
    }
}

impl JobReporter for CollectingReporter {
    fn report(&self, message: &str) {
        if let Ok(mut messages) = self.messages.lock() {
            messages.push(message.to_string());
        }
    }
}
