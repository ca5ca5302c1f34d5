use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::warn;
use parking_lot::Mutex;

use crate::logging::LogContext;

const DEFAULT_CAPACITY: usize = 256;

/// A swallowed failure from a best-effort side effect.
#[derive(Debug, Clone, PartialEq)]
pub struct Diagnostic {
    pub source: String,
    pub label: String,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// Bounded capture buffer for failures that must not reach the caller.
#[derive(Debug, Clone)]
pub struct Diagnostics {
    entries: Arc<Mutex<VecDeque<Diagnostic>>>,
    capacity: usize,
}

impl Default for Diagnostics {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }
}

impl Diagnostics {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            capacity: capacity.max(1),
        }
    }

    pub fn record(&self, ctx: &LogContext, label: &str, message: impl Into<String>) {
        let diagnostic = Diagnostic {
            source: format!("{}.{}", ctx.module(), ctx.method()),
            label: label.to_string(),
            message: message.into(),
            at: Utc::now(),
        };
        warn!(target: ctx.module(), "{} {} failed (ignored): {}", ctx, label, diagnostic.message);
        let mut entries = self.entries.lock();
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(diagnostic);
    }

    /// Await a side effect whose failure is captured here and never propagated.
    /// Returns the value on success.
    pub async fn best_effort<T, E, F>(&self, ctx: &LogContext, label: &str, effect: F) -> Option<T>
    where
        F: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        match effect.await {
            Ok(value) => Some(value),
            Err(err) => {
                self.record(ctx, label, err.to_string());
                None
            }
        }
    }

    pub fn snapshot(&self) -> Vec<Diagnostic> {
        self.entries.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_best_effort_swallows_and_records() {
        let diagnostics = Diagnostics::default();
        let ctx = LogContext::new("WebhookService", "report_user_push");

        let out = diagnostics
            .best_effort(&ctx, "analytics", async { Err::<(), _>("tracker offline") })
            .await;
        assert!(out.is_none());

        let entries = diagnostics.snapshot();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].source, "WebhookService.report_user_push");
        assert_eq!(entries[0].message, "tracker offline");
    }

    #[test]
    fn test_capacity_drops_oldest() {
        let diagnostics = Diagnostics::with_capacity(2);
        let ctx = LogContext::new("Test", "cap");
        diagnostics.record(&ctx, "a", "1");
        diagnostics.record(&ctx, "b", "2");
        diagnostics.record(&ctx, "c", "3");
        let labels: Vec<_> = diagnostics.snapshot().into_iter().map(|d| d.label).collect();
        assert_eq!(labels, vec!["b", "c"]);
    }
}
