//! Injected observability capability.
//!
//! Components receive an `Arc<dyn Telemetry>` and open a span per
//! operation. The default [`TracingTelemetry`] maps spans onto `tracing`
//! spans and events; exporter lifecycle belongs to the binary.

use std::time::Instant;

use tracing::{debug, info, warn, Span};

/// Final status of a span.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpanStatus {
    Unset,
    Ok,
    Error,
}

impl SpanStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SpanStatus::Unset => "unset",
            SpanStatus::Ok => "ok",
            SpanStatus::Error => "error",
        }
    }
}

/// Factory for operation spans.
pub trait Telemetry: Send + Sync {
    fn span(&self, scope: &'static str, name: &'static str) -> Box<dyn SpanGuard>;
}

/// An open span. Ends when dropped.
pub trait SpanGuard: Send {
    fn set_attribute(&mut self, key: &'static str, value: String);

    /// Attach an error event without changing the status.
    fn record_error(&mut self, error: &str);

    fn set_status(&mut self, status: SpanStatus, message: &str);

    /// Record `error` and mark the span failed with `message`.
    fn fail(&mut self, error: &str, message: &str) {
        self.record_error(error);
        self.set_status(SpanStatus::Error, message);
    }
}

/// Telemetry backed by the `tracing` subscriber installed by the binary.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingTelemetry;

impl Telemetry for TracingTelemetry {
    fn span(&self, scope: &'static str, name: &'static str) -> Box<dyn SpanGuard> {
        Box::new(TracingSpan {
            span: tracing::info_span!("operation", scope, name),
            scope,
            name,
            status: SpanStatus::Unset,
            status_message: String::new(),
            started: Instant::now(),
        })
    }
}

struct TracingSpan {
    span: Span,
    scope: &'static str,
    name: &'static str,
    status: SpanStatus,
    status_message: String,
    started: Instant,
}

impl SpanGuard for TracingSpan {
    fn set_attribute(&mut self, key: &'static str, value: String) {
        self.span
            .in_scope(|| debug!(key, value = %value, "span_attribute"));
    }

    fn record_error(&mut self, error: &str) {
        self.span.in_scope(|| warn!(error = %error, "span_error"));
    }

    fn set_status(&mut self, status: SpanStatus, message: &str) {
        self.status = status;
        self.status_message = message.to_string();
    }
}

impl Drop for TracingSpan {
    fn drop(&mut self) {
        let elapsed_ms = self.started.elapsed().as_millis() as u64;
        self.span.in_scope(|| {
            info!(
                scope = self.scope,
                name = self.name,
                status = self.status.as_str(),
                status_message = %self.status_message,
                elapsed_ms = elapsed_ms,
                "span_end"
            )
        });
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Telemetry that keeps every finished span in memory.

    use std::sync::{Arc, Mutex};

    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    pub struct FinishedSpan {
        pub scope: &'static str,
        pub name: &'static str,
        pub attributes: Vec<(&'static str, String)>,
        pub errors: Vec<String>,
        pub status: SpanStatus,
        pub status_message: String,
    }

    #[derive(Clone, Default)]
    pub struct RecordingTelemetry {
        finished: Arc<Mutex<Vec<FinishedSpan>>>,
    }

    impl RecordingTelemetry {
        pub fn spans(&self, name: &str) -> Vec<FinishedSpan> {
            self.finished
                .lock()
                .unwrap()
                .iter()
                .filter(|s| s.name == name)
                .cloned()
                .collect()
        }
    }

    impl Telemetry for RecordingTelemetry {
        fn span(&self, scope: &'static str, name: &'static str) -> Box<dyn SpanGuard> {
            Box::new(RecordingSpan {
                sink: Arc::clone(&self.finished),
                span: FinishedSpan {
                    scope,
                    name,
                    attributes: Vec::new(),
                    errors: Vec::new(),
                    status: SpanStatus::Unset,
                    status_message: String::new(),
                },
            })
        }
    }

    struct RecordingSpan {
        sink: Arc<Mutex<Vec<FinishedSpan>>>,
        span: FinishedSpan,
    }

    impl SpanGuard for RecordingSpan {
        fn set_attribute(&mut self, key: &'static str, value: String) {
            self.span.attributes.push((key, value));
        }

        fn record_error(&mut self, error: &str) {
            self.span.errors.push(error.to_string());
        }

        fn set_status(&mut self, status: SpanStatus, message: &str) {
            self.span.status = status;
            self.span.status_message = message.to_string();
        }
    }

    impl Drop for RecordingSpan {
        fn drop(&mut self) {
            self.sink.lock().unwrap().push(self.span.clone());
        }
    }
}
