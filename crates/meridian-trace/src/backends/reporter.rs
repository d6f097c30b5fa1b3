use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc;
use tracing::{error, warn};

use crate::context::SpanContext;
use crate::span::TagValue;
use crate::tracer::{BackendSpan, SpanStart, TraceBackend};

/// A span failure handed to the error-reporting sink.
#[derive(Debug, Clone)]
pub struct ErrorReport {
    pub span_name: String,
    pub context: SpanContext,
    pub message: String,
}

/// Forwards span errors to a bounded channel. Only spans that record an
/// error produce a report; reports that do not fit are counted and dropped
/// so span code never blocks on the sink.
#[derive(Clone)]
pub struct ErrorReporter {
    tx: mpsc::Sender<ErrorReport>,
    dropped: Arc<AtomicU64>,
}

impl ErrorReporter {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<ErrorReport>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                tx,
                dropped: Arc::new(AtomicU64::new(0)),
            },
            rx,
        )
    }

    /// Queue a report without waiting. Returns false when it was dropped.
    pub fn report(&self, report: ErrorReport) -> bool {
        match self.tx.try_send(report) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(report)) => {
                let n = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(span = %report.span_name, dropped = n, "error report queue full");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Log every report until all senders are gone.
    pub async fn drain_to_log(mut rx: mpsc::Receiver<ErrorReport>) {
        while let Some(report) = rx.recv().await {
            error!(
                span = %report.span_name,
                trace_id = %report.context.trace_id,
                span_id = %report.context.span_id,
                "{}",
                report.message
            );
        }
    }
}

impl std::fmt::Debug for ErrorReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ErrorReporter")
            .field("dropped", &self.dropped())
            .finish()
    }
}

impl TraceBackend for ErrorReporter {
    fn name(&self) -> &str {
        "error-reporter"
    }

    fn start_span(&self, start: &SpanStart<'_>) -> Box<dyn BackendSpan> {
        Box::new(ReportedSpan {
            reporter: self.clone(),
            span_name: start.name.to_string(),
            context: start.context,
            ended: false,
        })
    }
}

struct ReportedSpan {
    reporter: ErrorReporter,
    span_name: String,
    context: SpanContext,
    ended: bool,
}

impl BackendSpan for ReportedSpan {
    fn set_tag(&mut self, _key: &str, _value: &TagValue) {}

    /// Every error is reported as it is recorded, not once per span.
    fn set_error(&mut self, message: &str) {
        if self.ended {
            return;
        }
        self.reporter.report(ErrorReport {
            span_name: self.span_name.clone(),
            context: self.context,
            message: message.to_string(),
        });
    }

    fn end(&mut self) {
        self.ended = true;
    }
}
