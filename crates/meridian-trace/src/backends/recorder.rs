use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::context::SpanContext;
use crate::span::TagValue;
use crate::tracer::{BackendSpan, SpanStart, TraceBackend};

const DEFAULT_CAPACITY: usize = 1024;

/// A finished span as the recorder saw it.
#[derive(Debug, Clone)]
pub struct RecordedSpan {
    pub name: String,
    pub kind: &'static str,
    pub context: SpanContext,
    pub parent: Option<SpanContext>,
    pub tags: HashMap<String, TagValue>,
    pub query: Option<String>,
    pub error: Option<String>,
    pub duration: Duration,
}

/// Keeps the most recent finished spans (segments) in a bounded buffer.
#[derive(Clone)]
pub struct SegmentRecorder {
    inner: Arc<RecorderInner>,
}

struct RecorderInner {
    capacity: usize,
    finished: Mutex<VecDeque<RecordedSpan>>,
    ended: AtomicU64,
}

impl SegmentRecorder {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Arc::new(RecorderInner {
                capacity: capacity.max(1),
                finished: Mutex::new(VecDeque::new()),
                ended: AtomicU64::new(0),
            }),
        }
    }

    /// Snapshot of the retained spans, oldest first.
    pub fn finished(&self) -> Vec<RecordedSpan> {
        self.inner.finished.lock().iter().cloned().collect()
    }

    pub fn find(&self, name: &str) -> Option<RecordedSpan> {
        self.inner
            .finished
            .lock()
            .iter()
            .rev()
            .find(|s| s.name == name)
            .cloned()
    }

    /// Total spans ended since creation, including evicted ones.
    pub fn ended_count(&self) -> u64 {
        self.inner.ended.load(Ordering::Relaxed)
    }

    pub fn clear(&self) {
        self.inner.finished.lock().clear();
    }
}

impl Default for SegmentRecorder {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SegmentRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentRecorder")
            .field("capacity", &self.inner.capacity)
            .field("ended", &self.ended_count())
            .finish()
    }
}

impl TraceBackend for SegmentRecorder {
    fn name(&self) -> &str {
        "recorder"
    }

    fn start_span(&self, start: &SpanStart<'_>) -> Box<dyn BackendSpan> {
        Box::new(Segment {
            recorder: self.inner.clone(),
            started: Instant::now(),
            record: Some(RecordedSpan {
                name: start.name.to_string(),
                kind: start.kind.as_str(),
                context: start.context,
                parent: start.parent,
                tags: HashMap::new(),
                query: None,
                error: None,
                duration: Duration::ZERO,
            }),
        })
    }
}

struct Segment {
    recorder: Arc<RecorderInner>,
    started: Instant,
    // None once ended
    record: Option<RecordedSpan>,
}

impl BackendSpan for Segment {
    fn set_tag(&mut self, key: &str, value: &TagValue) {
        if let Some(record) = &mut self.record {
            record.tags.insert(key.to_string(), value.clone());
        }
    }

    fn set_query(&mut self, query: &str) {
        if let Some(record) = &mut self.record {
            record.query = Some(query.to_string());
        }
    }

    fn set_error(&mut self, message: &str) {
        if let Some(record) = &mut self.record {
            record.error = Some(message.to_string());
        }
    }

    fn end(&mut self) {
        let Some(mut record) = self.record.take() else {
            return;
        };
        record.duration = self.started.elapsed();
        self.recorder.ended.fetch_add(1, Ordering::Relaxed);
        let mut finished = self.recorder.finished.lock();
        if finished.len() >= self.recorder.capacity {
            finished.pop_front();
        }
        finished.push_back(record);
    }
}
