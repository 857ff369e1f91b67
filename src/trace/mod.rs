//! Execution traces: span forests built live or reconstructed from contexts.

pub mod span;
pub mod tracer;

pub use span::{
    SpanNode, SpanStatus, SpanType, Trace, TraceExport, TraceSpan, TraceStatistics,
    TraceTreeExport,
};
pub use tracer::TaskTracer;
