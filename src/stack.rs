//! Stack trace capture with engine-frame stripping.
//!
//! Captures are taken for error entries without a source error and for
//! entries that outlived a caller-supplied threshold. Leading frames that
//! belong to this crate (or the capture machinery) are dropped so the top
//! frame is the instrumented application frame, not the engine.

use serde::{Deserialize, Serialize};
use tracing::warn;

/// One resolved frame of a captured stack trace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StackFrame {
    pub function: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub line: Option<u32>,
}

/// Capture the current stack with leading engine frames stripped.
///
/// Returns an empty vec (and warns) when no caller frame is found, which
/// only happens if symbol resolution failed for the whole stack.
pub fn capture_stripped() -> Vec<StackFrame> {
    let backtrace = backtrace::Backtrace::new();
    let mut frames = Vec::new();
    for frame in backtrace.frames() {
        for symbol in frame.symbols() {
            frames.push(StackFrame {
                function: symbol.name().map(|n| n.to_string()).unwrap_or_default(),
                file: symbol.filename().map(|p| p.display().to_string()),
                line: symbol.lineno(),
            });
        }
    }
    match frames.iter().position(|f| !is_engine_frame(&f.function)) {
        Some(first_caller) => frames.split_off(first_caller),
        None => {
            warn!("stack capture found no caller frame outside the tracing engine");
            Vec::new()
        }
    }
}

fn is_engine_frame(function: &str) -> bool {
    function.is_empty()
        || function.starts_with("backtrace::")
        || function.starts_with("tracelight::")
        || function.starts_with("<tracelight::")
}
