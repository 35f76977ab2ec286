//! Debug commands for development and troubleshooting.

use crate::diagnostics;
use crate::trace;
use serde_json::Value;

/// Enable connection tracing at runtime
#[tauri::command]
pub fn debug_enable_trace() -> bool {
    trace::enable_trace();
    true
}

/// Disable connection tracing at runtime
#[tauri::command]
pub fn debug_disable_trace() -> bool {
    trace::disable_trace();
    false
}

/// Check if connection tracing is enabled
#[tauri::command]
pub fn debug_is_trace_enabled() -> bool {
    trace::is_trace_enabled()
}

/// Export the bounded ring of trace events, connect attempts, and panic
/// records as one opaque JSON blob for bug reports.
#[tauri::command]
pub fn debug_export_diagnostics() -> Value {
    diagnostics::export()
}
