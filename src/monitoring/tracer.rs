/*!
 * Structured Tracing
 * Spans for trap dispatch and coordinator calls using the tracing crate
 *
 * Nothing here may be called from the raw signal handler. Spans are opened
 * on the trampoline side, after the context has been captured and the
 * handler has switched back to ordinary execution rules.
 */

use crate::core::config::env::TRACE_JSON;
use crate::core::types::SlotId;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::{debug, info, span, warn, Level};
use tracing_subscriber::{fmt::format::FmtSpan, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

static NEXT_TRACE_ID: AtomicU64 = AtomicU64::new(1);

/// Initialize structured tracing
///
/// Environment variables:
/// - RUST_LOG: Set log level (default: info)
/// - PERSONALITY_TRACE_JSON: Enable JSON output (default: false)
///
/// Returns false if a global subscriber was already installed.
pub fn init_tracing() -> bool {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let use_json = std::env::var(TRACE_JSON)
        .map(|v| v == "1" || v == "true")
        .unwrap_or(false);

    let registry = tracing_subscriber::registry().with(env_filter);

    let installed = if use_json {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_thread_names(true)
                    .with_current_span(true)
                    .with_span_list(true)
                    .with_span_events(FmtSpan::CLOSE),
            )
            .try_init()
            .is_ok()
    } else {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_thread_names(true)
                    .with_line_number(true)
                    .compact(),
            )
            .try_init()
            .is_ok()
    };
    if installed {
        info!(json = use_json, "Structured tracing initialized");
    }
    installed
}

fn next_trace_id() -> u64 {
    NEXT_TRACE_ID.fetch_add(1, Ordering::Relaxed)
}

/// Span around one guest dispatch (exception, APC, syscall, callback)
pub struct DispatchSpan {
    span: tracing::Span,
    start: Instant,
    kind: &'static str,
    trace_id: u64,
}

impl DispatchSpan {
    pub fn new(kind: &'static str, slot: Option<SlotId>) -> Self {
        let trace_id = next_trace_id();
        let span = span!(
            Level::DEBUG,
            "dispatch",
            trace_id,
            kind,
            slot = slot.map(|s| s.0),
            status = tracing::field::Empty,
            duration_us = tracing::field::Empty,
        );
        Self {
            span,
            start: Instant::now(),
            kind,
            trace_id,
        }
    }

    pub fn trace_id(&self) -> u64 {
        self.trace_id
    }

    /// Record the guest-visible outcome
    pub fn record_status(&self, status: u32) {
        self.span.record("status", format_args!("{:#010x}", status));
    }

    pub fn enter(&self) -> tracing::span::Entered<'_> {
        self.span.enter()
    }
}

impl Drop for DispatchSpan {
    fn drop(&mut self) {
        let duration = self.start.elapsed();
        let _entered = self.span.enter();
        self.span.record("duration_us", duration.as_micros() as u64);
        debug!(
            trace_id = self.trace_id,
            kind = self.kind,
            duration_us = duration.as_micros() as u64,
            "dispatch completed"
        );
    }
}

/// Span around one coordinator request
pub struct CoordinatorSpan {
    span: tracing::Span,
    start: Instant,
    opcode: &'static str,
}

impl CoordinatorSpan {
    pub fn new(opcode: &'static str) -> Self {
        let span = span!(
            Level::TRACE,
            "server_call",
            opcode,
            status = tracing::field::Empty,
        );
        Self {
            span,
            start: Instant::now(),
            opcode,
        }
    }

    pub fn record_status(&self, status: u32) {
        self.span.record("status", format_args!("{:#010x}", status));
    }
}

impl Drop for CoordinatorSpan {
    fn drop(&mut self) {
        let duration = self.start.elapsed();
        // Selects block by design; only plain requests are expected to be quick
        if self.opcode != "select" && duration.as_millis() > 50 {
            let _entered = self.span.enter();
            warn!(
                opcode = self.opcode,
                duration_ms = duration.as_millis() as u64,
                slow = true,
                "slow coordinator call"
            );
        }
    }
}

/// Helper to create a dispatch span
#[inline]
pub fn span_dispatch(kind: &'static str, slot: Option<SlotId>) -> DispatchSpan {
    DispatchSpan::new(kind, slot)
}

/// Helper to create a coordinator span
#[inline]
pub fn span_server_call(opcode: &'static str) -> CoordinatorSpan {
    CoordinatorSpan::new(opcode)
}
