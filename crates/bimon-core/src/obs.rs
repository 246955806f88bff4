//! Structured observability hooks for cache and bisection lifecycle events.
//!
//! This module provides:
//! - A session-scoped tracing span via [`session_span`]
//! - Emission functions for key events: bundle sealed, extraction finished,
//!   candidate picked, phase changed, compile classified, session closed,
//!   precompile finished
//!
//! Events are emitted at `info!` level (filter with `RUST_LOG`).

use tracing::info;

use crate::domain::{CommitId, Mark};

/// Span tagging every event of one bisect session.
///
/// Attach it to async work with `tracing::Instrument` rather than entering
/// it, since the session loop awaits across threads.
pub fn session_span(session_id: &str) -> tracing::Span {
    tracing::info_span!("bimon.session", session_id = %session_id)
}

pub fn emit_bundle_sealed(bundle_id: &str, commits: usize, size_bytes: u64) {
    info!(event = "bundle.sealed", bundle_id = %bundle_id, commits, size_bytes);
}

pub fn emit_extraction_finished(commit: &CommitId, duration_ms: u64, success: bool) {
    info!(
        event = "prefetch.extracted",
        commit = %commit.short(),
        duration_ms,
        success,
    );
}

pub fn emit_candidate_picked(commit: &CommitId, cached: bool, remaining: usize) {
    info!(event = "bisect.pick", commit = %commit.short(), cached, remaining);
}

pub fn emit_phase_changed(from: &str, to: &str) {
    info!(event = "bisect.phase", from = %from, to = %to);
}

pub fn emit_marked(commit: &CommitId, mark: Mark, automated: bool) {
    info!(event = "bisect.marked", commit = %commit.short(), mark = %mark, automated);
}

pub fn emit_compile_classified(commit: &CommitId, prior_successes: usize, classified: bool) {
    info!(
        event = "compile.classified",
        commit = %commit.short(),
        prior_successes,
        classified,
    );
}

pub fn emit_precompile_finished(compiled: usize, failed: usize, classified: usize) {
    info!(event = "precompile.finished", compiled, failed, classified);
}

pub fn emit_session_closed(session_id: &str, remaining: usize, discarded: bool) {
    info!(event = "session.closed", session_id = %session_id, remaining, discarded);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_span_create() {
        let span = session_span("test-session");
        let _entered = span.enter();
        emit_phase_changed("narrowing", "resolving");
    }
}
