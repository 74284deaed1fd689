//! Event ingestion: the entry point used by interceptors.
//!
//! A [`Tracker`] owns the recorded [`Root`] and the per-context bookkeeping.
//! Every ingestion method is fail-soft: events that arrive outside a session
//! or with a stale handle are dropped and logged, never raised.

use crate::config::NPlusOneConfig;
use crate::context::{ContextId, ContextTracker, OperationHandle, SessionBoundary, SessionHandle};
use crate::frame::{FrameExtractor, FrameStack};
use crate::parser::parse_statement_kind;
use crate::registry::{LazyInitialisation, OperationKind, Root, RootView, StatementKind};
use crate::report::render_session;

/// Records sessions, operations and statements reported by interceptors.
///
/// Hosts create one tracker, usually behind an `Arc`, and share it between
/// the traced connections and the assertions that read it.
#[derive(Debug)]
pub struct Tracker {
    config: NPlusOneConfig,
    frames: FrameExtractor,
    contexts: ContextTracker,
    root: Root,
}

impl Default for Tracker {
    fn default() -> Self {
        Self::new(NPlusOneConfig::default())
    }
}

impl Tracker {
    pub fn new(config: NPlusOneConfig) -> Self {
        Self {
            frames: FrameExtractor::from_config(&config),
            config,
            contexts: ContextTracker::new(),
            root: Root::new(),
        }
    }

    pub fn config(&self) -> &NPlusOneConfig {
        &self.config
    }

    /// Recorded sessions.
    pub fn root(&self) -> &Root {
        &self.root
    }

    /// Open a session boundary in `context`.
    pub fn session_opened(&self, context: ContextId, boundary: SessionBoundary) -> SessionHandle {
        let handle = self
            .contexts
            .open_session(context, boundary, || self.capture_frames());
        tracing::trace!(session = %handle.session(), ?boundary, "session opened");
        handle
    }

    /// Close a session boundary. The session is published once its outermost
    /// boundary closes.
    pub fn session_closed(&self, handle: SessionHandle) {
        let Some(session) = self.contexts.close_session(handle) else {
            return;
        };

        if session.operations().is_empty() && !self.config.record_empty_sessions {
            tracing::trace!(session = %session.id(), "skipping session without operations");
            return;
        }

        let session = self.root.append(session);
        tracing::trace!(
            session = %session.id(),
            close_order = session.close_order(),
            operations = session.operations().len(),
            statements = session.statement_count(),
            "session recorded"
        );

        if self.config.report.enabled {
            tracing::debug!(
                session = %session.id(),
                "session report\n{}",
                render_session(&session, &self.config.report)
            );
        }
    }

    /// Start an operation in the context's active session. `None` when no
    /// session is open.
    pub fn operation_triggered(
        &self,
        context: ContextId,
        kind: OperationKind,
    ) -> Option<OperationHandle> {
        let handle = self
            .contexts
            .trigger_operation(context, kind, || self.capture_frames());
        if handle.is_none() {
            tracing::trace!(%kind, "dropping operation outside any session");
        }
        handle
    }

    pub fn operation_completed(&self, handle: &OperationHandle) {
        self.contexts.complete_operation(handle);
    }

    /// Append a statement to the operation behind `handle`.
    pub fn statement_executed(
        &self,
        handle: &OperationHandle,
        kind: StatementKind,
        sql: impl Into<String>,
    ) {
        if !self.contexts.record_statement(handle, kind, sql) {
            tracing::debug!(
                session = %handle.session(),
                %kind,
                "dropping statement for completed operation"
            );
        }
    }

    /// Append a statement to whatever operation is active in `context`.
    ///
    /// Inside a session but outside any operation, the statement becomes its
    /// own explicit operation. Outside any session it is dropped.
    pub fn statement_executed_in_context(&self, context: ContextId, sql: &str) {
        let kind = parse_statement_kind(sql);

        if let Some(handle) = self.contexts.active_operation(context) {
            self.statement_executed(&handle, kind, sql);
            return;
        }

        match self.operation_triggered(context, OperationKind::Explicit) {
            Some(handle) => {
                self.statement_executed(&handle, kind, sql);
                self.operation_completed(&handle);
            }
            None => tracing::trace!(%kind, "dropping statement outside any session"),
        }
    }

    /// Report a lazy load. Returns the implicit operation that will receive
    /// the statements it issues.
    pub fn lazy_load_triggered(
        &self,
        context: ContextId,
        lazy: LazyInitialisation,
    ) -> Option<OperationHandle> {
        let handle = self
            .contexts
            .lazy_load(context, lazy, || self.capture_frames());
        if handle.is_none() {
            tracing::trace!("dropping lazy load outside any session");
        }
        handle
    }

    /// Whether `context` has an open session.
    pub fn in_session(&self, context: ContextId) -> bool {
        self.contexts.has_active_session(context)
    }

    /// Drop all recorded sessions and forget open ones.
    ///
    /// Must only be called while no events are in flight, typically between
    /// test cases.
    pub fn reset(&self) {
        self.contexts.reset();
        self.root.reset();
        tracing::trace!("tracker reset");
    }

    /// Number of recorded sessions.
    pub fn session_count(&self) -> usize {
        self.root.len()
    }

    fn capture_frames(&self) -> Option<FrameStack> {
        let stack = self.frames.capture();
        (!stack.is_empty()).then_some(stack)
    }
}
