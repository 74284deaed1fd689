//! Per-context tracking of the active session and operation.
//!
//! Events carry no ids. Correlation happens through a [`ContextId`]: every
//! logical call context owns a stack of open sessions, and the innermost
//! in-progress operation of the innermost session is the one that receives
//! statements and lazy loads. Each context's entry is only touched by events
//! of that context, so contention is limited to the map shard.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::frame::FrameStack;
use crate::registry::{
    LazyInitialisation, Operation, OperationKind, Session, SessionId, Statement, StatementKind,
};

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static THREAD_CONTEXT: ContextId = ContextId::new();
}

/// Identifier of a logical call context.
///
/// [`ContextId::current`] gives every thread its own id. Hosts that move work
/// between threads (multi-threaded async runtimes) create an explicit token
/// with [`ContextId::new`] and pass it along instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextId(u64);

impl ContextId {
    /// A fresh id, distinct from every other id in the process.
    pub fn new() -> Self {
        Self(NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// The id bound to the calling thread.
    pub fn current() -> Self {
        THREAD_CONTEXT.with(|id| *id)
    }

    pub fn get(&self) -> u64 {
        self.0
    }
}

impl Default for ContextId {
    fn default() -> Self {
        Self::new()
    }
}

/// How a session boundary relates to a session already open in the context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionBoundary {
    /// Re-enter the active session if there is one, otherwise start one.
    #[default]
    Join,
    /// Always start a new session, suspending the active one until it closes.
    RequiresNew,
}

/// Returned by a session open; hand it back to close the same session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionHandle {
    context: ContextId,
    session: SessionId,
}

impl SessionHandle {
    pub fn context(&self) -> ContextId {
        self.context
    }

    pub fn session(&self) -> SessionId {
        self.session
    }
}

/// Opaque reference to an in-progress operation.
///
/// Only the handle returned when the operation was started completes it.
/// Handles of lazy loads that joined an existing operation record into it
/// but leave completion to its owner.
#[derive(Debug, Clone)]
pub struct OperationHandle {
    context: ContextId,
    session: SessionId,
    operation: Arc<PendingOperation>,
    owner: bool,
}

impl OperationHandle {
    pub fn context(&self) -> ContextId {
        self.context
    }

    pub fn session(&self) -> SessionId {
        self.session
    }

    pub fn kind(&self) -> OperationKind {
        self.operation.kind
    }

    /// Whether this handle started the operation and completes it.
    pub fn is_owner(&self) -> bool {
        self.owner
    }

    /// Whether both handles point at the same operation.
    pub fn same_operation(&self, other: &OperationHandle) -> bool {
        Arc::ptr_eq(&self.operation, &other.operation)
    }
}

#[derive(Debug)]
pub(crate) struct PendingOperation {
    kind: OperationKind,
    frames: Option<FrameStack>,
    state: Mutex<PendingState>,
}

#[derive(Debug, Default)]
struct PendingState {
    statements: Vec<Statement>,
    lazy_initialisations: Vec<LazyInitialisation>,
    completed: bool,
}

enum Attach {
    Attached,
    Reused,
    Rejected,
}

impl PendingOperation {
    fn new(kind: OperationKind, frames: Option<FrameStack>) -> Arc<Self> {
        Arc::new(Self {
            kind,
            frames,
            state: Mutex::new(PendingState::default()),
        })
    }

    fn record_statement(&self, kind: StatementKind, sql: String) -> bool {
        let mut state = self.state.lock();
        if state.completed {
            return false;
        }
        let ordinal = state.statements.len();
        state.statements.push(Statement::new(ordinal, kind, sql));
        true
    }

    // An implicit operation belongs to exactly one lazy-load trigger.
    fn attach(&self, lazy: &LazyInitialisation) -> Attach {
        if self.kind != OperationKind::Implicit {
            return Attach::Rejected;
        }
        let mut state = self.state.lock();
        if state.completed {
            Attach::Rejected
        } else if state.lazy_initialisations.is_empty() {
            state.lazy_initialisations.push(lazy.clone());
            Attach::Attached
        } else if state.lazy_initialisations.contains(lazy) {
            Attach::Reused
        } else {
            Attach::Rejected
        }
    }

    /// Freeze into a published operation. `None` when already completed or
    /// when an implicit operation never received its descriptor.
    fn freeze(&self) -> Option<Operation> {
        let mut state = self.state.lock();
        if state.completed {
            return None;
        }
        state.completed = true;

        if self.kind == OperationKind::Implicit && state.lazy_initialisations.is_empty() {
            tracing::debug!(
                statements = state.statements.len(),
                "discarding implicit operation without lazy initialisation"
            );
            return None;
        }

        Some(Operation::from_parts(
            self.kind,
            self.frames.clone(),
            std::mem::take(&mut state.statements),
            std::mem::take(&mut state.lazy_initialisations),
        ))
    }
}

#[derive(Debug)]
struct ActiveSession {
    id: SessionId,
    frames: Option<FrameStack>,
    reentries: usize,
    pending: Vec<Arc<PendingOperation>>,
    completed: Vec<Operation>,
}

impl ActiveSession {
    fn complete(&mut self, operation: &Arc<PendingOperation>) {
        if let Some(position) = self
            .pending
            .iter()
            .rposition(|pending| Arc::ptr_eq(pending, operation))
        {
            self.pending.remove(position);
        }
        if let Some(frozen) = operation.freeze() {
            self.completed.push(frozen);
        }
    }

    fn into_session(mut self) -> Session {
        // operations left open complete innermost first
        while let Some(pending) = self.pending.pop() {
            if let Some(frozen) = pending.freeze() {
                self.completed.push(frozen);
            }
        }
        Session::new(self.id, self.frames, self.completed)
    }
}

#[derive(Debug, Default)]
struct ContextStack {
    sessions: Vec<ActiveSession>,
}

/// Active session/operation bookkeeping for every logical context.
#[derive(Debug, Default)]
pub struct ContextTracker {
    contexts: DashMap<ContextId, ContextStack>,
    next_session: AtomicU64,
}

impl ContextTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a session boundary. `frames` is only evaluated when a new session
    /// is created.
    pub fn open_session<F>(
        &self,
        context: ContextId,
        boundary: SessionBoundary,
        frames: F,
    ) -> SessionHandle
    where
        F: FnOnce() -> Option<FrameStack>,
    {
        if boundary == SessionBoundary::Join {
            if let Some(mut stack) = self.contexts.get_mut(&context) {
                if let Some(active) = stack.sessions.last_mut() {
                    active.reentries += 1;
                    return SessionHandle {
                        context,
                        session: active.id,
                    };
                }
            }
        }

        let frames = frames();
        let id = SessionId(self.next_session.fetch_add(1, Ordering::Relaxed) + 1);
        self.contexts
            .entry(context)
            .or_default()
            .sessions
            .push(ActiveSession {
                id,
                frames,
                reentries: 0,
                pending: Vec::new(),
                completed: Vec::new(),
            });

        SessionHandle {
            context,
            session: id,
        }
    }

    /// Close a session boundary.
    ///
    /// Returns the frozen session when the boundary really ended it, `None`
    /// for a re-entry close or an unbalanced close (which is dropped).
    pub fn close_session(&self, handle: SessionHandle) -> Option<Session> {
        let Some(mut stack) = self.contexts.get_mut(&handle.context) else {
            tracing::debug!(
                session = %handle.session,
                "ignoring close: no session open in context"
            );
            return None;
        };

        match stack.sessions.last_mut() {
            Some(top) if top.id == handle.session => {
                if top.reentries > 0 {
                    top.reentries -= 1;
                    return None;
                }
            }
            top => {
                tracing::debug!(
                    session = %handle.session,
                    active = ?top.map(|active| active.id),
                    "ignoring unbalanced session close"
                );
                return None;
            }
        }

        let active = stack.sessions.pop()?;
        let now_empty = stack.sessions.is_empty();
        drop(stack);

        if now_empty {
            self.contexts
                .remove_if(&handle.context, |_, stack| stack.sessions.is_empty());
        }

        Some(active.into_session())
    }

    /// Start an operation in the context's active session.
    pub fn trigger_operation<F>(
        &self,
        context: ContextId,
        kind: OperationKind,
        frames: F,
    ) -> Option<OperationHandle>
    where
        F: FnOnce() -> Option<FrameStack>,
    {
        if !self.has_active_session(context) {
            return None;
        }
        let operation = PendingOperation::new(kind, frames());
        self.push_pending(context, operation)
    }

    /// Append a statement to an in-progress operation. `false` when the
    /// operation has already completed.
    pub fn record_statement(
        &self,
        handle: &OperationHandle,
        kind: StatementKind,
        sql: impl Into<String>,
    ) -> bool {
        handle.operation.record_statement(kind, sql.into())
    }

    /// Complete an operation and publish it into its session. A joined
    /// handle completes nothing.
    pub fn complete_operation(&self, handle: &OperationHandle) {
        if !handle.owner {
            tracing::trace!(
                session = %handle.session,
                "leaving completion to the operation owner"
            );
            return;
        }

        let published = self.contexts.get_mut(&handle.context).and_then(|mut stack| {
            let active = stack
                .sessions
                .iter_mut()
                .rfind(|active| active.id == handle.session)?;
            active.complete(&handle.operation);
            Some(())
        });

        if published.is_none() {
            // the session closed first; make later statements bounce
            let _ = handle.operation.freeze();
            tracing::debug!(
                session = %handle.session,
                "operation completed after its session closed"
            );
        }
    }

    /// Route a lazy load to an implicit operation.
    ///
    /// Joins the active operation when it is an implicit operation waiting
    /// for its descriptor, or one already started for the same descriptor.
    /// Otherwise a fresh implicit operation is started.
    pub fn lazy_load<F>(
        &self,
        context: ContextId,
        lazy: LazyInitialisation,
        frames: F,
    ) -> Option<OperationHandle>
    where
        F: FnOnce() -> Option<FrameStack>,
    {
        {
            let stack = self.contexts.get(&context)?;
            let active = stack.sessions.last()?;
            if let Some(pending) = active.pending.last() {
                match pending.attach(&lazy) {
                    Attach::Attached | Attach::Reused => {
                        return Some(OperationHandle {
                            context,
                            session: active.id,
                            operation: Arc::clone(pending),
                            owner: false,
                        });
                    }
                    Attach::Rejected => {}
                }
            }
        }

        let operation = PendingOperation::new(OperationKind::Implicit, frames());
        operation.state.lock().lazy_initialisations.push(lazy);
        self.push_pending(context, operation)
    }

    /// Innermost in-progress operation of the context's active session.
    pub fn active_operation(&self, context: ContextId) -> Option<OperationHandle> {
        let stack = self.contexts.get(&context)?;
        let active = stack.sessions.last()?;
        let pending = active.pending.last()?;
        Some(OperationHandle {
            context,
            session: active.id,
            operation: Arc::clone(pending),
            owner: false,
        })
    }

    pub fn active_session(&self, context: ContextId) -> Option<SessionHandle> {
        let stack = self.contexts.get(&context)?;
        stack.sessions.last().map(|active| SessionHandle {
            context,
            session: active.id,
        })
    }

    pub fn has_active_session(&self, context: ContextId) -> bool {
        self.contexts
            .get(&context)
            .is_some_and(|stack| !stack.sessions.is_empty())
    }

    /// Forget every open session. Only valid while no events are in flight.
    pub fn reset(&self) {
        self.contexts.clear();
    }

    fn push_pending(
        &self,
        context: ContextId,
        operation: Arc<PendingOperation>,
    ) -> Option<OperationHandle> {
        let mut stack = self.contexts.get_mut(&context)?;
        let active = stack.sessions.last_mut()?;
        active.pending.push(Arc::clone(&operation));
        Some(OperationHandle {
            context,
            session: active.id,
            operation,
            owner: true,
        })
    }
}
