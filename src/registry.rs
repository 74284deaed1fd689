//! Recorded execution trace: Root -> Session -> Operation -> Statement.
//!
//! Nodes are immutable once published. A session is assembled by the
//! context tracker while it is open and frozen into a [`Session`] when it
//! closes; only then is it appended to the [`Root`]. Readers therefore never
//! see a node that is still being built.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::frame::FrameStack;
use crate::parser;

/// Identifier of a session, unique within one tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub(crate) u64);

impl SessionId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session#{}", self.0)
    }
}

/// Cause that grouped a set of statements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    /// Query or update issued by application code.
    Explicit,
    /// Lazy loading of an entity or a collection.
    Implicit,
    /// Flush of pending changes at commit.
    Commit,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Explicit => "EXPLICIT",
            OperationKind::Implicit => "IMPLICIT",
            OperationKind::Commit => "COMMIT",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatementKind {
    Select,
    Insert,
    Update,
    Delete,
    Other,
}

impl StatementKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StatementKind::Select => "SELECT",
            StatementKind::Insert => "INSERT",
            StatementKind::Update => "UPDATE",
            StatementKind::Delete => "DELETE",
            StatementKind::Other => "OTHER",
        }
    }

    pub fn is_read(&self) -> bool {
        matches!(self, StatementKind::Select)
    }

    pub fn is_write(&self) -> bool {
        matches!(
            self,
            StatementKind::Insert | StatementKind::Update | StatementKind::Delete
        )
    }
}

impl fmt::Display for StatementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LazyInitialisationKind {
    Entity,
    Collection,
}

/// What a lazy load fetched.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LazyInitialisation {
    owner: String,
    field: Option<String>,
    kind: LazyInitialisationKind,
}

impl LazyInitialisation {
    /// A single related entity was fetched.
    pub fn entity(owner: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            field: None,
            kind: LazyInitialisationKind::Entity,
        }
    }

    /// The collection behind `owner.field` was fetched.
    pub fn collection(owner: impl Into<String>, field: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            field: Some(field.into()),
            kind: LazyInitialisationKind::Collection,
        }
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn field(&self) -> Option<&str> {
        self.field.as_deref()
    }

    pub fn kind(&self) -> LazyInitialisationKind {
        self.kind
    }
}

impl fmt::Display for LazyInitialisation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.kind, &self.field) {
            (LazyInitialisationKind::Collection, Some(field)) => {
                write!(f, "{}.{} [FETCHING COLLECTION]", self.owner, field)
            }
            _ => write!(f, "{} [FETCHING ENTITY]", self.owner),
        }
    }
}

/// One executed SQL statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Statement {
    ordinal: usize,
    kind: StatementKind,
    sql: String,
    table: Option<String>,
}

impl Statement {
    pub fn new(ordinal: usize, kind: StatementKind, sql: impl Into<String>) -> Self {
        let sql = sql.into();
        let table = parser::extract_table(&sql);
        Self {
            ordinal,
            kind,
            sql,
            table,
        }
    }

    /// Capture order inside the owning operation, starting at 0.
    pub fn ordinal(&self) -> usize {
        self.ordinal
    }

    pub fn kind(&self) -> StatementKind {
        self.kind
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// Primary table, when it can be read off the SQL.
    pub fn table(&self) -> Option<&str> {
        self.table.as_deref()
    }
}

/// Statements sharing one triggering cause.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Operation {
    kind: OperationKind,
    frames: Option<FrameStack>,
    statements: Vec<Statement>,
    lazy_initialisations: Vec<LazyInitialisation>,
}

impl Operation {
    pub fn explicit(frames: Option<FrameStack>, statements: Vec<Statement>) -> Self {
        Self::from_parts(OperationKind::Explicit, frames, statements, Vec::new())
    }

    pub fn commit(frames: Option<FrameStack>, statements: Vec<Statement>) -> Self {
        Self::from_parts(OperationKind::Commit, frames, statements, Vec::new())
    }

    pub fn implicit(
        frames: Option<FrameStack>,
        statements: Vec<Statement>,
        lazy_initialisation: LazyInitialisation,
    ) -> Self {
        Self::from_parts(
            OperationKind::Implicit,
            frames,
            statements,
            vec![lazy_initialisation],
        )
    }

    /// Callers uphold the descriptor invariant: non-empty for implicit
    /// operations, empty otherwise.
    pub(crate) fn from_parts(
        kind: OperationKind,
        frames: Option<FrameStack>,
        statements: Vec<Statement>,
        lazy_initialisations: Vec<LazyInitialisation>,
    ) -> Self {
        Self {
            kind,
            frames,
            statements,
            lazy_initialisations,
        }
    }

    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    /// Call frames captured when the operation was triggered.
    pub fn frames(&self) -> Option<&FrameStack> {
        self.frames.as_ref()
    }

    pub fn statements(&self) -> &[Statement] {
        &self.statements
    }

    /// Empty unless the operation is [`OperationKind::Implicit`].
    pub fn lazy_initialisations(&self) -> &[LazyInitialisation] {
        &self.lazy_initialisations
    }
}

/// A closed unit of work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    id: SessionId,
    frames: Option<FrameStack>,
    operations: Vec<Operation>,
    close_order: u64,
}

impl Session {
    /// Build a session value. The close order is assigned by [`Root::append`].
    pub fn new(id: SessionId, frames: Option<FrameStack>, operations: Vec<Operation>) -> Self {
        Self {
            id,
            frames,
            operations,
            close_order: 0,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Call frames captured when the session was opened.
    pub fn frames(&self) -> Option<&FrameStack> {
        self.frames.as_ref()
    }

    /// Operations in completion order.
    pub fn operations(&self) -> &[Operation] {
        &self.operations
    }

    /// Position of this session in the global close sequence.
    pub fn close_order(&self) -> u64 {
        self.close_order
    }

    pub fn statements(&self) -> impl Iterator<Item = &Statement> {
        self.operations
            .iter()
            .flat_map(|operation| operation.statements.iter())
    }

    pub fn statement_count(&self) -> usize {
        self.operations
            .iter()
            .map(|operation| operation.statements.len())
            .sum()
    }
}

/// Read-only access to recorded sessions.
pub trait RootView {
    /// Snapshot of all recorded sessions, in close order.
    fn sessions(&self) -> Vec<Arc<Session>>;

    fn len(&self) -> usize {
        self.sessions().len()
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn session(&self, index: usize) -> Option<Arc<Session>> {
        self.sessions().get(index).cloned()
    }

    fn last_session(&self) -> Option<Arc<Session>> {
        self.sessions().last().cloned()
    }
}

/// Append-only sequence of closed sessions.
#[derive(Debug, Default)]
pub struct Root {
    sessions: RwLock<Vec<Arc<Session>>>,
    next_close_order: AtomicU64,
}

impl Root {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a closed session.
    ///
    /// The close order is taken under the write lock, so it always agrees
    /// with the position in the sequence.
    pub fn append(&self, mut session: Session) -> Arc<Session> {
        let mut sessions = self.sessions.write();
        session.close_order = self.next_close_order.fetch_add(1, Ordering::Relaxed);
        let session = Arc::new(session);
        sessions.push(Arc::clone(&session));
        session
    }

    /// Drop every recorded session and restart the close order.
    ///
    /// Must not race with ingestion; callers reset between test cases.
    pub fn reset(&self) {
        let mut sessions = self.sessions.write();
        sessions.clear();
        self.next_close_order.store(0, Ordering::Relaxed);
    }
}

impl RootView for Root {
    fn sessions(&self) -> Vec<Arc<Session>> {
        self.sessions.read().clone()
    }

    fn len(&self) -> usize {
        self.sessions.read().len()
    }

    fn session(&self, index: usize) -> Option<Arc<Session>> {
        self.sessions.read().get(index).cloned()
    }

    fn last_session(&self) -> Option<Arc<Session>> {
        self.sessions.read().last().cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn select(ordinal: usize) -> Statement {
        Statement::new(ordinal, StatementKind::Select, "SELECT * FROM cake")
    }

    #[test]
    fn test_root_keeps_append_order() {
        let root = Root::new();
        let first = root.append(Session::new(SessionId(7), None, Vec::new()));
        let second = root.append(Session::new(SessionId(3), None, Vec::new()));

        let ids: Vec<u64> = root.sessions().iter().map(|s| s.id().get()).collect();
        assert_eq!(ids, vec![7, 3]);
        assert!(first.close_order() < second.close_order());
        assert_eq!(root.last_session().map(|s| s.id()), Some(SessionId(3)));
    }

    #[test]
    fn test_reset_clears_sessions() {
        let root = Root::new();
        root.append(Session::new(SessionId(1), None, Vec::new()));
        root.reset();

        assert!(root.is_empty());
        assert!(root.sessions().is_empty());
        assert!(root.last_session().is_none());
    }

    #[test]
    fn test_reset_restarts_close_order() {
        let root = Root::new();
        root.append(Session::new(SessionId(1), None, Vec::new()));
        root.append(Session::new(SessionId(2), None, Vec::new()));
        root.reset();

        let first = root.append(Session::new(SessionId(3), None, Vec::new()));
        assert_eq!(first.close_order(), 0);
    }

    #[test]
    fn test_snapshot_is_detached() {
        let root = Root::new();
        let snapshot = root.sessions();
        root.append(Session::new(SessionId(1), None, Vec::new()));

        assert!(snapshot.is_empty());
        assert_eq!(root.len(), 1);
    }

    #[test]
    fn test_statement_detects_table() {
        let statement = select(0);
        assert_eq!(statement.table(), Some("cake"));
        assert!(statement.kind().is_read());
    }

    #[test]
    fn test_implicit_operation_carries_descriptor() {
        let operation = Operation::implicit(
            None,
            vec![select(0)],
            LazyInitialisation::collection("shop::Cake", "fruits"),
        );
        assert_eq!(operation.kind(), OperationKind::Implicit);
        assert_eq!(operation.lazy_initialisations().len(), 1);

        let explicit = Operation::explicit(None, vec![select(0), select(1)]);
        assert!(explicit.lazy_initialisations().is_empty());
    }

    #[test]
    fn test_session_statement_count() {
        let session = Session::new(
            SessionId(1),
            None,
            vec![
                Operation::explicit(None, vec![select(0), select(1)]),
                Operation::commit(None, vec![select(0)]),
            ],
        );
        assert_eq!(session.statement_count(), 3);
        assert_eq!(session.statements().count(), 3);
    }

    #[test]
    fn test_lazy_initialisation_display() {
        assert_eq!(
            LazyInitialisation::entity("shop::Cake").to_string(),
            "shop::Cake [FETCHING ENTITY]"
        );
        assert_eq!(
            LazyInitialisation::collection("shop::Cake", "fruits").to_string(),
            "shop::Cake.fruits [FETCHING COLLECTION]"
        );
    }
}
