//! Recording decorators around SeaORM connections.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use sea_orm::{
    AccessMode, ConnectionTrait, DatabaseConnection, DatabaseTransaction, DbBackend, DbErr,
    ExecResult, IsolationLevel, QueryResult, Statement, StreamTrait, TransactionError,
    TransactionTrait,
};
use tracing::{field, Instrument, Span};

use crate::context::{ContextId, OperationHandle, SessionBoundary, SessionHandle};
use crate::parser::ParsedSql;
use crate::registry::{LazyInitialisation, OperationKind, StatementKind};
use crate::tracker::Tracker;

/// Shared state of the decorators: the tracker and how the calling context
/// is resolved.
#[derive(Debug, Clone)]
struct Interceptor {
    tracker: Arc<Tracker>,
    context: Option<ContextId>,
}

impl Interceptor {
    fn context(&self) -> ContextId {
        self.context.unwrap_or_else(ContextId::current)
    }

    fn open_session(&self, boundary: SessionBoundary) -> SessionGuard {
        let handle = self.tracker.session_opened(self.context(), boundary);
        SessionGuard {
            tracker: Arc::clone(&self.tracker),
            handle,
        }
    }

    fn operation(&self, kind: OperationKind) -> OperationGuard {
        OperationGuard {
            tracker: Arc::clone(&self.tracker),
            handle: self.tracker.operation_triggered(self.context(), kind),
        }
    }

    fn lazy_load(&self, lazy: LazyInitialisation) -> OperationGuard {
        OperationGuard {
            tracker: Arc::clone(&self.tracker),
            handle: self.tracker.lazy_load_triggered(self.context(), lazy),
        }
    }

    /// Record `sql` and open the span the statement runs in.
    fn intercept(&self, backend: DbBackend, sql: &str) -> Span {
        let parsed = ParsedSql::parse(sql);

        let span = tracing::debug_span!(
            "db.query",
            otel.name = %parsed.span_name(),
            db.system = %db_system(backend),
            db.operation = %parsed.kind,
            db.sql.table = field::Empty,
            db.statement = field::Empty,
            error.message = field::Empty,
        );
        if let Some(table) = &parsed.table {
            span.record("db.sql.table", table.as_str());
        }
        if self.tracker.config().log_statements {
            span.record("db.statement", sql);
        }

        // recorded before execution: a failing statement still reached the database
        self.tracker.statement_executed_in_context(self.context(), sql);
        span
    }

    fn record_error<T>(span: &Span, result: &Result<T, DbErr>) {
        if let Err(e) = result {
            span.record("error.message", e.to_string().as_str());
            tracing::debug!(parent: span, error = %e, "statement failed");
        }
    }
}

fn db_system(backend: DbBackend) -> &'static str {
    match backend {
        DbBackend::Postgres => "postgresql",
        DbBackend::MySql => "mysql",
        DbBackend::Sqlite => "sqlite",
    }
}

/// A recording wrapper around SeaORM's `DatabaseConnection`.
///
/// Implements `ConnectionTrait`, `StreamTrait` and `TransactionTrait`, so it
/// can be passed wherever a connection is expected. Every statement is
/// reported to the [`Tracker`] and joins the active operation of the calling
/// context. Statements executed outside any session are not recorded.
///
/// The calling context is the current thread unless one is bound with
/// [`TracedConnection::with_context`]. Code running on a multi-threaded async
/// runtime should bind an explicit [`ContextId`] per unit of work.
///
/// # Example
///
/// ```rust,ignore
/// use std::sync::Arc;
/// use sea_orm::{Database, EntityTrait};
/// use sea_orm_nplusone::{NPlusOneConfig, SessionBoundary, TracedConnection, Tracker};
///
/// let tracker = Arc::new(Tracker::new(NPlusOneConfig::test("my_app")));
/// let db = TracedConnection::new(Database::connect(url).await?, tracker.clone());
///
/// {
///     let _session = db.session(SessionBoundary::Join);
///     let cakes = cake::Entity::find().all(&db).await?;
/// }
/// assert_eq!(tracker.session_count(), 1);
/// ```
#[derive(Clone)]
pub struct TracedConnection {
    inner: Arc<DatabaseConnection>,
    interceptor: Interceptor,
}

impl fmt::Debug for TracedConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TracedConnection")
            .field("backend", &self.inner.get_database_backend())
            .field("context", &self.interceptor.context)
            .finish()
    }
}

impl TracedConnection {
    pub fn new(connection: DatabaseConnection, tracker: Arc<Tracker>) -> Self {
        Self {
            inner: Arc::new(connection),
            interceptor: Interceptor {
                tracker,
                context: None,
            },
        }
    }

    /// A copy of this connection that reports under `context`.
    pub fn with_context(&self, context: ContextId) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            interceptor: Interceptor {
                tracker: Arc::clone(&self.interceptor.tracker),
                context: Some(context),
            },
        }
    }

    pub fn inner(&self) -> &DatabaseConnection {
        &self.inner
    }

    pub fn tracker(&self) -> &Arc<Tracker> {
        &self.interceptor.tracker
    }

    /// The context statements are reported under.
    pub fn context(&self) -> ContextId {
        self.interceptor.context()
    }

    /// The wrapped connection, unless clones of this decorator still share it.
    pub fn into_inner(self) -> Option<DatabaseConnection> {
        Arc::try_unwrap(self.inner).ok()
    }

    /// Open a session boundary; it closes when the guard drops.
    pub fn session(&self, boundary: SessionBoundary) -> SessionGuard {
        self.interceptor.open_session(boundary)
    }

    /// Start an operation in the active session; it completes when the guard
    /// drops.
    pub fn operation(&self, kind: OperationKind) -> OperationGuard {
        self.interceptor.operation(kind)
    }

    /// Mark the statements run while the guard lives as a lazy load of `lazy`.
    pub fn lazy_load(&self, lazy: LazyInitialisation) -> OperationGuard {
        self.interceptor.lazy_load(lazy)
    }

    /// Begin a transaction inside a new session.
    ///
    /// The session closes when the transaction is committed, rolled back or
    /// dropped. Its commit is recorded as a [`OperationKind::Commit`]
    /// operation.
    pub async fn begin_traced(&self) -> Result<TracedTransaction, DbErr> {
        let inner = self.inner.begin().await?;
        let session = self.interceptor.open_session(SessionBoundary::RequiresNew);
        Ok(TracedTransaction {
            inner,
            interceptor: self.interceptor.clone(),
            session,
        })
    }
}

impl AsRef<DatabaseConnection> for TracedConnection {
    fn as_ref(&self) -> &DatabaseConnection {
        &self.inner
    }
}

#[async_trait]
impl ConnectionTrait for TracedConnection {
    fn get_database_backend(&self) -> DbBackend {
        self.inner.get_database_backend()
    }

    async fn execute(&self, stmt: Statement) -> Result<ExecResult, DbErr> {
        let span = self.interceptor.intercept(self.get_database_backend(), &stmt.sql);
        let result = self.inner.execute(stmt).instrument(span.clone()).await;
        Interceptor::record_error(&span, &result);
        result
    }

    async fn execute_unprepared(&self, sql: &str) -> Result<ExecResult, DbErr> {
        let span = self.interceptor.intercept(self.get_database_backend(), sql);
        let result = self
            .inner
            .execute_unprepared(sql)
            .instrument(span.clone())
            .await;
        Interceptor::record_error(&span, &result);
        result
    }

    async fn query_one(&self, stmt: Statement) -> Result<Option<QueryResult>, DbErr> {
        let span = self.interceptor.intercept(self.get_database_backend(), &stmt.sql);
        let result = self.inner.query_one(stmt).instrument(span.clone()).await;
        Interceptor::record_error(&span, &result);
        result
    }

    async fn query_all(&self, stmt: Statement) -> Result<Vec<QueryResult>, DbErr> {
        let span = self.interceptor.intercept(self.get_database_backend(), &stmt.sql);
        let result = self.inner.query_all(stmt).instrument(span.clone()).await;
        Interceptor::record_error(&span, &result);
        result
    }

    fn support_returning(&self) -> bool {
        self.inner.support_returning()
    }

    fn is_mock_connection(&self) -> bool {
        self.inner.is_mock_connection()
    }
}

#[async_trait]
impl StreamTrait for TracedConnection {
    type Stream<'a> = <DatabaseConnection as StreamTrait>::Stream<'a>;

    fn stream<'a>(
        &'a self,
        stmt: Statement,
    ) -> Pin<Box<dyn Future<Output = Result<Self::Stream<'a>, DbErr>> + 'a + Send>> {
        let span = self.interceptor.intercept(self.get_database_backend(), &stmt.sql);

        Box::pin(async move {
            let result = self.inner.stream(stmt).instrument(span.clone()).await;
            Interceptor::record_error(&span, &result);
            result
        })
    }
}

/// Plain transactions are delegated. Statements run through the returned
/// `DatabaseTransaction` bypass the decorator; use
/// [`TracedConnection::begin_traced`] to record them.
#[async_trait]
impl TransactionTrait for TracedConnection {
    async fn begin(&self) -> Result<DatabaseTransaction, DbErr> {
        self.inner.begin().await
    }

    async fn begin_with_config(
        &self,
        isolation_level: Option<IsolationLevel>,
        access_mode: Option<AccessMode>,
    ) -> Result<DatabaseTransaction, DbErr> {
        self.inner
            .begin_with_config(isolation_level, access_mode)
            .await
    }

    async fn transaction<F, T, E>(&self, callback: F) -> Result<T, TransactionError<E>>
    where
        F: for<'c> FnOnce(
                &'c DatabaseTransaction,
            ) -> Pin<Box<dyn Future<Output = Result<T, E>> + Send + 'c>>
            + Send,
        T: Send,
        E: std::fmt::Display + std::fmt::Debug + Send,
    {
        self.inner.transaction(callback).await
    }

    async fn transaction_with_config<F, T, E>(
        &self,
        callback: F,
        isolation_level: Option<IsolationLevel>,
        access_mode: Option<AccessMode>,
    ) -> Result<T, TransactionError<E>>
    where
        F: for<'c> FnOnce(
                &'c DatabaseTransaction,
            ) -> Pin<Box<dyn Future<Output = Result<T, E>> + Send + 'c>>
            + Send,
        T: Send,
        E: std::fmt::Display + std::fmt::Debug + Send,
    {
        self.inner
            .transaction_with_config(callback, isolation_level, access_mode)
            .await
    }
}

/// A transaction running in its own session.
pub struct TracedTransaction {
    inner: DatabaseTransaction,
    interceptor: Interceptor,
    session: SessionGuard,
}

impl fmt::Debug for TracedTransaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TracedTransaction")
            .field("session", &self.session.handle())
            .finish()
    }
}

impl TracedTransaction {
    pub fn session(&self) -> SessionHandle {
        self.session.handle()
    }

    pub fn operation(&self, kind: OperationKind) -> OperationGuard {
        self.interceptor.operation(kind)
    }

    pub fn lazy_load(&self, lazy: LazyInitialisation) -> OperationGuard {
        self.interceptor.lazy_load(lazy)
    }

    /// Commit and close the session.
    pub async fn commit(self) -> Result<(), DbErr> {
        let Self {
            inner,
            interceptor,
            session,
        } = self;

        let commit = interceptor.operation(OperationKind::Commit);
        if let Some(handle) = commit.handle() {
            interceptor
                .tracker
                .statement_executed(handle, StatementKind::Other, "COMMIT");
        }
        let result = inner.commit().await;

        drop(commit);
        drop(session);
        result
    }

    /// Roll back and close the session.
    pub async fn rollback(self) -> Result<(), DbErr> {
        let Self { inner, session, .. } = self;
        let result = inner.rollback().await;
        drop(session);
        result
    }
}

#[async_trait]
impl ConnectionTrait for TracedTransaction {
    fn get_database_backend(&self) -> DbBackend {
        self.inner.get_database_backend()
    }

    async fn execute(&self, stmt: Statement) -> Result<ExecResult, DbErr> {
        let span = self.interceptor.intercept(self.get_database_backend(), &stmt.sql);
        let result = self.inner.execute(stmt).instrument(span.clone()).await;
        Interceptor::record_error(&span, &result);
        result
    }

    async fn execute_unprepared(&self, sql: &str) -> Result<ExecResult, DbErr> {
        let span = self.interceptor.intercept(self.get_database_backend(), sql);
        let result = self
            .inner
            .execute_unprepared(sql)
            .instrument(span.clone())
            .await;
        Interceptor::record_error(&span, &result);
        result
    }

    async fn query_one(&self, stmt: Statement) -> Result<Option<QueryResult>, DbErr> {
        let span = self.interceptor.intercept(self.get_database_backend(), &stmt.sql);
        let result = self.inner.query_one(stmt).instrument(span.clone()).await;
        Interceptor::record_error(&span, &result);
        result
    }

    async fn query_all(&self, stmt: Statement) -> Result<Vec<QueryResult>, DbErr> {
        let span = self.interceptor.intercept(self.get_database_backend(), &stmt.sql);
        let result = self.inner.query_all(stmt).instrument(span.clone()).await;
        Interceptor::record_error(&span, &result);
        result
    }

    fn support_returning(&self) -> bool {
        self.inner.support_returning()
    }

    fn is_mock_connection(&self) -> bool {
        self.inner.is_mock_connection()
    }
}

#[async_trait]
impl StreamTrait for TracedTransaction {
    type Stream<'a> = <DatabaseTransaction as StreamTrait>::Stream<'a>;

    fn stream<'a>(
        &'a self,
        stmt: Statement,
    ) -> Pin<Box<dyn Future<Output = Result<Self::Stream<'a>, DbErr>> + 'a + Send>> {
        let span = self.interceptor.intercept(self.get_database_backend(), &stmt.sql);

        Box::pin(async move {
            let result = self.inner.stream(stmt).instrument(span.clone()).await;
            Interceptor::record_error(&span, &result);
            result
        })
    }
}

/// Open session boundary. Closes the boundary on drop.
#[must_use = "the session closes as soon as the guard is dropped"]
pub struct SessionGuard {
    tracker: Arc<Tracker>,
    handle: SessionHandle,
}

impl fmt::Debug for SessionGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionGuard")
            .field("handle", &self.handle)
            .finish()
    }
}

impl SessionGuard {
    /// Open a boundary on `tracker` without a connection.
    pub fn open(tracker: Arc<Tracker>, context: ContextId, boundary: SessionBoundary) -> Self {
        let handle = tracker.session_opened(context, boundary);
        Self { tracker, handle }
    }

    pub fn handle(&self) -> SessionHandle {
        self.handle
    }

    pub fn operation(&self, kind: OperationKind) -> OperationGuard {
        OperationGuard {
            tracker: Arc::clone(&self.tracker),
            handle: self.tracker.operation_triggered(self.handle.context(), kind),
        }
    }

    pub fn lazy_load(&self, lazy: LazyInitialisation) -> OperationGuard {
        OperationGuard {
            tracker: Arc::clone(&self.tracker),
            handle: self.tracker.lazy_load_triggered(self.handle.context(), lazy),
        }
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.tracker.session_closed(self.handle);
    }
}

/// In-progress operation. Completes the operation on drop.
///
/// Holds no handle when the operation was started outside any session.
#[must_use = "the operation completes as soon as the guard is dropped"]
pub struct OperationGuard {
    tracker: Arc<Tracker>,
    handle: Option<OperationHandle>,
}

impl fmt::Debug for OperationGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationGuard")
            .field("handle", &self.handle)
            .finish()
    }
}

impl OperationGuard {
    pub fn handle(&self) -> Option<&OperationHandle> {
        self.handle.as_ref()
    }

    pub fn is_tracked(&self) -> bool {
        self.handle.is_some()
    }
}

impl Drop for OperationGuard {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.tracker.operation_completed(&handle);
        }
    }
}

/// Extension trait for wrapping database connections.
pub trait TracingExt {
    /// Wrap this connection so its statements are reported to `tracker`.
    fn with_nplusone(self, tracker: Arc<Tracker>) -> TracedConnection;
}

impl TracingExt for DatabaseConnection {
    fn with_nplusone(self, tracker: Arc<Tracker>) -> TracedConnection {
        TracedConnection::new(self, tracker)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::RootView;

    #[test]
    fn test_guards_close_in_drop_order() {
        let tracker = Arc::new(Tracker::default());
        let context = ContextId::new();

        {
            let outer = SessionGuard::open(Arc::clone(&tracker), context, SessionBoundary::Join);
            {
                let inner =
                    SessionGuard::open(Arc::clone(&tracker), context, SessionBoundary::RequiresNew);
                let operation = inner.operation(OperationKind::Explicit);
                assert!(operation.is_tracked());
            }
            let _operation = outer.operation(OperationKind::Explicit);
        }

        let sessions = tracker.root().sessions();
        assert_eq!(sessions.len(), 2);
        assert!(sessions[0].id() > sessions[1].id());
    }

    #[test]
    fn test_operation_guard_outside_session_is_untracked() {
        let tracker = Arc::new(Tracker::default());
        let session =
            SessionGuard::open(Arc::clone(&tracker), ContextId::new(), SessionBoundary::Join);
        let handle = session.handle();
        drop(session);

        let stale = SessionGuard {
            tracker: Arc::clone(&tracker),
            handle,
        };
        let operation = stale.operation(OperationKind::Explicit);
        assert!(!operation.is_tracked());
        drop(operation);
        // closing an already closed session records nothing new
        drop(stale);
        assert_eq!(tracker.session_count(), 1);
    }

    #[test]
    fn test_nested_lazy_load_guards_share_one_operation() {
        let tracker = Arc::new(Tracker::default());
        let context = ContextId::new();
        let fruits = LazyInitialisation::collection("shop::Cake", "fruits");

        {
            let session = SessionGuard::open(Arc::clone(&tracker), context, SessionBoundary::Join);
            let _outer = session.lazy_load(fruits.clone());
            tracker.statement_executed_in_context(context, "SELECT * FROM fruit WHERE cake_id = 1");
            {
                let inner = session.lazy_load(fruits.clone());
                assert!(inner.is_tracked());
            }
            tracker.statement_executed_in_context(context, "SELECT * FROM fruit WHERE cake_id = 2");
        }

        let session = tracker.root().last_session().expect("session recorded");
        let shape: Vec<(OperationKind, usize)> = session
            .operations()
            .iter()
            .map(|operation| (operation.kind(), operation.statements().len()))
            .collect();
        assert_eq!(shape, vec![(OperationKind::Implicit, 2)]);
        assert!(crate::SessionAssertion::within_last_session()
            .no_lazy_loading_of(fruits)
            .verify(tracker.root())
            .is_err());
    }

    #[test]
    fn test_db_system_names() {
        assert_eq!(db_system(DbBackend::Postgres), "postgresql");
        assert_eq!(db_system(DbBackend::MySql), "mysql");
        assert_eq!(db_system(DbBackend::Sqlite), "sqlite");
    }
}
