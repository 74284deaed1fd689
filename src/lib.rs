//! # sea-orm-nplusone
//!
//! N+1 query detection for SeaORM.
//!
//! The crate records what an application does with its database as a tree:
//! closed **sessions** (units of work), the **operations** inside them
//! (explicit queries, lazy loads, commits) and the SQL **statements** each
//! operation issued. Every session and operation also carries the call path
//! that triggered it, with frames classified as application, proxy or
//! third-party code. Tests then assert on that tree, for example that a
//! request handler never lazy loads a collection inside a loop.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use sea_orm::{Database, EntityTrait};
//! use sea_orm_nplusone::prelude::*;
//!
//! let tracker = Arc::new(Tracker::new(NPlusOneConfig::test("my_app")));
//! let db = Database::connect("postgres://localhost/mydb")
//!     .await?
//!     .with_nplusone(tracker.clone());
//!
//! {
//!     let _session = db.session(SessionBoundary::Join);
//!     for cake in cake::Entity::find().all(&db).await? {
//!         let _load = db.lazy_load(LazyInitialisation::collection("my_app::Cake", "fruits"));
//!         cake.find_related(fruit::Entity).all(&db).await?;
//!     }
//! }
//!
//! SessionAssertion::within_last_session()
//!     .no_lazy_loading_of(LazyInitialisation::collection("my_app::Cake", "fruits"))
//!     .verify(tracker.root())?;
//! ```
//!
//! ## Recording model
//!
//! | Event | Effect |
//! |-------|--------|
//! | session opened | pushes a session, or re-enters the active one for [`SessionBoundary::Join`] |
//! | session closed | the outermost close appends the session to the [`Root`] |
//! | operation triggered | starts an operation in the active session |
//! | statement executed | appends to the active operation, or becomes its own explicit operation |
//! | lazy load | starts or joins the implicit operation for that descriptor |
//!
//! Sessions are ordered by close time: a session opened inside another one
//! appears before it. Events that arrive outside any session are dropped.
//!
//! ## Reports
//!
//! With [`ReportConfig::enabled`] set, every closed session is written to
//! the log at `debug` level:
//!
//! ```text
//! ROOT
//!     my_app::handlers::list_cakes [APP]
//!         SESSION BOUNDARY
//!             OPERATION [IMPLICIT]
//!                 my_app::Cake.fruits [FETCHING COLLECTION]
//!                 my_app::handlers::list_cakes [APP]
//!                     STATEMENT [SELECT] SELECT ... FROM "fruit" WHERE "cake_id" = 1
//! ```

pub mod assertion;
mod config;
mod connection;
pub mod context;
pub mod frame;
pub mod matcher;
mod parser;
pub mod registry;
pub mod report;
mod tracker;

pub use assertion::{AssertionError, SessionAssertion};
pub use config::{NPlusOneConfig, INTERCEPTOR_PATH_PREFIX};
pub use connection::{
    OperationGuard, SessionGuard, TracedConnection, TracedTransaction, TracingExt,
};
pub use context::{ContextId, OperationHandle, SessionBoundary, SessionHandle};
pub use frame::{CallFrame, FrameExtractor, FrameKind, FrameStack};
pub use matcher::{FrameMatcher, FrameSpec, MatchFailure, OperationMatcher};
pub use parser::{parse_statement_kind, ParsedSql};
pub use registry::{
    LazyInitialisation, LazyInitialisationKind, Operation, OperationKind, Root, RootView,
    Session, SessionId, Statement, StatementKind,
};
pub use report::{render_session, OperationFilter, ReportConfig, StatementFilter};
pub use tracker::Tracker;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::{
        ContextId, FrameMatcher, FrameSpec, LazyInitialisation, NPlusOneConfig, OperationKind,
        OperationMatcher, ReportConfig, RootView, SessionAssertion, SessionBoundary,
        StatementKind, TracedConnection, TracingExt, Tracker,
    };
}
