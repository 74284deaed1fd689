//! Human-readable dump of a closed session.
//!
//! ```text
//! ROOT
//!     shop::tests::lists_orders [APP]
//!     shop::orders::OrderService::list [APP]
//!         SESSION BOUNDARY
//!             OPERATION [IMPLICIT]
//!                 shop::Order.items [FETCHING COLLECTION]
//!                 shop::orders::OrderService::list [APP]
//!                 sea_orm_nplusone::connection::TracedConnection::query_all [PROXY]
//!                     STATEMENT [SELECT] SELECT ... FROM "item" WHERE "order_id" = 7
//! ```

use crate::frame::FrameStack;
use crate::registry::{Operation, OperationKind, Session, StatementKind};

/// Line rendered when filtering leaves nothing to show.
pub const NO_MATCHES: &str = "No operations / statements matching report criteria found";

/// Which operations a report shows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OperationFilter {
    ExplicitOnly,
    ImplicitOnly,
    #[default]
    All,
}

impl OperationFilter {
    pub fn allows(&self, kind: OperationKind) -> bool {
        match self {
            OperationFilter::ExplicitOnly => kind == OperationKind::Explicit,
            OperationFilter::ImplicitOnly => kind == OperationKind::Implicit,
            OperationFilter::All => true,
        }
    }
}

/// Which statements a report shows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StatementFilter {
    /// SELECT only.
    ReadOnly,
    /// INSERT, UPDATE and DELETE.
    WriteOnly,
    #[default]
    All,
}

impl StatementFilter {
    pub fn allows(&self, kind: StatementKind) -> bool {
        match self {
            StatementFilter::ReadOnly => kind.is_read(),
            StatementFilter::WriteOnly => kind.is_write(),
            StatementFilter::All => true,
        }
    }
}

/// Report settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReportConfig {
    /// Log a report for every closed session. Default: `false`
    pub enabled: bool,
    pub operation_filter: OperationFilter,
    pub statement_filter: StatementFilter,
}

impl ReportConfig {
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_operation_filter(mut self, filter: OperationFilter) -> Self {
        self.operation_filter = filter;
        self
    }

    pub fn with_statement_filter(mut self, filter: StatementFilter) -> Self {
        self.statement_filter = filter;
        self
    }

    fn has_visible_statement(&self, session: &Session) -> bool {
        session
            .operations()
            .iter()
            .filter(|operation| self.operation_filter.allows(operation.kind()))
            .flat_map(|operation| operation.statements())
            .any(|statement| self.statement_filter.allows(statement.kind()))
    }
}

const INDENT: &str = "    ";

/// Render `session` with the visibility rules of `config`.
///
/// Application and proxy frames are printed, third-party frames are elided.
/// The `enabled` flag is not consulted.
pub fn render_session(session: &Session, config: &ReportConfig) -> String {
    if !config.has_visible_statement(session) {
        return NO_MATCHES.to_string();
    }

    let mut out = String::from("ROOT");
    push_frames(&mut out, session.frames(), 1);
    push_line(&mut out, 2, "SESSION BOUNDARY");

    for operation in session.operations() {
        if config.operation_filter.allows(operation.kind()) {
            push_operation(&mut out, operation, config);
        }
    }

    out
}

fn push_operation(out: &mut String, operation: &Operation, config: &ReportConfig) {
    push_line(out, 3, &format!("OPERATION [{}]", operation.kind()));
    for lazy in operation.lazy_initialisations() {
        push_line(out, 4, &lazy.to_string());
    }
    push_frames(out, operation.frames(), 4);

    for statement in operation.statements() {
        if config.statement_filter.allows(statement.kind()) {
            push_line(
                out,
                5,
                &format!("STATEMENT [{}] {}", statement.kind(), statement.sql()),
            );
        }
    }
}

fn push_frames(out: &mut String, frames: Option<&FrameStack>, depth: usize) {
    let shown = frames
        .into_iter()
        .flat_map(|stack| stack.iter())
        .filter(|frame| !frame.is_third_party());
    for frame in shown {
        push_line(out, depth, &frame.to_string());
    }
}

fn push_line(out: &mut String, depth: usize, text: &str) {
    out.push('\n');
    for _ in 0..depth {
        out.push_str(INDENT);
    }
    out.push_str(text);
}
