//! Assertions over recorded sessions, for use in test suites.
//!
//! ```rust
//! use sea_orm_nplusone::{ContextId, SessionAssertion, SessionBoundary, Tracker};
//!
//! let tracker = Tracker::default();
//! let context = ContextId::new();
//! let session = tracker.session_opened(context, SessionBoundary::Join);
//! tracker.statement_executed_in_context(context, "SELECT * FROM cake");
//! tracker.session_closed(session);
//!
//! SessionAssertion::within_last_session()
//!     .no_implicit_operations()
//!     .max_statements_per_operation(1)
//!     .verify(tracker.root())
//!     .unwrap();
//! ```

use std::sync::Arc;

use thiserror::Error;

use crate::matcher::{MatchFailure, OperationMatcher};
use crate::registry::{LazyInitialisation, OperationKind, RootView, Session, StatementKind};
use crate::report::{render_session, ReportConfig};

/// A violated assertion.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AssertionError {
    #[error("no session recorded at index {index} ({recorded} recorded)")]
    MissingSession { index: usize, recorded: usize },

    #[error("no session recorded")]
    NoSessions,

    #[error("{rule} violated in session {position}: {detail}\n{report}")]
    Violated {
        rule: &'static str,
        position: usize,
        detail: String,
        report: String,
    },

    #[error("operation {index} of session {position} does not match: {failure}\n{report}")]
    Mismatch {
        index: usize,
        position: usize,
        failure: MatchFailure,
        report: String,
    },
}

#[derive(Debug, Clone, Copy)]
enum Selection {
    Last,
    Index(usize),
    All,
}

#[derive(Debug, Clone)]
enum Rule {
    NoImplicitOperations,
    NoLazyLoadingOf(LazyInitialisation),
    MaxStatementsPerOperation(usize),
    MaxStatements(StatementKind, usize),
    OperationMatches(usize, OperationMatcher),
}

/// A set of rules checked against selected sessions.
#[derive(Debug, Clone)]
pub struct SessionAssertion {
    selection: Selection,
    rules: Vec<Rule>,
}

impl SessionAssertion {
    /// Check the most recently closed session.
    pub fn within_last_session() -> Self {
        Self::select(Selection::Last)
    }

    /// Check the session at `index` in close order.
    pub fn within_session(index: usize) -> Self {
        Self::select(Selection::Index(index))
    }

    /// Check every recorded session. Passes when none were recorded.
    pub fn within_all_sessions() -> Self {
        Self::select(Selection::All)
    }

    fn select(selection: Selection) -> Self {
        Self {
            selection,
            rules: Vec::new(),
        }
    }

    /// No lazy loading at all.
    pub fn no_implicit_operations(mut self) -> Self {
        self.rules.push(Rule::NoImplicitOperations);
        self
    }

    pub fn no_lazy_loading_of(mut self, lazy: LazyInitialisation) -> Self {
        self.rules.push(Rule::NoLazyLoadingOf(lazy));
        self
    }

    pub fn max_statements_per_operation(mut self, limit: usize) -> Self {
        self.rules.push(Rule::MaxStatementsPerOperation(limit));
        self
    }

    /// At most `limit` statements of `kind` across the whole session.
    pub fn max_statements(mut self, kind: StatementKind, limit: usize) -> Self {
        self.rules.push(Rule::MaxStatements(kind, limit));
        self
    }

    /// The operation at `index` (completion order) matches `matcher`.
    pub fn operation_matches(mut self, index: usize, matcher: OperationMatcher) -> Self {
        self.rules.push(Rule::OperationMatches(index, matcher));
        self
    }

    /// Run every rule; the first violation is returned.
    pub fn verify<R: RootView + ?Sized>(&self, root: &R) -> Result<(), AssertionError> {
        for (position, session) in self.sessions(root)? {
            for rule in &self.rules {
                check_rule(rule, position, &session)?;
            }
        }
        Ok(())
    }

    fn sessions<R: RootView + ?Sized>(
        &self,
        root: &R,
    ) -> Result<Vec<(usize, Arc<Session>)>, AssertionError> {
        let sessions = root.sessions();
        match self.selection {
            Selection::All => Ok(sessions.into_iter().enumerate().collect()),
            Selection::Last => {
                let position = sessions.len().checked_sub(1).ok_or(AssertionError::NoSessions)?;
                Ok(vec![(position, Arc::clone(&sessions[position]))])
            }
            Selection::Index(index) => match sessions.get(index) {
                Some(session) => Ok(vec![(index, Arc::clone(session))]),
                None => Err(AssertionError::MissingSession {
                    index,
                    recorded: sessions.len(),
                }),
            },
        }
    }
}

fn check_rule(rule: &Rule, position: usize, session: &Session) -> Result<(), AssertionError> {
    let violated = |rule: &'static str, detail: String| AssertionError::Violated {
        rule,
        position,
        detail,
        report: render_session(session, &ReportConfig::default()),
    };

    match rule {
        Rule::NoImplicitOperations => {
            let implicit: Vec<String> = session
                .operations()
                .iter()
                .filter(|operation| operation.kind() == OperationKind::Implicit)
                .flat_map(|operation| operation.lazy_initialisations())
                .map(ToString::to_string)
                .collect();
            if !implicit.is_empty() {
                return Err(violated(
                    "no implicit operations",
                    format!("lazy loads: {}", implicit.join(", ")),
                ));
            }
        }
        Rule::NoLazyLoadingOf(lazy) => {
            let count = session
                .operations()
                .iter()
                .filter(|operation| operation.lazy_initialisations().contains(lazy))
                .count();
            if count > 0 {
                return Err(violated(
                    "no lazy loading",
                    format!("{lazy} loaded by {count} operations"),
                ));
            }
        }
        Rule::MaxStatementsPerOperation(limit) => {
            let over = session
                .operations()
                .iter()
                .enumerate()
                .find(|(_, operation)| operation.statements().len() > *limit);
            if let Some((index, operation)) = over {
                return Err(violated(
                    "max statements per operation",
                    format!(
                        "operation {index} ({}) ran {} statements, limit is {limit}",
                        operation.kind(),
                        operation.statements().len()
                    ),
                ));
            }
        }
        Rule::MaxStatements(kind, limit) => {
            let count = session
                .statements()
                .filter(|statement| statement.kind() == *kind)
                .count();
            if count > *limit {
                return Err(violated(
                    "max statements",
                    format!("{count} {kind} statements, limit is {limit}"),
                ));
            }
        }
        Rule::OperationMatches(index, matcher) => {
            let Some(operation) = session.operations().get(*index) else {
                return Err(violated(
                    "operation matches",
                    format!(
                        "no operation at index {index} ({} recorded)",
                        session.operations().len()
                    ),
                ));
            };
            matcher
                .check(operation)
                .map_err(|failure| AssertionError::Mismatch {
                    index: *index,
                    position,
                    failure,
                    report: render_session(session, &ReportConfig::default()),
                })?;
        }
    }
    Ok(())
}
