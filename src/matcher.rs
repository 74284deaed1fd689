//! Matchers over frame stacks and recorded operations.
//!
//! Matchers never panic. A failed match comes back as a [`MatchFailure`]
//! naming the predicate that did not match and the stack that was checked,
//! so tests can print it directly:
//!
//! ```rust
//! use sea_orm_nplusone::matcher::{FrameMatcher, FrameSpec};
//! use sea_orm_nplusone::{CallFrame, FrameStack};
//!
//! let stack = FrameStack::new(vec![
//!     CallFrame::application("shop::tests", "lists_orders"),
//!     CallFrame::proxy("shop::proxy::Tx", "run"),
//!     CallFrame::application("shop::orders::OrderService", "list"),
//! ]);
//!
//! let matcher = FrameMatcher::sequence(vec![
//!     FrameSpec::application("shop::tests", "lists_orders"),
//!     FrameSpec::application("shop::orders::OrderService", "list"),
//! ]);
//! assert!(matcher.check(Some(&stack)).is_ok());
//! ```

use std::fmt;

use thiserror::Error;

use crate::frame::{CallFrame, FrameKind, FrameStack};
use crate::registry::{LazyInitialisation, Operation, OperationKind};

/// Why a matcher rejected its input.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("expected {expected}, but {reason}\nchecked: {checked}")]
pub struct MatchFailure {
    expected: String,
    reason: String,
    checked: String,
}

impl MatchFailure {
    fn new(
        expected: impl Into<String>,
        reason: impl Into<String>,
        checked: impl Into<String>,
    ) -> Self {
        Self {
            expected: expected.into(),
            reason: reason.into(),
            checked: checked.into(),
        }
    }

    fn on_stack(
        expected: impl Into<String>,
        reason: impl Into<String>,
        stack: Option<&FrameStack>,
    ) -> Self {
        let checked = match stack {
            Some(stack) => format!("\n{stack}"),
            None => "<absent stack>".to_string(),
        };
        Self::new(expected, reason, checked)
    }

    /// Description of what the matcher expected.
    pub fn expected(&self) -> &str {
        &self.expected
    }

    /// The unmatched part of the expectation.
    pub fn reason(&self) -> &str {
        &self.reason
    }
}

/// Predicate over one call frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameSpec {
    /// Application frame with this exact owner and member.
    Application { owner: String, member: String },
    /// Proxy frame with this exact owner and member.
    Proxy { owner: String, member: String },
    /// Any frame that is not an application frame.
    NotApplication,
}

impl FrameSpec {
    pub fn application(owner: impl Into<String>, member: impl Into<String>) -> Self {
        FrameSpec::Application {
            owner: owner.into(),
            member: member.into(),
        }
    }

    pub fn proxy(owner: impl Into<String>, member: impl Into<String>) -> Self {
        FrameSpec::Proxy {
            owner: owner.into(),
            member: member.into(),
        }
    }

    pub fn not_application() -> Self {
        FrameSpec::NotApplication
    }

    pub fn is_satisfied_by(&self, frame: &CallFrame) -> bool {
        match self {
            FrameSpec::Application { owner, member } => {
                frame.kind() == FrameKind::Application
                    && frame.owner() == owner
                    && frame.member() == member
            }
            FrameSpec::Proxy { owner, member } => {
                frame.kind() == FrameKind::Proxy
                    && frame.owner() == owner
                    && frame.member() == member
            }
            FrameSpec::NotApplication => frame.kind() != FrameKind::Application,
        }
    }
}

impl fmt::Display for FrameSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameSpec::Application { owner, member } => {
                write!(f, "application frame {owner}::{member}")
            }
            FrameSpec::Proxy { owner, member } => write!(f, "proxy frame {owner}::{member}"),
            FrameSpec::NotApplication => write!(f, "non-application frame"),
        }
    }
}

/// Matcher over a whole frame stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameMatcher {
    /// The predicates match frames at strictly increasing positions.
    Sequence(Vec<FrameSpec>),
    /// At least one frame matches.
    Any(FrameSpec),
    /// Every frame matches; true on an empty stack.
    All(FrameSpec),
    /// The stack was never captured.
    Absent,
}

impl FrameMatcher {
    pub fn sequence(specs: Vec<FrameSpec>) -> Self {
        FrameMatcher::Sequence(specs)
    }

    pub fn any(spec: FrameSpec) -> Self {
        FrameMatcher::Any(spec)
    }

    pub fn all(spec: FrameSpec) -> Self {
        FrameMatcher::All(spec)
    }

    pub fn absent() -> Self {
        FrameMatcher::Absent
    }

    pub fn matches(&self, stack: Option<&FrameStack>) -> bool {
        self.check(stack).is_ok()
    }

    /// Check `stack`. An absent stack fails every matcher but [`FrameMatcher::Absent`].
    pub fn check(&self, stack: Option<&FrameStack>) -> Result<(), MatchFailure> {
        let expected = self.to_string();

        if let FrameMatcher::Absent = self {
            return match stack {
                None => Ok(()),
                Some(_) => Err(MatchFailure::on_stack(expected, "a stack was captured", stack)),
            };
        }

        let Some(frames) = stack else {
            return Err(MatchFailure::on_stack(expected, "the stack is absent", None));
        };

        match self {
            FrameMatcher::Sequence(specs) => check_sequence(specs, frames)
                .map_err(|reason| MatchFailure::on_stack(expected, reason, stack)),
            FrameMatcher::Any(spec) => {
                if frames.iter().any(|frame| spec.is_satisfied_by(frame)) {
                    Ok(())
                } else {
                    Err(MatchFailure::on_stack(
                        expected,
                        format!("no frame is a {spec}"),
                        stack,
                    ))
                }
            }
            FrameMatcher::All(spec) => {
                match frames.iter().position(|frame| !spec.is_satisfied_by(frame)) {
                    None => Ok(()),
                    Some(index) => Err(MatchFailure::on_stack(
                        expected,
                        format!("frame {index} is not a {spec}"),
                        stack,
                    )),
                }
            }
            FrameMatcher::Absent => Ok(()),
        }
    }
}

fn check_sequence(specs: &[FrameSpec], stack: &FrameStack) -> Result<(), String> {
    if specs.is_empty() {
        return Err("the sequence has no predicates".to_string());
    }

    let mut frames = stack.iter();
    for (position, spec) in specs.iter().enumerate() {
        if !frames.any(|frame| spec.is_satisfied_by(frame)) {
            return Err(format!("predicate {position} ({spec}) is unmatched"));
        }
    }
    Ok(())
}

impl fmt::Display for FrameMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameMatcher::Sequence(specs) => {
                write!(f, "frame call sequence [")?;
                for (index, spec) in specs.iter().enumerate() {
                    if index > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{spec}")?;
                }
                write!(f, "]")
            }
            FrameMatcher::Any(spec) => write!(f, "any frame matching: {spec}"),
            FrameMatcher::All(spec) => write!(f, "all frames matching: {spec}"),
            FrameMatcher::Absent => write!(f, "absent frame stack"),
        }
    }
}

/// Matcher over the shape of one recorded operation. Unset criteria match
/// anything.
#[derive(Debug, Clone, Default)]
pub struct OperationMatcher {
    kind: Option<OperationKind>,
    statements: Option<usize>,
    lazy_initialisation: Option<LazyInitialisation>,
    frames: Option<FrameMatcher>,
}

impl OperationMatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn of_kind(kind: OperationKind) -> Self {
        Self::default().with_kind(kind)
    }

    pub fn with_kind(mut self, kind: OperationKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn with_statements(mut self, count: usize) -> Self {
        self.statements = Some(count);
        self
    }

    pub fn with_lazy_initialisation(mut self, lazy: LazyInitialisation) -> Self {
        self.lazy_initialisation = Some(lazy);
        self
    }

    pub fn with_frames(mut self, frames: FrameMatcher) -> Self {
        self.frames = Some(frames);
        self
    }

    pub fn check(&self, operation: &Operation) -> Result<(), MatchFailure> {
        let expected = self.to_string();
        let checked = || describe_operation(operation);

        if let Some(kind) = self.kind {
            if operation.kind() != kind {
                return Err(MatchFailure::new(
                    expected,
                    format!("kind is {}", operation.kind()),
                    checked(),
                ));
            }
        }

        if let Some(count) = self.statements {
            if operation.statements().len() != count {
                return Err(MatchFailure::new(
                    expected,
                    format!("it has {} statements", operation.statements().len()),
                    checked(),
                ));
            }
        }

        if let Some(lazy) = &self.lazy_initialisation {
            if !operation.lazy_initialisations().contains(lazy) {
                return Err(MatchFailure::new(
                    expected,
                    format!("{lazy} is not among its lazy initialisations"),
                    checked(),
                ));
            }
        }

        if let Some(frames) = &self.frames {
            frames.check(operation.frames())?;
        }

        Ok(())
    }
}

impl fmt::Display for OperationMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "operation")?;
        if let Some(kind) = self.kind {
            write!(f, " of kind {kind}")?;
        }
        if let Some(count) = self.statements {
            write!(f, " with {count} statements")?;
        }
        if let Some(lazy) = &self.lazy_initialisation {
            write!(f, " loading {lazy}")?;
        }
        if let Some(frames) = &self.frames {
            write!(f, " called through {frames}")?;
        }
        Ok(())
    }
}

fn describe_operation(operation: &Operation) -> String {
    let mut out = format!(
        "{} operation with {} statements",
        operation.kind(),
        operation.statements().len()
    );
    for lazy in operation.lazy_initialisations() {
        out.push_str(&format!("\n  {lazy}"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{Statement, StatementKind};

    fn app(member: &str) -> CallFrame {
        CallFrame::application("shop::orders", member)
    }

    fn p1() -> FrameSpec {
        FrameSpec::application("shop::orders", "list")
    }

    fn p2() -> FrameSpec {
        FrameSpec::application("shop::orders", "load_items")
    }

    #[test]
    fn test_sequence_matches_subsequence_in_order() {
        let stack = FrameStack::new(vec![
            app("main"),
            app("list"),
            CallFrame::third_party("tokio::runtime", "block_on"),
            app("load_items"),
        ]);
        assert!(FrameMatcher::sequence(vec![p1(), p2()]).matches(Some(&stack)));
    }

    #[test]
    fn test_sequence_rejects_wrong_order() {
        let stack = FrameStack::new(vec![app("load_items"), app("list")]);
        let failure = FrameMatcher::sequence(vec![p1(), p2()])
            .check(Some(&stack))
            .expect_err("order is violated");

        assert!(failure.reason().contains("predicate 1"));
        let message = failure.to_string();
        assert!(message.contains("application frame shop::orders::load_items"));
        assert!(message.contains("shop::orders::list [APP]"));
    }

    #[test]
    fn test_sequence_needs_distinct_frames() {
        let stack = FrameStack::new(vec![app("list")]);
        assert!(!FrameMatcher::sequence(vec![p1(), p1()]).matches(Some(&stack)));
    }

    #[test]
    fn test_sequence_distinguishes_proxy_frames() {
        let stack = FrameStack::new(vec![
            CallFrame::proxy("shop::orders", "list"),
            app("list"),
        ]);
        assert!(FrameMatcher::sequence(vec![FrameSpec::proxy("shop::orders", "list"), p1()])
            .matches(Some(&stack)));
        assert!(!FrameMatcher::sequence(vec![p1(), FrameSpec::proxy("shop::orders", "list")])
            .matches(Some(&stack)));
    }

    #[test]
    fn test_empty_sequence_is_a_failed_match() {
        let stack = FrameStack::new(vec![app("list")]);
        let failure = FrameMatcher::sequence(Vec::new())
            .check(Some(&stack))
            .expect_err("empty sequence is malformed");
        assert!(failure.reason().contains("no predicates"));
    }

    #[test]
    fn test_absent_stack_fails_everything_but_absent() {
        assert!(!FrameMatcher::sequence(vec![p1()]).matches(None));
        assert!(!FrameMatcher::any(p1()).matches(None));
        assert!(!FrameMatcher::all(FrameSpec::not_application()).matches(None));
        assert!(FrameMatcher::absent().matches(None));
        assert!(!FrameMatcher::absent().matches(Some(&FrameStack::default())));
    }

    #[test]
    fn test_any_and_all() {
        let stack = FrameStack::new(vec![
            CallFrame::third_party("std::rt", "lang_start"),
            CallFrame::proxy("sea_orm_nplusone::connection::TracedConnection", "execute"),
        ]);
        assert!(FrameMatcher::all(FrameSpec::not_application()).matches(Some(&stack)));
        assert!(!FrameMatcher::any(p1()).matches(Some(&stack)));

        let mixed = FrameStack::new(vec![
            app("list"),
            CallFrame::third_party("std::rt", "lang_start"),
        ]);
        let failure = FrameMatcher::all(FrameSpec::not_application())
            .check(Some(&mixed))
            .expect_err("first frame is an application frame");
        assert!(failure.reason().contains("frame 0"));

        assert!(FrameMatcher::all(p1()).matches(Some(&FrameStack::default())));
    }

    #[test]
    fn test_operation_matcher() {
        let lazy = LazyInitialisation::collection("shop::Order", "items");
        let operation = Operation::implicit(
            Some(FrameStack::new(vec![app("list")])),
            vec![Statement::new(0, StatementKind::Select, "SELECT * FROM items")],
            lazy.clone(),
        );

        let matcher = OperationMatcher::of_kind(OperationKind::Implicit)
            .with_statements(1)
            .with_lazy_initialisation(lazy)
            .with_frames(FrameMatcher::any(p1()));
        assert!(matcher.check(&operation).is_ok());

        let failure = OperationMatcher::of_kind(OperationKind::Explicit)
            .check(&operation)
            .expect_err("kind differs");
        assert_eq!(failure.reason(), "kind is IMPLICIT");

        let failure = OperationMatcher::new()
            .with_statements(2)
            .check(&operation)
            .expect_err("statement count differs");
        assert!(failure.to_string().contains("with 2 statements"));
    }
}
