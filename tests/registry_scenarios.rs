use sea_orm_nplusone::prelude::*;
use sea_orm_nplusone::{CallFrame, FrameKind, FrameStack, SessionHandle};

fn tracker() -> Tracker {
    Tracker::new(NPlusOneConfig::test("registry_scenarios"))
}

#[test]
fn non_nested_sessions_are_recorded_in_close_order() {
    let tracker = tracker();
    let first = ContextId::new();
    let second = ContextId::new();

    let a = tracker.session_opened(first, SessionBoundary::Join);
    let b = tracker.session_opened(second, SessionBoundary::Join);
    let c = tracker.session_opened(ContextId::new(), SessionBoundary::Join);
    tracker.session_closed(b);
    tracker.session_closed(c);
    tracker.session_closed(a);

    let ids: Vec<_> = tracker.root().sessions().iter().map(|s| s.id()).collect();
    assert_eq!(ids, vec![b.session(), c.session(), a.session()]);
}

#[test]
fn nested_session_is_recorded_before_its_parent() {
    let tracker = tracker();
    let context = ContextId::new();

    let a = tracker.session_opened(context, SessionBoundary::Join);
    let select = tracker
        .operation_triggered(context, OperationKind::Explicit)
        .expect("session A is open");
    tracker.statement_executed(&select, StatementKind::Select, "SELECT * FROM cake");
    tracker.operation_completed(&select);

    let b = tracker.session_opened(context, SessionBoundary::RequiresNew);
    let update = tracker
        .operation_triggered(context, OperationKind::Explicit)
        .expect("session B is open");
    tracker.statement_executed(&update, StatementKind::Update, "UPDATE cake SET name = 'x'");
    tracker.operation_completed(&update);
    tracker.session_closed(b);

    tracker.session_closed(a);

    let sessions = tracker.root().sessions();
    assert_eq!(sessions.len(), 2);
    assert_eq!(sessions[0].id(), b.session());
    assert_eq!(sessions[1].id(), a.session());
    assert_eq!(
        sessions[0].operations()[0].statements()[0].kind(),
        StatementKind::Update
    );
    assert_eq!(
        sessions[1].operations()[0].statements()[0].kind(),
        StatementKind::Select
    );
}

#[test]
fn joined_boundaries_record_one_session() {
    let tracker = tracker();
    let context = ContextId::new();

    let handles: Vec<SessionHandle> = (0..3)
        .map(|_| tracker.session_opened(context, SessionBoundary::Join))
        .collect();
    tracker.statement_executed_in_context(context, "SELECT * FROM cake");
    for handle in handles.into_iter().rev() {
        tracker.session_closed(handle);
    }

    assert_eq!(tracker.root().len(), 1);
    assert_eq!(tracker.root().sessions()[0].statement_count(), 1);
}

#[test]
fn reset_clears_recorded_sessions() {
    let tracker = tracker();
    let context = ContextId::new();
    let handle = tracker.session_opened(context, SessionBoundary::Join);
    tracker.session_closed(handle);
    assert_eq!(tracker.root().len(), 1);

    tracker.reset();
    assert!(tracker.root().sessions().is_empty());
}

#[inline(never)]
fn load_cakes(tracker: &Tracker, context: ContextId) {
    let operation = tracker
        .operation_triggered(context, OperationKind::Explicit)
        .expect("session is open");
    tracker.statement_executed(&operation, StatementKind::Select, "SELECT * FROM cake");
    tracker.operation_completed(&operation);
}

#[inline(never)]
fn list_cakes(tracker: &Tracker, context: ContextId) {
    load_cakes(tracker, context);
}

#[test]
fn captured_frames_follow_the_call_path() {
    let tracker = tracker();
    let context = ContextId::new();

    let session = tracker.session_opened(context, SessionBoundary::Join);
    list_cakes(&tracker, context);
    tracker.session_closed(session);

    let recorded = tracker.root().last_session().expect("session recorded");
    let operation = &recorded.operations()[0];

    let path = FrameMatcher::sequence(vec![
        FrameSpec::application("registry_scenarios", "captured_frames_follow_the_call_path"),
        FrameSpec::application("registry_scenarios", "list_cakes"),
        FrameSpec::application("registry_scenarios", "load_cakes"),
    ]);
    path.check(operation.frames()).expect("call path is recorded outermost first");

    let reversed = FrameMatcher::sequence(vec![
        FrameSpec::application("registry_scenarios", "load_cakes"),
        FrameSpec::application("registry_scenarios", "list_cakes"),
    ]);
    assert!(reversed.check(operation.frames()).is_err());

    let session_frames = recorded.frames().expect("session frames captured");
    assert!(!session_frames
        .application_frames()
        .any(|frame| frame.member() == "load_cakes"));
}

#[test]
fn sequence_matcher_skips_unrelated_frames() {
    let p1 = FrameSpec::application("shop::orders", "list");
    let p2 = FrameSpec::application("shop::orders", "load_items");
    let stack = FrameStack::new(vec![
        CallFrame::application("shop::orders", "main"),
        CallFrame::application("shop::orders", "list"),
        CallFrame::new("tokio::runtime", "block_on", FrameKind::ThirdParty),
        CallFrame::application("shop::orders", "load_items"),
    ]);
    assert!(FrameMatcher::sequence(vec![p1.clone(), p2.clone()])
        .check(Some(&stack))
        .is_ok());

    let swapped = FrameStack::new(vec![
        CallFrame::application("shop::orders", "load_items"),
        CallFrame::application("shop::orders", "list"),
    ]);
    assert!(FrameMatcher::sequence(vec![p1, p2])
        .check(Some(&swapped))
        .is_err());
}

#[test]
fn lazy_load_produces_one_descriptor() {
    let tracker = tracker();
    let context = ContextId::new();
    let lazy = LazyInitialisation::entity("registry_scenarios::Baker");

    let session = tracker.session_opened(context, SessionBoundary::Join);
    let implicit = tracker
        .operation_triggered(context, OperationKind::Implicit)
        .expect("session is open");
    tracker.lazy_load_triggered(context, lazy.clone());
    tracker.statement_executed_in_context(context, "SELECT * FROM baker WHERE id = 3");
    tracker.operation_completed(&implicit);
    tracker.session_closed(session);

    let recorded = tracker.root().last_session().expect("session recorded");
    assert_eq!(recorded.operations().len(), 1);
    assert_eq!(recorded.operations()[0].lazy_initialisations(), &[lazy.clone()]);

    SessionAssertion::within_last_session()
        .operation_matches(
            0,
            OperationMatcher::of_kind(OperationKind::Implicit)
                .with_statements(1)
                .with_lazy_initialisation(lazy),
        )
        .verify(tracker.root())
        .expect("operation shape matches");
}
