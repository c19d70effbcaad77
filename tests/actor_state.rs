//! Progress, failure and recursion behaviour of tree items.

mod common;

use common::{init_tracing, Arith, RecordingNotifier};
use dms_actor::{Actor, ActorExt, FailType, NotificationCode, ProgressState, Session, TreeItem};

fn rank(code: NotificationCode) -> Option<u8> {
    match code {
        NotificationCode::MetaInfoReady => Some(1),
        NotificationCode::Validated => Some(2),
        NotificationCode::Committed => Some(3),
        NotificationCode::Invalidated => Some(0),
        _ => None,
    }
}

#[test]
fn test_progress_only_moves_forward_until_invalidated() {
    init_tracing();
    let notifier = RecordingNotifier::new();
    let session = Session::builder()
        .calculator_factory(Arith::new())
        .notifier(notifier.clone())
        .build();
    let root = TreeItem::create_root(&session, "model");
    let a = root.create_child(&session, "a").unwrap();
    a.set_expr(&session, "1 + 2");

    a.certain_update(&session, ProgressState::Validated).unwrap();
    assert_eq!(a.core().progress(), ProgressState::Validated);
    a.certain_update(&session, ProgressState::MetaInfoReady).unwrap();
    assert_eq!(a.core().progress(), ProgressState::Validated);
    a.certain_update(&session, ProgressState::Committed).unwrap();
    a.set_expr(&session, "2 + 2");
    a.certain_update(&session, ProgressState::Committed).unwrap();
    assert_eq!(*a.data_as::<i64>().unwrap(), 4);

    let codes: Vec<u8> = notifier
        .codes_for("/a")
        .into_iter()
        .filter_map(rank)
        .collect();
    assert_eq!(codes, vec![1, 2, 3, 0, 1, 3]);
}

#[test]
fn test_failure_kind_is_kept_until_invalidated() {
    init_tracing();
    let session = Session::builder().calculator_factory(Arith::new()).build();
    let root = TreeItem::create_root(&session, "model");
    let a = root.create_child(&session, "a").unwrap();

    assert!(a.fail(&session, "not yet", FailType::Committed));
    assert!(a.fail(&session, "broken", FailType::MetaInfo));
    assert!(!a.fail(&session, "ignored", FailType::Data));
    assert_eq!(a.core().fail_type(), FailType::MetaInfo);
    let reason = a.failure_reason(&session).unwrap();
    assert_eq!(reason.message(), "broken");
    assert_eq!(reason.location(), Some("/a"));

    let err = a
        .certain_update(&session, ProgressState::MetaInfoReady)
        .unwrap_err();
    assert_eq!(err.to_string(), "[/a] broken");

    a.determine_state(&session);
    a.invalidate(&session);
    assert_eq!(a.core().fail_type(), FailType::None);
    assert!(session.fail_reason(a.core().id()).is_none());
    a.certain_update(&session, ProgressState::Committed).unwrap();
}

#[test]
fn test_self_reference_is_a_recursion() {
    init_tracing();
    let session = Session::builder().calculator_factory(Arith::new()).build();
    let root = TreeItem::create_root(&session, "model");
    let x = root.create_child(&session, "x").unwrap();
    x.set_expr(&session, "x + 1");

    let err = x.inc_interest(&session).unwrap_err();
    assert!(
        err.to_string().contains("Invalid recursion in UpdateMetaInfo detected"),
        "{err}"
    );
    assert_eq!(x.core().fail_type(), FailType::MetaInfo);
    assert_eq!(x.core().interest_count(), 0);
    assert!(x
        .certain_update(&session, ProgressState::Committed)
        .is_err());
}

#[test]
fn test_cycle_is_a_recursion() {
    init_tracing();
    let session = Session::builder().calculator_factory(Arith::new()).build();
    let root = TreeItem::create_root(&session, "model");
    let p = root.create_child(&session, "p").unwrap();
    let q = root.create_child(&session, "q").unwrap();
    p.set_expr(&session, "q * 2");
    q.set_expr(&session, "p + 1");

    let err = p
        .certain_update(&session, ProgressState::Committed)
        .unwrap_err();
    assert!(
        err.fail_reason()
            .message()
            .contains("Invalid recursion in UpdateMetaInfo detected"),
        "{err}"
    );
    assert!(p.is_failed(&session, FailType::MetaInfo));
    assert!(q.is_failed(&session, FailType::MetaInfo));
    assert!(p.data().is_none());
    assert!(q.data().is_none());
}

#[test]
fn test_passor_items_need_no_work() {
    init_tracing();
    let session = Session::builder().calculator_factory(Arith::new()).build();
    let root = TreeItem::create_root(&session, "model");
    let template = root.create_child(&session, "template").unwrap();
    template.set_is_template(true);
    let inner = template.create_child(&session, "inner").unwrap();
    inner.set_expr(&session, "1 / 0");

    inner.certain_update(&session, ProgressState::Committed).unwrap();
    assert!(inner.data().is_none());
    inner.inc_interest(&session).unwrap();
    assert!(!inner.core().has_suppl_interest());
    assert_eq!(template.core().interest_count(), 0);
    drop(inner.dec_interest(&session));
}
