//! Integration tests for worklist queries and criteria evaluation.

mod common;

use common::{TestEnv, start};
use worklist::{
    Error, ItemStatus, Session, WcCompare, WcField, WcLogical, WcSortOrder, WorklistCriteria,
};

/// Five items on bob's worklist, two of them Finance with priority 1.
fn seed_worklist(session: &Session) {
    start(session, "Finance\\Expense Claim", "F1", 1);
    start(session, "HR\\Leave Request", "H1", 1);
    start(session, "Finance\\Expense Claim", "F2", 2);
    start(session, "Finance\\Expense Claim", "F3", 1);
    start(session, "HR\\Leave Request", "H2", 2);
}

fn folios(worklist: &worklist::Worklist) -> Vec<String> {
    worklist.iter().map(|item| item.folio().to_string()).collect()
}

#[test]
fn test_unfiltered_worklist_returns_everything() {
    let env = TestEnv::new();
    let bob = env.session("bob");
    seed_worklist(&bob);

    let worklist = bob.open_worklist(&WorklistCriteria::default()).unwrap();
    assert_eq!(worklist.total_count(), 5);
    assert_eq!(worklist.len(), 5);
    assert!(worklist.iter().all(|item| item.status() == ItemStatus::Unopened));
}

#[test]
fn test_finance_priority_filter_sorted_by_start_date() {
    let env = TestEnv::new();
    let bob = env.session("bob");
    seed_worklist(&bob);

    let mut builder = WorklistCriteria::builder();
    builder
        .add_filter(None, WcField::ProcessFolder, WcCompare::Equal, "Finance")
        .unwrap()
        .add_filter(
            Some(WcLogical::And),
            WcField::ProcessPriority,
            WcCompare::Equal,
            1,
        )
        .unwrap()
        .add_sort(WcField::ProcessStartDate, WcSortOrder::Descending);

    let worklist = bob.open_worklist(&builder.build()).unwrap();
    assert_eq!(worklist.total_count(), 2);
    assert_eq!(folios(&worklist), vec!["F3", "F1"]);

    let dates: Vec<_> = worklist
        .iter()
        .map(|item| item.process_start_date().unwrap())
        .collect();
    assert!(dates[0] > dates[1]);
    assert!(worklist.iter().all(|item| item.process_folder() == "Finance"));
}

#[test]
fn test_filters_fold_left_to_right() {
    let env = TestEnv::new();
    let bob = env.session("bob");
    seed_worklist(&bob);

    // (Finance AND priority 1) OR folio H2
    let mut builder = WorklistCriteria::builder();
    builder
        .filter(WcField::ProcessFolder, WcCompare::Equal, "Finance")
        .unwrap()
        .filter(WcField::ProcessPriority, WcCompare::Equal, 1)
        .unwrap()
        .add_filter(
            Some(WcLogical::Or),
            WcField::ProcessFolio,
            WcCompare::Equal,
            "H2",
        )
        .unwrap()
        .add_sort(WcField::ProcessFolio, WcSortOrder::Ascending);

    let worklist = bob.open_worklist(&builder.build()).unwrap();
    assert_eq!(folios(&worklist), vec!["F1", "F3", "H2"]);
}

#[test]
fn test_like_pattern() {
    let env = TestEnv::new();
    let bob = env.session("bob");
    seed_worklist(&bob);

    let mut builder = WorklistCriteria::builder();
    builder
        .filter(WcField::ProcessFolio, WcCompare::Like, "H*")
        .unwrap();
    assert_eq!(bob.open_worklist(&builder.build()).unwrap().total_count(), 2);

    let mut builder = WorklistCriteria::builder();
    builder
        .filter(WcField::ProcessFolio, WcCompare::NotLike, "H*")
        .unwrap();
    assert_eq!(bob.open_worklist(&builder.build()).unwrap().total_count(), 3);
}

#[test]
fn test_sort_precedence_follows_clause_order() {
    let env = TestEnv::new();
    let bob = env.session("bob");
    seed_worklist(&bob);

    let mut builder = WorklistCriteria::builder();
    builder
        .add_sort(WcField::ProcessPriority, WcSortOrder::Descending)
        .add_sort(WcField::ProcessFolio, WcSortOrder::Ascending);
    let worklist = bob.open_worklist(&builder.build()).unwrap();
    assert_eq!(folios(&worklist), vec!["F2", "H2", "F1", "F3", "H1"]);

    let mut builder = WorklistCriteria::builder();
    builder
        .add_sort(WcField::ProcessFolio, WcSortOrder::Ascending)
        .add_sort(WcField::ProcessPriority, WcSortOrder::Descending);
    let worklist = bob.open_worklist(&builder.build()).unwrap();
    assert_eq!(folios(&worklist), vec!["F1", "F2", "F3", "H1", "H2"]);
}

#[test]
fn test_paging_keeps_total_count() {
    let env = TestEnv::new();
    let bob = env.session("bob");
    seed_worklist(&bob);

    let mut builder = WorklistCriteria::builder();
    builder.add_sort(WcField::ProcessFolio, WcSortOrder::Ascending);
    builder.page(1, 2).unwrap();

    let worklist = bob.open_worklist(&builder.build()).unwrap();
    assert_eq!(worklist.total_count(), 5);
    assert_eq!(folios(&worklist), vec!["F2", "F3"]);
}

#[test]
fn test_filter_on_process_data_field() {
    let env = TestEnv::new();
    let bob = env.session("bob");
    seed_worklist(&bob);

    let snapshot = bob.open_worklist(&WorklistCriteria::default()).unwrap();
    let serial = snapshot.find_by_folio("F2").next().unwrap().serial_number().clone();
    let mut item = bob.open_worklist_item(&serial).unwrap();
    item.set_field("Amount", 750).unwrap();
    item.update().unwrap();

    let mut builder = WorklistCriteria::builder();
    builder
        .filter(
            WcField::ProcessData("Amount".to_string()),
            WcCompare::Greater,
            500,
        )
        .unwrap();
    let worklist = bob.open_worklist(&builder.build()).unwrap();
    assert_eq!(folios(&worklist), vec!["F2"]);
    assert_eq!(worklist.items()[0].status(), ItemStatus::Opened);
}

#[test]
fn test_filter_on_item_status() {
    let env = TestEnv::new();
    let bob = env.session("bob");
    seed_worklist(&bob);

    let mut snapshot = bob.open_worklist(&WorklistCriteria::default()).unwrap();
    snapshot.get_mut(0).unwrap().open().unwrap();

    let mut builder = WorklistCriteria::builder();
    builder
        .filter(WcField::WorklistItemStatus, WcCompare::Equal, "opened")
        .unwrap();
    assert_eq!(bob.open_worklist(&builder.build()).unwrap().total_count(), 1);
}

#[test]
fn test_snapshot_is_not_refreshed() {
    let env = TestEnv::new();
    let bob = env.session("bob");
    seed_worklist(&bob);

    let mut snapshot = bob.open_worklist(&WorklistCriteria::default()).unwrap();
    let serial = snapshot.find_by_folio("H1").next().unwrap().serial_number().clone();
    let item = snapshot.find_by_serial_mut(&serial).unwrap();
    item.open().unwrap();
    item.execute_action("Approve").unwrap();

    // The snapshot still holds all five handles
    assert_eq!(snapshot.len(), 5);
    assert_eq!(
        snapshot.find_by_serial(&serial).unwrap().status(),
        ItemStatus::Completed
    );

    // A fresh query no longer sees the completed item
    let fresh = bob.open_worklist(&WorklistCriteria::default()).unwrap();
    assert_eq!(fresh.total_count(), 4);
    assert!(fresh.find_by_serial(&serial).is_none());
}

#[test]
fn test_managed_worklist_requires_reporting_line() {
    let env = TestEnv::new();
    let bob = env.session("bob");
    seed_worklist(&bob);

    let anthony = env.session("anthony");
    let managed = anthony
        .open_managed_worklist(&WorklistCriteria::default(), "bob")
        .unwrap();
    assert_eq!(managed.total_count(), 5);

    let carol = env.session("carol");
    let err = carol
        .open_managed_worklist(&WorklistCriteria::default(), "bob")
        .unwrap_err();
    assert!(matches!(err, Error::Authorization(_)));
}

#[test]
fn test_managed_worklist_items_open_as_manager() {
    let env = TestEnv::new();
    let bob = env.session("bob");
    start(&bob, "HR\\Leave Request", "Leave", 1);

    let anthony = env.session("anthony");
    let mut managed = anthony
        .open_managed_worklist(&WorklistCriteria::default(), "K2:bob")
        .unwrap();
    let item = managed.get_mut(0).unwrap();
    item.open().unwrap();
    assert_eq!(item.status(), ItemStatus::Opened);
    item.execute_action("Decline").unwrap();

    assert_eq!(
        bob.open_worklist(&WorklistCriteria::default())
            .unwrap()
            .total_count(),
        0
    );
}

#[test]
fn test_platform_filter() {
    let env = TestEnv::new();
    let bob = env.session("bob");
    start(&bob, "HR\\Kiosk Request", "Kiosk", 1);
    start(&bob, "HR\\Leave Request", "Leave", 1);

    let asp = bob.open_worklist(&WorklistCriteria::default()).unwrap();
    assert_eq!(folios(&asp), vec!["Leave"]);

    let kiosk = bob
        .query_worklist(&WorklistCriteria::default(), None, "Kiosk")
        .unwrap();
    assert_eq!(folios(&kiosk), vec!["Kiosk"]);
    assert_eq!(kiosk.items()[0].platform(), "Kiosk");
}

#[test]
fn test_worklist_is_scoped_to_destination() {
    let env = TestEnv::new();
    let bob = env.session("bob");
    seed_worklist(&bob);

    // Expense claims route to carol as well, leave requests only to bob
    let carol = env.session("carol");
    let worklist = carol.open_worklist(&WorklistCriteria::default()).unwrap();
    assert_eq!(worklist.total_count(), 3);
    assert!(worklist.iter().all(|item| item.process_name() == "Expense Claim"));

    let dave = env.session("dave");
    assert!(
        dave.open_worklist(&WorklistCriteria::default())
            .unwrap()
            .is_empty()
    );
}

#[test]
fn test_criteria_survive_the_wire() {
    let mut builder = WorklistCriteria::builder();
    builder
        .filter(WcField::ProcessFolder, WcCompare::Equal, "Finance")
        .unwrap()
        .add_filter(
            Some(WcLogical::Or),
            WcField::ActivityName,
            WcCompare::Equal,
            "Approve",
        )
        .unwrap()
        .add_sort(WcField::ActivityStartDate, WcSortOrder::Descending)
        .add_sort(WcField::ProcessFolio, WcSortOrder::Ascending);
    let criteria = builder.build();

    let parsed = WorklistCriteria::from_wire(&criteria.to_wire().unwrap()).unwrap();
    assert_eq!(parsed, criteria);
}
