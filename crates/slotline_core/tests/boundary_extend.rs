use slotline_core::model::slot::ObservationStateData;
use slotline_core::{
    machine_state_template_only, open_db_in_memory, BoundaryExtender, Direction, ExtendError,
    PartitionKey, RepoResult, ScanCap, Slot, SlotData, SlotKind, SlotStore, SqliteSlotStore,
    Timeline, Timestamp, UtcRange,
};
use std::time::Duration;

const MACHINE: PartitionKey = PartitionKey::Machine(3);

fn observed(range: UtcRange, template: i64, state: i64) -> Slot {
    Slot::new(
        MACHINE,
        range,
        SlotData::ObservationState(ObservationStateData {
            machine_state_template: Some(template),
            machine_observation_state: Some(state),
            ..ObservationStateData::default()
        }),
    )
}

fn template(range: UtcRange, template: i64) -> Slot {
    Slot::new(
        MACHINE,
        range,
        SlotData::ObservationState(ObservationStateData {
            machine_state_template: Some(template),
            ..ObservationStateData::default()
        }),
    )
}

fn generous_cap() -> ScanCap {
    ScanCap {
        max_candidates: 100,
        max_elapsed: Duration::from_secs(60),
    }
}

fn seed_fine(store: &SqliteSlotStore<'_>) {
    store
        .replace_slots(
            Timeline::new(SlotKind::ObservationState, MACHINE),
            &[],
            &[
                observed(UtcRange::until(0), 9, 1),
                observed(UtcRange::between(0, 1_000), 1, 1),
                observed(UtcRange::between(1_000, 2_000), 1, 2),
                observed(UtcRange::between(2_000, 3_000), 1, 3),
                observed(UtcRange::between(3_000, 4_000), 2, 1),
            ],
        )
        .unwrap();
}

#[test]
fn extends_to_the_maximal_run_of_equal_templates() {
    let conn = open_db_in_memory().unwrap();
    let store = SqliteSlotStore::try_new(&conn).unwrap();
    seed_fine(&store);
    let extender = BoundaryExtender::new(
        &store,
        SlotKind::ObservationState,
        machine_state_template_only,
        generous_cap(),
    );
    let start = template(UtcRange::between(1_000, 2_000), 1);

    let left = extender.extend_left(&start).unwrap();
    assert_eq!(left.slot.range, UtcRange::between(0, 2_000));
    assert!(!left.limit_reached);

    let right = extender.extend_right(&start).unwrap();
    assert_eq!(right.slot.range, UtcRange::between(1_000, 3_000));

    let both = extender.extend(&start).unwrap();
    assert_eq!(both.slot, template(UtcRange::between(0, 3_000), 1));
}

#[test]
fn extension_order_does_not_matter_on_a_gap_free_store() {
    let conn = open_db_in_memory().unwrap();
    let store = SqliteSlotStore::try_new(&conn).unwrap();
    seed_fine(&store);
    let extender = BoundaryExtender::new(
        &store,
        SlotKind::ObservationState,
        machine_state_template_only,
        generous_cap(),
    );
    let start = template(UtcRange::between(1_000, 2_000), 1);

    let left_then_right = extender
        .extend_right(&extender.extend_left(&start).unwrap().slot)
        .unwrap();
    let right_then_left = extender
        .extend_left(&extender.extend_right(&start).unwrap().slot)
        .unwrap();
    assert_eq!(left_then_right.slot, right_then_left.slot);
}

/// Store that fails the test on any access.
struct UntouchableStore;

impl SlotStore for UntouchableStore {
    fn find_overlapping(&self, _: Timeline, _: &UtcRange) -> RepoResult<Vec<Slot>> {
        panic!("store must not be scanned")
    }

    fn find_adjacent(&self, _: Timeline, _: Timestamp, _: Direction) -> RepoResult<Option<Slot>> {
        panic!("store must not be scanned")
    }

    fn replace_slots(&self, _: Timeline, _: &[Slot], _: &[Slot]) -> RepoResult<Vec<Slot>> {
        panic!("store must not be written")
    }

    fn find_all(&self, _: Timeline) -> RepoResult<Vec<Slot>> {
        panic!("store must not be scanned")
    }

    fn find_at(&self, _: Timeline, _: Timestamp) -> RepoResult<Option<Slot>> {
        panic!("store must not be scanned")
    }
}

#[test]
fn unbounded_lower_bound_is_returned_without_scanning() {
    let extender = BoundaryExtender::new(
        &UntouchableStore,
        SlotKind::ObservationState,
        machine_state_template_only,
        generous_cap(),
    );
    let start = template(UtcRange::until(500), 4);

    let extension = extender.extend_left(&start).unwrap();
    assert_eq!(extension.slot, start);
    assert_eq!(extension.scanned, 0);
}

#[test]
fn candidate_cap_reports_the_partial_result() {
    let conn = open_db_in_memory().unwrap();
    let store = SqliteSlotStore::try_new(&conn).unwrap();
    seed_fine(&store);
    let extender = BoundaryExtender::new(
        &store,
        SlotKind::ObservationState,
        machine_state_template_only,
        ScanCap {
            max_candidates: 1,
            max_elapsed: Duration::from_secs(60),
        },
    );

    let err = extender
        .extend_left(&template(UtcRange::between(2_000, 3_000), 1))
        .unwrap_err();
    match err {
        ExtendError::ScanCapExceeded { partial, .. } => {
            assert_eq!(partial.slot.range, UtcRange::between(1_000, 3_000));
            assert_eq!(partial.scanned, 1);
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn elapsed_cap_reports_before_the_first_fetch() {
    let conn = open_db_in_memory().unwrap();
    let store = SqliteSlotStore::try_new(&conn).unwrap();
    seed_fine(&store);
    let extender = BoundaryExtender::new(
        &store,
        SlotKind::ObservationState,
        machine_state_template_only,
        ScanCap {
            max_candidates: 100,
            max_elapsed: Duration::ZERO,
        },
    );
    let start = template(UtcRange::between(1_000, 2_000), 1);

    assert!(matches!(
        extender.extend_right(&start),
        Err(ExtendError::ScanCapExceeded { .. })
    ));
}

#[test]
fn limit_range_stops_the_scan_and_is_reported() {
    let conn = open_db_in_memory().unwrap();
    let store = SqliteSlotStore::try_new(&conn).unwrap();
    seed_fine(&store);
    let extender = BoundaryExtender::new(
        &store,
        SlotKind::ObservationState,
        machine_state_template_only,
        generous_cap(),
    )
    .with_limit(UtcRange::between(500, 10_000));

    let extension = extender
        .extend_left(&template(UtcRange::between(1_000, 2_000), 1))
        .unwrap();
    assert_eq!(extension.slot.range, UtcRange::between(500, 2_000));
    assert!(extension.limit_reached);
}

#[test]
fn gap_in_the_fine_timeline_ends_the_run() {
    let conn = open_db_in_memory().unwrap();
    let store = SqliteSlotStore::try_new(&conn).unwrap();
    store
        .replace_slots(
            Timeline::new(SlotKind::ObservationState, MACHINE),
            &[],
            &[
                observed(UtcRange::between(0, 1_000), 1, 1),
                observed(UtcRange::between(1_500, 2_000), 1, 2),
            ],
        )
        .unwrap();
    let extender = BoundaryExtender::new(
        &store,
        SlotKind::ObservationState,
        machine_state_template_only,
        generous_cap(),
    );

    let extension = extender
        .extend_left(&template(UtcRange::between(1_500, 2_000), 1))
        .unwrap();
    assert_eq!(extension.slot.range, UtcRange::between(1_500, 2_000));
    assert_eq!(extension.scanned, 0);
}
