use slotline_core::model::slot::ShiftData;
use slotline_core::service::partition_lock::try_acquire;
use slotline_core::{
    open_db_in_memory, AnalysisConfig, ApplyOutcome, Association, AssociationData,
    AssociationOptions, AssociationRepository, AssociationService, AssociationStatus,
    InProcessPartitionLocks, PartitionKey, RepoError, ServiceError, Slot, SlotData, SlotKind,
    SlotStore, SqliteAssociationRepository, SqliteSlotStore, Timeline, Timestamp, UtcRange,
};
use std::time::Duration;
use uuid::Uuid;

const MACHINE: PartitionKey = PartitionKey::Machine(11);
const NOW: Timestamp = Timestamp(500_000_000);

fn shift_change(range: UtcRange, template: i64, application_ms: i64) -> Association {
    Association::new(
        MACHINE,
        range,
        AssociationData::ShiftChange {
            shift_template: Some(template),
            shift: None,
        },
        Timestamp(application_ms),
    )
}

#[test]
fn enqueue_get_roundtrips_every_column() {
    let conn = open_db_in_memory().unwrap();
    let repo = SqliteAssociationRepository::try_new(&conn).unwrap();
    let mut association = Association::new(
        PartitionKey::MachineModule(4),
        UtcRange::since(1_000),
        AssociationData::MachineStateTemplate {
            machine_state_template: 8,
            user: Some(3),
            shift: None,
            force: true,
            user_required: false,
        },
        Timestamp(2_000),
    )
    .with_options(AssociationOptions {
        no_right_merge: true,
        past_only: true,
        ..AssociationOptions::default()
    });
    association.progress.step_span = Some(Duration::from_secs(90));

    repo.enqueue(&association).unwrap();
    assert_eq!(repo.get(association.id).unwrap(), Some(association));
    assert_eq!(repo.get(Uuid::new_v4()).unwrap(), None);
}

#[test]
fn pending_list_is_ordered_and_skips_completed() {
    let conn = open_db_in_memory().unwrap();
    let repo = SqliteAssociationRepository::try_new(&conn).unwrap();
    let late = shift_change(UtcRange::between(0, 10), 1, 300);
    let early = shift_change(UtcRange::between(0, 10), 2, 100);
    let done = shift_change(UtcRange::between(0, 10), 3, 200);
    for association in [&late, &early, &done] {
        repo.enqueue(association).unwrap();
    }
    let mut progress = done.progress.clone();
    progress.status = AssociationStatus::Completed;
    repo.record_progress(done.id, &progress).unwrap();

    let ids: Vec<_> = repo
        .list_pending(None)
        .unwrap()
        .into_iter()
        .map(|association| association.id)
        .collect();
    assert_eq!(ids, vec![early.id, late.id]);
    assert_eq!(repo.list_pending(Some(1)).unwrap().len(), 1);
}

#[test]
fn record_progress_on_unknown_id_is_not_found() {
    let conn = open_db_in_memory().unwrap();
    let repo = SqliteAssociationRepository::try_new(&conn).unwrap();
    let id = Uuid::new_v4();
    let err = repo
        .record_progress(id, &Default::default())
        .unwrap_err();
    assert!(matches!(err, RepoError::NotFound(missing) if missing == id));
}

#[test]
fn apply_pending_completes_and_writes_slots() {
    let conn = open_db_in_memory().unwrap();
    let locks = InProcessPartitionLocks::new();
    let service = AssociationService::new(
        SqliteSlotStore::try_new(&conn).unwrap(),
        SqliteAssociationRepository::try_new(&conn).unwrap(),
        &locks,
        AnalysisConfig::default(),
    );
    let association = shift_change(UtcRange::between(1_000, 5_000), 6, 0);
    service.enqueue(&association).unwrap();

    let outcome = service.apply_pending(association.id, NOW).unwrap();
    assert!(matches!(outcome, ApplyOutcome::Completed { .. }));

    let stored = service.get(association.id).unwrap().unwrap();
    assert_eq!(stored.progress.status, AssociationStatus::Completed);
    assert_eq!(stored.progress.applied_until, Some(Timestamp(5_000)));
    assert!(service.list_pending(None).unwrap().is_empty());

    let store = SqliteSlotStore::try_new(&conn).unwrap();
    let slots = store
        .find_all(Timeline::new(SlotKind::Shift, MACHINE))
        .unwrap();
    assert_eq!(slots.len(), 1);
    assert_eq!(
        slots[0].data,
        SlotData::Shift(ShiftData {
            shift_template: Some(6),
            shift: None,
        })
    );

    let again = service.apply_pending(association.id, NOW).unwrap();
    assert_eq!(
        again,
        ApplyOutcome::Completed {
            slots_written: 0,
            merges: 0
        }
    );
}

#[test]
fn busy_partition_leaves_association_pending() {
    let conn = open_db_in_memory().unwrap();
    let locks = InProcessPartitionLocks::new();
    let service = AssociationService::new(
        SqliteSlotStore::try_new(&conn).unwrap(),
        SqliteAssociationRepository::try_new(&conn).unwrap(),
        &locks,
        AnalysisConfig::default(),
    );
    let association = shift_change(UtcRange::between(0, 1_000), 1, 0);
    service.enqueue(&association).unwrap();

    let held = try_acquire(&locks, MACHINE).unwrap();
    let err = service.apply_pending(association.id, NOW).unwrap_err();
    assert!(matches!(err, ServiceError::PartitionBusy(key) if key == MACHINE));
    assert_eq!(
        service.get(association.id).unwrap().unwrap().progress.status,
        AssociationStatus::Pending
    );

    drop(held);
    service.apply_pending(association.id, NOW).unwrap();
    assert!(!locks.is_held(MACHINE));
}

#[test]
fn interrupted_run_records_resume_point_and_next_run_finishes() {
    let conn = open_db_in_memory().unwrap();
    let locks = InProcessPartitionLocks::new();
    let interrupting = AssociationService::new(
        SqliteSlotStore::try_new(&conn).unwrap(),
        SqliteAssociationRepository::try_new(&conn).unwrap(),
        &locks,
        AnalysisConfig {
            step_timeout_ms: 0,
            ..AnalysisConfig::default()
        },
    );
    let association = shift_change(UtcRange::between(0, 600_000), 2, 0);
    interrupting.enqueue(&association).unwrap();

    let outcome = interrupting.apply_pending(association.id, NOW).unwrap();
    assert!(matches!(outcome, ApplyOutcome::Interrupted { .. }));
    let stored = interrupting.get(association.id).unwrap().unwrap();
    assert_eq!(stored.progress.status, AssociationStatus::Interrupted);
    assert_eq!(stored.progress.applied_until, Some(Timestamp(0)));
    assert_eq!(stored.progress.step_span, Some(Duration::from_secs(300)));

    let finishing = AssociationService::new(
        SqliteSlotStore::try_new(&conn).unwrap(),
        SqliteAssociationRepository::try_new(&conn).unwrap(),
        &locks,
        AnalysisConfig::default(),
    );
    let outcome = finishing.apply_pending(association.id, NOW).unwrap();
    assert!(matches!(outcome, ApplyOutcome::Completed { .. }));

    let store = SqliteSlotStore::try_new(&conn).unwrap();
    let ranges: Vec<_> = store
        .find_all(Timeline::new(SlotKind::Shift, MACHINE))
        .unwrap()
        .into_iter()
        .map(|slot: Slot| slot.range)
        .collect();
    assert_eq!(ranges, vec![UtcRange::between(0, 600_000)]);
}

#[test]
fn failures_count_attempts_and_keep_association_pending() {
    let conn = open_db_in_memory().unwrap();
    let locks = InProcessPartitionLocks::new();
    let service = AssociationService::new(
        SqliteSlotStore::try_new(&conn).unwrap(),
        SqliteAssociationRepository::try_new(&conn).unwrap(),
        &locks,
        AnalysisConfig {
            max_failed_attempts: 2,
            ..AnalysisConfig::default()
        },
    );
    let association = shift_change(UtcRange::between(0, 1_000), 1, 0);
    service.enqueue(&association).unwrap();
    conn.execute_batch("DROP TABLE slots;").unwrap();

    for expected_attempts in 1..=2 {
        let err = service.apply_pending(association.id, NOW).unwrap_err();
        assert!(matches!(err, ServiceError::Apply(_)));
        let stored = service.get(association.id).unwrap().unwrap();
        assert_eq!(stored.progress.status, AssociationStatus::Failed);
        assert_eq!(stored.progress.attempts, expected_attempts);
        assert!(stored.progress.last_error.is_some());
    }
    assert_eq!(service.list_pending(None).unwrap().len(), 1);
}

#[test]
fn unknown_association_is_not_found() {
    let conn = open_db_in_memory().unwrap();
    let locks = InProcessPartitionLocks::new();
    let service = AssociationService::new(
        SqliteSlotStore::try_new(&conn).unwrap(),
        SqliteAssociationRepository::try_new(&conn).unwrap(),
        &locks,
        AnalysisConfig::default(),
    );
    assert!(matches!(
        service.apply_pending(Uuid::new_v4(), NOW),
        Err(ServiceError::Repo(RepoError::NotFound(_)))
    ));
}
