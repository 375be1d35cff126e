use tokio_util::sync::CancellationToken;

use harvest_core::testutil::{ManualClock, MockPortal};
use harvest_core::{CheckpointStore, EgressPool, HarvestConfig, KeyAlphabet, Partition};

use crate::integration::common::{
    CATEGORY, REGION, assert_no_duplicates, ids_in, quiet_config, run, run_with,
};

fn partition(symbol: &str) -> Partition {
    Partition::new(REGION, CATEGORY, Some(symbol.into()))
}

/// Three partitions: A (30 records), B (40) and C (450).
fn abc_portal() -> MockPortal {
    let mut portal = MockPortal::new();
    for (lead, count) in [("A", 30), ("B", 40), ("C", 450)] {
        for i in 0..count {
            portal = portal.with_record(
                REGION,
                CATEGORY,
                &format!("{lead}{i} Road"),
                &format!("{lead}-{i:04}"),
            );
        }
    }
    portal
}

fn abc_config(dir: &std::path::Path) -> HarvestConfig {
    quiet_config(dir).with_alphabet(KeyAlphabet::from_chars("ABC").unwrap())
}

#[tokio::test]
async fn restart_skips_completed_partitions_and_resumes_mid_partition() {
    // Reference: one uninterrupted run.
    let reference = tempfile::tempdir().unwrap();
    run(abc_portal(), abc_config(reference.path()), ManualClock::new())
        .await
        .unwrap();
    let reference_c = ids_in(&reference.path().join("travis_ossf_c.ndjson"));
    assert_eq!(reference_c.len(), 450);

    // Interrupted run: A (1 page), B (1 page), then C pages 0, 100, 200.
    let dir = tempfile::tempdir().unwrap();
    let config = abc_config(dir.path());
    let cancel = CancellationToken::new();
    let first = abc_portal().cancel_after(5, cancel.clone());
    let summary = run_with(
        first,
        config.clone(),
        EgressPool::direct(),
        ManualClock::new(),
        cancel,
    )
    .await
    .unwrap();
    assert_eq!(summary.completed, 2);
    assert_eq!(summary.interrupted, 1);

    let saved = CheckpointStore::new(config.resolved_checkpoint_path())
        .load()
        .await
        .unwrap()
        .unwrap();
    assert!(saved.is_completed(&partition("A")));
    assert!(saved.is_completed(&partition("B")));
    assert_eq!(saved.resume_offset(&partition("C")), 300);
    assert_eq!(saved.total_records, 370);

    // Restart.
    let second = abc_portal();
    let summary = run(second.clone(), config.clone(), ManualClock::new())
        .await
        .unwrap();

    assert!(second.offsets_for(&partition("A")).is_empty());
    assert!(second.offsets_for(&partition("B")).is_empty());
    assert_eq!(second.offsets_for(&partition("C")), vec![300, 400]);
    assert_eq!(summary.skipped, 2);
    assert_eq!(summary.completed, 1);
    assert_eq!(summary.records_emitted, 150);

    let resumed_c = ids_in(&dir.path().join("travis_ossf_c.ndjson"));
    assert_eq!(resumed_c, reference_c);
    assert!(!dir.path().join("travis_ossf_c.ndjson.part").exists());
    assert_no_duplicates(dir.path());

    let saved = CheckpointStore::new(config.resolved_checkpoint_path())
        .load()
        .await
        .unwrap()
        .unwrap();
    assert_eq!(saved.completed.len(), 3);
    assert!(saved.in_flight.is_empty());
    assert_eq!(saved.total_records, 520);
}

#[tokio::test]
async fn page_written_but_not_checkpointed_is_not_duplicated() {
    let dir = tempfile::tempdir().unwrap();
    // Flush only at partition boundaries, so C's progress stays in memory.
    let config = abc_config(dir.path()).with_flush_every(10_000);

    let cancel = CancellationToken::new();
    run_with(
        abc_portal().cancel_after(4, cancel.clone()),
        config.clone(),
        EgressPool::direct(),
        ManualClock::new(),
        cancel,
    )
    .await
    .unwrap();

    // Simulate a crash that lost the final flush: C's lines are on disk but
    // the checkpoint still shows it untouched.
    let store = CheckpointStore::new(config.resolved_checkpoint_path());
    let mut checkpoint = store.load().await.unwrap().unwrap();
    checkpoint.in_flight.clear();
    store.save(&checkpoint).await.unwrap();

    let portal = abc_portal();
    let summary = run(portal.clone(), config, ManualClock::new())
        .await
        .unwrap();

    assert_eq!(portal.offsets_for(&partition("C")), vec![0, 100, 200, 300, 400]);
    assert_eq!(summary.records_emitted, 250);
    assert_eq!(summary.duplicates_suppressed, 200);
    assert_eq!(ids_in(&dir.path().join("travis_ossf_c.ndjson")).len(), 450);
    assert_no_duplicates(dir.path());
}

#[tokio::test]
async fn torn_trailing_line_is_repaired_on_resume() {
    let dir = tempfile::tempdir().unwrap();
    let config = abc_config(dir.path());

    let cancel = CancellationToken::new();
    run_with(
        abc_portal().cancel_after(3, cancel.clone()),
        config.clone(),
        EgressPool::direct(),
        ManualClock::new(),
        cancel,
    )
    .await
    .unwrap();

    let part = dir.path().join("travis_ossf_c.ndjson.part");
    let mut content = std::fs::read_to_string(&part).unwrap();
    content.push_str("{\"id\":\"C-01");
    std::fs::write(&part, content).unwrap();

    run(abc_portal(), config, ManualClock::new()).await.unwrap();

    let ids = ids_in(&dir.path().join("travis_ossf_c.ndjson"));
    assert_eq!(ids.len(), 450);
    assert_no_duplicates(dir.path());
}

#[tokio::test]
async fn tail_torn_inside_multibyte_character_does_not_block_resume() {
    let dir = tempfile::tempdir().unwrap();
    let config = abc_config(dir.path());

    let cancel = CancellationToken::new();
    run_with(
        abc_portal().cancel_after(3, cancel.clone()),
        config.clone(),
        EgressPool::direct(),
        ManualClock::new(),
        cancel,
    )
    .await
    .unwrap();

    let part = dir.path().join("travis_ossf_c.ndjson.part");
    let mut bytes = std::fs::read(&part).unwrap();
    bytes.extend_from_slice(b"{\"id\":\"C-0100\",\"address\":\"Caf\xC3");
    std::fs::write(&part, bytes).unwrap();

    let portal = abc_portal();
    run(portal.clone(), config, ManualClock::new()).await.unwrap();

    assert!(!portal.offsets_for(&partition("C")).is_empty());
    assert_eq!(ids_in(&dir.path().join("travis_ossf_c.ndjson")).len(), 450);
    assert_no_duplicates(dir.path());
}

#[tokio::test]
async fn corrupt_checkpoint_aborts_instead_of_starting_over() {
    let dir = tempfile::tempdir().unwrap();
    let config = abc_config(dir.path());
    std::fs::write(config.resolved_checkpoint_path(), "{\"version\": 1, \"comp").unwrap();

    let portal = abc_portal();
    let err = run(portal.clone(), config, ManualClock::new())
        .await
        .unwrap_err();

    assert!(err.is_fatal());
    assert!(portal.requests().is_empty());
}
