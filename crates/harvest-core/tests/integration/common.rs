use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use harvest_core::testutil::{ManualClock, MockPortal};
use harvest_core::{
    EgressPool, HarvestConfig, HarvestError, Orchestrator, RetryConfig, RunSummary,
    ThrottleConfig, TracingRunReporter,
};

pub const REGION: &str = "Travis";
pub const CATEGORY: &str = "OSSF";

/// Config with every random component switched off so waits are exact.
pub fn quiet_config(dir: &Path) -> HarvestConfig {
    HarvestConfig::new(dir)
        .with_workers(1)
        .with_page_size(100)
        .with_throttle(ThrottleConfig::new(Duration::from_secs(1)))
        .with_retry(RetryConfig {
            jitter: Duration::ZERO,
            ..RetryConfig::default()
        })
}

/// 237 records (ids 1000..=1236) under prefix "1"; five under "A", three of
/// which are ids already reachable through "1".
pub fn travis_portal() -> MockPortal {
    let portal = (1000..=1236).fold(MockPortal::new(), |portal, id| {
        portal.with_record(REGION, CATEGORY, &format!("{id} Ranch Rd"), &id.to_string())
    });
    portal
        .with_record(REGION, CATEGORY, "Acorn Ln", "1000")
        .with_record(REGION, CATEGORY, "Alder Ct", "1001")
        .with_record(REGION, CATEGORY, "Ash St", "1002")
        .with_record(REGION, CATEGORY, "Aspen Way", "A-77")
        .with_record(REGION, CATEGORY, "Avery Ranch", "A-78")
}

pub async fn run(
    portal: MockPortal,
    config: HarvestConfig,
    clock: ManualClock,
) -> Result<RunSummary, HarvestError> {
    run_with(portal, config, EgressPool::direct(), clock, CancellationToken::new()).await
}

pub async fn run_with(
    portal: MockPortal,
    config: HarvestConfig,
    pool: EgressPool,
    clock: ManualClock,
    cancel: CancellationToken,
) -> Result<RunSummary, HarvestError> {
    Orchestrator::new(portal, config, pool, clock)
        .run(cancel, Arc::new(TracingRunReporter))
        .await
}

/// Output files in `dir`, final and in-progress.
pub fn output_files(dir: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .filter(|path| {
            let name = path.file_name().unwrap().to_string_lossy();
            name.ends_with(".ndjson") || name.ends_with(".ndjson.part")
        })
        .collect();
    files.sort();
    files
}

/// Ids in one output file, in line order. Every line must parse.
pub fn ids_in(path: &Path) -> Vec<String> {
    std::fs::read_to_string(path)
        .unwrap()
        .lines()
        .map(|line| {
            let value: serde_json::Value = serde_json::from_str(line).unwrap();
            value["id"].as_str().unwrap().to_string()
        })
        .collect()
}

/// Occurrences of every id across all output files of `dir`.
pub fn id_counts(dir: &Path) -> HashMap<String, usize> {
    let mut counts = HashMap::new();
    for file in output_files(dir) {
        for id in ids_in(&file) {
            *counts.entry(id).or_insert(0) += 1;
        }
    }
    counts
}

pub fn assert_no_duplicates(dir: &Path) {
    let duplicated: Vec<_> = id_counts(dir)
        .into_iter()
        .filter(|(_, n)| *n > 1)
        .collect();
    assert!(duplicated.is_empty(), "duplicated ids: {duplicated:?}");
}
