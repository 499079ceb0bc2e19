pub mod fetcher;
pub mod inventory;

use rayon::prelude::*;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::roster::{self, FetchKey, FormatError};
pub use fetcher::{FetchError, HttpFetcher, ImageFetcher, OfflineFetcher};
pub use inventory::{ImageAsset, LocalInventory};

pub const DEFAULT_WORKERS: usize = 5;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// One download to perform, keyed by its remote fetch key
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadTask {
    pub fetch_key: FetchKey,
    pub filename: String,
    pub target_path: PathBuf,
    /// Other missing filenames with the same key, filled from the same download
    pub aliases: Vec<String>,
    pub attempt_count: u32,
}

/// Why a required filename could not be made available
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum AcquisitionFailure {
    Format(FormatError),
    Fetch(FetchError),
}

impl AcquisitionFailure {
    pub fn reason_code(&self) -> &'static str {
        match self {
            AcquisitionFailure::Format(_) => "FORMAT_ERROR",
            AcquisitionFailure::Fetch(e) => e.reason_code(),
        }
    }
}

impl fmt::Display for AcquisitionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AcquisitionFailure::Format(e) => write!(f, "{}", e),
            AcquisitionFailure::Fetch(e) => write!(f, "{}", e),
        }
    }
}

/// Outcome of one reconciliation pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AcquisitionStats {
    pub total: usize,
    pub missing: usize,
    pub downloaded: usize,
    pub failed: usize,
    pub already_available: usize,
    /// Keyed by required filename
    pub failures: BTreeMap<String, AcquisitionFailure>,
}

impl AcquisitionStats {
    fn record_success(&mut self, filename: &str) {
        debug!(filename, "portrait acquired");
        self.downloaded += 1;
    }

    fn record_failure(&mut self, filename: &str, failure: AcquisitionFailure) {
        warn!(filename, reason = failure.reason_code(), "portrait unavailable: {}", failure);
        self.failed += 1;
        self.failures.insert(filename.to_string(), failure);
    }
}

/// How a required set splits before anything is downloaded
#[derive(Debug, Clone, Default)]
pub struct ReconciliationPlan {
    pub present: Vec<String>,
    pub tasks: Vec<DownloadTask>,
    pub rejected: Vec<(String, FormatError)>,
}

impl ReconciliationPlan {
    pub fn missing_count(&self) -> usize {
        self.tasks.iter().map(|t| 1 + t.aliases.len()).sum::<usize>() + self.rejected.len()
    }
}

/// Progress notification for one finished download task
#[derive(Debug)]
pub struct FetchProgress<'a> {
    pub completed: usize,
    pub total: usize,
    pub filename: &'a str,
    pub error: Option<&'a FetchError>,
}

/// Makes a required set of source filenames available locally
pub struct AcquisitionCoordinator<F: ImageFetcher> {
    inventory: LocalInventory,
    fetcher: F,
    workers: usize,
    timeout: Duration,
}

impl<F: ImageFetcher> AcquisitionCoordinator<F> {
    pub fn new(inventory: LocalInventory, fetcher: F) -> Self {
        Self {
            inventory,
            fetcher,
            workers: DEFAULT_WORKERS,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn inventory(&self) -> &LocalInventory {
        &self.inventory
    }

    pub fn fetcher(&self) -> &F {
        &self.fetcher
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Partition a required set into present files, download tasks and
    /// undecodable names
    pub fn plan(&self, required: &BTreeSet<String>) -> ReconciliationPlan {
        let mut plan = ReconciliationPlan::default();
        let mut by_key: BTreeMap<FetchKey, usize> = BTreeMap::new();

        for filename in required {
            if self.inventory.exists(filename) {
                plan.present.push(filename.clone());
                continue;
            }

            match roster::fetch_key_for(filename) {
                Ok(key) => match by_key.get(&key) {
                    Some(&index) => plan.tasks[index].aliases.push(filename.clone()),
                    None => {
                        by_key.insert(key, plan.tasks.len());
                        plan.tasks.push(DownloadTask {
                            fetch_key: key,
                            filename: filename.clone(),
                            target_path: self.inventory.path_for(filename),
                            aliases: Vec::new(),
                            attempt_count: 0,
                        });
                    }
                },
                Err(e) => plan.rejected.push((filename.clone(), e)),
            }
        }

        plan
    }

    /// Download every missing file; blocks until all tasks have finished
    pub fn reconcile(&self, required: &BTreeSet<String>) -> AcquisitionStats {
        self.reconcile_with_progress(required, &|_| {})
    }

    pub fn reconcile_with_progress(
        &self,
        required: &BTreeSet<String>,
        progress: &(dyn Fn(FetchProgress<'_>) + Sync),
    ) -> AcquisitionStats {
        let plan = self.plan(required);

        let mut initial = AcquisitionStats {
            total: required.len(),
            already_available: plan.present.len(),
            missing: plan.missing_count(),
            ..Default::default()
        };
        for (filename, error) in plan.rejected {
            initial.record_failure(&filename, AcquisitionFailure::Format(error));
        }

        info!(
            total = initial.total,
            present = initial.already_available,
            to_download = plan.tasks.len(),
            workers = self.workers,
            "reconciling source images"
        );

        if plan.tasks.is_empty() {
            return initial;
        }

        let stats = Mutex::new(initial);
        let completed = AtomicUsize::new(0);
        let task_total = plan.tasks.len();

        let run_task = |task: &DownloadTask| {
            let mut task = task.clone();
            task.attempt_count += 1;
            let fetched = self
                .fetcher
                .fetch(task.fetch_key, &task.target_path, self.timeout);
            // Aliases only depend on the primary download, each succeeds or fails alone
            let copies: Vec<(&String, Result<(), FetchError>)> = match &fetched {
                Ok(_) => task
                    .aliases
                    .iter()
                    .map(|alias| (alias, self.copy_alias(&task, alias)))
                    .collect(),
                Err(_) => Vec::new(),
            };

            let done = completed.fetch_add(1, Ordering::Relaxed) + 1;
            progress(FetchProgress {
                completed: done,
                total: task_total,
                filename: &task.filename,
                error: fetched.as_ref().err(),
            });

            // Single aggregation point for worker results
            let mut stats = stats.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            match &fetched {
                Ok(_) => {
                    stats.record_success(&task.filename);
                    for (alias, copied) in copies {
                        match copied {
                            Ok(()) => stats.record_success(alias),
                            Err(e) => stats.record_failure(alias, AcquisitionFailure::Fetch(e)),
                        }
                    }
                }
                Err(e) => {
                    for filename in std::iter::once(&task.filename).chain(task.aliases.iter()) {
                        stats.record_failure(filename, AcquisitionFailure::Fetch(e.clone()));
                    }
                }
            }
        };

        match rayon::ThreadPoolBuilder::new()
            .num_threads(self.workers)
            .thread_name(|i| format!("fetch-worker-{}", i))
            .build()
        {
            Ok(pool) => pool.install(|| plan.tasks.par_iter().for_each(run_task)),
            Err(e) => {
                warn!("Failed to build download pool ({}), fetching sequentially", e);
                plan.tasks.iter().for_each(run_task);
            }
        }

        stats.into_inner().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Fill one alias from its task's freshly downloaded file
    fn copy_alias(&self, task: &DownloadTask, alias: &str) -> Result<(), FetchError> {
        let bytes = std::fs::read(&task.target_path).map_err(|e| FetchError::Write(e.to_string()))?;
        fetcher::write_atomically(&self.inventory.path_for(alias), &bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::path::Path;
    use std::sync::atomic::AtomicUsize;

    /// Serves fixed outcomes per key and counts calls
    struct ScriptedFetcher {
        outcomes: HashMap<u64, Result<(), FetchError>>,
        calls: AtomicUsize,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    impl ScriptedFetcher {
        fn new(outcomes: Vec<(u64, Result<(), FetchError>)>) -> Self {
            Self {
                outcomes: outcomes.into_iter().collect(),
                calls: AtomicUsize::new(0),
                in_flight: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            }
        }
    }

    impl ImageFetcher for ScriptedFetcher {
        fn fetch(&self, key: FetchKey, destination: &Path, _timeout: Duration) -> Result<u64, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(20));
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            match self.outcomes.get(&key.value()).cloned().unwrap_or(Err(FetchError::NotFound)) {
                Ok(()) => {
                    std::fs::write(destination, b"img").map_err(|e| FetchError::Write(e.to_string()))?;
                    Ok(3)
                }
                Err(e) => Err(e),
            }
        }

        fn url_for(&self, key: FetchKey) -> Option<String> {
            Some(format!("mock://{}", key))
        }
    }

    fn required(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_reconcile_partitions_and_downloads() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a_1_E_1.jpg"), b"x").unwrap();

        let fetcher = ScriptedFetcher::new(vec![(2, Ok(())), (3, Err(FetchError::Forbidden))]);
        let coordinator = AcquisitionCoordinator::new(LocalInventory::new(dir.path()), fetcher);

        let stats = coordinator.reconcile(&required(&[
            "a_1_E_1.jpg",
            "b_2_E_1.jpg",
            "c_3_E_1.jpg",
            "badname.jpg",
        ]));

        assert_eq!(stats.total, 4);
        assert_eq!(stats.already_available, 1);
        assert_eq!(stats.missing, 3);
        assert_eq!(stats.downloaded, 1);
        assert_eq!(stats.failed, 2);
        assert_eq!(stats.failures["c_3_E_1.jpg"].reason_code(), "FORBIDDEN");
        assert_eq!(stats.failures["badname.jpg"].reason_code(), "FORMAT_ERROR");
        assert!(dir.path().join("b_2_E_1.jpg").is_file());
        assert!(!dir.path().join("c_3_E_1.jpg").exists());
        // The malformed name is never dispatched
        assert_eq!(coordinator.fetcher().calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_second_pass_downloads_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = ScriptedFetcher::new(vec![(1, Ok(())), (2, Ok(()))]);
        let coordinator = AcquisitionCoordinator::new(LocalInventory::new(dir.path()), fetcher);
        let set = required(&["a_1_E_1.jpg", "b_2_E_1.jpg"]);

        let first = coordinator.reconcile(&set);
        assert_eq!(first.downloaded, 2);

        let second = coordinator.reconcile(&set);
        assert_eq!(second.downloaded, 0);
        assert_eq!(second.already_available, 2);
        assert_eq!(coordinator.fetcher().calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_plan_has_one_task_per_key() {
        let dir = tempfile::tempdir().unwrap();
        let coordinator =
            AcquisitionCoordinator::new(LocalInventory::new(dir.path()), ScriptedFetcher::new(vec![]));

        let plan = coordinator.plan(&required(&[
            "a_1_E_1.jpg",
            "b_2_E_1.jpg",
            "c_3_E_1.jpg",
            "a_T001_E_2.jpg",
        ]));

        let keys: BTreeSet<u64> = plan.tasks.iter().map(|t| t.fetch_key.value()).collect();
        assert_eq!(plan.tasks.len(), 3);
        assert_eq!(keys.len(), 3);
        assert_eq!(plan.missing_count(), 4);
        assert!(plan.tasks.iter().all(|t| t.attempt_count == 0));
    }

    #[test]
    fn test_shared_key_aliases_are_copied() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = ScriptedFetcher::new(vec![(1, Ok(()))]);
        let coordinator = AcquisitionCoordinator::new(LocalInventory::new(dir.path()), fetcher);

        let stats = coordinator.reconcile(&required(&["a_1_E_1.jpg", "a_T001_E_2.jpg"]));
        assert_eq!(stats.downloaded, 2);
        assert_eq!(coordinator.fetcher().calls.load(Ordering::SeqCst), 1);
        assert!(dir.path().join("a_T001_E_2.jpg").is_file());
    }

    #[test]
    fn test_alias_write_failure_spares_the_primary() {
        let dir = tempfile::tempdir().unwrap();
        // A directory squats on one alias's target path
        std::fs::create_dir(dir.path().join("a_T001_E_2.jpg")).unwrap();
        let fetcher = ScriptedFetcher::new(vec![(1, Ok(()))]);
        let coordinator = AcquisitionCoordinator::new(LocalInventory::new(dir.path()), fetcher);

        let stats = coordinator.reconcile(&required(&["a_1_E_1.jpg", "a_T001_E_2.jpg", "a_01_E_3.jpg"]));

        assert_eq!(stats.missing, 3);
        assert_eq!(stats.downloaded, 2);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.downloaded + stats.failed + stats.already_available, stats.total);
        assert_eq!(stats.failures["a_T001_E_2.jpg"].reason_code(), "WRITE_ERROR");
        assert!(!stats.failures.contains_key("a_1_E_1.jpg"));
        assert!(dir.path().join("a_1_E_1.jpg").is_file());
        assert!(dir.path().join("a_01_E_3.jpg").is_file());
        assert!(!dir.path().join("a_T001_E_2.jpg.part").exists());
        assert_eq!(coordinator.fetcher().calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_failed_primary_fails_its_aliases() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = ScriptedFetcher::new(vec![(1, Err(FetchError::Timeout))]);
        let coordinator = AcquisitionCoordinator::new(LocalInventory::new(dir.path()), fetcher);

        let stats = coordinator.reconcile(&required(&["a_1_E_1.jpg", "a_T001_E_2.jpg"]));
        assert_eq!(stats.failed, 2);
        assert!(stats.failures.values().all(|f| f.reason_code() == "TIMEOUT"));
    }

    #[test]
    fn test_worker_pool_is_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let outcomes = (1..=12).map(|k| (k, Ok(()))).collect();
        let coordinator = AcquisitionCoordinator::new(
            LocalInventory::new(dir.path()),
            ScriptedFetcher::new(outcomes),
        )
        .with_workers(3);

        let names: Vec<String> = (1..=12).map(|k| format!("p_{}_E_1.jpg", k)).collect();
        let set: BTreeSet<String> = names.into_iter().collect();

        let seen = AtomicUsize::new(0);
        let stats = coordinator.reconcile_with_progress(&set, &|p| {
            assert_eq!(p.total, 12);
            seen.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(stats.downloaded, 12);
        assert_eq!(seen.load(Ordering::SeqCst), 12);
        assert!(coordinator.fetcher().peak.load(Ordering::SeqCst) <= 3);
    }

    #[test]
    fn test_stats_serialize_with_reasons() {
        let mut stats = AcquisitionStats::default();
        stats.record_failure("x_1_E_1.jpg", AcquisitionFailure::Fetch(FetchError::Timeout));
        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["failed"], 1);
        assert_eq!(json["failures"]["x_1_E_1.jpg"]["fetch"]["reason"], "TIMEOUT");
    }
}
