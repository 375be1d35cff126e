use std::path::PathBuf;
use std::time::Duration;

use crate::error::HarvestError;
use crate::partition::{InstanceSlice, KeyAlphabet};
use crate::retry::RetryConfig;
use crate::throttle::ThrottleConfig;

/// Everything one harvesting process needs to know.
#[derive(Debug, Clone)]
pub struct HarvestConfig {
    pub output_dir: PathBuf,
    /// Explicit checkpoint location; derived from `output_dir` and the
    /// instance label when unset.
    pub checkpoint_path: Option<PathBuf>,
    /// Region ids to harvest (case-insensitive); empty means every region.
    pub regions: Vec<String>,
    pub page_size: u64,
    pub workers: usize,
    pub throttle: ThrottleConfig,
    /// Records written between two periodic checkpoint flushes.
    pub flush_every: u64,
    pub retry: RetryConfig,
    pub alphabet: KeyAlphabet,
    /// Append an unfiltered partition per (region, category).
    pub catch_all: bool,
    pub instance: InstanceSlice,
}

impl Default for HarvestConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("output"),
            checkpoint_path: None,
            regions: Vec::new(),
            page_size: 100,
            workers: 4,
            throttle: ThrottleConfig::default(),
            flush_every: 500,
            retry: RetryConfig::default(),
            alphabet: KeyAlphabet::default(),
            catch_all: false,
            instance: InstanceSlice::single(),
        }
    }
}

impl HarvestConfig {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
            ..Self::default()
        }
    }

    pub fn with_checkpoint_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.checkpoint_path = Some(path.into());
        self
    }

    pub fn with_regions(mut self, regions: Vec<String>) -> Self {
        self.regions = regions;
        self
    }

    pub fn with_page_size(mut self, page_size: u64) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_throttle(mut self, throttle: ThrottleConfig) -> Self {
        self.throttle = throttle;
        self
    }

    pub fn with_flush_every(mut self, records: u64) -> Self {
        self.flush_every = records;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.retry.request_timeout = timeout;
        self
    }

    pub fn with_alphabet(mut self, alphabet: KeyAlphabet) -> Self {
        self.alphabet = alphabet;
        self
    }

    pub fn with_catch_all(mut self, enabled: bool) -> Self {
        self.catch_all = enabled;
        self
    }

    pub fn with_instance(mut self, instance: InstanceSlice) -> Self {
        self.instance = instance;
        self
    }

    /// Checkpoint file for this instance, e.g. `output/.checkpoint-0-of-1.json`.
    pub fn resolved_checkpoint_path(&self) -> PathBuf {
        match &self.checkpoint_path {
            Some(path) => path.clone(),
            None => self
                .output_dir
                .join(format!(".checkpoint-{}.json", self.instance.label())),
        }
    }

    pub fn validate(&self) -> Result<(), HarvestError> {
        if self.page_size == 0 {
            return Err(HarvestError::Config("page size must be at least 1".into()));
        }
        if self.workers == 0 {
            return Err(HarvestError::Config("worker count must be at least 1".into()));
        }
        if self.flush_every == 0 {
            return Err(HarvestError::Config(
                "checkpoint flush interval must be at least 1 record".into(),
            ));
        }
        if self.retry.max_attempts == 0 || self.retry.server_max_attempts == 0 {
            return Err(HarvestError::Config("retry budgets must be at least 1".into()));
        }
        if self.retry.base_delay > self.retry.max_delay {
            return Err(HarvestError::Config(format!(
                "base delay {:?} exceeds the backoff cap {:?}",
                self.retry.base_delay, self.retry.max_delay
            )));
        }
        if self.retry.jitter > self.retry.base_delay {
            return Err(HarvestError::Config(format!(
                "retry jitter {:?} exceeds the base delay {:?}",
                self.retry.jitter, self.retry.base_delay
            )));
        }
        if self.retry.request_timeout.is_zero() {
            return Err(HarvestError::Config("request timeout must be non-zero".into()));
        }
        Ok(())
    }
}
