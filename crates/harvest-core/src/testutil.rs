//! Test utilities: a virtual clock and a synthetic upstream portal.
//!
//! Both use `Arc<Mutex<_>>` for interior mutability so clones handed to the
//! code under test stay observable from the test.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::clock::Clock;
use crate::egress::EgressIdentity;
use crate::error::HarvestError;
use crate::models::{Page, PageRequest, Partition, RawRecord, Region, Session};
use crate::traits::PortalAdapter;

// ---------------------------------------------------------------------------
// ManualClock
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct ClockState {
    elapsed: Duration,
    sleeps: Vec<Duration>,
}

/// Virtual time. `sleep` records the requested duration and advances the
/// clock by it instead of waiting.
#[derive(Debug, Clone)]
pub struct ManualClock {
    origin: Instant,
    state: Arc<Mutex<ClockState>>,
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            state: Arc::new(Mutex::new(ClockState::default())),
        }
    }

    /// Every non-zero sleep requested so far, in order.
    pub fn sleeps(&self) -> Vec<Duration> {
        self.state.lock().unwrap().sleeps.clone()
    }

    /// Total virtual time slept.
    pub fn slept(&self) -> Duration {
        self.state.lock().unwrap().sleeps.iter().sum()
    }

    /// Move time forward without recording a sleep, as if work took `by`.
    pub fn advance(&self, by: Duration) {
        self.state.lock().unwrap().elapsed += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.origin + self.state.lock().unwrap().elapsed
    }

    async fn sleep(&self, duration: Duration) {
        if !duration.is_zero() {
            let mut state = self.state.lock().unwrap();
            state.sleeps.push(duration);
            state.elapsed += duration;
        }
        tokio::task::yield_now().await;
    }
}

// ---------------------------------------------------------------------------
// MockPortal
// ---------------------------------------------------------------------------

/// One request as seen by [`MockPortal`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockRequest {
    pub partition: Partition,
    pub offset: u64,
    pub page_size: u64,
    pub identity: String,
}

#[derive(Debug, Clone)]
struct MockEntry {
    region: String,
    category: String,
    /// Free-text values the prefix filter is matched against.
    keys: Vec<String>,
    record: RawRecord,
}

impl MockEntry {
    fn matches(&self, partition: &Partition) -> bool {
        if self.region != partition.region || self.category != partition.category {
            return false;
        }
        match &partition.prefix {
            None => true,
            Some(prefix) => {
                let prefix = prefix.to_lowercase();
                self.keys
                    .iter()
                    .any(|k| k.to_lowercase().starts_with(&prefix))
            }
        }
    }
}

#[derive(Debug, Default)]
struct PortalState {
    regions: Vec<Region>,
    entries: Vec<MockEntry>,
    window: Option<u64>,
    hide_total: bool,
    auth_error: Option<String>,
    failures: HashMap<(String, u64), VecDeque<HarvestError>>,
    always_fail: HashMap<String, u16>,
    cancel_after: Option<(usize, CancellationToken)>,
    auth_calls: u32,
    requests: Vec<MockRequest>,
}

/// Synthetic upstream: records over a free-text key space, served in
/// insertion order, filtered by key prefix, optionally truncated by a
/// result window that a real portal would apply silently.
#[derive(Debug, Clone, Default)]
pub struct MockPortal {
    state: Arc<Mutex<PortalState>>,
}

impl MockPortal {
    pub fn new() -> Self {
        Self::default()
    }

    fn ensure_region(state: &mut PortalState, region: &str, category: &str) {
        match state.regions.iter_mut().find(|r| r.id == region) {
            Some(r) => {
                if !r.categories.iter().any(|c| c == category) {
                    r.categories.push(category.to_string());
                }
            }
            None => state
                .regions
                .push(Region::new(region, vec![category.to_string()])),
        }
    }

    /// Declare a region, possibly without categories.
    pub fn with_region(self, id: &str, categories: &[&str]) -> Self {
        {
            let mut state = self.state.lock().unwrap();
            state.regions.push(Region::new(
                id,
                categories.iter().map(|c| c.to_string()).collect(),
            ));
        }
        self
    }

    /// Add a record reachable through `key`. Adding an existing id again
    /// makes it reachable through the extra key as well, producing overlap
    /// between prefix partitions.
    pub fn with_record(self, region: &str, category: &str, key: &str, id: &str) -> Self {
        {
            let mut state = self.state.lock().unwrap();
            Self::ensure_region(&mut state, region, category);
            let existing = state
                .entries
                .iter_mut()
                .find(|e| e.region == region && e.category == category && e.record.id == id);
            match existing {
                Some(entry) => entry.keys.push(key.to_string()),
                None => {
                    let mut fields = serde_json::Map::new();
                    fields.insert("address".into(), serde_json::Value::String(key.into()));
                    state.entries.push(MockEntry {
                        region: region.to_string(),
                        category: category.to_string(),
                        keys: vec![key.to_string()],
                        record: RawRecord {
                            id: id.to_string(),
                            fields,
                        },
                    });
                }
            }
        }
        self
    }

    /// Results past `window` are silently dropped, for every query.
    pub fn with_window(self, window: u64) -> Self {
        self.state.lock().unwrap().window = Some(window);
        self
    }

    /// Do not report a total; walkers must stop on an empty or short page.
    pub fn without_total(self) -> Self {
        self.state.lock().unwrap().hide_total = true;
        self
    }

    pub fn with_auth_failure(self, message: &str) -> Self {
        self.state.lock().unwrap().auth_error = Some(message.to_string());
        self
    }

    /// Cancel `token` once `requests` search calls have been served.
    pub fn cancel_after(self, requests: usize, token: CancellationToken) -> Self {
        self.state.lock().unwrap().cancel_after = Some((requests, token));
        self
    }

    /// Fail the next requests for `(partition, offset)` with `errors`, in order.
    pub fn fail_at(&self, partition: &Partition, offset: u64, errors: Vec<HarvestError>) {
        self.state
            .lock()
            .unwrap()
            .failures
            .entry((partition.key(), offset))
            .or_default()
            .extend(errors);
    }

    /// Every request for `partition` answers with `status`.
    pub fn fail_always(&self, partition: &Partition, status: u16) {
        self.state
            .lock()
            .unwrap()
            .always_fail
            .insert(partition.key(), status);
    }

    pub fn requests(&self) -> Vec<MockRequest> {
        self.state.lock().unwrap().requests.clone()
    }

    /// Offsets requested for `partition`, in request order.
    pub fn offsets_for(&self, partition: &Partition) -> Vec<u64> {
        self.state
            .lock()
            .unwrap()
            .requests
            .iter()
            .filter(|r| &r.partition == partition)
            .map(|r| r.offset)
            .collect()
    }

    pub fn auth_calls(&self) -> u32 {
        self.state.lock().unwrap().auth_calls
    }

    /// Every id the upstream holds.
    pub fn all_ids(&self) -> BTreeSet<String> {
        self.state
            .lock()
            .unwrap()
            .entries
            .iter()
            .map(|e| e.record.id.clone())
            .collect()
    }
}

impl PortalAdapter for MockPortal {
    async fn authenticate(&self, _identity: &EgressIdentity) -> Result<Session, HarvestError> {
        let mut state = self.state.lock().unwrap();
        state.auth_calls += 1;
        match &state.auth_error {
            Some(message) => Err(HarvestError::AuthFailed(message.clone())),
            None => Ok(Session {
                token: "mock-token".into(),
            }),
        }
    }

    async fn enumerate_regions(
        &self,
        _session: &Session,
        _identity: &EgressIdentity,
    ) -> Result<Vec<Region>, HarvestError> {
        Ok(self.state.lock().unwrap().regions.clone())
    }

    async fn fetch_page(
        &self,
        _session: &Session,
        identity: &EgressIdentity,
        request: &PageRequest,
    ) -> Result<Page, HarvestError> {
        let mut state = self.state.lock().unwrap();
        state.requests.push(MockRequest {
            partition: request.partition.clone(),
            offset: request.offset,
            page_size: request.page_size,
            identity: identity.label().to_string(),
        });
        if let Some((after, token)) = &state.cancel_after {
            if state.requests.len() >= *after {
                token.cancel();
            }
        }

        let key = request.partition.key();
        if let Some(status) = state.always_fail.get(&key) {
            return Err(HarvestError::from_status(*status, "scripted failure"));
        }
        if let Some(error) = state
            .failures
            .get_mut(&(key, request.offset))
            .and_then(|queue| queue.pop_front())
        {
            return Err(error);
        }

        let matching: Vec<&MockEntry> = state
            .entries
            .iter()
            .filter(|e| e.matches(&request.partition))
            .collect();
        let visible = match state.window {
            Some(window) => (matching.len() as u64).min(window),
            None => matching.len() as u64,
        };
        let start = request.offset.min(visible) as usize;
        let end = (request.offset + request.page_size).min(visible) as usize;
        let records = matching[start..end]
            .iter()
            .map(|e| e.record.clone())
            .collect();

        Ok(Page {
            records,
            total: (!state.hide_total).then_some(visible),
        })
    }
}
