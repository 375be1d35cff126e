//! Outbound identity rotation.
//!
//! The pool only selects identities and keeps last-used bookkeeping; it never
//! issues requests. Selection is least-recently-used, which degrades to plain
//! round-robin when every caller acquires once per request.

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::error::HarvestError;

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// One outbound network identity, e.g. a proxy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EgressIdentity {
    /// Proxy URL, or `None` for a direct connection.
    pub address: Option<String>,
    pub credentials: Option<Credentials>,
    pub last_used: Option<Instant>,
    /// Pool generation at acquisition time. Adapters key cached sessions by
    /// `(label, generation)` so a pool rotation discards them.
    pub generation: u64,
}

impl EgressIdentity {
    pub fn direct() -> Self {
        Self {
            address: None,
            credentials: None,
            last_used: None,
            generation: 0,
        }
    }

    pub fn proxy(address: impl Into<String>) -> Self {
        Self {
            address: Some(address.into()),
            credentials: None,
            last_used: None,
            generation: 0,
        }
    }

    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.credentials = Some(Credentials {
            username: username.into(),
            password: password.into(),
        });
        self
    }

    /// Human-readable label for logs; never includes credentials.
    pub fn label(&self) -> &str {
        self.address.as_deref().unwrap_or("direct")
    }
}

#[derive(Debug)]
struct PoolInner {
    identities: Vec<EgressIdentity>,
    /// Index preferred when several identities tie on last use.
    cursor: usize,
    generation: u64,
    cooldown_until: Option<Instant>,
}

/// Thread-safe pool of egress identities with a fixed size.
#[derive(Debug, Clone)]
pub struct EgressPool {
    inner: Arc<Mutex<PoolInner>>,
}

impl EgressPool {
    pub fn new(identities: Vec<EgressIdentity>) -> Result<Self, HarvestError> {
        if identities.is_empty() {
            return Err(HarvestError::Config(
                "egress pool needs at least one identity".into(),
            ));
        }
        Ok(Self {
            inner: Arc::new(Mutex::new(PoolInner {
                identities,
                cursor: 0,
                generation: 0,
                cooldown_until: None,
            })),
        })
    }

    /// A pool holding only a direct connection.
    pub fn direct() -> Self {
        Self {
            inner: Arc::new(Mutex::new(PoolInner {
                identities: vec![EgressIdentity::direct()],
                cursor: 0,
                generation: 0,
                cooldown_until: None,
            })),
        }
    }

    fn lock_inner(&self) -> std::sync::MutexGuard<'_, PoolInner> {
        self.inner.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned egress pool mutex");
            poisoned.into_inner()
        })
    }

    pub fn len(&self) -> usize {
        self.lock_inner().identities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock_inner().identities.is_empty()
    }

    pub fn generation(&self) -> u64 {
        self.lock_inner().generation
    }

    /// Select the least-recently-used identity and stamp it as used at `now`.
    ///
    /// Never-used identities win; ties are broken by distance from the
    /// rotation cursor. Never blocks beyond the internal mutex.
    pub fn acquire(&self, now: Instant) -> EgressIdentity {
        let mut inner = self.lock_inner();
        let len = inner.identities.len();
        let cursor = inner.cursor;

        let chosen = (0..len)
            .map(|step| (cursor + step) % len)
            .min_by_key(|&idx| (inner.identities[idx].last_used, (idx + len - cursor) % len))
            .unwrap_or(0);

        let generation = inner.generation;
        let identity = &mut inner.identities[chosen];
        identity.last_used = Some(now);
        identity.generation = generation;
        let snapshot = identity.clone();
        inner.cursor = (chosen + 1) % len;
        snapshot
    }

    /// Force a full rotation: bump the generation, forget usage history and
    /// move the preferred position one step past the current cursor.
    pub fn rotate_all(&self) {
        let mut inner = self.lock_inner();
        inner.generation += 1;
        let len = inner.identities.len();
        inner.cursor = (inner.cursor + 1) % len;
        for identity in &mut inner.identities {
            identity.last_used = None;
        }
        tracing::warn!(
            generation = inner.generation,
            identities = len,
            "Rotated full egress pool"
        );
    }

    /// Hold every request through this pool until `until`. An earlier
    /// deadline never shortens a cooldown already in force.
    pub fn begin_cooldown(&self, until: Instant) {
        let mut inner = self.lock_inner();
        inner.cooldown_until = Some(match inner.cooldown_until {
            Some(current) if current > until => current,
            _ => until,
        });
    }

    pub fn cooldown_remaining(&self, now: Instant) -> Duration {
        let inner = self.lock_inner();
        inner
            .cooldown_until
            .map(|until| until.saturating_duration_since(now))
            .unwrap_or(Duration::ZERO)
    }

    /// Disjoint sub-pool for instance `index` of `count`.
    ///
    /// Identities are dealt round-robin. A pool of one direct identity is
    /// shared as-is, since direct egress has nothing to split.
    pub fn for_instance(&self, index: usize, count: usize) -> Result<EgressPool, HarvestError> {
        if count == 0 || index >= count {
            return Err(HarvestError::Config(format!(
                "instance {index} out of range for {count} instances"
            )));
        }
        let inner = self.lock_inner();
        if inner.identities.len() == 1 && inner.identities[0].address.is_none() {
            return Ok(EgressPool::direct());
        }
        if inner.identities.len() < count {
            return Err(HarvestError::Config(format!(
                "{} egress identities cannot be split across {count} instances",
                inner.identities.len()
            )));
        }
        let identities = inner
            .identities
            .iter()
            .enumerate()
            .filter(|(i, _)| i % count == index)
            .map(|(_, identity)| EgressIdentity {
                last_used: None,
                generation: 0,
                ..identity.clone()
            })
            .collect();
        EgressPool::new(identities)
    }

    pub fn labels(&self) -> Vec<String> {
        self.lock_inner()
            .identities
            .iter()
            .map(|i| i.label().to_string())
            .collect()
    }
}
