//! Expansion of coarse regions into fine-grained query partitions.
//!
//! Upstream search silently truncates high-volume queries to a bounded window.
//! Each (region, category) pair is therefore split over a key-prefix filter
//! on a free-text field, a dimension the window does not apply to. The
//! resulting partitions may overlap, so enumeration must always be paired
//! with a [`Deduplicator`](crate::dedup::Deduplicator).
//!
//! Completeness assumes every record's key field starts with a symbol of the
//! alphabet. Records with an empty key or a leading symbol outside it are only
//! reachable through the optional catch-all partition.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::ops::Range;
use std::str::FromStr;

use crate::error::HarvestError;
use crate::models::{Partition, Region};

/// Finite set of single-symbol key prefixes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyAlphabet {
    symbols: Vec<String>,
}

impl KeyAlphabet {
    pub fn new(symbols: Vec<String>) -> Result<Self, HarvestError> {
        if symbols.is_empty() {
            return Err(HarvestError::Config("key alphabet is empty".into()));
        }
        let mut seen = HashSet::new();
        for symbol in &symbols {
            if symbol.trim().is_empty() {
                return Err(HarvestError::Config("key alphabet has a blank symbol".into()));
            }
            if !seen.insert(symbol.to_lowercase()) {
                return Err(HarvestError::Config(format!(
                    "key alphabet repeats symbol '{symbol}'"
                )));
            }
        }
        Ok(Self { symbols })
    }

    /// One symbol per character, e.g. `"0123456789"`.
    pub fn from_chars(chars: &str) -> Result<Self, HarvestError> {
        Self::new(chars.chars().map(|c| c.to_string()).collect())
    }

    pub fn symbols(&self) -> &[String] {
        &self.symbols
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }
}

impl Default for KeyAlphabet {
    /// `1`..`9`, `0`, `A`..`Z`.
    fn default() -> Self {
        let symbols = ('1'..='9')
            .chain(std::iter::once('0'))
            .chain('A'..='Z')
            .map(|c| c.to_string())
            .collect();
        Self { symbols }
    }
}

#[derive(Debug, Clone)]
pub struct PartitionEnumerator {
    alphabet: KeyAlphabet,
    catch_all: bool,
}

impl PartitionEnumerator {
    pub fn new(alphabet: KeyAlphabet) -> Self {
        Self {
            alphabet,
            catch_all: false,
        }
    }

    /// Also emit one unfiltered partition per (region, category), after its
    /// prefix partitions.
    pub fn with_catch_all(mut self, enabled: bool) -> Self {
        self.catch_all = enabled;
        self
    }

    /// Expand regions into an ordered partition list.
    ///
    /// Regions without categories are skipped. Blank ids and distinct
    /// partitions whose output filenames would collide are rejected.
    pub fn enumerate(&self, regions: &[Region]) -> Result<Vec<Partition>, HarvestError> {
        let mut partitions = Vec::new();
        let mut keys: HashMap<String, Partition> = HashMap::new();
        let mut stems: HashMap<String, String> = HashMap::new();

        for region in regions {
            if region.id.trim().is_empty() {
                return Err(HarvestError::InvalidPartition("blank region id".into()));
            }
            if region.categories.is_empty() {
                tracing::info!(region = %region.id, "No categories found, skipping region");
                continue;
            }

            for category in &region.categories {
                if category.trim().is_empty() {
                    return Err(HarvestError::InvalidPartition(format!(
                        "blank category in region '{}'",
                        region.id
                    )));
                }

                let prefixes = self
                    .alphabet
                    .symbols()
                    .iter()
                    .map(|symbol| Some(symbol.clone()))
                    .chain(self.catch_all.then_some(None));

                for prefix in prefixes {
                    let partition = Partition::new(region.id.clone(), category.clone(), prefix);
                    let key = partition.key();
                    match keys.get(&key) {
                        Some(existing) if *existing == partition => {
                            tracing::debug!(partition = %key, "Duplicate partition dropped");
                            continue;
                        }
                        Some(existing) => {
                            return Err(HarvestError::InvalidPartition(format!(
                                "partitions {existing:?} and {partition:?} share the key '{key}'"
                            )));
                        }
                        None => {
                            keys.insert(key.clone(), partition.clone());
                        }
                    }
                    let stem = partition.file_stem();
                    if stem.is_empty() {
                        return Err(HarvestError::InvalidPartition(format!(
                            "partition '{key}' has no alphanumeric characters"
                        )));
                    }
                    if let Some(existing) = stems.insert(stem.clone(), key.clone()) {
                        return Err(HarvestError::InvalidPartition(format!(
                            "partitions '{existing}' and '{key}' both map to file '{stem}'"
                        )));
                    }
                    partitions.push(partition);
                }
            }
        }

        Ok(partitions)
    }
}

/// Keep only the regions named in `wanted`, in discovery order.
///
/// An empty `wanted` keeps everything; a name that discovery did not return
/// is a malformed work specification.
pub fn select_regions(
    discovered: Vec<Region>,
    wanted: &[String],
) -> Result<Vec<Region>, HarvestError> {
    if wanted.is_empty() {
        return Ok(discovered);
    }
    for name in wanted {
        if !discovered.iter().any(|r| r.id.eq_ignore_ascii_case(name)) {
            return Err(HarvestError::InvalidPartition(format!(
                "region '{name}' not offered by the portal"
            )));
        }
    }
    Ok(discovered
        .into_iter()
        .filter(|r| wanted.iter().any(|w| r.id.eq_ignore_ascii_case(w)))
        .collect())
}

/// This process's share of the global partition list: contiguous, disjoint
/// from every other index of the same `count`, and together exhaustive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstanceSlice {
    /// 0-based.
    pub index: usize,
    pub count: usize,
}

impl InstanceSlice {
    pub fn new(index: usize, count: usize) -> Result<Self, HarvestError> {
        if count == 0 || index >= count {
            return Err(HarvestError::Config(format!(
                "instance {index}/{count} is out of range"
            )));
        }
        Ok(Self { index, count })
    }

    pub fn single() -> Self {
        Self { index: 0, count: 1 }
    }

    pub fn range(&self, total: usize) -> Range<usize> {
        let start = total * self.index / self.count;
        let end = total * (self.index + 1) / self.count;
        start..end
    }

    pub fn select<'a>(&self, partitions: &'a [Partition]) -> &'a [Partition] {
        &partitions[self.range(partitions.len())]
    }

    /// Label used in checkpoint filenames and logs.
    pub fn label(&self) -> String {
        format!("{}-of-{}", self.index, self.count)
    }
}

impl Default for InstanceSlice {
    fn default() -> Self {
        Self::single()
    }
}

impl fmt::Display for InstanceSlice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.index, self.count)
    }
}

impl FromStr for InstanceSlice {
    type Err = HarvestError;

    /// Parses `"index/count"`, e.g. `"2/4"`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (index, count) = s
            .split_once('/')
            .ok_or_else(|| HarvestError::Config(format!("expected INDEX/COUNT, got '{s}'")))?;
        let parse = |part: &str| {
            part.trim()
                .parse::<usize>()
                .map_err(|_| HarvestError::Config(format!("invalid instance spec '{s}'")))
        };
        Self::new(parse(index)?, parse(count)?)
    }
}
