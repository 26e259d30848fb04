//! File-backed time-series cache.
//!
//! Payloads fetched from external sources are stored per `(bucket, range)`
//! so that a collector re-run over an already fetched window skips the
//! network. Layout: `<dir>/<bucket-dir>/<start_ms>_<end_ms>.json`.

use date_range::{Range, RangeSet};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::future::Future;
use std::path::{Path, PathBuf};
use tracing::{debug, trace};

use crate::database::time::{datetime_to_ms, ms_to_range};
use crate::utils::fs::{io_error, write_atomic};
use crate::Result;

const MAX_BUCKET_PREFIX_LEN: usize = 64;

/// A cached payload and the range it was fetched for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry<T> {
    pub bucket: String,
    pub range: Range,
    pub payload: T,
}

#[derive(Debug, Clone)]
pub struct TimeSeriesCache {
    dir: PathBuf,
}

/// Directory name for a bucket: a readable prefix plus a hash of the full
/// name, so distinct buckets never share a directory.
fn bucket_dir_name(bucket: &str) -> String {
    let prefix: String = bucket
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .take(MAX_BUCKET_PREFIX_LEN)
        .collect();
    let digest = Sha256::digest(bucket.as_bytes());
    format!("{}-{}", prefix, &hex::encode(digest)[..16])
}

fn entry_file_name(range: &Range) -> String {
    format!(
        "{}_{}.json",
        datetime_to_ms(range.start()),
        datetime_to_ms(range.end())
    )
}

fn parse_entry_file_name(name: &str) -> Option<Range> {
    let stem = name.strip_suffix(".json")?;
    let (start, end) = stem.split_once('_')?;
    ms_to_range(start.parse().ok()?, end.parse().ok()?).ok()
}

impl TimeSeriesCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn bucket_dir(&self, bucket: &str) -> PathBuf {
        self.dir.join(bucket_dir_name(bucket))
    }

    fn entry_path(&self, bucket: &str, range: &Range) -> PathBuf {
        self.bucket_dir(bucket).join(entry_file_name(range))
    }

    /// Ranges stored for `bucket`, sorted by start.
    pub async fn entries(&self, bucket: &str) -> Result<Vec<Range>> {
        let dir = self.bucket_dir(bucket);
        let mut read_dir = match tokio::fs::read_dir(&dir).await {
            Ok(read_dir) => read_dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_error("listing cache bucket", &dir, e)),
        };

        let mut ranges = Vec::new();
        while let Some(entry) = read_dir
            .next_entry()
            .await
            .map_err(|e| io_error("listing cache bucket", &dir, e))?
        {
            if let Some(range) = entry.file_name().to_str().and_then(parse_entry_file_name) {
                ranges.push(range);
            }
        }
        ranges.sort();
        Ok(ranges)
    }

    /// The union of all stored ranges for `bucket`.
    pub async fn covered(&self, bucket: &str) -> Result<RangeSet> {
        Ok(self.entries(bucket).await?.into_iter().collect())
    }

    pub async fn read<T: DeserializeOwned>(
        &self,
        bucket: &str,
        range: &Range,
    ) -> Result<Option<CacheEntry<T>>> {
        let path = self.entry_path(bucket, range);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_error("reading cache entry", &path, e)),
        }
    }

    pub async fn write<T: Serialize>(&self, bucket: &str, range: &Range, payload: &T) -> Result<()> {
        let path = self.entry_path(bucket, range);
        let entry = CacheEntry {
            bucket: bucket.to_string(),
            range: *range,
            payload,
        };
        let bytes = serde_json::to_vec(&entry)?;
        write_atomic("writing cache entry", &path, &bytes).await?;
        trace!(bucket, %range, "Wrote cache entry");
        Ok(())
    }

    /// Return every cached entry of `bucket` that overlaps `range`, calling
    /// `retrieve` once per uncovered gap first and caching what it returns.
    ///
    /// Entries are ordered by range start. An entry may extend beyond `range`
    /// when it was cached for a wider window.
    pub async fn load_cached_or_retrieve<T, F, Fut>(
        &self,
        bucket: &str,
        range: &Range,
        mut retrieve: F,
    ) -> Result<Vec<CacheEntry<T>>>
    where
        T: Serialize + DeserializeOwned,
        F: FnMut(Range) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let covered = self.covered(bucket).await?;
        let gaps = covered.gaps(range);

        if gaps.is_empty() {
            debug!(bucket, %range, "Cache hit");
        }
        for gap in &gaps {
            debug!(bucket, range = %gap, "Cache miss, retrieving");
            let payload = retrieve(*gap).await?;
            self.write(bucket, gap, &payload).await?;
        }

        let mut loaded = Vec::new();
        for stored in self.entries(bucket).await? {
            if !stored.overlaps(range) {
                continue;
            }
            if let Some(entry) = self.read(bucket, &stored).await? {
                loaded.push(entry);
            }
        }
        Ok(loaded)
    }
}
