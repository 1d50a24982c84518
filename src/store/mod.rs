//! Storage abstraction for the telemetry store.
//!
//! The physical layout is implementation-defined; the trait only requires
//! what the engines need: time-range scans, atomic whole-chunk drops, and
//! atomic upsert-by-bucket-key. Every call takes an explicit tenant id —
//! there is no implicit session scoping anywhere in the storage surface.

mod archive;
mod memory;

pub use archive::{FsArchiveSink, MemoryArchiveSink};
pub use memory::MemoryStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::Result;

/// A single accepted sensor reading. Immutable once stored; only retention
/// removes it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub tenant_id: String,
    pub source_id: String,
    pub timestamp: DateTime<Utc>,
    /// Named numeric fields, validated against the configured schema.
    pub fields: BTreeMap<String, f64>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

impl Reading {
    /// Content identity of a reading. Two deliveries of the same
    /// (source, timestamp, fields) hash identically, so replays overwrite
    /// rather than duplicate.
    pub fn identity_hash(&self) -> u64 {
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.source_id.as_bytes());
        hasher.update(&self.timestamp.timestamp_micros().to_le_bytes());
        for (name, value) in &self.fields {
            hasher.update(name.as_bytes());
            hasher.update(&value.to_le_bytes());
        }
        let digest = hasher.finalize();
        u64::from_le_bytes(digest.as_bytes()[0..8].try_into().unwrap())
    }

    /// Rough in-memory footprint, used for storage quota accounting.
    pub fn approx_size(&self) -> u64 {
        let fields: usize = self.fields.keys().map(|k| k.len() + 8).sum();
        let tags: usize = self.tags.iter().map(|(k, v)| k.len() + v.len()).sum();
        (48 + self.source_id.len() + fields + tags) as u64
    }
}

/// Metadata for one chunk of the raw store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkMeta {
    pub tenant_id: String,
    pub source_id: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub reading_count: u64,
    pub approx_bytes: u64,
}

/// Streaming aggregate of one numeric field. Mean and stddev derive from
/// (count, sum, sum_sq) so merging two aggregates is exact, which is what
/// makes multi-level rollups and re-aggregation reproducible.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct FieldAggregate {
    pub count: u64,
    pub sum: f64,
    pub sum_sq: f64,
    pub min: f64,
    pub max: f64,
}

impl FieldAggregate {
    pub fn observe(&mut self, value: f64) {
        if self.count == 0 {
            self.min = value;
            self.max = value;
        } else {
            self.min = self.min.min(value);
            self.max = self.max.max(value);
        }
        self.count += 1;
        self.sum += value;
        self.sum_sq += value * value;
    }

    pub fn merge(&mut self, other: &FieldAggregate) {
        if other.count == 0 {
            return;
        }
        if self.count == 0 {
            *self = *other;
            return;
        }
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
        self.count += other.count;
        self.sum += other.sum;
        self.sum_sq += other.sum_sq;
    }

    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }

    /// Population standard deviation.
    pub fn stddev(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        let mean = self.mean();
        let variance = (self.sum_sq / self.count as f64) - mean * mean;
        variance.max(0.0).sqrt()
    }
}

/// One pre-aggregated bucket of a rollup family.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollupBucket {
    pub tenant_id: String,
    pub source_id: String,
    pub family: String,
    pub bucket_start: DateTime<Utc>,
    pub bucket_width_secs: u64,
    pub fields: BTreeMap<String, FieldAggregate>,
    /// avg(numerator) / avg(denominator) for the family's configured pair.
    pub efficiency_score: Option<f64>,
    /// Variance penalty score in [0, 100].
    pub health_score: Option<f64>,
    pub refreshed_at: DateTime<Utc>,
}

impl RollupBucket {
    pub fn bucket_end(&self) -> DateTime<Utc> {
        self.bucket_start + chrono::Duration::seconds(self.bucket_width_secs as i64)
    }
}

/// Resumption point for a paged bucket scan. Buckets are ordered by
/// (source, bucket start) within a tenant, so the cursor carries both parts
/// of the key; a bare bucket start would skip later sources on resume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketCursor {
    pub source_id: String,
    pub bucket_start: DateTime<Utc>,
}

impl BucketCursor {
    pub fn after(bucket: &RollupBucket) -> Self {
        Self {
            source_id: bucket.source_id.clone(),
            bucket_start: bucket.bucket_start,
        }
    }
}

impl std::fmt::Display for BucketCursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}@{}",
            self.bucket_start.timestamp_micros(),
            self.source_id
        )
    }
}

impl std::str::FromStr for BucketCursor {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let (micros, source_id) = s
            .split_once('@')
            .ok_or_else(|| format!("malformed cursor '{s}'"))?;
        let micros: i64 = micros
            .parse()
            .map_err(|_| format!("malformed cursor '{s}'"))?;
        let bucket_start = DateTime::<Utc>::from_timestamp_micros(micros)
            .ok_or_else(|| format!("cursor timestamp out of range in '{s}'"))?;
        Ok(Self {
            source_id: source_id.to_string(),
            bucket_start,
        })
    }
}

/// Truncate a timestamp down to its containing bucket/chunk boundary.
pub fn bucket_start(ts: DateTime<Utc>, width_secs: u64) -> DateTime<Utc> {
    let width = width_secs.max(1) as i64;
    let secs = ts.timestamp().div_euclid(width) * width;
    DateTime::<Utc>::from_timestamp(secs, 0).unwrap_or(ts)
}

/// Repository trait for the chunked, time-ordered telemetry store.
#[async_trait]
pub trait TelemetryStore: Send + Sync {
    /// Insert a reading into the chunk starting at `chunk_start`. Returns
    /// `false` when an identical reading was already present (replay).
    async fn insert_reading(
        &self,
        chunk_start: DateTime<Utc>,
        chunk_width_secs: u64,
        reading: Reading,
    ) -> Result<bool>;

    /// Readings with `from <= timestamp < to`, across sources unless one is
    /// given, ordered by (source, timestamp).
    async fn scan_readings(
        &self,
        tenant_id: &str,
        source_id: Option<&str>,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Reading>>;

    /// Chunks for a tenant, optionally only those whose end is at or before
    /// `older_than` (whole-chunk eligibility, never partial).
    async fn list_chunks(
        &self,
        tenant_id: &str,
        older_than: Option<DateTime<Utc>>,
    ) -> Result<Vec<ChunkMeta>>;

    /// All readings of one chunk, for archival export.
    async fn chunk_readings(
        &self,
        tenant_id: &str,
        source_id: &str,
        chunk_start: DateTime<Utc>,
    ) -> Result<Vec<Reading>>;

    /// Atomically drop one whole chunk. Returns the number of readings
    /// removed (0 when the chunk is already gone, which keeps retention
    /// retries idempotent).
    async fn drop_chunk(
        &self,
        tenant_id: &str,
        source_id: &str,
        chunk_start: DateTime<Utc>,
    ) -> Result<u64>;

    /// Replace-or-insert one whole bucket, keyed by
    /// (family, tenant, source, bucket_start).
    async fn upsert_bucket(&self, bucket: RollupBucket) -> Result<()>;

    /// Buckets with `from <= bucket_start < to`, ordered by
    /// (source, bucket_start). `cursor` resumes strictly after the given
    /// (source, bucket start) position.
    async fn scan_buckets(
        &self,
        family: &str,
        tenant_id: &str,
        source_id: Option<&str>,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        limit: usize,
        cursor: Option<BucketCursor>,
    ) -> Result<Vec<RollupBucket>>;

    /// Buckets whose whole span ends at or before `cutoff`.
    async fn buckets_older_than(
        &self,
        family: &str,
        tenant_id: &str,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<RollupBucket>>;

    /// Atomically drop one bucket. Returns false when already gone.
    async fn drop_bucket(
        &self,
        family: &str,
        tenant_id: &str,
        source_id: &str,
        bucket_start: DateTime<Utc>,
    ) -> Result<bool>;

    /// Approximate live bytes held for a tenant (raw readings).
    async fn storage_usage(&self, tenant_id: &str) -> Result<u64>;

    /// Distinct source ids with live data for a tenant.
    async fn list_sources(&self, tenant_id: &str) -> Result<Vec<String>>;
}

/// Sink for archived data. Export must be idempotent per entry id: writing
/// the same entry twice overwrites rather than duplicates.
#[async_trait]
pub trait ArchiveSink: Send + Sync {
    /// Export readings under the given entry id; returns the location.
    async fn export_readings(&self, entry_id: &str, readings: &[Reading]) -> Result<String>;

    /// Export rollup buckets under the given entry id; returns the location.
    async fn export_buckets(&self, entry_id: &str, buckets: &[RollupBucket]) -> Result<String>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn reading(ts: DateTime<Utc>, temp: f64) -> Reading {
        let mut fields = BTreeMap::new();
        fields.insert("temperature".to_string(), temp);
        Reading {
            tenant_id: "t1".to_string(),
            source_id: "s1".to_string(),
            timestamp: ts,
            fields,
            tags: BTreeMap::new(),
        }
    }

    #[test]
    fn identity_hash_ignores_tags_but_not_fields() {
        let ts = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        let a = reading(ts, 20.0);
        let mut b = reading(ts, 20.0);
        b.tags.insert("site".to_string(), "plant-7".to_string());
        assert_eq!(a.identity_hash(), b.identity_hash());

        let c = reading(ts, 20.5);
        assert_ne!(a.identity_hash(), c.identity_hash());
    }

    #[test]
    fn field_aggregate_merge_matches_direct_observation() {
        let values = [3.0, 7.0, 1.0, 9.0, 4.0, 6.0];
        let mut direct = FieldAggregate::default();
        for v in values {
            direct.observe(v);
        }

        let mut left = FieldAggregate::default();
        let mut right = FieldAggregate::default();
        for v in &values[..3] {
            left.observe(*v);
        }
        for v in &values[3..] {
            right.observe(*v);
        }
        left.merge(&right);

        assert_eq!(left, direct);
        assert!((direct.mean() - 5.0).abs() < 1e-9);
        assert!(direct.stddev() > 0.0);
    }

    #[test]
    fn bucket_start_truncates_to_width() {
        let ts = Utc.with_ymd_and_hms(2026, 3, 1, 13, 42, 17).unwrap();
        let hour = bucket_start(ts, 3_600);
        assert_eq!(hour, Utc.with_ymd_and_hms(2026, 3, 1, 13, 0, 0).unwrap());
        let day = bucket_start(ts, 86_400);
        assert_eq!(day, Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap());
    }
}
