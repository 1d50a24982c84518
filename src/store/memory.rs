//! In-memory implementation of the telemetry store.
//!
//! Chunks are non-overlapping and totally ordered by start time within each
//! (tenant, source) partition. Readings inside a chunk are keyed by
//! (timestamp, content hash) so duplicate deliveries overwrite in place.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};

use crate::error::Result;
use crate::store::{BucketCursor, ChunkMeta, Reading, RollupBucket, TelemetryStore};

type PartitionKey = (String, String);
type BucketKey = (String, String, DateTime<Utc>);

#[derive(Debug)]
struct Chunk {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    readings: BTreeMap<(DateTime<Utc>, u64), Reading>,
    approx_bytes: u64,
}

impl Chunk {
    fn new(start: DateTime<Utc>, width_secs: u64) -> Self {
        Self {
            start,
            end: start + Duration::seconds(width_secs as i64),
            readings: BTreeMap::new(),
            approx_bytes: 0,
        }
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    chunks: RwLock<HashMap<PartitionKey, BTreeMap<DateTime<Utc>, Chunk>>>,
    buckets: RwLock<HashMap<String, BTreeMap<BucketKey, RollupBucket>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TelemetryStore for MemoryStore {
    async fn insert_reading(
        &self,
        chunk_start: DateTime<Utc>,
        chunk_width_secs: u64,
        reading: Reading,
    ) -> Result<bool> {
        let key = (reading.tenant_id.clone(), reading.source_id.clone());
        let mut chunks = self.chunks.write();
        let partition = chunks.entry(key).or_default();
        let chunk = partition
            .entry(chunk_start)
            .or_insert_with(|| Chunk::new(chunk_start, chunk_width_secs));

        let size = reading.approx_size();
        let identity = (reading.timestamp, reading.identity_hash());
        let inserted = chunk.readings.insert(identity, reading).is_none();
        if inserted {
            chunk.approx_bytes += size;
        }
        Ok(inserted)
    }

    async fn scan_readings(
        &self,
        tenant_id: &str,
        source_id: Option<&str>,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Reading>> {
        let chunks = self.chunks.read();
        let mut out = Vec::new();
        let mut keys: Vec<&PartitionKey> = chunks
            .keys()
            .filter(|(tenant, source)| {
                tenant == tenant_id && source_id.map_or(true, |s| source == s)
            })
            .collect();
        keys.sort();

        for key in keys {
            let partition = &chunks[key];
            for chunk in partition.values() {
                if chunk.end <= from || chunk.start >= to {
                    continue;
                }
                for reading in chunk.readings.values() {
                    if reading.timestamp >= from && reading.timestamp < to {
                        out.push(reading.clone());
                    }
                }
            }
        }
        Ok(out)
    }

    async fn list_chunks(
        &self,
        tenant_id: &str,
        older_than: Option<DateTime<Utc>>,
    ) -> Result<Vec<ChunkMeta>> {
        let chunks = self.chunks.read();
        let mut out = Vec::new();
        for ((tenant, source), partition) in chunks.iter() {
            if tenant != tenant_id {
                continue;
            }
            for chunk in partition.values() {
                if let Some(cutoff) = older_than {
                    if chunk.end > cutoff {
                        continue;
                    }
                }
                out.push(ChunkMeta {
                    tenant_id: tenant.clone(),
                    source_id: source.clone(),
                    start: chunk.start,
                    end: chunk.end,
                    reading_count: chunk.readings.len() as u64,
                    approx_bytes: chunk.approx_bytes,
                });
            }
        }
        out.sort_by(|a, b| (a.start, &a.source_id).cmp(&(b.start, &b.source_id)));
        Ok(out)
    }

    async fn chunk_readings(
        &self,
        tenant_id: &str,
        source_id: &str,
        chunk_start: DateTime<Utc>,
    ) -> Result<Vec<Reading>> {
        let chunks = self.chunks.read();
        let key = (tenant_id.to_string(), source_id.to_string());
        let readings = chunks
            .get(&key)
            .and_then(|partition| partition.get(&chunk_start))
            .map(|chunk| chunk.readings.values().cloned().collect())
            .unwrap_or_default();
        Ok(readings)
    }

    async fn drop_chunk(
        &self,
        tenant_id: &str,
        source_id: &str,
        chunk_start: DateTime<Utc>,
    ) -> Result<u64> {
        let mut chunks = self.chunks.write();
        let key = (tenant_id.to_string(), source_id.to_string());
        let removed = chunks
            .get_mut(&key)
            .and_then(|partition| partition.remove(&chunk_start))
            .map(|chunk| chunk.readings.len() as u64)
            .unwrap_or(0);
        Ok(removed)
    }

    async fn upsert_bucket(&self, bucket: RollupBucket) -> Result<()> {
        let mut buckets = self.buckets.write();
        let family = buckets.entry(bucket.family.clone()).or_default();
        let key = (
            bucket.tenant_id.clone(),
            bucket.source_id.clone(),
            bucket.bucket_start,
        );
        family.insert(key, bucket);
        Ok(())
    }

    async fn scan_buckets(
        &self,
        family: &str,
        tenant_id: &str,
        source_id: Option<&str>,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        limit: usize,
        cursor: Option<BucketCursor>,
    ) -> Result<Vec<RollupBucket>> {
        let buckets = self.buckets.read();
        let Some(table) = buckets.get(family) else {
            return Ok(Vec::new());
        };

        let mut out = Vec::new();
        for ((tenant, source, start), bucket) in table.iter() {
            if tenant != tenant_id {
                continue;
            }
            if let Some(wanted) = source_id {
                if source != wanted {
                    continue;
                }
            }
            if *start < from || *start >= to {
                continue;
            }
            // Iteration order is (source, start); resume on the composite
            // key so later sources are not skipped.
            if let Some(after) = &cursor {
                if (source.as_str(), *start) <= (after.source_id.as_str(), after.bucket_start) {
                    continue;
                }
            }
            out.push(bucket.clone());
            if out.len() >= limit {
                break;
            }
        }
        Ok(out)
    }

    async fn buckets_older_than(
        &self,
        family: &str,
        tenant_id: &str,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<RollupBucket>> {
        let buckets = self.buckets.read();
        let Some(table) = buckets.get(family) else {
            return Ok(Vec::new());
        };
        let out = table
            .iter()
            .filter(|((tenant, _, _), bucket)| tenant == tenant_id && bucket.bucket_end() <= cutoff)
            .map(|(_, bucket)| bucket.clone())
            .collect();
        Ok(out)
    }

    async fn drop_bucket(
        &self,
        family: &str,
        tenant_id: &str,
        source_id: &str,
        bucket_start: DateTime<Utc>,
    ) -> Result<bool> {
        let mut buckets = self.buckets.write();
        let removed = buckets
            .get_mut(family)
            .and_then(|table| {
                table.remove(&(
                    tenant_id.to_string(),
                    source_id.to_string(),
                    bucket_start,
                ))
            })
            .is_some();
        Ok(removed)
    }

    async fn storage_usage(&self, tenant_id: &str) -> Result<u64> {
        let chunks = self.chunks.read();
        let total = chunks
            .iter()
            .filter(|((tenant, _), _)| tenant == tenant_id)
            .flat_map(|(_, partition)| partition.values())
            .map(|chunk| chunk.approx_bytes)
            .sum();
        Ok(total)
    }

    async fn list_sources(&self, tenant_id: &str) -> Result<Vec<String>> {
        let chunks = self.chunks.read();
        let mut sources: Vec<String> = chunks
            .keys()
            .filter(|(tenant, _)| tenant == tenant_id)
            .map(|(_, source)| source.clone())
            .collect();
        sources.sort();
        sources.dedup();
        Ok(sources)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::bucket_start;
    use chrono::TimeZone;

    fn reading(tenant: &str, source: &str, ts: DateTime<Utc>, temp: f64) -> Reading {
        let mut fields = BTreeMap::new();
        fields.insert("temperature".to_string(), temp);
        Reading {
            tenant_id: tenant.to_string(),
            source_id: source.to_string(),
            timestamp: ts,
            fields,
            tags: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn duplicate_insert_is_a_replay() {
        let store = MemoryStore::new();
        let ts = Utc.with_ymd_and_hms(2026, 3, 1, 10, 15, 0).unwrap();
        let chunk = bucket_start(ts, 86_400);

        let r = reading("t1", "s1", ts, 20.0);
        assert!(store.insert_reading(chunk, 86_400, r.clone()).await.unwrap());
        assert!(!store.insert_reading(chunk, 86_400, r).await.unwrap());

        let scanned = store
            .scan_readings("t1", Some("s1"), chunk, chunk + Duration::days(1))
            .await
            .unwrap();
        assert_eq!(scanned.len(), 1);
    }

    #[tokio::test]
    async fn tenant_isolation_in_scans() {
        let store = MemoryStore::new();
        let ts = Utc.with_ymd_and_hms(2026, 3, 1, 10, 0, 0).unwrap();
        let chunk = bucket_start(ts, 86_400);
        store
            .insert_reading(chunk, 86_400, reading("t1", "s1", ts, 1.0))
            .await
            .unwrap();
        store
            .insert_reading(chunk, 86_400, reading("t2", "s1", ts, 2.0))
            .await
            .unwrap();

        let t1 = store
            .scan_readings("t1", None, chunk, chunk + Duration::days(1))
            .await
            .unwrap();
        assert_eq!(t1.len(), 1);
        assert_eq!(t1[0].tenant_id, "t1");
        assert_eq!(store.list_sources("t2").await.unwrap(), vec!["s1"]);
    }

    #[tokio::test]
    async fn drop_chunk_is_whole_and_idempotent() {
        let store = MemoryStore::new();
        let ts = Utc.with_ymd_and_hms(2026, 3, 1, 10, 0, 0).unwrap();
        let chunk = bucket_start(ts, 86_400);
        for minute in 0..5 {
            store
                .insert_reading(
                    chunk,
                    86_400,
                    reading("t1", "s1", ts + Duration::minutes(minute), minute as f64),
                )
                .await
                .unwrap();
        }

        assert_eq!(store.drop_chunk("t1", "s1", chunk).await.unwrap(), 5);
        assert_eq!(store.drop_chunk("t1", "s1", chunk).await.unwrap(), 0);
        assert_eq!(store.storage_usage("t1").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn bucket_scan_cursor_resumes() {
        let store = MemoryStore::new();
        let day = Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap();
        for hour in 0..6 {
            let start = day + Duration::hours(hour);
            store
                .upsert_bucket(RollupBucket {
                    tenant_id: "t1".to_string(),
                    source_id: "s1".to_string(),
                    family: "hourly".to_string(),
                    bucket_start: start,
                    bucket_width_secs: 3_600,
                    fields: BTreeMap::new(),
                    efficiency_score: None,
                    health_score: None,
                    refreshed_at: day,
                })
                .await
                .unwrap();
        }

        let first = store
            .scan_buckets("hourly", "t1", Some("s1"), day, day + Duration::days(1), 4, None)
            .await
            .unwrap();
        assert_eq!(first.len(), 4);

        let rest = store
            .scan_buckets(
                "hourly",
                "t1",
                Some("s1"),
                day,
                day + Duration::days(1),
                4,
                Some(BucketCursor::after(first.last().unwrap())),
            )
            .await
            .unwrap();
        assert_eq!(rest.len(), 2);
        assert_eq!(rest[0].bucket_start, day + Duration::hours(4));
    }

    #[tokio::test]
    async fn bucket_scan_cursor_crosses_source_boundaries() {
        let store = MemoryStore::new();
        let day = Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap();
        for source in ["s1", "s2"] {
            for hour in 0..4 {
                let start = day + Duration::hours(hour);
                store
                    .upsert_bucket(RollupBucket {
                        tenant_id: "t1".to_string(),
                        source_id: source.to_string(),
                        family: "hourly".to_string(),
                        bucket_start: start,
                        bucket_width_secs: 3_600,
                        fields: BTreeMap::new(),
                        efficiency_score: None,
                        health_score: None,
                        refreshed_at: day,
                    })
                    .await
                    .unwrap();
            }
        }

        let mut seen = Vec::new();
        let mut cursor = None;
        loop {
            let page = store
                .scan_buckets("hourly", "t1", None, day, day + Duration::days(1), 4, cursor)
                .await
                .unwrap();
            if page.is_empty() {
                break;
            }
            cursor = page.last().map(BucketCursor::after);
            seen.extend(page);
        }

        // Both sources fully paged, no bucket lost at the source boundary.
        assert_eq!(seen.len(), 8);
        assert_eq!(seen.iter().filter(|b| b.source_id == "s2").count(), 4);
    }
}
