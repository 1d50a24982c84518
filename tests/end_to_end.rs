//! End-to-end pipeline test: out-of-order ingestion over a 25-hour window,
//! hourly and daily rollups, replay safety, and lag-window finalization.

use chrono::{DateTime, Duration, TimeZone, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;

use telemetry_store::clock::{Clock, ManualClock};
use telemetry_store::config::StoreConfig;
use telemetry_store::ingest::ReadingInput;
use telemetry_store::notify::RecordingNotifier;
use telemetry_store::store::{bucket_start, MemoryArchiveSink, MemoryStore, Reading};
use telemetry_store::tenant::PlanTier;
use telemetry_store::AppState;

const READINGS_PER_HOUR: usize = 40;
const HOURS: usize = 25;

struct Harness {
    clock: Arc<ManualClock>,
    state: AppState,
    tenant_id: String,
    window_start: DateTime<Utc>,
}

async fn harness() -> Harness {
    let window_start = Utc.with_ymd_and_hms(2026, 5, 1, 0, 0, 0).unwrap();
    let clock = Arc::new(ManualClock::new(window_start));
    let state = AppState::with_parts(
        StoreConfig::default(),
        clock.clone() as Arc<dyn Clock>,
        Arc::new(MemoryStore::new()),
        Arc::new(MemoryArchiveSink::new()),
        Arc::new(RecordingNotifier::new()),
    )
    .unwrap();
    let tenant = state
        .registry
        .create_tenant("acme-plant", PlanTier::Standard)
        .await
        .unwrap();
    Harness {
        clock,
        state,
        tenant_id: tenant.id,
        window_start,
    }
}

fn reading_value(hour: usize, index: usize) -> f64 {
    ((hour * READINGS_PER_HOUR + index) % 50) as f64 + 10.0
}

fn hour_batch(window_start: DateTime<Utc>, hour: usize) -> Vec<ReadingInput> {
    // Stride order delivers each hour's readings out of timestamp order;
    // 23 is coprime with the batch size so every index is hit once.
    (0..READINGS_PER_HOUR)
        .map(|i| (i * 23) % READINGS_PER_HOUR)
        .map(|i| ReadingInput {
            source_id: "s1".to_string(),
            timestamp: window_start + Duration::hours(hour as i64) + Duration::seconds(90 * i as i64),
            fields: BTreeMap::from([
                ("power_in".to_string(), 100.0),
                ("power_out".to_string(), reading_value(hour, i)),
            ]),
            tags: BTreeMap::new(),
        })
        .collect()
}

/// Aggregate raw readings directly, bypassing the engine.
fn manual_aggregate(readings: &[Reading], field: &str) -> (u64, f64, f64, f64) {
    let values: Vec<f64> = readings
        .iter()
        .filter_map(|r| r.fields.get(field).copied())
        .collect();
    let count = values.len() as u64;
    let sum: f64 = values.iter().sum();
    let min = values.iter().copied().fold(f64::INFINITY, f64::min);
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    (count, sum, min, max)
}

async fn run_window(h: &Harness) {
    for hour in 0..HOURS {
        // Each hour's data arrives after that hour has fully elapsed.
        h.clock.set(h.window_start + Duration::hours(hour as i64 + 1));
        let report = h
            .state
            .ingest
            .ingest_batch(&h.tenant_id, hour_batch(h.window_start, hour))
            .await
            .unwrap();
        assert_eq!(report.accepted, READINGS_PER_HOUR);
        assert_eq!(report.rejected, 0);

        h.state.rollup.run_family_cycle("hourly").await.unwrap();
        h.state.rollup.run_family_cycle("daily").await.unwrap();
    }
}

#[tokio::test]
async fn hourly_rollups_match_manual_aggregation() {
    let h = harness().await;
    run_window(&h).await;

    let now = h.clock.now();
    assert_eq!(now, h.window_start + Duration::hours(HOURS as i64));

    let buckets = h
        .state
        .store
        .scan_buckets(
            "hourly",
            &h.tenant_id,
            Some("s1"),
            h.window_start,
            now,
            1_000,
            None,
        )
        .await
        .unwrap();
    assert_eq!(buckets.len(), HOURS);

    for bucket in &buckets {
        let raw = h
            .state
            .store
            .scan_readings(
                &h.tenant_id,
                Some("s1"),
                bucket.bucket_start,
                bucket.bucket_end(),
            )
            .await
            .unwrap();
        let (count, sum, min, max) = manual_aggregate(&raw, "power_out");
        let agg = &bucket.fields["power_out"];
        assert_eq!(agg.count, count);
        assert!((agg.sum - sum).abs() < 1e-9);
        assert_eq!(agg.min, min);
        assert_eq!(agg.max, max);

        // Efficiency derives from the same aggregates, power_out/power_in.
        let expected = agg.mean() / 100.0;
        assert!((bucket.efficiency_score.unwrap() - expected).abs() < 1e-9);
    }
}

#[tokio::test]
async fn daily_rollup_finalizes_completed_day() {
    let h = harness().await;
    run_window(&h).await;

    let now = h.clock.now();
    let daily = h
        .state
        .store
        .scan_buckets("daily", &h.tenant_id, Some("s1"), h.window_start, now, 10, None)
        .await
        .unwrap();
    assert_eq!(daily.len(), 2);

    // The completed day holds the first 24 hours; hour 25 opens day two.
    let day_one = &daily[0];
    assert_eq!(day_one.bucket_start, h.window_start);
    assert_eq!(
        day_one.fields["power_out"].count,
        (24 * READINGS_PER_HOUR) as u64
    );
    assert_eq!(daily[1].fields["power_out"].count, READINGS_PER_HOUR as u64);
}

#[tokio::test]
async fn duplicate_replay_never_double_counts() {
    let h = harness().await;
    run_window(&h).await;

    let now = h.clock.now();
    let before = h
        .state
        .store
        .scan_buckets("hourly", &h.tenant_id, Some("s1"), h.window_start, now, 1_000, None)
        .await
        .unwrap();

    // Replay the two most recent hours, which are still inside the lag
    // window and will be re-aggregated.
    for hour in HOURS - 2..HOURS {
        let report = h
            .state
            .ingest
            .ingest_batch(&h.tenant_id, hour_batch(h.window_start, hour))
            .await
            .unwrap();
        assert_eq!(report.duplicates, READINGS_PER_HOUR);
    }
    h.state.rollup.run_family_cycle("hourly").await.unwrap();

    let after = h
        .state
        .store
        .scan_buckets("hourly", &h.tenant_id, Some("s1"), h.window_start, now, 1_000, None)
        .await
        .unwrap();
    assert_eq!(before.len(), after.len());
    for (a, b) in before.iter().zip(after.iter()) {
        assert_eq!(a.fields, b.fields);
        assert_eq!(a.efficiency_score, b.efficiency_score);
    }
}

#[tokio::test]
async fn late_reading_outside_lag_window_stays_unaggregated() {
    let h = harness().await;
    run_window(&h).await;

    // 10 hours back: accepted into the correct historical chunk, but the
    // hourly lag window (2h) no longer covers it.
    let late_ts = h.clock.now() - Duration::hours(10);
    let report = h
        .state
        .ingest
        .ingest_batch(
            &h.tenant_id,
            vec![ReadingInput {
                source_id: "s1".to_string(),
                timestamp: late_ts,
                fields: BTreeMap::from([("power_out".to_string(), 9_999.0)]),
                tags: BTreeMap::new(),
            }],
        )
        .await
        .unwrap();
    assert_eq!(report.accepted, 1);

    h.state.rollup.run_family_cycle("hourly").await.unwrap();

    let bucket_ts = bucket_start(late_ts, 3_600);
    let buckets = h
        .state
        .store
        .scan_buckets(
            "hourly",
            &h.tenant_id,
            Some("s1"),
            bucket_ts,
            bucket_ts + Duration::hours(1),
            10,
            None,
        )
        .await
        .unwrap();
    // The frozen bucket still shows the original 40 readings.
    assert_eq!(buckets[0].fields["power_out"].count, READINGS_PER_HOUR as u64);
    assert!(buckets[0].fields["power_out"].max < 9_999.0);
}
