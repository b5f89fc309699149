use crate::engine::Association;
use crate::fingerprint::OutfitFingerprint;
use crate::journey::Journey;
use crate::topology::CameraPin;
use crate::tracklet::{MallId, Tracklet};
use crate::Errors;
use anyhow::{anyhow, Result};
use log::warn;
use std::collections::HashMap;
use std::thread;
use std::time::Duration;

/// Bounded retry policy for output sinks.
pub const SINK_RETRY_ATTEMPTS: usize = 3;
const SINK_RETRY_BASE_DELAY: Duration = Duration::from_millis(50);

/// Input: the finite, unordered tracklet set of one property and time window.
pub trait TrackletSource {
    fn fetch(&self, mall_id: MallId, from_time: i64, to_time: i64) -> Result<Vec<Tracklet>>;
}

/// Input: the property's pin set with adjacency and transit annotations.
pub trait TopologyRepo {
    fn load(&self, mall_id: MallId) -> Result<Vec<CameraPin>>;
}

/// Input: fingerprint counts of one hour bucket, accumulated by earlier runs.
pub trait FrequentOutfitRepo {
    fn snapshot(
        &self,
        mall_id: MallId,
        hour_bucket: i64,
    ) -> Result<HashMap<OutfitFingerprint, u64>>;
}

/// Output: the association audit trail. One call per batch, atomic.
pub trait AssociationSink {
    fn write(&mut self, batch: &[Association]) -> Result<()>;
}

/// Output: materialized journeys. One call per batch, atomic.
pub trait JourneySink {
    fn write(&mut self, batch: &[Journey]) -> Result<()>;
}

/// Output: frequent-outfit counter updates feeding subsequent runs.
pub trait FrequentOutfitSink {
    fn increment(
        &mut self,
        mall_id: MallId,
        fingerprint: OutfitFingerprint,
        hour_bucket: i64,
        by_count: u64,
    ) -> Result<()>;
}

/// Runs a sink operation with bounded backoff. Transient failures are retried up to
/// [SINK_RETRY_ATTEMPTS] times; the final failure surfaces as [Errors::SinkFailed]
/// with the inputs untouched.
///
pub(crate) fn with_retries<F>(what: &str, mut op: F) -> Result<(), Errors>
where
    F: FnMut() -> Result<()>,
{
    let mut last_error = None;
    for attempt in 1..=SINK_RETRY_ATTEMPTS {
        match op() {
            Ok(()) => return Ok(()),
            Err(e) => {
                warn!("{what} write attempt {attempt}/{SINK_RETRY_ATTEMPTS} failed: {e:#}");
                last_error = Some(e);
                if attempt < SINK_RETRY_ATTEMPTS {
                    thread::sleep(SINK_RETRY_BASE_DELAY * attempt as u32);
                }
            }
        }
    }
    Err(Errors::SinkFailed(
        SINK_RETRY_ATTEMPTS,
        last_error.map(|e| format!("{e:#}")).unwrap_or_default(),
    ))
}

/// In-memory repositories backing tests and single-process deployments.
#[derive(Debug, Default)]
pub struct MemoryStore {
    pub tracklets: Vec<Tracklet>,
    pub pins: Vec<CameraPin>,
    pub frequent: HashMap<(MallId, OutfitFingerprint, i64), u64>,
}

impl TrackletSource for MemoryStore {
    fn fetch(&self, mall_id: MallId, from_time: i64, to_time: i64) -> Result<Vec<Tracklet>> {
        Ok(self
            .tracklets
            .iter()
            .filter(|t| t.mall_id == mall_id && t.t_in >= from_time && t.t_in < to_time)
            .cloned()
            .collect())
    }
}

impl TopologyRepo for MemoryStore {
    fn load(&self, mall_id: MallId) -> Result<Vec<CameraPin>> {
        Ok(self
            .pins
            .iter()
            .filter(|p| p.mall_id == mall_id)
            .cloned()
            .collect())
    }
}

impl FrequentOutfitRepo for MemoryStore {
    fn snapshot(
        &self,
        mall_id: MallId,
        hour_bucket: i64,
    ) -> Result<HashMap<OutfitFingerprint, u64>> {
        Ok(self
            .frequent
            .iter()
            .filter(|((mall, _, hour), _)| *mall == mall_id && *hour == hour_bucket)
            .map(|((_, fingerprint, _), count)| (*fingerprint, *count))
            .collect())
    }
}

/// Sink capturing canonical JSON records, with optional transient-failure injection.
#[derive(Debug, Default)]
pub struct MemorySink {
    /// One canonical JSON document per record, in publication order.
    pub records: Vec<String>,
    /// Number of upcoming `write` calls that fail before the sink recovers.
    pub failures_left: usize,
}

impl MemorySink {
    fn guard(&mut self) -> Result<()> {
        if self.failures_left > 0 {
            self.failures_left -= 1;
            return Err(anyhow!("transient sink failure injected"));
        }
        Ok(())
    }
}

impl AssociationSink for MemorySink {
    fn write(&mut self, batch: &[Association]) -> Result<()> {
        self.guard()?;
        for association in batch {
            self.records.push(serde_json::to_string(association)?);
        }
        Ok(())
    }
}

impl JourneySink for MemorySink {
    fn write(&mut self, batch: &[Journey]) -> Result<()> {
        self.guard()?;
        for journey in batch {
            self.records.push(serde_json::to_string(journey)?);
        }
        Ok(())
    }
}

/// Frequent-outfit sink accumulating increments in memory.
#[derive(Debug, Default)]
pub struct MemoryFrequentOutfitSink {
    pub counts: HashMap<(MallId, OutfitFingerprint, i64), u64>,
}

impl FrequentOutfitSink for MemoryFrequentOutfitSink {
    fn increment(
        &mut self,
        mall_id: MallId,
        fingerprint: OutfitFingerprint,
        hour_bucket: i64,
        by_count: u64,
    ) -> Result<()> {
        *self
            .counts
            .entry((mall_id, fingerprint, hour_bucket))
            .or_insert(0) += by_count;
        Ok(())
    }
}
