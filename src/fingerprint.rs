use crate::tracklet::{Garment, MallId, Outfit, Tracklet, GARMENT_SLOTS};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;

/// CIELAB channel bin width used by the fingerprint discretization.
const LAB_BIN_WIDTH: f32 = 8.0;

/// Stable hash of a discretised outfit.
///
/// Two tracklets wearing the same garment types in the same quantized colors produce the
/// same fingerprint on every run and platform, which is what lets the frequent-outfit
/// table recognize uniforms and generic combos across batches.
///
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct OutfitFingerprint(pub u64);

impl OutfitFingerprint {
    pub fn of(outfit: &Outfit) -> Self {
        let mut hasher = Sha256::new();
        for slot in GARMENT_SLOTS {
            match outfit.slot(slot) {
                Some(garment) => feed_garment(&mut hasher, garment),
                None => hasher.update([0xff_u8]),
            }
        }
        let digest = hasher.finalize();
        let mut word = [0_u8; 8];
        word.copy_from_slice(&digest[..8]);
        OutfitFingerprint(u64::from_be_bytes(word))
    }
}

fn feed_garment(hasher: &mut Sha256, garment: &Garment) {
    // The discriminant string keeps the hash independent of enum layout.
    hasher.update(format!("{:?}", garment.kind).as_bytes());
    for channel in [garment.color_lab.l, garment.color_lab.a, garment.color_lab.b] {
        let bin = (channel / LAB_BIN_WIDTH).floor() as i32;
        hasher.update(bin.to_be_bytes());
    }
}

/// Hour bucket of a unix timestamp.
pub fn hour_bucket(ts: i64) -> i64 {
    ts.div_euclid(3600)
}

/// Time-windowed fingerprint counts for one property, keyed by hour bucket.
///
/// The table the retriever consults is a read-only snapshot assembled before the worker
/// pool starts; counts observed during the run are accumulated separately as deltas and
/// published after the batch commits.
///
#[derive(Debug, Clone, Default)]
pub struct FrequentOutfitTable {
    counts: HashMap<(OutfitFingerprint, i64), u64>,
}

impl FrequentOutfitTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merges a per-hour snapshot loaded from the repository.
    pub fn load_hour(&mut self, hour: i64, counts: HashMap<OutfitFingerprint, u64>) {
        for (fingerprint, count) in counts {
            *self.counts.entry((fingerprint, hour)).or_insert(0) += count;
        }
    }

    pub fn count(&self, fingerprint: OutfitFingerprint, hour: i64) -> u64 {
        self.counts.get(&(fingerprint, hour)).copied().unwrap_or(0)
    }

    /// Whether the fingerprint crossed the frequency threshold within the hour.
    pub fn is_frequent(&self, fingerprint: OutfitFingerprint, hour: i64, threshold: usize) -> bool {
        self.count(fingerprint, hour) > threshold as u64
    }
}

/// One frequent-outfit counter update produced by a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FingerprintDelta {
    pub mall_id: MallId,
    pub fingerprint: OutfitFingerprint,
    pub hour_bucket: i64,
    pub count: u64,
}

/// Accumulates the fingerprint counts observed in a batch, bucketed by the hour of the
/// tracklet's first observation. Deterministic output ordering.
///
pub fn collect_deltas(mall_id: MallId, tracklets: &[Tracklet]) -> Vec<FingerprintDelta> {
    let mut acc: HashMap<(OutfitFingerprint, i64), u64> = HashMap::new();
    for t in tracklets {
        *acc.entry((t.outfit_fingerprint, hour_bucket(t.t_in)))
            .or_insert(0) += 1;
    }
    let mut deltas = acc
        .into_iter()
        .map(|((fingerprint, hour), count)| FingerprintDelta {
            mall_id,
            fingerprint,
            hour_bucket: hour,
            count,
        })
        .collect::<Vec<_>>();
    deltas.sort_by_key(|d| (d.hour_bucket, d.fingerprint));
    deltas
}

#[cfg(test)]
mod tests {
    use crate::fingerprint::{hour_bucket, FrequentOutfitTable, OutfitFingerprint};
    use crate::tracklet::{Garment, GarmentType, LabColor, Outfit};
    use std::collections::HashMap;

    fn outfit(top_l: f32) -> Outfit {
        Outfit::new(
            Some(Garment::new(
                GarmentType::Jacket,
                LabColor::new(top_l, 60.0, 40.0),
            )),
            Some(Garment::new(
                GarmentType::Jeans,
                LabColor::new(30.0, 5.0, -30.0),
            )),
            Some(Garment::new(
                GarmentType::Sneakers,
                LabColor::new(90.0, 0.0, 0.0),
            )),
        )
    }

    #[test]
    fn fingerprint_is_stable_within_a_bin() {
        // 40.0 and 44.0 land in the same 8-wide bin, 49.0 does not.
        assert_eq!(
            OutfitFingerprint::of(&outfit(40.0)),
            OutfitFingerprint::of(&outfit(44.0))
        );
        assert_ne!(
            OutfitFingerprint::of(&outfit(40.0)),
            OutfitFingerprint::of(&outfit(49.0))
        );
    }

    #[test]
    fn missing_slots_change_the_fingerprint() {
        let full = outfit(40.0);
        let mut topless = full.clone();
        topless.top = None;
        assert_ne!(OutfitFingerprint::of(&full), OutfitFingerprint::of(&topless));
    }

    #[test]
    fn hour_buckets() {
        assert_eq!(hour_bucket(0), 0);
        assert_eq!(hour_bucket(3599), 0);
        assert_eq!(hour_bucket(3600), 1);
        assert_eq!(hour_bucket(-1), -1);
    }

    #[test]
    fn frequency_threshold() {
        let fp = OutfitFingerprint::of(&outfit(40.0));
        let mut table = FrequentOutfitTable::new();
        table.load_hour(10, HashMap::from([(fp, 5)]));
        assert!(!table.is_frequent(fp, 10, 5));
        table.load_hour(10, HashMap::from([(fp, 1)]));
        assert!(table.is_frequent(fp, 10, 5));
        assert!(!table.is_frequent(fp, 11, 5));
    }
}
