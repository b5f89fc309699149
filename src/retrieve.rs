use crate::config::EngineOptions;
use crate::distance::cosine;
use crate::fingerprint::{hour_bucket, FrequentOutfitTable};
use crate::topology::{HopDistance, TopologyIndex, TransitParams};
use crate::tracklet::{PinId, Tracklet, TrackletId};
use itertools::Itertools;
use std::collections::HashMap;
use std::sync::Arc;

/// Pre-score multiplier for sources wearing an outfit the frequent-outfit table marks
/// as common in the current hour. Uniform wearers become less attractive candidates
/// without being excluded.
pub const FREQUENT_OUTFIT_DAMPING: f32 = 0.8;

/// Weights of the cheap pre-score `0.7·cosine + 0.3·exp(-|Δt-μ|/τ)`.
const PRE_SCORE_COSINE_WEIGHT: f32 = 0.7;
const PRE_SCORE_TIME_WEIGHT: f32 = 0.3;

/// Batch-wide index of tracklets by `(pin_id, t_out)` supporting time-range scans.
///
/// Built once before the worker pool starts; read-only afterwards. Entries are kept
/// sorted by `(t_out, id)` so scans are deterministic regardless of input order.
///
#[derive(Debug, Default)]
pub struct SourceIndex {
    by_pin: HashMap<PinId, Vec<(i64, usize)>>,
}

impl SourceIndex {
    pub fn build(tracklets: &[Tracklet]) -> Self {
        let mut by_pin: HashMap<PinId, Vec<(i64, usize)>> = HashMap::new();
        for (idx, t) in tracklets.iter().enumerate() {
            by_pin.entry(t.pin_id).or_default().push((t.t_out, idx));
        }
        for entries in by_pin.values_mut() {
            entries.sort_unstable();
        }
        Self { by_pin }
    }

    /// Indices of tracklets on `pin` whose `t_out` lays within `[from; to]`.
    pub fn scan(&self, pin: PinId, from: i64, to: i64) -> &[(i64, usize)] {
        let Some(entries) = self.by_pin.get(&pin) else {
            return &[];
        };
        let lo = entries.partition_point(|(t_out, _)| *t_out < from);
        let hi = entries.partition_point(|(t_out, _)| *t_out <= to);
        &entries[lo..hi]
    }
}

/// One admissible source for a target, with everything the scoring stage needs to
/// avoid recomputing the cheap signals.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub source_idx: usize,
    pub source_id: TrackletId,
    pub delta_t_sec: i64,
    pub hops: HopDistance,
    pub transit: TransitParams,
    pub embed_cosine: f32,
    pub pre_score: f32,
}

/// The per-target candidate pool after gating, ordering, and truncation.
#[derive(Debug, Clone, Default)]
pub struct CandidatePool {
    /// At most K candidates, best pre-score first.
    pub candidates: Vec<Candidate>,
    /// Admissible sources before truncation - drives the rush-hour threshold bump.
    pub admissible_count: usize,
}

impl CandidatePool {
    pub fn is_rush_hour(&self, trigger: usize) -> bool {
        self.admissible_count > trigger
    }
}

/// Cheap pre-filtering ahead of the scoring engine.
///
/// A source is admissible for a target when it sits on a different camera within two
/// hops, precedes the target by at least one second and at most the candidate window,
/// passes the μ+3τ upper gate for its pin pair, and clears the embedding cosine floor.
///
#[derive(Debug)]
pub struct CandidateRetriever {
    topology: Arc<TopologyIndex>,
    options: Arc<EngineOptions>,
    frequent: Arc<FrequentOutfitTable>,
}

impl CandidateRetriever {
    pub fn new(
        topology: Arc<TopologyIndex>,
        options: Arc<EngineOptions>,
        frequent: Arc<FrequentOutfitTable>,
    ) -> Self {
        Self {
            topology,
            options,
            frequent,
        }
    }

    pub fn candidates(
        &self,
        target: &Tracklet,
        tracklets: &[Tracklet],
        index: &SourceIndex,
    ) -> CandidatePool {
        let mut admissible = Vec::new();

        let earliest = target.t_in - self.options.max_candidate_window_sec;
        let latest = target.t_in - 1;

        for &pin in self.topology.search_ring(target.pin_id) {
            if pin == target.pin_id {
                continue;
            }
            let hops = self.topology.hop_distance(pin, target.pin_id);
            let Some(transit) = self.topology.transit_params(pin, target.pin_id) else {
                continue;
            };

            for &(t_out, source_idx) in index.scan(pin, earliest, latest) {
                let source = &tracklets[source_idx];
                let delta_t = target.t_in - t_out;
                if delta_t as f32 > transit.upper_gate_sec() {
                    continue;
                }
                let embed_cosine = cosine(&source.embedding, &target.embedding);
                if embed_cosine < self.options.embed_floor {
                    continue;
                }

                let time_part =
                    (-(delta_t as f32 - transit.mu_sec).abs() / transit.tau_sec).exp();
                let mut pre_score = PRE_SCORE_COSINE_WEIGHT * embed_cosine
                    + PRE_SCORE_TIME_WEIGHT * time_part;

                if self.frequent.is_frequent(
                    source.outfit_fingerprint,
                    hour_bucket(source.t_out),
                    self.options.frequent_outfit_threshold,
                ) {
                    pre_score *= FREQUENT_OUTFIT_DAMPING;
                }

                admissible.push(Candidate {
                    source_idx,
                    source_id: source.id,
                    delta_t_sec: delta_t,
                    hops,
                    transit: *transit,
                    embed_cosine,
                    pre_score,
                });
            }
        }

        let admissible_count = admissible.len();
        let candidates = admissible
            .into_iter()
            .sorted_by(|l, r| {
                r.pre_score
                    .partial_cmp(&l.pre_score)
                    .unwrap()
                    .then_with(|| {
                        let lt = tracklets[l.source_idx].t_out;
                        let rt = tracklets[r.source_idx].t_out;
                        lt.cmp(&rt)
                    })
                    .then_with(|| l.source_id.cmp(&r.source_id))
            })
            .take(self.options.candidate_topk)
            .collect::<Vec<_>>();

        CandidatePool {
            candidates,
            admissible_count,
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::config::EngineOptions;
    use crate::fingerprint::{hour_bucket, FrequentOutfitTable, OutfitFingerprint};
    use crate::retrieve::{CandidateRetriever, SourceIndex};
    use crate::test_stuff::{corridor_mall, outfit_gen, tracklet_gen};
    use crate::topology::TopologyIndex;
    use crate::tracklet::Tracklet;
    use std::collections::HashMap;
    use std::sync::Arc;

    fn retriever_with(
        tracklets: &[Tracklet],
        frequent: FrequentOutfitTable,
    ) -> (CandidateRetriever, SourceIndex) {
        let topology = Arc::new(
            TopologyIndex::build(corridor_mall(4, 36.0), &EngineOptions::default()).unwrap(),
        );
        let retriever = CandidateRetriever::new(
            topology,
            Arc::new(EngineOptions::default()),
            Arc::new(frequent),
        );
        let index = SourceIndex::build(tracklets);
        (retriever, index)
    }

    #[test]
    fn admissibility_gates() {
        let tracklets = vec![
            // Same pin as the target - never admissible.
            tracklet_gen(1, 2, 0, 70).build(),
            // One hop away, plausible timing.
            tracklet_gen(2, 1, 0, 70).build(),
            // Two hops away, still plausible under the widened gate.
            tracklet_gen(3, 4, 0, 70).build(),
            // Leaves after the target arrives.
            tracklet_gen(4, 1, 0, 101).build(),
            // Outside the μ+3τ upper gate for the 1-hop pair.
            tracklet_gen(5, 1, -300, -100).build(),
        ];
        let target = tracklet_gen(100, 2, 100, 130).build();
        let (retriever, index) = retriever_with(&tracklets, FrequentOutfitTable::new());

        let pool = retriever.candidates(&target, &tracklets, &index);
        let ids = pool
            .candidates
            .iter()
            .map(|c| c.source_id)
            .collect::<Vec<_>>();
        assert!(ids.contains(&2));
        assert!(ids.contains(&3));
        assert!(!ids.contains(&1));
        assert!(!ids.contains(&4));
        assert!(!ids.contains(&5));
    }

    #[test]
    fn hop_limit_excludes_distant_pins() {
        // Pin 4 is three hops from pin 1.
        let tracklets = vec![tracklet_gen(1, 4, 0, 70).build()];
        let target = tracklet_gen(100, 1, 100, 130).build();
        let (retriever, index) = retriever_with(&tracklets, FrequentOutfitTable::new());
        let pool = retriever.candidates(&target, &tracklets, &index);
        assert!(pool.candidates.is_empty());
        assert_eq!(pool.admissible_count, 0);
    }

    #[test]
    fn embedding_floor_excludes_dissimilar_sources() {
        let tracklets = vec![
            tracklet_gen(1, 1, 0, 70).build(),
            tracklet_gen(2, 1, 0, 70)
                .outfit(outfit_gen().navy_hoodie())
                .embedding_seed(999)
                .build(),
        ];
        let target = tracklet_gen(100, 2, 100, 130).build();
        let (retriever, index) = retriever_with(&tracklets, FrequentOutfitTable::new());
        let pool = retriever.candidates(&target, &tracklets, &index);
        let ids = pool
            .candidates
            .iter()
            .map(|c| c.source_id)
            .collect::<Vec<_>>();
        assert_eq!(ids, vec![1]);
    }

    #[test]
    fn ordering_prefers_better_timing_then_earlier_exit() {
        let tracklets = vec![
            // μ(1→2) is 30 s; this source exits 70 s before the target arrives.
            tracklet_gen(1, 1, 0, 30).build(),
            // This one exits exactly μ before - better time part, same cosine.
            tracklet_gen(2, 1, 0, 70).build(),
        ];
        let target = tracklet_gen(100, 2, 100, 130).build();
        let (retriever, index) = retriever_with(&tracklets, FrequentOutfitTable::new());
        let pool = retriever.candidates(&target, &tracklets, &index);
        let ids = pool
            .candidates
            .iter()
            .map(|c| c.source_id)
            .collect::<Vec<_>>();
        assert_eq!(ids, vec![2, 1]);
    }

    #[test]
    fn frequent_outfits_are_damped() {
        let uniform = outfit_gen().black_white_uniform();
        let fp = OutfitFingerprint::of(&uniform);

        let tracklets = vec![
            tracklet_gen(1, 1, 0, 70)
                .outfit(uniform.clone())
                .embedding_seed(5)
                .build(),
            tracklet_gen(2, 1, 0, 68)
                .outfit(outfit_gen().red_jacket())
                .embedding_seed(5)
                .build(),
        ];
        let target = tracklet_gen(100, 2, 100, 130)
            .embedding_seed(5)
            .build();

        // Without the table the uniform source wins on timing.
        let (retriever, index) = retriever_with(&tracklets, FrequentOutfitTable::new());
        let pool = retriever.candidates(&target, &tracklets, &index);
        assert_eq!(pool.candidates[0].source_id, 1);

        // Marked frequent, it drops behind the distinctive outfit.
        let mut table = FrequentOutfitTable::new();
        table.load_hour(hour_bucket(70), HashMap::from([(fp, 6)]));
        let (retriever, index) = retriever_with(&tracklets, table);
        let pool = retriever.candidates(&target, &tracklets, &index);
        assert_eq!(pool.candidates[0].source_id, 2);
        assert_eq!(pool.admissible_count, 2);
    }

    #[test]
    fn pool_is_truncated_to_topk() {
        let mut tracklets = Vec::new();
        for i in 0..60 {
            tracklets.push(tracklet_gen(i + 1, 1, 0, 40 + i as i64 % 20).build());
        }
        let target = tracklet_gen(100, 2, 100, 130).build();
        let (retriever, index) = retriever_with(&tracklets, FrequentOutfitTable::new());
        let pool = retriever.candidates(&target, &tracklets, &index);
        assert_eq!(pool.candidates.len(), 50);
        assert_eq!(pool.admissible_count, 60);
        assert!(pool.is_rush_hour(12));
    }
}
