/// The single canonical CIEDE2000 implementation.
pub mod color;

use crate::distance::cosine;
use crate::metric::color::ciede2000;
use crate::topology::{HopDistance, TransitParams};
use crate::tracklet::{GarmentSlot, GarmentType, Physique, Tracklet, GARMENT_SLOTS};
use crate::Errors;
use once_cell::sync::Lazy;
use serde::Serialize;
use std::sync::Arc;

/// Garment types an operator would struggle to tell apart on CCTV footage. A pair
/// inside one class scores [MetricOptions::close_type_score] instead of a full match.
static CLOSE_TYPE_CLASSES: Lazy<Vec<Vec<GarmentType>>> = Lazy::new(|| {
    use GarmentType::*;
    vec![
        vec![Tshirt, Shirt],
        vec![Jacket, Coat],
        vec![Hoodie, Sweater],
        vec![Pants, Jeans],
        vec![Sneakers, Loafers],
    ]
});

fn visually_close(a: GarmentType, b: GarmentType) -> bool {
    CLOSE_TYPE_CLASSES
        .iter()
        .any(|class| class.contains(&a) && class.contains(&b))
}

/// Scoring coefficients. The operational defaults implement the fusion
/// `0.55·outfit + 0.20·time + 0.15·adjacency + 0.10·physique` with outfit internals
/// `0.35·type + 0.35·color + 0.30·embedding`; tuning belongs here, not in code.
///
#[derive(Debug, Clone)]
pub struct MetricOptions {
    pub outfit_weight: f32,
    pub time_weight: f32,
    pub adjacency_weight: f32,
    pub physique_weight: f32,
    pub type_weight: f32,
    pub color_weight: f32,
    pub embedding_weight: f32,
    /// ΔE scale in `exp(-ΔE/scale)` for garment color similarity.
    pub color_de_scale: f32,
    pub close_type_score: f32,
    pub two_hop_score: f32,
    pub adjacent_height_score: f32,
    pub height_weight: f32,
    pub aspect_weight: f32,
    /// Aspect-ratio difference treated as a full mismatch.
    pub aspect_tolerance: f32,
    /// Minimal physically possible transit in seconds.
    pub min_transit_sec: i64,
}

impl Default for MetricOptions {
    fn default() -> Self {
        Self {
            outfit_weight: 0.55,
            time_weight: 0.20,
            adjacency_weight: 0.15,
            physique_weight: 0.10,
            type_weight: 0.35,
            color_weight: 0.35,
            embedding_weight: 0.30,
            color_de_scale: 12.0,
            close_type_score: 0.6,
            two_hop_score: 0.5,
            adjacent_height_score: 0.5,
            height_weight: 0.7,
            aspect_weight: 0.3,
            aspect_tolerance: 0.3,
            min_transit_sec: 1,
        }
    }
}

/// The four fused sub-scores of a scored pair. All values lay within [0; 1].
#[derive(Debug, Clone, Copy, Serialize)]
pub struct SubScores {
    pub outfit_sim: f32,
    pub time_score: f32,
    pub adj_score: f32,
    pub physique_score: f32,
}

/// Per-slot CIEDE2000 distances; a slot invisible on either side stays `None`.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct GarmentDeltas {
    pub top: Option<f32>,
    pub bottom: Option<f32>,
    pub shoes: Option<f32>,
}

impl GarmentDeltas {
    fn set(&mut self, slot: GarmentSlot, value: f32) {
        match slot {
            GarmentSlot::Top => self.top = Some(value),
            GarmentSlot::Bottom => self.bottom = Some(value),
            GarmentSlot::Shoes => self.shoes = Some(value),
        }
    }
}

/// Raw ingredients behind the sub-scores, preserved on every association record for
/// the audit trail.
#[derive(Debug, Clone, Serialize)]
pub struct ScoreComponents {
    pub type_score: f32,
    #[serde(rename = "color_deltaE_per_garment")]
    pub color_delta_e_per_garment: GarmentDeltas,
    pub embed_cosine: f32,
    pub delta_t_sec: i64,
    pub expected_mu_sec: f32,
    pub tau_sec: f32,
}

/// Outcome of scoring one (source, target) pair.
#[derive(Debug, Clone)]
pub struct PairScore {
    pub subscores: SubScores,
    pub components: ScoreComponents,
    pub final_score: f32,
    /// The pair failed the hard time gate - the final score is forced to zero and the
    /// pair can never link.
    pub time_gated: bool,
}

/// Multi-signal association metric shared read-only across scoring workers.
#[derive(Debug, Clone, Default)]
pub struct AssociationMetric {
    pub opts: Arc<MetricOptions>,
}

impl AssociationMetric {
    pub fn new(opts: Arc<MetricOptions>) -> Self {
        Self { opts }
    }

    /// Scores a source→target pair given the transit parameters of their pin pair.
    ///
    /// Sub-scores are always computed in full - a time-gated pair still carries its
    /// components on the audit record, only the fused score is zeroed.
    ///
    pub fn score_pair(
        &self,
        source: &Tracklet,
        target: &Tracklet,
        hops: HopDistance,
        transit: &TransitParams,
    ) -> Result<PairScore, Errors> {
        let delta_t = target.t_in - source.t_out;

        let (outfit_sim, type_score, deltas, embed_cosine) =
            self.outfit_similarity(source, target);
        let time_score = self.time_score(delta_t, transit);
        let adj_score = self.adjacency_score(hops);
        let physique_score = self.physique_score(&source.physique, &target.physique);

        let time_gated = !self.time_gate(delta_t, transit);

        // Fixed coefficient order; the fused sum must stay reproducible.
        let mut final_score = self.opts.outfit_weight * outfit_sim;
        final_score += self.opts.time_weight * time_score;
        final_score += self.opts.adjacency_weight * adj_score;
        final_score += self.opts.physique_weight * physique_score;
        if time_gated {
            final_score = 0.0;
        }

        if !final_score.is_finite() {
            return Err(Errors::NonFiniteScore(source.id, target.id));
        }

        Ok(PairScore {
            subscores: SubScores {
                outfit_sim,
                time_score,
                adj_score,
                physique_score,
            },
            components: ScoreComponents {
                type_score,
                color_delta_e_per_garment: deltas,
                embed_cosine,
                delta_t_sec: delta_t,
                expected_mu_sec: transit.mu_sec,
                tau_sec: transit.tau_sec,
            },
            final_score,
            time_gated,
        })
    }

    /// The hard plausibility gate: the transit must be physically possible and no
    /// slower than μ + 3τ.
    pub fn time_gate(&self, delta_t: i64, transit: &TransitParams) -> bool {
        delta_t >= self.opts.min_transit_sec && delta_t as f32 <= transit.upper_gate_sec()
    }

    /// `exp(-|Δt - μ|/τ)`, clamped to [0; 1].
    pub fn time_score(&self, delta_t: i64, transit: &TransitParams) -> f32 {
        let deviation = (delta_t as f32 - transit.mu_sec).abs().max(0.0);
        (-deviation / transit.tau_sec).exp().clamp(0.0, 1.0)
    }

    pub fn adjacency_score(&self, hops: HopDistance) -> f32 {
        match hops {
            HopDistance::One => 1.0,
            HopDistance::Two => self.opts.two_hop_score,
            HopDistance::Unreachable => 0.0,
        }
    }

    pub fn physique_score(&self, source: &Physique, target: &Physique) -> f32 {
        let height = if source.height_category == target.height_category {
            1.0
        } else if source.height_category.is_adjacent(&target.height_category) {
            self.opts.adjacent_height_score
        } else {
            0.0
        };
        let aspect = 1.0
            - ((source.aspect_ratio - target.aspect_ratio).abs() / self.opts.aspect_tolerance)
                .min(1.0);
        self.opts.height_weight * height + self.opts.aspect_weight * aspect
    }

    /// Type, color, and embedding signals fused into outfit similarity.
    ///
    /// Garment visibility weights derive from tracklet quality: a slot visible on both
    /// sides weighs `q_source · q_target`, a slot missing on either side weighs zero.
    /// When nothing is visible the type and color signals contribute zero instead of
    /// being recovered from thin air.
    ///
    pub fn outfit_similarity(
        &self,
        source: &Tracklet,
        target: &Tracklet,
    ) -> (f32, f32, GarmentDeltas, f32) {
        let mut weight_sum = 0.0_f32;
        let mut type_acc = 0.0_f32;
        let mut color_acc = 0.0_f32;
        let mut deltas = GarmentDeltas::default();

        for slot in GARMENT_SLOTS {
            let (s, t) = match (source.outfit.slot(slot), target.outfit.slot(slot)) {
                (Some(s), Some(t)) => (s, t),
                _ => continue,
            };
            let visibility = source.quality * target.quality;
            if visibility <= 0.0 {
                continue;
            }
            let de = ciede2000(&s.color_lab, &t.color_lab);
            deltas.set(slot, de);

            weight_sum += visibility;
            type_acc += visibility * self.type_pair_score(s.kind, t.kind);
            color_acc += visibility * (-de / self.opts.color_de_scale).exp();
        }

        let (type_score, color_score) = if weight_sum > 0.0 {
            (type_acc / weight_sum, color_acc / weight_sum)
        } else {
            (0.0, 0.0)
        };

        let embed_cosine = cosine(&source.embedding, &target.embedding).clamp(0.0, 1.0);

        let mut outfit_sim = self.opts.type_weight * type_score;
        outfit_sim += self.opts.color_weight * color_score;
        outfit_sim += self.opts.embedding_weight * embed_cosine;

        (outfit_sim, type_score, deltas, embed_cosine)
    }

    fn type_pair_score(&self, s: GarmentType, t: GarmentType) -> f32 {
        if s == GarmentType::Other || t == GarmentType::Other {
            // Unknown vocabulary never pretends to match.
            0.0
        } else if s == t {
            1.0
        } else if visually_close(s, t) {
            self.opts.close_type_score
        } else {
            0.0
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::metric::{AssociationMetric, MetricOptions};
    use crate::test_stuff::{outfit_gen, tracklet_gen};
    use crate::topology::{HopDistance, TransitParams};
    use crate::tracklet::{GarmentType, HeightCategory, Physique};
    use crate::EPS;
    use std::sync::Arc;

    fn metric() -> AssociationMetric {
        AssociationMetric::new(Arc::new(MetricOptions::default()))
    }

    #[test]
    fn identical_pair_scores_one_everywhere() {
        let m = metric();
        let s = tracklet_gen(1, 1, 0, 10).outfit(outfit_gen().red_jacket()).build();
        let mut t = tracklet_gen(2, 2, 40, 55).outfit(outfit_gen().red_jacket()).build();
        t.embedding = s.embedding.clone();

        let transit = TransitParams::new(30.0, 30.0);
        let score = m.score_pair(&s, &t, HopDistance::One, &transit).unwrap();

        assert!((score.subscores.outfit_sim - 1.0).abs() < EPS);
        assert!((score.subscores.adj_score - 1.0).abs() < EPS);
        assert!(!score.time_gated);
        assert!(score.final_score > 0.9);
    }

    #[test]
    fn fusion_matches_coefficient_definition() {
        let m = metric();
        let s = tracklet_gen(1, 1, 0, 10).outfit(outfit_gen().red_jacket()).build();
        let t = tracklet_gen(2, 2, 40, 55).outfit(outfit_gen().black_white_uniform()).build();

        let transit = TransitParams::new(30.0, 30.0);
        let score = m.score_pair(&s, &t, HopDistance::Two, &transit).unwrap();

        let expected = 0.55 * score.subscores.outfit_sim
            + 0.20 * score.subscores.time_score
            + 0.15 * score.subscores.adj_score
            + 0.10 * score.subscores.physique_score;
        assert!((score.final_score - expected).abs() < EPS);
        assert!((0.0..=1.0).contains(&score.final_score));
    }

    #[test]
    fn time_gate_zeroes_the_final_score() {
        let m = metric();
        let s = tracklet_gen(1, 1, 0, 10).outfit(outfit_gen().red_jacket()).build();
        let t = tracklet_gen(2, 2, 10, 25).outfit(outfit_gen().red_jacket()).build();

        // Δt = 0 - same instant on two cameras cannot be one walking person.
        let transit = TransitParams::new(30.0, 30.0);
        let score = m.score_pair(&s, &t, HopDistance::One, &transit).unwrap();
        assert!(score.time_gated);
        assert!(score.final_score.abs() < EPS);
        // The audit components survive the gate.
        assert!(score.subscores.outfit_sim > 0.0);
    }

    #[test]
    fn time_gate_upper_bound_is_mu_plus_three_tau() {
        let m = metric();
        let transit = TransitParams::new(60.0, 10.0);
        assert!(m.time_gate(90, &transit));
        assert!(!m.time_gate(91, &transit));
        assert!(m.time_gate(1, &transit));
        assert!(!m.time_gate(0, &transit));
    }

    #[test]
    fn time_score_decays_with_deviation() {
        let m = metric();
        let transit = TransitParams::new(120.0, 40.0);
        assert!((m.time_score(120, &transit) - 1.0).abs() < EPS);
        let far = m.time_score(2, &transit);
        assert!((far - (-118.0_f32 / 40.0).exp()).abs() < EPS);
        assert!(far < 0.06);
    }

    #[test]
    fn close_garment_types_score_reduced() {
        let m = metric();
        assert!((m.type_pair_score(GarmentType::Jacket, GarmentType::Coat) - 0.6).abs() < EPS);
        assert!((m.type_pair_score(GarmentType::Pants, GarmentType::Jeans) - 0.6).abs() < EPS);
        assert!((m.type_pair_score(GarmentType::Jacket, GarmentType::Jacket) - 1.0).abs() < EPS);
        assert!(m.type_pair_score(GarmentType::Jacket, GarmentType::Jeans).abs() < EPS);
        assert!(m.type_pair_score(GarmentType::Other, GarmentType::Other).abs() < EPS);
    }

    #[test]
    fn missing_garments_reduce_visibility_not_veto() {
        let m = metric();
        let s = tracklet_gen(1, 1, 0, 10).outfit(outfit_gen().red_jacket()).build();
        let mut bare = outfit_gen().red_jacket();
        bare.bottom = None;
        bare.shoes = None;
        let t = tracklet_gen(2, 2, 40, 55).outfit(bare).build();

        let (_, type_score, deltas, _) = m.outfit_similarity(&s, &t);
        assert!((type_score - 1.0).abs() < EPS);
        assert!(deltas.top.is_some());
        assert!(deltas.bottom.is_none());
        assert!(deltas.shoes.is_none());
    }

    #[test]
    fn physique_scoring() {
        let m = metric();
        let same = Physique::new(HeightCategory::Medium, 0.4);
        assert!((m.physique_score(&same, &same) - 1.0).abs() < EPS);

        let adjacent = Physique::new(HeightCategory::Tall, 0.4);
        assert!((m.physique_score(&same, &adjacent) - (0.7 * 0.5 + 0.3)).abs() < EPS);

        let opposite = Physique::new(HeightCategory::Short, 0.7);
        assert!(m.physique_score(&adjacent, &opposite).abs() < EPS);
    }
}
