pub mod arbitration;

use crate::config::EngineOptions;
use crate::fingerprint::FrequentOutfitTable;
use crate::metric::{AssociationMetric, PairScore, ScoreComponents, SubScores};
use crate::retrieve::{CandidateRetriever, SourceIndex};
use crate::topology::TopologyIndex;
use crate::tracklet::{Tracklet, TrackletId};
use crate::Errors;
use log::debug;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;

/// The verdict on a scored pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Linked,
    Ambiguous,
    NewVisitor,
}

/// Immutable audit record of one link attempt. Content-addressable by
/// `(from_tracklet_id, to_tracklet_id)`; identical inputs reproduce it bit-for-bit.
///
/// The serialized shape is a compatibility boundary consumed by reporting - field
/// names and semantics are stable.
///
#[derive(Debug, Clone, Serialize)]
pub struct Association {
    pub from_tracklet_id: TrackletId,
    pub to_tracklet_id: TrackletId,
    pub decision: Decision,
    pub final_score: f32,
    pub subscores: SubScores,
    pub components: ScoreComponents,
    pub candidate_count: usize,
}

/// One fully scored candidate of a target.
#[derive(Debug, Clone)]
pub struct ScoredCandidate {
    pub source_idx: usize,
    pub source_id: TrackletId,
    pub score: PairScore,
}

/// Everything a worker produces for one target: all scored pairs plus the ranking the
/// coordinator decides over. Workers never decide - the decision needs the global
/// view of competing targets.
///
#[derive(Debug, Clone)]
pub struct TargetEvaluation {
    pub target_idx: usize,
    pub target_id: TrackletId,
    /// Admissible pool size before truncation.
    pub candidate_count: usize,
    /// The pool exceeded the rush-hour trigger - the threshold is raised for this
    /// target only.
    pub rush_hour: bool,
    pub scored: Vec<ScoredCandidate>,
    /// Indices into `scored` of gate-passing candidates, best final score first,
    /// ties broken by ascending source id.
    pub ranked: Vec<usize>,
}

/// The per-target claim the decision rule produces before arbitration.
#[derive(Debug, Clone, Copy)]
pub struct Claim {
    /// Index into `TargetEvaluation::scored`.
    pub scored_idx: usize,
    pub decision: Decision,
}

/// Per-target scoring front-end shared read-only across workers.
///
#[derive(Debug)]
pub struct ScoringEngine {
    retriever: CandidateRetriever,
    metric: AssociationMetric,
    options: Arc<EngineOptions>,
}

impl ScoringEngine {
    pub fn new(
        topology: Arc<TopologyIndex>,
        options: Arc<EngineOptions>,
        metric: AssociationMetric,
        frequent: Arc<FrequentOutfitTable>,
    ) -> Self {
        Self {
            retriever: CandidateRetriever::new(topology, options.clone(), frequent),
            metric,
            options,
        }
    }

    /// Retrieves and scores all candidates of one target.
    pub fn evaluate(
        &self,
        target_idx: usize,
        tracklets: &[Tracklet],
        index: &SourceIndex,
    ) -> Result<TargetEvaluation, Errors> {
        let target = &tracklets[target_idx];
        let pool = self.retriever.candidates(target, tracklets, index);

        let mut scored = Vec::with_capacity(pool.candidates.len());
        for candidate in &pool.candidates {
            let source = &tracklets[candidate.source_idx];
            let score =
                self.metric
                    .score_pair(source, target, candidate.hops, &candidate.transit)?;
            scored.push(ScoredCandidate {
                source_idx: candidate.source_idx,
                source_id: candidate.source_id,
                score,
            });
        }

        let mut ranked = (0..scored.len())
            .filter(|&i| !scored[i].score.time_gated)
            .collect::<Vec<_>>();
        ranked.sort_by(|&l, &r| {
            scored[r]
                .score
                .final_score
                .partial_cmp(&scored[l].score.final_score)
                .unwrap()
                .then_with(|| scored[l].source_id.cmp(&scored[r].source_id))
        });

        let rush_hour = pool.is_rush_hour(self.options.rush_hour_candidate_trigger);
        if rush_hour {
            debug!(
                "target={} pool of {} exceeds the rush-hour trigger, threshold raised",
                target.id, pool.admissible_count
            );
        }

        Ok(TargetEvaluation {
            target_idx,
            target_id: target.id,
            candidate_count: pool.admissible_count,
            rush_hour,
            scored,
            ranked,
        })
    }
}

/// The decision rule over a target's ranking, ignoring sources the arbitration has
/// already taken away from it. Returns `None` when nothing is left to claim.
///
pub(crate) fn decide(
    eval: &TargetEvaluation,
    options: &EngineOptions,
    excluded: &HashSet<TrackletId>,
) -> Option<Claim> {
    let mut live = eval
        .ranked
        .iter()
        .copied()
        .filter(|&i| !excluded.contains(&eval.scored[i].source_id));

    let top1 = live.next()?;
    let top2 = live.next();

    let threshold = options.effective_threshold(eval.rush_hour);
    let best = &eval.scored[top1].score;

    let passes = best.final_score >= threshold && best.subscores.outfit_sim >= options.outfit_min;
    if !passes {
        return Some(Claim {
            scored_idx: top1,
            decision: Decision::NewVisitor,
        });
    }

    let gap_ok = match top2 {
        Some(second) => {
            best.final_score - eval.scored[second].score.final_score >= options.ambiguity_gap
        }
        None => true,
    };

    Some(Claim {
        scored_idx: top1,
        decision: if gap_ok {
            Decision::Linked
        } else {
            Decision::Ambiguous
        },
    })
}

/// Materializes the audit trail: one association per scored pair, with the decided
/// pair of each target carrying the final verdict. Canonically ordered by
/// `(to_tracklet_id, from_tracklet_id)`.
///
pub fn finalize_associations(
    evaluations: &[TargetEvaluation],
    resolutions: &[Option<Claim>],
) -> Vec<Association> {
    let mut records = Vec::new();
    for (eval, resolution) in evaluations.iter().zip(resolutions) {
        for (idx, candidate) in eval.scored.iter().enumerate() {
            let decision = match resolution {
                Some(claim) if claim.scored_idx == idx => claim.decision,
                _ => Decision::NewVisitor,
            };
            records.push(Association {
                from_tracklet_id: candidate.source_id,
                to_tracklet_id: eval.target_id,
                decision,
                final_score: candidate.score.final_score,
                subscores: candidate.score.subscores,
                components: candidate.score.components.clone(),
                candidate_count: eval.candidate_count,
            });
        }
    }
    records.sort_by_key(|a| (a.to_tracklet_id, a.from_tracklet_id));
    records
}
