use crate::config::EngineOptions;
use crate::cooldown::CooldownRegistry;
use crate::engine::{decide, Claim, Decision, TargetEvaluation};
use crate::tracklet::{Tracklet, TrackletId};
use itertools::Itertools;
use log::debug;
use std::collections::{HashMap, HashSet};

/// An accepted source→target link with the timing components the journey builder
/// needs for its consistency term.
#[derive(Debug, Clone)]
pub struct AcceptedLink {
    pub source_idx: usize,
    pub target_idx: usize,
    pub source_id: TrackletId,
    pub target_id: TrackletId,
    pub link_score: f32,
    pub delta_t_sec: i64,
    pub expected_mu_sec: f32,
    pub tau_sec: f32,
}

/// Result of the serial coordination stage.
#[derive(Debug)]
pub struct ArbitrationOutcome {
    /// Final per-target claims, parallel to the evaluation slice.
    pub resolutions: Vec<Option<Claim>>,
    /// Links that survived arbitration and cooldown, ordered by target arrival time.
    pub accepted: Vec<AcceptedLink>,
    pub rounds: usize,
    pub cooldown_rejections: usize,
}

/// Per-source arbitration of competing targets, iterated to a fixed point, followed
/// by the cooldown pass.
///
/// Each round snapshots which targets picked which source as their current top1 -
/// linked claims and ambiguous picks alike, since an ambiguity resolves once the
/// contested source is taken away. A source is contested when several targets picked
/// it and at least one holds a linked claim; the linked claimant with the highest
/// final score keeps it (ties fall to the lower target id) and every other picker
/// goes back to the decision rule with the source excluded. Termination is
/// guaranteed - a round either removes at least one contested edge or finds none.
///
/// Evaluations must arrive sorted by target id; the caller establishes that order.
///
pub fn resolve(
    evaluations: &[TargetEvaluation],
    tracklets: &[Tracklet],
    options: &EngineOptions,
) -> ArbitrationOutcome {
    let mut excluded: Vec<HashSet<TrackletId>> = vec![HashSet::new(); evaluations.len()];
    let mut resolutions: Vec<Option<Claim>> = evaluations
        .iter()
        .enumerate()
        .map(|(pos, eval)| decide(eval, options, &excluded[pos]))
        .collect();

    let mut rounds = 0;
    loop {
        rounds += 1;

        let pickers: HashMap<TrackletId, Vec<usize>> = resolutions
            .iter()
            .enumerate()
            .filter_map(|(pos, resolution)| {
                resolution
                    .filter(|claim| claim.decision != Decision::NewVisitor)
                    .map(|claim| {
                        (evaluations[pos].scored[claim.scored_idx].source_id, pos)
                    })
            })
            .into_group_map();

        let mut contested = false;
        for (source_id, claimants) in pickers
            .into_iter()
            .sorted_by_key(|(source_id, _)| *source_id)
        {
            if claimants.len() < 2 {
                continue;
            }
            let winner = claimants
                .iter()
                .copied()
                .filter(|&pos| {
                    resolutions[pos].as_ref().unwrap().decision == Decision::Linked
                })
                .max_by(|&l, &r| {
                    let ls = claim_score(evaluations, &resolutions, l);
                    let rs = claim_score(evaluations, &resolutions, r);
                    ls.partial_cmp(&rs)
                        .unwrap()
                        .then_with(|| evaluations[r].target_id.cmp(&evaluations[l].target_id))
                });
            // All pickers ambiguous: the contest cannot be decided, every
            // ambiguity stands.
            let Some(winner) = winner else {
                continue;
            };
            contested = true;

            debug!(
                "source={} picked by {} targets, kept by target={}",
                source_id,
                claimants.len(),
                evaluations[winner].target_id
            );

            for &loser in claimants.iter().filter(|&&pos| pos != winner) {
                excluded[loser].insert(source_id);
                resolutions[loser] = decide(&evaluations[loser], options, &excluded[loser]);
            }
        }

        if !contested {
            break;
        }
    }

    apply_cooldown(evaluations, tracklets, options, resolutions, rounds)
}

fn claim_score(
    evaluations: &[TargetEvaluation],
    resolutions: &[Option<Claim>],
    pos: usize,
) -> f32 {
    let claim = resolutions[pos].as_ref().unwrap();
    evaluations[pos].scored[claim.scored_idx].score.final_score
}

/// Walks the accepted links in target arrival order, tracking chain heads as visitor
/// roots, and demotes links that land a visitor on the same pin twice within the
/// cooldown window.
fn apply_cooldown(
    evaluations: &[TargetEvaluation],
    tracklets: &[Tracklet],
    options: &EngineOptions,
    mut resolutions: Vec<Option<Claim>>,
    rounds: usize,
) -> ArbitrationOutcome {
    let mut linked_positions = resolutions
        .iter()
        .enumerate()
        .filter(|(_, r)| matches!(r, Some(c) if c.decision == Decision::Linked))
        .map(|(pos, _)| pos)
        .collect::<Vec<_>>();
    linked_positions.sort_by_key(|&pos| {
        let target = &tracklets[evaluations[pos].target_idx];
        (target.t_in, target.id)
    });

    let mut roots: HashMap<TrackletId, TrackletId> = HashMap::new();
    let mut registry = CooldownRegistry::new(options.cooldown_sec);
    let mut accepted = Vec::with_capacity(linked_positions.len());
    let mut cooldown_rejections = 0;

    for pos in linked_positions {
        let eval = &evaluations[pos];
        let claim = resolutions[pos].unwrap();
        let chosen = &eval.scored[claim.scored_idx];
        let target = &tracklets[eval.target_idx];

        let root = roots.get(&chosen.source_id).copied().unwrap_or(chosen.source_id);
        if !registry.allows(root, target.pin_id, target.t_in) {
            debug!(
                "link {}→{} suppressed by cooldown for visitor root {}",
                chosen.source_id, target.id, root
            );
            resolutions[pos] = Some(Claim {
                scored_idx: claim.scored_idx,
                decision: Decision::NewVisitor,
            });
            cooldown_rejections += 1;
            continue;
        }

        roots.insert(eval.target_id, root);
        registry.record(root, target.pin_id, target.t_in);
        accepted.push(AcceptedLink {
            source_idx: chosen.source_idx,
            target_idx: eval.target_idx,
            source_id: chosen.source_id,
            target_id: eval.target_id,
            link_score: chosen.score.final_score,
            delta_t_sec: chosen.score.components.delta_t_sec,
            expected_mu_sec: chosen.score.components.expected_mu_sec,
            tau_sec: chosen.score.components.tau_sec,
        });
    }

    ArbitrationOutcome {
        resolutions,
        accepted,
        rounds,
        cooldown_rejections,
    }
}
