use crate::engine::arbitration::AcceptedLink;
use crate::topology::TopologyIndex;
use crate::tracklet::{
    GarmentSlot, GarmentType, LabColor, MallId, PinId, Tracklet, TrackletId, GARMENT_SLOTS,
};
use crate::Errors;
use log::{error, warn};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;

/// Journey confidence fusion weights: link quality, path length, timing consistency.
const CONFIDENCE_LINK_WEIGHT: f64 = 0.6;
const CONFIDENCE_LENGTH_WEIGHT: f64 = 0.2;
const CONFIDENCE_TIMING_WEIGHT: f64 = 0.2;

/// One camera visit along a journey. `link_score` is `None` on the head step.
#[derive(Debug, Clone, Serialize)]
pub struct JourneyStep {
    pub pin_id: PinId,
    pub pin_name: String,
    pub t_in: i64,
    pub t_out: i64,
    pub duration_seconds: i64,
    pub link_score: Option<f32>,
}

/// Per-slot garment consensus across a journey's tracklets.
#[derive(Debug, Clone, Serialize)]
pub struct GarmentSummary {
    pub kind: GarmentType,
    pub color_lab: LabColor,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct OutfitSummary {
    pub top: Option<GarmentSummary>,
    pub bottom: Option<GarmentSummary>,
    pub shoes: Option<GarmentSummary>,
}

/// A visitor's reconstructed path through the property. Serialized shape is a
/// compatibility boundary; `exit_point` is `null` while the journey is open.
///
#[derive(Debug, Clone, Serialize)]
pub struct Journey {
    pub id: String,
    pub visitor_id: String,
    pub mall_id: MallId,
    pub entry_point: PinId,
    pub exit_point: Option<PinId>,
    pub entry_time: i64,
    pub exit_time: Option<i64>,
    pub path: Vec<JourneyStep>,
    pub confidence: f32,
    pub outfit_summary: OutfitSummary,
    pub closed: bool,
}

/// Counters the builder reports alongside the journeys.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JourneyStats {
    pub journeys: usize,
    pub orphan_chains: usize,
    pub idle_splits: usize,
}

enum CloseReason {
    /// The chain reached an entrance pin.
    Entrance,
    /// The gap between consecutive steps exceeded the idle timeout.
    IdleTimeout,
    /// The input window ended with the chain still open.
    EndOfData,
}

struct Segment<'a> {
    /// (tracklet, link that brought the visitor here - none on the segment head).
    nodes: Vec<(&'a Tracklet, Option<&'a AcceptedLink>)>,
    close_reason: CloseReason,
}

/// Walks the accepted-association graph and materializes journeys for chains anchored
/// at entrance pins.
///
/// The graph must be a disjoint union of simple chains - arbitration guarantees at
/// most one edge on each side of every tracklet, and a violation here means a bug
/// upstream, so the builder fails loudly instead of guessing.
///
pub fn build_journeys(
    topology: &TopologyIndex,
    tracklets: &[Tracklet],
    accepted: &[AcceptedLink],
    idle_timeout_sec: i64,
) -> Result<(Vec<Journey>, JourneyStats), Errors> {
    let mut incoming: HashMap<TrackletId, &AcceptedLink> = HashMap::new();
    let mut outgoing: HashMap<TrackletId, &AcceptedLink> = HashMap::new();
    for link in accepted {
        if incoming.insert(link.target_id, link).is_some() {
            error!(
                "tracklet={} carries two incoming links, aborting the batch",
                link.target_id
            );
            return Err(Errors::BranchingChain(link.target_id));
        }
        if outgoing.insert(link.source_id, link).is_some() {
            error!(
                "tracklet={} carries two outgoing links, aborting the batch",
                link.source_id
            );
            return Err(Errors::BranchingChain(link.source_id));
        }
    }

    let by_id: HashMap<TrackletId, &Tracklet> = tracklets.iter().map(|t| (t.id, t)).collect();

    let mut heads = tracklets
        .iter()
        .filter(|t| !incoming.contains_key(&t.id))
        .collect::<Vec<_>>();
    heads.sort_by_key(|t| (t.t_in, t.id));

    let mut journeys = Vec::new();
    let mut stats = JourneyStats::default();

    for head in heads {
        let chain = collect_chain(head, &by_id, &outgoing);
        for segment in split_segments(chain, idle_timeout_sec, topology, &mut stats) {
            let head_tracklet = segment.nodes[0].0;
            if !topology.is_entrance(head_tracklet.pin_id) {
                warn!(
                    "chain headed by tracklet={} starts at non-entrance pin={}, discarded as orphan",
                    head_tracklet.id, head_tracklet.pin_id
                );
                stats.orphan_chains += 1;
                continue;
            }
            journeys.push(materialize(topology, &segment)?);
            stats.journeys += 1;
        }
    }

    journeys.sort_by(|l, r| (l.entry_time, &l.id).cmp(&(r.entry_time, &r.id)));
    Ok((journeys, stats))
}

fn collect_chain<'a>(
    head: &'a Tracklet,
    by_id: &HashMap<TrackletId, &'a Tracklet>,
    outgoing: &HashMap<TrackletId, &'a AcceptedLink>,
) -> Vec<(&'a Tracklet, Option<&'a AcceptedLink>)> {
    let mut nodes = vec![(head, None)];
    let mut cursor = head.id;
    while let Some(link) = outgoing.get(&cursor) {
        let next = by_id[&link.target_id];
        nodes.push((next, Some(*link)));
        cursor = next.id;
    }
    nodes
}

/// Applies the closure rules: an entrance step closes the journey there, an idle gap
/// splits the chain before the gap, and whatever remains stays open at end-of-data.
/// Remainders continue as fresh segments and are judged on their own heads.
fn split_segments<'a>(
    chain: Vec<(&'a Tracklet, Option<&'a AcceptedLink>)>,
    idle_timeout_sec: i64,
    topology: &TopologyIndex,
    stats: &mut JourneyStats,
) -> Vec<Segment<'a>> {
    let mut segments = Vec::new();
    let mut nodes: Vec<(&Tracklet, Option<&AcceptedLink>)> = Vec::new();

    for (tracklet, link) in chain {
        if let Some(last) = nodes.last() {
            let gap = tracklet.t_in - last.0.t_out;
            if gap > idle_timeout_sec {
                stats.idle_splits += 1;
                segments.push(Segment {
                    nodes: std::mem::take(&mut nodes),
                    close_reason: CloseReason::IdleTimeout,
                });
            }
        }

        if nodes.is_empty() {
            // Segment head: the link that led here belongs to the previous segment,
            // and a head never closes at itself even on an entrance pin.
            nodes.push((tracklet, None));
            continue;
        }

        nodes.push((tracklet, link));
        if topology.is_entrance(tracklet.pin_id) {
            segments.push(Segment {
                nodes: std::mem::take(&mut nodes),
                close_reason: CloseReason::Entrance,
            });
        }
    }

    if !nodes.is_empty() {
        segments.push(Segment {
            nodes,
            close_reason: CloseReason::EndOfData,
        });
    }
    segments
}

fn materialize(topology: &TopologyIndex, segment: &Segment) -> Result<Journey, Errors> {
    let head = segment.nodes[0].0;
    let last = segment.nodes.last().unwrap().0;

    let path = segment
        .nodes
        .iter()
        .map(|(tracklet, link)| {
            Ok(JourneyStep {
                pin_id: tracklet.pin_id,
                pin_name: topology.pin(tracklet.pin_id)?.name.clone(),
                t_in: tracklet.t_in,
                t_out: tracklet.t_out,
                duration_seconds: tracklet.duration_sec(),
                link_score: link.map(|l| l.link_score),
            })
        })
        .collect::<Result<Vec<_>, Errors>>()?;

    let (closed, exit_point, exit_time) = match segment.close_reason {
        CloseReason::Entrance | CloseReason::IdleTimeout => {
            (true, Some(last.pin_id), Some(last.t_out))
        }
        CloseReason::EndOfData => (false, None, None),
    };

    Ok(Journey {
        id: stable_id("journey", &[head.mall_id, head.id, head.t_in as u64]),
        visitor_id: stable_id(
            "visitor",
            &[head.mall_id, epoch_day(head.t_in) as u64, head.id],
        ),
        mall_id: head.mall_id,
        entry_point: head.pin_id,
        exit_point,
        entry_time: head.t_in,
        exit_time,
        path,
        confidence: confidence(segment),
        outfit_summary: outfit_summary(segment),
        closed,
    })
}

/// `0.6·mean(link_scores) + 0.2·f(len) + 0.2·exp(-std((Δt-μ)/τ))` where `f` saturates
/// at three-camera paths. Accumulation runs in f64 in a fixed order.
fn confidence(segment: &Segment) -> f32 {
    let links = segment
        .nodes
        .iter()
        .filter_map(|(_, link)| *link)
        .collect::<Vec<_>>();

    let link_mean = if links.is_empty() {
        0.0
    } else {
        links.iter().map(|l| l.link_score as f64).sum::<f64>() / links.len() as f64
    };

    let length_term = ((segment.nodes.len() as f64 - 1.0) / 2.0).min(1.0);

    let timing_term = {
        let zs = links
            .iter()
            .map(|l| (l.delta_t_sec as f64 - l.expected_mu_sec as f64) / l.tau_sec as f64)
            .collect::<Vec<_>>();
        let std = if zs.is_empty() {
            0.0
        } else {
            let mean = zs.iter().sum::<f64>() / zs.len() as f64;
            (zs.iter().map(|z| (z - mean) * (z - mean)).sum::<f64>() / zs.len() as f64).sqrt()
        };
        (-std).exp()
    };

    let mut value = CONFIDENCE_LINK_WEIGHT * link_mean;
    value += CONFIDENCE_LENGTH_WEIGHT * length_term;
    value += CONFIDENCE_TIMING_WEIGHT * timing_term;
    value as f32
}

/// Majority garment type per slot; quality-weighted mean LAB color across the
/// tracklets where the slot is visible.
fn outfit_summary(segment: &Segment) -> OutfitSummary {
    let mut summary = OutfitSummary::default();
    for slot in GARMENT_SLOTS {
        let mut votes: HashMap<GarmentType, usize> = HashMap::new();
        let mut weight = 0.0_f64;
        let mut l = 0.0_f64;
        let mut a = 0.0_f64;
        let mut b = 0.0_f64;

        for (tracklet, _) in &segment.nodes {
            let Some(garment) = tracklet.outfit.slot(slot) else {
                continue;
            };
            *votes.entry(garment.kind).or_insert(0) += 1;
            let q = tracklet.quality as f64;
            weight += q;
            l += q * garment.color_lab.l as f64;
            a += q * garment.color_lab.a as f64;
            b += q * garment.color_lab.b as f64;
        }

        if weight <= 0.0 {
            continue;
        }
        let kind = votes
            .into_iter()
            .max_by_key(|&(kind, count)| (count, std::cmp::Reverse(kind as usize)))
            .map(|(kind, _)| kind)
            .unwrap();
        let garment = GarmentSummary {
            kind,
            color_lab: LabColor::new(
                (l / weight) as f32,
                (a / weight) as f32,
                (b / weight) as f32,
            ),
        };
        match slot {
            GarmentSlot::Top => summary.top = Some(garment),
            GarmentSlot::Bottom => summary.bottom = Some(garment),
            GarmentSlot::Shoes => summary.shoes = Some(garment),
        }
    }
    summary
}

fn epoch_day(ts: i64) -> i64 {
    ts.div_euclid(86400)
}

/// Deterministic identifier: the tagged sha256 of the inputs, truncated to 16 hex.
fn stable_id(tag: &str, parts: &[u64]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(tag.as_bytes());
    for part in parts {
        hasher.update(part.to_be_bytes());
    }
    let digest = hasher.finalize();
    digest[..8].iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use crate::config::EngineOptions;
    use crate::engine::arbitration::AcceptedLink;
    use crate::journey::build_journeys;
    use crate::test_stuff::{corridor_mall, corridor_mall_with_entrances, init_logging, tracklet_gen};
    use crate::topology::TopologyIndex;
    use crate::tracklet::{Tracklet, TrackletId};

    fn link(tracklets: &[Tracklet], source_id: TrackletId, target_id: TrackletId) -> AcceptedLink {
        let source_idx = tracklets.iter().position(|t| t.id == source_id).unwrap();
        let target_idx = tracklets.iter().position(|t| t.id == target_id).unwrap();
        AcceptedLink {
            source_idx,
            target_idx,
            source_id,
            target_id,
            link_score: 0.9,
            delta_t_sec: tracklets[target_idx].t_in - tracklets[source_idx].t_out,
            expected_mu_sec: 30.0,
            tau_sec: 30.0,
        }
    }

    fn index(pins: Vec<crate::topology::CameraPin>) -> TopologyIndex {
        init_logging();
        TopologyIndex::build(pins, &EngineOptions::default()).unwrap()
    }

    #[test]
    fn entrance_anchored_chain_becomes_a_journey() {
        let tracklets = vec![
            tracklet_gen(1, 1, 36000, 36005).build(),
            tracklet_gen(2, 2, 36040, 36055).build(),
            tracklet_gen(3, 3, 36110, 36140).build(),
        ];
        let links = vec![link(&tracklets, 1, 2), link(&tracklets, 2, 3)];
        let (journeys, stats) =
            build_journeys(&index(corridor_mall(3, 36.0)), &tracklets, &links, 1800).unwrap();

        assert_eq!(stats.journeys, 1);
        assert_eq!(stats.orphan_chains, 0);
        let journey = &journeys[0];
        assert_eq!(journey.entry_point, 1);
        assert_eq!(journey.entry_time, 36000);
        assert_eq!(journey.path.len(), 3);
        assert!(journey.path[0].link_score.is_none());
        assert!(journey.path[1].link_score.is_some());
        // Open at end-of-data.
        assert!(!journey.closed);
        assert!(journey.exit_point.is_none());
        assert!(journey.exit_time.is_none());
        assert!(journey.confidence >= 0.80);
    }

    #[test]
    fn non_entrance_chains_are_orphans() {
        let tracklets = vec![
            tracklet_gen(1, 2, 36000, 36005).build(),
            tracklet_gen(2, 3, 36040, 36055).build(),
        ];
        let links = vec![link(&tracklets, 1, 2)];
        let (journeys, stats) =
            build_journeys(&index(corridor_mall(3, 36.0)), &tracklets, &links, 1800).unwrap();

        assert!(journeys.is_empty());
        assert_eq!(stats.orphan_chains, 1);
    }

    #[test]
    fn lone_entrance_tracklet_is_a_short_journey() {
        let tracklets = vec![tracklet_gen(1, 1, 36000, 36005).build()];
        let (journeys, stats) =
            build_journeys(&index(corridor_mall(3, 36.0)), &tracklets, &[], 1800).unwrap();

        assert_eq!(stats.journeys, 1);
        assert_eq!(journeys[0].path.len(), 1);
        assert!(!journeys[0].closed);
        // No links: only the timing term contributes.
        assert!((journeys[0].confidence - 0.2).abs() < crate::EPS);
    }

    #[test]
    fn idle_gap_splits_the_chain() {
        // A→B→C then a 40-minute pause before D→E. D is not an entrance, so the
        // remainder is an orphan.
        let tracklets = vec![
            tracklet_gen(1, 1, 36000, 36005).build(),
            tracklet_gen(2, 2, 36040, 36055).build(),
            tracklet_gen(3, 3, 36110, 36140).build(),
            tracklet_gen(4, 4, 38540, 38560).build(),
            tracklet_gen(5, 5, 38600, 38620).build(),
        ];
        let links = vec![
            link(&tracklets, 1, 2),
            link(&tracklets, 2, 3),
            link(&tracklets, 3, 4),
            link(&tracklets, 4, 5),
        ];
        let (journeys, stats) =
            build_journeys(&index(corridor_mall(5, 36.0)), &tracklets, &links, 1800).unwrap();

        assert_eq!(stats.idle_splits, 1);
        assert_eq!(stats.journeys, 1);
        assert_eq!(stats.orphan_chains, 1);

        let journey = &journeys[0];
        assert_eq!(journey.path.len(), 3);
        assert!(journey.closed);
        assert_eq!(journey.exit_point, Some(3));
        assert_eq!(journey.exit_time, Some(36140));
    }

    #[test]
    fn remainder_after_idle_split_can_start_its_own_journey() {
        let tracklets = vec![
            tracklet_gen(1, 1, 36000, 36005).build(),
            tracklet_gen(2, 2, 36040, 36055).build(),
            tracklet_gen(3, 3, 36110, 36140).build(),
            tracklet_gen(4, 4, 38540, 38560).build(),
            tracklet_gen(5, 5, 38600, 38620).build(),
        ];
        let links = vec![
            link(&tracklets, 1, 2),
            link(&tracklets, 2, 3),
            link(&tracklets, 3, 4),
            link(&tracklets, 4, 5),
        ];
        let pins = corridor_mall_with_entrances(5, 36.0, &[1, 4]);
        let (journeys, stats) =
            build_journeys(&index(pins), &tracklets, &links, 1800).unwrap();

        assert_eq!(stats.journeys, 2);
        assert_eq!(stats.orphan_chains, 0);
        assert_eq!(journeys[1].entry_point, 4);
        assert_eq!(journeys[1].path.len(), 2);
        // The severed link leaves the remainder's head bare.
        assert!(journeys[1].path[0].link_score.is_none());
    }

    #[test]
    fn reaching_an_entrance_closes_the_journey() {
        let pins = corridor_mall_with_entrances(3, 36.0, &[1, 3]);
        let tracklets = vec![
            tracklet_gen(1, 1, 36000, 36005).build(),
            tracklet_gen(2, 2, 36040, 36055).build(),
            tracklet_gen(3, 3, 36110, 36140).build(),
        ];
        let links = vec![link(&tracklets, 1, 2), link(&tracklets, 2, 3)];
        let (journeys, stats) = build_journeys(&index(pins), &tracklets, &links, 1800).unwrap();

        assert_eq!(stats.journeys, 1);
        let journey = &journeys[0];
        assert!(journey.closed);
        assert_eq!(journey.exit_point, Some(3));
        assert_eq!(journey.exit_time, Some(36140));
    }

    #[test]
    fn branching_graph_is_a_fatal_bug() {
        let tracklets = vec![
            tracklet_gen(1, 1, 36000, 36005).build(),
            tracklet_gen(2, 2, 36040, 36055).build(),
            tracklet_gen(3, 3, 36110, 36140).build(),
        ];
        // Source 1 feeds two targets - arbitration must never emit this.
        let links = vec![link(&tracklets, 1, 2), link(&tracklets, 1, 3)];
        let result = build_journeys(&index(corridor_mall(3, 36.0)), &tracklets, &links, 1800);
        assert!(matches!(result, Err(crate::Errors::BranchingChain(1))));
    }

    #[test]
    fn visitor_ids_are_stable_and_distinct() {
        let tracklets = vec![
            tracklet_gen(1, 1, 36000, 36005).build(),
            tracklet_gen(9, 1, 40000, 40010).build(),
        ];
        let topology = index(corridor_mall(3, 36.0));
        let (once, _) = build_journeys(&topology, &tracklets, &[], 1800).unwrap();
        let (twice, _) = build_journeys(&topology, &tracklets, &[], 1800).unwrap();

        assert_eq!(once[0].visitor_id, twice[0].visitor_id);
        assert_eq!(once[1].visitor_id, twice[1].visitor_id);
        assert_ne!(once[0].visitor_id, once[1].visitor_id);
        assert_eq!(once[0].visitor_id.len(), 16);
    }

    #[test]
    fn outfit_summary_votes_and_averages() {
        use crate::test_stuff::outfit_gen;
        use crate::tracklet::GarmentType;

        let mut drifted = outfit_gen().red_jacket();
        drifted.top.as_mut().unwrap().color_lab.l += 4.0;
        let tracklets = vec![
            tracklet_gen(1, 1, 36000, 36005).build(),
            tracklet_gen(2, 2, 36040, 36055).outfit(drifted).build(),
        ];
        let links = vec![link(&tracklets, 1, 2)];
        let (journeys, _) =
            build_journeys(&index(corridor_mall(3, 36.0)), &tracklets, &links, 1800).unwrap();

        let summary = journeys[0].outfit_summary.top.as_ref().unwrap();
        assert_eq!(summary.kind, GarmentType::Jacket);
        // Equal quality weights average the two L values.
        assert!((summary.color_lab.l - 55.2).abs() < 0.01);
    }

    #[test]
    fn empty_input_is_a_valid_outcome() {
        let (journeys, stats) =
            build_journeys(&index(corridor_mall(3, 36.0)), &[], &[], 1800).unwrap();
        assert!(journeys.is_empty());
        assert_eq!(stats, crate::journey::JourneyStats::default());
    }
}
