use crate::config::EngineOptions;
use crate::tracklet::{MallId, PinId};
use crate::Errors;
use geo::{EuclideanDistance, Point};
use pathfinding::prelude::dijkstra;
use rayon::prelude::*;
use std::collections::{HashMap, HashSet};

/// Dijkstra operates on integer costs; μ seconds are scaled to milliseconds.
const MU_COST_SCALE: f32 = 1000.0;

/// Role of a camera pin within the property.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinKind {
    /// Entry/exit point - journeys must originate and may terminate here.
    Entrance,
    Normal,
}

/// Expected transit time between two pins and its tolerance.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransitParams {
    pub mu_sec: f32,
    pub tau_sec: f32,
}

impl TransitParams {
    pub fn new(mu_sec: f32, tau_sec: f32) -> Self {
        assert!(mu_sec >= 0.0, "Transit expectation must not be negative");
        assert!(tau_sec > 0.0, "Transit tolerance must be a positive number");
        Self { mu_sec, tau_sec }
    }

    /// Upper admissibility gate μ + 3τ.
    pub fn upper_gate_sec(&self) -> f32 {
        self.mu_sec + 3.0 * self.tau_sec
    }
}

/// A camera pin on the property floor plan. Immutable within a run.
///
#[derive(Debug, Clone)]
pub struct CameraPin {
    pub id: PinId,
    pub mall_id: MallId,
    pub name: String,
    pub kind: PinKind,
    /// Floor-plan position in meters; feeds the walking-speed μ fallback.
    pub position: Point<f64>,
    pub adjacent_to: Vec<PinId>,
    /// Operator-annotated transit expectations overriding the derived ones.
    pub transit_overrides: HashMap<PinId, TransitParams>,
}

impl CameraPin {
    pub fn new(id: PinId, mall_id: MallId, name: &str, kind: PinKind, x: f64, y: f64) -> Self {
        Self {
            id,
            mall_id,
            name: name.to_string(),
            kind,
            position: Point::new(x, y),
            adjacent_to: Vec::new(),
            transit_overrides: HashMap::new(),
        }
    }

    pub fn adjacent(mut self, pins: &[PinId]) -> Self {
        self.adjacent_to.extend_from_slice(pins);
        self
    }

    pub fn transit_override(mut self, to: PinId, mu_sec: f32, tau_sec: f32) -> Self {
        self.transit_overrides
            .insert(to, TransitParams::new(mu_sec, tau_sec));
        self
    }

    pub fn is_entrance(&self) -> bool {
        self.kind == PinKind::Entrance
    }
}

/// Graph distance collapsed to the values the engine distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HopDistance {
    One,
    Two,
    Unreachable,
}

impl HopDistance {
    pub fn is_reachable(&self) -> bool {
        !matches!(self, HopDistance::Unreachable)
    }
}

/// Per-run index over the property's camera graph.
///
/// Built once from the pin set before the worker pool starts and treated as immutable
/// for the duration of the run. Adjacency is symmetrized at build so the public
/// symmetry invariant always holds; transit parameters are precomputed for every
/// directed pair within two hops.
///
#[derive(Debug)]
pub struct TopologyIndex {
    pins: HashMap<PinId, CameraPin>,
    neighbours: HashMap<PinId, HashSet<PinId>>,
    hops: HashMap<(PinId, PinId), HopDistance>,
    transit: HashMap<(PinId, PinId), TransitParams>,
    rings: HashMap<PinId, Vec<PinId>>,
}

impl TopologyIndex {
    pub fn build(pins: Vec<CameraPin>, opts: &EngineOptions) -> Result<Self, Errors> {
        let ids: HashSet<PinId> = pins.iter().map(|p| p.id).collect();

        let mut neighbours: HashMap<PinId, HashSet<PinId>> =
            ids.iter().map(|id| (*id, HashSet::new())).collect();
        for pin in &pins {
            for other in &pin.adjacent_to {
                if !ids.contains(other) {
                    return Err(Errors::UnknownAdjacentPin(pin.id, *other));
                }
                neighbours.get_mut(&pin.id).unwrap().insert(*other);
                neighbours.get_mut(other).unwrap().insert(pin.id);
            }
            for other in pin.transit_overrides.keys() {
                if !ids.contains(other) {
                    return Err(Errors::UnknownAdjacentPin(pin.id, *other));
                }
            }
        }

        let pins: HashMap<PinId, CameraPin> = pins.into_iter().map(|p| (p.id, p)).collect();

        let mut hops = HashMap::new();
        let mut transit = HashMap::new();
        for (&a, direct) in &neighbours {
            for &b in direct {
                hops.insert((a, b), HopDistance::One);
                transit.insert((a, b), one_hop_params(&pins, a, b, opts));
            }
        }

        // Second ring plus μ-shortest transit, computed as a pure parallel map.
        let second_ring = neighbours
            .par_iter()
            .map(|(&a, direct)| {
                let mut entries = Vec::new();
                let reachable: HashSet<PinId> = direct
                    .iter()
                    .flat_map(|m| neighbours[m].iter().copied())
                    .filter(|&c| c != a && !direct.contains(&c))
                    .collect();
                for c in reachable {
                    if let Some(params) = two_hop_params(&neighbours, &transit, a, c) {
                        entries.push((a, c, params));
                    }
                }
                entries
            })
            .collect::<Vec<_>>();

        for entries in second_ring {
            for (a, c, params) in entries {
                hops.insert((a, c), HopDistance::Two);
                transit.insert((a, c), params);
            }
        }

        let mut rings: HashMap<PinId, Vec<PinId>> =
            ids.iter().map(|id| (*id, Vec::new())).collect();
        for (a, b) in hops.keys() {
            rings.get_mut(a).unwrap().push(*b);
        }
        for ring in rings.values_mut() {
            ring.sort_unstable();
        }

        Ok(Self {
            pins,
            neighbours,
            hops,
            transit,
            rings,
        })
    }

    pub fn pin(&self, id: PinId) -> Result<&CameraPin, Errors> {
        self.pins.get(&id).ok_or(Errors::MissingPin(id))
    }

    pub fn contains(&self, id: PinId) -> bool {
        self.pins.contains_key(&id)
    }

    pub fn pin_count(&self) -> usize {
        self.pins.len()
    }

    /// Direct neighbours of a pin. Pins are validated before the scoring pass, so the
    /// lookup itself is infallible; an unknown pin has no neighbours.
    pub fn neighbours(&self, pin: PinId) -> impl Iterator<Item = PinId> + '_ {
        self.neighbours
            .get(&pin)
            .into_iter()
            .flat_map(|n| n.iter().copied())
    }

    /// Pins within two hops of the given one - the candidate search ring.
    pub fn search_ring(&self, pin: PinId) -> &[PinId] {
        self.rings.get(&pin).map(|r| r.as_slice()).unwrap_or(&[])
    }

    pub fn hop_distance(&self, a: PinId, b: PinId) -> HopDistance {
        self.hops
            .get(&(a, b))
            .copied()
            .unwrap_or(HopDistance::Unreachable)
    }

    /// Transit parameters for a directed pair within two hops, none otherwise.
    pub fn transit_params(&self, a: PinId, b: PinId) -> Option<&TransitParams> {
        self.transit.get(&(a, b))
    }

    pub fn is_entrance(&self, pin: PinId) -> bool {
        self.pins.get(&pin).map(|p| p.is_entrance()).unwrap_or(false)
    }

    pub fn entrances(&self) -> impl Iterator<Item = &CameraPin> {
        self.pins.values().filter(|p| p.is_entrance())
    }
}

fn one_hop_params(
    pins: &HashMap<PinId, CameraPin>,
    a: PinId,
    b: PinId,
    opts: &EngineOptions,
) -> TransitParams {
    let pin_a = &pins[&a];
    if let Some(annotated) = pin_a.transit_overrides.get(&b) {
        return *annotated;
    }
    // The reverse annotation applies symmetrically when only one side carries it.
    if let Some(annotated) = pins[&b].transit_overrides.get(&a) {
        return *annotated;
    }
    let meters = pin_a.position.euclidean_distance(&pins[&b].position) as f32;
    TransitParams::new(meters / opts.walk_speed_ms, opts.time_tolerance_sec)
}

/// μ-shortest transit between two second-ring pins: Dijkstra over the one-hop μ
/// weights gives the μ sum, the legs on the winning path give the base tolerance,
/// and the tolerance is enlarged by √2 for the unobserved middle ground.
fn two_hop_params(
    neighbours: &HashMap<PinId, HashSet<PinId>>,
    one_hop: &HashMap<(PinId, PinId), TransitParams>,
    a: PinId,
    c: PinId,
) -> Option<TransitParams> {
    let (path, cost) = dijkstra(
        &a,
        |n| {
            let mut next = neighbours[n]
                .iter()
                .map(|m| {
                    (
                        *m,
                        (one_hop[&(*n, *m)].mu_sec * MU_COST_SCALE).round() as u64,
                    )
                })
                .collect::<Vec<_>>();
            next.sort_unstable();
            next
        },
        |n| *n == c,
    )?;

    let tau_base = path
        .windows(2)
        .map(|leg| one_hop[&(leg[0], leg[1])].tau_sec)
        .fold(0.0_f32, f32::max);

    Some(TransitParams::new(
        cost as f32 / MU_COST_SCALE,
        tau_base * 2.0_f32.sqrt(),
    ))
}
