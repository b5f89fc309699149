use crate::fingerprint::OutfitFingerprint;
use crate::topology::{CameraPin, PinKind};
use crate::tracklet::{
    Embedding, Garment, GarmentType, HeightCategory, LabColor, MallId, Outfit, Physique, PinId,
    Tracklet, TrackletId,
};
use rand::distributions::Uniform;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Once;

pub const TEST_MALL: MallId = 7;
pub const EMBEDDING_LEN: usize = 64;

static LOG_INIT: Once = Once::new();

/// Initializes env_logger once per process so tests and benches emit the engine's
/// `debug!`/`warn!` trail under `RUST_LOG`. Safe to call from every test.
pub fn init_logging() {
    LOG_INIT.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });
}

/// Deterministic embedding derived from a seed. Identical seeds produce identical
/// vectors, so tests control appearance similarity exactly.
pub fn embedding_from_seed(seed: u64) -> Embedding {
    let mut rng = StdRng::seed_from_u64(seed);
    let dist = Uniform::new(-1.0_f32, 1.0);
    let raw = (0..EMBEDDING_LEN)
        .map(|_| rng.sample(dist))
        .collect::<Vec<_>>();
    normalize(raw)
}

/// An embedding close to the seeded base - cosine stays near 1 for small drift.
pub fn embedding_near(seed: u64, drift: f32, variant: u64) -> Embedding {
    let base = embedding_from_seed(seed);
    let mut rng = StdRng::seed_from_u64(seed ^ (variant.wrapping_mul(0x9e3779b9)));
    let dist = Uniform::new(-drift, drift);
    let raw = base
        .iter()
        .map(|v| v + rng.sample(dist))
        .collect::<Vec<_>>();
    normalize(raw)
}

fn normalize(raw: Vec<f32>) -> Embedding {
    let v = Embedding::from_vec(raw);
    let norm = v.norm();
    if norm > 0.0 {
        v / norm
    } else {
        v
    }
}

pub struct OutfitGen;

pub fn outfit_gen() -> OutfitGen {
    OutfitGen
}

impl OutfitGen {
    /// A distinctive visitor - nothing else in the test malls wears this.
    pub fn red_jacket(&self) -> Outfit {
        Outfit::new(
            Some(Garment::new(
                GarmentType::Jacket,
                LabColor::new(53.2, 80.1, 67.2),
            )),
            Some(Garment::new(
                GarmentType::Jeans,
                LabColor::new(32.3, 0.2, -30.1),
            )),
            Some(Garment::new(
                GarmentType::Sneakers,
                LabColor::new(95.0, 0.0, 2.0),
            )),
        )
    }

    /// The staff uniform - black pants, white shirt, indistinguishable per person.
    pub fn black_white_uniform(&self) -> Outfit {
        Outfit::new(
            Some(Garment::new(
                GarmentType::Shirt,
                LabColor::new(96.5, 0.1, 1.2),
            )),
            Some(Garment::new(
                GarmentType::Pants,
                LabColor::new(12.0, 0.3, -0.8),
            )),
            Some(Garment::new(
                GarmentType::Loafers,
                LabColor::new(15.0, 1.0, 0.5),
            )),
        )
    }

    pub fn navy_hoodie(&self) -> Outfit {
        Outfit::new(
            Some(Garment::new(
                GarmentType::Hoodie,
                LabColor::new(25.8, 10.2, -40.3),
            )),
            Some(Garment::new(
                GarmentType::Shorts,
                LabColor::new(70.0, 2.0, 15.0),
            )),
            Some(Garment::new(
                GarmentType::Sandals,
                LabColor::new(55.0, 20.0, 30.0),
            )),
        )
    }
}

/// Builder for test tracklets with sensible defaults: the red-jacket outfit, an
/// embedding seeded from the outfit fingerprint (same outfit ⇒ cosine 1), medium
/// height, quality 0.9.
///
pub struct TrackletGen {
    id: TrackletId,
    mall_id: MallId,
    pin_id: PinId,
    t_in: i64,
    t_out: i64,
    outfit: Outfit,
    embedding: Option<Embedding>,
    embedding_seed: Option<u64>,
    physique: Physique,
    quality: f32,
}

pub fn tracklet_gen(id: TrackletId, pin_id: PinId, t_in: i64, t_out: i64) -> TrackletGen {
    TrackletGen {
        id,
        mall_id: TEST_MALL,
        pin_id,
        t_in,
        t_out,
        outfit: outfit_gen().red_jacket(),
        embedding: None,
        embedding_seed: None,
        physique: Physique::new(HeightCategory::Medium, 0.42),
        quality: 0.9,
    }
}

impl TrackletGen {
    pub fn mall(mut self, mall_id: MallId) -> Self {
        self.mall_id = mall_id;
        self
    }

    pub fn outfit(mut self, outfit: Outfit) -> Self {
        self.outfit = outfit;
        self
    }

    pub fn embedding(mut self, embedding: Embedding) -> Self {
        self.embedding = Some(embedding);
        self
    }

    pub fn embedding_seed(mut self, seed: u64) -> Self {
        self.embedding_seed = Some(seed);
        self
    }

    pub fn physique(mut self, physique: Physique) -> Self {
        self.physique = physique;
        self
    }

    pub fn quality(mut self, quality: f32) -> Self {
        self.quality = quality;
        self
    }

    pub fn build(self) -> Tracklet {
        let embedding = match (self.embedding, self.embedding_seed) {
            (Some(e), _) => e,
            (None, Some(seed)) => embedding_from_seed(seed),
            (None, None) => embedding_from_seed(OutfitFingerprint::of(&self.outfit).0),
        };
        Tracklet::new(
            self.id,
            self.mall_id,
            self.pin_id,
            self.pin_id * 100,
            self.t_in,
            self.t_out,
            self.outfit,
            embedding,
            self.physique,
            self.quality,
        )
    }
}

/// A linear corridor mall: pins 1..=n spaced `spacing_m` meters apart, pin 1 an
/// entrance, consecutive pins adjacent. With the default 1.2 m/s walking speed a
/// 36 m spacing yields μ = 30 s per hop.
///
pub fn corridor_mall(n: usize, spacing_m: f64) -> Vec<CameraPin> {
    corridor_mall_with_entrances(n, spacing_m, &[1])
}

pub fn corridor_mall_with_entrances(
    n: usize,
    spacing_m: f64,
    entrances: &[PinId],
) -> Vec<CameraPin> {
    (1..=n as PinId)
        .map(|id| {
            let kind = if entrances.contains(&id) {
                PinKind::Entrance
            } else {
                PinKind::Normal
            };
            let mut adjacent = Vec::new();
            if id > 1 {
                adjacent.push(id - 1);
            }
            if id < n as PinId {
                adjacent.push(id + 1);
            }
            CameraPin::new(
                id,
                TEST_MALL,
                &format!("pin-{id}"),
                kind,
                (id - 1) as f64 * spacing_m,
                0.0,
            )
            .adjacent(&adjacent)
        })
        .collect()
}
