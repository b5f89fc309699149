use crate::fingerprint::OutfitFingerprint;
use nalgebra::DVector;
use serde::{Deserialize, Serialize};

/// Globally unique tracklet identifier assigned by the upstream CV layer.
pub type TrackletId = u64;
/// Camera pin identifier.
pub type PinId = u64;
/// Property (mall) identifier.
pub type MallId = u64;
/// Source video identifier.
pub type VideoId = u64;

/// Appearance embedding vector. L2-normalized upstream, fixed length property-wide.
pub type Embedding = DVector<f32>;

/// The garment vocabulary. Values coming from upstream outside the vocabulary are
/// coerced to [GarmentType::Other] and never contribute to the type score.
///
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GarmentType {
    Tshirt,
    Shirt,
    Blouse,
    Jacket,
    Coat,
    Hoodie,
    Sweater,
    Dress,
    Pants,
    Jeans,
    Shorts,
    Skirt,
    Sneakers,
    Loafers,
    Boots,
    Sandals,
    Heels,
    Other,
}

impl GarmentType {
    /// Maps an upstream label to the vocabulary. Unknown labels land on `Other`.
    pub fn from_label(label: &str) -> Self {
        match label {
            "tshirt" | "t-shirt" => GarmentType::Tshirt,
            "shirt" => GarmentType::Shirt,
            "blouse" => GarmentType::Blouse,
            "jacket" => GarmentType::Jacket,
            "coat" => GarmentType::Coat,
            "hoodie" => GarmentType::Hoodie,
            "sweater" => GarmentType::Sweater,
            "dress" => GarmentType::Dress,
            "pants" | "trousers" => GarmentType::Pants,
            "jeans" => GarmentType::Jeans,
            "shorts" => GarmentType::Shorts,
            "skirt" => GarmentType::Skirt,
            "sneakers" => GarmentType::Sneakers,
            "loafers" => GarmentType::Loafers,
            "boots" => GarmentType::Boots,
            "sandals" => GarmentType::Sandals,
            "heels" => GarmentType::Heels,
            _ => GarmentType::Other,
        }
    }
}

/// Quantized mean garment color in CIELAB.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LabColor {
    pub l: f32,
    pub a: f32,
    pub b: f32,
}

impl LabColor {
    pub fn new(l: f32, a: f32, b: f32) -> Self {
        Self { l, a, b }
    }
}

/// One garment observation - type plus quantized color with an optional small
/// per-channel histogram used by the fingerprint discretization.
///
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Garment {
    pub kind: GarmentType,
    pub color_lab: LabColor,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub histogram: Vec<f32>,
}

impl Garment {
    pub fn new(kind: GarmentType, color_lab: LabColor) -> Self {
        Self {
            kind,
            color_lab,
            histogram: Vec::new(),
        }
    }
}

/// Outfit slot designators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GarmentSlot {
    Top,
    Bottom,
    Shoes,
}

pub const GARMENT_SLOTS: [GarmentSlot; 3] =
    [GarmentSlot::Top, GarmentSlot::Bottom, GarmentSlot::Shoes];

/// The three-slot outfit descriptor. A slot the segmentation failed to produce is
/// `None` and contributes zero visibility to outfit scoring.
///
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Outfit {
    pub top: Option<Garment>,
    pub bottom: Option<Garment>,
    pub shoes: Option<Garment>,
}

impl Outfit {
    pub fn new(top: Option<Garment>, bottom: Option<Garment>, shoes: Option<Garment>) -> Self {
        Self { top, bottom, shoes }
    }

    pub fn slot(&self, slot: GarmentSlot) -> Option<&Garment> {
        match slot {
            GarmentSlot::Top => self.top.as_ref(),
            GarmentSlot::Bottom => self.bottom.as_ref(),
            GarmentSlot::Shoes => self.shoes.as_ref(),
        }
    }
}

/// Coarse height bucket produced upstream from the calibrated camera view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeightCategory {
    Short,
    Medium,
    Tall,
}

impl HeightCategory {
    /// Short and tall are never adjacent - medium sits between them.
    pub fn is_adjacent(&self, other: &HeightCategory) -> bool {
        matches!(
            (self, other),
            (HeightCategory::Short, HeightCategory::Medium)
                | (HeightCategory::Medium, HeightCategory::Short)
                | (HeightCategory::Medium, HeightCategory::Tall)
                | (HeightCategory::Tall, HeightCategory::Medium)
        )
    }
}

/// Body-shape descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Physique {
    pub height_category: HeightCategory,
    pub aspect_ratio: f32,
}

impl Physique {
    pub fn new(height_category: HeightCategory, aspect_ratio: f32) -> Self {
        assert!(
            aspect_ratio > 0.0,
            "Aspect ratio must be a positive number"
        );
        Self {
            height_category,
            aspect_ratio,
        }
    }
}

/// A contiguous within-camera observation of one person. Immutable input to the core.
///
/// Timestamps are unix seconds; `t_out >= t_in` always holds. The outfit fingerprint is
/// derived from the discretised outfit at construction and stays stable for identical
/// outfits across runs and platforms.
///
#[derive(Debug, Clone, Serialize)]
pub struct Tracklet {
    pub id: TrackletId,
    pub mall_id: MallId,
    pub pin_id: PinId,
    pub video_id: VideoId,
    pub t_in: i64,
    pub t_out: i64,
    pub outfit: Outfit,
    #[serde(skip_serializing)]
    pub embedding: Embedding,
    pub physique: Physique,
    pub quality: f32,
    pub outfit_fingerprint: OutfitFingerprint,
}

impl Tracklet {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: TrackletId,
        mall_id: MallId,
        pin_id: PinId,
        video_id: VideoId,
        t_in: i64,
        t_out: i64,
        outfit: Outfit,
        embedding: Embedding,
        physique: Physique,
        quality: f32,
    ) -> Self {
        assert!(t_out >= t_in, "Tracklet must not end before it starts");
        assert!(
            (0.0..=1.0).contains(&quality),
            "Quality must lay within [0.0; 1.0]"
        );
        let outfit_fingerprint = OutfitFingerprint::of(&outfit);
        Self {
            id,
            mall_id,
            pin_id,
            video_id,
            t_in,
            t_out,
            outfit,
            embedding,
            physique,
            quality,
            outfit_fingerprint,
        }
    }

    /// Dwell time on the camera.
    pub fn duration_sec(&self) -> i64 {
        self.t_out - self.t_in
    }
}
