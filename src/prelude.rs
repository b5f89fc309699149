pub use crate::batch::{BatchOutcome, BatchRun, BatchStats, CancellationToken};
pub use crate::config::EngineOptions;
pub use crate::engine::{Association, Decision};
pub use crate::journey::Journey;
pub use crate::metric::MetricOptions;
pub use crate::topology::{CameraPin, PinKind, TopologyIndex, TransitParams};
pub use crate::tracklet::{
    Garment, GarmentType, HeightCategory, LabColor, Outfit, Physique, Tracklet,
};
