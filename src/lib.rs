//!
//! # Wayline
//!
//! The purpose of the crate is to provide the tools to reconstruct anonymous visitor journeys
//! across a multi-camera property from within-camera observations. Every camera produces
//! tracklets - contiguous single-person observations carrying outfit, physique, and timing
//! descriptors - and the crate decides which tracklets on different cameras belong to the same
//! visitor, resolves conflicts between competing candidates, and stitches the accepted links
//! into journeys anchored at entrance cameras.
//!
//! The association is multi-signal and probabilistic: outfit similarity (garment types,
//! CIEDE2000 color difference, appearance embeddings), transit-time plausibility against the
//! camera adjacency graph, adjacency itself, and physique. The engine is built to prefer false
//! splits over false merges - when the evidence is ambiguous the visitor is split, never
//! guessed - and every scored pair leaves an immutable audit record.
//!
//! Processing is batch-oriented: a run covers one property and one time window, operates on
//! in-memory inputs assembled through narrow repository traits, and is deterministic - the same
//! inputs produce byte-identical outputs regardless of source ordering or worker count.
//!
//! ## Performance
//!
//! To keep the calculations performant the crate uses:
//! * [crossbeam](https://docs.rs/crossbeam/latest/crossbeam/) - channel-based worker fan-out over target tracklets;
//! * [rayon](https://docs.rs/rayon/latest/rayon/) - parallel precomputation of the transit table;
//! * [nalgebra](https://nalgebra.org/) - fast linear algebra for appearance embeddings.
//!
//! **The performance depends a lot on the optimization level defined for the build. On lower or
//! default optimization levels Rust may not use vectorized optimizations, so when running
//! benchmarks take care of proper optimization levels configured.**

/// Batch orchestration - worker pool, coordinator, canonical outputs, publication.
pub mod batch;

/// Numeric configuration surface with operational defaults, env loading, and validation.
pub mod config;

/// Per-visitor, per-pin link suppression window.
pub mod cooldown;

/// Distance helpers for appearance embeddings.
pub mod distance;

/// Scoring and decision engine - per-target evaluation, decision rule, arbitration.
pub mod engine;

/// Outfit discretization, stable fingerprints, and the frequent-outfit table.
pub mod fingerprint;

/// Journey construction from accepted associations.
pub mod journey;

/// Sub-score metrics and their fusion into a final match score.
pub mod metric;

pub mod prelude;

/// Repository and sink traits the core consumes and emits through.
pub mod repo;

/// Candidate retrieval - cheap admissibility gates and pre-scoring.
pub mod retrieve;

/// Auxiliary testing and benchmarking stuff.
pub mod test_stuff;

/// Camera topology index - adjacency, entrances, transit parameters.
pub mod topology;

/// The tracklet data model - outfits, physique, embeddings.
pub mod tracklet;

use thiserror::Error;

/// Errors
#[derive(Error, Debug, Clone)]
pub enum Errors {
    /// A pin was requested that the topology doesn't know about.
    #[error("Pin={0} is missing from the topology.")]
    MissingPin(u64),
    /// A pin lists an adjacent pin the topology doesn't know about.
    #[error("Pin={0} lists adjacent pin={1} that is missing from the topology.")]
    UnknownAdjacentPin(u64, u64),
    /// A tracklet references a camera pin the topology doesn't know about.
    #[error("Tracklet={0} references pin={1} that is missing from the topology.")]
    TrackletPinUnknown(u64, u64),
    /// Embedding lengths must be uniform across the property.
    #[error("Tracklet={0} carries an embedding of length {1} while the property-wide length is {2}.")]
    EmbeddingLengthMismatch(u64, usize, usize),
    /// A fused score came out non-finite - the inputs are corrupt.
    #[error("Non-finite score produced for the pair ({0}, {1}).")]
    NonFiniteScore(u64, u64),
    /// The linked-association graph is not a disjoint union of simple chains.
    #[error("Linked associations branch at tracklet={0} - arbitration must keep at most one edge per side.")]
    BranchingChain(u64),
    /// Rejected configuration - the run never starts.
    #[error("Invalid configuration: {0}")]
    ConfigInvalid(String),
    /// An output sink kept failing after the bounded retries.
    #[error("Output sink failed after {0} attempts: {1}")]
    SinkFailed(usize, String),
    /// The caller cancelled the batch; nothing was written.
    #[error("The batch was cancelled by the caller.")]
    Cancelled,
}

#[cfg(test)]
const EPS: f32 = 0.00001;
