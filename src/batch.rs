use crate::config::EngineOptions;
use crate::engine::arbitration::resolve;
use crate::engine::{finalize_associations, Association, Decision, ScoringEngine, TargetEvaluation};
use crate::fingerprint::{collect_deltas, hour_bucket, FingerprintDelta, FrequentOutfitTable};
use crate::journey::{build_journeys, Journey, JourneyStats};
use crate::metric::{AssociationMetric, MetricOptions};
use crate::repo::{
    with_retries, AssociationSink, FrequentOutfitRepo, FrequentOutfitSink, JourneySink,
    TopologyRepo, TrackletSource,
};
use crate::retrieve::SourceIndex;
use crate::topology::{CameraPin, TopologyIndex};
use crate::tracklet::{MallId, Tracklet};
use crate::Errors;
use log::{debug, error, info};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

/// Cooperative cancellation flag checked by workers between targets.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Counters of one batch run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchStats {
    pub tracklets: usize,
    pub scored_pairs: usize,
    pub linked: usize,
    pub ambiguous: usize,
    pub new_visitors: usize,
    pub arbitration_rounds: usize,
    pub cooldown_rejections: usize,
    pub journeys: JourneyStats,
}

/// Everything a run produces, canonically ordered, ready for atomic publication.
#[derive(Debug)]
pub struct BatchOutcome {
    pub mall_id: MallId,
    pub associations: Vec<Association>,
    pub journeys: Vec<Journey>,
    pub frequent_deltas: Vec<FingerprintDelta>,
    pub stats: BatchStats,
}

impl BatchOutcome {
    /// Publishes the outcome through the sinks with bounded retries. Nothing is
    /// half-written on failure - each sink takes its batch in one atomic call, and a
    /// sink that keeps failing surfaces [Errors::SinkFailed] with the inputs intact.
    ///
    pub fn publish(
        &self,
        associations: &mut dyn AssociationSink,
        journeys: &mut dyn JourneySink,
        frequent: &mut dyn FrequentOutfitSink,
    ) -> Result<(), Errors> {
        with_retries("association sink", || associations.write(&self.associations))?;
        with_retries("journey sink", || journeys.write(&self.journeys))?;
        with_retries("frequent-outfit sink", || {
            for delta in &self.frequent_deltas {
                frequent.increment(delta.mall_id, delta.fingerprint, delta.hour_bucket, delta.count)?;
            }
            Ok(())
        })
    }
}

/// One scoring run over a (property, time window) tracklet set.
///
/// Shared read-only state - topology, source index, frequent-outfit snapshot - is
/// assembled before the worker pool starts. Workers fan out over target tracklets
/// through a crossbeam channel and never touch mutable shared state; the decision
/// rule, arbitration, and cooldown run on the single coordinator thread afterwards.
/// Identical inputs produce byte-identical outputs regardless of worker count or
/// input ordering.
///
#[derive(Debug)]
pub struct BatchRun {
    options: Arc<EngineOptions>,
    metric_options: Arc<MetricOptions>,
    cancellation: CancellationToken,
}

impl BatchRun {
    /// Validates the configuration up front - an invalid set never starts a run.
    pub fn new(options: EngineOptions) -> Result<Self, Errors> {
        options.validate()?;
        Ok(Self {
            options: Arc::new(options),
            metric_options: Arc::new(MetricOptions::default()),
            cancellation: CancellationToken::new(),
        })
    }

    pub fn metric_options(mut self, opts: MetricOptions) -> Self {
        self.metric_options = Arc::new(opts);
        self
    }

    pub fn cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    /// Loads inputs through the repositories, executes the run, and publishes the
    /// outputs - the full ingest, associate, stitch, publish cycle for one window.
    #[allow(clippy::too_many_arguments)]
    pub fn run_window<S, TR, FR>(
        &self,
        mall_id: MallId,
        from_time: i64,
        to_time: i64,
        source: &S,
        topology_repo: &TR,
        frequent_repo: &FR,
        association_sink: &mut dyn AssociationSink,
        journey_sink: &mut dyn JourneySink,
        frequent_sink: &mut dyn FrequentOutfitSink,
    ) -> anyhow::Result<BatchOutcome>
    where
        S: TrackletSource,
        TR: TopologyRepo,
        FR: FrequentOutfitRepo,
    {
        let pins = topology_repo.load(mall_id)?;
        let tracklets = source.fetch(mall_id, from_time, to_time)?;

        let mut frequent = FrequentOutfitTable::new();
        let first_hour = hour_bucket(from_time - self.options.max_candidate_window_sec);
        for hour in first_hour..=hour_bucket(to_time) {
            frequent.load_hour(hour, frequent_repo.snapshot(mall_id, hour)?);
        }

        let outcome = self.execute(mall_id, pins, tracklets, frequent)?;
        outcome.publish(association_sink, journey_sink, frequent_sink)?;
        Ok(outcome)
    }

    /// Executes the run on pre-assembled in-memory inputs.
    pub fn execute(
        &self,
        mall_id: MallId,
        pins: Vec<CameraPin>,
        mut tracklets: Vec<Tracklet>,
        frequent: FrequentOutfitTable,
    ) -> Result<BatchOutcome, Errors> {
        let topology = Arc::new(TopologyIndex::build(pins, &self.options)?);
        validate_tracklets(&topology, &tracklets)?;

        // Canonical target order; evaluation indices refer into this ordering.
        tracklets.sort_by_key(|t| t.id);

        let engine = ScoringEngine::new(
            topology.clone(),
            self.options.clone(),
            AssociationMetric::new(self.metric_options.clone()),
            Arc::new(frequent),
        );
        let index = SourceIndex::build(&tracklets);

        let mut evaluations = self.evaluate_all(&engine, &tracklets, &index)?;
        evaluations.sort_by_key(|e| e.target_id);

        let outcome = resolve(&evaluations, &tracklets, &self.options);
        let associations = finalize_associations(&evaluations, &outcome.resolutions);
        let (journeys, journey_stats) = build_journeys(
            &topology,
            &tracklets,
            &outcome.accepted,
            self.options.idle_timeout_sec,
        )?;
        let frequent_deltas = collect_deltas(mall_id, &tracklets);

        let ambiguous = outcome
            .resolutions
            .iter()
            .filter(|r| matches!(r, Some(c) if c.decision == Decision::Ambiguous))
            .count();
        let stats = BatchStats {
            tracklets: tracklets.len(),
            scored_pairs: associations.len(),
            linked: outcome.accepted.len(),
            ambiguous,
            new_visitors: tracklets.len() - outcome.accepted.len() - ambiguous,
            arbitration_rounds: outcome.rounds,
            cooldown_rejections: outcome.cooldown_rejections,
            journeys: journey_stats,
        };

        info!(
            "mall={} batch done: {} tracklets, {} linked, {} ambiguous, {} journeys, {} orphans",
            mall_id,
            stats.tracklets,
            stats.linked,
            stats.ambiguous,
            stats.journeys.journeys,
            stats.journeys.orphan_chains
        );

        Ok(BatchOutcome {
            mall_id,
            associations,
            journeys,
            frequent_deltas,
            stats,
        })
    }

    /// Fans the targets out over the worker pool. Workers block only on the job and
    /// result channels; results arrive unordered and are re-sorted by the caller.
    fn evaluate_all(
        &self,
        engine: &ScoringEngine,
        tracklets: &[Tracklet],
        index: &SourceIndex,
    ) -> Result<Vec<TargetEvaluation>, Errors> {
        let worker_count = self.options.worker_count.min(tracklets.len().max(1));
        let (job_tx, job_rx) = crossbeam::channel::unbounded::<usize>();
        let (result_tx, result_rx) = crossbeam::channel::unbounded();

        for idx in 0..tracklets.len() {
            job_tx.send(idx).expect("job queue is open during setup");
        }
        drop(job_tx);

        thread::scope(|scope| {
            for _ in 0..worker_count {
                let job_rx = job_rx.clone();
                let result_tx = result_tx.clone();
                let cancellation = self.cancellation.clone();
                scope.spawn(move || {
                    while let Ok(idx) = job_rx.recv() {
                        if cancellation.is_cancelled() {
                            debug!("worker observed cancellation, discarding remaining targets");
                            break;
                        }
                        if result_tx.send(engine.evaluate(idx, tracklets, index)).is_err() {
                            break;
                        }
                    }
                });
            }
        });
        drop(result_tx);

        if self.cancellation.is_cancelled() {
            error!("batch cancelled by the caller, partial results discarded");
            return Err(Errors::Cancelled);
        }

        let mut evaluations = Vec::with_capacity(tracklets.len());
        let mut failures = Vec::new();
        for result in result_rx.try_iter() {
            match result {
                Ok(evaluation) => evaluations.push(evaluation),
                Err(e) => failures.push(e),
            }
        }
        if !failures.is_empty() {
            failures.sort_by_key(|e| e.to_string());
            let fatal = failures.remove(0);
            error!("scoring failed, aborting the batch: {fatal}");
            return Err(fatal);
        }
        Ok(evaluations)
    }
}

fn validate_tracklets(topology: &TopologyIndex, tracklets: &[Tracklet]) -> Result<(), Errors> {
    let mut embedding_len = None;
    for tracklet in tracklets {
        if !topology.contains(tracklet.pin_id) {
            error!(
                "tracklet={} references unknown pin={}, aborting the batch",
                tracklet.id, tracklet.pin_id
            );
            return Err(Errors::TrackletPinUnknown(tracklet.id, tracklet.pin_id));
        }
        match embedding_len {
            None => embedding_len = Some(tracklet.embedding.len()),
            Some(expected) if tracklet.embedding.len() != expected => {
                error!(
                    "tracklet={} embedding length {} differs from the property-wide {}, aborting the batch",
                    tracklet.id,
                    tracklet.embedding.len(),
                    expected
                );
                return Err(Errors::EmbeddingLengthMismatch(
                    tracklet.id,
                    tracklet.embedding.len(),
                    expected,
                ));
            }
            Some(_) => {}
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::batch::{BatchRun, CancellationToken};
    use crate::config::EngineOptions;
    use crate::engine::Decision;
    use crate::fingerprint::FrequentOutfitTable;
    use crate::repo::{MemoryFrequentOutfitSink, MemorySink, MemoryStore};
    use crate::test_stuff::{corridor_mall, init_logging, tracklet_gen, TEST_MALL};
    use crate::tracklet::Tracklet;
    use crate::Errors;

    fn straight_walk() -> Vec<Tracklet> {
        vec![
            tracklet_gen(1, 1, 36000, 36005).build(),
            tracklet_gen(2, 2, 36040, 36055).build(),
            tracklet_gen(3, 3, 36110, 36140).build(),
        ]
    }

    fn run() -> BatchRun {
        init_logging();
        BatchRun::new(EngineOptions::default()).unwrap()
    }

    #[test]
    fn full_window_cycle_publishes_everything() {
        let store = MemoryStore {
            tracklets: straight_walk(),
            pins: corridor_mall(3, 36.0),
            ..Default::default()
        };
        let mut association_sink = MemorySink::default();
        let mut journey_sink = MemorySink::default();
        let mut frequent_sink = MemoryFrequentOutfitSink::default();

        let outcome = run()
            .run_window(
                TEST_MALL,
                36000,
                40000,
                &store,
                &store,
                &store,
                &mut association_sink,
                &mut journey_sink,
                &mut frequent_sink,
            )
            .unwrap();

        assert_eq!(outcome.stats.linked, 2);
        assert_eq!(outcome.stats.journeys.journeys, 1);
        assert_eq!(association_sink.records.len(), outcome.associations.len());
        assert_eq!(journey_sink.records.len(), 1);
        assert!(!frequent_sink.counts.is_empty());
        // The artefacts are canonical JSON with the stable field names.
        assert!(association_sink.records[0].contains("\"from_tracklet_id\""));
        assert!(journey_sink.records[0].contains("\"visitor_id\""));
        assert!(journey_sink.records[0].contains("\"exit_point\":null"));
    }

    #[test]
    fn reruns_are_byte_identical_regardless_of_input_order() {
        init_logging();
        let serialize = |tracklets: Vec<Tracklet>, workers: usize| {
            let outcome = BatchRun::new(EngineOptions::default().worker_count(workers))
                .unwrap()
                .execute(
                    TEST_MALL,
                    corridor_mall(3, 36.0),
                    tracklets,
                    FrequentOutfitTable::new(),
                )
                .unwrap();
            let associations = outcome
                .associations
                .iter()
                .map(|a| serde_json::to_string(a).unwrap())
                .collect::<Vec<_>>();
            let journeys = outcome
                .journeys
                .iter()
                .map(|j| serde_json::to_string(j).unwrap())
                .collect::<Vec<_>>();
            (associations, journeys)
        };

        let forward = serialize(straight_walk(), 1);
        let mut reversed_input = straight_walk();
        reversed_input.reverse();
        let reversed = serialize(reversed_input, 4);

        assert_eq!(forward, reversed);
        assert!(!forward.0.is_empty());
    }

    #[test]
    fn cancellation_discards_the_batch() {
        let token = CancellationToken::new();
        token.cancel();
        let result = run().cancellation(token).execute(
            TEST_MALL,
            corridor_mall(3, 36.0),
            straight_walk(),
            FrequentOutfitTable::new(),
        );
        assert!(matches!(result, Err(Errors::Cancelled)));
    }

    #[test]
    fn unknown_pin_aborts_the_batch() {
        let mut tracklets = straight_walk();
        tracklets.push(tracklet_gen(4, 99, 36200, 36210).build());
        let result = run().execute(
            TEST_MALL,
            corridor_mall(3, 36.0),
            tracklets,
            FrequentOutfitTable::new(),
        );
        assert!(matches!(result, Err(Errors::TrackletPinUnknown(4, 99))));
    }

    #[test]
    fn embedding_length_mismatch_aborts_the_batch() {
        use crate::tracklet::Embedding;
        let mut tracklets = straight_walk();
        tracklets.push(
            tracklet_gen(4, 3, 36200, 36210)
                .embedding(Embedding::from_vec(vec![1.0, 0.0]))
                .build(),
        );
        let result = run().execute(
            TEST_MALL,
            corridor_mall(3, 36.0),
            tracklets,
            FrequentOutfitTable::new(),
        );
        assert!(matches!(result, Err(Errors::EmbeddingLengthMismatch(4, 2, _))));
    }

    #[test]
    fn empty_window_is_a_valid_outcome() {
        let outcome = run()
            .execute(
                TEST_MALL,
                corridor_mall(3, 36.0),
                Vec::new(),
                FrequentOutfitTable::new(),
            )
            .unwrap();
        assert!(outcome.associations.is_empty());
        assert!(outcome.journeys.is_empty());
        assert_eq!(outcome.stats.tracklets, 0);
    }

    #[test]
    fn transient_sink_failures_are_retried() {
        let outcome = run()
            .execute(
                TEST_MALL,
                corridor_mall(3, 36.0),
                straight_walk(),
                FrequentOutfitTable::new(),
            )
            .unwrap();

        let mut association_sink = MemorySink {
            failures_left: 2,
            ..Default::default()
        };
        let mut journey_sink = MemorySink::default();
        let mut frequent_sink = MemoryFrequentOutfitSink::default();
        outcome
            .publish(&mut association_sink, &mut journey_sink, &mut frequent_sink)
            .unwrap();
        assert_eq!(association_sink.records.len(), outcome.associations.len());

        let mut dead_sink = MemorySink {
            failures_left: 5,
            ..Default::default()
        };
        let result = outcome.publish(&mut dead_sink, &mut journey_sink, &mut frequent_sink);
        assert!(matches!(result, Err(Errors::SinkFailed(3, _))));
        assert!(dead_sink.records.is_empty());
    }

    #[test]
    fn decisions_cover_every_target() {
        let outcome = run()
            .execute(
                TEST_MALL,
                corridor_mall(3, 36.0),
                straight_walk(),
                FrequentOutfitTable::new(),
            )
            .unwrap();
        let linked = outcome
            .associations
            .iter()
            .filter(|a| a.decision == Decision::Linked)
            .count();
        assert_eq!(linked, outcome.stats.linked);
        assert_eq!(
            outcome.stats.linked + outcome.stats.ambiguous + outcome.stats.new_visitors,
            outcome.stats.tracklets
        );
    }
}
