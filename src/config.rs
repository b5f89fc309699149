use crate::Errors;
use std::env;

/// The amount added to the match threshold for targets whose admissible candidate
/// pool exceeds [EngineOptions::rush_hour_candidate_trigger].
pub const RUSH_HOUR_THRESHOLD_BUMP: f32 = 0.05;

/// Environment variable names recognized by [EngineOptions::from_env].
pub const ENV_VARS: [&str; 13] = [
    "WALK_SPEED_MS",
    "TIME_TOLERANCE_SEC",
    "MAX_CANDIDATE_WINDOW_SEC",
    "EMBED_FLOOR",
    "MATCH_THRESHOLD",
    "OUTFIT_MIN",
    "AMBIGUITY_GAP",
    "RUSH_HOUR_CANDIDATE_TRIGGER",
    "COOLDOWN_SEC",
    "IDLE_TIMEOUT_SEC",
    "FREQUENT_OUTFIT_THRESHOLD",
    "CANDIDATE_TOPK",
    "WORKER_COUNT",
];

/// Class that is used to configure a batch run.
///
/// All knobs are numeric, carry the operational defaults, and are validated as a whole
/// before any work begins - an out-of-range or mutually inconsistent set rejects the run.
///
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Fallback walking speed used to derive transit expectations from floor-plan distance.
    pub walk_speed_ms: f32,
    /// Fallback transit tolerance (τ) in seconds for pairs without annotated values.
    pub time_tolerance_sec: f32,
    /// Hard ceiling on the source-to-target time gap considered at all.
    pub max_candidate_window_sec: i64,
    /// Minimal embedding cosine similarity for a source to enter the candidate pool.
    pub embed_floor: f32,
    /// Minimal final score to accept a link.
    pub match_threshold: f32,
    /// Minimal outfit similarity to accept a link regardless of the final score.
    pub outfit_min: f32,
    /// Minimal margin between the best and second-best candidate.
    pub ambiguity_gap: f32,
    /// Pool size above which the per-target threshold is raised by [RUSH_HOUR_THRESHOLD_BUMP].
    pub rush_hour_candidate_trigger: usize,
    /// Per-visitor, per-pin suppression window after an accepted link.
    pub cooldown_sec: i64,
    /// Gap between consecutive chain steps that splits a journey.
    pub idle_timeout_sec: i64,
    /// Hourly fingerprint count above which an outfit is considered frequent.
    pub frequent_outfit_threshold: usize,
    /// Maximal number of candidates retained per target.
    pub candidate_topk: usize,
    /// Scoring worker pool size.
    pub worker_count: usize,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            walk_speed_ms: 1.2,
            time_tolerance_sec: 30.0,
            max_candidate_window_sec: 480,
            embed_floor: 0.75,
            match_threshold: 0.78,
            outfit_min: 0.70,
            ambiguity_gap: 0.04,
            rush_hour_candidate_trigger: 12,
            cooldown_sec: 15,
            idle_timeout_sec: 1800,
            frequent_outfit_threshold: 5,
            candidate_topk: 50,
            worker_count: num_cpus::get(),
        }
    }
}

impl EngineOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads the configuration from the environment, falling back to the defaults for
    /// variables that are not set. A present but unparsable variable is a configuration
    /// error - it never falls through to the default silently.
    ///
    pub fn from_env() -> Result<Self, Errors> {
        let mut opts = Self::default();

        opts.walk_speed_ms = read_var("WALK_SPEED_MS", opts.walk_speed_ms)?;
        opts.time_tolerance_sec = read_var("TIME_TOLERANCE_SEC", opts.time_tolerance_sec)?;
        opts.max_candidate_window_sec =
            read_var("MAX_CANDIDATE_WINDOW_SEC", opts.max_candidate_window_sec)?;
        opts.embed_floor = read_var("EMBED_FLOOR", opts.embed_floor)?;
        opts.match_threshold = read_var("MATCH_THRESHOLD", opts.match_threshold)?;
        opts.outfit_min = read_var("OUTFIT_MIN", opts.outfit_min)?;
        opts.ambiguity_gap = read_var("AMBIGUITY_GAP", opts.ambiguity_gap)?;
        opts.rush_hour_candidate_trigger = read_var(
            "RUSH_HOUR_CANDIDATE_TRIGGER",
            opts.rush_hour_candidate_trigger,
        )?;
        opts.cooldown_sec = read_var("COOLDOWN_SEC", opts.cooldown_sec)?;
        opts.idle_timeout_sec = read_var("IDLE_TIMEOUT_SEC", opts.idle_timeout_sec)?;
        opts.frequent_outfit_threshold =
            read_var("FREQUENT_OUTFIT_THRESHOLD", opts.frequent_outfit_threshold)?;
        opts.candidate_topk = read_var("CANDIDATE_TOPK", opts.candidate_topk)?;
        opts.worker_count = read_var("WORKER_COUNT", opts.worker_count)?;

        opts.validate()?;
        Ok(opts)
    }

    pub fn walk_speed_ms(mut self, v: f32) -> Self {
        self.walk_speed_ms = v;
        self
    }

    pub fn time_tolerance_sec(mut self, v: f32) -> Self {
        self.time_tolerance_sec = v;
        self
    }

    pub fn max_candidate_window_sec(mut self, v: i64) -> Self {
        self.max_candidate_window_sec = v;
        self
    }

    pub fn embed_floor(mut self, v: f32) -> Self {
        self.embed_floor = v;
        self
    }

    pub fn match_threshold(mut self, v: f32) -> Self {
        self.match_threshold = v;
        self
    }

    pub fn outfit_min(mut self, v: f32) -> Self {
        self.outfit_min = v;
        self
    }

    pub fn ambiguity_gap(mut self, v: f32) -> Self {
        self.ambiguity_gap = v;
        self
    }

    pub fn rush_hour_candidate_trigger(mut self, v: usize) -> Self {
        self.rush_hour_candidate_trigger = v;
        self
    }

    pub fn cooldown_sec(mut self, v: i64) -> Self {
        self.cooldown_sec = v;
        self
    }

    pub fn idle_timeout_sec(mut self, v: i64) -> Self {
        self.idle_timeout_sec = v;
        self
    }

    pub fn frequent_outfit_threshold(mut self, v: usize) -> Self {
        self.frequent_outfit_threshold = v;
        self
    }

    pub fn candidate_topk(mut self, v: usize) -> Self {
        self.candidate_topk = v;
        self
    }

    pub fn worker_count(mut self, v: usize) -> Self {
        self.worker_count = v;
        self
    }

    /// Validates the whole configuration. Invoked by the batch runner before any work
    /// begins; callers constructing options by hand may invoke it directly.
    ///
    pub fn validate(&self) -> Result<(), Errors> {
        fn unit(name: &str, v: f32) -> Result<(), Errors> {
            if !(0.0..=1.0).contains(&v) || !v.is_finite() {
                return Err(Errors::ConfigInvalid(format!(
                    "{name}={v} must lay within [0.0; 1.0]"
                )));
            }
            Ok(())
        }

        if !(self.walk_speed_ms > 0.0 && self.walk_speed_ms.is_finite()) {
            return Err(Errors::ConfigInvalid(format!(
                "WALK_SPEED_MS={} must be a positive number",
                self.walk_speed_ms
            )));
        }
        if !(self.time_tolerance_sec > 0.0 && self.time_tolerance_sec.is_finite()) {
            return Err(Errors::ConfigInvalid(format!(
                "TIME_TOLERANCE_SEC={} must be a positive number",
                self.time_tolerance_sec
            )));
        }
        if self.max_candidate_window_sec < 1 {
            return Err(Errors::ConfigInvalid(format!(
                "MAX_CANDIDATE_WINDOW_SEC={} must be at least 1",
                self.max_candidate_window_sec
            )));
        }
        unit("EMBED_FLOOR", self.embed_floor)?;
        unit("MATCH_THRESHOLD", self.match_threshold)?;
        unit("OUTFIT_MIN", self.outfit_min)?;
        unit("AMBIGUITY_GAP", self.ambiguity_gap)?;
        if self.match_threshold <= self.ambiguity_gap {
            return Err(Errors::ConfigInvalid(format!(
                "MATCH_THRESHOLD={} must exceed AMBIGUITY_GAP={}",
                self.match_threshold, self.ambiguity_gap
            )));
        }
        if self.match_threshold + RUSH_HOUR_THRESHOLD_BUMP > 1.0 {
            return Err(Errors::ConfigInvalid(format!(
                "MATCH_THRESHOLD={} leaves no room for the rush-hour bump",
                self.match_threshold
            )));
        }
        if self.rush_hour_candidate_trigger == 0 {
            return Err(Errors::ConfigInvalid(
                "RUSH_HOUR_CANDIDATE_TRIGGER must be positive".into(),
            ));
        }
        if !(10..=20).contains(&self.cooldown_sec) {
            return Err(Errors::ConfigInvalid(format!(
                "COOLDOWN_SEC={} must lay within [10; 20]",
                self.cooldown_sec
            )));
        }
        if self.idle_timeout_sec <= 0 {
            return Err(Errors::ConfigInvalid(format!(
                "IDLE_TIMEOUT_SEC={} must be positive",
                self.idle_timeout_sec
            )));
        }
        if self.frequent_outfit_threshold == 0 {
            return Err(Errors::ConfigInvalid(
                "FREQUENT_OUTFIT_THRESHOLD must be positive".into(),
            ));
        }
        if self.candidate_topk == 0 {
            return Err(Errors::ConfigInvalid("CANDIDATE_TOPK must be positive".into()));
        }
        if self.worker_count == 0 {
            return Err(Errors::ConfigInvalid("WORKER_COUNT must be positive".into()));
        }
        Ok(())
    }

    /// The effective match threshold for a target, accounting for rush hour.
    pub fn effective_threshold(&self, rush_hour: bool) -> f32 {
        if rush_hour {
            self.match_threshold + RUSH_HOUR_THRESHOLD_BUMP
        } else {
            self.match_threshold
        }
    }
}

fn read_var<T: std::str::FromStr>(name: &str, default: T) -> Result<T, Errors> {
    match env::var(name) {
        Ok(raw) => raw
            .parse::<T>()
            .map_err(|_| Errors::ConfigInvalid(format!("{name}={raw} cannot be parsed"))),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use crate::config::EngineOptions;

    #[test]
    fn defaults_are_valid() {
        assert!(EngineOptions::default().validate().is_ok());
    }

    #[test]
    fn cooldown_range_is_enforced() {
        assert!(EngineOptions::new().cooldown_sec(9).validate().is_err());
        assert!(EngineOptions::new().cooldown_sec(21).validate().is_err());
        assert!(EngineOptions::new().cooldown_sec(10).validate().is_ok());
        assert!(EngineOptions::new().cooldown_sec(20).validate().is_ok());
    }

    #[test]
    fn inconsistent_thresholds_are_rejected() {
        let opts = EngineOptions::new().match_threshold(0.03).ambiguity_gap(0.04);
        assert!(opts.validate().is_err());

        let opts = EngineOptions::new().match_threshold(0.97);
        assert!(opts.validate().is_err());
    }

    #[test]
    fn out_of_range_scores_are_rejected() {
        assert!(EngineOptions::new().embed_floor(1.5).validate().is_err());
        assert!(EngineOptions::new().outfit_min(-0.1).validate().is_err());
        assert!(EngineOptions::new().walk_speed_ms(0.0).validate().is_err());
    }

    #[test]
    fn rush_hour_raises_threshold() {
        let opts = EngineOptions::default();
        assert!(opts.effective_threshold(true) > opts.effective_threshold(false));
    }
}
