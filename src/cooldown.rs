use crate::tracklet::{PinId, TrackletId};
use std::collections::HashMap;

/// Per-visitor, per-pin suppression of rapid repeated links.
///
/// Overlapping camera views make a walking person oscillate between two pins; after a
/// link lands a visitor on a pin, further links onto the same pin for the same visitor
/// are rejected until the window passes. Visitors are identified by their chain head
/// tracklet, which is stable throughout a run.
///
/// The registry is owned by the arbitration coordinator; scoring workers never touch it.
///
#[derive(Debug)]
pub struct CooldownRegistry {
    window_sec: i64,
    last_links: HashMap<(TrackletId, PinId), i64>,
}

impl CooldownRegistry {
    pub fn new(window_sec: i64) -> Self {
        assert!(window_sec > 0, "Cooldown window must be a positive number");
        Self {
            window_sec,
            last_links: HashMap::new(),
        }
    }

    /// Whether a link for `visitor_root` onto `pin` at `at` is outside the window.
    pub fn allows(&self, visitor_root: TrackletId, pin: PinId, at: i64) -> bool {
        match self.last_links.get(&(visitor_root, pin)) {
            Some(last) => at - last >= self.window_sec,
            None => true,
        }
    }

    pub fn record(&mut self, visitor_root: TrackletId, pin: PinId, at: i64) {
        self.last_links.insert((visitor_root, pin), at);
    }
}
