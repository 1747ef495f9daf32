use std::collections::HashSet;

use parking_lot::Mutex;

/// Tracks which anomaly shapes have already been reported, so a recurring
/// bad record shape is logged once rather than once per query.
#[derive(Debug, Default)]
pub struct AnomalyLog {
    seen: Mutex<HashSet<(String, String)>>,
}

impl AnomalyLog {
    pub fn new() -> Self { Self::default() }

    /// True the first time `(origin, shape)` is observed.
    pub fn first_sighting(&self, origin: &str, shape: &str) -> bool {
        self.seen.lock().insert((origin.to_string(), shape.to_string()))
    }

    pub fn distinct_shapes(&self) -> usize { self.seen.lock().len() }
}
