/// Limits how often a plugin runs, based on frame timestamps
#[derive(Debug, Clone)]
pub struct FpsThrottle {
    interval_ns: u64,
    last_run: Option<u64>,
}

impl FpsThrottle {
    /// `target_fps` must be positive and finite.
    pub fn new(target_fps: f64) -> Self {
        Self {
            interval_ns: (1e9 / target_fps) as u64,
            last_run: None,
        }
    }

    /// Whether a frame captured at `timestamp_ns` should be processed.
    /// Marks the frame as run when it returns `true`.
    pub fn should_run(&mut self, timestamp_ns: u64) -> bool {
        let due = match self.last_run {
            None => true,
            // Timestamps going backwards mean the source restarted
            Some(last) if timestamp_ns < last => true,
            Some(last) => timestamp_ns - last >= self.interval_ns,
        };
        if due {
            self.last_run = Some(timestamp_ns);
        }
        due
    }
}
