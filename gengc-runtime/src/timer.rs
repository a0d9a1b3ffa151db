use std::time::Instant;

pub struct Timer {
    active: bool,
    timestamp: Instant,
}

impl Timer {
    pub fn new(active: bool) -> Timer {
        Timer {
            active,
            timestamp: Instant::now(),
        }
    }

    pub fn start() -> Timer {
        Timer::new(true)
    }

    /// milliseconds since creation or the last call to `stop`
    pub fn stop(&mut self) -> f32 {
        assert!(self.active);
        let curr = Instant::now();
        let last = self.timestamp;
        self.timestamp = curr;

        in_ms((curr - last).as_nanos() as u64)
    }
}

fn in_ms(ns: u64) -> f32 {
    (ns as f32) / 1000.0 / 1000.0
}
