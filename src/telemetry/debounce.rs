//! Motion debouncer — sustained-speed detection for duty auto-switch.
//!
//! A single sample never flips duty status. Motion (speed over the
//! threshold) or a stop (at/under the threshold with the engine running)
//! must be sustained for the full debounce window before an edge fires.
//! Samples below the confidence floor are discarded: they neither extend
//! nor reset the current run.

use super::TelemetrySample;
use chrono::{DateTime, Utc};

/// Edge emitted when a sustained regime change completes the debounce window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MotionEdge {
    /// Speed held above the threshold for the full window.
    DrivingDetected,
    /// Speed held at/below the threshold (engine on) for the full window.
    StoppedDetected,
}

/// Which side of the speed threshold the current run is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Regime {
    Moving,
    Stopped,
}

/// Tracks contiguous same-regime samples and fires an edge once the run
/// spans the debounce window.
#[derive(Debug)]
pub struct MotionDebouncer {
    speed_threshold_mph: f64,
    window_secs: u64,
    min_confidence: f64,
    run: Option<(Regime, DateTime<Utc>)>,
    /// Regime of the last fired edge, to avoid re-firing inside one run
    fired: Option<Regime>,
}

impl MotionDebouncer {
    pub fn new(speed_threshold_mph: f64, window_secs: u64, min_confidence: f64) -> Self {
        Self {
            speed_threshold_mph,
            window_secs,
            min_confidence,
            run: None,
            fired: None,
        }
    }

    /// Feed one sample; returns an edge when a sustained change completes.
    pub fn update(&mut self, sample: &TelemetrySample) -> Option<MotionEdge> {
        if sample.confidence < self.min_confidence {
            // Sensor glitch: not evidence for either regime
            return None;
        }
        if !sample.engine_on {
            // Engine off ends any run; stop detection requires engine running
            self.run = None;
            self.fired = None;
            return None;
        }

        let regime = if sample.speed_mph > self.speed_threshold_mph {
            Regime::Moving
        } else {
            Regime::Stopped
        };

        match self.run {
            Some((current, start)) if current == regime => {
                let held = (sample.timestamp - start).num_seconds();
                if held >= self.window_secs as i64 && self.fired != Some(regime) {
                    self.fired = Some(regime);
                    return Some(match regime {
                        Regime::Moving => MotionEdge::DrivingDetected,
                        Regime::Stopped => MotionEdge::StoppedDetected,
                    });
                }
                None
            }
            _ => {
                // Regime flipped (or first sample): start a new run
                self.run = Some((regime, sample.timestamp));
                None
            }
        }
    }

    /// Reset all run state (called after a manual or forced transition so
    /// stale telemetry history cannot fire a contradictory edge).
    pub fn reset(&mut self) {
        self.run = None;
        self.fired = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn sample(base: DateTime<Utc>, offset_secs: i64, speed: f64) -> TelemetrySample {
        TelemetrySample {
            timestamp: base + Duration::seconds(offset_secs),
            speed_mph: speed,
            engine_on: true,
            gps: None,
            confidence: 1.0,
        }
    }

    #[test]
    fn test_sustained_motion_fires_after_window() {
        let base = Utc::now();
        let mut deb = MotionDebouncer::new(5.0, 60, 0.5);

        for t in 0..60 {
            assert_eq!(deb.update(&sample(base, t, 30.0)), None);
        }
        assert_eq!(
            deb.update(&sample(base, 60, 30.0)),
            Some(MotionEdge::DrivingDetected)
        );
        // Does not re-fire within the same run
        assert_eq!(deb.update(&sample(base, 61, 30.0)), None);
    }

    #[test]
    fn test_brief_motion_does_not_fire() {
        let base = Utc::now();
        let mut deb = MotionDebouncer::new(5.0, 60, 0.5);

        for t in 0..30 {
            assert_eq!(deb.update(&sample(base, t, 30.0)), None);
        }
        // Drops below threshold before the window completes
        assert_eq!(deb.update(&sample(base, 30, 2.0)), None);
        for t in 31..60 {
            assert_eq!(deb.update(&sample(base, t, 30.0)), None);
        }
        // The moving run restarted at t=31, so t=60 is not enough
        assert_eq!(deb.update(&sample(base, 60, 30.0)), None);
    }

    #[test]
    fn test_low_confidence_sample_is_ignored() {
        let base = Utc::now();
        let mut deb = MotionDebouncer::new(5.0, 60, 0.5);

        for t in 0..30 {
            deb.update(&sample(base, t, 30.0));
        }
        // A low-confidence stop reading mid-run must not reset the run
        let mut glitch = sample(base, 30, 0.0);
        glitch.confidence = 0.1;
        assert_eq!(deb.update(&glitch), None);

        for t in 31..60 {
            assert_eq!(deb.update(&sample(base, t, 30.0)), None);
        }
        assert_eq!(
            deb.update(&sample(base, 60, 30.0)),
            Some(MotionEdge::DrivingDetected)
        );
    }

    #[test]
    fn test_sustained_stop_with_engine_on() {
        let base = Utc::now();
        let mut deb = MotionDebouncer::new(5.0, 60, 0.5);

        // Get into the moving regime first
        for t in 0..=60 {
            deb.update(&sample(base, t, 40.0));
        }
        // Now hold a stop
        for t in 61..121 {
            assert_eq!(deb.update(&sample(base, t, 0.0)), None);
        }
        assert_eq!(
            deb.update(&sample(base, 121, 0.0)),
            Some(MotionEdge::StoppedDetected)
        );
    }

    #[test]
    fn test_engine_off_clears_run() {
        let base = Utc::now();
        let mut deb = MotionDebouncer::new(5.0, 60, 0.5);

        for t in 0..59 {
            deb.update(&sample(base, t, 30.0));
        }
        let mut off = sample(base, 59, 30.0);
        off.engine_on = false;
        assert_eq!(deb.update(&off), None);
        // Run restarted: one more sample is not enough to fire
        assert_eq!(deb.update(&sample(base, 60, 30.0)), None);
    }
}
