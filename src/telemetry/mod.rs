//! Telemetry adapter — speed/engine-state samples from the vehicle bus.
//!
//! The engine consumes telemetry, it never owns the producer. This module
//! defines the sample type, a source trait abstracting where samples come
//! from (live platform feed, scripted replay), and the motion debouncer
//! that turns raw samples into auto-switch edges.

mod debounce;

pub use debounce::{MotionDebouncer, MotionEdge};

use crate::types::GpsFix;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// Samples
// ============================================================================

/// One timestamped telemetry sample, pushed at >= 1 Hz while the engine runs.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct TelemetrySample {
    pub timestamp: DateTime<Utc>,
    pub speed_mph: f64,
    pub engine_on: bool,
    pub gps: Option<GpsFix>,
    /// Source confidence 0.0–1.0; low-confidence samples never trigger a switch
    pub confidence: f64,
}

/// Events produced by a telemetry source.
pub enum SampleEvent {
    /// A sample was read.
    Sample(TelemetrySample),
    /// Source reached end of data (EOF for replay, permanent disconnect live).
    Eof,
}

/// Trait abstracting where telemetry samples come from.
///
/// Implementations handle pacing and reconnection internally. The session
/// loop calls [`next_sample`](TelemetrySource::next_sample) in a `select!`
/// with cancellation.
#[async_trait]
pub trait TelemetrySource: Send + 'static {
    /// Read the next sample from the source.
    async fn next_sample(&mut self) -> Result<SampleEvent>;

    /// Human-readable name for logging (e.g. "replay", "canbus").
    fn source_name(&self) -> &str;
}

// ============================================================================
// Replay Source (scripted / simulation)
// ============================================================================

/// Replays pre-loaded samples with optional inter-sample delay.
pub struct ReplaySource {
    samples: std::vec::IntoIter<TelemetrySample>,
    delay_ms: u64,
    yielded_first: bool,
}

impl ReplaySource {
    pub fn new(samples: Vec<TelemetrySample>, delay_ms: u64) -> Self {
        Self {
            samples: samples.into_iter(),
            delay_ms,
            yielded_first: false,
        }
    }
}

#[async_trait]
impl TelemetrySource for ReplaySource {
    async fn next_sample(&mut self) -> Result<SampleEvent> {
        // No delay before the first sample
        if self.yielded_first && self.delay_ms > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(self.delay_ms)).await;
        }
        self.yielded_first = true;

        Ok(match self.samples.next() {
            Some(sample) => SampleEvent::Sample(sample),
            None => SampleEvent::Eof,
        })
    }

    fn source_name(&self) -> &str {
        "replay"
    }
}

/// Channel-backed source for live platform feeds and tests.
///
/// The platform side holds the `mpsc::Sender` and pushes samples as they
/// arrive from the vehicle bus; a dropped sender reads as EOF.
pub struct ChannelSource {
    rx: tokio::sync::mpsc::Receiver<TelemetrySample>,
}

impl ChannelSource {
    pub fn new(rx: tokio::sync::mpsc::Receiver<TelemetrySample>) -> Self {
        Self { rx }
    }
}

#[async_trait]
impl TelemetrySource for ChannelSource {
    async fn next_sample(&mut self) -> Result<SampleEvent> {
        Ok(match self.rx.recv().await {
            Some(sample) => SampleEvent::Sample(sample),
            None => SampleEvent::Eof,
        })
    }

    fn source_name(&self) -> &str {
        "channel"
    }
}

/// Reads JSON-encoded samples from stdin, one per line.
///
/// Lets a platform bridge or simulator pipe telemetry straight in:
/// `{"timestamp":"...","speed_mph":42.0,"engine_on":true,"gps":null,"confidence":0.98}`
pub struct StdinSource {
    lines: tokio::io::Lines<tokio::io::BufReader<tokio::io::Stdin>>,
}

impl StdinSource {
    pub fn new() -> Self {
        use tokio::io::AsyncBufReadExt;
        Self {
            lines: tokio::io::BufReader::new(tokio::io::stdin()).lines(),
        }
    }
}

impl Default for StdinSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TelemetrySource for StdinSource {
    async fn next_sample(&mut self) -> Result<SampleEvent> {
        loop {
            match self.lines.next_line().await? {
                None => return Ok(SampleEvent::Eof),
                Some(line) if line.trim().is_empty() => continue,
                Some(line) => match serde_json::from_str::<TelemetrySample>(&line) {
                    Ok(sample) => return Ok(SampleEvent::Sample(sample)),
                    Err(e) => {
                        tracing::warn!(error = %e, "Skipping malformed telemetry line");
                    }
                },
            }
        }
    }

    fn source_name(&self) -> &str {
        "stdin"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(ts: DateTime<Utc>, speed: f64) -> TelemetrySample {
        TelemetrySample {
            timestamp: ts,
            speed_mph: speed,
            engine_on: true,
            gps: None,
            confidence: 1.0,
        }
    }

    #[tokio::test]
    async fn test_replay_source_yields_then_eof() {
        let now = Utc::now();
        let mut source = ReplaySource::new(vec![sample(now, 10.0), sample(now, 20.0)], 0);

        assert!(matches!(
            source.next_sample().await.unwrap(),
            SampleEvent::Sample(s) if s.speed_mph == 10.0
        ));
        assert!(matches!(
            source.next_sample().await.unwrap(),
            SampleEvent::Sample(s) if s.speed_mph == 20.0
        ));
        assert!(matches!(source.next_sample().await.unwrap(), SampleEvent::Eof));
    }

    #[tokio::test]
    async fn test_channel_source_eof_on_drop() {
        let (tx, rx) = tokio::sync::mpsc::channel(4);
        let mut source = ChannelSource::new(rx);

        tx.send(sample(Utc::now(), 30.0)).await.unwrap();
        drop(tx);

        assert!(matches!(
            source.next_sample().await.unwrap(),
            SampleEvent::Sample(_)
        ));
        assert!(matches!(source.next_sample().await.unwrap(), SampleEvent::Eof));
    }
}
