//! Experiment tracker mirroring.
//!
//! The final-loss logger can mirror its values to an external experiment
//! tracker in addition to the scalar sink. The tracker is constructed by the
//! caller; this module only defines the seam and two implementations:
//!
//! - [`RecordingTracker`]: keeps every logged batch in memory
//! - `RerunTracker`: streams scalars to a [Rerun](https://rerun.io) viewer
//!   (requires the `rerun` feature)

use std::collections::BTreeMap;

use crate::error::Result;

/// External experiment-tracking client.
pub trait ExperimentTracker {
    /// Log a batch of named values at `step`.
    ///
    /// # Errors
    ///
    /// Returns an error if the tracker rejects the batch.
    fn log(&mut self, values: &BTreeMap<String, f64>, step: u64) -> Result<()>;
}

impl<T: ExperimentTracker + ?Sized> ExperimentTracker for &mut T {
    fn log(&mut self, values: &BTreeMap<String, f64>, step: u64) -> Result<()> {
        (**self).log(values, step)
    }
}

impl<T: ExperimentTracker + ?Sized> ExperimentTracker for Box<T> {
    fn log(&mut self, values: &BTreeMap<String, f64>, step: u64) -> Result<()> {
        (**self).log(values, step)
    }
}

/// In-memory tracker.
#[derive(Debug, Clone, Default)]
pub struct RecordingTracker {
    batches: Vec<(u64, BTreeMap<String, f64>)>,
}

impl RecordingTracker {
    /// Create an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every logged batch with its step, in call order.
    #[must_use]
    pub fn batches(&self) -> &[(u64, BTreeMap<String, f64>)] {
        &self.batches
    }

    /// The most recent batch.
    #[must_use]
    pub fn last(&self) -> Option<&(u64, BTreeMap<String, f64>)> {
        self.batches.last()
    }
}

impl ExperimentTracker for RecordingTracker {
    fn log(&mut self, values: &BTreeMap<String, f64>, step: u64) -> Result<()> {
        self.batches.push((step, values.clone()));
        Ok(())
    }
}

#[cfg(feature = "rerun")]
pub use self::rerun_backend::RerunTracker;

#[cfg(feature = "rerun")]
mod rerun_backend {
    use std::collections::BTreeMap;

    use rerun::{RecordingStream, RecordingStreamBuilder};

    use super::ExperimentTracker;
    use crate::error::{AnalyzerError, Result};

    /// Streams each value as a scalar entity on the `step` timeline.
    pub struct RerunTracker {
        rec: RecordingStream,
    }

    impl RerunTracker {
        /// Connect to a running viewer.
        ///
        /// # Errors
        ///
        /// Returns an error if the recording stream cannot be created.
        pub fn connect(app_id: &str) -> Result<Self> {
            let rec = RecordingStreamBuilder::new(app_id)
                .connect_tcp()
                .map_err(|e| AnalyzerError::tracker(e.to_string()))?;
            Ok(Self { rec })
        }

        /// Record to an `.rrd` file.
        ///
        /// # Errors
        ///
        /// Returns an error if the file cannot be created.
        pub fn save_to_file(app_id: &str, path: impl AsRef<std::path::Path>) -> Result<Self> {
            let rec = RecordingStreamBuilder::new(app_id)
                .save(path)
                .map_err(|e| AnalyzerError::tracker(e.to_string()))?;
            Ok(Self { rec })
        }

        /// Wrap an existing stream.
        #[must_use]
        pub fn from_stream(rec: RecordingStream) -> Self {
            Self { rec }
        }
    }

    impl ExperimentTracker for RerunTracker {
        fn log(&mut self, values: &BTreeMap<String, f64>, step: u64) -> Result<()> {
            self.rec.set_time_sequence("step", step as i64);
            for (tag, value) in values {
                self.rec
                    .log(tag.as_str(), &rerun::Scalar::new(*value))
                    .map_err(|e| AnalyzerError::tracker(e.to_string()))?;
            }
            Ok(())
        }
    }
}

/// Stub when the `rerun` feature is disabled.
#[cfg(not(feature = "rerun"))]
pub struct RerunTracker;

#[cfg(not(feature = "rerun"))]
impl RerunTracker {
    /// Always fails: the crate was built without the `rerun` feature.
    ///
    /// # Errors
    ///
    /// Always returns [`AnalyzerError::TrackerUnavailable`](crate::AnalyzerError::TrackerUnavailable).
    pub fn connect(_app_id: &str) -> Result<Self> {
        Err(crate::error::AnalyzerError::TrackerUnavailable(
            "rerun feature not enabled, add `rerun` feature to Cargo.toml".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_tracker_keeps_batches() {
        let mut tracker = RecordingTracker::new();
        let mut values = BTreeMap::new();
        values.insert("train/loss/total".to_string(), 1.5);
        tracker.log(&values, 10).unwrap();

        values.insert("train/loss/task".to_string(), 1.0);
        tracker.log(&values, 20).unwrap();

        assert_eq!(tracker.batches().len(), 2);
        let (step, last) = tracker.last().unwrap();
        assert_eq!(*step, 20);
        assert_eq!(last.len(), 2);
    }

    #[test]
    #[cfg(not(feature = "rerun"))]
    fn test_stub_returns_unavailable() {
        let result = RerunTracker::connect("test");
        assert!(matches!(
            result,
            Err(crate::error::AnalyzerError::TrackerUnavailable(_))
        ));
    }
}
