pub mod types;

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::*;

use crate::frame::Frame;

pub use types::{BoundingBox, Detection, VehicleClass};

/// Black-box object detector. Given one frame, returns every vehicle found in it.
#[async_trait]
pub trait Detector: Send + Sync {
    async fn detect(&self, frame: &Frame) -> Result<Vec<Detection>>;
}

/// One detector instance shared by every worker.
///
/// The lock is held only around the inference call, acquisition and
/// publishing are never serialized behind it.
#[derive(Clone)]
pub struct SharedDetector {
    inner: Arc<Mutex<Box<dyn Detector>>>,
}

impl SharedDetector {
    pub fn new(detector: impl Detector + 'static) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Box::new(detector))),
        }
    }

    /// Runs inference, swallowing adapter failures as an empty result.
    #[instrument(level = "trace", skip_all, fields(source_id = %frame.source_id))]
    pub async fn detect_or_empty(&self, frame: &Frame, confidence_threshold: f32) -> Vec<Detection> {
        let result = {
            let detector = self.inner.lock().await;
            detector.detect(frame).await
        };

        match result {
            Ok(detections) => detections
                .into_iter()
                .filter(|detection| detection.confidence >= confidence_threshold)
                .collect(),
            Err(error) => {
                error!(
                    "Inference failed for source {:?}: {error:#}",
                    frame.source_id
                );
                vec![]
            }
        }
    }
}

impl std::fmt::Debug for SharedDetector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedDetector").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use tracing_test::traced_test;

    struct Failing;

    #[async_trait]
    impl Detector for Failing {
        async fn detect(&self, _frame: &Frame) -> Result<Vec<Detection>> {
            Err(anyhow!("model exploded"))
        }
    }

    struct Fixed(Vec<Detection>);

    #[async_trait]
    impl Detector for Fixed {
        async fn detect(&self, _frame: &Frame) -> Result<Vec<Detection>> {
            Ok(self.0.clone())
        }
    }

    #[tokio::test]
    #[traced_test]
    async fn failure_is_treated_as_no_detections() {
        let detector = SharedDetector::new(Failing);
        let frame = Frame::empty("cam-1");

        assert!(detector.detect_or_empty(&frame, 0.0).await.is_empty());
        assert!(logs_contain("model exploded"));
    }

    #[tokio::test]
    async fn low_confidence_detections_are_dropped() {
        let detector = SharedDetector::new(Fixed(vec![
            Detection::new(BoundingBox::new(0, 0, 10, 10), VehicleClass::Car, 0.05),
            Detection::new(BoundingBox::new(20, 20, 30, 30), VehicleClass::Car, 0.8),
        ]));
        let frame = Frame::empty("cam-1");

        let detections = detector.detect_or_empty(&frame, 0.1).await;
        assert_eq!(detections.len(), 1);
        assert_eq!(detections[0].confidence, 0.8);
    }
}
