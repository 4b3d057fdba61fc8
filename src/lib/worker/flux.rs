use crate::{
    detection::{BoundingBox, Detection},
    stats::{ClassCounts, CycleCounts},
};

pub const DEFAULT_IOU_THRESHOLD: f64 = 0.5;

/// Splits one cycle of detections into density and flux.
///
/// A detection overlapping any box of the previous cycle by more than the
/// threshold is a vehicle that has not moved (queued at a light, parked) and is
/// left out of flux. Matching is greedy and only looks one cycle back; two new
/// vehicles can both match the same old box.
#[derive(Clone, Debug)]
pub struct FluxReducer {
    previous: Vec<BoundingBox>,
    threshold: f64,
}

impl Default for FluxReducer {
    fn default() -> Self {
        Self::new(DEFAULT_IOU_THRESHOLD)
    }
}

impl FluxReducer {
    pub fn new(threshold: f64) -> Self {
        Self {
            previous: vec![],
            threshold,
        }
    }

    pub fn previous(&self) -> &[BoundingBox] {
        &self.previous
    }

    pub fn reduce(&mut self, detections: &[Detection]) -> CycleCounts {
        let mut density = ClassCounts::default();
        let mut flux = ClassCounts::default();

        for detection in detections {
            density.add_one(detection.class);

            let is_static = self
                .previous
                .iter()
                .any(|previous| detection.bbox.iou(previous) > self.threshold);

            if !is_static {
                flux.add_one(detection.class);
            }
        }

        self.previous = detections.iter().map(|detection| detection.bbox).collect();

        CycleCounts { density, flux }
    }

    pub fn forget(&mut self) {
        self.previous.clear();
    }
}
