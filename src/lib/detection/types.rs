use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum VehicleClass {
    Car,
    Motorcycle,
}

impl VehicleClass {
    /// Maps a COCO class id onto the two vehicle classes we count.
    /// Bicycles ride with motorcycles, buses and trucks with cars.
    pub fn from_coco_id(class_id: u32) -> Option<Self> {
        match class_id {
            1 | 3 => Some(VehicleClass::Motorcycle),
            2 | 5 | 7 => Some(VehicleClass::Car),
            _ => None,
        }
    }
}

impl std::fmt::Display for VehicleClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VehicleClass::Car => write!(f, "car"),
            VehicleClass::Motorcycle => write!(f, "motorcycle"),
        }
    }
}

/// Axis-aligned box in pixel space, corners inclusive.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct BoundingBox {
    pub x1: i32,
    pub y1: i32,
    pub x2: i32,
    pub y2: i32,
}

impl BoundingBox {
    pub fn new(x1: i32, y1: i32, x2: i32, y2: i32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    /// Area counted in whole pixels: a box from 0 to 10 spans 11 pixels.
    pub fn area(&self) -> i64 {
        let width = (self.x2 as i64 - self.x1 as i64 + 1).max(0);
        let height = (self.y2 as i64 - self.y1 as i64 + 1).max(0);
        width * height
    }

    pub fn iou(&self, other: &BoundingBox) -> f64 {
        let x_a = self.x1.max(other.x1) as i64;
        let y_a = self.y1.max(other.y1) as i64;
        let x_b = self.x2.min(other.x2) as i64;
        let y_b = self.y2.min(other.y2) as i64;

        let intersection = (x_b - x_a + 1).max(0) * (y_b - y_a + 1).max(0);
        if intersection == 0 {
            return 0.0;
        }

        let union = self.area() + other.area() - intersection;
        if union <= 0 {
            return 0.0;
        }

        intersection as f64 / union as f64
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct Detection {
    #[serde(rename = "box")]
    pub bbox: BoundingBox,
    pub class: VehicleClass,
    pub confidence: f32,
}

impl Detection {
    pub fn new(bbox: BoundingBox, class: VehicleClass, confidence: f32) -> Self {
        Self {
            bbox,
            class,
            confidence,
        }
    }
}
