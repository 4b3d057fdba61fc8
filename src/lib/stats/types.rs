use serde::{Deserialize, Serialize};

use crate::detection::VehicleClass;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct ClassCounts {
    pub cars: u64,
    pub motors: u64,
}

impl ClassCounts {
    pub fn total(&self) -> u64 {
        self.cars + self.motors
    }

    pub fn add_one(&mut self, class: VehicleClass) {
        match class {
            VehicleClass::Car => self.cars += 1,
            VehicleClass::Motorcycle => self.motors += 1,
        }
    }
}

impl std::ops::AddAssign for ClassCounts {
    fn add_assign(&mut self, other: Self) {
        self.cars += other.cars;
        self.motors += other.motors;
    }
}

/// One sampling cycle of one source.
///
/// `density_*` is what was on screen, `flux_*` is what arrived since the previous
/// cycle. Only flux is summed into throughput.
#[derive(Clone, Copy, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct HistoryPoint {
    pub ts: f64,
    pub density_total: u64,
    pub density_cars: u64,
    pub density_motors: u64,
    pub flux_total: u64,
    pub flux_cars: u64,
    pub flux_motors: u64,
}

impl HistoryPoint {
    pub fn new(ts: f64, density: ClassCounts, flux: ClassCounts) -> Self {
        Self {
            ts,
            density_total: density.total(),
            density_cars: density.cars,
            density_motors: density.motors,
            flux_total: flux.total(),
            flux_cars: flux.cars,
            flux_motors: flux.motors,
        }
    }

    pub fn density(&self) -> ClassCounts {
        ClassCounts {
            cars: self.density_cars,
            motors: self.density_motors,
        }
    }

    pub fn flux(&self) -> ClassCounts {
        ClassCounts {
            cars: self.flux_cars,
            motors: self.flux_motors,
        }
    }

    pub fn is_consistent(&self) -> bool {
        self.flux_cars + self.flux_motors == self.flux_total
            && self.density_cars + self.density_motors == self.density_total
            && self.flux_total <= self.density_total
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub enum SourceStatus {
    Online,
    #[default]
    Offline,
}

/// The result of reducing one cycle of detections.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CycleCounts {
    pub density: ClassCounts,
    pub flux: ClassCounts,
}

/// Sums of flux over a set of points, as read back from the durable store.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct FluxTotals {
    pub flux: u64,
    pub cars: u64,
    pub motors: u64,
    pub points: u64,
}
