use nalgebra::Vector3;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// A single neighbor image produced by a query.
///
/// The same particle index may appear in several records when more than one
/// of its periodic images lies within range; the `(index, shift)` pair, and
/// equivalently the displacement, is unique per record. The displacement and
/// shift satisfy `displacement = position[index] + shift · cell − query_point`
/// against the positions the structure was prepared from.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NeighborRecord {
    /// Index of the neighbor particle.
    pub index: usize,
    /// Squared distance from the query point to the neighbor image.
    pub distance_squared: f64,
    /// Vector from the query point to the neighbor image.
    pub displacement: Vector3<f64>,
    /// Whole-cell periodic steps selecting the neighbor image.
    pub shift: Vector3<i32>,
}

impl NeighborRecord {
    pub fn distance(&self) -> f64 {
        self.distance_squared.sqrt()
    }
}

impl Eq for NeighborRecord {}

impl PartialOrd for NeighborRecord {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for NeighborRecord {
    /// Orders by squared distance, breaking ties by particle index and then
    /// shift vector so that equal-distance neighbors sort deterministically.
    fn cmp(&self, other: &Self) -> Ordering {
        self.distance_squared
            .partial_cmp(&other.distance_squared)
            .unwrap_or(Ordering::Equal)
            .then_with(|| self.index.cmp(&other.index))
            .then_with(|| {
                (self.shift.x, self.shift.y, self.shift.z).cmp(&(
                    other.shift.x,
                    other.shift.y,
                    other.shift.z,
                ))
            })
    }
}
