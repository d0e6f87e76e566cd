use super::cell::CellGeometry;
use itertools::iproduct;
use nalgebra::{Point3, Vector3};

/// A candidate periodic image translation.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageShift {
    /// Whole-cell steps along each cell axis; zero on non-periodic axes.
    pub steps: Vector3<i32>,
    /// Cartesian translation corresponding to `steps` (`matrix · steps`).
    pub translation: Vector3<f64>,
}

/// Enumerates the periodic image shifts that could place a particle image
/// within a given search radius of a query point.
///
/// The step range per periodic axis is derived from the cell's reciprocal
/// geometry ([`CellGeometry::face_spacing`]), so sheared cells get the wider
/// range they need, and radii larger than one cell repeat grow the range
/// instead of truncating it. Non-periodic axes only ever contribute step zero.
#[derive(Debug, Clone)]
pub struct PeriodicImageResolver {
    shifts: Vec<ImageShift>,
    max_steps: [i32; 3],
}

impl PeriodicImageResolver {
    pub fn new(cell: &CellGeometry, radius: f64) -> Self {
        let mut max_steps = [0i32; 3];
        for axis in 0..3 {
            if cell.is_periodic(axis) {
                max_steps[axis] = (radius / cell.face_spacing(axis)).floor() as i32 + 1;
            }
        }

        let shifts = iproduct!(
            -max_steps[0]..=max_steps[0],
            -max_steps[1]..=max_steps[1],
            -max_steps[2]..=max_steps[2]
        )
        .map(|(a, b, c)| {
            let steps = Vector3::new(a, b, c);
            ImageShift {
                translation: cell.matrix() * steps.cast::<f64>(),
                steps,
            }
        })
        .collect();

        Self { shifts, max_steps }
    }

    /// All candidate shifts, in lexicographic step order.
    pub fn candidate_shifts(&self) -> &[ImageShift] {
        &self.shifts
    }

    pub fn max_steps(&self) -> [i32; 3] {
        self.max_steps
    }

    /// Vector from the query point to the shifted image of `candidate`.
    pub fn displacement(
        query: &Point3<f64>,
        candidate: &Point3<f64>,
        shift: &ImageShift,
    ) -> Vector3<f64> {
        (candidate - query) + shift.translation
    }
}
