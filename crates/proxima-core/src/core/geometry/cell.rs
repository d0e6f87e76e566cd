use nalgebra::{Matrix3, Point3, Vector3};
use thiserror::Error;

/// Determinant magnitude below which a cell matrix is treated as singular.
const DEGENERACY_EPSILON: f64 = 1e-12;

#[derive(Debug, Error, Clone, Copy, PartialEq)]
#[error("simulation cell matrix is degenerate (determinant {determinant:e})")]
pub struct DegenerateCellError {
    pub determinant: f64,
}

/// Geometry of a simulation cell: three edge vectors, an origin, and a
/// periodicity flag per cell axis.
///
/// The edge vectors are the columns of `matrix`, so the cell may be triclinic.
/// The inverse matrix and volume are computed once at construction; a matrix
/// without a usable inverse is rejected as [`DegenerateCellError`].
#[derive(Debug, Clone, PartialEq)]
pub struct CellGeometry {
    matrix: Matrix3<f64>,
    inverse: Matrix3<f64>,
    origin: Point3<f64>,
    pbc: [bool; 3],
    volume: f64,
}

impl CellGeometry {
    pub fn new(
        matrix: Matrix3<f64>,
        origin: Point3<f64>,
        pbc: [bool; 3],
    ) -> Result<Self, DegenerateCellError> {
        let determinant = matrix.determinant();
        if !determinant.is_finite() || determinant.abs() < DEGENERACY_EPSILON {
            return Err(DegenerateCellError { determinant });
        }
        let inverse = matrix
            .try_inverse()
            .ok_or(DegenerateCellError { determinant })?;

        Ok(Self {
            matrix,
            inverse,
            origin,
            pbc,
            volume: determinant.abs(),
        })
    }

    /// Axis-aligned cell with the given edge lengths, anchored at the origin.
    pub fn orthorhombic(lengths: [f64; 3], pbc: [bool; 3]) -> Result<Self, DegenerateCellError> {
        let matrix = Matrix3::from_diagonal(&Vector3::new(lengths[0], lengths[1], lengths[2]));
        Self::new(matrix, Point3::origin(), pbc)
    }

    pub fn matrix(&self) -> &Matrix3<f64> {
        &self.matrix
    }

    pub fn origin(&self) -> &Point3<f64> {
        &self.origin
    }

    pub fn periodicity(&self) -> [bool; 3] {
        self.pbc
    }

    pub fn is_periodic(&self, axis: usize) -> bool {
        self.pbc[axis]
    }

    /// Whether any cell axis is periodic.
    pub fn has_periodicity(&self) -> bool {
        self.pbc.iter().any(|&p| p)
    }

    pub fn volume(&self) -> f64 {
        self.volume
    }

    /// Transforms a cartesian point into fractional cell coordinates.
    pub fn to_fractional(&self, point: &Point3<f64>) -> Vector3<f64> {
        self.inverse * (point - self.origin)
    }

    /// Transforms fractional cell coordinates back into a cartesian point.
    pub fn to_cartesian(&self, fractional: &Vector3<f64>) -> Point3<f64> {
        self.origin + self.matrix * fractional
    }

    /// Perpendicular distance between the two cell faces normal to `axis`.
    ///
    /// Computed from the reciprocal geometry (`1 / ‖row(axis) of the inverse‖`),
    /// which for a sheared cell is smaller than the edge length. This is the
    /// extent that bin sizing and periodic shift ranges must be measured
    /// against for triclinic cells.
    pub fn face_spacing(&self, axis: usize) -> f64 {
        1.0 / self.inverse.row(axis).norm()
    }

    /// Wraps fractional coordinates into `[0, 1)` along periodic axes.
    ///
    /// Returns the wrapped coordinates together with the integer number of
    /// whole-cell steps that were added per axis, so that
    /// `wrapped = fractional + steps`. Non-periodic axes pass through
    /// unchanged with a step of zero.
    pub fn wrap_fractional(&self, fractional: &Vector3<f64>) -> (Vector3<f64>, Vector3<i32>) {
        let mut wrapped = *fractional;
        let mut steps = Vector3::zeros();
        for axis in 0..3 {
            if self.pbc[axis] {
                let down = wrapped[axis].floor();
                wrapped[axis] -= down;
                steps[axis] = -(down as i32);
            }
        }
        (wrapped, steps)
    }
}
