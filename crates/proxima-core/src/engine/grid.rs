use crate::core::geometry::cell::CellGeometry;
use crate::engine::error::PrepareError;
use crate::engine::progress::{CancellationToken, Progress, ProgressReporter};
use nalgebra::{Point3, Vector3};
use tracing::debug;

/// Upper bound on bins per axis; clamping only enlarges bins, which keeps
/// every bin at least one characteristic length wide.
const MAX_BINS_PER_AXIS: usize = 64;

/// Particles processed between two cancellation polls during the build.
const CANCEL_POLL_INTERVAL: usize = 4096;

/// Regular grid of bins over the simulation cell, bucketing particle indices
/// for locality-limited traversal.
///
/// Particles are binned by their fractional coordinates, wrapped into the
/// primary cell on periodic axes and clamped into the edge bins on open axes.
/// The grid keeps each particle's wrapped position and the integer wrap steps
/// that were applied, so queries can report image shifts relative to the
/// original, unwrapped input positions.
#[derive(Debug, Clone)]
pub struct SpatialCellGrid {
    cell: CellGeometry,
    bin_counts: [usize; 3],
    bins: Vec<Vec<usize>>,
    wrapped_positions: Vec<Point3<f64>>,
    wraps: Vec<Vector3<i32>>,
    home_bins: Vec<[usize; 3]>,
}

impl SpatialCellGrid {
    /// Builds the grid for the given particle set.
    ///
    /// Bin counts per axis are `floor(face_spacing / characteristic_length)`,
    /// clamped to `[1, 64]`, so an axis shorter than the characteristic
    /// length degenerates to a single bin. The build polls `cancel`
    /// periodically and aborts with [`PrepareError::Cancelled`].
    pub fn build(
        positions: &[Point3<f64>],
        cell: CellGeometry,
        characteristic_length: f64,
        reporter: &ProgressReporter<'_>,
        cancel: &CancellationToken,
    ) -> Result<Self, PrepareError> {
        let mut bin_counts = [0usize; 3];
        for axis in 0..3 {
            let count = (cell.face_spacing(axis) / characteristic_length).floor() as usize;
            bin_counts[axis] = count.clamp(1, MAX_BINS_PER_AXIS);
        }

        let mut grid = Self {
            cell,
            bin_counts,
            bins: vec![Vec::new(); bin_counts[0] * bin_counts[1] * bin_counts[2]],
            wrapped_positions: Vec::with_capacity(positions.len()),
            wraps: Vec::with_capacity(positions.len()),
            home_bins: Vec::with_capacity(positions.len()),
        };

        reporter.report(Progress::TaskStart {
            total_steps: positions.len() as u64,
        });
        for (index, position) in positions.iter().enumerate() {
            if index % CANCEL_POLL_INTERVAL == 0 && cancel.is_cancelled() {
                return Err(PrepareError::Cancelled);
            }

            let (wrapped, steps) = grid.cell.wrap_fractional(&grid.cell.to_fractional(position));
            let bin = grid.bin_of_fractional(&wrapped);
            let flat = grid.flat_index(bin);
            grid.bins[flat].push(index);
            grid.wrapped_positions.push(grid.cell.to_cartesian(&wrapped));
            grid.wraps.push(steps);
            grid.home_bins.push(bin);
            reporter.report(Progress::TaskIncrement);
        }
        reporter.report(Progress::TaskFinish);

        debug!(
            particles = positions.len(),
            bins = ?grid.bin_counts,
            "spatial bin grid populated"
        );
        Ok(grid)
    }

    pub fn cell(&self) -> &CellGeometry {
        &self.cell
    }

    pub fn bin_counts(&self) -> [usize; 3] {
        self.bin_counts
    }

    pub fn particle_count(&self) -> usize {
        self.wrapped_positions.len()
    }

    /// Position of a particle after wrapping into the primary cell.
    pub fn wrapped_position(&self, index: usize) -> &Point3<f64> {
        &self.wrapped_positions[index]
    }

    /// Whole-cell steps applied when wrapping the particle into the cell.
    pub fn wrap_steps(&self, index: usize) -> Vector3<i32> {
        self.wraps[index]
    }

    pub fn home_bin(&self, index: usize) -> [usize; 3] {
        self.home_bins[index]
    }

    /// Particle indices stored in a bin, in input order.
    pub fn particles_in(&self, bin: [usize; 3]) -> &[usize] {
        &self.bins[self.flat_index(bin)]
    }

    /// Bin holding a wrapped fractional coordinate. Open axes clamp
    /// out-of-cell coordinates into the edge bins.
    pub(crate) fn bin_of_fractional(&self, fractional: &Vector3<f64>) -> [usize; 3] {
        let mut bin = [0usize; 3];
        for axis in 0..3 {
            let scaled = (fractional[axis] * self.bin_counts[axis] as f64).floor() as isize;
            bin[axis] = scaled.clamp(0, self.bin_counts[axis] as isize - 1) as usize;
        }
        bin
    }

    /// Distinct bins whose contents could hold a candidate within `radius`
    /// of the center bin.
    pub fn bins_within(&self, center: [usize; 3], radius: f64) -> BinWindow {
        let mut axes = [AxisRange::default(); 3];
        for axis in 0..3 {
            let spacing = self.cell.face_spacing(axis) / self.bin_counts[axis] as f64;
            let half_width = (radius / spacing).floor() as i64 + 1;
            axes[axis] = AxisRange::new(
                center[axis] as i64,
                half_width,
                self.bin_counts[axis] as i64,
                self.cell.is_periodic(axis),
            );
        }
        BinWindow::new(axes)
    }

    fn flat_index(&self, bin: [usize; 3]) -> usize {
        (bin[0] * self.bin_counts[1] + bin[1]) * self.bin_counts[2] + bin[2]
    }
}

/// Logical bin range along one axis of a [`BinWindow`].
#[derive(Debug, Clone, Copy, Default)]
struct AxisRange {
    start: i64,
    end: i64,
    bin_count: i64,
    wrapping: bool,
    full_sweep: bool,
    periodic: bool,
}

impl AxisRange {
    fn new(center: i64, half_width: i64, bin_count: i64, periodic: bool) -> Self {
        if periodic {
            if 2 * half_width + 1 >= bin_count {
                // The window spans the whole axis; visit each bin exactly once.
                Self {
                    start: 0,
                    end: bin_count - 1,
                    bin_count,
                    wrapping: false,
                    full_sweep: true,
                    periodic,
                }
            } else {
                Self {
                    start: center - half_width,
                    end: center + half_width,
                    bin_count,
                    wrapping: true,
                    full_sweep: false,
                    periodic,
                }
            }
        } else {
            let start = (center - half_width).max(0);
            let end = (center + half_width).min(bin_count - 1);
            Self {
                start,
                end,
                bin_count,
                wrapping: false,
                full_sweep: start == 0 && end == bin_count - 1,
                periodic,
            }
        }
    }

    fn resolve(&self, logical: i64) -> usize {
        if self.wrapping {
            logical.rem_euclid(self.bin_count) as usize
        } else {
            logical as usize
        }
    }
}

/// Lazy, finite sequence of distinct bin coordinates.
///
/// Bins are yielded in lexicographic logical order, which fixes the bin
/// traversal order of every query for reproducibility.
#[derive(Debug, Clone)]
pub struct BinWindow {
    axes: [AxisRange; 3],
    cursor: [i64; 3],
    done: bool,
}

impl BinWindow {
    fn new(axes: [AxisRange; 3]) -> Self {
        Self {
            cursor: [axes[0].start, axes[1].start, axes[2].start],
            axes,
            done: false,
        }
    }

    /// Whether this window provably covers the entire candidate space: every
    /// bin swept and no periodic axis able to supply images beyond it.
    pub fn is_exhaustive(&self) -> bool {
        self.axes
            .iter()
            .all(|axis| !axis.periodic && axis.full_sweep)
    }
}

impl Iterator for BinWindow {
    type Item = [usize; 3];

    fn next(&mut self) -> Option<[usize; 3]> {
        if self.done {
            return None;
        }
        let bin = [
            self.axes[0].resolve(self.cursor[0]),
            self.axes[1].resolve(self.cursor[1]),
            self.axes[2].resolve(self.cursor[2]),
        ];

        self.cursor[2] += 1;
        if self.cursor[2] > self.axes[2].end {
            self.cursor[2] = self.axes[2].start;
            self.cursor[1] += 1;
            if self.cursor[1] > self.axes[1].end {
                self.cursor[1] = self.axes[1].start;
                self.cursor[0] += 1;
                if self.cursor[0] > self.axes[0].end {
                    self.done = true;
                }
            }
        }
        Some(bin)
    }
}
