use crate::core::geometry::cell::CellGeometry;
use crate::core::geometry::images::PeriodicImageResolver;
use crate::core::neighbor::NeighborRecord;
use crate::engine::error::{PrepareError, QueryError};
use crate::engine::grid::SpatialCellGrid;
use crate::engine::heap::BoundedMaxHeap;
use crate::engine::progress::{CancellationToken, Progress, ProgressReporter};
use nalgebra::{Point3, Vector3};
use std::f64::consts::PI;
use tracing::{info, trace};

#[cfg(feature = "parallel")]
use rayon::prelude::*;

/// Largest supported neighbor count; keeps the per-query candidate buffer
/// small and bounded.
pub const MAX_K: usize = 30;

/// Finds the k nearest neighbor images of a particle or an arbitrary point.
///
/// The search expands an estimated radius adaptively: candidates from the
/// bins within the current radius are ranked in a bounded max-heap, and the
/// radius doubles until the k-th best candidate provably cannot be beaten by
/// anything outside the swept volume. Like the cutoff query, the prepared
/// structure is immutable and safe to query concurrently.
#[derive(Debug, Clone)]
pub struct KNearestQuery {
    k: usize,
    grid: SpatialCellGrid,
    initial_radius: f64,
}

impl KNearestQuery {
    pub fn prepare(
        k: usize,
        positions: &[Point3<f64>],
        cell: &CellGeometry,
    ) -> Result<Self, PrepareError> {
        Self::prepare_with(
            k,
            positions,
            cell,
            &ProgressReporter::new(),
            &CancellationToken::new(),
        )
    }

    /// As [`prepare`](Self::prepare), reporting build progress and honoring
    /// cooperative cancellation.
    pub fn prepare_with(
        k: usize,
        positions: &[Point3<f64>],
        cell: &CellGeometry,
        reporter: &ProgressReporter<'_>,
        cancel: &CancellationToken,
    ) -> Result<Self, PrepareError> {
        if k == 0 || k > MAX_K {
            return Err(PrepareError::InvalidK { k, max_k: MAX_K });
        }
        if positions.is_empty() {
            return Err(PrepareError::EmptyParticleSet);
        }

        // Radius of a sphere expected to hold k+1 particles at the global
        // mean density; the starting point for the adaptive expansion.
        let count = positions.len() as f64;
        let initial_radius = (3.0 * (k as f64 + 1.0) * cell.volume() / (4.0 * PI * count)).cbrt();

        reporter.report(Progress::PhaseStart {
            name: "nearest neighbor search",
        });
        let grid = SpatialCellGrid::build(positions, cell.clone(), initial_radius, reporter, cancel)?;
        reporter.report(Progress::PhaseFinish);

        info!(
            particles = positions.len(),
            k, initial_radius, "prepared k-nearest neighbor query"
        );
        Ok(Self {
            k,
            grid,
            initial_radius,
        })
    }

    pub fn k(&self) -> usize {
        self.k
    }

    pub fn particle_count(&self) -> usize {
        self.grid.particle_count()
    }

    /// The up-to-k nearest neighbor images of particle `center`, ascending
    /// by distance.
    ///
    /// The zero-shift pairing of the center with itself is excluded; its
    /// periodic images compete like any other candidate. Fewer than k records
    /// are returned when the system, including periodic images, cannot supply
    /// more.
    pub fn find(&self, center: usize) -> Result<KNearestNeighbors, QueryError> {
        let count = self.grid.particle_count();
        if center >= count {
            return Err(QueryError::IndexOutOfRange {
                index: center,
                count,
            });
        }
        Ok(self.nearest_of(center))
    }

    /// The up-to-k nearest particles around an arbitrary point, ascending by
    /// distance. A particle exactly coincident with the point is included.
    pub fn find_at(&self, point: &Point3<f64>) -> KNearestNeighbors {
        let cell = self.grid.cell();
        let (wrapped, query_wrap) = cell.wrap_fractional(&cell.to_fractional(point));
        let bin = self.grid.bin_of_fractional(&wrapped);
        let records = self.search(&cell.to_cartesian(&wrapped), bin, query_wrap, None);
        KNearestNeighbors { records }
    }

    /// Nearest-neighbor lists for every particle, indexed like the input
    /// positions.
    pub fn find_all(&self) -> Vec<KNearestNeighbors> {
        #[cfg(not(feature = "parallel"))]
        let lists = (0..self.particle_count())
            .map(|center| self.nearest_of(center))
            .collect();

        #[cfg(feature = "parallel")]
        let lists = (0..self.particle_count())
            .into_par_iter()
            .map(|center| self.nearest_of(center))
            .collect();

        lists
    }

    fn nearest_of(&self, center: usize) -> KNearestNeighbors {
        let records = self.search(
            self.grid.wrapped_position(center),
            self.grid.home_bin(center),
            self.grid.wrap_steps(center),
            Some(center),
        );
        KNearestNeighbors { records }
    }

    fn search(
        &self,
        query: &Point3<f64>,
        center_bin: [usize; 3],
        query_wrap: Vector3<i32>,
        exclude_zero_shift: Option<usize>,
    ) -> Vec<NeighborRecord> {
        let grid = &self.grid;
        let cell = grid.cell();
        let mut radius = self.initial_radius;

        loop {
            let mut heap = BoundedMaxHeap::new(self.k);
            let resolver = PeriodicImageResolver::new(cell, radius);
            let window = grid.bins_within(center_bin, radius);
            let exhaustive = window.is_exhaustive();

            for bin in window {
                for &candidate in grid.particles_in(bin) {
                    for shift in resolver.candidate_shifts() {
                        if exclude_zero_shift == Some(candidate)
                            && shift.steps == Vector3::zeros()
                        {
                            continue;
                        }
                        let displacement = PeriodicImageResolver::displacement(
                            query,
                            grid.wrapped_position(candidate),
                            shift,
                        );
                        heap.push(NeighborRecord {
                            index: candidate,
                            distance_squared: displacement.norm_squared(),
                            displacement,
                            shift: shift.steps + grid.wrap_steps(candidate) - query_wrap,
                        });
                    }
                }
            }

            // The k retained candidates are final once nothing outside the
            // swept radius could still beat the worst of them.
            let converged = heap.is_full()
                && heap.max_key().is_some_and(|worst| worst <= radius * radius);
            if converged || exhaustive {
                return heap.into_sorted_vec();
            }

            trace!(
                radius,
                found = heap.len(),
                needed = self.k,
                "expanding nearest-neighbor search radius"
            );
            radius *= 2.0;
        }
    }
}

/// Ascending-ordered nearest neighbors of a single query.
#[derive(Debug, Clone, PartialEq)]
pub struct KNearestNeighbors {
    records: Vec<NeighborRecord>,
}

impl KNearestNeighbors {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn as_slice(&self) -> &[NeighborRecord] {
        &self.records
    }

    pub fn iter(&self) -> std::slice::Iter<'_, NeighborRecord> {
        self.records.iter()
    }

    /// The closest record, if any neighbor exists.
    pub fn nearest(&self) -> Option<&NeighborRecord> {
        self.records.first()
    }
}

impl IntoIterator for KNearestNeighbors {
    type Item = NeighborRecord;
    type IntoIter = std::vec::IntoIter<NeighborRecord>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.into_iter()
    }
}

impl<'a> IntoIterator for &'a KNearestNeighbors {
    type Item = &'a NeighborRecord;
    type IntoIter = std::slice::Iter<'a, NeighborRecord>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.iter()
    }
}
