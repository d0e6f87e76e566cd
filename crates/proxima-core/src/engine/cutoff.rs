use crate::core::geometry::cell::CellGeometry;
use crate::core::geometry::images::PeriodicImageResolver;
use crate::core::neighbor::NeighborRecord;
use crate::engine::error::{PrepareError, QueryError};
use crate::engine::grid::{BinWindow, SpatialCellGrid};
use crate::engine::progress::{CancellationToken, Progress, ProgressReporter};
use nalgebra::{Point3, Vector3};
use tracing::info;

#[cfg(feature = "parallel")]
use rayon::prelude::*;

/// Enumerates all neighbor images within a fixed cutoff radius of a particle.
///
/// The structure is built once from an immutable particle snapshot and cell
/// geometry, and may then be queried any number of times, from any number of
/// threads; queries never mutate shared state.
#[derive(Debug, Clone)]
pub struct CutoffNeighborQuery {
    cutoff: f64,
    cutoff_squared: f64,
    grid: SpatialCellGrid,
    resolver: PeriodicImageResolver,
}

impl CutoffNeighborQuery {
    pub fn prepare(
        cutoff: f64,
        positions: &[Point3<f64>],
        cell: &CellGeometry,
    ) -> Result<Self, PrepareError> {
        Self::prepare_with(
            cutoff,
            positions,
            cell,
            &ProgressReporter::new(),
            &CancellationToken::new(),
        )
    }

    /// As [`prepare`](Self::prepare), reporting build progress and honoring
    /// cooperative cancellation.
    pub fn prepare_with(
        cutoff: f64,
        positions: &[Point3<f64>],
        cell: &CellGeometry,
        reporter: &ProgressReporter<'_>,
        cancel: &CancellationToken,
    ) -> Result<Self, PrepareError> {
        if !cutoff.is_finite() || cutoff <= 0.0 {
            return Err(PrepareError::InvalidCutoff { cutoff });
        }
        if positions.is_empty() {
            return Err(PrepareError::EmptyParticleSet);
        }

        reporter.report(Progress::PhaseStart {
            name: "cutoff neighbor search",
        });
        let grid = SpatialCellGrid::build(positions, cell.clone(), cutoff, reporter, cancel)?;
        let resolver = PeriodicImageResolver::new(cell, cutoff);
        reporter.report(Progress::PhaseFinish);

        info!(
            particles = positions.len(),
            cutoff,
            images = resolver.candidate_shifts().len(),
            "prepared cutoff neighbor query"
        );
        Ok(Self {
            cutoff,
            cutoff_squared: cutoff * cutoff,
            grid,
            resolver,
        })
    }

    pub fn cutoff(&self) -> f64 {
        self.cutoff
    }

    pub fn particle_count(&self) -> usize {
        self.grid.particle_count()
    }

    /// Lazy iteration over every neighbor image of `center` within the
    /// cutoff, in deterministic bin/candidate/shift order.
    ///
    /// The zero-shift pairing of the center with itself is skipped; periodic
    /// self images within the cutoff are reported. The iterator may be
    /// dropped early without affecting later queries.
    pub fn find(&self, center: usize) -> Result<CutoffNeighbors<'_>, QueryError> {
        let count = self.grid.particle_count();
        if center >= count {
            return Err(QueryError::IndexOutOfRange {
                index: center,
                count,
            });
        }
        Ok(self.iter_from(center))
    }

    /// Neighbor lists for every particle, indexed like the input positions.
    pub fn find_all(&self) -> Vec<Vec<NeighborRecord>> {
        #[cfg(not(feature = "parallel"))]
        let lists = (0..self.particle_count())
            .map(|center| self.iter_from(center).collect())
            .collect();

        #[cfg(feature = "parallel")]
        let lists = (0..self.particle_count())
            .into_par_iter()
            .map(|center| self.iter_from(center).collect())
            .collect();

        lists
    }

    fn iter_from(&self, center: usize) -> CutoffNeighbors<'_> {
        CutoffNeighbors {
            query: self,
            center_index: center,
            center_position: *self.grid.wrapped_position(center),
            center_wrap: self.grid.wrap_steps(center),
            window: self.grid.bins_within(self.grid.home_bin(center), self.cutoff),
            current_bin: &[],
            candidate_cursor: 0,
            shift_cursor: 0,
        }
    }
}

/// Lazy neighbor iterator with an explicit cursor: current bin, current
/// candidate within the bin, current image shift.
#[derive(Debug, Clone)]
pub struct CutoffNeighbors<'a> {
    query: &'a CutoffNeighborQuery,
    center_index: usize,
    center_position: Point3<f64>,
    center_wrap: Vector3<i32>,
    window: BinWindow,
    current_bin: &'a [usize],
    candidate_cursor: usize,
    shift_cursor: usize,
}

impl<'a> Iterator for CutoffNeighbors<'a> {
    type Item = NeighborRecord;

    fn next(&mut self) -> Option<NeighborRecord> {
        let grid = &self.query.grid;
        let shifts = self.query.resolver.candidate_shifts();
        loop {
            if self.candidate_cursor >= self.current_bin.len() {
                let bin = self.window.next()?;
                self.current_bin = grid.particles_in(bin);
                self.candidate_cursor = 0;
                self.shift_cursor = 0;
                continue;
            }
            let candidate = self.current_bin[self.candidate_cursor];
            if self.shift_cursor >= shifts.len() {
                self.candidate_cursor += 1;
                self.shift_cursor = 0;
                continue;
            }
            let shift = &shifts[self.shift_cursor];
            self.shift_cursor += 1;

            // A particle is never its own zero-shift neighbor.
            if candidate == self.center_index && shift.steps == Vector3::zeros() {
                continue;
            }

            let displacement = PeriodicImageResolver::displacement(
                &self.center_position,
                grid.wrapped_position(candidate),
                shift,
            );
            let distance_squared = displacement.norm_squared();
            if distance_squared <= self.query.cutoff_squared {
                return Some(NeighborRecord {
                    index: candidate,
                    distance_squared,
                    displacement,
                    shift: shift.steps + grid.wrap_steps(candidate) - self.center_wrap,
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::Matrix3;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn cubic(length: f64, pbc: [bool; 3]) -> CellGeometry {
        CellGeometry::orthorhombic([length; 3], pbc).unwrap()
    }

    /// All-pairs, all-images reference implementation over the original
    /// (unwrapped) positions.
    fn brute_force(
        positions: &[Point3<f64>],
        cell: &CellGeometry,
        cutoff: f64,
        center: usize,
    ) -> Vec<NeighborRecord> {
        let mut max_steps = [0i32; 3];
        for axis in 0..3 {
            if cell.is_periodic(axis) {
                // The step range must absorb both the cutoff and the spread of
                // unwrapped input coordinates across cell repeats.
                let spread = positions
                    .iter()
                    .map(|p| cell.to_fractional(p)[axis])
                    .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), f| {
                        (lo.min(f), hi.max(f))
                    });
                let span = (spread.1 - spread.0).ceil() as i32;
                max_steps[axis] = (cutoff / cell.face_spacing(axis)).ceil() as i32 + span + 1;
            }
        }

        let mut records = Vec::new();
        for (index, position) in positions.iter().enumerate() {
            for a in -max_steps[0]..=max_steps[0] {
                for b in -max_steps[1]..=max_steps[1] {
                    for c in -max_steps[2]..=max_steps[2] {
                        let shift = Vector3::new(a, b, c);
                        if index == center && shift == Vector3::zeros() {
                            continue;
                        }
                        let displacement =
                            (position - positions[center]) + cell.matrix() * shift.cast::<f64>();
                        let distance_squared = displacement.norm_squared();
                        if distance_squared <= cutoff * cutoff {
                            records.push(NeighborRecord {
                                index,
                                distance_squared,
                                displacement,
                                shift,
                            });
                        }
                    }
                }
            }
        }
        records.sort_unstable_by_key(|r| (r.index, r.shift.x, r.shift.y, r.shift.z));
        records
    }

    fn sorted_by_identity(mut records: Vec<NeighborRecord>) -> Vec<NeighborRecord> {
        records.sort_unstable_by_key(|r| (r.index, r.shift.x, r.shift.y, r.shift.z));
        records
    }

    fn assert_same_records(found: &[NeighborRecord], expected: &[NeighborRecord]) {
        assert_eq!(found.len(), expected.len());
        for (f, e) in found.iter().zip(expected) {
            assert_eq!(f.index, e.index);
            assert_eq!(f.shift, e.shift);
            assert!((f.distance_squared - e.distance_squared).abs() < 1e-9);
            assert!((f.displacement - e.displacement).norm() < 1e-9);
        }
    }

    mod validation {
        use super::*;

        #[test]
        fn non_positive_cutoff_is_rejected() {
            let cell = cubic(1.0, [true; 3]);
            let positions = [Point3::origin()];

            for cutoff in [0.0, -1.0, f64::NAN] {
                let result = CutoffNeighborQuery::prepare(cutoff, &positions, &cell);
                assert!(matches!(result, Err(PrepareError::InvalidCutoff { .. })));
            }
        }

        #[test]
        fn empty_particle_set_is_rejected() {
            let cell = cubic(1.0, [true; 3]);
            let result = CutoffNeighborQuery::prepare(0.5, &[], &cell);
            assert_eq!(result.unwrap_err(), PrepareError::EmptyParticleSet);
        }

        #[test]
        fn cancelled_preparation_is_reported() {
            let cell = cubic(1.0, [true; 3]);
            let token = CancellationToken::new();
            token.cancel();

            let result = CutoffNeighborQuery::prepare_with(
                0.5,
                &[Point3::origin()],
                &cell,
                &ProgressReporter::new(),
                &token,
            );
            assert_eq!(result.unwrap_err(), PrepareError::Cancelled);
        }

        #[test]
        fn degenerate_cells_cannot_reach_preparation() {
            fn prepare(matrix: Matrix3<f64>) -> Result<CutoffNeighborQuery, PrepareError> {
                let cell = CellGeometry::new(matrix, Point3::origin(), [true; 3])?;
                CutoffNeighborQuery::prepare(0.5, &[Point3::origin()], &cell)
            }

            let singular = Matrix3::from_columns(&[
                Vector3::x(),
                Vector3::y(),
                Vector3::new(1.0, 1.0, 0.0),
            ]);
            assert!(matches!(
                prepare(singular),
                Err(PrepareError::DegenerateCell(_))
            ));
        }

        #[test]
        fn prepared_structure_is_shareable_across_threads() {
            fn assert_send_sync<T: Send + Sync>() {}
            assert_send_sync::<CutoffNeighborQuery>();
        }

        #[test]
        fn out_of_range_index_fails_without_poisoning_the_structure() {
            let cell = cubic(1.0, [true; 3]);
            let positions = [Point3::origin(), Point3::new(0.3, 0.0, 0.0)];
            let query = CutoffNeighborQuery::prepare(0.4, &positions, &cell).unwrap();

            assert_eq!(
                query.find(2).unwrap_err(),
                QueryError::IndexOutOfRange { index: 2, count: 2 }
            );
            // The structure stays valid for subsequent queries.
            assert_eq!(query.find(0).unwrap().count(), 1);
        }
    }

    mod periodic_behavior {
        use super::*;

        #[test]
        fn two_particles_in_a_periodic_unit_cell() {
            let cell = cubic(1.0, [true; 3]);
            let positions = [Point3::origin(), Point3::new(0.3, 0.0, 0.0)];
            let query = CutoffNeighborQuery::prepare(0.4, &positions, &cell).unwrap();

            // The far image of particle 1 sits 0.7 away; only the direct
            // pairing is in range.
            let records: Vec<_> = query.find(0).unwrap().collect();
            assert_eq!(records.len(), 1);
            assert_eq!(records[0].index, 1);
            assert_eq!(records[0].shift, Vector3::zeros());
            assert!((records[0].distance() - 0.3).abs() < 1e-12);
        }

        #[test]
        fn equidistant_images_are_each_reported() {
            let cell = cubic(1.0, [true; 3]);
            let positions = [Point3::origin(), Point3::new(0.5, 0.0, 0.0)];
            let query = CutoffNeighborQuery::prepare(0.6, &positions, &cell).unwrap();

            // Particle 1 is 0.5 away both directly and through the -x face;
            // each image is a distinct record.
            let records = sorted_by_identity(query.find(0).unwrap().collect());
            assert_eq!(records.len(), 2);
            assert!(records.iter().all(|r| r.index == 1));
            assert!(records.iter().all(|r| (r.distance() - 0.5).abs() < 1e-12));
            assert_eq!(records[0].shift, Vector3::new(-1, 0, 0));
            assert_eq!(records[1].shift, Vector3::zeros());
            assert_same_records(&records, &brute_force(&positions, &cell, 0.6, 0));
        }

        #[test]
        fn single_particle_sees_itself_through_all_six_faces() {
            let cell = cubic(1.0, [true; 3]);
            let positions = [Point3::origin()];
            let query = CutoffNeighborQuery::prepare(1.2, &positions, &cell).unwrap();

            let records: Vec<_> = query.find(0).unwrap().collect();
            // Face images at distance 1 are in range; edge images at sqrt(2)
            // are not. The zero-shift pairing is excluded.
            assert_eq!(records.len(), 6);
            for record in &records {
                assert_eq!(record.index, 0);
                assert_ne!(record.shift, Vector3::zeros());
                assert_eq!(record.shift.abs().sum(), 1);
                assert!((record.distance() - 1.0).abs() < 1e-12);
            }
        }

        #[test]
        fn open_boundaries_produce_no_mirror_images() {
            let cell = cubic(1.0, [false; 3]);
            let positions = [Point3::new(0.05, 0.5, 0.5), Point3::new(0.95, 0.5, 0.5)];
            let query = CutoffNeighborQuery::prepare(0.2, &positions, &cell).unwrap();

            // Across the face the particles would be 0.1 apart, but with open
            // boundaries only the direct 0.9 separation exists.
            assert_eq!(query.find(0).unwrap().count(), 0);
            assert_eq!(query.find(1).unwrap().count(), 0);
        }

        #[test]
        fn wrapped_input_positions_report_shifts_against_the_originals() {
            let cell = cubic(1.0, [true; 3]);
            // Same physical configuration as the two-particle scenario, but
            // the second particle sits two cells over.
            let positions = [Point3::origin(), Point3::new(2.5, 0.0, 0.0)];
            let query = CutoffNeighborQuery::prepare(0.6, &positions, &cell).unwrap();

            let records: Vec<_> = query.find(0).unwrap().collect();
            assert_eq!(records.len(), 1);
            assert_eq!(records[0].index, 1);
            assert_eq!(records[0].shift, Vector3::new(-2, 0, 0));

            // displacement = position + shift * cell - query point.
            let expected = (positions[1] - positions[0])
                + cell.matrix() * records[0].shift.cast::<f64>();
            assert!((records[0].displacement - expected).norm() < 1e-9);
        }

        #[test]
        fn triclinic_cutoff_beyond_one_repeat_finds_all_images() {
            let shear = 1.5;
            let matrix = Matrix3::from_columns(&[
                Vector3::new(1.0, 0.0, 0.0),
                Vector3::new(shear, 1.0, 0.0),
                Vector3::new(0.0, 0.0, 1.0),
            ]);
            let cell = CellGeometry::new(matrix, Point3::origin(), [true; 3]).unwrap();
            let positions = [Point3::new(0.2, 0.3, 0.4), Point3::new(0.7, 0.6, 0.1)];
            let cutoff = 1.3;

            let query = CutoffNeighborQuery::prepare(cutoff, &positions, &cell).unwrap();
            for center in 0..positions.len() {
                let found = sorted_by_identity(query.find(center).unwrap().collect());
                let expected = brute_force(&positions, &cell, cutoff, center);
                assert!(!expected.is_empty());
                assert_same_records(&found, &expected);
            }
        }
    }

    mod properties {
        use super::*;

        fn random_positions(rng: &mut StdRng, count: usize, scale: f64) -> Vec<Point3<f64>> {
            (0..count)
                .map(|_| {
                    Point3::new(
                        rng.gen_range(-0.5..1.5) * scale,
                        rng.gen_range(-0.5..1.5) * scale,
                        rng.gen_range(-0.5..1.5) * scale,
                    )
                })
                .collect()
        }

        #[test]
        fn matches_brute_force_for_random_orthorhombic_configurations() {
            let mut rng = StdRng::seed_from_u64(42);
            let cell = CellGeometry::orthorhombic([2.0, 3.0, 2.5], [true, true, false]).unwrap();
            let positions = random_positions(&mut rng, 40, 2.0);
            let cutoff = 0.9;

            let query = CutoffNeighborQuery::prepare(cutoff, &positions, &cell).unwrap();
            for center in 0..positions.len() {
                let found = sorted_by_identity(query.find(center).unwrap().collect());
                let expected = brute_force(&positions, &cell, cutoff, center);
                assert_same_records(&found, &expected);
            }
        }

        #[test]
        fn matches_brute_force_for_random_triclinic_configurations() {
            let mut rng = StdRng::seed_from_u64(7);
            let matrix = Matrix3::from_columns(&[
                Vector3::new(2.0, 0.0, 0.0),
                Vector3::new(0.8, 1.8, 0.0),
                Vector3::new(-0.4, 0.5, 2.2),
            ]);
            let cell = CellGeometry::new(matrix, Point3::new(-0.5, 0.0, 0.3), [true; 3]).unwrap();
            let positions = random_positions(&mut rng, 30, 2.0);
            let cutoff = 1.1;

            let query = CutoffNeighborQuery::prepare(cutoff, &positions, &cell).unwrap();
            for center in 0..positions.len() {
                let found = sorted_by_identity(query.find(center).unwrap().collect());
                let expected = brute_force(&positions, &cell, cutoff, center);
                assert_same_records(&found, &expected);
            }
        }

        #[test]
        fn every_record_lies_within_the_cutoff() {
            let mut rng = StdRng::seed_from_u64(11);
            let cell = cubic(2.0, [true; 3]);
            let positions = random_positions(&mut rng, 25, 2.0);
            let cutoff = 0.8;

            let query = CutoffNeighborQuery::prepare(cutoff, &positions, &cell).unwrap();
            for center in 0..positions.len() {
                for record in query.find(center).unwrap() {
                    assert!(record.distance_squared <= cutoff * cutoff);
                    assert!(
                        (record.displacement.norm_squared() - record.distance_squared).abs()
                            < 1e-12
                    );
                }
            }
        }

        #[test]
        fn repeated_queries_yield_identical_sequences() {
            let mut rng = StdRng::seed_from_u64(3);
            let cell = cubic(2.0, [true; 3]);
            let positions = random_positions(&mut rng, 20, 2.0);

            let query = CutoffNeighborQuery::prepare(0.7, &positions, &cell).unwrap();
            let first: Vec<_> = query.find(5).unwrap().collect();

            // Partial consumption of one iterator does not disturb others.
            let mut partial = query.find(5).unwrap();
            let _ = partial.next();
            drop(partial);

            let second: Vec<_> = query.find(5).unwrap().collect();
            assert_eq!(first, second);
        }

        #[test]
        fn find_all_matches_individual_queries() {
            let mut rng = StdRng::seed_from_u64(19);
            let cell = cubic(2.0, [true, false, true]);
            let positions = random_positions(&mut rng, 15, 2.0);

            let query = CutoffNeighborQuery::prepare(0.8, &positions, &cell).unwrap();
            let lists = query.find_all();
            assert_eq!(lists.len(), positions.len());
            for (center, list) in lists.iter().enumerate() {
                let individual: Vec<_> = query.find(center).unwrap().collect();
                assert_eq!(*list, individual);
            }
        }
    }
}
