//! Slope-to-phase reconstruction by solving a Poisson equation on the
//! aperture.
//!
//! The unknowns are the mask cells strictly inside the outer ring of the
//! grid, numbered in raster order. Each unknown gets a five-point Laplacian
//! row; a neighbour that is not itself an unknown contributes no
//! off-diagonal entry and its weight is folded back onto the diagonal, which
//! is the discrete zero-flux condition at the aperture edge. The first
//! unknown is pinned to zero to remove the constant null space, and the
//! result is re-centred to zero mean over the unknowns.

use std::collections::VecDeque;

use nalgebra::DMatrix;
use nalgebra_sparse::factorization::CscCholesky;
use nalgebra_sparse::{CooMatrix, CscMatrix};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{PhaseError, PhaseResult};
use crate::grid::Mask;
use crate::slopes::Slopes;

/// Smallest accepted squared Cholesky pivot, relative to the largest
/// diagonal entry of the system.
const PIVOT_TOLERANCE: f64 = 1e-10;

/// How undefined slopes enter the right-hand side.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SlopeBoundary {
    /// Undefined slopes read as zero; the divergence is the centred
    /// difference of the zero-filled fields.
    #[default]
    ZeroFill,
    /// The divergence is built from face-averaged slopes on faces between
    /// two unknowns only; faces to missing neighbours carry no flux.
    Exclude,
}

impl SlopeBoundary {
    pub fn as_str(&self) -> &'static str {
        match self {
            SlopeBoundary::ZeroFill => "zero-fill",
            SlopeBoundary::Exclude => "exclude",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReconstructOptions {
    pub boundary: SlopeBoundary,
    /// Replace the first unknown's equation with `value = 0`.
    pub pin: bool,
}

impl Default for ReconstructOptions {
    fn default() -> Self {
        ReconstructOptions {
            boundary: SlopeBoundary::ZeroFill,
            pin: true,
        }
    }
}

/// Unknowns of the linear system: a dense cell → index map plus the cells
/// in index order.
#[derive(Debug, Clone)]
pub struct SolveSet {
    index: Array2<Option<usize>>,
    cells: Vec<(usize, usize)>,
}

impl SolveSet {
    pub fn from_mask(mask: &Mask) -> SolveSet {
        let (rows, cols) = mask.dim();
        let mut index = Array2::from_elem((rows, cols), None);
        let mut cells = Vec::new();

        for i in 1..rows.saturating_sub(1) {
            for j in 1..cols.saturating_sub(1) {
                if mask[[i, j]] {
                    index[[i, j]] = Some(cells.len());
                    cells.push((i, j));
                }
            }
        }

        SolveSet { index, cells }
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    pub fn cells(&self) -> &[(usize, usize)] {
        &self.cells
    }

    pub fn index_of(&self, i: usize, j: usize) -> Option<usize> {
        self.index.get((i, j)).copied().flatten()
    }

    pub fn contains(&self, i: usize, j: usize) -> bool {
        self.index_of(i, j).is_some()
    }

    /// Number of 4-connected components.
    pub fn components(&self) -> usize {
        let mut seen = vec![false; self.cells.len()];
        let mut queue = VecDeque::new();
        let mut count = 0;

        for start in 0..self.cells.len() {
            if seen[start] {
                continue;
            }
            count += 1;
            seen[start] = true;
            queue.push_back(start);
            while let Some(k) = queue.pop_front() {
                let (i, j) = self.cells[k];
                for (ni, nj) in neighbours(i, j) {
                    if let Some(m) = self.index_of(ni, nj) {
                        if !seen[m] {
                            seen[m] = true;
                            queue.push_back(m);
                        }
                    }
                }
            }
        }

        count
    }
}

/// Left, right, up, down. Callers only pass interior cells, so `i - 1` and
/// `j - 1` cannot underflow.
fn neighbours(i: usize, j: usize) -> [(usize, usize); 4] {
    [(i, j - 1), (i, j + 1), (i - 1, j), (i + 1, j)]
}

/// Diagnostics of one solve.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SolveReport {
    pub unknowns: usize,
    pub nonzeros: usize,
    pub pinned: Option<(usize, usize)>,
    /// Max-norm residual of the assembled system at the solution.
    pub residual_inf: f64,
}

#[derive(Debug, Clone)]
pub struct PoissonReconstructor {
    dx: f64,
    dy: f64,
    options: ReconstructOptions,
}

impl PoissonReconstructor {
    pub fn new(dx: f64, dy: f64) -> PhaseResult<PoissonReconstructor> {
        if !(dx.is_finite() && dx > 0.0 && dy.is_finite() && dy > 0.0) {
            return Err(PhaseError::InvalidGrid(format!(
                "spacing must be positive and finite, got dx={dx}, dy={dy}"
            )));
        }
        Ok(PoissonReconstructor {
            dx,
            dy,
            options: ReconstructOptions::default(),
        })
    }

    pub fn with_options(mut self, options: ReconstructOptions) -> PoissonReconstructor {
        self.options = options;
        self
    }

    pub fn set_boundary(&mut self, boundary: SlopeBoundary) {
        self.options.boundary = boundary;
    }

    pub fn reconstruct(&self, slopes: &Slopes, mask: &Mask) -> PhaseResult<Array2<f64>> {
        self.reconstruct_with_report(slopes, mask).map(|(phase, _)| phase)
    }

    pub fn reconstruct_with_report(
        &self,
        slopes: &Slopes,
        mask: &Mask,
    ) -> PhaseResult<(Array2<f64>, SolveReport)> {
        check_shape("sx", mask.dim(), slopes.sx.dim())?;
        check_shape("sy", mask.dim(), slopes.sy.dim())?;

        let set = SolveSet::from_mask(mask);
        if set.is_empty() {
            return Err(PhaseError::EmptyDomain);
        }
        let components = set.components();
        if components > 1 {
            return Err(PhaseError::DisconnectedDomain { components });
        }

        let rhs = self.divergence(slopes, &set)?;
        let (coo, b) = self.assemble(&set, &rhs);
        let csc = CscMatrix::from(&coo);
        debug!(
            unknowns = set.len(),
            nonzeros = csc.nnz(),
            boundary = self.options.boundary.as_str(),
            "assembled poisson system"
        );

        let solution = solve_spd(&csc, &b)?;
        let residual_inf = residual_inf(&coo, &solution, &b);

        let mean = solution.iter().sum::<f64>() / solution.len() as f64;
        let mut phase = Array2::from_elem(mask.dim(), f64::NAN);
        for (&(i, j), &value) in set.cells().iter().zip(solution.iter()) {
            phase[[i, j]] = value - mean;
        }

        let report = SolveReport {
            unknowns: set.len(),
            nonzeros: csc.nnz(),
            pinned: self.options.pin.then(|| set.cells()[0]),
            residual_inf,
        };
        Ok((phase, report))
    }

    /// Discrete divergence of the slopes at every solve-set cell.
    fn divergence(&self, slopes: &Slopes, set: &SolveSet) -> PhaseResult<Array2<f64>> {
        let (rows, cols) = slopes.dim();
        let mut rhs = Array2::zeros((rows, cols));

        match self.options.boundary {
            SlopeBoundary::ZeroFill => {
                let sx = slopes.sx.mapv(zero_fill);
                let sy = slopes.sy.mapv(zero_fill);
                for i in 1..rows - 1 {
                    for j in 1..cols - 1 {
                        rhs[[i, j]] = (sx[[i, j + 1]] - sx[[i, j - 1]]) / (2.0 * self.dx)
                            + (sy[[i + 1, j]] - sy[[i - 1, j]]) / (2.0 * self.dy);
                    }
                }
            }
            SlopeBoundary::Exclude => {
                let read = |field: &Array2<f64>, what: &'static str, i: usize, j: usize| {
                    let v = field[[i, j]];
                    if v.is_nan() {
                        Err(PhaseError::UndefinedInDomain { what, row: i, col: j })
                    } else {
                        Ok(v)
                    }
                };
                for &(i, j) in set.cells() {
                    let mut div = 0.0;
                    // (neighbour, field, spacing, sign of the outward direction)
                    let faces = [
                        ((i, j - 1), &slopes.sx, "sx", self.dx, -1.0),
                        ((i, j + 1), &slopes.sx, "sx", self.dx, 1.0),
                        ((i - 1, j), &slopes.sy, "sy", self.dy, -1.0),
                        ((i + 1, j), &slopes.sy, "sy", self.dy, 1.0),
                    ];
                    for ((ni, nj), field, what, h, sign) in faces {
                        if set.contains(ni, nj) {
                            let face =
                                0.5 * (read(field, what, i, j)? + read(field, what, ni, nj)?);
                            div += sign * face / h;
                        }
                    }
                    rhs[[i, j]] = div;
                }
            }
        }

        for &(i, j) in set.cells() {
            if !rhs[[i, j]].is_finite() {
                return Err(PhaseError::UndefinedInDomain {
                    what: "divergence",
                    row: i,
                    col: j,
                });
            }
        }
        Ok(rhs)
    }

    /// Assembles the negated five-point operator, which is symmetric positive
    /// definite once the first unknown is pinned. The pinned value is zero,
    /// so its column is dropped from the other rows without moving anything
    /// to the right-hand side.
    fn assemble(&self, set: &SolveSet, rhs: &Array2<f64>) -> (CooMatrix<f64>, Vec<f64>) {
        let n = set.len();
        let cx = 1.0 / (self.dx * self.dx);
        let cy = 1.0 / (self.dy * self.dy);
        let pin = self.options.pin;

        let mut coo = CooMatrix::new(n, n);
        let mut b = vec![0.0; n];

        for (row, &(i, j)) in set.cells().iter().enumerate() {
            if pin && row == 0 {
                coo.push(0, 0, 1.0);
                continue;
            }

            let mut diag = 2.0 * (cx + cy);
            let weights = [cx, cx, cy, cy];
            for ((ni, nj), c) in neighbours(i, j).into_iter().zip(weights) {
                match set.index_of(ni, nj) {
                    Some(0) if pin => {}
                    Some(col) => coo.push(row, col, -c),
                    None => diag -= c,
                }
            }
            coo.push(row, row, diag);
            b[row] = -rhs[[i, j]];
        }

        (coo, b)
    }
}

/// One-shot reconstruction with the default options.
pub fn poisson_reconstruction(
    slopes: &Slopes,
    dx: f64,
    dy: f64,
    mask: &Mask,
) -> PhaseResult<Array2<f64>> {
    PoissonReconstructor::new(dx, dy)?.reconstruct(slopes, mask)
}

fn zero_fill(v: f64) -> f64 {
    if v.is_nan() { 0.0 } else { v }
}

fn check_shape(
    what: &'static str,
    expected: (usize, usize),
    found: (usize, usize),
) -> PhaseResult<()> {
    if expected != found {
        return Err(PhaseError::ShapeMismatch {
            what,
            expected,
            found,
        });
    }
    Ok(())
}

fn solve_spd(csc: &CscMatrix<f64>, b: &[f64]) -> PhaseResult<Vec<f64>> {
    let cholesky = CscCholesky::factor(csc)
        .map_err(|e| PhaseError::SingularSystem(format!("factorisation failed: {e:?}")))?;

    let max_diag = csc
        .triplet_iter()
        .filter(|(i, j, _)| i == j)
        .fold(0.0_f64, |acc, (_, _, &v)| acc.max(v.abs()));
    let min_pivot = cholesky
        .l()
        .triplet_iter()
        .filter(|(i, j, _)| i == j)
        .fold(f64::INFINITY, |acc, (_, _, &v)| acc.min(v * v));
    if !(min_pivot.is_finite() && min_pivot > PIVOT_TOLERANCE * max_diag) {
        return Err(PhaseError::SingularSystem(format!(
            "pivot {min_pivot:e} below tolerance for diagonal scale {max_diag:e}"
        )));
    }

    let rhs = DMatrix::from_column_slice(b.len(), 1, b);
    let x = cholesky.solve(&rhs);
    let solution: Vec<f64> = x.column(0).iter().copied().collect();
    if solution.iter().any(|v| !v.is_finite()) {
        return Err(PhaseError::SingularSystem("non-finite solution".into()));
    }
    Ok(solution)
}

fn residual_inf(coo: &CooMatrix<f64>, x: &[f64], b: &[f64]) -> f64 {
    let mut ax = vec![0.0; b.len()];
    for (i, j, &v) in coo.triplet_iter() {
        ax[i] += v * x[j];
    }
    ax.iter()
        .zip(b)
        .fold(0.0_f64, |acc, (lhs, rhs)| acc.max((lhs - rhs).abs()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::Grid;
    use crate::pattern::Pattern;
    use crate::slopes::slopes_from_phase;

    fn slopes_for(grid: &Grid, pattern: Pattern, mask: &Mask) -> Slopes {
        let phase = pattern.evaluate(grid);
        slopes_from_phase(&phase, grid.dx, grid.dy)
            .unwrap()
            .masked(mask)
            .unwrap()
    }

    #[test]
    fn solve_set_is_raster_ordered_and_skips_border() {
        let mask = Array2::from_elem((4, 5), true);
        let set = SolveSet::from_mask(&mask);
        assert_eq!(set.cells(), &[(1, 1), (1, 2), (1, 3), (2, 1), (2, 2), (2, 3)]);
        assert_eq!(set.index_of(2, 1), Some(3));
        assert_eq!(set.index_of(0, 2), None);
        assert_eq!(set.index_of(9, 9), None);
        assert_eq!(set.components(), 1);
    }

    #[test]
    fn components_counts_separate_islands() {
        let mut mask = Array2::from_elem((7, 7), false);
        mask[[1, 1]] = true;
        mask[[1, 2]] = true;
        mask[[4, 4]] = true;
        mask[[5, 5]] = true;
        assert_eq!(SolveSet::from_mask(&mask).components(), 3);
    }

    #[test]
    fn assembly_folds_missing_neighbours_into_diagonal() {
        // 1x2 strip of unknowns inside a 3x4 grid.
        let mask = Array2::from_elem((3, 4), true);
        let set = SolveSet::from_mask(&mask);
        let rec = PoissonReconstructor::new(1.0, 0.5)
            .unwrap()
            .with_options(ReconstructOptions {
                boundary: SlopeBoundary::ZeroFill,
                pin: false,
            });
        let rhs = Array2::from_elem((3, 4), 2.0);
        let (coo, b) = rec.assemble(&set, &rhs);
        let csc = CscMatrix::from(&coo);
        let dense: Vec<(usize, usize, f64)> =
            csc.triplet_iter().map(|(i, j, &v)| (i, j, v)).collect();
        // cx = 1, cy = 4; each cell has one x-neighbour and no y-neighbours.
        assert!(dense.contains(&(0, 0, 1.0)));
        assert!(dense.contains(&(0, 1, -1.0)));
        assert!(dense.contains(&(1, 0, -1.0)));
        assert!(dense.contains(&(1, 1, 1.0)));
        assert_eq!(b, vec![-2.0, -2.0]);
    }

    #[test]
    fn pinned_row_is_identity_and_symmetric() {
        let mask = Array2::from_elem((4, 4), true);
        let set = SolveSet::from_mask(&mask);
        let rec = PoissonReconstructor::new(1.0, 1.0).unwrap();
        let (coo, b) = rec.assemble(&set, &Array2::from_elem((4, 4), 3.0));
        let csc = CscMatrix::from(&coo);
        let entries: Vec<(usize, usize, f64)> =
            csc.triplet_iter().map(|(i, j, &v)| (i, j, v)).collect();
        assert!(entries.contains(&(0, 0, 1.0)));
        assert!(entries.iter().all(|&(i, j, _)| (i != 0 && j != 0) || (i == 0 && j == 0)));
        for &(i, j, v) in &entries {
            assert!(entries.contains(&(j, i, v)), "entry ({i},{j}) has no mirror");
        }
        assert_eq!(b[0], 0.0);
    }

    #[test]
    fn tilt_reconstructs_to_a_plane() {
        let grid = Grid::new(41, 1.0).unwrap();
        let mask = grid.circular_mask();
        let slopes = slopes_for(&grid, Pattern::tilt(), &mask);
        let phase = poisson_reconstruction(&slopes, grid.dx, grid.dy, &mask).unwrap();

        // Zero-filled edges halve the recovered tilt but keep it planar.
        let set = SolveSet::from_mask(&mask);
        let (i0, j0) = set.cells()[0];
        for &(i, j) in set.cells() {
            let expected = 2.5 * (grid.x[j] - grid.x[j0]);
            let got = phase[[i, j]] - phase[[i0, j0]];
            assert!((got - expected).abs() < 1e-8, "({i},{j}): {got} vs {expected}");
        }
    }

    #[test]
    fn exclude_policy_recovers_quadratics_exactly() {
        let grid = Grid::new(33, 1.0).unwrap();
        let mask = grid.circular_mask();
        let truth = Pattern::Defocus { b: 5.0 }.evaluate(&grid);
        let slopes = slopes_for(&grid, Pattern::Defocus { b: 5.0 }, &mask);
        let rec = PoissonReconstructor::new(grid.dx, grid.dy)
            .unwrap()
            .with_options(ReconstructOptions {
                boundary: SlopeBoundary::Exclude,
                pin: true,
            });
        let phase = rec.reconstruct(&slopes, &mask).unwrap();

        let set = SolveSet::from_mask(&mask);
        let truth_mean =
            set.cells().iter().map(|&(i, j)| truth[[i, j]]).sum::<f64>() / set.len() as f64;
        for &(i, j) in set.cells() {
            assert!((phase[[i, j]] - (truth[[i, j]] - truth_mean)).abs() < 1e-8);
        }
    }

    #[test]
    fn output_has_zero_mean_and_respects_mask() {
        let grid = Grid::new(25, 1.0).unwrap();
        let mask = grid.circular_mask();
        let slopes = slopes_for(&grid, Pattern::astigmatism(), &mask);
        let (phase, report) = PoissonReconstructor::new(grid.dx, grid.dy)
            .unwrap()
            .reconstruct_with_report(&slopes, &mask)
            .unwrap();

        let set = SolveSet::from_mask(&mask);
        let mean = set.cells().iter().map(|&(i, j)| phase[[i, j]]).sum::<f64>() / set.len() as f64;
        assert!(mean.abs() < 1e-9);
        for ((i, j), v) in phase.indexed_iter() {
            assert_eq!(set.contains(i, j), v.is_finite());
            if !mask[[i, j]] {
                assert!(v.is_nan());
            }
        }
        assert_eq!(report.unknowns, set.len());
        assert_eq!(report.pinned, Some(set.cells()[0]));
        assert!(report.residual_inf < 1e-6);
    }

    #[test]
    fn empty_mask_is_rejected() {
        let mask = Array2::from_elem((5, 5), false);
        let slopes = Slopes::new(Array2::zeros((5, 5)), Array2::zeros((5, 5))).unwrap();
        assert_eq!(
            poisson_reconstruction(&slopes, 1.0, 1.0, &mask),
            Err(PhaseError::EmptyDomain)
        );
    }

    #[test]
    fn border_only_mask_is_empty() {
        let mut mask = Array2::from_elem((5, 5), false);
        mask.row_mut(0).fill(true);
        mask.column_mut(4).fill(true);
        let slopes = Slopes::new(Array2::zeros((5, 5)), Array2::zeros((5, 5))).unwrap();
        assert_eq!(
            poisson_reconstruction(&slopes, 1.0, 1.0, &mask),
            Err(PhaseError::EmptyDomain)
        );
    }

    #[test]
    fn shape_mismatch_is_rejected() {
        let mask = Array2::from_elem((5, 5), true);
        let slopes = Slopes::new(Array2::zeros((5, 6)), Array2::zeros((5, 6))).unwrap();
        assert!(matches!(
            poisson_reconstruction(&slopes, 1.0, 1.0, &mask),
            Err(PhaseError::ShapeMismatch { what: "sx", .. })
        ));
    }

    #[test]
    fn disconnected_mask_is_rejected() {
        let mut mask = Array2::from_elem((9, 9), false);
        for i in 1..4 {
            for j in 1..4 {
                mask[[i, j]] = true;
                mask[[i + 4, j + 4]] = true;
            }
        }
        let slopes = Slopes::new(Array2::zeros((9, 9)), Array2::zeros((9, 9))).unwrap();
        assert_eq!(
            poisson_reconstruction(&slopes, 1.0, 1.0, &mask),
            Err(PhaseError::DisconnectedDomain { components: 2 })
        );
    }

    #[test]
    fn unpinned_system_is_singular() {
        let grid = Grid::new(15, 1.0).unwrap();
        let mask = grid.circular_mask();
        let slopes = slopes_for(&grid, Pattern::tilt(), &mask);
        let rec = PoissonReconstructor::new(grid.dx, grid.dy)
            .unwrap()
            .with_options(ReconstructOptions {
                boundary: SlopeBoundary::ZeroFill,
                pin: false,
            });
        assert!(matches!(
            rec.reconstruct(&slopes, &mask),
            Err(PhaseError::SingularSystem(_))
        ));
    }

    #[test]
    fn exclude_policy_rejects_holes_in_the_data() {
        let grid = Grid::new(15, 1.0).unwrap();
        let mask = grid.circular_mask();
        let mut slopes = slopes_for(&grid, Pattern::tilt(), &mask);
        slopes.sx[[7, 7]] = f64::NAN;
        let mut rec = PoissonReconstructor::new(grid.dx, grid.dy).unwrap();
        rec.set_boundary(SlopeBoundary::Exclude);
        assert_eq!(
            rec.reconstruct(&slopes, &mask),
            Err(PhaseError::UndefinedInDomain {
                what: "sx",
                row: 7,
                col: 7
            })
        );

        // Zero-fill treats the same hole as a zero measurement.
        rec.set_boundary(SlopeBoundary::ZeroFill);
        assert!(rec.reconstruct(&slopes, &mask).is_ok());
    }

    #[test]
    fn single_unknown_reconstructs_to_zero() {
        let mut mask = Array2::from_elem((3, 3), false);
        mask[[1, 1]] = true;
        let slopes = Slopes::new(Array2::zeros((3, 3)), Array2::zeros((3, 3))).unwrap();
        let phase = poisson_reconstruction(&slopes, 0.5, 0.5, &mask).unwrap();
        assert_eq!(phase[[1, 1]], 0.0);
        assert_eq!(phase.iter().filter(|v| v.is_nan()).count(), 8);
    }

    #[test]
    fn rejects_non_positive_spacing() {
        assert!(PoissonReconstructor::new(0.0, 1.0).is_err());
        assert!(PoissonReconstructor::new(1.0, f64::INFINITY).is_err());
    }
}
