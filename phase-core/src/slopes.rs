//! Centred finite-difference slope extraction.

use ndarray::Array2;

use crate::error::{PhaseError, PhaseResult};
use crate::grid::Mask;

/// Pair of gradient fields. NaN marks "no measurement".
#[derive(Debug, Clone)]
pub struct Slopes {
    pub sx: Array2<f64>,
    pub sy: Array2<f64>,
}

impl Slopes {
    pub fn new(sx: Array2<f64>, sy: Array2<f64>) -> PhaseResult<Slopes> {
        if sx.dim() != sy.dim() {
            return Err(PhaseError::ShapeMismatch {
                what: "sy",
                expected: sx.dim(),
                found: sy.dim(),
            });
        }
        Ok(Slopes { sx, sy })
    }

    pub fn dim(&self) -> (usize, usize) {
        self.sx.dim()
    }

    /// Copy with every cell outside `mask` marked undefined.
    pub fn masked(&self, mask: &Mask) -> PhaseResult<Slopes> {
        if mask.dim() != self.dim() {
            return Err(PhaseError::ShapeMismatch {
                what: "mask",
                expected: self.dim(),
                found: mask.dim(),
            });
        }
        let mut out = self.clone();
        for ((sx, sy), &inside) in out.sx.iter_mut().zip(out.sy.iter_mut()).zip(mask.iter()) {
            if !inside {
                *sx = f64::NAN;
                *sy = f64::NAN;
            }
        }
        Ok(out)
    }
}

/// Centred differences of `field`: `sx` along columns with `dx`, `sy` along
/// rows with `dy`. The outer ring has no centred pair and stays undefined.
pub fn slopes_from_phase(field: &Array2<f64>, dx: f64, dy: f64) -> PhaseResult<Slopes> {
    let (rows, cols) = field.dim();
    if rows < 3 || cols < 3 {
        return Err(PhaseError::InvalidGrid(format!(
            "field must be at least 3x3, got {rows}x{cols}"
        )));
    }
    if !(dx > 0.0 && dy > 0.0) {
        return Err(PhaseError::InvalidGrid(format!(
            "spacing must be positive, got dx={dx}, dy={dy}"
        )));
    }

    let mut sx = Array2::from_elem((rows, cols), f64::NAN);
    let mut sy = Array2::from_elem((rows, cols), f64::NAN);

    for i in 1..rows - 1 {
        for j in 1..cols - 1 {
            sx[[i, j]] = (field[[i, j + 1]] - field[[i, j - 1]]) / (2.0 * dx);
            sy[[i, j]] = (field[[i + 1, j]] - field[[i - 1, j]]) / (2.0 * dy);
        }
    }

    Ok(Slopes { sx, sy })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::Grid;
    use crate::pattern::Pattern;

    #[test]
    fn tilt_has_constant_slope() {
        let grid = Grid::new(21, 1.0).unwrap();
        let phase = Pattern::Tilt { a: 3.0 }.evaluate(&grid);
        let s = slopes_from_phase(&phase, grid.dx, grid.dy).unwrap();
        for i in 1..20 {
            for j in 1..20 {
                assert!((s.sx[[i, j]] - 3.0).abs() < 1e-10);
                assert!(s.sy[[i, j]].abs() < 1e-10);
            }
        }
    }

    #[test]
    fn outer_ring_is_undefined() {
        let field = Array2::from_elem((4, 6), 1.0);
        let s = slopes_from_phase(&field, 0.1, 0.1).unwrap();
        for j in 0..6 {
            assert!(s.sx[[0, j]].is_nan() && s.sy[[3, j]].is_nan());
        }
        for i in 0..4 {
            assert!(s.sx[[i, 0]].is_nan() && s.sy[[i, 5]].is_nan());
        }
        assert_eq!(s.sx[[1, 1]], 0.0);
        assert_eq!(s.sy[[2, 4]], 0.0);
    }

    #[test]
    fn defocus_slopes_are_exact_for_quadratics() {
        let grid = Grid::new(17, 1.0).unwrap();
        let phase = Pattern::Defocus { b: 2.0 }.evaluate(&grid);
        let s = slopes_from_phase(&phase, grid.dx, grid.dy).unwrap();
        let (i, j) = (5, 12);
        assert!((s.sx[[i, j]] - 4.0 * grid.x[j]).abs() < 1e-10);
        assert!((s.sy[[i, j]] - 4.0 * grid.y[i]).abs() < 1e-10);
    }

    #[test]
    fn unequal_spacing_uses_the_right_axis() {
        let field = Array2::from_shape_fn((3, 3), |(i, j)| 2.0 * j as f64 + 10.0 * i as f64);
        let s = slopes_from_phase(&field, 0.5, 2.0).unwrap();
        assert!((s.sx[[1, 1]] - 4.0).abs() < 1e-12);
        assert!((s.sy[[1, 1]] - 5.0).abs() < 1e-12);
    }

    #[test]
    fn nan_neighbours_propagate() {
        let mut field = Array2::from_elem((5, 5), 0.0);
        field[[2, 3]] = f64::NAN;
        let s = slopes_from_phase(&field, 1.0, 1.0).unwrap();
        assert!(s.sx[[2, 2]].is_nan());
        assert!(s.sy[[1, 3]].is_nan());
        assert_eq!(s.sx[[1, 2]], 0.0);
    }

    #[test]
    fn rejects_small_fields_and_bad_spacing() {
        assert!(slopes_from_phase(&Array2::zeros((2, 5)), 1.0, 1.0).is_err());
        assert!(slopes_from_phase(&Array2::zeros((5, 5)), 0.0, 1.0).is_err());
    }

    #[test]
    fn masking_clears_outside_cells() {
        let grid = Grid::new(9, 1.0).unwrap();
        let phase = Pattern::tilt().evaluate(&grid);
        let mask = grid.circular_mask();
        let s = slopes_from_phase(&phase, grid.dx, grid.dy)
            .unwrap()
            .masked(&mask)
            .unwrap();
        assert!(s.sx[[1, 1]].is_nan());
        assert!((s.sx[[4, 4]] - 5.0).abs() < 1e-10);
        assert!(s.masked(&Array2::from_elem((3, 3), true)).is_err());
    }
}
