//! Square sampling lattice and circular pupil mask.
//!
//! Arrays are indexed `[[row, col]]`: rows follow `y`, columns follow `x`.

use ndarray::{Array1, Array2};

use crate::error::{PhaseError, PhaseResult};

/// Boolean aperture mask, true inside the domain of interest.
pub type Mask = Array2<bool>;

/// N×N lattice over `[-L, L]²` with uniform spacing.
#[derive(Debug, Clone)]
pub struct Grid {
    n: usize,
    half_width: f64,
    pub x: Array1<f64>,
    pub y: Array1<f64>,
    pub dx: f64,
    pub dy: f64,
}

impl Grid {
    pub fn new(n: usize, half_width: f64) -> PhaseResult<Grid> {
        if n < 3 {
            return Err(PhaseError::InvalidGrid(format!("n must be >= 3, got {n}")));
        }
        if !(half_width.is_finite() && half_width > 0.0) {
            return Err(PhaseError::InvalidGrid(format!(
                "half width must be positive and finite, got {half_width}"
            )));
        }

        let x = Array1::linspace(-half_width, half_width, n);
        let y = x.clone();
        let h = 2.0 * half_width / (n - 1) as f64;

        Ok(Grid {
            n,
            half_width,
            x,
            y,
            dx: h,
            dy: h,
        })
    }

    pub fn n(&self) -> usize {
        self.n
    }

    pub fn half_width(&self) -> f64 {
        self.half_width
    }

    pub fn shape(&self) -> (usize, usize) {
        (self.n, self.n)
    }

    /// Grid spacing `h`. Only meaningful while `dx == dy`.
    pub fn spacing(&self) -> f64 {
        self.dx
    }

    /// Coordinate arrays `(X, Y)` with `X[[i, j]] = x[j]` and `Y[[i, j]] = y[i]`.
    pub fn meshgrid(&self) -> (Array2<f64>, Array2<f64>) {
        let xx = Array2::from_shape_fn(self.shape(), |(_, j)| self.x[j]);
        let yy = Array2::from_shape_fn(self.shape(), |(i, _)| self.y[i]);
        (xx, yy)
    }

    /// Circular pupil `x² + y² <= L²`.
    pub fn circular_mask(&self) -> Mask {
        let r2 = self.half_width * self.half_width;
        Array2::from_shape_fn(self.shape(), |(i, j)| {
            self.x[j] * self.x[j] + self.y[i] * self.y[i] <= r2
        })
    }
}

/// Clear the outermost ring of a mask in place.
pub(crate) fn clear_border(mask: &mut Mask) {
    let (rows, cols) = mask.dim();
    if rows == 0 || cols == 0 {
        return;
    }
    for j in 0..cols {
        mask[[0, j]] = false;
        mask[[rows - 1, j]] = false;
    }
    for i in 0..rows {
        mask[[i, 0]] = false;
        mask[[i, cols - 1]] = false;
    }
}
