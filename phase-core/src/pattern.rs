//! Analytic phase disturbances used as ground truth.
//!
//! Patterns are evaluated on the whole lattice. The aperture is applied to
//! the extracted slopes, not to the phase, so slopes on the aperture edge
//! still come from a full centred stencil.

use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::grid::Grid;

/// Default amplitude used by every pattern.
pub const DEFAULT_AMPLITUDE: f64 = 5.0;

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Pattern {
    /// `a·x`
    Tilt { a: f64 },
    /// `b·(x² + y²)`
    Defocus { b: f64 },
    /// `c·(x'² − y'²)` in axes rotated by `theta_deg`.
    Astigmatism { c: f64, theta_deg: f64 },
    /// `d·(3r² − 2)·x`
    Coma { d: f64 },
    /// `e·(6r⁴ − 6r² + 1)`
    Spherical { e: f64 },
}

impl Pattern {
    pub fn tilt() -> Pattern {
        Pattern::Tilt { a: DEFAULT_AMPLITUDE }
    }

    pub fn defocus() -> Pattern {
        Pattern::Defocus { b: DEFAULT_AMPLITUDE }
    }

    pub fn astigmatism() -> Pattern {
        Pattern::Astigmatism {
            c: DEFAULT_AMPLITUDE,
            theta_deg: 90.0,
        }
    }

    pub fn coma() -> Pattern {
        Pattern::Coma { d: DEFAULT_AMPLITUDE }
    }

    pub fn spherical() -> Pattern {
        Pattern::Spherical { e: DEFAULT_AMPLITUDE }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Pattern::Tilt { .. } => "tilt",
            Pattern::Defocus { .. } => "defocus",
            Pattern::Astigmatism { .. } => "astigmatism",
            Pattern::Coma { .. } => "coma",
            Pattern::Spherical { .. } => "spherical",
        }
    }

    pub fn value(&self, x: f64, y: f64) -> f64 {
        let r2 = x * x + y * y;
        match *self {
            Pattern::Tilt { a } => a * x,
            Pattern::Defocus { b } => b * r2,
            Pattern::Astigmatism { c, theta_deg } => {
                let (s, co) = theta_deg.to_radians().sin_cos();
                let xr = co * x + s * y;
                let yr = -s * x + co * y;
                c * (xr * xr - yr * yr)
            }
            Pattern::Coma { d } => d * (3.0 * r2 - 2.0) * x,
            Pattern::Spherical { e } => e * (6.0 * r2 * r2 - 6.0 * r2 + 1.0),
        }
    }

    pub fn evaluate(&self, grid: &Grid) -> Array2<f64> {
        Array2::from_shape_fn(grid.shape(), |(i, j)| self.value(grid.x[j], grid.y[i]))
    }
}

/// Weighted sum of selected patterns.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Disturbance {
    pub components: Vec<(Pattern, f64)>,
}

impl Disturbance {
    pub fn new() -> Disturbance {
        Disturbance::default()
    }

    pub fn with(mut self, pattern: Pattern, weight: f64) -> Disturbance {
        self.components.push((pattern, weight));
        self
    }

    /// Builds the combination from per-component selection flags and weights,
    /// in the fixed order tilt, defocus, astigmatism, coma, spherical.
    pub fn from_selection(selection: &[(bool, f64); 5]) -> Disturbance {
        let patterns = [
            Pattern::tilt(),
            Pattern::defocus(),
            Pattern::astigmatism(),
            Pattern::coma(),
            Pattern::spherical(),
        ];
        let components = patterns
            .into_iter()
            .zip(selection.iter())
            .filter(|(_, (on, _))| *on)
            .map(|(p, &(_, w))| (p, w))
            .collect();
        Disturbance { components }
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }

    pub fn label(&self) -> String {
        if self.components.is_empty() {
            return "none".into();
        }
        self.components
            .iter()
            .map(|(p, _)| p.as_str())
            .collect::<Vec<_>>()
            .join("+")
    }

    pub fn value(&self, x: f64, y: f64) -> f64 {
        self.components.iter().map(|(p, w)| w * p.value(x, y)).sum()
    }

    pub fn evaluate(&self, grid: &Grid) -> Array2<f64> {
        Array2::from_shape_fn(grid.shape(), |(i, j)| self.value(grid.x[j], grid.y[i]))
    }
}
