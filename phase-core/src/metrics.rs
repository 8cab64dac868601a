//! RMS comparison of two phase maps over an eroded aperture.
//!
//! Slopes carry no information about piston or tip/tilt, so by default each
//! field has its own least-squares plane removed before the difference is
//! taken.

use nalgebra::{Matrix3, Vector3};
use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::error::{PhaseError, PhaseResult};
use crate::grid::{clear_border, Mask};

/// `1 - r²` of the centred cell coordinates below which the cells are
/// treated as collinear.
const DEGENERATE_DET: f64 = 1e-10;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OffsetRemoval {
    /// Piston and tip/tilt.
    #[default]
    Plane,
    /// Piston only.
    Mean,
}

impl OffsetRemoval {
    pub fn as_str(&self) -> &'static str {
        match self {
            OffsetRemoval::Plane => "plane",
            OffsetRemoval::Mean => "mean",
        }
    }
}

/// Shrinks `mask` by `rim` cells, then clears the outer ring.
///
/// Each round keeps a cell only if it and its four axis neighbours are kept.
/// Neighbours wrap around the array edge; the final ring clear removes
/// anything that wrap could have let through.
pub fn erode(mask: &Mask, rim: usize) -> Mask {
    let (rows, cols) = mask.dim();
    let mut cur = mask.clone();

    for _ in 0..rim {
        let prev = cur.clone();
        for ((i, j), keep) in cur.indexed_iter_mut() {
            *keep = prev[[i, j]]
                && prev[[(i + rows - 1) % rows, j]]
                && prev[[(i + 1) % rows, j]]
                && prev[[i, (j + cols - 1) % cols]]
                && prev[[i, (j + 1) % cols]];
        }
    }

    clear_border(&mut cur);
    cur
}

/// Eroded mask intersected with the cells where both fields are finite.
pub fn validity_mask(
    truth: &Array2<f64>,
    recon: &Array2<f64>,
    mask: &Mask,
    rim: usize,
) -> PhaseResult<Mask> {
    for (what, dim) in [("truth", truth.dim()), ("recon", recon.dim())] {
        if dim != mask.dim() {
            return Err(PhaseError::ShapeMismatch {
                what,
                expected: mask.dim(),
                found: dim,
            });
        }
    }

    let mut valid = erode(mask, rim);
    for ((i, j), v) in valid.indexed_iter_mut() {
        *v = *v && truth[[i, j]].is_finite() && recon[[i, j]].is_finite();
    }
    Ok(valid)
}

/// `z = a·col + b·row + c` in pixel coordinates.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Plane {
    pub a: f64,
    pub b: f64,
    pub c: f64,
}

impl Plane {
    pub fn at(&self, row: usize, col: usize) -> f64 {
        self.a * col as f64 + self.b * row as f64 + self.c
    }
}

/// Least-squares plane through `field` over the cells of `valid`.
pub fn fit_plane(field: &Array2<f64>, valid: &Mask) -> PhaseResult<Plane> {
    let cells: Vec<(f64, f64, f64)> = valid
        .indexed_iter()
        .filter(|&(_, &v)| v)
        .map(|((i, j), _)| (j as f64, i as f64, field[[i, j]]))
        .collect();
    if cells.len() < 3 {
        return Err(PhaseError::DegenerateFit);
    }

    // Centre the coordinates so the normal matrix stays well conditioned.
    let n = cells.len() as f64;
    let (mc, mr, mz) = cells
        .iter()
        .fold((0.0, 0.0, 0.0), |(a, b, c), &(x, y, z)| (a + x, b + y, c + z));
    let (mc, mr, mz) = (mc / n, mr / n, mz / n);

    let mut ata = Matrix3::zeros();
    let mut atz = Vector3::zeros();
    for &(x, y, z) in &cells {
        let row = Vector3::new(x - mc, y - mr, 1.0);
        ata += row * row.transpose();
        atz += row * (z - mz);
    }

    // det / (Sxx * Syy * n) = 1 - r², independent of how far the cells spread.
    let (sxx, syy) = (ata[(0, 0)], ata[(1, 1)]);
    if sxx <= 0.0 || syy <= 0.0 {
        return Err(PhaseError::DegenerateFit);
    }
    if ata.determinant() / (sxx * syy * n) <= DEGENERATE_DET {
        return Err(PhaseError::DegenerateFit);
    }
    let coef = ata.lu().solve(&atz).ok_or(PhaseError::DegenerateFit)?;

    let (a, b) = (coef[0], coef[1]);
    Ok(Plane {
        a,
        b,
        c: coef[2] + mz - a * mc - b * mr,
    })
}

/// Copy of `field` with its own best-fit plane subtracted over `valid`.
pub fn remove_plane(field: &Array2<f64>, valid: &Mask) -> PhaseResult<Array2<f64>> {
    let plane = fit_plane(field, valid)?;
    let mut out = field.clone();
    for ((i, j), v) in out.indexed_iter_mut() {
        if valid[[i, j]] {
            *v -= plane.at(i, j);
        }
    }
    Ok(out)
}

/// Copy of `field` with its own mean subtracted over `valid`.
pub(crate) fn remove_mean(field: &Array2<f64>, valid: &Mask) -> PhaseResult<Array2<f64>> {
    let (sum, count) = field
        .iter()
        .zip(valid.iter())
        .filter(|&(_, &v)| v)
        .fold((0.0, 0usize), |(s, c), (&f, _)| (s + f, c + 1));
    if count == 0 {
        return Err(PhaseError::EmptyValidity { rim: 0 });
    }
    let mean = sum / count as f64;
    let mut out = field.clone();
    out.zip_mut_with(valid, |f, &v| {
        if v {
            *f -= mean;
        }
    });
    Ok(out)
}

/// RMS difference between `truth` and `recon` over the validity set, after
/// removing each field's own offset.
pub fn rms_error(
    truth: &Array2<f64>,
    recon: &Array2<f64>,
    mask: &Mask,
    rim: usize,
    offset: OffsetRemoval,
) -> PhaseResult<f64> {
    let valid = validity_mask(truth, recon, mask, rim)?;
    let count = valid.iter().filter(|&&v| v).count();
    if count == 0 {
        return Err(PhaseError::EmptyValidity { rim });
    }

    let (tp, rp) = match offset {
        OffsetRemoval::Plane => (remove_plane(truth, &valid)?, remove_plane(recon, &valid)?),
        OffsetRemoval::Mean => (remove_mean(truth, &valid)?, remove_mean(recon, &valid)?),
    };

    let mut sum_sq = 0.0;
    for ((i, j), &v) in valid.indexed_iter() {
        if v {
            let d = tp[[i, j]] - rp[[i, j]];
            sum_sq += d * d;
        }
    }
    Ok((sum_sq / count as f64).sqrt())
}
