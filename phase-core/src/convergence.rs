//! Resolution sweep: ground truth → slopes → reconstruction → RMS error.
//!
//! Every resolution is an independent trial. Failures are recorded against
//! the `(n, rim)` that caused them and the sweep moves on.

use ndarray::Array2;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{PhaseError, PhaseResult};
use crate::grid::{Grid, Mask};
use crate::metrics::{rms_error, OffsetRemoval};
use crate::pattern::{Disturbance, Pattern};
use crate::reconstruct::{PoissonReconstructor, ReconstructOptions, SlopeBoundary};
use crate::slopes::slopes_from_phase;

/// Second-order accuracy of the five-point scheme.
pub const EXPECTED_ORDER: f64 = 2.0;
pub const ORDER_TOLERANCE: f64 = 0.3;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConvergenceConfig {
    pub half_width: f64,
    pub resolutions: Vec<usize>,
    pub rims: Vec<usize>,
    pub disturbance: Disturbance,
    pub offset: OffsetRemoval,
    pub boundary: SlopeBoundary,
    pub parallel: bool,
}

impl Default for ConvergenceConfig {
    fn default() -> Self {
        ConvergenceConfig {
            half_width: 1.0,
            resolutions: vec![16, 32, 64, 128],
            rims: vec![0, 1, 2, 3],
            disturbance: Disturbance::new()
                .with(Pattern::tilt(), 1.0)
                .with(Pattern::defocus(), 1.0),
            offset: OffsetRemoval::Plane,
            boundary: SlopeBoundary::ZeroFill,
            parallel: false,
        }
    }
}

impl ConvergenceConfig {
    pub fn validate(&self) -> PhaseResult<()> {
        if !(self.half_width.is_finite() && self.half_width > 0.0) {
            return Err(PhaseError::Config(format!(
                "half_width must be positive, got {}",
                self.half_width
            )));
        }
        if self.resolutions.is_empty() {
            return Err(PhaseError::Config("resolutions is empty".into()));
        }
        if let Some(&n) = self.resolutions.iter().find(|&&n| n < 3) {
            return Err(PhaseError::Config(format!("resolution {n} is below 3")));
        }
        if self.rims.is_empty() {
            return Err(PhaseError::Config("rims is empty".into()));
        }
        Ok(())
    }

    fn reconstruct_options(&self) -> ReconstructOptions {
        ReconstructOptions {
            boundary: self.boundary,
            pin: true,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct RimError {
    pub rim: usize,
    pub rms: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TrialFailure {
    pub n: usize,
    /// `None` when the reconstruction itself failed.
    pub rim: Option<usize>,
    pub message: String,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CaseResult {
    pub n: usize,
    pub h: f64,
    pub unknowns: usize,
    pub errors: Vec<RimError>,
    pub failures: Vec<TrialFailure>,
}

/// Fields of one trial, for plotting consumers.
#[derive(Clone, Debug)]
pub struct CaseFields {
    pub grid: Grid,
    pub mask: Mask,
    pub truth: Array2<f64>,
    pub recon: Array2<f64>,
    pub unknowns: usize,
}

/// Builds the domain and ground truth for `n` and reconstructs it.
pub fn run_fields(n: usize, config: &ConvergenceConfig) -> PhaseResult<CaseFields> {
    let grid = Grid::new(n, config.half_width)?;
    let mask = grid.circular_mask();
    let truth = config.disturbance.evaluate(&grid);

    let slopes = slopes_from_phase(&truth, grid.dx, grid.dy)?.masked(&mask)?;
    let (recon, report) = PoissonReconstructor::new(grid.dx, grid.dy)?
        .with_options(config.reconstruct_options())
        .reconstruct_with_report(&slopes, &mask)?;

    Ok(CaseFields {
        grid,
        mask,
        truth,
        recon,
        unknowns: report.unknowns,
    })
}

/// One resolution, every rim in `config.rims`.
pub fn run_case(n: usize, config: &ConvergenceConfig) -> PhaseResult<CaseResult> {
    let fields = run_fields(n, config)?;
    let h = fields.grid.spacing();

    let mut errors = Vec::with_capacity(config.rims.len());
    let mut failures = Vec::new();
    for &rim in &config.rims {
        match rms_error(&fields.truth, &fields.recon, &fields.mask, rim, config.offset) {
            Ok(rms) => errors.push(RimError { rim, rms }),
            Err(e) => {
                warn!(n, rim, error = %e, "error metric failed");
                failures.push(TrialFailure {
                    n,
                    rim: Some(rim),
                    message: e.to_string(),
                });
            }
        }
    }

    info!(n, h, unknowns = fields.unknowns, "trial finished");
    Ok(CaseResult {
        n,
        h,
        unknowns: fields.unknowns,
        errors,
        failures,
    })
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct SweepReport {
    /// Ordered by resolution.
    pub cases: Vec<CaseResult>,
    pub failures: Vec<TrialFailure>,
}

impl SweepReport {
    /// `(h, rms)` pairs for one rim, coarse to fine.
    pub fn series(&self, rim: usize) -> Vec<(f64, f64)> {
        self.cases
            .iter()
            .filter_map(|c| c.errors.iter().find(|e| e.rim == rim).map(|e| (c.h, e.rms)))
            .collect()
    }

    pub fn rims(&self) -> Vec<usize> {
        let mut rims: Vec<usize> = self
            .cases
            .iter()
            .flat_map(|c| c.errors.iter().map(|e| e.rim))
            .collect();
        rims.sort_unstable();
        rims.dedup();
        rims
    }

    /// Fitted convergence order per rim.
    pub fn orders(&self) -> Vec<(usize, Option<f64>)> {
        self.rims()
            .into_iter()
            .map(|rim| (rim, fit_order(&self.series(rim))))
            .collect()
    }
}

/// Runs every resolution in `config`. Only an invalid config is an error;
/// per-trial failures are collected in the report.
pub fn run_sweep(config: &ConvergenceConfig) -> PhaseResult<SweepReport> {
    config.validate()?;
    info!(
        disturbance = %config.disturbance.label(),
        boundary = config.boundary.as_str(),
        offset = config.offset.as_str(),
        trials = config.resolutions.len(),
        "starting convergence sweep"
    );

    let outcomes = run_trials(config);

    let mut report = SweepReport::default();
    for (n, outcome) in outcomes {
        match outcome {
            Ok(mut case) => {
                report.failures.append(&mut case.failures);
                report.cases.push(case);
            }
            Err(e) => {
                warn!(n, error = %e, "reconstruction failed");
                report.failures.push(TrialFailure {
                    n,
                    rim: None,
                    message: e.to_string(),
                });
            }
        }
    }
    report.cases.sort_by_key(|c| c.n);
    report.failures.sort_by_key(|f| (f.n, f.rim));
    Ok(report)
}

#[cfg(feature = "parallel")]
fn run_trials(config: &ConvergenceConfig) -> Vec<(usize, PhaseResult<CaseResult>)> {
    use rayon::prelude::*;

    if config.parallel {
        config
            .resolutions
            .par_iter()
            .map(|&n| (n, run_case(n, config)))
            .collect()
    } else {
        run_trials_serial(config)
    }
}

#[cfg(not(feature = "parallel"))]
fn run_trials(config: &ConvergenceConfig) -> Vec<(usize, PhaseResult<CaseResult>)> {
    if config.parallel {
        warn!("parallel sweep requested but the `parallel` feature is disabled");
    }
    run_trials_serial(config)
}

fn run_trials_serial(config: &ConvergenceConfig) -> Vec<(usize, PhaseResult<CaseResult>)> {
    config
        .resolutions
        .iter()
        .map(|&n| (n, run_case(n, config)))
        .collect()
}

/// Least-squares slope of `ln(rms)` against `ln(h)`.
///
/// Points with non-positive or non-finite values are skipped; `None` when
/// fewer than two distinct spacings remain.
pub fn fit_order(points: &[(f64, f64)]) -> Option<f64> {
    let logs: Vec<(f64, f64)> = points
        .iter()
        .filter(|(h, e)| h.is_finite() && e.is_finite() && *h > 0.0 && *e > 0.0)
        .map(|(h, e)| (h.ln(), e.ln()))
        .collect();
    if logs.len() < 2 {
        return None;
    }

    let n = logs.len() as f64;
    let mx = logs.iter().map(|p| p.0).sum::<f64>() / n;
    let my = logs.iter().map(|p| p.1).sum::<f64>() / n;
    let sxx: f64 = logs.iter().map(|p| (p.0 - mx).powi(2)).sum();
    let sxy: f64 = logs.iter().map(|p| (p.0 - mx) * (p.1 - my)).sum();
    if sxx <= f64::EPSILON {
        return None;
    }
    Some(sxy / sxx)
}

pub fn order_accepted(order: f64) -> bool {
    (order - EXPECTED_ORDER).abs() <= ORDER_TOLERANCE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fit_order_recovers_power_law() {
        let pts: Vec<(f64, f64)> = [0.1, 0.05, 0.025]
            .iter()
            .map(|&h| (h, 3.0 * h * h))
            .collect();
        let order = fit_order(&pts).unwrap();
        assert!((order - 2.0).abs() < 1e-12);
        assert!(order_accepted(order));
    }

    #[test]
    fn fit_order_skips_unusable_points() {
        assert_eq!(fit_order(&[(0.1, 1.0)]), None);
        assert_eq!(fit_order(&[(0.1, 1.0), (0.1, 2.0)]), None);
        assert_eq!(fit_order(&[(0.1, 0.0), (0.05, f64::NAN)]), None);
        let order = fit_order(&[(0.2, 0.4), (0.1, 0.1), (0.05, 0.0)]).unwrap();
        assert!((order - 2.0).abs() < 1e-12);
    }

    #[test]
    fn default_config_is_valid() {
        let config = ConvergenceConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.disturbance.label(), "tilt+defocus");
    }

    #[test]
    fn invalid_configs_are_rejected() {
        let mut config = ConvergenceConfig::default();
        config.resolutions = vec![16, 2];
        assert!(matches!(run_sweep(&config), Err(PhaseError::Config(_))));

        let mut config = ConvergenceConfig::default();
        config.rims.clear();
        assert!(config.validate().is_err());

        let mut config = ConvergenceConfig::default();
        config.half_width = -1.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn oversized_rim_is_reported_not_fatal() {
        let config = ConvergenceConfig {
            resolutions: vec![15],
            rims: vec![0, 40],
            ..ConvergenceConfig::default()
        };
        let report = run_sweep(&config).unwrap();
        assert_eq!(report.cases.len(), 1);
        assert_eq!(report.series(0).len(), 1);
        assert!(report.series(40).is_empty());
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].n, 15);
        assert_eq!(report.failures[0].rim, Some(40));
    }

    #[test]
    fn cases_come_back_sorted() {
        let config = ConvergenceConfig {
            resolutions: vec![21, 11, 17],
            rims: vec![0],
            parallel: true,
            ..ConvergenceConfig::default()
        };
        let report = run_sweep(&config).unwrap();
        let ns: Vec<usize> = report.cases.iter().map(|c| c.n).collect();
        assert_eq!(ns, vec![11, 17, 21]);
        assert!(report.failures.is_empty());
    }
}
