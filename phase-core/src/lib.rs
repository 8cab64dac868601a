//! Wavefront reconstruction from slope measurements on a circular pupil.
//!
//! Pipeline: [`pattern`] ground truth → [`slopes`] centred differences →
//! [`reconstruct`] Poisson solve → [`metrics`] RMS error, driven across
//! resolutions by [`convergence`].

pub mod convergence;
pub mod error;
pub mod grid;
pub mod metrics;
pub mod pattern;
pub mod reconstruct;
pub mod slopes;

pub use convergence::{
    fit_order, run_case, run_fields, run_sweep, CaseFields, CaseResult, ConvergenceConfig,
    SweepReport, TrialFailure,
};
pub use error::{PhaseError, PhaseResult};
pub use grid::{Grid, Mask};
pub use metrics::{rms_error, OffsetRemoval};
pub use pattern::{Disturbance, Pattern};
pub use reconstruct::{
    poisson_reconstruction, PoissonReconstructor, ReconstructOptions, SlopeBoundary, SolveReport,
    SolveSet,
};
pub use slopes::{slopes_from_phase, Slopes};
