use clap::ValueEnum;
use phase_core::{Disturbance, OffsetRemoval, Pattern, SlopeBoundary};

#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum OffsetArg {
    Plane,
    Mean,
}

impl From<OffsetArg> for OffsetRemoval {
    fn from(arg: OffsetArg) -> Self {
        match arg {
            OffsetArg::Plane => OffsetRemoval::Plane,
            OffsetArg::Mean => OffsetRemoval::Mean,
        }
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum BoundaryArg {
    ZeroFill,
    Exclude,
}

impl From<BoundaryArg> for SlopeBoundary {
    fn from(arg: BoundaryArg) -> Self {
        match arg {
            BoundaryArg::ZeroFill => SlopeBoundary::ZeroFill,
            BoundaryArg::Exclude => SlopeBoundary::Exclude,
        }
    }
}

/// Per-component weights from the command line. A component is selected
/// when its weight was given.
#[derive(Clone, Copy, Debug, Default)]
pub struct Weights {
    pub tilt: Option<f64>,
    pub defocus: Option<f64>,
    pub astig: Option<f64>,
    pub coma: Option<f64>,
    pub spherical: Option<f64>,
}

impl Weights {
    pub fn any(&self) -> bool {
        self.selection().iter().any(|(on, _)| *on)
    }

    fn selection(&self) -> [(bool, f64); 5] {
        [self.tilt, self.defocus, self.astig, self.coma, self.spherical]
            .map(|w| (w.is_some(), w.unwrap_or(0.0)))
    }

    pub fn disturbance(&self) -> Disturbance {
        Disturbance::from_selection(&self.selection())
    }
}

/// Short description of a disturbance for logs and metadata rows.
pub fn describe(d: &Disturbance) -> String {
    d.components
        .iter()
        .map(|(p, w)| match p {
            Pattern::Astigmatism { theta_deg, .. } => format!("{w}*{}@{theta_deg}", p.as_str()),
            _ => format!("{w}*{}", p.as_str()),
        })
        .collect::<Vec<_>>()
        .join(" + ")
}

/// Comma-separated list of non-negative integers, sorted and deduplicated.
pub fn parse_usize_list(s: &str) -> Result<Vec<usize>, Box<dyn std::error::Error>> {
    let mut out = Vec::new();
    for part in s.split(',') {
        let p = part.trim();
        if p.is_empty() {
            continue;
        }
        out.push(p.parse::<usize>()?);
    }
    out.sort_unstable();
    out.dedup();
    Ok(out)
}
