use phase_core::convergence::{run_fields, CaseFields, ConvergenceConfig};
use phase_core::{rms_error, Disturbance, OffsetRemoval, SlopeBoundary};
use wasm_bindgen::prelude::*;

#[wasm_bindgen]
pub struct Session {
    n: usize,
    config: ConvergenceConfig,
    last: Option<CaseFields>,
}

#[wasm_bindgen]
impl Session {
    #[wasm_bindgen(constructor)]
    pub fn new(n: usize, half_width: f64) -> Result<Session, JsValue> {
        let config = ConvergenceConfig {
            half_width,
            resolutions: vec![n],
            ..ConvergenceConfig::default()
        };
        config.validate().map_err(to_js)?;
        Ok(Session {
            n,
            config,
            last: None,
        })
    }

    // Weights; zero deselects a component
    pub fn set_weights(&mut self, tilt: f64, defocus: f64, astig: f64, coma: f64, spherical: f64) {
        let selection = [tilt, defocus, astig, coma, spherical].map(|w| (w != 0.0, w));
        self.config.disturbance = Disturbance::from_selection(&selection);
        self.last = None;
    }

    pub fn set_boundary_exclude(&mut self, exclude: bool) {
        self.config.boundary = if exclude {
            SlopeBoundary::Exclude
        } else {
            SlopeBoundary::ZeroFill
        };
        self.last = None;
    }

    pub fn set_remove_plane(&mut self, plane: bool) {
        self.config.offset = if plane {
            OffsetRemoval::Plane
        } else {
            OffsetRemoval::Mean
        };
    }

    pub fn n(&self) -> usize { self.n }

    // Reconstruct (if stale) + RMS + timing
    pub fn run(&mut self, rim: usize) -> Result<RunInfo, JsValue> {
        let t0 = now_ms();
        if self.last.is_none() {
            self.last = Some(run_fields(self.n, &self.config).map_err(to_js)?);
        }
        let fields = self.fields()?;
        let rms = rms_error(&fields.truth, &fields.recon, &fields.mask, rim, self.config.offset)
            .map_err(to_js)?;
        let unknowns = fields.unknowns;
        let t1 = now_ms();
        Ok(RunInfo { rms, compute_ms: t1 - t0, unknowns })
    }

    // Copy-based JS access, row-major; NaN marks undefined cells
    pub fn truth(&self) -> Result<Vec<f64>, JsValue> {
        Ok(self.fields()?.truth.iter().copied().collect())
    }

    pub fn recon(&self) -> Result<Vec<f64>, JsValue> {
        Ok(self.fields()?.recon.iter().copied().collect())
    }

    pub fn mask(&self) -> Result<Vec<u8>, JsValue> {
        Ok(self.fields()?.mask.iter().map(|&m| m as u8).collect())
    }
}

impl Session {
    fn fields(&self) -> Result<&CaseFields, JsValue> {
        self.last
            .as_ref()
            .ok_or_else(|| JsValue::from_str("no reconstruction yet: call run() first"))
    }
}

#[wasm_bindgen]
pub struct RunInfo {
    rms: f64,
    compute_ms: f64,
    unknowns: usize,
}

#[wasm_bindgen]
impl RunInfo {
    pub fn rms(&self) -> f64 { self.rms }
    pub fn compute_ms(&self) -> f64 { self.compute_ms }
    pub fn unknowns(&self) -> usize { self.unknowns }
}

fn to_js(e: phase_core::PhaseError) -> JsValue {
    JsValue::from_str(&e.to_string())
}

fn now_ms() -> f64 {
    web_sys::window()
        .and_then(|w| w.performance())
        .map(|p| p.now())
        .unwrap_or(0.0)
}
