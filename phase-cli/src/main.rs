mod selection;

use clap::Parser;
use phase_core::convergence::{order_accepted, run_fields, run_sweep, ConvergenceConfig};
use selection::{describe, parse_usize_list, BoundaryArg, OffsetArg, Weights};
use serde::Serialize;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Output directory
    #[arg(long)]
    out: PathBuf,

    /// JSON sweep configuration; flags below override its fields
    #[arg(long)]
    config: Option<PathBuf>,

    /// Comma-separated grid sizes N (NxN), e.g. "16,32,64,128"
    #[arg(long)]
    resolutions: Option<String>,

    /// Comma-separated erosion depths, e.g. "0,1,2,3"
    #[arg(long)]
    rims: Option<String>,

    /// Grid half width L (grid spans [-L, L])
    #[arg(long)]
    half_width: Option<f64>,

    /// Tilt weight (selects tilt)
    #[arg(long)]
    tilt: Option<f64>,

    /// Defocus weight (selects defocus)
    #[arg(long)]
    defocus: Option<f64>,

    /// Astigmatism weight (selects astigmatism)
    #[arg(long)]
    astig: Option<f64>,

    /// Coma weight (selects coma)
    #[arg(long)]
    coma: Option<f64>,

    /// Spherical aberration weight (selects spherical)
    #[arg(long)]
    spherical: Option<f64>,

    /// Offset removed from both fields before the RMS
    #[arg(long, value_enum)]
    offset: Option<OffsetArg>,

    /// How undefined slopes enter the Poisson right-hand side
    #[arg(long, value_enum)]
    boundary: Option<BoundaryArg>,

    /// Run resolutions concurrently
    #[arg(long)]
    parallel: bool,

    /// Also dump truth/reconstruction/mask for this grid size
    #[arg(long)]
    dump_n: Option<usize>,
}

#[derive(Serialize)]
struct ConvergenceRow<'a> {
    n: usize,
    h: f64,
    rim: usize,
    rms: f64,
    unknowns: usize,

    disturbance: &'a str,
    boundary: &'static str,
    offset: &'static str,
}

#[derive(Serialize)]
struct OrderRow {
    rim: usize,
    order: Option<f64>,
    accepted: bool,
}

#[derive(Serialize)]
struct Summary<'a> {
    config: &'a ConvergenceConfig,
    orders: Vec<OrderRow>,
    failures: &'a [phase_core::TrialFailure],
}

#[derive(Serialize)]
struct FieldsMeta {
    n: usize,
    h: f64,
    half_width: f64,
    unknowns: usize,
    layout: &'static str,
    files: [&'static str; 3],
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let args = Args::parse();

    let config = build_config(&args)?;
    config.validate()?;

    fs::create_dir_all(&args.out)?;

    let report = run_sweep(&config)?;
    let label = describe(&config.disturbance);

    let mut rows_file = BufWriter::new(
        OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(args.out.join("convergence.jsonl"))?,
    );

    let mut row_count = 0usize;
    for case in &report.cases {
        for e in &case.errors {
            let row = ConvergenceRow {
                n: case.n,
                h: case.h,
                rim: e.rim,
                rms: e.rms,
                unknowns: case.unknowns,

                disturbance: &label,
                boundary: config.boundary.as_str(),
                offset: config.offset.as_str(),
            };
            serde_json::to_writer(&mut rows_file, &row)?;
            rows_file.write_all(b"\n")?;
            row_count += 1;

            println!("n={:<5} h={:<10.6} rim={:<3} rms={:.6e}", case.n, case.h, e.rim, e.rms);
        }
    }
    rows_file.flush()?;

    let orders: Vec<OrderRow> = report
        .orders()
        .into_iter()
        .map(|(rim, order)| OrderRow {
            rim,
            order,
            accepted: order.is_some_and(order_accepted),
        })
        .collect();
    for o in &orders {
        match o.order {
            Some(p) if o.accepted => info!(rim = o.rim, order = p, "second-order convergence"),
            Some(p) => warn!(rim = o.rim, order = p, "convergence order outside 2 ± 0.3"),
            None => warn!(rim = o.rim, "not enough points to fit an order"),
        }
    }

    let summary = Summary {
        config: &config,
        orders,
        failures: &report.failures,
    };
    serde_json::to_writer_pretty(File::create(args.out.join("orders.json"))?, &summary)?;

    if let Some(n) = args.dump_n {
        dump_fields(&args.out, n, &config)?;
    }

    println!("Wrote sweep to: {}", args.out.display());
    println!(
        "Rows: {} (resolutions={} * rims={}), failures: {}",
        row_count,
        config.resolutions.len(),
        config.rims.len(),
        report.failures.len()
    );

    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn build_config(args: &Args) -> Result<ConvergenceConfig, Box<dyn std::error::Error>> {
    let mut config = match &args.config {
        Some(path) => {
            let raw = fs::read_to_string(path)?;
            serde_json::from_str(&raw).map_err(|e| format!("{}: {e}", path.display()))?
        }
        None => ConvergenceConfig::default(),
    };

    if let Some(s) = &args.resolutions {
        config.resolutions = parse_usize_list(s)?;
    }
    if let Some(s) = &args.rims {
        config.rims = parse_usize_list(s)?;
    }
    if let Some(l) = args.half_width {
        config.half_width = l;
    }
    let weights = Weights {
        tilt: args.tilt,
        defocus: args.defocus,
        astig: args.astig,
        coma: args.coma,
        spherical: args.spherical,
    };
    if weights.any() {
        config.disturbance = weights.disturbance();
    }
    if let Some(o) = args.offset {
        config.offset = o.into();
    }
    if let Some(b) = args.boundary {
        config.boundary = b.into();
    }
    config.parallel |= args.parallel;

    Ok(config)
}

fn dump_fields(
    out: &Path,
    n: usize,
    config: &ConvergenceConfig,
) -> Result<(), Box<dyn std::error::Error>> {
    let fields = run_fields(n, config).map_err(|e| format!("run_fields(n={n}): {e}"))?;

    let mut truth_writer = BufWriter::new(File::create(out.join("truth.bin"))?);
    let mut recon_writer = BufWriter::new(File::create(out.join("recon.bin"))?);
    let mut mask_writer = BufWriter::new(File::create(out.join("mask.bin"))?);

    write_f64_iter(&mut truth_writer, fields.truth.iter().copied())?;
    write_f64_iter(&mut recon_writer, fields.recon.iter().copied())?;
    for &m in fields.mask.iter() {
        mask_writer.write_all(&[m as u8])?;
    }

    truth_writer.flush()?;
    recon_writer.flush()?;
    mask_writer.flush()?;

    let meta = FieldsMeta {
        n: fields.grid.n(),
        h: fields.grid.spacing(),
        half_width: fields.grid.half_width(),
        unknowns: fields.unknowns,
        layout: "row-major f64 little-endian; NaN outside the solve set",
        files: ["truth.bin", "recon.bin", "mask.bin"],
    };
    serde_json::to_writer_pretty(File::create(out.join("fields.json"))?, &meta)?;

    info!(n, unknowns = fields.unknowns, "dumped fields");
    Ok(())
}

fn write_f64_iter<W: Write>(w: &mut W, values: impl Iterator<Item = f64>) -> std::io::Result<()> {
    for x in values {
        w.write_all(&x.to_le_bytes())?;
    }
    Ok(())
}
