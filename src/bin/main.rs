#![recursion_limit = "1024"]

//! Binary front-end: parses `cli.yml`, loads a TOML parameter file, builds
//! the default single-ensemble [`Simulator`], and drives the timestep loop.
//! Real multi-ensemble/multi-replica runs need a live `Transport` (MPI or
//! similar); this binary only ever constructs
//! `stochasticpic::transport::LocalTransport`, so it bails out early if the
//! parameter file asks for more than one ensemble.

#[macro_use]
extern crate error_chain;
#[macro_use]
extern crate clap;
#[macro_use]
extern crate log;

mod output;

use stochasticpic::action::{ActionRange, ActionRegistry};
use stochasticpic::ensemble::Ensemble;
use stochasticpic::field::DGRID;
use stochasticpic::grid::{Grid, Mesh};
use stochasticpic::metric::{LogSpherical, Metric};
use stochasticpic::migrate::Migrate;
use stochasticpic::output::{CheckpointMeta, EnsembleCheckpoint};
use stochasticpic::particle::Properties;
use stochasticpic::pusher::{Force, MainUpdate};
use stochasticpic::settings::{self, Settings};
use stochasticpic::simulator::Simulator;
use stochasticpic::solver::{AxisSymmetrize, AxisSymmetrizeJ, SolverStep};
use stochasticpic::transport::LocalTransport;

use crate::errors::*;
use colored::Colorize;
use std::path::PathBuf;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// The bin's own error type, linked to the library's via error-chain's
/// `links` block so `?` on a `stochasticpic::errors::Result` just works.
mod errors {
    error_chain! {
        links {
            Engine(::stochasticpic::errors::Error, ::stochasticpic::errors::ErrorKind);
        }
        foreign_links {
            Io(::std::io::Error);
            Bincode(::bincode::Error);
        }
    }
}

fn main() {
    env_logger::init();
    if let Err(e) = run() {
        eprintln!("{} {}", "error:".red().bold(), e);
        for cause in e.iter().skip(1) {
            eprintln!("  {} {}", "caused by:".red(), cause);
        }
        std::process::exit(1);
    }
}

/// Builds the default field/particle pipeline: axisymmetrize-J on both theta
/// guards, the solver step, then axisymmetrize-E/B on both theta guards, for
/// fields; the relativistic pusher with a Lorentz force followed by
/// migration, for particles. Boundary actions
/// tailored to a specific run (conducting stellar surface, absorbing outer
/// layer, pair-production scattering, atmosphere injection) are left for a
/// caller assembling a concrete scenario; this binary runs the bare engine
/// with its interior/open-boundary solver only.
fn build_action_registry(
    grid: &Grid<DGRID>,
    metric: &Arc<dyn Metric>,
    settings: &Settings,
) -> ActionRegistry<LocalTransport> {
    let guard = settings.simulation.guard_width();
    let nx = grid[0].dim() as isize;
    let ny = grid[1].dim() as isize;
    let g = guard as isize;
    let lower_range = ActionRange::new([0..nx, -g..0], [0, guard]);
    let upper_range = ActionRange::new([0..nx, ny..(ny + g)], [0, guard]);

    let mut registry: ActionRegistry<LocalTransport> = ActionRegistry::new();
    registry.push_field(Box::new(AxisSymmetrizeJ::new(lower_range.clone(), false)));
    registry.push_field(Box::new(AxisSymmetrizeJ::new(upper_range.clone(), true)));
    registry.push_field(Box::new(SolverStep::new(
        grid,
        metric.clone(),
        settings.simulation.solver.to_scheme(),
    )));
    registry.push_field(Box::new(AxisSymmetrize::new(lower_range, false)));
    registry.push_field(Box::new(AxisSymmetrize::new(upper_range, true)));

    registry.push_particle(Box::new(MainUpdate::new(
        grid,
        metric.clone(),
        vec![Force::Lorentz { kappa: 1.0 }],
        settings.simulation.shape,
    )));
    registry.push_particle(Box::new(Migrate::new(
        grid,
        settings.simulation.topology.edge_policy.to_edge_policy(),
    )));

    registry
}

fn run() -> Result<()> {
    let cli_yml = load_yaml!("../../cli.yml");
    let matches = clap::App::from_yaml(cli_yml).version(VERSION).get_matches();

    if let Some(level) = matches.value_of("log_level") {
        std::env::set_var("RUST_LOG", level);
        env_logger::init();
    }

    let param_file = matches.value_of("parameter_file").expect("required by cli.yml");
    let mut settings = settings::read_parameter_file(param_file)?;
    settings.set_version(VERSION);

    if settings.simulation.topology.dims != [1, 1] {
        bail!(
            "topology.dims = {:?} needs a real multi-process Transport; this binary only runs \
             the single-ensemble case (dims = [1, 1])",
            settings.simulation.topology.dims
        );
    }

    let grid: Grid<DGRID> = [
        settings.simulation.grid[0].to_grid1d(),
        settings.simulation.grid[1].to_grid1d(),
    ];
    let guard = settings.simulation.guard_width();
    let mesh = Mesh::new(grid, guard);
    let metric: Arc<dyn Metric> = Arc::new(LogSpherical);

    let registered = settings.simulation.species.registered();
    let properties: std::collections::HashMap<_, _> = Properties::full_registry()
        .into_iter()
        .filter(|(sp, _)| registered.contains(sp))
        .collect();
    let ensemble = Ensemble::singleton(LocalTransport, settings.simulation.topology.periodic);
    let actions = build_action_registry(&grid, &metric, &settings);

    let mut simulator: Simulator<LocalTransport> = Simulator::new(
        mesh,
        metric,
        properties,
        ensemble,
        actions,
        None,
        settings.simulation.dynamic_balance.target_load,
        settings.simulation.dt,
        settings.simulation.downsample_ratio,
        settings.simulation.seed,
        settings.simulation.unit_scale.prej(),
        settings.simulation.sort.to_module_range(),
        settings.simulation.export.to_module_range(),
        settings.simulation.checkpoint.to_module_range(),
        settings.simulation.dynamic_balance.module_range.to_module_range(),
    );

    if let Some(checkpoint_file) = matches.value_of("resume") {
        let (meta, parts) = output::sinks::load_checkpoint(&PathBuf::from(checkpoint_file))?;
        let part = parts
            .into_iter()
            .find(|p| p.label == simulator.ensemble.label)
            .ok_or("checkpoint has no part for this ensemble")?;
        simulator.timestep = meta.timestep;
        simulator.e = part.e.into_e_field(&simulator.mesh);
        simulator.b = part.b.into_b_field(&simulator.mesh);
        simulator.particles = part.particles;
        info!("resumed from '{}' at timestep {}", checkpoint_file, simulator.timestep);
    }

    if matches.is_present("dry_run") {
        info!("dry run: settings validated, initial state built, exiting without stepping");
        return Ok(());
    }

    let output_root = PathBuf::from(matches.value_of("output_directory").unwrap_or("./out"));
    std::fs::create_dir_all(&output_root).chain_err(|| "Unable to create output directory.")?;
    let export_path = output::path::OutputPath::new(&output_root, "export");
    let checkpoint_path = output::path::OutputPath::new(&output_root, "checkpoint");
    export_path.create()?;
    checkpoint_path.create()?;

    let worker = Rc::new(output::sinks::Worker::new());
    let mut export_sink = output::sinks::FileExportSink::new(export_path, worker.clone());
    let mut checkpoint_sink = output::sinks::FileCheckpointSink::new(checkpoint_path, worker.clone());

    let running = Arc::new(AtomicBool::new(true));
    let running_handler = running.clone();
    ctrlc::set_handler(move || {
        warn!("interrupt received, finishing the in-flight step then shutting down");
        running_handler.store(false, Ordering::SeqCst);
    })
    .chain_err(|| "Unable to install Ctrl-C handler.")?;

    let num_steps = settings.simulation.num_steps;
    let mut progress = if matches.is_present("progress_bar") {
        let mut pb = pbr::ProgressBar::new(num_steps);
        pb.format("[=>-]");
        Some(pb)
    } else {
        None
    };

    let start = time::now();
    while simulator.timestep < num_steps && running.load(Ordering::SeqCst) {
        simulator
            .step(Some(&mut export_sink), Some(&mut checkpoint_sink))
            .chain_err(|| "Output sink failed to write.")?;
        if let Some(pb) = progress.as_mut() {
            pb.inc();
        }
    }
    if let Some(mut pb) = progress {
        pb.finish_print("simulation finished");
    }

    if !running.load(Ordering::SeqCst) {
        let (meta, parts) = simulator.build_checkpoint();
        let emergency_path = output::path::OutputPath::new(&output_root, "emergency");
        emergency_path.create()?;
        write_emergency_checkpoint(&emergency_path, &meta, &parts)?;
        info!("wrote emergency checkpoint at timestep {}", meta.timestep);
    }

    drop(export_sink);
    drop(checkpoint_sink);
    match Rc::try_unwrap(worker) {
        Ok(worker) => worker.quit(),
        Err(_) => warn!("output worker still referenced, skipping graceful drain"),
    }

    let elapsed = time::now() - start;
    info!("run finished after {} steps in {}s", simulator.timestep, elapsed.num_seconds());
    Ok(())
}

fn write_emergency_checkpoint(
    path: &output::path::OutputPath,
    meta: &CheckpointMeta,
    parts: &[EnsembleCheckpoint],
) -> Result<()> {
    let bytes = bincode::serialize(&(meta, parts)).chain_err(|| "Unable to serialize emergency checkpoint.")?;
    let file = path.with_extension(&format!("{:010}.ckpt", meta.timestep));
    std::fs::write(&file, bytes).chain_err(|| format!("Unable to write emergency checkpoint '{}'.", file.display()))?;
    Ok(())
}
