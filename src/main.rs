use clap::Parser;
use mixsolve::analysis::{self, AnalysisResult};
use mixsolve::circuit::{CircuitEngine, MnaCircuit};
use mixsolve::config::SolverSettings;
use mixsolve::context::AnalysisContext;
use mixsolve::device::ResistiveBar;
use mixsolve::error::Result;
use mixsolve::ir::Netlist;
use mixsolve::output;
use mixsolve::parser;
use mixsolve::simulation::Simulation;
use mixsolve::solver::comm::CommunicationBackend;
use mixsolve::stats::Stats;
use std::io;
use std::path::PathBuf;

/// Coupled device/circuit DC and transient solver
#[derive(Parser)]
#[command(name = "mixsolve", version)]
struct Cli {
    /// Netlist with the circuit, electrode links and analysis commands
    netlist: PathBuf,

    /// Solver settings file (TOML)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Print performance stats to stderr
    #[arg(long)]
    stats: bool,
}

fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let settings = match &cli.config {
        Some(path) => SolverSettings::load(path).unwrap_or_else(|e| {
            eprintln!("Error loading {}: {}", path.display(), e);
            std::process::exit(1);
        }),
        None => SolverSettings::default(),
    };

    let input = std::fs::read_to_string(&cli.netlist).unwrap_or_else(|e| {
        eprintln!("Error reading {}: {}", cli.netlist.display(), e);
        std::process::exit(1);
    });

    let netlist = parser::parse(&input).unwrap_or_else(|e| {
        eprintln!("Parse error: {}", e);
        std::process::exit(1);
    });

    #[cfg(feature = "distributed")]
    let _universe = mpi::initialize().unwrap_or_else(|| {
        eprintln!("MPI initialization failed");
        std::process::exit(1);
    });
    #[cfg(feature = "distributed")]
    let comm = mixsolve::solver::comm_mpi::MpiComm::new();
    #[cfg(not(feature = "distributed"))]
    let comm = mixsolve::solver::comm::SingleProcessComm;

    let mut stats = if cli.stats { Some(Stats::new()) } else { None };

    simulate(&comm, &netlist, settings, stats.as_mut()).unwrap_or_else(|e| {
        eprintln!("Simulation error: {}", e);
        std::process::exit(1);
    });

    if let Some(ref stats) = stats {
        if comm.is_last_rank() {
            stats.display();
        }
    }
}

fn simulate(
    comm: &dyn CommunicationBackend,
    netlist: &Netlist,
    settings: SolverSettings,
    stats: Option<&mut Stats>,
) -> Result<()> {
    let device = ResistiveBar::new(&settings.device, comm.rank(), comm.num_ranks())?;
    let circuit: Option<Box<dyn CircuitEngine>> = if comm.is_last_rank() {
        Some(Box::new(MnaCircuit::from_netlist(netlist)?))
    } else {
        None
    };

    let mut sim = Simulation::new(Box::new(device), circuit, comm, &settings)?;
    let mut ctx = AnalysisContext::new(settings);
    let results = analysis::run(&mut sim, &mut ctx, &netlist.analyses, stats)?;

    if !comm.is_last_rank() {
        return Ok(());
    }
    let mut stdout = io::stdout();
    for result in &results {
        match result {
            AnalysisResult::Op(r) => output::write_op_csv(r, &mut stdout)?,
            AnalysisResult::DcSweep(r) => output::write_sweep_csv(r, &mut stdout)?,
            AnalysisResult::Tran(r) => output::write_tran_csv(r, &mut stdout)?,
        }
    }
    Ok(())
}
