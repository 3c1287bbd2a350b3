use anyhow::{Context, Result, bail};
use clap::{Parser, ValueEnum};
use oncolat_core::{
    CellParams, DisplacementPath, DriverParams, EventRates, GrowthBounds, LocalDensity, Tissue,
    TissueConfig, segregating_sites,
};
use oncolat_lattice::LatticeKind;
use oncolat_storage::{OutputDir, drivers_tsv, population_tsv, snapshots_tsv};
use serde::Serialize;
use std::env;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Give up after this many extinct replicates in a row.
const MAX_EXTINCTION_RESTARTS: u64 = 100;

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    if cli.nsam > cli.max_size {
        bail!(
            "NSAM={} exceeds the maximum tumor size {}; pass a sample size \
             no larger than -N",
            cli.nsam,
            cli.max_size
        );
    }

    let seed = cli.seed.unwrap_or_else(rand::random);
    let mut tissue = grow_tumor(&cli, seed)?;

    if let Some(duration) = cli.plateau {
        tissue.plateau(duration);
    }
    if let Some(death_prob) = cli.treatment {
        tissue.treatment(death_prob, cli.resistant);
    }

    // ms-like preamble: the invoking command line and the seed stream.
    let command_line: Vec<String> = env::args().collect();
    println!("{}", command_line.join(" "));
    println!("{seed}");
    if cli.nsam > 0 {
        for _ in 0..cli.howmany {
            let samples = if tissue.dimensions() == 3 {
                tissue.sample_section(cli.nsam)
            } else {
                tissue.sample_random(cli.nsam)
            };
            let mutants = tissue.generate_neutral_mutations(cli.mutation_rate, cli.ensure_mutation);
            print!("{}", segregating_sites(&samples, &mutants));
        }
    }

    if let Some(outdir) = &cli.outdir {
        write_outputs(&cli, seed, &mut tissue, outdir)?;
    }
    Ok(())
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .init();
}

/// Grow one tumor to the configured bounds, restarting with a perturbed
/// seed stream whenever the population goes extinct first.
fn grow_tumor(cli: &Cli, seed: u64) -> Result<Tissue> {
    let bounds = GrowthBounds {
        max_size: cli.max_size,
        max_time: cli.max_time,
        recording_early_growth: cli.record,
        mutation_timing: cli.mutate.unwrap_or(usize::MAX),
    };
    let mut attempt: u64 = 0;
    loop {
        let mut config = cli.tissue_config();
        config.rng_seed = Some(seed.wrapping_add(attempt));
        let mut tissue = Tissue::new(config).context("invalid tissue configuration")?;
        if tissue.grow(bounds) {
            info!(
                size = tissue.size(),
                time = tissue.time(),
                attempt,
                "tumor grown"
            );
            return Ok(tissue);
        }
        attempt += 1;
        warn!(attempt, "population went extinct; restarting");
        if attempt >= MAX_EXTINCTION_RESTARTS {
            bail!(
                "population went extinct {MAX_EXTINCTION_RESTARTS} times in a row; \
                 the configured rates cannot sustain growth"
            );
        }
    }
}

fn write_outputs(cli: &Cli, seed: u64, tissue: &mut Tissue, outdir: &Path) -> Result<()> {
    let out = OutputDir::create(outdir)
        .with_context(|| format!("failed to create output directory {}", outdir.display()))?;

    let resolved = toml::to_string_pretty(&ResolvedOptions::new(cli, seed))
        .context("failed to serialize resolved options")?;
    out.write("program_options.conf", &resolved)?;
    out.write("population.tsv.gz", &population_tsv(tissue))?;
    if !tissue.snapshots().is_empty() {
        out.write("snapshots.tsv.gz", &snapshots_tsv(tissue))?;
    }
    if !tissue.drivers().is_empty() {
        out.write("drivers.tsv.gz", &drivers_tsv(tissue.drivers()))?;
    }
    if cli.npair > 0 {
        out.write("distances.tsv.gz", &tissue.pairwise_distance(cli.npair))?;
    }
    info!(outdir = %out.path().display(), "run outputs written");
    Ok(())
}

#[derive(Parser, Debug)]
#[command(
    name = "oncolat",
    version,
    about = "Event-driven simulation of tumor growth on a regular lattice"
)]
struct Cli {
    /// Lattice dimensionality.
    #[arg(short = 'D', long, default_value_t = 3, value_parser = clap::value_parser!(u32).range(2..=3))]
    dimensions: u32,
    /// Lattice packing.
    #[arg(short = 'C', long, value_enum, default_value_t = CoordArg::Moore)]
    coord: CoordArg,
    /// Local density effect gating birth insertions.
    #[arg(short = 'L', long, value_enum, default_value_t = LocalArg::Const)]
    local: LocalArg,
    /// Displacement path for birth insertions.
    #[arg(short = 'P', long, value_enum, default_value_t = PathArg::Random)]
    path: PathArg,

    /// Maximum tumor size.
    #[arg(short = 'N', long = "max", default_value_t = 16_384)]
    max_size: usize,
    /// Maximum simulated time.
    #[arg(short = 'T', long = "time", default_value_t = f64::INFINITY)]
    max_time: f64,
    /// Simulated-time interval between population snapshots.
    #[arg(long, default_value_t = f64::INFINITY)]
    snapshot: f64,
    /// Record a snapshot after every change while the size is below this.
    #[arg(long, default_value_t = 0)]
    record: usize,
    /// Force a driver on the first daughter born above this size.
    #[arg(long)]
    mutate: Option<usize>,
    /// Number of cells packed into a ball at time zero.
    #[arg(long, default_value_t = 1)]
    init: usize,

    /// Shape of the gamma-distributed birth waiting time.
    #[arg(short = 'k', long = "shape", default_value_t = 1.0)]
    gamma_shape: f64,
    /// Probability of symmetric stem-cell division.
    #[arg(short = 'p', long = "symmetric", default_value_t = 1.0)]
    prob_symmetric_division: f64,
    /// Maximum proliferation capacity of non-stem cells.
    #[arg(short = 'r', long = "prolif", default_value_t = 10)]
    max_proliferation_capacity: u8,
    /// Initial birth rate β0.
    #[arg(short = 'b', long = "beta0", default_value_t = 1.0)]
    birth_rate: f64,
    /// Initial death rate δ0.
    #[arg(short = 'd', long = "delta0", default_value_t = 0.0)]
    death_rate: f64,
    /// Initial death probability on division α0.
    #[arg(short = 'a', long = "alpha0", default_value_t = 0.0)]
    death_prob: f64,
    /// Initial migration rate ρ0.
    #[arg(short = 'm', long = "rho0", default_value_t = 0.0)]
    migra_rate: f64,

    /// Driver rate on the birth trait.
    #[arg(long = "ub", default_value_t = 0.0)]
    driver_rate_birth: f64,
    /// Driver rate on the death trait.
    #[arg(long = "ud", default_value_t = 0.0)]
    driver_rate_death: f64,
    /// Driver rate on the migration trait.
    #[arg(long = "um", default_value_t = 0.0)]
    driver_rate_migra: f64,
    /// Mean driver effect on the birth trait.
    #[arg(long = "mb", default_value_t = 0.0)]
    driver_mean_birth: f64,
    /// Mean driver effect on the death trait.
    #[arg(long = "md", default_value_t = 0.0)]
    driver_mean_death: f64,
    /// Mean driver effect on the migration trait.
    #[arg(long = "mm", default_value_t = 0.0)]
    driver_mean_migra: f64,
    /// Driver effect deviation on the birth trait.
    #[arg(long = "sb", default_value_t = 0.0)]
    driver_sd_birth: f64,
    /// Driver effect deviation on the death trait.
    #[arg(long = "sd", default_value_t = 0.0)]
    driver_sd_death: f64,
    /// Driver effect deviation on the migration trait.
    #[arg(long = "sm", default_value_t = 0.0)]
    driver_sd_migra: f64,

    /// Neutral mutation rate per cell division.
    #[arg(short = 'u', long = "mutation", default_value_t = 0.0)]
    mutation_rate: f64,
    /// Guarantee one neutral mutation per division.
    #[arg(long)]
    ensure_mutation: bool,
    /// Number of random pairs written to distances.tsv.gz.
    #[arg(long, default_value_t = 0)]
    npair: usize,

    /// Run a Moran-like plateau for this much simulated time after growth.
    #[arg(long)]
    plateau: Option<f64>,
    /// Impose this cycle-dependent death probability after growth.
    #[arg(long)]
    treatment: Option<f64>,
    /// Cells spared by the treatment.
    #[arg(long, default_value_t = 3)]
    resistant: usize,

    /// RNG seed; drawn from entropy when absent.
    #[arg(long)]
    seed: Option<u64>,
    /// Output directory for the TSV tables.
    #[arg(short = 'o', long)]
    outdir: Option<PathBuf>,
    /// Verbose logging to stderr.
    #[arg(short = 'v', long)]
    verbose: bool,

    /// Sample size per segsites replicate.
    #[arg(value_name = "NSAM", default_value_t = 0)]
    nsam: usize,
    /// Number of segsites replicates.
    #[arg(value_name = "HOWMANY", default_value_t = 1)]
    howmany: usize,
}

impl Cli {
    fn tissue_config(&self) -> TissueConfig {
        TissueConfig {
            initial_size: self.init,
            dimensions: self.dimensions,
            coord: self.coord.into(),
            local_density_effect: self.local.into(),
            displacement_path: self.path.into(),
            init_rates: EventRates {
                birth_rate: self.birth_rate,
                death_rate: self.death_rate,
                death_prob: self.death_prob,
                migra_rate: self.migra_rate,
            },
            cell: CellParams {
                gamma_shape: self.gamma_shape,
                prob_symmetric_division: self.prob_symmetric_division,
                max_proliferation_capacity: self.max_proliferation_capacity,
            },
            driver: DriverParams {
                rate_birth: self.driver_rate_birth,
                rate_death: self.driver_rate_death,
                rate_migra: self.driver_rate_migra,
                mean_birth: self.driver_mean_birth,
                mean_death: self.driver_mean_death,
                mean_migra: self.driver_mean_migra,
                sd_birth: self.driver_sd_birth,
                sd_death: self.driver_sd_death,
                sd_migra: self.driver_sd_migra,
            },
            snapshot_interval: self.snapshot,
            rng_seed: None,
        }
    }
}

#[derive(Clone, Copy, Debug, ValueEnum, PartialEq, Eq)]
enum CoordArg {
    Neumann,
    Moore,
    Hex,
}

impl From<CoordArg> for LatticeKind {
    fn from(value: CoordArg) -> Self {
        match value {
            CoordArg::Neumann => Self::Neumann,
            CoordArg::Moore => Self::Moore,
            CoordArg::Hex => Self::Hexagonal,
        }
    }
}

#[derive(Clone, Copy, Debug, ValueEnum, PartialEq, Eq)]
enum LocalArg {
    Const,
    Step,
    Linear,
}

impl From<LocalArg> for LocalDensity {
    fn from(value: LocalArg) -> Self {
        match value {
            LocalArg::Const => Self::Const,
            LocalArg::Step => Self::Step,
            LocalArg::Linear => Self::Linear,
        }
    }
}

#[derive(Clone, Copy, Debug, ValueEnum, PartialEq, Eq)]
enum PathArg {
    Random,
    Mindrag,
    Minstraight,
    Roulette,
    Stroll,
}

impl From<PathArg> for DisplacementPath {
    fn from(value: PathArg) -> Self {
        match value {
            PathArg::Random => Self::Random,
            PathArg::Mindrag => Self::MinDrag,
            PathArg::Minstraight => Self::MinStraight,
            PathArg::Roulette => Self::Roulette,
            PathArg::Stroll => Self::Stroll,
        }
    }
}

/// The resolved option set, dumped to `program_options.conf`.
#[derive(Debug, Serialize)]
struct ResolvedOptions {
    dimensions: u32,
    coord: LatticeKind,
    local: LocalDensity,
    path: DisplacementPath,
    max_size: usize,
    max_time: f64,
    snapshot: f64,
    record: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    mutate: Option<usize>,
    init: usize,
    shape: f64,
    symmetric: f64,
    prolif: u8,
    beta0: f64,
    delta0: f64,
    alpha0: f64,
    rho0: f64,
    ub: f64,
    ud: f64,
    um: f64,
    mb: f64,
    md: f64,
    mm: f64,
    sb: f64,
    sd: f64,
    sm: f64,
    mutation: f64,
    ensure_mutation: bool,
    npair: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    plateau: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    treatment: Option<f64>,
    resistant: usize,
    seed: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    outdir: Option<String>,
    nsam: usize,
    howmany: usize,
}

impl ResolvedOptions {
    fn new(cli: &Cli, seed: u64) -> Self {
        Self {
            dimensions: cli.dimensions,
            coord: cli.coord.into(),
            local: cli.local.into(),
            path: cli.path.into(),
            max_size: cli.max_size,
            max_time: cli.max_time,
            snapshot: cli.snapshot,
            record: cli.record,
            mutate: cli.mutate,
            init: cli.init,
            shape: cli.gamma_shape,
            symmetric: cli.prob_symmetric_division,
            prolif: cli.max_proliferation_capacity,
            beta0: cli.birth_rate,
            delta0: cli.death_rate,
            alpha0: cli.death_prob,
            rho0: cli.migra_rate,
            ub: cli.driver_rate_birth,
            ud: cli.driver_rate_death,
            um: cli.driver_rate_migra,
            mb: cli.driver_mean_birth,
            md: cli.driver_mean_death,
            mm: cli.driver_mean_migra,
            sb: cli.driver_sd_birth,
            sd: cli.driver_sd_death,
            sm: cli.driver_sd_migra,
            mutation: cli.mutation_rate,
            ensure_mutation: cli.ensure_mutation,
            npair: cli.npair,
            plateau: cli.plateau,
            treatment: cli.treatment,
            resistant: cli.resistant,
            seed,
            outdir: cli.outdir.as_ref().map(|p| p.display().to_string()),
            nsam: cli.nsam,
            howmany: cli.howmany,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_declaration_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn arguments_map_onto_the_tissue_config() {
        let cli = Cli::parse_from([
            "oncolat", "-D2", "-Cneumann", "-Lstep", "-Pmindrag", "-N500", "-k2.5", "-p0.8",
            "-r4", "-b1.5", "-d0.1", "-a0.05", "-m0.2", "--seed", "42", "20", "3",
        ]);
        let config = cli.tissue_config();
        assert_eq!(config.dimensions, 2);
        assert_eq!(config.coord, LatticeKind::Neumann);
        assert_eq!(config.local_density_effect, LocalDensity::Step);
        assert_eq!(config.displacement_path, DisplacementPath::MinDrag);
        assert_eq!(config.cell.max_proliferation_capacity, 4);
        assert!((config.init_rates.birth_rate - 1.5).abs() < 1e-12);
        assert!((config.cell.prob_symmetric_division - 0.8).abs() < 1e-12);
        assert_eq!(cli.max_size, 500);
        assert_eq!(cli.nsam, 20);
        assert_eq!(cli.howmany, 3);
        assert_eq!(cli.seed, Some(42));
    }

    #[test]
    fn resolved_options_serialize_to_toml() {
        let cli = Cli::parse_from(["oncolat", "--seed", "7", "-o", "out"]);
        let resolved = ResolvedOptions::new(&cli, 7);
        let conf = toml::to_string_pretty(&resolved).expect("toml");
        assert!(conf.contains("seed = 7"));
        assert!(conf.contains("coord = \"moore\""));
        assert!(conf.contains("max_time = inf"));
    }
}
