// Tensor-core planner CLI
use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;

use tcgen::arch::{Arch, GpuArch};
use tcgen::graph::{Graph, Node};
use tcgen::layout::{
    Accum32x32, Accum8x8, AmpereSwizzle, ColumnMajor, FragmentLayout, Layout, LayoutReport,
    RowMajor, SharedLayout, VoltaCongruous, VoltaCrosswise,
};
use tcgen::policy::{TcPolicy, TcPolicyOptions, TileMap};

/// Exit status when no configuration is feasible
const EXIT_INFEASIBLE: u8 = 2;

#[derive(Parser)]
#[command(name = "tcplan")]
#[command(version = "0.1.0")]
#[command(about = "Tensor-core tiling planner and layout inspector", long_about = None)]
struct Cli {
    /// Log resolved configurations (overridden by RUST_LOG)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Resolve one candidate tiling of a graph
    Plan {
        /// Plan request (JSON)
        #[arg(value_name = "REQUEST")]
        request: PathBuf,

        /// Hardware description (JSON), overrides the request
        #[arg(long, value_name = "ARCH")]
        arch: Option<PathBuf>,

        /// Built-in preset by compute capability, e.g. 80 or sm_86
        #[arg(long, conflicts_with = "arch")]
        target: Option<String>,
    },

    /// Print the address table of a layout
    Layout {
        #[arg(value_enum)]
        kind: LayoutArg,

        /// Logical rows (M for accumulator layouts)
        #[arg(long)]
        rows: usize,

        /// Leading dimension (N for accumulator layouts, M block for Volta crosswise)
        #[arg(long)]
        ldm: usize,

        /// K block of the Volta crosswise layout
        #[arg(long, default_value_t = 32)]
        kblock: usize,
    },

    /// Print the built-in hardware descriptions
    Presets,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LayoutArg {
    RowMajor,
    ColumnMajor,
    VoltaCongruous,
    VoltaBCongruous,
    VoltaCrosswise,
    AmpereCongruous,
    AmpereCrosswise,
    Accum32x32,
    Accum8x8,
}

#[derive(Deserialize)]
struct PlanRequest {
    graph: Vec<Node>,
    tiles: TileMap,
    block_size: usize,
    #[serde(default)]
    arch: Option<Arch>,
    #[serde(default)]
    options: TcPolicyOptions,
}

#[derive(Serialize)]
struct LayoutTable<T: Serialize> {
    report: LayoutReport,
    bijective: bool,
    rows: Vec<Vec<T>>,
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    match cli.command {
        Commands::Plan {
            request,
            arch,
            target,
        } => plan_command(request, arch, target),
        Commands::Layout {
            kind,
            rows,
            ldm,
            kblock,
        } => layout_command(kind, rows, ldm, kblock),
        Commands::Presets => presets_command(),
    }
}

fn plan_command(
    request_path: PathBuf,
    arch_path: Option<PathBuf>,
    target: Option<String>,
) -> Result<ExitCode> {
    let text = fs::read_to_string(&request_path)
        .with_context(|| format!("Failed to read plan request: {}", request_path.display()))?;
    let request: PlanRequest = serde_json::from_str(&text)
        .with_context(|| format!("Malformed plan request: {}", request_path.display()))?;

    let arch = match (arch_path, target, request.arch) {
        (Some(path), _, _) => Arch::from_path(&path)
            .with_context(|| format!("Failed to load architecture: {}", path.display()))?,
        (None, Some(cc), _) => match GpuArch::from_compute_capability(&cc) {
            Some(target) => Arch::preset(target),
            None => bail!("Unknown compute capability '{}'", cc),
        },
        (None, None, Some(arch)) => {
            arch.validate().context("Invalid architecture in plan request")?;
            arch
        }
        (None, None, None) => Arch::default(),
    };
    log::debug!("planning for {} ({})", arch.name, arch.target);

    let graph = Graph::new(request.graph).context("Invalid graph in plan request")?;
    let policy = TcPolicy::with_options(graph, arch, request.options);

    match policy
        .plan(&request.tiles, request.block_size)
        .context("Layout selection failed")?
    {
        Some(plan) => {
            println!("{}", serde_json::to_string_pretty(&plan)?);
            Ok(ExitCode::SUCCESS)
        }
        None => {
            println!(
                "no feasible configuration for tiles {:?} with {} threads",
                request.tiles, request.block_size
            );
            Ok(ExitCode::from(EXIT_INFEASIBLE))
        }
    }
}

fn layout_command(kind: LayoutArg, rows: usize, ldm: usize, kblock: usize) -> Result<ExitCode> {
    let shared: SharedLayout = match kind {
        LayoutArg::RowMajor => RowMajor::new(ldm)?.into(),
        LayoutArg::ColumnMajor => ColumnMajor::new(ldm)?.into(),
        LayoutArg::VoltaCongruous => VoltaCongruous::operand_a(ldm)?.into(),
        LayoutArg::VoltaBCongruous => VoltaCongruous::operand_b(ldm)?.into(),
        LayoutArg::VoltaCrosswise => VoltaCrosswise::new(ldm, kblock)?.into(),
        LayoutArg::AmpereCongruous => AmpereSwizzle::congruous(ldm)?.into(),
        LayoutArg::AmpereCrosswise => AmpereSwizzle::crosswise(ldm)?.into(),
        LayoutArg::Accum32x32 => {
            return print_fragment(Accum32x32::new(rows, ldm)?.into(), rows, ldm)
        }
        LayoutArg::Accum8x8 => return print_fragment(Accum8x8::new(rows, ldm)?.into(), rows, ldm),
    };

    if !shared.accepts_rows(rows) {
        let limit = shared
            .max_rows()
            .map(|max| format!(" up to {}", max))
            .unwrap_or_default();
        bail!(
            "{:?} needs a positive multiple of {} rows{}, got {}",
            shared.kind(),
            shared.row_granularity(),
            limit,
            rows
        );
    }
    let row_len = shared.row_len();
    let table = LayoutTable {
        report: shared.report(),
        bijective: shared.is_bijective(rows),
        rows: shared
            .permutation(rows)
            .chunks(row_len)
            .map(<[usize]>::to_vec)
            .collect(),
    };
    println!("{}", serde_json::to_string_pretty(&table)?);
    Ok(ExitCode::SUCCESS)
}

fn print_fragment(layout: FragmentLayout, m: usize, n: usize) -> Result<ExitCode> {
    let table = LayoutTable {
        report: layout.report(),
        bijective: layout.is_bijective(),
        rows: (0..m)
            .map(|i| (0..n).map(|j| layout.address(i, j)).collect())
            .collect(),
    };
    println!("{}", serde_json::to_string_pretty(&table)?);
    Ok(ExitCode::SUCCESS)
}

fn presets_command() -> Result<ExitCode> {
    let presets: Vec<Arch> = GpuArch::ALL.into_iter().map(Arch::preset).collect();
    println!("{}", serde_json::to_string_pretty(&presets)?);
    Ok(ExitCode::SUCCESS)
}
