// Comber: CFG restructuring engine for binary decompilation
//
// Reads CFG regions from a JSON file, runs the restructuring pipeline and
// prints a per-region status with the structured AST.

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;

use comber::passes::{restructure_all, RegionStatus};
use comber::RestructureConfig;

#[derive(Parser)]
#[command(name = "comber", version, about = "CFG restructuring engine")]
struct Cli {
    /// JSON file holding one region or an array of regions
    input: PathBuf,

    /// Optional JSON configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Write a GraphViz dump per pass phase
    #[arg(long)]
    dump_dots: bool,

    /// Directory for the dot dumps
    #[arg(long, default_value = "dots")]
    dot_directory: PathBuf,

    /// Print the full AST as JSON instead of a summary line
    #[arg(long)]
    json: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => {
            let text = fs::read_to_string(path)
                .with_context(|| format!("reading config {}", path.display()))?;
            serde_json::from_str::<RestructureConfig>(&text)
                .with_context(|| format!("parsing config {}", path.display()))?
        }
        None => RestructureConfig::default(),
    };
    if cli.dump_dots {
        config.dump_dots = true;
        config.dot_directory = cli.dot_directory.clone();
    }
    let config = config.sanitized();

    // The log channel opts the pass logs of that target into the output;
    // everything else stays at warn unless RUST_LOG says otherwise.
    let mut filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive(tracing::Level::WARN.into());
    if let Some(channel) = &config.log_channel {
        let directive = format!("{channel}=debug")
            .parse()
            .with_context(|| format!("invalid log channel {channel}"))?;
        filter = filter.add_directive(directive);
    }
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let text = fs::read_to_string(&cli.input)
        .with_context(|| format!("reading {}", cli.input.display()))?;
    let regions: Vec<comber::RegionInput> = match serde_json::from_str(&text) {
        Ok(regions) => regions,
        Err(_) => vec![serde_json::from_str(&text)
            .with_context(|| format!("parsing {}", cli.input.display()))?],
    };

    let reports = restructure_all(&regions, &config);

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&reports)?);
    } else {
        for report in &reports {
            match &report.status {
                RegionStatus::Restructured(_) => {
                    println!("{}/{}: restructured", report.function, report.region);
                }
                RegionStatus::Unrestructured { error, last_dot } => {
                    println!("{}/{}: UNRESTRUCTURED ({error})", report.function, report.region);
                    if let Some(dot) = last_dot {
                        println!("  last dump: {}", dot.display());
                    }
                }
            }
        }
    }

    let failures = reports
        .iter()
        .filter(|r| matches!(r.status, RegionStatus::Unrestructured { .. }))
        .count();
    if failures > 0 {
        anyhow::bail!("{failures} region(s) left unrestructured");
    }
    Ok(())
}
