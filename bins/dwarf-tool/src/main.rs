//! Command-line inspector for the scout debug-info index.

use anyhow::Context;
use clap::{Parser, Subcommand};
use scout_dwarf::{
    DebugInfoIndex, DwarfContainer, IndexEntry, IndexOptions, IndexState, MergedIndex, NameMatch,
    ParentLink,
};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "dwarf-tool")]
#[command(version = "0.1.0")]
#[command(about = "Inspect the scout debug-info index of a binary")]
struct Cli {
    /// Binary to index
    binary: PathBuf,

    /// Supplementary (DWZ) debug file
    #[arg(long)]
    sup: Option<PathBuf>,

    /// Worker count for the index build (default: CPU count)
    #[arg(long)]
    workers: Option<usize>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Look up index entries by name
    #[command(name = "lookup", alias = "l")]
    Lookup {
        name: String,
        /// Prefix match instead of exact
        #[arg(long)]
        complete: bool,
    },
    /// Map a code address (hex) to the unit covering it
    #[command(name = "addr", alias = "a")]
    Addr { address: String },
    /// List compilation units and their scan state
    #[command(name = "units", alias = "ls")]
    Units,
    /// Print index build statistics
    Stats,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let mut container = DwarfContainer::open(&cli.binary)
        .with_context(|| format!("loading {}", cli.binary.display()))?;
    if let Some(sup) = &cli.sup {
        container
            .attach_supplementary_file(sup)
            .with_context(|| format!("loading supplementary {}", sup.display()))?;
    }
    let index = DebugInfoIndex::start_with_options(
        Arc::new(container),
        IndexOptions { workers: cli.workers },
    )?;

    match cli.command {
        Commands::Lookup { name, complete } => {
            let mode = if complete {
                NameMatch::Completion
            } else {
                NameMatch::Exact
            };
            let hits = index.find_by_name(&name, mode).await?;
            let merged = index
                .merged()
                .context("index finished without publishing a result")?;
            if hits.is_empty() {
                println!("no entries match {name:?}");
            }
            for entry in &hits {
                print_entry(merged, entry);
            }
        }
        Commands::Addr { address } => {
            let raw = address.trim_start_matches("0x");
            let parsed =
                u64::from_str_radix(raw, 16).with_context(|| format!("bad address {address:?}"))?;
            match index.find_unit_for_address(parsed).await? {
                Some(unit) => {
                    let desc = &index.units()[unit.0];
                    println!(
                        "{parsed:#x} -> unit {} at {} ({} bytes)",
                        unit.0,
                        desc.key(),
                        desc.length()
                    );
                }
                None => println!("{parsed:#x} is not covered by any unit"),
            }
        }
        Commands::Units => {
            index.wait(IndexState::Done, None).await?;
            for desc in index.units() {
                let language = desc
                    .language()
                    .map(|l| l.to_string())
                    .unwrap_or_else(|| "unknown".into());
                println!(
                    "unit {:>4}  {}  v{}  {:>8} bytes  {}  scans={}{}",
                    desc.id().0,
                    desc.key(),
                    desc.version(),
                    desc.length(),
                    language,
                    desc.scan_passes(),
                    if desc.is_queued() { "  cached" } else { "" }
                );
            }
        }
        Commands::Stats => {
            let stats = index.stats().await?;
            println!("units:            {}", stats.units);
            println!("entries:          {}", stats.entries);
            println!("deferred parents: {}", stats.deferred_entries);
            println!("resolved parents: {}", stats.resolved_parents);
            println!("elapsed:          {} ms", stats.elapsed_ms);
            if let Some(main) = index.main_name(None).await? {
                println!("main:             {main}");
            }
            let complaints = index.complaints();
            if !complaints.is_empty() {
                println!("complaints ({}):", complaints.len());
                for complaint in complaints {
                    println!("  {complaint}");
                }
            }
        }
    }
    Ok(())
}

fn print_entry(merged: &MergedIndex, entry: &IndexEntry) {
    let mut notes = Vec::new();
    if entry.flags.is_main {
        notes.push("main");
    }
    if entry.flags.is_declaration {
        notes.push("decl");
    }
    if entry.flags.is_static {
        notes.push("static");
    }
    if entry.flags.is_linkage {
        notes.push("linkage");
    }
    println!(
        "{}  {}  die {}  unit {}{}",
        scope_path(merged, entry),
        entry.tag,
        entry.die,
        entry.unit.0,
        if notes.is_empty() {
            String::new()
        } else {
            format!("  [{}]", notes.join(","))
        }
    );
}

/// Render the fully qualified scope path, e.g. `outer::inner::name`.
fn scope_path(merged: &MergedIndex, entry: &IndexEntry) -> String {
    let mut parts = vec![entry.name.to_string()];
    let mut link = entry.parent;
    while let ParentLink::Entry(idx) = link {
        let parent = merged.entry(idx);
        parts.push(parent.name.to_string());
        link = parent.parent;
    }
    parts.reverse();
    parts.join("::")
}
