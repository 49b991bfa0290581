use clap::{Parser, Subcommand};
use clusterpack::container::{AccessMode, Container, CreateOptions};
use std::io::Write;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "cpack", about = "Single-file cluster container CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create an empty container
    Create {
        output: PathBuf,
        /// Maximum number of files the container can hold
        #[arg(long, default_value = "1024")]
        max_files: u32,
        /// Maximum number of block records (must be >= max-files)
        #[arg(long, default_value = "4096")]
        max_blocks: u32,
    },
    /// Add or replace files
    Add {
        container: PathBuf,
        #[arg(required = true, num_args = 1..)]
        input: Vec<PathBuf>,
        /// Store under this name instead of the input's file name (single input only)
        #[arg(short, long)]
        name: Option<String>,
    },
    /// Extract one file to disk
    Get {
        container: PathBuf,
        name: String,
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Write one file to stdout
    Cat {
        container: PathBuf,
        name: String,
    },
    /// List container contents
    Ls {
        container: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Delete files
    Rm {
        container: PathBuf,
        #[arg(required = true, num_args = 1..)]
        names: Vec<String>,
    },
    /// Rename a file
    Mv {
        container: PathBuf,
        from: String,
        to: String,
    },
    /// Show header fields and space usage
    Info {
        container: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Verify block table, free index and name index consistency
    Check {
        container: PathBuf,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    match Cli::parse().command {

        // ── Create ───────────────────────────────────────────────────────────
        Commands::Create { output, max_files, max_blocks } => {
            let opts = CreateOptions { max_file_count: max_files, max_block_count: max_blocks };
            Container::create_file(&output, opts)?.shutdown()?;
            println!("Created: {}", output.display());
        }

        // ── Add ──────────────────────────────────────────────────────────────
        Commands::Add { container, input, name } => {
            if name.is_some() && input.len() > 1 {
                return Err("--name requires exactly one input".into());
            }
            let mut pack = Container::open_file(&container, AccessMode::ReadWrite)?;
            for path in &input {
                let stored = match &name {
                    Some(n) => n.clone(),
                    None => path
                        .file_name()
                        .ok_or_else(|| format!("no file name in {}", path.display()))?
                        .to_string_lossy()
                        .into_owned(),
                };
                if pack.write_file_from_path(&stored, path)? {
                    println!("  added  {}", stored);
                } else {
                    eprintln!("  full   {} (no free file or block slot)", stored);
                }
            }
            pack.shutdown()?;
        }

        // ── Get ──────────────────────────────────────────────────────────────
        Commands::Get { container, name, output } => {
            let mut pack = Container::open_file(&container, AccessMode::Read)?;
            let dest = output.unwrap_or_else(|| PathBuf::from(&name));
            if !pack.has_file(&name) {
                return Err(format!("not found: {name}").into());
            }
            if !pack.save_as_file(&name, &dest)? {
                return Err(format!("could not write {}", dest.display()).into());
            }
            println!("Extracted: {}", dest.display());
        }

        // ── Cat ──────────────────────────────────────────────────────────────
        Commands::Cat { container, name } => {
            let mut pack = Container::open_file(&container, AccessMode::Read)?;
            let stdout = std::io::stdout();
            let mut out = stdout.lock();
            if pack.read_file_to(&name, &mut out)?.is_none() {
                return Err(format!("not found: {name}").into());
            }
            out.flush()?;
        }

        // ── Ls ───────────────────────────────────────────────────────────────
        Commands::Ls { container, json } => {
            let pack = Container::open_file(&container, AccessMode::Read)?;
            let infos = pack.file_infos();
            if json {
                println!("{}", serde_json::to_string_pretty(&infos)?);
            } else {
                println!("Container: {}", container.display());
                println!("{:<40} {:>12} {:>12}", "Name", "Size", "Offset");
                for info in infos {
                    println!("{:<40} {:>12} {:>12}", info.name, info.length, info.offset);
                }
            }
        }

        // ── Rm ───────────────────────────────────────────────────────────────
        Commands::Rm { container, names } => {
            let mut pack = Container::open_file(&container, AccessMode::ReadWrite)?;
            for name in &names {
                if pack.delete_file(name)? {
                    println!("  removed  {}", name);
                } else {
                    eprintln!("  missing  {}", name);
                }
            }
            pack.shutdown()?;
        }

        // ── Mv ───────────────────────────────────────────────────────────────
        Commands::Mv { container, from, to } => {
            let mut pack = Container::open_file(&container, AccessMode::ReadWrite)?;
            if !pack.rename_file(&from, &to)? {
                return Err(format!("cannot rename {from} -> {to}: source missing or target exists").into());
            }
            pack.shutdown()?;
            println!("Renamed: {from} → {to}");
        }

        // ── Info ─────────────────────────────────────────────────────────────
        Commands::Info { container, json } => {
            let pack  = Container::open_file(&container, AccessMode::Read)?;
            let stats = pack.stats();
            if json {
                println!("{}", serde_json::to_string_pretty(&stats)?);
                return Ok(());
            }
            let header = pack.header();
            println!("── Cluster container ────────────────────────────────────");
            println!("  Path           {}", container.display());
            println!("  Version        {}", header.version);
            println!("  Key            {}", hex::encode(header.key));
            println!("  Files          {} / {}", stats.file_count, stats.max_file_count);
            println!("  Blocks         {} / {}", stats.block_count, stats.max_block_count);
            println!("  Heap offset    {} B", stats.heap_offset);
            println!("  Heap size      {} B", stats.heap_bytes);
            println!("  Used           {} B", stats.used_bytes);
            println!("  Free           {} B in {} block(s)", stats.free_bytes, stats.free_blocks);
        }

        // ── Check ────────────────────────────────────────────────────────────
        Commands::Check { container } => {
            let mut pack = Container::open_file(&container, AccessMode::Read)?;
            let issues = pack.check_integrity()?;
            if issues.is_empty() {
                println!("OK: {} file(s), no issues", pack.file_count());
            } else {
                for issue in &issues {
                    println!("  {}", issue);
                }
                return Err(format!("{} issue(s) found", issues.len()).into());
            }
        }
    }

    Ok(())
}
