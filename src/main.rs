use chrono::DateTime;
use clap::{Parser, Subcommand};
use serde_json::json;
use std::path::{Path, PathBuf};
use whisperdb::{
    bulk, parse_retentions, unix_now, AggregationMethod, CreateOptions, OpenOptions, ResizeOptions,
    WhisperError, WhisperFile,
};

#[derive(Parser)]
#[command(name = "wsp", version = "1.0.0", about = "Whisper round-robin time-series CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a new whisper database
    Create {
        path: PathBuf,
        /// Retention specs, e.g. 60:1440 or 1m:30d (finest first)
        #[arg(required = true, num_args = 1..)]
        retentions: Vec<String>,
        /// Minimum covered-slot fraction for propagation
        #[arg(short = 'x', long, default_value = "0.5")]
        xff: f32,
        /// average|sum|last|max|min|avg_zero|absmax|absmin
        #[arg(short, long, default_value = "average")]
        method: String,
        /// Allocate data regions as a filesystem hole
        #[arg(long)]
        sparse: bool,
        /// Replace an existing file
        #[arg(long)]
        overwrite: bool,
    },
    /// Store timestamp:value pairs (timestamp `N` means now)
    Update {
        path: PathBuf,
        #[arg(required = true, num_args = 1..)]
        points: Vec<String>,
        /// Hold the advisory file lock while writing
        #[arg(long)]
        lock: bool,
        /// fsync after writing
        #[arg(long)]
        flush: bool,
    },
    /// Fetch a time window (default: the last 24 hours)
    Fetch {
        path: PathBuf,
        #[arg(long)]
        from: Option<u32>,
        #[arg(long)]
        until: Option<u32>,
        /// Serve the read from a memory map
        #[arg(long)]
        mmap: bool,
        #[arg(long)]
        json: bool,
        /// Render timestamps as UTC date-times
        #[arg(long)]
        pretty: bool,
    },
    /// Show header metadata
    Info {
        path: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// List every stored point of every archive
    Dump {
        path: PathBuf,
    },
    /// Copy data from one database into another (collisions overwritten)
    Merge {
        src: PathBuf,
        dst: PathBuf,
        #[arg(long)]
        from: Option<u32>,
        #[arg(long)]
        until: Option<u32>,
    },
    /// Copy data into the empty slots of another database
    Fill {
        src: PathBuf,
        dst: PathBuf,
    },
    /// Compare two databases slot by slot
    Diff {
        left: PathBuf,
        right: PathBuf,
        /// Skip slots that are empty on either side
        #[arg(long)]
        ignore_empty: bool,
        #[arg(long)]
        until: Option<u32>,
        #[arg(long)]
        json: bool,
    },
    /// Rebuild a database with a new archive set
    Resize {
        path: PathBuf,
        #[arg(required = true, num_args = 1..)]
        retentions: Vec<String>,
        /// Replace the xFilesFactor (default: keep)
        #[arg(short = 'x', long)]
        xff: Option<f32>,
        /// Replace the aggregation method (default: keep)
        #[arg(short, long)]
        method: Option<String>,
        /// Replay data through aggregation instead of per-archive copy
        #[arg(long)]
        aggregate: bool,
        /// Permit a retention shrink
        #[arg(long)]
        force: bool,
        /// Write here and leave the original untouched
        #[arg(long)]
        newfile: Option<PathBuf>,
        /// Skip the .bak copy of the original
        #[arg(long)]
        nobackup: bool,
    },
    /// Swap the aggregation method (data unchanged)
    SetAggregation {
        path: PathBuf,
        method: String,
        #[arg(short = 'x', long)]
        xff: Option<f32>,
    },
    /// Replace the xFilesFactor
    SetXff {
        path: PathBuf,
        xff: f32,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    match Cli::parse().command {

        // ── Create ───────────────────────────────────────────────────────────
        Commands::Create { path, retentions, xff, method, sparse, overwrite } => {
            let specs = parse_retentions(&retentions)?;
            let opts = CreateOptions {
                aggregation_method: parse_method(&method)?,
                x_files_factor: xff,
                sparse,
                overwrite,
            };
            let db = WhisperFile::create(&path, &specs, &opts)?;
            println!(
                "Created: {}  ({} B on disk, {} archives)",
                path.display(),
                db.header().file_size(),
                db.header().archives.len()
            );
        }

        // ── Update ───────────────────────────────────────────────────────────
        Commands::Update { path, points, lock, flush } => {
            let now = unix_now();
            let parsed: Vec<(u32, f64)> = points
                .iter()
                .map(|p| parse_point(p, now))
                .collect::<Result<_, _>>()?;
            let mut db = WhisperFile::open_with(&path, OpenOptions { lock, flush, mmap: false })?;
            db.update_many(&parsed)?;
            println!("Stored {} point(s) in {}", parsed.len(), path.display());
        }

        // ── Fetch ────────────────────────────────────────────────────────────
        Commands::Fetch { path, from, until, mmap, json, pretty } => {
            let now = unix_now();
            let mut db = WhisperFile::open_with(&path, OpenOptions { lock: false, flush: false, mmap })?;
            let result = db.fetch(from.unwrap_or(now.saturating_sub(86400)), until)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                for (i, value) in result.values.iter().enumerate() {
                    let ts = result.from + i as u32 * result.step;
                    let rendered = value.map_or_else(|| "None".into(), |v| format!("{v}"));
                    if pretty {
                        println!("{}\t{rendered}", render_utc(ts));
                    } else {
                        println!("{ts}\t{rendered}");
                    }
                }
            }
        }

        // ── Info ─────────────────────────────────────────────────────────────
        Commands::Info { path, json } => {
            let db = WhisperFile::open(&path)?;
            let header = db.header();
            if json {
                let archives: Vec<_> = header
                    .archives
                    .iter()
                    .map(|a| {
                        json!({
                            "offset": a.offset,
                            "seconds_per_point": a.seconds_per_point,
                            "points": a.points,
                            "retention": a.retention(),
                        })
                    })
                    .collect();
                println!(
                    "{}",
                    serde_json::to_string_pretty(&json!({
                        "aggregation_method": header.aggregation_method.name(),
                        "max_retention": header.max_retention,
                        "x_files_factor": header.x_files_factor,
                        "archives": archives,
                    }))?
                );
            } else {
                print_info(&path, &db);
            }
        }

        // ── Dump ─────────────────────────────────────────────────────────────
        Commands::Dump { path } => {
            let mut db = WhisperFile::open(&path)?;
            print_info(&path, &db);
            for idx in 0..db.header().archives.len() {
                let info = db.header().archives[idx];
                println!();
                println!("Archive {idx} data ({}s × {}):", info.seconds_per_point, info.points);
                for (slot, point) in db.archive_points(idx)?.iter().enumerate() {
                    println!("{slot}: {}, {}", point.timestamp, point.value);
                }
            }
        }

        // ── Merge ────────────────────────────────────────────────────────────
        Commands::Merge { src, dst, from, until } => {
            let mut src_db = WhisperFile::open(&src)?;
            let mut dst_db = WhisperFile::open(&dst)?;
            let applied = bulk::merge(&mut src_db, &mut dst_db, from, until, unix_now())?;
            println!("Merged {applied} point(s): {} → {}", src.display(), dst.display());
        }

        // ── Fill ─────────────────────────────────────────────────────────────
        Commands::Fill { src, dst } => {
            let mut src_db = WhisperFile::open(&src)?;
            let mut dst_db = WhisperFile::open(&dst)?;
            let filled = bulk::fill(&mut src_db, &mut dst_db, unix_now())?;
            println!("Filled {filled} empty slot(s): {} → {}", src.display(), dst.display());
        }

        // ── Diff ─────────────────────────────────────────────────────────────
        Commands::Diff { left, right, ignore_empty, until, json } => {
            let mut left_db = WhisperFile::open(&left)?;
            let mut right_db = WhisperFile::open(&right)?;
            let report = bulk::diff(&mut left_db, &mut right_db, ignore_empty, until, unix_now())?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                for archive in &report {
                    println!(
                        "Archive {} ({}s): {} differing of {} slots",
                        archive.index,
                        archive.seconds_per_point,
                        archive.points.len(),
                        archive.total_slots
                    );
                    for point in &archive.points {
                        println!(
                            "  {}\t{}\t{}",
                            point.timestamp,
                            point.left.map_or_else(|| "None".into(), |v| format!("{v}")),
                            point.right.map_or_else(|| "None".into(), |v| format!("{v}")),
                        );
                    }
                }
            }
        }

        // ── Resize ───────────────────────────────────────────────────────────
        Commands::Resize { path, retentions, xff, method, aggregate, force, newfile, nobackup } => {
            let specs = parse_retentions(&retentions)?;
            let opts = ResizeOptions {
                x_files_factor: xff,
                aggregation_method: method.as_deref().map(parse_method).transpose()?,
                aggregate,
                force,
                newfile,
                nobackup,
            };
            let written = bulk::resize(&path, &specs, &opts, unix_now())?;
            println!("Resized → {}", written.display());
        }

        // ── SetAggregation ───────────────────────────────────────────────────
        Commands::SetAggregation { path, method, xff } => {
            let mut db = WhisperFile::open(&path)?;
            let old = db.set_aggregation_method(parse_method(&method)?, xff)?;
            println!("Aggregation: {} → {} ({})", old.name(), method, path.display());
        }

        // ── SetXff ───────────────────────────────────────────────────────────
        Commands::SetXff { path, xff } => {
            let mut db = WhisperFile::open(&path)?;
            let old = db.set_x_files_factor(xff)?;
            println!("xFilesFactor: {old} → {xff} ({})", path.display());
        }
    }

    Ok(())
}

// ── helpers ──────────────────────────────────────────────────────────────────

fn print_info(path: &Path, db: &WhisperFile) {
    let header = db.header();
    println!("── Whisper database ─────────────────────────────────────");
    println!("  Path            {}", path.display());
    println!("  File size       {} B", header.file_size());
    println!("  Aggregation     {}", header.aggregation_method.name());
    println!("  Max retention   {}s", header.max_retention);
    println!("  xFilesFactor    {}", header.x_files_factor);
    println!("  Archives        {}", header.archives.len());
    for (idx, info) in header.archives.iter().enumerate() {
        println!(
            "    [{idx}] {}s × {} points  (retention {}s, offset {})",
            info.seconds_per_point,
            info.points,
            info.retention(),
            info.offset
        );
    }
}

fn parse_method(token: &str) -> Result<AggregationMethod, WhisperError> {
    AggregationMethod::from_name(token).ok_or_else(|| {
        WhisperError::InvalidConfiguration(format!("unknown aggregation method '{token}'"))
    })
}

/// `timestamp:value` with `N` standing for now, or a bare value stored at now.
fn parse_point(token: &str, now: u32) -> Result<(u32, f64), WhisperError> {
    let invalid = || {
        WhisperError::InvalidConfiguration(format!(
            "invalid point '{token}' (expected timestamp:value)"
        ))
    };
    match token.split_once(':') {
        Some((ts, value)) => {
            let timestamp = if ts == "N" { now } else { ts.parse().map_err(|_| invalid())? };
            Ok((timestamp, value.parse().map_err(|_| invalid())?))
        }
        None => Ok((now, token.parse().map_err(|_| invalid())?)),
    }
}

fn render_utc(ts: u32) -> String {
    DateTime::from_timestamp(i64::from(ts), 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| ts.to_string())
}
