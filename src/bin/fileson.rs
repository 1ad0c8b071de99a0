//! # Fileson CLI - Catalog, diff and back up directory trees
//!
//! ## Usage
//! ```bash
//! # Scan a directory into a catalog (rescans only hash what changed)
//! fileson scan photos.fson ~/Pictures
//!
//! # What changed since two scans ago
//! fileson diff photos.fson~2 photos.fson
//!
//! # Back up with encryption, then restore elsewhere
//! fileson keygen > photos.key
//! fileson backup photos.fson photos.log /mnt/backup/photos -k photos.key
//! fileson restore /mnt/backup/photos /tmp/restored -k photos.key
//!
//! # Everything configured in fileson.toml
//! fileson config scan && fileson config backup
//! ```

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use colored::*;
use fileson::backup::BackupBuilder;
use fileson::catalog::parse_version_suffix;
use fileson::checksum;
use fileson::config::{EntryConfig, FilesonConfig, CONFIG_FILE, DEEP_ARCHIVE};
use fileson::crypto::{self, CryptoKey, EncryptReader, DEFAULT_ITERATIONS};
use fileson::destination::{Destination, DestinationSpec};
use fileson::integrity::{IntegrityTag, DEFAULT_PART_SIZE};
use fileson::progress::CancelFlag;
use fileson::restore::{fetch_catalogs, RestoreBuilder};
use fileson::scanner::{load_or_scan, ScannerBuilder};
use fileson::utils::{format_bytes, parse_quantity};
use fileson::verification::{audit, verify_destination};
use fileson::{BackupLog, Catalog, ChangeKind, ChecksumAlgorithm, FilesonError, ProgressCallback, ProgressInfo, Result};
use humantime::format_duration;
use indicatif::{ProgressBar, ProgressStyle};
use std::fs::File;
use std::io::{self, BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

/// Fileson CLI - incremental catalogs and deduplicated backups
#[derive(Parser)]
#[command(name = "fileson")]
#[command(version)]
#[command(about = "Catalog directory trees over time and back them up incrementally")]
#[command(long_about = None)]
struct Cli {
    /// Print more; repeat for even more
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct ScanArgs {
    /// Checksum: sha1, sha1fast or none (default: the catalog's, else sha1)
    #[arg(short, long)]
    checksum: Option<String>,

    /// Skip paths containing this text, or matching this glob (repeatable)
    #[arg(short = 'p', long = "skip")]
    skip: Vec<String>,

    /// Reuse checksums only for the same path, not just the same file name
    #[arg(short, long)]
    strict: bool,

    /// Parallel hashing workers (default: number of CPUs)
    #[arg(short = 'j', long)]
    workers: Option<usize>,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan a directory into a catalog
    Scan {
        /// Catalog file
        dbfile: PathBuf,

        /// Directory to scan (default: the one recorded in the catalog)
        dir: Option<PathBuf>,

        #[command(flatten)]
        options: ScanArgs,

        /// Scan without writing the catalog
        #[arg(short = 'i', long)]
        simulate: bool,
    },

    /// Show changes from one catalog or directory to another
    Diff {
        /// Origin catalog (name~N for N scans back) or directory
        origin: String,

        /// Target catalog or directory
        target: String,

        /// Checksum used when scanning directories
        #[arg(short, long)]
        checksum: Option<String>,

        /// Print deltas as JSON
        #[arg(long)]
        json: bool,

        /// Indent JSON output
        #[arg(short, long, requires = "json")]
        pretty: bool,
    },

    /// List files sharing the same content
    #[command(alias = "dups")]
    Duplicates {
        /// Catalog or directory
        dbfile: String,

        /// Ignore files smaller than this (k, M and G suffixes)
        #[arg(short, long, default_value = "0")]
        minsize: String,
    },

    /// Summarize a catalog
    Stats {
        /// Catalog or directory
        dbfile: String,

        /// Also print the metadata history
        #[arg(long)]
        history: bool,
    },

    /// List the files of a catalog
    Show {
        /// Catalog or directory
        dbfile: String,

        /// Print size, modification time and checksum
        #[arg(short, long)]
        long: bool,
    },

    /// Write a catalog version to a new file
    Copy {
        /// Source catalog, possibly name~N
        src: String,

        /// Destination file
        dest: PathBuf,

        /// Overwrite an existing destination
        #[arg(short, long)]
        force: bool,
    },

    /// Re-hash a random sample of files against the catalog
    Audit {
        /// Catalog file
        dbfile: String,

        /// Backup log (files missing from it are reported)
        logfile: Option<PathBuf>,

        /// Fraction of files to sample
        #[arg(short, long, default_value_t = 0.01)]
        fraction: f64,
    },

    /// Back up files that are not yet in the backup log
    Backup {
        /// Catalog file or directory
        dbfile: String,

        /// Backup log, appended to as files are stored
        logfile: PathBuf,

        /// Destination directory or s3://bucket/prefix
        destination: String,

        #[command(flatten)]
        transfer: TransferArgs,

        /// Use the deep archive storage class for object-store destinations
        #[arg(short, long)]
        deep_archive: bool,

        /// Only report what would be transferred
        #[arg(short = 'i', long)]
        simulate: bool,
    },

    /// Restore a backup into a directory
    Restore {
        /// Backup destination to restore from
        source: String,

        /// Directory to restore into
        target: PathBuf,

        /// Catalog file (default: the one stored with the backup)
        #[arg(long)]
        dbfile: Option<String>,

        /// Backup log (default: the one stored with the backup)
        #[arg(long)]
        logfile: Option<PathBuf>,

        /// Key in hex or a key file
        #[arg(short, long)]
        key: Option<String>,

        /// Skip hashing restored files
        #[arg(long)]
        no_verify: bool,
    },

    /// Compare recorded integrity tags with a destination
    CheckTags {
        /// Backup log
        logfile: PathBuf,

        /// Backup destination
        destination: String,
    },

    /// Generate a key, randomly or from a password and salt
    Keygen {
        /// Password
        password: Option<String>,

        /// Salt
        salt: Option<String>,

        /// PBKDF2 iterations (k and M suffixes)
        #[arg(short, long, default_value = "1M")]
        iterations: String,
    },

    /// Encrypt a file
    Encrypt {
        /// Input file
        input: PathBuf,
        /// Output file
        output: PathBuf,
        /// Key in hex or a key file
        key: String,
        /// IV, 32 hex characters (default: random)
        #[arg(long)]
        iv: Option<String>,
        /// Overwrite the output
        #[arg(short, long)]
        force: bool,
    },

    /// Decrypt a file
    Decrypt {
        /// Input file
        input: PathBuf,
        /// Output file
        output: PathBuf,
        /// Key in hex or a key file
        key: String,
        /// Overwrite the output
        #[arg(short, long)]
        force: bool,
    },

    /// Compute the object-store integrity tag of a file
    Etag {
        /// Input file
        input: PathBuf,

        /// Part size in MiB (bytes if 65536 or more)
        #[arg(short, long, default_value_t = 8)]
        partsize: u64,

        /// Tag the encrypted form instead
        #[arg(short, long, requires = "iv")]
        key: Option<String>,

        /// IV of the encrypted form
        #[arg(long)]
        iv: Option<String>,
    },

    /// Run configured entries from fileson.toml
    Config {
        /// Configuration file
        #[arg(short, long, default_value = CONFIG_FILE)]
        config: PathBuf,

        /// Entry to act on (repeatable; default all)
        #[arg(short, long = "entry")]
        entries: Vec<String>,

        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Args)]
struct TransferArgs {
    /// Key in hex or a key file
    #[arg(short, long)]
    key: Option<String>,

    /// Multipart part size in MiB (bytes if 65536 or more)
    #[arg(long, default_value_t = 8)]
    partsize: u64,
}

#[derive(Subcommand, Clone, Copy)]
enum ConfigAction {
    /// Check folders and files of each entry
    Check,
    /// Scan each entry
    Scan,
    /// Back up each entry
    Backup {
        /// Only report what would be transferred
        #[arg(short = 'i', long)]
        simulate: bool,
    },
}

fn main() {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();

    if std::env::var("NO_COLOR").is_ok() {
        colored::control::set_override(false);
    }

    let cancel = CancelFlag::new();
    install_interrupt_handler(cancel.clone());

    if let Err(e) = run(cli, &cancel) {
        match e.downcast_ref::<FilesonError>() {
            Some(error) if e.chain().count() > 1 => {
                eprintln!("{}: {}: {}", "Error".red().bold(), e, error.user_message())
            }
            Some(error) => eprintln!("{}: {}", "Error".red().bold(), error.user_message()),
            None => eprintln!("{}: {:#}", "Error".red().bold(), e),
        }
        std::process::exit(1);
    }
}

/// Raise `cancel` on Ctrl-C
///
/// The signal is awaited on a small runtime of its own; the work itself stays
/// on the main thread and notices the flag between files and chunks.
fn install_interrupt_handler(cancel: CancelFlag) {
    std::thread::spawn(move || {
        let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
            Ok(runtime) => runtime,
            Err(e) => {
                warn!("Cannot install Ctrl-C handler: {}", e);
                return;
            }
        };
        runtime.block_on(async {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("\n{}", "Interrupted, stopping after the current file...".yellow());
                cancel.cancel();
            }
        });
    });
}

fn run(cli: Cli, cancel: &CancelFlag) -> anyhow::Result<()> {
    let outcome = match cli.command {
        Commands::Scan {
            dbfile,
            dir,
            options,
            simulate,
        } => {
            let checksum = options.checksum.as_deref().map(|c| checksum::parse_optional(Some(c))).transpose()?;
            cmd_scan(&dbfile, dir, checksum, options.skip, options.strict, options.workers, simulate, cancel)
        }
        Commands::Diff {
            origin,
            target,
            checksum,
            json,
            pretty,
        } => cmd_diff(&origin, &target, checksum.as_deref(), json, pretty),
        Commands::Duplicates { dbfile, minsize } => cmd_duplicates(&dbfile, &minsize),
        Commands::Stats { dbfile, history } => cmd_stats(&dbfile, history),
        Commands::Show { dbfile, long } => cmd_show(&dbfile, long),
        Commands::Copy { src, dest, force } => cmd_copy(&src, &dest, force),
        Commands::Audit {
            dbfile,
            logfile,
            fraction,
        } => cmd_audit(&dbfile, logfile.as_deref(), fraction),
        Commands::Backup {
            dbfile,
            logfile,
            destination,
            transfer,
            deep_archive,
            simulate,
        } => cmd_backup(
            &dbfile,
            &logfile,
            &destination,
            load_key(transfer.key.as_deref())?,
            transfer.partsize,
            deep_archive,
            simulate,
            cancel,
        ),
        Commands::Restore {
            source,
            target,
            dbfile,
            logfile,
            key,
            no_verify,
        } => cmd_restore(
            &source,
            &target,
            dbfile.as_deref(),
            logfile.as_deref(),
            load_key(key.as_deref())?,
            !no_verify,
            cancel,
        ),
        Commands::CheckTags { logfile, destination } => cmd_check_tags(&logfile, &destination),
        Commands::Keygen {
            password,
            salt,
            iterations,
        } => cmd_keygen(password, salt, &iterations),
        Commands::Encrypt {
            input,
            output,
            key,
            iv,
            force,
        } => cmd_encrypt(&input, &output, &key, iv.as_deref(), force),
        Commands::Decrypt {
            input,
            output,
            key,
            force,
        } => cmd_decrypt(&input, &output, &key, force),
        Commands::Etag {
            input,
            partsize,
            key,
            iv,
        } => cmd_etag(&input, partsize, key.as_deref(), iv.as_deref()),
        Commands::Config {
            config,
            entries,
            action,
        } => return cmd_config(&config, &entries, action, cancel),
    };
    Ok(outcome?)
}

fn load_key(value: Option<&str>) -> Result<Option<CryptoKey>> {
    value.map(CryptoKey::from_hex_or_file).transpose()
}

fn open_destination(
    location: &str,
    create: bool,
    part_size: u64,
    storage_class: Option<String>,
) -> Result<Box<dyn Destination>> {
    location.parse::<DestinationSpec>()?.open(create, part_size, storage_class)
}

fn refuse_overwrite(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        return Err(FilesonError::InvalidConfiguration(format!(
            "{} exists, use --force to overwrite",
            path.display()
        )));
    }
    Ok(())
}

/// Byte progress bar fed by transfer callbacks
fn transfer_bar(total_bytes: u64) -> (ProgressBar, ProgressCallback) {
    let bar = ProgressBar::new(total_bytes);
    if let Ok(style) = ProgressStyle::default_bar()
        .template("{spinner:.green} [{bar:30.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}) {msg}")
    {
        bar.set_style(style.progress_chars("=> "));
    }
    let handle = bar.clone();
    let callback: ProgressCallback = Arc::new(move |info: ProgressInfo| {
        handle.set_position(info.bytes_processed);
        if let Some(item) = info.current_item {
            handle.set_message(item);
        }
    });
    (bar, callback)
}

/// Scan a directory into a catalog
///
/// The catalog is live-logged while scanning, so an interrupted scan keeps
/// everything recorded so far and the next scan reuses those checksums.
#[allow(clippy::too_many_arguments)]
fn cmd_scan(
    dbfile: &Path,
    dir: Option<PathBuf>,
    checksum: Option<Option<ChecksumAlgorithm>>,
    skip: Vec<String>,
    strict: bool,
    workers: Option<usize>,
    simulate: bool,
    cancel: &CancelFlag,
) -> Result<()> {
    let mut catalog = if dbfile.exists() {
        Catalog::load(dbfile)?
    } else {
        Catalog::new()
    };

    let root = match dir.or_else(|| catalog.directory().map(PathBuf::from)) {
        Some(root) => root,
        None => {
            return Err(FilesonError::InvalidConfiguration(
                "No directory given and none recorded in the catalog".to_string(),
            ))
        }
    };
    let checksum = match checksum {
        Some(explicit) => explicit,
        None if catalog.is_empty() => Some(ChecksumAlgorithm::Sha1),
        None => catalog.checksum_algorithm()?,
    };

    println!(
        "{} {} into {}",
        "Scanning".blue().bold(),
        root.display().to_string().cyan(),
        dbfile.display().to_string().cyan()
    );

    let spinner = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.green} {msg}") {
        spinner.set_style(style);
    }
    let handle = spinner.clone();

    let mut builder = ScannerBuilder::new(&root)
        .checksum(checksum)
        .skip_patterns(skip)
        .strict(strict)
        .cancel_flag(cancel.clone())
        .progress_callback(Arc::new(move |info: ProgressInfo| {
            handle.set_message(format!("{} hashed, {}", info.processed, format_bytes(info.bytes_processed)));
            handle.tick();
        }));
    if let Some(workers) = workers {
        builder = builder.parallel_workers(workers);
    }
    let scanner = builder.build()?;

    let report = if simulate {
        scanner.scan(&mut catalog)
    } else {
        let mut session = catalog.live_session(dbfile)?;
        scanner.scan(&mut session)
    };
    spinner.finish_and_clear();
    let report = report?;

    println!("{} Scan {} complete", "✓".green().bold(), report.scan.to_string().yellow());
    println!("  Files: {} ({})", report.files.to_string().cyan(), format_bytes(report.total_bytes).cyan());
    println!("  Directories: {}", report.dirs.to_string().cyan());
    println!(
        "  Hashed: {} ({}), reused: {}",
        report.hashed.to_string().cyan(),
        format_bytes(report.bytes_hashed),
        report.reused.to_string().cyan()
    );
    println!("  Removed: {}", report.removed.to_string().yellow());
    println!("  New records: {}", report.records_written.to_string().cyan());
    println!("  Time: {}", format_duration(Duration::from_millis(report.duration_ms)).to_string().cyan());
    print_file_errors(&report.errors);

    if simulate {
        println!("{}", "Simulated, catalog not written".yellow());
    }
    Ok(())
}

/// Show changes between two catalogs or directories
fn cmd_diff(origin: &str, target: &str, checksum: Option<&str>, json: bool, pretty: bool) -> Result<()> {
    let checksum = checksum::parse_optional(checksum)?;
    let origin = load_or_scan(origin, checksum)?;
    let target = load_or_scan(target, checksum)?;
    let diff = origin.diff(&target)?;

    if json {
        let text = if pretty {
            serde_json::to_string_pretty(&diff.deltas)?
        } else {
            serde_json::to_string(&diff.deltas)?
        };
        println!("{}", text);
        return Ok(());
    }

    if diff.is_degraded() {
        eprintln!(
            "{}",
            "Catalogs use different checksums, comparing size and modification time only".yellow()
        );
    }

    for delta in &diff.deltas {
        let moved = delta
            .counterpart
            .as_deref()
            .map(|c| format!(" (same content as {})", c))
            .unwrap_or_default();
        match delta.kind() {
            ChangeKind::Added => println!("{} {}{}", "+".green().bold(), delta.path.green(), moved.dimmed()),
            ChangeKind::Removed => println!("{} {}{}", "-".red().bold(), delta.path.red(), moved.dimmed()),
            ChangeKind::Modified => println!("{} {}", "~".yellow().bold(), delta.path.yellow()),
        }
    }

    println!(
        "\n{} added, {} removed, {} modified",
        diff.count(ChangeKind::Added).to_string().green(),
        diff.count(ChangeKind::Removed).to_string().red(),
        diff.count(ChangeKind::Modified).to_string().yellow()
    );
    Ok(())
}

fn cmd_duplicates(dbfile: &str, minsize: &str) -> Result<()> {
    let catalog = load_or_scan(dbfile, Some(ChecksumAlgorithm::Sha1))?;
    if catalog.checksum_algorithm()?.is_none() {
        eprintln!("{}", "No checksum, using file size!".yellow());
    }

    let groups = catalog.duplicates(parse_quantity(minsize)?)?;
    let mut wasted = 0;
    for group in &groups {
        println!("{} {}", group.content.yellow(), format_bytes(group.size).dimmed());
        for path in &group.paths {
            println!("  {}", path);
        }
        wasted += group.wasted_bytes();
    }

    println!(
        "\n{} groups, {} in extra copies",
        groups.len().to_string().cyan(),
        format_bytes(wasted).cyan()
    );
    Ok(())
}

fn cmd_stats(dbfile: &str, history: bool) -> Result<()> {
    let catalog = load_or_scan(dbfile, None)?;
    let stats = catalog.stats();

    println!("{}", "Catalog statistics".blue().bold());
    println!("  Files: {}", stats.files.to_string().cyan());
    println!("  Directories: {}", stats.dirs.to_string().cyan());
    println!("  Max depth: {}", stats.max_depth.to_string().cyan());
    println!("  Total size: {}", format_bytes(stats.total_size).cyan());
    println!("  Max file size: {}", format_bytes(stats.max_size).cyan());
    println!("  Records: {}", stats.records.to_string().cyan());

    if history {
        println!("\n{}", "Metadata history:".blue().bold());
        for event in &stats.history {
            let value = event
                .value
                .as_ref()
                .map(|v| v.to_string())
                .unwrap_or_else(|| "(deleted)".to_string());
            println!("{:05}: {:12} {}", event.position, event.key, value);
        }
    }
    Ok(())
}

fn cmd_show(dbfile: &str, long: bool) -> Result<()> {
    let catalog = load_or_scan(dbfile, None)?;
    let algorithm = catalog.checksum_algorithm()?;

    for (path, meta) in catalog.files() {
        if long {
            let sum = algorithm.and_then(|a| meta.checksum(a)).unwrap_or("-");
            println!("{}  {:>10}  {}  {}", meta.modified_gmt, meta.size, sum.dimmed(), path);
        } else {
            println!("{}", path);
        }
    }
    Ok(())
}

fn cmd_copy(src: &str, dest: &Path, force: bool) -> Result<()> {
    refuse_overwrite(dest, force)?;
    let catalog = Catalog::load_version(src)?;
    catalog.save(dest)?;

    let (name, back) = parse_version_suffix(src);
    println!(
        "{} Wrote {} ({} scans back) to {} ({} records)",
        "✓".green().bold(),
        name.cyan(),
        back,
        dest.display().to_string().cyan(),
        catalog.records().len()
    );
    Ok(())
}

fn cmd_audit(dbfile: &str, logfile: Option<&Path>, fraction: f64) -> Result<()> {
    let catalog = Catalog::load_version(dbfile)?;
    let log = match logfile {
        Some(path) => BackupLog::load(path)?,
        None => BackupLog::new(),
    };

    let report = audit(&catalog, &log, fraction)?;
    for mismatch in &report.mismatches {
        println!("{} {}", "CHANGED".red().bold(), mismatch.path);
        println!("  recorded {} vs. now {}", mismatch.recorded, mismatch.actual);
    }
    if logfile.is_some() {
        for path in &report.not_backed_up {
            println!("{} {}", "NOT BACKED UP".yellow().bold(), path);
        }
    }
    print_file_errors(&report.errors);

    let mismatch_free = report.mismatches.is_empty() && report.errors.is_empty();
    let mark = if mismatch_free { "✓".green().bold() } else { "✗".red().bold() };
    println!("{} {}", mark, report.summary());
    Ok(())
}

/// Back up everything in a catalog that the backup log has not stored yet
#[allow(clippy::too_many_arguments)]
fn cmd_backup(
    dbfile: &str,
    logfile: &Path,
    destination: &str,
    key: Option<CryptoKey>,
    partsize: u64,
    deep_archive: bool,
    simulate: bool,
    cancel: &CancelFlag,
) -> Result<()> {
    let catalog = load_or_scan(dbfile, Some(ChecksumAlgorithm::Sha1))?;
    let catalog_path = PathBuf::from(parse_version_suffix(dbfile).0);
    let mut log = if logfile.exists() {
        BackupLog::load(logfile)?
    } else {
        BackupLog::new()
    };

    let part_size = IntegrityTag::from_arg(partsize).part_size();
    let builder = BackupBuilder::new()
        .key(key)
        .part_size(part_size)
        .cancel_flag(cancel.clone());

    let plan = builder.clone().build().plan(&catalog, &log)?;
    println!(
        "{} files to back up, total {} ({} already stored, {} duplicates)",
        plan.pending.len().to_string().cyan(),
        format_bytes(plan.total_bytes).cyan(),
        plan.already_stored,
        plan.duplicates
    );
    if simulate {
        for pending in &plan.pending {
            debug!("Would store {} ({})", pending.paths[0], pending.sha1);
            println!("  {} {}", pending.paths[0], format_bytes(pending.size).dimmed());
        }
        println!("{}", "Simulated, nothing transferred".yellow());
        return Ok(());
    }

    let storage_class = deep_archive.then(|| DEEP_ARCHIVE.to_string());
    let destination = open_destination(destination, true, part_size, storage_class)?;

    let (bar, callback) = transfer_bar(plan.total_bytes);
    let result = builder
        .progress_callback(callback)
        .build()
        .run(&catalog, &catalog_path, &mut log, logfile, destination.as_ref());
    bar.finish_and_clear();
    let report = result?;

    println!(
        "{} Backup {} to {} complete",
        "✓".green().bold(),
        report.run.to_string().yellow(),
        destination.describe().cyan()
    );
    println!(
        "  Stored: {} blobs ({})",
        report.uploaded.to_string().cyan(),
        format_bytes(report.bytes).cyan()
    );
    println!("  Already stored: {}", report.already_stored.to_string().cyan());
    println!("  Duplicates: {}", report.duplicates.to_string().cyan());
    println!("  Time: {}", format_duration(round_secs(report.duration)).to_string().cyan());
    for name in &report.tag_mismatches {
        println!("{} integrity tag mismatch for {}", "!".red().bold(), name);
    }
    print_file_errors(&report.errors);
    Ok(())
}

fn cmd_restore(
    source: &str,
    target: &Path,
    dbfile: Option<&str>,
    logfile: Option<&Path>,
    key: Option<CryptoKey>,
    verify: bool,
    cancel: &CancelFlag,
) -> Result<()> {
    let source = open_destination(source, false, DEFAULT_PART_SIZE, None)?;

    let (catalog, log) = match (dbfile, logfile) {
        (Some(dbfile), Some(logfile)) => (Catalog::load_version(dbfile)?, BackupLog::load(logfile)?),
        (dbfile, logfile) => {
            println!("{} catalogs from {}", "Fetching".blue().bold(), source.describe().cyan());
            let (stored_catalog, stored_log) = fetch_catalogs(source.as_ref(), key.as_ref())?;
            let catalog = match dbfile {
                Some(dbfile) => Catalog::load_version(dbfile)?,
                None => stored_catalog,
            };
            let log = match logfile {
                Some(logfile) => BackupLog::load(logfile)?,
                None => stored_log,
            };
            (catalog, log)
        }
    };

    let total: u64 = catalog.files().map(|(_, meta)| meta.size).sum();
    let (bar, callback) = transfer_bar(total);
    let result = RestoreBuilder::new()
        .key(key)
        .verify(verify)
        .cancel_flag(cancel.clone())
        .progress_callback(callback)
        .build()
        .restore(&catalog, &log, source.as_ref(), target);
    bar.finish_and_clear();
    let report = result?;

    let mark = if report.is_complete() { "✓".green().bold() } else { "✗".red().bold() };
    println!("{} Restored into {}", mark, target.display().to_string().cyan());
    println!("  Directories: {}", report.dirs.to_string().cyan());
    println!(
        "  Files: {} ({})",
        report.restored.to_string().cyan(),
        format_bytes(report.bytes).cyan()
    );
    println!("  Time: {}", format_duration(round_secs(report.duration)).to_string().cyan());
    for path in &report.missing {
        println!("{} {}", "MISSING".red().bold(), path);
    }
    print_file_errors(&report.verify_failures);
    print_file_errors(&report.errors);

    if !report.is_complete() {
        return Err(FilesonError::InvalidConfiguration(format!(
            "{} files missing, {} failed verification, {} failed",
            report.missing.len(),
            report.verify_failures.len(),
            report.errors.len()
        )));
    }
    Ok(())
}

fn cmd_check_tags(logfile: &Path, destination: &str) -> Result<()> {
    let log = BackupLog::load(logfile)?;
    let destination = open_destination(destination, false, DEFAULT_PART_SIZE, None)?;
    let report = verify_destination(&log, destination.as_ref())?;

    for name in &report.missing {
        println!("{} {}", "MISSING".red().bold(), name);
    }
    for mismatch in &report.mismatched {
        println!("{} {}", "TAG".red().bold(), mismatch.name);
        println!("  recorded {} vs. reported {}", mismatch.recorded, mismatch.reported);
    }
    for name in &report.wrong_size {
        println!("{} {}", "SIZE".red().bold(), name);
    }

    let mark = if report.is_valid() { "✓".green().bold() } else { "✗".red().bold() };
    println!("{} {}", mark, report.summary());
    Ok(())
}

fn cmd_keygen(password: Option<String>, salt: Option<String>, iterations: &str) -> Result<()> {
    let iterations = u32::try_from(parse_quantity(iterations)?)
        .map_err(|_| FilesonError::InvalidConfiguration(format!("too many iterations: {}", iterations)))?;

    let key = match (password, salt) {
        (Some(password), Some(salt)) => {
            if iterations < DEFAULT_ITERATIONS {
                warn!("Deriving with {} iterations, fewer than the default {}", iterations, DEFAULT_ITERATIONS);
            }
            let started = Instant::now();
            let key = CryptoKey::derive(&password, &salt, iterations);
            debug!("Derived key in {}", format_duration(round_secs(started.elapsed())));
            key
        }
        (None, None) => CryptoKey::generate(),
        _ => {
            return Err(FilesonError::InvalidConfiguration(
                "give both a password and a salt, or neither".to_string(),
            ))
        }
    };

    println!("{}", key.to_hex());
    Ok(())
}

fn cmd_encrypt(input: &Path, output: &Path, key: &str, iv: Option<&str>, force: bool) -> Result<()> {
    refuse_overwrite(output, force)?;
    let key = CryptoKey::from_hex_or_file(key)?;
    let iv = iv.map(crypto::parse_iv).transpose()?;

    let source = BufReader::new(File::open(input)?);
    let mut sink = BufWriter::new(File::create(output)?);
    let written = crypto::encrypt_stream(source, &mut sink, &key, iv)?;
    sink.into_inner().map_err(|e| FilesonError::Io(e.into_error()))?.sync_all()?;

    println!(
        "{} Encrypted {} to {} ({})",
        "✓".green().bold(),
        input.display(),
        output.display().to_string().cyan(),
        format_bytes(written)
    );
    Ok(())
}

fn cmd_decrypt(input: &Path, output: &Path, key: &str, force: bool) -> Result<()> {
    refuse_overwrite(output, force)?;
    let key = CryptoKey::from_hex_or_file(key)?;

    let source = BufReader::new(File::open(input)?);
    let sink = crypto::decrypt_stream(source, BufWriter::new(File::create(output)?), &key)?;
    sink.into_inner().map_err(|e| FilesonError::Io(e.into_error()))?.sync_all()?;

    println!(
        "{} Decrypted {} to {}",
        "✓".green().bold(),
        input.display(),
        output.display().to_string().cyan()
    );
    Ok(())
}

fn cmd_etag(input: &Path, partsize: u64, key: Option<&str>, iv: Option<&str>) -> Result<()> {
    let tagger = IntegrityTag::from_arg(partsize);
    let source = BufReader::new(File::open(input)?);

    let tag = match (key, iv) {
        (Some(key), Some(iv)) => {
            let key = CryptoKey::from_hex_or_file(key)?;
            tagger.compute(EncryptReader::new(source, &key, Some(crypto::parse_iv(iv)?)))?
        }
        _ => tagger.compute(source)?,
    };

    println!("{}", tag);
    Ok(())
}

fn cmd_config(path: &Path, names: &[String], action: ConfigAction, cancel: &CancelFlag) -> anyhow::Result<()> {
    let config = FilesonConfig::load(path)?;

    for (name, entry) in config.select(names)? {
        cancel.check()?;
        run_entry(&config, name, entry, action, cancel).with_context(|| format!("entry {}", name))?;
    }
    Ok(())
}

fn run_entry(
    config: &FilesonConfig,
    name: &str,
    entry: &EntryConfig,
    action: ConfigAction,
    cancel: &CancelFlag,
) -> Result<()> {
    let catalog_path = config.catalog_path(name);
    let log_path = config.log_path(name);
    println!("{} {}", "Entry".blue().bold(), name.yellow());

    match action {
        ConfigAction::Check => {
            let status = config.check(name)?;
            print_presence("Folder", &entry.folder, status.folder_exists);
            print_presence("Catalog", &catalog_path, status.catalog_exists);
            print_presence("Backup log", &log_path, status.log_exists);
            match entry.resolved_destination(name) {
                Ok(destination) => println!("  Destination: {}", destination.cyan()),
                Err(_) => println!("  Destination: {}", "none".dimmed()),
            }
        }
        ConfigAction::Scan => cmd_scan(
            &catalog_path,
            Some(entry.folder.clone()),
            Some(entry.checksum_algorithm()?),
            entry.skip.clone(),
            entry.strict,
            None,
            false,
            cancel,
        )?,
        ConfigAction::Backup { simulate } => cmd_backup(
            &catalog_path.display().to_string(),
            &log_path,
            &entry.resolved_destination(name)?,
            load_key(entry.key.as_deref())?,
            8,
            entry.deep_archive,
            simulate,
            cancel,
        )?,
    }
    Ok(())
}

fn print_presence(label: &str, path: &Path, exists: bool) {
    let mark = if exists { "✓".green() } else { "✗".red() };
    println!("  {} {}: {}", mark, label, path.display());
}

fn print_file_errors(errors: &[fileson::FileError]) {
    for error in errors {
        println!("{} {}: {}", "ERROR".red().bold(), error.path, error.message);
    }
}

fn round_secs(duration: Duration) -> Duration {
    Duration::from_secs(duration.as_secs())
}
