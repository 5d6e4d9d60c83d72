//! MediaFetch - Command-line front end for the transfer engine.
//!
//! Fetches one URL into a directory, rendering progress on stderr (or JSON
//! events on stdout). While a transfer runs, typing `p`, `r` or `c` on stdin
//! pauses, resumes or cancels it, in either output mode.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use crossbeam_channel::{never, select, Receiver};
use fetch_engine::{
    ChecksumAlgorithm, EngineConfig, FailureKind, OutputKind, PartialPolicy, TerminalEvent,
    TransferControl, TransferEngine, TransferEvent, TransferReport, TransferRequest,
};
use std::io::{BufRead, Stdout, Write};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

/// MediaFetch - fetch remote media with pause, resume and cancel
#[derive(Parser, Debug)]
#[command(name = "fetch")]
#[command(version)]
#[command(about = "Download media with progress, pause/resume and cancel")]
struct Args {
    /// URL of the media to fetch
    #[arg(value_name = "URL")]
    url: String,

    /// Destination directory
    #[arg(long, value_name = "DIR")]
    dest: PathBuf,

    /// Save as audio (relabels the extension, bytes are unchanged)
    #[arg(long)]
    audio: bool,

    /// Refuse media longer than this many seconds
    #[arg(long, value_name = "SECS")]
    max_duration: Option<u64>,

    /// Refuse media larger than this many bytes
    #[arg(long, value_name = "BYTES")]
    max_size: Option<u64>,

    /// Refuse media whose duration is not declared
    #[arg(long)]
    require_duration: bool,

    /// Checksum algorithm to compute: crc32, md5, sha256, blake3
    #[arg(long, value_name = "ALGORITHM")]
    checksum: Option<String>,

    /// Expected digest (hex); the download fails if it differs
    #[arg(long, value_name = "HEX", requires = "checksum")]
    expect: Option<String>,

    /// Delete the partial file when cancelled
    #[arg(long)]
    delete_partial: bool,

    /// Ignore any partial file left by an earlier run
    #[arg(long)]
    no_resume: bool,

    /// Engine configuration file (JSON)
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Print one JSON object per event on stdout
    #[arg(long)]
    json: bool,

    /// Enable verbose output
    #[arg(long)]
    verbose: bool,
}

/// A line typed by the user while a transfer runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Pause,
    Resume,
    Cancel,
}

fn parse_command(line: &str) -> Option<Command> {
    match line.trim().to_lowercase().as_str() {
        "p" | "pause" => Some(Command::Pause),
        "r" | "resume" => Some(Command::Resume),
        "c" | "cancel" | "q" => Some(Command::Cancel),
        _ => None,
    }
}

fn apply_command(control: &TransferControl, command: Command) {
    let changed = match command {
        Command::Pause => control.pause(),
        Command::Resume => control.resume(),
        Command::Cancel => control.cancel(),
    };
    if !changed {
        debug!(?command, "Command had no effect");
    }
}

/// Read commands from stdin on a detached thread.
fn spawn_stdin_commands() -> Receiver<Command> {
    let (tx, rx) = crossbeam_channel::unbounded();
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else { break };
            match parse_command(&line) {
                Some(command) => {
                    if tx.send(command).is_err() {
                        break;
                    }
                }
                None if line.trim().is_empty() => {}
                None => eprintln!("\nUnknown command '{}'. Use p, r or c.", line.trim()),
            }
        }
    });
    rx
}

/// Receives every event of a transfer, in order
trait EventReporter {
    fn on_event(&mut self, event: &TransferEvent);
}

/// Human-readable progress on stderr
struct CliProgress {
    verbose: bool,
    last_progress_update: Option<Instant>,
}

impl CliProgress {
    fn new(verbose: bool) -> Self {
        CliProgress {
            verbose,
            last_progress_update: None,
        }
    }

    fn format_bytes(bytes: u64) -> String {
        const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
        let mut size = bytes as f64;
        let mut unit_idx = 0;

        while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
            size /= 1024.0;
            unit_idx += 1;
        }

        format!("{:.2} {}", size, UNITS[unit_idx])
    }

    fn format_duration(elapsed: Duration) -> String {
        let secs = elapsed.as_secs();
        let hours = secs / 3600;
        let mins = (secs % 3600) / 60;
        let secs = secs % 60;

        if hours > 0 {
            format!("{}h {}m {}s", hours, mins, secs)
        } else if mins > 0 {
            format!("{}m {}s", mins, secs)
        } else {
            format!("{}s", secs)
        }
    }

    fn print_progress_bar(percent: u8) -> String {
        let filled = (percent.min(100) / 5) as usize;
        let empty = 20 - filled;
        format!(
            "[{}{}] {}%",
            "=".repeat(filled),
            " ".repeat(empty),
            percent
        )
    }

    fn print_outcome(outcome: &TerminalEvent) {
        eprintln!();
        match outcome {
            TerminalEvent::Completed { path, bytes, checksum } => {
                eprintln!("Download complete!");
                eprintln!("  Saved to: {}", path.display());
                eprintln!("  Size: {}", Self::format_bytes(*bytes));
                if let Some(checksum) = checksum {
                    eprintln!("  Checksum: {}", checksum.to_string_with_algo());
                }
            }
            TerminalEvent::Cancelled { partial } => {
                eprintln!("Download cancelled.");
                match partial {
                    Some(path) => eprintln!(
                        "  Partial file kept at {} (run again to resume)",
                        path.display()
                    ),
                    None => eprintln!("  Partial file removed"),
                }
            }
            TerminalEvent::Failed {
                kind: FailureKind::PolicyRefused,
                message,
            } => {
                eprintln!("Download refused: {}", message);
                eprintln!("  Upgrade your plan or raise --max-duration / --max-size to fetch it.");
            }
            TerminalEvent::Failed { message, .. } => {
                eprintln!("Download failed: {}", message);
            }
        }
    }

    fn print_elapsed(report: &TransferReport) {
        let elapsed = report.elapsed().to_std().unwrap_or_default();
        eprintln!("Elapsed: {}", Self::format_duration(elapsed));
    }
}

impl EventReporter for CliProgress {
    fn on_event(&mut self, event: &TransferEvent) {
        match event {
            TransferEvent::Started {
                total_bytes,
                resumed_from,
                filename,
            } => {
                eprintln!("Downloading {}", filename);
                if *total_bytes > 0 {
                    eprintln!("  Size: {}", Self::format_bytes(*total_bytes));
                }
                if *resumed_from > 0 {
                    eprintln!("  Resuming from {}", Self::format_bytes(*resumed_from));
                }
                if self.verbose {
                    eprintln!("  Commands: p = pause, r = resume, c = cancel");
                }
            }
            TransferEvent::Progress(progress) => {
                // Throttle progress updates to avoid spam (max once per 200ms)
                let due = self
                    .last_progress_update
                    .map_or(true, |last| last.elapsed() >= Duration::from_millis(200));
                if !due && progress.percent < 100 {
                    return;
                }
                self.last_progress_update = Some(Instant::now());

                if progress.total_bytes > 0 {
                    eprint!(
                        "\rProgress: {} | {}/{}",
                        Self::print_progress_bar(progress.percent),
                        Self::format_bytes(progress.bytes_transferred),
                        Self::format_bytes(progress.total_bytes)
                    );
                } else {
                    eprint!(
                        "\rProgress: {} received",
                        Self::format_bytes(progress.bytes_transferred)
                    );
                }
                let _ = std::io::stderr().flush();
            }
            TransferEvent::Paused { bytes_transferred } => {
                eprintln!();
                eprintln!(
                    "Paused at {}. Type 'r' to resume or 'c' to cancel.",
                    Self::format_bytes(*bytes_transferred)
                );
            }
            TransferEvent::Resumed => {
                eprintln!("Resumed.");
            }
            TransferEvent::Terminal(outcome) => Self::print_outcome(outcome),
        }
    }
}

/// One JSON object per event, one per line
struct JsonReporter<W: Write> {
    out: W,
}

impl JsonReporter<Stdout> {
    fn stdout() -> Self {
        JsonReporter {
            out: std::io::stdout(),
        }
    }
}

impl<W: Write> EventReporter for JsonReporter<W> {
    fn on_event(&mut self, event: &TransferEvent) {
        match serde_json::to_string(event) {
            Ok(line) => {
                let _ = writeln!(self.out, "{}", line);
                let _ = self.out.flush();
            }
            Err(e) => warn!(error = %e, "Failed to encode event"),
        }
    }
}

/// Map a terminal outcome to the process exit code
fn exit_code(outcome: &TerminalEvent) -> i32 {
    match outcome {
        TerminalEvent::Completed { .. } => 0,
        TerminalEvent::Cancelled { .. } => 1,
        TerminalEvent::Failed {
            kind: FailureKind::PolicyRefused,
            ..
        } => 3,
        TerminalEvent::Failed { .. } => 2,
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose {
        "fetch_engine=debug,fetch=debug"
    } else {
        "fetch_engine=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

/// Parse and validate command-line arguments, then run the transfer
fn main() {
    let args = Args::parse();
    init_tracing(args.verbose);

    let exit_code = match run_cli(&args) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            2
        }
    };

    std::process::exit(exit_code);
}

/// Main CLI logic - separated for testability
fn run_cli(args: &Args) -> Result<i32> {
    let config = build_config(args)?;
    let engine = TransferEngine::http(config).context("Failed to set up HTTP client")?;
    let request = build_request(&engine, args)?;

    let commands = spawn_stdin_commands();
    let report = if args.json {
        execute(&engine, request, &mut JsonReporter::stdout(), commands)?
    } else {
        let report = execute(&engine, request, &mut CliProgress::new(args.verbose), commands)?;
        CliProgress::print_elapsed(&report);
        report
    };

    Ok(exit_code(&report.outcome))
}

/// Load the config file (if any) and apply flag overrides
fn build_config(args: &Args) -> Result<EngineConfig> {
    let mut config = match &args.config {
        Some(path) => EngineConfig::from_json_file(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => EngineConfig::default(),
    };

    if args.delete_partial {
        config.partial_policy = PartialPolicy::Delete;
    }
    if args.no_resume {
        config.resume_partial = false;
    }
    if let Some(secs) = args.max_duration {
        config.limits.max_duration_secs = Some(secs);
    }
    if let Some(bytes) = args.max_size {
        config.limits.max_size_bytes = Some(bytes);
    }
    if args.require_duration {
        config.limits.require_known_duration = true;
    }

    config.validate()?;
    Ok(config)
}

fn build_request(engine: &TransferEngine, args: &Args) -> Result<TransferRequest> {
    let mut request = engine.request(args.url.trim(), &args.dest);
    if args.audio {
        request = request.with_output(OutputKind::AudioOnly);
    }

    if let Some(name) = &args.checksum {
        let algorithm = ChecksumAlgorithm::parse(name).ok_or_else(|| {
            anyhow!(
                "Invalid checksum algorithm '{}'. Must be 'crc32', 'md5', 'sha256', or 'blake3'",
                name
            )
        })?;
        request = request.with_checksum(algorithm, args.expect.clone());
    }

    request.validate()?;
    Ok(request)
}

/// Start the transfer and pump events and commands until it ends
fn execute(
    engine: &TransferEngine,
    request: TransferRequest,
    reporter: &mut dyn EventReporter,
    mut commands: Receiver<Command>,
) -> Result<TransferReport> {
    let handle = engine.start(request)?;
    let control = handle.control();
    let events = handle.events();

    loop {
        let mut stdin_closed = false;
        select! {
            recv(events) -> event => match event {
                Ok(event) => reporter.on_event(&event),
                Err(_) => break,
            },
            recv(commands) -> command => match command {
                Ok(command) => apply_command(&control, command),
                Err(_) => stdin_closed = true,
            },
        }
        if stdin_closed {
            commands = never();
        }
    }

    Ok(handle.wait())
}
