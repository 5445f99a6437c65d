use clap::{Parser, Subcommand};
use std::error::Error;
use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing_subscriber::EnvFilter;

use desk_fuzz::config;
use desk_fuzz::engine::{CorpusSource, EngineEvent, EngineHandle};
use desk_fuzz::session::{self, Session};
use desk_fuzz::{
    DeviceDriver, FuzzEngine, FuzzJob, PlatformProfile, ProcessSupervisor, SequenceFile, TargetSpec, TerminalDriver,
    VirtualScreen,
};

/// desk-fuzz - fuzz desktop and terminal applications with scripted input
#[derive(Parser, Debug)]
#[command(
    name = "desk-fuzz",
    about = "Replay scripted input sequences against an application and watch it for crashes",
    after_help = "ENVIRONMENT VARIABLES:\n\
        DESK_FUZZ_SESSION_DIR        Base directory for sessions\n\
        DESK_FUZZ_LAUNCH_DELAY       Seconds to wait after launching the target\n\
        DESK_FUZZ_ACTION_DELAY       Seconds between actions and inputs\n\
        DESK_FUZZ_CPU_THRESHOLD      CPU percentage reported as a spike\n\
        DESK_FUZZ_MEMORY_THRESHOLD   Memory percentage reported as a leak\n\
        DESK_FUZZ_MAX_CRASHES        Crashes after which the run stops\n\
        DESK_FUZZ_TERMINATE_TIMEOUT  Seconds to wait for a graceful exit\n\
        RUST_LOG                     Log filter (default: info)"
)]
struct Args {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Fuzz a target with every input of a corpus
    Run {
        /// Application to launch (.app bundle, .exe, script, binary or name on PATH)
        #[arg(short, long)]
        target: PathBuf,

        /// Arguments passed to the target (comma-separated)
        #[arg(short, long, value_delimiter = ',', allow_hyphen_values = true)]
        args: Vec<String>,

        /// Sequence file (JSON with initial_setup, main_sequence and timing)
        #[arg(short, long)]
        sequence: PathBuf,

        /// Corpus file, one fuzz input per line
        #[arg(short, long)]
        corpus: PathBuf,

        /// Platform profile: linux, darwin or windows (default: this host)
        #[arg(long)]
        profile: Option<PlatformProfile>,

        /// Run the target inside a pseudo-terminal and drive it through it
        #[arg(long)]
        terminal: bool,

        /// Terminal size as WxH (with --terminal, default 100x30)
        #[arg(long)]
        size: Option<String>,

        /// Record input on a virtual screen instead of delivering it
        #[arg(long)]
        dry_run: bool,

        /// Session directory (default: auto-generated under DESK_FUZZ_SESSION_DIR)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Seconds to wait after (re)launching the target
        #[arg(long, env = "DESK_FUZZ_LAUNCH_DELAY")]
        launch_delay: Option<f64>,

        /// Seconds between actions and between inputs
        #[arg(long, env = "DESK_FUZZ_ACTION_DELAY")]
        action_delay: Option<f64>,

        /// CPU percentage above which a sample counts as a spike
        #[arg(long, env = "DESK_FUZZ_CPU_THRESHOLD")]
        cpu_threshold: Option<f64>,

        /// Memory percentage above which a sample counts as a leak
        #[arg(long, env = "DESK_FUZZ_MEMORY_THRESHOLD")]
        memory_threshold: Option<f64>,

        /// Stop after this many crashes
        #[arg(long, env = "DESK_FUZZ_MAX_CRASHES")]
        max_crashes: Option<u32>,

        /// Do not capture screenshots into crash bundles
        #[arg(long)]
        no_screenshots: bool,

        /// Print the final statistics as JSON
        #[arg(long)]
        json: bool,
    },

    /// Validate a sequence file and print its actions
    Check {
        /// Sequence file to validate
        #[arg(short, long)]
        sequence: PathBuf,
    },

    /// List sessions, optionally removing old ones
    Sessions {
        /// Remove sessions older than this many hours
        #[arg(long)]
        cleanup_hours: Option<u64>,
    },
}

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    match args.command {
        Some(Commands::Run {
            target,
            args: target_args,
            sequence,
            corpus,
            profile,
            terminal,
            size,
            dry_run,
            output,
            launch_delay,
            action_delay,
            cpu_threshold,
            memory_threshold,
            max_crashes,
            no_screenshots,
            json,
        }) => {
            if !terminal && !dry_run {
                return Err("desktop input injection is not available; use --terminal or --dry-run".into());
            }

            let sequences = SequenceFile::load(&sequence)?;
            let timing = sequences.timing.unwrap_or_default();

            // flags and env win over the sequence file's timing block
            let mut run_config = config::get().run.clone();
            if sequences.timing.is_some() {
                run_config = run_config.launch_delay(timing.launch_delay).action_delay(timing.action_delay);
            }
            if let Some(secs) = launch_delay {
                run_config = run_config.launch_delay(secs);
            }
            if let Some(secs) = action_delay {
                run_config = run_config.action_delay(secs);
            }
            if let Some(percent) = cpu_threshold {
                run_config = run_config.cpu_threshold(percent);
            }
            if let Some(percent) = memory_threshold {
                run_config = run_config.memory_threshold(percent);
            }
            if let Some(max) = max_crashes {
                run_config = run_config.max_crashes(max);
            }
            if no_screenshots {
                run_config = run_config.screenshot_on_crash(false);
            }

            let mut spec = TargetSpec::new(&target).args(target_args);
            if let Some(profile) = profile {
                spec = spec.profile(profile);
            }
            let driver: Box<dyn DeviceDriver> = if terminal {
                let (cols, rows) = match &size {
                    Some(size) => parse_size(size)
                        .ok_or_else(|| format!("Invalid terminal size '{}'. Use WxH (e.g. 100x30)", size))?,
                    None => (config::DEFAULT_TERMINAL_COLS, config::DEFAULT_TERMINAL_ROWS),
                };
                spec = spec.terminal(cols, rows);
                Box::new(TerminalDriver::new(cols, rows))
            } else {
                Box::new(VirtualScreen::new(1920, 1080))
            };

            let session = match &output {
                Some(dir) => Session::in_dir(dir),
                None => Session::with_name(&target_stem(&target)),
            };
            let supervisor = ProcessSupervisor::new().launch_check(run_config.launch_check_duration());
            let job = FuzzJob::new(spec, sequences.main_sequence, CorpusSource::File(corpus))
                .initial_setup(sequences.initial_setup)
                .config(run_config)
                .session(session);

            let mut engine = FuzzEngine::new();
            let events = engine.start(job, supervisor, driver)?;
            if let Some(handle) = engine.handle() {
                spawn_console_commands(handle);
            }
            if !json {
                eprintln!("Commands: p = pause, r = resume, s = status, q = stop (then Enter)");
            }

            for event in events {
                match event {
                    EngineEvent::InputTested { index, input, verdict } if !json => {
                        println!("[{}] {:?} -> {}", index, input, verdict);
                    }
                    EngineEvent::CrashDetected(record) if !json => {
                        let bundle = record
                            .snapshot_ref
                            .as_ref()
                            .map(|p| format!(" ({})", p.display()))
                            .unwrap_or_default();
                        println!("CRASH: {} on input {:?}{}", record.crash_kind, record.input, bundle);
                    }
                    EngineEvent::Finished(_) => break,
                    _ => {}
                }
            }

            let stats = engine.wait()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&stats)?);
            } else {
                println!();
                println!("Run {}: {} inputs tested, {} crashes", stats.final_status, stats.total_inputs, stats.crashes);
                for (kind, count) in &stats.crashes_by_kind {
                    println!("  {}: {}", kind, count);
                }
                if stats.replay_failures > 0 {
                    println!("  replay failures: {}", stats.replay_failures);
                }
                if let Some(reason) = &stats.failure {
                    println!("  failure: {}", reason);
                }
            }
        }

        Some(Commands::Check { sequence }) => {
            let file = SequenceFile::load(&sequence)?;
            if file.main_sequence.is_empty() {
                return Err("main_sequence is empty".into());
            }
            println!("Sequence file OK: {}", sequence.display());
            for (label, actions) in [("initial_setup", &file.initial_setup), ("main_sequence", &file.main_sequence)] {
                println!("{} ({} actions):", label, actions.len());
                for (i, action) in actions.iter().enumerate() {
                    println!("  {:>3}. {}", i + 1, action);
                }
            }
            if let Some(timing) = file.timing {
                println!("timing: launch_delay={}s action_delay={}s", timing.launch_delay, timing.action_delay);
            }
        }

        Some(Commands::Sessions { cleanup_hours }) => {
            let base = config::session_base_dir();
            if let Some(hours) = cleanup_hours {
                let removed = session::cleanup_old_sessions(&base, Duration::from_secs(hours * 3600))?;
                println!("Removed {} session(s) older than {}h", removed, hours);
            }
            let sessions = session::list_sessions(&base)?;
            if sessions.is_empty() {
                println!("No sessions under {}", base);
            }
            for dir in sessions {
                let crashes = Session::in_dir(&dir).list_crashes().map(|c| c.len()).unwrap_or(0);
                println!("{}  ({} crash bundles)", dir.display(), crashes);
            }
        }

        None => {
            println!("desk-fuzz - fuzz desktop and terminal applications");
            println!();
            println!("Usage: desk-fuzz <COMMAND>");
            println!();
            println!("Commands:");
            println!("  run       Fuzz a target with every input of a corpus");
            println!("  check     Validate a sequence file");
            println!("  sessions  List or clean up sessions");
            println!();
            println!("Run with --help for more information.");
        }
    }

    Ok(())
}

/// Read single-letter commands from stdin until the run ends
fn spawn_console_commands(handle: EngineHandle) {
    let spawned = std::thread::Builder::new()
        .name("console-commands".into())
        .spawn(move || {
            for line in std::io::stdin().lock().lines() {
                let Ok(line) = line else { break };
                let result = match line.trim() {
                    "p" => handle.pause(),
                    "r" => handle.resume(),
                    "q" => handle.stop(),
                    "s" => {
                        let status = handle.status();
                        eprintln!(
                            "{}: input {}/{}, {} crashes, cpu {:.1}%, mem {:.1}%",
                            status.status,
                            status.current_input_index,
                            status.total_inputs,
                            status.crash_count,
                            status.cpu_sample,
                            status.mem_sample
                        );
                        Ok(())
                    }
                    "" => Ok(()),
                    other => {
                        eprintln!("Unknown command '{}'", other);
                        Ok(())
                    }
                };
                if result.is_err() {
                    break;
                }
            }
        });
    if let Err(e) = spawned {
        tracing::warn!("Console commands unavailable: {}", e);
    }
}

fn parse_size(size: &str) -> Option<(u16, u16)> {
    let (w, h) = size.split_once(['x', 'X'])?;
    let cols: u16 = w.trim().parse().ok()?;
    let rows: u16 = h.trim().parse().ok()?;
    (cols > 0 && rows > 0).then_some((cols, rows))
}

fn target_stem(target: &Path) -> String {
    target
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "fuzz".to_string())
}
