//! `perch` – object localization front-end.
//!
//! This binary:
//!
//! 1. Loads `~/.perch/config.toml` (or the path given as the first argument)
//!    and applies `PERCH_*` environment overrides.
//! 2. Seeds the transform buffer with the configured static transforms.
//! 3. Runs the [`PerceptionPipeline`] on a tokio runtime, fed by sensor
//!    frames on [`Topic::SensorFrames`] and triggers on [`Topic::Triggers`].
//!    When `frame_ingest_addr` is set, a [`JsonLinesIngest`] listener
//!    publishes frames received over TCP.
//! 4. Drops the operator into an interactive console for capture, request
//!    and goal commands.
//! 5. Intercepts **Ctrl-C** to stop the pipeline.
//!
//! [`Topic::SensorFrames`]: perch_middleware::Topic::SensorFrames
//! [`Topic::Triggers`]: perch_middleware::Topic::Triggers
//! [`JsonLinesIngest`]: perch_middleware::JsonLinesIngest

mod config;
mod console;

use colored::Colorize;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{error, info, warn};

use perch_middleware::{EventBus, FrameSource, GoalServer, JsonLinesIngest};
use perch_perception::transform::TfBuffer;
use perch_runtime::{HttpLocalizer, PerceptionPipeline, init_tracing};

/// How long shutdown waits for the pipeline to leave its current stage.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

fn main() {
    // RUST_LOG sets the level; PERCH_LOG_FORMAT=json switches to JSON lines.
    let _tracing = init_tracing("perch");

    print_banner();

    // ── Shared shutdown flag ──────────────────────────────────────────────
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = shutdown.clone();

    if let Err(e) = ctrlc::set_handler(move || {
        println!();
        println!("{}", "⚠  Ctrl-C received – stopping the pipeline …".yellow().bold());
        println!("  Press Enter to leave the console.");
        shutdown_clone.store(true, Ordering::SeqCst);
    }) {
        warn!(error = %e, "Failed to install Ctrl-C handler; graceful shutdown on Ctrl-C will not be available");
    }

    // ── Configuration ─────────────────────────────────────────────────────
    let path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(config::config_path);
    let cfg = load_config(&path);

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            error!(error = %e, "failed to start the async runtime");
            eprintln!("{}: {}", "Runtime error".red(), e);
            std::process::exit(1);
        }
    };

    // ── Pipeline ──────────────────────────────────────────────────────────
    let bus = EventBus::default();
    let goals = GoalServer::new();
    let transforms = Arc::new(TfBuffer::new());
    for edge in &cfg.static_transforms {
        transforms.set_transform(&edge.parent, &edge.child, edge.to_transform());
    }
    info!(
        count = cfg.static_transforms.len(),
        "static transforms loaded"
    );

    println!("  Backend  : {}", cfg.backend_url.bold());
    println!(
        "  Frames   : {} → {}",
        cfg.camera_frame.dimmed(),
        cfg.reference_frame.bold()
    );
    println!(
        "  Fusion   : {} observation(s)",
        cfg.num_observations_to_integrate
    );

    let pipeline = PerceptionPipeline::new(
        cfg.to_pipeline_config(),
        Box::new(HttpLocalizer::new(cfg.backend_url.clone())),
        transforms,
        bus.clone(),
        goals.clone(),
    );
    let worker = runtime.spawn(pipeline.run(shutdown.clone()));

    match &cfg.frame_ingest_addr {
        Some(addr) => match runtime.block_on(JsonLinesIngest::bind(addr)) {
            Ok(ingest) => {
                println!("  Ingest   : {}", addr.bold());
                let (bus, shutdown) = (bus.clone(), shutdown.clone());
                runtime.spawn(async move {
                    if let Err(e) = ingest.run(bus, shutdown).await {
                        error!(error = %e, "frame ingest stopped");
                    }
                });
            }
            Err(e) => {
                error!(error = %e, "frame ingest disabled");
                println!("{}: {}", "Ingest error".red(), e);
            }
        },
        None => println!(
            "  Ingest   : {}",
            "off (set frame_ingest_addr to receive frames)".dimmed()
        ),
    }

    println!();
    println!(
        "  Type {} for a list of commands.\n",
        "/help".bold().cyan()
    );

    // ── Interactive console ───────────────────────────────────────────────
    console::run(&bus, &goals, runtime.handle(), shutdown.clone());

    shutdown.store(true, Ordering::SeqCst);
    goals.preempt_current();
    runtime.block_on(async {
        if tokio::time::timeout(SHUTDOWN_GRACE, worker).await.is_err() {
            warn!("pipeline did not stop within the grace period");
        }
    });
    runtime.shutdown_timeout(SHUTDOWN_GRACE);
}

fn load_config(path: &std::path::Path) -> config::Config {
    match config::load_from(path) {
        Ok(Some(cfg)) => {
            println!("  Config loaded from {}", path.display().to_string().bold());
            cfg
        }
        Ok(None) => {
            println!(
                "  No config at {}; using defaults.",
                path.display().to_string().dimmed()
            );
            let mut cfg = config::Config::default();
            config::apply_env_overrides(&mut cfg);
            cfg
        }
        Err(e) => {
            println!("{}: {}", "Config error".red(), e);
            println!("  Using default configuration.");
            let mut cfg = config::Config::default();
            config::apply_env_overrides(&mut cfg);
            cfg
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Banner
// ─────────────────────────────────────────────────────────────────────────────

fn print_banner() {
    println!();
    println!("{}", r#"    ___  ___ ________ __"#.bold().cyan());
    println!("{}", r#"   / _ \/ -_) __/ __/ _ \"#.bold().cyan());
    println!("{}", r#"  / .__/\__/_/  \__/_//_/"#.bold().cyan());
    println!("{}", r#" /_/"#.bold().cyan());
    println!();
    println!("  {} {}",
        "perch".bold(),
        format!("v{}", env!("CARGO_PKG_VERSION")).dimmed()
    );
    println!("  Tabletop object localization front-end");
    println!();
}
