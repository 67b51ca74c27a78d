//! `tagmap` – fiducial marker mapper.
//!
//! This binary wires the tracker stack together and runs it until the input
//! stream ends or the operator presses Ctrl-C.  It:
//!
//! 1. Initialises logging (and OTLP export when configured).
//! 2. Loads `~/.tagmap/config.toml`, falling back to defaults, then applies
//!    `TAGMAP_*` environment overrides.
//! 3. Starts the [`TrackerNode`] tasks on a multi-threaded Tokio runtime.
//! 4. Pumps newline-delimited JSON from stdin (or `input`) onto the bus.
//! 5. On EOF or Ctrl-C, stops the tasks and writes the final table.

mod config;

use std::process::ExitCode;
use std::sync::Arc;

use colored::Colorize;
use tagmap_middleware::{EventBus, JsonLineBridge};
use tagmap_perception::{FileExporter, PoseFusion, ReferenceTracker, TfBuffer};
use tagmap_runtime::TrackerNode;
use tagmap_types::TagMapError;
use tokio::io::BufReader;
use tracing::{error, info, warn};

fn main() -> ExitCode {
    let _telemetry = tagmap_runtime::init_tracing("tagmap");

    print_banner();

    let mut cfg = match config::load() {
        Ok(Some(cfg)) => {
            info!(path = %config::config_path().display(), "config loaded");
            cfg
        }
        Ok(None) => config::Config::default(),
        Err(e) => {
            warn!(error = %e, "config unreadable; using defaults");
            config::Config::default()
        }
    };
    config::apply_env_overrides(&mut cfg);
    if let Err(e) = cfg.validate() {
        error!(error = %e, "invalid configuration");
        return ExitCode::FAILURE;
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            error!(error = %e, "failed to start async runtime");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(cfg)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "tracker stopped with an error");
            ExitCode::FAILURE
        }
    }
}

async fn run(cfg: config::Config) -> Result<(), TagMapError> {
    let session = uuid::Uuid::new_v4().simple().to_string();
    let output = cfg.output_path(&session[..8]);

    let bus = Arc::new(EventBus::new(cfg.bus_capacity));
    let reference = Arc::new(ReferenceTracker::new(cfg.reference_query()));
    let node = TrackerNode::new(
        Arc::new(PoseFusion::with_smoothing(reference, cfg.smoothing_weight)),
        Arc::new(TfBuffer::new(cfg.cache_time())),
        Arc::new(FileExporter::new(&output)),
        cfg.tick_period(),
    );
    let handle = node.spawn(&bus);
    info!(
        output = %output.display(),
        sensor_frame = %cfg.sensor_frame,
        world_frame = %cfg.world_frame,
        "tracking markers"
    );

    let bridge = JsonLineBridge::new(bus);
    let pump = async {
        match &cfg.input {
            Some(path) => {
                let file = tokio::fs::File::open(path).await.map_err(|e| {
                    TagMapError::Parsing(format!("cannot open {}: {e}", path.display()))
                })?;
                bridge.pump(BufReader::new(file)).await
            }
            None => bridge.pump(BufReader::new(tokio::io::stdin())).await,
        }
    };

    let pumped = tokio::select! {
        result = pump => result,
        _ = tokio::signal::ctrl_c() => {
            println!();
            println!("{}", "  Ctrl-C received – shutting down …".yellow().bold());
            Ok(Default::default())
        }
    };
    match &pumped {
        Ok(stats) => info!(
            lines = stats.lines,
            published = stats.published,
            rejected = stats.rejected,
            "input finished"
        ),
        Err(e) => error!(error = %e, "input stream failed"),
    }

    let report = handle.shutdown().await?;
    if let Err(e) = &report.refresh {
        warn!(error = %e, "final reference refresh failed");
    }
    println!("  {} estimates in {}", "✓".green().bold(), output.display().to_string().bold());

    pumped.map(|_| ())
}

// ─────────────────────────────────────────────────────────────────────────────
// Banner
// ─────────────────────────────────────────────────────────────────────────────

fn print_banner() {
    println!();
    println!("{}", "  tagmap".bold().cyan());
    println!(
        "{}",
        format!("  fiducial marker mapper v{}", env!("CARGO_PKG_VERSION")).dimmed()
    );
    println!();
}
