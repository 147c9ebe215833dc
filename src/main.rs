use anyhow::{Context, Result};
use clap::Parser;
use hilvan::cli::{Cli, Command, OutputFormat};
use hilvan::throttle_sim::{self, ExperimentConfig, ExperimentReport};
use hilvan::{wire, CorrelationEngine, EngineConfig, Frame, FrameTable};
use std::path::Path;
use std::sync::Arc;
use std::thread;
use tracing_subscriber::EnvFilter;

/// Initialize tracing subscriber for debug output
fn init_tracing(debug: bool) {
    if debug {
        tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::from_default_env().add_directive(tracing::Level::TRACE.into()),
            )
            .with_writer(std::io::stderr)
            .init();
    }
}

fn print_frames(frames: &[Frame], format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Text => {
            for frame in frames {
                match frame {
                    Frame::Boundary => println!("{}", frame),
                    Frame::Call(_) => println!("    at {}", frame),
                }
            }
        }
        OutputFormat::Json => {
            let table = FrameTable::from_frames(frames);
            println!("{}", serde_json::to_string_pretty(&table)?);
        }
    }
    Ok(())
}

fn print_report(report: &ExperimentReport, target: f64, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Text => {
            println!("measured:     {}", report.measured);
            println!("skipped:      {}", report.skipped);
            println!("non-measured: {}", report.non_measured);
            println!("achieved:     {:.3}% (target {}%)", report.percent(), target);
        }
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(report)?),
    }
    Ok(())
}

/// Unit of work handed from one thread to the next
#[derive(Debug)]
struct Hop {
    index: usize,
}

#[inline(never)]
fn schedule_hop(engine: &CorrelationEngine, hop: &Arc<Hop>) {
    engine.capture(hop);
}

#[inline(never)]
fn run_hop(engine: Arc<CorrelationEngine>, hop: Arc<Hop>, remaining: usize) -> Result<Vec<Frame>> {
    let inner = Arc::clone(&engine);
    let index = hop.index;
    engine.insert_region(&hop, move || {
        if remaining == 0 {
            return Ok(fail_last_hop(&inner, index));
        }
        let next = Arc::new(Hop { index: index + 1 });
        schedule_hop(&inner, &next);
        spawn_hop(inner, next, remaining - 1)
    })
}

#[inline(never)]
fn fail_last_hop(engine: &CorrelationEngine, index: usize) -> Vec<Frame> {
    if engine.config().track_all_workers {
        eprintln!(
            "workers with async traces: {}",
            engine.all_captured_stacks(engine.config().error_trace_depth_limit).len()
        );
    }
    let error = engine.new_error(format!("hop {} failed", index));
    tracing::debug!(error = %error, "created demo error");
    engine.async_stack_trace(&error)
}

fn spawn_hop(engine: Arc<CorrelationEngine>, hop: Arc<Hop>, remaining: usize) -> Result<Vec<Frame>> {
    let handle = thread::Builder::new()
        .name(format!("hop-{}", hop.index))
        .spawn(move || run_hop(engine, hop, remaining))
        .context("failed to spawn hop thread")?;
    handle
        .join()
        .map_err(|_| anyhow::anyhow!("hop thread panicked"))?
}

fn run_demo(hops: usize, limit: usize, track_all: bool) -> Result<Vec<Frame>> {
    if hops == 0 {
        anyhow::bail!("Invalid value for --hops: 0 (must be >= 1)");
    }
    let mut config = EngineConfig::from_env()?;
    config.track_all_workers |= track_all;
    config.error_trace_depth_limit = limit;
    let engine = Arc::new(CorrelationEngine::builder().config(config).build());

    let first = Arc::new(Hop { index: 0 });
    schedule_hop(&engine, &first);
    let frames = spawn_hop(Arc::clone(&engine), first, hops - 1)?;

    tracing::debug!(stats = ?engine.stats(), "demo finished");
    Ok(frames)
}

fn write_wire(path: &Path, frames: &[Frame]) -> Result<()> {
    let encoded = wire::encode(frames)?;
    std::fs::write(path, encoded)
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}

fn decode_file(file: &Path) -> Result<Vec<Frame>> {
    let bytes =
        std::fs::read(file).with_context(|| format!("failed to read {}", file.display()))?;
    let frames =
        wire::decode(&bytes).with_context(|| format!("{} is not a valid trace", file.display()))?;
    Ok(frames)
}

fn main() -> Result<()> {
    let args = Cli::parse();

    // Initialize tracing if --debug flag is set
    init_tracing(args.debug);

    match args.command {
        Command::Simulate {
            target,
            load,
            repeats,
            precision_ns,
            invocation_ns,
            no_throttle,
            seed,
            format,
        } => {
            let config = ExperimentConfig {
                target_percent: target,
                throttle: !no_throttle,
                precision_ns,
                invocation_ns,
                repeats,
                seed,
            };
            let report = throttle_sim::run_experiment(&config, load)?;
            print_report(&report, target, format)?;
        }
        Command::Demo {
            hops,
            limit,
            format,
            track_all,
            output,
        } => {
            let frames = run_demo(hops, limit, track_all)?;
            if let Some(path) = &output {
                write_wire(path, &frames)?;
            }
            print_frames(&frames, format)?;
        }
        Command::Decode { file, format } => {
            let frames = decode_file(&file)?;
            print_frames(&frames, format)?;
        }
        Command::Config => {
            let config = EngineConfig::from_env()?;
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }

    Ok(())
}
