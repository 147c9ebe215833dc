//! CLI argument parsing for Hilvan

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// Output format for traces and reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text format (default)
    Text,
    /// JSON format for machine parsing
    Json,
}

#[derive(Parser, Debug)]
#[command(name = "hilvan")]
#[command(version)]
#[command(about = "Async stack trace correlation with a self-throttling overhead governor", long_about = None)]
pub struct Cli {
    /// Enable debug tracing output (logs to stderr)
    #[arg(long = "debug", global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a leaky-bucket experiment on a simulated clock
    Simulate {
        /// Overhead target in percent
        #[arg(long = "target", value_name = "PCT", default_value = "1.0")]
        target: f64,

        /// Share of the work spent in governed operations, in percent
        #[arg(long = "load", value_name = "PCT")]
        load: f64,

        /// Number of simulated cycles
        #[arg(long = "repeats", value_name = "N", default_value = "5000")]
        repeats: u64,

        /// Clock granularity in nanoseconds (0 for an exact clock)
        #[arg(long = "precision-ns", value_name = "NS", default_value = "10000")]
        precision_ns: u64,

        /// Mean duration of a governed operation in nanoseconds
        #[arg(long = "invocation-ns", value_name = "NS", default_value = "16000")]
        invocation_ns: u64,

        /// Only detect overhead, never skip operations
        #[arg(long = "no-throttle")]
        no_throttle: bool,

        /// Seed of the invocation noise
        #[arg(long = "seed", default_value = "42")]
        seed: u64,

        /// Output format (text or json)
        #[arg(long = "format", value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// Hop work across threads and print the reconstructed async trace
    Demo {
        /// Number of thread hops
        #[arg(long = "hops", value_name = "N", default_value = "3")]
        hops: usize,

        /// Maximum number of frames to reconstruct
        #[arg(long = "limit", value_name = "FRAMES", default_value = "256")]
        limit: usize,

        /// Output format (text or json)
        #[arg(long = "format", value_enum, default_value = "text")]
        format: OutputFormat,

        /// Register every worker so traces can be read from other threads
        #[arg(long = "track-all")]
        track_all: bool,

        /// Write the wire encoding of the trace to FILE
        #[arg(short = 'o', long = "output", value_name = "FILE")]
        output: Option<PathBuf>,
    },

    /// Decode a wire-encoded trace and print its frames
    Decode {
        /// File holding the encoded frames
        #[arg(value_name = "FILE")]
        file: PathBuf,

        /// Output format (text or json)
        #[arg(long = "format", value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// Print the effective configuration read from the environment
    Config,
}
