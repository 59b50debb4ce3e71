use super::app_config::LogLevel;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Command line arguments.
#[derive(Debug, Parser)]
#[command(
    name = "imagecache",
    version,
    about = "Fetch images through a memory and disk cache",
    long_about = None
)]
pub struct CliArgs {
    /// Configuration file path.
    #[arg(short, long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Log file path.
    #[arg(long, value_name = "PATH")]
    pub log_path: Option<PathBuf>,

    /// Log verbosity level.
    #[arg(long, value_enum)]
    pub log_level: Option<LogLevel>,

    /// Disk cache directory.
    #[arg(long, value_name = "DIR", env = "IMAGECACHE_DIR")]
    pub cache_dir: Option<PathBuf>,

    /// Action to perform.
    #[command(subcommand)]
    pub command: Command,
}

/// CLI subcommands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Load images, downsampled to the given display size.
    Fetch {
        /// Image URLs.
        #[arg(required = true)]
        urls: Vec<String>,

        /// Display width in points.
        #[arg(long, default_value_t = 400.0)]
        width: f32,

        /// Display height in points.
        #[arg(long, default_value_t = 300.0)]
        height: f32,

        /// Pixels per point.
        #[arg(long, default_value_t = 2.0)]
        scale: f32,

        /// Directory to write the decoded images to, as PNG.
        #[arg(short, long, value_name = "DIR")]
        output: Option<PathBuf>,
    },
    /// Delete every entry in the disk cache.
    Clear,
    /// Show disk cache location and usage.
    Stats,
}
