use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Parser;
use color_eyre::eyre::{Result, WrapErr};
use futures_util::future::join_all;
use image::ImageFormat;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use imagecache::domain::{LoadedImage, TargetSize};
use imagecache::infrastructure::{
    AppConfig, CliArgs, Command, ConfigOrigin, ConfigStore, DiskImageCache, HttpImageFetcher,
    ImageLoader,
};

fn init_logging(config: &AppConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.to_string()));

    if let Some(log_path) = config.effective_log_path() {
        if let Some(parent) = log_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)?;

        let file_layer = fmt::layer()
            .with_writer(file)
            .with_ansi(false)
            .with_target(true)
            .with_thread_ids(false);

        tracing_subscriber::registry()
            .with(filter)
            .with(file_layer)
            .init();

        info!(path = %log_path.display(), "Logging initialized");
    } else {
        tracing_subscriber::registry().with(filter).init();
    }

    Ok(())
}

fn load_config(args: &CliArgs) -> Result<(AppConfig, ConfigOrigin)> {
    let store = ConfigStore::new()?;
    let (mut config, origin) = store.load_config(args.config.as_deref())?;
    config.merge_with_args(args);
    Ok((config, origin))
}

async fn create_loader(config: &AppConfig) -> Result<ImageLoader> {
    let cache_dir = config.cache.effective_directory();
    let disk_cache = DiskImageCache::new(cache_dir.clone())
        .await
        .wrap_err_with(|| format!("failed to open disk cache at {}", cache_dir.display()))?;

    let fetcher = HttpImageFetcher::new(
        config.network.timeout(),
        config.network.max_connections_per_host,
        &config.network.user_agent,
    )?;

    // The CLI awaits every load directly, so completion events are not consumed.
    let (event_tx, _event_rx) = mpsc::unbounded_channel();

    Ok(ImageLoader::new(
        config.cache.loader_config(),
        &event_tx,
        Arc::new(fetcher),
        Arc::new(disk_cache),
    ))
}

async fn save_png(image: &LoadedImage, dir: &Path) -> Result<PathBuf> {
    let path = dir.join(image.key.file_name()).with_extension("png");
    let decoded = Arc::clone(&image.image);
    let target = path.clone();
    tokio::task::spawn_blocking(move || decoded.save_with_format(&target, ImageFormat::Png))
        .await??;
    Ok(path)
}

async fn fetch(
    loader: &ImageLoader,
    urls: &[String],
    target: TargetSize,
    output: Option<&Path>,
) -> Result<()> {
    if let Some(dir) = output {
        tokio::fs::create_dir_all(dir).await?;
    }

    let results = join_all(urls.iter().map(|url| loader.load(url, target))).await;

    let mut failures = 0usize;
    for (url, result) in urls.iter().zip(results) {
        match result {
            Ok(loaded) => {
                println!(
                    "{url}: {}x{} from {}",
                    loaded.image.width(),
                    loaded.image.height(),
                    loaded.source
                );
                if let Some(dir) = output {
                    let path = save_png(&loaded, dir).await?;
                    println!("  saved {}", path.display());
                }
            }
            Err(e) => {
                failures += 1;
                warn!(url = %url, error = %e, "Image load failed");
                eprintln!("{url}: {e}");
            }
        }
    }

    let stats = loader.coordinator_stats();
    info!(
        total = stats.total_requests,
        coalesced = stats.coalesced_requests,
        failures,
        "Fetch finished"
    );

    if failures > 0 {
        color_eyre::eyre::bail!("{failures} of {} images failed to load", urls.len());
    }
    Ok(())
}

fn print_stats(loader: &ImageLoader) {
    let disk = loader.disk_cache();
    println!("Cache directory: {}", disk.dir().display());
    println!("Entries: {}", disk.len());
    println!("Size: {} bytes", disk.current_size());
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let args = CliArgs::parse();
    let (config, origin) = load_config(&args)?;

    init_logging(&config)?;

    info!(version = imagecache::VERSION, "Starting imagecache");
    origin.log();

    let loader = create_loader(&config).await?;

    match args.command {
        Command::Fetch {
            urls,
            width,
            height,
            scale,
            output,
        } => {
            let target = TargetSize::new(width, height, scale);
            fetch(&loader, &urls, target, output.as_deref()).await
        }
        Command::Clear => {
            loader.clear_all().await;
            println!("Cleared {}", loader.disk_cache().dir().display());
            Ok(())
        }
        Command::Stats => {
            print_stats(&loader);
            Ok(())
        }
    }
}
