//! jxl-pool CLI - decode JPEG XL files and URLs through a bounded pool of decoders

use anyhow::{Context, Result};
use clap::Parser;
use jxl_pool::{EncodedImage, JxlEngineFactory, PoolConfig, RenderOverride, Session, Source, WorkerPool};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::time::Instant;

#[derive(Parser)]
#[command(name = "jxl-pool")]
#[command(about = "Decode JPEG XL images to PNG through a pool of reusable decoders", long_about = None)]
#[command(version)]
struct Cli {
    /// Maximum number of concurrently active decode sessions [default: 8]
    #[arg(short, long, env = "JXL_POOL_WORKERS")]
    workers: Option<NonZeroUsize>,

    /// Decode in this many growing prefixes of each file, writing a preview per step
    #[arg(short, long, default_value_t = 1)]
    steps: usize,

    /// Always render 8-bit sRGB, even for high bit depth images
    #[arg(long)]
    force_srgb: bool,

    /// Directory for rendered PNGs
    #[arg(short, long, default_value = ".")]
    out_dir: PathBuf,

    /// Print the decoder version and exit
    #[arg(long)]
    engine_version: bool,

    /// Input files or http(s) URLs
    #[arg(required_unless_present = "engine_version")]
    inputs: Vec<String>,
}

fn main() -> Result<()> {
    env_logger::init();

    let cli = Cli::parse();
    smol::block_on(run(cli))
}

async fn run(cli: Cli) -> Result<()> {
    let config = cli.workers.map(PoolConfig::with_capacity).unwrap_or_default();
    let pool = WorkerPool::new(JxlEngineFactory, config);

    if cli.engine_version {
        println!("{}", pool.version().await);
        return Ok(());
    }

    std::fs::create_dir_all(&cli.out_dir)
        .with_context(|| format!("Failed to create output directory {:?}", cli.out_dir))?;

    let render_override = cli.force_srgb.then_some(RenderOverride { force_srgb: true });
    let steps = cli.steps.max(1);
    let start = Instant::now();

    let tasks: Vec<_> = cli
        .inputs
        .iter()
        .map(|input| {
            let pool = pool.clone();
            let source = Source::parse(input);
            let out_dir = cli.out_dir.clone();
            smol::spawn(async move {
                let label = source.to_string();
                let result = decode_source(&pool, source, steps, render_override, &out_dir).await;
                (label, result)
            })
        })
        .collect();

    let total = tasks.len();
    let mut failures = 0;
    for task in tasks {
        let (label, result) = task.await;
        match result {
            Ok(written) => {
                for path in written {
                    println!("{}", path.display());
                }
            }
            Err(e) => {
                log::error!("Failed to decode {}: {:#}", label, e);
                failures += 1;
            }
        }
    }

    log::info!("Processed {} input(s) in {:?}", total, start.elapsed());
    if failures > 0 {
        anyhow::bail!("{} of {} input(s) failed", failures, total);
    }
    Ok(())
}

/// Run one input on a pooled session, always handing the session back
async fn decode_source(
    pool: &WorkerPool<JxlEngineFactory>,
    source: Source,
    steps: usize,
    render_override: Option<RenderOverride>,
    out_dir: &Path,
) -> Result<Vec<PathBuf>> {
    let session = pool.acquire().await;
    let result = decode_steps(&session, source, steps, render_override, out_dir).await;
    pool.release(session);
    result
}

async fn decode_steps(
    session: &Session<JxlEngineFactory>,
    source: Source,
    steps: usize,
    render_override: Option<RenderOverride>,
    out_dir: &Path,
) -> Result<Vec<PathBuf>> {
    let total = session.load(source).await?;
    let mut written = Vec::new();

    for step in 1..=steps {
        let threshold = total * step / steps;
        match session.decode(Some(threshold), render_override).await {
            Ok(image) => {
                let path = out_dir.join(output_name(&image));
                let data = image.data;
                let target = path.clone();
                smol::unblock(move || std::fs::write(target, data))
                    .await
                    .with_context(|| format!("Failed to write {:?}", path))?;
                log::info!("Step {}/{}: wrote {}x{} to {:?}", step, steps, image.width, image.height, path);
                written.push(path);
            }
            Err(e) if e.is_partial() => {
                log::info!("Step {}/{}: {}", step, steps, e);
            }
            Err(e) if e.is_cancelled() => {}
            Err(e) => {
                return Err(e).with_context(|| format!("decode at {} of {} bytes", threshold, total));
            }
        }
    }

    if written.is_empty() {
        anyhow::bail!("no frame could be decoded from {} bytes", total);
    }
    Ok(written)
}

/// `<name>.rendered.png` for complete decodes, with the fed percentage for previews
fn output_name(image: &EncodedImage) -> String {
    if image.is_complete() {
        return image.file_name.clone();
    }
    let percent = image.bytes_fed * 100 / image.total_bytes.max(1);
    let stem = image.file_name.trim_end_matches(".png");
    format!("{}.{:02}pct.png", stem, percent)
}
