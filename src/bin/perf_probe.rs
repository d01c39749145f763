use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use image::{ImageBuffer, Rgba};

#[path = "../error.rs"]
mod error;
#[path = "../geometry.rs"]
mod geometry;
#[path = "../loader.rs"]
mod loader;
#[path = "../processing/mod.rs"]
mod processing;
#[path = "../state.rs"]
mod state;

use geometry::{Point, Quad};
use processing::{gpu_pipeline, pool::WarpDispatcher, warp};
use state::{RequestId, ResultSpec, SourceImage, WarpRequest};

const SYNTHETIC_W: u32 = 4000;
const SYNTHETIC_H: u32 = 3000;
const RESULT_SIZE: u32 = 1024;

fn median_ms(samples: &[f64]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    let mut sorted = samples.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) * 0.5
    } else {
        sorted[mid]
    }
}

fn synthetic_source() -> Result<SourceImage> {
    let img = ImageBuffer::from_fn(SYNTHETIC_W, SYNTHETIC_H, |x, y| {
        Rgba([(x % 256) as u8, (y % 256) as u8, ((x ^ y) % 256) as u8, 255])
    });
    Ok(SourceImage::new(img)?)
}

/// Slightly skewed quad so every row takes a different path through the source.
fn probe_quad(w: u32, h: u32, jitter: f64) -> Quad {
    let (wf, hf) = (w as f64, h as f64);
    Quad::new(
        Point::new(wf * 0.12 + jitter, hf * 0.10),
        Point::new(wf * 0.86, hf * 0.14 + jitter),
        Point::new(wf * 0.90 - jitter, hf * 0.88),
        Point::new(wf * 0.08, hf * 0.92 - jitter),
    )
}

fn time_ms<T>(f: impl FnOnce() -> Result<T>) -> Result<f64> {
    let t0 = Instant::now();
    f()?;
    Ok(t0.elapsed().as_secs_f64() * 1000.0)
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let mut args = std::env::args();
    let _bin = args.next();
    let input = args.next().map(PathBuf::from);
    let count = args
        .next()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(20)
        .max(1);

    let source = match &input {
        Some(path) => loader::load_source(path)
            .with_context(|| format!("probe input failed for {}", path.display()))?,
        None => synthetic_source()?,
    };
    let source = Arc::new(source);
    let (w, h) = (source.width(), source.height());
    let result = ResultSpec::new(RESULT_SIZE, RESULT_SIZE)?;
    eprintln!(
        "Probing {}x{} source -> {}x{} result, {} iterations",
        w, h, result.width, result.height, count
    );

    let mut cpu_samples = Vec::with_capacity(count);
    let mut parallel_samples = Vec::with_capacity(count);
    for i in 0..count {
        let quad = probe_quad(w, h, i as f64);
        cpu_samples.push(time_ms(|| Ok(warp::warp(&source, &quad, result)?))?);
        parallel_samples.push(time_ms(|| Ok(warp::warp_parallel(&source, &quad, result)?))?);
    }

    let dispatcher = WarpDispatcher::new(processing::pool::DEFAULT_POOL_SIZE)?;
    let dispatch_start = Instant::now();
    let pending = (0..count)
        .map(|i| {
            dispatcher.submit(WarpRequest {
                id: RequestId(i as u64),
                quad: probe_quad(w, h, i as f64),
                result,
                source: Arc::clone(&source),
            })
        })
        .collect::<Result<Vec<_>, _>>()?;
    for job in pending {
        job.wait()?;
    }
    let dispatch_wall_s = dispatch_start.elapsed().as_secs_f64();
    drop(dispatcher);

    let status = gpu_pipeline::runtime_status();
    let mut gpu_samples = Vec::new();
    if status.available {
        let mut pipeline = gpu_pipeline::GpuWarpPipeline::new(&source, result)?;
        for i in 0..count {
            let quad = probe_quad(w, h, i as f64);
            gpu_samples.push(time_ms(|| Ok(pipeline.render(&quad)?))?);
        }
    }

    let mpix = result.pixel_count() as f64 / 1_000_000.0;
    println!("METRIC source={}x{}", w, h);
    println!("METRIC result={}x{}", result.width, result.height);
    println!("METRIC cpu_warp_ms_median={:.2}", median_ms(&cpu_samples));
    println!(
        "METRIC parallel_warp_ms_median={:.2}",
        median_ms(&parallel_samples)
    );
    println!(
        "METRIC parallel_mpix_per_sec={:.1}",
        mpix / (median_ms(&parallel_samples) / 1000.0).max(1e-9)
    );
    println!("METRIC dispatcher_wall_s={:.3}", dispatch_wall_s);
    println!(
        "METRIC dispatcher_requests_per_sec={:.2}",
        count as f64 / dispatch_wall_s.max(1e-9)
    );
    println!("METRIC gpu_available={}", status.available);
    if let Some(name) = status.adapter_name.as_deref() {
        println!("METRIC gpu_adapter={}", name);
    }
    if !gpu_samples.is_empty() {
        println!("METRIC gpu_draw_ms_median={:.2}", median_ms(&gpu_samples));
    }

    Ok(())
}
