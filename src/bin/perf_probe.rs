use std::time::Instant;

use anyhow::{Context, Result};
use splatblur::processing::psf::PsfAxes;
use splatblur::processing::psf::stack::PsfStack;
use splatblur::processing::{Camera, FrameLayer, LayeredFrame, Resolution};
use splatblur::{BlurConfig, FrameStatus, TiledSplatBlur};

const NEAR_M: f32 = 0.5;
const FAR_M: f32 = 20.0;
const THIN_LENS_SAMPLES: usize = 9;

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

fn parse_size(value: &str) -> Option<Resolution> {
    let (w, h) = value.split_once('x')?;
    Some(Resolution::new(w.parse().ok()?, h.parse().ok()?))
}

/// Checkerboard on a depth ramp: near at the top, far at the bottom.
fn build_frame(resolution: Resolution) -> Result<LayeredFrame> {
    let Resolution { width, height } = resolution;
    let mut layer = FrameLayer::filled(resolution, [0.0; 4], FAR_M);
    for y in 0..height {
        let t = y as f32 / height.max(2).saturating_sub(1) as f32;
        for x in 0..width {
            let i = (y * width + x) as usize;
            let check = ((x / 16) + (y / 16)) % 2 == 0;
            layer.color[i] = if check {
                [0.9, 0.8, 0.2, 1.0]
            } else {
                [0.1, 0.2, 0.6, 1.0]
            };
            layer.depth[i] = NEAR_M + t * (FAR_M - NEAR_M);
        }
    }
    Ok(LayeredFrame::new(resolution, vec![layer])?)
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let mut args = std::env::args();
    let _bin = args.next();
    let mut size = None;
    let mut frames = 10usize;
    let mut config = BlurConfig::default();
    while let Some(flag) = args.next() {
        let value = args
            .next()
            .with_context(|| format!("{flag} needs a value"))
            .context("usage: perf_probe --size WxH --frames N [--tile t] [--coc c]")?;
        match flag.as_str() {
            "--size" => size = Some(parse_size(&value).context("--size must look like 1280x720")?),
            "--frames" => frames = value.parse().context("--frames must be a number")?,
            "--tile" => config.tile_size = value.parse().context("--tile must be a number")?,
            "--coc" => config.max_coc = value.parse().context("--coc must be a number")?,
            _ => anyhow::bail!("unknown flag {flag}"),
        }
    }
    let resolution = size.context("usage: perf_probe --size WxH --frames N [--tile t] [--coc c]")?;
    config.max_resolution = resolution;
    config.max_layers = 1;

    let frame = build_frame(resolution)?;
    let mut camera = Camera::default();
    let mut blur = TiledSplatBlur::new(config)?;

    let t0 = Instant::now();
    let axes = PsfAxes::for_depth_range(NEAR_M, FAR_M, camera.aperture_mm, 16);
    blur.set_psf_stack(PsfStack::thin_lens(axes, THIN_LENS_SAMPLES))?;
    let psf_setup_ms = t0.elapsed().as_secs_f64() * 1000.0;

    let mut frame_samples = Vec::with_capacity(frames);
    let mut last = None;
    for i in 0..frames {
        // sweep focus so every frame rebuilds its PSF texture
        camera.focus_distance_m = NEAR_M + (FAR_M - NEAR_M) * (i as f32 + 0.5) / frames.max(1) as f32;
        let t0 = Instant::now();
        let output = blur.render(&frame, &camera)?;
        frame_samples.push(t0.elapsed().as_secs_f64() * 1000.0);
        if output.status != FrameStatus::Blurred {
            anyhow::bail!("frame {i} was not blurred");
        }
        last = Some(output.stats);
    }
    let stats = last.unwrap_or_default();
    let buffer_mb =
        blur.buffer_sizes().iter().map(|(_, b)| *b).sum::<usize>() as f64 / (1024.0 * 1024.0);

    println!("METRIC resolution={resolution}");
    println!("METRIC frames={frames}");
    println!("METRIC psf_setup_ms={:.2}", psf_setup_ms);
    println!("METRIC frame_ms_median={:.2}", median_ms(&frame_samples));
    println!("METRIC fragments={}", stats.fragments);
    println!("METRIC tile_entries={}", stats.tile_entries);
    println!("METRIC overflowed_total={}", stats.total_overflowed);
    println!("METRIC max_tile_count={}", stats.max_tile_count);
    println!("METRIC sort_passes={}", stats.sort_passes);
    println!("METRIC buffer_mb={:.2}", buffer_mb);

    Ok(())
}
