use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use image::DynamicImage;
use splatblur::processing::psf::stack::{JsonProvider, ThinLensProvider};
use splatblur::processing::psf::PsfAxes;
use splatblur::processing::{Camera, LayeredFrame, Resolution};
use splatblur::{BlurConfig, FrameStatus, TiledSplatBlur};

const USAGE: &str = "usage: splatblur <color> <depth> <output> [--near m] [--far m] [--fovy deg] \
                     [--aperture mm] [--focus m] [--psf stack.json] [--config path]";
const CONFIG_ENV: &str = "SPLATBLUR_CONFIG";
const PSF_TIMEOUT: Duration = Duration::from_secs(60);
const THIN_LENS_SAMPLES: usize = 9;
const DEFOCUS_SAMPLES: usize = 16;

#[derive(Debug, Clone, PartialEq)]
struct Args {
    color: PathBuf,
    depth: PathBuf,
    output: PathBuf,
    near: f32,
    far: f32,
    fovy: f32,
    aperture: f32,
    focus: f32,
    psf: Option<PathBuf>,
    config: Option<PathBuf>,
}

fn parse_args(mut args: impl Iterator<Item = String>) -> Result<Args> {
    let mut positional = Vec::new();
    let camera = Camera::default();
    let mut parsed = Args {
        color: PathBuf::new(),
        depth: PathBuf::new(),
        output: PathBuf::new(),
        near: 0.5,
        far: 20.0,
        fovy: camera.fovy_deg,
        aperture: camera.aperture_mm,
        focus: camera.focus_distance_m,
        psf: None,
        config: None,
    };
    while let Some(arg) = args.next() {
        let Some(flag) = arg.strip_prefix("--") else {
            positional.push(PathBuf::from(arg));
            continue;
        };
        let value = args.next().with_context(|| format!("--{flag} needs a value\n{USAGE}"))?;
        let number = || {
            value
                .parse::<f32>()
                .with_context(|| format!("--{flag}: not a number: {value}"))
        };
        match flag {
            "near" => parsed.near = number()?,
            "far" => parsed.far = number()?,
            "fovy" => parsed.fovy = number()?,
            "aperture" => parsed.aperture = number()?,
            "focus" => parsed.focus = number()?,
            "psf" => parsed.psf = Some(PathBuf::from(&value)),
            "config" => parsed.config = Some(PathBuf::from(&value)),
            _ => anyhow::bail!("unknown flag --{flag}\n{USAGE}"),
        }
    }
    let [color, depth, output]: [PathBuf; 3] = positional
        .try_into()
        .map_err(|_| anyhow::anyhow!("{USAGE}"))?;
    parsed.color = color;
    parsed.depth = depth;
    parsed.output = output;
    if parsed.near <= 0.0 || parsed.far <= parsed.near {
        anyhow::bail!("need 0 < near < far, got {} and {}", parsed.near, parsed.far);
    }
    Ok(parsed)
}

fn resolve_config(explicit: Option<&Path>) -> Result<BlurConfig> {
    if let Some(path) = explicit {
        return BlurConfig::load_from(path);
    }
    if let Ok(raw) = std::env::var(CONFIG_ENV) {
        return BlurConfig::load_from(Path::new(raw.trim()));
    }
    Ok(BlurConfig::load())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = parse_args(std::env::args().skip(1))?;
    let mut config = resolve_config(args.config.as_deref())?;

    let color = image::open(&args.color)
        .with_context(|| format!("open color image {}", args.color.display()))?
        .to_rgba32f();
    let depth = image::open(&args.depth)
        .with_context(|| format!("open depth image {}", args.depth.display()))?
        .to_luma32f();
    let frame = LayeredFrame::from_images(&color, &depth, args.near, args.far)?;

    let resolution = frame.resolution;
    if !resolution.fits_within(config.max_resolution) {
        eprintln!("splatblur: raising max resolution to {resolution}");
        config.max_resolution = Resolution::new(
            resolution.width.max(config.max_resolution.width),
            resolution.height.max(config.max_resolution.height),
        );
    }

    let camera = Camera {
        fovy_deg: args.fovy,
        aperture_mm: args.aperture,
        focus_distance_m: args.focus,
        ..Camera::default()
    };

    let mut blur = TiledSplatBlur::new(config)?;
    match &args.psf {
        Some(path) => blur.request_psf_stack(JsonProvider { path: path.clone() }),
        None => blur.request_psf_stack(ThinLensProvider {
            axes: PsfAxes::for_depth_range(args.near, args.far, args.aperture, DEFOCUS_SAMPLES),
            samples: THIN_LENS_SAMPLES,
        }),
    }

    let t0 = Instant::now();
    let output = loop {
        let output = blur.render(&frame, &camera)?;
        if output.status == FrameStatus::Blurred {
            break output;
        }
        if t0.elapsed() > PSF_TIMEOUT {
            anyhow::bail!("PSF stack was not ready after {:?}", PSF_TIMEOUT);
        }
        std::thread::sleep(Duration::from_millis(10));
    };

    let stats = &output.stats;
    eprintln!(
        "splatblur: {} fragments, {} tile entries ({} dropped), max tile list {}, {} sort passes, {:.1} ms",
        stats.fragments,
        stats.tile_entries,
        stats.overflowed,
        stats.max_tile_count,
        stats.sort_passes,
        t0.elapsed().as_secs_f64() * 1000.0
    );
    for (name, bytes) in blur.buffer_sizes() {
        tracing::debug!(buffer = name, bytes, "buffer size");
    }

    DynamicImage::ImageRgba32F(output.image)
        .to_rgba8()
        .save(&args.output)
        .with_context(|| format!("write {}", args.output.display()))?;
    Ok(())
}
