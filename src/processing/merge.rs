use rayon::prelude::*;

use crate::config::MergePreset;

use super::fragment::{Fragment, FragmentBuffer, FragmentClassifier};

struct BlockStats {
    color: [f32; 3],
    alpha: f32,
    dioptres: f32,
}

/// Whether the fragments of one block pass every merge gate.
fn passes_gates(parts: &[Fragment], preset: &MergePreset) -> Option<BlockStats> {
    if parts.iter().any(|f| (f.blur_radius as f32) < preset.min_blur_radius) {
        return None;
    }
    let n = parts.len() as f32;
    let mut straight = [0.0f32; 3];
    let (mut lum_min, mut lum_max) = (f32::INFINITY, f32::NEG_INFINITY);
    let (mut dpt_min, mut dpt_max) = (f32::INFINITY, f32::NEG_INFINITY);
    for f in parts {
        let c = f.straight_color();
        for ch in 0..3 {
            straight[ch] += c[ch] / n;
        }
        let lum = f.luminance();
        lum_min = lum_min.min(lum);
        lum_max = lum_max.max(lum);
        dpt_min = dpt_min.min(f.dioptres());
        dpt_max = dpt_max.max(f.dioptres());
    }
    if lum_max - lum_min > preset.color_contrast || dpt_max - dpt_min > preset.depth_similarity {
        return None;
    }
    let similar = parts.iter().all(|f| {
        let c = f.straight_color();
        (0..3).all(|ch| (c[ch] - straight[ch]).abs() <= preset.color_similarity)
    });
    if !similar {
        return None;
    }

    let mut stats = BlockStats {
        color: [0.0; 3],
        alpha: 0.0,
        dioptres: 0.0,
    };
    for f in parts {
        for ch in 0..3 {
            stats.color[ch] += f.color[ch] / n;
        }
        stats.alpha += f.alpha / n;
        stats.dioptres += f.dioptres() / n;
    }
    Some(stats)
}

/// Runs one merge pass with `preset.block_size` blocks made of
/// `previous_block` sub-blocks. A block merges per layer only when every
/// sub-block survived the previous pass intact. Returns the number of
/// merged blocks.
pub fn merge_step(
    buffer: &mut FragmentBuffer,
    classifier: &FragmentClassifier<'_>,
    preset: &MergePreset,
    previous_block: u32,
    group_size: usize,
) -> usize {
    let block = preset.block_size;
    let width = buffer.resolution.width;
    let layers = buffer.layers;
    let row_len = (width * layers) as usize;
    let slot = |x: u32, y: u32, layer: u32| (y as usize * row_len) + ((x * layers + layer) as usize);

    buffer
        .fragments
        .par_chunks_mut(block as usize * row_len)
        .with_min_len(group_size.max(1))
        .enumerate()
        .map(|(by, rows)| {
            let mut merged = 0usize;
            let mut parts = Vec::with_capacity(((block / previous_block).pow(2)) as usize);
            for bx in 0..width / block {
                let x0 = bx * block;
                for layer in 0..layers {
                    parts.clear();
                    for sy in (0..block).step_by(previous_block as usize) {
                        for sx in (0..block).step_by(previous_block as usize) {
                            parts.push(rows[slot(x0 + sx, sy, layer)]);
                        }
                    }
                    if parts.iter().any(|f| !f.is_valid() || f.size != previous_block) {
                        continue;
                    }
                    let Some(stats) = passes_gates(&parts, preset) else {
                        continue;
                    };

                    let depth = 1.0 / stats.dioptres.max(1e-6);
                    let centre = (block - 1) as f32 * 0.5;
                    let y0 = by as u32 * block;
                    let c = classifier.classify(x0 as f32 + centre, y0 as f32 + centre, depth);
                    for sy in (0..block).step_by(previous_block as usize) {
                        for sx in (0..block).step_by(previous_block as usize) {
                            rows[slot(x0 + sx, sy, layer)] = Fragment::default();
                        }
                    }
                    rows[slot(x0, 0, layer)] = c.fragment(stats.color, stats.alpha, depth, block, layer);
                    merged += 1;
                }
            }
            merged
        })
        .sum()
}
