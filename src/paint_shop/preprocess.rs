//! Channel / adjustment preprocessing: channel combine, desaturate and
//! auto-normalize, all built from pipeline effects.

use crate::error::Result;
use crate::gpu::{GpuImage, LIMITS_BLOCK};

use super::effects::{Effect, EffectPipeline};
use super::recipe::{ChannelSource, TextureRecipe};

/// Recombine `primary` and resolved `layers` per the recipe's channel
/// mapping and value adjustments. Unmapped channels read the primary image.
/// Output has the primary's size.
pub fn combine(
    pipeline: &EffectPipeline,
    recipe: &TextureRecipe,
    primary: &GpuImage,
    layers: &[GpuImage],
) -> Result<GpuImage> {
    let mut input = [0u32; 4];
    let mut source = [0u32, 1, 2, 3];
    for (ch, mapping) in recipe.channels.iter().enumerate() {
        match mapping {
            None => {}
            Some(ChannelSource::Primary(c)) => source[ch] = c.index() as u32,
            Some(ChannelSource::Layer { layer, channel }) => {
                input[ch] = *layer as u32 + 1;
                source[ch] = channel.index() as u32;
            }
        }
    }
    let adjust = recipe.adjust.map(|a| a as u32);

    let mut inputs = [Some(primary), None, None, None];
    for (i, layer) in layers.iter().enumerate().take(3) {
        inputs[i + 1] = Some(layer);
    }
    pipeline.draw_new(
        &Effect::Combine {
            input,
            source,
            adjust,
        },
        &inputs,
        primary.size(),
        "combine",
    )
}

/// Rec. 709 luminance in RGB, alpha kept.
pub fn desaturate(pipeline: &EffectPipeline, image: &GpuImage) -> Result<GpuImage> {
    pipeline.draw_new(&Effect::Desaturate, &[Some(image), None, None, None], image.size(), "desaturate")
}

#[inline]
fn reduce(v: u32) -> u32 {
    ((v + LIMITS_BLOCK - 1) / LIMITS_BLOCK).max(1)
}

/// Per-channel min/max of `image` as a 2×1 image (min left, max right).
/// Returns `None` for a 1×1 source.
pub fn find_limits(pipeline: &EffectPipeline, image: &GpuImage) -> Result<Option<GpuImage>> {
    let (w, h) = image.size();
    if (w, h) == (1, 1) {
        return Ok(None);
    }
    let (mut lw, mut lh) = (reduce(w), reduce(h));
    let mut limits = pipeline.draw_new(
        &Effect::FindLimitsFirstStep,
        &[Some(image), None, None, None],
        (lw * 2, lh),
        "find_limits_first",
    )?;
    while (lw, lh) != (1, 1) {
        lw = reduce(lw);
        lh = reduce(lh);
        limits = pipeline.draw_new(
            &Effect::FindLimits,
            &[Some(&limits), None, None, None],
            (lw * 2, lh),
            "find_limits",
        )?;
    }
    Ok(Some(limits))
}

/// Map every channel's `[min, max]` to `[0, 1]`. Flat channels pass through;
/// a 1×1 image is returned as is.
pub fn normalize(pipeline: &EffectPipeline, image: &GpuImage) -> Result<GpuImage> {
    let Some(limits) = find_limits(pipeline, image)? else {
        return Ok(image.clone());
    };
    pipeline.draw_new(
        &Effect::Normalize,
        &[Some(image), Some(&limits), None, None],
        image.size(),
        "normalize",
    )
}

/// Apply the recipe's preparation flags (desaturate first, then normalize).
pub fn prepare(pipeline: &EffectPipeline, recipe: &TextureRecipe, image: &GpuImage) -> Result<GpuImage> {
    let mut out = image.clone();
    if recipe.desaturate {
        out = desaturate(pipeline, &out)?;
    }
    if recipe.normalize {
        out = normalize(pipeline, &out)?;
    }
    Ok(out)
}
