//! Compositing effect pipeline: typed effect parameters and full-screen draws.

use std::hash::Hasher;

use xxhash_rust::xxh3::Xxh3;

use crate::error::Result;
use crate::gpu::{DrawCall, EffectUniforms, GpuImage, SharedBackend, Technique, MAX_INPUTS};

/// Typed parameters for one draw. Converted into [`EffectUniforms`].
#[derive(Clone, Debug, PartialEq)]
pub enum Effect {
    Fill {
        color: [f32; 4],
    },
    Flakes {
        color: [f32; 3],
        flakes: f32,
        noise_scale: f32,
    },
    Pattern {
        has_overlay: bool,
    },
    ColorfulPattern {
        palette: [[f32; 4]; 3],
        has_overlay: bool,
    },
    Maps {
        specular: f32,
        gloss: f32,
        reflection: f32,
        /// Forces green to this value instead of reading it from the source.
        fixed_gloss: Option<f32>,
    },
    Tint {
        color: [f32; 3],
        alpha_add: f32,
    },
    Desaturate,
    Combine {
        input: [u32; 4],
        source: [u32; 4],
        adjust: [u32; 4],
    },
    FindLimitsFirstStep,
    FindLimits,
    Normalize,
}

impl Effect {
    pub fn technique(&self) -> Technique {
        match self {
            Effect::Fill { .. } => Technique::Fill,
            Effect::Flakes { .. } => Technique::Flakes,
            Effect::Pattern { .. } => Technique::Pattern,
            Effect::ColorfulPattern { .. } => Technique::ColorfulPattern,
            Effect::Maps {
                fixed_gloss: None, ..
            } => Technique::Maps,
            Effect::Maps {
                fixed_gloss: Some(_),
                ..
            } => Technique::MapsFillGreen,
            Effect::Tint { .. } => Technique::Tint,
            Effect::Desaturate => Technique::Desaturate,
            Effect::Combine { .. } => Technique::Combine,
            Effect::FindLimitsFirstStep => Technique::FindLimitsFirstStep,
            Effect::FindLimits => Technique::FindLimits,
            Effect::Normalize => Technique::Normalize,
        }
    }

    pub fn uniforms(&self) -> EffectUniforms {
        let mut u = EffectUniforms::default();
        match *self {
            Effect::Fill { color } => u.color = color,
            Effect::Flakes {
                color,
                flakes,
                noise_scale,
            } => {
                u.color = [color[0], color[1], color[2], 1.0];
                u.params[0] = flakes;
                u.noise_scale = [noise_scale, noise_scale];
            }
            Effect::Pattern { has_overlay } => u.flags[1] = has_overlay as u32,
            Effect::ColorfulPattern {
                palette,
                has_overlay,
            } => {
                u.palette = palette;
                u.flags[1] = has_overlay as u32;
                u.flags[2] = 1;
            }
            Effect::Maps {
                specular,
                gloss,
                reflection,
                fixed_gloss,
            } => {
                u.multipliers = [specular, gloss, reflection, 1.0];
                u.params[0] = fixed_gloss.unwrap_or(0.0);
            }
            Effect::Tint { color, alpha_add } => {
                u.color = [color[0], color[1], color[2], 1.0];
                u.params[0] = alpha_add;
            }
            Effect::Combine {
                input,
                source,
                adjust,
            } => {
                u.channel_input = input;
                u.channel_source = source;
                u.channel_adjust = adjust;
            }
            Effect::Desaturate
            | Effect::FindLimitsFirstStep
            | Effect::FindLimits
            | Effect::Normalize => {}
        }
        u
    }
}

/// Inputs of one draw, in binding order.
pub type EffectInputs<'a> = [Option<&'a GpuImage>; MAX_INPUTS];

/// Identity of a composite: technique, parameters, input images and size.
pub fn fingerprint(effect: &Effect, inputs: &EffectInputs<'_>, size: (u32, u32)) -> u64 {
    let mut hasher = Xxh3::new();
    hasher.write(effect.technique().entry_point().as_bytes());
    hasher.write(bytemuck::bytes_of(&effect.uniforms()));
    for input in inputs {
        hasher.write_u64(input.map_or(0, |img| img.id().0));
    }
    hasher.write_u32(size.0);
    hasher.write_u32(size.1);
    hasher.finish()
}

/// Runs effects on the render backend. Never mutates its inputs.
#[derive(Debug, Clone)]
pub struct EffectPipeline {
    backend: SharedBackend,
}

impl EffectPipeline {
    pub fn new(backend: SharedBackend) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> &SharedBackend {
        &self.backend
    }

    /// Draw `effect` into an existing target.
    pub fn draw_into(
        &self,
        effect: &Effect,
        inputs: &EffectInputs<'_>,
        target: &GpuImage,
    ) -> Result<()> {
        let uniforms = effect.uniforms();
        self.backend.draw(&DrawCall {
            technique: effect.technique(),
            uniforms: &uniforms,
            inputs: inputs.map(|img| img.map(GpuImage::id)),
            target: target.id(),
        })
    }

    /// Draw `effect` into a fresh target of `size`.
    pub fn draw_new(
        &self,
        effect: &Effect,
        inputs: &EffectInputs<'_>,
        size: (u32, u32),
        label: &str,
    ) -> Result<GpuImage> {
        let target = GpuImage::target(&self.backend, size.0, size.1, label)?;
        self.draw_into(effect, inputs, &target)?;
        Ok(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::CpuBackend;
    use std::sync::Arc;

    #[test]
    fn test_maps_variant_by_fixed_gloss() {
        let maps = Effect::Maps {
            specular: 1.0,
            gloss: 0.5,
            reflection: 1.0,
            fixed_gloss: None,
        };
        assert_eq!(maps.technique(), Technique::Maps);
        let fixed = Effect::Maps {
            specular: 1.0,
            gloss: 0.5,
            reflection: 1.0,
            fixed_gloss: Some(0.8),
        };
        assert_eq!(fixed.technique(), Technique::MapsFillGreen);
        assert_eq!(fixed.uniforms().params[0], 0.8);
    }

    #[test]
    fn test_fingerprint_tracks_params_inputs_and_size() {
        let backend: SharedBackend = Arc::new(CpuBackend::new());
        let img = GpuImage::upload(&backend, &image::RgbaImage::new(2, 2), "in").unwrap();
        let fill = Effect::Fill {
            color: [1.0, 0.0, 0.0, 1.0],
        };
        let base = fingerprint(&fill, &[None; 4], (4, 4));
        assert_eq!(base, fingerprint(&fill.clone(), &[None; 4], (4, 4)));
        assert_ne!(base, fingerprint(&fill, &[None; 4], (8, 4)));
        assert_ne!(base, fingerprint(&fill, &[Some(&img), None, None, None], (4, 4)));
        let blue = Effect::Fill {
            color: [0.0, 0.0, 1.0, 1.0],
        };
        assert_ne!(base, fingerprint(&blue, &[None; 4], (4, 4)));
    }

    #[test]
    fn test_draw_new_fill() {
        let backend: SharedBackend = Arc::new(CpuBackend::new());
        let pipeline = EffectPipeline::new(backend.clone());
        let out = pipeline
            .draw_new(
                &Effect::Fill {
                    color: [0.0, 1.0, 0.0, 1.0],
                },
                &[None; 4],
                (2, 2),
                "fill",
            )
            .unwrap();
        let pixels = out.read_pixels().unwrap();
        assert!(pixels.pixels().all(|p| p.0 == [0, 255, 0, 255]));
        assert_eq!(backend.stats().draws, 1);
    }
}
