#![cfg(not(target_arch = "wasm32"))]
//! `livery-bake`: load a car, run one paint operation, write the result.

use std::backtrace::Backtrace;
use std::fs::File;
use std::io::Write;
use std::panic;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use log::{error, info, warn, LevelFilter};
use tokio_util::sync::CancellationToken;

use livery_engine::car::{CarSlot, GltfContainerReader};
use livery_engine::paint_shop::{
    ColorfulPatternRequest, FlakesRequest, MapsRequest, PatternRequest, TintRequest,
};
use livery_engine::{CpuBackend, EngineConfig, LiveryEngine, SharedBackend, TextureRecipe, WgpuBackend};

#[derive(Parser, Debug)]
#[command(name = "livery-bake")]
#[command(about = "Bake a car paint job to an image file")]
struct Cli {
    /// Use the CPU reference backend instead of a GPU.
    #[arg(long)]
    cpu: bool,

    /// JSON engine configuration.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Directory holding `<car>.glb` / `<car>.gltf` and `skins/`.
    #[arg(long, default_value = ".")]
    models: PathBuf,

    /// Car to load before painting. Needed for `slot` and `named:` sources.
    #[arg(long)]
    car: Option<String>,

    #[arg(long)]
    skin: Option<String>,

    /// Material slot read by `slot` sources.
    #[arg(long, default_value = "base_color")]
    slot: String,

    /// Output file; the extension picks the format.
    #[arg(short, long)]
    output: PathBuf,

    /// Output size as WxH. Defaults to the source's original size.
    #[arg(long)]
    size: Option<Size>,

    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    op: Op,
}

/// Sources: `slot`, `named:<texture>`, `file:<path>`, `#rrggbb[aa]`, each
/// optionally followed by `+desaturate` / `+normalize`.
#[derive(Subcommand, Debug)]
enum Op {
    Texture {
        source: Source,
    },
    Color {
        color: Color,
    },
    Flakes {
        color: Color,
        #[arg(long, default_value_t = 0.5)]
        amount: f32,
    },
    Pattern {
        pattern: Source,
        #[arg(long)]
        ao: Option<Source>,
        #[arg(long)]
        overlay: Option<Source>,
    },
    ColorfulPattern {
        pattern: Source,
        #[arg(long)]
        ao: Option<Source>,
        #[arg(long)]
        overlay: Option<Source>,
        #[arg(long)]
        mask: Option<Source>,
        /// Up to three palette colors.
        #[arg(long = "color")]
        colors: Vec<Color>,
    },
    Maps {
        source: Source,
        #[arg(long, default_value_t = 1.0)]
        specular: f32,
        #[arg(long, default_value_t = 1.0)]
        gloss: f32,
        #[arg(long, default_value_t = 1.0)]
        reflection: f32,
        #[arg(long)]
        fixed_gloss: Option<f32>,
    },
    Tint {
        source: Source,
        color: Color,
        #[arg(long, default_value_t = 0.0)]
        alpha_add: f32,
    },
}

// ---------- argument types ----------

#[derive(Clone, Copy, Debug)]
struct Size(u32, u32);

impl FromStr for Size {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (w, h) = s.split_once('x').ok_or("expected WxH")?;
        let parse = |v: &str| v.trim().parse::<u32>().map_err(|e| format!("`{v}`: {e}"));
        let (w, h) = (parse(w)?, parse(h)?);
        if w == 0 || h == 0 {
            return Err("size must be non-zero".into());
        }
        Ok(Size(w, h))
    }
}

/// `r,g,b[,a]` in 0..1, or `#rrggbb[aa]`.
#[derive(Clone, Copy, Debug)]
struct Color([f32; 4]);

impl FromStr for Color {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(hex) = s.strip_prefix('#') {
            let rgba = parse_hex(hex)?;
            return Ok(Color(livery_engine::texture::rgba8_to_color(rgba)));
        }
        let parts = s
            .split(',')
            .map(|v| v.trim().parse::<f32>().map_err(|e| format!("`{v}`: {e}")))
            .collect::<Result<Vec<_>, _>>()?;
        match parts.as_slice() {
            [r, g, b] => Ok(Color([*r, *g, *b, 1.0])),
            [r, g, b, a] => Ok(Color([*r, *g, *b, *a])),
            _ => Err("expected r,g,b or r,g,b,a".into()),
        }
    }
}

impl Color {
    fn rgb(self) -> [f32; 3] {
        [self.0[0], self.0[1], self.0[2]]
    }
}

fn parse_hex(hex: &str) -> Result<[u8; 4], String> {
    if hex.len() != 6 && hex.len() != 8 {
        return Err(format!("`#{hex}`: expected 6 or 8 hex digits"));
    }
    let mut rgba = [255u8; 4];
    for (i, byte) in rgba.iter_mut().enumerate().take(hex.len() / 2) {
        let digits = hex.get(i * 2..i * 2 + 2).ok_or("non-ASCII color")?;
        *byte = u8::from_str_radix(digits, 16).map_err(|e| format!("`#{hex}`: {e}"))?;
    }
    Ok(rgba)
}

#[derive(Clone, Debug)]
struct Source(TextureRecipe);

impl FromStr for Source {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split('+');
        let head = parts.next().unwrap_or_default();
        let mut recipe = if head == "slot" {
            TextureRecipe::input_slot()
        } else if let Some(name) = head.strip_prefix("named:") {
            TextureRecipe::named(name)
        } else if let Some(path) = head.strip_prefix("file:") {
            let bytes = std::fs::read(path).map_err(|e| format!("{path}: {e}"))?;
            TextureRecipe::raw(bytes)
        } else if let Some(hex) = head.strip_prefix('#') {
            TextureRecipe::solid(parse_hex(hex)?)
        } else {
            return Err(format!("unknown source `{head}`"));
        };
        for flag in parts {
            recipe = match flag {
                "desaturate" => recipe.desaturated(),
                "normalize" => recipe.normalized(),
                other => return Err(format!("unknown source flag `{other}`")),
            };
        }
        Ok(Source(recipe))
    }
}

// ---------- setup ----------

fn setup_diagnostics(verbose: bool) {
    env_logger::Builder::new()
        .filter_level(if verbose || cfg!(debug_assertions) {
            LevelFilter::Debug
        } else {
            LevelFilter::Info
        })
        .format_timestamp_millis()
        .format_target(false)
        .parse_default_env()
        .init();

    panic::set_hook(Box::new(|panic_info| {
        let backtrace = Backtrace::force_capture();
        let msg = match panic_info.payload().downcast_ref::<&'static str>() {
            Some(s) => *s,
            None => match panic_info.payload().downcast_ref::<String>() {
                Some(s) => &s[..],
                None => "Box<dyn Any>",
            },
        };
        let location = panic_info
            .location()
            .map_or("unknown location".to_string(), |loc| {
                format!("{}:{}", loc.file(), loc.line())
            });
        let report = format!("=== livery-bake crash ===\n{msg}\nat {location}\n\n{backtrace}");
        eprintln!("{report}");
        if let Ok(mut file) = File::create("livery_bake_crash.log") {
            let _ = file.write_all(report.as_bytes());
        }
    }));
}

async fn create_backend(cpu: bool) -> SharedBackend {
    if !cpu {
        match WgpuBackend::new_headless().await {
            Ok(backend) => return Arc::new(backend),
            Err(e) => warn!("No GPU backend ({e}), falling back to CPU"),
        }
    }
    Arc::new(CpuBackend::new())
}

// ---------- main ----------

fn main() {
    let cli = Cli::parse();
    setup_diagnostics(cli.verbose);

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .thread_name("livery-bake-worker")
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            error!("Failed to start async runtime: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = runtime.block_on(run(cli)) {
        error!("{e:#}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = match &cli.config {
        Some(path) => EngineConfig::from_json_file(path)?,
        None => EngineConfig::default(),
    };
    let backend = create_backend(cli.cpu).await;
    let engine = LiveryEngine::new(
        backend,
        Arc::new(GltfContainerReader::new(&cli.models)),
        config,
    );
    let slot = engine.cars().create_slot("bake");

    if let Some(car) = &cli.car {
        let outcome = slot
            .set_car_async(car, cli.skin.as_deref(), CancellationToken::new())
            .await
            .with_context(|| format!("loading `{car}`"))?;
        info!("Car `{car}`: {outcome:?}");
    }

    let path = bake(&engine, &slot, &cli).await?;
    info!("Wrote {}", path.display());
    println!("{}", path.display());
    Ok(())
}

async fn bake(engine: &LiveryEngine, slot: &CarSlot, cli: &Cli) -> anyhow::Result<PathBuf> {
    let shop = engine.paint_shop();
    let size = cli.size.map(|Size(w, h)| (w, h));
    let out = cli.output.clone();
    let name = cli.slot.as_str();

    let path = match &cli.op {
        Op::Texture { source } => {
            shop.save_texture_async(slot, name, &source.0, out, size)
                .await?
        }
        Op::Color { color } => shop.save_texture_color_async(color.0, out, size).await?,
        Op::Flakes { color, amount } => {
            let request = FlakesRequest {
                color: color.rgb(),
                flakes: *amount,
            };
            shop.save_texture_flakes_async(&request, out, size).await?
        }
        Op::Pattern {
            pattern,
            ao,
            overlay,
        } => {
            let request = pattern_request(pattern, ao, overlay);
            shop.save_texture_pattern_async(slot, name, &request, out, size)
                .await?
        }
        Op::ColorfulPattern {
            pattern,
            ao,
            overlay,
            mask,
            colors,
        } => {
            let request = ColorfulPatternRequest {
                pattern: pattern_request(pattern, ao, overlay),
                mask: mask.as_ref().map(|m| m.0.clone()),
                colors: colors.iter().map(|c| c.0).collect(),
            };
            shop.save_texture_colorful_pattern_async(slot, name, &request, out, size)
                .await?
        }
        Op::Maps {
            source,
            specular,
            gloss,
            reflection,
            fixed_gloss,
        } => {
            let request = MapsRequest {
                source: source.0.clone(),
                specular: *specular,
                gloss: *gloss,
                reflection: *reflection,
                fixed_gloss: *fixed_gloss,
            };
            shop.save_texture_maps_async(slot, name, &request, out, size)
                .await?
        }
        Op::Tint {
            source,
            color,
            alpha_add,
        } => {
            let request = TintRequest {
                source: source.0.clone(),
                color: color.rgb(),
                alpha_add: *alpha_add,
            };
            shop.save_texture_tint_async(slot, name, &request, out, size)
                .await?
        }
    };
    Ok(path)
}

fn pattern_request(pattern: &Source, ao: &Option<Source>, overlay: &Option<Source>) -> PatternRequest {
    PatternRequest {
        pattern: pattern.0.clone(),
        ao: ao.as_ref().map(|s| s.0.clone()),
        overlay: overlay.as_ref().map(|s| s.0.clone()),
    }
}
