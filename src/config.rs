use std::path::PathBuf;

use clap::Parser;

use crate::material::CanonicalSlot;

/// Encoding of generated atlas images.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum AtlasFormat {
    #[value(name = "png")]
    Png,
    #[value(name = "webp")]
    Webp,
}

impl std::fmt::Display for AtlasFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AtlasFormat::Png => write!(f, "png"),
            AtlasFormat::Webp => write!(f, "webp"),
        }
    }
}

/// Options of one optimization run.
#[derive(Debug, Clone, PartialEq)]
pub struct OptimizeOptions {
    /// Write fully opaque atlases as JPEG.
    pub compress_textures: bool,
    /// Bound of each atlas side in pixels.
    pub max_texture_size: u32,
    /// Accepted for compatibility; meshes are never simplified.
    pub reduce_meshes: bool,
    pub target_polygon_count: Option<u32>,
    /// Factor applied to source textures before packing (0, 1].
    pub texture_scale: f64,
    /// Gutter around each packed texture in pixels.
    pub padding: u32,
    pub quality: u8,
    pub format: AtlasFormat,
    /// Slots to atlas; empty means every slot.
    pub slots: Vec<CanonicalSlot>,
}

impl Default for OptimizeOptions {
    fn default() -> Self {
        Self {
            compress_textures: false,
            max_texture_size: 2048,
            reduce_meshes: false,
            target_polygon_count: None,
            texture_scale: 1.0,
            padding: 4,
            quality: 85,
            format: AtlasFormat::Png,
            slots: Vec::new(),
        }
    }
}

impl OptimizeOptions {
    /// Whether `slot` takes part in atlasing.
    pub fn includes_slot(&self, slot: &CanonicalSlot) -> bool {
        self.slots.is_empty() || self.slots.contains(slot)
    }
}

/// Fully resolved pipeline configuration (constructed from CLI args).
#[derive(Debug, Clone, Default)]
pub struct PipelineConfig {
    pub input: PathBuf,
    pub output: PathBuf,
    pub options: OptimizeOptions,
    pub dry_run: bool,
    /// Print the run report as JSON on stdout.
    pub json_report: bool,
    pub verbose: bool,
    pub threads: Option<usize>,
}

fn parse_scale(s: &str) -> Result<f64, String> {
    let value: f64 = s.parse().map_err(|e| format!("{e}"))?;
    if value > 0.0 && value <= 1.0 {
        Ok(value)
    } else {
        Err(format!("{value} is not in (0, 1]"))
    }
}

/// CLI argument definition (clap derive).
#[derive(Parser, Debug)]
#[command(
    name = "vrm-atlas",
    about = "Merge VRM avatar material textures into atlases",
    version
)]
pub struct CliArgs {
    /// Input avatar (.vrm / .glb)
    #[arg(short = 'i', long)]
    pub input: PathBuf,

    /// Output avatar
    #[arg(short = 'o', long)]
    pub output: PathBuf,

    /// Encode fully opaque atlases as JPEG
    #[arg(long)]
    pub compress_textures: bool,

    /// Max atlas dimension in pixels
    #[arg(long, default_value_t = 2048)]
    pub max_texture_size: u32,

    /// Mesh reduction request (not supported, ignored)
    #[arg(long)]
    pub reduce_meshes: bool,

    /// Polygon budget for mesh reduction (not supported, ignored)
    #[arg(long)]
    pub target_polygon_count: Option<u32>,

    /// Scale applied to source textures before packing, in (0, 1]
    #[arg(long, default_value_t = 1.0, value_parser = parse_scale)]
    pub texture_scale: f64,

    /// Padding around each texture in pixels
    #[arg(long, default_value_t = 4)]
    pub padding: u32,

    /// JPEG quality (1-100)
    #[arg(long, default_value_t = 85, value_parser = clap::value_parser!(u8).range(1..=100))]
    pub quality: u8,

    /// Atlas image format: png or webp
    #[arg(long, value_enum, default_value = "png")]
    pub format: AtlasFormat,

    /// Slots to atlas, e.g. baseColor,custom:shadeMultiply (default: all)
    #[arg(long = "slot", value_delimiter = ',')]
    pub slots: Vec<CanonicalSlot>,

    /// Analyse the input and report the plan without writing output
    #[arg(long)]
    pub dry_run: bool,

    /// Print the run report as JSON
    #[arg(long)]
    pub json: bool,

    /// Enable verbose logging
    #[arg(short = 'v', long)]
    pub verbose: bool,

    /// Worker thread count (default: all cores)
    #[arg(short = 'j', long)]
    pub threads: Option<usize>,
}

impl From<CliArgs> for PipelineConfig {
    fn from(args: CliArgs) -> Self {
        PipelineConfig {
            input: args.input,
            output: args.output,
            options: OptimizeOptions {
                compress_textures: args.compress_textures,
                max_texture_size: args.max_texture_size,
                reduce_meshes: args.reduce_meshes,
                target_polygon_count: args.target_polygon_count,
                texture_scale: args.texture_scale,
                padding: args.padding,
                quality: args.quality,
                format: args.format,
                slots: args.slots,
            },
            dry_run: args.dry_run,
            json_report: args.json,
            verbose: args.verbose,
            threads: args.threads,
        }
    }
}
