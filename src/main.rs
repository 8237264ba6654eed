use clap::{Parser, Subcommand};
use pyramid_export::codec::Compression;
use pyramid_export::downsample::DownsamplingMethod;
use pyramid_export::dtype::{DataType, Pixel};
use pyramid_export::export::{export_to_directory, ExportOptions, ExportSummary};
use pyramid_export::plan::{propose_mipmaps, downsampled_dimensions};
use pyramid_export::progress::TracingProgress;
use pyramid_export::source::{RawPlaneLoader, VirtualImage, VoxelSize};
use pyramid_export::writer::Layout;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "pyrex", about = "Export images as multi-resolution N5 / OME-Zarr pyramids")]
struct Cli {
    /// -v for debug output, -vv for trace
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the levels the planner proposes for an image
    Plan {
        /// Image dimensions, x first
        #[arg(short, long, required = true, num_args = 1..)]
        dims: Vec<u64>,
        /// Physical voxel size per axis (default 1 on every axis)
        #[arg(long, num_args = 1..)]
        voxel_size: Option<Vec<f64>>,
        #[arg(long)]
        max_block_elements: Option<u64>,
        #[arg(long)]
        max_block_edge: Option<u32>,
        /// Print the proposal as JSON
        #[arg(long)]
        json: bool,
    },
    /// Export a raw little-endian volume as a pyramid
    Export {
        /// Raw volume laid out [timepoint][setup][z][y][x]
        #[arg(short, long)]
        input: PathBuf,
        #[arg(short, long, required = true, num_args = 1..)]
        dims: Vec<u64>,
        /// uint8, int8, uint16, int16, uint32, int32, uint64, int64, float32, float64
        #[arg(short = 't', long, default_value = "uint16")]
        dtype: String,
        #[arg(short, long)]
        output: PathBuf,
        #[arg(long, default_value = "1")]
        timepoints: usize,
        #[arg(long, default_value = "1")]
        setups: usize,
        #[arg(long, num_args = 1..)]
        voxel_size: Option<Vec<f64>>,
        /// Unit of the voxel size (um, nm, ...)
        #[arg(long, default_value = "pixel")]
        unit: String,
        /// JSON options file; flags given explicitly override it
        #[arg(long)]
        options: Option<PathBuf>,
        /// n5 (default) or ome-zarr
        #[arg(long)]
        layout: Option<String>,
        /// raw, gzip (default), zstd, xz (n5 only)
        #[arg(short, long)]
        compression: Option<String>,
        /// Compression level for gzip / zstd
        #[arg(short, long)]
        level: Option<i32>,
        /// average (default) or nearest
        #[arg(short, long)]
        method: Option<String>,
        #[arg(short, long)]
        workers: Option<usize>,
        #[arg(long)]
        name: Option<String>,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let level = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .with_target(false)
        .init();

    match cli.command {

        // ── Plan ─────────────────────────────────────────────────────────────
        Commands::Plan { dims, voxel_size, max_block_elements, max_block_edge, json } => {
            let mut config = pyramid_export::PlannerConfig::default();
            if let Some(n) = max_block_elements { config.max_block_elements = n; }
            if let Some(n) = max_block_edge     { config.max_block_edge     = n; }
            let voxel_size = voxel_size.unwrap_or_else(|| vec![1.0; dims.len()]);
            let proposal = propose_mipmaps(&dims, &voxel_size, &config)?;

            if json {
                println!("{}", serde_json::to_string_pretty(&proposal)?);
                return Ok(());
            }
            println!("{:<6} {:<18} {:<18} {:<22} {:>8}", "Level", "Factors", "Block", "Dimensions", "Blocks");
            for (i, (factors, block)) in proposal.resolutions.iter().zip(&proposal.subdivisions).enumerate() {
                let level_dims = downsampled_dimensions(&dims, factors);
                let blocks: u64 = level_dims
                    .iter()
                    .zip(block)
                    .map(|(&d, &b)| d.div_ceil(b as u64))
                    .product();
                println!("{:<6} {:<18} {:<18} {:<22} {:>8}",
                    i, format!("{factors:?}"), format!("{block:?}"), format!("{level_dims:?}"), blocks);
            }
        }

        // ── Export ───────────────────────────────────────────────────────────
        Commands::Export {
            input, dims, dtype, output, timepoints, setups, voxel_size, unit,
            options, layout, compression, level, method, workers, name,
        } => {
            let mut opts = match &options {
                Some(path) => ExportOptions::from_json_file(path)?,
                None       => ExportOptions::default(),
            };
            if let Some(s) = layout {
                opts.layout = Layout::from_name(&s).ok_or(format!("unknown layout '{s}'"))?;
            }
            if let Some(s) = compression {
                opts.compression = Compression::from_name(&s, level).ok_or(format!("unknown compression '{s}'"))?;
            } else if let Some(level) = level {
                opts.compression = match opts.compression {
                    Compression::Gzip { .. } => Compression::Gzip { level },
                    Compression::Zstd { .. } => Compression::Zstd { level },
                    other                    => other,
                };
            }
            if let Some(s) = method {
                opts.method = DownsamplingMethod::from_name(&s).ok_or(format!("unknown method '{s}'"))?;
            }
            if workers.is_some() { opts.workers = workers; }
            if let Some(name) = name { opts.name = name; }

            let voxel_size = VoxelSize::new(unit, voxel_size.unwrap_or_else(|| vec![1.0; dims.len()]));
            let input = RawInput { path: &input, dims, timepoints, setups, voxel_size };

            let summary = match DataType::from_name(&dtype)? {
                DataType::Uint8   => input.export::<u8>(&output, &opts)?,
                DataType::Int8    => input.export::<i8>(&output, &opts)?,
                DataType::Uint16  => input.export::<u16>(&output, &opts)?,
                DataType::Int16   => input.export::<i16>(&output, &opts)?,
                DataType::Uint32  => input.export::<u32>(&output, &opts)?,
                DataType::Int32   => input.export::<i32>(&output, &opts)?,
                DataType::Uint64  => input.export::<u64>(&output, &opts)?,
                DataType::Int64   => input.export::<i64>(&output, &opts)?,
                DataType::Float32 => input.export::<f32>(&output, &opts)?,
                DataType::Float64 => input.export::<f64>(&output, &opts)?,
            };

            println!("── Export ───────────────────────────────────────────────");
            println!("  Output           {}", output.display());
            println!("  Layout           {}", opts.layout.name());
            println!("  Compression      {}", opts.compression.name());
            println!("  Datasets         {}", summary.datasets);
            println!("  Blocks written   {}", summary.blocks_written);
            println!("  Loopback levels  {}", summary.loopback_levels);
        }
    }

    Ok(())
}

// ── helpers ──────────────────────────────────────────────────────────────────

struct RawInput<'p> {
    path:       &'p Path,
    dims:       Vec<u64>,
    timepoints: usize,
    setups:     usize,
    voxel_size: VoxelSize,
}

impl RawInput<'_> {
    fn export<T: Pixel>(&self, output: &Path, opts: &ExportOptions) -> Result<ExportSummary, Box<dyn std::error::Error>> {
        let loader = RawPlaneLoader::<T>::open(self.path, &self.dims, self.timepoints, self.setups)?;
        let image = VirtualImage::new(self.dims.clone(), self.timepoints, self.setups, loader)?
            .with_voxel_size(self.voxel_size.clone());
        Ok(export_to_directory(&image, output, opts, &mut TracingProgress::default())?)
    }
}
