use anyhow::{bail, Context, Result};
use clap::Parser;
use log::{debug, info, warn};
use lotmap::{
    FeatureCollection, Pipeline, PipelineConfig, PipelineStats, SizeCategory, TileFailure,
    TileInput, TileResult,
};
use rayon::prelude::*;
use std::{
    fs::{self, File},
    io::{BufReader, BufWriter, Write},
    path::{Path, PathBuf},
    time::Instant,
};
use walkdir::WalkDir;

const M2_PER_SQ_MILE: f64 = 2.59e6;

#[derive(Parser, Debug, Clone)]
#[command(name = "mask2geojson", version)]
struct Args {
    /// Directory of per-tile inference records (`*.json`), searched recursively.
    #[arg(long, default_value = "predictions")]
    input_dir: String,

    #[arg(long, default_value = "parking_lots.geojson")]
    output: String,

    /// JSON file with pipeline settings; flags below override individual fields.
    #[arg(long, env = "LOTMAP_CONFIG")]
    config: Option<String>,

    /// Foreground probability cut-off.
    #[arg(long)]
    threshold: Option<f32>,

    #[arg(long)]
    min_area_px: Option<usize>,

    #[arg(long)]
    fill_holes_px: Option<usize>,

    #[arg(long)]
    closing_radius_px: Option<usize>,

    /// Douglas–Peucker tolerance in pixels.
    #[arg(long)]
    tolerance_px: Option<f64>,

    #[arg(long)]
    spot_area_m2: Option<f64>,

    #[arg(long)]
    overlap_threshold: Option<f64>,

    /// Also write the run statistics as JSON.
    #[arg(long)]
    stats_json: Option<String>,

    #[arg(long, default_value_t = false)]
    overwrite: bool,

    #[arg(long, default_value_t = false)]
    pretty: bool,
}

impl Args {
    fn pipeline_config(&self) -> Result<PipelineConfig> {
        let mut cfg = match &self.config {
            Some(path) => {
                let text = fs::read_to_string(path)
                    .with_context(|| format!("reading config {path}"))?;
                PipelineConfig::from_json_str(&text)?
            }
            None => PipelineConfig::default(),
        };

        if let Some(v) = self.threshold {
            cfg.clean.threshold = v;
        }
        if let Some(v) = self.min_area_px {
            cfg.clean.min_area_px = v;
        }
        if let Some(v) = self.fill_holes_px {
            cfg.clean.fill_holes_px = v;
        }
        if let Some(v) = self.closing_radius_px {
            cfg.clean.closing_radius_px = v;
        }
        if let Some(v) = self.tolerance_px {
            cfg.extract.tolerance_px = v;
        }
        if let Some(v) = self.spot_area_m2 {
            cfg.attributes.spot_area_m2 = v;
        }
        if let Some(v) = self.overlap_threshold {
            cfg.merge.overlap_threshold = v;
        }
        Ok(cfg)
    }
}

/// Every `*.json` under `input_dir`, sorted so the run order is stable.
fn tile_paths(input_dir: &str) -> Vec<PathBuf> {
    let mut paths: Vec<PathBuf> = WalkDir::new(input_dir)
        .follow_links(true)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .filter(|p| {
            p.extension()
                .and_then(|s| s.to_str())
                .is_some_and(|s| s.eq_ignore_ascii_case("json"))
        })
        .collect();
    paths.sort();
    paths
}

fn load_tile(path: &Path) -> Result<TileInput> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let input: TileInput = serde_json::from_reader(BufReader::new(file))
        .with_context(|| format!("parsing {}", path.display()))?;
    Ok(input)
}

fn process_path(pipeline: &Pipeline, path: &Path) -> TileResult {
    match load_tile(path) {
        Ok(input) => {
            debug!("loaded {} ({})", path.display(), input.tile.tile_id);
            pipeline.process_input(input)
        }
        Err(err) => Err(TileFailure::new(path.display().to_string(), format!("{err:#}"))),
    }
}

fn write_collection(path: &str, collection: &FeatureCollection, pretty: bool) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {path}"))?;
    let mut w = BufWriter::new(file);
    collection
        .to_writer(&mut w, pretty)
        .with_context(|| format!("writing {path}"))?;
    w.flush()?;
    Ok(())
}

fn write_stats(path: &str, stats: &PipelineStats) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {path}"))?;
    let mut w = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut w, stats)?;
    w.flush()?;
    Ok(())
}

fn log_summary(collection: &FeatureCollection, stats: &PipelineStats) {
    let lots = collection.features.len();
    let spots: u64 = collection.features.iter().map(|f| f.properties.num_spots).sum();
    let area: f64 = collection.features.iter().map(|f| f.properties.area_m2).sum();
    let count = |c: SizeCategory| {
        collection
            .features
            .iter()
            .filter(|f| f.properties.size_category == c)
            .count()
    };

    info!(
        "tiles: {} processed, {} failed of {}",
        stats.tiles_processed, stats.tiles_failed, stats.tiles_total
    );
    info!("lots: {lots}, estimated spots: {spots}");
    info!(
        "coverage: {:.0} m² ({:.3} mi²)",
        area,
        area / M2_PER_SQ_MILE
    );
    if lots > 0 {
        info!("mean lot size: {:.0} m²", area / lots as f64);
    }
    info!(
        "sizes: {} small, {} medium, {} large",
        count(SizeCategory::Small),
        count(SizeCategory::Medium),
        count(SizeCategory::Large)
    );
    if let (Some(first), Some(last)) = (stats.earliest_capture, stats.latest_capture) {
        info!("imagery captured {} .. {}", first.date_naive(), last.date_naive());
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let pipeline = Pipeline::new(args.pipeline_config()?)?;

    if Path::new(&args.output).exists() && !args.overwrite {
        bail!("{} exists; pass --overwrite to replace it", args.output);
    }

    let paths = tile_paths(&args.input_dir);
    if paths.is_empty() {
        warn!("no *.json tiles under {}", args.input_dir);
    }
    info!("Processing {} tiles...", paths.len());
    let start = Instant::now();

    let results: Vec<TileResult> = paths
        .par_iter()
        .map(|path| process_path(&pipeline, path))
        .collect();
    let out = pipeline.finish(results);

    write_collection(&args.output, &out.collection, args.pretty)?;
    info!(
        "OK {} -> {} ({} lots, {:.1}s)",
        args.input_dir,
        args.output,
        out.collection.features.len(),
        start.elapsed().as_secs_f64()
    );

    if let Some(path) = &args.stats_json {
        write_stats(path, &out.stats)?;
    }
    log_summary(&out.collection, &out.stats);

    Ok(())
}
