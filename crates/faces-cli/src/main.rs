use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use faces_core::{Identity, Pipeline, PipelineConfig, Registry, Session};

mod imageprep;

#[derive(Parser)]
#[command(name = "faces", about = "Open-set face identification")]
struct Cli {
    /// Increase log verbosity
    #[arg(long, global = true)]
    verbose: bool,

    /// Directory containing the ONNX model files
    #[arg(long, global = true)]
    model_dir: Option<PathBuf>,

    /// Path of the registry store
    #[arg(long, global = true)]
    registry: Option<PathBuf>,

    /// Maximum embedding distance for a positive identification
    #[arg(long, global = true)]
    distance_threshold: Option<f32>,

    /// Minimum face probability accepted from the detector
    #[arg(long, global = true)]
    probability_threshold: Option<f32>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Detect faces and write annotated copies
    Detect {
        /// Label each box with its detection probability
        #[arg(long)]
        show_probability: bool,
        /// Directory for annotated output (default: next to the input)
        #[arg(long)]
        out_dir: Option<PathBuf>,
        /// Rotate inputs by a quarter turn multiple before detection
        #[arg(long)]
        rotate: Option<i32>,
        /// Images to process
        #[arg(required = true)]
        images: Vec<PathBuf>,
    },
    /// Identify registered faces and write annotated copies
    Identify {
        /// Directory for annotated output (default: next to the input)
        #[arg(long)]
        out_dir: Option<PathBuf>,
        /// Rotate inputs by a quarter turn multiple before detection
        #[arg(long)]
        rotate: Option<i32>,
        /// Images to process
        #[arg(required = true)]
        images: Vec<PathBuf>,
    },
    /// Register the face in an image under an identity
    Register {
        /// Image containing exactly one face
        image: PathBuf,
        /// Identity to register the face under
        identity: String,
    },
    /// List registered identities
    List,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "info" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .init();

    let mut config = PipelineConfig::from_env();
    if let Some(model_dir) = cli.model_dir {
        config.model_dir = model_dir;
    }
    if let Some(registry) = cli.registry {
        config.registry_path = registry;
    }
    if let Some(threshold) = cli.distance_threshold {
        config.distance_threshold = threshold;
    }
    if let Some(threshold) = cli.probability_threshold {
        config.probability_threshold = threshold;
    }

    let pipeline = Pipeline::new(config);

    match cli.command {
        Commands::Detect {
            show_probability,
            out_dir,
            rotate,
            images,
        } => detect(&pipeline, &images, show_probability, out_dir.as_deref(), rotate),
        Commands::Identify {
            out_dir,
            rotate,
            images,
        } => identify(&pipeline, &images, out_dir.as_deref(), rotate),
        Commands::Register { image, identity } => register(&pipeline, &image, identity),
        Commands::List => list(&pipeline),
    }
}

/// Output path for an annotated copy: `<stem>.<tag>.<ext>`, either next to
/// the input or inside `out_dir`.
fn output_path(input: &Path, tag: &str, out_dir: Option<&Path>) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "image".to_string());
    let ext = input
        .extension()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "jpg".to_string());
    let name = format!("{stem}.{tag}.{ext}");
    match out_dir {
        Some(dir) => dir.join(name),
        None => input.with_file_name(name),
    }
}

fn detect(
    pipeline: &Pipeline,
    images: &[PathBuf],
    show_probability: bool,
    out_dir: Option<&Path>,
    rotate: Option<i32>,
) -> Result<()> {
    for path in images {
        tracing::info!(path = %path.display(), "detecting faces");
        let image = imageprep::load(path, imageprep::DEFAULT_TARGET_SIZE, rotate)?;
        let boxes = pipeline.detect(&image)?;

        let labelled: Vec<_> = boxes
            .iter()
            .map(|b| (*b, show_probability.then(|| format!("{:.3}", b.confidence))))
            .collect();
        let annotated = pipeline.annotate(&image, &labelled);

        let out = output_path(path, "detected", out_dir);
        annotated
            .save(&out)
            .with_context(|| format!("failed to write {}", out.display()))?;
        println!("{}: {} face(s) -> {}", path.display(), boxes.len(), out.display());
    }
    Ok(())
}

fn identify(
    pipeline: &Pipeline,
    images: &[PathBuf],
    out_dir: Option<&Path>,
    rotate: Option<i32>,
) -> Result<()> {
    let mut session = Session::new(pipeline.config().restklasse.clone());

    for path in images {
        tracing::info!(path = %path.display(), "identifying faces");
        let image = imageprep::load(path, imageprep::DEFAULT_TARGET_SIZE, rotate)?;
        let results = pipeline.identify(&image)?;

        for (_, identity) in &results {
            if session.observe(identity) {
                println!("found {identity}");
            }
        }

        let labelled: Vec<_> = results
            .iter()
            .map(|(bbox, identity)| (*bbox, Some(identity.to_string())))
            .collect();
        let annotated = pipeline.annotate(&image, &labelled);

        let out = output_path(path, "identified", out_dir);
        annotated
            .save(&out)
            .with_context(|| format!("failed to write {}", out.display()))?;
        println!("{}: {} face(s) -> {}", path.display(), results.len(), out.display());
    }

    if session.is_empty() {
        println!("no registered identities found");
    }
    Ok(())
}

fn register(pipeline: &Pipeline, path: &Path, identity: String) -> Result<()> {
    let image = imageprep::load(path, imageprep::DEFAULT_TARGET_SIZE, None)?;
    let identity = Identity::new(identity);
    let bbox = pipeline
        .register_image(&image, identity.clone())
        .with_context(|| format!("failed to register a face from {}", path.display()))?;
    pipeline.reload();
    println!(
        "registered {identity} (face at {:.0},{:.0} confidence {:.3})",
        bbox.x0, bbox.y0, bbox.confidence
    );
    Ok(())
}

fn list(pipeline: &Pipeline) -> Result<()> {
    let registry = pipeline.registry()?;
    let mut per_identity: BTreeMap<&Identity, usize> = BTreeMap::new();
    for entry in registry.entries() {
        *per_identity.entry(&entry.identity).or_default() += 1;
    }

    for (identity, patches) in &per_identity {
        println!("{identity}: {patches} patch(es)");
    }
    println!(
        "{} identit(ies), {} entr(ies) at {}",
        per_identity.len(),
        registry.len(),
        registry.path().display()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_path_next_to_input() {
        let out = output_path(Path::new("photos/holiday.jpg"), "detected", None);
        assert_eq!(out, Path::new("photos/holiday.detected.jpg"));
    }

    #[test]
    fn test_output_path_in_out_dir() {
        let out = output_path(
            Path::new("photos/holiday.jpg"),
            "identified",
            Some(Path::new("/tmp/out")),
        );
        assert_eq!(out, Path::new("/tmp/out/holiday.identified.jpg"));
    }

    #[test]
    fn test_output_path_without_extension() {
        let out = output_path(Path::new("holiday"), "detected", None);
        assert_eq!(out, Path::new("holiday.detected.jpg"));
    }
}
