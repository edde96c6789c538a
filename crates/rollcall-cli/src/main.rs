use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use rollcall_core::{
    spawn_engine, CancelFlag, EngineConfig, EventId, FaceDetect, PersonId, ScrfdDetector,
};
use std::collections::HashMap;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "rollcall", about = "Face-recognition event attendance CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll a directory of reference photos and resolve event photographs.
    ///
    /// The gallery directory holds one subdirectory per person, named after
    /// them, each containing one or more reference photos with exactly one
    /// face.
    Resolve {
        /// Gallery directory: <gallery>/<person name>/*.jpg
        #[arg(long)]
        gallery: PathBuf,
        /// Event photographs to resolve
        #[arg(required = true)]
        images: Vec<PathBuf>,
        /// Pretty-print the JSON reports
        #[arg(long)]
        pretty: bool,
    },
    /// Detect faces in one image and print the raw regions as JSON
    Detect { image: PathBuf },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Resolve {
            gallery,
            images,
            pretty,
        } => resolve(gallery, images, pretty).await,
        Commands::Detect { image } => detect(image),
    }
}

async fn resolve(gallery_dir: PathBuf, images: Vec<PathBuf>, pretty: bool) -> Result<()> {
    let config = EngineConfig::from_env();
    let engine = spawn_engine(config);

    let names = enroll_gallery(&engine, &gallery_dir).await?;
    if names.is_empty() {
        bail!(
            "no references enrolled from {} — expected one subdirectory per person",
            gallery_dir.display()
        );
    }
    tracing::info!(
        persons = names.len(),
        references = engine.gallery().len(),
        "gallery enrolled"
    );

    for image_path in images {
        let bytes = std::fs::read(&image_path)
            .with_context(|| format!("reading {}", image_path.display()))?;

        let resolution = engine
            .resolve_event_image(EventId::new(), bytes, CancelFlag::new())
            .await
            .with_context(|| format!("resolving {}", image_path.display()))?;

        let attendees: Vec<&str> = resolution
            .accepted
            .iter()
            .filter_map(|p| names.get(p).map(String::as_str))
            .collect();

        let report = serde_json::json!({
            "image": image_path,
            "attendees": attendees,
            "audit": resolution.audit,
        });
        if pretty {
            println!("{}", serde_json::to_string_pretty(&report)?);
        } else {
            println!("{}", serde_json::to_string(&report)?);
        }
    }

    Ok(())
}

/// Enroll every photo under `<gallery>/<person>/`, returning person id → name.
/// Individual reference failures (no face, duplicate identity) are logged and
/// skipped; they do not abort the run.
async fn enroll_gallery(
    engine: &rollcall_core::EngineHandle,
    gallery_dir: &PathBuf,
) -> Result<HashMap<PersonId, String>> {
    let mut names = HashMap::new();

    let entries = std::fs::read_dir(gallery_dir)
        .with_context(|| format!("reading gallery directory {}", gallery_dir.display()))?;

    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        let person = PersonId::new();

        let mut enrolled = 0usize;
        for photo in std::fs::read_dir(entry.path())? {
            let photo = photo?.path();
            if !photo.is_file() {
                continue;
            }
            let bytes =
                std::fs::read(&photo).with_context(|| format!("reading {}", photo.display()))?;

            match engine
                .enroll_reference(person, photo.to_string_lossy(), bytes)
                .await
            {
                Ok(reference) => {
                    tracing::debug!(person = %name, id = %reference.id, photo = %photo.display(), "reference enrolled");
                    enrolled += 1;
                }
                Err(e) => {
                    tracing::warn!(person = %name, photo = %photo.display(), error = %e, "reference skipped");
                }
            }
        }

        if enrolled > 0 {
            names.insert(person, name);
        } else {
            tracing::warn!(person = %name, "no usable references, person not enrolled");
        }
    }

    Ok(names)
}

fn detect(image_path: PathBuf) -> Result<()> {
    let config = EngineConfig::from_env();
    let detector = ScrfdDetector::new(config.detector_model_path());

    let bytes =
        std::fs::read(&image_path).with_context(|| format!("reading {}", image_path.display()))?;
    let image = image::load_from_memory(&bytes)
        .with_context(|| format!("decoding {}", image_path.display()))?
        .to_luma8();

    let faces = detector.detect(&image)?;
    println!("{}", serde_json::to_string_pretty(&faces)?);

    Ok(())
}
