use clap::Parser;
use desk_detection::{config, start_app, DetectRequest};
use std::{path::PathBuf, time::Duration};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Detect desk furniture in a photo and count it per class.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// Image to analyse (JPEG, PNG, ...)
    image: PathBuf,

    /// Where the annotated image is written
    #[arg(short, long)]
    output_dir: Option<PathBuf>,

    /// Minimum confidence for a detection, in [0, 1]
    #[arg(short, long)]
    confidence: Option<f32>,

    /// Give up after this many milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let config = config::get_configuration()?;
    let log_level = &format!("{},ort=info", config.log_level.as_str());

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_level.into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_level(true)
                .with_writer(std::io::stderr),
        )
        .init();

    let request = DetectRequest {
        image_path: args.image,
        output_dir: args.output_dir,
        confidence_threshold: args.confidence,
        timeout: args.timeout_ms.map(Duration::from_millis),
    };

    if let Err(e) = start_app(config, request).await {
        tracing::error!("Detection failed: {}", e);
        eprintln!("Error: {}", e);
        // Returning would drop the runtime, which blocks on a timed-out
        // inference worker until the model call finishes.
        std::process::exit(1);
    }

    Ok(())
}
