mod display;
mod exchange;
mod font;
mod mjpeg;
mod overlay;
mod pipeline;
mod source;

use display::Display;
use exchange::DetectionClient;
use frame_detect_common::config::Config;
use frame_detect_common::detection::ParameterList;
use pipeline::Pipeline;
use source::Source;
use std::path::PathBuf;
use tracing::{error, info};

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let explicit_path = std::env::args().nth(1).map(PathBuf::from);
    let config_path = explicit_path
        .clone()
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let loaded = match explicit_path {
        Some(_) => Config::load(&config_path),
        None => Config::load_or_default(&config_path),
    };
    let config = match loaded {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config from {}: {e}", config_path.display());
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.logging.level.parse().unwrap_or_default()),
        )
        .init();

    info!(
        service = config.service.url,
        classes = ?config.service.classes,
        capture_mode = config.capture.mode,
        display_mode = config.display.mode,
        "starting frame-detect client"
    );

    let source = match Source::open(&config.capture).await {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "cannot open camera");
            std::process::exit(1);
        }
    };

    let display = match Display::open(&config.display).await {
        Ok(d) => d,
        Err(e) => {
            error!(error = %e, "cannot open display");
            drop(source);
            std::process::exit(1);
        }
    };

    if let Display::Mjpeg(viewer) = &display {
        let addr = viewer.local_addr();
        info!(%addr, "viewer listening, open http://{addr}/ in a browser");
    }

    let mut pipeline = Pipeline::new(
        source,
        display,
        DetectionClient::new(config.service.url.clone()),
        ParameterList::new(config.service.classes.iter().cloned()),
        config.service.jpeg_quality,
    );

    if let Err(e) = pipeline.run().await {
        error!(error = %e, frames = pipeline.frames(), "fatal error, exiting");
        // Release camera and display before exit, which skips destructors.
        drop(pipeline);
        std::process::exit(1);
    }
}
