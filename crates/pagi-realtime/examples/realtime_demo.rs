//! Realtime Voice Demo: talk to the property assistant from the terminal.
//!
//! Uses the default microphone and speaker with the Live backend. Set
//! `PAGI_REALTIME_API_KEY` (or `GEMINI_API_KEY`) in `.env`. Listings come from
//! the JSON file named by `PAGI_REALTIME_CATALOG`, or a small built-in sample.
//!
//! Press Ctrl+C to stop.

use anyhow::Context;
use pagi_realtime::{Collaborators, CpalMicrophone, InMemoryCatalog, Property, RealtimeConfig, SessionController};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

fn sample_catalog() -> InMemoryCatalog {
    let listing = |id: &str, title: &str, kind: &str, location: &str, price: u64, bedrooms: u32| Property {
        id: id.to_string(),
        title: title.to_string(),
        kind: kind.to_string(),
        location: location.to_string(),
        price,
        bedrooms: Some(bedrooms),
        area_sqm: None,
        description: String::new(),
    };
    InMemoryCatalog::new(vec![
        listing("ryd-01", "فيلا مودرن", "فيلا", "الرياض", 3_400_000, 5),
        listing("ryd-02", "شقة عائلية", "شقة", "الرياض", 950_000, 3),
        listing("jed-01", "فيلا على البحر", "فيلا", "جدة", 4_200_000, 6),
    ])
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("🎙️ Realtime Voice Demo: mic → Live backend → speaker, with property tools");

    match CpalMicrophone::list_input_devices() {
        Ok(devices) => info!("Input devices: {:?}", devices),
        Err(e) => warn!("Could not list input devices: {}", e),
    }

    let config = RealtimeConfig::from_env();
    let catalog = match std::env::var("PAGI_REALTIME_CATALOG") {
        Ok(path) => {
            let json = std::fs::read_to_string(&path).with_context(|| format!("reading catalog {}", path))?;
            InMemoryCatalog::from_json(&json)?
        }
        Err(_) => sample_catalog(),
    };

    let collaborators = Collaborators::local(&config, Arc::new(catalog));
    info!("Conversation log: {}", config.log_path.display());
    let controller = SessionController::new(config, collaborators);

    controller.start().await?;
    info!("Speak now. Press Ctrl+C to stop.");

    tokio::signal::ctrl_c().await?;
    controller.exit();
    info!("Goodbye");
    Ok(())
}
