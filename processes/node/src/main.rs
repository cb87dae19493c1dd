//! 'main' for the Pharos node process

use anyhow::Result;
use caryatid_process::Process;
use config::{Config, Environment, File};
use pharos_common::messages::Message;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber;

use pharos_module_block_sync::BlockSync;

/// Standard main
#[tokio::main]
pub async fn main() -> Result<()> {
    // Initialise tracing
    tracing_subscriber::fmt::init();

    info!("Pharos node process");

    // Read the config
    let config = Arc::new(
        Config::builder()
            .add_source(File::with_name("node"))
            .add_source(Environment::with_prefix("PHAROS"))
            .build()
            .unwrap(),
    );

    // Create the process
    let mut process = Process::<Message>::create(config).await;

    // Register modules
    BlockSync::register(&mut process);

    // Run it
    process.run().await?;

    // Bye!
    info!("Exiting");
    Ok(())
}
