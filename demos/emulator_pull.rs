//! Manual end-to-end walkthrough against the Pub/Sub emulator.
//!
//! Start the emulator (`gcloud beta emulators pubsub start`), export
//! `PUBSUB_EMULATOR_HOST`, create a topic `demo-topic` with a subscription
//! `demo-topic_demo-group`, publish a few messages carrying `offset`
//! attributes, then run:
//!
//! ```text
//! cargo run --example emulator_pull
//! ```

use std::env;
use std::time::Duration;

use pubsub_log_consumer::{ConsumerOptions, LogConsumer};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    env_logger::init();

    if env::var("PUBSUB_EMULATOR_HOST").is_err() {
        env::set_var("PUBSUB_EMULATOR_HOST", "localhost:8085");
    }
    log::info!(
        "connecting to emulator at {}",
        env::var("PUBSUB_EMULATOR_HOST").unwrap()
    );

    let options = ConsumerOptions::new("test-project", "demo-group").auto_commit(false);
    let mut consumer = LogConsumer::connect(options).await?;
    consumer.subscribe(&["demo-topic"]).await?;

    log::info!("polling for messages...");
    let records = consumer.poll(Duration::from_secs(5)).await?;
    log::info!("polled {} records", records.len());
    for record in &records {
        log::info!(
            "  offset={} key={:?} {} bytes",
            record.offset,
            record.key.as_deref().map(String::from_utf8_lossy),
            record.value.len()
        );
    }

    consumer.commit_sync().await?;
    log::info!("committed");

    consumer.close().await?;
    Ok(())
}
