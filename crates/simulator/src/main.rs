use anyhow::Result;
use shared::config::Config;
use std::time::Duration;

mod logging;
mod scenario;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::from_env()?;
    logging::init(config.logging.format);

    tracing::info!(
        "Starting encounter simulator as '{}' on service '{}'",
        config.encounter.display_name,
        config.encounter.service_type
    );

    let report = scenario::run(config.encounter, &scenario::DEFAULT_PATH, Duration::from_millis(250)).await?;

    tracing::info!(
        "Walk finished: {} encounter(s) on this side, {} on the peer",
        report.local.encounters_fired,
        report.peer.encounters_fired
    );
    for encounter in &report.encounters {
        println!("{}", serde_json::to_string_pretty(encounter)?);
    }

    Ok(())
}
