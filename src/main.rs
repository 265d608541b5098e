// tee-signer: main entry point

use std::env;
use std::path::Path;

use tee_signer::SignerConfig;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Load configuration: optional TOML file, then TEE_SIGNER_* overrides
    let config_path = env::var("TEE_SIGNER_CONFIG").ok();
    let mut config = match &config_path {
        Some(path) => SignerConfig::from_file(path)?,
        None if Path::new("tee-signer.toml").exists() => {
            SignerConfig::from_file("tee-signer.toml")?
        }
        None => SignerConfig::default(),
    };
    config.apply_env()?;

    info!("starting TEE signing service");
    info!("bind address: {}", config.server.bind_address);
    info!("repository backend: {}", config.keys.repository_backend);
    info!(
        "rate limit: {}/s burst {}",
        config.rate_limit.rps, config.rate_limit.burst
    );

    match tee_signer::run(config).await {
        Ok(()) => {
            info!("server stopped");
            Ok(())
        }
        Err(e) => {
            error!("server error: {}", e);
            Err(e.into())
        }
    }
}
