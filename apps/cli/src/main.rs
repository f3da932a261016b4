//! blockput command-line entry point.

mod app;
mod config;

use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    let path = config::config_path(
        std::env::args().nth(1),
        std::env::var(config::CONFIG_ENV).ok(),
    )?;
    let config = config::Config::load(&path)?;

    // Initialize structured logging; RUST_LOG overrides the default.
    let default_filter = if config.upload.verbose {
        "debug,blockput=trace"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %path.display(),
        file = %config.upload.file_path.display(),
        "starting blockput"
    );

    let rt = tokio::runtime::Runtime::new()?;
    let Some(completion) = rt.block_on(app::run(config))? else {
        tracing::info!("upload cancelled; completed chunks stay cached for the next run");
        std::process::exit(130);
    };

    println!("{}", serde_json::to_string_pretty(&completion.to_json())?);
    if !completion.is_success() {
        std::process::exit(1);
    }
    Ok(())
}
