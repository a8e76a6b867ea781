use std::path::PathBuf;

use clap::Parser;
use furrow::util::Shutdown;

#[derive(Parser, Debug)]
#[command(name = "furrow", version, about = "Replicated control plane for farm automation.")]
struct Args {
    /// Location of the config file.
    #[arg(long, value_name = "PATH", default_value = "furrow.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = furrow::config::load(&args.config)?;
    let _guard = furrow::logger::init(&config.log)?;

    let shutdown = Shutdown::new();
    let trigger = shutdown.clone();
    ctrlc::set_handler(move || {
        tracing::info!("received interrupt");
        trigger.shutdown();
    })?;

    furrow::furrow(config, shutdown).await?;
    Ok(())
}
