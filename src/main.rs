use clap::Parser;
use screenshot_server::{setup_logging, Cli, CliRunner};
use tracing::error;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // .env values fill in anything the process environment leaves unset
    dotenvy::dotenv().ok();

    let args = Cli::parse();
    setup_logging(args.verbose)?;

    if let Err(e) = CliRunner::new(args).run().await {
        error!("{:#}", e);
        std::process::exit(1);
    }

    Ok(())
}
