use clap::Parser;

use sc_deployer::config::CliArgs;
use sc_deployer::{deploy, telemetry};

#[tokio::main]
async fn main() {
    let cli = CliArgs::parse();
    if let Err(err) = telemetry::init() {
        eprintln!("warning: {err}");
    }
    if let Err(err) = deploy::run(cli).await {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}
