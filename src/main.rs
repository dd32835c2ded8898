// utxo-node - CLI entry point

use clap::Parser;
use utxo_node::{Cli, CliHandler};

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let handler = CliHandler::new(&cli);

    if let Err(e) = handler.handle(cli.command).await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
