// orecoin node - CLI entry point

use clap::Parser;
use orecoin::{Cli, CliHandler};

fn main() {
    env_logger::init();

    let cli = Cli::parse();
    if let Err(e) = CliHandler::handle(cli) {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
