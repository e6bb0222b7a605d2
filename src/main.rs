use clap::Parser;
use env_logger::Env;
use log::error;

use seedfc::cli::{run, Cli};

fn main() {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        error!("{}", e);
        std::process::exit(1);
    }
}
