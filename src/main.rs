//! pkgsmith CLI: resolve, verify and run packaging recipes.

use clap::Parser;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "pkgsmith",
    version,
    about = "Recipe-driven software packaging with trust-verified overrides"
)]
struct Cli {
    #[command(flatten)]
    global: pkgsmith::cli::GlobalArgs,

    #[command(subcommand)]
    command: pkgsmith::cli::Commands,
}

fn init_logging(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_env("PKGSMITH_LOG")
        .unwrap_or_else(|_| EnvFilter::new(format!("pkgsmith={}", default)));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.global.verbose);
    if let Err(e) = pkgsmith::cli::dispatch(cli.command, &cli.global) {
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}
