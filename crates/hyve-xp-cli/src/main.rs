use anyhow::Result;
use clap::Parser;

fn main() -> Result<()> {
    let cli = hyve_xp_cli::Cli::parse();
    hyve_xp_cli::init_tracing(cli.verbose());
    hyve_xp_cli::run_cli(cli)
}
