use anyhow::Result;
use clap::Parser;

fn main() -> Result<()> {
    let cli = memory_kernel_provenance_cli::Cli::parse();
    memory_kernel_provenance_cli::init_logging(&cli.log_level);
    memory_kernel_provenance_cli::run_cli(cli)
}
