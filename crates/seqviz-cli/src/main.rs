use anyhow::Result;
use clap::Parser;

fn main() -> Result<()> {
    let cli = seqviz_cli::Cli::parse();
    seqviz_cli::run_cli(cli)
}
