use clap::Parser;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    bondmatch_cli::init_tracing();
    let cli = bondmatch_cli::BondmatchCli::parse();
    bondmatch_cli::run(cli).await
}
