mod backhaul;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(
    name = "backhaul",
    version,
    about = "Backhaul - expose a service behind NAT through a public rendezvous broker"
)]
struct Cli {
    /// Path to the config file (.toml/.yaml/.yml). If omitted, uses BACKHAUL_CONFIG; then auto-detects backhaul.toml > backhaul.yaml > backhaul.yml from CWD; then falls back to the OS default path (Linux: /etc/backhaul/backhaul.toml; others: user config dir).
    #[arg(long, env = "BACKHAUL_CONFIG")]
    config: Option<std::path::PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    backhaul::run(cli.config).await
}
