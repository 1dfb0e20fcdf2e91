mod commands;
mod workspace;

use clap::{Parser, Subcommand};
use ecrflow_config::EcrflowConfig;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "ecrflow")]
#[command(about = "Git リポジトリを BuildKit でビルドして Amazon ECR にプッシュ", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// リポジトリを clone してイメージをビルドし、ECR にプッシュ
    Build(commands::build::BuildArgs),
    /// レジストリのアドレスを解決して表示
    Resolve {
        /// レジストリのアドレス (例: 123456789012.dkr.ecr.us-east-1.amazonaws.com/myrepo/app)
        address: String,
        /// イメージタグに使うラベル
        #[arg(short, long)]
        label: Option<String>,
    },
    /// バージョン情報を表示
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // ログは stderr に出力（RUST_LOG で変更可能）
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Version => {
            println!("ecrflow {}", env!("CARGO_PKG_VERSION"));
        }
        Commands::Resolve { address, label } => {
            commands::resolve::handle(&address, label.as_deref())?;
        }
        Commands::Build(args) => {
            let config = EcrflowConfig::load()?;
            commands::build::handle(args, &config).await?;
        }
    }

    Ok(())
}
