use crate::workspace;
use clap::Args;
use colored::Colorize;
use ecrflow_build::{
    Architecture, AuthService, AuthSession, BuildError, BuildOrchestrator, BuildSpec,
    BuilderLease, ConsoleProgress, DEFAULT_BUILDKIT_ADDR, DEFAULT_CONNECT_TIMEOUT,
    DEFAULT_RAILPACK_VERSION, DirectBuilder, Frontend, ImageDescriptor, prepare_railpack_plan,
    select_frontend,
};
use ecrflow_cloud_aws::{CredentialBroker, Credentials};
use ecrflow_config::EcrflowConfig;
use ecrflow_registry::RegistryIdentity;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Args)]
pub struct BuildArgs {
    /// clone するリポジトリ (例: https://github.com/username/repo)
    #[arg(long)]
    pub repo: String,
    /// プッシュ先のレジストリ (例: 123456789012.dkr.ecr.us-east-1.amazonaws.com/myrepo/app)
    #[arg(long, env = "ECRFLOW_REGISTRY")]
    pub registry: String,
    /// ECR レジストリのリージョン
    #[arg(long, env = "AWS_REGION")]
    pub region: Option<String>,
    /// イメージのアーキテクチャ (amd64, arm64)。省略時は実行中のホストに合わせる
    #[arg(long, env = "ECRFLOW_ARCH")]
    pub arch: Option<Architecture>,
    /// リポジトリ内の Dockerfile のパス
    #[arg(long, env = "ECRFLOW_DOCKERFILE")]
    pub dockerfile: Option<PathBuf>,
    /// buildkitd のアドレス (tcp://, unix://, ssh://, docker-container://, kube-pod://)
    #[arg(long, env = "BUILDKIT_HOST")]
    pub builder_addr: Option<String>,
    /// buildkitd の準備完了を待つ秒数
    #[arg(long, env = "ECRFLOW_CONNECT_TIMEOUT")]
    pub connect_timeout: Option<u64>,
    /// Dockerfile が無い場合に使う Railpack のバージョン
    #[arg(long, env = "RAILPACK_VERSION")]
    pub railpack_version: Option<String>,
    /// ビルド後も clone したディレクトリを残す
    #[arg(long)]
    pub keep_source: bool,
}

/// コマンドライン引数と設定ファイルを合わせたビルド設定
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildSettings {
    pub repo: String,
    pub registry: String,
    pub region: String,
    pub arch: Architecture,
    pub dockerfile: PathBuf,
    pub builder_addr: String,
    pub connect_timeout: Duration,
    pub railpack_version: String,
    pub keep_source: bool,
}

impl BuildSettings {
    /// 優先順位: コマンドライン引数・環境変数 > 設定ファイル > デフォルト値
    pub fn resolve(args: BuildArgs, config: &EcrflowConfig) -> anyhow::Result<Self> {
        let region = args
            .region
            .or_else(|| config.region.clone())
            .filter(|region| !region.trim().is_empty())
            .ok_or_else(|| {
                anyhow::anyhow!(
                    "リージョンを指定してください: --region, AWS_REGION または設定ファイルの region"
                )
            })?;

        let arch = match (args.arch, config.arch.as_deref()) {
            (Some(arch), _) => arch,
            (None, Some(arch)) => arch
                .parse()
                .map_err(|e| anyhow::anyhow!("設定ファイルの arch が不正です: {}", e))?,
            (None, None) => Architecture::detect(),
        };

        let connect_timeout = args
            .connect_timeout
            .or(config.connect_timeout_secs)
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_CONNECT_TIMEOUT);

        Ok(Self {
            repo: args.repo,
            registry: args.registry,
            region,
            arch,
            dockerfile: args
                .dockerfile
                .or_else(|| config.dockerfile.clone())
                .unwrap_or_else(|| PathBuf::from("Dockerfile")),
            builder_addr: args
                .builder_addr
                .or_else(|| config.builder_addr.clone())
                .unwrap_or_else(|| DEFAULT_BUILDKIT_ADDR.to_string()),
            connect_timeout,
            railpack_version: args
                .railpack_version
                .or_else(|| config.railpack_version.clone())
                .unwrap_or_else(|| DEFAULT_RAILPACK_VERSION.to_string()),
            keep_source: args.keep_source,
        })
    }
}

pub async fn handle(args: BuildArgs, config: &EcrflowConfig) -> anyhow::Result<()> {
    let settings = BuildSettings::resolve(args, config)?;

    // clone の前から割り込みを受け付け、clone ディレクトリの後片付けまで進める
    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, cancelling build");
            interrupt.cancel();
        }
    });

    println!();
    println!("{} {}", "Repository:".bold(), settings.repo);
    println!("{} {}", "ECR Registry:".bold(), settings.registry);
    println!("{} {}", "Region:".bold(), settings.region);
    println!("{} {}", "Architecture:".bold(), settings.arch);
    println!();

    let registry = ecrflow_registry::resolve(&settings.registry)?;
    if let Some(hint) = registry.region_hint()
        && hint != settings.region
    {
        tracing::warn!(
            "Registry host {} is in {} but --region is {}",
            registry.host,
            hint,
            settings.region
        );
        println!(
            "  {} レジストリのリージョン ({}) と --region ({}) が一致しません",
            "⚠".yellow(),
            hint,
            settings.region
        );
    }

    println!("{}", "ECR の認証情報を取得中...".blue());
    let broker = CredentialBroker::new();
    let credentials = tokio::select! {
        biased;
        _ = cancel.cancelled() => anyhow::bail!(BuildError::Cancelled.user_message()),
        result = broker.fetch_credentials(&registry, &settings.region) => {
            result.map_err(|e| anyhow::anyhow!(e.user_message()))?
        }
    };

    let workflow_id = workspace::generate_workflow_id();
    println!("{} {}", "ワークフローを開始:".blue(), workflow_id.cyan());
    println!();

    let source_dir = workspace::source_dir(&std::env::current_dir()?, &workflow_id);
    println!("{}", "リポジトリを clone 中...".blue());
    workspace::clone_repo_into(&settings.repo, &source_dir, &cancel).await?;
    println!(
        "  {} clone 完了: {}",
        "✓".green(),
        source_dir.display().to_string().cyan()
    );
    println!();

    let result = build_and_push(
        &settings,
        registry,
        credentials,
        &workflow_id,
        &source_dir,
        &cancel,
    )
    .await;

    // 失敗時もソースツリーは片付ける
    if settings.keep_source {
        println!("  clone ディレクトリを残します: {}", source_dir.display());
    } else {
        workspace::remove_source(&source_dir);
    }

    let (tag, descriptor) = result?;

    println!();
    println!("{}", "✓ イメージのビルドが完了しました".green().bold());
    println!("  {} {}", "Image:".bold(), tag.cyan());
    println!("  {} {}", "Digest:".bold(), descriptor.digest);
    if !descriptor.media_type.is_empty() {
        println!("  {} {}", "Media type:".bold(), descriptor.media_type);
    }

    Ok(())
}

async fn build_and_push(
    settings: &BuildSettings,
    registry: RegistryIdentity,
    credentials: Credentials,
    workflow_id: &str,
    source_dir: &Path,
    cancel: &CancellationToken,
) -> anyhow::Result<(String, ImageDescriptor)> {
    let frontend = select_frontend(source_dir, &settings.dockerfile, &settings.railpack_version);
    if let Frontend::Railpack { version } = &frontend {
        println!(
            "{} Dockerfile が見つからないため Railpack {} を使います",
            "→".blue(),
            version
        );
        println!("{}", "Railpack のビルドプランを作成中...".blue());
        let prepared = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(BuildError::Cancelled),
            result = prepare_railpack_plan(source_dir) => result,
        };
        prepared.map_err(|e| anyhow::anyhow!(e.user_message()))?;
    }

    let spec = BuildSpec {
        tag: registry.tag(workflow_id),
        registry,
        region: settings.region.clone(),
        source_dir: source_dir.to_path_buf(),
        dockerfile: settings.dockerfile.clone(),
        arch: settings.arch,
        frontend,
    };

    println!(
        "{} {}",
        "BuildKit に接続中:".blue(),
        settings.builder_addr.cyan()
    );
    let lease: Box<dyn BuilderLease> = Box::new(
        DirectBuilder::connect(&settings.builder_addr, settings.connect_timeout, cancel)
            .await
            .map_err(|e| anyhow::anyhow!(e.user_message()))?,
    );

    let auth: Arc<dyn AuthService> = Arc::new(AuthSession::new(credentials, spec.registry.clone()));
    let orchestrator = BuildOrchestrator::new(lease.engine());

    let outcome = match ConsoleProgress::new(&spec.tag) {
        Ok(mut progress) => orchestrator.build(&spec, auth, &mut progress, cancel).await,
        Err(e) => Err(e),
    };

    // 成功しても失敗してもリースは1回だけ解放する
    lease.release(outcome.as_ref().err()).await;

    let descriptor = outcome.map_err(|e| anyhow::anyhow!(e.user_message()))?;
    Ok((spec.tag, descriptor))
}
