//! ビルドエンジンの確保と解放

use crate::client::BuildkitEngine;
use crate::dial::ensure_installed;
use crate::error::{BuildError, Result};
use crate::solve::BuildEngine;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// BuildKit の準備完了を待つデフォルトの時間
///
/// 大きなキャッシュを読み込むと buildkitd の起動に時間がかかる
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(300);

/// 接続確認の間隔
const READY_INTERVAL: Duration = Duration::from_secs(2);

/// ビルドの間だけ確保するビルドエンジン
///
/// `release` は `self` を消費するため、1つのリースにつき1回しか呼べない。
/// 成功時も失敗時も必ず呼び出すこと。
#[async_trait]
pub trait BuilderLease: Send + Sync {
    /// リースしているエンジンのアドレス
    fn address(&self) -> &str;

    fn engine(&self) -> Arc<dyn BuildEngine>;

    /// リースを解放し、ビルドの結果を記録する
    async fn release(self: Box<Self>, outcome: Option<&BuildError>);
}

/// 既に起動している BuildKit デーモンへの直接接続
#[derive(Debug)]
pub struct DirectBuilder {
    engine: Arc<BuildkitEngine>,
}

impl DirectBuilder {
    /// BuildKit デーモンが応答するまで待って接続
    ///
    /// `timeout` を過ぎると `ConnectTimeout`、`cancel` されると `Cancelled` を返す。
    pub async fn connect(
        address: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Self> {
        let engine = BuildkitEngine::new(address)?;
        if let Some(program) = engine.helper_program() {
            ensure_installed(program).await?;
        }
        Self::connect_with(engine, timeout, READY_INTERVAL, cancel).await
    }

    pub(crate) async fn connect_with(
        engine: BuildkitEngine,
        timeout: Duration,
        interval: Duration,
        cancel: &CancellationToken,
    ) -> Result<Self> {
        tracing::info!("Connecting to BuildKit at {}", engine.address());

        let wait_ready = async {
            let mut attempts = 0u32;
            loop {
                attempts += 1;
                if is_ready(&engine).await {
                    tracing::debug!("BuildKit ready after {} attempt(s)", attempts);
                    return Ok::<(), BuildError>(());
                }
                tokio::time::sleep(interval).await;
            }
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(BuildError::Cancelled),
            result = tokio::time::timeout(timeout, wait_ready) => match result {
                Ok(ready) => ready?,
                Err(_) => {
                    return Err(BuildError::ConnectTimeout {
                        address: engine.address().to_string(),
                        timeout,
                    });
                }
            },
        }

        Ok(Self {
            engine: Arc::new(engine),
        })
    }
}

/// ワーカーが1つ以上登録されていれば準備完了
async fn is_ready(engine: &BuildkitEngine) -> bool {
    match engine.list_workers().await {
        Ok(workers) if !workers.is_empty() => true,
        Ok(_) => {
            tracing::debug!("BuildKit at {} has no workers yet", engine.address());
            false
        }
        Err(status) => {
            tracing::debug!(
                "BuildKit at {} is not ready: {}",
                engine.address(),
                status.message()
            );
            false
        }
    }
}

#[async_trait]
impl BuilderLease for DirectBuilder {
    fn address(&self) -> &str {
        self.engine.address()
    }

    fn engine(&self) -> Arc<dyn BuildEngine> {
        self.engine.clone()
    }

    async fn release(self: Box<Self>, outcome: Option<&BuildError>) {
        match outcome {
            None => tracing::info!("Released BuildKit at {} (build succeeded)", self.address()),
            Some(e) => {
                tracing::info!("Released BuildKit at {} (build failed: {})", self.address(), e)
            }
        }
    }
}
