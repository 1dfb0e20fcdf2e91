use std::time::Duration;
use thiserror::Error;

/// セッション認証サービスのエラー
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("unavailable: {0}")]
    Unavailable(&'static str),
}

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("Build failed: {0}")]
    SolveFailed(String),

    #[error("Progress display failed: {0}")]
    ProgressFailed(String),

    #[error("Build was cancelled")]
    Cancelled,

    #[error(
        "Image push finished (digest: {digest}) but its descriptor could not be decoded: {message}"
    )]
    Descriptor { digest: String, message: String },

    #[error("Timed out after {timeout:?} waiting for BuildKit at {address}")]
    ConnectTimeout { address: String, timeout: Duration },

    #[error("Unsupported builder address: {0}")]
    InvalidBuilderAddress(String),

    #[error("BuildKit connection helper unavailable: {0}")]
    EngineUnavailable(String),

    #[error("BuildKit session failed: {0}")]
    Session(String),

    #[error("BuildKit transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    #[error("Railpack error: {0}")]
    Railpack(String),

    #[error("Session auth error: {0}")]
    Auth(#[from] AuthError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl BuildError {
    /// ユーザー向けの分かりやすいエラーメッセージ
    pub fn user_message(&self) -> String {
        match self {
            BuildError::SolveFailed(msg) => {
                format!(
                    "ビルドに失敗しました: {}\n\
                     \n\
                     Dockerfile とビルドログを確認してください。",
                    msg
                )
            }
            BuildError::Descriptor { digest, .. } => {
                format!(
                    "{}\n\
                     \n\
                     イメージ自体はレジストリにプッシュ済みの可能性があります (digest: {})。",
                    self, digest
                )
            }
            BuildError::ConnectTimeout { address, .. } => {
                format!(
                    "{}\n\
                     \n\
                     解決方法:\n\
                     1. buildkitd が {} で起動しているか確認してください\n\
                     2. --connect-timeout で待機時間を延ばしてください",
                    self, address
                )
            }
            BuildError::EngineUnavailable(msg) => {
                format!(
                    "BuildKit に接続できません: {}\n\
                     \n\
                     アドレスのスキームに応じて docker / kubectl / ssh をインストールし、\n\
                     PATH に追加してください。",
                    msg
                )
            }
            BuildError::Railpack(msg) => {
                format!(
                    "Railpack の準備に失敗しました: {}\n\
                     \n\
                     Dockerfile が無いリポジトリは Railpack でビルドします。\n\
                     railpack をインストールするか、--dockerfile でパスを指定してください。",
                    msg
                )
            }
            _ => format!("{}", self),
        }
    }
}

pub type BuildResult<T> = std::result::Result<T, BuildError>;
pub type Result<T> = BuildResult<T>;
