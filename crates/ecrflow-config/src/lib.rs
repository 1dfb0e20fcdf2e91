pub mod error;

pub use error::*;

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// 設定ファイルのパスを直接指定する環境変数
pub const CONFIG_PATH_ENV: &str = "ECRFLOW_CONFIG_PATH";

/// 設定ファイル名
pub const CONFIG_FILE_NAME: &str = "config.yaml";

/// 設定ファイルのパスを解決
///
/// 1. 環境変数 ECRFLOW_CONFIG_PATH
/// 2. ~/.config/ecrflow/config.yaml
pub fn config_file_path() -> Result<PathBuf> {
    if let Ok(path) = std::env::var(CONFIG_PATH_ENV)
        && !path.is_empty()
    {
        return Ok(PathBuf::from(path));
    }

    Ok(dirs::config_dir()
        .ok_or(ConfigError::ConfigDirNotFound)?
        .join("ecrflow")
        .join(CONFIG_FILE_NAME))
}

/// ビルドのデフォルト値
///
/// コマンドライン引数と環境変数が優先され、どちらも無い項目だけこの値を使う。
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct EcrflowConfig {
    pub region: Option<String>,
    /// `amd64` または `arm64`
    pub arch: Option<String>,
    pub dockerfile: Option<PathBuf>,
    /// BuildKit のアドレス（例: `tcp://buildkit:1234`）
    pub builder_addr: Option<String>,
    /// BuildKit の準備完了を待つ秒数
    pub connect_timeout_secs: Option<u64>,
    pub railpack_version: Option<String>,
}

impl EcrflowConfig {
    /// 設定ファイルを読み込む
    ///
    /// ファイルが無ければデフォルト値を返す
    pub fn load() -> Result<Self> {
        Self::load_from(&config_file_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!("Config file not found at {}", path.display());
            return Ok(Self::default());
        }

        tracing::debug!("Loading config from {}", path.display());
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    fn parse(content: &str) -> std::result::Result<Self, serde_yaml::Error> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(content)
    }
}
