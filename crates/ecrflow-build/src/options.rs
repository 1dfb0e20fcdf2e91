//! ビルド設定

use ecrflow_registry::RegistryIdentity;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Railpack フロントエンドのデフォルトバージョン
pub const DEFAULT_RAILPACK_VERSION: &str = "v0.17.1";

/// Railpack フロントエンドのイメージ
pub const RAILPACK_FRONTEND_IMAGE: &str = "ghcr.io/railwayapp/railpack-frontend";

/// ビルド対象のアーキテクチャ
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Architecture {
    Amd64,
    Arm64,
}

impl Architecture {
    /// 実行中のホストのアーキテクチャ（arm 系以外は amd64）
    pub fn detect() -> Self {
        match std::env::consts::ARCH {
            "aarch64" | "arm" => Architecture::Arm64,
            _ => Architecture::Amd64,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Architecture::Amd64 => "amd64",
            Architecture::Arm64 => "arm64",
        }
    }

    /// BuildKit の platform 指定 (`linux/{arch}`)
    pub fn platform(&self) -> String {
        format!("linux/{}", self.as_str())
    }
}

impl Default for Architecture {
    fn default() -> Self {
        Self::detect()
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Architecture {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "amd64" | "x86_64" => Ok(Architecture::Amd64),
            "arm64" | "aarch64" => Ok(Architecture::Arm64),
            other => Err(format!(
                "unsupported architecture '{}' (expected amd64 or arm64)",
                other
            )),
        }
    }
}

/// ビルド手順を解釈するフロントエンド
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frontend {
    /// 標準の Dockerfile フロントエンド
    Dockerfile,
    /// Dockerfile が無いリポジトリ用の Railpack ゲートウェイフロントエンド
    Railpack { version: String },
}

impl Frontend {
    /// BuildKit のフロントエンド ID
    pub fn id(&self) -> &'static str {
        match self {
            Frontend::Dockerfile => "dockerfile.v0",
            Frontend::Railpack { .. } => "gateway.v0",
        }
    }

    /// ゲートウェイフロントエンドのイメージ参照
    pub fn gateway_image(&self) -> Option<String> {
        match self {
            Frontend::Dockerfile => None,
            Frontend::Railpack { version } => {
                Some(format!("{}:{}", RAILPACK_FRONTEND_IMAGE, version))
            }
        }
    }
}

/// 1回のビルドに必要な設定
///
/// 生成後は変更しません。
#[derive(Debug, Clone)]
pub struct BuildSpec {
    pub registry: RegistryIdentity,
    pub region: String,
    /// clone したソースツリーのルート
    pub source_dir: PathBuf,
    /// `source_dir` からの Dockerfile の相対パス
    pub dockerfile: PathBuf,
    pub arch: Architecture,
    /// プッシュ先のイメージ参照
    pub tag: String,
    pub frontend: Frontend,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_architecture_from_str() {
        assert_eq!("amd64".parse::<Architecture>(), Ok(Architecture::Amd64));
        assert_eq!("ARM64".parse::<Architecture>(), Ok(Architecture::Arm64));
        assert_eq!("aarch64".parse::<Architecture>(), Ok(Architecture::Arm64));
        assert!("riscv64".parse::<Architecture>().is_err());
    }

    #[test]
    fn test_architecture_platform() {
        assert_eq!(Architecture::Amd64.platform(), "linux/amd64");
        assert_eq!(Architecture::Arm64.platform(), "linux/arm64");
    }

    #[test]
    fn test_frontend_ids() {
        assert_eq!(Frontend::Dockerfile.id(), "dockerfile.v0");
        assert_eq!(Frontend::Dockerfile.gateway_image(), None);

        let railpack = Frontend::Railpack {
            version: DEFAULT_RAILPACK_VERSION.to_string(),
        };
        assert_eq!(railpack.id(), "gateway.v0");
        assert_eq!(
            railpack.gateway_image().as_deref(),
            Some("ghcr.io/railwayapp/railpack-frontend:v0.17.1")
        );
    }
}
