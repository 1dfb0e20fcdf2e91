//! BuildKit の solve リクエスト
//!
//! [`BuildSpec`] から BuildKit に渡すパラメータ（フロントエンド、ローカルディレクトリ、
//! エクスポート設定、セッション）を組み立てます。

use crate::auth::AuthService;
use crate::error::Result;
use crate::options::BuildSpec;
use crate::progress::SolveStatus;
use crate::resolver::frontend_filename;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;

/// エクスポート設定
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportEntry {
    /// エクスポーターの種類（例: `image`）
    pub kind: String,
    pub attrs: BTreeMap<String, String>,
}

impl ExportEntry {
    /// OCI メディアタイプでレジストリに即時プッシュする image エクスポート
    pub fn push_image(name: &str) -> Self {
        let attrs = BTreeMap::from([
            ("name".to_string(), name.to_string()),
            ("oci-mediatypes".to_string(), "true".to_string()),
            ("push".to_string(), "true".to_string()),
        ]);

        Self {
            kind: "image".to_string(),
            attrs,
        }
    }
}

/// ビルドセッションに接続するサービス
#[derive(Clone)]
pub enum Attachable {
    Auth(Arc<dyn AuthService>),
}

impl fmt::Debug for Attachable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Attachable::Auth(_) => f.write_str("Auth(..)"),
        }
    }
}

/// BuildKit への solve リクエスト
#[derive(Debug, Clone)]
pub struct SolveRequest {
    pub frontend: String,
    pub frontend_attrs: BTreeMap<String, String>,
    pub local_dirs: BTreeMap<String, PathBuf>,
    pub exports: Vec<ExportEntry>,
    pub session: Vec<Attachable>,
    /// ビルドステップとトレースを BuildKit の履歴に記録しない
    pub internal: bool,
}

impl SolveRequest {
    /// ビルド設定から solve リクエストを作成
    pub fn for_build(spec: &BuildSpec, auth: Arc<dyn AuthService>) -> Self {
        let filename = frontend_filename(&spec.frontend, &spec.dockerfile);

        let mut frontend_attrs = BTreeMap::from([
            ("filename".to_string(), filename.display().to_string()),
            ("platform".to_string(), spec.arch.platform()),
        ]);

        // ゲートウェイフロントエンドで標準の Dockerfile フロントエンドを差し替える
        if let Some(image) = spec.frontend.gateway_image() {
            frontend_attrs.insert("source".to_string(), image.clone());
            frontend_attrs.insert("cmdline".to_string(), image);
        }

        let local_dirs = BTreeMap::from([
            ("dockerfile".to_string(), spec.source_dir.clone()),
            ("context".to_string(), spec.source_dir.clone()),
        ]);

        Self {
            frontend: spec.frontend.id().to_string(),
            frontend_attrs,
            local_dirs,
            exports: vec![ExportEntry::push_image(&spec.tag)],
            session: vec![Attachable::Auth(auth)],
            internal: true,
        }
    }

    /// セッションに接続された認証サービス
    pub fn auth_services(&self) -> impl Iterator<Item = &Arc<dyn AuthService>> {
        self.session.iter().map(|attachable| match attachable {
            Attachable::Auth(service) => service,
        })
    }
}

/// solve の結果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SolveResponse {
    /// エクスポーターが返したメタデータ（例: `containerimage.digest`）
    pub exporter_response: HashMap<String, String>,
}

/// BuildKit の solve を実行するエンジン
///
/// 状態更新は発生順に `progress` へ送り、完了時に送信側を閉じます。
#[async_trait]
pub trait BuildEngine: Send + Sync {
    async fn solve(
        &self,
        request: SolveRequest,
        progress: mpsc::Sender<SolveStatus>,
    ) -> Result<SolveResponse>;
}

#[async_trait]
impl<T: BuildEngine + ?Sized> BuildEngine for Arc<T> {
    async fn solve(
        &self,
        request: SolveRequest,
        progress: mpsc::Sender<SolveStatus>,
    ) -> Result<SolveResponse> {
        (**self).solve(request, progress).await
    }
}
