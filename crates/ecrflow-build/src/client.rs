//! BuildKit の gRPC クライアント
//!
//! `Control.Solve` と `Control.Status` を並行して呼び出し、solve の間は
//! [`Session`] でデーモンからの認証・ファイル転送の要求に応答します。

use crate::dial::BuilderAddress;
use crate::error::{BuildError, Result};
use crate::progress::SolveStatus;
use crate::proto::moby::buildkit::v1 as pb;
use crate::proto::moby::buildkit::v1::control_client::ControlClient;
use crate::session::Session;
use crate::solve::{BuildEngine, SolveRequest, SolveResponse};
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tonic::transport::Channel;
use tonic::{Code, Status};

/// BuildKit デーモンのデフォルトアドレス
pub const DEFAULT_BUILDKIT_ADDR: &str = "unix:///run/buildkit/buildkitd.sock";

const SESSION_NAME: &str = "ecrflow";

/// solve の完了後、残りの状態更新を待つ時間
const STATUS_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// gRPC で BuildKit デーモンに接続するエンジン
#[derive(Debug, Clone)]
pub struct BuildkitEngine {
    address: String,
    target: BuilderAddress,
    control: ControlClient<Channel>,
}

impl BuildkitEngine {
    /// アドレスを検証してクライアントを作成
    ///
    /// 接続は最初の呼び出しまで行わない。tokio ランタイム内で呼ぶこと。
    pub fn new(address: impl Into<String>) -> Result<Self> {
        let address = address.into();
        let target = BuilderAddress::parse(&address)?;
        let control = ControlClient::new(target.channel()?);

        Ok(Self {
            address,
            target,
            control,
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// 接続に必要な外部コマンド（`docker`・`kubectl`・`ssh`）
    pub fn helper_program(&self) -> Option<&str> {
        self.target.helper_program()
    }

    pub async fn list_workers(&self) -> std::result::Result<Vec<pb::WorkerRecord>, Status> {
        let response = self
            .control
            .clone()
            .list_workers(pb::ListWorkersRequest::default())
            .await?;
        Ok(response.into_inner().record)
    }
}

/// [`SolveRequest`] を `Control.Solve` のリクエストに変換
///
/// エクスポートが1つなら古いデーモンも受け付ける単一エクスポーターのフィールドを使う。
fn solve_message(request: &SolveRequest, solve_ref: &str, session_id: &str) -> pb::SolveRequest {
    let mut message = pb::SolveRequest {
        r#ref: solve_ref.to_string(),
        session: session_id.to_string(),
        frontend: request.frontend.clone(),
        frontend_attrs: request.frontend_attrs.clone().into_iter().collect(),
        internal: request.internal,
        ..Default::default()
    };

    match request.exports.as_slice() {
        [export] => {
            message.exporter_deprecated = export.kind.clone();
            message.exporter_attrs_deprecated = export.attrs.clone().into_iter().collect();
        }
        exports => {
            message.exporters = exports
                .iter()
                .map(|export| pb::Exporter {
                    r#type: export.kind.clone(),
                    attrs: export.attrs.clone().into_iter().collect(),
                })
                .collect();
        }
    }

    message
}

/// `Control.Status` の更新を `progress` に流す
///
/// 送信側は戻ったときに閉じる。
async fn forward_status(
    mut control: ControlClient<Channel>,
    solve_ref: String,
    progress: mpsc::Sender<SolveStatus>,
) {
    let request = pb::StatusRequest {
        r#ref: solve_ref.clone(),
    };
    let mut stream = match control.status(request).await {
        Ok(response) => response.into_inner(),
        Err(status) => {
            tracing::warn!("Failed to watch status of {}: {}", solve_ref, status.message());
            return;
        }
    };

    loop {
        match stream.message().await {
            Ok(Some(update)) => {
                if progress.send(update.into()).await.is_err() {
                    tracing::trace!("Progress receiver closed");
                    return;
                }
            }
            Ok(None) => return,
            Err(status) => {
                tracing::debug!("Status stream of {} ended: {}", solve_ref, status.message());
                return;
            }
        }
    }
}

/// 破棄時にタスクを止める
struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

fn solve_error(status: Status) -> BuildError {
    match status.code() {
        Code::Cancelled => BuildError::Cancelled,
        _ => BuildError::SolveFailed(status.message().to_string()),
    }
}

#[async_trait]
impl BuildEngine for BuildkitEngine {
    async fn solve(
        &self,
        request: SolveRequest,
        progress: mpsc::Sender<SolveStatus>,
    ) -> Result<SolveResponse> {
        let solve_ref = uuid::Uuid::new_v4().simple().to_string();
        let session = Session::new(
            SESSION_NAME,
            request.auth_services().cloned().collect(),
            request.local_dirs.clone(),
        );
        let message = solve_message(&request, &solve_ref, session.id());

        let mut control = self.control.clone();
        let _session = session.start(&mut control).await?;

        let mut status = AbortOnDrop(tokio::spawn(forward_status(
            self.control.clone(),
            solve_ref.clone(),
            progress,
        )));

        tracing::debug!(
            "Solving {} with {} (internal: {})",
            solve_ref,
            request.frontend,
            request.internal
        );
        let result = control.solve(message).await;

        if tokio::time::timeout(STATUS_DRAIN_TIMEOUT, &mut status.0)
            .await
            .is_err()
        {
            tracing::debug!("Status stream of {} did not finish", solve_ref);
        }

        let response = result.map_err(solve_error)?.into_inner();
        Ok(SolveResponse {
            exporter_response: response.exporter_response,
        })
    }
}
