//! BuildKit セッション
//!
//! solve の間、BuildKit デーモンからのコールバックに応答する gRPC サーバーです。
//! `Control.Session` の双方向ストリームをバイト列のトンネルとして使い、その上で
//! こちらが HTTP/2 サーバー、デーモンがクライアントになります。
//!
//! 公開するサービス:
//! - `grpc.health.v1.Health`: デーモンが定期的にセッションの生存を確認する
//! - `moby.filesync.v1.Auth`: レジストリ認証（[`AuthService`] に橋渡し）
//! - `moby.filesync.v1.FileSync`: ローカルディレクトリの転送

mod auth;
mod filesync;

use crate::auth::AuthService;
use crate::error::{BuildError, Result};
use crate::proto::grpc::health::v1::health_server::{Health, HealthServer};
use crate::proto::grpc::health::v1::{
    HealthCheckRequest, HealthCheckResponse, health_check_response::ServingStatus,
};
use crate::proto::moby::buildkit::v1::BytesMessage;
use crate::proto::moby::buildkit::v1::control_client::ControlClient;
use crate::proto::moby::filesync::v1::auth_server::AuthServer;
use crate::proto::moby::filesync::v1::file_sync_server::FileSyncServer;
use auth::AuthBridge;
use filesync::FileSyncService;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tonic::metadata::{Ascii, MetadataValue};
use tonic::transport::{Channel, Server};
use tonic::{Request, Response, Status, Streaming};

pub(crate) const HEADER_SESSION_ID: &str = "x-docker-expose-session-uuid";
pub(crate) const HEADER_SESSION_NAME: &str = "x-docker-expose-session-name";
pub(crate) const HEADER_SESSION_SHARED_KEY: &str = "x-docker-expose-session-sharedkey";
pub(crate) const HEADER_SESSION_METHOD: &str = "x-docker-expose-session-grpc-method";

const HEALTH_CHECK_METHOD: &str = "/grpc.health.v1.Health/Check";
const DIFF_COPY_METHOD: &str = "/moby.filesync.v1.FileSync/DiffCopy";
const AUTH_METHODS: &[&str] = &[
    "/moby.filesync.v1.Auth/Credentials",
    "/moby.filesync.v1.Auth/FetchToken",
    "/moby.filesync.v1.Auth/GetTokenAuthority",
    "/moby.filesync.v1.Auth/VerifyTokenAuthority",
];

/// トンネルの1メッセージあたりの最大サイズ
const TUNNEL_CHUNK: usize = 32 * 1024;
const TUNNEL_BUFFER: usize = 64 * 1024;
const TUNNEL_MESSAGES: usize = 16;

/// 1回の solve に対応するセッション
pub struct Session {
    id: String,
    name: String,
    shared_key: String,
    auth: Vec<Arc<dyn AuthService>>,
    local_dirs: BTreeMap<String, PathBuf>,
}

impl Session {
    pub fn new(
        name: &str,
        auth: Vec<Arc<dyn AuthService>>,
        local_dirs: BTreeMap<String, PathBuf>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().simple().to_string(),
            name: name.to_string(),
            shared_key: name.to_string(),
            auth,
            local_dirs,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// デーモンに公開する gRPC メソッド
    fn methods(&self) -> Vec<&'static str> {
        let mut methods = vec![HEALTH_CHECK_METHOD];
        if !self.auth.is_empty() {
            methods.extend_from_slice(AUTH_METHODS);
        }
        if !self.local_dirs.is_empty() {
            methods.push(DIFF_COPY_METHOD);
        }
        methods
    }

    fn apply_headers<T>(&self, request: &mut Request<T>) -> Result<()> {
        let value = |text: &str| {
            text.parse::<MetadataValue<Ascii>>()
                .map_err(|e| BuildError::Session(format!("invalid header {:?}: {}", text, e)))
        };

        let metadata = request.metadata_mut();
        metadata.insert(HEADER_SESSION_ID, value(&self.id)?);
        metadata.insert(HEADER_SESSION_NAME, value(&self.name)?);
        metadata.insert(HEADER_SESSION_SHARED_KEY, value(&self.shared_key)?);
        for method in self.methods() {
            metadata.append(HEADER_SESSION_METHOD, value(method)?);
        }
        Ok(())
    }

    /// `Control.Session` を開いてセッションサーバーを起動
    ///
    /// 返された [`SessionHandle`] を破棄するとセッションも閉じる。
    pub(crate) async fn start(self, control: &mut ControlClient<Channel>) -> Result<SessionHandle> {
        let (tx, rx) = mpsc::channel(TUNNEL_MESSAGES);
        let mut request = Request::new(ReceiverStream::new(rx));
        self.apply_headers(&mut request)?;

        tracing::debug!(
            "Opening session {} ({})",
            self.id,
            self.methods().join(", ")
        );

        let inbound = control
            .session(request)
            .await
            .map_err(|status| BuildError::Session(status.message().to_string()))?
            .into_inner();

        let (io, mut tasks) = hijack(inbound, tx);
        tasks.push(self.spawn_server(io));
        Ok(SessionHandle { tasks })
    }

    /// `io` の上でセッションの gRPC サーバーを動かす
    pub(crate) fn spawn_server(self, io: DuplexStream) -> JoinHandle<()> {
        let id = self.id.clone();
        let auth = (!self.auth.is_empty()).then(|| AuthServer::new(AuthBridge::new(self.auth)));
        let filesync = (!self.local_dirs.is_empty())
            .then(|| FileSyncServer::new(FileSyncService::new(self.local_dirs)));

        let router = Server::builder()
            .add_service(HealthServer::new(HealthCheck))
            .add_optional_service(auth)
            .add_optional_service(filesync);

        // 受け付ける接続はトンネルの1本だけ。ストリームを終わらせないことで
        // サーバーが接続を閉じないようにする
        let incoming =
            tokio_stream::once(Ok::<_, std::io::Error>(io)).chain(tokio_stream::pending());

        tokio::spawn(async move {
            if let Err(e) = router.serve_with_incoming(incoming).await {
                tracing::warn!("Session {} server stopped: {}", id, e);
            }
        })
    }
}

/// 実行中のセッション
///
/// 破棄するとトンネルとサーバーのタスクを止める
pub(crate) struct SessionHandle {
    tasks: Vec<JoinHandle<()>>,
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// `Control.Session` のメッセージストリームを双方向のバイトストリームに変換
///
/// 戻り値の `DuplexStream` に書いたバイトは `outbound` へ送られ、`inbound` に届いた
/// バイトはそこから読める。
pub(crate) fn hijack(
    mut inbound: Streaming<BytesMessage>,
    outbound: mpsc::Sender<BytesMessage>,
) -> (DuplexStream, Vec<JoinHandle<()>>) {
    let (local, remote) = tokio::io::duplex(TUNNEL_BUFFER);
    let (mut remote_read, mut remote_write) = tokio::io::split(remote);

    let receive = tokio::spawn(async move {
        loop {
            match inbound.message().await {
                Ok(Some(message)) => {
                    if remote_write.write_all(&message.data).await.is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(status) => {
                    tracing::debug!("Session stream closed: {}", status.message());
                    break;
                }
            }
        }
        let _ = remote_write.shutdown().await;
    });

    let send = tokio::spawn(async move {
        let mut buf = vec![0u8; TUNNEL_CHUNK];
        loop {
            match remote_read.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    let message = BytesMessage {
                        data: buf[..n].to_vec(),
                    };
                    if outbound.send(message).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    (local, vec![receive, send])
}

/// セッションのヘルスチェック
struct HealthCheck;

#[tonic::async_trait]
impl Health for HealthCheck {
    async fn check(
        &self,
        _request: Request<HealthCheckRequest>,
    ) -> std::result::Result<Response<HealthCheckResponse>, Status> {
        Ok(Response::new(HealthCheckResponse {
            status: ServingStatus::Serving as i32,
        }))
    }
}
