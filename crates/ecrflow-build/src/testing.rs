//! テスト用の BuildKit デーモン
//!
//! unix ソケットで `moby.buildkit.v1.Control` を提供し、solve の間にセッション経由で
//! 認証・ファイル転送・ヘルスチェックを呼び出して結果を記録します。

use crate::proto::fsutil::types::Packet;
use crate::proto::fsutil::types::packet::PacketType;
use crate::proto::grpc::health::v1::HealthCheckRequest;
use crate::proto::grpc::health::v1::health_client::HealthClient;
use crate::proto::moby::buildkit::v1::control_server::{Control, ControlServer};
use crate::proto::moby::buildkit::v1::{
    BytesMessage, ListWorkersRequest, ListWorkersResponse, Platform, SolveRequest, SolveResponse,
    StatusRequest, StatusResponse, Vertex, WorkerRecord,
};
use crate::proto::moby::filesync::v1::auth_client::AuthClient;
use crate::proto::moby::filesync::v1::file_sync_client::FileSyncClient;
use crate::proto::moby::filesync::v1::{CredentialsRequest, CredentialsResponse, FetchTokenRequest};
use crate::session::{HEADER_SESSION_ID, HEADER_SESSION_METHOD, hijack};
use hyper_util::rt::TokioIo;
use std::collections::{BTreeMap, HashMap};
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::DuplexStream;
use tokio::net::UnixListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::{ReceiverStream, UnixListenerStream};
use tokio_stream::{Stream, StreamExt};
use tonic::transport::{Channel, Endpoint, Server, Uri};
use tonic::{Code, Request, Response, Status, Streaming};
use tower::service_fn;

/// 既に確立した IO を1回だけ使うクライアントチャネル
pub(crate) fn duplex_channel(io: DuplexStream) -> Channel {
    let mut io = Some(io);
    Endpoint::from_static("http://session").connect_with_connector_lazy(service_fn(
        move |_: Uri| {
            let io = io.take();
            async move {
                io.map(TokioIo::new).ok_or_else(|| {
                    std::io::Error::other("session connection was already used")
                })
            }
        },
    ))
}

/// デーモン側として `DiffCopy` を実行し、ファイル本文を受け取る
///
/// ディレクトリは空の本文で記録する
pub(crate) async fn receive_dir(
    channel: Channel,
    dir_name: &str,
    headers: &[(&'static str, &str)],
) -> Result<BTreeMap<String, Vec<u8>>, Status> {
    let (tx, rx) = mpsc::channel(16);
    let mut request = Request::new(ReceiverStream::new(rx));
    request
        .metadata_mut()
        .insert("dir-name", dir_name.parse().unwrap());
    for (key, value) in headers {
        request.metadata_mut().append(*key, value.parse().unwrap());
    }

    let mut inbound = FileSyncClient::new(channel)
        .diff_copy(request)
        .await?
        .into_inner();

    let mut stats = Vec::new();
    loop {
        let packet = inbound.message().await?.expect("stream ended before stats");
        assert_eq!(packet.r#type, PacketType::PacketStat as i32);
        match packet.stat {
            Some(stat) => stats.push(stat),
            None => break,
        }
    }

    let mut files = BTreeMap::new();
    for (id, stat) in stats.iter().enumerate() {
        if stat.mode & ((1 << 31) | (1 << 27)) != 0 {
            files.insert(stat.path.clone(), Vec::new());
            continue;
        }
        tx.send(Packet {
            r#type: PacketType::PacketReq as i32,
            id: id as u32,
            ..Default::default()
        })
        .await
        .unwrap();

        let mut data = Vec::new();
        loop {
            let packet = inbound.message().await?.expect("stream ended in file data");
            assert_eq!(packet.r#type, PacketType::PacketData as i32);
            assert_eq!(packet.id, id as u32);
            if packet.data.is_empty() {
                break;
            }
            data.extend(packet.data);
        }
        files.insert(stat.path.clone(), data);
    }

    tx.send(Packet {
        r#type: PacketType::PacketFin as i32,
        ..Default::default()
    })
    .await
    .unwrap();
    let fin = inbound.message().await?.expect("stream ended before fin");
    assert_eq!(fin.r#type, PacketType::PacketFin as i32);

    Ok(files)
}

/// solve の間にセッション経由で観測した内容
#[derive(Debug, Clone)]
pub(crate) struct SessionReport {
    pub methods: Vec<String>,
    pub registry_credentials: CredentialsResponse,
    pub other_credentials: CredentialsResponse,
    pub fetch_token: Code,
    pub context: BTreeMap<String, Vec<u8>>,
}

#[derive(Default)]
pub(crate) struct DaemonState {
    sessions: Mutex<HashMap<String, (Channel, Vec<String>)>>,
    pub solves: Mutex<Vec<SolveRequest>>,
    pub reports: Mutex<Vec<SessionReport>>,
}

/// solve の結果
#[derive(Clone)]
pub(crate) enum Outcome {
    Push(HashMap<String, String>),
    Fail(String),
}

struct FakeControl {
    registry_host: String,
    outcome: Outcome,
    state: Arc<DaemonState>,
}

impl FakeControl {
    async fn wait_for_session(&self, id: &str) -> Result<(Channel, Vec<String>), Status> {
        for _ in 0..200 {
            if let Some(session) = self.state.sessions.lock().unwrap().get(id) {
                return Ok(session.clone());
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        Err(Status::not_found(format!("no active session for {}", id)))
    }

    async fn exercise(&self, channel: Channel, methods: Vec<String>) -> SessionReport {
        HealthClient::new(channel.clone())
            .check(HealthCheckRequest::default())
            .await
            .unwrap();

        let mut auth = AuthClient::new(channel.clone());
        let registry_credentials = auth
            .credentials(CredentialsRequest {
                host: self.registry_host.clone(),
            })
            .await
            .unwrap()
            .into_inner();
        let other_credentials = auth
            .credentials(CredentialsRequest {
                host: "docker.io".to_string(),
            })
            .await
            .unwrap()
            .into_inner();
        let fetch_token = match auth
            .fetch_token(FetchTokenRequest {
                host: self.registry_host.clone(),
                ..Default::default()
            })
            .await
        {
            Ok(_) => Code::Ok,
            Err(status) => status.code(),
        };

        let context = receive_dir(channel, "context", &[]).await.unwrap();

        SessionReport {
            methods,
            registry_credentials,
            other_credentials,
            fetch_token,
            context,
        }
    }
}

type ResponseStream<T> = Pin<Box<dyn Stream<Item = Result<T, Status>> + Send>>;

#[tonic::async_trait]
impl Control for FakeControl {
    async fn solve(
        &self,
        request: Request<SolveRequest>,
    ) -> Result<Response<SolveResponse>, Status> {
        let request = request.into_inner();
        self.state.solves.lock().unwrap().push(request.clone());

        let (channel, methods) = self.wait_for_session(&request.session).await?;
        let report = self.exercise(channel, methods).await;
        self.state.reports.lock().unwrap().push(report);

        match &self.outcome {
            Outcome::Push(exporter_response) => Ok(Response::new(SolveResponse {
                exporter_response: exporter_response.clone(),
            })),
            Outcome::Fail(message) => Err(Status::unknown(message.clone())),
        }
    }

    type StatusStream = ResponseStream<StatusResponse>;

    async fn status(
        &self,
        _request: Request<StatusRequest>,
    ) -> Result<Response<Self::StatusStream>, Status> {
        let updates = ["[1/2] FROM docker.io/library/alpine", "[2/2] COPY . /app"]
            .into_iter()
            .enumerate()
            .map(|(i, name)| {
                Ok(StatusResponse {
                    vertexes: vec![Vertex {
                        digest: format!("sha256:{}", i),
                        name: name.to_string(),
                        started: Some(prost_types::Timestamp {
                            seconds: 1_714_557_600,
                            nanos: 0,
                        }),
                        completed: Some(prost_types::Timestamp {
                            seconds: 1_714_557_601,
                            nanos: 0,
                        }),
                        ..Default::default()
                    }],
                    ..Default::default()
                })
            })
            .collect::<Vec<_>>();
        Ok(Response::new(Box::pin(tokio_stream::iter(updates))))
    }

    type SessionStream = ResponseStream<BytesMessage>;

    async fn session(
        &self,
        request: Request<Streaming<BytesMessage>>,
    ) -> Result<Response<Self::SessionStream>, Status> {
        let id = request
            .metadata()
            .get(HEADER_SESSION_ID)
            .and_then(|value| value.to_str().ok())
            .ok_or_else(|| Status::invalid_argument("missing session id"))?
            .to_string();
        let methods = request
            .metadata()
            .get_all(HEADER_SESSION_METHOD)
            .iter()
            .filter_map(|value| value.to_str().ok().map(String::from))
            .collect();

        let (tx, rx) = mpsc::channel(16);
        let (io, _tasks) = hijack(request.into_inner(), tx);
        self.state
            .sessions
            .lock()
            .unwrap()
            .insert(id, (duplex_channel(io), methods));

        Ok(Response::new(Box::pin(
            ReceiverStream::new(rx).map(Ok::<_, Status>),
        )))
    }

    async fn list_workers(
        &self,
        _request: Request<ListWorkersRequest>,
    ) -> Result<Response<ListWorkersResponse>, Status> {
        Ok(Response::new(ListWorkersResponse {
            record: vec![WorkerRecord {
                id: "fake".to_string(),
                platforms: vec![Platform {
                    architecture: "amd64".to_string(),
                    os: "linux".to_string(),
                    ..Default::default()
                }],
                ..Default::default()
            }],
        }))
    }
}

/// unix ソケットで待ち受けるテスト用デーモン
pub(crate) struct FakeDaemon {
    pub address: String,
    pub state: Arc<DaemonState>,
    _dir: TempDir,
    server: JoinHandle<()>,
}

impl FakeDaemon {
    pub(crate) fn start(registry_host: &str, outcome: Outcome) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("buildkitd.sock");
        let listener = UnixListener::bind(&socket).unwrap();
        let state = Arc::new(DaemonState::default());

        let control = FakeControl {
            registry_host: registry_host.to_string(),
            outcome,
            state: Arc::clone(&state),
        };
        let server = tokio::spawn(async move {
            Server::builder()
                .add_service(ControlServer::new(control))
                .serve_with_incoming(UnixListenerStream::new(listener))
                .await
                .unwrap();
        });

        Self {
            address: format!("unix://{}", socket.display()),
            state,
            _dir: dir,
            server,
        }
    }
}

impl Drop for FakeDaemon {
    fn drop(&mut self) {
        self.server.abort();
    }
}
