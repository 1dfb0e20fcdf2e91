//! BuildKit デーモンへの接続
//!
//! `tcp://` と `unix://` は直接接続し、`docker-container://`・`kube-pod://`・`ssh://` は
//! ヘルパーコマンドで `buildctl dial-stdio` を実行してその標準入出力を接続として使います。

use crate::error::{BuildError, Result};
use hyper_util::rt::TokioIo;
use std::io;
use std::path::PathBuf;
use std::pin::Pin;
use std::process::Stdio;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tonic::transport::{Channel, Endpoint, Uri};
use tower::service_fn;
use url::Url;

/// 受け付けるアドレスのスキーム
pub const SUPPORTED_SCHEMES: &[&str] = &["tcp", "unix", "ssh", "docker-container", "kube-pod"];

// tonic が要求する URI。unix ソケットとヘルパー経由の接続では使われない
const PLACEHOLDER_URI: &str = "http://buildkitd";

/// 解析済みの BuildKit アドレス
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuilderAddress {
    Tcp { host: String, port: u16 },
    Unix(PathBuf),
    /// `program args...` の標準入出力を接続として使う
    Stdio { program: String, args: Vec<String> },
}

impl BuilderAddress {
    pub fn parse(address: &str) -> Result<Self> {
        let invalid = |reason: &str| {
            BuildError::InvalidBuilderAddress(format!("{} ({})", address, reason))
        };

        let Some((scheme, rest)) = address.split_once("://") else {
            return Err(invalid(
                "expected <scheme>://..., e.g. unix:///run/buildkit/buildkitd.sock",
            ));
        };
        if !SUPPORTED_SCHEMES.contains(&scheme) {
            return Err(invalid(&format!(
                "supported schemes: {}",
                SUPPORTED_SCHEMES.join(", ")
            )));
        }
        if rest.is_empty() {
            return Err(invalid("missing target after scheme"));
        }

        if scheme == "unix" {
            return Ok(BuilderAddress::Unix(PathBuf::from(rest)));
        }

        let url = Url::parse(address).map_err(|e| invalid(&e.to_string()))?;
        let host = url
            .host_str()
            .filter(|host| !host.is_empty())
            .ok_or_else(|| invalid("missing host"))?
            .to_string();

        match scheme {
            "tcp" => {
                let port = url.port().ok_or_else(|| invalid("missing port"))?;
                Ok(BuilderAddress::Tcp { host, port })
            }
            "docker-container" => Ok(BuilderAddress::stdio(
                "docker",
                ["exec", "-i", host.as_str(), "buildctl", "dial-stdio"],
            )),
            "kube-pod" => {
                let mut args = Vec::new();
                let mut container = None;
                for (key, value) in url.query_pairs() {
                    match key.as_ref() {
                        "context" => args.extend(["--context".to_string(), value.into_owned()]),
                        "namespace" => {
                            args.extend(["--namespace".to_string(), value.into_owned()])
                        }
                        "container" => container = Some(value.into_owned()),
                        _ => tracing::debug!("Ignoring kube-pod parameter: {}", key),
                    }
                }
                args.extend(["exec".to_string(), "-i".to_string(), host]);
                if let Some(container) = container {
                    args.extend(["-c".to_string(), container]);
                }
                args.extend(["--", "buildctl", "dial-stdio"].map(String::from));
                Ok(BuilderAddress::Stdio {
                    program: "kubectl".to_string(),
                    args,
                })
            }
            "ssh" => {
                let mut args = Vec::new();
                if !url.username().is_empty() {
                    args.extend(["-l".to_string(), url.username().to_string()]);
                }
                if let Some(port) = url.port() {
                    args.extend(["-p".to_string(), port.to_string()]);
                }
                args.push(host);
                args.extend(["--", "buildctl", "dial-stdio"].map(String::from));
                Ok(BuilderAddress::Stdio {
                    program: "ssh".to_string(),
                    args,
                })
            }
            other => Err(invalid(&format!("unsupported scheme {}", other))),
        }
    }

    fn stdio<'a>(program: &str, args: impl IntoIterator<Item = &'a str>) -> Self {
        BuilderAddress::Stdio {
            program: program.to_string(),
            args: args.into_iter().map(String::from).collect(),
        }
    }

    /// 接続に必要な外部コマンド
    pub fn helper_program(&self) -> Option<&str> {
        match self {
            BuilderAddress::Stdio { program, .. } => Some(program),
            _ => None,
        }
    }

    /// gRPC チャネルを作成
    ///
    /// 接続は最初のリクエスト時に確立する
    pub fn channel(&self) -> Result<Channel> {
        match self {
            BuilderAddress::Tcp { host, port } => {
                Ok(Endpoint::from_shared(format!("http://{}:{}", host, port))?.connect_lazy())
            }
            BuilderAddress::Unix(path) => unix_channel(path.clone()),
            BuilderAddress::Stdio { program, args } => {
                let program = program.clone();
                let args = args.clone();
                let connector = service_fn(move |_: Uri| {
                    let stream = StdioStream::spawn(&program, &args).map(TokioIo::new);
                    async move { stream }
                });
                Ok(Endpoint::from_static(PLACEHOLDER_URI).connect_with_connector_lazy(connector))
            }
        }
    }
}

#[cfg(unix)]
fn unix_channel(path: PathBuf) -> Result<Channel> {
    use tokio::net::UnixStream;

    let connector = service_fn(move |_: Uri| {
        let path = path.clone();
        async move { Ok::<_, io::Error>(TokioIo::new(UnixStream::connect(path).await?)) }
    });
    Ok(Endpoint::from_static(PLACEHOLDER_URI).connect_with_connector_lazy(connector))
}

#[cfg(not(unix))]
fn unix_channel(path: PathBuf) -> Result<Channel> {
    Err(BuildError::InvalidBuilderAddress(format!(
        "unix://{} (unix sockets are not supported on this platform)",
        path.display()
    )))
}

/// ヘルパーコマンドが PATH にあるか確認
pub(crate) async fn ensure_installed(program: &str) -> Result<()> {
    let installed = Command::new("which")
        .arg(program)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .map(|status| status.success())
        .unwrap_or(false);

    if !installed {
        return Err(BuildError::EngineUnavailable(format!(
            "{} is not installed",
            program
        )));
    }
    Ok(())
}

/// ヘルパープロセスの標準入出力をまとめた接続
struct StdioStream {
    _child: Child,
    stdin: ChildStdin,
    stdout: ChildStdout,
}

impl StdioStream {
    fn spawn(program: &str, args: &[String]) -> io::Result<Self> {
        tracing::debug!("Running: {} {}", program, args.join(" "));

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| io::Error::other("helper stdin is not piped"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::other("helper stdout is not piped"))?;

        Ok(Self {
            _child: child,
            stdin,
            stdout,
        })
    }
}

impl AsyncRead for StdioStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stdout).poll_read(cx, buf)
    }
}

impl AsyncWrite for StdioStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stdin).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stdin).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stdin).poll_shutdown(cx)
    }
}
