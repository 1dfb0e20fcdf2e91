//! ビルドとプッシュの実行
//!
//! solve と進捗表示を1つのキャンセルスコープで並行に実行し、
//! どちらかが失敗した時点でもう一方を止めて最初のエラーを返します。

use crate::auth::AuthService;
use crate::descriptor::ImageDescriptor;
use crate::error::{BuildError, Result};
use crate::options::BuildSpec;
use crate::progress::{ProgressSink, display_progress};
use crate::solve::{BuildEngine, SolveRequest};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// 進捗チャネルのデフォルトのバッファ
const DEFAULT_PROGRESS_BUFFER: usize = 64;

pub struct BuildOrchestrator<E> {
    engine: E,
    progress_buffer: usize,
}

impl<E: BuildEngine> BuildOrchestrator<E> {
    pub fn new(engine: E) -> Self {
        Self {
            engine,
            progress_buffer: DEFAULT_PROGRESS_BUFFER,
        }
    }

    /// 進捗チャネルのバッファサイズを変更
    pub fn with_progress_buffer(mut self, size: usize) -> Self {
        self.progress_buffer = size.max(1);
        self
    }

    /// イメージをビルドしてレジストリにプッシュ
    ///
    /// 成功時はプッシュしたイメージのディスクリプタを返す。
    pub async fn build(
        &self,
        spec: &BuildSpec,
        auth: Arc<dyn AuthService>,
        sink: &mut dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<ImageDescriptor> {
        tracing::info!(
            "Building {} for {} with {}",
            spec.tag,
            spec.arch.platform(),
            spec.frontend.id()
        );

        let request = SolveRequest::for_build(spec, auth);
        let descriptor = self.run(request, sink, cancel).await?;

        tracing::info!("Pushed {} ({})", spec.tag, descriptor.digest);
        Ok(descriptor)
    }

    /// solve リクエストを実行
    pub async fn run(
        &self,
        request: SolveRequest,
        sink: &mut dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<ImageDescriptor> {
        let scope = cancel.child_token();
        let (tx, rx) = mpsc::channel(self.progress_buffer);

        let solve = async {
            let result = tokio::select! {
                biased;
                _ = scope.cancelled() => Err(BuildError::Cancelled),
                result = self.engine.solve(request, tx) => result,
            };
            if let Err(e) = &result {
                tracing::debug!("Solve failed, cancelling progress display: {}", e);
                scope.cancel();
            }
            result
        };

        let display = async {
            let result = display_progress(rx, &mut *sink, &scope).await;
            if let Err(e) = &result {
                tracing::debug!("Progress display failed, cancelling solve: {}", e);
                scope.cancel();
            }
            result
        };

        let result = tokio::try_join!(solve, display);
        sink.finish(result.is_ok());

        let (response, ()) = result?;
        ImageDescriptor::from_response(&response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AuthSession;
    use crate::descriptor::{DESCRIPTOR_KEY, DIGEST_KEY};
    use crate::options::{Architecture, Frontend};
    use crate::progress::{SolveStatus, Vertex};
    use crate::solve::SolveResponse;
    use async_trait::async_trait;
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use ecrflow_cloud_aws::Credentials;
    use std::collections::HashMap;
    use std::path::PathBuf;
    use std::time::Duration;

    fn spec() -> BuildSpec {
        let registry =
            ecrflow_registry::resolve("123456789012.dkr.ecr.us-east-1.amazonaws.com/myrepo/app")
                .unwrap();
        BuildSpec {
            tag: registry.tag("abcd1234"),
            registry,
            region: "us-east-1".to_string(),
            source_dir: PathBuf::from("/work/tmp/abcd1234"),
            dockerfile: PathBuf::from("Dockerfile"),
            arch: Architecture::Amd64,
            frontend: Frontend::Dockerfile,
        }
    }

    fn auth(spec: &BuildSpec) -> Arc<dyn AuthService> {
        Arc::new(AuthSession::new(
            Credentials::new("AWS", "secret"),
            spec.registry.clone(),
        ))
    }

    fn pushed(digest: &str) -> SolveResponse {
        let descriptor = format!(
            r#"{{"mediaType":"application/vnd.oci.image.index.v1+json","digest":"{}","size":512}}"#,
            digest
        );
        SolveResponse {
            exporter_response: HashMap::from([
                (DIGEST_KEY.to_string(), digest.to_string()),
                (DESCRIPTOR_KEY.to_string(), STANDARD.encode(descriptor)),
            ]),
        }
    }

    fn steps(n: usize) -> Vec<SolveStatus> {
        (0..n)
            .map(|i| SolveStatus {
                vertexes: vec![Vertex {
                    digest: format!("sha256:{}", i),
                    name: format!("step {}", i),
                    ..Default::default()
                }],
                ..Default::default()
            })
            .collect()
    }

    /// 決められたイベントを送ってから結果を返すエンジン
    struct ScriptedEngine {
        events: Vec<SolveStatus>,
        outcome: std::result::Result<SolveResponse, String>,
    }

    #[async_trait]
    impl BuildEngine for ScriptedEngine {
        async fn solve(
            &self,
            _request: SolveRequest,
            progress: mpsc::Sender<SolveStatus>,
        ) -> Result<SolveResponse> {
            for event in &self.events {
                progress
                    .send(event.clone())
                    .await
                    .map_err(|_| BuildError::Cancelled)?;
            }
            self.outcome.clone().map_err(BuildError::SolveFailed)
        }
    }

    /// イベントを送った後、完了しないエンジン
    struct HangingEngine {
        events: Vec<SolveStatus>,
    }

    #[async_trait]
    impl BuildEngine for HangingEngine {
        async fn solve(
            &self,
            _request: SolveRequest,
            progress: mpsc::Sender<SolveStatus>,
        ) -> Result<SolveResponse> {
            for event in &self.events {
                let _ = progress.send(event.clone()).await;
            }
            std::future::pending().await
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        events: Vec<SolveStatus>,
        fail_after: Option<usize>,
        finished: Option<bool>,
    }

    impl ProgressSink for RecordingSink {
        fn render(&mut self, status: &SolveStatus) -> Result<()> {
            if self.fail_after == Some(self.events.len()) {
                return Err(BuildError::ProgressFailed("terminal closed".to_string()));
            }
            self.events.push(status.clone());
            Ok(())
        }

        fn finish(&mut self, succeeded: bool) {
            self.finished = Some(succeeded);
        }
    }

    #[tokio::test]
    async fn test_build_success_preserves_progress_order() {
        let spec = spec();
        let orchestrator = BuildOrchestrator::new(ScriptedEngine {
            events: steps(100),
            outcome: Ok(pushed("sha256:abc")),
        })
        .with_progress_buffer(1);
        let mut sink = RecordingSink::default();

        let descriptor = orchestrator
            .build(&spec, auth(&spec), &mut sink, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(descriptor.digest, "sha256:abc");
        assert_eq!(descriptor.size, 512);
        assert_eq!(sink.events, steps(100));
        assert_eq!(sink.finished, Some(true));
    }

    #[tokio::test]
    async fn test_solve_failure_is_returned() {
        let spec = spec();
        let orchestrator = BuildOrchestrator::new(ScriptedEngine {
            events: steps(3),
            outcome: Err("RUN make: exit code: 2".to_string()),
        });
        let mut sink = RecordingSink::default();

        let err = orchestrator
            .build(&spec, auth(&spec), &mut sink, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            BuildError::SolveFailed(ref msg) if msg == "RUN make: exit code: 2"
        ));
        assert_eq!(sink.finished, Some(false));
    }

    #[tokio::test]
    async fn test_progress_failure_stops_hanging_solve() {
        let spec = spec();
        let orchestrator = BuildOrchestrator::new(HangingEngine { events: steps(5) });
        let mut sink = RecordingSink {
            fail_after: Some(2),
            ..Default::default()
        };

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            orchestrator.build(&spec, auth(&spec), &mut sink, &CancellationToken::new()),
        )
        .await
        .expect("orchestrator did not stop after progress failure");

        assert!(matches!(result, Err(BuildError::ProgressFailed(_))));
        assert_eq!(sink.events, steps(2));
        assert_eq!(sink.finished, Some(false));
    }

    #[tokio::test]
    async fn test_external_cancellation_stops_both_branches() {
        let spec = spec();
        let orchestrator = BuildOrchestrator::new(HangingEngine { events: steps(1) });
        let mut sink = RecordingSink::default();

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            orchestrator.build(&spec, auth(&spec), &mut sink, &cancel),
        )
        .await
        .expect("orchestrator did not observe cancellation");

        assert!(matches!(result, Err(BuildError::Cancelled)));
        assert_eq!(sink.finished, Some(false));
    }

    #[tokio::test]
    async fn test_build_scope_does_not_cancel_parent() {
        let spec = spec();
        let orchestrator = BuildOrchestrator::new(ScriptedEngine {
            events: vec![],
            outcome: Err("boom".to_string()),
        });
        let cancel = CancellationToken::new();

        let _ = orchestrator
            .build(&spec, auth(&spec), &mut RecordingSink::default(), &cancel)
            .await;
        assert!(!cancel.is_cancelled());
    }

    #[tokio::test]
    async fn test_undecodable_descriptor_after_push() {
        let spec = spec();
        let mut response = pushed("sha256:abc");
        response
            .exporter_response
            .insert(DESCRIPTOR_KEY.to_string(), "not base64!".to_string());
        let orchestrator = BuildOrchestrator::new(ScriptedEngine {
            events: steps(1),
            outcome: Ok(response),
        });
        let mut sink = RecordingSink::default();

        let err = orchestrator
            .build(&spec, auth(&spec), &mut sink, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            BuildError::Descriptor { ref digest, .. } if digest == "sha256:abc"
        ));
        assert_eq!(sink.finished, Some(true));
    }

    #[tokio::test]
    async fn test_shared_engine() {
        let spec = spec();
        let engine: Arc<dyn BuildEngine> = Arc::new(ScriptedEngine {
            events: steps(2),
            outcome: Ok(pushed("sha256:def")),
        });
        let orchestrator = BuildOrchestrator::new(engine);

        let descriptor = orchestrator
            .build(
                &spec,
                auth(&spec),
                &mut RecordingSink::default(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(descriptor.digest, "sha256:def");
    }
}
