//! ビルド進捗の表示
//!
//! BuildKit が発行する状態更新を、発行順のまま1つのシンクへ流します。

use crate::error::{BuildError, Result};
use crate::proto::moby::buildkit::v1 as pb;
use chrono::{DateTime, Utc};
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use std::collections::HashSet;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// `Control.Status` ストリームの1回分の状態更新
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SolveStatus {
    pub vertexes: Vec<Vertex>,
    pub statuses: Vec<VertexStatus>,
    pub logs: Vec<VertexLog>,
    pub warnings: Vec<VertexWarning>,
}

/// ビルドグラフの1ステップ
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Vertex {
    pub digest: String,
    pub name: String,
    pub started: Option<DateTime<Utc>>,
    pub completed: Option<DateTime<Utc>>,
    pub cached: bool,
    pub error: String,
}

impl Vertex {
    pub fn is_completed(&self) -> bool {
        self.completed.is_some()
    }

    /// 完了までにかかった時間
    pub fn duration(&self) -> Option<Duration> {
        let elapsed = self.completed? - self.started?;
        elapsed.to_std().ok()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct VertexStatus {
    pub id: String,
    pub vertex: String,
    pub name: String,
    pub total: i64,
    pub current: i64,
    pub completed: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct VertexLog {
    pub vertex: String,
    /// 1: stdout, 2: stderr
    pub stream: i64,
    pub data: Vec<u8>,
}

impl VertexLog {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.data).into_owned()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct VertexWarning {
    pub vertex: String,
    pub level: i64,
    pub short: Vec<u8>,
}

impl VertexWarning {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.short).into_owned()
    }
}

fn timestamp(ts: Option<prost_types::Timestamp>) -> Option<DateTime<Utc>> {
    let ts = ts?;
    DateTime::from_timestamp(ts.seconds, u32::try_from(ts.nanos).ok()?)
}

impl From<pb::StatusResponse> for SolveStatus {
    fn from(response: pb::StatusResponse) -> Self {
        Self {
            vertexes: response.vertexes.into_iter().map(Vertex::from).collect(),
            statuses: response
                .statuses
                .into_iter()
                .map(VertexStatus::from)
                .collect(),
            logs: response.logs.into_iter().map(VertexLog::from).collect(),
            warnings: response
                .warnings
                .into_iter()
                .map(VertexWarning::from)
                .collect(),
        }
    }
}

impl From<pb::Vertex> for Vertex {
    fn from(vertex: pb::Vertex) -> Self {
        Self {
            digest: vertex.digest,
            name: vertex.name,
            started: timestamp(vertex.started),
            completed: timestamp(vertex.completed),
            cached: vertex.cached,
            error: vertex.error,
        }
    }
}

impl From<pb::VertexStatus> for VertexStatus {
    fn from(status: pb::VertexStatus) -> Self {
        Self {
            id: status.id,
            vertex: status.vertex,
            name: status.name,
            total: status.total,
            current: status.current,
            completed: timestamp(status.completed),
        }
    }
}

impl From<pb::VertexLog> for VertexLog {
    fn from(log: pb::VertexLog) -> Self {
        Self {
            vertex: log.vertex,
            stream: log.stream,
            data: log.msg,
        }
    }
}

impl From<pb::VertexWarning> for VertexWarning {
    fn from(warning: pb::VertexWarning) -> Self {
        Self {
            vertex: warning.vertex,
            level: warning.level,
            short: warning.short,
        }
    }
}

/// 進捗イベントの表示先
pub trait ProgressSink: Send {
    /// 状態更新を1件表示する。エラーを返すとビルド全体が中断される
    fn render(&mut self, status: &SolveStatus) -> Result<()>;

    /// 表示を終了
    fn finish(&mut self, succeeded: bool);
}

/// ターミナル向けの進捗表示
pub struct ConsoleProgress {
    progress_bar: ProgressBar,
    completed: HashSet<String>,
    failed: HashSet<String>,
}

impl ConsoleProgress {
    pub fn new(image: &str) -> Result<Self> {
        let pb = ProgressBar::new_spinner();
        pb.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.green} [{elapsed_precise}] {msg}")
                .map_err(|e| BuildError::ProgressFailed(e.to_string()))?,
        );
        pb.set_message(format!("Building {}...", image));
        pb.enable_steady_tick(Duration::from_millis(100));

        Ok(Self {
            progress_bar: pb,
            completed: HashSet::new(),
            failed: HashSet::new(),
        })
    }

    fn render_vertex(&mut self, vertex: &Vertex) {
        if vertex.name.is_empty() {
            return;
        }

        if !vertex.error.is_empty() {
            if self.failed.insert(vertex.digest.clone()) {
                self.progress_bar.println(format!(
                    "  {} {}: {}",
                    "✗".red(),
                    vertex.name,
                    vertex.error.red()
                ));
            }
            return;
        }

        if vertex.is_completed() {
            if self.completed.insert(vertex.digest.clone()) {
                let suffix = if vertex.cached {
                    " (cached)".dimmed().to_string()
                } else if let Some(duration) = vertex.duration() {
                    format!(" {:.1}s", duration.as_secs_f64()).dimmed().to_string()
                } else {
                    String::new()
                };
                self.progress_bar
                    .println(format!("  {} {}{}", "✓".green(), vertex.name, suffix));
            }
        } else if vertex.started.is_some() {
            self.progress_bar.set_message(vertex.name.clone());
        }
    }
}

impl ProgressSink for ConsoleProgress {
    fn render(&mut self, status: &SolveStatus) -> Result<()> {
        for vertex in &status.vertexes {
            self.render_vertex(vertex);
        }
        for log in &status.logs {
            for line in log.text().lines() {
                self.progress_bar
                    .println(format!("    {} {}", "│".dimmed(), line.dimmed()));
            }
        }
        for warning in &status.warnings {
            self.progress_bar
                .println(format!("  {} {}", "⚠".yellow(), warning.text().yellow()));
        }
        Ok(())
    }

    fn finish(&mut self, succeeded: bool) {
        if succeeded {
            self.progress_bar
                .finish_with_message(format!("{} Build completed", "✓".green()));
        } else {
            self.progress_bar
                .abandon_with_message(format!("{} Build failed", "✗".red()));
        }
    }
}

/// チャネルが閉じるまで状態更新をシンクへ流す
///
/// `cancel` がキャンセルされると未読の更新を残して `Cancelled` を返す。
pub async fn display_progress(
    mut rx: mpsc::Receiver<SolveStatus>,
    sink: &mut dyn ProgressSink,
    cancel: &CancellationToken,
) -> Result<()> {
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(BuildError::Cancelled),
            status = rx.recv() => match status {
                Some(status) => sink.render(&status)?,
                None => return Ok(()),
            },
        }
    }
}
