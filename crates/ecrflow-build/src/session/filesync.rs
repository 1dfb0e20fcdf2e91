//! ローカルディレクトリの転送（`moby.filesync.v1.FileSync/DiffCopy`）
//!
//! 送信側の手順:
//! 1. 全エントリの `PACKET_STAT` を深さ優先・名前順に送り、空の STAT で終わりを示す
//! 2. `PACKET_REQ{id}` を受けるたびにファイル本文を `PACKET_DATA` で送り、空の DATA で終える
//! 3. `PACKET_FIN` を受けたら FIN を返して終了する
//!
//! `id` は STAT を送った順番の番号です。

use crate::proto::fsutil::types::packet::PacketType;
use crate::proto::fsutil::types::{Packet, Stat};
use crate::proto::moby::filesync::v1::file_sync_server::FileSync;
use glob::{MatchOptions, Pattern};
use percent_encoding::percent_decode_str;
use std::collections::BTreeMap;
use std::fs::Metadata;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::UNIX_EPOCH;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::metadata::MetadataMap;
use tonic::{Request, Response, Status, Streaming};

const KEY_DIR_NAME: &str = "dir-name";
const KEY_INCLUDE_PATTERNS: &str = "include-patterns";
const KEY_EXCLUDE_PATTERNS: &str = "exclude-patterns";
const KEY_FOLLOW_PATHS: &str = "followpaths";

const DATA_CHUNK: usize = 32 * 1024;
const PACKET_BUFFER: usize = 16;

// Go の os.FileMode のビット
const MODE_DIR: u32 = 1 << 31;
const MODE_SYMLINK: u32 = 1 << 27;
const MODE_SETUID: u32 = 1 << 23;
const MODE_SETGID: u32 = 1 << 22;
const MODE_STICKY: u32 = 1 << 20;

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

/// 名前付きのローカルディレクトリを公開する FileSync サービス
pub(super) struct FileSyncService {
    dirs: Arc<BTreeMap<String, PathBuf>>,
}

impl FileSyncService {
    pub(super) fn new(dirs: BTreeMap<String, PathBuf>) -> Self {
        Self {
            dirs: Arc::new(dirs),
        }
    }
}

#[tonic::async_trait]
impl FileSync for FileSyncService {
    type DiffCopyStream = ReceiverStream<Result<Packet, Status>>;

    async fn diff_copy(
        &self,
        request: Request<Streaming<Packet>>,
    ) -> Result<Response<Self::DiffCopyStream>, Status> {
        let metadata = request.metadata();
        let dir_name = header_values(metadata, KEY_DIR_NAME)
            .into_iter()
            .next()
            .unwrap_or_default();
        let root = self
            .dirs
            .get(&dir_name)
            .cloned()
            .ok_or_else(|| Status::not_found(format!("no access allowed to dir {:?}", dir_name)))?;
        let filter = PathFilter::new(
            &header_values(metadata, KEY_INCLUDE_PATTERNS),
            &header_values(metadata, KEY_EXCLUDE_PATTERNS),
            &header_values(metadata, KEY_FOLLOW_PATHS),
        )?;

        tracing::debug!("Sending local dir {} from {}", dir_name, root.display());

        let inbound = request.into_inner();
        let (tx, rx) = mpsc::channel(PACKET_BUFFER);
        tokio::spawn(async move {
            if let Err(status) = send_dir(root, filter, inbound, &tx).await {
                tracing::debug!("Local dir {} transfer failed: {}", dir_name, status.message());
                let _ = tx.send(Err(status)).await;
            }
        });

        Ok(Response::new(ReceiverStream::new(rx)))
    }
}

/// メタデータの値を取り出す
///
/// `<key>-encoded: true` が付いていれば URL クエリ形式でデコードする
fn header_values(metadata: &MetadataMap, key: &str) -> Vec<String> {
    let encoded = metadata
        .get(format!("{}-encoded", key).as_str())
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| matches!(value, "1" | "t" | "T" | "true" | "TRUE" | "True"));

    metadata
        .get_all(key)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .map(|value| {
            if encoded {
                percent_decode_str(&value.replace('+', " "))
                    .decode_utf8_lossy()
                    .into_owned()
            } else {
                value.to_string()
            }
        })
        .collect()
}

/// 転送するエントリを選ぶフィルター
///
/// 除外パターンは `.dockerignore` と同じ規則（親ディレクトリへの一致も対象、`!` で例外、
/// 最後に一致したパターンが優先）で評価する。
#[derive(Debug, Default)]
struct PathFilter {
    includes: Vec<(String, Pattern)>,
    excludes: Vec<ExcludePattern>,
    has_exceptions: bool,
}

#[derive(Debug)]
struct ExcludePattern {
    pattern: Pattern,
    exception: bool,
}

#[derive(Debug, PartialEq, Eq)]
enum Visit {
    /// 送らず、子も見ない
    Skip,
    /// 自身は送らないが、子を調べる
    Descend,
    Emit,
}

fn clean_pattern(pattern: &str) -> String {
    pattern
        .trim()
        .split('/')
        .filter(|part| !part.is_empty() && *part != ".")
        .collect::<Vec<_>>()
        .join("/")
}

fn compile(pattern: &str) -> Result<Pattern, Status> {
    Pattern::new(pattern)
        .map_err(|e| Status::invalid_argument(format!("invalid pattern {:?}: {}", pattern, e)))
}

fn matches_path_or_parent(pattern: &Pattern, path: &str) -> bool {
    if pattern.matches_with(path, MATCH_OPTIONS) {
        return true;
    }
    let mut parent = path;
    while let Some((head, _)) = parent.rsplit_once('/') {
        if pattern.matches_with(head, MATCH_OPTIONS) {
            return true;
        }
        parent = head;
    }
    false
}

impl PathFilter {
    fn new(
        includes: &[String],
        excludes: &[String],
        follow_paths: &[String],
    ) -> Result<Self, Status> {
        let mut filter = PathFilter::default();

        if !includes.is_empty() {
            for include in includes.iter().chain(follow_paths) {
                let include = clean_pattern(include);
                if include.is_empty() {
                    // ルートそのものを含めるパターンは全体を対象にする
                    filter.includes.clear();
                    break;
                }
                let pattern = compile(&include)?;
                filter.includes.push((include, pattern));
            }
        }

        for exclude in excludes {
            let (exception, raw) = match exclude.trim().strip_prefix('!') {
                Some(rest) => (true, rest),
                None => (false, exclude.as_str()),
            };
            let cleaned = clean_pattern(raw);
            if cleaned.is_empty() {
                continue;
            }
            filter.has_exceptions |= exception;
            filter.excludes.push(ExcludePattern {
                pattern: compile(&cleaned)?,
                exception,
            });
        }

        Ok(filter)
    }

    fn is_excluded(&self, path: &str) -> bool {
        let mut excluded = false;
        for rule in &self.excludes {
            // 除外済みなら例外パターンだけ、未除外なら除外パターンだけ評価すればよい
            if rule.exception != excluded {
                continue;
            }
            if matches_path_or_parent(&rule.pattern, path) {
                excluded = !rule.exception;
            }
        }
        excluded
    }

    fn is_included(&self, path: &str) -> bool {
        self.includes.is_empty()
            || self
                .includes
                .iter()
                .any(|(_, pattern)| matches_path_or_parent(pattern, path))
    }

    /// ディレクトリの下にインクルードパターンに一致するパスがあり得るか
    fn may_contain_includes(&self, dir: &str) -> bool {
        self.includes.iter().any(|(include, _)| {
            let mut parts = include.split('/');
            for component in dir.split('/') {
                match parts.next() {
                    Some("**") => return true,
                    Some(part) => {
                        let matched = Pattern::new(part)
                            .map(|p| p.matches_with(component, MATCH_OPTIONS))
                            .unwrap_or(false);
                        if !matched {
                            return false;
                        }
                    }
                    None => return false,
                }
            }
            parts.next().is_some()
        })
    }

    fn visit(&self, path: &str, is_dir: bool) -> Visit {
        if self.is_excluded(path) {
            // 例外パターンで子が戻される可能性がある
            return if is_dir && self.has_exceptions {
                Visit::Descend
            } else {
                Visit::Skip
            };
        }
        if !self.is_included(path) {
            return if is_dir && self.may_contain_includes(path) {
                Visit::Descend
            } else {
                Visit::Skip
            };
        }
        Visit::Emit
    }
}

#[derive(Debug)]
struct Entry {
    stat: Stat,
    source: PathBuf,
}

impl Entry {
    fn is_regular_file(&self) -> bool {
        self.stat.mode & (MODE_DIR | MODE_SYMLINK) == 0
    }
}

/// `root` 以下を深さ優先・名前のバイト順で列挙
///
/// 送らないディレクトリの中に送るエントリがあれば、その親ディレクトリを先に並べる
fn walk(root: &Path, filter: &PathFilter) -> io::Result<Vec<Entry>> {
    let mut walker = Walker {
        filter,
        entries: Vec::new(),
        pending: Vec::new(),
    };
    walker.walk_dir(root, "")?;
    Ok(walker.entries)
}

struct Walker<'a> {
    filter: &'a PathFilter,
    entries: Vec<Entry>,
    /// まだ送っていない祖先ディレクトリ
    pending: Vec<Entry>,
}

impl Walker<'_> {
    fn walk_dir(&mut self, dir: &Path, prefix: &str) -> io::Result<()> {
        let mut children = std::fs::read_dir(dir)?.collect::<io::Result<Vec<_>>>()?;
        children.sort_by_key(|child| child.file_name());

        for child in children {
            let name = child.file_name().to_string_lossy().into_owned();
            let path = if prefix.is_empty() {
                name
            } else {
                format!("{}/{}", prefix, name)
            };
            let source = child.path();
            let metadata = std::fs::symlink_metadata(&source)?;
            let Some(stat) = stat_for(&path, &source, &metadata)? else {
                tracing::debug!("Skipping special file {}", path);
                continue;
            };

            let is_dir = metadata.is_dir();
            match self.filter.visit(&path, is_dir) {
                Visit::Skip => {}
                Visit::Emit => {
                    self.entries.append(&mut self.pending);
                    self.entries.push(Entry {
                        stat,
                        source: source.clone(),
                    });
                    if is_dir {
                        self.walk_dir(&source, &path)?;
                    }
                }
                Visit::Descend => {
                    let mark = self.pending.len();
                    self.pending.push(Entry {
                        stat,
                        source: source.clone(),
                    });
                    self.walk_dir(&source, &path)?;
                    self.pending.truncate(mark);
                }
            }
        }
        Ok(())
    }
}

fn stat_for(path: &str, source: &Path, metadata: &Metadata) -> io::Result<Option<Stat>> {
    let file_type = metadata.file_type();
    let mut stat = Stat {
        path: path.to_string(),
        mod_time: mod_time(metadata),
        ..Default::default()
    };

    let mut mode = permission_bits(metadata);
    if file_type.is_dir() {
        mode |= MODE_DIR;
    } else if file_type.is_symlink() {
        mode |= MODE_SYMLINK;
        stat.linkname = std::fs::read_link(source)?.to_string_lossy().into_owned();
    } else if file_type.is_file() {
        stat.size = i64::try_from(metadata.len()).unwrap_or(i64::MAX);
    } else {
        return Ok(None);
    }
    stat.mode = mode;
    set_owner(&mut stat, metadata);

    Ok(Some(stat))
}

fn mod_time(metadata: &Metadata) -> i64 {
    metadata
        .modified()
        .ok()
        .and_then(|time| time.duration_since(UNIX_EPOCH).ok())
        .and_then(|elapsed| i64::try_from(elapsed.as_nanos()).ok())
        .unwrap_or_default()
}

#[cfg(unix)]
fn permission_bits(metadata: &Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;

    let mode = metadata.permissions().mode();
    let mut bits = mode & 0o777;
    if mode & 0o4000 != 0 {
        bits |= MODE_SETUID;
    }
    if mode & 0o2000 != 0 {
        bits |= MODE_SETGID;
    }
    if mode & 0o1000 != 0 {
        bits |= MODE_STICKY;
    }
    bits
}

#[cfg(not(unix))]
fn permission_bits(metadata: &Metadata) -> u32 {
    if metadata.is_dir() {
        0o755
    } else if metadata.permissions().readonly() {
        0o444
    } else {
        0o644
    }
}

#[cfg(unix)]
fn set_owner(stat: &mut Stat, metadata: &Metadata) {
    use std::os::unix::fs::MetadataExt;

    stat.uid = metadata.uid();
    stat.gid = metadata.gid();
}

#[cfg(not(unix))]
fn set_owner(_stat: &mut Stat, _metadata: &Metadata) {}

type PacketSender = mpsc::Sender<Result<Packet, Status>>;

fn packet(kind: PacketType) -> Packet {
    Packet {
        r#type: kind as i32,
        ..Default::default()
    }
}

async fn send(tx: &PacketSender, packet: Packet) -> Result<(), Status> {
    tx.send(Ok(packet))
        .await
        .map_err(|_| Status::cancelled("receiver closed the transfer"))
}

async fn send_dir(
    root: PathBuf,
    filter: PathFilter,
    mut inbound: Streaming<Packet>,
    tx: &PacketSender,
) -> Result<(), Status> {
    let entries = tokio::task::spawn_blocking(move || walk(&root, &filter))
        .await
        .map_err(|e| Status::internal(format!("walk task failed: {}", e)))?
        .map_err(|e| Status::internal(format!("failed to walk local dir: {}", e)))?;

    // STAT の送信中にも要求が届くため、受信は別タスクで続ける
    let (requests_tx, mut requests) = mpsc::unbounded_channel();
    let reader = tokio::spawn(async move {
        loop {
            match inbound.message().await {
                Ok(Some(packet)) => {
                    if requests_tx.send(Ok(packet)).is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(status) => {
                    let _ = requests_tx.send(Err(status));
                    break;
                }
            }
        }
    });

    let result = transfer(&entries, &mut requests, tx).await;
    reader.abort();
    result
}

async fn transfer(
    entries: &[Entry],
    requests: &mut mpsc::UnboundedReceiver<Result<Packet, Status>>,
    tx: &PacketSender,
) -> Result<(), Status> {
    for entry in entries {
        let mut stat = packet(PacketType::PacketStat);
        stat.stat = Some(entry.stat.clone());
        send(tx, stat).await?;
    }
    send(tx, packet(PacketType::PacketStat)).await?;

    while let Some(request) = requests.recv().await {
        let request = request?;
        match PacketType::try_from(request.r#type) {
            Ok(PacketType::PacketReq) => {
                let entry = usize::try_from(request.id)
                    .ok()
                    .and_then(|id| entries.get(id))
                    .filter(|entry| entry.is_regular_file())
                    .ok_or_else(|| {
                        Status::invalid_argument(format!("invalid file request {}", request.id))
                    })?;
                send_file(request.id, &entry.source, tx).await?;
            }
            Ok(PacketType::PacketFin) => {
                send(tx, packet(PacketType::PacketFin)).await?;
                return Ok(());
            }
            Ok(PacketType::PacketErr) => {
                return Err(Status::aborted(format!(
                    "error from receiver: {}",
                    String::from_utf8_lossy(&request.data)
                )));
            }
            _ => tracing::debug!("Ignoring packet type {}", request.r#type),
        }
    }
    Ok(())
}

async fn send_file(id: u32, source: &Path, tx: &PacketSender) -> Result<(), Status> {
    let open_error = |e: io::Error| {
        Status::internal(format!("failed to read {}: {}", source.display(), e))
    };
    let mut file = tokio::fs::File::open(source).await.map_err(open_error)?;

    let mut buf = vec![0u8; DATA_CHUNK];
    loop {
        let n = file.read(&mut buf).await.map_err(open_error)?;
        if n == 0 {
            break;
        }
        let mut data = packet(PacketType::PacketData);
        data.id = id;
        data.data = buf[..n].to_vec();
        send(tx, data).await?;
    }

    let mut end = packet(PacketType::PacketData);
    end.id = id;
    send(tx, end).await
}
