//! ビルド用の作業ディレクトリ

use colored::Colorize;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

/// clone 先の親ディレクトリ（カレントディレクトリからの相対パス）
pub const WORK_DIR: &str = "tmp";

/// ワークフローIDの長さ
const WORKFLOW_ID_LEN: usize = 8;

/// ワークフローIDを生成
///
/// イメージタグにもそのまま使う
pub fn generate_workflow_id() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    id[..WORKFLOW_ID_LEN].to_string()
}

/// ワークフローごとの clone 先
pub fn source_dir(base: &Path, workflow_id: &str) -> PathBuf {
    base.join(WORK_DIR).join(workflow_id)
}

/// リポジトリを `dest` に clone
///
/// `cancel` されると git を止め、途中まで作られた `dest` を削除してエラーを返す。
pub async fn clone_repo_into(
    repo: &str,
    dest: &Path,
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    tracing::debug!("Running: git clone {} {}", repo, dest.display());

    let mut child = Command::new("git")
        .arg("clone")
        .arg(repo)
        .arg(dest)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| anyhow::anyhow!("gitの実行に失敗しました: {}", e))?;

    let status = tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            tracing::warn!("Clone of {} interrupted", repo);
            if let Err(e) = child.kill().await {
                tracing::debug!("Failed to stop git: {}", e);
            }
            if dest.exists() {
                tokio::fs::remove_dir_all(dest).await?;
            }
            return Err(anyhow::anyhow!("リポジトリの clone を中断しました: {}", repo));
        }
        status = child.wait() => status?,
    };

    if !status.success() {
        return Err(anyhow::anyhow!(
            "リポジトリの clone に失敗しました: {} ({})",
            repo,
            status
        ));
    }

    Ok(())
}

/// clone したソースツリーを削除
///
/// 失敗してもビルド結果は変えずに警告だけ出す
pub fn remove_source(path: &Path) {
    if !path.exists() {
        return;
    }

    println!("{}", "clone ディレクトリを削除中...".dimmed());
    match std::fs::remove_dir_all(path) {
        Ok(()) => tracing::debug!("Removed {}", path.display()),
        Err(e) => {
            tracing::warn!("Failed to remove {}: {}", path.display(), e);
            eprintln!(
                "  {} {} を削除できませんでした: {}",
                "⚠".yellow(),
                path.display(),
                e
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_generate_workflow_id() {
        let id = generate_workflow_id();
        assert_eq!(id.len(), 8);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(id, generate_workflow_id());
    }

    #[test]
    fn test_source_dir() {
        assert_eq!(
            source_dir(Path::new("/work"), "abcd1234"),
            PathBuf::from("/work/tmp/abcd1234")
        );
    }

    #[test]
    fn test_remove_source() {
        let temp_dir = tempfile::tempdir().unwrap();
        let dir = source_dir(temp_dir.path(), "abcd1234");
        fs::create_dir_all(dir.join("src")).unwrap();
        fs::write(dir.join("src/main.rs"), "fn main() {}").unwrap();

        remove_source(&dir);
        assert!(!dir.exists());

        // 存在しなくてもエラーにしない
        remove_source(&dir);
    }

    #[tokio::test]
    async fn test_clone_failure() {
        let temp_dir = tempfile::tempdir().unwrap();
        let dest = source_dir(temp_dir.path(), "abcd1234");

        let result = clone_repo_into(
            &temp_dir.path().join("not-a-repo").display().to_string(),
            &dest,
            &CancellationToken::new(),
        )
        .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_cancelled_clone_leaves_no_directory() {
        let temp_dir = tempfile::tempdir().unwrap();
        let repo = temp_dir.path().join("repo");
        fs::create_dir_all(&repo).unwrap();
        let dest = source_dir(temp_dir.path(), "abcd1234");

        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = clone_repo_into(&repo.display().to_string(), &dest, &cancel)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("中断"));
        assert!(!dest.exists());
    }
}
