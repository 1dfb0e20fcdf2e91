use crate::error::{BuildError, Result};
use crate::options::Frontend;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;

/// Railpack が出力するビルドプラン
pub const RAILPACK_PLAN_FILE: &str = "railpack-plan.json";

/// Railpack が出力する検出結果
pub const RAILPACK_INFO_FILE: &str = "railpack-info.json";

/// フロントエンドを選択
///
/// `source_dir` に Dockerfile があれば Dockerfile フロントエンド、
/// 無ければ Railpack フロントエンドを使う。
pub fn select_frontend(source_dir: &Path, dockerfile: &Path, railpack_version: &str) -> Frontend {
    let path = source_dir.join(dockerfile);
    if path.is_file() {
        tracing::debug!("Found Dockerfile at: {}", path.display());
        return Frontend::Dockerfile;
    }

    tracing::info!(
        "Dockerfile not found at {}, falling back to Railpack {}",
        path.display(),
        railpack_version
    );
    Frontend::Railpack {
        version: railpack_version.to_string(),
    }
}

/// フロントエンドに渡す `filename` を解決
///
/// Railpack ゲートウェイは Dockerfile の代わりに prepare したプランを読む
pub fn frontend_filename(frontend: &Frontend, dockerfile: &Path) -> PathBuf {
    match frontend {
        Frontend::Dockerfile => dockerfile.to_path_buf(),
        Frontend::Railpack { .. } => PathBuf::from(RAILPACK_PLAN_FILE),
    }
}

/// `railpack prepare` でビルドプランを生成
///
/// 生成された `railpack-plan.json` のパスを返す
pub async fn prepare_railpack_plan(source_dir: &Path) -> Result<PathBuf> {
    prepare_railpack_plan_with(Path::new("railpack"), source_dir).await
}

pub(crate) async fn prepare_railpack_plan_with(
    program: &Path,
    source_dir: &Path,
) -> Result<PathBuf> {
    let installed = Command::new("which")
        .arg(program)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .map(|status| status.success())
        .unwrap_or(false);

    if !installed {
        return Err(BuildError::Railpack(format!(
            "{} is not installed",
            program.display()
        )));
    }

    let plan_path = source_dir.join(RAILPACK_PLAN_FILE);
    let info_path = source_dir.join(RAILPACK_INFO_FILE);

    tracing::debug!(
        "Running: {} prepare {} --plan-out {} --info-out {}",
        program.display(),
        source_dir.display(),
        plan_path.display(),
        info_path.display()
    );

    let status = Command::new(program)
        .arg("prepare")
        .arg(source_dir)
        .arg("--plan-out")
        .arg(&plan_path)
        .arg("--info-out")
        .arg(&info_path)
        .kill_on_drop(true)
        .status()
        .await
        .map_err(|e| BuildError::Railpack(format!("failed to run railpack: {}", e)))?;

    if !status.success() {
        return Err(BuildError::Railpack(format!(
            "failed to prepare Railpack plan ({})",
            status
        )));
    }

    if !plan_path.is_file() {
        return Err(BuildError::Railpack(format!(
            "{} was not created",
            plan_path.display()
        )));
    }

    Ok(plan_path)
}
