//! プッシュしたイメージのディスクリプタ

use crate::error::{BuildError, Result};
use crate::solve::SolveResponse;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};

/// エクスポーターレスポンスのイメージダイジェスト
pub const DIGEST_KEY: &str = "containerimage.digest";

/// エクスポーターレスポンスの base64 エンコードされたディスクリプタ
pub const DESCRIPTOR_KEY: &str = "containerimage.descriptor";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Annotations {
    #[serde(
        rename = "depot.containerimage.manifest",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub raw_manifest: Option<String>,
}

/// OCI ディスクリプタ
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageDescriptor {
    #[serde(default)]
    pub media_type: String,
    #[serde(default)]
    pub digest: String,
    #[serde(default)]
    pub size: i64,
    #[serde(default)]
    pub annotations: Annotations,
}

impl ImageDescriptor {
    /// solve のレスポンスからディスクリプタを取り出す
    ///
    /// この時点でイメージはプッシュ済みなので、失敗時のエラーにはダイジェストを含める。
    pub fn from_response(response: &SolveResponse) -> Result<Self> {
        let exporter = &response.exporter_response;
        let digest = exporter.get(DIGEST_KEY).cloned().unwrap_or_default();

        let descriptor_error = |message: String| BuildError::Descriptor {
            digest: digest.clone(),
            message,
        };

        let encoded = exporter
            .get(DESCRIPTOR_KEY)
            .ok_or_else(|| descriptor_error(format!("{} is missing", DESCRIPTOR_KEY)))?;

        let decoded = STANDARD
            .decode(encoded.trim())
            .map_err(|e| descriptor_error(format!("invalid base64: {}", e)))?;

        let mut descriptor: ImageDescriptor = serde_json::from_slice(&decoded)
            .map_err(|e| descriptor_error(format!("invalid JSON: {}", e)))?;

        if descriptor.digest.is_empty() {
            descriptor.digest = digest;
        }

        Ok(descriptor)
    }
}
