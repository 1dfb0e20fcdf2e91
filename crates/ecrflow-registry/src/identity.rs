//! レジストリアドレスを [`RegistryIdentity`] に解決
//!
//! スキームの有無に関わらず `https://` を付け直して URL として解析するため、
//! パスの抽出結果は入力形式に依存しません。ホストの照合は入力に書かれたままの
//! 文字列に対して行い、大文字を含むホストは受け付けません。

use crate::error::{RegistryError, Result};
use regex::Regex;
use std::fmt;
use std::sync::LazyLock;
use url::Url;

/// 解決結果のエンドポイントに付与するスキーム
pub const PROXY_ENDPOINT_SCHEME: &str = "https://";

/// エラーメッセージに表示するプログラム名
pub const PROGRAM_NAME: &str = "ecrflow";

/// ECR Public のホスト名
pub const ECR_PUBLIC_HOST: &str = "public.ecr.aws";

/// ECR Public の固定エンドポイント
pub const ECR_PUBLIC_ENDPOINT: &str = "https://public.ecr.aws";

// https://github.com/awslabs/amazon-ecr-credential-helper (ecr-login/api/client.go) と同じ形式
static ECR_HOST_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(concat!(
        r"^(\d{12})\.dkr\.ecr(-fips)?\.([a-zA-Z0-9][a-zA-Z0-9_-]*)\.",
        r"(amazonaws\.com(\.cn)?|sc2s\.sgov\.gov|c2s\.ic\.gov|",
        r"cloud\.adc-e\.uk|csp\.hci\.ic\.gov)$",
    ))
    .expect("ECR host pattern must compile")
});

/// 検証済みのレジストリ識別情報
///
/// 1回のビルドにつき1度だけ生成され、以降は変更されません。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryIdentity {
    /// スキーム付きのエンドポイント（例: `https://public.ecr.aws`）
    pub endpoint: String,
    /// ホスト名（ポートなし）
    pub host: String,
    /// 先頭・末尾の `/` を除いたリポジトリパス
    pub path: String,
}

impl RegistryIdentity {
    /// ECR Public のレジストリかどうか
    pub fn is_public(&self) -> bool {
        self.host == ECR_PUBLIC_HOST
    }

    /// リージョナルホストに含まれるリージョン名
    ///
    /// ECR Public の場合は `None`
    pub fn region_hint(&self) -> Option<&str> {
        ECR_HOST_PATTERN
            .captures(&self.host)
            .and_then(|caps| caps.get(3))
            .map(|m| m.as_str())
    }

    /// プッシュ先のイメージ参照 `{host}/{path}:{label}` を作成
    pub fn tag(&self, label: &str) -> String {
        format!("{}/{}:{}", self.host, self.path, label)
    }
}

impl fmt::Display for RegistryIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.endpoint, self.path)
    }
}

/// 入力に書かれたままのホスト部分
///
/// `Url` はホスト名を小文字に正規化するため、照合にはこちらを使う
fn raw_host(without_scheme: &str) -> &str {
    let authority = without_scheme
        .split(['/', '?', '#'])
        .next()
        .unwrap_or_default();
    let host_port = authority
        .rsplit_once('@')
        .map_or(authority, |(_, host_port)| host_port);
    host_port.split(':').next().unwrap_or_default()
}

/// レジストリアドレスを解決
///
/// # Examples
/// - `123456789012.dkr.ecr.us-east-1.amazonaws.com/myrepo/app`
///   -> host `123456789012.dkr.ecr.us-east-1.amazonaws.com`, path `myrepo/app`
/// - `https://public.ecr.aws/r123/app` -> endpoint `https://public.ecr.aws`
///
/// # Errors
/// - パスのセグメントが2つ未満: [`RegistryError::InvalidAddress`]
/// - ECR 以外のホスト、大文字を含むホスト: [`RegistryError::UnsupportedRegistry`]
pub fn resolve(address: &str) -> Result<RegistryIdentity> {
    let input = address.trim();
    let without_scheme = match input.split_once("://") {
        Some((_, rest)) => rest,
        None => input,
    };

    let server_url = Url::parse(&format!("{}{}", PROXY_ENDPOINT_SCHEME, without_scheme))
        .map_err(|e| RegistryError::invalid(address, e.to_string()))?;

    let path = server_url.path().trim_matches('/').to_string();
    let segments = path.split('/').filter(|s| !s.is_empty()).count();
    if segments < 2 {
        return Err(RegistryError::invalid(
            address,
            "expected at least <registry>/<repository> in the path",
        ));
    }

    if server_url.host_str().is_none_or(str::is_empty) {
        return Err(RegistryError::invalid(address, "missing host"));
    }
    let host = raw_host(without_scheme).to_string();

    // ホスト名は小文字のみ受け付ける
    if host.bytes().any(|b| b.is_ascii_uppercase()) {
        return Err(RegistryError::UnsupportedRegistry {
            program: PROGRAM_NAME,
            host,
        });
    }

    if host == ECR_PUBLIC_HOST {
        tracing::debug!("Resolved ECR Public registry: {}", path);
        return Ok(RegistryIdentity {
            endpoint: ECR_PUBLIC_ENDPOINT.to_string(),
            host,
            path,
        });
    }

    let Some(caps) = ECR_HOST_PATTERN.captures(&host) else {
        return Err(RegistryError::UnsupportedRegistry {
            program: PROGRAM_NAME,
            host,
        });
    };

    // account と region が取れなければ ECR のリポジトリ URI として不完全
    let (Some(matched), Some(_account), Some(_region)) = (caps.get(0), caps.get(1), caps.get(3))
    else {
        return Err(RegistryError::invalid(
            address,
            "not a valid repository URI for Amazon Elastic Container Registry",
        ));
    };

    let endpoint = format!("{}{}", PROXY_ENDPOINT_SCHEME, matched.as_str());
    tracing::debug!("Resolved ECR registry {} (path: {})", endpoint, path);

    Ok(RegistryIdentity {
        endpoint,
        host,
        path,
    })
}
