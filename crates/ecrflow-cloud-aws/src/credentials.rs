//! レジストリ認証情報
//!
//! ECR の認可トークンは `username:password` を Base64 エンコードした1つの文字列です。

use crate::error::{CloudError, Result};
use base64::Engine;
use std::fmt;

/// ECR レジストリのユーザー名とパスワード
///
/// 1回のビルドの間だけメモリ上に保持され、永続化されません。
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub secret: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            secret: secret.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// Base64 エンコードされた認可トークンをデコード
///
/// 最初の `:` で分割するため、パスワード側に `:` が含まれていても壊れません。
pub fn decode_token(token: &str) -> Result<Credentials> {
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(token.trim())
        .map_err(|e| CloudError::InvalidToken(format!("failed to decode token: {}", e)))?;

    let decoded = String::from_utf8(decoded)
        .map_err(|e| CloudError::InvalidToken(format!("invalid UTF-8 in token: {}", e)))?;

    let (username, secret) = decoded
        .split_once(':')
        .ok_or_else(|| CloudError::InvalidToken("missing ':' separator".to_string()))?;

    Ok(Credentials::new(username, secret))
}
