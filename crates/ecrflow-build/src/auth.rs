//! ビルドセッションのレジストリ認証
//!
//! BuildKit のセッション認証プロトコル（`moby.filesync.v1.Auth`）に相当する
//! 4つのリクエストに応答します。ユーザー名/パスワード認証のみを扱い、
//! トークン委譲系のリクエストは常に `Unavailable` を返します。

use crate::error::AuthError;
use async_trait::async_trait;
use ecrflow_cloud_aws::Credentials;
use ecrflow_registry::RegistryIdentity;
use std::fmt;

const CLIENT_SIDE_TOKENS_DISABLED: &str = "client side tokens disabled";

/// `Credentials(host)` リクエスト
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialsRequest {
    pub host: String,
}

impl CredentialsRequest {
    pub fn new(host: impl Into<String>) -> Self {
        Self { host: host.into() }
    }
}

/// `Credentials(host)` のレスポンス
///
/// 該当ホストの認証情報が無い場合は両方とも空文字列
#[derive(Clone, Default, PartialEq, Eq)]
pub struct CredentialsResponse {
    pub username: String,
    pub secret: String,
}

impl CredentialsResponse {
    pub fn is_empty(&self) -> bool {
        self.username.is_empty() && self.secret.is_empty()
    }
}

impl fmt::Debug for CredentialsResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialsResponse")
            .field("username", &self.username)
            .field("secret", &if self.secret.is_empty() { "" } else { "<redacted>" })
            .finish()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchTokenRequest {
    pub client_id: String,
    pub host: String,
    pub realm: String,
    pub service: String,
    pub scopes: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchTokenResponse {
    pub token: String,
    pub expires_in: i64,
    pub issued_at: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GetTokenAuthorityRequest {
    pub host: String,
    pub salt: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GetTokenAuthorityResponse {
    pub public_key: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VerifyTokenAuthorityRequest {
    pub host: String,
    pub payload: Vec<u8>,
    pub salt: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VerifyTokenAuthorityResponse {
    pub signed: Vec<u8>,
}

/// ビルドエンジンから呼び出されるセッション認証サービス
///
/// 1回のビルドの間、同時かつ繰り返し呼び出されます。
#[async_trait]
pub trait AuthService: Send + Sync {
    async fn credentials(
        &self,
        request: CredentialsRequest,
    ) -> Result<CredentialsResponse, AuthError>;

    async fn fetch_token(
        &self,
        request: FetchTokenRequest,
    ) -> Result<FetchTokenResponse, AuthError>;

    async fn get_token_authority(
        &self,
        request: GetTokenAuthorityRequest,
    ) -> Result<GetTokenAuthorityResponse, AuthError>;

    async fn verify_token_authority(
        &self,
        request: VerifyTokenAuthorityRequest,
    ) -> Result<VerifyTokenAuthorityResponse, AuthError>;
}

/// ECR の認証情報を1つのレジストリホストにだけ返す認証サービス
///
/// 生成後は状態を持たないため `Arc` で共有して並行に問い合わせて構いません。
pub struct AuthSession {
    registry: RegistryIdentity,
    credentials: Credentials,
}

impl AuthSession {
    pub fn new(credentials: Credentials, registry: RegistryIdentity) -> Self {
        Self {
            registry,
            credentials,
        }
    }
}

impl fmt::Debug for AuthSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthSession")
            .field("registry", &self.registry.host)
            .field("credentials", &self.credentials)
            .finish()
    }
}

#[async_trait]
impl AuthService for AuthSession {
    async fn credentials(
        &self,
        request: CredentialsRequest,
    ) -> Result<CredentialsResponse, AuthError> {
        // 解決済みレジストリ以外のホストには何も渡さない
        if request.host != self.registry.host {
            tracing::debug!("No credentials for host {}", request.host);
            return Ok(CredentialsResponse::default());
        }

        tracing::debug!("Serving registry credentials for {}", request.host);
        Ok(CredentialsResponse {
            username: self.credentials.username.clone(),
            secret: self.credentials.secret.clone(),
        })
    }

    async fn fetch_token(
        &self,
        _request: FetchTokenRequest,
    ) -> Result<FetchTokenResponse, AuthError> {
        Err(AuthError::Unavailable(CLIENT_SIDE_TOKENS_DISABLED))
    }

    async fn get_token_authority(
        &self,
        _request: GetTokenAuthorityRequest,
    ) -> Result<GetTokenAuthorityResponse, AuthError> {
        Err(AuthError::Unavailable(CLIENT_SIDE_TOKENS_DISABLED))
    }

    async fn verify_token_authority(
        &self,
        _request: VerifyTokenAuthorityRequest,
    ) -> Result<VerifyTokenAuthorityResponse, AuthError> {
        Err(AuthError::Unavailable(CLIENT_SIDE_TOKENS_DISABLED))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    const HOST: &str = "123456789012.dkr.ecr.us-east-1.amazonaws.com";

    fn session() -> AuthSession {
        let registry = ecrflow_registry::resolve(&format!("{}/myrepo/app", HOST)).unwrap();
        AuthSession::new(Credentials::new("AWS", "p@ss:word"), registry)
    }

    #[tokio::test]
    async fn test_credentials_for_registry_host() {
        let response = session()
            .credentials(CredentialsRequest::new(HOST))
            .await
            .unwrap();
        assert_eq!(response.username, "AWS");
        assert_eq!(response.secret, "p@ss:word");
        assert!(!response.is_empty());
    }

    #[tokio::test]
    async fn test_credentials_for_other_hosts_are_empty() {
        let session = session();
        for host in [
            "docker.io",
            "ghcr.io",
            "public.ecr.aws",
            "",
            "123456789012.dkr.ecr.us-east-1.amazonaws.com.evil.com",
            "https://123456789012.dkr.ecr.us-east-1.amazonaws.com",
            "123456789012.DKR.ECR.us-east-1.amazonaws.com",
        ] {
            let response = session
                .credentials(CredentialsRequest::new(host))
                .await
                .unwrap();
            assert!(response.is_empty(), "leaked credentials to {:?}", host);
        }
    }

    #[tokio::test]
    async fn test_token_requests_are_unavailable() {
        let session = session();

        let err = session
            .fetch_token(FetchTokenRequest {
                host: HOST.to_string(),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert_eq!(err, AuthError::Unavailable("client side tokens disabled"));

        let err = session
            .get_token_authority(GetTokenAuthorityRequest::default())
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::Unavailable(_)));

        let err = session
            .verify_token_authority(VerifyTokenAuthorityRequest::default())
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::Unavailable(_)));
    }

    #[tokio::test]
    async fn test_concurrent_queries() {
        let session: Arc<dyn AuthService> = Arc::new(session());

        let handles: Vec<_> = (0..16)
            .map(|i| {
                let session = Arc::clone(&session);
                tokio::spawn(async move {
                    let host = if i % 2 == 0 { HOST } else { "ghcr.io" };
                    let response = session
                        .credentials(CredentialsRequest::new(host))
                        .await
                        .unwrap();
                    (host, response)
                })
            })
            .collect();

        for handle in handles {
            let (host, response) = handle.await.unwrap();
            assert_eq!(response.is_empty(), host != HOST);
        }
    }

    #[test]
    fn test_debug_does_not_leak_secret() {
        let debug = format!("{:?}", session());
        assert!(!debug.contains("p@ss:word"));

        let response = CredentialsResponse {
            username: "AWS".to_string(),
            secret: "p@ss:word".to_string(),
        };
        assert!(!format!("{:?}", response).contains("p@ss:word"));
    }
}
