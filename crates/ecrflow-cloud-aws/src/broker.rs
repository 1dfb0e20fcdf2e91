//! ECR 認可トークンの交換
//!
//! レジストリが ECR Public か regional ECR かで呼び出すエンドポイントを切り替えます。
//! 結果はキャッシュしません（1ビルドにつき1回だけ呼び出される前提）。

use crate::credentials::{Credentials, decode_token};
use crate::error::{CloudError, Result};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_ecr::config::Region;
use ecrflow_registry::RegistryIdentity;

const ECR_ENDPOINT: &str = "ecr:GetAuthorizationToken";
const ECR_PUBLIC_ENDPOINT: &str = "ecr-public:GetAuthorizationToken";

/// 認可トークンの取得元
///
/// どちらのメソッドも Base64 エンコードされた `username:password` を返します。
#[async_trait]
pub trait TokenExchange: Send + Sync {
    /// ECR Public の認可トークンを取得
    async fn public_token(&self, region: &str) -> Result<String>;

    /// regional ECR の認可トークンを取得
    async fn regional_token(&self, region: &str) -> Result<String>;
}

/// AWS SDK を使った [`TokenExchange`]
///
/// 認証情報は SDK 標準のプロバイダーチェーンから読み込みます。
#[derive(Debug, Default, Clone)]
pub struct AwsTokenExchange;

impl AwsTokenExchange {
    pub fn new() -> Self {
        Self
    }

    async fn load_config(region: &str) -> aws_config::SdkConfig {
        tracing::debug!("Loading AWS configuration for region {}", region);
        aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(region.to_string()))
            .load()
            .await
    }
}

#[async_trait]
impl TokenExchange for AwsTokenExchange {
    async fn public_token(&self, region: &str) -> Result<String> {
        let config = Self::load_config(region).await;
        let client = aws_sdk_ecrpublic::Client::new(&config);

        let response = client.get_authorization_token().send().await.map_err(|e| {
            CloudError::CredentialExchange {
                endpoint: ECR_PUBLIC_ENDPOINT,
                message: aws_sdk_ecrpublic::error::DisplayErrorContext(&e).to_string(),
            }
        })?;

        response
            .authorization_data()
            .and_then(|data| data.authorization_token())
            .map(str::to_string)
            .ok_or(CloudError::CredentialExchange {
                endpoint: ECR_PUBLIC_ENDPOINT,
                message: "response contained no authorization token".to_string(),
            })
    }

    async fn regional_token(&self, region: &str) -> Result<String> {
        let config = Self::load_config(region).await;
        let client = aws_sdk_ecr::Client::new(&config);

        let response = client.get_authorization_token().send().await.map_err(|e| {
            CloudError::CredentialExchange {
                endpoint: ECR_ENDPOINT,
                message: aws_sdk_ecr::error::DisplayErrorContext(&e).to_string(),
            }
        })?;

        // 成功時は少なくとも1件の authorization data が返る
        response
            .authorization_data()
            .first()
            .and_then(|data| data.authorization_token())
            .map(str::to_string)
            .ok_or(CloudError::CredentialExchange {
                endpoint: ECR_ENDPOINT,
                message: "response contained no authorization data".to_string(),
            })
    }
}

/// レジストリ識別情報とリージョンから [`Credentials`] を取得
#[derive(Debug, Clone)]
pub struct CredentialBroker<T = AwsTokenExchange> {
    exchange: T,
}

impl Default for CredentialBroker<AwsTokenExchange> {
    fn default() -> Self {
        Self::new()
    }
}

impl CredentialBroker<AwsTokenExchange> {
    /// AWS SDK を使う CredentialBroker を作成
    pub fn new() -> Self {
        Self {
            exchange: AwsTokenExchange::new(),
        }
    }
}

impl<T: TokenExchange> CredentialBroker<T> {
    /// 任意の [`TokenExchange`] を指定して作成
    pub fn with_exchange(exchange: T) -> Self {
        Self { exchange }
    }

    /// ECR の短期認証情報を取得
    ///
    /// `identity.host` が `public.ecr.aws` なら ECR Public、それ以外は regional ECR に問い合わせます。
    pub async fn fetch_credentials(
        &self,
        identity: &RegistryIdentity,
        region: &str,
    ) -> Result<Credentials> {
        let token = if identity.is_public() {
            tracing::info!("Requesting ECR Public authorization token ({})", region);
            self.exchange.public_token(region).await?
        } else {
            tracing::info!(
                "Requesting ECR authorization token for {} ({})",
                identity.host,
                region
            );
            self.exchange.regional_token(region).await?
        };

        let credentials = decode_token(&token)?;
        tracing::debug!("Received registry credentials for user {}", credentials.username);
        Ok(credentials)
    }
}
