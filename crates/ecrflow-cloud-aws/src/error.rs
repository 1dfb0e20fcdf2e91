//! AWS credential exchange error types

use thiserror::Error;

/// Credential exchange errors
#[derive(Error, Debug)]
pub enum CloudError {
    #[error("Credential exchange with {endpoint} failed: {message}")]
    CredentialExchange {
        endpoint: &'static str,
        message: String,
    },

    #[error("Invalid authorization token: {0}")]
    InvalidToken(String),
}

impl CloudError {
    /// ユーザー向けの分かりやすいエラーメッセージ
    pub fn user_message(&self) -> String {
        match self {
            CloudError::CredentialExchange { .. } => format!(
                "{}\n\
                 \n\
                 AWS の認証情報を確認してください:\n\
                 1. AWS_PROFILE / AWS_ACCESS_KEY_ID が設定されているか\n\
                 2. ecr:GetAuthorizationToken (ECR Public は ecr-public:GetAuthorizationToken と\n\
                    sts:GetServiceBearerToken) が許可されているか",
                self
            ),
            _ => self.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, CloudError>;
