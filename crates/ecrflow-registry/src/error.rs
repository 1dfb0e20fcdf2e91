//! ECR Registry エラー型

/// レジストリアドレス解決のエラー
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("invalid registry URL {address:?}: {reason}")]
    InvalidAddress { address: String, reason: String },

    #[error(
        "{program} can only be used with Amazon Elastic Container Registry (got host {host:?})"
    )]
    UnsupportedRegistry { program: &'static str, host: String },
}

impl RegistryError {
    pub(crate) fn invalid(address: &str, reason: impl Into<String>) -> Self {
        RegistryError::InvalidAddress {
            address: address.to_string(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, RegistryError>;
