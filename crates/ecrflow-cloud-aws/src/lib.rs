//! ecrflow AWS integration
//!
//! AWS の認証情報（環境変数、プロファイル、IMDS など SDK 標準のチェーン）を
//! ECR レジストリ用の短期パスワードに交換します。
//!
//! ```text
//! RegistryIdentity ─┐
//!                   ├─► CredentialBroker ─► TokenExchange ─► Credentials
//!           region ─┘        (public / regional)
//! ```

pub mod broker;
pub mod credentials;
pub mod error;

// Re-exports
pub use broker::{AwsTokenExchange, CredentialBroker, TokenExchange};
pub use credentials::{Credentials, decode_token};
pub use error::{CloudError, Result};
