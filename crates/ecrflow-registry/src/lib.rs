//! ECR Registry: レジストリアドレスの解決
//!
//! ユーザーが入力したレジストリ URL（例: `123456789012.dkr.ecr.us-east-1.amazonaws.com/team/app`）
//! を検証し、ビルド中に参照される [`RegistryIdentity`] に変換します。
//!
//! # 受け付けるレジストリ
//!
//! - **ECR Public**: `public.ecr.aws/<alias>/<repo>`
//! - **ECR (regional)**: `<account>.dkr.ecr[-fips].<region>.<partition-domain>/<path>`

pub mod error;
pub mod identity;

pub use error::*;
pub use identity::*;
