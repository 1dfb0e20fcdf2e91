//! `moby.filesync.v1.Auth` を [`AuthService`] に橋渡しする

use crate::auth::{
    AuthService, CredentialsRequest, FetchTokenRequest, GetTokenAuthorityRequest,
    VerifyTokenAuthorityRequest,
};
use crate::error::AuthError;
use crate::proto::moby::filesync::v1 as pb;
use crate::proto::moby::filesync::v1::auth_server::Auth;
use std::sync::Arc;
use tonic::{Request, Response, Status};

impl From<AuthError> for Status {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::Unavailable(message) => Status::unavailable(message),
        }
    }
}

/// セッションに接続された認証サービス
///
/// `Credentials` は空でない応答を返した最初のサービスを採用し、
/// トークン系のリクエストは先頭のサービスに任せる。
pub(super) struct AuthBridge {
    services: Vec<Arc<dyn AuthService>>,
}

impl AuthBridge {
    pub(super) fn new(services: Vec<Arc<dyn AuthService>>) -> Self {
        Self { services }
    }

    fn primary(&self) -> Result<&Arc<dyn AuthService>, Status> {
        self.services
            .first()
            .ok_or_else(|| Status::unavailable("no auth service attached"))
    }
}

#[tonic::async_trait]
impl Auth for AuthBridge {
    async fn credentials(
        &self,
        request: Request<pb::CredentialsRequest>,
    ) -> Result<Response<pb::CredentialsResponse>, Status> {
        let host = request.into_inner().host;
        tracing::debug!("Session credentials request for {}", host);

        for service in &self.services {
            let response = service
                .credentials(CredentialsRequest::new(host.clone()))
                .await?;
            if !response.is_empty() {
                return Ok(Response::new(pb::CredentialsResponse {
                    username: response.username,
                    secret: response.secret,
                }));
            }
        }
        Ok(Response::new(pb::CredentialsResponse::default()))
    }

    async fn fetch_token(
        &self,
        request: Request<pb::FetchTokenRequest>,
    ) -> Result<Response<pb::FetchTokenResponse>, Status> {
        let request = request.into_inner();
        tracing::debug!("Session token request for {}", request.host);

        let response = self
            .primary()?
            .fetch_token(FetchTokenRequest {
                client_id: request.client_id,
                host: request.host,
                realm: request.realm,
                service: request.service,
                scopes: request.scopes,
            })
            .await?;
        Ok(Response::new(pb::FetchTokenResponse {
            token: response.token,
            expires_in: response.expires_in,
            issued_at: response.issued_at,
        }))
    }

    async fn get_token_authority(
        &self,
        request: Request<pb::GetTokenAuthorityRequest>,
    ) -> Result<Response<pb::GetTokenAuthorityResponse>, Status> {
        let request = request.into_inner();
        let response = self
            .primary()?
            .get_token_authority(GetTokenAuthorityRequest {
                host: request.host,
                salt: request.salt,
            })
            .await?;
        Ok(Response::new(pb::GetTokenAuthorityResponse {
            public_key: response.public_key,
        }))
    }

    async fn verify_token_authority(
        &self,
        request: Request<pb::VerifyTokenAuthorityRequest>,
    ) -> Result<Response<pb::VerifyTokenAuthorityResponse>, Status> {
        let request = request.into_inner();
        let response = self
            .primary()?
            .verify_token_authority(VerifyTokenAuthorityRequest {
                host: request.host,
                payload: request.payload,
                salt: request.salt,
            })
            .await?;
        Ok(Response::new(pb::VerifyTokenAuthorityResponse {
            signed: response.signed,
        }))
    }
}
