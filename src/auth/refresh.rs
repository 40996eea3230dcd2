// Token endpoint calls: password login and credential renewal

use async_trait::async_trait;
use reqwest::Client;

use super::types::{token_prefix, CredentialPair, TokenResponse};
use crate::error::{detail_message, ApiError};

/// The network calls that mint credentials.
///
/// Renewal requests go straight to the token endpoint and never through the
/// request dispatcher, so a failed renewal can never trigger another renewal.
#[async_trait]
pub trait TokenEndpoint: Send + Sync {
    /// Exchange username and password for a credential pair
    async fn login(&self, username: &str, password: &str) -> Result<CredentialPair, ApiError>;

    /// Exchange a renewal credential for a fresh credential pair
    async fn renew(&self, refresh_token: &str) -> Result<CredentialPair, ApiError>;
}

/// OAuth2-style form-encoded token endpoint
pub struct HttpTokenEndpoint {
    client: Client,
    url: String,
}

impl HttpTokenEndpoint {
    pub fn new(client: Client, base_url: &str, token_path: &str) -> Self {
        Self {
            client,
            url: format!("{}{}", base_url.trim_end_matches('/'), token_path),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn post_form(&self, form: &[(&str, &str)]) -> Result<reqwest::Response, ApiError> {
        self.client
            .post(&self.url)
            .header("Accept", "application/json")
            .form(form)
            .send()
            .await
            .map_err(|e| {
                tracing::warn!(error = %e, url = %self.url, "Token endpoint unreachable");
                ApiError::from_transport(&e)
            })
    }

    async fn parse_pair(response: reqwest::Response) -> Result<CredentialPair, ApiError> {
        let data: TokenResponse = response.json().await.map_err(|e| {
            ApiError::Internal(anyhow::anyhow!("Failed to parse token response: {}", e))
        })?;

        if data.access_token.is_empty() {
            return Err(ApiError::Internal(anyhow::anyhow!(
                "Token response does not contain an access token"
            )));
        }

        if let Some(ref token_type) = data.token_type {
            if !token_type.eq_ignore_ascii_case("bearer") {
                tracing::warn!(token_type = %token_type, "Unexpected token type, using as bearer");
            }
        }

        Ok(data.into())
    }
}

#[async_trait]
impl TokenEndpoint for HttpTokenEndpoint {
    async fn login(&self, username: &str, password: &str) -> Result<CredentialPair, ApiError> {
        tracing::info!(username = %username, "Logging in...");

        let form = [
            ("username", username),
            ("password", password),
            ("grant_type", "password"),
        ];
        let response = self.post_form(&form).await?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            let detail = detail_message(status, &error_text);
            tracing::warn!(status = %status, detail = %detail, "Login rejected");
            return Err(ApiError::LoginFailed(detail));
        }

        let pair = Self::parse_pair(response).await?;
        tracing::info!(
            access_token = %token_prefix(&pair.access_token),
            "Login successful"
        );
        Ok(pair)
    }

    async fn renew(&self, refresh_token: &str) -> Result<CredentialPair, ApiError> {
        tracing::debug!(url = %self.url, "Sending renewal request");

        let form = [
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
        ];
        let response = self.post_form(&form).await?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            tracing::error!(
                status = %status,
                body = %error_text,
                "Credential renewal rejected"
            );
            return Err(ApiError::Server {
                status: status.as_u16(),
                message: detail_message(status, &error_text),
            });
        }

        let pair = Self::parse_pair(response).await?;
        tracing::info!(
            access_token = %token_prefix(&pair.access_token),
            "Credential renewed"
        );
        Ok(pair)
    }
}
