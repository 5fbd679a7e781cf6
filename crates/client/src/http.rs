//! Request/response side channel: login and token checks.

use std::time::Duration;

use md5::{Digest, Md5};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};

use crate::types::ConnectError;

/// Standard `{status, message, data}` response wrapper.
#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    status: String,
    #[serde(default)]
    message: Option<String>,
    data: Option<T>,
}

#[derive(Debug, Serialize)]
struct LoginRequest<'a> {
    username: &'a str,
    /// Lowercase hex MD5 of the password; the server stores that form.
    password: String,
}

#[derive(Debug, Deserialize)]
struct LoginData {
    token: String,
}

/// Thin HTTP client for the server's REST endpoints.
#[derive(Debug, Clone)]
pub struct HttpChannel {
    http: Client,
    base_url: String,
}

impl HttpChannel {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, ConnectError> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ConnectError::Unreachable(e.to_string()))?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_owned(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Exchange credentials for a token.  `password` is the plain text;
    /// it is hashed before it leaves the process.
    pub async fn login(&self, username: &str, password: &str) -> Result<String, ConnectError> {
        let resp = self
            .http
            .post(self.url("/api/auth/login"))
            .json(&LoginRequest {
                username,
                password: hash_password(password),
            })
            .send()
            .await
            .map_err(transport_error)?;

        let status = resp.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(ConnectError::AuthRejected(format!("login: HTTP {status}")));
        }
        if !status.is_success() {
            return Err(ConnectError::Handshake(format!("login: HTTP {status}")));
        }

        let body: ApiResponse<LoginData> = resp
            .json()
            .await
            .map_err(|e| ConnectError::Handshake(format!("login response: {e}")))?;
        match body {
            ApiResponse {
                status,
                data: Some(LoginData { token }),
                ..
            } if status == "ok" && !token.is_empty() => {
                tracing::info!(username, "login succeeded");
                Ok(token)
            }
            ApiResponse { message, .. } => Err(ConnectError::AuthRejected(
                message.unwrap_or_else(|| "login refused".into()),
            )),
        }
    }

    /// Whether the server still accepts `token`.
    pub async fn check_token(&self, token: &str) -> Result<bool, ConnectError> {
        let resp = self
            .http
            .get(self.url("/api/chat/sessions"))
            .bearer_auth(token)
            .send()
            .await
            .map_err(transport_error)?;

        match resp.status() {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Ok(false),
            s if s.is_success() => Ok(true),
            s => Err(ConnectError::Handshake(format!("token check: HTTP {s}"))),
        }
    }
}

/// Password as the login endpoint expects it.
pub fn hash_password(password: &str) -> String {
    hex::encode(Md5::digest(password.as_bytes()))
}

fn transport_error(e: reqwest::Error) -> ConnectError {
    if e.is_timeout() {
        ConnectError::Timeout("waiting for HTTP response")
    } else {
        ConnectError::Unreachable(e.to_string())
    }
}
