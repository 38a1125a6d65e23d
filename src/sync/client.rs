//! Typed client for the remote device API.
//!
//! Every call carries a bearer token obtained from `POST /login`. A 401
//! drops the token, logs in again and replays the request once. Network
//! errors and 5xx answers are retried with a fixed delay.

use std::time::Duration;

use anyhow::Context;
use reqwest::{Client, Method, Response, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::ApiConfig;
use crate::error::SyncError;

/// Lifetime assumed when the server does not send `expires_in`.
const DEFAULT_TOKEN_LIFETIME: Duration = Duration::from_secs(24 * 60 * 60);
/// Refresh this long before the server-side expiry.
const EXPIRY_BUFFER: Duration = Duration::from_secs(5 * 60);

struct CachedToken {
    value: SecretString,
    refresh_at: Instant,
}

#[derive(Debug)]
pub struct Session {
    pub token: SecretString,
    pub expires_in: Duration,
}

#[derive(Deserialize)]
struct LoginResponse {
    token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

#[derive(Serialize)]
struct LoginRequest<'a> {
    username: &'a str,
    password: &'a str,
}

/// Inventory entry as listed by `GET /devices`. Only the fields the agent
/// looks at.
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteDevice {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
}

enum Failure {
    Unauthorized,
    Other(SyncError),
}

pub struct ApiClient {
    http: Client,
    base_url: String,
    username: String,
    password: SecretString,
    retry_attempts: u32,
    retry_delay: Duration,
    token: Option<CachedToken>,
}

impl ApiClient {
    pub fn new(config: ApiConfig) -> anyhow::Result<Self> {
        let http = Client::builder()
            .timeout(config.timeout)
            .user_agent(concat!("devwatch/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("building API client")?;
        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            username: config.username,
            password: config.password,
            retry_attempts: config.retry_attempts.max(1),
            retry_delay: config.retry_delay,
            token: None,
        })
    }

    /// Authenticate and cache the token. Single attempt.
    pub async fn login(&mut self) -> Result<Session, SyncError> {
        let url = format!("{}/login", self.base_url);
        let response = self
            .http
            .post(&url)
            .json(&LoginRequest {
                username: &self.username,
                password: self.password.expose_secret(),
            })
            .send()
            .await?;

        let status = response.status();
        if status.is_server_error() {
            return Err(SyncError::ServerError {
                status: status.as_u16(),
            });
        }
        if !status.is_success() {
            return Err(SyncError::Rejected {
                status: status.as_u16(),
                message: error_message(response).await,
            });
        }

        let body: LoginResponse = response.json().await?;
        let expires_in = body
            .expires_in
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_TOKEN_LIFETIME);
        self.token = Some(CachedToken {
            value: SecretString::from(body.token.clone()),
            refresh_at: Instant::now() + expires_in.saturating_sub(EXPIRY_BUFFER),
        });
        info!(user = %self.username, expires_in_secs = expires_in.as_secs(), "logged in to API");

        Ok(Session {
            token: SecretString::from(body.token),
            expires_in,
        })
    }

    pub async fn list_devices(&mut self) -> Result<Vec<RemoteDevice>, SyncError> {
        let response = self.call(Method::GET, "/devices", None::<&()>).await?;
        Ok(response.json().await?)
    }

    /// `POST /devices`. Returns the id the server assigned, when it says.
    pub async fn create_device<B: Serialize + ?Sized>(
        &mut self,
        payload: &B,
    ) -> Result<Option<String>, SyncError> {
        let response = self.call(Method::POST, "/devices", Some(payload)).await?;
        let body: serde_json::Value = response.json().await.unwrap_or_default();
        Ok(body.get("id").and_then(|v| v.as_str()).map(str::to_string))
    }

    /// `PUT /devices/{id}`; on 404 the device is created and the PUT is
    /// repeated once.
    pub async fn upsert_device<B: Serialize + ?Sized>(
        &mut self,
        device_id: &str,
        payload: &B,
    ) -> Result<(), SyncError> {
        let path = format!("/devices/{device_id}");
        match self.call(Method::PUT, &path, Some(payload)).await {
            Ok(_) => Ok(()),
            Err(SyncError::Rejected { status: 404, .. }) => {
                debug!(device_id, "device unknown to API, creating it");
                self.create_device(payload).await?;
                self.call(Method::PUT, &path, Some(payload)).await.map(|_| ())
            }
            Err(e) => Err(e),
        }
    }

    // ── Internal helpers ─────────────────────────────────────────────

    async fn call<B: Serialize + ?Sized>(
        &mut self,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<Response, SyncError> {
        let mut transient_failures = 0u32;
        let mut reauthenticated = false;

        loop {
            match self.attempt(method.clone(), path, body).await {
                Ok(response) => return Ok(response),
                Err(Failure::Unauthorized) if !reauthenticated => {
                    warn!(path, "API token rejected, logging in again");
                    self.token = None;
                    reauthenticated = true;
                }
                Err(Failure::Unauthorized) => {
                    self.token = None;
                    return Err(SyncError::AuthExpired);
                }
                Err(Failure::Other(e)) if e.is_transient() => {
                    transient_failures += 1;
                    if transient_failures >= self.retry_attempts {
                        return Err(SyncError::ExhaustedRetries {
                            attempts: transient_failures,
                            last: Box::new(e),
                        });
                    }
                    warn!(
                        path,
                        attempt = transient_failures,
                        max_attempts = self.retry_attempts,
                        error = %e,
                        "API request failed, retrying"
                    );
                    tokio::time::sleep(self.retry_delay).await;
                }
                Err(Failure::Other(e)) => return Err(e),
            }
        }
    }

    async fn attempt<B: Serialize + ?Sized>(
        &mut self,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<Response, Failure> {
        // Refused credentials are treated like a refused token so the retry
        // loop ends in AuthExpired instead of a generic rejection.
        let token = self.bearer().await.map_err(|e| match e {
            SyncError::Rejected { status: 401, .. } => Failure::Unauthorized,
            e => Failure::Other(e),
        })?;

        let url = format!("{}{}", self.base_url, path);
        let mut request = self.http.request(method, &url).bearer_auth(token);
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = request
            .send()
            .await
            .map_err(|e| Failure::Other(e.into()))?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            return Err(Failure::Unauthorized);
        }
        if status.is_server_error() {
            return Err(Failure::Other(SyncError::ServerError {
                status: status.as_u16(),
            }));
        }
        if !status.is_success() {
            return Err(Failure::Other(SyncError::Rejected {
                status: status.as_u16(),
                message: error_message(response).await,
            }));
        }
        Ok(response)
    }

    /// Cached token, logging in first when there is none or it is about to
    /// expire.
    async fn bearer(&mut self) -> Result<String, SyncError> {
        if let Some(token) = &self.token {
            if Instant::now() < token.refresh_at {
                return Ok(token.value.expose_secret().to_string());
            }
        }
        let session = self.login().await?;
        Ok(session.token.expose_secret().to_string())
    }
}

/// `{"error": "..."}` body if present, else the raw text.
async fn error_message(response: Response) -> String {
    let text = response.text().await.unwrap_or_default();
    serde_json::from_str::<serde_json::Value>(&text)
        .ok()
        .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(str::to_string))
        .unwrap_or(text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer, retry_attempts: u32) -> ApiClient {
        ApiClient::new(ApiConfig {
            base_url: format!("{}/api", server.uri()),
            username: "Admin".into(),
            password: SecretString::from("Admin123".to_string()),
            timeout: Duration::from_secs(5),
            retry_attempts,
            retry_delay: Duration::from_millis(10),
        })
        .unwrap()
    }

    async fn mount_login(server: &MockServer, token: &str, times: u64) {
        Mock::given(method("POST"))
            .and(path("/api/login"))
            .and(body_json(json!({ "username": "Admin", "password": "Admin123" })))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({ "token": token, "expires_in": 3600 })),
            )
            .expect(times)
            .mount(server)
            .await;
    }

    fn put_count(requests: &[wiremock::Request]) -> usize {
        requests.iter().filter(|r| r.method.as_str() == "PUT").count()
    }

    #[tokio::test]
    async fn token_is_cached_between_calls() {
        let server = MockServer::start().await;
        mount_login(&server, "t1", 1).await;
        Mock::given(method("GET"))
            .and(path("/api/devices"))
            .and(header("authorization", "Bearer t1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                { "id": "device_router_01", "name": "Main Router", "status": "online" }
            ])))
            .expect(2)
            .mount(&server)
            .await;

        let mut api = client(&server, 3);
        let first = api.list_devices().await.unwrap();
        let second = api.list_devices().await.unwrap();
        assert_eq!(first[0].id, "device_router_01");
        assert_eq!(second.len(), 1);
    }

    #[tokio::test]
    async fn transient_failure_then_success_delivers_once() {
        let server = MockServer::start().await;
        mount_login(&server, "t1", 1).await;
        Mock::given(method("PUT"))
            .and(path("/api/devices/R1"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/api/devices/R1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "message": "ok" })))
            .expect(1)
            .mount(&server)
            .await;

        let mut api = client(&server, 3);
        api.upsert_device("R1", &json!({ "status": "online" })).await.unwrap();

        let requests = server.received_requests().await.unwrap();
        assert_eq!(put_count(&requests), 2);
    }

    #[tokio::test]
    async fn second_401_surfaces_auth_expired() {
        let server = MockServer::start().await;
        mount_login(&server, "t1", 2).await;
        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(401).set_body_json(json!({ "error": "Invalid or expired token" })))
            .expect(2)
            .mount(&server)
            .await;

        let mut api = client(&server, 3);
        let err = api.upsert_device("R1", &json!({})).await.unwrap_err();
        assert!(matches!(err, SyncError::AuthExpired), "{err:?}");
    }

    #[tokio::test]
    async fn single_401_is_replayed_after_relogin() {
        let server = MockServer::start().await;
        mount_login(&server, "fresh", 2).await;
        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(401))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(header("authorization", "Bearer fresh"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let mut api = client(&server, 3);
        api.upsert_device("R1", &json!({})).await.unwrap();
    }

    #[tokio::test]
    async fn unknown_device_is_created_then_updated() {
        let server = MockServer::start().await;
        mount_login(&server, "t1", 1).await;
        Mock::given(method("PUT"))
            .and(path("/api/devices/R1"))
            .respond_with(ResponseTemplate::new(404).set_body_json(json!({ "error": "Device not found" })))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/devices"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": "R1" })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/api/devices/R1"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let mut api = client(&server, 3);
        api.upsert_device("R1", &json!({ "name": "R1" })).await.unwrap();
    }

    #[tokio::test]
    async fn persistent_5xx_exhausts_retries() {
        let server = MockServer::start().await;
        mount_login(&server, "t1", 1).await;
        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(500))
            .expect(3)
            .mount(&server)
            .await;

        let mut api = client(&server, 3);
        match api.upsert_device("R1", &json!({})).await {
            Err(SyncError::ExhaustedRetries { attempts, last }) => {
                assert_eq!(attempts, 3);
                assert!(matches!(*last, SyncError::ServerError { status: 500 }));
            }
            other => panic!("expected exhausted retries, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn client_errors_are_not_retried() {
        let server = MockServer::start().await;
        mount_login(&server, "t1", 1).await;
        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({ "error": "Missing required fields" })))
            .expect(1)
            .mount(&server)
            .await;

        let mut api = client(&server, 3);
        match api.upsert_device("R1", &json!({})).await {
            Err(SyncError::Rejected { status, message }) => {
                assert_eq!(status, 400);
                assert_eq!(message, "Missing required fields");
            }
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn relogin_refused_surfaces_auth_expired() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/login"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({ "token": "t1", "expires_in": 3600 })),
            )
            .up_to_n_times(1)
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/login"))
            .respond_with(ResponseTemplate::new(401).set_body_json(json!({ "error": "Invalid credentials" })))
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(401))
            .expect(1)
            .mount(&server)
            .await;

        let mut api = client(&server, 3);
        let err = api.upsert_device("R1", &json!({})).await.unwrap_err();
        assert!(matches!(err, SyncError::AuthExpired), "{err:?}");
        assert!(api.token.is_none());
    }

    #[tokio::test]
    async fn bad_credentials_are_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/login"))
            .respond_with(ResponseTemplate::new(401).set_body_json(json!({ "error": "Invalid credentials" })))
            .mount(&server)
            .await;

        let mut api = client(&server, 3);
        let err = api.login().await.unwrap_err();
        assert!(matches!(err, SyncError::Rejected { status: 401, .. }), "{err:?}");
    }

    #[tokio::test]
    async fn unreachable_api_exhausts_retries() {
        let mut api = ApiClient::new(ApiConfig {
            base_url: "http://127.0.0.1:9/api".into(),
            username: "Admin".into(),
            password: SecretString::from("Admin123".to_string()),
            timeout: Duration::from_secs(1),
            retry_attempts: 2,
            retry_delay: Duration::from_millis(10),
        })
        .unwrap();
        let err = api.list_devices().await.unwrap_err();
        assert!(matches!(err, SyncError::ExhaustedRetries { attempts: 2, .. }), "{err:?}");
    }
}
