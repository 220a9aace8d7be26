//! HTTP client for the homeserver client-server API.
//!
//! The bootstrapper has to authenticate and inspect the device before it can
//! decide whether the local encryption store may be attached. These few calls
//! are made with [`HomeserverRequester`] rather than the Matrix SDK client,
//! which only gets built once the device is known to be safe to use.

use std::{collections::BTreeMap, time::Duration};

use log::{debug, info};
use mockall::automock;
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::{
    error::BootstrapError,
    matrix::api_structs::{
        ErrorResponse, KeysQueryRequest, KeysQueryResponse, LoginParameters, LoginRequest,
        LoginResponse, WhoAmIResponse,
    },
};

/// Errors returned by a [`Homeserver`] call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HomeserverError {
    /// The request did not get an answer (connection, TLS or timeout failure).
    #[error("request failed: {0}")]
    Unreachable(String),

    /// The homeserver answered with an error status.
    #[error("request rejected with status {status} ({errcode}): {message}")]
    Rejected {
        status: u16,
        errcode: String,
        message: String,
    },

    /// The homeserver answered with a body that could not be understood.
    #[error("unexpected response: {0}")]
    Unexpected(String),
}

impl From<HomeserverError> for BootstrapError {
    fn from(error: HomeserverError) -> Self {
        match error {
            HomeserverError::Rejected {
                status: 400 | 401 | 403,
                ..
            } => BootstrapError::AuthenticationFailed(error.to_string()),
            _ => BootstrapError::HomeserverUnreachable(error.to_string()),
        }
    }
}

/// Client-server API calls made during bootstrap.
///
/// This trait abstracts the HTTP operations for easier testing with mocks.
#[automock]
pub trait Homeserver {
    /// Exchanges a password for an access token bound to a device.
    async fn login(&self, parameters: &LoginParameters) -> Result<LoginResponse, HomeserverError>;
    /// Returns the user and device an access token belongs to.
    async fn whoami(&self, access_token: &str) -> Result<WhoAmIResponse, HomeserverError>;
    /// Returns the ed25519 key the device published for end-to-end
    /// encryption, or `None` if it published no keys yet.
    async fn published_device_key(
        &self,
        access_token: &str,
        user_id: &str,
        device_id: &str,
    ) -> Result<Option<String>, HomeserverError>;
    /// Invalidates an access token.
    async fn logout(&self, access_token: &str) -> Result<(), HomeserverError>;
}

/// [`Homeserver`] implementation over HTTP.
pub struct HomeserverRequester {
    /// Homeserver base URL, without trailing slash
    url: String,
    /// HTTP client
    client: Client,
}

impl HomeserverRequester {
    /// Create a new [HomeserverRequester].
    ///
    /// # Arguments
    ///
    /// * `url` - The base URL of the homeserver client API.
    /// * `timeout` - Upper bound for each request.
    ///
    /// # Examples
    ///
    /// ```ignore
    /// let requester = HomeserverRequester::new("https://matrix.example.com", Duration::from_secs(30))?;
    /// let whoami = requester.whoami("syt_...").await?;
    /// ```
    pub fn new(url: &str, timeout: Duration) -> Result<Self, HomeserverError> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()
            .map_err(|e| HomeserverError::Unexpected(e.to_string()))?;

        Ok(HomeserverRequester {
            url: url.trim_end_matches('/').to_string(),
            client,
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/_matrix/client/v3/{}", self.url, path)
    }
}

/// Decodes a successful response, or turns an error status into
/// [`HomeserverError::Rejected`].
async fn parse_response<T: DeserializeOwned>(response: Response) -> Result<T, HomeserverError> {
    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|e| HomeserverError::Unreachable(e.to_string()))?;

    if !status.is_success() {
        let ErrorResponse { errcode, error } =
            serde_json::from_str(&body).unwrap_or(ErrorResponse {
                errcode: "M_UNKNOWN".to_string(),
                error: body,
            });
        return Err(HomeserverError::Rejected {
            status: status.as_u16(),
            errcode,
            message: error,
        });
    }

    serde_json::from_str(&body).map_err(|e| HomeserverError::Unexpected(e.to_string()))
}

fn unreachable(error: reqwest::Error) -> HomeserverError {
    HomeserverError::Unreachable(error.to_string())
}

impl Homeserver for HomeserverRequester {
    /// Request `POST /login` with an `m.login.password` body.
    async fn login(&self, parameters: &LoginParameters) -> Result<LoginResponse, HomeserverError> {
        let url = self.endpoint("login");
        info!(
            "log in as {} on device {}",
            parameters.user_id,
            parameters.device_id.as_deref().unwrap_or("<new>")
        );

        let response = self
            .client
            .post(&url)
            .json(&LoginRequest::from(parameters))
            .send()
            .await
            .map_err(unreachable)?;
        let login_response: LoginResponse = parse_response(response).await?;

        debug!("response from {} -> {:?}", &url, &login_response);
        Ok(login_response)
    }

    /// Request `GET /account/whoami`.
    async fn whoami(&self, access_token: &str) -> Result<WhoAmIResponse, HomeserverError> {
        let url = self.endpoint("account/whoami");
        debug!("request {}", &url);

        let response = self
            .client
            .get(&url)
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(unreachable)?;
        let whoami: WhoAmIResponse = parse_response(response).await?;

        debug!("response from {} -> {:?}", &url, &whoami);
        Ok(whoami)
    }

    /// Request `POST /keys/query` for a single device.
    async fn published_device_key(
        &self,
        access_token: &str,
        user_id: &str,
        device_id: &str,
    ) -> Result<Option<String>, HomeserverError> {
        let url = self.endpoint("keys/query");
        debug!("request {} for {} device {}", &url, user_id, device_id);

        let body = KeysQueryRequest {
            device_keys: BTreeMap::from([(user_id, vec![device_id])]),
        };
        let response = self
            .client
            .post(&url)
            .bearer_auth(access_token)
            .json(&body)
            .send()
            .await
            .map_err(unreachable)?;
        let keys: KeysQueryResponse = parse_response(response).await?;

        let ed25519_key = keys
            .ed25519_key(user_id, device_id)
            .map_err(|e| HomeserverError::Unexpected(e.to_string()))?;
        debug!("device {} published key {:?}", device_id, ed25519_key);
        Ok(ed25519_key)
    }

    /// Request `POST /logout`.
    async fn logout(&self, access_token: &str) -> Result<(), HomeserverError> {
        let url = self.endpoint("logout");
        debug!("request {}", &url);

        let response = self
            .client
            .post(&url)
            .bearer_auth(access_token)
            .json(&serde_json::json!({}))
            .send()
            .await
            .map_err(unreachable)?;
        let _: serde_json::Value = parse_response(response).await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn login_parameters() -> LoginParameters {
        LoginParameters {
            user_id: "@edubot:example.com".to_string(),
            password: "hunter2".to_string(),
            device_id: Some("EDUBOT".to_string()),
            device_name: "edubot".to_string(),
        }
    }

    #[tokio::test]
    async fn test_login() {
        let mut server = mockito::Server::new_async().await;
        let body = r#"{"user_id": "@edubot:example.com", "access_token": "syt_abc", "device_id": "EDUBOT"}"#;

        let mock = server
            .mock("POST", "/_matrix/client/v3/login")
            .match_body(mockito::Matcher::PartialJson(serde_json::json!({
                "type": "m.login.password",
                "identifier": {"type": "m.id.user", "user": "@edubot:example.com"},
                "password": "hunter2",
                "device_id": "EDUBOT",
                "initial_device_display_name": "edubot"
            })))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(body)
            .create_async()
            .await;

        let requester = HomeserverRequester::new(&server.url(), TIMEOUT).unwrap();
        let response = requester.login(&login_parameters()).await.unwrap();

        mock.assert_async().await;
        assert_eq!(response.user_id, "@edubot:example.com");
        assert_eq!(response.access_token, "syt_abc");
        assert_eq!(response.device_id, "EDUBOT");
    }

    #[tokio::test]
    async fn test_login_forbidden() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/_matrix/client/v3/login")
            .with_status(403)
            .with_header("content-type", "application/json")
            .with_body(r#"{"errcode": "M_FORBIDDEN", "error": "Invalid password"}"#)
            .create_async()
            .await;

        let requester = HomeserverRequester::new(&server.url(), TIMEOUT).unwrap();
        let error = requester.login(&login_parameters()).await.unwrap_err();

        assert_eq!(
            error,
            HomeserverError::Rejected {
                status: 403,
                errcode: "M_FORBIDDEN".to_string(),
                message: "Invalid password".to_string(),
            }
        );
        assert!(matches!(
            BootstrapError::from(error),
            BootstrapError::AuthenticationFailed(_)
        ));
    }

    #[tokio::test]
    async fn test_whoami_sends_bearer_token() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/_matrix/client/v3/account/whoami")
            .match_header("authorization", "Bearer syt_abc")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"user_id": "@edubot:example.com", "device_id": "EDUBOT", "is_guest": false}"#)
            .create_async()
            .await;

        // Trailing slash in the configured URL must not produce a double slash
        let requester = HomeserverRequester::new(&format!("{}/", server.url()), TIMEOUT).unwrap();
        let whoami = requester.whoami("syt_abc").await.unwrap();

        assert_eq!(whoami.user_id, "@edubot:example.com");
        assert_eq!(whoami.device_id.as_deref(), Some("EDUBOT"));
    }

    #[tokio::test]
    async fn test_whoami_unknown_token() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/_matrix/client/v3/account/whoami")
            .with_status(401)
            .with_body(r#"{"errcode": "M_UNKNOWN_TOKEN", "error": "Invalid access token"}"#)
            .create_async()
            .await;

        let requester = HomeserverRequester::new(&server.url(), TIMEOUT).unwrap();
        let error = requester.whoami("syt_expired").await.unwrap_err();

        assert!(matches!(
            &error,
            HomeserverError::Rejected { status: 401, errcode, .. } if errcode == "M_UNKNOWN_TOKEN"
        ));
    }

    #[tokio::test]
    async fn test_published_device_key() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/_matrix/client/v3/keys/query")
            .match_header("authorization", "Bearer syt_abc")
            .match_body(mockito::Matcher::Json(serde_json::json!({
                "device_keys": {"@edubot:example.com": ["EDUBOT"]}
            })))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"device_keys": {"@edubot:example.com": {"EDUBOT": {"device_id": "EDUBOT", "keys": {"ed25519:EDUBOT": "ed_key"}}}}}"#,
            )
            .create_async()
            .await;

        let requester = HomeserverRequester::new(&server.url(), TIMEOUT).unwrap();
        let key = requester
            .published_device_key("syt_abc", "@edubot:example.com", "EDUBOT")
            .await
            .unwrap();
        assert_eq!(key.as_deref(), Some("ed_key"));
    }

    #[tokio::test]
    async fn test_device_without_keys() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/_matrix/client/v3/keys/query")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"device_keys": {"@edubot:example.com": {}}, "failures": {}}"#)
            .create_async()
            .await;

        let requester = HomeserverRequester::new(&server.url(), TIMEOUT).unwrap();
        assert!(
            requester
                .published_device_key("syt_abc", "@edubot:example.com", "EDUBOT")
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_published_device_without_ed25519_key() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/_matrix/client/v3/keys/query")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"device_keys": {"@edubot:example.com": {"EDUBOT": {"keys": {}}}}}"#)
            .create_async()
            .await;

        let requester = HomeserverRequester::new(&server.url(), TIMEOUT).unwrap();
        assert!(matches!(
            requester
                .published_device_key("syt_abc", "@edubot:example.com", "EDUBOT")
                .await,
            Err(HomeserverError::Unexpected(_))
        ));
    }

    #[tokio::test]
    async fn test_logout() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/_matrix/client/v3/logout")
            .match_header("authorization", "Bearer syt_abc")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body("{}")
            .create_async()
            .await;

        let requester = HomeserverRequester::new(&server.url(), TIMEOUT).unwrap();
        requester.logout("syt_abc").await.unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_server_error_maps_to_unreachable() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/_matrix/client/v3/account/whoami")
            .with_status(502)
            .with_body("Bad Gateway")
            .create_async()
            .await;

        let requester = HomeserverRequester::new(&server.url(), TIMEOUT).unwrap();
        let error = requester.whoami("syt_abc").await.unwrap_err();

        assert!(matches!(
            &error,
            HomeserverError::Rejected { status: 502, errcode, message } if errcode == "M_UNKNOWN" && message == "Bad Gateway"
        ));
        assert!(matches!(
            BootstrapError::from(error),
            BootstrapError::HomeserverUnreachable(_)
        ));
    }

    #[tokio::test]
    async fn test_malformed_body() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/_matrix/client/v3/account/whoami")
            .with_status(200)
            .with_body("not json")
            .create_async()
            .await;

        let requester = HomeserverRequester::new(&server.url(), TIMEOUT).unwrap();
        assert!(matches!(
            requester.whoami("syt_abc").await,
            Err(HomeserverError::Unexpected(_))
        ));
    }

    #[tokio::test]
    async fn test_connection_refused() {
        // Nothing listens on port 1
        let requester = HomeserverRequester::new("http://127.0.0.1:1", TIMEOUT).unwrap();
        let error = requester.whoami("syt_abc").await.unwrap_err();

        assert!(matches!(error, HomeserverError::Unreachable(_)));
        assert!(matches!(
            BootstrapError::from(error),
            BootstrapError::HomeserverUnreachable(_)
        ));
    }
}
