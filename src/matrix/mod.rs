//! Matrix protocol integration for the bot.
//!
//! This module turns the `matrix` configuration section into typed values and
//! provides everything the bootstrapper needs to talk to the homeserver:
//! - [`BotIdentity`] and [`DeviceRecord`]: who the bot is and which device it runs as
//! - [`Credential`]: the authentication material selected by [`resolve_credential`]
//! - [`Homeserver`]: the client-server API calls made before the SDK client exists
//! - [`Session`]: the live, encryption capable session handed to the sync loop

mod api_structs;
mod credential;
mod encryption;
mod homeserver;
mod session;
mod sync;

use std::net::IpAddr;

use anyhow::{Context, bail};
use matrix_sdk::ruma::{OwnedUserId, UserId};
use reqwest::Url;

use crate::config;

pub use crate::matrix::api_structs::LoginParameters;
#[cfg(test)]
pub use crate::matrix::api_structs::{LoginResponse, WhoAmIResponse};
pub use crate::matrix::credential::{Credential, resolve_credential};
pub(crate) use crate::matrix::encryption::attach_client;
#[cfg(test)]
pub use crate::matrix::homeserver::MockHomeserver;
pub use crate::matrix::homeserver::{Homeserver, HomeserverError, HomeserverRequester};
pub use crate::matrix::session::Session;

/// The bot's account on the homeserver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BotIdentity {
    /// Fully qualified user ID, `@localpart:server`
    user_id: OwnedUserId,
    /// Base URL of the homeserver client API
    homeserver_url: Url,
}

impl BotIdentity {
    /// Validates and builds an identity.
    ///
    /// The homeserver must be served over HTTPS. Plain HTTP is accepted for
    /// loopback hosts only, which covers local development servers.
    ///
    /// # Errors
    ///
    /// Returns an error if the user ID is not of the form `@name:domain` or if
    /// the homeserver URL is not a usable HTTPS URL.
    pub fn new(user_id: &str, homeserver_url: &str) -> anyhow::Result<Self> {
        let user_id = UserId::parse(user_id).with_context(|| {
            format!("matrix.user_id '{user_id}' must be in the form @name:domain")
        })?;

        let url = Url::parse(homeserver_url)
            .with_context(|| format!("matrix.homeserver_url '{homeserver_url}' is not a URL"))?;
        match url.scheme() {
            "https" => {}
            "http" if is_loopback(&url) => {}
            _ => bail!(
                "matrix.homeserver_url '{}' must use https",
                homeserver_url
            ),
        }
        if url.host_str().is_none() {
            bail!("matrix.homeserver_url '{}' has no host", homeserver_url);
        }

        Ok(BotIdentity {
            user_id,
            homeserver_url: url,
        })
    }

    pub fn from_config(matrix: &config::Matrix) -> anyhow::Result<Self> {
        BotIdentity::new(&matrix.user_id, &matrix.homeserver_url)
    }

    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    pub fn homeserver_url(&self) -> &Url {
        &self.homeserver_url
    }

    /// The user ID without the leading `@` and the server part.
    pub fn localpart(&self) -> &str {
        self.user_id.localpart()
    }
}

fn is_loopback(url: &Url) -> bool {
    match url.host_str() {
        Some("localhost") => true,
        Some(host) => host
            .trim_start_matches('[')
            .trim_end_matches(']')
            .parse::<IpAddr>()
            .is_ok_and(|ip| ip.is_loopback()),
        None => false,
    }
}

/// The client instance as known to the homeserver.
///
/// End-to-end encryption keys are scoped to a device, so a device ID is only
/// usable together with the store that holds its keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceRecord {
    /// Configured device ID, `None` to let the homeserver or the store decide
    device_id: Option<String>,
    /// Display name given to a newly created device
    device_name: String,
}

impl DeviceRecord {
    /// Builds a device record. An empty device ID counts as unset.
    pub fn new(device_id: Option<String>, device_name: String) -> Self {
        DeviceRecord {
            device_id: device_id.filter(|id| !id.trim().is_empty()),
            device_name,
        }
    }

    /// Builds the device record from configuration, naming the device after
    /// the bot's localpart when no name is configured.
    pub fn from_config(matrix: &config::Matrix, identity: &BotIdentity) -> Self {
        let device_name = matrix
            .device_name
            .clone()
            .filter(|name| !name.trim().is_empty())
            .unwrap_or_else(|| identity.localpart().to_string());

        DeviceRecord::new(matrix.device_id.clone(), device_name)
    }

    pub fn device_id(&self) -> Option<&str> {
        self.device_id.as_deref()
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matrix_config(device_id: Option<&str>, device_name: Option<&str>) -> config::Matrix {
        config::Matrix {
            user_id: "@edubot:example.com".to_string(),
            user_password: Some("hunter2".to_string()),
            user_token: None,
            homeserver_url: "https://matrix.example.com".to_string(),
            device_id: device_id.map(str::to_string),
            device_name: device_name.map(str::to_string),
        }
    }

    #[test]
    fn test_identity_valid() {
        let identity = BotIdentity::new("@edubot:example.com", "https://matrix.example.com").unwrap();
        assert_eq!(identity.user_id().as_str(), "@edubot:example.com");
        assert_eq!(identity.localpart(), "edubot");
        assert_eq!(identity.homeserver_url().host_str(), Some("matrix.example.com"));
    }

    #[test]
    fn test_identity_rejects_bad_user_id() {
        assert!(BotIdentity::new("edubot", "https://matrix.example.com").is_err());
        assert!(BotIdentity::new("@edubot", "https://matrix.example.com").is_err());
    }

    #[test]
    fn test_identity_requires_https_except_loopback() {
        assert!(BotIdentity::new("@edubot:example.com", "http://matrix.example.com").is_err());
        assert!(BotIdentity::new("@edubot:example.com", "ftp://matrix.example.com").is_err());
        assert!(BotIdentity::new("@edubot:example.com", "not a url").is_err());

        assert!(BotIdentity::new("@edubot:localhost", "http://localhost:8008").is_ok());
        assert!(BotIdentity::new("@edubot:localhost", "http://127.0.0.1:8008").is_ok());
        assert!(BotIdentity::new("@edubot:localhost", "http://[::1]:8008").is_ok());
    }

    #[test]
    fn test_device_record_empty_id_is_unset() {
        let device = DeviceRecord::new(Some("  ".to_string()), "edubot".to_string());
        assert_eq!(device.device_id(), None);

        let device = DeviceRecord::new(Some("EDUBOT".to_string()), "edubot".to_string());
        assert_eq!(device.device_id(), Some("EDUBOT"));
    }

    #[test]
    fn test_device_record_from_config_defaults_name_to_localpart() {
        let identity = BotIdentity::new("@edubot:example.com", "https://matrix.example.com").unwrap();

        let device = DeviceRecord::from_config(&matrix_config(Some("DEV"), None), &identity);
        assert_eq!(device.device_name(), "edubot");
        assert_eq!(device.device_id(), Some("DEV"));

        let device = DeviceRecord::from_config(&matrix_config(None, Some("Edu Bot")), &identity);
        assert_eq!(device.device_name(), "Edu Bot");
        assert_eq!(device.device_id(), None);
    }
}
