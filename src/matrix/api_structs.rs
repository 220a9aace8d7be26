//! Request and response structures for the client-server API endpoints used
//! during bootstrap.
//!
//! Matrix identifiers and key objects come from ruma, as re-exported by
//! matrix-sdk. The envelopes are local because ruma's endpoint types are
//! built as HTTP requests for its own client rather than serde bodies.

use std::{collections::BTreeMap, fmt};

use matrix_sdk::ruma::{
    OwnedDeviceId, OwnedUserId, api::client::uiaa::UserIdentifier, encryption::DeviceKeys,
    serde::Raw,
};
use serde::{Deserialize, Serialize, de::Error as _};

/// Login type for a password login.
pub const PASSWORD_LOGIN_TYPE: &str = "m.login.password";

/// Parameters of a password login.
#[derive(Clone, PartialEq, Eq)]
pub struct LoginParameters {
    /// Fully qualified user ID
    pub user_id: String,
    pub password: String,
    /// Device to log in as. The homeserver creates it if unknown, or picks a
    /// new ID when `None`.
    pub device_id: Option<String>,
    /// Display name of a newly created device
    pub device_name: String,
}

impl fmt::Debug for LoginParameters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoginParameters")
            .field("user_id", &self.user_id)
            .field("password", &"<redacted>")
            .field("device_id", &self.device_id)
            .field("device_name", &self.device_name)
            .finish()
    }
}

/// Body of `POST /_matrix/client/v3/login`.
#[derive(Serialize, Debug)]
pub struct LoginRequest<'a> {
    #[serde(rename = "type")]
    pub login_type: &'a str,
    pub identifier: UserIdentifier,
    pub password: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_id: Option<&'a str>,
    pub initial_device_display_name: &'a str,
}

impl<'a> From<&'a LoginParameters> for LoginRequest<'a> {
    fn from(parameters: &'a LoginParameters) -> Self {
        LoginRequest {
            login_type: PASSWORD_LOGIN_TYPE,
            identifier: UserIdentifier::UserIdOrLocalpart(parameters.user_id.clone()),
            password: &parameters.password,
            device_id: parameters.device_id.as_deref(),
            initial_device_display_name: &parameters.device_name,
        }
    }
}

/// Response of `POST /_matrix/client/v3/login`.
#[derive(Deserialize, Clone, PartialEq, Eq)]
pub struct LoginResponse {
    pub user_id: String,
    pub access_token: String,
    pub device_id: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
}

impl fmt::Debug for LoginResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoginResponse")
            .field("user_id", &self.user_id)
            .field("device_id", &self.device_id)
            .finish_non_exhaustive()
    }
}

/// Response of `GET /_matrix/client/v3/account/whoami`.
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct WhoAmIResponse {
    pub user_id: String,
    /// Absent for appservice users and on old homeservers
    #[serde(default)]
    pub device_id: Option<String>,
}

/// Body of `POST /_matrix/client/v3/keys/query`.
#[derive(Serialize, Debug)]
pub struct KeysQueryRequest<'a> {
    /// User ID -> device IDs to query
    pub device_keys: BTreeMap<&'a str, Vec<&'a str>>,
}

/// Response of `POST /_matrix/client/v3/keys/query`.
///
/// Device keys stay raw: only their ed25519 key is read, and the signatures
/// are checked by the crypto store, not here.
#[derive(Deserialize, Debug, Default)]
pub struct KeysQueryResponse {
    #[serde(default)]
    pub device_keys: BTreeMap<OwnedUserId, BTreeMap<OwnedDeviceId, Raw<DeviceKeys>>>,
}

impl KeysQueryResponse {
    fn device(&self, user_id: &str, device_id: &str) -> Option<&Raw<DeviceKeys>> {
        let (_, devices) = self
            .device_keys
            .iter()
            .find(|(user, _)| user.as_str() == user_id)?;
        devices
            .iter()
            .find(|(device, _)| device.as_str() == device_id)
            .map(|(_, keys)| keys)
    }

    /// Returns the ed25519 identity key the device published, if it published any.
    ///
    /// # Errors
    ///
    /// Fails when the device keys are present but hold no ed25519 key.
    pub fn ed25519_key(
        &self,
        user_id: &str,
        device_id: &str,
    ) -> Result<Option<String>, serde_json::Error> {
        let Some(device_keys) = self.device(user_id, device_id) else {
            return Ok(None);
        };

        let mut keys: BTreeMap<String, String> =
            device_keys.get_field("keys")?.unwrap_or_default();
        keys.remove(&format!("ed25519:{device_id}"))
            .map(Some)
            .ok_or_else(|| {
                serde_json::Error::custom(format!("device {device_id} published no ed25519 key"))
            })
    }
}

/// Standard error body returned by the homeserver.
#[derive(Deserialize, Debug)]
pub struct ErrorResponse {
    pub errcode: String,
    #[serde(default)]
    pub error: String,
}
