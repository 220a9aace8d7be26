//! Selection of the authentication material.

use std::fmt;

use crate::{config, error::BootstrapError};

/// Authentication material used to obtain a session.
#[derive(Clone, PartialEq, Eq)]
pub enum Credential {
    /// Account password, exchanged for an access token by an interactive login
    Password(String),
    /// Access token of an existing login
    Token(String),
}

// Secrets never reach the logs
impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credential::Password(_) => f.write_str("Password(<redacted>)"),
            Credential::Token(_) => f.write_str("Token(<redacted>)"),
        }
    }
}

/// Picks the credential to authenticate with.
///
/// A non-empty `user_token` always wins. Otherwise a non-empty `user_password`
/// is selected. Empty strings count as absent.
///
/// # Arguments
///
/// * `matrix` - The `matrix` configuration section.
///
/// # Examples
///
/// ```ignore
/// let credential = resolve_credential(&config.matrix)?;
/// assert!(matches!(credential, Credential::Token(_)));
/// ```
///
/// # Errors
///
/// Returns [`BootstrapError::MissingCredential`] when neither is set.
pub fn resolve_credential(matrix: &config::Matrix) -> Result<Credential, BootstrapError> {
    let non_empty = |value: &Option<String>| {
        value
            .as_deref()
            .filter(|value| !value.is_empty())
            .map(str::to_string)
    };

    if let Some(token) = non_empty(&matrix.user_token) {
        return Ok(Credential::Token(token));
    }
    if let Some(password) = non_empty(&matrix.user_password) {
        return Ok(Credential::Password(password));
    }

    Err(BootstrapError::MissingCredential)
}
