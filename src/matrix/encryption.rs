//! Matrix client construction and cross-signing setup.
//!
//! The SDK client is only built once the device is known to match the local
//! store, so the encryption store it opens always belongs to the device the
//! session runs as.

use log::{debug, info, warn};
use matrix_sdk::{
    Client,
    authentication::matrix::MatrixSession,
    encryption::{BackupDownloadStrategy, EncryptionSettings},
    ruma::api::client::uiaa,
};

use crate::{
    error::BootstrapError,
    matrix::{BotIdentity, Credential},
    storage::StoreHandle,
};

/// Bootstraps cross-signing for the Matrix client if not already configured.
///
/// When the homeserver asks for user-interactive authentication, the password
/// is sent if the session was obtained with one. Token sessions cannot answer
/// the challenge and skip the setup.
///
/// See <https://docs.rs/matrix-sdk/latest/matrix_sdk/encryption/struct.Encryption.html#method.bootstrap_cross_signing_if_needed>
async fn bootstrap_cross_signing(
    client: &Client,
    identity: &BotIdentity,
    credential: &Credential,
) -> Result<(), anyhow::Error> {
    debug!("setting up cross signing");

    let Err(e) = client
        .encryption()
        .bootstrap_cross_signing_if_needed(None)
        .await
    else {
        debug!("cross signing already set up");
        return Ok(());
    };

    let Some(response) = e.as_uiaa_response() else {
        anyhow::bail!("{e}");
    };
    let Credential::Password(password) = credential else {
        anyhow::bail!("homeserver requires interactive authentication, which a token cannot provide");
    };

    let mut password = uiaa::Password::new(
        uiaa::UserIdentifier::UserIdOrLocalpart(identity.user_id().to_string()),
        password.to_owned(),
    );
    password.session = response.session.clone();

    // Already known to be needed, no need to check again
    client
        .encryption()
        .bootstrap_cross_signing(Some(uiaa::AuthData::Password(password)))
        .await?;

    debug!("cross signing set up");
    Ok(())
}

/// Builds the Matrix client on top of the store's encryption database and
/// restores `user_session` into it.
///
/// Cross-signing setup failures are logged and do not fail the bootstrap:
/// the device can still encrypt and decrypt without it.
///
/// # Arguments
///
/// * `identity` - The bot account.
/// * `user_session` - The authenticated session, already checked against the store.
/// * `store` - The store holding the encryption database.
/// * `credential` - Answers the interactive authentication of cross-signing.
/// * `published_key` - The ed25519 key the homeserver has for the device, if any.
///
/// # Errors
///
/// - [`BootstrapError::StoreUnavailable`] if the encryption store cannot be opened
/// - [`BootstrapError::DeviceIdentityMismatch`] if the encryption store refuses
///   the session, or its account does not own `published_key`
///
/// # Examples
///
/// ```ignore
/// let client = attach_client(&identity, &session, &store, &credential, None).await?;
/// client.sync_once(SyncSettings::default()).await?;
/// ```
pub(crate) async fn attach_client(
    identity: &BotIdentity,
    user_session: &MatrixSession,
    store: &StoreHandle,
    credential: &Credential,
    published_key: Option<&str>,
) -> Result<Client, BootstrapError> {
    info!(
        "attaching matrix client for {} on device {}",
        identity.user_id(),
        user_session.meta.device_id
    );

    // Backups need a recovery key, which the bot has no way to hold
    let encryption_settings = EncryptionSettings {
        auto_enable_cross_signing: true,
        backup_download_strategy: BackupDownloadStrategy::default(),
        auto_enable_backups: false,
    };

    let client = Client::builder()
        .homeserver_url(identity.homeserver_url().as_str())
        .sqlite_store(store.sqlite_path(), None)
        .with_encryption_settings(encryption_settings)
        .build()
        .await
        .map_err(|e| {
            BootstrapError::StoreUnavailable(format!(
                "cannot open encryption store {}: {e}",
                store.sqlite_path().display()
            ))
        })?;
    debug!("matrix client created");

    client
        .restore_session(user_session.clone())
        .await
        .map_err(|e| BootstrapError::DeviceIdentityMismatch {
            device_id: user_session.meta.device_id.to_string(),
            detail: format!("the encryption store refused the session: {e}"),
        })?;
    debug!("session restored into the matrix client");

    if let Some(published_key) = published_key {
        let local_key = client.encryption().ed25519_key().await;
        if local_key.as_deref() != Some(published_key) {
            return Err(BootstrapError::DeviceIdentityMismatch {
                device_id: user_session.meta.device_id.to_string(),
                detail: "the encryption store holds other keys than the ones the device published"
                    .to_string(),
            });
        }
        debug!("encryption store holds the published keys of the device");
    }

    if let Err(e) = bootstrap_cross_signing(&client, identity, credential).await {
        warn!("cross signing is not set up, other users may not trust this device: {e}");
    }

    Ok(client)
}
