//! Session bootstrap: from configuration to a live Matrix session.
//!
//! The [`Bootstrapper`] runs three operations, in order:
//!
//! ```text
//! Unconfigured ─resolve_credential─▶ CredentialResolved ─open_store─▶ StoreOpened
//!      ─establish_session─▶ Authenticated ─▶ SessionActive
//! ```
//!
//! Any failure moves it to [`BootstrapState::Failed`], which is terminal: every
//! later call returns the error that caused it. Nothing is retried here.
//!
//! The device check is the heart of [`Bootstrapper::establish_session`].
//! Encryption keys are bound to a device and live in the local store. Running
//! as a device whose keys are elsewhere makes other clients encrypt for keys
//! this session does not hold, and incoming encrypted messages are dropped
//! without any error. Every such case fails with
//! [`BootstrapError::DeviceIdentityMismatch`] instead.

use std::{path::Path, time::Duration};

use log::{debug, error, info, warn};
use matrix_sdk::{SessionMeta, SessionTokens, authentication::matrix::MatrixSession};
use tokio::time;

use crate::{
    config::{self, Config},
    error::BootstrapError,
    matrix::{
        self, BotIdentity, Credential, DeviceRecord, Homeserver, HomeserverError,
        HomeserverRequester, LoginParameters, Session, attach_client,
    },
    storage::StoreHandle,
};

/// Progress of a [`Bootstrapper`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootstrapState {
    Unconfigured,
    CredentialResolved,
    StoreOpened,
    Authenticated,
    SessionActive,
    /// Terminal. Holds the error that stopped the bootstrap.
    Failed(BootstrapError),
}

impl BootstrapState {
    fn rank(&self) -> u8 {
        match self {
            BootstrapState::Unconfigured => 0,
            BootstrapState::CredentialResolved => 1,
            BootstrapState::StoreOpened => 2,
            BootstrapState::Authenticated => 3,
            BootstrapState::SessionActive => 4,
            BootstrapState::Failed(_) => 5,
        }
    }
}

/// Result of the authentication step.
struct Authentication {
    /// Session the SDK client will be restored with
    session: MatrixSession,
    /// Whether the access token was created by this bootstrap, and must be
    /// logged out if the bootstrap fails afterwards
    fresh_login: bool,
}

/// Drives the bootstrap sequence against a [`Homeserver`].
pub struct Bootstrapper<H: Homeserver> {
    homeserver: H,
    /// Upper bound of each homeserver call and of opening the store
    timeout: Duration,
    state: BootstrapState,
}

impl Bootstrapper<HomeserverRequester> {
    /// Builds a bootstrapper talking to the configured homeserver over HTTP.
    pub fn from_config(config: &Config, identity: &BotIdentity) -> anyhow::Result<Self> {
        let timeout = config.bootstrap.timeout();
        let homeserver = HomeserverRequester::new(identity.homeserver_url().as_str(), timeout)?;
        Ok(Bootstrapper::new(homeserver, timeout))
    }
}

impl<H: Homeserver> Bootstrapper<H> {
    /// Create a new [Bootstrapper] in the `Unconfigured` state.
    ///
    /// # Arguments
    ///
    /// * `homeserver` - The client-server API used to authenticate.
    /// * `timeout` - Upper bound of each homeserver call and of opening the store.
    ///
    /// # Examples
    ///
    /// ```ignore
    /// let homeserver = HomeserverRequester::new("https://matrix.example.com", timeout)?;
    /// let mut bootstrapper = Bootstrapper::new(homeserver, timeout);
    /// let session = bootstrapper.run(&config, &identity).await?;
    /// ```
    pub fn new(homeserver: H, timeout: Duration) -> Self {
        Bootstrapper {
            homeserver,
            timeout,
            state: BootstrapState::Unconfigured,
        }
    }

    pub fn state(&self) -> &BootstrapState {
        &self.state
    }

    /// Runs the whole sequence with the values from `config`.
    ///
    /// # Arguments
    ///
    /// * `config` - The loaded configuration.
    /// * `identity` - The bot account, built from `config.matrix`.
    ///
    /// # Errors
    ///
    /// Returns the error of the first step that fails. See
    /// [`Bootstrapper::establish_session`].
    pub async fn run(
        &mut self,
        config: &Config,
        identity: &BotIdentity,
    ) -> Result<Session, BootstrapError> {
        let credential = self.resolve_credential(&config.matrix)?;
        let store = self
            .open_store(Path::new(&config.storage.store_path), &config.storage.database)
            .await?;
        let device = DeviceRecord::from_config(&config.matrix, identity);

        self.establish_session(identity, &credential, &device, store)
            .await
    }

    /// Picks the credential to authenticate with. See [`matrix::resolve_credential`].
    pub fn resolve_credential(
        &mut self,
        matrix: &config::Matrix,
    ) -> Result<Credential, BootstrapError> {
        self.ensure_not_failed()?;
        let result = matrix::resolve_credential(matrix);
        if let Ok(credential) = &result {
            debug!("using credential {:?}", credential);
        }
        self.record(result, BootstrapState::CredentialResolved)
    }

    /// Opens the local store and the bot database.
    ///
    /// See [`StoreHandle::open`]. Giving up after the timeout counts as
    /// [`BootstrapError::StoreUnavailable`].
    ///
    /// # Arguments
    ///
    /// * `store_path` - Directory of the store, created if absent.
    /// * `database_uri` - `sqlite://` or `postgres://` connection string.
    pub async fn open_store(
        &mut self,
        store_path: &Path,
        database_uri: &str,
    ) -> Result<StoreHandle, BootstrapError> {
        self.ensure_not_failed()?;
        let result = StoreHandle::open(store_path, database_uri, self.timeout).await;
        self.record(result, BootstrapState::StoreOpened)
    }

    /// Authenticates, checks the device against the store and attaches the
    /// encryption capable client.
    ///
    /// # Errors
    ///
    /// - [`BootstrapError::DeviceIdentityMismatch`] when the device this session
    ///   would run as is not the one whose keys the store holds
    /// - [`BootstrapError::AuthenticationFailed`] when the homeserver rejects the
    ///   credential, or the token belongs to another account
    /// - [`BootstrapError::HomeserverUnreachable`] when the homeserver does not answer
    /// - [`BootstrapError::StoreUnavailable`] when the session cannot be persisted
    pub async fn establish_session(
        &mut self,
        identity: &BotIdentity,
        credential: &Credential,
        device: &DeviceRecord,
        store: StoreHandle,
    ) -> Result<Session, BootstrapError> {
        self.ensure_not_failed()?;

        let persisted = store.user_session().await;
        let result = check_persisted_session(identity, device, persisted.as_ref());
        self.record(result, BootstrapState::StoreOpened)?;

        let result = self
            .authenticate(identity, credential, device, persisted.as_ref())
            .await;
        let authentication = self.record(result, BootstrapState::Authenticated)?;

        let result = self
            .activate(identity, credential, device, persisted.as_ref(), &authentication, store)
            .await;
        if result.is_err() && authentication.fresh_login {
            self.logout_quietly(&authentication.session.tokens.access_token)
                .await;
        }
        let session = self.record(result, BootstrapState::SessionActive)?;

        info!(
            "session active for {} on device {}",
            identity.user_id(),
            session.device_id()
        );
        Ok(session)
    }

    /// Returns the stored error once the bootstrap failed.
    fn ensure_not_failed(&self) -> Result<(), BootstrapError> {
        match &self.state {
            BootstrapState::Failed(error) => Err(error.clone()),
            _ => Ok(()),
        }
    }

    /// Moves forward to `next` on success, to `Failed` on error.
    fn record<T>(
        &mut self,
        result: Result<T, BootstrapError>,
        next: BootstrapState,
    ) -> Result<T, BootstrapError> {
        match result {
            Ok(value) => {
                if next.rank() > self.state.rank() {
                    self.state = next;
                }
                Ok(value)
            }
            Err(error) => {
                error!("bootstrap failed: {error}");
                self.state = BootstrapState::Failed(error.clone());
                Err(error)
            }
        }
    }

    /// Runs a homeserver call within the timeout.
    async fn call<T>(
        &self,
        request: impl Future<Output = Result<T, HomeserverError>>,
    ) -> Result<T, BootstrapError> {
        match time::timeout(self.timeout, request).await {
            Ok(result) => result.map_err(BootstrapError::from),
            Err(_) => Err(BootstrapError::HomeserverUnreachable(format!(
                "no answer within {}s",
                self.timeout.as_secs()
            ))),
        }
    }

    async fn authenticate(
        &self,
        identity: &BotIdentity,
        credential: &Credential,
        device: &DeviceRecord,
        persisted: Option<&MatrixSession>,
    ) -> Result<Authentication, BootstrapError> {
        match credential {
            Credential::Token(token) => {
                let whoami = self.call(self.homeserver.whoami(token)).await?;
                if whoami.user_id != identity.user_id().as_str() {
                    return Err(BootstrapError::AuthenticationFailed(format!(
                        "the access token belongs to {}, not {}",
                        whoami.user_id,
                        identity.user_id()
                    )));
                }

                let device_id = whoami
                    .device_id
                    .or_else(|| device.device_id().map(str::to_string))
                    .or_else(|| persisted.map(|session| session.meta.device_id.to_string()))
                    .ok_or_else(|| {
                        BootstrapError::AuthenticationFailed(
                            "the homeserver does not report the device of the access token, set matrix.device_id"
                                .to_string(),
                        )
                    })?;

                info!("authenticated with access token as device {device_id}");
                Ok(Authentication {
                    session: matrix_session(identity, &device_id, token.clone(), None),
                    fresh_login: false,
                })
            }
            Credential::Password(password) => {
                if let Some(persisted) = persisted
                    && self.can_resume(identity, persisted).await?
                {
                    info!(
                        "resuming persisted session on device {}",
                        persisted.meta.device_id
                    );
                    return Ok(Authentication {
                        session: persisted.clone(),
                        fresh_login: false,
                    });
                }

                let parameters = LoginParameters {
                    user_id: identity.user_id().to_string(),
                    password: password.clone(),
                    device_id: device
                        .device_id()
                        .map(str::to_string)
                        .or_else(|| persisted.map(|session| session.meta.device_id.to_string())),
                    device_name: device.device_name().to_string(),
                };
                debug!("logging in with {:?}", parameters);
                let response = self.call(self.homeserver.login(&parameters)).await?;

                if response.user_id != identity.user_id().as_str() {
                    self.logout_quietly(&response.access_token).await;
                    return Err(BootstrapError::AuthenticationFailed(format!(
                        "the homeserver logged in {}, not {}",
                        response.user_id,
                        identity.user_id()
                    )));
                }

                info!("logged in with password as device {}", response.device_id);
                Ok(Authentication {
                    session: matrix_session(
                        identity,
                        &response.device_id,
                        response.access_token,
                        response.refresh_token,
                    ),
                    fresh_login: true,
                })
            }
        }
    }

    /// Tells whether the access token of the persisted session is still valid.
    async fn can_resume(
        &self,
        identity: &BotIdentity,
        persisted: &MatrixSession,
    ) -> Result<bool, BootstrapError> {
        match self
            .call(self.homeserver.whoami(&persisted.tokens.access_token))
            .await
        {
            Ok(whoami) => {
                let same_device = whoami
                    .device_id
                    .as_deref()
                    .is_none_or(|device_id| device_id == persisted.meta.device_id.as_str());
                if whoami.user_id == identity.user_id().as_str() && same_device {
                    Ok(true)
                } else {
                    info!("persisted access token belongs to another login, logging in again");
                    Ok(false)
                }
            }
            Err(BootstrapError::AuthenticationFailed(reason)) => {
                info!("persisted access token is no longer valid ({reason}), logging in again");
                Ok(false)
            }
            Err(error) => Err(error),
        }
    }

    /// Checks that the device of `authentication` is the one whose keys the
    /// store holds, or a device that has none yet.
    ///
    /// `local_keys` tells whether the store still holds an encryption account.
    /// Returns the key the device published, which the account attached
    /// afterwards must own.
    async fn verify_device(
        &self,
        identity: &BotIdentity,
        device: &DeviceRecord,
        persisted: Option<&MatrixSession>,
        local_keys: bool,
        authentication: &Authentication,
    ) -> Result<Option<String>, BootstrapError> {
        let effective = authentication.session.meta.device_id.as_str();

        if let Some(configured) = device.device_id()
            && configured != effective
        {
            return Err(mismatch(
                configured,
                format!("the session runs as device {effective}"),
            ));
        }

        if let Some(persisted) = persisted
            && persisted.meta.device_id.as_str() != effective
        {
            return Err(mismatch(
                effective,
                format!(
                    "the store holds the keys of device {}",
                    persisted.meta.device_id
                ),
            ));
        }

        let published = self
            .call(self.homeserver.published_device_key(
                &authentication.session.tokens.access_token,
                identity.user_id().as_str(),
                effective,
            ))
            .await?;

        match (&published, persisted) {
            (None, _) => debug!("device {effective} has no published keys yet"),
            (Some(_), None) => {
                return Err(mismatch(
                    effective,
                    "the device already published encryption keys that this store does not hold, \
                     use a new device ID or the store that belongs to this device"
                        .to_string(),
                ));
            }
            (Some(_), Some(_)) if !local_keys => {
                return Err(mismatch(
                    effective,
                    "the store names this device but its encryption keys are gone, \
                     restore the encryption store or use a new device ID"
                        .to_string(),
                ));
            }
            (Some(_), Some(_)) => debug!("device {effective} published keys, the store must own them"),
        }

        Ok(published)
    }

    async fn activate(
        &self,
        identity: &BotIdentity,
        credential: &Credential,
        device: &DeviceRecord,
        persisted: Option<&MatrixSession>,
        authentication: &Authentication,
        store: StoreHandle,
    ) -> Result<Session, BootstrapError> {
        let published_key = self
            .verify_device(identity, device, persisted, store.has_crypto_store(), authentication)
            .await?;

        let client = match time::timeout(
            self.timeout,
            attach_client(
                identity,
                &authentication.session,
                &store,
                credential,
                published_key.as_deref(),
            ),
        )
        .await
        {
            Ok(result) => result?,
            Err(_) => {
                return Err(BootstrapError::HomeserverUnreachable(format!(
                    "encryption setup did not complete within {}s",
                    self.timeout.as_secs()
                )));
            }
        };

        store.persist_user_session(&authentication.session).await?;

        Ok(Session::new(
            client,
            identity.clone(),
            authentication.session.meta.device_id.to_string(),
            store,
        ))
    }

    /// Invalidates an access token this bootstrap created. Failures are only logged.
    async fn logout_quietly(&self, access_token: &str) {
        match self.call(self.homeserver.logout(access_token)).await {
            Ok(()) => debug!("logged out the access token of the failed bootstrap"),
            Err(e) => warn!("failed to log out the access token of the failed bootstrap: {e}"),
        }
    }
}

/// Checks the persisted session against the configuration, before any network call.
fn check_persisted_session(
    identity: &BotIdentity,
    device: &DeviceRecord,
    persisted: Option<&MatrixSession>,
) -> Result<(), BootstrapError> {
    let Some(persisted) = persisted else {
        return Ok(());
    };
    let persisted_device = persisted.meta.device_id.as_str();

    if persisted.meta.user_id.as_str() != identity.user_id().as_str() {
        return Err(mismatch(
            persisted_device,
            format!(
                "the store belongs to {}, not {}",
                persisted.meta.user_id,
                identity.user_id()
            ),
        ));
    }

    if let Some(configured) = device.device_id()
        && configured != persisted_device
    {
        return Err(mismatch(
            configured,
            format!("the store holds the keys of device {persisted_device}"),
        ));
    }

    Ok(())
}

fn mismatch(device_id: &str, detail: String) -> BootstrapError {
    BootstrapError::DeviceIdentityMismatch {
        device_id: device_id.to_string(),
        detail,
    }
}

fn matrix_session(
    identity: &BotIdentity,
    device_id: &str,
    access_token: String,
    refresh_token: Option<String>,
) -> MatrixSession {
    MatrixSession {
        meta: SessionMeta {
            user_id: identity.user_id().to_owned(),
            device_id: device_id.into(),
        },
        tokens: SessionTokens {
            access_token,
            refresh_token,
        },
    }
}
