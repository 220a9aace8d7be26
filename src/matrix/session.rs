use log::info;
use matrix_sdk::Client;

use crate::{
    matrix::{BotIdentity, sync::MatrixSync},
    storage::StoreHandle,
};

/// Live, authenticated and encryption capable Matrix session.
///
/// Only produced by a successful bootstrap. The device it runs as is the one
/// whose keys are held by its store.
pub struct Session {
    client: Client,
    identity: BotIdentity,
    device_id: String,
    store: StoreHandle,
}

impl Session {
    pub(crate) fn new(
        client: Client,
        identity: BotIdentity,
        device_id: String,
        store: StoreHandle,
    ) -> Self {
        Session {
            client,
            identity,
            device_id,
            store,
        }
    }

    /// The effective device of this session.
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Runs the sync loop until it fails. See [`MatrixSync::sync`].
    pub async fn sync(&self) -> anyhow::Result<()> {
        MatrixSync::new(&self.client, &self.store).sync().await
    }

    /// Ends the session and releases the store.
    ///
    /// The access token stays valid, so the next start resumes this session.
    pub async fn close(self) {
        info!(
            "closing session of {} on device {}",
            self.identity.user_id(),
            self.device_id
        );
        drop(self.client);
        self.store.close().await;
    }
}
