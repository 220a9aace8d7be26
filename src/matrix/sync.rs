//! Matrix client synchronization and event handling.
//!
//! The [`MatrixSync::sync`] method:
//! 1. Performs an initial sync from the persisted token, retrying until it succeeds
//! 2. Registers the event handlers: auto-join on invite, undecryptable events
//! 3. Enters the continuous sync loop, persisting every `next_batch` token

use anyhow::Result;
use log::{error, info, warn};
use matrix_sdk::{
    Client, LoopCtrl, Room,
    config::SyncSettings,
    ruma::{
        api::client::filter::FilterDefinition,
        events::room::{encrypted::OriginalSyncRoomEncryptedEvent, member::StrippedRoomMemberEvent},
    },
};
use tokio::time::{Duration, sleep};

use crate::storage::StoreHandle;

/// Delay between two attempts of the initial sync
const INITIAL_SYNC_RETRY: Duration = Duration::from_secs(15);

/// First delay before retrying to join a room, doubled after each failure
const JOIN_RETRY_START_SECS: u64 = 2;

/// Joining is abandoned once the delay exceeds one hour
const JOIN_RETRY_MAX_SECS: u64 = 3600;

/// Runs the sync loop of an established session.
pub struct MatrixSync {
    client: Client,
    store: StoreHandle,
}

impl MatrixSync {
    /// Creates a new MatrixSync instance. Nothing happens until
    /// [`MatrixSync::sync`] is called.
    pub fn new(client: &Client, store: &StoreHandle) -> Self {
        MatrixSync {
            client: client.to_owned(),
            store: store.to_owned(),
        }
    }

    /// Syncs with the homeserver until an unrecoverable error occurs.
    ///
    /// Sync token persistence errors are logged but don't stop the loop.
    ///
    /// # Errors
    ///
    /// Returns an error if the continuous sync loop fails.
    pub async fn sync(&self) -> Result<()> {
        info!("start syncing");

        // Auto join rooms when invited
        self.client.add_event_handler(auto_join_rooms);

        // Enable room members lazy-loading
        // See <https://spec.matrix.org/v1.6/client-server-api/#lazy-loading-room-members>.
        let filter = FilterDefinition::with_lazy_loading();
        let mut sync_settings = SyncSettings::default().filter(filter.into());

        if let Some(sync_token) = self.store.sync_token().await {
            info!("resuming sync from the persisted token");
            sync_settings = sync_settings.token(sync_token);
        }

        // First sync catches up on what happened while the bot was offline,
        // invitations included
        let response = loop {
            match self.client.sync_once(sync_settings.clone()).await {
                Ok(response) => break response,
                Err(error) => {
                    error!("an error occurred during initial sync: {error}");
                    error!("trying again in {}s", INITIAL_SYNC_RETRY.as_secs());
                    sleep(INITIAL_SYNC_RETRY).await;
                }
            }
        };
        self.persist_sync_token(response.next_batch.clone()).await;

        // Registered after the initial sync, so only new events are reported
        self.client.add_event_handler(on_undecryptable_event);

        // Since we called `sync_once` before we entered our sync loop we must pass
        // that sync token to `sync_with_result_callback`
        sync_settings = sync_settings.token(response.next_batch);

        self.client
            .sync_with_result_callback(sync_settings, |sync_result| async move {
                let response = sync_result?;

                // We persist the token each time to be able to restore our session
                self.persist_sync_token(response.next_batch).await;

                Ok(LoopCtrl::Continue)
            })
            .await?;

        Ok(())
    }

    async fn persist_sync_token(&self, sync_token: String) {
        if let Err(err) = self.store.persist_sync_token(sync_token).await {
            error!("failed to persist sync token: {err}");
        }
    }
}

/// Automatically joins rooms when the bot receives an invitation.
///
/// See <https://github.com/matrix-org/synapse/issues/4345> for the Synapse issue
/// that makes the retry necessary.
async fn auto_join_rooms(room_member: StrippedRoomMemberEvent, client: Client, room: Room) {
    let Some(user_id) = client.user_id() else {
        warn!("could not get user id from client");
        return;
    };

    // Ignore if the invite is not for us
    if room_member.state_key != user_id {
        return;
    }

    tokio::spawn(async move {
        info!("auto joining room {}", room.room_id());
        let mut delay = JOIN_RETRY_START_SECS;

        while let Err(err) = room.join().await {
            error!(
                "failed to join room {} ({err:?}), retrying in {delay}s",
                room.room_id()
            );

            sleep(Duration::from_secs(delay)).await;
            delay = next_join_delay(delay);

            if delay > JOIN_RETRY_MAX_SECS {
                error!("can't join room {} ({err:?})", room.room_id());
                return;
            }
        }
        info!("successfully joined room {}", room.room_id());
    });
}

fn next_join_delay(delay: u64) -> u64 {
    delay.saturating_mul(2)
}

/// Reports encrypted events the SDK could not decrypt.
///
/// Decrypted events are delivered as their plain type, so anything reaching
/// this handler stayed encrypted.
async fn on_undecryptable_event(event: OriginalSyncRoomEncryptedEvent, room: Room) {
    warn!(
        "unable to decrypt event {} from {} in room {}",
        event.event_id,
        event.sender,
        room.room_id()
    );
    warn!(
        "if this keeps happening, the device may have been reused with another store: \
         delete the store directory and let the bot log in with a new device"
    );
}
