//! Per-account mailbox session.
//!
//! The session owns a single connection slot. `begin` fills it, `end` empties
//! it, and every folder operation checks it first so a closed session fails
//! with [`AppError::NotConnected`] instead of reconnecting behind the caller's
//! back. Folder operations themselves are not serialized here; workers that
//! share an account guard a folder with a
//! [`RemoteReentrantLock`](crate::lock::RemoteReentrantLock).
use arc_swap::ArcSwapOption;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Timeouts;
use crate::errors::{AppError, AppResult};
use crate::transport::{FolderHandle, MailConnection, MailTransport};
use crate::types::{AccountIdentity, Flag, FolderMode, MessageRef, RawMessage};

const NOT_OPEN: &str = "Connection is closed. Consider calling begin().";

/// `ArcSwapOption` needs a sized payload, so the boxed connection lives here.
struct ConnectionSlot {
    connection: Box<dyn MailConnection>,
}

pub struct MailboxSession {
    identity: AccountIdentity,
    transport: Arc<dyn MailTransport>,
    timeouts: Timeouts,
    connection: ArcSwapOption<ConnectionSlot>,
}

impl MailboxSession {
    /// Sessions are normally obtained from
    /// [`SessionRegistry::get_or_create`](crate::registry::SessionRegistry::get_or_create),
    /// which keeps one per account.
    pub(crate) fn new(
        identity: AccountIdentity,
        transport: Arc<dyn MailTransport>,
        timeouts: Timeouts,
    ) -> Self {
        Self {
            identity,
            transport,
            timeouts,
            connection: ArcSwapOption::empty(),
        }
    }

    pub fn identity(&self) -> &AccountIdentity {
        &self.identity
    }

    pub fn address(&self) -> &str {
        &self.identity.address
    }

    pub async fn begin(&self) -> AppResult<()> {
        self.begin_with_cancel(&CancellationToken::new()).await
    }

    /// Opens the connection. Fails with `AlreadyOpen` rather than replacing a
    /// live connection, and leaves the slot untouched when connecting fails.
    pub async fn begin_with_cancel(&self, cancel: &CancellationToken) -> AppResult<()> {
        if self.connection.load().is_some() {
            return Err(AppError::AlreadyOpen(self.identity.address.clone()));
        }

        let connection = tokio::select! {
            _ = cancel.cancelled() => return Err(AppError::Cancelled),
            connection = self.transport.connect(&self.identity, self.timeouts) => connection?,
        };

        let empty: Option<Arc<ConnectionSlot>> = None;
        let fresh = Arc::new(ConnectionSlot { connection });
        let previous = self
            .connection
            .compare_and_swap(&empty, Some(Arc::clone(&fresh)));
        if previous.is_some() {
            warn!(account = %self.identity.address, "Lost race to open session; closing extra connection");
            if let Err(e) = fresh.connection.close().await {
                warn!(account = %self.identity.address, error = %e, "Closing extra connection failed");
            }
            return Err(AppError::AlreadyOpen(self.identity.address.clone()));
        }

        info!(account = %self.identity.address, host = %self.identity.host, "Mailbox session opened");
        Ok(())
    }

    /// Takes the connection out of the slot and closes it.
    pub async fn end(&self) -> AppResult<()> {
        let slot = self
            .connection
            .swap(None)
            .ok_or_else(|| AppError::NotConnected(NOT_OPEN.to_string()))?;
        slot.connection.close().await?;
        info!(account = %self.identity.address, "Mailbox session closed");
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        match &*self.connection.load() {
            Some(slot) => slot.connection.is_connected(),
            None => false,
        }
    }

    fn check(&self) -> AppResult<Arc<ConnectionSlot>> {
        match self.connection.load_full() {
            Some(slot) if slot.connection.is_connected() => Ok(slot),
            _ => Err(AppError::NotConnected(NOT_OPEN.to_string())),
        }
    }

    /// Returns the folder, creating and subscribing it when absent and
    /// opening it read-write when present but closed.
    pub async fn get_folder(&self, name: &str) -> AppResult<FolderHandle> {
        let slot = self.check()?;
        let folder = slot.connection.folder(name).await?;
        if !folder.exists().await? {
            if folder.create().await? {
                folder.set_subscribed(true).await?;
                info!(account = %self.identity.address, folder = %name, "Created and subscribed folder");
            }
        } else if !folder.is_open() {
            folder.open(FolderMode::ReadWrite).await?;
        }
        Ok(folder)
    }

    pub async fn search_unread(&self, folder_name: &str) -> AppResult<Vec<MessageRef>> {
        self.search_unread_with_cancel(folder_name, &CancellationToken::new())
            .await
    }

    /// Opens `folder_name`, lists its unseen messages and closes it again,
    /// whether the search succeeded, failed or was cancelled.
    pub async fn search_unread_with_cancel(
        &self,
        folder_name: &str,
        cancel: &CancellationToken,
    ) -> AppResult<Vec<MessageRef>> {
        let slot = self.check()?;
        let folder = slot.connection.folder(folder_name).await?;

        let result = tokio::select! {
            _ = cancel.cancelled() => Err(AppError::Cancelled),
            result = async {
                if !folder.is_open() {
                    folder.open(FolderMode::ReadWrite).await?;
                }
                self.search_unread_in(&folder).await
            } => result,
        };

        self.close_folders(&[&folder]).await;
        result
    }

    /// Messages in `folder` lacking `\Seen`, in the order the server reports.
    pub async fn search_unread_in(&self, folder: &FolderHandle) -> AppResult<Vec<MessageRef>> {
        self.check()?;
        let unread = folder.unread_count().await.unwrap_or_else(|e| {
            debug!(folder = %folder.name(), error = %e, "Unread count unavailable");
            0
        });
        info!(
            account = %self.identity.address,
            folder = %folder.name(),
            unread = unread,
            "Scanning folder for unread messages"
        );
        folder.search_unseen().await
    }

    pub async fn fetch_messages(
        &self,
        folder: &FolderHandle,
        messages: &[MessageRef],
    ) -> AppResult<Vec<RawMessage>> {
        self.check()?;
        if messages.is_empty() {
            return Ok(Vec::new());
        }
        folder.fetch_raw(messages).await
    }

    /// Appends `messages` to `target`, creating it if needed. The source
    /// copies stay where they are; call [`remove_from_folder`](Self::remove_from_folder)
    /// once this has returned.
    pub async fn move_to_folder(
        &self,
        target: &str,
        messages: &[MessageRef],
    ) -> AppResult<FolderHandle> {
        let folder = self.get_folder(target).await?;
        self.move_to(&folder, messages).await?;
        Ok(folder)
    }

    pub async fn move_to(&self, target: &FolderHandle, messages: &[MessageRef]) -> AppResult<()> {
        self.check()?;
        if messages.is_empty() {
            return Ok(());
        }
        target.append(messages).await?;
        debug!(
            account = %self.identity.address,
            folder = %target.name(),
            count = messages.len(),
            "Appended messages"
        );
        Ok(())
    }

    /// Marks `messages` deleted and expunges. Irreversible, so only call it
    /// after the messages have been persisted elsewhere.
    pub async fn remove_from_folder(
        &self,
        folder: &str,
        messages: &[MessageRef],
    ) -> AppResult<FolderHandle> {
        let handle = self.get_folder(folder).await?;
        self.remove_from(&handle, messages).await?;
        Ok(handle)
    }

    pub async fn remove_from(&self, folder: &FolderHandle, messages: &[MessageRef]) -> AppResult<()> {
        self.check()?;
        if messages.is_empty() {
            return Ok(());
        }
        if !folder.is_open() {
            folder.open(FolderMode::ReadWrite).await?;
        }
        folder.set_flags(messages, &[Flag::Deleted], true).await?;
        folder.expunge().await?;
        debug!(
            account = %self.identity.address,
            folder = %folder.name(),
            count = messages.len(),
            "Expunged messages"
        );
        Ok(())
    }

    /// Closes every open handle without expunging. Failures are logged and
    /// do not stop the remaining handles from closing.
    pub async fn close_folders(&self, folders: &[&FolderHandle]) {
        for folder in folders {
            if !folder.is_open() {
                continue;
            }
            if let Err(e) = folder.close(false).await {
                error!(
                    account = %self.identity.address,
                    folder = %folder.name(),
                    error = %e,
                    "Error while closing mailbox folder"
                );
            }
        }
    }
}
