//! Seams to the mail-protocol client. The session only ever talks to these
//! traits; `imap` is the network implementation and `memory` backs tests.
use async_trait::async_trait;

use crate::config::Timeouts;
use crate::errors::AppResult;
use crate::types::{AccountIdentity, Flag, FolderMode, MessageRef, RawMessage};

pub mod imap;
pub mod memory;

pub use self::imap::ImapTransport;
pub use self::memory::{MemoryTransport, TransportCall};

pub type FolderHandle = Box<dyn RemoteFolder>;

#[async_trait]
pub trait MailTransport: Send + Sync {
    /// Opens and authenticates a connection for `identity`.
    async fn connect(
        &self,
        identity: &AccountIdentity,
        timeouts: Timeouts,
    ) -> AppResult<Box<dyn MailConnection>>;
}

#[async_trait]
pub trait MailConnection: Send + Sync {
    fn is_connected(&self) -> bool;

    /// Returns a handle to `name` whether or not the folder exists yet.
    async fn folder(&self, name: &str) -> AppResult<FolderHandle>;

    async fn close(&self) -> AppResult<()>;
}

#[async_trait]
pub trait RemoteFolder: Send + Sync {
    fn name(&self) -> &str;

    fn is_open(&self) -> bool;

    async fn exists(&self) -> AppResult<bool>;

    /// Creates the folder; `false` when the server refused because it already exists.
    async fn create(&self) -> AppResult<bool>;

    async fn set_subscribed(&self, subscribed: bool) -> AppResult<()>;

    async fn open(&self, mode: FolderMode) -> AppResult<()>;

    /// Closes the folder. With `expunge == false` deleted messages stay put.
    async fn close(&self, expunge: bool) -> AppResult<()>;

    async fn unread_count(&self) -> AppResult<u32>;

    async fn search_unseen(&self) -> AppResult<Vec<MessageRef>>;

    /// Fetches full message bodies without marking them seen.
    async fn fetch_raw(&self, messages: &[MessageRef]) -> AppResult<Vec<RawMessage>>;

    /// Appends `messages` (which may live in another folder) to this folder.
    async fn append(&self, messages: &[MessageRef]) -> AppResult<()>;

    async fn set_flags(&self, messages: &[MessageRef], flags: &[Flag], value: bool)
        -> AppResult<()>;

    async fn expunge(&self) -> AppResult<()>;
}
