//! In-process mail store implementing the transport traits. It keeps a journal
//! of every call so tests can assert ordering, and can inject failures.
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::config::Timeouts;
use crate::errors::{AppError, AppResult};
use crate::transport::{FolderHandle, MailConnection, MailTransport, RemoteFolder};
use crate::types::{AccountIdentity, Flag, FolderMode, MessageRef, RawMessage};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportCall {
    Connect(String),
    Disconnect,
    Create(String),
    Subscribe(String),
    Open(String),
    Close { folder: String, expunge: bool },
    Search(String),
    Fetch { folder: String, count: usize },
    Append { folder: String, count: usize },
    SetFlags { folder: String, count: usize },
    Expunge(String),
}

#[derive(Default)]
struct StoredMessage {
    bytes: Vec<u8>,
    flags: HashSet<Flag>,
}

#[derive(Default)]
struct StoredFolder {
    subscribed: bool,
    next_uid: u32,
    messages: BTreeMap<u32, StoredMessage>,
}

#[derive(Default)]
struct MemoryState {
    folders: BTreeMap<String, StoredFolder>,
    journal: Vec<TransportCall>,
    open_handles: HashMap<String, usize>,
    /// Source messages whose append to another folder was acknowledged.
    appended: HashSet<MessageRef>,
    strict_move_order: bool,
    fail_connect: bool,
    fail_next_search: bool,
    search_delay: Option<Duration>,
    failing_closes: HashSet<String>,
}

impl StoredFolder {
    fn insert(&mut self, bytes: Vec<u8>, flags: HashSet<Flag>) -> u32 {
        self.next_uid += 1;
        let uid = self.next_uid;
        self.messages.insert(uid, StoredMessage { bytes, flags });
        uid
    }
}

#[derive(Clone, Default)]
pub struct MemoryTransport {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rejects an expunge while any `\Deleted` message has not been appended
    /// elsewhere first.
    pub fn with_strict_move_order(self) -> Self {
        self.lock().strict_move_order = true;
        self
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Drops an unread message into `folder`, creating the folder if needed.
    pub fn deliver(&self, folder: &str, raw: impl Into<Vec<u8>>) -> MessageRef {
        let mut state = self.lock();
        let stored = state.folders.entry(folder.to_string()).or_default();
        let uid = stored.insert(raw.into(), HashSet::new());
        MessageRef::new(folder, uid)
    }

    pub fn mark_seen(&self, reference: &MessageRef) {
        let mut state = self.lock();
        if let Some(msg) = state
            .folders
            .get_mut(&reference.folder)
            .and_then(|f| f.messages.get_mut(&reference.uid))
        {
            msg.flags.insert(Flag::Seen);
        }
    }

    pub fn fail_connect(&self, fail: bool) {
        self.lock().fail_connect = fail;
    }

    pub fn fail_next_search(&self) {
        self.lock().fail_next_search = true;
    }

    /// Makes every search wait `delay` before answering, like a slow server.
    pub fn delay_search(&self, delay: Duration) {
        self.lock().search_delay = Some(delay);
    }

    pub fn fail_close(&self, folder: &str) {
        self.lock().failing_closes.insert(folder.to_string());
    }

    pub fn journal(&self) -> Vec<TransportCall> {
        self.lock().journal.clone()
    }

    pub fn connect_count(&self) -> usize {
        self.lock()
            .journal
            .iter()
            .filter(|c| matches!(c, TransportCall::Connect(_)))
            .count()
    }

    pub fn open_handles(&self, folder: &str) -> usize {
        self.lock().open_handles.get(folder).copied().unwrap_or(0)
    }

    pub fn folder_exists(&self, folder: &str) -> bool {
        self.lock().folders.contains_key(folder)
    }

    pub fn is_subscribed(&self, folder: &str) -> bool {
        self.lock()
            .folders
            .get(folder)
            .map(|f| f.subscribed)
            .unwrap_or(false)
    }

    pub fn message_count(&self, folder: &str) -> usize {
        self.lock()
            .folders
            .get(folder)
            .map(|f| f.messages.len())
            .unwrap_or(0)
    }

    pub fn message_bodies(&self, folder: &str) -> Vec<Vec<u8>> {
        self.lock()
            .folders
            .get(folder)
            .map(|f| f.messages.values().map(|m| m.bytes.clone()).collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl MailTransport for MemoryTransport {
    async fn connect(
        &self,
        identity: &AccountIdentity,
        _timeouts: Timeouts,
    ) -> AppResult<Box<dyn MailConnection>> {
        let mut state = self.lock();
        if state.fail_connect {
            return Err(AppError::Transport(format!(
                "connection refused by {}",
                identity.host
            )));
        }
        state
            .journal
            .push(TransportCall::Connect(identity.address.clone()));
        Ok(Box::new(MemoryConnection {
            state: Arc::clone(&self.state),
            connected: Arc::new(AtomicBool::new(true)),
        }))
    }
}

struct MemoryConnection {
    state: Arc<Mutex<MemoryState>>,
    connected: Arc<AtomicBool>,
}

#[async_trait]
impl MailConnection for MemoryConnection {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn folder(&self, name: &str) -> AppResult<FolderHandle> {
        if !self.is_connected() {
            return Err(AppError::Transport("connection dropped".into()));
        }
        Ok(Box::new(MemoryFolder {
            name: name.to_string(),
            state: Arc::clone(&self.state),
            connected: Arc::clone(&self.connected),
            open: AtomicBool::new(false),
        }))
    }

    async fn close(&self) -> AppResult<()> {
        self.connected.store(false, Ordering::SeqCst);
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        state.journal.push(TransportCall::Disconnect);
        Ok(())
    }
}

struct MemoryFolder {
    name: String,
    state: Arc<Mutex<MemoryState>>,
    connected: Arc<AtomicBool>,
    open: AtomicBool,
}

impl MemoryFolder {
    fn lock(&self) -> AppResult<MutexGuard<'_, MemoryState>> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(AppError::Transport("connection dropped".into()));
        }
        Ok(self.state.lock().unwrap_or_else(|p| p.into_inner()))
    }

    fn require_open(&self) -> AppResult<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(AppError::Transport(format!("folder {} is not open", self.name)))
        }
    }
}

#[async_trait]
impl RemoteFolder for MemoryFolder {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn exists(&self) -> AppResult<bool> {
        Ok(self.lock()?.folders.contains_key(&self.name))
    }

    async fn create(&self) -> AppResult<bool> {
        let mut state = self.lock()?;
        if state.folders.contains_key(&self.name) {
            return Ok(false);
        }
        state.folders.insert(self.name.clone(), StoredFolder::default());
        state.journal.push(TransportCall::Create(self.name.clone()));
        Ok(true)
    }

    async fn set_subscribed(&self, subscribed: bool) -> AppResult<()> {
        let mut state = self.lock()?;
        let folder = state
            .folders
            .get_mut(&self.name)
            .ok_or_else(|| AppError::Transport(format!("no such folder {}", self.name)))?;
        folder.subscribed = subscribed;
        state.journal.push(TransportCall::Subscribe(self.name.clone()));
        Ok(())
    }

    async fn open(&self, _mode: FolderMode) -> AppResult<()> {
        let mut state = self.lock()?;
        if !state.folders.contains_key(&self.name) {
            return Err(AppError::Transport(format!("no such folder {}", self.name)));
        }
        if !self.open.swap(true, Ordering::SeqCst) {
            *state.open_handles.entry(self.name.clone()).or_default() += 1;
        }
        state.journal.push(TransportCall::Open(self.name.clone()));
        Ok(())
    }

    async fn close(&self, expunge: bool) -> AppResult<()> {
        let mut state = self.lock()?;
        if state.failing_closes.contains(&self.name) {
            return Err(AppError::Transport(format!("close of {} failed", self.name)));
        }
        if self.open.swap(false, Ordering::SeqCst) {
            if let Some(count) = state.open_handles.get_mut(&self.name) {
                *count = count.saturating_sub(1);
            }
        }
        state.journal.push(TransportCall::Close {
            folder: self.name.clone(),
            expunge,
        });
        Ok(())
    }

    async fn unread_count(&self) -> AppResult<u32> {
        let state = self.lock()?;
        let count = state
            .folders
            .get(&self.name)
            .map(|f| {
                f.messages
                    .values()
                    .filter(|m| !m.flags.contains(&Flag::Seen))
                    .count()
            })
            .unwrap_or(0);
        Ok(count as u32)
    }

    async fn search_unseen(&self) -> AppResult<Vec<MessageRef>> {
        self.require_open()?;
        let delay = self.lock()?.search_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.lock()?;
        state.journal.push(TransportCall::Search(self.name.clone()));
        if std::mem::take(&mut state.fail_next_search) {
            return Err(AppError::Transport(format!("SEARCH failed in {}", self.name)));
        }
        let refs = state
            .folders
            .get(&self.name)
            .map(|f| {
                f.messages
                    .iter()
                    .filter(|(_, m)| !m.flags.contains(&Flag::Seen))
                    .map(|(uid, _)| MessageRef::new(self.name.clone(), *uid))
                    .collect()
            })
            .unwrap_or_default();
        Ok(refs)
    }

    async fn fetch_raw(&self, messages: &[MessageRef]) -> AppResult<Vec<RawMessage>> {
        self.require_open()?;
        let mut state = self.lock()?;
        state.journal.push(TransportCall::Fetch {
            folder: self.name.clone(),
            count: messages.len(),
        });
        let folder = state
            .folders
            .get(&self.name)
            .ok_or_else(|| AppError::Transport(format!("no such folder {}", self.name)))?;
        Ok(messages
            .iter()
            .filter(|r| r.folder == self.name)
            .filter_map(|r| {
                folder.messages.get(&r.uid).map(|m| RawMessage {
                    reference: r.clone(),
                    bytes: m.bytes.clone(),
                })
            })
            .collect())
    }

    async fn append(&self, messages: &[MessageRef]) -> AppResult<()> {
        let mut state = self.lock()?;
        let mut copies = Vec::with_capacity(messages.len());
        for reference in messages {
            let source = state
                .folders
                .get(&reference.folder)
                .and_then(|f| f.messages.get(&reference.uid))
                .ok_or_else(|| {
                    AppError::Transport(format!(
                        "message {} not found in {}",
                        reference.uid, reference.folder
                    ))
                })?;
            let mut flags = source.flags.clone();
            flags.remove(&Flag::Deleted);
            copies.push((reference.clone(), source.bytes.clone(), flags));
        }
        let target = state
            .folders
            .get_mut(&self.name)
            .ok_or_else(|| AppError::Transport(format!("no such folder {}", self.name)))?;
        let mut acknowledged = Vec::with_capacity(copies.len());
        for (reference, bytes, flags) in copies {
            target.insert(bytes, flags);
            acknowledged.push(reference);
        }
        state.appended.extend(acknowledged);
        state.journal.push(TransportCall::Append {
            folder: self.name.clone(),
            count: messages.len(),
        });
        Ok(())
    }

    async fn set_flags(
        &self,
        messages: &[MessageRef],
        flags: &[Flag],
        value: bool,
    ) -> AppResult<()> {
        self.require_open()?;
        let mut state = self.lock()?;
        let folder = state
            .folders
            .get_mut(&self.name)
            .ok_or_else(|| AppError::Transport(format!("no such folder {}", self.name)))?;
        for reference in messages.iter().filter(|r| r.folder == self.name) {
            if let Some(msg) = folder.messages.get_mut(&reference.uid) {
                for flag in flags {
                    if value {
                        msg.flags.insert(*flag);
                    } else {
                        msg.flags.remove(flag);
                    }
                }
            }
        }
        state.journal.push(TransportCall::SetFlags {
            folder: self.name.clone(),
            count: messages.len(),
        });
        Ok(())
    }

    async fn expunge(&self) -> AppResult<()> {
        self.require_open()?;
        let mut state = self.lock()?;
        let state = &mut *state;
        let folder = state
            .folders
            .get_mut(&self.name)
            .ok_or_else(|| AppError::Transport(format!("no such folder {}", self.name)))?;
        let doomed: Vec<u32> = folder
            .messages
            .iter()
            .filter(|(_, m)| m.flags.contains(&Flag::Deleted))
            .map(|(uid, _)| *uid)
            .collect();
        if state.strict_move_order {
            if let Some(uid) = doomed
                .iter()
                .find(|uid| !state.appended.contains(&MessageRef::new(self.name.clone(), **uid)))
            {
                return Err(AppError::Transport(format!(
                    "expunge of {}:{} before its append was acknowledged",
                    self.name, uid
                )));
            }
        }
        for uid in doomed {
            folder.messages.remove(&uid);
        }
        state.journal.push(TransportCall::Expunge(self.name.clone()));
        Ok(())
    }
}
