use async_trait::async_trait;
use rayon::prelude::*;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::errors::{AppError, AppResult};
use crate::lock::{HolderId, LockNamespace, Locking, RemoteReentrantLock};
use crate::mime::{extract_text, header_value, ExtractOptions};
use crate::session::MailboxSession;
use crate::types::{MessageRef, RawMessage};

#[derive(Debug, Clone)]
pub struct ExtractedMessage {
    pub reference: MessageRef,
    pub subject: Option<String>,
    pub from: Option<String>,
    pub text: String,
}

/// Unread messages picked up by one pass over a folder.
#[derive(Debug, Clone)]
pub struct NewMessagesEvent {
    pub address: String,
    pub folder: String,
    pub messages: Vec<ExtractedMessage>,
}

#[async_trait]
pub trait MailboxListener: Send + Sync {
    /// Called while the folder lock is held. Returning an error leaves every
    /// message of the event where it was.
    async fn on_new_messages(&self, event: &NewMessagesEvent) -> AppResult<()>;
}

#[derive(Debug, Clone)]
pub struct PassConfig {
    pub source: String,
    pub target: String,
    pub extract: ExtractOptions,
    pub lock_prefix: String,
    pub lock_wait: Duration,
    pub lock_retry: Duration,
    /// Refresh period for the folder hold while a pass runs. Needed when the
    /// lock service expires holds; `None` skips renewal.
    pub lock_renew: Option<Duration>,
}

impl PassConfig {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            extract: ExtractOptions::default(),
            lock_prefix: crate::config::DEFAULT_LOCK_PREFIX.to_string(),
            lock_wait: Duration::from_secs(10),
            lock_retry: Duration::from_millis(500),
            lock_renew: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassReport {
    pub found: usize,
    pub processed: usize,
    pub moved: usize,
    /// Another worker held the folder lock for the whole wait.
    pub skipped_locked: bool,
}

/// Lock, scan, extract, notify, move, delete, unlock: one pass over the
/// source folder of one account.
pub struct ProcessingPass {
    session: Arc<MailboxSession>,
    lock: RemoteReentrantLock,
    holder: HolderId,
    config: PassConfig,
}

impl ProcessingPass {
    pub fn new(
        session: Arc<MailboxSession>,
        locking: Arc<dyn Locking>,
        config: PassConfig,
    ) -> AppResult<Self> {
        if config.source == config.target {
            return Err(AppError::Config(format!(
                "source and target folder are both {}",
                config.source
            )));
        }
        let namespace =
            LockNamespace::for_folder(&config.lock_prefix, session.identity(), &config.source);
        let lock = RemoteReentrantLock::new(locking, namespace).with_retry_interval(config.lock_retry);
        Ok(Self {
            session,
            lock,
            holder: HolderId::new(),
            config,
        })
    }

    pub fn session(&self) -> &Arc<MailboxSession> {
        &self.session
    }

    pub fn lock(&self) -> &RemoteReentrantLock {
        &self.lock
    }

    pub async fn run(
        &self,
        listener: &dyn MailboxListener,
        cancel: &CancellationToken,
    ) -> AppResult<PassReport> {
        let acquired = self
            .lock
            .lock_until_as(self.holder, self.config.lock_wait, cancel)
            .await?;
        if !acquired {
            info!(
                account = %self.session.address(),
                folder = %self.config.source,
                "Folder locked by another worker; skipping pass"
            );
            return Ok(PassReport {
                skipped_locked: true,
                ..PassReport::default()
            });
        }

        let result = self.run_renewing(listener, cancel).await;
        let released = self.lock.unlock_as(self.holder).await;
        let report = result?;
        released?;
        Ok(report)
    }

    /// Runs the locked part of the pass, refreshing the remote hold every
    /// `lock_renew` until it finishes.
    async fn run_renewing(
        &self,
        listener: &dyn MailboxListener,
        cancel: &CancellationToken,
    ) -> AppResult<PassReport> {
        let Some(period) = self.config.lock_renew.filter(|p| !p.is_zero()) else {
            return self.run_locked(listener, cancel).await;
        };

        let work = self.run_locked(listener, cancel);
        tokio::pin!(work);
        let mut heartbeat = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                result = &mut work => return result,
                _ = heartbeat.tick() => match self.lock.renew().await {
                    Ok(true) => debug!(namespace = %self.lock.namespace(), "Renewed folder lock"),
                    Ok(false) => {}
                    Err(e) => warn!(namespace = %self.lock.namespace(), error = %e, "Renewing folder lock failed"),
                },
            }
        }
    }

    async fn run_locked(
        &self,
        listener: &dyn MailboxListener,
        cancel: &CancellationToken,
    ) -> AppResult<PassReport> {
        let pass_start = Instant::now();
        let source = self.session.get_folder(&self.config.source).await?;

        let result = async {
            let unread = tokio::select! {
                _ = cancel.cancelled() => return Err(AppError::Cancelled),
                unread = self.session.search_unread_in(&source) => unread?,
            };
            let mut report = PassReport {
                found: unread.len(),
                ..PassReport::default()
            };
            if unread.is_empty() {
                return Ok(report);
            }

            let raw = self.session.fetch_messages(&source, &unread).await?;
            let messages = extract_all(raw, self.config.extract).await?;
            report.processed = messages.len();

            let event = NewMessagesEvent {
                address: self.session.address().to_string(),
                folder: self.config.source.clone(),
                messages,
            };
            listener.on_new_messages(&event).await?;

            let handled: Vec<MessageRef> =
                event.messages.iter().map(|m| m.reference.clone()).collect();
            // The append must be acknowledged before anything is expunged.
            let target = self
                .session
                .move_to_folder(&self.config.target, &handled)
                .await?;
            self.session.close_folders(&[&target]).await;
            self.session.remove_from(&source, &handled).await?;
            report.moved = handled.len();
            Ok(report)
        }
        .await;

        self.session.close_folders(&[&source]).await;

        if let Ok(report) = &result {
            info!(
                account = %self.session.address(),
                folder = %self.config.source,
                target = %self.config.target,
                found = report.found,
                moved = report.moved,
                elapsed_ms = ?pass_start.elapsed().as_millis(),
                "Processing pass completed"
            );
        }
        result
    }

    /// Runs a pass every `interval` until `cancel` fires, reconnecting the
    /// session when its connection has dropped. The session is closed on exit.
    pub async fn run_forever(
        &self,
        listener: &dyn MailboxListener,
        interval: Duration,
        cancel: &CancellationToken,
    ) -> AppResult<()> {
        loop {
            if let Err(e) = self.ensure_open(cancel).await {
                if matches!(e, AppError::Cancelled) {
                    break;
                }
                warn!(account = %self.session.address(), error = %e, "Opening session failed");
            } else {
                match self.run(listener, cancel).await {
                    Ok(report) => debug!(account = %self.session.address(), ?report, "Pass finished"),
                    Err(AppError::Cancelled) => break,
                    Err(e) => {
                        warn!(account = %self.session.address(), error = %e, "Processing pass failed")
                    }
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }

        if self.session.is_open() {
            self.session.end().await?;
        }
        Ok(())
    }

    async fn ensure_open(&self, cancel: &CancellationToken) -> AppResult<()> {
        if self.session.is_open() {
            return Ok(());
        }
        // A dropped connection still occupies the slot; clear it first.
        match self.session.end().await {
            Ok(()) | Err(AppError::NotConnected(_)) => {}
            Err(e) => debug!(error = %e, "Closing dead connection failed"),
        }
        match self.session.begin_with_cancel(cancel).await {
            Ok(()) | Err(AppError::AlreadyOpen(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

/// Parses and flattens messages on the blocking pool.
async fn extract_all(
    raw: Vec<RawMessage>,
    options: ExtractOptions,
) -> AppResult<Vec<ExtractedMessage>> {
    tokio::task::spawn_blocking(move || {
        raw.into_par_iter()
            .map(|message| extract_one(message, &options))
            .collect::<Vec<_>>()
    })
    .await
    .map_err(|e| AppError::Unexpected(format!("extraction task panicked: {e}")))
}

fn extract_one(message: RawMessage, options: &ExtractOptions) -> ExtractedMessage {
    match mailparse::parse_mail(&message.bytes) {
        Ok(parsed) => ExtractedMessage {
            subject: header_value(&parsed, "Subject"),
            from: header_value(&parsed, "From"),
            text: extract_text(&parsed, options),
            reference: message.reference,
        },
        Err(e) => {
            warn!(uid = message.reference.uid, error = %e, "Failed to parse message");
            ExtractedMessage {
                text: String::from_utf8_lossy(&message.bytes).into_owned(),
                subject: None,
                from: None,
                reference: message.reference,
            }
        }
    }
}
