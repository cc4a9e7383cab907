//! IMAP transport over async-imap 0.11 with tokio-rustls.
//!
//! One connection (TLS for `imaps`, plain TCP for `imap`) carries every
//! folder handle of a session, so each folder operation re-SELECTs its
//! mailbox when another handle moved the selection away.
use anyhow::{Context, Result};
use async_imap::{Authenticator, Client, Session};
use async_trait::async_trait;
use futures::io::{AsyncRead, AsyncWrite};
use futures::TryStreamExt;
use rustls_native_certs::load_native_certs;
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_rustls::rustls::{ClientConfig, RootCertStore, ServerName};
use tokio_rustls::TlsConnector;
use tokio_util::compat::TokioAsyncReadCompatExt;
use tracing::{debug, warn};

use crate::config::Timeouts;
use crate::errors::{AppError, AppResult};
use crate::transport::{FolderHandle, MailConnection, MailTransport, RemoteFolder};
use crate::types::{
    uid_sequence, AccountIdentity, Credential, Flag, FolderMode, MessageRef, Protocol, RawMessage,
};

/// Byte stream under an IMAP session, TLS or plain.
trait ImapStream: AsyncRead + AsyncWrite + Unpin + Send + fmt::Debug {}

impl<T> ImapStream for T where T: AsyncRead + AsyncWrite + Unpin + Send + fmt::Debug {}

type ImapSession = Session<Box<dyn ImapStream>>;

#[derive(Debug, Default, Clone, Copy)]
pub struct ImapTransport;

impl ImapTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl MailTransport for ImapTransport {
    async fn connect(
        &self,
        identity: &AccountIdentity,
        timeouts: Timeouts,
    ) -> AppResult<Box<dyn MailConnection>> {
        if !matches!(identity.protocol, Protocol::Imap | Protocol::Imaps) {
            return Err(AppError::Config(format!(
                "protocol {} is not supported by the IMAP transport; use imap or imaps",
                identity.protocol
            )));
        }

        let session = tokio::time::timeout(timeouts.connect, open_session(identity))
            .await
            .map_err(|_| AppError::Timeout(format!("connecting to {}", identity.host)))?
            .map_err(AppError::transport)?;

        debug!(account = %identity.address, host = %identity.host, "IMAP session established");
        Ok(Box::new(ImapConnection {
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    session,
                    selected: None,
                }),
                connected: AtomicBool::new(true),
                read_timeout: timeouts.read,
            }),
        }))
    }
}

fn split_host(host: &str, protocol: Protocol) -> (String, u16) {
    match host.rsplit_once(':') {
        Some((name, port)) => match port.parse::<u16>() {
            Ok(port) => (name.to_string(), port),
            Err(_) => (host.to_string(), protocol.default_port()),
        },
        None => (host.to_string(), protocol.default_port()),
    }
}

async fn tls_connect(
    host: &str,
    tcp: TcpStream,
) -> Result<tokio_rustls::client::TlsStream<TcpStream>> {
    let mut root_store = RootCertStore::empty();
    for cert in load_native_certs().context("failed to load native certs")? {
        root_store
            .add(&tokio_rustls::rustls::Certificate(cert.0))
            .context("failed to add cert to root store")?;
    }

    let config = ClientConfig::builder()
        .with_safe_defaults()
        .with_root_certificates(root_store)
        .with_no_client_auth();
    let connector = TlsConnector::from(Arc::new(config));

    let server_name = ServerName::try_from(host).context("invalid DNS name")?;
    connector
        .connect(server_name, tcp)
        .await
        .context("starting TLS for IMAP")
}

async fn open_session(identity: &AccountIdentity) -> Result<ImapSession> {
    let (host, port) = split_host(&identity.host, identity.protocol);
    let tcp = TcpStream::connect((host.as_str(), port))
        .await
        .with_context(|| format!("connecting to {host}:{port}"))?;

    let stream: Box<dyn ImapStream> = match identity.protocol {
        Protocol::Imaps => Box::new(tls_connect(&host, tcp).await?.compat()) as Box<dyn ImapStream>,
        _ => {
            warn!(host = %host, "Using plaintext IMAP; credentials are sent unencrypted");
            Box::new(tcp.compat())
        }
    };

    let mut client = Client::new(stream);

    let _greeting = client
        .read_response()
        .await
        .context("reading IMAP greeting")?
        .ok_or_else(|| anyhow::anyhow!("unexpected end of stream, expected greeting"))?;

    let session = match &identity.credential {
        Credential::Password(password) => client
            .login(&identity.address, password)
            .await
            .map_err(|(err, _client)| err)
            .context("LOGIN")?,
        Credential::Bearer(token) => client
            .authenticate(
                "XOAUTH2",
                Xoauth2 {
                    user: identity.address.clone(),
                    access_token: token.clone(),
                },
            )
            .await
            .map_err(|(err, _client)| err)
            .context("XOAUTH2 authenticate")?,
    };

    Ok(session)
}

struct Xoauth2 {
    user: String,
    access_token: String,
}

impl Authenticator for Xoauth2 {
    type Response = String;

    fn process(&mut self, _challenge: &[u8]) -> String {
        format!(
            "user={}\x01auth=Bearer {}\x01\x01",
            self.user, self.access_token
        )
    }
}

struct Inner {
    session: ImapSession,
    selected: Option<String>,
}

struct Shared {
    inner: Mutex<Inner>,
    connected: AtomicBool,
    read_timeout: Duration,
}

/// Marks the connection dead unless the exchange it guards ran to the end.
/// A command dropped half-way leaves its reply on the wire, where the next
/// command would read it.
struct Exchange<'a> {
    connected: &'a AtomicBool,
    finished: bool,
}

impl<'a> Exchange<'a> {
    fn begin(connected: &'a AtomicBool) -> Self {
        Self {
            connected,
            finished: false,
        }
    }

    fn finish(mut self) {
        self.finished = true;
    }
}

impl Drop for Exchange<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.connected.store(false, Ordering::SeqCst);
        }
    }
}

/// Runs one protocol exchange under `read_timeout`. I/O failures, timeouts
/// and abandoned exchanges mark the connection dead; a dead connection
/// refuses further exchanges.
async fn guarded<T, F>(
    connected: &AtomicBool,
    read_timeout: Duration,
    what: &str,
    fut: F,
) -> AppResult<T>
where
    F: Future<Output = async_imap::error::Result<T>>,
{
    if !connected.load(Ordering::SeqCst) {
        return Err(AppError::Transport(format!("{what}: connection lost")));
    }
    let exchange = Exchange::begin(connected);
    let outcome = tokio::time::timeout(read_timeout, fut).await;
    exchange.finish();
    match outcome {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => {
            if matches!(
                err,
                async_imap::error::Error::Io(_) | async_imap::error::Error::ConnectionLost
            ) {
                connected.store(false, Ordering::SeqCst);
            }
            Err(AppError::Transport(format!("{what}: {err}")))
        }
        Err(_) => {
            connected.store(false, Ordering::SeqCst);
            Err(AppError::Timeout(what.to_string()))
        }
    }
}

impl Shared {
    async fn timed<T, F>(&self, what: &str, fut: F) -> AppResult<T>
    where
        F: Future<Output = async_imap::error::Result<T>>,
    {
        guarded(&self.connected, self.read_timeout, what, fut).await
    }

    async fn ensure_selected(&self, inner: &mut Inner, folder: &str) -> AppResult<()> {
        if inner.selected.as_deref() == Some(folder) {
            return Ok(());
        }
        self.timed("SELECT", inner.session.select(folder)).await?;
        inner.selected = Some(folder.to_string());
        Ok(())
    }
}

struct ImapConnection {
    shared: Arc<Shared>,
}

#[async_trait]
impl MailConnection for ImapConnection {
    fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    async fn folder(&self, name: &str) -> AppResult<FolderHandle> {
        Ok(Box::new(ImapFolder {
            name: name.to_string(),
            shared: Arc::clone(&self.shared),
            open: AtomicBool::new(false),
        }))
    }

    async fn close(&self) -> AppResult<()> {
        let mut inner = self.shared.inner.lock().await;
        let result = self.shared.timed("LOGOUT", inner.session.logout()).await;
        inner.selected = None;
        self.shared.connected.store(false, Ordering::SeqCst);
        result
    }
}

struct ImapFolder {
    name: String,
    shared: Arc<Shared>,
    open: AtomicBool,
}

#[async_trait]
impl RemoteFolder for ImapFolder {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn exists(&self) -> AppResult<bool> {
        let mut inner = self.shared.inner.lock().await;
        let names = self
            .shared
            .timed("LIST", async {
                let stream = inner.session.list(None, Some(self.name.as_str())).await?;
                stream.try_collect::<Vec<_>>().await
            })
            .await?;
        Ok(names.iter().any(|n| n.name() == self.name))
    }

    async fn create(&self) -> AppResult<bool> {
        if self.exists().await? {
            return Ok(false);
        }
        let mut inner = self.shared.inner.lock().await;
        self.shared
            .timed("CREATE", inner.session.create(&self.name))
            .await?;
        Ok(true)
    }

    async fn set_subscribed(&self, subscribed: bool) -> AppResult<()> {
        let mut inner = self.shared.inner.lock().await;
        if subscribed {
            self.shared
                .timed("SUBSCRIBE", inner.session.subscribe(&self.name))
                .await
        } else {
            self.shared
                .timed("UNSUBSCRIBE", inner.session.unsubscribe(&self.name))
                .await
        }
    }

    async fn open(&self, mode: FolderMode) -> AppResult<()> {
        let mut inner = self.shared.inner.lock().await;
        match mode {
            FolderMode::ReadWrite => {
                self.shared
                    .timed("SELECT", inner.session.select(&self.name))
                    .await?;
            }
            FolderMode::ReadOnly => {
                self.shared
                    .timed("EXAMINE", inner.session.examine(&self.name))
                    .await?;
            }
        }
        inner.selected = Some(self.name.clone());
        self.open.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self, expunge: bool) -> AppResult<()> {
        if !self.open.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        let mut inner = self.shared.inner.lock().await;
        if inner.selected.as_deref() != Some(self.name.as_str()) {
            return Ok(());
        }
        let result = if expunge {
            self.shared.timed("CLOSE", inner.session.close()).await
        } else {
            // UNSELECT (RFC 3691) leaves \Deleted messages in place.
            self.shared
                .timed("UNSELECT", inner.session.run_command_and_check_ok("UNSELECT"))
                .await
        };
        inner.selected = None;
        result
    }

    async fn unread_count(&self) -> AppResult<u32> {
        let mut inner = self.shared.inner.lock().await;
        let status = self
            .shared
            .timed("STATUS", inner.session.status(&self.name, "(UNSEEN)"))
            .await?;
        Ok(status.unseen.unwrap_or(0))
    }

    async fn search_unseen(&self) -> AppResult<Vec<MessageRef>> {
        let mut inner = self.shared.inner.lock().await;
        self.shared.ensure_selected(&mut inner, &self.name).await?;
        let uids = self
            .shared
            .timed("UID SEARCH UNSEEN", inner.session.uid_search("UNSEEN"))
            .await?;
        let mut uids: Vec<u32> = uids.into_iter().collect();
        uids.sort_unstable();
        Ok(uids
            .into_iter()
            .map(|uid| MessageRef::new(self.name.clone(), uid))
            .collect())
    }

    async fn fetch_raw(&self, messages: &[MessageRef]) -> AppResult<Vec<RawMessage>> {
        let own: Vec<MessageRef> = messages
            .iter()
            .filter(|r| r.folder == self.name)
            .cloned()
            .collect();
        if own.is_empty() {
            return Ok(Vec::new());
        }
        let uid_seq = uid_sequence(&own);

        let mut inner = self.shared.inner.lock().await;
        self.shared.ensure_selected(&mut inner, &self.name).await?;
        let fetches = self
            .shared
            .timed("UID FETCH", async {
                let stream = inner.session.uid_fetch(&uid_seq, "(UID BODY.PEEK[])").await?;
                stream.try_collect::<Vec<_>>().await
            })
            .await?;

        let mut raw = Vec::with_capacity(fetches.len());
        for fetch in fetches {
            let Some(uid) = fetch.uid else {
                continue;
            };
            match fetch.body() {
                Some(body) => raw.push(RawMessage {
                    reference: MessageRef::new(self.name.clone(), uid),
                    bytes: body.to_vec(),
                }),
                None => warn!(folder = %self.name, uid = uid, "FETCH returned no body"),
            }
        }
        Ok(raw)
    }

    async fn append(&self, messages: &[MessageRef]) -> AppResult<()> {
        let mut by_source: BTreeMap<&str, Vec<MessageRef>> = BTreeMap::new();
        for reference in messages {
            by_source
                .entry(reference.folder.as_str())
                .or_default()
                .push(reference.clone());
        }

        let mut inner = self.shared.inner.lock().await;
        for (source, refs) in by_source {
            self.shared.ensure_selected(&mut inner, source).await?;
            let uid_seq = uid_sequence(&refs);
            self.shared
                .timed("UID COPY", inner.session.uid_copy(&uid_seq, &self.name))
                .await?;
        }
        Ok(())
    }

    async fn set_flags(
        &self,
        messages: &[MessageRef],
        flags: &[Flag],
        value: bool,
    ) -> AppResult<()> {
        let own: Vec<MessageRef> = messages
            .iter()
            .filter(|r| r.folder == self.name)
            .cloned()
            .collect();
        if own.is_empty() || flags.is_empty() {
            return Ok(());
        }
        let uid_seq = uid_sequence(&own);
        let names: Vec<&str> = flags.iter().map(|f| f.imap_name()).collect();
        let query = format!(
            "{}FLAGS.SILENT ({})",
            if value { "+" } else { "-" },
            names.join(" ")
        );

        let mut inner = self.shared.inner.lock().await;
        self.shared.ensure_selected(&mut inner, &self.name).await?;
        self.shared
            .timed("UID STORE", async {
                let stream = inner.session.uid_store(&uid_seq, &query).await?;
                stream.try_collect::<Vec<_>>().await
            })
            .await?;
        Ok(())
    }

    async fn expunge(&self) -> AppResult<()> {
        let mut inner = self.shared.inner.lock().await;
        self.shared.ensure_selected(&mut inner, &self.name).await?;
        self.shared
            .timed("EXPUNGE", async {
                let stream = inner.session.expunge().await?;
                stream.try_collect::<Vec<_>>().await
            })
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_port_suffix_overrides_default() {
        assert_eq!(
            split_host("mail.example.com:1993", Protocol::Imaps),
            ("mail.example.com".to_string(), 1993)
        );
        assert_eq!(
            split_host("mail.example.com", Protocol::Imaps),
            ("mail.example.com".to_string(), 993)
        );
        assert_eq!(
            split_host("mail.example.com", Protocol::Imap),
            ("mail.example.com".to_string(), 143)
        );
    }

    #[tokio::test]
    async fn cancelled_exchange_marks_connection_dead() {
        let connected = AtomicBool::new(true);
        let cancel = tokio_util::sync::CancellationToken::new();
        cancel.cancel();

        let outcome = tokio::select! {
            biased;
            result = guarded(
                &connected,
                Duration::from_secs(5),
                "UID SEARCH",
                std::future::pending::<async_imap::error::Result<()>>(),
            ) => Some(result),
            _ = cancel.cancelled() => None,
        };

        assert!(outcome.is_none());
        assert!(!connected.load(Ordering::SeqCst));
        let next = guarded(&connected, Duration::from_secs(5), "UNSELECT", async { Ok(()) }).await;
        assert!(matches!(next, Err(AppError::Transport(_))));
    }

    #[tokio::test]
    async fn completed_exchange_keeps_connection() {
        let connected = AtomicBool::new(true);
        let value = guarded(&connected, Duration::from_secs(5), "NOOP", async { Ok(7) })
            .await
            .expect("exchange");
        assert_eq!(value, 7);
        assert!(connected.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn timed_out_exchange_marks_connection_dead() {
        let connected = AtomicBool::new(true);
        let result = guarded(
            &connected,
            Duration::from_millis(10),
            "FETCH",
            std::future::pending::<async_imap::error::Result<()>>(),
        )
        .await;
        assert!(matches!(result, Err(AppError::Timeout(_))));
        assert!(!connected.load(Ordering::SeqCst));
    }
}
