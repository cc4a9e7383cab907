use crate::cli::Cli;
use crate::config::Settings;
use crate::errors::AppResult;
use crate::lock::{Locking, SqliteLocking};
use crate::mime::ExtractOptions;
use crate::poller::{MailboxListener, NewMessagesEvent, PassConfig, ProcessingPass};
use crate::registry::SessionRegistry;
use crate::transport::ImapTransport;
use crate::types::{AccountIdentity, Credential};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use std::env;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub async fn run(cli: Cli) -> Result<()> {
    let mut settings = Settings::load(cli.config.as_deref()).context("loading settings")?;
    if let Some(path) = &cli.lock_db {
        settings.lock_db = Some(path.clone());
    }
    if cli.raw_html {
        settings.convert_html = false;
    }

    let credential = match (&cli.token, &cli.password) {
        (Some(token), _) => Credential::Bearer(token.clone()),
        (None, Some(password)) => Credential::Password(password.clone()),
        (None, None) => match env::var("MAILPOLL_PASSWORD") {
            Ok(password) => Credential::Password(password),
            Err(_) => bail!("no credential: pass --password, --token or set MAILPOLL_PASSWORD"),
        },
    };
    let identity = AccountIdentity::new(cli.protocol, &cli.host, &cli.user, credential);

    let lock_path = settings.lock_db_path()?;
    let mut sqlite = SqliteLocking::open(&lock_path)
        .await
        .with_context(|| format!("opening lock database {}", lock_path.display()))?;
    if let Some(lease) = settings.lock_lease() {
        sqlite = sqlite.with_lease(lease);
    }
    info!(path = %lock_path.display(), holder = %sqlite.holder(), "Using SQLite lock store");
    let locking: Arc<dyn Locking> = Arc::new(sqlite);

    let registry = SessionRegistry::new(Arc::new(ImapTransport::new()), settings.timeouts());
    let session = registry.get_or_create(identity);

    let pass = ProcessingPass::new(session.clone(), locking, pass_config(&cli, &settings))?;
    let listener = PrintListener;
    let cancel = CancellationToken::new();

    if cli.watch {
        let stop = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Interrupted; finishing current pass");
                stop.cancel();
            }
        });
        pass.run_forever(&listener, settings.poll_interval(), &cancel)
            .await?;
        return Ok(());
    }

    session.begin().await.context("opening mailbox session")?;
    let outcome = pass.run(&listener, &cancel).await;
    if let Err(e) = session.end().await {
        warn!(error = %e, "Closing mailbox session failed");
    }
    let report = outcome?;
    println!(
        "{} unread, {} processed, {} moved to {}{}",
        report.found,
        report.processed,
        report.moved,
        cli.archive,
        if report.skipped_locked {
            " (skipped: folder locked by another worker)"
        } else {
            ""
        }
    );

    Ok(())
}

fn pass_config(cli: &Cli, settings: &Settings) -> PassConfig {
    PassConfig {
        source: cli.folder.clone(),
        target: cli.archive.clone(),
        extract: ExtractOptions {
            convert_html: settings.convert_html,
            wrap_width: settings.wrap_width,
        },
        lock_prefix: settings.lock_prefix.clone(),
        lock_wait: settings.lock_wait(),
        lock_retry: settings.lock_retry_interval(),
        lock_renew: settings.lock_renew_interval(),
    }
}

/// Prints a short preview of every message a pass picks up.
struct PrintListener;

#[async_trait]
impl MailboxListener for PrintListener {
    async fn on_new_messages(&self, event: &NewMessagesEvent) -> AppResult<()> {
        println!("\n{}", "=".repeat(80));
        println!("{} new in {} ({})", event.messages.len(), event.folder, event.address);
        println!("{}\n", "=".repeat(80));

        for (i, msg) in event.messages.iter().enumerate() {
            let subject = msg.subject.as_deref().unwrap_or("(No Subject)");
            let from = msg.from.as_deref().unwrap_or("Unknown");
            println!("{}. [uid {}] {}", i + 1, msg.reference.uid, subject);
            println!("   From: {}", from);

            let preview = msg
                .text
                .lines()
                .filter(|line| !line.trim().is_empty())
                .take(2)
                .collect::<Vec<_>>()
                .join(" ");
            let preview = if preview.chars().count() > 100 {
                let truncated: String = preview.chars().take(100).collect();
                format!("{}...", truncated)
            } else {
                preview
            };
            if !preview.is_empty() {
                println!("   Preview: {}", preview);
            }
            println!();
        }
        Ok(())
    }
}
