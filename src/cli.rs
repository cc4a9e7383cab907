use clap::Parser;
use std::path::PathBuf;

use crate::types::Protocol;

/// Command-line options for mailpoll.
#[derive(Parser, Debug)]
#[command(author, version, about)]
pub struct Cli {
    /// Mail protocol of the account: imaps (TLS) or imap (plaintext).
    #[arg(long, default_value = "imaps")]
    pub protocol: Protocol,

    /// Mail server host, optionally with `:port`.
    #[arg(long)]
    pub host: String,

    /// Mailbox address used to log in.
    #[arg(long)]
    pub user: String,

    /// Password; falls back to MAILPOLL_PASSWORD.
    #[arg(long)]
    pub password: Option<String>,

    /// OAuth2 access token, used instead of a password (XOAUTH2).
    #[arg(long)]
    pub token: Option<String>,

    /// Folder scanned for unread messages.
    #[arg(long, default_value = "INBOX")]
    pub folder: String,

    /// Folder processed messages are moved into.
    #[arg(long, default_value = "Processed")]
    pub archive: String,

    /// Optional TOML settings file.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// SQLite file shared by all workers for folder locks.
    #[arg(long)]
    pub lock_db: Option<PathBuf>,

    /// Keep polling until interrupted instead of running a single pass.
    #[arg(long)]
    pub watch: bool,

    /// Keep HTML parts as markup instead of converting them to text.
    #[arg(long)]
    pub raw_html: bool,
}
