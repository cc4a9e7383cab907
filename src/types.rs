use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::errors::AppError;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Imap,
    Imaps,
    Pop3,
    Pop3s,
}

impl Protocol {
    pub fn default_port(self) -> u16 {
        match self {
            Protocol::Imap => 143,
            Protocol::Imaps => 993,
            Protocol::Pop3 => 110,
            Protocol::Pop3s => 995,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::Imap => "imap",
            Protocol::Imaps => "imaps",
            Protocol::Pop3 => "pop3",
            Protocol::Pop3s => "pop3s",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "imap" => Ok(Protocol::Imap),
            "imaps" => Ok(Protocol::Imaps),
            "pop3" => Ok(Protocol::Pop3),
            "pop3s" => Ok(Protocol::Pop3s),
            other => Err(AppError::Config(format!("unknown protocol {other}"))),
        }
    }
}

#[derive(Clone, PartialEq, Eq)]
pub enum Credential {
    Password(String),
    /// OAuth2 access token, sent as XOAUTH2.
    Bearer(String),
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credential::Password(_) => f.write_str("Password(***)"),
            Credential::Bearer(_) => f.write_str("Bearer(***)"),
        }
    }
}

/// Who a session talks to and as whom. Never changes once a session holds it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AccountIdentity {
    pub protocol: Protocol,
    pub host: String,
    pub address: String,
    pub credential: Credential,
}

impl AccountIdentity {
    pub fn new(
        protocol: Protocol,
        host: impl Into<String>,
        address: impl Into<String>,
        credential: Credential,
    ) -> Self {
        Self {
            protocol,
            host: host.into(),
            address: address.into(),
            credential,
        }
    }

    pub fn key(&self) -> AccountKey {
        AccountKey {
            protocol: self.protocol,
            host: self.host.to_ascii_lowercase(),
            address: self.address.to_ascii_lowercase(),
        }
    }
}

/// Registry key: the identity without its credential.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct AccountKey {
    pub protocol: Protocol,
    pub host: String,
    pub address: String,
}

impl fmt::Display for AccountKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}@{}", self.protocol, self.address, self.host)
    }
}

/// Handle to a message inside a folder. Only valid until the next batch
/// operation (move, delete, expunge) touches that folder.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct MessageRef {
    pub folder: String,
    pub uid: u32,
}

impl MessageRef {
    pub fn new(folder: impl Into<String>, uid: u32) -> Self {
        Self {
            folder: folder.into(),
            uid,
        }
    }
}

#[derive(Clone, Debug)]
pub struct RawMessage {
    pub reference: MessageRef,
    pub bytes: Vec<u8>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Flag {
    Seen,
    Deleted,
    Flagged,
}

impl Flag {
    pub fn imap_name(self) -> &'static str {
        match self {
            Flag::Seen => "\\Seen",
            Flag::Deleted => "\\Deleted",
            Flag::Flagged => "\\Flagged",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FolderMode {
    ReadOnly,
    ReadWrite,
}

/// Collapses a sorted UID list into an IMAP sequence set, e.g. `1:3,7`.
pub fn uid_sequence(refs: &[MessageRef]) -> String {
    let mut uids: Vec<u32> = refs.iter().map(|r| r.uid).collect();
    uids.sort_unstable();
    uids.dedup();

    let mut parts = Vec::new();
    let mut iter = uids.into_iter().peekable();
    while let Some(start) = iter.next() {
        let mut end = start;
        while let Some(next) = end.checked_add(1) {
            if iter.peek() != Some(&next) {
                break;
            }
            end = next;
            iter.next();
        }
        if start == end {
            parts.push(start.to_string());
        } else {
            parts.push(format!("{start}:{end}"));
        }
    }
    parts.join(",")
}
