use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, warn};

use crate::config::Timeouts;
use crate::session::MailboxSession;
use crate::transport::MailTransport;
use crate::types::{AccountIdentity, AccountKey};

/// Hands out exactly one [`MailboxSession`] per account.
///
/// Build one per process and pass it to whoever needs sessions. Sessions are
/// never evicted; only their connections come and go.
pub struct SessionRegistry {
    transport: Arc<dyn MailTransport>,
    timeouts: Timeouts,
    sessions: Mutex<HashMap<AccountKey, Arc<MailboxSession>>>,
}

impl SessionRegistry {
    pub fn new(transport: Arc<dyn MailTransport>, timeouts: Timeouts) -> Self {
        Self {
            transport,
            timeouts,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<AccountKey, Arc<MailboxSession>>> {
        self.sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn get_or_create(&self, identity: AccountIdentity) -> Arc<MailboxSession> {
        let key = identity.key();
        let mut sessions = self.sessions();
        if let Some(existing) = sessions.get(&key) {
            if existing.identity().credential != identity.credential {
                warn!(account = %key, "Credential differs from the live session; keeping the original");
            }
            return Arc::clone(existing);
        }

        debug!(account = %key, "Creating mailbox session");
        let session = Arc::new(MailboxSession::new(
            identity,
            Arc::clone(&self.transport),
            self.timeouts,
        ));
        sessions.insert(key, Arc::clone(&session));
        session
    }

    /// Looks a session up by mailbox address alone.
    pub fn find(&self, address: &str) -> Option<Arc<MailboxSession>> {
        self.sessions()
            .iter()
            .find(|(key, _)| key.address.eq_ignore_ascii_case(address))
            .map(|(_, session)| Arc::clone(session))
    }

    pub fn len(&self) -> usize {
        self.sessions().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions().is_empty()
    }
}
