//! Member account verification
//!
//! Members present a credential when joining. The host resolves it to an
//! account username before any account-based check (bans, moderator
//! rights); a member whose credential does not resolve has no account.

use std::collections::HashMap;

use tracing::{debug, warn};

use crate::directory::LobbyDirectory;

/// Where member credentials are checked
#[derive(Debug, Clone, Default)]
pub enum AccountService {
    /// No verification; every member is anonymous
    #[default]
    Disabled,
    /// Credential -> username table held by the host
    Local(HashMap<String, String>),
    /// The lobby directory's account table
    Directory(LobbyDirectory),
}

impl AccountService {
    /// Resolve a credential to an account username
    pub async fn verify(&self, credential: Option<&str>) -> Option<String> {
        let credential = credential.filter(|c| !c.is_empty())?;
        let account = match self {
            Self::Disabled => None,
            Self::Local(accounts) => accounts.get(credential).cloned(),
            Self::Directory(directory) => match directory.verify(credential).await {
                Ok(account) => account,
                Err(e) => {
                    warn!("Account verification failed: {}", e);
                    None
                }
            },
        };
        if account.is_none() {
            debug!("Credential did not resolve to an account");
        }
        account
    }
}
