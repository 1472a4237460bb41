//! Moderation
//!
//! Host-side kick / ban / unban on top of `SessionState` and the persistent
//! `BanList`. The room server calls into this from its actor loop, so every
//! operation sees a consistent session.

use std::collections::HashSet;
use std::net::IpAddr;

use tracing::{error, info};

use crate::ban_list::{BanList, BanListEntry};
use crate::error::ErrorCode;
use crate::member::Member;
use crate::session::SessionState;
use crate::types::ClientId;

/// Who is asking for a moderation action
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Actor {
    /// The hosting process itself
    Host,
    /// A joined member; allowed only if its account is a moderator
    Member(ClientId),
}

/// Kick / ban / unban logic and the ban list it maintains
#[derive(Debug)]
pub struct ModerationController {
    ban_list: BanList,
    /// Accounts granted moderator permission
    moderators: HashSet<String>,
}

impl ModerationController {
    pub fn new(ban_list: BanList, moderators: impl IntoIterator<Item = String>) -> Self {
        Self {
            ban_list,
            moderators: moderators.into_iter().collect(),
        }
    }

    /// Check that `actor` may moderate this session
    pub fn authorize(&self, session: &SessionState, actor: Actor) -> Result<(), ErrorCode> {
        match actor {
            Actor::Host => Ok(()),
            Actor::Member(id) => {
                let allowed = session
                    .member(id)
                    .and_then(|m| m.account.as_deref())
                    .map(|account| self.moderators.contains(account))
                    .unwrap_or(false);
                if allowed {
                    Ok(())
                } else {
                    Err(ErrorCode::InsufficientPermission)
                }
            }
        }
    }

    /// Remove a member without banning it
    ///
    /// The caller delivers the `Kicked` notice through the returned member.
    pub fn kick(
        &self,
        session: &mut SessionState,
        actor: Actor,
        nickname: &str,
    ) -> Result<Member, ErrorCode> {
        self.authorize(session, actor)?;
        let id = session
            .find_by_nickname(nickname)
            .map(|m| m.id)
            .ok_or(ErrorCode::UserNotFound)?;
        let member = session.remove_member(id).ok_or(ErrorCode::UserNotFound)?;
        info!("Member '{}' kicked by {:?}", member.nickname, actor);
        Ok(member)
    }

    /// Remove a member and ban its account (if any) and IP address
    pub async fn ban(
        &mut self,
        session: &mut SessionState,
        actor: Actor,
        nickname: &str,
    ) -> Result<Member, ErrorCode> {
        self.authorize(session, actor)?;
        let id = session
            .find_by_nickname(nickname)
            .map(|m| m.id)
            .ok_or(ErrorCode::UserNotFound)?;
        let member = session.remove_member(id).ok_or(ErrorCode::UserNotFound)?;

        if let Some(account) = &member.account {
            self.ban_list.insert(BanListEntry::account(account.clone()));
        }
        self.ban_list.insert(BanListEntry::ip(member.ip));
        info!(
            "Member '{}' ({}) banned by {:?}",
            member.nickname, member.ip, actor
        );

        self.persist().await;
        Ok(member)
    }

    /// Remove one ban list entry
    ///
    /// Connected members are not affected.
    pub async fn unban(
        &mut self,
        session: &SessionState,
        actor: Actor,
        entry: &BanListEntry,
    ) -> Result<(), ErrorCode> {
        self.authorize(session, actor)?;
        if !self.ban_list.remove(entry) {
            return Err(ErrorCode::UserNotFound);
        }
        info!("Unbanned {} '{}'", entry.ban_type, entry.subject);
        self.persist().await;
        Ok(())
    }

    /// Consulted on every join attempt
    pub fn is_banned(&self, account: Option<&str>, ip: IpAddr) -> bool {
        self.ban_list.is_banned(account, ip)
    }

    /// Ban list snapshot for the moderation surface
    pub fn ban_list(
        &self,
        session: &SessionState,
        actor: Actor,
    ) -> Result<Vec<BanListEntry>, ErrorCode> {
        self.authorize(session, actor)?;
        Ok(self.ban_list.entries())
    }

    async fn persist(&self) {
        if let Err(e) = self.ban_list.save().await {
            error!("Failed to persist ban list: {}", e);
        }
    }
}
