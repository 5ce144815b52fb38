//! Relational rules for servers, memberships, bans, invitations and
//! conversations.
//!
//! Every checked operation validates first and mutates last, so a rejected
//! operation leaves the roster exactly as it was. The `apply_*` methods take
//! facts already decided by the server and fold them in while keeping the
//! same invariants: one owner, no banned member, one membership per user.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use shared::{
    domain::{ConversationId, Role, ServerId, UserId},
    protocol::{BanSummary, ConversationSummary, InviteSummary, MemberSummary},
};
use thiserror::Error;

use crate::error::ClientError;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DomainError {
    #[error("user {0} is already a member")]
    AlreadyMember(UserId),
    #[error("user {0} is not a member")]
    NotMember(UserId),
    #[error("user {0} is banned from this server")]
    Banned(UserId),
    #[error("user {0} is already banned")]
    AlreadyBanned(UserId),
    #[error("user {0} is not banned")]
    NotBanned(UserId),
    #[error("the owner role only changes through ownership transfer")]
    OwnerRoleLocked,
    #[error("the owner must transfer ownership before leaving")]
    OwnerCannotLeave,
    #[error("permission denied: {0}")]
    PermissionDenied(&'static str),
    #[error("invitation '{0}' not found")]
    UnknownInvitation(String),
    #[error("invitation '{0}' already exists")]
    DuplicateInvitation(String),
    #[error("invitation '{0}' has been used up")]
    InvitationExhausted(String),
    #[error("invitation '{0}' has expired")]
    InvitationExpired(String),
    #[error("a conversation with oneself is not allowed")]
    SelfConversation,
    #[error("conversation {0} duplicates an existing pair")]
    DuplicateConversation(ConversationId),
    #[error("inconsistent roster: {0}")]
    Inconsistent(String),
}

impl From<DomainError> for ClientError {
    fn from(value: DomainError) -> Self {
        match value {
            DomainError::NotMember(_)
            | DomainError::NotBanned(_)
            | DomainError::UnknownInvitation(_) => ClientError::NotFound(value.to_string()),
            DomainError::PermissionDenied(_)
            | DomainError::OwnerRoleLocked
            | DomainError::Banned(_) => ClientError::Forbidden(value.to_string()),
            DomainError::SelfConversation => ClientError::Validation(value.to_string()),
            _ => ClientError::Conflict(value.to_string()),
        }
    }
}

pub type DomainResult<T> = Result<T, DomainError>;

/// Members, bans and invitations of one server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerRoster {
    server_id: ServerId,
    owner_id: UserId,
    members: BTreeMap<UserId, MemberSummary>,
    bans: BTreeMap<UserId, BanSummary>,
    invitations: HashMap<String, InviteSummary>,
}

impl ServerRoster {
    /// A fresh server with `owner_id` as its only member.
    pub fn new(server_id: ServerId, owner_id: UserId, owner_name: impl Into<String>) -> Self {
        let mut members = BTreeMap::new();
        members.insert(
            owner_id,
            MemberSummary {
                server_id,
                user_id: owner_id,
                username: owner_name.into(),
                role: Role::Owner,
            },
        );
        Self {
            server_id,
            owner_id,
            members,
            bans: BTreeMap::new(),
            invitations: HashMap::new(),
        }
    }

    /// Builds a roster from fetched lists, rejecting data that breaks the
    /// single-owner or ban exclusivity rules.
    pub fn from_parts(
        server_id: ServerId,
        members: Vec<MemberSummary>,
        bans: Vec<BanSummary>,
    ) -> DomainResult<Self> {
        let owners: Vec<UserId> = members
            .iter()
            .filter(|member| member.role == Role::Owner)
            .map(|member| member.user_id)
            .collect();
        let [owner_id] = owners.as_slice() else {
            return Err(DomainError::Inconsistent(format!(
                "server {server_id} has {} owners",
                owners.len()
            )));
        };
        let owner_id = *owner_id;

        let members: BTreeMap<UserId, MemberSummary> = members
            .into_iter()
            .map(|member| (member.user_id, member))
            .collect();
        let bans: BTreeMap<UserId, BanSummary> =
            bans.into_iter().map(|ban| (ban.user_id, ban)).collect();
        if let Some(user_id) = bans.keys().find(|user_id| members.contains_key(user_id)) {
            return Err(DomainError::Inconsistent(format!(
                "user {user_id} is both banned and a member"
            )));
        }

        Ok(Self {
            server_id,
            owner_id,
            members,
            bans,
            invitations: HashMap::new(),
        })
    }

    pub fn server_id(&self) -> ServerId {
        self.server_id
    }

    pub fn owner_id(&self) -> UserId {
        self.owner_id
    }

    pub fn member(&self, user_id: UserId) -> Option<&MemberSummary> {
        self.members.get(&user_id)
    }

    pub fn members(&self) -> impl Iterator<Item = &MemberSummary> {
        self.members.values()
    }

    pub fn bans(&self) -> impl Iterator<Item = &BanSummary> {
        self.bans.values()
    }

    pub fn role_of(&self, user_id: UserId) -> Option<Role> {
        self.members.get(&user_id).map(|member| member.role)
    }

    pub fn is_banned(&self, user_id: UserId) -> bool {
        self.bans.contains_key(&user_id)
    }

    pub fn invitation(&self, code: &str) -> Option<&InviteSummary> {
        self.invitations.get(code)
    }

    pub fn add_member(
        &mut self,
        user_id: UserId,
        username: impl Into<String>,
    ) -> DomainResult<&MemberSummary> {
        if self.bans.contains_key(&user_id) {
            return Err(DomainError::Banned(user_id));
        }
        if self.members.contains_key(&user_id) {
            return Err(DomainError::AlreadyMember(user_id));
        }
        Ok(self.members.entry(user_id).or_insert(MemberSummary {
            server_id: self.server_id,
            user_id,
            username: username.into(),
            role: Role::Member,
        }))
    }

    /// Leave when `actor == target`, kick otherwise.
    pub fn remove_member(&mut self, actor: UserId, target: UserId) -> DomainResult<MemberSummary> {
        let target_role = self.role_of(target).ok_or(DomainError::NotMember(target))?;
        if actor == target {
            if target_role == Role::Owner {
                return Err(DomainError::OwnerCannotLeave);
            }
        } else {
            let actor_role = self.role_of(actor).ok_or(DomainError::NotMember(actor))?;
            if !actor_role.can_moderate() {
                return Err(DomainError::PermissionDenied("kicking requires moderator rights"));
            }
            if !actor_role.outranks(target_role) {
                return Err(DomainError::PermissionDenied(
                    "cannot kick a member of equal or higher rank",
                ));
            }
        }
        self.members
            .remove(&target)
            .ok_or(DomainError::NotMember(target))
    }

    /// Promotions and demotions among member, moderator and admin.
    pub fn change_role(&mut self, actor: UserId, target: UserId, role: Role) -> DomainResult<()> {
        if role == Role::Owner {
            return Err(DomainError::OwnerRoleLocked);
        }
        let actor_role = self.role_of(actor).ok_or(DomainError::NotMember(actor))?;
        let target_role = self.role_of(target).ok_or(DomainError::NotMember(target))?;
        if target_role == Role::Owner {
            return Err(DomainError::OwnerRoleLocked);
        }
        if !actor_role.is_admin_tier() {
            return Err(DomainError::PermissionDenied("role changes require admin rights"));
        }
        if let Some(member) = self.members.get_mut(&target) {
            member.role = role;
        }
        Ok(())
    }

    /// Hands the owner role to `new_owner`; the previous owner becomes admin
    /// in the same step.
    pub fn transfer_ownership(&mut self, actor: UserId, new_owner: UserId) -> DomainResult<()> {
        if actor != self.owner_id {
            return Err(DomainError::PermissionDenied(
                "only the owner can transfer ownership",
            ));
        }
        if !self.members.contains_key(&new_owner) {
            return Err(DomainError::NotMember(new_owner));
        }
        if new_owner == actor {
            return Ok(());
        }
        self.swap_owner(actor, new_owner);
        Ok(())
    }

    /// Records a ban and drops the target's membership in one step.
    pub fn ban(
        &mut self,
        actor: UserId,
        target: UserId,
        reason: Option<String>,
        at: DateTime<Utc>,
    ) -> DomainResult<BanSummary> {
        let actor_role = self.role_of(actor).ok_or(DomainError::NotMember(actor))?;
        if !actor_role.can_moderate() {
            return Err(DomainError::PermissionDenied("banning requires moderator rights"));
        }
        if actor == target {
            return Err(DomainError::PermissionDenied("cannot ban oneself"));
        }
        if self.bans.contains_key(&target) {
            return Err(DomainError::AlreadyBanned(target));
        }
        if let Some(target_role) = self.role_of(target) {
            if !actor_role.outranks(target_role) {
                return Err(DomainError::PermissionDenied(
                    "cannot ban a member of equal or higher rank",
                ));
            }
        }

        let ban = BanSummary {
            server_id: self.server_id,
            user_id: target,
            reason,
            banned_at: at,
            banned_by: actor,
        };
        self.members.remove(&target);
        self.bans.insert(target, ban.clone());
        Ok(ban)
    }

    pub fn unban(&mut self, actor: UserId, target: UserId) -> DomainResult<BanSummary> {
        let actor_role = self.role_of(actor).ok_or(DomainError::NotMember(actor))?;
        if !actor_role.can_moderate() {
            return Err(DomainError::PermissionDenied("unbanning requires moderator rights"));
        }
        self.bans.remove(&target).ok_or(DomainError::NotBanned(target))
    }

    pub fn create_invitation(
        &mut self,
        actor: UserId,
        code: impl Into<String>,
        max_uses: Option<u32>,
        expires_at: Option<DateTime<Utc>>,
    ) -> DomainResult<InviteSummary> {
        if !self.members.contains_key(&actor) {
            return Err(DomainError::NotMember(actor));
        }
        let code = code.into();
        if self.invitations.contains_key(&code) {
            return Err(DomainError::DuplicateInvitation(code));
        }
        let invitation = InviteSummary {
            code: code.clone(),
            server_id: self.server_id,
            max_uses,
            expires_at,
            uses_consumed: 0,
        };
        self.invitations.insert(code, invitation.clone());
        Ok(invitation)
    }

    /// Counts one use and adds the membership, or does neither.
    pub fn consume_invitation(
        &mut self,
        code: &str,
        user_id: UserId,
        username: impl Into<String>,
        now: DateTime<Utc>,
    ) -> DomainResult<&MemberSummary> {
        let invitation = self
            .invitations
            .get(code)
            .ok_or_else(|| DomainError::UnknownInvitation(code.to_string()))?;
        if invitation.expires_at.is_some_and(|expires_at| now > expires_at) {
            return Err(DomainError::InvitationExpired(code.to_string()));
        }
        if invitation
            .max_uses
            .is_some_and(|max_uses| invitation.uses_consumed >= max_uses)
        {
            return Err(DomainError::InvitationExhausted(code.to_string()));
        }
        if self.bans.contains_key(&user_id) {
            return Err(DomainError::Banned(user_id));
        }
        if self.members.contains_key(&user_id) {
            return Err(DomainError::AlreadyMember(user_id));
        }

        if let Some(invitation) = self.invitations.get_mut(code) {
            invitation.uses_consumed += 1;
        }
        Ok(self.members.entry(user_id).or_insert(MemberSummary {
            server_id: self.server_id,
            user_id,
            username: username.into(),
            role: Role::Member,
        }))
    }

    /// Returns `false` when the user was not a member or is the owner.
    pub fn apply_removed(&mut self, user_id: UserId) -> bool {
        if user_id == self.owner_id {
            return false;
        }
        self.members.remove(&user_id).is_some()
    }

    pub fn apply_banned(&mut self, ban: BanSummary) -> bool {
        if ban.user_id == self.owner_id {
            return false;
        }
        self.members.remove(&ban.user_id);
        self.bans.insert(ban.user_id, ban);
        true
    }

    /// Replaces the ban list with a fetched one. Banned users lose their
    /// membership; a ban naming the owner is dropped.
    pub fn replace_bans(&mut self, bans: Vec<BanSummary>) {
        self.bans.clear();
        for ban in bans {
            self.apply_banned(ban);
        }
    }

    pub fn apply_unbanned(&mut self, user_id: UserId) -> bool {
        self.bans.remove(&user_id).is_some()
    }

    /// Ignores changes to or from the owner role.
    pub fn apply_role_changed(&mut self, user_id: UserId, role: Role) -> bool {
        if role == Role::Owner || user_id == self.owner_id {
            return false;
        }
        match self.members.get_mut(&user_id) {
            Some(member) if member.role != role => {
                member.role = role;
                true
            }
            _ => false,
        }
    }

    /// Returns `false` when the new owner is unknown locally.
    pub fn apply_owner_changed(&mut self, previous_owner: UserId, new_owner: UserId) -> bool {
        if !self.members.contains_key(&new_owner) {
            return false;
        }
        if new_owner == self.owner_id {
            return true;
        }
        let previous = if self.members.contains_key(&previous_owner) {
            previous_owner
        } else {
            self.owner_id
        };
        self.swap_owner(previous, new_owner);
        true
    }

    fn swap_owner(&mut self, previous: UserId, new_owner: UserId) {
        for member in self.members.values_mut() {
            if member.user_id == new_owner {
                member.role = Role::Owner;
            } else if member.role == Role::Owner || member.user_id == previous {
                member.role = Role::Admin;
            }
        }
        self.owner_id = new_owner;
    }

    pub fn owner_count(&self) -> usize {
        self.members
            .values()
            .filter(|member| member.role == Role::Owner)
            .count()
    }
}

/// One conversation per unordered pair of users.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConversationDirectory {
    by_pair: HashMap<(UserId, UserId), ConversationId>,
    conversations: BTreeMap<ConversationId, ConversationSummary>,
}

fn pair_key(a: UserId, b: UserId) -> (UserId, UserId) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

impl ConversationDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, conversation_id: ConversationId) -> Option<&ConversationSummary> {
        self.conversations.get(&conversation_id)
    }

    pub fn find(&self, a: UserId, b: UserId) -> Option<&ConversationSummary> {
        self.by_pair
            .get(&pair_key(a, b))
            .and_then(|id| self.conversations.get(id))
    }

    pub fn iter(&self) -> impl Iterator<Item = &ConversationSummary> {
        self.conversations.values()
    }

    pub fn len(&self) -> usize {
        self.conversations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conversations.is_empty()
    }

    /// Returns the existing conversation for the pair, or records a new one
    /// under `new_id`. The flag tells whether it was created.
    pub fn find_or_insert(
        &mut self,
        a: UserId,
        b: UserId,
        new_id: ConversationId,
    ) -> DomainResult<(ConversationSummary, bool)> {
        if a == b {
            return Err(DomainError::SelfConversation);
        }
        if let Some(existing) = self.find(a, b) {
            return Ok((existing.clone(), false));
        }
        let summary = ConversationSummary {
            conversation_id: new_id,
            user1: a,
            user2: b,
        };
        self.by_pair.insert(pair_key(a, b), new_id);
        self.conversations.insert(new_id, summary.clone());
        Ok((summary, true))
    }

    /// Records a conversation reported by the server. Repeating the same one
    /// is a no-op; a second id for the same pair is rejected.
    pub fn insert(&mut self, summary: ConversationSummary) -> DomainResult<bool> {
        if summary.user1 == summary.user2 {
            return Err(DomainError::SelfConversation);
        }
        let key = pair_key(summary.user1, summary.user2);
        match self.by_pair.get(&key) {
            Some(existing) if *existing == summary.conversation_id => Ok(false),
            Some(_) => Err(DomainError::DuplicateConversation(summary.conversation_id)),
            None => {
                self.by_pair.insert(key, summary.conversation_id);
                self.conversations.insert(summary.conversation_id, summary);
                Ok(true)
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/domain_tests.rs"]
mod tests;
