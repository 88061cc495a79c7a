// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! In-process repository backed by `DashMap`s.
//!
//! Uniqueness guards use the entry API so a check and its insert happen under
//! the same shard lock.

use crate::db::{user_provider_key, AccountRepository, RepoError};
use crate::models::{LoginHistoryEntry, Provider, ProviderAccountLink, SessionRecord, User};
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

#[derive(Default)]
pub struct MemoryRepository {
    users: DashMap<String, User>,
    /// phone -> user id
    phones: DashMap<String, String>,
    /// `{provider}:{provider_user_id}` -> link
    links: DashMap<String, ProviderAccountLink>,
    /// `{user_id}:{provider}` -> link id
    user_providers: DashMap<String, String>,
    history: DashMap<String, LoginHistoryEntry>,
    /// refresh hash -> session
    sessions: DashMap<String, SessionRecord>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live session records. Used by tests.
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Number of login history rows, across all users.
    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    fn claim_phone(&self, user: &User) -> Result<(), RepoError> {
        let Some(phone) = &user.phone else {
            return Ok(());
        };
        match self.phones.entry(phone.clone()) {
            Entry::Occupied(_) => Err(RepoError::Conflict(format!("phone {}", phone))),
            Entry::Vacant(slot) => {
                slot.insert(user.id.clone());
                Ok(())
            }
        }
    }

    fn release_phone(&self, user: &User) {
        if let Some(phone) = &user.phone {
            self.phones.remove_if(phone, |_, owner| owner == &user.id);
        }
    }

    fn claim_user_provider(&self, link: &ProviderAccountLink) -> Result<(), RepoError> {
        let key = user_provider_key(&link.user_id, link.provider);
        match self.user_providers.entry(key) {
            Entry::Occupied(slot) => Err(RepoError::Conflict(format!("provider {}", slot.key()))),
            Entry::Vacant(slot) => {
                slot.insert(link.id.clone());
                Ok(())
            }
        }
    }

    fn release_user_provider(&self, link: &ProviderAccountLink) {
        let key = user_provider_key(&link.user_id, link.provider);
        self.user_providers.remove_if(&key, |_, id| id == &link.id);
    }

    fn insert_user_row(&self, user: &User) -> Result<(), RepoError> {
        match self.users.entry(user.id.clone()) {
            Entry::Occupied(_) => Err(RepoError::Conflict(format!("user {}", user.id))),
            Entry::Vacant(slot) => {
                slot.insert(user.clone());
                Ok(())
            }
        }
    }

    fn active_user(&self, id: &str) -> Option<User> {
        self.users
            .get(id)
            .filter(|u| u.is_active)
            .map(|u| u.value().clone())
    }
}

#[async_trait]
impl AccountRepository for MemoryRepository {
    async fn find_user_by_id(&self, id: &str) -> Result<Option<User>, RepoError> {
        Ok(self.active_user(id))
    }

    async fn find_user_by_phone(&self, phone: &str) -> Result<Option<User>, RepoError> {
        let Some(user_id) = self.phones.get(phone).map(|id| id.value().clone()) else {
            return Ok(None);
        };
        Ok(self.active_user(&user_id))
    }

    async fn insert_user(&self, user: &User) -> Result<(), RepoError> {
        self.claim_phone(user)?;
        if let Err(e) = self.insert_user_row(user) {
            self.release_phone(user);
            return Err(e);
        }
        Ok(())
    }

    async fn insert_user_with_link(
        &self,
        user: &User,
        link: &ProviderAccountLink,
    ) -> Result<(), RepoError> {
        // Holding the vacant link slot keeps the identity reserved while the user row lands.
        match self.links.entry(link.id.clone()) {
            Entry::Occupied(_) => Err(RepoError::Conflict(format!("link {}", link.id))),
            Entry::Vacant(slot) => {
                self.claim_user_provider(link)?;
                if let Err(e) = self.claim_phone(user) {
                    self.release_user_provider(link);
                    return Err(e);
                }
                if let Err(e) = self.insert_user_row(user) {
                    self.release_phone(user);
                    self.release_user_provider(link);
                    return Err(e);
                }
                slot.insert(link.clone());
                Ok(())
            }
        }
    }

    async fn update_user(&self, user: &User) -> Result<(), RepoError> {
        match self.users.get_mut(&user.id) {
            Some(mut existing) if existing.is_active => {
                *existing = User {
                    is_active: true,
                    ..user.clone()
                };
                Ok(())
            }
            _ => Err(RepoError::NotFound(format!("user {}", user.id))),
        }
    }

    async fn set_user_active(&self, id: &str, active: bool) -> Result<(), RepoError> {
        match self.users.get_mut(id) {
            Some(mut user) => {
                user.is_active = active;
                Ok(())
            }
            None => Err(RepoError::NotFound(format!("user {}", id))),
        }
    }

    async fn find_link(
        &self,
        provider: Provider,
        provider_user_id: &str,
    ) -> Result<Option<ProviderAccountLink>, RepoError> {
        let key = ProviderAccountLink::key(provider, provider_user_id);
        Ok(self.links.get(&key).map(|l| l.value().clone()))
    }

    async fn links_for_user(&self, user_id: &str) -> Result<Vec<ProviderAccountLink>, RepoError> {
        Ok(self
            .links
            .iter()
            .filter(|l| l.user_id == user_id)
            .map(|l| l.value().clone())
            .collect())
    }

    async fn insert_link(&self, link: &ProviderAccountLink) -> Result<(), RepoError> {
        match self.links.entry(link.id.clone()) {
            Entry::Occupied(_) => Err(RepoError::Conflict(format!("link {}", link.id))),
            Entry::Vacant(slot) => {
                self.claim_user_provider(link)?;
                slot.insert(link.clone());
                Ok(())
            }
        }
    }

    async fn update_link(&self, link: &ProviderAccountLink) -> Result<(), RepoError> {
        match self.links.get_mut(&link.id) {
            Some(mut existing) => {
                *existing = link.clone();
                Ok(())
            }
            None => Err(RepoError::NotFound(format!("link {}", link.id))),
        }
    }

    async fn delete_link(
        &self,
        provider: Provider,
        provider_user_id: &str,
    ) -> Result<bool, RepoError> {
        let key = ProviderAccountLink::key(provider, provider_user_id);
        match self.links.remove(&key) {
            Some((_, link)) => {
                self.release_user_provider(&link);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn record_login(&self, entry: &LoginHistoryEntry) -> Result<(), RepoError> {
        self.history.insert(entry.id.clone(), entry.clone());
        Ok(())
    }

    async fn login_history(
        &self,
        user_id: &str,
        limit: usize,
    ) -> Result<Vec<LoginHistoryEntry>, RepoError> {
        let mut entries: Vec<LoginHistoryEntry> = self
            .history
            .iter()
            .filter(|e| e.user_id.as_deref() == Some(user_id))
            .map(|e| e.value().clone())
            .collect();
        entries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        entries.truncate(limit);
        Ok(entries)
    }

    async fn insert_session(&self, record: &SessionRecord) -> Result<(), RepoError> {
        match self.sessions.entry(record.refresh_hash.clone()) {
            Entry::Occupied(_) => Err(RepoError::Conflict("session".to_string())),
            Entry::Vacant(slot) => {
                slot.insert(record.clone());
                Ok(())
            }
        }
    }

    async fn take_session(&self, refresh_hash: &str) -> Result<Option<SessionRecord>, RepoError> {
        Ok(self.sessions.remove(refresh_hash).map(|(_, record)| record))
    }

    async fn delete_sessions_by_access_jti(&self, access_jti: &str) -> Result<usize, RepoError> {
        let before = self.sessions.len();
        self.sessions.retain(|_, record| record.access_jti != access_jti);
        Ok(before.saturating_sub(self.sessions.len()))
    }
}
