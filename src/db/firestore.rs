// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Firestore-backed account repository.
//!
//! Uniqueness relies on deterministic document ids written with an
//! `exists == false` precondition:
//! - `phone_index/{phone}` guards phone numbers
//! - `provider_links/{provider}:{provider_user_id}` guards provider identities
//! - `user_providers/{user_id}:{provider}` keeps one link per provider per user
//! - `sessions/{refresh_hash}` is consumed by a delete with `exists == true`,
//!   so only one of two concurrent refreshes can win

use crate::db::{collections, timed, user_provider_key, AccountRepository, RepoError};
use crate::models::{LoginHistoryEntry, Provider, ProviderAccountLink, SessionRecord, User};
use async_trait::async_trait;
use firestore::errors::FirestoreError;
use firestore::{paths, FirestoreWritePrecondition};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Document stored under `phone_index/{phone}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PhoneIndexEntry {
    user_id: String,
}

/// Document stored under `user_providers/{user_id}:{provider}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct UserProviderEntry {
    link_id: String,
}

fn db_error(e: FirestoreError) -> RepoError {
    match e {
        FirestoreError::DataConflictError(conflict) => RepoError::Conflict(conflict.to_string()),
        other => RepoError::Backend(other.to_string()),
    }
}

/// Firestore account repository.
#[derive(Clone)]
pub struct FirestoreRepository {
    client: Option<firestore::FirestoreDb>,
    timeout: Duration,
}

impl FirestoreRepository {
    /// Create a new Firestore client.
    ///
    /// For local development with emulator, set FIRESTORE_EMULATOR_HOST.
    pub async fn new(project_id: &str, timeout: Duration) -> Result<Self, RepoError> {
        if std::env::var("FIRESTORE_EMULATOR_HOST").is_ok() {
            return Self::create_emulator_client(project_id, timeout).await;
        }

        let client = firestore::FirestoreDb::new(project_id)
            .await
            .map_err(|e| RepoError::Backend(format!("Failed to connect to Firestore: {}", e)))?;

        tracing::info!(project = project_id, "Connected to Firestore");

        Ok(Self {
            client: Some(client),
            timeout,
        })
    }

    /// Create a Firestore client for the emulator with unauthenticated access.
    async fn create_emulator_client(project_id: &str, timeout: Duration) -> Result<Self, RepoError> {
        tracing::info!("Using unauthenticated connection for Firestore Emulator");

        let token_source = gcloud_sdk::ExternalJwtFunctionSource::new(|| async {
            Ok(gcloud_sdk::Token {
                token_type: "Bearer".to_string(),
                token: gcloud_sdk::SecretValue::new(
                    "eyJhbGciOiJub25lIn0.eyJ1aWQiOiJ0ZXN0In0."
                        .to_string()
                        .into(),
                ),
                expiry: chrono::Utc::now() + chrono::Duration::hours(1),
            })
        });

        let options = firestore::FirestoreDbOptions::new(project_id.to_string());

        let client = firestore::FirestoreDb::with_options_token_source(
            options,
            gcloud_sdk::GCP_DEFAULT_SCOPES.clone(),
            gcloud_sdk::TokenSourceType::ExternalSource(Box::new(token_source)),
        )
        .await
        .map_err(|e| {
            RepoError::Backend(format!("Failed to connect to Firestore Emulator: {}", e))
        })?;

        tracing::info!(
            project = project_id,
            "Connected to Firestore (Emulator/Unauthenticated)"
        );

        Ok(Self {
            client: Some(client),
            timeout,
        })
    }

    /// Offline client; every operation returns an error.
    pub fn new_mock() -> Self {
        Self {
            client: None,
            timeout: Duration::from_secs(5),
        }
    }

    fn get_client(&self) -> Result<&firestore::FirestoreDb, RepoError> {
        self.client
            .as_ref()
            .ok_or_else(|| RepoError::Backend("Database not connected (offline mode)".to_string()))
    }

    async fn get_user_doc(&self, id: &str) -> Result<Option<User>, RepoError> {
        self.get_client()?
            .fluent()
            .select()
            .by_id_in(collections::USERS)
            .obj()
            .one(id)
            .await
            .map_err(db_error)
    }

    /// Write the user (and its phone index entry) inside `transaction`, create-only.
    fn add_user_to_transaction(
        &self,
        user: &User,
        transaction: &mut firestore::FirestoreTransaction<'_>,
    ) -> Result<(), RepoError> {
        let client = self.get_client()?;

        if let Some(phone) = &user.phone {
            client
                .fluent()
                .update()
                .in_col(collections::PHONE_INDEX)
                .precondition(FirestoreWritePrecondition::Exists(false))
                .document_id(phone)
                .object(&PhoneIndexEntry {
                    user_id: user.id.clone(),
                })
                .add_to_transaction(transaction)
                .map_err(db_error)?;
        }

        client
            .fluent()
            .update()
            .in_col(collections::USERS)
            .precondition(FirestoreWritePrecondition::Exists(false))
            .document_id(&user.id)
            .object(user)
            .add_to_transaction(transaction)
            .map_err(db_error)?;

        Ok(())
    }

    /// Write the link and its per-user provider guard inside `transaction`, create-only.
    fn add_link_to_transaction(
        &self,
        link: &ProviderAccountLink,
        transaction: &mut firestore::FirestoreTransaction<'_>,
    ) -> Result<(), RepoError> {
        let client = self.get_client()?;

        client
            .fluent()
            .update()
            .in_col(collections::USER_PROVIDERS)
            .precondition(FirestoreWritePrecondition::Exists(false))
            .document_id(user_provider_key(&link.user_id, link.provider))
            .object(&UserProviderEntry {
                link_id: link.id.clone(),
            })
            .add_to_transaction(transaction)
            .map_err(db_error)?;

        client
            .fluent()
            .update()
            .in_col(collections::PROVIDER_LINKS)
            .precondition(FirestoreWritePrecondition::Exists(false))
            .document_id(&link.id)
            .object(link)
            .add_to_transaction(transaction)
            .map_err(db_error)?;

        Ok(())
    }
}

#[async_trait]
impl AccountRepository for FirestoreRepository {
    // ─── User Operations ─────────────────────────────────────────

    async fn find_user_by_id(&self, id: &str) -> Result<Option<User>, RepoError> {
        timed(self.timeout, async {
            Ok(self.get_user_doc(id).await?.filter(|u| u.is_active))
        })
        .await
    }

    async fn find_user_by_phone(&self, phone: &str) -> Result<Option<User>, RepoError> {
        timed(self.timeout, async {
            let entry: Option<PhoneIndexEntry> = self
                .get_client()?
                .fluent()
                .select()
                .by_id_in(collections::PHONE_INDEX)
                .obj()
                .one(phone)
                .await
                .map_err(db_error)?;

            match entry {
                Some(entry) => Ok(self
                    .get_user_doc(&entry.user_id)
                    .await?
                    .filter(|u| u.is_active)),
                None => Ok(None),
            }
        })
        .await
    }

    async fn insert_user(&self, user: &User) -> Result<(), RepoError> {
        timed(self.timeout, async {
            let mut transaction = self
                .get_client()?
                .begin_transaction()
                .await
                .map_err(|e| RepoError::Backend(format!("Failed to begin transaction: {}", e)))?;

            self.add_user_to_transaction(user, &mut transaction)?;

            transaction.commit().await.map_err(db_error)?;
            tracing::debug!(user_id = %user.id, "Inserted user");
            Ok(())
        })
        .await
    }

    async fn insert_user_with_link(
        &self,
        user: &User,
        link: &ProviderAccountLink,
    ) -> Result<(), RepoError> {
        timed(self.timeout, async {
            let client = self.get_client()?;
            let mut transaction = client
                .begin_transaction()
                .await
                .map_err(|e| RepoError::Backend(format!("Failed to begin transaction: {}", e)))?;

            self.add_user_to_transaction(user, &mut transaction)?;
            self.add_link_to_transaction(link, &mut transaction)?;

            transaction.commit().await.map_err(db_error)?;
            tracing::debug!(user_id = %user.id, link = %link.id, "Inserted user with provider link");
            Ok(())
        })
        .await
    }

    async fn update_user(&self, user: &User) -> Result<(), RepoError> {
        timed(self.timeout, async {
            // `is_active` and `phone` are outside the mask.
            let _: () = self
                .get_client()?
                .fluent()
                .update()
                .fields(paths!(User::{
                    email,
                    display_name,
                    avatar_url,
                    primary_provider,
                    credits,
                    updated_at,
                    last_login_at,
                    profile
                }))
                .in_col(collections::USERS)
                .precondition(FirestoreWritePrecondition::Exists(true))
                .document_id(&user.id)
                .object(user)
                .execute()
                .await
                .map_err(db_error)?;

            match self.get_user_doc(&user.id).await? {
                Some(stored) if stored.is_active => Ok(()),
                _ => Err(RepoError::NotFound(format!("user {}", user.id))),
            }
        })
        .await
    }

    async fn set_user_active(&self, id: &str, active: bool) -> Result<(), RepoError> {
        timed(self.timeout, async {
            let mut user = self
                .get_user_doc(id)
                .await?
                .ok_or_else(|| RepoError::NotFound(format!("user {}", id)))?;
            user.is_active = active;

            let _: () = self
                .get_client()?
                .fluent()
                .update()
                .in_col(collections::USERS)
                .precondition(FirestoreWritePrecondition::Exists(true))
                .document_id(id)
                .object(&user)
                .execute()
                .await
                .map_err(db_error)?;

            tracing::info!(user_id = id, active, "User active flag changed");
            Ok(())
        })
        .await
    }

    // ─── Provider Link Operations ────────────────────────────────

    async fn find_link(
        &self,
        provider: Provider,
        provider_user_id: &str,
    ) -> Result<Option<ProviderAccountLink>, RepoError> {
        timed(self.timeout, async {
            self.get_client()?
                .fluent()
                .select()
                .by_id_in(collections::PROVIDER_LINKS)
                .obj()
                .one(&ProviderAccountLink::key(provider, provider_user_id))
                .await
                .map_err(db_error)
        })
        .await
    }

    async fn links_for_user(&self, user_id: &str) -> Result<Vec<ProviderAccountLink>, RepoError> {
        let user_id = user_id.to_string();
        timed(self.timeout, async {
            self.get_client()?
                .fluent()
                .select()
                .from(collections::PROVIDER_LINKS)
                .filter(move |q| q.field("user_id").eq(user_id.clone()))
                .obj()
                .query()
                .await
                .map_err(db_error)
        })
        .await
    }

    async fn insert_link(&self, link: &ProviderAccountLink) -> Result<(), RepoError> {
        timed(self.timeout, async {
            let mut transaction = self
                .get_client()?
                .begin_transaction()
                .await
                .map_err(|e| RepoError::Backend(format!("Failed to begin transaction: {}", e)))?;

            self.add_link_to_transaction(link, &mut transaction)?;

            transaction.commit().await.map_err(db_error)?;
            tracing::debug!(user_id = %link.user_id, link = %link.id, "Inserted provider link");
            Ok(())
        })
        .await
    }

    async fn update_link(&self, link: &ProviderAccountLink) -> Result<(), RepoError> {
        timed(self.timeout, async {
            let _: () = self
                .get_client()?
                .fluent()
                .update()
                .in_col(collections::PROVIDER_LINKS)
                .precondition(FirestoreWritePrecondition::Exists(true))
                .document_id(&link.id)
                .object(link)
                .execute()
                .await
                .map_err(db_error)?;
            Ok(())
        })
        .await
    }

    async fn delete_link(
        &self,
        provider: Provider,
        provider_user_id: &str,
    ) -> Result<bool, RepoError> {
        let key = ProviderAccountLink::key(provider, provider_user_id);
        timed(self.timeout, async {
            let client = self.get_client()?;
            let link: Option<ProviderAccountLink> = client
                .fluent()
                .select()
                .by_id_in(collections::PROVIDER_LINKS)
                .obj()
                .one(&key)
                .await
                .map_err(db_error)?;

            let Some(link) = link else {
                return Ok(false);
            };

            let mut transaction = client
                .begin_transaction()
                .await
                .map_err(|e| RepoError::Backend(format!("Failed to begin transaction: {}", e)))?;

            client
                .fluent()
                .delete()
                .from(collections::PROVIDER_LINKS)
                .precondition(FirestoreWritePrecondition::Exists(true))
                .document_id(&key)
                .add_to_transaction(&mut transaction)
                .map_err(db_error)?;
            client
                .fluent()
                .delete()
                .from(collections::USER_PROVIDERS)
                .document_id(user_provider_key(&link.user_id, link.provider))
                .add_to_transaction(&mut transaction)
                .map_err(db_error)?;

            match transaction.commit().await {
                Ok(_) => Ok(true),
                Err(FirestoreError::DataNotFoundError(_)) => Ok(false),
                Err(e) => Err(db_error(e)),
            }
        })
        .await
    }

    // ─── Login History ───────────────────────────────────────────

    async fn record_login(&self, entry: &LoginHistoryEntry) -> Result<(), RepoError> {
        timed(self.timeout, async {
            let _: () = self
                .get_client()?
                .fluent()
                .update()
                .in_col(collections::LOGIN_HISTORY)
                .document_id(&entry.id)
                .object(entry)
                .execute()
                .await
                .map_err(db_error)?;
            Ok(())
        })
        .await
    }

    async fn login_history(
        &self,
        user_id: &str,
        limit: usize,
    ) -> Result<Vec<LoginHistoryEntry>, RepoError> {
        let user_id = user_id.to_string();
        timed(self.timeout, async {
            self.get_client()?
                .fluent()
                .select()
                .from(collections::LOGIN_HISTORY)
                .filter(move |q| q.field("user_id").eq(user_id.clone()))
                .order_by([("created_at", firestore::FirestoreQueryDirection::Descending)])
                .limit(limit as u32)
                .obj()
                .query()
                .await
                .map_err(db_error)
        })
        .await
    }

    // ─── Session Operations ──────────────────────────────────────

    async fn insert_session(&self, record: &SessionRecord) -> Result<(), RepoError> {
        timed(self.timeout, async {
            let _: () = self
                .get_client()?
                .fluent()
                .update()
                .in_col(collections::SESSIONS)
                .precondition(FirestoreWritePrecondition::Exists(false))
                .document_id(&record.refresh_hash)
                .object(record)
                .execute()
                .await
                .map_err(db_error)?;
            Ok(())
        })
        .await
    }

    async fn take_session(&self, refresh_hash: &str) -> Result<Option<SessionRecord>, RepoError> {
        timed(self.timeout, async {
            let client = self.get_client()?;
            let record: Option<SessionRecord> = client
                .fluent()
                .select()
                .by_id_in(collections::SESSIONS)
                .obj()
                .one(refresh_hash)
                .await
                .map_err(db_error)?;

            let Some(record) = record else {
                return Ok(None);
            };

            // Whoever deletes the document first owns the refresh.
            let deleted = client
                .fluent()
                .delete()
                .from(collections::SESSIONS)
                .precondition(FirestoreWritePrecondition::Exists(true))
                .document_id(refresh_hash)
                .execute()
                .await;

            match deleted {
                Ok(()) => Ok(Some(record)),
                Err(FirestoreError::DataNotFoundError(_)) => Ok(None),
                Err(e) => Err(db_error(e)),
            }
        })
        .await
    }

    async fn delete_sessions_by_access_jti(&self, access_jti: &str) -> Result<usize, RepoError> {
        let jti = access_jti.to_string();
        timed(self.timeout, async {
            let client = self.get_client()?;
            let records: Vec<SessionRecord> = client
                .fluent()
                .select()
                .from(collections::SESSIONS)
                .filter(move |q| q.field("access_jti").eq(jti.clone()))
                .obj()
                .query()
                .await
                .map_err(db_error)?;

            for record in &records {
                client
                    .fluent()
                    .delete()
                    .from(collections::SESSIONS)
                    .document_id(&record.refresh_hash)
                    .execute()
                    .await
                    .map_err(db_error)?;
            }

            Ok(records.len())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_offline_repository_reports_backend_error() {
        let repo = FirestoreRepository::new_mock();
        let err = repo.find_user_by_id("anyone").await.unwrap_err();
        assert!(matches!(err, RepoError::Backend(_)));
    }
}
