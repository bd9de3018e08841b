//! The credential state machine: store, read, rotate, revoke and report.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use zeroize::Zeroizing;

use super::policy::MAX_AGE_LIMIT_SECONDS;
use super::{
    CredentialError, CredentialRecord, CredentialRepository, CredentialStatus,
    DecryptedCredential, RotationPolicy, RotationResult, RotationUpdate, StoreTokenRequest,
    TokenHealth,
};
use crate::crypto::CryptoEngine;
use crate::metadata::{TokenMetadata, MAX_ROTATION_COUNT};
use crate::refresh::PlatformRefresher;

const DEFAULT_REVOCATION_REASON: &str = "user_requested";
const SECONDS_PER_DAY: i64 = 86_400;

/// Upper bounds on the two kinds of I/O the manager performs.
#[derive(Debug, Clone, Copy)]
pub struct Timeouts {
    pub storage: std::time::Duration,
    pub refresh: std::time::Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            storage: std::time::Duration::from_secs(10),
            refresh: std::time::Duration::from_secs(30),
        }
    }
}

/// Orchestrates every credential operation.
///
/// Secrets pass through [`CryptoEngine`] before reaching the repository and
/// are never logged. Repository calls run on the blocking pool under
/// `Timeouts::storage`; the platform refresh runs under `Timeouts::refresh`.
///
/// Rotations of the same record are serialized by an in-process lock and
/// guarded in storage by a compare-and-swap on `rotation_count`, so at most
/// one rotation per record ever commits from a given token pair.
pub struct CredentialLifecycleManager {
    crypto: Arc<CryptoEngine>,
    repository: Arc<dyn CredentialRepository>,
    refresher: Arc<dyn PlatformRefresher>,
    policy: RotationPolicy,
    timeouts: Timeouts,
    rotation_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl CredentialLifecycleManager {
    pub fn new(
        crypto: Arc<CryptoEngine>,
        repository: Arc<dyn CredentialRepository>,
        refresher: Arc<dyn PlatformRefresher>,
        policy: RotationPolicy,
        timeouts: Timeouts,
    ) -> Self {
        Self {
            crypto,
            repository,
            refresher,
            policy,
            timeouts,
            rotation_locks: DashMap::new(),
        }
    }

    pub fn policy(&self) -> &RotationPolicy {
        &self.policy
    }

    /// Encrypts and persists a new credential. Returns the record id.
    pub async fn store_token(&self, request: StoreTokenRequest) -> Result<String, CredentialError> {
        let platform = request.platform.trim().to_lowercase();
        let username = request.username.trim().to_string();

        if request.owner_user_id.trim().is_empty() {
            return Err(CredentialError::InvalidInput("ownerUserId is required".to_string()));
        }
        if platform.is_empty() {
            return Err(CredentialError::InvalidInput("platform is required".to_string()));
        }
        if username.is_empty() {
            return Err(CredentialError::InvalidInput("username is required".to_string()));
        }
        if request.access_token.is_empty() {
            return Err(CredentialError::InvalidInput("accessToken is required".to_string()));
        }

        let lifetime = match request.expires_in_seconds {
            Some(secs) if secs <= 0 || secs as u64 > MAX_AGE_LIMIT_SECONDS => {
                return Err(CredentialError::InvalidInput(format!(
                    "expiresIn must be between 1 and {} seconds",
                    MAX_AGE_LIMIT_SECONDS
                )));
            }
            Some(secs) => Duration::seconds(secs),
            None => self.policy.max_age(),
        };

        let now = Utc::now();
        let scopes = request
            .scopes
            .iter()
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .map(str::to_string);
        let metadata = TokenMetadata::issue(&platform, scopes, now, lifetime);

        let access_token = Zeroizing::new(request.access_token);
        let refresh_token = request
            .refresh_token
            .filter(|t| !t.is_empty())
            .map(Zeroizing::new);

        let encrypted_access_token = self.crypto.encrypt(&access_token, &metadata)?;
        let encrypted_refresh_token = refresh_token
            .as_ref()
            .map(|t| self.crypto.encrypt(t, &metadata))
            .transpose()?;

        let record = CredentialRecord {
            id: Uuid::now_v7().to_string(),
            owner_user_id: request.owner_user_id,
            organization_id: request.organization_id,
            platform,
            external_username: username,
            encrypted_access_token: Some(encrypted_access_token),
            encrypted_refresh_token,
            token_expires_at: Some(metadata.expires_at),
            metadata,
            status: CredentialStatus::Connected,
            revoked_at: None,
            revocation_reason: None,
            created_at: now,
            updated_at: now,
        };

        let id = record.id.clone();
        let platform = record.platform.clone();
        let has_refresh_token = record.encrypted_refresh_token.is_some();

        self.with_repository("insert credential", move |repo| repo.insert(&record))
            .await?;

        info!(
            record_id = %id,
            platform = %platform,
            has_refresh_token,
            "Stored credential"
        );

        Ok(id)
    }

    /// Raw record, secrets still encrypted.
    pub async fn find_record(&self, id: &str) -> Result<Option<CredentialRecord>, CredentialError> {
        let id = id.to_string();
        self.with_repository("get credential", move |repo| repo.get(&id))
            .await
    }

    /// Decrypted view of one record; `None` if it does not exist.
    pub async fn get_token(&self, id: &str) -> Result<Option<DecryptedCredential>, CredentialError> {
        match self.find_record(id).await? {
            Some(record) => self.decrypt_record(record).map(Some),
            None => Ok(None),
        }
    }

    /// Decrypted records of an owner. Records that fail to decrypt are
    /// logged and left out.
    pub async fn list_owner_tokens(
        &self,
        owner_user_id: &str,
        organization_id: Option<&str>,
    ) -> Result<Vec<DecryptedCredential>, CredentialError> {
        let owner = owner_user_id.to_string();
        let org = organization_id.map(str::to_string);
        let records = self
            .with_repository("list credentials", move |repo| {
                repo.list_by_owner(&owner, org.as_deref())
            })
            .await?;

        let decrypted = records
            .into_iter()
            .filter_map(|record| {
                let id = record.id.clone();
                match self.decrypt_record(record) {
                    Ok(credential) => Some(credential),
                    Err(e) => {
                        warn!(record_id = %id, error = %e, "Skipping credential that failed to decrypt");
                        None
                    }
                }
            })
            .collect();

        Ok(decrypted)
    }

    /// Pure policy check for one record. Disconnected records never need
    /// rotation.
    pub async fn needs_rotation(&self, id: &str) -> Result<bool, CredentialError> {
        let record = self
            .find_record(id)
            .await?
            .ok_or_else(|| CredentialError::NotFound(id.to_string()))?;

        Ok(self.rotation_due(record.status, &record.metadata, Utc::now()))
    }

    /// Owner's records (optionally within one organization) due for rotation.
    pub async fn list_tokens_needing_rotation(
        &self,
        owner_user_id: &str,
        organization_id: Option<&str>,
    ) -> Result<Vec<DecryptedCredential>, CredentialError> {
        let now = Utc::now();
        let mut credentials = self.list_owner_tokens(owner_user_id, organization_id).await?;
        credentials.retain(|c| self.rotation_due(c.status, &c.metadata, now));
        Ok(credentials)
    }

    /// Exchanges the stored refresh token for a new token pair.
    ///
    /// The record is only written after the platform call succeeds, so a
    /// failure, timeout or cancellation before that point leaves it as it was.
    pub async fn rotate_token(&self, id: &str) -> Result<RotationResult, CredentialError> {
        let lock = self
            .rotation_locks
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        let result = {
            let _guard = lock.lock().await;
            self.rotate_locked(id).await
        };

        drop(lock);
        self.rotation_locks
            .remove_if(id, |_, lock| Arc::strong_count(lock) == 1);

        result
    }

    async fn rotate_locked(&self, id: &str) -> Result<RotationResult, CredentialError> {
        let record = self
            .find_record(id)
            .await?
            .ok_or_else(|| CredentialError::NotFound(id.to_string()))?;

        if record.status == CredentialStatus::Disconnected {
            return Ok(RotationResult::reauth_required("credential is disconnected"));
        }

        if record.metadata.rotation_count >= MAX_ROTATION_COUNT {
            self.set_status(id, CredentialStatus::ReauthRequired).await?;
            info!(record_id = %id, platform = %record.platform, rotation_count = record.metadata.rotation_count, "Rotation limit reached; re-authentication required");
            return Ok(RotationResult::reauth_required(
                "rotation limit reached; re-authentication required",
            ));
        }

        let encrypted_refresh = match &record.encrypted_refresh_token {
            Some(blob) => blob,
            None => {
                self.set_status(id, CredentialStatus::ReauthRequired).await?;
                info!(record_id = %id, platform = %record.platform, "No refresh token stored; re-authentication required");
                return Ok(RotationResult::reauth_required(
                    "no refresh token stored; re-authentication required",
                ));
            }
        };

        let refresh_token = match self.crypto.decrypt(encrypted_refresh, &record.metadata) {
            Ok(token) => Zeroizing::new(token),
            Err(e) => {
                error!(record_id = %id, error = %e, "Failed to decrypt refresh token");
                self.set_status(id, CredentialStatus::Error).await?;
                return Err(e.into());
            }
        };

        debug!(record_id = %id, platform = %record.platform, "Requesting token refresh");

        let refreshed = match tokio::time::timeout(
            self.timeouts.refresh,
            self.refresher.refresh(&record.platform, &refresh_token),
        )
        .await
        {
            Ok(Ok(tokens)) => tokens,
            Ok(Err(e)) => {
                warn!(record_id = %id, platform = %record.platform, error = %e, "Platform token refresh failed");
                return Ok(RotationResult::failed(format!("{:#}", e)));
            }
            Err(_) => {
                warn!(record_id = %id, platform = %record.platform, "Platform token refresh timed out");
                return Err(CredentialError::Timeout(format!(
                    "token refresh for '{}' exceeded {:?}",
                    record.platform, self.timeouts.refresh
                )));
            }
        };

        let now = Utc::now();
        let expires_at = refreshed
            .expires_at
            .unwrap_or_else(|| now + self.policy.max_age());
        if expires_at <= now {
            warn!(record_id = %id, "Platform returned an already expired token");
            return Ok(RotationResult::failed("platform returned an already expired token"));
        }

        let metadata = record.metadata.rotated(now, expires_at);
        metadata
            .validate(now)
            .map_err(|e| CredentialError::CorruptedMetadata(e.to_string()))?;

        // Keep the existing refresh token if the platform did not rotate it
        let next_refresh_token: &str = refreshed
            .refresh_token
            .as_deref()
            .unwrap_or(refresh_token.as_str());

        let update = RotationUpdate {
            id: id.to_string(),
            expected_rotation_count: record.metadata.rotation_count,
            access_token: self.crypto.encrypt(&refreshed.access_token, &metadata)?,
            refresh_token: Some(self.crypto.encrypt(next_refresh_token, &metadata)?),
            metadata,
            updated_at: now,
        };
        let rotation_count = update.metadata.rotation_count;

        let applied = match self
            .with_repository("write rotated credential", move |repo| {
                repo.update_rotation(&update)
            })
            .await
        {
            Err(CredentialError::Timeout(msg)) => {
                // The blocking write is not cancelled and may still commit
                warn!(record_id = %id, rotation_count, "Rotation write timed out; it may still be applied");
                return Err(CredentialError::Timeout(msg));
            }
            result => result?,
        };

        if !applied {
            warn!(record_id = %id, "Credential changed during rotation; discarding refreshed tokens");
            return Err(CredentialError::Conflict(format!(
                "credential '{}' was modified during rotation",
                id
            )));
        }

        info!(
            record_id = %id,
            platform = %record.platform,
            rotation_count,
            expires_at = %expires_at,
            "Rotated credential"
        );

        Ok(RotationResult::rotated(expires_at))
    }

    /// Disconnects a credential and destroys its secrets. Revoking an
    /// already disconnected record succeeds without changing it.
    pub async fn revoke_token(&self, id: &str, reason: Option<&str>) -> Result<bool, CredentialError> {
        let record = self
            .find_record(id)
            .await?
            .ok_or_else(|| CredentialError::NotFound(id.to_string()))?;

        if record.status == CredentialStatus::Disconnected {
            debug!(record_id = %id, "Credential already revoked");
            return Ok(true);
        }

        let reason = reason
            .map(str::trim)
            .filter(|r| !r.is_empty())
            .unwrap_or(DEFAULT_REVOCATION_REASON)
            .to_string();
        let record_id = id.to_string();
        let log_reason = reason.clone();

        let changed = self
            .with_repository("revoke credential", move |repo| {
                repo.revoke(&record_id, Utc::now(), &reason)
            })
            .await?;

        if changed {
            info!(record_id = %id, platform = %record.platform, reason = %log_reason, "Revoked credential");
        } else {
            debug!(record_id = %id, "Credential was revoked concurrently");
        }

        Ok(true)
    }

    /// Composite health report. Absent, revoked or unreadable records are
    /// reported as unusable rather than as errors. Records that need
    /// re-authentication or are in error keep their real expiry figures but
    /// are never valid.
    pub async fn validate_token_health(&self, id: &str) -> Result<TokenHealth, CredentialError> {
        let record = match self.find_record(id).await? {
            Some(record) => record,
            None => return Ok(TokenHealth::unusable(None)),
        };

        let last_rotated_at = Some(record.metadata.last_rotated_at);
        if record.status == CredentialStatus::Disconnected {
            return Ok(TokenHealth::unusable(last_rotated_at));
        }

        match self.decrypt_record(record) {
            Ok(credential) => Ok(self.health_of(&credential, Utc::now())),
            Err(e) => {
                warn!(record_id = %id, error = %e, "Credential failed to decrypt during health check");
                Ok(TokenHealth::unusable(last_rotated_at))
            }
        }
    }

    /// Health of an already decrypted credential at `now`.
    pub fn health_of(&self, credential: &DecryptedCredential, now: DateTime<Utc>) -> TokenHealth {
        let metadata = &credential.metadata;
        if credential.status == CredentialStatus::Disconnected || credential.access_token.is_none() {
            return TokenHealth::unusable(Some(metadata.last_rotated_at));
        }

        let is_expired = metadata.is_expired_at(now);
        let remaining_seconds = (metadata.expires_at - now).num_seconds();
        let days_until_expiry = if is_expired || remaining_seconds <= 0 {
            0
        } else {
            (remaining_seconds + SECONDS_PER_DAY - 1) / SECONDS_PER_DAY
        };

        TokenHealth {
            is_valid: credential.status == CredentialStatus::Connected && !is_expired,
            is_expired,
            needs_rotation: self.rotation_due(credential.status, metadata, now),
            days_until_expiry,
            last_rotated_at: Some(metadata.last_rotated_at),
        }
    }

    fn rotation_due(&self, status: CredentialStatus, metadata: &TokenMetadata, now: DateTime<Utc>) -> bool {
        status != CredentialStatus::Disconnected && self.policy.needs_rotation(metadata, now)
    }

    fn decrypt_record(&self, record: CredentialRecord) -> Result<DecryptedCredential, CredentialError> {
        record
            .metadata
            .validate(Utc::now())
            .map_err(|e| CredentialError::CorruptedMetadata(e.to_string()))?;

        let access_token = record
            .encrypted_access_token
            .as_ref()
            .map(|blob| self.crypto.decrypt(blob, &record.metadata))
            .transpose()?;
        let refresh_token = record
            .encrypted_refresh_token
            .as_ref()
            .map(|blob| self.crypto.decrypt(blob, &record.metadata))
            .transpose()?;

        Ok(DecryptedCredential {
            id: record.id,
            owner_user_id: record.owner_user_id,
            organization_id: record.organization_id,
            platform: record.platform,
            external_username: record.external_username,
            access_token,
            refresh_token,
            metadata: record.metadata,
            token_expires_at: record.token_expires_at,
            status: record.status,
        })
    }

    async fn set_status(&self, id: &str, status: CredentialStatus) -> Result<(), CredentialError> {
        let record_id = id.to_string();
        self.with_repository("update credential status", move |repo| {
            repo.set_status(&record_id, status, Utc::now())
        })
        .await?;
        Ok(())
    }

    /// Runs a repository call on the blocking pool, bounded by the storage
    /// timeout.
    async fn with_repository<T, F>(&self, operation: &'static str, f: F) -> Result<T, CredentialError>
    where
        T: Send + 'static,
        F: FnOnce(&dyn CredentialRepository) -> anyhow::Result<T> + Send + 'static,
    {
        let repository = Arc::clone(&self.repository);
        let task = tokio::task::spawn_blocking(move || f(repository.as_ref()));

        match tokio::time::timeout(self.timeouts.storage, task).await {
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(e))) => {
                error!(operation, error = %format!("{:#}", e), "Credential storage failed");
                Err(CredentialError::Storage(format!("{}: {:#}", operation, e)))
            }
            Ok(Err(join_error)) => Err(CredentialError::Storage(format!(
                "{}: task failed: {}",
                operation, join_error
            ))),
            Err(_) => {
                error!(operation, timeout = ?self.timeouts.storage, "Credential storage timed out");
                Err(CredentialError::Timeout(format!(
                    "{} exceeded {:?}",
                    operation, self.timeouts.storage
                )))
            }
        }
    }
}
