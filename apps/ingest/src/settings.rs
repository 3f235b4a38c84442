use std::sync::Arc;

use rand::Rng;

use crate::store::{IngestStore, StoreError};

pub const SESSION_SECRET_SETTINGS_KEY: &str = "SESSION_SECRET";
pub const ADMIN_PASSWORD_SETTINGS_KEY: &str = "ADMIN_PASSWORD";
pub const CORRELATION_API_SECRET_SETTINGS_KEY: &str = "CORRELATION_API_KEY";
pub const PAGES_TO_COLLECT_SETTINGS_KEY: &str = "PAGES_TO_COLLECT";
pub const CHAINLOAD_URI_SETTINGS_KEY: &str = "CHAINLOAD_URI";

const SECRET_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
const SESSION_SECRET_LENGTH: usize = 64;
const ADMIN_PASSWORD_LENGTH: usize = 32;
const CORRELATION_API_SECRET_LENGTH: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("failed to hash admin credential: {0}")]
    Hash(String),
}

/// Which secrets the bootstrap run created. All `false` on an initialized store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BootstrapReport {
    pub session_secret_created: bool,
    pub admin_user_created: bool,
    pub correlation_api_secret_created: bool,
}

/// Handle over the settings table used for dynamic configuration and
/// process secrets.
#[derive(Clone)]
pub struct SettingsService {
    store: Arc<dyn IngestStore>,
}

impl SettingsService {
    pub fn new(store: Arc<dyn IngestStore>) -> Self {
        Self { store }
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.store.get_setting(key).await
    }

    pub async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.store.set_setting(key, value).await
    }

    /// Pages the probe should fetch and report. Missing or unparsable
    /// values read as an empty list.
    pub async fn pages_to_collect(&self) -> Result<Vec<String>, StoreError> {
        let Some(raw) = self.get(PAGES_TO_COLLECT_SETTINGS_KEY).await? else {
            return Ok(Vec::new());
        };
        match serde_json::from_str::<Vec<String>>(&raw) {
            Ok(pages) => Ok(pages),
            Err(error) => {
                tracing::warn!(
                    target: "probe_ingest.settings",
                    error = %error,
                    "pages-to-collect setting is not a JSON string array; ignoring it",
                );
                Ok(Vec::new())
            }
        }
    }

    pub async fn chainload_uri(&self) -> Result<String, StoreError> {
        Ok(self
            .get(CHAINLOAD_URI_SETTINGS_KEY)
            .await?
            .unwrap_or_default())
    }

    /// Ensures the session secret, admin credential and correlation API
    /// secret exist. Each check is independent and a no-op once the key is
    /// present.
    pub async fn bootstrap(&self, bcrypt_rounds: u32) -> Result<BootstrapReport, BootstrapError> {
        let (session_secret_created, admin_user_created, correlation_api_secret_created) = tokio::try_join!(
            self.ensure_session_secret(),
            self.ensure_admin_user(bcrypt_rounds),
            self.ensure_correlation_api_secret(),
        )?;

        Ok(BootstrapReport {
            session_secret_created,
            admin_user_created,
            correlation_api_secret_created,
        })
    }

    async fn ensure_session_secret(&self) -> Result<bool, BootstrapError> {
        let created = self
            .store
            .create_setting_if_absent(
                SESSION_SECRET_SETTINGS_KEY,
                &secure_random_string(SESSION_SECRET_LENGTH),
            )
            .await?;
        if created {
            tracing::info!(target: "probe_ingest.bootstrap", "generated new session secret");
        }
        Ok(created)
    }

    async fn ensure_admin_user(&self, bcrypt_rounds: u32) -> Result<bool, BootstrapError> {
        if self.get(ADMIN_PASSWORD_SETTINGS_KEY).await?.is_some() {
            return Ok(false);
        }

        let password = secure_random_string(ADMIN_PASSWORD_LENGTH);
        let password_hash = hash_password(password.clone(), bcrypt_rounds).await?;
        let created = self
            .store
            .create_setting_if_absent(ADMIN_PASSWORD_SETTINGS_KEY, &password_hash)
            .await?;
        // Losing the insert race means another process already announced its password.
        if created {
            tracing::warn!(
                target: "probe_ingest.bootstrap",
                "\n{}",
                admin_user_created_banner(&password)
            );
        }
        Ok(created)
    }

    async fn ensure_correlation_api_secret(&self) -> Result<bool, BootstrapError> {
        let created = self
            .store
            .create_setting_if_absent(
                CORRELATION_API_SECRET_SETTINGS_KEY,
                &secure_random_string(CORRELATION_API_SECRET_LENGTH),
            )
            .await?;
        if created {
            tracing::info!(target: "probe_ingest.bootstrap", "generated new correlation API secret");
        }
        Ok(created)
    }
}

/// Lowercase alphanumeric string drawn uniformly from the thread CSPRNG.
pub fn secure_random_string(length: usize) -> String {
    let mut rng = rand::rng();
    (0..length)
        .map(|_| char::from(SECRET_ALPHABET[rng.random_range(0..SECRET_ALPHABET.len())]))
        .collect()
}

pub async fn hash_password(password: String, rounds: u32) -> Result<String, BootstrapError> {
    tokio::task::spawn_blocking(move || bcrypt::hash(password, rounds))
        .await
        .map_err(|error| BootstrapError::Hash(error.to_string()))?
        .map_err(|error| BootstrapError::Hash(error.to_string()))
}

fn admin_user_created_banner(password: &str) -> String {
    let rule = "=".repeat(76);
    let alert = "!".repeat(76);
    format!(
        "{rule}\n{alert}\n\n    ATTENTION: an admin user for the control panel has been created\n    \
         with the following password:\n\n    PASSWORD: {password}\n\n    \
         This instance has exactly one user. This is the only time the\n    \
         password is shown. Store it in a password manager now and do not\n    \
         share it with anyone you do not trust.\n\n{alert}\n{rule}"
    )
}
