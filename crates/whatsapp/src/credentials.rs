//! Durable session credential, kept in a sled tree so a restart can resume
//! without scanning a new QR code.

use std::path::Path;

use {
    async_trait::async_trait, firstcontact_channels::SessionCredential, thiserror::Error,
    tracing::debug,
};

const CREDENTIAL_TREE: &str = "credentials";
const CREDENTIAL_KEY: &[u8] = b"current";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage error: {0}")]
    Db(#[from] sled::Error),
    #[error("corrupt credential record: {0}")]
    Credential(#[from] serde_json::Error),
    #[error("corrupt ledger record: {0}")]
    Ledger(#[from] postcard::Error),
}

/// Persists the transport's authentication state.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn load(&self) -> Result<Option<SessionCredential>, StoreError>;

    /// Durably replace the stored credential. Resolves after the write hits disk.
    async fn save(&self, credential: &SessionCredential) -> Result<(), StoreError>;

    async fn clear(&self) -> Result<(), StoreError>;
}

/// Open (or create) the session database under `dir`.
pub fn open_database(dir: &Path) -> Result<sled::Db, StoreError> {
    let path = dir.join("session.db");
    debug!(path = %path.display(), "opening session database");
    Ok(sled::open(path)?)
}

pub struct SledCredentialStore {
    tree: sled::Tree,
}

impl SledCredentialStore {
    pub fn open(db: &sled::Db) -> Result<Self, StoreError> {
        Ok(Self {
            tree: db.open_tree(CREDENTIAL_TREE)?,
        })
    }
}

#[async_trait]
impl CredentialStore for SledCredentialStore {
    async fn load(&self) -> Result<Option<SessionCredential>, StoreError> {
        match self.tree.get(CREDENTIAL_KEY)? {
            Some(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            None => Ok(None),
        }
    }

    async fn save(&self, credential: &SessionCredential) -> Result<(), StoreError> {
        let raw = serde_json::to_vec(credential)?;
        self.tree.insert(CREDENTIAL_KEY, raw)?;
        self.tree.flush_async().await?;
        debug!("session credential saved");
        Ok(())
    }

    async fn clear(&self) -> Result<(), StoreError> {
        self.tree.remove(CREDENTIAL_KEY)?;
        self.tree.flush_async().await?;
        Ok(())
    }
}
