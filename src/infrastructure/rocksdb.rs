use crate::domain::ports::TokenStore;
use crate::domain::token::Token;
use crate::domain::wire::RawToken;
use crate::error::{Result, RoutingError};
use async_trait::async_trait;
use rocksdb::{ColumnFamily, ColumnFamilyDescriptor, DB, Options};
use std::path::Path;
use std::sync::Arc;

/// Column Family for checkpointed tokens.
pub const CF_TOKENS: &str = "tokens";

/// A persistent token store backed by RocksDB.
///
/// Tokens are checkpointed as wire-form JSON under a caller-chosen key, so a
/// driver loop can resume a half-routed token after a restart.
///
/// This struct is thread-safe (`Clone` shares the underlying `Arc<DB>`).
#[derive(Clone)]
pub struct RocksDbTokenStore {
    db: Arc<DB>,
}

impl RocksDbTokenStore {
    /// Opens or creates a RocksDB instance at the specified path, ensuring
    /// the "tokens" column family exists.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let cf_tokens = ColumnFamilyDescriptor::new(CF_TOKENS, Options::default());
        let db = DB::open_cf_descriptors(&opts, path, vec![cf_tokens])?;

        Ok(Self { db: Arc::new(db) })
    }

    fn tokens_cf(&self) -> Result<&ColumnFamily> {
        self.db.cf_handle(CF_TOKENS).ok_or_else(|| {
            RoutingError::IoError(std::io::Error::other("tokens column family not found"))
        })
    }
}

#[async_trait]
impl TokenStore for RocksDbTokenStore {
    async fn store(&self, key: &str, token: &Token) -> Result<()> {
        let cf = self.tokens_cf()?;
        let value = serde_json::to_vec(&token.to_wire())?;
        self.db.put_cf(cf, key.as_bytes(), value)?;
        Ok(())
    }

    async fn load(&self, key: &str) -> Result<Option<Token>> {
        let cf = self.tokens_cf()?;
        match self.db.get_cf(cf, key.as_bytes())? {
            Some(bytes) => {
                let raw: RawToken = serde_json::from_slice(&bytes)?;
                Ok(Some(Token::from_wire(raw)?))
            }
            None => Ok(None),
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let cf = self.tokens_cf()?;
        self.db.delete_cf(cf, key.as_bytes())?;
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>> {
        let cf = self.tokens_cf()?;
        let mut keys = Vec::new();
        for item in self.db.iterator_cf(cf, rocksdb::IteratorMode::Start) {
            let (key, _value) = item?;
            keys.push(String::from_utf8_lossy(&key).into_owned());
        }
        Ok(keys)
    }
}
