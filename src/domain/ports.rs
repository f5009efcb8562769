use crate::domain::token::Token;
use crate::error::Result;
use async_trait::async_trait;

/// Checkpoint storage for tokens between pipeline steps, keyed by a
/// caller-chosen identifier. Implementations persist the wire form.
#[async_trait]
pub trait TokenStore: Send + Sync {
    async fn store(&self, key: &str, token: &Token) -> Result<()>;
    async fn load(&self, key: &str) -> Result<Option<Token>>;
    async fn delete(&self, key: &str) -> Result<()>;
    async fn keys(&self) -> Result<Vec<String>>;
}

pub type TokenStoreBox = Box<dyn TokenStore>;
