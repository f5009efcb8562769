use crate::domain::ports::TokenStore;
use crate::domain::token::Token;
use crate::domain::wire::RawToken;
use crate::error::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// A thread-safe in-memory token store.
///
/// Tokens are held in their wire form, so a load goes through the same
/// validation as one read back from disk. Ideal for tests and for runs
/// that do not need to survive the process.
#[derive(Default, Clone)]
pub struct InMemoryTokenStore {
    tokens: Arc<RwLock<HashMap<String, RawToken>>>,
}

impl InMemoryTokenStore {
    /// Creates a new, empty in-memory token store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TokenStore for InMemoryTokenStore {
    async fn store(&self, key: &str, token: &Token) -> Result<()> {
        let mut tokens = self.tokens.write().await;
        tokens.insert(key.to_string(), token.to_wire());
        Ok(())
    }

    async fn load(&self, key: &str) -> Result<Option<Token>> {
        let tokens = self.tokens.read().await;
        tokens.get(key).cloned().map(Token::from_wire).transpose()
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut tokens = self.tokens.write().await;
        tokens.remove(key);
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>> {
        let tokens = self.tokens.read().await;
        Ok(tokens.keys().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::token::{PhaseKind, Scope};
    use rust_decimal_macros::dec;
    use std::collections::BTreeMap;

    fn token() -> Token {
        let mut token = Token::new(BTreeMap::from([(Scope::from("eur"), dec!(42.50))]));
        token.set_phase(PhaseKind::Transfer);
        token
    }

    #[tokio::test]
    async fn test_in_memory_round_trip() {
        let store = InMemoryTokenStore::new();
        let token = token();

        store.store("tok-1", &token).await.unwrap();
        let loaded = store.load("tok-1").await.unwrap().unwrap();
        assert_eq!(loaded.to_wire(), token.to_wire());

        assert!(store.load("tok-2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_in_memory_delete_and_keys() {
        let store = InMemoryTokenStore::new();
        store.store("tok-1", &token()).await.unwrap();
        store.store("tok-2", &token()).await.unwrap();

        let mut keys = store.keys().await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["tok-1".to_string(), "tok-2".to_string()]);

        store.delete("tok-1").await.unwrap();
        assert!(store.load("tok-1").await.unwrap().is_none());
        assert_eq!(store.keys().await.unwrap(), vec!["tok-2".to_string()]);
    }
}
