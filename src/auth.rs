//! Bearer-token authentication store
//!
//! Tokens are 32 random bytes rendered as lowercase hex, mapping 1→1 to an
//! agent id. The whole map is loaded from a JSON file at start-up and written
//! back on every mutation; mutations are rare admin actions, so whole-file
//! rewrites are fine.

use crate::domain_types::AgentId;
use rand::RngCore;
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::sync::RwLock;
use tracing::{info, warn};

/// How many leading characters of a token the listing exposes.
const TOKEN_PREFIX_LEN: usize = 8;

/// Errors from the token store.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("token file I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("token file is not valid JSON: {0}")]
    Codec(#[from] serde_json::Error),
}

/// Truncated token descriptor for listings. Raw tokens never leave the store
/// after generation.
#[derive(Debug, Clone, Serialize)]
pub struct TokenInfo {
    pub agent_id: AgentId,
    pub token_prefix: String,
}

/// Token → agent map persisted as a JSON file.
pub struct TokenStore {
    path: PathBuf,
    map: RwLock<HashMap<String, AgentId>>,
}

impl TokenStore {
    /// Loads the store from `path`; a missing file starts empty.
    ///
    /// # Errors
    ///
    /// Returns an error when the file exists but cannot be read or parsed.
    pub async fn load(path: PathBuf) -> Result<Self, AuthError> {
        let map = match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let raw: HashMap<String, String> = serde_json::from_slice(&bytes)?;
                let mut map = HashMap::with_capacity(raw.len());
                for (token, agent) in raw {
                    match AgentId::try_new(agent) {
                        Ok(agent_id) => {
                            map.insert(token, agent_id);
                        }
                        Err(err) => warn!(%err, "skipping token with invalid agent id"),
                    }
                }
                map
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(err) => return Err(err.into()),
        };
        info!(tokens = map.len(), path = %path.display(), "token store loaded");
        Ok(Self {
            path,
            map: RwLock::new(map),
        })
    }

    /// Resolves a bearer token to its agent id.
    pub async fn verify(&self, token: &str) -> Option<AgentId> {
        self.map.read().await.get(token).cloned()
    }

    /// Mints a new token for `agent_id` and persists the map.
    ///
    /// # Errors
    ///
    /// Returns an error when the file write fails; the in-memory map is
    /// already updated in that case and will be re-persisted on the next
    /// mutation.
    pub async fn generate(&self, agent_id: AgentId) -> Result<String, AuthError> {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        let token = hex::encode(bytes);
        {
            let mut map = self.map.write().await;
            map.insert(token.clone(), agent_id.clone());
        }
        self.persist().await?;
        info!(agent_id = %agent_id, "token generated");
        Ok(token)
    }

    /// Removes every token for `agent_id`, returning how many were revoked.
    ///
    /// # Errors
    ///
    /// Returns an error when the file write fails.
    pub async fn revoke(&self, agent_id: &AgentId) -> Result<usize, AuthError> {
        let removed = {
            let mut map = self.map.write().await;
            let before = map.len();
            map.retain(|_, a| a != agent_id);
            before - map.len()
        };
        if removed > 0 {
            self.persist().await?;
            info!(agent_id = %agent_id, removed, "tokens revoked");
        }
        Ok(removed)
    }

    /// Lists truncated token prefixes per agent; never the raw tokens.
    pub async fn list(&self) -> Vec<TokenInfo> {
        let map = self.map.read().await;
        let mut out: Vec<TokenInfo> = map
            .iter()
            .map(|(token, agent_id)| TokenInfo {
                agent_id: agent_id.clone(),
                token_prefix: format!("{}…", &token[..TOKEN_PREFIX_LEN.min(token.len())]),
            })
            .collect();
        out.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        out
    }

    async fn persist(&self) -> Result<(), AuthError> {
        let snapshot: HashMap<String, String> = {
            let map = self.map.read().await;
            map.iter()
                .map(|(t, a)| (t.clone(), a.to_string()))
                .collect()
        };
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_vec_pretty(&snapshot)?;
        tokio::fs::write(&self.path, json).await?;
        Ok(())
    }
}
