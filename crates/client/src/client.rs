//! The agent: one pool per configured target.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;

use culvert_wire::hash_key_id;

use crate::config::ClientConfig;
use crate::pool::ClientPool;

/// Dials one or more tunnel servers and serves the requests they relay.
pub struct Client {
    config: Arc<ClientConfig>,
    pools: Vec<ClientPool>,
    cancel: CancellationToken,
}

impl Client {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config: Arc::new(config.normalized()),
            pools: Vec::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// Start one connection pool per target. Returns immediately; pools
    /// dial and re-dial in the background until shutdown.
    pub fn start(&mut self) {
        if !self.pools.is_empty() {
            return;
        }

        for target in &self.config.targets {
            info!(target = %target, id = %self.config.id, "starting tunnel pool");
            self.pools.push(ClientPool::start(
                Arc::clone(&self.config),
                target.clone(),
                self.cancel.child_token(),
            ));
        }
    }

    /// Close every connection and stop re-dialing.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// The pool key this agent lands under when the server's validator
    /// returns the same secret the agent configured.
    pub fn hashed_id(&self) -> String {
        hash_key_id(&self.config.secret_key, &self.config.id)
    }

    pub fn targets(&self) -> impl Iterator<Item = &str> {
        self.pools.iter().map(|pool| pool.target())
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn start_is_idempotent() {
        let mut client = Client::new(ClientConfig {
            id: "a".to_string(),
            targets: vec!["ws://127.0.0.1:1/register".to_string()],
            ..ClientConfig::default()
        });
        client.start();
        client.start();
        assert_eq!(client.targets().count(), 1);
        client.shutdown();
    }

    #[test]
    fn hashed_id_matches_the_wire_rule() {
        let client = Client::new(ClientConfig {
            id: "a".to_string(),
            secret_key: "s".to_string(),
            ..ClientConfig::default()
        });
        assert_eq!(client.hashed_id(), hash_key_id("s", "a"));
    }
}
