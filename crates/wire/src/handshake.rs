//! The greeting an agent sends right after the websocket upgrade.

use culvert_common::{TunnelError, TunnelResult};
use serde::{Deserialize, Serialize};

/// First message on a freshly upgraded tunnel socket.
///
/// Tells the server who the agent is and how it wants its pool sized.
/// `size` is the idle count the agent intends to maintain; `max` bounds the
/// total sockets the server will carry for it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Handshake {
    /// Agent identifier; pooled verbatim unless a validator secret is in play.
    pub id: String,
    /// Informational display name, only used in logs and stats.
    #[serde(default)]
    pub name: String,
    /// Desired idle socket count.
    #[serde(default)]
    pub size: usize,
    /// Upper bound on total sockets for this agent.
    #[serde(rename = "max")]
    pub max_size: usize,
    /// Optional codec hint.
    #[serde(default)]
    pub compress: String,
    /// Opaque identifiers the agent wants echoed back in stats.
    #[serde(default, rename = "clientIds")]
    pub client_ids: Vec<serde_json::Value>,
}

impl Handshake {
    /// Reject greetings that would misconfigure the pool.
    pub fn validate(&self) -> TunnelResult<()> {
        if self.id.is_empty() {
            return Err(TunnelError::Greeting("empty client id".to_string()));
        }

        if self.max_size == 0 {
            return Err(TunnelError::Greeting("max pool size must be positive".to_string()));
        }

        if self.size > self.max_size {
            return Err(TunnelError::Greeting(format!(
                "idle size {} exceeds max pool size {}",
                self.size, self.max_size
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn greeting(size: usize, max_size: usize) -> Handshake {
        Handshake {
            id: "agent".to_string(),
            size,
            max_size,
            ..Handshake::default()
        }
    }

    #[test]
    fn parses_wire_field_names() {
        let json = r#"{"id":"a","name":"n","size":2,"max":4,"compress":"","clientIds":[1,"x"]}"#;
        let hs: Handshake = serde_json::from_str(json).unwrap();
        assert_eq!(hs.id, "a");
        assert_eq!(hs.size, 2);
        assert_eq!(hs.max_size, 4);
        assert_eq!(hs.client_ids.len(), 2);
        hs.validate().unwrap();
    }

    #[test]
    fn optional_fields_default() {
        let hs: Handshake = serde_json::from_str(r#"{"id":"a","max":1}"#).unwrap();
        assert_eq!(hs.size, 0);
        assert!(hs.client_ids.is_empty());
        hs.validate().unwrap();
    }

    #[test]
    fn size_beyond_max_is_rejected() {
        assert!(greeting(5, 4).validate().is_err());
        assert!(greeting(4, 4).validate().is_ok());
    }

    #[test]
    fn zero_max_is_rejected() {
        assert!(greeting(0, 0).validate().is_err());
    }
}
