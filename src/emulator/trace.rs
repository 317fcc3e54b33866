use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::debug;

use super::ProtocolPeer;
use crate::core::{Error, Result};

/// One recorded request and what the station sent back
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Exchange {
    pub request: String,
    #[serde(default)]
    pub responses: Vec<String>,
}

/// Replays a recorded packet trace
///
/// Each request consumes the first unused exchange with the same request
/// text; requests without a match go unanswered.
#[derive(Debug, Clone, Default)]
pub struct TracePeer {
    exchanges: Vec<Exchange>,
}

impl TracePeer {
    pub fn new(exchanges: Vec<Exchange>) -> Self {
        TracePeer { exchanges }
    }

    /// Loads a JSON array of `{"request": .., "responses": [..]}` objects
    pub fn from_json(json: &str) -> Result<Self> {
        let exchanges: Vec<Exchange> = serde_json::from_str(json)
            .map_err(|e| Error::config(format!("Invalid trace: {}", e)))?;
        Ok(TracePeer::new(exchanges))
    }

    /// Exchanges not replayed yet
    pub fn remaining(&self) -> usize {
        self.exchanges.len()
    }
}

impl ProtocolPeer for TracePeer {
    fn respond(&mut self, request: &str, _now: Instant) -> Vec<String> {
        let request = request.trim();
        match self.exchanges.iter().position(|e| e.request == request) {
            Some(index) => self.exchanges.remove(index).responses,
            None => {
                debug!("No recorded exchange left for {:?}", request);
                Vec::new()
            }
        }
    }
}
