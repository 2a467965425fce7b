//! Launch parameters handed to a remote agent on its command line

use base64::{Engine as _, engine::general_purpose::STANDARD};
use serde::{Deserialize, Serialize};
use url::Url;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentParams {
    /// Websocket URL the agent pushes its batches to
    pub web_socket_addr: String,
    /// Log file to tail on the remote host
    pub log_path: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ParamsError {
    #[error("invalid base64 parameter: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("invalid parameter json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid hub endpoint {endpoint}: {source}")]
    Endpoint {
        endpoint: String,
        #[source]
        source: url::ParseError,
    },
}

impl AgentParams {
    /// Parameters for the agent tailing `file` of `target`, reporting to the
    /// hub reachable at `endpoint` (`host:port`)
    pub fn for_file(
        endpoint: &str,
        target: &str,
        file: &str,
        log_path: &str,
    ) -> Result<Self, ParamsError> {
        let url = Url::parse_with_params(
            &format!("ws://{endpoint}/agentws"),
            &[("id", target), ("file", file)],
        )
        .map_err(|source| ParamsError::Endpoint {
            endpoint: endpoint.to_string(),
            source,
        })?;

        Ok(Self {
            web_socket_addr: url.to_string(),
            log_path: log_path.to_string(),
        })
    }

    pub fn encode(&self) -> Result<String, ParamsError> {
        Ok(STANDARD.encode(serde_json::to_vec(self)?))
    }

    pub fn decode(encoded: &str) -> Result<Self, ParamsError> {
        let raw = STANDARD.decode(encoded.trim())?;
        Ok(serde_json::from_slice(&raw)?)
    }
}
