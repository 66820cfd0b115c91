use serde::{Deserialize, Serialize};

use super::sample::SampleSpec;

/// Information about the connected server, as delivered by a server-info request.
///
/// Serializable for JSON export.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub user_name: String,
    pub host_name: String,
    pub server_version: String,
    pub server_name: String,
    pub sample_spec: SampleSpec,
    pub default_sink_name: Option<String>,
    pub default_source_name: Option<String>,
    pub cookie: u32,
}
