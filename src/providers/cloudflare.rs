use serde::{Deserialize, Serialize};

use crate::registry::RegistryBuilder;

/// Registrar config delegating DNS management to a Cloudflare zone.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloudflareRegistrarConfig {
    pub account_id: String,
    pub zone_name: String,
    #[serde(default)]
    pub proxied: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_token: Option<String>,
}

pub fn register(builder: RegistryBuilder) -> RegistryBuilder {
    builder.config_reader::<CloudflareRegistrarConfig>("cloudflare")
}
