use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::registry::RegistryBuilder;

/// Provisioner config for the Pulumi backend. The nested state-storage and
/// secrets-provider blocks stay kind-tagged; the loader materializes them
/// through the provisioner-fields partition.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PulumiProvisionerConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organization: Option<String>,
    #[serde(default, skip_serializing_if = "JsonValue::is_null")]
    pub state_storage: JsonValue,
    #[serde(default, skip_serializing_if = "JsonValue::is_null")]
    pub secrets_provider: JsonValue,
}

pub fn register(builder: RegistryBuilder) -> RegistryBuilder {
    builder.config_reader::<PulumiProvisionerConfig>("pulumi")
}
