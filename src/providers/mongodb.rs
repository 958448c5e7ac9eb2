use serde::{Deserialize, Serialize};

use crate::registry::RegistryBuilder;

/// Resource config for a MongoDB Atlas cluster.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MongodbAtlasConfig {
    pub org_id: String,
    pub project_name: String,
    pub cluster_name: String,
    pub region: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_size: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cloud_provider: Option<String>,
}

pub fn register(builder: RegistryBuilder) -> RegistryBuilder {
    builder.config_reader::<MongodbAtlasConfig>("mongodb-atlas")
}
