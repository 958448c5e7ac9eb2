use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::ProfileConfig;
use crate::descriptor::{Stack, StackDescriptor};
use crate::error::Result;
use crate::registry::KindConfigReader;

/// Parameters accompanying a deploy request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployParams {
    pub environment: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default)]
    pub preview: bool,
}

/// Boundary to the IaC backend that applies resolved stacks to the cloud.
/// Concrete drivers (Pulumi etc.) live outside this crate; factories are
/// registered per kind in the [`crate::registry::Registry`].
#[async_trait]
pub trait Provisioner: Send + Sync {
    fn set_public_key(&mut self, key: String);

    /// Hands the provisioner a reader so it can materialize nested
    /// kind-tagged configs on its own.
    fn set_config_reader(&mut self, reader: KindConfigReader);

    async fn provision_stack(&self, cfg: &ProfileConfig, stack: &Stack) -> Result<()>;

    async fn deploy_stack(
        &self,
        cfg: &ProfileConfig,
        descriptor: &StackDescriptor,
        params: &DeployParams,
    ) -> Result<()>;
}
