use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::{debug, info};

use crate::compose::load_compose;
use crate::descriptor::{ClientType, Stack, StackDescriptor};
use crate::error::{DeployerError, Result};
use crate::graph::{StackMap, parent_stack_key};
use crate::path_safety::resolve_in_stack_dir;
use crate::registry::{
    ComposeConvertInput, Registry, SingleImageConvertInput, StaticConvertInput,
};
use crate::secrets::{self, InterpolationContext};

const DEFAULT_COMPOSE_FILE: &str = "docker-compose.yaml";

/// Client config for `cloud-compose` deployments.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloudComposeConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub docker_compose_file: Option<PathBuf>,
    /// Names of parent resources this deployment consumes.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub uses: Vec<String>,
    /// Compose services to run; empty means all.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub runs: Vec<String>,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub env: IndexMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
}

impl CloudComposeConfig {
    pub fn compose_file(&self) -> &Path {
        self.docker_compose_file
            .as_deref()
            .unwrap_or_else(|| Path::new(DEFAULT_COMPOSE_FILE))
    }
}

/// Client config for `single-image` deployments.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SingleImageConfig {
    pub image: String,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub env: IndexMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
}

/// Client config for `static` website deployments.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StaticSiteConfig {
    pub bundle_dir: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index_document: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_document: Option<String>,
}

/// Extra environment values applied on top of the client config at deploy
/// time (CLI `--set` style overrides).
pub type DeployOverrides = IndexMap<String, String>;

/// Turns `(stacks, stackName, environment, overrides)` into a
/// provisioner-ready [`StackDescriptor`]. Pure over its inputs and the
/// registry; the only file I/O is reading the referenced compose file.
pub fn prepare_deploy(
    stacks: &StackMap,
    registry: &Registry,
    stacks_dir: &Path,
    stack_name: &str,
    environment: &str,
    overrides: &DeployOverrides,
) -> Result<StackDescriptor> {
    let stack = stacks
        .get(stack_name)
        .ok_or_else(|| DeployerError::UnknownStack(stack_name.to_string()))?;
    let client = stack.client.stacks.get(environment).ok_or_else(|| {
        DeployerError::Config(format!(
            "stack '{stack_name}' declares no client environment '{environment}'"
        ))
    })?;

    let parent_key = parent_stack_key(&client.parent);
    let parent = stacks
        .get(parent_key)
        .ok_or_else(|| DeployerError::UnknownStack(client.parent.clone()))?;

    // Transient child: deep copies so nothing aliases the graph during the
    // deploy.
    let mut child = Stack {
        name: stack_name.to_string(),
        server: parent.server.clone(),
        client: stack.client.clone(),
        secrets: parent.secrets.clone(),
    };

    let parent_env = client.parent_env.as_deref().unwrap_or(environment);
    let filter = child
        .server
        .secrets_config
        .as_ref()
        .and_then(|config| config.environments.get(parent_env));
    let base: BTreeMap<String, String> = child
        .secrets
        .values
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    let effective = secrets::resolve(&base, filter)?;

    let inaccessible = secrets::validate_access(&client.secrets, &base, filter)?;
    if !inaccessible.is_empty() {
        return Err(DeployerError::SecretsInaccessible {
            stack: stack_name.to_string(),
            names: inaccessible,
        });
    }
    child.secrets.values = effective.iter().map(|(k, v)| (k.clone(), v.clone())).collect();

    let template = child.server.templates.get(&client.template).ok_or_else(|| {
        DeployerError::UnknownTemplate {
            stack: stack_name.to_string(),
            template: client.template.clone(),
        }
    })?;
    if template.is_inherit() {
        return Err(DeployerError::InheritanceInvalid {
            site: format!("{parent_key}.templates.{}", client.template),
            reason: "template is an unresolved inheritance pointer".into(),
        });
    }
    let template_kind = template.kind.clone();
    let stack_dir = crate::loader::stack_dir(stacks_dir, stack_name);
    let site = format!("client.{environment}");

    debug!(
        stack = stack_name,
        environment,
        template = %client.template,
        kind = %template_kind,
        client_type = client.client_type.as_str(),
        "preparing deploy"
    );

    let config = match client.client_type {
        ClientType::CloudCompose => {
            let mut client_cfg: CloudComposeConfig = parse_client_config(client, &site)?;
            apply_env_overrides(&mut client_cfg.env, overrides);
            let compose_path = resolve_in_stack_dir(&stack_dir, client_cfg.compose_file())?;
            let project = load_compose(&compose_path)?;
            // Surface an ambiguous ingress before the converter runs.
            project.ingress_service()?;
            let converter = registry.compose_converter(&template_kind, &site)?;
            converter(&ComposeConvertInput {
                template,
                project: &project,
                client: &client_cfg,
                stack_name,
                environment,
            })?
        }
        ClientType::SingleImage => {
            let mut client_cfg: SingleImageConfig = parse_client_config(client, &site)?;
            apply_env_overrides(&mut client_cfg.env, overrides);
            let converter = registry.single_image_converter(&template_kind, &site)?;
            converter(&SingleImageConvertInput {
                template,
                client: &client_cfg,
                stack_name,
                environment,
            })?
        }
        ClientType::Static => {
            let client_cfg: StaticSiteConfig = parse_client_config(client, &site)?;
            let converter = registry.static_converter(&template_kind, &site)?;
            converter(&StaticConvertInput {
                template,
                stack_dir: &stack_dir,
                stack_name,
                client: &client_cfg,
            })?
        }
    };

    let ctx = InterpolationContext {
        stack_name,
        variables: &child.server.variables,
        auth: &child.secrets.auth,
        secrets: &effective,
    };
    let config = interpolate_json(config, &ctx)?;

    info!(stack = stack_name, environment, kind = %template_kind, "deploy descriptor prepared");
    Ok(StackDescriptor {
        stack_type: template_kind,
        parent_stack: client.parent.clone(),
        config,
    })
}

/// The secret map a `(stack, environment)` deploy will see; used by the
/// orchestrator to inject workload secrets.
pub fn effective_secrets(
    stacks: &StackMap,
    stack_name: &str,
    environment: &str,
) -> Result<BTreeMap<String, String>> {
    let stack = stacks
        .get(stack_name)
        .ok_or_else(|| DeployerError::UnknownStack(stack_name.to_string()))?;
    let client = stack.client.stacks.get(environment).ok_or_else(|| {
        DeployerError::Config(format!(
            "stack '{stack_name}' declares no client environment '{environment}'"
        ))
    })?;
    let parent = stacks
        .get(parent_stack_key(&client.parent))
        .ok_or_else(|| DeployerError::UnknownStack(client.parent.clone()))?;
    let parent_env = client.parent_env.as_deref().unwrap_or(environment);
    let filter = parent
        .server
        .secrets_config
        .as_ref()
        .and_then(|config| config.environments.get(parent_env));
    let base: BTreeMap<String, String> = parent
        .secrets
        .values
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    secrets::resolve(&base, filter)
}

fn parse_client_config<T: serde::de::DeserializeOwned>(
    client: &crate::descriptor::ClientEnvironment,
    site: &str,
) -> Result<T> {
    serde_json::from_value(client.config.clone()).map_err(|source| {
        DeployerError::MaterializeFailed {
            kind: client.client_type.as_str().to_string(),
            site: format!("{site}.config"),
            source,
        }
    })
}

fn apply_env_overrides(env: &mut IndexMap<String, String>, overrides: &DeployOverrides) {
    for (key, value) in overrides {
        env.insert(key.clone(), value.clone());
    }
}

/// Applies the secret reference grammar to every string in the converter
/// output.
fn interpolate_json(value: JsonValue, ctx: &InterpolationContext<'_>) -> Result<JsonValue> {
    Ok(match value {
        JsonValue::String(s) => JsonValue::String(secrets::interpolate(&s, ctx)?),
        JsonValue::Array(items) => JsonValue::Array(
            items
                .into_iter()
                .map(|item| interpolate_json(item, ctx))
                .collect::<Result<_>>()?,
        ),
        JsonValue::Object(map) => JsonValue::Object(
            map.into_iter()
                .map(|(key, item)| Ok((key, interpolate_json(item, ctx)?)))
                .collect::<Result<_>>()?,
        ),
        other => other,
    })
}
