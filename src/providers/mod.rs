use serde::{Deserialize, Serialize};
use serde_json::{Value as JsonValue, json};

use crate::compose::ComposeProject;
use crate::error::Result;
use crate::prepare::CloudComposeConfig;
use crate::registry::RegistryBuilder;

pub mod aws;
pub mod cloudflare;
pub mod gcp;
pub mod k8s;
pub mod mongodb;
pub mod pulumi;

/// CI/CD config for GitHub Actions pipelines.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GithubActionsConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organization: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_file: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub environments: Vec<String>,
}

/// Registers every built-in provider module on the builder.
pub fn register_all(builder: RegistryBuilder) -> RegistryBuilder {
    let builder = builder.config_reader::<GithubActionsConfig>("github-actions");
    let builder = pulumi::register(builder);
    let builder = gcp::register(builder);
    let builder = aws::register(builder);
    let builder = k8s::register(builder);
    let builder = cloudflare::register(builder);
    mongodb::register(builder)
}

/// Normalized service entries shared by the compose converters: the
/// `runs` selection applied, environments merged (client config wins), and
/// the `simple-container.com/*` hints folded in.
pub(crate) fn compose_service_entries(
    project: &ComposeProject,
    client: &CloudComposeConfig,
) -> Result<Vec<JsonValue>> {
    let ingress = project.ingress_service()?.map(|(name, _)| name.to_string());
    let mut entries = Vec::new();

    for (name, service) in &project.services {
        if !client.runs.is_empty() && !client.runs.iter().any(|run| run == name) {
            continue;
        }
        let mut env = service.environment_map();
        for (key, value) in &client.env {
            env.insert(key.clone(), value.clone());
        }
        let hints = service.hints();
        let mut entry = json!({
            "name": name,
            "image": service.image,
            "env": env,
            "ports": service.container_ports(),
            "ingress": ingress.as_deref() == Some(name.as_str()),
        });
        if let Some(port) = hints.ingress_port {
            entry["ingressPort"] = json!(port);
        }
        if let Some(path) = hints.healthcheck_path {
            entry["healthcheck"] = json!({
                "path": path,
                "port": hints.healthcheck_port,
                "successCodes": hints.healthcheck_success_codes,
            });
        }
        if let Some(size) = hints.volume_size {
            entry["volume"] = json!({
                "size": size,
                "accessModes": hints.volume_access_modes,
                "storageClass": hints.volume_storage_class,
            });
        }
        entries.push(entry);
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Registry;

    #[test]
    fn default_registry_knows_builtin_kinds() {
        let registry = Registry::with_default_providers();
        for kind in [
            "github-actions",
            "pulumi",
            "gcp-cloudrun",
            "gcp-cloudsql-postgres",
            "gcp-bucket",
            "gcp-kms",
            "gcp-service-account",
            "aws-ecs-fargate",
            "s3-bucket",
            "aws-kms",
            "kubernetes",
            "cloudflare",
            "mongodb-atlas",
        ] {
            registry
                .config_reader(kind, "test")
                .unwrap_or_else(|_| panic!("kind '{kind}' should be registered"));
        }
    }

    #[test]
    fn compose_converters_are_registered_per_template_kind() {
        let registry = Registry::with_default_providers();
        for kind in ["gcp-cloudrun", "aws-ecs-fargate", "kubernetes"] {
            registry
                .compose_converter(kind, "test")
                .unwrap_or_else(|_| panic!("compose converter for '{kind}'"));
            registry
                .single_image_converter(kind, "test")
                .unwrap_or_else(|_| panic!("single-image converter for '{kind}'"));
        }
        registry
            .static_converter("gcp-static-website", "test")
            .expect("gcp static converter");
        registry
            .static_converter("aws-static-website", "test")
            .expect("aws static converter");
    }
}
