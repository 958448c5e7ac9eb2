use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Value as JsonValue, json};

use crate::error::Result;
use crate::registry::{ComposeConvertInput, RegistryBuilder, SingleImageConvertInput};

use super::compose_service_entries;

/// Template config for plain Kubernetes deployments.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KubernetesTemplate {
    pub namespace: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ingress_class: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class: Option<String>,
}

/// Auth handle carrying kubeconfig material.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KubeconfigAuthConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubeconfig: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
}

fn convert_compose(input: &ComposeConvertInput<'_>) -> Result<JsonValue> {
    let template: KubernetesTemplate = serde_json::from_value(input.template.raw.clone())?;
    let services = compose_service_entries(input.project, input.client)?;
    Ok(json!({
        "platform": "kubernetes",
        "namespace": template.namespace,
        "context": template.context,
        "ingressClass": template.ingress_class,
        "storageClass": template.storage_class,
        "stack": input.stack_name,
        "environment": input.environment,
        "replicas": input.client.scale.unwrap_or(1),
        "domain": input.client.domain,
        "uses": input.client.uses,
        "services": services,
    }))
}

fn convert_single_image(input: &SingleImageConvertInput<'_>) -> Result<JsonValue> {
    let template: KubernetesTemplate = serde_json::from_value(input.template.raw.clone())?;
    Ok(json!({
        "platform": "kubernetes",
        "namespace": template.namespace,
        "context": template.context,
        "stack": input.stack_name,
        "environment": input.environment,
        "replicas": 1,
        "services": [{
            "name": input.stack_name,
            "image": input.client.image,
            "env": input.client.env,
            "ports": input.client.port.map(|p| vec![p]).unwrap_or_default(),
            "ingress": true,
        }],
        "domain": input.client.domain,
    }))
}

pub fn register(builder: RegistryBuilder) -> RegistryBuilder {
    builder
        .config_reader::<KubernetesTemplate>("kubernetes")
        .config_reader::<KubeconfigAuthConfig>("kubeconfig")
        .compose_converter("kubernetes", Arc::new(convert_compose))
        .single_image_converter("kubernetes", Arc::new(convert_single_image))
}
