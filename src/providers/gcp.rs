use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Value as JsonValue, json};

use crate::error::Result;
use crate::registry::{
    ComposeConvertInput, RegistryBuilder, SingleImageConvertInput, StaticConvertInput,
};

use super::compose_service_entries;

/// Environment fallback when a template omits its project id.
pub const ENV_GCP_PROJECT_ID: &str = "GCP_PROJECT_ID";

/// Template config for Cloud Run deployments.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GcpCloudRunTemplate {
    #[serde(default)]
    pub project_id: String,
    pub region: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_instances: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,
}

/// Resource config for a managed Cloud SQL Postgres instance.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostgresGcpCloudsqlConfig {
    pub project_id: String,
    pub region: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tier: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disk_size_gb: Option<u32>,
    #[serde(default)]
    pub deletion_protection: bool,
}

/// Resource and state-storage config for a GCS bucket.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GcpBucketConfig {
    pub project_id: String,
    pub bucket: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
}

/// Secrets-provider config backed by Cloud KMS.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GcpKmsConfig {
    pub project_id: String,
    pub key_ring: String,
    pub key_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
}

/// Auth handle carrying service-account credentials.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GcpServiceAccountConfig {
    pub project_id: String,
    pub account: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials: Option<String>,
}

/// Template config for bucket-backed static websites.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GcpStaticWebsiteTemplate {
    pub project_id: String,
    pub bucket: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
}

fn project_id_or_env(configured: &str) -> String {
    if configured.is_empty() {
        std::env::var(ENV_GCP_PROJECT_ID).unwrap_or_default()
    } else {
        configured.to_string()
    }
}

fn convert_compose(input: &ComposeConvertInput<'_>) -> Result<JsonValue> {
    let template: GcpCloudRunTemplate = serde_json::from_value(input.template.raw.clone())?;
    let services = compose_service_entries(input.project, input.client)?;
    Ok(json!({
        "platform": "gcp-cloudrun",
        "projectId": project_id_or_env(&template.project_id),
        "region": template.region,
        "serviceAccount": template.service_account,
        "stack": input.stack_name,
        "environment": input.environment,
        "scale": input.client.scale,
        "domain": input.client.domain,
        "uses": input.client.uses,
        "services": services,
    }))
}

fn convert_single_image(input: &SingleImageConvertInput<'_>) -> Result<JsonValue> {
    let template: GcpCloudRunTemplate = serde_json::from_value(input.template.raw.clone())?;
    Ok(json!({
        "platform": "gcp-cloudrun",
        "projectId": project_id_or_env(&template.project_id),
        "region": template.region,
        "stack": input.stack_name,
        "environment": input.environment,
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

fn convert_static(input: &StaticConvertInput<'_>) -> Result<JsonValue> {
    let template: GcpStaticWebsiteTemplate = serde_json::from_value(input.template.raw.clone())?;
    Ok(json!({
        "platform": "gcp-static-website",
        "projectId": template.project_id,
        "bucket": template.bucket,
        "location": template.location,
        "stack": input.stack_name,
        "bundleDir": input.stack_dir.join(&input.client.bundle_dir),
        "domain": input.client.domain,
        "indexDocument": input.client.index_document.as_deref().unwrap_or("index.html"),
        "errorDocument": input.client.error_document.as_deref().unwrap_or("404.html"),
    }))
}

pub fn register(builder: RegistryBuilder) -> RegistryBuilder {
    builder
        .config_reader::<GcpCloudRunTemplate>("gcp-cloudrun")
        .config_reader::<PostgresGcpCloudsqlConfig>("gcp-cloudsql-postgres")
        .config_reader::<GcpBucketConfig>("gcp-bucket")
        .config_reader::<GcpKmsConfig>("gcp-kms")
        .config_reader::<GcpServiceAccountConfig>("gcp-service-account")
        .config_reader::<GcpStaticWebsiteTemplate>("gcp-static-website")
        .provisioner_field::<GcpBucketConfig>("gcp-bucket")
        .provisioner_field::<GcpKmsConfig>("gcp-kms")
        .compose_converter("gcp-cloudrun", Arc::new(convert_compose))
        .single_image_converter("gcp-cloudrun", Arc::new(convert_single_image))
        .static_converter("gcp-static-website", Arc::new(convert_static))
}
