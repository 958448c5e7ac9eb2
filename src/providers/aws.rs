use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Value as JsonValue, json};

use crate::error::Result;
use crate::registry::{
    ComposeConvertInput, RegistryBuilder, SingleImageConvertInput, StaticConvertInput,
};

use super::compose_service_entries;

/// Environment fallback when a template omits its account id.
pub const ENV_AWS_ACCOUNT_ID: &str = "AWS_ACCOUNT_ID";

/// Template config for ECS Fargate deployments.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AwsEcsFargateTemplate {
    #[serde(default)]
    pub account_id: String,
    pub region: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subnets: Vec<String>,
}

/// Resource and state-storage config for an S3 bucket.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct S3BucketConfig {
    pub bucket: String,
    pub region: String,
    #[serde(default)]
    pub versioning: bool,
}

/// Secrets-provider config backed by AWS KMS.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AwsKmsConfig {
    pub region: String,
    pub key_id: String,
}

/// Auth handle carrying static AWS credentials.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AwsCredentialsConfig {
    pub account_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_access_key: Option<String>,
}

/// Template config for S3/CloudFront static websites.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AwsStaticWebsiteTemplate {
    pub bucket: String,
    pub region: String,
    #[serde(default)]
    pub cloudfront: bool,
}

fn account_id_or_env(configured: &str) -> String {
    if configured.is_empty() {
        std::env::var(ENV_AWS_ACCOUNT_ID).unwrap_or_default()
    } else {
        configured.to_string()
    }
}

fn convert_compose(input: &ComposeConvertInput<'_>) -> Result<JsonValue> {
    let template: AwsEcsFargateTemplate = serde_json::from_value(input.template.raw.clone())?;
    let services = compose_service_entries(input.project, input.client)?;
    Ok(json!({
        "platform": "aws-ecs-fargate",
        "accountId": account_id_or_env(&template.account_id),
        "region": template.region,
        "cluster": template.cluster,
        "cpu": template.cpu,
        "memory": template.memory,
        "subnets": template.subnets,
        "stack": input.stack_name,
        "environment": input.environment,
        "scale": input.client.scale,
        "domain": input.client.domain,
        "uses": input.client.uses,
        "services": services,
    }))
}

fn convert_single_image(input: &SingleImageConvertInput<'_>) -> Result<JsonValue> {
    let template: AwsEcsFargateTemplate = serde_json::from_value(input.template.raw.clone())?;
    Ok(json!({
        "platform": "aws-ecs-fargate",
        "accountId": account_id_or_env(&template.account_id),
        "region": template.region,
        "cluster": template.cluster,
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
    let template: AwsStaticWebsiteTemplate = serde_json::from_value(input.template.raw.clone())?;
    Ok(json!({
        "platform": "aws-static-website",
        "bucket": template.bucket,
        "region": template.region,
        "cloudfront": template.cloudfront,
        "stack": input.stack_name,
        "bundleDir": input.stack_dir.join(&input.client.bundle_dir),
        "domain": input.client.domain,
        "indexDocument": input.client.index_document.as_deref().unwrap_or("index.html"),
        "errorDocument": input.client.error_document.as_deref().unwrap_or("404.html"),
    }))
}

pub fn register(builder: RegistryBuilder) -> RegistryBuilder {
    builder
        .config_reader::<AwsEcsFargateTemplate>("aws-ecs-fargate")
        .config_reader::<S3BucketConfig>("s3-bucket")
        .config_reader::<AwsKmsConfig>("aws-kms")
        .config_reader::<AwsCredentialsConfig>("aws-credentials")
        .config_reader::<AwsStaticWebsiteTemplate>("aws-static-website")
        .provisioner_field::<S3BucketConfig>("s3-bucket")
        .provisioner_field::<AwsKmsConfig>("aws-kms")
        .compose_converter("aws-ecs-fargate", Arc::new(convert_compose))
        .single_image_converter("aws-ecs-fargate", Arc::new(convert_single_image))
        .static_converter("aws-static-website", Arc::new(convert_static))
}
