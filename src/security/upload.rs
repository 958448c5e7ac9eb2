use std::env;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use crate::error::{DeployerError, Result};
use crate::image::ImageRef;

use super::sarif::to_sarif;
use super::scan::ScanResult;

/// Deadline per upload target.
pub const UPLOAD_TIMEOUT: Duration = Duration::from_secs(30);

pub const ENV_DEFECTDOJO_API_KEY: &str = "DEFECTDOJO_API_KEY";

/// DefectDojo import target.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DefectDojoTarget {
    pub url: String,
    pub product: String,
    pub engagement: String,
}

/// Report upload settings. Failures here never abort the workflow.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub defectdojo: Option<DefectDojoTarget>,
    /// Directory a surrounding CI system watches for SARIF files.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sarif_dir: Option<PathBuf>,
}

/// Converts the scan result to SARIF and pushes it to every configured
/// target. The two targets run concurrently; each failure comes back as a
/// `(target, error)` pair for the caller to demote to a warning.
pub async fn upload_reports(
    config: &UploadConfig,
    scan: &ScanResult,
    image: &ImageRef,
) -> Vec<(String, DeployerError)> {
    let sarif = to_sarif(scan);
    let mut failures = Vec::new();

    let api_key = env::var(ENV_DEFECTDOJO_API_KEY).ok();
    let dojo = async {
        match &config.defectdojo {
            Some(target) => push_defectdojo(target, api_key, &sarif, image).await,
            None => Ok(()),
        }
    };
    let workspace = async {
        match &config.sarif_dir {
            Some(dir) => write_workspace_sarif(dir, &sarif, image),
            None => Ok(()),
        }
    };

    let (dojo_result, workspace_result) = tokio::join!(dojo, workspace);
    if let Err(err) = dojo_result {
        failures.push(("defectdojo".to_string(), err));
    }
    if let Err(err) = workspace_result {
        failures.push(("workspace-sarif".to_string(), err));
    }
    failures
}

async fn push_defectdojo(
    target: &DefectDojoTarget,
    api_key: Option<String>,
    sarif: &serde_json::Value,
    image: &ImageRef,
) -> Result<()> {
    let api_key = api_key.ok_or_else(|| {
        DeployerError::UploadFailed(format!(
            "{ENV_DEFECTDOJO_API_KEY} is not set; cannot reach {}",
            target.url
        ))
    })?;

    let client = reqwest::Client::builder()
        .timeout(UPLOAD_TIMEOUT)
        .build()
        .map_err(|err| DeployerError::UploadFailed(err.to_string()))?;
    let endpoint = format!("{}/api/v2/import-scan/", target.url.trim_end_matches('/'));
    let body = json!({
        "scanType": "SARIF",
        "productName": target.product,
        "engagementName": target.engagement,
        "testTitle": image.to_string(),
        "report": sarif,
    });

    let response = client
        .post(&endpoint)
        .header("Authorization", format!("Token {api_key}"))
        .json(&body)
        .send()
        .await
        .map_err(|err| DeployerError::UploadFailed(format!("{endpoint}: {err}")))?;
    if !response.status().is_success() {
        return Err(DeployerError::UploadFailed(format!(
            "{} responded with {}",
            endpoint,
            response.status()
        )));
    }
    debug!(endpoint = %endpoint, "scan report pushed to DefectDojo");
    Ok(())
}

fn write_workspace_sarif(
    dir: &std::path::Path,
    sarif: &serde_json::Value,
    image: &ImageRef,
) -> Result<()> {
    fs::create_dir_all(dir).map_err(|err| DeployerError::UploadFailed(err.to_string()))?;
    let file_name = format!("{}.sarif", sanitize_file_name(&image.to_string()));
    let path = dir.join(file_name);
    let bytes = serde_json::to_vec_pretty(sarif)
        .map_err(|err| DeployerError::UploadFailed(err.to_string()))?;
    fs::write(&path, bytes).map_err(|err| DeployerError::UploadFailed(err.to_string()))?;
    debug!(path = %path.display(), "SARIF written for CI ingestion");
    Ok(())
}

fn sanitize_file_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::scan::{ScanSummary, Severity, Vulnerability};
    use chrono::{DateTime, Utc};
    use tempfile::tempdir;

    fn scan() -> ScanResult {
        let vulnerabilities = vec![Vulnerability {
            id: "CVE-2024-0001".into(),
            severity: Severity::High,
            package: "openssl".into(),
            version: "1.2.3".into(),
            fixed_in: None,
            description: None,
            urls: Vec::new(),
        }];
        ScanResult {
            scanner: "grype".into(),
            version: "0.106.0".into(),
            image_digest: "sha256:abc".into(),
            summary: ScanSummary::from_vulnerabilities(&vulnerabilities),
            vulnerabilities,
            scanned_at: DateTime::<Utc>::MIN_UTC,
        }
    }

    #[tokio::test]
    async fn workspace_write_produces_a_sarif_file() {
        let dir = tempdir().expect("temp dir");
        let config = UploadConfig {
            enabled: true,
            defectdojo: None,
            sarif_dir: Some(dir.path().to_path_buf()),
        };
        let image = ImageRef::parse("ghcr.io/acme/api:v1").expect("image parses");
        let failures = upload_reports(&config, &scan(), &image).await;
        assert!(failures.is_empty(), "unexpected failures: {failures:?}");

        let entries: Vec<_> = fs::read_dir(dir.path())
            .expect("read dir")
            .map(|e| e.expect("entry").file_name())
            .collect();
        assert_eq!(entries.len(), 1);
        assert!(entries[0].to_string_lossy().ends_with(".sarif"));
    }

    #[tokio::test]
    async fn missing_api_key_is_an_upload_failure() {
        let target = DefectDojoTarget {
            url: "https://dojo.example".into(),
            product: "acme".into(),
            engagement: "ci".into(),
        };
        let image = ImageRef::parse("ghcr.io/acme/api:v1").expect("image parses");
        let sarif = to_sarif(&scan());
        let err = push_defectdojo(&target, None, &sarif, &image)
            .await
            .expect_err("no api key");
        assert!(matches!(err, DeployerError::UploadFailed(_)));
        assert!(err.demotable());
    }
}
