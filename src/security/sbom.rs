use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::debug;

use crate::error::{DeployerError, Result};
use crate::exec::{CommandRunner, CommandSpec};
use crate::image::ImageRef;
use crate::tools::ToolInstaller;

/// Deadline for syft invocations.
pub const SBOM_TIMEOUT: Duration = Duration::from_secs(300);

pub const FORMAT_CYCLONEDX_JSON: &str = "cyclonedx-json";
pub const FORMAT_SPDX_JSON: &str = "spdx-json";

/// Predicate type used when attaching the SBOM as an attestation.
pub const PREDICATE_CYCLONEDX: &str = "cyclonedx";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SbomConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub required: bool,
    #[serde(default = "default_format")]
    pub format: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_local: Option<PathBuf>,
}

impl Default for SbomConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            required: false,
            format: default_format(),
            output_local: None,
        }
    }
}

fn default_format() -> String {
    FORMAT_CYCLONEDX_JSON.to_string()
}

/// Opaque SBOM bytes plus generator metadata.
#[derive(Debug, Clone)]
pub struct SbomResult {
    pub format: String,
    pub bytes: Vec<u8>,
    pub tool: String,
    pub version: String,
    pub package_count: usize,
}

/// Generates an SBOM for the image with syft in the configured format.
pub async fn generate_sbom(
    config: &SbomConfig,
    image: &ImageRef,
    installer: &ToolInstaller<'_>,
    runner: &dyn CommandRunner,
) -> Result<SbomResult> {
    let tool = installer.check_installed("syft").await?;

    let spec = CommandSpec {
        program: "syft".into(),
        args: vec![image.to_string(), "-o".into(), config.format.clone()],
        stdin: None,
        timeout: SBOM_TIMEOUT,
    };
    let output = runner.run(&spec).await?;
    if !output.success() {
        return Err(DeployerError::SbomFailed(format!(
            "syft exited with {:?}: {}",
            output.exit_code, output.stderr
        )));
    }

    let package_count = count_packages(&output.stdout, &config.format);
    if let Some(path) = &config.output_local {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, &output.stdout)?;
        debug!(path = %path.display(), "SBOM written locally");
    }

    Ok(SbomResult {
        format: config.format.clone(),
        bytes: output.stdout,
        tool: "syft".into(),
        version: tool
            .version
            .map(|v| v.to_string())
            .unwrap_or_else(|| "unknown".into()),
        package_count,
    })
}

/// Component count from the generated document; CycloneDX keeps components
/// and SPDX keeps packages at the top level.
fn count_packages(bytes: &[u8], format: &str) -> usize {
    let Ok(document) = serde_json::from_slice::<JsonValue>(bytes) else {
        return 0;
    };
    let key = if format.starts_with("spdx") {
        "packages"
    } else {
        "components"
    };
    document
        .get(key)
        .and_then(JsonValue::as_array)
        .map(Vec::len)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn counts_cyclonedx_components() {
        let document = json!({"components": [{"name": "a"}, {"name": "b"}]});
        assert_eq!(
            count_packages(document.to_string().as_bytes(), FORMAT_CYCLONEDX_JSON),
            2
        );
    }

    #[test]
    fn counts_spdx_packages() {
        let document = json!({"packages": [{"name": "a"}]});
        assert_eq!(
            count_packages(document.to_string().as_bytes(), FORMAT_SPDX_JSON),
            1
        );
    }

    #[test]
    fn malformed_documents_count_zero() {
        assert_eq!(count_packages(b"not json", FORMAT_CYCLONEDX_JSON), 0);
    }

    #[test]
    fn default_format_is_cyclonedx() {
        assert_eq!(SbomConfig::default().format, FORMAT_CYCLONEDX_JSON);
    }
}
