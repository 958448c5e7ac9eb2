use std::env;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{DeployerError, Result};
use crate::exec::{CommandRunner, CommandSpec};
use crate::image::ImageRef;
use crate::tools::ToolInstaller;

/// Deadline for cosign sign/attest invocations.
pub const SIGN_TIMEOUT: Duration = Duration::from_secs(120);

/// Environment variable carrying the OIDC token for keyless signing.
pub const ENV_SIGSTORE_ID_TOKEN: &str = "SIGSTORE_ID_TOKEN";

/// Signing settings: keyless by default, key-based when a key path is set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_path: Option<PathBuf>,
}

/// Signature digest plus the transparency-log entry when cosign reports one.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignatureResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature_digest: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tlog_index: Option<u64>,
}

/// Signs the image with cosign, keyless (OIDC token from the execution
/// context) or key-based.
pub async fn sign_image(
    config: &SignConfig,
    image: &ImageRef,
    installer: &ToolInstaller<'_>,
    runner: &dyn CommandRunner,
) -> Result<SignatureResult> {
    installer.check_installed("cosign").await?;

    let mut args: Vec<String> = vec!["sign".into(), "--yes".into()];
    match &config.key_path {
        Some(key_path) => {
            args.push("--key".into());
            args.push(key_path.display().to_string());
        }
        None => {
            let token = env::var(ENV_SIGSTORE_ID_TOKEN).map_err(|_| {
                DeployerError::SignFailed(format!(
                    "keyless signing needs {ENV_SIGSTORE_ID_TOKEN} in the environment"
                ))
            })?;
            args.push("--identity-token".into());
            args.push(token);
        }
    }
    args.push(image.to_string());

    let spec = CommandSpec {
        program: "cosign".into(),
        args,
        stdin: None,
        timeout: SIGN_TIMEOUT,
    };
    let output = runner.run(&spec).await?;
    if !output.success() {
        return Err(DeployerError::SignFailed(format!(
            "cosign sign exited with {:?}: {}",
            output.exit_code, output.stderr
        )));
    }

    let result = parse_sign_output(&output.stdout_utf8(), &output.stderr);
    debug!(image = %image, tlog = ?result.tlog_index, "image signed");
    Ok(result)
}

/// Attaches a predicate (e.g. an SBOM) as a signed attestation.
pub async fn attest_image(
    config: &SignConfig,
    image: &ImageRef,
    predicate_type: &str,
    predicate: Vec<u8>,
    installer: &ToolInstaller<'_>,
    runner: &dyn CommandRunner,
) -> Result<()> {
    installer.check_installed("cosign").await?;

    let mut args: Vec<String> = vec![
        "attest".into(),
        "--yes".into(),
        "--type".into(),
        predicate_type.into(),
        "--predicate".into(),
        "-".into(),
    ];
    if let Some(key_path) = &config.key_path {
        args.push("--key".into());
        args.push(key_path.display().to_string());
    }
    args.push(image.to_string());

    let spec = CommandSpec {
        program: "cosign".into(),
        args,
        stdin: Some(predicate),
        timeout: SIGN_TIMEOUT,
    };
    let output = runner.run(&spec).await?;
    if !output.success() {
        return Err(DeployerError::AttachFailed(format!(
            "cosign attest exited with {:?}: {}",
            output.exit_code, output.stderr
        )));
    }
    Ok(())
}

/// cosign prints the tlog index and pushed signature digest on different
/// lines depending on version; scan both streams leniently.
fn parse_sign_output(stdout: &str, stderr: &str) -> SignatureResult {
    let mut result = SignatureResult::default();
    for line in stdout.lines().chain(stderr.lines()) {
        if let Some(rest) = line.split("tlog entry created with index:").nth(1) {
            result.tlog_index = rest.trim().parse().ok();
        }
        if let Some(pos) = line.find("sha256:") {
            if result.signature_digest.is_none() {
                let digest: String = line[pos..]
                    .chars()
                    .take_while(|c| c.is_ascii_alphanumeric() || *c == ':')
                    .collect();
                result.signature_digest = Some(digest);
            }
        }
    }
    result
}
