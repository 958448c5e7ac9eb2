use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use crate::cache::{Cache, SBOM_TTL, SCAN_TTL, config_hash};
use crate::error::{DeployerError, Result};
use crate::exec::CommandRunner;
use crate::image::ImageRef;
use crate::tools::{ToolInstaller, ToolRegistry};

pub mod sarif;
pub mod sbom;
pub mod scan;
pub mod sign;
pub mod upload;

pub use sbom::{SbomConfig, SbomResult};
pub use scan::{ScanResult, ScannerKind, Severity, Vulnerability};
pub use sign::{SignConfig, SignatureResult};
pub use upload::UploadConfig;

const DEFAULT_SCAN_TIMEOUT_SECS: u64 = 300;

/// Image scanning settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub required: bool,
    #[serde(default = "default_scanners")]
    pub tools: Vec<ScannerKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fail_on: Option<Severity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_local: Option<PathBuf>,
    #[serde(default = "default_scan_timeout")]
    pub timeout_secs: u64,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            required: false,
            tools: default_scanners(),
            fail_on: None,
            output_local: None,
            timeout_secs: default_scan_timeout(),
        }
    }
}

fn default_scanners() -> Vec<ScannerKind> {
    vec![ScannerKind::Grype]
}

fn default_scan_timeout() -> u64 {
    DEFAULT_SCAN_TIMEOUT_SECS
}

/// SBOM-as-attestation settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttestConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub required: bool,
}

/// Full security workflow configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityConfig {
    #[serde(default)]
    pub scan: ScanConfig,
    #[serde(default)]
    pub sign: SignConfig,
    #[serde(default)]
    pub sbom: SbomConfig,
    #[serde(default)]
    pub attest: AttestConfig,
    #[serde(default)]
    pub upload: UploadConfig,
}

impl SecurityConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = fs::read_to_string(path)?;
        serde_yaml_bw::from_str(&bytes).map_err(|source| DeployerError::ConfigParse {
            path: path.to_path_buf(),
            source,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepOutcome {
    Succeeded,
    Skipped,
    Warned,
    Failed,
}

/// One timed entry of the workflow summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepRecord {
    pub step: String,
    pub outcome: StepOutcome,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Structured record of what ran, how long it took, and how it ended.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowSummary {
    pub image: String,
    pub started_at: DateTime<Utc>,
    pub steps: Vec<StepRecord>,
}

impl WorkflowSummary {
    fn new(image: &ImageRef) -> Self {
        Self {
            image: image.to_string(),
            started_at: Utc::now(),
            steps: Vec::new(),
        }
    }

    fn record(&mut self, step: &str, outcome: StepOutcome, started: Instant, detail: Option<String>) {
        self.steps.push(StepRecord {
            step: step.to_string(),
            outcome,
            duration_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            detail,
        });
    }

    fn record_skipped(&mut self, step: &str, detail: &str) {
        self.steps.push(StepRecord {
            step: step.to_string(),
            outcome: StepOutcome::Skipped,
            duration_ms: 0,
            detail: Some(detail.to_string()),
        });
    }

    pub fn outcome_of(&self, step: &str) -> Option<StepOutcome> {
        self.steps
            .iter()
            .find(|record| record.step == step)
            .map(|record| record.outcome)
    }
}

/// Runs the image hardening workflow: scan, sign, SBOM, attest, upload, in
/// that order. Scan goes first so policy violations fail fast; every other
/// step honors its `required` flag, and report uploads only ever warn.
pub struct SecurityExecutor<'a> {
    tools: &'a ToolRegistry,
    runner: &'a dyn CommandRunner,
    cache: &'a Cache,
    config: &'a SecurityConfig,
}

impl<'a> SecurityExecutor<'a> {
    pub fn new(
        tools: &'a ToolRegistry,
        runner: &'a dyn CommandRunner,
        cache: &'a Cache,
        config: &'a SecurityConfig,
    ) -> Self {
        Self {
            tools,
            runner,
            cache,
            config,
        }
    }

    pub async fn execute(&self, image: &ImageRef) -> Result<WorkflowSummary> {
        let mut summary = WorkflowSummary::new(image);
        let installer = ToolInstaller::new(self.tools, self.runner);

        let scan_result = self.scan_step(image, &installer, &mut summary).await?;
        let signed = self.sign_step(image, &installer, &mut summary).await?;
        let sbom_result = self.sbom_step(image, &installer, &mut summary).await?;
        self.attest_step(image, &installer, signed, sbom_result.as_ref(), &mut summary)
            .await?;
        self.upload_step(image, scan_result.as_ref(), &mut summary)
            .await;

        info!(image = %image, steps = summary.steps.len(), "security workflow finished");
        Ok(summary)
    }

    /// Aborts on a non-demotable error (policy violation, cancellation) or
    /// when the step is required; records a warning otherwise.
    fn settle<T>(
        &self,
        step: &str,
        required: bool,
        outcome: Result<T>,
        started: Instant,
        summary: &mut WorkflowSummary,
    ) -> Result<Option<T>> {
        match outcome {
            Ok(value) => {
                summary.record(step, StepOutcome::Succeeded, started, None);
                Ok(Some(value))
            }
            Err(err) if !err.demotable() || required => {
                summary.record(step, StepOutcome::Failed, started, Some(err.to_string()));
                Err(err)
            }
            Err(err) => {
                warn!(step, error = %err, "step failed; continuing (not required)");
                summary.record(step, StepOutcome::Warned, started, Some(err.to_string()));
                Ok(None)
            }
        }
    }

    async fn scan_step(
        &self,
        image: &ImageRef,
        installer: &ToolInstaller<'_>,
        summary: &mut WorkflowSummary,
    ) -> Result<Option<ScanResult>> {
        if !self.config.scan.enabled {
            summary.record_skipped("scan", "disabled");
            return Ok(None);
        }
        let started = Instant::now();
        let outcome = self.run_scan(image, installer).await;
        self.settle("scan", self.config.scan.required, outcome, started, summary)
    }

    async fn run_scan(
        &self,
        image: &ImageRef,
        installer: &ToolInstaller<'_>,
    ) -> Result<ScanResult> {
        let config = &self.config.scan;
        let hash = config_hash(config)?;

        let merged = match self.cache.get("scan", &image.cache_identity(), &hash)? {
            Some(cached) => serde_json::from_value(cached)?,
            None => {
                let timeout = Duration::from_secs(config.timeout_secs);
                let mut results = Vec::new();
                // Scanners run sequentially so their summaries compose
                // deterministically.
                for kind in &config.tools {
                    results.push(
                        scan::run_scanner(*kind, image, installer, self.runner, timeout).await?,
                    );
                }
                let merged = scan::merge_results(&results).ok_or_else(|| {
                    DeployerError::ScanFailed("no scanners configured".to_string())
                })?;
                self.cache.put(
                    "scan",
                    &image.cache_identity(),
                    &hash,
                    &serde_json::to_value(&merged)?,
                    SCAN_TTL,
                )?;
                merged
            }
        };

        if let Some(path) = &config.output_local {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(path, serde_json::to_vec_pretty(&merged)?)?;
        }

        scan::enforce_fail_on(&merged, config.fail_on)?;
        Ok(merged)
    }

    async fn sign_step(
        &self,
        image: &ImageRef,
        installer: &ToolInstaller<'_>,
        summary: &mut WorkflowSummary,
    ) -> Result<bool> {
        if !self.config.sign.enabled {
            summary.record_skipped("sign", "disabled");
            return Ok(false);
        }
        let started = Instant::now();
        let outcome = sign::sign_image(&self.config.sign, image, installer, self.runner).await;
        Ok(self
            .settle("sign", self.config.sign.required, outcome, started, summary)?
            .is_some())
    }

    async fn sbom_step(
        &self,
        image: &ImageRef,
        installer: &ToolInstaller<'_>,
        summary: &mut WorkflowSummary,
    ) -> Result<Option<SbomResult>> {
        if !self.config.sbom.enabled {
            summary.record_skipped("sbom", "disabled");
            return Ok(None);
        }
        let started = Instant::now();
        let outcome = self.run_sbom(image, installer).await;
        self.settle("sbom", self.config.sbom.required, outcome, started, summary)
    }

    async fn run_sbom(
        &self,
        image: &ImageRef,
        installer: &ToolInstaller<'_>,
    ) -> Result<SbomResult> {
        let config = &self.config.sbom;
        let hash = config_hash(config)?;

        if let Some(cached) = self.cache.get("sbom", &image.cache_identity(), &hash)? {
            if let Some(result) = decode_cached_sbom(&cached) {
                return Ok(result);
            }
        }

        let result = sbom::generate_sbom(config, image, installer, self.runner).await?;
        self.cache.put(
            "sbom",
            &image.cache_identity(),
            &hash,
            &json!({
                "format": result.format,
                "tool": result.tool,
                "version": result.version,
                "packageCount": result.package_count,
                "content": BASE64.encode(&result.bytes),
            }),
            SBOM_TTL,
        )?;
        Ok(result)
    }

    async fn attest_step(
        &self,
        image: &ImageRef,
        installer: &ToolInstaller<'_>,
        signed: bool,
        sbom_result: Option<&SbomResult>,
        summary: &mut WorkflowSummary,
    ) -> Result<()> {
        if !self.config.attest.enabled {
            summary.record_skipped("attest", "disabled");
            return Ok(());
        }
        // An attestation is a signed predicate; without signing there is
        // nothing to sign it with.
        if !self.config.sign.enabled || !signed {
            summary.record_skipped("attest", "signing disabled or failed");
            return Ok(());
        }
        let Some(sbom_result) = sbom_result else {
            summary.record_skipped("attest", "no SBOM to attach");
            return Ok(());
        };

        let started = Instant::now();
        let outcome = sign::attest_image(
            &self.config.sign,
            image,
            sbom::PREDICATE_CYCLONEDX,
            sbom_result.bytes.clone(),
            installer,
            self.runner,
        )
        .await;
        self.settle(
            "attest",
            self.config.attest.required,
            outcome,
            started,
            summary,
        )?;
        Ok(())
    }

    async fn upload_step(
        &self,
        image: &ImageRef,
        scan_result: Option<&ScanResult>,
        summary: &mut WorkflowSummary,
    ) {
        if !self.config.upload.enabled {
            summary.record_skipped("upload", "disabled");
            return;
        }
        let Some(scan_result) = scan_result else {
            summary.record_skipped("upload", "no scan result to report");
            return;
        };

        let started = Instant::now();
        let failures = upload::upload_reports(&self.config.upload, scan_result, image).await;
        if failures.is_empty() {
            summary.record("upload", StepOutcome::Succeeded, started, None);
        } else {
            for (target, err) in &failures {
                warn!(target, error = %err, "report upload failed; continuing");
            }
            let detail = failures
                .iter()
                .map(|(target, err)| format!("{target}: {err}"))
                .collect::<Vec<_>>()
                .join("; ");
            summary.record("upload", StepOutcome::Warned, started, Some(detail));
        }
    }
}

fn decode_cached_sbom(cached: &serde_json::Value) -> Option<SbomResult> {
    let content = cached.get("content")?.as_str()?;
    let bytes = BASE64.decode(content).ok()?;
    Some(SbomResult {
        format: cached.get("format")?.as_str()?.to_string(),
        bytes,
        tool: cached.get("tool")?.as_str()?.to_string(),
        version: cached.get("version")?.as_str()?.to_string(),
        package_count: cached.get("packageCount")?.as_u64()? as usize,
    })
}
