use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{DeployerError, Result};
use crate::exec::{CommandRunner, CommandSpec};
use crate::image::ImageRef;
use crate::tools::ToolInstaller;

/// Vulnerability severity, ordered so `critical > high > medium > low > none`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default, Hash,
)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    #[default]
    None,
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn parse(raw: &str) -> Self {
        match raw.to_ascii_lowercase().as_str() {
            "critical" => Severity::Critical,
            "high" => Severity::High,
            "medium" => Severity::Medium,
            "low" => Severity::Low,
            _ => Severity::None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Critical => "critical",
            Severity::High => "high",
            Severity::Medium => "medium",
            Severity::Low => "low",
            Severity::None => "none",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Vulnerability {
    pub id: String,
    pub severity: Severity,
    pub package: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fixed_in: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub urls: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanSummary {
    pub critical: usize,
    pub high: usize,
    pub medium: usize,
    pub low: usize,
    pub total: usize,
}

impl ScanSummary {
    pub fn from_vulnerabilities(vulnerabilities: &[Vulnerability]) -> Self {
        let mut summary = ScanSummary::default();
        for vulnerability in vulnerabilities {
            match vulnerability.severity {
                Severity::Critical => summary.critical += 1,
                Severity::High => summary.high += 1,
                Severity::Medium => summary.medium += 1,
                Severity::Low => summary.low += 1,
                Severity::None => {}
            }
            summary.total += 1;
        }
        summary
    }
}

/// Canonical scan result, independent of which scanner produced it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanResult {
    pub scanner: String,
    pub version: String,
    pub image_digest: String,
    pub vulnerabilities: Vec<Vulnerability>,
    pub summary: ScanSummary,
    pub scanned_at: DateTime<Utc>,
}

/// Supported scanners, in the stable order they run and merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScannerKind {
    Grype,
    Trivy,
}

impl ScannerKind {
    pub fn tool_name(&self) -> &'static str {
        match self {
            ScannerKind::Grype => "grype",
            ScannerKind::Trivy => "trivy",
        }
    }

    fn args(&self, image: &ImageRef) -> Vec<String> {
        match self {
            ScannerKind::Grype => vec![image.to_string(), "-o".into(), "json".into()],
            ScannerKind::Trivy => vec![
                "image".into(),
                "--format".into(),
                "json".into(),
                "--quiet".into(),
                image.to_string(),
            ],
        }
    }
}

/// Runs one scanner against the image and parses its JSON into the
/// canonical result.
pub async fn run_scanner(
    kind: ScannerKind,
    image: &ImageRef,
    installer: &ToolInstaller<'_>,
    runner: &dyn CommandRunner,
    timeout: Duration,
) -> Result<ScanResult> {
    let tool = installer.check_installed(kind.tool_name()).await?;

    let spec = CommandSpec {
        program: kind.tool_name().to_string(),
        args: kind.args(image),
        stdin: None,
        timeout,
    };
    let output = runner.run(&spec).await?;
    if !output.success() {
        return Err(DeployerError::ScanFailed(format!(
            "{} exited with {:?}: {}",
            kind.tool_name(),
            output.exit_code,
            output.stderr
        )));
    }

    let version = tool
        .version
        .map(|v| v.to_string())
        .unwrap_or_else(|| "unknown".into());
    let vulnerabilities = match kind {
        ScannerKind::Grype => parse_grype(&output.stdout)?,
        ScannerKind::Trivy => parse_trivy(&output.stdout)?,
    };
    let summary = ScanSummary::from_vulnerabilities(&vulnerabilities);
    debug!(scanner = kind.tool_name(), total = summary.total, "scan parsed");

    Ok(ScanResult {
        scanner: kind.tool_name().to_string(),
        version,
        image_digest: image.cache_identity(),
        vulnerabilities,
        summary,
        scanned_at: Utc::now(),
    })
}

#[derive(Debug, Deserialize)]
struct GrypeDocument {
    #[serde(default)]
    matches: Vec<GrypeMatch>,
}

#[derive(Debug, Deserialize)]
struct GrypeMatch {
    vulnerability: GrypeVulnerability,
    artifact: GrypeArtifact,
}

#[derive(Debug, Deserialize)]
struct GrypeVulnerability {
    id: String,
    #[serde(default)]
    severity: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    urls: Vec<String>,
    #[serde(default)]
    fix: GrypeFix,
}

#[derive(Debug, Default, Deserialize)]
struct GrypeFix {
    #[serde(default)]
    versions: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct GrypeArtifact {
    name: String,
    #[serde(default)]
    version: String,
}

fn parse_grype(stdout: &[u8]) -> Result<Vec<Vulnerability>> {
    let document: GrypeDocument = serde_json::from_slice(stdout)
        .map_err(|err| DeployerError::ScanFailed(format!("grype output is not valid: {err}")))?;
    Ok(document
        .matches
        .into_iter()
        .map(|entry| Vulnerability {
            id: entry.vulnerability.id,
            severity: Severity::parse(&entry.vulnerability.severity),
            package: entry.artifact.name,
            version: entry.artifact.version,
            fixed_in: entry.vulnerability.fix.versions.first().cloned(),
            description: entry.vulnerability.description,
            urls: entry.vulnerability.urls,
        })
        .collect())
}

#[derive(Debug, Deserialize)]
struct TrivyDocument {
    #[serde(default, rename = "Results")]
    results: Vec<TrivyResult>,
}

#[derive(Debug, Deserialize)]
struct TrivyResult {
    #[serde(default, rename = "Vulnerabilities")]
    vulnerabilities: Vec<TrivyVulnerability>,
}

#[derive(Debug, Deserialize)]
struct TrivyVulnerability {
    #[serde(rename = "VulnerabilityID")]
    id: String,
    #[serde(default, rename = "PkgName")]
    package: String,
    #[serde(default, rename = "InstalledVersion")]
    version: String,
    #[serde(default, rename = "FixedVersion")]
    fixed_version: Option<String>,
    #[serde(default, rename = "Severity")]
    severity: String,
    #[serde(default, rename = "Description")]
    description: Option<String>,
    #[serde(default, rename = "References")]
    references: Vec<String>,
}

fn parse_trivy(stdout: &[u8]) -> Result<Vec<Vulnerability>> {
    let document: TrivyDocument = serde_json::from_slice(stdout)
        .map_err(|err| DeployerError::ScanFailed(format!("trivy output is not valid: {err}")))?;
    Ok(document
        .results
        .into_iter()
        .flat_map(|result| result.vulnerabilities)
        .map(|entry| Vulnerability {
            id: entry.id,
            severity: Severity::parse(&entry.severity),
            package: entry.package,
            version: entry.version,
            fixed_in: entry.fixed_version,
            description: entry.description,
            urls: entry.references,
        })
        .collect())
}

/// Merges results from multiple scanners deterministically: vulnerabilities
/// are sorted by `(id, package, version)` before deduplication and the
/// maximum severity wins for duplicates, so the merged summary does not
/// depend on scanner order.
pub fn merge_results(results: &[ScanResult]) -> Option<ScanResult> {
    let first = results.first()?;
    let mut vulnerabilities: Vec<Vulnerability> = results
        .iter()
        .flat_map(|result| result.vulnerabilities.iter().cloned())
        .collect();
    vulnerabilities.sort_by(|a, b| {
        (&a.id, &a.package, &a.version).cmp(&(&b.id, &b.package, &b.version))
    });

    let mut merged: Vec<Vulnerability> = Vec::with_capacity(vulnerabilities.len());
    for vulnerability in vulnerabilities {
        match merged.last_mut() {
            Some(last)
                if last.id == vulnerability.id
                    && last.package == vulnerability.package
                    && last.version == vulnerability.version =>
            {
                if vulnerability.severity > last.severity {
                    last.severity = vulnerability.severity;
                }
                for url in vulnerability.urls {
                    if !last.urls.contains(&url) {
                        last.urls.push(url);
                    }
                }
                if last.fixed_in.is_none() {
                    last.fixed_in = vulnerability.fixed_in;
                }
                if last.description.is_none() {
                    last.description = vulnerability.description;
                }
            }
            _ => merged.push(vulnerability),
        }
    }

    let mut scanners: Vec<&str> = results.iter().map(|r| r.scanner.as_str()).collect();
    scanners.sort_unstable();
    scanners.dedup();

    let summary = ScanSummary::from_vulnerabilities(&merged);
    Some(ScanResult {
        scanner: scanners.join("+"),
        version: first.version.clone(),
        image_digest: first.image_digest.clone(),
        vulnerabilities: merged,
        summary,
        scanned_at: first.scanned_at,
    })
}

/// Applies the fail-on policy; a hit is always fatal.
pub fn enforce_fail_on(result: &ScanResult, fail_on: Option<Severity>) -> Result<()> {
    let Some(threshold) = fail_on else {
        return Ok(());
    };
    if threshold == Severity::None {
        warn!("failOn=none never triggers; skipping policy check");
        return Ok(());
    }
    let count = result
        .vulnerabilities
        .iter()
        .filter(|v| v.severity >= threshold)
        .count();
    if count > 0 {
        return Err(DeployerError::PolicyViolation {
            fail_on: threshold.as_str().to_string(),
            count,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vuln(id: &str, severity: Severity, package: &str) -> Vulnerability {
        Vulnerability {
            id: id.into(),
            severity,
            package: package.into(),
            version: "1.0.0".into(),
            fixed_in: None,
            description: None,
            urls: Vec::new(),
        }
    }

    fn result(scanner: &str, vulnerabilities: Vec<Vulnerability>) -> ScanResult {
        let summary = ScanSummary::from_vulnerabilities(&vulnerabilities);
        ScanResult {
            scanner: scanner.into(),
            version: "1.0.0".into(),
            image_digest: "sha256:abc".into(),
            vulnerabilities,
            summary,
            scanned_at: DateTime::<Utc>::MIN_UTC,
        }
    }

    #[test]
    fn severity_ordering_matches_policy() {
        assert!(Severity::Critical > Severity::High);
        assert!(Severity::High > Severity::Medium);
        assert!(Severity::Medium > Severity::Low);
        assert!(Severity::Low > Severity::None);
    }

    #[test]
    fn parses_grype_output() {
        let payload = serde_json::json!({
            "matches": [{
                "vulnerability": {
                    "id": "CVE-2024-0001",
                    "severity": "High",
                    "description": "buffer overflow",
                    "urls": ["https://nvd.example/CVE-2024-0001"],
                    "fix": {"versions": ["1.2.4"]},
                },
                "artifact": {"name": "openssl", "version": "1.2.3"},
            }]
        });
        let vulnerabilities =
            parse_grype(payload.to_string().as_bytes()).expect("grype output parses");
        assert_eq!(vulnerabilities.len(), 1);
        assert_eq!(vulnerabilities[0].id, "CVE-2024-0001");
        assert_eq!(vulnerabilities[0].severity, Severity::High);
        assert_eq!(vulnerabilities[0].fixed_in.as_deref(), Some("1.2.4"));
    }

    #[test]
    fn parses_trivy_output() {
        let payload = serde_json::json!({
            "Results": [{
                "Vulnerabilities": [{
                    "VulnerabilityID": "CVE-2024-0002",
                    "PkgName": "zlib",
                    "InstalledVersion": "1.3",
                    "FixedVersion": "1.3.1",
                    "Severity": "CRITICAL",
                    "References": [],
                }]
            }]
        });
        let vulnerabilities =
            parse_trivy(payload.to_string().as_bytes()).expect("trivy output parses");
        assert_eq!(vulnerabilities.len(), 1);
        assert_eq!(vulnerabilities[0].severity, Severity::Critical);
        assert_eq!(vulnerabilities[0].package, "zlib");
    }

    #[test]
    fn merge_is_commutative_on_summaries() {
        let a = result(
            "grype",
            vec![
                vuln("CVE-1", Severity::High, "openssl"),
                vuln("CVE-2", Severity::Low, "zlib"),
            ],
        );
        let b = result(
            "trivy",
            vec![
                vuln("CVE-1", Severity::Critical, "openssl"),
                vuln("CVE-3", Severity::Medium, "curl"),
            ],
        );

        let ab = merge_results(&[a.clone(), b.clone()]).expect("merge");
        let ba = merge_results(&[b, a]).expect("merge");
        assert_eq!(ab.summary, ba.summary);
        assert_eq!(ab.vulnerabilities.len(), 3);
        // Max severity wins for the shared finding.
        let shared = ab
            .vulnerabilities
            .iter()
            .find(|v| v.id == "CVE-1")
            .expect("shared finding");
        assert_eq!(shared.severity, Severity::Critical);
    }

    #[test]
    fn fail_on_critical_lets_high_pass() {
        let result = result("grype", vec![vuln("CVE-1", Severity::High, "openssl")]);
        enforce_fail_on(&result, Some(Severity::Critical)).expect("high passes");
        let err = enforce_fail_on(&result, Some(Severity::High)).expect_err("high trips");
        match err {
            DeployerError::PolicyViolation { fail_on, count } => {
                assert_eq!(fail_on, "high");
                assert_eq!(count, 1);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn policy_violation_is_never_demotable() {
        let result = result("grype", vec![vuln("CVE-1", Severity::Critical, "openssl")]);
        let err = enforce_fail_on(&result, Some(Severity::Critical)).expect_err("trips");
        assert!(!err.demotable());
    }
}
