use serde_json::{Value as JsonValue, json};

use super::scan::{ScanResult, Severity};

const SARIF_VERSION: &str = "2.1.0";
const SARIF_SCHEMA: &str =
    "https://raw.githubusercontent.com/oasis-tcs/sarif-spec/master/Schemata/sarif-schema-2.1.0.json";

/// SARIF level strings: critical/high map to "error", medium to "warning",
/// low to "note".
fn level_for(severity: Severity) -> &'static str {
    match severity {
        Severity::Critical | Severity::High => "error",
        Severity::Medium => "warning",
        Severity::Low | Severity::None => "note",
    }
}

/// Converts a canonical scan result into a SARIF 2.1.0 document.
pub fn to_sarif(result: &ScanResult) -> JsonValue {
    let rules: Vec<JsonValue> = result
        .vulnerabilities
        .iter()
        .map(|vulnerability| {
            json!({
                "id": vulnerability.id,
                "name": vulnerability.id,
                "shortDescription": {
                    "text": vulnerability
                        .description
                        .as_deref()
                        .unwrap_or(vulnerability.id.as_str()),
                },
                "helpUri": vulnerability.urls.first(),
                "properties": {
                    "security-severity": vulnerability.severity.as_str(),
                },
            })
        })
        .collect();

    let results: Vec<JsonValue> = result
        .vulnerabilities
        .iter()
        .map(|vulnerability| {
            json!({
                "ruleId": vulnerability.id,
                "level": level_for(vulnerability.severity),
                "message": {
                    "text": format!(
                        "{} in {}@{}{}",
                        vulnerability.id,
                        vulnerability.package,
                        vulnerability.version,
                        vulnerability
                            .fixed_in
                            .as_deref()
                            .map(|fix| format!(" (fixed in {fix})"))
                            .unwrap_or_default()
                    ),
                },
                "locations": [{
                    "physicalLocation": {
                        "artifactLocation": {
                            "uri": format!("{}@{}", vulnerability.package, vulnerability.version),
                        },
                    },
                }],
            })
        })
        .collect();

    json!({
        "$schema": SARIF_SCHEMA,
        "version": SARIF_VERSION,
        "runs": [{
            "tool": {
                "driver": {
                    "name": result.scanner,
                    "version": result.version,
                    "rules": rules,
                },
            },
            "properties": {
                "imageDigest": result.image_digest,
                "scannedAt": result.scanned_at,
            },
            "results": results,
        }],
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::scan::{ScanSummary, Vulnerability};
    use chrono::{DateTime, Utc};

    fn scan_with(severity: Severity) -> ScanResult {
        let vulnerabilities = vec![Vulnerability {
            id: "CVE-2024-0001".into(),
            severity,
            package: "openssl".into(),
            version: "1.2.3".into(),
            fixed_in: Some("1.2.4".into()),
            description: Some("overflow".into()),
            urls: vec!["https://nvd.example".into()],
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

    #[test]
    fn emits_sarif_2_1_0_envelope() {
        let sarif = to_sarif(&scan_with(Severity::High));
        assert_eq!(sarif["version"], "2.1.0");
        assert_eq!(sarif["runs"][0]["tool"]["driver"]["name"], "grype");
        assert_eq!(sarif["runs"][0]["results"][0]["ruleId"], "CVE-2024-0001");
    }

    #[test]
    fn severity_levels_follow_the_mapping() {
        assert_eq!(
            to_sarif(&scan_with(Severity::Critical))["runs"][0]["results"][0]["level"],
            "error"
        );
        assert_eq!(
            to_sarif(&scan_with(Severity::High))["runs"][0]["results"][0]["level"],
            "error"
        );
        assert_eq!(
            to_sarif(&scan_with(Severity::Medium))["runs"][0]["results"][0]["level"],
            "warning"
        );
        assert_eq!(
            to_sarif(&scan_with(Severity::Low))["runs"][0]["results"][0]["level"],
            "note"
        );
    }

    #[test]
    fn message_mentions_fix_version() {
        let sarif = to_sarif(&scan_with(Severity::High));
        let text = sarif["runs"][0]["results"][0]["message"]["text"]
            .as_str()
            .expect("message text");
        assert!(text.contains("fixed in 1.2.4"));
    }
}
