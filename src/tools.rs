use std::collections::BTreeMap;
use std::time::Duration;

use once_cell::sync::Lazy;
use semver::Version;
use tracing::debug;

use crate::error::{DeployerError, Result};
use crate::exec::{CommandRunner, CommandSpec};

/// Deadline for `<tool> version` probes.
pub const VERSION_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Description of one external binary the deployer shells out to.
#[derive(Debug, Clone)]
pub struct ToolSpec {
    pub name: String,
    pub command: String,
    /// Minimum acceptable version; `None` means presence is enough.
    pub min_version: Option<Version>,
    pub install_url: String,
}

/// Registry of known external binaries keyed by logical name.
#[derive(Debug, Clone, Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, ToolSpec>,
}

static BUILTIN_TOOLS: Lazy<Vec<ToolSpec>> = Lazy::new(|| {
    vec![
        ToolSpec {
            name: "cosign".into(),
            command: "cosign".into(),
            min_version: Some(Version::new(3, 0, 2)),
            install_url: "https://docs.sigstore.dev/cosign/system_config/installation/".into(),
        },
        ToolSpec {
            name: "syft".into(),
            command: "syft".into(),
            min_version: Some(Version::new(1, 41, 0)),
            install_url: "https://github.com/anchore/syft#installation".into(),
        },
        ToolSpec {
            name: "grype".into(),
            command: "grype".into(),
            min_version: Some(Version::new(0, 106, 0)),
            install_url: "https://github.com/anchore/grype#installation".into(),
        },
        ToolSpec {
            name: "trivy".into(),
            command: "trivy".into(),
            min_version: Some(Version::parse("0.68.2").expect("static version")),
            install_url: "https://trivy.dev/latest/getting-started/installation/".into(),
        },
        ToolSpec {
            name: "docker".into(),
            command: "docker".into(),
            min_version: None,
            install_url: "https://docs.docker.com/engine/install/".into(),
        },
        ToolSpec {
            name: "git".into(),
            command: "git".into(),
            min_version: None,
            install_url: "https://git-scm.com/downloads".into(),
        },
    ]
});

impl ToolRegistry {
    pub fn builtin() -> Self {
        let mut registry = Self::default();
        for spec in BUILTIN_TOOLS.iter() {
            registry.register(spec.clone());
        }
        registry
    }

    pub fn register(&mut self, spec: ToolSpec) {
        self.tools.insert(spec.name.clone(), spec);
    }

    pub fn get(&self, name: &str) -> Result<&ToolSpec> {
        self.tools
            .get(name)
            .ok_or_else(|| DeployerError::Config(format!("no tool registered under '{name}'")))
    }
}

/// Result of a successful installation probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstalledTool {
    pub name: String,
    pub version: Option<Version>,
}

/// Verifies presence and minimum version of registered tools.
pub struct ToolInstaller<'a> {
    registry: &'a ToolRegistry,
    runner: &'a dyn CommandRunner,
}

impl<'a> ToolInstaller<'a> {
    pub fn new(registry: &'a ToolRegistry, runner: &'a dyn CommandRunner) -> Self {
        Self { registry, runner }
    }

    pub async fn check_installed(&self, name: &str) -> Result<InstalledTool> {
        let spec = self.registry.get(name)?;

        if which::which(&spec.command).is_err() {
            return Err(DeployerError::ToolMissing {
                tool: spec.name.clone(),
                install_url: spec.install_url.clone(),
            });
        }

        let probe = CommandSpec::new(&spec.command, &["version"], VERSION_PROBE_TIMEOUT);
        let output = self.runner.run(&probe).await?;
        if !output.success() {
            return Err(DeployerError::ToolMissing {
                tool: spec.name.clone(),
                install_url: spec.install_url.clone(),
            });
        }

        let found = parse_version_output(&output.stdout_utf8());
        debug!(tool = %spec.name, version = ?found, "probed tool version");

        if let Some(min) = &spec.min_version {
            let found = found.clone().ok_or_else(|| DeployerError::ToolMissing {
                tool: spec.name.clone(),
                install_url: spec.install_url.clone(),
            })?;
            if found < *min {
                return Err(DeployerError::ToolVersionTooOld {
                    tool: spec.name.clone(),
                    found: found.to_string(),
                    min_version: min.to_string(),
                    install_url: spec.install_url.clone(),
                });
            }
        }

        Ok(InstalledTool {
            name: spec.name.clone(),
            version: found,
        })
    }
}

/// Extract the first semver-looking token from a `<tool> version` banner.
pub fn parse_version_output(output: &str) -> Option<Version> {
    for token in output.split_whitespace() {
        let trimmed = token
            .trim_start_matches('v')
            .trim_end_matches(|c: char| c == ',' || c == ')' || c == '"');
        if let Ok(version) = Version::parse(trimmed) {
            return Some(version);
        }
    }
    None
}
