use std::io;
use std::path::PathBuf;

use thiserror::Error;

pub(crate) fn join_lines(items: &[String]) -> String {
    items.join("; ")
}

pub(crate) fn join_errors(errors: &[DeployerError]) -> String {
    errors
        .iter()
        .map(|err| err.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Debug, Error)]
pub enum DeployerError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("failed to parse {}: {source}", .path.display())]
    ConfigParse {
        path: PathBuf,
        #[source]
        source: serde_yaml_bw::Error,
    },

    #[error("unknown kind '{kind}' at {site}")]
    UnknownKind { kind: String, site: String },

    #[error("failed to materialize kind '{kind}' at {site}: {source}")]
    MaterializeFailed {
        kind: String,
        site: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid inheritance at {site}: {reason}")]
    InheritanceInvalid { site: String, reason: String },

    #[error("stack '{stack}' references unknown template '{template}'")]
    UnknownTemplate { stack: String, template: String },

    #[error("unknown stack '{0}'")]
    UnknownStack(String),

    #[error("secret '{name}' cannot be resolved from reference '{reference}'")]
    SecretNotFound { name: String, reference: String },

    #[error("secrets not accessible for stack '{stack}': {}", join_lines(.names))]
    SecretsInaccessible { stack: String, names: Vec<String> },

    #[error("invalid secrets mode: {0}")]
    InvalidMode(String),

    #[error("{}: {}", .path.display(), join_errors(.errors))]
    Document {
        path: PathBuf,
        errors: Vec<DeployerError>,
    },

    #[error("tool '{tool}' not found on PATH; install it from {install_url}")]
    ToolMissing { tool: String, install_url: String },

    #[error(
        "tool '{tool}' version {found} is older than required {min_version}; upgrade via {install_url}"
    )]
    ToolVersionTooOld {
        tool: String,
        found: String,
        min_version: String,
        install_url: String,
    },

    #[error("scan policy violation: {count} vulnerabilities at or above '{fail_on}' severity")]
    PolicyViolation { fail_on: String, count: usize },

    #[error("image scan failed: {0}")]
    ScanFailed(String),

    #[error("image signing failed: {0}")]
    SignFailed(String),

    #[error("SBOM generation failed: {0}")]
    SbomFailed(String),

    #[error("attestation attach failed: {0}")]
    AttachFailed(String),

    #[error("report upload failed: {0}")]
    UploadFailed(String),

    #[error("operation '{0}' was cancelled")]
    Cancelled(String),

    #[error("compose project declares more than one ingress service: {}", join_lines(.services))]
    AmbiguousIngress { services: Vec<String> },

    #[error("path '{}' escapes the stack directory '{}'", .path.display(), .root.display())]
    PathEscape { root: PathBuf, path: PathBuf },

    #[error("invalid image reference '{reference}': {reason}")]
    InvalidImageRef { reference: String, reason: String },

    #[error("provisioner error: {0}")]
    Provisioner(String),

    #[error("alert delivery error: {0}")]
    Alert(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected error: {0}")]
    Other(String),
}

impl DeployerError {
    /// Whether a failure of a non-required workflow step may be demoted to
    /// a warning. Policy violations and cancellations are always surfaced.
    pub fn demotable(&self) -> bool {
        !matches!(
            self,
            DeployerError::PolicyViolation { .. } | DeployerError::Cancelled(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, DeployerError>;
