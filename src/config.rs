use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::{Deserialize, Serialize};

use crate::error::{DeployerError, Result};

/// Directory under the working directory holding profile config and stacks.
pub const SC_DIR: &str = ".sc";
/// Default stacks directory inside [`SC_DIR`].
pub const STACKS_DIR: &str = "stacks";

/// Inline alternative to reading `cfg.<profile>.yaml`.
pub const ENV_CONFIG: &str = "SIMPLE_CONTAINER_CONFIG";
/// Context injected into deployed workloads.
pub const ENV_RESOURCE_TYPE: &str = "SIMPLE_CONTAINER_RESOURCE_TYPE";
pub const ENV_STACK: &str = "SIMPLE_CONTAINER_STACK";
pub const ENV_ENVIRONMENT: &str = "SIMPLE_CONTAINER_ENV";
pub const ENV_VERSION: &str = "SIMPLE_CONTAINER_VERSION";

/// Output format for CLI rendering.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
    Yaml,
}

#[derive(Debug, Args)]
pub struct StackArgs {
    /// Stack to operate on (defaults to $SIMPLE_CONTAINER_STACK).
    #[arg(long, env = ENV_STACK)]
    pub stack: String,

    /// Environment to operate on (defaults to $SIMPLE_CONTAINER_ENV).
    #[arg(long = "env", env = ENV_ENVIRONMENT)]
    pub environment: String,

    /// Profile selecting cfg.<profile>.yaml under .sc/.
    #[arg(long, default_value = "default")]
    pub profile: String,

    /// Working directory containing the .sc/ tree.
    #[arg(long, default_value = ".")]
    pub workdir: PathBuf,

    /// Version recorded on the deployment (defaults to $SIMPLE_CONTAINER_VERSION).
    #[arg(long, env = ENV_VERSION)]
    pub version: Option<String>,

    /// Compute everything but do not call the provisioner.
    #[arg(long, default_value_t = false)]
    pub preview: bool,

    /// Output format for rendering (text|json|yaml).
    #[arg(long, value_enum, default_value = "text")]
    pub output: OutputFormat,
}

#[derive(Debug, Args)]
pub struct SecureArgs {
    /// Image reference to run the security workflow against.
    #[arg(long)]
    pub image: String,

    /// Path to the security workflow config (YAML).
    #[arg(long)]
    pub config: PathBuf,

    /// Working directory used for caches and report output.
    #[arg(long, default_value = ".")]
    pub workdir: PathBuf,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Provision the shared infrastructure of a stack.
    Provision(StackArgs),
    /// Prepare and deploy a client stack into an environment.
    Deploy(StackArgs),
    /// Validate descriptors, inheritance, and secret access without deploying.
    Validate(StackArgs),
    /// Run the image security workflow (scan, sign, SBOM, attest, upload).
    Secure(SecureArgs),
}

/// Top-level CLI structure.
#[derive(Debug, Parser)]
#[command(
    name = "sc-deployer",
    version,
    about = "Declarative multi-cloud stack deployer.",
    long_about = "Reconciles stack descriptors under <workdir>/.sc/stacks into live infrastructure, \
then builds, hardens, and deploys container images onto it."
)]
pub struct CliArgs {
    #[command(subcommand)]
    pub command: Command,
}

/// Profile-level configuration from `<workdir>/.sc/cfg.<profile>.yaml` or
/// the `SIMPLE_CONTAINER_CONFIG` environment variable.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileConfig {
    pub project_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key_password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stacks_dir: Option<PathBuf>,
}

impl ProfileConfig {
    /// Loads the profile config, preferring the inline environment variable
    /// over the on-disk file.
    pub fn load(workdir: &Path, profile: &str) -> Result<Self> {
        if let Ok(inline) = env::var(ENV_CONFIG) {
            let config: ProfileConfig =
                serde_yaml_bw::from_str(&inline).map_err(|source| DeployerError::ConfigParse {
                    path: PathBuf::from(format!("${ENV_CONFIG}")),
                    source,
                })?;
            config.validate()?;
            return Ok(config);
        }

        let path = workdir.join(SC_DIR).join(format!("cfg.{profile}.yaml"));
        let bytes = fs::read_to_string(&path).map_err(|err| {
            DeployerError::Config(format!(
                "profile config {} is not readable: {err}",
                path.display()
            ))
        })?;
        let config: ProfileConfig =
            serde_yaml_bw::from_str(&bytes).map_err(|source| DeployerError::ConfigParse {
                path: path.clone(),
                source,
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Either the path form or the inline form of a key may be set, never
    /// both of a pair.
    pub fn validate(&self) -> Result<()> {
        if self.private_key_path.is_some() && self.private_key.is_some() {
            return Err(DeployerError::Config(
                "privateKeyPath and privateKey are mutually exclusive".into(),
            ));
        }
        if self.public_key_path.is_some() && self.public_key.is_some() {
            return Err(DeployerError::Config(
                "publicKeyPath and publicKey are mutually exclusive".into(),
            ));
        }
        Ok(())
    }

    /// Directory that holds one subdirectory per stack.
    pub fn stacks_dir(&self, workdir: &Path) -> PathBuf {
        match &self.stacks_dir {
            Some(dir) if dir.is_absolute() => dir.clone(),
            Some(dir) => workdir.join(dir),
            None => workdir.join(SC_DIR).join(STACKS_DIR),
        }
    }

    /// Reads the public key, from inline material or from disk.
    pub fn public_key_material(&self) -> Result<Option<String>> {
        if let Some(inline) = &self.public_key {
            return Ok(Some(inline.clone()));
        }
        match &self.public_key_path {
            Some(path) => Ok(Some(fs::read_to_string(path)?)),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_args() -> Vec<&'static str> {
        vec![
            "sc-deployer",
            "deploy",
            "--stack",
            "web",
            "--env",
            "staging",
        ]
    }

    #[test]
    fn parses_deploy_command() {
        let cli = CliArgs::parse_from(base_args());
        match cli.command {
            Command::Deploy(args) => {
                assert_eq!(args.stack, "web");
                assert_eq!(args.environment, "staging");
                assert_eq!(args.profile, "default");
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn secure_command_requires_image_and_config() {
        let cli = CliArgs::parse_from([
            "sc-deployer",
            "secure",
            "--image",
            "ghcr.io/acme/api:v1",
            "--config",
            "security.yaml",
        ]);
        match cli.command {
            Command::Secure(args) => {
                assert_eq!(args.image, "ghcr.io/acme/api:v1");
                assert_eq!(args.config, PathBuf::from("security.yaml"));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn rejects_both_key_forms() {
        let config = ProfileConfig {
            project_name: "acme".into(),
            private_key_path: Some("key.pem".into()),
            private_key: Some("inline".into()),
            ..ProfileConfig::default()
        };
        let err = config.validate().expect_err("both key forms set");
        assert!(format!("{err}").contains("mutually exclusive"));
    }

    #[test]
    fn default_stacks_dir_lives_under_sc() {
        let config = ProfileConfig {
            project_name: "acme".into(),
            ..ProfileConfig::default()
        };
        assert_eq!(
            config.stacks_dir(Path::new("/work")),
            PathBuf::from("/work/.sc/stacks")
        );
    }

    #[test]
    fn explicit_stacks_dir_is_honored() {
        let config = ProfileConfig {
            project_name: "acme".into(),
            stacks_dir: Some(PathBuf::from("infra/stacks")),
            ..ProfileConfig::default()
        };
        assert_eq!(
            config.stacks_dir(Path::new("/work")),
            PathBuf::from("/work/infra/stacks")
        );
    }
}
