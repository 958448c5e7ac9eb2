use std::fs;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use tracing::debug;
use walkdir::WalkDir;

use crate::descriptor::{
    ClientDescriptor, ConfigNode, SecretsDescriptor, ServerDescriptor, Stack,
};
use crate::error::{DeployerError, Result};
use crate::graph::StackMap;
use crate::registry::Registry;

pub const SERVER_FILE: &str = "server.yaml";
pub const CLIENT_FILE: &str = "client.yaml";
pub const SECRETS_FILE: &str = "secrets.yaml";

/// Raw payload keys of a provisioner node materialized through the
/// provisioner-fields partition.
const PROVISIONER_FIELD_KEYS: [&str; 2] = ["stateStorage", "secretsProvider"];

/// Walks `<stacksDir>/<stackName>/` and loads every stack found there.
/// Loading is a pure function of the on-disk bytes and the registry.
pub fn load_stacks(stacks_dir: &Path, registry: &Registry) -> Result<StackMap> {
    if !stacks_dir.is_dir() {
        return Err(DeployerError::Config(format!(
            "stacks directory {} is not readable",
            stacks_dir.display()
        )));
    }
    let mut stacks = StackMap::new();
    for entry in WalkDir::new(stacks_dir).min_depth(1).max_depth(1) {
        let entry = entry.map_err(|err| {
            DeployerError::Config(format!(
                "stacks directory {} is not readable: {err}",
                stacks_dir.display()
            ))
        })?;
        if !entry.file_type().is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        let stack = load_stack(entry.path(), &name, registry)?;
        stacks.insert(name, stack);
    }
    Ok(stacks)
}

/// Loads one stack directory. Every document aggregates its kind errors so
/// the user sees all of them at once instead of one per invocation.
pub fn load_stack(stack_dir: &Path, name: &str, registry: &Registry) -> Result<Stack> {
    let server_path = stack_dir.join(SERVER_FILE);
    let mut server: ServerDescriptor = parse_document(&server_path)?;
    let mut errors = Vec::new();
    materialize_server(&mut server, registry, &mut errors);
    fail_on_document_errors(&server_path, errors)?;

    let client_path = stack_dir.join(CLIENT_FILE);
    let client: ClientDescriptor = parse_document(&client_path)?;

    let secrets_path = stack_dir.join(SECRETS_FILE);
    let mut secrets: SecretsDescriptor = parse_document(&secrets_path)?;
    let mut errors = Vec::new();
    for (handle, node) in secrets.auth.iter_mut() {
        materialize_node(node, &format!("secrets.auth.{handle}"), registry, &mut errors);
    }
    fail_on_document_errors(&secrets_path, errors)?;

    debug!(stack = name, "loaded stack descriptors");
    Ok(Stack {
        name: name.to_string(),
        server,
        client,
        secrets,
    })
}

fn parse_document<T: DeserializeOwned + Default>(path: &Path) -> Result<T> {
    let bytes = match fs::read_to_string(path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(T::default()),
        Err(err) => return Err(err.into()),
    };
    serde_yaml_bw::from_str(&bytes).map_err(|source| DeployerError::ConfigParse {
        path: path.to_path_buf(),
        source,
    })
}

fn fail_on_document_errors(path: &Path, errors: Vec<DeployerError>) -> Result<()> {
    if errors.is_empty() {
        Ok(())
    } else {
        Err(DeployerError::Document {
            path: path.to_path_buf(),
            errors,
        })
    }
}

fn materialize_server(
    server: &mut ServerDescriptor,
    registry: &Registry,
    errors: &mut Vec<DeployerError>,
) {
    if let Some(node) = server.provisioner.as_mut() {
        materialize_provisioner(node, "server.provisioner", registry, errors);
    }
    if let Some(node) = server.secrets.as_mut() {
        materialize_node(node, "server.secrets", registry, errors);
    }
    if let Some(node) = server.ci_cd.as_mut() {
        materialize_node(node, "server.ciCd", registry, errors);
    }
    for (name, node) in server.templates.iter_mut() {
        materialize_node(node, &format!("server.templates.{name}"), registry, errors);
    }
    if let Some(node) = server.resources.registrar.as_mut() {
        materialize_node(node, "server.resources.registrar", registry, errors);
    }
    for (environment, bundle) in server.resources.resources.iter_mut() {
        for (name, node) in bundle.resources.iter_mut() {
            materialize_node(
                node,
                &format!("server.resources.{environment}.{name}"),
                registry,
                errors,
            );
        }
    }
}

/// Materializes one polymorphic site. Nodes carrying `inherit` skip
/// materialization entirely; a node with both `inherit` and a non-empty
/// `type` is rejected here so the conflict surfaces at load time.
fn materialize_node(
    node: &mut ConfigNode,
    site: &str,
    registry: &Registry,
    errors: &mut Vec<DeployerError>,
) {
    if node.is_inherit() {
        if !node.kind.is_empty() {
            errors.push(DeployerError::InheritanceInvalid {
                site: site.to_string(),
                reason: format!("'inherit' excludes 'type' (found '{}')", node.kind),
            });
        }
        return;
    }

    let reader = match registry.config_reader(&node.kind, site) {
        Ok(reader) => reader,
        Err(err) => {
            errors.push(err);
            return;
        }
    };
    match reader(&node.raw) {
        Ok(payload) => node.typed = Some(payload),
        Err(source) => errors.push(DeployerError::MaterializeFailed {
            kind: node.kind.clone(),
            site: site.to_string(),
            source,
        }),
    }
}

/// The provisioner node additionally materializes its state-storage and
/// secrets-provider sub-blocks through the provisioner-fields partition.
fn materialize_provisioner(
    node: &mut ConfigNode,
    site: &str,
    registry: &Registry,
    errors: &mut Vec<DeployerError>,
) {
    materialize_node(node, site, registry, errors);
    if node.is_inherit() {
        return;
    }

    for key in PROVISIONER_FIELD_KEYS {
        let Some(field) = node.raw.get(key) else {
            continue;
        };
        let field_site = format!("{site}.{key}");
        let kind = field
            .get("type")
            .and_then(JsonValue::as_str)
            .unwrap_or_default()
            .to_string();
        let reader = match registry.provisioner_field(&kind, &field_site) {
            Ok(reader) => reader,
            Err(err) => {
                errors.push(err);
                continue;
            }
        };
        match reader(field) {
            Ok(payload) => {
                node.fields.insert(key.to_string(), payload);
            }
            Err(source) => errors.push(DeployerError::MaterializeFailed {
                kind,
                site: field_site,
                source,
            }),
        }
    }
}

/// Absolute path of a stack's directory under the stacks root.
pub fn stack_dir(stacks_dir: &Path, stack_name: &str) -> PathBuf {
    stacks_dir.join(stack_name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use tempfile::tempdir;

    use crate::registry::RegistryBuilder;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct StubTemplate {
        region: String,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct StubBucket {
        bucket: String,
    }

    fn registry() -> Registry {
        RegistryBuilder::new()
            .config_reader::<StubTemplate>("stub-template")
            .config_reader::<StubBucket>("stub-provisioner")
            .provisioner_field::<StubBucket>("stub-bucket")
            .build()
    }

    fn write_stack(dir: &Path, server: &str) {
        fs::create_dir_all(dir).expect("stack dir");
        fs::write(dir.join(SERVER_FILE), server).expect("server.yaml");
    }

    #[test]
    fn loads_and_materializes_templates() {
        let root = tempdir().expect("temp dir");
        let dir = root.path().join("infra");
        write_stack(
            &dir,
            concat!(
                "templates:\n",
                "  web:\n",
                "    type: stub-template\n",
                "    region: eu\n",
            ),
        );
        let stack = load_stack(&dir, "infra", &registry()).expect("stack loads");
        let typed = stack.server.templates["web"]
            .typed
            .as_ref()
            .expect("materialized");
        assert_eq!(typed.downcast_ref::<StubTemplate>().unwrap().region, "eu");
    }

    #[test]
    fn aggregates_all_kind_errors_per_document() {
        let root = tempdir().expect("temp dir");
        let dir = root.path().join("infra");
        write_stack(
            &dir,
            concat!(
                "templates:\n",
                "  web:\n",
                "    type: made-up-one\n",
                "  api:\n",
                "    type: made-up-two\n",
            ),
        );
        let err = load_stack(&dir, "infra", &registry()).expect_err("both kinds unknown");
        match err {
            DeployerError::Document { errors, .. } => {
                assert_eq!(errors.len(), 2);
                assert!(errors
                    .iter()
                    .all(|e| matches!(e, DeployerError::UnknownKind { .. })));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn inherit_nodes_skip_materialization() {
        let root = tempdir().expect("temp dir");
        let dir = root.path().join("app");
        write_stack(&dir, "provisioner:\n  inherit: common\n");
        let stack = load_stack(&dir, "app", &registry()).expect("stack loads");
        assert!(stack.server.provisioner.as_ref().unwrap().is_inherit());
    }

    #[test]
    fn inherit_with_type_is_rejected_at_load() {
        let root = tempdir().expect("temp dir");
        let dir = root.path().join("app");
        write_stack(
            &dir,
            "provisioner:\n  inherit: common\n  type: stub-provisioner\n",
        );
        let err = load_stack(&dir, "app", &registry()).expect_err("conflict");
        assert!(format!("{err}").contains("'inherit' excludes 'type'"));
    }

    #[test]
    fn provisioner_fields_use_their_own_partition() {
        let root = tempdir().expect("temp dir");
        let dir = root.path().join("infra");
        write_stack(
            &dir,
            concat!(
                "provisioner:\n",
                "  type: stub-provisioner\n",
                "  bucket: state\n",
                "  stateStorage:\n",
                "    type: stub-bucket\n",
                "    bucket: tfstate\n",
            ),
        );
        let stack = load_stack(&dir, "infra", &registry()).expect("stack loads");
        let node = stack.server.provisioner.as_ref().unwrap();
        let field = node.fields.get("stateStorage").expect("field materialized");
        assert_eq!(field.downcast_ref::<StubBucket>().unwrap().bucket, "tfstate");
    }

    #[test]
    fn missing_documents_default_to_empty() {
        let root = tempdir().expect("temp dir");
        let dir = root.path().join("empty");
        fs::create_dir_all(&dir).expect("stack dir");
        let stack = load_stack(&dir, "empty", &registry()).expect("stack loads");
        assert!(stack.is_server_only());
    }
}
