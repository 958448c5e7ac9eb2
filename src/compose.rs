use std::fs;
use std::path::Path;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::{DeployerError, Result};

/// Label namespace recognized on compose services.
pub const LABEL_PREFIX: &str = "simple-container.com/";

const LABEL_INGRESS: &str = "simple-container.com/ingress";
const LABEL_INGRESS_PORT: &str = "simple-container.com/ingress/port";
const LABEL_VOLUME_SIZE: &str = "simple-container.com/volume-size";
const LABEL_VOLUME_ACCESS_MODES: &str = "simple-container.com/volume-access-modes";
const LABEL_VOLUME_STORAGE_CLASS: &str = "simple-container.com/volume-storage-class";
const LABEL_HEALTHCHECK_PATH: &str = "simple-container.com/healthcheck/path";
const LABEL_HEALTHCHECK_PORT: &str = "simple-container.com/healthcheck/port";
const LABEL_HEALTHCHECK_SUCCESS_CODES: &str = "simple-container.com/healthcheck/success-codes";

/// Compose allows both `K: V` maps and `- K=V` lists for environment and
/// labels sections.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum KeyValueList {
    Map(IndexMap<String, JsonValue>),
    List(Vec<String>),
}

impl Default for KeyValueList {
    fn default() -> Self {
        KeyValueList::Map(IndexMap::new())
    }
}

impl KeyValueList {
    pub fn to_map(&self) -> IndexMap<String, String> {
        match self {
            KeyValueList::Map(map) => map
                .iter()
                .map(|(key, value)| (key.clone(), scalar_to_string(value)))
                .collect(),
            KeyValueList::List(items) => items
                .iter()
                .map(|item| match item.split_once('=') {
                    Some((key, value)) => (key.to_string(), value.to_string()),
                    None => (item.clone(), String::new()),
                })
                .collect(),
        }
    }
}

fn scalar_to_string(value: &JsonValue) -> String {
    match value {
        JsonValue::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ComposeService {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build: Option<JsonValue>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<JsonValue>,
    #[serde(default)]
    pub environment: KeyValueList,
    #[serde(default)]
    pub labels: KeyValueList,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<String>,
    #[serde(default, skip_serializing_if = "JsonValue::is_null")]
    pub depends_on: JsonValue,
}

/// Deployment hints carried on a service through `simple-container.com/*`
/// labels.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceHints {
    pub ingress: bool,
    pub ingress_port: Option<u16>,
    pub volume_size: Option<String>,
    pub volume_access_modes: Vec<String>,
    pub volume_storage_class: Option<String>,
    pub healthcheck_path: Option<String>,
    pub healthcheck_port: Option<u16>,
    pub healthcheck_success_codes: Option<String>,
}

impl ComposeService {
    pub fn hints(&self) -> ServiceHints {
        let labels = self.labels.to_map();
        let get = |key: &str| labels.get(key).cloned();
        ServiceHints {
            ingress: get(LABEL_INGRESS).is_some_and(|v| v == "true"),
            ingress_port: get(LABEL_INGRESS_PORT).and_then(|v| v.parse().ok()),
            volume_size: get(LABEL_VOLUME_SIZE),
            volume_access_modes: get(LABEL_VOLUME_ACCESS_MODES)
                .map(|v| v.split(',').map(|m| m.trim().to_string()).collect())
                .unwrap_or_default(),
            volume_storage_class: get(LABEL_VOLUME_STORAGE_CLASS),
            healthcheck_path: get(LABEL_HEALTHCHECK_PATH),
            healthcheck_port: get(LABEL_HEALTHCHECK_PORT).and_then(|v| v.parse().ok()),
            healthcheck_success_codes: get(LABEL_HEALTHCHECK_SUCCESS_CODES),
        }
    }

    pub fn environment_map(&self) -> IndexMap<String, String> {
        self.environment.to_map()
    }

    /// Published container ports, normalized from the `host:container`
    /// string and bare numeric forms.
    pub fn container_ports(&self) -> Vec<u16> {
        self.ports
            .iter()
            .filter_map(|port| match port {
                JsonValue::Number(n) => n.as_u64().and_then(|n| u16::try_from(n).ok()),
                JsonValue::String(s) => {
                    let container = s.rsplit_once(':').map_or(s.as_str(), |(_, c)| c);
                    container.split('/').next().and_then(|p| p.parse().ok())
                }
                JsonValue::Object(map) => map
                    .get("target")
                    .and_then(JsonValue::as_u64)
                    .and_then(|n| u16::try_from(n).ok()),
                _ => None,
            })
            .collect()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ComposeProject {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default)]
    pub services: IndexMap<String, ComposeService>,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub volumes: IndexMap<String, JsonValue>,
}

impl ComposeProject {
    /// At most one service per project may carry the ingress label.
    pub fn ingress_service(&self) -> Result<Option<(&str, &ComposeService)>> {
        let mut matches: Vec<(&str, &ComposeService)> = self
            .services
            .iter()
            .filter(|(_, service)| service.hints().ingress)
            .map(|(name, service)| (name.as_str(), service))
            .collect();
        if matches.len() > 1 {
            return Err(DeployerError::AmbiguousIngress {
                services: matches.iter().map(|(name, _)| name.to_string()).collect(),
            });
        }
        Ok(matches.pop())
    }
}

pub fn load_compose(path: &Path) -> Result<ComposeProject> {
    let bytes = fs::read_to_string(path)?;
    serde_yaml_bw::from_str(&bytes).map_err(|source| DeployerError::ConfigParse {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const PROJECT: &str = concat!(
        "services:\n",
        "  api:\n",
        "    image: ghcr.io/acme/api:latest\n",
        "    ports:\n",
        "      - \"8080:80\"\n",
        "    environment:\n",
        "      RUST_LOG: info\n",
        "    labels:\n",
        "      simple-container.com/ingress: \"true\"\n",
        "      simple-container.com/ingress/port: \"80\"\n",
        "      simple-container.com/healthcheck/path: /healthz\n",
        "  worker:\n",
        "    image: ghcr.io/acme/worker:latest\n",
        "    environment:\n",
        "      - QUEUE=jobs\n",
        "    labels:\n",
        "      - simple-container.com/volume-size=10Gi\n",
    );

    #[test]
    fn parses_services_and_label_forms() {
        let project: ComposeProject = serde_yaml_bw::from_str(PROJECT).expect("project parses");
        let api = &project.services["api"];
        assert_eq!(api.container_ports(), vec![80]);
        assert_eq!(api.environment_map()["RUST_LOG"], "info");

        let hints = api.hints();
        assert!(hints.ingress);
        assert_eq!(hints.ingress_port, Some(80));
        assert_eq!(hints.healthcheck_path.as_deref(), Some("/healthz"));

        let worker = &project.services["worker"];
        assert_eq!(worker.environment_map()["QUEUE"], "jobs");
        assert_eq!(worker.hints().volume_size.as_deref(), Some("10Gi"));
    }

    #[test]
    fn single_ingress_service_is_selected() {
        let project: ComposeProject = serde_yaml_bw::from_str(PROJECT).expect("project parses");
        let (name, _) = project
            .ingress_service()
            .expect("selection succeeds")
            .expect("one ingress service");
        assert_eq!(name, "api");
    }

    #[test]
    fn two_ingress_services_are_ambiguous() {
        let yaml = concat!(
            "services:\n",
            "  a:\n",
            "    labels:\n",
            "      simple-container.com/ingress: \"true\"\n",
            "  b:\n",
            "    labels:\n",
            "      simple-container.com/ingress: \"true\"\n",
        );
        let project: ComposeProject = serde_yaml_bw::from_str(yaml).expect("project parses");
        let err = project.ingress_service().expect_err("ambiguous");
        match err {
            DeployerError::AmbiguousIngress { services } => {
                assert_eq!(services, vec!["a".to_string(), "b".to_string()]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn no_ingress_service_is_allowed() {
        let yaml = "services:\n  a:\n    image: x/y:z\n";
        let project: ComposeProject = serde_yaml_bw::from_str(yaml).expect("project parses");
        assert!(project.ingress_service().expect("selection").is_none());
    }
}
