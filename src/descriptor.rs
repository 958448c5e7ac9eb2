use std::any::Any;
use std::fmt;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::Result;

/// A materialized cloud-specific configuration record. Implemented via the
/// blanket impl below for any serializable, cloneable config struct, so
/// provider modules only declare plain serde types.
pub trait TypedConfig: Any + fmt::Debug + Send + Sync {
    fn as_any(&self) -> &dyn Any;
    fn clone_box(&self) -> Box<dyn TypedConfig>;
    fn to_json(&self) -> Result<JsonValue>;
}

impl<T> TypedConfig for T
where
    T: Any + fmt::Debug + Send + Sync + Clone + Serialize,
{
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn clone_box(&self) -> Box<dyn TypedConfig> {
        Box::new(self.clone())
    }

    fn to_json(&self) -> Result<JsonValue> {
        Ok(serde_json::to_value(self)?)
    }
}

/// Owning wrapper for a materialized config so descriptor trees stay
/// cloneable.
pub struct TypedPayload(Box<dyn TypedConfig>);

impl TypedPayload {
    pub fn new<T: TypedConfig>(value: T) -> Self {
        Self(Box::new(value))
    }

    pub fn downcast_ref<T: 'static>(&self) -> Option<&T> {
        self.0.as_any().downcast_ref::<T>()
    }

    pub fn to_json(&self) -> Result<JsonValue> {
        self.0.to_json()
    }
}

impl Clone for TypedPayload {
    fn clone(&self) -> Self {
        Self(self.0.clone_box())
    }
}

impl fmt::Debug for TypedPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A polymorphic descriptor site: `type` selects the materializer, `inherit`
/// replaces the content with a pointer into a sibling stack, and the
/// remaining keys are the kind-specific payload.
///
/// `typed` and `fields` are materialized views populated by the loader; the
/// raw payload stays the serialization source of truth.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigNode {
    #[serde(rename = "type", default, skip_serializing_if = "String::is_empty")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inherit: Option<String>,
    #[serde(flatten)]
    pub raw: JsonValue,
    #[serde(skip)]
    pub typed: Option<TypedPayload>,
    #[serde(skip)]
    pub fields: IndexMap<String, TypedPayload>,
}

impl Default for ConfigNode {
    fn default() -> Self {
        Self {
            kind: String::new(),
            inherit: None,
            raw: JsonValue::Object(serde_json::Map::new()),
            typed: None,
            fields: IndexMap::new(),
        }
    }
}

impl ConfigNode {
    pub fn is_inherit(&self) -> bool {
        self.inherit.is_some()
    }

    pub fn has_content(&self) -> bool {
        match &self.raw {
            JsonValue::Object(map) => !map.is_empty(),
            JsonValue::Null => false,
            _ => true,
        }
    }
}

/// Per-environment resource bundle of a server descriptor.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceBundle {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inherit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub resources: IndexMap<String, ConfigNode>,
}

/// Registrar plus per-environment resources of a server descriptor.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourcesDescriptor {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registrar: Option<ConfigNode>,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub resources: IndexMap<String, ResourceBundle>,
}

/// Per-environment secrets filtering policy applied to child stacks.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecretsFilter {
    #[serde(default)]
    pub mode: String,
    #[serde(default)]
    pub inherit_all: bool,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub secrets: IndexMap<String, String>,
}

/// The secrets-config block of a server descriptor; either an inheritance
/// pointer or a map of environment -> filter.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecretsConfigNode {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inherit: Option<String>,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub environments: IndexMap<String, SecretsFilter>,
}

/// `server.yaml`: provisioner, secrets backend, CI/CD, reusable templates,
/// per-environment resources, and free-form variables.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerDescriptor {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provisioner: Option<ConfigNode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secrets: Option<ConfigNode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ci_cd: Option<ConfigNode>,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub templates: IndexMap<String, ConfigNode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secrets_config: Option<SecretsConfigNode>,
    #[serde(default)]
    pub resources: ResourcesDescriptor,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub variables: IndexMap<String, String>,
}

/// Deployment shape chosen by a client environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ClientType {
    CloudCompose,
    SingleImage,
    Static,
}

impl ClientType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClientType::CloudCompose => "cloud-compose",
            ClientType::SingleImage => "single-image",
            ClientType::Static => "static",
        }
    }
}

/// One environment entry of `client.yaml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientEnvironment {
    pub parent: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_env: Option<String>,
    pub template: String,
    #[serde(rename = "type")]
    pub client_type: ClientType,
    #[serde(default)]
    pub config: JsonValue,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub secrets: Vec<String>,
}

/// `client.yaml`: environment -> client stack declaration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientDescriptor {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_version: Option<String>,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub stacks: IndexMap<String, ClientEnvironment>,
}

/// `secrets.yaml`: typed auth handles plus opaque name -> ciphertext values.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecretsDescriptor {
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub auth: IndexMap<String, ConfigNode>,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub values: IndexMap<String, String>,
}

/// A named stack: the unit the graph, resolver, and preparer operate on.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Stack {
    pub name: String,
    #[serde(default)]
    pub server: ServerDescriptor,
    #[serde(default)]
    pub client: ClientDescriptor,
    #[serde(default)]
    pub secrets: SecretsDescriptor,
}

impl Stack {
    /// A stack with no client environments only carries shared
    /// infrastructure.
    pub fn is_server_only(&self) -> bool {
        self.client.stacks.is_empty()
    }
}

/// Provisioner-ready output of the deploy preparer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StackDescriptor {
    #[serde(rename = "type")]
    pub stack_type: String,
    pub parent_stack: String,
    pub config: JsonValue,
}
