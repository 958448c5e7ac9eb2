use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;

use crate::compose::ComposeProject;
use crate::descriptor::{ConfigNode, TypedConfig, TypedPayload};
use crate::error::{DeployerError, Result};
use crate::prepare::{CloudComposeConfig, SingleImageConfig, StaticSiteConfig};
use crate::provisioner::Provisioner;

/// Converts a raw payload map into a typed record.
pub type MaterializeFn =
    Arc<dyn Fn(&JsonValue) -> std::result::Result<TypedPayload, serde_json::Error> + Send + Sync>;

/// Reader handed to provisioners so they can materialize nested kind-tagged
/// configs on their own (`fn(kind, rawConfig) -> typedConfig`).
pub type KindConfigReader =
    Arc<dyn Fn(&str, &JsonValue) -> Result<TypedPayload> + Send + Sync>;

/// Inputs handed to a compose converter when preparing a deploy.
pub struct ComposeConvertInput<'a> {
    pub template: &'a ConfigNode,
    pub project: &'a ComposeProject,
    pub client: &'a CloudComposeConfig,
    pub stack_name: &'a str,
    pub environment: &'a str,
}

/// Inputs handed to a single-image converter.
pub struct SingleImageConvertInput<'a> {
    pub template: &'a ConfigNode,
    pub client: &'a SingleImageConfig,
    pub stack_name: &'a str,
    pub environment: &'a str,
}

/// Inputs handed to a static-site converter.
pub struct StaticConvertInput<'a> {
    pub template: &'a ConfigNode,
    pub stack_dir: &'a Path,
    pub stack_name: &'a str,
    pub client: &'a StaticSiteConfig,
}

pub type ComposeConvertFn =
    Arc<dyn for<'a> Fn(&ComposeConvertInput<'a>) -> Result<JsonValue> + Send + Sync>;
pub type SingleImageConvertFn =
    Arc<dyn for<'a> Fn(&SingleImageConvertInput<'a>) -> Result<JsonValue> + Send + Sync>;
pub type StaticConvertFn =
    Arc<dyn for<'a> Fn(&StaticConvertInput<'a>) -> Result<JsonValue> + Send + Sync>;
pub type ProvisionerFactoryFn =
    Arc<dyn Fn(&ConfigNode) -> Result<Box<dyn Provisioner>> + Send + Sync>;

/// Builds a [`MaterializeFn`] for any deserializable config record.
pub fn materializer<T>() -> MaterializeFn
where
    T: DeserializeOwned + TypedConfig,
{
    Arc::new(|raw: &JsonValue| {
        let typed: T = serde_json::from_value(raw.clone())?;
        Ok(TypedPayload::new(typed))
    })
}

/// Keyed lookup of kind -> materializer / converter / factory. Built once
/// at startup by the provider modules and read-only afterwards, so sharing
/// `&Registry` (or an `Arc`) across threads needs no synchronization.
#[derive(Default)]
pub struct Registry {
    config_readers: HashMap<String, MaterializeFn>,
    provisioner_fields: HashMap<String, MaterializeFn>,
    compose_converters: HashMap<String, ComposeConvertFn>,
    single_image_converters: HashMap<String, SingleImageConvertFn>,
    static_converters: HashMap<String, StaticConvertFn>,
    provisioner_factories: HashMap<String, ProvisionerFactoryFn>,
}

impl Registry {
    /// Registry with every built-in provider registered.
    pub fn with_default_providers() -> Self {
        crate::providers::register_all(RegistryBuilder::new()).build()
    }

    pub fn config_reader(&self, kind: &str, site: &str) -> Result<&MaterializeFn> {
        self.config_readers
            .get(kind)
            .ok_or_else(|| unknown_kind(kind, site))
    }

    pub fn provisioner_field(&self, kind: &str, site: &str) -> Result<&MaterializeFn> {
        self.provisioner_fields
            .get(kind)
            .ok_or_else(|| unknown_kind(kind, site))
    }

    pub fn compose_converter(&self, kind: &str, site: &str) -> Result<&ComposeConvertFn> {
        self.compose_converters
            .get(kind)
            .ok_or_else(|| unknown_kind(kind, site))
    }

    pub fn single_image_converter(&self, kind: &str, site: &str) -> Result<&SingleImageConvertFn> {
        self.single_image_converters
            .get(kind)
            .ok_or_else(|| unknown_kind(kind, site))
    }

    pub fn static_converter(&self, kind: &str, site: &str) -> Result<&StaticConvertFn> {
        self.static_converters
            .get(kind)
            .ok_or_else(|| unknown_kind(kind, site))
    }

    pub fn provisioner_factory(&self, kind: &str, site: &str) -> Result<&ProvisionerFactoryFn> {
        self.provisioner_factories
            .get(kind)
            .ok_or_else(|| unknown_kind(kind, site))
    }

    /// A kind-dispatching reader over the config partition, for handing to
    /// a provisioner.
    pub fn kind_reader(self: &Arc<Self>) -> KindConfigReader {
        let registry = Arc::clone(self);
        Arc::new(move |kind: &str, raw: &JsonValue| {
            let reader = registry.config_reader(kind, "provisioner")?;
            reader(raw).map_err(|source| DeployerError::MaterializeFailed {
                kind: kind.to_string(),
                site: "provisioner".to_string(),
                source,
            })
        })
    }
}

fn unknown_kind(kind: &str, site: &str) -> DeployerError {
    DeployerError::UnknownKind {
        kind: kind.to_string(),
        site: site.to_string(),
    }
}

/// Explicit builder so tests can assemble a registry with a subset of
/// providers instead of relying on process-wide registration hooks.
#[derive(Default)]
pub struct RegistryBuilder {
    registry: Registry,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config_reader<T>(mut self, kind: &str) -> Self
    where
        T: DeserializeOwned + TypedConfig,
    {
        self.registry
            .config_readers
            .insert(kind.to_string(), materializer::<T>());
        self
    }

    pub fn provisioner_field<T>(mut self, kind: &str) -> Self
    where
        T: DeserializeOwned + TypedConfig,
    {
        self.registry
            .provisioner_fields
            .insert(kind.to_string(), materializer::<T>());
        self
    }

    pub fn compose_converter(mut self, kind: &str, converter: ComposeConvertFn) -> Self {
        self.registry
            .compose_converters
            .insert(kind.to_string(), converter);
        self
    }

    pub fn single_image_converter(mut self, kind: &str, converter: SingleImageConvertFn) -> Self {
        self.registry
            .single_image_converters
            .insert(kind.to_string(), converter);
        self
    }

    pub fn static_converter(mut self, kind: &str, converter: StaticConvertFn) -> Self {
        self.registry
            .static_converters
            .insert(kind.to_string(), converter);
        self
    }

    pub fn provisioner_factory(mut self, kind: &str, factory: ProvisionerFactoryFn) -> Self {
        self.registry
            .provisioner_factories
            .insert(kind.to_string(), factory);
        self
    }

    pub fn build(self) -> Registry {
        self.registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use serde_json::json;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct FakeConfig {
        region: String,
    }

    #[test]
    fn lookup_of_registered_kind_materializes() {
        let registry = RegistryBuilder::new()
            .config_reader::<FakeConfig>("fake-kind")
            .build();
        let reader = registry
            .config_reader("fake-kind", "server.templates.web")
            .expect("registered kind resolves");
        let payload = reader(&json!({"region": "eu"})).expect("materializes");
        let typed = payload.downcast_ref::<FakeConfig>().expect("downcasts");
        assert_eq!(typed.region, "eu");
    }

    #[test]
    fn lookup_of_unknown_kind_fails_with_site() {
        let registry = RegistryBuilder::new().build();
        let err = match registry.config_reader("made-up", "server.resources.registrar") {
            Err(e) => e,
            Ok(_) => panic!("unknown kind"),
        };
        match err {
            DeployerError::UnknownKind { kind, site } => {
                assert_eq!(kind, "made-up");
                assert_eq!(site, "server.resources.registrar");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn materialize_failure_carries_codec_error() {
        let registry = RegistryBuilder::new()
            .config_reader::<FakeConfig>("fake-kind")
            .build();
        let reader = registry
            .config_reader("fake-kind", "site")
            .expect("registered");
        let err = reader(&json!({"region": 42})).expect_err("wrong type");
        assert!(err.to_string().contains("region") || err.is_data());
    }

    mod factory {
        use super::*;
        use async_trait::async_trait;

        use crate::config::ProfileConfig;
        use crate::descriptor::{Stack, StackDescriptor};
        use crate::provisioner::{DeployParams, Provisioner};

        #[derive(Default)]
        struct RecordingProvisioner {
            public_key: Option<String>,
        }

        #[async_trait]
        impl Provisioner for RecordingProvisioner {
            fn set_public_key(&mut self, key: String) {
                self.public_key = Some(key);
            }

            fn set_config_reader(&mut self, _reader: KindConfigReader) {}

            async fn provision_stack(&self, _cfg: &ProfileConfig, _stack: &Stack) -> Result<()> {
                Ok(())
            }

            async fn deploy_stack(
                &self,
                _cfg: &ProfileConfig,
                _descriptor: &StackDescriptor,
                _params: &DeployParams,
            ) -> Result<()> {
                Ok(())
            }
        }

        #[test]
        fn factories_build_provisioners_per_kind() {
            let registry = RegistryBuilder::new()
                .provisioner_factory(
                    "pulumi",
                    Arc::new(|_node: &ConfigNode| {
                        Ok(Box::new(RecordingProvisioner::default()) as Box<dyn Provisioner>)
                    }),
                )
                .build();

            let factory = registry
                .provisioner_factory("pulumi", "infra.provisioner")
                .expect("registered");
            let mut provisioner = factory(&ConfigNode::default()).expect("constructs");
            provisioner.set_public_key("age1...".into());

            let err = match registry.provisioner_factory("terraform", "infra.provisioner") {
                Err(e) => e,
                Ok(_) => panic!("unregistered backend"),
            };
            assert!(matches!(err, DeployerError::UnknownKind { .. }));
        }
    }
}
