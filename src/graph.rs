use std::collections::BTreeMap;

use tracing::debug;

use crate::descriptor::{ConfigNode, Stack};
use crate::error::{DeployerError, Result};

/// All loaded stacks keyed by name.
pub type StackMap = BTreeMap<String, Stack>;

/// Resolves the inheritance markers of every stack against its siblings.
///
/// Substitution is by value from a frozen snapshot of the input, one hop
/// only: a marker whose referent node itself inherits is kept as a pointer
/// instead of being expanded, which is what makes a true cycle (two stacks
/// pointing at each other) structurally harmless.
pub fn resolve_inheritance(stacks: &mut StackMap) -> Result<()> {
    let source = stacks.clone();
    for (name, stack) in stacks.iter_mut() {
        resolve_stack(name, stack, &source)?;
    }
    Ok(())
}

/// Shape validation after resolution: every client environment must point
/// at an existing parent that declares both the referenced template and the
/// referenced environment.
pub fn validate(stacks: &StackMap) -> Result<()> {
    for (name, stack) in stacks {
        for (environment, client) in &stack.client.stacks {
            let parent_key = parent_stack_key(&client.parent);
            let parent = stacks
                .get(parent_key)
                .ok_or_else(|| DeployerError::UnknownStack(client.parent.clone()))?;
            if !parent.server.templates.contains_key(&client.template) {
                return Err(DeployerError::UnknownTemplate {
                    stack: name.clone(),
                    template: client.template.clone(),
                });
            }
            let parent_env = client.parent_env.as_deref().unwrap_or(environment);
            if !parent.server.resources.resources.contains_key(parent_env) {
                return Err(DeployerError::Config(format!(
                    "stack '{name}' targets environment '{parent_env}' which parent '{parent_key}' does not declare"
                )));
            }
        }
    }
    Ok(())
}

/// `owner/project/name` forms reference the last path segment.
pub fn parent_stack_key(parent: &str) -> &str {
    parent.rsplit('/').next().unwrap_or(parent)
}

fn resolve_stack(name: &str, stack: &mut Stack, source: &StackMap) -> Result<()> {
    resolve_config_site(
        &mut stack.server.provisioner,
        name,
        "provisioner",
        source,
        |s| s.server.provisioner.as_ref(),
    )?;
    resolve_config_site(
        &mut stack.server.resources.registrar,
        name,
        "resources.registrar",
        source,
        |s| s.server.resources.registrar.as_ref(),
    )?;
    resolve_config_site(&mut stack.server.ci_cd, name, "ciCd", source, |s| {
        s.server.ci_cd.as_ref()
    })?;
    resolve_config_site(&mut stack.server.secrets, name, "secrets", source, |s| {
        s.server.secrets.as_ref()
    })?;
    resolve_secrets_config(name, stack, source)?;
    resolve_templates(name, stack, source)?;
    resolve_resource_bundles(name, stack, source)?;
    Ok(())
}

fn resolve_config_site<F>(
    slot: &mut Option<ConfigNode>,
    stack_name: &str,
    site: &str,
    source: &StackMap,
    pick: F,
) -> Result<()>
where
    F: Fn(&Stack) -> Option<&ConfigNode>,
{
    let Some(current) = slot.as_ref() else {
        return Ok(());
    };
    let Some(target) = current.inherit.clone() else {
        return Ok(());
    };
    let site_path = format!("{stack_name}.{site}");

    if !current.kind.is_empty() || current.has_content() {
        return Err(DeployerError::InheritanceInvalid {
            site: site_path,
            reason: "'inherit' excludes 'type' and content".into(),
        });
    }

    let referent = source
        .get(&target)
        .ok_or_else(|| DeployerError::InheritanceInvalid {
            site: site_path.clone(),
            reason: format!("referenced stack '{target}' does not exist"),
        })?;
    let referent_node = pick(referent).ok_or_else(|| DeployerError::InheritanceInvalid {
        site: site_path.clone(),
        reason: format!("stack '{target}' declares no {site}"),
    })?;

    if referent_node.is_inherit() {
        debug!(site = %site_path, target = %target, "referent also inherits; keeping pointer");
        return Ok(());
    }
    *slot = Some(referent_node.clone());
    Ok(())
}

fn resolve_secrets_config(name: &str, stack: &mut Stack, source: &StackMap) -> Result<()> {
    let Some(current) = stack.server.secrets_config.as_ref() else {
        return Ok(());
    };
    let Some(target) = current.inherit.clone() else {
        return Ok(());
    };
    let site_path = format!("{name}.secretsConfig");

    if !current.environments.is_empty() {
        return Err(DeployerError::InheritanceInvalid {
            site: site_path,
            reason: "'inherit' excludes environment entries".into(),
        });
    }
    let referent = source
        .get(&target)
        .ok_or_else(|| DeployerError::InheritanceInvalid {
            site: site_path.clone(),
            reason: format!("referenced stack '{target}' does not exist"),
        })?;
    let referent_node =
        referent
            .server
            .secrets_config
            .as_ref()
            .ok_or_else(|| DeployerError::InheritanceInvalid {
                site: site_path.clone(),
                reason: format!("stack '{target}' declares no secretsConfig"),
            })?;
    if referent_node.inherit.is_some() {
        return Ok(());
    }
    stack.server.secrets_config = Some(referent_node.clone());
    Ok(())
}

fn resolve_templates(name: &str, stack: &mut Stack, source: &StackMap) -> Result<()> {
    let template_keys: Vec<String> = stack.server.templates.keys().cloned().collect();
    for key in template_keys {
        let current = &stack.server.templates[&key];
        let Some(target) = current.inherit.clone() else {
            continue;
        };
        let site_path = format!("{name}.templates.{key}");

        if !current.kind.is_empty() || current.has_content() {
            return Err(DeployerError::InheritanceInvalid {
                site: site_path,
                reason: "'inherit' excludes 'type' and content".into(),
            });
        }

        // `parent/tpl` selects another template name; bare `parent` keeps
        // the same template key in the referenced stack.
        let (ref_stack, ref_template) = match target.split_once('/') {
            Some((stack_name, template)) => (stack_name.to_string(), template.to_string()),
            None => (target.clone(), key.clone()),
        };
        let referent = source
            .get(&ref_stack)
            .ok_or_else(|| DeployerError::InheritanceInvalid {
                site: site_path.clone(),
                reason: format!("referenced stack '{ref_stack}' does not exist"),
            })?;
        let referent_node = referent.server.templates.get(&ref_template).ok_or_else(|| {
            DeployerError::InheritanceInvalid {
                site: site_path.clone(),
                reason: format!("stack '{ref_stack}' declares no template '{ref_template}'"),
            }
        })?;
        if referent_node.is_inherit() {
            continue;
        }
        stack.server.templates[&key] = referent_node.clone();
    }
    Ok(())
}

fn resolve_resource_bundles(name: &str, stack: &mut Stack, source: &StackMap) -> Result<()> {
    let environments: Vec<String> = stack.server.resources.resources.keys().cloned().collect();
    for environment in environments {
        let bundle = &stack.server.resources.resources[&environment];
        let Some(target) = bundle.inherit.clone() else {
            continue;
        };
        let site_path = format!("{name}.resources.{environment}");

        if !bundle.resources.is_empty() {
            return Err(DeployerError::InheritanceInvalid {
                site: site_path,
                reason: "an inherited resource bundle must not declare resources".into(),
            });
        }
        let referent = source
            .get(&target)
            .ok_or_else(|| DeployerError::InheritanceInvalid {
                site: site_path.clone(),
                reason: format!("referenced stack '{target}' does not exist"),
            })?;
        let referent_bundle = referent
            .server
            .resources
            .resources
            .get(&environment)
            .ok_or_else(|| DeployerError::InheritanceInvalid {
                site: site_path.clone(),
                reason: format!("stack '{target}' declares no resources for '{environment}'"),
            })?;
        if referent_bundle.inherit.is_some() {
            continue;
        }
        stack.server.resources.resources[&environment] = referent_bundle.clone();
    }
    Ok(())
}
