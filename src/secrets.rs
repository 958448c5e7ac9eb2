use std::collections::BTreeMap;

use indexmap::IndexMap;
use tracing::debug;

use crate::descriptor::{ConfigNode, SecretsFilter};
use crate::error::{DeployerError, Result};

pub const MODE_INCLUDE: &str = "include";
pub const MODE_EXCLUDE: &str = "exclude";
pub const MODE_OVERRIDE: &str = "override";

/// Parsed form of the secret reference grammar. All prefix handling lives
/// here; callers never inspect raw strings themselves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SecretRef {
    /// `${secret:KEY}`
    Secret(String),
    /// `${auth:HANDLE}`
    Auth(String),
    /// `${var:NAME}`
    Var(String),
    /// `${stack:name}`
    StackName,
    /// `literal:X`
    Literal(String),
    /// `~KEY`
    DirectKey(String),
    /// anything else; may still match a base key by name
    Bare(String),
}

impl SecretRef {
    pub fn parse(raw: &str) -> Self {
        if let Some(inner) = raw.strip_prefix("${").and_then(|s| s.strip_suffix('}')) {
            if let Some(key) = inner.strip_prefix("secret:") {
                return SecretRef::Secret(key.to_string());
            }
            if let Some(handle) = inner.strip_prefix("auth:") {
                return SecretRef::Auth(handle.to_string());
            }
            if let Some(name) = inner.strip_prefix("var:") {
                return SecretRef::Var(name.to_string());
            }
            if inner == "stack:name" {
                return SecretRef::StackName;
            }
        }
        if let Some(key) = raw.strip_prefix('~') {
            return SecretRef::DirectKey(key.to_string());
        }
        if let Some(value) = raw.strip_prefix("literal:") {
            return SecretRef::Literal(value.to_string());
        }
        SecretRef::Bare(raw.to_string())
    }
}

/// Computes the secret map a child stack sees, given the parent's base
/// secrets and the per-environment filter from its secrets-config block.
pub fn resolve(
    base: &BTreeMap<String, String>,
    filter: Option<&SecretsFilter>,
) -> Result<BTreeMap<String, String>> {
    let Some(filter) = filter else {
        return Ok(base.clone());
    };

    match filter.mode.as_str() {
        MODE_INCLUDE => {
            let mut result = BTreeMap::new();
            for (local_name, reference) in &filter.secrets {
                result.insert(local_name.clone(), resolve_value(local_name, reference, base)?);
            }
            Ok(result)
        }
        MODE_EXCLUDE => {
            if !filter.inherit_all {
                return Err(DeployerError::InvalidMode(format!(
                    "mode '{MODE_EXCLUDE}' requires inheritAll=true"
                )));
            }
            let mut result = base.clone();
            for excluded in filter.secrets.keys() {
                result.remove(excluded);
            }
            Ok(result)
        }
        MODE_OVERRIDE => {
            let mut result = base.clone();
            for (local_name, reference) in &filter.secrets {
                result.insert(local_name.clone(), resolve_value(local_name, reference, base)?);
            }
            Ok(result)
        }
        other => Err(DeployerError::InvalidMode(format!(
            "'{other}' is not one of {MODE_INCLUDE}/{MODE_EXCLUDE}/{MODE_OVERRIDE}"
        ))),
    }
}

/// Resolves one mapping entry `localName -> reference` against the base map.
fn resolve_value(
    local_name: &str,
    reference: &str,
    base: &BTreeMap<String, String>,
) -> Result<String> {
    let not_found = || DeployerError::SecretNotFound {
        name: local_name.to_string(),
        reference: reference.to_string(),
    };

    match SecretRef::parse(reference) {
        SecretRef::Secret(key) | SecretRef::DirectKey(key) => {
            base.get(&key).cloned().ok_or_else(not_found)
        }
        SecretRef::Literal(value) => Ok(value),
        SecretRef::Bare(key) => base.get(&key).cloned().ok_or_else(not_found),
        SecretRef::Auth(_) | SecretRef::Var(_) | SecretRef::StackName => Err(not_found()),
    }
}

/// Pre-deploy check: every secret name the client declares must be
/// producible by the resolver. Reports the full list of inaccessible names
/// instead of stopping at the first.
pub fn validate_access(
    declared: &[String],
    base: &BTreeMap<String, String>,
    filter: Option<&SecretsFilter>,
) -> Result<Vec<String>> {
    let resolved = resolve(base, filter)?;
    let inaccessible: Vec<String> = declared
        .iter()
        .filter(|name| !resolved.contains_key(*name))
        .cloned()
        .collect();
    if !inaccessible.is_empty() {
        debug!(?inaccessible, "declared secrets not producible by resolver");
    }
    Ok(inaccessible)
}

/// Context for substituting grammar references inside config strings.
pub struct InterpolationContext<'a> {
    pub stack_name: &'a str,
    pub variables: &'a IndexMap<String, String>,
    pub auth: &'a IndexMap<String, ConfigNode>,
    pub secrets: &'a BTreeMap<String, String>,
}

/// Replaces every `${secret:}`, `${auth:}`, `${var:}` and `${stack:name}`
/// occurrence inside a config string. Text outside references is copied
/// verbatim.
pub fn interpolate(input: &str, ctx: &InterpolationContext<'_>) -> Result<String> {
    let mut output = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        let (head, tail) = rest.split_at(start);
        output.push_str(head);
        let Some(end) = tail.find('}') else {
            output.push_str(tail);
            return Ok(output);
        };
        let token = &tail[..=end];
        output.push_str(&substitute(token, ctx)?);
        rest = &tail[end + 1..];
    }
    output.push_str(rest);
    Ok(output)
}

fn substitute(token: &str, ctx: &InterpolationContext<'_>) -> Result<String> {
    let missing = |name: &str| DeployerError::SecretNotFound {
        name: name.to_string(),
        reference: token.to_string(),
    };

    match SecretRef::parse(token) {
        SecretRef::Secret(key) => ctx.secrets.get(&key).cloned().ok_or_else(|| missing(&key)),
        SecretRef::Var(name) => ctx
            .variables
            .get(&name)
            .cloned()
            .ok_or_else(|| missing(&name)),
        SecretRef::Auth(handle) => {
            let node = ctx.auth.get(&handle).ok_or_else(|| missing(&handle))?;
            Ok(serde_json::to_string(&node.raw)?)
        }
        SecretRef::StackName => Ok(ctx.stack_name.to_string()),
        // Unknown ${...} tokens pass through untouched.
        _ => Ok(token.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> BTreeMap<String, String> {
        BTreeMap::from([
            ("DB_URL".to_string(), "prod".to_string()),
            ("DB_URL_STG".to_string(), "stg".to_string()),
            ("KEY".to_string(), "k".to_string()),
        ])
    }

    fn filter(mode: &str, inherit_all: bool, entries: &[(&str, &str)]) -> SecretsFilter {
        SecretsFilter {
            mode: mode.to_string(),
            inherit_all,
            secrets: entries
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    #[test]
    fn parses_reference_grammar() {
        assert_eq!(
            SecretRef::parse("${secret:DB_URL}"),
            SecretRef::Secret("DB_URL".into())
        );
        assert_eq!(
            SecretRef::parse("${auth:gcp-sa}"),
            SecretRef::Auth("gcp-sa".into())
        );
        assert_eq!(
            SecretRef::parse("${var:domain}"),
            SecretRef::Var("domain".into())
        );
        assert_eq!(SecretRef::parse("${stack:name}"), SecretRef::StackName);
        assert_eq!(SecretRef::parse("~KEY"), SecretRef::DirectKey("KEY".into()));
        assert_eq!(
            SecretRef::parse("literal:plain"),
            SecretRef::Literal("plain".into())
        );
        assert_eq!(SecretRef::parse("DB_URL"), SecretRef::Bare("DB_URL".into()));
    }

    #[test]
    fn absent_filter_passes_everything_through() {
        let resolved = resolve(&base(), None).expect("passthrough");
        assert_eq!(resolved, base());
    }

    #[test]
    fn include_mode_selects_exactly_the_listed_keys() {
        let filter = filter(MODE_INCLUDE, false, &[("DB_URL", "DB_URL_STG")]);
        let resolved = resolve(&base(), Some(&filter)).expect("include");
        assert_eq!(
            resolved,
            BTreeMap::from([("DB_URL".to_string(), "stg".to_string())])
        );
    }

    #[test]
    fn exclude_without_inherit_all_is_invalid() {
        let filter = filter(MODE_EXCLUDE, false, &[("X", "")]);
        let err = resolve(&base(), Some(&filter)).expect_err("invalid mode");
        assert!(matches!(err, DeployerError::InvalidMode(_)));
        assert!(format!("{err}").contains("inheritAll"));
    }

    #[test]
    fn exclude_removes_listed_keys() {
        let filter = filter(MODE_EXCLUDE, true, &[("DB_URL", "")]);
        let resolved = resolve(&base(), Some(&filter)).expect("exclude");
        assert_eq!(
            resolved.keys().collect::<Vec<_>>(),
            vec!["DB_URL_STG", "KEY"]
        );
    }

    #[test]
    fn override_merges_and_resolves_references() {
        let base = BTreeMap::from([
            ("A".to_string(), "1".to_string()),
            ("B".to_string(), "2".to_string()),
        ]);
        let filter = filter(
            MODE_OVERRIDE,
            false,
            &[("A", "${secret:B}"), ("C", "literal:3")],
        );
        let resolved = resolve(&base, Some(&filter)).expect("override");
        assert_eq!(
            resolved,
            BTreeMap::from([
                ("A".to_string(), "2".to_string()),
                ("B".to_string(), "2".to_string()),
                ("C".to_string(), "3".to_string()),
            ])
        );
    }

    #[test]
    fn unknown_mode_is_invalid() {
        let filter = filter("merge", false, &[]);
        let err = resolve(&base(), Some(&filter)).expect_err("invalid mode");
        assert!(format!("{err}").contains("merge"));
    }

    #[test]
    fn tilde_and_bare_references_resolve_against_base() {
        let filter = filter(MODE_INCLUDE, false, &[("A", "~KEY"), ("B", "DB_URL")]);
        let resolved = resolve(&base(), Some(&filter)).expect("include");
        assert_eq!(resolved["A"], "k");
        assert_eq!(resolved["B"], "prod");
    }

    #[test]
    fn missing_reference_reports_name_and_ref() {
        let filter = filter(MODE_INCLUDE, false, &[("A", "${secret:NOPE}")]);
        let err = resolve(&base(), Some(&filter)).expect_err("missing key");
        match err {
            DeployerError::SecretNotFound { name, reference } => {
                assert_eq!(name, "A");
                assert_eq!(reference, "${secret:NOPE}");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn validate_access_reports_all_inaccessible_names() {
        let filter = filter(MODE_INCLUDE, false, &[("DB_URL", "DB_URL_STG")]);
        let declared = vec!["DB_URL".to_string(), "KEY".to_string(), "TOKEN".to_string()];
        let inaccessible =
            validate_access(&declared, &base(), Some(&filter)).expect("validation runs");
        assert_eq!(inaccessible, vec!["KEY".to_string(), "TOKEN".to_string()]);
    }

    #[test]
    fn interpolates_config_strings() {
        let variables = IndexMap::from([("domain".to_string(), "acme.dev".to_string())]);
        let auth = IndexMap::new();
        let secrets = base();
        let ctx = InterpolationContext {
            stack_name: "web",
            variables: &variables,
            auth: &auth,
            secrets: &secrets,
        };
        let out = interpolate("https://${stack:name}.${var:domain}/?key=${secret:KEY}", &ctx)
            .expect("interpolation");
        assert_eq!(out, "https://web.acme.dev/?key=k");
    }
}
