//! OF-002: YAML parsing and validation.
//!
//! Parses a declaration and validates structural constraints:
//! - Version must be "1.0"
//! - depends_on references must exist and not point at the resource itself
//! - `{{...}}` references must name existing params, resources or data
//! - Data sources need a supported kind and at least one filter
//! - Per-kind attribute checks from each resource handler

use super::resolver::{references, Scope};
use super::types::*;
use crate::datasources;
use crate::error::{Error, Result};
use crate::resources;
use std::path::Path;

/// Validation error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

fn push(errors: &mut Vec<ValidationError>, message: String) {
    errors.push(ValidationError { message });
}

/// Parse a declaration file from disk. Provider fields the file leaves
/// unset are taken from the `OPENNEBULA_*` environment variables.
pub fn parse_declaration_file(path: &Path) -> Result<Declaration> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("failed to read {}: {}", path.display(), e))
    })?;
    let mut decl = parse_declaration(&content)?;
    decl.provider.apply_process_env();
    Ok(decl)
}

/// Parse a declaration from a string. The provider block is taken as
/// written; see [`parse_declaration_with_env`] for environment overrides.
pub fn parse_declaration(yaml: &str) -> Result<Declaration> {
    Ok(serde_yaml_ng::from_str(yaml)?)
}

/// Parse a declaration and fill unset provider fields from `lookup`.
pub fn parse_declaration_with_env<F>(yaml: &str, lookup: F) -> Result<Declaration>
where
    F: Fn(&str) -> Option<String>,
{
    let mut decl = parse_declaration(yaml)?;
    decl.provider.apply_env(lookup);
    Ok(decl)
}

/// Validate a parsed declaration. Returns a list of errors (empty = valid).
pub fn validate_declaration(decl: &Declaration) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    if decl.version != "1.0" {
        push(
            &mut errors,
            format!("version must be \"1.0\", got \"{}\"", decl.version),
        );
    }
    if decl.name.trim().is_empty() {
        push(&mut errors, "name must not be empty".to_string());
    }
    if let Err(e) = decl.provider.validate() {
        push(&mut errors, format!("provider: {}", e));
    }

    for (id, resource) in &decl.resources {
        for dep in &resource.depends_on {
            if dep == id {
                push(&mut errors, format!("resource '{}' depends on itself", id));
            } else if !decl.resources.contains_key(dep) {
                push(
                    &mut errors,
                    format!("resource '{}' depends on unknown resource '{}'", id, dep),
                );
            }
        }

        match resource.state.as_deref() {
            None | Some("present") | Some("absent") => {}
            Some(other) => push(
                &mut errors,
                format!(
                    "resource '{}' has invalid state '{}' (expected present or absent)",
                    id, other
                ),
            ),
        }

        let refs = match references(&resource.spec) {
            Ok(refs) => refs,
            Err(e) => {
                push(&mut errors, format!("resource '{}': {}", id, e));
                continue;
            }
        };
        for r in &refs {
            let known = match r.scope {
                Scope::Param => decl.params.contains_key(&r.name),
                Scope::Resource => decl.resources.contains_key(&r.name) && &r.name != id,
                Scope::Data => decl.data.contains_key(&r.name),
            };
            if !known {
                push(
                    &mut errors,
                    format!("resource '{}' references unknown {} '{}'", id, r.scope, r.name),
                );
            }
        }

        // Specs with references are checked again once resolved.
        if refs.is_empty() && !resource.is_absent() {
            let handler = resources::handler(resource.kind);
            for problem in handler.validate(&resource.spec) {
                push(
                    &mut errors,
                    format!("resource '{}' ({}): {}", id, resource.kind, problem),
                );
            }
        }
    }

    for (id, data) in &decl.data {
        if !datasources::SUPPORTED_KINDS.contains(&data.kind) {
            push(
                &mut errors,
                format!("data source '{}' cannot look up {} objects", id, data.kind),
            );
        }
        if data.id.is_none() && data.name.is_none() && data.tags.is_empty() {
            push(
                &mut errors,
                format!("data source '{}' needs at least one of id, name, tags", id),
            );
        }
    }

    errors
}

#[cfg(test)]
mod tests {
    use super::*;

    fn errors_for(yaml: &str) -> Vec<String> {
        let decl = parse_declaration(yaml).unwrap();
        validate_declaration(&decl)
            .into_iter()
            .map(|e| e.message)
            .collect()
    }

    #[test]
    fn test_of002_parse_valid() {
        let yaml = r#"
version: "1.0"
name: lab
params:
  env: prod
resources:
  c1:
    type: cluster
    name: "lab-{{params.env}}"
  h1:
    type: host
    name: node1
    host_type: kvm
    cluster_id: "{{resources.c1.id}}"
data:
  users:
    type: group
    name: users
"#;
        let errors = errors_for(yaml);
        assert!(errors.is_empty(), "unexpected errors: {:?}", errors);
    }

    #[test]
    fn test_of002_bad_version_and_name() {
        let errors = errors_for("version: \"2.0\"\nname: \"\"\n");
        assert_eq!(errors.len(), 2);
        assert!(errors[0].contains("version"));
        assert!(errors[1].contains("name"));
    }

    #[test]
    fn test_of002_depends_on_checks() {
        let errors = errors_for(
            r#"
version: "1.0"
name: t
resources:
  a: { type: cluster, name: a, depends_on: [a, ghost] }
"#,
        );
        assert!(errors.iter().any(|e| e.contains("depends on itself")));
        assert!(errors.iter().any(|e| e.contains("unknown resource 'ghost'")));
    }

    #[test]
    fn test_of002_unknown_references() {
        let errors = errors_for(
            r#"
version: "1.0"
name: t
resources:
  a:
    type: cluster
    name: "{{params.nope}}"
    tags:
      x: "{{data.missing.id}}"
      y: "{{resources.ghost.id}}"
"#,
        );
        assert_eq!(errors.len(), 3, "{:?}", errors);
        assert!(errors.iter().any(|e| e.contains("unknown param 'nope'")));
        assert!(errors.iter().any(|e| e.contains("unknown data source 'missing'")));
        assert!(errors.iter().any(|e| e.contains("unknown resource 'ghost'")));
    }

    #[test]
    fn test_of002_invalid_state() {
        let errors = errors_for(
            "version: \"1.0\"\nname: t\nresources:\n  a: { type: cluster, name: a, state: gone }\n",
        );
        assert!(errors[0].contains("invalid state 'gone'"));
    }

    #[test]
    fn test_of002_handler_validation() {
        let errors = errors_for(
            r#"
version: "1.0"
name: t
resources:
  img:
    type: image
    name: base
    datastore_id: 1
    permissions: "999"
"#,
        );
        assert!(errors.iter().any(|e| e.contains("(image)")), "{:?}", errors);
    }

    #[test]
    fn test_of002_data_checks() {
        let errors = errors_for(
            r#"
version: "1.0"
name: t
data:
  any: { type: cluster }
  bad: { type: acl, id: 1 }
"#,
        );
        assert!(errors.iter().any(|e| e.contains("'any' needs at least one")));
        assert!(errors.iter().any(|e| e.contains("cannot look up acl rule")));
    }

    #[test]
    fn test_of002_env_fills_provider() {
        let yaml = "version: \"1.0\"\nname: t\nprovider:\n  username: declared\n";
        let decl = parse_declaration_with_env(yaml, |var| match var {
            crate::config::ENV_ENDPOINT => Some("http://env:2633/RPC2".to_string()),
            crate::config::ENV_USERNAME => Some("from-env".to_string()),
            _ => None,
        })
        .unwrap();
        assert_eq!(decl.provider.endpoint.as_deref(), Some("http://env:2633/RPC2"));
        assert_eq!(decl.provider.username.as_deref(), Some("declared"));
        assert!(parse_declaration(yaml).unwrap().provider.endpoint.is_none());
    }

    #[test]
    fn test_of002_file_keeps_declared_provider() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lab.yaml");
        std::fs::write(
            &path,
            "version: \"1.0\"\nname: lab\nprovider:\n  endpoint: http://one:2633/RPC2\n",
        )
        .unwrap();
        let decl = parse_declaration_file(&path).unwrap();
        assert_eq!(decl.provider.endpoint.as_deref(), Some("http://one:2633/RPC2"));
        assert!(parse_declaration_file(&dir.path().join("missing.yaml")).is_err());
    }

    #[test]
    fn test_of002_provider_checked() {
        let errors = errors_for("version: \"1.0\"\nname: t\nprovider:\n  endpoint: ftp://x\n");
        assert!(errors[0].starts_with("provider:"));
    }

    #[test]
    fn test_of002_parse_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lab.yaml");
        std::fs::write(&path, "version: \"1.0\"\nname: lab\n").unwrap();
        assert_eq!(parse_declaration_file(&path).unwrap().name, "lab");
        assert!(parse_declaration_file(&dir.path().join("missing.yaml")).is_err());
    }
}
