//! Manifest sets: typed views over rendered documents.
//!
//! The renderer produces templates, each holding zero or more YAML documents
//! separated by `---` lines. Building a [`ManifestSet`] parses every
//! document, extracts its identity, and moves documents annotated as hooks
//! into a separate list. The stored manifest text is produced by
//! [`ManifestSet::manifest_text`] and can be parsed back with
//! [`ManifestSet::parse_manifest`] without re-rendering.

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ManifestError;
use crate::hook::{Hook, HookDeletePolicy, HookPhase};
use crate::kind::ResourceKind;

/// Annotation keys understood by keel.
pub mod annotations {
    /// Comma-separated hook phases.
    pub const HOOK: &str = "keel.sh/hook";
    /// Signed integer sort key for hooks.
    pub const HOOK_WEIGHT: &str = "keel.sh/hook-weight";
    /// Comma-separated hook delete policies.
    pub const HOOK_DELETE_POLICY: &str = "keel.sh/hook-delete-policy";
    /// Resource policy; `keep` excludes a resource from deletion.
    pub const RESOURCE_POLICY: &str = "keel.sh/resource-policy";
    /// Owning release name, set on apply.
    pub const RELEASE_NAME: &str = "keel.sh/release-name";
    /// Owning release namespace, set on apply.
    pub const RELEASE_NAMESPACE: &str = "keel.sh/release-namespace";

    pub const RESOURCE_POLICY_KEEP: &str = "keep";
}

const SOURCE_PREFIX: &str = "# Source: ";

/// A rendered template file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderedTemplate {
    pub path: String,
    pub content: String,
}

impl RenderedTemplate {
    pub fn new(path: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            content: content.into(),
        }
    }
}

/// Full address of a resource, including its API version.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ResourceKey {
    pub api_version: String,
    pub kind: ResourceKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    pub name: String,
}

impl ResourceKey {
    /// API group, empty for the core group.
    pub fn group(&self) -> &str {
        self.api_version
            .split_once('/')
            .map(|(group, _)| group)
            .unwrap_or("")
    }

    /// Extract the key of a parsed document.
    ///
    /// Namespaced kinds without `metadata.namespace` land in
    /// `default_namespace`; cluster-scoped kinds never carry one.
    pub fn from_object(
        source: &str,
        object: &Value,
        default_namespace: &str,
    ) -> Result<Self, ManifestError> {
        resource_key(source, object, default_namespace)
    }

    /// Version-independent identity used to match objects across revisions.
    pub fn identity(&self) -> ResourceIdentity {
        ResourceIdentity {
            group: self.group().to_string(),
            kind: self.kind.clone(),
            namespace: self.namespace.clone(),
            name: self.name.clone(),
        }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{} {}/{}", self.api_version, self.kind, ns, self.name),
            None => write!(f, "{}/{} {}", self.api_version, self.kind, self.name),
        }
    }
}

/// Identity of an object regardless of the API version it is served at.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ResourceIdentity {
    pub group: String,
    pub kind: ResourceKind,
    pub namespace: Option<String>,
    pub name: String,
}

impl fmt::Display for ResourceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let group = if self.group.is_empty() { "core" } else { &self.group };
        match &self.namespace {
            Some(ns) => write!(f, "{}.{} {}/{}", self.kind, group, ns, self.name),
            None => write!(f, "{}.{} {}", self.kind, group, self.name),
        }
    }
}

/// One regular (non-hook) resource document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// Template path the document came from.
    pub source: String,
    pub key: ResourceKey,
    /// Document text as rendered (trimmed).
    pub raw: String,
    /// Parsed document.
    pub object: Value,
}

impl ManifestEntry {
    /// Value of a `metadata.annotations` entry.
    pub fn annotation(&self, name: &str) -> Option<&str> {
        annotation(&self.object, name)
    }

    /// Returns true if the resource must survive deletion of its release.
    pub fn is_kept(&self) -> bool {
        self.annotation(annotations::RESOURCE_POLICY) == Some(annotations::RESOURCE_POLICY_KEEP)
    }
}

/// Ordered resources and hooks of a single rendering.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ManifestSet {
    pub resources: Vec<ManifestEntry>,
    pub hooks: Vec<Hook>,
}

impl ManifestSet {
    /// Build a manifest set from rendered templates.
    ///
    /// Namespaced resources without an explicit namespace are placed in
    /// `default_namespace`. Declaration order is preserved for both
    /// resources and hooks.
    pub fn from_templates(
        templates: &[RenderedTemplate],
        default_namespace: &str,
    ) -> Result<Self, ManifestError> {
        let mut set = ManifestSet::default();
        let mut seen = HashSet::new();

        for template in templates {
            for doc in split_documents(&template.content) {
                let Some(object) = parse_document(&template.path, doc)? else {
                    continue;
                };
                let key = resource_key(&template.path, &object, default_namespace)?;

                if annotation(&object, annotations::HOOK).is_some() {
                    set.hooks
                        .push(build_hook(&template.path, key, doc.trim(), &object)?);
                    continue;
                }

                if !seen.insert(key.identity()) {
                    return Err(ManifestError::Duplicate {
                        source_path: template.path.clone(),
                        identity: key.identity().to_string(),
                    });
                }

                set.resources.push(ManifestEntry {
                    source: template.path.clone(),
                    key,
                    raw: doc.trim().to_string(),
                    object,
                });
            }
        }

        Ok(set)
    }

    /// Parse a stored manifest back into entries.
    pub fn parse_manifest(
        manifest: &str,
        default_namespace: &str,
    ) -> Result<Vec<ManifestEntry>, ManifestError> {
        let mut entries = Vec::new();

        for doc in split_documents(manifest) {
            let (source, body) = match doc.trim_start().strip_prefix(SOURCE_PREFIX) {
                Some(rest) => match rest.split_once('\n') {
                    Some((source, body)) => (source.trim().to_string(), body),
                    None => (rest.trim().to_string(), ""),
                },
                None => (String::new(), doc),
            };

            let Some(object) = parse_document(&source, body)? else {
                continue;
            };
            let key = resource_key(&source, &object, default_namespace)?;
            entries.push(ManifestEntry {
                source,
                key,
                raw: body.trim().to_string(),
                object,
            });
        }

        Ok(entries)
    }

    /// Stored manifest text for the regular resources.
    pub fn manifest_text(&self) -> String {
        let mut out = String::new();
        for entry in &self.resources {
            out.push_str("---\n");
            out.push_str(SOURCE_PREFIX);
            out.push_str(&entry.source);
            out.push('\n');
            out.push_str(&entry.raw);
            out.push('\n');
        }
        out
    }
}

/// Split a multi-document string on `---` separator lines.
fn split_documents(content: &str) -> Vec<&str> {
    let mut docs = Vec::new();
    let mut start = 0;
    let mut offset = 0;

    for line in content.split_inclusive('\n') {
        if line.trim_end() == "---" {
            docs.push(&content[start..offset]);
            start = offset + line.len();
        }
        offset += line.len();
    }
    docs.push(&content[start..]);

    docs.into_iter()
        .filter(|doc| !doc.trim().is_empty())
        .collect()
}

/// Parse one document; comment-only documents yield `None`.
fn parse_document(source: &str, doc: &str) -> Result<Option<Value>, ManifestError> {
    let value: Value = serde_yaml::from_str(doc).map_err(|e| ManifestError::Parse {
        source_path: source.to_string(),
        message: e.to_string(),
    })?;

    match value {
        Value::Null => Ok(None),
        Value::Object(_) => Ok(Some(value)),
        _ => Err(ManifestError::NotAnObject {
            source_path: source.to_string(),
        }),
    }
}

fn required_str<'a>(
    source: &str,
    object: &'a Value,
    pointer: &str,
    field: &'static str,
) -> Result<&'a str, ManifestError> {
    object
        .pointer(pointer)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ManifestError::MissingField {
            source_path: source.to_string(),
            field,
        })
}

fn resource_key(
    source: &str,
    object: &Value,
    default_namespace: &str,
) -> Result<ResourceKey, ManifestError> {
    let api_version = required_str(source, object, "/apiVersion", "apiVersion")?;
    let kind = ResourceKind::from_name(required_str(source, object, "/kind", "kind")?);
    let name = required_str(source, object, "/metadata/name", "metadata.name")?;

    let namespace = if kind.is_cluster_scoped() {
        None
    } else {
        Some(
            object
                .pointer("/metadata/namespace")
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .unwrap_or(default_namespace)
                .to_string(),
        )
    };

    Ok(ResourceKey {
        api_version: api_version.to_string(),
        kind,
        namespace,
        name: name.to_string(),
    })
}

fn annotation<'a>(object: &'a Value, name: &str) -> Option<&'a str> {
    object
        .get("metadata")?
        .get("annotations")?
        .get(name)?
        .as_str()
}

fn comma_list(value: &str) -> impl Iterator<Item = &str> {
    value.split(',').map(str::trim).filter(|s| !s.is_empty())
}

fn build_hook(
    source: &str,
    key: ResourceKey,
    raw: &str,
    object: &Value,
) -> Result<Hook, ManifestError> {
    let invalid = |annotation: &'static str, value: &str| ManifestError::InvalidHookAnnotation {
        source_path: source.to_string(),
        annotation,
        value: value.to_string(),
    };

    let phases_value = annotation(object, annotations::HOOK).unwrap_or_default();
    let phases = comma_list(phases_value)
        .map(|p| p.parse::<HookPhase>().map_err(|v| invalid(annotations::HOOK, &v)))
        .collect::<Result<Vec<_>, _>>()?;
    if phases.is_empty() {
        return Err(invalid(annotations::HOOK, phases_value));
    }

    let weight = match annotation(object, annotations::HOOK_WEIGHT) {
        Some(w) => w
            .trim()
            .parse::<i32>()
            .map_err(|_| invalid(annotations::HOOK_WEIGHT, w))?,
        None => 0,
    };

    let mut delete_policies = match annotation(object, annotations::HOOK_DELETE_POLICY) {
        Some(p) => comma_list(p)
            .map(|v| {
                v.parse::<HookDeletePolicy>()
                    .map_err(|v| invalid(annotations::HOOK_DELETE_POLICY, &v))
            })
            .collect::<Result<Vec<_>, _>>()?,
        None => Vec::new(),
    };
    if delete_policies.is_empty() {
        delete_policies.push(HookDeletePolicy::BeforeHookCreation);
    }

    Ok(Hook {
        path: source.to_string(),
        key,
        manifest: raw.to_string(),
        phases,
        weight,
        delete_policies,
        last_run: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const APP: &str = r#"apiVersion: v1
kind: ConfigMap
metadata:
  name: demo-config
data:
  mode: fast
---
apiVersion: apps/v1
kind: Deployment
metadata:
  name: demo
  namespace: apps
spec:
  replicas: 2
"#;

    const HOOK: &str = r#"apiVersion: batch/v1
kind: Job
metadata:
  name: demo-migrate
  annotations:
    keel.sh/hook: pre-install, pre-upgrade
    keel.sh/hook-weight: "-5"
spec: {}
"#;

    #[test]
    fn test_from_templates_splits_resources_and_hooks() {
        let templates = vec![
            RenderedTemplate::new("templates/app.yaml", APP),
            RenderedTemplate::new("templates/migrate.yaml", HOOK),
        ];

        let set = ManifestSet::from_templates(&templates, "default").unwrap();
        assert_eq!(set.resources.len(), 2);
        assert_eq!(set.hooks.len(), 1);

        let config = &set.resources[0];
        assert_eq!(config.key.kind, ResourceKind::ConfigMap);
        assert_eq!(config.key.namespace.as_deref(), Some("default"));
        assert_eq!(set.resources[1].key.namespace.as_deref(), Some("apps"));

        let hook = &set.hooks[0];
        assert_eq!(hook.phases, vec![HookPhase::PreInstall, HookPhase::PreUpgrade]);
        assert_eq!(hook.weight, -5);
        assert_eq!(
            hook.delete_policies,
            vec![HookDeletePolicy::BeforeHookCreation]
        );
    }

    #[test]
    fn test_manifest_text_parses_back_identically() {
        let templates = vec![RenderedTemplate::new("templates/app.yaml", APP)];
        let set = ManifestSet::from_templates(&templates, "default").unwrap();

        let text = set.manifest_text();
        assert!(text.starts_with("---\n# Source: templates/app.yaml\n"));

        let parsed = ManifestSet::parse_manifest(&text, "default").unwrap();
        assert_eq!(parsed, set.resources);
    }

    #[test]
    fn test_empty_and_comment_documents_are_skipped() {
        let content = "---\n# nothing here\n---\n\n---\napiVersion: v1\nkind: Secret\nmetadata:\n  name: s\n";
        let templates = vec![RenderedTemplate::new("t.yaml", content)];
        let set = ManifestSet::from_templates(&templates, "ns").unwrap();
        assert_eq!(set.resources.len(), 1);
    }

    #[test]
    fn test_cluster_scoped_kinds_have_no_namespace() {
        let content = "apiVersion: v1\nkind: Namespace\nmetadata:\n  name: team\n";
        let templates = vec![RenderedTemplate::new("ns.yaml", content)];
        let set = ManifestSet::from_templates(&templates, "default").unwrap();
        assert_eq!(set.resources[0].key.namespace, None);
    }

    #[test]
    fn test_missing_name_is_rejected() {
        let content = "apiVersion: v1\nkind: ConfigMap\nmetadata: {}\n";
        let templates = vec![RenderedTemplate::new("bad.yaml", content)];
        let err = ManifestSet::from_templates(&templates, "default").unwrap_err();
        assert!(matches!(
            err,
            ManifestError::MissingField {
                field: "metadata.name",
                ..
            }
        ));
    }

    #[test]
    fn test_duplicate_identity_is_rejected() {
        let content = "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: a\n---\napiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: a\n";
        let templates = vec![RenderedTemplate::new("dup.yaml", content)];
        let err = ManifestSet::from_templates(&templates, "default").unwrap_err();
        assert!(matches!(err, ManifestError::Duplicate { .. }));
    }

    #[test]
    fn test_bad_hook_weight_is_rejected() {
        let content = "apiVersion: v1\nkind: Pod\nmetadata:\n  name: p\n  annotations:\n    keel.sh/hook: post-install\n    keel.sh/hook-weight: heavy\n";
        let templates = vec![RenderedTemplate::new("hook.yaml", content)];
        let err = ManifestSet::from_templates(&templates, "default").unwrap_err();
        assert!(matches!(
            err,
            ManifestError::InvalidHookAnnotation {
                annotation: annotations::HOOK_WEIGHT,
                ..
            }
        ));
    }

    #[test]
    fn test_identity_ignores_api_version() {
        let a = ResourceKey {
            api_version: "apps/v1beta2".to_string(),
            kind: ResourceKind::Deployment,
            namespace: Some("ns".to_string()),
            name: "web".to_string(),
        };
        let b = ResourceKey {
            api_version: "apps/v1".to_string(),
            ..a.clone()
        };
        assert_eq!(a.identity(), b.identity());
        assert_ne!(a, b);
    }

    #[test]
    fn test_keep_policy() {
        let content = "apiVersion: v1\nkind: PersistentVolumeClaim\nmetadata:\n  name: data\n  annotations:\n    keel.sh/resource-policy: keep\n";
        let templates = vec![RenderedTemplate::new("pvc.yaml", content)];
        let set = ManifestSet::from_templates(&templates, "default").unwrap();
        assert!(set.resources[0].is_kept());
    }
}
