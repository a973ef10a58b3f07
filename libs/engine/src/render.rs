//! Charts and the renderer interface.
//!
//! Template rendering is an external collaborator. The engine hands a chart,
//! the merged configuration and a [`RenderContext`] to a [`Renderer`] and
//! expects ordered [`RenderedTemplate`]s back. Identical inputs must produce
//! identical output.
//!
//! [`PlaceholderRenderer`] is a minimal deterministic implementation used in
//! tests and for charts without template logic.

use std::collections::HashSet;

use async_trait::async_trait;
use keel_release::{ChartRef, RenderedTemplate};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

use crate::digest::content_digest;

/// Chart metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChartMetadata {
    pub name: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// An unrendered template file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChartTemplate {
    pub path: String,
    pub content: String,
}

impl ChartTemplate {
    pub fn new(path: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            content: content.into(),
        }
    }

    fn file_name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }

    /// Partials (`_helpers.tpl`) are not rendered on their own.
    pub fn is_partial(&self) -> bool {
        self.file_name().starts_with('_')
    }

    pub fn is_notes(&self) -> bool {
        self.file_name() == "NOTES.txt"
    }
}

/// A resolved chart, dependencies included.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chart {
    pub metadata: ChartMetadata,
    /// Default configuration.
    #[serde(default)]
    pub values: Value,
    pub templates: Vec<ChartTemplate>,
}

impl Chart {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            metadata: ChartMetadata {
                name: name.into(),
                version: version.into(),
                app_version: None,
                description: None,
            },
            values: Value::Object(Default::default()),
            templates: Vec::new(),
        }
    }

    pub fn with_values(mut self, values: Value) -> Self {
        self.values = values;
        self
    }

    pub fn with_template(mut self, path: impl Into<String>, content: impl Into<String>) -> Self {
        self.templates.push(ChartTemplate::new(path, content));
        self
    }

    /// Check structural requirements before rendering.
    pub fn validate(&self) -> Result<(), String> {
        if self.metadata.name.trim().is_empty() {
            return Err("chart name is empty".to_string());
        }
        if self.metadata.version.trim().is_empty() {
            return Err(format!("chart {} has no version", self.metadata.name));
        }
        if !(self.values.is_object() || self.values.is_null()) {
            return Err(format!(
                "chart {} default values must be a map",
                self.metadata.name
            ));
        }
        let mut paths = HashSet::new();
        for template in &self.templates {
            if !paths.insert(template.path.as_str()) {
                return Err(format!("duplicate template path {}", template.path));
            }
        }
        Ok(())
    }

    /// Digest over metadata, default values and templates.
    pub fn digest(&self) -> String {
        let templates: Vec<Value> = self
            .templates
            .iter()
            .map(|t| json!({"path": t.path, "content": t.content}))
            .collect();
        content_digest(&json!({
            "name": self.metadata.name,
            "version": self.metadata.version,
            "appVersion": self.metadata.app_version,
            "values": self.values,
            "templates": templates,
        }))
    }

    pub fn reference(&self) -> ChartRef {
        ChartRef {
            name: self.metadata.name.clone(),
            version: self.metadata.version.clone(),
            digest: self.digest(),
        }
    }
}

/// What the target cluster supports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    pub cluster_version: String,
    /// Served API versions, e.g. `apps/v1`.
    pub api_versions: Vec<String>,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            cluster_version: "v1.30.0".to_string(),
            api_versions: ["v1", "apps/v1", "batch/v1", "networking.k8s.io/v1"]
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }
}

/// Release information visible to templates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderContext {
    pub release_name: String,
    pub namespace: String,
    pub revision: u32,
    pub is_install: bool,
    pub is_upgrade: bool,
    pub capabilities: Capabilities,
}

/// Renderer output.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderOutput {
    /// Rendered manifests, in chart order.
    pub templates: Vec<RenderedTemplate>,
    /// Rendered `NOTES.txt`, if the chart has one.
    pub notes: Option<String>,
}

/// Rendering failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RenderError {
    /// A template expression is malformed or unknown.
    #[error("{path}: {message}")]
    Template { path: String, message: String },

    /// A referenced configuration value is not set.
    #[error("{path}: value '{key}' is not set")]
    MissingValue { path: String, key: String },
}

/// Turns a chart and configuration into manifests.
#[async_trait]
pub trait Renderer: Send + Sync {
    async fn render(
        &self,
        chart: &Chart,
        values: &Value,
        context: &RenderContext,
    ) -> Result<RenderOutput, RenderError>;
}

/// Substitutes `{{ expr }}` placeholders; no other template logic.
///
/// Supported expressions: `values.<dotted.path>`, `release.name`,
/// `release.namespace`, `release.revision`, `chart.name`, `chart.version`
/// and `capabilities.version`. Maps and lists render as inline JSON, which
/// is valid YAML flow syntax.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlaceholderRenderer;

impl PlaceholderRenderer {
    pub fn new() -> Self {
        Self
    }

    fn render_text(
        &self,
        path: &str,
        content: &str,
        chart: &Chart,
        values: &Value,
        context: &RenderContext,
    ) -> Result<String, RenderError> {
        let mut out = String::with_capacity(content.len());
        let mut rest = content;

        while let Some(start) = rest.find("{{") {
            out.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            let end = after.find("}}").ok_or_else(|| RenderError::Template {
                path: path.to_string(),
                message: "unclosed '{{'".to_string(),
            })?;
            let expr = after[..end].trim();
            out.push_str(&self.evaluate(path, expr, chart, values, context)?);
            rest = &after[end + 2..];
        }
        out.push_str(rest);
        Ok(out)
    }

    fn evaluate(
        &self,
        path: &str,
        expr: &str,
        chart: &Chart,
        values: &Value,
        context: &RenderContext,
    ) -> Result<String, RenderError> {
        if let Some(key) = expr.strip_prefix("values.") {
            let value = key
                .split('.')
                .try_fold(values, |v, segment| v.get(segment))
                .filter(|v| !v.is_null())
                .ok_or_else(|| RenderError::MissingValue {
                    path: path.to_string(),
                    key: key.to_string(),
                })?;
            return Ok(format_value(value));
        }

        let rendered = match expr {
            "release.name" => context.release_name.clone(),
            "release.namespace" => context.namespace.clone(),
            "release.revision" => context.revision.to_string(),
            "chart.name" => chart.metadata.name.clone(),
            "chart.version" => chart.metadata.version.clone(),
            "capabilities.version" => context.capabilities.cluster_version.clone(),
            other => {
                return Err(RenderError::Template {
                    path: path.to_string(),
                    message: format!("unknown expression '{other}'"),
                })
            }
        };
        Ok(rendered)
    }
}

fn format_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[async_trait]
impl Renderer for PlaceholderRenderer {
    async fn render(
        &self,
        chart: &Chart,
        values: &Value,
        context: &RenderContext,
    ) -> Result<RenderOutput, RenderError> {
        let mut output = RenderOutput::default();

        for template in &chart.templates {
            if template.is_partial() {
                continue;
            }
            let text =
                self.render_text(&template.path, &template.content, chart, values, context)?;
            if template.is_notes() {
                output.notes = Some(text);
            } else {
                output
                    .templates
                    .push(RenderedTemplate::new(template.path.clone(), text));
            }
        }

        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> RenderContext {
        RenderContext {
            release_name: "demo".to_string(),
            namespace: "apps".to_string(),
            revision: 3,
            is_install: false,
            is_upgrade: true,
            capabilities: Capabilities::default(),
        }
    }

    fn chart() -> Chart {
        Chart::new("web", "1.2.0")
            .with_values(json!({"image": {"tag": "1"}, "ports": [80]}))
            .with_template("templates/_helpers.tpl", "{{ broken")
            .with_template(
                "templates/cm.yaml",
                "name: {{ release.name }}-{{ chart.name }}\ntag: \"{{ values.image.tag }}\"\nports: {{values.ports}}\n",
            )
            .with_template("templates/NOTES.txt", "Installed {{ release.name }} rev {{ release.revision }}")
    }

    #[tokio::test]
    async fn test_placeholders_and_notes() {
        let chart = chart();
        let output = PlaceholderRenderer
            .render(&chart, &chart.values, &context())
            .await
            .unwrap();

        assert_eq!(output.templates.len(), 1);
        assert_eq!(
            output.templates[0].content,
            "name: demo-web\ntag: \"1\"\nports: [80]\n"
        );
        assert_eq!(output.notes.as_deref(), Some("Installed demo rev 3"));
    }

    #[tokio::test]
    async fn test_missing_value() {
        let chart = Chart::new("web", "1.0.0").with_template("t.yaml", "x: {{ values.nope }}");
        let err = PlaceholderRenderer
            .render(&chart, &json!({}), &context())
            .await
            .unwrap_err();
        assert_eq!(
            err,
            RenderError::MissingValue {
                path: "t.yaml".to_string(),
                key: "nope".to_string()
            }
        );
    }

    #[test]
    fn test_digest_tracks_content() {
        let a = chart();
        let mut b = chart();
        assert_eq!(a.digest(), b.digest());
        b.templates[1].content.push('\n');
        assert_ne!(a.digest(), b.digest());
    }

    #[test]
    fn test_validate() {
        assert!(chart().validate().is_ok());
        assert!(Chart::new("", "1").validate().is_err());
        let dup = chart().with_template("templates/cm.yaml", "");
        assert!(dup.validate().is_err());
    }
}
