//! Manifest template rendering.
//!
//! Templates are YAML files with `{{NAME}}` placeholders. Rendering is strict:
//! a placeholder without a matching parameter fails, extra parameters are
//! ignored. The rendered documents are wrapped into a `v1/List` so that edit
//! paths can always start at `items.0.`.

use std::io::Write;
use std::path::{Path, PathBuf};

use handlebars::Handlebars;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::debug;

use crate::error::{E2eError, E2eResult};
use crate::random::random_string;

/// Renders manifest templates from disk.
pub struct ManifestRenderer {
    handlebars: Handlebars<'static>,
}

impl Default for ManifestRenderer {
    fn default() -> Self {
        Self::new()
    }
}

impl ManifestRenderer {
    #[must_use]
    pub fn new() -> Self {
        let mut handlebars = Handlebars::new();
        handlebars.register_escape_fn(handlebars::no_escape);
        handlebars.set_strict_mode(true);
        Self { handlebars }
    }

    /// Render a template string with the given parameters.
    ///
    /// # Errors
    ///
    /// Returns an error if a placeholder has no parameter or the template is
    /// malformed.
    pub fn render_str(
        &self,
        name: &str,
        source: &str,
        params: &[(&str, &str)],
    ) -> E2eResult<String> {
        let context: Map<String, Value> = params
            .iter()
            .map(|(key, value)| ((*key).to_string(), Value::String((*value).to_string())))
            .collect();
        self.handlebars
            .render_template(source, &context)
            .map_err(|e| E2eError::Template {
                template: name.to_string(),
                reason: e.to_string(),
            })
    }

    /// Read and render a template file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or rendering fails.
    pub fn render_file(&self, template: &Path, params: &[(&str, &str)]) -> E2eResult<String> {
        let source = std::fs::read_to_string(template).map_err(|e| E2eError::Template {
            template: template.display().to_string(),
            reason: e.to_string(),
        })?;
        self.render_str(&template.display().to_string(), &source, params)
    }

    /// Render a template file into a `v1/List` JSON document.
    ///
    /// # Errors
    ///
    /// Returns an error if rendering fails or the output is not valid YAML.
    pub fn render_list(&self, template: &Path, params: &[(&str, &str)]) -> E2eResult<Value> {
        let rendered = self.render_file(template, params)?;
        yaml_to_list(&rendered)
    }
}

/// Parse one or more YAML documents into a `v1/List`.
///
/// A single document that already is a `List` is returned unchanged.
///
/// # Errors
///
/// Returns an error if any document is not valid YAML.
pub fn yaml_to_list(rendered: &str) -> E2eResult<Value> {
    let mut items = Vec::new();
    for document in serde_yaml::Deserializer::from_str(rendered) {
        let value = Value::deserialize(document)?;
        if !value.is_null() {
            items.push(value);
        }
    }
    if items.len() == 1 && items[0].get("kind").and_then(Value::as_str) == Some("List") {
        return Ok(items.remove(0));
    }
    Ok(json!({
        "apiVersion": "v1",
        "kind": "List",
        "items": items,
    }))
}

/// Write a manifest as pretty JSON to `<dir>/<namespace>-<random>config.json`.
///
/// The file is kept on disk so failed runs can be inspected.
///
/// # Errors
///
/// Returns an error if the file cannot be created or written.
pub fn write_manifest(dir: &Path, namespace: &str, doc: &Value) -> E2eResult<PathBuf> {
    std::fs::create_dir_all(dir)?;
    let prefix = if namespace.is_empty() {
        "cluster-".to_string()
    } else {
        format!("{namespace}-")
    };
    let mut file = tempfile::Builder::new()
        .prefix(&prefix)
        .suffix(&format!("{}config.json", random_string()))
        .rand_bytes(0)
        .tempfile_in(dir)?;
    serde_json::to_writer_pretty(file.as_file_mut(), doc)?;
    file.as_file_mut().flush()?;
    let (_, path) = file.keep().map_err(|e| E2eError::Io {
        reason: e.error.to_string(),
    })?;
    debug!(path = %path.display(), "Wrote manifest");
    Ok(path)
}
