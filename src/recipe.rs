// src/recipe.rs

//! Recipe model
//!
//! A recipe describes how to install one tool as an ordered list of steps.
//! Each step names an action; every other key in the step table is a
//! parameter for that action, except `when`, `note` and `description`.
//!
//! ```toml
//! [metadata]
//! name = "ripgrep"
//!
//! [[steps]]
//! action = "github_archive"
//! repo = "BurntSushi/ripgrep"
//! asset_pattern = "ripgrep-{version}-x86_64-unknown-linux-musl.tar.gz"
//! binaries = ["rg"]
//! when = { os = ["linux"] }
//!
//! [verify]
//! command = "rg --version"
//! ```

use crate::error::{Error, Result};
use crate::hash;
use crate::security;
use crate::params::Params;
use crate::platform::WhenClause;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Recipe {
    pub metadata: Metadata,
    #[serde(default)]
    pub steps: Vec<Step>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verify: Option<Verify>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub homepage: String,
    /// `tool` (default) or `library`
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub recipe_type: Option<String>,
    /// Replaces every step's install-time dependencies
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<String>,
    /// Replaces every step's runtime dependencies
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub runtime_dependencies: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra_dependencies: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra_runtime_dependencies: Vec<String>,
}

/// One recipe step: an action name, its parameters and an optional platform filter
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when: Option<WhenClause>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(flatten)]
    pub params: Params,
}

impl Step {
    pub fn new(action: impl Into<String>, params: Params) -> Self {
        Self {
            action: action.into(),
            params,
            ..Default::default()
        }
    }
}

/// Post-install check
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verify {
    pub command: String,
    /// Substring expected in the command's output; `{version}` is expanded
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub pattern: String,
}

impl Recipe {
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let recipe: Recipe = toml::from_str(content)
            .map_err(|e| Error::ParseError(format!("Invalid recipe: {}", e)))?;
        if recipe.metadata.name.is_empty() {
            return Err(Error::ParseError("recipe metadata.name is required".to_string()));
        }
        if !security::is_valid_tool_name(&recipe.metadata.name) {
            return Err(Error::ParseError(format!(
                "recipe name '{}' is not a valid tool name",
                recipe.metadata.name
            )));
        }
        Ok(recipe)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            Error::IoError(format!("Failed to read recipe {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&content)
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    /// Stable content hash, used to tie a plan back to the recipe it came from
    pub fn content_hash(&self) -> Result<String> {
        let canonical = serde_json::to_vec(self)?;
        Ok(hash::sha256(&canonical))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RECIPE: &str = r#"
[metadata]
name = "jq"
extra_dependencies = ["oniguruma@6.9"]

[[steps]]
action = "download"
url = "https://github.com/jqlang/jq/releases/download/jq-{version}/jq-{os}-{arch}"
dest = "jq"
when = { os = ["linux", "darwin"] }

[[steps]]
action = "chmod"
files = ["jq"]

[verify]
command = "jq --version"
pattern = "{version}"
"#;

    #[test]
    fn test_parse_flattens_params() {
        let recipe = Recipe::from_toml_str(RECIPE).unwrap();
        assert_eq!(recipe.name(), "jq");
        assert_eq!(recipe.steps.len(), 2);

        let download = &recipe.steps[0];
        assert_eq!(download.action, "download");
        assert_eq!(download.params.get("dest").and_then(|v| v.as_str()), Some("jq"));
        assert!(!download.params.contains_key("action"));
        assert!(!download.params.contains_key("when"));
        assert_eq!(download.when.as_ref().unwrap().os, vec!["linux", "darwin"]);

        assert_eq!(recipe.metadata.extra_dependencies, vec!["oniguruma@6.9"]);
        assert_eq!(recipe.verify.unwrap().command, "jq --version");
    }

    #[test]
    fn test_missing_name_rejected() {
        let err = Recipe::from_toml_str("[metadata]\nname = \"\"\n").unwrap_err();
        assert!(err.to_string().contains("metadata.name"));
    }

    #[test]
    fn test_path_like_name_rejected() {
        let err = Recipe::from_toml_str("[metadata]\nname = \"../../victim\"\n").unwrap_err();
        assert!(err.to_string().contains("not a valid tool name"));
    }

    #[test]
    fn test_content_hash_is_stable() {
        let a = Recipe::from_toml_str(RECIPE).unwrap();
        let b = Recipe::from_toml_str(RECIPE).unwrap();
        assert_eq!(a.content_hash().unwrap(), b.content_hash().unwrap());
    }
}
