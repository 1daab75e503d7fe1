//! Template file loading
//!
//! Format is chosen by extension: `.yaml`/`.yml`, `.toml` or `.json`.

use anyhow::{Context, Result, bail};
use convergence::Template;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemplateFormat {
    Yaml,
    Toml,
    Json,
}

impl TemplateFormat {
    pub fn from_path(path: &Path) -> Option<Self> {
        match path.extension()?.to_str()? {
            "yaml" | "yml" => Some(Self::Yaml),
            "toml" => Some(Self::Toml),
            "json" => Some(Self::Json),
            _ => None,
        }
    }
}

/// Load and parse a template file
pub fn load(path: &Path) -> Result<Template> {
    let Some(format) = TemplateFormat::from_path(path) else {
        bail!(
            "Unsupported template format: {} (expected .yaml, .yml, .toml or .json)",
            path.display()
        );
    };

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Could not read template: {}", path.display()))?;

    let template = parse(&content, format)
        .with_context(|| format!("Invalid template: {}", path.display()))?;

    if template.name.trim().is_empty() {
        bail!("Template {} has no name", path.display());
    }

    log::debug!(
        "Loaded template {} {} from {}",
        template.name,
        template.version,
        path.display()
    );
    Ok(template)
}

pub fn parse(content: &str, format: TemplateFormat) -> Result<Template> {
    let template = match format {
        TemplateFormat::Yaml => serde_yaml::from_str(content)?,
        TemplateFormat::Toml => toml::from_str(content)?,
        TemplateFormat::Json => serde_json::from_str(content)?,
    };
    Ok(template)
}

// ============================================================================
// Tests
// ============================================================================
