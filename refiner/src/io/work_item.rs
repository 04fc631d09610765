//! Work item files (`item.toml`): one fuzz target to refine.
//!
//! ```toml
//! id = "libpng-read-info"
//!
//! [values]
//! LANGUAGE = "C"
//! FUNCTION_SIGNATURE = "void png_read_info(png_structp, png_infop)"
//! PROJECT = "libpng"
//! PROJECT_DIR = "../libpng"
//! INSIGHTS = ""
//! SUGGESTIONS = ""
//!
//! [files]
//! FUZZ_TARGET = "libpng_read_fuzzer.cc"
//! BUILD_TEXT = "build.sh"
//! ```
//!
//! `[files]` entries supply a placeholder from a file, relative to the item
//! file. A relative `PROJECT_DIR` is resolved the same way.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use serde::Deserialize;

use crate::error::ConfigError;
use crate::io::prompt::{Placeholder, PromptVars};

/// File name whose parent directory names the item.
pub const DEFAULT_ITEM_FILE: &str = "item.toml";

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct WorkItem {
    /// Defaults to the directory name for `item.toml`, otherwise the file stem.
    pub id: Option<String>,
    pub values: BTreeMap<String, String>,
    pub files: BTreeMap<String, PathBuf>,
}

/// A work item with its placeholders resolved.
#[derive(Debug, Clone)]
pub struct LoadedItem {
    pub id: String,
    pub vars: PromptVars,
}

impl WorkItem {
    pub fn load(path: &Path) -> Result<Self> {
        let contents =
            fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))
    }

    /// Read `[files]` and merge with `[values]` into validated prompt variables.
    pub fn resolve(&self, base_dir: &Path) -> Result<PromptVars> {
        let mut values = self.values.clone();
        for (key, rel) in &self.files {
            if values.keys().any(|existing| existing.eq_ignore_ascii_case(key)) {
                return Err(ConfigError::Invalid(format!(
                    "placeholder {key} is set in both [values] and [files]"
                ))
                .into());
            }
            let path = base_dir.join(rel);
            let text = fs::read_to_string(&path)
                .with_context(|| format!("read {key} from {}", path.display()))?;
            values.insert(key.clone(), text);
        }
        if let Some((key, dir)) = values
            .iter_mut()
            .find(|(key, _)| Placeholder::parse(key) == Some(Placeholder::ProjectDir))
        {
            let dir_path = Path::new(dir.trim());
            if dir_path.is_relative() && !dir_path.as_os_str().is_empty() {
                let resolved = base_dir.join(dir_path);
                *dir = resolved
                    .to_str()
                    .ok_or_else(|| anyhow!("{key} is not valid UTF-8: {}", resolved.display()))?
                    .to_string();
            }
        }
        Ok(PromptVars::from_map(values)?)
    }
}

/// Load and resolve an item file. The id falls back to the parent directory name.
pub fn load_item(path: &Path) -> Result<LoadedItem> {
    let item = WorkItem::load(path)?;
    let base_dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    let id = match &item.id {
        Some(id) => id.clone(),
        None => default_id(path)?,
    };
    validate_id(&id)?;
    let vars = item
        .resolve(base_dir)
        .with_context(|| format!("resolve placeholders in {}", path.display()))?;
    Ok(LoadedItem { id, vars })
}

/// Name an item without an explicit id: `item.toml` takes its directory
/// name, any other file its stem.
fn default_id(path: &Path) -> Result<String> {
    let is_item_toml = path.file_name().is_some_and(|name| name == DEFAULT_ITEM_FILE);
    let from_dir = if is_item_toml {
        path.canonicalize()
            .ok()
            .and_then(|p| p.parent().and_then(|d| d.file_name()).map(|n| n.to_os_string()))
    } else {
        None
    };
    let name = match from_dir {
        Some(name) => name,
        None => path
            .file_stem()
            .ok_or_else(|| anyhow!("cannot derive id from {}", path.display()))?
            .to_os_string(),
    };
    Ok(name.to_string_lossy().into_owned())
}

/// Validate that an id is safe for use as a directory name.
pub fn validate_id(id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(ConfigError::Invalid("id must not be empty".to_string()).into());
    }
    if id
        .chars()
        .any(|c| !(c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-'))
        || id == "."
        || id == ".."
    {
        return Err(
            ConfigError::Invalid(format!("id must be [A-Za-z0-9._-] only (got '{id}')")).into(),
        );
    }
    Ok(())
}
