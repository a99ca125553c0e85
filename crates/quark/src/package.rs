//! App Package Loader
//!
//! Loads an application directory from disk:
//!
//! ```text
//! my-app/
//!   manifest.json
//!   app.js          (required)
//!   app.css         (optional)
//!   pages/
//!     index.js
//!     index.css     (optional)
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

/// Error type for package loading
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("App path does not exist: {0}")]
    PathNotFound(PathBuf),

    #[error("Manifest not found: {0}")]
    ManifestNotFound(PathBuf),

    #[error("Failed to read {0}: {1}")]
    ReadError(PathBuf, std::io::Error),

    #[error("Failed to parse manifest: {0}")]
    ManifestParseError(#[from] serde_json::Error),

    #[error("Invalid package: {0}")]
    Invalid(String),
}

/// `manifest.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub package: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub version_name: String,
    #[serde(default)]
    pub version_code: u32,
    pub router: RouterInfo,
    /// Extra per-locale strings handed to `$t`.
    #[serde(default)]
    pub resources: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterInfo {
    /// Name of the page shown first.
    pub entry: String,
    /// Page name to page settings. Each page's code lives in `pages/<name>.js`.
    #[serde(default)]
    pub pages: BTreeMap<String, PageInfo>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PageInfo {
    /// Route that opens the page. Defaults to `/<name>`.
    #[serde(default)]
    pub path: Option<String>,
}

/// A page's code and style.
#[derive(Debug, Clone)]
pub struct PageSource {
    pub name: String,
    pub path: String,
    pub script: String,
    pub style: String,
}

/// A loaded application.
#[derive(Debug, Clone)]
pub struct AppPackage {
    pub root: PathBuf,
    pub manifest: Manifest,
    /// Raw manifest, passed to the engine as app metadata.
    pub raw_manifest: Value,
    pub app_script: String,
    pub app_style: String,
    pub pages: BTreeMap<String, PageSource>,
}

impl AppPackage {
    /// Load the package at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, LoadError> {
        let root = path.as_ref();
        if !root.exists() {
            return Err(LoadError::PathNotFound(root.to_path_buf()));
        }
        info!("Loading app from: {}", root.display());

        let manifest_path = root.join("manifest.json");
        if !manifest_path.exists() {
            return Err(LoadError::ManifestNotFound(manifest_path));
        }
        let raw = read(&manifest_path)?;
        let raw_manifest: Value = serde_json::from_str(&raw)?;
        let manifest: Manifest = serde_json::from_value(raw_manifest.clone())?;
        if manifest.package.trim().is_empty() {
            return Err(LoadError::Invalid("manifest package name is empty".into()));
        }
        info!("Loaded manifest: {} ({})", manifest.name, manifest.package);

        let app_script = read(&root.join("app.js"))?;
        let app_style = read_optional(&root.join("app.css"))?;

        let mut pages = BTreeMap::new();
        for (name, page) in &manifest.router.pages {
            let source = Self::load_page(root, name, page)?;
            debug!("Loaded page: {} at {}", source.name, source.path);
            pages.insert(name.clone(), source);
        }
        if !pages.contains_key(&manifest.router.entry) {
            return Err(LoadError::Invalid(format!(
                "entry page '{}' is not declared in router.pages",
                manifest.router.entry
            )));
        }
        info!("Loaded {} pages", pages.len());

        Ok(Self {
            root: root.to_path_buf(),
            manifest,
            raw_manifest,
            app_script,
            app_style,
            pages,
        })
    }

    fn load_page(root: &Path, name: &str, info: &PageInfo) -> Result<PageSource, LoadError> {
        let pages_dir = root.join("pages");
        Ok(PageSource {
            name: name.to_string(),
            path: info.path.clone().unwrap_or_else(|| format!("/{}", name)),
            script: read(&pages_dir.join(format!("{}.js", name)))?,
            style: read_optional(&pages_dir.join(format!("{}.css", name)))?,
        })
    }

    pub fn entry_page(&self) -> Option<&PageSource> {
        self.pages.get(&self.manifest.router.entry)
    }

    /// Find a page by name or route path.
    pub fn resolve(&self, uri: &str) -> Option<&PageSource> {
        let uri = uri.split('?').next().unwrap_or(uri);
        self.pages
            .get(uri.trim_start_matches('/'))
            .or_else(|| self.pages.values().find(|page| page.path == uri))
    }
}

fn read(path: &Path) -> Result<String, LoadError> {
    fs::read_to_string(path).map_err(|e| LoadError::ReadError(path.to_path_buf(), e))
}

fn read_optional(path: &Path) -> Result<String, LoadError> {
    if !path.exists() {
        return Ok(String::new());
    }
    read(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const MANIFEST: &str = r#"{
  "package": "com.example.demo",
  "name": "Demo",
  "versionName": "1.0.0",
  "versionCode": 3,
  "router": {
    "entry": "index",
    "pages": { "index": {}, "detail": { "path": "/detail/view" } }
  }
}"#;

    fn write_app(manifest: &str) -> TempDir {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("manifest.json"), manifest).unwrap();
        fs::write(dir.path().join("app.js"), "module.exports = {};").unwrap();
        fs::create_dir(dir.path().join("pages")).unwrap();
        fs::write(dir.path().join("pages/index.js"), "module.exports = {};").unwrap();
        fs::write(dir.path().join("pages/index.css"), ".a {}").unwrap();
        fs::write(dir.path().join("pages/detail.js"), "module.exports = {};").unwrap();
        dir
    }

    #[test]
    fn test_load_package() {
        let dir = write_app(MANIFEST);
        let package = AppPackage::load(dir.path()).unwrap();

        assert_eq!(package.manifest.package, "com.example.demo");
        assert_eq!(package.manifest.version_code, 3);
        assert_eq!(package.pages.len(), 2);
        assert_eq!(package.entry_page().unwrap().style, ".a {}");
        assert_eq!(package.pages["detail"].style, "");
        assert_eq!(package.raw_manifest["name"], "Demo");
    }

    #[test]
    fn test_resolve_by_name_or_path() {
        let dir = write_app(MANIFEST);
        let package = AppPackage::load(dir.path()).unwrap();

        assert_eq!(package.resolve("index").unwrap().name, "index");
        assert_eq!(package.resolve("/index?x=1").unwrap().name, "index");
        assert_eq!(package.resolve("/detail/view").unwrap().name, "detail");
        assert!(package.resolve("/missing").is_none());
    }

    #[test]
    fn test_missing_page_file() {
        let dir = write_app(MANIFEST);
        fs::remove_file(dir.path().join("pages/detail.js")).unwrap();
        assert!(matches!(
            AppPackage::load(dir.path()),
            Err(LoadError::ReadError(path, _)) if path.ends_with("detail.js")
        ));
    }

    #[test]
    fn test_undeclared_entry() {
        let dir = write_app(&MANIFEST.replace(r#""entry": "index""#, r#""entry": "home""#));
        assert!(matches!(AppPackage::load(dir.path()), Err(LoadError::Invalid(_))));
    }

    #[test]
    fn test_missing_manifest() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            AppPackage::load(dir.path()),
            Err(LoadError::ManifestNotFound(_))
        ));
    }
}
