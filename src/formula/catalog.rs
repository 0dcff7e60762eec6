// src/formula/catalog.rs

//! Formula catalogs
//!
//! A catalog supplies formula descriptors by name. The engine only needs the
//! lookup capability; where formulas actually live (a directory of JSON files,
//! a remote index, test fixtures) is the catalog's business.

use crate::error::{Error, Result};
use crate::formula::Formula;
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::debug;

/// Lookup capability for formula descriptors
pub trait Catalog: Send + Sync {
    /// Resolve a formula by name, or fail with `NotFound`
    fn resolve(&self, name: &str) -> Result<Formula>;
}

/// In-memory catalog, used by tests and embedders
#[derive(Debug, Default)]
pub struct MemoryCatalog {
    formulas: HashMap<String, Formula>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a formula; replaces any existing formula with the same name
    pub fn insert(&mut self, formula: Formula) {
        self.formulas.insert(formula.name.clone(), formula);
    }

    pub fn len(&self) -> usize {
        self.formulas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.formulas.is_empty()
    }
}

impl Catalog for MemoryCatalog {
    fn resolve(&self, name: &str) -> Result<Formula> {
        self.formulas
            .get(name)
            .cloned()
            .ok_or_else(|| Error::NotFound(name.to_string()))
    }
}

/// Directory-backed catalog: one `<name>.json` file per formula
#[derive(Debug)]
pub struct DirCatalog {
    dir: PathBuf,
}

impl DirCatalog {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl Catalog for DirCatalog {
    fn resolve(&self, name: &str) -> Result<Formula> {
        let path = self.dir.join(format!("{}.json", name));
        if !path.exists() {
            return Err(Error::NotFound(name.to_string()));
        }

        debug!("Loading formula from {}", path.display());
        let content = std::fs::read_to_string(&path)?;
        let formula: Formula =
            serde_json::from_str(&content).map_err(|e| Error::InvalidFormula {
                name: name.to_string(),
                reason: format!("failed to parse {}: {}", path.display(), e),
            })?;

        if formula.name != name {
            return Err(Error::InvalidFormula {
                name: name.to_string(),
                reason: format!(
                    "file {} declares name '{}'",
                    path.display(),
                    formula.name
                ),
            });
        }

        formula.validate()?;
        Ok(formula)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::formula::{Source, VersionSpec};

    fn sample(name: &str) -> Formula {
        Formula {
            name: name.to_string(),
            version: VersionSpec::Pinned(semver::Version::new(1, 0, 0)),
            description: None,
            homepage: None,
            source: Source {
                url: format!("https://example.com/{}.tar.gz", name),
                checksum: Some("abc123".to_string()),
            },
            dependencies: Vec::new(),
            resources: Vec::new(),
            build_steps: Vec::new(),
            test: None,
        }
    }

    #[test]
    fn test_memory_catalog_resolve() {
        let mut catalog = MemoryCatalog::new();
        catalog.insert(sample("gnutls"));

        assert_eq!(catalog.resolve("gnutls").unwrap().name, "gnutls");
        assert!(matches!(
            catalog.resolve("missing"),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_dir_catalog_resolve() {
        let dir = tempfile::tempdir().unwrap();
        let formula = sample("gettext");
        std::fs::write(
            dir.path().join("gettext.json"),
            serde_json::to_string_pretty(&formula).unwrap(),
        )
        .unwrap();

        let catalog = DirCatalog::new(dir.path());
        let resolved = catalog.resolve("gettext").unwrap();
        assert_eq!(resolved.name, "gettext");
        assert!(matches!(
            catalog.resolve("missing"),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_dir_catalog_rejects_name_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let formula = sample("other-name");
        std::fs::write(
            dir.path().join("gettext.json"),
            serde_json::to_string(&formula).unwrap(),
        )
        .unwrap();

        let catalog = DirCatalog::new(dir.path());
        assert!(matches!(
            catalog.resolve("gettext"),
            Err(Error::InvalidFormula { .. })
        ));
    }

    #[test]
    fn test_dir_catalog_rejects_malformed_json() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("broken.json"), "{ not json").unwrap();

        let catalog = DirCatalog::new(dir.path());
        assert!(matches!(
            catalog.resolve("broken"),
            Err(Error::InvalidFormula { .. })
        ));
    }
}
