// src/formula/mod.rs

//! Formula descriptors: the declarative input to the build engine
//!
//! A formula describes one installable package: its version, main source,
//! dependency edges, auxiliary resources, and the ordered build procedure.
//! Formulas are parsed elsewhere (JSON catalogs, in-memory fixtures); the
//! engine treats them as immutable, read-only input.

pub mod catalog;

pub use catalog::{Catalog, DirCatalog, MemoryCatalog};

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};

/// Version requirement for a formula
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VersionSpec {
    /// A pinned release version
    Pinned(semver::Version),
    /// Branch-tracked moving target; always resolves to the latest commit
    Head { branch: String },
}

impl VersionSpec {
    pub fn is_head(&self) -> bool {
        matches!(self, VersionSpec::Head { .. })
    }
}

impl fmt::Display for VersionSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VersionSpec::Pinned(v) => write!(f, "{}", v),
            VersionSpec::Head { branch } => write!(f, "HEAD[{}]", branch),
        }
    }
}

/// Kind of dependency edge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyKind {
    #[default]
    Runtime,
    Build,
    Optional,
}

impl DependencyKind {
    pub fn as_str(&self) -> &str {
        match self {
            DependencyKind::Runtime => "runtime",
            DependencyKind::Build => "build",
            DependencyKind::Optional => "optional",
        }
    }
}

/// A dependency edge to another formula
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dependency {
    pub name: String,
    #[serde(default)]
    pub kind: DependencyKind,
}

/// Main source archive for a formula
///
/// The checksum may be omitted only for Head formulas, whose content is a
/// moving target and cannot be pinned.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Source {
    pub url: String,
    #[serde(default)]
    pub checksum: Option<String>,
}

/// An auxiliary file fetched independently of the main source
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Resource {
    pub name: String,
    pub url: String,
    pub checksum: String,
}

/// One opaque build command, run via `sh -c` in the build directory
///
/// Commands may reference `%(prefix)s`, `%(bin)s`, `%(etc)s`, `%(var)s`,
/// `%(source)s`, and `%(resource:NAME)s` placeholders. The per-step
/// environment replaces ambient process-global mutation: a step that needs
/// `LIBTOOLIZE=glibtoolize` declares it here instead of exporting it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildStep {
    pub command: String,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl BuildStep {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            env: HashMap::new(),
        }
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

/// Optional post-install smoke test
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestStep {
    pub command: String,
    /// Regex matched against the combined stdout+stderr of the command
    #[serde(default)]
    pub expected_output: Option<String>,
}

/// Installation path parameters handed to build steps
///
/// The engine never hardcodes filesystem locations; every placeholder in a
/// build command expands to one of these caller-supplied roots.
#[derive(Debug, Clone)]
pub struct InstallPaths {
    pub prefix: PathBuf,
    pub bin: PathBuf,
    pub etc: PathBuf,
    pub var: PathBuf,
}

impl InstallPaths {
    /// Standard layout under a single install root
    pub fn under_root(root: &Path) -> Self {
        Self {
            prefix: root.to_path_buf(),
            bin: root.join("bin"),
            etc: root.join("etc"),
            var: root.join("var"),
        }
    }
}

/// A complete formula descriptor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Formula {
    /// Unique package name
    pub name: String,

    /// Version requirement (pinned or branch-tracked)
    pub version: VersionSpec,

    #[serde(default)]
    pub description: Option<String>,

    #[serde(default)]
    pub homepage: Option<String>,

    /// Main source archive
    pub source: Source,

    /// Dependency edges, in declared order
    #[serde(default)]
    pub dependencies: Vec<Dependency>,

    /// Auxiliary resources referenced by build steps
    #[serde(default)]
    pub resources: Vec<Resource>,

    /// Ordered build procedure
    #[serde(default)]
    pub build_steps: Vec<BuildStep>,

    /// Post-install smoke test
    #[serde(default)]
    pub test: Option<TestStep>,
}

impl Formula {
    /// Validate descriptor invariants
    ///
    /// Checks: non-empty name, checksum present for pinned sources, every
    /// `%(resource:X)s` reference names a declared resource, and the test
    /// matcher (if any) is a compilable regex.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::InvalidFormula {
                name: self.name.clone(),
                reason: "name must be non-empty".to_string(),
            });
        }

        if !self.version.is_head() && self.source.checksum.is_none() {
            return Err(Error::InvalidFormula {
                name: self.name.clone(),
                reason: "pinned formula must declare a source checksum".to_string(),
            });
        }

        let declared: HashSet<&str> = self.resources.iter().map(|r| r.name.as_str()).collect();
        for step in &self.build_steps {
            for referenced in resource_references(&step.command) {
                if !declared.contains(referenced.as_str()) {
                    return Err(Error::InvalidFormula {
                        name: self.name.clone(),
                        reason: format!("build step references undeclared resource '{}'", referenced),
                    });
                }
            }
        }

        if let Some(test) = &self.test {
            if let Some(pattern) = &test.expected_output {
                if let Err(e) = regex::Regex::new(pattern) {
                    return Err(Error::InvalidFormula {
                        name: self.name.clone(),
                        reason: format!("invalid test matcher: {}", e),
                    });
                }
            }
        }

        Ok(())
    }

    /// Look up a declared resource by name
    pub fn resource(&self, name: &str) -> Option<&Resource> {
        self.resources.iter().find(|r| r.name == name)
    }

    /// Dependency edges to follow during resolution
    ///
    /// Runtime and build edges are always followed; optional edges only when
    /// the caller's inclusion set names them.
    pub fn included_deps<'a>(
        &'a self,
        include_optional: &'a HashSet<String>,
    ) -> impl Iterator<Item = &'a Dependency> {
        self.dependencies.iter().filter(move |d| {
            d.kind != DependencyKind::Optional || include_optional.contains(&d.name)
        })
    }

    /// Substitute path placeholders in a build or test command
    ///
    /// `source` is the fetched main-source path; `resources` maps declared
    /// resource names to their fetched local paths.
    pub fn substitute(
        &self,
        template: &str,
        paths: &InstallPaths,
        source: Option<&Path>,
        resources: &HashMap<String, PathBuf>,
    ) -> String {
        let mut result = template.to_string();

        result = result.replace("%(prefix)s", &paths.prefix.to_string_lossy());
        result = result.replace("%(bin)s", &paths.bin.to_string_lossy());
        result = result.replace("%(etc)s", &paths.etc.to_string_lossy());
        result = result.replace("%(var)s", &paths.var.to_string_lossy());
        result = result.replace("%(name)s", &self.name);
        result = result.replace("%(version)s", &self.version.to_string());

        if let Some(src) = source {
            result = result.replace("%(source)s", &src.to_string_lossy());
        }

        for (name, path) in resources {
            result = result.replace(
                &format!("%(resource:{})s", name),
                &path.to_string_lossy(),
            );
        }

        result
    }
}

/// Extract resource names referenced as `%(resource:NAME)s` in a command
fn resource_references(command: &str) -> Vec<String> {
    let mut names = Vec::new();
    let mut rest = command;
    while let Some(start) = rest.find("%(resource:") {
        let after = &rest[start + "%(resource:".len()..];
        match after.find(")s") {
            Some(end) => {
                names.push(after[..end].to_string());
                rest = &after[end..];
            }
            None => break,
        }
    }
    names
}

#[cfg(test)]
mod tests {
    use super::*;

    fn head_formula(name: &str) -> Formula {
        Formula {
            name: name.to_string(),
            version: VersionSpec::Head {
                branch: "devel".to_string(),
            },
            description: None,
            homepage: None,
            source: Source {
                url: "https://example.com/src.git".to_string(),
                checksum: None,
            },
            dependencies: Vec::new(),
            resources: Vec::new(),
            build_steps: Vec::new(),
            test: None,
        }
    }

    #[test]
    fn test_version_spec_display() {
        let pinned = VersionSpec::Pinned(semver::Version::new(1, 2, 3));
        assert_eq!(pinned.to_string(), "1.2.3");

        let head = VersionSpec::Head {
            branch: "devel".to_string(),
        };
        assert_eq!(head.to_string(), "HEAD[devel]");
        assert!(head.is_head());
        assert!(!pinned.is_head());
    }

    #[test]
    fn test_validate_empty_name() {
        let formula = head_formula("");
        assert!(matches!(
            formula.validate(),
            Err(Error::InvalidFormula { .. })
        ));
    }

    #[test]
    fn test_validate_pinned_requires_checksum() {
        let mut formula = head_formula("foo");
        formula.version = VersionSpec::Pinned(semver::Version::new(1, 0, 0));
        assert!(formula.validate().is_err());

        formula.source.checksum = Some("abc123".to_string());
        assert!(formula.validate().is_ok());
    }

    #[test]
    fn test_validate_undeclared_resource_reference() {
        let mut formula = head_formula("foo");
        formula
            .build_steps
            .push(BuildStep::new("install -m 755 %(resource:vpnc-script)s %(etc)s/"));

        assert!(formula.validate().is_err());

        formula.resources.push(Resource {
            name: "vpnc-script".to_string(),
            url: "https://example.com/vpnc-script".to_string(),
            checksum: "cc30b7".to_string(),
        });
        assert!(formula.validate().is_ok());
    }

    #[test]
    fn test_validate_bad_test_matcher() {
        let mut formula = head_formula("foo");
        formula.test = Some(TestStep {
            command: "true".to_string(),
            expected_output: Some("(unclosed".to_string()),
        });
        assert!(formula.validate().is_err());
    }

    #[test]
    fn test_resource_references_extraction() {
        let refs = resource_references("cp %(resource:a)s %(resource:b)s %(etc)s/");
        assert_eq!(refs, vec!["a".to_string(), "b".to_string()]);

        assert!(resource_references("make install").is_empty());
    }

    #[test]
    fn test_substitute_placeholders() {
        let formula = head_formula("openconnect-keychain");
        let paths = InstallPaths::under_root(Path::new("/opt/cellar"));
        let mut resources = HashMap::new();
        resources.insert(
            "vpnc-script".to_string(),
            PathBuf::from("/cache/cc30b7"),
        );

        let cmd = formula.substitute(
            "./configure --prefix=%(prefix)s --sbindir=%(bin)s --localstatedir=%(var)s \
             --with-vpnc-script=%(resource:vpnc-script)s",
            &paths,
            None,
            &resources,
        );

        assert_eq!(
            cmd,
            "./configure --prefix=/opt/cellar --sbindir=/opt/cellar/bin \
             --localstatedir=/opt/cellar/var --with-vpnc-script=/cache/cc30b7"
        );
    }

    #[test]
    fn test_included_deps_filters_optional() {
        let mut formula = head_formula("openconnect-keychain");
        formula.dependencies = vec![
            Dependency {
                name: "gettext".to_string(),
                kind: DependencyKind::Runtime,
            },
            Dependency {
                name: "autoconf".to_string(),
                kind: DependencyKind::Build,
            },
            Dependency {
                name: "stoken".to_string(),
                kind: DependencyKind::Optional,
            },
        ];

        let none = HashSet::new();
        let names: Vec<&str> = formula
            .included_deps(&none)
            .map(|d| d.name.as_str())
            .collect();
        assert_eq!(names, vec!["gettext", "autoconf"]);

        let mut with_stoken = HashSet::new();
        with_stoken.insert("stoken".to_string());
        let names: Vec<&str> = formula
            .included_deps(&with_stoken)
            .map(|d| d.name.as_str())
            .collect();
        assert_eq!(names, vec!["gettext", "autoconf", "stoken"]);
    }

    #[test]
    fn test_formula_json_round_trip() {
        let mut formula = head_formula("openconnect-keychain");
        formula.resources.push(Resource {
            name: "vpnc-script".to_string(),
            url: "https://example.com/vpnc-script".to_string(),
            checksum: "cc30b7".to_string(),
        });
        formula
            .build_steps
            .push(BuildStep::new("./autogen.sh").with_env("LIBTOOLIZE", "glibtoolize"));

        let json = serde_json::to_string(&formula).unwrap();
        let back: Formula = serde_json::from_str(&json).unwrap();
        assert_eq!(back.name, formula.name);
        assert_eq!(back.build_steps[0].env["LIBTOOLIZE"], "glibtoolize");
        assert!(back.version.is_head());
    }
}
