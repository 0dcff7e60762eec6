// src/build.rs

//! Build execution for a single formula
//!
//! Each build runs inside a scoped temporary directory that is removed on
//! every exit path, including failure and cancellation. Steps run strictly
//! in order through `sh -c`: install scripts have positional side effects
//! (a resource must be placed before configure references it), so there is
//! no parallelism within one formula. The first failing step aborts the
//! rest and reports its index, exit status, and captured output.
//!
//! The post-install test is deliberately soft: a working install with a
//! flaky smoke test is still usable, so its failure becomes a warning on
//! the outcome instead of rolling anything back.

use crate::error::{Error, Result};
use crate::formula::{Formula, InstallPaths};
use regex::Regex;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tempfile::TempDir;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Cooperative cancellation flag shared across an install run
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Result of a successful build
#[derive(Debug)]
pub struct BuildOutcome {
    /// Files the build installed under the prefix/etc roots
    pub installed_paths: Vec<PathBuf>,
    /// Soft failures (post-install test), install stands
    pub warnings: Vec<String>,
    /// Accumulated step output
    pub log: String,
}

/// Runs a formula's build procedure in an isolated working directory
#[derive(Debug, Default)]
pub struct BuildExecutor;

impl BuildExecutor {
    pub fn new() -> Self {
        Self
    }

    /// Build and install one formula
    ///
    /// `source` is the fetched main-source path, `resources` maps declared
    /// resource names to fetched paths. Writes land only under the given
    /// install paths; the scratch directory is discarded on return.
    pub fn build(
        &self,
        formula: &Formula,
        source: Option<&Path>,
        resources: &HashMap<String, PathBuf>,
        paths: &InstallPaths,
        cancel: &CancelToken,
    ) -> Result<BuildOutcome> {
        info!("Building {} {}", formula.name, formula.version);

        let workdir = TempDir::new()?;
        let mut log = String::new();

        // Stage fetched content into the scratch directory so build steps
        // cannot mutate the shared cache.
        let local_source = match source {
            Some(path) => Some(stage_file(path, workdir.path(), &source_filename(formula))?),
            None => None,
        };
        let mut local_resources = HashMap::new();
        for (name, path) in resources {
            let staged = stage_file(path, workdir.path(), name)?;
            local_resources.insert(name.clone(), staged);
        }

        fs::create_dir_all(&paths.prefix)?;
        fs::create_dir_all(&paths.bin)?;
        fs::create_dir_all(&paths.etc)?;
        fs::create_dir_all(&paths.var)?;

        // Snapshot before the build so only newly installed files land in
        // the receipt when installing into a shared root.
        let before = existing_files(paths);

        for (index, step) in formula.build_steps.iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let command = formula.substitute(
                &step.command,
                paths,
                local_source.as_deref(),
                &local_resources,
            );
            debug!("Step {}: {}", index + 1, command);

            let (exit_status, output) = run_shell(&command, workdir.path(), &step.env)?;
            log.push_str(&format!("=== step {} ===\n{}", index + 1, output));

            if exit_status != 0 {
                return Err(Error::BuildStepFailed {
                    step_index: index + 1,
                    exit_status,
                    output,
                });
            }
        }

        let installed_paths: Vec<PathBuf> = existing_files(paths)
            .into_iter()
            .filter(|p| !before.contains(p))
            .collect();

        let mut warnings = Vec::new();
        if let Some(test) = &formula.test {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            if let Err(e) = self.run_test(formula, test, paths, &local_resources) {
                warn!("Post-install test failed for {}: {}", formula.name, e);
                warnings.push(e.to_string());
            }
        }

        Ok(BuildOutcome {
            installed_paths,
            warnings,
            log,
        })
    }

    /// Run the post-install smoke test; failure is soft
    fn run_test(
        &self,
        formula: &Formula,
        test: &crate::formula::TestStep,
        paths: &InstallPaths,
        resources: &HashMap<String, PathBuf>,
    ) -> Result<()> {
        let command = formula.substitute(&test.command, paths, None, resources);
        let (exit_status, output) = run_shell(&command, &paths.prefix, &HashMap::new())?;

        if exit_status != 0 {
            return Err(Error::PostInstallTestFailed(format!(
                "'{}' exited with status {}",
                command, exit_status
            )));
        }

        if let Some(pattern) = &test.expected_output {
            // Pattern validity is checked by Formula::validate.
            let re = Regex::new(pattern).map_err(|e| {
                Error::PostInstallTestFailed(format!("invalid matcher '{}': {}", pattern, e))
            })?;
            if !re.is_match(&output) {
                return Err(Error::PostInstallTestFailed(format!(
                    "output did not match /{}/: {}",
                    pattern,
                    output.trim()
                )));
            }
        }

        Ok(())
    }
}

/// Run a command through `sh -c`, capturing combined output
fn run_shell(
    command: &str,
    workdir: &Path,
    env: &HashMap<String, String>,
) -> Result<(i32, String)> {
    let output = Command::new("sh")
        .arg("-c")
        .arg(command)
        .current_dir(workdir)
        .envs(env)
        .output()?;

    let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
    combined.push_str(&String::from_utf8_lossy(&output.stderr));

    Ok((output.status.code().unwrap_or(-1), combined))
}

/// Copy a fetched file into the scratch directory under a stable name
fn stage_file(src: &Path, workdir: &Path, name: &str) -> Result<PathBuf> {
    let dest = workdir.join(name);
    fs::copy(src, &dest)?;
    Ok(dest)
}

/// Local filename for the staged main source
fn source_filename(formula: &Formula) -> String {
    formula
        .source
        .url
        .split('/')
        .next_back()
        .filter(|s| !s.is_empty())
        .unwrap_or("source")
        .to_string()
}

/// All regular files currently under the install roots
fn existing_files(paths: &InstallPaths) -> Vec<PathBuf> {
    let mut roots = vec![paths.prefix.clone()];
    if !paths.bin.starts_with(&paths.prefix) {
        roots.push(paths.bin.clone());
    }
    if !paths.etc.starts_with(&paths.prefix) {
        roots.push(paths.etc.clone());
    }
    if !paths.var.starts_with(&paths.prefix) {
        roots.push(paths.var.clone());
    }

    let mut files = Vec::new();
    for root in roots {
        for entry in WalkDir::new(&root).into_iter().filter_map(|e| e.ok()) {
            if entry.file_type().is_file() {
                files.push(entry.into_path());
            }
        }
    }
    files.sort();
    files
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::formula::{BuildStep, Source, TestStep, VersionSpec};

    fn formula_with_steps(steps: Vec<BuildStep>) -> Formula {
        Formula {
            name: "sample".to_string(),
            version: VersionSpec::Pinned(semver::Version::new(1, 0, 0)),
            description: None,
            homepage: None,
            source: Source {
                url: "https://example.com/sample-1.0.0.tar.gz".to_string(),
                checksum: Some("abc".to_string()),
            },
            dependencies: Vec::new(),
            resources: Vec::new(),
            build_steps: steps,
            test: None,
        }
    }

    fn roots() -> (tempfile::TempDir, InstallPaths) {
        let dir = tempfile::tempdir().unwrap();
        let paths = InstallPaths::under_root(dir.path());
        (dir, paths)
    }

    #[test]
    fn test_successful_build_lists_installed_files() {
        let (_root, paths) = roots();
        let formula = formula_with_steps(vec![
            BuildStep::new("echo binary > %(bin)s/sample"),
            BuildStep::new("echo config > %(etc)s/sample.conf"),
        ]);

        let outcome = BuildExecutor::new()
            .build(&formula, None, &HashMap::new(), &paths, &CancelToken::new())
            .unwrap();

        assert_eq!(outcome.installed_paths.len(), 2);
        assert!(outcome.installed_paths.contains(&paths.bin.join("sample")));
        assert!(outcome
            .installed_paths
            .contains(&paths.etc.join("sample.conf")));
        assert!(outcome.warnings.is_empty());
    }

    #[test]
    fn test_bin_outside_prefix_is_tracked() {
        let dir = tempfile::tempdir().unwrap();
        let paths = InstallPaths {
            prefix: dir.path().join("opt/sample"),
            bin: dir.path().join("bin"),
            etc: dir.path().join("opt/sample/etc"),
            var: dir.path().join("opt/sample/var"),
        };
        let formula = formula_with_steps(vec![BuildStep::new("echo binary > %(bin)s/sample")]);

        let outcome = BuildExecutor::new()
            .build(&formula, None, &HashMap::new(), &paths, &CancelToken::new())
            .unwrap();

        // A bin root outside the prefix still lands in the receipt list.
        assert!(outcome.installed_paths.contains(&paths.bin.join("sample")));
    }

    #[test]
    fn test_failing_step_reports_index_and_output() {
        let (_root, paths) = roots();
        let formula = formula_with_steps(vec![
            BuildStep::new("true"),
            BuildStep::new("echo going down >&2; exit 7"),
            BuildStep::new("echo never runs > %(bin)s/never"),
        ]);

        let err = BuildExecutor::new()
            .build(&formula, None, &HashMap::new(), &paths, &CancelToken::new())
            .unwrap_err();

        match err {
            Error::BuildStepFailed {
                step_index,
                exit_status,
                output,
            } => {
                assert_eq!(step_index, 2);
                assert_eq!(exit_status, 7);
                assert!(output.contains("going down"));
            }
            other => panic!("expected BuildStepFailed, got {:?}", other),
        }

        // The remaining step never ran.
        assert!(!paths.bin.join("never").exists());
    }

    #[test]
    fn test_scratch_directory_removed_on_failure() {
        let (root, paths) = roots();
        let marker = root.path().join("workdir-path");
        let formula = formula_with_steps(vec![
            BuildStep::new(format!("pwd > {}", marker.display())),
            BuildStep::new("exit 1"),
        ]);

        let err = BuildExecutor::new()
            .build(&formula, None, &HashMap::new(), &paths, &CancelToken::new())
            .unwrap_err();
        assert!(matches!(err, Error::BuildStepFailed { .. }));

        let workdir = fs::read_to_string(&marker).unwrap();
        assert!(!Path::new(workdir.trim()).exists());
    }

    #[test]
    fn test_per_step_env() {
        let (_root, paths) = roots();
        let formula = formula_with_steps(vec![BuildStep::new(
            "printf '%s' \"$LIBTOOLIZE\" > %(prefix)s/tool",
        )
        .with_env("LIBTOOLIZE", "glibtoolize")]);

        BuildExecutor::new()
            .build(&formula, None, &HashMap::new(), &paths, &CancelToken::new())
            .unwrap();

        assert_eq!(
            fs::read_to_string(paths.prefix.join("tool")).unwrap(),
            "glibtoolize"
        );
    }

    #[test]
    fn test_resources_staged_into_workdir() {
        let (_root, paths) = roots();
        let cache_dir = tempfile::tempdir().unwrap();
        let cached = cache_dir.path().join("cc30b7");
        fs::write(&cached, "#!/bin/sh\n").unwrap();

        let mut formula = formula_with_steps(vec![BuildStep::new(
            "install -m 0755 %(resource:vpnc-script)s %(etc)s/vpnc-script",
        )]);
        formula.resources.push(crate::formula::Resource {
            name: "vpnc-script".to_string(),
            url: "https://example.com/vpnc-script".to_string(),
            checksum: "cc30b7".to_string(),
        });

        let mut resources = HashMap::new();
        resources.insert("vpnc-script".to_string(), cached.clone());

        let outcome = BuildExecutor::new()
            .build(&formula, None, &resources, &paths, &CancelToken::new())
            .unwrap();

        assert!(paths.etc.join("vpnc-script").exists());
        assert!(outcome
            .installed_paths
            .contains(&paths.etc.join("vpnc-script")));
        // The cached copy is untouched.
        assert_eq!(fs::read_to_string(&cached).unwrap(), "#!/bin/sh\n");
    }

    #[test]
    fn test_failing_test_step_is_soft() {
        let (_root, paths) = roots();
        let mut formula = formula_with_steps(vec![BuildStep::new("echo ok > %(bin)s/sample")]);
        formula.test = Some(TestStep {
            command: "exit 3".to_string(),
            expected_output: None,
        });

        let outcome = BuildExecutor::new()
            .build(&formula, None, &HashMap::new(), &paths, &CancelToken::new())
            .unwrap();

        // Install stands; the failure is attached as a warning.
        assert_eq!(outcome.warnings.len(), 1);
        assert!(outcome.warnings[0].contains("post-install test failed"));
        assert!(paths.bin.join("sample").exists());
    }

    #[test]
    fn test_output_matcher() {
        let (_root, paths) = roots();
        let mut formula = formula_with_steps(Vec::new());
        formula.test = Some(TestStep {
            command: "echo 'Compatible with Cisco AnyConnect VPN'".to_string(),
            expected_output: Some("AnyConnect VPN".to_string()),
        });

        let outcome = BuildExecutor::new()
            .build(&formula, None, &HashMap::new(), &paths, &CancelToken::new())
            .unwrap();
        assert!(outcome.warnings.is_empty());

        formula.test = Some(TestStep {
            command: "echo 'something else'".to_string(),
            expected_output: Some("AnyConnect VPN".to_string()),
        });
        let outcome = BuildExecutor::new()
            .build(&formula, None, &HashMap::new(), &paths, &CancelToken::new())
            .unwrap();
        assert_eq!(outcome.warnings.len(), 1);
    }

    #[test]
    fn test_cancelled_before_first_step() {
        let (_root, paths) = roots();
        let formula = formula_with_steps(vec![BuildStep::new("echo nope > %(bin)s/sample")]);

        let cancel = CancelToken::new();
        cancel.cancel();

        let err = BuildExecutor::new()
            .build(&formula, None, &HashMap::new(), &paths, &cancel)
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        assert!(!paths.bin.join("sample").exists());
    }
}
