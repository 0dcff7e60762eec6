// src/orchestrator.rs

//! Install orchestration
//!
//! Composes resolver, fetcher, executor, and receipt store to install one or
//! many formulas. The plan executes in dependency order; per-node failures
//! are captured into the report rather than raised, except that `fail_fast`
//! mode stops enqueuing further nodes after the first failure. A parallel
//! mode runs independent plan nodes concurrently in waves: a node never
//! starts before every dependency it has in the plan has settled.

use crate::build::{BuildExecutor, CancelToken};
use crate::error::{Error, Result};
use crate::fetch::SourceCache;
use crate::formula::{Catalog, DependencyKind, InstallPaths};
use crate::resolver::{InstallPlan, PlanNode, Resolver};
use crate::store::{Receipt, ReceiptStore};
use rayon::prelude::*;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use tracing::{info, warn};

/// What to do with the rest of the plan when a node fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    /// Abort remaining nodes, report partial progress
    #[default]
    FailFast,
    /// Continue independent subtrees; dependents of a failed node are skipped
    BestEffort,
}

/// Caller-supplied install configuration
#[derive(Debug, Clone, Default)]
pub struct InstallOptions {
    pub policy: FailurePolicy,
    /// Optional dependencies to opt in to (recorded as build options)
    pub include_optional: HashSet<String>,
    /// Run independent plan nodes concurrently
    pub parallel: bool,
}

/// Outcome of one plan node
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeOutcome {
    Installed { warnings: Vec<String> },
    /// Receipt already satisfied the required version
    Skipped,
    Failed {
        reason: String,
        /// Captured step output when the failure came from a build step
        output: Option<String>,
    },
}

impl NodeOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, NodeOutcome::Failed { .. })
    }
}

/// Per-node outcomes in plan order
///
/// Under `fail_fast`, nodes never attempted after the failing one are
/// omitted; the report covers exactly what the engine did.
#[derive(Debug, Default)]
pub struct InstallReport {
    outcomes: Vec<(String, NodeOutcome)>,
}

impl InstallReport {
    pub fn outcomes(&self) -> &[(String, NodeOutcome)] {
        &self.outcomes
    }

    pub fn outcome(&self, name: &str) -> Option<&NodeOutcome> {
        self.outcomes
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, o)| o)
    }

    /// True when every node settled without failure
    pub fn is_success(&self) -> bool {
        !self.outcomes.iter().any(|(_, o)| o.is_failure())
    }

    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }
}

/// Composes the engine's components to run installs end to end
pub struct Orchestrator<'a> {
    catalog: &'a dyn Catalog,
    cache: &'a SourceCache,
    executor: &'a BuildExecutor,
    store: &'a ReceiptStore,
    paths: InstallPaths,
}

impl<'a> Orchestrator<'a> {
    pub fn new(
        catalog: &'a dyn Catalog,
        cache: &'a SourceCache,
        executor: &'a BuildExecutor,
        store: &'a ReceiptStore,
        paths: InstallPaths,
    ) -> Self {
        Self {
            catalog,
            cache,
            executor,
            store,
            paths,
        }
    }

    /// Resolve the combined install plan without executing it
    pub fn plan(&self, names: &[String], options: &InstallOptions) -> Result<InstallPlan> {
        Resolver::new(self.catalog)
            .include_optional(options.include_optional.iter().cloned())
            .resolve(names, self.store)
    }

    /// Install a set of formulas and their dependencies
    ///
    /// Resolution errors abort before anything executes; fetch and build
    /// errors are node-scoped and land in the report.
    pub fn install(
        &self,
        names: &[String],
        options: &InstallOptions,
        cancel: &CancelToken,
    ) -> Result<InstallReport> {
        let plan = self.plan(names, options)?;
        info!("Installing {} node(s) for {:?}", plan.len(), names);

        if options.parallel {
            self.execute_parallel(&plan, options, cancel)
        } else {
            self.execute_sequential(&plan, options, cancel)
        }
    }

    /// Remove an installed formula: delete its receipt-listed files, then
    /// the receipt itself
    pub fn uninstall(&self, name: &str) -> Result<Receipt> {
        let receipt = self
            .store
            .lookup(name)?
            .ok_or_else(|| Error::NotFound(name.to_string()))?;

        for path in &receipt.installed_paths {
            let path = PathBuf::from(path);
            if path.exists() {
                std::fs::remove_file(&path)?;
            }
        }

        self.store.remove(name)?;
        info!("Uninstalled {} {}", receipt.name, receipt.version_spec);
        Ok(receipt)
    }

    fn execute_sequential(
        &self,
        plan: &InstallPlan,
        options: &InstallOptions,
        cancel: &CancelToken,
    ) -> Result<InstallReport> {
        let mut report = InstallReport::default();
        let mut failed: HashSet<String> = HashSet::new();

        for node in plan.nodes() {
            if cancel.is_cancelled() {
                break;
            }

            let outcome = self.settle_node(node, options, cancel, &failed);
            let aborts = outcome.is_failure() && options.policy == FailurePolicy::FailFast;
            if outcome.is_failure() {
                failed.insert(node.formula.name.clone());
            }
            report.outcomes.push((node.formula.name.clone(), outcome));

            if aborts {
                break;
            }
        }

        Ok(report)
    }

    /// Wave-based parallel execution: each wave holds the nodes whose
    /// in-plan dependencies have all settled
    fn execute_parallel(
        &self,
        plan: &InstallPlan,
        options: &InstallOptions,
        cancel: &CancelToken,
    ) -> Result<InstallReport> {
        let mut settled: HashMap<String, NodeOutcome> = HashMap::new();
        let mut pending: Vec<&PlanNode> = plan.nodes().iter().collect();

        while !pending.is_empty() && !cancel.is_cancelled() {
            let (ready, rest): (Vec<&PlanNode>, Vec<&PlanNode>) = pending.into_iter().partition(|n| {
                n.deps
                    .iter()
                    .all(|d| settled.contains_key(&d.name) || plan.position(&d.name).is_none())
            });
            pending = rest;

            if ready.is_empty() {
                // Cannot happen for a plan produced by the resolver.
                warn!("No runnable nodes left with {} pending", pending.len());
                break;
            }

            let failed: HashSet<String> = settled
                .iter()
                .filter(|(_, o)| o.is_failure())
                .map(|(n, _)| n.clone())
                .collect();

            let wave: Vec<(String, NodeOutcome)> = ready
                .par_iter()
                .map(|node| {
                    let outcome = self.settle_node(node, options, cancel, &failed);
                    (node.formula.name.clone(), outcome)
                })
                .collect();

            let wave_failed = wave.iter().any(|(_, o)| o.is_failure());
            for (name, outcome) in wave {
                settled.insert(name, outcome);
            }

            if wave_failed && options.policy == FailurePolicy::FailFast {
                break;
            }
        }

        let mut report = InstallReport::default();
        for node in plan.nodes() {
            if let Some(outcome) = settled.remove(&node.formula.name) {
                report.outcomes.push((node.formula.name.clone(), outcome));
            }
        }
        Ok(report)
    }

    /// Decide and produce the outcome for one node
    fn settle_node(
        &self,
        node: &PlanNode,
        options: &InstallOptions,
        cancel: &CancelToken,
        failed: &HashSet<String>,
    ) -> NodeOutcome {
        // A node whose receipt already satisfies its version needs nothing
        // from this run, so a failed dependency cannot affect it.
        if node.skip_build {
            info!(
                "{} {} already installed, skipping",
                node.formula.name, node.formula.version
            );
            return NodeOutcome::Skipped;
        }

        // A failed hard dependency poisons the dependent. A failed optional
        // dependency does not: the formula builds without that feature.
        let poisoned = node
            .deps
            .iter()
            .find(|d| d.kind != DependencyKind::Optional && failed.contains(&d.name));
        if let Some(dep) = poisoned {
            return NodeOutcome::Failed {
                reason: format!("dependency '{}' failed", dep.name),
                output: None,
            };
        }

        match self.install_node(node, options, cancel) {
            Ok(warnings) => NodeOutcome::Installed { warnings },
            Err(e) => {
                warn!("Install of {} failed: {}", node.formula.name, e);
                let output = match &e {
                    Error::BuildStepFailed { output, .. } => Some(output.clone()),
                    _ => None,
                };
                NodeOutcome::Failed {
                    reason: e.to_string(),
                    output,
                }
            }
        }
    }

    /// Fetch, build, and record one node; any error leaves no receipt
    fn install_node(
        &self,
        node: &PlanNode,
        options: &InstallOptions,
        cancel: &CancelToken,
    ) -> Result<Vec<String>> {
        let formula = &node.formula;

        let source_path = match &formula.source.checksum {
            Some(checksum) => self.cache.fetch(&formula.source.url, checksum)?,
            // Head sources are moving targets; fetched unverified.
            None => self.cache.fetch_unverified(&formula.source.url)?,
        };

        let mut resource_paths = HashMap::new();
        for resource in &formula.resources {
            let path = self.cache.fetch(&resource.url, &resource.checksum)?;
            resource_paths.insert(resource.name.clone(), path);
        }

        let outcome = self.executor.build(
            formula,
            Some(&source_path),
            &resource_paths,
            &self.paths,
            cancel,
        )?;

        let installed_paths = outcome
            .installed_paths
            .iter()
            .map(|p| p.to_string_lossy().into_owned())
            .collect();
        let mut build_options: Vec<String> = options.include_optional.iter().cloned().collect();
        build_options.sort();

        let receipt = Receipt::new(formula.name.clone(), &formula.version, installed_paths)
            .with_build_options(build_options);
        self.store.record(&receipt)?;

        Ok(outcome.warnings)
    }
}
