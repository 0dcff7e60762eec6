// src/resolver.rs

//! Dependency resolution and install-order planning
//!
//! Produces an install plan from a set of target formulas: a depth-first
//! topological sort over the dependency DAG in which every dependency
//! precedes its dependents. Resolution errors (unknown names, cycles) abort
//! planning entirely; an incomplete graph is unsafe to build from.
//!
//! Ordering is deterministic: when two dependencies have no constraint
//! between them, the order they were declared in wins. Nodes whose receipt
//! already satisfies the required version stay in the plan but are marked
//! `skip_build`, so the plan is uniform and the orchestrator can still
//! re-verify them.

use crate::error::{Error, Result};
use crate::formula::{Catalog, Dependency, Formula, VersionSpec};
use std::collections::HashSet;
use tracing::debug;

/// Query for already-satisfied installations
///
/// Implemented by the receipt store; tests substitute fixtures.
pub trait InstalledQuery {
    fn is_satisfied(&self, name: &str, version: &VersionSpec) -> Result<bool>;
}

/// Treats nothing as installed
pub struct NoInstalled;

impl InstalledQuery for NoInstalled {
    fn is_satisfied(&self, _name: &str, _version: &VersionSpec) -> Result<bool> {
        Ok(false)
    }
}

/// One node of an install plan
#[derive(Debug, Clone)]
pub struct PlanNode {
    pub formula: Formula,
    /// Receipt already satisfies the required version
    pub skip_build: bool,
    /// Dependency edges included in this plan (optional edges only if requested)
    pub deps: Vec<Dependency>,
}

/// Ordered install plan: dependencies always precede dependents
#[derive(Debug, Default)]
pub struct InstallPlan {
    nodes: Vec<PlanNode>,
}

impl InstallPlan {
    pub fn nodes(&self) -> &[PlanNode] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Position of a named node within the plan
    pub fn position(&self, name: &str) -> Option<usize> {
        self.nodes.iter().position(|n| n.formula.name == name)
    }
}

/// Builds install plans from a formula catalog
pub struct Resolver<'a> {
    catalog: &'a dyn Catalog,
    include_optional: HashSet<String>,
}

impl<'a> Resolver<'a> {
    pub fn new(catalog: &'a dyn Catalog) -> Self {
        Self {
            catalog,
            include_optional: HashSet::new(),
        }
    }

    /// Opt in to the named optional dependencies
    pub fn include_optional(mut self, names: impl IntoIterator<Item = String>) -> Self {
        self.include_optional.extend(names);
        self
    }

    /// Resolve a combined plan for all targets, deduplicating shared
    /// dependencies across targets
    pub fn resolve(
        &self,
        targets: &[String],
        installed: &dyn InstalledQuery,
    ) -> Result<InstallPlan> {
        let mut plan = InstallPlan::default();
        let mut visiting = Vec::new();
        let mut visited = HashSet::new();

        for target in targets {
            self.visit(target, &mut visiting, &mut visited, &mut plan, installed)?;
        }

        debug!(
            "Resolved plan for {:?}: {} node(s), {} skipped",
            targets,
            plan.len(),
            plan.nodes.iter().filter(|n| n.skip_build).count()
        );

        Ok(plan)
    }

    fn visit(
        &self,
        name: &str,
        visiting: &mut Vec<String>,
        visited: &mut HashSet<String>,
        plan: &mut InstallPlan,
        installed: &dyn InstalledQuery,
    ) -> Result<()> {
        if visited.contains(name) {
            return Ok(());
        }

        // A node already on the visiting stack means we walked back into
        // our own ancestry: report the cycle slice for diagnostics.
        if let Some(pos) = visiting.iter().position(|n| n == name) {
            let mut path: Vec<String> = visiting[pos..].to_vec();
            path.push(name.to_string());
            return Err(Error::CyclicDependency(path));
        }

        let formula = self.catalog.resolve(name)?;
        formula.validate()?;

        visiting.push(name.to_string());
        for dep in formula.included_deps(&self.include_optional) {
            self.visit(&dep.name, visiting, visited, plan, installed)?;
        }
        visiting.pop();

        visited.insert(name.to_string());

        let skip_build = installed.is_satisfied(&formula.name, &formula.version)?;
        let deps: Vec<Dependency> = formula
            .included_deps(&self.include_optional)
            .cloned()
            .collect();

        plan.nodes.push(PlanNode {
            formula,
            skip_build,
            deps,
        });

        Ok(())
    }
}
