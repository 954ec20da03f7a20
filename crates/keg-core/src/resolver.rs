//! Dependency resolution.
//!
//! Turns a set of requested formulas into a [`ResolutionPlan`]: every formula
//! reachable from the targets, each exactly once, with dependencies ahead of
//! their dependents. Traversal is depth-first in declaration order so the
//! same formula set and target order always produce the same plan.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;

use keg_schema::{DependencyKind, DependencySpec, Formula, FormulaSet, PackageName, Version};
use thiserror::Error;

/// Resolution failures. All of them are fatal before any work starts.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolveError {
    /// A target or dependency names a formula that does not exist.
    #[error("{}", describe_unknown(name, required_by.as_ref()))]
    UnknownDependency {
        /// The missing formula.
        name: PackageName,
        /// The formula declaring the dependency, `None` for a requested target.
        required_by: Option<PackageName>,
    },

    /// The dependency graph contains a cycle.
    #[error("circular dependency: {}", join_path(path))]
    Cycle {
        /// Formulas along the cycle, first element repeated at the end.
        path: Vec<PackageName>,
    },

    /// No available version satisfies every constraint, or a requested
    /// variant is not declared.
    #[error("no version of '{name}' satisfies every requirement (available: {available}): {}", join_requirements(requirements))]
    VersionConflict {
        /// The constrained formula.
        name: PackageName,
        /// The only version known for it.
        available: Version,
        /// Every `(requirer, constraint)` pair placed on it.
        requirements: Vec<(String, String)>,
    },

    /// A formula in the graph is disabled.
    #[error("'{name}' has been disabled{}: {because}", since(date))]
    Disabled {
        /// The disabled formula.
        name: PackageName,
        /// When it was disabled.
        date: String,
        /// Why.
        because: String,
    },
}

fn describe_unknown(name: &PackageName, required_by: Option<&PackageName>) -> String {
    match required_by {
        Some(parent) => format!("unknown dependency '{name}' (required by '{parent}')"),
        None => format!("no formula named '{name}'"),
    }
}

fn since(date: &str) -> String {
    if date.is_empty() {
        String::new()
    } else {
        format!(" since {date}")
    }
}

fn join_path(path: &[PackageName]) -> String {
    path.iter()
        .map(PackageName::as_str)
        .collect::<Vec<_>>()
        .join(" -> ")
}

fn join_requirements(reqs: &[(String, String)]) -> String {
    reqs.iter()
        .map(|(who, what)| format!("{who} requires {what}"))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Knobs that apply to the requested targets only.
#[derive(Debug, Clone, Default)]
pub struct ResolveOptions {
    /// Build targets from their `[head]` source.
    pub head: bool,
    /// Variants enabled on every target.
    pub variants: BTreeSet<String>,
}

/// One formula in a plan.
#[derive(Debug, Clone)]
pub struct PlanEntry {
    /// The formula to install.
    pub formula: Arc<Formula>,
    /// Reachable from a target through runtime edges only. Build-only
    /// dependencies are still installed but are not needed afterwards.
    pub runtime_required: bool,
    /// Explicitly requested by the user.
    pub requested: bool,
    /// Built from the `[head]` source.
    pub head: bool,
    /// Enabled variants.
    pub variants: BTreeSet<String>,
    /// Effective direct dependencies, in declaration order.
    pub dependencies: Vec<(PackageName, DependencyKind)>,
}

impl PlanEntry {
    /// The formula name.
    pub fn name(&self) -> &PackageName {
        self.formula.name()
    }
}

/// Topologically ordered install sequence.
#[derive(Debug, Clone, Default)]
pub struct ResolutionPlan {
    entries: Vec<PlanEntry>,
}

impl ResolutionPlan {
    /// Entries in install order.
    pub fn entries(&self) -> &[PlanEntry] {
        &self.entries
    }

    /// Number of formulas in the plan.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the plan is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Names in install order.
    pub fn names(&self) -> Vec<PackageName> {
        self.entries.iter().map(|e| e.name().clone()).collect()
    }

    /// Look up an entry by name.
    pub fn get(&self, name: &str) -> Option<&PlanEntry> {
        self.entries.iter().find(|e| *e.name() == name)
    }

    /// Position of a formula in the install order.
    pub fn position(&self, name: &str) -> Option<usize> {
        self.entries.iter().position(|e| *e.name() == name)
    }

    /// Everything a build of `name` needs present: its direct dependencies
    /// plus the runtime closure of each, in plan order.
    pub fn build_closure(&self, name: &str) -> Vec<PackageName> {
        let by_name: HashMap<&str, &PlanEntry> =
            self.entries.iter().map(|e| (e.name().as_str(), e)).collect();
        let mut seen: HashSet<PackageName> = HashSet::new();
        let mut queue: VecDeque<PackageName> = by_name
            .get(name)
            .map(|e| e.dependencies.iter().map(|(n, _)| n.clone()).collect())
            .unwrap_or_default();

        while let Some(dep) = queue.pop_front() {
            if !seen.insert(dep.clone()) {
                continue;
            }
            if let Some(entry) = by_name.get(dep.as_str()) {
                for (next, kind) in &entry.dependencies {
                    if *kind != DependencyKind::Build {
                        queue.push_back(next.clone());
                    }
                }
            }
        }

        self.entries
            .iter()
            .map(|e| e.name().clone())
            .filter(|n| seen.contains(n))
            .collect()
    }

    /// Partition the plan into layers with Kahn's algorithm.
    ///
    /// Each layer only depends on earlier layers, so its members can be
    /// processed concurrently. Within a layer, plan order is kept.
    pub fn layers(&self) -> Vec<Vec<PackageName>> {
        let mut adjacency: HashMap<&PackageName, Vec<usize>> = HashMap::new();
        let mut in_degree: Vec<usize> = vec![0; self.entries.len()];

        for (idx, entry) in self.entries.iter().enumerate() {
            for (dep, _) in &entry.dependencies {
                adjacency.entry(dep).or_default().push(idx);
                in_degree[idx] += 1;
            }
        }

        let mut layers = Vec::new();
        let mut current: Vec<usize> = (0..self.entries.len())
            .filter(|&i| in_degree[i] == 0)
            .collect();

        while !current.is_empty() {
            let mut next = Vec::new();
            for &u in &current {
                if let Some(dependents) = adjacency.get(self.entries[u].name()) {
                    for &v in dependents {
                        in_degree[v] -= 1;
                        if in_degree[v] == 0 {
                            next.push(v);
                        }
                    }
                }
            }
            layers.push(
                current
                    .iter()
                    .map(|&i| self.entries[i].name().clone())
                    .collect(),
            );
            next.sort_unstable();
            current = next;
        }

        layers
    }
}

/// Resolves the given targets against `formulas`.
///
/// # Errors
///
/// Returns a [`ResolveError`] if a formula is missing, disabled, part of a
/// cycle, or if version or variant requirements cannot be met.
pub fn resolve(
    formulas: &FormulaSet,
    targets: &[PackageName],
    options: &ResolveOptions,
) -> Result<ResolutionPlan, ResolveError> {
    let mut resolver = Resolver {
        formulas,
        targets,
        options,
        variants: BTreeMap::new(),
    };
    resolver.collect_variants()?;

    let mut order = Vec::new();
    let mut visited = HashSet::new();
    let mut stack = Vec::new();
    for name in targets {
        resolver.visit(name, None, &mut order, &mut visited, &mut stack)?;
    }

    resolver.check_constraints(&order)?;

    let runtime = resolver.runtime_reachable();
    let entries = order
        .into_iter()
        .map(|name| {
            let formula = resolver.formula(&name, None)?;
            let head = resolver.is_head(&name);
            let variants = resolver.variants.get(&name).cloned().unwrap_or_default();
            let dependencies = Resolver::effective_deps(&formula, head, &variants)
                .map(|d| (d.name.clone(), d.kind))
                .collect();
            Ok(PlanEntry {
                runtime_required: runtime.contains(&name),
                requested: targets.contains(&name),
                head,
                variants,
                dependencies,
                formula,
            })
        })
        .collect::<Result<Vec<_>, ResolveError>>()?;

    Ok(ResolutionPlan { entries })
}

struct Resolver<'a> {
    formulas: &'a FormulaSet,
    targets: &'a [PackageName],
    options: &'a ResolveOptions,
    variants: BTreeMap<PackageName, BTreeSet<String>>,
}

impl Resolver<'_> {
    fn formula(
        &self,
        name: &PackageName,
        required_by: Option<&PackageName>,
    ) -> Result<Arc<Formula>, ResolveError> {
        let formula = self
            .formulas
            .get(name)
            .cloned()
            .ok_or_else(|| ResolveError::UnknownDependency {
                name: name.clone(),
                required_by: required_by.cloned(),
            })?;
        if let Some(disabled) = &formula.package.disabled {
            return Err(ResolveError::Disabled {
                name: name.clone(),
                date: disabled.date.clone(),
                because: disabled.because.clone(),
            });
        }
        Ok(formula)
    }

    fn is_head(&self, name: &PackageName) -> bool {
        self.options.head && self.targets.contains(name)
    }

    fn effective_deps<'f>(
        formula: &'f Formula,
        head: bool,
        variants: &'f BTreeSet<String>,
    ) -> impl Iterator<Item = &'f DependencySpec> {
        formula.dependencies_for(head).filter(move |d| {
            d.kind != DependencyKind::Optional || variants.contains(&d.gating_variant())
        })
    }

    /// Fixed point over variant requests: enabling a variant can pull in an
    /// optional dependency whose own `with` list enables more variants.
    fn collect_variants(&mut self) -> Result<(), ResolveError> {
        let mut queue: VecDeque<PackageName> = VecDeque::new();
        for target in self.targets {
            let formula = self.formula(target, None)?;
            let entry = self.variants.entry(target.clone()).or_default();
            for variant in &self.options.variants {
                if !formula.declared_variants().contains(variant) {
                    return Err(undeclared_variant(&formula, "user", variant));
                }
                entry.insert(variant.clone());
            }
            queue.push_back(target.clone());
        }

        while let Some(name) = queue.pop_front() {
            let formula = self.formula(&name, None)?;
            let head = self.is_head(&name);
            let enabled = self.variants.get(&name).cloned().unwrap_or_default();
            for dep in Self::effective_deps(&formula, head, &enabled) {
                let target = self.formula(&dep.name, Some(&name))?;
                let first_seen = !self.variants.contains_key(&dep.name);
                let set = self.variants.entry(dep.name.clone()).or_default();
                let mut grew = false;
                for variant in &dep.with {
                    if !target.declared_variants().contains(variant) {
                        return Err(undeclared_variant(&target, name.as_str(), variant));
                    }
                    grew |= set.insert(variant.clone());
                }
                if first_seen || grew {
                    queue.push_back(dep.name.clone());
                }
            }
        }
        Ok(())
    }

    fn visit(
        &self,
        name: &PackageName,
        required_by: Option<&PackageName>,
        order: &mut Vec<PackageName>,
        visited: &mut HashSet<PackageName>,
        stack: &mut Vec<PackageName>,
    ) -> Result<(), ResolveError> {
        if visited.contains(name) {
            return Ok(());
        }
        if let Some(start) = stack.iter().position(|n| n == name) {
            let mut path = stack[start..].to_vec();
            path.push(name.clone());
            return Err(ResolveError::Cycle { path });
        }

        let formula = self.formula(name, required_by)?;
        stack.push(name.clone());

        let empty = BTreeSet::new();
        let enabled = self.variants.get(name).unwrap_or(&empty);
        for dep in Self::effective_deps(&formula, self.is_head(name), enabled) {
            self.visit(&dep.name, Some(name), order, visited, stack)?;
        }

        stack.pop();
        visited.insert(name.clone());
        order.push(name.clone());
        Ok(())
    }

    fn check_constraints(&self, order: &[PackageName]) -> Result<(), ResolveError> {
        let mut requirements: BTreeMap<PackageName, Vec<(String, semver::VersionReq)>> =
            BTreeMap::new();
        for name in order {
            let formula = self.formula(name, None)?;
            let empty = BTreeSet::new();
            let enabled = self.variants.get(name).unwrap_or(&empty);
            for dep in Self::effective_deps(&formula, self.is_head(name), enabled) {
                if let Some(req) = &dep.version {
                    requirements
                        .entry(dep.name.clone())
                        .or_default()
                        .push((name.to_string(), req.clone()));
                }
            }
        }

        for (name, reqs) in requirements {
            let formula = self.formula(&name, None)?;
            let available = formula.package.version.clone();
            let satisfied = available
                .semver()
                .is_some_and(|v| reqs.iter().all(|(_, req)| req.matches(&v)));
            if !satisfied {
                return Err(ResolveError::VersionConflict {
                    name,
                    available,
                    requirements: reqs
                        .into_iter()
                        .map(|(who, req)| (who, req.to_string()))
                        .collect(),
                });
            }
        }
        Ok(())
    }

    /// Formulas reachable from a target without crossing a build-only edge.
    fn runtime_reachable(&self) -> HashSet<PackageName> {
        let mut seen = HashSet::new();
        let mut queue: VecDeque<PackageName> = self.targets.iter().cloned().collect();
        while let Some(name) = queue.pop_front() {
            if !seen.insert(name.clone()) {
                continue;
            }
            let Some(formula) = self.formulas.get(&name) else {
                continue;
            };
            let empty = BTreeSet::new();
            let enabled = self.variants.get(&name).unwrap_or(&empty);
            for dep in Self::effective_deps(formula, self.is_head(&name), enabled) {
                if dep.kind != DependencyKind::Build {
                    queue.push_back(dep.name.clone());
                }
            }
        }
        seen
    }
}

fn undeclared_variant(formula: &Formula, requirer: &str, variant: &str) -> ResolveError {
    ResolveError::VersionConflict {
        name: formula.name().clone(),
        available: formula.package.version.clone(),
        requirements: vec![(requirer.to_string(), format!("variant '{variant}'"))],
    }
}
