//! Closure Policy Engine
//!
//! Decides which modules must join a seed set before an operation is safe to
//! run, and in which order. Works on a registry snapshot and never writes.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::closure::{Closure, ClosureSorter, CycleError, Direction};
use crate::contracts::{BuildStateSource, RequirementSource};
use crate::graph::DependencyGraph;
use crate::lifecycle::{ModuleState, TransitionKind};
use crate::model::ModuleId;
use crate::registry::RegistrySnapshot;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Activate,
    Deactivate,
    Start,
    Stop,
    Update,
    Refresh,
    Uninstall,
}

impl OperationKind {
    pub const ALL: [OperationKind; 7] = [
        Self::Activate,
        Self::Deactivate,
        Self::Start,
        Self::Stop,
        Self::Update,
        Self::Refresh,
        Self::Uninstall,
    ];

    /// Operations that bring modules up and therefore need their dependencies.
    fn pulls_providers(self) -> bool {
        matches!(self, Self::Activate | Self::Start)
    }

    /// Operations that take modules down and therefore drag their dependents along.
    fn pulls_dependents(self) -> bool {
        matches!(self, Self::Deactivate | Self::Stop | Self::Uninstall)
    }

    /// Build state only matters when a module is about to run new code.
    fn checks_build_state(self) -> bool {
        matches!(
            self,
            Self::Activate | Self::Start | Self::Update | Self::Refresh
        )
    }

    /// Transition kinds in the order a driver runs them across the working set.
    pub fn phases(self) -> &'static [TransitionKind] {
        use TransitionKind as T;

        match self {
            Self::Activate => &[T::Activate, T::Install, T::Resolve, T::Start],
            Self::Deactivate => &[T::Stop, T::Deactivate],
            Self::Start => &[T::Resolve, T::Start],
            Self::Stop => &[T::Stop],
            Self::Update => &[T::Update, T::Resolve, T::Start],
            Self::Refresh => &[T::Refresh],
            Self::Uninstall => &[T::Stop, T::Uninstall],
        }
    }

    /// Per-module transitions this operation needs, starting from `state`.
    pub fn transitions_from(self, state: ModuleState) -> Vec<TransitionKind> {
        use ModuleState as S;
        use TransitionKind as T;

        match self {
            Self::Activate => {
                let mut steps = vec![T::Activate];
                steps.extend(match state {
                    S::Uninstalled => vec![T::Install, T::Resolve, T::Start],
                    S::Installed => vec![T::Resolve, T::Start],
                    S::Resolved => vec![T::Start],
                    _ => vec![],
                });
                steps
            }
            Self::Deactivate => {
                let mut steps = Vec::new();
                if state.is_running() {
                    steps.push(T::Stop);
                }
                steps.push(T::Deactivate);
                steps
            }
            Self::Start => match state {
                S::Installed => vec![T::Resolve, T::Start],
                S::Resolved | S::LazyPending => vec![T::Start],
                _ => vec![],
            },
            Self::Stop => match state {
                S::Active | S::LazyPending => vec![T::Stop],
                _ => vec![],
            },
            Self::Update => match state {
                S::Installed | S::Resolved => vec![T::Update, T::Resolve],
                S::Active | S::LazyPending => vec![T::Update, T::Resolve, T::Start],
                _ => vec![],
            },
            Self::Refresh => match state {
                S::Installed | S::Resolved | S::Active | S::LazyPending => vec![T::Refresh],
                _ => vec![],
            },
            Self::Uninstall => match state {
                S::Uninstalled => vec![],
                S::Active | S::LazyPending => vec![T::Stop, T::Uninstall],
                _ => vec![T::Uninstall],
            },
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Activate => "activate",
            Self::Deactivate => "deactivate",
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Update => "update",
            Self::Refresh => "refresh",
            Self::Uninstall => "uninstall",
        };
        f.write_str(s)
    }
}

impl FromStr for OperationKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|op| op.to_string().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown operation '{s}'"))
    }
}

/// Which modules the graph may reach into.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    #[default]
    All,
    /// Only modules whose activation flag is set (seeds are always in scope).
    Activated,
    Custom(Vec<ModuleId>),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DependencyOptions {
    pub allow_cycles: bool,
    /// Activate also pulls in the modules that depend on the seed.
    pub include_requiring_on_activate: bool,
    /// Deactivate also pulls in the modules the seed depends on.
    pub include_providing_on_deactivate: bool,
    pub scope: Scope,
    pub exclude_build_errors: bool,
}

impl Scope {
    /// Registered modules the graph may use for `seed`. Seeds are always
    /// included when registered; unknown ids are dropped.
    pub fn candidates(&self, snapshot: &RegistrySnapshot, seed: &[ModuleId]) -> Vec<ModuleId> {
        let mut out: Vec<ModuleId> = match self {
            Scope::All => snapshot.ids().cloned().collect(),
            Scope::Activated => snapshot
                .modules
                .iter()
                .filter(|m| m.activated)
                .map(|m| m.id.clone())
                .collect(),
            Scope::Custom(list) => list
                .iter()
                .filter(|id| snapshot.get(id).is_some())
                .cloned()
                .collect(),
        };
        for id in seed {
            if snapshot.get(id).is_some() && !out.contains(id) {
                out.push(id.clone());
            }
        }
        out
    }
}

impl Default for DependencyOptions {
    fn default() -> Self {
        Self {
            allow_cycles: false,
            include_requiring_on_activate: false,
            include_providing_on_deactivate: false,
            scope: Scope::All,
            exclude_build_errors: true,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExclusionReason {
    BuildErrors,
    MissingBuildState,
    /// Transitively depends on the named excluded module.
    DependsOnExcluded(ModuleId),
    NotInstalled,
}

impl fmt::Display for ExclusionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BuildErrors => f.write_str("has build errors"),
            Self::MissingBuildState => f.write_str("has no build state"),
            Self::DependsOnExcluded(root) => write!(f, "depends on excluded module '{root}'"),
            Self::NotInstalled => f.write_str("is not installed"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Exclusion {
    pub module: ModuleId,
    pub reason: ExclusionReason,
}

/// The modules an operation will touch, in the order it must touch them.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkingSet {
    pub operation: OperationKind,
    /// `Providing` when `ordered` lists dependencies first.
    pub direction: Direction,
    pub ordered: Vec<ModuleId>,
    pub excluded: Vec<Exclusion>,
    /// Tolerated cycles (only with `allow_cycles`).
    pub cycles: Vec<Vec<ModuleId>>,
}

impl WorkingSet {
    pub fn is_excluded(&self, id: &ModuleId) -> bool {
        self.excluded.iter().any(|e| &e.module == id)
    }

    /// `ordered` with dependencies first, whatever order it was planned in.
    pub fn dependencies_first(&self) -> Vec<ModuleId> {
        self.in_direction(Direction::Providing)
    }

    /// `ordered` with dependents first.
    pub fn dependents_first(&self) -> Vec<ModuleId> {
        self.in_direction(Direction::Requiring)
    }

    fn in_direction(&self, direction: Direction) -> Vec<ModuleId> {
        let mut out = self.ordered.clone();
        if direction != self.direction {
            out.reverse();
        }
        out
    }
}

pub struct PolicyEngine<'a> {
    snapshot: &'a RegistrySnapshot,
    requirements: &'a dyn RequirementSource,
    build_state: &'a dyn BuildStateSource,
}

impl<'a> PolicyEngine<'a> {
    pub fn new(
        snapshot: &'a RegistrySnapshot,
        requirements: &'a dyn RequirementSource,
        build_state: &'a dyn BuildStateSource,
    ) -> Self {
        Self {
            snapshot,
            requirements,
            build_state,
        }
    }

    /// Compute the working set for `operation` on `seed`.
    ///
    /// A cycle that is not tolerated rejects the whole seed set.
    pub fn plan(
        &self,
        seed: &[ModuleId],
        operation: OperationKind,
        options: &DependencyOptions,
    ) -> Result<WorkingSet, CycleError> {
        let candidates = options.scope.candidates(self.snapshot, seed);
        let graph = DependencyGraph::build(&candidates, self.requirements);
        let sorter = ClosureSorter::new(&graph);
        let allow = options.allow_cycles;

        let mut closures: Vec<Closure> = Vec::new();
        let mut direction = Direction::Requiring;
        let ordered = if operation.pulls_providers() {
            direction = Direction::Providing;
            let providing = sorter.sort_providing(seed, allow)?;
            if operation == OperationKind::Activate && options.include_requiring_on_activate {
                let requiring = sorter.sort_requiring(seed, allow)?;
                let union = merge(&providing, &requiring);
                closures.extend([providing, requiring]);
                self.order_within(&union, Direction::Providing, allow, &mut closures)?
            } else {
                let order = providing.modules().to_vec();
                closures.push(providing);
                order
            }
        } else if operation.pulls_dependents() {
            let requiring = sorter.sort_requiring(seed, allow)?;
            if operation == OperationKind::Deactivate && options.include_providing_on_deactivate {
                let providing = sorter.sort_providing(seed, allow)?;
                let union = merge(&requiring, &providing);
                closures.extend([requiring, providing]);
                self.order_within(&union, Direction::Requiring, allow, &mut closures)?
            } else {
                let order = requiring.modules().to_vec();
                closures.push(requiring);
                order
            }
        } else {
            let requiring = sorter.sort_requiring(seed, allow)?;
            if let Some(changed) = self.first_key_change(requiring.modules()) {
                tracing::debug!(module = %changed, "symbolic name changes, including providers");
                let providing = sorter.sort_providing(seed, allow)?;
                let union = merge(&requiring, &providing);
                closures.extend([requiring, providing]);
                direction = Direction::Providing;
                self.order_within(&union, Direction::Providing, allow, &mut closures)?
            } else {
                let order = requiring.modules().to_vec();
                closures.push(requiring);
                order
            }
        };

        let mut cycles: Vec<Vec<ModuleId>> = Vec::new();
        for cycle in closures.iter().flat_map(Closure::cycles) {
            if !cycles.contains(&cycle) {
                cycles.push(cycle);
            }
        }

        let excluded = self.exclusions(&ordered, &graph, operation, options);
        let ordered: Vec<ModuleId> = ordered
            .into_iter()
            .filter(|m| !excluded.iter().any(|e| &e.module == m))
            .collect();

        tracing::debug!(
            operation = %operation,
            ordered = ?ordered,
            excluded = excluded.len(),
            "working set planned"
        );
        for exclusion in &excluded {
            tracing::warn!(
                module = %exclusion.module,
                reason = %exclusion.reason,
                "module excluded from {operation}"
            );
        }

        Ok(WorkingSet {
            operation,
            direction,
            ordered,
            excluded,
            cycles,
        })
    }

    /// Order `set` among itself only, so the union never grows further.
    fn order_within(
        &self,
        set: &[ModuleId],
        direction: Direction,
        allow_cycles: bool,
        closures: &mut Vec<Closure>,
    ) -> Result<Vec<ModuleId>, CycleError> {
        let graph = DependencyGraph::build(set, self.requirements);
        let closure = ClosureSorter::new(&graph).sort(set, direction, allow_cycles)?;
        let order = closure.modules().to_vec();
        closures.push(closure);
        Ok(order)
    }

    fn first_key_change<'m>(&self, modules: &'m [ModuleId]) -> Option<&'m ModuleId> {
        modules.iter().find(|id| {
            let Some(record) = self.snapshot.get(id) else {
                return false;
            };
            match self.requirements.workspace_key(id) {
                Some(next) => {
                    !record.identity_key.is_empty() && next.name != record.identity_key.name
                }
                None => false,
            }
        })
    }

    fn exclusions(
        &self,
        ordered: &[ModuleId],
        graph: &DependencyGraph,
        operation: OperationKind,
        options: &DependencyOptions,
    ) -> Vec<Exclusion> {
        let mut reasons: HashMap<ModuleId, ExclusionReason> = HashMap::new();
        let mut queue = VecDeque::new();

        for id in ordered {
            let reason = if operation == OperationKind::Start
                && self
                    .snapshot
                    .get(id)
                    .is_some_and(|r| r.state == ModuleState::Uninstalled)
            {
                Some(ExclusionReason::NotInstalled)
            } else if options.exclude_build_errors && operation.checks_build_state() {
                let state = self.build_state.build_state(id);
                if state.has_errors {
                    Some(ExclusionReason::BuildErrors)
                } else if state.missing_build_state {
                    Some(ExclusionReason::MissingBuildState)
                } else {
                    None
                }
            } else {
                None
            };
            if let Some(reason) = reason {
                reasons.insert(id.clone(), reason);
                queue.push_back((id.clone(), id.clone()));
            }
        }

        let in_set: HashSet<&ModuleId> = ordered.iter().collect();
        while let Some((id, root)) = queue.pop_front() {
            for dependent in graph.dependents_of(&id) {
                if !in_set.contains(&dependent) || reasons.contains_key(&dependent) {
                    continue;
                }
                reasons.insert(
                    dependent.clone(),
                    ExclusionReason::DependsOnExcluded(root.clone()),
                );
                queue.push_back((dependent, root.clone()));
            }
        }

        ordered
            .iter()
            .filter_map(|id| {
                reasons.remove(id).map(|reason| Exclusion {
                    module: id.clone(),
                    reason,
                })
            })
            .collect()
    }
}

/// `first` followed by the members of `second` not already in it.
fn merge(first: &Closure, second: &Closure) -> Vec<ModuleId> {
    let mut out = first.modules().to_vec();
    for id in second.modules() {
        if !out.contains(id) {
            out.push(id.clone());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::contracts::{BuildState, NoBuildState};
    use crate::graph::test_support::{ids, StaticRequirements};
    use crate::model::{IdentityKey, ModuleRecord};

    struct Broken(HashMap<ModuleId, BuildState>);

    impl BuildStateSource for Broken {
        fn build_state(&self, module: &ModuleId) -> BuildState {
            self.0.get(module).copied().unwrap_or_default()
        }
    }

    fn snapshot(modules: &[(&str, ModuleState)]) -> RegistrySnapshot {
        RegistrySnapshot {
            modules: modules
                .iter()
                .map(|(id, state)| {
                    ModuleRecord::new(ModuleId::new(id), IdentityKey::new(*id, "1.0"))
                        .with_state(*state)
                })
                .collect(),
        }
    }

    fn names(ids: &[ModuleId]) -> Vec<&str> {
        ids.iter().map(ModuleId::as_str).collect()
    }

    #[test]
    fn activate_pulls_in_dependencies_first() {
        let snap = snapshot(&[
            ("App", ModuleState::Uninstalled),
            ("Lib", ModuleState::Uninstalled),
        ]);
        let source = StaticRequirements::new().requires("App", &["Lib"]);
        let engine = PolicyEngine::new(&snap, &source, &NoBuildState);

        let ws = engine
            .plan(&ids(&["App"]), OperationKind::Activate, &DependencyOptions::default())
            .unwrap();
        assert_eq!(names(&ws.ordered), vec!["Lib", "App"]);
        assert!(ws.excluded.is_empty());
    }

    #[test]
    fn stop_drags_dependents_along_first() {
        let snap = snapshot(&[
            ("app", ModuleState::Active),
            ("lib", ModuleState::Active),
            ("other", ModuleState::Active),
        ]);
        let source = StaticRequirements::new().requires("app", &["lib"]);
        let engine = PolicyEngine::new(&snap, &source, &NoBuildState);

        let ws = engine
            .plan(&ids(&["lib"]), OperationKind::Stop, &DependencyOptions::default())
            .unwrap();
        assert_eq!(names(&ws.ordered), vec!["app", "lib"]);
    }

    #[test]
    fn cycle_rejects_the_whole_seed() {
        let snap = snapshot(&[
            ("A", ModuleState::Installed),
            ("B", ModuleState::Installed),
            ("C", ModuleState::Installed),
        ]);
        let source = StaticRequirements::new()
            .requires("A", &["B"])
            .requires("B", &["C"])
            .requires("C", &["A"]);
        let engine = PolicyEngine::new(&snap, &source, &NoBuildState);

        let err = engine
            .plan(&ids(&["A"]), OperationKind::Activate, &DependencyOptions::default())
            .unwrap_err();
        assert_eq!(names(&err.members), vec!["A", "B", "C"]);

        let tolerant = DependencyOptions {
            allow_cycles: true,
            ..Default::default()
        };
        let ws = engine
            .plan(&ids(&["A"]), OperationKind::Activate, &tolerant)
            .unwrap();
        assert_eq!(ws.ordered.len(), 3);
        assert_eq!(ws.cycles, vec![ids(&["A", "B", "C"])]);
    }

    #[test]
    fn build_errors_exclude_the_module_and_its_dependents() {
        let snap = snapshot(&[
            ("app", ModuleState::Installed),
            ("lib", ModuleState::Installed),
            ("core", ModuleState::Installed),
        ]);
        let source = StaticRequirements::new()
            .requires("app", &["lib"])
            .requires("lib", &["core"]);
        let build = Broken(HashMap::from([(
            ModuleId::new("lib"),
            BuildState {
                has_errors: true,
                missing_build_state: false,
            },
        )]));
        let engine = PolicyEngine::new(&snap, &source, &build);

        let ws = engine
            .plan(&ids(&["app"]), OperationKind::Activate, &DependencyOptions::default())
            .unwrap();
        assert_eq!(names(&ws.ordered), vec!["core"]);
        assert_eq!(
            ws.excluded,
            vec![
                Exclusion {
                    module: "lib".into(),
                    reason: ExclusionReason::BuildErrors
                },
                Exclusion {
                    module: "app".into(),
                    reason: ExclusionReason::DependsOnExcluded("lib".into())
                },
            ]
        );
    }

    #[test]
    fn taking_a_broken_module_down_is_always_legal() {
        let snap = snapshot(&[("lib", ModuleState::Active)]);
        let source = StaticRequirements::new();
        let build = Broken(HashMap::from([(
            ModuleId::new("lib"),
            BuildState {
                has_errors: true,
                missing_build_state: true,
            },
        )]));
        let engine = PolicyEngine::new(&snap, &source, &build);

        for op in [
            OperationKind::Deactivate,
            OperationKind::Stop,
            OperationKind::Uninstall,
        ] {
            let ws = engine
                .plan(&ids(&["lib"]), op, &DependencyOptions::default())
                .unwrap();
            assert_eq!(names(&ws.ordered), vec!["lib"], "{op}");
        }
    }

    #[test]
    fn start_skips_uninstalled_modules() {
        let snap = snapshot(&[
            ("app", ModuleState::Resolved),
            ("lib", ModuleState::Uninstalled),
        ]);
        let source = StaticRequirements::new().requires("app", &["lib"]);
        let engine = PolicyEngine::new(&snap, &source, &NoBuildState);

        let ws = engine
            .plan(&ids(&["app"]), OperationKind::Start, &DependencyOptions::default())
            .unwrap();
        assert!(ws.ordered.is_empty());
        assert_eq!(ws.excluded[0].reason, ExclusionReason::NotInstalled);
        assert_eq!(
            ws.excluded[1].reason,
            ExclusionReason::DependsOnExcluded("lib".into())
        );
    }

    #[test]
    fn update_without_key_change_is_requiring_only() {
        let snap = snapshot(&[
            ("app", ModuleState::Active),
            ("lib", ModuleState::Active),
            ("core", ModuleState::Active),
        ]);
        let source = StaticRequirements::new()
            .requires("app", &["lib"])
            .requires("lib", &["core"]);
        let engine = PolicyEngine::new(&snap, &source, &NoBuildState);

        let ws = engine
            .plan(&ids(&["lib"]), OperationKind::Update, &DependencyOptions::default())
            .unwrap();
        assert_eq!(names(&ws.ordered), vec!["app", "lib"]);
    }

    #[test]
    fn update_with_symbolic_name_change_includes_both_directions() {
        let snap = snapshot(&[
            ("app", ModuleState::Active),
            ("lib", ModuleState::Active),
            ("core", ModuleState::Active),
        ]);
        let source = StaticRequirements::new()
            .requires("app", &["lib"])
            .requires("lib", &["core"])
            .workspace_key("lib", IdentityKey::new("lib.renamed", "2.0"));
        let engine = PolicyEngine::new(&snap, &source, &NoBuildState);

        let ws = engine
            .plan(&ids(&["lib"]), OperationKind::Update, &DependencyOptions::default())
            .unwrap();
        assert_eq!(names(&ws.ordered), vec!["core", "lib", "app"]);
    }

    #[test]
    fn version_only_change_keeps_requiring_order() {
        let snap = snapshot(&[("app", ModuleState::Active), ("lib", ModuleState::Active)]);
        let source = StaticRequirements::new()
            .requires("app", &["lib"])
            .workspace_key("lib", IdentityKey::new("lib", "2.0"));
        let engine = PolicyEngine::new(&snap, &source, &NoBuildState);

        let ws = engine
            .plan(&ids(&["lib"]), OperationKind::Refresh, &DependencyOptions::default())
            .unwrap();
        assert_eq!(names(&ws.ordered), vec!["app", "lib"]);
    }

    #[test]
    fn activated_scope_keeps_seeds_but_prunes_inactive_providers() {
        let mut snap = snapshot(&[
            ("app", ModuleState::Uninstalled),
            ("lib", ModuleState::Uninstalled),
            ("core", ModuleState::Installed),
        ]);
        snap.modules[2].activated = true;
        let source = StaticRequirements::new().requires("app", &["lib", "core"]);
        let engine = PolicyEngine::new(&snap, &source, &NoBuildState);

        let options = DependencyOptions {
            scope: Scope::Activated,
            ..Default::default()
        };
        let ws = engine
            .plan(&ids(&["app"]), OperationKind::Activate, &options)
            .unwrap();
        assert_eq!(names(&ws.ordered), vec!["core", "app"]);
    }

    #[test]
    fn activate_can_include_dependents() {
        let snap = snapshot(&[
            ("app", ModuleState::Uninstalled),
            ("lib", ModuleState::Uninstalled),
            ("core", ModuleState::Uninstalled),
        ]);
        let source = StaticRequirements::new()
            .requires("app", &["lib"])
            .requires("lib", &["core"]);
        let engine = PolicyEngine::new(&snap, &source, &NoBuildState);

        let options = DependencyOptions {
            include_requiring_on_activate: true,
            ..Default::default()
        };
        let ws = engine
            .plan(&ids(&["lib"]), OperationKind::Activate, &options)
            .unwrap();
        assert_eq!(names(&ws.ordered), vec!["core", "lib", "app"]);
    }

    #[test]
    fn deactivate_can_include_dependencies() {
        let snap = snapshot(&[
            ("app", ModuleState::Active),
            ("lib", ModuleState::Active),
            ("core", ModuleState::Active),
        ]);
        let source = StaticRequirements::new()
            .requires("app", &["lib"])
            .requires("lib", &["core"]);
        let engine = PolicyEngine::new(&snap, &source, &NoBuildState);

        let options = DependencyOptions {
            include_providing_on_deactivate: true,
            ..Default::default()
        };
        let ws = engine
            .plan(&ids(&["lib"]), OperationKind::Deactivate, &options)
            .unwrap();
        assert_eq!(names(&ws.ordered), vec!["app", "lib", "core"]);
    }

    #[test]
    fn working_set_can_be_walked_both_ways() {
        let snap = snapshot(&[("app", ModuleState::Active), ("lib", ModuleState::Active)]);
        let source = StaticRequirements::new().requires("app", &["lib"]);
        let engine = PolicyEngine::new(&snap, &source, &NoBuildState);

        let ws = engine
            .plan(&ids(&["lib"]), OperationKind::Update, &DependencyOptions::default())
            .unwrap();
        assert_eq!(ws.direction, Direction::Requiring);
        assert_eq!(names(&ws.dependents_first()), vec!["app", "lib"]);
        assert_eq!(names(&ws.dependencies_first()), vec!["lib", "app"]);
    }

    #[test]
    fn every_step_belongs_to_a_phase() {
        use ModuleState as S;
        for op in OperationKind::ALL {
            for state in [S::Uninstalled, S::Installed, S::Resolved, S::LazyPending, S::Active] {
                for step in op.transitions_from(state) {
                    assert!(op.phases().contains(&step), "{op} {state} {step}");
                }
            }
        }
    }

    #[test]
    fn transitions_per_operation() {
        use ModuleState as S;
        use TransitionKind as T;

        assert_eq!(
            OperationKind::Activate.transitions_from(S::Uninstalled),
            vec![T::Activate, T::Install, T::Resolve, T::Start]
        );
        assert_eq!(
            OperationKind::Deactivate.transitions_from(S::Active),
            vec![T::Stop, T::Deactivate]
        );
        assert_eq!(
            OperationKind::Update.transitions_from(S::Active),
            vec![T::Update, T::Resolve, T::Start]
        );
        assert!(OperationKind::Stop.transitions_from(S::Resolved).is_empty());
        assert_eq!(
            OperationKind::Uninstall.transitions_from(S::LazyPending),
            vec![T::Stop, T::Uninstall]
        );
    }

    #[test]
    fn operation_names_parse() {
        assert_eq!("Activate".parse::<OperationKind>(), Ok(OperationKind::Activate));
        assert_eq!("refresh".parse::<OperationKind>(), Ok(OperationKind::Refresh));
        assert!("explode".parse::<OperationKind>().is_err());
    }
}
