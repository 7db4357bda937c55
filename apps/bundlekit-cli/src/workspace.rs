//! YAML workspace manifest: the module set, its requirement metadata, build
//! state and the lifecycle state to start from.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use bundlekit::{
    ActivationPolicy, BuildState, BuildStateSource, Capability, ClosureSorter, DependencyGraph,
    DuplicateCandidate, DuplicateGroup, DuplicateResolver, IdentityKey, ModuleId, ModuleRecord,
    ModuleRegistry, ModuleState, RequirementSource,
};

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct WorkspaceManifest {
    #[serde(default)]
    pub modules: Vec<ModuleEntry>,
}

/// One module. `requires` entries containing `:` are capabilities taken
/// verbatim; a bare name means "requires module <name>".
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ModuleEntry {
    pub name: String,
    /// Defaults to `name`.
    #[serde(default)]
    pub symbolic_name: Option<String>,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub requires: Vec<String>,
    #[serde(default)]
    pub provides: Vec<String>,
    #[serde(default = "installed")]
    pub state: ModuleState,
    #[serde(default)]
    pub activated: bool,
    #[serde(default)]
    pub lazy: bool,
    #[serde(default)]
    pub build_errors: bool,
    #[serde(default)]
    pub missing_build_state: bool,
    /// Symbolic name in the workspace, if it differs from the installed one.
    #[serde(default)]
    pub workspace_name: Option<String>,
    /// Version in the workspace, if it differs from the installed one.
    #[serde(default)]
    pub workspace_version: Option<String>,
}

fn installed() -> ModuleState {
    ModuleState::Installed
}

impl ModuleEntry {
    fn identity_key(&self) -> IdentityKey {
        let name = self.symbolic_name.as_deref().unwrap_or(&self.name);
        if self.state == ModuleState::Uninstalled {
            return IdentityKey::empty();
        }
        IdentityKey::new(name, self.version.clone())
    }

    fn workspace_key(&self) -> Option<IdentityKey> {
        if self.workspace_name.is_none() && self.workspace_version.is_none() {
            return None;
        }
        let name = self
            .workspace_name
            .as_deref()
            .or(self.symbolic_name.as_deref())
            .unwrap_or(&self.name);
        let version = self.workspace_version.as_deref().unwrap_or(&self.version);
        Some(IdentityKey::new(name, version))
    }
}

fn parse_requirement(raw: &str) -> Capability {
    if raw.contains(':') {
        Capability::new(raw)
    } else {
        Capability::module(raw)
    }
}

/// A loaded manifest, indexed by module id.
#[derive(Debug, Clone)]
pub struct Workspace {
    order: Vec<ModuleId>,
    entries: HashMap<ModuleId, ModuleEntry>,
}

/// Something `check` found wrong with a workspace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Finding {
    UnknownRequirement {
        module: ModuleId,
        requirement: Capability,
    },
    Cycle(Vec<ModuleId>),
    DuplicateIdentity(DuplicateGroup),
}

impl fmt::Display for Finding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownRequirement {
                module,
                requirement,
            } => write!(f, "{module}: nothing provides '{requirement}'"),
            Self::Cycle(members) => {
                let names: Vec<&str> = members.iter().map(ModuleId::as_str).collect();
                write!(f, "cycle: {}", names.join(" -> "))
            }
            Self::DuplicateIdentity(group) => {
                let names: Vec<&str> = group.members.iter().map(ModuleId::as_str).collect();
                write!(f, "duplicate identity {}: {}", group.key, names.join(", "))
            }
        }
    }
}

impl Workspace {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read manifest {}", path.display()))?;
        Self::from_yaml(&raw).with_context(|| format!("Invalid manifest {}", path.display()))
    }

    pub fn from_yaml(raw: &str) -> Result<Self> {
        let manifest: WorkspaceManifest = serde_yaml::from_str(raw)?;
        Self::from_manifest(manifest)
    }

    pub fn from_manifest(manifest: WorkspaceManifest) -> Result<Self> {
        let mut order = Vec::with_capacity(manifest.modules.len());
        let mut entries = HashMap::with_capacity(manifest.modules.len());
        for entry in manifest.modules {
            if entry.name.trim().is_empty() {
                bail!("module with an empty name");
            }
            let id = ModuleId::new(&entry.name);
            if entries.contains_key(&id) {
                bail!("module '{id}' is listed twice");
            }
            order.push(id.clone());
            entries.insert(id, entry);
        }
        Ok(Self { order, entries })
    }

    pub fn ids(&self) -> &[ModuleId] {
        &self.order
    }

    pub fn contains(&self, id: &ModuleId) -> bool {
        self.entries.contains_key(id)
    }

    /// Registry populated in manifest order.
    pub fn registry(&self) -> Result<ModuleRegistry> {
        let registry = ModuleRegistry::new();
        for id in &self.order {
            let entry = &self.entries[id];
            let policy = if entry.lazy {
                ActivationPolicy::Lazy
            } else {
                ActivationPolicy::Eager
            };
            let record = ModuleRecord::new(id.clone(), entry.identity_key())
                .with_state(entry.state)
                .with_activated(entry.activated)
                .with_policy(policy);
            registry.insert(record)?;
        }
        Ok(registry)
    }

    /// Unknown requirement targets, dependency cycles and identity collisions.
    pub fn check(&self) -> Result<Vec<Finding>> {
        let mut findings = Vec::new();

        let provided: HashSet<Capability> = self
            .order
            .iter()
            .flat_map(|id| self.capabilities(id))
            .collect();
        for id in &self.order {
            for requirement in self.requirements(id) {
                if !provided.contains(&requirement) {
                    findings.push(Finding::UnknownRequirement {
                        module: id.clone(),
                        requirement,
                    });
                }
            }
        }

        let graph = DependencyGraph::build(&self.order, self);
        let closure = ClosureSorter::new(&graph).sort_providing(&self.order, true)?;
        findings.extend(closure.cycles().into_iter().map(Finding::Cycle));

        let registry = self.registry()?;
        let snapshot = registry.snapshot();
        let candidates = DuplicateCandidate::candidates(&snapshot, &self.order, self);
        let groups = DuplicateResolver.resolve(&candidates, &snapshot)?;
        findings.extend(groups.into_values().map(Finding::DuplicateIdentity));

        Ok(findings)
    }
}

impl RequirementSource for Workspace {
    fn requirements(&self, module: &ModuleId) -> Vec<Capability> {
        self.entries
            .get(module)
            .map(|e| e.requires.iter().map(|r| parse_requirement(r)).collect())
            .unwrap_or_default()
    }

    fn capabilities(&self, module: &ModuleId) -> Vec<Capability> {
        let Some(entry) = self.entries.get(module) else {
            return Vec::new();
        };
        let mut caps = vec![Capability::module(&entry.name)];
        caps.extend(entry.provides.iter().map(Capability::new));
        caps
    }

    fn workspace_key(&self, module: &ModuleId) -> Option<IdentityKey> {
        self.entries.get(module).and_then(ModuleEntry::workspace_key)
    }
}

impl BuildStateSource for Workspace {
    fn build_state(&self, module: &ModuleId) -> BuildState {
        self.entries
            .get(module)
            .map(|e| BuildState {
                has_errors: e.build_errors,
                missing_build_state: e.missing_build_state,
            })
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    const MANIFEST: &str = r#"
modules:
  - name: core
    version: "1.0"
    provides: ["package:core.api"]
    state: resolved
  - name: lib
    version: "2.0"
    requires: ["package:core.api"]
  - name: app
    version: "0.1"
    requires: [lib]
    lazy: true
    build_errors: true
"#;

    #[test]
    fn manifest_builds_graph_and_registry() {
        let ws = Workspace::from_yaml(MANIFEST).unwrap();
        let graph = DependencyGraph::build(ws.ids(), &ws);
        assert_eq!(graph.providers_of(&"app".into()), vec![ModuleId::new("lib")]);
        assert_eq!(graph.providers_of(&"lib".into()), vec![ModuleId::new("core")]);

        let registry = ws.registry().unwrap();
        assert_eq!(registry.ids(), ws.ids());
        let app = registry.get(&"app".into()).unwrap();
        assert_eq!(app.state, ModuleState::Installed);
        assert_eq!(app.activation_policy, ActivationPolicy::Lazy);
        assert_eq!(app.identity_key, IdentityKey::new("app", "0.1"));
        assert!(ws.build_state(&"app".into()).has_errors);
    }

    #[test]
    fn check_reports_problems() {
        let ws = Workspace::from_yaml(
            r#"
modules:
  - name: a
    requires: [b, ghost]
  - name: b
    requires: [a]
  - name: c
    symbolic_name: a
"#,
        )
        .unwrap();

        let findings = ws.check().unwrap();
        assert!(findings.contains(&Finding::UnknownRequirement {
            module: "a".into(),
            requirement: Capability::module("ghost"),
        }));
        assert!(findings.contains(&Finding::Cycle(vec!["a".into(), "b".into()])));
        assert!(findings
            .iter()
            .any(|f| matches!(f, Finding::DuplicateIdentity(g) if g.members.len() == 2)));
    }

    #[test]
    fn workspace_key_only_when_changed() {
        let ws = Workspace::from_yaml(
            r#"
modules:
  - name: a
    version: "1.0"
    workspace_version: "1.1"
  - name: b
    version: "1.0"
"#,
        )
        .unwrap();
        assert_eq!(
            ws.workspace_key(&"a".into()),
            Some(IdentityKey::new("a", "1.1"))
        );
        assert_eq!(ws.workspace_key(&"b".into()), None);
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let err = Workspace::from_yaml("modules:\n  - name: a\n  - name: a\n").unwrap_err();
        assert!(err.to_string().contains("listed twice"));
    }

    #[test]
    fn load_reads_from_disk() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("workspace.yaml");
        fs::write(&path, MANIFEST).unwrap();
        assert_eq!(Workspace::load(&path).unwrap().ids().len(), 3);

        let missing = Workspace::load(&dir.path().join("nope.yaml")).unwrap_err();
        assert!(format!("{missing:#}").contains("nope.yaml"));
    }
}
