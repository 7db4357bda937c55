//! Duplicate/Singleton Resolver
//!
//! Groups resolution candidates by the identity key they will carry after the
//! pass. When several modules end up on one key, the module already holding
//! it stays and the others are excluded for exactly one resolution pass.

use std::collections::{BTreeMap, HashMap, HashSet};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::contracts::RequirementSource;
use crate::model::{IdentityKey, ModuleId};
use crate::registry::RegistrySnapshot;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DuplicateError {
    /// Each module is the new revision of the other.
    #[error("circular identity swap between '{a}' and '{b}'")]
    CircularIdentitySwap { a: ModuleId, b: ModuleId },
}

/// A module about to be resolved, with the key it has and the key it will have.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DuplicateCandidate {
    pub module: ModuleId,
    pub current: IdentityKey,
    pub incoming: IdentityKey,
}

impl DuplicateCandidate {
    /// Build candidates for `ids` from the registry (current key) and the
    /// requirement source (incoming key, falling back to the current one).
    /// Unknown ids are skipped.
    pub fn candidates(
        snapshot: &RegistrySnapshot,
        ids: &[ModuleId],
        source: &dyn RequirementSource,
    ) -> Vec<Self> {
        let mut seen = HashSet::new();
        ids.iter()
            .filter(|id| seen.insert((*id).clone()))
            .filter_map(|id| {
                let record = snapshot.get(id)?;
                let incoming = source
                    .workspace_key(id)
                    .unwrap_or_else(|| record.identity_key.clone());
                Some(Self {
                    module: id.clone(),
                    current: record.identity_key.clone(),
                    incoming,
                })
            })
            .collect()
    }
}

/// Modules that collide on one identity key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DuplicateGroup {
    pub key: IdentityKey,
    /// The member that stays eligible for resolution.
    pub incumbent: Option<ModuleId>,
    pub members: Vec<ModuleId>,
    pub excluded: Vec<ModuleId>,
}

pub type DuplicateGroups = BTreeMap<IdentityKey, DuplicateGroup>;

#[derive(Clone, Copy, Debug, Default)]
pub struct DuplicateResolver;

impl DuplicateResolver {
    pub fn resolve(
        &self,
        candidates: &[DuplicateCandidate],
        snapshot: &RegistrySnapshot,
    ) -> Result<DuplicateGroups, DuplicateError> {
        // Who carries each key right now. A resolved module wins over one
        // that is merely installed.
        let mut holders: HashMap<&IdentityKey, (&ModuleId, bool)> = HashMap::new();
        for record in &snapshot.modules {
            if !record.state.is_installed() || record.identity_key.is_empty() {
                continue;
            }
            let resolved = record.state.is_resolved();
            let slot = holders
                .entry(&record.identity_key)
                .or_insert((&record.id, resolved));
            if resolved && !slot.1 {
                *slot = (&record.id, resolved);
            }
        }

        let mut claims: BTreeMap<&IdentityKey, Vec<&ModuleId>> = BTreeMap::new();
        for candidate in candidates {
            if !candidate.incoming.is_empty() {
                claims
                    .entry(&candidate.incoming)
                    .or_default()
                    .push(&candidate.module);
            }
        }

        let moving: HashMap<&ModuleId, &IdentityKey> = candidates
            .iter()
            .filter(|c| !c.incoming.is_empty() && c.incoming != c.current)
            .map(|c| (&c.module, &c.incoming))
            .collect();

        let mut groups = DuplicateGroups::new();
        for (key, claimants) in claims {
            let vacating = |h: &ModuleId| moving.get(h).is_some_and(|k| *k != key);
            let holder = holders.get(key).copied();

            // A holder moving to another key vacates this one, unless the
            // chain of moves leads back to one of the claimants.
            if let Some((h, _)) = holder.filter(|(h, _)| vacating(*h)) {
                for a in claimants.iter().filter(|a| **a != h) {
                    if swaps_back(a, h, &moving, &holders) {
                        return Err(DuplicateError::CircularIdentitySwap {
                            a: (*a).clone(),
                            b: h.clone(),
                        });
                    }
                }
            }
            let holder = holder.filter(|(h, _)| !vacating(*h));

            let mut members: Vec<ModuleId> = Vec::with_capacity(claimants.len() + 1);
            if let Some((h, _)) = holder {
                if !claimants.contains(&h) {
                    members.push(h.clone());
                }
            }
            members.extend(claimants.iter().map(|m| (*m).clone()));
            if members.len() < 2 {
                continue;
            }

            let is_resolved =
                |m: &ModuleId| snapshot.get(m).is_some_and(|r| r.state.is_resolved());
            let incumbent = match holder {
                Some((h, true)) => h,
                _ => members
                    .iter()
                    .find(|m| is_resolved(*m))
                    .or(holder.map(|(h, _)| h))
                    .unwrap_or(&members[0]),
            }
            .clone();
            let excluded: Vec<ModuleId> = members
                .iter()
                .filter(|m| **m != incumbent)
                .cloned()
                .collect();

            tracing::warn!(
                key = %key,
                incumbent = %incumbent,
                excluded = ?excluded,
                "duplicate identity key"
            );
            groups.insert(
                key.clone(),
                DuplicateGroup {
                    key: key.clone(),
                    incumbent: Some(incumbent),
                    members,
                    excluded,
                },
            );
        }
        Ok(groups)
    }
}

/// Starting at `holder`, follow "the key this module moves to is held by ..."
/// and report whether the chain comes back to `claimant`.
fn swaps_back(
    claimant: &ModuleId,
    holder: &ModuleId,
    moving: &HashMap<&ModuleId, &IdentityKey>,
    holders: &HashMap<&IdentityKey, (&ModuleId, bool)>,
) -> bool {
    let mut seen: HashSet<&ModuleId> = HashSet::new();
    let mut cursor = holder;
    while seen.insert(cursor) {
        let Some(next_key) = moving.get(cursor) else {
            return false;
        };
        let Some((next, _)) = holders.get(next_key) else {
            return false;
        };
        if *next == claimant {
            return true;
        }
        cursor = *next;
    }
    false
}

/// Resolution-time interception point. Implementations remove modules that
/// must not take part in the current resolution pass.
pub trait ResolutionHook: Send + Sync {
    fn filter_candidates(&self, candidates: &mut Vec<ModuleId>);
}

/// Exclusion state for one resolution pass. Dropped with the pass.
#[derive(Debug, Default)]
pub struct ResolutionPass {
    groups: DuplicateGroups,
    excluded: HashSet<ModuleId>,
}

impl ResolutionPass {
    pub fn begin(groups: DuplicateGroups) -> Self {
        let excluded = groups
            .values()
            .flat_map(|g| g.excluded.iter().cloned())
            .collect();
        Self { groups, excluded }
    }

    pub fn is_excluded(&self, module: &ModuleId) -> bool {
        self.excluded.contains(module)
    }

    /// The collision group that excluded `module`, if any.
    pub fn group_of(&self, module: &ModuleId) -> Option<&DuplicateGroup> {
        self.groups.values().find(|g| g.excluded.contains(module))
    }

    pub fn groups(&self) -> &DuplicateGroups {
        &self.groups
    }
}

impl ResolutionHook for ResolutionPass {
    fn filter_candidates(&self, candidates: &mut Vec<ModuleId>) {
        if self.excluded.is_empty() {
            return;
        }
        candidates.retain(|m| {
            let keep = !self.excluded.contains(m);
            if !keep {
                tracing::debug!(module = %m, "removed from resolution pass as duplicate");
            }
            keep
        });
    }
}
