//! Linked-chain schema migrations.
//!
//! Every step names its direct predecessor, so the chain is validated once
//! at construction (one root, one head, no branches, no cycles) and walked
//! iteratively afterwards. The store's `schema_version` row records the last
//! applied step; no row means `base`.

pub mod versions;

use crate::schema::{apply_op, SchemaOp, SchemaStore, StoreError, StructuralError};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::fmt;

pub const BASE: &str = "base";
pub const HEAD: &str = "head";

#[derive(Debug, Clone)]
pub struct MigrationStep {
    pub id: String,
    pub predecessor: Option<String>,
    pub description: String,
    pub forward: Vec<SchemaOp>,
    pub inverse: Vec<SchemaOp>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Upgrade,
    Downgrade,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Upgrade => f.write_str("upgrade"),
            Direction::Downgrade => f.write_str("downgrade"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ChainError {
    #[error("migration chain is empty")]
    Empty,
    #[error("duplicate migration step '{0}'")]
    DuplicateStep(String),
    #[error("step id '{0}' is reserved")]
    ReservedId(String),
    #[error("step '{step}' revises unknown step '{predecessor}'")]
    UnknownPredecessor { step: String, predecessor: String },
    #[error("migration chain has several roots: {0:?}")]
    MultipleRoots(Vec<String>),
    #[error("migration chain has no root")]
    NoRoot,
    #[error("steps '{first}' and '{second}' both revise '{predecessor}'")]
    Branch {
        predecessor: String,
        first: String,
        second: String,
    },
    #[error("step '{0}' is part of a cycle")]
    Cycle(String),
}

#[derive(Debug, thiserror::Error)]
pub enum MigrateError {
    #[error("unknown migration step '{0}'")]
    UnknownStep(String),
    #[error("store is at '{current}', which is not on the path to '{target}'")]
    DivergentHistory { current: String, target: String },
    #[error("migration step '{step}' failed during {direction}: {cause}")]
    MigrationFailed {
        step: String,
        direction: Direction,
        #[source]
        cause: StructuralError,
    },
    #[error(transparent)]
    Chain(#[from] ChainError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Validated map of steps, plus the root-to-head order derived from it.
#[derive(Debug, Clone)]
pub struct StepChain {
    steps: HashMap<String, MigrationStep>,
    order: Vec<String>,
}

impl StepChain {
    pub fn new(steps: Vec<MigrationStep>) -> Result<Self, ChainError> {
        if steps.is_empty() {
            return Err(ChainError::Empty);
        }

        let mut by_id: HashMap<String, MigrationStep> = HashMap::new();
        for step in steps {
            if step.id == BASE || step.id == HEAD {
                return Err(ChainError::ReservedId(step.id));
            }
            if by_id.contains_key(&step.id) {
                return Err(ChainError::DuplicateStep(step.id));
            }
            by_id.insert(step.id.clone(), step);
        }

        let mut roots: Vec<String> = Vec::new();
        let mut successor: HashMap<&str, &str> = HashMap::new();
        let mut ids: Vec<&String> = by_id.keys().collect();
        ids.sort();
        for id in ids {
            let step = &by_id[id];
            match step.predecessor.as_deref() {
                None => roots.push(step.id.clone()),
                Some(p) => {
                    if !by_id.contains_key(p) {
                        return Err(ChainError::UnknownPredecessor {
                            step: step.id.clone(),
                            predecessor: p.to_string(),
                        });
                    }
                    if let Some(first) = successor.insert(p, step.id.as_str()) {
                        return Err(ChainError::Branch {
                            predecessor: p.to_string(),
                            first: first.to_string(),
                            second: step.id.clone(),
                        });
                    }
                }
            }
        }
        let root = match roots.len() {
            0 => return Err(ChainError::NoRoot),
            1 => roots.remove(0),
            _ => return Err(ChainError::MultipleRoots(roots)),
        };

        let mut order: Vec<String> = vec![root.clone()];
        let mut cursor = root.as_str();
        while let Some(next) = successor.get(cursor) {
            order.push(next.to_string());
            cursor = next;
        }
        // With one root and no branches, anything unreachable from the root
        // loops back on itself.
        if order.len() != by_id.len() {
            let reached: HashSet<&str> = order.iter().map(|s| s.as_str()).collect();
            let mut stray: Vec<&String> = by_id
                .keys()
                .filter(|id| !reached.contains(id.as_str()))
                .collect();
            stray.sort();
            return Err(ChainError::Cycle(stray[0].clone()));
        }

        Ok(Self {
            steps: by_id,
            order,
        })
    }

    pub fn head(&self) -> &str {
        self.order.last().map(|s| s.as_str()).unwrap_or(BASE)
    }

    pub fn get(&self, id: &str) -> Option<&MigrationStep> {
        self.steps.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.steps.contains_key(id)
    }

    /// Steps from root to head.
    pub fn iter(&self) -> impl Iterator<Item = &MigrationStep> {
        self.order.iter().filter_map(|id| self.steps.get(id))
    }

    /// Ids from the root up to and including `id`, oldest first.
    pub fn lineage(&self, id: &str) -> Result<Vec<String>, MigrateError> {
        let mut path = Vec::new();
        let mut seen = HashSet::new();
        let mut cursor = Some(id.to_string());
        while let Some(current) = cursor {
            if !seen.insert(current.clone()) {
                return Err(ChainError::Cycle(current).into());
            }
            let step = self
                .steps
                .get(&current)
                .ok_or_else(|| MigrateError::UnknownStep(current.clone()))?;
            cursor = step.predecessor.clone();
            path.push(current);
        }
        path.reverse();
        Ok(path)
    }

    fn resolve(&self, target: &str) -> Result<Option<String>, MigrateError> {
        match target {
            BASE => Ok(None),
            HEAD => Ok(Some(self.head().to_string())),
            id if self.contains(id) => Ok(Some(id.to_string())),
            id => Err(MigrateError::UnknownStep(id.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationReport {
    pub direction: Direction,
    pub from: Option<String>,
    pub to: Option<String>,
    pub steps: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationStatus {
    pub current: Option<String>,
    pub head: String,
    pub applied: Vec<String>,
    pub pending: Vec<String>,
}

fn marker_label(marker: Option<&str>) -> String {
    marker.unwrap_or(BASE).to_string()
}

/// Applies a `StepChain` to a store. Callers must not run two migrators
/// against the same store at once.
pub struct Migrator<'a> {
    chain: &'a StepChain,
}

impl<'a> Migrator<'a> {
    pub fn new(chain: &'a StepChain) -> Self {
        Self { chain }
    }

    pub fn status<S: SchemaStore + ?Sized>(
        &self,
        store: &S,
    ) -> Result<MigrationStatus, MigrateError> {
        let current = store.current_version()?;
        let applied = match current.as_deref() {
            Some(id) if self.chain.contains(id) => self.chain.lineage(id)?,
            Some(id) => {
                return Err(MigrateError::DivergentHistory {
                    current: id.to_string(),
                    target: self.chain.head().to_string(),
                })
            }
            None => Vec::new(),
        };
        let pending = self
            .chain
            .iter()
            .map(|s| s.id.clone())
            .filter(|id| !applied.contains(id))
            .collect();
        Ok(MigrationStatus {
            current,
            head: self.chain.head().to_string(),
            applied,
            pending,
        })
    }

    pub fn upgrade_to<S: SchemaStore + ?Sized>(
        &self,
        store: &mut S,
        target: &str,
    ) -> Result<MigrationReport, MigrateError> {
        let target_id = self.chain.resolve(target)?;
        let current = store.current_version()?;
        let mut report = MigrationReport {
            direction: Direction::Upgrade,
            from: current.clone(),
            to: current.clone(),
            steps: Vec::new(),
        };
        if current == target_id {
            tracing::debug!(target = %marker_label(current.as_deref()), "schema already at target");
            return Ok(report);
        }
        let Some(target_id) = target_id else {
            return Err(MigrateError::DivergentHistory {
                current: marker_label(current.as_deref()),
                target: BASE.to_string(),
            });
        };

        let path = self.chain.lineage(&target_id)?;
        let start = match current.as_deref() {
            None => 0,
            Some(c) => match path.iter().position(|id| id == c) {
                Some(pos) => pos + 1,
                None => {
                    return Err(MigrateError::DivergentHistory {
                        current: c.to_string(),
                        target: target_id,
                    })
                }
            },
        };

        for id in &path[start..] {
            let step = self
                .chain
                .get(id)
                .ok_or_else(|| MigrateError::UnknownStep(id.clone()))?;
            tracing::info!(step = %step.id, description = %step.description, "applying migration step");
            self.run_step(store, step, &step.forward, Some(step.id.as_str()), Direction::Upgrade)?;
            report.steps.push(step.id.clone());
            report.to = Some(step.id.clone());
        }
        Ok(report)
    }

    pub fn downgrade_to<S: SchemaStore + ?Sized>(
        &self,
        store: &mut S,
        target: &str,
    ) -> Result<MigrationReport, MigrateError> {
        let target_id = self.chain.resolve(target)?;
        let current = store.current_version()?;
        let mut report = MigrationReport {
            direction: Direction::Downgrade,
            from: current.clone(),
            to: current.clone(),
            steps: Vec::new(),
        };
        if current == target_id {
            tracing::debug!(target = %marker_label(current.as_deref()), "schema already at target");
            return Ok(report);
        }
        let Some(current_id) = current else {
            return Err(MigrateError::DivergentHistory {
                current: BASE.to_string(),
                target: marker_label(target_id.as_deref()),
            });
        };
        if !self.chain.contains(&current_id) {
            return Err(MigrateError::DivergentHistory {
                current: current_id,
                target: marker_label(target_id.as_deref()),
            });
        }

        let path = self.chain.lineage(&current_id)?;
        let stop = match target_id.as_deref() {
            None => 0,
            Some(t) => match path.iter().position(|id| id == t) {
                Some(pos) => pos + 1,
                None => {
                    return Err(MigrateError::DivergentHistory {
                        current: current_id,
                        target: t.to_string(),
                    })
                }
            },
        };

        for id in path[stop..].iter().rev() {
            let step = self
                .chain
                .get(id)
                .ok_or_else(|| MigrateError::UnknownStep(id.clone()))?;
            tracing::info!(step = %step.id, description = %step.description, "reverting migration step");
            self.run_step(
                store,
                step,
                &step.inverse,
                step.predecessor.as_deref(),
                Direction::Downgrade,
            )?;
            report.steps.push(step.id.clone());
            report.to = step.predecessor.clone();
        }
        Ok(report)
    }

    fn run_step<S: SchemaStore + ?Sized>(
        &self,
        store: &mut S,
        step: &MigrationStep,
        ops: &[SchemaOp],
        marker_after: Option<&str>,
        direction: Direction,
    ) -> Result<(), MigrateError> {
        let fail = |cause: StructuralError| MigrateError::MigrationFailed {
            step: step.id.clone(),
            direction,
            cause,
        };

        store.begin_step().map_err(|e| fail(e.into()))?;
        let result = ops
            .iter()
            .try_for_each(|op| {
                tracing::debug!(step = %step.id, op = %op, "schema operation");
                apply_op(store, op)
            })
            .and_then(|_| store.set_version(marker_after).map_err(StructuralError::from));

        match result {
            Ok(()) => {
                store.commit_step().map_err(|e| fail(e.into()))?;
                Ok(())
            }
            Err(cause) => {
                tracing::warn!(step = %step.id, %direction, error = %cause, "migration step failed");
                if let Err(e) = store.rollback_step() {
                    tracing::warn!(step = %step.id, error = %e, "failed to roll back step savepoint");
                }
                Err(fail(cause))
            }
        }
    }
}
