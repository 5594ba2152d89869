//! Condition registry: named leaf conditions evaluated against a context.
//!
//! The registry only evaluates leaves. Composite expressions are resolved by
//! the compiled rule book, which holds [`ConditionId`] handles so the hot path
//! never looks names up.

use crate::domain::condition::ConditionResult;
use crate::domain::context::EvaluationContext;
use crate::domain::error::CascadeError;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

pub type ConditionFn = dyn Fn(&EvaluationContext) -> ConditionResult + Send + Sync;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConditionId(usize);

#[derive(Clone, Default)]
pub struct ConditionRegistry {
    conditions: Vec<(String, Arc<ConditionFn>)>,
    index: HashMap<String, ConditionId>,
}

impl fmt::Debug for ConditionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConditionRegistry")
            .field("conditions", &self.names())
            .finish()
    }
}

impl ConditionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry pre-loaded with the built-in condition library.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        crate::domain::conditions::register_builtins(&mut registry);
        registry
    }

    /// Register `f` under `name`, replacing any previous condition of that name.
    pub fn register<F>(&mut self, name: impl Into<String>, f: F) -> ConditionId
    where
        F: Fn(&EvaluationContext) -> ConditionResult + Send + Sync + 'static,
    {
        let name = name.into();
        let f: Arc<ConditionFn> = Arc::new(f);
        if let Some(&id) = self.index.get(&name) {
            self.conditions[id.0].1 = f;
            return id;
        }
        let id = ConditionId(self.conditions.len());
        self.conditions.push((name.clone(), f));
        self.index.insert(name, id);
        id
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn id_of(&self, name: &str) -> Option<ConditionId> {
        self.index.get(name).copied()
    }

    pub fn name_of(&self, id: ConditionId) -> &str {
        &self.conditions[id.0].0
    }

    /// Registered names in registration order.
    pub fn names(&self) -> Vec<&str> {
        self.conditions.iter().map(|(n, _)| n.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.conditions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    pub fn evaluate_id(&self, id: ConditionId, ctx: &EvaluationContext) -> ConditionResult {
        (self.conditions[id.0].1)(ctx)
    }

    /// Evaluate `names` against `ctx`.
    ///
    /// Unknown names are a configuration defect and are rejected before any
    /// condition runs.
    pub fn evaluate(
        &self,
        ctx: &EvaluationContext,
        names: &[&str],
    ) -> Result<BTreeMap<String, ConditionResult>, CascadeError> {
        let ids = names
            .iter()
            .map(|name| {
                self.id_of(name)
                    .map(|id| (*name, id))
                    .ok_or_else(|| CascadeError::UnknownCondition {
                        name: name.to_string(),
                        path: "registry".to_string(),
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ids
            .into_iter()
            .map(|(name, id)| (name.to_string(), self.evaluate_id(id, ctx)))
            .collect())
    }
}
