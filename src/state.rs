//! Bookkeeping shared by the CTE, selection and formula compilers during one
//!  top-level build: which CTE carries a field, and which SQL selects it.

use indexmap::IndexMap;

use crate::error::{Error, Result};

/// Read access to a query state, plus local selection writes.
pub trait StateView {
    /// Name of the CTE carrying `field_id`.
    fn cte_name(&self, field_id: &str) -> Option<&str>;

    /// SQL that selects `field_id` in the current scope.
    fn selection(&self, field_id: &str) -> Option<&str>;

    fn set_selection(&mut self, field_id: &str, sql: String);
}

/// The state of one build. Both maps only ever grow.
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct QueryState {
    ctes: IndexMap<String, String>,
    selections: IndexMap<String, String>,
}

impl QueryState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Maps a field to the CTE carrying it. Mapping a field twice to the same
    ///  CTE is fine, to another one is a conflict.
    pub fn register_cte(&mut self, field_id: &str, cte_name: &str) -> Result<()> {
        match self.ctes.get(field_id) {
            Some(existing) if existing == cte_name => Ok(()),
            Some(existing) => Err(Error::StateConflict {
                field_id: field_id.to_string(),
                existing: existing.clone(),
                requested: cte_name.to_string(),
            }),
            None => {
                self.ctes.insert(field_id.to_string(), cte_name.to_string());
                Ok(())
            }
        }
    }

    /// `(field id, CTE name)` in registration order.
    pub fn ctes(&self) -> impl Iterator<Item = (&str, &str)> {
        self.ctes.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn selections(&self) -> impl Iterator<Item = (&str, &str)> {
        self.selections.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// A child view for a nested body.
    pub fn scoped(&self) -> ScopedState<'_> {
        ScopedState::new(self)
    }
}

impl StateView for QueryState {
    fn cte_name(&self, field_id: &str) -> Option<&str> {
        self.ctes.get(field_id).map(String::as_str)
    }

    fn selection(&self, field_id: &str) -> Option<&str> {
        self.selections.get(field_id).map(String::as_str)
    }

    fn set_selection(&mut self, field_id: &str, sql: String) {
        self.selections.insert(field_id.to_string(), sql);
    }
}

/// Reads through to an outer view, keeps its own selections. Used while
///  compiling a CTE body, where a field is selected differently than in the
///  outer query.
pub struct ScopedState<'a> {
    outer: &'a dyn StateView,
    selections: IndexMap<String, String>,
}

impl<'a> ScopedState<'a> {
    pub fn new(outer: &'a dyn StateView) -> Self {
        Self {
            outer,
            selections: IndexMap::new(),
        }
    }

    /// A view that sees nothing of the outer build.
    pub fn detached() -> ScopedState<'static> {
        ScopedState {
            outer: &EMPTY,
            selections: IndexMap::new(),
        }
    }
}

static EMPTY: Empty = Empty;

struct Empty;

impl StateView for Empty {
    fn cte_name(&self, _: &str) -> Option<&str> {
        None
    }

    fn selection(&self, _: &str) -> Option<&str> {
        None
    }

    fn set_selection(&mut self, _: &str, _: String) {}
}

impl StateView for ScopedState<'_> {
    fn cte_name(&self, field_id: &str) -> Option<&str> {
        self.outer.cte_name(field_id)
    }

    fn selection(&self, field_id: &str) -> Option<&str> {
        self.selections
            .get(field_id)
            .map(String::as_str)
            .or_else(|| self.outer.selection(field_id))
    }

    fn set_selection(&mut self, field_id: &str, sql: String) {
        self.selections.insert(field_id.to_string(), sql);
    }
}
