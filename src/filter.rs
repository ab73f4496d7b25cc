//! Filters attached to lookup and conditional fields, and the narrow interface
//!  the CTE compiler uses to turn them into a boolean SQL fragment.

use indexmap::IndexMap;
use serde_json::Value;

use crate::{
    dialect::Dialect,
    error::{Error, Result},
    schema::{Field, FieldKind},
    sql::quote_literal,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Conjunction {
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "camelCase"))]
pub enum FilterOperator {
    Is,
    IsNot,
    IsGreater,
    IsGreaterEqual,
    IsLess,
    IsLessEqual,
    Contains,
    DoesNotContain,
    IsEmpty,
    IsNotEmpty,
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum FilterValue {
    Literal(Value),
    /// A field of the host table, used by conditional fields to correlate
    Field(String),
    None,
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FilterCondition {
    pub field_id: String,
    pub operator: FilterOperator,
    pub value: FilterValue,
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum FilterTree {
    Condition(FilterCondition),
    Group {
        conjunction: Conjunction,
        children: Vec<FilterTree>,
    },
}

impl FilterTree {
    pub fn condition(field_id: impl Into<String>, operator: FilterOperator, value: FilterValue) -> Self {
        FilterTree::Condition(FilterCondition {
            field_id: field_id.into(),
            operator,
            value,
        })
    }

    pub fn and(children: Vec<FilterTree>) -> Self {
        FilterTree::Group {
            conjunction: Conjunction::And,
            children,
        }
    }

    pub fn or(children: Vec<FilterTree>) -> Self {
        FilterTree::Group {
            conjunction: Conjunction::Or,
            children,
        }
    }

    /// Ids of the filtered fields (the left side of each condition).
    pub fn field_ids(&self) -> Vec<&str> {
        let mut ids = Vec::new();
        self.walk(&mut |c| {
            if !ids.contains(&c.field_id.as_str()) {
                ids.push(c.field_id.as_str());
            }
        });
        ids
    }

    /// Ids of fields used as comparison values.
    pub fn value_field_ids(&self) -> Vec<&str> {
        let mut ids = Vec::new();
        self.walk(&mut |c| {
            if let FilterValue::Field(id) = &c.value
                && !ids.contains(&id.as_str())
            {
                ids.push(id.as_str());
            }
        });
        ids
    }

    /// When the filter is nothing but `field = value-field` conditions joined
    ///  with AND, the `(field, value field)` pairs.
    pub fn equality_pairs(&self) -> Option<Vec<(&str, &str)>> {
        let mut pairs = Vec::new();
        if self.collect_equalities(&mut pairs) && !pairs.is_empty() {
            Some(pairs)
        } else {
            None
        }
    }

    fn collect_equalities<'a>(&'a self, pairs: &mut Vec<(&'a str, &'a str)>) -> bool {
        match self {
            FilterTree::Condition(FilterCondition {
                field_id,
                operator: FilterOperator::Is,
                value: FilterValue::Field(other),
            }) => {
                pairs.push((field_id, other));
                true
            }
            FilterTree::Condition(_) => false,
            FilterTree::Group {
                conjunction: Conjunction::And,
                children,
            } => children.iter().all(|c| c.collect_equalities(pairs)),
            FilterTree::Group { .. } => false,
        }
    }

    fn walk<'a>(&'a self, visit: &mut impl FnMut(&'a FilterCondition)) {
        match self {
            FilterTree::Condition(c) => visit(c),
            FilterTree::Group { children, .. } => {
                for child in children {
                    child.walk(visit);
                }
            }
        }
    }
}

/// Field metadata available to a filter compiler, keyed by field id.
pub type FieldMap<'a> = IndexMap<&'a str, &'a Field>;

/// Builds a `WHERE`-only boolean fragment for a filter.
///
/// `aliases` maps every field id the filter mentions (on either side of a
///  condition) to the SQL expression that yields its value in the scope the
///  fragment will be placed in.
pub trait FilterCompiler {
    fn compile(
        &self,
        fields: &FieldMap<'_>,
        filter: &FilterTree,
        aliases: &IndexMap<String, String>,
    ) -> Result<String>;
}

/// Handles the common comparison operators with literal or field values.
#[derive(Debug, Clone, Copy)]
pub struct BasicFilterCompiler {
    pub dialect: Dialect,
}

impl BasicFilterCompiler {
    pub fn new(dialect: Dialect) -> Self {
        Self { dialect }
    }

    fn literal(&self, value: &Value) -> String {
        match value {
            Value::Null => "NULL".into(),
            Value::Bool(true) => "TRUE".into(),
            Value::Bool(false) => "FALSE".into(),
            Value::Number(n) => n.to_string(),
            Value::String(s) => quote_literal(s),
            other => quote_literal(&other.to_string()),
        }
    }

    fn like(&self) -> &'static str {
        match self.dialect {
            Dialect::Postgres => "ILIKE",
            Dialect::Sqlite => "LIKE",
        }
    }

    fn condition(
        &self,
        fields: &FieldMap<'_>,
        condition: &FilterCondition,
        aliases: &IndexMap<String, String>,
    ) -> Result<String> {
        let provider = self.dialect.provider();
        let raw = aliases
            .get(&condition.field_id)
            .ok_or_else(|| Error::FieldNotFound(condition.field_id.clone()))?;
        let field = fields.get(condition.field_id.as_str());
        let is_link = field.is_some_and(|f| matches!(f.kind, FieldKind::Link(_)));
        let multi = field.is_some_and(|f| f.is_multi_valued);

        // Links compare on their titles
        let lhs = if is_link {
            provider.link_title(raw, multi)
        } else {
            raw.clone()
        };

        let rhs = match &condition.value {
            FilterValue::Literal(Value::Null) | FilterValue::None => None,
            FilterValue::Literal(v) => Some(self.literal(v)),
            FilterValue::Field(id) => Some(
                aliases
                    .get(id)
                    .cloned()
                    .ok_or_else(|| Error::FieldNotFound(id.clone()))?,
            ),
        };

        let compare = |op: &str| match &rhs {
            Some(rhs) => format!("({lhs} {op} {rhs})"),
            None => "FALSE".to_string(),
        };

        let sql = match condition.operator {
            FilterOperator::Is => match &rhs {
                Some(rhs) => format!("({lhs} = {rhs})"),
                None => format!("({lhs} IS NULL)"),
            },
            FilterOperator::IsNot => match &rhs {
                Some(rhs) => format!("({lhs} IS NULL OR {lhs} <> {rhs})"),
                None => format!("({lhs} IS NOT NULL)"),
            },
            FilterOperator::IsGreater => compare(">"),
            FilterOperator::IsGreaterEqual => compare(">="),
            FilterOperator::IsLess => compare("<"),
            FilterOperator::IsLessEqual => compare("<="),
            FilterOperator::Contains | FilterOperator::DoesNotContain => {
                let pattern = match &condition.value {
                    FilterValue::Literal(Value::String(s)) => quote_literal(&format!("%{s}%")),
                    _ => match &rhs {
                        Some(rhs) => format!("'%' || {rhs} || '%'"),
                        None => "'%'".to_string(),
                    },
                };
                let text = provider.text_cast(&lhs);
                if condition.operator == FilterOperator::Contains {
                    format!("({text} {} {pattern})", self.like())
                } else {
                    format!("({lhs} IS NULL OR NOT ({text} {} {pattern}))", self.like())
                }
            }
            FilterOperator::IsEmpty if is_link => format!("(NOT {})", provider.link_exists(raw)),
            FilterOperator::IsNotEmpty if is_link => provider.link_exists(raw),
            FilterOperator::IsEmpty => {
                format!("({lhs} IS NULL OR {} = '')", provider.text_cast(&lhs))
            }
            FilterOperator::IsNotEmpty => {
                format!("({lhs} IS NOT NULL AND {} <> '')", provider.text_cast(&lhs))
            }
        };
        Ok(sql)
    }
}

impl FilterCompiler for BasicFilterCompiler {
    fn compile(
        &self,
        fields: &FieldMap<'_>,
        filter: &FilterTree,
        aliases: &IndexMap<String, String>,
    ) -> Result<String> {
        match filter {
            FilterTree::Condition(condition) => self.condition(fields, condition, aliases),
            FilterTree::Group {
                conjunction,
                children,
            } => {
                if children.is_empty() {
                    return Ok("TRUE".to_string());
                }
                let parts = children
                    .iter()
                    .map(|c| self.compile(fields, c, aliases))
                    .collect::<Result<Vec<_>>>()?;
                let joiner = match conjunction {
                    Conjunction::And => " AND ",
                    Conjunction::Or => " OR ",
                };
                Ok(format!("({})", parts.join(joiner)))
            }
        }
    }
}
