//! Query constraint types and their JSON wire form.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

use crate::columns::ColumnType;

/// Errors raised while reading a query context.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The constraint operator code is not one the query engine defines.
    #[error("unknown constraint operator code: {0}")]
    UnknownOperator(u8),

    /// The query context JSON could not be parsed.
    #[error("invalid query context: {0}")]
    InvalidContext(#[from] serde_json::Error),
}

/// Constraint operators, carried on the wire as their numeric codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Operator {
    Unique,
    Equals,
    GreaterThan,
    LessThanOrEquals,
    LessThan,
    GreaterThanOrEquals,
    Match,
    Like,
    Glob,
    Regexp,
}

impl Operator {
    pub fn code(self) -> u8 {
        match self {
            Operator::Unique => 1,
            Operator::Equals => 2,
            Operator::GreaterThan => 4,
            Operator::LessThanOrEquals => 8,
            Operator::LessThan => 16,
            Operator::GreaterThanOrEquals => 32,
            Operator::Match => 64,
            Operator::Like => 65,
            Operator::Glob => 66,
            Operator::Regexp => 67,
        }
    }
}

impl TryFrom<u8> for Operator {
    type Error = ProtocolError;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        Ok(match code {
            1 => Operator::Unique,
            2 => Operator::Equals,
            4 => Operator::GreaterThan,
            8 => Operator::LessThanOrEquals,
            16 => Operator::LessThan,
            32 => Operator::GreaterThanOrEquals,
            64 => Operator::Match,
            65 => Operator::Like,
            66 => Operator::Glob,
            67 => Operator::Regexp,
            other => return Err(ProtocolError::UnknownOperator(other)),
        })
    }
}

impl From<Operator> for u8 {
    fn from(op: Operator) -> Self {
        op.code()
    }
}

/// A single predicate on a column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Constraint {
    #[serde(rename = "op")]
    pub operator: Operator,
    #[serde(rename = "expr")]
    pub expression: String,
}

impl Constraint {
    pub fn equals(expression: impl Into<String>) -> Self {
        Self {
            operator: Operator::Equals,
            expression: expression.into(),
        }
    }
}

/// All predicates a query places on one column.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConstraintList {
    pub affinity: ColumnType,
    pub constraints: Vec<Constraint>,
}

/// The predicate set of one query, keyed by column name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryContext {
    pub constraints: HashMap<String, ConstraintList>,
}

#[derive(Debug, Deserialize)]
struct WireQueryContext {
    #[serde(default)]
    constraints: Vec<WireConstraintList>,
}

#[derive(Debug, Deserialize)]
struct WireConstraintList {
    name: String,
    #[serde(default)]
    affinity: ColumnType,
    #[serde(default)]
    list: Vec<Constraint>,
}

impl QueryContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse the query engine's JSON form:
    /// `{"constraints":[{"name":"user","affinity":"TEXT","list":[{"op":2,"expr":"alice"}]}]}`.
    ///
    /// Lists that name the same column are merged.
    pub fn from_json(input: &str) -> Result<Self, ProtocolError> {
        let wire: WireQueryContext = serde_json::from_str(input)?;
        let mut ctx = Self::new();
        for list in wire.constraints {
            let entry = ctx.constraints.entry(list.name).or_insert_with(|| ConstraintList {
                affinity: list.affinity,
                constraints: Vec::new(),
            });
            entry.constraints.extend(list.list);
        }
        Ok(ctx)
    }

    /// Add a constraint on `column`.
    pub fn with_constraint(mut self, column: impl Into<String>, constraint: Constraint) -> Self {
        self.constraints
            .entry(column.into())
            .or_default()
            .constraints
            .push(constraint);
        self
    }

    /// Add an equality constraint on `column`.
    pub fn with_equals(self, column: impl Into<String>, value: impl Into<String>) -> Self {
        self.with_constraint(column, Constraint::equals(value))
    }

    /// Constraints on `column`, empty if the query places none.
    pub fn constraints_for(&self, column: &str) -> &[Constraint] {
        self.constraints
            .get(column)
            .map(|list| list.constraints.as_slice())
            .unwrap_or_default()
    }
}
