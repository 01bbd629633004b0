// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Query builder and canonical query keys.
//!
//! A [`Query`] is a target collection plus an ordered list of [`Clause`]s.
//! Its [`QueryKey`] is the stable, comparable identity used to collapse
//! concurrent identical reads into a single remote call.
//!
//! # Example
//!
//! ```rust
//! use query_coordinator::query_key::{Query, FilterOp};
//!
//! let a = Query::collection("orders")
//!     .filter("status", FilterOp::Eq, "delivered")
//!     .limit(10);
//! let b = Query::collection("orders")
//!     .filter("status", FilterOp::Eq, "delivered")
//!     .limit(10);
//!
//! assert_eq!(a.key(), b.key());
//! assert_ne!(a.key(), a.clone().limit(20).key());
//! ```
//!
//! # Encoding
//!
//! Each clause is serialized structurally to JSON and the results are joined
//! with U+001F (unit separator). JSON escapes every control character inside
//! strings, so the separator can never be produced by clause content.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Separator between encoded clauses.
const CLAUSE_SEPARATOR: char = '\u{1f}';

/// Comparison operator for a `where` clause.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    In,
    NotIn,
    ArrayContains,
}

impl FilterOp {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Eq => "==",
            Self::Ne => "!=",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::In => "in",
            Self::NotIn => "not-in",
            Self::ArrayContains => "array-contains",
        }
    }
}

impl std::fmt::Display for FilterOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sort direction for an `order_by` clause.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Asc,
    Desc,
}

impl Direction {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Asc => "asc",
            Self::Desc => "desc",
        }
    }
}

/// A single query clause. Clause order is part of the query's meaning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Clause {
    /// `field <op> value`
    Where { field: String, op: FilterOp, value: Value },
    /// Sort by `field`
    OrderBy { field: String, direction: Direction },
    /// Cap the result count
    Limit(usize),
    /// Cursor: start after the given sort value
    StartAfter(Value),
}

impl Clause {
    /// Structural form used for key encoding.
    fn canonical(&self) -> Value {
        match self {
            Self::Where { field, op, value } => {
                json!(["where", field, op.as_str(), value])
            }
            Self::OrderBy { field, direction } => {
                json!(["order_by", field, direction.as_str()])
            }
            Self::Limit(n) => json!(["limit", n]),
            Self::StartAfter(value) => json!(["start_after", value]),
        }
    }
}

/// A read against a single collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Query {
    pub collection: String,
    #[serde(default)]
    pub clauses: Vec<Clause>,
}

impl Query {
    /// Start a query over `collection` with no clauses.
    pub fn collection(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            clauses: Vec::new(),
        }
    }

    /// Append an arbitrary clause
    #[must_use]
    pub fn clause(mut self, clause: Clause) -> Self {
        self.clauses.push(clause);
        self
    }

    /// Append `field <op> value`
    #[must_use]
    pub fn filter(self, field: impl Into<String>, op: FilterOp, value: impl Into<Value>) -> Self {
        self.clause(Clause::Where {
            field: field.into(),
            op,
            value: value.into(),
        })
    }

    /// Shorthand for an equality filter
    #[must_use]
    pub fn where_eq(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filter(field, FilterOp::Eq, value)
    }

    #[must_use]
    pub fn order_by(self, field: impl Into<String>, direction: Direction) -> Self {
        self.clause(Clause::OrderBy {
            field: field.into(),
            direction,
        })
    }

    #[must_use]
    pub fn limit(self, n: usize) -> Self {
        self.clause(Clause::Limit(n))
    }

    #[must_use]
    pub fn start_after(self, value: impl Into<Value>) -> Self {
        self.clause(Clause::StartAfter(value.into()))
    }

    /// Canonical key for this query.
    #[must_use]
    pub fn key(&self) -> QueryKey {
        QueryKey::new(&self.collection, &self.clauses)
    }
}

/// Canonical identity of a logical request.
///
/// Two identical queries always produce equal keys; equality is structural
/// over `(target, clauses)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueryKey {
    target: String,
    clauses: String,
}

impl QueryKey {
    /// Build a key from a target name and ordered clauses.
    pub fn new(target: impl Into<String>, clauses: &[Clause]) -> Self {
        let mut encoded = String::new();
        for (i, clause) in clauses.iter().enumerate() {
            if i > 0 {
                encoded.push(CLAUSE_SEPARATOR);
            }
            encoded.push_str(&clause.canonical().to_string());
        }
        Self {
            target: target.into(),
            clauses: encoded,
        }
    }

    /// Key for a single-document read (`collection/id`).
    pub fn document(collection: &str, id: &str) -> Self {
        Self {
            target: format!("{}/{}", collection, id),
            clauses: String::new(),
        }
    }

    #[must_use]
    pub fn target(&self) -> &str {
        &self.target
    }

    #[must_use]
    pub fn clauses(&self) -> &str {
        &self.clauses
    }
}

impl std::fmt::Display for QueryKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.clauses.is_empty() {
            return f.write_str(&self.target);
        }
        write!(f, "{}?", self.target)?;
        for (i, part) in self.clauses.split(CLAUSE_SEPARATOR).enumerate() {
            if i > 0 {
                f.write_str("&")?;
            }
            f.write_str(part)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identical_queries_share_key() {
        let a = Query::collection("orders").where_eq("status", "delivered");
        let b = Query::collection("orders").where_eq("status", "delivered");
        assert_eq!(a.key(), b.key());
    }

    #[test]
    fn test_target_is_part_of_key() {
        let a = Query::collection("orders").where_eq("status", "delivered");
        let b = Query::collection("invoices").where_eq("status", "delivered");
        assert_ne!(a.key(), b.key());
    }

    #[test]
    fn test_clause_order_is_preserved() {
        let a = Query::collection("orders")
            .order_by("created", Direction::Desc)
            .limit(5);
        let b = Query::collection("orders")
            .limit(5)
            .order_by("created", Direction::Desc);
        assert_ne!(a.key(), b.key());
    }

    #[test]
    fn test_value_types_are_distinguished() {
        let num = Query::collection("orders").where_eq("total", 10);
        let text = Query::collection("orders").where_eq("total", "10");
        assert_ne!(num.key(), text.key());
    }

    #[test]
    fn test_separator_in_content_cannot_collide() {
        // One clause whose value contains the separator vs. two clauses.
        let sneaky = Query::collection("c").where_eq("a", "x\u{1f}[\"limit\",1]");
        let split = Query::collection("c").where_eq("a", "x").limit(1);
        assert_ne!(sneaky.key(), split.key());
        assert!(!sneaky.key().clauses().contains(CLAUSE_SEPARATOR));
    }

    #[test]
    fn test_empty_query_key() {
        let key = Query::collection("staff").key();
        assert_eq!(key.target(), "staff");
        assert_eq!(key.clauses(), "");
        assert_eq!(key.to_string(), "staff");
    }

    #[test]
    fn test_display_is_readable() {
        let key = Query::collection("orders")
            .where_eq("status", "delivered")
            .limit(10)
            .key();
        assert_eq!(
            key.to_string(),
            r#"orders?["where","status","==","delivered"]&["limit",10]"#
        );
    }

    #[test]
    fn test_document_key() {
        let key = QueryKey::document("orders", "o-17");
        assert_eq!(key.target(), "orders/o-17");
        assert_ne!(key, Query::collection("orders/o-17").limit(1).key());
    }
}
