//! Entry filters.
//!
//! A filter is a tree of attribute predicates joined by AND/OR, where
//! every node may be negated. The same tree is consumed three ways through
//! the [`FilterVisitor`] traversal:
//!
//! - [`eval`] decides in memory whether an entry matches,
//! - [`mailbox`] compiles it into a mailbox search query,
//! - [`ldap`] compiles it into an RFC 4515 directory filter.
//!
//! # Operators
//!
//! - `has`: case-insensitive substring
//! - `eq`: case-insensitive equality (also used for unknown operators)
//! - `ge` / `le` / `gt` / `lt`: integer comparison
//! - `startswith` / `endswith`: case-insensitive prefix / suffix

pub mod eval;
pub mod input;
pub mod ldap;
pub mod mailbox;

use serde::{Deserialize, Serialize};

/// Comparison applied by a single term.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operator {
    Has,
    Eq,
    Ge,
    Le,
    Gt,
    Lt,
    StartsWith,
    EndsWith,
}

impl Operator {
    /// Parse an operator name. Unknown names fall back to [`Operator::Eq`].
    pub fn parse(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "has" => Operator::Has,
            "eq" => Operator::Eq,
            "ge" => Operator::Ge,
            "le" => Operator::Le,
            "gt" => Operator::Gt,
            "lt" => Operator::Lt,
            "startswith" => Operator::StartsWith,
            "endswith" => Operator::EndsWith,
            _ => Operator::Eq,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Operator::Has => "has",
            Operator::Eq => "eq",
            Operator::Ge => "ge",
            Operator::Le => "le",
            Operator::Gt => "gt",
            Operator::Lt => "lt",
            Operator::StartsWith => "startswith",
            Operator::EndsWith => "endswith",
        }
    }

    pub fn is_numeric(self) -> bool {
        matches!(self, Operator::Ge | Operator::Le | Operator::Gt | Operator::Lt)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Combinator {
    And,
    Or,
}

impl Combinator {
    pub fn as_str(self) -> &'static str {
        match self {
            Combinator::And => "AND",
            Combinator::Or => "OR",
        }
    }
}

/// A leaf predicate on one attribute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SingleTerm {
    pub negated: bool,
    pub attribute: String,
    pub operator: Operator,
    pub value: String,
}

/// An AND/OR group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultiTerm {
    pub negated: bool,
    pub combinator: Combinator,
    pub children: Vec<FilterTerm>,
}

/// A filter tree node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilterTerm {
    Single(SingleTerm),
    Multi(MultiTerm),
}

impl FilterTerm {
    pub fn single(attribute: &str, operator: Operator, value: &str) -> Self {
        FilterTerm::Single(SingleTerm {
            negated: false,
            attribute: attribute.to_string(),
            operator,
            value: value.to_string(),
        })
    }

    pub fn and(children: Vec<FilterTerm>) -> Self {
        Self::group(Combinator::And, children)
    }

    pub fn or(children: Vec<FilterTerm>) -> Self {
        Self::group(Combinator::Or, children)
    }

    fn group(combinator: Combinator, children: Vec<FilterTerm>) -> Self {
        FilterTerm::Multi(MultiTerm {
            negated: false,
            combinator,
            children,
        })
    }

    /// Flip the negation flag of this node.
    pub fn negate(mut self) -> Self {
        match &mut self {
            FilterTerm::Single(t) => t.negated = !t.negated,
            FilterTerm::Multi(t) => t.negated = !t.negated,
        }
        self
    }

    pub fn is_negated(&self) -> bool {
        match self {
            FilterTerm::Single(t) => t.negated,
            FilterTerm::Multi(t) => t.negated,
        }
    }

    /// Walk the tree depth-first, calling `enter_multi` before and
    /// `leave_multi` after a group's children. Uses an explicit stack, so
    /// tree depth is bounded by memory rather than the call stack.
    pub fn accept<V: FilterVisitor + ?Sized>(&self, visitor: &mut V) {
        enum Step<'a> {
            Enter(&'a FilterTerm),
            Leave(&'a MultiTerm),
        }

        let mut stack = vec![Step::Enter(self)];
        while let Some(step) = stack.pop() {
            match step {
                Step::Enter(FilterTerm::Single(term)) => visitor.visit_single(term),
                Step::Enter(FilterTerm::Multi(term)) => {
                    visitor.enter_multi(term);
                    stack.push(Step::Leave(term));
                    for child in term.children.iter().rev() {
                        stack.push(Step::Enter(child));
                    }
                }
                Step::Leave(term) => visitor.leave_multi(term),
            }
        }
    }
}

/// Callbacks driven by [`FilterTerm::accept`].
pub trait FilterVisitor {
    fn enter_multi(&mut self, term: &MultiTerm);
    fn leave_multi(&mut self, term: &MultiTerm);
    fn visit_single(&mut self, term: &SingleTerm);
}
