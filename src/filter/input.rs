//! Structured search filter as it arrives on a request.
//!
//! ```json
//! { "or": true,
//!   "cond": [ { "attr": "company", "op": "startswith", "value": "Acme" } ],
//!   "conds": [ { "not": true, "cond": [ { "attr": "title", "op": "has", "value": "intern" } ] } ] }
//! ```
//!
//! Validation happens once, while converting into a [`FilterTerm`], so a
//! malformed filter is rejected before any search runs.

use serde::{Deserialize, Serialize};

use super::{Combinator, FilterTerm, MultiTerm, Operator, SingleTerm};
use crate::error::{GalError, Result};

/// A group of conditions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConditionsInput {
    pub not: bool,
    /// Join children with OR instead of AND.
    pub or: bool,
    pub conds: Vec<ConditionsInput>,
    pub cond: Vec<ConditionInput>,
}

/// One attribute condition.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConditionInput {
    pub attr: Option<String>,
    pub op: Option<String>,
    pub value: Option<String>,
    pub not: bool,
}

impl TryFrom<&ConditionInput> for FilterTerm {
    type Error = GalError;

    fn try_from(input: &ConditionInput) -> Result<Self> {
        let attr = required(&input.attr, "attr")?;
        let op = required(&input.op, "op")?;
        let value = input
            .value
            .clone()
            .ok_or_else(|| GalError::InvalidFilter(format!("condition on {attr} has no value")))?;
        Ok(FilterTerm::Single(SingleTerm {
            negated: input.not,
            attribute: attr.to_string(),
            operator: Operator::parse(op),
            value,
        }))
    }
}

fn required<'a>(field: &'a Option<String>, name: &str) -> Result<&'a str> {
    match field.as_deref().map(str::trim) {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(GalError::InvalidFilter(format!("condition is missing {name}"))),
    }
}

impl TryFrom<&ConditionsInput> for FilterTerm {
    type Error = GalError;

    /// Groups are converted with an explicit work list so that deeply
    /// nested input cannot exhaust the stack.
    fn try_from(input: &ConditionsInput) -> Result<Self> {
        enum Work<'a> {
            Open(&'a ConditionsInput),
            Close(&'a ConditionsInput),
        }

        let mut work = vec![Work::Open(input)];
        let mut built: Vec<Vec<FilterTerm>> = vec![Vec::new()];

        while let Some(step) = work.pop() {
            match step {
                Work::Open(group) => {
                    if group.cond.is_empty() && group.conds.is_empty() {
                        return Err(GalError::InvalidFilter("empty condition group".into()));
                    }
                    let mut children = Vec::with_capacity(group.cond.len() + group.conds.len());
                    for cond in &group.cond {
                        children.push(FilterTerm::try_from(cond)?);
                    }
                    built.push(children);
                    work.push(Work::Close(group));
                    for nested in group.conds.iter().rev() {
                        work.push(Work::Open(nested));
                    }
                }
                Work::Close(group) => {
                    let children = built.pop().unwrap_or_default();
                    let term = FilterTerm::Multi(MultiTerm {
                        negated: group.not,
                        combinator: if group.or { Combinator::Or } else { Combinator::And },
                        children,
                    });
                    if let Some(parent) = built.last_mut() {
                        parent.push(term);
                    }
                }
            }
        }

        built
            .pop()
            .and_then(|mut root| root.pop())
            .ok_or_else(|| GalError::InvalidFilter("empty condition group".into()))
    }
}

/// Parse and validate a JSON structured filter.
pub fn parse_filter_json(raw: &str) -> Result<FilterTerm> {
    let input: ConditionsInput = serde_json::from_str(raw)
        .map_err(|e| GalError::InvalidFilter(format!("malformed filter: {e}")))?;
    FilterTerm::try_from(&input)
}
