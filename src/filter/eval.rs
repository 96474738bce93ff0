//! In-memory filter evaluation.
//!
//! Evaluation keeps one frame per open AND/OR group. A leaf is skipped once
//! its group's outcome can no longer change (already true under OR,
//! already false under AND); everything below a skipped group is skipped
//! too. Skipping never changes the result, only the work done.

use std::borrow::Cow;

use crate::model::contact::{lookup, AttrMap, AttrValue, Contact, ContactElement, GalContact};

use super::{Combinator, FilterTerm, FilterVisitor, MultiTerm, Operator, SingleTerm};

/// Attribute lookup shared by every entry shape a filter runs against.
pub trait AttributeSource {
    fn attribute(&self, name: &str) -> Option<Cow<'_, AttrValue>>;
}

impl AttributeSource for AttrMap {
    fn attribute(&self, name: &str) -> Option<Cow<'_, AttrValue>> {
        lookup(self, name).map(Cow::Borrowed)
    }
}

impl AttributeSource for GalContact {
    fn attribute(&self, name: &str) -> Option<Cow<'_, AttrValue>> {
        lookup(&self.attrs, name).map(Cow::Borrowed)
    }
}

impl AttributeSource for Contact {
    fn attribute(&self, name: &str) -> Option<Cow<'_, AttrValue>> {
        self.attr(name)
    }
}

impl AttributeSource for ContactElement {
    fn attribute(&self, name: &str) -> Option<Cow<'_, AttrValue>> {
        lookup(&self.attrs, name).map(Cow::Borrowed)
    }
}

struct Frame {
    combinator: Combinator,
    negated: bool,
    result: Option<bool>,
    skip: bool,
}

impl Frame {
    /// The group's value is final whatever the remaining children say.
    fn decided(&self) -> bool {
        matches!(
            (self.combinator, self.result),
            (Combinator::Or, Some(true)) | (Combinator::And, Some(false))
        )
    }

    fn fold(&mut self, value: bool) {
        self.result = Some(match (self.result, self.combinator) {
            (None, _) => value,
            (Some(r), Combinator::And) => r && value,
            (Some(r), Combinator::Or) => r || value,
        });
    }
}

/// Visitor computing whether one entry matches a filter.
pub struct Evaluator<'s, S: AttributeSource + ?Sized> {
    source: &'s S,
    stack: Vec<Frame>,
    result: Option<bool>,
    evaluated: usize,
}

impl<'s, S: AttributeSource + ?Sized> Evaluator<'s, S> {
    pub fn new(source: &'s S) -> Self {
        Self {
            source,
            stack: Vec::new(),
            result: None,
            evaluated: 0,
        }
    }

    /// Final result; an empty walk matches.
    pub fn result(&self) -> bool {
        self.result.unwrap_or(true)
    }

    /// Number of leaves actually evaluated.
    pub fn evaluated(&self) -> usize {
        self.evaluated
    }
}

impl<S: AttributeSource + ?Sized> FilterVisitor for Evaluator<'_, S> {
    fn enter_multi(&mut self, term: &MultiTerm) {
        let skip = self
            .stack
            .last()
            .is_some_and(|parent| parent.skip || parent.decided());
        self.stack.push(Frame {
            combinator: term.combinator,
            negated: term.negated,
            result: None,
            skip,
        });
    }

    fn leave_multi(&mut self, _term: &MultiTerm) {
        let Some(frame) = self.stack.pop() else {
            return;
        };
        if frame.skip {
            return;
        }
        // An empty AND is true, an empty OR false.
        let mut value = frame
            .result
            .unwrap_or(frame.combinator == Combinator::And);
        if frame.negated {
            value = !value;
        }
        match self.stack.last_mut() {
            Some(parent) if !parent.decided() => parent.fold(value),
            Some(_) => {}
            None => self.result = Some(value),
        }
    }

    fn visit_single(&mut self, term: &SingleTerm) {
        if let Some(parent) = self.stack.last() {
            if parent.skip || parent.decided() {
                return;
            }
        }
        self.evaluated += 1;
        let value = matches_single(term, self.source);
        match self.stack.last_mut() {
            Some(parent) => parent.fold(value),
            None => self.result = Some(value),
        }
    }
}

/// Whether `source` satisfies the whole filter.
pub fn matches<S: AttributeSource + ?Sized>(term: &FilterTerm, source: &S) -> bool {
    let mut evaluator = Evaluator::new(source);
    term.accept(&mut evaluator);
    evaluator.result()
}

/// Evaluate one leaf. Multi-valued attributes match when any value does;
/// a missing attribute never matches. Negation is applied last.
pub fn matches_single<S: AttributeSource + ?Sized>(term: &SingleTerm, source: &S) -> bool {
    let raw = source.attribute(&term.attribute).is_some_and(|value| {
        value
            .values()
            .iter()
            .any(|actual| compare(term.operator, actual, &term.value))
    });
    raw != term.negated
}

/// Numeric operators compare as integers; an operand that is not an integer
/// makes the comparison false.
fn compare(op: Operator, actual: &str, expected: &str) -> bool {
    if op.is_numeric() {
        let (Some(a), Some(b)) = (parse_number(actual), parse_number(expected)) else {
            return false;
        };
        return match op {
            Operator::Ge => a >= b,
            Operator::Le => a <= b,
            Operator::Gt => a > b,
            _ => a < b,
        };
    }

    let actual = actual.to_lowercase();
    let expected = expected.to_lowercase();
    match op {
        Operator::Has => actual.contains(&expected),
        Operator::StartsWith => actual.starts_with(&expected),
        Operator::EndsWith => actual.ends_with(&expected),
        _ => actual == expected,
    }
}

fn parse_number(s: &str) -> Option<i64> {
    s.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(pairs: &[(&str, &str)]) -> AttrMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), AttrValue::from(*v)))
            .collect()
    }

    fn nested_tree() -> FilterTerm {
        // AND(eq(x,1), OR(eq(y,2), NOT eq(z,3)))
        FilterTerm::and(vec![
            FilterTerm::single("x", Operator::Eq, "1"),
            FilterTerm::or(vec![
                FilterTerm::single("y", Operator::Eq, "2"),
                FilterTerm::single("z", Operator::Eq, "3").negate(),
            ]),
        ])
    }

    #[test]
    fn test_nested_boolean_logic() {
        let tree = nested_tree();
        assert!(matches(&tree, &entry(&[("x", "1"), ("y", "9"), ("z", "4")])));
        assert!(!matches(&tree, &entry(&[("x", "1"), ("y", "9"), ("z", "3")])));
        assert!(matches(&tree, &entry(&[("x", "1"), ("y", "2"), ("z", "3")])));
    }

    #[test]
    fn test_short_circuit_keeps_result() {
        let tree = nested_tree();
        let e = entry(&[("x", "0"), ("y", "2"), ("z", "4")]);
        let mut ev = Evaluator::new(&e);
        tree.accept(&mut ev);
        assert!(!ev.result());
        // Only x was looked at: the OR group sits under a decided AND.
        assert_eq!(ev.evaluated(), 1);
    }

    #[test]
    fn test_or_short_circuit() {
        let tree = FilterTerm::or(vec![
            FilterTerm::single("a", Operator::Eq, "1"),
            FilterTerm::single("b", Operator::Eq, "1"),
            FilterTerm::single("c", Operator::Eq, "1"),
        ]);
        let e = entry(&[("a", "1")]);
        let mut ev = Evaluator::new(&e);
        tree.accept(&mut ev);
        assert!(ev.result());
        assert_eq!(ev.evaluated(), 1);
    }

    #[test]
    fn test_negated_group() {
        let tree = FilterTerm::or(vec![
            FilterTerm::single("a", Operator::Eq, "1"),
            FilterTerm::single("b", Operator::Eq, "1"),
        ])
        .negate();
        assert!(matches(&tree, &entry(&[("a", "2"), ("b", "2")])));
        assert!(!matches(&tree, &entry(&[("a", "1")])));
    }

    #[test]
    fn test_multi_value_any() {
        let mut e = AttrMap::new();
        e.insert(
            "email".into(),
            AttrValue::Multi(vec!["a@x.com".into(), "b@y.com".into()]),
        );
        assert!(matches(&FilterTerm::single("email", Operator::Has, "y.com"), &e));
        assert!(!matches(&FilterTerm::single("email", Operator::Has, "z.com"), &e));
    }

    #[test]
    fn test_numeric_not_lexicographic() {
        let e = entry(&[("age", "100")]);
        assert!(matches(&FilterTerm::single("age", Operator::Ge, "30"), &e));
        assert!(!matches(&FilterTerm::single("age", Operator::Le, "30"), &e));
        assert!(matches(&FilterTerm::single("age", Operator::Gt, "99"), &e));
        assert!(!matches(&FilterTerm::single("age", Operator::Lt, "100"), &e));
    }

    #[test]
    fn test_non_numeric_comparison_is_false() {
        let e = entry(&[("age", "unknown")]);
        assert!(!matches(&FilterTerm::single("age", Operator::Ge, "30"), &e));
        // Negation still applies to the false predicate.
        assert!(matches(&FilterTerm::single("age", Operator::Ge, "30").negate(), &e));
    }

    #[test]
    fn test_case_insensitive_text_ops() {
        let e = entry(&[("company", "Example Corp")]);
        assert!(matches(&FilterTerm::single("company", Operator::Eq, "example corp"), &e));
        assert!(matches(&FilterTerm::single("company", Operator::StartsWith, "EXAM"), &e));
        assert!(matches(&FilterTerm::single("company", Operator::EndsWith, "corp"), &e));
        assert!(!matches(&FilterTerm::single("company", Operator::Eq, "example"), &e));
    }

    #[test]
    fn test_missing_attribute() {
        let e = entry(&[]);
        assert!(!matches(&FilterTerm::single("title", Operator::Has, ""), &e));
        assert!(matches(&FilterTerm::single("title", Operator::Has, "x").negate(), &e));
    }

    #[test]
    fn test_same_result_for_contact_and_gal_contact() {
        use crate::model::gal::GalType;
        use std::collections::BTreeMap;

        let mut fields = BTreeMap::new();
        fields.insert("email".to_string(), r#"["a@x.com","b@y.com"]"#.to_string());
        fields.insert("x".to_string(), "1".to_string());
        let contact = Contact {
            id: 1,
            folder_id: 257,
            mod_sequence: 1,
            fields,
        };
        let gal = GalContact::new(GalType::Internal, "uid=a", contact.attr_map());

        let tree = FilterTerm::and(vec![
            FilterTerm::single("x", Operator::Eq, "1"),
            FilterTerm::single("email", Operator::EndsWith, "@y.com"),
        ]);
        assert!(matches(&tree, &contact));
        assert_eq!(matches(&tree, &contact), matches(&tree, &gal));
    }
}
