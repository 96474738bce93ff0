//! Compile a filter tree into a mailbox search query.
//!
//! Each leaf becomes an indexed-field clause `#attr:"value"` shaped by its
//! operator; each group becomes `(`…`)`, prefixed with `-` when negated,
//! with ` AND ` / ` OR ` between siblings.

use super::{Combinator, FilterTerm, FilterVisitor, MultiTerm, Operator, SingleTerm};

struct Group {
    open: String,
    joiner: &'static str,
    parts: Vec<String>,
}

#[derive(Default)]
struct QueryBuilder {
    stack: Vec<Group>,
    output: String,
}

impl QueryBuilder {
    fn push(&mut self, clause: String) {
        match self.stack.last_mut() {
            Some(group) => group.parts.push(clause),
            None => self.output = clause,
        }
    }
}

impl FilterVisitor for QueryBuilder {
    fn enter_multi(&mut self, term: &MultiTerm) {
        self.stack.push(Group {
            open: if term.negated { "-(" } else { "(" }.to_string(),
            joiner: match term.combinator {
                Combinator::And => " AND ",
                Combinator::Or => " OR ",
            },
            parts: Vec::new(),
        });
    }

    fn leave_multi(&mut self, _term: &MultiTerm) {
        if let Some(group) = self.stack.pop() {
            let clause = format!("{}{})", group.open, group.parts.join(group.joiner));
            self.push(clause);
        }
    }

    fn visit_single(&mut self, term: &SingleTerm) {
        self.push(single_clause(term));
    }
}

/// Serialize one leaf.
pub fn single_clause(term: &SingleTerm) -> String {
    let value = escape(&term.value);
    let body = match term.operator {
        Operator::Has => format!("\"*{value}*\""),
        Operator::Eq => format!("\"{value}\""),
        Operator::StartsWith => format!("\"{value}*\""),
        Operator::EndsWith => format!("\"*{value}\""),
        Operator::Ge => format!(">=\"{value}\""),
        Operator::Le => format!("<=\"{value}\""),
        Operator::Gt => format!(">\"{value}\""),
        Operator::Lt => format!("<\"{value}\""),
    };
    let not = if term.negated { "-" } else { "" };
    format!("{not}#{}:{body}", term.attribute)
}

fn escape(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

/// Mailbox query equivalent of `term`.
pub fn to_mailbox_query(term: &FilterTerm) -> String {
    let mut builder = QueryBuilder::default();
    term.accept(&mut builder);
    builder.output
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_and_join_and_negated_group() {
        let tree = FilterTerm::and(vec![
            FilterTerm::single("x", Operator::Eq, "1"),
            FilterTerm::or(vec![
                FilterTerm::single("y", Operator::Eq, "2"),
                FilterTerm::single("z", Operator::Eq, "3"),
            ])
            .negate(),
        ]);
        assert_eq!(
            to_mailbox_query(&tree),
            r##"(#x:"1" AND -(#y:"2" OR #z:"3"))"##
        );
    }

    #[test]
    fn test_operator_shapes() {
        let cases = [
            (Operator::Has, r##"#email:"*y.com*""##),
            (Operator::StartsWith, r##"#email:"y.com*""##),
            (Operator::EndsWith, r##"#email:"*y.com""##),
            (Operator::Ge, r##"#email:>="y.com""##),
            (Operator::Lt, r##"#email:<"y.com""##),
        ];
        for (op, expected) in cases {
            assert_eq!(to_mailbox_query(&FilterTerm::single("email", op, "y.com")), expected);
        }
    }

    #[test]
    fn test_negated_leaf_and_quotes() {
        let t = FilterTerm::single("company", Operator::Eq, "Say \"hi\"").negate();
        assert_eq!(to_mailbox_query(&t), r##"-#company:"Say \"hi\"""##);
    }

    #[test]
    fn test_single_child_group() {
        let t = FilterTerm::or(vec![FilterTerm::single("a", Operator::Eq, "b")]);
        assert_eq!(to_mailbox_query(&t), r##"(#a:"b")"##);
    }
}
