//! Compile a filter tree into an RFC 4515 directory filter.

use super::{Combinator, FilterTerm, FilterVisitor, MultiTerm, Operator, SingleTerm};

/// Escape a value for use inside an LDAP filter assertion.
pub fn ldap_escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '*' => out.push_str("\\2a"),
            '(' => out.push_str("\\28"),
            ')' => out.push_str("\\29"),
            '\\' => out.push_str("\\5c"),
            '\0' => out.push_str("\\00"),
            _ => out.push(c),
        }
    }
    out
}

#[derive(Default)]
struct LdapBuilder {
    stack: Vec<(bool, Combinator, String)>,
    output: String,
}

impl LdapBuilder {
    fn push(&mut self, clause: &str) {
        match self.stack.last_mut() {
            Some((_, _, body)) => body.push_str(clause),
            None => self.output = clause.to_string(),
        }
    }
}

impl FilterVisitor for LdapBuilder {
    fn enter_multi(&mut self, term: &MultiTerm) {
        self.stack.push((term.negated, term.combinator, String::new()));
    }

    fn leave_multi(&mut self, _term: &MultiTerm) {
        let Some((negated, combinator, body)) = self.stack.pop() else {
            return;
        };
        let op = match combinator {
            Combinator::And => '&',
            Combinator::Or => '|',
        };
        let group = format!("({op}{body})");
        let clause = if negated { format!("(!{group})") } else { group };
        self.push(&clause);
    }

    fn visit_single(&mut self, term: &SingleTerm) {
        self.push(&single_filter(term));
    }
}

fn single_filter(term: &SingleTerm) -> String {
    let a = &term.attribute;
    let v = ldap_escape(&term.value);
    let assertion = match term.operator {
        Operator::Has => format!("({a}=*{v}*)"),
        Operator::Eq => format!("({a}={v})"),
        Operator::StartsWith => format!("({a}={v}*)"),
        Operator::EndsWith => format!("({a}=*{v})"),
        Operator::Ge => format!("({a}>={v})"),
        Operator::Le => format!("({a}<={v})"),
        // No strict ordering in LDAP: a > v is !(a <= v).
        Operator::Gt => format!("(!({a}<={v}))"),
        Operator::Lt => format!("(!({a}>={v}))"),
    };
    if term.negated {
        format!("(!{assertion})")
    } else {
        assertion
    }
}

/// Directory filter equivalent of `term`.
pub fn to_ldap_filter(term: &FilterTerm) -> String {
    let mut builder = LdapBuilder::default();
    term.accept(&mut builder);
    builder.output
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape() {
        assert_eq!(ldap_escape("a*(b)\\"), "a\\2a\\28b\\29\\5c");
    }

    #[test]
    fn test_nested_filter() {
        let tree = FilterTerm::and(vec![
            FilterTerm::single("company", Operator::StartsWith, "Acme"),
            FilterTerm::or(vec![
                FilterTerm::single("title", Operator::Has, "eng"),
                FilterTerm::single("l", Operator::Eq, "Paris"),
            ])
            .negate(),
        ]);
        assert_eq!(
            to_ldap_filter(&tree),
            "(&(company=Acme*)(!(|(title=*eng*)(l=Paris))))"
        );
    }

    #[test]
    fn test_strict_comparisons() {
        assert_eq!(
            to_ldap_filter(&FilterTerm::single("age", Operator::Gt, "30")),
            "(!(age<=30))"
        );
        assert_eq!(
            to_ldap_filter(&FilterTerm::single("age", Operator::Lt, "30").negate()),
            "(!(!(age>=30)))"
        );
    }
}
