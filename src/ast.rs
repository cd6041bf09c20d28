//! This module defines the Abstract Syntax Tree for Eva source programs.
//! The parser produces [`Expr`] trees with four node kinds: numbers, string
//! literals, symbols, and lists. Special forms (`begin`, `var`, `def`,
//! `lambda`, `if`, `while`, `set`, `class`, `new`, `prop`) are ordinary
//! lists tagged by their head symbol; the compiler recognizes them by shape.
//!
//! Every list node carries a [`NodeId`] assigned by the parser. The scope
//! analyzer keys its scope records by these ids, which is how the compiler
//! later finds the right scope for a `begin`, `def`, `lambda`, or `class`
//! node without re-resolving anything.

/// Allowed non-alphanumeric characters in Eva symbol names.
pub(crate) const SYMBOL_SPECIAL_CHARS: &str = "+-*/<>=!?_";

/// Identity of a list node within one parsed program.
///
/// Ids are dense and assigned in parse order; they are only meaningful for
/// the program they were parsed from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub u32);

/// An Eva expression.
#[derive(Debug, Clone)]
pub enum Expr {
    /// Numeric literal (IEEE-754 double).
    Number(f64),
    /// String literal.
    Str(String),
    /// Symbol: a variable reference, operator, or special-form tag.
    Symbol(String),
    /// List: a call or a special form. The id identifies this node to the
    /// scope analyzer.
    List(NodeId, Vec<Expr>),
}

impl Expr {
    /// The head symbol of a list, if the expression is a non-empty list
    /// starting with a symbol. This is how special forms are recognized.
    pub(crate) fn tag(&self) -> Option<&str> {
        match self {
            Expr::List(_, items) => match items.first() {
                Some(Expr::Symbol(name)) => Some(name.as_str()),
                _ => None,
            },
            _ => None,
        }
    }

    /// Whether this is a tagged list `(tag …)`.
    pub(crate) fn is_tagged(&self, tag: &str) -> bool {
        self.tag() == Some(tag)
    }

    /// The symbol name, or a TypeError-worthy `None`.
    pub(crate) fn as_symbol(&self) -> Option<&str> {
        match self {
            Expr::Symbol(name) => Some(name.as_str()),
            _ => None,
        }
    }
}

// Node ids never participate in equality: two parses of the same source
// produce equal trees.
impl PartialEq for Expr {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Expr::Number(a), Expr::Number(b)) => a == b,
            (Expr::Str(a), Expr::Str(b)) => a == b,
            (Expr::Symbol(a), Expr::Symbol(b)) => a == b,
            (Expr::List(_, a), Expr::List(_, b)) => a == b,
            _ => false,
        }
    }
}

impl std::fmt::Display for Expr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Expr::Number(n) => write!(f, "{n}"),
            Expr::Str(s) => {
                write!(f, "\"")?;
                for ch in s.chars() {
                    match ch {
                        '"' => write!(f, "\\\"")?,
                        '\\' => write!(f, "\\\\")?,
                        '\n' => write!(f, "\\n")?,
                        '\t' => write!(f, "\\t")?,
                        '\r' => write!(f, "\\r")?,
                        c => write!(f, "{c}")?,
                    }
                }
                write!(f, "\"")
            }
            Expr::Symbol(s) => write!(f, "{s}"),
            Expr::List(_, items) => {
                write!(f, "(")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, " ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, ")")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list(items: Vec<Expr>) -> Expr {
        Expr::List(NodeId(0), items)
    }

    #[test]
    fn test_tag_recognition() {
        let expr = list(vec![
            Expr::Symbol("var".to_owned()),
            Expr::Symbol("x".to_owned()),
            Expr::Number(10.0),
        ]);
        assert_eq!(expr.tag(), Some("var"));
        assert!(expr.is_tagged("var"));
        assert!(!expr.is_tagged("def"));
        assert_eq!(Expr::Number(1.0).tag(), None);
        assert_eq!(list(vec![Expr::Number(1.0)]).tag(), None);
        assert_eq!(list(vec![]).tag(), None);
    }

    #[test]
    fn test_equality_ignores_node_ids() {
        let a = Expr::List(NodeId(1), vec![Expr::Symbol("x".to_owned())]);
        let b = Expr::List(NodeId(99), vec![Expr::Symbol("x".to_owned())]);
        assert_eq!(a, b);
    }

    #[test]
    fn test_display_round_trip_shapes() {
        let expr = list(vec![
            Expr::Symbol("+".to_owned()),
            Expr::Number(1.0),
            list(vec![Expr::Symbol("-".to_owned()), Expr::Number(2.0), Expr::Number(3.0)]),
        ]);
        assert_eq!(format!("{expr}"), "(+ 1 (- 2 3))");

        let s = Expr::Str("a\"b\nc".to_owned());
        assert_eq!(format!("{s}"), "\"a\\\"b\\nc\"");
    }
}
