//! This module defines the syntax tree shared by the reader, the tree-walking
//! interpreter and the bytecode compiler. A [`Node`] is an integer literal, an
//! identifier, or a list of nodes. Helper functions [`int`], [`ident`] and
//! [`list`] build trees in code and tests, and `Display` prints a node back in
//! source form so diagnostics can quote the offending expression.

/// Integer type of the language (32-bit, wraparound arithmetic)
pub type Integer = i32;

/// Non-alphabetic characters allowed in identifiers
pub(crate) const IDENTIFIER_GLYPHS: &str = "><=!+-";

/// Check whether a character may start an identifier
pub(crate) fn is_identifier_start(c: char) -> bool {
    c.is_ascii_alphabetic() || IDENTIFIER_GLYPHS.contains(c)
}

/// Check whether a character may continue an identifier (digits allowed after the first)
pub(crate) fn is_identifier_char(c: char) -> bool {
    is_identifier_start(c) || c.is_ascii_digit()
}

/// Syntax tree node
///
/// The AST is built once by the reader and never modified afterwards; every
/// engine walks it by reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    /// Integer literal
    Integer(Integer),
    /// Identifier (a letter or `> < = ! + -`, then also digits)
    Identifier(String),
    /// Parenthesized S-expression; the head conventionally names a form or function
    List(Vec<Node>),
}

impl Node {
    /// Identifier name, if this node is an identifier
    pub fn as_identifier(&self) -> Option<&str> {
        match self {
            Node::Identifier(name) => Some(name),
            _ => None,
        }
    }

    /// List elements, if this node is a list
    pub fn as_list(&self) -> Option<&[Node]> {
        match self {
            Node::List(elements) => Some(elements),
            _ => None,
        }
    }

    /// Whether this node is a `(def ...)` form
    pub fn is_definition(&self) -> bool {
        matches!(self.as_list(), Some([Node::Identifier(head), ..]) if head == "def")
    }
}

impl From<Integer> for Node {
    fn from(n: Integer) -> Self {
        Node::Integer(n)
    }
}

impl From<&str> for Node {
    fn from(s: &str) -> Self {
        Node::Identifier(s.to_owned())
    }
}

impl<T: Into<Node>> From<Vec<T>> for Node {
    fn from(v: Vec<T>) -> Self {
        Node::List(v.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<Node>, const N: usize> From<[T; N]> for Node {
    fn from(arr: [T; N]) -> Self {
        Node::List(arr.into_iter().map(Into::into).collect())
    }
}

/// Helper for integer literals
pub fn int(n: Integer) -> Node {
    Node::Integer(n)
}

/// Helper for identifiers; accepts both &str and String
pub fn ident<S: AsRef<str>>(name: S) -> Node {
    Node::Identifier(name.as_ref().to_owned())
}

/// Helper for lists of already-built nodes
pub fn list(elements: Vec<Node>) -> Node {
    Node::List(elements)
}

impl std::fmt::Display for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Node::Integer(n) => write!(f, "{n}"),
            Node::Identifier(name) => write!(f, "{name}"),
            Node::List(elements) => {
                write!(f, "(")?;
                for (i, elem) in elements.iter().enumerate() {
                    if i > 0 {
                        write!(f, " ")?;
                    }
                    write!(f, "{elem}")?;
                }
                write!(f, ")")
            }
        }
    }
}

#[cfg(test)]
mod helper_function_tests {
    use super::*;

    #[test]
    fn test_helper_functions_data_driven() {
        let test_cases = vec![
            (int(42), Node::Integer(42)),
            (int(Integer::MAX), Node::Integer(Integer::MAX)),
            (ident("sum"), Node::Identifier("sum".to_owned())),
            (ident(String::from(">=")), Node::Identifier(">=".to_owned())),
            (list(vec![]), Node::List(vec![])),
            (
                Node::from([1, 2, 3]),
                Node::List(vec![Node::Integer(1), Node::Integer(2), Node::Integer(3)]),
            ),
            (
                list(vec![ident("+"), int(1), Node::from(vec!["n"])]),
                Node::List(vec![
                    Node::Identifier("+".to_owned()),
                    Node::Integer(1),
                    Node::List(vec![Node::Identifier("n".to_owned())]),
                ]),
            ),
        ];

        for (i, (actual, expected)) in test_cases.iter().enumerate() {
            assert_eq!(actual, expected, "Test case {} failed", i + 1);
        }
    }

    #[test]
    fn test_display_source_form() {
        let node = list(vec![
            ident("def"),
            ident("inc"),
            Node::from(["n"]),
            list(vec![ident("+"), ident("n"), int(1)]),
        ]);
        assert_eq!(format!("{node}"), "(def inc (n) (+ n 1))");
        assert_eq!(format!("{}", list(vec![])), "()");
    }

    #[test]
    fn test_identifier_chars() {
        for c in ['a', 'Z', '>', '<', '=', '!', '+', '-'] {
            assert!(is_identifier_start(c), "{c} should start an identifier");
            assert!(is_identifier_char(c), "{c} should be allowed");
        }
        for c in ['0', '2', '9'] {
            assert!(!is_identifier_start(c), "{c} should not start an identifier");
            assert!(is_identifier_char(c), "{c} should continue an identifier");
        }
        for c in ['_', '?', '(', ' ', '*', 'é'] {
            assert!(!is_identifier_char(c), "{c} should be rejected");
        }
    }

    #[test]
    fn test_is_definition() {
        let def = list(vec![ident("def"), ident("main"), list(vec![]), int(1)]);
        assert!(def.is_definition());
        assert!(!list(vec![ident("main")]).is_definition());
        assert!(!int(3).is_definition());
        assert!(!list(vec![]).is_definition());
    }
}
