use nom::{
    IResult, Parser,
    branch::alt,
    bytes::complete::{tag, take_while, take_while1},
    character::complete::{char, digit1, multispace0, multispace1},
    combinator::{cut, eof, peek, recognize},
    error::ErrorKind,
    multi::many0,
    sequence::{preceded, terminated},
};

use crate::MAX_PARSE_DEPTH;
use crate::ast::{Integer, Node, is_identifier_char, is_identifier_start};
use crate::{Error, ParseError, ParseErrorKind};

/// Convert nom parsing errors to structured parse errors
fn to_parse_error(source: &str, error: nom::Err<nom::error::Error<&str>>) -> ParseError {
    match error {
        nom::Err::Error(e) | nom::Err::Failure(e) => {
            let offset = source.len().saturating_sub(e.input.len());
            let (kind, message) = match e.code {
                ErrorKind::TooLarge => (
                    ParseErrorKind::TooDeeplyNested,
                    format!("Expression too deeply nested (max depth: {MAX_PARSE_DEPTH})"),
                ),
                ErrorKind::Digit => (
                    ParseErrorKind::ImplementationLimit,
                    format!(
                        "Integer literal out of range at position {offset} (max: {})",
                        Integer::MAX
                    ),
                ),
                _ if e.input.trim_start().is_empty() => (
                    ParseErrorKind::Incomplete,
                    "Unexpected end of input (unclosed list)".to_owned(),
                ),
                _ => {
                    let near: String = e.input.chars().take(10).collect();
                    (
                        ParseErrorKind::InvalidSyntax,
                        format!("Invalid syntax near '{near}' at position {offset}"),
                    )
                }
            };
            ParseError::with_context(kind, message, source, offset)
        }
        nom::Err::Incomplete(_) => {
            ParseError::from_message(ParseErrorKind::Incomplete, "Unexpected end of input")
        }
    }
}

/// An atom must end at whitespace, a parenthesis, or the end of input
fn token_boundary(input: &str) -> IResult<&str, &str> {
    peek(alt((multispace1, tag("("), tag(")"), eof))).parse(input)
}

/// Parse an unsigned decimal integer
fn parse_integer(input: &str) -> IResult<&str, Node> {
    let (remaining, digits) = digit1.parse(input)?;

    match digits.parse::<Integer>() {
        Ok(n) => Ok((remaining, Node::Integer(n))),
        // Hard failure: a run of digits can never be an identifier either
        Err(_) => Err(nom::Err::Failure(nom::error::Error::new(
            input,
            ErrorKind::Digit,
        ))),
    }
}

/// Parse an identifier: a letter or `> < = ! + -`, then letters, glyphs and digits
fn parse_identifier(input: &str) -> IResult<&str, Node> {
    let (remaining, name) =
        recognize((take_while1(is_identifier_start), take_while(is_identifier_char)))
            .parse(input)?;
    Ok((remaining, Node::Identifier(name.to_owned())))
}

fn parse_atom(input: &str) -> IResult<&str, Node> {
    terminated(alt((parse_integer, parse_identifier)), token_boundary).parse(input)
}

/// Parse a parenthesized list
fn parse_list(input: &str, depth: usize) -> IResult<&str, Node> {
    let (input, _) = char('(').parse(input)?;
    let (input, elements) = many0(|input| parse_sexpr(input, depth + 1)).parse(input)?;
    let (input, _) = multispace0.parse(input)?;
    // Once a list is open, a missing ')' is fatal, so nested failures are not backtracked over
    let (input, _) = cut(char(')')).parse(input)?;

    Ok((input, Node::List(elements)))
}

/// Parse one S-expression, skipping leading whitespace
fn parse_sexpr(input: &str, depth: usize) -> IResult<&str, Node> {
    if depth >= MAX_PARSE_DEPTH {
        return Err(nom::Err::Failure(nom::error::Error::new(
            input,
            ErrorKind::TooLarge,
        )));
    }
    preceded(
        multispace0,
        alt((|input| parse_list(input, depth), parse_atom)),
    )
    .parse(input)
}

fn skip_whitespace(input: &str) -> &str {
    input.trim_start_matches([' ', '\t', '\r', '\n'])
}

/// Parse a whole program: a sequence of parenthesized top-level forms.
///
/// The result is a `List` holding every top-level form in source order. On
/// failure the error names the last form that parsed successfully.
pub fn parse_program(source: &str) -> Result<Node, Error> {
    let mut forms: Vec<Node> = Vec::new();
    let mut remaining = skip_whitespace(source);

    while !remaining.is_empty() {
        let parsed = if remaining.starts_with('(') {
            parse_list(remaining, 0).map_err(|e| to_parse_error(source, e))
        } else {
            let offset = source.len() - remaining.len();
            Err(ParseError::with_context(
                ParseErrorKind::InvalidSyntax,
                format!("Top-level forms must be lists (position {offset})"),
                source,
                offset,
            ))
        };

        match parsed {
            Ok((rest, form)) => {
                forms.push(form);
                remaining = skip_whitespace(rest);
            }
            Err(err) => {
                let err = match forms.last() {
                    Some(last) => err.after_form(last.to_string()),
                    None => err,
                };
                return Err(Error::ParseError(err));
            }
        }
    }

    log::debug!("parsed {} top-level forms", forms.len());
    Ok(Node::List(forms))
}

/// Parse exactly one expression (integer, identifier or list).
pub fn parse_form(source: &str) -> Result<Node, Error> {
    match terminated(|input| parse_sexpr(input, 0), multispace0).parse(source) {
        Ok(("", node)) => Ok(node),
        Ok((remaining, _)) => Err(Error::ParseError(ParseError::with_context(
            ParseErrorKind::TrailingContent,
            format!("Unexpected remaining input: '{remaining}'"),
            source,
            source.len() - remaining.len(),
        ))),
        Err(e) => Err(Error::ParseError(to_parse_error(source, e))),
    }
}
