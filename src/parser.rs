//! S-expression parser for Eva source, built on nom.
//!
//! The grammar is small: numbers (doubles), double-quoted strings with the
//! usual escapes, symbols, and parenthesized lists. `;` starts a line
//! comment. Special forms are not distinguished here; they are ordinary
//! lists and the compiler recognizes them by their head symbol.
//!
//! The driver wraps whole programs in `(begin …)` before calling [`parse`],
//! so the entry point accepts exactly one expression.

use nom::{
    IResult, Parser,
    branch::alt,
    bytes::complete::{take_while, take_while1},
    character::complete::char,
    combinator::{opt, recognize},
    error::ErrorKind,
    multi::many0,
    sequence::pair,
};

use crate::Error;
use crate::MAX_PARSE_DEPTH;
use crate::ast::{Expr, NodeId, SYMBOL_SPECIAL_CHARS};

/// Check if a string is a valid symbol name.
/// Valid: non-empty, no leading digit, no "-digit" prefix, alphanumeric +
/// SYMBOL_SPECIAL_CHARS.
fn is_valid_symbol(name: &str) -> bool {
    let mut chars = name.chars();

    match chars.next() {
        None => false,
        Some(first_char) => {
            if first_char.is_ascii_digit() {
                return false;
            }

            if first_char == '-'
                && let Some(second_char) = chars.next()
                && second_char.is_ascii_digit()
            {
                return false;
            }

            name.chars()
                .all(|c| c.is_alphanumeric() || SYMBOL_SPECIAL_CHARS.contains(c))
        }
    }
}

/// Convert nom parsing errors to user-friendly messages.
fn parse_error_to_message(input: &str, error: nom::Err<nom::error::Error<&str>>) -> String {
    match error {
        nom::Err::Error(e) | nom::Err::Failure(e) => {
            let position = input.len().saturating_sub(e.input.len());
            match e.code {
                ErrorKind::Char => format!("expected character at position {position}"),
                ErrorKind::TooLarge => {
                    format!("expression too deeply nested (max depth: {MAX_PARSE_DEPTH})")
                }
                _ => {
                    if position < input.len() {
                        let remaining_chars: String =
                            input.chars().skip(position).take(10).collect();
                        format!("invalid syntax near '{remaining_chars}'")
                    } else {
                        "unexpected end of input".into()
                    }
                }
            }
        }
        nom::Err::Incomplete(_) => "incomplete input".into(),
    }
}

/// Consume whitespace and `;` line comments (zero or more).
fn skip(input: &str) -> IResult<&str, ()> {
    let (input, _) = many0(alt((
        recognize(take_while1(|c: char| c.is_whitespace())),
        recognize(pair(char(';'), take_while(|c: char| c != '\n'))),
    )))
    .parse(input)?;
    Ok((input, ()))
}

/// Parse a numeric literal: optional sign, digits, optional fraction.
fn parse_number(input: &str) -> IResult<&str, Expr> {
    let (input, number_str) = recognize(pair(
        opt(char('-')),
        pair(
            take_while1(|c: char| c.is_ascii_digit()),
            opt(pair(char('.'), take_while1(|c: char| c.is_ascii_digit()))),
        ),
    ))
    .parse(input)?;

    match number_str.parse::<f64>() {
        Ok(n) => Ok((input, Expr::Number(n))),
        Err(_) => Err(nom::Err::Error(nom::error::Error::new(
            input,
            nom::error::ErrorKind::Digit,
        ))),
    }
}

/// Parse a symbol (identifier or operator).
fn parse_symbol(input: &str) -> IResult<&str, Expr> {
    let mut symbol_chars =
        take_while1(|c: char| c.is_alphanumeric() || SYMBOL_SPECIAL_CHARS.contains(c));

    let (remaining, candidate) = symbol_chars.parse(input)?;

    if is_valid_symbol(candidate) {
        Ok((remaining, Expr::Symbol(candidate.into())))
    } else {
        Err(nom::Err::Error(nom::error::Error::new(
            input,
            nom::error::ErrorKind::Alpha,
        )))
    }
}

/// Parse a string literal.
fn parse_string(input: &str) -> IResult<&str, Expr> {
    let (mut remaining, _) = char('"').parse(input)?;
    let mut chars = Vec::new();

    loop {
        let mut char_iter = remaining.chars();
        match char_iter.next() {
            Some('"') => {
                return Ok((char_iter.as_str(), Expr::Str(chars.into_iter().collect())));
            }
            Some('\\') => {
                match char_iter.next() {
                    Some('n') => chars.push('\n'),
                    Some('t') => chars.push('\t'),
                    Some('r') => chars.push('\r'),
                    Some('\\') => chars.push('\\'),
                    Some('"') => chars.push('"'),
                    _ => {
                        // Unknown or incomplete escape sequence
                        return Err(nom::Err::Error(nom::error::Error::new(
                            remaining,
                            nom::error::ErrorKind::Char,
                        )));
                    }
                }
                remaining = char_iter.as_str();
            }
            Some(ch) => {
                chars.push(ch);
                remaining = char_iter.as_str();
            }
            None => {
                // End of input before the closing quote
                return Err(nom::Err::Error(nom::error::Error::new(
                    remaining,
                    nom::error::ErrorKind::Char,
                )));
            }
        }
    }
}

/// Parse a parenthesized list.
fn parse_list(input: &str, depth: usize) -> IResult<&str, Expr> {
    let (input, _) = char('(').parse(input)?;

    let mut elements = Vec::new();
    let mut rest = input;
    loop {
        let (input, ()) = skip(rest)?;
        if let Ok((input, _)) = char::<_, nom::error::Error<&str>>(')').parse(input) {
            // Ids are assigned by `parse` in a second pass
            return Ok((input, Expr::List(NodeId(0), elements)));
        }
        let (input, element) = parse_sexpr(input, depth + 1)?;
        elements.push(element);
        rest = input;
    }
}

/// Parse one s-expression, enforcing the nesting depth limit.
fn parse_sexpr(input: &str, depth: usize) -> IResult<&str, Expr> {
    if depth >= MAX_PARSE_DEPTH {
        return Err(nom::Err::Error(nom::error::Error::new(
            input,
            nom::error::ErrorKind::TooLarge,
        )));
    }
    let (input, ()) = skip(input)?;
    alt((
        |input| parse_list(input, depth),
        parse_number,
        parse_string,
        parse_symbol,
    ))
    .parse(input)
}

/// Assign dense node ids to every list node, in parse order.
fn assign_ids(expr: &mut Expr, next: &mut u32) {
    if let Expr::List(id, items) = expr {
        *id = NodeId(*next);
        *next += 1;
        for item in items {
            assign_ids(item, next);
        }
    }
}

/// Parse a complete expression from input.
///
/// Trailing whitespace and comments are allowed; any other trailing content
/// is a [`Error::ParseError`].
pub fn parse(input: &str) -> Result<Expr, Error> {
    match parse_sexpr(input, 0) {
        Ok((remaining, mut expr)) => {
            let (remaining, ()) =
                skip(remaining).map_err(|e| Error::ParseError(parse_error_to_message(input, e)))?;
            if !remaining.is_empty() {
                return Err(Error::ParseError(format!(
                    "unexpected remaining input: '{remaining}'"
                )));
            }
            let mut next = 0;
            assign_ids(&mut expr, &mut next);
            Ok(expr)
        }
        Err(e) => Err(Error::ParseError(parse_error_to_message(input, e))),
    }
}
