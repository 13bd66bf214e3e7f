//! Quote-aware scanning of generated procedure code
//!
//! Literals are single-quoted with `''` as the escaped quote. Anything
//! outside a literal is code: separators, function names, numbers. The
//! scanner is a two-state machine so that `;`, `,` and parentheses inside
//! element names never split a statement.

use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    OutsideLiteral,
    InsideLiteral,
}

/// One token of procedure code.
#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    /// Unescaped content of a quoted literal
    Literal(String),
    /// Identifier, number or operator text outside literals
    Word(String),
    OpenParen,
    CloseParen,
    Comma,
    Semicolon,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnterminatedLiteral {
    /// Byte offset of the opening quote
    pub offset: usize,
}

impl fmt::Display for UnterminatedLiteral {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unterminated literal starting at byte {}", self.offset)
    }
}

impl std::error::Error for UnterminatedLiteral {}

/// Quote `text` as a literal: `'` doubled, CR/LF removed.
pub fn quote_literal(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 2);
    out.push('\'');
    for c in text.chars() {
        match c {
            '\'' => out.push_str("''"),
            '\r' | '\n' => {}
            c => out.push(c),
        }
    }
    out.push('\'');
    out
}

/// Scan `code` into tokens. Whitespace outside literals is dropped.
pub fn tokenize(code: &str) -> Result<Vec<Token>, UnterminatedLiteral> {
    let mut tokens = Vec::new();
    let mut state = State::OutsideLiteral;
    let mut buffer = String::new();
    let mut literal_start = 0;
    let mut chars = code.char_indices().peekable();

    fn flush(buffer: &mut String, tokens: &mut Vec<Token>) {
        if !buffer.is_empty() {
            tokens.push(Token::Word(std::mem::take(buffer)));
        }
    }

    while let Some((offset, c)) = chars.next() {
        match state {
            State::InsideLiteral => match c {
                '\'' if matches!(chars.peek(), Some((_, '\''))) => {
                    chars.next();
                    buffer.push('\'');
                }
                '\'' => {
                    tokens.push(Token::Literal(std::mem::take(&mut buffer)));
                    state = State::OutsideLiteral;
                }
                c => buffer.push(c),
            },
            State::OutsideLiteral => match c {
                '\'' => {
                    flush(&mut buffer, &mut tokens);
                    literal_start = offset;
                    state = State::InsideLiteral;
                }
                '(' | ')' | ',' | ';' => {
                    flush(&mut buffer, &mut tokens);
                    tokens.push(match c {
                        '(' => Token::OpenParen,
                        ')' => Token::CloseParen,
                        ',' => Token::Comma,
                        _ => Token::Semicolon,
                    });
                }
                c if c.is_whitespace() => flush(&mut buffer, &mut tokens),
                c => buffer.push(c),
            },
        }
    }

    if state == State::InsideLiteral {
        return Err(UnterminatedLiteral {
            offset: literal_start,
        });
    }
    flush(&mut buffer, &mut tokens);
    Ok(tokens)
}

/// Why a generated statement cannot stand on its own line.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StatementError {
    #[error(transparent)]
    Unterminated(#[from] UnterminatedLiteral),
    #[error("line break outside a literal")]
    LineBreak,
    #[error("unbalanced parentheses")]
    UnbalancedParens,
    #[error("missing ';' terminator")]
    MissingTerminator,
}

/// Check that `statement` is one complete statement on a single line.
///
/// Error log line numbers are mapped back to statements by position, so a
/// statement spilling onto a second line would shift every later cell.
pub fn check_statement(statement: &str) -> Result<(), StatementError> {
    if statement.contains(['\r', '\n']) {
        return Err(StatementError::LineBreak);
    }
    let tokens = tokenize(statement)?;
    let mut depth = 0usize;
    for token in &tokens {
        match token {
            Token::OpenParen => depth += 1,
            Token::CloseParen => {
                depth = depth
                    .checked_sub(1)
                    .ok_or(StatementError::UnbalancedParens)?;
            }
            _ => {}
        }
    }
    if depth != 0 {
        return Err(StatementError::UnbalancedParens);
    }
    match tokens.last() {
        Some(Token::Semicolon) => Ok(()),
        _ => Err(StatementError::MissingTerminator),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_literal() {
        assert_eq!(quote_literal("O'Brien"), "'O''Brien'");
        assert_eq!(quote_literal("a\r\nb"), "'ab'");
    }

    #[test]
    fn test_tokenize_keeps_separators_inside_literals() {
        let tokens = tokenize("CellPutS('a;b, (c)','Sales','it''s');").unwrap();
        assert_eq!(
            tokens,
            vec![
                Token::Word("CellPutS".into()),
                Token::OpenParen,
                Token::Literal("a;b, (c)".into()),
                Token::Comma,
                Token::Literal("Sales".into()),
                Token::Comma,
                Token::Literal("it's".into()),
                Token::CloseParen,
                Token::Semicolon,
            ]
        );
    }

    #[test]
    fn test_tokenize_empty_literal() {
        let tokens = tokenize("x = '';").unwrap();
        assert_eq!(
            tokens,
            vec![
                Token::Word("x".into()),
                Token::Word("=".into()),
                Token::Literal(String::new()),
                Token::Semicolon,
            ]
        );
    }

    #[test]
    fn test_unterminated_literal() {
        assert_eq!(
            tokenize("CellPutS('abc);"),
            Err(UnterminatedLiteral { offset: 9 })
        );
    }

    #[test]
    fn test_check_statement() {
        assert_eq!(check_statement("CellPutN(1,'c','a;b)');"), Ok(()));
        assert_eq!(
            check_statement("IF(CellIsUpdateable('c','a')=1);CellPutN(1,'c','a');ENDIF;"),
            Ok(())
        );
        assert_eq!(
            check_statement("CellPutN(1,'c',\r\n'a');"),
            Err(StatementError::LineBreak)
        );
        assert_eq!(
            check_statement("CellPutS('it's','c','a');"),
            Err(StatementError::Unterminated(UnterminatedLiteral { offset: 22 }))
        );
        assert_eq!(
            check_statement("CellPutN(1,'c','a';"),
            Err(StatementError::UnbalancedParens)
        );
        assert_eq!(
            check_statement("CellPutN(1,'c','a')"),
            Err(StatementError::MissingTerminator)
        );
    }
}
