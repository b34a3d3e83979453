//! Tokenizer for the script subset

use crate::error::{VmError, VmResult};

/// A lexical token
#[derive(Clone, Debug, PartialEq)]
pub enum Token {
    Number(f64),
    Str(String),
    Ident(String),
    // keywords
    New,
    Return,
    Throw,
    Null,
    Undefined,
    True,
    False,
    // punctuation
    LParen,
    RParen,
    LBrace,
    RBrace,
    LBracket,
    RBracket,
    Comma,
    Semi,
    Colon,
    Dot,
    Arrow,
    Assign,
    EqEq,
    EqEqEq,
    NotEq,
    NotEqEq,
    Lt,
    Gt,
    Le,
    Ge,
    Plus,
    Minus,
    Star,
    Slash,
    Bang,
    Eof,
}

/// Tokenize source text
pub fn tokenize(src: &str) -> VmResult<Vec<Token>> {
    let bytes = src.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        let c = bytes[i] as char;
        match c {
            ' ' | '\t' | '\r' | '\n' => i += 1,
            '/' if i + 1 < bytes.len() && bytes[i + 1] == b'/' => {
                while i < bytes.len() && bytes[i] != b'\n' {
                    i += 1;
                }
            }
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '{' => {
                tokens.push(Token::LBrace);
                i += 1;
            }
            '}' => {
                tokens.push(Token::RBrace);
                i += 1;
            }
            '[' => {
                tokens.push(Token::LBracket);
                i += 1;
            }
            ']' => {
                tokens.push(Token::RBracket);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            ';' => {
                tokens.push(Token::Semi);
                i += 1;
            }
            ':' => {
                tokens.push(Token::Colon);
                i += 1;
            }
            '.' => {
                tokens.push(Token::Dot);
                i += 1;
            }
            '+' => {
                tokens.push(Token::Plus);
                i += 1;
            }
            '-' => {
                tokens.push(Token::Minus);
                i += 1;
            }
            '*' => {
                tokens.push(Token::Star);
                i += 1;
            }
            '/' => {
                tokens.push(Token::Slash);
                i += 1;
            }
            '=' => {
                if src[i..].starts_with("===") {
                    tokens.push(Token::EqEqEq);
                    i += 3;
                } else if src[i..].starts_with("==") {
                    tokens.push(Token::EqEq);
                    i += 2;
                } else if src[i..].starts_with("=>") {
                    tokens.push(Token::Arrow);
                    i += 2;
                } else {
                    tokens.push(Token::Assign);
                    i += 1;
                }
            }
            '!' => {
                if src[i..].starts_with("!==") {
                    tokens.push(Token::NotEqEq);
                    i += 3;
                } else if src[i..].starts_with("!=") {
                    tokens.push(Token::NotEq);
                    i += 2;
                } else {
                    tokens.push(Token::Bang);
                    i += 1;
                }
            }
            '<' => {
                if src[i..].starts_with("<=") {
                    tokens.push(Token::Le);
                    i += 2;
                } else {
                    tokens.push(Token::Lt);
                    i += 1;
                }
            }
            '>' => {
                if src[i..].starts_with(">=") {
                    tokens.push(Token::Ge);
                    i += 2;
                } else {
                    tokens.push(Token::Gt);
                    i += 1;
                }
            }
            '"' | '\'' => {
                let quote = bytes[i];
                i += 1;
                let mut s = String::new();
                loop {
                    if i >= bytes.len() {
                        return Err(VmError::syntax_error("unterminated string"));
                    }
                    let b = bytes[i];
                    if b == quote {
                        i += 1;
                        break;
                    }
                    if b == b'\\' && i + 1 < bytes.len() {
                        i += 1;
                        let esc = bytes[i] as char;
                        s.push(match esc {
                            'n' => '\n',
                            't' => '\t',
                            'r' => '\r',
                            other => other,
                        });
                        i += 1;
                    } else {
                        // multi-byte chars: take the whole char
                        let ch = src[i..].chars().next().unwrap_or('\u{fffd}');
                        s.push(ch);
                        i += ch.len_utf8();
                    }
                }
                tokens.push(Token::Str(s));
            }
            '0'..='9' => {
                let start = i;
                while i < bytes.len() && (bytes[i].is_ascii_digit() || bytes[i] == b'.') {
                    // dot followed by non-digit is member access
                    if bytes[i] == b'.' && (i + 1 >= bytes.len() || !bytes[i + 1].is_ascii_digit()) {
                        break;
                    }
                    i += 1;
                }
                let text = &src[start..i];
                let n: f64 = text
                    .parse()
                    .map_err(|_| VmError::syntax_error(format!("bad number literal: {text}")))?;
                tokens.push(Token::Number(n));
            }
            c if c.is_ascii_alphabetic() || c == '_' || c == '$' => {
                let start = i;
                while i < bytes.len() {
                    let b = bytes[i] as char;
                    if b.is_ascii_alphanumeric() || b == '_' || b == '$' {
                        i += 1;
                    } else {
                        break;
                    }
                }
                let word = &src[start..i];
                tokens.push(match word {
                    "new" => Token::New,
                    "return" => Token::Return,
                    "throw" => Token::Throw,
                    "null" => Token::Null,
                    "undefined" => Token::Undefined,
                    "true" => Token::True,
                    "false" => Token::False,
                    _ => Token::Ident(word.to_string()),
                });
            }
            other => {
                return Err(VmError::syntax_error(format!("unexpected character: {other}")));
            }
        }
    }

    tokens.push(Token::Eof);
    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokenize_expression() {
        let toks = tokenize("obj.a = 1.5;").unwrap();
        assert_eq!(
            toks,
            vec![
                Token::Ident("obj".into()),
                Token::Dot,
                Token::Ident("a".into()),
                Token::Assign,
                Token::Number(1.5),
                Token::Semi,
                Token::Eof,
            ]
        );
    }

    #[test]
    fn test_tokenize_arrow_and_eq() {
        let toks = tokenize("x => x === 1").unwrap();
        assert!(toks.contains(&Token::Arrow));
        assert!(toks.contains(&Token::EqEqEq));
    }

    #[test]
    fn test_tokenize_string_escapes() {
        let toks = tokenize(r#"'a\nb'"#).unwrap();
        assert_eq!(toks[0], Token::Str("a\nb".into()));
    }

    #[test]
    fn test_member_after_number_ident() {
        // `1.foo` is not valid in the subset, but `a.b` after a number works
        let toks = tokenize("f(1).b").unwrap();
        assert!(toks.contains(&Token::Dot));
    }
}
