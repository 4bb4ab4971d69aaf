//! Lexical analysis for the script front end.
//!
//! [`tokenize`] turns a source buffer into a token vector ending with
//! [`TokenKind::Eof`]. Comments (`//`, `/* */` and `#`) are skipped.

mod cursor;
mod token;

pub use token::{Token, TokenKind};

use std::rc::Rc;

use cursor::{Cursor, is_ident_continue, is_ident_start};
use token::lookup_keyword;

/// A lexical error with its position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LexError {
    pub message: String,
    pub line: u32,
    pub column: u32,
}

/// Tokenize a whole buffer.
#[cfg_attr(feature = "profiling", profiling::function)]
pub fn tokenize(source: &str) -> Result<Vec<Token<'_>>, LexError> {
    let mut lexer = Lexer {
        cursor: Cursor::new(source),
    };
    let mut tokens = Vec::new();
    loop {
        let token = lexer.scan_token()?;
        let done = token.kind == TokenKind::Eof;
        tokens.push(token);
        if done {
            return Ok(tokens);
        }
    }
}

struct Lexer<'src> {
    cursor: Cursor<'src>,
}

impl<'src> Lexer<'src> {
    fn scan_token(&mut self) -> Result<Token<'src>, LexError> {
        self.skip_trivia()?;

        let line = self.cursor.line();
        let column = self.cursor.column();
        let start = self.cursor.offset();

        let Some(c) = self.cursor.peek() else {
            return Ok(Token {
                kind: TokenKind::Eof,
                lexeme: "",
                line,
                column,
            });
        };

        let kind = match c {
            '"' => self.scan_string(line, column)?,
            '\'' => self.scan_char(line, column)?,
            c if c.is_ascii_digit() => self.scan_number(line, column)?,
            c if is_ident_start(c) => {
                let ident = self.cursor.eat_while(is_ident_continue);
                lookup_keyword(ident).unwrap_or(TokenKind::Identifier)
            }
            _ => self.scan_operator(line, column)?,
        };

        Ok(Token {
            kind,
            lexeme: self.cursor.slice_from(start),
            line,
            column,
        })
    }

    fn skip_trivia(&mut self) -> Result<(), LexError> {
        loop {
            self.cursor.eat_while(char::is_whitespace);
            if self.cursor.check_str("//") || self.cursor.check_str("#") {
                self.cursor.eat_while(|c| c != '\n');
            } else if self.cursor.check_str("/*") {
                let line = self.cursor.line();
                let column = self.cursor.column();
                self.cursor.eat_str("/*");
                loop {
                    if self.cursor.eat_str("*/") {
                        break;
                    }
                    if self.cursor.advance().is_none() {
                        return Err(error("unterminated comment", line, column));
                    }
                }
            } else {
                return Ok(());
            }
        }
    }

    fn scan_number(&mut self, line: u32, column: u32) -> Result<TokenKind, LexError> {
        if self.cursor.check_str("0x") || self.cursor.check_str("0X") {
            self.cursor.advance();
            self.cursor.advance();
            let digits = self.cursor.eat_while(|c| c.is_ascii_hexdigit());
            return u64::from_str_radix(digits, 16)
                .map(|v| TokenKind::Integer(v as i64))
                .map_err(|_| error("invalid hexadecimal literal", line, column));
        }

        let start = self.cursor.offset();
        self.cursor.eat_while(|c| c.is_ascii_digit());
        let mut is_float = false;
        if self.cursor.peek() == Some('.')
            && self.cursor.peek_nth(1).is_some_and(|c| c.is_ascii_digit())
        {
            is_float = true;
            self.cursor.advance();
            self.cursor.eat_while(|c| c.is_ascii_digit());
        }
        if self.cursor.check(|c| c == 'e' || c == 'E') {
            is_float = true;
            self.cursor.advance();
            if !self.cursor.eat('-') {
                self.cursor.eat('+');
            }
            if self.cursor.eat_while(|c| c.is_ascii_digit()).is_empty() {
                return Err(error("exponent expected", line, column));
            }
        }
        let text = self.cursor.slice_from(start);
        if is_float {
            text.parse::<f64>()
                .map(TokenKind::Float)
                .map_err(|_| error("invalid float literal", line, column))
        } else {
            text.parse::<i64>()
                .map(TokenKind::Integer)
                .map_err(|_| error("integer literal out of range", line, column))
        }
    }

    fn scan_string(&mut self, line: u32, column: u32) -> Result<TokenKind, LexError> {
        self.cursor.advance();
        let mut value = String::new();
        loop {
            match self.cursor.advance() {
                None | Some('\n') => return Err(error("unfinished string", line, column)),
                Some('"') => break,
                Some('\\') => value.push(self.scan_escape()?),
                Some(c) => value.push(c),
            }
        }
        Ok(TokenKind::String(Rc::from(value)))
    }

    /// `'a'` is an integer literal holding the character code.
    fn scan_char(&mut self, line: u32, column: u32) -> Result<TokenKind, LexError> {
        self.cursor.advance();
        let c = match self.cursor.advance() {
            Some('\\') => self.scan_escape()?,
            Some('\'') | None => return Err(error("empty constant", line, column)),
            Some(c) => c,
        };
        if !self.cursor.eat('\'') {
            return Err(error("invalid character constant", line, column));
        }
        Ok(TokenKind::Integer(c as i64))
    }

    fn scan_escape(&mut self) -> Result<char, LexError> {
        let line = self.cursor.line();
        let column = self.cursor.column();
        let c = match self.cursor.advance() {
            Some('n') => '\n',
            Some('t') => '\t',
            Some('r') => '\r',
            Some('0') => '\0',
            Some('\\') => '\\',
            Some('"') => '"',
            Some('\'') => '\'',
            _ => return Err(error("unrecognised escape char", line, column)),
        };
        Ok(c)
    }

    fn scan_operator(&mut self, line: u32, column: u32) -> Result<TokenKind, LexError> {
        let operators = [
            ("::", TokenKind::ColonColon),
            ("<-", TokenKind::NewSlot),
            ("+=", TokenKind::PlusAssign),
            ("-=", TokenKind::MinusAssign),
            ("*=", TokenKind::StarAssign),
            ("/=", TokenKind::SlashAssign),
            ("++", TokenKind::PlusPlus),
            ("--", TokenKind::MinusMinus),
            ("==", TokenKind::Equal),
            ("!=", TokenKind::NotEqual),
            ("<=", TokenKind::LessEqual),
            (">=", TokenKind::GreaterEqual),
            ("&&", TokenKind::AndAnd),
            ("||", TokenKind::OrOr),
            ("(", TokenKind::LeftParen),
            (")", TokenKind::RightParen),
            ("{", TokenKind::LeftBrace),
            ("}", TokenKind::RightBrace),
            ("[", TokenKind::LeftBracket),
            ("]", TokenKind::RightBracket),
            (",", TokenKind::Comma),
            (";", TokenKind::Semicolon),
            (":", TokenKind::Colon),
            (".", TokenKind::Dot),
            ("?", TokenKind::Question),
            ("=", TokenKind::Assign),
            ("+", TokenKind::Plus),
            ("-", TokenKind::Minus),
            ("*", TokenKind::Star),
            ("/", TokenKind::Slash),
            ("%", TokenKind::Percent),
            ("<", TokenKind::Less),
            (">", TokenKind::Greater),
            ("!", TokenKind::Bang),
        ];

        for (text, kind) in operators {
            if self.cursor.eat_str(text) {
                return Ok(kind);
            }
        }
        let c = self.cursor.peek().unwrap_or('?');
        Err(error(format!("unexpected character '{}'", c), line, column))
    }
}

fn error(message: impl Into<String>, line: u32, column: u32) -> LexError {
    LexError {
        message: message.into(),
        line,
        column,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<TokenKind> {
        tokenize(source).unwrap().into_iter().map(|t| t.kind).collect()
    }

    #[test]
    fn scans_keywords_and_identifiers() {
        assert_eq!(
            kinds("local foo = this"),
            vec![
                TokenKind::Local,
                TokenKind::Identifier,
                TokenKind::Assign,
                TokenKind::This,
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn scans_numbers() {
        assert_eq!(kinds("42")[0], TokenKind::Integer(42));
        assert_eq!(kinds("1.5")[0], TokenKind::Float(1.5));
        assert_eq!(kinds("0x10")[0], TokenKind::Integer(16));
        assert_eq!(kinds("2e3")[0], TokenKind::Float(2000.0));
        assert_eq!(kinds("'a'")[0], TokenKind::Integer(97));
    }

    #[test]
    fn scans_strings_with_escapes() {
        assert_eq!(
            kinds(r#""a\n\"b""#)[0],
            TokenKind::String(Rc::from("a\n\"b"))
        );
    }

    #[test]
    fn longest_operator_wins() {
        assert_eq!(
            kinds("a <- ::b += 1"),
            vec![
                TokenKind::Identifier,
                TokenKind::NewSlot,
                TokenKind::ColonColon,
                TokenKind::Identifier,
                TokenKind::PlusAssign,
                TokenKind::Integer(1),
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn skips_comments() {
        assert_eq!(
            kinds("// line\n# hash\n/* block\n */ x"),
            vec![TokenKind::Identifier, TokenKind::Eof]
        );
    }

    #[test]
    fn reports_positions() {
        let tokens = tokenize("a\n  b").unwrap();
        assert_eq!((tokens[1].line, tokens[1].column), (2, 3));
        assert_eq!(tokens[1].lexeme, "b");
    }

    #[test]
    fn unfinished_string_is_an_error() {
        let err = tokenize("x = \"abc").unwrap_err();
        assert_eq!(err.message, "unfinished string");
        assert_eq!((err.line, err.column), (1, 5));
    }

    #[test]
    fn unknown_character_is_an_error() {
        let err = tokenize("a @ b").unwrap_err();
        assert_eq!(err.column, 3);
    }
}
