use std::collections::BTreeMap;
use std::path::PathBuf;
use std::rc::Rc;
use std::str::Chars;

use itertools::{PeekNth, peek_nth};
use once_cell::sync::Lazy;
use strum::EnumString;

use crate::{
    diagnostics::{CompileError, Location, Result},
    frontend::SourceFile,
};

#[derive(Debug, Clone)]
pub struct Token {
    pub kind: TokenKind,
    pub lexeme: String,
    pub loc: Location,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    /* Words */
    Keyword(Keyword), // int
    Identifier,       // main

    /* Literals */
    IntLiteral,  // 42, 42UL
    CharLiteral, // 'a'
    StrLiteral,  // "hello, world"

    /* Delimiters */
    OpenParen,    // (
    CloseParen,   // )
    OpenBracket,  // [
    CloseBracket, // ]
    OpenBrace,    // {
    CloseBrace,   // }
    Semicolon,    // ;
    Comma,        // ,

    /* Member access */
    Dot,   // .
    Arrow, // ->

    /* Unary + binary ops */
    Ampersand, // &
    Asterisk,  // *
    Minus,     // -

    /* Binary ops */
    Plus,                 // +
    Divide,               // /
    Modulus,              // %
    LogicalAnd,           // &&
    LogicalOr,            // ||
    DoubleEquals,         // ==
    NotEquals,            // !=
    LessThan,             // <
    LessThanOrEqualTo,    // <=
    GreaterThan,          // >
    GreaterThanOrEqualTo, // >=

    /* Assignment */
    Equals, // =
}

impl TokenKind {
    pub fn is_comparison_operator(&self) -> bool {
        matches!(
            self,
            Self::DoubleEquals
                | Self::NotEquals
                | Self::LessThan
                | Self::LessThanOrEqualTo
                | Self::GreaterThan
                | Self::GreaterThanOrEqualTo
        )
    }

    pub fn is_term_operator(&self) -> bool {
        matches!(self, Self::Plus | Self::Minus)
    }

    pub fn is_factor_operator(&self) -> bool {
        matches!(self, Self::Asterisk | Self::Divide | Self::Modulus)
    }

    pub fn is_unary_operator(&self) -> bool {
        matches!(self, Self::Ampersand | Self::Asterisk | Self::Minus)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum Keyword {
    Char,
    Short,
    Int,
    Long,
    Signed,
    Unsigned,
    Void,
    Const,
    Volatile,
    Struct,
    Union,
    If,
    Else,
    While,
    Do,
    For,
    Return,
}

impl Keyword {
    pub fn is_type_specifier(self) -> bool {
        matches!(
            self,
            Self::Char
                | Self::Short
                | Self::Int
                | Self::Long
                | Self::Signed
                | Self::Unsigned
                | Self::Void
                | Self::Const
                | Self::Volatile
        )
    }
}

/// Table of single char tokens (matched after longer sequences are checked for)
static SINGLE_TOKENS: Lazy<BTreeMap<char, TokenKind>> = Lazy::new(|| {
    BTreeMap::from([
        ('(', TokenKind::OpenParen),
        (')', TokenKind::CloseParen),
        ('[', TokenKind::OpenBracket),
        (']', TokenKind::CloseBracket),
        ('{', TokenKind::OpenBrace),
        ('}', TokenKind::CloseBrace),
        (';', TokenKind::Semicolon),
        (',', TokenKind::Comma),
        ('.', TokenKind::Dot),
        ('&', TokenKind::Ampersand),
        ('*', TokenKind::Asterisk),
        ('-', TokenKind::Minus),
        ('+', TokenKind::Plus),
        ('/', TokenKind::Divide),
        ('%', TokenKind::Modulus),
        ('=', TokenKind::Equals),
        ('<', TokenKind::LessThan),
        ('>', TokenKind::GreaterThan),
    ])
});

#[derive(Debug)]
pub struct Lexer<'source> {
    chars: PeekNth<Chars<'source>>,
    file: Rc<PathBuf>,
    line: u32,
    col: u32,
}

impl<'source> Lexer<'source> {
    pub fn new(source: &'source SourceFile) -> Self {
        Self {
            chars: peek_nth(source.contents.chars()),
            file: Rc::new(source.origin.as_path()),
            line: 1,
            col: 1,
        }
    }

    /// Scan the whole input. The parser takes the token vector; `-l` prints it.
    pub fn scan_all(source: &'source SourceFile) -> Result<Vec<Token>> {
        let mut lexer = Self::new(source);
        let mut tokens = Vec::new();
        while let Some(token) = lexer.next_token()? {
            tokens.push(token);
        }
        Ok(tokens)
    }

    fn location(&self) -> Location {
        Location::new(self.file.clone(), self.line, self.col)
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.chars.next()?;
        if c == '\n' {
            self.line += 1;
            self.col = 1;
        } else {
            self.col += 1;
        }
        Some(c)
    }

    fn peek(&mut self) -> Option<char> {
        self.chars.peek().copied()
    }

    fn peek_second(&mut self) -> Option<char> {
        self.chars.peek_nth(1).copied()
    }

    fn eat(&mut self, expected: char) -> bool {
        if self.peek() == Some(expected) {
            self.bump();
            true
        } else {
            false
        }
    }

    fn skip_whitespace_and_comments(&mut self) -> Result<()> {
        loop {
            match self.peek() {
                Some(c) if c.is_whitespace() => {
                    self.bump();
                }
                Some('/') if self.peek_second() == Some('/') => {
                    while let Some(c) = self.bump() {
                        if c == '\n' {
                            break;
                        }
                    }
                }
                Some('/') if self.peek_second() == Some('*') => {
                    let start = self.location();
                    self.bump();
                    self.bump();
                    loop {
                        match self.bump() {
                            Some('*') if self.peek() == Some('/') => {
                                self.bump();
                                break;
                            }
                            Some(_) => {}
                            None => {
                                return Err(CompileError::syntax(start, "unterminated comment"));
                            }
                        }
                    }
                }
                _ => return Ok(()),
            }
        }
    }

    pub fn next_token(&mut self) -> Result<Option<Token>> {
        self.skip_whitespace_and_comments()?;

        let loc = self.location();
        let Some(c) = self.peek() else {
            return Ok(None);
        };

        let token = |kind, lexeme: &str| Token {
            kind,
            lexeme: lexeme.to_owned(),
            loc: loc.clone(),
        };

        if c.is_ascii_alphabetic() || c == '_' {
            return Ok(Some(self.scan_word(loc)));
        }
        if c.is_ascii_digit() {
            return Ok(Some(self.scan_int_literal(loc)));
        }
        if c == '\'' {
            return self.scan_char_literal(loc).map(Some);
        }
        if c == '"' {
            return self.scan_str_literal(loc).map(Some);
        }

        /* Multi-character operators before the single-character table */

        self.bump();
        let kind = match (c, self.peek()) {
            ('-', Some('>')) => {
                self.bump();
                return Ok(Some(token(TokenKind::Arrow, "->")));
            }
            ('<', Some('=')) => {
                self.bump();
                return Ok(Some(token(TokenKind::LessThanOrEqualTo, "<=")));
            }
            ('>', Some('=')) => {
                self.bump();
                return Ok(Some(token(TokenKind::GreaterThanOrEqualTo, ">=")));
            }
            ('=', Some('=')) => {
                self.bump();
                return Ok(Some(token(TokenKind::DoubleEquals, "==")));
            }
            ('!', Some('=')) => {
                self.bump();
                return Ok(Some(token(TokenKind::NotEquals, "!=")));
            }
            ('&', Some('&')) => {
                self.bump();
                return Ok(Some(token(TokenKind::LogicalAnd, "&&")));
            }
            ('|', Some('|')) => {
                self.bump();
                return Ok(Some(token(TokenKind::LogicalOr, "||")));
            }
            _ => SINGLE_TOKENS.get(&c).copied(),
        };

        match kind {
            Some(kind) => Ok(Some(token(kind, &c.to_string()))),
            None => Err(CompileError::syntax(
                loc,
                format!("unexpected character '{c}'"),
            )),
        }
    }

    fn scan_word(&mut self, loc: Location) -> Token {
        let mut lexeme = String::new();
        while let Some(c) = self.peek() {
            if c.is_ascii_alphanumeric() || c == '_' {
                lexeme.push(c);
                self.bump();
            } else {
                break;
            }
        }

        let kind = match lexeme.parse::<Keyword>() {
            Ok(keyword) => TokenKind::Keyword(keyword),
            Err(_) => TokenKind::Identifier,
        };

        Token { kind, lexeme, loc }
    }

    fn scan_int_literal(&mut self, loc: Location) -> Token {
        let mut lexeme = String::new();
        while let Some(c) = self.peek() {
            if c.is_ascii_digit() {
                lexeme.push(c);
                self.bump();
            } else {
                break;
            }
        }

        // optional U/L suffixes in either order
        while let Some(c) = self.peek() {
            if matches!(c, 'u' | 'U' | 'l' | 'L') {
                lexeme.push(c);
                self.bump();
            } else {
                break;
            }
        }

        Token {
            kind: TokenKind::IntLiteral,
            lexeme,
            loc,
        }
    }

    fn scan_escape(&mut self, loc: &Location) -> Result<char> {
        match self.bump() {
            Some('n') => Ok('\n'),
            Some('t') => Ok('\t'),
            Some('r') => Ok('\r'),
            Some('0') => Ok('\0'),
            Some('\'') => Ok('\''),
            Some('"') => Ok('"'),
            Some('\\') => Ok('\\'),
            Some(c) => Err(CompileError::syntax(
                loc.clone(),
                format!("unknown escape sequence '\\{c}'"),
            )),
            None => Err(CompileError::syntax(
                loc.clone(),
                "unterminated escape sequence",
            )),
        }
    }

    fn scan_char_literal(&mut self, loc: Location) -> Result<Token> {
        self.bump(); // opening quote

        let c = match self.bump() {
            Some('\\') => self.scan_escape(&loc)?,
            Some('\'') | None => {
                return Err(CompileError::syntax(loc, "empty character literal"));
            }
            Some(c) => c,
        };

        if !self.eat('\'') {
            return Err(CompileError::syntax(loc, "unterminated character literal"));
        }

        Ok(Token {
            kind: TokenKind::CharLiteral,
            lexeme: c.to_string(),
            loc,
        })
    }

    fn scan_str_literal(&mut self, loc: Location) -> Result<Token> {
        self.bump(); // opening quote

        let mut lexeme = String::new();
        loop {
            match self.bump() {
                Some('"') => break,
                Some('\\') => lexeme.push(self.scan_escape(&loc)?),
                Some('\n') | None => {
                    return Err(CompileError::syntax(loc, "unterminated string literal"));
                }
                Some(c) => lexeme.push(c),
            }
        }

        Ok(Token {
            kind: TokenKind::StrLiteral,
            lexeme,
            loc,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frontend::SourceFileOrigin;

    fn lex(source: &str) -> Vec<Token> {
        let source = SourceFile {
            contents: source.to_owned(),
            origin: SourceFileOrigin::Memory,
        };
        Lexer::scan_all(&source).unwrap()
    }

    #[test]
    fn keywords_and_identifiers() {
        let tokens = lex("int main intx");
        assert_eq!(tokens[0].kind, TokenKind::Keyword(Keyword::Int));
        assert_eq!(tokens[1].kind, TokenKind::Identifier);
        assert_eq!(tokens[1].lexeme, "main");
        assert_eq!(tokens[2].kind, TokenKind::Identifier);
    }

    #[test]
    fn multi_char_operators_win_over_single() {
        let kinds: Vec<_> = lex("-> <= >= == != && || < = -")
            .into_iter()
            .map(|t| t.kind)
            .collect();
        assert_eq!(
            kinds,
            vec![
                TokenKind::Arrow,
                TokenKind::LessThanOrEqualTo,
                TokenKind::GreaterThanOrEqualTo,
                TokenKind::DoubleEquals,
                TokenKind::NotEquals,
                TokenKind::LogicalAnd,
                TokenKind::LogicalOr,
                TokenKind::LessThan,
                TokenKind::Equals,
                TokenKind::Minus,
            ]
        );
    }

    #[test]
    fn int_literal_suffixes() {
        let tokens = lex("42 42UL 7l");
        assert_eq!(tokens[0].lexeme, "42");
        assert_eq!(tokens[1].lexeme, "42UL");
        assert_eq!(tokens[2].lexeme, "7l");
        assert!(tokens.iter().all(|t| t.kind == TokenKind::IntLiteral));
    }

    #[test]
    fn char_and_string_escapes() {
        let tokens = lex(r#"'a' '\n' "hi\tthere""#);
        assert_eq!(tokens[0].lexeme, "a");
        assert_eq!(tokens[1].lexeme, "\n");
        assert_eq!(tokens[2].lexeme, "hi\tthere");
    }

    #[test]
    fn comments_are_skipped() {
        let tokens = lex("int /* a\nb */ x; // trailing\nreturn");
        let kinds: Vec<_> = tokens.iter().map(|t| t.kind).collect();
        assert_eq!(
            kinds,
            vec![
                TokenKind::Keyword(Keyword::Int),
                TokenKind::Identifier,
                TokenKind::Semicolon,
                TokenKind::Keyword(Keyword::Return),
            ]
        );
    }

    #[test]
    fn locations_track_lines_and_columns() {
        let tokens = lex("int\n  x;");
        assert_eq!((tokens[0].loc.line, tokens[0].loc.col), (1, 1));
        assert_eq!((tokens[1].loc.line, tokens[1].loc.col), (2, 3));
    }

    #[test]
    fn unknown_character_is_a_syntax_error() {
        let source = SourceFile {
            contents: "int @".to_owned(),
            origin: SourceFileOrigin::Memory,
        };
        assert!(Lexer::scan_all(&source).is_err());
    }
}
