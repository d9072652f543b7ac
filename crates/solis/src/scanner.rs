//! Scanner
//!
//! Turns source bytes into a buffered token list. Newlines are
//! significant: every line boundary produces a `Line` token and the parser
//! treats one-or-more of them as a statement terminator. `--` starts a
//! comment that runs to the end of the line. Bad input (unterminated
//! strings, unexpected characters) becomes an `Error` token whose lexeme
//! is the diagnostic message, surfaced by the parser at the point of use.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    Identifier,

    LeftParen,
    RightParen,
    LeftBracket,
    RightBracket,
    LeftBrace,
    RightBrace,

    Plus,
    Minus,
    Star,
    StarStar,
    Slash,
    SlashSlash,

    Dot,
    DotDot,
    Comma,

    Eq,
    EqEq,
    Lt,
    Gt,
    LtEq,
    GtEq,

    Bang,
    BangEq,

    Semicolon,
    Line,

    Var,
    Function,
    Class,
    Inherits,
    Static,
    SelfKw,
    Enum,

    If,
    Then,
    Else,
    End,
    While,
    Do,
    For,
    In,
    Break,
    Return,

    And,
    Or,
    Is,

    Null,
    True,
    False,

    Number,
    Str,

    Eof,
    Error,
}

#[derive(Debug, Clone)]
pub struct Token {
    pub kind: TokenKind,
    pub lexeme: String,
    pub line: u32,
}

impl Token {
    fn new(kind: TokenKind, lexeme: &str, line: u32) -> Token {
        Token {
            kind,
            lexeme: lexeme.to_string(),
            line,
        }
    }
}

// Keyword table; checked after an identifier is scanned.
const KEYWORDS: &[(&str, TokenKind)] = &[
    ("var", TokenKind::Var),
    ("function", TokenKind::Function),
    ("class", TokenKind::Class),
    ("inherits", TokenKind::Inherits),
    ("static", TokenKind::Static),
    ("self", TokenKind::SelfKw),
    ("enum", TokenKind::Enum),
    ("if", TokenKind::If),
    ("then", TokenKind::Then),
    ("else", TokenKind::Else),
    ("end", TokenKind::End),
    ("while", TokenKind::While),
    ("do", TokenKind::Do),
    ("for", TokenKind::For),
    ("in", TokenKind::In),
    ("break", TokenKind::Break),
    ("return", TokenKind::Return),
    ("and", TokenKind::And),
    ("or", TokenKind::Or),
    ("is", TokenKind::Is),
    ("null", TokenKind::Null),
    ("true", TokenKind::True),
    ("false", TokenKind::False),
];

struct Scanner<'s> {
    source: &'s [u8],
    start: usize,
    current: usize,
    line: u32,
}

fn is_name(c: u8) -> bool {
    c.is_ascii_alphabetic() || c == b'_'
}

impl<'s> Scanner<'s> {
    fn new(source: &'s str) -> Scanner<'s> {
        Scanner {
            source: source.as_bytes(),
            start: 0,
            current: 0,
            line: 1,
        }
    }

    fn is_at_end(&self) -> bool {
        self.current >= self.source.len()
    }

    fn advance(&mut self) -> u8 {
        self.current += 1;
        self.source[self.current - 1]
    }

    fn peek(&self) -> u8 {
        if self.is_at_end() {
            0
        } else {
            self.source[self.current]
        }
    }

    fn peek_next(&self) -> u8 {
        if self.current + 1 >= self.source.len() {
            0
        } else {
            self.source[self.current + 1]
        }
    }

    fn matches(&mut self, expected: u8) -> bool {
        if self.peek() != expected {
            return false;
        }
        self.current += 1;
        true
    }

    fn lexeme(&self) -> &'s str {
        // Token boundaries always fall on ASCII; the slice stays valid
        // UTF-8 because multi-byte sequences only occur inside strings.
        std::str::from_utf8(&self.source[self.start..self.current]).unwrap_or("")
    }

    fn make_token(&self, kind: TokenKind) -> Token {
        Token::new(kind, self.lexeme(), self.line)
    }

    fn error_token(&self, message: &str) -> Token {
        Token::new(TokenKind::Error, message, self.line)
    }

    /// Skip spaces, tabs, carriage returns and `--` comments. Newlines are
    /// not whitespace here; they become tokens.
    fn skip_whitespace(&mut self) {
        loop {
            match self.peek() {
                b' ' | b'\r' | b'\t' => {
                    self.advance();
                }
                b'-' if self.peek_next() == b'-' => {
                    while self.peek() != b'\n' && !self.is_at_end() {
                        self.advance();
                    }
                }
                _ => return,
            }
        }
    }

    fn string(&mut self) -> Token {
        while self.peek() != b'"' && !self.is_at_end() {
            if self.peek() == b'\n' {
                self.line += 1;
            }
            self.advance();
        }

        if self.is_at_end() {
            return self.error_token("Unterminated string.");
        }

        self.advance(); // closing quote
        self.make_token(TokenKind::Str)
    }

    fn number(&mut self) -> Token {
        while self.peek().is_ascii_digit() {
            self.advance();
        }

        // A fractional part, but not the start of a `..` range.
        if self.peek() == b'.' && self.peek_next().is_ascii_digit() {
            self.advance();
            while self.peek().is_ascii_digit() {
                self.advance();
            }
        }

        self.make_token(TokenKind::Number)
    }

    fn identifier(&mut self) -> Token {
        while is_name(self.peek()) || self.peek().is_ascii_digit() {
            self.advance();
        }

        let text = self.lexeme();
        for (word, kind) in KEYWORDS {
            if *word == text {
                return self.make_token(*kind);
            }
        }
        self.make_token(TokenKind::Identifier)
    }

    fn scan_token(&mut self) -> Token {
        self.skip_whitespace();
        self.start = self.current;

        if self.is_at_end() {
            return self.make_token(TokenKind::Eof);
        }

        let c = self.advance();

        if c == b'\n' {
            let token = Token::new(TokenKind::Line, "\\n", self.line);
            self.line += 1;
            return token;
        }

        if c.is_ascii_digit() {
            return self.number();
        }
        if is_name(c) {
            return self.identifier();
        }

        match c {
            b'(' => self.make_token(TokenKind::LeftParen),
            b')' => self.make_token(TokenKind::RightParen),
            b'[' => self.make_token(TokenKind::LeftBracket),
            b']' => self.make_token(TokenKind::RightBracket),
            b'{' => self.make_token(TokenKind::LeftBrace),
            b'}' => self.make_token(TokenKind::RightBrace),
            b'+' => self.make_token(TokenKind::Plus),
            b'-' => self.make_token(TokenKind::Minus),
            b'*' => {
                let kind = if self.matches(b'*') {
                    TokenKind::StarStar
                } else {
                    TokenKind::Star
                };
                self.make_token(kind)
            }
            b'/' => {
                let kind = if self.matches(b'/') {
                    TokenKind::SlashSlash
                } else {
                    TokenKind::Slash
                };
                self.make_token(kind)
            }
            b'.' => {
                let kind = if self.matches(b'.') {
                    TokenKind::DotDot
                } else {
                    TokenKind::Dot
                };
                self.make_token(kind)
            }
            b',' => self.make_token(TokenKind::Comma),
            b'!' => {
                let kind = if self.matches(b'=') {
                    TokenKind::BangEq
                } else {
                    TokenKind::Bang
                };
                self.make_token(kind)
            }
            b'=' => {
                let kind = if self.matches(b'=') {
                    TokenKind::EqEq
                } else {
                    TokenKind::Eq
                };
                self.make_token(kind)
            }
            b'<' => {
                let kind = if self.matches(b'=') {
                    TokenKind::LtEq
                } else {
                    TokenKind::Lt
                };
                self.make_token(kind)
            }
            b'>' => {
                let kind = if self.matches(b'=') {
                    TokenKind::GtEq
                } else {
                    TokenKind::Gt
                };
                self.make_token(kind)
            }
            b';' => self.make_token(TokenKind::Semicolon),
            b'"' => self.string(),
            _ => self.error_token("Unexpected character."),
        }
    }
}

/// Scan the whole source into a token list ending with `Eof`.
pub fn scan_source(source: &str) -> Vec<Token> {
    let mut scanner = Scanner::new(source);
    let mut tokens = Vec::new();

    loop {
        let token = scanner.scan_token();
        let done = token.kind == TokenKind::Eof;
        tokens.push(token);
        if done {
            return tokens;
        }
    }
}
