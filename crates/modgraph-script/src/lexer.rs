//! Lexer for module script source text.
//!
//! Built on logos. Produces a flat token vector with byte spans; line and
//! column information is recovered on demand through [`LineIndex`].

use logos::Logos;
use thiserror::Error;

/// Byte range of a token in the source text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Span {
    /// Start byte offset (inclusive)
    pub start: usize,
    /// End byte offset (exclusive)
    pub end: usize,
}

impl Span {
    /// Create a new span
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }
}

/// Errors produced while tokenizing
#[derive(Debug, Error, Clone, PartialEq)]
pub enum LexError {
    /// A character sequence that starts no token
    #[error("Unexpected character {text:?}")]
    UnexpectedCharacter { text: String, span: Span },

    /// String literal without closing quote
    #[error("Unterminated string literal")]
    UnterminatedString { span: Span },
}

impl LexError {
    /// Span of the offending input
    pub fn span(&self) -> Span {
        match self {
            LexError::UnexpectedCharacter { span, .. } | LexError::UnterminatedString { span } => {
                *span
            }
        }
    }
}

/// Tokens of the module script language.
#[derive(Logos, Debug, Clone, PartialEq)]
#[logos(skip r"[ \t\r\n\f]+")]
#[logos(skip r"//[^\n]*")]
pub enum Token {
    #[regex(r"/\*", lex_block_comment)]
    BlockComment,

    // Keywords (must come before identifiers)
    #[token("import")]
    Import,
    #[token("export")]
    Export,
    #[token("from")]
    From,
    #[token("as")]
    As,
    #[token("default")]
    Default,
    #[token("const")]
    Const,
    #[token("let")]
    Let,
    #[token("function")]
    Function,
    #[token("return")]
    Return,
    #[token("if")]
    If,
    #[token("else")]
    Else,
    #[token("while")]
    While,
    #[token("throw")]
    Throw,
    #[token("new")]
    New,
    #[token("typeof")]
    Typeof,
    #[token("true")]
    True,
    #[token("false")]
    False,
    #[token("null")]
    Null,
    #[token("undefined")]
    Undefined,

    #[regex(r"[a-zA-Z_$][a-zA-Z0-9_$]*", |lex| lex.slice().to_string())]
    Identifier(String),

    #[regex(r"0x[0-9a-fA-F]+", parse_hex)]
    #[regex(r"[0-9]+(\.[0-9]+)?([eE][+-]?[0-9]+)?", parse_number)]
    #[regex(r"\.[0-9]+([eE][+-]?[0-9]+)?", parse_number)]
    Number(f64),

    #[regex(r#""([^"\\\n]|\\.)*""#, parse_string)]
    #[regex(r"'([^'\\\n]|\\.)*'", parse_string)]
    String(String),

    // Operators (longer tokens win in logos)
    #[token("===")]
    EqualEqualEqual,
    #[token("!==")]
    BangEqualEqual,
    #[token("==")]
    EqualEqual,
    #[token("!=")]
    BangEqual,
    #[token("<=")]
    LessEqual,
    #[token(">=")]
    GreaterEqual,
    #[token("&&")]
    AmpAmp,
    #[token("||")]
    PipePipe,
    #[token("+")]
    Plus,
    #[token("-")]
    Minus,
    #[token("*")]
    Star,
    #[token("/")]
    Slash,
    #[token("%")]
    Percent,
    #[token("!")]
    Bang,
    #[token("<")]
    Less,
    #[token(">")]
    Greater,
    #[token("=")]
    Equal,
    #[token(".")]
    Dot,
    #[token(":")]
    Colon,
    #[token("(")]
    LeftParen,
    #[token(")")]
    RightParen,
    #[token("{")]
    LeftBrace,
    #[token("}")]
    RightBrace,
    #[token("[")]
    LeftBracket,
    #[token("]")]
    RightBracket,
    #[token(";")]
    Semicolon,
    #[token(",")]
    Comma,
}

impl Token {
    /// Identifier text, also accepting keywords, for positions where any
    /// IdentifierName is allowed (property names, export aliases).
    pub fn identifier_name(&self) -> Option<String> {
        let keyword = match self {
            Token::Identifier(name) => return Some(name.clone()),
            Token::Import => "import",
            Token::Export => "export",
            Token::From => "from",
            Token::As => "as",
            Token::Default => "default",
            Token::Const => "const",
            Token::Let => "let",
            Token::Function => "function",
            Token::Return => "return",
            Token::If => "if",
            Token::Else => "else",
            Token::While => "while",
            Token::Throw => "throw",
            Token::New => "new",
            Token::Typeof => "typeof",
            Token::True => "true",
            Token::False => "false",
            Token::Null => "null",
            Token::Undefined => "undefined",
            _ => return None,
        };
        Some(keyword.to_string())
    }

    /// Human-readable description for diagnostics
    pub fn describe(&self) -> String {
        match self {
            Token::Identifier(name) => format!("identifier '{}'", name),
            Token::Number(n) => format!("number {}", n),
            Token::String(s) => format!("string {:?}", s),
            other => match other.identifier_name() {
                Some(keyword) => format!("keyword '{}'", keyword),
                None => format!("{:?}", other),
            },
        }
    }
}

fn lex_block_comment(lex: &mut logos::Lexer<Token>) -> logos::Skip {
    let remainder = lex.remainder();
    match remainder.find("*/") {
        Some(end) => lex.bump(end + 2),
        None => lex.bump(remainder.len()),
    }
    logos::Skip
}

fn parse_hex(lex: &mut logos::Lexer<Token>) -> Option<f64> {
    u64::from_str_radix(&lex.slice()[2..], 16).ok().map(|v| v as f64)
}

fn parse_number(lex: &mut logos::Lexer<Token>) -> Option<f64> {
    lex.slice().parse().ok()
}

fn parse_string(lex: &mut logos::Lexer<Token>) -> Option<String> {
    let s = lex.slice();
    Some(unescape_string(&s[1..s.len() - 1]))
}

fn unescape_string(s: &str) -> String {
    let mut result = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '\\' {
            result.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => result.push('\n'),
            Some('r') => result.push('\r'),
            Some('t') => result.push('\t'),
            Some('0') => result.push('\0'),
            Some('u') => {
                let mut hex = String::new();
                while hex.len() < 4 {
                    match chars.peek() {
                        Some(ch) if ch.is_ascii_hexdigit() => {
                            hex.push(*ch);
                            chars.next();
                        }
                        _ => break,
                    }
                }
                match u32::from_str_radix(&hex, 16).ok().and_then(char::from_u32) {
                    Some(ch) if hex.len() == 4 => result.push(ch),
                    _ => {
                        result.push_str("\\u");
                        result.push_str(&hex);
                    }
                }
            }
            Some(other) => result.push(other),
            None => result.push('\\'),
        }
    }

    result
}

/// Tokenize source text into `(token, span)` pairs.
pub fn tokenize(source: &str) -> Result<Vec<(Token, Span)>, LexError> {
    let mut lexer = Token::lexer(source);
    let mut tokens = Vec::new();

    while let Some(result) = lexer.next() {
        let range = lexer.span();
        let span = Span::new(range.start, range.end);
        match result {
            Ok(token) => tokens.push((token, span)),
            Err(()) => {
                let text = lexer.slice();
                if text.starts_with('"') || text.starts_with('\'') {
                    return Err(LexError::UnterminatedString { span });
                }
                return Err(LexError::UnexpectedCharacter {
                    text: text.to_string(),
                    span,
                });
            }
        }
    }

    Ok(tokens)
}

/// Maps byte offsets to 1-based line/column pairs.
#[derive(Debug, Clone, Default)]
pub struct LineIndex {
    line_starts: Vec<usize>,
}

impl LineIndex {
    /// Build the index for a source text
    pub fn new(source: &str) -> Self {
        let mut line_starts = vec![0];
        line_starts.extend(
            source
                .char_indices()
                .filter(|(_, c)| *c == '\n')
                .map(|(i, _)| i + 1),
        );
        Self { line_starts }
    }

    /// 1-based `(line, column)` of a byte offset
    pub fn line_col(&self, offset: usize) -> (usize, usize) {
        let line = match self.line_starts.binary_search(&offset) {
            Ok(line) => line,
            Err(next) => next - 1,
        };
        (line + 1, offset - self.line_starts[line] + 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<Token> {
        tokenize(source).unwrap().into_iter().map(|(t, _)| t).collect()
    }

    #[test]
    fn test_import_statement() {
        assert_eq!(
            kinds("import x from './x';"),
            vec![
                Token::Import,
                Token::Identifier("x".to_string()),
                Token::From,
                Token::String("./x".to_string()),
                Token::Semicolon,
            ]
        );
    }

    #[test]
    fn test_comments_are_skipped() {
        assert_eq!(
            kinds("/* block */ 1 // line\n2"),
            vec![Token::Number(1.0), Token::Number(2.0)]
        );
    }

    #[test]
    fn test_dollar_identifiers_and_strict_equality() {
        assert_eq!(
            kinds("$in0 === $out1"),
            vec![
                Token::Identifier("$in0".to_string()),
                Token::EqualEqualEqual,
                Token::Identifier("$out1".to_string()),
            ]
        );
    }

    #[test]
    fn test_string_escapes() {
        assert_eq!(
            kinds(r#""a\"b\n" 'it\'s'"#),
            vec![
                Token::String("a\"b\n".to_string()),
                Token::String("it's".to_string()),
            ]
        );
    }

    #[test]
    fn test_unexpected_character() {
        let err = tokenize("let x = #").unwrap_err();
        assert!(matches!(err, LexError::UnexpectedCharacter { .. }));
        assert_eq!(err.span(), Span::new(8, 9));
    }

    #[test]
    fn test_line_index() {
        let index = LineIndex::new("ab\ncd\n\nef");
        assert_eq!(index.line_col(0), (1, 1));
        assert_eq!(index.line_col(4), (2, 2));
        assert_eq!(index.line_col(7), (4, 1));
    }
}
