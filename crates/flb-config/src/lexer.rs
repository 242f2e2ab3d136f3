//! A hand-written scanner for the line-oriented Fluent Bit configuration
//! grammar.
//!
//! The lexer is a state machine: every state is a plain function which
//! consumes input, optionally emits tokens and returns the next state. Lexing
//! stops once a state returns [`None`], which happens after an [`TokenKind::Eof`]
//! or an [`TokenKind::Error`] token was emitted.

const TAB: char = '\t';
const SPACE: char = ' ';
const LEFT_BRACKET: char = '[';
const RIGHT_BRACKET: char = ']';
const NEW_LINE: char = '\n';

/// The different kinds of [`Token`]s the lexer produces.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TokenKind {
    /// Lexing failed, the token value contains the diagnostic.
    Error,

    /// The input was fully consumed.
    Eof,

    NewLine,
    LeftBracket,
    RightBracket,

    /// The name between `[` and `]`.
    Section,

    /// A bare key, consisting of letters, digits and dots.
    Key,

    /// Everything after the key (and its trailing whitespace) up to the next
    /// newline. Values are never tokenized any further.
    Value,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Token {
    pub kind: TokenKind,
    pub value: String,
}

impl Token {
    fn new(kind: TokenKind, value: impl Into<String>) -> Self {
        Self {
            kind,
            value: value.into(),
        }
    }
}

/// A lexer state, wrapping the function which processes it.
#[derive(Clone, Copy)]
struct State(fn(&mut Lexer<'_>) -> Option<State>);

/// Converts the `input` into a sequence of [`Token`]s.
///
/// The returned sequence always ends with either an [`TokenKind::Eof`] or a
/// single [`TokenKind::Error`] token.
///
/// ```
/// use flb_config::lexer::{lex, TokenKind};
///
/// let kinds: Vec<_> = lex("[OUTPUT]\n").into_iter().map(|t| t.kind).collect();
/// assert_eq!(kinds, vec![
///     TokenKind::LeftBracket,
///     TokenKind::Section,
///     TokenKind::RightBracket,
///     TokenKind::NewLine,
///     TokenKind::Eof,
/// ]);
/// ```
pub fn lex(input: &str) -> Vec<Token> {
    let mut lexer = Lexer::new(input);
    lexer.run();
    lexer.tokens
}

struct Lexer<'a> {
    input: &'a str,
    tokens: Vec<Token>,

    /// Byte offset where the currently processed token starts.
    start: usize,

    /// Byte offset of the next unprocessed char.
    pos: usize,
}

impl<'a> Lexer<'a> {
    fn new(input: &'a str) -> Self {
        Self {
            input,
            tokens: Vec::new(),
            start: 0,
            pos: 0,
        }
    }

    fn run(&mut self) {
        let mut state = Some(State(lex_start));
        while let Some(State(process)) = state {
            state = process(self);
        }
    }

    fn emit(&mut self, kind: TokenKind) {
        let value = &self.input[self.start..self.pos];
        self.tokens.push(Token::new(kind, value));
        self.start = self.pos;
    }

    fn error(&mut self, message: &str) -> Option<State> {
        self.tokens.push(Token::new(TokenKind::Error, message));
        None
    }

    /// Consumes the next char, returning it.
    fn next(&mut self) -> Option<char> {
        let next = self.peek()?;
        self.pos += next.len_utf8();
        Some(next)
    }

    fn peek(&self) -> Option<char> {
        self.input[self.pos..].chars().next()
    }

    /// Drops everything consumed so far from the current token.
    fn ignore(&mut self) {
        self.start = self.pos;
    }

    fn is_eof(&self) -> bool {
        self.pos >= self.input.len()
    }
}

fn is_alphanumeric(c: char) -> bool {
    c.is_alphabetic() || c.is_numeric()
}

fn lex_start(l: &mut Lexer<'_>) -> Option<State> {
    match l.peek() {
        None => Some(State(lex_eof)),
        Some(TAB | SPACE) => Some(State(lex_global_whitespace)),
        Some(NEW_LINE) => Some(State(lex_new_line)),
        Some(LEFT_BRACKET) => Some(State(lex_left_bracket)),
        Some(_) => Some(State(lex_key)),
    }
}

fn lex_eof(l: &mut Lexer<'_>) -> Option<State> {
    l.emit(TokenKind::Eof);
    None
}

fn lex_global_whitespace(l: &mut Lexer<'_>) -> Option<State> {
    l.next();
    l.ignore();
    Some(State(lex_start))
}

fn lex_key_whitespace(l: &mut Lexer<'_>) -> Option<State> {
    l.next();
    l.ignore();

    match l.peek() {
        Some(TAB | SPACE) => Some(State(lex_key_whitespace)),
        _ => Some(State(lex_value)),
    }
}

fn lex_new_line(l: &mut Lexer<'_>) -> Option<State> {
    l.next();
    l.emit(TokenKind::NewLine);
    Some(State(lex_start))
}

fn lex_left_bracket(l: &mut Lexer<'_>) -> Option<State> {
    l.next();
    l.emit(TokenKind::LeftBracket);
    Some(State(lex_section))
}

fn lex_section(l: &mut Lexer<'_>) -> Option<State> {
    loop {
        let next = match l.peek() {
            Some(next) => next,
            None => return l.error("unexpected EOF"),
        };

        if !is_alphanumeric(next) {
            return match next {
                RIGHT_BRACKET => {
                    l.emit(TokenKind::Section);
                    Some(State(lex_right_bracket))
                }
                _ => l.error("missing right bracket"),
            };
        }

        l.next();
    }
}

fn lex_right_bracket(l: &mut Lexer<'_>) -> Option<State> {
    l.next();
    l.emit(TokenKind::RightBracket);
    Some(State(lex_start))
}

fn lex_key(l: &mut Lexer<'_>) -> Option<State> {
    loop {
        let next = match l.peek() {
            Some(next) => next,
            None => return l.error("unexpected EOF"),
        };

        if !is_alphanumeric(next) && next != '.' {
            return match next {
                TAB | SPACE => {
                    l.emit(TokenKind::Key);
                    Some(State(lex_key_whitespace))
                }
                _ => l.error("invalid key"),
            };
        }

        l.next();
    }
}

fn lex_value(l: &mut Lexer<'_>) -> Option<State> {
    loop {
        if l.is_eof() {
            return l.error("unexpected EOF");
        }

        if l.peek() == Some(NEW_LINE) {
            l.emit(TokenKind::Value);
            return Some(State(lex_start));
        }

        l.next();
    }
}
