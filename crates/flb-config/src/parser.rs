use snafu::Snafu;

use crate::lexer::{TokenKind, lex};

type Result<T, E = ParseError> = std::result::Result<T, E>;

/// Structural violations encountered while parsing. Parsing never recovers,
/// the first violation aborts.
#[derive(Debug, PartialEq, Eq, Snafu)]
pub enum ParseError {
    #[snafu(display("failed to tokenize input: {message}"))]
    Lex { message: String },

    #[snafu(display("newline required after section header"))]
    NewlineRequired,

    #[snafu(display("unexpected EOF"))]
    UnexpectedEof,

    #[snafu(display("unexpected newline"))]
    UnexpectedNewline,

    #[snafu(display("unexpected left bracket"))]
    UnexpectedLeftBracket,

    #[snafu(display("unexpected section"))]
    UnexpectedSection,

    #[snafu(display("unexpected right bracket"))]
    UnexpectedRightBracket,

    #[snafu(display("unexpected key"))]
    UnexpectedKey,

    #[snafu(display("unexpected value"))]
    UnexpectedValue,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: String,
}

impl KeyValue {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// A `[Name]` block and its key/value pairs in file order. The leading
/// section of a [`File`] has an empty name.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Section {
    pub name: String,
    pub key_values: Vec<KeyValue>,
}

impl Section {
    pub fn new(name: impl Into<String>, key_values: Vec<KeyValue>) -> Self {
        Self {
            name: name.into(),
            key_values,
        }
    }

    /// Returns the value of the first pair with the given `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.key_values
            .iter()
            .find(|kv| kv.key == key)
            .map(|kv| kv.value.as_str())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct File {
    pub name: String,
    pub sections: Vec<Section>,
}

impl File {
    /// Iterates over all sections with the given `name`, in file order.
    pub fn sections_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Section> {
        self.sections.iter().filter(move |s| s.name == name)
    }
}

/// Parses `input` into a [`File`] called `name`.
///
/// Everything before the first section header ends up in an unnamed leading
/// section, which is always present, even for empty input.
///
/// ```
/// use flb_config::{parse, KeyValue, Section};
///
/// let file = parse("outputs.conf", "\n[OUTPUT]\n    Name null\n").unwrap();
/// assert_eq!(file.sections, vec![
///     Section::default(),
///     Section::new("OUTPUT", vec![KeyValue::new("Name", "null")]),
/// ]);
/// ```
pub fn parse(name: &str, input: &str) -> Result<File> {
    let mut file = File {
        name: name.to_owned(),
        sections: Vec::new(),
    };

    let mut require_newline = false;
    let mut processing_section = false;
    let mut processing_kv = false;
    let mut section = Section::default();
    let mut key = String::new();

    for token in lex(input) {
        if require_newline {
            if token.kind != TokenKind::NewLine {
                return NewlineRequiredSnafu.fail();
            }
            require_newline = false;
            continue;
        }

        match token.kind {
            TokenKind::Error => return LexSnafu { message: token.value }.fail(),
            TokenKind::Eof => {
                if processing_kv || processing_section {
                    return UnexpectedEofSnafu.fail();
                }
                file.sections.push(section);
                return Ok(file);
            }
            TokenKind::NewLine => {
                if processing_kv || processing_section {
                    return UnexpectedNewlineSnafu.fail();
                }
            }
            TokenKind::LeftBracket => {
                if processing_kv || processing_section {
                    return UnexpectedLeftBracketSnafu.fail();
                }
                file.sections.push(std::mem::take(&mut section));
                processing_section = true;
            }
            TokenKind::Section => {
                if !processing_section {
                    return UnexpectedSectionSnafu.fail();
                }
                section.name = token.value;
            }
            TokenKind::RightBracket => {
                if !processing_section {
                    return UnexpectedRightBracketSnafu.fail();
                }
                processing_section = false;
                require_newline = true;
            }
            TokenKind::Key => {
                if processing_kv || processing_section {
                    return UnexpectedKeySnafu.fail();
                }
                processing_kv = true;
                key = token.value;
            }
            TokenKind::Value => {
                if !processing_kv {
                    return UnexpectedValueSnafu.fail();
                }
                section
                    .key_values
                    .push(KeyValue::new(std::mem::take(&mut key), token.value));
                processing_kv = false;
            }
        }
    }

    // The lexer always terminates with either an Eof or an Error token.
    UnexpectedEofSnafu.fail()
}
