//! This library lexes and parses the line-oriented configuration format read
//! by Fluent Bit.
//!
//! The grammar is deliberately small: a file consists of an unnamed leading
//! section followed by `[Name]` sections, each containing `Key value` lines.
//! Values extend to the end of the line and are not tokenized any further,
//! which allows them to embed JSON documents.
//!
//! ```
//! let file = flb_config::parse(
//!     "outputs.conf",
//!     "\n[OUTPUT]\n    Name null\n    Match *\n",
//! )
//! .expect("valid Fluent Bit config");
//!
//! let output = file.sections_named("OUTPUT").next().unwrap();
//! assert_eq!(output.get("Match"), Some("*"));
//! ```
pub mod lexer;
mod parser;

pub use parser::*;
