//! Directive lines (`#@name arg "quoted arg"`).

use crate::error::DirectiveError;

/// The marker that turns a comment into a directive.
pub const DIRECTIVE_PREFIX: &str = "#@";

/// A parsed directive. Consumed by the interpreter, never sent to the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Directive {
    pub name: String,
    /// Everything after the name, untokenized.
    pub content: String,
    pub options: Vec<String>,
}

impl Directive {
    /// Parse a line that starts with [`DIRECTIVE_PREFIX`]. Returns `None`
    /// when the line is not a directive at all.
    pub fn parse(line: &str) -> Option<Result<Self, DirectiveError>> {
        let body = line
            .trim_end_matches(['\n', '\r'])
            .strip_prefix(DIRECTIVE_PREFIX)?;
        let (name, content) = match body.split_once(char::is_whitespace) {
            Some((name, rest)) => (name, rest.trim_start()),
            None => (body, ""),
        };
        Some(split_shell_words(content).map(|options| Self {
            name: name.to_string(),
            content: content.to_string(),
            options,
        }))
    }

    pub fn option(&self, index: usize) -> Option<&str> {
        self.options.get(index).map(String::as_str)
    }
}

/// Split shell-style: single quotes are literal, double quotes honour
/// backslash escapes, a backslash outside quotes escapes the next char.
pub fn split_shell_words(input: &str) -> Result<Vec<String>, DirectiveError> {
    #[derive(PartialEq)]
    enum State {
        Between,
        Word,
        Single,
        Double,
    }

    let mut words = Vec::new();
    let mut word = String::new();
    let mut state = State::Between;
    let mut chars = input.chars();

    while let Some(c) = chars.next() {
        match state {
            State::Between | State::Word => match c {
                c if c.is_whitespace() => {
                    if state == State::Word {
                        words.push(std::mem::take(&mut word));
                        state = State::Between;
                    }
                }
                '\'' => state = State::Single,
                '"' => state = State::Double,
                '\\' => {
                    if let Some(escaped) = chars.next() {
                        word.push(escaped);
                    }
                    state = State::Word;
                }
                c => {
                    word.push(c);
                    state = State::Word;
                }
            },
            State::Single => match c {
                '\'' => state = State::Word,
                c => word.push(c),
            },
            State::Double => match c {
                '"' => state = State::Word,
                '\\' => match chars.next() {
                    Some(escaped @ ('"' | '\\' | '$' | '`')) => word.push(escaped),
                    Some(other) => {
                        word.push('\\');
                        word.push(other);
                    }
                    None => return Err(DirectiveError::UnterminatedQuote(input.to_string())),
                },
                c => word.push(c),
            },
        }
    }

    match state {
        State::Single | State::Double => Err(DirectiveError::UnterminatedQuote(input.to_string())),
        State::Word => {
            words.push(word);
            Ok(words)
        }
        State::Between => Ok(words),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
