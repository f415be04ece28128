//! Server command model and grammar.
//!
//! Two source forms are accepted, matching what the server itself reads:
//!
//! - command-line form: `select Foo --filter 'n > 1'`
//! - URI form: `/d/select.json?table=Foo&filter=n%20%3E%201`
//!
//! The original source text is kept verbatim so the stdio transport can
//! echo it unchanged and the transcript can record exactly what the script
//! said. Only `load` commands grow after parsing, while their multi-line
//! value body is being collected.

use std::borrow::Cow;

use url::form_urlencoded;

use crate::error::CommandParseError;

/// Commands that get the long first-read timeout.
const SLOW_COMMANDS: &[&str] = &[
    "column_copy",
    "column_create",
    "column_remove",
    "column_rename",
    "io_flush",
    "load",
    "object_remove",
    "plugin_register",
    "plugin_unregister",
    "register",
    "reindex",
    "table_copy",
    "table_create",
    "table_remove",
    "table_rename",
    "truncate",
];

/// Positional parameter names for the commands scripts commonly write in
/// positional style. Needed to turn positional arguments into query
/// parameters for HTTP.
const POSITIONAL_PARAMETERS: &[(&str, &[&str])] = &[
    (
        "select",
        &[
            "table",
            "match_columns",
            "query",
            "filter",
            "scorer",
            "sortby",
            "output_columns",
            "offset",
            "limit",
            "drilldown",
            "drilldown_sortby",
            "drilldown_output_columns",
            "drilldown_offset",
            "drilldown_limit",
            "cache",
            "match_escalation_threshold",
            "query_expansion",
            "query_flags",
            "query_expander",
            "adjuster",
            "drilldown_calc_types",
            "drilldown_calc_target",
        ],
    ),
    ("load", &["values", "table", "columns", "ifexists", "input_type"]),
    (
        "table_create",
        &[
            "name",
            "flags",
            "key_type",
            "value_type",
            "default_tokenizer",
            "normalizer",
            "token_filters",
        ],
    ),
    ("column_create", &["table", "name", "flags", "type", "source"]),
    ("column_remove", &["table", "name"]),
    ("column_rename", &["table", "name", "new_name"]),
    ("column_list", &["table"]),
    ("table_remove", &["name", "dependent"]),
    ("table_rename", &["name", "new_name"]),
    ("delete", &["table", "key", "id", "filter"]),
    ("dump", &["tables"]),
    ("truncate", &["target_name"]),
    ("io_flush", &["target_name", "recursive"]),
    ("object_remove", &["name", "force"]),
    ("object_exist", &["name"]),
    ("plugin_register", &["name"]),
    ("plugin_unregister", &["name"]),
    ("register", &["path"]),
    ("log_level", &["level"]),
    ("log_put", &["level", "message"]),
    ("cache_limit", &["max"]),
    ("reindex", &["target_name"]),
    ("normalize", &["normalizer", "string", "flags"]),
    ("tokenize", &["tokenizer", "string", "normalizer", "flags", "mode"]),
];

/// One argument as written in the script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Argument {
    /// `None` for positional arguments.
    pub name: Option<String>,
    pub value: String,
}

/// A parsed script statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    name: String,
    arguments: Vec<Argument>,
    /// Script bytes as written, sent to the stdio interface unchanged.
    source: Vec<u8>,
    uri_form: bool,
}

impl Command {
    /// Parse one command line (either form). A trailing newline is not part
    /// of the command but is kept in the original source.
    pub fn parse(source: &str) -> Result<Self, CommandParseError> {
        Self::parse_bytes(source.as_bytes())
    }

    /// Parse raw script bytes. The grammar only looks at ASCII delimiters;
    /// bytes that are not UTF-8 reach argument values as U+FFFD but the
    /// source keeps them as read.
    pub fn parse_bytes(source: &[u8]) -> Result<Self, CommandParseError> {
        let text = String::from_utf8_lossy(source);
        let line = text.trim_end_matches(['\n', '\r']);
        let trimmed = line.trim_start();
        if trimmed.is_empty() {
            return Err(CommandParseError::Empty);
        }

        let (name, arguments, uri_form) = if trimmed.starts_with('/') {
            let (name, arguments) = parse_uri(trimmed)?;
            (name, arguments, true)
        } else {
            let (name, arguments) = parse_command_line(trimmed)?;
            (name, arguments, false)
        };

        Ok(Self {
            name,
            arguments,
            source: source.to_vec(),
            uri_form,
        })
    }

    /// Build a command programmatically. The source is rendered in
    /// command-line form.
    pub fn build(name: &str, arguments: &[(&str, &str)]) -> Self {
        let mut source = name.to_string();
        for (key, value) in arguments {
            source.push_str(&format!(" --{key} {}", quote_value(value)));
        }
        source.push('\n');
        Self {
            name: name.to_string(),
            arguments: arguments
                .iter()
                .map(|(key, value)| Argument {
                    name: Some((*key).to_string()),
                    value: (*value).to_string(),
                })
                .collect(),
            source: source.into_bytes(),
            uri_form: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn arguments(&self) -> &[Argument] {
        &self.arguments
    }

    /// The verbatim script bytes, including any collected load body.
    pub fn source(&self) -> &[u8] {
        &self.source
    }

    /// [`Command::source`] as text, for logs and messages.
    pub fn original_source(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.source)
    }

    pub fn is_uri_form(&self) -> bool {
        self.uri_form
    }

    pub fn is_load(&self) -> bool {
        self.name == "load"
    }

    /// Whether this command gets the long first-read timeout.
    pub fn may_slow(&self) -> bool {
        SLOW_COMMANDS.contains(&self.name.as_str())
    }

    /// Look up an argument by name, resolving positional arguments through
    /// the known parameter table.
    pub fn get(&self, name: &str) -> Option<&str> {
        if let Some(arg) = self
            .arguments
            .iter()
            .find(|arg| arg.name.as_deref() == Some(name))
        {
            return Some(arg.value.as_str());
        }
        let index = positional_parameters(&self.name)?
            .iter()
            .position(|param| *param == name)?;
        self.arguments
            .iter()
            .filter(|arg| arg.name.is_none())
            .nth(index)
            .map(|arg| arg.value.as_str())
    }

    pub fn has(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn output_type(&self) -> Option<&str> {
        self.get("output_type")
    }

    /// Set a named argument. The source text is extended accordingly so
    /// the stdio transport sends what the command model says.
    pub fn set_argument(&mut self, name: &str, value: &str) {
        if let Some(arg) = self
            .arguments
            .iter_mut()
            .find(|arg| arg.name.as_deref() == Some(name))
        {
            arg.value = value.to_string();
        } else {
            self.arguments.push(Argument {
                name: Some(name.to_string()),
                value: value.to_string(),
            });
        }
        let mut source = self.render_first_line().into_bytes();
        source.extend_from_slice(self.body_lines());
        self.source = source;
    }

    /// Remove a named argument, returning its value.
    pub fn remove_argument(&mut self, name: &str) -> Option<String> {
        let index = self
            .arguments
            .iter()
            .position(|arg| arg.name.as_deref() == Some(name))?;
        Some(self.arguments.remove(index).value)
    }

    /// Append one raw line of a multi-line load body.
    pub fn append_body_line(&mut self, line: &[u8]) {
        if !self.source.ends_with(b"\n") {
            self.source.push(b'\n');
        }
        self.source.extend_from_slice(line);
    }

    /// The first source line (the command itself, without any load body).
    pub fn first_line(&self) -> &[u8] {
        match self.source.iter().position(|b| *b == b'\n') {
            Some(end) => &self.source[..=end],
            None => &self.source,
        }
    }

    /// Everything after the first source line.
    pub fn body_lines(&self) -> &[u8] {
        &self.source[self.first_line().len()..]
    }

    /// Resolve every argument to a `(name, value)` pair.
    pub fn named_arguments(&self) -> Result<Vec<(String, String)>, CommandParseError> {
        let params = positional_parameters(&self.name).unwrap_or(&[]);
        let mut positional_index = 0;
        let mut pairs = Vec::with_capacity(self.arguments.len());
        for arg in &self.arguments {
            match &arg.name {
                Some(name) => pairs.push((name.clone(), arg.value.clone())),
                None => {
                    let name = params.get(positional_index).ok_or_else(|| {
                        CommandParseError::UnknownPositional {
                            command: self.name.clone(),
                            index: positional_index,
                        }
                    })?;
                    pairs.push(((*name).to_string(), arg.value.clone()));
                    positional_index += 1;
                }
            }
        }
        Ok(pairs)
    }

    /// Render as a server URI path with query string, e.g.
    /// `/d/select?table=Foo`.
    pub fn to_uri_format(&self) -> Result<String, CommandParseError> {
        let pairs = self.named_arguments()?;
        let mut uri = format!("/d/{}", self.name);
        if !pairs.is_empty() {
            let query = form_urlencoded::Serializer::new(String::new())
                .extend_pairs(pairs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
                .finish();
            uri.push('?');
            uri.push_str(&query);
        }
        Ok(uri)
    }

    fn render_first_line(&self) -> String {
        let newline = if self.first_line().ends_with(b"\n") {
            "\n"
        } else {
            ""
        };
        if self.uri_form {
            return match self.to_uri_format() {
                Ok(uri) => uri + newline,
                Err(_) => String::from_utf8_lossy(self.first_line()).into_owned(),
            };
        }
        let mut line = self.name.clone();
        for arg in &self.arguments {
            match &arg.name {
                Some(name) => line.push_str(&format!(" --{name} {}", quote_value(&arg.value))),
                None => line.push_str(&format!(" {}", quote_value(&arg.value))),
            }
        }
        line + newline
    }
}

fn positional_parameters(command: &str) -> Option<&'static [&'static str]> {
    POSITIONAL_PARAMETERS
        .iter()
        .find(|(name, _)| *name == command)
        .map(|(_, params)| *params)
}

/// Quote a value for command-line form when it needs it.
pub fn quote_value(value: &str) -> String {
    let plain = !value.is_empty()
        && value
            .chars()
            .all(|c| !c.is_whitespace() && !matches!(c, '"' | '\'' | '\\' | '(' | ')'));
    if plain {
        return value.to_string();
    }
    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('\'');
    for c in value.chars() {
        match c {
            '\'' | '\\' => {
                quoted.push('\\');
                quoted.push(c);
            }
            '\n' => quoted.push_str("\\n"),
            _ => quoted.push(c),
        }
    }
    quoted.push('\'');
    quoted
}

// ---------------------------------------------------------------------------
// Grammar
// ---------------------------------------------------------------------------

fn parse_command_line(line: &str) -> Result<(String, Vec<Argument>), CommandParseError> {
    let tokens = tokenize(line)?;
    let mut tokens = tokens.into_iter();
    let name = tokens.next().ok_or(CommandParseError::Empty)?;

    let mut arguments = Vec::new();
    while let Some(token) = tokens.next() {
        match token.strip_prefix("--") {
            Some(key) if !key.is_empty() => {
                let value = tokens
                    .next()
                    .ok_or_else(|| CommandParseError::MissingValue(key.to_string()))?;
                arguments.push(Argument {
                    name: Some(key.to_string()),
                    value,
                });
            }
            _ => arguments.push(Argument {
                name: None,
                value: token,
            }),
        }
    }
    Ok((name, arguments))
}

/// Split a command line into tokens, honouring single and double quotes
/// and backslash escapes inside quotes.
fn tokenize(line: &str) -> Result<Vec<String>, CommandParseError> {
    let mut tokens = Vec::new();
    let mut chars = line.chars().peekable();

    loop {
        while chars.next_if(|c| c.is_whitespace()).is_some() {}
        let Some(&first) = chars.peek() else {
            break;
        };

        let mut token = String::new();
        if first == '\'' || first == '"' {
            chars.next();
            let mut closed = false;
            while let Some(c) = chars.next() {
                match c {
                    '\\' => match chars.next() {
                        Some('n') => token.push('\n'),
                        Some('t') => token.push('\t'),
                        Some(escaped) => token.push(escaped),
                        None => break,
                    },
                    c if c == first => {
                        closed = true;
                        break;
                    }
                    c => token.push(c),
                }
            }
            if !closed {
                return Err(CommandParseError::UnterminatedQuote(line.to_string()));
            }
        } else {
            while let Some(c) = chars.next_if(|c| !c.is_whitespace()) {
                token.push(c);
            }
        }
        tokens.push(token);
    }
    Ok(tokens)
}

fn parse_uri(uri: &str) -> Result<(String, Vec<Argument>), CommandParseError> {
    let invalid = || CommandParseError::InvalidUri(uri.to_string());
    let (path, query) = match uri.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (uri, None),
    };
    let name_part = path.strip_prefix("/d/").ok_or_else(invalid)?;
    if name_part.is_empty() || name_part.contains('/') {
        return Err(invalid());
    }

    let mut arguments = Vec::new();
    let name = match name_part.split_once('.') {
        Some((name, output_type)) => {
            arguments.push(Argument {
                name: Some("output_type".to_string()),
                value: output_type.to_string(),
            });
            name.to_string()
        }
        None => name_part.to_string(),
    };

    if let Some(query) = query {
        for (key, value) in form_urlencoded::parse(query.as_bytes()) {
            arguments.push(Argument {
                name: Some(key.into_owned()),
                value: value.into_owned(),
            });
        }
    }
    Ok((name, arguments))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
