//! User substitution rules registered with `#@add-substitution`.
//!
//! Each rule rewrites matches of one pattern twice, independently: once in
//! the command text sent to the server and once in the recorded input
//! that ends up in the transcript. Rules match on raw script bytes.

use regex::bytes::Regex;

use crate::error::CoreError;

#[derive(Debug, Clone)]
pub struct Substitution {
    pub name: String,
    pattern: Regex,
    input_replacement: String,
    normalized_replacement: String,
}

impl Substitution {
    /// `pattern` may be written `/re/` or bare. Replacements use `\1` style
    /// group references.
    pub fn new(
        name: &str,
        pattern: &str,
        input_replacement: &str,
        normalized_replacement: &str,
    ) -> Result<Self, CoreError> {
        let source = pattern
            .strip_prefix('/')
            .and_then(|p| p.strip_suffix('/'))
            .unwrap_or(pattern);
        let pattern = Regex::new(source).map_err(|e| CoreError::Pattern(e.to_string()))?;
        Ok(Self {
            name: name.to_string(),
            pattern,
            input_replacement: convert_replacement(input_replacement),
            normalized_replacement: convert_replacement(normalized_replacement),
        })
    }

    pub fn pattern(&self) -> &str {
        self.pattern.as_str()
    }

    pub fn apply_input(&self, source: &[u8]) -> Vec<u8> {
        self.pattern
            .replace_all(source, self.input_replacement.as_bytes())
            .into_owned()
    }

    pub fn apply_normalized(&self, source: &[u8]) -> Vec<u8> {
        self.pattern
            .replace_all(source, self.normalized_replacement.as_bytes())
            .into_owned()
    }
}

/// Ordered rule set. Rules apply in registration order; registering an
/// existing name replaces that rule in place.
#[derive(Debug, Clone, Default)]
pub struct Substitutions {
    rules: Vec<Substitution>,
}

impl Substitutions {
    pub fn add(&mut self, rule: Substitution) {
        match self.rules.iter_mut().find(|r| r.name == rule.name) {
            Some(existing) => *existing = rule,
            None => self.rules.push(rule),
        }
    }

    pub fn remove(&mut self, name: &str) -> bool {
        let before = self.rules.len();
        self.rules.retain(|r| r.name != name);
        self.rules.len() != before
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Bytes to send to the server.
    pub fn apply_input(&self, source: &[u8]) -> Vec<u8> {
        self.rules
            .iter()
            .fold(source.to_vec(), |acc, rule| rule.apply_input(&acc))
    }

    /// Bytes to record in the transcript.
    pub fn apply_normalized(&self, source: &[u8]) -> Vec<u8> {
        self.rules
            .iter()
            .fold(source.to_vec(), |acc, rule| rule.apply_normalized(&acc))
    }
}

/// Translate `\1`, `\&` and `\\` into the `regex` crate's `${1}` syntax and
/// escape literal `$`.
fn convert_replacement(replacement: &str) -> String {
    let mut out = String::with_capacity(replacement.len());
    let mut chars = replacement.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '$' => out.push_str("$$"),
            '\\' => match chars.peek().copied() {
                Some(d) if d.is_ascii_digit() => {
                    chars.next();
                    out.push_str(&format!("${{{d}}}"));
                }
                Some('&') => {
                    chars.next();
                    out.push_str("${0}");
                }
                Some('\\') => {
                    chars.next();
                    out.push('\\');
                }
                _ => out.push('\\'),
            },
            c => out.push(c),
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn both_sides_are_rewritten_independently() {
        let rule = Substitution::new("now", r"/\d{10}/", "1700000000", "NOW").unwrap();
        let text = b"select --filter 'time < 1234567890'";
        assert_eq!(rule.apply_input(text), b"select --filter 'time < 1700000000'");
        assert_eq!(rule.apply_normalized(text), b"select --filter 'time < NOW'");
    }

    #[test]
    fn group_references() {
        let rule = Substitution::new("swap", r"(\w+)=(\w+)", r"\2=\1", r"[\&] costs $5").unwrap();
        assert_eq!(rule.apply_input(b"a=b"), b"b=a");
        assert_eq!(rule.apply_normalized(b"a=b"), b"[a=b] costs $5");
    }

    #[test]
    fn rules_by_name() {
        let mut rules = Substitutions::default();
        rules.add(Substitution::new("x", "x", "y", "y").unwrap());
        rules.add(Substitution::new("x", "x", "z", "z").unwrap());
        assert_eq!(rules.apply_input(b"x"), b"z");
        assert!(rules.remove("x"));
        assert!(!rules.remove("x"));
        assert!(rules.is_empty());
        assert_eq!(rules.apply_normalized(b"x"), b"x");
    }

    #[test]
    fn non_utf8_bytes_outside_matches_are_kept() {
        let rule = Substitution::new("id", r"/id=\d+/", "id=1", "id=N").unwrap();
        assert_eq!(rule.apply_input(b"\xe9 id=42 \xff"), b"\xe9 id=1 \xff");
    }

    #[test]
    fn invalid_pattern() {
        assert!(Substitution::new("bad", "/(/", "", "").is_err());
    }
}
