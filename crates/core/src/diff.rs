//! Unified diffs between expected and actual transcripts.
//!
//! Presentation only; pass/fail is decided by plain equality.

use similar::{ChangeTag, TextDiff};

/// Lines of context around each change.
pub const CONTEXT_LINES: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffLineType {
    Added,
    Removed,
    Unchanged,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffLine {
    pub line_type: DiffLineType,
    pub content: String,
}

/// One `@@ -a,b +c,d @@` block. Line numbers are 1-based.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hunk {
    pub expected_start: usize,
    pub expected_len: usize,
    pub actual_start: usize,
    pub actual_len: usize,
    pub lines: Vec<DiffLine>,
}

impl Hunk {
    pub fn header(&self) -> String {
        format!(
            "@@ -{},{} +{},{} @@",
            self.expected_start, self.expected_len, self.actual_start, self.actual_len
        )
    }
}

/// Compute hunks with [`CONTEXT_LINES`] of context. Hunks whose context
/// overlaps are merged.
pub fn compute_hunks(expected: &str, actual: &str) -> Vec<Hunk> {
    let diff = TextDiff::from_lines(expected, actual);
    diff.grouped_ops(CONTEXT_LINES)
        .into_iter()
        .filter_map(|group| {
            let first = group.first()?;
            let last = group.last()?;
            let old_range = first.old_range().start..last.old_range().end;
            let new_range = first.new_range().start..last.new_range().end;

            let lines = group
                .iter()
                .flat_map(|op| diff.iter_changes(op))
                .map(|change| DiffLine {
                    line_type: match change.tag() {
                        ChangeTag::Equal => DiffLineType::Unchanged,
                        ChangeTag::Insert => DiffLineType::Added,
                        ChangeTag::Delete => DiffLineType::Removed,
                    },
                    content: change.value().trim_end_matches('\n').to_string(),
                })
                .collect();

            Some(Hunk {
                expected_start: display_start(old_range.start, old_range.len()),
                expected_len: old_range.len(),
                actual_start: display_start(new_range.start, new_range.len()),
                actual_len: new_range.len(),
                lines,
            })
        })
        .collect()
}

// An empty range is reported at the line before it, like `diff -u`.
fn display_start(start: usize, len: usize) -> usize {
    if len == 0 {
        start
    } else {
        start + 1
    }
}

/// Render a unified diff with `--- expected` / `+++ actual` headers.
/// Returns an empty string when the texts are equal.
pub fn unified_diff(expected: &str, actual: &str, expected_label: &str, actual_label: &str) -> String {
    let hunks = compute_hunks(expected, actual);
    if hunks.is_empty() {
        return String::new();
    }
    let mut out = format!("--- {expected_label}\n+++ {actual_label}\n");
    for hunk in &hunks {
        out.push_str(&hunk.header());
        out.push('\n');
        for line in &hunk.lines {
            let marker = match line.line_type {
                DiffLineType::Added => '+',
                DiffLineType::Removed => '-',
                DiffLineType::Unchanged => ' ',
            };
            out.push(marker);
            out.push_str(&line.content);
            out.push('\n');
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

    fn numbered(range: std::ops::RangeInclusive<u32>) -> String {
        range.map(|n| format!("{n}\n")).collect()
    }

    fn replace_line(text: &str, line_no: usize, with: &str) -> String {
        text.lines()
            .enumerate()
            .map(|(i, line)| if i + 1 == line_no { format!("{with}\n") } else { format!("{line}\n") })
            .collect()
    }

    #[test]
    fn equal_texts_have_no_diff() {
        assert!(compute_hunks("a\nb\n", "a\nb\n").is_empty());
        assert_eq!(unified_diff("a\n", "a\n", "x", "y"), "");
    }

    #[test]
    fn single_change_with_context() {
        let expected = numbered(1..=10);
        let actual = replace_line(&expected, 5, "five");
        let hunks = compute_hunks(&expected, &actual);
        assert_eq!(hunks.len(), 1);
        assert_eq!(hunks[0].header(), "@@ -2,7 +2,7 @@");
        assert_eq!(hunks[0].lines.first().unwrap().content, "2");
        assert_eq!(hunks[0].lines.last().unwrap().content, "8");
    }

    #[test]
    fn nearby_changes_merge_distant_ones_split() {
        let expected = numbered(1..=30);
        let near = replace_line(&replace_line(&expected, 5, "x"), 9, "y");
        assert_eq!(compute_hunks(&expected, &near).len(), 1);

        let far = replace_line(&replace_line(&expected, 5, "x"), 25, "y");
        assert_eq!(compute_hunks(&expected, &far).len(), 2);
    }

    #[test]
    fn rendered_markers() {
        let out = unified_diff("a\nb\n", "a\nc\n", "t.expected", "t.actual");
        assert_eq!(
            out,
            "--- t.expected\n+++ t.actual\n@@ -1,2 +1,2 @@\n a\n-b\n+c\n"
        );
    }
}
