//! Glob patterns over dot-delimited metric paths.
//!
//! A pattern compiles to one matcher per dot-separated segment. Supported syntax
//! inside a segment: `*` (any run of characters), `?` (one character),
//! `[...]` / `[!...]` character classes, `{a,b,c}` alternation (nestable) and
//! `\x` escapes. There is no recursive `**`: a pattern with N segments only ever
//! matches paths with exactly N segments.

use crate::error::QueryError;
use regex::Regex;
use std::fmt;

/// Returns true if `s` contains glob syntax.
pub fn is_pattern(s: &str) -> bool {
    s.contains(['*', '?', '[', '{'])
}

#[derive(Debug, Clone)]
enum SegmentMatcher {
    Literal(String),
    Any,
    Regex(Regex),
}

impl SegmentMatcher {
    fn matches(&self, segment: &str) -> bool {
        match self {
            SegmentMatcher::Literal(lit) => lit == segment,
            SegmentMatcher::Any => true,
            SegmentMatcher::Regex(re) => re.is_match(segment),
        }
    }
}

/// A compiled metric-path glob.
#[derive(Debug, Clone)]
pub struct GlobPattern {
    source: String,
    segments: Vec<SegmentMatcher>,
}

impl GlobPattern {
    /// Compiles `pattern`. Fails with `InvalidPattern` on empty segments,
    /// unbalanced braces/brackets or a dangling escape.
    pub fn compile(pattern: &str) -> Result<Self, QueryError> {
        let invalid = |reason: &str| QueryError::InvalidPattern {
            pattern: pattern.to_string(),
            reason: reason.to_string(),
        };

        if pattern.is_empty() {
            return Err(invalid("empty pattern"));
        }

        let mut segments = Vec::new();
        for raw in split_segments(pattern).map_err(|r| invalid(&r))? {
            if raw.is_empty() {
                return Err(invalid("empty path segment"));
            }
            segments.push(compile_segment(&raw).map_err(|r| invalid(&r))?);
        }

        Ok(GlobPattern {
            source: pattern.to_string(),
            segments,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// Matches a single segment against the matcher at `index`.
    pub fn matches_segment(&self, index: usize, segment: &str) -> bool {
        self.segments
            .get(index)
            .map(|m| m.matches(segment))
            .unwrap_or(false)
    }

    /// Matches a full path; segment counts must be equal.
    pub fn matches(&self, path: &str) -> bool {
        let mut count = 0;
        for (i, segment) in path.split('.').enumerate() {
            if !self.matches_segment(i, segment) {
                return false;
            }
            count += 1;
        }
        count == self.segments.len()
    }

    /// Matches the first `segment_count()` segments of `path`, returning the
    /// matched prefix and whether it is the whole path. Used by backends that
    /// derive branch nodes from leaf paths.
    pub fn match_prefix<'a>(&self, path: &'a str) -> Option<(&'a str, bool)> {
        let wanted = self.segments.len();
        let mut end = 0;
        for (i, segment) in path.split('.').enumerate() {
            if i == wanted {
                return Some((&path[..end - 1], false));
            }
            if !self.matches_segment(i, segment) {
                return None;
            }
            end += segment.len() + 1;
            if i + 1 == wanted && end - 1 == path.len() {
                return Some((path, true));
            }
        }
        None
    }
}

impl fmt::Display for GlobPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

/// Splits on dots that are not inside braces/brackets or escaped.
fn split_segments(pattern: &str) -> Result<Vec<String>, String> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut brace_depth = 0usize;
    let mut in_class = false;
    let mut chars = pattern.chars();

    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                current.push(c);
                match chars.next() {
                    Some(next) => current.push(next),
                    None => return Err("dangling escape".to_string()),
                }
            }
            '[' if !in_class => {
                in_class = true;
                current.push(c);
            }
            ']' if in_class => {
                in_class = false;
                current.push(c);
            }
            '{' if !in_class => {
                brace_depth += 1;
                current.push(c);
            }
            '}' if !in_class => {
                if brace_depth == 0 {
                    return Err("unbalanced '}'".to_string());
                }
                brace_depth -= 1;
                current.push(c);
            }
            '.' if brace_depth == 0 && !in_class => out.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }

    if brace_depth > 0 {
        return Err("unbalanced '{'".to_string());
    }
    if in_class {
        return Err("unterminated character class".to_string());
    }
    out.push(current);
    Ok(out)
}

fn compile_segment(segment: &str) -> Result<SegmentMatcher, String> {
    if segment == "*" {
        return Ok(SegmentMatcher::Any);
    }
    if !is_pattern(segment) && !segment.contains('\\') {
        return Ok(SegmentMatcher::Literal(segment.to_string()));
    }

    let mut re = String::with_capacity(segment.len() * 2 + 2);
    re.push('^');
    translate(segment, &mut re)?;
    re.push('$');
    Regex::new(&re)
        .map(SegmentMatcher::Regex)
        .map_err(|e| e.to_string())
}

/// Translates glob syntax into regex syntax. Alternatives inside braces are
/// translated recursively so `{a*,b?}` nests.
fn translate(glob: &str, out: &mut String) -> Result<(), String> {
    let chars: Vec<char> = glob.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        match chars[i] {
            '*' => out.push_str("[^.]*"),
            '?' => out.push_str("[^.]"),
            '\\' => {
                i += 1;
                let c = chars.get(i).ok_or_else(|| "dangling escape".to_string())?;
                push_literal(*c, out);
            }
            '[' => {
                let close = chars[i + 1..]
                    .iter()
                    .position(|&c| c == ']')
                    .map(|p| p + i + 1)
                    .ok_or_else(|| "unterminated character class".to_string())?;
                let body: String = chars[i + 1..close].iter().collect();
                if body.is_empty() {
                    return Err("empty character class".to_string());
                }
                out.push('[');
                let body = match body.strip_prefix('!') {
                    Some(rest) => {
                        out.push('^');
                        rest.to_string()
                    }
                    None => body,
                };
                for c in body.chars() {
                    // Only the range dash keeps its meaning inside a class.
                    if c == '-' {
                        out.push('-');
                    } else {
                        push_literal(c, out);
                    }
                }
                out.push(']');
                i = close;
            }
            '{' => {
                let close = matching_brace(&chars, i)?;
                let inner: String = chars[i + 1..close].iter().collect();
                out.push_str("(?:");
                for (n, alt) in split_alternatives(&inner).iter().enumerate() {
                    if n > 0 {
                        out.push('|');
                    }
                    translate(alt, out)?;
                }
                out.push(')');
                i = close;
            }
            c => push_literal(c, out),
        }
        i += 1;
    }
    Ok(())
}

fn push_literal(c: char, out: &mut String) {
    let mut buf = [0u8; 4];
    out.push_str(&regex::escape(c.encode_utf8(&mut buf)));
}

fn matching_brace(chars: &[char], open: usize) -> Result<usize, String> {
    let mut depth = 0usize;
    let mut i = open;
    while i < chars.len() {
        match chars[i] {
            '\\' => i += 1,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Ok(i);
                }
            }
            _ => {}
        }
        i += 1;
    }
    Err("unbalanced '{'".to_string())
}

/// Splits the inside of a brace group on top-level commas.
fn split_alternatives(inner: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut depth = 0usize;
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                current.push(c);
                if let Some(next) = chars.next() {
                    current.push(next);
                }
            }
            '{' => {
                depth += 1;
                current.push(c);
            }
            '}' => {
                depth = depth.saturating_sub(1);
                current.push(c);
            }
            ',' if depth == 0 => out.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    out.push(current);
    out
}
