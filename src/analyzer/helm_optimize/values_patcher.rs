//! Values-YAML patcher.
//!
//! Applies a nested patch to values.yaml text while leaving every untouched
//! top-level key byte-identical: comments, quoting, key order and blank
//! lines outside the rewritten keys survive. Only the top-level keys the patch
//! actually changes are re-rendered, using the document's own indentation.

use log::{debug, warn};
use serde_yaml::{Mapping, Value};
use yaml_rust2::parser::{Event, MarkedEventReceiver, Parser};
use yaml_rust2::scanner::Marker;

use super::parser::parse_values_content;
use super::types::ValuesPatch;
use crate::error::{OptimizerError, Result};

// ============================================================================
// Public API
// ============================================================================

/// Apply `patch` to values text.
///
/// A `null` in the patch deletes the key. Returns the original text unchanged
/// when the patch is already satisfied.
pub fn patch_values_yaml(original: &str, patch: &ValuesPatch) -> Result<String> {
    let current = parse_values_content(original)?;
    let pruned = prune_patch(Some(&current), patch);
    if pruned.is_empty() {
        debug!("Values patch already satisfied, leaving file untouched");
        return Ok(original.to_string());
    }

    let mut merged = current.as_mapping().cloned().unwrap_or_default();
    apply_patch(&mut merged, &pruned);

    let lines: Vec<&str> = original.split_inclusive('\n').collect();
    let Some(spans) = locate_top_level_keys(original, &lines) else {
        warn!("Could not locate top-level keys in values file, re-rendering the whole document");
        let style = IndentStyle::detect(&lines, 0, lines.len());
        let mut out = String::new();
        for (key, value) in &merged {
            emit_entry(&mut out, &render_scalar(key), value, 0, &style);
        }
        return Ok(finish(out, original));
    };

    let global_style = IndentStyle::detect(&lines, 0, lines.len());
    let anchors = collect_anchors(original);
    let mut replacements: Vec<(usize, usize, String)> = Vec::new();
    let mut appended = String::new();

    for (key, _) in &pruned {
        let key_name = key_string(key);
        let new_value = merged.get(key);

        match spans.iter().find(|s| s.key == key_name) {
            Some(span) => {
                let key_line = lines[span.start];
                let key_text = original_key_text(key_line, span.col).unwrap_or_else(|| render_scalar(key));
                let after_colon = span.col + key_text.len() + 1;
                let key_anchor = new_value.and_then(|_| value_anchor(key_line, after_colon));
                if let Some(id) = anchors.escaping(span, key_anchor.is_some()) {
                    return Err(OptimizerError::MalformedValues(format!(
                        "cannot rewrite '{}': anchor #{} defined there is aliased elsewhere",
                        key_name, id
                    )));
                }

                let text = match new_value {
                    Some(value) => {
                        let style = IndentStyle::detect(&lines, span.start + 1, span.end + 1)
                            .or(&global_style);
                        let mut block = String::new();
                        emit_entry(&mut block, &key_text, value, span.col, &style);
                        if let Some(anchor) = key_anchor {
                            let at = after_colon.min(block.len());
                            block.insert_str(at, &format!(" {}", anchor));
                        }
                        keep_inline_comment(&mut block, key_line, after_colon);
                        indent_first_line(&mut block, key_line, span.col);
                        block
                    }
                    None => String::new(),
                };
                replacements.push((span.start, span.end, text));
            }
            None => {
                if let Some(value) = new_value {
                    appended.push('\n');
                    emit_entry(&mut appended, &render_scalar(key), value, 0, &global_style);
                }
            }
        }
    }

    // Back-to-front so earlier line numbers stay valid
    replacements.sort_by(|a, b| b.0.cmp(&a.0));
    let mut out_lines: Vec<String> = lines.iter().map(|l| l.to_string()).collect();
    for (start, end, text) in replacements {
        let mut block = text;
        if end + 1 == out_lines.len() && !lines[end].ends_with('\n') && block.ends_with('\n') {
            block.pop();
        }
        out_lines.splice(start..=end, std::iter::once(block));
    }

    let mut out: String = out_lines.concat();
    if !appended.is_empty() {
        if out.trim().is_empty() {
            out.clear();
            appended.remove(0);
        } else if !out.ends_with('\n') {
            out.push('\n');
        }
        out.push_str(&appended);
    }

    Ok(finish(out, original))
}

/// Drop every part of `patch` that already matches `current`.
pub fn prune_patch(current: Option<&Value>, patch: &Mapping) -> Mapping {
    let mut out = Mapping::new();
    for (key, value) in patch {
        let existing = current.and_then(|c| c.as_mapping()).and_then(|m| m.get(key));
        match (existing, value) {
            (None, Value::Null) => {}
            (Some(_), Value::Null) => {
                out.insert(key.clone(), Value::Null);
            }
            (Some(cur @ Value::Mapping(_)), Value::Mapping(sub)) => {
                let pruned = prune_patch(Some(cur), sub);
                if !pruned.is_empty() {
                    out.insert(key.clone(), Value::Mapping(pruned));
                }
            }
            (Some(cur), v) if values_equal(cur, v) => {}
            _ => {
                out.insert(key.clone(), value.clone());
            }
        }
    }
    out
}

/// Merge a patch into a mapping; `null` deletes.
pub fn apply_patch(target: &mut Mapping, patch: &Mapping) {
    for (key, value) in patch {
        if value.is_null() {
            target.remove(key);
            continue;
        }
        if let (Some(Value::Mapping(existing)), Value::Mapping(sub)) = (target.get_mut(key), value) {
            apply_patch(existing, sub);
            continue;
        }
        target.insert(key.clone(), strip_nulls(value));
    }
}

/// Structural equality after normalizing scalar spellings (`2` == `"2"`).
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Mapping(x), Value::Mapping(y)) => {
            x.len() == y.len()
                && x.iter().all(|(k, v)| y.get(k).is_some_and(|w| values_equal(v, w)))
        }
        (Value::Sequence(x), Value::Sequence(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(v, w)| values_equal(v, w))
        }
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        (Value::Tagged(x), Value::Tagged(y)) => x.tag == y.tag && values_equal(&x.value, &y.value),
        _ => match (scalar_text(a), scalar_text(b)) {
            (Some(x), Some(y)) => x == y,
            _ => false,
        },
    }
}

// ============================================================================
// Top-level key spans
// ============================================================================

/// Source lines (0-based, inclusive) covered by one top-level key.
#[derive(Debug, Clone, PartialEq, Eq)]
struct KeySpan {
    key: String,
    start: usize,
    end: usize,
    col: usize,
}

enum Frame {
    Map { expect_key: bool },
    Seq,
}

/// Collects the position of every top-level mapping key, plus where anchors
/// are defined and aliased.
#[derive(Default)]
struct TopLevelKeyCollector {
    stack: Vec<Frame>,
    keys: Vec<(String, usize, usize)>,
    anchors: AnchorMap,
}

/// Anchor definitions and alias uses, by 0-based line.
#[derive(Debug, Default)]
struct AnchorMap {
    /// (anchor id, line, whether the node is a top-level value)
    defined: Vec<(usize, usize, bool)>,
    /// (anchor id, line)
    aliased: Vec<(usize, usize)>,
}

impl AnchorMap {
    /// An anchor defined inside `span` that an alias outside it still needs.
    ///
    /// The top-level value's own anchor is exempt when it is carried over to
    /// the rewritten key line.
    fn escaping(&self, span: &KeySpan, keeps_value_anchor: bool) -> Option<usize> {
        let inside = |line: usize| line >= span.start && line <= span.end;
        self.defined
            .iter()
            .filter(|(_, line, root_value)| inside(*line) && !(*root_value && keeps_value_anchor))
            .map(|(id, _, _)| *id)
            .find(|id| self.aliased.iter().any(|(alias, line)| alias == id && !inside(*line)))
    }
}

impl MarkedEventReceiver for TopLevelKeyCollector {
    fn on_event(&mut self, ev: Event, mark: Marker) {
        let is_node = matches!(
            ev,
            Event::Scalar(..) | Event::Alias(..) | Event::MappingStart(..) | Event::SequenceStart(..)
        );

        if is_node {
            let line = mark.line().saturating_sub(1);
            let at_root_value = self.stack.len() == 1
                && matches!(self.stack.last(), Some(Frame::Map { expect_key: false }));
            match &ev {
                Event::Alias(id) => self.anchors.aliased.push((*id, line)),
                Event::Scalar(_, _, id, _) | Event::MappingStart(id, _) | Event::SequenceStart(id, _) if *id > 0 => {
                    self.anchors.defined.push((*id, line, at_root_value));
                }
                _ => {}
            }

            let at_root_key = self.stack.len() == 1
                && matches!(self.stack.last(), Some(Frame::Map { expect_key: true }));
            if at_root_key {
                if let Event::Scalar(value, ..) = &ev {
                    self.keys.push((value.clone(), mark.line(), mark.col()));
                }
            }
            if let Some(Frame::Map { expect_key }) = self.stack.last_mut() {
                *expect_key = !*expect_key;
            }
        }

        match ev {
            Event::MappingStart(..) => self.stack.push(Frame::Map { expect_key: true }),
            Event::SequenceStart(..) => self.stack.push(Frame::Seq),
            Event::MappingEnd | Event::SequenceEnd => {
                self.stack.pop();
            }
            _ => {}
        }
    }
}

/// Find the line span of every top-level key.
///
/// Positions come from the event parser; when they do not line up with the
/// text (or parsing fails) a line-oriented scan is used instead. `None` means
/// the document layout is not something either can splice safely.
fn locate_top_level_keys(source: &str, lines: &[&str]) -> Option<Vec<KeySpan>> {
    let mut collector = TopLevelKeyCollector::default();
    let mut parser = Parser::new_from_str(source);
    let starts = match parser.load(&mut collector, false) {
        Ok(()) => {
            let starts: Vec<(String, usize, usize)> = collector
                .keys
                .into_iter()
                .filter_map(|(key, line, col)| line.checked_sub(1).map(|l| (key, l, col)))
                .collect();
            if starts_match_text(&starts, lines) {
                Some(starts)
            } else {
                debug!("Parser positions disagree with values text, scanning lines instead");
                None
            }
        }
        Err(e) => {
            debug!("Event parse of values failed ({}), scanning lines instead", e);
            None
        }
    };

    let starts = match starts {
        Some(s) => s,
        None => scan_top_level_keys(lines)?,
    };

    let mut spans = Vec::with_capacity(starts.len());
    for (i, (key, start, col)) in starts.iter().enumerate() {
        let limit = starts.get(i + 1).map(|(_, next, _)| *next).unwrap_or(lines.len());
        let mut end = limit.saturating_sub(1).max(*start);
        while end > *start && is_trivia(lines[end]) {
            end -= 1;
        }
        spans.push(KeySpan {
            key: key.clone(),
            start: *start,
            end,
            col: *col,
        });
    }
    Some(spans)
}

/// Anchor usage for the whole document; empty when it does not parse.
fn collect_anchors(source: &str) -> AnchorMap {
    let mut collector = TopLevelKeyCollector::default();
    match Parser::new_from_str(source).load(&mut collector, false) {
        Ok(()) => collector.anchors,
        Err(_) => AnchorMap::default(),
    }
}

fn starts_match_text(starts: &[(String, usize, usize)], lines: &[&str]) -> bool {
    let mut previous = None;
    starts.iter().all(|(_, line, col)| {
        let ordered = previous.is_none_or(|p| *line > p);
        previous = Some(*line);
        ordered
            && lines.get(*line).is_some_and(|text| {
                let indent = text.len() - text.trim_start().len();
                indent == *col && original_key_text(text, *col).is_some()
            })
    })
}

/// Line-oriented fallback: unindented `key:` lines are top-level keys.
fn scan_top_level_keys(lines: &[&str]) -> Option<Vec<(String, usize, usize)>> {
    let mut keys = Vec::new();
    for (i, line) in lines.iter().enumerate() {
        if line.starts_with([' ', '\t', '#', '-', '\r', '\n']) || line.trim().is_empty() {
            continue;
        }
        if line.starts_with("---") || line.starts_with("...") {
            continue;
        }
        if line.starts_with(['{', '[']) {
            return None;
        }
        let key_text = original_key_text(line, 0)?;
        let key = key_text.trim().trim_matches('"').trim_matches('\'').to_string();
        keys.push((key, i, 0));
    }
    Some(keys)
}

/// Blank, comment or document-marker line.
fn is_trivia(line: &str) -> bool {
    let trimmed = line.trim();
    trimmed.is_empty() || trimmed.starts_with('#') || trimmed == "---" || trimmed == "..."
}

/// Key token as written on its line, from `col` up to the separating colon.
fn original_key_text(line: &str, col: usize) -> Option<String> {
    let rest = line.get(col..)?;
    let bytes = rest.as_bytes();
    let mut i = 0;
    if let Some(&quote) = bytes.first().filter(|b| **b == b'"' || **b == b'\'') {
        i = 1;
        while i < bytes.len() && bytes[i] != quote {
            i += 1;
        }
        i += 1;
    }
    while i < bytes.len() {
        if bytes[i] == b':' {
            let next = bytes.get(i + 1);
            if next.is_none() || matches!(next, Some(b' ' | b'\t' | b'\r' | b'\n')) {
                return Some(rest[..i].to_string());
            }
        }
        i += 1;
    }
    None
}

// ============================================================================
// Indentation style
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct IndentStyle {
    width: usize,
    indent_sequences: bool,
    /// Which fields were actually observed (vs. defaulted)
    found_width: bool,
    found_sequences: bool,
}

impl IndentStyle {
    /// Detect from lines `[from, to)`.
    fn detect(lines: &[&str], from: usize, to: usize) -> Self {
        let mut style = IndentStyle {
            width: 2,
            indent_sequences: true,
            found_width: false,
            found_sequences: false,
        };
        let mut previous: Option<(usize, bool)> = None;

        for line in lines.iter().take(to.min(lines.len())).skip(from) {
            if is_trivia(line) {
                continue;
            }
            let indent = line.len() - line.trim_start().len();
            let trimmed = line.trim();
            let is_item = trimmed == "-" || trimmed.starts_with("- ");

            if let Some((prev_indent, prev_opens)) = previous {
                if prev_opens {
                    if is_item && !style.found_sequences {
                        style.indent_sequences = indent > prev_indent;
                        style.found_sequences = true;
                    } else if !is_item && !style.found_width && indent > prev_indent {
                        style.width = indent - prev_indent;
                        style.found_width = true;
                    }
                }
            }
            if style.found_width && style.found_sequences {
                break;
            }
            previous = Some((indent, opens_block(trimmed)));
        }
        style
    }

    /// Fill unobserved fields from `fallback`.
    fn or(mut self, fallback: &IndentStyle) -> Self {
        if !self.found_width {
            self.width = fallback.width;
        }
        if !self.found_sequences {
            self.indent_sequences = fallback.indent_sequences;
        }
        self
    }
}

/// A `key:` line with nothing but an optional comment after the colon.
fn opens_block(trimmed: &str) -> bool {
    let content = match trimmed.find(" #") {
        Some(idx) => trimmed[..idx].trim_end(),
        None => trimmed,
    };
    content.ends_with(':') && !content.starts_with('#')
}

// ============================================================================
// Emitter
// ============================================================================

fn pad(col: usize) -> String {
    " ".repeat(col)
}

/// Render a scalar (or empty collection) in flow form.
fn render_scalar(value: &Value) -> String {
    match value {
        Value::Mapping(m) if m.is_empty() => "{}".to_string(),
        Value::Sequence(s) if s.is_empty() => "[]".to_string(),
        _ => serde_yaml::to_string(value)
            .map(|s| s.trim_end_matches('\n').to_string())
            .unwrap_or_else(|_| "null".to_string()),
    }
}

/// Write `key: value` at column `col`.
fn emit_entry(out: &mut String, key: &str, value: &Value, col: usize, style: &IndentStyle) {
    match value {
        Value::Mapping(map) if !map.is_empty() => {
            out.push_str(&format!("{}{}:\n", pad(col), key));
            for (k, v) in map {
                emit_entry(out, &render_scalar(k), v, col + style.width, style);
            }
        }
        Value::Sequence(seq) if !seq.is_empty() => {
            out.push_str(&format!("{}{}:\n", pad(col), key));
            let item_col = if style.indent_sequences { col + style.width } else { col };
            for item in seq {
                emit_item(out, item, item_col, style);
            }
        }
        _ => emit_scalar_line(out, &format!("{}{}: ", pad(col), key), value, col + style.width),
    }
}

/// Write one `- item` at column `col`.
fn emit_item(out: &mut String, item: &Value, col: usize, style: &IndentStyle) {
    match item {
        Value::Mapping(map) if !map.is_empty() => {
            // First entry shares the dash line
            let inner = col + 2;
            let mut block = String::new();
            for (k, v) in map {
                emit_entry(&mut block, &render_scalar(k), v, inner, style);
            }
            let inner_pad = pad(inner);
            let first = block.strip_prefix(&inner_pad).unwrap_or(&block);
            out.push_str(&format!("{}- {}", pad(col), first));
        }
        Value::Sequence(seq) if !seq.is_empty() => {
            out.push_str(&format!("{}-\n", pad(col)));
            for nested in seq {
                emit_item(out, nested, col + 2, style);
            }
        }
        _ => emit_scalar_line(out, &format!("{}- ", pad(col)), item, col + 2),
    }
}

/// Write `prefix` followed by a scalar, re-indenting multi-line renderings.
fn emit_scalar_line(out: &mut String, prefix: &str, value: &Value, continuation_col: usize) {
    let rendered = render_scalar(value);
    let mut lines = rendered.lines();
    let first = lines.next().unwrap_or_default();
    out.push_str(prefix);
    out.push_str(first);
    out.push('\n');

    let rest: Vec<&str> = lines.collect();
    let common = rest
        .iter()
        .filter(|l| !l.trim().is_empty())
        .map(|l| l.len() - l.trim_start().len())
        .min()
        .unwrap_or(0);
    for line in rest {
        if line.trim().is_empty() {
            out.push('\n');
        } else {
            out.push_str(&pad(continuation_col));
            out.push_str(&line[common..]);
            out.push('\n');
        }
    }
}

/// `&name` written right after the key's colon, if any.
fn value_anchor(line: &str, after_colon: usize) -> Option<String> {
    let rest = line.get(after_colon..)?.trim_start();
    let anchor = rest.strip_prefix('&')?;
    let name: String = anchor.chars().take_while(|c| !c.is_whitespace()).collect();
    (!name.is_empty()).then(|| format!("&{}", name))
}

/// Trailing comment of a key line, with the whitespace before it.
fn trailing_comment(line: &str, after_colon: usize) -> Option<&str> {
    let rest = line.get(after_colon..)?.trim_end();
    let bytes = rest.as_bytes();
    let mut quote: Option<u8> = None;
    for (i, &b) in bytes.iter().enumerate() {
        match quote {
            Some(q) if b == q => quote = None,
            Some(_) => {}
            None if (b == b'"' || b == b'\'') && (i == 0 || bytes[i - 1].is_ascii_whitespace()) => {
                quote = Some(b)
            }
            None if b == b'#' && (i == 0 || bytes[i - 1] == b' ' || bytes[i - 1] == b'\t') => {
                let gap = rest[..i].trim_end().len();
                return Some(&rest[gap..]);
            }
            None => {}
        }
    }
    None
}

/// Carry a trailing `# comment` on the key line over to the rewritten entry.
fn keep_inline_comment(block: &mut String, original_line: &str, after_colon: usize) {
    let Some(comment) = trailing_comment(original_line, after_colon) else {
        return;
    };
    let comment = if comment.starts_with('#') {
        format!(" {}", comment)
    } else {
        comment.to_string()
    };
    if let Some(newline) = block.find('\n') {
        block.insert_str(newline, &comment);
    }
}

/// Keep the original line's leading whitespace exactly (tabs included).
fn indent_first_line(block: &mut String, original_line: &str, col: usize) {
    let leading = &original_line[..original_line.len() - original_line.trim_start().len()];
    if leading.len() == col && leading != pad(col) {
        block.replace_range(..col.min(block.len()), leading);
    }
}

fn finish(mut out: String, original: &str) -> String {
    let wants_newline = original.is_empty() || original.ends_with('\n');
    while out.ends_with("\n\n") && !original.ends_with("\n\n") {
        out.pop();
    }
    if wants_newline && !out.ends_with('\n') {
        out.push('\n');
    }
    if !wants_newline {
        while out.ends_with('\n') {
            out.pop();
        }
    }
    out
}

fn key_string(key: &Value) -> String {
    scalar_text(key).unwrap_or_else(|| render_scalar(key))
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Null => Some("null".to_string()),
        _ => None,
    }
}

fn strip_nulls(value: &Value) -> Value {
    match value {
        Value::Mapping(map) => Value::Mapping(
            map.iter()
                .filter(|(_, v)| !v.is_null())
                .map(|(k, v)| (k.clone(), strip_nulls(v)))
                .collect(),
        ),
        other => other.clone(),
    }
}
