//! Markdown issue-body parser (§4.5): extracts acceptance criteria, context
//! key-values, related files, and related symbols via an AST traversal over
//! `pulldown-cmark`'s event stream rather than hand-rolled line scanning.
//! Deterministic, no I/O, no network; missing structure yields empty
//! collections, never an error.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use pulldown_cmark::{Event, Options, Parser, Tag, TagEnd};
use regex::Regex;

use crate::types::{AcceptanceCriterion, Priority};

const ACCEPTANCE_HEADINGS: &[&str] = &["acceptance criteria", "done criteria"];
const CONTEXT_HEADINGS: &[&str] = &["context"];
const FILES_HEADINGS: &[&str] = &["related files", "code analysis", "files"];
const SYMBOLS_HEADINGS: &[&str] = &["related symbols"];

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedContext {
    pub component: Option<String>,
    pub service: Option<String>,
    pub environment: Option<String>,
    pub priority: Option<Priority>,
}

#[derive(Debug, Clone, Default)]
pub struct ParsedIssueBody {
    pub acceptance_criteria: Vec<AcceptanceCriterion>,
    pub context: ParsedContext,
    pub related_files: Vec<String>,
    pub related_symbols: Vec<String>,
}

/// Walks the heading events of the markdown AST to segment the body into
/// named sections (case-insensitive against the alternates above), then
/// returns each section's raw source text (heading line excluded) for the
/// line-oriented extraction helpers below.
fn section_map(body: &str) -> BTreeMap<String, String> {
    let parser = Parser::new_ext(body, Options::ENABLE_TASKLISTS).into_offset_iter();

    let mut headings: Vec<(String, usize)> = Vec::new();
    let mut heading_text = String::new();
    let mut in_heading = false;

    for (event, range) in parser {
        match event {
            Event::Start(Tag::Heading { .. }) => {
                in_heading = true;
                heading_text.clear();
                headings.push((String::new(), range.start));
            }
            Event::Text(text) | Event::Code(text) if in_heading => {
                heading_text.push_str(&text);
            }
            Event::End(TagEnd::Heading(_)) => {
                in_heading = false;
                if let Some(last) = headings.last_mut() {
                    last.0 = heading_text.trim().to_lowercase();
                }
            }
            _ => {}
        }
    }

    let mut map = BTreeMap::new();
    for (idx, (name, start)) in headings.iter().enumerate() {
        if name.is_empty() {
            continue;
        }
        let end = headings.get(idx + 1).map(|h| h.1).unwrap_or(body.len());
        let section_start = body[*start..end]
            .find('\n')
            .map(|p| start + p + 1)
            .unwrap_or(end);
        map.entry(name.clone())
            .or_insert_with(|| body[section_start..end].to_string());
    }
    map
}

fn find_section<'a>(sections: &'a BTreeMap<String, String>, alternates: &[&str]) -> Option<&'a str> {
    alternates
        .iter()
        .find_map(|alt| sections.get(*alt).map(|s| s.as_str()))
}

/// Parses an issue body into structured fields. Best-effort: missing
/// structure yields empty lists rather than an error.
pub fn parse_issue_body(body: &str) -> ParsedIssueBody {
    let sections = section_map(body);

    let acceptance_criteria = find_section(&sections, ACCEPTANCE_HEADINGS)
        .map(extract_acceptance_criteria)
        .unwrap_or_default();

    let context_text = find_section(&sections, CONTEXT_HEADINGS).unwrap_or("");
    let context = extract_context(body, context_text);

    let mut files_text = String::new();
    for heading in FILES_HEADINGS {
        if let Some(text) = sections.get(*heading) {
            files_text.push_str(text);
            files_text.push('\n');
        }
    }
    let related_files = extract_related_files(&files_text);

    let symbols_text = find_section(&sections, SYMBOLS_HEADINGS).unwrap_or("");
    let related_symbols = extract_related_symbols(symbols_text);

    ParsedIssueBody {
        acceptance_criteria,
        context,
        related_files,
        related_symbols,
    }
}

// --- Acceptance criteria ---

fn task_list_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?m)^\s*[-*]\s*\[( |x|X)\]\s*(.+)$").unwrap())
}

fn numbered_list_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?m)^\s*\d+[.)]\s+(.+)$").unwrap())
}

fn bullet_list_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?m)^\s*[-*]\s+(.+)$").unwrap())
}

/// Tries, in order: task-list items, numbered list, bullet list, GWT blocks,
/// then a fallback of significant-looking lines (§4.5).
fn extract_acceptance_criteria(section_text: &str) -> Vec<AcceptanceCriterion> {
    if let Some(items) = extract_task_list(section_text) {
        return items;
    }
    if let Some(items) = extract_numbered_list(section_text) {
        return items;
    }
    if let Some(items) = extract_bullet_list(section_text) {
        return items;
    }
    if let Some(items) = extract_gwt_blocks(section_text) {
        return items;
    }
    extract_significant_lines(section_text)
}

fn extract_task_list(text: &str) -> Option<Vec<AcceptanceCriterion>> {
    let items: Vec<AcceptanceCriterion> = task_list_regex()
        .captures_iter(text)
        .map(|c| {
            let completed = c.get(1).unwrap().as_str().eq_ignore_ascii_case("x");
            let item_text = c.get(2).unwrap().as_str().trim().to_string();
            let scenario = gwt_scenario_in(&item_text);
            AcceptanceCriterion {
                text: item_text,
                completed,
                scenario,
            }
        })
        .collect();
    (!items.is_empty()).then_some(items)
}

fn extract_numbered_list(text: &str) -> Option<Vec<AcceptanceCriterion>> {
    let items: Vec<AcceptanceCriterion> = numbered_list_regex()
        .captures_iter(text)
        .map(|c| {
            let item_text = c.get(1).unwrap().as_str().trim().to_string();
            let scenario = gwt_scenario_in(&item_text);
            AcceptanceCriterion {
                text: item_text,
                completed: false,
                scenario,
            }
        })
        .collect();
    (!items.is_empty()).then_some(items)
}

fn extract_bullet_list(text: &str) -> Option<Vec<AcceptanceCriterion>> {
    // Task-list items are also valid bullet lines; this strategy only runs
    // when task-list extraction already returned nothing, so no overlap.
    let items: Vec<AcceptanceCriterion> = bullet_list_regex()
        .captures_iter(text)
        .map(|c| {
            let item_text = c.get(1).unwrap().as_str().trim().to_string();
            let scenario = gwt_scenario_in(&item_text);
            AcceptanceCriterion {
                text: item_text,
                completed: false,
                scenario,
            }
        })
        .collect();
    (!items.is_empty()).then_some(items)
}

fn extract_gwt_blocks(text: &str) -> Option<Vec<AcceptanceCriterion>> {
    let re = Regex::new(r"(?i)\bgiven\b").ok()?;
    let matches: Vec<usize> = re.find_iter(text).map(|m| m.start()).collect();
    if matches.is_empty() {
        return None;
    }
    let mut items = Vec::new();
    for (idx, &start) in matches.iter().enumerate() {
        let end = matches.get(idx + 1).copied().unwrap_or(text.len());
        let block = text[start..end].trim();
        if block.is_empty() {
            continue;
        }
        let summary = block.lines().next().unwrap_or(block).trim().to_string();
        items.push(AcceptanceCriterion {
            text: summary,
            completed: false,
            scenario: Some(block.to_string()),
        });
    }
    (!items.is_empty()).then_some(items)
}

fn extract_significant_lines(text: &str) -> Vec<AcceptanceCriterion> {
    text.lines()
        .map(str::trim)
        .filter(|line| line.len() > 15 && !line.starts_with('#'))
        .map(|line| AcceptanceCriterion {
            text: line.to_string(),
            completed: false,
            scenario: None,
        })
        .collect()
}

fn gwt_scenario_in(text: &str) -> Option<String> {
    let lower = text.to_lowercase();
    if lower.contains("given") && (lower.contains("when") || lower.contains("then")) {
        Some(text.to_string())
    } else {
        None
    }
}

// --- Context ---

fn kv_regex(key: &str) -> Regex {
    Regex::new(&format!(r"(?im)^\s*{}\s*:\s*(.+)$", regex::escape(key))).expect("valid regex")
}

fn kv_value(text: &str, key: &str) -> Option<String> {
    kv_regex(key)
        .captures(text)
        .map(|c| c.get(1).unwrap().as_str().trim().to_string())
        .filter(|s| !s.is_empty())
}

fn detect_priority_label(body: &str) -> Option<Priority> {
    let lower = body.to_lowercase();
    if lower.contains("[critical]") || lower.contains("p0") || lower.contains("urgent") {
        Some(Priority::Critical)
    } else if lower.contains("[high]") || lower.contains("p1") {
        Some(Priority::High)
    } else if lower.contains("[medium]") || lower.contains("p2") {
        Some(Priority::Medium)
    } else if lower.contains("[low]") || lower.contains("p3") {
        Some(Priority::Low)
    } else {
        None
    }
}

fn extract_context(full_body: &str, context_section: &str) -> ParsedContext {
    let search = if context_section.is_empty() {
        full_body
    } else {
        context_section
    };
    ParsedContext {
        component: kv_value(search, "component").or_else(|| kv_value(full_body, "component")),
        service: kv_value(search, "service").or_else(|| kv_value(full_body, "service")),
        environment: kv_value(search, "environment").or_else(|| kv_value(full_body, "environment")),
        priority: kv_value(search, "priority")
            .and_then(|v| Priority::parse(&v))
            .or_else(|| detect_priority_label(full_body)),
    }
}

// --- Related files ---

const FILE_EXTENSIONS: &[&str] = &[
    "ts", "tsx", "js", "jsx", "py", "go", "rs", "java", "rb", "c", "cpp", "h", "hpp", "cs", "php",
    "swift", "kt", "scala", "sh", "yaml", "yml", "json",
];

fn path_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        let ext_alt = FILE_EXTENSIONS.join("|");
        Regex::new(&format!(r"`?([A-Za-z0-9_./-]+\.(?:{ext_alt}))`?")).expect("valid regex")
    })
}

fn extract_related_files(text: &str) -> Vec<String> {
    let mut set = std::collections::BTreeSet::new();
    for cap in path_regex().captures_iter(text) {
        set.insert(cap.get(1).unwrap().as_str().to_string());
    }
    set.into_iter().collect()
}

// --- Related symbols ---

const SYMBOL_STOPWORDS: &[&str] = &[
    "if", "for", "while", "return", "function", "class", "const", "let", "var", "def", "fn",
    "this", "self", "new", "true", "false", "null", "undefined", "import", "export", "from",
    "async", "await", "switch", "case", "catch", "try", "throw", "interface", "struct", "impl",
];

fn backtick_ident_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"`([A-Za-z_][A-Za-z0-9_]*)`").expect("valid regex"))
}

fn call_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b([A-Za-z_][A-Za-z0-9_]*)\s*\(").expect("valid regex"))
}

fn class_decl_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\b(?:class|struct|interface|trait|enum)\s+([A-Za-z_][A-Za-z0-9_]*)")
            .expect("valid regex")
    })
}

fn is_symbol_like(s: &str) -> bool {
    !s.is_empty()
        && !SYMBOL_STOPWORDS.contains(&s.to_lowercase().as_str())
        && s.chars().next().is_some_and(|c| c.is_alphabetic())
}

fn extract_related_symbols(text: &str) -> Vec<String> {
    let mut set = std::collections::BTreeSet::new();
    for cap in backtick_ident_regex().captures_iter(text) {
        let ident = cap.get(1).unwrap().as_str();
        if is_symbol_like(ident) {
            set.insert(ident.to_string());
        }
    }
    for cap in call_regex().captures_iter(text) {
        let ident = cap.get(1).unwrap().as_str();
        if is_symbol_like(ident) {
            set.insert(ident.to_string());
        }
    }
    for cap in class_decl_regex().captures_iter(text) {
        set.insert(cap.get(1).unwrap().as_str().to_string());
    }
    set.into_iter().collect()
}

/// Re-renders a canonical markdown body from a parsed result, covering only
/// the sections this parser recognizes. Used to check the round-trip law in
/// §8: `parse(render(parse(b))) == parse(b)` for bodies whose sections this
/// renderer preserves.
pub fn render(parsed: &ParsedIssueBody) -> String {
    let mut out = String::new();

    if !parsed.acceptance_criteria.is_empty() {
        out.push_str("## Acceptance Criteria\n\n");
        for c in &parsed.acceptance_criteria {
            let mark = if c.completed { "x" } else { " " };
            out.push_str(&format!("- [{mark}] {}\n", c.text));
        }
        out.push('\n');
    }

    let ctx = &parsed.context;
    if ctx.component.is_some() || ctx.service.is_some() || ctx.environment.is_some() || ctx.priority.is_some() {
        out.push_str("## Context\n\n");
        if let Some(v) = &ctx.component {
            out.push_str(&format!("Component: {v}\n"));
        }
        if let Some(v) = &ctx.service {
            out.push_str(&format!("Service: {v}\n"));
        }
        if let Some(v) = &ctx.environment {
            out.push_str(&format!("Environment: {v}\n"));
        }
        if let Some(v) = &ctx.priority {
            out.push_str(&format!("Priority: {v}\n"));
        }
        out.push('\n');
    }

    if !parsed.related_files.is_empty() {
        out.push_str("## Related Files\n\n");
        for f in &parsed.related_files {
            out.push_str(&format!("- `{f}`\n"));
        }
        out.push('\n');
    }

    out
}
