use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;

use crate::batch::{BatchItemResult, BatchResult, FailedItem, SucceededItem};
use crate::extract::{ExtractedFields, UNKNOWN};
use crate::identifier::Identifier;
use crate::validate::{cross_check, validate, Validation};

pub const SUMMARY_CHARS: usize = 300;
const KEYWORD_LEAD_CHARS: usize = 50;

pub const HEADER: [&str; 9] = [
    "ASIN",
    "Title",
    "Price",
    "Rating",
    "Copywriting summary",
    "Visual summary",
    "Review summary",
    "Market summary",
    "Status",
];

/// The four parts the analysis prompt asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Section {
    Copywriting,
    Visual,
    Reviews,
    Market,
}

impl Section {
    pub const ALL: [Section; 4] = [
        Section::Copywriting,
        Section::Visual,
        Section::Reviews,
        Section::Market,
    ];

    fn heading(self) -> &'static Regex {
        &HEADINGS[self as usize]
    }

    fn keywords(self) -> &'static [&'static str] {
        match self {
            Section::Copywriting => &["文案构建", "Copywriting", "文案"],
            Section::Visual => &["视觉资产", "Visual", "视觉"],
            Section::Reviews => &["评论", "Reviews", "Review"],
            Section::Market => &["市场", "Market"],
        }
    }
}

// Indexed by `Section as usize`.
static HEADINGS: LazyLock<[Regex; 4]> = LazyLock::new(|| {
    let h = |n: &str, cn: &str| {
        Regex::new(&format!(r"(?mi)^[#>*\s]*(?:part\s*{n}\b|第{cn}部分)[^\n]*$")).unwrap()
    };
    [h("1", "一"), h("2", "二"), h("3", "三"), h("4", "四")]
});

/// Up to [`SUMMARY_CHARS`] of one section of an analysis.
///
/// The section body runs from its heading line to the next part heading. If
/// the heading is missing, falls back to a window around the first section
/// keyword, starting a little before it. Empty if neither is found.
pub fn section_summary(analysis: &str, section: Section) -> String {
    if let Some(m) = section.heading().find(analysis) {
        let end = Section::ALL
            .iter()
            .filter_map(|s| s.heading().find_at(analysis, m.end()))
            .map(|next| next.start())
            .min()
            .unwrap_or(analysis.len());
        return clip(analysis[m.end()..end].trim(), SUMMARY_CHARS);
    }

    section
        .keywords()
        .iter()
        .find_map(|k| analysis.find(k))
        .map(|idx| {
            let start = analysis[..idx]
                .char_indices()
                .rev()
                .nth(KEYWORD_LEAD_CHARS - 1)
                .map(|(i, _)| i)
                .unwrap_or(0);
            clip(analysis[start..].trim(), SUMMARY_CHARS)
        })
        .unwrap_or_default()
}

fn clip(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((cut, _)) => format!("{}...", &s[..cut]),
        None => s.to_string(),
    }
}

/// Validation of each item, aligned with `result.items`; `None` for failed
/// items. A repeated identifier is also compared with its first result.
pub fn item_checks(result: &BatchResult) -> Vec<Option<Validation>> {
    let mut first_seen: HashMap<&Identifier, &ExtractedFields> = HashMap::new();
    result
        .items
        .iter()
        .map(|item| {
            let BatchItemResult::Succeeded(s) = item else {
                return None;
            };
            let e = &s.extracted;
            let mut v = validate(e);
            if let Some(first) = first_seen.get(&e.identifier).copied() {
                v.warnings
                    .extend(cross_check(first, e).iter().map(|d| d.to_string()));
            } else {
                first_seen.insert(&e.identifier, e);
            }
            Some(v)
        })
        .collect()
}

/// One row per item, in input order, matching [`HEADER`]. Failed items keep
/// their row with the failure in the status column.
pub fn table_rows(result: &BatchResult) -> Vec<Vec<String>> {
    result
        .items
        .iter()
        .zip(item_checks(result))
        .map(|(item, check)| match item {
            BatchItemResult::Succeeded(s) => success_row(s, &check.unwrap_or_default()),
            BatchItemResult::Failed(f) => failure_row(f),
        })
        .collect()
}

fn success_row(item: &SucceededItem, check: &Validation) -> Vec<String> {
    let e = &item.extracted;
    let analysis = &e.full_analysis;
    let mut row = vec![
        e.identifier.to_string(),
        e.title.clone(),
        e.price.clone(),
        e.rating.clone(),
    ];
    row.extend(Section::ALL.iter().map(|s| section_summary(analysis, *s)));
    row.push(check.status());
    row
}

fn failure_row(item: &FailedItem) -> Vec<String> {
    let id = item
        .identifier
        .as_ref()
        .map(|i| i.to_string())
        .unwrap_or_else(|| item.input.clone());
    let mut row = vec![id, UNKNOWN.into(), UNKNOWN.into(), UNKNOWN.into()];
    row.extend(std::iter::repeat(String::new()).take(Section::ALL.len()));
    row.push(status_text(item));
    row
}

pub fn status_text(item: &FailedItem) -> String {
    let stage = format!("{:?}", item.stage).to_lowercase();
    format!("failed ({}): {}", stage, item.error)
}

/// Markdown narrative: overview, one section per succeeded item with its
/// checks and full analysis, then the failed inputs with their errors.
pub fn markdown_report(result: &BatchResult) -> String {
    let summary = &result.summary;
    let checks = item_checks(result);
    let flagged = checks.iter().flatten().filter(|v| !v.is_valid()).count();
    let mut md = String::new();

    md.push_str("# Competitor Analysis Report\n\n");
    md.push_str("## Overview\n\n");
    md.push_str(&format!("- Products analysed: {}\n", summary.succeeded));
    md.push_str(&format!("- Date: {}\n", summary.finished_at.format("%Y-%m-%d")));
    md.push_str(&format!("- Success rate: {}/{}\n", summary.succeeded, summary.total));
    md.push_str(&format!("- Flagged by validation: {}\n\n", flagged));
    md.push_str("---\n\n");

    let products = result.items.iter().zip(&checks).filter_map(|(item, check)| match item {
        BatchItemResult::Succeeded(s) => Some((s.as_ref(), check.clone().unwrap_or_default())),
        BatchItemResult::Failed(_) => None,
    });
    for (n, (item, check)) in products.enumerate() {
        let e = &item.extracted;
        let analysis = if e.full_analysis.trim().is_empty() {
            "No analysis available."
        } else {
            e.full_analysis.as_str()
        };
        let verdict = match (check.is_valid(), check.warnings.is_empty()) {
            (false, _) => "suspect",
            (true, false) => "passed with warnings",
            (true, true) => "passed",
        };
        md.push_str(&format!("## Product {}: {}\n\n", n + 1, item.identifier));
        md.push_str("### Basics\n");
        md.push_str(&format!("- Title: {}\n", e.title));
        md.push_str(&format!("- Price: {}\n", e.price));
        md.push_str(&format!("- Rating: {}\n", e.rating));
        md.push_str(&format!("- Check: {}\n\n", verdict));
        if !check.issues.is_empty() || !check.warnings.is_empty() {
            md.push_str("### Validation\n");
            for issue in &check.issues {
                md.push_str(&format!("- Issue: {}\n", issue));
            }
            for warning in &check.warnings {
                md.push_str(&format!("- Warning: {}\n", warning));
            }
            md.push('\n');
        }
        md.push_str("### Analysis\n\n");
        md.push_str(&format!("{}\n\n", analysis));
        md.push_str("---\n\n");
    }

    let mut failed = result.failed().peekable();
    if failed.peek().is_some() {
        md.push_str("## Failed items\n\n");
        for f in failed {
            md.push_str(&format!("- **{}** ({:?}): {}\n", f.input, f.stage, f.error));
        }
    }

    md
}
