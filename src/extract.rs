use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::identifier::Identifier;

/// Value of a field no rule matched. Distinct from an empty match.
pub const UNKNOWN: &str = "unknown";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    Title,
    Price,
    Rating,
}

#[derive(Debug, Clone)]
pub struct Rule {
    pub field: Field,
    pub pattern: Regex,
}

/// Build rules from `(field, pattern)` pairs. Each pattern needs one capture group.
pub fn rules(specs: &[(Field, &str)]) -> Result<Vec<Rule>, regex::Error> {
    specs
        .iter()
        .map(|(field, p)| {
            Ok(Rule {
                field: *field,
                pattern: Regex::new(p)?,
            })
        })
        .collect()
}

// Label vocabulary follows the prompt template; Chinese labels take priority.
// Price and rating skip any non-digit prefix (currency symbols, "out of" text,
// even line breaks) and keep the number as text.
const DEFAULT_SPECS: &[(Field, &str)] = &[
    (Field::Title, r"产品标题[：:]+([^\n]+)"),
    (Field::Title, r"Title[：:]+([^\n]+)"),
    (Field::Title, r"\*\*(?:产品标题|Title)\*\*\s*[：:]+([^\n]+)"),
    (Field::Price, r"价格[：:]+[^0-9]*([0-9]+(?:[.,][0-9]+)*)"),
    (Field::Price, r"Price[：:]+[^0-9]*([0-9]+(?:[.,][0-9]+)*)"),
    (Field::Price, r"\*\*(?:价格|Price)\*\*\s*[：:]+[^0-9]*([0-9]+(?:[.,][0-9]+)*)"),
    (Field::Rating, r"评分[：:]+[^0-9]*([0-9]+(?:\.[0-9]+)?)"),
    (Field::Rating, r"Rating[：:]+[^0-9]*([0-9]+(?:\.[0-9]+)?)"),
    (Field::Rating, r"\*\*(?:评分|Rating)\*\*\s*[：:]+[^0-9]*([0-9]+(?:\.[0-9]+)?)"),
];

static DEFAULT_RULES: LazyLock<Vec<Rule>> = LazyLock::new(|| rules(DEFAULT_SPECS).unwrap());

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractedFields {
    pub identifier: Identifier,
    pub title: String,
    pub price: String,
    pub rating: String,
    pub full_analysis: String,
}

pub fn is_known(value: &str) -> bool {
    value != UNKNOWN
}

/// Pull title, price and rating out of the model's answer with the default rules.
///
/// Fields are kept as text. If the answer's format drifts, a field can be
/// filled from an unrelated line, or fall back to [`UNKNOWN`]; the checks in
/// `validate` catch most of that.
pub fn extract(text: &str, identifier: &Identifier) -> ExtractedFields {
    extract_with(&DEFAULT_RULES, text, identifier)
}

pub fn extract_with(rules: &[Rule], text: &str, identifier: &Identifier) -> ExtractedFields {
    let field = |f: Field| first_match(rules, f, text).unwrap_or_else(|| UNKNOWN.to_string());
    ExtractedFields {
        identifier: identifier.clone(),
        title: field(Field::Title),
        price: field(Field::Price),
        rating: field(Field::Rating),
        full_analysis: text.to_string(),
    }
}

fn first_match(rules: &[Rule], field: Field, text: &str) -> Option<String> {
    rules
        .iter()
        .filter(|r| r.field == field)
        .find_map(|r| r.pattern.captures(text))
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().trim().trim_matches('*').trim().to_string())
}
