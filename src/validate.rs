use std::fmt;
use std::sync::LazyLock;

use regex::Regex;

use crate::extract::{ExtractedFields, UNKNOWN};

pub const MIN_TITLE_CHARS: usize = 10;
pub const MAX_TITLE_CHARS: usize = 500;
pub const MIN_PRICE: f64 = 0.01;
pub const MAX_PRICE: f64 = 100_000.0;
const MIN_TITLE_SIMILARITY: f64 = 0.5;
const MAX_PRICE_DRIFT: f64 = 0.3;

// Words that show up when the page's main product was missed.
const OFF_PRODUCT_MARKERS: &[&str] = &["sponsored", "advertisement", "recommended"];

static CODE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\b[A-Z0-9]{10}\b").unwrap());

/// Problems found in one item's extracted fields. Issues mean the data is
/// probably from the wrong product; warnings mean it is incomplete or odd.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Validation {
    pub issues: Vec<String>,
    pub warnings: Vec<String>,
}

impl Validation {
    pub fn is_valid(&self) -> bool {
        self.issues.is_empty()
    }

    pub fn status(&self) -> String {
        let issues = self.issues.join("; ");
        let warnings = self.warnings.join("; ");
        match (self.issues.is_empty(), self.warnings.is_empty()) {
            (true, true) => "ok".to_string(),
            (true, false) => format!("ok; warnings: {}", warnings),
            (false, true) => format!("suspect: {}", issues),
            (false, false) => format!("suspect: {}; warnings: {}", issues, warnings),
        }
    }
}

fn known(value: &str) -> Option<&str> {
    let v = value.trim();
    (v != UNKNOWN && !v.is_empty()).then_some(v)
}

/// Price text to a number. Handles `1,299.00`, `1.299,00`, `139,99` and
/// currency symbols. A lone separator followed by exactly three digits is
/// read as a thousands separator.
pub fn parse_price(raw: &str) -> Option<f64> {
    let cleaned: String = raw
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == ',' || *c == '.')
        .collect();
    if !cleaned.chars().any(|c| c.is_ascii_digit()) {
        return None;
    }

    let last_sep = cleaned.rfind([',', '.']);
    let normalized = match last_sep {
        None => cleaned,
        Some(pos) => {
            let sep = cleaned[pos..].chars().next().unwrap_or('.');
            let mixed = cleaned.contains(',') && cleaned.contains('.');
            let digits_after = cleaned.len() - pos - 1;
            let decimal = mixed || (cleaned.matches(sep).count() == 1 && digits_after != 3);
            if decimal {
                let (int, frac) = cleaned.split_at(pos);
                let int: String = int.chars().filter(char::is_ascii_digit).collect();
                format!("{}.{}", int, &frac[1..])
            } else {
                cleaned.chars().filter(char::is_ascii_digit).collect()
            }
        }
    };
    normalized.parse().ok()
}

pub fn parse_rating(raw: &str) -> Option<f64> {
    raw.trim().replace(',', ".").parse().ok()
}

/// Sanity checks on extracted fields.
pub fn validate(fields: &ExtractedFields) -> Validation {
    let mut v = Validation::default();

    match known(&fields.title) {
        None => v.issues.push("missing product title".to_string()),
        Some(title) => {
            let len = title.chars().count();
            if len < MIN_TITLE_CHARS {
                v.issues.push(format!("title too short: \"{}\"", title));
            }
            if len > MAX_TITLE_CHARS {
                v.warnings.push("title unusually long".to_string());
            }

            // Only tokens shaped like an ASIN: letters and digits both present.
            let codes: Vec<&str> = CODE_RE
                .find_iter(title)
                .map(|m| m.as_str())
                .filter(|c| c.chars().any(|ch| ch.is_ascii_digit()))
                .filter(|c| c.chars().any(|ch| ch.is_ascii_alphabetic()))
                .collect();
            if !codes.is_empty() && !codes.contains(&fields.identifier.as_str()) {
                v.issues.push(format!(
                    "ASIN mismatch: expected {}, found {} in title",
                    fields.identifier, codes[0]
                ));
            }

            let lower = title.to_lowercase();
            for marker in OFF_PRODUCT_MARKERS {
                if lower.contains(marker) {
                    v.issues.push(format!("title contains \"{}\"", marker));
                }
            }
        }
    }

    match known(&fields.price) {
        None => v.warnings.push("missing price".to_string()),
        Some(raw) => match parse_price(raw) {
            None => v.warnings.push(format!("unparseable price: {}", raw)),
            Some(p) if p < MIN_PRICE => v.issues.push(format!("price too low: {}", p)),
            Some(p) if p > MAX_PRICE => v.warnings.push(format!("price unusually high: {}", p)),
            Some(_) => {}
        },
    }

    match known(&fields.rating) {
        None => v.warnings.push("missing rating".to_string()),
        Some(raw) => match parse_rating(raw) {
            None => v.warnings.push(format!("unparseable rating: {}", raw)),
            Some(r) if !(1.0..=5.0).contains(&r) => {
                v.issues.push(format!("invalid rating: {} (must be 1-5)", r))
            }
            Some(_) => {}
        },
    }

    v
}

/// A field on which two results for the same product disagree.
#[derive(Debug, Clone, PartialEq)]
pub struct Difference {
    pub field: &'static str,
    pub first: String,
    pub second: String,
    /// Title similarity, or relative price difference.
    pub score: f64,
}

impl fmt::Display for Difference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let clip = |s: &str| s.chars().take(100).collect::<String>();
        write!(
            f,
            "{} differs from earlier result ({} vs {}; score {:.2})",
            self.field,
            clip(&self.first),
            clip(&self.second),
            self.score
        )
    }
}

/// Compare two results for the same product: titles less than half similar,
/// or prices more than 30% apart.
pub fn cross_check(first: &ExtractedFields, second: &ExtractedFields) -> Vec<Difference> {
    let mut diffs = Vec::new();

    if let (Some(a), Some(b)) = (known(&first.title), known(&second.title)) {
        let score = similarity(a, b);
        if score < MIN_TITLE_SIMILARITY {
            diffs.push(Difference {
                field: "title",
                first: a.to_string(),
                second: b.to_string(),
                score,
            });
        }
    }

    let price = |f: &ExtractedFields| known(&f.price).and_then(parse_price);
    if let (Some(a), Some(b)) = (price(first), price(second)) {
        let drift = (a - b).abs() / a.max(b);
        if drift > MAX_PRICE_DRIFT {
            diffs.push(Difference {
                field: "price",
                first: a.to_string(),
                second: b.to_string(),
                score: drift,
            });
        }
    }

    diffs
}

/// 1.0 for identical strings, 0.0 for nothing in common (edit distance over
/// the longer length).
pub fn similarity(a: &str, b: &str) -> f64 {
    let longest = a.chars().count().max(b.chars().count());
    if longest == 0 {
        return 1.0;
    }
    (longest - levenshtein(a, b)) as f64 / longest as f64
}

fn levenshtein(a: &str, b: &str) -> usize {
    let b: Vec<char> = b.chars().collect();
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut cur = vec![0; b.len() + 1];
    for (i, ca) in a.chars().enumerate() {
        cur[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = usize::from(ca != *cb);
            cur[j + 1] = (prev[j] + cost).min(prev[j + 1] + 1).min(cur[j] + 1);
        }
        std::mem::swap(&mut prev, &mut cur);
    }
    prev[b.len()]
}
