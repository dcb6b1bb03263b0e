use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

static BARE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[A-Za-z0-9]{10}$").unwrap());

// Tried in order; each captures the embedded code, which must end at a path/query boundary.
// The marketplace pattern needs at least one path segment before the code.
static URL_RES: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)/dp/([A-Z0-9]{10})(?:[/?#&]|$)",
        r"(?i)/gp/product/([A-Z0-9]{10})(?:[/?#&]|$)",
        r"(?i)amazon\.(?:com|co\.uk|de|es|fr|it|ca|co\.jp)/[^?#\s]*/([A-Z0-9]{10})(?:[/?#&]|$)",
    ]
    .iter()
    .map(|p| Regex::new(p).unwrap())
    .collect()
});

/// Canonical product code (ASIN): ten uppercase alphanumerics.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identifier(String);

impl Identifier {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Parse a raw code or product URL. `None` means nothing usable was found.
pub fn normalize(input: &str) -> Option<Identifier> {
    let trimmed = input.trim();
    if BARE_RE.is_match(trimmed) {
        return Some(Identifier(trimmed.to_ascii_uppercase()));
    }

    URL_RES
        .iter()
        .find_map(|re| re.captures(trimmed))
        .map(|caps| Identifier(caps[1].to_ascii_uppercase()))
}

pub fn product_url(id: &Identifier, domain: &str) -> String {
    format!("https://www.{}/dp/{}", domain, id)
}
