//! Challenge type normalization
//!
//! Component types in a CDF go through a normalization chain before lookup:
//! canonical names match case-insensitively, legacy aliases from older
//! definition formats map forward, and any id with a type definition file on
//! disk is accepted literally. Everything else is flagged unknown, and
//! validation turns the unknown into an error with near-match suggestions.

use serde::{Deserialize, Serialize};

use crate::definition::TypeDefStore;
use crate::error::{ControlError, ControlResult};

/// Built-in challenge types. On-disk type definitions can extend this set
/// without a rebuild.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChallengeType {
    FullOs,
    Web,
    Metasploit,
    Container,
    SqlInjection,
    RedBlue,
}

impl ChallengeType {
    pub const ALL: [ChallengeType; 6] = [
        ChallengeType::FullOs,
        ChallengeType::Web,
        ChallengeType::Metasploit,
        ChallengeType::Container,
        ChallengeType::SqlInjection,
        ChallengeType::RedBlue,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ChallengeType::FullOs => "full-os",
            ChallengeType::Web => "web",
            ChallengeType::Metasploit => "metasploit",
            ChallengeType::Container => "container",
            ChallengeType::SqlInjection => "sql-injection",
            ChallengeType::RedBlue => "redblue",
        }
    }

    /// Case-insensitive match against the canonical names.
    pub fn from_canonical(name: &str) -> Option<ChallengeType> {
        let lower = name.to_ascii_lowercase();
        ChallengeType::ALL
            .into_iter()
            .find(|t| t.as_str() == lower)
    }
}

impl std::fmt::Display for ChallengeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Spellings accepted from older challenge definitions, mapped to canonical
/// names. Lookup happens on the lowercased input.
const LEGACY_ALIASES: [(&str, &str); 12] = [
    ("fullos", "full-os"),
    ("full_os", "full-os"),
    ("webapp", "web"),
    ("web-app", "web"),
    ("msf", "metasploit"),
    ("docker", "container"),
    ("sqli", "sql-injection"),
    ("sql_injection", "sql-injection"),
    ("sqlinjection", "sql-injection"),
    ("red-blue", "redblue"),
    ("red_blue", "redblue"),
    ("attack-defense", "redblue"),
];

/// Result of running a type name through the normalization chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedType {
    pub name: String,
    pub known: bool,
}

/// Normalize a challenge type name.
///
/// Chain: canonical name (case-insensitive), then legacy alias, then a type
/// definition file on disk under the literal name. Unmatched names come back
/// unchanged with `known: false`. Running the output through a second pass
/// yields the same result.
pub fn normalize_challenge_type(name: &str, typedefs: &TypeDefStore) -> NormalizedType {
    let trimmed = name.trim();
    let lower = trimmed.to_ascii_lowercase();

    if let Some(canonical) = ChallengeType::from_canonical(&lower) {
        return NormalizedType {
            name: canonical.as_str().to_string(),
            known: true,
        };
    }
    if let Some((_, canonical)) = LEGACY_ALIASES.iter().find(|(alias, _)| *alias == lower) {
        return NormalizedType {
            name: (*canonical).to_string(),
            known: true,
        };
    }
    if typedefs.exists_on_disk(trimmed) {
        return NormalizedType {
            name: trimmed.to_string(),
            known: true,
        };
    }
    NormalizedType {
        name: trimmed.to_string(),
        known: false,
    }
}

/// Validate a challenge type name, returning the normalized form.
///
/// Unknown names produce an error whose message carries up to three
/// near-match suggestions and the full list of valid types.
pub fn validate_challenge_type(name: &str, typedefs: &TypeDefStore) -> ControlResult<String> {
    let normalized = normalize_challenge_type(name, typedefs);
    if normalized.known {
        return Ok(normalized.name);
    }

    let mut valid: Vec<String> = ChallengeType::ALL.iter().map(|t| t.as_str().to_string()).collect();
    for id in typedefs.known_type_ids() {
        if !valid.contains(&id) {
            valid.push(id);
        }
    }
    valid.sort();

    let suggestions = similar_type_ids(name, &valid);
    let mut message = String::new();
    if !suggestions.is_empty() {
        let quoted: Vec<String> = suggestions.iter().map(|s| format!("'{s}'")).collect();
        message.push_str(&format!("did you mean {}? ", quoted.join(", ")));
    }
    message.push_str(&format!("valid types are: {}", valid.join(", ")));

    Err(ControlError::UnknownChallengeType {
        name: name.trim().to_string(),
        message,
    })
}

const SUGGESTION_FLOOR: f64 = 0.7;
const MAX_SUGGESTIONS: usize = 3;

/// Candidates whose normalized similarity to `name` clears the floor, best
/// first, capped at three.
pub fn similar_type_ids(name: &str, candidates: &[String]) -> Vec<String> {
    let target = name.trim().to_ascii_lowercase();
    let mut scored: Vec<(f64, &String)> = candidates
        .iter()
        .map(|c| (similarity(&target, &c.to_ascii_lowercase()), c))
        .filter(|(score, _)| *score >= SUGGESTION_FLOOR)
        .collect();
    scored.sort_by(|a, b| b.0.total_cmp(&a.0));
    scored
        .into_iter()
        .take(MAX_SUGGESTIONS)
        .map(|(_, c)| c.clone())
        .collect()
}

/// Similarity in [0, 1]: 1.0 for identical strings, scaled by edit distance
/// over the longer length.
fn similarity(a: &str, b: &str) -> f64 {
    let max_len = a.chars().count().max(b.chars().count());
    if max_len == 0 {
        return 1.0;
    }
    1.0 - levenshtein(a, b) as f64 / max_len as f64
}

fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }

    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0usize; b.len() + 1];
    for (i, ca) in a.iter().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = usize::from(ca != cb);
            curr[j + 1] = (prev[j + 1] + 1).min(curr[j] + 1).min(prev[j] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b.len()]
}
