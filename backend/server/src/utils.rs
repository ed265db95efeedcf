use std::{collections::BTreeSet, sync::LazyLock};

use regex::Regex;

static UNDERSCORES: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[_]").expect("valid regex"));
static DISALLOWED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^A-Za-z0-9- ]").expect("valid regex"));
static SPACES: LazyLock<Regex> = LazyLock::new(|| Regex::new(r" +").expect("valid regex"));

/// Lower-cases, strips punctuation and collapses whitespace, so `" Baked_Goods!"`
/// and `"baked goods"` name the same food type.
pub fn sanitize(input: &str) -> String {
    let s = UNDERSCORES.replace_all(input, " ");
    let s = DISALLOWED.replace_all(&s, "");

    SPACES.replace_all(s.trim(), " ").to_lowercase()
}

/// Sanitized, de-duplicated and sorted. Names that sanitize to nothing are dropped.
pub fn normalize_food_types<S: AsRef<str>>(food_types: &[S]) -> Vec<String> {
    food_types
        .iter()
        .map(|food_type| sanitize(food_type.as_ref()))
        .filter(|food_type| !food_type.is_empty())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}
