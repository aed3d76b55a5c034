//! # Banned words
//!
//! Case-insensitive whole-word matching against a small built-in list plus whatever the
//! deployment configures.

use std::collections::HashSet;

const DEFAULT_BANNED: &[&str] = &[
    "asshole", "bastard", "bitch", "bollocks", "bullshit", "cock", "cunt", "dick", "fag",
    "faggot", "fuck", "fucker", "fucking", "motherfucker", "nigger", "prick", "pussy", "retard",
    "shit", "slut", "twat", "wanker", "whore",
];

#[derive(Debug, Clone)]
pub struct BannedWords {
    words: HashSet<String>,
}

impl Default for BannedWords {
    fn default() -> Self {
        Self::new(std::iter::empty::<String>())
    }
}

impl BannedWords {
    /// Built-in list extended with `extra`.
    pub fn new<I, S>(extra: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let words = DEFAULT_BANNED
            .iter()
            .map(|w| w.to_string())
            .chain(extra.into_iter().map(|w| w.as_ref().trim().to_lowercase()))
            .filter(|w| !w.is_empty())
            .collect();
        Self { words }
    }

    pub fn contains_banned_word(&self, text: &str) -> bool {
        text.split(|c: char| !c.is_alphanumeric())
            .filter(|token| !token.is_empty())
            .any(|token| self.words.contains(&token.to_lowercase()))
    }
}
