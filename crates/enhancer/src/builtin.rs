//! Built-in engines for plain text.
//!
//! Small, dependency-free engines used by the CLI and handy for smoke tests:
//!
//! | name        | mode         | writes                                   |
//! |-------------|--------------|------------------------------------------|
//! | `langid`    | synchronous  | topic annotation with the language       |
//! | `wordcount` | synchronous  | text annotation with word/sentence count |
//! | `keywords`  | asynchronous | text annotation per keyword mention      |

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tracing::debug;

use crate::{ContentItem, EngineError, EnhanceMode, Enhancement, EnhancementEngine, EnhancementKind, Metadata};

fn require_text<'a>(engine: &str, item: &'a ContentItem) -> Result<&'a str, EngineError> {
    item.text()
        .ok_or_else(|| EngineError::invalid_content(engine, "content is not UTF-8 text"))
}

fn words(text: &str) -> impl Iterator<Item = &str> {
    text.split(|c: char| !c.is_alphanumeric() && c != '\'')
        .filter(|w| !w.is_empty())
}

// ---------------------------------------------------------------------------
// Language identification
// ---------------------------------------------------------------------------

const STOPWORDS: &[(&str, &[&str])] = &[
    ("en", &["the", "and", "is", "of", "to", "in", "that", "it", "with", "for"]),
    ("de", &["der", "die", "und", "ist", "das", "nicht", "mit", "ein", "zu", "den"]),
    ("fr", &["le", "la", "et", "est", "les", "des", "un", "une", "dans", "pour"]),
    ("es", &["el", "los", "y", "es", "las", "del", "un", "una", "por", "con"]),
];

/// Guesses the language by counting stop words.
#[derive(Debug, Default)]
pub struct LanguageEngine;

impl LanguageEngine {
    pub const NAME: &'static str = "langid";

    /// Best matching language and the share of stop words that matched it.
    pub fn detect(text: &str) -> Option<(&'static str, f64)> {
        let lowered: Vec<String> = words(text).map(str::to_lowercase).collect();
        if lowered.is_empty() {
            return None;
        }
        let mut best: Option<(&'static str, usize)> = None;
        let mut total = 0usize;
        for &(lang, stopwords) in STOPWORDS {
            let hits = lowered.iter().filter(|w| stopwords.contains(&w.as_str())).count();
            total += hits;
            if hits > 0 && best.map_or(true, |(_, b)| hits > b) {
                best = Some((lang, hits));
            }
        }
        best.map(|(lang, hits)| (lang, hits as f64 / total as f64))
    }
}

#[async_trait]
impl EnhancementEngine for LanguageEngine {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn can_enhance(&self, item: &ContentItem) -> Result<EnhanceMode, EngineError> {
        Ok(match item.text() {
            Some(text) if !text.trim().is_empty() => EnhanceMode::Synchronous,
            _ => EnhanceMode::CannotEnhance,
        })
    }

    fn compute_enhancements(
        &self,
        item: &ContentItem,
        metadata: &mut Metadata,
    ) -> Result<(), EngineError> {
        let text = require_text(Self::NAME, item)?;
        match Self::detect(text) {
            Some((lang, confidence)) => {
                debug!("detected language '{lang}' ({confidence:.2}) for {}", item.uri());
                metadata.add(
                    Enhancement::new(Self::NAME, EnhancementKind::TopicAnnotation)
                        .with("language", lang)
                        .with("confidence", confidence),
                );
            }
            None => debug!("no language detected for {}", item.uri()),
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Word count
// ---------------------------------------------------------------------------

/// Counts words and sentences.
#[derive(Debug, Default)]
pub struct WordCountEngine;

impl WordCountEngine {
    pub const NAME: &'static str = "wordcount";
}

#[async_trait]
impl EnhancementEngine for WordCountEngine {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn can_enhance(&self, item: &ContentItem) -> Result<EnhanceMode, EngineError> {
        Ok(if item.text().is_some() {
            EnhanceMode::Synchronous
        } else {
            EnhanceMode::CannotEnhance
        })
    }

    fn compute_enhancements(
        &self,
        item: &ContentItem,
        metadata: &mut Metadata,
    ) -> Result<(), EngineError> {
        let text = require_text(Self::NAME, item)?;
        let word_count = words(text).count();
        let sentence_count = text
            .split(['.', '!', '?'])
            .filter(|s| !s.trim().is_empty())
            .count();
        metadata.add(
            Enhancement::new(Self::NAME, EnhancementKind::TextAnnotation)
                .with("words", word_count)
                .with("sentences", sentence_count),
        );
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Keyword spotting
// ---------------------------------------------------------------------------

/// A keyword to spot and the entity type to report for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Keyword {
    pub label: String,
    pub entity_type: String,
}

/// Finds case-insensitive mentions of configured keywords.
///
/// Scanning happens without any lock (the content is immutable); the results
/// are appended through [`ContentItem::add_enhancements`].
#[derive(Debug, Default)]
pub struct KeywordEngine {
    keywords: Arc<Vec<Keyword>>,
}

impl KeywordEngine {
    pub const NAME: &'static str = "keywords";

    pub fn new<I, L, T>(keywords: I) -> Self
    where
        I: IntoIterator<Item = (L, T)>,
        L: Into<String>,
        T: Into<String>,
    {
        let keywords = keywords
            .into_iter()
            .map(|(label, ty)| Keyword {
                label: label.into(),
                entity_type: ty.into(),
            })
            .filter(|k| !k.label.is_empty())
            .collect();
        Self {
            keywords: Arc::new(keywords),
        }
    }

    /// Byte offsets `(start, end)` of every match of every keyword.
    pub fn spot<'a>(&'a self, text: &str) -> Vec<(usize, usize, &'a Keyword)> {
        let haystack = text.to_lowercase();
        // Lowercasing may change byte lengths for non-ASCII text; offsets
        // are only reported when they still line up with the original.
        let aligned = haystack.len() == text.len();
        let mut found = Vec::new();
        for keyword in self.keywords.iter() {
            let needle = keyword.label.to_lowercase();
            let mut from = 0;
            while let Some(pos) = haystack[from..].find(&needle) {
                let start = from + pos;
                let end = start + needle.len();
                if aligned {
                    found.push((start, end, keyword));
                }
                from = end;
            }
        }
        found.sort_by_key(|(start, _, _)| *start);
        found
    }

    fn annotations(&self, text: &str) -> Vec<Enhancement> {
        self.spot(text)
            .into_iter()
            .map(|(start, end, keyword)| {
                Enhancement::new(Self::NAME, EnhancementKind::TextAnnotation)
                    .with("start", start)
                    .with("end", end)
                    .with("selected_text", text.get(start..end).unwrap_or_default())
                    .with("entity", json!({ "label": keyword.label, "type": keyword.entity_type }))
            })
            .collect()
    }
}

#[async_trait]
impl EnhancementEngine for KeywordEngine {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn can_enhance(&self, item: &ContentItem) -> Result<EnhanceMode, EngineError> {
        Ok(if item.text().is_some() && !self.keywords.is_empty() {
            EnhanceMode::Asynchronous
        } else {
            EnhanceMode::CannotEnhance
        })
    }

    fn compute_enhancements(
        &self,
        item: &ContentItem,
        metadata: &mut Metadata,
    ) -> Result<(), EngineError> {
        let text = require_text(Self::NAME, item)?;
        for annotation in self.annotations(text) {
            metadata.add(annotation);
        }
        Ok(())
    }

    async fn compute_enhancements_async(&self, item: &Arc<ContentItem>) -> Result<(), EngineError> {
        let text = require_text(Self::NAME, item)?;
        let annotations = self.annotations(text);
        debug!("{} keyword mentions in {}", annotations.len(), item.uri());
        item.add_enhancements(Self::NAME, annotations).await
    }
}

// ============================================================
// Unit tests
// ============================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_english_and_german() {
        let (lang, _) = LanguageEngine::detect("The cat is in the garden with the dog").unwrap();
        assert_eq!(lang, "en");
        let (lang, _) = LanguageEngine::detect("Der Hund und die Katze sind nicht im Haus").unwrap();
        assert_eq!(lang, "de");
        assert!(LanguageEngine::detect("xyzzy").is_none());
    }

    #[test]
    fn language_engine_skips_empty_text() {
        let item = ContentItem::from_text("   ");
        assert_eq!(LanguageEngine.can_enhance(&item), Ok(EnhanceMode::CannotEnhance));
    }

    #[test]
    fn word_count_counts_words_and_sentences() {
        let item = ContentItem::from_text("Paris is big. Berlin is bigger!");
        let mut metadata = Metadata::default();
        WordCountEngine.compute_enhancements(&item, &mut metadata).unwrap();
        let e = metadata.created_by(WordCountEngine::NAME).next().unwrap();
        assert_eq!(e.properties["words"], 6);
        assert_eq!(e.properties["sentences"], 2);
    }

    #[test]
    fn keyword_spotting_reports_offsets() {
        let engine = KeywordEngine::new([("Paris", "place"), ("apache", "organization")]);
        let found = engine.spot("Apache lives in paris, Paris!");
        let labels: Vec<(usize, usize, &str)> =
            found.iter().map(|(s, e, k)| (*s, *e, k.label.as_str())).collect();
        assert_eq!(
            labels,
            vec![(0, 6, "apache"), (16, 21, "Paris"), (23, 28, "Paris")]
        );
    }

    #[tokio::test]
    async fn keyword_engine_writes_annotations_asynchronously() {
        let engine = KeywordEngine::new([("Paris", "place")]);
        let item = Arc::new(ContentItem::from_text("I love Paris"));
        assert_eq!(engine.can_enhance(&item), Ok(EnhanceMode::Asynchronous));

        engine.compute_enhancements_async(&item).await.unwrap();
        let metadata = item.metadata();
        let e = metadata.created_by(KeywordEngine::NAME).next().unwrap();
        assert_eq!(e.properties["selected_text"], "Paris");
        assert_eq!(e.properties["entity"]["type"], "place");
    }

    #[test]
    fn binary_content_is_rejected() {
        let item = ContentItem::new("urn:bin", "application/octet-stream", vec![1, 2, 3]);
        let mut metadata = Metadata::default();
        assert!(WordCountEngine.compute_enhancements(&item, &mut metadata).is_err());
    }
}
