//! Scene-level records: briefs, raw drafts, fingerprints, and chapter buffers.

use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

static WORD_TOKEN: Lazy<Regex> = Lazy::new(|| Regex::new(r"[A-Za-z0-9']+").expect("valid regex"));

/// Count prose words the same way everywhere (counters, briefs, stats).
pub fn count_words(text: &str) -> u32 {
    WORD_TOKEN.find_iter(text).count() as u32
}

/// Lowercased alphanumeric tokens for fingerprint similarity.
fn normalized_tokens(text: &str) -> Vec<String> {
    WORD_TOKEN
        .find_iter(&text.to_lowercase())
        .map(|m| m.as_str().to_string())
        .collect()
}

// ============================================================================
// Scene identity
// ============================================================================

/// Position of a scene within the book: (act, chapter, scene).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SceneId {
    pub act: u32,
    pub chapter: u32,
    pub scene: u32,
}

impl fmt::Display for SceneId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "a{}.c{}.s{}", self.act, self.chapter, self.scene)
    }
}

// ============================================================================
// Planner output
// ============================================================================

/// Ephemeral planner output describing one scene to be written.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SceneBrief {
    /// What the scene must accomplish
    pub goal: String,
    /// Point-of-view character
    pub pov: String,
    /// Where the scene takes place
    pub setting: String,
    /// Beats the writer must hit, in order
    #[serde(default)]
    pub obligatory_beats: Vec<String>,
    /// Narrative functions and information the scene must not repeat,
    /// derived from the repetition registry
    #[serde(default)]
    pub forbidden_repetitions: Vec<String>,
    /// Word-count target for the draft
    pub word_target: u32,
}

// ============================================================================
// Writer output
// ============================================================================

/// Raw scene prose as produced by the writer, before editing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawScene {
    pub scene_id: String,
    pub scene_title: String,
    pub pov: String,
    pub content: String,
    pub word_count: u32,
}

// ============================================================================
// Fingerprints
// ============================================================================

/// Compact structural descriptor of an accepted scene, used for repetition
/// detection against the registry ring.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SceneFingerprint {
    pub scene_id: String,
    /// What the scene does for the story (e.g. "reveal", "confrontation")
    pub narrative_function: String,
    /// Information the reader learns here for the first time
    #[serde(default)]
    pub new_information: Vec<String>,
    pub pov: String,
    pub location_tag: String,
    /// Coarse shape of the scene's beats (e.g. "quiet-build-break")
    pub beat_shape_signature: String,
}

impl SceneFingerprint {
    /// Fingerprint used when the editor is skipped (draft mode) or when a
    /// scene is lossy-accepted: unknown function, no new information.
    pub fn minimal(scene_id: &str) -> Self {
        Self {
            scene_id: scene_id.to_string(),
            narrative_function: "unknown".to_string(),
            ..Self::default()
        }
    }

    /// Normalized token Jaccard over the two fingerprints' new information.
    /// Returns 0.0 when either side carries no information at all.
    pub fn new_information_similarity(&self, other: &Self) -> f64 {
        let a: std::collections::BTreeSet<String> = self
            .new_information
            .iter()
            .flat_map(|s| normalized_tokens(s))
            .collect();
        let b: std::collections::BTreeSet<String> = other
            .new_information
            .iter()
            .flat_map(|s| normalized_tokens(s))
            .collect();
        if a.is_empty() || b.is_empty() {
            return 0.0;
        }
        let intersection = a.intersection(&b).count() as f64;
        let union = a.union(&b).count() as f64;
        intersection / union
    }
}

// ============================================================================
// Chapter buffer
// ============================================================================

/// One scene as it sits in a chapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChapterScene {
    pub title: String,
    pub content: String,
    pub word_count: u32,
}

/// In-memory accumulator for the chapter being written. Closed and reset by
/// the orchestrator once `total_words` crosses the roll threshold.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChapterBuffer {
    /// Chapter number, 1-indexed
    pub index: u32,
    pub title: String,
    #[serde(default)]
    pub scenes: Vec<ChapterScene>,
    pub total_words: u32,
}

impl ChapterBuffer {
    pub fn new(index: u32) -> Self {
        Self {
            index,
            title: format!("Chapter {index}"),
            scenes: Vec::new(),
            total_words: 0,
        }
    }

    pub fn push_scene(&mut self, title: String, content: String, word_count: u32) {
        self.scenes.push(ChapterScene {
            title,
            content,
            word_count,
        });
        self.total_words += word_count;
    }

    /// Fold content into the last scene of this chapter. Returns false when
    /// the buffer is empty and there is nothing to merge into.
    pub fn merge_into_last(&mut self, content: &str, word_count: u32) -> bool {
        match self.scenes.last_mut() {
            Some(last) => {
                last.content.push_str("\n\n");
                last.content.push_str(content);
                last.word_count += word_count;
                self.total_words += word_count;
                true
            }
            None => false,
        }
    }

    pub fn should_roll(&self, roll_threshold: u32) -> bool {
        self.total_words >= roll_threshold
    }

    pub fn is_empty(&self) -> bool {
        self.scenes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fingerprint(id: &str, function: &str, info: &[&str]) -> SceneFingerprint {
        SceneFingerprint {
            scene_id: id.to_string(),
            narrative_function: function.to_string(),
            new_information: info.iter().map(|s| s.to_string()).collect(),
            pov: "Maren".to_string(),
            location_tag: "lighthouse".to_string(),
            beat_shape_signature: "quiet-build-break".to_string(),
        }
    }

    #[test]
    fn test_count_words() {
        assert_eq!(count_words("The lamp went out."), 4);
        assert_eq!(count_words("  "), 0);
        assert_eq!(count_words("it's one word"), 3);
    }

    #[test]
    fn test_similarity_identical_information() {
        let a = fingerprint("1", "reveal", &["the keeper's brother drowned here"]);
        let b = fingerprint("2", "reveal", &["the keeper's brother drowned here"]);
        assert!(a.new_information_similarity(&b) > 0.99);
    }

    #[test]
    fn test_similarity_disjoint_information() {
        let a = fingerprint("1", "reveal", &["storm warnings arrive"]);
        let b = fingerprint("2", "reveal", &["letters hidden beneath floorboards"]);
        assert_eq!(a.new_information_similarity(&b), 0.0);
    }

    #[test]
    fn test_similarity_empty_is_zero() {
        let a = SceneFingerprint::minimal("1");
        let b = fingerprint("2", "unknown", &["something"]);
        assert_eq!(a.new_information_similarity(&b), 0.0);
        assert_eq!(a.new_information_similarity(&SceneFingerprint::minimal("3")), 0.0);
    }

    #[test]
    fn test_similarity_is_case_and_punctuation_insensitive() {
        let a = fingerprint("1", "reveal", &["The Brother DROWNED, here."]);
        let b = fingerprint("2", "reveal", &["the brother drowned here"]);
        assert!(a.new_information_similarity(&b) > 0.99);
    }

    #[test]
    fn test_chapter_roll_threshold() {
        let mut chapter = ChapterBuffer::new(1);
        chapter.push_scene("Arrival".into(), "words ".repeat(100), 2_000);
        assert!(!chapter.should_roll(3_500));
        chapter.push_scene("The Lamp".into(), "words ".repeat(100), 1_600);
        assert!(chapter.should_roll(3_500));
        assert_eq!(chapter.total_words, 3_600);
    }

    #[test]
    fn test_merge_into_last() {
        let mut chapter = ChapterBuffer::new(2);
        assert!(!chapter.merge_into_last("orphan content", 50));

        chapter.push_scene("Watch".into(), "First stretch.".into(), 2);
        assert!(chapter.merge_into_last("Second stretch.", 2));
        assert_eq!(chapter.scenes.len(), 1);
        assert_eq!(chapter.scenes[0].word_count, 4);
        assert!(chapter.scenes[0].content.contains("Second stretch."));
        assert_eq!(chapter.total_words, 4);
    }
}
