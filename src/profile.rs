// Per-player progress document.
// Serialized as camelCase JSON; every field has a default so partially
// written or older documents still decode.

use crate::catalog::Catalog;
use crate::config::{DEFAULT_AVATAR_ID, FIRST_CHAPTER_ID};
use crate::levels::calculate_level;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// ISO-8601 with millisecond precision and `Z` suffix
pub fn iso_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Insertion-ordered list of ids with duplicates suppressed
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct UniqueList(Vec<String>);

impl UniqueList {
    pub fn contains(&self, id: &str) -> bool {
        self.0.iter().any(|item| item == id)
    }

    /// Append if absent; returns whether the list changed
    pub fn insert(&mut self, id: impl Into<String>) -> bool {
        let id = id.into();
        if self.contains(&id) {
            return false;
        }
        self.0.push(id);
        true
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn to_vec(&self) -> Vec<String> {
        self.0.clone()
    }
}

impl FromIterator<String> for UniqueList {
    fn from_iter<I: IntoIterator<Item = String>>(iter: I) -> Self {
        let mut list = UniqueList::default();
        for id in iter {
            list.insert(id);
        }
        list
    }
}

impl<'de> Deserialize<'de> for UniqueList {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let items = Vec::<String>::deserialize(deserializer)?;
        Ok(items.into_iter().collect())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Inventory {
    pub tokens: u64,
    pub collectibles: Vec<Value>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TranslationPreference {
    #[default]
    Standard,
    Modern,
    Simple,
    Original,
}

impl TranslationPreference {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "standard" => Some(Self::Standard),
            "modern" => Some(Self::Modern),
            "simple" => Some(Self::Simple),
            "original" => Some(Self::Original),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Standard => "standard",
            Self::Modern => "modern",
            Self::Simple => "simple",
            Self::Original => "original",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    pub translation_preference: TranslationPreference,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ChallengeCompletion {
    pub completed_at: String,
    pub details: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReflectionEntry {
    pub content: String,
    pub timestamp: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ChapterProgress {
    pub is_unlocked: bool,
    pub is_started: bool,
    pub is_completed: bool,
    pub completed_sections: UniqueList,
    pub challenge_completions: BTreeMap<String, ChallengeCompletion>,
    pub reflections: BTreeMap<String, ReflectionEntry>,
    pub last_read_section: u32,
    pub last_visited: Option<String>,
    pub unlocked_at: Option<String>,
    pub completed_at: Option<String>,
}

impl ChapterProgress {
    /// Progress of a chapter nobody has opened yet.
    /// Only the first chapter starts unlocked.
    pub fn template(chapter_id: &str, now: &str) -> Self {
        let first = chapter_id == FIRST_CHAPTER_ID;
        ChapterProgress {
            is_unlocked: first,
            unlocked_at: first.then(|| now.to_string()),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Progress {
    pub chapters: BTreeMap<String, ChapterProgress>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UserProfile {
    pub name: String,
    pub xp: u64,
    pub level: u32,
    pub current_avatar_id: String,
    pub owned_nfts: UniqueList,
    pub inventory: Inventory,
    pub achievements: UniqueList,
    pub progress: Progress,
    pub settings: Settings,
    pub challenges_completed: u64,
    pub reflections_written: u64,
    pub streak: u32,
    pub last_login: Option<String>,
}

impl Default for UserProfile {
    fn default() -> Self {
        UserProfile {
            name: "Player".to_string(),
            xp: 0,
            level: 1,
            current_avatar_id: DEFAULT_AVATAR_ID.to_string(),
            owned_nfts: UniqueList::default(),
            inventory: Inventory::default(),
            achievements: UniqueList::default(),
            progress: Progress::default(),
            settings: Settings::default(),
            challenges_completed: 0,
            reflections_written: 0,
            streak: 0,
            last_login: None,
        }
    }
}

/// Result of a level recomputation that raised the level
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LevelUp {
    pub from: u32,
    pub to: u32,
    /// Avatar ids whose required level was crossed, lowest first
    pub unlocked_avatars: Vec<String>,
}

impl UserProfile {
    pub fn from_document(document: Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(document)
    }

    pub fn to_document(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(self)
    }

    pub fn chapter(&self, chapter_id: &str) -> Option<&ChapterProgress> {
        self.progress.chapters.get(chapter_id)
    }

    /// Re-establish `level == calculate_level(xp)`.
    /// On a level-up, the lowest avatar crossed on the way becomes owned
    /// and current. Higher crossed avatars are reported but not owned.
    pub fn reconcile_level(&mut self, catalog: &Catalog) -> Option<LevelUp> {
        let new_level = calculate_level(self.xp);
        if new_level <= self.level {
            self.level = new_level;
            return None;
        }

        let unlocked: Vec<String> = catalog
            .avatars_unlocked_between(self.level, new_level)
            .map(|a| a.id.clone())
            .collect();
        if let Some(first) = unlocked.first() {
            self.current_avatar_id = first.clone();
            self.owned_nfts.insert(first.clone());
        }

        let level_up = LevelUp {
            from: self.level,
            to: new_level,
            unlocked_avatars: unlocked,
        };
        self.level = new_level;
        Some(level_up)
    }
}
