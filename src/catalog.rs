// Static content catalogs: avatars, chapters and achievements.
// Read-only for the whole module; operations look entries up by string id.

use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use thiserror::Error;

/// An id that names no catalog content
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ContentError {
    #[error("Unknown chapter {0}")]
    UnknownChapter(String),
    #[error("Unknown section {section} in chapter {chapter}")]
    UnknownSection { chapter: String, section: String },
    #[error("Unknown challenge {challenge} in chapter {chapter}")]
    UnknownChallenge { chapter: String, challenge: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Avatar {
    pub id: String,
    pub name: String,
    pub image_url: String,
    pub required_level: u32,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub special: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Section {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub reflection_prompt: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChallengeKind {
    List,
    Journal,
    Reflection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Challenge {
    pub id: String,
    pub title: String,
    pub xp_reward: u64,
    #[serde(rename = "type")]
    pub kind: ChallengeKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chapter {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    /// Chapter unlocked when this one is completed
    #[serde(default)]
    pub next: Option<String>,
    pub sections: Vec<Section>,
    #[serde(default)]
    pub challenges: Vec<Challenge>,
}

impl Chapter {
    pub fn section_index(&self, section_id: &str) -> Option<usize> {
        self.sections.iter().position(|s| s.id == section_id)
    }

    pub fn section_ids(&self) -> impl Iterator<Item = &str> {
        self.sections.iter().map(|s| s.id.as_str())
    }

    pub fn challenge(&self, challenge_id: &str) -> Option<&Challenge> {
        self.challenges.iter().find(|c| c.id == challenge_id)
    }
}

/// What an achievement counts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AchievementCondition {
    Streak,
    ChapterComplete,
    ChaptersComplete,
    Reflections,
    TotalReflections,
    TotalChallenges,
    PerfectChallenges,
    MorningSessions,
    EveningReflections,
    Special,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Achievement {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub condition: AchievementCondition,
    #[serde(default)]
    pub required_value: Option<u64>,
    pub xp_reward: u64,
    #[serde(default)]
    pub special: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Catalog {
    #[serde(default)]
    pub avatars: Vec<Avatar>,
    #[serde(default)]
    pub chapters: Vec<Chapter>,
    #[serde(default)]
    pub achievements: Vec<Achievement>,
}

impl Catalog {
    /// Load a custom catalog, e.g. a localized edition of the text
    #[cfg(test)]
    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    /// The Stoic Quest catalog shipped with the module
    pub fn builtin() -> &'static Catalog {
        static BUILTIN: OnceLock<Catalog> = OnceLock::new();
        BUILTIN.get_or_init(build_stoic_quest)
    }

    pub fn chapter(&self, id: &str) -> Option<&Chapter> {
        self.chapters.iter().find(|c| c.id == id)
    }

    pub fn avatar(&self, id: &str) -> Option<&Avatar> {
        self.avatars.iter().find(|a| a.id == id)
    }

    pub fn achievement(&self, id: &str) -> Option<&Achievement> {
        self.achievements.iter().find(|a| a.id == id)
    }

    /// A section of a known chapter, with its position in the chapter.
    /// Reflections are keyed by section id and use the same lookup.
    pub fn section(&self, chapter_id: &str, section_id: &str) -> Result<(&Chapter, usize), ContentError> {
        let chapter = self
            .chapter(chapter_id)
            .ok_or_else(|| ContentError::UnknownChapter(chapter_id.to_string()))?;
        let index = chapter.section_index(section_id).ok_or_else(|| ContentError::UnknownSection {
            chapter: chapter_id.to_string(),
            section: section_id.to_string(),
        })?;
        Ok((chapter, index))
    }

    pub fn known_challenge(&self, chapter_id: &str, challenge_id: &str) -> Result<&Challenge, ContentError> {
        self.chapter(chapter_id)
            .ok_or_else(|| ContentError::UnknownChapter(chapter_id.to_string()))?
            .challenge(challenge_id)
            .ok_or_else(|| ContentError::UnknownChallenge {
                chapter: chapter_id.to_string(),
                challenge: challenge_id.to_string(),
            })
    }

    /// Avatars whose required level lies in (from, to]
    pub fn avatars_unlocked_between(&self, from: u32, to: u32) -> impl Iterator<Item = &Avatar> {
        self.avatars
            .iter()
            .filter(move |a| a.required_level > from && a.required_level <= to)
    }
}

// ==================== BUILT-IN STOIC QUEST CONTENT ====================

fn avatar(id: &str, name: &str, image_url: &str, required_level: u32, description: &str) -> Avatar {
    Avatar {
        id: id.to_string(),
        name: name.to_string(),
        image_url: image_url.to_string(),
        required_level,
        description: description.to_string(),
        special: false,
    }
}

fn section(id: &str, title: &str, prompt: &str) -> Section {
    Section {
        id: id.to_string(),
        title: title.to_string(),
        reflection_prompt: Some(prompt.to_string()),
    }
}

fn challenge(id: &str, title: &str, xp_reward: u64, kind: ChallengeKind) -> Challenge {
    Challenge {
        id: id.to_string(),
        title: title.to_string(),
        xp_reward,
        kind,
    }
}

fn achievement(
    id: &str,
    title: &str,
    description: &str,
    condition: AchievementCondition,
    required_value: Option<u64>,
    xp_reward: u64,
) -> Achievement {
    Achievement {
        id: id.to_string(),
        title: title.to_string(),
        description: description.to_string(),
        condition,
        required_value,
        xp_reward,
        special: false,
    }
}

fn build_stoic_quest() -> Catalog {
    use AchievementCondition::*;
    use ChallengeKind::*;

    let mut epictetus = avatar(
        "epictetus",
        "Epictetus",
        "avatars/epictetus.png",
        30,
        "Master of Stoic philosophy",
    );
    epictetus.special = true;

    let avatars = vec![
        avatar("novice", "Novice", "/assets/images/avatars/novice.png", 1, "Taking the first steps on the Stoic path"),
        avatar("apprentice", "Apprentice", "/assets/images/avatars/apprentice.png", 5, "Beginning to grasp key Stoic principles"),
        avatar("practitioner", "Practitioner", "avatars/practitioner.png", 10, "Regularly applying Stoic practices in daily life"),
        avatar("scholar", "Scholar", "avatars/scholar.png", 15, "Deep understanding of Stoic philosophy"),
        avatar("sage", "Sage", "avatars/sage.png", 20, "Embodying Stoic wisdom in thought and action"),
        epictetus,
    ];

    let chapters = vec![
        Chapter {
            id: "1".to_string(),
            title: "What Is In Our Power".to_string(),
            description: "Understanding what we can and cannot control".to_string(),
            next: Some("2".to_string()),
            sections: vec![
                section("1-1", "Introduction to Control", "What things in your life do you try to control that might actually be outside your control?"),
                section("1-2", "The Nature of Control", "How has attempting to control the uncontrollable created suffering in your life?"),
                section("1-3", "Freedom Through Acceptance", "What would your life look like if you fully accepted what is outside your control?"),
            ],
            challenges: vec![
                challenge("1-c1", "Dichotomy of Control Exercise", 30, List),
                challenge("1-c2", "Daily Reflection Practice", 40, Journal),
            ],
        },
        Chapter {
            id: "2".to_string(),
            title: "Desire and Aversion".to_string(),
            description: "Managing what we want and what we avoid".to_string(),
            next: Some("3".to_string()),
            sections: vec![
                section("2-1", "The Goal of Desires", "What lesser desires might be distracting you from what truly matters?"),
                section("2-2", "Freedom from Disappointment", "How has pursuing external success affected your inner tranquility?"),
                section("2-3", "Practice of Aversion", "Which aversions would lose their hold if you saw them as mere appearances?"),
            ],
            challenges: vec![
                challenge("2-c1", "Desire Inventory", 30, List),
                challenge("2-c2", "A Day Without Complaint", 40, Journal),
            ],
        },
        Chapter {
            id: "3".to_string(),
            title: "On Attachment".to_string(),
            description: "Holding what we love with open hands".to_string(),
            next: Some("4".to_string()),
            sections: vec![
                section("3-1", "Remember What Things Are", "What do you treat as permanent that is by nature fragile?"),
                section("3-2", "The Jug and the Loved One", "How would you hold your relationships if you remembered they are on loan?"),
            ],
            challenges: vec![
                challenge("3-c1", "Negative Visualization", 35, Reflection),
            ],
        },
        Chapter {
            id: "4".to_string(),
            title: "Facing Challenges".to_string(),
            description: "Using every difficulty as training".to_string(),
            next: Some("5".to_string()),
            sections: vec![
                section("4-1", "Preparing for the Bath", "Which daily situations reliably disturb you, and how could you prepare for them?"),
                section("4-2", "Keeping Your Will in Harmony with Nature", "What would it mean to want things to happen as they do happen?"),
            ],
            challenges: vec![
                challenge("4-c1", "Premeditation of Adversity", 40, Journal),
            ],
        },
        Chapter {
            id: "5".to_string(),
            title: "Disturbances of the Mind".to_string(),
            description: "It is not things that disturb us, but our judgments about them".to_string(),
            next: None,
            sections: vec![
                section("5-1", "Judgments, Not Things", "Recall a recent disturbance. What judgment did you add to the event?"),
                section("5-2", "Blaming No One", "Where do you still blame others for what your own opinions produce?"),
                section("5-3", "The Educated Person", "What would change if you stopped blaming yourself as well?"),
            ],
            challenges: vec![
                challenge("5-c1", "Separate Event from Judgment", 45, List),
            ],
        },
    ];

    let mut app_master = achievement(
        "app_master",
        "Modern Stoic",
        "Complete all chapters and earn at least 10 other achievements",
        Special,
        None,
        500,
    );
    app_master.special = true;

    let achievements = vec![
        achievement("streak7", "Weekly Philosopher", "Complete a challenge for 7 consecutive days", Streak, Some(7), 100),
        achievement("allCh1", "First Principles", "Complete all challenges in Chapter 1", ChapterComplete, Some(1), 150),
        achievement("allCh2", "Master of Desire", "Complete all challenges in Chapter 2", ChapterComplete, Some(2), 150),
        achievement("allCh3", "Attachment Expert", "Complete all challenges in Chapter 3", ChapterComplete, Some(3), 175),
        achievement("allCh4", "Challenge Conqueror", "Complete all challenges in Chapter 4", ChapterComplete, Some(4), 200),
        achievement("allCh5", "Master of Mind", "Complete all challenges in Chapter 5", ChapterComplete, Some(5), 225),
        achievement("reflect10", "Deep Thinker", "Complete 10 reflections", Reflections, Some(10), 200),
        achievement("ch_complete_5", "Student of Philosophy", "Complete 5 different chapters", ChaptersComplete, Some(5), 300),
        achievement("perfect_quiz", "Perfect Understanding", "Get 100% on 5 different quizzes/challenges", PerfectChallenges, Some(5), 250),
        achievement("morning_routine", "Morning Meditation", "Use the app for 5 consecutive days during morning hours (5-9am)", MorningSessions, Some(5), 150),
        achievement("evening_reflection", "Evening Reflection", "Complete reflections for 5 consecutive days during evening hours (7-11pm)", EveningReflections, Some(5), 150),
        achievement("stoic_dedication", "Stoic Dedication", "Complete at least 15 different reflections across all chapters", TotalReflections, Some(15), 275),
        achievement("practical_wisdom", "Practical Wisdom", "Complete at least 10 different challenges across all chapters", TotalChallenges, Some(10), 325),
        app_master,
    ];

    Catalog {
        avatars,
        chapters,
        achievements,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_catalog_links() {
        let catalog = Catalog::builtin();
        assert_eq!(catalog.chapters.len(), 5);
        // Every next pointer resolves
        for chapter in &catalog.chapters {
            if let Some(next) = &chapter.next {
                assert!(catalog.chapter(next).is_some(), "dangling next on {}", chapter.id);
            }
        }
        assert_eq!(catalog.chapter("5").map(|c| c.title.as_str()), Some("Disturbances of the Mind"));
        assert_eq!(catalog.chapter("1").and_then(|c| c.section_index("1-3")), Some(2));
    }

    #[test]
    fn test_content_lookups() {
        let catalog = Catalog::builtin();
        let (chapter, index) = catalog.section("2", "2-3").unwrap();
        assert_eq!((chapter.id.as_str(), index), ("2", 2));
        assert_eq!(catalog.known_challenge("1", "1-c2").map(|c| c.xp_reward), Ok(40));

        assert_eq!(catalog.section("nope", "r-1").unwrap_err(), ContentError::UnknownChapter("nope".to_string()));
        let err = catalog.section("1", "bogus-1").unwrap_err();
        assert_eq!(err.to_string(), "Unknown section bogus-1 in chapter 1");
        // Section ids do not leak across chapters
        assert!(catalog.section("1", "2-1").is_err());
        assert!(matches!(
            catalog.known_challenge("1", "2-c1"),
            Err(ContentError::UnknownChallenge { .. })
        ));
    }

    #[test]
    fn test_avatar_level_filters() {
        let catalog = Catalog::builtin();
        assert_eq!(catalog.avatar("scholar").map(|a| a.required_level), Some(15));

        let unlocked: Vec<_> = catalog.avatars_unlocked_between(5, 18).map(|a| a.id.as_str()).collect();
        assert_eq!(unlocked, vec!["practitioner", "scholar"]);
    }

    #[test]
    fn test_catalog_from_json() {
        let raw = r#"{
            "chapters": [{
                "id": "1",
                "title": "Control",
                "sections": [{"id": "1-1", "title": "A"}, {"id": "1-2", "title": "B"}],
                "challenges": [{"id": "1-c1", "title": "List", "xpReward": 30, "type": "list"}]
            }],
            "achievements": [{
                "id": "reflect10", "title": "Deep Thinker",
                "condition": "reflections", "requiredValue": 10, "xpReward": 200
            }]
        }"#;
        let catalog = Catalog::from_json(raw).unwrap();
        let chapter = catalog.chapter("1").unwrap();
        assert_eq!(chapter.sections.len(), 2);
        assert_eq!(chapter.next, None);
        assert_eq!(chapter.challenge("1-c1").map(|c| c.kind), Some(ChallengeKind::List));
        assert_eq!(
            catalog.achievement("reflect10").map(|a| a.condition),
            Some(AchievementCondition::Reflections)
        );
        assert!(catalog.avatars.is_empty());
    }
}
