// ==================== PROGRESS OPERATIONS ====================
//
// Every operation reads a profile snapshot and returns one Step: a single
// patch for the session to apply, the caller-facing outcome and any outbox
// events. Nothing here writes state or talks to the network.
//
// A chapter without a progress entry is "not started yet", never an error;
// the default template is used in its place.

use crate::avatar::AvatarStage;
use crate::catalog::{AchievementCondition, Achievement, Catalog};
use crate::config::{
    APPRENTICE_CHAPTER_ID, APPRENTICE_MINT_REASON, CHAPTER_COMPLETION_BONUS_XP, FIRST_CHAPTER_ID,
    REFLECTION_XP, SECTION_XP,
};
use crate::outbox::{MintRequestEvent, OutboxEvent, ReflectionArchiveEvent};
use crate::patch::ProfilePatch;
use crate::profile::{iso_timestamp, ChallengeCompletion, ChapterProgress, ReflectionEntry, UserProfile};
use chrono::{DateTime, Utc};
use serde_json::{json, Value};

/// Achievements the special "all chapters" achievement requires besides itself
const SPECIAL_ACHIEVEMENT_PREREQUISITES: usize = 10;

/// Everything an operation may read besides the profile
#[derive(Debug, Clone, Copy)]
pub struct OpContext<'a> {
    pub catalog: &'a Catalog,
    pub now: DateTime<Utc>,
    /// Linked wallet, if any (gates mint requests)
    pub wallet_address: Option<&'a str>,
}

impl<'a> OpContext<'a> {
    pub fn new(catalog: &'a Catalog, now: DateTime<Utc>) -> Self {
        OpContext {
            catalog,
            now,
            wallet_address: None,
        }
    }

    pub fn with_wallet(mut self, wallet_address: Option<&'a str>) -> Self {
        self.wallet_address = wallet_address;
        self
    }

    fn timestamp(&self) -> String {
        iso_timestamp(self.now)
    }
}

/// Result of one operation
#[derive(Debug, Clone, PartialEq)]
pub struct Step<T> {
    /// `None` when the operation changes nothing
    pub patch: Option<ProfilePatch>,
    pub outcome: T,
    pub events: Vec<OutboxEvent>,
}

impl<T> Step<T> {
    fn unchanged(outcome: T) -> Self {
        Step {
            patch: None,
            outcome,
            events: Vec::new(),
        }
    }

    fn with_patch(patch: ProfilePatch, outcome: T) -> Self {
        Step {
            patch: Some(patch),
            outcome,
            events: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SectionOutcome {
    pub xp_earned: u64,
    /// The chapter is complete after this call
    pub is_chapter_completed: bool,
    /// Chapter unlocked as a consequence of the completion
    pub unlocked_next: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChallengeOutcome {
    pub xp_earned: u64,
    pub is_first_completion: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReflectionOutcome {
    pub xp_earned: u64,
    pub is_first_reflection: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnlockOutcome {
    /// No entry existed; created unlocked
    Initialized,
    /// Existing entry flipped to unlocked
    Unlocked,
    AlreadyUnlocked,
    UnknownChapter,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoginOutcome {
    pub streak: u32,
    /// First login of a new UTC day (or ever)
    pub is_new_day: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AchievementOutcome {
    pub unlocked: Vec<String>,
    pub xp_earned: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverallProgress {
    pub completed_chapters: usize,
    pub total_chapters: usize,
    pub total_challenges: u64,
    pub total_reflections: u64,
    pub streak: u32,
    pub level: u32,
    pub xp: u64,
}

// -------------------- Patch helpers --------------------

/// Nest a patch under `progress.chapters.<chapter_id>`
fn in_chapter(chapter_id: &str, chapter: ProfilePatch) -> ProfilePatch {
    ProfilePatch::merge().with(
        "progress",
        ProfilePatch::merge().with("chapters", ProfilePatch::merge().with(chapter_id, chapter)),
    )
}

/// Full default entry, written first when a chapter has no entry yet
fn template_patch(chapter_id: &str, now: &str) -> ProfilePatch {
    let template = ChapterProgress::template(chapter_id, now);
    ProfilePatch::merge()
        .set("isUnlocked", template.is_unlocked)
        .set("isStarted", false)
        .set("isCompleted", false)
        .set("completedSections", Vec::<String>::new())
        .set("challengeCompletions", json!({}))
        .set("reflections", json!({}))
        .set("lastReadSection", 0)
        .set("lastVisited", Value::Null)
        .set("unlockedAt", template.unlocked_at)
        .set("completedAt", Value::Null)
}

/// Chapter patch that starts from the template when the entry is missing
fn chapter_patch(profile: &UserProfile, chapter_id: &str, now: &str, fields: ProfilePatch) -> ProfilePatch {
    let fields = match profile.chapter(chapter_id) {
        Some(_) => fields,
        None => template_patch(chapter_id, now).combine(fields),
    };
    in_chapter(chapter_id, fields)
}

fn current_or_template(profile: &UserProfile, chapter_id: &str, now: &str) -> ChapterProgress {
    profile
        .chapter(chapter_id)
        .cloned()
        .unwrap_or_else(|| ChapterProgress::template(chapter_id, now))
}

fn award_xp(profile: &UserProfile, xp: u64) -> ProfilePatch {
    ProfilePatch::merge().set("xp", profile.xp.saturating_add(xp))
}

// -------------------- Operations --------------------

/// Mark a section as read.
/// The first completion earns section XP; completing the last missing
/// section also completes the chapter, earns the bonus and unlocks the
/// next chapter. Sections outside the catalog earn nothing.
pub fn complete_section(
    profile: &UserProfile,
    ctx: &OpContext<'_>,
    chapter_id: &str,
    section_id: &str,
) -> Step<SectionOutcome> {
    let (catalog_chapter, section_index) = match ctx.catalog.section(chapter_id, section_id) {
        Ok(found) => found,
        Err(e) => {
            log::warn!("[SECTION] rejected: {}", e);
            return Step::unchanged(SectionOutcome {
                xp_earned: 0,
                is_chapter_completed: false,
                unlocked_next: None,
            });
        }
    };

    let now = ctx.timestamp();
    let progress = current_or_template(profile, chapter_id, &now);

    if is_section_completed(profile, chapter_id, section_id) {
        log::debug!("[SECTION] {}/{} already completed", chapter_id, section_id);
        return Step::unchanged(SectionOutcome {
            xp_earned: 0,
            is_chapter_completed: progress.is_completed,
            unlocked_next: None,
        });
    }

    let mut sections = progress.completed_sections.clone();
    sections.insert(section_id);

    let last_read = u32::try_from(section_index)
        .map_or(progress.last_read_section, |i| progress.last_read_section.max(i));

    let completes_chapter = !progress.is_completed && catalog_chapter.section_ids().all(|id| sections.contains(id));

    let mut fields = ProfilePatch::merge()
        .set("isStarted", true)
        .set("lastVisited", now.as_str())
        .set("completedSections", sections.to_vec())
        .set("lastReadSection", last_read);

    let mut xp_earned = SECTION_XP;
    let mut unlocked_next = None;
    let mut events = Vec::new();

    if completes_chapter {
        fields = fields.set("isCompleted", true);
        if progress.completed_at.is_none() {
            fields = fields.set("completedAt", now.as_str());
        }
        xp_earned += CHAPTER_COMPLETION_BONUS_XP;
    }

    let mut patch = chapter_patch(profile, chapter_id, &now, fields);

    if completes_chapter {
        if let Some(next) = catalog_chapter.next.as_deref() {
            let (unlock, outcome) = unlock_patch(profile, ctx, next);
            if let Some(unlock) = unlock {
                patch = patch.combine(unlock);
            }
            if matches!(outcome, UnlockOutcome::Initialized | UnlockOutcome::Unlocked) {
                unlocked_next = Some(next.to_string());
            }
        }

        if chapter_id == APPRENTICE_CHAPTER_ID {
            match ctx.wallet_address {
                Some(wallet) => events.push(OutboxEvent::MintRequest(MintRequestEvent {
                    wallet_address: wallet.to_string(),
                    stage: AvatarStage::Apprentice,
                    reason: APPRENTICE_MINT_REASON.to_string(),
                })),
                None => log::warn!("[MINT] chapter {} completed without a linked wallet, mint skipped", chapter_id),
            }
        }
    }

    patch = patch.combine(award_xp(profile, xp_earned));

    Step {
        patch: Some(patch),
        outcome: SectionOutcome {
            xp_earned,
            is_chapter_completed: completes_chapter || progress.is_completed,
            unlocked_next,
        },
        events,
    }
}

/// Record a challenge submission. XP and the counter only move the first
/// time; the stored record is always replaced by the latest submission.
pub fn complete_challenge(
    profile: &UserProfile,
    ctx: &OpContext<'_>,
    chapter_id: &str,
    challenge_id: &str,
    xp_to_award: u64,
    details: Value,
) -> Step<ChallengeOutcome> {
    if let Err(e) = ctx.catalog.known_challenge(chapter_id, challenge_id) {
        log::warn!("[CHALLENGE] rejected: {}", e);
        return Step::unchanged(ChallengeOutcome {
            xp_earned: 0,
            is_first_completion: false,
        });
    }

    let now = ctx.timestamp();
    let is_first_completion = !is_challenge_completed(profile, chapter_id, challenge_id);

    let record = json!({ "completedAt": now, "details": details });
    let fields = ProfilePatch::merge().with(
        "challengeCompletions",
        ProfilePatch::merge().set(challenge_id, record),
    );
    let mut patch = chapter_patch(profile, chapter_id, &now, fields);

    let xp_earned = if is_first_completion { xp_to_award } else { 0 };
    if is_first_completion {
        patch = patch
            .combine(award_xp(profile, xp_earned))
            .set("challengesCompleted", profile.challenges_completed.saturating_add(1));
    }

    Step::with_patch(
        patch,
        ChallengeOutcome {
            xp_earned,
            is_first_completion,
        },
    )
}

/// Save a reflection and archive a copy remotely.
/// Reflections are keyed by the section they answer.
pub fn save_reflection(
    profile: &UserProfile,
    ctx: &OpContext<'_>,
    chapter_id: &str,
    reflection_id: &str,
    content: &str,
) -> Step<ReflectionOutcome> {
    if let Err(e) = ctx.catalog.section(chapter_id, reflection_id) {
        log::warn!("[REFLECTION] rejected: {}", e);
        return Step::unchanged(ReflectionOutcome {
            xp_earned: 0,
            is_first_reflection: false,
        });
    }

    let now = ctx.timestamp();
    let is_first_reflection = reflection(profile, chapter_id, reflection_id).is_none();

    let entry = json!({ "content": content, "timestamp": now });
    let fields = ProfilePatch::merge().with("reflections", ProfilePatch::merge().set(reflection_id, entry));
    let mut patch = chapter_patch(profile, chapter_id, &now, fields);

    let xp_earned = if is_first_reflection { REFLECTION_XP } else { 0 };
    if is_first_reflection {
        patch = patch
            .combine(award_xp(profile, xp_earned))
            .set("reflectionsWritten", profile.reflections_written.saturating_add(1));
    }

    Step {
        patch: Some(patch),
        outcome: ReflectionOutcome {
            xp_earned,
            is_first_reflection,
        },
        events: vec![OutboxEvent::ArchiveReflection(ReflectionArchiveEvent {
            wallet_address: ctx.wallet_address.map(str::to_string),
            chapter_id: chapter_id.to_string(),
            reflection_id: reflection_id.to_string(),
            content: content.to_string(),
        })],
    }
}

fn unlock_patch(profile: &UserProfile, ctx: &OpContext<'_>, chapter_id: &str) -> (Option<ProfilePatch>, UnlockOutcome) {
    if ctx.catalog.chapter(chapter_id).is_none() {
        log::error!("[UNLOCK] unknown chapter {}", chapter_id);
        return (None, UnlockOutcome::UnknownChapter);
    }

    let now = ctx.timestamp();
    match profile.chapter(chapter_id) {
        None => {
            let fields = template_patch(chapter_id, &now)
                .set("isUnlocked", true)
                .set("unlockedAt", now.as_str());
            (Some(in_chapter(chapter_id, fields)), UnlockOutcome::Initialized)
        }
        Some(existing) if !existing.is_unlocked => {
            let unlocked_at = existing.unlocked_at.clone().unwrap_or(now);
            let fields = ProfilePatch::merge()
                .set("isUnlocked", true)
                .set("unlockedAt", unlocked_at);
            (Some(in_chapter(chapter_id, fields)), UnlockOutcome::Unlocked)
        }
        Some(_) => {
            log::info!("[UNLOCK] chapter {} already unlocked", chapter_id);
            (None, UnlockOutcome::AlreadyUnlocked)
        }
    }
}

pub fn unlock_chapter(profile: &UserProfile, ctx: &OpContext<'_>, chapter_id: &str) -> Step<UnlockOutcome> {
    let (patch, outcome) = unlock_patch(profile, ctx, chapter_id);
    Step {
        patch,
        outcome,
        events: Vec::new(),
    }
}

/// Update the daily login streak. Days are UTC calendar days.
pub fn record_login(profile: &UserProfile, ctx: &OpContext<'_>) -> Step<LoginOutcome> {
    let last = profile
        .last_login
        .as_deref()
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map(|at| at.with_timezone(&Utc));

    let (streak, is_new_day) = match last {
        None => (1, true),
        Some(last) => {
            let days = (ctx.now.date_naive() - last.date_naive()).num_days();
            match days {
                d if d <= 0 => (profile.streak.max(1), false),
                1 => (profile.streak.saturating_add(1), true),
                _ => (1, true),
            }
        }
    };

    let patch = ProfilePatch::merge()
        .set("streak", streak)
        .set("lastLogin", ctx.timestamp());
    Step::with_patch(patch, LoginOutcome { streak, is_new_day })
}

fn condition_met(profile: &UserProfile, catalog: &Catalog, achievement: &Achievement) -> bool {
    let Some(required) = achievement.required_value else {
        return false;
    };
    match achievement.condition {
        AchievementCondition::Streak => u64::from(profile.streak) >= required,
        AchievementCondition::ChapterComplete => {
            let chapter_id = required.to_string();
            catalog.chapter(&chapter_id).is_some_and(|chapter| {
                !chapter.challenges.is_empty()
                    && chapter
                        .challenges
                        .iter()
                        .all(|c| is_challenge_completed(profile, &chapter_id, &c.id))
            })
        }
        AchievementCondition::ChaptersComplete => completed_chapter_count(profile) as u64 >= required,
        AchievementCondition::Reflections | AchievementCondition::TotalReflections => {
            profile.reflections_written >= required
        }
        AchievementCondition::TotalChallenges => profile.challenges_completed >= required,
        // Not tracked by the progress document
        AchievementCondition::PerfectChallenges
        | AchievementCondition::MorningSessions
        | AchievementCondition::EveningReflections
        | AchievementCondition::Special => false,
    }
}

/// Unlock every achievement whose condition now holds and award its XP
pub fn claim_achievements(profile: &UserProfile, ctx: &OpContext<'_>) -> Step<AchievementOutcome> {
    let mut owned = profile.achievements.clone();
    let mut unlocked = Vec::new();
    let mut xp_earned = 0u64;

    let catalog = ctx.catalog;
    for achievement in catalog.achievements.iter().filter(|a| a.condition != AchievementCondition::Special) {
        if !owned.contains(&achievement.id) && condition_met(profile, catalog, achievement) {
            owned.insert(achievement.id.clone());
            unlocked.push(achievement.id.clone());
            xp_earned = xp_earned.saturating_add(achievement.xp_reward);
        }
    }

    let all_chapters_done = !catalog.chapters.is_empty()
        && catalog
            .chapters
            .iter()
            .all(|c| profile.chapter(&c.id).is_some_and(|p| p.is_completed));
    for special in catalog.achievements.iter().filter(|a| a.condition == AchievementCondition::Special) {
        let others = owned
            .to_vec().iter()
            .filter(|id| catalog.achievement(id).map_or(true, |a| a.condition != AchievementCondition::Special))
            .count();
        if !owned.contains(&special.id) && all_chapters_done && others >= SPECIAL_ACHIEVEMENT_PREREQUISITES {
            owned.insert(special.id.clone());
            unlocked.push(special.id.clone());
            xp_earned = xp_earned.saturating_add(special.xp_reward);
        }
    }

    if unlocked.is_empty() {
        return Step::unchanged(AchievementOutcome { unlocked, xp_earned });
    }

    let patch = award_xp(profile, xp_earned).set("achievements", owned.to_vec());
    Step::with_patch(patch, AchievementOutcome { unlocked, xp_earned })
}

// -------------------- Read helpers --------------------

fn completed_chapter_count(profile: &UserProfile) -> usize {
    profile.progress.chapters.values().filter(|c| c.is_completed).count()
}

/// Aggregate view; reports the stored level, never recomputes it
pub fn overall_progress(profile: &UserProfile, catalog: &Catalog) -> OverallProgress {
    OverallProgress {
        completed_chapters: completed_chapter_count(profile),
        total_chapters: catalog.chapters.len(),
        total_challenges: profile.challenges_completed,
        total_reflections: profile.reflections_written,
        streak: profile.streak,
        level: profile.level,
        xp: profile.xp,
    }
}

/// Progress for a chapter with the template filled in.
/// The first chapter always reads as unlocked.
pub fn chapter_progress(profile: &UserProfile, chapter_id: &str, now: DateTime<Utc>) -> ChapterProgress {
    let now = iso_timestamp(now);
    let mut progress = current_or_template(profile, chapter_id, &now);
    if chapter_id == FIRST_CHAPTER_ID {
        progress.is_unlocked = true;
        progress.unlocked_at.get_or_insert(now);
    }
    progress
}

pub fn is_section_completed(profile: &UserProfile, chapter_id: &str, section_id: &str) -> bool {
    profile
        .chapter(chapter_id)
        .is_some_and(|c| c.completed_sections.contains(section_id))
}

pub fn is_challenge_completed(profile: &UserProfile, chapter_id: &str, challenge_id: &str) -> bool {
    challenge_completion(profile, chapter_id, challenge_id).is_some()
}

pub fn challenge_completion<'p>(
    profile: &'p UserProfile,
    chapter_id: &str,
    challenge_id: &str,
) -> Option<&'p ChallengeCompletion> {
    profile.chapter(chapter_id)?.challenge_completions.get(challenge_id)
}

pub fn reflection<'p>(profile: &'p UserProfile, chapter_id: &str, reflection_id: &str) -> Option<&'p ReflectionEntry> {
    profile.chapter(chapter_id)?.reflections.get(reflection_id)
}
