// ==================== PROFILE REDUCER ====================
//
// Updates are tagged patches: every node either replaces the value at its
// path or merges its children into the existing object. The default policy
// for a plain JSON update mirrors how the document is shaped:
//
//   progress                      merge
//   progress.chapters             merge
//   progress.chapters.<id>        merge (chapter fields)
//   progress.chapters.<id>.reflections   merge (entries replaced whole)
//   any other top-level object    one-level merge
//   scalars and sequences         replace

use crate::profile::UserProfile;
use serde_json::{Map, Value};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq)]
pub enum ProfilePatch {
    Replace(Value),
    Merge(BTreeMap<String, ProfilePatch>),
}

impl ProfilePatch {
    /// Empty merge node
    pub fn merge() -> Self {
        ProfilePatch::Merge(BTreeMap::new())
    }

    /// Set `key` to a replacement value
    pub fn set(self, key: &str, value: impl Into<Value>) -> Self {
        self.with(key, ProfilePatch::Replace(value.into()))
    }

    /// Attach a child patch under `key`, combining with any existing child
    pub fn with(self, key: &str, child: ProfilePatch) -> Self {
        let mut children = match self {
            ProfilePatch::Merge(children) => children,
            ProfilePatch::Replace(_) => BTreeMap::new(),
        };
        let combined = match children.remove(key) {
            Some(existing) => existing.combine(child),
            None => child,
        };
        children.insert(key.to_string(), combined);
        ProfilePatch::Merge(children)
    }

    /// `self` followed by `later`; merges combine key by key, anything else
    /// lets the later patch win
    pub fn combine(self, later: ProfilePatch) -> Self {
        match (self, later) {
            (ProfilePatch::Merge(mut earlier), ProfilePatch::Merge(later)) => {
                for (key, patch) in later {
                    let combined = match earlier.remove(&key) {
                        Some(existing) => existing.combine(patch),
                        None => patch,
                    };
                    earlier.insert(key, combined);
                }
                ProfilePatch::Merge(earlier)
            }
            (_, later) => later,
        }
    }

    /// Derive a patch from a plain JSON update using the document policy
    pub fn from_value(update: Value) -> Self {
        match update {
            Value::Object(fields) => ProfilePatch::Merge(
                fields
                    .into_iter()
                    .map(|(key, value)| {
                        let patch = if key == "progress" {
                            progress_policy(value)
                        } else {
                            one_level(value)
                        };
                        (key, patch)
                    })
                    .collect(),
            ),
            other => ProfilePatch::Replace(other),
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, ProfilePatch::Merge(children) if children.is_empty())
    }

    /// Write the patch into `target`
    pub fn apply(self, target: &mut Value) {
        match self {
            ProfilePatch::Replace(value) => *target = value,
            ProfilePatch::Merge(children) => {
                if !target.is_object() {
                    *target = Value::Object(Map::new());
                }
                if let Value::Object(fields) = target {
                    for (key, patch) in children {
                        let slot = fields.entry(key).or_insert(Value::Null);
                        patch.apply(slot);
                    }
                }
            }
        }
    }
}

fn one_level(value: Value) -> ProfilePatch {
    match value {
        Value::Object(fields) => ProfilePatch::Merge(
            fields
                .into_iter()
                .map(|(key, value)| (key, ProfilePatch::Replace(value)))
                .collect(),
        ),
        other => ProfilePatch::Replace(other),
    }
}

fn progress_policy(value: Value) -> ProfilePatch {
    match value {
        Value::Object(fields) => ProfilePatch::Merge(
            fields
                .into_iter()
                .map(|(key, value)| {
                    let patch = if key == "chapters" {
                        chapters_policy(value)
                    } else {
                        ProfilePatch::Replace(value)
                    };
                    (key, patch)
                })
                .collect(),
        ),
        other => ProfilePatch::Replace(other),
    }
}

fn chapters_policy(value: Value) -> ProfilePatch {
    match value {
        Value::Object(chapters) => ProfilePatch::Merge(
            chapters
                .into_iter()
                .map(|(id, chapter)| (id, chapter_policy(chapter)))
                .collect(),
        ),
        other => ProfilePatch::Replace(other),
    }
}

fn chapter_policy(value: Value) -> ProfilePatch {
    match value {
        Value::Object(fields) => ProfilePatch::Merge(
            fields
                .into_iter()
                .map(|(key, value)| {
                    let patch = if key == "reflections" {
                        one_level(value)
                    } else {
                        ProfilePatch::Replace(value)
                    };
                    (key, patch)
                })
                .collect(),
        ),
        other => ProfilePatch::Replace(other),
    }
}

/// A concrete patch, or a function of the current profile producing one
pub enum Update<'a> {
    Patch(ProfilePatch),
    Derive(Box<dyn FnOnce(&UserProfile) -> ProfilePatch + 'a>),
}

impl<'a> Update<'a> {
    pub fn derive(f: impl FnOnce(&UserProfile) -> ProfilePatch + 'a) -> Self {
        Update::Derive(Box::new(f))
    }

    fn resolve(self, current: &UserProfile) -> ProfilePatch {
        match self {
            Update::Patch(patch) => patch,
            Update::Derive(f) => f(current),
        }
    }
}

impl From<ProfilePatch> for Update<'_> {
    fn from(patch: ProfilePatch) -> Self {
        Update::Patch(patch)
    }
}

impl From<Value> for Update<'_> {
    fn from(update: Value) -> Self {
        Update::Patch(ProfilePatch::from_value(update))
    }
}

/// Outcome of applying an update
#[derive(Debug, Clone, PartialEq)]
pub struct Applied {
    pub profile: UserProfile,
    /// The update carried an unusable `xp`; the previous value was kept and
    /// the level must not be recomputed this cycle
    pub xp_rejected: bool,
}

/// Apply an update to a copy of `current`
#[cfg(test)]
pub fn apply_update<'a>(current: &UserProfile, update: impl Into<Update<'a>>) -> UserProfile {
    apply_update_checked(current, update).profile
}

pub fn apply_update_checked<'a>(current: &UserProfile, update: impl Into<Update<'a>>) -> Applied {
    let unchanged = |xp_rejected| Applied {
        profile: current.clone(),
        xp_rejected,
    };

    let patch = update.into().resolve(current);
    if patch.is_empty() {
        return unchanged(false);
    }

    let mut document = match current.to_document() {
        Ok(document) => document,
        Err(e) => {
            log::error!("[STORE] could not encode profile: {}", e);
            return unchanged(false);
        }
    };
    patch.apply(&mut document);

    let Value::Object(fields) = &mut document else {
        log::warn!("[STORE] update replaced the profile with a non-object, ignored");
        return unchanged(false);
    };

    let mut xp_rejected = false;
    if fields.get("xp").and_then(Value::as_u64).is_none() {
        log::warn!(
            "[STORE] invalid xp {:?} in update, keeping {} and skipping level recomputation",
            fields.get("xp"),
            current.xp
        );
        fields.insert("xp".to_string(), Value::from(current.xp));
        xp_rejected = true;
    }

    match UserProfile::from_document(document) {
        Ok(profile) => Applied { profile, xp_rejected },
        Err(e) => {
            log::warn!("[STORE] update does not fit the profile shape, ignored: {}", e);
            unchanged(xp_rejected)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_reflections_merge_across_updates() {
        let profile = UserProfile::default();
        let first = apply_update(
            &profile,
            json!({"progress": {"chapters": {"1": {"reflections": {"1-1": {"content": "x"}}}}}}),
        );
        let second = apply_update(
            &first,
            json!({"progress": {"chapters": {"1": {"reflections": {"1-2": {"content": "y"}}}}}}),
        );

        let reflections = &second.chapter("1").unwrap().reflections;
        assert_eq!(reflections["1-1"].content, "x");
        assert_eq!(reflections["1-2"].content, "y");
    }

    #[test]
    fn test_chapter_fields_merge_and_sequences_replace() {
        let profile = apply_update(
            &UserProfile::default(),
            json!({"progress": {"chapters": {"2": {"isUnlocked": true, "completedSections": ["2-1"]}}}}),
        );
        let profile = apply_update(
            &profile,
            json!({"progress": {"chapters": {"2": {"completedSections": ["2-2"], "isStarted": true}}}}),
        );

        let chapter = profile.chapter("2").unwrap();
        // Untouched field survives the chapter-level merge
        assert!(chapter.is_unlocked);
        assert!(chapter.is_started);
        // Sequences are replaced, never merged element-wise
        assert_eq!(chapter.completed_sections.to_vec(), vec!["2-2"]);
    }

    #[test]
    fn test_other_chapters_survive() {
        let profile = apply_update(
            &UserProfile::default(),
            json!({"progress": {"chapters": {"1": {"isStarted": true}}}}),
        );
        let profile = apply_update(&profile, json!({"progress": {"chapters": {"2": {"isStarted": true}}}}));
        assert!(profile.chapter("1").is_some());
        assert!(profile.chapter("2").is_some());
    }

    #[test]
    fn test_one_level_merge_for_other_objects() {
        let profile = apply_update(
            &UserProfile::default(),
            json!({"inventory": {"tokens": 7}, "settings": {"translationPreference": "modern"}}),
        );
        assert_eq!(profile.inventory.tokens, 7);
        assert!(profile.inventory.collectibles.is_empty());
        assert_eq!(profile.settings.translation_preference.as_str(), "modern");
    }

    #[test]
    fn test_input_is_not_mutated() {
        let profile = UserProfile::default();
        let before = profile.clone();
        let after = apply_update(&profile, json!({"xp": 50, "name": "Zeno"}));
        assert_eq!(profile, before);
        assert_eq!(after.xp, 50);
        assert_eq!(after.name, "Zeno");
    }

    #[test]
    fn test_derived_update_sees_current_profile() {
        let profile = UserProfile {
            xp: 40,
            ..Default::default()
        };
        let after = apply_update(
            &profile,
            Update::derive(|current| ProfilePatch::merge().set("xp", current.xp + 15)),
        );
        assert_eq!(after.xp, 55);
    }

    #[test]
    fn test_invalid_xp_is_rejected() {
        let profile = UserProfile {
            xp: 120,
            level: 2,
            ..Default::default()
        };
        let applied = apply_update_checked(&profile, json!({"xp": "lots", "name": "Cleanthes"}));
        assert!(applied.xp_rejected);
        assert_eq!(applied.profile.xp, 120);
        assert_eq!(applied.profile.name, "Cleanthes");

        let applied = apply_update_checked(&profile, json!({"xp": -5}));
        assert!(applied.xp_rejected);
        assert_eq!(applied.profile.xp, 120);
    }

    #[test]
    fn test_ill_shaped_update_is_ignored() {
        let profile = UserProfile::default();
        let after = apply_update(&profile, json!({"level": "high"}));
        assert_eq!(after, profile);
        let after = apply_update(&profile, json!([1, 2, 3]));
        assert_eq!(after, profile);
    }

    #[test]
    fn test_combine_nested_merges() {
        let a = ProfilePatch::from_value(json!({"progress": {"chapters": {"1": {"isCompleted": true}}}}));
        let b = ProfilePatch::from_value(json!({"progress": {"chapters": {"2": {"isUnlocked": true}}}}));
        let combined = ProfilePatch::merge().set("xp", 30).combine(a).combine(b);

        let profile = apply_update(&UserProfile::default(), combined);
        assert_eq!(profile.xp, 30);
        assert!(profile.chapter("1").unwrap().is_completed);
        assert!(profile.chapter("2").unwrap().is_unlocked);
    }

    #[test]
    fn test_empty_patch_is_a_no_op() {
        assert!(ProfilePatch::merge().is_empty());
        assert!(!ProfilePatch::from_value(json!({"xp": 1})).is_empty());
        let profile = UserProfile { xp: 40, ..Default::default() };
        assert_eq!(apply_update(&profile, ProfilePatch::merge()), profile);
    }
}
