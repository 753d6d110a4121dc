// ==================== PROFILE SESSION ====================
//
// One owned session per player over a key-value document store. The session
// is the only writer of its document: it applies each operation's patch,
// keeps `level` in step with `xp`, persists, notifies subscribers and
// collects outbox events for the host to deliver.

use crate::avatar::{check_mint_eligibility, reconcile_avatar, resolve_current_avatar_id, AvatarStage, MintEligibilityError, WalletState};
use crate::catalog::Catalog;
use crate::config::{NetworkConfig, FIRST_CHAPTER_ID};
use crate::outbox::OutboxEvent;
use crate::patch::{apply_update_checked, Update};
use crate::profile::{LevelUp, UserProfile};
use crate::progress::{
    self, AchievementOutcome, ChallengeOutcome, LoginOutcome, OpContext, ReflectionOutcome, SectionOutcome, Step,
    UnlockOutcome,
};
use chrono::{DateTime, Utc};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage unavailable: {0}")]
    Unavailable(String),
    #[error("invalid profile document: {0}")]
    InvalidDocument(#[from] serde_json::Error),
}

/// Key-value store holding raw JSON documents
pub trait DocumentStore {
    fn load(&self, key: &str) -> Result<Option<String>, StoreError>;
    fn save(&mut self, key: &str, raw: &str) -> Result<(), StoreError>;
}

#[cfg(test)]
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    entries: std::collections::BTreeMap<String, String>,
}

#[cfg(test)]
impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }
}

#[cfg(test)]
impl DocumentStore for MemoryStore {
    fn load(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.entries.get(key).cloned())
    }

    fn save(&mut self, key: &str, raw: &str) -> Result<(), StoreError> {
        self.entries.insert(key.to_string(), raw.to_string());
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeSource {
    /// An operation or update in this session
    Local,
    /// Another writer changed the stored document
    External,
    /// Administrative replacement
    Restore,
}

/// Passed to subscribers after every change
#[derive(Debug)]
pub struct ProfileChange<'p> {
    pub profile: &'p UserProfile,
    pub level_up: Option<&'p LevelUp>,
    pub source: ChangeSource,
}

type Subscriber<'a> = Box<dyn FnMut(&ProfileChange<'_>) + 'a>;

pub struct ProfileSession<'a, S: DocumentStore> {
    store: S,
    key: String,
    catalog: &'a Catalog,
    profile: UserProfile,
    wallet: WalletState,
    outbox: Vec<OutboxEvent>,
    subscribers: Vec<Subscriber<'a>>,
}

fn decode_or_default(key: &str, raw: Option<&str>) -> UserProfile {
    let Some(raw) = raw else {
        return UserProfile::default();
    };
    match serde_json::from_str::<Value>(raw).and_then(UserProfile::from_document) {
        Ok(profile) => profile,
        Err(e) => {
            log::warn!("[STORE] document {} is not a valid profile, starting fresh: {}", key, e);
            UserProfile::default()
        }
    }
}

impl<'a, S: DocumentStore> ProfileSession<'a, S> {
    /// Open the document under `key`. A missing or unreadable document
    /// starts a fresh profile; the first chapter is unlocked either way.
    pub fn load(store: S, key: &str, catalog: &'a Catalog, now: DateTime<Utc>) -> Result<Self, StoreError> {
        let raw = store.load(key)?;
        let mut profile = decode_or_default(key, raw.as_deref());
        profile.reconcile_level(catalog);

        let mut session = ProfileSession {
            store,
            key: key.to_string(),
            catalog,
            profile,
            wallet: WalletState::disconnected(),
            outbox: Vec::new(),
            subscribers: Vec::new(),
        };

        let first = progress::unlock_chapter(&session.profile, &OpContext::new(catalog, now), FIRST_CHAPTER_ID);
        session.run(first);
        Ok(session)
    }

    pub fn profile(&self) -> &UserProfile {
        &self.profile
    }

    pub fn wallet(&self) -> &WalletState {
        &self.wallet
    }

    pub fn set_wallet(&mut self, wallet: WalletState) {
        self.wallet = wallet;
    }

    pub fn subscribe(&mut self, subscriber: impl FnMut(&ProfileChange<'_>) + 'a) {
        self.subscribers.push(Box::new(subscriber));
    }

    fn op_context(&self, now: DateTime<Utc>) -> OpContext<'_> {
        OpContext::new(self.catalog, now).with_wallet(self.wallet.address.as_deref())
    }

    fn notify(&mut self, level_up: Option<&LevelUp>, source: ChangeSource) {
        let change = ProfileChange {
            profile: &self.profile,
            level_up,
            source,
        };
        for subscriber in self.subscribers.iter_mut() {
            subscriber(&change);
        }
    }

    /// Write the current profile to the store
    pub fn persist(&mut self) -> Result<(), StoreError> {
        let raw = serde_json::to_string(&self.profile)?;
        self.store.save(&self.key, &raw)
    }

    fn persist_logged(&mut self) {
        if let Err(e) = self.persist() {
            log::error!("[STORE] could not persist {}: {}", self.key, e);
        }
    }

    /// Apply an update, recompute the level, persist and notify.
    /// A failed write is logged; the in-memory profile stays authoritative.
    pub fn update<'u>(&mut self, update: impl Into<Update<'u>>) -> Option<LevelUp> {
        let applied = apply_update_checked(&self.profile, update);
        self.profile = applied.profile;

        let level_up = if applied.xp_rejected {
            None
        } else {
            self.profile.reconcile_level(self.catalog)
        };
        self.persist_logged();
        self.notify(level_up.as_ref(), ChangeSource::Local);
        level_up
    }

    fn run<T>(&mut self, step: Step<T>) -> T {
        if let Some(patch) = step.patch {
            self.update(patch);
        }
        self.outbox.extend(step.events);
        step.outcome
    }

    pub fn complete_section(&mut self, now: DateTime<Utc>, chapter_id: &str, section_id: &str) -> SectionOutcome {
        let step = progress::complete_section(&self.profile, &self.op_context(now), chapter_id, section_id);
        self.run(step)
    }

    pub fn complete_challenge(
        &mut self,
        now: DateTime<Utc>,
        chapter_id: &str,
        challenge_id: &str,
        xp_to_award: u64,
        details: Value,
    ) -> ChallengeOutcome {
        let step = progress::complete_challenge(
            &self.profile,
            &self.op_context(now),
            chapter_id,
            challenge_id,
            xp_to_award,
            details,
        );
        self.run(step)
    }

    pub fn save_reflection(&mut self, now: DateTime<Utc>, chapter_id: &str, reflection_id: &str, content: &str) -> ReflectionOutcome {
        let step = progress::save_reflection(&self.profile, &self.op_context(now), chapter_id, reflection_id, content);
        self.run(step)
    }

    pub fn unlock_chapter(&mut self, now: DateTime<Utc>, chapter_id: &str) -> UnlockOutcome {
        let step = progress::unlock_chapter(&self.profile, &self.op_context(now), chapter_id);
        self.run(step)
    }

    pub fn record_login(&mut self, now: DateTime<Utc>) -> LoginOutcome {
        let step = progress::record_login(&self.profile, &self.op_context(now));
        self.run(step)
    }

    pub fn claim_achievements(&mut self, now: DateTime<Utc>) -> AchievementOutcome {
        let step = progress::claim_achievements(&self.profile, &self.op_context(now));
        self.run(step)
    }

    pub fn overall_progress(&self) -> progress::OverallProgress {
        progress::overall_progress(&self.profile, self.catalog)
    }

    /// Resolve the displayed avatar and cache it in the profile
    pub fn reconcile_avatar(&mut self) -> String {
        let resolved = resolve_current_avatar_id(&self.profile, &self.wallet);
        if let Some(patch) = reconcile_avatar(&self.profile, &resolved) {
            log::info!("[AVATAR] {} -> {}", self.profile.current_avatar_id, resolved);
            self.update(patch);
        }
        resolved
    }

    pub fn mint_eligibility(&self, stage: AvatarStage, network: &NetworkConfig) -> Result<(), MintEligibilityError> {
        check_mint_eligibility(&self.profile, &self.wallet, self.catalog, stage, network.network_name)
    }

    /// Drain events produced since the last call
    pub fn take_outbox(&mut self) -> Vec<OutboxEvent> {
        std::mem::take(&mut self.outbox)
    }

    /// Another writer changed `key`. The stored value replaces the session
    /// state wholesale; the last writer wins. Unreadable values are ignored.
    pub fn on_external_change(&mut self, key: &str, raw: Option<&str>) {
        if key != self.key {
            return;
        }
        let profile = match raw {
            None => UserProfile::default(),
            Some(raw) => match serde_json::from_str::<Value>(raw).and_then(UserProfile::from_document) {
                Ok(profile) => profile,
                Err(e) => {
                    log::warn!("[STORE] ignoring unreadable external change to {}: {}", key, e);
                    return;
                }
            },
        };
        self.profile = profile;
        self.notify(None, ChangeSource::External);
    }

    /// Replace the document with `raw`. The session only takes the new
    /// profile once the store has accepted it.
    pub fn replace_document(&mut self, raw: &str) -> Result<(), StoreError> {
        let document: Value = serde_json::from_str(raw)?;
        let mut profile = UserProfile::from_document(document)?;
        profile.reconcile_level(self.catalog);
        self.store.save(&self.key, &serde_json::to_string(&profile)?)?;
        self.profile = profile;
        self.notify(None, ChangeSource::Restore);
        Ok(())
    }

    #[cfg(test)]
    pub fn into_store(self) -> S {
        self.store
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::avatar::ChainAvatar;
    use crate::config::NetworkEnv;
    use serde_json::json;
    use std::cell::RefCell;

    const PROFILE_STORAGE_KEY: &str = "gameUserData";

    fn now() -> DateTime<Utc> {
        DateTime::from_timestamp_millis(1_767_225_600_000).unwrap()
    }

    fn stored(store: &MemoryStore) -> UserProfile {
        let raw = store.get(PROFILE_STORAGE_KEY).unwrap();
        UserProfile::from_document(serde_json::from_str(raw).unwrap()).unwrap()
    }

    #[test]
    fn test_load_missing_document_creates_defaults() {
        let session = ProfileSession::load(MemoryStore::new(), PROFILE_STORAGE_KEY, Catalog::builtin(), now()).unwrap();
        assert_eq!(session.profile().name, "Player");
        assert!(session.profile().chapter("1").unwrap().is_unlocked);

        let store = session.into_store();
        assert!(stored(&store).chapter("1").unwrap().is_unlocked);
    }

    #[test]
    fn test_load_invalid_document_starts_fresh() {
        let mut store = MemoryStore::new();
        store.save(PROFILE_STORAGE_KEY, "{not json").unwrap();
        let session = ProfileSession::load(store, PROFILE_STORAGE_KEY, Catalog::builtin(), now()).unwrap();
        assert_eq!(session.profile().xp, 0);
        assert_eq!(session.profile().level, 1);
    }

    #[test]
    fn test_load_reconciles_stale_level() {
        let mut store = MemoryStore::new();
        let raw = json!({"xp": 260, "level": 1, "progress": {"chapters": {"1": {"isUnlocked": true}}}});
        store.save(PROFILE_STORAGE_KEY, &raw.to_string()).unwrap();
        let session = ProfileSession::load(store, PROFILE_STORAGE_KEY, Catalog::builtin(), now()).unwrap();
        assert_eq!(session.profile().level, 3);
    }

    #[test]
    fn test_operations_persist_and_notify() {
        let seen = RefCell::new(Vec::new());
        let mut session = ProfileSession::load(MemoryStore::new(), PROFILE_STORAGE_KEY, Catalog::builtin(), now()).unwrap();
        session.subscribe(|change: &ProfileChange<'_>| {
            seen.borrow_mut().push((change.profile.xp, change.level_up.map(|up| up.to), change.source));
        });

        let outcome = session.complete_section(now(), "1", "1-1");
        assert_eq!(outcome.xp_earned, 5);
        session.update(json!({"xp": 100}));

        let store = session.into_store();
        assert_eq!(stored(&store).xp, 100);
        assert_eq!(stored(&store).level, 2);
        assert_eq!(
            *seen.borrow(),
            vec![(5, None, ChangeSource::Local), (100, Some(2), ChangeSource::Local)]
        );
    }

    #[test]
    fn test_invalid_xp_keeps_level() {
        let mut session = ProfileSession::load(MemoryStore::new(), PROFILE_STORAGE_KEY, Catalog::builtin(), now()).unwrap();
        session.update(json!({"xp": 120}));
        let level_up = session.update(json!({"xp": "NaN"}));
        assert!(level_up.is_none());
        assert_eq!(session.profile().xp, 120);
        assert_eq!(session.profile().level, 2);
    }

    #[test]
    fn test_outbox_collects_events() {
        let mut session = ProfileSession::load(MemoryStore::new(), PROFILE_STORAGE_KEY, Catalog::builtin(), now()).unwrap();
        session.set_wallet(WalletState {
            address: Some("0x2222222222222222222222222222222222222222".to_string()),
            on_correct_network: true,
            chain: None,
        });
        for section in ["5-1", "5-2", "5-3"] {
            session.complete_section(now(), "5", section);
        }
        session.save_reflection(now(), "5", "5-1", "It is our opinions that disturb us.");

        let events = session.take_outbox();
        let kinds: Vec<_> = events.iter().map(OutboxEvent::kind).collect();
        assert_eq!(kinds, vec!["mint_request", "archive_reflection"]);
        assert!(session.take_outbox().is_empty());
    }

    #[test]
    fn test_external_change_replaces_state() {
        let mut session = ProfileSession::load(MemoryStore::new(), PROFILE_STORAGE_KEY, Catalog::builtin(), now()).unwrap();
        session.complete_section(now(), "1", "1-1");

        session.on_external_change("otherKey", Some(r#"{"xp": 999}"#));
        assert_eq!(session.profile().xp, 5);

        session.on_external_change(PROFILE_STORAGE_KEY, Some("garbage"));
        assert_eq!(session.profile().xp, 5);

        session.on_external_change(PROFILE_STORAGE_KEY, Some(r#"{"xp": 40, "name": "Musonius"}"#));
        assert_eq!(session.profile().xp, 40);
        assert_eq!(session.profile().name, "Musonius");
        // Wholesale replacement, not a merge
        assert!(session.profile().chapter("1").is_none());
    }

    #[test]
    fn test_replace_document_persists() {
        let mut session = ProfileSession::load(MemoryStore::new(), PROFILE_STORAGE_KEY, Catalog::builtin(), now()).unwrap();
        assert!(session.replace_document("[1, 2]").is_err());
        session.replace_document(r#"{"xp": 1200, "name": "Chrysippus"}"#).unwrap();
        assert_eq!(session.profile().level, 5);
        let store = session.into_store();
        assert_eq!(stored(&store).name, "Chrysippus");
    }

    #[test]
    fn test_avatar_reconciliation_and_eligibility() {
        let mut session = ProfileSession::load(MemoryStore::new(), PROFILE_STORAGE_KEY, Catalog::builtin(), now()).unwrap();
        let network = NetworkEnv::Amoy.config();
        assert_eq!(
            session.mint_eligibility(AvatarStage::Apprentice, network),
            Err(MintEligibilityError::NoWallet)
        );

        session.set_wallet(WalletState {
            address: Some("0x3333333333333333333333333333333333333333".to_string()),
            on_correct_network: true,
            chain: Some(ChainAvatar {
                balance: Some(1),
                token_id: Some(7),
                stage: Some(AvatarStage::Apprentice),
            }),
        });
        assert_eq!(session.reconcile_avatar(), "apprentice");
        assert_eq!(session.profile().current_avatar_id, "apprentice");
        assert!(session.profile().owned_nfts.contains("apprentice"));

        assert!(session.mint_eligibility(AvatarStage::Apprentice, network).is_err());
        assert!(session.mint_eligibility(AvatarStage::Practitioner, network).is_ok());
    }

    /// Loads fine, refuses every write
    struct ReadOnlyStore;

    impl DocumentStore for ReadOnlyStore {
        fn load(&self, _key: &str) -> Result<Option<String>, StoreError> {
            Ok(Some(r#"{"xp": 50}"#.to_string()))
        }

        fn save(&mut self, _key: &str, _raw: &str) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("quota exceeded".to_string()))
        }
    }

    #[test]
    fn test_failed_writes_keep_memory_state() {
        let mut session = ProfileSession::load(ReadOnlyStore, PROFILE_STORAGE_KEY, Catalog::builtin(), now()).unwrap();
        assert_eq!(session.profile().xp, 50);

        session.update(json!({"xp": 120}));
        assert_eq!(session.profile().xp, 120);
        assert_eq!(session.profile().level, 2);

        let err = session.persist().unwrap_err();
        assert_eq!(err.to_string(), "storage unavailable: quota exceeded");
        assert!(session.replace_document(r#"{"xp": 1}"#).is_err());
        // The rejected replacement never reaches the session
        assert_eq!(session.profile().xp, 120);
        assert_eq!(session.profile().level, 2);
    }

    #[test]
    fn test_failed_replace_does_not_notify() {
        let sources = RefCell::new(Vec::new());
        let mut session = ProfileSession::load(ReadOnlyStore, PROFILE_STORAGE_KEY, Catalog::builtin(), now()).unwrap();
        session.subscribe(|change: &ProfileChange<'_>| sources.borrow_mut().push(change.source));

        assert!(session.replace_document(r#"{"xp": 1200, "name": "Chrysippus"}"#).is_err());
        assert_eq!(session.profile().xp, 50);
        assert_eq!(session.profile().name, "Player");
        assert!(sources.borrow().is_empty());
    }

    #[test]
    fn test_unearned_stage_is_refused() {
        let mut session = ProfileSession::load(MemoryStore::new(), PROFILE_STORAGE_KEY, Catalog::builtin(), now()).unwrap();
        session.set_wallet(WalletState {
            address: Some("0x4444444444444444444444444444444444444444".to_string()),
            on_correct_network: true,
            chain: None,
        });
        let network = NetworkEnv::Amoy.config();
        assert_eq!(
            session.mint_eligibility(AvatarStage::Sage, network),
            Err(MintEligibilityError::NotEarned(AvatarStage::Sage))
        );
        assert_eq!(
            session.mint_eligibility(AvatarStage::Practitioner, network),
            Err(MintEligibilityError::NotEarned(AvatarStage::Practitioner))
        );

        // Level 5 owns Apprentice, which earns the next stage
        session.update(json!({"xp": 1000}));
        assert_eq!(
            session.mint_eligibility(AvatarStage::Apprentice, network),
            Err(MintEligibilityError::AlreadyAchieved(AvatarStage::Apprentice))
        );
        assert!(session.mint_eligibility(AvatarStage::Practitioner, network).is_ok());
    }
}
