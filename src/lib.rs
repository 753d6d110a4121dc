use spacetimedb::{
    ReducerContext, Identity, Table, Timestamp, ScheduleAt,
    table, reducer, view,
    client_visibility_filter, Filter,
};
use chrono::{DateTime, Utc};
use serde_json::{json, Value};

mod avatar;
mod catalog;
mod config;
mod levels;
mod mint;
mod outbox;
mod patch;
mod profile;
mod progress;
mod store;

// Bulk restore reducers for disaster recovery
mod restore;

use avatar::{AvatarStage, ChainAvatar, WalletState};
use catalog::Catalog;
use config::{NetworkEnv, SENT_REQUEST_RETENTION_DAYS};
use outbox::{Delivery, MintRequestEvent, OutboxEvent, RetryPolicy};
use patch::{ProfilePatch, Update};
use profile::UserProfile;
use store::{ChangeSource, DocumentStore, ProfileChange, ProfileSession, StoreError};

// ==================== CONSTANTS ====================

/// Primary key of the singleton module_config row
const CONFIG_ROW_ID: u8 = 0;

/// How often sent mint requests are pruned
const PRUNE_INTERVAL_SECS: u64 = 60 * 60;

const MICROS_PER_MINUTE: i64 = 60 * 1_000_000;
const MICROS_PER_DAY: i128 = 24 * 60 * 60 * 1_000_000;

// ==================== TABLES ====================

/// Session links ephemeral connection to stable player
/// PRIVATE: Links connection identity to player ID (no PII)
#[table(name = session)]
pub struct Session {
    #[primary_key]
    pub connection_id: Identity,

    /// Stable player ID - verified by gateway
    pub player_id: String,

    /// When this session was created
    pub connected_at: Timestamp,
}

/// Player progress document (camelCase JSON)
/// PRIVATE: Clients read their own via the my_profile view
#[table(name = profile_document)]
#[derive(Clone)]
pub struct ProfileDocument {
    #[primary_key]
    pub player_id: String,

    pub document: String,

    pub updated_at: Timestamp,
}

/// Public progress summary, refreshed after every profile change
#[table(name = progress_summary, public)]
pub struct ProgressSummary {
    #[primary_key]
    pub player_id: String,

    pub name: String,
    pub xp: u64,
    pub level: u32,

    /// XP still needed for the next level (0 past the last defined level)
    pub xp_to_next_level: u64,

    /// Progress through the current level band, 0..=100
    pub level_progress: f64,

    pub current_avatar_id: String,
    pub completed_chapters: u32,
    pub streak: u32,
    pub updated_at: Timestamp,
}

/// Wallet a player linked from the client
#[table(name = wallet_link)]
pub struct WalletLink {
    #[primary_key]
    pub player_id: String,

    /// Lower-cased 0x address
    #[index(btree)]
    pub wallet_address: String,

    /// Chain the wallet was connected to when linked
    pub chain_id: u64,

    pub linked_at: Timestamp,
}

/// Last on-chain avatar lookup for a wallet, reported by the chain worker
#[table(name = chain_avatar)]
pub struct ChainAvatarRecord {
    #[primary_key]
    pub wallet_address: String,

    /// NFT balance; None if the lookup failed before it was known
    pub balance: Option<u64>,

    pub token_id: Option<u64>,

    /// Stage enum value (0 = Novice .. 5 = Epictetus); None if the stage lookup failed
    pub stage: Option<u8>,

    pub updated_at: Timestamp,
}

/// Mint request outbox - reliable delivery of mint requests to the intake
/// SECURITY: Public table with RLS protection - only authorized workers can see rows
#[table(name = mint_request_queue, public)]
pub struct MintRequestQueue {
    #[primary_key]
    #[auto_inc]
    pub id: u64,

    /// Player who earned the avatar
    #[index(btree)]
    pub player_id: String,

    #[index(btree)]
    pub wallet_address: String,

    pub stage: u8,

    /// JSON: {walletAddress, stageToMint, stageName, reason}
    pub payload: String,

    /// Created timestamp for FIFO processing
    #[index(btree)]
    pub created_at: Timestamp,

    /// Delivered, or closed after the last allowed attempt
    #[index(btree)]
    pub sent: bool,

    /// Send attempt count
    pub attempts: u8,

    /// When to retry (NULL = now)
    #[index(btree)]
    pub next_retry_at: Option<Timestamp>,

    /// Last error if failed
    pub last_error: Option<String>,

    /// When successfully sent
    pub sent_at: Option<Timestamp>,
}

/// Mint requests accepted by the intake, waiting for an admin to mint
#[table(name = pending_mint)]
pub struct PendingMint {
    #[primary_key]
    #[auto_inc]
    pub id: u64,

    #[index(btree)]
    pub wallet_address: String,

    pub stage_to_mint: u64,
    pub stage_name: String,
    pub reason: String,
    pub requested_at: Timestamp,

    /// "Pending Admin Minting" until an admin processes it
    pub status: String,
}

/// Durable copy of every saved reflection
#[table(name = reflection_archive)]
pub struct ReflectionArchive {
    #[primary_key]
    #[auto_inc]
    pub id: u64,

    #[index(btree)]
    pub player_id: String,

    pub wallet_address: Option<String>,
    pub chapter_id: String,
    pub reflection_id: String,
    pub content: String,
    pub created_at: Timestamp,
}

/// Singleton module settings (row id 0)
/// PUBLIC: clients read the contract and chain details they connect to
#[table(name = module_config, public)]
pub struct ModuleConfig {
    #[primary_key]
    pub id: u8,

    /// "mainnet" or "amoy"
    pub network: String,

    pub network_name: String,
    pub chain_id: u64,
    pub chain_id_hex: String,
    pub avatar_contract_address: String,
    pub alchemy_network: String,
    pub currency_name: String,
    pub currency_symbol: String,
    pub currency_decimals: u8,
    pub block_explorer_url: String,

    pub updated_at: Timestamp,
}

/// Authorized identities that can access protected tables and admin reducers
/// Used for RLS filtering and reducer authorization checks
#[table(name = authorized_worker)]
pub struct AuthorizedWorker {
    #[primary_key]
    pub identity: Identity,
}

/// Schedule table for pruning the mint request queue
#[table(name = mint_queue_prune_schedule, scheduled(prune_sent_mint_requests))]
pub struct MintQueuePruneSchedule {
    #[primary_key]
    #[auto_inc]
    pub id: u64,

    pub scheduled_at: ScheduleAt,
}

// ==================== VIEWS ====================

/// View: Returns only the current user's progress document
/// Clients use: SELECT * FROM my_profile
#[view(name = my_profile, public)]
fn my_profile(ctx: &spacetimedb::ViewContext) -> Option<ProfileDocument> {
    let session = ctx.db.session().connection_id().find(ctx.sender)?;
    ctx.db.profile_document().player_id().find(&session.player_id)
}

// ==================== ROW LEVEL SECURITY ====================

/// RLS Filter: Only authorized workers can see mint_request_queue rows
/// Wallet addresses stay hidden from other players while the worker can
/// still subscribe and drain the queue
#[client_visibility_filter]
const MINT_QUEUE_VISIBILITY: Filter = Filter::Sql(
    "SELECT mq.* FROM mint_request_queue mq
     JOIN authorized_worker aw WHERE aw.identity = :sender"
);

// ==================== HELPERS ====================

fn is_authorized(ctx: &ReducerContext) -> bool {
    ctx.db.authorized_worker().identity().find(&ctx.sender).is_some()
}

/// Log-safe prefix of an id
fn short_id(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}

/// Reducer time as a chrono timestamp (epoch if out of range)
fn now(ctx: &ReducerContext) -> DateTime<Utc> {
    DateTime::from_timestamp_micros(ctx.timestamp.to_micros_since_unix_epoch()).unwrap_or_default()
}

/// Get player id from session using the sender's identity
fn get_player_id(ctx: &ReducerContext) -> Result<String, String> {
    ctx.db.session()
        .connection_id()
        .find(&ctx.sender)
        .map(|s| s.player_id)
        .ok_or("No session found".to_string())
}

fn active_network(ctx: &ReducerContext) -> NetworkEnv {
    ctx.db.module_config()
        .id()
        .find(&CONFIG_ROW_ID)
        .map(|c| NetworkEnv::parse(&c.network))
        .unwrap_or_default()
}

fn config_row(ctx: &ReducerContext, env: NetworkEnv) -> ModuleConfig {
    let network = env.config();
    ModuleConfig {
        id: CONFIG_ROW_ID,
        network: env.as_str().to_string(),
        network_name: network.network_name.to_string(),
        chain_id: network.chain_id,
        chain_id_hex: network.chain_id_hex.to_string(),
        avatar_contract_address: network.avatar_contract_address.to_string(),
        alchemy_network: network.alchemy_network.to_string(),
        currency_name: network.native_currency.name.to_string(),
        currency_symbol: network.native_currency.symbol.to_string(),
        currency_decimals: network.native_currency.decimals,
        block_explorer_url: network.block_explorer_url.to_string(),
        updated_at: ctx.timestamp,
    }
}

fn wallet_state(ctx: &ReducerContext, player_id: &str) -> WalletState {
    let Some(link) = ctx.db.wallet_link().player_id().find(&player_id.to_string()) else {
        return WalletState::disconnected();
    };

    let chain = ctx.db.chain_avatar()
        .wallet_address()
        .find(&link.wallet_address)
        .map(|record| ChainAvatar {
            balance: record.balance,
            token_id: record.token_id,
            stage: record.stage.and_then(|s| AvatarStage::from_index(u64::from(s))),
        });

    WalletState {
        on_correct_network: active_network(ctx).config().is_chain(link.chain_id),
        address: Some(link.wallet_address),
        chain,
    }
}

/// Profile documents live in the profile_document table, keyed by player id
struct TableStore<'c> {
    ctx: &'c ReducerContext,
}

impl DocumentStore for TableStore<'_> {
    fn load(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.ctx.db.profile_document()
            .player_id()
            .find(&key.to_string())
            .map(|row| row.document))
    }

    fn save(&mut self, key: &str, raw: &str) -> Result<(), StoreError> {
        if key.is_empty() {
            return Err(StoreError::Unavailable("empty player id".to_string()));
        }
        let row = ProfileDocument {
            player_id: key.to_string(),
            document: raw.to_string(),
            updated_at: self.ctx.timestamp,
        };
        if self.ctx.db.profile_document().player_id().find(&row.player_id).is_some() {
            self.ctx.db.profile_document().player_id().update(row);
        } else {
            self.ctx.db.profile_document().insert(row);
        }
        Ok(())
    }
}

fn write_summary(ctx: &ReducerContext, player_id: &str, profile: &UserProfile) {
    let overall = progress::overall_progress(profile, Catalog::builtin());
    let row = ProgressSummary {
        player_id: player_id.to_string(),
        name: profile.name.clone(),
        xp: overall.xp,
        level: overall.level,
        xp_to_next_level: levels::get_xp_to_next_level(overall.xp),
        level_progress: levels::get_level_progress_percentage(overall.xp),
        current_avatar_id: profile.current_avatar_id.clone(),
        completed_chapters: u32::try_from(overall.completed_chapters).unwrap_or(u32::MAX),
        streak: overall.streak,
        updated_at: ctx.timestamp,
    };
    if ctx.db.progress_summary().player_id().find(&row.player_id).is_some() {
        ctx.db.progress_summary().player_id().update(row);
    } else {
        ctx.db.progress_summary().insert(row);
    }
}

/// Open the player's profile session with their wallet state attached.
/// Every committed change refreshes the public summary row.
fn open_session<'c>(ctx: &'c ReducerContext, player_id: &str) -> Result<ProfileSession<'c, TableStore<'c>>, String> {
    let mut session = ProfileSession::load(TableStore { ctx }, player_id, Catalog::builtin(), now(ctx))
        .map_err(|e| e.to_string())?;
    session.set_wallet(wallet_state(ctx, player_id));

    if ctx.db.progress_summary().player_id().find(&player_id.to_string()).is_none() {
        write_summary(ctx, player_id, session.profile());
    }
    let pid = player_id.to_string();
    session.subscribe(move |change: &ProfileChange<'_>| {
        if let Some(up) = change.level_up {
            log::info!(
                "[LEVEL] player:{} {} -> {} next_level_xp={} unlocked={:?}",
                short_id(&pid),
                up.from,
                up.to,
                levels::get_xp_for_level(up.to.saturating_add(1)),
                up.unlocked_avatars
            );
        }
        if change.source != ChangeSource::Local {
            log::info!("[STORE] player:{} document replaced ({:?})", short_id(&pid), change.source);
        }
        write_summary(ctx, &pid, change.profile);
    });
    Ok(session)
}

fn enqueue_mint_request(ctx: &ReducerContext, player_id: &str, request: &MintRequestEvent) {
    let stage = request.stage.index();
    let duplicate = ctx.db.mint_request_queue()
        .wallet_address()
        .filter(&request.wallet_address)
        .any(|row| row.stage == stage && !row.sent);
    if duplicate {
        log::info!("[MINT] request already queued wallet:{} stage:{}", short_id(&request.wallet_address), request.stage.name());
        return;
    }

    let row = ctx.db.mint_request_queue().insert(MintRequestQueue {
        id: 0, // auto_inc
        player_id: player_id.to_string(),
        wallet_address: request.wallet_address.clone(),
        stage,
        payload: request.payload().to_string(),
        created_at: ctx.timestamp,
        sent: false,
        attempts: 0,
        next_retry_at: None, // Ready to send immediately
        last_error: None,
        sent_at: None,
    });
    log::info!("[MINT] queued request:{} player:{} stage:{}", row.id, short_id(player_id), request.stage.name());
}

/// Turn the session's outbox events into rows
fn flush_outbox<S: DocumentStore>(ctx: &ReducerContext, player_id: &str, session: &mut ProfileSession<'_, S>) {
    for event in session.take_outbox() {
        log::debug!("[OUTBOX] player:{} {}", short_id(player_id), event.kind());
        match event {
            OutboxEvent::MintRequest(request) => enqueue_mint_request(ctx, player_id, &request),
            OutboxEvent::ArchiveReflection(entry) => {
                ctx.db.reflection_archive().insert(ReflectionArchive {
                    id: 0, // auto_inc
                    player_id: player_id.to_string(),
                    wallet_address: entry.wallet_address,
                    chapter_id: entry.chapter_id,
                    reflection_id: entry.reflection_id,
                    content: entry.content,
                    created_at: ctx.timestamp,
                });
            }
        }
    }
}

// ==================== REDUCERS ====================

/// Initialize module - authorize the owner, default config, schedule pruning
#[reducer(init)]
pub fn init(ctx: &ReducerContext) {
    // In init, ctx.sender is the module owner identity
    if ctx.db.authorized_worker().identity().find(&ctx.sender).is_none() {
        ctx.db.authorized_worker().insert(AuthorizedWorker {
            identity: ctx.sender,
        });
    }

    if ctx.db.module_config().id().find(&CONFIG_ROW_ID).is_none() {
        ctx.db.module_config().insert(config_row(ctx, NetworkEnv::default()));
    }

    // Avoid duplicate schedulers on hot-reload
    if ctx.db.mint_queue_prune_schedule().iter().count() == 0 {
        ctx.db.mint_queue_prune_schedule().insert(MintQueuePruneSchedule {
            id: 0, // auto_inc
            scheduled_at: ScheduleAt::Interval(std::time::Duration::from_secs(PRUNE_INTERVAL_SECS).into()),
        });
    }

    log::info!("Stoic Quest module initialized network:{}", active_network(ctx).as_str());
}

/// Create a verified session for a client identity
/// Called by the gateway after verifying the player's token
#[reducer]
pub fn create_session(ctx: &ReducerContext, client_identity: String, player_id: String) -> Result<(), String> {
    if !is_authorized(ctx) {
        log::warn!("Unauthorized create_session attempt by {}", ctx.sender);
        return Err("Unauthorized".to_string());
    }

    let identity = Identity::from_hex(&client_identity)
        .map_err(|_| format!("Invalid identity hex string: {}", client_identity))?;

    // Same player (unclean reconnect) or same connection id (prevents PK conflict)
    let stale_sessions: Vec<_> = ctx.db.session()
        .iter()
        .filter(|s| s.player_id == player_id || s.connection_id == identity)
        .map(|s| s.connection_id)
        .collect();
    for conn_id in stale_sessions {
        ctx.db.session().connection_id().delete(&conn_id);
    }

    ctx.db.session().insert(Session {
        connection_id: identity,
        player_id: player_id.clone(),
        connected_at: ctx.timestamp,
    });

    log::info!("[SESSION] created player:{} ws:{}", short_id(&player_id), short_id(&client_identity));
    Ok(())
}

/// Player opens the app: load or create the profile, count the login,
/// refresh the displayed avatar
#[reducer]
pub fn connect(ctx: &ReducerContext, name: Option<String>) -> Result<(), String> {
    let player_id = get_player_id(ctx)?;
    let is_new = ctx.db.profile_document().player_id().find(&player_id).is_none();

    let mut session = open_session(ctx, &player_id)?;

    if let Some(name) = name.map(|n| n.trim().to_string()).filter(|n| !n.is_empty()) {
        session.update(Update::derive(move |current: &UserProfile| {
            if current.name == name {
                ProfilePatch::merge()
            } else {
                ProfilePatch::merge().set("name", name)
            }
        }));
    }

    let login = session.record_login(now(ctx));
    let avatar = session.reconcile_avatar();
    flush_outbox(ctx, &player_id, &mut session);

    let overall = session.overall_progress();
    log::info!(
        "[CONNECT] player=\"{}\" player_id={} type={} level={} xp={} streak={} new_day={} chapters={}/{} challenges={} reflections={} avatar={} wallet={} token={:?}",
        session.profile().name,
        short_id(&player_id),
        if is_new { "new" } else { "returning" },
        overall.level,
        overall.xp,
        login.streak,
        login.is_new_day,
        overall.completed_chapters,
        overall.total_chapters,
        overall.total_challenges,
        overall.total_reflections,
        avatar,
        session.wallet().address.is_some(),
        session.wallet().chain.as_ref().and_then(|c| c.token_id)
    );
    Ok(())
}

#[reducer]
pub fn complete_section(ctx: &ReducerContext, chapter_id: String, section_id: String) -> Result<(), String> {
    let player_id = get_player_id(ctx)?;
    let (chapter, _) = Catalog::builtin()
        .section(&chapter_id, &section_id)
        .map_err(|e| e.to_string())?;
    let mut session = open_session(ctx, &player_id)?;

    let outcome = session.complete_section(now(ctx), &chapter_id, &section_id);
    flush_outbox(ctx, &player_id, &mut session);

    let read = progress::chapter_progress(session.profile(), &chapter_id, now(ctx)).completed_sections.len();
    log::info!(
        "[SECTION] player:{} {}/{} xp_earned={} sections={}/{} chapter_completed={} unlocked_next={}",
        short_id(&player_id),
        chapter_id,
        section_id,
        outcome.xp_earned,
        read,
        chapter.sections.len(),
        outcome.is_chapter_completed,
        outcome.unlocked_next.as_deref().unwrap_or("-")
    );
    Ok(())
}

/// XP comes from the catalog, never from the client
#[reducer]
pub fn complete_challenge(
    ctx: &ReducerContext,
    chapter_id: String,
    challenge_id: String,
    details_json: Option<String>,
) -> Result<(), String> {
    let player_id = get_player_id(ctx)?;

    let xp_reward = Catalog::builtin()
        .known_challenge(&chapter_id, &challenge_id)
        .map(|c| c.xp_reward)
        .map_err(|e| e.to_string())?;

    let details: Value = match details_json {
        Some(raw) => serde_json::from_str(&raw).map_err(|e| format!("Invalid details JSON: {}", e))?,
        None => json!({}),
    };

    let mut session = open_session(ctx, &player_id)?;
    let outcome = session.complete_challenge(now(ctx), &chapter_id, &challenge_id, xp_reward, details);
    flush_outbox(ctx, &player_id, &mut session);

    log::info!(
        "[CHALLENGE] player:{} {}/{} xp_earned={} first={}",
        short_id(&player_id),
        chapter_id,
        challenge_id,
        outcome.xp_earned,
        outcome.is_first_completion
    );
    Ok(())
}

#[reducer]
pub fn save_reflection(ctx: &ReducerContext, chapter_id: String, reflection_id: String, content: String) -> Result<(), String> {
    let player_id = get_player_id(ctx)?;
    // Reflections answer a section's prompt
    Catalog::builtin()
        .section(&chapter_id, &reflection_id)
        .map_err(|e| e.to_string())?;
    let mut session = open_session(ctx, &player_id)?;

    let outcome = session.save_reflection(now(ctx), &chapter_id, &reflection_id, &content);
    flush_outbox(ctx, &player_id, &mut session);

    log::info!(
        "[REFLECTION] player:{} {}/{} xp_earned={} first={} chars={}",
        short_id(&player_id),
        chapter_id,
        reflection_id,
        outcome.xp_earned,
        outcome.is_first_reflection,
        content.chars().count()
    );
    Ok(())
}

#[reducer]
pub fn unlock_chapter(ctx: &ReducerContext, chapter_id: String) -> Result<(), String> {
    let player_id = get_player_id(ctx)?;
    let mut session = open_session(ctx, &player_id)?;

    let outcome = session.unlock_chapter(now(ctx), &chapter_id);
    log::info!("[UNLOCK] player:{} chapter:{} outcome={:?}", short_id(&player_id), chapter_id, outcome);

    match outcome {
        progress::UnlockOutcome::UnknownChapter => Err(format!("Unknown chapter {}", chapter_id)),
        _ => Ok(()),
    }
}

#[reducer]
pub fn claim_achievements(ctx: &ReducerContext) -> Result<(), String> {
    let player_id = get_player_id(ctx)?;
    let mut session = open_session(ctx, &player_id)?;

    let outcome = session.claim_achievements(now(ctx));
    if !outcome.unlocked.is_empty() {
        log::info!(
            "[ACHIEVEMENT] player:{} unlocked={:?} xp_earned={}",
            short_id(&player_id),
            outcome.unlocked,
            outcome.xp_earned
        );
    }
    Ok(())
}

#[reducer]
pub fn set_translation_preference(ctx: &ReducerContext, preference: String) -> Result<(), String> {
    let player_id = get_player_id(ctx)?;
    let preference = profile::TranslationPreference::parse(&preference)
        .ok_or(format!("Unknown translation preference {}", preference))?;

    let mut session = open_session(ctx, &player_id)?;
    session.update(json!({ "settings": { "translationPreference": preference.as_str() } }));
    Ok(())
}

/// Link the player's wallet; chain_id is the chain the wallet is connected to
#[reducer]
pub fn link_wallet(ctx: &ReducerContext, wallet_address: String, chain_id: u64) -> Result<(), String> {
    let player_id = get_player_id(ctx)?;
    if !mint::is_valid_wallet_address(&wallet_address) {
        return Err(mint::MintRequestError::InvalidWalletAddress.to_string());
    }

    let link = WalletLink {
        player_id: player_id.clone(),
        wallet_address: wallet_address.to_ascii_lowercase(),
        chain_id,
        linked_at: ctx.timestamp,
    };
    if ctx.db.wallet_link().player_id().find(&player_id).is_some() {
        ctx.db.wallet_link().player_id().update(link);
    } else {
        ctx.db.wallet_link().insert(link);
    }

    let mut session = open_session(ctx, &player_id)?;
    let avatar = session.reconcile_avatar();
    let network = active_network(ctx).config();
    if !network.is_chain(chain_id) {
        log::warn!("[WALLET] player:{} linked on chain {} (expected {})", short_id(&player_id), chain_id, network.chain_id);
    }
    log::info!("[WALLET] linked player:{} wallet:{} avatar={}", short_id(&player_id), short_id(&wallet_address), avatar);
    Ok(())
}

#[reducer]
pub fn unlink_wallet(ctx: &ReducerContext) -> Result<(), String> {
    let player_id = get_player_id(ctx)?;
    if ctx.db.wallet_link().player_id().delete(&player_id) {
        log::info!("[WALLET] unlinked player:{}", short_id(&player_id));
    }
    Ok(())
}

/// Chain worker reports the avatar NFT held by a wallet.
/// Linked players get their displayed avatar reconciled.
#[reducer]
pub fn report_chain_avatar(
    ctx: &ReducerContext,
    wallet_address: String,
    balance: Option<u64>,
    token_id: Option<u64>,
    stage: Option<u8>,
) -> Result<(), String> {
    if !is_authorized(ctx) {
        log::warn!("Unauthorized report_chain_avatar attempt by {}", ctx.sender);
        return Err("Unauthorized".to_string());
    }

    let wallet_address = wallet_address.to_ascii_lowercase();
    let stage = match stage {
        Some(s) if AvatarStage::from_index(u64::from(s)).is_none() => {
            log::error!("[AVATAR] unknown stage {} for wallet:{}", s, short_id(&wallet_address));
            None
        }
        other => other,
    };

    let record = ChainAvatarRecord {
        wallet_address: wallet_address.clone(),
        balance,
        token_id,
        stage,
        updated_at: ctx.timestamp,
    };
    if ctx.db.chain_avatar().wallet_address().find(&wallet_address).is_some() {
        ctx.db.chain_avatar().wallet_address().update(record);
    } else {
        ctx.db.chain_avatar().insert(record);
    }

    let linked: Vec<String> = ctx.db.wallet_link()
        .wallet_address()
        .filter(&wallet_address)
        .map(|link| link.player_id)
        .collect();
    for player_id in &linked {
        let mut session = open_session(ctx, player_id)?;
        let avatar = session.reconcile_avatar();
        log::info!("[AVATAR] player:{} wallet:{} stage={:?} avatar={}", short_id(player_id), short_id(&wallet_address), stage, avatar);
    }
    Ok(())
}

/// Player asks to mint a stage from the profile screen
#[reducer]
pub fn request_avatar_mint(ctx: &ReducerContext, stage: u8) -> Result<(), String> {
    let player_id = get_player_id(ctx)?;
    let stage = AvatarStage::from_index(u64::from(stage))
        .ok_or(format!("Unknown avatar stage {}", stage))?;

    let session = open_session(ctx, &player_id)?;
    let network = active_network(ctx).config();
    if let Err(e) = session.mint_eligibility(stage, network) {
        log::info!("[MINT] player:{} stage:{} rejected: {}", short_id(&player_id), stage.name(), e);
        return Err(e.to_string());
    }
    let wallet_address = session.wallet()
        .address
        .clone()
        .ok_or("Please connect your wallet first.".to_string())?;

    enqueue_mint_request(ctx, &player_id, &MintRequestEvent {
        wallet_address,
        stage,
        reason: format!("User requested {} avatar via profile button.", stage.name()),
    });
    Ok(())
}

/// Mint request intake, called by the gateway for each HTTP request.
/// Non-2xx responses are returned as errors carrying the response body.
#[reducer]
pub fn request_nft_mint(ctx: &ReducerContext, method: String, body_json: String) -> Result<(), String> {
    if !is_authorized(ctx) {
        log::warn!("Unauthorized request_nft_mint attempt by {}", ctx.sender);
        return Err("Unauthorized".to_string());
    }

    // Unparseable bodies fall through to field validation (400)
    let body: Value = serde_json::from_str(&body_json).unwrap_or(Value::Null);

    let response = mint::handle_mint_request(&method, &body, |request| {
        let row = ctx.db.pending_mint().insert(PendingMint {
            id: 0, // auto_inc
            wallet_address: request.wallet_address.clone(),
            stage_to_mint: request.stage_to_mint,
            stage_name: request.stage_name.clone(),
            reason: request.reason.clone(),
            requested_at: ctx.timestamp,
            status: mint::PENDING_STATUS.to_string(),
        });
        Ok(row.id.to_string())
    });

    log::debug!("[MINT] intake status:{} headers:{:?}", response.status, response.headers);
    if response.status >= 400 {
        return Err(format!("{} {}", response.status, response.body_string()));
    }
    // Callers read the stored row from pending_mint by this id
    if let Some(pending_id) = response.pending_mint_id() {
        log::info!("[MINT] intake accepted pending_mint:{}", pending_id);
    }
    Ok(())
}

/// Mark a queued mint request as delivered (called by worker)
#[reducer]
pub fn mark_mint_request_sent(ctx: &ReducerContext, request_id: u64, error: Option<String>) -> Result<(), String> {
    if !is_authorized(ctx) {
        log::warn!("Unauthorized mark_mint_request_sent attempt by {}", ctx.sender);
        return Err("Unauthorized".to_string());
    }

    let Some(mut request) = ctx.db.mint_request_queue().id().find(&request_id) else {
        log::error!("mark_mint_request_sent: request {} not found", request_id);
        return Err(format!("Mint request {} not found", request_id));
    };

    match error {
        None => {
            request.sent = true;
            request.sent_at = Some(ctx.timestamp);
            request.last_error = None;
            log::info!("[MINT] request {} delivered", request_id);
        }
        Some(error) => {
            request.attempts = request.attempts.saturating_add(1);
            request.last_error = Some(error);

            match RetryPolicy::default().after_failure(request.attempts) {
                Delivery::RetryIn { minutes } => {
                    let backoff_micros = i64::try_from(minutes).unwrap_or(i64::MAX / MICROS_PER_MINUTE) * MICROS_PER_MINUTE;
                    let current_micros = ctx.timestamp.to_micros_since_unix_epoch();
                    request.next_retry_at = Some(Timestamp::from_micros_since_unix_epoch(current_micros.saturating_add(backoff_micros)));
                    log::warn!("[MINT] request {} failed (attempt {}): {:?}", request_id, request.attempts, request.last_error);
                }
                Delivery::GiveUp => {
                    // Closed; stays in the table until pruned
                    request.sent = true;
                    log::error!(
                        "[MINT] dead_letter request:{} player:{} attempts:{} error:{} payload:{}",
                        request_id,
                        short_id(&request.player_id),
                        request.attempts,
                        request.last_error.as_deref().unwrap_or("none"),
                        request.payload
                    );
                }
            }
        }
    }

    ctx.db.mint_request_queue().id().update(request);
    Ok(())
}

/// Select the Polygon network wallets are validated against
#[reducer]
pub fn set_network(ctx: &ReducerContext, network: String) -> Result<(), String> {
    if !is_authorized(ctx) {
        log::warn!("Unauthorized set_network attempt by {}", ctx.sender);
        return Err("Unauthorized".to_string());
    }

    let env = NetworkEnv::parse(&network);
    let row = config_row(ctx, env);
    if ctx.db.module_config().id().find(&CONFIG_ROW_ID).is_some() {
        ctx.db.module_config().id().update(row);
    } else {
        ctx.db.module_config().insert(row);
    }

    log::info!("[ADMIN] network set to {} (chain {})", env.config().network_name, env.config().chain_id);
    Ok(())
}

/// Admin: Reset a player's progress document to defaults
#[reducer]
pub fn admin_reset_profile(ctx: &ReducerContext, player_id: String) -> Result<(), String> {
    if !is_authorized(ctx) {
        log::warn!("Unauthorized admin_reset_profile attempt by {}", ctx.sender);
        return Err("Unauthorized".to_string());
    }
    if ctx.db.profile_document().player_id().find(&player_id).is_none() {
        log::error!("admin_reset_profile: player {} not found", player_id);
        return Err(format!("Player {} not found", player_id));
    }

    // Drop the stored document, then let the open session pick up the removal
    let mut session = open_session(ctx, &player_id)?;
    ctx.db.profile_document().player_id().delete(&player_id);
    session.on_external_change(&player_id, None);
    session.persist().map_err(|e| e.to_string())?;

    log::info!("[ADMIN] reset profile player:{}", short_id(&player_id));
    Ok(())
}

/// Delete delivered or closed mint requests once the retention window passed
#[reducer]
pub fn prune_sent_mint_requests(ctx: &ReducerContext, _schedule: MintQueuePruneSchedule) {
    if ctx.sender != ctx.identity() {
        log::warn!("prune_sent_mint_requests called by {}", ctx.sender);
        return;
    }

    let retention_micros = i128::from(SENT_REQUEST_RETENTION_DAYS) * MICROS_PER_DAY;
    let now_micros = i128::from(ctx.timestamp.to_micros_since_unix_epoch());

    let expired: Vec<u64> = ctx.db.mint_request_queue()
        .sent()
        .filter(&true)
        .filter(|row| {
            // Closed rows never got a sent_at
            let reference = row.sent_at.unwrap_or(row.created_at);
            now_micros - i128::from(reference.to_micros_since_unix_epoch()) > retention_micros
        })
        .map(|row| row.id)
        .collect();

    for id in &expired {
        ctx.db.mint_request_queue().id().delete(id);
    }
    if !expired.is_empty() {
        log::info!("[MINT] pruned {} sent requests", expired.len());
    }
}

/// Clean up session when player disconnects
#[reducer(client_disconnected)]
pub fn on_disconnect(ctx: &ReducerContext) {
    if let Some(session) = ctx.db.session().connection_id().find(&ctx.sender) {
        let session_secs = ctx.timestamp.duration_since(session.connected_at)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        log::info!("[DISCONNECT] player:{} session_min:{:.1}", short_id(&session.player_id), session_secs as f32 / 60.0);
        ctx.db.session().connection_id().delete(&ctx.sender);
    }
}
