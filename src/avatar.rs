// ==================== AVATAR RESOLUTION ====================
//
// Which avatar a player displays. When a wallet is linked on the right
// network the on-chain stage is the source of truth; the locally cached
// avatar is only the offline fallback.

use crate::catalog::Catalog;
use crate::config::{APPRENTICE_CHAPTER_ID, DEFAULT_AVATAR_ID};
use crate::patch::ProfilePatch;
use crate::profile::UserProfile;
use thiserror::Error;

/// On-chain avatar stage (matches the contract's enum order)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum AvatarStage {
    Novice = 0,
    Apprentice = 1,
    Practitioner = 2,
    Scholar = 3,
    Sage = 4,
    Epictetus = 5,
}

impl AvatarStage {
    pub const ALL: [AvatarStage; 6] = [
        AvatarStage::Novice,
        AvatarStage::Apprentice,
        AvatarStage::Practitioner,
        AvatarStage::Scholar,
        AvatarStage::Sage,
        AvatarStage::Epictetus,
    ];

    pub fn from_index(index: u64) -> Option<Self> {
        usize::try_from(index).ok().and_then(|i| Self::ALL.get(i).copied())
    }

    pub fn index(self) -> u8 {
        self as u8
    }

    pub fn name(self) -> &'static str {
        match self {
            AvatarStage::Novice => "Novice",
            AvatarStage::Apprentice => "Apprentice",
            AvatarStage::Practitioner => "Practitioner",
            AvatarStage::Scholar => "Scholar",
            AvatarStage::Sage => "Sage",
            AvatarStage::Epictetus => "Epictetus",
        }
    }

    /// Canonical avatar id (lower-cased stage name)
    pub fn avatar_id(self) -> &'static str {
        match self {
            AvatarStage::Novice => "novice",
            AvatarStage::Apprentice => "apprentice",
            AvatarStage::Practitioner => "practitioner",
            AvatarStage::Scholar => "scholar",
            AvatarStage::Sage => "sage",
            AvatarStage::Epictetus => "epictetus",
        }
    }

    /// Stage directly below this one
    pub fn previous(self) -> Option<Self> {
        u64::from(self.index()).checked_sub(1).and_then(Self::from_index)
    }
}

/// Last answer from the on-chain stage oracle for a wallet
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChainAvatar {
    /// NFT balance, if the lookup got that far
    pub balance: Option<u64>,
    pub token_id: Option<u64>,
    /// Resolved stage; `None` when the stage lookup failed or is pending
    pub stage: Option<AvatarStage>,
}

/// Wallet connection as seen by the module
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WalletState {
    pub address: Option<String>,
    pub on_correct_network: bool,
    /// `None` while on-chain data is still loading
    pub chain: Option<ChainAvatar>,
}

impl WalletState {
    pub fn disconnected() -> Self {
        WalletState::default()
    }

    fn usable_chain(&self) -> Option<&ChainAvatar> {
        if self.address.is_some() && self.on_correct_network {
            self.chain.as_ref()
        } else {
            None
        }
    }
}

/// Pick the avatar id to display for a player
pub fn resolve_current_avatar_id(profile: &UserProfile, wallet: &WalletState) -> String {
    let local = profile.current_avatar_id.as_str();
    let owned_locally = profile.owned_nfts.contains(local);

    if let Some(chain) = wallet.usable_chain() {
        if let Some(stage) = chain.stage {
            return stage.avatar_id().to_string();
        }
        if chain.balance.unwrap_or(0) > 0 {
            // Holds an NFT but the stage is unknown: keep a plausible local value
            if local != DEFAULT_AVATAR_ID && owned_locally {
                return local.to_string();
            }
            return DEFAULT_AVATAR_ID.to_string();
        }
    }

    if owned_locally {
        local.to_string()
    } else {
        DEFAULT_AVATAR_ID.to_string()
    }
}

/// Patch that caches a resolved avatar locally, if anything changes
pub fn reconcile_avatar(profile: &UserProfile, resolved_id: &str) -> Option<ProfilePatch> {
    let needs_owning = resolved_id != DEFAULT_AVATAR_ID && !profile.owned_nfts.contains(resolved_id);
    if profile.current_avatar_id == resolved_id && !needs_owning {
        return None;
    }

    let mut owned = profile.owned_nfts.clone();
    if resolved_id != DEFAULT_AVATAR_ID {
        owned.insert(resolved_id);
    }
    Some(
        ProfilePatch::merge()
            .set("currentAvatarId", resolved_id)
            .set("ownedNfts", owned.to_vec()),
    )
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MintEligibilityError {
    #[error("Please connect your wallet first.")]
    NoWallet,
    #[error("Please switch to the {0} to request a mint.")]
    WrongNetwork(&'static str),
    #[error("You have already achieved the {} stage!", .0.name())]
    AlreadyAchieved(AvatarStage),
    #[error("You have not earned the {} stage yet.", .0.name())]
    NotEarned(AvatarStage),
}

/// A stage is earned by reaching its catalog level or by holding the stage
/// below it. Held stages come from the chain when it has answered.
/// Apprentice is also earned by completing its chapter.
fn has_earned(profile: &UserProfile, wallet: &WalletState, catalog: &Catalog, stage: AvatarStage) -> bool {
    let Some(previous) = stage.previous() else {
        return true;
    };
    if stage == AvatarStage::Apprentice
        && profile.chapter(APPRENTICE_CHAPTER_ID).is_some_and(|c| c.is_completed)
    {
        return true;
    }
    let by_level = catalog
        .avatar(stage.avatar_id())
        .is_some_and(|avatar| avatar.required_level <= profile.level);
    let holds_previous = match wallet.chain.as_ref().and_then(|c| c.stage) {
        Some(on_chain) => on_chain >= previous,
        None => profile.owned_nfts.contains(previous.avatar_id()),
    };
    by_level || holds_previous
}

/// Whether a mint for `stage` may be requested.
/// A known on-chain stage is authoritative; the local owned set is only
/// consulted when the chain has not answered.
pub fn check_mint_eligibility(
    profile: &UserProfile,
    wallet: &WalletState,
    catalog: &Catalog,
    stage: AvatarStage,
    network_name: &'static str,
) -> Result<(), MintEligibilityError> {
    if wallet.address.is_none() {
        return Err(MintEligibilityError::NoWallet);
    }
    if !wallet.on_correct_network {
        return Err(MintEligibilityError::WrongNetwork(network_name));
    }

    let already = match wallet.chain.as_ref().and_then(|c| c.stage) {
        Some(on_chain) => stage <= on_chain,
        None => profile.owned_nfts.contains(stage.avatar_id()),
    };
    if already {
        return Err(MintEligibilityError::AlreadyAchieved(stage));
    }
    if !has_earned(profile, wallet, catalog, stage) {
        return Err(MintEligibilityError::NotEarned(stage));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patch::apply_update;
    use crate::profile::{ChapterProgress, UniqueList};

    fn profile_with(current: &str, owned: &[&str]) -> UserProfile {
        UserProfile {
            current_avatar_id: current.to_string(),
            owned_nfts: owned.iter().map(|s| s.to_string()).collect::<UniqueList>(),
            ..Default::default()
        }
    }

    fn connected(chain: Option<ChainAvatar>) -> WalletState {
        WalletState {
            address: Some("0x00000000000000000000000000000000000000aa".to_string()),
            on_correct_network: true,
            chain,
        }
    }

    #[test]
    fn test_stage_mapping() {
        assert_eq!(AvatarStage::from_index(1), Some(AvatarStage::Apprentice));
        assert_eq!(AvatarStage::from_index(6), None);
        assert_eq!(AvatarStage::Epictetus.index(), 5);
        assert_eq!(AvatarStage::Scholar.avatar_id(), "scholar");
        assert_eq!(AvatarStage::Sage.previous(), Some(AvatarStage::Scholar));
        assert_eq!(AvatarStage::Novice.previous(), None);
    }

    #[test]
    fn test_chain_stage_wins() {
        let profile = profile_with("apprentice", &["apprentice"]);
        let wallet = connected(Some(ChainAvatar {
            balance: Some(1),
            token_id: Some(42),
            stage: Some(AvatarStage::Scholar),
        }));
        assert_eq!(resolve_current_avatar_id(&profile, &wallet), "scholar");
    }

    #[test]
    fn test_balance_without_stage_falls_back() {
        let wallet = connected(Some(ChainAvatar {
            balance: Some(2),
            token_id: None,
            stage: None,
        }));
        let plausible = profile_with("apprentice", &["apprentice"]);
        assert_eq!(resolve_current_avatar_id(&plausible, &wallet), "apprentice");

        let not_owned = profile_with("sage", &["apprentice"]);
        assert_eq!(resolve_current_avatar_id(&not_owned, &wallet), "novice");

        let novice = profile_with("novice", &["novice"]);
        assert_eq!(resolve_current_avatar_id(&novice, &wallet), "novice");
    }

    #[test]
    fn test_offline_uses_local_cache() {
        let profile = profile_with("apprentice", &["apprentice"]);
        assert_eq!(resolve_current_avatar_id(&profile, &WalletState::disconnected()), "apprentice");

        // Wrong network ignores chain data
        let mut wallet = connected(Some(ChainAvatar {
            balance: Some(1),
            token_id: Some(1),
            stage: Some(AvatarStage::Sage),
        }));
        wallet.on_correct_network = false;
        assert_eq!(resolve_current_avatar_id(&profile, &wallet), "apprentice");

        // Still loading
        assert_eq!(resolve_current_avatar_id(&profile, &connected(None)), "apprentice");

        let unowned = profile_with("sage", &[]);
        assert_eq!(resolve_current_avatar_id(&unowned, &WalletState::disconnected()), "novice");
    }

    #[test]
    fn test_reconcile_avatar_patch() {
        let profile = profile_with("novice", &[]);
        let patch = reconcile_avatar(&profile, "practitioner").unwrap();
        let updated = apply_update(&profile, patch);
        assert_eq!(updated.current_avatar_id, "practitioner");
        assert_eq!(updated.owned_nfts.to_vec(), vec!["practitioner"]);

        assert!(reconcile_avatar(&updated, "practitioner").is_none());
        assert!(reconcile_avatar(&profile, "novice").is_none());
    }

    fn eligibility(profile: &UserProfile, wallet: &WalletState, stage: AvatarStage) -> Result<(), MintEligibilityError> {
        check_mint_eligibility(profile, wallet, Catalog::builtin(), stage, "Polygon Mainnet")
    }

    #[test]
    fn test_mint_eligibility() {
        let profile = profile_with("novice", &["apprentice"]);

        let err = eligibility(&profile, &WalletState::disconnected(), AvatarStage::Apprentice);
        assert_eq!(err, Err(MintEligibilityError::NoWallet));

        let mut wrong = connected(None);
        wrong.on_correct_network = false;
        let err = eligibility(&profile, &wrong, AvatarStage::Apprentice).unwrap_err();
        assert_eq!(err.to_string(), "Please switch to the Polygon Mainnet to request a mint.");

        // Chain unknown: local cache decides
        let err = eligibility(&profile, &connected(None), AvatarStage::Apprentice).unwrap_err();
        assert_eq!(err.to_string(), "You have already achieved the Apprentice stage!");
        assert!(eligibility(&profile, &connected(None), AvatarStage::Practitioner).is_ok());

        // Chain says Novice: chain overrides the local cache
        let chain_novice = connected(Some(ChainAvatar {
            balance: Some(1),
            token_id: Some(3),
            stage: Some(AvatarStage::Novice),
        }));
        assert!(eligibility(&profile, &chain_novice, AvatarStage::Apprentice).is_ok());
        assert!(eligibility(&profile, &chain_novice, AvatarStage::Novice).is_err());
        assert_eq!(
            eligibility(&profile, &chain_novice, AvatarStage::Practitioner),
            Err(MintEligibilityError::NotEarned(AvatarStage::Practitioner))
        );
    }

    #[test]
    fn test_unearned_stages_are_refused() {
        let fresh = UserProfile::default();
        let wallet = connected(None);
        for stage in [AvatarStage::Apprentice, AvatarStage::Scholar, AvatarStage::Sage, AvatarStage::Epictetus] {
            assert_eq!(eligibility(&fresh, &wallet, stage), Err(MintEligibilityError::NotEarned(stage)));
        }
        let err = eligibility(&fresh, &wallet, AvatarStage::Epictetus).unwrap_err();
        assert_eq!(err.to_string(), "You have not earned the Epictetus stage yet.");
        // Novice has no prerequisite
        assert!(eligibility(&fresh, &wallet, AvatarStage::Novice).is_ok());
    }

    #[test]
    fn test_level_earns_a_stage() {
        let wallet = connected(None);
        let level_23 = UserProfile {
            xp: 2500,
            level: 23,
            ..Default::default()
        };
        // Scholar needs level 15, Sage 20
        assert!(eligibility(&level_23, &wallet, AvatarStage::Scholar).is_ok());
        assert!(eligibility(&level_23, &wallet, AvatarStage::Sage).is_ok());

        let level_4 = UserProfile {
            xp: 600,
            level: 4,
            ..Default::default()
        };
        assert_eq!(
            eligibility(&level_4, &wallet, AvatarStage::Apprentice),
            Err(MintEligibilityError::NotEarned(AvatarStage::Apprentice))
        );

        let mut chapter_five = ChapterProgress::template(APPRENTICE_CHAPTER_ID, "2026-01-01T00:00:00.000Z");
        chapter_five.is_completed = true;
        let mut finished = level_4.clone();
        finished.progress.chapters.insert(APPRENTICE_CHAPTER_ID.to_string(), chapter_five);
        assert!(eligibility(&finished, &wallet, AvatarStage::Apprentice).is_ok());
        assert!(eligibility(&finished, &wallet, AvatarStage::Practitioner).is_err());
    }
}
