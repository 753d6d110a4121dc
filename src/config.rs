// Game tuning constants and blockchain network configuration.

/// XP for the first completion of a section
pub const SECTION_XP: u64 = 5;

/// Bonus XP when the last missing section of a chapter is completed
pub const CHAPTER_COMPLETION_BONUS_XP: u64 = 20;

/// XP for the first reflection written for a key
pub const REFLECTION_XP: u64 = 10;

/// Chapter whose completion earns the Apprentice avatar
pub const APPRENTICE_CHAPTER_ID: &str = "5";
pub const APPRENTICE_MINT_REASON: &str = "Completed Chapter 5: Disturbances of the Mind";

/// Chapter that is always unlocked
pub const FIRST_CHAPTER_ID: &str = "1";

/// Default avatar id for players without any unlocked stage
pub const DEFAULT_AVATAR_ID: &str = "novice";

/// Outbox delivery limits (attempt count before a row is closed)
pub const MAX_DELIVERY_ATTEMPTS: u8 = 5;

/// Sent mint requests older than this are pruned from the queue
pub const SENT_REQUEST_RETENTION_DAYS: i64 = 30;

/// Which Polygon network the module validates wallets against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NetworkEnv {
    #[default]
    Mainnet,
    Amoy,
}

impl NetworkEnv {
    /// "mainnet" selects mainnet; anything else falls back to the Amoy testnet
    pub fn parse(value: &str) -> Self {
        if value.trim().eq_ignore_ascii_case("mainnet") {
            NetworkEnv::Mainnet
        } else {
            NetworkEnv::Amoy
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            NetworkEnv::Mainnet => "mainnet",
            NetworkEnv::Amoy => "amoy",
        }
    }

    pub fn config(&self) -> &'static NetworkConfig {
        match self {
            NetworkEnv::Mainnet => &POLYGON_MAINNET,
            NetworkEnv::Amoy => &POLYGON_AMOY,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeCurrency {
    pub name: &'static str,
    pub symbol: &'static str,
    pub decimals: u8,
}

/// Contract and chain details for one network.
/// RPC credentials are held by the chain worker, not the module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkConfig {
    pub network_name: &'static str,
    pub avatar_contract_address: &'static str,
    pub chain_id: u64,
    pub chain_id_hex: &'static str,
    pub alchemy_network: &'static str,
    pub native_currency: NativeCurrency,
    pub block_explorer_url: &'static str,
}

impl NetworkConfig {
    pub fn is_chain(&self, chain_id: u64) -> bool {
        self.chain_id == chain_id
    }
}

pub static POLYGON_MAINNET: NetworkConfig = NetworkConfig {
    network_name: "Polygon Mainnet",
    avatar_contract_address: "0x924c54f50FF70C0Ab42845F305aF629091AB879e",
    chain_id: 137,
    chain_id_hex: "0x89",
    alchemy_network: "polygon-mainnet",
    native_currency: NativeCurrency { name: "MATIC", symbol: "MATIC", decimals: 18 },
    block_explorer_url: "https://polygonscan.com",
};

pub static POLYGON_AMOY: NetworkConfig = NetworkConfig {
    network_name: "Polygon Amoy Testnet",
    avatar_contract_address: "0x6a856c10Cb553D7a2F33E66138940A6B53E32025",
    chain_id: 80002,
    chain_id_hex: "0x13882",
    alchemy_network: "polygon-amoy",
    native_currency: NativeCurrency { name: "MATIC", symbol: "MATIC", decimals: 18 },
    block_explorer_url: "https://amoy.polygonscan.com",
};
