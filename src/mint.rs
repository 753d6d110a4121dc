// ==================== MINT REQUEST INTAKE ====================
//
// Validates mint requests and maps them to HTTP-style responses for the
// gateway that fronts the module. Accepted requests are only recorded for
// an admin to mint later.

use serde_json::{json, Value};
use thiserror::Error;

pub const PENDING_STATUS: &str = "Pending Admin Minting";
pub const DEFAULT_REASON: &str = "Player met in-game criteria.";

pub const CORS_HEADERS: [(&str, &str); 3] = [
    ("Access-Control-Allow-Origin", "*"),
    ("Access-Control-Allow-Methods", "POST, GET, OPTIONS"),
    ("Access-Control-Allow-Headers", "Content-Type, Authorization"),
];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MintRequestError {
    #[error("Invalid or missing walletAddress.")]
    InvalidWalletAddress,
    #[error("Invalid or missing stageToMint (must be a non-negative number).")]
    InvalidStage,
    #[error("Invalid or missing stageName.")]
    InvalidStageName,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedMintRequest {
    /// Lower-cased
    pub wallet_address: String,
    pub stage_to_mint: u64,
    pub stage_name: String,
    pub reason: String,
}

/// `0x`-prefixed (either case) and 42 characters long
pub fn is_valid_wallet_address(address: &str) -> bool {
    address.len() == 42 && address.get(..2).is_some_and(|prefix| prefix.eq_ignore_ascii_case("0x"))
}

pub fn validate_mint_request(body: &Value) -> Result<ValidatedMintRequest, MintRequestError> {
    let wallet_address = body
        .get("walletAddress")
        .and_then(Value::as_str)
        .filter(|address| is_valid_wallet_address(address))
        .ok_or(MintRequestError::InvalidWalletAddress)?;

    let stage_to_mint = body
        .get("stageToMint")
        .and_then(Value::as_u64)
        .ok_or(MintRequestError::InvalidStage)?;

    let stage_name = body
        .get("stageName")
        .and_then(Value::as_str)
        .filter(|name| !name.trim().is_empty())
        .ok_or(MintRequestError::InvalidStageName)?;

    let reason = match body.get("reason").and_then(Value::as_str) {
        Some(reason) if !reason.is_empty() => reason.trim().to_string(),
        _ => DEFAULT_REASON.to_string(),
    };

    Ok(ValidatedMintRequest {
        wallet_address: wallet_address.to_ascii_lowercase(),
        stage_to_mint,
        stage_name: stage_name.to_string(),
        reason,
    })
}

#[derive(Debug, Clone, PartialEq)]
pub struct MintResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    /// `None` for empty bodies (preflight)
    pub body: Option<Value>,
}

impl MintResponse {
    fn new(status: u16, body: Option<Value>) -> Self {
        MintResponse {
            status,
            headers: CORS_HEADERS
                .iter()
                .map(|(name, value)| (name.to_string(), value.to_string()))
                .collect(),
            body,
        }
    }

    pub fn body_string(&self) -> String {
        self.body.as_ref().map(Value::to_string).unwrap_or_default()
    }

    /// Id of the stored pending mint, present on 201 responses
    pub fn pending_mint_id(&self) -> Option<&str> {
        self.body.as_ref()?.get("pendingMintId")?.as_str()
    }
}

/// Handle one intake call. `store` records the validated request and
/// returns its pending id; its error becomes a 500.
pub fn handle_mint_request<F>(method: &str, body: &Value, store: F) -> MintResponse
where
    F: FnOnce(&ValidatedMintRequest) -> Result<String, String>,
{
    if method.eq_ignore_ascii_case("OPTIONS") {
        return MintResponse::new(204, None);
    }
    if !method.eq_ignore_ascii_case("POST") {
        log::info!("[MINT] rejected method {}", method);
        return MintResponse::new(
            405,
            Some(json!({"error": "Method Not Allowed", "message": "Please use POST."})),
        );
    }

    let request = match validate_mint_request(body) {
        Ok(request) => request,
        Err(e) => {
            log::warn!("[MINT] validation failed: {}", e);
            return MintResponse::new(400, Some(json!({"error": e.to_string()})));
        }
    };

    match store(&request) {
        Ok(pending_id) => {
            log::info!(
                "[MINT] pending id={} wallet={} stage={} ({})",
                pending_id,
                request.wallet_address,
                request.stage_name,
                request.stage_to_mint
            );
            MintResponse::new(
                201,
                Some(json!({
                    "success": true,
                    "message": "Mint request logged successfully.",
                    "pendingMintId": pending_id,
                })),
            )
        }
        Err(e) => {
            log::error!("[MINT] could not record request: {}", e);
            MintResponse::new(
                500,
                Some(json!({
                    "error": "Internal Server Error",
                    "message": "An unexpected error occurred.",
                })),
            )
        }
    }
}
