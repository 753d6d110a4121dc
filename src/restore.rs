// Bulk restore reducers for disaster recovery
// Accept JSON arrays exported from the admin panel (TypeScript SDK format)

use spacetimedb::{reducer, ReducerContext, Timestamp, Table};
use crate::{PendingMint, open_session, short_id};
use crate::{authorized_worker, pending_mint};
use crate::mint::PENDING_STATUS;
use serde_json::Value;

/// Parse Timestamp from SDK JSON format: {"__timestamp_micros_since_unix_epoch__": "123456"}
fn parse_timestamp_json(val: &Value) -> Result<Timestamp, String> {
    let micros_str = val.get("__timestamp_micros_since_unix_epoch__")
        .and_then(|v| v.as_str())
        .ok_or("Missing or invalid timestamp field")?;

    let micros: i64 = micros_str.parse()
        .map_err(|e| format!("Invalid timestamp micros: {}", e))?;

    Ok(Timestamp::from_micros_since_unix_epoch(micros))
}

/// Profile documents are exported either as embedded objects or as the raw stored string
fn document_json(val: &Value) -> Option<String> {
    match val {
        Value::String(raw) => Some(raw.clone()),
        Value::Object(_) => Some(val.to_string()),
        _ => None,
    }
}

/// Bulk restore profile documents from a JSON array of {playerId, document}
/// Protected by authorization check - only authorized workers can call this
#[reducer]
pub fn bulk_restore_profiles(ctx: &ReducerContext, json_data: String) -> Result<(), String> {
    if ctx.db.authorized_worker().identity().find(&ctx.sender).is_none() {
        log::warn!("Unauthorized bulk_restore_profiles attempt by {}", ctx.sender);
        return Err("Unauthorized".to_string());
    }

    let data: Value = serde_json::from_str(&json_data)
        .map_err(|e| format!("Invalid JSON: {}", e))?;

    let profiles = data.as_array()
        .ok_or("Expected JSON array of profiles")?;

    let mut count = 0;
    for (i, p) in profiles.iter().enumerate() {
        let player_id = p.get("playerId")
            .and_then(|v| v.as_str())
            .filter(|id| !id.is_empty())
            .ok_or(format!("Profile {}: missing playerId", i))?;
        let raw = p.get("document")
            .and_then(document_json)
            .ok_or(format!("Profile {}: missing document", i))?;

        // Level and the first chapter are re-derived on load
        let mut session = open_session(ctx, player_id)?;
        session.replace_document(&raw)
            .map_err(|e| format!("Profile {} ({}): {}", i, short_id(player_id), e))?;
        count += 1;
    }

    log::info!("[RESTORE] restored {} profile documents", count);
    Ok(())
}

/// Bulk restore pending mints from JSON array
/// Protected by authorization check - only authorized workers can call this
#[reducer]
pub fn bulk_restore_pending_mints(ctx: &ReducerContext, json_data: String) -> Result<(), String> {
    if ctx.db.authorized_worker().identity().find(&ctx.sender).is_none() {
        log::warn!("Unauthorized bulk_restore_pending_mints attempt by {}", ctx.sender);
        return Err("Unauthorized".to_string());
    }

    let data: Value = serde_json::from_str(&json_data)
        .map_err(|e| format!("Invalid JSON: {}", e))?;

    let mints = data.as_array()
        .ok_or("Expected JSON array of pending mints")?;

    let mut count = 0;
    for (i, m) in mints.iter().enumerate() {
        let mint = PendingMint {
            id: 0, // auto_inc
            wallet_address: m.get("walletAddress").and_then(|v| v.as_str()).ok_or(format!("Mint {}: missing walletAddress", i))?.to_ascii_lowercase(),
            stage_to_mint: m.get("stageToMint").and_then(|v| v.as_u64()).ok_or(format!("Mint {}: missing stageToMint", i))?,
            stage_name: m.get("stageName").and_then(|v| v.as_str()).ok_or(format!("Mint {}: missing stageName", i))?.to_string(),
            reason: m.get("reason").and_then(|v| v.as_str()).unwrap_or_default().to_string(),
            requested_at: parse_timestamp_json(m.get("requestedAt").ok_or(format!("Mint {}: missing requestedAt", i))?)?,
            status: m.get("status").and_then(|v| v.as_str()).unwrap_or(PENDING_STATUS).to_string(),
        };

        ctx.db.pending_mint().insert(mint);
        count += 1;
    }

    log::info!("[RESTORE] restored {} pending mints", count);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_timestamp_json() {
        let ts = parse_timestamp_json(&json!({"__timestamp_micros_since_unix_epoch__": "1700000000000000"})).unwrap();
        assert_eq!(ts.to_micros_since_unix_epoch(), 1_700_000_000_000_000);

        assert!(parse_timestamp_json(&json!({"__timestamp_micros_since_unix_epoch__": 17})).is_err());
        assert!(parse_timestamp_json(&json!({"__timestamp_micros_since_unix_epoch__": "soon"})).is_err());
        assert!(parse_timestamp_json(&json!({})).is_err());
    }

    #[test]
    fn test_document_json_accepts_object_or_string() {
        assert_eq!(document_json(&json!({"xp": 10})).as_deref(), Some(r#"{"xp":10}"#));
        assert_eq!(document_json(&json!(r#"{"xp":10}"#)).as_deref(), Some(r#"{"xp":10}"#));
        assert_eq!(document_json(&json!(null)), None);
        assert_eq!(document_json(&json!([1, 2])), None);
    }
}
