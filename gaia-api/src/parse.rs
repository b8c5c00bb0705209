//! Decoders for the remote service's JSON payloads.

use reconcilor_protocol::AccountId;
use reconcilor_protocol::ConnectionCheckTarget;
use reconcilor_protocol::GaiaError;
use reconcilor_protocol::ListedAccount;
use serde_json::Value;

const ACCOUNT_EMAIL_INDEX: usize = 3;
const ACCOUNT_VALID_INDEX: usize = 9;
const PROBE_RESULT_MAX_CHARS: usize = 16;

/// Parses a `ListAccounts` response.
///
/// The payload is a JSON array whose second element holds one array per
/// account. Entries without an email are skipped; a missing validity flag
/// means the session is valid. Server order is kept.
pub fn parse_list_accounts(body: &str) -> Result<Vec<ListedAccount>, GaiaError> {
    let value: Value = serde_json::from_str(body).map_err(|err| {
        GaiaError::UnexpectedServiceResponse(format!("ListAccounts is not JSON: {err}"))
    })?;
    let Some(entries) = value.get(1).and_then(Value::as_array) else {
        return Err(GaiaError::UnexpectedServiceResponse(
            "ListAccounts payload has no account list".to_string(),
        ));
    };

    let mut accounts = Vec::with_capacity(entries.len());
    for entry in entries {
        let Some(fields) = entry.as_array() else {
            return Err(GaiaError::UnexpectedServiceResponse(
                "ListAccounts entry is not an array".to_string(),
            ));
        };
        let Some(email) = fields
            .get(ACCOUNT_EMAIL_INDEX)
            .and_then(Value::as_str)
            .filter(|email| !email.trim().is_empty())
        else {
            continue;
        };
        let valid = fields
            .get(ACCOUNT_VALID_INDEX)
            .and_then(Value::as_i64)
            .is_none_or(|flag| flag != 0);
        accounts.push(ListedAccount::new(
            AccountId::new(email).canonicalize(),
            valid,
        ));
    }
    Ok(accounts)
}

/// Parses a `GetCheckConnectionInfo` response: a JSON array of
/// `{"carryBackToken": .., "url": ..}` objects.
pub fn parse_check_connection_info(body: &str) -> Result<Vec<ConnectionCheckTarget>, GaiaError> {
    serde_json::from_str(body).map_err(|err| {
        GaiaError::UnexpectedServiceResponse(format!("GetCheckConnectionInfo: {err}"))
    })
}

/// Probe bodies are carried back verbatim but only up to a short prefix.
pub fn truncate_probe_result(body: &str) -> String {
    body.chars().take(PROBE_RESULT_MAX_CHARS).collect()
}
