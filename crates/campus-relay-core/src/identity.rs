//! Caller identity and the credential-extraction boundary.
//!
//! An [`Identity`] is only ever built through validation, so holding one means
//! the account id is normalized (trimmed, lower-cased) and both fields passed
//! the length and character checks. The secret never appears in `Debug`
//! output or logs.

use std::fmt;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};

use crate::error::{RelayError, Result};

const ACCOUNT_MIN_LEN: usize = 6;
const ACCOUNT_MAX_LEN: usize = 20;
const SECRET_MIN_LEN: usize = 6;
const SECRET_MAX_LEN: usize = 100;

/// Validated (account, secret) pair used to authenticate against the portal.
#[derive(Clone, PartialEq, Eq)]
pub struct Identity {
    account: String,
    secret: String,
}

impl Identity {
    /// Validate and normalize raw credentials.
    pub fn new(account: &str, secret: &str) -> Result<Self> {
        let account = validate_account(account)?;
        validate_secret(secret)?;
        Ok(Self {
            account,
            secret: secret.to_string(),
        })
    }

    pub fn account(&self) -> &str {
        &self.account
    }

    pub fn secret(&self) -> &str {
        &self.secret
    }

    /// Account id safe for log output: the first four characters, rest starred.
    pub fn masked_account(&self) -> String {
        let visible: String = self.account.chars().take(4).collect();
        let hidden = self.account.chars().count().saturating_sub(4);
        format!("{visible}{}", "*".repeat(hidden))
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("account", &self.masked_account())
            .field("secret", &"<redacted>")
            .finish()
    }
}

fn validate_account(raw: &str) -> Result<String> {
    let account = raw.trim().to_lowercase();
    if account.is_empty() {
        return Err(RelayError::validation("Roll number is required"));
    }
    let len = account.chars().count();
    if !(ACCOUNT_MIN_LEN..=ACCOUNT_MAX_LEN).contains(&len) {
        return Err(RelayError::validation(format!(
            "Roll number must be between {ACCOUNT_MIN_LEN}-{ACCOUNT_MAX_LEN} characters"
        )));
    }
    let valid = account
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if !valid {
        return Err(RelayError::validation(
            "Roll number contains invalid characters",
        ));
    }
    Ok(account)
}

fn validate_secret(secret: &str) -> Result<()> {
    if secret.is_empty() {
        return Err(RelayError::validation("Password is required"));
    }
    let len = secret.chars().count();
    if len < SECRET_MIN_LEN {
        return Err(RelayError::validation(format!(
            "Password must be at least {SECRET_MIN_LEN} characters long"
        )));
    }
    if len > SECRET_MAX_LEN {
        return Err(RelayError::validation("Password is too long"));
    }
    Ok(())
}

/// Unvalidated credential pair as it arrives on the wire or out of a decoder.
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct RawCredentials {
    #[serde(default)]
    pub rollno: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

impl fmt::Debug for RawCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawCredentials")
            .field("rollno", &self.rollno.as_ref().map(|_| "<present>"))
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Request body carrying credentials in either accepted shape:
/// `{ "data": "<encoded>" }` or `{ "rollno": "...", "password": "..." }`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CredentialRequest {
    #[serde(default)]
    pub data: Option<String>,
    #[serde(flatten)]
    pub plain: RawCredentials,
}

/// Opaque decoder for the encoded credential payload.
///
/// The encoding is an obfuscation layer only. Nothing downstream treats a
/// successful decode as proof of anything; the upstream login is the only
/// authentication step.
pub trait CredentialDecoder: Send + Sync {
    fn decode(&self, encoded: &str) -> Result<RawCredentials>;
}

/// Two-layer base64 wrapping with a reversed middle layer and a salt suffix.
#[derive(Debug, Clone)]
pub struct ObfuscatedPayloadDecoder {
    salt: String,
}

impl ObfuscatedPayloadDecoder {
    pub fn new(salt: impl Into<String>) -> Self {
        Self { salt: salt.into() }
    }

    /// Produce a payload this decoder accepts. Used by clients and tests.
    pub fn encode(&self, credentials: &RawCredentials) -> Result<String> {
        let json = serde_json::to_string(credentials)?;
        let inner = STANDARD.encode(json.as_bytes());
        let obfuscated: String = inner.chars().rev().chain(self.salt.chars()).collect();
        Ok(STANDARD.encode(obfuscated.as_bytes()))
    }
}

impl CredentialDecoder for ObfuscatedPayloadDecoder {
    fn decode(&self, encoded: &str) -> Result<RawCredentials> {
        let outer = STANDARD
            .decode(encoded.trim())
            .ok()
            .and_then(|bytes| String::from_utf8(bytes).ok())
            .ok_or_else(|| RelayError::validation("Invalid payload format - first layer"))?;

        let reversed = outer
            .strip_suffix(self.salt.as_str())
            .ok_or_else(|| RelayError::validation("Invalid payload format - salt missing"))?;
        let inner: String = reversed.chars().rev().collect();

        let json = STANDARD
            .decode(inner)
            .ok()
            .and_then(|bytes| String::from_utf8(bytes).ok())
            .ok_or_else(|| RelayError::validation("Invalid payload format - second layer"))?;

        serde_json::from_str(&json)
            .map_err(|_| RelayError::validation("Invalid payload format - JSON parsing"))
    }
}

/// Turn a request body into a validated identity, decoding the payload if present.
pub fn extract_identity(
    request: &CredentialRequest,
    decoder: &dyn CredentialDecoder,
) -> Result<Identity> {
    let raw = match request.data.as_deref() {
        Some(encoded) => decoder.decode(encoded)?,
        None => request.plain.clone(),
    };

    match (raw.rollno.as_deref(), raw.password.as_deref()) {
        (Some(account), Some(secret)) if !account.is_empty() && !secret.is_empty() => {
            Identity::new(account, secret)
        }
        _ => Err(RelayError::validation("Missing credentials")),
    }
}
