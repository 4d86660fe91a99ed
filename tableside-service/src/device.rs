use chrono::{DateTime, Utc};
use serde::Deserialize;
use thiserror::Error;
use uuid::Uuid;
use woothee::parser::Parser;

use crate::models::SessionDevice;

pub const MAX_FINGERPRINT_LEN: usize = 128;
pub const MAX_USER_AGENT_LEN: usize = 512;

/// What a customer device reports about itself when joining a table.
#[derive(Deserialize, Clone, Debug, Default, PartialEq)]
pub struct DeviceInfo {
    pub fingerprint: String,
    #[serde(default)]
    pub user_agent: Option<String>,
    #[serde(default)]
    pub browser: Option<String>,
    #[serde(default)]
    pub os: Option<String>,
    #[serde(default)]
    pub is_mobile: Option<bool>,
    #[serde(default)]
    pub screen_resolution: Option<String>,
}

#[derive(Error, Debug, PartialEq)]
pub enum DeviceError {
    #[error("device fingerprint is required")]
    MissingFingerprint,
    #[error("device fingerprint is longer than {MAX_FINGERPRINT_LEN} characters")]
    FingerprintTooLong,
    #[error("session already has the maximum of {0} devices")]
    LimitReached(usize),
}

impl DeviceInfo {
    /// Builds the device row for `session_id`, filling browser, os and
    /// mobile flag from the user agent when the client left them out.
    pub fn into_device(
        self,
        session_id: Uuid,
        ip_address: &str,
        now: DateTime<Utc>,
    ) -> Result<SessionDevice, DeviceError> {
        let fingerprint = normalize_fingerprint(&self.fingerprint)?;
        let user_agent: String = self
            .user_agent
            .unwrap_or_default()
            .chars()
            .take(MAX_USER_AGENT_LEN)
            .collect();
        let parsed = parse_user_agent(&user_agent);

        Ok(SessionDevice {
            session_id,
            fingerprint,
            ip_address: ip_address.to_string(),
            browser: non_empty(self.browser).or(parsed.browser),
            os: non_empty(self.os).or(parsed.os),
            is_mobile: self.is_mobile.unwrap_or(parsed.is_mobile),
            screen_resolution: non_empty(self.screen_resolution),
            user_agent,
            first_seen: now,
            last_seen: now,
            order_count: 0,
        })
    }
}

pub fn normalize_fingerprint(raw: &str) -> Result<String, DeviceError> {
    let fingerprint = raw.trim();
    if fingerprint.is_empty() {
        return Err(DeviceError::MissingFingerprint);
    }
    if fingerprint.chars().count() > MAX_FINGERPRINT_LEN {
        return Err(DeviceError::FingerprintTooLong);
    }
    Ok(fingerprint.to_string())
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[derive(Debug, Default, PartialEq)]
pub struct ParsedUserAgent {
    pub browser: Option<String>,
    pub os: Option<String>,
    pub is_mobile: bool,
}

pub fn parse_user_agent(user_agent: &str) -> ParsedUserAgent {
    let parser = Parser::new();

    match parser.parse(user_agent) {
        Some(result) => ParsedUserAgent {
            browser: normalize_field(result.name),
            os: normalize_field(result.os),
            is_mobile: matches!(result.category, "smartphone" | "mobilephone" | "tablet"),
        },
        None => ParsedUserAgent::default(),
    }
}

fn normalize_field(value: &str) -> Option<String> {
    if value.is_empty() || value == "UNKNOWN" {
        None
    } else {
        Some(value.to_string())
    }
}

/// Folds a re-join of an already known device into its row, keeping the
/// stored `first_seen` and `order_count`.
pub fn merge(existing: &mut SessionDevice, incoming: &SessionDevice) {
    existing.last_seen = existing.last_seen.max(incoming.last_seen);
    existing.ip_address = incoming.ip_address.clone();
    if !incoming.user_agent.is_empty() {
        existing.user_agent = incoming.user_agent.clone();
    }
    if incoming.browser.is_some() {
        existing.browser = incoming.browser.clone();
    }
    if incoming.os.is_some() {
        existing.os = incoming.os.clone();
    }
    if incoming.screen_resolution.is_some() {
        existing.screen_resolution = incoming.screen_resolution.clone();
    }
    existing.is_mobile = incoming.is_mobile;
}

/// Appends `incoming` to `devices` or merges it into the entry with the same
/// fingerprint. Returns whether a new device was added.
pub fn register(
    devices: &mut Vec<SessionDevice>,
    incoming: SessionDevice,
    max_devices: usize,
) -> Result<bool, DeviceError> {
    if let Some(existing) = devices
        .iter_mut()
        .find(|d| d.fingerprint == incoming.fingerprint)
    {
        merge(existing, &incoming);
        return Ok(false);
    }
    if devices.len() >= max_devices {
        return Err(DeviceError::LimitReached(max_devices));
    }
    devices.push(incoming);
    Ok(true)
}
