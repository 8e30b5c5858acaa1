use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rand::RngCore;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::CloudflareError;

/// Every v4 API response: `{success, errors, messages, result}`.
#[derive(Debug, Deserialize)]
pub struct Envelope<T> {
    pub success: bool,
    #[serde(default)]
    pub errors: Vec<ApiMessage>,
    pub result: Option<T>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiMessage {
    #[serde(default)]
    pub code: i64,
    pub message: String,
}

/// Unwraps an envelope, surfacing the upstream error messages.
pub fn parse_envelope<T: DeserializeOwned>(status: u16, body: &str) -> Result<T, CloudflareError> {
    let envelope: Envelope<T> = match serde_json::from_str(body) {
        Ok(envelope) => envelope,
        Err(e) if (200..300).contains(&status) => {
            return Err(CloudflareError::Decode(e.to_string()));
        }
        Err(_) => {
            let snippet: String = body.chars().take(200).collect();
            return Err(CloudflareError::Api {
                status,
                message: snippet,
            });
        }
    };

    if !envelope.success || !envelope.errors.is_empty() {
        let message = if envelope.errors.is_empty() {
            "request failed without details".to_string()
        } else {
            envelope
                .errors
                .iter()
                .map(|e| format!("{} (code {})", e.message, e.code))
                .collect::<Vec<_>>()
                .join("; ")
        };
        return Err(CloudflareError::Api { status, message });
    }

    envelope
        .result
        .ok_or_else(|| CloudflareError::Decode("response has no result".to_string()))
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TokenStatus {
    pub id: String,
    pub status: String,
}

impl TokenStatus {
    pub fn is_active(&self) -> bool {
        self.status == "active"
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Account {
    pub id: String,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Zone {
    pub id: String,
    pub name: String,
    pub account: Account,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Tunnel {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub deleted_at: Option<String>,
}

impl Tunnel {
    /// Hostname that DNS records route to.
    pub fn cname_target(&self) -> String {
        format!("{}.cfargotunnel.com", self.id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DnsRecord {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub name: String,
    pub content: String,
    #[serde(default)]
    pub proxied: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NewDnsRecord {
    #[serde(rename = "type")]
    pub kind: String,
    pub name: String,
    pub content: String,
    pub proxied: bool,
    /// `1` means automatic.
    pub ttl: u32,
}

impl NewDnsRecord {
    pub fn proxied_cname(name: &str, target: &str) -> Self {
        Self {
            kind: "CNAME".to_string(),
            name: name.to_string(),
            content: target.to_string(),
            proxied: true,
            ttl: 1,
        }
    }
}

/// Contents of `/etc/cloudflared/<tunnel-id>.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelCredentials {
    #[serde(rename = "AccountTag")]
    pub account_tag: String,
    #[serde(rename = "TunnelSecret")]
    pub tunnel_secret: String,
    #[serde(rename = "TunnelID")]
    pub tunnel_id: String,
}

/// Decoded form of the connector token (`base64({"a","t","s"})`).
#[derive(Debug, Deserialize)]
struct TunnelToken {
    a: String,
    t: String,
    s: String,
}

impl TunnelCredentials {
    pub fn from_token(token: &str) -> Result<Self, CloudflareError> {
        let raw = STANDARD
            .decode(token.trim())
            .map_err(|e| CloudflareError::Decode(format!("tunnel token: {e}")))?;
        let token: TunnelToken = serde_json::from_slice(&raw)
            .map_err(|e| CloudflareError::Decode(format!("tunnel token: {e}")))?;
        Ok(Self {
            account_tag: token.a,
            tunnel_id: token.t,
            tunnel_secret: token.s,
        })
    }

    pub fn to_json(&self) -> Result<String, CloudflareError> {
        serde_json::to_string_pretty(self).map_err(|e| CloudflareError::Decode(e.to_string()))
    }
}

/// Fresh 32-byte tunnel secret, base64 encoded.
pub fn generate_tunnel_secret() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    STANDARD.encode(bytes)
}

/// The domain itself, then each parent with at least two labels.
pub fn zone_candidates(domain: &str) -> Vec<String> {
    let labels: Vec<&str> = domain.trim_end_matches('.').split('.').collect();
    (0..labels.len().saturating_sub(1))
        .map(|start| labels[start..].join("."))
        .collect()
}

/// What [`ensure_cname`](crate::CloudflareApi::ensure_cname) must do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordChange {
    Unchanged,
    Create,
    Update { record_id: String },
    /// An address record holds the name; it is never overwritten.
    Conflict { kind: String },
}

pub fn plan_record_change(existing: &[DnsRecord], name: &str, target: &str) -> RecordChange {
    let same_name: Vec<&DnsRecord> = existing
        .iter()
        .filter(|r| r.name.eq_ignore_ascii_case(name))
        .collect();

    if let Some(record) = same_name.iter().find(|r| r.kind != "CNAME") {
        return RecordChange::Conflict {
            kind: record.kind.clone(),
        };
    }
    match same_name.first() {
        None => RecordChange::Create,
        Some(record) if record.content.eq_ignore_ascii_case(target) && record.proxied => {
            RecordChange::Unchanged
        }
        Some(record) => RecordChange::Update {
            record_id: record.id.clone(),
        },
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    Unchanged,
    Created,
    Updated,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(kind: &str, content: &str, proxied: bool) -> DnsRecord {
        DnsRecord {
            id: "rec1".into(),
            kind: kind.into(),
            name: "blog.example.com".into(),
            content: content.into(),
            proxied,
        }
    }

    #[test]
    fn test_envelope_success() {
        let body = r#"{"success":true,"errors":[],"messages":[],"result":{"id":"tok","status":"active"}}"#;
        let status: TokenStatus = parse_envelope(200, body).unwrap();
        assert!(status.is_active());
    }

    #[test]
    fn test_envelope_errors_are_surfaced() {
        let body = r#"{"success":false,"errors":[{"code":1000,"message":"Invalid API Token"}],"result":null}"#;
        let err = parse_envelope::<TokenStatus>(401, body).unwrap_err();
        assert_eq!(err.to_string(), "Cloudflare API error (HTTP 401): Invalid API Token (code 1000)");
    }

    #[test]
    fn test_envelope_non_json_error() {
        let err = parse_envelope::<TokenStatus>(502, "<html>Bad gateway</html>").unwrap_err();
        assert!(matches!(err, CloudflareError::Api { status: 502, .. }));
    }

    #[test]
    fn test_zone_candidates() {
        assert_eq!(
            zone_candidates("blog.example.co.uk"),
            vec!["blog.example.co.uk", "example.co.uk", "co.uk"]
        );
        assert_eq!(zone_candidates("example.com"), vec!["example.com"]);
    }

    #[test]
    fn test_token_decoding() {
        let json = r#"{"a":"acc123","t":"6ff42ae2-765d-4adf-8112-31c55c1551ef","s":"c2VjcmV0"}"#;
        let token = STANDARD.encode(json);
        let creds = TunnelCredentials::from_token(&token).unwrap();
        assert_eq!(creds.account_tag, "acc123");
        assert_eq!(creds.tunnel_id, "6ff42ae2-765d-4adf-8112-31c55c1551ef");

        let file = creds.to_json().unwrap();
        assert!(file.contains("\"AccountTag\": \"acc123\""));
        assert!(file.contains("\"TunnelSecret\": \"c2VjcmV0\""));
        assert!(TunnelCredentials::from_token("not base64!").is_err());
    }

    #[test]
    fn test_generated_secret_is_32_bytes() {
        let secret = generate_tunnel_secret();
        assert_eq!(STANDARD.decode(secret).unwrap().len(), 32);
    }

    #[test]
    fn test_plan_record_change() {
        let target = "abc.cfargotunnel.com";
        assert_eq!(plan_record_change(&[], "blog.example.com", target), RecordChange::Create);
        assert_eq!(
            plan_record_change(&[record("CNAME", target, true)], "blog.example.com", target),
            RecordChange::Unchanged
        );
        assert_eq!(
            plan_record_change(&[record("CNAME", "old.cfargotunnel.com", true)], "blog.example.com", target),
            RecordChange::Update { record_id: "rec1".into() }
        );
        assert_eq!(
            plan_record_change(&[record("CNAME", target, false)], "blog.example.com", target),
            RecordChange::Update { record_id: "rec1".into() }
        );
        assert_eq!(
            plan_record_change(&[record("A", "192.0.2.1", false)], "blog.example.com", target),
            RecordChange::Conflict { kind: "A".into() }
        );
    }
}
