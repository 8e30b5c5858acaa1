//! Minimal Cloudflare v4 API client: zones, named tunnels and DNS records.

use async_trait::async_trait;
use thiserror::Error;

use piprov_step_engine::StepError;

pub mod client;
pub mod model;

pub use client::{CloudflareClient, API_BASE};
pub use model::{
    generate_tunnel_secret, plan_record_change, zone_candidates, Account, DnsRecord, NewDnsRecord,
    RecordChange, RecordOutcome, TokenStatus, Tunnel, TunnelCredentials, Zone,
};

#[derive(Debug, Error)]
pub enum CloudflareError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Cloudflare API error (HTTP {status}): {message}")]
    Api { status: u16, message: String },

    #[error("unexpected Cloudflare response: {0}")]
    Decode(String),

    #[error("no Cloudflare zone found for {0}; add the domain to your account first")]
    ZoneNotFound(String),

    #[error("{name} already has a {kind} record; remove it before routing it through the tunnel")]
    RecordConflict { name: String, kind: String },
}

impl From<CloudflareError> for StepError {
    fn from(err: CloudflareError) -> Self {
        match err {
            e @ (CloudflareError::ZoneNotFound(_) | CloudflareError::RecordConflict { .. }) => {
                StepError::failed(e.to_string())
            }
            e => StepError::external("cloudflare", e.to_string()),
        }
    }
}

/// The API calls the tunnel recipe needs.
#[async_trait]
pub trait CloudflareApi: Send + Sync {
    async fn verify_token(&self) -> Result<TokenStatus, CloudflareError>;

    async fn zone_by_name(&self, name: &str) -> Result<Option<Zone>, CloudflareError>;

    /// Non-deleted tunnels called `name`.
    async fn list_tunnels(&self, account_id: &str, name: &str) -> Result<Vec<Tunnel>, CloudflareError>;

    /// Creates a locally managed tunnel with the given base64 secret.
    async fn create_tunnel(
        &self,
        account_id: &str,
        name: &str,
        secret: &str,
    ) -> Result<Tunnel, CloudflareError>;

    async fn tunnel_token(
        &self,
        account_id: &str,
        tunnel_id: &str,
    ) -> Result<TunnelCredentials, CloudflareError>;

    async fn dns_records(&self, zone_id: &str, name: &str) -> Result<Vec<DnsRecord>, CloudflareError>;

    async fn create_dns_record(
        &self,
        zone_id: &str,
        record: &NewDnsRecord,
    ) -> Result<DnsRecord, CloudflareError>;

    async fn update_dns_record(
        &self,
        zone_id: &str,
        record_id: &str,
        record: &NewDnsRecord,
    ) -> Result<DnsRecord, CloudflareError>;

    /// Zone for `domain`: the domain itself or its closest parent.
    async fn find_zone(&self, domain: &str) -> Result<Zone, CloudflareError> {
        for candidate in zone_candidates(domain) {
            if let Some(zone) = self.zone_by_name(&candidate).await? {
                return Ok(zone);
            }
        }
        Err(CloudflareError::ZoneNotFound(domain.to_string()))
    }

    /// Makes `name` a proxied CNAME to `target`.
    async fn ensure_cname(
        &self,
        zone_id: &str,
        name: &str,
        target: &str,
    ) -> Result<RecordOutcome, CloudflareError> {
        let existing = self.dns_records(zone_id, name).await?;
        let record = NewDnsRecord::proxied_cname(name, target);
        match plan_record_change(&existing, name, target) {
            RecordChange::Unchanged => Ok(RecordOutcome::Unchanged),
            RecordChange::Create => {
                self.create_dns_record(zone_id, &record).await?;
                Ok(RecordOutcome::Created)
            }
            RecordChange::Update { record_id } => {
                self.update_dns_record(zone_id, &record_id, &record).await?;
                Ok(RecordOutcome::Updated)
            }
            RecordChange::Conflict { kind } => Err(CloudflareError::RecordConflict {
                name: name.to_string(),
                kind,
            }),
        }
    }
}

// ============================================================================
// Test Utilities - exported for integration tests
// ============================================================================

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Inner {
        zones: Vec<Zone>,
        tunnels: Vec<(String, Tunnel, String)>,
        records: Vec<(String, DnsRecord)>,
        calls: Vec<String>,
        next_id: u32,
    }

    /// In-memory Cloudflare account.
    #[derive(Default)]
    pub struct MockCloudflare {
        inner: Mutex<Inner>,
        reject_token: Option<String>,
    }

    impl MockCloudflare {
        pub fn new() -> Self {
            Self::default()
        }

        /// Every call fails with this upstream message.
        pub fn rejecting(message: &str) -> Self {
            Self {
                reject_token: Some(message.to_string()),
                ..Self::default()
            }
        }

        pub fn with_zone(self, name: &str, zone_id: &str, account_id: &str) -> Self {
            self.inner.lock().unwrap().zones.push(Zone {
                id: zone_id.to_string(),
                name: name.to_string(),
                account: Account {
                    id: account_id.to_string(),
                    name: "Test account".to_string(),
                },
            });
            self
        }

        pub fn with_tunnel(self, account_id: &str, id: &str, name: &str, secret: &str) -> Self {
            self.inner.lock().unwrap().tunnels.push((
                account_id.to_string(),
                Tunnel {
                    id: id.to_string(),
                    name: name.to_string(),
                    deleted_at: None,
                },
                secret.to_string(),
            ));
            self
        }

        pub fn with_record(self, zone_id: &str, kind: &str, name: &str, content: &str) -> Self {
            let mut inner = self.inner.lock().unwrap();
            inner.next_id += 1;
            let id = format!("rec{}", inner.next_id);
            inner.records.push((
                zone_id.to_string(),
                DnsRecord {
                    id,
                    kind: kind.to_string(),
                    name: name.to_string(),
                    content: content.to_string(),
                    proxied: true,
                },
            ));
            drop(inner);
            self
        }

        pub fn calls(&self) -> Vec<String> {
            self.inner.lock().unwrap().calls.clone()
        }

        pub fn tunnels(&self) -> Vec<Tunnel> {
            self.inner
                .lock()
                .unwrap()
                .tunnels
                .iter()
                .map(|(_, t, _)| t.clone())
                .collect()
        }

        pub fn records(&self) -> Vec<DnsRecord> {
            self.inner
                .lock()
                .unwrap()
                .records
                .iter()
                .map(|(_, r)| r.clone())
                .collect()
        }

        fn enter(&self, call: String) -> Result<std::sync::MutexGuard<'_, Inner>, CloudflareError> {
            let mut inner = self.inner.lock().unwrap();
            inner.calls.push(call);
            if let Some(message) = &self.reject_token {
                return Err(CloudflareError::Api {
                    status: 401,
                    message: message.clone(),
                });
            }
            Ok(inner)
        }
    }

    #[async_trait]
    impl CloudflareApi for MockCloudflare {
        async fn verify_token(&self) -> Result<TokenStatus, CloudflareError> {
            self.enter("verify_token".to_string())?;
            Ok(TokenStatus {
                id: "token".to_string(),
                status: "active".to_string(),
            })
        }

        async fn zone_by_name(&self, name: &str) -> Result<Option<Zone>, CloudflareError> {
            let inner = self.enter(format!("zone_by_name:{name}"))?;
            Ok(inner.zones.iter().find(|z| z.name == name).cloned())
        }

        async fn list_tunnels(&self, account_id: &str, name: &str) -> Result<Vec<Tunnel>, CloudflareError> {
            let inner = self.enter(format!("list_tunnels:{name}"))?;
            Ok(inner
                .tunnels
                .iter()
                .filter(|(acc, t, _)| acc == account_id && t.name == name)
                .map(|(_, t, _)| t.clone())
                .collect())
        }

        async fn create_tunnel(
            &self,
            account_id: &str,
            name: &str,
            secret: &str,
        ) -> Result<Tunnel, CloudflareError> {
            let mut inner = self.enter(format!("create_tunnel:{name}"))?;
            inner.next_id += 1;
            let tunnel = Tunnel {
                id: format!("tunnel-{}", inner.next_id),
                name: name.to_string(),
                deleted_at: None,
            };
            inner
                .tunnels
                .push((account_id.to_string(), tunnel.clone(), secret.to_string()));
            Ok(tunnel)
        }

        async fn tunnel_token(
            &self,
            account_id: &str,
            tunnel_id: &str,
        ) -> Result<TunnelCredentials, CloudflareError> {
            let inner = self.enter(format!("tunnel_token:{tunnel_id}"))?;
            inner
                .tunnels
                .iter()
                .find(|(acc, t, _)| acc == account_id && t.id == tunnel_id)
                .map(|(acc, t, secret)| TunnelCredentials {
                    account_tag: acc.clone(),
                    tunnel_secret: secret.clone(),
                    tunnel_id: t.id.clone(),
                })
                .ok_or_else(|| CloudflareError::Api {
                    status: 404,
                    message: "Tunnel not found (code 1003)".to_string(),
                })
        }

        async fn dns_records(&self, zone_id: &str, name: &str) -> Result<Vec<DnsRecord>, CloudflareError> {
            let inner = self.enter(format!("dns_records:{name}"))?;
            Ok(inner
                .records
                .iter()
                .filter(|(zone, r)| zone == zone_id && r.name == name)
                .map(|(_, r)| r.clone())
                .collect())
        }

        async fn create_dns_record(
            &self,
            zone_id: &str,
            record: &NewDnsRecord,
        ) -> Result<DnsRecord, CloudflareError> {
            let mut inner = self.enter(format!("create_dns_record:{}", record.name))?;
            inner.next_id += 1;
            let created = DnsRecord {
                id: format!("rec{}", inner.next_id),
                kind: record.kind.clone(),
                name: record.name.clone(),
                content: record.content.clone(),
                proxied: record.proxied,
            };
            inner.records.push((zone_id.to_string(), created.clone()));
            Ok(created)
        }

        async fn update_dns_record(
            &self,
            zone_id: &str,
            record_id: &str,
            record: &NewDnsRecord,
        ) -> Result<DnsRecord, CloudflareError> {
            let mut inner = self.enter(format!("update_dns_record:{record_id}"))?;
            let (_, existing) = inner
                .records
                .iter_mut()
                .find(|(zone, r)| zone == zone_id && r.id == record_id)
                .ok_or_else(|| CloudflareError::Api {
                    status: 404,
                    message: "Record not found (code 81044)".to_string(),
                })?;
            existing.kind = record.kind.clone();
            existing.content = record.content.clone();
            existing.proxied = record.proxied;
            Ok(existing.clone())
        }
    }
}
