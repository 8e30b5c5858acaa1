use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, RequestBuilder};
use serde::de::DeserializeOwned;
use serde_json::json;

use crate::model::{
    parse_envelope, DnsRecord, NewDnsRecord, TokenStatus, Tunnel, TunnelCredentials, Zone,
};
use crate::{CloudflareApi, CloudflareError};

pub const API_BASE: &str = "https://api.cloudflare.com/client/v4";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Cloudflare v4 API over HTTPS, authenticated with an API token.
#[derive(Clone)]
pub struct CloudflareClient {
    http: reqwest::Client,
    base: String,
    token: String,
}

impl std::fmt::Debug for CloudflareClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloudflareClient")
            .field("base", &self.base)
            .finish_non_exhaustive()
    }
}

impl CloudflareClient {
    pub fn new(token: &str) -> Result<Self, CloudflareError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(concat!("piprov/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            http,
            base: API_BASE.to_string(),
            token: token.to_string(),
        })
    }

    pub fn with_base_url(mut self, base: &str) -> Self {
        self.base = base.trim_end_matches('/').to_string();
        self
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.http
            .request(method, format!("{}{path}", self.base))
            .bearer_auth(&self.token)
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, CloudflareError> {
        let response = request.send().await?;
        let status = response.status().as_u16();
        let body = response.text().await?;
        tracing::debug!(status, "cloudflare response");
        parse_envelope(status, &body)
    }
}

#[async_trait]
impl CloudflareApi for CloudflareClient {
    async fn verify_token(&self) -> Result<TokenStatus, CloudflareError> {
        self.send(self.request(Method::GET, "/user/tokens/verify")).await
    }

    async fn zone_by_name(&self, name: &str) -> Result<Option<Zone>, CloudflareError> {
        let zones: Vec<Zone> = self
            .send(self.request(Method::GET, "/zones").query(&[("name", name)]))
            .await?;
        Ok(zones.into_iter().next())
    }

    async fn list_tunnels(&self, account_id: &str, name: &str) -> Result<Vec<Tunnel>, CloudflareError> {
        self.send(
            self.request(Method::GET, &format!("/accounts/{account_id}/cfd_tunnel"))
                .query(&[("name", name), ("is_deleted", "false")]),
        )
        .await
    }

    async fn create_tunnel(
        &self,
        account_id: &str,
        name: &str,
        secret: &str,
    ) -> Result<Tunnel, CloudflareError> {
        let body = json!({
            "name": name,
            "tunnel_secret": secret,
            "config_src": "local",
        });
        self.send(
            self.request(Method::POST, &format!("/accounts/{account_id}/cfd_tunnel"))
                .json(&body),
        )
        .await
    }

    async fn tunnel_token(
        &self,
        account_id: &str,
        tunnel_id: &str,
    ) -> Result<TunnelCredentials, CloudflareError> {
        let token: String = self
            .send(self.request(
                Method::GET,
                &format!("/accounts/{account_id}/cfd_tunnel/{tunnel_id}/token"),
            ))
            .await?;
        TunnelCredentials::from_token(&token)
    }

    async fn dns_records(&self, zone_id: &str, name: &str) -> Result<Vec<DnsRecord>, CloudflareError> {
        self.send(
            self.request(Method::GET, &format!("/zones/{zone_id}/dns_records"))
                .query(&[("name", name)]),
        )
        .await
    }

    async fn create_dns_record(
        &self,
        zone_id: &str,
        record: &NewDnsRecord,
    ) -> Result<DnsRecord, CloudflareError> {
        self.send(
            self.request(Method::POST, &format!("/zones/{zone_id}/dns_records"))
                .json(record),
        )
        .await
    }

    async fn update_dns_record(
        &self,
        zone_id: &str,
        record_id: &str,
        record: &NewDnsRecord,
    ) -> Result<DnsRecord, CloudflareError> {
        self.send(
            self.request(Method::PUT, &format!("/zones/{zone_id}/dns_records/{record_id}"))
                .json(record),
        )
        .await
    }
}
