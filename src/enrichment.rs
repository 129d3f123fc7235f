//! WHOIS enrichment with caching and lookup pacing
//!
//! Lookups go over the WHOIS port-43 protocol: the IANA server is asked for
//! the authoritative server first, then the referral is queried. Results are
//! cached in the store for 24 hours. A lookup never fails; on any error the
//! caller gets a minimal record so classification can proceed.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::models::WhoisRecord;
use crate::store::Store;
use crate::upstream::normalize_domain;

/// How long a cached record stays fresh.
const CACHE_TTL_HOURS: i64 = 24;

/// Minimum gap between outbound lookups, per WHOIS server etiquette.
const LOOKUP_GAP: Duration = Duration::from_secs(2);

/// Per-connection deadline for a WHOIS exchange.
const WHOIS_TIMEOUT: Duration = Duration::from_secs(10);

const IANA_WHOIS: &str = "whois.iana.org";

/// Lookup and cache counters, snapshotted for the stats endpoint.
#[derive(Debug, Clone, Default, Serialize)]
pub struct WhoisStats {
    pub total_lookups: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
}

/// Domain registration lookups with store-backed caching.
pub struct WhoisService {
    store: Arc<Store>,
    /// Timestamp of the last outbound lookup; also serializes lookups
    pacer: tokio::sync::Mutex<Option<tokio::time::Instant>>,
    lookups: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
}

impl WhoisService {
    pub fn new(store: Arc<Store>) -> Self {
        Self {
            store,
            pacer: tokio::sync::Mutex::new(None),
            lookups: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
        }
    }

    /// Registration metadata for `domain`, from cache when fresh.
    ///
    /// Never fails: lookup or parse problems yield a minimal record with
    /// empty fields and `looked_up_at` set to now.
    pub async fn lookup(&self, domain: &str) -> WhoisRecord {
        let domain = normalize_domain(domain);

        if let Ok(Some(cached)) = self.store.whois_get(&domain) {
            let age = Utc::now().signed_duration_since(cached.looked_up_at);
            if age < chrono::Duration::hours(CACHE_TTL_HOURS) {
                self.cache_hits.fetch_add(1, Ordering::Relaxed);
                debug!(domain = %domain, age_mins = age.num_minutes(), "WHOIS cache hit");
                return cached;
            }
        }
        self.cache_misses.fetch_add(1, Ordering::Relaxed);

        // Holding the pacer across the exchange serializes lookups and
        // enforces the minimum gap between them.
        let mut last = self.pacer.lock().await;
        if let Some(prev) = *last {
            let elapsed = prev.elapsed();
            if elapsed < LOOKUP_GAP {
                tokio::time::sleep(LOOKUP_GAP - elapsed).await;
            }
        }
        *last = Some(tokio::time::Instant::now());
        self.lookups.fetch_add(1, Ordering::Relaxed);

        let fetched = self.fetch(&domain).await;
        drop(last);

        match fetched {
            Ok(record) => {
                if let Err(e) = self.store.whois_put(&record) {
                    warn!(domain = %domain, error = %e, "Failed to cache WHOIS record");
                }
                record
            }
            Err(e) => {
                // Failed lookups are not cached; a stale entry stays
                // available for the next attempt
                warn!(domain = %domain, error = %e, "WHOIS lookup failed");
                WhoisRecord::minimal(&domain)
            }
        }
    }

    /// Counter snapshot.
    pub fn stats(&self) -> WhoisStats {
        WhoisStats {
            total_lookups: self.lookups.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
        }
    }

    async fn fetch(&self, domain: &str) -> std::io::Result<WhoisRecord> {
        let referral = query_whois(IANA_WHOIS, domain).await?;
        let response = match parse_field(&referral, "refer") {
            Some(server) => query_whois(&server, domain).await?,
            // Some TLD registries answer directly from IANA's response
            None => referral,
        };
        Ok(parse_whois_response(domain, &response))
    }
}

/// One WHOIS exchange: connect, send the query, read until EOF.
async fn query_whois(server: &str, query: &str) -> std::io::Result<String> {
    let exchange = async {
        let mut stream = TcpStream::connect((server, 43)).await?;
        stream.write_all(format!("{query}\r\n").as_bytes()).await?;
        let mut buf = Vec::new();
        stream.read_to_end(&mut buf).await?;
        Ok(String::from_utf8_lossy(&buf).into_owned())
    };
    tokio::time::timeout(WHOIS_TIMEOUT, exchange)
        .await
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "WHOIS exchange timed out"))?
}

/// First value of a `key: value` line, case-insensitive on the key.
fn parse_field(raw: &str, key: &str) -> Option<String> {
    for line in raw.lines() {
        let line = line.trim();
        if let Some((k, v)) = line.split_once(':') {
            if k.trim().eq_ignore_ascii_case(key) {
                let v = v.trim();
                if !v.is_empty() {
                    return Some(v.to_string());
                }
            }
        }
    }
    None
}

/// All values of a `key: value` line, case-insensitive on the key.
fn parse_fields(raw: &str, key: &str) -> Vec<String> {
    let mut out = Vec::new();
    for line in raw.lines() {
        let line = line.trim();
        if let Some((k, v)) = line.split_once(':') {
            if k.trim().eq_ignore_ascii_case(key) {
                let v = v.trim();
                if !v.is_empty() {
                    out.push(v.to_lowercase());
                }
            }
        }
    }
    out
}

/// Extract the schema fields from a raw WHOIS response. Registries differ in
/// key names, so each field tries the common spellings in order.
fn parse_whois_response(domain: &str, raw: &str) -> WhoisRecord {
    let mut record = WhoisRecord::minimal(domain);

    record.registrar = parse_field(raw, "Registrar")
        .or_else(|| parse_field(raw, "registrar"))
        .unwrap_or_default();

    record.country = parse_field(raw, "Registrant Country")
        .or_else(|| parse_field(raw, "Country"))
        .or_else(|| parse_field(raw, "country"))
        .unwrap_or_default();

    record.created_date = parse_field(raw, "Creation Date")
        .or_else(|| parse_field(raw, "created"))
        .or_else(|| parse_field(raw, "Registered On"))
        .unwrap_or_default();

    record.updated_date = parse_field(raw, "Updated Date")
        .or_else(|| parse_field(raw, "changed"))
        .or_else(|| parse_field(raw, "last-update"))
        .unwrap_or_default();

    record.expiry_date = parse_field(raw, "Registry Expiry Date")
        .or_else(|| parse_field(raw, "Expiration Date"))
        .or_else(|| parse_field(raw, "expires"))
        .unwrap_or_default();

    let mut servers = parse_fields(raw, "Name Server");
    if servers.is_empty() {
        servers = parse_fields(raw, "nserver");
    }
    record.name_servers = servers;

    record
}
