//! Tunnel registry and leasing
//!
//! Owns every live tunnel, hostname reservation and port lease. One coarse
//! lock guards the tables; operations under it are short and never do I/O.
//! Listener bind/close happens outside the lock: a port is claimed in the
//! table first (placeholder lease), then bound; a failed bind releases the
//! claim.

use burrow_protocol::message::{Endpoint, Quotas, RegisterFailReason, TunnelKind};
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::ops::RangeInclusive;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Tunnel id placeholder marking a port claimed but not yet committed.
const CLAIMED: u64 = 0;

/// Per-tunnel byte counters; `in` is public-to-client.
#[derive(Debug, Default)]
pub struct TunnelStats {
    pub bytes_in: AtomicU64,
    pub bytes_out: AtomicU64,
}

impl TunnelStats {
    pub fn add_in(&self, n: u64) {
        self.bytes_in.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_out(&self, n: u64) {
        self.bytes_out.fetch_add(n, Ordering::Relaxed);
    }
}

/// One live tunnel. The registry hands these out as `Arc`s; the back
/// reference to the owning client is a plain id resolved through the client
/// map, never an owning pointer.
#[derive(Debug)]
pub struct TunnelRecord {
    pub id: u64,
    pub kind: TunnelKind,
    pub endpoint: Endpoint,
    pub client_id: Uuid,
    pub user_id: String,
    pub local_hint: String,
    pub stats: TunnelStats,
    /// Cancelled at teardown; stops the leased listener's tasks.
    pub stop: CancellationToken,
}

/// What an HTTP registration resolved to before claiming.
#[derive(Debug, Clone)]
pub enum HttpDescriptor {
    /// Assign a random free subdomain under the base domain.
    Random,
    /// A permitted subdomain label under the given base (base or alias).
    Subdomain { label: String, base: String },
    /// A verified custom domain, ownership already checked.
    Custom { fqdn: String },
}

struct RegistryInner {
    hostnames: HashMap<String, u64>,
    tcp_ports: HashMap<u16, u64>,
    udp_ports: HashMap<u16, u64>,
    tunnels: HashMap<u64, Arc<TunnelRecord>>,
    client_tunnels: HashMap<Uuid, HashSet<u64>>,
    user_domains: HashMap<String, u32>,
}

/// Process-wide tunnel/reservation/lease tables.
pub struct TunnelRegistry {
    inner: Mutex<RegistryInner>,
    next_tunnel_id: AtomicU64,
    base_domain: String,
    tcp_range: RangeInclusive<u16>,
    udp_range: RangeInclusive<u16>,
}

fn random_label() -> String {
    const CHARS: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();
    (0..10)
        .map(|_| CHARS[rng.gen_range(0..CHARS.len())] as char)
        .collect()
}

impl TunnelRegistry {
    pub fn new(
        base_domain: impl Into<String>,
        tcp_range: RangeInclusive<u16>,
        udp_range: RangeInclusive<u16>,
    ) -> Self {
        Self {
            inner: Mutex::new(RegistryInner {
                hostnames: HashMap::new(),
                tcp_ports: HashMap::new(),
                udp_ports: HashMap::new(),
                tunnels: HashMap::new(),
                client_tunnels: HashMap::new(),
                user_domains: HashMap::new(),
            }),
            next_tunnel_id: AtomicU64::new(1),
            base_domain: base_domain.into(),
            tcp_range,
            udp_range,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RegistryInner> {
        // Registry operations never panic while holding the lock.
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn base_domain(&self) -> &str {
        &self.base_domain
    }

    /// Register an HTTP tunnel: quota check, atomic hostname claim, record
    /// insert. Everything happens under one lock acquisition; there is no
    /// bind step for HTTP.
    pub fn register_http(
        &self,
        client_id: Uuid,
        user_id: &str,
        quotas: &Quotas,
        descriptor: &HttpDescriptor,
        local_hint: &str,
    ) -> Result<Arc<TunnelRecord>, RegisterFailReason> {
        let mut inner = self.lock();

        let tunnels_held = inner
            .client_tunnels
            .get(&client_id)
            .map_or(0, HashSet::len);
        if tunnels_held as u32 >= quotas.max_tunnels {
            return Err(RegisterFailReason::QuotaExceeded);
        }
        let domains_held = inner.user_domains.get(user_id).copied().unwrap_or(0);
        if domains_held >= quotas.max_domains {
            return Err(RegisterFailReason::QuotaExceeded);
        }

        let fqdn = match descriptor {
            HttpDescriptor::Random => loop {
                let candidate = format!("{}.{}", random_label(), self.base_domain);
                if !inner.hostnames.contains_key(&candidate) {
                    break candidate;
                }
            },
            HttpDescriptor::Subdomain { label, base } => {
                let fqdn = format!("{label}.{base}");
                if inner.hostnames.contains_key(&fqdn) {
                    return Err(RegisterFailReason::SubdomainTaken);
                }
                fqdn
            }
            HttpDescriptor::Custom { fqdn } => {
                if inner.hostnames.contains_key(fqdn) {
                    return Err(RegisterFailReason::SubdomainTaken);
                }
                fqdn.clone()
            }
        };

        let id = self.next_tunnel_id.fetch_add(1, Ordering::Relaxed);
        let record = Arc::new(TunnelRecord {
            id,
            kind: TunnelKind::Http,
            endpoint: Endpoint::Http { fqdn: fqdn.clone() },
            client_id,
            user_id: user_id.to_string(),
            local_hint: local_hint.to_string(),
            stats: TunnelStats::default(),
            stop: CancellationToken::new(),
        });

        inner.hostnames.insert(fqdn, id);
        inner.tunnels.insert(id, Arc::clone(&record));
        inner.client_tunnels.entry(client_id).or_default().insert(id);
        *inner.user_domains.entry(user_id.to_string()).or_insert(0) += 1;

        Ok(record)
    }

    /// Claim a port lease without committing a tunnel. The caller binds the
    /// listener outside the lock, then either commits or releases.
    ///
    /// `exclude` holds ports that already failed to bind this attempt, so an
    /// auto-allocation walk does not retry them.
    pub fn claim_port(
        &self,
        client_id: Uuid,
        quotas: &Quotas,
        kind: TunnelKind,
        hint: u16,
        exclude: &HashSet<u16>,
    ) -> Result<u16, RegisterFailReason> {
        let range = match kind {
            TunnelKind::Tcp => self.tcp_range.clone(),
            TunnelKind::Udp => self.udp_range.clone(),
            TunnelKind::Http => return Err(RegisterFailReason::PortOutOfRange),
        };

        let mut inner = self.lock();

        let tunnels_held = inner
            .client_tunnels
            .get(&client_id)
            .map_or(0, HashSet::len);
        if tunnels_held as u32 >= quotas.max_tunnels {
            return Err(RegisterFailReason::QuotaExceeded);
        }

        let ports = match kind {
            TunnelKind::Tcp => &mut inner.tcp_ports,
            TunnelKind::Udp => &mut inner.udp_ports,
            TunnelKind::Http => unreachable!(),
        };

        if hint != 0 {
            if !range.contains(&hint) {
                return Err(RegisterFailReason::PortOutOfRange);
            }
            if ports.contains_key(&hint) {
                return Err(RegisterFailReason::PortTaken);
            }
            ports.insert(hint, CLAIMED);
            return Ok(hint);
        }

        for port in range {
            if !ports.contains_key(&port) && !exclude.contains(&port) {
                ports.insert(port, CLAIMED);
                return Ok(port);
            }
        }
        Err(RegisterFailReason::NoPorts)
    }

    /// Release a claimed-but-uncommitted port (bind failed).
    pub fn release_port(&self, kind: TunnelKind, port: u16) {
        let mut inner = self.lock();
        let ports = match kind {
            TunnelKind::Tcp => &mut inner.tcp_ports,
            TunnelKind::Udp => &mut inner.udp_ports,
            TunnelKind::Http => return,
        };
        if ports.get(&port) == Some(&CLAIMED) {
            ports.remove(&port);
        }
    }

    /// Commit a bound port lease into a live tunnel record.
    pub fn commit_port_tunnel(
        &self,
        client_id: Uuid,
        user_id: &str,
        kind: TunnelKind,
        port: u16,
        local_hint: &str,
    ) -> Arc<TunnelRecord> {
        let id = self.next_tunnel_id.fetch_add(1, Ordering::Relaxed);
        let endpoint = match kind {
            TunnelKind::Tcp => Endpoint::Tcp { port },
            _ => Endpoint::Udp { port },
        };
        let record = Arc::new(TunnelRecord {
            id,
            kind,
            endpoint,
            client_id,
            user_id: user_id.to_string(),
            local_hint: local_hint.to_string(),
            stats: TunnelStats::default(),
            stop: CancellationToken::new(),
        });

        let mut inner = self.lock();
        match kind {
            TunnelKind::Tcp => inner.tcp_ports.insert(port, id),
            TunnelKind::Udp => inner.udp_ports.insert(port, id),
            TunnelKind::Http => None,
        };
        inner.tunnels.insert(id, Arc::clone(&record));
        inner.client_tunnels.entry(client_id).or_default().insert(id);
        record
    }

    /// Tear down one tunnel: reservation, lease and record released under
    /// the lock. Idempotent. The caller cancels `stop` afterwards, outside
    /// any lock.
    pub fn remove_tunnel(&self, tunnel_id: u64) -> Option<Arc<TunnelRecord>> {
        let mut inner = self.lock();
        let record = inner.tunnels.remove(&tunnel_id)?;

        match &record.endpoint {
            Endpoint::Http { fqdn } => {
                inner.hostnames.remove(fqdn);
                let emptied = match inner.user_domains.get_mut(&record.user_id) {
                    Some(count) => {
                        *count = count.saturating_sub(1);
                        *count == 0
                    }
                    None => false,
                };
                if emptied {
                    inner.user_domains.remove(&record.user_id);
                }
            }
            Endpoint::Tcp { port } => {
                inner.tcp_ports.remove(port);
            }
            Endpoint::Udp { port } => {
                inner.udp_ports.remove(port);
            }
        }
        let client_emptied = match inner.client_tunnels.get_mut(&record.client_id) {
            Some(set) => {
                set.remove(&tunnel_id);
                set.is_empty()
            }
            None => false,
        };
        if client_emptied {
            inner.client_tunnels.remove(&record.client_id);
        }
        Some(record)
    }

    /// Tear down everything a client owns. Returns the removed records so
    /// the caller can cancel their listeners outside the lock.
    pub fn remove_client(&self, client_id: Uuid) -> Vec<Arc<TunnelRecord>> {
        let ids: Vec<u64> = {
            let inner = self.lock();
            inner
                .client_tunnels
                .get(&client_id)
                .map(|set| set.iter().copied().collect())
                .unwrap_or_default()
        };
        ids.into_iter()
            .filter_map(|id| self.remove_tunnel(id))
            .collect()
    }

    /// Active reservation lookup for the HTTP router.
    pub fn lookup_hostname(&self, fqdn: &str) -> Option<Arc<TunnelRecord>> {
        let inner = self.lock();
        let id = inner.hostnames.get(fqdn)?;
        inner.tunnels.get(id).cloned()
    }

    pub fn lookup(&self, tunnel_id: u64) -> Option<Arc<TunnelRecord>> {
        self.lock().tunnels.get(&tunnel_id).cloned()
    }

    pub fn tunnel_count(&self, client_id: Uuid) -> usize {
        self.lock()
            .client_tunnels
            .get(&client_id)
            .map_or(0, HashSet::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> TunnelRegistry {
        TunnelRegistry::new("example.test", 10_000..=10_002, 20_001..=20_002)
    }

    fn quotas() -> Quotas {
        Quotas::default()
    }

    #[test]
    fn test_exclusive_hostname_reservation() {
        let reg = registry();
        let (c1, c2) = (Uuid::new_v4(), Uuid::new_v4());
        let desc = HttpDescriptor::Subdomain {
            label: "shared".into(),
            base: "example.test".into(),
        };

        let first = reg
            .register_http(c1, "alice", &quotas(), &desc, "127.0.0.1:3000")
            .unwrap();
        assert_eq!(
            first.endpoint,
            Endpoint::Http {
                fqdn: "shared.example.test".into()
            }
        );

        let err = reg
            .register_http(c2, "bob", &quotas(), &desc, "127.0.0.1:3001")
            .unwrap_err();
        assert_eq!(err, RegisterFailReason::SubdomainTaken);

        // Close, then the second client can claim it.
        reg.remove_tunnel(first.id).unwrap();
        reg.register_http(c2, "bob", &quotas(), &desc, "127.0.0.1:3001")
            .unwrap();
    }

    #[test]
    fn test_close_tunnel_is_idempotent() {
        let reg = registry();
        let client = Uuid::new_v4();
        let record = reg
            .register_http(client, "alice", &quotas(), &HttpDescriptor::Random, "x")
            .unwrap();

        assert!(reg.remove_tunnel(record.id).is_some());
        assert!(reg.remove_tunnel(record.id).is_none());
    }

    #[test]
    fn test_reregister_same_descriptor_after_close() {
        let reg = registry();
        let client = Uuid::new_v4();
        let desc = HttpDescriptor::Subdomain {
            label: "myapp".into(),
            base: "example.test".into(),
        };

        let first = reg
            .register_http(client, "alice", &quotas(), &desc, "x")
            .unwrap();
        reg.remove_tunnel(first.id).unwrap();
        let second = reg
            .register_http(client, "alice", &quotas(), &desc, "x")
            .unwrap();
        // Tunnel ids are never reused.
        assert_ne!(first.id, second.id);
    }

    #[test]
    fn test_port_allocation_walks_range() {
        let reg = registry();
        let client = Uuid::new_v4();
        let none = HashSet::new();

        let p1 = reg
            .claim_port(client, &quotas(), TunnelKind::Tcp, 0, &none)
            .unwrap();
        assert_eq!(p1, 10_000);
        reg.commit_port_tunnel(client, "alice", TunnelKind::Tcp, p1, "x");

        let p2 = reg
            .claim_port(client, &quotas(), TunnelKind::Tcp, 0, &none)
            .unwrap();
        assert_eq!(p2, 10_001);
        reg.commit_port_tunnel(client, "alice", TunnelKind::Tcp, p2, "x");

        // Exactly one free port left.
        let p3 = reg
            .claim_port(client, &quotas(), TunnelKind::Tcp, 0, &none)
            .unwrap();
        assert_eq!(p3, 10_002);
        reg.commit_port_tunnel(client, "alice", TunnelKind::Tcp, p3, "x");

        // Zero free ports.
        let err = reg
            .claim_port(client, &quotas(), TunnelKind::Tcp, 0, &none)
            .unwrap_err();
        assert_eq!(err, RegisterFailReason::NoPorts);
    }

    #[test]
    fn test_port_hint_rules() {
        let reg = registry();
        let client = Uuid::new_v4();
        let none = HashSet::new();

        assert_eq!(
            reg.claim_port(client, &quotas(), TunnelKind::Tcp, 9_999, &none)
                .unwrap_err(),
            RegisterFailReason::PortOutOfRange
        );

        let p = reg
            .claim_port(client, &quotas(), TunnelKind::Tcp, 10_001, &none)
            .unwrap();
        assert_eq!(p, 10_001);
        assert_eq!(
            reg.claim_port(client, &quotas(), TunnelKind::Tcp, 10_001, &none)
                .unwrap_err(),
            RegisterFailReason::PortTaken
        );

        // Released claims become available again.
        reg.release_port(TunnelKind::Tcp, 10_001);
        reg.claim_port(client, &quotas(), TunnelKind::Tcp, 10_001, &none)
            .unwrap();
    }

    #[test]
    fn test_tunnel_quota_enforced() {
        let reg = registry();
        let client = Uuid::new_v4();
        let tight = Quotas {
            max_tunnels: 1,
            max_domains: 8,
        };

        reg.register_http(client, "alice", &tight, &HttpDescriptor::Random, "x")
            .unwrap();
        let err = reg
            .register_http(client, "alice", &tight, &HttpDescriptor::Random, "x")
            .unwrap_err();
        assert_eq!(err, RegisterFailReason::QuotaExceeded);
    }

    #[test]
    fn test_domain_quota_counts_per_user() {
        let reg = registry();
        let tight = Quotas {
            max_tunnels: 16,
            max_domains: 1,
        };

        // Same user across two clients shares the domain budget.
        reg.register_http(Uuid::new_v4(), "alice", &tight, &HttpDescriptor::Random, "x")
            .unwrap();
        let err = reg
            .register_http(Uuid::new_v4(), "alice", &tight, &HttpDescriptor::Random, "x")
            .unwrap_err();
        assert_eq!(err, RegisterFailReason::QuotaExceeded);
    }

    #[test]
    fn test_remove_client_releases_everything() {
        let reg = registry();
        let client = Uuid::new_v4();
        let none = HashSet::new();

        let http = reg
            .register_http(
                client,
                "alice",
                &quotas(),
                &HttpDescriptor::Subdomain {
                    label: "myapp".into(),
                    base: "example.test".into(),
                },
                "x",
            )
            .unwrap();
        let port = reg
            .claim_port(client, &quotas(), TunnelKind::Tcp, 0, &none)
            .unwrap();
        reg.commit_port_tunnel(client, "alice", TunnelKind::Tcp, port, "x");

        let removed = reg.remove_client(client);
        assert_eq!(removed.len(), 2);
        assert!(reg.lookup_hostname("myapp.example.test").is_none());
        assert!(reg.lookup(http.id).is_none());
        assert_eq!(reg.tunnel_count(client), 0);

        // Descriptor and port are free again immediately.
        reg.register_http(
            Uuid::new_v4(),
            "bob",
            &quotas(),
            &HttpDescriptor::Subdomain {
                label: "myapp".into(),
                base: "example.test".into(),
            },
            "x",
        )
        .unwrap();
        reg.claim_port(Uuid::new_v4(), &quotas(), TunnelKind::Tcp, port, &none)
            .unwrap();
    }
}
