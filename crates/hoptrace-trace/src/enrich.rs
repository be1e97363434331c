//! Address to geo/owner enrichment for backends that print bare addresses.

use hoptrace_model::{Geo, GeoField, HopRecord};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use tracing::debug;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct GeoInfo {
    pub geo: Geo,
    pub network_owner: Option<String>,
}

/// External address lookup. Implementations may block.
pub trait GeoLookup: Send + Sync {
    fn lookup(&self, address: &str) -> Option<GeoInfo>;
}

/// Caller-owned lookup cache, shareable across sessions. Misses are cached
/// too, so each distinct address reaches the lookup at most once.
#[derive(Debug, Clone, Default)]
pub struct GeoCache {
    entries: Arc<Mutex<HashMap<String, Option<GeoInfo>>>>,
}

impl GeoCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, address: &str) -> Option<Option<GeoInfo>> {
        self.lock().get(address).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Returns the cached entry or runs `fetch` once and stores its result.
    /// The lock is held across `fetch`.
    pub fn get_or_fetch<F>(&self, address: &str, fetch: F) -> Option<GeoInfo>
    where
        F: FnOnce(&str) -> Option<GeoInfo>,
    {
        let mut entries = self.lock();
        if let Some(hit) = entries.get(address) {
            return hit.clone();
        }
        let fetched = fetch(address);
        entries.insert(address.to_string(), fetched.clone());
        fetched
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Option<GeoInfo>>> {
        self.entries.lock().unwrap_or_else(|err| err.into_inner())
    }
}

#[derive(Clone)]
pub struct GeoEnricher {
    lookup: Arc<dyn GeoLookup>,
    cache: GeoCache,
}

impl GeoEnricher {
    pub fn new(lookup: Arc<dyn GeoLookup>, cache: GeoCache) -> Self {
        Self { lookup, cache }
    }

    pub fn cache(&self) -> &GeoCache {
        &self.cache
    }

    /// Fills unknown geo fields and a missing owner. Returns true if the hop
    /// changed.
    pub fn enrich(&self, hop: &mut HopRecord) -> bool {
        if !hop.has_reply() {
            return false;
        }
        let lookup = &self.lookup;
        let Some(info) = self
            .cache
            .get_or_fetch(&hop.address, |address| lookup.lookup(address))
        else {
            return false;
        };

        let mut changed = hop.geo.merge_from(&info.geo);
        if hop.network_owner.is_none() && info.network_owner.is_some() {
            hop.network_owner = info.network_owner;
            changed = true;
        }
        if changed {
            debug!(hop = hop.hop_number, address = %hop.address, "enriched hop");
        }
        changed
    }
}

/// Offline lookup that labels non-routable address ranges.
#[derive(Debug, Clone, Copy, Default)]
pub struct PrivateRangeLookup;

impl GeoLookup for PrivateRangeLookup {
    fn lookup(&self, address: &str) -> Option<GeoInfo> {
        let ip: IpAddr = address.parse().ok()?;
        let (country, region, owner) = match ip {
            IpAddr::V4(v4) => {
                let octets = v4.octets();
                if v4.is_loopback() {
                    ("Local host", "Loopback", "Operating system")
                } else if v4.is_link_local() {
                    ("Link local", "Autoconfiguration", "Local link")
                } else if v4.is_private() {
                    let class = match octets[0] {
                        10 => "Class A private",
                        172 => "Class B private",
                        _ => "Class C private",
                    };
                    ("Private network", class, "Internal network")
                } else if octets[0] == 100 && (64..128).contains(&octets[1]) {
                    ("Shared address space", "Carrier-grade NAT", "Carrier network")
                } else {
                    return None;
                }
            }
            IpAddr::V6(v6) => {
                let first = v6.segments()[0];
                if v6.is_loopback() {
                    ("Local host", "Loopback", "Operating system")
                } else if first & 0xffc0 == 0xfe80 {
                    ("Link local", "Autoconfiguration", "Local link")
                } else if first & 0xfe00 == 0xfc00 {
                    ("Private network", "Unique local", "Internal network")
                } else {
                    return None;
                }
            }
        };

        Some(GeoInfo {
            geo: Geo {
                country: GeoField::from(country),
                region: GeoField::from(region),
                city: GeoField::Unknown,
            },
            network_owner: Some(owner.to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingLookup {
        calls: AtomicUsize,
    }

    impl GeoLookup for CountingLookup {
        fn lookup(&self, address: &str) -> Option<GeoInfo> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if address == "8.8.8.8" {
                let mut geo = Geo::default();
                geo.fill_unknown(&["United States", "California", "Mountain View"]);
                Some(GeoInfo {
                    geo,
                    network_owner: Some("AS15169".to_string()),
                })
            } else {
                None
            }
        }
    }

    #[test]
    fn lookup_runs_once_per_address() {
        let lookup = Arc::new(CountingLookup {
            calls: AtomicUsize::new(0),
        });
        let enricher = GeoEnricher::new(lookup.clone(), GeoCache::new());

        let mut first = HopRecord::new(5, "8.8.8.8");
        let mut again = HopRecord::new(9, "8.8.8.8");
        let mut unknown = HopRecord::new(6, "203.0.113.9");
        let mut unknown_again = HopRecord::new(7, "203.0.113.9");
        let mut lost = HopRecord::timed_out(8);

        assert!(enricher.enrich(&mut first));
        assert!(enricher.enrich(&mut again));
        assert!(!enricher.enrich(&mut unknown));
        assert!(!enricher.enrich(&mut unknown_again));
        assert!(!enricher.enrich(&mut lost));

        assert_eq!(lookup.calls.load(Ordering::SeqCst), 2);
        assert_eq!(enricher.cache().len(), 2);
        assert_eq!(first.network_owner.as_deref(), Some("AS15169"));
        assert_eq!(again.geo.city.as_known(), Some("Mountain View"));
    }

    #[test]
    fn enrichment_keeps_parsed_fields() {
        let enricher = GeoEnricher::new(Arc::new(PrivateRangeLookup), GeoCache::new());
        let mut hop = HopRecord::new(1, "192.168.1.1");
        hop.network_owner = Some("home-router".to_string());
        assert!(enricher.enrich(&mut hop));
        assert_eq!(hop.network_owner.as_deref(), Some("home-router"));
        assert_eq!(hop.geo.region.as_known(), Some("Class C private"));
    }

    #[test]
    fn private_ranges_are_labelled() {
        let lookup = PrivateRangeLookup;
        assert_eq!(
            lookup.lookup("10.1.2.3").unwrap().geo.region.as_known(),
            Some("Class A private")
        );
        assert_eq!(
            lookup.lookup("127.0.0.1").unwrap().geo.country.as_known(),
            Some("Local host")
        );
        assert!(lookup.lookup("100.64.0.1").is_some());
        assert!(lookup.lookup("fe80::1").is_some());
        assert!(lookup.lookup("fd00::1").is_some());
        assert!(lookup.lookup("8.8.8.8").is_none());
        assert!(lookup.lookup("2606:4700:4700::1111").is_none());
        assert!(lookup.lookup("not-an-ip").is_none());
    }
}
