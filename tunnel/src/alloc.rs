//! Logical address allocator, mirroring `LogicalIpAddrMgr`.
//!
//! A name, once mapped, keeps its IP for the life of that mapping even past
//! TTL expiry — `resolve_ip` never clears a stale binding, only
//! `generate_ip`'s eviction path reassigns the IP itself to a new name (see
//! scenario S5 in `spec.md` §8).

use std::collections::{BTreeMap, HashMap};
use std::net::Ipv4Addr;
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const DEFAULT_TTL: Duration = Duration::from_secs(3600);

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AllocError {
    #[error("allocator already configured")]
    AlreadyConfigured,
    #[error("invalid address range: first_ip must be <= last_ip")]
    InvalidRange,
    #[error("address pool exhausted")]
    Exhausted,
    #[error("allocator has not been configured")]
    NotConfigured,
}

struct Inner {
    first_ip: Ipv4Addr,
    last_ip: Ipv4Addr,
    ttl: Duration,
    /// expiry (ms since epoch) -> ip, ordered so the smallest expiry is
    /// always `.iter().next()` (stand-in for the original's
    /// `std::multimap<uint64_t, IpAddress>`).
    by_expiry: BTreeMap<u64, Ipv4Addr>,
    /// ip -> expiry (ms since epoch), for membership + reverse lookups.
    by_addr: HashMap<Ipv4Addr, u64>,
    name_to_ip: HashMap<String, Ipv4Addr>,
}

/// Clock abstraction so tests can control elapsed time instead of sleeping.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> u64;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock is before UNIX_EPOCH")
            .as_millis() as u64
    }
}

pub struct LogicalAddressAllocator<C: Clock = SystemClock> {
    clock: C,
    inner: Mutex<Option<Inner>>,
}

impl Default for LogicalAddressAllocator<SystemClock> {
    fn default() -> Self {
        Self::new(SystemClock)
    }
}

impl<C: Clock> LogicalAddressAllocator<C> {
    pub fn new(clock: C) -> Self {
        Self {
            clock,
            inner: Mutex::new(None),
        }
    }

    /// May be called only once; subsequent calls fail without modifying
    /// state (spec.md scenario S6).
    pub fn configure(
        &self,
        first_ip: Ipv4Addr,
        last_ip: Ipv4Addr,
        ttl: Option<Duration>,
    ) -> Result<(), AllocError> {
        let mut guard = self.inner.lock().unwrap();

        if guard.is_some() {
            return Err(AllocError::AlreadyConfigured);
        }

        if u32::from(first_ip) > u32::from(last_ip) {
            return Err(AllocError::InvalidRange);
        }

        *guard = Some(Inner {
            first_ip,
            last_ip,
            ttl: ttl.unwrap_or(DEFAULT_TTL),
            by_expiry: BTreeMap::new(),
            by_addr: HashMap::new(),
            name_to_ip: HashMap::new(),
        });

        Ok(())
    }

    /// Idempotent for an already-bound name; otherwise evicts the
    /// globally-oldest expired entry, else takes the next free IP, else
    /// fails with [`AllocError::Exhausted`].
    pub fn generate_ip(&self, name: &str) -> Result<Ipv4Addr, AllocError> {
        let mut guard = self.inner.lock().unwrap();
        let inner = guard.as_mut().ok_or(AllocError::NotConfigured)?;

        if let Some(ip) = inner.name_to_ip.get(name) {
            return Ok(*ip);
        }

        let now = self.clock.now_ms();
        let expiry = now + inner.ttl.as_millis() as u64;

        if inner.by_expiry.is_empty() {
            inner.by_expiry.insert(expiry, inner.first_ip);
            inner.by_addr.insert(inner.first_ip, expiry);
            inner.name_to_ip.insert(name.to_string(), inner.first_ip);
            return Ok(inner.first_ip);
        }

        let oldest = *inner.by_expiry.keys().next().expect("checked non-empty");

        if oldest < now {
            let evicted_ip = inner.by_expiry.remove(&oldest).expect("key just read");
            inner.by_addr.remove(&evicted_ip);

            inner.by_expiry.insert(expiry, evicted_ip);
            inner.by_addr.insert(evicted_ip, expiry);
            inner.name_to_ip.insert(name.to_string(), evicted_ip);

            return Ok(evicted_ip);
        }

        let highest_assigned = *inner
            .by_expiry
            .values()
            .max_by_key(|ip| u32::from(**ip))
            .expect("checked non-empty");

        if u32::from(highest_assigned) >= u32::from(inner.last_ip) {
            return Err(AllocError::Exhausted);
        }

        let mut candidate = u32::from(highest_assigned) + 1;
        while inner.by_addr.contains_key(&Ipv4Addr::from(candidate)) {
            if candidate >= u32::from(inner.last_ip) {
                return Err(AllocError::Exhausted);
            }
            candidate += 1;
        }

        let next_ip = Ipv4Addr::from(candidate);
        inner.by_expiry.insert(expiry, next_ip);
        inner.by_addr.insert(next_ip, expiry);
        inner.name_to_ip.insert(name.to_string(), next_ip);

        Ok(next_ip)
    }

    /// Returns the current binding without allocating a new one. Does not
    /// refresh or clear the binding even if its TTL has lapsed.
    pub fn resolve_ip(&self, name: &str) -> Result<Option<Ipv4Addr>, AllocError> {
        let guard = self.inner.lock().unwrap();
        let inner = guard.as_ref().ok_or(AllocError::NotConfigured)?;

        Ok(inner.name_to_ip.get(name).copied())
    }

    /// `/etc/hosts`-style snapshot: `<ip>   <name>\n` per binding.
    pub fn get_hosts(&self) -> Result<String, AllocError> {
        let guard = self.inner.lock().unwrap();
        let inner = guard.as_ref().ok_or(AllocError::NotConfigured)?;

        let mut out = String::new();
        for (name, ip) in &inner.name_to_ip {
            out.push_str(&ip.to_string());
            out.push_str("   ");
            out.push_str(name);
            out.push('\n');
        }

        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    struct FakeClock(AtomicU64);

    impl Clock for FakeClock {
        fn now_ms(&self) -> u64 {
            self.0.load(Ordering::SeqCst)
        }
    }

    impl FakeClock {
        fn advance(&self, ms: u64) {
            self.0.fetch_add(ms, Ordering::SeqCst);
        }
    }

    fn ip(s: &str) -> Ipv4Addr {
        s.parse().unwrap()
    }

    #[test]
    fn configure_is_one_shot() {
        let alloc = LogicalAddressAllocator::new(FakeClock(AtomicU64::new(0)));
        alloc
            .configure(ip("10.0.0.1"), ip("10.0.0.3"), Some(Duration::from_secs(7200)))
            .unwrap();

        assert_eq!(
            alloc.configure(ip("10.0.0.1"), ip("10.0.0.9"), None),
            Err(AllocError::AlreadyConfigured)
        );
    }

    #[test]
    fn stickiness_and_exclusivity() {
        let alloc = LogicalAddressAllocator::new(FakeClock(AtomicU64::new(0)));
        alloc.configure(ip("10.0.0.1"), ip("10.0.0.5"), None).unwrap();

        let a1 = alloc.generate_ip("a").unwrap();
        let a2 = alloc.generate_ip("a").unwrap();
        assert_eq!(a1, a2);

        let b = alloc.generate_ip("b").unwrap();
        assert_ne!(a1, b);
    }

    #[test]
    fn range_is_respected_and_exhaustion_fails() {
        let alloc = LogicalAddressAllocator::new(FakeClock(AtomicU64::new(0)));
        alloc.configure(ip("10.0.0.1"), ip("10.0.0.2"), None).unwrap();

        assert_eq!(alloc.generate_ip("a").unwrap(), ip("10.0.0.1"));
        assert_eq!(alloc.generate_ip("b").unwrap(), ip("10.0.0.2"));
        assert_eq!(alloc.generate_ip("c"), Err(AllocError::Exhausted));
    }

    #[test]
    fn ttl_eviction_picks_globally_oldest_expiry() {
        let clock = FakeClock(AtomicU64::new(0));
        let alloc = LogicalAddressAllocator::new(clock);
        alloc
            .configure(ip("10.0.0.1"), ip("10.0.0.2"), Some(Duration::from_secs(1)))
            .unwrap();

        assert_eq!(alloc.generate_ip("a").unwrap(), ip("10.0.0.1"));
        assert_eq!(alloc.generate_ip("b").unwrap(), ip("10.0.0.2"));

        alloc.clock.advance(1100);

        // a's TTL has lapsed; it's the oldest expiry, so it gets evicted and
        // reassigned to "c".
        assert_eq!(alloc.generate_ip("c").unwrap(), ip("10.0.0.1"));

        // "a" still resolves to its old IP: eviction never clears the name
        // binding, only frees the IP for reassignment (S5).
        assert_eq!(alloc.resolve_ip("a").unwrap(), Some(ip("10.0.0.1")));
    }

    #[test]
    fn addresses_always_lie_within_configured_range() {
        let alloc = LogicalAddressAllocator::new(FakeClock(AtomicU64::new(0)));
        alloc.configure(ip("10.0.0.1"), ip("10.0.0.4"), None).unwrap();

        for name in ["a", "b", "c", "d"] {
            let assigned = alloc.generate_ip(name).unwrap();
            assert!(u32::from(assigned) >= u32::from(ip("10.0.0.1")));
            assert!(u32::from(assigned) <= u32::from(ip("10.0.0.4")));
        }
    }
}
