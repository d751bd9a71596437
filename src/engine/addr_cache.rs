//! Per-group address cache.
//!
//! URIs are keyed by `(rank, tag)` and shared by every context of the
//! process. Resolved transport addresses are additionally keyed by the
//! context that resolved them, since they are only meaningful to that
//! context's port.

use std::collections::HashMap;

use crate::engine::{Rank, Tag};
use crate::transport::TransportAddr;
use crate::utils::{CartwrightError, ErrorKind};

use parking_lot::RwLock;

/// Address cache of one group.
pub struct AddrCache {
    /// Maximum tag value accepted plus one.
    max_tags: u32,

    /// Map from (rank, tag) -> URI.
    uris: RwLock<HashMap<(Rank, Tag), String>>,

    /// Map from (context tag, rank, tag) -> resolved transport address.
    addrs: RwLock<HashMap<(Tag, Rank, Tag), TransportAddr>>,
}

impl AddrCache {
    pub fn new(max_tags: u32) -> Self {
        AddrCache {
            max_tags,
            uris: RwLock::new(HashMap::new()),
            addrs: RwLock::new(HashMap::new()),
        }
    }

    /// Cached URI of `(rank, tag)`.
    pub fn get_uri(&self, rank: Rank, tag: Tag) -> Option<String> {
        self.uris.read().get(&(rank, tag)).cloned()
    }

    /// Inserts `(rank, tag) -> uri`. A different URI already cached is
    /// replaced, and every transport address resolved from the old URI is
    /// dropped. Returns true if the cache changed.
    pub fn insert_uri(
        &self,
        rank: Rank,
        tag: Tag,
        uri: &str,
    ) -> Result<bool, CartwrightError> {
        if tag >= self.max_tags {
            return Err(CartwrightError::new(
                ErrorKind::InvalidArgument,
                format!("tag {} exceeds limit {}", tag, self.max_tags),
            ));
        }
        if uri.is_empty() {
            return Err(CartwrightError::new(
                ErrorKind::InvalidArgument,
                format!("empty uri for rank {} tag {}", rank, tag),
            ));
        }

        let mut uris = self.uris.write();
        match uris.get(&(rank, tag)) {
            Some(old) if old == uri => return Ok(false),
            Some(old) => {
                pf_debug!(
                    "uri of rank {} tag {} changed '{}' -> '{}'",
                    rank,
                    tag,
                    old,
                    uri
                );
                self.addrs
                    .write()
                    .retain(|&(_, r, t), _| r != rank || t != tag);
            }
            None => {}
        }
        uris.insert((rank, tag), uri.into());
        Ok(true)
    }

    /// Transport address of `(rank, tag)` resolved by context `ctx_tag`.
    pub fn get_addr(
        &self,
        ctx_tag: Tag,
        rank: Rank,
        tag: Tag,
    ) -> Option<TransportAddr> {
        self.addrs.read().get(&(ctx_tag, rank, tag)).copied()
    }

    pub fn insert_addr(
        &self,
        ctx_tag: Tag,
        rank: Rank,
        tag: Tag,
        addr: TransportAddr,
    ) {
        self.addrs.write().insert((ctx_tag, rank, tag), addr);
    }

    /// Forgets everything about `rank`.
    pub fn remove_rank(&self, rank: Rank) {
        let mut uris = self.uris.write();
        uris.retain(|&(r, _), _| r != rank);
        self.addrs.write().retain(|&(_, r, _), _| r != rank);
    }

    /// Number of cached URIs.
    pub fn num_uris(&self) -> usize {
        self.uris.read().len()
    }
}

#[cfg(test)]
mod addr_cache_tests {
    use super::*;

    #[test]
    fn insert_idempotent() -> Result<(), CartwrightError> {
        let cache = AddrCache::new(8);
        assert!(cache.insert_uri(3, 1, "local://a/1")?);
        cache.insert_addr(0, 3, 1, TransportAddr(5));
        assert!(!cache.insert_uri(3, 1, "local://a/1")?);
        assert_eq!(cache.get_uri(3, 1), Some("local://a/1".into()));
        assert_eq!(cache.get_addr(0, 3, 1), Some(TransportAddr(5)));
        assert_eq!(cache.num_uris(), 1);
        Ok(())
    }

    #[test]
    fn last_write_wins() -> Result<(), CartwrightError> {
        let cache = AddrCache::new(8);
        cache.insert_uri(3, 1, "local://a/1")?;
        cache.insert_uri(3, 2, "local://a/2")?;
        cache.insert_addr(0, 3, 1, TransportAddr(5));
        cache.insert_addr(1, 3, 1, TransportAddr(6));
        cache.insert_addr(0, 3, 2, TransportAddr(7));
        assert!(cache.insert_uri(3, 1, "local://b/1")?);
        assert_eq!(cache.get_uri(3, 1), Some("local://b/1".into()));
        assert_eq!(cache.get_addr(0, 3, 1), None);
        assert_eq!(cache.get_addr(1, 3, 1), None);
        assert_eq!(cache.get_addr(0, 3, 2), Some(TransportAddr(7)));
        Ok(())
    }

    #[test]
    fn limits_and_removal() -> Result<(), CartwrightError> {
        let cache = AddrCache::new(2);
        assert!(cache.insert_uri(0, 2, "local://a/2").is_err());
        assert!(cache.insert_uri(0, 0, "").is_err());
        cache.insert_uri(0, 0, "local://a/0")?;
        cache.insert_uri(1, 0, "local://b/0")?;
        cache.insert_addr(0, 1, 0, TransportAddr(1));
        cache.remove_rank(1);
        assert_eq!(cache.get_uri(1, 0), None);
        assert_eq!(cache.get_addr(0, 1, 0), None);
        assert_eq!(cache.get_uri(0, 0), Some("local://a/0".into()));
        Ok(())
    }
}
