//! Groups: named, versioned rank sets with their address cache.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crate::engine::{AddrCache, Rank, Tag};
use crate::utils::{CartwrightError, ErrorKind};

use parking_lot::RwLock;

/// Membership change notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupEvent {
    RankAdded,
    RankRemoved,
}

/// Membership change callback: `(group name, rank, event)`.
pub type GroupEventCb = Arc<dyn Fn(&str, Rank, GroupEvent) + Send + Sync>;

/// A group as seen by this process.
pub struct Group {
    /// Group name.
    name: String,

    /// My rank, `None` if this process is a client of the group.
    self_rank: Option<Rank>,

    /// Primary service rank, first point of contact for clients.
    psr: RwLock<Option<Rank>>,

    /// Membership version, bumped on every change.
    version: AtomicU32,

    /// Sorted member ranks.
    members: RwLock<Vec<Rank>>,

    /// Upper limit of the number of members.
    max_size: u32,

    /// Address cache shared by all contexts.
    cache: AddrCache,

    /// Registered membership change callbacks.
    event_cbs: RwLock<Vec<GroupEventCb>>,
}

impl Group {
    pub(crate) fn new(
        name: &str,
        self_rank: Option<Rank>,
        mut members: Vec<Rank>,
        max_size: u32,
        max_tags: u32,
    ) -> Result<Self, CartwrightError> {
        if name.is_empty() {
            return logged_err!(InvalidArgument; "empty group name");
        }
        members.sort_unstable();
        members.dedup();
        if let Some(me) = self_rank {
            if members.binary_search(&me).is_err() {
                members.insert(members.partition_point(|&r| r < me), me);
            }
        }
        if members.len() > max_size as usize {
            return logged_err!(
                InvalidArgument;
                "group '{}' size {} exceeds limit {}",
                name,
                members.len(),
                max_size
            );
        }

        Ok(Group {
            name: name.into(),
            self_rank,
            psr: RwLock::new(None),
            version: AtomicU32::new(1),
            members: RwLock::new(members),
            max_size,
            cache: AddrCache::new(max_tags),
            event_cbs: RwLock::new(Vec::new()),
        })
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn self_rank(&self) -> Option<Rank> {
        self.self_rank
    }

    /// True if this process is a service member of the group.
    #[inline]
    pub fn is_service(&self) -> bool {
        self.self_rank.is_some()
    }

    #[inline]
    pub fn version(&self) -> u32 {
        self.version.load(Ordering::Acquire)
    }

    pub fn set_version(&self, version: u32) {
        self.version.store(version, Ordering::Release);
    }

    pub fn psr(&self) -> Option<Rank> {
        *self.psr.read()
    }

    /// Sets the primary service rank and the URI of its tag 0.
    pub fn set_psr(
        &self,
        rank: Rank,
        uri: &str,
    ) -> Result<(), CartwrightError> {
        self.cache.insert_uri(rank, 0, uri)?;
        *self.psr.write() = Some(rank);
        pf_debug!("group '{}' psr set to {} at '{}'", self.name, rank, uri);
        Ok(())
    }

    /// Snapshot of the sorted member ranks.
    pub fn members(&self) -> Vec<Rank> {
        self.members.read().clone()
    }

    pub fn size(&self) -> u32 {
        self.members.read().len() as u32
    }

    pub fn contains(&self, rank: Rank) -> bool {
        self.members.read().binary_search(&rank).is_ok()
    }

    #[inline]
    pub fn cache(&self) -> &AddrCache {
        &self.cache
    }

    /// Inserts a URI into the address cache.
    pub fn insert_uri(
        &self,
        rank: Rank,
        tag: Tag,
        uri: &str,
    ) -> Result<bool, CartwrightError> {
        self.cache.insert_uri(rank, tag, uri)
    }

    pub fn register_event_cb(&self, cb: GroupEventCb) {
        self.event_cbs.write().push(cb);
    }

    fn notify(&self, rank: Rank, event: GroupEvent) {
        let cbs = self.event_cbs.read().clone();
        for cb in cbs {
            cb(&self.name, rank, event);
        }
    }

    /// Adds a member rank, optionally with the URI of its tag 0.
    pub fn add_rank(
        &self,
        rank: Rank,
        uri: Option<&str>,
    ) -> Result<(), CartwrightError> {
        {
            let mut members = self.members.write();
            let pos = match members.binary_search(&rank) {
                Ok(_) => {
                    return logged_err!(
                        InvalidArgument;
                        "rank {} already in group '{}'",
                        rank,
                        self.name
                    );
                }
                Err(pos) => pos,
            };
            if members.len() >= self.max_size as usize {
                return logged_err!(
                    InvalidArgument;
                    "group '{}' is full ({} ranks)",
                    self.name,
                    self.max_size
                );
            }
            members.insert(pos, rank);
        }
        if let Some(uri) = uri {
            self.cache.insert_uri(rank, 0, uri)?;
        }
        self.version.fetch_add(1, Ordering::AcqRel);

        pf_info!("rank {} added to group '{}'", rank, self.name);
        self.notify(rank, GroupEvent::RankAdded);
        Ok(())
    }

    /// Removes a member rank and every cached address of it.
    pub fn remove_rank(&self, rank: Rank) -> Result<(), CartwrightError> {
        if Some(rank) == self.self_rank {
            return logged_err!(
                InvalidArgument;
                "cannot remove self rank {} from group '{}'",
                rank,
                self.name
            );
        }
        {
            let mut members = self.members.write();
            match members.binary_search(&rank) {
                Ok(pos) => {
                    members.remove(pos);
                }
                Err(_) => {
                    return Err(CartwrightError::new(
                        ErrorKind::UnknownRank,
                        format!("rank {} not in group '{}'", rank, self.name),
                    ));
                }
            }
        }
        self.cache.remove_rank(rank);
        {
            let mut psr = self.psr.write();
            if *psr == Some(rank) {
                pf_warn!("group '{}' lost its psr {}", self.name, rank);
                *psr = None;
            }
        }
        self.version.fetch_add(1, Ordering::AcqRel);

        pf_info!("rank {} removed from group '{}'", rank, self.name);
        self.notify(rank, GroupEvent::RankRemoved);
        Ok(())
    }
}

impl fmt::Debug for Group {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "Group{{{} v{} self {:?} size {}}}",
            self.name,
            self.version(),
            self.self_rank,
            self.size()
        )
    }
}

#[cfg(test)]
mod group_tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn membership_changes() -> Result<(), CartwrightError> {
        let group = Group::new("g", Some(2), vec![0, 1, 3], 8, 4)?;
        assert_eq!(group.members(), vec![0, 1, 2, 3]);
        assert_eq!(group.version(), 1);

        let events = Arc::new(Mutex::new(Vec::new()));
        let events_ref = events.clone();
        group.register_event_cb(Arc::new(move |name: &str, rank, ev| {
            events_ref.lock().push((name.to_string(), rank, ev));
        }));

        group.add_rank(7, Some("local://g/7"))?;
        assert!(group.contains(7));
        assert_eq!(group.cache().get_uri(7, 0), Some("local://g/7".into()));
        assert!(group.add_rank(7, None).is_err());

        group.remove_rank(7)?;
        assert!(!group.contains(7));
        assert_eq!(group.cache().get_uri(7, 0), None);
        assert_eq!(
            group.remove_rank(7).unwrap_err().kind(),
            ErrorKind::UnknownRank
        );
        assert!(group.remove_rank(2).is_err());
        assert_eq!(group.version(), 3);

        assert_eq!(
            *events.lock(),
            vec![
                ("g".to_string(), 7, GroupEvent::RankAdded),
                ("g".to_string(), 7, GroupEvent::RankRemoved),
            ]
        );
        Ok(())
    }

    #[test]
    fn size_limit() -> Result<(), CartwrightError> {
        assert!(Group::new("g", None, vec![0, 1, 2], 2, 4).is_err());
        let group = Group::new("g", None, vec![0, 1], 2, 4)?;
        assert!(group.add_rank(5, None).is_err());
        assert!(!group.is_service());
        group.set_psr(1, "local://g/1")?;
        assert_eq!(group.psr(), Some(1));
        group.remove_rank(0)?;
        assert_eq!(group.psr(), Some(1));
        group.remove_rank(1)?;
        assert_eq!(group.psr(), None);
        assert_eq!(group.cache().get_uri(1, 0), None);
        Ok(())
    }
}
