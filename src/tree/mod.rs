//! Collective communication tree topology.
//!
//! Every participant of a collective call derives the same tree shape
//! from `(kind, ratio, size, root)` alone. Group ranks are rotated into
//! root-relative tree ranks, the per-kind arithmetic runs on tree ranks,
//! and results are rotated back.

mod flat;
mod kary;
mod knomial;

use std::fmt;
use std::str::FromStr;

use crate::utils::{CartwrightError, ErrorKind};

use serde::{Deserialize, Serialize};

/// Smallest accepted branch ratio.
pub const MIN_BRANCH_RATIO: u32 = 2;

/// Largest accepted branch ratio.
pub const MAX_BRANCH_RATIO: u32 = 64;

/// Shape of a collective tree.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum TreeKind {
    Flat,
    Kary,
    Knomial,
}

impl TreeKind {
    fn code(self) -> u32 {
        match self {
            TreeKind::Flat => 1,
            TreeKind::Kary => 2,
            TreeKind::Knomial => 3,
        }
    }

    fn from_code(code: u32) -> Option<Self> {
        match code {
            1 => Some(TreeKind::Flat),
            2 => Some(TreeKind::Kary),
            3 => Some(TreeKind::Knomial),
            _ => None,
        }
    }
}

impl FromStr for TreeKind {
    type Err = CartwrightError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "flat" => Ok(TreeKind::Flat),
            "kary" => Ok(TreeKind::Kary),
            "knomial" => Ok(TreeKind::Knomial),
            _ => Err(CartwrightError::new(
                ErrorKind::InvalidArgument,
                format!("unrecognized tree kind '{}'", s),
            )),
        }
    }
}

/// Validated tree kind plus branch ratio. Flat trees carry ratio 0.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
pub struct TreeTopo {
    kind: TreeKind,
    ratio: u32,
}

impl TreeTopo {
    /// Creates a topology with the ratio checked against the default
    /// bounds.
    pub fn new(kind: TreeKind, ratio: u32) -> Result<Self, CartwrightError> {
        Self::bounded(kind, ratio, MIN_BRANCH_RATIO, MAX_BRANCH_RATIO)
    }

    /// Creates a topology with the ratio checked against given bounds.
    pub fn bounded(
        kind: TreeKind,
        ratio: u32,
        min_ratio: u32,
        max_ratio: u32,
    ) -> Result<Self, CartwrightError> {
        if kind == TreeKind::Flat {
            return Ok(TreeTopo { kind, ratio: 0 });
        }
        if ratio < min_ratio.max(2) || ratio > max_ratio {
            return Err(CartwrightError::new(
                ErrorKind::InvalidArgument,
                format!(
                    "branch ratio {} out of range [{}, {}]",
                    ratio, min_ratio, max_ratio
                ),
            ));
        }
        Ok(TreeTopo { kind, ratio })
    }

    #[inline]
    pub fn kind(&self) -> TreeKind {
        self.kind
    }

    #[inline]
    pub fn ratio(&self) -> u32 {
        self.ratio
    }

    /// Packs into `(kind << 16) | ratio`.
    pub fn encode(&self) -> u32 {
        (self.kind.code() << 16) | (self.ratio & 0xFFFF)
    }

    /// Unpacks from `(kind << 16) | ratio`.
    pub fn decode(code: u32) -> Result<Self, CartwrightError> {
        let kind = TreeKind::from_code(code >> 16).ok_or_else(|| {
            CartwrightError::new(
                ErrorKind::InvalidArgument,
                format!("invalid tree topo code {:#x}", code),
            )
        })?;
        Self::new(kind, code & 0xFFFF)
    }
}

impl fmt::Display for TreeTopo {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.kind {
            TreeKind::Flat => write!(f, "flat"),
            TreeKind::Kary => write!(f, "{}-ary", self.ratio),
            TreeKind::Knomial => write!(f, "{}-nomial", self.ratio),
        }
    }
}

/// One participant's view of a collective tree over ranks `0..size`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeDescriptor {
    /// Tree shape.
    topo: TreeTopo,

    /// Number of ranks in the tree.
    size: u32,

    /// Root rank.
    root: u32,

    /// Rank of the participant this descriptor describes.
    me: u32,
}

impl TreeDescriptor {
    /// Creates a descriptor, checking that `root` and `me` are within the
    /// group.
    pub fn new(
        topo: TreeTopo,
        size: u32,
        root: u32,
        me: u32,
    ) -> Result<Self, CartwrightError> {
        if size == 0 || root >= size || me >= size {
            return Err(CartwrightError::new(
                ErrorKind::InvalidArgument,
                format!(
                    "invalid tree: size {} root {} self {}",
                    size, root, me
                ),
            ));
        }
        Ok(TreeDescriptor {
            topo,
            size,
            root,
            me,
        })
    }

    /// Same tree viewed from another participant.
    pub fn with_self(&self, me: u32) -> Result<Self, CartwrightError> {
        Self::new(self.topo, self.size, self.root, me)
    }

    #[inline]
    pub fn size(&self) -> u32 {
        self.size
    }

    #[inline]
    pub fn root(&self) -> u32 {
        self.root
    }

    #[inline]
    pub fn is_root(&self) -> bool {
        self.me == self.root
    }

    #[inline]
    fn to_tree(&self, rank: u32) -> u32 {
        ((rank as u64 + self.size as u64 - self.root as u64)
            % self.size as u64) as u32
    }

    #[inline]
    fn to_group(&self, tree_rank: u32) -> u32 {
        ((tree_rank as u64 + self.root as u64) % self.size as u64) as u32
    }

    /// Children of self, as group ranks.
    pub fn children(&self) -> Vec<u32> {
        let tr = self.to_tree(self.me);
        let kids = match self.topo.kind {
            TreeKind::Flat => flat::children(tr, self.size),
            TreeKind::Kary => kary::children(tr, self.size, self.topo.ratio),
            TreeKind::Knomial => {
                knomial::children(tr, self.size, self.topo.ratio)
            }
        };
        kids.into_iter().map(|c| self.to_group(c)).collect()
    }

    /// Number of children of self.
    pub fn child_count(&self) -> u32 {
        self.children().len() as u32
    }

    /// Parent of self, as a group rank. The root has none.
    pub fn parent(&self) -> Result<u32, CartwrightError> {
        let tr = self.to_tree(self.me);
        if tr == 0 {
            return Err(CartwrightError::new(
                ErrorKind::NoParent,
                format!("rank {} is the tree root", self.me),
            ));
        }
        let parent = match self.topo.kind {
            TreeKind::Flat => flat::parent(tr),
            TreeKind::Kary => kary::parent(tr, self.topo.ratio),
            TreeKind::Knomial => knomial::parent(tr, self.topo.ratio),
        };
        Ok(self.to_group(parent))
    }
}

#[cfg(test)]
mod tree_tests {
    use super::*;

    fn check_coverage(topo: TreeTopo, size: u32, root: u32) {
        let mut seen = vec![0u32; size as usize];
        let mut frontier = vec![root];
        seen[root as usize] += 1;
        while let Some(rank) = frontier.pop() {
            let desc = TreeDescriptor::new(topo, size, root, rank).unwrap();
            for child in desc.children() {
                assert!(child < size);
                seen[child as usize] += 1;
                let cdesc = desc.with_self(child).unwrap();
                assert_eq!(cdesc.parent().unwrap(), rank);
                frontier.push(child);
            }
        }
        assert!(
            seen.iter().all(|&c| c == 1),
            "{} size {} root {}: {:?}",
            topo,
            size,
            root,
            seen
        );
    }

    #[test]
    fn kary_five_ranks() -> Result<(), CartwrightError> {
        let topo = TreeTopo::new(TreeKind::Kary, 2)?;
        let desc = TreeDescriptor::new(topo, 5, 0, 0)?;
        assert_eq!(desc.children(), vec![1, 2]);
        assert_eq!(desc.with_self(1)?.children(), vec![3, 4]);
        for leaf in 2..5 {
            assert_eq!(desc.with_self(leaf)?.child_count(), 0);
        }
        assert_eq!(desc.with_self(3)?.parent()?, 1);
        assert_eq!(desc.parent().unwrap_err().kind(), ErrorKind::NoParent);
        Ok(())
    }

    #[test]
    fn rotation_by_root() -> Result<(), CartwrightError> {
        let topo = TreeTopo::new(TreeKind::Kary, 2)?;
        let desc = TreeDescriptor::new(topo, 5, 3, 3)?;
        assert_eq!(desc.children(), vec![4, 0]);
        assert_eq!(desc.with_self(4)?.children(), vec![1, 2]);
        assert_eq!(desc.with_self(2)?.parent()?, 4);
        Ok(())
    }

    #[test]
    fn full_coverage() -> Result<(), CartwrightError> {
        for ratio in 2..=8 {
            let topos = [
                TreeTopo::new(TreeKind::Kary, ratio)?,
                TreeTopo::new(TreeKind::Knomial, ratio)?,
            ];
            for topo in topos {
                for size in 1..=256 {
                    for root in 0..size {
                        check_coverage(topo, size, root);
                    }
                }
            }
        }
        let flat = TreeTopo::new(TreeKind::Flat, 0)?;
        for size in 1..=64 {
            for root in 0..size {
                check_coverage(flat, size, root);
            }
        }
        Ok(())
    }

    #[test]
    fn single_rank_tree() -> Result<(), CartwrightError> {
        let topo = TreeTopo::new(TreeKind::Knomial, 4)?;
        let desc = TreeDescriptor::new(topo, 1, 0, 0)?;
        assert!(desc.children().is_empty());
        assert!(desc.parent().is_err());
        Ok(())
    }

    #[test]
    fn topo_encoding() -> Result<(), CartwrightError> {
        let topo = TreeTopo::new(TreeKind::Knomial, 8)?;
        assert_eq!(topo.encode(), (3 << 16) | 8);
        assert_eq!(TreeTopo::decode(topo.encode())?, topo);
        assert!(TreeTopo::decode(0x0005_0002).is_err());
        assert!(TreeTopo::new(TreeKind::Kary, 1).is_err());
        assert!(TreeTopo::new(TreeKind::Kary, 65).is_err());
        assert!(TreeTopo::bounded(TreeKind::Kary, 16, 2, 8).is_err());
        assert_eq!("KARY".parse::<TreeKind>()?, TreeKind::Kary);
        Ok(())
    }

    #[test]
    fn invalid_descriptor() -> Result<(), CartwrightError> {
        let topo = TreeTopo::new(TreeKind::Kary, 2)?;
        assert!(TreeDescriptor::new(topo, 0, 0, 0).is_err());
        assert!(TreeDescriptor::new(topo, 4, 4, 0).is_err());
        assert!(TreeDescriptor::new(topo, 4, 0, 9).is_err());
        Ok(())
    }
}
