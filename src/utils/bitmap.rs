//! Bitmap data structure helper.

use std::fmt;

use crate::utils::{CartwrightError, ErrorKind};

use fixedbitset::FixedBitSet;

/// Compact bitmap for index -> bool mapping, used e.g. to track which
/// children of a collective call have answered.
#[derive(Clone, PartialEq, Eq)]
pub struct Bitmap(FixedBitSet);

impl Bitmap {
    /// Creates a new bitmap of given size. If `ones` is true, all slots are
    /// marked true initially; otherwise, all slots are initially false.
    /// Zero-sized bitmaps are allowed (a leaf in a collective tree has no
    /// children to track).
    pub fn new(size: usize, ones: bool) -> Self {
        let mut bitset = FixedBitSet::with_capacity(size);
        if ones {
            bitset.set_range(.., true);
        }
        Bitmap(bitset)
    }

    /// Creates a new bitmap of given size with the listed indices set.
    pub fn from(
        size: usize,
        ones: impl IntoIterator<Item = usize>,
    ) -> Result<Self, CartwrightError> {
        let mut bitmap = Self::new(size, false);
        for idx in ones {
            bitmap.set(idx, true)?;
        }
        Ok(bitmap)
    }

    /// Sets bit at index to given flag. Returns the previous flag.
    #[inline]
    pub fn set(
        &mut self,
        idx: usize,
        flag: bool,
    ) -> Result<bool, CartwrightError> {
        if idx >= self.0.len() {
            return Err(CartwrightError::new(
                ErrorKind::InvalidArgument,
                format!("index {} out of bound", idx),
            ));
        }
        let old = self.0[idx];
        self.0.set(idx, flag);
        Ok(old)
    }

    /// Gets the bit flag at index.
    #[inline]
    pub fn get(&self, idx: usize) -> Result<bool, CartwrightError> {
        if idx >= self.0.len() {
            return Err(CartwrightError::new(
                ErrorKind::InvalidArgument,
                format!("index {} out of bound", idx),
            ));
        }
        Ok(self.0[idx])
    }

    /// Returns the size of the bitmap.
    #[inline]
    pub fn size(&self) -> usize {
        self.0.len()
    }

    /// Returns the number of trues in the bitmap.
    #[inline]
    pub fn count(&self) -> usize {
        self.0.count_ones(..)
    }

    /// Returns true if every slot is set.
    #[inline]
    pub fn all(&self) -> bool {
        self.count() == self.size()
    }

    /// Allows `for idx in map.ones()`.
    #[inline]
    pub fn ones(&self) -> impl Iterator<Item = usize> + '_ {
        self.0.ones()
    }
}

// Implement `Debug` trait manually for better trace printing.
impl fmt::Debug for Bitmap {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{{{}; [", self.size())?;
        let mut first_idx = true;
        for i in self.ones() {
            if !first_idx {
                write!(f, ", {}", i)?;
            } else {
                write!(f, "{}", i)?;
                first_idx = false;
            }
        }
        write!(f, "]}}")
    }
}
