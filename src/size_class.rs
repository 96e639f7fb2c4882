//! Mapping from requested allocation sizes to fixed-width size classes
//!
//! Managed sizes are split into bands of `unit_range` bytes. Band `c` covers
//! sizes `c * unit_range .. (c + 1) * unit_range` and is served by blocks of
//! `(c + 1) * unit_range` bytes, so a block wastes at most `unit_range - 1`
//! bytes of its storage. Sizes at or above `managed_max` are not managed.


/// Index of a size class, in `0..SizeClasses::class_count()`
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct ClassIndex(usize);

impl ClassIndex {
    /// Numerical value of the class index
    pub const fn get(self) -> usize {
        self.0
    }
}


/// Outcome of classifying an allocation request
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SizeClass {
    /// The request is served by the block arrays of this class
    Managed(ClassIndex),

    /// The request is too large and goes to the system allocator
    Unmanaged,
}


/// Size class table, derived from two configuration constants
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SizeClasses {
    /// Exclusive upper bound of managed sizes
    /// - Must be a nonzero multiple of `unit_range`
    managed_max: usize,

    /// Width of a size class band in bytes
    /// - Must be nonzero
    unit_range: usize,
}

impl SizeClasses {
    /// Build a size class table
    ///
    /// # Panics
    ///
    /// If `unit_range` is zero or does not evenly divide a nonzero
    /// `managed_max`. The builder checks these before getting here.
    pub fn new(managed_max: usize, unit_range: usize) -> Self {
        assert!(unit_range != 0, "Size class width must not be zero");
        assert!(managed_max != 0, "Managed size limit must not be zero");
        assert_eq!(managed_max % unit_range, 0,
                   "Managed size limit must be a multiple of size class width");
        Self { managed_max, unit_range }
    }

    /// Exclusive upper bound of the sizes handled by size classes
    pub const fn managed_max(&self) -> usize {
        self.managed_max
    }

    /// Width of every size class band (in bytes)
    pub const fn unit_range(&self) -> usize {
        self.unit_range
    }

    /// Number of size classes
    pub const fn class_count(&self) -> usize {
        self.managed_max / self.unit_range
    }

    /// Classify an allocation request
    ///
    /// Zero-sized requests land in the smallest class.
    pub fn classify(&self, size: usize) -> SizeClass {
        if size >= self.managed_max {
            SizeClass::Unmanaged
        } else {
            SizeClass::Managed(ClassIndex(size / self.unit_range))
        }
    }

    /// Block size of a given class (in bytes)
    pub fn class_size(&self, class: ClassIndex) -> usize {
        debug_assert!(class.0 < self.class_count(),
                      "Size class index is out of range");
        (class.0 + 1) * self.unit_range
    }

    /// Iterate over all size classes, smallest first
    pub fn classes(&self) -> impl Iterator<Item = ClassIndex> + Clone {
        (0..self.class_count()).map(ClassIndex)
    }

    /// Size class with a given index, if it exists
    pub fn class(&self, index: usize) -> Option<ClassIndex> {
        if index < self.class_count() {
            Some(ClassIndex(index))
        } else {
            None
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_geometry() {
        let classes = SizeClasses::new(1024, 16);
        assert_eq!(classes.class_count(), 64);
        assert_eq!(classes.classify(1023), SizeClass::Managed(ClassIndex(63)));
        assert_eq!(classes.class_size(ClassIndex(63)), 1024);
        assert_eq!(classes.classify(1024), SizeClass::Unmanaged);
        assert_eq!(classes.classify(usize::MAX), SizeClass::Unmanaged);
    }

    #[test]
    fn zero_goes_to_smallest_class() {
        let classes = SizeClasses::new(1024, 16);
        assert_eq!(classes.classify(0), SizeClass::Managed(ClassIndex(0)));
        assert_eq!(classes.class_size(ClassIndex(0)), 16);
    }

    #[test]
    fn band_edges() {
        let classes = SizeClasses::new(1024, 16);
        assert_eq!(classes.classify(15), SizeClass::Managed(ClassIndex(0)));
        assert_eq!(classes.classify(16), SizeClass::Managed(ClassIndex(1)));
        assert_eq!(classes.classify(31), SizeClass::Managed(ClassIndex(1)));
        assert_eq!(classes.classify(32), SizeClass::Managed(ClassIndex(2)));
    }

    #[test]
    fn classification_is_total() {
        for &(managed_max, unit_range) in &[(1024, 16), (64, 1), (96, 32), (4096, 4096)] {
            let classes = SizeClasses::new(managed_max, unit_range);
            for size in 0..managed_max {
                match classes.classify(size) {
                    SizeClass::Managed(class) => {
                        assert!(class.get() < classes.class_count());
                        assert!(classes.class_size(class) >= size);
                        assert_eq!(classes.classify(size), SizeClass::Managed(class));
                    }
                    SizeClass::Unmanaged => panic!("{} should be managed", size),
                }
            }
        }
    }

    #[test]
    fn class_lookup() {
        let classes = SizeClasses::new(128, 32);
        assert_eq!(classes.classes().count(), 4);
        assert_eq!(classes.class(3), Some(ClassIndex(3)));
        assert_eq!(classes.class(4), None);
    }

    #[test]
    #[should_panic]
    fn uneven_bands() {
        SizeClasses::new(1000, 16);
    }
}
