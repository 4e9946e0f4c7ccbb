//! Database open flags.

/// Flags controlling how a database behaves inside an environment.
///
/// `COUNTED` asks the store to maintain per-subtree entry counts so rank
/// lookups and range counts run in O(log n). `PREFIX_COMPRESSION` changes
/// the leaf key layout only; external behavior is identical.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DatabaseFlags {
    /// Create the database if it does not exist
    pub create: bool,
    /// Keep multiple sorted values per key
    pub dup_sort: bool,
    /// Maintain subtree entry counts for rank translation
    pub counted: bool,
    /// Store leaf keys as shared prefix + suffixes
    pub prefix_compression: bool,
}

impl DatabaseFlags {
    pub const CREATE: DatabaseFlags = DatabaseFlags {
        create: true,
        dup_sort: false,
        counted: false,
        prefix_compression: false,
    };

    pub fn with_dup_sort(mut self) -> Self {
        self.dup_sort = true;
        self
    }

    pub fn with_counted(mut self) -> Self {
        self.counted = true;
        self
    }

    pub fn with_prefix_compression(mut self) -> Self {
        self.prefix_compression = true;
        self
    }
}
