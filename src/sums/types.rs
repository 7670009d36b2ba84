use std::fmt;
use std::path::PathBuf;

/// Storage unit number assigned by SUMS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Sunum(u64);

impl Sunum {
    pub const fn new(n: u64) -> Self {
        Self(n)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Sunum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What a storage unit holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitKind {
    /// Data written by client modules.
    Data,
    /// The session's own log.
    Log,
}

/// A storage unit allocated during the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageUnit {
    pub sunum: Sunum,
    pub path: PathBuf,
    pub kind: UnitKind,
}

/// A request to the storage-management subsystem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SumsRequest {
    /// Allocate a new storage unit of roughly `bytes` bytes.
    Alloc { bytes: u64 },
    /// Locate existing units, staging them online when `retrieve` is set.
    Get { sunums: Vec<Sunum>, retrieve: bool },
    /// Commit a unit with the session's retention and archive policy.
    Put {
        sunum: Sunum,
        retention_days: u32,
        archive: bool,
    },
    /// Stop the dispatcher after every earlier request has been answered.
    Shutdown,
}

/// A reply from the storage-management subsystem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SumsReply {
    Allocated { sunum: Sunum, path: PathBuf },
    /// One entry per requested unit; `None` when the unit is unknown.
    Located { units: Vec<(Sunum, Option<PathBuf>)> },
    Stored { sunum: Sunum },
    Failed { reason: String },
}
