use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use super::types::{SumsReply, SumsRequest, Sunum};

/// The storage-management subsystem as seen by the dispatcher.
///
/// Calls may block; the dispatcher runs them off the async runtime.
pub trait SumsService: Send {
    fn handle(&mut self, request: SumsRequest) -> SumsReply;
}

const RETENTION_FILE: &str = ".retention";

/// A directory-backed storage service.
///
/// Each unit is a directory `D<sunum>` under the root. Committing a unit
/// writes its retention policy next to the data.
#[derive(Debug)]
pub struct DirSums {
    root: PathBuf,
    next: u64,
    units: BTreeMap<Sunum, PathBuf>,
}

impl DirSums {
    /// Opens `root`, creating it if missing and picking up units left by
    /// earlier sessions.
    pub fn open(root: impl Into<PathBuf>) -> io::Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;

        let mut units = BTreeMap::new();
        for entry in fs::read_dir(&root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name();
            if let Some(n) = name
                .to_str()
                .and_then(|name| name.strip_prefix('D'))
                .and_then(|n| n.parse::<u64>().ok())
            {
                units.insert(Sunum::new(n), entry.path());
            }
        }
        let next = units.keys().next_back().map_or(1, |last| last.get() + 1);
        tracing::debug!(root = %root.display(), units = units.len(), "opened storage root");

        Ok(Self { root, next, units })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn alloc(&mut self, bytes: u64) -> io::Result<SumsReply> {
        let sunum = Sunum::new(self.next);
        let path = self.root.join(format!("D{sunum}"));
        fs::create_dir(&path)?;
        self.next += 1;
        self.units.insert(sunum, path.clone());
        tracing::debug!(%sunum, bytes, path = %path.display(), "allocated storage unit");
        Ok(SumsReply::Allocated { sunum, path })
    }

    fn put(&mut self, sunum: Sunum, retention_days: u32, archive: bool) -> io::Result<SumsReply> {
        let Some(path) = self.units.get(&sunum) else {
            return Ok(SumsReply::Failed {
                reason: format!("unknown storage unit {sunum}"),
            });
        };
        fs::write(
            path.join(RETENTION_FILE),
            format!("retention_days={retention_days}\narchive={archive}\n"),
        )?;
        tracing::debug!(%sunum, retention_days, archive, "committed storage unit");
        Ok(SumsReply::Stored { sunum })
    }

    fn get(&self, sunums: Vec<Sunum>) -> SumsReply {
        let units = sunums
            .into_iter()
            .map(|sunum| (sunum, self.units.get(&sunum).filter(|p| p.is_dir()).cloned()))
            .collect();
        SumsReply::Located { units }
    }
}

impl SumsService for DirSums {
    fn handle(&mut self, request: SumsRequest) -> SumsReply {
        let result = match request {
            SumsRequest::Alloc { bytes } => self.alloc(bytes),
            SumsRequest::Put {
                sunum,
                retention_days,
                archive,
            } => self.put(sunum, retention_days, archive),
            // Units are always online here, so retrieval is a lookup.
            SumsRequest::Get { sunums, .. } => Ok(self.get(sunums)),
            SumsRequest::Shutdown => Ok(SumsReply::Failed {
                reason: "shutdown is handled by the dispatcher".to_string(),
            }),
        };
        result.unwrap_or_else(|e| SumsReply::Failed {
            reason: e.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_put_get() {
        let dir = tempfile::tempdir().unwrap();
        let mut sums = DirSums::open(dir.path()).unwrap();

        let SumsReply::Allocated { sunum, path } = sums.handle(SumsRequest::Alloc { bytes: 1024 })
        else {
            panic!("expected an allocation");
        };
        assert_eq!(sunum, Sunum::new(1));
        assert!(path.is_dir());

        let reply = sums.handle(SumsRequest::Put {
            sunum,
            retention_days: 7,
            archive: true,
        });
        assert_eq!(reply, SumsReply::Stored { sunum });
        let policy = fs::read_to_string(path.join(RETENTION_FILE)).unwrap();
        assert_eq!(policy, "retention_days=7\narchive=true\n");

        let reply = sums.handle(SumsRequest::Get {
            sunums: vec![sunum, Sunum::new(99)],
            retrieve: true,
        });
        assert_eq!(
            reply,
            SumsReply::Located {
                units: vec![(sunum, Some(path)), (Sunum::new(99), None)]
            }
        );
    }

    #[test]
    fn test_put_unknown_unit_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut sums = DirSums::open(dir.path()).unwrap();
        let reply = sums.handle(SumsRequest::Put {
            sunum: Sunum::new(5),
            retention_days: 1,
            archive: false,
        });
        assert!(matches!(reply, SumsReply::Failed { .. }));
    }

    #[test]
    fn test_reopen_continues_numbering() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut sums = DirSums::open(dir.path()).unwrap();
            sums.handle(SumsRequest::Alloc { bytes: 0 });
            sums.handle(SumsRequest::Alloc { bytes: 0 });
        }
        let mut sums = DirSums::open(dir.path()).unwrap();
        let reply = sums.handle(SumsRequest::Alloc { bytes: 0 });
        assert!(matches!(reply, SumsReply::Allocated { sunum, .. } if sunum == Sunum::new(3)));
    }
}
