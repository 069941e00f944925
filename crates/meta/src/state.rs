//! The in-memory metadata state and the changelog operations that mutate it.

use std::io::{self, Read, Write};

use crate::sections::{
    AclTable, ChunkInfo, ChunkTable, EdgeTable, FlockTable, FreeTable, Node, NodeKind, NodeTable,
    OpenFileTable, PosixLockTable, QuotaTable, ServerTable, SessionTable, StorageClassTable,
    XattrTable, Edge,
};

/// One image section, in canonical write order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectionId {
    Sessions,
    StorageClasses,
    Nodes,
    Edges,
    Free,
    Quotas,
    Xattrs,
    Acls,
    OpenFiles,
    FlockLocks,
    PosixLocks,
    Servers,
    Chunks,
}

impl SectionId {
    pub const WRITE_ORDER: [SectionId; 13] = [
        SectionId::Sessions,
        SectionId::StorageClasses,
        SectionId::Nodes,
        SectionId::Edges,
        SectionId::Free,
        SectionId::Quotas,
        SectionId::Xattrs,
        SectionId::Acls,
        SectionId::OpenFiles,
        SectionId::FlockLocks,
        SectionId::PosixLocks,
        SectionId::Servers,
        SectionId::Chunks,
    ];

    pub fn tag(self) -> [u8; 4] {
        match self {
            Self::Sessions => *b"SESS",
            Self::StorageClasses => *b"SCLA",
            Self::Nodes => *b"NODE",
            Self::Edges => *b"EDGE",
            Self::Free => *b"FREE",
            Self::Quotas => *b"QUOT",
            Self::Xattrs => *b"XATR",
            Self::Acls => *b"PACL",
            Self::OpenFiles => *b"OPEN",
            Self::FlockLocks => *b"FLCK",
            Self::PosixLocks => *b"PLCK",
            Self::Servers => *b"CSDB",
            Self::Chunks => *b"CHNK",
        }
    }

    /// Tag lookup; `LABS` is the historical alias of `SCLA`.
    pub fn from_tag(tag: &[u8; 4]) -> Option<Self> {
        match tag {
            b"SESS" => Some(Self::Sessions),
            b"SCLA" | b"LABS" => Some(Self::StorageClasses),
            b"NODE" => Some(Self::Nodes),
            b"EDGE" => Some(Self::Edges),
            b"FREE" => Some(Self::Free),
            b"QUOT" => Some(Self::Quotas),
            b"XATR" => Some(Self::Xattrs),
            b"PACL" => Some(Self::Acls),
            b"OPEN" => Some(Self::OpenFiles),
            b"FLCK" => Some(Self::FlockLocks),
            b"PLCK" => Some(Self::PosixLocks),
            b"CSDB" => Some(Self::Servers),
            b"CHNK" => Some(Self::Chunks),
            _ => None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ApplyError {
    #[error("can't parse changelog entry: {0}")]
    Parse(String),
    #[error("changelog entry conflicts with current state: {0}")]
    Conflict(String),
}

/// The whole serialized filesystem state.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetaState {
    /// Monotonically increasing logical clock of metadata mutations.
    pub version: u64,
    /// Cluster incarnation id; zero on images that never saved.
    pub id: u64,
    pub sessions: SessionTable,
    pub storage_classes: StorageClassTable,
    pub nodes: NodeTable,
    pub edges: EdgeTable,
    pub free: FreeTable,
    pub quotas: QuotaTable,
    pub xattrs: XattrTable,
    pub acls: AclTable,
    pub open_files: OpenFileTable,
    pub flock_locks: FlockTable,
    pub posix_locks: PosixLockTable,
    pub servers: ServerTable,
    pub chunks: ChunkTable,
}

impl MetaState {
    /// Blank bootstrap state, as produced by a `MFSM NEW` image.
    pub fn new() -> Self {
        Self {
            version: 1,
            ..Self::default()
        }
    }

    /// Storage format version of a section as written by this build.
    pub fn section_version(&self, section: SectionId) -> u8 {
        match section {
            SectionId::Sessions => SessionTable::STORE_VERSION,
            SectionId::StorageClasses => StorageClassTable::STORE_VERSION,
            SectionId::Nodes => NodeTable::STORE_VERSION,
            SectionId::Edges => EdgeTable::STORE_VERSION,
            SectionId::Free => FreeTable::STORE_VERSION,
            SectionId::Quotas => QuotaTable::STORE_VERSION,
            SectionId::Xattrs => XattrTable::STORE_VERSION,
            SectionId::Acls => AclTable::STORE_VERSION,
            SectionId::OpenFiles => OpenFileTable::STORE_VERSION,
            SectionId::FlockLocks => FlockTable::STORE_VERSION,
            SectionId::PosixLocks => PosixLockTable::STORE_VERSION,
            SectionId::Servers => ServerTable::STORE_VERSION,
            SectionId::Chunks => ChunkTable::STORE_VERSION,
        }
    }

    pub fn store_section<W: Write>(&self, section: SectionId, w: &mut W) -> io::Result<()> {
        match section {
            SectionId::Sessions => self.sessions.store(w),
            SectionId::StorageClasses => self.storage_classes.store(w),
            SectionId::Nodes => self.nodes.store(w),
            SectionId::Edges => self.edges.store(w),
            SectionId::Free => self.free.store(w),
            SectionId::Quotas => self.quotas.store(w),
            SectionId::Xattrs => self.xattrs.store(w),
            SectionId::Acls => self.acls.store(w),
            SectionId::OpenFiles => self.open_files.store(w),
            SectionId::FlockLocks => self.flock_locks.store(w),
            SectionId::PosixLocks => self.posix_locks.store(w),
            SectionId::Servers => self.servers.store(w),
            SectionId::Chunks => self.chunks.store(w),
        }
    }

    pub fn load_section<R: Read>(
        &mut self,
        section: SectionId,
        r: &mut R,
        mver: u8,
    ) -> io::Result<()> {
        match section {
            SectionId::Sessions => self.sessions = SessionTable::load(r, mver)?,
            SectionId::StorageClasses => self.storage_classes = StorageClassTable::load(r, mver)?,
            SectionId::Nodes => self.nodes = NodeTable::load(r, mver)?,
            SectionId::Edges => self.edges = EdgeTable::load(r, mver)?,
            SectionId::Free => self.free = FreeTable::load(r, mver)?,
            SectionId::Quotas => self.quotas = QuotaTable::load(r, mver)?,
            SectionId::Xattrs => self.xattrs = XattrTable::load(r, mver)?,
            SectionId::Acls => self.acls = AclTable::load(r, mver)?,
            SectionId::OpenFiles => self.open_files = OpenFileTable::load(r, mver)?,
            SectionId::FlockLocks => self.flock_locks = FlockTable::load(r, mver)?,
            SectionId::PosixLocks => self.posix_locks = PosixLockTable::load(r, mver)?,
            SectionId::Servers => self.servers = ServerTable::load(r, mver)?,
            SectionId::Chunks => self.chunks = ChunkTable::load(r, mver)?,
        }
        Ok(())
    }

    /// Accept a replicated metaid assignment iff the current id is zero or
    /// already equal.
    pub fn set_meta_id(&mut self, new_id: u64) -> bool {
        if self.id == 0 || self.id == new_id {
            self.version += 1;
            self.id = new_id;
            true
        } else {
            false
        }
    }

    /// Apply one changelog entry carrying logversion `version`; on success
    /// the state's version advances past it.
    pub fn apply(&mut self, version: u64, entry: &str) -> Result<(), ApplyError> {
        let (name, args) = split_entry(entry)?;
        match name {
            "SETMETAID" => {
                let new_id = parse_arg::<u64>(&args, 0, entry)?;
                if self.id != 0 && self.id != new_id {
                    return Err(ApplyError::Conflict(format!(
                        "metaid is {:#X}, entry wants {new_id:#X}",
                        self.id
                    )));
                }
                self.id = new_id;
            }
            "CREATE" => {
                let parent = parse_arg::<u32>(&args, 0, entry)?;
                let inode = parse_arg::<u32>(&args, 1, entry)?;
                let name = arg_str(&args, 2, entry)?;
                self.nodes.insert(Node {
                    inode,
                    kind: NodeKind::File,
                    mode: 0o644,
                    uid: 0,
                    gid: 0,
                    atime: 0,
                    mtime: 0,
                    ctime: 0,
                    length: 0,
                    chunks: Vec::new(),
                });
                self.edges.edges.push(Edge {
                    parent,
                    child: inode,
                    name: name.to_string(),
                });
            }
            "UNLINK" => {
                let parent = parse_arg::<u32>(&args, 0, entry)?;
                let inode = parse_arg::<u32>(&args, 1, entry)?;
                let name = arg_str(&args, 2, entry)?;
                self.edges
                    .edges
                    .retain(|edge| !(edge.parent == parent && edge.child == inode && edge.name == name));
                self.nodes.remove(inode);
            }
            "LENGTH" => {
                let inode = parse_arg::<u32>(&args, 0, entry)?;
                let length = parse_arg::<u64>(&args, 1, entry)?;
                match self.nodes.get_mut(inode) {
                    Some(node) => node.length = length,
                    None => {
                        return Err(ApplyError::Conflict(format!("no such inode {inode}")));
                    }
                }
            }
            "CHUNKADD" => {
                let chunk_id = parse_arg::<u64>(&args, 0, entry)?;
                let chunk_version = parse_arg::<u32>(&args, 1, entry)?;
                self.chunks.insert(
                    chunk_id,
                    ChunkInfo {
                        version: chunk_version,
                        archived: false,
                    },
                );
            }
            "CHUNKDEL" => {
                let chunk_id = parse_arg::<u64>(&args, 0, entry)?;
                self.chunks.remove(chunk_id);
            }
            "FREE" => {
                let inode = parse_arg::<u32>(&args, 0, entry)?;
                let ftime = parse_arg::<u32>(&args, 1, entry)?;
                self.free.entries.push((inode, ftime));
            }
            other => {
                return Err(ApplyError::Parse(format!("unknown operation {other}")));
            }
        }
        self.version = version + 1;
        Ok(())
    }
}

fn split_entry(entry: &str) -> Result<(&str, Vec<&str>), ApplyError> {
    let open = entry
        .find('(')
        .ok_or_else(|| ApplyError::Parse(entry.to_string()))?;
    let close = entry
        .rfind(')')
        .filter(|close| *close > open)
        .ok_or_else(|| ApplyError::Parse(entry.to_string()))?;
    let name = &entry[..open];
    let inner = &entry[open + 1..close];
    let args = if inner.is_empty() {
        Vec::new()
    } else {
        inner.split(',').collect()
    };
    Ok((name, args))
}

fn arg_str<'a>(args: &[&'a str], idx: usize, entry: &str) -> Result<&'a str, ApplyError> {
    args.get(idx)
        .copied()
        .ok_or_else(|| ApplyError::Parse(format!("missing argument in {entry}")))
}

fn parse_arg<T: std::str::FromStr>(args: &[&str], idx: usize, entry: &str) -> Result<T, ApplyError> {
    arg_str(args, idx, entry)?
        .parse()
        .map_err(|_| ApplyError::Parse(format!("bad numeric argument in {entry}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apply_create_and_unlink() {
        let mut state = MetaState::new();
        state.apply(1, "CREATE(1,2,notes.txt)").unwrap();
        assert_eq!(state.version, 2);
        assert!(state.nodes.get(2).is_some());
        assert_eq!(state.edges.edges.len(), 1);

        state.apply(2, "LENGTH(2,4096)").unwrap();
        assert_eq!(state.nodes.get(2).unwrap().length, 4096);

        state.apply(3, "UNLINK(1,2,notes.txt)").unwrap();
        assert!(state.nodes.get(2).is_none());
        assert!(state.edges.edges.is_empty());
        assert_eq!(state.version, 4);
    }

    #[test]
    fn apply_rejects_garbage() {
        let mut state = MetaState::new();
        assert!(state.apply(1, "CREATE").is_err());
        assert!(state.apply(1, "NONSENSE(1)").is_err());
        assert!(state.apply(1, "LENGTH(99,1)").is_err());
        // Failed entries never advance the version.
        assert_eq!(state.version, 1);
    }

    #[test]
    fn metaid_assignment_rules() {
        let mut state = MetaState::new();
        assert!(state.set_meta_id(0xAB));
        assert!(state.set_meta_id(0xAB));
        assert!(!state.set_meta_id(0xCD));
        assert_eq!(state.id, 0xAB);

        let mut state = MetaState::new();
        state.apply(1, "SETMETAID(171)").unwrap();
        assert_eq!(state.id, 171);
        assert!(state.apply(2, "SETMETAID(205)").is_err());
    }
}
