//! Typed stores behind each image section.
//!
//! Every table owns its record codec (big-endian, count-prefixed) and a
//! storage version; the framing around them lives in `image`.

use std::collections::BTreeMap;
use std::io::{self, Read, Write};

use crate::wire::{
    get_blob, get_str, get_u8, get_u16, get_u32, get_u64, put_blob, put_str, put_u8, put_u16,
    put_u32, put_u64,
};

fn bad_record(what: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, format!("bad {what} record"))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub id: u32,
    pub ip: u32,
    pub open_since: u32,
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionTable {
    pub sessions: Vec<Session>,
    pub next_session_id: u32,
}

impl SessionTable {
    pub const STORE_VERSION: u8 = 0x10;

    pub fn store<W: Write>(&self, w: &mut W) -> io::Result<()> {
        put_u32(w, self.next_session_id)?;
        put_u32(w, self.sessions.len() as u32)?;
        for session in &self.sessions {
            put_u32(w, session.id)?;
            put_u32(w, session.ip)?;
            put_u32(w, session.open_since)?;
            put_str(w, &session.name)?;
        }
        Ok(())
    }

    pub fn load<R: Read>(r: &mut R, _mver: u8) -> io::Result<Self> {
        let next_session_id = get_u32(r)?;
        let count = get_u32(r)?;
        let mut sessions = Vec::with_capacity(count as usize);
        for _ in 0..count {
            sessions.push(Session {
                id: get_u32(r)?,
                ip: get_u32(r)?,
                open_since: get_u32(r)?,
                name: get_str(r)?,
            });
        }
        Ok(Self {
            sessions,
            next_session_id,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageClass {
    pub id: u8,
    pub copies: u8,
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StorageClassTable {
    pub classes: Vec<StorageClass>,
}

impl StorageClassTable {
    pub const STORE_VERSION: u8 = 0x10;

    pub fn store<W: Write>(&self, w: &mut W) -> io::Result<()> {
        put_u32(w, self.classes.len() as u32)?;
        for class in &self.classes {
            put_u8(w, class.id)?;
            put_u8(w, class.copies)?;
            put_str(w, &class.name)?;
        }
        Ok(())
    }

    pub fn load<R: Read>(r: &mut R, _mver: u8) -> io::Result<Self> {
        let count = get_u32(r)?;
        let mut classes = Vec::with_capacity(count as usize);
        for _ in 0..count {
            classes.push(StorageClass {
                id: get_u8(r)?,
                copies: get_u8(r)?,
                name: get_str(r)?,
            });
        }
        Ok(Self { classes })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum NodeKind {
    File = 0,
    Directory = 1,
    Symlink = 2,
}

impl NodeKind {
    fn from_byte(raw: u8) -> io::Result<Self> {
        match raw {
            0 => Ok(Self::File),
            1 => Ok(Self::Directory),
            2 => Ok(Self::Symlink),
            _ => Err(bad_record("node kind")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub inode: u32,
    pub kind: NodeKind,
    pub mode: u16,
    pub uid: u32,
    pub gid: u32,
    pub atime: u32,
    pub mtime: u32,
    pub ctime: u32,
    pub length: u64,
    pub chunks: Vec<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeTable {
    nodes: BTreeMap<u32, Node>,
}

impl NodeTable {
    pub const STORE_VERSION: u8 = 0x10;

    pub fn insert(&mut self, node: Node) {
        self.nodes.insert(node.inode, node);
    }

    pub fn remove(&mut self, inode: u32) -> Option<Node> {
        self.nodes.remove(&inode)
    }

    pub fn get_mut(&mut self, inode: u32) -> Option<&mut Node> {
        self.nodes.get_mut(&inode)
    }

    pub fn get(&self, inode: u32) -> Option<&Node> {
        self.nodes.get(&inode)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn store<W: Write>(&self, w: &mut W) -> io::Result<()> {
        put_u32(w, self.nodes.len() as u32)?;
        for node in self.nodes.values() {
            put_u32(w, node.inode)?;
            put_u8(w, node.kind as u8)?;
            put_u16(w, node.mode)?;
            put_u32(w, node.uid)?;
            put_u32(w, node.gid)?;
            put_u32(w, node.atime)?;
            put_u32(w, node.mtime)?;
            put_u32(w, node.ctime)?;
            put_u64(w, node.length)?;
            put_u32(w, node.chunks.len() as u32)?;
            for chunk in &node.chunks {
                put_u64(w, *chunk)?;
            }
        }
        Ok(())
    }

    pub fn load<R: Read>(r: &mut R, _mver: u8) -> io::Result<Self> {
        let count = get_u32(r)?;
        let mut nodes = BTreeMap::new();
        for _ in 0..count {
            let inode = get_u32(r)?;
            let kind = NodeKind::from_byte(get_u8(r)?)?;
            let mode = get_u16(r)?;
            let uid = get_u32(r)?;
            let gid = get_u32(r)?;
            let atime = get_u32(r)?;
            let mtime = get_u32(r)?;
            let ctime = get_u32(r)?;
            let length = get_u64(r)?;
            let chunk_count = get_u32(r)?;
            let mut chunks = Vec::with_capacity(chunk_count as usize);
            for _ in 0..chunk_count {
                chunks.push(get_u64(r)?);
            }
            nodes.insert(
                inode,
                Node {
                    inode,
                    kind,
                    mode,
                    uid,
                    gid,
                    atime,
                    mtime,
                    ctime,
                    length,
                    chunks,
                },
            );
        }
        Ok(Self { nodes })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Edge {
    pub parent: u32,
    pub child: u32,
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EdgeTable {
    pub edges: Vec<Edge>,
}

impl EdgeTable {
    pub const STORE_VERSION: u8 = 0x10;

    pub fn store<W: Write>(&self, w: &mut W) -> io::Result<()> {
        put_u32(w, self.edges.len() as u32)?;
        for edge in &self.edges {
            put_u32(w, edge.parent)?;
            put_u32(w, edge.child)?;
            put_str(w, &edge.name)?;
        }
        Ok(())
    }

    pub fn load<R: Read>(r: &mut R, _mver: u8) -> io::Result<Self> {
        let count = get_u32(r)?;
        let mut edges = Vec::with_capacity(count as usize);
        for _ in 0..count {
            edges.push(Edge {
                parent: get_u32(r)?,
                child: get_u32(r)?,
                name: get_str(r)?,
            });
        }
        Ok(Self { edges })
    }
}

/// Deleted inodes waiting for final reclamation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FreeTable {
    pub entries: Vec<(u32, u32)>,
}

impl FreeTable {
    pub const STORE_VERSION: u8 = 0x10;

    pub fn store<W: Write>(&self, w: &mut W) -> io::Result<()> {
        put_u32(w, self.entries.len() as u32)?;
        for (inode, ftime) in &self.entries {
            put_u32(w, *inode)?;
            put_u32(w, *ftime)?;
        }
        Ok(())
    }

    pub fn load<R: Read>(r: &mut R, _mver: u8) -> io::Result<Self> {
        let count = get_u32(r)?;
        let mut entries = Vec::with_capacity(count as usize);
        for _ in 0..count {
            entries.push((get_u32(r)?, get_u32(r)?));
        }
        Ok(Self { entries })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Quota {
    pub inode: u32,
    pub flags: u8,
    pub soft_inodes: u32,
    pub soft_length: u64,
    pub soft_size: u64,
    pub hard_inodes: u32,
    pub hard_length: u64,
    pub hard_size: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QuotaTable {
    pub quotas: Vec<Quota>,
}

impl QuotaTable {
    pub const STORE_VERSION: u8 = 0x10;

    pub fn store<W: Write>(&self, w: &mut W) -> io::Result<()> {
        put_u32(w, self.quotas.len() as u32)?;
        for quota in &self.quotas {
            put_u32(w, quota.inode)?;
            put_u8(w, quota.flags)?;
            put_u32(w, quota.soft_inodes)?;
            put_u64(w, quota.soft_length)?;
            put_u64(w, quota.soft_size)?;
            put_u32(w, quota.hard_inodes)?;
            put_u64(w, quota.hard_length)?;
            put_u64(w, quota.hard_size)?;
        }
        Ok(())
    }

    pub fn load<R: Read>(r: &mut R, _mver: u8) -> io::Result<Self> {
        let count = get_u32(r)?;
        let mut quotas = Vec::with_capacity(count as usize);
        for _ in 0..count {
            quotas.push(Quota {
                inode: get_u32(r)?,
                flags: get_u8(r)?,
                soft_inodes: get_u32(r)?,
                soft_length: get_u64(r)?,
                soft_size: get_u64(r)?,
                hard_inodes: get_u32(r)?,
                hard_length: get_u64(r)?,
                hard_size: get_u64(r)?,
            });
        }
        Ok(Self { quotas })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Xattr {
    pub inode: u32,
    pub name: String,
    pub value: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct XattrTable {
    pub entries: Vec<Xattr>,
}

impl XattrTable {
    pub const STORE_VERSION: u8 = 0x10;

    pub fn store<W: Write>(&self, w: &mut W) -> io::Result<()> {
        put_u32(w, self.entries.len() as u32)?;
        for entry in &self.entries {
            put_u32(w, entry.inode)?;
            put_str(w, &entry.name)?;
            put_blob(w, &entry.value)?;
        }
        Ok(())
    }

    pub fn load<R: Read>(r: &mut R, _mver: u8) -> io::Result<Self> {
        let count = get_u32(r)?;
        let mut entries = Vec::with_capacity(count as usize);
        for _ in 0..count {
            entries.push(Xattr {
                inode: get_u32(r)?,
                name: get_str(r)?,
                value: get_blob(r)?,
            });
        }
        Ok(Self { entries })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Acl {
    pub inode: u32,
    pub acl_type: u8,
    pub user_perm: u16,
    pub group_perm: u16,
    pub other_perm: u16,
    pub mask: u16,
    pub named: Vec<(u32, u16)>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AclTable {
    pub entries: Vec<Acl>,
}

impl AclTable {
    pub const STORE_VERSION: u8 = 0x10;

    pub fn store<W: Write>(&self, w: &mut W) -> io::Result<()> {
        put_u32(w, self.entries.len() as u32)?;
        for acl in &self.entries {
            put_u32(w, acl.inode)?;
            put_u8(w, acl.acl_type)?;
            put_u16(w, acl.user_perm)?;
            put_u16(w, acl.group_perm)?;
            put_u16(w, acl.other_perm)?;
            put_u16(w, acl.mask)?;
            put_u32(w, acl.named.len() as u32)?;
            for (id, perm) in &acl.named {
                put_u32(w, *id)?;
                put_u16(w, *perm)?;
            }
        }
        Ok(())
    }

    pub fn load<R: Read>(r: &mut R, _mver: u8) -> io::Result<Self> {
        let count = get_u32(r)?;
        let mut entries = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let inode = get_u32(r)?;
            let acl_type = get_u8(r)?;
            let user_perm = get_u16(r)?;
            let group_perm = get_u16(r)?;
            let other_perm = get_u16(r)?;
            let mask = get_u16(r)?;
            let named_count = get_u32(r)?;
            let mut named = Vec::with_capacity(named_count as usize);
            for _ in 0..named_count {
                named.push((get_u32(r)?, get_u16(r)?));
            }
            entries.push(Acl {
                inode,
                acl_type,
                user_perm,
                group_perm,
                other_perm,
                mask,
                named,
            });
        }
        Ok(Self { entries })
    }
}

/// `(session, inode)` pairs of files held open by clients.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OpenFileTable {
    pub entries: Vec<(u32, u32)>,
}

impl OpenFileTable {
    pub const STORE_VERSION: u8 = 0x10;

    pub fn store<W: Write>(&self, w: &mut W) -> io::Result<()> {
        put_u32(w, self.entries.len() as u32)?;
        for (session, inode) in &self.entries {
            put_u32(w, *session)?;
            put_u32(w, *inode)?;
        }
        Ok(())
    }

    pub fn load<R: Read>(r: &mut R, _mver: u8) -> io::Result<Self> {
        let count = get_u32(r)?;
        let mut entries = Vec::with_capacity(count as usize);
        for _ in 0..count {
            entries.push((get_u32(r)?, get_u32(r)?));
        }
        Ok(Self { entries })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlockEntry {
    pub inode: u32,
    pub owner: u64,
    pub session: u32,
    pub shared: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlockTable {
    pub entries: Vec<FlockEntry>,
}

impl FlockTable {
    pub const STORE_VERSION: u8 = 0x10;

    pub fn store<W: Write>(&self, w: &mut W) -> io::Result<()> {
        put_u32(w, self.entries.len() as u32)?;
        for entry in &self.entries {
            put_u32(w, entry.inode)?;
            put_u64(w, entry.owner)?;
            put_u32(w, entry.session)?;
            put_u8(w, u8::from(entry.shared))?;
        }
        Ok(())
    }

    pub fn load<R: Read>(r: &mut R, _mver: u8) -> io::Result<Self> {
        let count = get_u32(r)?;
        let mut entries = Vec::with_capacity(count as usize);
        for _ in 0..count {
            entries.push(FlockEntry {
                inode: get_u32(r)?,
                owner: get_u64(r)?,
                session: get_u32(r)?,
                shared: get_u8(r)? != 0,
            });
        }
        Ok(Self { entries })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PosixLockEntry {
    pub inode: u32,
    pub owner: u64,
    pub session: u32,
    pub pid: u32,
    pub start: u64,
    pub end: u64,
    pub exclusive: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PosixLockTable {
    pub entries: Vec<PosixLockEntry>,
}

impl PosixLockTable {
    pub const STORE_VERSION: u8 = 0x10;

    pub fn store<W: Write>(&self, w: &mut W) -> io::Result<()> {
        put_u32(w, self.entries.len() as u32)?;
        for entry in &self.entries {
            put_u32(w, entry.inode)?;
            put_u64(w, entry.owner)?;
            put_u32(w, entry.session)?;
            put_u32(w, entry.pid)?;
            put_u64(w, entry.start)?;
            put_u64(w, entry.end)?;
            put_u8(w, u8::from(entry.exclusive))?;
        }
        Ok(())
    }

    pub fn load<R: Read>(r: &mut R, _mver: u8) -> io::Result<Self> {
        let count = get_u32(r)?;
        let mut entries = Vec::with_capacity(count as usize);
        for _ in 0..count {
            entries.push(PosixLockEntry {
                inode: get_u32(r)?,
                owner: get_u64(r)?,
                session: get_u32(r)?,
                pid: get_u32(r)?,
                start: get_u64(r)?,
                end: get_u64(r)?,
                exclusive: get_u8(r)? != 0,
            });
        }
        Ok(Self { entries })
    }
}

/// Registered chunk servers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerTable {
    pub servers: Vec<(u32, u16, u16)>,
}

impl ServerTable {
    pub const STORE_VERSION: u8 = 0x10;

    pub fn store<W: Write>(&self, w: &mut W) -> io::Result<()> {
        put_u32(w, self.servers.len() as u32)?;
        for (ip, port, csid) in &self.servers {
            put_u32(w, *ip)?;
            put_u16(w, *port)?;
            put_u16(w, *csid)?;
        }
        Ok(())
    }

    pub fn load<R: Read>(r: &mut R, _mver: u8) -> io::Result<Self> {
        let count = get_u32(r)?;
        let mut servers = Vec::with_capacity(count as usize);
        for _ in 0..count {
            servers.push((get_u32(r)?, get_u16(r)?, get_u16(r)?));
        }
        Ok(Self { servers })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkInfo {
    pub version: u32,
    pub archived: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChunkTable {
    chunks: BTreeMap<u64, ChunkInfo>,
}

impl ChunkTable {
    pub const STORE_VERSION: u8 = 0x10;

    pub fn insert(&mut self, chunk_id: u64, info: ChunkInfo) {
        self.chunks.insert(chunk_id, info);
    }

    pub fn remove(&mut self, chunk_id: u64) -> Option<ChunkInfo> {
        self.chunks.remove(&chunk_id)
    }

    pub fn get(&self, chunk_id: u64) -> Option<&ChunkInfo> {
        self.chunks.get(&chunk_id)
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn store<W: Write>(&self, w: &mut W) -> io::Result<()> {
        put_u32(w, self.chunks.len() as u32)?;
        for (chunk_id, info) in &self.chunks {
            put_u64(w, *chunk_id)?;
            put_u32(w, info.version)?;
            put_u8(w, u8::from(info.archived))?;
        }
        Ok(())
    }

    pub fn load<R: Read>(r: &mut R, _mver: u8) -> io::Result<Self> {
        let count = get_u32(r)?;
        let mut chunks = BTreeMap::new();
        for _ in 0..count {
            let chunk_id = get_u64(r)?;
            let info = ChunkInfo {
                version: get_u32(r)?,
                archived: get_u8(r)? != 0,
            };
            chunks.insert(chunk_id, info);
        }
        Ok(Self { chunks })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_table_round_trip() {
        let mut table = NodeTable::default();
        table.insert(Node {
            inode: 2,
            kind: NodeKind::File,
            mode: 0o644,
            uid: 1000,
            gid: 1000,
            atime: 10,
            mtime: 20,
            ctime: 30,
            length: 65536,
            chunks: vec![0x10, 0x11],
        });
        table.insert(Node {
            inode: 1,
            kind: NodeKind::Directory,
            mode: 0o755,
            uid: 0,
            gid: 0,
            atime: 1,
            mtime: 2,
            ctime: 3,
            length: 0,
            chunks: Vec::new(),
        });

        let mut raw = Vec::new();
        table.store(&mut raw).unwrap();
        let loaded = NodeTable::load(&mut raw.as_slice(), NodeTable::STORE_VERSION).unwrap();
        assert_eq!(loaded, table);
    }

    #[test]
    fn bad_node_kind_is_rejected() {
        let mut raw = Vec::new();
        put_u32(&mut raw, 1).unwrap();
        put_u32(&mut raw, 9).unwrap();
        put_u8(&mut raw, 0xFF).unwrap();
        assert!(NodeTable::load(&mut raw.as_slice(), NodeTable::STORE_VERSION).is_err());
    }

    #[test]
    fn xattr_table_round_trip() {
        let table = XattrTable {
            entries: vec![Xattr {
                inode: 5,
                name: "user.origin".to_string(),
                value: vec![0, 1, 2, 255],
            }],
        };
        let mut raw = Vec::new();
        table.store(&mut raw).unwrap();
        let loaded = XattrTable::load(&mut raw.as_slice(), XattrTable::STORE_VERSION).unwrap();
        assert_eq!(loaded, table);
    }
}
