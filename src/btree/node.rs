//! Node wire format for the disk-resident B+tree.
//!
//! Nodes are fixed 1024-byte pages, big-endian throughout:
//!
//! ```text
//! leafFlag:u8  keyCount:u16  parentOffset:u32  nextLeafOffset:u32
//! repeated keyCount times: keyLen:u16  keyBytes[keyLen]
//!   leaf:     (entryOffset:u32  entryLength:u32)  -- one per key
//!   internal: childOffset:u32                      -- one per key, plus a
//!                                                      trailing lastChildOffset:u32
//! ```

use crate::errors::{Error, Result};

pub const NODE_SIZE: usize = 1024;
pub const MAX_KEYS: usize = 15;
pub const MIN_KEYS: usize = 7;
pub const NONE_OFFSET: u32 = 0xFFFF_FFFF;
const MAX_KEY_LEN: usize = 1000;
const HEADER_LEN: usize = 1 + 2 + 4 + 4;

/// A primary-tree leaf payload pointer: `(offset, length)` of an encoded
/// document in the binary file engine's document region.
pub type Payload = (u32, u32);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Leaf {
        parent: Option<u32>,
        next_leaf: Option<u32>,
        keys: Vec<String>,
        entries: Vec<Payload>,
    },
    Internal {
        parent: Option<u32>,
        keys: Vec<String>,
        children: Vec<u32>,
    },
}

impl Node {
    #[must_use]
    pub fn new_leaf(parent: Option<u32>) -> Self {
        Node::Leaf { parent, next_leaf: None, keys: Vec::new(), entries: Vec::new() }
    }

    #[must_use]
    pub fn new_internal(parent: Option<u32>) -> Self {
        Node::Internal { parent, keys: Vec::new(), children: Vec::new() }
    }

    #[must_use]
    pub fn is_leaf(&self) -> bool {
        matches!(self, Node::Leaf { .. })
    }

    #[must_use]
    pub fn keys(&self) -> &[String] {
        match self {
            Node::Leaf { keys, .. } | Node::Internal { keys, .. } => keys,
        }
    }

    #[must_use]
    pub fn key_count(&self) -> usize {
        self.keys().len()
    }

    #[must_use]
    pub fn parent(&self) -> Option<u32> {
        match self {
            Node::Leaf { parent, .. } | Node::Internal { parent, .. } => *parent,
        }
    }

    pub fn set_parent(&mut self, p: Option<u32>) {
        match self {
            Node::Leaf { parent, .. } | Node::Internal { parent, .. } => *parent = p,
        }
    }

    /// Encode to a fixed 1024-byte page.
    ///
    /// # Errors
    /// Returns an error if invariant I2 (`children.len == keys.len + 1` for
    /// internal nodes, `entries.len == keys.len` for leaves) is violated, or
    /// if the encoded node would not fit in `NODE_SIZE` bytes.
    pub fn encode(&self) -> Result<[u8; NODE_SIZE]> {
        let mut buf = Vec::with_capacity(NODE_SIZE);
        match self {
            Node::Leaf { parent, next_leaf, keys, entries } => {
                if entries.len() != keys.len() {
                    return Err(invariant_violation("leaf entries.len != keys.len"));
                }
                buf.push(1u8);
                push_u16(&mut buf, keys.len());
                push_u32(&mut buf, parent.unwrap_or(NONE_OFFSET));
                push_u32(&mut buf, next_leaf.unwrap_or(NONE_OFFSET));
                for (k, (off, len)) in keys.iter().zip(entries.iter()) {
                    push_key(&mut buf, k)?;
                    push_u32(&mut buf, *off);
                    push_u32(&mut buf, *len);
                }
            }
            Node::Internal { parent, keys, children } => {
                if children.len() != keys.len() + 1 {
                    return Err(invariant_violation("internal children.len != keys.len + 1"));
                }
                buf.push(0u8);
                push_u16(&mut buf, keys.len());
                push_u32(&mut buf, parent.unwrap_or(NONE_OFFSET));
                push_u32(&mut buf, NONE_OFFSET); // unused for internal nodes
                for (i, k) in keys.iter().enumerate() {
                    push_key(&mut buf, k)?;
                    push_u32(&mut buf, children[i]);
                }
                push_u32(&mut buf, *children.last().unwrap_or(&NONE_OFFSET));
            }
        }
        if buf.len() > NODE_SIZE {
            return Err(invariant_violation(&format!(
                "encoded node is {} bytes, exceeds {NODE_SIZE}",
                buf.len()
            )));
        }
        buf.resize(NODE_SIZE, 0);
        let mut out = [0u8; NODE_SIZE];
        out.copy_from_slice(&buf);
        Ok(out)
    }

    /// Decode a node, validating structural invariants. `offset` is used only
    /// to attribute the originating page in error messages.
    ///
    /// # Errors
    /// Returns `Error::StructuralCorruption` if the key count, key lengths, or
    /// child/entry counts are inconsistent with the declared `keyCount`.
    pub fn decode(buf: &[u8], offset: u64) -> Result<Self> {
        if buf.len() < HEADER_LEN {
            return Err(corrupt(offset, "buffer shorter than node header"));
        }
        let leaf_flag = buf[0];
        let key_count = u16::from_be_bytes([buf[1], buf[2]]) as usize;
        if key_count > MAX_KEYS {
            return Err(corrupt(offset, &format!("keyCount {key_count} exceeds MAX_KEYS")));
        }
        let parent_offset = u32::from_be_bytes([buf[3], buf[4], buf[5], buf[6]]);
        let next_leaf_offset = u32::from_be_bytes([buf[7], buf[8], buf[9], buf[10]]);
        let parent = from_sentinel(parent_offset);
        let mut pos = HEADER_LEN;
        let mut keys = Vec::with_capacity(key_count);

        if leaf_flag == 1 {
            let mut entries = Vec::with_capacity(key_count);
            for _ in 0..key_count {
                let key = read_key(buf, &mut pos, offset)?;
                if pos + 8 > buf.len() {
                    return Err(corrupt(offset, "truncated leaf entry"));
                }
                let entry_offset = read_u32(buf, pos);
                let entry_length = read_u32(buf, pos + 4);
                pos += 8;
                keys.push(key);
                entries.push((entry_offset, entry_length));
            }
            if entries.len() != keys.len() {
                return Err(corrupt(offset, "leaf entries count != keyCount"));
            }
            Ok(Node::Leaf { parent, next_leaf: from_sentinel(next_leaf_offset), keys, entries })
        } else if leaf_flag == 0 {
            let mut children = Vec::with_capacity(key_count + 1);
            for _ in 0..key_count {
                let key = read_key(buf, &mut pos, offset)?;
                if pos + 4 > buf.len() {
                    return Err(corrupt(offset, "truncated internal child offset"));
                }
                children.push(read_u32(buf, pos));
                pos += 4;
                keys.push(key);
            }
            if pos + 4 > buf.len() {
                return Err(corrupt(offset, "truncated trailing child offset"));
            }
            children.push(read_u32(buf, pos));
            if children.len() != keys.len() + 1 {
                return Err(corrupt(offset, "internal children count != keyCount + 1"));
            }
            Ok(Node::Internal { parent, keys, children })
        } else {
            Err(corrupt(offset, &format!("invalid leaf flag byte {leaf_flag}")))
        }
    }
}

fn from_sentinel(v: u32) -> Option<u32> {
    if v == NONE_OFFSET { None } else { Some(v) }
}

fn push_u16(buf: &mut Vec<u8>, v: usize) {
    buf.extend_from_slice(&(v as u16).to_be_bytes());
}

fn push_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_be_bytes());
}

fn push_key(buf: &mut Vec<u8>, key: &str) -> Result<()> {
    let bytes = key.as_bytes();
    if bytes.len() > MAX_KEY_LEN {
        return Err(invariant_violation(&format!("key length {} exceeds {MAX_KEY_LEN}", bytes.len())));
    }
    push_u16(buf, bytes.len());
    buf.extend_from_slice(bytes);
    Ok(())
}

fn read_u32(buf: &[u8], pos: usize) -> u32 {
    u32::from_be_bytes([buf[pos], buf[pos + 1], buf[pos + 2], buf[pos + 3]])
}

fn read_key(buf: &[u8], pos: &mut usize, offset: u64) -> Result<String> {
    if *pos + 2 > buf.len() {
        return Err(corrupt(offset, "truncated key length"));
    }
    let key_len = u16::from_be_bytes([buf[*pos], buf[*pos + 1]]) as usize;
    *pos += 2;
    if key_len > MAX_KEY_LEN {
        return Err(corrupt(offset, &format!("key length {key_len} exceeds {MAX_KEY_LEN}")));
    }
    if *pos + key_len > buf.len() {
        return Err(corrupt(offset, "truncated key bytes"));
    }
    let s = std::str::from_utf8(&buf[*pos..*pos + key_len])
        .map_err(|_| corrupt(offset, "key bytes are not valid UTF-8"))?
        .to_string();
    *pos += key_len;
    Ok(s)
}

fn corrupt(offset: u64, reason: &str) -> Error {
    Error::StructuralCorruption { offset, reason: reason.to_string() }
}

fn invariant_violation(reason: &str) -> Error {
    Error::StructuralCorruption { offset: u64::MAX, reason: reason.to_string() }
}
