//! Incremental-backup metadata tree
//!
//! [`BackupTree`] holds the file-metadata snapshot of a previous backup
//! as a rooted forest keyed by path component, and classifies each
//! candidate file against it via [`BackupTree::check`]. Nodes live in
//! one arena; sibling lists are index-linked chains kept sorted by the
//! wildcard-aware comparator, which doubles as the lookup match test.
//!
//! Handles are cheap to clone and share one tree; the storage is freed
//! when the last handle drops.

use crate::error::{FsError, LinkError, Result};

use std::cell::RefCell;
use std::rc::Rc;
use tracing::trace;

const NIL: usize = usize::MAX;
const ROOT: usize = 0;

/// Object type of a tree record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    File,
    Directory,
}

/// Metadata of one filesystem object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    /// Path relative to the backup root, components separated by `/`
    pub path: String,
    pub load: u32,
    pub exec: u32,
    pub size: u32,
    pub attr: u32,
    pub kind: FileKind,
}

/// Verdict of [`BackupTree::check`] for one candidate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckOutcome {
    /// Metadata matches the snapshot exactly
    Same,
    /// No record at that path, or the object type differs
    NotFound,
    /// The candidate's timestamp is at or behind the snapshot's
    Older,
    /// The candidate's timestamp strictly exceeds the snapshot's
    Newer,
}

/// Compare `pattern` against `subject`, case-insensitively, treating
/// `?` as exactly one character and `*` as any run. Zero means match;
/// the sign orders literal strings like a case-folded byte compare
/// with the terminator reading as zero.
pub fn wildcard_cmp(pattern: &str, subject: &str) -> i32 {
    cmp_bytes(pattern.as_bytes(), subject.as_bytes())
}

fn fold(byte: u8) -> i32 {
    i32::from(byte.to_ascii_uppercase())
}

fn cmp_bytes(pat: &[u8], sub: &[u8]) -> i32 {
    let mut pi = 0;
    let mut si = 0;
    loop {
        let p = pat.get(pi).copied().unwrap_or(0);
        match p {
            b'*' => {
                // Try every suffix of the subject
                let rest = &pat[pi + 1..];
                for start in si..=sub.len() {
                    if cmp_bytes(rest, &sub[start..]) == 0 {
                        return 0;
                    }
                }
                return cmp_bytes(rest, &sub[sub.len()..]);
            }
            b'?' => {
                match sub.get(si) {
                    // Consumes exactly one character; never the terminator
                    Some(_) => {
                        pi += 1;
                        si += 1;
                    }
                    None => return fold(b'?'),
                }
            }
            _ => {
                let s = sub.get(si).copied().unwrap_or(0);
                let diff = fold(p) - fold(s);
                if diff != 0 {
                    return diff;
                }
                if p == 0 {
                    return 0;
                }
                pi += 1;
                si += 1;
            }
        }
    }
}

struct Node {
    name: String,
    load: u32,
    exec: u32,
    size: u32,
    attr: u32,
    kind: FileKind,
    ignore: bool,
    parent: usize,
    child_head: usize,
    sibling: usize,
}

impl Node {
    fn placeholder_dir(name: String, parent: usize) -> Self {
        Self {
            name,
            load: 0,
            exec: 0,
            size: 0,
            attr: 0,
            kind: FileKind::Directory,
            ignore: false,
            parent,
            child_head: NIL,
            sibling: NIL,
        }
    }
}

struct TreeInner {
    nodes: Vec<Node>,
    /// Next node the enumeration will yield, `NIL` when exhausted
    cursor: usize,
}

/// Shared handle onto one metadata snapshot.
///
/// Cloning yields another owner of the same tree, matching the
/// reference-counted handle semantics of the backup job; the tree is
/// destroyed when the last clone drops.
#[derive(Clone)]
pub struct BackupTree {
    inner: Rc<RefCell<TreeInner>>,
}

impl BackupTree {
    pub fn new() -> Self {
        let root = Node::placeholder_dir(String::new(), NIL);
        Self {
            inner: Rc::new(RefCell::new(TreeInner {
                nodes: vec![root],
                cursor: NIL,
            })),
        }
    }

    /// Number of handles currently sharing this tree
    pub fn handle_count(&self) -> usize {
        Rc::strong_count(&self.inner)
    }

    /// Insert or update the record at `info.path`, synthesizing
    /// placeholder directories for missing ancestors. Fails with a
    /// `types` filing error when the path or an ancestor exists with
    /// the wrong object type.
    pub fn add(&self, info: &FileInfo) -> Result<()> {
        let mut tree = self.inner.borrow_mut();
        let (dir, leaf) = tree.walk_to_parent(&info.path)?;

        match tree.find_child(dir, leaf) {
            Some(idx) => {
                let node = &mut tree.nodes[idx];
                if node.kind != info.kind {
                    return Err(LinkError::Fs(FsError::Types));
                }
                node.name = leaf.to_string();
                node.load = info.load;
                node.exec = info.exec;
                node.size = info.size;
                node.attr = info.attr;
            }
            None => {
                let node = Node {
                    name: leaf.to_string(),
                    load: info.load,
                    exec: info.exec,
                    size: info.size,
                    attr: info.attr,
                    kind: info.kind,
                    ignore: false,
                    parent: dir,
                    child_head: NIL,
                    sibling: NIL,
                };
                tree.insert_child(dir, node);
            }
        }
        trace!(path = %info.path, "record added");
        Ok(())
    }

    /// Classify a candidate against the snapshot.
    pub fn check(&self, info: &FileInfo) -> CheckOutcome {
        let tree = self.inner.borrow();
        let idx = match tree.lookup(&info.path) {
            Some(idx) => idx,
            None => return CheckOutcome::NotFound,
        };
        let node = &tree.nodes[idx];
        if node.kind != info.kind {
            return CheckOutcome::NotFound;
        }

        let leaf = leafname(&info.path);
        let same_meta = node.load == info.load
            && node.exec == info.exec
            && node.attr == info.attr
            && (node.kind == FileKind::Directory || node.size == info.size);
        if same_meta && node.name == leaf {
            return CheckOutcome::Same;
        }

        if timestamp(info.load, info.exec) > timestamp(node.load, node.exec) {
            CheckOutcome::Newer
        } else {
            CheckOutcome::Older
        }
    }

    /// Hide a record, and any subtree below it, from enumeration.
    pub fn ignore(&self, path: &str) -> Result<()> {
        let mut tree = self.inner.borrow_mut();
        match tree.lookup(path) {
            Some(idx) => {
                tree.nodes[idx].ignore = true;
                Ok(())
            }
            None => Err(LinkError::Fs(FsError::NotFound)),
        }
    }

    /// Restart enumeration from the beginning of the tree.
    pub fn rewind(&self) {
        let mut tree = self.inner.borrow_mut();
        let first = tree.nodes[ROOT].child_head;
        tree.cursor = tree.skip_ignored(first);
    }

    /// Yield the next non-ignored record in depth-first order,
    /// children before siblings.
    pub fn next(&self) -> Option<FileInfo> {
        let mut tree = self.inner.borrow_mut();
        let idx = tree.cursor;
        if idx == NIL {
            return None;
        }
        let info = tree.info_of(idx);
        tree.cursor = tree.advance(idx);
        Some(info)
    }

    /// Totals over the non-ignored records: record count and the sum
    /// of file sizes.
    pub fn count(&self) -> (u32, u64) {
        let tree = self.inner.borrow();
        let mut records = 0u32;
        let mut bytes = 0u64;
        let mut idx = tree.skip_ignored(tree.nodes[ROOT].child_head);
        while idx != NIL {
            let node = &tree.nodes[idx];
            records += 1;
            if node.kind == FileKind::File {
                bytes += u64::from(node.size);
            }
            idx = tree.advance(idx);
        }
        (records, bytes)
    }
}

impl Default for BackupTree {
    fn default() -> Self {
        Self::new()
    }
}

/// Decode the platform timestamp: a dated object carries the high
/// centisecond byte in the load word and the low 32 bits in the exec
/// word.
fn timestamp(load: u32, exec: u32) -> u64 {
    if (0xfff0_0000..=0xffff_ffff).contains(&load) {
        (u64::from(load & 0xff) << 32) | u64::from(exec)
    } else {
        0
    }
}

fn leafname(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

impl TreeInner {
    /// Resolve all but the last component of `path`, creating
    /// placeholder directories for missing ancestors, and return the
    /// parent index plus the leafname.
    fn walk_to_parent<'a>(&mut self, path: &'a str) -> Result<(usize, &'a str)> {
        // Validate before touching the arena so a malformed path
        // synthesizes no placeholders
        if path.split('/').any(|component| component.is_empty()) {
            return Err(LinkError::bad_name(path));
        }
        let mut dir = ROOT;
        let mut components = path.split('/').peekable();
        while let Some(component) = components.next() {
            if components.peek().is_none() {
                return Ok((dir, component));
            }
            dir = match self.find_child(dir, component) {
                Some(idx) => {
                    if self.nodes[idx].kind != FileKind::Directory {
                        return Err(LinkError::Fs(FsError::Types));
                    }
                    idx
                }
                None => {
                    let node = Node::placeholder_dir(component.to_string(), dir);
                    self.insert_child(dir, node)
                }
            };
        }
        Err(LinkError::bad_name(path))
    }

    fn lookup(&self, path: &str) -> Option<usize> {
        let mut idx = ROOT;
        for component in path.split('/') {
            if component.is_empty() {
                return None;
            }
            idx = self.find_child(idx, component)?;
        }
        Some(idx)
    }

    fn find_child(&self, dir: usize, name: &str) -> Option<usize> {
        let mut idx = self.nodes[dir].child_head;
        while idx != NIL {
            if wildcard_cmp(name, &self.nodes[idx].name) == 0 {
                return Some(idx);
            }
            idx = self.nodes[idx].sibling;
        }
        None
    }

    /// Splice a new node into its parent's sibling chain, keeping the
    /// chain sorted by the comparator.
    fn insert_child(&mut self, dir: usize, node: Node) -> usize {
        let new_idx = self.nodes.len();
        let name = node.name.clone();
        self.nodes.push(node);

        let mut prev = NIL;
        let mut cur = self.nodes[dir].child_head;
        while cur != NIL && wildcard_cmp(&name, &self.nodes[cur].name) > 0 {
            prev = cur;
            cur = self.nodes[cur].sibling;
        }
        self.nodes[new_idx].sibling = cur;
        if prev == NIL {
            self.nodes[dir].child_head = new_idx;
        } else {
            self.nodes[prev].sibling = new_idx;
        }
        new_idx
    }

    /// Step the depth-first walk past `idx`: descend first, otherwise
    /// move sideways, otherwise climb towards the root.
    fn advance(&self, idx: usize) -> usize {
        let child = self.skip_ignored(self.nodes[idx].child_head);
        if child != NIL {
            return child;
        }
        let mut at = idx;
        loop {
            let sibling = self.skip_ignored(self.nodes[at].sibling);
            if sibling != NIL {
                return sibling;
            }
            at = self.nodes[at].parent;
            if at == NIL || at == ROOT {
                return NIL;
            }
        }
    }

    /// First node at or after `idx` in its sibling chain that is not
    /// ignored; ignoring a directory hides its whole subtree.
    fn skip_ignored(&self, mut idx: usize) -> usize {
        while idx != NIL && self.nodes[idx].ignore {
            idx = self.nodes[idx].sibling;
        }
        idx
    }

    fn info_of(&self, idx: usize) -> FileInfo {
        let mut parts = Vec::new();
        let mut at = idx;
        while at != NIL && at != ROOT {
            parts.push(self.nodes[at].name.clone());
            at = self.nodes[at].parent;
        }
        parts.reverse();
        let node = &self.nodes[idx];
        FileInfo {
            path: parts.join("/"),
            load: node.load,
            exec: node.exec,
            size: node.size,
            attr: node.attr,
            kind: node.kind,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(path: &str, load: u32, exec: u32, size: u32, attr: u32) -> FileInfo {
        FileInfo {
            path: path.to_string(),
            load,
            exec,
            size,
            attr,
            kind: FileKind::File,
        }
    }

    #[test]
    fn test_wildcard_match() {
        assert_eq!(wildcard_cmp("A*C?", "ABBCD"), 0);
        assert_eq!(wildcard_cmp("A*", "a"), 0);
        assert!(wildcard_cmp("A?", "A") > 0);
        assert_eq!(wildcard_cmp("HELLO", "hello"), 0);
        assert!(wildcard_cmp("apple", "banana") < 0);
        assert!(wildcard_cmp("b", "Apple") > 0);
    }

    #[test]
    fn test_wildcard_orders_literals() {
        let mut names = vec!["zoo", "Apple", "apex", "Banana"];
        names.sort_by(|a, b| wildcard_cmp(a, b).cmp(&0));
        assert_eq!(names, vec!["apex", "Apple", "Banana", "zoo"]);
    }

    #[test]
    fn test_add_creates_placeholders() {
        let tree = BackupTree::new();
        tree.add(&file("dir/sub/leaf", 0, 0, 10, 0x33)).unwrap();

        tree.rewind();
        let first = tree.next().unwrap();
        assert_eq!(first.path, "dir");
        assert_eq!(first.kind, FileKind::Directory);
        let second = tree.next().unwrap();
        assert_eq!(second.path, "dir/sub");
        let third = tree.next().unwrap();
        assert_eq!(third.path, "dir/sub/leaf");
        assert_eq!(third.kind, FileKind::File);
        assert!(tree.next().is_none());
    }

    #[test]
    fn test_add_type_conflict() {
        let tree = BackupTree::new();
        tree.add(&file("a/b", 0, 0, 1, 0)).unwrap();
        let mut dir = file("a/b", 0, 0, 0, 0);
        dir.kind = FileKind::Directory;
        assert_eq!(tree.add(&dir), Err(LinkError::Fs(FsError::Types)));

        // A file where an ancestor directory is needed
        assert_eq!(
            tree.add(&file("a/b/c", 0, 0, 1, 0)),
            Err(LinkError::Fs(FsError::Types))
        );
    }

    #[test]
    fn test_empty_path_component_rejected() {
        let tree = BackupTree::new();
        assert!(matches!(
            tree.add(&file("a//b", 0, 0, 1, 0)),
            Err(LinkError::BadName(_))
        ));
        assert!(matches!(
            tree.add(&file("", 0, 0, 1, 0)),
            Err(LinkError::BadName(_))
        ));
        // Nothing was synthesized for the malformed paths
        assert_eq!(tree.count(), (0, 0));
    }

    #[test]
    fn test_check_timestamps() {
        let tree = BackupTree::new();
        tree.add(&file("DIR/F", 0xFFFF_FF01, 0x10, 100, 0x33)).unwrap();

        assert_eq!(
            tree.check(&file("DIR/F", 0xFFFF_FF01, 0x10, 100, 0x33)),
            CheckOutcome::Same
        );
        assert_eq!(
            tree.check(&file("DIR/F", 0xFFFF_FF01, 0x20, 100, 0x33)),
            CheckOutcome::Newer
        );
        assert_eq!(
            tree.check(&file("DIR/F", 0xFFFF_FF01, 0x05, 100, 0x33)),
            CheckOutcome::Older
        );
        assert_eq!(
            tree.check(&file("DIR/G", 0xFFFF_FF01, 0x10, 100, 0x33)),
            CheckOutcome::NotFound
        );
    }

    #[test]
    fn test_check_high_byte_dominates() {
        let tree = BackupTree::new();
        tree.add(&file("f", 0xFFFF_FF01, 0xFFFF_FFFF, 10, 0)).unwrap();
        assert_eq!(
            tree.check(&file("f", 0xFFFF_FF02, 0x0, 10, 0)),
            CheckOutcome::Newer
        );
    }

    #[test]
    fn test_same_requires_case_sensitive_leaf() {
        let tree = BackupTree::new();
        tree.add(&file("Dir/File", 0xFFFF_FF01, 0x10, 5, 0)).unwrap();
        // Case-insensitive lookup finds the record, but the leafname
        // case differs so the candidate is not `same`
        let outcome = tree.check(&file("Dir/FILE", 0xFFFF_FF01, 0x10, 5, 0));
        assert_eq!(outcome, CheckOutcome::Older);
    }

    #[test]
    fn test_ignore_hides_subtree() {
        let tree = BackupTree::new();
        tree.add(&file("keep/a", 0, 0, 1, 0)).unwrap();
        tree.add(&file("skip/b", 0, 0, 2, 0)).unwrap();
        tree.add(&file("skip/c", 0, 0, 3, 0)).unwrap();
        tree.ignore("skip").unwrap();

        tree.rewind();
        let mut paths = Vec::new();
        while let Some(info) = tree.next() {
            paths.push(info.path);
        }
        assert_eq!(paths, vec!["keep", "keep/a"]);

        let (records, bytes) = tree.count();
        assert_eq!(records, 2);
        assert_eq!(bytes, 1);
    }

    #[test]
    fn test_siblings_sorted() {
        let tree = BackupTree::new();
        for name in ["zebra", "apple", "Mango"] {
            tree.add(&file(name, 0, 0, 1, 0)).unwrap();
        }
        tree.rewind();
        let order: Vec<String> = std::iter::from_fn(|| tree.next().map(|i| i.path)).collect();
        assert_eq!(order, vec!["apple", "Mango", "zebra"]);
    }

    #[test]
    fn test_clone_shares_tree() {
        let tree = BackupTree::new();
        let other = tree.clone();
        assert_eq!(tree.handle_count(), 2);
        other.add(&file("shared", 0, 0, 7, 0)).unwrap();
        drop(other);
        assert_eq!(tree.handle_count(), 1);
        assert_eq!(tree.check(&file("shared", 0, 0, 7, 0)), CheckOutcome::Same);
    }
}
