use std::collections::{HashMap, HashSet};
use std::sync::LazyLock;
use std::time::{SystemTime, UNIX_EPOCH};

use regex::Regex;

/// Device side file separator.
pub const FILE_SEPARATOR: &str = "/";

/// How long a cached directory listing stays valid.
pub const REFRESH_RATE_MS: u64 = 5000;
/// Staleness test threshold. Slightly lower than the refresh rate for
/// precision issues.
pub const REFRESH_TEST_MS: u64 = REFRESH_RATE_MS * 4 / 5;

const DIRECTORY_DATA: &str = "data";
const DIRECTORY_SDCARD: &str = "sdcard";
const DIRECTORY_MNT: &str = "mnt";
const DIRECTORY_SYSTEM: &str = "system";
const DIRECTORY_TEMP: &str = "tmp";
const DIRECTORY_APP: &str = "app";

/// The only entries accepted directly under `/`.
pub(crate) const ROOT_LEVEL_APPROVED: [&str; 5] = [
    DIRECTORY_DATA,
    DIRECTORY_SDCARD,
    DIRECTORY_SYSTEM,
    DIRECTORY_TEMP,
    DIRECTORY_MNT,
];

static APK_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^.*\.apk$").expect("apk pattern"));

// Characters that must be backslash-escaped before a path is handed to a
// device shell command line.
static ESCAPE_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"([\\()*+?"'#/\s])"#).expect("escape pattern"));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    File,
    Directory,
    DirectoryLink,
    Block,
    Character,
    Link,
    Socket,
    Fifo,
    Other,
}

/// Stable handle into a [`FileTree`]. Identity is preserved across listing
/// refreshes for entries whose name survives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntryId(u32);

/// A node of the remote directory tree: one file, directory, link or special
/// file as reported by the device `ls -l`.
#[derive(Debug, Clone)]
pub struct FileEntry {
    pub name: String,
    pub kind: FileKind,
    pub permissions: String,
    pub owner: String,
    pub group: String,
    pub size: String,
    pub date: String,
    pub time: String,
    /// For a link, a description of the target. For an application apk,
    /// the package name reported by the package manager.
    pub info: String,
    /// Milliseconds since epoch of the last listing, 0 if never fetched.
    pub fetch_time: u64,
    parent: Option<EntryId>,
    children: Vec<EntryId>,
    is_root: bool,
    is_app_package: bool,
}

impl FileEntry {
    fn new(parent: Option<EntryId>, name: &str, kind: FileKind, is_root: bool) -> Self {
        Self {
            name: name.to_string(),
            kind,
            permissions: String::new(),
            owner: String::new(),
            group: String::new(),
            size: String::new(),
            date: String::new(),
            time: String::new(),
            info: String::new(),
            fetch_time: 0,
            parent,
            children: Vec::new(),
            is_root,
            is_app_package: false,
        }
    }

    pub fn parent(&self) -> Option<EntryId> {
        self.parent
    }

    pub fn is_root(&self) -> bool {
        self.is_root
    }

    /// Whether the entry is a folder or a link to a folder.
    pub fn is_directory(&self) -> bool {
        matches!(self.kind, FileKind::Directory | FileKind::DirectoryLink)
    }

    /// Whether the entry is an apk inside an application directory
    /// (`/system/app` or `/data/app`).
    pub fn is_application_package(&self) -> bool {
        self.is_app_package
    }

    /// Whether the file name looks like an application package.
    pub fn is_app_file_name(&self) -> bool {
        APK_PATTERN.is_match(&self.name)
    }

    /// The size reported by `ls`, parsed. 0 when the field is empty or not a
    /// number (directories, device nodes).
    pub fn size_value(&self) -> u64 {
        self.size.trim().parse().unwrap_or(0)
    }
}

/// Backslash-escape an entry name for consumption by a shell command line.
pub fn escape(entry_name: &str) -> String {
    ESCAPE_PATTERN.replace_all(entry_name, r"\$1").into_owned()
}

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Ownership-rooted tree of remote entries. Nodes are kept in an arena keyed
/// by [`EntryId`] and reference each other by id, so a listing refresh can
/// reuse surviving nodes without touching their handles.
#[derive(Debug, Default)]
pub struct FileTree {
    nodes: HashMap<EntryId, FileEntry>,
    next_id: u32,
    root: Option<EntryId>,
}

impl FileTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// The root entry, created on first use.
    pub fn root(&mut self) -> EntryId {
        if let Some(root) = self.root {
            return root;
        }
        let id = self.alloc();
        self.nodes
            .insert(id, FileEntry::new(None, "", FileKind::Directory, true));
        self.root = Some(id);
        id
    }

    fn alloc(&mut self) -> EntryId {
        let id = EntryId(self.next_id);
        self.next_id += 1;
        id
    }

    pub fn get(&self, id: EntryId) -> Option<&FileEntry> {
        self.nodes.get(&id)
    }

    pub fn get_mut(&mut self, id: EntryId) -> Option<&mut FileEntry> {
        self.nodes.get_mut(&id)
    }

    /// Creates a new unattached entry under `parent`. The caller wires it up
    /// through [`FileTree::add_child`] or [`FileTree::set_children`].
    pub fn new_entry(&mut self, parent: EntryId, name: &str, kind: FileKind) -> EntryId {
        let id = self.alloc();
        self.nodes
            .insert(id, FileEntry::new(Some(parent), name, kind, false));
        self.refresh_app_package_status(id);
        id
    }

    /// Recomputes the app package flag: a `*.apk` file directly inside
    /// `/system/app` or `/data/app`.
    pub(crate) fn refresh_app_package_status(&mut self, id: EntryId) {
        let segments = self.path_segments(id);
        let flag = match self.get(id) {
            Some(e) => {
                e.kind == FileKind::File
                    && segments.len() == 3
                    && e.is_app_file_name()
                    && segments[1] == DIRECTORY_APP
                    && (segments[0] == DIRECTORY_SYSTEM || segments[0] == DIRECTORY_DATA)
            }
            None => return,
        };
        if let Some(e) = self.get_mut(id) {
            e.is_app_package = flag;
        }
    }

    pub fn add_child(&mut self, parent: EntryId, child: EntryId) {
        if let Some(p) = self.get_mut(parent) {
            p.children.push(child);
        }
    }

    /// The child of `parent` matching `name`, from the cached children list.
    pub fn find_child(&self, parent: EntryId, name: &str) -> Option<EntryId> {
        let p = self.get(parent)?;
        p.children
            .iter()
            .copied()
            .find(|&c| self.get(c).map(|e| e.name == name).unwrap_or(false))
    }

    /// The cached children created by the last listing of `parent`.
    pub fn cached_children(&self, parent: EntryId) -> Vec<EntryId> {
        self.get(parent).map(|e| e.children.clone()).unwrap_or_default()
    }

    /// Replaces the children of `parent`. Previous children absent from the
    /// new list are dropped from the tree, along with their subtrees.
    pub fn set_children(&mut self, parent: EntryId, children: Vec<EntryId>) {
        let kept: HashSet<EntryId> = children.iter().copied().collect();
        let old = self.cached_children(parent);
        for id in old {
            if !kept.contains(&id) {
                self.remove_subtree(id);
            }
        }
        if let Some(p) = self.get_mut(parent) {
            p.children = children;
        }
    }

    fn remove_subtree(&mut self, id: EntryId) {
        if let Some(node) = self.nodes.remove(&id) {
            for child in node.children {
                self.remove_subtree(child);
            }
        }
    }

    /// Full path of the entry, `/`-separated. The root is `/`.
    pub fn full_path(&self, id: EntryId) -> String {
        self.build_path(id, false)
    }

    /// Full path of the entry, safe to embed in a shell command line.
    pub fn escaped_path(&self, id: EntryId) -> String {
        self.build_path(id, true)
    }

    fn build_path(&self, id: EntryId, escape_path: bool) -> String {
        if self.get(id).map(|e| e.is_root).unwrap_or(false) {
            return FILE_SEPARATOR.to_string();
        }
        let mut out = String::new();
        self.fill_path(id, escape_path, &mut out);
        out
    }

    fn fill_path(&self, id: EntryId, escape_path: bool, out: &mut String) {
        let Some(node) = self.get(id) else { return };
        if node.is_root {
            return;
        }
        if let Some(parent) = node.parent {
            self.fill_path(parent, escape_path, out);
        }
        out.push_str(FILE_SEPARATOR);
        if escape_path {
            out.push_str(&escape(&node.name));
        } else {
            out.push_str(&node.name);
        }
    }

    /// The path of the entry as a list of segments, root excluded.
    pub fn path_segments(&self, id: EntryId) -> Vec<String> {
        let mut list = Vec::new();
        self.fill_segments(id, &mut list);
        list
    }

    fn fill_segments(&self, id: EntryId, list: &mut Vec<String>) {
        let Some(node) = self.get(id) else { return };
        if node.is_root {
            return;
        }
        if let Some(parent) = node.parent {
            self.fill_segments(parent, list);
        }
        list.push(node.name.clone());
    }

    /// Whether the cached children of `id` are missing or stale.
    pub fn needs_fetch(&self, id: EntryId) -> bool {
        let Some(node) = self.get(id) else { return true };
        if node.fetch_time == 0 {
            return true;
        }
        now_ms().saturating_sub(node.fetch_time) > REFRESH_TEST_MS
    }
}
