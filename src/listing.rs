// Copyright (C) 2025 HasX
// Licensed under the GNU AGPL v3.0. See LICENSE file for details.
// Website: https://hasx.dev

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, LazyLock, Mutex, MutexGuard};
use std::thread;

use anyhow::Result;
use regex::Regex;

use crate::device::{MultiLineReceiver, ShellExecutor};
use crate::entry::{now_ms, EntryId, FileEntry, FileKind, FileTree, FILE_SEPARATOR, ROOT_LEVEL_APPROVED};

/// Shell command listing installed packages with their apk paths.
const PM_FULL_LISTING: &str = "pm list packages -f";

// One line of `ls -l` output: permissions, owner, group, size, date, time,
// then the name (and link target).
static LS_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^([bcdlsp-][-r][-w][-xsS][-r][-w][-xsS][-r][-w][-xstST])\s+(\S+)\s+(\S+)\s+([\d\s,]*)\s+(\d{4}-\d\d-\d\d)\s+(\d\d:\d\d)\s+(.*)$",
    )
    .expect("ls pattern")
});

// One line of `pm list packages -f` output:
// package:/data/app/myapp.apk=com.mypackage.myapp
static PM_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^package:(.+?)=(.+)$").expect("pm pattern"));

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Consumer of asynchronous listing results.
pub trait ListingReceiver: Send + Sync {
    /// The children of `entry` were (re)computed.
    fn set_children(&self, entry: EntryId, children: &[EntryId]);
    /// A single entry changed after the fact (package name resolution).
    fn refresh_entry(&self, entry: EntryId);
}

#[derive(Clone)]
struct PendingListing {
    entry: EntryId,
    receiver: Arc<dyn ListingReceiver>,
}

struct ListingInner {
    device: Arc<dyn ShellExecutor>,
    tree: Mutex<FileTree>,
    /// FIFO of asynchronous listing jobs. At most one job runs a device
    /// command at any time; the running job sits at the head.
    queue: Mutex<VecDeque<PendingListing>>,
}

/// Parses `ls -l` lines into tree entries under a fixed parent, reusing the
/// parent's previous children so surviving entries keep their identity.
struct LsReceiver {
    inner: Arc<ListingInner>,
    parent: EntryId,
    parent_is_root: bool,
    /// Snapshot of the previous children; matched slots are taken out.
    prior: Vec<Option<EntryId>>,
    /// New children in listing order.
    entries: Vec<EntryId>,
}

impl LsReceiver {
    fn new(inner: Arc<ListingInner>, parent: EntryId) -> Self {
        let tree = lock(&inner.tree);
        let prior = tree.cached_children(parent).into_iter().map(Some).collect();
        let parent_is_root = tree.get(parent).map(|e| e.is_root()).unwrap_or(false);
        drop(tree);
        Self { inner, parent, parent_is_root, prior, entries: Vec::new() }
    }

    /// Takes the previous entry with a matching name out of the snapshot, so
    /// refreshed entries keep their id.
    fn existing_entry(&mut self, tree: &FileTree, name: &str) -> Option<EntryId> {
        for slot in self.prior.iter_mut() {
            if let Some(id) = *slot {
                if tree.get(id).map(|e| e.name == name).unwrap_or(false) {
                    *slot = None;
                    return Some(id);
                }
            }
        }
        None
    }

    fn parse_line(&mut self, tree: &mut FileTree, line: &str) {
        let Some(caps) = LS_PATTERN.captures(line) else { return };

        let mut name = caps[7].to_string();

        // if the parent is root, we only accept selected items
        if self.parent_is_root && !ROOT_LEVEL_APPROVED.contains(&name.as_str()) {
            return;
        }

        let permissions = caps[1].to_string();
        let owner = caps[2].to_string();
        let group = caps[3].to_string();
        let size = caps[4].trim().to_string();
        let date = caps[5].to_string();
        let time = caps[6].to_string();
        let mut info = String::new();

        let mut kind = match permissions.as_bytes()[0] {
            b'-' => FileKind::File,
            b'b' => FileKind::Block,
            b'c' => FileKind::Character,
            b'd' => FileKind::Directory,
            b'l' => FileKind::Link,
            b's' => FileKind::Socket,
            b'p' => FileKind::Fifo,
            _ => FileKind::Other,
        };

        if kind == FileKind::Link {
            if let Some((link_name, target)) = name.split_once(" -> ") {
                let target = target.to_string();
                name = link_name.to_string();

                // a target without separator points inside the same
                // directory, unless it climbs up
                if !target.contains(FILE_SEPARATOR) && target == ".." {
                    kind = FileKind::DirectoryLink;
                }
                info = target;
            }
            // an arrow in front marks the entry as a link
            info = format!("-> {}", info);
        }

        let is_link = matches!(kind, FileKind::Link | FileKind::DirectoryLink);

        let id = match self.existing_entry(tree, &name) {
            Some(id) => {
                if let Some(e) = tree.get_mut(id) {
                    e.kind = kind;
                }
                tree.refresh_app_package_status(id);
                id
            }
            None => tree.new_entry(self.parent, &name, kind),
        };

        if let Some(e) = tree.get_mut(id) {
            e.permissions = permissions;
            e.size = size;
            e.date = date;
            e.time = time;
            e.owner = owner;
            e.group = group;
            if is_link {
                e.info = info;
            }
        }

        self.entries.push(id);
    }

    fn finish_links(&mut self) {
        // TODO: run a second pass to tell file links from directory links
        // by resolving their targets against the listed tree.
    }
}

impl MultiLineReceiver for LsReceiver {
    fn process_new_lines(&mut self, lines: &[String]) {
        let inner = self.inner.clone();
        let mut tree = lock(&inner.tree);
        for line in lines {
            if line.is_empty() {
                continue;
            }
            self.parse_line(&mut tree, line);
        }
    }

    fn is_cancelled(&self) -> bool {
        false
    }
}

/// Applies `pm list packages -f` output to freshly listed children, filling
/// in package names and notifying the listing receiver.
struct PmReceiver {
    inner: Arc<ListingInner>,
    by_path: HashMap<String, EntryId>,
    receiver: Arc<dyn ListingReceiver>,
}

impl MultiLineReceiver for PmReceiver {
    fn process_new_lines(&mut self, lines: &[String]) {
        for line in lines {
            if line.is_empty() {
                continue;
            }
            let Some(caps) = PM_PATTERN.captures(line) else { continue };
            if let Some(&id) = self.by_path.get(&caps[1]) {
                if let Some(e) = lock(&self.inner.tree).get_mut(id) {
                    e.info = caps[2].to_string();
                }
                self.receiver.refresh_entry(id);
            }
        }
    }

    fn is_cancelled(&self) -> bool {
        false
    }
}

/// Browses the device file tree through `ls -l`, with a per-entry cache and
/// optional asynchronous listings serialized against the device.
pub struct FileListingService {
    inner: Arc<ListingInner>,
}

impl FileListingService {
    pub fn new(device: Arc<dyn ShellExecutor>) -> Self {
        Self {
            inner: Arc::new(ListingInner {
                device,
                tree: Mutex::new(FileTree::new()),
                queue: Mutex::new(VecDeque::new()),
            }),
        }
    }

    /// The root entry, created on first use.
    pub fn root(&self) -> EntryId {
        lock(&self.inner.tree).root()
    }

    /// Snapshot of an entry's fields.
    pub fn entry(&self, id: EntryId) -> Option<FileEntry> {
        lock(&self.inner.tree).get(id).cloned()
    }

    pub fn full_path(&self, id: EntryId) -> String {
        lock(&self.inner.tree).full_path(id)
    }

    pub fn find_child(&self, parent: EntryId, name: &str) -> Option<EntryId> {
        lock(&self.inner.tree).find_child(parent, name)
    }

    /// Returns the children of an entry.
    ///
    /// With a fresh cache and `use_cache`, the cached children are returned
    /// directly whether a receiver was supplied or not. Without a receiver
    /// the `ls` runs synchronously on the caller's thread (listing errors
    /// fall back to the possibly stale cache). With a receiver the listing
    /// is queued behind any other asynchronous listing for the device and
    /// this returns an empty list immediately.
    pub fn get_children(
        &self,
        entry: EntryId,
        use_cache: bool,
        receiver: Option<Arc<dyn ListingReceiver>>,
    ) -> Vec<EntryId> {
        {
            let tree = lock(&self.inner.tree);
            if use_cache && !tree.needs_fetch(entry) {
                return tree.cached_children(entry);
            }
        }

        let Some(receiver) = receiver else {
            do_ls(&self.inner, entry);
            return lock(&self.inner.tree).cached_children(entry);
        };

        submit(&self.inner, PendingListing { entry, receiver });
        Vec::new()
    }

    /// Explicit synchronous listing; unlike [`FileListingService::get_children`]
    /// it ignores the cache and surfaces listing errors.
    pub fn get_children_sync(&self, entry: EntryId) -> Result<Vec<EntryId>> {
        do_ls_and_throw(&self.inner, entry)?;
        Ok(lock(&self.inner.tree).cached_children(entry))
    }
}

/// Best-effort listing: errors are swallowed and the stale cache stands.
fn do_ls(inner: &Arc<ListingInner>, entry: EntryId) {
    if let Err(e) = do_ls_and_throw(inner, entry) {
        log::debug!("ls failed, keeping cached listing: {:#}", e);
    }
}

fn do_ls_and_throw(inner: &Arc<ListingInner>, entry: EntryId) -> Result<()> {
    let command = format!("ls -l {}", lock(&inner.tree).escaped_path(entry));

    let mut receiver = LsReceiver::new(inner.clone(), entry);
    inner.device.execute_shell_command(&command, &mut receiver)?;

    receiver.finish_links();

    let children = std::mem::take(&mut receiver.entries);
    let mut tree = lock(&inner.tree);
    if let Some(e) = tree.get_mut(entry) {
        e.fetch_time = now_ms();
    }
    tree.set_children(entry, children);
    Ok(())
}

/// Enqueues an asynchronous listing. The worker is started only when the
/// queue was empty; otherwise the running worker picks the job up in FIFO
/// order, so at most one device command is ever in flight.
fn submit(inner: &Arc<ListingInner>, job: PendingListing) {
    let mut queue = lock(&inner.queue);
    queue.push_back(job);
    if queue.len() == 1 {
        let inner = inner.clone();
        let spawned = thread::Builder::new()
            .name("remote-ls".to_string())
            .spawn(move || worker_loop(inner));
        if let Err(e) = spawned {
            log::warn!("failed to spawn listing worker: {}", e);
            queue.pop_back();
        }
    }
}

fn worker_loop(inner: Arc<ListingInner>) {
    loop {
        let Some(job) = lock(&inner.queue).front().cloned() else { break };

        run_listing_job(&inner, &job);

        let mut queue = lock(&inner.queue);
        queue.pop_front();
        if queue.is_empty() {
            break;
        }
    }
}

fn run_listing_job(inner: &Arc<ListingInner>, job: &PendingListing) {
    do_ls(inner, job.entry);

    let children = lock(&inner.tree).cached_children(job.entry);
    job.receiver.set_children(job.entry, &children);

    // App directories get a follow-up pass that resolves package names
    // through the package manager. Failures here are ignored.
    let first_is_package = {
        let tree = lock(&inner.tree);
        children
            .first()
            .and_then(|&c| tree.get(c))
            .map(|e| e.is_application_package())
            .unwrap_or(false)
    };
    if first_is_package {
        let by_path = {
            let tree = lock(&inner.tree);
            children
                .iter()
                .map(|&c| (tree.full_path(c), c))
                .collect::<HashMap<_, _>>()
        };
        let mut pm = PmReceiver {
            inner: inner.clone(),
            by_path,
            receiver: job.receiver.clone(),
        };
        if let Err(e) = inner.device.execute_shell_command(PM_FULL_LISTING, &mut pm) {
            log::debug!("package listing failed: {:#}", e);
        }
    }
}
