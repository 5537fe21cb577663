use std::cmp;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use byteorder::{ByteOrder, LittleEndian};
use thiserror::Error;

use crate::device::Device;
use crate::entry::{EntryId, FileKind};
use crate::listing::FileListingService;
use crate::monitor::SyncProgressMonitor;
use crate::transport::SyncChannel;

pub const ID_OKAY: &[u8; 4] = b"OKAY";
pub const ID_FAIL: &[u8; 4] = b"FAIL";
pub const ID_STAT: &[u8; 4] = b"STAT";
pub const ID_RECV: &[u8; 4] = b"RECV";
pub const ID_DATA: &[u8; 4] = b"DATA";
pub const ID_DONE: &[u8; 4] = b"DONE";
pub const ID_SEND: &[u8; 4] = b"SEND";

const S_ISOCK: u32 = 0xC000; // type: socket
const S_IFLNK: u32 = 0xA000; // type: symbolic link
const S_IFREG: u32 = 0x8000; // type: regular file
const S_IFBLK: u32 = 0x6000; // type: block device
const S_IFDIR: u32 = 0x4000; // type: directory
const S_IFCHR: u32 = 0x2000; // type: character device
const S_IFIFO: u32 = 0x1000; // type: fifo

/// Maximum payload of a single DATA frame.
pub const SYNC_DATA_MAX: usize = 64 * 1024;
/// Maximum length in bytes of a remote path in a sync request.
pub const REMOTE_PATH_MAX_LENGTH: usize = 1024;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("transfer was cancelled")]
    Cancelled,
    #[error("timeout on device I/O")]
    Timeout,
    #[error("I/O error during sync")]
    Io(#[from] std::io::Error),
    #[error("transfer protocol error: {}", .message.as_deref().unwrap_or("unexpected response"))]
    TransferProtocol { message: Option<String> },
    #[error("device announced a chunk larger than {SYNC_DATA_MAX} bytes")]
    BufferOverrun,
    #[error("remote object doesn't exist")]
    NoRemoteObject,
    #[error("pull destination doesn't exist")]
    NoDirTarget,
    #[error("pull destination is not a directory")]
    TargetIsFile,
    #[error("local file doesn't exist")]
    NoLocalFile,
    #[error("local path is a directory")]
    LocalIsDirectory,
    #[error("remote target is not a directory")]
    RemoteIsFile,
    #[error("remote path exceeds {REMOTE_PATH_MAX_LENGTH} bytes")]
    RemotePathLength,
    #[error("cannot open local file for writing")]
    FileWriteError,
}

/// Builds an 8-byte request: 4-byte command plus a little-endian u32 value.
fn create_req(command: &[u8; 4], value: u32) -> [u8; 8] {
    let mut array = [0u8; 8];
    array[..4].copy_from_slice(command);
    LittleEndian::write_u32(&mut array[4..8], value);
    array
}

/// Builds a file request: 4-byte command, path length, path bytes.
fn create_file_req(command: &[u8; 4], path: &[u8]) -> Vec<u8> {
    let mut array = vec![0u8; 8 + path.len()];
    array[..4].copy_from_slice(command);
    LittleEndian::write_u32(&mut array[4..8], path.len() as u32);
    array[8..].copy_from_slice(path);
    array
}

/// Builds a SEND request: the payload is the path followed by a comma and the
/// permission mode in ASCII decimal.
fn create_send_file_req(command: &[u8; 4], path: &[u8], mode: u32) -> Vec<u8> {
    let mode_str = format!(",{}", mode & 0o777);
    let mode_content = mode_str.as_bytes();

    let mut array = vec![0u8; 8 + path.len() + mode_content.len()];
    array[..4].copy_from_slice(command);
    LittleEndian::write_u32(&mut array[4..8], (path.len() + mode_content.len()) as u32);
    array[8..8 + path.len()].copy_from_slice(path);
    array[8 + path.len()..].copy_from_slice(mode_content);
    array
}

/// Checks that the result buffer starts with the given 4-byte code.
fn check_result(result: &[u8], code: &[u8; 4]) -> bool {
    result.len() >= 4 && &result[..4] == code
}

/// Projects a POSIX mode word onto an entry kind. Tested in mask order,
/// first match wins.
pub fn file_type_from_mode(mode: u32) -> FileKind {
    if mode & S_ISOCK == S_ISOCK {
        return FileKind::Socket;
    }
    if mode & S_IFLNK == S_IFLNK {
        return FileKind::Link;
    }
    if mode & S_IFREG == S_IFREG {
        return FileKind::File;
    }
    if mode & S_IFBLK == S_IFBLK {
        return FileKind::Block;
    }
    if mode & S_IFDIR == S_IFDIR {
        return FileKind::Directory;
    }
    if mode & S_IFCHR == S_IFCHR {
        return FileKind::Character;
    }
    if mode & S_IFIFO == S_IFIFO {
        return FileKind::Fifo;
    }
    FileKind::Other
}

/// Client for the adb `sync:` service: stat, pull and push of remote files
/// over a dedicated channel. A service instance must not be shared between
/// concurrent transfers.
pub struct SyncService {
    channel: Box<dyn SyncChannel>,
    /// Buffer used to send data. Allocated when needed and reused afterward.
    buffer: Vec<u8>,
}

impl SyncService {
    /// Opens the sync connection on `device`. Returns `Ok(None)` when adb
    /// refuses the connection, which can happen when the device went away.
    /// Must succeed before any pull or push call.
    pub fn open(device: &Device) -> Result<Option<Self>, SyncError> {
        match device.open_sync_channel()? {
            Some(channel) => Ok(Some(Self::over(Box::new(channel)))),
            None => Ok(None),
        }
    }

    fn over(channel: Box<dyn SyncChannel>) -> Self {
        Self { channel, buffer: Vec::new() }
    }

    pub fn set_timeout(&mut self, dur: Duration) {
        self.channel.set_timeout(dur);
    }

    pub fn close(&mut self) {
        self.channel.close();
    }

    /// Returns the mode word of the remote file, or `None` when the device
    /// answered with something other than STAT (unknown, attempt anyway).
    pub fn read_mode(&mut self, path: &str) -> Result<Option<u32>, SyncError> {
        let msg = create_file_req(ID_STAT, path.as_bytes());
        self.channel.write_all(&msg)?;

        // response is 4 ints: id, mode, size, time
        let mut stat_result = [0u8; 16];
        self.channel.read_exact(&mut stat_result)?;

        if !check_result(&stat_result, ID_STAT) {
            return Ok(None);
        }
        Ok(Some(LittleEndian::read_u32(&stat_result[4..8])))
    }

    /// Pulls remote entries (files or folders, recursively) into the local
    /// directory `local_path`. `fls` must be the listing service owning the
    /// entries.
    pub fn pull(
        &mut self,
        fls: &FileListingService,
        entries: &[EntryId],
        local_path: &Path,
        monitor: &dyn SyncProgressMonitor,
    ) -> Result<(), SyncError> {
        // first we check the destination is a directory and exists
        if !local_path.exists() {
            return Err(SyncError::NoDirTarget);
        }
        if !local_path.is_dir() {
            return Err(SyncError::TargetIsFile);
        }

        // compute the amount of work to move
        let total = total_remote_file_size(fls, entries);
        monitor.start(total);

        self.do_pull(fls, entries, local_path, monitor)?;

        monitor.stop();
        Ok(())
    }

    /// Pulls a single file known to the listing service, so the monitor gets
    /// the real size up front.
    pub fn pull_entry(
        &mut self,
        fls: &FileListingService,
        entry: EntryId,
        local_path: &Path,
        monitor: &dyn SyncProgressMonitor,
    ) -> Result<(), SyncError> {
        let total = fls.entry(entry).map(|e| e.size_value()).unwrap_or(0);
        monitor.start(total);

        self.do_pull_file(&fls.full_path(entry), local_path, monitor)?;

        monitor.stop();
        Ok(())
    }

    /// Pulls a single file addressed by its remote path. The size is unknown
    /// ahead of time, so the monitor only sees relative progress.
    pub fn pull_file(
        &mut self,
        remote_path: &str,
        local_path: &Path,
        monitor: &dyn SyncProgressMonitor,
    ) -> Result<(), SyncError> {
        match self.read_mode(remote_path)? {
            Some(0) => return Err(SyncError::NoRemoteObject),
            // mode unknown: attempt the download anyway
            Some(_) | None => {}
        }

        monitor.start(0);

        self.do_pull_file(remote_path, local_path, monitor)?;

        monitor.stop();
        Ok(())
    }

    /// Pushes local files into the remote directory entry.
    pub fn push(
        &mut self,
        locals: &[PathBuf],
        fls: &FileListingService,
        remote: EntryId,
        monitor: &dyn SyncProgressMonitor,
    ) -> Result<(), SyncError> {
        let is_dir = fls.entry(remote).map(|e| e.is_directory()).unwrap_or(false);
        if !is_dir {
            return Err(SyncError::RemoteIsFile);
        }

        let total = total_local_file_size(locals);
        monitor.start(total);

        self.do_push(locals, &fls.full_path(remote), monitor)?;

        monitor.stop();
        Ok(())
    }

    /// Pushes a single local file to the remote path.
    pub fn push_file(
        &mut self,
        local: &Path,
        remote: &str,
        monitor: &dyn SyncProgressMonitor,
    ) -> Result<(), SyncError> {
        if !local.exists() {
            return Err(SyncError::NoLocalFile);
        }
        if local.is_dir() {
            return Err(SyncError::LocalIsDirectory);
        }

        monitor.start(local.metadata()?.len());

        self.do_push_file(local, remote, monitor)?;

        monitor.stop();
        Ok(())
    }

    fn do_pull(
        &mut self,
        fls: &FileListingService,
        entries: &[EntryId],
        local_path: &Path,
        monitor: &dyn SyncProgressMonitor,
    ) -> Result<(), SyncError> {
        for &e in entries {
            if monitor.is_cancelled() {
                return Err(SyncError::Cancelled);
            }

            let Some(entry) = fls.entry(e) else { continue };
            match entry.kind {
                FileKind::Directory => {
                    monitor.start_sub_task(&fls.full_path(e));
                    let dest = local_path.join(&entry.name);
                    fs::create_dir_all(&dest)?;

                    // the total-size pass already ran ls here, so the cache
                    // is warm
                    let children = fls.get_children(e, true, None);
                    self.do_pull(fls, &children, &dest, monitor)?;
                    monitor.advance(1);
                }
                FileKind::File => {
                    monitor.start_sub_task(&fls.full_path(e));
                    let dest = local_path.join(&entry.name);
                    self.do_pull_file(&fls.full_path(e), &dest, monitor)?;
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn do_pull_file(
        &mut self,
        remote_path: &str,
        local_path: &Path,
        monitor: &dyn SyncProgressMonitor,
    ) -> Result<(), SyncError> {
        if remote_path.len() > REMOTE_PATH_MAX_LENGTH {
            return Err(SyncError::RemotePathLength);
        }

        let msg = create_file_req(ID_RECV, remote_path.as_bytes());
        self.channel.write_all(&msg)?;

        let mut fos = File::create(local_path).map_err(|e| {
            log::error!(
                "failed to open local file {} for writing: {}",
                local_path.display(),
                e
            );
            SyncError::FileWriteError
        })?;

        let mut header = [0u8; 8];
        let mut data = vec![0u8; SYNC_DATA_MAX];

        loop {
            if monitor.is_cancelled() {
                return Err(SyncError::Cancelled);
            }

            self.channel.read_exact(&mut header)?;
            if check_result(&header, ID_DONE) {
                break;
            }
            if !check_result(&header, ID_DATA) {
                let message = self.read_error_message(&header)?;
                return Err(SyncError::TransferProtocol { message });
            }

            let length = LittleEndian::read_u32(&header[4..8]) as usize;
            if length > SYNC_DATA_MAX {
                return Err(SyncError::BufferOverrun);
            }

            self.channel.read_exact(&mut data[..length])?;
            fos.write_all(&data[..length])?;
            monitor.advance(length as u64);
        }

        fos.flush()?;
        Ok(())
    }

    fn do_push(
        &mut self,
        files: &[PathBuf],
        remote_path: &str,
        monitor: &dyn SyncProgressMonitor,
    ) -> Result<(), SyncError> {
        for f in files {
            if monitor.is_cancelled() {
                return Err(SyncError::Cancelled);
            }

            let Ok(meta) = f.metadata() else { continue };
            let Some(name) = f.file_name() else { continue };
            let name = name.to_string_lossy();

            if meta.is_dir() {
                let dest = format!("{}/{}", remote_path, name);
                monitor.start_sub_task(&dest);
                self.do_push(&list_dir(f), &dest, monitor)?;
                monitor.advance(1);
            } else if meta.is_file() {
                let remote_file = format!("{}/{}", remote_path, name);
                monitor.start_sub_task(&remote_file);
                self.do_push_file(f, &remote_file, monitor)?;
            }
        }
        Ok(())
    }

    fn do_push_file(
        &mut self,
        local_path: &Path,
        remote_path: &str,
        monitor: &dyn SyncProgressMonitor,
    ) -> Result<(), SyncError> {
        if remote_path.len() > REMOTE_PATH_MAX_LENGTH {
            return Err(SyncError::RemotePathLength);
        }

        let mut fis = File::open(local_path)?;

        let msg = create_send_file_req(ID_SEND, remote_path.as_bytes(), 0o644);
        self.channel.write_all(&msg)?;

        // chunk buffer: DATA tag, length, then up to SYNC_DATA_MAX payload
        if self.buffer.is_empty() {
            self.buffer.resize(SYNC_DATA_MAX + 8, 0);
            self.buffer[..4].copy_from_slice(ID_DATA);
        }

        loop {
            if monitor.is_cancelled() {
                return Err(SyncError::Cancelled);
            }

            let read_count = read_up_to(&mut fis, &mut self.buffer[8..])?;
            if read_count == 0 {
                break;
            }

            LittleEndian::write_u32(&mut self.buffer[4..8], read_count as u32);
            self.channel.write_all(&self.buffer[..read_count + 8])?;
            monitor.advance(read_count as u64);
        }

        // DONE carries the push timestamp in epoch seconds
        let now = time::OffsetDateTime::now_utc().unix_timestamp() as u32;
        self.channel.write_all(&create_req(ID_DONE, now))?;

        let mut result = [0u8; 8];
        self.channel.read_exact(&mut result)?;
        if !check_result(&result, ID_OKAY) {
            let message = self.read_error_message(&result)?;
            return Err(SyncError::TransferProtocol { message });
        }
        Ok(())
    }

    /// Reads the message of a FAIL response whose 8-byte header is already
    /// in hand.
    fn read_error_message(&mut self, header: &[u8]) -> Result<Option<String>, SyncError> {
        if check_result(header, ID_FAIL) {
            let len = LittleEndian::read_u32(&header[4..8]) as usize;
            if len > 0 {
                let mut raw = vec![0u8; cmp::min(len, SYNC_DATA_MAX)];
                self.channel.read_exact(&mut raw)?;
                let message = String::from_utf8_lossy(&raw).into_owned();
                log::error!("transfer error: {}", message);
                return Ok(Some(message));
            }
        }
        Ok(None)
    }
}

/// Recursive amount of work in a list of remote entries: byte size for
/// files, a weight of 1 per directory traversed.
fn total_remote_file_size(fls: &FileListingService, entries: &[EntryId]) -> u64 {
    let mut count = 0;
    for &e in entries {
        let Some(entry) = fls.entry(e) else { continue };
        match entry.kind {
            FileKind::Directory => {
                let children = fls.get_children(e, false, None);
                count += total_remote_file_size(fls, &children) + 1;
            }
            FileKind::File => count += entry.size_value(),
            _ => {}
        }
    }
    count
}

/// Same policy as [`total_remote_file_size`], using on-disk sizes. This does
/// not check for circular links.
fn total_local_file_size(files: &[PathBuf]) -> u64 {
    let mut count = 0;
    for f in files {
        let Ok(meta) = f.metadata() else { continue };
        if meta.is_dir() {
            count += total_local_file_size(&list_dir(f)) + 1;
        } else if meta.is_file() {
            count += meta.len();
        }
    }
    count
}

fn list_dir(dir: &Path) -> Vec<PathBuf> {
    fs::read_dir(dir)
        .map(|rd| rd.filter_map(|e| e.ok()).map(|e| e.path()).collect())
        .unwrap_or_default()
}

/// Reads from `fis` until `buf` is full or the file is exhausted.
fn read_up_to(fis: &mut File, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut read = 0;
    while read < buf.len() {
        let n = fis.read(&mut buf[read..])?;
        if n == 0 {
            break;
        }
        read += n;
    }
    Ok(read)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
    use std::sync::Mutex;
    use tempfile::tempdir;

    /// Channel fed by a script of device frames; captures everything the
    /// client writes into a buffer shared with the test.
    struct ScriptedChannel {
        input: Vec<u8>,
        pos: usize,
        output: std::sync::Arc<Mutex<Vec<u8>>>,
    }

    impl ScriptedChannel {
        fn new(input: Vec<u8>) -> (Self, std::sync::Arc<Mutex<Vec<u8>>>) {
            let output = std::sync::Arc::new(Mutex::new(Vec::new()));
            (Self { input, pos: 0, output: output.clone() }, output)
        }
    }

    impl SyncChannel for ScriptedChannel {
        fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), SyncError> {
            if self.pos + buf.len() > self.input.len() {
                return Err(SyncError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "script exhausted",
                )));
            }
            buf.copy_from_slice(&self.input[self.pos..self.pos + buf.len()]);
            self.pos += buf.len();
            Ok(())
        }

        fn write_all(&mut self, data: &[u8]) -> Result<(), SyncError> {
            self.output.lock().unwrap().extend_from_slice(data);
            Ok(())
        }

        fn set_timeout(&mut self, _dur: Duration) {}

        fn close(&mut self) {}
    }

    #[derive(Default)]
    struct RecordingMonitor {
        started: AtomicU64,
        stopped: AtomicU64,
        advanced: Mutex<Vec<u64>>,
        cancel_after: Option<u64>,
        cancelled: AtomicBool,
    }

    impl RecordingMonitor {
        fn cancelling_after(chunks: u64) -> Self {
            Self { cancel_after: Some(chunks), ..Default::default() }
        }
    }

    impl SyncProgressMonitor for RecordingMonitor {
        fn start(&self, _total_work: u64) {
            self.started.fetch_add(1, Ordering::SeqCst);
        }

        fn stop(&self) {
            self.stopped.fetch_add(1, Ordering::SeqCst);
        }

        fn is_cancelled(&self) -> bool {
            self.cancelled.load(Ordering::SeqCst)
        }

        fn start_sub_task(&self, _name: &str) {}

        fn advance(&self, work: u64) {
            let mut advanced = self.advanced.lock().unwrap();
            advanced.push(work);
            if let Some(after) = self.cancel_after {
                if advanced.len() as u64 >= after {
                    self.cancelled.store(true, Ordering::SeqCst);
                }
            }
        }
    }

    fn data_frame(payload: &[u8]) -> Vec<u8> {
        create_file_req(ID_DATA, payload)
    }

    fn service_over(input: Vec<u8>) -> (SyncService, std::sync::Arc<Mutex<Vec<u8>>>) {
        let (chan, output) = ScriptedChannel::new(input);
        (SyncService::over(Box::new(chan)), output)
    }

    #[test]
    fn test_create_req() {
        let req = create_req(ID_DONE, 0x01020304);
        assert_eq!(&req[..4], b"DONE");
        assert_eq!(&req[4..], &[0x04, 0x03, 0x02, 0x01]);
    }

    #[test]
    fn test_create_file_req() {
        let req = create_file_req(ID_RECV, b"/tmp/x");
        assert_eq!(&req[..4], b"RECV");
        assert_eq!(LittleEndian::read_u32(&req[4..8]), 6);
        assert_eq!(&req[8..], b"/tmp/x");
    }

    #[test]
    fn test_create_send_file_req() {
        let req = create_send_file_req(ID_SEND, b"/data/local/tmp/f", 0o100644);
        assert_eq!(&req[..4], b"SEND");
        let payload = &req[8..];
        assert_eq!(LittleEndian::read_u32(&req[4..8]) as usize, payload.len());
        assert_eq!(payload, b"/data/local/tmp/f,420");
    }

    #[test]
    fn test_file_type_from_mode() {
        assert_eq!(file_type_from_mode(0xC1FF), FileKind::Socket);
        assert_eq!(file_type_from_mode(0xA1FF), FileKind::Link);
        assert_eq!(file_type_from_mode(0o100644), FileKind::File);
        assert_eq!(file_type_from_mode(0x61B0), FileKind::Block);
        assert_eq!(file_type_from_mode(0o40755), FileKind::Directory);
        assert_eq!(file_type_from_mode(0x21B0), FileKind::Character);
        assert_eq!(file_type_from_mode(0x11B0), FileKind::Fifo);
        assert_eq!(file_type_from_mode(0), FileKind::Other);
    }

    #[test]
    fn test_read_mode() {
        let mut input = Vec::new();
        input.extend_from_slice(ID_STAT);
        let mut word = [0u8; 4];
        LittleEndian::write_u32(&mut word, 0o100644);
        input.extend_from_slice(&word);
        input.extend_from_slice(&[0u8; 8]); // size, time
        let (mut service, _) = service_over(input);
        assert_eq!(service.read_mode("/etc/hosts").unwrap(), Some(0o100644));
    }

    #[test]
    fn test_read_mode_unexpected_tag() {
        let mut input = Vec::new();
        input.extend_from_slice(b"WHAT");
        input.extend_from_slice(&[0u8; 12]);
        let (mut service, _) = service_over(input);
        assert_eq!(service.read_mode("/etc/hosts").unwrap(), None);
    }

    #[test]
    fn test_pull_file_happy_path() {
        let mut input = Vec::new();
        // STAT response for the probe
        input.extend_from_slice(ID_STAT);
        let mut word = [0u8; 4];
        LittleEndian::write_u32(&mut word, 0o100644);
        input.extend_from_slice(&word);
        input.extend_from_slice(&[0u8; 8]);
        // two DATA frames then DONE
        input.extend_from_slice(&data_frame(b"abcd"));
        input.extend_from_slice(&data_frame(b"ef"));
        input.extend_from_slice(&create_req(ID_DONE, 0));

        let dir = tempdir().unwrap();
        let dest = dir.path().join("out.bin");
        let monitor = RecordingMonitor::default();

        let (mut service, _) = service_over(input);
        service.pull_file("/tmp/src.bin", &dest, &monitor).unwrap();

        assert_eq!(fs::read(&dest).unwrap(), b"abcdef");
        assert_eq!(*monitor.advanced.lock().unwrap(), vec![4, 2]);
        assert_eq!(monitor.stopped.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_pull_file_protocol_error_carries_message() {
        let mut input = Vec::new();
        input.extend_from_slice(ID_STAT);
        let mut word = [0u8; 4];
        LittleEndian::write_u32(&mut word, 0o100644);
        input.extend_from_slice(&word);
        input.extend_from_slice(&[0u8; 8]);
        // FAIL with a message
        input.extend_from_slice(&create_req(ID_FAIL, 5));
        input.extend_from_slice(b"nope!");

        let dir = tempdir().unwrap();
        let dest = dir.path().join("out.bin");
        let monitor = RecordingMonitor::default();

        let (mut service, _) = service_over(input);
        let err = service.pull_file("/tmp/src.bin", &dest, &monitor).unwrap_err();
        match err {
            SyncError::TransferProtocol { message } => {
                assert_eq!(message.as_deref(), Some("nope!"));
            }
            other => panic!("expected protocol error, got {other:?}"),
        }
    }

    #[test]
    fn test_pull_file_no_remote_object() {
        let mut input = Vec::new();
        input.extend_from_slice(ID_STAT);
        input.extend_from_slice(&[0u8; 12]); // mode 0
        let dir = tempdir().unwrap();
        let dest = dir.path().join("out.bin");
        let monitor = RecordingMonitor::default();

        let (mut service, _) = service_over(input);
        let err = service.pull_file("/missing", &dest, &monitor).unwrap_err();
        assert!(matches!(err, SyncError::NoRemoteObject));
    }

    #[test]
    fn test_pull_file_buffer_overrun() {
        let mut input = Vec::new();
        input.extend_from_slice(ID_STAT);
        let mut word = [0u8; 4];
        LittleEndian::write_u32(&mut word, 0o100644);
        input.extend_from_slice(&word);
        input.extend_from_slice(&[0u8; 8]);
        input.extend_from_slice(&create_req(ID_DATA, (SYNC_DATA_MAX + 1) as u32));

        let dir = tempdir().unwrap();
        let dest = dir.path().join("out.bin");
        let monitor = RecordingMonitor::default();

        let (mut service, _) = service_over(input);
        let err = service.pull_file("/tmp/big", &dest, &monitor).unwrap_err();
        assert!(matches!(err, SyncError::BufferOverrun));
    }

    #[test]
    fn test_pull_file_rejects_oversized_path() {
        let long = format!("/{}", "x".repeat(REMOTE_PATH_MAX_LENGTH));
        let mut input = Vec::new();
        // the STAT probe answers before the path check in do_pull_file
        input.extend_from_slice(ID_STAT);
        let mut word = [0u8; 4];
        LittleEndian::write_u32(&mut word, 0o100644);
        input.extend_from_slice(&word);
        input.extend_from_slice(&[0u8; 8]);

        let dir = tempdir().unwrap();
        let dest = dir.path().join("out.bin");
        let monitor = RecordingMonitor::default();

        let (mut service, _) = service_over(input);
        let err = service.pull_file(&long, &dest, &monitor).unwrap_err();
        assert!(matches!(err, SyncError::RemotePathLength));
    }

    #[test]
    fn test_push_file_happy_path() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("src.bin");
        let payload: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
        File::create(&src).unwrap().write_all(&payload).unwrap();

        let mut input = Vec::new();
        input.extend_from_slice(&create_req(ID_OKAY, 0));

        let monitor = RecordingMonitor::default();
        let (mut service, output) = service_over(input);
        service.push_file(&src, "/data/local/tmp/src.bin", &monitor).unwrap();

        let advanced: u64 = monitor.advanced.lock().unwrap().iter().sum();
        assert_eq!(advanced, payload.len() as u64);
        assert_eq!(monitor.stopped.load(Ordering::SeqCst), 1);

        let output = output.lock().unwrap();
        // SEND header
        assert_eq!(&output[..4], b"SEND");
        let send_len = LittleEndian::read_u32(&output[4..8]) as usize;
        assert_eq!(
            &output[8..8 + send_len],
            b"/data/local/tmp/src.bin,420"
        );
        // first DATA chunk is a full SYNC_DATA_MAX payload
        let first_data = 8 + send_len;
        assert_eq!(&output[first_data..first_data + 4], b"DATA");
        assert_eq!(
            LittleEndian::read_u32(&output[first_data + 4..first_data + 8]) as usize,
            SYNC_DATA_MAX
        );
        // stream ends with DONE
        assert_eq!(&output[output.len() - 8..output.len() - 4], b"DONE");
        // reassemble the pushed payload
        let mut sent = Vec::new();
        let mut pos = first_data;
        while &output[pos..pos + 4] == b"DATA" {
            let len = LittleEndian::read_u32(&output[pos + 4..pos + 8]) as usize;
            sent.extend_from_slice(&output[pos + 8..pos + 8 + len]);
            pos += 8 + len;
        }
        assert_eq!(sent, payload);
    }

    #[test]
    fn test_push_file_fail_response() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("src.bin");
        File::create(&src).unwrap().write_all(b"payload").unwrap();

        let mut input = Vec::new();
        input.extend_from_slice(&create_req(ID_FAIL, 9));
        input.extend_from_slice(b"read-only");

        let monitor = RecordingMonitor::default();
        let (mut service, _) = service_over(input);
        let err = service
            .push_file(&src, "/system/protected", &monitor)
            .unwrap_err();
        match err {
            SyncError::TransferProtocol { message } => {
                assert_eq!(message.as_deref(), Some("read-only"));
            }
            other => panic!("expected protocol error, got {other:?}"),
        }
    }

    #[test]
    fn test_push_file_cancelled_mid_stream_sends_no_done() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("big.bin");
        File::create(&src)
            .unwrap()
            .write_all(&vec![0xABu8; 200 * 1024])
            .unwrap();

        let monitor = RecordingMonitor::cancelling_after(1);
        let (mut service, output) = service_over(Vec::new());
        let err = service.push_file(&src, "/data/local/tmp/big.bin", &monitor).unwrap_err();
        assert!(matches!(err, SyncError::Cancelled));

        let output = output.lock().unwrap();
        assert!(!output.windows(4).any(|w| w == b"DONE"));
    }

    #[test]
    fn test_push_file_local_preconditions() {
        let dir = tempdir().unwrap();
        let monitor = RecordingMonitor::default();

        let (mut service, _) = service_over(Vec::new());
        let err = service
            .push_file(&dir.path().join("absent"), "/tmp/x", &monitor)
            .unwrap_err();
        assert!(matches!(err, SyncError::NoLocalFile));

        let (mut service, _) = service_over(Vec::new());
        let err = service.push_file(dir.path(), "/tmp/x", &monitor).unwrap_err();
        assert!(matches!(err, SyncError::LocalIsDirectory));
    }

    #[test]
    fn test_total_local_file_size() {
        let dir = tempdir().unwrap();
        let sub = dir.path().join("sub");
        fs::create_dir(&sub).unwrap();
        File::create(dir.path().join("a")).unwrap().write_all(&[0u8; 10]).unwrap();
        File::create(sub.join("b")).unwrap().write_all(&[0u8; 32]).unwrap();

        // dir itself weighs 1, nested file counts its bytes
        let total = total_local_file_size(&[dir.path().to_path_buf()]);
        assert_eq!(total, 1 + 10 + 32);
    }
}
