//! What the loopback endpoint serves: remote files addressed by path and descriptor.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::{FileExt, MetadataExt};
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex};

use bytes::{Bytes, BytesMut};
use nix::errno::Errno;
use xnbd_proto::RemoteStat;

const FIRST_FD: i32 = 3;
const REGULAR_FILE_MODE: u32 = 0o100_644;

/// The server side of the four commands. Errors are remote errnos.
pub trait RemoteStore: Send + Sync {
    fn open(&self, path: &str, flags: i32) -> Result<i32, Errno>;
    fn fstat(&self, fd: i32) -> Result<RemoteStat, Errno>;
    fn setup(&self, fd: i32, queue_depth: u32) -> Result<(), Errno>;
    /// Reads past the end of the file come back short.
    fn read_at(&self, fd: i32, offset: u64, len: usize) -> Result<Bytes, Errno>;
    fn write_at(&self, fd: i32, offset: u64, data: &[u8]) -> Result<(), Errno>;
}

/// Files held in memory. Clones share the same files.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<MemoryInner>>,
}

#[derive(Default)]
struct MemoryInner {
    files: HashMap<String, Vec<u8>>,
    open: HashMap<i32, OpenMemoryFile>,
    next_fd: i32,
}

struct OpenMemoryFile {
    path: String,
    queue_depth: Option<u32>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, path: impl Into<String>, contents: Vec<u8>) {
        let mut inner = self.inner.lock().unwrap();
        inner.files.insert(path.into(), contents);
    }

    pub fn contents(&self, path: &str) -> Option<Vec<u8>> {
        let inner = self.inner.lock().unwrap();
        inner.files.get(path).cloned()
    }

    /// The queue depth an IO_SETUP announced for `fd`, if any.
    pub fn queue_depth_of(&self, fd: i32) -> Option<u32> {
        let inner = self.inner.lock().unwrap();
        inner.open.get(&fd).and_then(|f| f.queue_depth)
    }

    pub fn open_descriptors(&self) -> usize {
        self.inner.lock().unwrap().open.len()
    }
}

impl MemoryInner {
    fn file_mut(&mut self, fd: i32) -> Result<&mut Vec<u8>, Errno> {
        let path = &self.open.get(&fd).ok_or(Errno::EBADF)?.path;
        // unlinked while open
        self.files.get_mut(path).ok_or(Errno::ESTALE)
    }
}

impl RemoteStore for MemoryStore {
    fn open(&self, path: &str, _flags: i32) -> Result<i32, Errno> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.files.contains_key(path) {
            return Err(Errno::ENOENT);
        }
        let fd = FIRST_FD + inner.next_fd;
        inner.next_fd += 1;
        inner.open.insert(
            fd,
            OpenMemoryFile {
                path: path.to_owned(),
                queue_depth: None,
            },
        );
        Ok(fd)
    }

    fn fstat(&self, fd: i32) -> Result<RemoteStat, Errno> {
        let mut inner = self.inner.lock().unwrap();
        let size = inner.file_mut(fd)?.len() as u64;
        Ok(RemoteStat {
            size,
            mode: REGULAR_FILE_MODE,
            blksize: 4096,
            blocks: size.div_ceil(512),
            mtime: 0,
        })
    }

    fn setup(&self, fd: i32, queue_depth: u32) -> Result<(), Errno> {
        let mut inner = self.inner.lock().unwrap();
        let file = inner.open.get_mut(&fd).ok_or(Errno::EBADF)?;
        file.queue_depth = Some(queue_depth);
        Ok(())
    }

    fn read_at(&self, fd: i32, offset: u64, len: usize) -> Result<Bytes, Errno> {
        let mut inner = self.inner.lock().unwrap();
        let file = inner.file_mut(fd)?;
        let start = usize::try_from(offset).map_err(|_| Errno::EINVAL)?;
        if start >= file.len() {
            return Ok(Bytes::new());
        }
        let end = start.saturating_add(len).min(file.len());
        Ok(Bytes::copy_from_slice(&file[start..end]))
    }

    fn write_at(&self, fd: i32, offset: u64, data: &[u8]) -> Result<(), Errno> {
        let mut inner = self.inner.lock().unwrap();
        let file = inner.file_mut(fd)?;
        let start = usize::try_from(offset).map_err(|_| Errno::EINVAL)?;
        let end = start.checked_add(data.len()).ok_or(Errno::EFBIG)?;
        if end > file.len() {
            file.resize(end, 0);
        }
        file[start..end].copy_from_slice(data);
        Ok(())
    }
}

/// Files below a local directory, accessed with positional reads and writes.
pub struct DirStore {
    root: PathBuf,
    open: Mutex<OpenFiles>,
}

#[derive(Default)]
struct OpenFiles {
    files: HashMap<i32, Arc<OpenDirFile>>,
    next_fd: i32,
}

struct OpenDirFile {
    file: File,
    queue_depth: Mutex<Option<u32>>,
}

impl DirStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        DirStore {
            root: root.into(),
            open: Mutex::new(OpenFiles::default()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn queue_depth_of(&self, fd: i32) -> Option<u32> {
        let file = self.file(fd).ok()?;
        let depth = *file.queue_depth.lock().unwrap();
        depth
    }

    /// Paths are taken relative to the root and may not climb out of it.
    fn resolve(&self, path: &str) -> Result<PathBuf, Errno> {
        let relative = Path::new(path.trim_start_matches('/'));
        let mut resolved = self.root.clone();
        for component in relative.components() {
            match component {
                Component::Normal(part) => resolved.push(part),
                Component::CurDir => {}
                Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                    return Err(Errno::EACCES)
                }
            }
        }
        Ok(resolved)
    }

    fn file(&self, fd: i32) -> Result<Arc<OpenDirFile>, Errno> {
        let open = self.open.lock().unwrap();
        open.files.get(&fd).cloned().ok_or(Errno::EBADF)
    }
}

fn errno_of(e: std::io::Error) -> Errno {
    Errno::from_i32(e.raw_os_error().unwrap_or(Errno::EIO as i32))
}

impl RemoteStore for DirStore {
    fn open(&self, path: &str, flags: i32) -> Result<i32, Errno> {
        let resolved = self.resolve(path)?;
        let access = flags & nix::fcntl::OFlag::O_ACCMODE.bits();
        let file = OpenOptions::new()
            .read(true)
            .write(access != nix::fcntl::OFlag::O_RDONLY.bits())
            .open(resolved)
            .map_err(errno_of)?;
        let mut open = self.open.lock().unwrap();
        let fd = FIRST_FD + open.next_fd;
        open.next_fd += 1;
        open.files.insert(
            fd,
            Arc::new(OpenDirFile {
                file,
                queue_depth: Mutex::new(None),
            }),
        );
        Ok(fd)
    }

    fn fstat(&self, fd: i32) -> Result<RemoteStat, Errno> {
        let meta = self.file(fd)?.file.metadata().map_err(errno_of)?;
        Ok(RemoteStat {
            size: meta.size(),
            mode: meta.mode(),
            blksize: meta.blksize() as u32,
            blocks: meta.blocks(),
            mtime: meta.mtime(),
        })
    }

    fn setup(&self, fd: i32, queue_depth: u32) -> Result<(), Errno> {
        let file = self.file(fd)?;
        *file.queue_depth.lock().unwrap() = Some(queue_depth);
        Ok(())
    }

    fn read_at(&self, fd: i32, offset: u64, len: usize) -> Result<Bytes, Errno> {
        let file = self.file(fd)?;
        let mut buf = BytesMut::zeroed(len);
        let mut filled = 0;
        while filled < len {
            match file.file.read_at(&mut buf[filled..], offset + filled as u64) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(errno_of(e)),
            }
        }
        buf.truncate(filled);
        Ok(buf.freeze())
    }

    fn write_at(&self, fd: i32, offset: u64, data: &[u8]) -> Result<(), Errno> {
        let file = self.file(fd)?;
        file.file.write_all_at(data, offset).map_err(errno_of)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_store_serves_reads_and_writes() {
        let store = MemoryStore::new();
        store.insert("/a", vec![1; 8]);
        assert_eq!(store.open("/missing", 0), Err(Errno::ENOENT));

        let fd = store.open("/a", xnbd_proto::OPEN_FLAGS_RDWR).unwrap();
        assert_eq!(store.fstat(fd).unwrap().size, 8);
        store.write_at(fd, 6, &[2, 2, 2, 2]).unwrap();
        assert_eq!(store.contents("/a").unwrap(), vec![1, 1, 1, 1, 1, 1, 2, 2, 2, 2]);
        assert_eq!(&store.read_at(fd, 4, 100).unwrap()[..], &[1, 1, 2, 2, 2, 2]);
        assert!(store.read_at(fd, 100, 4).unwrap().is_empty());

        assert_eq!(store.queue_depth_of(fd), None);
        store.setup(fd, 64).unwrap();
        assert_eq!(store.queue_depth_of(fd), Some(64));
        assert_eq!(store.fstat(fd + 1), Err(Errno::EBADF));
    }

    #[test]
    fn dir_store_uses_positional_io() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("disk.img"), vec![0u8; 4096]).unwrap();
        let store = DirStore::new(dir.path());

        let fd = store.open("/disk.img", xnbd_proto::OPEN_FLAGS_RDWR).unwrap();
        let stat = store.fstat(fd).unwrap();
        assert_eq!(stat.size, 4096);
        assert_eq!(stat.mode & 0o170_000, 0o100_000);

        store.write_at(fd, 512, b"hello").unwrap();
        assert_eq!(&store.read_at(fd, 512, 5).unwrap()[..], b"hello");
        assert_eq!(store.read_at(fd, 4094, 16).unwrap().len(), 2);

        store.setup(fd, 32).unwrap();
        assert_eq!(store.queue_depth_of(fd), Some(32));
    }

    #[test]
    fn dir_store_stays_below_its_root() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirStore::new(dir.path().join("exports"));
        assert_eq!(store.open("../secret", 0), Err(Errno::EACCES));
        assert_eq!(store.open("/nope", 0), Err(Errno::ENOENT));
    }
}
