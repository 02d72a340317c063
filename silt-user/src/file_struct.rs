//! File state of a process.
//!
//! Every process maps small integers to its open files. Descriptors 0
//! and 1 are wired to the keyboard and the console and never appear in
//! the table; real files start at 2. Descriptor numbers are handed out
//! by a per-process counter that only grows, so a closed descriptor is
//! never reissued to the same process.
//!
//! `exec` hands a child copies of the parent's descriptors. The copies
//! share the open-file object underneath, position included, so two
//! processes appending through an inherited descriptor interleave
//! rather than overwrite. Closing is per process: the object lives
//! until the last table lets go.

use silt::fs::Sector;
use silt::sync::Mutex;
use silt::KernelError;
use silt_fs::file::FileHandle;
use silt_fs::ROOT_SECTOR;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Descriptor wired to keyboard input.
pub const STDIN_FD: usize = 0;

/// Descriptor wired to console output.
pub const STDOUT_FD: usize = 1;

/// Most files one process may hold open at once.
const MAX_OPEN_FILES: usize = 1024;

/// An open file as seen from a descriptor table: shared with every
/// process that inherited the descriptor.
pub type SharedFile = Arc<Mutex<FileHandle>>;

/// The per-process file state: working directory plus descriptor table.
pub struct FileStruct {
    /// Sector of the current working directory's inode.
    pub cwd: Sector,
    files: BTreeMap<usize, SharedFile>,
    max_fd: usize,
}

impl FileStruct {
    /// Creates the file state of a fresh process, rooted at `/`.
    pub fn new() -> Self {
        Self {
            cwd: ROOT_SECTOR,
            files: BTreeMap::new(),
            max_fd: 2,
        }
    }

    /// The file state a child starts with: same working directory, same
    /// descriptors, shared open-file objects.
    pub fn inherit(&self) -> Self {
        Self {
            cwd: self.cwd,
            files: self.files.clone(),
            max_fd: self.max_fd,
        }
    }

    /// Installs `file`, returning its new descriptor.
    ///
    /// # Errors
    ///
    /// [`KernelError::TooManyOpenFile`] once the process holds
    /// 1024 open files.
    pub fn install(&mut self, file: FileHandle) -> Result<usize, KernelError> {
        if self.files.len() >= MAX_OPEN_FILES {
            return Err(KernelError::TooManyOpenFile);
        }
        let fd = self.max_fd;
        self.max_fd += 1;
        self.files.insert(fd, Arc::new(Mutex::new(file)));
        Ok(fd)
    }

    /// The open file behind `fd`, if any. Descriptors below 2 and ones
    /// never issued resolve to nothing.
    pub fn get(&self, fd: usize) -> Option<SharedFile> {
        if fd < 2 || fd >= self.max_fd {
            return None;
        }
        self.files.get(&fd).cloned()
    }

    /// Removes `fd` from the table, returning its file.
    pub fn remove(&mut self, fd: usize) -> Option<SharedFile> {
        if fd < 2 {
            return None;
        }
        self.files.remove(&fd)
    }

    /// Closes every open descriptor.
    pub fn drain(&mut self) {
        self.files.clear();
    }

    /// Number of open descriptors.
    pub fn open_count(&self) -> usize {
        self.files.len()
    }
}

impl Default for FileStruct {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use silt::fs::MemDisk;
    use silt_fs::FileSys;

    fn handle(fs: &FileSys, name: &str) -> FileHandle {
        fs.create(name, 0, false, ROOT_SECTOR).unwrap();
        fs.open(name, ROOT_SECTOR).unwrap()
    }

    #[test]
    fn descriptors_start_at_two_and_never_repeat() {
        let fs = FileSys::format(Arc::new(MemDisk::new(256))).unwrap();
        let mut table = FileStruct::new();

        let a = table.install(handle(&fs, "a")).unwrap();
        let b = table.install(handle(&fs, "b")).unwrap();
        assert_eq!((a, b), (2, 3));

        table.remove(a).unwrap();
        let c = table.install(handle(&fs, "c")).unwrap();
        assert_eq!(c, 4);

        assert!(table.get(a).is_none());
        assert!(table.get(b).is_some());
        assert!(table.get(0).is_none());
        assert!(table.get(1).is_none());
        assert!(table.get(99).is_none());
    }

    #[test]
    fn inherited_descriptors_share_position() {
        let fs = FileSys::format(Arc::new(MemDisk::new(256))).unwrap();
        let mut parent = FileStruct::new();
        let fd = parent.install(handle(&fs, "log")).unwrap();

        let child = parent.inherit();
        parent.get(fd).unwrap().lock().write(b"aa").unwrap();
        child.get(fd).unwrap().lock().write(b"bb").unwrap();

        let f = fs.open("log", ROOT_SECTOR).unwrap();
        let mut out = [0u8; 4];
        assert_eq!(f.read_at(&mut out, 0).unwrap(), 4);
        assert_eq!(&out, b"aabb");
    }
}
