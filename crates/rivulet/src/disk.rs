//! Storage of the pieces of a torrent.
//!
//! Pieces are written and read at offsets of the concatenated piece space,
//! the storage maps them onto files. Every call is blocking, sessions call
//! them on the blocking pool.
use std::{
    fmt::Debug,
    fs::{create_dir_all, File, OpenOptions},
    io::{self, Read, Seek, SeekFrom, Write},
    path::{Component, Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use hashbrown::HashMap;
use tracing::{debug, warn};

use crate::{error::Error, metainfo::Info};

/// Write and read blocks of the concatenated piece space.
pub trait Storage: Debug + Send + Sync {
    fn write_at(&self, offset: u64, data: &[u8]) -> Result<(), Error>;
    fn read_at(&self, offset: u64, len: usize) -> Result<Vec<u8>, Error>;
}

/// Where the data of a torrent lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageTarget {
    Memory,
    /// Files are placed under `dir/name_of_torrent`.
    Directory(PathBuf),
}

impl StorageTarget {
    pub fn open(
        &self,
        info: &Info,
        selection: Option<&[usize]>,
    ) -> Arc<dyn Storage> {
        match self {
            Self::Memory => Arc::new(MemoryStorage::new(info.total_size())),
            Self::Directory(dir) => {
                Arc::new(FileStorage::new(dir, info, selection))
            }
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

fn out_of_range() -> Error {
    io::Error::new(io::ErrorKind::InvalidInput, "out of the torrent range")
        .into()
}

/// All the data in a buffer, used by tests and short lived sessions.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    buf: Mutex<Vec<u8>>,
}

impl MemoryStorage {
    pub fn new(len: u64) -> Self {
        Self { buf: Mutex::new(vec![0; len as usize]) }
    }

    /// A storage that already has the data, to seed it.
    pub fn with_data(data: Vec<u8>) -> Self {
        Self { buf: Mutex::new(data) }
    }

    pub fn contents(&self) -> Vec<u8> {
        lock(&self.buf).clone()
    }
}

impl Storage for MemoryStorage {
    fn write_at(&self, offset: u64, data: &[u8]) -> Result<(), Error> {
        let mut buf = lock(&self.buf);
        let start = offset as usize;
        let end = start + data.len();
        if end > buf.len() {
            return Err(out_of_range());
        }
        buf[start..end].copy_from_slice(data);
        Ok(())
    }

    fn read_at(&self, offset: u64, len: usize) -> Result<Vec<u8>, Error> {
        let buf = lock(&self.buf);
        let start = offset as usize;
        buf.get(start..start + len).map(<[u8]>::to_vec).ok_or_else(out_of_range)
    }
}

#[derive(Debug, Clone)]
struct DiskFile {
    path: PathBuf,
    offset: u64,
    length: u64,
    selected: bool,
}

/// Maps the piece space onto the files of the torrent, under
/// `dir/name_of_torrent`. Unselected files are never created.
#[derive(Debug)]
pub struct FileStorage {
    files: Vec<DiskFile>,
    handles: Mutex<HashMap<usize, File>>,
}

/// Join the components of a path that came from the network, dropping any
/// that could escape the root.
fn safe_join(root: &Path, components: &[String]) -> PathBuf {
    let mut path = root.to_path_buf();
    for c in components {
        let p = Path::new(c);
        let mut it = p.components();
        match (it.next(), it.next()) {
            (Some(Component::Normal(n)), None) => path.push(n),
            _ => warn!("skipping path component {c:?}"),
        }
    }
    path
}

impl FileStorage {
    pub fn new(
        dir: impl AsRef<Path>,
        info: &Info,
        selection: Option<&[usize]>,
    ) -> Self {
        let mut root = dir.as_ref().to_path_buf();
        if !info.single_file {
            root = safe_join(&root, std::slice::from_ref(&info.name));
        }

        let files = info
            .files
            .iter()
            .enumerate()
            .map(|(i, f)| DiskFile {
                path: safe_join(&root, &f.path),
                offset: f.offset,
                length: f.length,
                selected: selection.map_or(true, |s| s.contains(&i)),
            })
            .collect();

        Self { files, handles: Mutex::new(HashMap::new()) }
    }

    /// Parts of `[offset, offset + len)` that fall in each file, as
    /// (file index, offset in the file, offset in the buffer, length).
    fn spans(
        &self,
        offset: u64,
        len: usize,
    ) -> impl Iterator<Item = (usize, u64, usize, usize)> + '_ {
        let end = offset + len as u64;
        self.files.iter().enumerate().filter_map(move |(i, f)| {
            let start = offset.max(f.offset);
            let stop = end.min(f.offset + f.length);
            (start < stop).then(|| {
                (
                    i,
                    start - f.offset,
                    (start - offset) as usize,
                    (stop - start) as usize,
                )
            })
        })
    }

    fn with_file<T>(
        &self,
        i: usize,
        create: bool,
        f: impl FnOnce(&mut File) -> io::Result<T>,
    ) -> Result<T, Error> {
        let mut handles = lock(&self.handles);

        if !handles.contains_key(&i) {
            let path = &self.files[i].path;
            if create {
                if let Some(parent) = path.parent() {
                    create_dir_all(parent)?;
                }
            }
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(create)
                .truncate(false)
                .open(path)?;
            debug!("opened {path:?}");
            handles.insert(i, file);
        }

        let Some(file) = handles.get_mut(&i) else {
            return Err(out_of_range());
        };

        Ok(f(file)?)
    }
}

impl Storage for FileStorage {
    fn write_at(&self, offset: u64, data: &[u8]) -> Result<(), Error> {
        for (i, file_offset, buf_offset, len) in self.spans(offset, data.len()) {
            if !self.files[i].selected {
                continue;
            }
            let chunk = &data[buf_offset..buf_offset + len];
            self.with_file(i, true, |file| {
                file.seek(SeekFrom::Start(file_offset))?;
                file.write_all(chunk)
            })?;
        }
        Ok(())
    }

    fn read_at(&self, offset: u64, len: usize) -> Result<Vec<u8>, Error> {
        let mut buf = vec![0; len];
        let mut read = 0;

        for (i, file_offset, buf_offset, len) in self.spans(offset, len) {
            self.with_file(i, false, |file| {
                file.seek(SeekFrom::Start(file_offset))?;
                file.read_exact(&mut buf[buf_offset..buf_offset + len])
            })?;
            read += len;
        }

        if read != buf.len() {
            return Err(out_of_range());
        }
        Ok(buf)
    }
}

/// Pieces of `info` that are already on `storage` with a valid hash.
pub fn recheck(storage: &dyn Storage, info: &Info) -> Vec<u32> {
    (0..info.pieces())
        .filter(|i| {
            let Ok(data) = storage
                .read_at(info.piece_offset(*i), info.piece_size(*i) as usize)
            else {
                return false;
            };
            let hash = sha1_smol::Sha1::from(&data).digest().bytes();
            info.piece_hash(*i).is_some_and(|h| *h == hash)
        })
        .map(|i| i as u32)
        .collect()
}
