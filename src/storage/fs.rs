//! Filesystem-backed object storage.
//!
//! Objects live under a root directory, one file per key, with `/`-separated keys mapped
//! onto nested directories. Uploads are written to a `.partial` sibling first and renamed
//! into place once the source is exhausted, so readers never observe a half-written
//! object. Partial files left behind by a crash play the role of failed multipart uploads:
//! they are reported by [`StorageLister::list_failed_multipart_uploads`] and removed by
//! [`StorageMover::abort_multipart_upload`].
use std::{
    collections::HashMap,
    fs::{self, File, OpenOptions},
    io::{self, BufWriter, Read, Seek, SeekFrom, Write},
    path::{Component, Path, PathBuf},
};

use log::{debug, info, warn};
use rand::RngCore;

use super::{
    ObjectInfo, ObjectStream, StorageError, StorageLister, StorageMover, StorageReader,
    StorageWriter,
};

const PARTIAL_SUFFIX: &str = ".partial";

#[derive(Debug, Clone)]
pub struct FileStorage {
    root: PathBuf,
}

impl FileStorage {
    /// Opens a storage rooted at `root`, creating the directory if needed.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| StorageError::io("create storage root", e))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, key: &str) -> Result<PathBuf, StorageError> {
        let invalid = |reason: &str| StorageError::InvalidKey {
            key: key.to_string(),
            reason: reason.to_string(),
        };

        if key.is_empty() {
            return Err(invalid("empty key"));
        }
        let relative = Path::new(key);
        for component in relative.components() {
            match component {
                Component::Normal(_) | Component::CurDir => {}
                Component::ParentDir => return Err(invalid("parent directory references")),
                Component::RootDir | Component::Prefix(_) => {
                    return Err(invalid("absolute paths"));
                }
            }
        }
        Ok(self.root.join(relative))
    }

    fn partial_path(path: &Path, upload_id: &str) -> PathBuf {
        let mut name = path.as_os_str().to_owned();
        name.push(format!(".{upload_id}{PARTIAL_SUFFIX}"));
        PathBuf::from(name)
    }

    fn new_upload_id() -> String {
        let mut bytes = [0_u8; 8];
        rand::thread_rng().fill_bytes(&mut bytes);
        bytes.iter().map(|b| format!("{b:02x}")).collect()
    }

    /// Splits `<key>.<upload-id>.partial` into its key and upload id.
    fn parse_partial(key: &str) -> Option<(&str, &str)> {
        let stem = key.strip_suffix(PARTIAL_SUFFIX)?;
        let (object, upload_id) = stem.rsplit_once('.')?;
        if object.is_empty() || upload_id.is_empty() {
            return None;
        }
        Some((object, upload_id))
    }

    /// Every file under the root as `(key, size)`, partial uploads included.
    fn walk(&self) -> Result<Vec<(String, u64)>, StorageError> {
        let mut out = Vec::new();
        let mut pending = vec![self.root.clone()];

        while let Some(dir) = pending.pop() {
            let entries = fs::read_dir(&dir).map_err(|e| StorageError::io("read directory", e))?;
            for entry in entries {
                let entry = entry.map_err(|e| StorageError::io("read directory entry", e))?;
                let file_type = entry
                    .file_type()
                    .map_err(|e| StorageError::io("stat directory entry", e))?;
                let path = entry.path();

                if file_type.is_dir() {
                    pending.push(path);
                } else if file_type.is_file() {
                    let size = entry
                        .metadata()
                        .map_err(|e| StorageError::io("stat object", e))?
                        .len();
                    if let Some(key) = self.key_of(&path) {
                        out.push((key, size));
                    }
                }
            }
        }

        Ok(out)
    }

    fn key_of(&self, path: &Path) -> Option<String> {
        let relative = path.strip_prefix(&self.root).ok()?;
        let parts = relative
            .components()
            .map(|c| c.as_os_str().to_str())
            .collect::<Option<Vec<_>>>()?;
        Some(parts.join("/"))
    }
}

impl StorageReader for FileStorage {
    fn cat_file(&self, name: &str, offset: i64) -> Result<ObjectStream, StorageError> {
        let path = self.resolve(name)?;
        let offset = u64::try_from(offset).map_err(|_| StorageError::InvalidKey {
            key: name.to_string(),
            reason: format!("negative offset {offset}"),
        })?;

        let mut file = File::open(&path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => StorageError::NotFound(name.to_string()),
            _ => StorageError::io("open object", e),
        })?;
        file.seek(SeekFrom::Start(offset))
            .map_err(|e| StorageError::io("seek object", e))?;

        debug!("serving '{name}' from offset {offset}");
        Ok(Box::new(file))
    }
}

impl StorageWriter for FileStorage {
    fn put_file(&self, name: &str, source: &mut dyn Read) -> Result<(), StorageError> {
        let path = self.resolve(name)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| StorageError::io("create directory", e))?;
        }

        let upload_id = Self::new_upload_id();
        let partial = Self::partial_path(&path, &upload_id);
        let file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&partial)
            .map_err(|e| StorageError::io("create partial upload", e))?;
        debug!("uploading '{name}' as {}", partial.display());

        let mut writer = BufWriter::new(file);
        let written = io::copy(source, &mut writer)
            .and_then(|n| writer.flush().map(|_| n))
            .and_then(|n| writer.get_ref().sync_all().map(|_| n));

        match written {
            Ok(n) => {
                drop(writer);
                fs::rename(&partial, &path).map_err(|e| StorageError::io("commit upload", e))?;
                info!("stored '{name}' ({n} bytes)");
                Ok(())
            }
            Err(e) => {
                drop(writer);
                if let Err(cleanup) = fs::remove_file(&partial) {
                    warn!("failed to remove partial upload {}: {cleanup}", partial.display());
                }
                Err(StorageError::io("write object", e))
            }
        }
    }
}

impl StorageLister for FileStorage {
    fn list_path(&self, prefix: &str) -> Result<Vec<ObjectInfo>, StorageError> {
        let mut objects = self
            .walk()?
            .into_iter()
            .filter(|(key, _)| key.starts_with(prefix) && Self::parse_partial(key).is_none())
            .map(|(key, size)| ObjectInfo::new(key, size as i64))
            .collect::<Vec<_>>();
        objects.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(objects)
    }

    fn list_failed_multipart_uploads(&self) -> Result<HashMap<String, String>, StorageError> {
        Ok(self
            .walk()?
            .iter()
            .filter_map(|(key, _)| Self::parse_partial(key))
            .map(|(object, upload_id)| (object.to_string(), upload_id.to_string()))
            .collect())
    }
}

impl StorageMover for FileStorage {
    fn move_object(&self, from: &str, to: &str) -> Result<(), StorageError> {
        let source = self.resolve(from)?;
        let dest = self.resolve(to)?;
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).map_err(|e| StorageError::io("create directory", e))?;
        }
        fs::rename(&source, &dest).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => StorageError::NotFound(from.to_string()),
            _ => StorageError::io("move object", e),
        })
    }

    fn delete_object(&self, key: &str) -> Result<(), StorageError> {
        let path = self.resolve(key)?;
        fs::remove_file(&path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => StorageError::NotFound(key.to_string()),
            _ => StorageError::io("delete object", e),
        })
    }

    fn abort_multipart_upload(&self, key: &str, upload_id: &str) -> Result<(), StorageError> {
        let path = self.resolve(key)?;
        let partial = Self::partial_path(&path, upload_id);
        match fs::remove_file(&partial) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::io("abort upload", e)),
        }
    }
}
