// src/resource.rs
//
// Filesystem side of a request: existence and permission checks on the
// resolved path, then a read-only mapping of the whole file.
use crate::http::Status;
use memmap2::Mmap;
use std::ffi::OsStr;
use std::fs::{self, File};
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

/// Read permission for "other" (`S_IROTH`).
const OTHER_READ: u32 = 0o004;

/// A file ready to be sent. Dropping it releases the mapping.
#[derive(Debug)]
pub struct MappedFile {
    map: Option<Mmap>,
    len: usize,
}

impl MappedFile {
    pub fn as_bytes(&self) -> &[u8] {
        self.map.as_deref().unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Directory all request paths are resolved against.
///
/// Paths are joined by plain concatenation. The parser already rejects `..`
/// segments; nothing else (symlinks included) is filtered here.
#[derive(Debug, Clone)]
pub struct DocumentRoot {
    root: PathBuf,
}

impl DocumentRoot {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    /// `root` + request path, byte for byte.
    pub fn real_path(&self, request_path: &[u8]) -> PathBuf {
        let mut joined = self.root.as_os_str().as_bytes().to_vec();
        joined.extend_from_slice(request_path);
        PathBuf::from(OsStr::from_bytes(&joined))
    }

    /// Maps the requested file or says which error status applies.
    pub fn open(&self, request_path: &[u8]) -> Result<MappedFile, Status> {
        let real = self.real_path(request_path);
        let meta = match fs::metadata(&real) {
            Ok(meta) => meta,
            Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
                return Err(Status::Forbidden);
            }
            Err(_) => return Err(Status::NotFound),
        };

        if meta.permissions().mode() & OTHER_READ == 0 {
            return Err(Status::Forbidden);
        }
        if meta.is_dir() {
            return Err(Status::BadRequest);
        }

        let len = usize::try_from(meta.len()).map_err(|_| Status::InternalError)?;
        if len == 0 {
            return Ok(MappedFile { map: None, len: 0 });
        }

        let file = File::open(&real).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => Status::NotFound,
            io::ErrorKind::PermissionDenied => Status::Forbidden,
            _ => Status::InternalError,
        })?;
        // SAFETY: the mapping is read-only and private to this connection. A file
        // truncated underneath us is outside what this server guards against.
        let map = unsafe { Mmap::map(&file) }.map_err(|e| {
            tracing::warn!("mmap of {} failed: {}", real.display(), e);
            Status::InternalError
        })?;
        let len = map.len();
        Ok(MappedFile { map: Some(map), len })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::Permissions;

    fn root_with(files: &[(&str, &[u8], u32)]) -> (tempfile::TempDir, DocumentRoot) {
        let dir = tempfile::tempdir().unwrap();
        for (name, contents, mode) in files {
            let p = dir.path().join(name);
            fs::write(&p, contents).unwrap();
            fs::set_permissions(&p, Permissions::from_mode(*mode)).unwrap();
        }
        let root = DocumentRoot::new(dir.path());
        (dir, root)
    }

    #[test]
    fn test_maps_readable_file() {
        let (_dir, root) = root_with(&[("a.html", b"<p>hi</p>", 0o644)]);
        let file = root.open(b"/a.html").unwrap();
        assert_eq!(file.len(), 9);
        assert_eq!(file.as_bytes(), b"<p>hi</p>");
    }

    #[test]
    fn test_missing_file_is_not_found() {
        let (_dir, root) = root_with(&[]);
        assert_eq!(root.open(b"/nope.html").unwrap_err(), Status::NotFound);
    }

    #[test]
    fn test_not_world_readable_is_forbidden() {
        let (_dir, root) = root_with(&[("secret.html", b"x", 0o640)]);
        assert_eq!(root.open(b"/secret.html").unwrap_err(), Status::Forbidden);
    }

    #[test]
    fn test_directory_is_bad_request() {
        let (dir, root) = root_with(&[]);
        let sub = dir.path().join("sub");
        fs::create_dir(&sub).unwrap();
        fs::set_permissions(&sub, Permissions::from_mode(0o755)).unwrap();
        assert_eq!(root.open(b"/sub").unwrap_err(), Status::BadRequest);
    }

    #[test]
    fn test_empty_file_has_no_mapping() {
        let (_dir, root) = root_with(&[("empty.html", b"", 0o644)]);
        let file = root.open(b"/empty.html").unwrap();
        assert!(file.is_empty());
        assert_eq!(file.as_bytes(), b"");
    }

    #[test]
    fn test_real_path_concatenates() {
        let root = DocumentRoot::new("/srv/www");
        assert_eq!(root.real_path(b"/index.html"), PathBuf::from("/srv/www/index.html"));
    }
}
