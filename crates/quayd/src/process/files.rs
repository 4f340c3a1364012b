use std::fs::Permissions;
use std::io::{self, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use tempfile::Builder;

/// Writes `contents` to `path` through a synced temporary file renamed into
/// place, so readers never observe a partial snapshot.
pub(super) fn atomic_write(path: &Path, contents: &[u8]) -> io::Result<()> {
    let directory = path.parent().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::NotFound,
            format!("'{}' has no parent directory", path.display()),
        )
    })?;
    let prefix = path
        .file_name()
        .and_then(|name| name.to_str())
        .map_or_else(|| String::from(".quayd"), |name| format!(".{name}"));

    let mut file = Builder::new()
        .prefix(&prefix)
        .permissions(Permissions::from_mode(0o600))
        .tempfile_in(directory)?;
    file.write_all(contents)?;
    file.as_file().sync_all()?;
    file.persist(path).map_err(|error| error.error)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn replaces_existing_contents() {
        let dir = tempfile::tempdir().expect("temp dir");
        let target = dir.path().join("snapshot");
        fs::write(&target, b"old and longer").expect("seed file");

        atomic_write(&target, b"new").expect("write");

        assert_eq!(fs::read(&target).expect("read back"), b"new");
        let mode = fs::metadata(&target).expect("metadata").permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        let leftovers = fs::read_dir(dir.path()).expect("list").count();
        assert_eq!(leftovers, 1, "temporary file should be renamed away");
    }
}
