use std::io;
use std::path::Path;

/// Packs a build context directory into an uncompressed tar archive.
pub(crate) fn archive(dir: &Path) -> io::Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    builder.follow_symlinks(false);
    builder.append_dir_all(".", dir)?;
    builder.into_inner()
}
