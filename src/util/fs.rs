use std::fs;
use std::io::{self, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use super::crypto::{pseudorandom_string, ALPHA_NUM};

/// Atomically creates a file with the given contents, overwriting
/// it if one exists.
///
/// The buffer is first written to a temporary file in the same directory,
/// synced to disk and then renamed over the destination, so a crash can
/// never leave a partially written file behind.
///
/// Read: [Ensuring data reaches to disk](https://lwn.net/Articles/457667/).
pub fn safe_write_all<P: AsRef<Path>, B: AsRef<[u8]>>(path: P, buf: B) -> io::Result<()> {
    write_with_mode(path, buf, None)
}

/// Same as [safe_write_all] but the file lands with the given permission
/// bits. The mode is applied to the temporary file before the rename, so
/// the destination is never observable with wider permissions.
pub fn safe_write_all_with_mode<P: AsRef<Path>, B: AsRef<[u8]>>(
    path: P,
    buf: B,
    mode: u32,
) -> io::Result<()> {
    write_with_mode(path, buf, Some(mode))
}

fn write_with_mode<P: AsRef<Path>, B: AsRef<[u8]>>(
    path: P,
    buf: B,
    mode: Option<u32>,
) -> io::Result<()> {
    // create temp file
    let tmp_ext = "sync-".to_owned() + &pseudorandom_string(ALPHA_NUM, 6);
    let tmp_path = path.as_ref().with_extension(tmp_ext);
    let mut tmp_file = fs::File::create(tmp_path.clone())?;

    if let Some(mode) = mode {
        tmp_file.set_permissions(fs::Permissions::from_mode(mode))?;
    }

    // write given contents and sync to disk
    tmp_file.write_all(buf.as_ref())?;
    tmp_file.flush()?;
    tmp_file.sync_all()?;
    drop(tmp_file);

    // rename tmp file to destination
    fs::rename(&tmp_path, path.as_ref())
}
