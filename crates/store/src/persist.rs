use std::io;
use std::path::Path;

use serde::{de::DeserializeOwned, Serialize};

/// Write `value` as pretty JSON to `path` atomically: serialize to a
/// sibling `.tmp` file, `fsync`-adjacent flush via `File::sync_all`,
/// then `rename` over the destination. A crash mid-write leaves the
/// previous version intact rather than a truncated file.
pub fn write_atomic<T: Serialize>(path: &Path, value: &T) -> io::Result<()> {
    let tmp_path = path.with_extension("json.tmp");
    let json = serde_json::to_vec_pretty(value)?;
    {
        use std::io::Write;
        let mut file = std::fs::File::create(&tmp_path)?;
        file.write_all(&json)?;
        file.sync_all()?;
    }
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

pub fn read_json<T: DeserializeOwned>(path: &Path) -> io::Result<T> {
    let raw = std::fs::read_to_string(path)?;
    serde_json::from_str(&raw).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}
