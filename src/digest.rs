use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::path::Path;

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};

/// Compute the SHA256 digest of the file at `path` and return it as a hex string.
pub fn compute_sha256(path: &Path) -> Result<String> {
    let file = File::open(path)
        .with_context(|| format!("Failed to open file for hashing: {}", path.display()))?;
    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];

    loop {
        let read = reader.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

/// Digest of an ordered list of strings, NUL-separated so that element
/// boundaries change the result.
pub fn digest_strings<I, S>(parts: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_ref().as_bytes());
        hasher.update(b"\0");
    }
    format!("{:x}", hasher.finalize())
}

/// Write `sha256sum`-style lines for `entries` into `output`.
pub fn write_checksums(entries: &[(String, String)], output: &Path) -> Result<()> {
    if let Some(parent) = output.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create digest directory: {}", parent.display()))?;
    }
    let mut file = File::create(output)
        .with_context(|| format!("Failed to create digest file: {}", output.display()))?;
    for (digest, path) in entries {
        writeln!(file, "{digest}  {path}")
            .with_context(|| format!("Failed to write digest into '{}'", output.display()))?;
    }
    Ok(())
}
