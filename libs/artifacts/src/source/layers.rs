//! Blocking helpers over pulled image layers.
//!
//! Layers are tar archives, optionally gzip-compressed. Whiteout entries
//! (`.wh.<name>`) delete a file from lower layers; `.wh..wh..opq` marks a
//! directory opaque. Call these from `spawn_blocking`.

use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::{self, Cursor, Read, Write};
use std::path::{Component, Path, PathBuf};

use bytes::Bytes;
use flate2::read::GzDecoder;
use tar::{Archive, Builder, EntryType};
use tracing::{debug, trace};

use crate::error::FetchError;

const WHITEOUT_PREFIX: &str = ".wh.";
const OPAQUE_WHITEOUT: &str = ".wh..wh..opq";

fn is_gzip(data: &[u8]) -> bool {
    data.starts_with(&[0x1f, 0x8b])
}

fn open_layer(data: &Bytes) -> Archive<Box<dyn Read + '_>> {
    let reader: Box<dyn Read + '_> = if is_gzip(data) {
        Box::new(GzDecoder::new(Cursor::new(&data[..])))
    } else {
        Box::new(Cursor::new(&data[..]))
    };
    Archive::new(reader)
}

/// Normalize an entry path: drop `./` and leading `/`, reject `..`.
fn clean_path(path: &Path) -> Option<PathBuf> {
    let mut clean = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir | Component::RootDir => {}
            Component::ParentDir | Component::Prefix(_) => return None,
        }
    }
    (!clean.as_os_str().is_empty()).then_some(clean)
}

fn is_whiteout(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.starts_with(WHITEOUT_PREFIX))
}

/// Extract regular files directly under `prefix` into `dest`, flattened to
/// their file names. Later layers override earlier ones.
///
/// Returns the number of files present in `dest` afterwards.
pub(crate) fn extract_dir(layers: &[Bytes], prefix: &Path, dest: &Path) -> Result<usize, FetchError> {
    let mut extracted = BTreeSet::new();

    for data in layers {
        let mut archive = open_layer(data);
        for entry in archive.entries()? {
            let mut entry = entry?;
            let Some(path) = clean_path(&entry.path()?) else {
                continue;
            };
            let Ok(rest) = path.strip_prefix(prefix) else {
                continue;
            };
            let mut parts = rest.components();
            let (Some(Component::Normal(name)), None) = (parts.next(), parts.next()) else {
                continue;
            };
            let Some(name) = name.to_str().map(str::to_string) else {
                continue;
            };

            if name == OPAQUE_WHITEOUT {
                for old in std::mem::take(&mut extracted) {
                    remove_if_exists(&dest.join(old))?;
                }
                continue;
            }
            if let Some(target) = name.strip_prefix(WHITEOUT_PREFIX) {
                if extracted.remove(target) {
                    remove_if_exists(&dest.join(target))?;
                }
                continue;
            }
            if entry.header().entry_type() != EntryType::Regular {
                continue;
            }

            let target = dest.join(&name);
            trace!(file = %target.display(), "Extracting layer file");
            let mut file = File::create(&target)?;
            io::copy(&mut entry, &mut file)?;
            extracted.insert(name);
        }
    }

    debug!(dest = %dest.display(), files = extracted.len(), "Extracted layer directory");
    Ok(extracted.len())
}

/// Read the contents of a regular file at `path`, as seen from the top layer.
pub(crate) fn read_file(layers: &[Bytes], path: &Path) -> Result<Option<Vec<u8>>, FetchError> {
    let mut found = None;

    for data in layers {
        let mut archive = open_layer(data);
        for entry in archive.entries()? {
            let mut entry = entry?;
            let Some(entry_path) = clean_path(&entry.path()?) else {
                continue;
            };

            let whiteout = entry_path.parent().map(|p| {
                p.join(format!(
                    "{}{}",
                    WHITEOUT_PREFIX,
                    path.file_name().and_then(|n| n.to_str()).unwrap_or_default()
                ))
            });
            if whiteout.as_deref() == Some(entry_path.as_path()) {
                found = None;
                continue;
            }
            if entry_path != path || entry.header().entry_type() != EntryType::Regular {
                continue;
            }

            let mut contents = Vec::new();
            entry.read_to_end(&mut contents)?;
            found = Some(contents);
        }
    }

    Ok(found)
}

/// Write every layer's entries, in order, into one uncompressed tarball.
///
/// Whiteout markers are dropped.
pub(crate) fn flatten<W: Write>(layers: &[Bytes], out: W) -> Result<W, FetchError> {
    let mut builder = Builder::new(out);
    let mut entries = 0usize;

    for data in layers {
        let mut archive = open_layer(data);
        for entry in archive.entries()? {
            let mut entry = entry?;
            let Some(path) = clean_path(&entry.path()?) else {
                continue;
            };
            if is_whiteout(&path) {
                continue;
            }

            let mut header = entry.header().clone();
            match entry.header().entry_type() {
                EntryType::Symlink | EntryType::Link => {
                    let Some(target) = entry.link_name()?.map(|t| t.into_owned()) else {
                        continue;
                    };
                    builder.append_link(&mut header, &path, &target)?;
                }
                _ => builder.append_data(&mut header, &path, &mut entry)?,
            }
            entries += 1;
        }
    }

    debug!(entries = entries, "Flattened image layers");
    Ok(builder.into_inner()?)
}

fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}
