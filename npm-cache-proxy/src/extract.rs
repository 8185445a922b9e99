//! Pull the readme, `package.json` and `npm-shrinkwrap.json` out of a
//! package tarball in a single pass over its entries.

use flate2::read::GzDecoder;
use serde_json::Value;
use std::io::{BufRead, BufReader, Read};
use tracing::debug;

use crate::error::{AppError, AppResult};
use crate::store::CacheStore;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Metadata read from a package tarball.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TarballMetadata {
    pub readme: Option<String>,
    pub manifest: Option<Value>,
    pub shrinkwrap: Option<Value>,
}

impl TarballMetadata {
    /// `description` from the archived `package.json`, if any.
    pub fn description(&self) -> Option<&str> {
        self.manifest
            .as_ref()
            .and_then(|m| m.get("description"))
            .and_then(Value::as_str)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Readme,
    Manifest,
    Shrinkwrap,
}

/// Which slot, if any, an archive path fills. Only files directly under the
/// archive's top directory count.
fn slot_for(path: &str) -> Option<Slot> {
    let path = path.strip_prefix("./").unwrap_or(path);
    let (top, file) = path.split_once('/')?;
    if top.is_empty() || file.is_empty() || file.contains('/') {
        return None;
    }
    match file {
        "package.json" => return Some(Slot::Manifest),
        "npm-shrinkwrap.json" => return Some(Slot::Shrinkwrap),
        _ => {}
    }
    let lower = file.to_ascii_lowercase();
    if lower == "readme" || lower.starts_with("readme.") {
        Some(Slot::Readme)
    } else {
        None
    }
}

/// Read a gzipped or plain tar stream.
pub fn extract<R: Read>(reader: R) -> AppResult<TarballMetadata> {
    let mut reader = BufReader::new(reader);
    let gzipped = reader.fill_buf()?.starts_with(&GZIP_MAGIC);
    if gzipped {
        read_archive(GzDecoder::new(reader))
    } else {
        read_archive(reader)
    }
}

fn read_archive<R: Read>(reader: R) -> AppResult<TarballMetadata> {
    let mut archive = tar::Archive::new(reader);
    let mut found = TarballMetadata::default();

    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.to_string_lossy().into_owned();
        let Some(slot) = slot_for(&path) else {
            continue;
        };

        match slot {
            Slot::Readme if found.readme.is_none() => {
                let mut buf = Vec::new();
                entry.read_to_end(&mut buf)?;
                found.readme = Some(String::from_utf8_lossy(&buf).into_owned());
            }
            Slot::Manifest if found.manifest.is_none() => {
                found.manifest = Some(read_json(&mut entry, &path)?)
            }
            Slot::Shrinkwrap if found.shrinkwrap.is_none() => {
                found.shrinkwrap = Some(read_json(&mut entry, &path)?)
            }
            // later duplicates are skipped unread
            Slot::Readme | Slot::Manifest | Slot::Shrinkwrap => {}
        }
    }

    Ok(found)
}

fn read_json<R: Read>(entry: &mut R, path: &str) -> AppResult<Value> {
    let mut buf = Vec::new();
    entry.read_to_end(&mut buf)?;
    serde_json::from_slice(&buf).map_err(|source| AppError::MalformedArchiveEntry {
        path: path.to_string(),
        source,
    })
}

/// Extract from a tarball already in the disk cache. `None` when the key
/// has no complete entry.
pub async fn extract_cached(store: &CacheStore, key: &str) -> AppResult<Option<TarballMetadata>> {
    if store.get(key).await?.is_none() {
        return Ok(None);
    }
    let path = store.content_path(key);
    debug!(key = %key, "Extracting cached tarball");

    let metadata = tokio::task::spawn_blocking(move || {
        let file = std::fs::File::open(path)?;
        extract(file)
    })
    .await
    .map_err(|e| AppError::InternalError(format!("Extraction task failed: {e}")))??;

    Ok(Some(metadata))
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::collections::BTreeMap;

    fn tarball(entries: &[(&str, &str)], gzip: bool) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for (path, body) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_size(body.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder
                .append_data(&mut header, path, body.as_bytes())
                .unwrap();
        }
        let tar = builder.into_inner().unwrap();
        if !gzip {
            return tar;
        }
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        std::io::Write::write_all(&mut encoder, &tar).unwrap();
        encoder.finish().unwrap()
    }

    #[test]
    fn finds_all_three_entries() {
        let bytes = tarball(
            &[
                ("package/README.md", "# pkg"),
                ("package/package.json", r#"{"name":"pkg","description":"A package"}"#),
                ("package/npm-shrinkwrap.json", r#"{"lockfileVersion":1}"#),
                ("package/index.js", "module.exports = 1"),
            ],
            true,
        );
        let meta = extract(bytes.as_slice()).unwrap();
        assert_eq!(meta.readme.as_deref(), Some("# pkg"));
        assert_eq!(meta.description(), Some("A package"));
        assert_eq!(meta.shrinkwrap.unwrap()["lockfileVersion"], 1);
    }

    #[test]
    fn missing_shrinkwrap_is_absent() {
        let bytes = tarball(
            &[
                ("package/README.md", "# pkg"),
                ("package/package.json", r#"{"name":"pkg"}"#),
            ],
            true,
        );
        let meta = extract(bytes.as_slice()).unwrap();
        assert!(meta.readme.is_some());
        assert!(meta.manifest.is_some());
        assert!(meta.shrinkwrap.is_none());
    }

    #[test]
    fn readme_match_is_case_insensitive_and_top_level_only() {
        let bytes = tarball(
            &[
                ("package/docs/README.md", "nested"),
                ("package/Readme", "top"),
                ("package/readme.txt", "second"),
            ],
            false,
        );
        let meta = extract(bytes.as_slice()).unwrap();
        assert_eq!(meta.readme.as_deref(), Some("top"));
        assert!(meta.manifest.is_none());
    }

    #[test]
    fn first_manifest_and_shrinkwrap_win_over_duplicates() {
        let bytes = tarball(
            &[
                ("package/package.json", r#"{"description":"first"}"#),
                ("package/npm-shrinkwrap.json", r#"{"lockfileVersion":1}"#),
                ("package/package.json", r#"{"description":"second"}"#),
                ("package/npm-shrinkwrap.json", r#"{"lockfileVersion":2}"#),
            ],
            true,
        );
        let meta = extract(bytes.as_slice()).unwrap();
        assert_eq!(meta.description(), Some("first"));
        assert_eq!(meta.shrinkwrap.unwrap()["lockfileVersion"], 1);
    }

    #[test]
    fn malformed_duplicates_are_never_parsed() {
        let bytes = tarball(
            &[
                ("package/package.json", r#"{"description":"good"}"#),
                ("package/npm-shrinkwrap.json", r#"{"lockfileVersion":1}"#),
                ("package/package.json", "{broken"),
                ("package/npm-shrinkwrap.json", "{broken"),
            ],
            false,
        );
        let meta = extract(bytes.as_slice()).unwrap();
        assert_eq!(meta.description(), Some("good"));
        assert!(meta.shrinkwrap.is_some());
    }

    #[test]
    fn manifest_names_must_match_exactly() {
        assert_eq!(slot_for("package/package.json"), Some(Slot::Manifest));
        assert_eq!(slot_for("./package/package.json"), Some(Slot::Manifest));
        assert_eq!(slot_for("package/Package.json"), None);
        assert_eq!(slot_for("package/lib/package.json"), None);
        assert_eq!(slot_for("package.json"), None);
        assert_eq!(slot_for("pkg/README"), Some(Slot::Readme));
        assert_eq!(slot_for("pkg/readmes.md"), None);
    }

    #[test]
    fn malformed_json_is_reported_with_its_path() {
        let bytes = tarball(&[("package/package.json", "{not json")], true);
        match extract(bytes.as_slice()) {
            Err(AppError::MalformedArchiveEntry { path, .. }) => {
                assert_eq!(path, "package/package.json")
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn extracts_from_the_disk_cache() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = CacheStore::open(dir.path()).await.unwrap();
        let key = crate::store::request_key("http://r/pkg/-/pkg-1.0.0.tgz");
        let bytes = tarball(&[("package/package.json", r#"{"description":"cached"}"#)], true);
        store
            .insert(&key, "http://r/pkg/-/pkg-1.0.0.tgz", 200, BTreeMap::new(), &bytes)
            .await
            .unwrap();

        let meta = extract_cached(&store, &key).await.unwrap().unwrap();
        assert_eq!(meta.description(), Some("cached"));
        assert!(extract_cached(&store, "missing").await.unwrap().is_none());
    }
}
