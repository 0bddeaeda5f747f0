//! Saved-playlists atomic-write contract.
//!
//! This is deliberately the crate's only on-disk state: the playlists store
//! itself is treated as an external collaborator, so this module only
//! implements the write contract, not a playlist data model.

use std::io;
use std::path::{Path, PathBuf};

use serde_json::Value;

fn playlist_path(media_root: &Path, name: &str) -> PathBuf {
    media_root.join("data").join(format!("{name}.json"))
}

/// Writes `value` to `<media_root>/data/<name>.json.tmp` then renames it
/// over the final path, so a reader never observes a partially-written file.
pub fn save(media_root: &Path, name: &str, value: &Value) -> io::Result<()> {
    let final_path = playlist_path(media_root, name);
    let tmp_path = final_path.with_extension("json.tmp");
    std::fs::write(&tmp_path, serde_json::to_vec_pretty(value)?)?;
    std::fs::rename(&tmp_path, &final_path)?;
    Ok(())
}

/// An empty file is an error, not a silent default.
pub fn load(media_root: &Path, name: &str) -> io::Result<Value> {
    let path = playlist_path(media_root, name);
    let bytes = std::fs::read(&path)?;
    if bytes.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("playlist file '{}' is empty", path.display()),
        ));
    }
    serde_json::from_slice(&bytes).map_err(io::Error::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn save_then_load_roundtrip() {
        let dir = tempdir("roundtrip");
        std::fs::create_dir_all(dir.join("data")).unwrap();
        let value = json!({"items": ["u1", "u2"]});
        save(&dir, "favorites", &value).unwrap();
        let loaded = load(&dir, "favorites").unwrap();
        assert_eq!(loaded, value);
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn load_rejects_empty_file() {
        let dir = tempdir("empty-file");
        std::fs::create_dir_all(dir.join("data")).unwrap();
        std::fs::write(dir.join("data").join("blank.json"), b"").unwrap();
        assert!(load(&dir, "blank").is_err());
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn load_missing_file_errors() {
        let dir = tempdir("missing-file");
        assert!(load(&dir, "does-not-exist").is_err());
    }

    fn tempdir(label: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!(
            "fetchcore-playlists-test-{}-{label}",
            std::process::id()
        ));
        let _ = std::fs::create_dir_all(&path);
        path
    }
}
