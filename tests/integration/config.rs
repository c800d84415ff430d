use crate::*;

use trellis_core::config::{StorageBackend, TrellisConfig};
use trellis_sessions::{open_record_store, FileRecordStore};

fn write_config(dir: &std::path::Path, text: &str) -> PathBuf {
    std::fs::create_dir_all(dir).unwrap();
    let path = dir.join("config.toml");
    std::fs::write(&path, text).unwrap();
    path
}

/// A config file selecting the file backend drives where records land.
#[test]
fn test_file_backend_from_config() {
    let dir = temp_dir("config-file");
    let records = dir.join("records");
    let path = write_config(
        &dir,
        &format!(
            "[storage]\nbackend = \"file\"\npath = \"{}\"\n\n[pool]\ncommand_queue = 8\n",
            records.display()
        ),
    );

    let config = TrellisConfig::load_from(&path).unwrap();
    assert_eq!(config.storage.backend, StorageBackend::File);
    assert_eq!(config.pool.command_queue, 8);

    let cache: SessionResumptionCache =
        SessionResumptionCache::new(open_record_store(&config.storage).unwrap());
    cache
        .save(PeerId::new(1, 1), ResumptionId::random(), &SessionSecret::random(), AuthTags::EMPTY)
        .unwrap();

    // index, state, link
    assert_eq!(FileRecordStore::new(&records).unwrap().count(), 3);
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn test_memory_backend_from_config() {
    let dir = temp_dir("config-memory");
    let path = write_config(&dir, "[storage]\nbackend = \"memory\"\n");

    let config = TrellisConfig::load_from(&path).unwrap();
    assert_eq!(config.storage.backend, StorageBackend::Memory);
    assert_eq!(config.storage.max_bytes, 0);

    let cache: SessionResumptionCache =
        SessionResumptionCache::new(open_record_store(&config.storage).unwrap());
    let peer = PeerId::new(4, 4);
    cache
        .save(peer, ResumptionId::random(), &SessionSecret::random(), AuthTags::EMPTY)
        .unwrap();
    assert!(cache.find_by_peer(peer).unwrap().is_some());
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn test_malformed_config_is_reported() {
    let dir = temp_dir("config-bad");
    let path = write_config(&dir, "[storage\nbackend = ");

    let err = TrellisConfig::load_from(&path).unwrap_err();
    assert!(err.to_string().contains("failed to parse"), "{err}");
    let _ = std::fs::remove_dir_all(&dir);
}
