#[path = "../src/backup.rs"]
mod backup;

use std::fs::File;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use zip::write::FileOptions;

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

#[test]
fn zip_export_and_import_roundtrip() {
    let workspace = temp_dir("dece-backup-src");
    let workspace2 = temp_dir("dece-backup-dst");
    let out_dir = temp_dir("dece-backup-out");

    let db_src = workspace.join("dece.sqlite3");
    let bytes = b"sqlite-test-payload";
    std::fs::write(&db_src, bytes).expect("write source db");

    let bundle_path = out_dir.join("workspace.decebackup.zip");
    let export = backup::export_workspace_bundle(&workspace, &bundle_path).expect("export bundle");
    assert_eq!(export.bundle_format, backup::BUNDLE_FORMAT_V1);
    assert_eq!(export.entry_count, 3);
    assert_eq!(export.db_sha256.len(), 64);

    let f = File::open(&bundle_path).expect("open bundle");
    let mut archive = zip::ZipArchive::new(f).expect("open zip archive");
    let mut manifest = String::new();
    archive
        .by_name("manifest.json")
        .expect("manifest entry")
        .read_to_string(&mut manifest)
        .expect("read manifest");
    assert!(manifest.contains(backup::BUNDLE_FORMAT_V1));
    assert!(manifest.contains(&export.db_sha256));
    archive
        .by_name("db/dece.sqlite3")
        .expect("database entry in bundle");

    let import = backup::import_workspace_bundle(&bundle_path, &workspace2).expect("import bundle");
    assert_eq!(import.bundle_format_detected, backup::BUNDLE_FORMAT_V1);
    assert_eq!(import.db_sha256.as_deref(), Some(export.db_sha256.as_str()));

    let db_dst = workspace2.join("dece.sqlite3");
    let restored = std::fs::read(&db_dst).expect("read restored db");
    assert_eq!(restored, bytes);

    let _ = std::fs::remove_dir_all(workspace);
    let _ = std::fs::remove_dir_all(workspace2);
    let _ = std::fs::remove_dir_all(out_dir);
}

#[test]
fn tampered_database_entry_fails_the_checksum() {
    let workspace = temp_dir("dece-tamper-src");
    let workspace2 = temp_dir("dece-tamper-dst");
    let out_dir = temp_dir("dece-tamper-out");

    std::fs::write(workspace.join("dece.sqlite3"), b"original-bytes").expect("write source db");
    let bundle_path = out_dir.join("workspace.decebackup.zip");
    backup::export_workspace_bundle(&workspace, &bundle_path).expect("export bundle");

    // Rebuild the bundle keeping the manifest but swapping the db entry.
    let mut manifest = String::new();
    {
        let f = File::open(&bundle_path).expect("open bundle");
        let mut archive = zip::ZipArchive::new(f).expect("open zip archive");
        archive
            .by_name("manifest.json")
            .expect("manifest entry")
            .read_to_string(&mut manifest)
            .expect("read manifest");
    }
    let tampered_path = out_dir.join("tampered.decebackup.zip");
    {
        let out = File::create(&tampered_path).expect("create tampered bundle");
        let mut zipw = zip::ZipWriter::new(out);
        let opts = FileOptions::default();
        zipw.start_file("manifest.json", opts)
            .expect("start manifest entry");
        zipw.write_all(manifest.as_bytes()).expect("write manifest");
        zipw.start_file("db/dece.sqlite3", opts)
            .expect("start db entry");
        zipw.write_all(b"not-the-original-bytes")
            .expect("write db entry");
        zipw.finish().expect("finish zip");
    }

    let err = backup::import_workspace_bundle(&tampered_path, &workspace2)
        .expect_err("tampered bundle must be rejected");
    assert!(err.to_string().contains("checksum mismatch"));
    assert!(!workspace2.join("dece.sqlite3").exists());

    let _ = std::fs::remove_dir_all(workspace);
    let _ = std::fs::remove_dir_all(workspace2);
    let _ = std::fs::remove_dir_all(out_dir);
}

#[test]
fn legacy_sqlite_import_is_supported() {
    let out_dir = temp_dir("dece-backup-legacy");
    let workspace = temp_dir("dece-backup-legacy-dst");

    let legacy_file = out_dir.join("legacy.sqlite3");
    let bytes = b"legacy-sqlite-copy";
    std::fs::write(&legacy_file, bytes).expect("write legacy sqlite file");

    let import =
        backup::import_workspace_bundle(&legacy_file, &workspace).expect("import legacy sqlite");
    assert_eq!(import.bundle_format_detected, "legacy-sqlite3");
    assert!(import.db_sha256.is_none());

    let restored = std::fs::read(workspace.join("dece.sqlite3")).expect("read restored sqlite");
    assert_eq!(restored, bytes);

    let _ = std::fs::remove_dir_all(out_dir);
    let _ = std::fs::remove_dir_all(workspace);
}
