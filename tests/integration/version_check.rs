//! Version-file validation and trace discovery via the latest-trace
//! symlink.

use std::fs;

use replay_trace::trace::{
    TraceLocator, TraceMetadata, TraceOpenError, TraceReader, TraceWriter, EX_DATAERR,
};

fn record_empty_trace(root: &std::path::Path) -> std::path::PathBuf {
    let locator = TraceLocator::new(root);
    let mut writer = TraceWriter::create(&locator, "victim", &TraceMetadata::default()).unwrap();
    let dir = writer.dir().to_path_buf();
    writer.close().unwrap();
    dir
}

#[test]
fn current_version_is_accepted() {
    let tmp = tempfile::tempdir().unwrap();
    let dir = record_empty_trace(tmp.path());

    let version_file = fs::read(dir.join("version")).unwrap();
    assert!(version_file.starts_with(b"85\n"));

    let reader = TraceReader::open(&dir).unwrap();
    assert_eq!(reader.uuid().len(), 16);
}

#[test]
fn version_mismatch_is_rejected_with_data_error() {
    let tmp = tempfile::tempdir().unwrap();
    let dir = record_empty_trace(tmp.path());
    fs::write(dir.join("version"), b"84\n").unwrap();

    let err = TraceReader::open(&dir).unwrap_err();
    assert!(matches!(err, TraceOpenError::VersionMismatch { found: 84, .. }));
    assert_eq!(err.exit_code(), EX_DATAERR);
    let msg = err.to_string();
    assert!(msg.contains("84") && msg.contains("85"));
}

#[test]
fn missing_version_file_means_no_trace() {
    let tmp = tempfile::tempdir().unwrap();
    let dir = record_empty_trace(tmp.path());
    fs::remove_file(dir.join("version")).unwrap();

    let err = TraceReader::open(&dir).unwrap_err();
    assert!(matches!(err, TraceOpenError::NotFound { .. }));
    assert_eq!(err.exit_code(), EX_DATAERR);
}

#[test]
fn malformed_version_line_is_rejected() {
    let tmp = tempfile::tempdir().unwrap();
    let dir = record_empty_trace(tmp.path());
    fs::write(dir.join("version"), b"not-a-number\n").unwrap();

    let err = TraceReader::open(&dir).unwrap_err();
    assert!(matches!(err, TraceOpenError::MalformedVersion { .. }));
    assert_eq!(err.exit_code(), EX_DATAERR);
}

#[test]
fn truncated_header_is_rejected() {
    let tmp = tempfile::tempdir().unwrap();
    let dir = record_empty_trace(tmp.path());
    fs::write(dir.join("version"), b"85\n").unwrap();

    let err = TraceReader::open(&dir).unwrap_err();
    assert!(matches!(err, TraceOpenError::MalformedHeader { .. }));
}

#[test]
fn latest_trace_symlink_tracks_the_last_writer() {
    let tmp = tempfile::tempdir().unwrap();
    let locator = TraceLocator::new(tmp.path());

    let mut first = TraceWriter::create(&locator, "app", &TraceMetadata::default()).unwrap();
    first.close().unwrap();
    first.make_latest_trace(&locator).unwrap();

    let mut second = TraceWriter::create(&locator, "app", &TraceMetadata::default()).unwrap();
    let second_dir = second.dir().to_path_buf();
    let second_uuid = second.uuid();
    second.close().unwrap();
    second.make_latest_trace(&locator).unwrap();

    let link = fs::read_link(locator.latest_trace_symlink()).unwrap();
    assert_eq!(link, second_dir);

    let reader = TraceReader::open_latest(&locator).unwrap();
    assert_eq!(reader.uuid(), second_uuid);
}
