//! Mapping classification and replay-side mapping reads.
//!
//! File cloning is disabled in these tests so classification does not
//! depend on whether the test filesystem supports reflinks.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use replay_trace::trace::{
    EncodedEvent, FileStat, KernelMapping, MappedDataSource, MappingOrigin, RecordInTrace,
    TimeConstraint, TraceFrame, TraceLocator, TraceMetadata, TraceReader, TraceWriter,
    ValidateSourceFile,
};

fn new_writer(root: &Path) -> TraceWriter {
    let meta = TraceMetadata {
        use_file_cloning: false,
        ..TraceMetadata::default()
    };
    TraceWriter::create(&TraceLocator::new(root), "mapper", &meta).unwrap()
}

fn file_mapping(path: &Path, stat: &FileStat, flags: i32) -> KernelMapping {
    KernelMapping::new(
        0x7000_0000,
        0x7000_4000,
        path.to_str().unwrap(),
        stat.dev,
        stat.inode,
        libc::PROT_READ,
        flags,
        0,
    )
}

fn stat_of(path: &Path) -> FileStat {
    FileStat::of(&fs::metadata(path).unwrap())
}

#[test]
fn remap_origin_is_zero_backed() {
    let tmp = tempfile::tempdir().unwrap();
    let mut writer = new_writer(tmp.path());
    let trace_dir = writer.dir().to_path_buf();

    let km = KernelMapping::new(
        0x1000,
        0x3000,
        "",
        0,
        0,
        libc::PROT_READ | libc::PROT_WRITE,
        libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
        0,
    );
    let decision = writer
        .write_mapped_region(&km, &FileStat::default(), MappingOrigin::Remap)
        .unwrap();
    assert_eq!(decision, RecordInTrace::DontRecordInTrace);

    let frame = TraceFrame::new(1, 1, EncodedEvent::new(0), 0, 0.0);
    writer.write_frame(&frame).unwrap();
    writer.close().unwrap();

    let mut reader = TraceReader::open(&trace_dir).unwrap();
    let (read_km, data) = reader
        .read_mapped_region(ValidateSourceFile::DontValidate, TimeConstraint::AnyTime)
        .unwrap()
        .unwrap();
    assert_eq!(data.source, MappedDataSource::Zero);
    assert_eq!(data.time, 1);
    assert_eq!(read_km, km);
}

#[test]
fn anonymous_syscall_mappings_are_zero_backed() {
    let tmp = tempfile::tempdir().unwrap();
    let mut writer = new_writer(tmp.path());

    let km = KernelMapping::new(
        0x1000,
        0x2000,
        "/dev/zero (deleted)",
        8,
        77,
        libc::PROT_READ,
        libc::MAP_SHARED,
        0,
    );
    let decision = writer
        .write_mapped_region(&km, &FileStat::default(), MappingOrigin::Syscall)
        .unwrap();
    assert_eq!(decision, RecordInTrace::DontRecordInTrace);
    writer.close().unwrap();
}

#[test]
fn sysv_shared_memory_is_copied_into_trace() {
    let tmp = tempfile::tempdir().unwrap();
    let mut writer = new_writer(tmp.path());

    let km = KernelMapping::new(
        0x1000,
        0x2000,
        "/SYSV00000042 (deleted)",
        0,
        0,
        libc::PROT_READ | libc::PROT_WRITE,
        libc::MAP_SHARED,
        0,
    );
    let decision = writer
        .write_mapped_region(&km, &FileStat::default(), MappingOrigin::Syscall)
        .unwrap();
    assert_eq!(decision, RecordInTrace::RecordInTrace);
    writer.close().unwrap();
}

#[test]
fn writable_file_is_copied_into_trace() {
    let tmp = tempfile::tempdir().unwrap();
    let src_dir = tempfile::tempdir().unwrap();
    let file_path = src_dir.path().join("data.bin");
    fs::write(&file_path, vec![0x5a; 4096]).unwrap();

    let mut writer = new_writer(tmp.path());
    let trace_dir = writer.dir().to_path_buf();

    let stat = stat_of(&file_path);
    let km = file_mapping(&file_path, &stat, libc::MAP_PRIVATE);
    let decision = writer
        .write_mapped_region(&km, &stat, MappingOrigin::Syscall)
        .unwrap();
    assert_eq!(decision, RecordInTrace::RecordInTrace);

    // The caller contract: a Trace-backed mapping's bytes follow as raw
    // data.
    writer.write_raw(1, km.start(), &fs::read(&file_path).unwrap()).unwrap();
    let frame = TraceFrame::new(1, 1, EncodedEvent::new(0), 0, 0.0);
    writer.write_frame(&frame).unwrap();
    writer.close().unwrap();

    let mut reader = TraceReader::open(&trace_dir).unwrap();
    let (_, data) = reader
        .read_mapped_region(ValidateSourceFile::Validate, TimeConstraint::AnyTime)
        .unwrap()
        .unwrap();
    assert_eq!(data.source, MappedDataSource::Trace);
    assert_eq!(data.file_size_bytes, 4096);

    let frame = reader.read_frame().unwrap();
    let raw = reader.read_raw_data_for_frame(&frame).unwrap().unwrap();
    assert_eq!(raw.data.len(), 4096);
}

#[test]
fn read_only_file_is_pinned_and_remembered_immutable() {
    let tmp = tempfile::tempdir().unwrap();
    let src_dir = tempfile::tempdir().unwrap();
    let file_path = src_dir.path().join("lib.so");
    fs::write(&file_path, vec![0x7f; 1024]).unwrap();
    fs::set_permissions(&file_path, fs::Permissions::from_mode(0o444)).unwrap();

    let mut writer = new_writer(tmp.path());
    let trace_dir = writer.dir().to_path_buf();

    let stat = stat_of(&file_path);
    let km = file_mapping(&file_path, &stat, libc::MAP_SHARED);
    let decision = writer
        .write_mapped_region(&km, &stat, MappingOrigin::Syscall)
        .unwrap();
    assert_eq!(decision, RecordInTrace::DontRecordInTrace);

    // Once pinned, the file stays file-backed even after it becomes
    // copy-eligible: the writer assumed it immutable.
    fs::set_permissions(&file_path, fs::Permissions::from_mode(0o644)).unwrap();
    let stat2 = stat_of(&file_path);
    let km2 = file_mapping(&file_path, &stat2, libc::MAP_SHARED);
    let decision2 = writer
        .write_mapped_region(&km2, &stat2, MappingOrigin::Syscall)
        .unwrap();
    assert_eq!(decision2, RecordInTrace::DontRecordInTrace);

    let frame = TraceFrame::new(1, 1, EncodedEvent::new(0), 0, 0.0);
    writer.write_frame(&frame).unwrap();
    writer.close().unwrap();

    let mut reader = TraceReader::open(&trace_dir).unwrap();
    let reader_dir = reader.dir().to_path_buf();
    let (_, data) = reader
        .read_mapped_region(ValidateSourceFile::Validate, TimeConstraint::AnyTime)
        .unwrap()
        .unwrap();
    assert_eq!(data.source, MappedDataSource::File);
    assert!(data.file_name.is_absolute());
    // Hardlinked into the trace when the filesystems allow it, otherwise
    // recorded by original path.
    let in_trace = data.file_name.parent() == Some(reader_dir.as_path());
    if in_trace {
        let name = data.file_name.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with("mmap_hardlink_0_"));
    } else {
        assert_eq!(
            data.file_name.canonicalize().unwrap(),
            file_path.canonicalize().unwrap()
        );
    }

    let (_, data2) = reader
        .read_mapped_region(ValidateSourceFile::DontValidate, TimeConstraint::AnyTime)
        .unwrap()
        .unwrap();
    assert_eq!(data2.source, MappedDataSource::File);
}

#[test]
fn metadata_divergence_warns_but_replay_continues() {
    let tmp = tempfile::tempdir().unwrap();
    let src_dir = tempfile::tempdir().unwrap();
    let file_path = src_dir.path().join("config");
    fs::write(&file_path, b"original contents").unwrap();
    fs::set_permissions(&file_path, fs::Permissions::from_mode(0o444)).unwrap();

    let mut writer = new_writer(tmp.path());
    let trace_dir = writer.dir().to_path_buf();
    let stat = stat_of(&file_path);
    let km = file_mapping(&file_path, &stat, libc::MAP_SHARED);
    writer
        .write_mapped_region(&km, &stat, MappingOrigin::Syscall)
        .unwrap();
    writer.close().unwrap();

    // Rewrite the file in place; size and mtime now diverge from the
    // snapshot (the hardlink shares the inode, so this hits both paths).
    fs::set_permissions(&file_path, fs::Permissions::from_mode(0o644)).unwrap();
    fs::write(&file_path, b"diverged").unwrap();

    let mut reader = TraceReader::open(&trace_dir).unwrap();
    let (_, data) = reader
        .read_mapped_region(ValidateSourceFile::Validate, TimeConstraint::AnyTime)
        .unwrap()
        .unwrap();
    assert_eq!(data.source, MappedDataSource::File);
}

#[test]
fn missing_backing_file_fails_validation() {
    let tmp = tempfile::tempdir().unwrap();
    let src_dir = tempfile::tempdir().unwrap();
    let file_path = src_dir.path().join("gone");
    fs::write(&file_path, b"bytes").unwrap();
    fs::set_permissions(&file_path, fs::Permissions::from_mode(0o444)).unwrap();

    let mut writer = new_writer(tmp.path());
    let trace_dir = writer.dir().to_path_buf();
    let stat = stat_of(&file_path);
    let km = file_mapping(&file_path, &stat, libc::MAP_SHARED);
    writer
        .write_mapped_region(&km, &stat, MappingOrigin::Syscall)
        .unwrap();
    writer.close().unwrap();

    // Delete the original and any pinned copy in the trace.
    fs::set_permissions(&file_path, fs::Permissions::from_mode(0o644)).unwrap();
    fs::remove_file(&file_path).unwrap();
    for entry in fs::read_dir(&trace_dir).unwrap() {
        let entry = entry.unwrap();
        if entry
            .file_name()
            .to_string_lossy()
            .starts_with("mmap_hardlink_")
        {
            fs::remove_file(entry.path()).unwrap();
        }
    }

    let mut reader = TraceReader::open(&trace_dir).unwrap();
    let err = reader
        .read_mapped_region(ValidateSourceFile::Validate, TimeConstraint::AnyTime)
        .unwrap_err();
    assert!(err.to_string().contains("replay is impossible"));
}

#[test]
fn current_time_only_reads_are_speculative() {
    let tmp = tempfile::tempdir().unwrap();
    let mut writer = new_writer(tmp.path());
    let trace_dir = writer.dir().to_path_buf();

    let km1 = KernelMapping::new(0x1000, 0x2000, "", 0, 0, 0, libc::MAP_PRIVATE, 0);
    writer
        .write_mapped_region(&km1, &FileStat::default(), MappingOrigin::Remap)
        .unwrap();
    let frame1 = TraceFrame::new(1, 1, EncodedEvent::new(0), 0, 0.0);
    writer.write_frame(&frame1).unwrap();

    let km2 = KernelMapping::new(0x5000, 0x6000, "", 0, 0, 0, libc::MAP_PRIVATE, 0);
    writer
        .write_mapped_region(&km2, &FileStat::default(), MappingOrigin::Remap)
        .unwrap();
    let frame2 = TraceFrame::new(2, 1, EncodedEvent::new(0), 0, 0.0);
    writer.write_frame(&frame2).unwrap();
    writer.close().unwrap();

    let mut reader = TraceReader::open(&trace_dir).unwrap();

    // At time 0 the first mapping (time 1) is in the future: untouched.
    assert!(reader
        .read_mapped_region(
            ValidateSourceFile::DontValidate,
            TimeConstraint::CurrentTimeOnly
        )
        .unwrap()
        .is_none());

    reader.read_frame().unwrap();
    let (read_km1, _) = reader
        .read_mapped_region(
            ValidateSourceFile::DontValidate,
            TimeConstraint::CurrentTimeOnly,
        )
        .unwrap()
        .unwrap();
    assert_eq!(read_km1, km1);

    // The second mapping belongs to frame 2, not the current frame.
    assert!(reader
        .read_mapped_region(
            ValidateSourceFile::DontValidate,
            TimeConstraint::CurrentTimeOnly
        )
        .unwrap()
        .is_none());

    reader.read_frame().unwrap();
    let (read_km2, _) = reader
        .read_mapped_region(
            ValidateSourceFile::DontValidate,
            TimeConstraint::CurrentTimeOnly,
        )
        .unwrap()
        .unwrap();
    assert_eq!(read_km2, km2);
}
