mod common;

use std::fs;
use std::path::Path;

use common::*;
use smb_registry::{run_extraction, DatasetKind, ExtractOptions, StageError};

fn options(in_dir: &Path, out_dir: &Path, kind: DatasetKind) -> ExtractOptions {
    ExtractOptions {
        in_dir: in_dir.to_path_buf(),
        out_dir: out_dir.to_path_buf(),
        kind,
        num_workers: 1,
        chunk_size: 100,
        activity_codes: Vec::new(),
        clear: false,
        show_progress: false,
    }
}

fn smb_documents(range: std::ops::Range<usize>) -> Vec<String> {
    range
        .map(|i| smb_document(&format!("77{:08}", i), "10.01.2022", "62.01"))
        .collect()
}

#[test]
fn one_worker_writes_ceil_n_over_k_chunks() {
    let dir = tempfile::tempdir().unwrap();
    let (src, dst) = (dir.path().join("download"), dir.path().join("extract"));
    write_zip(&src.join("a.zip"), &[("a1.xml", xml_entry(&smb_documents(0..4)))]);
    write_zip(&src.join("b.zip"), &[("b1.xml", xml_entry(&smb_documents(4..7)))]);

    let mut opts = options(&src, &dst, DatasetKind::Smb);
    opts.chunk_size = 3;
    let summary = run_extraction(&opts).unwrap();

    assert_eq!(summary.archives_processed, 2);
    assert_eq!(summary.rows_written, 7);
    assert_eq!(summary.chunk_files, 3);
    let mut names: Vec<String> = fs::read_dir(&dst)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
        .collect();
    names.sort();
    assert_eq!(names, vec!["data-000-000000.csv", "data-000-000001.csv", "data-000-000002.csv"]);
}

#[test]
fn normalizes_smb_documents() {
    let dir = tempfile::tempdir().unwrap();
    let (src, dst) = (dir.path().join("download"), dir.path().join("extract"));
    write_zip(
        &src.join("a.zip"),
        &[("a.xml", xml_entry(&[smb_document("7701234567", "10.01.2022", "62.01")]))],
    );
    run_extraction(&options(&src, &dst, DatasetKind::Smb)).unwrap();

    let (header, rows) = read_chunks(&dst);
    assert_eq!(header, DatasetKind::Smb.header());
    let row = &rows[0];
    assert_eq!(row[column(&header, "tin")], "7701234567");
    assert_eq!(row[column(&header, "org_name")], "ООО \"ТЕСТ 7701234567\"");
    assert_eq!(row[column(&header, "region_name")], "МОСКВА");
    assert_eq!(row[column(&header, "district_name")], "NA");
    assert_eq!(row[column(&header, "activity_group")], "J");
    assert_eq!(row[column(&header, "activity_code_main")], "62.01");
    assert_eq!(row[column(&header, "activity_codes_additional")], "46.90");
    assert_eq!(row[column(&header, "included_date")], "2016-08-01");
    assert_eq!(row[column(&header, "snapshot_date")], "2022-01-10");
}

#[test]
fn row_multiset_does_not_depend_on_worker_count() {
    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("download");
    for archive in 0..6 {
        let docs = smb_documents(archive * 10..archive * 10 + 5 + archive);
        write_zip(
            &src.join(format!("part-{}.zip", archive)),
            &[("one.xml", xml_entry(&docs[..2])), ("two.xml", xml_entry(&docs[2..]))],
        );
    }

    let mut results = Vec::new();
    for workers in [1, 4] {
        let dst = dir.path().join(format!("extract-{}", workers));
        let mut opts = options(&src, &dst, DatasetKind::Smb);
        opts.num_workers = workers;
        opts.chunk_size = 4;
        let summary = run_extraction(&opts).unwrap();
        assert_eq!(summary.archives_processed, 6);
        results.push(read_chunks(&dst).1);
    }
    assert_eq!(results[0].len(), 45);
    assert_eq!(results[0], results[1]);
}

#[test]
fn corrupt_entries_and_archives_are_counted_and_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let (src, dst) = (dir.path().join("download"), dir.path().join("extract"));
    let mut docs = vec![
        empl_document("7700000001", "10.01.2022", "5"),
        empl_document("7700000002", "10.01.2022", "1 200"),
    ];
    // No identifier: fails its record only.
    docs.push(r#"<Документ ДатаСост="10.01.2022"><СведССЧР КолРаб="3"/></Документ>"#.to_string());
    write_zip(
        &src.join("good.zip"),
        &[
            ("ok.xml", xml_entry(&docs)),
            ("broken.xml", b"<?xml version=\"1.0\"?><\xd4\xe0\xe9\xeb><unclosed>".to_vec()),
            ("readme.txt", b"not records".to_vec()),
        ],
    );
    fs::write(src.join("garbage.zip"), b"this is not a zip archive").unwrap();

    let summary = run_extraction(&options(&src, &dst, DatasetKind::Empl)).unwrap();
    assert_eq!(summary.archives_found, 2);
    assert_eq!(summary.archives_processed, 1);
    assert_eq!(summary.archives_failed, 1);
    assert_eq!(summary.entries_read, 2);
    assert_eq!(summary.entries_failed, 1);
    assert_eq!(summary.records_failed, 1);
    assert_eq!(summary.rows_written, 2);

    let (header, rows) = read_chunks(&dst);
    assert_eq!(rows[1][column(&header, "employees")], "1200");
}

#[test]
fn entry_with_a_broken_local_header_is_counted_as_failed() {
    let dir = tempfile::tempdir().unwrap();
    let (src, dst) = (dir.path().join("download"), dir.path().join("extract"));
    let archive = src.join("a.zip");
    write_zip(
        &archive,
        &[
            ("first.xml", xml_entry(&[empl_document("7700000001", "10.01.2022", "5")])),
            ("second.xml", xml_entry(&[empl_document("7700000002", "10.01.2022", "6")])),
        ],
    );
    let mut bytes = fs::read(&archive).unwrap();
    assert_eq!(&bytes[..4], b"PK\x03\x04");
    bytes[..4].copy_from_slice(&[0, 0, 0, 0]);
    fs::write(&archive, bytes).unwrap();

    let summary = run_extraction(&options(&src, &dst, DatasetKind::Empl)).unwrap();
    assert_eq!(summary.archives_failed, 0);
    assert_eq!(summary.entries_read, 2);
    assert_eq!(summary.entries_failed, 1);
    assert_eq!(summary.rows_written, 1);
    assert_eq!(read_chunks(&dst).1[0][0], "7700000002");
}

#[test]
fn activity_filter_drops_and_counts_non_matching_rows() {
    let dir = tempfile::tempdir().unwrap();
    let (src, dst) = (dir.path().join("download"), dir.path().join("extract"));
    let docs = vec![
        smb_document("1000000001", "10.01.2022", "01.11"),
        smb_document("1000000002", "10.01.2022", "47.11"),
        smb_document("1000000003", "10.01.2022", "62.01"),
        smb_document("1000000004", "10.01.2022", "01.2"),
        smb_document("1000000005", "10.01.2022", "01.11.2"),
    ];
    write_zip(&src.join("a.zip"), &[("a.xml", xml_entry(&docs))]);

    let mut opts = options(&src, &dst, DatasetKind::Smb);
    opts.activity_codes = vec!["01.11".into(), "j".into()];
    let summary = run_extraction(&opts).unwrap();
    assert_eq!(summary.rows_written, 3);
    assert_eq!(summary.rows_filtered, 2);

    let (header, rows) = read_chunks(&dst);
    let tins: Vec<&str> = rows.iter().map(|r| r[column(&header, "tin")].as_str()).collect();
    assert_eq!(tins, vec!["1000000001", "1000000003", "1000000005"]);
}

#[test]
fn filter_of_only_malformed_codes_stops_before_writing() {
    let dir = tempfile::tempdir().unwrap();
    let (src, dst) = (dir.path().join("download"), dir.path().join("extract"));
    let docs = vec![
        smb_document("1000000001", "10.01.2022", "01.11"),
        smb_document("1000000002", "10.01.2022", "62.01"),
    ];
    write_zip(&src.join("a.zip"), &[("a.xml", xml_entry(&docs))]);

    let mut opts = options(&src, &dst, DatasetKind::Smb);
    opts.activity_codes = vec!["Z".into(), "01,10".into()];
    assert!(matches!(run_extraction(&opts), Err(StageError::Configuration(_))));
    assert!(!dst.exists());
}

#[test]
fn activity_filter_is_ignored_for_companion_datasets() {
    let dir = tempfile::tempdir().unwrap();
    let (src, dst) = (dir.path().join("download"), dir.path().join("extract"));
    write_gz(
        &src.join("empl.xml.gz"),
        &xml_entry(&[empl_document("7700000001", "01.08.2020", "12")]),
    );
    let mut opts = options(&src, &dst, DatasetKind::Empl);
    opts.activity_codes = vec!["A".into()];
    let summary = run_extraction(&opts).unwrap();
    assert_eq!(summary.rows_written, 1);
    assert_eq!(summary.rows_filtered, 0);

    let (_, rows) = read_chunks(&dst);
    assert_eq!(rows, vec![vec!["7700000001", "АО ЛУЧ", "12", "2019-07-15", "2020-08-01"]]);
}

#[test]
fn reads_every_member_of_a_concatenated_gzip() {
    let dir = tempfile::tempdir().unwrap();
    let (src, dst) = (dir.path().join("download"), dir.path().join("extract"));
    let xml = xml_entry(&[
        empl_document("7700000001", "01.08.2020", "1"),
        empl_document("7700000002", "01.08.2020", "2"),
    ]);
    let (head, tail) = xml.split_at(xml.len() / 2);
    write_gz_members(&src.join("empl.xml.gz"), &[head, tail]);

    let summary = run_extraction(&options(&src, &dst, DatasetKind::Empl)).unwrap();
    assert_eq!(summary.entries_failed, 0);
    assert_eq!(summary.rows_written, 2);
}

#[test]
fn clear_flag_removes_previous_output() {
    let dir = tempfile::tempdir().unwrap();
    let (src, dst) = (dir.path().join("download"), dir.path().join("extract"));
    write_zip(&src.join("a.zip"), &[("a.xml", xml_entry(&smb_documents(0..2)))]);
    fs::create_dir_all(&dst).unwrap();
    fs::write(dst.join("data-007-000000.csv"), "stale").unwrap();

    run_extraction(&options(&src, &dst, DatasetKind::Smb)).unwrap();
    assert!(dst.join("data-007-000000.csv").exists());

    let mut opts = options(&src, &dst, DatasetKind::Smb);
    opts.clear = true;
    run_extraction(&opts).unwrap();
    assert!(!dst.join("data-007-000000.csv").exists());
    assert_eq!(read_chunks(&dst).1.len(), 2);
}

#[test]
fn empty_source_directory_produces_no_chunks() {
    let dir = tempfile::tempdir().unwrap();
    let (src, dst) = (dir.path().join("download"), dir.path().join("extract"));
    fs::create_dir_all(&src).unwrap();
    let summary = run_extraction(&options(&src, &dst, DatasetKind::Revexp)).unwrap();
    assert_eq!(summary.archives_found, 0);
    assert_eq!(summary.chunk_files, 0);
}

#[test]
fn missing_source_directory_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let opts = options(&dir.path().join("nope"), dir.path(), DatasetKind::Smb);
    assert!(matches!(run_extraction(&opts), Err(StageError::Io { .. })));
}
