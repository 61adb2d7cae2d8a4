use std::path::Path;

use journal::{Error, JournalConfig, JournalReader, JournalRecord, SegmentedJournal, ASQN_IGNORE};
use tempfile::tempdir;

const SMALL_SEGMENT: usize = 512;

fn config(dir: &Path, max_segment_size: usize) -> JournalConfig {
    JournalConfig {
        max_segment_size,
        preallocate_segment_files: false,
        index_density: 4,
        ..JournalConfig::new(dir)
    }
}

fn read_all(journal: &SegmentedJournal) -> Vec<JournalRecord> {
    let mut reader = journal.open_reader().expect("reader");
    let mut records = Vec::new();
    while let Some(record) = reader.next().expect("next") {
        records.push(record);
    }
    records
}

#[test]
fn truncate_then_append_replaces_the_tail() {
    let dir = tempdir().expect("tempdir");
    let mut journal = SegmentedJournal::open(config(dir.path(), 4096)).expect("open");
    for data in [b"a", b"b", b"c"] {
        journal.append(ASQN_IGNORE, data).expect("append");
    }
    journal.delete_after(1).expect("truncate");
    let record = journal.append(ASQN_IGNORE, b"d").expect("append");
    assert_eq!(record.index, 2);

    let records: Vec<(i64, Vec<u8>)> = read_all(&journal)
        .into_iter()
        .map(|record| (record.index, record.data))
        .collect();
    assert_eq!(records, vec![(1, b"a".to_vec()), (2, b"d".to_vec())]);
}

#[test]
fn records_survive_reopen_across_segments() {
    let dir = tempdir().expect("tempdir");
    {
        let mut journal = SegmentedJournal::open(config(dir.path(), SMALL_SEGMENT)).expect("open");
        for i in 1..=25 {
            journal
                .append(i * 2, format!("record-{i:02}").as_bytes())
                .expect("append");
        }
        assert!(journal.segment_count() >= 3);
        journal.close().expect("close");
    }

    let mut journal = SegmentedJournal::open(config(dir.path(), SMALL_SEGMENT)).expect("reopen");
    assert_eq!(journal.first_index(), 1);
    assert_eq!(journal.last_index(), 25);
    assert_eq!(journal.last_asqn(), 50);
    let records = read_all(&journal);
    assert_eq!(records.len(), 25);
    for (i, record) in records.iter().enumerate() {
        let expected = i as i64 + 1;
        assert_eq!(record.index, expected);
        assert_eq!(record.asqn, expected * 2);
        assert_eq!(record.data, format!("record-{expected:02}").into_bytes());
        assert!(record.verify_checksum());
    }

    assert!(matches!(
        journal.append(50, b"late"),
        Err(Error::InvalidAsqn { .. })
    ));
    assert_eq!(journal.append(51, b"next").expect("append").index, 26);
}

#[test]
fn seek_clamps_to_the_journal_bounds() {
    let dir = tempdir().expect("tempdir");
    let mut journal = SegmentedJournal::open(config(dir.path(), SMALL_SEGMENT)).expect("open");
    for i in 1..=30 {
        journal
            .append(ASQN_IGNORE, format!("record-{i:02}").as_bytes())
            .expect("append");
    }
    let mut reader = journal.open_reader().expect("reader");

    assert_eq!(reader.seek(15).expect("seek"), 15);
    assert_eq!(reader.next().expect("next").map(|r| r.index), Some(15));

    assert_eq!(reader.seek(-7).expect("seek below"), 1);
    assert_eq!(reader.next_index(), 1);

    assert_eq!(reader.seek(1_000).expect("seek above"), 31);
    assert!(!reader.has_next().expect("has_next"));
    assert_eq!(reader.next().expect("next"), None);

    assert_eq!(reader.seek_to_last().expect("last"), 30);
    assert_eq!(reader.next().expect("next").map(|r| r.index), Some(30));
    assert_eq!(reader.seek_to_first().expect("first"), 1);

    journal.delete_until(20).expect("compact");
    let first = journal.first_index();
    assert!(first > 1 && first <= 20);
    assert_eq!(reader.seek(1).expect("seek after compaction"), first);
}

#[test]
fn seek_to_asqn_lands_on_the_floor_record() {
    let dir = tempdir().expect("tempdir");
    let mut journal = SegmentedJournal::open(config(dir.path(), 4096)).expect("open");
    journal.append(10, b"x").expect("append");
    journal.append(ASQN_IGNORE, b"y").expect("append");
    journal.append(20, b"z").expect("append");
    journal.append(30, b"w").expect("append");

    let mut reader = journal.open_reader().expect("reader");
    assert_eq!(reader.seek_to_asqn(25).expect("seek"), 3);
    assert_eq!(reader.next().expect("next").map(|r| r.asqn), Some(20));
    assert_eq!(reader.seek_to_asqn(30).expect("seek"), 4);
    assert_eq!(reader.seek_to_asqn(5).expect("seek"), 1);
    assert_eq!(reader.seek_to_asqn_with_bound(35, 3).expect("bounded"), 3);
}

#[test]
fn replicated_records_keep_index_and_checksum() {
    let source_dir = tempdir().expect("tempdir");
    let target_dir = tempdir().expect("tempdir");
    let mut source = SegmentedJournal::open(config(source_dir.path(), 4096)).expect("source");
    let mut target = SegmentedJournal::open(config(target_dir.path(), 4096)).expect("target");

    for i in 1..=3 {
        source.append(i, format!("entry {i}").as_bytes()).expect("append");
    }
    for record in read_all(&source) {
        let copied = target.append_record(&record).expect("replicate");
        assert_eq!(copied, record);
    }
    assert_eq!(read_all(&target), read_all(&source));

    let next = JournalRecord::new(4, 4, b"entry 4".to_vec());
    let err = target
        .append_serialized(next.checksum ^ 1, &next.serialized())
        .expect_err("bad checksum");
    assert!(matches!(err, Error::InvalidChecksum { index: 4, .. }));
    assert_eq!(target.last_index(), 3);

    let skipped = JournalRecord::new(6, 6, b"entry 6".to_vec());
    assert!(matches!(
        target.append_record(&skipped),
        Err(Error::InvalidIndex {
            index: 6,
            expected: 4
        })
    ));
    assert_eq!(target.append_record(&next).expect("append").index, 4);
}

#[test]
fn reset_restarts_at_the_requested_index() {
    let dir = tempdir().expect("tempdir");
    let mut journal = SegmentedJournal::open(config(dir.path(), SMALL_SEGMENT)).expect("open");
    for _ in 0..20 {
        journal.append(ASQN_IGNORE, b"record").expect("append");
    }
    journal.flush().expect("flush");

    journal.reset(500).expect("reset");
    assert!(journal.is_empty());
    assert_eq!(journal.first_index(), 500);
    assert_eq!(journal.last_index(), 499);
    assert_eq!(journal.segment_count(), 1);
    assert_eq!(journal.append(ASQN_IGNORE, b"fresh").expect("append").index, 500);
    journal.close().expect("close");

    let journal = SegmentedJournal::open(config(dir.path(), SMALL_SEGMENT)).expect("reopen");
    assert_eq!(journal.first_index(), 500);
    assert_eq!(journal.last_index(), 500);
}

#[test]
fn config_is_validated_on_open() {
    let dir = tempdir().expect("tempdir");
    let err = SegmentedJournal::open(config(dir.path(), 64)).expect_err("too small");
    assert!(matches!(err, Error::SegmentSizeTooSmall { .. }));

    let unnamed = JournalConfig {
        name: String::new(),
        ..config(dir.path(), 4096)
    };
    assert!(matches!(
        SegmentedJournal::open(unnamed),
        Err(Error::InvalidConfig(_))
    ));
}
