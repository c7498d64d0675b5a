use std::collections::HashMap;

use anyhow::Error;

use dbs_datastore::config::{self, UnfinishedRecord};
use dbs_datastore::file_formats::{RecordKey, SessionBlockHeader, SessionRecordHeader};
use dbs_datastore::volume::Volume;
use dbs_datastore::StoreError;

fn record_header(session_id: u32, file_index: i32, data_len: u32) -> SessionRecordHeader {
    SessionRecordHeader {
        session_id,
        session_time: 1_700_000_000,
        file_index,
        stream: 1,
        data_len,
    }
}

fn block_header(number: u32) -> SessionBlockHeader {
    SessionBlockHeader {
        checksum: 0,
        block_size: 64 * 1024,
        block_number: number,
        id: *b"BB02",
        session_id: 1,
        session_time: 1_700_000_000,
    }
}

#[test]
fn writes_and_reopens_a_volume() -> Result<(), Error> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("vol");

    let mut volume = Volume::create(&path, 64 * 1024)?;

    // one record written to completion, one left half way
    let done = record_header(1, 1, 8);
    volume.begin_record(&done)?;
    assert!(volume.append_record_data(RecordKey::of(&done), b"complete")?);

    let partial = record_header(1, 2, 16);
    volume.begin_record(&partial)?;
    assert!(!volume.append_record_data(RecordKey::of(&partial), b"first ha")?);

    volume.append_block(&block_header(0))?;
    volume.flush()?;
    assert!(volume.is_ok());
    let before: Vec<_> = volume
        .unfinished_records()
        .map(|(key, loc)| (*key, *loc))
        .collect();
    assert_eq!(before.len(), 1);
    drop(volume);

    let mut reopened = Volume::open(&path)?;
    let after: Vec<_> = reopened
        .unfinished_records()
        .map(|(key, loc)| (*key, *loc))
        .collect();
    assert_eq!(after, before);
    assert_eq!(reopened.block_count(), 1);
    assert_eq!(reopened.record_count(), 2);

    // the resumed record finishes after the restart
    assert!(reopened.append_record_data(RecordKey::of(&partial), b"lf + end")?);
    assert_eq!(reopened.unfinished_records().count(), 0);
    reopened.flush()?;
    Ok(())
}

#[test]
fn payload_round_trips_through_the_data_file() -> Result<(), Error> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("vol");

    let mut volume = Volume::create(&path, 4096)?;
    let record = record_header(7, 1, 12);
    volume.begin_record(&record)?;
    volume.append_record_data(RecordKey::of(&record), b"hello volume")?;
    volume.flush()?;
    drop(volume);

    let mut reopened = Volume::open(&path)?;
    let header = reopened.record_header_at(0)?;
    assert_eq!(header.key(), RecordKey::of(&record));
    assert_eq!(header.size, 12);
    assert_eq!(reopened.read_record_data(&header)?, b"hello volume");
    Ok(())
}

#[test]
fn blocks_cover_their_records() -> Result<(), Error> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("vol");

    let mut volume = Volume::create(&path, 4096)?;
    for file_index in 1..=2 {
        let record = record_header(1, file_index, 4);
        volume.begin_record(&record)?;
        volume.append_record_data(RecordKey::of(&record), b"data")?;
    }
    volume.append_block(&block_header(0))?;

    let record = record_header(1, 3, 4);
    volume.begin_record(&record)?;
    volume.append_record_data(RecordKey::of(&record), b"more")?;
    volume.append_block(&block_header(1))?;

    let first = volume.block_header_at(0)?;
    assert_eq!(first.record_start, 0);
    assert_eq!(first.record_count, 2);
    let second = volume.block_header_at(1)?;
    assert_eq!(second.record_start, 2);
    assert_eq!(second.record_count, 1);
    assert_eq!(second.block_number, 1);
    Ok(())
}

#[test]
fn stamps_short_records_on_completion() -> Result<(), Error> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("vol");

    let mut volume = Volume::create(&path, 4096)?;
    let record = record_header(1, 1, 16);
    volume.begin_record(&record)?;
    volume.append_record_data(RecordKey::of(&record), b"only 8 b")?;
    volume.complete_record(RecordKey::of(&record))?;
    assert_eq!(volume.unfinished_records().count(), 0);

    let header = volume.record_header_at(0)?;
    assert_eq!(header.size, 8);
    assert_eq!(volume.read_record_data(&header)?, b"only 8 b");

    volume.flush()?;
    drop(volume);
    let reopened = Volume::open(&path)?;
    assert_eq!(reopened.unfinished_records().count(), 0);
    Ok(())
}

#[test]
fn routes_records_to_matching_data_files() -> Result<(), Error> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("vol");

    let mut volume = Volume::create(&path, 1)?;
    assert_eq!(volume.add_data_file(4096)?, 1);

    let aligned = record_header(1, 1, 8192);
    volume.begin_record(&aligned)?;
    let odd = record_header(1, 2, 100);
    volume.begin_record(&odd)?;

    let locs: HashMap<_, _> = volume
        .unfinished_records()
        .map(|(key, loc)| (*key, *loc))
        .collect();
    assert_eq!(locs[&RecordKey::of(&aligned)].file_index, 1);
    assert_eq!(locs[&RecordKey::of(&odd)].file_index, 0);

    volume.flush()?;
    drop(volume);
    let reopened = Volume::open(&path)?;
    assert_eq!(reopened.data_file_count(), 2);
    assert_eq!(reopened.unfinished_records().count(), 2);
    Ok(())
}

#[test]
fn rejects_a_sidecar_with_foreign_header_sizes() -> Result<(), Error> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("vol");
    Volume::create(&path, 4096)?;

    // rewrite the sidecar claiming a different store block header size
    let bytes = std::fs::read(path.join("config"))?;
    let mut parsed = config::from_bytes(&bytes)?;
    parsed.info.store_block_header_size += 8;
    std::fs::write(path.join("config"), config::to_bytes(&parsed))?;

    match Volume::open(&path) {
        Err(StoreError::IncompatibleLayout { field, .. }) => {
            assert_eq!(field, "store_block_header_size");
        }
        Err(err) => panic!("expected IncompatibleLayout, got {err:?}"),
        Ok(_) => panic!("expected IncompatibleLayout, volume opened"),
    }
    Ok(())
}

#[test]
fn reload_failure_leaves_the_volume_alone() -> Result<(), Error> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("vol");

    let mut volume = Volume::create(&path, 4096)?;
    let record = record_header(1, 1, 16);
    volume.begin_record(&record)?;
    volume.flush()?;
    let before: Vec<_> = volume
        .unfinished_records()
        .map(|(key, loc)| (*key, *loc))
        .collect();

    // corrupt the sidecar on disk behind the live volume's back
    std::fs::write(path.join("config"), b"garbage")?;
    assert!(matches!(volume.reload(), Err(StoreError::Corrupt(_))));

    let after: Vec<_> = volume
        .unfinished_records()
        .map(|(key, loc)| (*key, *loc))
        .collect();
    assert_eq!(after, before);
    assert!(volume.is_ok());

    // the volume still works: the next flush rewrites a good sidecar
    volume.flush()?;
    drop(volume);
    let reopened = Volume::open(&path)?;
    assert_eq!(reopened.unfinished_records().count(), 1);
    Ok(())
}

#[test]
fn reload_picks_up_a_rewritten_sidecar() -> Result<(), Error> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("vol");

    let mut volume = Volume::create(&path, 4096)?;
    let record = record_header(1, 1, 16);
    volume.begin_record(&record)?;
    volume.flush()?;
    assert_eq!(volume.unfinished_records().count(), 1);

    // an empty unfinished table written behind the volume's back
    let bytes = std::fs::read(path.join("config"))?;
    let mut parsed = config::from_bytes(&bytes)?;
    parsed.unfinished.clear();
    std::fs::write(path.join("config"), config::to_bytes(&parsed))?;

    volume.reload()?;
    assert_eq!(volume.unfinished_records().count(), 0);
    Ok(())
}

#[test]
fn rejects_duplicate_unfinished_rows() -> Result<(), Error> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("vol");

    let mut volume = Volume::create(&path, 4096)?;
    let record = record_header(1, 1, 16);
    volume.begin_record(&record)?;
    volume.flush()?;
    drop(volume);

    let bytes = std::fs::read(path.join("config"))?;
    let mut parsed = config::from_bytes(&bytes)?;
    assert_eq!(parsed.unfinished.len(), 1);
    let row = parsed.unfinished[0];
    parsed.unfinished.push(row);
    std::fs::write(path.join("config"), config::to_bytes(&parsed))?;

    assert!(matches!(
        Volume::open(&path),
        Err(StoreError::DuplicateKey(key)) if key == row.key
    ));
    Ok(())
}

#[test]
fn rejects_unfinished_rows_past_the_data_end() -> Result<(), Error> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("vol");
    Volume::create(&path, 4096)?;

    let bytes = std::fs::read(path.join("config"))?;
    let mut parsed = config::from_bytes(&bytes)?;
    parsed.unfinished.push(UnfinishedRecord {
        key: RecordKey {
            session_id: 9,
            session_time: 1_700_000_000,
            file_index: 1,
            stream: 1,
        },
        data_file: 0,
        file_offset: 100,
        size: 100,
    });
    std::fs::write(path.join("config"), config::to_bytes(&parsed))?;

    assert!(matches!(
        Volume::open(&path),
        Err(StoreError::Corrupt(_))
    ));
    Ok(())
}

#[test]
fn rejects_wrong_section_counts() -> Result<(), Error> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("vol");
    Volume::create(&path, 4096)?;

    let bytes = std::fs::read(path.join("config"))?;
    let mut parsed = config::from_bytes(&bytes)?;
    let extra = parsed.block_files[0].clone();
    parsed.block_files.push(extra);
    std::fs::write(path.join("config"), config::to_bytes(&parsed))?;

    assert!(matches!(
        Volume::open(&path),
        Err(StoreError::Corrupt(_))
    ));
    Ok(())
}

#[test]
fn refuses_to_create_over_an_existing_volume() -> Result<(), Error> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("vol");
    Volume::create(&path, 4096)?;
    assert!(matches!(
        Volume::create(&path, 4096),
        Err(StoreError::Io(_))
    ));
    Ok(())
}
