//! Segment rotation and reclamation.

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::wal::{EntryKind, Wal};
    use tempfile::TempDir;

    fn segment_names(dir: &std::path::Path) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(dir.join("wal"))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn rotate_creates_next_segment() {
        let tmp = TempDir::new().unwrap();
        let (wal, _) = Wal::open(tmp.path(), 100, Duration::from_millis(10)).unwrap();

        wal.append(EntryKind::Put, b"a", b"1").unwrap();
        let sealed = wal.rotate().unwrap();
        assert_eq!(sealed, 1);
        wal.append(EntryKind::Put, b"b", b"2").unwrap();
        wal.close().unwrap();

        assert_eq!(segment_names(tmp.path()), vec!["000001.log", "000002.log"]);
    }

    #[test]
    fn entries_span_segments_on_replay() {
        let tmp = TempDir::new().unwrap();
        {
            let (wal, _) = Wal::open(tmp.path(), 100, Duration::from_millis(10)).unwrap();
            wal.append(EntryKind::Put, b"old", b"1").unwrap();
            wal.rotate().unwrap();
            wal.append(EntryKind::Put, b"new", b"2").unwrap();
            wal.close().unwrap();
        }

        let (_, recovered) = Wal::open(tmp.path(), 100, Duration::from_millis(10)).unwrap();
        let keys: Vec<&[u8]> = recovered.iter().map(|e| e.key.as_slice()).collect();
        assert_eq!(keys, vec![b"old".as_slice(), b"new".as_slice()]);
    }

    #[test]
    fn sealed_segments_can_be_removed() {
        let tmp = TempDir::new().unwrap();
        let (wal, _) = Wal::open(tmp.path(), 100, Duration::from_millis(10)).unwrap();

        wal.append(EntryKind::Put, b"flushed", b"1").unwrap();
        let sealed = wal.rotate().unwrap();
        wal.append(EntryKind::Put, b"live", b"2").unwrap();

        wal.remove_segments_through(sealed).unwrap();
        wal.close().unwrap();

        assert_eq!(segment_names(tmp.path()), vec!["000002.log"]);

        let (_, recovered) = Wal::open(tmp.path(), 100, Duration::from_millis(10)).unwrap();
        assert_eq!(recovered.len(), 1);
        assert_eq!(recovered[0].key, b"live");
    }

    #[test]
    fn active_segment_never_removed() {
        let tmp = TempDir::new().unwrap();
        let (wal, _) = Wal::open(tmp.path(), 100, Duration::from_millis(10)).unwrap();

        wal.append(EntryKind::Put, b"only", b"1").unwrap();
        wal.remove_segments_through(u64::MAX).unwrap();
        wal.close().unwrap();

        assert_eq!(segment_names(tmp.path()), vec!["000001.log"]);
    }

    #[test]
    fn sequence_survives_rotation_and_reclamation() {
        let tmp = TempDir::new().unwrap();
        {
            let (wal, _) = Wal::open(tmp.path(), 100, Duration::from_millis(10)).unwrap();
            for i in 0..5 {
                wal.append(EntryKind::Put, format!("k{i}").as_bytes(), b"v")
                    .unwrap();
            }
            let sealed = wal.rotate().unwrap();
            wal.append(EntryKind::Put, b"k5", b"v").unwrap();
            wal.remove_segments_through(sealed).unwrap();
            wal.close().unwrap();
        }

        // Recovered max seq is 6 even though segment 1 is gone.
        let (wal, recovered) = Wal::open(tmp.path(), 100, Duration::from_millis(10)).unwrap();
        assert_eq!(recovered.len(), 1);
        assert_eq!(recovered[0].seq, 6);
        assert_eq!(wal.append(EntryKind::Put, b"k6", b"v").unwrap(), 7);
    }
}
