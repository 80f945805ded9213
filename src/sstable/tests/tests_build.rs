//! Builder output: atomicity, file naming, properties, sidecar.

#[cfg(test)]
mod tests {
    use crate::sstable::tests::helpers::*;
    use crate::sstable::{
        SsTable, SstWriter, bloom_sidecar_path, parse_run_file_name, run_file_name,
    };
    use tempfile::TempDir;

    #[test]
    fn file_name_roundtrip() {
        assert_eq!(run_file_name(0, 12), "L0-12.sst");
        assert_eq!(parse_run_file_name("L0-12.sst"), Some((0, 12)));
        assert_eq!(parse_run_file_name("L3-9001.sst"), Some((3, 9001)));
        assert_eq!(parse_run_file_name("L3-9001.bloom"), None);
        assert_eq!(parse_run_file_name("junk.sst"), None);
    }

    #[test]
    fn build_produces_table_and_sidecar() {
        let tmp = TempDir::new().unwrap();
        let (path, table) = build_table(
            tmp.path(),
            1,
            &[
                (b"a", 1, Some(b"1")),
                (b"b", 2, Some(b"2")),
                (b"c", 3, None),
            ],
        );

        assert!(path.exists());
        assert!(bloom_sidecar_path(&path).exists());
        assert_eq!(table.props.entry_count, 3);
        assert_eq!(table.props.tombstone_count, 1);
        assert_eq!(table.props.min_key, b"a");
        assert_eq!(table.props.max_key, b"c");
        assert_eq!(table.props.min_seq, 1);
        assert_eq!(table.props.max_seq, 3);
        assert_eq!(table.props.level, 0);
    }

    #[test]
    fn no_tmp_litter_after_successful_build() {
        let tmp = TempDir::new().unwrap();
        build_table(tmp.path(), 1, &[(b"k", 1, Some(b"v"))]);

        let leftovers: Vec<_> = std::fs::read_dir(tmp.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn empty_stream_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join(run_file_name(0, 1));
        let result = SstWriter::new(&path).build(0, 0.01, 0, std::iter::empty());
        assert!(result.is_err());
        assert!(!path.exists());
    }

    #[test]
    fn large_build_spans_many_blocks() {
        let tmp = TempDir::new().unwrap();
        let rows = sequential_rows(2000);
        let path = tmp.path().join(run_file_name(1, 7));
        SstWriter::new(&path)
            .build(1, 0.01, rows.len(), rows.into_iter())
            .unwrap();

        let table = SsTable::open(&path).unwrap();
        assert_eq!(table.props.entry_count, 2000);
        assert_eq!(table.props.level, 1);
        assert_eq!(table.file_id, 7);
        // ~2000 * ~30-byte cells at 4 KiB per block ⇒ well over one block.
        assert!(table.file_size() > 4096);
    }
}
