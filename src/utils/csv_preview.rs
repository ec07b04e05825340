//! Reading leading rows out of stored CSV bytes, and the whole-file check
//! the worker runs before marking a file as processed.

use std::io::Read;

use thiserror::Error;
use tokio::io::AsyncRead;
use tokio_util::io::SyncIoBridge;

/// Maximum number of rows shown in a file's detail view.
pub const PREVIEW_ROWS: usize = 10;

/// Past this many bytes the preview stops looking for more rows.
const PREVIEW_BYTE_LIMIT: u64 = 16 * 1024 * 1024;

pub type Row = Vec<String>;

/// Reads at most `max_rows` records from the start of `reader`, in file order.
///
/// One streaming parser walks the input on a blocking thread and stops as
/// soon as it has enough rows, so only the leading records are ever read.
pub async fn read_preview<R>(reader: R, max_rows: usize) -> std::io::Result<Vec<Row>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let bridge = SyncIoBridge::new(reader);
    tokio::task::spawn_blocking(move || parse_rows(bridge.take(PREVIEW_BYTE_LIMIT), max_rows))
        .await
        .map_err(std::io::Error::other)?
}

/// Parses up to `limit` records.
///
/// Rows are not validated against each other; ragged rows come back as-is
/// and invalid UTF-8 is replaced rather than rejected. A parse error ends the
/// preview early, an I/O error fails it.
pub fn parse_rows<R: Read>(data: R, limit: usize) -> std::io::Result<Vec<Row>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(data);

    let mut rows = Vec::new();
    let mut record = csv::ByteRecord::new();
    while rows.len() < limit {
        match reader.read_byte_record(&mut record) {
            Ok(true) => rows.push(
                record
                    .iter()
                    .map(|field| String::from_utf8_lossy(field).into_owned())
                    .collect(),
            ),
            Ok(false) => break,
            Err(e) if e.is_io_error() => return Err(e.into()),
            Err(_) => break,
        }
    }
    Ok(rows)
}

#[derive(Error, Debug)]
pub enum CsvCheckError {
    #[error("malformed CSV at record {record}: {message}")]
    Malformed { record: u64, message: String },

    #[error("processing canceled")]
    Canceled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CsvSummary {
    pub records: u64,
    pub columns: usize,
}

/// Walks every record of a CSV stream.
///
/// Every record must be UTF-8 and have as many fields as the first one.
/// `should_stop` is polled between records so a long run can be abandoned.
pub fn check_csv<R, F>(reader: R, should_stop: F) -> Result<CsvSummary, CsvCheckError>
where
    R: std::io::Read,
    F: Fn() -> bool,
{
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(false)
        .from_reader(reader);

    let mut summary = CsvSummary {
        records: 0,
        columns: 0,
    };

    for result in reader.records() {
        if should_stop() {
            return Err(CsvCheckError::Canceled);
        }
        let record = result.map_err(|e| CsvCheckError::Malformed {
            record: summary.records + 1,
            message: e.to_string(),
        })?;
        if summary.records == 0 {
            summary.columns = record.len();
        }
        summary.records += 1;
    }

    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn csv_with_rows(n: usize) -> String {
        (0..n).map(|i| format!("{},name-{}\n", i, i)).collect()
    }

    #[tokio::test]
    async fn test_preview_three_rows() {
        let data = csv_with_rows(3);
        let rows = read_preview(std::io::Cursor::new(data.as_bytes().to_vec()), PREVIEW_ROWS).await.unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0], vec!["0", "name-0"]);
        assert_eq!(rows[2], vec!["2", "name-2"]);
    }

    #[tokio::test]
    async fn test_preview_caps_at_ten_rows() {
        let data = csv_with_rows(50);
        let rows = read_preview(std::io::Cursor::new(data.as_bytes().to_vec()), PREVIEW_ROWS).await.unwrap();
        assert_eq!(rows.len(), 10);
        assert_eq!(rows[9], vec!["9", "name-9"]);
    }

    #[tokio::test]
    async fn test_preview_of_empty_file() {
        let rows = read_preview(&b""[..], PREVIEW_ROWS).await.unwrap();
        assert!(rows.is_empty());
    }

    #[tokio::test]
    async fn test_preview_keeps_ragged_rows() {
        let data = "a,b,c\n1\n2,3\n";
        let rows = read_preview(std::io::Cursor::new(data.as_bytes().to_vec()), PREVIEW_ROWS).await.unwrap();
        assert_eq!(rows, vec![vec!["a", "b", "c"], vec!["1"], vec!["2", "3"]]);
    }

    #[tokio::test]
    async fn test_preview_handles_quoted_newlines() {
        let data = "id,note\n1,\"line one\nline two\"\n2,plain\n";
        let rows = read_preview(std::io::Cursor::new(data.as_bytes().to_vec()), PREVIEW_ROWS).await.unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[1], vec!["1", "line one\nline two"]);
    }

    #[tokio::test]
    async fn test_preview_across_small_reads() {
        let wide: String = (0..30)
            .map(|i| format!("{},{},\"quoted, {}\"\n", i, "x".repeat(200), i))
            .collect();
        let (mut writer, reader) = tokio::io::duplex(16);
        let feed = tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            // the preview stops reading early, so the write may be cut short
            let _ = writer.write_all(wide.as_bytes()).await;
        });

        let rows = read_preview(reader, PREVIEW_ROWS).await.unwrap();
        assert_eq!(rows.len(), 10);
        assert_eq!(rows[9][0], "9");
        assert_eq!(rows[9][1].len(), 200);
        assert_eq!(rows[9][2], "quoted, 9");
        feed.await.unwrap();
    }

    #[test]
    fn test_parse_rows_on_partial_buffer() {
        // second record is cut in the middle of a quoted field
        let rows = parse_rows(&b"a,b\n1,\"unfinished"[..], 2).unwrap();
        assert_eq!(rows[0], vec!["a", "b"]);
        assert!(rows.len() <= 2);
    }

    #[test]
    fn test_parse_rows_replaces_invalid_utf8() {
        let rows = parse_rows(&b"ok,\xff\n"[..], 10).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0][0], "ok");
        assert_eq!(rows[0][1], "\u{fffd}");
    }

    #[test]
    fn test_check_counts_records() {
        let data = csv_with_rows(25);
        let summary = check_csv(data.as_bytes(), || false).unwrap();
        assert_eq!(summary, CsvSummary { records: 25, columns: 2 });
    }

    #[test]
    fn test_check_rejects_unequal_rows() {
        let err = check_csv("a,b\n1,2\n3\n".as_bytes(), || false).unwrap_err();
        assert!(matches!(err, CsvCheckError::Malformed { record: 3, .. }));
    }

    #[test]
    fn test_check_rejects_invalid_utf8() {
        let err = check_csv(&b"a,b\n\xff,1\n"[..], || false).unwrap_err();
        assert!(matches!(err, CsvCheckError::Malformed { .. }));
    }

    #[test]
    fn test_check_stops_when_asked() {
        let data = csv_with_rows(5);
        let err = check_csv(data.as_bytes(), || true).unwrap_err();
        assert!(matches!(err, CsvCheckError::Canceled));
    }
}
