use crate::error::{RaterError, Result};
use crate::types::RatingRecord;
use csv::{ReaderBuilder, Trim};
use serde::Deserialize;
use std::path::Path;

/// CSVの生の行（ratingは文字列のまま受け取り、後で検証する）
#[derive(Debug, Deserialize)]
struct RawRow {
    filename: String,
    rating: String,
}

/// セミコロン区切りのCSVを読み込み、ファイル順のレコード列を返す
///
/// ヘッダーに `filename` と `rating` が必要（順序は任意、その他のカラムは無視）。
/// 0件でもエラーにはしない。空判定は呼び出し側で行う。
pub fn load_csv(path: &Path) -> Result<Vec<RatingRecord>> {
    let file = std::fs::File::open(path).map_err(|e| RaterError::io(path, e))?;

    let mut reader = ReaderBuilder::new()
        .delimiter(b';')
        .has_headers(true)
        .trim(Trim::All)
        .from_reader(file);

    let csv_err = |source| RaterError::Csv {
        path: path.to_path_buf(),
        source,
    };

    let mut records = Vec::new();

    for result in reader.deserialize::<RawRow>() {
        let row = result.map_err(csv_err)?;

        let rating = row
            .rating
            .parse::<f32>()
            .ok()
            .filter(|r| r.is_finite())
            .ok_or_else(|| RaterError::InvalidRating {
                // ヘッダー行の分を加算
                line: records.len() as u64 + 2,
                value: row.rating.clone(),
            })?;

        records.push(RatingRecord {
            filename: row.filename,
            rating,
        });
    }

    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_csv(dir: &Path, content: &str) -> std::path::PathBuf {
        let path = dir.join("labels.csv");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(content.as_bytes()).unwrap();
        path
    }

    #[test]
    fn test_load_preserves_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_csv(
            dir.path(),
            "filename;rating\n./img1.jpg;8\nimg2.png; 3.5\nimg3.png;10\n",
        );

        let records = load_csv(&path).unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].filename, "./img1.jpg");
        assert_eq!(records[0].rating, 8.0);
        assert_eq!(records[1].rating, 3.5);
        assert_eq!(records[2].filename, "img3.png");
    }

    #[test]
    fn test_column_order_and_extra_columns() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_csv(dir.path(), "rating;author;filename\n6;bob;a.png\n");

        let records = load_csv(&path).unwrap();
        assert_eq!(
            records,
            vec![RatingRecord {
                filename: "a.png".to_string(),
                rating: 6.0
            }]
        );
    }

    #[test]
    fn test_header_only_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_csv(dir.path(), "filename;rating\n");
        assert!(load_csv(&path).unwrap().is_empty());
    }

    #[test]
    fn test_invalid_rating() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_csv(dir.path(), "filename;rating\na.png;7\nb.png;abc\n");

        match load_csv(&path) {
            Err(RaterError::InvalidRating { line, value }) => {
                assert_eq!(line, 3);
                assert_eq!(value, "abc");
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let result = load_csv(&dir.path().join("nope.csv"));
        assert!(matches!(result, Err(RaterError::Io { .. })));
    }

    #[test]
    fn test_missing_column() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_csv(dir.path(), "filename;score\na.png;7\n");
        assert!(matches!(load_csv(&path), Err(RaterError::Csv { .. })));
    }
}
