//! クラスラベルファイルの読み書き
//!
//! 1行に1ラベル。行番号（0始まり）がモデル出力のクラスインデックスに対応するため、
//! 並び順は学習時のクラスインデックス順と一致していなければなりません。

use anyhow::{Context, Result};
use std::fs;
use std::io::Write;
use std::path::Path;

/// ラベルをクラスインデックス順に書き出す（各行は改行で終わる）
pub fn write_labels(path: &Path, labels: &[String]) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .context(format!("Failed to create parent directory: {:?}", parent))?;
        }
    }

    let mut file = fs::File::create(path).context(format!("Failed to create label file: {:?}", path))?;
    for label in labels {
        if label.contains('\n') || label.contains('\r') {
            anyhow::bail!("label {:?} contains a line break", label);
        }
        writeln!(file, "{}", label)?;
    }
    file.flush()?;
    Ok(())
}

/// ラベルファイルを読み込む（空行は無視）
pub fn read_labels(path: &Path) -> Result<Vec<String>> {
    let content = fs::read_to_string(path).context(format!("Failed to read label file: {:?}", path))?;
    Ok(content
        .lines()
        .map(|line| line.trim_end_matches('\r'))
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_labels_keep_index_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("class_labels.txt");
        let labels: Vec<String> = ["acne", "basal_cell", "eczema"].iter().map(|s| s.to_string()).collect();

        write_labels(&path, &labels).unwrap();

        let raw = fs::read_to_string(&path).unwrap();
        assert_eq!(raw, "acne\nbasal_cell\neczema\n");
        assert_eq!(read_labels(&path).unwrap(), labels);
    }

    #[test]
    fn test_read_ignores_blank_lines_and_crlf() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("labels.txt");
        fs::write(&path, "a\r\n\r\nb\r\n").unwrap();

        assert_eq!(read_labels(&path).unwrap(), vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_line_break_in_label_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("labels.txt");
        assert!(write_labels(&path, &["bad\nlabel".to_string()]).is_err());
    }
}
