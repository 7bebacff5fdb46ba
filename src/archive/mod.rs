//! 压缩包处理：章节包校验与合并为单个 CBZ。

pub mod builder;

use std::io::Cursor;

/// 能被解析为 ZIP（中央目录完整）即视为有效。
pub fn is_valid_archive(bytes: &[u8]) -> bool {
    !bytes.is_empty() && zip::ZipArchive::new(Cursor::new(bytes)).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn only_real_zip_payloads_validate() {
        let mut buf = Cursor::new(Vec::new());
        {
            let mut zip = zip::ZipWriter::new(&mut buf);
            zip.start_file("a.png", zip::write::FileOptions::default())
                .unwrap();
            zip.write_all(b"png").unwrap();
            zip.finish().unwrap();
        }
        assert!(is_valid_archive(buf.get_ref()));
        assert!(!is_valid_archive(b""));
        assert!(!is_valid_archive(b"<!DOCTYPE html><title>Just a moment...</title>"));
    }
}
