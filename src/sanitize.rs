//! 生成安全的存储文件名。

use chrono::{DateTime, TimeZone};

use crate::validate::MediaKind;

const PLACEHOLDER: char = '_';

fn is_safe_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')
}

/// 将任意文件名映射为仅含 `[A-Za-z0-9._-]` 的单段名称。
///
/// 分隔符、盘符与 NUL 都会被替换；结果若仍为 `.` 或 `..` 则整体替换。
pub fn sanitize(raw: &str) -> String {
    let mapped: String = raw
        .chars()
        .map(|c| if is_safe_char(c) { c } else { PLACEHOLDER })
        .collect();
    match mapped.as_str() {
        "" | "." | ".." => PLACEHOLDER.to_string(),
        _ => mapped,
    }
}

/// 为通过校验的文件生成 `IMG_2024-05-01_103000.123_00.jpg` 形式的名称。
pub fn generated_name<Tz>(
    kind: MediaKind,
    timestamp: &DateTime<Tz>,
    sequence: usize,
    extension: &str,
) -> String
where
    Tz: TimeZone,
    Tz::Offset: std::fmt::Display,
{
    let stamp = timestamp.format("%Y-%m-%d_%H%M%S%.3f");
    sanitize(&format!(
        "{}_{stamp}_{sequence:02}{extension}",
        kind.name_prefix()
    ))
}

/// 文章文件名使用的小写连字符 slug。
pub fn slugify(title: &str) -> String {
    let dashed: String = title
        .trim()
        .to_lowercase()
        .chars()
        .map(|c| if c.is_whitespace() { '-' } else { c })
        .collect();
    let slug = sanitize(&dashed);
    let slug = slug.trim_matches(|c| c == '.' || c == '-' || c == PLACEHOLDER);
    if slug.is_empty() {
        "post".to_string()
    } else {
        slug.to_string()
    }
}
