//! 上传媒体的 Content-Type 与扩展名白名单。

/// 文件的媒体类别。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MediaKind {
    Image,
    Video,
}

impl MediaKind {
    pub fn name_prefix(self) -> &'static str {
        match self {
            MediaKind::Image => "IMG",
            MediaKind::Video => "VID",
        }
    }
}

struct AllowedType {
    content_type: &'static str,
    extensions: &'static [&'static str],
    kind: MediaKind,
}

const ALLOWED_TYPES: &[AllowedType] = &[
    AllowedType {
        content_type: "image/jpeg",
        extensions: &[".jpg", ".jpeg"],
        kind: MediaKind::Image,
    },
    AllowedType {
        content_type: "image/png",
        extensions: &[".png"],
        kind: MediaKind::Image,
    },
    AllowedType {
        content_type: "image/gif",
        extensions: &[".gif"],
        kind: MediaKind::Image,
    },
    AllowedType {
        content_type: "image/webp",
        extensions: &[".webp"],
        kind: MediaKind::Image,
    },
    AllowedType {
        content_type: "video/mp4",
        extensions: &[".mp4"],
        kind: MediaKind::Video,
    },
    AllowedType {
        content_type: "video/quicktime",
        extensions: &[".mov"],
        kind: MediaKind::Video,
    },
];

/// 取最后一段路径的小写扩展名（含点）；`/` 与 `\` 都视为分隔符。
pub fn extension_of(filename: &str) -> Option<String> {
    let segment = filename.rsplit(['/', '\\']).next().unwrap_or(filename);
    let dot = segment.rfind('.')?;
    let ext = &segment[dot..];
    if ext.len() <= 1 {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}

fn lookup(content_type: &str) -> Option<&'static AllowedType> {
    ALLOWED_TYPES
        .iter()
        .find(|entry| entry.content_type == content_type)
}

/// 仅当扩展名属于声明类型的白名单时接受。
///
/// Content-Type 精确匹配，不剥离 `; charset=` 等参数。
pub fn is_allowed(filename: &str, content_type: &str) -> bool {
    let Some(entry) = lookup(content_type) else {
        return false;
    };
    extension_of(filename).is_some_and(|ext| entry.extensions.contains(&ext.as_str()))
}

pub fn media_kind(content_type: &str) -> Option<MediaKind> {
    lookup(content_type).map(|entry| entry.kind)
}
