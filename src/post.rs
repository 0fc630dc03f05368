//! 已存储媒体的 Markdown 片段与 Hugo 文章草稿。

use chrono::{DateTime, Local};
use tracing::info;

use crate::sanitize::slugify;
use crate::storage::{Storage, StorageError};
use crate::validate::MediaKind;

/// 生成单个文件的 Markdown 引用。
pub fn markdown_for(kind: MediaKind, public_path: &str, content_type: &str, title: &str) -> String {
    match kind {
        MediaKind::Image => {
            let alt: String = title.chars().filter(|c| !matches!(c, '[' | ']')).collect();
            format!("![{alt}]({public_path})")
        }
        MediaKind::Video => format!(
            "<video controls>\n  <source src=\"{public_path}\" type=\"{content_type}\">\n  Your browser does not support the video tag.\n</video>"
        ),
    }
}

/// 渲染文章：front matter、可选描述与媒体片段。
pub fn render_post(
    title: &str,
    description: Option<&str>,
    snippets: &[String],
    now: &DateTime<Local>,
) -> String {
    // JSON 字符串同时是合法的 YAML 双引号标量。
    let quoted_title = serde_json::to_string(title).unwrap_or_else(|_| "\"\"".into());
    let mut content = format!(
        "---\ndate: {}\ntitle: {quoted_title}\ntype: post\n---\n\n",
        now.format("%Y-%m-%d %H:%M:%S%:z")
    );
    if let Some(description) = description.filter(|text| !text.trim().is_empty()) {
        content.push_str(description.trim());
        content.push_str("\n\n");
    }
    content.push_str(&snippets.join("\n\n"));
    content.push('\n');
    content
}

/// 写入 `YYYY-MM-DD-<slug>.md`，不覆盖已有文件。
pub async fn write_post(
    posts: &Storage,
    title: &str,
    description: Option<&str>,
    snippets: &[String],
    now: &DateTime<Local>,
) -> Result<String, StorageError> {
    let name = format!("{}-{}.md", now.format("%Y-%m-%d"), slugify(title));
    let content = render_post(title, description, snippets, now);
    let artifact = posts
        .store(content.as_bytes(), &name, content.len() as u64)
        .await?;
    info!(post = artifact.name, "created post");
    Ok(artifact.name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::tempdir;

    fn fixed_now() -> DateTime<Local> {
        Local
            .with_ymd_and_hms(2024, 6, 1, 9, 15, 0)
            .single()
            .expect("unambiguous local time")
    }

    #[test]
    fn image_snippet_uses_title_as_alt() {
        assert_eq!(
            markdown_for(MediaKind::Image, "/images/posts/IMG_1.jpg", "image/jpeg", "Hike [day 1]"),
            "![Hike day 1](/images/posts/IMG_1.jpg)"
        );
    }

    #[test]
    fn video_snippet_embeds_player() {
        let snippet = markdown_for(MediaKind::Video, "/images/posts/VID_1.mp4", "video/mp4", "");
        assert!(snippet.starts_with("<video controls>"));
        assert!(snippet.contains(r#"<source src="/images/posts/VID_1.mp4" type="video/mp4">"#));
    }

    #[test]
    fn post_has_front_matter_and_body() {
        let content = render_post(
            "A \"quoted\" title",
            Some("  Notes from the trail.  "),
            &["![x](/a.jpg)".to_string(), "![x](/b.jpg)".to_string()],
            &fixed_now(),
        );
        assert!(content.starts_with("---\ndate: 2024-06-01 09:15:00"));
        assert!(content.contains("title: \"A \\\"quoted\\\" title\"\ntype: post\n---\n\n"));
        assert!(content.contains("Notes from the trail.\n\n![x](/a.jpg)\n\n![x](/b.jpg)\n"));
    }

    #[tokio::test]
    async fn write_post_refuses_to_overwrite() {
        let temp = tempdir().expect("tempdir");
        let posts = Storage::new(temp.path().to_path_buf(), "/posts");
        let now = fixed_now();
        let name = write_post(&posts, "My Trip", None, &[], &now)
            .await
            .expect("first post");
        assert_eq!(name, "2024-06-01-my-trip.md");

        let second = write_post(&posts, "My Trip", None, &[], &now).await;
        assert!(matches!(second, Err(StorageError::AlreadyExists)));
    }
}
