//! 上传处理：凭据、请求体上限、表单暂存、逐文件校验与存储。

use axum::body::Body as AxumBody;
use axum::extract::Extension;
use axum::http::{HeaderMap, Method, StatusCode, header};
use axum::response::{IntoResponse, Json as JsonResponse, Response};
use chrono::{DateTime, Local};
use http_body_util::BodyExt;
use multer::{Constraints, Field, Multipart, SizeLimit};
use serde::Serialize;
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::config::UploadSettings;
use crate::error::UploadError;
use crate::guard::{API_KEY_HEADER, AccessGuard};
use crate::post::{markdown_for, write_post};
use crate::sanitize::generated_name;
use crate::storage::{Storage, StorageError, StoredArtifact};
use crate::validate::{MediaKind, extension_of, is_allowed, media_kind};

pub const TITLE_FIELD: &str = "title";
pub const DESCRIPTION_FIELD: &str = "description";
pub const MAX_TEXT_FIELD_LEN: usize = 4 * 1024;

/// 每个上传请求返回的 JSON。
#[derive(Serialize, Debug, Default, PartialEq, Eq)]
pub struct UploadResponse {
    pub success: bool,
    pub images: Vec<String>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub markdown: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub post: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl UploadResponse {
    fn failure(err: &UploadError) -> Self {
        Self {
            error: Some(err.client_message()),
            ..Self::default()
        }
    }
}

/// 已暂存、尚未校验的文件。
#[derive(Debug)]
struct CandidateFile {
    filename: String,
    content_type: String,
    size: u64,
    path: PathBuf,
}

/// 解析后的表单；提前返回时暂存目录随 drop 删除。
struct SpooledForm {
    dir: TempDir,
    files: Vec<CandidateFile>,
    title: Option<String>,
    description: Option<String>,
}

#[derive(Debug)]
pub struct StoredFile {
    pub artifact: StoredArtifact,
    pub kind: MediaKind,
    pub content_type: String,
}

/// 单个请求逐文件处理的结果。
#[derive(Debug, Default)]
pub struct BatchOutcome {
    pub stored: Vec<StoredFile>,
    pub skipped: usize,
}

enum SkipReason {
    TooLarge(u64),
    Unsupported,
    Spool(io::Error),
    Storage(StorageError),
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::TooLarge(size) => write!(f, "too large ({size} bytes)"),
            SkipReason::Unsupported => write!(f, "content type and extension not allowed"),
            SkipReason::Spool(err) => write!(f, "spool read failed: {err}"),
            SkipReason::Storage(err) => write!(f, "{err}"),
        }
    }
}

/// 生成文件名与文章日期所用的时钟。
pub type Clock = fn() -> DateTime<Local>;

/// 上传服务，启动时构建一次。
#[derive(Debug)]
pub struct UploadService {
    guard: AccessGuard,
    settings: UploadSettings,
    storage: Storage,
    posts: Option<Storage>,
    clock: Clock,
}

/// `/api/upload` 处理器：无论成功与否都返回 200 与 JSON。
pub async fn upload_media(
    Extension(service): Extension<Arc<UploadService>>,
    method: Method,
    headers: HeaderMap,
    body: AxumBody,
) -> Response {
    let response = match service.handle(&method, &headers, body).await {
        Ok(response) => response,
        Err(err) => {
            match &err {
                UploadError::Spool(io_err) => {
                    warn!(error = %io_err, "upload spool unavailable");
                }
                other => info!(reason = %other, "upload rejected"),
            }
            UploadResponse::failure(&err)
        }
    };
    (StatusCode::OK, JsonResponse(response)).into_response()
}

impl UploadService {
    pub fn new(
        guard: AccessGuard,
        settings: UploadSettings,
        storage: Storage,
        posts: Option<Storage>,
        clock: Clock,
    ) -> Self {
        Self {
            guard,
            settings,
            storage,
            posts,
            clock,
        }
    }

    pub async fn handle(
        &self,
        method: &Method,
        headers: &HeaderMap,
        body: AxumBody,
    ) -> Result<UploadResponse, UploadError> {
        let presented = headers
            .get(API_KEY_HEADER)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default();
        if !self.guard.verify(presented) {
            self.guard.delay_rejection().await;
            return Err(UploadError::Unauthorized);
        }
        if method != Method::POST {
            return Err(UploadError::MethodNotAllowed);
        }

        let ceiling = self.settings.body_ceiling();
        if content_length(headers).is_some_and(|len| len > ceiling) {
            return Err(UploadError::RequestTooLarge);
        }
        let boundary = headers
            .get(header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| multer::parse_boundary(value).ok())
            .ok_or(UploadError::RequestTooLarge)?;

        let form = self.spool_form(body, boundary, ceiling).await?;
        if form.files.is_empty() {
            return Err(UploadError::TooManyOrNoFiles {
                max: self.settings.max_files,
            });
        }

        let outcome = self.store_candidates(&form.files).await;
        info!(
            stored = outcome.stored.len(),
            skipped = outcome.skipped,
            "upload processed"
        );

        let title = form.title.as_deref().unwrap_or_default();
        let snippets: Vec<String> = outcome
            .stored
            .iter()
            .map(|file| {
                markdown_for(
                    file.kind,
                    &file.artifact.public_path,
                    &file.content_type,
                    title,
                )
            })
            .collect();
        let post = self
            .create_post(&form, &snippets, !outcome.stored.is_empty())
            .await;
        release_spool(form.dir).await;

        Ok(UploadResponse {
            success: !outcome.stored.is_empty(),
            images: outcome
                .stored
                .into_iter()
                .map(|file| file.artifact.public_path)
                .collect(),
            markdown: snippets.join("\n\n"),
            post,
            error: None,
        })
    }

    fn create_spool_dir(&self) -> io::Result<TempDir> {
        let mut builder = tempfile::Builder::new();
        builder.prefix(".upload-");
        match &self.settings.spool_dir {
            Some(dir) => builder.tempdir_in(dir),
            None => builder.tempdir(),
        }
    }

    async fn spool_form(
        &self,
        body: AxumBody,
        boundary: String,
        ceiling: u64,
    ) -> Result<SpooledForm, UploadError> {
        let dir = self.create_spool_dir().map_err(UploadError::Spool)?;
        let constraints = Constraints::new().size_limit(SizeLimit::new().whole_stream(ceiling));
        let mut multipart =
            Multipart::with_constraints(BodyExt::into_data_stream(body), boundary, constraints);
        let mut form = SpooledForm {
            dir,
            files: Vec::new(),
            title: None,
            description: None,
        };

        while let Some(mut field) = multipart.next_field().await? {
            let name = field.name().unwrap_or_default().to_string();
            let is_file = field.file_name().is_some_and(|file| !file.is_empty());
            if name == self.settings.field_name && is_file {
                if form.files.len() >= self.settings.max_files {
                    return Err(UploadError::TooManyOrNoFiles {
                        max: self.settings.max_files,
                    });
                }
                let index = form.files.len();
                let candidate = self.spool_file(&form.dir, index, &mut field).await?;
                form.files.push(candidate);
            } else if name == TITLE_FIELD {
                form.title = Some(read_text_field(&mut field).await?);
            } else if name == DESCRIPTION_FIELD {
                form.description = Some(read_text_field(&mut field).await?);
            }
        }

        Ok(form)
    }

    /// 最多写入 `max_file_size + 1` 字节，并记录实际大小。
    async fn spool_file(
        &self,
        dir: &TempDir,
        index: usize,
        field: &mut Field<'_>,
    ) -> Result<CandidateFile, UploadError> {
        let filename = field.file_name().unwrap_or_default().to_string();
        let content_type = field
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let path = dir.path().join(format!("part-{index}"));
        let mut file = File::create(&path).await.map_err(UploadError::Spool)?;

        let keep = self.settings.max_file_size.saturating_add(1);
        let mut size: u64 = 0;
        while let Some(chunk) = field.chunk().await? {
            let room = keep.saturating_sub(size).min(chunk.len() as u64) as usize;
            if room > 0 {
                file.write_all(&chunk[..room])
                    .await
                    .map_err(UploadError::Spool)?;
            }
            size = size.saturating_add(chunk.len() as u64);
        }
        file.flush().await.map_err(UploadError::Spool)?;

        debug!(index, filename, content_type, size, "spooled upload part");
        Ok(CandidateFile {
            filename,
            content_type,
            size,
            path,
        })
    }

    /// 存储可接受的文件；被拒绝的只计数，不单独报告。
    async fn store_candidates(&self, candidates: &[CandidateFile]) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();
        for (sequence, candidate) in candidates.iter().enumerate() {
            match self.store_candidate(sequence, candidate).await {
                Ok(stored) => outcome.stored.push(stored),
                Err(reason) => {
                    debug!(
                        filename = candidate.filename,
                        content_type = candidate.content_type,
                        reason = %reason,
                        "skipped upload part"
                    );
                    outcome.skipped += 1;
                }
            }
        }
        outcome
    }

    async fn store_candidate(
        &self,
        sequence: usize,
        candidate: &CandidateFile,
    ) -> Result<StoredFile, SkipReason> {
        let max = self.settings.max_file_size;
        if candidate.size > max {
            return Err(SkipReason::TooLarge(candidate.size));
        }
        if !is_allowed(&candidate.filename, &candidate.content_type) {
            return Err(SkipReason::Unsupported);
        }
        let kind = media_kind(&candidate.content_type).ok_or(SkipReason::Unsupported)?;
        let extension = extension_of(&candidate.filename).ok_or(SkipReason::Unsupported)?;
        let name = generated_name(kind, &(self.clock)(), sequence, &extension);

        let source = File::open(&candidate.path)
            .await
            .map_err(SkipReason::Spool)?;
        let artifact = self
            .storage
            .store(source, &name, max)
            .await
            .map_err(SkipReason::Storage)?;
        info!(
            name = artifact.name,
            path = ?artifact.path,
            bytes = artifact.bytes,
            "stored upload"
        );
        Ok(StoredFile {
            artifact,
            kind,
            content_type: candidate.content_type.clone(),
        })
    }

    async fn create_post(
        &self,
        form: &SpooledForm,
        snippets: &[String],
        any_stored: bool,
    ) -> Option<String> {
        let posts = self.posts.as_ref()?;
        let title = form.title.as_deref().map(str::trim).filter(|t| !t.is_empty())?;
        if !any_stored {
            return None;
        }
        match write_post(
            posts,
            title,
            form.description.as_deref(),
            snippets,
            &(self.clock)(),
        )
        .await
        {
            Ok(name) => Some(name),
            Err(err) => {
                warn!(error = %err, "failed to create post");
                None
            }
        }
    }
}

/// 在阻塞线程池中删除暂存目录，避免大目录的同步删除占用异步工作线程。
async fn release_spool(dir: TempDir) {
    let path = dir.path().to_path_buf();
    match tokio::task::spawn_blocking(move || dir.close()).await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => warn!(path = ?path, error = %err, "failed to remove spool directory"),
        Err(err) => warn!(error = %err, "spool cleanup task failed"),
    }
}

fn content_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(header::CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok())
}

async fn read_text_field(field: &mut Field<'_>) -> Result<String, UploadError> {
    let mut buf = Vec::new();
    while let Some(chunk) = field.chunk().await? {
        if buf.len() + chunk.len() > MAX_TEXT_FIELD_LEN {
            return Err(UploadError::RequestTooLarge);
        }
        buf.extend_from_slice(&chunk);
    }
    String::from_utf8(buf).map_err(|_| UploadError::RequestTooLarge)
}
