//! 媒体目录写入：路径约束、独占创建与大小上限。

use std::fmt;
use std::io;
use std::path::{Component, Path, PathBuf};
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, ErrorKind};
use tracing::{debug, warn};

/// 媒体目录及其公开 URL 前缀。
#[derive(Clone, Debug)]
pub struct Storage {
    root: PathBuf,
    public_prefix: String,
}

/// 已写入存储根目录的文件。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredArtifact {
    pub name: String,
    pub path: PathBuf,
    pub public_path: String,
    pub bytes: u64,
}

impl Storage {
    pub fn new(root: PathBuf, public_prefix: impl Into<String>) -> Self {
        Self {
            root,
            public_prefix: public_prefix.into(),
        }
    }

    pub async fn ensure_root(&self) -> io::Result<()> {
        create_dir_secure(&self.root).await
    }

    pub fn public_path(&self, name: &str) -> String {
        format!("{}/{name}", self.public_prefix)
    }

    /// 拼接 `name` 并确认规范化后的路径严格位于根目录之内。
    pub fn resolve_contained(&self, name: &str) -> Result<PathBuf, StorageError> {
        let root = clean_path(&self.root);
        let target = clean_path(&self.root.join(name));
        if target == root || !target.starts_with(&root) {
            return Err(StorageError::InvalidPath);
        }
        Ok(target)
    }

    /// 从 `reader` 复制至多 `max_bytes` 字节到新建文件 `name`。
    ///
    /// 以 `create_new` 打开，已存在的文件不会被覆盖；任何失败都会删除残留文件。
    pub async fn store<R>(
        &self,
        reader: R,
        name: &str,
        max_bytes: u64,
    ) -> Result<StoredArtifact, StorageError>
    where
        R: AsyncRead + Unpin,
    {
        let target = self.resolve_contained(name)?;
        let mut file = match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&target)
            .await
        {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                return Err(StorageError::AlreadyExists);
            }
            Err(err) => return Err(StorageError::WriteFailed(err)),
        };

        let mut limited = reader.take(max_bytes.saturating_add(1));
        let copied = match tokio::io::copy(&mut limited, &mut file).await {
            Ok(copied) => copied,
            Err(err) => {
                drop(file);
                remove_partial(&target).await;
                return Err(StorageError::WriteFailed(err));
            }
        };
        if copied > max_bytes {
            drop(file);
            remove_partial(&target).await;
            return Err(StorageError::TooLarge);
        }
        if let Err(err) = file.flush().await {
            drop(file);
            remove_partial(&target).await;
            return Err(StorageError::WriteFailed(err));
        }

        debug!(name, bytes = copied, "stored artifact");
        Ok(StoredArtifact {
            name: name.to_string(),
            path: target,
            public_path: self.public_path(name),
            bytes: copied,
        })
    }
}

async fn remove_partial(path: &Path) {
    if let Err(err) = fs::remove_file(path).await
        && err.kind() != ErrorKind::NotFound
    {
        warn!(path = ?path, error = %err, "failed to remove partial upload");
    }
}

/// 递归创建目录，unix 下权限为 0755。
pub async fn create_dir_secure(path: &Path) -> io::Result<()> {
    let mut builder = fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    builder.mode(0o755);
    builder.create(path).await
}

/// 纯词法规范化：去掉 `.`、折叠 `..`，不访问文件系统。
fn clean_path(path: &Path) -> PathBuf {
    let mut cleaned = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !cleaned.pop() {
                    cleaned.push(component.as_os_str());
                }
            }
            other => cleaned.push(other.as_os_str()),
        }
    }
    cleaned
}

#[derive(Debug)]
pub enum StorageError {
    InvalidPath,
    AlreadyExists,
    TooLarge,
    WriteFailed(io::Error),
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageError::InvalidPath => write!(f, "path escapes storage root"),
            StorageError::AlreadyExists => write!(f, "target already exists"),
            StorageError::TooLarge => write!(f, "file exceeds size limit"),
            StorageError::WriteFailed(err) => write!(f, "write failed: {err}"),
        }
    }
}

impl std::error::Error for StorageError {}
