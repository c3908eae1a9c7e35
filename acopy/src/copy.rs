use anyhow::Context;
use async_recursion::async_recursion;
use chain::{TaskPool, Unit};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::instrument;

/// Buffer size used by [`copy_file`], in bytes.
pub const DEFAULT_BUFFER_SIZE: usize = 1024;

/// Number of file copies [`copy_dir`] runs concurrently.
pub const DEFAULT_PARALLELISM: usize = 5;

/// Failure taxonomy for copy operations.
///
/// Validation errors ([`Error::EmptyPath`], [`Error::InvalidConfiguration`])
/// resolve the returned unit before any filesystem access; the other
/// variants surface through the unit once I/O is attempted.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{0} path must not be empty")]
    EmptyPath(&'static str),
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
    /// A source file or directory was absent at open time.
    #[error("{0:?}: no such file or directory")]
    NotFound(std::path::PathBuf),
    #[error("i/o failure on {path:?}")]
    Io {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
}

// only source-side lookups map to NotFound; destination failures are
// ordinary i/o failures whatever their kind
fn classify(source: std::io::Error, path: &std::path::Path) -> Error {
    if source.kind() == std::io::ErrorKind::NotFound {
        Error::NotFound(path.to_path_buf())
    } else {
        io_failure(source, path)
    }
}

fn io_failure(source: std::io::Error, path: &std::path::Path) -> Error {
    Error::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn validate_paths(src: &std::path::Path, dst: &std::path::Path) -> Result<(), Error> {
    if src.as_os_str().is_empty() {
        return Err(Error::EmptyPath("source"));
    }
    if dst.as_os_str().is_empty() {
        return Err(Error::EmptyPath("destination"));
    }
    Ok(())
}

/// Copies one file from `src` to `dst` with the default buffer size.
///
/// Returns immediately; the returned unit resolves when the copy finishes.
/// Must be called from within a tokio runtime.
pub fn copy_file(src: &std::path::Path, dst: &std::path::Path) -> Unit {
    copy_file_with(src, dst, DEFAULT_BUFFER_SIZE)
}

/// Like [`copy_file`] with a caller-chosen buffer size (must be > 0).
pub fn copy_file_with(src: &std::path::Path, dst: &std::path::Path, buffer_size: usize) -> Unit {
    if let Err(error) = validate_paths(src, dst) {
        return Unit::failed(error.into());
    }
    if buffer_size == 0 {
        return Unit::failed(
            Error::InvalidConfiguration("buffer size must be greater than zero".to_string())
                .into(),
        );
    }
    let src = src.to_path_buf();
    let dst = dst.to_path_buf();
    Unit::spawn(async move { copy_chunks(&src, &dst, buffer_size).await })
}

#[instrument]
async fn copy_chunks(
    src: &std::path::Path,
    dst: &std::path::Path,
    buffer_size: usize,
) -> anyhow::Result<()> {
    tracing::debug!("opening 'src' for reading and 'dst' for writing");
    let mut reader = tokio::fs::File::open(src)
        .await
        .map_err(|error| classify(error, src))?;
    let mut writer = tokio::fs::File::create(dst)
        .await
        .map_err(|error| io_failure(error, dst))?;
    // both handles close when they drop, on every exit path
    let mut buffer = vec![0u8; buffer_size];
    loop {
        let read = reader
            .read(&mut buffer)
            .await
            .map_err(|error| classify(error, src))?;
        if read == 0 {
            break;
        }
        writer
            .write_all(&buffer[..read])
            .await
            .map_err(|error| io_failure(error, dst))?;
    }
    writer
        .flush()
        .await
        .map_err(|error| io_failure(error, dst))?;
    tracing::debug!("copy complete");
    Ok(())
}

/// Recursively mirrors the `src` directory under `dst` with the default
/// degree of parallelism.
///
/// Returns immediately; the returned unit resolves once every file copy has
/// finished, or with the first failure as soon as any of them fails. Must be
/// called from within a tokio runtime.
pub fn copy_dir(src: &std::path::Path, dst: &std::path::Path) -> Unit {
    copy_dir_with(src, dst, DEFAULT_PARALLELISM)
}

/// Like [`copy_dir`] with a caller-chosen degree of parallelism (must be
/// at least 1).
pub fn copy_dir_with(src: &std::path::Path, dst: &std::path::Path, parallelism: usize) -> Unit {
    if let Err(error) = validate_paths(src, dst) {
        return Unit::failed(error.into());
    }
    let pool = match TaskPool::new(parallelism) {
        Ok(pool) => pool,
        Err(error) => {
            return Unit::failed(Error::InvalidConfiguration(error.to_string()).into());
        }
    };
    let src = src.to_path_buf();
    let dst = dst.to_path_buf();
    Unit::spawn(async move {
        walk(&src, &dst, &src, &pool).await?;
        pool.drain().wait().await.into_result()
    })
}

/// Walks `current`, creating its mirrored directory before submitting any
/// file beneath it and recursing into subdirectories. All submissions go
/// into the one pool shared by the whole tree.
#[instrument(skip(pool))]
#[async_recursion]
async fn walk(
    src_root: &std::path::Path,
    dst_root: &std::path::Path,
    current: &std::path::Path,
    pool: &TaskPool,
) -> anyhow::Result<()> {
    let mirror = destination_path(src_root, dst_root, current)?;
    tokio::fs::create_dir_all(&mirror)
        .await
        .with_context(|| format!("cannot create directory {mirror:?}"))?;
    let mut entries = tokio::fs::read_dir(current)
        .await
        .map_err(|error| classify(error, current))?;
    while let Some(entry) = entries
        .next_entry()
        .await
        .with_context(|| format!("failed traversing directory {current:?}"))?
    {
        let entry_path = entry.path();
        let metadata = tokio::fs::metadata(&entry_path)
            .await
            .with_context(|| format!("failed reading metadata from {:?}", &entry_path))?;
        if metadata.is_dir() {
            walk(src_root, dst_root, &entry_path, pool).await?;
        } else if metadata.is_file() {
            let target = destination_path(src_root, dst_root, &entry_path)?;
            pool.admit(copy_file(&entry_path, &target)).await;
        } else {
            tracing::debug!("skipping {:?}, neither a file nor a directory", &entry_path);
        }
    }
    Ok(())
}

/// Destination path for a source entry: the destination root joined with the
/// entry's path relative to the source root.
fn destination_path(
    src_root: &std::path::Path,
    dst_root: &std::path::Path,
    path: &std::path::Path,
) -> anyhow::Result<std::path::PathBuf> {
    let relative = path
        .strip_prefix(src_root)
        .with_context(|| format!("{path:?} is not under {src_root:?}"))?;
    Ok(dst_root.join(relative))
}
