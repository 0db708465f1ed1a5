//! Chunk handling: split an exported image archive into fixed
//! size chunks, hash them, optionally gzip the archive before
//! splitting, and reassemble on the receiving side.

use std::path::{Path, PathBuf};

use anyhow::Context;
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;

pub fn chunk_hash(data: &[u8]) -> String {
  let mut hasher = Sha256::new();
  hasher.update(data);
  hex::encode(hasher.finalize())
}

/// Filesystem-safe identifier for an image reference.
pub fn image_id(image: &str) -> String {
  image
    .chars()
    .map(|c| {
      if c.is_ascii_alphanumeric() || c == '-' || c == '.' {
        c
      } else {
        '_'
      }
    })
    .collect()
}

/// Directory holding one image's chunk files.
pub fn chunk_dir(work: &Path, image: &str) -> PathBuf {
  work.join(image_id(image))
}

pub fn chunk_path(
  work: &Path,
  image: &str,
  index: u32,
) -> PathBuf {
  chunk_dir(work, image).join(format!("chunk-{index:06}"))
}

/// Gzip the archive in place when compression is on. Returns
/// the (possibly new) archive path.
pub async fn maybe_compress(
  archive: PathBuf,
  compress: bool,
) -> anyhow::Result<PathBuf> {
  if !compress {
    return Ok(archive);
  }
  let compressed = archive.with_extension("tar.gz");
  let input = tokio::fs::File::open(&archive)
    .await
    .with_context(|| {
      format!("failed to open {}", archive.display())
    })?;
  let output = tokio::fs::File::create(&compressed)
    .await
    .with_context(|| {
      format!("failed to create {}", compressed.display())
    })?;
  let mut encoder =
    async_compression::tokio::write::GzipEncoder::new(output);
  let mut reader = tokio::io::BufReader::new(input);
  tokio::io::copy(&mut reader, &mut encoder)
    .await
    .context("failed to compress archive")?;
  encoder
    .shutdown()
    .await
    .context("failed to finish compression")?;
  tokio::fs::remove_file(&archive).await.ok();
  Ok(compressed)
}

pub async fn decompress(
  archive: &Path,
) -> anyhow::Result<PathBuf> {
  let plain = archive.with_extension("");
  let input = tokio::fs::File::open(archive)
    .await
    .with_context(|| {
      format!("failed to open {}", archive.display())
    })?;
  let output = tokio::fs::File::create(&plain)
    .await
    .with_context(|| {
      format!("failed to create {}", plain.display())
    })?;
  let mut decoder =
    async_compression::tokio::bufread::GzipDecoder::new(
      tokio::io::BufReader::new(input),
    );
  let mut writer = tokio::io::BufWriter::new(output);
  tokio::io::copy(&mut decoder, &mut writer)
    .await
    .context("failed to decompress archive")?;
  writer.flush().await.ok();
  Ok(plain)
}

/// Splits the archive into chunk files and returns the chunk
/// hashes in index order.
pub async fn split(
  work: &Path,
  image: &str,
  archive: &Path,
  chunk_size: usize,
) -> anyhow::Result<Vec<String>> {
  let data =
    tokio::fs::read(archive).await.with_context(|| {
      format!("failed to read {}", archive.display())
    })?;
  let dir = chunk_dir(work, image);
  tokio::fs::create_dir_all(&dir).await.with_context(|| {
    format!("failed to create {}", dir.display())
  })?;
  let mut hashes = Vec::new();
  for (index, chunk) in data.chunks(chunk_size.max(1)).enumerate()
  {
    let path = chunk_path(work, image, index as u32);
    tokio::fs::write(&path, chunk).await.with_context(|| {
      format!("failed to write {}", path.display())
    })?;
    hashes.push(chunk_hash(chunk));
  }
  // Zero length images still produce one (empty) chunk so
  // followers have something to verify.
  if hashes.is_empty() {
    let path = chunk_path(work, image, 0);
    tokio::fs::write(&path, b"").await.with_context(|| {
      format!("failed to write {}", path.display())
    })?;
    hashes.push(chunk_hash(b""));
  }
  Ok(hashes)
}

/// Concatenates all chunk files back into an archive.
pub async fn assemble(
  work: &Path,
  image: &str,
  chunk_count: u32,
  compressed: bool,
) -> anyhow::Result<PathBuf> {
  let dir = chunk_dir(work, image);
  let archive = if compressed {
    dir.join("image.tar.gz")
  } else {
    dir.join("image.tar")
  };
  let mut output = tokio::fs::File::create(&archive)
    .await
    .with_context(|| {
      format!("failed to create {}", archive.display())
    })?;
  for index in 0..chunk_count {
    let path = chunk_path(work, image, index);
    let data =
      tokio::fs::read(&path).await.with_context(|| {
        format!("missing chunk {}", path.display())
      })?;
    output.write_all(&data).await.with_context(|| {
      format!("failed to append to {}", archive.display())
    })?;
  }
  output.flush().await.ok();
  Ok(archive)
}
