//! File compression for the compression stage.
//!
//! Files are streamed through the encoder in chunks; a WAL segment or a
//! basebackup tarball is never held in memory whole.

use archivist_core::config::CompressionConfig;
use async_compression::tokio::write::{XzEncoder, ZstdEncoder};
use std::path::Path;
use tokio::fs::{self, File};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};

/// Read buffer size while streaming a file through the encoder.
const CHUNK_SIZE: usize = 256 * 1024;

/// Sizes of a compressed file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CompressedFile {
    pub original_size: u64,
    pub compressed_size: u64,
}

/// Streaming compressor writing into a file.
pub struct StreamingCompressor {
    inner: StreamingCompressorInner,
}

enum StreamingCompressorInner {
    None(BufWriter<File>),
    Zstd(ZstdEncoder<BufWriter<File>>),
    Xz(XzEncoder<BufWriter<File>>),
}

impl StreamingCompressor {
    /// Create a compressor writing `compression` output into `output`.
    pub fn new(compression: CompressionConfig, output: File) -> Self {
        let output = BufWriter::new(output);
        let inner = match compression {
            CompressionConfig::None => StreamingCompressorInner::None(output),
            CompressionConfig::Zstd => StreamingCompressorInner::Zstd(
                ZstdEncoder::with_quality(output, async_compression::Level::Default),
            ),
            CompressionConfig::Xz => StreamingCompressorInner::Xz(XzEncoder::with_quality(
                output,
                async_compression::Level::Default,
            )),
        };
        Self { inner }
    }

    /// Write a chunk of data to the compressor.
    pub async fn write_chunk(&mut self, data: &[u8]) -> std::io::Result<()> {
        match &mut self.inner {
            StreamingCompressorInner::None(writer) => writer.write_all(data).await,
            StreamingCompressorInner::Zstd(encoder) => encoder.write_all(data).await,
            StreamingCompressorInner::Xz(encoder) => encoder.write_all(data).await,
        }
    }

    /// Flush the encoder and sync the output file.
    pub async fn finish(self) -> std::io::Result<()> {
        let mut writer = match self.inner {
            StreamingCompressorInner::None(mut writer) => {
                writer.flush().await?;
                writer
            }
            StreamingCompressorInner::Zstd(mut encoder) => {
                encoder.shutdown().await?;
                encoder.into_inner()
            }
            StreamingCompressorInner::Xz(mut encoder) => {
                encoder.shutdown().await?;
                encoder.into_inner()
            }
        };
        writer.flush().await?;
        writer.get_mut().sync_all().await
    }
}

/// Compress `source` into `target`.
///
/// Output goes to a temporary sibling first and is renamed into place, so
/// `target` only ever holds complete output.
pub async fn compress_file(
    compression: CompressionConfig,
    source: &Path,
    target: &Path,
) -> std::io::Result<CompressedFile> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent).await?;
    }

    let mut temp = target.as_os_str().to_os_string();
    temp.push(".tmp");
    let temp = std::path::PathBuf::from(temp);

    let result = async {
        let mut input = File::open(source).await?;
        let mut compressor = StreamingCompressor::new(compression, File::create(&temp).await?);
        let mut buf = vec![0u8; CHUNK_SIZE];
        let mut original_size = 0u64;
        loop {
            let n = input.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            original_size += n as u64;
            compressor.write_chunk(&buf[..n]).await?;
        }
        compressor.finish().await?;
        Ok::<_, std::io::Error>(original_size)
    }
    .await;

    let original_size = match result {
        Ok(size) => size,
        Err(e) => {
            let _ = fs::remove_file(&temp).await;
            return Err(e);
        }
    };

    fs::rename(&temp, target).await?;
    let compressed_size = fs::metadata(target).await?.len();

    Ok(CompressedFile {
        original_size,
        compressed_size,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_compression::tokio::bufread::{XzDecoder, ZstdDecoder};
    use tokio::io::BufReader;

    async fn decompress(compression: CompressionConfig, path: &Path) -> Vec<u8> {
        let reader = BufReader::new(File::open(path).await.unwrap());
        let mut out = Vec::new();
        match compression {
            CompressionConfig::None => {
                let mut reader = reader;
                reader.read_to_end(&mut out).await.unwrap();
            }
            CompressionConfig::Zstd => {
                ZstdDecoder::new(reader).read_to_end(&mut out).await.unwrap();
            }
            CompressionConfig::Xz => {
                XzDecoder::new(reader).read_to_end(&mut out).await.unwrap();
            }
        }
        out
    }

    #[tokio::test]
    async fn test_compress_file_each_algorithm() {
        let temp = tempfile::tempdir().unwrap();
        let source = temp.path().join("000000010000000000000001");
        let data: Vec<u8> = (0..600_000u32).map(|i| (i % 7) as u8).collect();
        fs::write(&source, &data).await.unwrap();

        for compression in [
            CompressionConfig::None,
            CompressionConfig::Zstd,
            CompressionConfig::Xz,
        ] {
            let target = temp.path().join(format!("out/{}", compression.as_str()));
            let sizes = compress_file(compression, &source, &target).await.unwrap();

            assert_eq!(sizes.original_size, data.len() as u64);
            if compression != CompressionConfig::None {
                assert!(sizes.compressed_size < sizes.original_size);
            }
            assert_eq!(decompress(compression, &target).await, data);
        }
    }

    #[tokio::test]
    async fn test_missing_source_leaves_no_output() {
        let temp = tempfile::tempdir().unwrap();
        let target = temp.path().join("out/x");

        let err = compress_file(CompressionConfig::Zstd, &temp.path().join("nope"), &target)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::NotFound);
        assert!(!target.exists());
    }
}
