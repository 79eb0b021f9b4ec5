//! Raw sample export
//!
//! Samples are 32-bit values, one per line. Small requests return every line
//! inline; larger ones return a preview plus the SHA-256 of the full dump, and
//! the full dump is only ever produced through [`SampleExporter::write_to`].

use crate::{
    config::StatisticsConfig,
    errors::{ConfigurationError, EngineResult, StorageError},
    rng::SecureRandomSource,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::io::Write;
use std::str::FromStr;

const CHUNK_SAMPLES: usize = 4_096;
const PREVIEW_LINES: usize = 32;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ExportEncoding {
    #[default]
    Decimal,
    Hex,
    Binary,
}

impl ExportEncoding {
    pub fn encode(&self, value: u32) -> String {
        match self {
            ExportEncoding::Decimal => value.to_string(),
            ExportEncoding::Hex => format!("{:08x}", value),
            ExportEncoding::Binary => format!("{:032b}", value),
        }
    }
}

impl fmt::Display for ExportEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExportEncoding::Decimal => write!(f, "decimal"),
            ExportEncoding::Hex => write!(f, "hex"),
            ExportEncoding::Binary => write!(f, "binary"),
        }
    }
}

impl FromStr for ExportEncoding {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "decimal" | "dec" => Ok(ExportEncoding::Decimal),
            "hex" => Ok(ExportEncoding::Hex),
            "binary" | "bin" => Ok(ExportEncoding::Binary),
            other => Err(ConfigurationError::InvalidValue {
                field: "encoding".to_string(),
                value: other.to_string(),
                reason: "expected decimal, hex or binary".to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExportPayload {
    pub encoding: ExportEncoding,
    pub requested: usize,
    pub samples: usize,
    /// Request exceeded the configured maximum and was clamped
    pub capped: bool,
    /// Every line is in `data`
    pub inline: bool,
    pub data: Option<Vec<String>>,
    pub preview: Vec<String>,
    /// SHA-256 over the newline-terminated lines
    pub sha256: String,
}

pub struct SampleExporter {
    random: SecureRandomSource,
    inline_threshold: usize,
    max_samples: usize,
}

impl SampleExporter {
    pub fn new(random: SecureRandomSource, config: &StatisticsConfig) -> Self {
        Self {
            random,
            inline_threshold: config.export_inline_threshold,
            max_samples: config.export_max_samples,
        }
    }

    pub async fn export(&self, requested: usize, encoding: ExportEncoding) -> EngineResult<ExportPayload> {
        let samples = requested.min(self.max_samples);
        let inline = samples <= self.inline_threshold;

        let mut hasher = Sha256::new();
        let mut preview = Vec::with_capacity(PREVIEW_LINES.min(samples));
        let mut data = inline.then(|| Vec::with_capacity(samples));

        self.for_each_chunk(samples, encoding, |lines| {
            for line in lines {
                hasher.update(line.as_bytes());
                hasher.update(b"\n");
                if preview.len() < PREVIEW_LINES {
                    preview.push(line.clone());
                }
            }
            if let Some(data) = data.as_mut() {
                data.extend(lines.iter().cloned());
            }
            Ok(())
        })
        .await?;

        tracing::debug!(requested, samples, inline, encoding = %encoding, "Sample export generated");
        Ok(ExportPayload {
            encoding,
            requested,
            samples,
            capped: samples < requested,
            inline,
            data,
            preview,
            sha256: hex::encode(hasher.finalize()),
        })
    }

    /// Stream `samples` lines to `writer` in bounded chunks, returning the digest.
    /// Not limited by the inline threshold or the response cap.
    pub async fn write_to<W: Write>(&self, samples: usize, encoding: ExportEncoding, writer: &mut W) -> EngineResult<String> {
        let mut hasher = Sha256::new();
        self.for_each_chunk(samples, encoding, |lines| {
            for line in lines {
                writer
                    .write_all(line.as_bytes())
                    .and_then(|_| writer.write_all(b"\n"))
                    .map_err(|e| StorageError::WriteFailed(e.to_string()))?;
                hasher.update(line.as_bytes());
                hasher.update(b"\n");
            }
            Ok(())
        })
        .await?;
        writer.flush().map_err(|e| StorageError::WriteFailed(e.to_string()))?;
        Ok(hex::encode(hasher.finalize()))
    }

    async fn for_each_chunk<F>(&self, samples: usize, encoding: ExportEncoding, mut sink: F) -> EngineResult<()>
    where
        F: FnMut(&[String]) -> EngineResult<()>,
    {
        let mut remaining = samples;
        while remaining > 0 {
            let n = remaining.min(CHUNK_SAMPLES);
            let values = self
                .random
                .sample_ints(n, 0, u32::MAX as u64, "statistics_export")
                .await?;
            let lines: Vec<String> = values.into_iter().map(|v| encoding.encode(v as u32)).collect();
            sink(&lines)?;
            remaining -= n;
        }
        Ok(())
    }
}
