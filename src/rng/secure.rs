//! OS-backed secure random source
//!
//! Never seeded and never reproducible. If the operating system cannot
//! supply entropy the call fails with `EntropyUnavailable` and trips the
//! engine's [`FatalLatch`]; there is no fallback generator. Every public call appends one `generate` audit entry
//! (batch calls append one entry per batch).

use crate::{
    audit::{AuditLog, AuditOperation},
    errors::{EngineResult, FatalLatch, ProtocolError},
};
use rand_core::{OsRng, RngCore};
use serde_json::json;
use std::sync::Arc;

/// Raw entropy provider
pub trait EntropySource: Send + Sync {
    fn fill(&self, buf: &mut [u8]) -> Result<(), String>;

    fn name(&self) -> &'static str;
}

/// The operating system CSPRNG (`getrandom`)
#[derive(Debug, Default, Clone, Copy)]
pub struct OsEntropy;

impl EntropySource for OsEntropy {
    fn fill(&self, buf: &mut [u8]) -> Result<(), String> {
        OsRng.try_fill_bytes(buf).map_err(|e| e.to_string())
    }

    fn name(&self) -> &'static str {
        "os"
    }
}

#[derive(Clone)]
pub struct SecureRandomSource {
    entropy: Arc<dyn EntropySource>,
    audit: AuditLog,
    fatal: FatalLatch,
}

impl SecureRandomSource {
    pub fn new(entropy: Arc<dyn EntropySource>, audit: AuditLog) -> Self {
        Self {
            entropy,
            audit,
            fatal: FatalLatch::new(),
        }
    }

    /// Report entropy failures to `fatal`
    pub fn with_fatal_latch(mut self, fatal: FatalLatch) -> Self {
        self.fatal = fatal;
        self
    }

    pub fn os(audit: AuditLog) -> Self {
        Self::new(Arc::new(OsEntropy), audit)
    }

    /// Uniform integer in `[min, max]`
    pub async fn next_int(&self, min: u64, max: u64) -> EngineResult<u64> {
        let value = self.draw_ints(1, min, max)?[0];
        self.record(None, json!({
            "kind": "int",
            "min": min,
            "max": max,
            "value": value,
        }))
        .await?;
        Ok(value)
    }

    /// Fresh random bytes. The bytes themselves are never written to the log.
    pub async fn next_bytes(&self, n: usize) -> EngineResult<Vec<u8>> {
        self.bytes_for(None, n, "bytes").await
    }

    /// Random bytes attributed to a round and purpose in the audit entry
    pub async fn bytes_for(&self, round_id: Option<u64>, n: usize, purpose: &str) -> EngineResult<Vec<u8>> {
        let mut buf = vec![0u8; n];
        self.fill(&mut buf)?;
        self.record(round_id, json!({
            "kind": "bytes",
            "purpose": purpose,
            "length": n,
        }))
        .await?;
        Ok(buf)
    }

    /// `count` uniform integers in `[min, max]`
    pub async fn sample_ints(&self, count: usize, min: u64, max: u64, purpose: &str) -> EngineResult<Vec<u64>> {
        self.sample_ints_for(None, count, min, max, purpose).await
    }

    pub async fn sample_ints_for(
        &self,
        round_id: Option<u64>,
        count: usize,
        min: u64,
        max: u64,
        purpose: &str,
    ) -> EngineResult<Vec<u64>> {
        let values = self.draw_ints(count, min, max)?;
        self.record(round_id, json!({
            "kind": "int_batch",
            "purpose": purpose,
            "count": count,
            "min": min,
            "max": max,
        }))
        .await?;
        Ok(values)
    }

    /// `k` distinct indices from `0..len`, in draw order
    pub async fn choose_indices(
        &self,
        round_id: Option<u64>,
        len: usize,
        k: usize,
        purpose: &str,
    ) -> EngineResult<Vec<usize>> {
        if k > len {
            return Err(ProtocolError::InvalidRange { min: k as u64, max: len as u64 }.into());
        }
        // Partial Fisher-Yates over the index pool.
        let mut pool: Vec<usize> = (0..len).collect();
        for i in 0..k {
            let j = self.draw_ints(1, i as u64, (len - 1) as u64)?[0] as usize;
            pool.swap(i, j);
        }
        pool.truncate(k);
        self.record(round_id, json!({
            "kind": "choice",
            "purpose": purpose,
            "population": len,
            "count": k,
        }))
        .await?;
        Ok(pool)
    }

    fn fill(&self, buf: &mut [u8]) -> EngineResult<()> {
        self.entropy.fill(buf).map_err(|reason| {
            tracing::error!(source = self.entropy.name(), %reason, "Entropy source failed");
            self.fatal.trip(format!("entropy source {} failed: {}", self.entropy.name(), reason));
            ProtocolError::EntropyUnavailable(reason).into()
        })
    }

    /// Rejection sampling over 64-bit words keeps the result unbiased.
    fn draw_ints(&self, count: usize, min: u64, max: u64) -> EngineResult<Vec<u64>> {
        if min > max {
            return Err(ProtocolError::InvalidRange { min, max }.into());
        }
        let span = (max - min) as u128 + 1;
        let zone = ((1u128 << 64) / span) * span;

        let mut values = Vec::with_capacity(count);
        let mut buf = vec![0u8; count.max(1) * 8];
        while values.len() < count {
            let wanted = count - values.len();
            let chunk = &mut buf[..wanted * 8];
            self.fill(chunk)?;
            for word in chunk.chunks_exact(8) {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(word);
                let v = u64::from_le_bytes(raw) as u128;
                if v < zone {
                    values.push(min + (v % span) as u64);
                }
            }
        }
        Ok(values)
    }

    async fn record(&self, round_id: Option<u64>, mut details: serde_json::Value) -> EngineResult<()> {
        details["source"] = json!(self.entropy.name());
        self.audit.append(AuditOperation::Generate, round_id, details).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::errors::EngineError;
    use crate::storage::{MemoryRepository, Repository};

    struct BrokenEntropy;

    impl EntropySource for BrokenEntropy {
        fn fill(&self, _buf: &mut [u8]) -> Result<(), String> {
            Err("device unavailable".to_string())
        }

        fn name(&self) -> &'static str {
            "broken"
        }
    }

    fn source_with(entropy: Arc<dyn EntropySource>) -> (SecureRandomSource, Arc<MemoryRepository>) {
        let repo = Arc::new(MemoryRepository::new());
        let audit = AuditLog::new(repo.clone(), Arc::new(ManualClock::new(1)), "v-test");
        (SecureRandomSource::new(entropy, audit), repo)
    }

    #[tokio::test]
    async fn test_next_int_stays_in_range() {
        let (source, _) = source_with(Arc::new(OsEntropy));
        for _ in 0..200 {
            let v = source.next_int(3, 7).await.unwrap();
            assert!((3..=7).contains(&v));
        }
        assert_eq!(source.next_int(5, 5).await.unwrap(), 5);
        assert!(source.next_int(0, u64::MAX).await.is_ok());
    }

    #[tokio::test]
    async fn test_inverted_range_rejected() {
        let (source, _) = source_with(Arc::new(OsEntropy));
        let err = source.next_int(9, 2).await.unwrap_err();
        assert!(matches!(err, EngineError::Protocol(ProtocolError::InvalidRange { .. })));
    }

    #[tokio::test]
    async fn test_every_call_is_audited() {
        let (source, repo) = source_with(Arc::new(OsEntropy));
        source.next_int(1, 10).await.unwrap();
        let bytes = source.next_bytes(32).await.unwrap();
        source.sample_ints(500, 0, 9, "digits").await.unwrap();

        assert_eq!(bytes.len(), 32);
        let entries = repo.audit_entries().await.unwrap();
        assert_eq!(entries.len(), 3);
        assert!(entries.iter().all(|e| e.operation == AuditOperation::Generate));
        assert_eq!(entries[2].details["count"], 500);
        // Raw bytes never reach the log.
        assert!(entries[1].details.get("value").is_none());
    }

    #[tokio::test]
    async fn test_entropy_failure_is_fatal_and_not_degraded() {
        let (source, repo) = source_with(Arc::new(BrokenEntropy));
        let fatal = FatalLatch::new();
        let source = source.with_fatal_latch(fatal.clone());

        let err = source.next_bytes(16).await.unwrap_err();
        assert!(matches!(err, EngineError::Protocol(ProtocolError::EntropyUnavailable(_))));
        assert!(err.is_alerting());
        assert!(repo.audit_entries().await.unwrap().is_empty());
        assert!(fatal.reason().unwrap().contains("device unavailable"));
    }

    #[tokio::test]
    async fn test_choose_indices_distinct() {
        let (source, _) = source_with(Arc::new(OsEntropy));
        let mut picked = source.choose_indices(Some(1), 15, 4, "traps").await.unwrap();
        assert_eq!(picked.len(), 4);
        picked.sort();
        picked.dedup();
        assert_eq!(picked.len(), 4);
        assert!(picked.iter().all(|&i| i < 15));

        assert!(source.choose_indices(None, 2, 3, "traps").await.is_err());
    }
}
