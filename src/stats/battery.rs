use super::{math, TestKind, TestRecord, TestResult};
use crate::{
    clock::Clock,
    config::StatisticsConfig,
    errors::EngineResult,
    rng::SecureRandomSource,
    storage::Repository,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

/// Upper bound of the runs-test sample range
const RUNS_SAMPLE_MAX: u64 = 1_000_000;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BatterySummary {
    pub total: usize,
    pub passed: usize,
    pub failed: Vec<TestKind>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BatteryReport {
    pub run_id: String,
    pub executed_at: u64,
    pub results: Vec<TestResult>,
    pub overall_passed: bool,
    pub summary: BatterySummary,
}

/// Static description of the battery for the `info` view
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatteryInfo {
    pub tests: Vec<String>,
    pub confidence: f64,
    pub entropy_source: String,
    pub config: StatisticsConfig,
}

/// Runs every test against freshly drawn samples. Samples are system-scope
/// draws and never touch a round's committed seed.
pub struct StatisticalTestBattery {
    random: SecureRandomSource,
    repo: Arc<dyn Repository>,
    clock: Arc<dyn Clock>,
    config: StatisticsConfig,
}

impl StatisticalTestBattery {
    pub fn new(
        random: SecureRandomSource,
        repo: Arc<dyn Repository>,
        clock: Arc<dyn Clock>,
        config: StatisticsConfig,
    ) -> Self {
        Self {
            random,
            repo,
            clock,
            config,
        }
    }

    pub async fn uniformity(&self) -> EngineResult<TestResult> {
        let (min, max) = (self.config.uniformity_min, self.config.uniformity_max);
        let samples = self
            .random
            .sample_ints(self.config.uniformity_samples, min, max, "battery_uniformity")
            .await?;
        Ok(math::uniformity(&samples, min, max))
    }

    pub async fn runs(&self) -> EngineResult<TestResult> {
        let samples = self
            .random
            .sample_ints(self.config.runs_samples, 0, RUNS_SAMPLE_MAX, "battery_runs")
            .await?;
        Ok(math::runs(&samples))
    }

    pub async fn block_frequency(&self) -> EngineResult<TestResult> {
        let total = self.config.block_size * self.config.block_count;
        let digits = self.random.sample_ints(total, 0, 9, "battery_block_frequency").await?;
        Ok(math::block_frequency(&digits, self.config.block_size))
    }

    pub async fn longest_run(&self) -> EngineResult<TestResult> {
        let bits = self
            .random
            .sample_ints(self.config.bit_samples, 0, 1, "battery_longest_run")
            .await?;
        Ok(math::longest_run(&bits))
    }

    /// Run all tests, persist each result and summarize
    pub async fn run_battery(&self) -> EngineResult<BatteryReport> {
        let run_id = Uuid::new_v4().to_string();
        let executed_at = self.clock.now_ms();

        let results = vec![
            self.uniformity().await?,
            self.runs().await?,
            self.block_frequency().await?,
            self.longest_run().await?,
        ];

        for result in &results {
            let record = TestRecord {
                id: Uuid::new_v4().to_string(),
                run_id: run_id.clone(),
                executed_at,
                result: result.clone(),
            };
            self.repo.store_test_result(&record).await?;
        }

        let failed: Vec<TestKind> = results.iter().filter(|r| !r.passed).map(|r| r.test).collect();
        let summary = BatterySummary {
            total: results.len(),
            passed: results.len() - failed.len(),
            failed,
        };
        let overall_passed = summary.failed.is_empty();

        if overall_passed {
            tracing::info!(run_id = %run_id, tests = summary.total, "Statistical battery passed");
        } else {
            tracing::warn!(run_id = %run_id, failed = ?summary.failed, "Statistical battery reported failures");
        }

        Ok(BatteryReport {
            run_id,
            executed_at,
            results,
            overall_passed,
            summary,
        })
    }

    /// Newest persisted results first
    pub async fn recent_results(&self, limit: usize) -> EngineResult<Vec<TestRecord>> {
        self.repo.recent_test_results(limit).await
    }

    pub fn info(&self) -> BatteryInfo {
        BatteryInfo {
            tests: [TestKind::Uniformity, TestKind::Runs, TestKind::BlockFrequency, TestKind::LongestRun]
                .iter()
                .map(ToString::to_string)
                .collect(),
            confidence: 0.95,
            entropy_source: "os".to_string(),
            config: self.config.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditLog;
    use crate::clock::ManualClock;
    use crate::config::EngineConfig;
    use crate::storage::MemoryRepository;

    fn battery(config: StatisticsConfig) -> (StatisticalTestBattery, Arc<MemoryRepository>) {
        let repo = Arc::new(MemoryRepository::new());
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(1_000));
        let audit = AuditLog::new(repo.clone(), clock.clone(), "v-test");
        let random = SecureRandomSource::os(audit);
        (StatisticalTestBattery::new(random, repo.clone(), clock, config), repo)
    }

    #[tokio::test]
    async fn test_battery_persists_every_result() {
        let (battery, repo) = battery(EngineConfig::testing().statistics);
        let report = battery.run_battery().await.unwrap();

        assert_eq!(report.results.len(), 4);
        assert_eq!(report.summary.total, 4);
        assert_eq!(report.overall_passed, report.results.iter().all(|r| r.passed));

        let stored = repo.recent_test_results(10).await.unwrap();
        assert_eq!(stored.len(), 4);
        assert!(stored.iter().all(|r| r.run_id == report.run_id));
        // Newest first.
        assert_eq!(stored[0].result.test, TestKind::LongestRun);
    }

    #[tokio::test]
    async fn test_battery_does_not_touch_round_state() {
        let (battery, repo) = battery(EngineConfig::testing().statistics);
        battery.run_battery().await.unwrap();

        let entries = repo.audit_entries().await.unwrap();
        assert_eq!(entries.len(), 4);
        assert!(entries.iter().all(|e| e.round_id.is_none()));
        assert!(repo.get_reveal(1).await.unwrap().is_none());
    }

    /// Repeated independent runs pass at roughly the 95% rate.
    #[tokio::test]
    async fn test_uniformity_passes_most_independent_runs() {
        let config = StatisticsConfig {
            uniformity_samples: 10_000,
            uniformity_min: 1,
            uniformity_max: 100,
            ..EngineConfig::testing().statistics
        };
        let (battery, _) = battery(config);

        let mut passed = 0;
        for _ in 0..20 {
            if battery.uniformity().await.unwrap().passed {
                passed += 1;
            }
        }
        assert!(passed >= 14, "only {} of 20 runs passed", passed);
    }

    #[test]
    fn test_info_lists_all_tests() {
        let (battery, _) = battery(EngineConfig::testing().statistics);
        let info = battery.info();
        assert_eq!(info.tests.len(), 4);
        assert!(info.tests.contains(&"block_frequency".to_string()));
    }
}
