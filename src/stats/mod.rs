//! Statistical self-test battery and raw sample export

pub mod battery;
pub mod export;
pub mod math;

pub use battery::{BatteryInfo, BatteryReport, BatterySummary, StatisticalTestBattery};
pub use export::{ExportEncoding, ExportPayload, SampleExporter};

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TestKind {
    Uniformity,
    Runs,
    BlockFrequency,
    LongestRun,
}

impl fmt::Display for TestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TestKind::Uniformity => write!(f, "uniformity_chi_square"),
            TestKind::Runs => write!(f, "runs"),
            TestKind::BlockFrequency => write!(f, "block_frequency"),
            TestKind::LongestRun => write!(f, "longest_run_of_ones"),
        }
    }
}

/// Verdict and numeric evidence of one test
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TestResult {
    pub test: TestKind,
    pub statistic: f64,
    pub critical_value: f64,
    pub passed: bool,
    pub sample_size: usize,
    pub evidence: serde_json::Value,
}

/// A persisted test result, kept for certification audits
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TestRecord {
    pub id: String,
    /// Shared by all results of one battery run
    pub run_id: String,
    pub executed_at: u64,
    pub result: TestResult,
}
