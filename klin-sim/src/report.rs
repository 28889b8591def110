//! Run and suite reports
//!
//! A `RunReport` is the JSON summary of one scenario run; a `SuiteReport`
//! collects one per scenario and can also render JUnit XML for CI.

use crate::scenarios::{Check, ScenarioError, ScenarioKind, ScenarioOutcome};
use chrono::{DateTime, Utc};
use klin_core::{AgentId, MetricsReport};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::info;

/// JSON summary of one scenario run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: String,
    pub scenario: ScenarioKind,
    pub generated_at: DateTime<Utc>,
    pub agents: usize,
    pub ticks: u64,
    pub sim_time_s: f64,
    pub passed: bool,
    pub checks: Vec<Check>,
    /// Last observed leader per live agent
    pub leaders: BTreeMap<AgentId, Option<AgentId>>,
    pub metrics: MetricsReport,
}

impl From<&ScenarioOutcome> for RunReport {
    fn from(outcome: &ScenarioOutcome) -> Self {
        Self {
            run_id: outcome.run_id.to_string(),
            scenario: outcome.kind,
            generated_at: Utc::now(),
            agents: outcome.agents,
            ticks: outcome.ticks,
            sim_time_s: outcome.sim_time.as_secs_f64(),
            passed: outcome.passed(),
            checks: outcome.checks.clone(),
            leaders: outcome.leaders.clone(),
            metrics: outcome.metrics.clone(),
        }
    }
}

impl RunReport {
    pub fn write_json(&self, path: &Path) -> Result<(), ScenarioError> {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        info!("Report written to: {}", path.display());
        Ok(())
    }

    pub fn print_summary(&self) {
        println!("\nScenario {}:", self.scenario.name());
        for check in &self.checks {
            let mark = if check.passed { "ok" } else { "FAILED" };
            println!("  {:<20} {:<6} {}", check.name, mark, check.detail);
        }
        println!(
            "  elections {}, avg election {:.3}s, mean dist to leader {:.3}",
            self.metrics.elections, self.metrics.avg_election_time, self.metrics.mean_dist_to_leader
        );
    }
}

/// Results of running several scenarios
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SuiteReport {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub runs: Vec<RunReport>,
}

impl SuiteReport {
    pub fn push(&mut self, run: RunReport) {
        self.total += 1;
        if run.passed {
            self.passed += 1;
        } else {
            self.failed += 1;
        }
        self.runs.push(run);
    }

    /// Write `<scenario>-report.json` for every run into `dir`
    pub fn write_dir(&self, dir: &Path) -> Result<Vec<PathBuf>, ScenarioError> {
        std::fs::create_dir_all(dir)?;
        self.runs
            .iter()
            .map(|run| {
                let path = dir.join(format!("{}-report.json", run.scenario.name()));
                run.write_json(&path)?;
                Ok(path)
            })
            .collect()
    }

    /// Generate JUnit XML report
    pub fn to_junit_xml(&self) -> String {
        let mut xml = String::from("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
        xml.push_str(&format!(
            "<testsuite name=\"KLIN Scenarios\" tests=\"{}\" failures=\"{}\" errors=\"0\">\n",
            self.total, self.failed
        ));

        for run in &self.runs {
            xml.push_str(&format!(
                "  <testcase name=\"{}\" time=\"{:.3}\"",
                run.scenario.name(),
                run.sim_time_s
            ));

            if run.passed {
                xml.push_str(" />\n");
            } else {
                xml.push_str(">\n");
                let failed: Vec<&str> = run
                    .checks
                    .iter()
                    .filter(|c| !c.passed)
                    .map(|c| c.name.as_str())
                    .collect();
                xml.push_str(&format!(
                    "    <failure message=\"failed checks: {}\"/>\n",
                    failed.join(", ")
                ));
                xml.push_str("  </testcase>\n");
            }
        }

        xml.push_str("</testsuite>\n");
        xml
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scenarios::{run, ScenarioOptions};
    use klin_core::FleetConfig;
    use tempfile::tempdir;

    fn settle_report() -> RunReport {
        let opts = ScenarioOptions {
            config: FleetConfig::new(3),
            ..Default::default()
        };
        let outcome = run(ScenarioKind::Settle, &opts).unwrap();
        RunReport::from(&outcome)
    }

    #[test]
    fn test_run_report_json() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("settle.json");
        let report = settle_report();
        report.write_json(&path).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["scenario"], "settle");
        assert_eq!(value["passed"], true);
        assert_eq!(value["agents"], 3);
        assert!(value["metrics"]["messages_sent"]["VICTORY"].as_u64().unwrap() >= 1);

        let back: RunReport = serde_json::from_str(&text).unwrap();
        assert_eq!(back.run_id, report.run_id);
    }

    #[test]
    fn test_suite_report_counts_and_files() {
        let mut suite = SuiteReport::default();
        let ok = settle_report();
        let mut bad = ok.clone();
        bad.scenario = ScenarioKind::Auction;
        bad.passed = false;
        bad.checks[0].passed = false;
        suite.push(ok);
        suite.push(bad);

        assert_eq!((suite.total, suite.passed, suite.failed), (2, 1, 1));

        let dir = tempdir().unwrap();
        let paths = suite.write_dir(dir.path()).unwrap();
        assert_eq!(paths.len(), 2);
        assert!(paths.iter().all(|p| p.exists()));

        let xml = suite.to_junit_xml();
        assert!(xml.contains("tests=\"2\""));
        assert!(xml.contains("failures=\"1\""));
        assert!(xml.contains("failed checks: converged"));
    }
}
