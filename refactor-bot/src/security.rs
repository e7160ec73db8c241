//! Post-run security review (§11.1, C14, supplemented from
//! `original_source/refactor_bot/security.py`).
//!
//! Unlike the planner/patcher/critic roles, the security reviewer runs once
//! per whole run over the accumulated diff, not once per batch, and its
//! verdict gates `merge_back` rather than a single checkpoint.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::agent::{AgentDriver, AgentError, AgentResponse};

const MAX_CONTEXT_LINES: usize = 2000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    High,
    Medium,
    Low,
    Info,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Injection,
    Auth,
    DataExposure,
    Crypto,
    InputValidation,
    RaceCondition,
    Dependency,
    Configuration,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverallRisk {
    Critical,
    High,
    Medium,
    Low,
    None,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityFinding {
    pub severity: Severity,
    pub category: Category,
    pub file: String,
    pub line: u32,
    pub title: String,
    pub description: String,
    pub recommendation: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cwe: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SecuritySummary {
    #[serde(default)]
    pub high: usize,
    #[serde(default)]
    pub medium: usize,
    #[serde(default)]
    pub low: usize,
    #[serde(default)]
    pub info: usize,
}

impl SecuritySummary {
    pub fn total(&self) -> usize {
        self.high + self.medium + self.low + self.info
    }

    fn tally(findings: &[SecurityFinding]) -> Self {
        let mut summary = Self::default();
        for finding in findings {
            match finding.severity {
                Severity::High => summary.high += 1,
                Severity::Medium => summary.medium += 1,
                Severity::Low => summary.low += 1,
                Severity::Info => summary.info += 1,
            }
        }
        summary
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityReviewResult {
    pub success: bool,
    #[serde(default)]
    pub findings: Vec<SecurityFinding>,
    #[serde(default)]
    pub summary: SecuritySummary,
    #[serde(default = "default_risk")]
    pub overall_risk: OverallRisk,
    pub notes: Option<String>,
    pub error_message: Option<String>,
}

fn default_risk() -> OverallRisk {
    OverallRisk::None
}

impl SecurityReviewResult {
    pub fn skipped(notes: impl Into<String>) -> Self {
        Self {
            success: true,
            findings: Vec::new(),
            summary: SecuritySummary::default(),
            overall_risk: OverallRisk::None,
            notes: Some(notes.into()),
            error_message: None,
        }
    }

    pub fn from_error(error: impl Into<String>) -> Self {
        Self {
            success: false,
            findings: Vec::new(),
            summary: SecuritySummary::default(),
            overall_risk: OverallRisk::None,
            notes: None,
            error_message: Some(error.into()),
        }
    }

    fn from_response(response: AgentResponse) -> Self {
        if !response.success {
            return Self::from_error(response.error_message.unwrap_or_else(|| "security review failed".to_string()));
        }

        let Some(output) = response.structured_output else {
            return Self::from_error("no structured output from security review");
        };

        let findings: Vec<SecurityFinding> = output
            .get("findings")
            .and_then(|v| v.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|f| serde_json::from_value(f.clone()).ok())
                    .collect()
            })
            .unwrap_or_default();

        let summary = output
            .get("summary")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_else(|| SecuritySummary::tally(&findings));

        let overall_risk = output
            .get("overall_risk")
            .and_then(|v| v.as_str())
            .and_then(|s| match s {
                "critical" => Some(OverallRisk::Critical),
                "high" => Some(OverallRisk::High),
                "medium" => Some(OverallRisk::Medium),
                "low" => Some(OverallRisk::Low),
                "none" => Some(OverallRisk::None),
                _ => None,
            })
            .unwrap_or(OverallRisk::None);

        let notes = output.get("notes").and_then(|v| v.as_str()).map(str::to_string);

        Self { success: true, findings, summary, overall_risk, notes, error_message: None }
    }

    /// Whether this result should block `merge_back`.
    pub fn has_blocking_issues(&self, block_on_high: bool) -> bool {
        if block_on_high && self.summary.high > 0 {
            return true;
        }
        self.overall_risk == OverallRisk::Critical
    }
}

/// Calls the security agent role over the accumulated diff of a run.
pub struct SecurityReviewer<'a> {
    driver: &'a AgentDriver,
    repo_path: &'a Path,
}

impl<'a> SecurityReviewer<'a> {
    pub fn new(driver: &'a AgentDriver, repo_path: &'a Path) -> Self {
        Self { driver, repo_path }
    }

    pub async fn review_changes(
        &self,
        changed_files: &[String],
        context_summary: Option<&str>,
    ) -> Result<SecurityReviewResult, AgentError> {
        if changed_files.is_empty() {
            return Ok(SecurityReviewResult::skipped("no files to review"));
        }

        let context = self.build_context(changed_files, context_summary);
        let response = self.driver.call_security(&context, None).await?;
        Ok(SecurityReviewResult::from_response(response))
    }

    fn build_context(&self, changed_files: &[String], context_summary: Option<&str>) -> String {
        let mut parts = vec!["# Security Review Request\n".to_string()];

        if let Some(summary) = context_summary {
            parts.push(format!("## Context\n{summary}\n"));
        }

        parts.push("## Changed Files\n".to_string());
        parts.push(format!("Total files to review: {}\n", changed_files.len()));

        let mut total_lines = 0usize;
        for file_path in changed_files {
            let full_path = self.repo_path.join(file_path);
            if !full_path.exists() {
                continue;
            }

            let content = match std::fs::read_to_string(&full_path) {
                Ok(content) => content,
                Err(e) => {
                    parts.push(format!("\n### {file_path}\nError reading file: {e}\n"));
                    continue;
                }
            };

            let lines: Vec<&str> = content.split('\n').collect();
            if total_lines + lines.len() > MAX_CONTEXT_LINES {
                let remaining = MAX_CONTEXT_LINES.saturating_sub(total_lines);
                if remaining > 50 {
                    let truncated = lines[..remaining].join("\n");
                    parts.push(format!("\n### {file_path} (truncated)\n```\n{truncated}\n```\n"));
                }
                break;
            }

            parts.push(format!("\n### {file_path}\n```\n{content}\n```\n"));
            total_lines += lines.len();
        }

        parts.push("\n## Instructions\n".to_string());
        parts.push(
            "Review the above code changes for security vulnerabilities. Focus on:\n\
             - Injection vulnerabilities (SQL, command, XSS)\n\
             - Authentication and authorization issues\n\
             - Data exposure and sensitive data handling\n\
             - Cryptographic weaknesses\n\
             - Input validation issues\n\
             - Race conditions\n\n\
             Return your findings in the required JSON schema format."
                .to_string(),
        );

        parts.join("\n")
    }
}

/// Formats a review result for terminal display, mirroring the original's
/// plain-text report layout.
pub fn format_security_report(result: &SecurityReviewResult) -> String {
    let mut lines = vec!["=".repeat(60), "SECURITY REVIEW REPORT".to_string(), "=".repeat(60)];

    if !result.success {
        lines.push(format!("\nError: {}", result.error_message.as_deref().unwrap_or("unknown error")));
        return lines.join("\n");
    }

    lines.push(format!("\nOverall Risk: {:?}", result.overall_risk).to_uppercase());
    lines.push("\nFindings Summary:".to_string());
    lines.push(format!("  High:   {}", result.summary.high));
    lines.push(format!("  Medium: {}", result.summary.medium));
    lines.push(format!("  Low:    {}", result.summary.low));
    lines.push(format!("  Info:   {}", result.summary.info));
    lines.push(format!("  Total:  {}", result.summary.total()));

    if let Some(notes) = &result.notes {
        lines.push(format!("\nNotes: {notes}"));
    }

    if !result.findings.is_empty() {
        lines.push("\n".to_string() + &"-".repeat(60));
        lines.push("DETAILED FINDINGS".to_string());
        lines.push("-".repeat(60));

        for (i, finding) in result.findings.iter().enumerate() {
            lines.push(format!("\n[{}] {:?}: {}", i + 1, finding.severity, finding.title).to_uppercase());
            lines.push(format!("    File: {}:{}", finding.file, finding.line));
            lines.push(format!("    Category: {:?}", finding.category));
            if let Some(cwe) = &finding.cwe {
                lines.push(format!("    CWE: {cwe}"));
            }
            lines.push(format!("    Description: {}", finding.description));
            lines.push(format!("    Recommendation: {}", finding.recommendation));
        }
    } else {
        lines.push("\nNo security vulnerabilities identified.".to_string());
    }

    lines.push("\n".to_string() + &"=".repeat(60));

    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_list_short_circuits_without_calling_the_agent() {
        let result = SecurityReviewResult::skipped("no files to review");
        assert!(result.success);
        assert!(result.findings.is_empty());
        assert!(!result.has_blocking_issues(true));
    }

    #[test]
    fn high_severity_finding_blocks_merge_by_default() {
        let result = SecurityReviewResult {
            success: true,
            findings: vec![SecurityFinding {
                severity: Severity::High,
                category: Category::Injection,
                file: "src/db.rs".to_string(),
                line: 42,
                title: "SQL built from unescaped input".to_string(),
                description: "desc".to_string(),
                recommendation: "use parameterized queries".to_string(),
                cwe: Some("CWE-89".to_string()),
            }],
            summary: SecuritySummary { high: 1, medium: 0, low: 0, info: 0 },
            overall_risk: OverallRisk::High,
            notes: None,
            error_message: None,
        };
        assert!(result.has_blocking_issues(true));
        assert!(!result.has_blocking_issues(false));
    }

    #[test]
    fn critical_overall_risk_blocks_regardless_of_high_count() {
        let result = SecurityReviewResult {
            success: true,
            findings: Vec::new(),
            summary: SecuritySummary::default(),
            overall_risk: OverallRisk::Critical,
            notes: None,
            error_message: None,
        };
        assert!(result.has_blocking_issues(false));
    }

    #[test]
    fn low_and_medium_findings_do_not_block() {
        let result = SecurityReviewResult {
            success: true,
            findings: Vec::new(),
            summary: SecuritySummary { high: 0, medium: 3, low: 5, info: 1 },
            overall_risk: OverallRisk::Medium,
            notes: None,
            error_message: None,
        };
        assert!(!result.has_blocking_issues(true));
        assert_eq!(result.summary.total(), 9);
    }

    #[test]
    fn report_formats_failed_review_with_error_message() {
        let result = SecurityReviewResult::from_error("agent binary not found");
        let report = format_security_report(&result);
        assert!(report.contains("agent binary not found"));
    }

    #[test]
    fn from_response_parses_structured_output() {
        let response = AgentResponse {
            success: true,
            raw_output: String::new(),
            structured_output: Some(serde_json::json!({
                "findings": [{
                    "severity": "medium",
                    "category": "crypto",
                    "file": "src/auth.rs",
                    "line": 10,
                    "title": "weak hash",
                    "description": "uses md5",
                    "recommendation": "use a modern KDF",
                }],
                "summary": {"high": 0, "medium": 1, "low": 0, "info": 0},
                "overall_risk": "medium",
            })),
            error_message: None,
            session_id: "s1".to_string(),
            cancelled: false,
        };
        let result = SecurityReviewResult::from_response(response);
        assert!(result.success);
        assert_eq!(result.findings.len(), 1);
        assert_eq!(result.summary.medium, 1);
        assert_eq!(result.overall_risk, OverallRisk::Medium);
    }
}
