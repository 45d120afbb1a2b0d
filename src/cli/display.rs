//! Display formatting for CLI output
//!
//! SBIO pattern: Pure functions that format data for display

use crate::discovery::{CandidateEndpoint, DiscoverySession, SessionStatus};
use crate::exposure::PortBinding;
use crate::orchestrator::{CleanupReport, RunReport, Verification};
use crate::probe::ProbeResult;

// ============================================================================
// Table formatting helpers
// ============================================================================

/// Format a simple table with headers and rows
pub fn format_table(headers: &[&str], rows: Vec<Vec<String>>) -> String {
    if rows.is_empty() {
        return "No resources found.\n".to_string();
    }

    let mut widths: Vec<usize> = headers.iter().map(|h| h.len()).collect();
    for row in &rows {
        for (i, cell) in row.iter().enumerate() {
            if i < widths.len() {
                widths[i] = widths[i].max(cell.len());
            }
        }
    }

    let mut output = String::new();

    for (i, header) in headers.iter().enumerate() {
        if i > 0 {
            output.push_str("   ");
        }
        output.push_str(&format!(
            "{:width$}",
            header.to_uppercase(),
            width = widths[i]
        ));
    }
    output.push('\n');

    for row in rows {
        for (i, cell) in row.iter().enumerate() {
            if i > 0 {
                output.push_str("   ");
            }
            if i < widths.len() {
                output.push_str(&format!("{:width$}", cell, width = widths[i]));
            } else {
                output.push_str(cell);
            }
        }
        output.push('\n');
    }

    output
}

// ============================================================================
// Deployment display
// ============================================================================

pub fn format_run_report(report: &RunReport) -> String {
    let mut output = format!(
        "{} deployment ready in {:.1}s\n",
        report.target,
        report.elapsed.as_secs_f64()
    );
    output.push_str(&format!("  app: {}\n", report.ready.app_url));
    for (name, url) in &report.ready.auxiliary_urls {
        output.push_str(&format!("  {}: {}\n", name, url));
    }
    output.push_str(&format_verification(&report.verification));
    output
}

pub fn format_verification(verification: &Verification) -> String {
    match verification {
        Verification::Verified => "Verified: health and chat endpoints respond\n".to_string(),
        Verification::Unverified(reason) => format!("Deployed but unverified: {}\n", reason),
    }
}

pub fn format_bindings(bindings: &[&PortBinding]) -> String {
    let headers = &["name", "local", "remote", "target", "pid", "age"];
    let now = chrono::Utc::now();
    let rows = bindings
        .iter()
        .map(|b| {
            vec![
                b.name.clone(),
                b.local_url(),
                b.remote.clone(),
                b.target.to_string(),
                b.pid().map(|p| p.to_string()).unwrap_or_else(|| "-".to_string()),
                format_age(now.signed_duration_since(b.created_at)),
            ]
        })
        .collect();
    format_table(headers, rows)
}

fn format_age(age: chrono::Duration) -> String {
    let secs = age.num_seconds().max(0);
    if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        format!("{}m", secs / 60)
    } else if secs < 86400 {
        format!("{}h", secs / 3600)
    } else {
        format!("{}d", secs / 86400)
    }
}

pub fn format_cleanup_report(report: &CleanupReport) -> String {
    let mut output = format!("Released {} port bindings\n", report.released);
    if report.compose_stopped {
        output.push_str("Stopped compose stack\n");
    }
    if report.manifests_deleted > 0 {
        output.push_str(&format!(
            "Deleted {} cluster manifests\n",
            report.manifests_deleted
        ));
    }
    for warning in &report.warnings {
        output.push_str(&format!("warning: {}\n", warning));
    }
    output
}

// ============================================================================
// Discovery display
// ============================================================================

pub fn format_probe_results(results: &[(CandidateEndpoint, ProbeResult)]) -> String {
    let headers = &["endpoint", "label", "outcome", "latency"];
    let rows = results
        .iter()
        .map(|(candidate, result)| {
            vec![
                candidate.url.clone(),
                candidate.label.clone(),
                result.outcome.to_string(),
                format!("{}ms", result.latency_ms),
            ]
        })
        .collect();
    format_table(headers, rows)
}

pub fn format_session(session: &DiscoverySession) -> String {
    match (&session.status, &session.selected) {
        (SessionStatus::Connected, Some(selected)) => format!(
            "Connected to {} ({}) after probing {} candidates\n",
            selected.url, selected.label, session.probed
        ),
        _ => format!(
            "No backend found: {} candidates probed, none healthy\n",
            session.probed
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deploy::{ReadyInfo, TargetKind};
    use crate::probe::ProbeOutcome;
    use crate::runtime::ProcessHandle;
    use chrono::Utc;
    use std::time::Duration;

    #[test]
    fn test_format_table_empty() {
        assert_eq!(format_table(&["a"], vec![]), "No resources found.\n");
    }

    #[test]
    fn test_format_table_aligns_columns() {
        let out = format_table(
            &["name", "url"],
            vec![
                vec!["app".to_string(), "http://localhost:8080".to_string()],
                vec!["grafana".to_string(), "http://localhost:3000".to_string()],
            ],
        );
        let lines: Vec<&str> = out.lines().collect();
        assert!(lines[0].starts_with("NAME      URL"));
        assert!(lines[1].starts_with("app       http://localhost:8080"));
    }

    #[test]
    fn test_format_run_report() {
        let mut ready = ReadyInfo::new("http://localhost:8080");
        ready
            .auxiliary_urls
            .insert("grafana".to_string(), "http://localhost:3000".to_string());
        let report = RunReport {
            target: TargetKind::Cluster,
            ready,
            verification: Verification::Unverified("functional check: 500".to_string()),
            stages: vec![],
            elapsed: Duration::from_millis(42_500),
        };
        let out = format_run_report(&report);
        assert!(out.starts_with("cluster deployment ready in 42.5s"));
        assert!(out.contains("  grafana: http://localhost:3000"));
        assert!(out.contains("Deployed but unverified: functional check: 500"));
    }

    #[test]
    fn test_format_bindings() {
        let binding = PortBinding {
            name: "app".to_string(),
            local_port: 8080,
            remote: "svc/mental-health-app-service:80".to_string(),
            target: TargetKind::Cluster,
            process: Some(ProcessHandle::new(4242, "kubectl")),
            created_at: Utc::now(),
        };
        let out = format_bindings(&[&binding]);
        assert!(out.contains("4242"));
        assert!(out.contains("cluster"));
        assert!(out.contains("0s"));
    }

    #[test]
    fn test_format_age_units() {
        assert_eq!(format_age(chrono::Duration::seconds(90)), "1m");
        assert_eq!(format_age(chrono::Duration::hours(5)), "5h");
        assert_eq!(format_age(chrono::Duration::days(3)), "3d");
    }

    #[test]
    fn test_format_session() {
        let mut session = DiscoverySession::detecting();
        session.status = SessionStatus::Error;
        session.probed = 6;
        assert!(format_session(&session).starts_with("No backend found: 6 candidates"));

        session.status = SessionStatus::Connected;
        session.selected = Some(CandidateEndpoint::new("http://localhost:8000", "local"));
        session.probed = 2;
        assert!(format_session(&session).contains("http://localhost:8000 (local)"));
    }

    #[test]
    fn test_format_probe_results() {
        let candidate = CandidateEndpoint::new("http://localhost:8080", "kubernetes");
        let result = ProbeResult {
            endpoint: candidate.url.clone(),
            outcome: ProbeOutcome::Timeout,
            latency_ms: 3000,
            timestamp: Utc::now(),
        };
        let out = format_probe_results(&[(candidate, result)]);
        assert!(out.contains("timeout"));
        assert!(out.contains("3000ms"));
    }
}
