//! Robot Framework `output.xml` summaries.

use std::sync::OnceLock;

use chrono::NaiveDateTime;
use regex::Regex;
use thiserror::Error;

const ROBOT_TIME_FORMAT: &str = "%Y%m%d %H:%M:%S%.f";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResultsError {
    #[error("output.xml has no total statistics")]
    MissingStatistics,
}

/// Outcome of one test run as recorded by Robot Framework.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RobotSummary {
    pub passed: u64,
    pub failed: u64,
    pub started_at: Option<NaiveDateTime>,
    pub ended_at: Option<NaiveDateTime>,
}

impl RobotSummary {
    pub fn success(&self) -> bool {
        self.failed == 0
    }
}

struct Patterns {
    total: Regex,
    status: Regex,
    start: Regex,
    end: Regex,
}

fn patterns() -> &'static Patterns {
    static PATTERNS: OnceLock<Patterns> = OnceLock::new();
    PATTERNS.get_or_init(|| Patterns {
        total: Regex::new(r"<total>\s*<stat\b([^>]*)>").expect("total pattern is valid"),
        status: Regex::new(r"<status\b([^>]*)>").expect("status pattern is valid"),
        start: Regex::new(r#"\bstarttime="([^"]*)""#).expect("start pattern is valid"),
        end: Regex::new(r#"\bendtime="([^"]*)""#).expect("end pattern is valid"),
    })
}

fn count(attrs: &str, name: &str) -> u64 {
    let needle = format!("{name}=\"");
    attrs
        .find(&needle)
        .map(|i| &attrs[i + needle.len()..])
        .and_then(|rest| rest.split('"').next())
        .and_then(|n| n.parse().ok())
        .unwrap_or(0)
}

/// Summarize an `output.xml` document.
///
/// The pass/fail counts come from the total statistics. The run spans the
/// earliest start and the latest end of any status element before the
/// statistics section.
pub fn parse_output_xml(xml: &str) -> Result<RobotSummary, ResultsError> {
    let p = patterns();
    let stats = p.total.captures(xml).ok_or(ResultsError::MissingStatistics)?;
    let attrs = &stats[1];

    let body = match xml.find("<statistics>") {
        Some(i) => &xml[..i],
        None => xml,
    };

    let mut started_at: Option<NaiveDateTime> = None;
    let mut ended_at: Option<NaiveDateTime> = None;
    for status in p.status.captures_iter(body) {
        let tag = &status[1];
        let parse = |re: &Regex| {
            re.captures(tag)
                .and_then(|c| NaiveDateTime::parse_from_str(&c[1], ROBOT_TIME_FORMAT).ok())
        };
        if let Some(start) = parse(&p.start) {
            started_at = Some(started_at.map_or(start, |s| s.min(start)));
        }
        if let Some(end) = parse(&p.end) {
            ended_at = Some(ended_at.map_or(end, |e| e.max(end)));
        }
    }

    Ok(RobotSummary {
        passed: count(attrs, "pass"),
        failed: count(attrs, "fail"),
        started_at,
        ended_at,
    })
}
