//! Deterministic pre-filter gates for scraped job postings.
//!
//! The filter stage runs before any AI call: every gate is a pure check
//! against the scraped fields, and a posting that fails any gate is
//! terminally `filtered` with the gate names recorded. Gates: title
//! keywords, freshness, work arrangement, employment type, salary floor and
//! rejected technologies.

use chrono::{DateTime, Duration, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Gates a posting can be rejected by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterGate {
    TitleKeywords,
    Freshness,
    WorkArrangement,
    EmploymentType,
    SalaryFloor,
    RejectedTechnology,
}

impl std::fmt::Display for FilterGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            FilterGate::TitleKeywords => "title_keywords",
            FilterGate::Freshness => "freshness",
            FilterGate::WorkArrangement => "work_arrangement",
            FilterGate::EmploymentType => "employment_type",
            FilterGate::SalaryFloor => "salary_floor",
            FilterGate::RejectedTechnology => "rejected_technology",
        };
        write!(f, "{}", name)
    }
}

/// One gate rejection with a human-readable explanation.
#[derive(Debug, Clone)]
pub struct GateRejection {
    pub gate: FilterGate,
    pub detail: String,
}

/// Result of running all gates against one posting.
#[derive(Debug, Clone, Default)]
pub struct FilterVerdict {
    pub rejections: Vec<GateRejection>,
}

impl FilterVerdict {
    /// Whether the posting passed every gate.
    pub fn passed(&self) -> bool {
        self.rejections.is_empty()
    }

    /// Joins the rejection details into one message for the item record.
    pub fn summary(&self) -> String {
        self.rejections
            .iter()
            .map(|r| format!("{}: {}", r.gate, r.detail))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// Declarative filter policy. Empty lists disable the corresponding gate.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FilterPolicy {
    /// The title must contain at least one of these (case-insensitive).
    #[serde(default)]
    pub required_title_keywords: Vec<String>,
    /// Maximum posting age in days.
    #[serde(default)]
    pub max_age_days: Option<i64>,
    /// Accepted work arrangements (e.g. "remote", "hybrid").
    #[serde(default)]
    pub allowed_arrangements: Vec<String>,
    /// Accepted employment types (e.g. "full_time", "contract").
    #[serde(default)]
    pub allowed_employment_types: Vec<String>,
    /// Minimum acceptable salary; postings advertising less are rejected,
    /// postings with no salary information pass this gate.
    #[serde(default)]
    pub salary_floor: Option<f64>,
    /// Technologies that disqualify a posting outright (whole-word match
    /// against title and description).
    #[serde(default)]
    pub rejected_technologies: Vec<String>,
}

impl FilterPolicy {
    /// Runs every gate against one scraped posting.
    ///
    /// `scraped` is the `pipeline_state.scraped` object produced by the
    /// scrape stage: `title`, `description`, `posted_at` (RFC 3339),
    /// `work_arrangement`, `employment_type`, `salary_min` are read when
    /// present.
    pub fn evaluate(&self, scraped: &Value, now: DateTime<Utc>) -> FilterVerdict {
        let mut verdict = FilterVerdict::default();

        let title = str_field(scraped, "title");
        let description = str_field(scraped, "description");

        if !self.required_title_keywords.is_empty() {
            let title_lower = title.to_lowercase();
            let hit = self
                .required_title_keywords
                .iter()
                .any(|k| title_lower.contains(&k.to_lowercase()));
            if !hit {
                verdict.rejections.push(GateRejection {
                    gate: FilterGate::TitleKeywords,
                    detail: format!("title '{title}' matches no required keyword"),
                });
            }
        }

        if let Some(max_age) = self.max_age_days {
            match scraped
                .get("posted_at")
                .and_then(Value::as_str)
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            {
                Some(posted_at) => {
                    let age = now.signed_duration_since(posted_at.with_timezone(&Utc));
                    if age > Duration::days(max_age) {
                        verdict.rejections.push(GateRejection {
                            gate: FilterGate::Freshness,
                            detail: format!("posted {} days ago", age.num_days()),
                        });
                    }
                }
                None => verdict.rejections.push(GateRejection {
                    gate: FilterGate::Freshness,
                    detail: "posting date missing or unparseable".to_string(),
                }),
            }
        }

        if !self.allowed_arrangements.is_empty() {
            let arrangement = str_field(scraped, "work_arrangement").to_lowercase();
            if !self
                .allowed_arrangements
                .iter()
                .any(|a| a.to_lowercase() == arrangement)
            {
                verdict.rejections.push(GateRejection {
                    gate: FilterGate::WorkArrangement,
                    detail: format!("arrangement '{arrangement}' not allowed"),
                });
            }
        }

        if !self.allowed_employment_types.is_empty() {
            let employment = str_field(scraped, "employment_type").to_lowercase();
            if !self
                .allowed_employment_types
                .iter()
                .any(|t| t.to_lowercase() == employment)
            {
                verdict.rejections.push(GateRejection {
                    gate: FilterGate::EmploymentType,
                    detail: format!("employment type '{employment}' not allowed"),
                });
            }
        }

        if let Some(floor) = self.salary_floor {
            if let Some(salary) = scraped.get("salary_min").and_then(Value::as_f64) {
                if salary < floor {
                    verdict.rejections.push(GateRejection {
                        gate: FilterGate::SalaryFloor,
                        detail: format!("salary {salary} below floor {floor}"),
                    });
                }
            }
        }

        for tech in &self.rejected_technologies {
            if let Some(pattern) = word_pattern(tech) {
                let haystack = format!("{title}\n{description}");
                if pattern.is_match(&haystack) {
                    verdict.rejections.push(GateRejection {
                        gate: FilterGate::RejectedTechnology,
                        detail: format!("mentions rejected technology '{tech}'"),
                    });
                }
            }
        }

        verdict
    }
}

fn str_field<'a>(value: &'a Value, key: &str) -> &'a str {
    value.get(key).and_then(Value::as_str).unwrap_or("")
}

/// Case-insensitive whole-word pattern for a technology name.
fn word_pattern(tech: &str) -> Option<Regex> {
    Regex::new(&format!(r"(?i)\b{}\b", regex::escape(tech))).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn posting() -> Value {
        json!({
            "title": "Senior Rust Engineer",
            "description": "Backend services in Rust and Postgres.",
            "posted_at": "2026-08-25T00:00:00Z",
            "work_arrangement": "remote",
            "employment_type": "full_time",
            "salary_min": 140000.0
        })
    }

    fn now() -> DateTime<Utc> {
        "2026-08-31T00:00:00Z".parse().expect("valid timestamp")
    }

    #[test]
    fn test_empty_policy_passes_everything() {
        let verdict = FilterPolicy::default().evaluate(&posting(), now());
        assert!(verdict.passed());
    }

    #[test]
    fn test_title_keyword_gate() {
        let policy = FilterPolicy {
            required_title_keywords: vec!["rust".to_string(), "systems".to_string()],
            ..Default::default()
        };
        assert!(policy.evaluate(&posting(), now()).passed());

        let mut off_topic = posting();
        off_topic["title"] = json!("Marketing Manager");
        let verdict = policy.evaluate(&off_topic, now());
        assert!(!verdict.passed());
        assert_eq!(verdict.rejections[0].gate, FilterGate::TitleKeywords);
    }

    #[test]
    fn test_freshness_gate() {
        let policy = FilterPolicy {
            max_age_days: Some(3),
            ..Default::default()
        };

        // Posted 6 days before `now`.
        let verdict = policy.evaluate(&posting(), now());
        assert!(!verdict.passed());
        assert_eq!(verdict.rejections[0].gate, FilterGate::Freshness);

        let mut fresh = posting();
        fresh["posted_at"] = json!("2026-08-30T00:00:00Z");
        assert!(policy.evaluate(&fresh, now()).passed());
    }

    #[test]
    fn test_missing_posting_date_fails_freshness() {
        let policy = FilterPolicy {
            max_age_days: Some(30),
            ..Default::default()
        };
        let mut undated = posting();
        undated.as_object_mut().unwrap().remove("posted_at");

        assert!(!policy.evaluate(&undated, now()).passed());
    }

    #[test]
    fn test_arrangement_gate() {
        let policy = FilterPolicy {
            allowed_arrangements: vec!["remote".to_string(), "hybrid".to_string()],
            ..Default::default()
        };
        assert!(policy.evaluate(&posting(), now()).passed());

        let mut onsite = posting();
        onsite["work_arrangement"] = json!("onsite");
        assert!(!policy.evaluate(&onsite, now()).passed());
    }

    #[test]
    fn test_employment_type_gate() {
        let policy = FilterPolicy {
            allowed_employment_types: vec!["full_time".to_string()],
            ..Default::default()
        };
        assert!(policy.evaluate(&posting(), now()).passed());

        let mut contract = posting();
        contract["employment_type"] = json!("contract");
        assert!(!policy.evaluate(&contract, now()).passed());
    }

    #[test]
    fn test_salary_floor_gate() {
        let policy = FilterPolicy {
            salary_floor: Some(120000.0),
            ..Default::default()
        };
        assert!(policy.evaluate(&posting(), now()).passed());

        let mut low = posting();
        low["salary_min"] = json!(90000.0);
        assert!(!policy.evaluate(&low, now()).passed());

        // No salary information passes the gate.
        let mut unsalaried = posting();
        unsalaried.as_object_mut().unwrap().remove("salary_min");
        assert!(policy.evaluate(&unsalaried, now()).passed());
    }

    #[test]
    fn test_rejected_technology_is_whole_word() {
        let policy = FilterPolicy {
            rejected_technologies: vec!["java".to_string()],
            ..Default::default()
        };

        // "javascript" must not match "java".
        let mut js = posting();
        js["description"] = json!("Frontend in javascript and typescript.");
        assert!(policy.evaluate(&js, now()).passed());

        let mut java = posting();
        java["description"] = json!("Legacy Java services.");
        let verdict = policy.evaluate(&java, now());
        assert!(!verdict.passed());
        assert_eq!(verdict.rejections[0].gate, FilterGate::RejectedTechnology);
    }

    #[test]
    fn test_verdict_summary_collects_all_gates() {
        let policy = FilterPolicy {
            required_title_keywords: vec!["rust".to_string()],
            salary_floor: Some(200000.0),
            ..Default::default()
        };
        let mut bad = posting();
        bad["title"] = json!("Ops Associate");

        let verdict = policy.evaluate(&bad, now());
        assert_eq!(verdict.rejections.len(), 2);
        assert!(verdict.summary().contains("title_keywords"));
        assert!(verdict.summary().contains("salary_floor"));
    }
}
