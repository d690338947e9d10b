use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;
use uuid::Uuid;

/// Every assessment is assumed to be marked out of this many points when the
/// overall grade is derived, independent of the assessment's own total.
pub const NORMALIZED_ASSESSMENT_MAX: f64 = 100.0;

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("total possible score must be positive (obtained {obtained}, total {total})")]
    InvalidInput { obtained: f64, total: f64 },

    #[error("mark {mark_id} references a missing {kind}")]
    InvalidReference { mark_id: String, kind: &'static str },

    #[error("invalid student id")]
    InvalidStudent,

    #[error("student lacks any marks data")]
    NoData,

    #[error("{source}")]
    Storage {
        code: &'static str,
        #[source]
        source: rusqlite::Error,
    },
}

impl ReportError {
    pub fn storage(code: &'static str, source: rusqlite::Error) -> Self {
        Self::Storage { code, source }
    }

    /// Wire code used in error envelopes.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidInput { .. } => "invalid_input",
            Self::InvalidReference { .. } => "invalid_reference",
            Self::InvalidStudent => "invalid_student",
            Self::NoData => "no_data",
            Self::Storage { code, .. } => code,
        }
    }
}

/// Ordered best first: `A < B < ... < E`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Letter {
    A,
    B,
    C,
    D,
    E,
}

impl Letter {
    pub fn as_str(self) -> &'static str {
        match self {
            Letter::A => "A",
            Letter::B => "B",
            Letter::C => "C",
            Letter::D => "D",
            Letter::E => "E",
        }
    }

    pub fn parse(s: &str) -> Option<Letter> {
        match s {
            "A" => Some(Letter::A),
            "B" => Some(Letter::B),
            "C" => Some(Letter::C),
            "D" => Some(Letter::D),
            "E" => Some(Letter::E),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectRef {
    pub id: String,
    pub name: String,
    pub code: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssessmentTypeRef {
    pub id: String,
    pub name: String,
}

/// A stored mark with its subject and assessment type already resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct MarkRecord {
    pub student_id: String,
    pub subject: SubjectRef,
    pub assessment_type: AssessmentTypeRef,
    pub obtained_score: f64,
    pub total_possible_score: f64,
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssessmentEntry {
    pub assessment_type: AssessmentTypeRef,
    pub obtained_score: f64,
    pub grade: Letter,
    pub description: Option<String>,
    pub total_possible_score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectAssessmentGroup {
    pub subject: SubjectRef,
    pub assessments: Vec<AssessmentEntry>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CumulativeScore {
    pub cumulative_points: f64,
    pub total_possible_points: f64,
    pub overall_grade: Letter,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportRecord {
    pub id: String,
    pub student_id: String,
    pub academic_year: String,
    pub subjects: Vec<SubjectAssessmentGroup>,
    pub cumulative_points: f64,
    pub attendance: Option<f64>,
    pub behavior: Option<String>,
    pub overall_grade: Letter,
    pub generated_at: DateTime<Utc>,
}

pub fn grade(obtained: f64, total: f64) -> Result<Letter, ReportError> {
    if !(total > 0.0) {
        return Err(ReportError::InvalidInput { obtained, total });
    }
    let percentage = 100.0 * obtained / total;
    let letter = if percentage >= 90.0 {
        Letter::A
    } else if percentage >= 80.0 {
        Letter::B
    } else if percentage >= 70.0 {
        Letter::C
    } else if percentage >= 60.0 {
        Letter::D
    } else {
        Letter::E
    };
    Ok(letter)
}

/// Groups marks by subject in first-seen order. Entries keep input order
/// within their subject and are graded from their own scores.
pub fn aggregate(records: &[MarkRecord]) -> Result<Vec<SubjectAssessmentGroup>, ReportError> {
    if records.is_empty() {
        return Err(ReportError::NoData);
    }

    let mut index_by_subject: HashMap<&str, usize> = HashMap::new();
    let mut groups: Vec<SubjectAssessmentGroup> = Vec::new();

    for record in records {
        let idx = match index_by_subject.get(record.subject.id.as_str()) {
            Some(&i) => i,
            None => {
                groups.push(SubjectAssessmentGroup {
                    subject: record.subject.clone(),
                    assessments: Vec::new(),
                });
                index_by_subject.insert(record.subject.id.as_str(), groups.len() - 1);
                groups.len() - 1
            }
        };

        groups[idx].assessments.push(AssessmentEntry {
            assessment_type: record.assessment_type.clone(),
            obtained_score: record.obtained_score,
            grade: grade(record.obtained_score, record.total_possible_score)?,
            description: record.description.clone(),
            total_possible_score: record.total_possible_score,
        });
    }

    Ok(groups)
}

pub fn score(
    groups: &[SubjectAssessmentGroup],
    record_count: usize,
) -> Result<CumulativeScore, ReportError> {
    if record_count == 0 {
        return Err(ReportError::NoData);
    }

    let cumulative_points: f64 = groups
        .iter()
        .flat_map(|g| g.assessments.iter())
        .map(|a| a.obtained_score)
        .sum();
    // Denominator ignores each entry's own total; see DESIGN.md.
    let total_possible_points = record_count as f64 * NORMALIZED_ASSESSMENT_MAX;

    Ok(CumulativeScore {
        cumulative_points,
        total_possible_points,
        overall_grade: grade(cumulative_points, total_possible_points)?,
    })
}

pub fn assemble(
    student_id: &str,
    academic_year: &str,
    groups: Vec<SubjectAssessmentGroup>,
    score: CumulativeScore,
    attendance: Option<f64>,
    behavior: Option<String>,
) -> ReportRecord {
    ReportRecord {
        id: Uuid::new_v4().to_string(),
        student_id: student_id.to_string(),
        academic_year: academic_year.to_string(),
        subjects: groups,
        cumulative_points: score.cumulative_points,
        attendance,
        behavior,
        overall_grade: score.overall_grade,
        generated_at: Utc::now(),
    }
}

pub fn build_report(
    student_id: &str,
    academic_year: &str,
    records: &[MarkRecord],
    attendance: Option<f64>,
    behavior: Option<String>,
) -> Result<ReportRecord, ReportError> {
    let groups = aggregate(records)?;
    let cumulative = score(&groups, records.len())?;
    Ok(assemble(
        student_id,
        academic_year,
        groups,
        cumulative,
        attendance,
        behavior,
    ))
}
