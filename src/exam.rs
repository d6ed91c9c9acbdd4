use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// Grade (out of 20) at or above which an exam counts as passed.
pub const PASSING_GRADE: u32 = 10;

const MCQ_POINTS: f64 = 1.0;
const BOOLEAN_POINTS: f64 = 1.0;
const RESOLUTION_POINTS: f64 = 5.0;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExamStatus {
    NotStarted,
    InProgress,
    Passed,
    Failed,
}

impl ExamStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExamStatus::NotStarted => "not_started",
            ExamStatus::InProgress => "in_progress",
            ExamStatus::Passed => "passed",
            ExamStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "not_started" => Some(ExamStatus::NotStarted),
            "in_progress" => Some(ExamStatus::InProgress),
            "passed" => Some(ExamStatus::Passed),
            "failed" => Some(ExamStatus::Failed),
            _ => None,
        }
    }
}

/// Exam question. MCQ answers match by option index or by the answer label;
/// resolution questions are free text scored against a model answer by the
/// remote similarity service.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExamQuestion {
    Mcq {
        id: u32,
        question: String,
        options: Vec<String>,
        answer_index: usize,
        answer: String,
    },
    TrueFalse {
        id: u32,
        question: String,
        answer: bool,
    },
    Resolution {
        id: u32,
        question: String,
        answer: String,
    },
}

impl ExamQuestion {
    pub fn id(&self) -> u32 {
        match self {
            ExamQuestion::Mcq { id, .. }
            | ExamQuestion::TrueFalse { id, .. }
            | ExamQuestion::Resolution { id, .. } => *id,
        }
    }

    pub fn max_points(&self) -> f64 {
        match self {
            ExamQuestion::Mcq { .. } => MCQ_POINTS,
            ExamQuestion::TrueFalse { .. } => BOOLEAN_POINTS,
            ExamQuestion::Resolution { .. } => RESOLUTION_POINTS,
        }
    }
}

/// A learner's answer to one question.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(untagged)]
pub enum ExamAnswer {
    Index(usize),
    Text(String),
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SubmittedAnswer {
    pub question_id: u32,
    pub answer: ExamAnswer,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ScoredAnswer {
    pub question_id: u32,
    pub points_earned: f64,
    pub max_points: f64,
    pub correct: bool,
    /// Similarity percentage for resolution questions, when the remote call
    /// succeeded.
    pub similarity: Option<f64>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ExamResult {
    pub total_points_earned: f64,
    pub total_max_points: f64,
    pub final_grade_20: u32,
    pub correct_count: u32,
    pub status: ExamStatus,
    pub answers: Vec<ScoredAnswer>,
    pub completed_at: DateTime<Utc>,
}

/// Remote free-text similarity scorer, as a seam so tests can stub it.
/// Returns a percentage in 0..=100.
#[async_trait]
pub trait SimilarityScorer: Send + Sync {
    async fn similarity(&self, user_answer: &str, model_answer: &str)
        -> Result<f64, EngineError>;
}

/// Band a similarity percentage into resolution points.
pub fn resolution_points(similarity: f64) -> f64 {
    if similarity >= 80.0 {
        5.0
    } else if similarity >= 50.0 {
        2.5
    } else {
        0.0
    }
}

/// Final grade out of 20, rounded half-up.
pub fn grade_out_of_20(earned: f64, max: f64) -> u32 {
    if max <= 0.0 {
        return 0;
    }
    (earned / max * 20.0).round() as u32
}

fn score_mcq(options: &[String], answer_index: usize, answer: &str, given: &ExamAnswer) -> bool {
    match given {
        ExamAnswer::Index(i) => *i == answer_index,
        ExamAnswer::Text(t) => {
            let t = t.trim();
            t.eq_ignore_ascii_case(answer)
                || options
                    .get(answer_index)
                    .is_some_and(|opt| t.eq_ignore_ascii_case(opt))
        }
    }
}

fn score_boolean(answer: bool, given: &ExamAnswer) -> bool {
    match given {
        ExamAnswer::Text(t) => {
            let t = t.trim();
            (answer && t.eq_ignore_ascii_case("true"))
                || (!answer && t.eq_ignore_ascii_case("false"))
        }
        ExamAnswer::Index(_) => false,
    }
}

/// Score a full submission. A missing answer earns 0 for that question; a
/// failed similarity call degrades that question to 0 points rather than
/// aborting the submission.
pub async fn score_exam(
    questions: &[ExamQuestion],
    answers: &[SubmittedAnswer],
    scorer: &dyn SimilarityScorer,
    now: DateTime<Utc>,
) -> ExamResult {
    let mut scored = Vec::with_capacity(questions.len());
    let mut earned = 0.0;
    let mut max = 0.0;
    let mut correct_count = 0u32;

    for q in questions {
        max += q.max_points();
        let given = answers.iter().find(|a| a.question_id == q.id());

        let (points, similarity) = match (q, given) {
            (_, None) => (0.0, None),
            (ExamQuestion::Mcq { options, answer_index, answer, .. }, Some(a)) => {
                let ok = score_mcq(options, *answer_index, answer, &a.answer);
                (if ok { MCQ_POINTS } else { 0.0 }, None)
            }
            (ExamQuestion::TrueFalse { answer, .. }, Some(a)) => {
                let ok = score_boolean(*answer, &a.answer);
                (if ok { BOOLEAN_POINTS } else { 0.0 }, None)
            }
            (ExamQuestion::Resolution { answer: model, id, .. }, Some(a)) => {
                let text = match &a.answer {
                    ExamAnswer::Text(t) => t.as_str(),
                    ExamAnswer::Index(_) => "",
                };
                match scorer.similarity(text, model).await {
                    Ok(pct) => (resolution_points(pct), Some(pct)),
                    Err(e) => {
                        tracing::warn!(question_id=%id, error=%e, "similarity scoring failed, awarding 0");
                        (0.0, None)
                    }
                }
            }
        };

        earned += points;
        if points > 0.0 {
            correct_count += 1;
        }
        scored.push(ScoredAnswer {
            question_id: q.id(),
            points_earned: points,
            max_points: q.max_points(),
            correct: points >= q.max_points(),
            similarity,
        });
    }

    let grade = grade_out_of_20(earned, max);
    ExamResult {
        total_points_earned: earned,
        total_max_points: max,
        final_grade_20: grade,
        correct_count,
        status: if grade >= PASSING_GRADE {
            ExamStatus::Passed
        } else {
            ExamStatus::Failed
        },
        answers: scored,
        completed_at: now,
    }
}
