use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use uuid::Uuid;

use crate::exam::{ExamQuestion, SubmittedAnswer};
use crate::quiz::QuizQuestion;
use crate::unlock::OrderedContent;

/// A course-equivalent content grouping: ordered lessons plus an optional
/// final exam, assigned to a semester tier.
#[derive(sqlx::FromRow, Serialize, Deserialize, Debug, Clone)]
pub struct Module {
    pub id: Uuid,
    pub title: String,
    pub semester: String,
    pub orderindex: i32,
    pub prerequisites: Vec<Uuid>,
    pub exam: Option<Json<Vec<ExamQuestion>>>,
    pub created_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow, Serialize, Deserialize, Debug, Clone)]
pub struct Lesson {
    pub id: Uuid,
    pub module_id: Uuid,
    pub title: String,
    pub orderindex: i32,
    pub video_duration_seconds: f64,
    /// Fraction of the video that must be watched before the quiz unlocks.
    /// Authoritative here; playback ticks cannot override it.
    pub unlock_threshold: f64,
    pub quiz: Option<Json<Vec<QuizQuestion>>>,
    pub created_at: DateTime<Utc>,
}

impl OrderedContent for Module {
    fn content_id(&self) -> Uuid {
        self.id
    }
    fn order_index(&self) -> i32 {
        self.orderindex
    }
}

impl OrderedContent for Lesson {
    fn content_id(&self) -> Uuid {
        self.id
    }
    fn order_index(&self) -> i32 {
        self.orderindex
    }
}

/// One record per (user, lesson), created lazily on first access.
#[derive(sqlx::FromRow, Serialize, Deserialize, Debug, Clone)]
pub struct LessonProgress {
    pub user_id: Uuid,
    pub lesson_id: Uuid,
    pub completed: bool,
    pub score: Option<i32>,
    pub video_watched: bool,
    pub updated_at: DateTime<Utc>,
}

/// One record per (user, module). `is_module_unlocked` can be forced by an
/// admin independently of the ordering rules.
#[derive(sqlx::FromRow, Serialize, Deserialize, Debug, Clone)]
pub struct ModuleProgress {
    pub id: Uuid,
    pub user_id: Uuid,
    pub module_id: Uuid,
    pub is_module_unlocked: bool,
    pub progress_percentage: i32,
    pub completed_lessons: i32,
    pub total_lessons: i32,
    pub exam_passed: Option<bool>,
    pub exam_score: Option<i32>,
    pub updated_at: DateTime<Utc>,
}

/// A scored exam submission. Write-once after reaching `passed`.
#[derive(sqlx::FromRow, Serialize, Deserialize, Debug, Clone)]
pub struct ExamRecord {
    pub id: Uuid,
    pub user_id: Uuid,
    pub module_id: Uuid,
    pub score: i32,
    pub correct_count: i32,
    pub status: String,
    pub attempt_number: i32,
    pub answers: Json<serde_json::Value>,
    pub idempotency_key: Option<Uuid>,
    pub time_spent_seconds: Option<i64>,
    pub created_at: DateTime<Utc>,
}

// --- request/response bodies ---

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct CreateModuleReq {
    pub title: String,
    pub semester: String,
    pub orderindex: i32,
    #[serde(default)]
    pub prerequisites: Vec<Uuid>,
    pub exam: Option<Vec<ExamQuestion>>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct CreateLessonReq {
    pub module_id: Uuid,
    pub title: String,
    pub orderindex: i32,
    pub video_duration_seconds: f64,
    #[serde(default = "default_threshold")]
    pub unlock_threshold: f64,
    pub quiz: Option<Vec<QuizQuestion>>,
}

pub fn default_threshold() -> f64 {
    0.01
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct PlaybackTickReq {
    pub position_seconds: f64,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct PlaybackTickResp {
    pub total_watched_seconds: f64,
    pub quiz_unlocked: bool,
    pub segments: Vec<crate::segments::WatchSegment>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct QuizAnswerReq {
    pub option_index: usize,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ExamSubmitReq {
    pub answers: Vec<SubmittedAnswer>,
    pub idempotency_key: Option<Uuid>,
    pub time_spent_seconds: Option<i64>,
}
