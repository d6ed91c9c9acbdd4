use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::EngineError;
use crate::exam::{score_exam, SimilarityScorer};
use crate::models::*;
use crate::quiz::{QuizEvaluator, QuizOutcome, QuizPhase};
use crate::segments::SegmentTracker;
use crate::semester;
use crate::session::Session;
use crate::store::ProgressStore;
use crate::unlock;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn ProgressStore>,
    pub similarity: Arc<dyn SimilarityScorer>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        // catalog (admin)
        .route("/api/admin/modules", post(create_module))
        .route("/api/admin/lessons", post(create_lesson))
        // progress lifecycle
        .route("/api/userprogress/initialize", post(initialize_progress))
        .route("/api/session/logout", post(logout))
        // learner views
        .route("/api/users/:user_id/modules", get(list_modules))
        .route(
            "/api/users/:user_id/modules/:module_id/lessons",
            get(list_lessons),
        )
        .route(
            "/api/users/:user_id/modules/:module_id/eligibility",
            get(module_eligibility),
        )
        .route("/api/users/:user_id/semesters", get(semester_overview))
        // lesson runtime
        .route("/api/users/:user_id/lessons/:lesson_id", get(select_lesson))
        .route(
            "/api/users/:user_id/modules/:module_id/lessons/navigate",
            post(navigate_lessons),
        )
        .route(
            "/api/users/:user_id/lessons/:lesson_id/playback",
            post(playback_tick),
        )
        // quiz state machine
        .route(
            "/api/users/:user_id/lessons/:lesson_id/quiz/start",
            post(quiz_start),
        )
        .route(
            "/api/users/:user_id/lessons/:lesson_id/quiz/answer",
            post(quiz_answer),
        )
        .route(
            "/api/users/:user_id/lessons/:lesson_id/quiz/advance",
            post(quiz_advance),
        )
        .route(
            "/api/users/:user_id/lessons/:lesson_id/quiz/retake",
            post(quiz_retake),
        )
        // exams
        .route(
            "/api/users/:user_id/modules/:module_id/exam",
            get(fetch_exam),
        )
        .route(
            "/api/users/:user_id/modules/:module_id/exam/submit",
            post(exam_submit),
        )
        // admin unlock
        .route(
            "/api/users/:user_id/modules/:module_id/unlock",
            post(admin_unlock_module),
        )
        .with_state(state)
}

/// A learner may only touch their own records; admins may touch anyone's.
fn authorize(session: &Session, user_id: Uuid) -> Result<(), EngineError> {
    if session.user_id == user_id || session.roles.is_admin() {
        Ok(())
    } else {
        Err(EngineError::InvalidSession)
    }
}

// --- view models ---

#[derive(Serialize, Debug, Clone)]
pub struct ModuleView {
    pub id: Uuid,
    pub title: String,
    pub semester: String,
    pub orderindex: i32,
    pub progress_percentage: i32,
    pub completed_lessons: i32,
    pub total_lessons: i32,
    pub exam_passed: Option<bool>,
    pub exam_score: Option<i32>,
    pub semester_accessible: bool,
    pub unlocked: bool,
}

#[derive(Serialize, Debug, Clone)]
pub struct LessonView {
    pub id: Uuid,
    pub title: String,
    pub orderindex: i32,
    pub video_duration_seconds: f64,
    pub completed: bool,
    pub video_watched: bool,
    pub score: Option<i32>,
    pub has_quiz: bool,
    pub unlocked: bool,
}

#[derive(Serialize, Debug, Clone)]
pub struct LessonListResp {
    pub lessons: Vec<LessonView>,
    /// First unlocked, uncompleted lesson in order; where the learner should
    /// resume.
    pub next_accessible: Option<Uuid>,
}

#[derive(Serialize, Debug, Clone)]
pub struct SemesterStatus {
    pub tag: &'static str,
    pub name: &'static str,
    pub completion_percentage: i32,
    pub completed: bool,
    pub accessible: bool,
}

#[derive(Serialize, Debug, Clone)]
pub struct SemesterOverview {
    pub semesters: Vec<SemesterStatus>,
    pub highest_accessible: &'static str,
    pub next_to_unlock: Option<&'static str>,
}

#[derive(Serialize, Debug, Clone)]
pub struct QuestionView {
    pub id: u32,
    pub question: String,
    pub options: Vec<String>,
    pub number: usize,
    pub total: usize,
    pub seconds_remaining: i64,
}

#[derive(Serialize, Debug, Clone)]
pub struct QuizStateResp {
    pub phase: QuizPhase,
    pub question: Option<QuestionView>,
    pub outcome: Option<QuizOutcome>,
    pub lesson_completed: bool,
}

#[derive(Deserialize, Debug)]
pub struct NavigateReq {
    pub current: Uuid,
    pub direction: String,
}

#[derive(Serialize, Debug, Clone)]
pub struct ExamSubmitResp {
    pub replayed: bool,
    pub record: ExamRecord,
}

// --- gating helpers ---

struct ModuleGate {
    semester_completions: HashMap<String, bool>,
    modules: Vec<Module>,
    progress: HashMap<Uuid, ModuleProgress>,
}

impl ModuleGate {
    async fn load(store: &dyn ProgressStore, user_id: Uuid) -> Result<Self, EngineError> {
        let modules = store.modules().await?;
        let progress: HashMap<Uuid, ModuleProgress> = store
            .module_progress_for_user(user_id)
            .await?
            .into_iter()
            .map(|p| (p.module_id, p))
            .collect();

        let mut per_semester: HashMap<String, Vec<Option<i32>>> = HashMap::new();
        for m in &modules {
            per_semester
                .entry(m.semester.clone())
                .or_default()
                .push(progress.get(&m.id).map(|p| p.progress_percentage));
        }

        Ok(Self {
            semester_completions: semester::completion_map(&per_semester),
            modules,
            progress,
        })
    }

    fn percentage(&self, module_id: Uuid) -> Option<i32> {
        self.progress.get(&module_id).map(|p| p.progress_percentage)
    }

    /// A module is open when its semester tier is reachable and either an
    /// admin forced it open or its predecessor in the tier is fully done.
    fn is_open(&self, module: &Module) -> bool {
        if !semester::is_semester_accessible(&module.semester, &self.semester_completions) {
            return false;
        }
        if self
            .progress
            .get(&module.id)
            .is_some_and(|p| p.is_module_unlocked)
        {
            return true;
        }
        let siblings: Vec<&Module> = self
            .modules
            .iter()
            .filter(|m| m.semester == module.semester)
            .collect();
        let done: HashSet<Uuid> = siblings
            .iter()
            .filter(|m| self.percentage(m.id) == Some(100))
            .map(|m| m.id)
            .collect();
        unlock::is_unlocked(&siblings, &done, module.id)
    }
}

async fn ensure_module_open(
    store: &dyn ProgressStore,
    user_id: Uuid,
    module: &Module,
) -> Result<(), EngineError> {
    let gate = ModuleGate::load(store, user_id).await?;
    if gate.is_open(module) {
        Ok(())
    } else {
        Err(EngineError::Locked(semester::course_lock_message(
            &module.semester,
            &gate.semester_completions,
        )))
    }
}

/// Lesson gate: the owning module must be open and the lesson's predecessor
/// (by order index) completed.
async fn ensure_lesson_accessible(
    store: &dyn ProgressStore,
    user_id: Uuid,
    lesson: &Lesson,
) -> Result<(), EngineError> {
    let module = store.module(lesson.module_id).await?;
    ensure_module_open(store, user_id, &module).await?;

    let lessons = store.lessons_for_module(lesson.module_id).await?;
    let done = completed_lessons(store, user_id, lesson.module_id).await?;
    unlock::select(&lessons, &done, lesson.id)
        .map(|_| ())
        .map_err(|notice| EngineError::Locked(notice.message))
}

async fn completed_lessons(
    store: &dyn ProgressStore,
    user_id: Uuid,
    module_id: Uuid,
) -> Result<HashSet<Uuid>, EngineError> {
    Ok(store
        .lesson_progress_for_module(user_id, module_id)
        .await?
        .into_iter()
        .filter(|p| p.completed)
        .map(|p| p.lesson_id)
        .collect())
}

// --- catalog ---

async fn create_module(
    State(state): State<AppState>,
    session: Session,
    Json(req): Json<CreateModuleReq>,
) -> Result<Json<Module>, EngineError> {
    session.require_admin()?;
    if !semester::SEMESTER_ORDER.contains(&req.semester.as_str()) {
        return Err(EngineError::BadRequest(format!(
            "unknown semester tag {}",
            req.semester
        )));
    }
    let module = state.store.insert_module(req).await?;
    tracing::info!(module_id=%module.id, semester=%module.semester, "module created");
    Ok(Json(module))
}

async fn create_lesson(
    State(state): State<AppState>,
    session: Session,
    Json(req): Json<CreateLessonReq>,
) -> Result<Json<Lesson>, EngineError> {
    session.require_admin()?;
    state.store.module(req.module_id).await?;
    if !(0.0..=1.0).contains(&req.unlock_threshold) {
        return Err(EngineError::BadRequest(format!(
            "unlock_threshold must be within 0..=1, got {}",
            req.unlock_threshold
        )));
    }
    let lesson = state.store.insert_lesson(req).await?;
    tracing::info!(lesson_id=%lesson.id, module_id=%lesson.module_id, "lesson created");
    Ok(Json(lesson))
}

// --- progress lifecycle ---

async fn initialize_progress(
    State(state): State<AppState>,
    session: Session,
) -> Result<Json<serde_json::Value>, EngineError> {
    let created = state.store.initialize_user(session.user_id).await?;
    tracing::info!(user_id=%session.user_id, created, "progress records initialized");
    Ok(Json(serde_json::json!({ "created": created })))
}

async fn logout(
    State(state): State<AppState>,
    session: Session,
) -> Result<Json<serde_json::Value>, EngineError> {
    state.store.clear_session_state(session.user_id).await?;
    Ok(Json(serde_json::json!({ "ok": true })))
}

// --- learner views ---

async fn list_modules(
    State(state): State<AppState>,
    session: Session,
    Path(user_id): Path<Uuid>,
) -> Result<Json<Vec<ModuleView>>, EngineError> {
    authorize(&session, user_id)?;
    let gate = ModuleGate::load(state.store.as_ref(), user_id).await?;

    let views = gate
        .modules
        .iter()
        .map(|m| {
            let p = gate.progress.get(&m.id);
            ModuleView {
                id: m.id,
                title: m.title.clone(),
                semester: m.semester.clone(),
                orderindex: m.orderindex,
                progress_percentage: p.map(|p| p.progress_percentage).unwrap_or(0),
                completed_lessons: p.map(|p| p.completed_lessons).unwrap_or(0),
                total_lessons: p.map(|p| p.total_lessons).unwrap_or(0),
                exam_passed: p.and_then(|p| p.exam_passed),
                exam_score: p.and_then(|p| p.exam_score),
                semester_accessible: semester::is_semester_accessible(
                    &m.semester,
                    &gate.semester_completions,
                ),
                unlocked: gate.is_open(m),
            }
        })
        .collect();
    Ok(Json(views))
}

async fn list_lessons(
    State(state): State<AppState>,
    session: Session,
    Path((user_id, module_id)): Path<(Uuid, Uuid)>,
) -> Result<Json<LessonListResp>, EngineError> {
    authorize(&session, user_id)?;
    let module = state.store.module(module_id).await?;
    ensure_module_open(state.store.as_ref(), user_id, &module).await?;

    let lessons = state.store.lessons_for_module(module_id).await?;
    let progress: HashMap<Uuid, LessonProgress> = state
        .store
        .lesson_progress_for_module(user_id, module_id)
        .await?
        .into_iter()
        .map(|p| (p.lesson_id, p))
        .collect();
    let done: HashSet<Uuid> = progress
        .values()
        .filter(|p| p.completed)
        .map(|p| p.lesson_id)
        .collect();

    let views = lessons
        .iter()
        .map(|l| {
            let p = progress.get(&l.id);
            LessonView {
                id: l.id,
                title: l.title.clone(),
                orderindex: l.orderindex,
                video_duration_seconds: l.video_duration_seconds,
                completed: p.map(|p| p.completed).unwrap_or(false),
                video_watched: p.map(|p| p.video_watched).unwrap_or(false),
                score: p.and_then(|p| p.score),
                has_quiz: l.quiz.is_some(),
                unlocked: unlock::is_unlocked(&lessons, &done, l.id),
            }
        })
        .collect();
    Ok(Json(LessonListResp {
        lessons: views,
        next_accessible: unlock::next_accessible(&lessons, &done),
    }))
}

async fn module_eligibility(
    State(state): State<AppState>,
    session: Session,
    Path((user_id, module_id)): Path<(Uuid, Uuid)>,
) -> Result<Json<semester::EnrollmentDecision>, EngineError> {
    authorize(&session, user_id)?;
    let module = state.store.module(module_id).await?;
    let gate = ModuleGate::load(state.store.as_ref(), user_id).await?;

    let prereqs: Vec<(Uuid, Option<i32>)> = module
        .prerequisites
        .iter()
        .map(|id| (*id, gate.percentage(*id)))
        .collect();

    Ok(Json(semester::enrollment_eligibility(
        &module.semester,
        gate.percentage(module_id),
        &prereqs,
        &gate.semester_completions,
    )))
}

async fn semester_overview(
    State(state): State<AppState>,
    session: Session,
    Path(user_id): Path<Uuid>,
) -> Result<Json<SemesterOverview>, EngineError> {
    authorize(&session, user_id)?;
    let gate = ModuleGate::load(state.store.as_ref(), user_id).await?;

    let mut per_semester: HashMap<&str, Vec<Option<i32>>> = HashMap::new();
    for m in &gate.modules {
        per_semester
            .entry(m.semester.as_str())
            .or_default()
            .push(gate.percentage(m.id));
    }

    let semesters = semester::SEMESTER_ORDER
        .into_iter()
        .map(|tag| {
            let pct = per_semester
                .get(tag)
                .map(|mods| semester::completion_percentage(mods))
                .unwrap_or(100);
            SemesterStatus {
                tag,
                name: semester::semester_name(tag),
                completion_percentage: pct,
                completed: gate
                    .semester_completions
                    .get(tag)
                    .copied()
                    .unwrap_or(false),
                accessible: semester::is_semester_accessible(tag, &gate.semester_completions),
            }
        })
        .collect();

    Ok(Json(SemesterOverview {
        semesters,
        highest_accessible: semester::highest_accessible_semester(&gate.semester_completions),
        next_to_unlock: semester::next_semester_to_unlock(&gate.semester_completions),
    }))
}

// --- lesson runtime ---

async fn select_lesson(
    State(state): State<AppState>,
    session: Session,
    Path((user_id, lesson_id)): Path<(Uuid, Uuid)>,
) -> Result<Json<LessonProgress>, EngineError> {
    authorize(&session, user_id)?;
    let lesson = state.store.lesson(lesson_id).await?;
    ensure_lesson_accessible(state.store.as_ref(), user_id, &lesson).await?;
    // First access creates the record.
    let progress = state.store.touch_lesson_progress(user_id, lesson_id).await?;
    Ok(Json(progress))
}

async fn navigate_lessons(
    State(state): State<AppState>,
    session: Session,
    Path((user_id, module_id)): Path<(Uuid, Uuid)>,
    Json(req): Json<NavigateReq>,
) -> Result<Json<unlock::Navigation>, EngineError> {
    authorize(&session, user_id)?;
    let forward = match req.direction.as_str() {
        "next" => true,
        "previous" => false,
        other => {
            return Err(EngineError::BadRequest(format!(
                "unknown direction {other:?}"
            )))
        }
    };
    let lessons = state.store.lessons_for_module(module_id).await?;
    let done = completed_lessons(state.store.as_ref(), user_id, module_id).await?;
    Ok(Json(unlock::step(&lessons, &done, req.current, forward)))
}

async fn playback_tick(
    State(state): State<AppState>,
    session: Session,
    Path((user_id, lesson_id)): Path<(Uuid, Uuid)>,
    Json(req): Json<PlaybackTickReq>,
) -> Result<Json<PlaybackTickResp>, EngineError> {
    authorize(&session, user_id)?;
    let lesson = state.store.lesson(lesson_id).await?;
    ensure_lesson_accessible(state.store.as_ref(), user_id, &lesson).await?;

    let saved = state.store.load_segments(user_id, lesson_id).await?;
    let mut tracker = SegmentTracker::from_saved(lesson.video_duration_seconds, saved);
    tracker.record_playback(req.position_seconds);
    state
        .store
        .save_segments(user_id, lesson_id, tracker.segments())
        .await?;

    // The threshold is the lesson's own, never the caller's.
    let quiz_unlocked = tracker.is_unlock_eligible(lesson.unlock_threshold);
    if quiz_unlocked {
        state.store.mark_video_watched(user_id, lesson_id).await?;
    }

    Ok(Json(PlaybackTickResp {
        total_watched_seconds: tracker.total_watched(),
        quiz_unlocked,
        segments: tracker.segments().to_vec(),
    }))
}

// --- quiz state machine ---

fn quiz_view(quiz: &QuizEvaluator, now: DateTime<Utc>) -> Option<QuestionView> {
    quiz.current_question().map(|q| QuestionView {
        id: q.id,
        question: q.question.clone(),
        options: q.options.clone(),
        number: quiz.question_number(),
        total: quiz.total_questions(),
        seconds_remaining: quiz.seconds_remaining(now),
    })
}

/// Fold a finished attempt into lesson/module progress. Only a pass marks
/// the lesson completed; the stored score is the percentage of correct
/// answers.
async fn settle_quiz_outcome(
    state: &AppState,
    user_id: Uuid,
    module_id: Uuid,
    lesson_id: Uuid,
    outcome: &QuizOutcome,
) -> Result<bool, EngineError> {
    if !outcome.passed {
        return Ok(false);
    }
    let pct = if outcome.total_questions == 0 {
        0
    } else {
        ((outcome.score as f64 / outcome.total_questions as f64) * 100.0).round() as i32
    };
    state.store.complete_lesson(user_id, lesson_id, pct).await?;
    let progress = state
        .store
        .recompute_module_progress(user_id, module_id)
        .await?;
    tracing::info!(
        user_id=%user_id, lesson_id=%lesson_id,
        module_percentage=progress.progress_percentage,
        "lesson completed via quiz"
    );
    Ok(true)
}

async fn quiz_start(
    State(state): State<AppState>,
    session: Session,
    Path((user_id, lesson_id)): Path<(Uuid, Uuid)>,
) -> Result<Json<QuizStateResp>, EngineError> {
    authorize(&session, user_id)?;
    let lesson = state.store.lesson(lesson_id).await?;
    ensure_lesson_accessible(state.store.as_ref(), user_id, &lesson).await?;

    let questions = lesson
        .quiz
        .as_ref()
        .map(|q| q.0.clone())
        .ok_or(EngineError::NotFound("quiz"))?;

    // The quiz stays behind the video gate until enough has been watched.
    let progress = state.store.touch_lesson_progress(user_id, lesson_id).await?;
    if !progress.video_watched {
        return Err(EngineError::Locked(
            "Continue watching to unlock the quiz".into(),
        ));
    }

    let now = Utc::now();
    let quiz = QuizEvaluator::start(lesson_id, questions, now);
    state.store.save_quiz(user_id, &quiz).await?;

    Ok(Json(QuizStateResp {
        phase: quiz.phase(),
        question: quiz_view(&quiz, now),
        outcome: None,
        lesson_completed: false,
    }))
}

async fn quiz_answer(
    State(state): State<AppState>,
    session: Session,
    Path((user_id, lesson_id)): Path<(Uuid, Uuid)>,
    Json(req): Json<QuizAnswerReq>,
) -> Result<Json<QuizStateResp>, EngineError> {
    authorize(&session, user_id)?;
    let mut quiz = state
        .store
        .load_quiz(user_id, lesson_id)
        .await?
        .ok_or(EngineError::NotFound("quiz attempt"))?;

    let now = Utc::now();
    let outcome = quiz.select_option(req.option_index, now);
    state.store.save_quiz(user_id, &quiz).await?;
    finish_quiz_step(&state, user_id, lesson_id, quiz, outcome, now).await
}

async fn quiz_advance(
    State(state): State<AppState>,
    session: Session,
    Path((user_id, lesson_id)): Path<(Uuid, Uuid)>,
) -> Result<Json<QuizStateResp>, EngineError> {
    authorize(&session, user_id)?;
    let mut quiz = state
        .store
        .load_quiz(user_id, lesson_id)
        .await?
        .ok_or(EngineError::NotFound("quiz attempt"))?;

    let now = Utc::now();
    let outcome = quiz.advance(now);
    state.store.save_quiz(user_id, &quiz).await?;
    finish_quiz_step(&state, user_id, lesson_id, quiz, outcome, now).await
}

async fn quiz_retake(
    State(state): State<AppState>,
    session: Session,
    Path((user_id, lesson_id)): Path<(Uuid, Uuid)>,
) -> Result<Json<QuizStateResp>, EngineError> {
    authorize(&session, user_id)?;
    let mut quiz = state
        .store
        .load_quiz(user_id, lesson_id)
        .await?
        .ok_or(EngineError::NotFound("quiz attempt"))?;

    let now = Utc::now();
    quiz.retake(now);
    state.store.save_quiz(user_id, &quiz).await?;

    Ok(Json(QuizStateResp {
        phase: quiz.phase(),
        question: quiz_view(&quiz, now),
        outcome: None,
        lesson_completed: false,
    }))
}

async fn finish_quiz_step(
    state: &AppState,
    user_id: Uuid,
    lesson_id: Uuid,
    quiz: QuizEvaluator,
    outcome: Option<QuizOutcome>,
    now: DateTime<Utc>,
) -> Result<Json<QuizStateResp>, EngineError> {
    let mut lesson_completed = false;
    if let Some(ref outcome) = outcome {
        let lesson = state.store.lesson(lesson_id).await?;
        lesson_completed =
            settle_quiz_outcome(state, user_id, lesson.module_id, lesson_id, outcome).await?;
    }
    Ok(Json(QuizStateResp {
        phase: quiz.phase(),
        question: quiz_view(&quiz, now),
        outcome,
        lesson_completed,
    }))
}

// --- exams ---

/// Question as presented to the learner: prompts and options only, never
/// the expected answers.
#[derive(Serialize, Debug, Clone)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExamQuestionView {
    Mcq {
        id: u32,
        question: String,
        options: Vec<String>,
    },
    TrueFalse {
        id: u32,
        question: String,
    },
    Resolution {
        id: u32,
        question: String,
    },
}

impl From<&crate::exam::ExamQuestion> for ExamQuestionView {
    fn from(q: &crate::exam::ExamQuestion) -> Self {
        use crate::exam::ExamQuestion as Q;
        match q {
            Q::Mcq {
                id,
                question,
                options,
                ..
            } => ExamQuestionView::Mcq {
                id: *id,
                question: question.clone(),
                options: options.clone(),
            },
            Q::TrueFalse { id, question, .. } => ExamQuestionView::TrueFalse {
                id: *id,
                question: question.clone(),
            },
            Q::Resolution { id, question, .. } => ExamQuestionView::Resolution {
                id: *id,
                question: question.clone(),
            },
        }
    }
}

#[derive(Serialize, Debug, Clone)]
pub struct ExamFetchResp {
    pub questions: Vec<ExamQuestionView>,
    pub record: ExamRecord,
}

/// First fetch moves the seeded record from `not_started` to `in_progress`
/// (creating it when initialize never ran).
async fn fetch_exam(
    State(state): State<AppState>,
    session: Session,
    Path((user_id, module_id)): Path<(Uuid, Uuid)>,
) -> Result<Json<ExamFetchResp>, EngineError> {
    authorize(&session, user_id)?;
    let module = state.store.module(module_id).await?;
    ensure_module_open(state.store.as_ref(), user_id, &module).await?;

    let questions = module
        .exam
        .as_ref()
        .map(|q| q.0.iter().map(ExamQuestionView::from).collect())
        .ok_or(EngineError::NotFound("exam"))?;
    let record = state.store.fetch_exam_record(user_id, module_id).await?;

    Ok(Json(ExamFetchResp { questions, record }))
}

async fn exam_submit(
    State(state): State<AppState>,
    session: Session,
    Path((user_id, module_id)): Path<(Uuid, Uuid)>,
    Json(req): Json<ExamSubmitReq>,
) -> Result<Json<ExamSubmitResp>, EngineError> {
    authorize(&session, user_id)?;
    let module = state.store.module(module_id).await?;
    ensure_module_open(state.store.as_ref(), user_id, &module).await?;

    let questions = module
        .exam
        .as_ref()
        .map(|q| q.0.clone())
        .ok_or(EngineError::NotFound("exam"))?;

    let existing = state.store.exam_record(user_id, module_id).await?;
    if let Some(existing) = existing {
        // Replayed submission (same idempotency key) or an already-passed
        // exam: return the stored result without rescoring.
        let replay_key = req.idempotency_key.is_some()
            && existing.idempotency_key == req.idempotency_key;
        if replay_key || existing.status == "passed" {
            return Ok(Json(ExamSubmitResp {
                replayed: true,
                record: existing,
            }));
        }
    }

    let result = score_exam(
        &questions,
        &req.answers,
        state.similarity.as_ref(),
        Utc::now(),
    )
    .await;

    let record = state
        .store
        .record_exam(
            user_id,
            module_id,
            &result,
            req.idempotency_key,
            req.time_spent_seconds,
        )
        .await?;

    match record {
        Some(record) => {
            tracing::info!(
                user_id=%user_id, module_id=%module_id,
                grade=result.final_grade_20, status=result.status.as_str(),
                "exam scored"
            );
            Ok(Json(ExamSubmitResp {
                replayed: false,
                record,
            }))
        }
        // A concurrent submit passed the exam between the read above and the
        // write: surface the stored pass.
        None => {
            let record = state
                .store
                .exam_record(user_id, module_id)
                .await?
                .ok_or(EngineError::NotFound("exam record"))?;
            Ok(Json(ExamSubmitResp {
                replayed: true,
                record,
            }))
        }
    }
}

// --- admin ---

async fn admin_unlock_module(
    State(state): State<AppState>,
    session: Session,
    Path((user_id, module_id)): Path<(Uuid, Uuid)>,
) -> Result<Json<ModuleProgress>, EngineError> {
    session.require_admin()?;
    state.store.module(module_id).await?;
    let progress = state.store.unlock_module(user_id, module_id).await?;
    tracing::info!(user_id=%user_id, module_id=%module_id, "module unlocked by admin");
    Ok(Json(progress))
}
