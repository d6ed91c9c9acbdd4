use async_trait::async_trait;
use chrono::Utc;
use sqlx::types::Json;
use sqlx::{query, query_as, query_scalar};
use uuid::Uuid;

use crate::db::Db;
use crate::error::EngineError;
use crate::exam::{ExamResult, ExamStatus};
use crate::models::*;
use crate::quiz::QuizEvaluator;
use crate::segments::WatchSegment;

/// The one durable store for progression state, injected into every handler.
/// Replaces the scattered browser-storage globals of the old client: load on
/// demand, flush on every mutation, clear transient state on logout.
///
/// Handlers only ever see this trait; tests swap in [`memory::MemoryStore`].
#[async_trait]
pub trait ProgressStore: Send + Sync {
    // catalog
    async fn insert_module(&self, req: CreateModuleReq) -> Result<Module, EngineError>;
    async fn insert_lesson(&self, req: CreateLessonReq) -> Result<Lesson, EngineError>;
    async fn modules(&self) -> Result<Vec<Module>, EngineError>;
    async fn module(&self, id: Uuid) -> Result<Module, EngineError>;
    async fn lesson(&self, id: Uuid) -> Result<Lesson, EngineError>;
    async fn lessons_for_module(&self, module_id: Uuid) -> Result<Vec<Lesson>, EngineError>;

    // progress records
    async fn initialize_user(&self, user_id: Uuid) -> Result<u64, EngineError>;
    async fn module_progress_for_user(
        &self,
        user_id: Uuid,
    ) -> Result<Vec<ModuleProgress>, EngineError>;
    async fn lesson_progress_for_module(
        &self,
        user_id: Uuid,
        module_id: Uuid,
    ) -> Result<Vec<LessonProgress>, EngineError>;
    async fn touch_lesson_progress(
        &self,
        user_id: Uuid,
        lesson_id: Uuid,
    ) -> Result<LessonProgress, EngineError>;
    async fn mark_video_watched(&self, user_id: Uuid, lesson_id: Uuid)
        -> Result<(), EngineError>;
    async fn complete_lesson(
        &self,
        user_id: Uuid,
        lesson_id: Uuid,
        score: i32,
    ) -> Result<LessonProgress, EngineError>;
    async fn recompute_module_progress(
        &self,
        user_id: Uuid,
        module_id: Uuid,
    ) -> Result<ModuleProgress, EngineError>;
    async fn unlock_module(
        &self,
        user_id: Uuid,
        module_id: Uuid,
    ) -> Result<ModuleProgress, EngineError>;

    // watched segments
    async fn load_segments(
        &self,
        user_id: Uuid,
        lesson_id: Uuid,
    ) -> Result<Vec<WatchSegment>, EngineError>;
    async fn save_segments(
        &self,
        user_id: Uuid,
        lesson_id: Uuid,
        segments: &[WatchSegment],
    ) -> Result<(), EngineError>;

    // quiz attempts
    async fn load_quiz(
        &self,
        user_id: Uuid,
        lesson_id: Uuid,
    ) -> Result<Option<QuizEvaluator>, EngineError>;
    async fn save_quiz(&self, user_id: Uuid, quiz: &QuizEvaluator) -> Result<(), EngineError>;
    async fn clear_session_state(&self, user_id: Uuid) -> Result<(), EngineError>;

    // exam records
    async fn fetch_exam_record(
        &self,
        user_id: Uuid,
        module_id: Uuid,
    ) -> Result<ExamRecord, EngineError>;
    async fn exam_record(
        &self,
        user_id: Uuid,
        module_id: Uuid,
    ) -> Result<Option<ExamRecord>, EngineError>;
    async fn record_exam(
        &self,
        user_id: Uuid,
        module_id: Uuid,
        result: &ExamResult,
        idempotency_key: Option<Uuid>,
        time_spent_seconds: Option<i64>,
    ) -> Result<Option<ExamRecord>, EngineError>;
}

/// Postgres-backed store.
#[derive(Clone)]
pub struct PgStore {
    db: Db,
}

impl PgStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }
}

#[async_trait]
impl ProgressStore for PgStore {
    // --- catalog ---

    async fn insert_module(&self, req: CreateModuleReq) -> Result<Module, EngineError> {
        let module = query_as::<_, Module>(
            r#"
            INSERT INTO modules (id, title, semester, orderindex, prerequisites, exam)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(req.title)
        .bind(req.semester)
        .bind(req.orderindex)
        .bind(req.prerequisites)
        .bind(req.exam.map(Json))
        .fetch_one(&self.db)
        .await?;
        Ok(module)
    }

    async fn insert_lesson(&self, req: CreateLessonReq) -> Result<Lesson, EngineError> {
        let lesson = query_as::<_, Lesson>(
            r#"
            INSERT INTO lessons
                (id, module_id, title, orderindex, video_duration_seconds,
                 unlock_threshold, quiz)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(req.module_id)
        .bind(req.title)
        .bind(req.orderindex)
        .bind(req.video_duration_seconds)
        .bind(req.unlock_threshold)
        .bind(req.quiz.map(Json))
        .fetch_one(&self.db)
        .await?;
        Ok(lesson)
    }

    async fn modules(&self) -> Result<Vec<Module>, EngineError> {
        Ok(
            query_as::<_, Module>("SELECT * FROM modules ORDER BY semester, orderindex")
                .fetch_all(&self.db)
                .await?,
        )
    }

    async fn module(&self, id: Uuid) -> Result<Module, EngineError> {
        query_as::<_, Module>("SELECT * FROM modules WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.db)
            .await?
            .ok_or(EngineError::NotFound("module"))
    }

    async fn lesson(&self, id: Uuid) -> Result<Lesson, EngineError> {
        query_as::<_, Lesson>("SELECT * FROM lessons WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.db)
            .await?
            .ok_or(EngineError::NotFound("lesson"))
    }

    async fn lessons_for_module(&self, module_id: Uuid) -> Result<Vec<Lesson>, EngineError> {
        Ok(query_as::<_, Lesson>(
            "SELECT * FROM lessons WHERE module_id = $1 ORDER BY orderindex",
        )
        .bind(module_id)
        .fetch_all(&self.db)
        .await?)
    }

    // --- progress records ---

    /// Create module-progress rows for every module the user does not have
    /// one for yet, and `not_started` exam records for modules that carry an
    /// exam. Called on first login; replaying it is harmless.
    async fn initialize_user(&self, user_id: Uuid) -> Result<u64, EngineError> {
        let result = query(
            r#"
            INSERT INTO module_progress (id, user_id, module_id, total_lessons)
            SELECT gen_random_uuid(), $1, m.id,
                   (SELECT count(*) FROM lessons l WHERE l.module_id = m.id)
            FROM modules m
            ON CONFLICT (user_id, module_id) DO NOTHING
            "#,
        )
        .bind(user_id)
        .execute(&self.db)
        .await?;

        query(
            r#"
            INSERT INTO exam_records (id, user_id, module_id)
            SELECT gen_random_uuid(), $1, m.id FROM modules m
            WHERE m.exam IS NOT NULL
            ON CONFLICT (user_id, module_id) DO NOTHING
            "#,
        )
        .bind(user_id)
        .execute(&self.db)
        .await?;

        Ok(result.rows_affected())
    }

    async fn module_progress_for_user(
        &self,
        user_id: Uuid,
    ) -> Result<Vec<ModuleProgress>, EngineError> {
        Ok(query_as::<_, ModuleProgress>(
            "SELECT * FROM module_progress WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_all(&self.db)
        .await?)
    }

    async fn lesson_progress_for_module(
        &self,
        user_id: Uuid,
        module_id: Uuid,
    ) -> Result<Vec<LessonProgress>, EngineError> {
        Ok(query_as::<_, LessonProgress>(
            r#"
            SELECT p.* FROM lesson_progress p
            JOIN lessons l ON l.id = p.lesson_id
            WHERE p.user_id = $1 AND l.module_id = $2
            "#,
        )
        .bind(user_id)
        .bind(module_id)
        .fetch_all(&self.db)
        .await?)
    }

    /// Lazily create the per-(user, lesson) record on first access.
    async fn touch_lesson_progress(
        &self,
        user_id: Uuid,
        lesson_id: Uuid,
    ) -> Result<LessonProgress, EngineError> {
        Ok(query_as::<_, LessonProgress>(
            r#"
            INSERT INTO lesson_progress (user_id, lesson_id)
            VALUES ($1, $2)
            ON CONFLICT (user_id, lesson_id) DO UPDATE SET updated_at = now()
            RETURNING *
            "#,
        )
        .bind(user_id)
        .bind(lesson_id)
        .fetch_one(&self.db)
        .await?)
    }

    async fn mark_video_watched(
        &self,
        user_id: Uuid,
        lesson_id: Uuid,
    ) -> Result<(), EngineError> {
        query(
            r#"
            INSERT INTO lesson_progress (user_id, lesson_id, video_watched)
            VALUES ($1, $2, TRUE)
            ON CONFLICT (user_id, lesson_id)
            DO UPDATE SET video_watched = TRUE, updated_at = now()
            "#,
        )
        .bind(user_id)
        .bind(lesson_id)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    /// Idempotent upsert: a lesson, once completed, stays completed, and the
    /// stored score only ever goes up.
    async fn complete_lesson(
        &self,
        user_id: Uuid,
        lesson_id: Uuid,
        score: i32,
    ) -> Result<LessonProgress, EngineError> {
        Ok(query_as::<_, LessonProgress>(
            r#"
            INSERT INTO lesson_progress (user_id, lesson_id, completed, score)
            VALUES ($1, $2, TRUE, $3)
            ON CONFLICT (user_id, lesson_id)
            DO UPDATE SET completed = TRUE,
                          score = GREATEST(COALESCE(lesson_progress.score, 0), EXCLUDED.score),
                          updated_at = now()
            RETURNING *
            "#,
        )
        .bind(user_id)
        .bind(lesson_id)
        .bind(score)
        .fetch_one(&self.db)
        .await?)
    }

    /// Recompute a module's aggregate counters from its lesson records.
    async fn recompute_module_progress(
        &self,
        user_id: Uuid,
        module_id: Uuid,
    ) -> Result<ModuleProgress, EngineError> {
        let total: i64 = query_scalar("SELECT count(*) FROM lessons WHERE module_id = $1")
            .bind(module_id)
            .fetch_one(&self.db)
            .await?;
        let completed: i64 = query_scalar(
            r#"
            SELECT count(*) FROM lesson_progress p
            JOIN lessons l ON l.id = p.lesson_id
            WHERE p.user_id = $1 AND l.module_id = $2 AND p.completed
            "#,
        )
        .bind(user_id)
        .bind(module_id)
        .fetch_one(&self.db)
        .await?;

        let percentage = aggregate_percentage(completed, total);

        Ok(query_as::<_, ModuleProgress>(
            r#"
            INSERT INTO module_progress
                (id, user_id, module_id, progress_percentage, completed_lessons, total_lessons)
            VALUES (gen_random_uuid(), $1, $2, $3, $4, $5)
            ON CONFLICT (user_id, module_id)
            DO UPDATE SET progress_percentage = EXCLUDED.progress_percentage,
                          completed_lessons = EXCLUDED.completed_lessons,
                          total_lessons = EXCLUDED.total_lessons,
                          updated_at = now()
            RETURNING *
            "#,
        )
        .bind(user_id)
        .bind(module_id)
        .bind(percentage)
        .bind(completed as i32)
        .bind(total as i32)
        .fetch_one(&self.db)
        .await?)
    }

    /// Admin override: force a module open regardless of ordering.
    async fn unlock_module(
        &self,
        user_id: Uuid,
        module_id: Uuid,
    ) -> Result<ModuleProgress, EngineError> {
        Ok(query_as::<_, ModuleProgress>(
            r#"
            INSERT INTO module_progress (id, user_id, module_id, is_module_unlocked)
            VALUES (gen_random_uuid(), $1, $2, TRUE)
            ON CONFLICT (user_id, module_id)
            DO UPDATE SET is_module_unlocked = TRUE, updated_at = now()
            RETURNING *
            "#,
        )
        .bind(user_id)
        .bind(module_id)
        .fetch_one(&self.db)
        .await?)
    }

    // --- watched segments ---

    async fn load_segments(
        &self,
        user_id: Uuid,
        lesson_id: Uuid,
    ) -> Result<Vec<WatchSegment>, EngineError> {
        let saved: Option<Json<Vec<WatchSegment>>> = query_scalar(
            "SELECT segments FROM watch_segments WHERE user_id = $1 AND lesson_id = $2",
        )
        .bind(user_id)
        .bind(lesson_id)
        .fetch_optional(&self.db)
        .await?;
        Ok(saved.map(|j| j.0).unwrap_or_default())
    }

    async fn save_segments(
        &self,
        user_id: Uuid,
        lesson_id: Uuid,
        segments: &[WatchSegment],
    ) -> Result<(), EngineError> {
        query(
            r#"
            INSERT INTO watch_segments (user_id, lesson_id, segments)
            VALUES ($1, $2, $3)
            ON CONFLICT (user_id, lesson_id)
            DO UPDATE SET segments = EXCLUDED.segments, updated_at = now()
            "#,
        )
        .bind(user_id)
        .bind(lesson_id)
        .bind(Json(segments))
        .execute(&self.db)
        .await?;
        Ok(())
    }

    // --- quiz attempts ---

    async fn load_quiz(
        &self,
        user_id: Uuid,
        lesson_id: Uuid,
    ) -> Result<Option<QuizEvaluator>, EngineError> {
        let state: Option<Json<QuizEvaluator>> = query_scalar(
            "SELECT state FROM quiz_attempts WHERE user_id = $1 AND lesson_id = $2",
        )
        .bind(user_id)
        .bind(lesson_id)
        .fetch_optional(&self.db)
        .await?;
        Ok(state.map(|j| j.0))
    }

    async fn save_quiz(&self, user_id: Uuid, quiz: &QuizEvaluator) -> Result<(), EngineError> {
        query(
            r#"
            INSERT INTO quiz_attempts (user_id, lesson_id, state)
            VALUES ($1, $2, $3)
            ON CONFLICT (user_id, lesson_id)
            DO UPDATE SET state = EXCLUDED.state, updated_at = now()
            "#,
        )
        .bind(user_id)
        .bind(quiz.lesson_id)
        .bind(Json(quiz))
        .execute(&self.db)
        .await?;
        Ok(())
    }

    /// Drop transient session state on logout. Durable progress (segments,
    /// completions, exam records) stays.
    async fn clear_session_state(&self, user_id: Uuid) -> Result<(), EngineError> {
        query("DELETE FROM quiz_attempts WHERE user_id = $1")
            .bind(user_id)
            .execute(&self.db)
            .await?;
        Ok(())
    }

    // --- exam records ---

    /// The exam record, moved to `in_progress` the first time the exam is
    /// fetched (creating it if initialize never seeded one).
    async fn fetch_exam_record(
        &self,
        user_id: Uuid,
        module_id: Uuid,
    ) -> Result<ExamRecord, EngineError> {
        Ok(query_as::<_, ExamRecord>(
            r#"
            INSERT INTO exam_records (id, user_id, module_id, status)
            VALUES ($1, $2, $3, 'in_progress')
            ON CONFLICT (user_id, module_id) DO UPDATE SET
                status = CASE WHEN exam_records.status = 'not_started'
                              THEN 'in_progress'
                              ELSE exam_records.status END
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(user_id)
        .bind(module_id)
        .fetch_one(&self.db)
        .await?)
    }

    async fn exam_record(
        &self,
        user_id: Uuid,
        module_id: Uuid,
    ) -> Result<Option<ExamRecord>, EngineError> {
        Ok(query_as::<_, ExamRecord>(
            "SELECT * FROM exam_records WHERE user_id = $1 AND module_id = $2",
        )
        .bind(user_id)
        .bind(module_id)
        .fetch_optional(&self.db)
        .await?)
    }

    /// Persist a scored submission onto the exam record and fold it into the
    /// module record. The `status != 'passed'` guard makes a passed record
    /// immutable even under a racing duplicate submit; `None` means the
    /// write was refused. Module-level exam fields only ever upgrade: a
    /// later lower-scoring attempt never overwrites a pass.
    async fn record_exam(
        &self,
        user_id: Uuid,
        module_id: Uuid,
        result: &ExamResult,
        idempotency_key: Option<Uuid>,
        time_spent_seconds: Option<i64>,
    ) -> Result<Option<ExamRecord>, EngineError> {
        let answers = serde_json::to_value(&result.answers)
            .map_err(|e| EngineError::BadRequest(e.to_string()))?;

        let record = query_as::<_, ExamRecord>(
            r#"
            INSERT INTO exam_records
                (id, user_id, module_id, score, correct_count, status, attempt_number,
                 answers, idempotency_key, time_spent_seconds, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, 1, $7, $8, $9, $10)
            ON CONFLICT (user_id, module_id) DO UPDATE SET
                score = EXCLUDED.score,
                correct_count = EXCLUDED.correct_count,
                status = EXCLUDED.status,
                attempt_number = exam_records.attempt_number + 1,
                answers = EXCLUDED.answers,
                idempotency_key = EXCLUDED.idempotency_key,
                time_spent_seconds = EXCLUDED.time_spent_seconds
            WHERE exam_records.status != 'passed'
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(user_id)
        .bind(module_id)
        .bind(result.final_grade_20 as i32)
        .bind(result.correct_count as i32)
        .bind(result.status.as_str())
        .bind(Json(answers))
        .bind(idempotency_key)
        .bind(time_spent_seconds)
        .bind(Utc::now())
        .fetch_optional(&self.db)
        .await?;

        let Some(record) = record else {
            return Ok(None);
        };

        let passed = result.status == ExamStatus::Passed;
        query(
            r#"
            INSERT INTO module_progress (id, user_id, module_id, exam_passed, exam_score)
            VALUES (gen_random_uuid(), $1, $2, $3, $4)
            ON CONFLICT (user_id, module_id)
            DO UPDATE SET
                exam_passed = COALESCE(module_progress.exam_passed, FALSE) OR EXCLUDED.exam_passed,
                exam_score = GREATEST(COALESCE(module_progress.exam_score, 0), EXCLUDED.exam_score),
                updated_at = now()
            "#,
        )
        .bind(user_id)
        .bind(module_id)
        .bind(passed)
        .bind(result.final_grade_20 as i32)
        .execute(&self.db)
        .await?;

        Ok(Some(record))
    }
}

fn aggregate_percentage(completed: i64, total: i64) -> i32 {
    if total == 0 {
        0
    } else {
        ((completed as f64 / total as f64) * 100.0).round() as i32
    }
}

/// In-memory [`ProgressStore`] mirroring the Postgres upsert semantics,
/// for handler-level tests.
#[cfg(test)]
pub(crate) mod memory {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    struct Inner {
        modules: Vec<Module>,
        lessons: Vec<Lesson>,
        lesson_progress: HashMap<(Uuid, Uuid), LessonProgress>,
        module_progress: HashMap<(Uuid, Uuid), ModuleProgress>,
        segments: HashMap<(Uuid, Uuid), Vec<WatchSegment>>,
        quizzes: HashMap<(Uuid, Uuid), QuizEvaluator>,
        exams: HashMap<(Uuid, Uuid), ExamRecord>,
    }

    #[derive(Default)]
    pub struct MemoryStore {
        inner: Mutex<Inner>,
    }

    fn blank_lesson_progress(user_id: Uuid, lesson_id: Uuid) -> LessonProgress {
        LessonProgress {
            user_id,
            lesson_id,
            completed: false,
            score: None,
            video_watched: false,
            updated_at: Utc::now(),
        }
    }

    fn blank_module_progress(user_id: Uuid, module_id: Uuid, total_lessons: i32) -> ModuleProgress {
        ModuleProgress {
            id: Uuid::new_v4(),
            user_id,
            module_id,
            is_module_unlocked: false,
            progress_percentage: 0,
            completed_lessons: 0,
            total_lessons,
            exam_passed: None,
            exam_score: None,
            updated_at: Utc::now(),
        }
    }

    fn blank_exam_record(user_id: Uuid, module_id: Uuid, status: &str) -> ExamRecord {
        ExamRecord {
            id: Uuid::new_v4(),
            user_id,
            module_id,
            score: 0,
            correct_count: 0,
            status: status.to_string(),
            attempt_number: 0,
            answers: Json(serde_json::json!([])),
            idempotency_key: None,
            time_spent_seconds: None,
            created_at: Utc::now(),
        }
    }

    #[async_trait]
    impl ProgressStore for MemoryStore {
        async fn insert_module(&self, req: CreateModuleReq) -> Result<Module, EngineError> {
            let module = Module {
                id: Uuid::new_v4(),
                title: req.title,
                semester: req.semester,
                orderindex: req.orderindex,
                prerequisites: req.prerequisites,
                exam: req.exam.map(Json),
                created_at: Utc::now(),
            };
            self.inner.lock().unwrap().modules.push(module.clone());
            Ok(module)
        }

        async fn insert_lesson(&self, req: CreateLessonReq) -> Result<Lesson, EngineError> {
            let lesson = Lesson {
                id: Uuid::new_v4(),
                module_id: req.module_id,
                title: req.title,
                orderindex: req.orderindex,
                video_duration_seconds: req.video_duration_seconds,
                unlock_threshold: req.unlock_threshold,
                quiz: req.quiz.map(Json),
                created_at: Utc::now(),
            };
            self.inner.lock().unwrap().lessons.push(lesson.clone());
            Ok(lesson)
        }

        async fn modules(&self) -> Result<Vec<Module>, EngineError> {
            let mut modules = self.inner.lock().unwrap().modules.clone();
            modules.sort_by(|a, b| {
                (a.semester.as_str(), a.orderindex).cmp(&(b.semester.as_str(), b.orderindex))
            });
            Ok(modules)
        }

        async fn module(&self, id: Uuid) -> Result<Module, EngineError> {
            self.inner
                .lock()
                .unwrap()
                .modules
                .iter()
                .find(|m| m.id == id)
                .cloned()
                .ok_or(EngineError::NotFound("module"))
        }

        async fn lesson(&self, id: Uuid) -> Result<Lesson, EngineError> {
            self.inner
                .lock()
                .unwrap()
                .lessons
                .iter()
                .find(|l| l.id == id)
                .cloned()
                .ok_or(EngineError::NotFound("lesson"))
        }

        async fn lessons_for_module(&self, module_id: Uuid) -> Result<Vec<Lesson>, EngineError> {
            let mut lessons: Vec<Lesson> = self
                .inner
                .lock()
                .unwrap()
                .lessons
                .iter()
                .filter(|l| l.module_id == module_id)
                .cloned()
                .collect();
            lessons.sort_by_key(|l| l.orderindex);
            Ok(lessons)
        }

        async fn initialize_user(&self, user_id: Uuid) -> Result<u64, EngineError> {
            let mut inner = self.inner.lock().unwrap();
            let mut created = 0u64;
            let modules = inner.modules.clone();
            for m in &modules {
                let total = inner
                    .lessons
                    .iter()
                    .filter(|l| l.module_id == m.id)
                    .count() as i32;
                if !inner.module_progress.contains_key(&(user_id, m.id)) {
                    inner
                        .module_progress
                        .insert((user_id, m.id), blank_module_progress(user_id, m.id, total));
                    created += 1;
                }
                if m.exam.is_some() && !inner.exams.contains_key(&(user_id, m.id)) {
                    inner.exams.insert(
                        (user_id, m.id),
                        blank_exam_record(user_id, m.id, "not_started"),
                    );
                }
            }
            Ok(created)
        }

        async fn module_progress_for_user(
            &self,
            user_id: Uuid,
        ) -> Result<Vec<ModuleProgress>, EngineError> {
            Ok(self
                .inner
                .lock()
                .unwrap()
                .module_progress
                .values()
                .filter(|p| p.user_id == user_id)
                .cloned()
                .collect())
        }

        async fn lesson_progress_for_module(
            &self,
            user_id: Uuid,
            module_id: Uuid,
        ) -> Result<Vec<LessonProgress>, EngineError> {
            let inner = self.inner.lock().unwrap();
            Ok(inner
                .lesson_progress
                .values()
                .filter(|p| {
                    p.user_id == user_id
                        && inner
                            .lessons
                            .iter()
                            .any(|l| l.id == p.lesson_id && l.module_id == module_id)
                })
                .cloned()
                .collect())
        }

        async fn touch_lesson_progress(
            &self,
            user_id: Uuid,
            lesson_id: Uuid,
        ) -> Result<LessonProgress, EngineError> {
            let mut inner = self.inner.lock().unwrap();
            let progress = inner
                .lesson_progress
                .entry((user_id, lesson_id))
                .or_insert_with(|| blank_lesson_progress(user_id, lesson_id));
            progress.updated_at = Utc::now();
            Ok(progress.clone())
        }

        async fn mark_video_watched(
            &self,
            user_id: Uuid,
            lesson_id: Uuid,
        ) -> Result<(), EngineError> {
            let mut inner = self.inner.lock().unwrap();
            let progress = inner
                .lesson_progress
                .entry((user_id, lesson_id))
                .or_insert_with(|| blank_lesson_progress(user_id, lesson_id));
            progress.video_watched = true;
            progress.updated_at = Utc::now();
            Ok(())
        }

        async fn complete_lesson(
            &self,
            user_id: Uuid,
            lesson_id: Uuid,
            score: i32,
        ) -> Result<LessonProgress, EngineError> {
            let mut inner = self.inner.lock().unwrap();
            let progress = inner
                .lesson_progress
                .entry((user_id, lesson_id))
                .or_insert_with(|| blank_lesson_progress(user_id, lesson_id));
            progress.completed = true;
            progress.score = Some(progress.score.unwrap_or(0).max(score));
            progress.updated_at = Utc::now();
            Ok(progress.clone())
        }

        async fn recompute_module_progress(
            &self,
            user_id: Uuid,
            module_id: Uuid,
        ) -> Result<ModuleProgress, EngineError> {
            let mut inner = self.inner.lock().unwrap();
            let lesson_ids: Vec<Uuid> = inner
                .lessons
                .iter()
                .filter(|l| l.module_id == module_id)
                .map(|l| l.id)
                .collect();
            let total = lesson_ids.len() as i64;
            let completed = lesson_ids
                .iter()
                .filter(|id| {
                    inner
                        .lesson_progress
                        .get(&(user_id, **id))
                        .is_some_and(|p| p.completed)
                })
                .count() as i64;

            let progress = inner
                .module_progress
                .entry((user_id, module_id))
                .or_insert_with(|| blank_module_progress(user_id, module_id, total as i32));
            progress.progress_percentage = aggregate_percentage(completed, total);
            progress.completed_lessons = completed as i32;
            progress.total_lessons = total as i32;
            progress.updated_at = Utc::now();
            Ok(progress.clone())
        }

        async fn unlock_module(
            &self,
            user_id: Uuid,
            module_id: Uuid,
        ) -> Result<ModuleProgress, EngineError> {
            let mut inner = self.inner.lock().unwrap();
            let progress = inner
                .module_progress
                .entry((user_id, module_id))
                .or_insert_with(|| blank_module_progress(user_id, module_id, 0));
            progress.is_module_unlocked = true;
            progress.updated_at = Utc::now();
            Ok(progress.clone())
        }

        async fn load_segments(
            &self,
            user_id: Uuid,
            lesson_id: Uuid,
        ) -> Result<Vec<WatchSegment>, EngineError> {
            Ok(self
                .inner
                .lock()
                .unwrap()
                .segments
                .get(&(user_id, lesson_id))
                .cloned()
                .unwrap_or_default())
        }

        async fn save_segments(
            &self,
            user_id: Uuid,
            lesson_id: Uuid,
            segments: &[WatchSegment],
        ) -> Result<(), EngineError> {
            self.inner
                .lock()
                .unwrap()
                .segments
                .insert((user_id, lesson_id), segments.to_vec());
            Ok(())
        }

        async fn load_quiz(
            &self,
            user_id: Uuid,
            lesson_id: Uuid,
        ) -> Result<Option<QuizEvaluator>, EngineError> {
            Ok(self
                .inner
                .lock()
                .unwrap()
                .quizzes
                .get(&(user_id, lesson_id))
                .cloned())
        }

        async fn save_quiz(&self, user_id: Uuid, quiz: &QuizEvaluator) -> Result<(), EngineError> {
            self.inner
                .lock()
                .unwrap()
                .quizzes
                .insert((user_id, quiz.lesson_id), quiz.clone());
            Ok(())
        }

        async fn clear_session_state(&self, user_id: Uuid) -> Result<(), EngineError> {
            self.inner
                .lock()
                .unwrap()
                .quizzes
                .retain(|(uid, _), _| *uid != user_id);
            Ok(())
        }

        async fn fetch_exam_record(
            &self,
            user_id: Uuid,
            module_id: Uuid,
        ) -> Result<ExamRecord, EngineError> {
            let mut inner = self.inner.lock().unwrap();
            let record = inner
                .exams
                .entry((user_id, module_id))
                .or_insert_with(|| blank_exam_record(user_id, module_id, "in_progress"));
            if record.status == "not_started" {
                record.status = "in_progress".to_string();
            }
            Ok(record.clone())
        }

        async fn exam_record(
            &self,
            user_id: Uuid,
            module_id: Uuid,
        ) -> Result<Option<ExamRecord>, EngineError> {
            Ok(self
                .inner
                .lock()
                .unwrap()
                .exams
                .get(&(user_id, module_id))
                .cloned())
        }

        async fn record_exam(
            &self,
            user_id: Uuid,
            module_id: Uuid,
            result: &ExamResult,
            idempotency_key: Option<Uuid>,
            time_spent_seconds: Option<i64>,
        ) -> Result<Option<ExamRecord>, EngineError> {
            let answers = serde_json::to_value(&result.answers)
                .map_err(|e| EngineError::BadRequest(e.to_string()))?;

            let mut inner = self.inner.lock().unwrap();
            let record = inner
                .exams
                .entry((user_id, module_id))
                .or_insert_with(|| blank_exam_record(user_id, module_id, "in_progress"));
            if record.status == "passed" {
                return Ok(None);
            }
            record.score = result.final_grade_20 as i32;
            record.correct_count = result.correct_count as i32;
            record.status = result.status.as_str().to_string();
            record.attempt_number += 1;
            record.answers = Json(answers);
            record.idempotency_key = idempotency_key;
            record.time_spent_seconds = time_spent_seconds;
            let record = record.clone();

            let passed = result.status == ExamStatus::Passed;
            let progress = inner
                .module_progress
                .entry((user_id, module_id))
                .or_insert_with(|| blank_module_progress(user_id, module_id, 0));
            progress.exam_passed = Some(progress.exam_passed.unwrap_or(false) || passed);
            progress.exam_score = Some(
                progress
                    .exam_score
                    .unwrap_or(0)
                    .max(result.final_grade_20 as i32),
            );
            progress.updated_at = Utc::now();

            Ok(Some(record))
        }
    }
}
