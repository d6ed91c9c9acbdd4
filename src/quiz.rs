use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Fixed per-question countdown.
pub const QUESTION_SECONDS: i64 = 15;

/// Correct answers needed to pass. Fixed at 3 regardless of question count;
/// kept as-is pending product clarification.
pub const PASS_THRESHOLD: u32 = 3;

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct QuizQuestion {
    pub id: u32,
    pub question: String,
    pub options: Vec<String>,
    pub answer_index: usize,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum QuizPhase {
    AwaitingAnswer,
    AwaitingConfirm,
    Finished,
}

/// Completion event emitted when an attempt reaches `Finished`. The unlock
/// rules consume this to mark the lesson completed.
#[derive(Serialize, Deserialize, Debug, Clone, Copy)]
pub struct QuizOutcome {
    pub score: u32,
    pub total_questions: u32,
    pub passed: bool,
}

/// One timed quiz attempt, driven by discrete events (select, advance,
/// countdown expiry). Serialized whole so an in-flight attempt survives a
/// reload.
///
/// The countdown is a deadline stamped when a question is presented; any
/// event arriving after it behaves as the automatic no-answer advance.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct QuizEvaluator {
    pub lesson_id: Uuid,
    questions: Vec<QuizQuestion>,
    phase: QuizPhase,
    current: usize,
    selected: Option<usize>,
    score: u32,
    asked_at: DateTime<Utc>,
}

impl QuizEvaluator {
    pub fn start(lesson_id: Uuid, questions: Vec<QuizQuestion>, now: DateTime<Utc>) -> Self {
        Self {
            lesson_id,
            questions,
            phase: QuizPhase::AwaitingAnswer,
            current: 0,
            selected: None,
            score: 0,
            asked_at: now,
        }
    }

    pub fn phase(&self) -> QuizPhase {
        self.phase
    }

    pub fn score(&self) -> u32 {
        self.score
    }

    pub fn current_question(&self) -> Option<&QuizQuestion> {
        self.questions.get(self.current)
    }

    /// 1-based number of the question being presented.
    pub fn question_number(&self) -> usize {
        (self.current + 1).min(self.questions.len())
    }

    pub fn total_questions(&self) -> usize {
        self.questions.len()
    }

    pub fn seconds_remaining(&self, now: DateTime<Utc>) -> i64 {
        (self.asked_at + Duration::seconds(QUESTION_SECONDS) - now)
            .num_seconds()
            .max(0)
    }

    fn deadline_passed(&self, now: DateTime<Utc>) -> bool {
        now >= self.asked_at + Duration::seconds(QUESTION_SECONDS)
    }

    /// Apply countdown expiry if due: the current question advances with no
    /// credit, whether or not an option was selected.
    pub fn expire_if_due(&mut self, now: DateTime<Utc>) -> Option<QuizOutcome> {
        if self.phase == QuizPhase::Finished || !self.deadline_passed(now) {
            return None;
        }
        self.step(false, now)
    }

    /// Select an option for the current question. Selecting is only scored
    /// once the attempt is advanced; re-selecting before advancing replaces
    /// the earlier choice.
    pub fn select_option(&mut self, option_index: usize, now: DateTime<Utc>) -> Option<QuizOutcome> {
        if let Some(outcome) = self.expire_if_due(now) {
            return Some(outcome);
        }
        if self.phase == QuizPhase::Finished {
            return None;
        }
        if let Some(q) = self.current_question() {
            if option_index < q.options.len() {
                self.selected = Some(option_index);
                self.phase = QuizPhase::AwaitingConfirm;
            }
        }
        None
    }

    /// Confirm the selected option and move on. Rejected (no-op) while no
    /// option is selected, matching the disabled Next button.
    pub fn advance(&mut self, now: DateTime<Utc>) -> Option<QuizOutcome> {
        if let Some(outcome) = self.expire_if_due(now) {
            return Some(outcome);
        }
        if self.phase != QuizPhase::AwaitingConfirm {
            return None;
        }
        let correct = matches!(
            (self.selected, self.current_question()),
            (Some(sel), Some(q)) if sel == q.answer_index
        );
        self.step(correct, now)
    }

    fn step(&mut self, correct: bool, now: DateTime<Utc>) -> Option<QuizOutcome> {
        if correct {
            self.score += 1;
        }
        self.selected = None;
        self.current += 1;
        if self.current < self.questions.len() {
            self.phase = QuizPhase::AwaitingAnswer;
            self.asked_at = now;
            None
        } else {
            self.phase = QuizPhase::Finished;
            Some(self.outcome())
        }
    }

    fn outcome(&self) -> QuizOutcome {
        QuizOutcome {
            score: self.score,
            total_questions: self.questions.len() as u32,
            passed: self.score >= PASS_THRESHOLD,
        }
    }

    /// Restart the attempt: all per-question state and the countdown reset.
    /// Any previously saved passing score is left alone until this attempt
    /// reaches `Finished` again.
    pub fn retake(&mut self, now: DateTime<Utc>) {
        self.phase = QuizPhase::AwaitingAnswer;
        self.current = 0;
        self.selected = None;
        self.score = 0;
        self.asked_at = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 0).unwrap()
    }

    fn questions(n: u32) -> Vec<QuizQuestion> {
        (0..n)
            .map(|i| QuizQuestion {
                id: i + 1,
                question: format!("q{}", i + 1),
                options: vec!["a".into(), "b".into(), "c".into(), "d".into()],
                answer_index: 1,
            })
            .collect()
    }

    fn answer(quiz: &mut QuizEvaluator, idx: usize, now: DateTime<Utc>) -> Option<QuizOutcome> {
        quiz.select_option(idx, now);
        quiz.advance(now)
    }

    #[test]
    fn three_correct_of_five_passes() {
        let mut quiz = QuizEvaluator::start(Uuid::new_v4(), questions(5), t0());
        let now = t0();
        answer(&mut quiz, 1, now);
        answer(&mut quiz, 1, now);
        answer(&mut quiz, 1, now);
        answer(&mut quiz, 0, now);
        let outcome = answer(&mut quiz, 0, now).unwrap();
        assert_eq!(outcome.score, 3);
        assert!(outcome.passed);
    }

    #[test]
    fn two_correct_of_five_fails() {
        let mut quiz = QuizEvaluator::start(Uuid::new_v4(), questions(5), t0());
        let now = t0();
        answer(&mut quiz, 1, now);
        answer(&mut quiz, 1, now);
        answer(&mut quiz, 0, now);
        answer(&mut quiz, 0, now);
        let outcome = answer(&mut quiz, 0, now).unwrap();
        assert_eq!(outcome.score, 2);
        assert!(!outcome.passed);
    }

    #[test]
    fn threshold_ignores_question_count() {
        // 3/3 on a three-question quiz also passes: the threshold does not
        // scale with quiz length.
        let mut quiz = QuizEvaluator::start(Uuid::new_v4(), questions(3), t0());
        let now = t0();
        answer(&mut quiz, 1, now);
        answer(&mut quiz, 1, now);
        let outcome = answer(&mut quiz, 1, now).unwrap();
        assert!(outcome.passed);
    }

    #[test]
    fn advance_without_selection_is_rejected() {
        let mut quiz = QuizEvaluator::start(Uuid::new_v4(), questions(2), t0());
        assert!(quiz.advance(t0()).is_none());
        assert_eq!(quiz.phase(), QuizPhase::AwaitingAnswer);
    }

    #[test]
    fn countdown_expiry_advances_without_credit() {
        let mut quiz = QuizEvaluator::start(Uuid::new_v4(), questions(2), t0());
        let late = t0() + Duration::seconds(QUESTION_SECONDS);
        // Selecting after the deadline counts as the timeout advance even
        // though the selection named the right option.
        quiz.select_option(1, late);
        assert_eq!(quiz.score(), 0);
        assert_eq!(quiz.phase(), QuizPhase::AwaitingAnswer);

        // Second question answered in time still scores.
        let outcome = answer(&mut quiz, 1, late + Duration::seconds(1)).unwrap();
        assert_eq!(outcome.score, 1);
    }

    #[test]
    fn expiry_on_last_question_finishes_attempt() {
        let mut quiz = QuizEvaluator::start(Uuid::new_v4(), questions(1), t0());
        let outcome = quiz
            .expire_if_due(t0() + Duration::seconds(QUESTION_SECONDS + 1))
            .unwrap();
        assert_eq!(outcome.score, 0);
        assert!(!outcome.passed);
        assert_eq!(quiz.phase(), QuizPhase::Finished);
    }

    #[test]
    fn selection_can_be_changed_before_advancing() {
        let mut quiz = QuizEvaluator::start(Uuid::new_v4(), questions(1), t0());
        quiz.select_option(0, t0());
        quiz.select_option(1, t0());
        let outcome = quiz.advance(t0()).unwrap();
        assert_eq!(outcome.score, 1);
    }

    #[test]
    fn retake_resets_state_and_timer() {
        let mut quiz = QuizEvaluator::start(Uuid::new_v4(), questions(2), t0());
        answer(&mut quiz, 1, t0());
        quiz.retake(t0() + Duration::seconds(60));
        assert_eq!(quiz.phase(), QuizPhase::AwaitingAnswer);
        assert_eq!(quiz.score(), 0);
        assert_eq!(
            quiz.seconds_remaining(t0() + Duration::seconds(60)),
            QUESTION_SECONDS
        );
    }

    #[test]
    fn out_of_range_option_is_ignored() {
        let mut quiz = QuizEvaluator::start(Uuid::new_v4(), questions(1), t0());
        quiz.select_option(9, t0());
        assert_eq!(quiz.phase(), QuizPhase::AwaitingAnswer);
    }
}
