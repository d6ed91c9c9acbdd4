use std::collections::HashMap;

use serde::Serialize;
use uuid::Uuid;

/// Fixed macro-progression tiers, in unlock order.
pub const SEMESTER_ORDER: [&str; 6] = ["S1", "S2", "S3", "S4", "S5", "S6"];

pub fn semester_name(tag: &str) -> &'static str {
    match tag {
        "S1" => "First Semester",
        "S2" => "Second Semester",
        "S3" => "Third Semester",
        "S4" => "Fourth Semester",
        "S5" => "Fifth Semester",
        "S6" => "Sixth Semester",
        _ => "Unknown Semester",
    }
}

fn order_of(tag: &str) -> Option<usize> {
    SEMESTER_ORDER.iter().position(|t| *t == tag)
}

/// A semester is accessible when every earlier tag in the sequence is
/// completed. The first tag is always accessible; an unknown tag never is.
pub fn is_semester_accessible(target: &str, completions: &HashMap<String, bool>) -> bool {
    let Some(target_index) = order_of(target) else {
        return false;
    };
    SEMESTER_ORDER[..target_index]
        .iter()
        .all(|tag| completions.get(*tag).copied().unwrap_or(false))
}

/// Walk the sequence and return the last contiguously accessible tag. A
/// single incomplete semester blocks everything after it, regardless of the
/// completion state of later tags.
pub fn highest_accessible_semester(completions: &HashMap<String, bool>) -> &'static str {
    let mut highest = SEMESTER_ORDER[0];
    for tag in SEMESTER_ORDER {
        if is_semester_accessible(tag, completions) {
            highest = tag;
        } else {
            break;
        }
    }
    highest
}

/// Aggregate completion for one semester's modules. Each entry is a module's
/// stored progress percentage (`None` when no record exists); a module counts
/// as completed only at exactly 100. An empty semester counts as complete.
pub fn completion_percentage(per_module: &[Option<i32>]) -> i32 {
    if per_module.is_empty() {
        return 100;
    }
    let completed = per_module.iter().filter(|p| **p == Some(100)).count();
    ((completed as f64 / per_module.len() as f64) * 100.0).round() as i32
}

/// Fold per-semester module percentages into the derived completion map.
pub fn completion_map(
    per_semester: &HashMap<String, Vec<Option<i32>>>,
) -> HashMap<String, bool> {
    SEMESTER_ORDER
        .iter()
        .map(|tag| {
            let complete = per_semester
                .get(*tag)
                .map(|mods| completion_percentage(mods) == 100)
                // No modules published for this tier yet: nothing to block on.
                .unwrap_or(true);
            (tag.to_string(), complete)
        })
        .collect()
}

/// First incomplete tag in order, or `None` once everything is done.
pub fn next_semester_to_unlock(completions: &HashMap<String, bool>) -> Option<&'static str> {
    SEMESTER_ORDER
        .into_iter()
        .find(|tag| !completions.get(*tag).copied().unwrap_or(false))
}

/// Human message naming the first semester blocking a locked course.
pub fn course_lock_message(course_semester: &str, completions: &HashMap<String, bool>) -> String {
    let course_index = order_of(course_semester).unwrap_or(0);
    for tag in &SEMESTER_ORDER[..course_index] {
        if !completions.get(*tag).copied().unwrap_or(false) {
            return format!(
                "Complete all {} courses to unlock this course",
                semester_name(tag)
            );
        }
    }
    format!(
        "Complete previous semesters to access {} courses",
        semester_name(course_semester)
    )
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct EnrollmentDecision {
    pub can_enroll: bool,
    pub reason: String,
}

/// Whether a learner may enroll in a course: refused when the course is
/// already completed, its semester is still gated, or listed prerequisites
/// are below 100%.
pub fn enrollment_eligibility(
    course_semester: &str,
    own_progress: Option<i32>,
    prerequisites: &[(Uuid, Option<i32>)],
    completions: &HashMap<String, bool>,
) -> EnrollmentDecision {
    if own_progress == Some(100) {
        return EnrollmentDecision {
            can_enroll: false,
            reason: "Course already completed".into(),
        };
    }

    if !is_semester_accessible(course_semester, completions) {
        return EnrollmentDecision {
            can_enroll: false,
            reason: course_lock_message(course_semester, completions),
        };
    }

    let unmet: Vec<String> = prerequisites
        .iter()
        .filter(|(_, progress)| progress.unwrap_or(0) < 100)
        .map(|(id, _)| id.to_string())
        .collect();
    if !unmet.is_empty() {
        return EnrollmentDecision {
            can_enroll: false,
            reason: format!("Complete prerequisite courses first: {}", unmet.join(", ")),
        };
    }

    EnrollmentDecision {
        can_enroll: true,
        reason: "Course is available".into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn completions(pairs: &[(&str, bool)]) -> HashMap<String, bool> {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn first_semester_always_accessible() {
        assert!(is_semester_accessible("S1", &HashMap::new()));
    }

    #[test]
    fn unknown_tag_is_never_accessible() {
        assert!(!is_semester_accessible("S9", &HashMap::new()));
    }

    #[test]
    fn accessibility_requires_all_earlier_semesters() {
        let done = completions(&[("S1", true), ("S2", true)]);
        assert!(is_semester_accessible("S3", &done));
        assert!(!is_semester_accessible("S4", &done));
    }

    #[test]
    fn gap_blocks_later_semesters_despite_their_completion() {
        let done = completions(&[("S1", true), ("S2", false), ("S3", true)]);
        assert_eq!(highest_accessible_semester(&done), "S2");
        assert!(!is_semester_accessible("S3", &done));
    }

    #[test]
    fn highest_accessible_with_nothing_done() {
        assert_eq!(highest_accessible_semester(&HashMap::new()), "S1");
    }

    #[test]
    fn percentage_requires_exactly_full_modules() {
        assert_eq!(completion_percentage(&[Some(100), Some(99), None]), 33);
        assert_eq!(completion_percentage(&[Some(100), Some(100)]), 100);
        assert_eq!(completion_percentage(&[]), 100);
    }

    #[test]
    fn completion_map_treats_empty_tiers_as_complete() {
        let mut per_semester = HashMap::new();
        per_semester.insert("S1".to_string(), vec![Some(100)]);
        per_semester.insert("S2".to_string(), vec![Some(50)]);
        let map = completion_map(&per_semester);
        assert_eq!(map.get("S1"), Some(&true));
        assert_eq!(map.get("S2"), Some(&false));
        assert_eq!(map.get("S3"), Some(&true));
    }

    #[test]
    fn next_to_unlock_walks_in_order() {
        let done = completions(&[("S1", true), ("S2", true)]);
        assert_eq!(next_semester_to_unlock(&done), Some("S3"));

        let all: HashMap<String, bool> = SEMESTER_ORDER
            .iter()
            .map(|t| (t.to_string(), true))
            .collect();
        assert_eq!(next_semester_to_unlock(&all), None);
    }

    #[test]
    fn lock_message_names_first_blocking_semester() {
        let done = completions(&[("S1", true)]);
        let msg = course_lock_message("S3", &done);
        assert!(msg.contains("Second Semester"));
    }

    #[test]
    fn enrollment_refused_for_completed_course() {
        let decision = enrollment_eligibility("S1", Some(100), &[], &HashMap::new());
        assert!(!decision.can_enroll);
        assert_eq!(decision.reason, "Course already completed");
    }

    #[test]
    fn enrollment_refused_behind_semester_gate() {
        let decision = enrollment_eligibility("S2", None, &[], &HashMap::new());
        assert!(!decision.can_enroll);
        assert!(decision.reason.contains("First Semester"));
    }

    #[test]
    fn enrollment_blocked_by_unmet_prerequisites() {
        let prereq = Uuid::new_v4();
        let done = completions(&[("S1", true)]);
        let decision =
            enrollment_eligibility("S2", Some(10), &[(prereq, Some(40))], &done);
        assert!(!decision.can_enroll);
        assert!(decision.reason.contains(&prereq.to_string()));

        let decision =
            enrollment_eligibility("S2", Some(10), &[(prereq, Some(100))], &done);
        assert!(decision.can_enroll);
    }
}
