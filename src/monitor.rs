//! Due-date classification of a task snapshot.

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;

use crate::types::Task;

/// Rolling window, measured from "now", that counts as due today.
pub const DUE_SOON_HORIZON_HOURS: i64 = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DueState {
    Overdue,
    DueToday,
    Pending,
    Ineligible,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DueClassification {
    pub overdue: Vec<Task>,
    pub due_today: Vec<Task>,
}

impl DueClassification {
    pub fn is_empty(&self) -> bool {
        self.overdue.is_empty() && self.due_today.is_empty()
    }
}

pub fn due_state(now: DateTime<Utc>, task: &Task) -> DueState {
    let Some(due) = task.pending_due_date() else {
        return DueState::Ineligible;
    };

    let until_due = due - now;
    if until_due < TimeDelta::zero() {
        DueState::Overdue
    } else if until_due <= TimeDelta::hours(DUE_SOON_HORIZON_HOURS) {
        DueState::DueToday
    } else {
        DueState::Pending
    }
}

pub fn classify(now: DateTime<Utc>, tasks: &[Task]) -> DueClassification {
    let mut classification = DueClassification::default();
    for task in tasks {
        match due_state(now, task) {
            DueState::Overdue => classification.overdue.push(task.clone()),
            DueState::DueToday => classification.due_today.push(task.clone()),
            DueState::Pending | DueState::Ineligible => {}
        }
    }
    classification
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, 10, 12, 0, 0).unwrap()
    }

    fn task(id: &str, due: Option<TimeDelta>, completed: bool) -> Task {
        let mut task = Task::new(id, format!("task {id}"), now() - TimeDelta::days(1));
        task.due_date = due.map(|offset| now() + offset);
        task.completed = completed;
        task
    }

    fn ids(tasks: &[Task]) -> Vec<&str> {
        tasks.iter().map(|task| task.id.as_str()).collect()
    }

    #[test]
    fn test_overdue_tasks_never_due_today() {
        let tasks = vec![
            task("a", Some(TimeDelta::seconds(-1)), false),
            task("b", Some(TimeDelta::days(-30)), false),
        ];

        let result = classify(now(), &tasks);
        assert_eq!(ids(&result.overdue), vec!["a", "b"]);
        assert!(result.due_today.is_empty());
    }

    #[test]
    fn test_due_today_is_rolling_horizon_inclusive() {
        let tasks = vec![
            task("now", Some(TimeDelta::zero()), false),
            task("soon", Some(TimeDelta::hours(3)), false),
            task("edge", Some(TimeDelta::hours(24)), false),
            task("later", Some(TimeDelta::hours(24) + TimeDelta::seconds(1)), false),
        ];

        let result = classify(now(), &tasks);
        assert_eq!(ids(&result.due_today), vec!["now", "soon", "edge"]);
        assert!(result.overdue.is_empty());
        assert_eq!(due_state(now(), &tasks[3]), DueState::Pending);
    }

    #[test]
    fn test_completed_and_undated_tasks_are_ignored() {
        let tasks = vec![
            task("done-late", Some(TimeDelta::hours(-2)), true),
            task("done-soon", Some(TimeDelta::hours(2)), true),
            task("undated", None, false),
        ];

        let result = classify(now(), &tasks);
        assert!(result.is_empty());
        assert_eq!(due_state(now(), &tasks[2]), DueState::Ineligible);
    }

    #[test]
    fn test_singleton_check() {
        let single = [task("solo", Some(TimeDelta::minutes(5)), false)];
        let result = classify(now(), &single);
        assert_eq!(ids(&result.due_today), vec!["solo"]);
    }
}
