//! Posture score over an execution's terminal tasks.
//!
//! Pure function, no side effects: blocked techniques earn full credit,
//! detected ones half, undetected successes none. Tasks whose outcome is
//! `execution_failed` -- and tasks that never produced an outcome at all
//! (unreachable, disconnected, timed out, cancelled) -- say nothing about
//! posture and are excluded from the denominator.

use crate::protocol::Outcome;

use super::types::Task;

/// Weighted posture score in [0, 100], or `None` when no task produced a
/// countable outcome. `None` is "undefined", deliberately distinct from a
/// score of zero (every technique succeeded undetected).
pub fn posture_score(tasks: &[Task]) -> Option<f64> {
    let mut blocked = 0u64;
    let mut detected = 0u64;
    let mut counted = 0u64;

    for task in tasks {
        let Some(result) = &task.result else { continue };
        match result.outcome {
            Outcome::Blocked => {
                blocked += 1;
                counted += 1;
            }
            Outcome::Detected => {
                detected += 1;
                counted += 1;
            }
            Outcome::Success => counted += 1,
            Outcome::ExecutionFailed => {}
        }
    }

    if counted == 0 {
        return None;
    }
    Some((blocked * 100 + detected * 50) as f64 / (counted * 100) as f64 * 100.0)
}
