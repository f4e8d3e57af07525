//! Ordered step labels with a movable cursor, driving steps/batch mode.

use serde::{Deserialize, Serialize};

/// An ordered list of step labels plus the index of the current step.
///
/// The cursor is either empty (no current index) or points at a valid step.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepCursor {
    steps: Vec<String>,
    current: Option<usize>,
}

impl StepCursor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a cursor from newline separated text.
    pub fn from_text(raw: &str) -> Self {
        let mut cursor = Self::new();
        cursor.set_steps(raw);
        cursor
    }

    /// Drop every step.
    pub fn reset(&mut self) {
        self.steps.clear();
        self.current = None;
    }

    /// Replace the steps with the non-blank lines of `raw`, trimmed.
    pub fn set_steps(&mut self, raw: &str) {
        self.set_step_list(raw.lines());
    }

    /// Replace the steps with the non-blank entries of `entries`, trimmed.
    ///
    /// An input without any usable entry is the same as [`StepCursor::reset`].
    pub fn set_step_list<I, S>(&mut self, entries: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let steps: Vec<String> = entries
            .into_iter()
            .map(|s| s.as_ref().trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        if steps.is_empty() {
            self.reset();
            return;
        }

        self.steps = steps;
        self.current = Some(0);
    }

    pub fn count(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn current_index(&self) -> Option<usize> {
        self.current
    }

    pub fn current(&self) -> Option<&str> {
        self.current.map(|i| self.steps[i].as_str())
    }

    pub fn steps(&self) -> &[String] {
        &self.steps
    }

    /// Advance one step; stays on the last step instead of wrapping.
    pub fn move_next(&mut self) -> Option<&str> {
        let index = self.current?;
        if index + 1 < self.steps.len() {
            self.current = Some(index + 1);
        }
        self.current()
    }

    /// Go back one step; stays on the first step instead of wrapping.
    pub fn move_prev(&mut self) -> Option<&str> {
        let index = self.current?;
        self.current = Some(index.saturating_sub(1));
        self.current()
    }

    /// Jump to `index`. Out-of-range indexes leave the cursor untouched.
    pub fn move_to(&mut self, index: usize) -> Option<&str> {
        if index >= self.steps.len() {
            return None;
        }
        self.current = Some(index);
        self.current()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_steps_trims_and_drops_blank_lines() {
        let cursor = StepCursor::from_text("  login \n\n   \ncheckout\r\n confirm");
        assert_eq!(cursor.count(), 3);
        assert_eq!(cursor.current_index(), Some(0));
        assert_eq!(cursor.steps(), &["login", "checkout", "confirm"]);
    }

    #[test]
    fn test_empty_input_resets() {
        let mut cursor = StepCursor::from_text("a\nb");
        cursor.move_next();
        cursor.set_steps(" \n\n ");
        assert_eq!(cursor.count(), 0);
        assert_eq!(cursor.current_index(), None);
        assert_eq!(cursor.current(), None);
    }

    #[test]
    fn test_empty_cursor_accessors_return_none() {
        let mut cursor = StepCursor::new();
        assert_eq!(cursor.current(), None);
        assert_eq!(cursor.move_next(), None);
        assert_eq!(cursor.move_prev(), None);
        assert_eq!(cursor.move_to(0), None);
        assert_eq!(cursor.current_index(), None);
    }

    #[test]
    fn test_move_next_clamps_at_last_step() {
        let mut cursor = StepCursor::from_text("one\ntwo");
        assert_eq!(cursor.move_next(), Some("two"));
        assert_eq!(cursor.move_next(), Some("two"));
        assert_eq!(cursor.current_index(), Some(1));
    }

    #[test]
    fn test_move_prev_clamps_at_first_step() {
        let mut cursor = StepCursor::from_text("one\ntwo");
        assert_eq!(cursor.move_prev(), Some("one"));
        assert_eq!(cursor.current_index(), Some(0));
    }

    #[test]
    fn test_move_to_out_of_bounds_is_a_no_op() {
        let mut cursor = StepCursor::from_text("one\ntwo\nthree");
        assert_eq!(cursor.move_to(2), Some("three"));
        assert_eq!(cursor.move_to(3), None);
        assert_eq!(cursor.current_index(), Some(2));
    }

    #[test]
    fn test_set_step_list_restarts_at_zero() {
        let mut cursor = StepCursor::from_text("a\nb\nc");
        cursor.move_to(2);
        cursor.set_step_list(vec!["x", " y "]);
        assert_eq!(cursor.current(), Some("x"));
        assert_eq!(cursor.count(), 2);
    }
}
