#![forbid(unsafe_code)]

//! Sliding context windows around a task. These are advisory: they shape
//! the prompt but never change task identity, so lookup failures simply
//! shorten the window.

use pb_core::book::InputTask;
use pb_core::split::split_sentences;
use pb_core::width::{cut_by_width, display_width, normalize_ws};
use pb_storage::TaskStore;

pub const PREV_WINDOW_TASKS: i64 = 8;
pub const NEXT_WINDOW_TASKS: i64 = 5;
pub const PREV_WIDTH_BUDGET: usize = 500;
pub const NEXT_WIDTH_BUDGET: usize = 200;
const HINT_WINDOW_TASKS: i64 = 8;

/// Scene-hint lookup result for one predecessor.
pub enum StoredHint {
    /// No row or no response yet; stop scanning.
    Missing,
    /// Response exists but carried no hint; keep scanning back.
    Empty,
    Found(String),
}

/// Anything the window functions can read task text and hints from: the
/// durable store while running, the in-memory task list when preparing
/// batch input.
pub trait TaskSource {
    fn task_count(&self) -> i64;
    fn task_source_text(&self, index: i64) -> Option<String>;
    fn stored_hint(&self, index: i64) -> StoredHint;
}

impl TaskSource for TaskStore {
    fn task_count(&self) -> i64 {
        self.count().unwrap_or(0)
    }

    fn task_source_text(&self, index: i64) -> Option<String> {
        self.load(index).ok().flatten().map(|r| r.source_text)
    }

    fn stored_hint(&self, index: i64) -> StoredHint {
        let Ok(Some(record)) = self.load(index) else {
            return StoredHint::Missing;
        };
        let Some(response) = record.response else {
            return StoredHint::Missing;
        };
        match response.hint {
            Some(hint) if !hint.is_empty() => StoredHint::Found(hint),
            _ => StoredHint::Empty,
        }
    }
}

impl TaskSource for [InputTask] {
    fn task_count(&self) -> i64 {
        self.len() as i64
    }

    fn task_source_text(&self, index: i64) -> Option<String> {
        usize::try_from(index)
            .ok()
            .and_then(|i| self.get(i))
            .map(|t| t.source_text.clone())
    }

    fn stored_hint(&self, _index: i64) -> StoredHint {
        StoredHint::Missing
    }
}

/// Nearest non-empty scene hint among the eight predecessors, scanning
/// backwards and stopping at the first gap.
pub fn scene_hint(source: &(impl TaskSource + ?Sized), index: i64) -> String {
    let min_index = (index - HINT_WINDOW_TASKS).max(0);
    let mut index = index - 1;
    while index >= min_index {
        match source.stored_hint(index) {
            StoredHint::Missing => break,
            StoredHint::Found(hint) => return hint,
            StoredHint::Empty => index -= 1,
        }
    }
    String::new()
}

fn budgeted(sentences: Vec<String>, max_width: usize) -> Vec<String> {
    let mut sum_width = 0usize;
    let mut picked = Vec::new();
    for sentence in sentences {
        if sum_width >= max_width {
            break;
        }
        let mut sentence = sentence;
        let mut width = display_width(&sentence);
        if width > max_width {
            sentence = format!("{}...", cut_by_width(&sentence, max_width).trim());
            width = display_width(&sentence);
        }
        picked.push(sentence);
        sum_width += width;
    }
    picked
}

/// Sentences of up to eight predecessors, chronological order, picked
/// from the nearest side until the width budget runs out.
pub fn prev_context(source: &(impl TaskSource + ?Sized), index: i64) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut target = (index - PREV_WINDOW_TASKS).max(0);
    while target < index {
        let Some(text) = source.task_source_text(target) else {
            break;
        };
        sentences.extend(split_sentences(&normalize_ws(&text)));
        target += 1;
    }
    sentences.reverse();
    let mut picked = budgeted(sentences, PREV_WIDTH_BUDGET);
    picked.reverse();
    picked
}

/// Sentences of up to five successors under the next-window budget.
pub fn next_context(source: &(impl TaskSource + ?Sized), index: i64) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut target = index + 1;
    let max_index = (index + NEXT_WINDOW_TASKS + 1).min(source.task_count());
    while target < max_index {
        let Some(text) = source.task_source_text(target) else {
            break;
        };
        sentences.extend(split_sentences(&normalize_ws(&text)));
        target += 1;
    }
    budgeted(sentences, NEXT_WIDTH_BUDGET)
}
