//! Bounded display buffer plus unbounded session history.

use std::collections::VecDeque;
use std::collections::vec_deque;

use crate::config::LogConfig;

/// The rendered suffix of the display buffer, oldest line first.
pub type Tail<'a> = vec_deque::Iter<'a, String>;

/// Lines move `pending → display + history` on commit. The display buffer is
/// FIFO-trimmed to `max_log_lines`; history is never trimmed.
pub struct LogBuffer {
    pending: Vec<String>,
    display: VecDeque<String>,
    history: Vec<String>,
    max_log_lines: usize,
    max_display_lines: usize,
}

impl LogBuffer {
    pub fn new(config: &LogConfig) -> Self {
        let config = config.clone().normalized();
        Self {
            pending: Vec::new(),
            display: VecDeque::with_capacity(config.max_log_lines),
            history: Vec::new(),
            max_log_lines: config.max_log_lines,
            max_display_lines: config.max_display_lines,
        }
    }

    pub fn push_pending(&mut self, line: String) {
        self.pending.push(line);
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Move every pending line into the display buffer and history.
    /// Returns the history index of the first committed line.
    pub fn commit(&mut self) -> usize {
        let start = self.history.len();
        for line in &self.pending {
            if self.display.len() == self.max_log_lines {
                self.display.pop_front();
            }
            self.display.push_back(line.clone());
        }
        self.history.append(&mut self.pending);
        start
    }

    /// History entries from `start` on.
    pub fn since(&self, start: usize) -> &[String] {
        self.history.get(start..).unwrap_or_default()
    }

    /// The rendered suffix: at most `max_display_lines` of the display buffer.
    pub fn tail(&self) -> Tail<'_> {
        let skip = self.display.len().saturating_sub(self.max_display_lines);
        self.display.range(skip..)
    }

    pub fn display_len(&self) -> usize {
        self.display.len()
    }

    pub fn history(&self) -> &[String] {
        &self.history
    }

    pub fn clear(&mut self) {
        self.pending.clear();
        self.display.clear();
        self.history.clear();
    }
}

/// Scroll geometry of whatever renders the log.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Viewport {
    pub scroll_top: f64,
    pub scroll_height: f64,
    pub client_height: f64,
}

impl Viewport {
    pub fn distance_from_bottom(&self) -> f64 {
        self.scroll_height - self.scroll_top - self.client_height
    }

    pub fn is_near_bottom(&self, tolerance: f64) -> bool {
        self.distance_from_bottom() <= tolerance
    }
}

/// Auto-scroll follows new output until the user scrolls away. Scrolling
/// back to the bottom does not turn it back on; only [`AutoScroll::set`] does.
#[derive(Debug, Clone)]
pub struct AutoScroll {
    enabled: bool,
    tolerance: f64,
}

impl AutoScroll {
    pub fn new(tolerance: f64) -> Self {
        Self {
            enabled: true,
            tolerance,
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn set(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    /// Returns whether auto-scroll is still enabled.
    pub fn on_scroll(&mut self, viewport: Viewport) -> bool {
        if !viewport.is_near_bottom(self.tolerance) {
            self.enabled = false;
        }
        self.enabled
    }
}
