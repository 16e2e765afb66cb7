#[cfg(feature = "render_progress")]
use indicatif::{ProgressBar, ProgressStyle};

#[cfg(feature = "render_progress")]
const DEFAULT_PROGRESS: &str = "{elapsed_precise} {bar:30.blue/red} {pos:>3}% {msg}";
#[cfg(feature = "render_progress")]
const PROGRESS_LINE: &str = "━╾╴─";

/// Rounded percentage of `total` that `received` represents, half-up, capped at 100.
///
/// Returns `None` when no usable total was advertised.
pub(crate) fn percent(received: u64, total: Option<u64>) -> Option<u8> {
    let total = total.filter(|&total| total > 0)? as u128;
    let scaled = (received as u128 * 200 + total) / (total * 2);
    Some(scaled.min(100) as u8)
}

/// Terminal rendering for a transfer's percent events.
#[cfg(feature = "render_progress")]
pub struct Progress {
    style: ProgressStyle,
    message: Option<String>,
}

#[cfg(feature = "render_progress")]
impl Default for Progress {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "render_progress")]
impl Progress {
    pub fn new() -> Self {
        let style = ProgressStyle::with_template(DEFAULT_PROGRESS)
            .map(|style| style.progress_chars(PROGRESS_LINE))
            .unwrap_or_else(|_| ProgressStyle::default_bar());
        Self { style, message: None }
    }
    pub fn with_style(mut self, style: ProgressStyle) -> Self {
        self.style = style;
        self
    }
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
    pub(crate) fn bar(&self) -> ProgressBar {
        let bar = ProgressBar::new(100).with_style(self.style.clone());
        if let Some(message) = &self.message {
            bar.set_message(message.clone());
        }
        bar
    }
}
