use indicatif::{ProgressBar, ProgressStyle};
use std::sync::Arc;

/// Console progress of the block sync.
pub struct IndexOutput {
    bar: ProgressBar,
}

impl IndexOutput {
    pub fn new() -> Self {
        let bar = ProgressBar::new(0);
        match ProgressStyle::default_bar().template(
            "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}",
        ) {
            Ok(style) => bar.set_style(style.progress_chars("#>-")),
            Err(e) => warn!("Invalid progress bar template: {}", e),
        }

        Self { bar }
    }

    /// Output without progress rendering, for tests and one-shot commands.
    pub fn hidden() -> Self {
        Self {
            bar: ProgressBar::hidden(),
        }
    }

    pub fn update_total_block_height(&self, block_height: u64) {
        self.bar.set_length(block_height);
    }

    pub fn update_current_height(&self, current_height: u64) {
        self.bar.set_position(current_height);
    }

    pub fn set_message(&self, msg: &str) {
        self.bar.set_message(msg.to_string());
    }

    pub fn println(&self, msg: &str) {
        self.bar.println(msg);
    }

    pub fn finish(&self) {
        self.bar.finish_with_message("Indexer stopped");
    }
}

impl Default for IndexOutput {
    fn default() -> Self {
        Self::new()
    }
}

pub type IndexOutputRef = Arc<IndexOutput>;
