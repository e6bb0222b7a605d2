//! Progress bars for subject loops and permutation batches

use indicatif::{ProgressBar, ProgressStyle};

const BAR_TEMPLATE: &str = "{msg:>16} [{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} ({eta})";

/// Bar with the crate-wide style; hidden automatically when stderr is not a terminal
pub fn bar(len: usize, msg: &str) -> ProgressBar {
    let pb = ProgressBar::new(len as u64);
    let style = ProgressStyle::with_template(BAR_TEMPLATE)
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=>-");
    pb.set_style(style);
    pb.set_message(msg.to_string());
    pb
}
