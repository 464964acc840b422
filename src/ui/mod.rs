//! Consistent CLI output
//!
//! Glyphs and colors on an interactive terminal, bracket tags (`[OK]`,
//! `[WARN]`) when piped or running under CI.

mod context;
mod output;

pub use context::UiContext;
pub use output::{
    intro, key_value, key_value_status, remark, step_error_detail, step_info, step_ok,
    step_ok_detail, step_warn_hint,
};
