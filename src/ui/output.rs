//! Output helpers shared by the commands

use super::context::UiContext;
use console::{style, Style};

/// Bold section title
pub fn intro(ctx: &UiContext, title: &str) {
    if ctx.use_fancy_output() {
        println!("{}", style(title).cyan().bold());
    } else {
        println!("{}", title);
    }
    println!();
}

pub fn step_ok(ctx: &UiContext, message: &str) {
    let tag = if ctx.use_fancy_output() { "✓" } else { "[OK]" };
    println!("  {} {}", style(tag).green(), message);
}

pub fn step_ok_detail(ctx: &UiContext, message: &str, detail: &str) {
    let tag = if ctx.use_fancy_output() { "✓" } else { "[OK]" };
    println!("  {} {} ({})", style(tag).green(), message, style(detail).dim());
}

pub fn step_warn_hint(ctx: &UiContext, message: &str, hint: &str) {
    let tag = if ctx.use_fancy_output() { "⚠" } else { "[WARN]" };
    println!("  {} {} - {}", style(tag).yellow(), message, style(hint).dim());
}

pub fn step_error_detail(ctx: &UiContext, message: &str, detail: &str) {
    let tag = if ctx.use_fancy_output() { "✗" } else { "[FAIL]" };
    println!("  {} {}: {}", style(tag).red(), message, detail);
}

pub fn step_info(ctx: &UiContext, message: &str) {
    let tag = if ctx.use_fancy_output() { "•" } else { "[INFO]" };
    println!("  {} {}", style(tag).cyan(), message);
}

/// Dimmed follow-up line
pub fn remark(_ctx: &UiContext, message: &str) {
    println!("    {}", style(message).dim());
}

pub fn key_value(ctx: &UiContext, key: &str, value: &str) {
    if ctx.use_fancy_output() {
        println!("  {:<16} {}", style(key).dim(), value);
    } else {
        println!("  {:<16} {}", key, value);
    }
}

/// Key-value pair colored by health
pub fn key_value_status(ctx: &UiContext, key: &str, value: &str, ok: bool) {
    let value_style = if ok {
        Style::new().green()
    } else {
        Style::new().yellow()
    };

    if ctx.use_fancy_output() {
        println!("  {:<16} {}", style(key).dim(), value_style.apply_to(value));
    } else {
        let prefix = if ok { "[OK]" } else { "[WARN]" };
        println!("  {:<16} {} {}", key, value, prefix);
    }
}
