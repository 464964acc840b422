//! Terminal detection for CLI output

use std::io::IsTerminal;

const CI_VARS: [&str; 6] = [
    "CI",
    "GITHUB_ACTIONS",
    "GITLAB_CI",
    "BUILDKITE",
    "JENKINS_URL",
    "TF_BUILD",
];

/// Decides between glyph output and plain bracket tags
#[derive(Debug, Clone, Copy)]
pub struct UiContext {
    fancy: bool,
}

impl UiContext {
    pub fn detect() -> Self {
        let tty = std::io::stdout().is_terminal();
        let ci = CI_VARS.iter().any(|var| std::env::var_os(var).is_some());
        Self { fancy: tty && !ci }
    }

    pub fn plain() -> Self {
        Self { fancy: false }
    }

    pub fn use_fancy_output(&self) -> bool {
        self.fancy
    }
}
