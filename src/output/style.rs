use std::io::IsTerminal;
use std::sync::atomic::{AtomicBool, Ordering};

static COLORS_ENABLED: AtomicBool = AtomicBool::new(true);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tone {
    Strong,
    Quiet,
    Kind,
    Path,
    Number,
    Good,
    Bad,
    Live,
}

impl Tone {
    fn sgr(self) -> &'static str {
        match self {
            Tone::Strong => "1",
            Tone::Quiet => "2",
            Tone::Kind => "36",
            Tone::Path | Tone::Number => "96",
            Tone::Good => "32",
            Tone::Bad => "31",
            Tone::Live => "33",
        }
    }
}

/// Colors are off for `--no-color`, `NO_COLOR`, dumb terminals and whenever
/// stdout is not a terminal, unless `CLICOLOR_FORCE=1`.
pub fn configure(no_color: bool) {
    let forced = std::env::var("CLICOLOR_FORCE").ok().as_deref() == Some("1");
    let dumb = std::env::var("TERM").is_ok_and(|term| term.eq_ignore_ascii_case("dumb"));
    let enabled = !no_color
        && std::env::var_os("NO_COLOR").is_none()
        && !dumb
        && std::io::stdout().is_terminal();

    COLORS_ENABLED.store(forced || enabled, Ordering::Relaxed);
}

pub fn paint(tone: Tone, text: &str) -> String {
    if text.is_empty() || !COLORS_ENABLED.load(Ordering::Relaxed) {
        return text.to_string();
    }
    format!("\x1b[{}m{text}\x1b[0m", tone.sgr())
}

/// `ok completed`, `~ running`, `x timeout` and so on.
pub fn status_badge(status: &str) -> String {
    match status {
        "completed" => paint(Tone::Good, "ok completed"),
        "running" | "pending" => paint(Tone::Live, &format!("~ {status}")),
        other => paint(Tone::Bad, &format!("x {other}")),
    }
}
