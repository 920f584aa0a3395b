mod run;
mod style;

pub use run::print_run;
pub use style::{Tone, configure, paint, status_badge};

pub fn format_duration_ms(ms: i64) -> String {
    if ms < 1000 {
        return format!("{ms}ms");
    }

    if ms.rem_euclid(1000) == 0 {
        return format!("{}s", ms / 1000);
    }

    format!("{:.3}s", ms as f64 / 1000.0)
}
