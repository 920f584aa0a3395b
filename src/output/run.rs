use crate::format::RunSummary;
use crate::output::{Tone, format_duration_ms, paint, status_badge};
use std::io::Write;

pub fn print_run(mut w: impl Write, run: &RunSummary) -> std::io::Result<()> {
    writeln!(
        w,
        "{} {} {}",
        paint(Tone::Kind, &run.kind),
        paint(Tone::Quiet, &run.run_id),
        status_badge(&run.status)
    )?;
    writeln!(w, "  command: {}", paint(Tone::Path, &run.command.join(" ")))?;
    writeln!(w, "  output: {}", run.out_dir)?;

    if let Some(code) = run.exit_code {
        writeln!(w, "  exit: {}", paint(Tone::Number, &code.to_string()))?;
    }

    if let Some(ms) = run.duration_ms {
        writeln!(w, "  duration: {}", paint(Tone::Number, &format_duration_ms(ms)))?;
    }

    if let Some(error) = &run.error {
        writeln!(w, "  error: {}", paint(Tone::Bad, error.trim_end()))?;
    }

    if let Some(artifacts) = &run.artifacts
        && !artifacts.is_empty()
    {
        writeln!(w, "  artifacts:")?;
        for artifact in artifacts {
            let size = format!("({} bytes)", artifact.size);
            writeln!(w, "    {} {}", artifact.path, paint(Tone::Quiet, &size))?;
        }
        if let Some(note) = &run.artifacts_truncated {
            writeln!(w, "    {}", paint(Tone::Quiet, note))?;
        }
    }

    for (label, text) in [("stdout", &run.stdout), ("stderr", &run.stderr)] {
        if let Some(text) = text
            && !text.trim().is_empty()
        {
            writeln!(w, "  {label}:")?;
            for line in text.lines() {
                writeln!(w, "    {line}")?;
            }
        }
    }

    Ok(())
}
