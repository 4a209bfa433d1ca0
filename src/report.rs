//! Pass/fail/skip accounting, per file and across a run.

use std::io::{self, Write};

/// Number of failing files listed in the summary.
pub const WORST_FILES: usize = 15;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Tally {
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl Tally {
    pub fn add(&mut self, other: Tally) {
        self.passed += other.passed;
        self.failed += other.failed;
        self.skipped += other.skipped;
    }

    /// Passed over passed plus failed, as a percentage. Skips do not count.
    pub fn pass_rate(&self) -> f64 {
        let total = self.passed + self.failed;
        if total == 0 {
            return 0.0;
        }
        self.passed as f64 * 100.0 / total as f64
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    pub line: u64,
    pub message: String,
}

/// Outcome of one script.
#[derive(Debug, Clone, Default)]
pub struct FileReport {
    pub name: String,
    pub tally: Tally,
    pub failures: Vec<Failure>,
}

impl FileReport {
    pub fn new(name: impl Into<String>) -> FileReport {
        FileReport {
            name: name.into(),
            ..FileReport::default()
        }
    }

    pub fn pass(&mut self) {
        self.tally.passed += 1;
    }

    pub fn fail(&mut self, line: u64, message: impl Into<String>) {
        let message = message.into();
        log::info!("{}:{line}: {message}", self.name);
        self.tally.failed += 1;
        self.failures.push(Failure { line, message });
    }

    pub fn skip(&mut self, line: u64, reason: impl AsRef<str>) {
        log::debug!("{}:{line}: skipped: {}", self.name, reason.as_ref());
        self.tally.skipped += 1;
    }
}

/// Everything a run produced.
#[derive(Debug, Default)]
pub struct Summary {
    pub files: Vec<FileReport>,
    /// Scripts that could not be run at all, with the reason.
    pub errors: Vec<(String, String)>,
}

impl Summary {
    pub fn add(&mut self, report: FileReport) {
        self.files.push(report);
    }

    pub fn add_error(&mut self, name: impl Into<String>, error: impl ToString) {
        self.errors.push((name.into(), error.to_string()));
    }

    pub fn totals(&self) -> Tally {
        let mut total = Tally::default();
        for f in &self.files {
            total.add(f.tally);
        }
        total
    }

    /// Files with failures, most failures first.
    pub fn worst_files(&self, n: usize) -> Vec<&FileReport> {
        let mut failing: Vec<&FileReport> = self.files.iter().filter(|f| f.tally.failed > 0).collect();
        failing.sort_by(|a, b| b.tally.failed.cmp(&a.tally.failed).then_with(|| a.name.cmp(&b.name)));
        failing.truncate(n);
        failing
    }

    /// Whether the run stays within `allowed_failures`. A script that could
    /// not be run counts as a failure.
    pub fn is_success(&self, allowed_failures: usize) -> bool {
        self.totals().failed + self.errors.len() <= allowed_failures
    }

    /// One `PASS`/`FAIL` line for a file, with its failures when `verbose`.
    pub fn write_file_line<W: Write>(out: &mut W, report: &FileReport, verbose: bool) -> io::Result<()> {
        let status = if report.tally.failed == 0 { "PASS" } else { "FAIL" };
        writeln!(
            out,
            "  {status} {}: {} passed, {} failed, {} skipped",
            report.name, report.tally.passed, report.tally.failed, report.tally.skipped
        )?;
        if verbose {
            for f in &report.failures {
                writeln!(out, "    line {}: {}", f.line, f.message)?;
            }
        }
        Ok(())
    }

    pub fn write_totals<W: Write>(&self, out: &mut W) -> io::Result<()> {
        let total = self.totals();
        writeln!(out, "\n{:=<60}", "")?;
        writeln!(
            out,
            "Spec test results: {}/{} passed ({:.1}%)",
            total.passed,
            total.passed + total.failed,
            total.pass_rate()
        )?;
        writeln!(out, "  Files: {}", self.files.len() + self.errors.len())?;
        writeln!(out, "  Passed: {}", total.passed)?;
        writeln!(out, "  Failed: {}", total.failed)?;
        writeln!(out, "  Skipped: {}", total.skipped)?;
        writeln!(out, "{:=<60}", "")?;

        let worst = self.worst_files(WORST_FILES);
        if !worst.is_empty() {
            writeln!(out, "\nTop failing files:")?;
            for f in worst {
                writeln!(out, "  {}: {} failures ({} passed)", f.name, f.tally.failed, f.tally.passed)?;
            }
        }
        if !self.errors.is_empty() {
            writeln!(out, "\nFiles that could not be run:")?;
            writeln!(out, "{:-<60}", "")?;
            for (name, err) in &self.errors {
                writeln!(out, "  {name}: {err}")?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(name: &str, passed: usize, failed: usize) -> FileReport {
        let mut r = FileReport::new(name);
        for _ in 0..passed {
            r.pass();
        }
        for i in 0..failed {
            r.fail(i as u64, "boom");
        }
        r
    }

    #[test]
    fn pass_rate_ignores_skips() {
        let mut r = report("a", 3, 1);
        r.skip(9, "unsupported");
        assert_eq!(r.tally.skipped, 1);
        assert_eq!(r.tally.pass_rate(), 75.0);
        assert_eq!(Tally::default().pass_rate(), 0.0);
    }

    #[test]
    fn worst_files_sorted_and_capped() {
        let mut summary = Summary::default();
        summary.add(report("ok", 5, 0));
        for i in 0..20 {
            summary.add(report(&format!("f{i:02}"), 1, i + 1));
        }
        let worst = summary.worst_files(WORST_FILES);
        assert_eq!(worst.len(), 15);
        assert_eq!(worst[0].name, "f19");
        assert!(worst.iter().all(|f| f.name != "ok"));
    }

    #[test]
    fn threshold() {
        let mut summary = Summary::default();
        summary.add(report("a", 1, 2));
        assert!(!summary.is_success(0));
        assert!(summary.is_success(2));
        summary.add_error("b", "failed to parse");
        assert!(!summary.is_success(2));
    }

    #[test]
    fn output_lines() {
        let mut summary = Summary::default();
        summary.add(report("i32", 2, 1));
        let mut out = Vec::new();
        Summary::write_file_line(&mut out, &summary.files[0], true).unwrap();
        summary.write_totals(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("  FAIL i32: 2 passed, 1 failed, 0 skipped"));
        assert!(text.contains("    line 0: boom"));
        assert!(text.contains("Spec test results: 2/3 passed (66.7%)"));
        assert!(text.contains("  i32: 1 failures (2 passed)"));
    }
}
