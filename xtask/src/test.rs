use anyhow::{Context, Result};
use colored::Colorize;
use std::process::Command;
use std::time::Instant;

pub fn run(unit_only: bool, integration_only: bool) -> Result<()> {
    println!();
    println!("{}", "🧪 Running tests...".cyan().bold());
    println!();

    let total_start = Instant::now();

    let run_unit = !integration_only;
    let run_integration = !unit_only;

    // Test 1: unit tests next to the code
    if run_unit {
        suite("Unit tests", &["test", "--lib", "--workspace"])?;
    }

    // Test 2: engine integration tests (layout model, round trip, scenarios)
    if run_integration {
        suite(
            "Integration tests",
            &["test", "-p", "tilewave", "--features", "std", "--tests"],
        )?;
    }

    // Test 3: Doc tests
    println!("{}", "  Running doc tests...".cyan());
    let doc_start = Instant::now();

    let doc_output = Command::new("cargo")
        .args(["test", "--doc", "--workspace"])
        .output()
        .context("Failed to run doc tests")?;

    if doc_output.status.success() {
        let output_str = String::from_utf8_lossy(&doc_output.stdout);
        println!(
            "{}",
            format!(
                "  ✓ Doc tests passed {} in {:.2}s",
                extract_test_summary(&output_str),
                doc_start.elapsed().as_secs_f64()
            )
            .green()
        );
    } else {
        eprintln!("{}", "  ⚠ Doc tests failed".yellow().bold());
    }
    println!();

    println!(
        "{}",
        format!(
            "✓ All tests completed in {:.2}s",
            total_start.elapsed().as_secs_f64()
        )
        .green()
        .bold()
    );
    println!();

    Ok(())
}

fn suite(label: &str, args: &[&str]) -> Result<()> {
    println!("{}", format!("  Running {}...", label.to_lowercase()).cyan());
    let start = Instant::now();

    let output = Command::new("cargo")
        .args(args)
        .output()
        .with_context(|| format!("Failed to run {label}"))?;
    let output_str = String::from_utf8_lossy(&output.stdout);

    if !output.status.success() {
        eprintln!("{}", format!("  ✗ {label} failed").red().bold());
        eprintln!();
        for line in output_str.lines() {
            eprintln!("  {line}");
        }
        anyhow::bail!("{label} failed");
    }

    println!(
        "{}",
        format!(
            "  ✓ {label} passed {} in {:.2}s",
            extract_test_summary(&output_str),
            start.elapsed().as_secs_f64()
        )
        .green()
    );
    println!();
    Ok(())
}

/// Sum every "test result:" line cargo prints (one per test binary).
fn extract_test_summary(output: &str) -> String {
    let mut passed = 0u64;
    let mut failed = 0u64;
    let mut binaries = 0u64;
    for line in output.lines() {
        let Some(summary) = line.split("test result:").nth(1) else {
            continue;
        };
        binaries = binaries.saturating_add(1);
        for part in summary.split(';') {
            let mut words = part.split_whitespace().rev();
            let (Some(kind), Some(count)) = (words.next(), words.next()) else {
                continue;
            };
            let count: u64 = count.parse().unwrap_or(0);
            match kind {
                "passed" => passed = passed.saturating_add(count),
                "failed" => failed = failed.saturating_add(count),
                _ => {}
            }
        }
    }
    if binaries == 0 {
        return "(summary not available)".to_string();
    }
    format!("({passed} passed, {failed} failed across {binaries} binaries)")
}

#[cfg(test)]
mod tests {
    use super::extract_test_summary;

    #[test]
    fn summary_adds_up_every_binary() {
        let out = "\
test result: ok. 5 passed; 0 failed; 0 ignored; 0 measured; 0 filtered out; finished in 0.01s
running 3 tests
test result: ok. 3 passed; 0 failed; 1 ignored; 0 measured; 0 filtered out; finished in 0.20s
";
        assert_eq!(
            extract_test_summary(out),
            "(8 passed, 0 failed across 2 binaries)"
        );
    }

    #[test]
    fn missing_summary_is_reported() {
        assert_eq!(extract_test_summary("error: no tests"), "(summary not available)");
    }
}
