use anyhow::{Context, Result};
use colored::Colorize;
use std::process::Command;
use std::time::Instant;

/// Embedded target the engine must keep building for.
const EMBEDDED_TARGET: &str = "thumbv7em-none-eabihf";

/// Cargo invocations that must all succeed, in order.
const REQUIRED_STEPS: [(&str, &[&str]); 4] = [
    // engine on the embedded target (no_std, defmt logging)
    (
        "Engine (no_std, defmt)",
        &[
            "check",
            "-p",
            "tilewave",
            "--target",
            EMBEDDED_TARGET,
            "--no-default-features",
            "--features",
            "defmt",
        ],
    ),
    // platform crate on the embedded target
    (
        "Platform (no_std)",
        &[
            "check",
            "-p",
            "platform",
            "--target",
            EMBEDDED_TARGET,
            "--no-default-features",
        ],
    ),
    // host build with file storage and tracing
    (
        "Engine (host, std + tracing)",
        &["check", "-p", "tilewave", "--features", "std,tracing"],
    ),
    // rustdoc; `std` pulls in the host storage and allocator so their links resolve
    (
        "Docs",
        &["doc", "--workspace", "--no-deps", "--features", "tilewave/std"],
    ),
];

pub fn run() -> Result<()> {
    println!();
    println!("{}", "🔍 Checking builds...".cyan().bold());
    println!();

    let total_start = Instant::now();

    for (label, args) in REQUIRED_STEPS {
        required_step(label, args)?;
    }

    // Clippy lints
    println!("{}", "  Running clippy lints...".cyan());
    let clippy_start = Instant::now();

    let clippy_output = Command::new("cargo")
        .args(["clippy", "--workspace", "--all-targets", "--", "-D", "warnings"])
        .output()
        .context("Failed to run clippy")?;

    if clippy_output.status.success() {
        println!(
            "{}",
            format!(
                "  ✓ Clippy passed in {:.2}s",
                clippy_start.elapsed().as_secs_f64()
            )
            .green()
        );
    } else {
        eprintln!("{}", "  ⚠ Clippy warnings found".yellow().bold());
        eprintln!();
        eprintln!("{}", String::from_utf8_lossy(&clippy_output.stderr));
        // Don't fail on clippy warnings, just show them
    }
    println!();

    // Format check
    println!("{}", "  Checking code formatting...".cyan());

    let fmt_output = Command::new("cargo")
        .args(["fmt", "--all", "--check"])
        .output()
        .context("Failed to run cargo fmt")?;

    if fmt_output.status.success() {
        println!("{}", "  ✓ Formatting check passed".green());
    } else {
        eprintln!("{}", "  ⚠ Formatting issues found".yellow().bold());
        eprintln!("     Run 'cargo fmt --all' to fix");
    }
    println!();

    println!(
        "{}",
        format!(
            "✓ All checks completed in {:.2}s",
            total_start.elapsed().as_secs_f64()
        )
        .green()
        .bold()
    );
    println!();

    Ok(())
}

/// Run one cargo invocation, failing the whole check if it fails.
fn required_step(label: &str, args: &[&str]) -> Result<()> {
    println!("{}", format!("  Checking {label}...").cyan());
    let start = Instant::now();

    let output = Command::new("cargo")
        .args(args)
        .output()
        .with_context(|| format!("Failed to run cargo for {label}"))?;

    if !output.status.success() {
        eprintln!("{}", format!("  ✗ {label} check failed").red().bold());
        eprintln!();
        eprintln!("{}", String::from_utf8_lossy(&output.stderr));
        anyhow::bail!("{label} check failed");
    }

    println!(
        "{}",
        format!(
            "  ✓ {label} passed in {:.2}s",
            start.elapsed().as_secs_f64()
        )
        .green()
    );
    println!();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{EMBEDDED_TARGET, REQUIRED_STEPS};

    #[test]
    fn docs_build_with_the_host_features() {
        let (_, args) = REQUIRED_STEPS
            .iter()
            .find(|(_, args)| args.first() == Some(&"doc"))
            .expect("no doc step");
        assert!(args.contains(&"--workspace"));
        assert!(args.contains(&"tilewave/std"));
    }

    #[test]
    fn no_std_steps_target_the_embedded_triple() {
        let embedded: Vec<_> = REQUIRED_STEPS
            .iter()
            .filter(|(_, args)| args.contains(&"--no-default-features"))
            .collect();
        assert_eq!(embedded.len(), 2);
        for (label, args) in embedded {
            assert!(args.contains(&EMBEDDED_TARGET), "{label}");
        }
    }
}
