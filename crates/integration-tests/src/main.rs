//! Integration tests for vmkit

use camino::Utf8Path;
use std::process::Output;

use color_eyre::eyre::eyre;
use color_eyre::Result;
use libtest_mimic::{Arguments, Trial};

pub(crate) use integration_tests::{integration_test, INTEGRATION_TESTS};

mod tests {
    pub mod disk;
    pub mod mkfs;
}

/// Get the path to the vmkit binary, checking VMKIT_PATH env var first, then falling back to "vmkit"
pub(crate) fn get_vmkit_command() -> Result<String> {
    if let Ok(path) = std::env::var("VMKIT_PATH") {
        return Ok(path);
    }
    // Force the user to set this if we're running from the project dir
    if let Some(path) = ["target/debug/vmkit", "target/release/vmkit"]
        .into_iter()
        .find(|p| Utf8Path::new(p).exists())
    {
        return Err(eyre!(
            "Detected {path} - set VMKIT_PATH={path} to run using this binary"
        ));
    }
    Ok("vmkit".to_owned())
}

/// Captured output from a command with decoded stdout/stderr strings
pub(crate) struct CapturedOutput {
    pub output: Output,
    pub stdout: String,
    pub stderr: String,
}

impl CapturedOutput {
    pub fn new(output: Output) -> Self {
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        Self {
            output,
            stdout,
            stderr,
        }
    }

    /// Fail with the command's stderr unless it succeeded
    pub fn ensure_success(&self, context: &str) -> Result<()> {
        if self.output.status.success() {
            Ok(())
        } else {
            Err(eyre!("{context} failed: {}", self.stderr))
        }
    }

    pub fn success(&self) -> bool {
        self.output.status.success()
    }
}

/// Run the vmkit command, capturing output
pub(crate) fn run_vmkit(args: &[&str]) -> Result<CapturedOutput> {
    let vmkit = get_vmkit_command()?;
    let output = std::process::Command::new(&vmkit).args(args).output()?;
    Ok(CapturedOutput::new(output))
}

/// Whether a usable qemu-nbd is installed
pub(crate) fn have_qemu_nbd() -> bool {
    let qemu_nbd = std::env::var("VMKIT_QEMU_NBD").unwrap_or_else(|_| "qemu-nbd".to_owned());
    std::process::Command::new(qemu_nbd)
        .arg("--version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

fn main() {
    // Integration tests are only supported on Linux
    if std::env::consts::OS != "linux" {
        eprintln!(
            "Integration tests are only supported on Linux (current OS: {})",
            std::env::consts::OS
        );
        eprintln!("Skipping all integration tests.");
        std::process::exit(0);
    }

    let args = Arguments::from_args();

    let tests: Vec<Trial> = INTEGRATION_TESTS
        .iter()
        .map(|test| {
            let name = test.name;
            let f = test.f;
            Trial::test(name, move || f().map_err(|e| format!("{:?}", e).into()))
        })
        .collect();

    libtest_mimic::run(&args, tests).exit();
}
