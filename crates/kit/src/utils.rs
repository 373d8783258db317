use color_eyre::eyre::eyre;
use color_eyre::Result;
use indicatif::ProgressBar;
use std::time::{Duration, Instant};
use tracing::debug;

/// Poll a condition until it yields a value, with progress indication
///
/// Repeatedly calls `test_fn` until it returns `Ok(Some(_))` or the timeout
/// expires. `Ok(None)` means "not yet"; an `Err` is fatal and returned
/// immediately, so callers can abort on conditions that will never resolve
/// (e.g. the process they are waiting on has exited).
///
/// # Arguments
///
/// * `progress` - Progress bar to update with attempt status
/// * `message` - Message to display (e.g., "Waiting for qemu-nbd")
/// * `test_fn` - Function that tests the readiness condition
/// * `timeout` - Maximum duration to wait
/// * `poll_interval` - Duration to wait between test attempts
///
/// # Returns
///
/// Returns the produced value and the elapsed duration on success, or an
/// error on timeout
pub fn wait_for_readiness<T, F>(
    progress: &ProgressBar,
    message: &str,
    mut test_fn: F,
    timeout: Duration,
    poll_interval: Duration,
) -> Result<(T, Duration)>
where
    F: FnMut() -> Result<Option<T>>,
{
    let start_time = Instant::now();

    debug!("Polling for readiness (timeout: {}s)", timeout.as_secs());

    let mut attempt = 0;
    loop {
        attempt += 1;

        progress.set_message(format!(
            "{} (attempt {}, elapsed: {}s)",
            message,
            attempt,
            start_time.elapsed().as_secs()
        ));

        if let Some(v) = test_fn()? {
            debug!("Readiness check successful after {} attempts", attempt);
            return Ok((v, start_time.elapsed()));
        }
        debug!("Readiness check attempt {} not ready", attempt);

        if start_time.elapsed() >= timeout {
            break;
        }
        std::thread::sleep(poll_interval);
    }

    Err(eyre!(
        "Timeout waiting for readiness after {}s ({} attempts)",
        timeout.as_secs(),
        attempt
    ))
}

/// Parse size string (e.g., "10G", "5120M", "1T") to bytes
pub fn parse_size(size_str: &str) -> Result<u64> {
    let size_str = size_str.trim().to_uppercase();

    if size_str.is_empty() {
        return Err(eyre!("Empty size string"));
    }

    let (number_str, multiplier) = if let Some(num) = size_str.strip_suffix("TB") {
        (num, 1024_u64.pow(4))
    } else if let Some(num) = size_str.strip_suffix("GB") {
        (num, 1024 * 1024 * 1024)
    } else if let Some(num) = size_str.strip_suffix("MB") {
        (num, 1024 * 1024)
    } else if let Some(num) = size_str.strip_suffix("KB") {
        (num, 1024)
    } else if let Some(num) = size_str.strip_suffix('T') {
        (num, 1024_u64.pow(4))
    } else if let Some(num) = size_str.strip_suffix('G') {
        (num, 1024 * 1024 * 1024)
    } else if let Some(num) = size_str.strip_suffix('M') {
        (num, 1024 * 1024)
    } else if let Some(num) = size_str.strip_suffix('K') {
        (num, 1024)
    } else if let Some(num) = size_str.strip_suffix('B') {
        (num, 1)
    } else {
        // No unit suffix, assume bytes
        (&*size_str, 1)
    };

    let number: u64 = number_str
        .trim()
        .parse()
        .map_err(|_| eyre!("Invalid number in size: {}", number_str))?;

    number
        .checked_mul(multiplier)
        .ok_or_else(|| eyre!("Size overflows 64 bits: {}", size_str))
}
