//! # Utility Functions and Helper Module
//!
//! This module provides the small helpers shared across the benchmark: id
//! generation, the deterministic digit payload, timestamp and duration
//! formatting for the human-readable record, and the batch statistics used to
//! summarise latency samples.
//!
//! ## Key Functionality Categories
//!
//! - **Identifiers**: Unique run and job identifiers
//! - **Payloads**: Length-exact synthetic payloads
//! - **Formatting**: Human-readable display of timestamps and durations
//! - **Statistics**: Mean, population standard deviation, median, percentiles
//!
//! ## Usage Examples
//!
//! ```rust
//! use method_bench::utils::*;
//! use std::time::Duration;
//!
//! assert_eq!(digit_cycle(13), b"0123456789012".to_vec());
//! assert_eq!(format_duration(Duration::from_micros(1500)), "1.50ms");
//!
//! let (mean, _min, _max, std_dev) = calculate_stats(&[10.0, 20.0]).unwrap();
//! assert_eq!(mean, 15.0);
//! assert_eq!(std_dev, 5.0);
//! ```

use chrono::{DateTime, TimeZone};
use std::cmp::Ordering;
use std::time::Duration;
use uuid::Uuid;

/// Generate a unique identifier for runs and configuration jobs
///
/// Creates a UUID v4 string. Used to tag run reports and to name jobs
/// scheduled against the fleet so concurrent runs never collide.
///
/// ## Thread Safety
///
/// This function is thread-safe and can be called concurrently from multiple
/// threads. Each call returns a unique identifier.
pub fn generate_id() -> String {
    Uuid::new_v4().to_string()
}

/// Build a payload of exactly `len` bytes cycling the digits `0`-`9`
///
/// The payload is deterministic, so runs with the same size always send the
/// same bytes, and length-exact for every size including zero.
///
/// ## Examples
///
/// ```rust
/// # use method_bench::utils::digit_cycle;
/// assert_eq!(digit_cycle(0), Vec::<u8>::new());
/// assert_eq!(digit_cycle(5), b"01234".to_vec());
/// ```
pub fn digit_cycle(len: usize) -> Vec<u8> {
    (0..len).map(|i| b'0' + (i % 10) as u8).collect()
}

/// Format a wall-clock timestamp for the invocation record
///
/// Produces `YYYY/MM/DD-HH:MM:SS.mmm`, the layout used for every per-call
/// line written to the result sink.
pub fn format_timestamp<Tz>(timestamp: &DateTime<Tz>) -> String
where
    Tz: TimeZone,
    Tz::Offset: std::fmt::Display,
{
    timestamp.format("%Y/%m/%d-%H:%M:%S%.3f").to_string()
}

/// Format a duration in a human-readable way
///
/// Converts a Duration to a human-readable string, automatically selecting
/// the most appropriate unit based on the magnitude.
///
/// ## Unit Selection Logic
///
/// - **Nanoseconds**: < 1,000 ns (e.g., "500ns")
/// - **Microseconds**: < 1,000,000 ns (e.g., "1.50μs")
/// - **Milliseconds**: < 1,000,000,000 ns (e.g., "25.75ms")
/// - **Seconds**: < 60 seconds (e.g., "5.25s")
/// - **Minutes and Hours**: For longer durations (e.g., "5m 30s", "2h 15m 30s")
///
/// ## Examples
///
/// ```rust
/// # use method_bench::utils::format_duration;
/// # use std::time::Duration;
/// assert_eq!(format_duration(Duration::from_nanos(750)), "750ns");
/// assert_eq!(format_duration(Duration::from_secs(90)), "1m 30s");
/// ```
pub fn format_duration(duration: Duration) -> String {
    let total_ns = duration.as_nanos();

    if total_ns < 1_000 {
        format!("{}ns", total_ns)
    } else if total_ns < 1_000_000 {
        format!("{:.2}μs", total_ns as f64 / 1_000.0)
    } else if total_ns < 1_000_000_000 {
        format!("{:.2}ms", total_ns as f64 / 1_000_000.0)
    } else if total_ns < 60_000_000_000 {
        format!("{:.2}s", total_ns as f64 / 1_000_000_000.0)
    } else {
        let seconds = duration.as_secs();
        let minutes = seconds / 60;
        let remaining_seconds = seconds % 60;

        if minutes < 60 {
            format!("{}m {}s", minutes, remaining_seconds)
        } else {
            let hours = minutes / 60;
            let remaining_minutes = minutes % 60;
            format!("{}h {}m {}s", hours, remaining_minutes, remaining_seconds)
        }
    }
}

/// Calculate basic statistics for a set of values
///
/// Computes mean, minimum, maximum, and population standard deviation in a
/// single pass over the data plus one pass for the variance.
///
/// ## Returns
/// `Some((mean, min, max, std_dev))`, or `None` for an empty slice. An empty
/// set has no meaningful statistics and callers must report it as such.
///
/// ## Standard Deviation
///
/// The divisor is N, not N-1: the samples are the complete population of
/// calls made during the run.
///
/// ## Examples
///
/// ```rust
/// # use method_bench::utils::calculate_stats;
/// let (mean, min, max, std_dev) = calculate_stats(&[1.0, 2.0, 3.0, 4.0, 5.0]).unwrap();
/// assert_eq!(mean, 3.0);
/// assert_eq!(min, 1.0);
/// assert_eq!(max, 5.0);
/// assert!((std_dev - 2.0_f64.sqrt()).abs() < 1e-12);
/// assert!(calculate_stats(&[]).is_none());
/// ```
pub fn calculate_stats(values: &[f64]) -> Option<(f64, f64, f64, f64)> {
    if values.is_empty() {
        return None;
    }

    let sum: f64 = values.iter().sum();
    let count = values.len() as f64;
    let mean = sum / count;

    let min = values.iter().cloned().fold(f64::INFINITY, f64::min);
    let max = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);

    let variance = values.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / count;
    let std_dev = variance.sqrt();

    Some((mean, min, max, std_dev))
}

/// Sort a copy of the values in ascending order
pub fn sorted(values: &[f64]) -> Vec<f64> {
    let mut sorted_values = values.to_vec();
    sorted_values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));
    sorted_values
}

/// Median of already sorted values
///
/// The middle value for odd counts, the mean of the two middle values for even
/// counts, `None` when empty.
pub fn median_of_sorted(sorted_values: &[f64]) -> Option<f64> {
    let n = sorted_values.len();
    if n == 0 {
        return None;
    }
    if n % 2 == 1 {
        Some(sorted_values[n / 2])
    } else {
        Some((sorted_values[n / 2 - 1] + sorted_values[n / 2]) / 2.0)
    }
}

/// Calculate a percentile from already sorted values
///
/// Uses linear interpolation between the two closest ranks, so P50 of an even
/// count equals the median.
///
/// ## Algorithm Details
///
/// 1. **Index Calculation**: For percentile P, index = (P/100) * (N-1)
/// 2. **Interpolation**: If index is fractional, interpolate between adjacent values
/// 3. **Boundary Handling**: Clamps the percentile to [0, 100]
///
/// ## Examples
///
/// ```rust
/// # use method_bench::utils::percentile_of_sorted;
/// let values = vec![1.0, 2.0, 3.0, 4.0, 5.0];
/// assert_eq!(percentile_of_sorted(&values, 50.0), Some(3.0));
/// assert!((percentile_of_sorted(&values, 95.0).unwrap() - 4.8).abs() < 1e-9);
/// ```
pub fn percentile_of_sorted(sorted_values: &[f64], percentile: f64) -> Option<f64> {
    if sorted_values.is_empty() {
        return None;
    }

    let p = percentile.clamp(0.0, 100.0);
    let index = (p / 100.0) * (sorted_values.len() - 1) as f64;
    let lower_index = index.floor() as usize;
    let upper_index = index.ceil() as usize;

    if lower_index == upper_index {
        Some(sorted_values[lower_index])
    } else {
        let lower_value = sorted_values[lower_index];
        let upper_value = sorted_values[upper_index];
        let weight = index - lower_index as f64;
        Some(lower_value + weight * (upper_value - lower_value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_id_is_unique() {
        let a = generate_id();
        let b = generate_id();
        assert_ne!(a, b);
        assert_eq!(a.len(), 36);
    }

    #[test]
    fn test_digit_cycle_is_length_exact() {
        for len in [0usize, 1, 9, 10, 11, 13, 100, 1031] {
            let payload = digit_cycle(len);
            assert_eq!(payload.len(), len);
            assert!(payload.iter().enumerate().all(|(i, b)| *b == b'0' + (i % 10) as u8));
        }
        assert_eq!(digit_cycle(13), b"0123456789012".to_vec());
    }

    #[test]
    fn test_format_timestamp_layout() {
        let ts = chrono::Utc
            .with_ymd_and_hms(2024, 3, 9, 7, 5, 1)
            .single()
            .unwrap()
            + chrono::Duration::milliseconds(42);
        assert_eq!(format_timestamp(&ts), "2024/03/09-07:05:01.042");
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_nanos(500)), "500ns");
        assert_eq!(format_duration(Duration::from_nanos(1500)), "1.50μs");
        assert_eq!(format_duration(Duration::from_micros(1500)), "1.50ms");
        assert_eq!(format_duration(Duration::from_millis(1500)), "1.50s");
        assert_eq!(format_duration(Duration::from_secs(90)), "1m 30s");
        assert_eq!(format_duration(Duration::from_secs(3661)), "1h 1m 1s");
    }

    #[test]
    fn test_population_std_dev_divides_by_n() {
        let (mean, min, max, std_dev) = calculate_stats(&[10.0, 20.0]).unwrap();
        assert_eq!(mean, 15.0);
        assert_eq!(min, 10.0);
        assert_eq!(max, 20.0);
        assert_eq!(std_dev, 5.0);
    }

    #[test]
    fn test_stats_accept_negative_values() {
        let (mean, min, _, _) = calculate_stats(&[-3.0, 1.0]).unwrap();
        assert_eq!(mean, -1.0);
        assert_eq!(min, -3.0);
    }

    #[test]
    fn test_median() {
        assert_eq!(median_of_sorted(&[]), None);
        assert_eq!(median_of_sorted(&[4.0]), Some(4.0));
        assert_eq!(median_of_sorted(&[1.0, 2.0, 9.0]), Some(2.0));
        assert_eq!(median_of_sorted(&[1.0, 2.0, 4.0, 9.0]), Some(3.0));
        assert_eq!(median_of_sorted(&sorted(&[9.0, -1.0, 4.0])), Some(4.0));
    }

    #[test]
    fn test_percentiles() {
        let values = sorted(&[5.0, 1.0, 4.0, 2.0, 3.0]);
        assert_eq!(percentile_of_sorted(&values, 0.0), Some(1.0));
        assert_eq!(percentile_of_sorted(&values, 100.0), Some(5.0));
        assert_eq!(percentile_of_sorted(&values, 25.0), Some(2.0));
        assert_eq!(percentile_of_sorted(&[], 50.0), None);
        assert_eq!(percentile_of_sorted(&[7.0], 99.0), Some(7.0));
    }
}
