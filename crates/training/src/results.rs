//! Fixed-width results lines and process memory reporting.

use crate::error::{TrainError, TrainResult};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use sysinfo::System;

/// C-style `%.{precision}g`.
pub fn format_g(value: f64, precision: usize) -> String {
    if value.is_nan() {
        return "nan".into();
    }
    if value.is_infinite() {
        return if value > 0.0 { "inf".into() } else { "-inf".into() };
    }
    if value == 0.0 {
        return "0".into();
    }
    let precision = precision.max(1);
    let sci = format!("{:.*e}", precision - 1, value);
    let (mantissa, exp) = match sci.split_once('e') {
        Some((m, e)) => (m.to_string(), e.parse::<i32>().unwrap_or(0)),
        None => (sci.clone(), 0),
    };
    if exp < -4 || exp >= precision as i32 {
        let sign = if exp < 0 { '-' } else { '+' };
        format!("{}e{sign}{:02}", strip_zeros(&mantissa), exp.abs())
    } else {
        let decimals = (precision as i32 - 1 - exp).max(0) as usize;
        strip_zeros(&format!("{value:.decimals$}"))
    }
}

fn strip_zeros(s: &str) -> String {
    if s.contains('.') {
        s.trim_end_matches('0').trim_end_matches('.').to_string()
    } else {
        s.to_string()
    }
}

/// `%10.3g`
pub fn g10(value: f64) -> String {
    format!("{:>10}", format_g(value, 3))
}

/// Resident memory of this process, formatted like `0.123G`.
pub fn memory_usage() -> String {
    let sys = System::new_all();
    let bytes = sysinfo::get_current_pid()
        .ok()
        .and_then(|pid| sys.process(pid).map(|p| p.memory()))
        .unwrap_or(0);
    format!("{}G", format_g(bytes as f64 / 1e9, 3))
}

/// Progress prefix: epoch, memory, 5 mean losses, target count, image size.
pub fn progress_line(
    epoch: usize,
    epochs: usize,
    mem: &str,
    mloss: &[f32; 5],
    targets: usize,
    img_size: usize,
) -> String {
    let mut s = format!("{:>10}{:>10}", format!("{epoch}/{}", epochs.saturating_sub(1)), mem);
    for v in mloss {
        s.push_str(&g10(*v as f64));
    }
    s.push_str(&g10(targets as f64));
    s.push_str(&g10(img_size as f64));
    s
}

/// Full results line: the progress prefix followed by the 7 evaluation values.
pub fn results_line(progress: &str, results: &[f64; 7]) -> String {
    let mut s = progress.to_string();
    for v in results {
        s.push_str(&g10(*v));
    }
    s
}

/// Header matching [`progress_line`] columns.
pub fn progress_header() -> String {
    [
        "Epoch", "gpu_mem", "GIoU", "obj", "cls", "total", "depth", "targets", "img_size",
    ]
    .iter()
    .map(|h| format!("{h:>10}"))
    .collect()
}

pub fn append_results(path: &Path, line: &str) -> TrainResult<()> {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(TrainError::io(path))?;
    writeln!(file, "{line}").map_err(TrainError::io(path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn g_format_matches_printf() {
        assert_eq!(format_g(0.0, 3), "0");
        assert_eq!(format_g(1.0, 3), "1");
        assert_eq!(format_g(0.123456, 3), "0.123");
        assert_eq!(format_g(12.5, 3), "12.5");
        assert_eq!(format_g(128.0, 3), "128");
        assert_eq!(format_g(1234.0, 3), "1.23e+03");
        assert_eq!(format_g(0.00001234, 3), "1.23e-05");
        assert_eq!(format_g(0.0001, 3), "0.0001");
        assert_eq!(format_g(999.9, 3), "1e+03");
        assert_eq!(format_g(f64::NAN, 3), "nan");
    }

    #[test]
    fn lines_are_fixed_width() {
        let p = progress_line(0, 2, "0.1G", &[1.0, 2.0, 3.0, 6.0, 0.5], 7, 128);
        assert_eq!(p.len(), 90);
        assert!(p.starts_with("       0/1"));
        let line = results_line(&p, &[0.0; 7]);
        assert_eq!(line.len(), 160);
        assert_eq!(line.split_whitespace().count(), 16);
    }
}
