use std::time::Duration;

/// Human-readable duration for logs: `850ms`, `2.50s`, `5m`, `4m 30s`.
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    if secs == 0 {
        return format!("{}ms", duration.subsec_millis());
    }
    if secs < 60 {
        return format!("{:.2}s", duration.as_secs_f64());
    }

    let (minutes, seconds) = (secs / 60, secs % 60);
    match seconds {
        0 => format!("{minutes}m"),
        _ => format!("{minutes}m {seconds}s"),
    }
}

/// Human-readable size in binary units: `512 B`, `48.0 KiB`, `1.2 MiB`.
pub fn format_bytes(bytes: usize) -> String {
    const UNITS: [&str; 4] = ["KiB", "MiB", "GiB", "TiB"];

    if bytes < 1024 {
        return format!("{bytes} B");
    }

    let mut size = bytes as f64 / 1024.0;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    format!("{:.1} {}", size, UNITS[unit])
}
