use std::time::Duration;

pub(crate) fn human_size(bytes: impl humansize::ToF64 + humansize::Unsigned) -> String {
    humansize::format_size(bytes, humansize::BINARY)
}

pub(crate) fn human_duration(duration: Duration) -> String {
    timeago::Formatter::new()
        .num_items(2)
        .ago("")
        .convert(duration)
        .trim_end()
        .to_owned()
}

/// Throughput in a form of `{size}/s`
pub(crate) fn human_throughput(bytes_per_sec: f64) -> String {
    // Truncation is intended, nobody cares about fractions of a byte
    format!("{}/s", human_size(bytes_per_sec.max(0.0) as u64))
}
