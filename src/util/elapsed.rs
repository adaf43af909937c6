use std::time::Duration;

const UNITS: [(&str, u64); 4] = [("day", 86_400), ("hour", 3_600), ("minute", 60), ("second", 1)];

/// Splits `elapsed` into days, hours, minutes and seconds, e.g. `1 hour 2 minutes 5 seconds`.
///
/// Units that are zero are left out, so anything below a second yields an empty string.
pub fn human_readable(elapsed: Duration) -> String {
    let mut rest = elapsed.as_secs();

    UNITS
        .iter()
        .filter_map(|&(unit, secs)| {
            let count = rest / secs;
            rest %= secs;
            match count {
                0 => None,
                1 => Some(format!("1 {unit}")),
                n => Some(format!("{n} {unit}s")),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Summary line logged at the end of every run.
pub fn summary(elapsed: Duration) -> String {
    let secs = elapsed.as_secs_f64();
    match human_readable(elapsed) {
        readable if readable.is_empty() => format!("Elapsed: {secs:.3} sec"),
        readable => format!("Elapsed: {secs:.3} sec ({readable})"),
    }
}
