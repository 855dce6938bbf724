/// SI prefixes from smallest to largest scale.
const SI_PREFIXES: [(f64, &str); 8] = [
    (1e-12, "p"),
    (1e-9, "n"),
    (1e-6, "µ"),
    (1e-3, "m"),
    (1.0, ""),
    (1e3, "k"),
    (1e6, "M"),
    (1e9, "G"),
];

/// Renders a reading as `"<number> <prefix><unit>"`, e.g. `1500 V` -> `"1.5 kV"`.
/// A missing reading becomes `"-- <unit>"`.
pub fn format_value(value: Option<f64>, unit: &str) -> String {
    let Some(value) = value else {
        return format!("-- {unit}").trim().to_owned();
    };
    let magnitude = value.abs();
    let (base, prefix) = SI_PREFIXES
        .iter()
        .rev()
        .find(|(base, _)| magnitude >= *base || (magnitude == 0.0 && *base == 1.0))
        .copied()
        .unwrap_or((1.0, ""));
    let scaled = value / base;
    let number = if scaled.abs() >= 100.0 {
        format!("{scaled:.0}")
    } else if scaled.abs() >= 10.0 {
        format!("{scaled:.1}")
    } else {
        format!("{scaled:.3}")
            .trim_end_matches('0')
            .trim_end_matches('.')
            .to_owned()
    };
    format!("{number} {prefix}{unit}").trim().to_owned()
}
