/// Parse a byte count with an optional binary unit suffix.
///
/// Accepts `b`, `k`/`kb`/`kib`, `m`/`mb`/`mib`, `g`/`gb`/`gib`, `t`/`tb`/`tib`,
/// case-insensitive, with an optional fractional part: "64kb", "1.5GiB", "4096".
pub fn parse_size(s: &str) -> Result<u64, String> {
    let s = s.trim();
    let boundary = s
        .find(|c: char| c.is_ascii_alphabetic())
        .unwrap_or(s.len());
    let (num_str, unit_str) = s.split_at(boundary);
    let num_str = num_str.trim();
    if num_str.is_empty() {
        return Err(format!("Missing number in size '{s}'"));
    }

    let shift = match unit_str.trim().to_ascii_lowercase().as_str() {
        "" | "b" => 0,
        "k" | "kb" | "kib" => 10,
        "m" | "mb" | "mib" => 20,
        "g" | "gb" | "gib" => 30,
        "t" | "tb" | "tib" => 40,
        other => {
            return Err(format!(
                "Unknown unit: '{other}'. Use b, kb, mb, gb or tb"
            ));
        }
    };

    if let Ok(whole) = num_str.parse::<u64>() {
        return whole
            .checked_mul(1u64 << shift)
            .ok_or_else(|| format!("Size '{s}' overflows u64"));
    }

    let value: f64 = num_str
        .parse()
        .map_err(|_| format!("Invalid number: '{num_str}'"))?;
    if !value.is_finite() || value < 0.0 {
        return Err(format!("Size must be a non-negative number, got '{num_str}'"));
    }
    let bytes = value * (1u64 << shift) as f64;
    if bytes >= u64::MAX as f64 {
        return Err(format!("Size '{s}' overflows u64"));
    }
    Ok(bytes as u64)
}

/// [`parse_size`] for sizes that must be addressable in memory.
pub fn parse_memory_size(s: &str) -> Result<usize, String> {
    let bytes = parse_size(s)?;
    usize::try_from(bytes).map_err(|_| format!("Size {bytes} bytes exceeds the address space"))
}
