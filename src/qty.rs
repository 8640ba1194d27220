// see [Definitions of the SI units: The binary prefixes](https://physics.nist.gov/cuu/Units/binary.html)
// see [Managing Compute Resources for Containers - Kubernetes](https://kubernetes.io/docs/concepts/configuration/manage-compute-resources-container/)
//! Conversion between resource-quantity strings and the two canonical units
//! used everywhere else in the crate: millicores (cpu) and bytes (memory).

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Cpu,
    Memory,
}

impl std::fmt::Display for Kind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cpu => f.write_str("cpu"),
            Self::Memory => f.write_str("memory"),
        }
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("Failed to parse {kind} quantity from '{input}'")]
    ParseError { kind: Kind, input: String },
}

impl Error {
    fn cpu(input: &str) -> Self {
        Error::ParseError {
            kind: Kind::Cpu,
            input: input.to_owned(),
        }
    }

    fn memory(input: &str) -> Self {
        Error::ParseError {
            kind: Kind::Memory,
            input: input.to_owned(),
        }
    }
}

const KIB: f64 = 1024.0;
const KB: f64 = 1000.0;

// Order matters: two-letter suffixes must be tried before their one-letter tail.
// "KB", "MB", "GB" are the labels produced by `format_memory`, so they are binary.
static MEMORY_SUFFIXES: [(&str, f64); 16] = [
    ("KI", KIB),
    ("MI", KIB * KIB),
    ("GI", KIB * KIB * KIB),
    ("TI", KIB * KIB * KIB * KIB),
    ("PI", KIB * KIB * KIB * KIB * KIB),
    ("EI", KIB * KIB * KIB * KIB * KIB * KIB),
    ("KB", KIB),
    ("MB", KIB * KIB),
    ("GB", KIB * KIB * KIB),
    ("K", KB),
    ("M", KB * KB),
    ("G", KB * KB * KB),
    ("T", KB * KB * KB * KB),
    ("P", KB * KB * KB * KB * KB),
    ("E", KB * KB * KB * KB * KB * KB),
    ("B", 1.0),
];

fn parse_non_negative_f64(s: &str) -> Option<f64> {
    s.trim()
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite() && *v >= 0.0)
}

fn parse_non_negative_i64(s: &str) -> Option<i64> {
    s.trim().parse::<i64>().ok().filter(|v| *v >= 0)
}

fn to_i64(v: f64) -> Option<i64> {
    // `as` saturates, so reject anything that would not fit instead of clamping
    if v < i64::MAX as f64 {
        Some(v as i64)
    } else {
        None
    }
}

/// Parse a cpu quantity into millicores.
///
/// Accepted forms: `"250m"` (millicores), `"1.5"` or `"2"` (cores), `"2 cores"`,
/// and the sub-milli suffixes `n`/`u` reported by metrics-server, rounded up to
/// the next millicore. Decimal cores are truncated.
pub fn parse_cpu(input: &str) -> Result<i64, Error> {
    let s = input.trim();
    if s.is_empty() {
        return Ok(0);
    }
    let err = || Error::cpu(input);
    if let Some(cores) = s.strip_suffix("cores").or_else(|| s.strip_suffix("core")) {
        let cores = parse_non_negative_f64(cores).ok_or_else(err)?;
        return to_i64(cores * 1000.0).ok_or_else(err);
    }
    if let Some(millis) = s.strip_suffix('m') {
        return parse_non_negative_i64(millis).ok_or_else(err);
    }
    if let Some(micros) = s.strip_suffix('u') {
        let micros = parse_non_negative_i64(micros).ok_or_else(err)?;
        return Ok(div_ceil(micros, 1_000));
    }
    if let Some(nanos) = s.strip_suffix('n') {
        let nanos = parse_non_negative_i64(nanos).ok_or_else(err)?;
        return Ok(div_ceil(nanos, 1_000_000));
    }
    let cores = parse_non_negative_f64(s).ok_or_else(err)?;
    to_i64(cores * 1000.0).ok_or_else(err)
}

fn div_ceil(v: i64, by: i64) -> i64 {
    v / by + i64::from(v % by != 0)
}

/// Parse a memory quantity into bytes.
///
/// Suffixes are case-insensitive: `Ki/Mi/Gi/...` are powers of 1024, `K/M/G/...`
/// powers of 1000. Without suffix the value is a whole number of bytes.
pub fn parse_memory(input: &str) -> Result<i64, Error> {
    let s = input.trim();
    if s.is_empty() {
        return Ok(0);
    }
    let err = || Error::memory(input);
    let upper = s.to_ascii_uppercase();
    for (suffix, multiplier) in MEMORY_SUFFIXES.iter() {
        if let Some(num) = upper.strip_suffix(suffix) {
            if *suffix == "B" {
                return parse_non_negative_i64(num).ok_or_else(err);
            }
            let v = parse_non_negative_f64(num).ok_or_else(err)?;
            return to_i64(v * multiplier).ok_or_else(err);
        }
    }
    parse_non_negative_i64(&upper).ok_or_else(err)
}

// Kubernetes `resource.Quantity` grammar: `<decimal><suffix>`, suffix is case-sensitive,
// one of `n u m "" k M G T P E`, `Ki Mi Gi Ti Pi Ei`, or a decimal exponent `e<int>` / `E<int>`.
fn kube_scaled(input: &str, kind: Kind, scale10: i32) -> Result<i64, Error> {
    let err = || Error::ParseError {
        kind,
        input: input.to_owned(),
    };
    let s = input.trim();
    if s.is_empty() {
        return Ok(0);
    }
    let s = s.strip_prefix('+').unwrap_or(s);
    let number_len = s
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(s.len());
    let (number, suffix) = s.split_at(number_len);
    let (int_part, frac_part) = number.split_once('.').unwrap_or((number, ""));
    if (int_part.is_empty() && frac_part.is_empty()) || frac_part.contains('.') {
        return Err(err());
    }
    let (exp10, exp2) = match suffix {
        "" => (0, 0),
        "n" => (-9, 0),
        "u" => (-6, 0),
        "m" => (-3, 0),
        "k" => (3, 0),
        "M" => (6, 0),
        "G" => (9, 0),
        "T" => (12, 0),
        "P" => (15, 0),
        "E" => (18, 0),
        "Ki" => (0, 10),
        "Mi" => (0, 20),
        "Gi" => (0, 30),
        "Ti" => (0, 40),
        "Pi" => (0, 50),
        "Ei" => (0, 60),
        other => {
            let exp = other
                .strip_prefix(['e', 'E'])
                .and_then(|e| e.parse::<i32>().ok())
                .filter(|e| e.abs() <= 64)
                .ok_or_else(err)?;
            (exp, 0)
        }
    };
    let mantissa: i128 = [int_part, frac_part]
        .concat()
        .parse()
        .map_err(|_| err())?;
    let scaled = mantissa.checked_mul(1i128 << exp2).ok_or_else(err)?;
    let exp = exp10 + scale10 - frac_part.len() as i32;
    let value = if exp >= 0 {
        10i128
            .checked_pow(exp.unsigned_abs())
            .and_then(|p| scaled.checked_mul(p))
    } else {
        // rounded up, like Quantity.Value() / MilliValue()
        match 10i128.checked_pow(exp.unsigned_abs()) {
            Some(p) => Some(scaled / p + i128::from(scaled % p != 0)),
            None => Some(i128::from(scaled > 0)),
        }
    };
    value
        .and_then(|v| i64::try_from(v).ok())
        .ok_or_else(err)
}

/// Millicores of a Kubernetes cpu quantity (`"250m"`, `"1.5"`, `"120000000n"`), rounded up.
pub fn kube_millicores(input: &str) -> Result<i64, Error> {
    kube_scaled(input, Kind::Cpu, 3)
}

/// Bytes of a Kubernetes memory quantity (`"64Mi"`, `"129M"`, `"129e6"`, `"500m"` is 1 byte).
pub fn kube_bytes(input: &str) -> Result<i64, Error> {
    kube_scaled(input, Kind::Memory, 0)
}

/// `"<n>m"` below one core, `"<cores with 2 decimals> cores"` from one core up.
pub fn format_cpu(millicores: i64) -> String {
    if millicores >= 1000 {
        format!("{:.2} cores", millicores as f64 / 1000.0)
    } else {
        format!("{}m", millicores)
    }
}

/// Largest binary unit (KB = 1024 bytes) with a value of at least 1, 2 decimals.
pub fn format_memory(bytes: i64) -> String {
    const KB: i64 = 1024;
    const MB: i64 = 1024 * KB;
    const GB: i64 = 1024 * MB;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}
