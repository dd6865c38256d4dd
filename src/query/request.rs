//! Parser for the `R` request line (spec.md section 4.4):
//!
//! ```text
//! R <source> M <mask> <start> <end> <options>
//! source  = "F" | "D"[F<mask>] | "DD"[F<mask>]
//! start   = "T"<ISO-8601-datetime> | "S"<unix-seconds>[.nsec]
//! end     = "N"<u64 samples> | "E"<start-form timestamp>
//! options = [N][A][T[E|A]][Z][C[Z]]
//! ```
//!
//! The leading `R` byte is consumed by the command dispatcher (spec.md
//! section 4.6) before this parser ever sees the line.

use error::{Error, Result};
use mask::FilterMask;

/// Which archived source a read draws from.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SourceKind {
    Fa,
    D(FieldMask),
    Dd(FieldMask),
}

/// Selects which of {mean, min, max, std} a decimated read emits per
/// line (spec.md section 4.4 step 7, "the data-mask selects which of
/// {mean,min,max,std} are emitted").
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FieldMask(u8);

impl FieldMask {
    pub const MEAN: u8 = 0b0001;
    pub const MIN: u8 = 0b0010;
    pub const MAX: u8 = 0b0100;
    pub const STD: u8 = 0b1000;
    pub const ALL: FieldMask = FieldMask(0b1111);

    pub fn from_nibble(nibble: u8) -> Self {
        FieldMask(nibble & 0b1111)
    }

    pub fn has(&self, bit: u8) -> bool {
        self.0 & bit != 0
    }

    pub fn count(&self) -> usize {
        self.0.count_ones() as usize
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StartSpec {
    /// Microseconds since the Unix epoch.
    Timestamp(u64),
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EndSpec {
    Samples(u64),
    Timestamp(u64),
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ReadOptions {
    pub prepend_count: bool,
    pub accept_truncated: bool,
    pub include_timestamp: bool,
    pub extended_timestamp: bool,
    pub aggregate_timestamp: bool,
    pub include_id_zero: bool,
    pub require_contiguous: bool,
    pub id_zero_contiguity: bool,
}

#[derive(Clone, Debug)]
pub struct Request {
    pub source: SourceKind,
    pub mask: FilterMask,
    pub start: StartSpec,
    pub end: EndSpec,
    pub options: ReadOptions,
}

pub fn parse(line: &str, fa_entry_count: usize) -> Result<Request> {
    let mut s = line;

    let source = if let Some(rest) = s.strip_prefix("DD") {
        s = rest;
        SourceKind::Dd(take_field_mask(&mut s))
    } else if let Some(rest) = s.strip_prefix('D') {
        s = rest;
        SourceKind::D(take_field_mask(&mut s))
    } else if let Some(rest) = s.strip_prefix('F') {
        s = rest;
        SourceKind::Fa
    } else {
        return Err(bad("expected source specifier F, D, or DD"));
    };

    s = s.strip_prefix('M').ok_or_else(|| bad("expected 'M' mask marker"))?;
    let mask_end = s
        .find(|c: char| !(c.is_ascii_digit() || c == '-' || c == ','))
        .unwrap_or_else(|| s.len());
    let (mask_str, rest) = s.split_at(mask_end);
    let mask = FilterMask::parse(mask_str, fa_entry_count).map_err(|reason| Error::BadRequest { reason })?;
    s = rest;

    let (start, rest) = parse_timestamp_token(s)?;
    s = rest;
    let start = StartSpec::Timestamp(start);

    let (end, rest) = parse_end_token(s)?;
    s = rest;

    let options = parse_options(s)?;

    Ok(Request {
        source,
        mask,
        start,
        end,
        options,
    })
}

fn take_field_mask(s: &mut &str) -> FieldMask {
    if let Some(rest) = s.strip_prefix('F') {
        if let Some(c) = rest.chars().next() {
            if let Some(nibble) = c.to_digit(16) {
                *s = &rest[c.len_utf8()..];
                return FieldMask::from_nibble(nibble as u8);
            }
        }
    }
    FieldMask::ALL
}

/// Parses a `start`-form timestamp token (`T...` or `S...`), returning
/// the resolved microsecond value and the unconsumed remainder.
fn parse_timestamp_token(s: &str) -> Result<(u64, &str)> {
    if let Some(rest) = s.strip_prefix('S') {
        let end = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or_else(|| rest.len());
        let (num, remainder) = rest.split_at(end);
        let us = parse_unix_seconds(num)?;
        Ok((us, remainder))
    } else if let Some(rest) = s.strip_prefix('T') {
        // ISO-8601 datetimes contain no 'N' or 'E'; those letters safely
        // delimit the end-token that follows.
        let end = rest.find(|c: char| c == 'N' || c == 'E').unwrap_or_else(|| rest.len());
        let (iso, remainder) = rest.split_at(end);
        let us = parse_iso8601(iso)?;
        Ok((us, remainder))
    } else {
        Err(bad("expected start specifier T or S"))
    }
}

fn parse_end_token(s: &str) -> Result<(EndSpec, &str)> {
    if let Some(rest) = s.strip_prefix('N') {
        let end = rest.find(|c: char| !c.is_ascii_digit()).unwrap_or_else(|| rest.len());
        let (num, remainder) = rest.split_at(end);
        let samples = num.parse::<u64>().map_err(|_| bad("invalid sample count"))?;
        Ok((EndSpec::Samples(samples), remainder))
    } else if let Some(rest) = s.strip_prefix('E') {
        let (us, remainder) = parse_timestamp_token_from(rest)?;
        Ok((EndSpec::Timestamp(us), remainder))
    } else {
        Err(bad("expected end specifier N or E"))
    }
}

fn parse_timestamp_token_from(s: &str) -> Result<(u64, &str)> {
    parse_timestamp_token(s)
}

fn parse_options(s: &str) -> Result<ReadOptions> {
    let mut options = ReadOptions::default();
    let mut chars = s.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            'N' => options.prepend_count = true,
            'A' => options.accept_truncated = true,
            'T' => {
                options.include_timestamp = true;
                match chars.peek() {
                    Some('E') => {
                        options.extended_timestamp = true;
                        chars.next();
                    }
                    Some('A') => {
                        options.aggregate_timestamp = true;
                        chars.next();
                    }
                    _ => {}
                }
            }
            'Z' => options.include_id_zero = true,
            'C' => {
                options.require_contiguous = true;
                if let Some('Z') = chars.peek() {
                    options.id_zero_contiguity = true;
                    chars.next();
                }
            }
            other => return Err(bad(&format!("unknown option flag {:?}", other))),
        }
    }
    Ok(options)
}

fn parse_unix_seconds(s: &str) -> Result<u64> {
    let mut parts = s.splitn(2, '.');
    let secs: u64 = parts.next().unwrap_or("").parse().map_err(|_| bad("invalid seconds"))?;
    let nsec_str = parts.next().unwrap_or("0");
    let nsec_digits = format!("{:0<9}", nsec_str).chars().take(9).collect::<String>();
    let nsec: u64 = nsec_digits.parse().map_err(|_| bad("invalid fractional seconds"))?;
    Ok(secs * 1_000_000 + nsec / 1_000)
}

/// Minimal UTC `YYYY-MM-DDTHH:MM:SS[.ffffff]Z` parser producing Unix
/// microseconds, using the Howard Hinnant `days_from_civil` algorithm so
/// this crate doesn't need a calendar dependency for one protocol field.
fn parse_iso8601(s: &str) -> Result<u64> {
    let bytes = s.as_bytes();
    if bytes.len() < 19 {
        return Err(bad("ISO-8601 timestamp too short"));
    }
    let year: i64 = s[0..4].parse().map_err(|_| bad("invalid year"))?;
    let month: i64 = s[5..7].parse().map_err(|_| bad("invalid month"))?;
    let day: i64 = s[8..10].parse().map_err(|_| bad("invalid day"))?;
    let hour: i64 = s[11..13].parse().map_err(|_| bad("invalid hour"))?;
    let minute: i64 = s[14..16].parse().map_err(|_| bad("invalid minute"))?;
    let second: i64 = s[17..19].parse().map_err(|_| bad("invalid second"))?;

    let mut frac_us = 0u64;
    let rest = &s[19..];
    if let Some(rest) = rest.strip_prefix('.') {
        let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
        let padded = format!("{:0<6}", digits).chars().take(6).collect::<String>();
        frac_us = padded.parse().unwrap_or(0);
    }

    let days = days_from_civil(year, month, day);
    let day_us = (((hour * 60 + minute) * 60) + second) as i64 * 1_000_000;
    let total_us = days * 86_400_000_000i64 + day_us + frac_us as i64;
    if total_us < 0 {
        return Err(bad("timestamp predates the Unix epoch"));
    }
    Ok(total_us as u64)
}

/// `days_from_civil`, per Howard Hinnant's public-domain `chrono`-less
/// civil calendar algorithm: days since 1970-01-01 for a proleptic
/// Gregorian (y, m, d).
fn days_from_civil(y: i64, m: i64, d: i64) -> i64 {
    let y = if m <= 2 { y - 1 } else { y };
    let era = if y >= 0 { y } else { y - 399 } / 400;
    let yoe = (y - era * 400) as i64;
    let mp = (m + 9) % 12;
    let doy = (153 * mp + 2) / 5 + d - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    era * 146_097 + doe - 719_468
}

fn bad(reason: &str) -> Error {
    Error::BadRequest {
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_literal_scenario_2() {
        let req = parse("FM0-3S1.000000N16NT", 8).unwrap();
        assert_eq!(req.source, SourceKind::Fa);
        assert_eq!(req.mask.count(), 4);
        assert_eq!(req.start, StartSpec::Timestamp(1_000_000));
        assert_eq!(req.end, EndSpec::Samples(16));
        assert!(req.options.prepend_count);
        assert!(req.options.include_timestamp);
        assert!(!req.options.extended_timestamp);
    }

    #[test]
    fn parses_literal_scenario_3() {
        let req = parse("FM0-3S1.000000N64CN", 8).unwrap();
        assert_eq!(req.end, EndSpec::Samples(64));
        assert!(req.options.require_contiguous);
        assert!(req.options.prepend_count);
    }

    #[test]
    fn parses_decimated_source_with_field_mask() {
        let req = parse("DF3M0-3S0N10", 8).unwrap();
        match req.source {
            SourceKind::D(fields) => {
                assert!(fields.has(FieldMask::MEAN));
                assert!(fields.has(FieldMask::MIN));
                assert!(!fields.has(FieldMask::MAX));
            }
            _ => panic!("expected D source"),
        }
    }

    #[test]
    fn parses_double_decimated_default_field_mask() {
        let req = parse("DDM0-3S0N10", 8).unwrap();
        match req.source {
            SourceKind::Dd(fields) => assert_eq!(fields.count(), 4),
            _ => panic!("expected DD source"),
        }
    }

    #[test]
    fn parses_extended_timestamp_option() {
        let req = parse("FM0-3S0N10TE", 8).unwrap();
        assert!(req.options.include_timestamp);
        assert!(req.options.extended_timestamp);
    }

    #[test]
    fn iso8601_round_trips_known_instant() {
        let us = parse_iso8601("1970-01-01T00:00:01Z").unwrap();
        assert_eq!(us, 1_000_000);
    }

    #[test]
    fn rejects_bad_mask() {
        assert!(parse("FM99S0N10", 8).is_err());
    }
}
