//! Line assembler: raw serial bytes → finalized [`Measurement`]s
//!
//! The device prints weight, volume and fee on separate lines, in no fixed
//! order, interleaved with diagnostic chatter. Each completed line is
//! matched against the known field patterns; as soon as weight, volume and
//! price are all present the accumulation is finalized and reset.

use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use scalefeed_store::Measurement;
use tracing::{trace, warn};

/// Longest partial line kept while waiting for a line break.
pub const MAX_PARTIAL_LINE: usize = 4096;

static WEIGHT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:average\s+)?weight:\s*(-?\d+(?:\.\d+)?)").expect("valid weight pattern")
});

static VOLUME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:average\s+)?volume:\s*(-?\d+(?:\.\d+)?)").expect("valid volume pattern")
});

static PRICE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)fee:\s*rs\.?\s*(-?\d+(?:\.\d+)?)").expect("valid price pattern")
});

static FEE_TYPE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bT\s*=\s*([A-Z])").expect("valid fee type pattern"));

/// A field recognized on a single line.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Field {
    Weight(f64),
    Volume(f64),
    Price(f64),
    FeeType(char),
}

fn capture_number(re: &Regex, line: &str) -> Option<f64> {
    let raw = re.captures(line)?.get(1)?.as_str();
    raw.parse::<f64>().ok().filter(|value| value.is_finite())
}

/// Extract every recognized field from one line.
///
/// Patterns are matched independently, so a line may carry several fields.
/// Numbers that do not parse to a finite value are omitted.
pub fn parse_line(line: &str) -> Vec<Field> {
    let mut fields = Vec::new();

    if let Some(weight) = capture_number(&WEIGHT_RE, line) {
        fields.push(Field::Weight(weight));
    }
    if let Some(volume) = capture_number(&VOLUME_RE, line) {
        fields.push(Field::Volume(volume));
    }
    if let Some(price) = capture_number(&PRICE_RE, line) {
        fields.push(Field::Price(price));
    }
    if let Some(code) = FEE_TYPE_RE
        .captures(line)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().chars().next())
    {
        fields.push(Field::FeeType(code.to_ascii_uppercase()));
    }

    fields
}

/// In-progress fields of the next measurement.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Accumulation {
    pub weight: Option<f64>,
    pub volume: Option<f64>,
    pub price: Option<f64>,
    pub fee_type: Option<char>,
}

impl Accumulation {
    pub fn apply(&mut self, field: Field) {
        match field {
            Field::Weight(v) => self.weight = Some(v),
            Field::Volume(v) => self.volume = Some(v),
            Field::Price(v) => self.price = Some(v),
            Field::FeeType(code) => self.fee_type = Some(code),
        }
    }

    /// Weight, volume and price are all set.
    pub fn is_complete(&self) -> bool {
        self.weight.is_some() && self.volume.is_some() && self.price.is_some()
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Convert a complete accumulation into a measurement and reset it.
    ///
    /// Returns `None`, leaving the accumulation untouched, if a required
    /// field is still missing.
    pub fn finalize(&mut self, timestamp: DateTime<Utc>) -> Option<Measurement> {
        let (Some(weight), Some(volume), Some(price)) = (self.weight, self.volume, self.price)
        else {
            return None;
        };

        let measurement = Measurement {
            weight,
            volume,
            price,
            fee_type: self.fee_type,
            timestamp,
        };
        *self = Self::default();
        Some(measurement)
    }
}

/// Stateful byte-stream to measurement converter.
#[derive(Debug, Default)]
pub struct MeasurementAssembler {
    /// Bytes of the current, not yet terminated line
    partial: Vec<u8>,
    accumulation: Accumulation,
}

impl MeasurementAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk of bytes from the link.
    ///
    /// Returns the measurements finalized by the lines this chunk completed,
    /// in line order. A trailing partial line is kept for the next call.
    pub fn consume(&mut self, chunk: &[u8]) -> Vec<Measurement> {
        let mut buffer = std::mem::take(&mut self.partial);
        buffer.extend_from_slice(chunk);

        let mut measurements = Vec::new();
        let mut start = 0;
        while let Some(offset) = buffer[start..].iter().position(|&b| b == b'\n') {
            let end = start + offset;
            let raw = &buffer[start..end];
            let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
            let line = String::from_utf8_lossy(raw);

            if let Some(measurement) = self.consume_line(&line) {
                measurements.push(measurement);
            }
            start = end + 1;
        }
        buffer.drain(..start);

        if buffer.len() > MAX_PARTIAL_LINE {
            warn!(
                "Discarding {} bytes of unterminated link output",
                buffer.len()
            );
            buffer.clear();
        }
        self.partial = buffer;

        measurements
    }

    /// Process one complete line (without its terminator).
    pub fn consume_line(&mut self, line: &str) -> Option<Measurement> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }

        let fields = parse_line(line);
        if fields.is_empty() {
            trace!("Ignoring line: {}", line);
            return None;
        }

        for field in fields {
            self.accumulation.apply(field);
        }

        if self.accumulation.is_complete() {
            self.accumulation.finalize(Utc::now())
        } else {
            None
        }
    }

    pub fn accumulation(&self) -> &Accumulation {
        &self.accumulation
    }

    /// Bytes held for an unterminated line.
    pub fn partial_len(&self) -> usize {
        self.partial.len()
    }

    /// Drop the partial line and any accumulated fields.
    pub fn reset(&mut self) {
        self.partial.clear();
        self.accumulation = Accumulation::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_line_fields() {
        assert_eq!(parse_line("Average Weight: 1.25"), vec![Field::Weight(1.25)]);
        assert_eq!(parse_line("weight:3"), vec![Field::Weight(3.0)]);
        assert_eq!(parse_line("AVERAGE VOLUME: 420.5"), vec![Field::Volume(420.5)]);
        assert_eq!(parse_line("Fee: Rs. 150.00"), vec![Field::Price(150.0)]);
        assert_eq!(parse_line("fee: rs 99"), vec![Field::Price(99.0)]);
        assert_eq!(parse_line("T=b"), vec![Field::FeeType('B')]);
        assert_eq!(parse_line("Type T = C"), vec![Field::FeeType('C')]);
    }

    #[test]
    fn test_parse_line_ignores_noise() {
        assert!(parse_line("HX711 calibration done").is_empty());
        assert!(parse_line("Fee: 150").is_empty(), "currency prefix is required");
        assert!(parse_line("PRESET=5").is_empty());
        assert!(parse_line("Weight: abc").is_empty());
    }

    #[test]
    fn test_parse_line_multiple_fields() {
        let fields = parse_line("Weight: 2.5 Volume: 300 Fee: Rs 75 T=A");
        assert_eq!(
            fields,
            vec![
                Field::Weight(2.5),
                Field::Volume(300.0),
                Field::Price(75.0),
                Field::FeeType('A'),
            ]
        );
    }

    #[test]
    fn test_non_finite_number_is_not_present() {
        let huge = format!("Weight: {}", "9".repeat(400));
        assert!(parse_line(&huge).is_empty());

        let mut assembler = MeasurementAssembler::new();
        assembler.consume_line("Weight: 4.0");
        assembler.consume_line(&huge);
        assert_eq!(assembler.accumulation().weight, Some(4.0));
    }

    #[test]
    fn test_finalizes_when_all_required_fields_seen() {
        let mut assembler = MeasurementAssembler::new();
        assert!(assembler.consume_line("Volume: 300").is_none());
        assert!(assembler.consume_line("T=A").is_none());
        assert!(assembler.consume_line("Fee: Rs 75").is_none());

        let m = assembler.consume_line("Average Weight: 2.5").unwrap();
        assert_eq!(m.weight, 2.5);
        assert_eq!(m.volume, 300.0);
        assert_eq!(m.price, 75.0);
        assert_eq!(m.fee_type, Some('A'));
        assert!(assembler.accumulation().is_empty());
    }

    #[test]
    fn test_fee_type_defaults_to_unknown() {
        let mut assembler = MeasurementAssembler::new();
        let out = assembler.consume(b"Weight: 1\nVolume: 2\nFee: Rs 3\n");
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].fee_type, None);
        assert_eq!(out[0].fee_type_label(), "unknown");
    }

    #[test]
    fn test_consecutive_sets_yield_distinct_measurements() {
        let mut assembler = MeasurementAssembler::new();
        let out = assembler.consume(
            b"Weight: 1\nVolume: 10\nFee: Rs 5\nT=B\nWeight: 2\nVolume: 20\nFee: Rs 6\n",
        );
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].weight, 1.0);
        assert_eq!(out[0].fee_type, None);
        assert_eq!(out[1].weight, 2.0);
        assert_eq!(out[1].volume, 20.0);
        // The category seen after the first finalization belongs to the second
        assert_eq!(out[1].fee_type, Some('B'));
    }

    #[test]
    fn test_repeated_field_overwrites() {
        let mut assembler = MeasurementAssembler::new();
        let out = assembler.consume(b"Weight: 1\nWeight: 1.5\nVolume: 10\nFee: Rs 5\n");
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].weight, 1.5);
    }

    #[test]
    fn test_partial_line_retained_across_chunks() {
        let mut assembler = MeasurementAssembler::new();
        assert!(assembler.consume(b"Weight: 1.2\r\nVolu").is_empty());
        assert_eq!(assembler.partial_len(), 4);
        assert!(assembler.consume(b"me: 35").is_empty());
        assert!(assembler.consume(b"0\r\nFee: Rs").is_empty());

        let out = assembler.consume(b" 40\r\n");
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].volume, 350.0);
        assert_eq!(out[0].price, 40.0);
        assert_eq!(assembler.partial_len(), 0);
    }

    #[test]
    fn test_multibyte_split_across_chunks() {
        let mut assembler = MeasurementAssembler::new();
        let line = "Fee: Rs 12 ₹\n".as_bytes();
        let split = line.len() - 2;
        assembler.consume(b"Weight: 1\nVolume: 2\n");
        assert!(assembler.consume(&line[..split]).is_empty());
        let out = assembler.consume(&line[split..]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].price, 12.0);
    }

    #[test]
    fn test_incomplete_set_emits_nothing() {
        let mut assembler = MeasurementAssembler::new();
        let out = assembler.consume(b"Weight: 1\nnoise\nVolume: 2\nT=C\n");
        assert!(out.is_empty());
        assert_eq!(assembler.accumulation().fee_type, Some('C'));
        assert!(!assembler.accumulation().is_complete());
    }

    #[test]
    fn test_runaway_partial_line_is_dropped() {
        let mut assembler = MeasurementAssembler::new();
        let noise = vec![b'x'; MAX_PARTIAL_LINE + 1];
        assembler.consume(&noise);
        assert_eq!(assembler.partial_len(), 0);

        let out = assembler.consume(b"Weight: 1\nVolume: 2\nFee: Rs 3\n");
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn test_reset_clears_state() {
        let mut assembler = MeasurementAssembler::new();
        assembler.consume(b"Weight: 1\nVolu");
        assembler.reset();
        assert!(assembler.accumulation().is_empty());
        assert_eq!(assembler.partial_len(), 0);
    }
}
