//! Latency histogram with O(1) update and bounded memory.
//!
//! Samples are microseconds (the aggregation-wide unit; nanosecond totals
//! would roll over a u64 after ~292 years of accumulated time). Small
//! sample sets stay as raw values; past the raw cap the buffer migrates to
//! an HdrHistogram with 2 significant figures, good for ~1% relative error
//! at every magnitude up to 10^12 μs.

use hdrhistogram::serialization::{Deserializer, Serializer, V2Serializer};
use hdrhistogram::Histogram;
use thiserror::Error;
use tracing::warn;

/// Raw values kept before migrating to the histogram representation.
const RAW_CAP: usize = 1024;

/// Highest trackable value: 10^12 μs (≈ 11.5 days).
const MAX_VALUE_MICROS: u64 = 1_000_000_000_000;

const SIGNIFICANT_FIGURES: u8 = 2;

const FORMAT_RAW: u8 = 0;
const FORMAT_HDR: u8 = 1;

#[derive(Debug, Error)]
pub enum HistogramCodecError {
    #[error("empty histogram buffer")]
    Empty,
    #[error("unknown histogram format tag {0}")]
    UnknownFormat(u8),
    #[error("truncated histogram buffer")]
    Truncated,
    #[error("hdr histogram decode failed: {0}")]
    Hdr(String),
}

/// Lazily-upgrading latency histogram.
#[derive(Debug, Clone)]
pub struct LazyHistogram {
    repr: Repr,
}

#[derive(Debug, Clone)]
enum Repr {
    Values(Vec<u64>),
    Hdr(Box<Histogram<u64>>),
}

impl Default for LazyHistogram {
    fn default() -> Self {
        Self::new()
    }
}

impl LazyHistogram {
    pub fn new() -> Self {
        Self {
            repr: Repr::Values(Vec::new()),
        }
    }

    /// Record one sample in microseconds, clamped to the trackable range.
    pub fn add(&mut self, value_micros: u64) {
        let value = value_micros.min(MAX_VALUE_MICROS);
        match &mut self.repr {
            Repr::Values(values) => {
                values.push(value);
                if values.len() > RAW_CAP {
                    let mut histogram = new_histogram();
                    for &v in values.iter() {
                        histogram.saturating_record(v);
                    }
                    self.repr = Repr::Hdr(Box::new(histogram));
                }
            }
            Repr::Hdr(histogram) => histogram.saturating_record(value),
        }
    }

    pub fn count(&self) -> u64 {
        match &self.repr {
            Repr::Values(values) => values.len() as u64,
            Repr::Hdr(histogram) => histogram.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    /// Fold another histogram into this one.
    pub fn merge(&mut self, other: &LazyHistogram) {
        match &other.repr {
            Repr::Values(values) => {
                for &value in values {
                    self.add(value);
                }
            }
            Repr::Hdr(other_histogram) => {
                if let Repr::Values(values) = &self.repr {
                    let mut histogram = new_histogram();
                    for &value in values {
                        histogram.saturating_record(value);
                    }
                    self.repr = Repr::Hdr(Box::new(histogram));
                }
                if let Repr::Hdr(histogram) = &mut self.repr {
                    if let Err(err) = histogram.add(&**other_histogram) {
                        warn!(error = %err, "histogram merge failed");
                    }
                }
            }
        }
    }

    /// Value at percentile `p` in `[0, 100]`.
    pub fn value_at_percentile(&self, p: f64) -> u64 {
        match &self.repr {
            Repr::Values(values) => {
                if values.is_empty() {
                    return 0;
                }
                let mut sorted = values.clone();
                sorted.sort_unstable();
                let rank = ((p / 100.0) * sorted.len() as f64).ceil() as usize;
                sorted[rank.saturating_sub(1).min(sorted.len() - 1)]
            }
            Repr::Hdr(histogram) => histogram.value_at_quantile(p / 100.0),
        }
    }

    /// Compact encoding: one format tag, then either the sorted raw values
    /// (little-endian) or the HdrHistogram V2 serialization.
    pub fn encode(&self) -> Vec<u8> {
        match &self.repr {
            Repr::Values(values) => {
                let mut buf = Vec::with_capacity(1 + 4 + values.len() * 8);
                buf.push(FORMAT_RAW);
                buf.extend_from_slice(&(values.len() as u32).to_le_bytes());
                let mut sorted = values.clone();
                sorted.sort_unstable();
                for value in sorted {
                    buf.extend_from_slice(&value.to_le_bytes());
                }
                buf
            }
            Repr::Hdr(histogram) => {
                let mut buf = vec![FORMAT_HDR];
                let mut body = Vec::new();
                if let Err(err) = V2Serializer::new().serialize(histogram, &mut body) {
                    warn!(error = %err, "histogram serialization failed");
                }
                buf.extend_from_slice(&body);
                buf
            }
        }
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, HistogramCodecError> {
        let (&tag, body) = bytes.split_first().ok_or(HistogramCodecError::Empty)?;
        match tag {
            FORMAT_RAW => {
                if body.len() < 4 {
                    return Err(HistogramCodecError::Truncated);
                }
                let count = u32::from_le_bytes(body[..4].try_into().expect("4-byte slice")) as usize;
                let value_bytes = &body[4..];
                if value_bytes.len() != count * 8 {
                    return Err(HistogramCodecError::Truncated);
                }
                let values = value_bytes
                    .chunks_exact(8)
                    .map(|chunk| u64::from_le_bytes(chunk.try_into().expect("8-byte chunk")))
                    .collect();
                Ok(Self {
                    repr: Repr::Values(values),
                })
            }
            FORMAT_HDR => {
                let mut cursor = std::io::Cursor::new(body);
                let histogram: Histogram<u64> = Deserializer::new()
                    .deserialize(&mut cursor)
                    .map_err(|err| HistogramCodecError::Hdr(err.to_string()))?;
                Ok(Self {
                    repr: Repr::Hdr(Box::new(histogram)),
                })
            }
            other => Err(HistogramCodecError::UnknownFormat(other)),
        }
    }
}

fn new_histogram() -> Histogram<u64> {
    // bounds are static and valid, construction cannot fail
    Histogram::new_with_bounds(1, MAX_VALUE_MICROS, SIGNIFICANT_FIGURES)
        .expect("static histogram bounds")
}
