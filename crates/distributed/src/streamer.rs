//! Column streamers: type-specific wire encoding of resolved row buckets.
//!
//! A bucket is not self-describing. The writer and the reader must use the
//! same streamers, in the same column order, as derived from the fetch
//! source references at planning time.

use std::collections::BTreeMap;

use arrow_schema::DataType;
use dfq_common::{DfqError, Result, Row, ScalarValue, TableIdent};
use dfq_planner::Reference;

const NULL_MARKER: u8 = 0;
const VALUE_MARKER: u8 = 1;

/// Per-table streamers, keyed the same way as request and response buckets.
pub type TableStreamers = BTreeMap<TableIdent, Vec<Streamer>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Streamer {
    Null,
    Boolean,
    Int32,
    Int64,
    Float64,
    Utf8,
}

impl Streamer {
    pub fn for_type(data_type: &DataType) -> Result<Self> {
        match data_type {
            DataType::Null => Ok(Self::Null),
            DataType::Boolean => Ok(Self::Boolean),
            DataType::Int32 => Ok(Self::Int32),
            DataType::Int64 => Ok(Self::Int64),
            DataType::Float64 => Ok(Self::Float64),
            DataType::Utf8 => Ok(Self::Utf8),
            other => Err(DfqError::Unsupported(format!(
                "no streamer for column type {other}"
            ))),
        }
    }

    pub fn write(&self, value: &ScalarValue, out: &mut Vec<u8>) -> Result<()> {
        match (self, value) {
            (_, ScalarValue::Null) => out.push(NULL_MARKER),
            (Self::Boolean, ScalarValue::Boolean(v)) => {
                out.push(VALUE_MARKER);
                out.push(u8::from(*v));
            }
            (Self::Int32, ScalarValue::Int32(v)) => {
                out.push(VALUE_MARKER);
                out.extend_from_slice(&v.to_le_bytes());
            }
            (Self::Int64, ScalarValue::Int64(v)) => {
                out.push(VALUE_MARKER);
                out.extend_from_slice(&v.to_le_bytes());
            }
            (Self::Float64, ScalarValue::Float64(v)) => {
                out.push(VALUE_MARKER);
                out.extend_from_slice(&v.to_bits().to_le_bytes());
            }
            (Self::Utf8, ScalarValue::Utf8(v)) => {
                out.push(VALUE_MARKER);
                out.extend_from_slice(&wire_len(v.len(), "string value")?.to_le_bytes());
                out.extend_from_slice(v.as_bytes());
            }
            (streamer, value) => {
                return Err(DfqError::Execution(format!(
                    "{streamer:?} streamer cannot encode {value:?}"
                )));
            }
        }
        Ok(())
    }

    pub fn read(&self, input: &mut &[u8]) -> Result<ScalarValue> {
        match take(input, 1)?[0] {
            NULL_MARKER => return Ok(ScalarValue::Null),
            VALUE_MARKER => {}
            other => {
                return Err(DfqError::Execution(format!(
                    "invalid null marker {other} in stream bucket"
                )));
            }
        }
        let value = match self {
            Self::Null => {
                return Err(DfqError::Execution(
                    "null streamer cannot decode a value".to_string(),
                ));
            }
            Self::Boolean => ScalarValue::Boolean(take(input, 1)?[0] != 0),
            Self::Int32 => ScalarValue::Int32(i32::from_le_bytes(take_array(input)?)),
            Self::Int64 => ScalarValue::Int64(i64::from_le_bytes(take_array(input)?)),
            Self::Float64 => {
                ScalarValue::Float64(f64::from_bits(u64::from_le_bytes(take_array(input)?)))
            }
            Self::Utf8 => {
                let len = u32::from_le_bytes(take_array(input)?) as usize;
                let bytes = take(input, len)?;
                let s = std::str::from_utf8(bytes)
                    .map_err(|e| DfqError::Execution(format!("invalid utf8 in bucket: {e}")))?;
                ScalarValue::Utf8(s.to_string())
            }
        };
        Ok(value)
    }
}

/// Streamers for `references`, in the same order.
pub fn streamers_for(references: &[Reference]) -> Result<Vec<Streamer>> {
    references
        .iter()
        .map(|r| Streamer::for_type(&r.data_type))
        .collect()
}

/// Streamers for every table of a fetch phase.
pub fn table_streamers(columns: &BTreeMap<TableIdent, Vec<Reference>>) -> Result<TableStreamers> {
    columns
        .iter()
        .map(|(table, refs)| Ok((table.clone(), streamers_for(refs)?)))
        .collect()
}

/// Encode `rows` as one bucket: row count followed by each row's cells.
pub fn encode_bucket(rows: &[Row], streamers: &[Streamer]) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(4 + rows.len() * streamers.len() * 9);
    out.extend_from_slice(&wire_len(rows.len(), "bucket row count")?.to_le_bytes());
    for row in rows {
        if row.len() != streamers.len() {
            return Err(DfqError::Execution(format!(
                "row width {} does not match {} streamers",
                row.len(),
                streamers.len()
            )));
        }
        for (value, streamer) in row.iter().zip(streamers) {
            streamer.write(value, &mut out)?;
        }
    }
    Ok(out)
}

/// Decode a bucket written by [`encode_bucket`] with the same streamers.
pub fn decode_bucket(payload: &[u8], streamers: &[Streamer]) -> Result<Vec<Row>> {
    let mut input = payload;
    let count = u32::from_le_bytes(take_array(&mut input)?) as usize;
    let mut rows = Vec::with_capacity(count);
    for _ in 0..count {
        let row = streamers
            .iter()
            .map(|s| s.read(&mut input))
            .collect::<Result<Row>>()?;
        rows.push(row);
    }
    if !input.is_empty() {
        return Err(DfqError::Execution(format!(
            "{} trailing bytes after stream bucket",
            input.len()
        )));
    }
    Ok(rows)
}

/// Length prefix as written on the wire; larger lengths cannot be encoded.
fn wire_len(len: usize, what: &str) -> Result<u32> {
    u32::try_from(len)
        .map_err(|_| DfqError::Execution(format!("{what} of length {len} exceeds u32 prefix")))
}

fn take<'a>(input: &mut &'a [u8], n: usize) -> Result<&'a [u8]> {
    if input.len() < n {
        return Err(DfqError::Execution(format!(
            "stream bucket truncated: need {n} bytes, have {}",
            input.len()
        )));
    }
    let (head, tail) = input.split_at(n);
    *input = tail;
    Ok(head)
}

fn take_array<const N: usize>(input: &mut &[u8]) -> Result<[u8; N]> {
    let bytes = take(input, N)?;
    let mut out = [0_u8; N];
    out.copy_from_slice(bytes);
    Ok(out)
}
