//! Export formats for generated events.
//!
//! Two interchange formats are supported:
//! - CSV: a `x,y,timestamp,polarity` header followed by one row per event.
//! - NPZ: a deflate-compressed zip archive holding four same-length NumPy
//!   arrays `x`, `y`, `t` and `p`, loadable with `numpy.load`.
//!
//! Both formats carry timestamps at full `f64` precision, so converting
//! between them is lossless.

use crate::types::{Event, Polarity};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Cursor, Read, Seek, Write};
use std::path::Path;
use thiserror::Error;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

/// Header row of the CSV format.
pub const CSV_HEADER: &str = "x,y,timestamp,polarity";

const NPY_MAGIC: &[u8] = b"\x93NUMPY";
const NPY_ALIGN: usize = 64;

/// Errors that can occur while writing or reading exported events.
#[derive(Error, Debug)]
pub enum OutputError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Archive error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    #[error("Line {line}: {message}")]
    Parse { line: usize, message: String },
}

/// CSV writer for events.
pub struct CsvWriter<W: Write> {
    writer: BufWriter<W>,
}

impl<W: Write> CsvWriter<W> {
    /// Creates a new CSV writer.
    pub fn new(writer: W) -> Self {
        Self {
            writer: BufWriter::new(writer),
        }
    }

    /// Writes the `x,y,timestamp,polarity` header row.
    pub fn write_header(&mut self) -> Result<(), OutputError> {
        writeln!(self.writer, "{}", CSV_HEADER)?;
        Ok(())
    }

    /// Writes a batch of events.
    pub fn write_events(&mut self, events: &[Event]) -> Result<(), OutputError> {
        for event in events {
            writeln!(
                self.writer,
                "{},{},{},{}",
                event.x,
                event.y,
                event.timestamp,
                event.polarity.as_i8()
            )?;
        }
        Ok(())
    }

    /// Flushes the writer.
    pub fn flush(&mut self) -> Result<(), OutputError> {
        self.writer.flush()?;
        Ok(())
    }
}

/// Writes events to a CSV file.
pub fn write_csv<P: AsRef<Path>>(path: P, events: &[Event]) -> Result<(), OutputError> {
    let file = File::create(path)?;
    let mut writer = CsvWriter::new(file);
    writer.write_header()?;
    writer.write_events(events)?;
    writer.flush()?;
    Ok(())
}

/// Reads events from a CSV file.
pub fn read_csv<P: AsRef<Path>>(path: P) -> Result<Vec<Event>, OutputError> {
    read_csv_from(BufReader::new(File::open(path)?))
}

/// Reads events in CSV format from any buffered reader.
pub fn read_csv_from<R: BufRead>(reader: R) -> Result<Vec<Event>, OutputError> {
    let mut lines = reader.lines();

    let header = lines
        .next()
        .transpose()?
        .ok_or_else(|| OutputError::InvalidFormat("missing CSV header".to_string()))?;
    if header.trim() != CSV_HEADER {
        return Err(OutputError::InvalidFormat(format!(
            "expected header '{}', found '{}'",
            CSV_HEADER,
            header.trim()
        )));
    }

    let mut events = Vec::new();
    for (idx, line) in lines.enumerate() {
        let line = line?;
        let line_no = idx + 2;
        if line.trim().is_empty() {
            continue;
        }
        events.push(parse_csv_row(&line).map_err(|message| OutputError::Parse {
            line: line_no,
            message,
        })?);
    }
    Ok(events)
}

fn parse_csv_row(line: &str) -> Result<Event, String> {
    let fields: Vec<&str> = line.trim().split(',').map(str::trim).collect();
    if fields.len() != 4 {
        return Err(format!("expected 4 fields, found {}", fields.len()));
    }

    let x = fields[0]
        .parse()
        .map_err(|_| format!("invalid x: {}", fields[0]))?;
    let y = fields[1]
        .parse()
        .map_err(|_| format!("invalid y: {}", fields[1]))?;
    let timestamp = fields[2]
        .parse()
        .map_err(|_| format!("invalid timestamp: {}", fields[2]))?;
    let polarity = fields[3]
        .parse()
        .ok()
        .and_then(Polarity::from_i64)
        .ok_or_else(|| format!("invalid polarity: {}", fields[3]))?;

    Ok(Event::new(x, y, timestamp, polarity))
}

/// Writes events to an NPZ archive.
pub fn write_npz<P: AsRef<Path>>(path: P, events: &[Event]) -> Result<(), OutputError> {
    let file = File::create(path)?;
    write_npz_to(BufWriter::new(file), events)?;
    Ok(())
}

/// Writes events as an NPZ archive into any seekable writer, returning it.
pub fn write_npz_to<W: Write + Seek>(writer: W, events: &[Event]) -> Result<W, OutputError> {
    let mut zip = ZipWriter::new(writer);
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

    let x: Vec<i64> = events.iter().map(|e| e.x as i64).collect();
    let y: Vec<i64> = events.iter().map(|e| e.y as i64).collect();
    let t: Vec<f64> = events.iter().map(|e| e.timestamp).collect();
    let p: Vec<i64> = events.iter().map(|e| e.polarity.as_i8() as i64).collect();

    for (name, column) in [("x.npy", &x), ("y.npy", &y)] {
        zip.start_file(name, options)?;
        write_npy_i64(&mut zip, column)?;
    }
    zip.start_file("t.npy", options)?;
    write_npy_f64(&mut zip, &t)?;
    zip.start_file("p.npy", options)?;
    write_npy_i64(&mut zip, &p)?;

    let mut writer = zip.finish()?;
    writer.flush()?;
    Ok(writer)
}

/// Reads events from an NPZ archive.
pub fn read_npz<P: AsRef<Path>>(path: P) -> Result<Vec<Event>, OutputError> {
    read_npz_from(BufReader::new(File::open(path)?))
}

/// Reads events from an NPZ archive in any seekable reader.
pub fn read_npz_from<R: Read + Seek>(reader: R) -> Result<Vec<Event>, OutputError> {
    let mut archive = ZipArchive::new(reader)?;

    let x = read_member(&mut archive, "x")?.into_integers("x")?;
    let y = read_member(&mut archive, "y")?.into_integers("y")?;
    let t = read_member(&mut archive, "t")?.into_floats();
    let p = read_member(&mut archive, "p")?.into_integers("p")?;

    let len = x.len();
    if y.len() != len || t.len() != len || p.len() != len {
        return Err(OutputError::InvalidFormat(format!(
            "array lengths differ: x={}, y={}, t={}, p={}",
            len,
            y.len(),
            t.len(),
            p.len()
        )));
    }

    let mut events = Vec::with_capacity(len);
    for i in 0..len {
        let coord = |v: i64, name: &str| {
            u32::try_from(v)
                .map_err(|_| OutputError::InvalidFormat(format!("{}[{}] out of range: {}", name, i, v)))
        };
        let polarity = Polarity::from_i64(p[i]).ok_or_else(|| {
            OutputError::InvalidFormat(format!("p[{}] is not +1 or -1: {}", i, p[i]))
        })?;
        events.push(Event::new(coord(x[i], "x")?, coord(y[i], "y")?, t[i], polarity));
    }
    Ok(events)
}

fn read_member<R: Read + Seek>(
    archive: &mut ZipArchive<R>,
    name: &str,
) -> Result<NpyArray, OutputError> {
    let mut bytes = Vec::new();
    {
        let mut member = archive.by_name(&format!("{}.npy", name))?;
        member.read_to_end(&mut bytes)?;
    }
    read_npy(&bytes)
}

/// Writes the NPY v1.0 preamble for a 1-D array.
fn write_npy_header<W: Write>(writer: &mut W, descr: &str, len: usize) -> Result<(), OutputError> {
    let mut header = format!(
        "{{'descr': '{}', 'fortran_order': False, 'shape': ({},), }}",
        descr, len
    );
    // magic(6) + version(2) + header_len(2) + header + '\n' is a multiple of 64
    let unpadded = NPY_MAGIC.len() + 4 + header.len() + 1;
    let padding = (NPY_ALIGN - unpadded % NPY_ALIGN) % NPY_ALIGN;
    header.extend(std::iter::repeat(' ').take(padding));
    header.push('\n');

    let header_len = u16::try_from(header.len())
        .map_err(|_| OutputError::InvalidFormat("NPY header too long".to_string()))?;

    writer.write_all(NPY_MAGIC)?;
    writer.write_all(&[1, 0])?;
    writer.write_u16::<LittleEndian>(header_len)?;
    writer.write_all(header.as_bytes())?;
    Ok(())
}

fn write_npy_i64<W: Write>(writer: &mut W, values: &[i64]) -> Result<(), OutputError> {
    write_npy_header(writer, "<i8", values.len())?;
    for &v in values {
        writer.write_i64::<LittleEndian>(v)?;
    }
    Ok(())
}

fn write_npy_f64<W: Write>(writer: &mut W, values: &[f64]) -> Result<(), OutputError> {
    write_npy_header(writer, "<f8", values.len())?;
    for &v in values {
        writer.write_f64::<LittleEndian>(v)?;
    }
    Ok(())
}

/// A decoded 1-D NPY array.
#[derive(Debug, PartialEq)]
enum NpyArray {
    Int(Vec<i64>),
    Float(Vec<f64>),
}

impl NpyArray {
    fn into_integers(self, name: &str) -> Result<Vec<i64>, OutputError> {
        match self {
            Self::Int(values) => Ok(values),
            Self::Float(_) => Err(OutputError::InvalidFormat(format!(
                "array '{}' must hold integers",
                name
            ))),
        }
    }

    fn into_floats(self) -> Vec<f64> {
        match self {
            Self::Int(values) => values.into_iter().map(|v| v as f64).collect(),
            Self::Float(values) => values,
        }
    }
}

/// Little-endian element types accepted when reading.
#[derive(Debug, Clone, Copy)]
enum Dtype {
    I8,
    I16,
    I32,
    I64,
    U8,
    U16,
    U32,
    U64,
    F32,
    F64,
}

impl Dtype {
    fn parse(descr: &str) -> Option<Self> {
        if descr.len() != 3 || !descr.is_ascii() {
            return None;
        }
        let (order, kind) = descr.split_at(1);
        if order != "<" && order != "|" {
            return None;
        }
        match kind {
            "i1" => Some(Self::I8),
            "i2" => Some(Self::I16),
            "i4" => Some(Self::I32),
            "i8" => Some(Self::I64),
            "u1" => Some(Self::U8),
            "u2" => Some(Self::U16),
            "u4" => Some(Self::U32),
            "u8" => Some(Self::U64),
            "f4" => Some(Self::F32),
            "f8" => Some(Self::F64),
            _ => None,
        }
    }
}

fn read_npy(bytes: &[u8]) -> Result<NpyArray, OutputError> {
    let invalid = |msg: &str| OutputError::InvalidFormat(format!("NPY: {}", msg));

    if bytes.len() < 10 || &bytes[..6] != NPY_MAGIC {
        return Err(invalid("bad magic"));
    }
    let mut cursor = Cursor::new(&bytes[6..]);
    let major = cursor.read_u8()?;
    let _minor = cursor.read_u8()?;
    let header_len = match major {
        1 => cursor.read_u16::<LittleEndian>()? as usize,
        2 | 3 => cursor.read_u32::<LittleEndian>()? as usize,
        _ => return Err(invalid("unsupported version")),
    };
    let data_start = 6 + cursor.position() as usize + header_len;
    if bytes.len() < data_start {
        return Err(invalid("truncated header"));
    }
    let header = std::str::from_utf8(&bytes[data_start - header_len..data_start])
        .map_err(|_| invalid("header is not text"))?;

    let descr = header_value(header, "descr")
        .map(|v| v.trim_matches(|c| c == '\'' || c == '"'))
        .ok_or_else(|| invalid("missing descr"))?;
    let dtype = Dtype::parse(descr).ok_or_else(|| invalid("unsupported dtype"))?;
    if header_value(header, "fortran_order") == Some("True") {
        return Err(invalid("fortran order is not supported"));
    }
    let len = parse_shape(header).ok_or_else(|| invalid("expected a 1-D shape"))?;

    let mut data = Cursor::new(&bytes[data_start..]);
    let array = match dtype {
        Dtype::F32 => NpyArray::Float(
            (0..len)
                .map(|_| data.read_f32::<LittleEndian>().map(f64::from))
                .collect::<Result<_, _>>()?,
        ),
        Dtype::F64 => NpyArray::Float(
            (0..len)
                .map(|_| data.read_f64::<LittleEndian>())
                .collect::<Result<_, _>>()?,
        ),
        int => NpyArray::Int(
            (0..len)
                .map(|_| read_int(&mut data, int))
                .collect::<Result<_, _>>()?,
        ),
    };
    Ok(array)
}

fn read_int<R: Read>(reader: &mut R, dtype: Dtype) -> Result<i64, OutputError> {
    let value = match dtype {
        Dtype::I8 => reader.read_i8()? as i64,
        Dtype::I16 => reader.read_i16::<LittleEndian>()? as i64,
        Dtype::I32 => reader.read_i32::<LittleEndian>()? as i64,
        Dtype::I64 => reader.read_i64::<LittleEndian>()?,
        Dtype::U8 => reader.read_u8()? as i64,
        Dtype::U16 => reader.read_u16::<LittleEndian>()? as i64,
        Dtype::U32 => reader.read_u32::<LittleEndian>()? as i64,
        Dtype::U64 => i64::try_from(reader.read_u64::<LittleEndian>()?)
            .map_err(|_| OutputError::InvalidFormat("NPY: u8 value overflows".to_string()))?,
        Dtype::F32 | Dtype::F64 => {
            return Err(OutputError::InvalidFormat(
                "NPY: float read as integer".to_string(),
            ))
        }
    };
    Ok(value)
}

/// Extracts the raw text of `'key': value` from an NPY header dict.
fn header_value<'a>(header: &'a str, key: &str) -> Option<&'a str> {
    let start = header.find(&format!("'{}'", key))? + key.len() + 2;
    let rest = header[start..].trim_start().strip_prefix(':')?.trim_start();
    let end = if rest.starts_with('(') {
        rest.find(')')? + 1
    } else {
        rest.find(',').unwrap_or(rest.len())
    };
    Some(rest[..end].trim())
}

fn parse_shape(header: &str) -> Option<usize> {
    let shape = header_value(header, "shape")?;
    let inner = shape.strip_prefix('(')?.strip_suffix(')')?;
    let dims: Vec<&str> = inner
        .split(',')
        .map(str::trim)
        .filter(|d| !d.is_empty())
        .collect();
    match dims.as_slice() {
        [len] => len.parse().ok(),
        _ => None,
    }
}

/// Returns `"{prefix}_{YYYYmmdd_HHMMSS}.{extension}"` for the current local
/// time.
pub fn timestamped_filename(prefix: &str, extension: &str) -> String {
    timestamped_filename_at(prefix, extension, &chrono::Local::now().naive_local())
}

/// Like [`timestamped_filename`], for an explicit time.
pub fn timestamped_filename_at(
    prefix: &str,
    extension: &str,
    time: &chrono::NaiveDateTime,
) -> String {
    format!(
        "{}_{}.{}",
        prefix,
        time.format("%Y%m%d_%H%M%S"),
        extension.trim_start_matches('.')
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn sample_events() -> Vec<Event> {
        vec![
            Event::new(100, 200, 1_728_912_345.123_456, Polarity::Positive),
            Event::new(101, 201, 1_728_912_345.123_456, Polarity::Negative),
            Event::new(0, 0, 1_728_912_345.156_789, Polarity::Positive),
        ]
    }

    #[test]
    fn test_csv_writer() {
        let mut output = Vec::new();
        {
            let mut writer = CsvWriter::new(&mut output);
            writer.write_header().unwrap();
            writer
                .write_events(&[
                    Event::new(100, 200, 12.5, Polarity::Positive),
                    Event::new(101, 201, 12.5, Polarity::Negative),
                ])
                .unwrap();
            writer.flush().unwrap();
        }

        let output_str = String::from_utf8(output).unwrap();
        let lines: Vec<&str> = output_str.lines().collect();
        assert_eq!(lines, vec!["x,y,timestamp,polarity", "100,200,12.5,1", "101,201,12.5,-1"]);
    }

    #[test]
    fn test_csv_round_trip() {
        let events = sample_events();
        let mut output = Vec::new();
        {
            let mut writer = CsvWriter::new(&mut output);
            writer.write_header().unwrap();
            writer.write_events(&events).unwrap();
            writer.flush().unwrap();
        }
        let parsed = read_csv_from(Cursor::new(output)).unwrap();
        assert_eq!(parsed, events);
    }

    #[test]
    fn test_csv_rejects_bad_rows() {
        let bad_header = "x,y,p,t\n1,2,3.0,1\n";
        assert!(matches!(
            read_csv_from(Cursor::new(bad_header)),
            Err(OutputError::InvalidFormat(_))
        ));

        let bad_polarity = "x,y,timestamp,polarity\n1,2,3.0,1\n1,2,3.0,0\n";
        match read_csv_from(Cursor::new(bad_polarity)) {
            Err(OutputError::Parse { line, .. }) => assert_eq!(line, 3),
            other => panic!("expected parse error, got {:?}", other),
        }
    }

    #[test]
    fn test_npz_round_trip() {
        let events = sample_events();
        let buffer = write_npz_to(Cursor::new(Vec::new()), &events).unwrap();
        let parsed = read_npz_from(Cursor::new(buffer.into_inner())).unwrap();
        assert_eq!(parsed, events);
    }

    #[test]
    fn test_npz_empty_archive() {
        let buffer = write_npz_to(Cursor::new(Vec::new()), &[]).unwrap();
        let parsed = read_npz_from(Cursor::new(buffer.into_inner())).unwrap();
        assert!(parsed.is_empty());
    }

    #[test]
    fn test_npy_header_alignment() {
        let mut bytes = Vec::new();
        write_npy_i64(&mut bytes, &[1, 2, 3]).unwrap();
        let header_len = u16::from_le_bytes([bytes[8], bytes[9]]) as usize;
        assert_eq!((10 + header_len) % 64, 0);
        assert_eq!(bytes[10 + header_len - 1], b'\n');
        assert_eq!(bytes.len(), 10 + header_len + 3 * 8);
        assert_eq!(read_npy(&bytes).unwrap(), NpyArray::Int(vec![1, 2, 3]));
    }

    #[test]
    fn test_npy_reads_narrow_integers() {
        // int32 arrays are what numpy produces for Python ints on some platforms
        let header = "{'descr': '<i4', 'fortran_order': False, 'shape': (2,), }";
        let mut bytes = Vec::new();
        bytes.extend_from_slice(NPY_MAGIC);
        bytes.extend_from_slice(&[1, 0]);
        bytes.extend_from_slice(&(header.len() as u16 + 1).to_le_bytes());
        bytes.extend_from_slice(header.as_bytes());
        bytes.push(b'\n');
        bytes.extend_from_slice(&7i32.to_le_bytes());
        bytes.extend_from_slice(&(-1i32).to_le_bytes());

        assert_eq!(read_npy(&bytes).unwrap(), NpyArray::Int(vec![7, -1]));
    }

    #[test]
    fn test_header_value_parsing() {
        let header = "{'descr': '<f8', 'fortran_order': False, 'shape': (42,), }";
        assert_eq!(header_value(header, "descr"), Some("'<f8'"));
        assert_eq!(header_value(header, "fortran_order"), Some("False"));
        assert_eq!(parse_shape(header), Some(42));
        assert_eq!(parse_shape("{'shape': (2, 3), }"), None);
    }

    #[test]
    fn test_timestamped_filename() {
        let time = NaiveDate::from_ymd_opt(2024, 3, 9)
            .unwrap()
            .and_hms_opt(7, 5, 1)
            .unwrap();
        assert_eq!(
            timestamped_filename_at("events", "csv", &time),
            "events_20240309_070501.csv"
        );
        assert_eq!(
            timestamped_filename_at("events", ".npz", &time),
            "events_20240309_070501.npz"
        );
    }
}
