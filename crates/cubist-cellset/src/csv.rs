//! Row payloads for bulk transfer
//!
//! Every field is quoted, embedded quotes are doubled and CR/LF are
//! stripped, so one record is always exactly one line.

use crate::model::{CellValue, Coordinate};

pub const LINE_SEPARATOR: &str = "\r\n";

fn push_field(out: &mut String, field: &str) {
    out.push('"');
    for c in field.chars() {
        match c {
            '"' => out.push_str("\"\""),
            '\r' | '\n' => {}
            c => out.push(c),
        }
    }
    out.push('"');
}

/// Append one `elem1,...,elemN,value` record.
pub fn push_record(out: &mut String, coordinate: &Coordinate, value: &CellValue) {
    for element in coordinate.elements() {
        push_field(out, element);
        out.push(',');
    }
    match value {
        CellValue::Number(n) => push_field(out, &format_number(*n)),
        CellValue::Text(s) => push_field(out, s),
        CellValue::Empty => push_field(out, ""),
    }
    out.push_str(LINE_SEPARATOR);
}

/// Encode all cells, one record per line.
pub fn encode<'a, I>(cells: I) -> String
where
    I: IntoIterator<Item = (&'a Coordinate, &'a CellValue)>,
{
    let mut out = String::new();
    for (coordinate, value) in cells {
        push_record(&mut out, coordinate, value);
    }
    out
}

/// Shortest round-tripping text for a number; integers without a fraction.
pub fn format_number(n: f64) -> String {
    if n.is_finite() && n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{}", n)
    }
}

/// Split one line into fields, undoing the quoting of [`push_record`].
///
/// Returns `None` for an unterminated quote.
pub fn parse_record(line: &str) -> Option<Vec<String>> {
    let line = line.trim_end_matches(['\r', '\n']);
    let mut fields = Vec::new();
    let mut field = String::new();
    let mut chars = line.chars().peekable();
    let mut quoted = false;

    while let Some(c) = chars.next() {
        match (quoted, c) {
            (true, '"') if chars.peek() == Some(&'"') => {
                chars.next();
                field.push('"');
            }
            (true, '"') => quoted = false,
            (true, c) => field.push(c),
            (false, '"') => quoted = true,
            (false, ',') => fields.push(std::mem::take(&mut field)),
            (false, c) => field.push(c),
        }
    }
    if quoted {
        return None;
    }
    fields.push(field);
    Some(fields)
}
