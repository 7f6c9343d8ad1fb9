//! Flow Cytometry Standard 3.0 writer.
//!
//! Layout: a 58-byte HEADER, a `/`-delimited TEXT segment and a DATA
//! segment of little-endian `f32` values, one row per event.

use std::fs::File;
use std::io::{BufWriter, Write};

use crate::dataset::Dataset;
use crate::error::Result;

use super::{ExportOptions, Selection};

const HEADER_LEN: usize = 58;
const DELIMITER: char = '/';
/// Offsets above this do not fit the header's 8-character fields.
const MAX_HEADER_OFFSET: usize = 99_999_999;

/// Double the delimiter inside keywords and values.
fn escape(text: &str) -> String {
    text.replace(DELIMITER, "//")
}

/// `$PnR`: the largest finite value, rounded up, at least 1.
fn parameter_range(values: &[f32]) -> u64 {
    let max = values
        .iter()
        .copied()
        .filter(|v| v.is_finite())
        .fold(0.0f32, f32::max);
    (max.ceil() as u64).max(1)
}

fn text_segment(keywords: &[(String, String)]) -> String {
    let mut text = String::new();
    text.push(DELIMITER);
    for (key, value) in keywords {
        text.push_str(&escape(key));
        text.push(DELIMITER);
        text.push_str(&escape(value));
        text.push(DELIMITER);
    }
    text
}

/// Build the TEXT segment for `data_len` bytes of DATA.
///
/// `$BEGINDATA`/`$ENDDATA` are part of TEXT and their width changes its
/// length, so the offsets are iterated until they settle.
fn layout(base: &[(String, String)], data_len: usize) -> (String, usize, usize) {
    let mut begin = HEADER_LEN;
    loop {
        let end = (begin + data_len).saturating_sub(1);
        let mut keywords = vec![
            ("$BEGINDATA".to_string(), begin.to_string()),
            ("$ENDDATA".to_string(), end.to_string()),
        ];
        keywords.extend_from_slice(base);
        let text = text_segment(&keywords);
        let next = HEADER_LEN + text.len();
        if next == begin {
            return (text, begin, end);
        }
        begin = next;
    }
}

fn header_offset(offset: usize) -> usize {
    if offset > MAX_HEADER_OFFSET { 0 } else { offset }
}

pub(super) fn write(
    dataset: &Dataset,
    selection: &Selection,
    _options: &ExportOptions,
    mut out: BufWriter<File>,
) -> Result<()> {
    let columns: Vec<Vec<f32>> = selection
        .features
        .iter()
        .map(|(name, _)| -> Result<Vec<f32>> {
            let values = dataset.scalars(name)?;
            Ok(selection.indices.iter().map(|&i| values[i] as f32).collect())
        })
        .collect::<Result<_>>()?;

    let events = selection.indices.len();
    let mut data = Vec::with_capacity(events * columns.len() * 4);
    for row in 0..events {
        for column in &columns {
            data.extend_from_slice(&column[row].to_le_bytes());
        }
    }

    let mut base = vec![
        ("$BEGINANALYSIS".to_string(), "0".to_string()),
        ("$ENDANALYSIS".to_string(), "0".to_string()),
        ("$BEGINSTEXT".to_string(), "0".to_string()),
        ("$ENDSTEXT".to_string(), "0".to_string()),
        ("$BYTEORD".to_string(), "1,2,3,4".to_string()),
        ("$DATATYPE".to_string(), "F".to_string()),
        ("$MODE".to_string(), "L".to_string()),
        ("$NEXTDATA".to_string(), "0".to_string()),
        ("$PAR".to_string(), columns.len().to_string()),
        ("$TOT".to_string(), events.to_string()),
        ("$CYT".to_string(), "RT-DC".to_string()),
        ("$FIL".to_string(), dataset.name().to_string()),
    ];
    for (n, ((name, _), column)) in selection.features.iter().zip(&columns).enumerate() {
        let p = n + 1;
        base.push((format!("$P{p}N"), name.clone()));
        base.push((format!("$P{p}B"), "32".to_string()));
        base.push((format!("$P{p}E"), "0,0".to_string()));
        base.push((format!("$P{p}R"), parameter_range(column).to_string()));
    }

    let (text, data_begin, data_end) = layout(&base, data.len());
    let text_begin = HEADER_LEN;
    let text_end = HEADER_LEN + text.len() - 1;

    let mut header = String::with_capacity(HEADER_LEN);
    header.push_str("FCS3.0    ");
    for offset in [text_begin, text_end, data_begin, data_end, 0, 0] {
        header.push_str(&format!("{:>8}", header_offset(offset)));
    }

    out.write_all(header.as_bytes())?;
    out.write_all(text.as_bytes())?;
    out.write_all(&data)?;
    out.flush()?;
    Ok(())
}
