//! Content-Encoding decompression and charset decoding of response bodies.

use anyhow::{Context, Result};
use encoding_rs::{DecoderResult, Encoding};
use flate2::read::MultiGzDecoder;
use reqwest::header::{CONTENT_ENCODING, CONTENT_TYPE, HeaderMap};
use std::io::Read;

use super::retry::NonRetryableError;

/// Labels decoded as strict 7-bit ASCII. The WHATWG registry would map these
/// to windows-1252.
const ASCII_LABELS: &[&str] = &[
    "ascii",
    "us-ascii",
    "us",
    "ansi_x3.4-1968",
    "iso646-us",
    "cp367",
    "ibm367",
    "csascii",
];

/// Labels decoded as true ISO-8859-1, where every byte is the code point of
/// the same value. The WHATWG registry would map these to windows-1252 too.
const LATIN1_LABELS: &[&str] = &[
    "iso-8859-1",
    "iso8859-1",
    "iso_8859-1",
    "latin1",
    "latin-1",
    "l1",
    "cp819",
    "ibm819",
    "8859",
    "iso-ir-100",
    "csisolatin1",
];

const UTF32_LE_LABELS: &[&str] = &["utf-32le", "utf-32-le", "utf_32_le", "utf32le"];
const UTF32_BE_LABELS: &[&str] = &["utf-32be", "utf-32-be", "utf_32_be", "utf32be"];
/// Byte order taken from a leading BOM, little-endian without one.
const UTF32_LABELS: &[&str] = &["utf-32", "utf_32", "utf32", "u32"];

/// How a declared charset is turned into text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Charset {
    Ascii,
    Latin1,
    Utf32 { big_endian: bool, sniff_bom: bool },
    Registry(&'static Encoding),
}

impl Charset {
    fn for_label(label: &str) -> Option<Self> {
        let label = label.trim();
        let listed = |labels: &[&str]| labels.iter().any(|l| l.eq_ignore_ascii_case(label));

        if listed(ASCII_LABELS) {
            Some(Charset::Ascii)
        } else if listed(LATIN1_LABELS) {
            Some(Charset::Latin1)
        } else if listed(UTF32_LE_LABELS) {
            Some(Charset::Utf32 {
                big_endian: false,
                sniff_bom: false,
            })
        } else if listed(UTF32_BE_LABELS) {
            Some(Charset::Utf32 {
                big_endian: true,
                sniff_bom: false,
            })
        } else if listed(UTF32_LABELS) {
            Some(Charset::Utf32 {
                big_endian: false,
                sniff_bom: true,
            })
        } else {
            Encoding::for_label(label.as_bytes()).map(Charset::Registry)
        }
    }

    fn decode(self, bytes: &[u8]) -> String {
        match self {
            Charset::Ascii => decode_ascii_lossy(bytes),
            Charset::Latin1 => bytes.iter().map(|&b| char::from(b)).collect(),
            Charset::Utf32 {
                big_endian,
                sniff_bom,
            } => decode_utf32_lossy(bytes, big_endian, sniff_bom),
            Charset::Registry(encoding) => decode_lossy(encoding, bytes),
        }
    }
}

/// Undoes the response's Content-Encoding.
///
/// Only `gzip` and its legacy alias `x-gzip` are understood. Any other
/// declared encoding is a [`NonRetryableError::UnsupportedEncoding`]. Without
/// the header the body is returned as is.
pub fn decompress_using_encoding(headers: &HeaderMap, body: Vec<u8>) -> Result<Vec<u8>> {
    let Some(value) = headers.get(CONTENT_ENCODING) else {
        return Ok(body);
    };

    let encoding = String::from_utf8_lossy(value.as_bytes());
    let token = encoding.trim();
    if !token.eq_ignore_ascii_case("gzip") && !token.eq_ignore_ascii_case("x-gzip") {
        return Err(NonRetryableError::UnsupportedEncoding(token.to_string()).into());
    }

    let mut decoded = Vec::with_capacity(body.len().saturating_mul(2));
    MultiGzDecoder::new(body.as_slice())
        .read_to_end(&mut decoded)
        .context("Failed to decompress gzip response body")?;
    Ok(decoded)
}

/// Decodes `body` using the charset named in the Content-Type header.
///
/// Malformed sequences are dropped. A missing or unknown charset falls back
/// to ASCII, again dropping anything that isn't ASCII. Never fails.
pub fn decode_using_charset(headers: &HeaderMap, body: &[u8]) -> String {
    let charset = headers
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .and_then(charset_param);

    charset
        .and_then(Charset::for_label)
        .unwrap_or(Charset::Ascii)
        .decode(body)
}

/// Returns the first `charset=` parameter of a Content-Type value, unquoted.
fn charset_param(content_type: &str) -> Option<&str> {
    content_type.split(';').skip(1).find_map(|param| {
        let (name, value) = param.split_once('=')?;
        if !name.trim().eq_ignore_ascii_case("charset") {
            return None;
        }
        let value = value.trim();
        Some(
            value
                .strip_prefix('"')
                .and_then(|v| v.strip_suffix('"'))
                .unwrap_or(value),
        )
    })
}

fn decode_ascii_lossy(bytes: &[u8]) -> String {
    bytes
        .iter()
        .filter(|b| b.is_ascii())
        .map(|&b| char::from(b))
        .collect()
}

/// Decodes UTF-32, dropping surrogates, out-of-range values and a trailing
/// partial unit.
fn decode_utf32_lossy(bytes: &[u8], big_endian: bool, sniff_bom: bool) -> String {
    let mut big_endian = big_endian;
    let mut bytes = bytes;
    if sniff_bom {
        if let Some(rest) = bytes.strip_prefix(b"\xff\xfe\x00\x00") {
            bytes = rest;
        } else if let Some(rest) = bytes.strip_prefix(b"\x00\x00\xfe\xff") {
            big_endian = true;
            bytes = rest;
        }
    }

    bytes
        .chunks_exact(4)
        .filter_map(|unit| {
            let unit = [unit[0], unit[1], unit[2], unit[3]];
            let value = if big_endian {
                u32::from_be_bytes(unit)
            } else {
                u32::from_le_bytes(unit)
            };
            char::from_u32(value)
        })
        .collect()
}

fn decode_lossy(encoding: &'static Encoding, bytes: &[u8]) -> String {
    let mut decoder = encoding.new_decoder_without_bom_handling();
    let capacity = decoder
        .max_utf8_buffer_length_without_replacement(bytes.len())
        .unwrap_or(bytes.len());
    let mut text = String::with_capacity(capacity);
    let mut remaining = bytes;

    loop {
        let (result, read) =
            decoder.decode_to_string_without_replacement(remaining, &mut text, true);
        remaining = &remaining[read..];
        match result {
            DecoderResult::InputEmpty => return text,
            DecoderResult::OutputFull => {
                let needed = decoder
                    .max_utf8_buffer_length_without_replacement(remaining.len())
                    .unwrap_or(remaining.len());
                text.reserve(needed.max(4));
            }
            // skip the offending bytes
            DecoderResult::Malformed(_, _) => {}
        }
    }
}
