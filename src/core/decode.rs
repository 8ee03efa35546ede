/// Decoders for the general-purpose stream filters.
///
/// Image codecs (DCT, JPX, JBIG2, CCITT) are not decoded here; their payload
/// is handed to the renderer still encoded (see [`super::filter`]).
use super::error::{PDFError, PDFResult};
use super::primitives::{Dict, PDFObject};
use flate2::read::{DeflateDecoder, ZlibDecoder};
use log::debug;
use std::io::Read;
use weezl::{BitOrder, decode::Decoder as LzwDecoder};

/// Decodes FlateDecode data.
///
/// Tries zlib first, then raw deflate. A stream that breaks off part way
/// still yields what was inflated before the error.
pub fn decode_flate(compressed: &[u8]) -> PDFResult<Vec<u8>> {
    let mut decompressed = Vec::new();
    let zlib_err = match ZlibDecoder::new(compressed).read_to_end(&mut decompressed) {
        Ok(_) => return Ok(decompressed),
        Err(e) => e,
    };
    if !decompressed.is_empty() {
        debug!(
            "FlateDecode: keeping {} bytes inflated before error ({})",
            decompressed.len(),
            zlib_err
        );
        return Ok(decompressed);
    }

    decompressed.clear();
    match DeflateDecoder::new(compressed).read_to_end(&mut decompressed) {
        Ok(_) => Ok(decompressed),
        Err(_) if !decompressed.is_empty() => Ok(decompressed),
        Err(deflate_err) => Err(PDFError::Generic(format!(
            "FlateDecode: zlib failed ({}), raw deflate failed ({}); {} input bytes, starting {:02x?}",
            zlib_err,
            deflate_err,
            compressed.len(),
            &compressed[..compressed.len().min(8)]
        ))),
    }
}

/// Decodes LZWDecode data. `early_change` follows `/EarlyChange`
/// (default 1, the code width grows one code early).
pub fn decode_lzw(data: &[u8], early_change: bool) -> PDFResult<Vec<u8>> {
    let mut decoder = if early_change {
        LzwDecoder::with_tiff_size_switch(BitOrder::Msb, 8)
    } else {
        LzwDecoder::new(BitOrder::Msb, 8)
    };
    let mut output = Vec::new();
    let result = decoder.into_vec(&mut output).decode(data);
    if let Err(e) = result.status {
        if output.is_empty() {
            return Err(PDFError::Generic(format!("LZWDecode: {}", e)));
        }
        debug!("LZWDecode: keeping {} bytes before error ({})", output.len(), e);
    }
    Ok(output)
}

/// Decodes ASCIIHexDecode data. Whitespace is skipped, `>` ends the data
/// and an odd final digit is padded with 0.
pub fn decode_ascii_hex(data: &[u8]) -> PDFResult<Vec<u8>> {
    let mut out = Vec::with_capacity(data.len() / 2);
    let mut high: Option<u8> = None;

    for &byte in data {
        let digit = match byte {
            b'0'..=b'9' => byte - b'0',
            b'a'..=b'f' => byte - b'a' + 10,
            b'A'..=b'F' => byte - b'A' + 10,
            b'>' => break,
            b' ' | b'\t' | b'\r' | b'\n' | b'\x0c' | b'\0' => continue,
            other => {
                return Err(PDFError::Generic(format!(
                    "ASCIIHexDecode: invalid character 0x{:02x}",
                    other
                )));
            }
        };
        match high.take() {
            Some(h) => out.push(h << 4 | digit),
            None => high = Some(digit),
        }
    }
    if let Some(h) = high {
        out.push(h << 4);
    }
    Ok(out)
}

/// Decodes ASCII85Decode data up to the `~>` marker.
pub fn decode_ascii85(data: &[u8]) -> PDFResult<Vec<u8>> {
    let mut out = Vec::with_capacity(data.len() * 4 / 5);
    let mut group = [0u8; 5];
    let mut count = 0usize;

    for &byte in data {
        match byte {
            b'~' => break,
            b'z' if count == 0 => out.extend_from_slice(&[0; 4]),
            b'!'..=b'u' => {
                group[count] = byte - b'!';
                count += 1;
                if count == 5 {
                    out.extend_from_slice(&ascii85_group(&group).to_be_bytes());
                    count = 0;
                }
            }
            b' ' | b'\t' | b'\r' | b'\n' | b'\x0c' | b'\0' => {}
            other => {
                return Err(PDFError::Generic(format!(
                    "ASCII85Decode: invalid character 0x{:02x}",
                    other
                )));
            }
        }
    }

    if count > 1 {
        group[count..].fill(84);
        let bytes = ascii85_group(&group).to_be_bytes();
        out.extend_from_slice(&bytes[..count - 1]);
    }
    Ok(out)
}

fn ascii85_group(group: &[u8; 5]) -> u32 {
    group
        .iter()
        .fold(0u32, |acc, &digit| acc.wrapping_mul(85).wrapping_add(digit as u32))
}

/// Decodes RunLengthDecode data.
pub fn decode_run_length(data: &[u8]) -> PDFResult<Vec<u8>> {
    let mut out = Vec::with_capacity(data.len() * 2);
    let mut i = 0;
    while i < data.len() {
        let length = data[i] as usize;
        i += 1;
        match length {
            128 => break,
            0..=127 => {
                let end = (i + length + 1).min(data.len());
                out.extend_from_slice(&data[i..end]);
                i = end;
            }
            _ => {
                let Some(&byte) = data.get(i) else { break };
                out.resize(out.len() + 257 - length, byte);
                i += 1;
            }
        }
    }
    Ok(out)
}

/// Predictor settings from `/DecodeParms`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PredictorParams {
    pub predictor: i64,
    pub colors: usize,
    pub bits_per_component: usize,
    pub columns: usize,
}

impl PredictorParams {
    /// Reads the predictor entries; `None` when no predictor applies.
    pub fn from_params(params: Option<&Dict>) -> Option<Self> {
        let params = params?;
        let int = |key: &str, default: i64| {
            params
                .get(key)
                .and_then(PDFObject::as_i64)
                .unwrap_or(default)
        };
        let predictor = int("Predictor", 1);
        if predictor <= 1 {
            return None;
        }
        Some(PredictorParams {
            predictor,
            colors: int("Colors", 1).clamp(1, 32) as usize,
            bits_per_component: int("BitsPerComponent", 8).clamp(1, 16) as usize,
            columns: int("Columns", 1).max(1) as usize,
        })
    }

    fn row_bytes(&self) -> usize {
        (self.columns * self.colors * self.bits_per_component).div_ceil(8)
    }

    fn pixel_bytes(&self) -> usize {
        (self.colors * self.bits_per_component).div_ceil(8)
    }
}

/// Undoes a PNG (10..=15) or TIFF (2) predictor.
pub fn apply_predictor(data: Vec<u8>, params: &PredictorParams) -> PDFResult<Vec<u8>> {
    match params.predictor {
        2 => Ok(decode_tiff_predictor(data, params)),
        10..=15 => decode_png_predictor(&data, params),
        other => Err(PDFError::Generic(format!("Unsupported predictor {}", other))),
    }
}

/// Reverses PNG row filters. Each row starts with its filter type byte; a
/// short final row is decoded as far as it goes.
pub fn decode_png_predictor(data: &[u8], params: &PredictorParams) -> PDFResult<Vec<u8>> {
    let row_bytes = params.row_bytes();
    let bpp = params.pixel_bytes();
    let mut output = Vec::with_capacity(data.len());
    let mut prev = vec![0u8; row_bytes];
    let mut row = vec![0u8; row_bytes];

    for chunk in data.chunks(row_bytes + 1) {
        let filter = chunk[0];
        let raw = &chunk[1..];
        row[..raw.len()].copy_from_slice(raw);
        row[raw.len()..].fill(0);

        match filter {
            0 => {}
            1 => {
                for i in bpp..row_bytes {
                    row[i] = row[i].wrapping_add(row[i - bpp]);
                }
            }
            2 => {
                for i in 0..row_bytes {
                    row[i] = row[i].wrapping_add(prev[i]);
                }
            }
            3 => {
                for i in 0..row_bytes {
                    let left = if i >= bpp { row[i - bpp] as u16 } else { 0 };
                    row[i] = row[i].wrapping_add(((left + prev[i] as u16) / 2) as u8);
                }
            }
            4 => {
                for i in 0..row_bytes {
                    let (left, up_left) = if i >= bpp {
                        (row[i - bpp], prev[i - bpp])
                    } else {
                        (0, 0)
                    };
                    row[i] = row[i].wrapping_add(paeth(left, prev[i], up_left));
                }
            }
            other => {
                return Err(PDFError::Generic(format!(
                    "Unsupported PNG filter type {}",
                    other
                )));
            }
        }

        output.extend_from_slice(&row[..raw.len()]);
        std::mem::swap(&mut prev, &mut row);
    }

    Ok(output)
}

fn paeth(left: u8, up: u8, up_left: u8) -> u8 {
    let p = left as i16 + up as i16 - up_left as i16;
    let pa = (p - left as i16).abs();
    let pb = (p - up as i16).abs();
    let pc = (p - up_left as i16).abs();
    if pa <= pb && pa <= pc {
        left
    } else if pb <= pc {
        up
    } else {
        up_left
    }
}

/// Reverses TIFF predictor 2 (horizontal differencing).
fn decode_tiff_predictor(mut data: Vec<u8>, params: &PredictorParams) -> Vec<u8> {
    let row_bytes = params.row_bytes();
    let colors = params.colors;

    match params.bits_per_component {
        8 => {
            for row in data.chunks_mut(row_bytes) {
                for i in colors..row.len() {
                    row[i] = row[i].wrapping_add(row[i - colors]);
                }
            }
        }
        16 => {
            let step = colors * 2;
            for row in data.chunks_mut(row_bytes) {
                let mut i = step;
                while i + 1 < row.len() {
                    let prev = u16::from_be_bytes([row[i - step], row[i - step + 1]]);
                    let cur = u16::from_be_bytes([row[i], row[i + 1]]);
                    row[i..i + 2].copy_from_slice(&cur.wrapping_add(prev).to_be_bytes());
                    i += 2;
                }
            }
        }
        bits => {
            // sub-byte samples: unpack, accumulate per component, repack
            let mask = (1u32 << bits) - 1;
            for row in data.chunks_mut(row_bytes) {
                let samples = row.len() * 8 / bits;
                let mut last = vec![0u32; colors];
                let mut values = Vec::with_capacity(samples);
                for s in 0..samples {
                    let v = read_bits(row, s * bits, bits);
                    let c = s % colors;
                    last[c] = (last[c] + v) & mask;
                    values.push(last[c]);
                }
                for (s, v) in values.into_iter().enumerate() {
                    write_bits(row, s * bits, bits, v);
                }
            }
        }
    }
    data
}

fn read_bits(row: &[u8], bit_offset: usize, bits: usize) -> u32 {
    let mut value = 0u32;
    for b in 0..bits {
        let pos = bit_offset + b;
        let bit = (row[pos / 8] >> (7 - pos % 8)) & 1;
        value = value << 1 | bit as u32;
    }
    value
}

fn write_bits(row: &mut [u8], bit_offset: usize, bits: usize, value: u32) {
    for b in 0..bits {
        let pos = bit_offset + b;
        let bit = ((value >> (bits - 1 - b)) & 1) as u8;
        let shift = 7 - pos % 8;
        row[pos / 8] = (row[pos / 8] & !(1 << shift)) | (bit << shift);
    }
}
