//! WAV parsing and concatenation
//!
//! The upstream TTS service returns canonical RIFF/WAVE PCM files. Segment
//! audio is stitched together by stripping each file down to its PCM payload
//! and writing one fresh 44-byte header over the combined data.

use thiserror::Error;

/// WAV codec errors
#[derive(Error, Debug)]
pub enum WavError {
    #[error("WAV data too short: {0} bytes")]
    TooShort(usize),

    #[error("Invalid {0} header")]
    InvalidHeader(&'static str),

    #[error("Missing {0} chunk")]
    MissingChunk(&'static str),

    #[error("Truncated fmt chunk: {0} bytes")]
    TruncatedFmt(usize),
}

/// Format fields of a `fmt ` chunk (PCM subset).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WavFormat {
    pub audio_format: u16,
    pub num_channels: u16,
    pub sample_rate: u32,
    pub byte_rate: u32,
    pub block_align: u16,
    pub bits_per_sample: u16,
}

impl WavFormat {
    /// Parse the first 16 bytes of a `fmt ` chunk payload.
    fn from_fmt_payload(payload: &[u8]) -> Result<Self, WavError> {
        if payload.len() < 16 {
            return Err(WavError::TruncatedFmt(payload.len()));
        }
        Ok(Self {
            audio_format: u16::from_le_bytes([payload[0], payload[1]]),
            num_channels: u16::from_le_bytes([payload[2], payload[3]]),
            sample_rate: u32::from_le_bytes([payload[4], payload[5], payload[6], payload[7]]),
            byte_rate: u32::from_le_bytes([payload[8], payload[9], payload[10], payload[11]]),
            block_align: u16::from_le_bytes([payload[12], payload[13]]),
            bits_per_sample: u16::from_le_bytes([payload[14], payload[15]]),
        })
    }
}

/// Parsed header info: format plus the location of the PCM payload.
#[derive(Debug, Clone, Copy)]
pub struct WavInfo {
    pub format: WavFormat,
    /// Byte offset where PCM data begins
    pub data_start: usize,
    /// Declared size of the data chunk
    pub data_size: usize,
}

/// Parse a RIFF/WAVE header and locate the first `data` chunk.
///
/// Walks chunks starting at offset 12; each chunk is a 4-byte ID, a 4-byte
/// little-endian size, and the payload (odd sizes are padded to the next
/// even offset). Stops at the first `data` chunk.
pub fn parse_header(data: &[u8]) -> Result<WavInfo, WavError> {
    if data.len() < 44 {
        return Err(WavError::TooShort(data.len()));
    }
    if &data[0..4] != b"RIFF" {
        return Err(WavError::InvalidHeader("RIFF"));
    }
    if &data[8..12] != b"WAVE" {
        return Err(WavError::InvalidHeader("WAVE"));
    }

    let mut pos = 12;
    let mut format: Option<WavFormat> = None;
    let mut data_chunk: Option<(usize, usize)> = None;

    while pos + 8 <= data.len() {
        let chunk_id = &data[pos..pos + 4];
        let chunk_size =
            u32::from_le_bytes([data[pos + 4], data[pos + 5], data[pos + 6], data[pos + 7]])
                as usize;

        if chunk_id == b"fmt " {
            let end = (pos + 8 + chunk_size).min(data.len());
            format = Some(WavFormat::from_fmt_payload(&data[pos + 8..end])?);
        } else if chunk_id == b"data" {
            data_chunk = Some((pos + 8, chunk_size));
            break;
        }

        pos += 8 + chunk_size;
        if chunk_size % 2 == 1 {
            pos += 1;
        }
    }

    let format = format.ok_or(WavError::MissingChunk("fmt "))?;
    let (data_start, data_size) = data_chunk.ok_or(WavError::MissingChunk("data"))?;

    Ok(WavInfo {
        format,
        data_start,
        data_size,
    })
}

/// Extract the PCM payload from a WAV file.
///
/// The declared data size is clamped to the bytes actually present.
pub fn extract_data(data: &[u8]) -> Result<&[u8], WavError> {
    let info = parse_header(data)?;
    let end = (info.data_start + info.data_size).min(data.len());
    Ok(&data[info.data_start..end])
}

/// Build a canonical 44-byte PCM header for the given format and data size.
///
/// Byte rate and block align are recomputed from channels, sample rate, and
/// bit depth; RIFF size is `data_size + 36`.
pub fn build_header(format: &WavFormat, data_size: u32) -> [u8; 44] {
    let byte_rate = format.sample_rate
        * format.num_channels as u32
        * format.bits_per_sample as u32
        / 8;
    let block_align = format.num_channels * format.bits_per_sample / 8;

    let mut header = [0u8; 44];
    header[0..4].copy_from_slice(b"RIFF");
    header[4..8].copy_from_slice(&(data_size + 36).to_le_bytes());
    header[8..12].copy_from_slice(b"WAVE");

    header[12..16].copy_from_slice(b"fmt ");
    header[16..20].copy_from_slice(&16u32.to_le_bytes());
    header[20..22].copy_from_slice(&format.audio_format.to_le_bytes());
    header[22..24].copy_from_slice(&format.num_channels.to_le_bytes());
    header[24..28].copy_from_slice(&format.sample_rate.to_le_bytes());
    header[28..32].copy_from_slice(&byte_rate.to_le_bytes());
    header[32..34].copy_from_slice(&block_align.to_le_bytes());
    header[34..36].copy_from_slice(&format.bits_per_sample.to_le_bytes());

    header[36..40].copy_from_slice(b"data");
    header[40..44].copy_from_slice(&data_size.to_le_bytes());

    header
}

/// Concatenate same-format WAV buffers into a single WAV file.
///
/// Inputs of 44 bytes or less are dropped. An empty result set yields empty
/// bytes; a single survivor is returned verbatim. Otherwise the first input's
/// format is authoritative, inputs whose parse fails are skipped, and a fresh
/// header is written over the combined PCM payload. If the first input itself
/// fails to parse it is returned unchanged as a degraded fallback.
pub fn concatenate<T: AsRef<[u8]>>(parts: &[T]) -> Vec<u8> {
    let parts: Vec<&[u8]> = parts
        .iter()
        .map(|p| p.as_ref())
        .filter(|p| p.len() > 44)
        .collect();

    if parts.is_empty() {
        return Vec::new();
    }
    if parts.len() == 1 {
        return parts[0].to_vec();
    }

    let first = match parse_header(parts[0]) {
        Ok(info) => info,
        Err(e) => {
            tracing::error!("Failed to parse first WAV segment: {}", e);
            return parts[0].to_vec();
        }
    };

    let mut payload = Vec::new();
    let mut extracted = 0usize;
    for (i, wav) in parts.iter().enumerate() {
        match extract_data(wav) {
            Ok(data) => {
                payload.extend_from_slice(data);
                extracted += 1;
            }
            Err(e) => {
                tracing::warn!("Failed to extract audio from segment {}: {}", i, e);
            }
        }
    }

    if extracted == 0 {
        return Vec::new();
    }

    let header = build_header(&first.format, payload.len() as u32);
    let mut result = Vec::with_capacity(44 + payload.len());
    result.extend_from_slice(&header);
    result.extend_from_slice(&payload);

    tracing::debug!(
        "Concatenated {} WAV segments: {} bytes audio data, {} bytes total",
        parts.len(),
        payload.len(),
        result.len()
    );

    result
}
