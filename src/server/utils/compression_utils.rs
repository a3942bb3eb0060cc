use std::io::{Cursor, Read, Write};

use axum::http::{HeaderMap, header};
use brotli::Decompressor;
use flate2::{
    Compression,
    read::{GzDecoder, ZlibDecoder},
    write::GzEncoder,
};
use tracing::debug;

/// decode an upstream body according to its Content-Encoding
///
/// unknown encodings are passed through untouched, the body is most likely already plain and
/// failing the whole request over it helps nobody
pub fn decode_body(bytes: &[u8], encoding: Option<&str>) -> std::io::Result<Vec<u8>> {
    let encoding = encoding.map(|e| e.trim().to_ascii_lowercase());

    match encoding.as_deref() {
        None | Some("") | Some("identity") => Ok(bytes.to_vec()),
        Some("gzip") | Some("x-gzip") => read_all(GzDecoder::new(Cursor::new(bytes))),
        Some("deflate") => read_all(ZlibDecoder::new(Cursor::new(bytes))),
        Some("br") => read_all(Decompressor::new(Cursor::new(bytes), 4096)),
        Some("zstd") => zstd::decode_all(Cursor::new(bytes)),
        Some(other) => {
            debug!("Unknown content-encoding {}, passing body through", other);
            Ok(bytes.to_vec())
        }
    }
}

fn read_all(mut reader: impl Read) -> std::io::Result<Vec<u8>> {
    let mut out = Vec::new();
    reader.read_to_end(&mut out)?;
    Ok(out)
}

/// encodings we can send back to the client
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ResponseEncoding {
    Zstd,
    Gzip,
    None,
}

impl ResponseEncoding {
    /// pick an encoding from the client's Accept-Encoding
    /// apple's HLS player sends "gzip, deflate" or "identity" and it has to be respected
    pub fn negotiate(headers: &HeaderMap) -> Self {
        let Some(accept) = headers
            .get(header::ACCEPT_ENCODING)
            .and_then(|v| v.to_str().ok())
        else {
            return Self::None;
        };

        if accept == "identity" || accept.starts_with("identity,") {
            return Self::None;
        }

        if accept.contains("zstd") {
            Self::Zstd
        } else if accept.contains("gzip") {
            Self::Gzip
        } else {
            Self::None
        }
    }

    pub fn as_header_value(&self) -> Option<&'static str> {
        match self {
            Self::Zstd => Some("zstd"),
            Self::Gzip => Some("gzip"),
            Self::None => None,
        }
    }

    pub fn compress(&self, data: &[u8]) -> std::io::Result<Vec<u8>> {
        match self {
            Self::Zstd => zstd::encode_all(data, 3),
            Self::Gzip => {
                let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
                encoder.write_all(data)?;
                encoder.finish()
            }
            Self::None => Ok(data.to_vec()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gzip(payload: &[u8]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(payload).unwrap();
        encoder.finish().unwrap()
    }

    fn deflate(payload: &[u8]) -> Vec<u8> {
        let mut encoder = flate2::write::ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(payload).unwrap();
        encoder.finish().unwrap()
    }

    fn brotli(payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        {
            let mut writer = brotli::CompressorWriter::new(&mut out, 4096, 5, 22);
            writer.write_all(payload).unwrap();
        }
        out
    }

    #[test]
    fn decodes_identity_and_missing_encodings() {
        let payload = b"#EXTM3U";
        assert_eq!(decode_body(payload, None).unwrap(), payload);
        assert_eq!(decode_body(payload, Some("identity")).unwrap(), payload);
        assert_eq!(decode_body(payload, Some("")).unwrap(), payload);
    }

    #[test]
    fn decodes_gzip_deflate_and_brotli() {
        let payload = b"<html><head></head><body>hello</body></html>";
        assert_eq!(decode_body(&gzip(payload), Some("gzip")).unwrap(), payload);
        assert_eq!(decode_body(&deflate(payload), Some("deflate")).unwrap(), payload);
        assert_eq!(decode_body(&brotli(payload), Some("br")).unwrap(), payload);
        assert_eq!(
            decode_body(&zstd::encode_all(&payload[..], 3).unwrap(), Some("zstd")).unwrap(),
            payload
        );
    }

    #[test]
    fn passes_unknown_encodings_through() {
        let payload = b"opaque";
        assert_eq!(decode_body(payload, Some("compress")).unwrap(), payload);
    }

    #[test]
    fn errors_on_corrupt_gzip() {
        assert!(decode_body(b"definitely not gzip", Some("gzip")).is_err());
    }

    #[test]
    fn negotiates_response_encoding() {
        let mut headers = HeaderMap::new();
        assert_eq!(ResponseEncoding::negotiate(&headers), ResponseEncoding::None);

        headers.insert(header::ACCEPT_ENCODING, "gzip, deflate".parse().unwrap());
        assert_eq!(ResponseEncoding::negotiate(&headers), ResponseEncoding::Gzip);

        headers.insert(header::ACCEPT_ENCODING, "gzip, br, zstd".parse().unwrap());
        assert_eq!(ResponseEncoding::negotiate(&headers), ResponseEncoding::Zstd);

        headers.insert(header::ACCEPT_ENCODING, "identity".parse().unwrap());
        assert_eq!(ResponseEncoding::negotiate(&headers), ResponseEncoding::None);
    }
}
