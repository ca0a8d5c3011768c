use std::path::{Path, PathBuf};

use fluent_uri::{
    component::Scheme,
    encoding::{encoder, EString},
    Uri,
};
use thiserror::Error;

use crate::decode::{Decoder, DecoderError};

#[derive(Error, Debug)]
pub enum UriError {
    #[error("Could not resolve {path}: {source}")]
    Path {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid URI: {0}")]
    Invalid(String),
}

/// Network streams are anything reached over http(s).
pub fn is_network(uri: &Uri<String>) -> bool {
    uri.scheme().as_str().eq_ignore_ascii_case("http") || uri.scheme().as_str().eq_ignore_ascii_case("https")
}

/// Pick a decoder for `uri`.
///
/// Local files go to symphonia first, network streams and anything symphonia
/// can't parse go to ffmpeg when it is enabled.
pub fn pick_format(uri: &Uri<String>) -> Result<Box<dyn Decoder>, DecoderError> {
    let mut last_err = DecoderError::Unsupported(uri.to_string());

    // If it's a network stream, use ffmpeg
    #[cfg(feature = "ffmpeg")]
    if is_network(uri) {
        return Ok(Box::new(crate::decode::FfmpegDecoder::new(uri)?));
    }

    // If it's not a network stream, try symphonia
    #[cfg(feature = "symphonia")]
    if uri.scheme().as_str() == "file" {
        match crate::decode::RustyDecoder::new(uri_to_path(uri)) {
            Ok(d) => return Ok(Box::new(d)),
            Err(e) => {
                log::debug!("symphonia could not open {uri}: {e}");
                last_err = e;
            }
        }
    }

    // If symphonia can't parse it, try ffmpeg
    #[cfg(feature = "ffmpeg")]
    {
        match crate::decode::FfmpegDecoder::new(uri) {
            Ok(d) => return Ok(Box::new(d)),
            Err(e) => last_err = e,
        }
    }

    Err(last_err)
}

pub fn path_to_uri<P: AsRef<Path>>(path: &P) -> Result<Uri<String>, UriError> {
    let canonicalized = path.as_ref().canonicalize().map_err(|source| UriError::Path {
        path: path.as_ref().to_path_buf(),
        source,
    })?;
    let path_string = canonicalized.to_string_lossy();

    let mut percent_path: EString<encoder::Path> = EString::new();
    percent_path.encode::<encoder::Path>(&path_string.to_string());
    let uri = Uri::<String>::builder()
        .scheme(Scheme::new_or_panic("file"))
        .path(&percent_path)
        .build()
        .map_err(|e| UriError::Invalid(e.to_string()))?;

    Ok(uri)
}

pub fn uri_to_path(uri: &Uri<String>) -> PathBuf {
    let estr = uri.path();
    let decoded = estr.decode().into_string_lossy();

    PathBuf::from(decoded.to_string())
}

/// Parse user input that is either a URL or a local path.
pub fn make_uri(input: &str) -> Result<Uri<String>, UriError> {
    if input.starts_with("http://") || input.starts_with("https://") || input.starts_with("file:") {
        input
            .parse::<Uri<String>>()
            .map_err(|e| UriError::Invalid(e.to_string()))
    } else {
        path_to_uri(&input)
    }
}
