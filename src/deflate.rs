//! Stateless DEFLATE passes for the permessage-deflate write path
//! (RFC 7692 §7).
//!
//! Each pass runs a fresh `flate2::Compress` primed with the caller's
//! preset dictionary and sync-flushes, so every invocation emits a
//! complete, independently decodable block. No compressor object survives
//! between messages; context takeover is entirely a property of the
//! dictionary the caller supplies.

use flate2::{Compress, Compression, FlushCompress, Status};

use crate::error::{Error, Result};
use crate::trim::TrimWriter;

/// Default LZ77 window size (32KB = 2^15)
pub const DEFAULT_WINDOW_BITS: u8 = 15;

/// Minimum LZ77 window size (256 bytes = 2^8)
pub const MIN_WINDOW_BITS: u8 = 8;

/// Maximum LZ77 window size (32KB = 2^15)
pub const MAX_WINDOW_BITS: u8 = 15;

/// Compress `input` through the trim writer as one sync-flushed block.
///
/// `dict` is the preset dictionary (the sliding window contents). An empty
/// `input` still flushes, which is how the final block of a message is
/// produced before the trailer is validated and discarded.
pub(crate) fn stateless_deflate(
    out: &mut TrimWriter,
    input: &[u8],
    dict: &[u8],
    level: u32,
) -> Result<()> {
    let mut enc = Compress::new_with_window_bits(Compression::new(level), false, DEFAULT_WINDOW_BITS);
    if !dict.is_empty() {
        enc.set_dictionary(dict)
            .map_err(|e| Error::Compression(format!("failed to set preset dictionary: {e}")))?;
    }

    let mut chunk = [0u8; 4096];
    let mut consumed = 0usize;
    loop {
        let before_in = enc.total_in();
        let before_out = enc.total_out();

        let status = enc
            .compress(&input[consumed..], &mut chunk, FlushCompress::Sync)
            .map_err(|e| Error::Compression(format!("deflate error: {e}")))?;

        consumed += (enc.total_in() - before_in) as usize;
        let produced = (enc.total_out() - before_out) as usize;
        out.write(&chunk[..produced]);

        match status {
            Status::StreamEnd => break,
            Status::Ok | Status::BufError => {
                // The flush is complete once all input is consumed and the
                // output chunk was not filled to the brim.
                if consumed >= input.len() && produced < chunk.len() {
                    break;
                }
            }
        }
    }
    Ok(())
}

/// Negotiated permessage-deflate parameters, as parsed from the extension
/// header agreed on at handshake time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeflateParams {
    /// If true, the client must reset its dictionary after each message
    pub client_no_context_takeover: bool,
    /// If true, the server must reset its dictionary after each message
    pub server_no_context_takeover: bool,
}

/// Parse the parameter list of a negotiated `permessage-deflate` extension
/// header value, e.g. `"permessage-deflate; client_no_context_takeover"`.
///
/// `*_max_window_bits` values are range-checked and otherwise ignored: the
/// write path always compresses with the full 32KB LZ77 window, which any
/// window size a peer may negotiate can decode.
pub fn parse_deflate_params(value: &str) -> Result<DeflateParams> {
    let value = value.trim();
    let rest = value
        .strip_prefix("permessage-deflate")
        .ok_or(Error::InvalidState("not a permessage-deflate extension"))?
        .trim_start();

    let mut params = DeflateParams::default();
    if rest.is_empty() {
        return Ok(params);
    }
    let rest = rest
        .strip_prefix(';')
        .ok_or(Error::InvalidState("malformed extension parameters"))?;

    for part in rest.split(';') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let (name, param_value) = match part.split_once('=') {
            Some((n, v)) => (n.trim(), Some(v.trim().trim_matches('"'))),
            None => (part, None),
        };
        match name {
            "client_no_context_takeover" => {
                if param_value.is_some() {
                    return Err(Error::InvalidState(
                        "client_no_context_takeover must not have a value",
                    ));
                }
                params.client_no_context_takeover = true;
            }
            "server_no_context_takeover" => {
                if param_value.is_some() {
                    return Err(Error::InvalidState(
                        "server_no_context_takeover must not have a value",
                    ));
                }
                params.server_no_context_takeover = true;
            }
            "client_max_window_bits" | "server_max_window_bits" => {
                if let Some(v) = param_value {
                    let bits: u8 = v
                        .parse()
                        .map_err(|_| Error::InvalidState("invalid max_window_bits value"))?;
                    if !(MIN_WINDOW_BITS..=MAX_WINDOW_BITS).contains(&bits) {
                        return Err(Error::InvalidState("max_window_bits out of range (8-15)"));
                    }
                }
            }
            _ => return Err(Error::InvalidState("unknown permessage-deflate parameter")),
        }
    }

    Ok(params)
}
