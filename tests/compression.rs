//! Write-path permessage-deflate tests: wire-level RSV1 placement, trailer
//! stripping, context takeover discipline, and round trips through a raw
//! inflater standing in for the receive-side collaborator.

use std::sync::Arc;

use flate2::{Decompress, FlushDecompress, Status};
use riptide_ws::{Conn, MessageType, Options, ReadStatus, Role};
use tokio::io::{AsyncReadExt, DuplexStream};
use tokio_util::sync::CancellationToken;

const DEFLATE_TRAILER: [u8; 4] = [0x00, 0x00, 0xff, 0xff];

/// Inflate a compressed message payload, re-appending the stripped trailer.
fn inflate(compressed: &[u8]) -> Vec<u8> {
    let mut dec = Decompress::new(false);
    let mut input = compressed.to_vec();
    input.extend_from_slice(&DEFLATE_TRAILER);
    let mut out = Vec::new();
    loop {
        let consumed = dec.total_in() as usize;
        out.reserve(32 * 1024);
        let status = dec
            .decompress_vec(&input[consumed..], &mut out, FlushDecompress::Sync)
            .unwrap();
        if dec.total_in() as usize >= input.len() || status == Status::StreamEnd {
            break;
        }
    }
    out
}

struct RawFrame {
    fin: bool,
    rsv1: bool,
    opcode: u8,
    payload: Vec<u8>,
}

/// Read one frame off the raw side, unmasking if needed.
async fn read_raw_frame(raw: &mut DuplexStream) -> RawFrame {
    let mut head = [0u8; 2];
    raw.read_exact(&mut head).await.unwrap();
    let masked = head[1] & 0x80 != 0;
    let len = match head[1] & 0x7F {
        126 => {
            let mut ext = [0u8; 2];
            raw.read_exact(&mut ext).await.unwrap();
            u16::from_be_bytes(ext) as usize
        }
        127 => {
            let mut ext = [0u8; 8];
            raw.read_exact(&mut ext).await.unwrap();
            u64::from_be_bytes(ext) as usize
        }
        n => n as usize,
    };
    let key = if masked {
        let mut key = [0u8; 4];
        raw.read_exact(&mut key).await.unwrap();
        Some(key)
    } else {
        None
    };
    let mut payload = vec![0u8; len];
    raw.read_exact(&mut payload).await.unwrap();
    if let Some(key) = key {
        for (i, b) in payload.iter_mut().enumerate() {
            *b ^= key[i & 3];
        }
    }
    RawFrame {
        fin: head[0] & 0x80 != 0,
        rsv1: head[0] & 0x40 != 0,
        opcode: head[0] & 0x0F,
        payload,
    }
}

/// Collect frames up to and including the FIN frame.
async fn read_raw_message(raw: &mut DuplexStream) -> Vec<RawFrame> {
    let mut frames = Vec::new();
    loop {
        let frame = read_raw_frame(raw).await;
        let fin = frame.fin;
        frames.push(frame);
        if fin {
            return frames;
        }
    }
}

fn flate_options(role: Role, threshold: usize) -> Options {
    let mut opts = Options::with_flate(role);
    opts.flate_threshold = threshold;
    opts
}

// S3: a one-shot write above the threshold is a single compressed FIN
// frame with the sync trailer stripped.
#[tokio::test]
async fn one_shot_compressed_message_is_single_frame() {
    let (s, mut raw) = tokio::io::duplex(64 * 1024);
    let server = Conn::new(s, flate_options(Role::Server, 100));

    let msg = vec![b'A'; 1000];
    server
        .write(&CancellationToken::new(), MessageType::Text, &msg)
        .await
        .unwrap();

    let frame = read_raw_frame(&mut raw).await;
    assert!(frame.fin);
    assert!(frame.rsv1);
    assert_eq!(frame.opcode, 0x1);
    assert!(frame.payload.len() < msg.len());
    assert!(!frame.payload.ends_with(&DEFLATE_TRAILER));
    assert_eq!(inflate(&frame.payload), msg);
}

// Below the threshold the message goes out uncompressed.
#[tokio::test]
async fn below_threshold_stays_plain() {
    let (s, mut raw) = tokio::io::duplex(64 * 1024);
    let server = Conn::new(s, flate_options(Role::Server, 100));

    server
        .write(&CancellationToken::new(), MessageType::Text, b"small")
        .await
        .unwrap();

    let frame = read_raw_frame(&mut raw).await;
    assert!(frame.fin);
    assert!(!frame.rsv1);
    assert_eq!(frame.payload, b"small");
}

// Property 4: in a streamed compressed message, only the first frame
// carries RSV1, and the concatenated payloads inflate to the original.
#[tokio::test]
async fn streamed_compression_sets_rsv1_on_first_frame_only() {
    let (s, mut raw) = tokio::io::duplex(64 * 1024);
    let server = Conn::new(s, flate_options(Role::Server, 0));
    let cancel = CancellationToken::new();

    let chunks: [&[u8]; 3] = [b"hello world, ", b"hello again, ", b"and hello once more"];
    let mut w = server.writer(&cancel, MessageType::Text).await.unwrap();
    for chunk in chunks {
        w.write(chunk).await.unwrap();
    }
    w.close().await.unwrap();

    let frames = read_raw_message(&mut raw).await;
    assert!(frames.len() >= 2);
    assert!(frames[0].rsv1);
    assert_eq!(frames[0].opcode, 0x1);
    for frame in &frames[1..] {
        assert!(!frame.rsv1);
        assert_eq!(frame.opcode, 0x0);
    }
    assert!(frames.last().unwrap().fin);

    let wire: Vec<u8> = frames.iter().flat_map(|f| f.payload.clone()).collect();
    assert_eq!(inflate(&wire), chunks.concat());
}

// A compressed message read by a peer connection surfaces the raw deflate
// bytes with the compressed flag set; inflating is the collaborator's job.
#[tokio::test]
async fn compressed_message_round_trips_between_connections() {
    let (c, s) = tokio::io::duplex(256 * 1024);
    let client = Arc::new(Conn::new(c, flate_options(Role::Client, 0)));
    let server = Conn::new(s, flate_options(Role::Server, 0));

    let msg: Vec<u8> = (0..50_000).map(|i| (i % 17) as u8).collect();
    let sender = {
        let client = client.clone();
        let msg = msg.clone();
        tokio::spawn(async move {
            let cancel = CancellationToken::new();
            let mut w = client.writer(&cancel, MessageType::Binary).await.unwrap();
            for chunk in msg.chunks(9_000) {
                w.write(chunk).await.unwrap();
            }
            w.close().await.unwrap();
        })
    };

    let cancel = CancellationToken::new();
    let (typ, mut reader) = server.reader(&cancel).await.unwrap();
    assert_eq!(typ, MessageType::Binary);
    assert!(reader.compressed());

    let mut wire = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        let (n, status) = reader.read(&mut chunk).await.unwrap();
        wire.extend_from_slice(&chunk[..n]);
        if status == ReadStatus::End {
            break;
        }
    }
    sender.await.unwrap();
    assert_eq!(inflate(&wire), msg);
}

// Property 5: with client_no_context_takeover, two identical messages
// produce byte-identical compressed payloads.
#[tokio::test]
async fn no_context_takeover_resets_the_dictionary() {
    let mut opts = flate_options(Role::Client, 0);
    opts.client_no_context_takeover = true;
    let (c, mut raw) = tokio::io::duplex(64 * 1024);
    let client = Conn::new(c, opts);
    let cancel = CancellationToken::new();

    let msg = b"Hello, World! Hello, World! Hello, World!";
    client.write(&cancel, MessageType::Text, msg).await.unwrap();
    client.write(&cancel, MessageType::Text, msg).await.unwrap();

    let first = read_raw_frame(&mut raw).await;
    let second = read_raw_frame(&mut raw).await;
    assert!(first.rsv1 && second.rsv1);
    assert_eq!(first.payload, second.payload);
    assert_eq!(inflate(&first.payload), msg);
}

// With context takeover allowed, the second message may reference the
// dictionary built by the first and never compresses worse.
#[tokio::test]
async fn context_takeover_reuses_the_dictionary() {
    let (c, mut raw) = tokio::io::duplex(64 * 1024);
    let client = Conn::new(c, flate_options(Role::Client, 0));
    let cancel = CancellationToken::new();

    let msg = b"a websocket message that repeats itself quite a bit";
    client.write(&cancel, MessageType::Text, msg).await.unwrap();
    client.write(&cancel, MessageType::Text, msg).await.unwrap();

    let first = read_raw_frame(&mut raw).await;
    let second = read_raw_frame(&mut raw).await;
    assert!(second.payload.len() <= first.payload.len());
    assert_eq!(inflate(&first.payload), msg);
}

// A zero-byte write while compression is active emits no frame; close
// still produces the final FIN frame.
#[tokio::test]
async fn zero_byte_write_emits_no_frame() {
    let (s, mut raw) = tokio::io::duplex(64 * 1024);
    let server = Conn::new(s, flate_options(Role::Server, 0));
    let cancel = CancellationToken::new();

    let mut w = server.writer(&cancel, MessageType::Text).await.unwrap();
    w.write(b"").await.unwrap();
    w.write(b"data").await.unwrap();
    w.close().await.unwrap();

    let frames = read_raw_message(&mut raw).await;
    // One data frame plus the FIN frame; the empty write produced nothing.
    assert!(frames.len() <= 2);
    assert!(frames[0].rsv1);
    assert_eq!(frames[0].opcode, 0x1);

    let wire: Vec<u8> = frames.iter().flat_map(|f| f.payload.clone()).collect();
    assert_eq!(inflate(&wire), b"data");
}

// Compression only activates on the first frame: a later large write in a
// message that started plain stays plain.
#[tokio::test]
async fn late_large_write_does_not_activate_compression() {
    let (s, mut raw) = tokio::io::duplex(256 * 1024);
    let server = Conn::new(s, flate_options(Role::Server, 100));
    let cancel = CancellationToken::new();

    let mut w = server.writer(&cancel, MessageType::Binary).await.unwrap();
    w.write(b"tiny").await.unwrap();
    w.write(&[b'B'; 5000]).await.unwrap();
    w.close().await.unwrap();

    let frames = read_raw_message(&mut raw).await;
    for frame in &frames {
        assert!(!frame.rsv1);
    }
    let wire: Vec<u8> = frames.iter().flat_map(|f| f.payload.clone()).collect();
    let mut expected = b"tiny".to_vec();
    expected.extend_from_slice(&[b'B'; 5000]);
    assert_eq!(wire, expected);
}
