//! Reply decoder tests over realistic byte streams.
//!
//! Tests verify:
//! - Decoding is independent of how the stream is split into reads
//! - Malformed records are reported and skipped the same way however the
//!   stream is split
//! - Replies are paired with commands in the order the commands were sent

use mas_control::protocol::{encode_reply, Command, Frame, FrameDecoder, REPLY_TERMINATOR};
use mas_control::types::CommandId;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// One poll cycle worth of commands and the replies a controller sends.
fn poll_exchange(cycles: usize) -> (Vec<Command>, Vec<u8>) {
    let mut commands = Vec::new();
    let mut stream = Vec::new();
    for i in 0..cycles {
        commands.push(Command::AllStatus);
        stream.extend(encode_reply(&format!("AS {} 1200 2500 2400", 5000 + i)));
        commands.push(Command::ReadSpinSet);
        stream.extend(encode_reply("VD 5000"));
        commands.push(Command::SetDrivePressure(1200));
        stream.extend(encode_reply("OK"));
    }
    (commands, stream)
}

fn decoder_for(commands: &[Command]) -> FrameDecoder {
    let mut decoder = FrameDecoder::new();
    for (i, command) in commands.iter().enumerate() {
        decoder.expect_reply(CommandId(i as u64 + 1), *command);
    }
    decoder
}

fn decode_in_chunks(commands: &[Command], stream: &[u8], splits: &[usize]) -> Vec<Frame> {
    let mut decoder = decoder_for(commands);
    let mut frames = Vec::new();
    let mut start = 0;
    for &end in splits.iter().chain(std::iter::once(&stream.len())) {
        for frame in decoder.decode(&stream[start..end]) {
            frames.push(frame.expect("stream is well formed"));
        }
        start = end;
    }
    assert_eq!(decoder.buffered(), 0);
    assert_eq!(decoder.pending(), 0);
    frames
}

// ============================================================================
// CHUNK BOUNDARIES
// ============================================================================

#[test]
fn test_random_splits_decode_identically() {
    let (commands, stream) = poll_exchange(20);
    let whole = decode_in_chunks(&commands, &stream, &[]);
    assert_eq!(whole.len(), commands.len());

    let mut rng = StdRng::seed_from_u64(0x4d41_5300);
    for _ in 0..200 {
        let cuts = rng.gen_range(1..40);
        let mut splits: Vec<usize> = (0..cuts).map(|_| rng.gen_range(0..=stream.len())).collect();
        splits.sort_unstable();
        assert_eq!(decode_in_chunks(&commands, &stream, &splits), whole);
    }
}

#[test]
fn test_byte_at_a_time_and_split_terminator() {
    let (commands, stream) = poll_exchange(3);
    let whole = decode_in_chunks(&commands, &stream, &[]);

    let every_byte: Vec<usize> = (1..stream.len()).collect();
    assert_eq!(decode_in_chunks(&commands, &stream, &every_byte), whole);

    // Cut between the two terminator bytes of the first reply.
    let first_end = stream
        .windows(2)
        .position(|w| w == REPLY_TERMINATOR)
        .unwrap();
    assert_eq!(decode_in_chunks(&commands, &stream, &[first_end + 1]), whole);
}

#[test]
fn test_replies_pair_in_send_order() {
    let (commands, stream) = poll_exchange(2);
    let frames = decode_in_chunks(&commands, &stream, &[]);
    let ids: Vec<u64> = frames.iter().map(|f| f.command_id().0).collect();
    assert_eq!(ids, (1..=6).collect::<Vec<u64>>());
    assert!(matches!(frames[0], Frame::Telemetry { frequency_raw, .. } if frequency_raw == 5000.0));
    assert!(matches!(frames[3], Frame::Telemetry { frequency_raw, .. } if frequency_raw == 5001.0));
    assert!(matches!(frames[2], Frame::Ack { .. }));
}

// ============================================================================
// RESYNC
// ============================================================================

#[test]
fn test_resync_is_independent_of_chunking() {
    let commands = [
        Command::AllStatus,
        Command::AllStatus,
        Command::AllStatus,
        Command::LinkTest,
    ];
    let mut stream = encode_reply("AS 5000 1200 2500 2400");
    // Plain ASCII without the high bit.
    stream.extend(b"AS 5005 1200 2500 2400");
    stream.extend(REPLY_TERMINATOR);
    // Wrong field count.
    stream.extend(encode_reply("AS 5010 1200"));
    stream.extend(encode_reply("OK"));

    let whole = decoder_for(&commands).decode(&stream);
    assert_eq!(whole.len(), 4);
    assert!(whole[0].is_ok());
    assert!(whole[1].is_err());
    assert!(whole[2].is_err());
    assert_eq!(whole[3], Ok(Frame::Ack { command_id: CommandId(4) }));

    let mut rng = StdRng::seed_from_u64(0x8d8a);
    for _ in 0..100 {
        let mut decoder = decoder_for(&commands);
        let mut results = Vec::new();
        let mut rest = stream.as_slice();
        while !rest.is_empty() {
            let take = rng.gen_range(1..=rest.len().min(16));
            results.extend(decoder.decode(&rest[..take]));
            rest = &rest[take..];
        }
        assert_eq!(results, whole);
    }
}
