use proptest::prelude::*;
use strand_proto::{
    decode_message, CompressionStatus, Frame, Header, MessageType, Version, WireError,
    DEFAULT_MESSAGE_SIZE_MAX, HEADER_SIZE, MAX_SIZE,
};

fn message_type() -> impl Strategy<Value = MessageType> {
    prop_oneof![
        Just(MessageType::Request),
        Just(MessageType::RequestBatch),
        Just(MessageType::Reply),
        Just(MessageType::ValidateConnection),
        Just(MessageType::CloseConnection),
    ]
}

fn compression() -> impl Strategy<Value = CompressionStatus> {
    prop_oneof![
        Just(CompressionStatus::NotCompressed),
        Just(CompressionStatus::Uncompressed),
        Just(CompressionStatus::Compressed),
    ]
}

proptest! {
    #[test]
    fn header_round_trips(
        message_type in message_type(),
        compression in compression(),
        size in HEADER_SIZE..=MAX_SIZE,
    ) {
        let header = Header {
            protocol: Version::new(1, 0),
            encoding: Version::new(1, 0),
            message_type,
            compression,
            size,
        };
        let decoded = Header::decode(&header.encode(), MAX_SIZE);
        prop_assert_eq!(decoded, Ok(header));
    }

    #[test]
    fn arbitrary_bytes_never_panic_the_decoder(bytes in proptest::collection::vec(any::<u8>(), 0..256)) {
        let _ = decode_message(&bytes, DEFAULT_MESSAGE_SIZE_MAX);
    }

    #[test]
    fn prepared_frames_decode_to_their_body(
        request_id in 1i32..,
        payload in proptest::collection::vec(any::<u8>(), 0..512),
        compress in any::<bool>(),
    ) {
        let mut frame = Frame::request(request_id, &payload[..]);
        frame.prepare(compress, 1).expect("prepare");
        let bytes = frame.to_vec();

        let (header, body) = decode_message(&bytes, DEFAULT_MESSAGE_SIZE_MAX).expect("decode");
        prop_assert_eq!(header.message_type, MessageType::Request);
        prop_assert_eq!(header.size, bytes.len());
        prop_assert_eq!(&body[..4], &request_id.to_le_bytes()[..]);
        prop_assert_eq!(&body[4..], &payload[..]);
    }
}

#[test]
fn size_field_past_the_limit_is_a_memory_limit_error() {
    let mut header = Header::new(MessageType::Request);
    header.size = DEFAULT_MESSAGE_SIZE_MAX + 1;
    assert_eq!(
        Header::decode(&header.encode(), DEFAULT_MESSAGE_SIZE_MAX),
        Err(WireError::MemoryLimit {
            size: DEFAULT_MESSAGE_SIZE_MAX + 1,
            max: DEFAULT_MESSAGE_SIZE_MAX,
        })
    );
}
