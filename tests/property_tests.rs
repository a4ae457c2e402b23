//! Property-based tests for the send policy and the wire framing

use proptest::prelude::*;
use ptsentry::handlers::is_accepted_retval;
use ptsentry::proto::{
    frame, read_frame, ExitCause, ExitMsg, FileInfo, ForkMsg, Message, OpenMsg, SyscallMsg,
    SyscallPayload,
};
use std::io::Cursor;

fn msg_with_retval(retval: i64) -> SyscallMsg {
    SyscallMsg {
        retval,
        ..Default::default()
    }
}

fn payload_strategy() -> impl Strategy<Value = SyscallPayload> {
    prop_oneof![
        ("/[a-z/]{0,40}", any::<u32>(), any::<u32>()).prop_map(|(path, flags, mode)| {
            SyscallPayload::Open(OpenMsg {
                file: FileInfo::new(path),
                flags,
                mode,
            })
        }),
        any::<u32>().prop_map(|ppid| SyscallPayload::Fork(ForkMsg { ppid })),
        any::<u32>().prop_map(|code| SyscallPayload::Exit(ExitMsg {
            cause: ExitCause::Exited,
            code
        })),
    ]
}

fn message_strategy() -> impl Strategy<Value = Message> {
    (any::<u32>(), any::<u64>(), "[0-9a-f]{0,64}", any::<i64>(), payload_strategy()).prop_map(
        |(pid, timestamp, container_id, retval, payload)| {
            Message::Syscall(SyscallMsg {
                pid,
                timestamp,
                container_id,
                span_context: None,
                retval,
                payload,
            })
        },
    )
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    #[test]
    fn prop_non_negative_retval_is_sent(retval in 0i64..i64::MAX) {
        prop_assert!(is_accepted_retval(&msg_with_retval(retval)));
    }

    #[test]
    fn prop_only_permission_errors_are_sent(errno in 1i64..4096) {
        let sent = is_accepted_retval(&msg_with_retval(-errno));
        let expected = errno == libc::EPERM as i64 || errno == libc::EACCES as i64;
        prop_assert_eq!(sent, expected);
    }

    #[test]
    fn prop_frames_read_back_in_order(messages in prop::collection::vec(message_strategy(), 1..8)) {
        let mut stream = Vec::new();
        for msg in &messages {
            stream.extend_from_slice(&msg.to_frame().unwrap());
        }

        let mut cursor = Cursor::new(stream);
        for msg in &messages {
            let payload = read_frame(&mut cursor).unwrap();
            prop_assert_eq!(&Message::decode(&payload).unwrap(), msg);
        }
        prop_assert!(read_frame(&mut cursor).is_err());
    }

    #[test]
    fn prop_frame_prefix_is_payload_length(payload in prop::collection::vec(any::<u8>(), 0..512)) {
        let framed = frame(&payload).unwrap();
        let len = u32::from_ne_bytes([framed[0], framed[1], framed[2], framed[3]]) as usize;
        prop_assert_eq!(len, payload.len());
        prop_assert_eq!(&framed[4..], &payload[..]);
    }
}
