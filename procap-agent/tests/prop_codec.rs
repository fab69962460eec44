mod common;

use common::{encode_exec, encode_exit, encode_packet, encode_packet_header, packet_meta};
use procap_agent::codec::{
    decode_exec, decode_exit, decode_packet, DecodeError, EXEC_EVENT_SIZE, EXIT_EVENT_SIZE,
    PACKET_HEADER_SIZE,
};
use procap_agent::source::per_cpu_buffer_size;
use procap_types::{ExecEvent, EXEC_ARGS_LEN, EXEC_FILENAME_LEN};
use proptest::prelude::*;

// ---------------------------------------------------------------------------
// Property: header + payload decodes back to the same fields and bytes
// ---------------------------------------------------------------------------

proptest! {
    #![proptest_config(ProptestConfig::with_cases(300))]

    #[test]
    fn packet_round_trip(
        ts in any::<u64>(),
        packet_type in 0u8..2,
        ifindex in any::<u32>(),
        wire_len in any::<u64>(),
        pid in any::<u32>(),
        mntns in any::<u32>(),
        netns in any::<u32>(),
        cgroup in proptest::collection::vec(any::<u8>(), 128),
        payload in proptest::collection::vec(any::<u8>(), 0..2048),
        padding in 0usize..8,
    ) {
        let mut meta = packet_meta(ts, ifindex, pid);
        meta.packet_type = packet_type;
        meta.payload_len = wire_len;
        meta.process.mntns_id = mntns;
        meta.process.netns_id = netns;
        meta.process.cgroup_name.copy_from_slice(&cgroup);

        let mut raw = encode_packet(&meta, &payload);
        raw.extend(std::iter::repeat(0u8).take(padding));

        let event = decode_packet(&raw).unwrap();
        prop_assert_eq!(event.meta.timestamp_ns, ts);
        prop_assert_eq!(event.meta.packet_type, packet_type);
        prop_assert_eq!(event.meta.ifindex, ifindex);
        prop_assert_eq!(event.meta.payload_len, wire_len);
        prop_assert_eq!(event.meta.packet_size, payload.len() as u64);
        prop_assert_eq!(event.meta.process.pid, pid);
        prop_assert_eq!(event.meta.process.mntns_id, mntns);
        prop_assert_eq!(event.meta.process.netns_id, netns);
        prop_assert_eq!(&event.meta.process.cgroup_name[..], &cgroup[..]);
        prop_assert_eq!(&event.payload[..], &payload[..]);
    }
}

// ---------------------------------------------------------------------------
// Property: a declared size past the end of the record is rejected
// ---------------------------------------------------------------------------

proptest! {
    #![proptest_config(ProptestConfig::with_cases(300))]

    #[test]
    fn oversized_declaration_is_rejected(
        payload in proptest::collection::vec(any::<u8>(), 0..512),
        excess in 1u64..u64::MAX / 2,
    ) {
        let mut meta = packet_meta(1, 2, 3);
        meta.packet_size = payload.len() as u64 + excess;
        let mut raw = encode_packet_header(&meta);
        raw.extend_from_slice(&payload);

        let err = decode_packet(&raw).unwrap_err();
        prop_assert_eq!(
            err,
            DecodeError::Truncated {
                declared: meta.packet_size,
                available: payload.len(),
            }
        );
    }
}

// ---------------------------------------------------------------------------
// Property: anything shorter than a fixed header never yields an event
// ---------------------------------------------------------------------------

proptest! {
    #![proptest_config(ProptestConfig::with_cases(500))]

    #[test]
    fn short_packet_is_rejected(data in proptest::collection::vec(any::<u8>(), 0..PACKET_HEADER_SIZE)) {
        let is_too_short = matches!(decode_packet(&data), Err(DecodeError::TooShort { .. }));
        prop_assert!(is_too_short);
    }

    #[test]
    fn short_exec_is_rejected(len in 0..EXEC_EVENT_SIZE) {
        let data = vec![0xAAu8; len];
        let is_too_short = matches!(decode_exec(&data), Err(DecodeError::TooShort { .. }));
        prop_assert!(is_too_short);
    }

    #[test]
    fn short_exit_is_rejected(data in proptest::collection::vec(any::<u8>(), 0..EXIT_EVENT_SIZE)) {
        let is_too_short = matches!(decode_exit(&data), Err(DecodeError::TooShort { .. }));
        prop_assert!(is_too_short);
    }
}

// ---------------------------------------------------------------------------
// Property: decoders never panic on arbitrary bytes
// ---------------------------------------------------------------------------

proptest! {
    #![proptest_config(ProptestConfig::with_cases(500))]

    #[test]
    fn decoders_never_panic(data in proptest::collection::vec(any::<u8>(), 0..6000)) {
        let _ = decode_packet(&data);
        let _ = decode_exec(&data);
        let _ = decode_exit(&data);
    }
}

// ---------------------------------------------------------------------------
// Property: exec and exit records decode to the encoded fields
// ---------------------------------------------------------------------------

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    #[test]
    fn exec_round_trip(
        ts in any::<u64>(),
        pid in any::<u32>(),
        ppid in any::<u32>(),
        args_size in 0u32..(EXEC_ARGS_LEN as u32 * 2),
        fill in any::<u8>(),
        truncated in any::<bool>(),
    ) {
        let mut event = ExecEvent::new();
        event.timestamp_ns = ts;
        event.pid = pid;
        event.ppid = ppid;
        event.args_size = args_size;
        event.args_truncated = truncated as u8;
        event.filename = [fill; EXEC_FILENAME_LEN];
        event.args = [fill.wrapping_add(1); EXEC_ARGS_LEN];

        let decoded = decode_exec(&encode_exec(&event)).unwrap();
        prop_assert_eq!(decoded, event);
    }

    #[test]
    fn exit_round_trip(ts in any::<u64>(), pid in any::<u32>()) {
        let event = common::exit_event(pid, ts);
        prop_assert_eq!(decode_exit(&encode_exit(&event)).unwrap(), event);
    }
}

// ---------------------------------------------------------------------------
// Property: per-CPU buffer always holds one maximal record
// ---------------------------------------------------------------------------

proptest! {
    #![proptest_config(ProptestConfig::with_cases(1000))]

    #[test]
    fn buffer_fits_largest_record(
        page_shift in 12u32..17,
        pages in 1usize..256,
        max_event in 0usize..(64 << 20),
    ) {
        let page_size = 1usize << page_shift;
        let size = per_cpu_buffer_size(page_size, pages, max_event);
        prop_assert!(size > max_event);
        prop_assert_eq!(size % page_size, 0);
        prop_assert_eq!(size % (page_size * pages), 0);
        prop_assert!(size >= page_size * pages);
    }
}
