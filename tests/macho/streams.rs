use machscope::formats::macho::opcodes::dedup_by_address;
use machscope::formats::macho::{BindStreamKind, MachOError, MachOParser, WriteKind};
use machscope::DecodeBudget;

use crate::common::{basic_image, ImageBuilder, Segment};

const DATA_FILEOFF: usize = 0x4000;

fn lazy_entry(symbol: &str, offset: u8) -> Vec<u8> {
    let mut ops = vec![0x72, offset, 0x11, 0x40];
    ops.extend_from_slice(symbol.as_bytes());
    ops.extend_from_slice(&[0x00, 0x90, 0x00]);
    ops
}

#[test]
fn lazy_stream_continues_past_done() {
    let mut builder = basic_image();
    builder.lazy_bind = [lazy_entry("_open", 0x00), lazy_entry("_close", 0x08)].concat();
    let image = builder.build();

    let parser = MachOParser::parse(&image).expect("parse");
    let segments = parser.segments().expect("segments");
    let actions: Vec<_> = parser
        .binds(&segments, BindStreamKind::Lazy)
        .expect("lazy data")
        .collect::<Result<_, _>>()
        .expect("decode lazy binds");

    let symbols: Vec<_> = actions.iter().map(|a| a.symbol.as_str()).collect();
    assert_eq!(symbols, vec!["_open", "_close"]);
    assert!(actions.iter().all(|a| a.kind == WriteKind::Pointer));
    assert_eq!(actions[1].address, 0x1_0000_4008);
}

#[test]
fn normal_stream_rejects_opcodes_after_done() {
    let mut builder = basic_image();
    builder.bind = [lazy_entry("_open", 0x00), lazy_entry("_close", 0x08)].concat();
    builder.bind.insert(2, 0x51);
    let image = builder.build();

    let parser = MachOParser::parse(&image).expect("parse");
    let segments = parser.segments().expect("segments");
    let results: Vec<_> = parser
        .binds(&segments, BindStreamKind::Normal)
        .expect("bind data")
        .collect();

    assert_eq!(results.len(), 2);
    assert_eq!(results[0].as_ref().map(|a| a.symbol.as_str()), Ok("_open"));
    assert!(matches!(results[1], Err(MachOError::TrailingBytes { .. })));
}

#[test]
fn truncated_bind_range_is_not_a_complete_stream() {
    let mut builder = basic_image();
    // ends on an opcode boundary, but the DONE is gone
    builder.bind = vec![0x11, 0x40, b'_', b'x', 0x00, 0x51, 0x72, 0x00, 0x90];
    let image = builder.build();

    let parser = MachOParser::parse(&image).expect("parse");
    let segments = parser.segments().expect("segments");
    let results: Vec<_> = parser
        .binds(&segments, BindStreamKind::Normal)
        .expect("bind data")
        .collect();

    assert_eq!(results.len(), 2);
    assert_eq!(results[0].as_ref().map(|a| a.address), Ok(0x1_0000_4000));
    assert_eq!(results[1], Err(MachOError::MissingDone { offset: 9 }));
}

#[test]
fn weak_stream_defaults_to_weak_lookup() {
    let mut builder = basic_image();
    builder.weak_bind = vec![
        0x40, b'_', b'w', 0x00, 0x51, 0x72, 0x10, 0x90, 0x00, 0x00, 0x00,
    ];
    let image = builder.build();

    let parser = MachOParser::parse(&image).expect("parse");
    let segments = parser.segments().expect("segments");
    let actions: Vec<_> = parser
        .binds(&segments, BindStreamKind::Weak)
        .expect("weak data")
        .collect::<Result<_, _>>()
        .expect("decode weak binds");

    assert_eq!(actions.len(), 1);
    assert_eq!(actions[0].ordinal, -3);
    assert_eq!(parser.ordinal_name(actions[0].ordinal), Some("weak"));
}

#[test]
fn threaded_chain_binds_through_image() {
    let slot0: u64 = (1 << 62) | (1 << 51);
    let slot1: u64 = (1 << 63) | (1 << 62) | 1;
    let mut builder = basic_image()
        .patch(DATA_FILEOFF, &slot0.to_le_bytes())
        .patch(DATA_FILEOFF + 8, &slot1.to_le_bytes());
    builder.bind = vec![
        0xD0, 0x02, // SET_BIND_ORDINAL_TABLE_SIZE_ULEB 2
        0x11, 0x40, b'_', b'a', 0x00, 0x90, // table[0]
        0x40, b'_', b'b', 0x00, 0x90, // table[1]
        0x72, 0x00, // SET_SEGMENT_AND_OFFSET_ULEB 2, 0
        0xD1, // THREADED_APPLY
        0x00,
    ];
    let image = builder.build();

    let parser = MachOParser::parse(&image).expect("parse");
    let segments = parser.segments().expect("segments");
    let actions: Vec<_> = parser
        .binds(&segments, BindStreamKind::Normal)
        .expect("bind data")
        .collect::<Result<_, _>>()
        .expect("decode threaded binds");

    assert_eq!(actions.len(), 2);
    assert_eq!(actions[0].symbol, "_a");
    assert_eq!(actions[0].address, 0x1_0000_4000);
    assert_eq!(actions[0].kind, WriteKind::Pointer);
    assert_eq!(actions[1].symbol, "_b");
    assert_eq!(actions[1].address, 0x1_0000_4008);
    assert_eq!(actions[1].kind, WriteKind::AuthenticatedPointer);
}

#[test]
fn repeated_address_is_flagged_by_dedup() {
    let mut builder = basic_image();
    builder.bind = vec![
        0x11, 0x40, b'_', b'd', 0x00, 0x51, //
        0x72, 0x00, 0x90, // bind at __DATA+0
        0x72, 0x00, 0x90, // and again
        0x00,
    ];
    let image = builder.build();

    let parser = MachOParser::parse(&image).expect("parse");
    let segments = parser.segments().expect("segments");
    let stream = parser
        .binds(&segments, BindStreamKind::Normal)
        .expect("bind data");
    let results: Vec<_> = dedup_by_address(stream).collect();

    assert_eq!(results.len(), 2);
    assert!(results[0].is_ok());
    assert_eq!(
        results[1],
        Err(MachOError::MultipleBindsForAddress {
            address: 0x1_0000_4000
        })
    );
}

#[test]
fn action_budget_caps_rebase_stream() {
    let mut builder = basic_image();
    builder.rebase = vec![0x11, 0x22, 0x00, 0x60, 0x80, 0x01, 0x00];
    let image = builder.build();

    let budget = DecodeBudget {
        max_actions: 16,
        ..DecodeBudget::default()
    };
    let parser = MachOParser::parse_with_budget(&image, &budget).expect("parse");
    let segments = parser.segments().expect("segments");
    let results: Vec<_> = parser.rebases(&segments).expect("rebase data").collect();

    assert_eq!(results.len(), 17);
    assert!(results[..16].iter().all(Result::is_ok));
    assert_eq!(
        results[16],
        Err(MachOError::ActionLimitExceeded { limit: 16 })
    );
}

#[test]
fn rebase_on_32_bit_image_uses_four_byte_slots() {
    let mut builder = ImageBuilder {
        is_32: true,
        cputype: 12,
        ..ImageBuilder::new()
    }
    .segment(Segment::new("__DATA", 0x4000, 0x1000, 0x1000, 0x1000))
    .body_size(0x2000);
    builder.rebase = vec![0x11, 0x20, 0x00, 0x53, 0x00];
    let image = builder.build();

    let parser = MachOParser::parse(&image).expect("parse");
    let segments = parser.segments().expect("segments");
    let addresses: Vec<u64> = parser
        .rebases(&segments)
        .expect("rebase data")
        .map(|r| r.map(|a| a.address))
        .collect::<Result<_, _>>()
        .expect("decode rebases");

    assert_eq!(addresses, vec![0x4000, 0x4004, 0x4008]);
}

#[test]
fn add_address_overflow_is_reported() {
    let mut builder = basic_image();
    // ADD_ADDR_ULEB u64::MAX from segment 2
    builder.rebase = vec![
        0x11, 0x22, 0x00, 0x30, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0x01, 0x00,
    ];
    let image = builder.build();

    let parser = MachOParser::parse(&image).expect("parse");
    let segments = parser.segments().expect("segments");
    let results: Vec<_> = parser.rebases(&segments).expect("rebase data").collect();

    assert_eq!(
        results,
        vec![Err(MachOError::OutOfBoundsSegmentAddr { offset: 3 })]
    );
}

#[test]
fn big_endian_image_decodes_streams() {
    let mut builder = ImageBuilder {
        big_endian: true,
        cputype: 18 | 0x0100_0000,
        ..ImageBuilder::new()
    }
    .segment(Segment::new("__DATA", 0x1000, 0x1000, 0x1000, 0x1000))
    .body_size(0x2000);
    builder.rebase = vec![0x11, 0x20, 0x00, 0x52, 0x00];
    let image = builder.build();

    let parser = MachOParser::parse(&image).expect("parse");
    assert_eq!(
        parser.header().endian,
        machscope::formats::macho::Endianness::Big
    );
    let segments = parser.segments().expect("segments");
    assert_eq!(segments.by_name("__DATA").map(|s| s.vmaddr()), Some(0x1000));
    let count = parser.rebases(&segments).expect("rebase data").count();
    assert_eq!(count, 2);
}
