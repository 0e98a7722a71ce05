//! Property-based checks of the decoders over arbitrary input bytes.

use std::collections::HashSet;

use machscope::formats::macho::bind::BindStream;
use machscope::formats::macho::exports::ExportTrie;
use machscope::formats::macho::load_commands::SegmentCommand;
use machscope::formats::macho::rebase::RebaseStream;
use machscope::formats::macho::segments::SegmentCollection;
use machscope::formats::macho::{BindStreamKind, MachOError, PointerWidth};
use proptest::prelude::*;

use crate::common::{flat_trie, uleb};

const DATA_VMADDR: u64 = 0x1000_0000_0000;
const DATA_VMSIZE: u64 = 0x1_0000;

fn command(name: &str, vmaddr: u64, vmsize: u64, fileoff: u64, filesize: u64) -> SegmentCommand {
    SegmentCommand {
        segname: name.to_string(),
        vmaddr,
        vmsize,
        fileoff,
        filesize,
        maxprot: 7,
        initprot: 3,
        nsects: 0,
        flags: 0,
        sections: Vec::new(),
    }
}

fn two_segments() -> SegmentCollection {
    let commands = [
        command("__TEXT", 0x1000, 0x4000, 0, 0x4000),
        command("__DATA", DATA_VMADDR, DATA_VMSIZE, 0x4000, 0x4000),
    ];
    SegmentCollection::build(&commands, PointerWidth::Bits64, 0x1_0000).expect("valid segments")
}

fn binary_data(max: usize) -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 0..=max)
}

fn bind_kind() -> impl Strategy<Value = BindStreamKind> {
    prop_oneof![
        Just(BindStreamKind::Normal),
        Just(BindStreamKind::Lazy),
        Just(BindStreamKind::Weak),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 256,
        ..ProptestConfig::default()
    })]

    /// Decoding the same bytes twice gives identical sequences.
    #[test]
    fn decoding_is_idempotent(data in binary_data(256), kind in bind_kind()) {
        let segments = two_segments();

        let trie_a: Vec<_> = ExportTrie::new(&data).collect();
        let trie_b: Vec<_> = ExportTrie::new(&data).collect();
        prop_assert_eq!(trie_a, trie_b);

        let bind_a: Vec<_> = BindStream::new(&data, &segments, kind).take(512).collect();
        let bind_b: Vec<_> = BindStream::new(&data, &segments, kind).take(512).collect();
        prop_assert_eq!(bind_a, bind_b);

        let rebase_a: Vec<_> = RebaseStream::new(&data, &segments).take(512).collect();
        let rebase_b: Vec<_> = RebaseStream::new(&data, &segments).take(512).collect();
        prop_assert_eq!(rebase_a, rebase_b);
    }

    /// Every emitted action lies inside a real segment.
    #[test]
    fn actions_stay_inside_segments(data in binary_data(256), kind in bind_kind()) {
        let segments = two_segments();

        for action in BindStream::new(&data, &segments, kind).take(512).flatten() {
            let segment = segments.segment_at(action.segment_index);
            prop_assert!(segment.is_some());
            let segment = segment.unwrap();
            prop_assert!(action.segment_offset < segment.vmsize());
            prop_assert_eq!(action.address, segment.vmaddr() + action.segment_offset);
        }
        for action in RebaseStream::new(&data, &segments).take(512).flatten() {
            let segment = segments.segment_at(action.segment_index);
            prop_assert!(segment.is_some());
            prop_assert!(action.segment_offset < segment.unwrap().vmsize());
        }
    }

    /// Accepted collections never contain overlapping segments.
    #[test]
    fn accepted_segments_do_not_overlap(
        specs in prop::collection::vec((0u64..0x40, 0u64..0x10, 0u64..0x40, 0u64..0x10), 1..8)
    ) {
        let commands: Vec<_> = specs
            .iter()
            .map(|&(vmaddr, vmsize, fileoff, filesize)| {
                command("__SEG", vmaddr * 0x100, vmsize * 0x100, fileoff * 0x100, filesize.min(vmsize) * 0x100)
            })
            .collect();

        let segments = match SegmentCollection::build(&commands, PointerWidth::Bits64, 0x10_0000) {
            Ok(segments) => segments,
            Err(partial) => partial.segments,
        };
        let all: Vec<_> = segments.iter().collect();
        for (i, a) in all.iter().enumerate() {
            for b in &all[i + 1..] {
                prop_assert!(!a.memory_range.overlaps(&b.memory_range));
                prop_assert!(!a.file_range.overlaps(&b.file_range));
            }
        }
    }

    /// A trie walk reports each node at most once and always terminates.
    #[test]
    fn trie_nodes_are_visited_once(data in binary_data(512)) {
        let mut seen = HashSet::new();
        let mut count = 0usize;
        for record in ExportTrie::new(&data).flatten() {
            prop_assert!(seen.insert(record.node_offset));
            prop_assert!(record.node_offset < data.len());
            count += 1;
        }
        prop_assert!(count <= data.len());
    }

    /// A flat trie decodes back to its names and offsets, in edge order.
    #[test]
    fn flat_trie_decodes_to_its_entries(
        names in prop::collection::btree_set("_[a-z]{1,12}", 1..20),
        offsets in prop::collection::vec(any::<u32>(), 20)
    ) {
        let names: Vec<String> = names.into_iter().collect();
        let entries: Vec<(&str, u64)> = names
            .iter()
            .zip(&offsets)
            .map(|(name, &offset)| (name.as_str(), u64::from(offset)))
            .collect();
        let data = flat_trie(&entries);

        let decoded: Result<Vec<_>, _> = ExportTrie::new(&data)
            .map(|record| record.map(|r| { let offset = r.offset(); (r.name, offset) }))
            .collect();
        let expected: Vec<_> = entries
            .iter()
            .map(|&(name, offset)| (name.to_string(), Some(offset)))
            .collect();
        prop_assert_eq!(decoded, Ok(expected));
    }

    /// Adding past the address width fails instead of wrapping.
    #[test]
    fn address_arithmetic_never_wraps(first in any::<u64>(), second in any::<u64>()) {
        let segments = two_segments();
        let mut ops = vec![0x11, 0x21, 0x00, 0x30];
        ops.extend(uleb(first));
        ops.push(0x30);
        ops.extend(uleb(second));
        ops.extend_from_slice(&[0x51, 0x00]);

        let results: Vec<_> = RebaseStream::new(&ops, &segments).collect();
        prop_assert_eq!(results.len(), 1);

        let total = u128::from(first) + u128::from(second);
        if total < u128::from(DATA_VMSIZE) {
            let action = results[0].as_ref().expect("in-bounds rebase");
            prop_assert_eq!(u128::from(action.address), u128::from(DATA_VMADDR) + total);
        } else {
            prop_assert!(
                matches!(results[0], Err(MachOError::OutOfBoundsSegmentAddr { .. })),
                "unexpected result {:?}",
                results[0]
            );
        }
    }
}
