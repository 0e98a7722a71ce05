#![no_main]
use libfuzzer_sys::fuzz_target;

use machscope::formats::macho::bind::BindStream;
use machscope::formats::macho::exports::ExportTrie;
use machscope::formats::macho::load_commands::SegmentCommand;
use machscope::formats::macho::rebase::RebaseStream;
use machscope::formats::macho::segments::SegmentCollection;
use machscope::formats::macho::{BindStreamKind, PointerWidth};

fuzz_target!(|data: &[u8]| {
    let commands = [SegmentCommand {
        segname: "__DATA".to_string(),
        vmaddr: 0x1_0000_0000,
        vmsize: 0x4000,
        fileoff: 0,
        filesize: 0,
        maxprot: 3,
        initprot: 3,
        nsects: 0,
        flags: 0,
        sections: Vec::new(),
    }];
    let Ok(segments) = SegmentCollection::build(&commands, PointerWidth::Bits64, 0) else {
        return;
    };

    let _ = ExportTrie::new(data).count();
    for kind in [BindStreamKind::Normal, BindStreamKind::Lazy, BindStreamKind::Weak] {
        let _ = BindStream::new(data, &segments, kind)
            .with_image(data, machscope::formats::macho::Endianness::Little)
            .with_action_limit(4096)
            .count();
    }
    let _ = RebaseStream::new(data, &segments).with_action_limit(4096).count();
});
