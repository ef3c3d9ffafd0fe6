//! レポートの整形
//!
//! 解析結果をそのまま端末に出せる文字列にします。桁揃えは gdb 時代のスクリプトの
//! 出力と同じなので、既存のログと突き合わせられます。

use rbprobe_runtime::{
    ClassCount, CollectionKind, FrameRecord, LayoutProfile, PopulationSummary, SizeHistogram,
    StringHistogram, ThreadHandle,
};
use std::fmt::Write;

/// objects stats
pub fn population(summary: &PopulationSummary, profile: &LayoutProfile) -> String {
    let mut out = String::new();
    let _ = writeln!(out);
    let _ = writeln!(out, "  HEAPS    {:>9}", summary.arenas);
    let _ = writeln!(out, "  SLOTS    {:>9}", summary.total);
    let _ = writeln!(out, "  LIVE     {:>9} ({:.2}%)", summary.live, summary.live_percent());
    let _ = writeln!(out, "  FREE     {:>9} ({:.2}%)", summary.free, summary.free_percent());
    let _ = writeln!(out);
    for (tag, count) in summary.sorted_types() {
        let _ = writeln!(
            out,
            "  {:<8} {:>9} ({:.2}%)",
            profile.type_name(tag),
            count,
            summary.type_percent(count)
        );
    }
    let _ = writeln!(out);
    out
}

/// objects classes
pub fn classes(classes: &[ClassCount]) -> String {
    classes
        .iter()
        .map(|c| format!("{:>8} {}\n", c.count, c.name))
        .collect()
}

/// objects nodes
pub fn nodes(nodes: &[(u64, u64)], profile: &LayoutProfile) -> String {
    nodes
        .iter()
        .map(|(node_type, count)| format!("{:>8} {}\n", count, profile.node_type_name(*node_type)))
        .collect()
}

/// objects strings
pub fn strings(histogram: &StringHistogram) -> String {
    let mut out = String::new();
    for (text, count) in &histogram.entries {
        let _ = writeln!(out, "{:>9} {:?}", count, text);
    }
    let _ = writeln!(out);
    let _ = writeln!(out, "{:>9} unique strings", histogram.unique());
    let _ = writeln!(out, "{:>9} bytes", histogram.bytes);
    let _ = writeln!(out);
    out
}

/// objects hashes / objects arrays
pub fn sizes(histogram: &SizeHistogram) -> String {
    let noun = match histogram.kind {
        CollectionKind::Hash => "hashes",
        CollectionKind::Array => "arrays",
    };
    let mut out = String::new();
    for (size, bucket) in &histogram.buckets {
        let samples: Vec<String> = bucket.samples.iter().map(|a| format!("0x{:x}", a)).collect();
        let _ = writeln!(out, "{:>8} of size {:<6} {}", bucket.count, size, samples.join(" "));
    }
    let _ = writeln!(out);
    let _ = writeln!(out, "{:>9} {}", histogram.instances, noun);
    let _ = writeln!(out, "{:>9} elements", histogram.elements);
    let _ = writeln!(out);
    out
}

/// スレッド1行
///
/// 実行中のスレッド以外は退避されたスタックのバイト数を末尾に付けます。
pub fn thread_line(thread: &ThreadHandle, status: &str, wait: &str) -> String {
    let mut line = format!(
        "0x{:x} {} {} thread  {:<16} {:<22}    ",
        thread.address,
        if thread.is_main { "main" } else { "    " },
        if thread.is_current { "curr" } else { "    " },
        status,
        wait
    );
    if !thread.is_current {
        let _ = write!(line, " {:>8} bytes", thread.stack_bytes());
    }
    line
}

/// フレーム1行
pub fn frame_line(record: &FrameRecord) -> String {
    format!(
        "   {:^18} {} in {}:{}",
        record.type_name.to_lowercase(),
        record.method,
        record.file,
        record.line
    )
}
