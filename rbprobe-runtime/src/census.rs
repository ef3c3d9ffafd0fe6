//! ヒープ上のオブジェクト集計

use crate::accessor::{field, FunctionCaller, MemoryAccessor, NameLookup};
use crate::error::RuntimeError;
use crate::heap::HeapWalker;
use crate::node;
use crate::profile::{CollectionLayout, LayoutProfile};
use crate::Result;
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

/// サイズ分布のバケットごとに保持するサンプル数
pub const SAMPLES_PER_BUCKET: usize = 5;

/// これを超える長さの文字列は壊れたポインタとみなす
const MAX_STRING_LEN: u64 = 16 * 1024 * 1024;

/// 使用中／空きスロットの集計
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PopulationSummary {
    pub arenas: u64,
    pub total: u64,
    pub live: u64,
    pub free: u64,
    /// 型タグごとの使用中スロット数
    pub by_type: BTreeMap<u64, u64>,
}

impl PopulationSummary {
    /// 全スロットに対する使用中の割合
    pub fn live_percent(&self) -> f64 {
        100.0 * self.live as f64 / self.total as f64
    }

    /// 全スロットに対する空きの割合
    pub fn free_percent(&self) -> f64 {
        100.0 * self.free as f64 / self.total as f64
    }

    /// 使用中スロットに対する型ごとの割合
    pub fn type_percent(&self, count: u64) -> f64 {
        100.0 * count as f64 / self.live as f64
    }

    /// (件数, タグ) の昇順に並べた型ごとの件数
    pub fn sorted_types(&self) -> Vec<(u64, u64)> {
        let mut types: Vec<(u64, u64)> = self.by_type.iter().map(|(t, c)| (*t, *c)).collect();
        types.sort_by_key(|(tag, count)| (*count, *tag));
        types
    }
}

/// クラスごとのインスタンス数
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassCount {
    pub klass: u64,
    pub name: String,
    pub count: u64,
}

/// 文字列の集計
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StringHistogram {
    /// (件数, 内容) の昇順
    pub entries: Vec<(String, u64)>,
    pub bytes: u64,
}

impl StringHistogram {
    pub fn unique(&self) -> usize {
        self.entries.len()
    }
}

/// 要素数を数える対象
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectionKind {
    Hash,
    Array,
}

impl CollectionKind {
    fn tag_name(self) -> &'static str {
        match self {
            CollectionKind::Hash => "hash",
            CollectionKind::Array => "array",
        }
    }

    fn report_name(self) -> &'static str {
        match self {
            CollectionKind::Hash => "hash size report",
            CollectionKind::Array => "array size report",
        }
    }
}

/// 要素数ごとのバケット
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SizeBucket {
    pub count: u64,
    pub samples: Vec<u64>,
}

/// 要素数の分布
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SizeHistogram {
    pub kind: CollectionKind,
    pub buckets: BTreeMap<u64, SizeBucket>,
    pub instances: u64,
    pub elements: u64,
}

/// ヒープ集計
pub struct ObjectCensus<'a, T: MemoryAccessor + FunctionCaller + ?Sized> {
    target: &'a T,
    profile: &'a LayoutProfile,
}

impl<'a, T: MemoryAccessor + FunctionCaller + ?Sized> ObjectCensus<'a, T> {
    pub fn new(target: &'a T, profile: &'a LayoutProfile) -> Self {
        Self { target, profile }
    }

    fn walker(&self) -> HeapWalker<'a, T> {
        HeapWalker::new(self.target, self.profile)
    }

    /// 全スロットの使用状況と型ごとの内訳
    ///
    /// スロットが1つもない場合は割合を出せないので [`RuntimeError::EmptyHeap`] を返します。
    pub fn population_summary(&self) -> Result<PopulationSummary> {
        let slots = self.walker().walk_all_slots()?;
        let mut summary = PopulationSummary {
            arenas: slots.arenas().len() as u64,
            ..Default::default()
        };

        for slot in slots {
            let slot = slot?;
            summary.total += 1;
            if slot.is_live() {
                summary.live += 1;
                *summary.by_type.entry(slot.type_tag(self.profile)).or_insert(0) += 1;
            } else {
                summary.free += 1;
            }
        }

        if summary.total == 0 {
            return Err(RuntimeError::EmptyHeap.into());
        }
        Ok(summary)
    }

    /// クラスごとのインスタンス数（件数の昇順）
    ///
    /// 擬似型とクラスポインタが0のスロットは数えません。
    /// クラス名を解決できなかったクラスは結果から除きます。
    pub fn class_histogram(&self) -> Result<Vec<ClassCount>> {
        let counts = self.class_counts()?;
        let lookup = NameLookup::new(self.target);

        let mut classes = Vec::with_capacity(counts.len());
        for (klass, count) in counts {
            match lookup.class_name(klass) {
                Ok(name) => classes.push(ClassCount { klass, name, count }),
                Err(e) => debug!("skipping class 0x{:x}: {}", klass, e),
            }
        }
        // BTreeMap 由来のポインタ順を保ったまま件数で安定ソートする
        classes.sort_by_key(|c| c.count);
        Ok(classes)
    }

    /// クラスポインタごとの件数（名前解決前）
    pub fn class_counts(&self) -> Result<BTreeMap<u64, u64>> {
        let mut counts = BTreeMap::new();
        for slot in self.walker().walk_live_slots()? {
            let (slot, tag) = slot?;
            if self.profile.is_pseudo_type(tag) {
                continue;
            }
            let klass = match field(slot.address, self.profile.flags.class_offset).and_then(|addr| self.target.read_word(addr)) {
                Ok(klass) => klass,
                Err(e) => {
                    debug!("skipping object 0x{:x}: {}", slot.address, e);
                    continue;
                }
            };
            if klass == 0 {
                continue;
            }
            *counts.entry(klass).or_insert(0) += 1;
        }
        Ok(counts)
    }

    /// 文字列の内容ごとの件数と総バイト数
    pub fn string_histogram(&self) -> Result<StringHistogram> {
        let layout = self.collections("string report")?;
        let string_tag = self.require_tag("string")?;

        let mut counts: HashMap<String, u64> = HashMap::new();
        let mut bytes = 0;
        for slot in self.walker().walk_live_slots()? {
            let (slot, tag) = slot?;
            if tag != string_tag {
                continue;
            }
            match self.read_string(slot.address, &layout) {
                Ok(Some((text, len))) => {
                    bytes += len;
                    *counts.entry(text).or_insert(0) += 1;
                }
                Ok(None) => {}
                Err(e) => debug!("skipping string 0x{:x}: {}", slot.address, e),
            }
        }

        let mut entries: Vec<(String, u64)> = counts.into_iter().collect();
        entries.sort_by(|a, b| (a.1, &a.0).cmp(&(b.1, &b.0)));
        Ok(StringHistogram { entries, bytes })
    }

    /// 内部バッファが NULL の文字列は None
    fn read_string(&self, obj: u64, layout: &CollectionLayout) -> Result<Option<(String, u64)>> {
        let ptr = self.target.read_word(field(obj, layout.string_ptr)?)?;
        if ptr == 0 {
            return Ok(None);
        }
        let len = self.target.read_word(field(obj, layout.string_len)?)?;
        if len > MAX_STRING_LEN {
            return Err(anyhow::anyhow!("implausible string length {}", len));
        }
        let data = self.target.read(ptr, len as usize)?;
        Ok(Some((String::from_utf8_lossy(&data).into_owned(), len)))
    }

    /// ハッシュまたは配列の要素数の分布
    pub fn size_histogram(&self, kind: CollectionKind) -> Result<SizeHistogram> {
        let layout = self.collections(kind.report_name())?;
        let kind_tag = self.require_tag(kind.tag_name())?;

        let mut histogram = SizeHistogram {
            kind,
            buckets: BTreeMap::new(),
            instances: 0,
            elements: 0,
        };
        for slot in self.walker().walk_live_slots()? {
            let (slot, tag) = slot?;
            if tag != kind_tag {
                continue;
            }
            let size = match self.element_count(slot.address, kind, &layout) {
                Ok(size) => size,
                Err(e) => {
                    debug!("skipping {} 0x{:x}: {}", kind.tag_name(), slot.address, e);
                    continue;
                }
            };
            histogram.instances += 1;
            histogram.elements += size;
            let bucket = histogram.buckets.entry(size).or_default();
            bucket.count += 1;
            if bucket.samples.len() < SAMPLES_PER_BUCKET {
                bucket.samples.push(slot.address);
            }
        }
        Ok(histogram)
    }

    fn element_count(&self, obj: u64, kind: CollectionKind, layout: &CollectionLayout) -> Result<u64> {
        match kind {
            CollectionKind::Array => self.target.read_word(field(obj, layout.array_len)?),
            CollectionKind::Hash => {
                let table = self.target.read_word(field(obj, layout.hash_table)?)?;
                if table == 0 {
                    return Ok(0);
                }
                self.target.read_sized(field(table, layout.table_entries)?, layout.table_entries_width)
            }
        }
    }

    /// ノード種別ごとの件数（(件数, 種別) の昇順）
    pub fn node_histogram(&self) -> Result<Vec<(u64, u64)>> {
        let node_tag = self.require_tag("node")?;
        let mut counts: BTreeMap<u64, u64> = BTreeMap::new();
        for slot in self.walker().walk_live_slots()? {
            let (slot, tag) = slot?;
            if tag == node_tag {
                let fields = node::decode(slot.flags, &self.profile.node);
                *counts.entry(fields.node_type).or_insert(0) += 1;
            }
        }
        let mut nodes: Vec<(u64, u64)> = counts.into_iter().collect();
        nodes.sort_by_key(|(node_type, count)| (*count, *node_type));
        Ok(nodes)
    }

    fn collections(&self, report: &'static str) -> Result<CollectionLayout> {
        self.profile.collections.ok_or_else(|| {
            RuntimeError::UnsupportedReport {
                report,
                runtime: self.profile.family.to_string(),
            }
            .into()
        })
    }

    fn require_tag(&self, name: &str) -> Result<u64> {
        self.profile
            .tag_of(name)
            .ok_or_else(|| anyhow::anyhow!("{} has no '{}' type tag", self.profile.family, name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mixed_denominators() {
        let mut summary = PopulationSummary {
            arenas: 2,
            total: 8,
            live: 5,
            free: 3,
            by_type: BTreeMap::new(),
        };
        summary.by_type.insert(0x07, 4);
        summary.by_type.insert(0x02, 1);
        assert_eq!(format!("{:.2}", summary.free_percent()), "37.50");
        assert_eq!(format!("{:.2}", summary.live_percent()), "62.50");
        // 型ごとの割合は live に対する値
        assert_eq!(format!("{:.2}", summary.type_percent(4)), "80.00");
        assert_eq!(summary.sorted_types(), vec![(0x02, 1), (0x07, 4)]);
    }
}
