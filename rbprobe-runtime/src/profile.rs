//! バージョンごとのメモリレイアウト
//!
//! ヒープ・スレッド・フレーム・ノードの構造体オフセットとビットフィールドを
//! 1つの値 [`LayoutProfile`] にまとめます。プロファイルはアタッチ時に一度だけ
//! 選択・補正され、以後は変更されません。解析ロジックはバージョンを直接見ず、
//! 常にこの値を参照します。

use crate::error::RuntimeError;
use crate::tags::{self, TypeTagTable};
use crate::Result;
use rbprobe_dwarf::{EnumInfo, StructLayout};
use regex::Regex;
use std::fmt;
use tracing::{debug, info};

/// 対応するランタイムの系統
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeFamily {
    /// Ruby 1.8（MRI）
    FamilyA,
    /// Ruby Enterprise Edition（1.8 系、ヒープとノードのレイアウトが異なる）
    FamilyARee,
    /// Ruby 1.9（YARV）
    FamilyB,
}

impl fmt::Display for RuntimeFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuntimeFamily::FamilyA => write!(f, "Ruby 1.8"),
            RuntimeFamily::FamilyARee => write!(f, "Ruby Enterprise Edition 1.8"),
            RuntimeFamily::FamilyB => write!(f, "Ruby 1.9"),
        }
    }
}

/// グローバル変数（またはその中のフィールド）の位置
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GlobalField {
    pub symbol: &'static str,
    /// シンボルのアドレスからのオフセット
    pub offset: u64,
    /// 値の幅（バイト）
    pub width: usize,
}

/// RBasic のフラグワード
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlagLayout {
    pub flags_offset: u64,
    pub class_offset: u64,
    pub type_mask: u64,
    pub type_shift: u32,
}

/// RNode のビットフィールド
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeLayout {
    pub type_shift: u32,
    pub type_mask: u64,
    pub line_shift: u32,
    pub line_mask: u64,
    pub file_offset: u64,
}

/// ヒープアリーナの配置
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapLayout {
    /// アリーナ記述子配列へのポインタ
    pub arena_table: GlobalField,
    /// 使用中のアリーナ数
    pub arena_count: GlobalField,
    /// アリーナ記述子1つ分のサイズ
    pub arena_stride: u64,
    /// 記述子内の先頭スロットポインタ
    pub slot_offset: u64,
    /// 記述子内のスロット数
    pub limit_offset: u64,
    pub limit_width: usize,
    /// RVALUE のサイズ
    pub slot_size: u64,
}

/// 文字列・配列・ハッシュのフィールド（1.8 系のみ）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CollectionLayout {
    pub string_len: u64,
    pub string_ptr: u64,
    pub array_len: u64,
    pub hash_table: u64,
    pub table_entries: u64,
    pub table_entries_width: usize,
}

/// struct FRAME
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameLayout {
    pub prev: u64,
    pub last_func: u64,
    pub node: u64,
}

/// 実行中スレッドの状態を持つグローバル変数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionAnchors {
    pub main_thread: &'static str,
    pub current_thread: &'static str,
    pub current_frame: &'static str,
    pub current_node: &'static str,
}

/// wait_for のビット
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitBits {
    pub fd: u64,
    pub select: u64,
    pub time: u64,
    pub join: u64,
    pub pid: u64,
}

/// struct thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadLayout {
    pub next: u64,
    pub status: u64,
    pub wait_for: u64,
    pub fd: u64,
    pub delay: u64,
    pub join: u64,
    pub stk_len: u64,
    pub stk_ptr: u64,
    pub stk_pos: u64,
    pub frame: u64,
    pub anchors: ExecutionAnchors,
    pub wait_bits: WaitBits,
}

/// イベントフック関数と登録引数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventHookLayout {
    pub add_hook: &'static str,
    pub remove_hook: &'static str,
    /// RUBY_EVENT_CALL | RUBY_EVENT_C_CALL
    pub events: u64,
    /// フック関数の何番目の引数が呼び出し位置のノードか
    pub node_argument: usize,
    /// フック関数の何番目の引数がメソッドIDか
    pub method_argument: usize,
}

/// 即値 VALUE の表現
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImmediateLayout {
    pub fixnum_flag: u64,
    pub symbol_flag: u64,
    pub symbol_mask: u64,
    pub symbol_shift: u32,
    pub qfalse: u64,
    pub qtrue: u64,
    pub qnil: u64,
    pub qundef: u64,
}

/// 型情報の問い合わせ先（DWARF）
pub trait TypeCatalog {
    fn struct_layout(&self, name: &str) -> Option<StructLayout>;
    fn enum_info(&self, name: &str) -> Option<EnumInfo>;
}

/// 選択済みのレイアウト一式
#[derive(Debug, Clone)]
pub struct LayoutProfile {
    pub family: RuntimeFamily,
    pub version: String,
    pub flags: FlagLayout,
    pub node: NodeLayout,
    pub heap: HeapLayout,
    pub collections: Option<CollectionLayout>,
    pub frame: Option<FrameLayout>,
    pub thread: Option<ThreadLayout>,
    pub event_hook: Option<EventHookLayout>,
    pub immediates: ImmediateLayout,
    /// フレームがヒープ上にあり、スタック退避による再配置が不要か
    pub frames_are_heap_allocated: bool,
    pub type_tags: TypeTagTable,
    pub node_types: TypeTagTable,
    pub thread_status: TypeTagTable,
    pseudo_types: &'static [&'static str],
}

const FAMILY_A_SIGNATURE: &[&str] = &["heaps_used", "rb_curr_thread"];
const FAMILY_B_SIGNATURE: &[&str] = &["rb_objspace", "ruby_current_vm"];
const REE_MARKER: &str = "rb_gc_copy_on_write_friendly";
const HEAP_STACK_MARKER: &str = "rb_thread_start_2";

const FAMILY_A_PSEUDO: &[&str] = &["none", "blktag", "undef", "varmap", "scope", "node"];
const FAMILY_B_PSEUDO: &[&str] = &["none", "undef", "node", "zombie"];

impl LayoutProfile {
    /// バージョン文字列とシンボルの有無からプロファイルを選択する
    ///
    /// シンボルによる判定は必須で、どちらの系統のシグネチャにも一致しなければ失敗します。
    /// バージョン文字列が読めた場合は系統が一致することも確認します。
    pub fn select<F>(version: Option<&str>, has_symbol: F) -> Result<Self>
    where
        F: Fn(&str) -> bool,
    {
        let version_text = version.unwrap_or("").trim().to_string();
        let unrecognized = || RuntimeError::UnrecognizedRuntime {
            version: if version_text.is_empty() { "unknown".to_string() } else { version_text.clone() },
        };

        let by_symbols = if FAMILY_A_SIGNATURE.iter().all(|s| has_symbol(s)) {
            Some(RuntimeFamily::FamilyA)
        } else if FAMILY_B_SIGNATURE.iter().all(|s| has_symbol(s)) {
            Some(RuntimeFamily::FamilyB)
        } else {
            None
        };
        let mut family = by_symbols.ok_or_else(unrecognized)?;

        if let Some(by_version) = family_from_version(&version_text)? {
            if by_version != family {
                debug!("version says {} but symbols say {}", by_version, family);
                return Err(unrecognized().into());
            }
        }

        if family == RuntimeFamily::FamilyA
            && (version_text.contains("Enterprise Edition") || has_symbol(REE_MARKER))
        {
            family = RuntimeFamily::FamilyARee;
        }

        let mut profile = Self::builtin(family);
        profile.version = version_text.clone();
        if has_symbol(HEAP_STACK_MARKER) {
            profile.frames_are_heap_allocated = true;
        }

        info!(
            "selected {} layout (heap-allocated frames: {})",
            family, profile.frames_are_heap_allocated
        );
        Ok(profile)
    }

    /// 系統ごとの組み込みレイアウト
    pub fn builtin(family: RuntimeFamily) -> Self {
        match family {
            RuntimeFamily::FamilyA | RuntimeFamily::FamilyARee => family_a(family),
            RuntimeFamily::FamilyB => family_b(),
        }
    }

    /// DWARF の型情報で構造体オフセットと列挙名を補正する
    ///
    /// 見つからない構造体・メンバは組み込みの値のまま残します。
    pub fn refine(mut self, catalog: &dyn TypeCatalog) -> Self {
        if let Some(basic) = catalog.struct_layout("RBasic") {
            set_offset(&mut self.flags.flags_offset, &basic, "flags");
            set_offset(&mut self.flags.class_offset, &basic, "klass");
        }
        if let Some(node) = catalog.struct_layout("RNode") {
            set_offset(&mut self.node.file_offset, &node, "nd_file");
        }
        if let Some(slot) = catalog.struct_layout("heaps_slot") {
            set_offset(&mut self.heap.slot_offset, &slot, "slot");
            set_offset(&mut self.heap.limit_offset, &slot, "limit");
            set_width(&mut self.heap.limit_width, &slot, "limit");
            if slot.size > 0 {
                self.heap.arena_stride = slot.size;
            }
        }
        if let Some(rvalue) = catalog.struct_layout("RVALUE") {
            if rvalue.size > 0 {
                self.heap.slot_size = rvalue.size;
            }
        }

        if let Some(collections) = self.collections.as_mut() {
            if let Some(string) = catalog.struct_layout("RString") {
                set_offset(&mut collections.string_len, &string, "len");
                set_offset(&mut collections.string_ptr, &string, "ptr");
            }
            if let Some(array) = catalog.struct_layout("RArray") {
                set_offset(&mut collections.array_len, &array, "len");
            }
            if let Some(hash) = catalog.struct_layout("RHash") {
                set_offset(&mut collections.hash_table, &hash, "tbl");
            }
            if let Some(table) = catalog.struct_layout("st_table") {
                set_offset(&mut collections.table_entries, &table, "num_entries");
                set_width(&mut collections.table_entries_width, &table, "num_entries");
            }
        }

        if let (Some(frame), Some(layout)) = (self.frame.as_mut(), catalog.struct_layout("FRAME")) {
            set_offset(&mut frame.prev, &layout, "prev");
            set_offset(&mut frame.last_func, &layout, "last_func");
            set_offset(&mut frame.node, &layout, "node");
        }

        if let (Some(thread), Some(layout)) = (self.thread.as_mut(), catalog.struct_layout("thread")) {
            for (field, member) in [
                (&mut thread.next, "next"),
                (&mut thread.status, "status"),
                (&mut thread.wait_for, "wait_for"),
                (&mut thread.fd, "fd"),
                (&mut thread.delay, "delay"),
                (&mut thread.join, "join"),
                (&mut thread.stk_len, "stk_len"),
                (&mut thread.stk_ptr, "stk_ptr"),
                (&mut thread.stk_pos, "stk_pos"),
                (&mut thread.frame, "frame"),
            ] {
                set_offset(field, &layout, member);
            }
        }

        if let Some(nodes) = catalog.enum_info("node_type") {
            self.node_types = TypeTagTable::from_pairs(
                nodes.enumerators.iter().map(|(name, v)| (name.as_str(), *v as u64)),
            );
            debug!("{} node types from debug info", self.node_types.len());
        }
        if let Some(status) = catalog.enum_info("rb_thread_status") {
            self.thread_status = TypeTagTable::from_pairs(
                status.enumerators.iter().map(|(name, v)| (name.as_str(), *v as u64)),
            );
        }
        if let Some(value_types) = catalog.enum_info("ruby_value_type") {
            // RUBY_T_STRING -> string
            let names: Vec<(String, u64)> = value_types
                .enumerators
                .iter()
                .filter_map(|(name, v)| {
                    let short = name.strip_prefix("RUBY_T_")?;
                    (short != "MASK").then(|| (short.to_lowercase(), *v as u64))
                })
                .collect();
            if !names.is_empty() {
                self.type_tags = TypeTagTable::from_pairs(names.iter().map(|(n, v)| (n.as_str(), *v)));
            }
        }

        self
    }

    /// フラグワードから型タグを取り出す
    pub fn type_tag(&self, flags: u64) -> u64 {
        (flags >> self.flags.type_shift) & self.flags.type_mask
    }

    /// 型タグの名前（未定義なら "unknown"）
    pub fn type_name(&self, tag: u64) -> &str {
        self.type_tags.name_or_unknown(tag)
    }

    /// クラス集計から除外する擬似型か
    pub fn is_pseudo_type(&self, tag: u64) -> bool {
        match self.type_tags.name(tag) {
            Some(name) => self.pseudo_types.contains(&name),
            None => false,
        }
    }

    /// 名前で型タグを引く
    pub fn tag_of(&self, name: &str) -> Option<u64> {
        self.type_tags.tag(name)
    }

    /// ノード種別の名前（DWARF がなければ `node_<n>`）
    pub fn node_type_name(&self, node_type: u64) -> String {
        match self.node_types.name(node_type) {
            Some(name) => name.to_string(),
            None => format!("node_{}", node_type),
        }
    }

    /// スレッド状態の名前
    pub fn thread_status_name(&self, status: u64) -> String {
        match self.thread_status.name(status) {
            Some(name) => name.to_string(),
            None => format!("status_{}", status),
        }
    }
}

fn set_offset(target: &mut u64, layout: &StructLayout, member: &str) {
    if let Some(offset) = layout.member_offset(member) {
        if *target != offset {
            debug!("{}.{}: 0x{:x} -> 0x{:x}", layout.name, member, *target, offset);
        }
        *target = offset;
    }
}

fn set_width(target: &mut usize, layout: &StructLayout, member: &str) {
    if let Some(size) = layout.member(member).map(|m| m.size as usize) {
        if matches!(size, 4 | 8) {
            *target = size;
        }
    }
}

/// `ruby 1.8.7 (...)` からの系統判定
fn family_from_version(version: &str) -> Result<Option<RuntimeFamily>> {
    let re = Regex::new(r"ruby (\d+)\.(\d+)\.(\d+)")?;
    let Some(caps) = re.captures(version) else {
        return Ok(None);
    };
    Ok(match (&caps[1], &caps[2]) {
        ("1", "8") => Some(RuntimeFamily::FamilyA),
        ("1", "9") => Some(RuntimeFamily::FamilyB),
        _ => None,
    })
}

fn family_a(family: RuntimeFamily) -> LayoutProfile {
    let ree = family == RuntimeFamily::FamilyARee;
    // REE は heaps_slot にマーク用のフィールドが増え、ノードの行番号が1ビット上にずれる
    let line_shift = if ree { 21 } else { 20 };

    LayoutProfile {
        family,
        version: String::new(),
        flags: FlagLayout {
            flags_offset: 0,
            class_offset: 8,
            type_mask: 0x3f,
            type_shift: 0,
        },
        node: NodeLayout {
            type_shift: 12,
            type_mask: 0xff,
            line_shift,
            line_mask: (1u64 << (64 - line_shift)) - 1,
            file_offset: 8,
        },
        heap: HeapLayout {
            arena_table: GlobalField { symbol: "heaps", offset: 0, width: 8 },
            arena_count: GlobalField { symbol: "heaps_used", offset: 0, width: 4 },
            arena_stride: if ree { 40 } else { 24 },
            slot_offset: 8,
            limit_offset: 16,
            limit_width: 4,
            slot_size: 40,
        },
        collections: Some(CollectionLayout {
            string_len: 16,
            string_ptr: 24,
            array_len: 16,
            hash_table: 16,
            table_entries: 12,
            table_entries_width: 4,
        }),
        frame: Some(FrameLayout {
            prev: 40,
            last_func: 16,
            node: 56,
        }),
        thread: Some(ThreadLayout {
            next: 0,
            status: 388,
            wait_for: 392,
            fd: 396,
            delay: 792,
            join: 800,
            stk_len: 224,
            stk_ptr: 240,
            stk_pos: 248,
            frame: 256,
            anchors: ExecutionAnchors {
                main_thread: "rb_main_thread",
                current_thread: "rb_curr_thread",
                current_frame: "ruby_frame",
                current_node: "ruby_current_node",
            },
            wait_bits: WaitBits { fd: 1, select: 2, time: 4, join: 8, pid: 16 },
        }),
        event_hook: Some(EventHookLayout {
            add_hook: "rb_add_event_hook",
            remove_hook: "rb_remove_event_hook",
            events: 0x08 | 0x20,
            node_argument: 1,
            method_argument: 3,
        }),
        immediates: ImmediateLayout {
            fixnum_flag: 0x01,
            symbol_flag: 0x0e,
            symbol_mask: 0xff,
            symbol_shift: 8,
            qfalse: 0,
            qtrue: 2,
            qnil: 4,
            qundef: 6,
        },
        frames_are_heap_allocated: false,
        type_tags: TypeTagTable::from_pairs(tags::FAMILY_A_TYPE_TAGS.iter().copied()),
        node_types: TypeTagTable::default(),
        thread_status: TypeTagTable::from_pairs(tags::FAMILY_A_THREAD_STATUS.iter().copied()),
        pseudo_types: FAMILY_A_PSEUDO,
    }
}

fn family_b() -> LayoutProfile {
    LayoutProfile {
        family: RuntimeFamily::FamilyB,
        version: String::new(),
        flags: FlagLayout {
            flags_offset: 0,
            class_offset: 8,
            type_mask: 0x1f,
            type_shift: 0,
        },
        node: NodeLayout {
            type_shift: 8,
            type_mask: 0x7f,
            line_shift: 15,
            line_mask: (1u64 << (64 - 15)) - 1,
            file_offset: 8,
        },
        heap: HeapLayout {
            arena_table: GlobalField { symbol: "rb_objspace", offset: 24, width: 8 },
            arena_count: GlobalField { symbol: "rb_objspace", offset: 40, width: 8 },
            arena_stride: 32,
            slot_offset: 8,
            limit_offset: 16,
            limit_width: 8,
            slot_size: 40,
        },
        collections: None,
        frame: None,
        thread: None,
        event_hook: None,
        immediates: ImmediateLayout {
            fixnum_flag: 0x01,
            symbol_flag: 0x0e,
            symbol_mask: 0xff,
            symbol_shift: 8,
            qfalse: 0,
            qtrue: 2,
            qnil: 4,
            qundef: 6,
        },
        frames_are_heap_allocated: true,
        type_tags: TypeTagTable::from_pairs(tags::FAMILY_B_TYPE_TAGS.iter().copied()),
        node_types: TypeTagTable::default(),
        thread_status: TypeTagTable::default(),
        pseudo_types: FAMILY_B_PSEUDO,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rbprobe_dwarf::MemberInfo;
    use std::collections::HashSet;

    fn symbols(names: &[&'static str]) -> impl Fn(&str) -> bool {
        let set: HashSet<&'static str> = names.iter().copied().collect();
        move |name| set.contains(name)
    }

    #[test]
    fn test_select_family_a_by_symbols() {
        let profile = LayoutProfile::select(
            Some("ruby 1.8.7 (2012-02-08 patchlevel 358) [x86_64-linux]"),
            symbols(&["heaps_used", "rb_curr_thread"]),
        )
        .unwrap();
        assert_eq!(profile.family, RuntimeFamily::FamilyA);
        assert!(!profile.frames_are_heap_allocated);
        assert_eq!(profile.heap.arena_stride, 24);
        assert_eq!(profile.node.line_shift, 20);
    }

    #[test]
    fn test_select_ree_from_version_string() {
        let profile = LayoutProfile::select(
            Some("ruby 1.8.7 (2011-02-18 patchlevel 334) [x86_64-linux], MBARI 0x6770, Ruby Enterprise Edition 2011.03"),
            symbols(&["heaps_used", "rb_curr_thread"]),
        )
        .unwrap();
        assert_eq!(profile.family, RuntimeFamily::FamilyARee);
        assert_eq!(profile.heap.arena_stride, 40);
        assert_eq!(profile.node.line_shift, 21);
        assert_eq!(profile.node.line_mask, (1u64 << 43) - 1);
    }

    #[test]
    fn test_select_family_b_without_version() {
        let profile = LayoutProfile::select(None, symbols(&["rb_objspace", "ruby_current_vm"])).unwrap();
        assert_eq!(profile.family, RuntimeFamily::FamilyB);
        assert!(profile.thread.is_none());
        assert!(profile.collections.is_none());
        assert_eq!(profile.tag_of("string"), Some(0x05));
    }

    #[test]
    fn test_heap_stack_marker_sets_flag() {
        let profile = LayoutProfile::select(
            None,
            symbols(&["heaps_used", "rb_curr_thread", "rb_thread_start_2"]),
        )
        .unwrap();
        assert!(profile.frames_are_heap_allocated);
    }

    #[test]
    fn test_unrecognized_runtime_is_fatal() {
        let err = LayoutProfile::select(Some("ruby 2.7.0"), symbols(&["main"])).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<RuntimeError>(),
            Some(RuntimeError::UnrecognizedRuntime { .. })
        ));
    }

    #[test]
    fn test_version_and_symbols_must_agree() {
        // 形式が読めないバージョン文字列はシンボル判定だけで決める
        let profile = LayoutProfile::select(
            Some("custom build"),
            symbols(&["heaps_used", "rb_curr_thread"]),
        );
        assert!(profile.is_ok());

        let err = LayoutProfile::select(
            Some("ruby 1.9.1 (2009-07-16) [x86_64-linux]"),
            symbols(&["heaps_used", "rb_curr_thread"]),
        )
        .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<RuntimeError>(),
            Some(RuntimeError::UnrecognizedRuntime { .. })
        ));
    }

    #[test]
    fn test_pseudo_types() {
        let profile = LayoutProfile::builtin(RuntimeFamily::FamilyA);
        for name in ["none", "blktag", "undef", "varmap", "scope", "node"] {
            assert!(profile.is_pseudo_type(profile.tag_of(name).unwrap()), "{}", name);
        }
        assert!(!profile.is_pseudo_type(profile.tag_of("object").unwrap()));
        assert!(!profile.is_pseudo_type(0x30));
    }

    struct Catalog;

    impl TypeCatalog for Catalog {
        fn struct_layout(&self, name: &str) -> Option<StructLayout> {
            let member = |name: &str, offset, size| MemberInfo { name: name.to_string(), offset, size };
            match name {
                "FRAME" => Some(StructLayout {
                    name: "FRAME".to_string(),
                    size: 88,
                    members: vec![member("last_func", 24, 8), member("prev", 48, 8), member("node", 64, 8)],
                }),
                "heaps_slot" => Some(StructLayout {
                    name: "heaps_slot".to_string(),
                    size: 32,
                    members: vec![member("slot", 8, 8), member("limit", 16, 8)],
                }),
                _ => None,
            }
        }

        fn enum_info(&self, name: &str) -> Option<EnumInfo> {
            (name == "node_type").then(|| EnumInfo {
                name: "node_type".to_string(),
                size: 4,
                enumerators: vec![("NODE_METHOD".to_string(), 0), ("NODE_FBODY".to_string(), 1)],
            })
        }
    }

    #[test]
    fn test_refine_overrides_known_members_only() {
        let profile = LayoutProfile::builtin(RuntimeFamily::FamilyA).refine(&Catalog);
        let frame = profile.frame.unwrap();
        assert_eq!((frame.prev, frame.last_func, frame.node), (48, 24, 64));
        assert_eq!(profile.heap.arena_stride, 32);
        assert_eq!(profile.heap.limit_width, 8);
        // thread は見つからないので既定値のまま
        assert_eq!(profile.thread.unwrap().stk_len, 224);
        assert_eq!(profile.node_type_name(1), "NODE_FBODY");
        assert_eq!(profile.node_type_name(77), "node_77");
    }
}
