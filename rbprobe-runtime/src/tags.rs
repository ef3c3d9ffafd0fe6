//! 数値タグと名前の双方向テーブル
//!
//! オブジェクトの型タグ、ノード種別、スレッド状態のように
//! 「小さな整数 ↔ 名前」の対応をバージョンごとに持つ列挙に使います。

use std::collections::{BTreeMap, HashMap};

/// Ruby 1.8 / REE の組み込み型タグ（T_MASK = 0x3f）
pub const FAMILY_A_TYPE_TAGS: &[(&str, u64)] = &[
    ("none", 0x00),
    ("nil", 0x01),
    ("object", 0x02),
    ("class", 0x03),
    ("iclass", 0x04),
    ("module", 0x05),
    ("float", 0x06),
    ("string", 0x07),
    ("regexp", 0x08),
    ("array", 0x09),
    ("fixnum", 0x0a),
    ("hash", 0x0b),
    ("struct", 0x0c),
    ("bignum", 0x0d),
    ("file", 0x0e),
    ("true", 0x20),
    ("false", 0x21),
    ("data", 0x22),
    ("match", 0x23),
    ("symbol", 0x24),
    ("blktag", 0x3b),
    ("undef", 0x3c),
    ("varmap", 0x3d),
    ("scope", 0x3e),
    ("node", 0x3f),
];

/// Ruby 1.9 の組み込み型タグ（T_MASK = 0x1f）
pub const FAMILY_B_TYPE_TAGS: &[(&str, u64)] = &[
    ("none", 0x00),
    ("object", 0x01),
    ("class", 0x02),
    ("module", 0x03),
    ("float", 0x04),
    ("string", 0x05),
    ("regexp", 0x06),
    ("array", 0x07),
    ("hash", 0x08),
    ("struct", 0x09),
    ("bignum", 0x0a),
    ("file", 0x0b),
    ("data", 0x0c),
    ("match", 0x0d),
    ("complex", 0x0e),
    ("rational", 0x0f),
    ("nil", 0x11),
    ("true", 0x12),
    ("false", 0x13),
    ("symbol", 0x14),
    ("fixnum", 0x15),
    ("undef", 0x1b),
    ("node", 0x1c),
    ("iclass", 0x1d),
    ("zombie", 0x1e),
];

/// 1.8 の `enum rb_thread_status`
pub const FAMILY_A_THREAD_STATUS: &[(&str, u64)] = &[
    ("THREAD_TO_KILL", 0),
    ("THREAD_RUNNABLE", 1),
    ("THREAD_STOPPED", 2),
    ("THREAD_KILLED", 3),
];

/// タグ ↔ 名前の双方向テーブル
#[derive(Debug, Clone, Default)]
pub struct TypeTagTable {
    by_tag: BTreeMap<u64, String>,
    by_name: HashMap<String, u64>,
}

impl TypeTagTable {
    /// (名前, タグ) の組から構築する
    ///
    /// 同じタグが複数回現れた場合は最初の名前を正とします。
    pub fn from_pairs<'a, I>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, u64)>,
    {
        let mut table = Self::default();
        for (name, tag) in pairs {
            table.insert(name, tag);
        }
        table
    }

    fn insert(&mut self, name: &str, tag: u64) {
        if self.by_tag.contains_key(&tag) {
            return;
        }
        self.by_tag.insert(tag, name.to_string());
        self.by_name.insert(name.to_string(), tag);
    }

    /// タグの名前
    pub fn name(&self, tag: u64) -> Option<&str> {
        self.by_tag.get(&tag).map(String::as_str)
    }

    /// タグの名前（未定義なら "unknown"）
    pub fn name_or_unknown(&self, tag: u64) -> &str {
        self.name(tag).unwrap_or("unknown")
    }

    /// 名前のタグ
    pub fn tag(&self, name: &str) -> Option<u64> {
        self.by_name.get(name).copied()
    }

    /// 定義済みのタグか
    pub fn contains(&self, tag: u64) -> bool {
        self.by_tag.contains_key(&tag)
    }

    pub fn len(&self) -> usize {
        self.by_tag.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_tag.is_empty()
    }

    /// タグ昇順に (タグ, 名前) を列挙する
    pub fn iter(&self) -> impl Iterator<Item = (u64, &str)> {
        self.by_tag.iter().map(|(tag, name)| (*tag, name.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_for_every_defined_tag() {
        for pairs in [FAMILY_A_TYPE_TAGS, FAMILY_B_TYPE_TAGS] {
            let table = TypeTagTable::from_pairs(pairs.iter().copied());
            assert_eq!(table.len(), pairs.len());
            for (tag, name) in table.iter() {
                assert_eq!(table.tag(name), Some(tag));
            }
            for (name, _) in pairs {
                let tag = table.tag(name).unwrap();
                assert_eq!(table.name(tag), Some(*name));
            }
        }
    }

    #[test]
    fn test_unknown_tag() {
        let table = TypeTagTable::from_pairs(FAMILY_A_TYPE_TAGS.iter().copied());
        assert_eq!(table.name_or_unknown(0x3f), "node");
        assert_eq!(table.name_or_unknown(0x30), "unknown");
        assert!(!table.contains(0x30));
    }

    #[test]
    fn test_duplicate_tag_keeps_first_name() {
        let table = TypeTagTable::from_pairs([("NODE_CALL", 5), ("NODE_ALIAS", 5)]);
        assert_eq!(table.name(5), Some("NODE_CALL"));
        assert_eq!(table.tag("NODE_ALIAS"), None);
    }
}
