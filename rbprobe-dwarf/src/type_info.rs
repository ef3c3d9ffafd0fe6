//! DWARF型情報の抽出
//!
//! 名前で指定した構造体・共用体のメンバオフセットと、列挙型の列挙子を取り出します。
//! インタプリタのビルドごとに異なる構造体レイアウトを、組み込みの既定値から
//! 補正するために使います。

use crate::Result;
use gimli::Reader;
use std::path::PathBuf;
use thiserror::Error;

/// 型検索の失敗
#[derive(Debug, Error)]
pub enum TypeLookupError {
    #[error("{0:?} has no DWARF debug info")]
    NoDebugInfo(PathBuf),
}

/// 構造体メンバ
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberInfo {
    pub name: String,
    /// 先頭からのオフセット（バイト）
    pub offset: u64,
    /// メンバ型のサイズ（不明なら0）
    pub size: u64,
}

/// 構造体（または共用体）のレイアウト
#[derive(Debug, Clone)]
pub struct StructLayout {
    pub name: String,
    pub size: u64,
    pub members: Vec<MemberInfo>,
}

impl StructLayout {
    /// メンバのオフセットを取得する
    pub fn member_offset(&self, name: &str) -> Option<u64> {
        self.member(name).map(|m| m.offset)
    }

    /// メンバ情報を取得する
    pub fn member(&self, name: &str) -> Option<&MemberInfo> {
        self.members.iter().find(|m| m.name == name)
    }
}

/// 列挙型
#[derive(Debug, Clone)]
pub struct EnumInfo {
    pub name: String,
    pub size: u64,
    /// (列挙子名, 値) の組を宣言順に保持する
    pub enumerators: Vec<(String, i64)>,
}

impl EnumInfo {
    /// 値に対応する列挙子名
    pub fn name_of(&self, value: i64) -> Option<&str> {
        self.enumerators
            .iter()
            .find(|(_, v)| *v == value)
            .map(|(name, _)| name.as_str())
    }

    /// 列挙子名に対応する値
    pub fn value_of(&self, name: &str) -> Option<i64> {
        self.enumerators
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| *v)
    }
}

/// 型情報抽出器
pub struct TypeInfoExtractor<'a, R: Reader> {
    dwarf: &'a gimli::Dwarf<R>,
}

impl<'a, R: Reader<Offset = usize>> TypeInfoExtractor<'a, R> {
    /// 新しい型情報抽出器を作成する
    pub fn new(dwarf: &'a gimli::Dwarf<R>) -> Self {
        Self { dwarf }
    }

    /// 名前で構造体を探す
    ///
    /// `struct thread` のようなタグ名でも、`NODE` のような typedef 名でも引けます。
    /// 前方宣言だけのDIEは無視し、最初に見つかった定義を返します。
    pub fn find_struct(&self, name: &str) -> Result<Option<StructLayout>> {
        let mut units = self.dwarf.units();
        while let Some(header) = units.next()? {
            let unit = self.dwarf.unit(header)?;
            if let Some(offset) = self.find_definition(&unit, name, &[
                gimli::DW_TAG_structure_type,
                gimli::DW_TAG_union_type,
            ])? {
                return Ok(Some(self.struct_layout(&unit, offset, name)?));
            }
        }
        Ok(None)
    }

    /// 名前で列挙型を探す
    pub fn find_enum(&self, name: &str) -> Result<Option<EnumInfo>> {
        let mut units = self.dwarf.units();
        while let Some(header) = units.next()? {
            let unit = self.dwarf.unit(header)?;
            if let Some(offset) = self.find_definition(&unit, name, &[gimli::DW_TAG_enumeration_type])? {
                return Ok(Some(self.enum_info(&unit, offset, name)?));
            }
        }
        Ok(None)
    }

    /// ユニット内で `tags` のいずれかを持つ定義DIEを探す
    ///
    /// typedef にも一致させ、その参照先をたどって返します。
    fn find_definition(
        &self,
        unit: &gimli::Unit<R>,
        name: &str,
        tags: &[gimli::DwTag],
    ) -> Result<Option<gimli::UnitOffset<R::Offset>>> {
        let mut entries = unit.entries();
        while let Some((_, entry)) = entries.next_dfs()? {
            let tag = entry.tag();
            let is_typedef = tag == gimli::DW_TAG_typedef;
            if !is_typedef && !tags.contains(&tag) {
                continue;
            }
            if self.name_of(unit, entry).as_deref() != Some(name) {
                continue;
            }
            if is_typedef {
                if let Some(target) = self.type_ref(entry) {
                    let target = self.strip_qualifiers(unit, target)?;
                    let mut cursor = unit.entries_at_offset(target)?;
                    if let Some((_, die)) = cursor.next_dfs()? {
                        if tags.contains(&die.tag()) && !is_declaration(die) {
                            return Ok(Some(target));
                        }
                    }
                }
                continue;
            }
            if !is_declaration(entry) {
                return Ok(Some(entry.offset()));
            }
        }
        Ok(None)
    }

    fn struct_layout(
        &self,
        unit: &gimli::Unit<R>,
        offset: gimli::UnitOffset<R::Offset>,
        name: &str,
    ) -> Result<StructLayout> {
        let mut tree = unit.entries_tree(Some(offset))?;
        let root = tree.root()?;
        let size = byte_size(root.entry()).unwrap_or(0);

        let mut members = Vec::new();
        let mut children = root.children();
        while let Some(child) = children.next()? {
            let entry = child.entry();
            if entry.tag() != gimli::DW_TAG_member {
                continue;
            }
            // 無名のメンバ（匿名共用体など）は名前で引けないので飛ばす
            let Some(member_name) = self.name_of(unit, entry) else { continue };
            let offset = entry
                .attr_value(gimli::DW_AT_data_member_location)?
                .and_then(|v| v.udata_value())
                .unwrap_or(0);
            let size = match self.type_ref(entry) {
                Some(type_offset) => self.type_size(unit, type_offset)?,
                None => 0,
            };
            members.push(MemberInfo {
                name: member_name,
                offset,
                size,
            });
        }

        Ok(StructLayout {
            name: name.to_string(),
            size,
            members,
        })
    }

    fn enum_info(
        &self,
        unit: &gimli::Unit<R>,
        offset: gimli::UnitOffset<R::Offset>,
        name: &str,
    ) -> Result<EnumInfo> {
        let mut tree = unit.entries_tree(Some(offset))?;
        let root = tree.root()?;
        let size = byte_size(root.entry()).unwrap_or(0);

        let mut enumerators = Vec::new();
        let mut children = root.children();
        while let Some(child) = children.next()? {
            let entry = child.entry();
            if entry.tag() != gimli::DW_TAG_enumerator {
                continue;
            }
            let Some(enumerator) = self.name_of(unit, entry) else { continue };
            let Some(value) = entry.attr_value(gimli::DW_AT_const_value)? else { continue };
            let value = match value {
                gimli::AttributeValue::Sdata(v) => v,
                other => match other.udata_value() {
                    Some(v) => v as i64,
                    None => continue,
                },
            };
            enumerators.push((enumerator, value));
        }

        Ok(EnumInfo {
            name: name.to_string(),
            size,
            enumerators,
        })
    }

    /// 型のサイズを求める（typedef と修飾子はたどる）
    fn type_size(&self, unit: &gimli::Unit<R>, offset: gimli::UnitOffset<R::Offset>) -> Result<u64> {
        let offset = self.strip_qualifiers(unit, offset)?;
        let mut cursor = unit.entries_at_offset(offset)?;
        let Some((_, entry)) = cursor.next_dfs()? else { return Ok(0) };
        Ok(match entry.tag() {
            gimli::DW_TAG_pointer_type => byte_size(entry).unwrap_or(8),
            _ => byte_size(entry).unwrap_or(0),
        })
    }

    /// typedef / const / volatile をたどって実体の型DIEに行き着く
    fn strip_qualifiers(
        &self,
        unit: &gimli::Unit<R>,
        mut offset: gimli::UnitOffset<R::Offset>,
    ) -> Result<gimli::UnitOffset<R::Offset>> {
        // 壊れたDWARFでの無限ループを避けるため深さを制限する
        for _ in 0..16 {
            let mut cursor = unit.entries_at_offset(offset)?;
            let Some((_, entry)) = cursor.next_dfs()? else { break };
            match entry.tag() {
                gimli::DW_TAG_typedef | gimli::DW_TAG_const_type | gimli::DW_TAG_volatile_type => {
                    match self.type_ref(entry) {
                        Some(next) => offset = next,
                        None => break,
                    }
                }
                _ => break,
            }
        }
        Ok(offset)
    }

    /// DW_AT_name を取得する（.debug_str 参照も解決する）
    fn name_of(&self, unit: &gimli::Unit<R>, entry: &gimli::DebuggingInformationEntry<R>) -> Option<String> {
        let attr = entry.attr_value(gimli::DW_AT_name).ok()??;
        let name = self.dwarf.attr_string(unit, attr).ok()?;
        name.to_string_lossy().ok().map(|s| s.into_owned())
    }

    fn type_ref(&self, entry: &gimli::DebuggingInformationEntry<R>) -> Option<gimli::UnitOffset<R::Offset>> {
        match entry.attr_value(gimli::DW_AT_type).ok()?? {
            gimli::AttributeValue::UnitRef(offset) => Some(offset),
            _ => None,
        }
    }
}

fn byte_size<R: Reader>(entry: &gimli::DebuggingInformationEntry<R>) -> Option<u64> {
    entry.attr_value(gimli::DW_AT_byte_size).ok()??.udata_value()
}

fn is_declaration<R: Reader>(entry: &gimli::DebuggingInformationEntry<R>) -> bool {
    matches!(
        entry.attr_value(gimli::DW_AT_declaration),
        Ok(Some(gimli::AttributeValue::Flag(true)))
    )
}
