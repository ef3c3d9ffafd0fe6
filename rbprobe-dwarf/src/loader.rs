//! ELFとDWARFの読み込み機能

use crate::type_info::{TypeInfoExtractor, TypeLookupError};
use crate::Result;
use object::{Object, ObjectSection};
use std::fs;
use std::path::{Path, PathBuf};

/// 読み込んだDWARFセクションの型
pub type DwarfSections = gimli::Dwarf<gimli::EndianSlice<'static, gimli::RunTimeEndian>>;

/// 読み込んだファイルに対する型レイアウト抽出器
pub type FileTypeExtractor<'a> = TypeInfoExtractor<'a, gimli::EndianSlice<'static, gimli::RunTimeEndian>>;

/// DWARFローダー
pub struct DwarfLoader {
    path: PathBuf,
    object_file: object::File<'static>,
    dwarf: DwarfSections,
}

impl DwarfLoader {
    /// ELFファイルからDWARF情報を読み込む
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let file_data = fs::read(path)
            .map_err(|e| anyhow::anyhow!("Failed to read file {:?}: {}", path, e))?;

        // セッション中は解放しないので 'static として扱う
        let file_data: &'static [u8] = Box::leak(file_data.into_boxed_slice());

        let object_file = object::File::parse(file_data)
            .map_err(|e| anyhow::anyhow!("Failed to parse ELF file {:?}: {}", path, e))?;

        let endian = if object_file.is_little_endian() {
            gimli::RunTimeEndian::Little
        } else {
            gimli::RunTimeEndian::Big
        };

        // 存在しないセクションは空として扱う（strip済みのバイナリでもシンボルは使える）
        let load_section = |id: gimli::SectionId| -> Result<gimli::EndianSlice<'static, gimli::RunTimeEndian>> {
            let data = object_file
                .section_by_name(id.name())
                .and_then(|section| section.data().ok())
                .unwrap_or(&[]);
            Ok(gimli::EndianSlice::new(data, endian))
        };

        let dwarf = gimli::Dwarf::load(load_section)
            .map_err(|e| anyhow::anyhow!("Failed to load DWARF sections: {}", e))?;

        tracing::debug!("loaded {:?} (pie: {})", path, matches!(object_file.kind(), object::ObjectKind::Dynamic));

        Ok(Self {
            path: path.to_path_buf(),
            object_file,
            dwarf,
        })
    }

    /// 読み込んだファイルのパス
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// DWARFコンテキストへの参照を取得
    pub fn dwarf(&self) -> &DwarfSections {
        &self.dwarf
    }

    /// オブジェクトファイルへの参照を取得
    pub fn object_file(&self) -> &object::File<'static> {
        &self.object_file
    }

    /// .debug_info セクションを持っているか
    pub fn has_debug_info(&self) -> bool {
        self.object_file
            .section_by_name(".debug_info")
            .and_then(|section| section.data().ok())
            .is_some_and(|data| !data.is_empty())
    }

    /// 型レイアウトの抽出器を作成する
    ///
    /// デバッグ情報がない場合は [`TypeLookupError::NoDebugInfo`] を返します。
    pub fn type_extractor(&self) -> Result<FileTypeExtractor<'_>> {
        if !self.has_debug_info() {
            return Err(TypeLookupError::NoDebugInfo(self.path.clone()).into());
        }
        Ok(TypeInfoExtractor::new(&self.dwarf))
    }

    /// PIE（Position Independent Executable）かどうかを判定する
    ///
    /// PIE実行ファイルの場合、シンボルアドレスはオフセットであり、
    /// 実行時ベースアドレスを加算する必要があります。
    pub fn is_pie(&self) -> bool {
        // ET_DYN = PIE実行ファイルまたは共有ライブラリ、ET_EXEC = 非PIE
        matches!(self.object_file.kind(), object::ObjectKind::Dynamic)
    }
}
