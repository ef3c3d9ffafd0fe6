//! ランタイムのバージョン判定

use rbprobe_dwarf::{DwarfLoader, EnumInfo, FileTypeExtractor, StructLayout, SymbolResolver};
use rbprobe_runtime::{LayoutProfile, TypeCatalog};
use crate::Result;
use std::path::Path;
use std::process::{Command, Stdio};
use tracing::{debug, info, warn};

/// `binary -v` を実行してバージョン文字列（1行目）を得る
///
/// 実行できなかった場合は None を返し、シンボルだけで判定させます。
pub fn ruby_version(binary: &Path) -> Option<String> {
    let output = match Command::new(binary).arg("-v").stdin(Stdio::null()).output() {
        Ok(output) => output,
        Err(e) => {
            warn!("could not run {} -v: {}", binary.display(), e);
            return None;
        }
    };
    let text = String::from_utf8_lossy(&output.stdout);
    let line = text.lines().next().map(str::trim).filter(|l| !l.is_empty())?;
    debug!("{} -v: {}", binary.display(), line);
    Some(line.to_string())
}

/// プロファイルを選択し、デバッグ情報があれば補正する
pub fn select_profile(
    loader: &DwarfLoader,
    symbols: &SymbolResolver,
    version: Option<&str>,
) -> Result<LayoutProfile> {
    let profile = LayoutProfile::select(version, |name| symbols.contains(name))?;
    info!("runtime: {} ({})", profile.family, profile.version);

    if !loader.has_debug_info() {
        info!("{} has no debug info; using built-in layouts", loader.path().display());
        return Ok(profile);
    }
    let extractor = loader.type_extractor()?;
    Ok(profile.refine(&DwarfCatalog { extractor }))
}

/// DWARF を引く [`TypeCatalog`]
struct DwarfCatalog<'a> {
    extractor: FileTypeExtractor<'a>,
}

impl TypeCatalog for DwarfCatalog<'_> {
    fn struct_layout(&self, name: &str) -> Option<StructLayout> {
        self.extractor.find_struct(name).unwrap_or_else(|e| {
            debug!("struct {} lookup failed: {}", name, e);
            None
        })
    }

    fn enum_info(&self, name: &str) -> Option<EnumInfo> {
        self.extractor.find_enum(name).unwrap_or_else(|e| {
            debug!("enum {} lookup failed: {}", name, e);
            None
        })
    }
}
