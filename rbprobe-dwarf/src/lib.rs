//! rbprobe ELF/DWARF 解析
//!
//! Rubyインタプリタの実行ファイルからシンボルと型レイアウトを取り出します。
//! シンボルはグローバル変数・関数のアドレス解決に、型レイアウトは
//! 構造体オフセットと列挙型の名前の補正に使われます。

pub mod loader;
pub mod symbols;
pub mod type_info;

pub use loader::{DwarfLoader, FileTypeExtractor};
pub use symbols::{Symbol, SymbolResolver};
pub use type_info::{EnumInfo, MemberInfo, StructLayout, TypeInfoExtractor, TypeLookupError};

/// DWARF解析の結果型
pub type Result<T> = anyhow::Result<T>;
