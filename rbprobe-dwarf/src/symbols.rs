//! シンボル解決機能

use crate::{DwarfLoader, Result};
use object::{Object, ObjectSymbol};
use std::collections::HashMap;

/// シンボル情報
#[derive(Debug, Clone)]
pub struct Symbol {
    pub name: String,
    pub address: u64,
    pub size: u64,
}

/// シンボル解決
///
/// 静的シンボルテーブルと動的シンボルテーブルの両方を読みます。
/// 同名のシンボルは静的シンボルテーブルの方を優先します。
pub struct SymbolResolver {
    symbols_by_name: HashMap<String, Symbol>,
    /// アドレス順にソート済み
    symbols_by_address: Vec<Symbol>,
    is_pie: bool,
}

impl SymbolResolver {
    /// DWARFローダーからシンボル解決を作成する
    pub fn new(loader: &DwarfLoader) -> Result<Self> {
        let object_file = loader.object_file();
        let mut symbols_by_name: HashMap<String, Symbol> = HashMap::new();

        let tables = object_file.symbols().chain(object_file.dynamic_symbols());
        for symbol in tables {
            // 未定義シンボル（共有ライブラリからのインポート）はアドレスを持たない
            if symbol.is_undefined() || symbol.address() == 0 {
                continue;
            }
            let Ok(name) = symbol.name() else { continue };
            if name.is_empty() {
                continue;
            }
            symbols_by_name.entry(name.to_string()).or_insert_with(|| Symbol {
                name: name.to_string(),
                address: symbol.address(),
                size: symbol.size(),
            });
        }

        let mut symbols_by_address: Vec<Symbol> = symbols_by_name.values().cloned().collect();
        symbols_by_address.sort_by_key(|s| s.address);

        tracing::debug!("{} symbols loaded", symbols_by_address.len());

        Ok(Self {
            symbols_by_name,
            symbols_by_address,
            is_pie: loader.is_pie(),
        })
    }

    /// PIE（Position Independent Executable）かどうかを取得する
    pub fn is_pie(&self) -> bool {
        self.is_pie
    }

    /// シンボル名からアドレスを解決する（ファイル内アドレス）
    pub fn resolve(&self, symbol: &str) -> Option<u64> {
        self.symbols_by_name.get(symbol).map(|s| s.address)
    }

    /// シンボルが存在するか
    pub fn contains(&self, symbol: &str) -> bool {
        self.symbols_by_name.contains_key(symbol)
    }

    /// アドレスからシンボル名を解決する（最も近いシンボルを返す）
    pub fn reverse_resolve(&self, addr: u64) -> Option<Symbol> {
        match self.symbols_by_address.binary_search_by_key(&addr, |s| s.address) {
            Ok(idx) => Some(self.symbols_by_address[idx].clone()),
            Err(0) => None,
            Err(idx) => {
                let sym = &self.symbols_by_address[idx - 1];
                // サイズ情報があるときは範囲外を除外する
                if sym.size > 0 && addr >= sym.address + sym.size {
                    None
                } else {
                    Some(sym.clone())
                }
            }
        }
    }
}
