//! モジュールマップ
//!
//! ターゲットにロードされたモジュール（実行ファイル・共有ライブラリ）の
//! アドレス範囲と分類を保持します。スタック縫合とステップ制御は
//! 命令ポインタがどの種類のモジュールに属するかでふるまいを変えます。

use crate::{Result, TargetError};
use std::fs::File;
use std::io::{BufRead, BufReader};

/// モジュールの分類
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleKind {
    /// ランタイムインタプリタ本体
    Interpreter,
    /// 注入済みヘルパーモジュール
    Helper,
    /// それ以外のネイティブコード
    Other,
}

/// ロード済みモジュール
#[derive(Debug, Clone)]
pub struct TargetModule {
    pub path: String,
    pub base: u64,
    pub end: u64,
    pub kind: ModuleKind,
}

impl TargetModule {
    /// パス末尾のファイル名を返す
    pub fn name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }

    /// アドレスがこのモジュールの範囲内かどうか
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.base && addr < self.end
    }
}

/// プロセスのモジュールマップ
#[derive(Debug, Default)]
pub struct ModuleMap {
    modules: Vec<TargetModule>,
}

impl ModuleMap {
    /// 空のマップを作成する
    pub fn new() -> Self {
        Self::default()
    }

    /// /proc/pid/maps からモジュールマップを構築する
    ///
    /// 同じパスの複数マッピングは1つのモジュールに結合します。
    /// 分類は`classify`が行います（パスを受け取り種類を返す）。
    pub fn snapshot(pid: i32, classify: impl Fn(&str) -> ModuleKind) -> Result<Self> {
        let maps_path = format!("/proc/{}/maps", pid);
        let file = File::open(&maps_path).map_err(TargetError::Io)?;
        let reader = BufReader::new(file);

        let mut map = Self::new();
        for line in reader.lines() {
            let line = line?;
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() < 6 || !parts[5].starts_with('/') {
                continue;
            }
            let path = parts[5].to_string();

            let addr_parts: Vec<&str> = parts[0].split('-').collect();
            if addr_parts.len() != 2 {
                continue;
            }
            let start = u64::from_str_radix(addr_parts[0], 16)
                .map_err(|e| TargetError::Io(std::io::Error::other(e)))?;
            let end = u64::from_str_radix(addr_parts[1], 16)
                .map_err(|e| TargetError::Io(std::io::Error::other(e)))?;

            match map.modules.iter_mut().find(|m| m.path == path) {
                Some(module) => {
                    module.base = module.base.min(start);
                    module.end = module.end.max(end);
                }
                None => {
                    let kind = classify(&path);
                    map.modules.push(TargetModule {
                        path,
                        base: start,
                        end,
                        kind,
                    });
                }
            }
        }
        Ok(map)
    }

    /// モジュールを手動で登録する（合成ターゲット用）
    pub fn insert(&mut self, path: &str, base: u64, end: u64, kind: ModuleKind) {
        self.modules.push(TargetModule {
            path: path.to_string(),
            base,
            end,
            kind,
        });
    }

    /// アドレスを含むモジュールを返す
    pub fn module_at(&self, addr: u64) -> Option<&TargetModule> {
        self.modules.iter().find(|m| m.contains(addr))
    }

    /// アドレスのモジュール分類を返す
    ///
    /// どのモジュールにも属さないアドレスは`Other`扱いです。
    pub fn kind_at(&self, addr: u64) -> ModuleKind {
        self.module_at(addr)
            .map(|m| m.kind)
            .unwrap_or(ModuleKind::Other)
    }

    /// 登録済みモジュールの一覧
    pub fn modules(&self) -> &[TargetModule] {
        &self.modules
    }

    /// 指定分類のモジュールを探す
    pub fn find_kind(&self, kind: ModuleKind) -> Option<&TargetModule> {
        self.modules.iter().find(|m| m.kind == kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ModuleMap {
        let mut map = ModuleMap::new();
        map.insert("/usr/bin/python3.11", 0x40_0000, 0x80_0000, ModuleKind::Interpreter);
        map.insert("/tmp/tsubaki_helper.so", 0x7f00_0000, 0x7f10_0000, ModuleKind::Helper);
        map.insert("/usr/lib/libm.so.6", 0x7e00_0000, 0x7e10_0000, ModuleKind::Other);
        map
    }

    #[test]
    fn lookup_by_address() {
        let map = sample();
        assert_eq!(map.kind_at(0x50_0000), ModuleKind::Interpreter);
        assert_eq!(map.kind_at(0x7f05_0000), ModuleKind::Helper);
        assert_eq!(map.kind_at(0x7e05_0000), ModuleKind::Other);
        assert_eq!(map.kind_at(0x10), ModuleKind::Other);
    }

    #[test]
    fn module_name_strips_directories() {
        let map = sample();
        let module = map.module_at(0x50_0000).unwrap();
        assert_eq!(module.name(), "python3.11");
    }
}
