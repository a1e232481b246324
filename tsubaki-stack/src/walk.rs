//! ネイティブスタックウォーク
//!
//! 停止中スレッドのレジスタを起点にフレームポインタチェインをたどり、
//! 縫合の入力になる`NativeFrame`列を作ります。フレームポインタを
//! 省略してコンパイルされた区間ではチェインが途切れることがあり、
//! その場合も収集済みのフレームはそのまま返します。

use std::collections::HashMap;

use tsubaki_target::{ModuleKind, ModuleMap, TargetAccess, TargetAccessExt};

use crate::resolver::display_symbol;
use crate::stitcher::NativeFrame;

/// たどるフレーム数の上限
const MAX_NATIVE_FRAMES: usize = 256;

/// モジュール別のシンボル・行情報キャッシュ
///
/// ロードに失敗したモジュールも記憶し、ウォークのたびに再試行しません。
pub struct NativeSymbolizer {
    loaders: HashMap<String, Option<addr2line::Loader>>,
}

impl NativeSymbolizer {
    pub fn new() -> Self {
        Self {
            loaders: HashMap::new(),
        }
    }

    fn loader(&mut self, module_path: &str) -> Option<&addr2line::Loader> {
        self.loaders
            .entry(module_path.to_string())
            .or_insert_with(|| match addr2line::Loader::new(module_path) {
                Ok(loader) => Some(loader),
                Err(e) => {
                    tracing::debug!(module = module_path, error = %e, "no symbol info for module");
                    None
                }
            })
            .as_ref()
    }

    /// モジュール内相対アドレスからシンボル名を引く
    pub fn symbol_at(&mut self, module_path: &str, rva: u64) -> Option<String> {
        self.loader(module_path)?
            .find_symbol(rva)
            .map(display_symbol)
    }

    /// モジュール内相対アドレスからソース位置を引く
    pub fn location_at(&mut self, module_path: &str, rva: u64) -> Option<(String, u32)> {
        let location = self.loader(module_path)?.find_location(rva).ok()??;
        Some((location.file?.to_string(), location.line?))
    }
}

impl Default for NativeSymbolizer {
    fn default() -> Self {
        Self::new()
    }
}

/// フレームポインタチェインをたどってネイティブスタックを収集する
///
/// 最新フレームが先頭です。リターンアドレスは`[rbp+8]`、呼び出し元の
/// フレームベースは`[rbp]`として読み、スタックが深い方向に単調で
/// なくなった時点で打ち切ります。
pub fn walk_native_stack(
    target: &dyn TargetAccess,
    modules: &ModuleMap,
    symbolizer: &mut NativeSymbolizer,
    rip: u64,
    rbp: u64,
) -> Vec<NativeFrame> {
    let mut frames = Vec::new();
    let mut ip = rip;
    let mut base = rbp;
    while frames.len() < MAX_NATIVE_FRAMES {
        frames.push(frame_at(modules, symbolizer, ip, base));
        if base == 0 {
            break;
        }
        let ret = match target.read_typed::<u64>(base + 8) {
            Ok(ret) => ret,
            Err(_) => break,
        };
        let saved = match target.read_typed::<u64>(base) {
            Ok(saved) => saved,
            Err(_) => break,
        };
        if ret == 0 || saved <= base {
            break;
        }
        ip = ret;
        base = saved;
    }
    frames
}

fn frame_at(
    modules: &ModuleMap,
    symbolizer: &mut NativeSymbolizer,
    ip: u64,
    base: u64,
) -> NativeFrame {
    let (module, symbol) = match modules.module_at(ip) {
        Some(m) => (m.kind, symbolizer.symbol_at(&m.path, ip - m.base)),
        None => (ModuleKind::Other, None),
    };
    NativeFrame {
        instruction_pointer: ip,
        frame_base: base,
        module,
        symbol,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tsubaki_target::FakeTarget;

    fn chain_target() -> (Arc<FakeTarget>, ModuleMap) {
        let fake = Arc::new(FakeTarget::new());
        fake.map(0x7000_0000, 0x1_0000);
        let mut modules = ModuleMap::new();
        // 実在しないパス: シンボル解決は常にNoneになる
        modules.insert("/nonexistent/libfoo.so", 0x1000, 0x2000, ModuleKind::Other);
        modules.insert(
            "/nonexistent/libpython3.11.so",
            0x2000,
            0x3000,
            ModuleKind::Interpreter,
        );
        (fake, modules)
    }

    #[test]
    fn walks_frame_pointer_chain_until_it_ends() {
        let (fake, modules) = chain_target();
        let target = fake.as_ref();
        // フレーム2段: rbp=0x7000_0100 -> 0x7000_0200 -> (途切れ)
        target.write_typed::<u64>(0x7000_0100, &0x7000_0200).unwrap();
        target.write_typed::<u64>(0x7000_0108, &0x2500).unwrap();
        target.write_typed::<u64>(0x7000_0200, &0).unwrap();
        target.write_typed::<u64>(0x7000_0208, &0).unwrap();

        let mut symbolizer = NativeSymbolizer::new();
        let frames =
            walk_native_stack(target, &modules, &mut symbolizer, 0x1500, 0x7000_0100);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].instruction_pointer, 0x1500);
        assert_eq!(frames[0].module, ModuleKind::Other);
        assert_eq!(frames[1].instruction_pointer, 0x2500);
        assert_eq!(frames[1].module, ModuleKind::Interpreter);
    }

    #[test]
    fn unreadable_frame_base_stops_the_walk() {
        let (fake, modules) = chain_target();
        let mut symbolizer = NativeSymbolizer::new();
        // マップ外のrbpは最初のフレームだけ返して止まる
        let frames =
            walk_native_stack(fake.as_ref(), &modules, &mut symbolizer, 0x1500, 0xdead_0000);
        assert_eq!(frames.len(), 1);
    }

    #[test]
    fn non_monotonic_chain_is_cut() {
        let (fake, modules) = chain_target();
        let target = fake.as_ref();
        // 保存されたrbpが現在より浅い: ループ防止で打ち切り
        target.write_typed::<u64>(0x7000_0300, &0x7000_0100).unwrap();
        target.write_typed::<u64>(0x7000_0308, &0x2500).unwrap();

        let mut symbolizer = NativeSymbolizer::new();
        let frames =
            walk_native_stack(target, &modules, &mut symbolizer, 0x1500, 0x7000_0300);
        assert_eq!(frames.len(), 1);
    }

    #[test]
    fn missing_module_file_yields_no_symbol() {
        let (_, modules) = chain_target();
        let mut symbolizer = NativeSymbolizer::new();
        let frame = frame_at(&modules, &mut symbolizer, 0x1500, 0);
        assert_eq!(frame.module, ModuleKind::Other);
        assert!(frame.symbol.is_none());
    }
}
