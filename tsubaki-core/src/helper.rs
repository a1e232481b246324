//! ターゲット常駐ヘルパーモジュールのエクスポート解決
//!
//! ヘルパーはターゲットプロセスに注入される共有ライブラリで、トレース
//! コールバックと評価ループを実行します。デバッガ側はヘルパーが
//! エクスポートする静的変数のアドレスを起点に、ブレークポイント表の
//! ミラーやステップ要求をメモリ書き込みだけで伝えます。

use tsubaki_proxy::{LayoutSet, RuntimeContext};
use tsubaki_target::{ImageSymbols, TargetAccess, TargetAccessExt};

use crate::Result;

/// 各ブレークポイントブロブスロットの容量（バイト）
pub const BLOB_SLOT_CAPACITY: usize = 64 * 1024;

/// ヘルパーのスクラッチ領域の既定サイズ（バイト）
pub const SCRATCH_CAPACITY: u64 = 256 * 1024;

/// ヘルパーモジュールの解決済みエクスポート
///
/// すべてターゲットアドレス空間内のアドレスです。
#[derive(Debug, Clone)]
pub struct HelperExports {
    /// ブレークポイントブロブの二重バッファ
    pub blob_slots: [u64; 2],
    /// アクティブスロット番号（1バイト、0または1）
    pub active_slot_flag: u64,
    /// ステップ種別（i32、`StepKind`のワイヤ値）
    pub step_kind: u64,
    /// ステップ対象スレッドID（i32）
    pub step_thread: u64,
    /// 遅延解放リストの先頭ポインタ
    pub objects_to_release: u64,
    /// 評価リクエストバッファ（UTF-8、長さプレフィクス付き）
    pub eval_request: u64,
    /// 評価結果バッファ
    pub eval_result: u64,
    /// 評価完了時にヘルパーが踏む関数
    pub eval_complete: u64,
    /// トレースコールバック関数
    pub trace_func: u64,
    /// ヘルパーが追従する現行スレッド状態（PyThreadState*）
    pub current_tstate: u64,
    /// デバッガ専用スクラッチ領域の先頭
    pub scratch_base: u64,
    /// スクラッチ領域のサイズ
    pub scratch_size: u64,
    /// フレーム構造体オフセット表の書き込み先
    pub frame_offsets: u64,
}

impl HelperExports {
    /// ヘルパーモジュールのシンボル表からエクスポートを解決する
    pub fn resolve(symbols: &ImageSymbols) -> Result<Self> {
        let lookup = |name: &str| -> Result<u64> { Ok(symbols.lookup(name)?) };
        Ok(Self {
            blob_slots: [
                lookup("tsubaki_breakpoint_blob_0")?,
                lookup("tsubaki_breakpoint_blob_1")?,
            ],
            active_slot_flag: lookup("tsubaki_active_blob")?,
            step_kind: lookup("tsubaki_step_kind")?,
            step_thread: lookup("tsubaki_step_thread")?,
            objects_to_release: lookup("tsubaki_objects_to_release")?,
            eval_request: lookup("tsubaki_eval_request")?,
            eval_result: lookup("tsubaki_eval_result")?,
            eval_complete: lookup("tsubaki_eval_complete")?,
            trace_func: lookup("tsubaki_trace_func")?,
            current_tstate: lookup("tsubaki_current_tstate")?,
            scratch_base: lookup("tsubaki_scratch")?,
            scratch_size: SCRATCH_CAPACITY,
            frame_offsets: lookup("tsubaki_frame_offsets")?,
        })
    }

    /// テスト用にアドレスを直接指定して構築する
    pub fn at_fixed(base: u64) -> Self {
        Self {
            blob_slots: [base, base + BLOB_SLOT_CAPACITY as u64],
            active_slot_flag: base + 2 * BLOB_SLOT_CAPACITY as u64,
            step_kind: base + 2 * BLOB_SLOT_CAPACITY as u64 + 0x10,
            step_thread: base + 2 * BLOB_SLOT_CAPACITY as u64 + 0x14,
            objects_to_release: base + 2 * BLOB_SLOT_CAPACITY as u64 + 0x18,
            eval_request: base + 2 * BLOB_SLOT_CAPACITY as u64 + 0x100,
            eval_result: base + 2 * BLOB_SLOT_CAPACITY as u64 + 0x1100,
            eval_complete: base + 2 * BLOB_SLOT_CAPACITY as u64 + 0x2100,
            trace_func: base + 2 * BLOB_SLOT_CAPACITY as u64 + 0x2200,
            current_tstate: base + 2 * BLOB_SLOT_CAPACITY as u64 + 0x2300,
            scratch_base: base + 2 * BLOB_SLOT_CAPACITY as u64 + 0x4000,
            scratch_size: SCRATCH_CAPACITY,
            frame_offsets: base + 2 * BLOB_SLOT_CAPACITY as u64 + 0x2400,
        }
    }

    /// 現在アクティブなブロブスロット番号を読む
    pub fn read_active_slot(&self, target: &dyn TargetAccess) -> Result<u8> {
        Ok(target.read_typed::<u8>(self.active_slot_flag)?)
    }

    /// トレースコールバックが参照するフレームオフセット表を書き込む
    ///
    /// ヘルパーはインタプリタのバージョンを知らないため、アタッチ時に
    /// デバッガ側で解決したオフセットを配ります。順序はヘルパー側の
    /// 構造体定義と一致している必要があります。
    pub fn publish_frame_offsets(
        &self,
        target: &dyn TargetAccess,
        ctx: &RuntimeContext,
    ) -> Result<()> {
        let frame_struct = if ctx.version.uses_interpreter_frames() {
            "_PyInterpreterFrame"
        } else {
            "PyFrameObject"
        };
        let entries = offsets_table(&ctx.layouts, frame_struct)?;
        let mut buf = Vec::with_capacity(entries.len() * 4);
        for off in &entries {
            buf.extend_from_slice(&(*off as i32).to_le_bytes());
        }
        target.write_bytes(self.frame_offsets, &buf)?;
        tracing::debug!(
            frame_struct,
            count = entries.len(),
            "published frame offsets to helper"
        );
        Ok(())
    }
}

fn offsets_table(layouts: &LayoutSet, frame_struct: &str) -> Result<Vec<u64>> {
    let field = |s: &str, f: &'static str| -> Result<u64> { Ok(layouts.field(s, f)?.offset) };
    let back_field: &'static str = if frame_struct == "PyFrameObject" {
        "f_back"
    } else {
        "previous"
    };
    Ok(vec![
        field(frame_struct, "f_code")?,
        field(frame_struct, back_field)?,
        field("PyCodeObject", "co_filename")?,
        field("PyCodeObject", "co_name")?,
        field("PyCodeObject", "co_firstlineno")?,
        field("PyASCIIObject", "length")?,
        field("PyThreadState", if frame_struct == "PyFrameObject" {
            "frame"
        } else {
            "cframe"
        })?,
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tsubaki_proxy::RuntimeVersion;
    use tsubaki_target::FakeTarget;

    #[test]
    fn resolve_picks_up_all_exports() {
        let symbols = ImageSymbols::from_entries(
            "/tmp/libtsubaki_helper.so",
            &[
                ("tsubaki_breakpoint_blob_0", 0x1000),
                ("tsubaki_breakpoint_blob_1", 0x11000),
                ("tsubaki_active_blob", 0x21000),
                ("tsubaki_step_kind", 0x21010),
                ("tsubaki_step_thread", 0x21014),
                ("tsubaki_objects_to_release", 0x21018),
                ("tsubaki_eval_request", 0x21100),
                ("tsubaki_eval_result", 0x22100),
                ("tsubaki_eval_complete", 0x23100),
                ("tsubaki_trace_func", 0x23200),
                ("tsubaki_current_tstate", 0x23300),
                ("tsubaki_scratch", 0x24000),
                ("tsubaki_frame_offsets", 0x23400),
            ],
        );
        let exports = HelperExports::resolve(&symbols).unwrap();
        assert_eq!(exports.blob_slots, [0x1000, 0x11000]);
        assert_eq!(exports.eval_complete, 0x23100);
        assert_eq!(exports.scratch_size, SCRATCH_CAPACITY);
    }

    #[test]
    fn resolve_fails_on_missing_export() {
        let symbols = ImageSymbols::from_entries("/tmp/x.so", &[("tsubaki_active_blob", 0x10)]);
        assert!(HelperExports::resolve(&symbols).is_err());
    }

    #[test]
    fn frame_offsets_are_written_to_target() {
        let fake = Arc::new(FakeTarget::new());
        fake.map(0x0, 0x40000 + 2 * BLOB_SLOT_CAPACITY);
        let target: Arc<dyn tsubaki_target::TargetAccess> = fake.clone();
        let ctx = RuntimeContext::assemble(
            target.clone(),
            RuntimeVersion::V311,
            tsubaki_proxy::LayoutSet::fallback(RuntimeVersion::V311),
            tsubaki_proxy::KindRegistry::new(),
            Default::default(),
        );
        let exports = HelperExports::at_fixed(0x1000);
        exports.publish_frame_offsets(target.as_ref(), &ctx).unwrap();
        let first = target.read_typed::<i32>(exports.frame_offsets).unwrap();
        let expected = ctx.layouts.field("_PyInterpreterFrame", "f_code").unwrap().offset;
        assert_eq!(first as u64, expected);
    }
}
