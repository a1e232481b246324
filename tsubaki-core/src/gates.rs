//! ステップインの対象を見つけるためのゲート関数表
//!
//! ゲートとは、インタプリタからインタプリタ外の任意のネイティブコードへ
//! 飛び出しうるインタプリタ内部関数です。ステップイン中はゲートの入口に
//! ブレークポイントを張り、ゲートが踏まれた時点で引数から「実際の飛び先」
//! を動的に計算して、その飛び先に単発のブレークポイントを張り直します。
//!
//! 引数の読み方は2通りあり、使い分けが正しさに直結します。ブレーク
//! ポイント停止で呼ばれた場合はレジスタ（x86-64 SysVの引数レジスタ）
//! から、ステップ開始時に既にゲート内へ入っていて同期的に再評価する
//! 場合はフレームベース相対のスタック読み出しから取ります。この非対称は
//! 呼び出し規約に由来するもので、統一してはいけません。

use tsubaki_proxy::RuntimeContext;
use tsubaki_target::{Registers, TargetAccess, TargetAccessExt};

use crate::Result;

/// ゲート引数の取得元
#[derive(Debug, Clone)]
pub enum ArgSource {
    /// 非同期のブレークポイント停止。引数はレジスタに載っている
    Registers(Registers),
    /// ステップ開始時の同期的な再評価。引数はスタックに退避済み
    ///
    /// ゲートのプロローグが引数レジスタを`[rbp+16]`以降へ保存する
    /// 前提のオフセットです。
    FrameBase { base: u64 },
}

/// ゲート関数の引数ビュー
#[derive(Debug, Clone)]
pub struct GateArgs {
    source: ArgSource,
}

impl GateArgs {
    pub fn new(source: ArgSource) -> Self {
        Self { source }
    }

    /// n番目の引数を読む
    pub fn arg(&self, target: &dyn TargetAccess, index: usize) -> Result<u64> {
        match &self.source {
            ArgSource::Registers(regs) => regs.call_arg(index).ok_or_else(|| {
                anyhow::anyhow!("gate argument {} is not passed in a register", index)
            }),
            ArgSource::FrameBase { base } => {
                Ok(target.read_typed::<u64>(base + 16 + index as u64 * 8)?)
            }
        }
    }
}

/// 飛び先ポインタの計算方法
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitExpr {
    /// 引数オブジェクトの型の関数スロット（`ob_type->スロット`）
    TypeSlot {
        arg: usize,
        slot: &'static str,
    },
    /// 引数自体が型オブジェクトで、そのスロットを直接読む
    DirectSlot {
        arg: usize,
        slot: &'static str,
    },
    /// 引数はCファンクションで、`m_ml->ml_meth`を読む
    CFunctionMeth { arg: usize },
    /// 引数はgetsetディスクリプタで、`d_getset`の関数を読む
    GetSet {
        arg: usize,
        slot: &'static str,
    },
}

/// ゲート関数の記述
#[derive(Debug, Clone, Copy)]
pub struct GateSpec {
    /// インタプリタ内のシンボル名
    pub symbol: &'static str,
    /// 飛び先候補の計算式
    pub exits: &'static [ExitExpr],
    /// 入口ブレークポイント1回の発火で出口を確定できないゲート
    ///
    /// 例えば`type_call`は`tp_new`と`tp_init`の2箇所へ順に飛ぶため、
    /// 1つ目の出口で停止した後にも残りを再評価する必要があります。
    pub multiple_exit_points: bool,
}

/// 静的ゲート表
///
/// ここに並ぶシンボルがインタプリタに存在しないバージョンもあります。
/// 解決に失敗したゲートは黙って読み飛ばします。
pub const GATE_TABLE: &[GateSpec] = &[
    GateSpec {
        symbol: "call_function",
        exits: &[
            ExitExpr::TypeSlot { arg: 0, slot: "tp_call" },
            ExitExpr::CFunctionMeth { arg: 0 },
        ],
        multiple_exit_points: false,
    },
    GateSpec {
        symbol: "PyObject_Call",
        exits: &[ExitExpr::TypeSlot { arg: 0, slot: "tp_call" }],
        multiple_exit_points: false,
    },
    GateSpec {
        symbol: "PyCFunction_Call",
        exits: &[ExitExpr::CFunctionMeth { arg: 0 }],
        multiple_exit_points: false,
    },
    GateSpec {
        symbol: "type_call",
        exits: &[
            ExitExpr::DirectSlot { arg: 0, slot: "tp_new" },
            ExitExpr::DirectSlot { arg: 0, slot: "tp_init" },
        ],
        multiple_exit_points: true,
    },
    GateSpec {
        symbol: "PyType_GenericNew",
        exits: &[ExitExpr::DirectSlot { arg: 0, slot: "tp_init" }],
        multiple_exit_points: false,
    },
    GateSpec {
        symbol: "PyObject_GetAttr",
        exits: &[ExitExpr::TypeSlot { arg: 0, slot: "tp_getattro" }],
        multiple_exit_points: false,
    },
    GateSpec {
        symbol: "PyObject_SetAttr",
        exits: &[ExitExpr::TypeSlot { arg: 0, slot: "tp_setattro" }],
        multiple_exit_points: false,
    },
    GateSpec {
        symbol: "PyObject_Repr",
        exits: &[ExitExpr::TypeSlot { arg: 0, slot: "tp_repr" }],
        multiple_exit_points: false,
    },
    GateSpec {
        symbol: "PyObject_Str",
        exits: &[ExitExpr::TypeSlot { arg: 0, slot: "tp_str" }],
        multiple_exit_points: false,
    },
    GateSpec {
        symbol: "PyObject_GetIter",
        exits: &[ExitExpr::TypeSlot { arg: 0, slot: "tp_iter" }],
        multiple_exit_points: false,
    },
    GateSpec {
        symbol: "PyIter_Next",
        exits: &[ExitExpr::TypeSlot { arg: 0, slot: "tp_iternext" }],
        multiple_exit_points: false,
    },
    GateSpec {
        symbol: "builtin_next",
        exits: &[ExitExpr::TypeSlot { arg: 0, slot: "tp_iternext" }],
        multiple_exit_points: false,
    },
    GateSpec {
        symbol: "do_richcompare",
        exits: &[
            ExitExpr::TypeSlot { arg: 0, slot: "tp_richcompare" },
            ExitExpr::TypeSlot { arg: 1, slot: "tp_richcompare" },
        ],
        multiple_exit_points: true,
    },
    GateSpec {
        symbol: "getset_get",
        exits: &[ExitExpr::GetSet { arg: 0, slot: "get" }],
        multiple_exit_points: false,
    },
    GateSpec {
        symbol: "getset_set",
        exits: &[ExitExpr::GetSet { arg: 0, slot: "set" }],
        multiple_exit_points: false,
    },
];

/// シンボル名からゲート記述を引く
pub fn gate_by_symbol(symbol: &str) -> Option<&'static GateSpec> {
    GATE_TABLE.iter().find(|g| g.symbol == symbol)
}

/// ゲートの飛び先候補を計算する
///
/// 読めなかった候補（NULLスロット、解放済みオブジェクト等)は結果から
/// 落とします。候補の欠落はステップインの精度が下がるだけで致命的では
/// ありません。
pub fn evaluate_exits(
    spec: &GateSpec,
    args: &GateArgs,
    ctx: &RuntimeContext,
) -> Vec<u64> {
    let mut out = Vec::new();
    for expr in spec.exits {
        match evaluate_exit(expr, args, ctx) {
            Ok(addr) if addr != 0 => out.push(addr),
            Ok(_) => {}
            Err(e) => {
                tracing::debug!(gate = spec.symbol, ?expr, error = %e, "exit candidate unreadable");
            }
        }
    }
    out
}

fn evaluate_exit(expr: &ExitExpr, args: &GateArgs, ctx: &RuntimeContext) -> Result<u64> {
    let target = ctx.target.as_ref();
    let addr = match *expr {
        ExitExpr::TypeSlot { arg, slot } => {
            let obj = args.arg(target, arg)?;
            let type_addr = ctx.read_field_ptr(obj, "PyObject", "ob_type")?;
            read_slot(ctx, type_addr, "PyTypeObject", slot)?
        }
        ExitExpr::DirectSlot { arg, slot } => {
            let type_addr = args.arg(target, arg)?;
            read_slot(ctx, type_addr, "PyTypeObject", slot)?
        }
        ExitExpr::CFunctionMeth { arg } => {
            let func = args.arg(target, arg)?;
            let m_ml = ctx.read_field_ptr(func, "PyCFunctionObject", "m_ml")?;
            read_slot(ctx, m_ml, "PyMethodDef", "ml_meth")?
        }
        ExitExpr::GetSet { arg, slot } => {
            let descr = args.arg(target, arg)?;
            let getset = ctx.read_field_ptr(descr, "PyGetSetDescrObject", "d_getset")?;
            read_slot(ctx, getset, "PyGetSetDef", slot)?
        }
    };
    Ok(addr)
}

fn read_slot(
    ctx: &RuntimeContext,
    base: u64,
    struct_name: &'static str,
    field: &'static str,
) -> Result<u64> {
    Ok(ctx.read_field_ptr(base, struct_name, field)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tsubaki_proxy::{KindRegistry, LayoutSet, RuntimeVersion, WellKnown};
    use tsubaki_target::FakeTarget;

    fn test_ctx() -> (Arc<RuntimeContext>, Arc<FakeTarget>) {
        let fake = Arc::new(FakeTarget::new());
        fake.map(0x1000, 0x10000);
        let target: Arc<dyn TargetAccess> = fake.clone();
        let ctx = RuntimeContext::assemble(
            target,
            RuntimeVersion::V311,
            LayoutSet::fallback(RuntimeVersion::V311),
            KindRegistry::new(),
            WellKnown::default(),
        );
        (ctx, fake)
    }

    fn regs_with_args(args: &[u64]) -> Registers {
        let mut regs = Registers::default();
        if let Some(&a) = args.first() {
            regs.rdi = a;
        }
        if let Some(&a) = args.get(1) {
            regs.rsi = a;
        }
        regs
    }

    #[test]
    fn type_slot_exit_from_registers() {
        let (ctx, _fake) = test_ctx();
        let layouts = &ctx.layouts;
        // オブジェクト 0x2000、型 0x3000、tp_call = 0x7777_0000
        let ob_type_off = layouts.field("PyObject", "ob_type").unwrap().offset;
        let tp_call_off = layouts.field("PyTypeObject", "tp_call").unwrap().offset;
        ctx.target.write_bytes(0x2000 + ob_type_off, &0x3000u64.to_le_bytes()).unwrap();
        ctx.target.write_bytes(0x3000 + tp_call_off, &0x7777_0000u64.to_le_bytes()).unwrap();

        let spec = gate_by_symbol("PyObject_Call").unwrap();
        let args = GateArgs::new(ArgSource::Registers(regs_with_args(&[0x2000])));
        assert_eq!(evaluate_exits(spec, &args, &ctx), vec![0x7777_0000]);
    }

    #[test]
    fn type_call_yields_both_exits_from_frame_base() {
        let (ctx, _fake) = test_ctx();
        let layouts = &ctx.layouts;
        let tp_new_off = layouts.field("PyTypeObject", "tp_new").unwrap().offset;
        let tp_init_off = layouts.field("PyTypeObject", "tp_init").unwrap().offset;
        ctx.target.write_bytes(0x3000 + tp_new_off, &0x5000_0000u64.to_le_bytes()).unwrap();
        ctx.target.write_bytes(0x3000 + tp_init_off, &0x5000_1000u64.to_le_bytes()).unwrap();
        // フレームベース 0x8000 のスタックに退避された第1引数
        ctx.target.write_bytes(0x8000 + 16, &0x3000u64.to_le_bytes()).unwrap();

        let spec = gate_by_symbol("type_call").unwrap();
        assert!(spec.multiple_exit_points);
        let args = GateArgs::new(ArgSource::FrameBase { base: 0x8000 });
        assert_eq!(
            evaluate_exits(spec, &args, &ctx),
            vec![0x5000_0000, 0x5000_1000]
        );
    }

    #[test]
    fn null_slots_are_dropped() {
        let (ctx, _fake) = test_ctx();
        let ob_type_off = ctx.layouts.field("PyObject", "ob_type").unwrap().offset;
        ctx.target.write_bytes(0x2000 + ob_type_off, &0x3000u64.to_le_bytes()).unwrap();
        // tp_richcompare はゼロのまま
        let spec = gate_by_symbol("do_richcompare").unwrap();
        let args = GateArgs::new(ArgSource::Registers(regs_with_args(&[0x2000, 0x2000])));
        assert!(evaluate_exits(spec, &args, &ctx).is_empty());
    }

    #[test]
    fn register_argument_out_of_range() {
        let (ctx, _fake) = test_ctx();
        let args = GateArgs::new(ArgSource::Registers(Registers::default()));
        assert!(args.arg(ctx.target.as_ref(), 6).is_err());
    }
}
