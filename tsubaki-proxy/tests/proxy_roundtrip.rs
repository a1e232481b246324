//! 合成ターゲット上でのプロキシ層の結合テスト
//!
//! 実プロセスを使わず、FakeTargetに組み立てたオブジェクトグラフを
//! プロキシで読み書きして検証する。

use std::sync::Arc;
use tsubaki_proxy::repr;
use tsubaki_proxy::structs::{PyDict, PyFrame, PyLong, PyStr, PyTuple};
use tsubaki_proxy::{
    assign_slot, parse_literal, KindRegistry, LayoutSet, Literal, ObjectAllocator, ProxyError,
    PyKind, PyObject, ReprOptions, RuntimeContext, RuntimeVersion, WellKnown,
};
use tsubaki_target::{FakeTarget, ScratchArena, TargetAccess, TargetAccessExt};

// 型オブジェクトの配置
const LONG_TYPE: u64 = 0x1000;
const FLOAT_TYPE: u64 = 0x1200;
const COMPLEX_TYPE: u64 = 0x1400;
const STR_TYPE: u64 = 0x1600;
const BYTES_TYPE: u64 = 0x1800;
const BOOL_TYPE: u64 = 0x1a00;
const NONE_TYPE: u64 = 0x1c00;
const TUPLE_TYPE: u64 = 0x1e00;
const LIST_TYPE: u64 = 0x2000;
const DICT_TYPE: u64 = 0x2200;
const FRAME_TYPE: u64 = 0x2400;
const CODE_TYPE: u64 = 0x2600;

// シングルトン
const NONE_OBJ: u64 = 0x10000;
const TRUE_OBJ: u64 = 0x10100;
const FALSE_OBJ: u64 = 0x10200;

const SCRATCH_BASE: u64 = 0x10_0000;
const SCRATCH_SIZE: u64 = 0x1_0000;

struct Fixture {
    ctx: Arc<RuntimeContext>,
    arena: ScratchArena,
    fake: Arc<FakeTarget>,
}

fn fixture() -> Fixture {
    let fake = Arc::new(FakeTarget::new());
    fake.map(0x1000, 0x3000); // 型オブジェクト
    fake.map(0x10000, 0x1000); // シングルトン
    fake.map(SCRATCH_BASE, SCRATCH_SIZE as usize);

    let layouts = LayoutSet::fallback(RuntimeVersion::V311);
    let ob_type = layouts.field("PyObject", "ob_type").unwrap().offset;
    let ob_refcnt = layouts.field("PyObject", "ob_refcnt").unwrap().offset;

    // シングルトンのヘッダ
    for (addr, type_addr) in [
        (NONE_OBJ, NONE_TYPE),
        (TRUE_OBJ, BOOL_TYPE),
        (FALSE_OBJ, BOOL_TYPE),
    ] {
        fake.write_typed::<i64>(addr + ob_refcnt, &100).unwrap();
        fake.write_typed::<u64>(addr + ob_type, &type_addr).unwrap();
    }

    let mut kinds = KindRegistry::new();
    for (addr, kind) in [
        (LONG_TYPE, PyKind::Long),
        (FLOAT_TYPE, PyKind::Float),
        (COMPLEX_TYPE, PyKind::Complex),
        (STR_TYPE, PyKind::Str),
        (BYTES_TYPE, PyKind::Bytes),
        (BOOL_TYPE, PyKind::Bool),
        (NONE_TYPE, PyKind::NoneType),
        (TUPLE_TYPE, PyKind::Tuple),
        (LIST_TYPE, PyKind::List),
        (DICT_TYPE, PyKind::Dict),
        (FRAME_TYPE, PyKind::Frame),
        (CODE_TYPE, PyKind::Code),
    ] {
        kinds.register(addr, kind);
    }

    let well_known = WellKnown {
        none: NONE_OBJ,
        py_true: TRUE_OBJ,
        py_false: FALSE_OBJ,
        str_type: STR_TYPE,
        bytes_type: BYTES_TYPE,
        long_type: LONG_TYPE,
        float_type: FLOAT_TYPE,
        complex_type: COMPLEX_TYPE,
    };

    let ctx = RuntimeContext::assemble(
        fake.clone() as Arc<dyn TargetAccess>,
        RuntimeVersion::V311,
        layouts,
        kinds,
        well_known,
    );
    Fixture {
        ctx,
        arena: ScratchArena::new(SCRATCH_BASE, SCRATCH_SIZE),
        fake,
    }
}

fn materialize(f: &mut Fixture, literal: Literal) -> PyObject {
    let addr = ObjectAllocator::materialize(&f.ctx, &mut f.arena, &literal).unwrap();
    PyObject::new(f.ctx.clone(), addr).unwrap()
}

fn render_default(obj: &PyObject) -> String {
    repr::render(obj, &ReprOptions::default())
}

#[test]
fn int_literal_round_trips() {
    let mut f = fixture();
    for value in [0i128, 42, -7, 1 << 40, -(1i128 << 50)] {
        let obj = materialize(&mut f, Literal::Int(value));
        assert_eq!(obj.kind().unwrap(), PyKind::Long);
        assert_eq!(PyLong::bind(obj.clone()).value().unwrap(), value);
        assert_eq!(render_default(&obj), value.to_string());
    }
}

#[test]
fn float_and_complex_round_trip() {
    let mut f = fixture();
    let obj = materialize(&mut f, Literal::Float(2.5));
    assert_eq!(render_default(&obj), "2.5");
    let whole = materialize(&mut f, Literal::Float(3.0));
    assert_eq!(render_default(&whole), "3.0");

    let c = materialize(
        &mut f,
        Literal::Complex {
            real: 1.0,
            imag: 2.0,
        },
    );
    assert_eq!(render_default(&c), "(1.0+2.0j)");
}

#[test]
fn str_and_bytes_round_trip() {
    let mut f = fixture();
    let s = materialize(&mut f, Literal::Str("hello".to_string()));
    assert_eq!(PyStr::bind(s.clone()).value().unwrap(), "hello");
    assert_eq!(render_default(&s), "'hello'");

    // 非ASCII（2バイトkind）
    let wide = materialize(&mut f, Literal::Str("こんにちは".to_string()));
    assert_eq!(PyStr::bind(wide).value().unwrap(), "こんにちは");

    let b = materialize(&mut f, Literal::Bytes(vec![1, 0x41, 0xff]));
    assert_eq!(render_default(&b), "b'\\x01A\\xff'");
}

#[test]
fn singletons_are_reused_with_incref() {
    let mut f = fixture();
    let before = f.ctx.target.read_typed::<i64>(NONE_OBJ).unwrap();
    let obj = materialize(&mut f, Literal::None);
    assert_eq!(obj.address(), NONE_OBJ);
    assert_eq!(obj.kind().unwrap(), PyKind::NoneType);
    assert_eq!(render_default(&obj), "None");
    let after = f.ctx.target.read_typed::<i64>(NONE_OBJ).unwrap();
    assert_eq!(after, before + 1);

    let t = materialize(&mut f, Literal::Bool(true));
    assert_eq!(t.address(), TRUE_OBJ);
    assert_eq!(render_default(&t), "True");
}

/// 手組みでtupleを作る（要素ポインタは構造体内に続く）
fn build_tuple(f: &mut Fixture, items: &[u64]) -> PyObject {
    let layouts = &f.ctx.layouts;
    let ob_item = layouts.field("PyTupleObject", "ob_item").unwrap().offset;
    let ob_size = layouts.field("PyTupleObject", "ob_size").unwrap().offset;
    let addr = f.arena.alloc((ob_item as usize) + items.len() * 8 + 8).unwrap();
    let target = &f.ctx.target;
    target.write_typed::<i64>(addr, &1).unwrap();
    target.write_typed::<u64>(addr + 8, &TUPLE_TYPE).unwrap();
    target
        .write_typed::<i64>(addr + ob_size, &(items.len() as i64))
        .unwrap();
    for (i, item) in items.iter().enumerate() {
        target
            .write_typed::<u64>(addr + ob_item + (i as u64) * 8, item)
            .unwrap();
    }
    PyObject::new(f.ctx.clone(), addr).unwrap()
}

#[test]
fn tuple_repr_has_trailing_comma_for_singletons() {
    let mut f = fixture();
    let one = materialize(&mut f, Literal::Int(1)).address();
    let two = materialize(&mut f, Literal::Int(2)).address();

    let single = build_tuple(&mut f, &[one]);
    assert_eq!(render_default(&single), "(1,)");

    let pair = build_tuple(&mut f, &[one, two]);
    assert_eq!(render_default(&pair), "(1, 2)");
    assert_eq!(PyTuple::bind(pair).len().unwrap(), 2);
}

/// 手組みでlistを作る（要素配列は別領域）
fn build_list(f: &mut Fixture, items: &[u64]) -> PyObject {
    let layouts = &f.ctx.layouts;
    let list_size = layouts.get("PyListObject").unwrap().size();
    let ob_item = layouts.field("PyListObject", "ob_item").unwrap().offset;
    let ob_size = layouts.field("PyListObject", "ob_size").unwrap().offset;
    let addr = f.arena.alloc(list_size as usize).unwrap();
    let items_addr = f.arena.alloc(items.len().max(1) * 8).unwrap();
    let target = &f.ctx.target;
    target.write_typed::<i64>(addr, &1).unwrap();
    target.write_typed::<u64>(addr + 8, &LIST_TYPE).unwrap();
    target
        .write_typed::<i64>(addr + ob_size, &(items.len() as i64))
        .unwrap();
    target.write_typed::<u64>(addr + ob_item, &items_addr).unwrap();
    for (i, item) in items.iter().enumerate() {
        target
            .write_typed::<u64>(items_addr + (i as u64) * 8, item)
            .unwrap();
    }
    PyObject::new(f.ctx.clone(), addr).unwrap()
}

#[test]
fn self_referential_list_renders_placeholder() {
    let mut f = fixture();
    // 仮の要素で作ってから自分自身を指すように書き換える
    let list = build_list(&mut f, &[NONE_OBJ]);
    let ob_item = f.ctx.layouts.field("PyListObject", "ob_item").unwrap().offset;
    let items_addr = f.ctx.target.read_typed::<u64>(list.address() + ob_item).unwrap();
    f.ctx
        .target
        .write_typed::<u64>(items_addr, &list.address())
        .unwrap();

    assert_eq!(render_default(&list), "[...]");
}

#[test]
fn render_is_bounded_and_truncated_output_ends_with_ellipsis() {
    let mut f = fixture();
    let long_str = materialize(&mut f, Literal::Str("x".repeat(500)));
    let options = ReprOptions {
        max_length: 50,
        hex_display: false,
    };
    let out = repr::render(&long_str, &options);
    assert!(out.len() <= 50, "len {} exceeds bound", out.len());
    assert!(out.ends_with("..."));

    // 同じオブジェクトを二度描画しても同じ結果になる
    assert_eq!(out, repr::render(&long_str, &options));
}

#[test]
fn hex_display_changes_int_rendering() {
    let mut f = fixture();
    let obj = materialize(&mut f, Literal::Int(255));
    let options = ReprOptions {
        max_length: 64,
        hex_display: true,
    };
    assert_eq!(repr::render(&obj, &options), "0xff");
}

/// 手組みで3.11形式（unicodeキー）のdictを作る
fn build_dict(f: &mut Fixture, entries: &[(u64, u64)]) -> PyObject {
    let layouts = &f.ctx.layouts;
    let dict_size = layouts.get("PyDictObject").unwrap().size();
    let ma_used = layouts.field("PyDictObject", "ma_used").unwrap().offset;
    let ma_keys = layouts.field("PyDictObject", "ma_keys").unwrap().offset;
    let ma_values = layouts.field("PyDictObject", "ma_values").unwrap().offset;
    let dk_indices = layouts.field("PyDictKeysObject", "dk_indices").unwrap().offset;

    let addr = f.arena.alloc(dict_size as usize).unwrap();
    // keysブロック: ヘッダ + インデックス8バイト + エントリ16バイト×n
    let keys_addr = f
        .arena
        .alloc(dk_indices as usize + 8 + entries.len() * 16)
        .unwrap();

    let target = &f.ctx.target;
    target.write_typed::<i64>(addr, &1).unwrap();
    target.write_typed::<u64>(addr + 8, &DICT_TYPE).unwrap();
    target
        .write_typed::<i64>(addr + ma_used, &(entries.len() as i64))
        .unwrap();
    target.write_typed::<u64>(addr + ma_keys, &keys_addr).unwrap();
    target.write_typed::<u64>(addr + ma_values, &0).unwrap();

    let log2_size = layouts.field("PyDictKeysObject", "dk_log2_size").unwrap().offset;
    let log2_bytes = layouts
        .field("PyDictKeysObject", "dk_log2_index_bytes")
        .unwrap()
        .offset;
    let dk_kind = layouts.field("PyDictKeysObject", "dk_kind").unwrap().offset;
    let dk_nentries = layouts.field("PyDictKeysObject", "dk_nentries").unwrap().offset;
    target.write_typed::<u8>(keys_addr + log2_size, &3).unwrap();
    target.write_typed::<u8>(keys_addr + log2_bytes, &3).unwrap();
    target.write_typed::<u8>(keys_addr + dk_kind, &1).unwrap();
    target
        .write_typed::<i64>(keys_addr + dk_nentries, &(entries.len() as i64))
        .unwrap();

    let entry_base = keys_addr + dk_indices + 8;
    for (i, (key, value)) in entries.iter().enumerate() {
        let entry = entry_base + (i as u64) * 16;
        target.write_typed::<u64>(entry, key).unwrap();
        target.write_typed::<u64>(entry + 8, value).unwrap();
    }
    PyObject::new(f.ctx.clone(), addr).unwrap()
}

#[test]
fn dict_entries_and_repr() {
    let mut f = fixture();
    let key_a = materialize(&mut f, Literal::Str("a".to_string())).address();
    let key_b = materialize(&mut f, Literal::Str("b".to_string())).address();
    let one = materialize(&mut f, Literal::Int(1)).address();
    let two = materialize(&mut f, Literal::Int(2)).address();

    let dict = build_dict(&mut f, &[(key_a, one), (key_b, two)]);
    assert_eq!(PyDict::bind(dict.clone()).len().unwrap(), 2);
    assert_eq!(render_default(&dict), "{'a': 1, 'b': 2}");
}

#[test]
fn children_of_containers_are_named() {
    let mut f = fixture();
    let one = materialize(&mut f, Literal::Int(1)).address();
    let ok = materialize(&mut f, Literal::Str("ok".to_string())).address();
    let list = build_list(&mut f, &[one, ok]);
    let kids = tsubaki_proxy::children(&list).unwrap();
    assert_eq!(kids.len(), 2);
    assert_eq!(kids[0].0, "[0]");
    assert_eq!(kids[1].0, "[1]");
    assert_eq!(kids[1].1.address(), ok);

    let key = materialize(&mut f, Literal::Str("count".to_string())).address();
    let three = materialize(&mut f, Literal::Int(3)).address();
    let dict = build_dict(&mut f, &[(key, three)]);
    let kids = tsubaki_proxy::children(&dict).unwrap();
    assert_eq!(kids.len(), 1);
    assert_eq!(kids[0].0, "['count']");
    assert_eq!(kids[0].1.address(), three);

    // スカラは子を持たない
    let scalar = materialize(&mut f, Literal::Int(5));
    assert!(tsubaki_proxy::children(&scalar).unwrap().is_empty());
}

#[test]
fn assign_slot_swaps_pointer_and_returns_old_value() {
    let mut f = fixture();
    let old_obj = materialize(&mut f, Literal::Int(1));
    let slot = f.arena.alloc(8).unwrap();
    f.ctx
        .target
        .write_typed::<u64>(slot, &old_obj.address())
        .unwrap();

    let returned_old = assign_slot(
        &f.ctx,
        &mut f.arena,
        slot,
        &Literal::Str("new".to_string()),
    )
    .unwrap();
    assert_eq!(returned_old, old_obj.address());

    let new_ptr = f.ctx.target.read_typed::<u64>(slot).unwrap();
    let new_obj = PyObject::new(f.ctx.clone(), new_ptr).unwrap();
    assert_eq!(new_obj.ob_refcnt().unwrap(), 1);
    assert_eq!(render_default(&new_obj), "'new'");
}

#[test]
fn literal_parser_feeds_allocator() {
    let mut f = fixture();
    let lit = parse_literal("1+2j").unwrap();
    let obj = materialize(&mut f, lit);
    assert_eq!(obj.kind().unwrap(), PyKind::Complex);
}

/// 手組みでコードオブジェクトとインタプリタフレームを作る
fn build_frame(f: &mut Fixture) -> PyFrame {
    let layouts = f.ctx.layouts.clone();
    let name = materialize(f, Literal::Str("work".to_string())).address();
    let filename = materialize(f, Literal::Str("job.py".to_string())).address();
    let x_name = materialize(f, Literal::Str("x".to_string())).address();
    let y_name = materialize(f, Literal::Str("y".to_string())).address();
    let names_tuple = build_tuple(f, &[x_name, y_name]).address();
    let x_value = materialize(f, Literal::Int(10)).address();
    let y_value = materialize(f, Literal::Str("ok".to_string())).address();

    let code_layout = layouts.get("PyCodeObject").unwrap();
    let code = f.arena.alloc(code_layout.size() as usize).unwrap();
    let target = &f.ctx.target;
    target.write_typed::<i64>(code, &1).unwrap();
    target.write_typed::<u64>(code + 8, &CODE_TYPE).unwrap();
    let wf = |field: &'static str| code_layout.field(field).unwrap().offset;
    target.write_typed::<u64>(code + wf("co_filename"), &filename).unwrap();
    target.write_typed::<u64>(code + wf("co_name"), &name).unwrap();
    target.write_typed::<i32>(code + wf("co_firstlineno"), &3).unwrap();
    target.write_typed::<i32>(code + wf("co_nlocals"), &2).unwrap();
    target.write_typed::<i32>(code + wf("co_argcount"), &1).unwrap();
    target
        .write_typed::<u64>(code + wf("co_localsplusnames"), &names_tuple)
        .unwrap();

    let frame_layout = layouts.get("_PyInterpreterFrame").unwrap();
    let localsplus = frame_layout.field("localsplus").unwrap().offset;
    let frame = f.arena.alloc(localsplus as usize + 2 * 8).unwrap();
    let ff = |field: &'static str| frame_layout.field(field).unwrap().offset;
    target.write_typed::<u64>(frame + ff("f_code"), &code).unwrap();
    target.write_typed::<u64>(frame + ff("previous"), &0).unwrap();
    target.write_typed::<u64>(frame + localsplus, &x_value).unwrap();
    target
        .write_typed::<u64>(frame + localsplus + 8, &y_value)
        .unwrap();

    PyFrame::new(f.ctx.clone(), frame).unwrap()
}

#[test]
fn frame_exposes_code_and_locals() {
    let mut f = fixture();
    let frame = build_frame(&mut f);

    let code = frame.code().unwrap();
    assert_eq!(code.name().unwrap(), "work");
    assert_eq!(code.filename().unwrap(), "job.py");
    assert_eq!(frame.line_number().unwrap(), 3);

    let locals = frame.locals().unwrap();
    let names: Vec<&str> = locals.iter().map(|(n, _)| n.as_str()).collect();
    assert_eq!(names, vec!["x", "y"]);
    assert_eq!(render_default(&locals[0].1), "10");
    assert_eq!(render_default(&locals[1].1), "'ok'");

    assert_eq!(frame.chain().unwrap().len(), 1);
}

#[test]
fn unregistered_type_errors_but_renders_generically() {
    let mut f = fixture();
    let layouts = &f.ctx.layouts;
    let ob_type = layouts.field("PyObject", "ob_type").unwrap().offset;
    let tp_name = layouts.field("PyTypeObject", "tp_name").unwrap().offset;
    let target = f.ctx.target.clone();

    // 対応表に未登録の型（tp_base=0, tp_name="widget"）
    let widget_type = 0x2800u64;
    let name_addr = f.arena.alloc(8).unwrap();
    target.write_bytes(name_addr, b"widget\0").unwrap();
    target.write_typed::<u64>(widget_type + tp_name, &name_addr).unwrap();

    let instance = f.arena.alloc(32).unwrap();
    target.write_typed::<u64>(instance + ob_type, &widget_type).unwrap();
    let obj = PyObject::new(f.ctx.clone(), instance).unwrap();

    // 厳密判定はエラー、診断表示は汎用表示に落ちる
    assert!(matches!(
        obj.kind(),
        Err(ProxyError::UnknownRuntimeType { type_addr }) if type_addr == widget_type
    ));
    assert_eq!(obj.kind_or_other().unwrap(), PyKind::Other);
    assert_eq!(
        render_default(&obj),
        format!("<widget object at 0x{:x}>", instance)
    );
}

#[test]
fn frame_debug_avoids_target_reads() {
    let mut f = fixture();
    let frame = build_frame(&mut f);
    let address = frame.address();
    f.fake.kill();
    assert_eq!(format!("{:?}", frame), format!("PyFrame(0x{:x})", address));
}

#[test]
fn dead_target_surfaces_process_gone() {
    let mut f = fixture();
    let obj = materialize(&mut f, Literal::Int(5));
    f.fake.kill();
    assert!(obj.kind().is_err());
    assert_eq!(render_default(&obj), "<unreadable>");
}
