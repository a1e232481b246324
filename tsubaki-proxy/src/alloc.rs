//! ターゲット内オブジェクトの生成
//!
//! 値の書き換えは「スクラッチ領域に新しいオブジェクトを作り、
//! ポインタスロットを差し替える」ことで行います。ランタイムの
//! アロケータは呼びません。None/boolはシングルトンの参照カウントを
//! 増やして使い回します。

use crate::context::RuntimeContext;
use crate::{Literal, ProxyError, Result, RuntimeVersion};
use tsubaki_target::{ScratchArena, TargetAccessExt};

/// 1桁あたりのビット数（CPythonの30ビットdigit）
const DIGIT_BITS: u32 = 30;

/// スクラッチ領域へのオブジェクト生成器
pub struct ObjectAllocator;

impl ObjectAllocator {
    /// リテラルをターゲット内オブジェクトとして実体化する
    ///
    /// 返るアドレスは参照カウント1個分の所有権つきです。
    pub fn materialize(
        ctx: &RuntimeContext,
        arena: &mut ScratchArena,
        literal: &Literal,
    ) -> Result<u64> {
        match literal {
            Literal::None => Self::incref_singleton(ctx, ctx.well_known.none),
            Literal::Bool(true) => Self::incref_singleton(ctx, ctx.well_known.py_true),
            Literal::Bool(false) => Self::incref_singleton(ctx, ctx.well_known.py_false),
            Literal::Int(value) => Self::alloc_long(ctx, arena, *value),
            Literal::Float(value) => Self::alloc_float(ctx, arena, *value),
            Literal::Complex { real, imag } => Self::alloc_complex(ctx, arena, *real, *imag),
            Literal::Str(s) => Self::alloc_str(ctx, arena, s),
            Literal::Bytes(bytes) => Self::alloc_bytes(ctx, arena, bytes),
        }
    }

    fn incref_singleton(ctx: &RuntimeContext, addr: u64) -> Result<u64> {
        if addr == 0 {
            return Err(ProxyError::NullPointer { what: "singleton" });
        }
        // Arcを挟まずに一時的なPyObjectを作るためにassembleはできないので
        // 直接参照カウントを操作する
        let refcnt = ctx.layouts.field("PyObject", "ob_refcnt")?;
        let count = ctx.target.read_typed::<i64>(addr + refcnt.offset)?;
        ctx.target
            .write_typed::<i64>(addr + refcnt.offset, &(count + 1))?;
        Ok(addr)
    }

    fn write_header(ctx: &RuntimeContext, addr: u64, type_addr: u64) -> Result<()> {
        let refcnt = ctx.layouts.field("PyObject", "ob_refcnt")?;
        let ob_type = ctx.layouts.field("PyObject", "ob_type")?;
        ctx.target.write_typed::<i64>(addr + refcnt.offset, &1)?;
        ctx.target
            .write_typed::<u64>(addr + ob_type.offset, &type_addr)?;
        Ok(())
    }

    fn alloc_long(ctx: &RuntimeContext, arena: &mut ScratchArena, value: i128) -> Result<u64> {
        let magnitude = value.unsigned_abs();
        let mut digits: Vec<u32> = Vec::new();
        let mut rest = magnitude;
        while rest != 0 {
            digits.push((rest & ((1 << DIGIT_BITS) - 1)) as u32);
            rest >>= DIGIT_BITS;
        }

        let digit_field = ctx.layouts.field("PyLongObject", "ob_digit")?;
        let size = (digit_field.offset as usize) + digits.len().max(1) * 4;
        let addr = arena.alloc(size)?;
        Self::write_header(ctx, addr, ctx.well_known.long_type)?;

        match ctx.version {
            RuntimeVersion::V310 | RuntimeVersion::V311 => {
                let ob_size = ctx.layouts.field("PyLongObject", "ob_size")?;
                let signed_len = if value < 0 {
                    -(digits.len() as i64)
                } else {
                    digits.len() as i64
                };
                ctx.target
                    .write_typed::<i64>(addr + ob_size.offset, &signed_len)?;
            }
            RuntimeVersion::V312 => {
                let lv_tag = ctx.layouts.field("PyLongObject", "lv_tag")?;
                let sign_bits: i64 = match value.cmp(&0) {
                    std::cmp::Ordering::Greater => 0,
                    std::cmp::Ordering::Equal => 1,
                    std::cmp::Ordering::Less => 2,
                };
                let tag = ((digits.len() as i64) << 3) | sign_bits;
                ctx.target.write_typed::<i64>(addr + lv_tag.offset, &tag)?;
            }
        }

        for (i, digit) in digits.iter().enumerate() {
            ctx.target
                .write_typed::<u32>(addr + digit_field.offset + (i as u64) * 4, digit)?;
        }
        Ok(addr)
    }

    fn alloc_float(ctx: &RuntimeContext, arena: &mut ScratchArena, value: f64) -> Result<u64> {
        let layout = ctx.layouts.get("PyFloatObject")?;
        let fval = layout.field("ob_fval")?;
        let addr = arena.alloc(layout.size() as usize)?;
        Self::write_header(ctx, addr, ctx.well_known.float_type)?;
        ctx.target.write_typed::<f64>(addr + fval.offset, &value)?;
        Ok(addr)
    }

    fn alloc_complex(
        ctx: &RuntimeContext,
        arena: &mut ScratchArena,
        real: f64,
        imag: f64,
    ) -> Result<u64> {
        let layout = ctx.layouts.get("PyComplexObject")?;
        let re = layout.field("cval_real")?;
        let im = layout.field("cval_imag")?;
        let addr = arena.alloc(layout.size() as usize)?;
        Self::write_header(ctx, addr, ctx.well_known.complex_type)?;
        ctx.target.write_typed::<f64>(addr + re.offset, &real)?;
        ctx.target.write_typed::<f64>(addr + im.offset, &imag)?;
        Ok(addr)
    }

    /// コンパクト形式の文字列を生成する
    ///
    /// ASCIIは1バイトkind、それ以外はBMP内なら2バイトkindで書きます。
    fn alloc_str(ctx: &RuntimeContext, arena: &mut ScratchArena, s: &str) -> Result<u64> {
        let ascii = s.is_ascii();
        let chars: Vec<char> = s.chars().collect();
        if !ascii && chars.iter().any(|c| (*c as u32) > 0xffff) {
            return Err(ProxyError::Malformed {
                what: "str literal",
                detail: "characters outside the BMP are not supported".to_string(),
            });
        }

        let ascii_layout = ctx.layouts.get("PyASCIIObject")?;
        let header = if ascii {
            ascii_layout.size()
        } else {
            ctx.layouts.get("PyCompactUnicodeObject")?.size()
        };
        let char_size: u64 = if ascii { 1 } else { 2 };
        let size = header + (chars.len() as u64 + 1) * char_size;
        let addr = arena.alloc(size as usize)?;

        Self::write_header(ctx, addr, ctx.well_known.str_type)?;
        let length = ascii_layout.field("length")?;
        let hash = ascii_layout.field("hash")?;
        let state = ascii_layout.field("state")?;
        ctx.target
            .write_typed::<i64>(addr + length.offset, &(chars.len() as i64))?;
        ctx.target.write_typed::<i64>(addr + hash.offset, &-1)?;

        // interned=0, kind, compact=1, ascii
        let kind_bits: u32 = if ascii { 1 } else { 2 };
        let state_value: u32 =
            (kind_bits << 2) | (1 << 5) | if ascii { 1 << 6 } else { 0 };
        ctx.target
            .write_typed::<u32>(addr + state.offset, &state_value)?;
        if ascii_layout.has_field("wstr") {
            let wstr = ascii_layout.field("wstr")?;
            ctx.target.write_typed::<u64>(addr + wstr.offset, &0)?;
        }
        if !ascii {
            let compact = ctx.layouts.get("PyCompactUnicodeObject")?;
            ctx.target
                .write_typed::<i64>(addr + compact.field("utf8_length")?.offset, &0)?;
            ctx.target
                .write_typed::<u64>(addr + compact.field("utf8")?.offset, &0)?;
        }

        let data = addr + header;
        if ascii {
            let mut bytes: Vec<u8> = s.bytes().collect();
            bytes.push(0);
            ctx.target.write_bytes(data, &bytes)?;
        } else {
            let mut bytes = Vec::with_capacity((chars.len() + 1) * 2);
            for c in &chars {
                bytes.extend_from_slice(&(*c as u16).to_le_bytes());
            }
            bytes.extend_from_slice(&0u16.to_le_bytes());
            ctx.target.write_bytes(data, &bytes)?;
        }
        Ok(addr)
    }

    fn alloc_bytes(ctx: &RuntimeContext, arena: &mut ScratchArena, value: &[u8]) -> Result<u64> {
        let layout = ctx.layouts.get("PyBytesObject")?;
        let ob_size = layout.field("ob_size")?;
        let ob_shash = layout.field("ob_shash")?;
        let ob_sval = layout.field("ob_sval")?;

        let size = ob_sval.offset as usize + value.len() + 1;
        let addr = arena.alloc(size)?;
        Self::write_header(ctx, addr, ctx.well_known.bytes_type)?;
        ctx.target
            .write_typed::<i64>(addr + ob_size.offset, &(value.len() as i64))?;
        ctx.target.write_typed::<i64>(addr + ob_shash.offset, &-1)?;
        let mut data = value.to_vec();
        data.push(0);
        ctx.target.write_bytes(addr + ob_sval.offset, &data)?;
        Ok(addr)
    }
}

/// ポインタスロットへのリテラル代入
///
/// 新しいオブジェクトを実体化してスロットを差し替え、差し替え前の
/// オブジェクトのアドレスを返します。旧オブジェクトの参照カウント減算は
/// 呼び出し側が遅延解放キューに積みます（デバッガから直接decrefすると
/// デストラクタをデバッガスレッドで走らせることになるため）。
pub fn assign_slot(
    ctx: &RuntimeContext,
    arena: &mut ScratchArena,
    slot_addr: u64,
    literal: &Literal,
) -> Result<u64> {
    if slot_addr == 0 {
        return Err(ProxyError::NullPointer { what: "value slot" });
    }
    let old = ctx.target.read_pointer(slot_addr)?;
    let new = ObjectAllocator::materialize(ctx, arena, literal)?;
    ctx.target.write_typed::<u64>(slot_addr, &new)?;
    Ok(old)
}
