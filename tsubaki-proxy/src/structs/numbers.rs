//! 数値型のプロキシ（int / bool / float / complex）

use crate::structs::object::PyObject;
use crate::{ProxyError, Result, RuntimeVersion};
use tsubaki_target::TargetAccessExt;

/// 1桁あたりのビット数（CPythonの30ビットdigit）
const DIGIT_BITS: u32 = 30;

/// i128で表現できる上限桁数
const MAX_DIGITS: i64 = 4;

/// `PyLongObject`へのプロキシ
#[derive(Clone, Debug)]
pub struct PyLong {
    object: PyObject,
}

impl PyLong {
    pub fn bind(object: PyObject) -> Self {
        Self { object }
    }

    /// 符号と桁数を読む
    ///
    /// 3.10/3.11は`ob_size`の符号、3.12は`lv_tag`の下位2ビットが符号です。
    fn sign_and_digits(&self) -> Result<(i32, i64)> {
        let ctx = self.object.ctx();
        match ctx.version {
            RuntimeVersion::V310 | RuntimeVersion::V311 => {
                let size = ctx.read_field_i64(self.object.address(), "PyLongObject", "ob_size")?;
                let sign = match size.cmp(&0) {
                    std::cmp::Ordering::Less => -1,
                    std::cmp::Ordering::Equal => 0,
                    std::cmp::Ordering::Greater => 1,
                };
                Ok((sign, size.abs()))
            }
            RuntimeVersion::V312 => {
                let tag = ctx.read_field_i64(self.object.address(), "PyLongObject", "lv_tag")?;
                let sign = match tag & 0x3 {
                    0 => 1,
                    1 => 0,
                    _ => -1,
                };
                Ok((sign, tag >> 3))
            }
        }
    }

    /// 値を読む
    ///
    /// i128に収まらない巨大な整数は`Malformed`を返します。
    pub fn value(&self) -> Result<i128> {
        let ctx = self.object.ctx();
        let (sign, ndigits) = self.sign_and_digits()?;
        if sign == 0 || ndigits == 0 {
            return Ok(0);
        }
        if ndigits > MAX_DIGITS {
            return Err(ProxyError::Malformed {
                what: "int object",
                detail: format!("{} digits exceed displayable range", ndigits),
            });
        }

        let digit_field = ctx.layouts.field("PyLongObject", "ob_digit")?;
        let mut value: i128 = 0;
        for i in (0..ndigits).rev() {
            let digit = ctx
                .target
                .read_typed::<u32>(self.object.address() + digit_field.offset + (i as u64) * 4)?;
            value = (value << DIGIT_BITS) | i128::from(digit & ((1 << DIGIT_BITS) - 1));
        }
        Ok(value * i128::from(sign))
    }
}

/// boolオブジェクトのプロキシ
///
/// boolはシングルトン比較だけで値が決まります。
#[derive(Clone, Debug)]
pub struct PyBool;

impl PyBool {
    /// True/Falseシングルトンとの比較で値を読む
    pub fn value(object: &PyObject) -> Result<bool> {
        let wk = object.ctx().well_known;
        if object.address() == wk.py_true {
            Ok(true)
        } else if object.address() == wk.py_false {
            Ok(false)
        } else {
            // シングルトン以外のboolは存在しないが、念のためdigitを読む
            Ok(PyLong::bind(object.clone()).value()? != 0)
        }
    }
}

/// `PyFloatObject`へのプロキシ
#[derive(Clone, Debug)]
pub struct PyFloat {
    object: PyObject,
}

impl PyFloat {
    pub fn bind(object: PyObject) -> Self {
        Self { object }
    }

    /// 値を読む
    pub fn value(&self) -> Result<f64> {
        let ctx = self.object.ctx();
        let field = ctx.layouts.field("PyFloatObject", "ob_fval")?;
        Ok(ctx.target.read_typed::<f64>(self.object.address() + field.offset)?)
    }

    /// 値を書き込む
    pub fn set_value(&self, value: f64) -> Result<()> {
        let ctx = self.object.ctx();
        let field = ctx.layouts.field("PyFloatObject", "ob_fval")?;
        ctx.target
            .write_typed::<f64>(self.object.address() + field.offset, &value)?;
        Ok(())
    }
}

/// `PyComplexObject`へのプロキシ
#[derive(Clone, Debug)]
pub struct PyComplex {
    object: PyObject,
}

impl PyComplex {
    pub fn bind(object: PyObject) -> Self {
        Self { object }
    }

    /// (実部, 虚部) を読む
    pub fn value(&self) -> Result<(f64, f64)> {
        let ctx = self.object.ctx();
        let real = ctx.layouts.field("PyComplexObject", "cval_real")?;
        let imag = ctx.layouts.field("PyComplexObject", "cval_imag")?;
        Ok((
            ctx.target.read_typed::<f64>(self.object.address() + real.offset)?,
            ctx.target.read_typed::<f64>(self.object.address() + imag.offset)?,
        ))
    }
}
