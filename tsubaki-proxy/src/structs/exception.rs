//! 例外オブジェクトのプロキシ

use crate::structs::containers::PyTuple;
use crate::structs::object::PyObject;
use crate::structs::strings::PyStr;
use crate::{PyKind, Result};

/// `BaseException`派生オブジェクトへのプロキシ
#[derive(Clone, Debug)]
pub struct PyBaseException {
    object: PyObject,
}

impl PyBaseException {
    pub fn bind(object: PyObject) -> Self {
        Self { object }
    }

    /// 基底の`PyObject`
    pub fn as_object(&self) -> &PyObject {
        &self.object
    }

    /// コンストラクタ引数のタプル（`args`）
    pub fn args(&self) -> Result<Option<PyTuple>> {
        let ctx = self.object.ctx();
        let args_ptr =
            ctx.read_field_ptr(self.object.address(), "PyBaseExceptionObject", "args")?;
        if args_ptr == 0 {
            return Ok(None);
        }
        Ok(Some(PyTuple::bind(PyObject::new(ctx.clone(), args_ptr)?)))
    }

    /// 例外メッセージを取り出す
    ///
    /// 慣例どおり、argsの先頭要素が文字列ならそれをメッセージとします。
    pub fn message(&self) -> Result<Option<String>> {
        let Some(args) = self.args()? else {
            return Ok(None);
        };
        if args.is_empty()? {
            return Ok(None);
        }
        match args.item(0)? {
            Some(first) if first.kind_or_other()? == PyKind::Str => {
                Ok(Some(PyStr::bind(first).value()?))
            }
            _ => Ok(None),
        }
    }
}
