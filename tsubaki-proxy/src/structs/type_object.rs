//! 型オブジェクトのプロキシ

use crate::structs::object::PyObject;
use crate::Result;
use tsubaki_target::TargetAccessExt;

/// `PyTypeObject`へのプロキシ
///
/// ステップゲートが`tp_call`や`tp_new`の実体アドレスを引くときに
/// 使われます。
#[derive(Clone, Debug)]
pub struct PyType {
    object: PyObject,
}

impl PyType {
    /// 型オブジェクトとしてラップする
    pub fn bind(object: PyObject) -> Self {
        Self { object }
    }

    /// 基底の`PyObject`
    pub fn as_object(&self) -> &PyObject {
        &self.object
    }

    fn field_ptr(&self, field: &'static str) -> Result<u64> {
        self.object
            .ctx()
            .read_field_ptr(self.object.address(), "PyTypeObject", field)
    }

    /// 型名（`tp_name`）を読む
    pub fn name(&self) -> Result<String> {
        let tp_name = self.field_ptr("tp_name")?;
        Ok(self.object.ctx().target.read_cstring(tp_name, 256)?)
    }

    /// `tp_call`スロットの関数アドレス
    pub fn tp_call(&self) -> Result<u64> {
        self.field_ptr("tp_call")
    }

    /// `tp_new`スロットの関数アドレス
    pub fn tp_new(&self) -> Result<u64> {
        self.field_ptr("tp_new")
    }

    /// `tp_init`スロットの関数アドレス
    pub fn tp_init(&self) -> Result<u64> {
        self.field_ptr("tp_init")
    }

    /// `tp_richcompare`スロットの関数アドレス
    pub fn tp_richcompare(&self) -> Result<u64> {
        self.field_ptr("tp_richcompare")
    }

    /// 基底型（`tp_base`）のアドレス
    pub fn base(&self) -> Result<u64> {
        self.field_ptr("tp_base")
    }

    /// インスタンス辞書のオフセット（`tp_dictoffset`）
    pub fn dictoffset(&self) -> Result<i64> {
        self.object
            .ctx()
            .read_field_i64(self.object.address(), "PyTypeObject", "tp_dictoffset")
    }
}
