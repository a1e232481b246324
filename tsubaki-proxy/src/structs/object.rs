//! オブジェクトプロキシの基底
//!
//! すべてのランタイムオブジェクトは`PyObject`として扱えます。
//! 種別判定の後、対応する型別プロキシにラップし直して使います。

use crate::context::RuntimeContext;
use crate::{ProxyError, PyKind, Result};
use std::sync::Arc;
use tsubaki_target::TargetAccessExt;

/// ターゲット内オブジェクトへのプロキシ
///
/// （コンテキスト, アドレス）のみを保持し、内容はキャッシュしません。
#[derive(Clone)]
pub struct PyObject {
    ctx: Arc<RuntimeContext>,
    address: u64,
}

impl PyObject {
    /// プロキシを作成する
    ///
    /// NULLアドレスは作成時点で拒否されます。
    pub fn new(ctx: Arc<RuntimeContext>, address: u64) -> Result<Self> {
        if address == 0 {
            return Err(ProxyError::NullPointer { what: "PyObject" });
        }
        Ok(Self { ctx, address })
    }

    /// ターゲット内アドレス
    pub fn address(&self) -> u64 {
        self.address
    }

    /// コンテキスト
    pub fn ctx(&self) -> &Arc<RuntimeContext> {
        &self.ctx
    }

    /// `ob_type`の値（型オブジェクトのアドレス）を読む
    pub fn ob_type(&self) -> Result<u64> {
        self.ctx.read_field_ptr(self.address, "PyObject", "ob_type")
    }

    /// 参照カウントを読む
    pub fn ob_refcnt(&self) -> Result<i64> {
        self.ctx.read_field_i64(self.address, "PyObject", "ob_refcnt")
    }

    /// 参照カウントを増やす
    ///
    /// 評価で生成したオブジェクトをターゲットに渡すときに使います。
    pub fn incref(&self) -> Result<()> {
        let desc = self.ctx.layouts.field("PyObject", "ob_refcnt")?;
        let count = self.ob_refcnt()?;
        self.ctx
            .target
            .write_typed::<i64>(self.address + desc.offset, &(count + 1))?;
        Ok(())
    }

    /// 可変長オブジェクトの`ob_size`を読む
    pub fn var_size(&self) -> Result<i64> {
        self.ctx.read_field_i64(self.address, "PyVarObject", "ob_size")
    }

    /// オブジェクトの種別を判定する
    ///
    /// Noneシングルトンはアドレス比較で即決し、それ以外は型対応表で
    /// `tp_base`チェインをたどって判定します。未知の型は
    /// `UnknownRuntimeType`エラーです。
    pub fn kind(&self) -> Result<PyKind> {
        if self.address == self.ctx.well_known.none {
            return Ok(PyKind::NoneType);
        }
        let type_addr = self.ob_type()?;
        self.ctx
            .kinds
            .kind_of(self.ctx.target.as_ref(), &self.ctx.layouts, type_addr)
    }

    /// 未知の型を`Other`に落として種別を判定する
    ///
    /// repr等の診断表示で汎用表示にフォールバックする経路向け。
    pub fn kind_or_other(&self) -> Result<PyKind> {
        if self.address == self.ctx.well_known.none {
            return Ok(PyKind::NoneType);
        }
        let type_addr = self.ob_type()?;
        self.ctx
            .kinds
            .kind_of_or_other(self.ctx.target.as_ref(), &self.ctx.layouts, type_addr)
    }

    /// 型名（`ob_type->tp_name`）を読む
    pub fn type_name(&self) -> Result<String> {
        let type_addr = self.ob_type()?;
        if type_addr == 0 {
            return Err(ProxyError::NullPointer { what: "ob_type" });
        }
        let tp_name = self.ctx.read_field_ptr(type_addr, "PyTypeObject", "tp_name")?;
        if tp_name == 0 {
            return Err(ProxyError::NullPointer { what: "tp_name" });
        }
        Ok(self.ctx.target.read_cstring(tp_name, 256)?)
    }
}

impl std::fmt::Debug for PyObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PyObject(0x{:x})", self.address)
    }
}
