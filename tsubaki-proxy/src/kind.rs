//! ランタイム型の判別
//!
//! オブジェクトの`ob_type`が指す型オブジェクトのアドレスを、既知の
//! 組み込み型に対応付けます。未知の型は`tp_base`チェインを親方向に
//! たどり、組み込み型のサブクラスであれば親の種別として扱います。

use crate::{LayoutSet, ProxyError, Result};
use std::collections::HashMap;
use tsubaki_target::{TargetAccess, TargetAccessExt};

/// tp_baseチェインをたどる上限
const MAX_BASE_CHAIN: usize = 16;

/// 組み込み型の種別
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PyKind {
    NoneType,
    Bool,
    Long,
    Float,
    Complex,
    Str,
    Bytes,
    Tuple,
    List,
    Dict,
    Type,
    Frame,
    Code,
    Function,
    Module,
    BaseException,
    /// 既知の組み込み型に対応しない型
    Other,
}

/// 型オブジェクトアドレス → 種別 の対応表
///
/// アタッチ時にインタプリタのエクスポートシンボル
/// （`PyLong_Type`等）から構築されます。
#[derive(Debug, Default, Clone)]
pub struct KindRegistry {
    by_type_addr: HashMap<u64, PyKind>,
}

impl KindRegistry {
    /// 空の対応表を作成する
    pub fn new() -> Self {
        Self::default()
    }

    /// 型オブジェクトを登録する
    pub fn register(&mut self, type_addr: u64, kind: PyKind) {
        self.by_type_addr.insert(type_addr, kind);
    }

    /// 型シンボル名と種別の対応
    ///
    /// アタッチ処理がこの一覧のシンボルを解決して`register`します。
    pub fn builtin_symbols() -> &'static [(&'static str, PyKind)] {
        &[
            ("_PyNone_Type", PyKind::NoneType),
            ("PyBool_Type", PyKind::Bool),
            ("PyLong_Type", PyKind::Long),
            ("PyFloat_Type", PyKind::Float),
            ("PyComplex_Type", PyKind::Complex),
            ("PyUnicode_Type", PyKind::Str),
            ("PyBytes_Type", PyKind::Bytes),
            ("PyTuple_Type", PyKind::Tuple),
            ("PyList_Type", PyKind::List),
            ("PyDict_Type", PyKind::Dict),
            ("PyType_Type", PyKind::Type),
            ("PyFrame_Type", PyKind::Frame),
            ("PyCode_Type", PyKind::Code),
            ("PyFunction_Type", PyKind::Function),
            ("PyModule_Type", PyKind::Module),
            ("PyExc_BaseException", PyKind::BaseException),
        ]
    }

    /// 型オブジェクトのアドレスから種別を判定する
    ///
    /// 直接登録されていない型は`tp_base`を親方向にたどります。
    /// どの既知型にも行き着かない場合は`UnknownRuntimeType`エラーです。
    /// 汎用表示で済ませてよい経路は`kind_of_or_other`を使ってください。
    pub fn kind_of(
        &self,
        target: &dyn TargetAccess,
        layouts: &LayoutSet,
        type_addr: u64,
    ) -> Result<PyKind> {
        if type_addr == 0 {
            return Err(ProxyError::NullPointer { what: "ob_type" });
        }

        let tp_base = layouts.field("PyTypeObject", "tp_base")?;
        let mut current = type_addr;
        for _ in 0..MAX_BASE_CHAIN {
            if let Some(kind) = self.by_type_addr.get(&current) {
                return Ok(*kind);
            }
            current = target.read_pointer(current + tp_base.offset)?;
            if current == 0 {
                break;
            }
        }
        Err(ProxyError::UnknownRuntimeType { type_addr })
    }

    /// 未知の型を`Other`に落として判定する
    ///
    /// repr等の診断表示向け。メモリ読み出し失敗などの他のエラーは
    /// そのまま伝播します。
    pub fn kind_of_or_other(
        &self,
        target: &dyn TargetAccess,
        layouts: &LayoutSet,
        type_addr: u64,
    ) -> Result<PyKind> {
        match self.kind_of(target, layouts, type_addr) {
            Err(ProxyError::UnknownRuntimeType { .. }) => Ok(PyKind::Other),
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{LayoutSet, RuntimeVersion};
    use tsubaki_target::FakeTarget;

    #[test]
    fn subtype_chases_tp_base_to_builtin() {
        let layouts = LayoutSet::fallback(RuntimeVersion::V311);
        let tp_base = layouts.field("PyTypeObject", "tp_base").unwrap().offset;

        let target = FakeTarget::new();
        target.map(0x1000, 0x2000);
        let long_type = 0x1000u64;
        let subclass = 0x1800u64;
        // サブクラスのtp_baseがlong型を指す
        target
            .write_bytes(subclass + tp_base, &long_type.to_le_bytes())
            .unwrap();

        let mut registry = KindRegistry::new();
        registry.register(long_type, PyKind::Long);

        assert_eq!(
            registry.kind_of(&target, &layouts, subclass).unwrap(),
            PyKind::Long
        );
        assert_eq!(
            registry.kind_of(&target, &layouts, long_type).unwrap(),
            PyKind::Long
        );
    }

    #[test]
    fn unrelated_type_is_an_error() {
        let layouts = LayoutSet::fallback(RuntimeVersion::V311);
        let target = FakeTarget::new();
        target.map(0x1000, 0x1000);

        let registry = KindRegistry::new();
        assert!(matches!(
            registry.kind_of(&target, &layouts, 0x1000),
            Err(ProxyError::UnknownRuntimeType { type_addr: 0x1000 })
        ));
    }

    #[test]
    fn unrelated_type_degrades_to_other_on_request() {
        let layouts = LayoutSet::fallback(RuntimeVersion::V311);
        let target = FakeTarget::new();
        target.map(0x1000, 0x1000);

        let registry = KindRegistry::new();
        assert_eq!(
            registry
                .kind_of_or_other(&target, &layouts, 0x1000)
                .unwrap(),
            PyKind::Other
        );
        // 未知型以外のエラーは落とさない
        assert!(matches!(
            registry.kind_of_or_other(&target, &layouts, 0),
            Err(ProxyError::NullPointer { .. })
        ));
    }

    #[test]
    fn null_type_pointer_is_an_error() {
        let layouts = LayoutSet::fallback(RuntimeVersion::V311);
        let target = FakeTarget::new();
        let registry = KindRegistry::new();
        assert!(matches!(
            registry.kind_of(&target, &layouts, 0),
            Err(ProxyError::NullPointer { .. })
        ));
    }
}
