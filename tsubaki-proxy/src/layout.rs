//! 構造体レイアウト
//!
//! インタプリタ内部構造体のフィールドオフセットを保持します。
//! 解決順序は DWARF → バージョン別の既知オフセット表 です。
//! プロキシはここで解決済みのオフセットだけを使い、ソースコード上の
//! 構造体定義を直接埋め込むことはしません。

use crate::{ProxyError, Result, RuntimeVersion};
use std::collections::HashMap;

/// 解決済みフィールド
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldDesc {
    pub offset: u64,
    pub size: u64,
}

/// 1つの構造体のレイアウト
#[derive(Debug, Clone)]
pub struct StructLayout {
    name: String,
    size: u64,
    fields: HashMap<String, FieldDesc>,
}

impl StructLayout {
    /// レイアウトを作成する
    pub fn new(name: &str, size: u64) -> Self {
        Self {
            name: name.to_string(),
            size,
            fields: HashMap::new(),
        }
    }

    /// フィールドを追加する
    pub fn with_field(mut self, name: &str, offset: u64, size: u64) -> Self {
        self.fields
            .insert(name.to_string(), FieldDesc { offset, size });
        self
    }

    /// 構造体名
    pub fn name(&self) -> &str {
        &self.name
    }

    /// 構造体サイズ（バイト数）
    pub fn size(&self) -> u64 {
        self.size
    }

    /// フィールドを引く
    pub fn field(&self, field: &'static str) -> Result<FieldDesc> {
        self.fields
            .get(field)
            .copied()
            .ok_or_else(|| ProxyError::MissingField {
                struct_name: self.name.clone(),
                field,
            })
    }

    /// フィールドを持つかどうか
    pub fn has_field(&self, field: &str) -> bool {
        self.fields.contains_key(field)
    }
}

/// プロセス単位で解決された全構造体レイアウト
#[derive(Debug, Clone, Default)]
pub struct LayoutSet {
    by_name: HashMap<String, StructLayout>,
}

impl LayoutSet {
    /// 空のセットを作成する
    pub fn new() -> Self {
        Self::default()
    }

    /// レイアウトを登録する（同名は上書き）
    pub fn insert(&mut self, layout: StructLayout) {
        self.by_name.insert(layout.name().to_string(), layout);
    }

    /// 構造体レイアウトを引く
    pub fn get(&self, name: &str) -> Result<&StructLayout> {
        self.by_name
            .get(name)
            .ok_or_else(|| ProxyError::UnknownLayout {
                name: name.to_string(),
            })
    }

    /// 構造体のフィールドを引く
    pub fn field(&self, struct_name: &str, field: &'static str) -> Result<FieldDesc> {
        self.get(struct_name)?.field(field)
    }

    /// バージョン別の既知オフセット表からセットを構築する
    ///
    /// DWARFが利用できない（ストリップ済みイタプリタ等）場合の
    /// フォールバックです。x86-64のみ対応しています。
    pub fn fallback(version: RuntimeVersion) -> Self {
        let mut set = Self::new();
        let p = 8u64; // pointer size

        set.insert(
            StructLayout::new("PyObject", 16)
                .with_field("ob_refcnt", 0, p)
                .with_field("ob_type", 8, p),
        );
        set.insert(StructLayout::new("PyVarObject", 24).with_field("ob_size", 16, p));
        set.insert(
            StructLayout::new("PyTypeObject", 408)
                .with_field("tp_name", 24, p)
                .with_field("tp_basicsize", 32, p)
                .with_field("tp_itemsize", 40, p)
                .with_field("tp_repr", 88, p)
                .with_field("tp_call", 128, p)
                .with_field("tp_str", 136, p)
                .with_field("tp_getattro", 144, p)
                .with_field("tp_setattro", 152, p)
                .with_field("tp_flags", 168, p)
                .with_field("tp_richcompare", 200, p)
                .with_field("tp_iter", 216, p)
                .with_field("tp_iternext", 224, p)
                .with_field("tp_base", 256, p)
                .with_field("tp_dict", 264, p)
                .with_field("tp_dictoffset", 288, p)
                .with_field("tp_init", 296, p)
                .with_field("tp_alloc", 304, p)
                .with_field("tp_new", 312, p)
                .with_field("tp_free", 320, p)
                .with_field("tp_bases", 336, p),
        );
        set.insert(StructLayout::new("PyCFunctionObject", 56).with_field("m_ml", 16, p));
        set.insert(
            StructLayout::new("PyMethodDef", 32)
                .with_field("ml_name", 0, p)
                .with_field("ml_meth", 8, p),
        );
        set.insert(StructLayout::new("PyGetSetDescrObject", 48).with_field("d_getset", 40, p));
        set.insert(
            StructLayout::new("PyGetSetDef", 40)
                .with_field("get", 8, p)
                .with_field("set", 16, p),
        );
        set.insert(StructLayout::new("PyFloatObject", 24).with_field("ob_fval", 16, 8));
        set.insert(
            StructLayout::new("PyComplexObject", 32)
                .with_field("cval_real", 16, 8)
                .with_field("cval_imag", 24, 8),
        );
        match version {
            RuntimeVersion::V310 | RuntimeVersion::V311 => {
                set.insert(
                    StructLayout::new("PyLongObject", 32)
                        .with_field("ob_size", 16, p)
                        .with_field("ob_digit", 24, 4),
                );
            }
            RuntimeVersion::V312 => {
                set.insert(
                    StructLayout::new("PyLongObject", 32)
                        .with_field("lv_tag", 16, p)
                        .with_field("ob_digit", 24, 4),
                );
            }
        }
        set.insert(
            StructLayout::new("PyBytesObject", 40)
                .with_field("ob_size", 16, p)
                .with_field("ob_shash", 24, p)
                .with_field("ob_sval", 32, 1),
        );
        // コンパクトASCII文字列のデータは構造体の直後に続く
        match version {
            RuntimeVersion::V310 | RuntimeVersion::V311 => {
                set.insert(
                    StructLayout::new("PyASCIIObject", 48)
                        .with_field("length", 16, p)
                        .with_field("hash", 24, p)
                        .with_field("state", 32, 4)
                        .with_field("wstr", 40, p),
                );
                set.insert(
                    StructLayout::new("PyCompactUnicodeObject", 72)
                        .with_field("utf8_length", 48, p)
                        .with_field("utf8", 56, p),
                );
            }
            RuntimeVersion::V312 => {
                set.insert(
                    StructLayout::new("PyASCIIObject", 40)
                        .with_field("length", 16, p)
                        .with_field("hash", 24, p)
                        .with_field("state", 32, 4),
                );
                set.insert(
                    StructLayout::new("PyCompactUnicodeObject", 56)
                        .with_field("utf8_length", 40, p)
                        .with_field("utf8", 48, p),
                );
            }
        }
        set.insert(
            StructLayout::new("PyTupleObject", 32)
                .with_field("ob_size", 16, p)
                .with_field("ob_item", 24, p),
        );
        set.insert(
            StructLayout::new("PyListObject", 40)
                .with_field("ob_size", 16, p)
                .with_field("ob_item", 24, p)
                .with_field("allocated", 32, p),
        );
        set.insert(
            StructLayout::new("PyDictObject", 48)
                .with_field("ma_used", 16, p)
                .with_field("ma_keys", 32, p)
                .with_field("ma_values", 40, p),
        );
        match version {
            RuntimeVersion::V310 => {
                set.insert(
                    StructLayout::new("PyDictKeysObject", 48)
                        .with_field("dk_size", 8, p)
                        .with_field("dk_usable", 24, p)
                        .with_field("dk_nentries", 32, p)
                        .with_field("dk_indices", 40, 1),
                );
            }
            RuntimeVersion::V311 | RuntimeVersion::V312 => {
                set.insert(
                    StructLayout::new("PyDictKeysObject", 40)
                        .with_field("dk_log2_size", 8, 1)
                        .with_field("dk_log2_index_bytes", 9, 1)
                        .with_field("dk_kind", 10, 1)
                        .with_field("dk_usable", 16, p)
                        .with_field("dk_nentries", 24, p)
                        .with_field("dk_indices", 32, 1),
                );
            }
        }
        match version {
            RuntimeVersion::V310 => {
                set.insert(
                    StructLayout::new("PyFrameObject", 368)
                        .with_field("f_back", 24, p)
                        .with_field("f_code", 32, p)
                        .with_field("f_builtins", 40, p)
                        .with_field("f_globals", 48, p)
                        .with_field("f_locals", 56, p)
                        .with_field("f_lasti", 112, 4)
                        .with_field("f_lineno", 116, 4)
                        .with_field("f_localsplus", 360, p),
                );
                set.insert(
                    StructLayout::new("PyCodeObject", 176)
                        .with_field("co_argcount", 16, 4)
                        .with_field("co_nlocals", 24, 4)
                        .with_field("co_flags", 32, 4)
                        .with_field("co_firstlineno", 40, 4)
                        .with_field("co_code", 48, p)
                        .with_field("co_consts", 56, p)
                        .with_field("co_names", 64, p)
                        .with_field("co_varnames", 72, p)
                        .with_field("co_filename", 104, p)
                        .with_field("co_name", 112, p)
                        .with_field("co_lnotab", 120, p),
                );
                set.insert(
                    StructLayout::new("PyThreadState", 232)
                        .with_field("prev", 0, p)
                        .with_field("next", 8, p)
                        .with_field("interp", 16, p)
                        .with_field("frame", 24, p)
                        .with_field("use_tracing", 104, 4)
                        .with_field("c_tracefunc", 128, p)
                        .with_field("c_traceobj", 136, p)
                        .with_field("thread_id", 176, p),
                );
            }
            RuntimeVersion::V311 | RuntimeVersion::V312 => {
                set.insert(
                    StructLayout::new("_PyInterpreterFrame", 72)
                        .with_field("f_func", 0, p)
                        .with_field("f_globals", 8, p)
                        .with_field("f_builtins", 16, p)
                        .with_field("f_locals", 24, p)
                        .with_field("f_code", 32, p)
                        .with_field("frame_obj", 40, p)
                        .with_field("previous", 48, p)
                        .with_field("prev_instr", 56, p)
                        .with_field("stacktop", 64, 4)
                        .with_field("owner", 70, 1)
                        .with_field("localsplus", 72, p),
                );
                set.insert(
                    StructLayout::new("PyFrameObject", 80)
                        .with_field("f_back", 24, p)
                        .with_field("f_frame", 32, p)
                        .with_field("f_lineno", 48, 4),
                );
                set.insert(
                    StructLayout::new("PyCodeObject", 192)
                        .with_field("co_consts", 24, p)
                        .with_field("co_names", 32, p)
                        .with_field("co_flags", 48, 4)
                        .with_field("co_argcount", 56, 4)
                        .with_field("co_nlocals", 68, 4)
                        .with_field("co_firstlineno", 72, 4)
                        .with_field("co_filename", 96, p)
                        .with_field("co_name", 104, p)
                        .with_field("co_qualname", 112, p)
                        .with_field("co_linetable", 120, p)
                        .with_field("co_localsplusnames", 128, p),
                );
                set.insert(
                    StructLayout::new("_PyCFrame", 24)
                        .with_field("use_tracing", 0, 1)
                        .with_field("current_frame", 8, p)
                        .with_field("previous", 16, p),
                );
                set.insert(
                    StructLayout::new("PyThreadState", 240)
                        .with_field("prev", 0, p)
                        .with_field("next", 8, p)
                        .with_field("interp", 16, p)
                        .with_field("cframe", 24, p)
                        .with_field("c_tracefunc", 128, p)
                        .with_field("c_traceobj", 136, p)
                        .with_field("thread_id", 176, p),
                );
            }
        }
        set.insert(
            StructLayout::new("PyBaseExceptionObject", 56)
                .with_field("dict", 16, p)
                .with_field("args", 24, p)
                .with_field("context", 40, p)
                .with_field("cause", 48, p),
        );

        set
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fallback_covers_core_structs() {
        for version in [
            RuntimeVersion::V310,
            RuntimeVersion::V311,
            RuntimeVersion::V312,
        ] {
            let set = LayoutSet::fallback(version);
            for name in [
                "PyObject",
                "PyTypeObject",
                "PyLongObject",
                "PyFloatObject",
                "PyASCIIObject",
                "PyTupleObject",
                "PyListObject",
                "PyDictObject",
                "PyCodeObject",
                "PyThreadState",
            ] {
                assert!(set.get(name).is_ok(), "{} missing for {}", name, version);
            }
        }
    }

    #[test]
    fn missing_field_names_struct_and_field() {
        let set = LayoutSet::fallback(RuntimeVersion::V311);
        let err = set.field("PyObject", "no_such_field").unwrap_err();
        assert!(matches!(err, ProxyError::MissingField { .. }));
    }

    #[test]
    fn frame_layout_follows_version() {
        let v310 = LayoutSet::fallback(RuntimeVersion::V310);
        assert!(v310.get("PyFrameObject").unwrap().has_field("f_localsplus"));
        let v311 = LayoutSet::fallback(RuntimeVersion::V311);
        assert!(v311.get("_PyInterpreterFrame").unwrap().has_field("previous"));
    }
}
