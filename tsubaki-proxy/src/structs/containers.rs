//! コンテナ型のプロキシ（tuple / list / dict）

use crate::structs::object::PyObject;
use crate::{ProxyError, Result, RuntimeVersion};
use tsubaki_target::TargetAccessExt;

/// 要素数として受け入れる上限
const MAX_ELEMENTS_READ: i64 = 1 << 20;

fn check_size(what: &'static str, size: i64) -> Result<usize> {
    if !(0..=MAX_ELEMENTS_READ).contains(&size) {
        return Err(ProxyError::Malformed {
            what,
            detail: format!("implausible element count {}", size),
        });
    }
    Ok(size as usize)
}

/// `PyTupleObject`へのプロキシ
///
/// 要素ポインタ配列は構造体内に直接続きます。
#[derive(Clone, Debug)]
pub struct PyTuple {
    object: PyObject,
}

impl PyTuple {
    pub fn bind(object: PyObject) -> Self {
        Self { object }
    }

    /// 基底の`PyObject`
    pub fn as_object(&self) -> &PyObject {
        &self.object
    }

    /// 要素数を読む
    pub fn len(&self) -> Result<usize> {
        let size = self
            .object
            .ctx()
            .read_field_i64(self.object.address(), "PyTupleObject", "ob_size")?;
        check_size("tuple object", size)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// i番目の要素を読む（NULLスロットはNone）
    pub fn item(&self, index: usize) -> Result<Option<PyObject>> {
        let ctx = self.object.ctx();
        let items = ctx.layouts.field("PyTupleObject", "ob_item")?;
        let slot = self.object.address() + items.offset + (index as u64) * 8;
        let ptr = ctx.target.read_pointer(slot)?;
        if ptr == 0 {
            return Ok(None);
        }
        Ok(Some(PyObject::new(ctx.clone(), ptr)?))
    }

    /// 全要素を読む
    pub fn items(&self) -> Result<Vec<Option<PyObject>>> {
        (0..self.len()?).map(|i| self.item(i)).collect()
    }
}

/// `PyListObject`へのプロキシ
///
/// tupleと違い、要素配列は別アロケーションを指すポインタです。
#[derive(Clone, Debug)]
pub struct PyList {
    object: PyObject,
}

impl PyList {
    pub fn bind(object: PyObject) -> Self {
        Self { object }
    }

    /// 要素数を読む
    pub fn len(&self) -> Result<usize> {
        let size = self
            .object
            .ctx()
            .read_field_i64(self.object.address(), "PyListObject", "ob_size")?;
        check_size("list object", size)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// i番目の要素を読む
    pub fn item(&self, index: usize) -> Result<Option<PyObject>> {
        let ctx = self.object.ctx();
        let base = ctx.read_field_ptr(self.object.address(), "PyListObject", "ob_item")?;
        if base == 0 {
            return Err(ProxyError::NullPointer { what: "list ob_item" });
        }
        let ptr = ctx.target.read_pointer(base + (index as u64) * 8)?;
        if ptr == 0 {
            return Ok(None);
        }
        Ok(Some(PyObject::new(ctx.clone(), ptr)?))
    }

    /// 全要素を読む
    pub fn items(&self) -> Result<Vec<Option<PyObject>>> {
        (0..self.len()?).map(|i| self.item(i)).collect()
    }
}

/// `PyDictObject`へのプロキシ
#[derive(Clone, Debug)]
pub struct PyDict {
    object: PyObject,
}

impl PyDict {
    pub fn bind(object: PyObject) -> Self {
        Self { object }
    }

    /// 登録済みエントリ数（`ma_used`）を読む
    pub fn len(&self) -> Result<usize> {
        let used = self
            .object
            .ctx()
            .read_field_i64(self.object.address(), "PyDictObject", "ma_used")?;
        check_size("dict object", used)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// 全エントリを (キー, 値) で読む
    ///
    /// 結合テーブルと分割テーブル（`ma_values`あり）の両方に対応します。
    /// 削除済みスロット（キーNULL）は飛ばします。
    pub fn entries(&self) -> Result<Vec<(PyObject, PyObject)>> {
        let ctx = self.object.ctx();
        let addr = self.object.address();
        let keys_addr = ctx.read_field_ptr(addr, "PyDictObject", "ma_keys")?;
        if keys_addr == 0 {
            return Err(ProxyError::NullPointer { what: "ma_keys" });
        }
        let values_addr = ctx.read_field_ptr(addr, "PyDictObject", "ma_values")?;

        let nentries = ctx.read_field_i64(keys_addr, "PyDictKeysObject", "dk_nentries")?;
        let nentries = check_size("dict keys", nentries)?;
        let indices = ctx.layouts.field("PyDictKeysObject", "dk_indices")?;

        // バージョンで異なる: インデックス配列の長さとエントリの形
        let (entry_base, entry_stride, key_off, value_off) = match ctx.version {
            RuntimeVersion::V310 => {
                let dk_size = ctx.read_field_i64(keys_addr, "PyDictKeysObject", "dk_size")?;
                let dk_size = check_size("dict keys", dk_size)? as u64;
                let index_bytes = dk_size * index_entry_size(dk_size);
                // PyDictKeyEntry { me_hash, me_key, me_value }
                (keys_addr + indices.offset + index_bytes, 24u64, 8u64, 16u64)
            }
            RuntimeVersion::V311 | RuntimeVersion::V312 => {
                let log2_bytes =
                    ctx.read_field_i64(keys_addr, "PyDictKeysObject", "dk_log2_index_bytes")? as u32;
                let kind = ctx.read_field_i64(keys_addr, "PyDictKeysObject", "dk_kind")? as u8;
                let index_bytes = 1u64 << log2_bytes.min(48);
                let base = keys_addr + indices.offset + index_bytes;
                if kind == 0 {
                    // 一般キー: PyDictKeyEntry { me_hash, me_key, me_value }
                    (base, 24, 8, 16)
                } else {
                    // unicodeキー: PyDictUnicodeEntry { me_key, me_value }
                    (base, 16, 0, 8)
                }
            }
        };

        let split = values_addr != 0;
        let mut out = Vec::new();
        for i in 0..nentries as u64 {
            let entry = entry_base + i * entry_stride;
            let key_ptr = ctx.target.read_pointer(entry + key_off)?;
            if key_ptr == 0 {
                continue;
            }
            let value_ptr = if split {
                ctx.target.read_pointer(values_addr + i * 8)?
            } else {
                ctx.target.read_pointer(entry + value_off)?
            };
            if value_ptr == 0 {
                continue;
            }
            out.push((
                PyObject::new(ctx.clone(), key_ptr)?,
                PyObject::new(ctx.clone(), value_ptr)?,
            ));
        }
        Ok(out)
    }
}

/// 3.10のインデックスエントリ幅はテーブルサイズで変わる
fn index_entry_size(dk_size: u64) -> u64 {
    match dk_size {
        0..=0xff => 1,
        0x100..=0xffff => 2,
        0x10000..=0xffff_ffff => 4,
        _ => 8,
    }
}
