//! 文字列型のプロキシ（str / bytes）

use crate::structs::object::PyObject;
use crate::{ProxyError, Result};
use tsubaki_target::TargetAccessExt;

/// 一度に読み取る文字数の上限
const MAX_CHARS: u64 = 64 * 1024;

/// stateフィールドのビット配置
/// interned: bits 0-1, kind: bits 2-4, compact: bit 5, ascii: bit 6
fn state_kind(state: u32) -> u32 {
    (state >> 2) & 0x7
}

fn state_compact(state: u32) -> bool {
    (state >> 5) & 1 != 0
}

fn state_ascii(state: u32) -> bool {
    (state >> 6) & 1 != 0
}

/// `PyUnicodeObject`（コンパクト形式）へのプロキシ
#[derive(Clone, Debug)]
pub struct PyStr {
    object: PyObject,
}

impl PyStr {
    pub fn bind(object: PyObject) -> Self {
        Self { object }
    }

    /// 文字数を読む
    pub fn char_length(&self) -> Result<i64> {
        self.object
            .ctx()
            .read_field_i64(self.object.address(), "PyASCIIObject", "length")
    }

    /// 文字列の内容を読む
    ///
    /// コンパクト形式（ASCII / 1・2・4バイトkind）のみサポートします。
    /// レガシー形式はインタプリタ内部でもほぼ使われないため
    /// `Malformed`として扱います。
    pub fn value(&self) -> Result<String> {
        let ctx = self.object.ctx();
        let addr = self.object.address();

        let length = self.char_length()?;
        if length < 0 || length as u64 > MAX_CHARS {
            return Err(ProxyError::Malformed {
                what: "str object",
                detail: format!("implausible length {}", length),
            });
        }
        let state_field = ctx.layouts.field("PyASCIIObject", "state")?;
        let state = ctx.target.read_typed::<u32>(addr + state_field.offset)?;

        if !state_compact(state) {
            return Err(ProxyError::Malformed {
                what: "str object",
                detail: "legacy (non-compact) representation".to_string(),
            });
        }

        // コンパクト形式のデータはヘッダ構造体の直後に続く
        let header = if state_ascii(state) {
            ctx.layouts.get("PyASCIIObject")?.size()
        } else {
            ctx.layouts.get("PyCompactUnicodeObject")?.size()
        };
        let data = addr + header;
        let length = length as usize;

        match state_kind(state) {
            1 => {
                let bytes = ctx.target.read_bytes(data, length)?;
                // 1バイトkindはLatin-1
                Ok(bytes.iter().map(|&b| b as char).collect())
            }
            2 => {
                let bytes = ctx.target.read_bytes(data, length * 2)?;
                let units: Vec<u16> = bytes
                    .chunks_exact(2)
                    .map(|c| u16::from_le_bytes([c[0], c[1]]))
                    .collect();
                Ok(String::from_utf16_lossy(&units))
            }
            4 => {
                let bytes = ctx.target.read_bytes(data, length * 4)?;
                Ok(bytes
                    .chunks_exact(4)
                    .map(|c| {
                        let cp = u32::from_le_bytes([c[0], c[1], c[2], c[3]]);
                        char::from_u32(cp).unwrap_or(char::REPLACEMENT_CHARACTER)
                    })
                    .collect())
            }
            kind => Err(ProxyError::Malformed {
                what: "str object",
                detail: format!("unknown kind {}", kind),
            }),
        }
    }
}

/// `PyBytesObject`へのプロキシ
#[derive(Clone, Debug)]
pub struct PyBytes {
    object: PyObject,
}

impl PyBytes {
    pub fn bind(object: PyObject) -> Self {
        Self { object }
    }

    /// バイト列の内容を読む
    pub fn value(&self) -> Result<Vec<u8>> {
        let ctx = self.object.ctx();
        let addr = self.object.address();
        let size = ctx.read_field_i64(addr, "PyBytesObject", "ob_size")?;
        if size < 0 || size as u64 > MAX_CHARS {
            return Err(ProxyError::Malformed {
                what: "bytes object",
                detail: format!("implausible length {}", size),
            });
        }
        let sval = ctx.layouts.field("PyBytesObject", "ob_sval")?;
        Ok(ctx.target.read_bytes(addr + sval.offset, size as usize)?)
    }
}
