//! ソース位置トークン
//!
//! UIとコアの間で受け渡すソース位置の不透明トークンです。バイト列に
//! シリアライズでき、コアはこれをブレークポイント表のキーとして使います。

use crate::wire::Cursor;
use crate::{BusError, Result};

/// ネイティブコード上の位置
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeLocation {
    /// モジュールのパス
    pub module_path: String,
    /// モジュール先頭からの相対アドレス
    pub rva: u32,
    /// プロセス空間上の絶対アドレス
    pub instruction_pointer: u64,
}

/// インタープリタコード上のソース位置
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceLocation {
    /// ソースファイル名
    pub file_name: String,
    /// 1始まりの行番号
    pub line: i32,
    /// 関数名（分かる場合のみ）
    pub function_name: Option<String>,
    /// 対応するネイティブ位置（混在ブレークポイントの場合のみ）
    pub native: Option<NativeLocation>,
}

impl SourceLocation {
    /// ファイルと行だけの位置を作る
    pub fn new(file_name: &str, line: i32) -> Self {
        Self {
            file_name: file_name.to_string(),
            line,
            function_name: None,
            native: None,
        }
    }

    /// バイト列にシリアライズする
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        write_string(&mut out, &self.file_name);
        out.extend_from_slice(&self.line.to_le_bytes());
        match &self.function_name {
            Some(name) => {
                out.push(1);
                write_string(&mut out, name);
            }
            None => out.push(0),
        }
        match &self.native {
            Some(native) => {
                out.push(1);
                write_string(&mut out, &native.module_path);
                out.extend_from_slice(&native.rva.to_le_bytes());
                out.extend_from_slice(&native.instruction_pointer.to_le_bytes());
            }
            None => out.push(0),
        }
        out
    }

    /// バイト列から復元する
    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut r = Cursor::new(0, data);
        let file_name = read_string(&mut r)?;
        let line = r.i32()?;
        let function_name = if r.u8()? != 0 {
            Some(read_string(&mut r)?)
        } else {
            None
        };
        let native = if r.u8()? != 0 {
            Some(NativeLocation {
                module_path: read_string(&mut r)?,
                rva: r.u32()?,
                instruction_pointer: r.u64()?,
            })
        } else {
            None
        };
        Ok(Self {
            file_name,
            line,
            function_name,
            native,
        })
    }
}

impl std::fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.file_name, self.line)
    }
}

fn write_string(out: &mut Vec<u8>, s: &str) {
    out.extend_from_slice(&(s.len() as u32).to_le_bytes());
    out.extend_from_slice(s.as_bytes());
}

fn read_string(r: &mut Cursor<'_>) -> Result<String> {
    let len = r.u32()? as usize;
    let bytes = r.bytes(len)?;
    String::from_utf8(bytes.to_vec()).map_err(|_| BusError::BadString(0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_with_optional_parts() {
        let bare = SourceLocation::new("a.py", 10);
        assert_eq!(SourceLocation::decode(&bare.encode()).unwrap(), bare);

        let full = SourceLocation {
            file_name: "pkg/mod.py".to_string(),
            line: 77,
            function_name: Some("handler".to_string()),
            native: Some(NativeLocation {
                module_path: "/usr/lib/libfoo.so".to_string(),
                rva: 0x1234,
                instruction_pointer: 0x7f3a_0000_1234,
            }),
        };
        assert_eq!(SourceLocation::decode(&full.encode()).unwrap(), full);
        let decoded = SourceLocation::decode(&full.encode()).unwrap();
        let native = decoded.native.unwrap();
        assert_eq!(native.instruction_pointer, 0x7f3a_0000_1234);
    }

    #[test]
    fn truncated_token_is_rejected() {
        let encoded = SourceLocation::new("main.py", 5).encode();
        assert!(SourceLocation::decode(&encoded[..3]).is_err());
    }
}
